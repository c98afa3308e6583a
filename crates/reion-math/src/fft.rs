//! 3D FFT wrappers around rustfft, packaged as an owned `KGrid`.
//!
//! Normalisation contract (spec of the grid substrate): the forward
//! transform divides by the total cell count, the inverse applies no
//! scaling, so `inverse(forward(x)) = x` to floating precision and the
//! zero mode of the forward transform is the box mean.
//!
//! The k-grid owns the full complex cube; real-space views are only ever
//! produced by `inverse()`, never by punning into the complex storage.

use ndarray::{Array3, Axis};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// A k-space lattice tied to its physical box dimensions.
#[derive(Debug, Clone)]
pub struct KGrid {
    data: Array3<Complex64>,
    pub n: usize,
    pub nz: usize,
    /// Comoving box side along the cubic axes (Mpc).
    pub box_len: f64,
    /// Comoving box length along the z axis (Mpc).
    pub box_len_z: f64,
}

fn transform_axis(data: &mut Array3<Complex64>, axis: usize, fft: &Arc<dyn Fft<f64>>) {
    let len = data.shape()[axis];
    let mut buf = vec![Complex64::new(0.0, 0.0); len];
    for mut lane in data.lanes_mut(Axis(axis)) {
        for (b, v) in buf.iter_mut().zip(lane.iter()) {
            *b = *v;
        }
        fft.process(&mut buf);
        for (v, b) in lane.iter_mut().zip(buf.iter()) {
            *v = *b;
        }
    }
}

impl KGrid {
    /// Forward transform of a real lattice. Divides by the cell count.
    pub fn forward(real: &Array3<f64>, box_len: f64, box_len_z: f64) -> Self {
        let (n0, n1, n2) = real.dim();
        debug_assert_eq!(n0, n1, "lattice must be cubic in x/y");
        let mut data = real.mapv(|v| Complex64::new(v, 0.0));

        let mut planner = FftPlanner::new();
        let fft_xy = planner.plan_fft_forward(n0);
        let fft_z = planner.plan_fft_forward(n2);
        transform_axis(&mut data, 0, &fft_xy);
        transform_axis(&mut data, 1, &fft_xy);
        transform_axis(&mut data, 2, &fft_z);

        let norm = 1.0 / (n0 * n1 * n2) as f64;
        data.mapv_inplace(|c| c * norm);

        KGrid {
            data,
            n: n0,
            nz: n2,
            box_len,
            box_len_z,
        }
    }

    /// Inverse transform back to a real lattice. No extra scaling.
    pub fn inverse(&self) -> Array3<f64> {
        let mut data = self.data.clone();
        let mut planner = FftPlanner::new();
        let ifft_xy = planner.plan_fft_inverse(self.n);
        let ifft_z = planner.plan_fft_inverse(self.nz);
        transform_axis(&mut data, 0, &ifft_xy);
        transform_axis(&mut data, 1, &ifft_xy);
        transform_axis(&mut data, 2, &ifft_z);
        data.mapv(|c| c.re)
    }

    /// Mode-by-mode multiply by a kernel of the k-vector magnitude.
    ///
    /// `kernel` receives |k| in 1/Mpc.
    pub fn apply_kernel<F: Fn(f64) -> f64>(&mut self, kernel: F) {
        let kx = wavenumbers(self.n, self.box_len);
        let kz = wavenumbers(self.nz, self.box_len_z);
        for ((i, j, k), v) in self.data.indexed_iter_mut() {
            let kmag = (kx[i] * kx[i] + kx[j] * kx[j] + kz[k] * kz[k]).sqrt();
            *v *= kernel(kmag);
        }
    }

    /// The zero mode, i.e. the box mean of the real field.
    pub fn mean(&self) -> f64 {
        self.data[[0, 0, 0]].re
    }
}

/// Wrapped wavenumbers 2*pi*m/L with m in [-N/2, N/2).
pub fn wavenumbers(n: usize, l: f64) -> Vec<f64> {
    let dk = 2.0 * std::f64::consts::PI / l;
    (0..n)
        .map(|i| {
            let m = if i <= n / 2 {
                i as isize
            } else {
                i as isize - n as isize
            };
            dk * m as f64
        })
        .collect()
}

/// Clip a real lattice in place and return the post-clip extrema.
pub fn clip_and_extrema(grid: &mut Array3<f64>, lo: f64, hi: f64) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in grid.iter_mut() {
        *v = v.clamp(lo, hi);
        if *v < min {
            min = *v;
        }
        if *v > max {
            max = *v;
        }
    }
    (min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fft3_roundtrip() {
        let original = Array3::from_shape_fn((8, 8, 8), |(i, j, k)| {
            ((i * 64 + j * 8 + k) as f64).sin() + 0.3
        });
        let kg = KGrid::forward(&original, 16.0, 16.0);
        let recovered = kg.inverse();

        for ((i, j, k), &val) in original.indexed_iter() {
            assert!(
                (recovered[[i, j, k]] - val).abs() < 1e-10,
                "FFT roundtrip failed at ({i},{j},{k}): {} vs {val}",
                recovered[[i, j, k]]
            );
        }
    }

    #[test]
    fn test_fft3_zero_mode_is_mean() {
        let n = 8;
        let field = Array3::from_shape_fn((n, n, n), |(i, _, _)| i as f64);
        let mean = field.iter().sum::<f64>() / field.len() as f64;
        let kg = KGrid::forward(&field, 10.0, 10.0);
        assert!(
            (kg.mean() - mean).abs() < 1e-10,
            "zero mode {} vs mean {mean}",
            kg.mean()
        );
    }

    #[test]
    fn test_fft3_non_cubic() {
        let original = Array3::from_shape_fn((4, 4, 6), |(i, j, k)| (i + 2 * j + 3 * k) as f64);
        let kg = KGrid::forward(&original, 8.0, 12.0);
        let recovered = kg.inverse();
        for ((i, j, k), &val) in original.indexed_iter() {
            assert!((recovered[[i, j, k]] - val).abs() < 1e-10);
        }
    }

    #[test]
    fn test_unit_kernel_is_identity() {
        let original = Array3::from_shape_fn((6, 6, 6), |(i, j, k)| (i * j + k) as f64);
        let mut kg = KGrid::forward(&original, 10.0, 10.0);
        kg.apply_kernel(|_| 1.0);
        let recovered = kg.inverse();
        for (&a, &b) in original.iter().zip(recovered.iter()) {
            assert!((a - b).abs() < 1e-10);
        }
    }

    #[test]
    fn test_wavenumbers_layout() {
        let k = wavenumbers(8, 2.0 * std::f64::consts::PI);
        assert!((k[0] - 0.0).abs() < 1e-12);
        assert!((k[1] - 1.0).abs() < 1e-12);
        assert!((k[4] - 4.0).abs() < 1e-12);
        assert!((k[7] + 1.0).abs() < 1e-12, "negative frequencies wrap");
    }

    #[test]
    fn test_clip_and_extrema() {
        let mut g = Array3::from_shape_fn((4, 4, 4), |(i, _, _)| i as f64 - 2.0);
        let (lo, hi) = clip_and_extrema(&mut g, -1.0, 0.5);
        assert!((lo + 1.0).abs() < 1e-12);
        assert!((hi - 0.5).abs() < 1e-12);
        assert!(g.iter().all(|&v| (-1.0..=0.5).contains(&v)));
    }
}
