//! k-space smoothing kernels for the excursion-set and shell integrals.
//!
//! Filters multiply each mode of a `KGrid` by a kernel of |k|. Radii at or
//! below the cell scale are no-ops at the call sites; the kernels here are
//! defined for any positive radius.

use reion_types::config::FilterKind;

use crate::fft::KGrid;

/// Real-space spherical tophat window in k-space.
#[inline]
pub fn tophat_window(kr: f64) -> f64 {
    if kr < 1e-4 {
        1.0
    } else {
        3.0 * (kr.sin() - kr * kr.cos()) / (kr * kr * kr)
    }
}

/// Effective Gaussian radius matching the tophat mass (0.643 R).
const GAUSSIAN_R_FACTOR: f64 = 0.643;

/// Apply one of the closed filter set at radius `r` (Mpc).
///
/// `mfp` is only read by the exponential kernel, as the attenuation scale.
pub fn filter_kgrid(kg: &mut KGrid, kind: FilterKind, r: f64, mfp: f64) {
    match kind {
        FilterKind::TophatReal => kg.apply_kernel(|k| tophat_window(k * r)),
        FilterKind::TophatK => kg.apply_kernel(|k| if k * r > 1.0 { 0.0 } else { 1.0 }),
        FilterKind::Gaussian => kg.apply_kernel(|k| {
            let kr = k * r * GAUSSIAN_R_FACTOR;
            (-0.5 * kr * kr).exp()
        }),
        FilterKind::Exponential => kg.apply_kernel(|k| {
            // Tophat aperture attenuated by the transform of exp(-r/mfp):
            // a Lorentzian squared in k.
            let damp = 1.0 + (k * mfp) * (k * mfp);
            tophat_window(k * r) / (damp * damp)
        }),
    }
}

/// Spherical-annulus filter between `r_inner` and `r_outer` (Mpc).
///
/// Volume-weighted difference of two real tophats; used by the
/// spin-temperature engine to isolate one shell's contribution.
pub fn filter_annulus(kg: &mut KGrid, r_inner: f64, r_outer: f64) {
    debug_assert!(r_outer > r_inner && r_inner >= 0.0);
    let v_in = r_inner * r_inner * r_inner;
    let v_out = r_outer * r_outer * r_outer;
    let dv = v_out - v_in;
    kg.apply_kernel(|k| {
        let w_out = tophat_window(k * r_outer);
        let w_in = if r_inner > 0.0 {
            tophat_window(k * r_inner)
        } else {
            1.0
        };
        (v_out * w_out - v_in * w_in) / dv
    });
}
