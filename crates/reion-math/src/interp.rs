//! Regular-grid interpolation tables.
//!
//! Tables are values: built once from the post-filter field extrema, used
//! read-only inside a parallel region, dropped at the end of the
//! iteration. Out-of-range queries are a caller error surfaced as
//! `TableEvaluation`; the hot loops pre-check with `in_bounds` and record
//! a flag instead of unwinding inside the parallel region.

use ndarray::Array2;
use reion_types::error::{ReionError, ReionResult};

/// Linear interpolation on a uniformly spaced 1D grid.
#[derive(Debug, Clone)]
pub struct RgTable1D {
    pub label: &'static str,
    pub x_min: f64,
    pub x_width: f64,
    pub y: Vec<f64>,
}

impl RgTable1D {
    /// Tabulate `f` on `n_bin` points spanning [x_min, x_max].
    pub fn build<F: Fn(f64) -> f64>(
        label: &'static str,
        x_min: f64,
        x_max: f64,
        n_bin: usize,
        f: F,
    ) -> Self {
        debug_assert!(n_bin >= 2 && x_max > x_min);
        let x_width = (x_max - x_min) / (n_bin - 1) as f64;
        let y = (0..n_bin).map(|i| f(x_min + x_width * i as f64)).collect();
        RgTable1D {
            label,
            x_min,
            x_width,
            y,
        }
    }

    pub fn x_max(&self) -> f64 {
        self.x_min + self.x_width * (self.y.len() - 1) as f64
    }

    #[inline]
    pub fn in_bounds(&self, x: f64) -> bool {
        x >= self.x_min && x <= self.x_max()
    }

    /// Linear interpolation; caller guarantees `in_bounds(x)`.
    #[inline]
    pub fn eval(&self, x: f64) -> f64 {
        let f = (x - self.x_min) / self.x_width;
        let idx = (f.floor() as usize).min(self.y.len() - 2);
        let t = f - idx as f64;
        self.y[idx] * (1.0 - t) + self.y[idx + 1] * t
    }

    /// Bounds-checked evaluation for cold paths.
    pub fn eval_checked(&self, x: f64) -> ReionResult<f64> {
        if !self.in_bounds(x) {
            return Err(ReionError::TableEvaluation {
                table: self.label,
                value: x,
                lo: self.x_min,
                hi: self.x_max(),
            });
        }
        Ok(self.eval(x))
    }

    /// Validate every entry is finite; builders call this before use.
    pub fn validate(&self) -> ReionResult<()> {
        if self.y.iter().any(|v| !v.is_finite()) {
            return Err(ReionError::TableGeneration(self.label.to_string()));
        }
        Ok(())
    }
}

/// Bilinear interpolation on a uniformly spaced 2D grid.
#[derive(Debug, Clone)]
pub struct RgTable2D {
    pub label: &'static str,
    pub x_min: f64,
    pub x_width: f64,
    pub y_min: f64,
    pub y_width: f64,
    pub z: Array2<f64>,
}

impl RgTable2D {
    pub fn build<F: Fn(f64, f64) -> f64>(
        label: &'static str,
        x_range: (f64, f64),
        y_range: (f64, f64),
        n_x: usize,
        n_y: usize,
        f: F,
    ) -> Self {
        debug_assert!(n_x >= 2 && n_y >= 2);
        debug_assert!(x_range.1 > x_range.0 && y_range.1 > y_range.0);
        let x_width = (x_range.1 - x_range.0) / (n_x - 1) as f64;
        let y_width = (y_range.1 - y_range.0) / (n_y - 1) as f64;
        let z = Array2::from_shape_fn((n_x, n_y), |(i, j)| {
            f(x_range.0 + x_width * i as f64, y_range.0 + y_width * j as f64)
        });
        RgTable2D {
            label,
            x_min: x_range.0,
            x_width,
            y_min: y_range.0,
            y_width,
            z,
        }
    }

    pub fn x_max(&self) -> f64 {
        self.x_min + self.x_width * (self.z.nrows() - 1) as f64
    }

    pub fn y_max(&self) -> f64 {
        self.y_min + self.y_width * (self.z.ncols() - 1) as f64
    }

    #[inline]
    pub fn in_bounds(&self, x: f64, y: f64) -> bool {
        x >= self.x_min && x <= self.x_max() && y >= self.y_min && y <= self.y_max()
    }

    /// Bilinear interpolation; caller guarantees `in_bounds(x, y)`.
    #[inline]
    pub fn eval(&self, x: f64, y: f64) -> f64 {
        let fx = (x - self.x_min) / self.x_width;
        let fy = (y - self.y_min) / self.y_width;
        let ix = (fx.floor() as usize).min(self.z.nrows() - 2);
        let iy = (fy.floor() as usize).min(self.z.ncols() - 2);
        let tx = fx - ix as f64;
        let ty = fy - iy as f64;

        let left = self.z[[ix, iy]] * (1.0 - ty) + self.z[[ix, iy + 1]] * ty;
        let right = self.z[[ix + 1, iy]] * (1.0 - ty) + self.z[[ix + 1, iy + 1]] * ty;
        left * (1.0 - tx) + right * tx
    }

    pub fn eval_checked(&self, x: f64, y: f64) -> ReionResult<f64> {
        if !self.in_bounds(x, y) {
            let (value, lo, hi) = if x < self.x_min || x > self.x_max() {
                (x, self.x_min, self.x_max())
            } else {
                (y, self.y_min, self.y_max())
            };
            return Err(ReionError::TableEvaluation {
                table: self.label,
                value,
                lo,
                hi,
            });
        }
        Ok(self.eval(x, y))
    }

    pub fn validate(&self) -> ReionResult<()> {
        if self.z.iter().any(|v| !v.is_finite()) {
            return Err(ReionError::TableGeneration(self.label.to_string()));
        }
        Ok(())
    }
}
