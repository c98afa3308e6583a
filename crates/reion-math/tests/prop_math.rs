// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Property-Based Tests (proptest) for reion-math
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Property-based tests for reion-math using proptest.
//!
//! Covers: FFT roundtrip and normalisation, filter mean preservation,
//! interpolation table exactness, erfc identities.

use ndarray::Array3;
use proptest::prelude::*;
use reion_math::fft::{clip_and_extrema, KGrid};
use reion_math::filters::{filter_annulus, filter_kgrid};
use reion_math::interp::RgTable1D;
use reion_math::special::erfc;
use reion_types::config::FilterKind;

// ── FFT Properties ───────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// inverse(forward(x)) = x to 1e-5 relative on arbitrary small fields.
    #[test]
    fn fft_roundtrip(seed in 0u64..1000, n in prop::sample::select(vec![4usize, 6, 8])) {
        let field = Array3::from_shape_fn((n, n, n), |(i, j, k)| {
            let t = (i * n * n + j * n + k) as f64 + seed as f64;
            (t * 0.618).sin() * 3.0 + 0.1
        });
        let kg = KGrid::forward(&field, 50.0, 50.0);
        let back = kg.inverse();
        let scale = field.iter().fold(1.0f64, |a, &b| a.max(b.abs()));
        for (&a, &b) in field.iter().zip(back.iter()) {
            prop_assert!((a - b).abs() / scale < 1e-5);
        }
    }

    /// Every filter kind preserves the box mean (unity at k=0).
    #[test]
    fn filters_preserve_mean(
        seed in 0u64..500,
        r in 1.0f64..10.0,
        kind_idx in 0usize..4,
    ) {
        let kind = [
            FilterKind::TophatReal,
            FilterKind::TophatK,
            FilterKind::Gaussian,
            FilterKind::Exponential,
        ][kind_idx];
        let n = 8;
        let field = Array3::from_shape_fn((n, n, n), |(i, j, k)| {
            ((i + 2 * j + 3 * k) as f64 * 0.37 + seed as f64).sin()
        });
        let mean0 = field.iter().sum::<f64>() / field.len() as f64;
        let mut kg = KGrid::forward(&field, 25.0, 25.0);
        filter_kgrid(&mut kg, kind, r, 15.0);
        let out = kg.inverse();
        let mean1 = out.iter().sum::<f64>() / out.len() as f64;
        prop_assert!((mean0 - mean1).abs() < 1e-9);
    }

    /// The annulus filter preserves the box mean for any valid shell.
    #[test]
    fn annulus_preserves_mean(r_in in 0.5f64..4.0, width in 0.5f64..6.0) {
        let n = 8;
        let field = Array3::from_shape_fn((n, n, n), |(i, j, k)| {
            ((i * j + k) as f64).cos()
        });
        let mean0 = field.iter().sum::<f64>() / field.len() as f64;
        let mut kg = KGrid::forward(&field, 30.0, 30.0);
        filter_annulus(&mut kg, r_in, r_in + width);
        let out = kg.inverse();
        let mean1 = out.iter().sum::<f64>() / out.len() as f64;
        prop_assert!((mean0 - mean1).abs() < 1e-9);
    }
}

// ── Clipping ─────────────────────────────────────────────────────────

proptest! {
    /// After clipping, the returned extrema bound every cell.
    #[test]
    fn clip_extrema_bound_grid(lo in -2.0f64..0.0, width in 0.1f64..4.0) {
        let hi = lo + width;
        let mut g = Array3::from_shape_fn((5, 5, 5), |(i, j, k)| {
            ((i + j + k) as f64 - 7.0) * 0.5
        });
        let (min, max) = clip_and_extrema(&mut g, lo, hi);
        prop_assert!(min >= lo - 1e-12 && max <= hi + 1e-12);
        for &v in g.iter() {
            prop_assert!(v >= min - 1e-12 && v <= max + 1e-12);
        }
    }
}

// ── Interpolation ────────────────────────────────────────────────────

proptest! {
    /// Linear functions are interpolated exactly inside the bounds.
    #[test]
    fn table_linear_exact(
        a in -5.0f64..5.0,
        b in -5.0f64..5.0,
        x in 0.0f64..1.0,
    ) {
        let t = RgTable1D::build("lin", 0.0, 1.0, 33, |x| a * x + b);
        let got = t.eval(x);
        let expect = a * x + b;
        prop_assert!((got - expect).abs() < 1e-10 * (1.0 + expect.abs()));
    }

    /// Out-of-bounds evaluation reports a TableEvaluation error.
    #[test]
    fn table_out_of_bounds_is_error(x in 1.0001f64..10.0) {
        let t = RgTable1D::build("bounds", 0.0, 1.0, 8, |x| x);
        prop_assert!(t.eval_checked(x).is_err());
        prop_assert!(t.eval_checked(-x).is_err());
    }
}

// ── Special Functions ────────────────────────────────────────────────

proptest! {
    /// erfc stays within [0, 2] and honours the reflection identity.
    #[test]
    fn erfc_range_and_reflection(x in -4.0f64..4.0) {
        let v = erfc(x);
        prop_assert!((0.0..=2.0).contains(&v));
        prop_assert!((erfc(-x) - (2.0 - v)).abs() < 1e-10);
    }
}
