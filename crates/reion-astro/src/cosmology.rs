// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Cosmology
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Flat-LCDM background kernels and the sigma(M) table.
//!
//! The mass variance uses a BBKS transfer function integrated with a
//! top-hat window and normalised to sigma8; the result is cached on a
//! log-mass table at construction so the mass-function integrals stay
//! cheap.

use reion_math::interp::RgTable1D;
use reion_types::config::CosmoParams;
use reion_types::constants::*;

/// H0 for h = 1 (1/s)
const H0_OVER_H: f64 = 3.2407792903e-18;

/// Mass range covered by the internal sigma table (Msun)
const SIGMA_TABLE_LNM_MIN: f64 = 9.2103403719; // ln(1e4)
const SIGMA_TABLE_LNM_MAX: f64 = 41.4465316739; // ln(1e18)
const SIGMA_TABLE_POINTS: usize = 350;

/// Background cosmology with precomputed derived quantities.
#[derive(Debug, Clone)]
pub struct Cosmology {
    pub params: CosmoParams,
    /// Critical density today (Msun/Mpc^3).
    pub rho_crit: f64,
    /// Mean matter density today (Msun/Mpc^3).
    pub rho_m: f64,
    /// Hydrogen number density today (1/cm^3).
    pub n_h0: f64,
    /// Helium number density today (1/cm^3).
    pub n_he0: f64,
    /// Baryon number density today (1/cm^3).
    pub n_b0: f64,
    /// Hydrogen fraction by number.
    pub f_h: f64,
    /// Helium fraction by number.
    pub f_he: f64,
    sigma_table: RgTable1D,
    dsigmasq_dlnm_table: RgTable1D,
}

impl Cosmology {
    pub fn new(params: &CosmoParams) -> Self {
        let h2 = params.hlittle * params.hlittle;
        let rho_crit = RHO_CRIT_MSUN_MPC3 * h2;
        let rho_m = rho_crit * params.omm;

        let n_h0 = RHO_CRIT_CGS * h2 * params.omb * (1.0 - params.y_he) / M_PROTON;
        let n_he0 = RHO_CRIT_CGS * h2 * params.omb * params.y_he / (4.0 * M_PROTON);
        let n_b0 = n_h0 + n_he0;

        // Unnormalised variance at R8, then scale everything to sigma8.
        let r8 = 8.0 / params.hlittle;
        let raw_s8 = sigma_sq_raw(params, r8).sqrt();
        let norm = params.sigma8 / raw_s8;

        let sigma_table = RgTable1D::build(
            "sigma(lnM)",
            SIGMA_TABLE_LNM_MIN,
            SIGMA_TABLE_LNM_MAX,
            SIGMA_TABLE_POINTS,
            |lnm| {
                let m = lnm.exp();
                let r = (3.0 * m / (4.0 * std::f64::consts::PI * rho_m)).cbrt();
                norm * sigma_sq_raw(params, r).sqrt()
            },
        );

        // d(sigma^2)/dlnM by central differences of the table nodes.
        let dlnm = sigma_table.x_width;
        let sigmas: Vec<f64> = sigma_table.y.clone();
        let dsig: Vec<f64> = (0..sigmas.len())
            .map(|i| {
                let lo = if i == 0 { 0 } else { i - 1 };
                let hi = if i + 1 == sigmas.len() { i } else { i + 1 };
                let span = (hi - lo) as f64 * dlnm;
                (sigmas[hi] * sigmas[hi] - sigmas[lo] * sigmas[lo]) / span
            })
            .collect();
        let dsigmasq_dlnm_table = RgTable1D {
            label: "dsigma2_dlnM",
            x_min: sigma_table.x_min,
            x_width: sigma_table.x_width,
            y: dsig,
        };

        Cosmology {
            params: params.clone(),
            rho_crit,
            rho_m,
            n_h0,
            n_he0,
            n_b0,
            f_h: n_h0 / n_b0,
            f_he: n_he0 / n_b0,
            sigma_table,
            dsigmasq_dlnm_table,
        }
    }

    /// Hubble rate (1/s).
    pub fn hubble(&self, z: f64) -> f64 {
        let p = &self.params;
        let zp1 = 1.0 + z;
        p.hlittle * H0_OVER_H * (p.omm * zp1.powi(3) + p.oml).sqrt()
    }

    /// Hubble time 1/H (s).
    pub fn t_hubble(&self, z: f64) -> f64 {
        1.0 / self.hubble(z)
    }

    /// |dt/dz| (s).
    pub fn dtdz(&self, z: f64) -> f64 {
        1.0 / ((1.0 + z) * self.hubble(z))
    }

    /// Comoving distance per unit redshift (cm).
    pub fn drdz(&self, z: f64) -> f64 {
        C_CGS / self.hubble(z)
    }

    pub fn omega_m_z(&self, z: f64) -> f64 {
        let p = &self.params;
        let zp1 = 1.0 + z;
        p.omm * zp1.powi(3) / (p.omm * zp1.powi(3) + p.oml)
    }

    /// Linear growth factor, Carroll-Press-Turner fit, D(0) = 1.
    pub fn growth(&self, z: f64) -> f64 {
        self.growth_unnorm(z) / self.growth_unnorm(0.0)
    }

    fn growth_unnorm(&self, z: f64) -> f64 {
        let omz = self.omega_m_z(z);
        let olz = 1.0 - omz;
        let g = 2.5 * omz
            / (omz.powf(4.0 / 7.0) - olz + (1.0 + 0.5 * omz) * (1.0 + olz / 70.0));
        g / (1.0 + z)
    }

    /// dD/dz by central difference.
    pub fn dgrowth_dz(&self, z: f64) -> f64 {
        let dz = 1e-4 * (1.0 + z);
        (self.growth(z + dz) - self.growth(z - dz)) / (2.0 * dz)
    }

    /// Lagrangian mass inside a top-hat of radius R Mpc (Msun).
    pub fn rtom(&self, r: f64) -> f64 {
        4.0 / 3.0 * std::f64::consts::PI * r.powi(3) * self.rho_m
    }

    /// Top-hat radius enclosing mass M Msun (Mpc).
    pub fn mtor(&self, m: f64) -> f64 {
        (3.0 * m / (4.0 * std::f64::consts::PI * self.rho_m)).cbrt()
    }

    /// sigma(M) at z = 0.
    pub fn sigma(&self, m: f64) -> f64 {
        let lnm = m.ln().clamp(self.sigma_table.x_min, self.sigma_table.x_max());
        self.sigma_table.eval(lnm)
    }

    /// d sigma^2 / d lnM at z = 0 (negative).
    pub fn dsigmasq_dlnm(&self, m: f64) -> f64 {
        let lnm = m
            .ln()
            .clamp(self.dsigmasq_dlnm_table.x_min, self.dsigmasq_dlnm_table.x_max());
        self.dsigmasq_dlnm_table.eval(lnm)
    }

    /// Hydrogen number density at z (1/cm^3).
    pub fn n_h(&self, z: f64) -> f64 {
        self.n_h0 * (1.0 + z).powi(3)
    }

    /// Baryon number density at z (1/cm^3).
    pub fn n_b(&self, z: f64) -> f64 {
        self.n_b0 * (1.0 + z).powi(3)
    }
}

/// BBKS transfer function.
fn transfer_bbks(params: &CosmoParams, k: f64) -> f64 {
    // Sugiyama shape correction for baryons.
    let gamma = params.omm
        * params.hlittle
        * (-params.omb * (1.0 + (2.0 * params.hlittle).sqrt() / params.omm)).exp();
    let q = k / (gamma * params.hlittle);
    if q < 1e-8 {
        return 1.0;
    }
    let poly = 1.0
        + 3.89 * q
        + (16.1 * q).powi(2)
        + (5.46 * q).powi(3)
        + (6.71 * q).powi(4);
    (1.0 + 2.34 * q).ln() / (2.34 * q) * poly.powf(-0.25)
}

/// Unnormalised sigma^2(R): (1/2 pi^2) int k^2 P(k) W^2(kR) dk.
fn sigma_sq_raw(params: &CosmoParams, r: f64) -> f64 {
    let n_steps = 400;
    let lnk_min = (1e-4f64).ln();
    let lnk_max = (1e3f64 / r).max(10.0).ln();
    let dlnk = (lnk_max - lnk_min) / n_steps as f64;

    // Simpson in ln k.
    let mut sum = 0.0;
    for i in 0..=n_steps {
        let lnk = lnk_min + dlnk * i as f64;
        let k: f64 = lnk.exp();
        let t = transfer_bbks(params, k);
        let w = reion_math::filters::tophat_window(k * r);
        let integrand = k.powf(params.ns) * t * t * w * w * k * k * k; // extra k from dlnk
        let coeff = if i == 0 || i == n_steps {
            1.0
        } else if i % 2 == 1 {
            4.0
        } else {
            2.0
        };
        sum += coeff * integrand;
    }
    sum * dlnk / 3.0 / (2.0 * std::f64::consts::PI * std::f64::consts::PI)
}
