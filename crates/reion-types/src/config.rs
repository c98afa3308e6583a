// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Config
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Snapshot-level parameter structs.
//!
//! Everything a snapshot computation needs travels in a `SimulationConfig`
//! value passed explicitly into the entry points; there is no process-wide
//! parameter state.

use serde::{Deserialize, Serialize};

use crate::error::{ReionError, ReionResult};

/// Smoothing kernels applied in k-space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    /// Sharp sphere in real space.
    TophatReal,
    /// Sharp cut in k-space.
    TophatK,
    /// Gaussian with effective radius 0.643 R.
    Gaussian,
    /// Real-space tophat attenuated by a finite mean free path.
    Exponential,
}

/// How ionised regions are painted once the criterion is met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BubbleAlgorithm {
    /// Flag every cell inside the sphere of radius R.
    Sphere,
    /// Flag only the central cell.
    Center,
}

/// Which photon-conservation remap is applied to the ionisation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotonConsType {
    None,
    /// Shift the effective redshift (consumes the upstream remap output).
    ZShift,
    /// Override alpha_esc with a redshift fit.
    AlphaEscFit,
    /// Override f_esc10 with a redshift fit.
    FEscFit,
}

/// Lattice size, memory strategy and determinism knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserParams {
    /// Cells per side of the cubic lattice.
    pub hii_dim: usize,
    /// Comoving box side (Mpc).
    pub box_len: f64,
    /// Line-of-sight stretch factor; N_z = ceil(non_cubic_factor * N).
    pub non_cubic_factor: f64,
    /// Filter the spin-temperature grids per shell instead of storing all shells.
    pub minimize_memory: bool,
    /// Replace every stochastic draw by its expectation.
    pub no_rng: bool,
    /// Combine CMF grids below the sampler mass with the halo catalogue above it.
    pub avg_below_sampler: bool,
    /// Mass above which the halo sampler is trusted (Msun).
    pub sampler_min_mass: f64,
    /// Number of spherical shells for the spin-temperature integrals.
    pub n_shells: usize,
    /// Largest X-ray/Lya shell radius (Mpc).
    pub r_xly_max: f64,
    /// Multiplicative step of the ionisation radius schedule.
    pub delta_r_hii_factor: f64,
    /// Redshift step factor used when no previous snapshot exists.
    pub zprime_step_factor: f64,
    /// Sub-intervals scanned for the shell-edge partial-volume weight.
    pub edge_weight_subsamples: usize,
    /// Expected minimum-mass halo count for the cell-scale Poisson draw.
    pub n_poisson: f64,
}

impl Default for UserParams {
    fn default() -> Self {
        UserParams {
            hii_dim: 64,
            box_len: 128.0,
            non_cubic_factor: 1.0,
            minimize_memory: false,
            no_rng: false,
            avg_below_sampler: false,
            sampler_min_mass: 1e10,
            n_shells: 40,
            r_xly_max: 500.0,
            delta_r_hii_factor: 1.1,
            zprime_step_factor: 1.02,
            edge_weight_subsamples: 1000,
            n_poisson: 5.0,
        }
    }
}

/// Flat LCDM background.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CosmoParams {
    pub hlittle: f64,
    pub omm: f64,
    pub oml: f64,
    pub omb: f64,
    pub sigma8: f64,
    pub ns: f64,
    /// Helium mass fraction.
    pub y_he: f64,
    /// Maximum heating redshift; above it the Recfast seed applies.
    pub z_heat_max: f64,
}

impl Default for CosmoParams {
    fn default() -> Self {
        CosmoParams {
            hlittle: 0.6774,
            omm: 0.3089,
            oml: 0.6911,
            omb: 0.0486,
            sigma8: 0.8159,
            ns: 0.9667,
            y_he: 0.245,
            z_heat_max: 35.0,
        }
    }
}

/// Galaxy-formation and radiative parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AstroParams {
    /// Stellar fraction normalisation at 1e10 Msun (ACG).
    pub f_star10: f64,
    pub alpha_star: f64,
    /// Stellar fraction normalisation at 1e7 Msun (MCG).
    pub f_star7_mini: f64,
    pub alpha_star_mini: f64,
    /// Escape fraction normalisation at 1e10 Msun (ACG).
    pub f_esc10: f64,
    pub alpha_esc: f64,
    /// Escape fraction normalisation at 1e7 Msun (MCG).
    pub f_esc7_mini: f64,
    /// Non-mass-dependent ionising efficiency (legacy zeta path).
    pub hii_eff_factor: f64,
    /// Turnover-mass floor (Msun).
    pub m_turn: f64,
    /// Star-formation timescale in Hubble times.
    pub t_star: f64,
    /// Lognormal scatter of the stellar fraction.
    pub sigma_star: f64,
    /// Lognormal SFR scatter floor.
    pub sigma_sfr_lim: f64,
    /// Slope of the SFR scatter with log10 stellar mass.
    pub sigma_sfr_index: f64,
    /// Upper stellar turnover pivot mass (Msun).
    pub upper_stellar_turnover_mass: f64,
    /// Upper stellar turnover power-law index.
    pub upper_stellar_turnover_index: f64,
    /// Soft-band X-ray luminosity per SFR, ACG (erg/s per Msun/yr).
    pub l_x: f64,
    /// Soft-band X-ray luminosity per SFR, MCG.
    pub l_x_mini: f64,
    /// Lognormal X-ray scatter.
    pub sigma_lx: f64,
    /// X-ray photon energy threshold (eV).
    pub nu_x_thresh: f64,
    /// X-ray SED spectral index.
    pub x_ray_spec_index: f64,
    /// H2 self-shielding suppression of the LW flux.
    pub f_h2_shield: f64,
    /// Lyman-Werner feedback amplitude and slope (Munoz+21 form).
    pub a_lw: f64,
    pub beta_lw: f64,
    /// Relative-velocity feedback amplitude and slope.
    pub a_vcb: f64,
    pub beta_vcb: f64,
    /// Maximum bubble radius (Mpc).
    pub r_bubble_max: f64,
    /// Minimum bubble radius (Mpc).
    pub r_bubble_min: f64,
    /// Ionising photons per stellar baryon, Pop II.
    pub pop2_ion: f64,
    /// Ionising photons per stellar baryon, Pop III.
    pub pop3_ion: f64,
    /// Sub-grid clumping factor for the x_e sink term.
    pub clumping_factor: f64,
    /// Mean IGM UV spectral index for the Gamma12 prefactor.
    pub alpha_uvb: f64,
}

impl Default for AstroParams {
    fn default() -> Self {
        AstroParams {
            f_star10: 0.05,
            alpha_star: 0.5,
            f_star7_mini: 2.75e-3,
            alpha_star_mini: 0.0,
            f_esc10: 0.1,
            alpha_esc: -0.5,
            f_esc7_mini: 1e-2,
            hii_eff_factor: 30.0,
            m_turn: 5e8,
            t_star: 0.5,
            sigma_star: 0.25,
            sigma_sfr_lim: 0.19,
            sigma_sfr_index: -0.12,
            upper_stellar_turnover_mass: 8.368e11,
            upper_stellar_turnover_index: -0.61,
            l_x: 10.0_f64.powf(40.5),
            l_x_mini: 10.0_f64.powf(40.5),
            sigma_lx: 0.5,
            nu_x_thresh: 500.0,
            x_ray_spec_index: 1.0,
            f_h2_shield: 0.0,
            a_lw: 2.0,
            beta_lw: 0.6,
            a_vcb: 1.0,
            beta_vcb: 1.8,
            r_bubble_max: 15.0,
            r_bubble_min: 0.620350491,
            pop2_ion: 5000.0,
            pop3_ion: 44021.0,
            clumping_factor: 2.0,
            alpha_uvb: 5.0,
        }
    }
}

/// The closed set of behaviour switches (spec-visible Mode field).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagOptions {
    pub use_halo_field: bool,
    pub use_mini_halos: bool,
    pub use_mass_dependent_zeta: bool,
    pub use_ts_fluct: bool,
    pub use_lya_heating: bool,
    pub use_cmb_heating: bool,
    pub inhomo_reco: bool,
    pub cell_recomb: bool,
    pub use_exp_filter: bool,
    pub fix_vcb_avg: bool,
    pub use_relative_velocities: bool,
    /// Grid every property from the CMF integrals instead of a catalogue.
    pub fixed_halo_grids: bool,
    pub use_upper_stellar_turnover: bool,
    pub bubble_algorithm: BubbleAlgorithm,
    pub photon_cons_type: PhotonConsType,
    /// Kernel used by the ionisation R-loop.
    pub hii_filter: FilterKind,
    /// Kernel used by the spin-temperature shell filtering.
    pub heat_filter: FilterKind,
}

impl Default for FlagOptions {
    fn default() -> Self {
        FlagOptions {
            use_halo_field: false,
            use_mini_halos: false,
            use_mass_dependent_zeta: true,
            use_ts_fluct: false,
            use_lya_heating: false,
            use_cmb_heating: false,
            inhomo_reco: false,
            cell_recomb: false,
            use_exp_filter: false,
            fix_vcb_avg: false,
            use_relative_velocities: false,
            fixed_halo_grids: false,
            use_upper_stellar_turnover: true,
            bubble_algorithm: BubbleAlgorithm::Sphere,
            photon_cons_type: PhotonConsType::None,
            hii_filter: FilterKind::TophatReal,
            heat_filter: FilterKind::TophatReal,
        }
    }
}

/// Everything a snapshot needs, checked once at entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SimulationConfig {
    pub user: UserParams,
    pub cosmo: CosmoParams,
    pub astro: AstroParams,
    pub flags: FlagOptions,
}

impl SimulationConfig {
    /// Load from a JSON file.
    pub fn from_file(path: &str) -> ReionResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent flag combinations at snapshot entry.
    pub fn validate(&self) -> ReionResult<()> {
        if self.user.hii_dim < 2 {
            return Err(ReionError::Value(format!(
                "hii_dim = {} is below the minimum lattice size",
                self.user.hii_dim
            )));
        }
        if self.user.box_len <= 0.0 {
            return Err(ReionError::Value(format!(
                "box_len = {} must be positive",
                self.user.box_len
            )));
        }
        if self.user.non_cubic_factor < 1.0 {
            return Err(ReionError::Value(format!(
                "non_cubic_factor = {} must be >= 1",
                self.user.non_cubic_factor
            )));
        }
        if self.user.n_shells < 2 {
            return Err(ReionError::Value(
                "at least two spin-temperature shells are required".to_string(),
            ));
        }
        if self.user.delta_r_hii_factor <= 1.0 {
            return Err(ReionError::Value(format!(
                "delta_r_hii_factor = {} must exceed 1",
                self.user.delta_r_hii_factor
            )));
        }
        if self.flags.use_exp_filter && self.flags.hii_filter != FilterKind::Exponential {
            return Err(ReionError::Value(
                "use_exp_filter requires hii_filter = exponential".to_string(),
            ));
        }
        if !self.flags.use_exp_filter && self.flags.hii_filter == FilterKind::Exponential {
            return Err(ReionError::Value(
                "the exponential filter is only available under use_exp_filter".to_string(),
            ));
        }
        if self.flags.use_mini_halos && !self.flags.use_mass_dependent_zeta {
            return Err(ReionError::Value(
                "use_mini_halos requires use_mass_dependent_zeta".to_string(),
            ));
        }
        if self.flags.cell_recomb && !self.flags.inhomo_reco {
            return Err(ReionError::Value(
                "cell_recomb is meaningless without inhomo_reco".to_string(),
            ));
        }
        if self.user.avg_below_sampler && !self.flags.use_halo_field {
            return Err(ReionError::Value(
                "avg_below_sampler requires use_halo_field".to_string(),
            ));
        }
        if self.flags.fixed_halo_grids && !self.flags.use_halo_field {
            return Err(ReionError::Value(
                "fixed_halo_grids replaces the catalogue inside the halo-field path".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        SimulationConfig::default().validate().unwrap();
    }

    #[test]
    fn test_roundtrip_serialization() {
        let cfg = SimulationConfig::default();
        let json = serde_json::to_string_pretty(&cfg).unwrap();
        let cfg2: SimulationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.user.hii_dim, cfg2.user.hii_dim);
        assert_eq!(cfg.flags.bubble_algorithm, cfg2.flags.bubble_algorithm);
        assert!((cfg.astro.f_star10 - cfg2.astro.f_star10).abs() < 1e-12);
    }

    #[test]
    fn test_exp_filter_requires_flag() {
        let mut cfg = SimulationConfig::default();
        cfg.flags.hii_filter = FilterKind::Exponential;
        let err = cfg.validate().unwrap_err();
        match err {
            ReionError::Value(msg) => assert!(msg.contains("exponential")),
            other => panic!("Unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_minihalos_require_mass_dependent_zeta() {
        let mut cfg = SimulationConfig::default();
        cfg.flags.use_mini_halos = true;
        cfg.flags.use_mass_dependent_zeta = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_cell_recomb_requires_inhomo_reco() {
        let mut cfg = SimulationConfig::default();
        cfg.flags.cell_recomb = true;
        cfg.flags.inhomo_reco = false;
        assert!(cfg.validate().is_err());
    }
}
