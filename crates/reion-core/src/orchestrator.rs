// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Orchestrator
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Per-snapshot lifecycle: allocate, grid sources, build the X-ray
//! source box, advance the spin temperature, solve the ionisation
//! field, and double-buffer snapshots across redshift steps. The
//! previous snapshot is only ever borrowed read-only; each stage either
//! succeeds fully or the snapshot fails as a whole.

use log::debug;

use reion_astro::cosmology::Cosmology;
use reion_types::config::SimulationConfig;
use reion_types::error::{ReionError, ReionResult};
use reion_types::state::{
    Grid3, HaloBox, HaloCatalogue, InitialConditions, IonizedBox, PerturbedField, TsBox,
    XraySourceBox,
};

use crate::halobox::compute_halobox;
use crate::ionbox::{compute_ionised_box, PhotonConsInput};
use crate::shells::ShellSchedule;
use crate::spintemp::compute_spin_temperature;
use crate::xray::build_xray_source_box;

/// Everything one snapshot hands to its successor.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub redshift: f64,
    pub perturb: PerturbedField,
    pub halobox: Option<HaloBox>,
    pub ts: TsBox,
    pub ion: IonizedBox,
}

/// Descending-redshift driver owning the lattice buffers.
pub struct Pipeline {
    config: SimulationConfig,
    grid: Grid3,
    prev: Option<Snapshot>,
}

impl Pipeline {
    pub fn new(config: SimulationConfig) -> ReionResult<Self> {
        config.validate()?;
        let grid = Grid3::from_params(&config.user);
        Ok(Pipeline {
            config,
            grid,
            prev: None,
        })
    }

    pub fn grid(&self) -> &Grid3 {
        &self.grid
    }

    pub fn previous(&self) -> Option<&Snapshot> {
        self.prev.as_ref()
    }

    /// Run one snapshot and swap it into the double buffer.
    ///
    /// Snapshots must be fed in strictly decreasing redshift order.
    pub fn step(
        &mut self,
        redshift: f64,
        perturb: PerturbedField,
        ini: &InitialConditions,
        halos: Option<&HaloCatalogue>,
        photoncons: Option<&PhotonConsInput>,
    ) -> ReionResult<&Snapshot> {
        if let Some(prev) = &self.prev {
            if redshift >= prev.redshift {
                return Err(ReionError::Value(format!(
                    "snapshot redshifts must decrease: {} after {}",
                    redshift, prev.redshift
                )));
            }
        }

        let prev_redshift = match &self.prev {
            Some(p) => p.redshift,
            None => (1.0 + redshift) * self.config.user.zprime_step_factor - 1.0,
        };
        debug!("snapshot z = {redshift:.3} (previous {prev_redshift:.3})");

        // synthesised fully-neutral previous box for the first snapshot
        let first_prev_ion;
        let (prev_ts, prev_ion, prev_perturb) = match &self.prev {
            Some(p) => (Some(&p.ts), &p.ion, Some(&p.perturb)),
            None => {
                let n_fcoll = if self.config.flags.use_mini_halos {
                    let cosmo = Cosmology::new(&self.config.cosmo);
                    crate::ionbox::radius_count(&self.grid, &self.config, &cosmo)
                } else {
                    1
                };
                first_prev_ion = IonizedBox::new(&self.grid, prev_redshift, n_fcoll);
                (None, &first_prev_ion, None)
            }
        };

        // 2.4: source grids
        let halobox = if self.config.flags.use_halo_field {
            Some(compute_halobox(
                redshift,
                &self.config,
                ini,
                &perturb,
                halos,
                prev_ts,
                prev_ion,
            )?)
        } else {
            None
        };

        // 2.3 + supplemental: per-shell annulus-filtered SFR grids
        let source_box: Option<XraySourceBox> = match &halobox {
            Some(hbox) => {
                let cosmo = Cosmology::new(&self.config.cosmo);
                let schedule = ShellSchedule::build(redshift, &self.grid, &self.config, &cosmo);
                Some(build_xray_source_box(hbox, &schedule, &self.grid, &self.config))
            }
            None => None,
        };

        // 2.5: spin temperature
        let ts = compute_spin_temperature(
            redshift,
            prev_redshift,
            &self.config,
            ini,
            &perturb,
            prev_ts,
            source_box.as_ref(),
        )?;

        // 2.6: ionisation
        let ion = compute_ionised_box(
            redshift,
            prev_redshift,
            &self.config,
            &perturb,
            prev_perturb,
            prev_ion,
            Some(&ts),
            halobox.as_ref(),
            ini,
            photoncons,
        )?;

        self.prev = Some(Snapshot {
            redshift,
            perturb,
            halobox,
            ts,
            ion,
        });
        Ok(self.prev.as_ref().expect("just set"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.user.hii_dim = 8;
        config.user.box_len = 32.0;
        config.user.n_shells = 6;
        config.user.r_xly_max = 30.0;
        config
    }

    #[test]
    fn test_redshift_ordering_enforced() {
        let config = small_config();
        let mut pipe = Pipeline::new(config).unwrap();
        let grid = pipe.grid().clone();
        let ini = InitialConditions::new(&grid);
        let perturb = PerturbedField::new(&grid, 20.0);
        pipe.step(20.0, perturb.clone(), &ini, None, None).unwrap();

        let err = pipe
            .step(21.0, PerturbedField::new(&grid, 21.0), &ini, None, None)
            .unwrap_err();
        assert!(matches!(err, ReionError::Value(_)));
    }

    #[test]
    fn test_two_snapshots_flow() {
        let config = small_config();
        let mut pipe = Pipeline::new(config).unwrap();
        let grid = pipe.grid().clone();
        let ini = InitialConditions::new(&grid);

        let snap = pipe
            .step(18.0, PerturbedField::new(&grid, 18.0), &ini, None, None)
            .unwrap();
        assert!(snap.ion.xh.iter().all(|&x| (0.0..=1.0).contains(&x)));
        assert!(snap.ts.ts.iter().all(|&t| t > 0.0));

        let snap = pipe
            .step(17.0, PerturbedField::new(&grid, 17.0), &ini, None, None)
            .unwrap();
        assert!((snap.redshift - 17.0).abs() < 1e-12);
        assert!(snap.ion.xh.iter().all(|&x| (0.0..=1.0).contains(&x)));
    }
}
