// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — State
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Lattice geometry and the per-snapshot box types.
//!
//! Boxes are created empty at snapshot entry, populated by the gridder,
//! spin-temperature and ionisation stages, and handed to the caller.
//! The previous snapshot is only ever borrowed read-only.

use ndarray::Array3;

use crate::config::UserParams;

/// Cubic cell lattice of shape (N, N, N_z) with N_z = ceil(f * N).
#[derive(Debug, Clone)]
pub struct Grid3 {
    pub n: usize,
    pub nz: usize,
    /// Comoving box side along the cubic axes (Mpc).
    pub box_len: f64,
    /// Comoving box length along the z axis (Mpc).
    pub box_len_z: f64,
}

impl Grid3 {
    pub fn new(n: usize, box_len: f64, non_cubic_factor: f64) -> Self {
        let nz = (non_cubic_factor * n as f64).ceil() as usize;
        Grid3 {
            n,
            nz,
            box_len,
            box_len_z: box_len * non_cubic_factor,
        }
    }

    pub fn from_params(user: &UserParams) -> Self {
        Self::new(user.hii_dim, user.box_len, user.non_cubic_factor)
    }

    /// (N, N, N_z) for ndarray allocation.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.n, self.n, self.nz)
    }

    pub fn total_cells(&self) -> usize {
        self.n * self.n * self.nz
    }

    /// Cell side (Mpc).
    pub fn cell_len(&self) -> f64 {
        self.box_len / self.n as f64
    }

    /// Cell volume (Mpc^3).
    pub fn cell_volume(&self) -> f64 {
        self.cell_len().powi(3)
    }

    /// Box volume (Mpc^3).
    pub fn volume(&self) -> f64 {
        self.box_len * self.box_len * self.box_len_z
    }

    /// Periodic wrap of a (possibly negative) lattice coordinate.
    #[inline]
    pub fn wrap(&self, i: isize, axis_len: usize) -> usize {
        let n = axis_len as isize;
        (((i % n) + n) % n) as usize
    }

    pub fn zeros(&self) -> Array3<f64> {
        Array3::zeros(self.shape())
    }
}

/// Evolved density (and optional velocity) at one redshift.
#[derive(Debug, Clone)]
pub struct PerturbedField {
    pub redshift: f64,
    /// Fractional overdensity delta, dimensionless.
    pub density: Array3<f64>,
}

impl PerturbedField {
    pub fn new(grid: &Grid3, redshift: f64) -> Self {
        PerturbedField {
            redshift,
            density: grid.zeros(),
        }
    }
}

/// Relic fields from the initial-conditions stage.
#[derive(Debug, Clone)]
pub struct InitialConditions {
    /// Baryon-CDM relative velocity at recombination (km/s), low resolution.
    pub lowres_vcb: Array3<f64>,
    /// Global r.m.s. relative velocity (km/s).
    pub vcb_avg: f64,
}

impl InitialConditions {
    pub fn new(grid: &Grid3) -> Self {
        InitialConditions {
            lowres_vcb: grid.zeros(),
            vcb_avg: 25.86,
        }
    }
}

/// One catalogued halo with its correlated property deviates.
#[derive(Debug, Clone, Copy)]
pub struct Halo {
    /// Position in cell units, each component in [0, N).
    pub pos: [f64; 3],
    /// Mass (Msun); zero means excluded from gridding.
    pub mass: f64,
    pub rng_star: f64,
    pub rng_sfr: f64,
    pub rng_xray: f64,
}

/// Unordered halo catalogue, borrowed read-only by the gridder.
#[derive(Debug, Clone, Default)]
pub struct HaloCatalogue {
    pub halos: Vec<Halo>,
}

impl HaloCatalogue {
    pub fn len(&self) -> usize {
        self.halos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.halos.is_empty()
    }
}

/// Spin-temperature stage output.
#[derive(Debug, Clone)]
pub struct TsBox {
    pub redshift: f64,
    /// Spin temperature (K).
    pub ts: Array3<f64>,
    /// Kinetic temperature (K).
    pub tk: Array3<f64>,
    /// Free-electron fraction of the mostly-neutral IGM.
    pub x_e: Array3<f64>,
    /// Lyman-Werner intensity in units of 1e-21 erg/s/cm^2/Hz/sr.
    pub j_21_lw: Array3<f64>,
}

impl TsBox {
    pub fn new(grid: &Grid3, redshift: f64) -> Self {
        TsBox {
            redshift,
            ts: grid.zeros(),
            tk: grid.zeros(),
            x_e: grid.zeros(),
            j_21_lw: grid.zeros(),
        }
    }
}

/// Ionisation stage output.
#[derive(Debug, Clone)]
pub struct IonizedBox {
    pub redshift: f64,
    /// Neutral hydrogen fraction in [0, 1].
    pub xh: Array3<f64>,
    /// Redshift of first ionisation; -1 for never-ionised cells.
    pub z_re: Array3<f64>,
    /// Photo-ionisation rate in 1e-12 /s, set at the first threshold crossing.
    pub gamma12: Array3<f64>,
    /// Mean free path proxy: the radius of the first crossing (Mpc).
    pub mfp: Array3<f64>,
    /// Cumulative recombinations per baryon.
    pub dnrec: Array3<f64>,
    /// Kinetic temperature of all gas, ionised phases included (K).
    pub temp_kinetic_all_gas: Array3<f64>,
    /// Per-radius collapsed-fraction grids (one entry unless minihalos).
    pub fcoll: Vec<Array3<f64>>,
    pub fcoll_mini: Vec<Array3<f64>>,
    pub mean_f_coll: f64,
    pub mean_f_coll_mini: f64,
    pub log10_mturn_ave: f64,
    pub log10_mturn_mini_ave: f64,
}

impl IonizedBox {
    pub fn new(grid: &Grid3, redshift: f64, n_fcoll_grids: usize) -> Self {
        IonizedBox {
            redshift,
            xh: Array3::from_elem(grid.shape(), 1.0),
            z_re: Array3::from_elem(grid.shape(), -1.0),
            gamma12: grid.zeros(),
            mfp: grid.zeros(),
            dnrec: grid.zeros(),
            temp_kinetic_all_gas: grid.zeros(),
            fcoll: (0..n_fcoll_grids.max(1)).map(|_| grid.zeros()).collect(),
            fcoll_mini: (0..n_fcoll_grids.max(1)).map(|_| grid.zeros()).collect(),
            mean_f_coll: 0.0,
            mean_f_coll_mini: 0.0,
            log10_mturn_ave: 0.0,
            log10_mturn_mini_ave: 0.0,
        }
    }
}

/// Gridded source emissivities from the halo stage.
#[derive(Debug, Clone)]
pub struct HaloBox {
    pub redshift: f64,
    /// Halo mass density (Msun / Mpc^3).
    pub halo_mass: Array3<f64>,
    /// Stellar mass density, ACG (Msun / Mpc^3).
    pub halo_stars: Array3<f64>,
    /// Stellar mass density, MCG.
    pub halo_stars_mini: Array3<f64>,
    /// Star-formation-rate density (Msun / s / Mpc^3).
    pub halo_sfr: Array3<f64>,
    pub halo_sfr_mini: Array3<f64>,
    /// Escape-fraction-weighted SFR density.
    pub whalo_sfr: Array3<f64>,
    /// Ionising photon number density (photons / Mpc^3, per baryon factors applied).
    pub n_ion: Array3<f64>,
    /// X-ray luminosity density (1e38 erg/s / Mpc^3).
    pub halo_xray: Array3<f64>,
    /// Expected halo count per cell.
    pub count: Array3<f64>,
    /// Volume-weighted mean log10 turnover masses for the global tables.
    pub log10_mcrit_acg_ave: f64,
    pub log10_mcrit_mcg_ave: f64,
    /// Mean reionisation-feedback turnover over gridded halos (Msun).
    pub mean_mturn_reion: f64,
}

impl HaloBox {
    pub fn new(grid: &Grid3, redshift: f64) -> Self {
        HaloBox {
            redshift,
            halo_mass: grid.zeros(),
            halo_stars: grid.zeros(),
            halo_stars_mini: grid.zeros(),
            halo_sfr: grid.zeros(),
            halo_sfr_mini: grid.zeros(),
            whalo_sfr: grid.zeros(),
            n_ion: grid.zeros(),
            halo_xray: grid.zeros(),
            count: grid.zeros(),
            log10_mcrit_acg_ave: 0.0,
            log10_mcrit_mcg_ave: 0.0,
            mean_mturn_reion: 0.0,
        }
    }
}

/// Per-shell annulus-filtered SFR grids feeding the spin-temperature engine.
#[derive(Debug, Clone)]
pub struct XraySourceBox {
    pub filtered_sfr: Vec<Array3<f64>>,
    pub filtered_sfr_mini: Vec<Array3<f64>>,
    pub mean_sfr: Vec<f64>,
    pub mean_sfr_mini: Vec<f64>,
    pub mean_log10_mcrit_lw: Vec<f64>,
}

impl XraySourceBox {
    pub fn empty(n_shells: usize) -> Self {
        XraySourceBox {
            filtered_sfr: Vec::with_capacity(n_shells),
            filtered_sfr_mini: Vec::with_capacity(n_shells),
            mean_sfr: vec![0.0; n_shells],
            mean_sfr_mini: vec![0.0; n_shells],
            mean_log10_mcrit_lw: vec![0.0; n_shells],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_creation() {
        let grid = Grid3::new(32, 64.0, 1.0);
        assert_eq!(grid.shape(), (32, 32, 32));
        assert_eq!(grid.total_cells(), 32 * 32 * 32);
        assert!((grid.cell_len() - 2.0).abs() < 1e-12);
        assert!((grid.cell_volume() - 8.0).abs() < 1e-12);
    }

    #[test]
    fn test_non_cubic_grid() {
        let grid = Grid3::new(16, 32.0, 1.5);
        assert_eq!(grid.nz, 24);
        assert!((grid.box_len_z - 48.0).abs() < 1e-12);
        assert!((grid.volume() - 32.0 * 32.0 * 48.0).abs() < 1e-9);
    }

    #[test]
    fn test_wrap_negative() {
        let grid = Grid3::new(8, 8.0, 1.0);
        assert_eq!(grid.wrap(-1, 8), 7);
        assert_eq!(grid.wrap(8, 8), 0);
        assert_eq!(grid.wrap(17, 8), 1);
    }

    #[test]
    fn test_ionized_box_neutral_init() {
        let grid = Grid3::new(8, 8.0, 1.0);
        let ion = IonizedBox::new(&grid, 9.0, 1);
        assert!(ion.xh.iter().all(|&x| (x - 1.0).abs() < 1e-12));
        assert!(ion.z_re.iter().all(|&z| (z + 1.0).abs() < 1e-12));
        assert_eq!(ion.fcoll.len(), 1);
    }
}
