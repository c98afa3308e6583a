// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — X-ray Source Box
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Per-shell annulus filtering of the halo SFR grids.
//!
//! Each spin-temperature shell consumes the SFR density seen through its
//! own annulus [R_{k-1}, R_k]; the innermost shell keeps the unfiltered
//! grid. Negative filter ringing is clipped to zero.

use log::debug;
use reion_math::fft::KGrid;
use reion_math::filters::filter_annulus;
use reion_types::config::SimulationConfig;
use reion_types::state::{Grid3, HaloBox, XraySourceBox};

use crate::shells::ShellSchedule;

/// Build the source box for one snapshot from the gridded halo SFR.
pub fn build_xray_source_box(
    halobox: &HaloBox,
    schedule: &ShellSchedule,
    grid: &Grid3,
    config: &SimulationConfig,
) -> XraySourceBox {
    let n_shells = schedule.len();
    let mut out = XraySourceBox::empty(n_shells);
    let n_cells = grid.total_cells() as f64;

    let sfr_k = KGrid::forward(&halobox.halo_sfr, grid.box_len, grid.box_len_z);
    let sfr_mini_k = if config.flags.use_mini_halos {
        Some(KGrid::forward(
            &halobox.halo_sfr_mini,
            grid.box_len,
            grid.box_len_z,
        ))
    } else {
        None
    };

    let mut r_inner = 0.0;
    for (k, shell) in schedule.shells.iter().enumerate() {
        let filter_one = |kg: &KGrid| {
            let mut scratch = kg.clone();
            if k > 0 {
                filter_annulus(&mut scratch, r_inner, shell.r);
            }
            let mut real = scratch.inverse();
            for v in real.iter_mut() {
                if *v < 0.0 {
                    *v = 0.0;
                }
            }
            real
        };

        let sfr = filter_one(&sfr_k);
        out.mean_sfr[k] = sfr.iter().sum::<f64>() / n_cells;
        out.filtered_sfr.push(sfr);

        if let Some(mini_k) = &sfr_mini_k {
            let sfr_mini = filter_one(mini_k);
            out.mean_sfr_mini[k] = sfr_mini.iter().sum::<f64>() / n_cells;
            out.filtered_sfr_mini.push(sfr_mini);
        }

        out.mean_log10_mcrit_lw[k] = halobox.log10_mcrit_mcg_ave;
        r_inner = shell.r;
    }

    debug!(
        "xray source box: {} shells, mean SFR [{:.3e}, {:.3e}]",
        n_shells,
        out.mean_sfr.first().copied().unwrap_or(0.0),
        out.mean_sfr.last().copied().unwrap_or(0.0)
    );
    out
}
