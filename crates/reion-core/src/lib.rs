// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Reion Core
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Computational core of the 21-cm semi-numerical simulator: shell
//! geometry, halo-box gridding, the spin-temperature engine and the
//! ionisation excursion-set solver, driven by a per-snapshot
//! orchestrator.

pub mod freqint;
pub mod halobox;
pub mod ionbox;
pub mod orchestrator;
pub mod shells;
pub mod spintemp;
pub mod tables;
pub mod xray;

pub use halobox::compute_halobox;
pub use ionbox::{compute_ionised_box, PhotonConsAdjustment, PhotonConsInput};
pub use orchestrator::{Pipeline, Snapshot};
pub use spintemp::compute_spin_temperature;
pub use xray::build_xray_source_box;
