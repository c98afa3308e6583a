// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Reion Astro
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Cosmology, mass-function, spectral and thermochemical kernels
//! consumed by the radiative-transfer core.

pub mod cosmology;
pub mod hmf;
pub mod recfast;
pub mod recomb;
pub mod spectral;
pub mod thermochem;
