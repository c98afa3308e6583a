// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Error
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReionError {
    #[error("Table generation produced a non-finite entry: {0}")]
    TableGeneration(String),

    #[error("Table lookup outside declared bounds: {table} at {value} (bounds [{lo}, {hi}])")]
    TableEvaluation {
        table: &'static str,
        value: f64,
        lo: f64,
        hi: f64,
    },

    #[error("Non-finite cell value in {field} after {stage}")]
    InfinityOrNaN {
        field: &'static str,
        stage: &'static str,
    },

    #[error("Photon-conservation remap produced a non-finite redshift: {0}")]
    PhotonCons(String),

    #[error("Invalid configuration: {0}")]
    Value(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ReionResult<T> = Result<T, ReionError>;
