// error.rs

use bed_reader::BedErrorPlus;
use thiserror::Error;

/// Failures while reading inputs and preparing the cohort (association file,
/// reference panel, genotype reads, set and gene lists).
#[derive(Debug, Error)]
pub enum PrepError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bed_reader error: {0}")]
    Bed(#[from] Box<BedErrorPlus>),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("data alignment error: {0}")]
    Alignment(String),
}

impl PrepError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        PrepError::Io { path: path.into(), source }
    }
}

/// Failures of a single set or gene test. These never abort the run; the
/// driver turns them into a skipped unit.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("linear algebra failure: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error("chi-square distribution error: {0}")]
    Distribution(String),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("covariance matrix is singular (smallest eigenvalue {min_eigenvalue:e})")]
    SingularCovariance { min_eigenvalue: f64 },

    #[error("no variants left to test")]
    Empty,

    #[error("non-finite value: {0}")]
    NonFinite(String),

    #[error("genotype access failed: {0}")]
    Genotypes(#[from] PrepError),
}
