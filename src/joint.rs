// joint.rs

use crate::error::TestError;
use ndarray::{Array1, Array2};
use ndarray_linalg::{Eigh, UPLO};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Eigenvalues of the correlation matrix below this fraction of the largest one mark
/// the covariance as singular.
const RELATIVE_SINGULARITY_TOLERANCE: f64 = 1e-12;

/// Chi-square statistic and p-value for one tested set or gene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestResult {
    /// Variants left after collinearity reduction; also the degrees of freedom.
    pub snps_tested: usize,
    pub chisq: f64,
    pub pvalue: f64,
}

/// Upper-tail chi-square probability.
pub fn chisq_pvalue(statistic: f64, df: usize) -> Result<f64, TestError> {
    let distribution =
        ChiSquared::new(df as f64).map_err(|e| TestError::Distribution(e.to_string()))?;
    Ok(distribution.sf(statistic))
}

/// The 1-df Wald test of a single variant, `(beta / se)^2`.
pub fn single_variant_test(beta: f64, se: f64) -> Result<TestResult, TestError> {
    let chisq = (beta / se).powi(2);
    if !chisq.is_finite() {
        return Err(TestError::NonFinite(format!("beta {} / se {}", beta, se)));
    }
    Ok(TestResult {
        snps_tested: 1,
        chisq,
        pvalue: chisq_pvalue(chisq, 1)?,
    })
}

/// Joint test of the retained effects.
///
/// With `V = (se seᵀ) ∘ R` the statistic `βᵀ V⁻¹ β` is chi-square with one
/// degree of freedom per retained variant. It is evaluated as `zᵀ R⁻¹ z` with
/// `z = β / se`, so conditioning is judged on `R` alone and does not depend on
/// the scale of the standard errors. A correlation matrix that is not clearly
/// positive definite is reported as `SingularCovariance` rather than inverted.
pub fn joint_chisq(
    correlation: &Array2<f64>,
    beta: &Array1<f64>,
    se: &Array1<f64>,
) -> Result<TestResult, TestError> {
    let n = beta.len();
    if n == 0 {
        return Err(TestError::Empty);
    }
    if se.len() != n || correlation.dim() != (n, n) {
        return Err(TestError::DimensionMismatch(format!(
            "correlation {:?}, beta {}, se {}",
            correlation.dim(),
            n,
            se.len()
        )));
    }
    let z: Array1<f64> = beta / se;
    if z.iter().any(|v| !v.is_finite()) {
        return Err(TestError::NonFinite("beta / se".to_string()));
    }

    let (eigenvalues, eigenvectors) = correlation.eigh(UPLO::Lower)?;
    let largest = eigenvalues.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let smallest = eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
    if !(largest > 0.0) || smallest <= largest * RELATIVE_SINGULARITY_TOLERANCE {
        return Err(TestError::SingularCovariance {
            min_eigenvalue: smallest,
        });
    }

    let projected = eigenvectors.t().dot(&z);
    let chisq: f64 = projected
        .iter()
        .zip(eigenvalues.iter())
        .map(|(p, d)| p * p / d)
        .sum();
    if !chisq.is_finite() {
        return Err(TestError::NonFinite(format!("chi-square statistic {}", chisq)));
    }

    Ok(TestResult {
        snps_tested: n,
        chisq,
        pvalue: chisq_pvalue(chisq, n)?,
    })
}
