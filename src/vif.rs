// vif.rs

use crate::error::TestError;
use log::debug;
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Eigenvalues below this are treated as singular directions.
pub const EIGEN_TOLERANCE: f64 = 1e-5;
/// Multiple R² within this distance of 1 counts as perfect collinearity.
pub const SATURATION_TOLERANCE: f64 = 1e-5;
/// VIF reported for variants that are perfectly explained by the others.
pub const SATURATED_VIF: f64 = 1e8;
pub const DEFAULT_VIF_THRESHOLD: f64 = 10.0;

/// Outcome of one VIF pass over a correlation matrix.
#[derive(Debug, Clone)]
pub struct VifScan {
    pub vif: Array1<f64>,
    /// Squared correlation with the most correlated other variant, and its position.
    pub max_rsq: Array1<f64>,
    pub max_partner: Vec<usize>,
    /// Number of eigenvalues at or above `EIGEN_TOLERANCE`.
    pub effective_rank: usize,
    /// Position of the variant to drop, if any VIF exceeds the threshold.
    pub selected: Option<usize>,
}

/// Runs a single VIF pass and picks the variant with the largest VIF strictly
/// above `threshold`. Ties keep the first position.
pub fn scan_vif(correlation: &Array2<f64>, threshold: f64) -> Result<VifScan, TestError> {
    let size = correlation.nrows();
    if correlation.ncols() != size {
        return Err(TestError::DimensionMismatch(format!(
            "correlation matrix is {}x{}",
            size,
            correlation.ncols()
        )));
    }
    if size <= 1 {
        return Ok(VifScan {
            vif: Array1::ones(size),
            max_rsq: Array1::zeros(size),
            max_partner: vec![0; size],
            effective_rank: size,
            selected: None,
        });
    }

    let (eigenvalues, eigenvectors) = correlation.eigh(UPLO::Lower)?;
    let mut effective_rank = 0;
    let inverse_eigenvalues: Array1<f64> = eigenvalues.mapv(|d| {
        if d < EIGEN_TOLERANCE {
            0.0
        } else {
            effective_rank += 1;
            1.0 / d
        }
    });
    // V * diag(1/d) scales the columns of V.
    let pseudo_inverse = (&eigenvectors * &inverse_eigenvalues).dot(&eigenvectors.t());

    let per_column: Vec<(f64, f64, usize)> = (0..size)
        .into_par_iter()
        .map(|j| {
            let q_diag = pseudo_inverse.column(j).dot(&correlation.row(j));
            let mut rsq = if (q_diag - 1.0).abs() < 0.01 {
                1.0 - 1.0 / pseudo_inverse[[j, j]]
            } else {
                1.0
            };
            if rsq > 1.0 {
                rsq = 1.0;
            }

            let mut best = 0.0;
            let mut partner = 0;
            for (i, r) in correlation.column(j).iter().enumerate() {
                let r2 = if i == j { 0.0 } else { r * r };
                if r2 > best {
                    best = r2;
                    partner = i;
                }
            }
            if rsq < best {
                rsq = best;
            }
            (rsq, best, partner)
        })
        .collect();

    let vif: Array1<f64> = per_column
        .iter()
        .map(|&(rsq, _, _)| {
            if (1.0 - rsq).abs() < SATURATION_TOLERANCE {
                SATURATED_VIF
            } else {
                (1.0 / (1.0 - rsq)).abs()
            }
        })
        .collect();

    let mut selected = None;
    let mut largest = 0.0;
    for (j, &v) in vif.iter().enumerate() {
        if v > largest && v > threshold {
            largest = v;
            selected = Some(j);
        }
    }

    Ok(VifScan {
        vif,
        max_rsq: per_column.iter().map(|&(_, best, _)| best).collect(),
        max_partner: per_column.iter().map(|&(_, _, partner)| partner).collect(),
        effective_rank,
        selected,
    })
}

/// A set after collinearity reduction: the surviving correlation block and the
/// beta, se and name entries that line up with its rows.
#[derive(Debug, Clone)]
pub struct ReducedSet {
    pub correlation: Array2<f64>,
    pub beta: Array1<f64>,
    pub se: Array1<f64>,
    pub names: Vec<String>,
    /// Names in the order they were dropped.
    pub removed: Vec<String>,
    pub iterations: usize,
}

impl ReducedSet {
    pub fn len(&self) -> usize {
        self.names.len()
    }
}

/// Owns the full starting matrix and arrays plus the list of positions still
/// retained. Each step materializes a fresh, one-smaller matrix from the
/// retained positions.
struct ReductionState {
    full_correlation: Array2<f64>,
    full_beta: Array1<f64>,
    full_se: Array1<f64>,
    full_names: Vec<String>,
    retained: Vec<usize>,
    current: Array2<f64>,
}

impl ReductionState {
    fn drop_position(&mut self, position: usize) {
        self.retained.remove(position);
        self.current = self
            .full_correlation
            .select(Axis(0), &self.retained)
            .select(Axis(1), &self.retained);
        debug_assert_eq!(self.current.nrows(), self.retained.len());
    }

    fn finish(self, removed: Vec<String>, iterations: usize) -> ReducedSet {
        let beta = self.full_beta.select(Axis(0), &self.retained);
        let se = self.full_se.select(Axis(0), &self.retained);
        let names = self
            .retained
            .iter()
            .map(|&i| self.full_names[i].clone())
            .collect();
        ReducedSet {
            correlation: self.current,
            beta,
            se,
            names,
            removed,
            iterations,
        }
    }
}

/// Repeatedly drops the highest-VIF variant until no VIF exceeds `threshold`.
/// Every removal shrinks the set by exactly one, so this runs at most `n`
/// passes.
pub fn reduce_collinearity(
    correlation: Array2<f64>,
    beta: Array1<f64>,
    se: Array1<f64>,
    names: Vec<String>,
    threshold: f64,
) -> Result<ReducedSet, TestError> {
    let n = correlation.nrows();
    if correlation.ncols() != n || beta.len() != n || se.len() != n || names.len() != n {
        return Err(TestError::DimensionMismatch(format!(
            "correlation {}x{}, beta {}, se {}, names {}",
            n,
            correlation.ncols(),
            beta.len(),
            se.len(),
            names.len()
        )));
    }

    let mut state = ReductionState {
        current: correlation.clone(),
        full_correlation: correlation,
        full_beta: beta,
        full_se: se,
        full_names: names,
        retained: (0..n).collect(),
    };
    let mut removed = Vec::new();
    let mut iterations = 0;

    loop {
        iterations += 1;
        let scan = scan_vif(&state.current, threshold)?;
        let Some(position) = scan.selected else {
            debug!(
                "VIF reduction settled at {} of {} variants (effective rank {}).",
                state.retained.len(),
                n,
                scan.effective_rank
            );
            break;
        };
        let dropped = state.retained[position];
        let partner = state.retained[scan.max_partner[position]];
        debug!(
            "Dropping {} (VIF {:.3e}); most correlated with {} (r^2 {:.4}).",
            state.full_names[dropped],
            scan.vif[position],
            state.full_names[partner],
            scan.max_rsq[position]
        );
        removed.push(state.full_names[dropped].clone());
        state.drop_position(position);
    }

    Ok(state.finish(removed, iterations))
}

/// Greedy pairwise pruning: for every pair with `|r| > cutoff`, drop the member
/// that takes part in more such pairs (the higher index on ties). Returns the
/// sorted positions to remove.
pub fn prune_correlated(correlation: &Array2<f64>, cutoff: f64) -> Vec<usize> {
    let m = correlation.nrows();
    let pairs: Vec<(usize, usize)> = (0..m)
        .into_par_iter()
        .flat_map_iter(|i| {
            (0..i)
                .filter(move |&j| correlation[[i, j]].abs() > cutoff)
                .map(move |j| (i, j))
        })
        .collect();

    let mut appearances: BTreeMap<usize, usize> = BTreeMap::new();
    for &(i, j) in &pairs {
        *appearances.entry(i).or_default() += 1;
        *appearances.entry(j).or_default() += 1;
    }

    let mut to_remove: Vec<usize> = pairs
        .iter()
        .map(|&(i, j)| {
            let count_i = appearances.get(&i).copied().unwrap_or(0);
            let count_j = appearances.get(&j).copied().unwrap_or(0);
            if count_i < count_j { j } else { i }
        })
        .collect();
    to_remove.sort_unstable();
    to_remove.dedup();
    to_remove
}
