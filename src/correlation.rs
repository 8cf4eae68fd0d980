// correlation.rs

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};

/// Builds the variant-by-variant correlation matrix of a genotype block
/// (samples as rows, variants as columns).
///
/// The cross-product `XᵀX` is normalized by `sqrt(sumsq_i * sumsq_j)`. With
/// mean-centered columns this is the Pearson correlation. A column with zero
/// sum of squares (monomorphic in the kept samples) gets an all-zero row and
/// column, including its diagonal entry.
pub fn correlation_from_genotypes(genotypes: ArrayView2<f64>) -> Array2<f64> {
    let sumsq: Array1<f64> = genotypes
        .axis_iter(Axis(1))
        .map(|column| column.dot(&column))
        .collect();

    let mut correlation = genotypes.t().dot(&genotypes);

    Zip::indexed(&mut correlation).par_for_each(|(i, j), value| {
        let denom = (sumsq[i] * sumsq[j]).sqrt();
        if denom > 0.0 {
            *value /= denom;
        } else {
            *value = 0.0;
        }
    });

    correlation
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn centered(mut x: Array2<f64>) -> Array2<f64> {
        for mut column in x.axis_iter_mut(Axis(1)) {
            let mean = column.mean().unwrap_or(0.0);
            column.mapv_inplace(|v| v - mean);
        }
        x
    }

    #[test]
    fn random_block_is_symmetric_with_unit_diagonal() {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let raw = Array2::from_shape_fn((200, 12), |_| rng.random_range(0..3) as f64);
        let r = correlation_from_genotypes(centered(raw).view());

        assert_eq!(r.dim(), (12, 12));
        for i in 0..12 {
            assert_abs_diff_eq!(r[[i, i]], 1.0, epsilon = 1e-12);
            for j in 0..12 {
                assert_abs_diff_eq!(r[[i, j]], r[[j, i]], epsilon = 1e-12);
                assert!(r[[i, j]].abs() <= 1.0 + 1e-12);
            }
        }
    }

    #[test]
    fn matches_pearson_for_small_example() {
        let x = centered(array![
            [0.0, 2.0, 1.0],
            [1.0, 1.0, 1.0],
            [2.0, 0.0, 2.0],
            [1.0, 1.0, 0.0],
        ]);
        let r = correlation_from_genotypes(x.view());

        // Columns 0 and 1 are exact mirror images.
        assert_abs_diff_eq!(r[[0, 1]], -1.0, epsilon = 1e-12);
        let c0 = x.column(0);
        let c2 = x.column(2);
        let expected = c0.dot(&c2) / (c0.dot(&c0) * c2.dot(&c2)).sqrt();
        assert_abs_diff_eq!(r[[0, 2]], expected, epsilon = 1e-12);
    }

    #[test]
    fn monomorphic_column_is_zeroed() {
        let x = centered(array![[0.0, 1.0], [1.0, 1.0], [2.0, 1.0]]);
        let r = correlation_from_genotypes(x.view());
        assert_eq!(r[[1, 1]], 0.0);
        assert_eq!(r[[0, 1]], 0.0);
        assert_eq!(r[[1, 0]], 0.0);
        assert_abs_diff_eq!(r[[0, 0]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn input_is_left_untouched() {
        let x = centered(array![[0.0, 2.0], [1.0, 0.0], [2.0, 1.0]]);
        let before = x.clone();
        let _ = correlation_from_genotypes(x.view());
        assert_eq!(x, before);
    }
}
