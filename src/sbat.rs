// sbat.rs
//
// Per-set and per-gene driver: resolves members to variants, applies the
// skip rules, and runs correlation -> VIF reduction -> joint test.

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use ndarray::{Array1, Axis};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::ops::{Range, RangeInclusive};

use crate::correlation::correlation_from_genotypes;
use crate::error::{PrepError, TestError};
use crate::joint::{joint_chisq, single_variant_test, TestResult};
use crate::prepare::{CohortContext, Variant};
use crate::sumstats::{GeneAnnotation, SnpSet};
use crate::vif::{prune_correlated, reduce_collinearity, DEFAULT_VIF_THRESHOLD};

pub const MAX_SET_SNPS: usize = 20_000;
pub const MAX_GENE_SNPS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct SbatOptions {
    pub vif_threshold: f64,
    /// Optional `|r|` cutoff for pairwise pruning ahead of the VIF reduction.
    pub prune_cutoff: Option<f64>,
    pub max_set_snps: usize,
    pub max_gene_snps: usize,
    /// Distance added on both sides of a gene, in base pairs.
    pub gene_window_bp: i64,
}

impl Default for SbatOptions {
    fn default() -> Self {
        Self {
            vif_threshold: DEFAULT_VIF_THRESHOLD,
            prune_cutoff: None,
            max_set_snps: MAX_SET_SNPS,
            max_gene_snps: MAX_GENE_SNPS,
            gene_window_bp: 50_000,
        }
    }
}

#[derive(Debug)]
pub enum SkipReason {
    NoVariants,
    TooManyVariants { count: usize, cap: usize },
    Unmapped,
    Failed(TestError),
}

#[derive(Debug)]
pub enum Outcome {
    Tested(TestResult),
    Skipped(SkipReason),
}

impl Outcome {
    pub fn tested(&self) -> Option<&TestResult> {
        match self {
            Outcome::Tested(result) => Some(result),
            Outcome::Skipped(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct SetReport {
    pub name: String,
    /// Members found among the analysed variants.
    pub n_snps: usize,
    pub outcome: Outcome,
}

#[derive(Debug)]
pub struct GeneReport {
    pub gene: GeneAnnotation,
    pub n_snps: usize,
    pub snp_start: Option<String>,
    pub snp_end: Option<String>,
    pub outcome: Outcome,
}

/// Runs the test for one group of variants (indices into `ctx.variants`).
///
/// A single variant is tested on its own 1-df chi-square. Larger groups go
/// through genotype correlation, optional pruning, VIF reduction and the joint
/// quadratic-form test.
pub fn test_variant_group(
    ctx: &CohortContext<'_>,
    indices: &[usize],
    options: &SbatOptions,
) -> Result<TestResult, TestError> {
    let members: Vec<&Variant> = indices.iter().map(|&i| &ctx.variants[i]).collect();
    match members.as_slice() {
        [] => Err(TestError::Empty),
        [single] => single_variant_test(single.beta, single.se),
        _ => {
            let genotypes = ctx.genotypes.centered_genotypes(&members)?;
            let mut correlation = correlation_from_genotypes(genotypes.view());
            drop(genotypes);

            let mut keep: Vec<usize> = (0..members.len()).collect();
            if let Some(cutoff) = options.prune_cutoff {
                let pruned = prune_correlated(&correlation, cutoff);
                if !pruned.is_empty() {
                    debug!("Pruned {} SNPs with |r| > {} before VIF reduction.", pruned.len(), cutoff);
                    keep.retain(|k| pruned.binary_search(k).is_err());
                    correlation = correlation.select(Axis(0), &keep).select(Axis(1), &keep);
                }
            }

            let beta: Array1<f64> = keep.iter().map(|&k| members[k].beta).collect();
            let se: Array1<f64> = keep.iter().map(|&k| members[k].se).collect();
            let names: Vec<String> = keep.iter().map(|&k| members[k].name.clone()).collect();

            let reduced = reduce_collinearity(correlation, beta, se, names, options.vif_threshold)?;
            debug!(
                "{} of {} SNPs retained after {} VIF pass(es); removed: {:?}",
                reduced.len(),
                members.len(),
                reduced.iterations,
                reduced.removed
            );
            joint_chisq(&reduced.correlation, &reduced.beta, &reduced.se)
        }
    }
}

fn progress_bar(len: usize, unit: &str) -> ProgressBar {
    let style = ProgressStyle::default_bar()
        .template(&format!(
            "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {} ({{percent}}%) ETA: {{eta}}",
            unit
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    ProgressBar::new(len as u64).with_style(style)
}

fn log_skip(kind: &str, name: &str, reason: &SkipReason) {
    match reason {
        SkipReason::NoVariants => warn!("No SNPs of the {} [{}] are in the data. It is ignored in the analysis.", kind, name),
        SkipReason::TooManyVariants { count, cap } => warn!(
            "Too many SNPs in the {} [{}] ({}). Maximum limit is {}. It is ignored in the analysis.",
            kind, name, count, cap
        ),
        SkipReason::Unmapped => debug!("The {} [{}] could not be mapped to the SNP data.", kind, name),
        SkipReason::Failed(e) => warn!("The {} [{}] could not be tested: {}. It is ignored in the analysis.", kind, name, e),
    }
}

fn run_group(
    ctx: &CohortContext<'_>,
    indices: &[usize],
    cap: usize,
    options: &SbatOptions,
) -> Outcome {
    if indices.is_empty() {
        return Outcome::Skipped(SkipReason::NoVariants);
    }
    if indices.len() > cap {
        return Outcome::Skipped(SkipReason::TooManyVariants { count: indices.len(), cap });
    }
    match test_variant_group(ctx, indices, options) {
        Ok(result) => Outcome::Tested(result),
        Err(e) => Outcome::Skipped(SkipReason::Failed(e)),
    }
}

/// Tests every user-defined set. Fails only when none of the sets has a
/// single member among the analysed variants.
pub fn run_set_tests(
    ctx: &CohortContext<'_>,
    sets: &[SnpSet],
    options: &SbatOptions,
) -> Result<Vec<SetReport>, PrepError> {
    let name_to_index: HashMap<&str, usize> = ctx
        .variants
        .iter()
        .enumerate()
        .map(|(idx, v)| (v.name.as_str(), idx))
        .collect();

    let set_indices: Vec<Vec<usize>> = sets
        .par_iter()
        .map(|set| {
            let mut seen = HashSet::new();
            set.members
                .iter()
                .filter_map(|member| name_to_index.get(member.as_str()).copied())
                .filter(|idx| seen.insert(*idx))
                .collect()
        })
        .collect();

    let mappable = set_indices.iter().filter(|indices| !indices.is_empty()).count();
    if mappable == 0 {
        return Err(PrepError::Alignment(
            "no SNP set shares any SNP with the association results".to_string(),
        ));
    }
    info!("Running set-based multivariate association test (SBAT-MULTI) on {} sets ({} with SNPs in the data)...", sets.len(), mappable);

    let pb = progress_bar(sets.len(), "sets");
    let reports: Vec<SetReport> = sets
        .par_iter()
        .zip(set_indices.par_iter())
        .map(|(set, indices)| {
            let outcome = run_group(ctx, indices, options.max_set_snps, options);
            if let Outcome::Skipped(reason) = &outcome {
                log_skip("set", &set.name, reason);
            }
            pb.inc(1);
            SetReport {
                name: set.name.clone(),
                n_snps: indices.len(),
                outcome,
            }
        })
        .collect();
    pb.finish_with_message("Set tests complete.");

    Ok(reports)
}

fn normalize_chromosome(chr: &str) -> String {
    let trimmed = match chr.get(..3) {
        Some(prefix) if chr.len() > 3 && prefix.eq_ignore_ascii_case("chr") => &chr[3..],
        _ => chr,
    };
    trimmed.to_ascii_uppercase()
}

/// Index range of each chromosome in the variant table. Each chromosome must
/// form one contiguous block with non-decreasing positions.
fn chromosome_blocks(variants: &[Variant]) -> Result<HashMap<String, Range<usize>>, PrepError> {
    let mut blocks: HashMap<String, Range<usize>> = HashMap::new();
    let mut start = 0;
    for idx in 1..=variants.len() {
        let block_ends = idx == variants.len() || variants[idx].chromosome != variants[start].chromosome;
        if !block_ends {
            if variants[idx].bp_position < variants[idx - 1].bp_position {
                return Err(PrepError::Alignment(format!(
                    "SNPs are not sorted by position on chromosome {} ({} at {} follows {} at {})",
                    variants[idx].chromosome,
                    variants[idx].name,
                    variants[idx].bp_position,
                    variants[idx - 1].name,
                    variants[idx - 1].bp_position
                )));
            }
            continue;
        }
        let chr = normalize_chromosome(&variants[start].chromosome);
        if blocks.insert(chr, start..idx).is_some() {
            return Err(PrepError::Alignment(format!(
                "SNPs on chromosome {} are not contiguous in the reference panel",
                variants[start].chromosome
            )));
        }
        start = idx;
    }
    Ok(blocks)
}

/// Finds, for each gene, the first and last variant inside
/// `[start - window, end + window]` on its chromosome.
pub fn map_genes_to_variants(
    variants: &[Variant],
    genes: &[GeneAnnotation],
    window_bp: i64,
) -> Result<Vec<Option<RangeInclusive<usize>>>, PrepError> {
    if let Some(first) = variants.first() {
        let chr = first.chromosome.trim();
        if chr.is_empty() || chr == "0" {
            return Err(PrepError::Alignment(format!(
                "chromosome information is missing for SNP {} in the reference panel",
                first.name
            )));
        }
        if first.bp_position <= 0 {
            return Err(PrepError::Alignment(format!(
                "bp information is missing for SNP {} in the reference panel",
                first.name
            )));
        }
    }
    let blocks = chromosome_blocks(variants)?;

    Ok(genes
        .par_iter()
        .map(|gene| {
            let block = blocks.get(&normalize_chromosome(&gene.chromosome))?;
            let on_chr = &variants[block.clone()];
            let lower = gene.start - window_bp;
            let upper = gene.end + window_bp;
            let first = on_chr.partition_point(|v| (v.bp_position as i64) < lower);
            let past_last = on_chr.partition_point(|v| (v.bp_position as i64) <= upper);
            (first < past_last).then(|| (block.start + first)..=(block.start + past_last - 1))
        })
        .collect())
}

/// Tests every gene whose window covers at least one variant. Fails when no
/// gene can be mapped at all.
pub fn run_gene_tests(
    ctx: &CohortContext<'_>,
    genes: &[GeneAnnotation],
    options: &SbatOptions,
) -> Result<Vec<GeneReport>, PrepError> {
    info!(
        "Mapping the physical positions of genes to SNP data (gene boundaries: {}Kb away from UTRs) ...",
        options.gene_window_bp / 1000
    );
    let windows = map_genes_to_variants(ctx.variants, genes, options.gene_window_bp)?;
    let mapped = windows.iter().filter(|w| w.is_some()).count();
    if mapped == 0 {
        return Err(PrepError::Alignment(
            "no gene can be mapped to the SNP data. Please check the input data regarding chr and bp".to_string(),
        ));
    }
    info!("{} of {} genes have been mapped to SNP data.", mapped, genes.len());

    info!("Running set-based association test (SBAT) for genes ...");
    let pb = progress_bar(genes.len(), "genes");
    let reports: Vec<GeneReport> = genes
        .par_iter()
        .zip(windows.into_par_iter())
        .map(|(gene, window)| {
            let report = match window {
                None => GeneReport {
                    gene: gene.clone(),
                    n_snps: 0,
                    snp_start: None,
                    snp_end: None,
                    outcome: Outcome::Skipped(SkipReason::Unmapped),
                },
                Some(range) => {
                    let indices: Vec<usize> = range.clone().collect();
                    GeneReport {
                        gene: gene.clone(),
                        n_snps: indices.len(),
                        snp_start: Some(ctx.variants[*range.start()].name.clone()),
                        snp_end: Some(ctx.variants[*range.end()].name.clone()),
                        outcome: run_group(ctx, &indices, options.max_gene_snps, options),
                    }
                }
            };
            if let Outcome::Skipped(reason) = &report.outcome {
                log_skip("gene region", &gene.name, reason);
            }
            pb.inc(1);
            report
        })
        .collect();
    pb.finish_with_message("Gene tests complete.");

    Ok(reports)
}
