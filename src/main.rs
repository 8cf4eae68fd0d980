// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, bail, Context, Error, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    time::Instant,
};

mod correlation;
mod error;
mod joint;
mod prepare;
mod sbat;
mod sumstats;
mod vif;

use prepare::{CohortContext, PlinkGenotypeAccessor, ReferencePanel};
use sbat::SbatOptions;

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting mbat with args: {:?}", cli_args);
    let options = cli_args.sbat_options()?;

    // Configure Rayon thread pool
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    // --- 1. Reference Panel & Sample Selection ---
    let panel = ReferencePanel::try_new(&cli_args.bfile)
        .with_context(|| format!("Failed to read reference panel {}", cli_args.bfile))?;
    let kept_samples = panel.select_samples(cli_args.keep.as_deref())?;

    // --- 2. Association Results & Allele Harmonization ---
    let assoc_records = sumstats::read_assoc_file(&cli_args.assoc)?;
    if assoc_records.is_empty() {
        bail!(
            "No usable association records in {}.",
            cli_args.assoc.display()
        );
    }
    let variants = panel.harmonize(assoc_records)?;
    debug!(
        "{} SNPs have A1 matching the second reference allele and are flipped.",
        variants.iter().filter(|v| v.flipped).count()
    );
    let inconsistent = prepare::inconsistent_pvalues(&variants);
    if !inconsistent.is_empty() {
        warn!(
            "{} SNPs have a p-value that disagrees with (b/se)^2 by more than an order of magnitude, e.g. {:?}. Single-SNP tests use b and se.",
            inconsistent.len(),
            inconsistent.iter().take(5).map(|v| v.name.as_str()).collect::<Vec<_>>()
        );
    }

    let accessor = PlinkGenotypeAccessor::new(&panel, kept_samples);
    let ctx = CohortContext {
        variants: &variants,
        genotypes: &accessor,
    };
    info!(
        "{} of {} reference samples are used to estimate LD.",
        ctx.genotypes.num_samples(),
        panel.sample_count()
    );

    // --- 3. Set or Gene Tests & Reports ---
    output_writer::ensure_parent_dir(&cli_args.output_prefix)?;
    if let Some(set_list) = &cli_args.set_list {
        let sets = sumstats::read_set_list(set_list)?;
        if sets.is_empty() {
            bail!("No SNP sets found in {}.", set_list.display());
        }
        let reports = sbat::run_set_tests(&ctx, &sets, &options)?;
        let written = output_writer::write_set_report(&cli_args.output_prefix, &reports)?;
        report_skipped(reports.len(), written, "sets");
    } else if let Some(gene_list) = &cli_args.gene_list {
        let genes = sumstats::read_gene_list(gene_list)?;
        let reports = sbat::run_gene_tests(&ctx, &genes, &options)?;
        let written = output_writer::write_gene_report(&cli_args.output_prefix, &reports)?;
        report_skipped(reports.len(), written, "genes");
    } else {
        error!("Neither --set-list nor --gene-list was given.");
        return Err(anyhow!("One of --set-list or --gene-list is required."));
    }

    info!(
        "mbat finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

fn report_skipped(total: usize, written: usize, unit: &str) {
    if written < total {
        warn!(
            "{} of {} {} were skipped and are not in the report.",
            total - written,
            total,
            unit
        );
    }
}

// --- Module Implementations ---

mod cli {
    use super::{bail, Result, SbatOptions};
    use clap::{ArgGroup, Parser};
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Set- and gene-based multivariate association tests on GWAS summary statistics.", long_about = None, propagate_version = true)]
    #[command(group(ArgGroup::new("mode").required(true).args(["set_list", "gene_list"])))]
    pub(crate) struct CliArgs {
        /// PLINK binary prefix of the LD reference panel (.bed/.bim/.fam).
        #[arg(long, required = true)]
        pub(crate) bfile: String,

        /// Association results: SNP A1 A2 freq b se p.
        #[arg(long, required = true)]
        pub(crate) assoc: PathBuf,

        #[arg(long)]
        pub(crate) set_list: Option<PathBuf>,

        #[arg(long)]
        pub(crate) gene_list: Option<PathBuf>,

        /// Window around each gene, in Kb.
        #[arg(long, default_value_t = 50.0)]
        pub(crate) wind: f64,

        /// Reference samples to keep (FID IID per line).
        #[arg(long)]
        pub(crate) keep: Option<PathBuf>,

        #[arg(long, default_value_t = 10.0)]
        pub(crate) vif_threshold: f64,

        /// Prune one SNP of each pair with |r| above this before the VIF step.
        #[arg(long)]
        pub(crate) rm_cor: Option<f64>,

        #[arg(long, default_value_t = crate::sbat::MAX_SET_SNPS)]
        pub(crate) max_set_snps: usize,

        #[arg(long, default_value_t = crate::sbat::MAX_GENE_SNPS)]
        pub(crate) max_gene_snps: usize,

        #[arg(short, long = "out", required = true)]
        pub(crate) output_prefix: String,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }

    impl CliArgs {
        pub(crate) fn sbat_options(&self) -> Result<SbatOptions> {
            if !(self.wind >= 0.0) {
                bail!("--wind must be a non-negative number of Kb, got {}.", self.wind);
            }
            if !(self.vif_threshold > 0.0) {
                bail!("--vif-threshold must be positive, got {}.", self.vif_threshold);
            }
            if let Some(r) = self.rm_cor {
                if !(r > 0.0 && r <= 1.0) {
                    bail!("--rm-cor must be in (0, 1], got {}.", r);
                }
            }
            Ok(SbatOptions {
                vif_threshold: self.vif_threshold,
                prune_cutoff: self.rm_cor,
                max_set_snps: self.max_set_snps,
                max_gene_snps: self.max_gene_snps,
                gene_window_bp: (self.wind * 1000.0).round() as i64,
            })
        }
    }

}

mod output_writer {
    use super::{anyhow, info, File, BufWriter, PathBuf, Result, Write};
    use crate::sbat::{GeneReport, SetReport};

    pub(crate) fn ensure_parent_dir(output_prefix: &str) -> Result<()> {
        let output_prefix_path = PathBuf::from(output_prefix);
        if let Some(parent) = output_prefix_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    anyhow!("Failed to create output directory {}: {}", parent.display(), e)
                })?;
                info!("Created output directory: {}", parent.display());
            }
        }
        Ok(())
    }

    fn create_output_file(prefix: &str, suffix: &str) -> Result<BufWriter<File>> {
        let filename = format!("{}.{}", prefix, suffix);
        File::create(&filename)
            .map(BufWriter::new)
            .map_err(|e| anyhow!("Failed to create output file {}: {}", filename, e))
    }

    /// Writes one row per tested set; returns the number of rows.
    pub(crate) fn write_set_rows<W: Write>(writer: &mut W, reports: &[SetReport]) -> Result<usize> {
        writeln!(writer, "Set\tSet.SNPs\tSNPsTested\tChisq(Obs)\tPvalue")?;
        let mut rows = 0;
        for report in reports {
            if let Some(result) = report.outcome.tested() {
                writeln!(
                    writer,
                    "{}\t{}\t{}\t{:.6}\t{:.6e}",
                    report.name, report.n_snps, result.snps_tested, result.chisq, result.pvalue
                )?;
                rows += 1;
            }
        }
        Ok(rows)
    }

    pub(crate) fn write_gene_rows<W: Write>(writer: &mut W, reports: &[GeneReport]) -> Result<usize> {
        writeln!(
            writer,
            "Gene\tChr\tStart\tEnd\tNo.SNPs\tSNPsTested\tSNP_start\tSNP_end\tChisq(Obs)\tPvalue"
        )?;
        let mut rows = 0;
        for report in reports {
            let (Some(result), Some(snp_start), Some(snp_end)) =
                (report.outcome.tested(), &report.snp_start, &report.snp_end)
            else {
                continue;
            };
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{:.6}\t{:.6e}",
                report.gene.name,
                report.gene.chromosome,
                report.gene.start,
                report.gene.end,
                report.n_snps,
                result.snps_tested,
                snp_start,
                snp_end,
                result.chisq,
                result.pvalue
            )?;
            rows += 1;
        }
        Ok(rows)
    }

    pub(crate) fn write_set_report(output_prefix: &str, reports: &[SetReport]) -> Result<usize> {
        let mut writer = create_output_file(output_prefix, "mbat")?;
        info!("Writing set-based test results to {}.mbat", output_prefix);
        let rows = write_set_rows(&mut writer, reports)?;
        writer.flush()?;
        info!("{} sets written.", rows);
        Ok(rows)
    }

    pub(crate) fn write_gene_report(output_prefix: &str, reports: &[GeneReport]) -> Result<usize> {
        let mut writer = create_output_file(output_prefix, "gene.mbat")?;
        info!("Writing gene-based test results to {}.gene.mbat", output_prefix);
        let rows = write_gene_rows(&mut writer, reports)?;
        writer.flush()?;
        info!("{} genes written.", rows);
        Ok(rows)
    }

}
