use ndarray::{Array1, Array2, Axis};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use log::{info, debug, warn};

// bed_reader imports
use bed_reader::{Bed, ReadOptions};

use crate::error::PrepError;
use crate::joint::single_variant_test;
use crate::sumstats::AssocRecord;

/// One association-tested variant after alignment to the reference panel.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub name: String,
    pub chromosome: String,
    pub bp_position: i32,
    pub beta: f64,
    pub se: f64,
    pub pval: f64,
    /// Column of this variant in the PLINK fileset.
    pub panel_index: usize,
    /// True when the effect allele is panel allele 2, so the allele-1 dosage
    /// has to be negated to line up with `beta`.
    pub flipped: bool,
}

/// Read-only view the set and gene tests need: the variant table plus a way
/// to fetch genotypes for any subset of it.
#[derive(Clone, Copy)]
pub struct CohortContext<'a> {
    pub variants: &'a [Variant],
    pub genotypes: &'a dyn GenotypeAccessor,
}

/// Fetches genotypes for a list of variants as a samples x variants matrix,
/// mean-centered per column with missing calls at 0 and allele coding aligned
/// to each variant's effect allele.
pub trait GenotypeAccessor: Sync {
    fn centered_genotypes(&self, variants: &[&Variant]) -> Result<Array2<f64>, PrepError>;

    fn num_samples(&self) -> usize;
}

/// Centers raw allele-1 dosages in place. NaN marks a missing call.
pub fn center_dosages(mut dosages: Array2<f64>, variants: &[&Variant]) -> Array2<f64> {
    for (mut column, variant) in dosages.axis_iter_mut(Axis(1)).zip(variants) {
        let (sum, called) = column
            .iter()
            .filter(|v| !v.is_nan())
            .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
        let mean = if called > 0 { sum / called as f64 } else { 0.0 };
        let sign = if variant.flipped { -1.0 } else { 1.0 };
        column.mapv_inplace(|v| if v.is_nan() { 0.0 } else { sign * (v - mean) });
    }
    dosages
}

/// Reported and implied p-values further apart than this, on the log10 scale,
/// are flagged.
const PVALUE_LOG10_TOLERANCE: f64 = 1.0;

/// Variants whose reported p-value disagrees with the Wald p-value implied by
/// `(beta / se)^2`. Zero or non-finite p-values on either side are not compared.
pub fn inconsistent_pvalues(variants: &[Variant]) -> Vec<&Variant> {
    variants
        .iter()
        .filter(|v| {
            let Ok(implied) = single_variant_test(v.beta, v.se) else {
                return false;
            };
            let (implied, reported) = (implied.pvalue, v.pval);
            implied > 0.0
                && reported > 0.0
                && reported.is_finite()
                && (implied.log10() - reported.log10()).abs() > PVALUE_LOG10_TOLERANCE
        })
        .collect()
}

// --- Reference Panel (.bim/.fam metadata) ---

#[derive(Debug, Clone)]
pub struct ReferencePanel {
    pub bed_file_path: String,
    pub snp_names: Arc<Array1<String>>,
    pub chromosomes: Arc<Array1<String>>,
    pub bp_positions: Arc<Array1<i32>>,
    pub allele1: Arc<Array1<String>>,
    pub allele2: Arc<Array1<String>>,
    pub sample_ids: Arc<Array1<String>>,
}

impl ReferencePanel {
    pub fn try_new(bfile_prefix: &str) -> Result<Self, PrepError> {
        let bed_file_path = format!("{}.bed", bfile_prefix);
        info!("Reading reference panel metadata from {}.bim/.fam", bfile_prefix);
        let mut bed = Bed::new(&bed_file_path)?;

        let panel = Self {
            snp_names: Arc::new(bed.sid()?.to_owned()),
            chromosomes: Arc::new(bed.chromosome()?.to_owned()),
            bp_positions: Arc::new(bed.bp_position()?.to_owned()),
            allele1: Arc::new(bed.allele_1()?.to_owned()),
            allele2: Arc::new(bed.allele_2()?.to_owned()),
            sample_ids: Arc::new(bed.iid()?.to_owned()),
            bed_file_path,
        };
        info!(
            "Reference panel: {} samples, {} SNPs.",
            panel.sample_count(),
            panel.snp_count()
        );
        Ok(panel)
    }

    pub fn snp_count(&self) -> usize {
        self.snp_names.len()
    }

    pub fn sample_count(&self) -> usize {
        self.sample_ids.len()
    }

    /// Indices of the `.fam` samples to use. With a keep file, only samples
    /// whose IID is listed are kept (lines are `FID IID` or a bare `IID`).
    pub fn select_samples(&self, keep_file: Option<&Path>) -> Result<Vec<isize>, PrepError> {
        let selected: Vec<isize> = match keep_file {
            Some(path) => {
                info!("Reading sample list to keep from: {}", path.display());
                let content = std::fs::read_to_string(path)
                    .map_err(|e| PrepError::io(path.display().to_string(), e))?;
                let ids_to_keep: HashSet<&str> = content
                    .lines()
                    .filter_map(|line| {
                        let fields: Vec<&str> = line.split_whitespace().collect();
                        match fields.len() {
                            0 => None,
                            1 => Some(fields[0]),
                            _ => Some(fields[1]),
                        }
                    })
                    .collect();
                self.sample_ids
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, iid)| ids_to_keep.contains(iid.as_str()).then_some(idx as isize))
                    .collect()
            }
            None => (0..self.sample_count() as isize).collect(),
        };

        if selected.is_empty() {
            return Err(PrepError::Alignment("no samples left after applying the keep list".to_string()));
        }
        info!("Sample selection: {} / {} samples kept.", selected.len(), self.sample_count());
        Ok(selected)
    }

    /// Aligns association records to the panel.
    ///
    /// Records whose SNP is absent from the panel, whose alleles do not match
    /// the panel alleles, or whose beta/se are unusable are dropped. The result
    /// follows panel order and holds each SNP once, from its first usable record.
    pub fn harmonize(&self, records: Vec<AssocRecord>) -> Result<Vec<Variant>, PrepError> {
        let name_to_index: HashMap<&str, usize> = self
            .snp_names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.as_str(), idx))
            .collect();

        let total_records = records.len();
        let mut seen: HashSet<usize> = HashSet::new();
        let mut not_in_panel = 0usize;
        let mut duplicated = 0usize;
        let mut unusable = 0usize;
        let mut allele_mismatches: Vec<String> = Vec::new();
        let mut variants: Vec<Variant> = Vec::with_capacity(total_records);

        for record in records {
            let Some(&panel_index) = name_to_index.get(record.name.as_str()) else {
                not_in_panel += 1;
                continue;
            };
            let a1 = self.allele1[panel_index].as_str();
            let a2 = self.allele2[panel_index].as_str();
            let matches_panel = |allele: &str| allele == a1 || allele == a2;
            if !matches_panel(record.allele1.as_str()) || !matches_panel(record.allele2.as_str()) {
                allele_mismatches.push(format!(
                    "{} (assoc {}/{}, panel {}/{})",
                    record.name, record.allele1, record.allele2, a1, a2
                ));
                continue;
            }
            if !record.beta.is_finite() || !record.se.is_finite() || record.se <= 0.0 {
                unusable += 1;
                continue;
            }
            if !seen.insert(panel_index) {
                duplicated += 1;
                continue;
            }

            variants.push(Variant {
                flipped: record.allele1 == *a2 && record.allele1 != *a1,
                chromosome: self.chromosomes[panel_index].clone(),
                bp_position: self.bp_positions[panel_index],
                name: record.name,
                beta: record.beta,
                se: record.se,
                pval: record.pval,
                panel_index,
            });
        }

        if not_in_panel > 0 {
            debug!("{} association records refer to SNPs absent from the reference panel.", not_in_panel);
        }
        if duplicated > 0 {
            warn!("{} duplicated SNP records in the association file were ignored (first occurrence kept).", duplicated);
        }
        if unusable > 0 {
            warn!("{} SNPs were excluded for non-finite beta or non-positive se.", unusable);
        }
        if !allele_mismatches.is_empty() {
            warn!(
                "{} SNPs were excluded because their alleles do not match the reference panel, e.g. {:?}",
                allele_mismatches.len(),
                allele_mismatches.iter().take(5).collect::<Vec<_>>()
            );
        }

        variants.sort_by_key(|v| v.panel_index);
        if variants.is_empty() {
            return Err(PrepError::Alignment("no SNP is included in the analysis".to_string()));
        }
        info!(
            "Association results of {} / {} SNPs have been included.",
            variants.len(),
            total_records
        );
        Ok(variants)
    }
}

// --- Genotype Accessor Implementation ---
#[derive(Clone)]
pub struct PlinkGenotypeAccessor {
    bed_file_path: String,
    kept_sample_indices: Arc<Vec<isize>>,
    iid_count: usize,
    sid_count: usize,
}

impl PlinkGenotypeAccessor {
    pub fn new(panel: &ReferencePanel, kept_sample_indices: Vec<isize>) -> Self {
        Self {
            bed_file_path: panel.bed_file_path.clone(),
            kept_sample_indices: Arc::new(kept_sample_indices),
            iid_count: panel.sample_count(),
            sid_count: panel.snp_count(),
        }
    }
}

impl GenotypeAccessor for PlinkGenotypeAccessor {
    fn centered_genotypes(&self, variants: &[&Variant]) -> Result<Array2<f64>, PrepError> {
        if variants.is_empty() {
            return Ok(Array2::zeros((self.num_samples(), 0)));
        }
        let sid_index: Vec<isize> = variants.iter().map(|v| v.panel_index as isize).collect();

        // Counts are known up front so the .fam/.bim are not re-read per set.
        let mut bed = Bed::builder(&self.bed_file_path)
            .iid_count(self.iid_count)
            .sid_count(self.sid_count)
            .build()?;
        let dosages = ReadOptions::builder()
            .iid_index(self.kept_sample_indices.as_slice())
            .sid_index(&sid_index)
            .f64()
            .count_a1()
            .read(&mut bed)?;

        Ok(center_dosages(dosages, variants))
    }

    fn num_samples(&self) -> usize {
        self.kept_sample_indices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use bed_reader::WriteOptions;
    use ndarray::array;

    fn record(name: &str, a1: &str, a2: &str, beta: f64, se: f64) -> AssocRecord {
        AssocRecord {
            name: name.to_string(),
            allele1: a1.to_string(),
            allele2: a2.to_string(),
            beta,
            se,
            pval: 0.5,
        }
    }

    fn write_panel(dir: &Path) -> String {
        let prefix = dir.join("panel").display().to_string();
        // 4 samples x 3 SNPs, allele-1 counts; -127 is missing.
        let genotypes: Array2<i8> = array![[0, 2, 1], [1, 1, 1], [2, 0, -127], [1, 1, 1]];
        WriteOptions::builder(format!("{}.bed", prefix))
            .fid(["f1", "f2", "f3", "f4"])
            .iid(["s1", "s2", "s3", "s4"])
            .sid(["rs1", "rs2", "rs3"])
            .chromosome(["1", "1", "2"])
            .bp_position([100, 200, 50])
            .allele_1(["A", "C", "G"])
            .allele_2(["G", "T", "A"])
            .write(&genotypes)
            .unwrap();
        prefix
    }

    #[test]
    fn harmonize_drops_unknown_mismatched_and_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let panel = ReferencePanel::try_new(&write_panel(dir.path())).unwrap();

        let variants = panel
            .harmonize(vec![
                record("rs3", "G", "A", 0.3, 0.1),
                record("rs1", "G", "A", 0.1, 0.1),
                record("rs9", "A", "G", 0.1, 0.1),
                record("rs2", "C", "A", 0.2, 0.1),
                record("rs1", "A", "G", 9.9, 0.1),
            ])
            .unwrap();

        let names: Vec<&str> = variants.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["rs1", "rs3"]);
        assert!(variants[0].flipped);
        assert!(!variants[1].flipped);
        assert_eq!(variants[0].beta, 0.1);
        assert_eq!(variants[1].chromosome, "2");
        assert_eq!(variants[1].bp_position, 50);
    }

    #[test]
    fn unusable_first_record_does_not_shadow_a_later_one() {
        let dir = tempfile::tempdir().unwrap();
        let panel = ReferencePanel::try_new(&write_panel(dir.path())).unwrap();

        let variants = panel
            .harmonize(vec![
                record("rs1", "A", "T", 0.5, 0.1),
                record("rs1", "A", "G", 0.2, 0.0),
                record("rs1", "A", "G", 0.3, 0.1),
                record("rs1", "A", "G", 0.4, 0.1),
            ])
            .unwrap();

        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].beta, 0.3);
    }

    #[test]
    fn harmonize_with_nothing_left_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let panel = ReferencePanel::try_new(&write_panel(dir.path())).unwrap();
        let err = panel.harmonize(vec![record("rs1", "A", "G", 0.1, 0.0)]);
        assert!(matches!(err, Err(PrepError::Alignment(_))));
    }

    #[test]
    fn keep_list_selects_by_iid() {
        let dir = tempfile::tempdir().unwrap();
        let panel = ReferencePanel::try_new(&write_panel(dir.path())).unwrap();
        let keep = dir.path().join("keep.txt");
        std::fs::write(&keep, "f2 s2\ns4\n\nf9 s9\n").unwrap();
        assert_eq!(panel.select_samples(Some(&keep)).unwrap(), vec![1, 3]);
        assert_eq!(panel.select_samples(None).unwrap(), vec![0, 1, 2, 3]);

        std::fs::write(&keep, "nobody\n").unwrap();
        assert!(panel.select_samples(Some(&keep)).is_err());
    }

    #[test]
    fn plink_accessor_centers_flips_and_fills_missing() {
        let dir = tempfile::tempdir().unwrap();
        let panel = ReferencePanel::try_new(&write_panel(dir.path())).unwrap();
        let variants = panel
            .harmonize(vec![
                record("rs1", "A", "G", 0.1, 0.1),
                record("rs2", "T", "C", 0.1, 0.1),
                record("rs3", "G", "A", 0.1, 0.1),
            ])
            .unwrap();
        let accessor = PlinkGenotypeAccessor::new(&panel, panel.select_samples(None).unwrap());
        let refs: Vec<&Variant> = variants.iter().collect();
        let x = accessor.centered_genotypes(&refs).unwrap();

        assert_eq!(x.dim(), (4, 3));
        // rs1: counts 0,1,2,1 -> mean 1
        assert_abs_diff_eq!(x[[0, 0]], -1.0);
        assert_abs_diff_eq!(x[[2, 0]], 1.0);
        // rs2 is flipped: counts 2,1,0,1 -> centered then negated
        assert_abs_diff_eq!(x[[0, 1]], -1.0);
        assert_abs_diff_eq!(x[[2, 1]], 1.0);
        // rs3: missing third sample becomes 0, the rest are at the mean
        for i in 0..4 {
            assert_abs_diff_eq!(x[[i, 2]], 0.0);
        }
    }

    #[test]
    fn reported_pvalues_are_checked_against_beta_and_se() {
        let with_p = |name: &str, beta: f64, se: f64, pval: f64| Variant {
            name: name.into(),
            chromosome: "1".into(),
            bp_position: 1,
            beta,
            se,
            pval,
            panel_index: 0,
            flipped: false,
        };
        let variants = vec![
            with_p("consistent", 0.196, 0.1, 0.05),
            with_p("rounded", 0.196, 0.1, 0.049),
            with_p("off", 0.196, 0.1, 1e-8),
            with_p("underflow", 0.196, 0.1, 0.0),
        ];
        let flagged: Vec<&str> = inconsistent_pvalues(&variants)
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(flagged, vec!["off"]);
    }

    #[test]
    fn center_dosages_handles_all_missing_column() {
        let v = Variant {
            name: "rs1".into(),
            chromosome: "1".into(),
            bp_position: 1,
            beta: 0.0,
            se: 1.0,
            pval: 1.0,
            panel_index: 0,
            flipped: false,
        };
        let x = center_dosages(array![[f64::NAN], [f64::NAN]], &[&v]);
        assert_eq!(x, array![[0.0], [0.0]]);
    }
}
