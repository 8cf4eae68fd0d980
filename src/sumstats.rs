// sumstats.rs
//
// Readers for the text inputs: association results, SNP set lists and gene
// annotations. All three are whitespace-separated.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use log::{info, warn};

use crate::error::PrepError;

/// One line of the association results: `SNP A1 A2 freq beta se p`.
#[derive(Debug, Clone, PartialEq)]
pub struct AssocRecord {
    pub name: String,
    pub allele1: String,
    pub allele2: String,
    pub beta: f64,
    pub se: f64,
    pub pval: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnpSet {
    pub name: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneAnnotation {
    pub name: String,
    pub chromosome: String,
    pub start: i64,
    pub end: i64,
}

fn open_lines(path: &Path) -> Result<impl Iterator<Item = (usize, std::io::Result<String>)>, PrepError> {
    let file = File::open(path).map_err(|e| PrepError::io(path.display().to_string(), e))?;
    Ok(BufReader::new(file).lines().enumerate())
}

fn parse_assoc_line(fields: &[&str]) -> Option<AssocRecord> {
    if fields.len() != 7 {
        return None;
    }
    Some(AssocRecord {
        name: fields[0].to_string(),
        allele1: fields[1].to_string(),
        allele2: fields[2].to_string(),
        beta: fields[4].parse().ok()?,
        se: fields[5].parse().ok()?,
        pval: fields[6].parse().ok()?,
    })
}

/// Reads association results. Lines without exactly seven fields or with
/// unparsable beta/se/p (a header line, for instance) are skipped and counted.
pub fn read_assoc_file(path: &Path) -> Result<Vec<AssocRecord>, PrepError> {
    info!("Reading SNP association results from [{}].", path.display());
    let mut records = Vec::new();
    let mut skipped = 0usize;
    let mut first_skipped: Option<(usize, String)> = None;

    for (line_num, line_result) in open_lines(path)? {
        let line = line_result.map_err(|e| PrepError::io(path.display().to_string(), e))?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        match parse_assoc_line(&fields) {
            Some(record) => records.push(record),
            None => {
                skipped += 1;
                if first_skipped.is_none() {
                    first_skipped = Some((line_num + 1, line.clone()));
                }
            }
        }
    }

    if let Some((line_num, line)) = first_skipped {
        warn!(
            "Skipped {} malformed line(s) in {} (expected 7 fields: SNP A1 A2 freq b se p); first at line {}: '{}'",
            skipped,
            path.display(),
            line_num,
            line
        );
    }
    info!("Read {} association records from {}.", records.len(), path.display());
    Ok(records)
}

/// Reads a set list: each block starts with the set name, lists member SNPs
/// and ends with `END`.
pub fn read_set_list(path: &Path) -> Result<Vec<SnpSet>, PrepError> {
    info!("Reading SNP sets from [{}].", path.display());
    let mut sets = Vec::new();
    let mut current: Option<SnpSet> = None;

    for (_, line_result) in open_lines(path)? {
        let line = line_result.map_err(|e| PrepError::io(path.display().to_string(), e))?;
        for token in line.split_whitespace() {
            match current.take() {
                None => {
                    current = Some(SnpSet { name: token.to_string(), members: Vec::new() });
                }
                Some(set) if token == "END" => sets.push(set),
                Some(mut set) => {
                    set.members.push(token.to_string());
                    current = Some(set);
                }
            }
        }
    }
    if let Some(set) = current {
        warn!("Set [{}] in {} is not terminated by END; keeping it anyway.", set.name, path.display());
        sets.push(set);
    }

    info!(
        "{} sets with {} SNPs in total read from {}.",
        sets.len(),
        sets.iter().map(|s| s.members.len()).sum::<usize>(),
        path.display()
    );
    Ok(sets)
}

/// Reads a gene list with lines `chr start end gene_name`.
pub fn read_gene_list(path: &Path) -> Result<Vec<GeneAnnotation>, PrepError> {
    info!("Reading gene annotations from [{}].", path.display());
    let mut genes = Vec::new();

    for (line_num, line_result) in open_lines(path)? {
        let line = line_result.map_err(|e| PrepError::io(path.display().to_string(), e))?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() || parts[0].starts_with('#') {
            continue;
        }
        let parsed = if parts.len() >= 4 {
            parts[1].parse::<i64>().ok().zip(parts[2].parse::<i64>().ok())
        } else {
            None
        };
        match parsed {
            Some((start, end)) if start <= end => genes.push(GeneAnnotation {
                chromosome: parts[0].to_string(),
                start,
                end,
                name: parts[3].to_string(),
            }),
            _ => warn!(
                "Skipping malformed gene line {} in {}: '{}' (expected: chr start end gene_name)",
                line_num + 1,
                path.display(),
                line
            ),
        }
    }

    if genes.is_empty() {
        return Err(PrepError::Parse(format!("no genes could be read from {}", path.display())));
    }
    info!("{} genes read from {}.", genes.len(), path.display());
    Ok(genes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn assoc_skips_header_and_short_lines() {
        let file = temp_file(
            "SNP A1 A2 freq b se p\n\
             rs1 A G 0.3 0.12 0.03 1e-4\n\
             rs2 C T 0.1 -0.05\n\
             \n\
             rs3 T C 0.45 -0.2 0.1 0.04\n",
        );
        let records = read_assoc_file(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "rs1");
        assert_eq!(records[0].beta, 0.12);
        assert_eq!(records[0].se, 0.03);
        assert_eq!(records[1].allele1, "T");
        assert_eq!(records[1].pval, 0.04);
    }

    #[test]
    fn missing_assoc_file_is_an_io_error() {
        let err = read_assoc_file(Path::new("/definitely/not/here.assoc"));
        assert!(matches!(err, Err(PrepError::Io { .. })));
    }

    #[test]
    fn set_blocks_are_split_on_end() {
        let file = temp_file("setA\nrs1\nrs2\nEND\n\nsetB rs3 END\nempty\nEND\nlast rs9\n");
        let sets = read_set_list(file.path()).unwrap();
        assert_eq!(sets.len(), 4);
        assert_eq!(sets[0].name, "setA");
        assert_eq!(sets[0].members, vec!["rs1", "rs2"]);
        assert_eq!(sets[1].members, vec!["rs3"]);
        assert!(sets[2].members.is_empty());
        assert_eq!(sets[3].name, "last");
        assert_eq!(sets[3].members, vec!["rs9"]);
    }

    #[test]
    fn gene_list_skips_malformed_lines() {
        let file = temp_file("1 1000 2000 GENE1\n1 abc 2000 BAD\n2 5000 4000 BACKWARDS\nX 10 20 GENE2 extra\n");
        let genes = read_gene_list(file.path()).unwrap();
        assert_eq!(genes.len(), 2);
        assert_eq!(genes[0].name, "GENE1");
        assert_eq!(genes[0].start, 1000);
        assert_eq!(genes[1].chromosome, "X");
    }
}
