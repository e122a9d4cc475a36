//! Cross-pass exon reconciliation.
//!
//! When the two prediction passes emit genes on the same locus, different
//! orthologs can end up claiming the same exons.  This module reconstructs
//! exon records from the predictor headers, detects same-frame overlaps
//! between different orthologs, and uses the profile search envelope
//! coordinates to decide which exons belong to which ortholog.  Surviving
//! exons are folded back into the classification under envelope-derived
//! gene ids.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use bio::io::fasta;
use indexmap::IndexMap;

use crate::common::Strand;
use crate::dataset::Cutoff;
use crate::err;
use crate::hmmer::domtbl::{parse_domtbl, DomtblRecord};
use crate::hmmer::results::{HmmerResults, MatchedGenes, ScoMatches};
use crate::hmmer::HmmerRunner;
use crate::metaeuk::header::{GeneDetails, GeneHeader};
use crate::metaeuk::overlap::{find_overlaps, Locatable};

/// One exon attributed to an ortholog match, reconstructed from a
/// predictor header.
#[derive(Debug, Clone, PartialEq)]
pub struct ExonRecord {
    /// Ortholog claiming the exon.
    pub sco_id: String,
    /// Contig of the exon.
    pub contig: String,
    /// Low genomic coordinate (normalized so that `start < stop`).
    pub start: i64,
    /// High genomic coordinate.
    pub stop: i64,
    /// Strand.
    pub strand: Strand,
    /// Predictor bitscore of the gene the exon belongs to.
    pub score: f64,
    /// Pass that produced the match (1 or 2).
    pub pass: u32,
    /// Gene id the exon was reconstructed from.
    pub orig_gene_id: String,
}

impl Locatable for ExonRecord {
    fn contig(&self) -> &str {
        &self.contig
    }
    fn start(&self) -> i64 {
        self.start
    }
    fn stop(&self) -> i64 {
        self.stop
    }
    fn strand(&self) -> Strand {
        self.strand
    }
}

/// Reconcile the classification with the exon structure of both passes.
///
/// No-op unless both passes produced a header file and at least one hit is
/// classified.
#[allow(clippy::too_many_arguments)]
pub fn validate_output(
    results: &mut HmmerResults,
    gene_details: &mut IndexMap<String, Vec<GeneDetails>>,
    sequences_aa: &mut IndexMap<String, fasta::Record>,
    sequences_nt: &mut IndexMap<String, fasta::Record>,
    headers_files: &[PathBuf],
    hmmer: &HmmerRunner,
    cutoffs: &IndexMap<String, Cutoff>,
) -> Result<(), anyhow::Error> {
    if headers_files.len() < 2 {
        return Ok(());
    }
    let merged = results.merged();
    if merged.is_empty() {
        return Ok(());
    }

    tracing::info!("Validating exons and removing overlapping matches");

    let exons = reconstruct_exon_records(&merged, gene_details, headers_files, hmmer)?;
    let overlaps = cross_sco_frame_overlaps(&exons);
    if overlaps.is_empty() {
        return Ok(());
    }

    let mut removals: HashSet<usize> = HashSet::new();
    for &(i, j) in &overlaps {
        removals.extend(resolve_overlap(&exons, i, j, hmmer, cutoffs)?);
    }

    let surviving: Vec<ExonRecord> = exons
        .iter()
        .enumerate()
        .filter(|(i, _)| !removals.contains(i))
        .map(|(_, rec)| rec.clone())
        .collect();

    rebuild(results, gene_details, sequences_aa, sequences_nt, &surviving);

    Ok(())
}

/// Reconstruct one exon record per exon of every classified match.
///
/// The pass of a match is decided by the existence of the ortholog's rerun
/// domain table, preferring the rerun.  The header line is located by
/// contig, strand and gene span; of several candidates the highest-scoring
/// one wins.
fn reconstruct_exon_records(
    merged: &ScoMatches,
    gene_details: &IndexMap<String, Vec<GeneDetails>>,
    headers_files: &[PathBuf],
    hmmer: &HmmerRunner,
) -> Result<Vec<ExonRecord>, anyhow::Error> {
    let initial_headers = load_headers(&headers_files[0])?;
    let rerun_headers = load_headers(&headers_files[1])?;

    let mut records = Vec::new();
    for (sco_id, gene_matches) in merged {
        let pass = if hmmer
            .rerun_results_dir
            .join(format!("{}.out", sco_id))
            .exists()
        {
            2
        } else {
            1
        };
        let headers = if pass == 2 {
            &rerun_headers
        } else {
            &initial_headers
        };

        for (gene_id, infos) in gene_matches {
            let (contig, coords) = gene_id
                .rsplit_once(':')
                .ok_or_else(|| anyhow::anyhow!("unexpected gene id format: {:?}", gene_id))?;
            let (start, end) = coords
                .split_once('-')
                .ok_or_else(|| anyhow::anyhow!("unexpected gene id format: {:?}", gene_id))?;
            let (start, end): (i64, i64) = (start.parse()?, end.parse()?);
            let strand = gene_details
                .get(gene_id)
                .and_then(|d| d.first())
                .map(|d| d.strand)
                .ok_or_else(|| anyhow::anyhow!("no location recorded for gene {}", gene_id))?;
            let score = infos
                .first()
                .map(|info| info.bitscore)
                .unwrap_or_default();

            let candidates: Vec<&GeneHeader> = headers
                .iter()
                .filter(|h| {
                    h.c_acc == contig && h.strand == strand && h.low == start && h.high == end
                })
                .collect();
            let Some(best) = candidates.iter().max_by(|a, b| {
                a.bitscore
                    .partial_cmp(&b.bitscore)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }) else {
                continue;
            };

            for exon in &best.exons {
                // exons are located by their taken coordinates; on the
                // reverse strand those run high-to-low and are normalized
                let (low, high) = if strand == Strand::Reverse {
                    (exon.taken_high, exon.taken_low)
                } else {
                    (exon.taken_low, exon.taken_high)
                };
                records.push(ExonRecord {
                    sco_id: sco_id.clone(),
                    contig: contig.to_string(),
                    start: low,
                    stop: high,
                    strand,
                    score,
                    pass,
                    orig_gene_id: gene_id.clone(),
                });
            }
        }
    }
    Ok(records)
}

fn load_headers(path: &Path) -> Result<Vec<GeneHeader>, anyhow::Error> {
    let mut headers = Vec::new();
    if !path.exists() {
        return Ok(headers);
    }
    for line in crate::common::io::read_lines(path)? {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let raw = line.rsplit('\t').next().unwrap_or(&line);
        let header = GeneHeader::parse(raw).map_err(|_| err::Error::HeaderMalformed {
            path: path.to_path_buf(),
            line: line.clone(),
        })?;
        headers.push(header);
    }
    Ok(headers)
}

/// Overlapping exon pairs that belong to different orthologs and share a
/// reading frame.
fn cross_sco_frame_overlaps(exons: &[ExonRecord]) -> Vec<(usize, usize)> {
    find_overlaps(exons)
        .into_iter()
        .filter(|&(i, j)| {
            exons[i].sco_id != exons[j].sco_id && exons[i].start % 3 == exons[j].start % 3
        })
        .collect()
}

/// Resolve one cross-ortholog overlap, returning the exon indices to drop.
fn resolve_overlap(
    exons: &[ExonRecord],
    i: usize,
    j: usize,
    hmmer: &HmmerRunner,
    cutoffs: &IndexMap<String, Cutoff>,
) -> Result<Vec<usize>, anyhow::Error> {
    let contig = &exons[i].contig;
    let group1: Vec<usize> = exon_group(exons, &exons[i].sco_id, contig);
    let group2: Vec<usize> = exon_group(exons, &exons[j].sco_id, contig);

    let record1 = first_domtbl_record(hmmer, &exons[i], cutoffs)?;
    let record2 = first_domtbl_record(hmmer, &exons[j], cutoffs)?;

    // the higher-scoring profile match gets priority
    let (priority, secondary, p_group, s_group) = if record1.score > record2.score {
        (record1, record2, group1, group2)
    } else {
        (record2, record1, group2, group1)
    };
    let secondary_sco = exons[s_group[0]].sco_id.clone();

    let (p_used, p_unused) = find_unused_exons(&priority.env_coords, &p_group, exons)?;
    let (s_used, s_unused) = find_unused_exons(&secondary.env_coords, &s_group, exons)?;

    // if the used exons of both orthologs overlap each other, the whole
    // secondary match loses
    let used_all: Vec<usize> = p_used.iter().chain(s_used.iter()).copied().collect();
    if !overlaps_within(exons, &used_all).is_empty() {
        return Ok(s_group);
    }

    let mut removals = Vec::new();
    removals.extend(cross_pair_removals(exons, &s_used, &p_unused, &secondary_sco));
    removals.extend(cross_pair_removals(exons, &p_used, &s_unused, &secondary_sco));
    removals.extend(cross_pair_removals(exons, &p_unused, &s_unused, &secondary_sco));
    Ok(removals)
}

fn exon_group(exons: &[ExonRecord], sco_id: &str, contig: &str) -> Vec<usize> {
    exons
        .iter()
        .enumerate()
        .filter(|(_, rec)| rec.sco_id == sco_id && rec.contig == contig)
        .map(|(idx, _)| idx)
        .collect()
}

/// Load the profile search record backing an exon's ortholog, from the
/// pass the exon was attributed to.
fn first_domtbl_record(
    hmmer: &HmmerRunner,
    exon: &ExonRecord,
    cutoffs: &IndexMap<String, Cutoff>,
) -> Result<DomtblRecord, anyhow::Error> {
    let path = hmmer
        .results_dir(exon.pass)
        .join(format!("{}.out", exon.sco_id));
    let score_cutoff = cutoffs
        .get(&exon.sco_id)
        .map(|c| c.score)
        .unwrap_or_default();
    let records = parse_domtbl(&path, score_cutoff)?;
    records
        .into_iter()
        .next()
        .map(|(_, record)| record)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "no admissible profile search hit in {:?} for {}",
                &path,
                &exon.sco_id
            )
        })
}

fn overlaps_within(exons: &[ExonRecord], indices: &[usize]) -> Vec<(usize, usize)> {
    let subset: Vec<&ExonRecord> = indices.iter().map(|&idx| &exons[idx]).collect();
    find_overlaps(&subset)
}

/// Detect overlaps between two exon groups and return the indices of the
/// secondary ortholog's exons involved in them.
fn cross_pair_removals(
    exons: &[ExonRecord],
    group_a: &[usize],
    group_b: &[usize],
    secondary_sco: &str,
) -> Vec<usize> {
    let combined: Vec<usize> = group_a.iter().chain(group_b.iter()).copied().collect();
    let subset: Vec<&ExonRecord> = combined.iter().map(|&idx| &exons[idx]).collect();

    let mut removals = Vec::new();
    for (x, y) in find_overlaps(&subset) {
        for pos in [x, y] {
            let global = combined[pos];
            if exons[global].sco_id == secondary_sco {
                removals.push(global);
            }
        }
    }
    removals
}

/// Walk an exon list against the envelope coordinate list, partitioning it
/// into exons that contribute to envelope coverage and exons that do not.
///
/// Envelope coordinates are amino-acid offsets within the aligned protein;
/// exon sizes convert at three nucleotides per residue.  An exon whose
/// nucleotide span is not divisible by three is a fatal error.
fn find_unused_exons(
    env_coords: &[(i64, i64)],
    exon_indices: &[usize],
    exons: &[ExonRecord],
) -> Result<(Vec<usize>, Vec<usize>), anyhow::Error> {
    let mut used = Vec::new();
    let mut unused = Vec::new();

    let mut env_iter = env_coords.iter();
    let mut current = env_iter.next();
    let mut remaining = 0f64;
    let mut cumul = 0f64;

    for &idx in exon_indices {
        let exon = &exons[idx];
        let size_nt = exon.stop - exon.start + 1;
        if size_nt % 3 != 0 {
            return Err(err::Error::ExonFractionalFrame {
                gene_id: exon.orig_gene_id.clone(),
            }
            .into());
        }
        let size_aa = size_nt as f64 / 3.0;
        cumul += size_aa;

        let mut matched = false;
        if remaining > size_aa {
            remaining -= size_aa;
            matched = true;
        } else if remaining > 0.0 {
            // the tail of the previous envelope ends inside this exon
            remaining = 0.0;
            matched = true;
        } else {
            while let Some(&(env_start, env_end)) = current {
                if (env_start as f64) < cumul + 1.0 {
                    matched = true;
                    if (env_end as f64) <= cumul + 1.0 {
                        current = env_iter.next();
                        continue;
                    }
                    remaining = env_end as f64 - size_aa + 1.0;
                    break;
                }
                break;
            }
        }

        if matched {
            used.push(idx);
        } else {
            unused.push(idx);
        }
    }

    Ok((used, unused))
}

/// Rebuild the classification from the surviving exon records: group by
/// ortholog and original gene id, span the exon envelope, and re-key every
/// map entry and sequence record with the synthesized gene id.
fn rebuild(
    results: &mut HmmerResults,
    gene_details: &mut IndexMap<String, Vec<GeneDetails>>,
    sequences_aa: &mut IndexMap<String, fasta::Record>,
    sequences_nt: &mut IndexMap<String, fasta::Record>,
    surviving: &[ExonRecord],
) {
    let mut groups: IndexMap<(String, String), Vec<&ExonRecord>> = IndexMap::new();
    for rec in surviving {
        groups
            .entry((rec.sco_id.clone(), rec.orig_gene_id.clone()))
            .or_default()
            .push(rec);
    }

    let (complete, matched_complete) = rebuild_rank(
        &results.complete,
        &groups,
        gene_details,
        sequences_aa,
        sequences_nt,
    );
    let (very_large, matched_vlarge) = rebuild_rank(
        &results.very_large,
        &groups,
        gene_details,
        sequences_aa,
        sequences_nt,
    );
    let (fragment, matched_fragment) = rebuild_rank(
        &results.fragment,
        &groups,
        gene_details,
        sequences_aa,
        sequences_nt,
    );

    results.complete = complete;
    results.matched_genes_complete = matched_complete;
    results.very_large = very_large;
    results.matched_genes_vlarge = matched_vlarge;
    results.fragment = fragment;
    results.matched_genes_fragment = matched_fragment;
}

fn rebuild_rank(
    old: &ScoMatches,
    groups: &IndexMap<(String, String), Vec<&ExonRecord>>,
    gene_details: &mut IndexMap<String, Vec<GeneDetails>>,
    sequences_aa: &mut IndexMap<String, fasta::Record>,
    sequences_nt: &mut IndexMap<String, fasta::Record>,
) -> (ScoMatches, MatchedGenes) {
    let mut new_map = ScoMatches::new();
    let mut new_inverse = MatchedGenes::new();

    for (sco_id, matches) in old {
        for (gene_id, infos) in matches {
            let Some(group) = groups.get(&(sco_id.clone(), gene_id.clone())) else {
                continue;
            };
            let min_coord = group.iter().map(|r| r.start).min().unwrap_or_default();
            let max_coord = group.iter().map(|r| r.stop).max().unwrap_or_default();
            let contig = &group[0].contig;
            let strand = group[0].strand;
            let new_gene_id = format!("{}:{}-{}", contig, min_coord, max_coord);

            new_map
                .entry(sco_id.clone())
                .or_default()
                .insert(new_gene_id.clone(), infos.clone());
            new_inverse
                .entry(new_gene_id.clone())
                .or_default()
                .push(sco_id.clone());
            gene_details.insert(
                new_gene_id.clone(),
                vec![GeneDetails {
                    start: min_coord,
                    end: max_coord,
                    strand,
                }],
            );
            if let Some(record) = sequences_aa.get(gene_id) {
                let renamed = fasta::Record::with_attrs(&new_gene_id, None, record.seq());
                sequences_aa.insert(new_gene_id.clone(), renamed);
            }
            if let Some(record) = sequences_nt.get(gene_id) {
                let renamed = fasta::Record::with_attrs(&new_gene_id, None, record.seq());
                sequences_nt.insert(new_gene_id.clone(), renamed);
            }
        }
    }

    (new_map, new_inverse)
}
