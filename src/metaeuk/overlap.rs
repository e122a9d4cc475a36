//! Overlap detection between located records.
//!
//! The same single-pass scan serves the intra-pass prediction filter and
//! the exon reconciler: group by contig, sort by start, and pair up records
//! whose starts interleave on the same strand.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::common::Strand;

/// Minimal view of a located record used by the overlap scan.
pub trait Locatable {
    /// Contig the record lies on.
    fn contig(&self) -> &str;
    /// Low genomic coordinate.
    fn start(&self) -> i64;
    /// High genomic coordinate.
    fn stop(&self) -> i64;
    /// Strand of the record.
    fn strand(&self) -> Strand;
}

impl<T: Locatable> Locatable for &T {
    fn contig(&self) -> &str {
        (*self).contig()
    }
    fn start(&self) -> i64 {
        (*self).start()
    }
    fn stop(&self) -> i64 {
        (*self).stop()
    }
    fn strand(&self) -> Strand {
        (*self).strand()
    }
}

/// Detect overlapping record pairs.
///
/// Two records overlap iff they share contig and strand and the later start
/// lies strictly between the earlier record's start and stop.  Returned
/// pairs are indices into `records`, earlier start first.
pub fn find_overlaps<T: Locatable>(records: &[T]) -> Vec<(usize, usize)> {
    let mut by_contig: IndexMap<&str, Vec<usize>> = IndexMap::new();
    for (i, record) in records.iter().enumerate() {
        by_contig.entry(record.contig()).or_default().push(i);
    }

    let mut result = Vec::new();
    for indices in by_contig.values_mut() {
        indices.sort_by_key(|&i| records[i].start());
        for (k, &i) in indices.iter().enumerate() {
            for &j in &indices[k + 1..] {
                if records[j].start() >= records[i].stop() {
                    break;
                }
                if records[j].start() > records[i].start()
                    && records[i].strand() == records[j].strand()
                {
                    result.push((i, j));
                }
            }
        }
    }
    result
}

/// One predicted-gene locus parsed from a protein-file header, used by the
/// intra-pass prediction filter.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictedLocus {
    /// Ortholog the prediction was derived from.
    pub sco_id: String,
    /// Contig of the prediction.
    pub contig: String,
    /// Genomic start.
    pub start: i64,
    /// Genomic stop.
    pub stop: i64,
    /// Strand.
    pub strand: Strand,
    /// Predictor bitscore.
    pub score: f64,
}

impl Locatable for PredictedLocus {
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

/// Within one prediction pass, select the loci to drop: the lower-scoring
/// of any two same-ortholog overlapping predictions.  Overlaps between
/// different orthologs are left for the exon reconciler.
pub fn same_sco_overlap_removals(loci: &[PredictedLocus]) -> HashSet<usize> {
    let mut removals = HashSet::new();
    for (i, j) in find_overlaps(loci) {
        if loci[i].sco_id == loci[j].sco_id {
            if loci[i].score > loci[j].score {
                removals.insert(j);
            } else {
                removals.insert(i);
            }
        }
    }
    removals
}
