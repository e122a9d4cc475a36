//! Classification of profile search hits and duplicate resolution.
//!
//! Hits are held in three rank maps (`complete` beats `very_large` beats
//! `fragment`) together with one inverse index per rank.  Every mutation
//! funnels through [`HmmerResults::remove_match`] so the forward maps and
//! the inverse indices can never drift apart.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::dataset::Cutoff;
use crate::hmmer::domtbl::DomtblRecord;

/// One classified hit of an ortholog profile on a predicted gene.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchInfo {
    /// Bitscore of the hit.
    pub bitscore: f64,
    /// Profile-matched length in amino acids.
    pub length: i64,
    /// Optional frame tag.
    pub frame: Option<String>,
}

/// Quality rank of a classified hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Rank {
    /// Matched length within two sigma of the expected length.
    #[strum(serialize = "complete")]
    Complete,
    /// Matched length more than two sigma above the expected length.
    #[strum(serialize = "very_large")]
    VeryLarge,
    /// Matched length more than two sigma below the expected length.
    #[strum(serialize = "fragment")]
    Fragment,
}

/// Forward map: ortholog id to gene id to classified hits.
pub type ScoMatches = IndexMap<String, IndexMap<String, Vec<MatchInfo>>>;

/// Inverse index: gene id to the ortholog ids currently claiming it.
/// An ortholog matched on both passes is listed twice.
pub type MatchedGenes = IndexMap<String, Vec<String>>;

/// Classified hits of the whole analysis, accumulated over both passes.
#[derive(Debug, Default)]
pub struct HmmerResults {
    /// Complete matches.
    pub complete: ScoMatches,
    /// Very large matches.
    pub very_large: ScoMatches,
    /// Fragmented matches.
    pub fragment: ScoMatches,
    /// Inverse index of `complete`.
    pub matched_genes_complete: MatchedGenes,
    /// Inverse index of `very_large`.
    pub matched_genes_vlarge: MatchedGenes,
    /// Inverse index of `fragment`.
    pub matched_genes_fragment: MatchedGenes,
    already_used: HashSet<String>,
}

impl HmmerResults {
    /// Reset the per-pass state.  Fragments are reclassified from scratch
    /// on the rerun while completes and very-larges accumulate.
    pub fn begin_pass(&mut self) {
        self.fragment.clear();
        self.matched_genes_fragment.clear();
        self.already_used.clear();
    }

    fn forward(&self, rank: Rank) -> &ScoMatches {
        match rank {
            Rank::Complete => &self.complete,
            Rank::VeryLarge => &self.very_large,
            Rank::Fragment => &self.fragment,
        }
    }

    fn forward_mut(&mut self, rank: Rank) -> &mut ScoMatches {
        match rank {
            Rank::Complete => &mut self.complete,
            Rank::VeryLarge => &mut self.very_large,
            Rank::Fragment => &mut self.fragment,
        }
    }

    /// Inverse index of the given rank.
    pub fn inverse(&self, rank: Rank) -> &MatchedGenes {
        match rank {
            Rank::Complete => &self.matched_genes_complete,
            Rank::VeryLarge => &self.matched_genes_vlarge,
            Rank::Fragment => &self.matched_genes_fragment,
        }
    }

    fn maps_mut(&mut self, rank: Rank) -> (&mut ScoMatches, &mut MatchedGenes) {
        match rank {
            Rank::Complete => (&mut self.complete, &mut self.matched_genes_complete),
            Rank::VeryLarge => (&mut self.very_large, &mut self.matched_genes_vlarge),
            Rank::Fragment => (&mut self.fragment, &mut self.matched_genes_fragment),
        }
    }

    /// Remove one (ortholog, gene) claim from a rank.  The forward map and
    /// the inverse index are updated in one step; entries left empty are
    /// dropped on both sides.
    pub fn remove_match(&mut self, rank: Rank, sco_id: &str, gene_id: &str) {
        let (forward, inverse) = self.maps_mut(rank);
        if let Some(genes) = forward.get_mut(sco_id) {
            genes.shift_remove(gene_id);
            if genes.is_empty() {
                forward.shift_remove(sco_id);
            }
        }
        if let Some(scos) = inverse.get_mut(gene_id) {
            scos.retain(|s| s != sco_id);
            if scos.is_empty() {
                inverse.shift_remove(gene_id);
            }
        }
    }

    /// Classify the hits of one ortholog into the rank maps.
    ///
    /// The comparison is a z-like score against the expected matched
    /// length: within two sigma is complete, above is very large, below is
    /// fragmented.
    pub fn sort_matches(
        &mut self,
        busco_query: &str,
        matched_records: &IndexMap<String, DomtblRecord>,
        cutoff: &Cutoff,
    ) {
        for (gene_id, record) in matched_records {
            let size = record.hmm_len as f64;
            let zeta = (cutoff.length - size) / cutoff.sigma;

            let rank = if (-2.0..=2.0).contains(&zeta) {
                Rank::Complete
            } else if zeta < -2.0 {
                Rank::VeryLarge
            } else {
                Rank::Fragment
            };

            let (forward, inverse) = self.maps_mut(rank);
            forward
                .entry(busco_query.to_string())
                .or_default()
                .entry(gene_id.clone())
                .or_default()
                .push(MatchInfo {
                    bitscore: record.score,
                    length: record.hmm_len,
                    frame: record.frame.clone(),
                });
            inverse
                .entry(gene_id.clone())
                .or_default()
                .push(busco_query.to_string());
        }
    }

    /// Remove all duplicate matches and any matches below 85% of the top
    /// match for each ortholog.
    pub fn filter(&mut self) {
        self.remove_duplicates();
        self.remove_low_scoring_matches(Rank::Complete);
        self.remove_low_scoring_matches(Rank::VeryLarge);
        self.remove_low_scoring_matches(Rank::Fragment);
    }

    /// Enforce inter-rank precedence and intra-rank gene uniqueness.
    pub fn remove_duplicates(&mut self) {
        self.update_used_gene_set(Rank::Complete);
        self.remove_lower_ranked_duplicates(Rank::VeryLarge);
        self.update_used_gene_set(Rank::VeryLarge);
        self.remove_lower_ranked_duplicates(Rank::Fragment);
        self.remove_remaining_duplicate_matches(Rank::Complete);
        self.remove_remaining_duplicate_matches(Rank::VeryLarge);
        self.remove_remaining_duplicate_matches(Rank::Fragment);
    }

    fn update_used_gene_set(&mut self, rank: Rank) {
        let genes: Vec<String> = self
            .forward(rank)
            .values()
            .flat_map(|matches| matches.keys().cloned())
            .collect();
        self.already_used.extend(genes);
    }

    /// Remove from `rank` every ortholog already placed in a higher rank
    /// and every gene already claimed by a higher-ranked match.
    fn remove_lower_ranked_duplicates(&mut self, rank: Rank) {
        let higher: HashSet<String> = match rank {
            Rank::VeryLarge => self.complete.keys().cloned().collect(),
            Rank::Fragment => self
                .complete
                .keys()
                .chain(self.very_large.keys())
                .cloned()
                .collect(),
            Rank::Complete => HashSet::new(),
        };

        let sco_ids: Vec<String> = self.forward(rank).keys().cloned().collect();
        for sco_id in sco_ids {
            let Some(matches) = self.forward(rank).get(&sco_id) else {
                continue;
            };
            let gene_ids: Vec<String> = matches.keys().cloned().collect();

            if higher.contains(&sco_id) {
                for gene_id in gene_ids {
                    self.remove_match(rank, &sco_id, &gene_id);
                }
                continue;
            }

            for gene_id in gene_ids {
                if self.already_used.contains(&gene_id) {
                    self.remove_match(rank, &sco_id, &gene_id);
                }
            }
        }
    }

    /// Within one rank, keep only the highest-scoring ortholog for every
    /// gene claimed by more than one.  An ortholog matched twice by the
    /// same gene (initial run and rerun) is not a duplicate.  Ties go to
    /// the first-seen ortholog.
    fn remove_remaining_duplicate_matches(&mut self, rank: Rank) {
        let inverse_snapshot: Vec<(String, Vec<String>)> = self
            .inverse(rank)
            .iter()
            .map(|(gene_id, scos)| (gene_id.clone(), scos.clone()))
            .collect();

        for (gene_id, scos) in inverse_snapshot {
            if scos.len() <= 1 {
                continue;
            }
            let mut unique: Vec<&String> = Vec::new();
            for sco in &scos {
                if !unique.contains(&sco) {
                    unique.push(sco);
                }
            }
            if unique.len() == 1 {
                continue;
            }

            let mut best_sco: Option<String> = None;
            let mut best_score = f64::NEG_INFINITY;
            for sco in &scos {
                let Some(matches) = self
                    .forward(rank)
                    .get(sco.as_str())
                    .and_then(|m| m.get(&gene_id))
                else {
                    continue;
                };
                for info in matches {
                    if info.bitscore > best_score {
                        best_score = info.bitscore;
                        best_sco = Some(sco.clone());
                    }
                }
            }
            let Some(winner) = best_sco else {
                continue;
            };

            let losers: Vec<String> = unique
                .into_iter()
                .filter(|sco| **sco != winner)
                .cloned()
                .collect();
            for sco in losers {
                self.remove_match(rank, &sco, &gene_id);
            }
        }
    }

    /// Within one rank, drop every match scoring below 85% of the
    /// ortholog's best match.
    pub fn remove_low_scoring_matches(&mut self, rank: Rank) {
        let sco_ids: Vec<String> = self.forward(rank).keys().cloned().collect();
        for sco_id in sco_ids {
            let Some(matches) = self.forward(rank).get(&sco_id) else {
                continue;
            };
            if matches.len() <= 1 {
                continue;
            }
            let max_bitscore = matches
                .values()
                .flatten()
                .map(|info| info.bitscore)
                .fold(f64::NEG_INFINITY, f64::max);

            let gene_ids: Vec<String> = matches.keys().cloned().collect();
            for gene_id in gene_ids {
                let mut emptied = false;
                if let Some(infos) = self
                    .forward_mut(rank)
                    .get_mut(&sco_id)
                    .and_then(|m| m.get_mut(&gene_id))
                {
                    infos.retain(|info| info.bitscore >= 0.85 * max_bitscore);
                    emptied = infos.is_empty();
                }
                if emptied {
                    self.remove_match(rank, &sco_id, &gene_id);
                }
            }
        }
    }

    /// Union of all three rank maps, used by the exon reconciler.
    pub fn merged(&self) -> ScoMatches {
        let mut merged: ScoMatches = IndexMap::new();
        for map in [&self.complete, &self.very_large, &self.fragment] {
            for (sco_id, genes) in map {
                merged
                    .entry(sco_id.clone())
                    .or_default()
                    .extend(genes.iter().map(|(g, m)| (g.clone(), m.clone())));
            }
        }
        merged
    }

    /// Final single-copy / multi-copy / fragmented partition.  Only the
    /// highest-scoring fragment of each ortholog is kept.
    pub fn consolidate(&self) -> Consolidated {
        let mut out = Consolidated::default();
        for rank_map in [&self.complete, &self.very_large] {
            for (sco_id, gene_matches) in rank_map {
                if gene_matches.len() == 1 {
                    out.single_copy.insert(sco_id.clone(), gene_matches.clone());
                } else {
                    out.multi_copy.insert(sco_id.clone(), gene_matches.clone());
                }
            }
        }
        for (sco_id, gene_matches) in &self.fragment {
            if gene_matches.len() > 1 {
                let best = best_scoring_gene(gene_matches);
                let mut only = IndexMap::new();
                only.insert(best.clone(), gene_matches[&best].clone());
                out.fragmented.insert(sco_id.clone(), only);
            } else {
                out.fragmented.insert(sco_id.clone(), gene_matches.clone());
            }
        }
        out
    }

    /// Orthologs with no hit in any rank.
    pub fn missing_ids(&self, cutoffs: &IndexMap<String, Cutoff>) -> Vec<String> {
        let missing: Vec<String> = cutoffs
            .keys()
            .filter(|id| {
                !self.complete.contains_key(*id)
                    && !self.very_large.contains_key(*id)
                    && !self.fragment.contains_key(*id)
            })
            .cloned()
            .collect();
        if missing.len() == cutoffs.len() {
            tracing::warn!(
                "No ortholog was matched. Make sure to check the log files if this is unexpected."
            );
        }
        missing
    }
}

/// Find the gene with the highest bitscore in a per-ortholog match map.
fn best_scoring_gene(gene_matches: &IndexMap<String, Vec<MatchInfo>>) -> String {
    let mut best_gene = None;
    let mut best_score = f64::NEG_INFINITY;
    for (gene_id, infos) in gene_matches {
        for info in infos {
            if info.bitscore > best_score {
                best_score = info.bitscore;
                best_gene = Some(gene_id.clone());
            }
        }
    }
    best_gene.unwrap_or_default()
}

/// Final partition of orthologs after consolidation.
#[derive(Debug, Default)]
pub struct Consolidated {
    /// Orthologs matched by exactly one gene.
    pub single_copy: ScoMatches,
    /// Orthologs matched by more than one gene.
    pub multi_copy: ScoMatches,
    /// Orthologs with fragmented matches only.
    pub fragmented: ScoMatches,
}

#[cfg(test)]
mod test {
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;

    use crate::dataset::Cutoff;
    use crate::hmmer::domtbl::DomtblRecord;

    use super::{HmmerResults, Rank};

    fn cutoff(score: f64, length: f64, sigma: f64) -> Cutoff {
        Cutoff {
            score,
            length,
            sigma,
        }
    }

    fn record(hmm_len: i64, score: f64) -> DomtblRecord {
        DomtblRecord {
            tlen: hmm_len,
            hmm_len,
            env_coords: vec![(1, hmm_len)],
            score,
            frame: None,
        }
    }

    fn records(entries: &[(&str, i64, f64)]) -> IndexMap<String, DomtblRecord> {
        entries
            .iter()
            .map(|(gene, hmm_len, score)| (gene.to_string(), record(*hmm_len, *score)))
            .collect()
    }

    /// The inverse index must mirror the forward map of every rank.
    fn assert_consistent(results: &HmmerResults) {
        for rank in [Rank::Complete, Rank::VeryLarge, Rank::Fragment] {
            let forward = match rank {
                Rank::Complete => &results.complete,
                Rank::VeryLarge => &results.very_large,
                Rank::Fragment => &results.fragment,
            };
            for (sco_id, genes) in forward {
                for gene_id in genes.keys() {
                    assert!(
                        results.inverse(rank)[gene_id].contains(sco_id),
                        "missing inverse entry for {}/{} in {}",
                        sco_id,
                        gene_id,
                        rank
                    );
                }
            }
            for (gene_id, scos) in results.inverse(rank) {
                for sco_id in scos {
                    assert!(
                        forward
                            .get(sco_id)
                            .map(|m| m.contains_key(gene_id))
                            .unwrap_or(false),
                        "stale inverse entry for {}/{} in {}",
                        sco_id,
                        gene_id,
                        rank
                    );
                }
            }
        }
    }

    #[rstest::rstest]
    #[case(80, Rank::Complete)] // zeta = 2
    #[case(120, Rank::Complete)] // zeta = -2
    #[case(79, Rank::Fragment)] // zeta = 2.1
    #[case(121, Rank::VeryLarge)] // zeta = -2.1
    fn sort_matches_classifies_by_zeta(#[case] hmm_len: i64, #[case] expected: Rank) {
        let mut results = HmmerResults::default();
        results.sort_matches(
            "10at123",
            &records(&[("chr1:1-100", hmm_len, 200.0)]),
            &cutoff(50.0, 100.0, 10.0),
        );

        let forward = match expected {
            Rank::Complete => &results.complete,
            Rank::VeryLarge => &results.very_large,
            Rank::Fragment => &results.fragment,
        };
        assert!(forward["10at123"].contains_key("chr1:1-100"));
        assert_consistent(&results);
    }

    #[test]
    fn remove_duplicates_enforces_inter_rank_precedence() {
        let mut results = HmmerResults::default();
        let c = cutoff(50.0, 100.0, 10.0);
        // 10at123 is complete via one gene and fragmented via another
        results.sort_matches("10at123", &records(&[("chr1:1-100", 100, 200.0)]), &c);
        results.sort_matches("10at123", &records(&[("chr2:1-60", 30, 80.0)]), &c);

        results.remove_duplicates();

        assert!(results.complete.contains_key("10at123"));
        assert!(!results.fragment.contains_key("10at123"));
        assert!(!results.matched_genes_fragment.contains_key("chr2:1-60"));
        assert_consistent(&results);
    }

    #[test]
    fn remove_duplicates_purges_genes_used_by_higher_rank() {
        let mut results = HmmerResults::default();
        let c = cutoff(50.0, 100.0, 10.0);
        // the same gene is complete for 10at123 and very large for 20at123
        results.sort_matches("10at123", &records(&[("chr1:1-100", 100, 200.0)]), &c);
        results.sort_matches("20at123", &records(&[("chr1:1-100", 130, 90.0)]), &c);

        results.remove_duplicates();

        assert!(results.complete.contains_key("10at123"));
        assert!(!results.very_large.contains_key("20at123"));
        assert_consistent(&results);
    }

    #[test]
    fn remove_duplicates_keeps_highest_scoring_claim() {
        let mut results = HmmerResults::default();
        let c = cutoff(50.0, 100.0, 10.0);
        // scenario: two orthologs claim the same gene, both complete
        results.sort_matches("10at123", &records(&[("chr1:1-100", 100, 300.0)]), &c);
        results.sort_matches("20at123", &records(&[("chr1:1-100", 100, 150.0)]), &c);

        results.remove_duplicates();

        assert!(results.complete.contains_key("10at123"));
        assert!(!results.complete.contains_key("20at123"));
        assert_eq!(
            vec![String::from("10at123")],
            results.matched_genes_complete["chr1:1-100"]
        );
        assert_consistent(&results);
    }

    #[test]
    fn remove_duplicates_tie_goes_to_first_seen() {
        let mut results = HmmerResults::default();
        let c = cutoff(50.0, 100.0, 10.0);
        results.sort_matches("20at123", &records(&[("chr1:1-100", 100, 300.0)]), &c);
        results.sort_matches("10at123", &records(&[("chr1:1-100", 100, 300.0)]), &c);

        results.remove_duplicates();

        assert!(results.complete.contains_key("20at123"));
        assert!(!results.complete.contains_key("10at123"));
        assert_consistent(&results);
    }

    #[test]
    fn remove_duplicates_keeps_same_ortholog_matched_on_both_passes() {
        let mut results = HmmerResults::default();
        let c = cutoff(50.0, 100.0, 10.0);
        // the same (ortholog, gene) pair classified on the initial run and
        // again on the rerun
        results.sort_matches("10at123", &records(&[("chr1:1-100", 100, 200.0)]), &c);
        results.sort_matches("10at123", &records(&[("chr1:1-100", 100, 210.0)]), &c);

        results.remove_duplicates();

        assert_eq!(2, results.complete["10at123"]["chr1:1-100"].len());
        assert_consistent(&results);
    }

    #[test]
    fn remove_duplicates_is_idempotent() {
        let mut results = HmmerResults::default();
        let c = cutoff(50.0, 100.0, 10.0);
        results.sort_matches("10at123", &records(&[("chr1:1-100", 100, 300.0)]), &c);
        results.sort_matches("20at123", &records(&[("chr1:1-100", 100, 150.0)]), &c);
        results.sort_matches("20at123", &records(&[("chr2:1-60", 30, 80.0)]), &c);

        results.remove_duplicates();
        let complete = results.complete.clone();
        let fragment = results.fragment.clone();
        let inverse = results.matched_genes_complete.clone();

        results.remove_duplicates();

        assert_eq!(complete, results.complete);
        assert_eq!(fragment, results.fragment);
        assert_eq!(inverse, results.matched_genes_complete);
        assert_consistent(&results);
    }

    #[test]
    fn remove_low_scoring_matches_applies_85_percent_rule() {
        let mut results = HmmerResults::default();
        let c = cutoff(50.0, 100.0, 10.0);
        results.sort_matches(
            "10at123",
            &records(&[
                ("chr1:1-100", 100, 200.0),
                ("chr2:1-100", 100, 180.0),
                ("chr3:1-100", 100, 100.0),
            ]),
            &c,
        );

        results.remove_low_scoring_matches(Rank::Complete);

        let matches = &results.complete["10at123"];
        assert_eq!(2, matches.len());
        let min_kept = matches
            .values()
            .flatten()
            .map(|m| m.bitscore)
            .fold(f64::INFINITY, f64::min);
        assert!(min_kept >= 0.85 * 200.0);
        assert!(!results.matched_genes_complete.contains_key("chr3:1-100"));
        assert_consistent(&results);
    }

    #[test]
    fn consolidate_partitions_single_and_multi_copy() {
        let mut results = HmmerResults::default();
        let c = cutoff(50.0, 100.0, 1.0);
        results.sort_matches("10at123", &records(&[("chr1:1-100", 99, 200.0)]), &c);
        results.sort_matches(
            "20at123",
            &records(&[("chr2:1-100", 99, 200.0), ("chr3:1-100", 99, 200.0)]),
            &c,
        );
        results.sort_matches(
            "30at123",
            &records(&[("chr4:1-60", 30, 80.0), ("chr5:1-60", 30, 90.0)]),
            &c,
        );

        results.filter();
        let consolidated = results.consolidate();

        assert_eq!(
            vec![String::from("10at123")],
            consolidated.single_copy.keys().cloned().collect::<Vec<_>>()
        );
        assert_eq!(
            vec![String::from("20at123")],
            consolidated.multi_copy.keys().cloned().collect::<Vec<_>>()
        );
        // only the best fragment survives consolidation
        assert_eq!(
            vec![String::from("chr5:1-60")],
            consolidated.fragmented["30at123"]
                .keys()
                .cloned()
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn missing_ids_lists_unmatched_orthologs() {
        let mut results = HmmerResults::default();
        let c = cutoff(50.0, 100.0, 1.0);
        let cutoffs: IndexMap<String, Cutoff> = [
            (String::from("10at123"), c.clone()),
            (String::from("20at123"), c.clone()),
        ]
        .into_iter()
        .collect();
        results.sort_matches("10at123", &records(&[("chr1:1-100", 99, 200.0)]), &c);

        assert_eq!(vec![String::from("20at123")], results.missing_ids(&cutoffs));
    }

    #[test]
    fn begin_pass_resets_fragments_only() {
        let mut results = HmmerResults::default();
        let c = cutoff(50.0, 100.0, 1.0);
        results.sort_matches("10at123", &records(&[("chr1:1-100", 99, 200.0)]), &c);
        results.sort_matches("20at123", &records(&[("chr2:1-60", 30, 80.0)]), &c);

        results.begin_pass();

        assert!(results.complete.contains_key("10at123"));
        assert!(results.fragment.is_empty());
        assert!(results.matched_genes_fragment.is_empty());
    }
}
