//! Driver for the external Metaeuk gene predictor.

use std::path::PathBuf;

use bio::io::fasta;
use indexmap::IndexMap;

use crate::common::RunContext;
use crate::dataset::refseq;
use crate::err;
use crate::metaeuk::header::GeneHeader;
use crate::metaeuk::overlap::PredictedLocus;

pub mod header;
pub mod overlap;

/// Name of the predictor executable.
pub const CMD: &str = "metaeuk";

/// Parameters the predictor accepts as extra `--key=value` arguments.
pub const ACCEPTED_PARAMETERS: &[&str] = &[
    "comp-bias-corr",
    "add-self-matches",
    "seed-sub-mat",
    "s",
    "k",
    "k-score",
    "alph-size",
    "max-seqs",
    "split",
    "split-mode",
    "split-memory-limit",
    "diag-score",
    "exact-kmer-matching",
    "mask",
    "mask-lower-case",
    "min-ungapped-score",
    "spaced-kmer-mode",
    "spaced-kmer-pattern",
    "local-tmp",
    "disk-space-limit",
    "a",
    "alignment-mode",
    "wrapped-scoring",
    "e",
    "min-seq-id",
    "min-aln-len",
    "seq-id-mode",
    "alt-ali",
    "c",
    "cov-mode",
    "realign",
    "max-rejected",
    "max-accept",
    "score-bias",
    "gap-open",
    "gap-extend",
    "zdrop",
    "pca",
    "pcb",
    "mask-profile",
    "e-profile",
    "wg",
    "filter-msa",
    "max-seq-id",
    "qid",
    "qsc",
    "cov",
    "diff",
    "num-iterations",
    "slice-search",
    "rescore-mode",
    "allow-deletion",
    "min-length",
    "max-length",
    "max-gaps",
    "contig-start-mode",
    "contig-end-mode",
    "orf-start-mode",
    "forward-frames",
    "reverse-frames",
    "translation-table",
    "translate",
    "use-all-table-starts",
    "id-offset",
    "add-orf-stop",
    "search-type",
    "start-sens",
    "sens-steps",
    "metaeuk-eval",
    "metaeuk-tcov",
    "min-intron",
    "min-exon-aa",
    "max-overlap",
    "set-gap-open",
    "set-gap-extend",
    "overlap",
    "protein",
    "target-key",
    "reverse-fragments",
    "sub-mat",
    "db-load-mode",
    "force-reuse",
    "remove-tmp-files",
    "filter-hits",
    "sort-results",
    "omit-consensus",
    "create-lookup",
    "chain-alignments",
    "merge-query",
    "strand",
    "compressed",
    "v",
    "max-intron",
    "max-seq-len",
];

/// The predictor options with pass-dependent defaults, after any user
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetParams {
    /// Upper bound on intron length.
    pub max_intron: String,
    /// Upper bound on predicted gene span.
    pub max_seq_len: String,
    /// Minimum exon size in amino acids.
    pub min_exon_aa: String,
    /// Predictor-internal overlap tolerance.
    pub max_overlap: String,
    /// Minimum intron length.
    pub min_intron: String,
    /// Overlap flag; fixed.
    pub overlap: String,
    /// Whether the user supplied the sensitivity flag themselves.
    pub s_set: bool,
}

impl PresetParams {
    /// Defaults for the given pass; the rerun relaxes the exon and intron
    /// bounds to recover fragmented predictions.
    pub fn for_pass(run_number: u32, ctx: &RunContext) -> Self {
        let (min_exon_aa, max_overlap, min_intron) = if run_number > 1 {
            ("5", "5", "1")
        } else {
            ("15", "15", "5")
        };
        PresetParams {
            max_intron: ctx.max_intron.to_string(),
            max_seq_len: ctx.max_seq_len.to_string(),
            min_exon_aa: min_exon_aa.to_string(),
            max_overlap: max_overlap.to_string(),
            min_intron: min_intron.to_string(),
            overlap: String::from("1"),
            s_set: false,
        }
    }
}

/// Parse user-supplied extra predictor parameters.
///
/// Accepts comma- or space-joined `--key=value` pairs.  Keys must be in
/// [`ACCEPTED_PARAMETERS`]; unknown keys are skipped with a warning.  The
/// six preset options override `presets` instead of being forwarded.  On
/// malformed input one warning is logged and everything, overrides
/// included, is discarded.
pub fn parse_extra_params(raw: &str, presets: &mut PresetParams) -> Vec<(String, String)> {
    let cleaned = raw.replace(',', " ");
    let cleaned = cleaned.trim_matches(|c| c == '"' || c == '\'' || c == ' ');
    if cleaned.is_empty() {
        return Vec::new();
    }

    let malformed = || {
        tracing::warn!(
            "Extra predictor parameters are not correctly formatted. Please enter them as \
            \"--param1=value1 --param2=value2\" etc. Proceeding without additional parameters."
        );
        Vec::new()
    };

    if !cleaned.starts_with('-') {
        return malformed();
    }

    let mut candidate = presets.clone();
    let mut accepted = Vec::new();
    for kv in cleaned.split(" -") {
        let kv = kv.trim_matches(|c| c == '-' || c == ' ');
        let parts: Vec<&str> = kv.split('=').collect();
        let &[key, value] = parts.as_slice() else {
            return malformed();
        };
        let (key, value) = (key.trim(), value.trim());
        if !ACCEPTED_PARAMETERS.contains(&key) {
            tracing::warn!("{} is not an accepted parameter for the predictor.", key);
            continue;
        }
        match key {
            "min-exon-aa" => candidate.min_exon_aa = value.to_string(),
            "max-intron" => candidate.max_intron = value.to_string(),
            "max-seq-len" => candidate.max_seq_len = value.to_string(),
            "max-overlap" => candidate.max_overlap = value.to_string(),
            "min-intron" => candidate.min_intron = value.to_string(),
            "overlap" => candidate.overlap = value.to_string(),
            _ => {
                if key == "s" {
                    candidate.s_set = true;
                }
                accepted.push((key.to_string(), value.to_string()));
            }
        }
    }

    *presets = candidate;
    accepted
}

/// Driver for the external gene predictor.
///
/// Owns the output folders, the per-pass option set, and the bookkeeping of
/// produced files across both passes.
#[derive(Debug)]
pub struct MetaeukRunner {
    output_folder: PathBuf,
    initial_results_folder: PathBuf,
    rerun_results_folder: PathBuf,
    tmp_folder: PathBuf,
    run_number: u32,
    refseq_db: PathBuf,
    presets: PresetParams,
    extra_params: Vec<(String, String)>,
    output_basename: PathBuf,
    /// Header map files of all passes configured so far.
    pub headers_files: Vec<PathBuf>,
    /// Filtered protein files of all passes configured so far.
    pub pred_protein_mod_files: Vec<PathBuf>,
}

impl MetaeukRunner {
    /// Create the runner and its output folders under the run folder.
    pub fn new(ctx: &RunContext) -> Result<Self, anyhow::Error> {
        let output_folder = ctx.path_run.join("metaeuk_output");
        let initial_results_folder = output_folder.join("initial_results");
        let rerun_results_folder = output_folder.join("rerun_results");
        let tmp_folder = output_folder.join("tmp");
        for dir in [&output_folder, &initial_results_folder, &rerun_results_folder] {
            std::fs::create_dir_all(dir)
                .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", dir, e))?;
        }

        Ok(MetaeukRunner {
            output_folder,
            initial_results_folder,
            rerun_results_folder,
            tmp_folder,
            run_number: 0,
            refseq_db: PathBuf::new(),
            presets: PresetParams::for_pass(1, ctx),
            extra_params: Vec::new(),
            output_basename: PathBuf::new(),
            headers_files: Vec::new(),
            pred_protein_mod_files: Vec::new(),
        })
    }

    /// Probe the predictor version.
    pub fn check_tool(&self) -> Result<String, anyhow::Error> {
        let output = std::process::Command::new(CMD)
            .arg("-h")
            .output()
            .map_err(|e| err::Error::PredictorAbsent {
                tool: CMD.to_string(),
                reason: e.to_string(),
            })?;
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        text.lines()
            .find_map(|line| {
                line.trim()
                    .strip_prefix("metaeuk Version:")
                    .map(|rest| rest.trim().to_string())
            })
            .ok_or_else(|| {
                err::Error::PredictorAbsent {
                    tool: CMD.to_string(),
                    reason: String::from("could not determine version"),
                }
                .into()
            })
    }

    /// Configure the next pass: output basename, reference set, presets,
    /// extra parameters.
    ///
    /// On the rerun, the reference set is pruned down to `incomplete`.
    pub fn configure_run(
        &mut self,
        ctx: &RunContext,
        incomplete: Option<&[String]>,
    ) -> Result<(), anyhow::Error> {
        self.run_number += 1;
        let assembly_name = ctx
            .path_assembly
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("invalid assembly path {:?}", &ctx.path_assembly))?;

        if self.run_number > 1 {
            self.output_basename = self.rerun_results_folder.join(assembly_name);
            let rerun_db = self.output_folder.join("refseq_db_rerun.faa");
            refseq::build_rerun_refseq(&self.refseq_db, &rerun_db, incomplete.unwrap_or(&[]))?;
            self.refseq_db = rerun_db;
        } else {
            self.output_basename = self.initial_results_folder.join(assembly_name);
            let gzip_refseq = ctx.path_lineage.join("refseq_db.faa.gz");
            self.refseq_db = refseq::decompress_refseq(&gzip_refseq)?;
        }

        let mut presets = PresetParams::for_pass(self.run_number, ctx);
        let extra_raw = if self.run_number == 1 {
            ctx.metaeuk_parameters.as_deref()
        } else {
            ctx.metaeuk_rerun_parameters.as_deref()
        };
        self.extra_params = match extra_raw {
            Some(raw) if !raw.is_empty() => {
                tracing::info!("Additional parameters for the predictor are {}", raw);
                parse_extra_params(raw, &mut presets)
            }
            _ => Vec::new(),
        };
        self.presets = presets;

        std::fs::create_dir_all(&self.tmp_folder)
            .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", &self.tmp_folder, e))?;

        self.headers_files.push(self.headers_file());
        self.pred_protein_mod_files
            .push(self.pred_protein_seqs_modified());

        Ok(())
    }

    /// Assemble the predictor argument vector for the configured pass.
    pub fn build_args(&self, ctx: &RunContext) -> Vec<String> {
        let mut args = vec![
            String::from("easy-predict"),
            String::from("--threads"),
            ctx.cpu.to_string(),
            ctx.path_assembly.display().to_string(),
            self.refseq_db.display().to_string(),
            self.output_basename.display().to_string(),
            self.tmp_folder.display().to_string(),
            String::from("--max-intron"),
            self.presets.max_intron.clone(),
            String::from("--max-seq-len"),
            self.presets.max_seq_len.clone(),
            String::from("--min-exon-aa"),
            self.presets.min_exon_aa.clone(),
            String::from("--max-overlap"),
            self.presets.max_overlap.clone(),
            String::from("--min-intron"),
            self.presets.min_intron.clone(),
            String::from("--overlap"),
            self.presets.overlap.clone(),
        ];
        if self.run_number > 1 && !self.presets.s_set {
            args.push(String::from("-s"));
            args.push(String::from("6"));
        }
        for (key, value) in &self.extra_params {
            let dashes = if key.len() == 1 { "-" } else { "--" };
            args.push(format!("{}{}", dashes, key));
            args.push(value.clone());
        }
        args
    }

    /// Run the configured pass.
    pub fn run(&self, ctx: &RunContext) -> Result<(), anyhow::Error> {
        if self.run_number == 0 {
            anyhow::bail!("predictor run requested before configuration");
        }
        let args = self.build_args(ctx);
        tracing::info!("Running {} {}", CMD, args.join(" "));
        let output = std::process::Command::new(CMD)
            .args(&args)
            .output()
            .map_err(|e| err::Error::PredictorAbsent {
                tool: CMD.to_string(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                CMD,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    /// Whether the configured pass left complete outputs behind from a
    /// previous invocation.
    pub fn previous_run_complete(&self) -> bool {
        self.headers_file().exists() && self.pred_protein_seqs().exists()
    }

    /// Header map file of the configured pass.
    pub fn headers_file(&self) -> PathBuf {
        PathBuf::from(format!("{}.headersMap.tsv", self.output_basename.display()))
    }

    /// Codon sequence file of the configured pass.
    pub fn codon_file(&self) -> PathBuf {
        PathBuf::from(format!("{}.codon.fas", self.output_basename.display()))
    }

    /// Predicted protein file of the configured pass.
    pub fn pred_protein_seqs(&self) -> PathBuf {
        PathBuf::from(format!("{}.fas", self.output_basename.display()))
    }

    /// Filtered predicted protein file of the configured pass.
    pub fn pred_protein_seqs_modified(&self) -> PathBuf {
        PathBuf::from(format!("{}.modified.fas", self.output_basename.display()))
    }

    /// Rewrite the predicted protein file: rename every record to its gene
    /// id and drop the lower-scoring of any two same-ortholog overlapping
    /// predictions.  Returns the kept records keyed by gene id.
    pub fn edit_protein_file(
        &self,
    ) -> Result<IndexMap<String, fasta::Record>, anyhow::Error> {
        let path = self.pred_protein_seqs();
        if !path.exists() {
            return Err(err::Error::PredictorProducedNothing(path).into());
        }

        let reader = fasta::Reader::from_file(&path)
            .map_err(|e| anyhow::anyhow!("could not open {:?}: {}", &path, e))?;
        let mut records = Vec::new();
        let mut loci = Vec::new();
        for record in reader.records() {
            let record = record?;
            let head =
                GeneHeader::parse(record.id()).map_err(|_| err::Error::HeaderMalformed {
                    path: path.clone(),
                    line: record.id().to_string(),
                })?;
            loci.push(PredictedLocus {
                sco_id: head.sco_id(),
                contig: head.c_acc.clone(),
                start: head.low,
                stop: head.high,
                strand: head.strand,
                score: head.bitscore,
            });
            records.push((head.gene_id(), record));
        }

        let removals = overlap::same_sco_overlap_removals(&loci);
        let mut writer = fasta::Writer::to_file(self.pred_protein_seqs_modified())
            .map_err(|e| anyhow::anyhow!("could not create modified protein file: {}", e))?;
        let mut sequences = IndexMap::new();
        for (i, (gene_id, record)) in records.into_iter().enumerate() {
            if removals.contains(&i) {
                continue;
            }
            writer.write(&gene_id, None, record.seq())?;
            sequences.insert(
                gene_id.clone(),
                fasta::Record::with_attrs(&gene_id, None, record.seq()),
            );
        }

        Ok(sequences)
    }

    /// Load the codon sequences of the configured pass, keyed by gene id.
    /// A missing codon file yields an empty map.
    pub fn load_codon_sequences(
        &self,
    ) -> Result<IndexMap<String, fasta::Record>, anyhow::Error> {
        let path = self.codon_file();
        let mut sequences = IndexMap::new();
        if !path.exists() {
            return Ok(sequences);
        }
        let reader = fasta::Reader::from_file(&path)
            .map_err(|e| anyhow::anyhow!("could not open {:?}: {}", &path, e))?;
        for record in reader.records() {
            let record = record?;
            let head =
                GeneHeader::parse(record.id()).map_err(|_| err::Error::HeaderMalformed {
                    path: path.clone(),
                    line: record.id().to_string(),
                })?;
            let gene_id = head.gene_id();
            sequences.insert(
                gene_id.clone(),
                fasta::Record::with_attrs(&gene_id, None, record.seq()),
            );
        }
        Ok(sequences)
    }

    /// Concatenate the filtered protein files of both passes.  When the
    /// rerun produced nothing, the initial-run file stands in for the
    /// combination.
    pub fn combine_run_results(&self) -> Result<PathBuf, anyhow::Error> {
        let combined = self.output_folder.join("combined_pred_proteins.fas");
        if self.pred_protein_mod_files.iter().any(|p| !p.exists()) {
            let first = self
                .pred_protein_mod_files
                .first()
                .ok_or_else(|| anyhow::anyhow!("no predictor pass was run"))?;
            tracing::debug!(
                "rerun protein file missing, using {:?} as combined output",
                first
            );
            return Ok(first.clone());
        }
        let mut out = std::fs::File::create(&combined)
            .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", &combined, e))?;
        for path in &self.pred_protein_mod_files {
            let mut file = std::fs::File::open(path)?;
            std::io::copy(&mut file, &mut out)?;
        }
        Ok(combined)
    }

    /// Drop the predictor scratch directory.
    pub fn remove_tmp_files(&self) -> Result<(), anyhow::Error> {
        if self.tmp_folder.exists() {
            std::fs::remove_dir_all(&self.tmp_folder)?;
        }
        Ok(())
    }
}
