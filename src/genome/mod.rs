//! Implementation of the `genome run` subcommand.

use std::path::PathBuf;

use bio::io::fasta;
use clap::Parser;
use indexmap::IndexMap;

use crate::common::{self, RunContext, RunMode, TaxDomain};
use crate::dataset::{self, Cutoff, DatasetMeta, LinkInfo};
use crate::err;
use crate::hmmer::results::HmmerResults;
use crate::hmmer::{domtbl, HmmerRunner};
use crate::metaeuk::header::{self, GeneDetails};
use crate::metaeuk::MetaeukRunner;
use crate::report::{self, ReportWriter};

pub mod reconcile;

/// Command line arguments for `genome run` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Assess assembly completeness", long_about = None)]
pub struct Args {
    /// Path to the input assembly FASTA.
    #[arg(long, required = true)]
    pub path_assembly: PathBuf,
    /// Path to the lineage dataset directory.
    #[arg(long, required = true)]
    pub path_lineage: PathBuf,
    /// Path to the run folder receiving all outputs.
    #[arg(long, required = true)]
    pub path_out: PathBuf,

    /// Analysis mode to assume.
    #[arg(long, value_enum, default_value_t = RunMode::Genome)]
    pub mode: RunMode,
    /// Taxonomic domain of the lineage dataset.
    #[arg(long, value_enum, default_value_t = TaxDomain::Eukaryota)]
    pub domain: TaxDomain,
    /// Number of worker threads for external jobs.
    #[arg(long, default_value_t = 1)]
    pub cpu: usize,
    /// E-value threshold handed to the profile search.
    #[arg(long, default_value_t = 1e-3)]
    pub evalue: f64,
    /// Candidate-region limit; only the alternate predictor path uses it.
    #[arg(long, default_value_t = 3)]
    pub limit: usize,
    /// Upper bound on intron length handed to the gene predictor.
    #[arg(long, default_value_t = 500_000)]
    pub max_intron: u64,
    /// Upper bound on predicted gene span handed to the gene predictor.
    #[arg(long, default_value_t = 20_000_000)]
    pub max_seq_len: u64,
    /// Extra predictor parameters for the initial run (`--key=value` list).
    #[arg(long)]
    pub metaeuk_parameters: Option<String>,
    /// Extra predictor parameters for the rerun (`--key=value` list).
    #[arg(long)]
    pub metaeuk_rerun_parameters: Option<String>,
    /// Dataset release tag used to locate the links file.
    #[arg(long, default_value = "odb10")]
    pub datasets_version: String,
    /// Reuse checkpointed outputs from a previous run.
    #[arg(long)]
    pub restart: bool,
    /// Placement file versions to report (auto-lineage runs).
    #[arg(long)]
    pub placement_files: Vec<String>,
}

/// Main entry point for the `genome run` command.
pub fn run(args_common: &common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);
    tracing::info!(
        "Start time: {}",
        chrono::Local::now().format("%m/%d/%Y %H:%M:%S")
    );

    if args.cpu > 1 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.cpu)
            .build_global()
            .map_err(|e| anyhow::anyhow!("building global Rayon thread pool failed: {}", e))?;
    }

    let ctx = RunContext {
        path_assembly: args.path_assembly.clone(),
        path_lineage: args.path_lineage.clone(),
        path_run: args.path_out.clone(),
        mode: args.mode,
        domain: args.domain,
        cpu: args.cpu,
        evalue: args.evalue,
        limit: args.limit,
        max_intron: args.max_intron,
        max_seq_len: args.max_seq_len,
        metaeuk_parameters: args.metaeuk_parameters.clone(),
        metaeuk_rerun_parameters: args.metaeuk_rerun_parameters.clone(),
        datasets_version: args.datasets_version.clone(),
        restart: args.restart,
        placement_files: args.placement_files.clone(),
    };
    if ctx.limit != 3 {
        tracing::debug!(
            "candidate-region limit {} only applies to the alternate predictor path",
            ctx.limit
        );
    }

    let mut analysis = select_strategy(ctx)?;
    analysis.init_tools()?;
    analysis.run_analysis()?;
    analysis.cleanup()?;

    Ok(())
}

/// Capability implemented by each (mode, domain) analysis variant.
pub trait AnalysisStrategy {
    /// Probe the external tools and record their versions.
    fn init_tools(&mut self) -> Result<(), anyhow::Error>;
    /// Run the full analysis and write the outputs.
    fn run_analysis(&mut self) -> Result<(), anyhow::Error>;
    /// Remove scratch data after a successful run.
    fn cleanup(&mut self) -> Result<(), anyhow::Error>;
}

/// Select the analysis variant for the configured mode and domain.
pub fn select_strategy(ctx: RunContext) -> Result<Box<dyn AnalysisStrategy>, anyhow::Error> {
    match (ctx.mode, ctx.domain) {
        (RunMode::Genome, TaxDomain::Eukaryota) => {
            Ok(Box::new(EukaryoteGenomeAnalysis::new(ctx)?))
        }
        (mode, domain) => anyhow::bail!(
            "mode {} with domain {} is not supported by this build",
            mode,
            domain
        ),
    }
}

/// The eukaryote/genome analysis: a two-pass predictor pipeline with
/// per-pass profile search, classification and filtering, followed by exon
/// reconciliation and output writing.
pub struct EukaryoteGenomeAnalysis {
    ctx: RunContext,
    cutoffs: IndexMap<String, Cutoff>,
    meta: DatasetMeta,
    links: IndexMap<String, LinkInfo>,
    metaeuk: MetaeukRunner,
    hmmer: HmmerRunner,
    results: HmmerResults,
    tool_versions: IndexMap<String, String>,
    gene_details: IndexMap<String, Vec<GeneDetails>>,
    sequences_aa: IndexMap<String, fasta::Record>,
    sequences_nt: IndexMap<String, fasta::Record>,
}

impl EukaryoteGenomeAnalysis {
    /// Load the dataset and set up the tool runners.
    pub fn new(ctx: RunContext) -> Result<Self, anyhow::Error> {
        std::fs::create_dir_all(&ctx.path_run)
            .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", &ctx.path_run, e))?;
        let cutoffs = dataset::load_cutoffs(&ctx.path_lineage)?;
        let meta = dataset::load_meta(&ctx.path_lineage)?;
        let links = dataset::load_links(&ctx.path_lineage, &ctx.datasets_version)?;
        let metaeuk = MetaeukRunner::new(&ctx)?;
        let hmmer = HmmerRunner::new(&ctx)?;

        Ok(EukaryoteGenomeAnalysis {
            ctx,
            cutoffs,
            meta,
            links,
            metaeuk,
            hmmer,
            results: HmmerResults::default(),
            tool_versions: IndexMap::new(),
            gene_details: IndexMap::new(),
            sequences_aa: IndexMap::new(),
            sequences_nt: IndexMap::new(),
        })
    }

    /// Run one predictor pass and ingest its outputs.
    fn run_predictor_pass(&mut self, incomplete: Option<&[String]>) -> Result<(), anyhow::Error> {
        self.metaeuk.configure_run(&self.ctx, incomplete)?;
        if self.ctx.restart && self.metaeuk.previous_run_complete() {
            tracing::info!("Skipping predictor run as it has already completed");
        } else {
            self.ctx.restart = false;
            self.metaeuk.run(&self.ctx)?;
        }

        let sequences = self.metaeuk.edit_protein_file()?;
        self.sequences_aa.extend(sequences);
        self.sequences_nt
            .extend(self.metaeuk.load_codon_sequences()?);
        let details = header::load_gene_details(&self.metaeuk.headers_file())?;
        for (gene_id, entries) in details {
            self.gene_details.insert(gene_id, entries);
        }

        Ok(())
    }

    /// Run one profile search pass over `targets` and fold the results
    /// into the classification.
    fn run_profile_search_pass(&mut self, targets: &[String]) -> Result<(), anyhow::Error> {
        let results_dir = self.hmmer.begin_pass()?.to_path_buf();
        let proteins = self.metaeuk.pred_protein_seqs_modified();

        let all_present = !targets.is_empty()
            && targets
                .iter()
                .filter(|id| self.cutoffs.contains_key(id.as_str()))
                .all(|id| results_dir.join(format!("{}.out", id)).exists());
        if self.ctx.restart && all_present {
            tracing::info!("Skipping profile search as its output is already present");
        } else {
            self.ctx.restart = false;
            self.hmmer
                .run(&self.ctx, &proteins, targets, &self.cutoffs)?;
        }

        self.results.begin_pass();
        for busco_id in targets {
            let Some(cutoff) = self.cutoffs.get(busco_id) else {
                continue;
            };
            let path = results_dir.join(format!("{}.out", busco_id));
            if !path.exists() {
                continue;
            }
            let records = domtbl::parse_domtbl(&path, cutoff.score)?;
            self.results.sort_matches(busco_id, &records, cutoff);
        }
        self.results.filter();

        Ok(())
    }

    fn is_no_genes(error: &anyhow::Error) -> bool {
        matches!(
            error.downcast_ref::<err::Error>(),
            Some(err::Error::PredictorProducedNothing(_))
        )
    }
}

impl AnalysisStrategy for EukaryoteGenomeAnalysis {
    fn init_tools(&mut self) -> Result<(), anyhow::Error> {
        let metaeuk_version = self.metaeuk.check_tool()?;
        tracing::debug!("metaeuk version {}", &metaeuk_version);
        self.tool_versions
            .insert(String::from("metaeuk"), metaeuk_version);

        let hmmer_version = self.hmmer.check_tool()?;
        tracing::debug!("hmmsearch version {}", hmmer_version);
        self.tool_versions
            .insert(String::from("hmmsearch"), hmmer_version.to_string());

        Ok(())
    }

    fn run_analysis(&mut self) -> Result<(), anyhow::Error> {
        let mut incomplete: Option<Vec<String>> = None;

        for pass in 1..=2u32 {
            if let Err(error) = self.run_predictor_pass(incomplete.as_deref()) {
                if !Self::is_no_genes(&error) {
                    return Err(error);
                }
                if pass == 1 {
                    return Err(error
                        .context("the gene predictor did not find any genes in the input file"));
                }
                tracing::info!("No genes found on rerun");
                break;
            }

            let targets: Vec<String> = match &incomplete {
                Some(ids) => ids.clone(),
                None => self.cutoffs.keys().cloned().collect(),
            };
            self.run_profile_search_pass(&targets)?;

            let consolidated = self.results.consolidate();
            let mut next = self.results.missing_ids(&self.cutoffs);
            next.extend(consolidated.fragmented.keys().cloned());
            if next.is_empty() {
                break;
            }
            incomplete = Some(next);
        }

        self.metaeuk.combine_run_results()?;

        reconcile::validate_output(
            &mut self.results,
            &mut self.gene_details,
            &mut self.sequences_aa,
            &mut self.sequences_nt,
            &self.metaeuk.headers_files,
            &self.hmmer,
            &self.cutoffs,
        )?;

        let consolidated = self.results.consolidate();
        let missing = self.results.missing_ids(&self.cutoffs);
        let writer = ReportWriter {
            ctx: &self.ctx,
            meta: &self.meta,
            links: &self.links,
            cutoffs: &self.cutoffs,
            consolidated: &consolidated,
            missing: &missing,
            gene_details: &self.gene_details,
            tool_versions: &self.tool_versions,
        };
        writer.write_all(&self.sequences_aa, &self.sequences_nt)?;

        let p = report::percentages(
            consolidated.single_copy.len(),
            consolidated.multi_copy.len(),
            consolidated.fragmented.len(),
            self.cutoffs.len(),
        );
        tracing::info!(
            "Results:\t{}",
            report::one_line_summary(&p, self.cutoffs.len())
        );

        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), anyhow::Error> {
        if let Err(e) = self.metaeuk.remove_tmp_files() {
            tracing::warn!("could not remove predictor scratch directory: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::common::{RunContext, RunMode, TaxDomain};

    fn test_context(tmp: &std::path::Path, mode: RunMode, domain: TaxDomain) -> RunContext {
        RunContext {
            path_assembly: tmp.join("genome.fna"),
            path_lineage: tmp.join("lineage"),
            path_run: tmp.join("run"),
            mode,
            domain,
            cpu: 1,
            evalue: 1e-3,
            limit: 3,
            max_intron: 500000,
            max_seq_len: 20000000,
            metaeuk_parameters: None,
            metaeuk_rerun_parameters: None,
            datasets_version: String::from("odb10"),
            restart: false,
            placement_files: Vec::new(),
        }
    }

    #[rstest::rstest]
    #[case(RunMode::Genome, TaxDomain::Prokaryota)]
    #[case(RunMode::Transcriptome, TaxDomain::Eukaryota)]
    #[case(RunMode::Proteins, TaxDomain::Eukaryota)]
    fn select_strategy_rejects_unsupported_variants(
        #[case] mode: RunMode,
        #[case] domain: TaxDomain,
    ) {
        let tmp = temp_testdir::TempDir::default();
        let ctx = test_context(&tmp, mode, domain);

        assert!(super::select_strategy(ctx).is_err());
    }

    #[test]
    fn eukaryote_analysis_requires_dataset() {
        let tmp = temp_testdir::TempDir::default();
        let ctx = test_context(&tmp, RunMode::Genome, TaxDomain::Eukaryota);

        // no lineage directory was created
        assert!(super::EukaryoteGenomeAnalysis::new(ctx).is_err());
    }

    fn header_line(sco: &str, contig: &str, score: i64) -> String {
        format!(
            "{sco}_1|{contig}|+|{score}|1e-80|1|100|399|100[100]:399[399]:300[300]",
            sco = sco,
            contig = contig,
            score = score
        )
    }

    fn domtbl_row(gene: &str, score: f64) -> String {
        format!(
            "{} - 100 q - 100 1e-80 {} 0.1 1 1 1e-30 1e-28 {} 0.0 1 100 1 100 1 100 0.95 -\n",
            gene, score, score
        )
    }

    /// Full single-pass analysis driven from checkpointed predictor and
    /// profile search outputs: three orthologs, one complete gene each.
    #[test]
    fn run_analysis_from_checkpoints_reports_all_single_copy() -> Result<(), anyhow::Error> {
        use crate::genome::AnalysisStrategy as _;

        let tmp = temp_testdir::TempDir::default();
        let mut ctx = test_context(&tmp, RunMode::Genome, TaxDomain::Eukaryota);
        ctx.restart = true;

        std::fs::create_dir_all(&ctx.path_lineage)?;
        std::fs::write(
            ctx.path_lineage.join("lengths_cutoff"),
            "10at123\t0\t1\t100\n20at123\t0\t1\t100\n30at123\t0\t1\t100\n",
        )?;
        std::fs::write(
            ctx.path_lineage.join("scores_cutoff"),
            "10at123\t50\n20at123\t50\n30at123\t50\n",
        )?;
        std::fs::write(ctx.path_lineage.join("refseq_db.faa"), ">10at123_1\nMKV\n")?;

        let mut analysis = super::EukaryoteGenomeAnalysis::new(ctx.clone())?;

        // checkpointed predictor outputs for the initial pass
        let initial = ctx.path_run.join("metaeuk_output").join("initial_results");
        let headers = [
            header_line("10at123", "chr1", 200),
            header_line("20at123", "chr2", 210),
            header_line("30at123", "chr3", 220),
        ];
        std::fs::write(
            initial.join("genome.fna.headersMap.tsv"),
            headers
                .iter()
                .map(|h| format!("T\tC\t{}\n", h))
                .collect::<String>(),
        )?;
        std::fs::write(
            initial.join("genome.fna.fas"),
            headers
                .iter()
                .map(|h| format!(">{}\nMKV\n", h))
                .collect::<String>(),
        )?;

        // checkpointed profile search outputs, one complete hit each
        let hmmer_initial = ctx
            .path_run
            .join("hmmer_output")
            .join("initial_run_results");
        std::fs::write(
            hmmer_initial.join("10at123.out"),
            domtbl_row("chr1:100-399", 200.0),
        )?;
        std::fs::write(
            hmmer_initial.join("20at123.out"),
            domtbl_row("chr2:100-399", 210.0),
        )?;
        std::fs::write(
            hmmer_initial.join("30at123.out"),
            domtbl_row("chr3:100-399", 220.0),
        )?;

        analysis.run_analysis()?;

        let summary = std::fs::read_to_string(ctx.path_run.join("short_summary.txt"))?;
        assert!(summary.contains("C:100.0%[S:100.0%,D:0.0%],F:0.0%,M:0.0%,n:3"));

        let table = std::fs::read_to_string(ctx.path_run.join("full_table.tsv"))?;
        assert!(table.contains("10at123\tComplete\tchr1\t100\t399\t+\t200.0\t99"));
        assert!(table.contains("20at123\tComplete\tchr2\t100\t399\t+\t210.0\t99"));
        assert!(table.contains("30at123\tComplete\tchr3\t100\t399\t+\t220.0\t99"));

        for sco in ["10at123", "20at123", "30at123"] {
            assert!(ctx
                .path_run
                .join("busco_sequences")
                .join("single_copy")
                .join(format!("{}.faa", sco))
                .exists());
        }

        let missing = std::fs::read_to_string(ctx.path_run.join("missing_busco_list.tsv"))?;
        assert_eq!(3, missing.lines().count());

        Ok(())
    }
}
