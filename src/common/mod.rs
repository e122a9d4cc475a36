//! Common functionality.

use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

pub mod io;

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: Verbosity::new(0, 0),
        }
    }
}

/// Strand of a predicted gene on the assembly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum Strand {
    /// Forward strand.
    #[strum(serialize = "+")]
    Forward,
    /// Reverse strand.
    #[strum(serialize = "-")]
    Reverse,
}

impl std::str::FromStr for Strand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "+" => Strand::Forward,
            "-" => Strand::Reverse,
            _ => anyhow::bail!("invalid strand value: {:?}", s),
        })
    }
}

/// Select the analysis mode.
#[derive(clap::ValueEnum, Clone, Copy, Debug, strum::Display, PartialEq, Eq)]
pub enum RunMode {
    /// Nucleotide assembly input.
    #[strum(serialize = "genome")]
    Genome,
    /// Assembled transcript input.
    #[strum(serialize = "transcriptome")]
    Transcriptome,
    /// Protein input.
    #[strum(serialize = "proteins")]
    Proteins,
}

/// Select the taxonomic domain of the lineage dataset.
#[derive(clap::ValueEnum, Clone, Copy, Debug, strum::Display, PartialEq, Eq)]
pub enum TaxDomain {
    /// Eukaryotic lineages.
    #[strum(serialize = "eukaryota")]
    Eukaryota,
    /// Prokaryotic lineages.
    #[strum(serialize = "prokaryota")]
    Prokaryota,
    /// Viral lineages.
    #[strum(serialize = "viruses")]
    Viruses,
}

/// Run-wide options, threaded through every pipeline component.
///
/// The orchestrator is the sole writer (it clears `restart` once a stage
/// actually has to run).
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Path to the input assembly FASTA.
    pub path_assembly: PathBuf,
    /// Path to the lineage dataset directory.
    pub path_lineage: PathBuf,
    /// Path to the run folder that receives all outputs.
    pub path_run: PathBuf,
    /// Analysis mode.
    pub mode: RunMode,
    /// Taxonomic domain of the lineage.
    pub domain: TaxDomain,
    /// Number of worker threads for external jobs.
    pub cpu: usize,
    /// E-value threshold handed to the profile search.
    pub evalue: f64,
    /// Candidate-region limit (applies to the alternate predictor path only).
    pub limit: usize,
    /// Upper bound on intron length handed to the gene predictor.
    pub max_intron: u64,
    /// Upper bound on predicted gene span handed to the gene predictor.
    pub max_seq_len: u64,
    /// Extra predictor parameters for the initial run (`--key=value` list).
    pub metaeuk_parameters: Option<String>,
    /// Extra predictor parameters for the rerun (`--key=value` list).
    pub metaeuk_rerun_parameters: Option<String>,
    /// Dataset release tag used to locate the links file.
    pub datasets_version: String,
    /// Whether to reuse checkpointed outputs from a previous run.
    pub restart: bool,
    /// Placement file versions reported when auto-lineage selection was used.
    pub placement_files: Vec<String>,
}

/// The version of the `busco-worker` package.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Return the version of the `busco-worker` crate and `x.y.z` in tests.
pub fn worker_version() -> &'static str {
    if cfg!(test) {
        "x.y.z"
    } else {
        VERSION
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::Strand;

    #[rstest::rstest]
    #[case("+", Strand::Forward)]
    #[case("-", Strand::Reverse)]
    fn strand_from_str(#[case] s: &str, #[case] expected: Strand) -> Result<(), anyhow::Error> {
        let strand: Strand = s.parse()?;
        assert_eq!(expected, strand);
        assert_eq!(s, strand.to_string());

        Ok(())
    }

    #[test]
    fn strand_from_str_invalid() {
        assert!("x".parse::<Strand>().is_err());
        assert!("".parse::<Strand>().is_err());
    }

    #[test]
    fn worker_version_in_tests() {
        assert_eq!("x.y.z", super::worker_version());
    }
}
