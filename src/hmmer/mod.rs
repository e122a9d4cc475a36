//! Driver for the external profile search tool.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use rayon::prelude::*;

use crate::common::RunContext;
use crate::dataset::Cutoff;
use crate::err;

pub mod domtbl;
pub mod results;

/// Name of the profile search executable.
pub const CMD: &str = "hmmsearch";

/// Minimum supported profile search version.
pub const MIN_VERSION: f32 = 3.1;

/// Driver issuing one profile search job per ortholog.
///
/// Jobs are independent, write only their own domain table, and fan out
/// over the rayon thread pool.
#[derive(Debug)]
pub struct HmmerRunner {
    #[allow(dead_code)]
    hmmer_output_folder: PathBuf,
    /// Results directory of the initial run.
    pub initial_results_dir: PathBuf,
    /// Results directory of the rerun.
    pub rerun_results_dir: PathBuf,
    run_number: u32,
}

impl HmmerRunner {
    /// Create the runner and its output folders under the run folder.
    pub fn new(ctx: &RunContext) -> Result<Self, anyhow::Error> {
        let hmmer_output_folder = ctx.path_run.join("hmmer_output");
        let initial_results_dir = hmmer_output_folder.join("initial_run_results");
        let rerun_results_dir = hmmer_output_folder.join("rerun_results");
        for dir in [
            &hmmer_output_folder,
            &initial_results_dir,
            &rerun_results_dir,
        ] {
            std::fs::create_dir_all(dir)
                .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", dir, e))?;
        }

        Ok(HmmerRunner {
            hmmer_output_folder,
            initial_results_dir,
            rerun_results_dir,
            run_number: 0,
        })
    }

    /// Probe the profile search version and reject unsupported releases.
    pub fn check_tool(&self) -> Result<f32, anyhow::Error> {
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
        let fields = text
            .lines()
            .nth(1)
            .map(|line| line.split_whitespace().collect::<Vec<_>>())
            .unwrap_or_default();
        let version = fields
            .get(2)
            .and_then(|f| f.get(..3))
            .and_then(|f| f.parse::<f32>().ok())
            .or_else(|| {
                fields
                    .get(1)
                    .and_then(|f| f.get(..3))
                    .and_then(|f| f.parse::<f32>().ok())
            })
            .ok_or_else(|| err::Error::PredictorAbsent {
                tool: CMD.to_string(),
                reason: String::from("could not determine version"),
            })?;
        if version < MIN_VERSION {
            return Err(err::Error::PredictorAbsent {
                tool: CMD.to_string(),
                reason: format!(
                    "version {} detected, please use v{} or later",
                    version, MIN_VERSION
                ),
            }
            .into());
        }
        Ok(version)
    }

    /// Start the next pass and return its results directory.
    pub fn begin_pass(&mut self) -> Result<&Path, anyhow::Error> {
        self.run_number += 1;
        if self.run_number > 2 {
            anyhow::bail!("the profile search should not be run more than twice per analysis");
        }
        Ok(self.results_dir(self.run_number))
    }

    /// Results directory of the given pass.
    pub fn results_dir(&self, pass: u32) -> &Path {
        if pass > 1 {
            &self.rerun_results_dir
        } else {
            &self.initial_results_dir
        }
    }

    /// Run one search job per ortholog in `busco_ids` that has a cutoff
    /// entry, against `path_proteins`.  Jobs run in parallel; each writes
    /// `{results_dir}/{id}.out`.
    pub fn run(
        &self,
        ctx: &RunContext,
        path_proteins: &Path,
        busco_ids: &[String],
        cutoffs: &IndexMap<String, Cutoff>,
    ) -> Result<(), anyhow::Error> {
        let results_dir = self.results_dir(self.run_number).to_path_buf();
        let jobs: Vec<&String> = busco_ids
            .iter()
            .filter(|id| cutoffs.contains_key(id.as_str()))
            .collect();
        tracing::info!(
            "Running {} job(s) on {}, starting at pass {}",
            jobs.len(),
            CMD,
            self.run_number
        );

        jobs.par_iter()
            .map(|busco_id| {
                let path_out = results_dir.join(format!("{}.out", busco_id));
                let path_hmm = ctx
                    .path_lineage
                    .join("hmms")
                    .join(format!("{}.hmm", busco_id));
                let output = std::process::Command::new(CMD)
                    .arg("--domtblout")
                    .arg(&path_out)
                    .arg("--cpu")
                    .arg("1")
                    .arg("-E")
                    .arg(ctx.evalue.to_string())
                    .arg(&path_hmm)
                    .arg(path_proteins)
                    .output()
                    .map_err(|e| err::Error::PredictorAbsent {
                        tool: CMD.to_string(),
                        reason: e.to_string(),
                    })?;
                if !output.status.success() {
                    anyhow::bail!(
                        "{} failed for {}: {}",
                        CMD,
                        busco_id,
                        String::from_utf8_lossy(&output.stderr)
                    );
                }
                Ok(())
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|_| ())
    }
}
