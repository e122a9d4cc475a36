//! Semantic error kinds of the analysis pipeline.

use std::path::PathBuf;

/// Errors that abort a run (or, for `PredictorProducedNothing` on the
/// rerun, are absorbed by the orchestrator).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid dataset file {path}: {reason}")]
    DatasetInvalid { path: PathBuf, reason: String },
    #[error("{tool} is missing or unusable: {reason}")]
    PredictorAbsent { tool: String, reason: String },
    #[error("gene predictor produced no output at {0}")]
    PredictorProducedNothing(PathBuf),
    #[error("cannot parse gene header in {path}: {line}")]
    HeaderMalformed { path: PathBuf, line: String },
    #[error("cannot parse domain table {path}: {line}")]
    DomainTableMalformed { path: PathBuf, line: String },
    #[error("exon coordinates of {gene_id} contain fractional reading frames and are ambiguous")]
    ExonFractionalFrame { gene_id: String },
}
