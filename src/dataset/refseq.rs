//! Reference protein database handling.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use bio::io::fasta;

use crate::common::io::open_read_maybe_gz;

/// Decompress the reference protein database in place.
///
/// Given `refseq_db.faa.gz`, produces `refseq_db.faa` next to it (skipped
/// when the target already exists) and then removes the archive.  A failed
/// removal is only a warning.  When the archive itself is already gone the
/// decompressed path is returned as-is.
pub fn decompress_refseq(gzip_path: &Path) -> Result<PathBuf, anyhow::Error> {
    let target = gzip_path.with_extension("");
    if !target.exists() {
        if !gzip_path.exists() {
            anyhow::bail!(
                "reference protein database not found at {:?} or {:?}",
                &target,
                gzip_path
            );
        }
        let mut decoder = open_read_maybe_gz(gzip_path)
            .map_err(|e| anyhow::anyhow!("could not open {:?}: {}", gzip_path, e))?;
        let dir = gzip_path.parent().unwrap_or_else(|| Path::new("."));
        let mut out = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| anyhow::anyhow!("could not create temporary file in {:?}: {}", dir, e))?;
        std::io::copy(&mut decoder, &mut out)
            .map_err(|e| anyhow::anyhow!("could not decompress {:?}: {}", gzip_path, e))?;
        out.flush()?;
        out.persist(&target)
            .map_err(|e| anyhow::anyhow!("could not move decompressed file to {:?}: {}", &target, e))?;
    }
    if gzip_path.exists() {
        if let Err(e) = std::fs::remove_file(gzip_path) {
            tracing::warn!(
                "Unable to remove compressed reference file {:?}: {}",
                gzip_path,
                e
            );
        }
    }
    Ok(target)
}

/// Build the pruned reference protein set for the rerun.
///
/// Retains every record whose id is one of `wanted` or `"{wanted}_<variant>"`
/// and strips the variant suffix so the record id matches the plain ortholog
/// id.  Orthologs with no matching record are reported at debug level only.
pub fn build_rerun_refseq(
    path_refseq: &Path,
    path_out: &Path,
    wanted: &[String],
) -> Result<(), anyhow::Error> {
    tracing::info!(
        "Extracting missing and fragmented orthologs from the file {:?}...",
        path_refseq.file_name().unwrap_or_default()
    );

    let reader = fasta::Reader::from_file(path_refseq)
        .map_err(|e| anyhow::anyhow!("could not open {:?}: {}", path_refseq, e))?;
    let mut writer = fasta::Writer::to_file(path_out)
        .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", path_out, e))?;

    let mut retrieved: HashSet<&str> = HashSet::new();
    for record in reader.records() {
        let record = record?;
        let matched = wanted.iter().find(|w| {
            record.id() == w.as_str() || record.id().starts_with(&format!("{}_", w))
        });
        if let Some(w) = matched {
            retrieved.insert(w.as_str());
            writer.write(w, record.desc(), record.seq())?;
        }
    }

    for w in wanted {
        if !retrieved.contains(w.as_str()) {
            tracing::debug!(
                "The ortholog id {} was not found in the file {:?}",
                w,
                path_refseq.file_name().unwrap_or_default()
            );
        }
    }

    Ok(())
}
