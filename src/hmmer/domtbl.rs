//! Parsing of per-ortholog domain-table output.

use std::path::Path;

use indexmap::IndexMap;

use crate::common::io::read_lines;
use crate::err;

/// Accumulated domain hits of one ortholog profile on one predicted gene.
///
/// Subsequent rows for the same gene extend `hmm_len` and `env_coords`; the
/// first row fixes `tlen`, `score` and `frame`.
#[derive(Debug, Clone, PartialEq)]
pub struct DomtblRecord {
    /// Target sequence length.
    pub tlen: i64,
    /// Profile-matched length, cumulative over domains.
    pub hmm_len: i64,
    /// Envelope coordinate pairs, in order of appearance.
    pub env_coords: Vec<(i64, i64)>,
    /// Bitscore of the first admissible row.
    pub score: f64,
    /// Optional frame tag (present in transcriptome mode).
    pub frame: Option<String>,
}

/// Parse one domain-table file, discarding rows whose bitscore falls below
/// `score_cutoff`.
pub fn parse_domtbl(
    path: &Path,
    score_cutoff: f64,
) -> Result<IndexMap<String, DomtblRecord>, anyhow::Error> {
    let mut records: IndexMap<String, DomtblRecord> = IndexMap::new();

    for line in read_lines(path)
        .map_err(|e| anyhow::anyhow!("could not open domain table {:?}: {}", path, e))?
    {
        let line = line?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let parsed = || -> Option<(String, i64, f64, i64, i64, i64, i64)> {
            Some((
                fields.first()?.to_string(),
                fields.get(2)?.parse().ok()?,
                fields.get(7)?.parse().ok()?,
                fields.get(15)?.parse().ok()?,
                fields.get(16)?.parse().ok()?,
                fields.get(19)?.parse().ok()?,
                fields.get(20)?.parse().ok()?,
            ))
        }();
        let (gene_id, tlen, score, hmm_start, hmm_end, env_start, env_end) =
            parsed.ok_or_else(|| err::Error::DomainTableMalformed {
                path: path.to_path_buf(),
                line: line.clone(),
            })?;

        let frame = fields
            .last()
            .filter(|f| f.contains("frame"))
            .map(|f| f.to_string());

        if score < score_cutoff {
            continue;
        }

        let record = records.entry(gene_id).or_insert_with(|| DomtblRecord {
            tlen,
            hmm_len: 0,
            env_coords: Vec::new(),
            score,
            frame,
        });
        record.hmm_len += hmm_end - hmm_start;
        record.env_coords.push((env_start, env_end));
    }

    Ok(records)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    fn domtbl_row(gene: &str, score: f64, hmm: (i64, i64), env: (i64, i64)) -> String {
        format!(
            "{} - 250 10at123 - 300 1e-80 {} 0.1 1 2 1e-30 1e-28 100.0 0.0 {} {} 1 148 {} {} 0.95 -\n",
            gene, score, hmm.0, hmm.1, env.0, env.1
        )
    }

    #[test]
    fn parse_domtbl_accumulates_domains() -> Result<(), anyhow::Error> {
        let tmp = temp_testdir::TempDir::default();
        let path = tmp.join("10at123.out");
        let mut content = String::from("# comment line\n");
        content += &domtbl_row("chr1:100-400", 200.0, (1, 150), (1, 150));
        content += &domtbl_row("chr1:100-400", 190.0, (150, 250), (151, 250));
        content += &domtbl_row("chr2:5-80", 120.0, (1, 90), (1, 90));
        std::fs::write(&path, content)?;

        let records = super::parse_domtbl(&path, 50.0)?;
        assert_eq!(2, records.len());

        let first = &records["chr1:100-400"];
        assert_eq!(250, first.tlen);
        assert_eq!(249, first.hmm_len);
        assert_eq!(vec![(1, 150), (151, 250)], first.env_coords);
        // the first row fixes the score
        assert_eq!(200.0, first.score);
        assert_eq!(None, first.frame);

        Ok(())
    }

    #[test]
    fn parse_domtbl_discards_below_cutoff() -> Result<(), anyhow::Error> {
        let tmp = temp_testdir::TempDir::default();
        let path = tmp.join("10at123.out");
        let content = domtbl_row("chr1:100-400", 40.0, (1, 150), (1, 150));
        std::fs::write(&path, content)?;

        let records = super::parse_domtbl(&path, 50.0)?;
        assert!(records.is_empty());

        Ok(())
    }

    #[test]
    fn parse_domtbl_keeps_frame_tag() -> Result<(), anyhow::Error> {
        let tmp = temp_testdir::TempDir::default();
        let path = tmp.join("10at123.out");
        let content = format!(
            "{} frame=2\n",
            domtbl_row("tx1", 200.0, (1, 150), (1, 150)).trim_end()
        );
        std::fs::write(&path, content)?;

        let records = super::parse_domtbl(&path, 50.0)?;
        assert_eq!(Some(String::from("frame=2")), records["tx1"].frame);

        Ok(())
    }

    #[test]
    fn parse_domtbl_malformed_row_is_fatal() -> Result<(), anyhow::Error> {
        let tmp = temp_testdir::TempDir::default();
        let path = tmp.join("10at123.out");
        std::fs::write(&path, "chr1:100-400 - 250\n")?;

        let err = super::parse_domtbl(&path, 50.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::err::Error>(),
            Some(crate::err::Error::DomainTableMalformed { .. })
        ));

        Ok(())
    }
}
