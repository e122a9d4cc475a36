//! Lineage dataset loading: per-ortholog cutoffs, link annotations, metadata.

use std::path::Path;

use indexmap::IndexMap;

use crate::common::io::read_lines;
use crate::err;

pub mod refseq;

/// Statistical cutoffs for one single-copy ortholog profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Cutoff {
    /// Minimum admissible bitscore for a domain hit.
    pub score: f64,
    /// Expected profile-matched length in amino acids.
    pub length: f64,
    /// Standard deviation of the matched length; never zero.
    pub sigma: f64,
}

/// Load the per-ortholog cutoff map from `lengths_cutoff` and `scores_cutoff`.
///
/// Both files are joined by ortholog id; an id present in only one of them
/// is an error.  A sigma of zero is substituted with one so downstream
/// divisions are safe.
pub fn load_cutoffs(path_lineage: &Path) -> Result<IndexMap<String, Cutoff>, anyhow::Error> {
    let path_lengths = path_lineage.join("lengths_cutoff");
    let path_scores = path_lineage.join("scores_cutoff");

    let mut lengths: IndexMap<String, (f64, f64)> = IndexMap::new();
    for line in read_lines(&path_lengths).map_err(|e| err::Error::DatasetInvalid {
        path: path_lengths.clone(),
        reason: e.to_string(),
    })? {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields = line.split_whitespace().collect::<Vec<_>>();
        let parsed = || -> Option<(String, f64, f64)> {
            let id = fields.first()?.to_string();
            let sigma = fields.get(2)?.parse::<f64>().ok()?;
            let length = fields.get(3)?.parse::<f64>().ok()?;
            Some((id, sigma, length))
        }();
        let (id, sigma, length) = parsed.ok_or_else(|| err::Error::DatasetInvalid {
            path: path_lengths.clone(),
            reason: format!("malformed row: {:?}", &line),
        })?;
        // There are profiles in the wild with sigma 0 that would crash
        // divisions downstream.
        let sigma = if sigma == 0.0 { 1.0 } else { sigma };
        lengths.insert(id, (sigma, length));
    }

    let mut result = IndexMap::new();
    for line in read_lines(&path_scores).map_err(|e| err::Error::DatasetInvalid {
        path: path_scores.clone(),
        reason: e.to_string(),
    })? {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields = line.split_whitespace().collect::<Vec<_>>();
        let parsed = || -> Option<(String, f64)> {
            let id = fields.first()?.to_string();
            let score = fields.get(1)?.parse::<f64>().ok()?;
            Some((id, score))
        }();
        let (id, score) = parsed.ok_or_else(|| err::Error::DatasetInvalid {
            path: path_scores.clone(),
            reason: format!("malformed row: {:?}", &line),
        })?;
        let (sigma, length) = lengths
            .shift_remove(&id)
            .ok_or_else(|| err::Error::DatasetInvalid {
                path: path_scores.clone(),
                reason: format!("no length cutoff for ortholog {}", &id),
            })?;
        result.insert(
            id,
            Cutoff {
                score,
                length,
                sigma,
            },
        );
    }

    if let Some(id) = lengths.keys().next() {
        return Err(err::Error::DatasetInvalid {
            path: path_lengths,
            reason: format!("no score cutoff for ortholog {}", id),
        }
        .into());
    }

    tracing::debug!("loaded cutoffs for {} orthologs", result.len());
    Ok(result)
}

/// OrthoDB link annotation for one ortholog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Free-text description of the ortholog.
    pub description: String,
    /// OrthoDB URL.
    pub url: String,
}

/// Load the optional `links_to_<VERSION>.txt` annotation file.
///
/// Returns an empty map if the lineage does not ship one.
pub fn load_links(
    path_lineage: &Path,
    datasets_version: &str,
) -> Result<IndexMap<String, LinkInfo>, anyhow::Error> {
    let path = path_lineage.join(format!(
        "links_to_{}.txt",
        datasets_version.to_uppercase()
    ));
    let mut result = IndexMap::new();
    if !path.exists() {
        return Ok(result);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'\t')
        .from_path(&path)?;
    for record in reader.records() {
        let record = record?;
        if record.len() < 3 {
            return Err(err::Error::DatasetInvalid {
                path,
                reason: format!("malformed links row: {:?}", &record),
            }
            .into());
        }
        result.insert(
            record[0].to_string(),
            LinkInfo {
                description: record[1].to_string(),
                url: record[2].to_string(),
            },
        );
    }

    Ok(result)
}

/// Descriptive metadata of a lineage dataset, used in output headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetMeta {
    /// Name of the lineage.
    pub name: String,
    /// Creation date of the dataset.
    pub creation_date: String,
    /// Number of genomes the dataset was built from.
    pub number_of_species: String,
    /// Number of orthologs in the dataset.
    pub number_of_buscos: String,
}

/// Load dataset metadata from the lineage's `dataset.cfg`, falling back to
/// the directory name and `N/A` placeholders when absent.
pub fn load_meta(path_lineage: &Path) -> Result<DatasetMeta, anyhow::Error> {
    let mut meta = DatasetMeta {
        name: path_lineage
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| String::from("N/A")),
        creation_date: String::from("N/A"),
        number_of_species: String::from("N/A"),
        number_of_buscos: String::from("N/A"),
    };

    let path = path_lineage.join("dataset.cfg");
    if !path.exists() {
        return Ok(meta);
    }
    for line in read_lines(&path)? {
        let line = line?;
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "name" => meta.name = value.trim().to_string(),
            "creation_date" => meta.creation_date = value.trim().to_string(),
            "number_of_species" => meta.number_of_species = value.trim().to_string(),
            "number_of_BUSCOs" => meta.number_of_buscos = value.trim().to_string(),
            _ => (),
        }
    }

    Ok(meta)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    fn write_lineage(
        tmp: &std::path::Path,
        lengths: &str,
        scores: &str,
    ) -> Result<(), anyhow::Error> {
        std::fs::write(tmp.join("lengths_cutoff"), lengths)?;
        std::fs::write(tmp.join("scores_cutoff"), scores)?;
        Ok(())
    }

    #[test]
    fn load_cutoffs_joins_both_files() -> Result<(), anyhow::Error> {
        let tmp = temp_testdir::TempDir::default();
        write_lineage(
            &tmp,
            "10at123\t0\t20.5\t300\n20at123\t0\t11.0\t150\n",
            "10at123\t250.0\n20at123\t80.0\n",
        )?;

        let cutoffs = super::load_cutoffs(&tmp)?;
        assert_eq!(2, cutoffs.len());
        assert_eq!(
            &super::Cutoff {
                score: 250.0,
                length: 300.0,
                sigma: 20.5,
            },
            &cutoffs["10at123"]
        );

        Ok(())
    }

    #[test]
    fn load_cutoffs_substitutes_zero_sigma() -> Result<(), anyhow::Error> {
        let tmp = temp_testdir::TempDir::default();
        write_lineage(&tmp, "10at123\t0\t0.0\t300\n", "10at123\t250.0\n")?;

        let cutoffs = super::load_cutoffs(&tmp)?;
        assert_eq!(1.0, cutoffs["10at123"].sigma);

        Ok(())
    }

    #[rstest::rstest]
    #[case("10at123\tnot-a-number\n", "10at123\t250.0\n")]
    #[case("10at123\t0\t1.0\t300\n", "10at123\n")]
    fn load_cutoffs_malformed_row_is_fatal(
        #[case] lengths: &str,
        #[case] scores: &str,
    ) -> Result<(), anyhow::Error> {
        let tmp = temp_testdir::TempDir::default();
        write_lineage(&tmp, lengths, scores)?;

        assert!(super::load_cutoffs(&tmp).is_err());

        Ok(())
    }

    #[test]
    fn load_cutoffs_unjoined_id_is_fatal() -> Result<(), anyhow::Error> {
        let tmp = temp_testdir::TempDir::default();
        write_lineage(
            &tmp,
            "10at123\t0\t1.0\t300\n20at123\t0\t1.0\t100\n",
            "10at123\t250.0\n",
        )?;

        assert!(super::load_cutoffs(&tmp).is_err());

        Ok(())
    }

    #[test]
    fn load_links_missing_file_is_empty() -> Result<(), anyhow::Error> {
        let tmp = temp_testdir::TempDir::default();
        let links = super::load_links(&tmp, "odb10")?;
        assert!(links.is_empty());

        Ok(())
    }

    #[test]
    fn load_links_reads_rows() -> Result<(), anyhow::Error> {
        let tmp = temp_testdir::TempDir::default();
        std::fs::write(
            tmp.join("links_to_ODB10.txt"),
            "10at123\tKinesin motor\thttps://www.orthodb.org/?query=10at123\n",
        )?;

        let links = super::load_links(&tmp, "odb10")?;
        assert_eq!(1, links.len());
        assert_eq!("Kinesin motor", links["10at123"].description);
        assert_eq!(
            "https://www.orthodb.org/?query=10at123",
            links["10at123"].url
        );

        Ok(())
    }

    #[test]
    fn load_meta_reads_dataset_cfg() -> Result<(), anyhow::Error> {
        let tmp = temp_testdir::TempDir::default();
        std::fs::write(
            tmp.join("dataset.cfg"),
            "name=eukaryota_odb10\ncreation_date=2024-01-08\nnumber_of_species=70\nnumber_of_BUSCOs=255\n",
        )?;

        let meta = super::load_meta(&tmp)?;
        assert_eq!("eukaryota_odb10", meta.name);
        assert_eq!("2024-01-08", meta.creation_date);
        assert_eq!("70", meta.number_of_species);
        assert_eq!("255", meta.number_of_buscos);

        Ok(())
    }

    #[test]
    fn load_meta_defaults_without_cfg() -> Result<(), anyhow::Error> {
        let tmp = temp_testdir::TempDir::default();
        let meta = super::load_meta(&tmp)?;
        assert_eq!("N/A", meta.creation_date);

        Ok(())
    }
}
