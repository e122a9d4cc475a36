//! Result tables and the completeness summary.

use std::io::Write;

use bio::io::fasta;
use indexmap::IndexMap;
use itertools::Itertools;

use crate::common::{worker_version, RunContext, RunMode, TaxDomain};
use crate::dataset::{Cutoff, DatasetMeta, LinkInfo};
use crate::hmmer::results::Consolidated;
use crate::metaeuk::header::GeneDetails;

/// Percentages of the one-line summary, rounded to one decimal.
#[derive(Debug, Clone, PartialEq)]
pub struct Percentages {
    /// Complete and single-copy.
    pub single: f64,
    /// Complete and duplicated.
    pub duplicated: f64,
    /// Fragmented.
    pub fragmented: f64,
    /// Complete (single + duplicated).
    pub complete: f64,
    /// Missing.
    pub missing: f64,
}

/// Compute the per-status percentages over `total` orthologs.
pub fn percentages(
    single_copy: usize,
    multi_copy: usize,
    fragmented: usize,
    total: usize,
) -> Percentages {
    let pct = |n: usize| ((n as f64 / total as f64) * 1000.0).round() / 10.0;
    let single = pct(single_copy);
    let duplicated = pct(multi_copy);
    let frag = pct(fragmented);
    let complete = ((single + duplicated) * 10.0).round() / 10.0;
    let missing = (((100.0 - single - duplicated - frag) * 10.0).round() / 10.0).abs();
    Percentages {
        single,
        duplicated,
        fragmented: frag,
        complete,
        missing,
    }
}

/// The one-line completeness figure.
pub fn one_line_summary(p: &Percentages, total: usize) -> String {
    format!(
        "C:{:.1}%[S:{:.1}%,D:{:.1}%],F:{:.1}%,M:{:.1}%,n:{}",
        p.complete, p.single, p.duplicated, p.fragmented, p.missing, total
    )
}

/// Sort key of the main table: the integer prefix of the ortholog id.
fn sco_sort_key(sco_id: &str) -> u64 {
    sco_id
        .split("at")
        .next()
        .and_then(|prefix| prefix.parse().ok())
        .unwrap_or(0)
}

enum HeaderKind {
    FullTable { extra_columns: bool },
    MissingList,
    Summary,
}

/// Writer for the per-ortholog table, the missing list, the short summary
/// and the per-ortholog sequence files.
pub struct ReportWriter<'a> {
    /// Run-wide options.
    pub ctx: &'a RunContext,
    /// Dataset metadata for the output headers.
    pub meta: &'a DatasetMeta,
    /// Optional OrthoDB link annotations.
    pub links: &'a IndexMap<String, LinkInfo>,
    /// Cutoff map; its size is the ortholog universe.
    pub cutoffs: &'a IndexMap<String, Cutoff>,
    /// Final ortholog partition.
    pub consolidated: &'a Consolidated,
    /// Missing ortholog ids.
    pub missing: &'a [String],
    /// Gene location lookup.
    pub gene_details: &'a IndexMap<String, Vec<GeneDetails>>,
    /// Versions of the external tools used.
    pub tool_versions: &'a IndexMap<String, String>,
}

impl ReportWriter<'_> {
    /// Write every output artifact into the run folder.
    pub fn write_all(
        &self,
        sequences_aa: &IndexMap<String, fasta::Record>,
        sequences_nt: &IndexMap<String, fasta::Record>,
    ) -> Result<(), anyhow::Error> {
        self.write_full_table()?;
        self.write_missing_list()?;
        self.write_short_summary()?;
        self.write_sequences(sequences_aa, sequences_nt)?;
        Ok(())
    }

    fn write_output_header<W: Write>(
        &self,
        out: &mut W,
        kind: HeaderKind,
    ) -> Result<(), anyhow::Error> {
        writeln!(out, "# BUSCO version is: {} ", worker_version())?;
        writeln!(
            out,
            "# The lineage dataset is: {} (Creation date: {}, number of genomes: {}, number of BUSCOs: {})",
            self.meta.name,
            self.meta.creation_date,
            self.meta.number_of_species,
            self.meta.number_of_buscos
        )?;
        match kind {
            HeaderKind::FullTable { extra_columns } => {
                if extra_columns {
                    writeln!(
                        out,
                        "# Busco id\tStatus\tSequence\tGene Start\tGene End\tStrand\tScore\tLength\tOrthoDB url\tDescription"
                    )?;
                } else {
                    writeln!(
                        out,
                        "# Busco id\tStatus\tSequence\tGene Start\tGene End\tStrand\tScore\tLength"
                    )?;
                }
            }
            HeaderKind::MissingList => {
                writeln!(out, "# Busco id")?;
            }
            HeaderKind::Summary => (),
        }
        Ok(())
    }

    fn table_rows(&self) -> (Vec<Vec<String>>, bool) {
        let mut rows = Vec::new();
        let mut extra_columns = false;

        let labeled = [
            ("Complete", &self.consolidated.single_copy),
            ("Duplicated", &self.consolidated.multi_copy),
            ("Fragmented", &self.consolidated.fragmented),
        ];
        for (label, dict) in labeled {
            for (busco, matches) in dict.iter() {
                for (gene_id, match_info) in matches {
                    for (m, info) in match_info.iter().enumerate() {
                        let details = self.gene_details.get(gene_id).and_then(|d| {
                            d.get(m).or_else(|| d.first())
                        });
                        let Some(details) = details else {
                            continue;
                        };
                        // the location suffix duplicates the start/end columns
                        let location = format!(":{}-{}", details.start, details.end);
                        let sequence = gene_id
                            .strip_suffix(location.as_str())
                            .unwrap_or(gene_id)
                            .to_string();
                        let mut row = vec![
                            busco.clone(),
                            label.to_string(),
                            sequence,
                            details.start.to_string(),
                            details.end.to_string(),
                            details.strand.to_string(),
                            format!("{:.1}", info.bitscore),
                            info.length.to_string(),
                        ];
                        if let Some(link) = self.links.get(busco) {
                            extra_columns = true;
                            row.push(link.url.clone());
                            row.push(link.description.clone());
                        }
                        rows.push(row);
                    }
                }
            }
        }

        for busco in self.missing {
            rows.push(vec![busco.clone(), String::from("Missing")]);
        }

        (rows, extra_columns)
    }

    /// Write `full_table.tsv`, sorted by the integer prefix of the
    /// ortholog id.
    pub fn write_full_table(&self) -> Result<(), anyhow::Error> {
        let (rows, extra_columns) = self.table_rows();
        let rows = rows
            .into_iter()
            .sorted_by_key(|row| sco_sort_key(&row[0]));

        let path = self.ctx.path_run.join("full_table.tsv");
        let mut file = std::fs::File::create(&path)
            .map(std::io::BufWriter::new)
            .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", &path, e))?;
        self.write_output_header(&mut file, HeaderKind::FullTable { extra_columns })?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .delimiter(b'\t')
            .quote_style(csv::QuoteStyle::Never)
            .flexible(true)
            .from_writer(file);
        for row in rows {
            writer.write_record(&row)?;
        }
        writer.flush()?;

        Ok(())
    }

    /// Write `missing_busco_list.tsv`.
    pub fn write_missing_list(&self) -> Result<(), anyhow::Error> {
        let path = self.ctx.path_run.join("missing_busco_list.tsv");
        let mut file = std::fs::File::create(&path)
            .map(std::io::BufWriter::new)
            .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", &path, e))?;
        self.write_output_header(&mut file, HeaderKind::MissingList)?;

        for busco in self.missing.iter().sorted() {
            writeln!(file, "{}", busco)?;
        }
        file.flush()?;

        Ok(())
    }

    fn results_lines(&self) -> Vec<String> {
        let single = self.consolidated.single_copy.len();
        let multi = self.consolidated.multi_copy.len();
        let fragmented = self.consolidated.fragmented.len();
        let total = self.cutoffs.len();
        let p = percentages(single, multi, fragmented, total);

        vec![
            String::from("***** Results: *****\n\n"),
            format!("{}\t   \n", one_line_summary(&p, total)),
            format!("{}\tComplete BUSCOs (C)\t\t\t   \n", single + multi),
            format!("{}\tComplete and single-copy BUSCOs (S)\t   \n", single),
            format!("{}\tComplete and duplicated BUSCOs (D)\t   \n", multi),
            format!("{}\tFragmented BUSCOs (F)\t\t\t   \n", fragmented),
            format!(
                "{}\tMissing BUSCOs (M)\t\t\t   \n",
                total - single - multi - fragmented
            ),
            format!("{}\tTotal BUSCO groups searched\t\t   \n", total),
        ]
    }

    /// Write `short_summary.txt`.
    pub fn write_short_summary(&self) -> Result<(), anyhow::Error> {
        let path = self.ctx.path_run.join("short_summary.txt");
        let mut file = std::fs::File::create(&path)
            .map(std::io::BufWriter::new)
            .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", &path, e))?;
        self.write_output_header(&mut file, HeaderKind::Summary)?;

        writeln!(
            file,
            "# Summarized benchmarking in BUSCO notation for file {}",
            self.ctx.path_assembly.display()
        )?;
        writeln!(file, "# BUSCO was run in mode: {}", self.ctx.mode)?;
        if self.ctx.mode == RunMode::Genome {
            let gene_predictor = match self.ctx.domain {
                TaxDomain::Eukaryota => "metaeuk",
                TaxDomain::Prokaryota | TaxDomain::Viruses => "prodigal",
            };
            writeln!(file, "# Gene predictor used: {}", gene_predictor)?;
        }
        writeln!(file)?;

        for line in self.results_lines() {
            write!(file, "\t{}", line)?;
        }

        writeln!(file, "\nDependencies and versions:")?;
        for (tool, version) in self.tool_versions {
            writeln!(file, "\t{}: {}", tool, version)?;
        }

        if !self.ctx.placement_files.is_empty() {
            writeln!(file, "\nPlacement file versions:")?;
            for placement_file in &self.ctx.placement_files {
                writeln!(file, "\t{}", placement_file)?;
            }
        }
        file.flush()?;

        Ok(())
    }

    /// Write the per-ortholog sequence files into
    /// `busco_sequences/{single_copy,multi_copy,fragmented}/`.  Amino-acid
    /// files are always written; a nucleotide file accompanies them when
    /// every kept gene has a codon record.
    pub fn write_sequences(
        &self,
        sequences_aa: &IndexMap<String, fasta::Record>,
        sequences_nt: &IndexMap<String, fasta::Record>,
    ) -> Result<(), anyhow::Error> {
        let base = self.ctx.path_run.join("busco_sequences");
        let grouped = [
            ("single_copy", &self.consolidated.single_copy),
            ("multi_copy", &self.consolidated.multi_copy),
            ("fragmented", &self.consolidated.fragmented),
        ];
        for (folder, dict) in grouped {
            let dir = base.join(folder);
            std::fs::create_dir_all(&dir)
                .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", &dir, e))?;
            for (busco, matches) in dict.iter() {
                let aa_records: Vec<&fasta::Record> = matches
                    .keys()
                    .filter_map(|gene_id| sequences_aa.get(gene_id))
                    .collect();
                let mut writer =
                    fasta::Writer::to_file(dir.join(format!("{}.faa", busco)))
                        .map_err(|e| anyhow::anyhow!("could not write sequences: {}", e))?;
                for record in &aa_records {
                    writer.write_record(record)?;
                }
                drop(writer);

                let nt_records: Vec<&fasta::Record> = matches
                    .keys()
                    .filter_map(|gene_id| sequences_nt.get(gene_id))
                    .collect();
                if !nt_records.is_empty() && nt_records.len() == matches.len() {
                    let mut writer =
                        fasta::Writer::to_file(dir.join(format!("{}.fna", busco)))
                            .map_err(|e| anyhow::anyhow!("could not write sequences: {}", e))?;
                    for record in nt_records {
                        writer.write_record(record)?;
                    }
                }
            }
        }
        Ok(())
    }
}
