//! Parsing of predictor header lines.
//!
//! The predictor identifies every predicted gene with a pipe-separated
//! header of the form
//! `T_acc|C_acc|strand|bitscore|e-value|n_exons|low|high|exon_1|...|exon_n`
//! where each exon is `low[taken_low]:high[taken_high]:nt_len[taken_nt_len]`.
//! Contig accessions may themselves contain `|`, which is resolved by
//! anchoring on the first isolated `+`/`-` field.

use std::path::Path;

use indexmap::IndexMap;

use crate::common::Strand;
use crate::err;

/// One exon of a predicted gene, with the "taken" portion that actually
/// contributes to the protein.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exon {
    /// Genomic low coordinate.
    pub low: i64,
    /// Low coordinate of the taken portion.
    pub taken_low: i64,
    /// Genomic high coordinate.
    pub high: i64,
    /// High coordinate of the taken portion.
    pub taken_high: i64,
    /// Nucleotide length of the exon.
    pub nt_len: i64,
    /// Nucleotide length of the taken portion.
    pub taken_nt_len: i64,
}

impl Exon {
    fn parse(field: &str, strand: Strand) -> Result<Self, anyhow::Error> {
        fn split_taken(part: &str) -> Result<(i64, i64), anyhow::Error> {
            let (value, taken) = part
                .split_once('[')
                .ok_or_else(|| anyhow::anyhow!("missing taken value in {:?}", part))?;
            Ok((
                value.trim().parse()?,
                taken.trim().trim_end_matches(']').parse()?,
            ))
        }

        let mut segments = field.split(':');
        let (low, mut taken_low) = split_taken(
            segments
                .next()
                .ok_or_else(|| anyhow::anyhow!("missing low coords in exon {:?}", field))?,
        )?;
        let (high, taken_high) = split_taken(
            segments
                .next()
                .ok_or_else(|| anyhow::anyhow!("missing high coords in exon {:?}", field))?,
        )?;
        let (nt_len, taken_nt_len) = split_taken(
            segments
                .next()
                .ok_or_else(|| anyhow::anyhow!("missing lengths in exon {:?}", field))?,
        )?;

        // On the reverse strand the predictor occasionally emits a taken-low
        // coordinate that disagrees with the taken-high and taken-length
        // fields; the coordinate is recomputed from the other two.
        if strand == Strand::Reverse && taken_high + taken_nt_len - 1 != taken_low {
            taken_low = taken_high + taken_nt_len - 1;
        }

        Ok(Exon {
            low,
            taken_low,
            high,
            taken_high,
            nt_len,
            taken_nt_len,
        })
    }

    fn format(&self) -> String {
        format!(
            "{}[{}]:{}[{}]:{}[{}]",
            self.low, self.taken_low, self.high, self.taken_high, self.nt_len, self.taken_nt_len
        )
    }
}

/// A structured predictor header.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneHeader {
    /// Reference protein accession the gene was predicted from.
    pub t_acc: String,
    /// Contig accession.
    pub c_acc: String,
    /// Strand of the prediction.
    pub strand: Strand,
    /// Predictor bitscore.
    pub bitscore: f64,
    /// Predictor e-value.
    pub evalue: f64,
    /// Number of exons.
    pub num_exons: usize,
    /// Genomic low coordinate of the gene.
    pub low: i64,
    /// Genomic high coordinate of the gene.
    pub high: i64,
    /// Exon coordinates, in order of appearance.
    pub exons: Vec<Exon>,
}

impl GeneHeader {
    /// Parse a predictor header line.
    pub fn parse(header: &str) -> Result<Self, anyhow::Error> {
        let parts: Vec<&str> = header.trim().split('|').collect();
        if parts.len() < 8 {
            anyhow::bail!("too few fields in header: {:?}", header);
        }

        // Contig accessions containing "|" push the strand field to the
        // right; anchor on the first +/- field and re-join what precedes it.
        let (c_acc, strand_ind) = if parts[2] == "+" || parts[2] == "-" {
            (parts[1].to_string(), 2)
        } else {
            let strand_ind = parts
                .iter()
                .position(|p| *p == "+" || *p == "-")
                .ok_or_else(|| anyhow::anyhow!("no strand field in header: {:?}", header))?;
            (parts[1..strand_ind].join("|"), strand_ind)
        };

        if parts.len() < strand_ind + 7 {
            anyhow::bail!("too few fields in header: {:?}", header);
        }

        let strand: Strand = parts[strand_ind].parse()?;
        let bitscore: f64 = parts[strand_ind + 1].parse()?;
        let evalue: f64 = parts[strand_ind + 2].parse()?;
        let num_exons: usize = parts[strand_ind + 3].parse()?;
        let low: i64 = parts[strand_ind + 4].parse()?;
        let high: i64 = parts[strand_ind + 5].parse()?;
        let exons = parts[strand_ind + 6..]
            .iter()
            .map(|field| Exon::parse(field, strand))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GeneHeader {
            t_acc: parts[0].to_string(),
            c_acc,
            strand,
            bitscore,
            evalue,
            num_exons,
            low,
            high,
            exons,
        })
    }

    /// The gene id used to key predictions: `{contig}:{low}-{high}`.
    pub fn gene_id(&self) -> String {
        format!("{}:{}-{}", self.c_acc, self.low, self.high)
    }

    /// The ortholog id the reference accession belongs to (variant suffix
    /// stripped).
    pub fn sco_id(&self) -> String {
        self.t_acc
            .split('_')
            .next()
            .unwrap_or(&self.t_acc)
            .to_string()
    }

    /// Format the header back into the predictor's wire form.
    pub fn format(&self) -> String {
        let mut fields = vec![
            self.t_acc.clone(),
            self.c_acc.clone(),
            self.strand.to_string(),
            format!("{}", self.bitscore),
            format!("{:e}", self.evalue),
            format!("{}", self.num_exons),
            format!("{}", self.low),
            format!("{}", self.high),
        ];
        fields.extend(self.exons.iter().map(Exon::format));
        fields.join("|")
    }
}

/// Location of one predicted gene, used by the result writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneDetails {
    /// Genomic start.
    pub start: i64,
    /// Genomic end.
    pub end: i64,
    /// Strand.
    pub strand: Strand,
}

/// Load the gene-location lookup from a predictor header map file.
///
/// The header is the last tab-separated field of every line.  A missing
/// file is reported as [`err::Error::PredictorProducedNothing`] so the
/// orchestrator can decide whether the pass is fatal.
pub fn load_gene_details(
    path: &Path,
) -> Result<IndexMap<String, Vec<GeneDetails>>, anyhow::Error> {
    if !path.exists() {
        return Err(err::Error::PredictorProducedNothing(path.to_path_buf()).into());
    }

    let mut result: IndexMap<String, Vec<GeneDetails>> = IndexMap::new();
    for line in crate::common::io::read_lines(path)? {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let header = line.rsplit('\t').next().unwrap_or(&line);
        let header = GeneHeader::parse(header).map_err(|_| err::Error::HeaderMalformed {
            path: path.to_path_buf(),
            line: line.clone(),
        })?;
        result.entry(header.gene_id()).or_default().push(GeneDetails {
            start: header.low,
            end: header.high,
            strand: header.strand,
        });
    }

    Ok(result)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::common::Strand;

    use super::GeneHeader;

    const HEADER: &str = "10at123_1|contig1|+|250|1.5e-100|2|100|400|\
        100[100]:250[250]:151[151]|300[300]:400[400]:101[101]";

    #[test]
    fn parse_simple_header() -> Result<(), anyhow::Error> {
        let header = GeneHeader::parse(HEADER)?;

        assert_eq!("10at123_1", header.t_acc);
        assert_eq!("contig1", header.c_acc);
        assert_eq!(Strand::Forward, header.strand);
        assert_eq!(250.0, header.bitscore);
        assert_eq!(2, header.num_exons);
        assert_eq!(100, header.low);
        assert_eq!(400, header.high);
        assert_eq!(2, header.exons.len());
        assert_eq!(151, header.exons[0].nt_len);
        assert_eq!("contig1:100-400", header.gene_id());
        assert_eq!("10at123", header.sco_id());

        Ok(())
    }

    #[test]
    fn parse_contig_accession_with_pipes() -> Result<(), anyhow::Error> {
        let raw = "10at123_1|scaffold|42|1|-|99|2e-20|1|10|60|10[10]:60[60]:51[51]";
        let header = GeneHeader::parse(raw)?;

        assert_eq!("scaffold|42|1", header.c_acc);
        assert_eq!(Strand::Reverse, header.strand);
        assert_eq!("scaffold|42|1:10-60", header.gene_id());

        Ok(())
    }

    #[test]
    fn parse_corrects_reverse_strand_taken_low() -> Result<(), anyhow::Error> {
        // taken_high + taken_nt_len - 1 = 300 + 101 - 1 = 400 != 399
        let raw = "10at123_1|contig1|-|250|1e-50|1|300|400|300[399]:400[300]:101[101]";
        let header = GeneHeader::parse(raw)?;

        assert_eq!(400, header.exons[0].taken_low);

        Ok(())
    }

    #[test]
    fn parse_keeps_consistent_reverse_strand_taken_low() -> Result<(), anyhow::Error> {
        let raw = "10at123_1|contig1|-|250|1e-50|1|300|400|300[400]:400[300]:101[101]";
        let header = GeneHeader::parse(raw)?;

        assert_eq!(400, header.exons[0].taken_low);

        Ok(())
    }

    #[test]
    fn format_roundtrips() -> Result<(), anyhow::Error> {
        let header = GeneHeader::parse(HEADER)?;
        assert_eq!(HEADER, header.format());

        let reparsed = GeneHeader::parse(&header.format())?;
        assert_eq!(header, reparsed);

        Ok(())
    }

    #[rstest::rstest]
    #[case("10at123_1|contig1|+|250")]
    #[case("10at123_1|contig1|x|250|1e-5|1|10|60|10[10]:60[60]:51[51]")]
    #[case("10at123_1|contig1|+|250|1e-5|1|10|60|10:60:51")]
    fn parse_malformed_header_fails(#[case] raw: &str) {
        assert!(GeneHeader::parse(raw).is_err());
    }

    #[test]
    fn load_gene_details_reads_last_field() -> Result<(), anyhow::Error> {
        let tmp = temp_testdir::TempDir::default();
        let path = tmp.join("headers.tsv");
        std::fs::write(
            &path,
            format!("T0\tC0\textra\t{}\n", HEADER),
        )?;

        let details = super::load_gene_details(&path)?;
        assert_eq!(1, details.len());
        let entry = &details["contig1:100-400"][0];
        assert_eq!(100, entry.start);
        assert_eq!(400, entry.end);
        assert_eq!(Strand::Forward, entry.strand);

        Ok(())
    }

    #[test]
    fn load_gene_details_missing_file() {
        let res = super::load_gene_details(std::path::Path::new("/nonexistent/headers.tsv"));
        assert!(res.is_err());
    }
}
