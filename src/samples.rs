use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use indexmap::IndexMap;
use itertools::Itertools;
use log::debug;
use rustc_hash::FxHashMap;

use crate::errs::{BltError, BltResult};
use crate::util::{are_valid_bases, TAB};

pub(crate) const SAMPLE_COL: &str = "sample";
pub(crate) const BARCODE_COL: &str = "sample_barcode";
pub(crate) const GUIDE_COL: &str = "guide";
pub(crate) const ENZYME_COL: &str = "enzyme";
pub(crate) const PAM_COL: &str = "pam";
pub(crate) const CUT_COL: &str = "cut";
pub(crate) const OFF_TARGET_FILE_COL: &str = "off_target_file";

const REQUIRED_COLUMNS: [&str; 7] = [
    SAMPLE_COL,
    BARCODE_COL,
    GUIDE_COL,
    ENZYME_COL,
    PAM_COL,
    CUT_COL,
    OFF_TARGET_FILE_COL,
];

/// The nucleases this pipeline knows how to extract reads for. Each variant
/// carries the geometry of its PAM relative to the target; the matching read
/// extractor is constructed in the extract module.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Enzyme {
    Cas9,
}

impl Enzyme {
    pub fn parse(raw: &str) -> BltResult<Self> {
        if raw.eq_ignore_ascii_case("cas9") {
            Ok(Self::Cas9)
        } else {
            Err(BltError::UnknownEnzyme(raw.to_string()))
        }
    }

    pub fn pam_is_5prime_of_target(&self) -> bool {
        match self {
            Self::Cas9 => false,
        }
    }
}

impl Display for Enzyme {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cas9 => write!(f, "Cas9"),
        }
    }
}

fn parse_cut_flag(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "true" | "yes" | "t" | "y"
    )
}

fn parse_dna(raw: &str, what: &str) -> anyhow::Result<Vec<u8>> {
    let bases = raw.to_ascii_uppercase().into_bytes();
    if bases.is_empty() || !are_valid_bases(&bases, false) {
        Err(BltError::InvalidSequence(raw.to_string()))
            .context(format!("invalid {what}"))
    } else {
        Ok(bases)
    }
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub name: String,
    pub barcode: Vec<u8>,
    pub guide: Vec<u8>,
    pub pam: Vec<u8>,
    pub enzyme: Enzyme,
    pub cut: bool,
    /// target sequence (with PAM trimmed off) to genomic location
    pub off_targets: FxHashMap<String, String>,
    /// manifest columns this tool doesn't interpret, carried through to
    /// outputs in sorted key order
    pub extra: IndexMap<String, String>,
}

impl Sample {
    pub fn guide_str(&self) -> &str {
        std::str::from_utf8(&self.guide).unwrap()
    }

    pub fn pam_str(&self) -> &str {
        std::str::from_utf8(&self.pam).unwrap()
    }

    pub fn barcode_str(&self) -> &str {
        std::str::from_utf8(&self.barcode).unwrap()
    }

    pub fn location_of(&self, target: &str) -> Option<&str> {
        self.off_targets.get(target).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SampleManifest {
    samples: Vec<Sample>,
}

impl SampleManifest {
    pub fn from_path<P: AsRef<Path>>(p: P) -> anyhow::Result<Self> {
        let p = p.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(TAB as u8)
            .has_headers(true)
            .from_path(p)
            .with_context(|| format!("failed to open sample manifest {p:?}"))?;
        let headers = reader
            .headers()
            .context("failed to read sample manifest header")?
            .clone();
        for required in REQUIRED_COLUMNS {
            if !headers.iter().any(|h| h == required) {
                return Err(BltError::MissingColumn(required).into());
            }
        }
        fn get_field<'a>(
            headers: &csv::StringRecord,
            record: &'a csv::StringRecord,
            col: &str,
            row: usize,
        ) -> anyhow::Result<&'a str> {
            headers
                .iter()
                .position(|h| h == col)
                .and_then(|idx| record.get(idx))
                .ok_or_else(|| anyhow!("row {row} is missing column {col}"))
        }
        let mut samples = Vec::new();
        for (i, record) in reader.records().enumerate() {
            let record = record.with_context(|| {
                format!("failed to parse sample manifest row {}", i + 1)
            })?;
            let field = |col: &str| get_field(&headers, &record, col, i + 1);
            let name = field(SAMPLE_COL)?.to_string();
            let barcode = parse_dna(field(BARCODE_COL)?, "sample barcode")
                .with_context(|| format!("sample {name}"))?;
            let guide = parse_dna(field(GUIDE_COL)?, "guide")
                .with_context(|| format!("sample {name}"))?;
            let pam = parse_dna(field(PAM_COL)?, "PAM")
                .with_context(|| format!("sample {name}"))?;
            let enzyme = Enzyme::parse(field(ENZYME_COL)?)
                .with_context(|| format!("sample {name}"))?;
            let cut = parse_cut_flag(field(CUT_COL)?);
            let off_target_fp = field(OFF_TARGET_FILE_COL)?.trim().to_string();
            let off_targets = if off_target_fp.is_empty() {
                FxHashMap::default()
            } else {
                read_off_target_file(&PathBuf::from(&off_target_fp))
                    .with_context(|| {
                        format!(
                            "failed to read off-target file {off_target_fp} \
                             for sample {name}"
                        )
                    })?
            };
            let extra = headers
                .iter()
                .enumerate()
                .filter(|(_, h)| !REQUIRED_COLUMNS.contains(h))
                .filter_map(|(idx, h)| {
                    record.get(idx).map(|v| (h.to_string(), v.to_string()))
                })
                .collect::<IndexMap<String, String>>();
            samples.push(Sample {
                name,
                barcode,
                guide,
                pam,
                enzyme,
                cut,
                off_targets,
                extra,
            });
        }
        Self::new(samples)
    }

    pub fn new(samples: Vec<Sample>) -> anyhow::Result<Self> {
        if samples.is_empty() {
            return Err(BltError::EmptyManifest.into());
        }
        let mut seen = std::collections::HashSet::new();
        for sample in samples.iter() {
            if !seen.insert(sample.name.as_str()) {
                return Err(BltError::DuplicateSampleName(
                    sample.name.clone(),
                )
                .into());
            }
        }
        let barcode_length = samples[0].barcode.len();
        if let Some(ragged) =
            samples.iter().find(|s| s.barcode.len() != barcode_length)
        {
            return Err(
                BltError::RaggedBarcodes(ragged.name.clone()).into()
            );
        }
        debug!(
            "parsed manifest with {} samples, barcode length {barcode_length}",
            samples.len()
        );
        Ok(Self { samples })
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn barcode_length(&self) -> usize {
        self.samples[0].barcode.len()
    }

    pub fn max_guide_length(&self) -> usize {
        self.samples.iter().map(|s| s.guide.len()).max().unwrap_or(0)
    }

    /// Sorted union of the extra-attribute keys across all samples.
    pub fn extra_attribute_keys(&self) -> Vec<String> {
        self.samples
            .iter()
            .flat_map(|s| s.extra.keys().cloned())
            .unique()
            .sorted()
            .collect()
    }

    /// Render the manifest back to its tab-delimited form, required columns
    /// first then the extra attributes in sorted key order.
    pub fn format(&self) -> String {
        let extra_keys = self.extra_attribute_keys();
        let mut out = REQUIRED_COLUMNS.join("\t");
        for k in extra_keys.iter() {
            out.push(TAB);
            out.push_str(k);
        }
        out.push('\n');
        for sample in self.samples.iter() {
            let mut fields = vec![
                sample.name.clone(),
                sample.barcode_str().to_string(),
                sample.guide_str().to_string(),
                sample.enzyme.to_string(),
                sample.pam_str().to_string(),
                sample.cut.to_string(),
                String::new(),
            ];
            for k in extra_keys.iter() {
                fields.push(
                    sample.extra.get(k).cloned().unwrap_or_default(),
                );
            }
            out.push_str(&fields.join("\t"));
            out.push('\n');
        }
        out
    }
}

/// Headerless CSV mapping library target sequences to genomic locations,
/// produced by an off-target search tool. Only the `off_target` and `loc`
/// columns are used.
pub fn read_off_target_file(
    p: &PathBuf,
) -> anyhow::Result<FxHashMap<String, String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(p)
        .with_context(|| format!("failed to open off-target file {p:?}"))?;
    let mut mapping = FxHashMap::default();
    for (i, record) in reader.records().enumerate() {
        let record = record.with_context(|| {
            format!("failed to parse off-target row {}", i + 1)
        })?;
        if record.len() != 8 {
            return Err(BltError::MalformedOffTargetRow(record.len()).into());
        }
        let off_target = record.get(6).unwrap().to_ascii_uppercase();
        let loc = record.get(7).unwrap().to_string();
        if !are_valid_bases(off_target.as_bytes(), false) {
            return Err(
                BltError::InvalidSequence(off_target).into()
            );
        }
        if !loc.contains(':') {
            return Err(BltError::InvalidLocation(loc).into());
        }
        mapping.insert(off_target, loc);
    }
    Ok(mapping)
}
