use std::fmt::Display;

use crate::util::TAB;

fn join_fields(fields: &[String]) -> String {
    fields.join(&TAB.to_string())
}

fn fmt_opt<T: Display>(value: &Option<T>) -> String {
    value.as_ref().map(|v| format!("{v}")).unwrap_or_default()
}

fn frac(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0f64
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Experiment-wide demultiplexing tally, one row per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemuxSummaryMetric {
    pub total_reads: usize,
    pub failed_landmarks: usize,
    pub failed_sample_id: usize,
    pub failed_extract: usize,
    pub failed_quality: usize,
    pub extracted: usize,
}

impl DemuxSummaryMetric {
    pub fn header() -> String {
        [
            "total_reads",
            "failed_to_id_landmarks",
            "failed_to_id_sample",
            "failed_to_extract_target",
            "failed_quality",
            "extracted",
            "frac_extracted",
        ]
        .join(&TAB.to_string())
    }

    pub fn to_row(&self) -> String {
        join_fields(&[
            self.total_reads.to_string(),
            self.failed_landmarks.to_string(),
            self.failed_sample_id.to_string(),
            self.failed_extract.to_string(),
            self.failed_quality.to_string(),
            self.extracted.to_string(),
            frac(self.extracted, self.total_reads).to_string(),
        ])
    }
}

/// Per-sample demultiplexing tally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemuxSampleMetric {
    pub sample: String,
    pub barcode: String,
    pub total_reads: usize,
    pub failed_extract: usize,
    pub failed_quality: usize,
    pub extracted: usize,
}

impl DemuxSampleMetric {
    pub fn header() -> String {
        [
            "sample",
            "barcode",
            "total_reads",
            "failed_to_extract_target",
            "failed_quality",
            "extracted",
            "frac_extracted",
        ]
        .join(&TAB.to_string())
    }

    pub fn to_row(&self) -> String {
        join_fields(&[
            self.sample.clone(),
            self.barcode.clone(),
            self.total_reads.to_string(),
            self.failed_extract.to_string(),
            self.failed_quality.to_string(),
            self.extracted.to_string(),
            frac(self.extracted, self.total_reads).to_string(),
        ])
    }
}

/// One row per observed (UMI, guide, PAM) triple describing whether the
/// UMI-to-target pairing could be validated from uncut evidence.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetValidationMetric {
    pub umi: String,
    pub guide: String,
    pub pam: String,
    pub cut_sample_cut_reads: usize,
    pub cut_sample_uncut_reads: usize,
    pub naive_sample_cut_reads: usize,
    pub naive_sample_uncut_reads: usize,
    /// consensus target sequence, empty when no eligible uncut reads exist
    pub target: String,
    pub valid: bool,
    pub fraction_identical: Option<f64>,
}

impl TargetValidationMetric {
    pub fn header() -> String {
        [
            "umi",
            "guide",
            "pam",
            "cut_sample_cut_reads",
            "cut_sample_uncut_reads",
            "naive_sample_cut_reads",
            "naive_sample_uncut_reads",
            "target",
            "valid",
            "fraction_identical",
        ]
        .join(&TAB.to_string())
    }

    pub fn to_row(&self) -> String {
        join_fields(&[
            self.umi.clone(),
            self.guide.clone(),
            self.pam.clone(),
            self.cut_sample_cut_reads.to_string(),
            self.cut_sample_uncut_reads.to_string(),
            self.naive_sample_cut_reads.to_string(),
            self.naive_sample_uncut_reads.to_string(),
            self.target.clone(),
            self.valid.to_string(),
            fmt_opt(&self.fraction_identical),
        ])
    }
}

/// Cut-rate metrics for one target in one sample. The same shape serves the
/// per-UMI table and the per-target table; a per-target row rolled up from
/// more than one UMI carries `umi = "multiple"`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleTargetMetric {
    pub sample: String,
    pub umi: String,
    pub target: String,
    /// genomic location from the sample's off-target mapping, empty when
    /// unmapped
    pub location: String,
    pub obs_cut: usize,
    pub obs_uncut: usize,
    pub obs_total: usize,
    pub cut_rate: f64,
    pub normalized_cut_rate: f64,
    pub norm_cut_rate_ci95_low: f64,
    pub norm_cut_rate_ci95_high: f64,
    pub cigar: String,
    pub mismatches: usize,
    pub indel_bases: usize,
    pub mean_mismatch_position: Option<f64>,
    pub mismatch_tuples: String,
    pub padded_guide: String,
    pub alignment: String,
    pub padded_target: String,
}

impl SampleTargetMetric {
    pub fn header() -> String {
        [
            "sample",
            "umi",
            "target",
            "location",
            "obs_cut",
            "obs_uncut",
            "obs_total",
            "cut_rate",
            "normalized_cut_rate",
            "norm_cut_rate_ci95_low",
            "norm_cut_rate_ci95_high",
            "cigar",
            "mismatches",
            "indel_bases",
            "mean_mismatch_position",
            "mismatch_tuples",
            "padded_guide",
            "alignment",
            "padded_target",
        ]
        .join(&TAB.to_string())
    }

    pub fn to_row(&self) -> String {
        assert_eq!(
            self.obs_total,
            self.obs_cut + self.obs_uncut,
            "obs_total must equal obs_cut + obs_uncut"
        );
        assert!(
            self.padded_guide.len() == self.alignment.len()
                && self.alignment.len() == self.padded_target.len(),
            "padded guide/alignment/target must have equal lengths"
        );
        join_fields(&[
            self.sample.clone(),
            self.umi.clone(),
            self.target.clone(),
            self.location.clone(),
            self.obs_cut.to_string(),
            self.obs_uncut.to_string(),
            self.obs_total.to_string(),
            self.cut_rate.to_string(),
            self.normalized_cut_rate.to_string(),
            self.norm_cut_rate_ci95_low.to_string(),
            self.norm_cut_rate_ci95_high.to_string(),
            self.cigar.clone(),
            self.mismatches.to_string(),
            self.indel_bases.to_string(),
            fmt_opt(&self.mean_mismatch_position),
            self.mismatch_tuples.clone(),
            self.padded_guide.clone(),
            self.alignment.clone(),
            self.padded_target.clone(),
        ])
    }
}

/// Cut rates for one sample bucketed by mismatch count, substitution-only
/// targets.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleMetric {
    pub sample: String,
    pub mismatches: usize,
    pub targets: usize,
    pub obs_cut: usize,
    pub obs_uncut: usize,
    pub obs_total: usize,
    pub cut_rate: f64,
    pub normalized_cut_rate: f64,
}

impl SampleMetric {
    pub fn header() -> String {
        [
            "sample",
            "mismatches",
            "targets",
            "obs_cut",
            "obs_uncut",
            "obs_total",
            "cut_rate",
            "normalized_cut_rate",
        ]
        .join(&TAB.to_string())
    }

    pub fn to_row(&self) -> String {
        join_fields(&[
            self.sample.clone(),
            self.mismatches.to_string(),
            self.targets.to_string(),
            self.obs_cut.to_string(),
            self.obs_uncut.to_string(),
            self.obs_total.to_string(),
            self.cut_rate.to_string(),
            self.normalized_cut_rate.to_string(),
        ])
    }
}

/// The per-sample specificity score, one row per sample in the experiment
/// summary. Extra manifest attributes are appended in sorted key order.
#[derive(Debug, Clone, PartialEq)]
pub struct BltMetric {
    pub sample: String,
    pub guide: String,
    pub enzyme: String,
    pub pam: String,
    pub specificity_score: f64,
}

impl BltMetric {
    pub fn header(extra_keys: &[String]) -> String {
        let mut fields = vec![
            "sample".to_string(),
            "guide".to_string(),
            "enzyme".to_string(),
            "pam".to_string(),
            "specificity_score".to_string(),
        ];
        fields.extend(extra_keys.iter().cloned());
        fields.join(&TAB.to_string())
    }

    pub fn to_row(&self, extras: &[String]) -> String {
        let mut fields = vec![
            self.sample.clone(),
            self.guide.clone(),
            self.enzyme.clone(),
            self.pam.clone(),
            self.specificity_score.to_string(),
        ];
        fields.extend(extras.iter().cloned());
        join_fields(&fields)
    }
}
