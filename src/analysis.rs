use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Args;
use itertools::Itertools;
use log::{info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use rustc_hash::FxHashMap;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::align::TargetAnnotation;
use crate::demux::Demultiplexer;
use crate::extract::{extract_reads, BltRead};
use crate::logging::init_logging;
use crate::metrics::{
    BltMetric, DemuxSampleMetric, DemuxSummaryMetric, SampleMetric,
    SampleTargetMetric, TargetValidationMetric,
};
use crate::plot::Plotter;
use crate::samples::{Sample, SampleManifest};
use crate::util::{create_out_directory, get_master_progress_bar};
use crate::writers::{write_tsv, write_tsv_gz};

/// Upper mismatch bound of the specificity integral.
const SPECIFICITY_UPPER_BOUND: usize = 4;
/// Rolled-up per-target rows drawing on more than one UMI carry this marker.
const MULTIPLE_UMIS: &str = "multiple";

/// Reads collapsed over PCR duplicates: one observation per distinct
/// (UMI, guide, PAM, sample, stagger, random barcode, cut) group, carrying
/// every target sequence seen across the duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BltObservation {
    pub sample: usize,
    pub umi: String,
    pub targets: Vec<String>,
    pub cut: bool,
}

/// A validated UMI-to-target pairing with every observation that carries it,
/// across all samples sharing the guide and PAM.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub guide: String,
    pub pam: String,
    pub target: String,
    pub umi: String,
    pub observations: Vec<BltObservation>,
    pub annotation: TargetAnnotation,
}

#[derive(Hash, Eq, PartialEq, PartialOrd, Ord)]
struct ObservationKey<'a> {
    umi: String,
    guide: &'a [u8],
    pam: &'a [u8],
    sample: usize,
    stagger: usize,
    random_barcode: String,
    cut: bool,
}

/// Collapse PCR duplicates into observations. Consumes the read buffer so
/// its memory is released as soon as the observations exist.
pub fn build_observations(
    reads: Vec<BltRead>,
    manifest: &SampleManifest,
) -> Vec<BltObservation> {
    let samples = manifest.samples();
    let mut groups: FxHashMap<ObservationKey<'_>, Vec<(String, bool)>> =
        FxHashMap::default();
    for read in reads {
        let sample = &samples[read.sample];
        let key = ObservationKey {
            umi: read.umi,
            guide: &sample.guide,
            pam: &sample.pam,
            sample: read.sample,
            stagger: read.stagger,
            random_barcode: read.random_barcode,
            cut: read.cut,
        };
        groups.entry(key).or_default().push((read.target, read.cut));
    }
    groups
        .into_iter()
        .sorted_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(key, reads)| {
            assert!(
                reads.iter().all(|(_, cut)| *cut == key.cut),
                "mixed cut and uncut reads within a duplicate group for \
                 UMI {}",
                key.umi
            );
            BltObservation {
                sample: key.sample,
                umi: key.umi,
                targets: reads.into_iter().map(|(target, _)| target).collect(),
                cut: key.cut,
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ValidationOptions {
    pub min_uncut_reads: usize,
    pub min_identical_fraction: f64,
    pub use_cut_samples_in_validation: bool,
}

/// Validate each (UMI, guide, PAM) group against its uncut evidence. Emits a
/// validation metric row for every group and a `TargetInfo` for the groups
/// whose consensus passes. Consumes the observation buffer.
pub fn validate_targets(
    observations: Vec<BltObservation>,
    manifest: &SampleManifest,
    opts: &ValidationOptions,
) -> (Vec<TargetValidationMetric>, Vec<TargetInfo>) {
    let samples = manifest.samples();
    let mut groups: BTreeMap<(String, String, String), Vec<BltObservation>> =
        BTreeMap::new();
    for obs in observations {
        let sample = &samples[obs.sample];
        let key = (
            sample.guide_str().to_string(),
            sample.pam_str().to_string(),
            obs.umi.clone(),
        );
        groups.entry(key).or_default().push(obs);
    }

    let mut metrics = Vec::with_capacity(groups.len());
    let mut target_infos = Vec::new();
    for ((guide, pam, umi), group) in groups {
        let mut cut_sample_cut_reads = 0usize;
        let mut cut_sample_uncut_reads = 0usize;
        let mut naive_sample_cut_reads = 0usize;
        let mut naive_sample_uncut_reads = 0usize;
        for obs in group.iter() {
            let n = obs.targets.len();
            match (samples[obs.sample].cut, obs.cut) {
                (true, true) => cut_sample_cut_reads += n,
                (true, false) => cut_sample_uncut_reads += n,
                (false, true) => naive_sample_cut_reads += n,
                (false, false) => naive_sample_uncut_reads += n,
            }
        }

        let eligible = group
            .iter()
            .filter(|obs| {
                !obs.cut
                    && (!samples[obs.sample].cut
                        || opts.use_cut_samples_in_validation)
            })
            .flat_map(|obs| obs.targets.iter())
            .collect::<Vec<&String>>();
        let total_eligible = eligible.len();
        let consensus = eligible
            .iter()
            .counts()
            .into_iter()
            .sorted_by(|(seq_a, n_a), (seq_b, n_b)| {
                n_b.cmp(n_a).then(seq_a.cmp(seq_b))
            })
            .next()
            .map(|(seq, n)| ((*seq).clone(), n));
        let fraction_identical = consensus
            .as_ref()
            .map(|(_, top)| *top as f64 / total_eligible as f64);
        let valid = total_eligible >= opts.min_uncut_reads
            && fraction_identical.unwrap_or(0f64)
                >= opts.min_identical_fraction;

        let target =
            consensus.map(|(seq, _)| seq).unwrap_or_default();
        metrics.push(TargetValidationMetric {
            umi: umi.clone(),
            guide: guide.clone(),
            pam: pam.clone(),
            cut_sample_cut_reads,
            cut_sample_uncut_reads,
            naive_sample_cut_reads,
            naive_sample_uncut_reads,
            target: target.clone(),
            valid,
            fraction_identical,
        });

        if valid {
            let enzyme = samples[group[0].sample].enzyme;
            let annotation = TargetAnnotation::new(
                guide.as_bytes(),
                target.as_bytes(),
                enzyme.pam_is_5prime_of_target(),
            );
            target_infos.push(TargetInfo {
                guide,
                pam,
                target,
                umi,
                observations: group,
                annotation,
            });
        }
    }
    (metrics, target_infos)
}

/// 95% Wilson score interval for `successes` out of `total` trials.
pub(crate) fn wilson_interval_95(
    successes: usize,
    total: usize,
) -> (f64, f64) {
    if total == 0 {
        return (0f64, 0f64);
    }
    let z = Normal::new(0f64, 1f64).unwrap().inverse_cdf(0.975);
    let n = total as f64;
    let p = successes as f64 / n;
    let z2 = z * z;
    let denom = 1f64 + z2 / n;
    let center = p + z2 / (2f64 * n);
    let margin =
        z * ((p * (1f64 - p) / n) + z2 / (4f64 * n * n)).sqrt();
    ((center - margin) / denom, (center + margin) / denom)
}

/// Divide every row's cut rate and confidence bounds by the base rate of the
/// rows with neither mismatches nor indels. A pool that is empty or that was
/// never cut divides by one, so those samples report unnormalized rates.
fn normalize_rows(rows: &mut [SampleTargetMetric]) {
    let (cut, total) = rows
        .iter()
        .filter(|r| r.mismatches == 0 && r.indel_bases == 0)
        .fold((0usize, 0usize), |(c, t), r| {
            (c + r.obs_cut, t + r.obs_total)
        });
    let base_rate =
        if cut == 0 { 1f64 } else { cut as f64 / total as f64 };
    for row in rows.iter_mut() {
        row.normalized_cut_rate = row.cut_rate / base_rate;
        row.norm_cut_rate_ci95_low /= base_rate;
        row.norm_cut_rate_ci95_high /= base_rate;
    }
}

fn umi_metrics_for_sample(
    sample: &Sample,
    sample_idx: usize,
    target_infos: &[TargetInfo],
) -> Vec<SampleTargetMetric> {
    let mut rows = Vec::new();
    for info in target_infos {
        let obs_cut = info
            .observations
            .iter()
            .filter(|o| o.sample == sample_idx && o.cut)
            .count();
        let obs_uncut = info
            .observations
            .iter()
            .filter(|o| o.sample == sample_idx && !o.cut)
            .count();
        let obs_total = obs_cut + obs_uncut;
        if obs_total == 0 {
            continue;
        }
        let cut_rate = obs_cut as f64 / obs_total as f64;
        let (ci_low, ci_high) = wilson_interval_95(obs_cut, obs_total);
        let annotation = &info.annotation;
        rows.push(SampleTargetMetric {
            sample: sample.name.clone(),
            umi: info.umi.clone(),
            target: info.target.clone(),
            location: sample
                .location_of(&info.target)
                .unwrap_or_default()
                .to_string(),
            obs_cut,
            obs_uncut,
            obs_total,
            cut_rate,
            normalized_cut_rate: cut_rate,
            norm_cut_rate_ci95_low: ci_low,
            norm_cut_rate_ci95_high: ci_high,
            cigar: format!("{}", annotation.cigar),
            mismatches: annotation.mismatches,
            indel_bases: annotation.indel_bases,
            mean_mismatch_position: annotation.mean_mismatch_position(),
            mismatch_tuples: annotation.mismatch_tuples_string(),
            padded_guide: annotation.padded_guide.clone(),
            alignment: annotation.alignment.clone(),
            padded_target: annotation.padded_target.clone(),
        });
    }
    rows.sort_by(|a, b| a.umi.cmp(&b.umi).then(a.target.cmp(&b.target)));
    normalize_rows(&mut rows);
    rows
}

/// Roll per-UMI rows up by target sequence, re-deriving rates and intervals
/// from the summed observation counts.
fn target_metrics_for_sample(
    umi_rows: &[SampleTargetMetric],
) -> Vec<SampleTargetMetric> {
    let mut grouped: BTreeMap<&str, Vec<&SampleTargetMetric>> =
        BTreeMap::new();
    for row in umi_rows {
        grouped.entry(row.target.as_str()).or_default().push(row);
    }
    let mut rows = Vec::with_capacity(grouped.len());
    for (_, group) in grouped {
        let obs_cut = group.iter().map(|r| r.obs_cut).sum::<usize>();
        let obs_uncut = group.iter().map(|r| r.obs_uncut).sum::<usize>();
        let obs_total = obs_cut + obs_uncut;
        let cut_rate = obs_cut as f64 / obs_total as f64;
        let (ci_low, ci_high) = wilson_interval_95(obs_cut, obs_total);
        let first = group[0];
        let umi = if group.len() > 1 {
            MULTIPLE_UMIS.to_string()
        } else {
            first.umi.clone()
        };
        rows.push(SampleTargetMetric {
            umi,
            obs_cut,
            obs_uncut,
            obs_total,
            cut_rate,
            normalized_cut_rate: cut_rate,
            norm_cut_rate_ci95_low: ci_low,
            norm_cut_rate_ci95_high: ci_high,
            ..first.clone()
        });
    }
    normalize_rows(&mut rows);
    rows
}

/// Bucket the substitution-only per-target rows by mismatch count, emitting
/// a row for every count up to the maximum observed even when empty.
fn mismatch_rollup(
    sample: &Sample,
    target_rows: &[SampleTargetMetric],
) -> Vec<SampleMetric> {
    let eligible = target_rows
        .iter()
        .filter(|r| r.indel_bases == 0)
        .collect::<Vec<&SampleTargetMetric>>();
    let Some(max_observed) =
        eligible.iter().map(|r| r.mismatches).max()
    else {
        return Vec::new();
    };
    let mut rows = Vec::with_capacity(max_observed + 1);
    for mismatches in 0..=max_observed {
        let bucket = eligible
            .iter()
            .filter(|r| r.mismatches == mismatches)
            .collect::<Vec<_>>();
        let targets = bucket.len();
        let obs_cut = bucket.iter().map(|r| r.obs_cut).sum::<usize>();
        let obs_uncut = bucket.iter().map(|r| r.obs_uncut).sum::<usize>();
        let obs_total = obs_cut + obs_uncut;
        let cut_rate = if obs_total == 0 {
            0f64
        } else {
            obs_cut as f64 / obs_total as f64
        };
        rows.push(SampleMetric {
            sample: sample.name.clone(),
            mismatches,
            targets,
            obs_cut,
            obs_uncut,
            obs_total,
            cut_rate,
            normalized_cut_rate: cut_rate,
        });
    }
    let zero_rate = if rows[0].obs_total > 0 && rows[0].cut_rate > 0f64 {
        rows[0].cut_rate
    } else {
        1f64
    };
    for row in rows.iter_mut() {
        row.normalized_cut_rate = row.cut_rate / zero_rate;
    }
    // the zero-mismatch bucket is its own reference point
    rows[0].normalized_cut_rate =
        if rows[0].obs_total > 0 { 1f64 } else { 0f64 };
    rows
}

/// Area under the trapezoidal normalized cut-rate curve over mismatches
/// `1..=upper_bound`, divided by `upper_bound - 1`. Buckets that were never
/// observed contribute a rate of zero.
pub(crate) fn specificity_score(
    rows: &[SampleMetric],
    upper_bound: usize,
) -> f64 {
    assert!(upper_bound >= 2, "specificity upper bound must be at least 2");
    let rate = |mismatches: usize| {
        rows.iter()
            .find(|r| r.mismatches == mismatches)
            .map(|r| r.normalized_cut_rate)
            .unwrap_or(0f64)
    };
    let area = (1..upper_bound)
        .map(|m| (rate(m) + rate(m + 1)) / 2f64)
        .sum::<f64>();
    area / (upper_bound - 1) as f64
}

struct SampleOutput {
    metric: BltMetric,
    summary_path: PathBuf,
    is_cut: bool,
    has_data: bool,
}

fn process_sample(
    sample: &Sample,
    sample_idx: usize,
    target_infos: &[TargetInfo],
    out_dir: &Path,
    plotter: &Plotter,
) -> anyhow::Result<SampleOutput> {
    let sample_dir = out_dir.join(&sample.name);
    create_out_directory(&sample_dir)?;

    let umi_rows = umi_metrics_for_sample(sample, sample_idx, target_infos);
    let target_rows = target_metrics_for_sample(&umi_rows);
    let summary_rows = mismatch_rollup(sample, &target_rows);

    let umis_path = sample_dir.join(format!("{}.umis.txt.gz", sample.name));
    write_tsv_gz(
        &umis_path,
        SampleTargetMetric::header(),
        umi_rows.iter().map(|r| r.to_row()),
    )?;
    let targets_path =
        sample_dir.join(format!("{}.targets.txt.gz", sample.name));
    write_tsv_gz(
        &targets_path,
        SampleTargetMetric::header(),
        target_rows.iter().map(|r| r.to_row()),
    )?;
    let summary_path =
        sample_dir.join(format!("{}.summary.txt", sample.name));
    write_tsv(
        &summary_path,
        SampleMetric::header(),
        summary_rows.iter().map(|r| r.to_row()),
    )?;

    let has_data = !summary_rows.is_empty();
    if sample.cut && has_data {
        let pdf = sample_dir.join(format!("{}.pdf", sample.name));
        if let Err(e) = plotter.plot_targets(&targets_path, &pdf) {
            log::error!("failed to render {pdf:?}, {e:#}");
        }
    }

    let score = if has_data {
        specificity_score(&summary_rows, SPECIFICITY_UPPER_BOUND)
    } else {
        0f64
    };
    Ok(SampleOutput {
        metric: BltMetric {
            sample: sample.name.clone(),
            guide: sample.guide_str().to_string(),
            enzyme: sample.enzyme.to_string(),
            pam: sample.pam_str().to_string(),
            specificity_score: score,
        },
        summary_path,
        is_cut: sample.cut,
        has_data,
    })
}

/// Analyze the sequencing reads from one BLT experiment: demultiplex and
/// extract every read, collapse duplicates, validate UMI/target pairings,
/// and write per-UMI, per-target, per-sample, and experiment-wide metrics.
#[derive(Args)]
pub struct AnalyzeExperiment {
    /// Input FASTQ file(s), plain or gzipped, read in the order given.
    #[arg(short = 'i', long = "input", required = true, num_args = 1..)]
    inputs: Vec<PathBuf>,
    /// Tab-delimited sample manifest describing the samples in the
    /// experiment.
    #[arg(short = 's', long = "sample-manifest")]
    sample_manifest: PathBuf,
    /// Directory to write output files into, created if absent.
    #[arg(short = 'o', long = "output")]
    output: PathBuf,
    /// Maximum mismatches between a read and a sample barcode.
    #[arg(short = 'm', long, default_value_t = 2)]
    max_mismatches: usize,
    /// Minimum mismatch-count margin between the best and second-best
    /// sample barcode for a read to be assigned.
    #[arg(short = 'd', long, default_value_t = 2)]
    min_distance: usize,
    /// Minimum mean quality across the random barcode, target, and UMI.
    #[arg(short = 'q', long, default_value_t = 20f64)]
    min_quality: f64,
    /// Minimum uncut reads needed to validate a UMI/target pairing.
    #[arg(short = 'u', long, default_value_t = 3)]
    min_uncut_reads: usize,
    /// Minimum fraction of uncut reads that must agree on the target.
    #[arg(short = 'f', long, default_value_t = 0.9)]
    min_identical_fraction: f64,
    /// Use uncut reads from cut samples when validating targets.
    #[arg(short = 'c', long, default_value_t = false)]
    use_cut_samples_in_validation: bool,
    /// Library-wide target length for guides padded out to a fixed length.
    #[arg(short = 'l', long)]
    fixed_guide_length: Option<usize>,
    /// Number of threads to use for per-sample metric generation.
    #[arg(short = 't', long, default_value_t = 4)]
    threads: usize,
    /// Path to file to write run log.
    #[arg(long, alias = "log")]
    log_filepath: Option<PathBuf>,
    /// Hide the progress counters.
    #[arg(long, default_value_t = false, hide_short_help = true)]
    suppress_progress: bool,
    /// R interpreter used for plotting, found on the PATH by default.
    #[arg(long, hide_short_help = true)]
    rscript: Option<PathBuf>,
}

impl AnalyzeExperiment {
    fn validate(&self, manifest: &SampleManifest) -> anyhow::Result<()> {
        for input in self.inputs.iter() {
            File::open(input).with_context(|| {
                format!("input FASTQ {input:?} is not readable")
            })?;
        }
        if self.threads < 1 {
            bail!("threads must be at least 1, got {}", self.threads);
        }
        if self.min_uncut_reads < 1 {
            bail!(
                "min-uncut-reads must be at least 1, got {}",
                self.min_uncut_reads
            );
        }
        if !(0f64..=1f64).contains(&self.min_identical_fraction) {
            bail!(
                "min-identical-fraction must be within [0, 1], got {}",
                self.min_identical_fraction
            );
        }
        if let Some(fixed) = self.fixed_guide_length {
            let longest = manifest.max_guide_length();
            if fixed < longest {
                bail!(
                    "fixed-guide-length {fixed} is shorter than the longest \
                     guide in the manifest ({longest})"
                );
            }
        }
        let enzyme = manifest.samples()[0].enzyme;
        if manifest.samples().iter().any(|s| s.enzyme != enzyme) {
            bail!("all samples in a run must use the same enzyme");
        }
        Ok(())
    }

    pub fn run(&self) -> anyhow::Result<()> {
        let _handle = init_logging(self.log_filepath.as_ref());
        let manifest = SampleManifest::from_path(&self.sample_manifest)?;
        self.validate(&manifest)?;
        create_out_directory(&self.output)?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()?;

        let enzyme = manifest.samples()[0].enzyme;
        let demux = Demultiplexer::new(
            &manifest,
            self.max_mismatches,
            self.min_distance,
        );
        let extractor = enzyme.read_extractor(
            &manifest,
            demux,
            self.min_quality,
            self.fixed_guide_length,
        )?;
        let (reads, extractor) = extract_reads(
            self.inputs.clone(),
            extractor,
            self.suppress_progress,
        )?;
        let counts = extractor.counts();
        info!("extraction counts:\n{}", counts.counts_table());
        write_tsv(
            self.output.join("demultiplexing.summary.txt"),
            DemuxSummaryMetric::header(),
            [counts.summary_metric().to_row()],
        )?;
        write_tsv(
            self.output.join("demultiplexing.details.txt"),
            DemuxSampleMetric::header(),
            counts
                .sample_metrics(&manifest)
                .iter()
                .map(|m| m.to_row()),
        )?;

        let observations = build_observations(reads, &manifest);
        info!("collapsed duplicates into {} observations", observations.len());

        let validation_opts = ValidationOptions {
            min_uncut_reads: self.min_uncut_reads,
            min_identical_fraction: self.min_identical_fraction,
            use_cut_samples_in_validation: self.use_cut_samples_in_validation,
        };
        let (validation_metrics, target_infos) =
            validate_targets(observations, &manifest, &validation_opts);
        write_tsv_gz(
            self.output.join("target_validation.txt.gz"),
            TargetValidationMetric::header(),
            validation_metrics.iter().map(|m| m.to_row()),
        )?;
        info!(
            "validated {} of {} UMI/target pairings",
            target_infos.len(),
            validation_metrics.len()
        );
        drop(validation_metrics);

        let plotter = Plotter::new(self.rscript.clone());
        let progress = get_master_progress_bar(manifest.len());
        if self.suppress_progress {
            progress
                .set_draw_target(indicatif::ProgressDrawTarget::hidden());
        }
        progress.set_message("samples");
        let outputs = pool.install(|| {
            manifest
                .samples()
                .par_iter()
                .enumerate()
                .map(|(idx, sample)| {
                    let result = process_sample(
                        sample,
                        idx,
                        &target_infos,
                        &self.output,
                        &plotter,
                    );
                    progress.inc(1);
                    result
                })
                .collect::<anyhow::Result<Vec<SampleOutput>>>()
        })?;
        progress.finish_and_clear();

        let extra_keys = manifest.extra_attribute_keys();
        write_tsv(
            self.output.join("summary.txt"),
            BltMetric::header(&extra_keys),
            manifest.samples().iter().zip(outputs.iter()).map(
                |(sample, output)| {
                    let extras = extra_keys
                        .iter()
                        .map(|k| {
                            sample.extra.get(k).cloned().unwrap_or_default()
                        })
                        .collect::<Vec<String>>();
                    output.metric.to_row(&extras)
                },
            ),
        )?;

        let cut_summaries = outputs
            .iter()
            .filter(|o| o.is_cut && o.has_data)
            .map(|o| o.summary_path.clone())
            .collect::<Vec<PathBuf>>();
        if cut_summaries.is_empty() {
            warn!("###############################################");
            warn!("# No cut sample produced any usable targets.  #");
            warn!("# The cut-rate-by-mismatches plot was skipped #");
            warn!("# because there is nothing to draw.           #");
            warn!("###############################################");
        } else {
            let pdf = self.output.join("cut_rate_by_mismatches.pdf");
            if let Err(e) = plotter.plot_summary(&pdf, &cut_summaries) {
                log::error!("failed to render {pdf:?}, {e:#}");
            }
        }
        info!("done");
        Ok(())
    }
}

#[cfg(test)]
mod analysis_tests {
    use assert_approx_eq::assert_approx_eq;

    use super::*;
    use crate::samples::Enzyme;

    fn test_manifest(cut_flags: &[bool]) -> SampleManifest {
        let samples = cut_flags
            .iter()
            .enumerate()
            .map(|(i, &cut)| Sample {
                name: format!("s{}", i + 1),
                barcode: format!("{:A>15}", "C".repeat(i + 1))
                    .into_bytes(),
                guide: b"GGCCTCCCCAAAGCCTGGCCA".to_vec(),
                pam: b"GGGAGT".to_vec(),
                enzyme: Enzyme::Cas9,
                cut,
                off_targets: Default::default(),
                extra: Default::default(),
            })
            .collect();
        SampleManifest::new(samples).unwrap()
    }

    fn read(
        sample: usize,
        stagger: usize,
        rbc: &str,
        umi: &str,
        target: &str,
        cut: bool,
    ) -> BltRead {
        BltRead {
            sample,
            stagger,
            random_barcode: rbc.to_string(),
            umi: umi.to_string(),
            target: target.to_string(),
            cut,
        }
    }

    const UMI: &str = "AAAACCCCGGGG";
    const GUIDE: &str = "GGCCTCCCCAAAGCCTGGCCA";

    #[test]
    fn test_build_observations_collapses_duplicates() {
        let manifest = test_manifest(&[true]);
        let reads = vec![
            read(0, 1, "AACCGG", UMI, GUIDE, false),
            read(0, 1, "AACCGG", UMI, GUIDE, false),
            read(0, 2, "AACCGG", UMI, GUIDE, false),
            read(0, 1, "TTGGCC", UMI, GUIDE, true),
        ];
        let observations = build_observations(reads, &manifest);
        assert_eq!(observations.len(), 3);
        let duplicated = observations
            .iter()
            .find(|o| o.targets.len() == 2)
            .expect("two reads should have collapsed");
        assert!(!duplicated.cut);
        assert_eq!(duplicated.umi, UMI);
    }

    #[test]
    fn test_build_observations_is_idempotent() {
        let manifest = test_manifest(&[true]);
        let reads = vec![
            read(0, 1, "AACCGG", UMI, GUIDE, false),
            read(0, 2, "AACCGG", UMI, GUIDE, false),
            read(0, 3, "AACCGG", UMI, GUIDE, true),
        ];
        let first = build_observations(reads.clone(), &manifest);
        let second = build_observations(reads, &manifest);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_build_observations_keeps_differing_umi_lengths_apart() {
        // a one-base indel in the UMI keeps reads from the same molecule
        // from collapsing, a known limitation of the layout
        let manifest = test_manifest(&[true]);
        let reads = vec![
            read(0, 1, "AACCGG", "AAAACCCCGGGG", GUIDE, false),
            read(0, 1, "AACCGG", "AAAACCCCGGG", GUIDE, false),
        ];
        let observations = build_observations(reads, &manifest);
        assert_eq!(observations.len(), 2);
    }

    fn validation_opts(
        min_uncut_reads: usize,
        use_cut: bool,
    ) -> ValidationOptions {
        ValidationOptions {
            min_uncut_reads,
            min_identical_fraction: 0.9,
            use_cut_samples_in_validation: use_cut,
        }
    }

    #[test]
    fn test_validation_counts_and_consensus() {
        let manifest = test_manifest(&[true, false]);
        let observations = vec![
            BltObservation {
                sample: 0,
                umi: UMI.to_string(),
                targets: vec![GUIDE.to_string(); 4],
                cut: true,
            },
            BltObservation {
                sample: 1,
                umi: UMI.to_string(),
                targets: vec![GUIDE.to_string(); 3],
                cut: false,
            },
        ];
        let (metrics, infos) =
            validate_targets(observations, &manifest, &validation_opts(3, false));
        assert_eq!(metrics.len(), 1);
        let metric = &metrics[0];
        assert_eq!(metric.cut_sample_cut_reads, 4);
        assert_eq!(metric.cut_sample_uncut_reads, 0);
        assert_eq!(metric.naive_sample_uncut_reads, 3);
        assert_eq!(metric.target, GUIDE);
        assert!(metric.valid);
        assert_eq!(metric.fraction_identical, Some(1.0));
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].observations.len(), 2);
    }

    #[test]
    fn test_validation_cut_sample_reuse_flag() {
        let manifest = test_manifest(&[true, false]);
        let observations = || {
            vec![
                BltObservation {
                    sample: 0,
                    umi: UMI.to_string(),
                    targets: vec![GUIDE.to_string()],
                    cut: false,
                },
                BltObservation {
                    sample: 1,
                    umi: UMI.to_string(),
                    targets: vec![GUIDE.to_string()],
                    cut: false,
                },
            ]
        };
        let (metrics, infos) = validate_targets(
            observations(),
            &manifest,
            &validation_opts(2, false),
        );
        assert!(!metrics[0].valid);
        assert!(infos.is_empty());

        let (metrics, infos) = validate_targets(
            observations(),
            &manifest,
            &validation_opts(2, true),
        );
        assert!(metrics[0].valid);
        assert_eq!(infos.len(), 1);
    }

    #[test]
    fn test_validation_fraction_gate() {
        let manifest = test_manifest(&[false]);
        let other = format!("A{}", &GUIDE[1..]);
        let observations = vec![
            BltObservation {
                sample: 0,
                umi: UMI.to_string(),
                targets: vec![
                    GUIDE.to_string(),
                    GUIDE.to_string(),
                    other.clone(),
                ],
                cut: false,
            },
        ];
        let (metrics, infos) =
            validate_targets(observations, &manifest, &validation_opts(3, false));
        let metric = &metrics[0];
        assert!(!metric.valid, "2/3 identical is below 0.9");
        assert_eq!(metric.target, GUIDE);
        assert_approx_eq!(metric.fraction_identical.unwrap(), 2.0 / 3.0);
        assert!(infos.is_empty());
    }

    #[test]
    fn test_validation_no_eligible_reads_has_absent_fraction() {
        let manifest = test_manifest(&[true]);
        let observations = vec![BltObservation {
            sample: 0,
            umi: UMI.to_string(),
            targets: vec![GUIDE.to_string(); 2],
            cut: true,
        }];
        let (metrics, infos) =
            validate_targets(observations, &manifest, &validation_opts(1, false));
        let metric = &metrics[0];
        assert!(!metric.valid);
        assert!(metric.fraction_identical.is_none());
        assert_eq!(metric.target, "");
        assert!(infos.is_empty());
    }

    #[test]
    fn test_wilson_interval() {
        let (low, high) = wilson_interval_95(4, 5);
        assert_approx_eq!(low, 0.3755, 1e-3);
        assert_approx_eq!(high, 0.9638, 1e-3);
        let (low, high) = wilson_interval_95(0, 0);
        assert_eq!((low, high), (0.0, 0.0));
    }

    #[test]
    fn test_pure_match_metrics() {
        // one validated target identical to the guide, four cut and one
        // uncut observation in the cut sample
        let manifest = test_manifest(&[true, false]);
        let mut observations = Vec::new();
        // four cut observations, each modeling a distinct rbc group
        for _ in 0..4 {
            observations.push(BltObservation {
                sample: 0,
                umi: UMI.to_string(),
                targets: vec![GUIDE.to_string()],
                cut: true,
            });
        }
        observations.push(BltObservation {
            sample: 0,
            umi: UMI.to_string(),
            targets: vec![GUIDE.to_string()],
            cut: false,
        });
        for _ in 0..3 {
            observations.push(BltObservation {
                sample: 1,
                umi: UMI.to_string(),
                targets: vec![GUIDE.to_string()],
                cut: false,
            });
        }
        let (_, infos) =
            validate_targets(observations, &manifest, &validation_opts(3, false));
        assert_eq!(infos.len(), 1);
        let sample = &manifest.samples()[0];
        let umi_rows = umi_metrics_for_sample(sample, 0, &infos);
        assert_eq!(umi_rows.len(), 1);
        let row = &umi_rows[0];
        assert_eq!(row.obs_cut, 4);
        assert_eq!(row.obs_uncut, 1);
        assert_eq!(row.obs_total, 5);
        assert_approx_eq!(row.cut_rate, 0.8);
        assert_approx_eq!(row.normalized_cut_rate, 1.0);
        assert_eq!(row.mismatches, 0);
        assert_eq!(row.indel_bases, 0);
        assert_eq!(row.mismatch_tuples, "[]");

        let target_rows = target_metrics_for_sample(&umi_rows);
        assert_eq!(target_rows.len(), 1);
        assert_eq!(target_rows[0].umi, UMI);
        let summary_rows = mismatch_rollup(sample, &target_rows);
        assert_eq!(summary_rows.len(), 1);
        assert_eq!(summary_rows[0].mismatches, 0);
        assert_eq!(summary_rows[0].targets, 1);
        assert_approx_eq!(summary_rows[0].normalized_cut_rate, 1.0);
    }

    #[test]
    fn test_target_rollup_marks_multiple_umis() {
        let manifest = test_manifest(&[true, false]);
        let mut observations = Vec::new();
        for umi in ["AAAACCCCGGGG", "CCCCGGGGAAAA"] {
            for cut in [true, false] {
                observations.push(BltObservation {
                    sample: 0,
                    umi: umi.to_string(),
                    targets: vec![GUIDE.to_string()],
                    cut,
                });
            }
            for _ in 0..3 {
                observations.push(BltObservation {
                    sample: 1,
                    umi: umi.to_string(),
                    targets: vec![GUIDE.to_string()],
                    cut: false,
                });
            }
        }
        let (_, infos) =
            validate_targets(observations, &manifest, &validation_opts(3, false));
        assert_eq!(infos.len(), 2);
        let sample = &manifest.samples()[0];
        let umi_rows = umi_metrics_for_sample(sample, 0, &infos);
        assert_eq!(umi_rows.len(), 2);
        let target_rows = target_metrics_for_sample(&umi_rows);
        assert_eq!(target_rows.len(), 1);
        let row = &target_rows[0];
        assert_eq!(row.umi, MULTIPLE_UMIS);
        assert_eq!(row.obs_cut, 2);
        assert_eq!(row.obs_uncut, 2);
        assert_eq!(row.obs_total, 4);
    }

    #[test]
    fn test_mismatch_rollup_fills_empty_buckets() {
        let manifest = test_manifest(&[true]);
        let sample = &manifest.samples()[0];
        let row = |mismatches: usize, obs_cut: usize, obs_uncut: usize| {
            SampleTargetMetric {
                sample: sample.name.clone(),
                umi: UMI.to_string(),
                target: GUIDE.to_string(),
                location: String::new(),
                obs_cut,
                obs_uncut,
                obs_total: obs_cut + obs_uncut,
                cut_rate: obs_cut as f64 / (obs_cut + obs_uncut) as f64,
                normalized_cut_rate: 0.0,
                norm_cut_rate_ci95_low: 0.0,
                norm_cut_rate_ci95_high: 0.0,
                cigar: "21=".to_string(),
                mismatches,
                indel_bases: 0,
                mean_mismatch_position: None,
                mismatch_tuples: "[]".to_string(),
                padded_guide: GUIDE.to_string(),
                alignment: "|".repeat(GUIDE.len()),
                padded_target: GUIDE.to_string(),
            }
        };
        let rows = vec![row(0, 8, 2), row(3, 2, 8)];
        let rolled = mismatch_rollup(sample, &rows);
        assert_eq!(rolled.len(), 4);
        assert_approx_eq!(rolled[0].normalized_cut_rate, 1.0);
        assert_eq!(rolled[1].targets, 0);
        assert_eq!(rolled[1].obs_total, 0);
        assert_approx_eq!(rolled[1].cut_rate, 0.0);
        assert_approx_eq!(rolled[3].cut_rate, 0.2);
        assert_approx_eq!(rolled[3].normalized_cut_rate, 0.25);
    }

    #[test]
    fn test_specificity_score() {
        let rates = [
            (0usize, 1.0f64),
            (1, 0.9375),
            (2, 0.875),
            (3, 0.6875),
            (4, 0.5),
        ];
        let rows = rates
            .iter()
            .map(|&(mismatches, rate)| SampleMetric {
                sample: "s1".to_string(),
                mismatches,
                targets: 1,
                obs_cut: 1,
                obs_uncut: 1,
                obs_total: 2,
                cut_rate: rate,
                normalized_cut_rate: rate,
            })
            .collect::<Vec<SampleMetric>>();
        let score = specificity_score(&rows, 4);
        assert_approx_eq!(score, 0.76041, 1e-4);
    }

    #[test]
    fn test_specificity_score_missing_buckets_contribute_zero() {
        let rows = vec![SampleMetric {
            sample: "s1".to_string(),
            mismatches: 1,
            targets: 1,
            obs_cut: 1,
            obs_uncut: 0,
            obs_total: 1,
            cut_rate: 1.0,
            normalized_cut_rate: 0.9,
        }];
        let score = specificity_score(&rows, 4);
        assert_approx_eq!(score, 0.15, 1e-9);
    }

    #[test]
    fn test_reads_differing_only_in_cut_do_not_collapse() {
        let manifest = test_manifest(&[true]);
        let reads = vec![
            read(0, 1, "AACCGG", UMI, GUIDE, false),
            read(0, 1, "AACCGG", UMI, GUIDE, true),
        ];
        let observations = build_observations(reads, &manifest);
        assert_eq!(observations.len(), 2);
        assert_ne!(observations[0].cut, observations[1].cut);
    }
}
