use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{anyhow, bail, Context};
use bio::io::fastq;
use crossbeam_channel::bounded;
use derive_new::new;
use flate2::read::MultiGzDecoder;
use log::{debug, info};
use prettytable::row;

use crate::demux::Demultiplexer;
use crate::metrics::{DemuxSampleMetric, DemuxSummaryMetric};
use crate::samples::{Enzyme, SampleManifest};
use crate::util::{
    find_subsequence, format_int_with_commas, get_ticker, mean_quality,
    mismatches,
};

pub(crate) const MIN_STAGGER: usize = 1;
pub(crate) const MAX_STAGGER: usize = 8;
const ANCHOR_MAX_MISMATCHES: usize = 2;
const RANDOM_BARCODE_LENGTH: usize = 6;
const SAMPLE_BARCODE_LENGTH: usize = 15;
const LEADING_TARGET_ANCHOR: &[u8] = b"ATCTG";
const LEADING_ANCHOR_MAX_MISMATCHES: usize = 1;
const PAM_SUFFIX: &[u8] = b"GC";
const UMI_LENGTH: usize = 12;
const UMI_LENGTH_TOLERANCE: usize = 1;
const UMI_DELIMITER: &[u8] = b"TGAC";
const MAX_CUT_STUB_LENGTH: usize = 8;

/// A fixed landmark in the read prefix. `expected_offset` is where the
/// anchor sits at the minimum stagger of one.
#[derive(new, Debug)]
struct Anchor {
    seq: &'static [u8],
    expected_offset: usize,
}

const ANCHOR1_SEQ: &[u8] = b"CGATCT";
const ANCHOR2_SEQ: &[u8] = b"TACGAC";
const ANCHOR3_SEQ: &[u8] = b"TTACCGAAGATAGCAGCCTAGTGGAACC";

fn left_anchors() -> [Anchor; 3] {
    [
        Anchor::new(ANCHOR1_SEQ, MIN_STAGGER),
        Anchor::new(
            ANCHOR2_SEQ,
            MIN_STAGGER + ANCHOR1_SEQ.len() + RANDOM_BARCODE_LENGTH,
        ),
        Anchor::new(
            ANCHOR3_SEQ,
            MIN_STAGGER
                + ANCHOR1_SEQ.len()
                + RANDOM_BARCODE_LENGTH
                + ANCHOR2_SEQ.len()
                + SAMPLE_BARCODE_LENGTH,
        ),
    ]
}

/// Offset of the sample barcode relative to the first post-stagger base.
const SAMPLE_BARCODE_OFFSET: usize = 18;
/// Length of the constant prefix from the first post-stagger base through
/// the end of the third anchor.
const PREFIX_LENGTH: usize = 61;

/// One successfully extracted read, carrying everything the analysis engine
/// needs: which sample it came from, the PCR-duplicate (random) barcode, the
/// molecule (target) barcode, the observed target sequence, and whether the
/// target appears cleaved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BltRead {
    pub sample: usize,
    pub stagger: usize,
    pub random_barcode: String,
    pub umi: String,
    pub target: String,
    pub cut: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExtractOutcome {
    Extracted(BltRead),
    FailedLandmarks,
    FailedSampleId,
    FailedExtract { sample: usize },
    FailedQuality { sample: usize },
}

/// Per-run extraction counters, tallied per read classification. These are
/// expected high-volume outcomes and never abort the run.
#[derive(Debug, Clone)]
pub struct ExtractCounts {
    pub total: usize,
    pub failed_landmarks: usize,
    pub failed_sample_id: usize,
    pub failed_extract: Vec<usize>,
    pub failed_quality: Vec<usize>,
    pub extracted: Vec<usize>,
}

impl ExtractCounts {
    fn new(n_samples: usize) -> Self {
        Self {
            total: 0,
            failed_landmarks: 0,
            failed_sample_id: 0,
            failed_extract: vec![0; n_samples],
            failed_quality: vec![0; n_samples],
            extracted: vec![0; n_samples],
        }
    }

    fn tally(&mut self, outcome: &ExtractOutcome) {
        self.total += 1;
        match outcome {
            ExtractOutcome::Extracted(read) => {
                self.extracted[read.sample] += 1
            }
            ExtractOutcome::FailedLandmarks => self.failed_landmarks += 1,
            ExtractOutcome::FailedSampleId => self.failed_sample_id += 1,
            ExtractOutcome::FailedExtract { sample } => {
                self.failed_extract[*sample] += 1
            }
            ExtractOutcome::FailedQuality { sample } => {
                self.failed_quality[*sample] += 1
            }
        }
    }

    pub fn summary_metric(&self) -> DemuxSummaryMetric {
        DemuxSummaryMetric {
            total_reads: self.total,
            failed_landmarks: self.failed_landmarks,
            failed_sample_id: self.failed_sample_id,
            failed_extract: self.failed_extract.iter().sum(),
            failed_quality: self.failed_quality.iter().sum(),
            extracted: self.extracted.iter().sum(),
        }
    }

    pub fn sample_metrics(
        &self,
        manifest: &SampleManifest,
    ) -> Vec<DemuxSampleMetric> {
        manifest
            .samples()
            .iter()
            .enumerate()
            .map(|(i, sample)| {
                let extracted = self.extracted[i];
                let failed_extract = self.failed_extract[i];
                let failed_quality = self.failed_quality[i];
                DemuxSampleMetric {
                    sample: sample.name.clone(),
                    barcode: sample.barcode_str().to_string(),
                    total_reads: extracted + failed_extract + failed_quality,
                    failed_extract,
                    failed_quality,
                    extracted,
                }
            })
            .collect()
    }

    pub(crate) fn counts_table(&self) -> prettytable::Table {
        let mut tab = prettytable::Table::new();
        tab.set_format(
            *prettytable::format::consts::FORMAT_NO_LINESEP_WITH_TITLE,
        );
        tab.set_titles(row!["classification", "count"]);
        tab.add_row(row!["total", self.total]);
        tab.add_row(row!["failed_to_id_landmarks", self.failed_landmarks]);
        tab.add_row(row!["failed_to_id_sample", self.failed_sample_id]);
        tab.add_row(row![
            "failed_to_extract_target",
            self.failed_extract.iter().sum::<usize>()
        ]);
        tab.add_row(row![
            "failed_quality",
            self.failed_quality.iter().sum::<usize>()
        ]);
        tab.add_row(row!["extracted", self.extracted.iter().sum::<usize>()]);
        tab
    }
}

impl Enzyme {
    /// Build the read extractor matching this enzyme's tail layout.
    pub fn read_extractor(
        &self,
        manifest: &SampleManifest,
        demux: Demultiplexer,
        min_quality: f64,
        fixed_guide_length: Option<usize>,
    ) -> anyhow::Result<ReadExtractor> {
        match self {
            Self::Cas9 => Cas9ReadExtractor::new(
                manifest,
                demux,
                min_quality,
                fixed_guide_length,
            )
            .map(ReadExtractor::Cas9),
        }
    }
}

pub enum ReadExtractor {
    Cas9(Cas9ReadExtractor),
}

impl ReadExtractor {
    pub fn process(&mut self, record: &fastq::Record) -> Option<BltRead> {
        match self {
            Self::Cas9(x) => x.process(record),
        }
    }

    pub fn counts(&self) -> &ExtractCounts {
        match self {
            Self::Cas9(x) => &x.counts,
        }
    }
}

/// Extractor for the Cas9 tail layout,
/// `ATCTG · target · PAM · GC · umi[12±1] · TGAC · <adapter>`, where a cut
/// target leaves a stub of at most eight bases before the PAM.
pub struct Cas9ReadExtractor {
    demux: Demultiplexer,
    // (guide length, PAM + GC) per sample
    guides: Vec<(usize, Vec<u8>)>,
    min_quality: f64,
    fixed_guide_length: Option<usize>,
    counts: ExtractCounts,
}

impl Cas9ReadExtractor {
    pub fn new(
        manifest: &SampleManifest,
        demux: Demultiplexer,
        min_quality: f64,
        fixed_guide_length: Option<usize>,
    ) -> anyhow::Result<Self> {
        if manifest.barcode_length() != SAMPLE_BARCODE_LENGTH {
            bail!(
                "the read layout carries sample barcodes of length \
                 {SAMPLE_BARCODE_LENGTH}, manifest has length {}",
                manifest.barcode_length()
            );
        }
        let guides = manifest
            .samples()
            .iter()
            .map(|s| {
                let mut pam_plus = s.pam.clone();
                pam_plus.extend_from_slice(PAM_SUFFIX);
                (s.guide.len(), pam_plus)
            })
            .collect();
        Ok(Self {
            demux,
            guides,
            min_quality,
            fixed_guide_length,
            counts: ExtractCounts::new(manifest.len()),
        })
    }

    /// Classify one record and tally the outcome, returning the read when
    /// extraction succeeded.
    pub fn process(&mut self, record: &fastq::Record) -> Option<BltRead> {
        let outcome = self.extract(record.seq(), record.qual());
        self.counts.tally(&outcome);
        match outcome {
            ExtractOutcome::Extracted(read) => Some(read),
            _ => None,
        }
    }

    fn locate_stagger(&self, bases: &[u8]) -> Option<usize> {
        for anchor in left_anchors() {
            let window_end = std::cmp::min(
                anchor.expected_offset
                    + (MAX_STAGGER - MIN_STAGGER)
                    + anchor.seq.len(),
                bases.len(),
            );
            if anchor.expected_offset >= window_end {
                continue;
            }
            if let Some(found) = find_subsequence(
                &bases[..window_end],
                anchor.seq,
                anchor.expected_offset,
            ) {
                return Some(found - anchor.expected_offset + MIN_STAGGER);
            }
        }
        None
    }

    fn verify_anchors(&self, bases: &[u8], stagger: usize) -> bool {
        left_anchors().iter().all(|anchor| {
            let offset = anchor.expected_offset - MIN_STAGGER + stagger;
            offset + anchor.seq.len() <= bases.len()
                && mismatches(
                    bases,
                    offset,
                    anchor.seq,
                    0,
                    anchor.seq.len(),
                    ANCHOR_MAX_MISMATCHES + 1,
                ) <= ANCHOR_MAX_MISMATCHES
        })
    }

    fn extract(&self, bases: &[u8], quals: &[u8]) -> ExtractOutcome {
        assert_eq!(
            bases.len(),
            quals.len(),
            "record has {} bases but {} qualities",
            bases.len(),
            quals.len()
        );

        let Some(stagger) = self.locate_stagger(bases) else {
            return ExtractOutcome::FailedLandmarks;
        };
        if !self.verify_anchors(bases, stagger) {
            return ExtractOutcome::FailedLandmarks;
        }

        let Some(sample) =
            self.demux.assign(bases, stagger + SAMPLE_BARCODE_OFFSET)
        else {
            return ExtractOutcome::FailedSampleId;
        };

        let (guide_length, pam_plus) = &self.guides[sample];
        let tail_start = stagger + PREFIX_LENGTH;
        let Some(pam_offset) = find_subsequence(bases, pam_plus, tail_start)
        else {
            return ExtractOutcome::FailedExtract { sample };
        };
        let pam_plus_end = pam_offset + pam_plus.len();

        let leading_mismatches = if tail_start + LEADING_TARGET_ANCHOR.len()
            <= pam_offset
        {
            mismatches(
                bases,
                tail_start,
                LEADING_TARGET_ANCHOR,
                0,
                LEADING_TARGET_ANCHOR.len(),
                LEADING_ANCHOR_MAX_MISMATCHES + 1,
            )
        } else {
            // the leading anchor cannot fit before the PAM, the target was
            // cut into it
            LEADING_ANCHOR_MAX_MISMATCHES + 1
        };

        let Some(delimiter_offset) = find_subsequence(
            bases,
            UMI_DELIMITER,
            pam_plus_end + UMI_LENGTH - UMI_LENGTH_TOLERANCE,
        ) else {
            return ExtractOutcome::FailedExtract { sample };
        };
        let umi_length = delimiter_offset - pam_plus_end;
        if umi_length < UMI_LENGTH - UMI_LENGTH_TOLERANCE
            || umi_length > UMI_LENGTH + UMI_LENGTH_TOLERANCE
        {
            return ExtractOutcome::FailedExtract { sample };
        }

        let expected_target_length =
            self.fixed_guide_length.unwrap_or(*guide_length);
        let target_anchor_end = tail_start + LEADING_TARGET_ANCHOR.len();
        let (cut, target_offset, target_length) = if leading_mismatches
            <= LEADING_ANCHOR_MAX_MISMATCHES
            && pam_offset >= target_anchor_end + expected_target_length - 2
        {
            let padding = self
                .fixed_guide_length
                .map(|l| l - guide_length)
                .unwrap_or(0);
            let target_offset = target_anchor_end + padding;
            (false, target_offset, pam_offset - target_offset)
        } else if pam_offset - tail_start <= MAX_CUT_STUB_LENGTH {
            (true, tail_start, pam_offset - tail_start)
        } else {
            return ExtractOutcome::FailedExtract { sample };
        };

        let rbc_range =
            stagger + ANCHOR1_SEQ.len()..stagger + ANCHOR1_SEQ.len() + RANDOM_BARCODE_LENGTH;
        let target_range = target_offset..target_offset + target_length;
        let umi_range = pam_plus_end..delimiter_offset;
        let mean_q = mean_quality(
            quals,
            &[rbc_range.clone(), target_range.clone(), umi_range.clone()],
        );
        if mean_q < self.min_quality {
            return ExtractOutcome::FailedQuality { sample };
        }

        let read = BltRead {
            sample,
            stagger,
            random_barcode: String::from_utf8_lossy(&bases[rbc_range])
                .into_owned(),
            umi: String::from_utf8_lossy(&bases[umi_range]).into_owned(),
            target: String::from_utf8_lossy(&bases[target_range])
                .into_owned(),
            cut,
        };
        ExtractOutcome::Extracted(read)
    }
}

/// Lazily iterate the records of one or more FASTQ files, gzipped or plain,
/// in the order given.
pub struct FastqSource {
    paths: std::vec::IntoIter<PathBuf>,
    current: Option<fastq::Records<std::io::BufReader<Box<dyn Read + Send>>>>,
    current_path: PathBuf,
}

impl FastqSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths: paths.into_iter(),
            current: None,
            current_path: PathBuf::new(),
        }
    }

    fn open(p: &Path) -> anyhow::Result<
        fastq::Records<std::io::BufReader<Box<dyn Read + Send>>>,
    > {
        let fh = File::open(p)
            .with_context(|| format!("failed to open FASTQ {p:?}"))?;
        let gzipped = p
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("gz"))
            .unwrap_or(false);
        let reader: Box<dyn Read + Send> = if gzipped {
            Box::new(MultiGzDecoder::new(fh))
        } else {
            Box::new(fh)
        };
        debug!("reading records from {p:?}");
        Ok(fastq::Reader::new(reader).records())
    }
}

impl Iterator for FastqSource {
    type Item = anyhow::Result<fastq::Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(records) = self.current.as_mut() {
                match records.next() {
                    Some(Ok(record)) => return Some(Ok(record)),
                    Some(Err(e)) => {
                        return Some(Err(anyhow!(
                            "malformed FASTQ record in {:?}, {e}",
                            self.current_path
                        )))
                    }
                    None => self.current = None,
                }
            }
            match self.paths.next() {
                Some(p) => match Self::open(&p) {
                    Ok(records) => {
                        self.current = Some(records);
                        self.current_path = p;
                    }
                    Err(e) => return Some(Err(e)),
                },
                None => return None,
            }
        }
    }
}

const PROGRESS_INTERVAL: usize = 2_500_000;

/// Stream every record through the extractor on a producer thread, buffering
/// the extracted reads. Returns the materialized reads together with the
/// extraction counters.
pub fn extract_reads(
    inputs: Vec<PathBuf>,
    mut extractor: ReadExtractor,
    suppress_progress: bool,
) -> anyhow::Result<(Vec<BltRead>, ReadExtractor)> {
    let (snd, rcv) = bounded::<anyhow::Result<BltRead>>(100_000);
    thread::scope(|scope| {
        let handle = scope.spawn(move || {
            let source = FastqSource::new(inputs);
            for record in source {
                match record {
                    Ok(record) => {
                        let read = extractor.process(&record);
                        let processed = extractor.counts().total;
                        if processed % PROGRESS_INTERVAL == 0 {
                            info!(
                                "processed {} reads",
                                format_int_with_commas(processed as isize)
                            );
                        }
                        if let Some(read) = read {
                            if snd.send(Ok(read)).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = snd.send(Err(e));
                        break;
                    }
                }
            }
            drop(snd);
            extractor
        });

        let ticker = get_ticker();
        if suppress_progress {
            ticker.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        }
        ticker.set_message("reads extracted");
        let mut reads = Vec::new();
        let mut result = Ok(());
        for read in rcv {
            match read {
                Ok(read) => {
                    reads.push(read);
                    ticker.inc(1);
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        ticker.finish_and_clear();
        let extractor = handle
            .join()
            .map_err(|_| anyhow!("extraction thread panicked"))?;
        result?;
        let counts = extractor.counts();
        info!(
            "processed {} reads, extracted {}",
            format_int_with_commas(counts.total as isize),
            format_int_with_commas(reads.len() as isize)
        );
        Ok((reads, extractor))
    })
}
