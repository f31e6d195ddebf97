use crate::samples::SampleManifest;
use crate::util::mismatches;

/// Assigns reads to samples by their sample barcode. A read is assigned only
/// when the best-matching barcode is within `max_mismatches` AND every other
/// barcode is at least `min_distance` mismatches worse, so near-ties fall
/// through as unassigned even when both candidates are within tolerance.
pub struct Demultiplexer {
    barcodes: Vec<Vec<u8>>,
    barcode_length: usize,
    max_mismatches: usize,
    min_distance: usize,
}

impl Demultiplexer {
    pub fn new(
        manifest: &SampleManifest,
        max_mismatches: usize,
        min_distance: usize,
    ) -> Self {
        let barcodes = manifest
            .samples()
            .iter()
            .map(|s| s.barcode.clone())
            .collect::<Vec<Vec<u8>>>();
        let barcode_length = manifest.barcode_length();
        Self { barcodes, barcode_length, max_mismatches, min_distance }
    }

    pub fn barcode_length(&self) -> usize {
        self.barcode_length
    }

    /// Index of the sample whose barcode uniquely matches
    /// `read[offset..offset + L]`, or `None` when no barcode is close enough
    /// or the match is ambiguous.
    pub fn assign(&self, read: &[u8], offset: usize) -> Option<usize> {
        // counts above this bound can neither win nor spoil a margin
        let bound = self.max_mismatches + self.min_distance;
        let counts = self
            .barcodes
            .iter()
            .map(|bc| {
                mismatches(
                    read,
                    offset,
                    bc,
                    0,
                    self.barcode_length,
                    bound + 1,
                )
            })
            .collect::<Vec<usize>>();
        let (best_idx, &best) =
            counts.iter().enumerate().min_by_key(|(_, &c)| c)?;
        if best > self.max_mismatches {
            return None;
        }
        let within_margin = counts
            .iter()
            .filter(|&&c| c < best + self.min_distance)
            .count();
        if within_margin == 1 {
            Some(best_idx)
        } else {
            None
        }
    }
}
