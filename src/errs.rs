use thiserror::Error;

pub type BltResult<T> = Result<T, BltError>;

#[derive(Error, Debug, PartialEq)]
pub enum BltError {
    #[error("invalid DNA sequence {0}")]
    InvalidSequence(String),
    #[error("duplicate sample name {0}")]
    DuplicateSampleName(String),
    #[error("sample barcodes must all have the same length, {0} differs")]
    RaggedBarcodes(String),
    #[error("unknown enzyme {0}")]
    UnknownEnzyme(String),
    #[error("manifest is missing required column {0}")]
    MissingColumn(&'static str),
    #[error("manifest has no samples")]
    EmptyManifest,
    #[error("off-target row has {0} fields, expected 8")]
    MalformedOffTargetRow(usize),
    #[error("off-target location {0} is missing a colon")]
    InvalidLocation(String),
}
