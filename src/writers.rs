use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use gzp::deflate::Gzip;
use gzp::par::compress::{ParCompress, ParCompressBuilder};
use gzp::ZWriter;

/// Plain-text tab-separated writer with an optional header row. Metric rows
/// are pre-formatted strings; one writer owns one output file.
pub struct TsvWriter<W> {
    writer: W,
}

impl<W: Write> TsvWriter<W> {
    pub fn write_row(&mut self, row: &str) -> anyhow::Result<()> {
        self.writer.write_all(row.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl TsvWriter<BufWriter<File>> {
    pub fn new_path<P: AsRef<Path>>(
        path: P,
        header: Option<String>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let fh = File::create(path)
            .with_context(|| format!("failed to create {path:?}"))?;
        let mut writer = Self { writer: BufWriter::new(fh) };
        if let Some(header) = header {
            writer.write_row(&header)?;
        }
        Ok(writer)
    }

    pub fn finish(mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl TsvWriter<ParCompress<Gzip>> {
    pub fn new_gzip<P: AsRef<Path>>(
        path: P,
        threads: usize,
        header: Option<String>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let fh = File::create(path)
            .with_context(|| format!("failed to create {path:?}"))?;
        let writer = ParCompressBuilder::<Gzip>::new()
            .num_threads(threads.max(1))
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .from_writer(fh);
        let mut writer = Self { writer };
        if let Some(header) = header {
            writer.write_row(&header)?;
        }
        Ok(writer)
    }

    pub fn finish(mut self) -> anyhow::Result<()> {
        self.writer
            .finish()
            .map_err(|e| anyhow::anyhow!("failed to finish gzip stream, {e}"))
    }
}

/// Write a header plus rows to a plain TSV file in one shot.
pub fn write_tsv<P: AsRef<Path>>(
    path: P,
    header: String,
    rows: impl IntoIterator<Item = String>,
) -> anyhow::Result<()> {
    let mut writer = TsvWriter::new_path(path, Some(header))?;
    for row in rows {
        writer.write_row(&row)?;
    }
    writer.finish()
}

/// Write a header plus rows to a gzipped TSV file in one shot.
pub fn write_tsv_gz<P: AsRef<Path>>(
    path: P,
    header: String,
    rows: impl IntoIterator<Item = String>,
) -> anyhow::Result<()> {
    let mut writer = TsvWriter::new_gzip(path, 1, Some(header))?;
    for row in rows {
        writer.write_row(&row)?;
    }
    writer.finish()
}
