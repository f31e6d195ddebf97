use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::{anyhow, Result as AnyhowResult};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

pub const GUIDE: &str = "GGCCTCCCCAAAGCCTGGCCA";
pub const PAM: &str = "GGGAGT";
pub const S1_BARCODE: &str = "ACACACACACACACA";
pub const S2_BARCODE: &str = "GTGTGTGTGTGTGTG";

pub fn run_blt(args: &[&str]) -> AnyhowResult<Output> {
    let exe = Path::new(env!("CARGO_BIN_EXE_blt"));
    assert!(exe.exists());

    let output = std::process::Command::new(exe)
        .args(args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?
        .wait_with_output()?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(anyhow!("failed to run {:?}", args.join(" ")))
    }
}

pub fn uncut_read_bases(
    stagger: usize,
    barcode: &str,
    rbc: &str,
    target: &str,
    umi: &str,
) -> String {
    format!(
        "{}CGATCT{}TACGAC{}TTACCGAAGATAGCAGCCTAGTGGAACCATCTG{}{}GC{}TGACAGATCGGAAGAGCACACGTCTGAACTCCAGTCAC",
        "T".repeat(stagger),
        rbc,
        barcode,
        target,
        PAM,
        umi,
    )
}

pub fn cut_read_bases(
    stagger: usize,
    barcode: &str,
    rbc: &str,
    stub: &str,
    umi: &str,
) -> String {
    format!(
        "{}CGATCT{}TACGAC{}TTACCGAAGATAGCAGCCTAGTGGAACC{}{}GC{}TGACAGATCGGAAGAGCACACGTCTGAACTCCAGTCAC",
        "T".repeat(stagger),
        rbc,
        barcode,
        stub,
        PAM,
        umi,
    )
}

pub fn fastq_record(name: &str, bases: &str) -> String {
    format!("@{name}\n{bases}\n+\n{}\n", "I".repeat(bases.len()))
}

pub fn write_fastq_gz(path: &PathBuf, records: &[String]) {
    let fh = File::create(path).unwrap();
    let mut encoder = GzEncoder::new(fh, Compression::default());
    for record in records {
        encoder.write_all(record.as_bytes()).unwrap();
    }
    encoder.finish().unwrap();
}

pub fn write_manifest(path: &PathBuf) {
    let contents = format!(
        "sample\tsample_barcode\tguide\tenzyme\tpam\tcut\toff_target_file\tdonor\n\
         s1\t{S1_BARCODE}\t{GUIDE}\tCas9\t{PAM}\ttrue\t\td1\n\
         s2\t{S2_BARCODE}\t{GUIDE}\tCas9\t{PAM}\tfalse\t\td2\n"
    );
    std::fs::write(path, contents).unwrap();
}

pub fn read_gz_to_string(path: &PathBuf) -> String {
    let mut decoder = MultiGzDecoder::new(File::open(path).unwrap());
    let mut contents = String::new();
    decoder.read_to_string(&mut contents).unwrap();
    contents
}

/// Compare a written table against its full expected contents, with a
/// readable diff on failure.
pub fn check_against_expected_table(output_fp: &PathBuf, expected: &str) {
    let contents = std::fs::read_to_string(output_fp).unwrap();
    similar_asserts::assert_eq!(
        contents,
        expected,
        "{output_fp:?} does not match the expected table"
    );
}

pub fn check_against_expected_table_gz(output_fp: &PathBuf, expected: &str) {
    let contents = read_gz_to_string(output_fp);
    similar_asserts::assert_eq!(
        contents,
        expected,
        "{output_fp:?} does not match the expected table"
    );
}

/// Table contents with the rows sorted, for order-insensitive comparison.
pub fn sorted_rows(contents: &str) -> Vec<String> {
    let mut rows = contents
        .lines()
        .map(|l| l.to_string())
        .collect::<Vec<String>>();
    rows.sort();
    rows
}

/// Pull one named column out of a tab-delimited table.
pub fn column(contents: &str, name: &str) -> Vec<String> {
    let mut lines = contents.lines();
    let header = lines.next().expect("table should have a header");
    let idx = header
        .split('\t')
        .position(|h| h == name)
        .unwrap_or_else(|| panic!("no column named {name} in {header}"));
    lines
        .map(|l| {
            l.split('\t')
                .nth(idx)
                .unwrap_or_else(|| panic!("row is missing column {name}"))
                .to_string()
        })
        .collect()
}
