use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;

use super::{CSV_HEADER, OptionContractRow};

/// Appends expiration batches to a chain CSV.
///
/// Every batch is encoded in memory first and then written with a single
/// `write_all` followed by a flush and `sync_data`, so a process killed
/// between batches never leaves a half-written expiration behind.
pub struct ChainWriter {
    file: File,
    path: PathBuf,
    rows_written: usize,
}

impl ChainWriter {
    /// Create a new chain file and write the header. Fails if the file exists.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("creating CSV file {}", path.display()))?;
        let mut writer = ChainWriter {
            file,
            path: path.to_path_buf(),
            rows_written: 0,
        };
        writer.write_header()?;
        Ok(writer)
    }

    /// Open an existing chain file for appending. The header is written only
    /// when the file is empty.
    pub fn append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("opening CSV file {} for append", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("reading metadata of {}", path.display()))?
            .len();
        let mut writer = ChainWriter {
            file,
            path: path.to_path_buf(),
            rows_written: 0,
        };
        if len == 0 {
            writer.write_header()?;
        }
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written through this handle (header excluded).
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Write one expiration's rows and flush them to disk.
    pub fn write_batch(&mut self, rows: &[OptionContractRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        for row in rows {
            wtr.serialize(row)?;
        }
        let buf = wtr.into_inner().context("encoding CSV batch")?;
        self.commit(&buf)?;
        self.rows_written += rows.len();
        Ok(rows.len())
    }

    fn write_header(&mut self) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record(CSV_HEADER)?;
        let buf = wtr.into_inner().context("encoding CSV header")?;
        self.commit(&buf)
    }

    fn commit(&mut self, buf: &[u8]) -> Result<()> {
        self.file
            .write_all(buf)
            .with_context(|| format!("writing {}", self.path.display()))?;
        self.file.flush()?;
        self.file
            .sync_data()
            .with_context(|| format!("syncing {}", self.path.display()))?;
        Ok(())
    }
}

/// Expiration dates already present in a chain CSV.
///
/// Batches are written whole, so any date found here was fully downloaded.
/// Records shorter than the header (a torn trailing line) are skipped.
pub fn completed_expirations(path: &Path) -> Result<BTreeSet<NaiveDate>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening CSV file {}", path.display()))?;

    let headers = rdr
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .clone();
    let Some(idx) = headers.iter().position(|h| h == "expiration_date") else {
        bail!(
            "{} has no expiration_date column; not a chain file?",
            path.display()
        );
    };

    let mut dates = BTreeSet::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("reading {}", path.display()))?;
        if record.len() < headers.len() {
            tracing::warn!(
                line = line + 2,
                fields = record.len(),
                "skipping short record in {}",
                path.display()
            );
            continue;
        }
        let raw = &record[idx];
        let date: NaiveDate = raw
            .parse()
            .with_context(|| format!("bad expiration_date '{raw}' in {}", path.display()))?;
        dates.insert(date);
    }
    Ok(dates)
}

/// Cut off an expiration whose batch write was interrupted.
///
/// A chain file that does not end in a newline was torn mid-batch. The torn
/// line goes, and so do the complete rows before it that share its
/// expiration, so that date is fetched again in full on resume. When the
/// torn line clearly starts a new expiration, the batch before it is kept.
/// Returns the expiration that was dropped, if any.
pub fn repair_torn_tail(path: &Path) -> Result<Option<NaiveDate>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        return Ok(None);
    }
    let cut = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let (kept, fragment) = bytes.split_at(cut);

    let mut truncate_at = cut as u64;
    let mut dropped = None;
    if cut > 0 {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(kept);
        let headers = rdr
            .headers()
            .with_context(|| format!("reading header of {}", path.display()))?
            .clone();
        let Some(idx) = headers.iter().position(|h| h == "expiration_date") else {
            bail!(
                "{} has no expiration_date column; not a chain file?",
                path.display()
            );
        };

        // Trailing run of rows sharing one expiration, and where it starts.
        let mut last: Option<(NaiveDate, u64)> = None;
        let mut record = csv::StringRecord::new();
        while rdr
            .read_record(&mut record)
            .with_context(|| format!("reading {}", path.display()))?
        {
            let start = record.position().map_or(0, |p| p.byte());
            match record.get(idx).and_then(|s| s.parse::<NaiveDate>().ok()) {
                Some(date) if last.is_some_and(|(d, _)| d == date) => {}
                Some(date) => last = Some((date, start)),
                None => last = None,
            }
        }

        // Only trust the fragment's date once the field after it has begun.
        let fragment_date = std::str::from_utf8(fragment).ok().and_then(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            (fields.len() > idx + 1)
                .then(|| fields[idx].parse::<NaiveDate>().ok())
                .flatten()
        });

        if let Some((date, start)) = last {
            if fragment_date.is_none_or(|d| d == date) {
                truncate_at = start;
                dropped = Some(date);
            }
        }
    }

    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("opening {} for repair", path.display()))?;
    file.set_len(truncate_at)
        .with_context(|| format!("truncating {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("syncing {}", path.display()))?;

    tracing::warn!(
        removed_bytes = bytes.len() as u64 - truncate_at,
        dropped = ?dropped,
        "repaired torn tail of {}",
        path.display()
    );
    Ok(dropped)
}
