//! CSV row reader.
//!
//! K_i: Column 0 is the phone, column 1 the pledge; there is no header.
//! B_i: File exists and decodes → Result
//! B_i: Each record is well formed → skipped with a warning otherwise

use crate::models::{PledgeError, Result, Row};
use crate::source::SourceEncoding;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A decoded CSV file ready to yield rows.
#[derive(Debug, Clone)]
pub struct RowSource {
    path: PathBuf,
    encoding: SourceEncoding,
    text: String,
}

impl RowSource {
    /// Read and decode a file.
    ///
    /// Fails with `SourceUnavailable` if the file cannot be read or no
    /// candidate decoder accepts its bytes.
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| PledgeError::source_unavailable(path, e.to_string()))?;
        let (encoding, text) = SourceEncoding::detect(&bytes).ok_or_else(|| {
            PledgeError::source_unavailable(path, "no candidate encoding could decode the file")
        })?;

        info!(path = %path.display(), encoding = %encoding, "Decoded row source");
        Ok(Self {
            path: path.to_path_buf(),
            encoding,
            text,
        })
    }

    /// Build a source from text already in memory.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            path: PathBuf::from("<memory>"),
            encoding: SourceEncoding::Utf8,
            text: text.into(),
        }
    }

    /// Encoding that decoded the file.
    pub fn encoding(&self) -> SourceEncoding {
        self.encoding
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lazily iterate rows, skipping blank and short records.
    pub fn rows(&self) -> Rows<'_> {
        let records = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(self.text.as_bytes())
            .into_records();
        Rows {
            records,
            next_index: 1,
        }
    }

    /// Collect every row.
    pub fn load(path: &Path) -> Result<Vec<Row>> {
        let source = Self::open(path)?;
        let rows: Vec<Row> = source.rows().collect();
        info!(count = rows.len(), "Loaded rows");
        Ok(rows)
    }
}

/// Iterator over the rows of a `RowSource`.
pub struct Rows<'a> {
    records: csv::StringRecordsIntoIter<&'a [u8]>,
    next_index: usize,
}

impl Iterator for Rows<'_> {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        loop {
            let record = match self.records.next()? {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed CSV record");
                    continue;
                }
            };

            if record.len() < 2 {
                continue;
            }

            let row = Row::new(self.next_index, record[0].trim(), record[1].trim());
            self.next_index += 1;
            return Some(row);
        }
    }
}
