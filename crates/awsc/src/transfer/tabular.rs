//! 📊 Table — just enough of a dataframe to become a CSV.
//!
//! Columns have names, rows have cells, and that's the whole data model. Serialization
//! writes a header row, then one line per row, quoting fields that need it. Dates come
//! out as `YYYY-MM-DD` and timestamps as `YYYY-MM-DD-HH.MI.SS`, which is what the
//! COPY statement's DATEFORMAT / TIMEFORMAT expect on the other end.
//!
//! Along with the bytes, serialization reports where each row ends, so the chunker
//! can cut between rows even when a quoted field hides a newline inside.
//!
//! 🎬 *[a customer's address has a line break in it. the naive splitter cuts there.
//! part00004 now starts with "Apt 3B\",42,2024-01-01" and COPY has questions.]*
//!
//! Those row ends are why tables never go through the plain `Lines` boundary: a
//! newline inside quotes looks exactly like a row end to anything that isn't the
//! serializer itself.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};

use crate::error::ConfigError;

pub const CSV_DATE_FORMAT: &str = "%Y-%m-%d";
pub const CSV_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H.%M.%S";

/// 🔲 One value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Int(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Float(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Bool(value)
    }
}

impl From<NaiveDate> for Cell {
    fn from(value: NaiveDate) -> Self {
        Cell::Date(value)
    }
}

impl From<NaiveDateTime> for Cell {
    fn from(value: NaiveDateTime) -> Self {
        Cell::Timestamp(value)
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(value: Option<T>) -> Self {
        value.map_or(Cell::Null, Into::into)
    }
}

impl Cell {
    fn render(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Bool(value) => value.to_string(),
            Cell::Int(value) => value.to_string(),
            Cell::Float(value) if value.is_finite() => value.to_string(),
            Cell::Float(_) => String::new(),
            Cell::Text(value) => value.clone(),
            Cell::Date(value) => value.format(CSV_DATE_FORMAT).to_string(),
            Cell::Timestamp(value) => value.format(CSV_TIMESTAMP_FORMAT).to_string(),
        }
    }
}

/// 📊 Named columns, rows of cells. Every row has exactly one cell per column.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

/// 🧾 A serialized table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvPayload {
    pub bytes: Vec<u8>,
    /// Length of the header line, newline included.
    pub header_len: usize,
    /// Byte offsets where a row ends and another begins (header end and payload end excluded).
    pub row_cuts: Arc<[usize]>,
}

impl Table {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Result<Self, ConfigError> {
        let the_columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if the_columns.is_empty() {
            return Err(ConfigError::Empty { field: "table columns" });
        }
        if the_columns.iter().any(|name| name.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field: "table columns",
                reason: "column names cannot be blank".to_string(),
            });
        }
        Ok(Self {
            columns: the_columns,
            rows: Vec::new(),
        })
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), ConfigError> {
        if row.len() != self.columns.len() {
            return Err(ConfigError::Invalid {
                field: "table row",
                reason: format!("expected {} cells, got {}", self.columns.len(), row.len()),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn with_row(mut self, row: Vec<Cell>) -> Result<Self, ConfigError> {
        self.push_row(row)?;
        Ok(self)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 🧾 Header + rows as CSV, with the row cut points the chunker needs.
    pub fn to_csv(&self) -> CsvPayload {
        let mut the_bytes = Vec::new();
        write_line(&mut the_bytes, self.columns.iter().map(String::as_str));
        let the_header_len = the_bytes.len();

        let mut the_cuts = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            if the_bytes.len() > the_header_len {
                the_cuts.push(the_bytes.len());
            }
            let the_rendered: Vec<String> = row.iter().map(Cell::render).collect();
            write_line(&mut the_bytes, the_rendered.iter().map(String::as_str));
        }
        CsvPayload {
            bytes: the_bytes,
            header_len: the_header_len,
            row_cuts: Arc::from(the_cuts),
        }
    }
}

fn write_line<'a>(out: &mut Vec<u8>, fields: impl Iterator<Item = &'a str>) {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            out.push(b',');
        }
        write_field(out, field);
    }
    out.push(b'\n');
}

fn write_field(out: &mut Vec<u8>, field: &str) {
    let the_needs_quotes = field.bytes().any(|b| matches!(b, b',' | b'"' | b'\n' | b'\r'))
        || field.starts_with(' ')
        || field.ends_with(' ');
    if !the_needs_quotes {
        out.extend_from_slice(field.as_bytes());
        return;
    }
    out.push(b'"');
    for b in field.bytes() {
        if b == b'"' {
            out.push(b'"');
        }
        out.push(b);
    }
    out.push(b'"');
}
