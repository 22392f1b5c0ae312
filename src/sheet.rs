//! Spreadsheet surface the jobs write to.
//!
//! Jobs only ever read a single cell or overwrite a rectangular range, so
//! [SheetClient] exposes exactly that. Ranges use A1 notation relative to the
//! worksheet passed alongside them.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Int(i64),
    Number(f64),
}

impl CellValue {
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Empty => Value::String(String::new()),
            CellValue::Text(text) => Value::String(text.clone()),
            CellValue::Int(value) => Value::from(*value),
            CellValue::Number(value) => serde_json::Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(String::new())),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_owned())
    }
}
impl From<Option<f64>> for CellValue {
    fn from(value: Option<f64>) -> Self {
        match value {
            Some(v) if v.is_finite() => CellValue::Number(v),
            _ => CellValue::Empty,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SheetError {
    /// Running the command that prints an access token failed
    #[error("Failed to obtain access token: {0}")]
    Token(String),
    #[error("Request to the sheets API failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The API answered with a non-success status code
    #[error("Sheets API returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Unexpected response from the sheets API: {0}")]
    Malformed(String),
}

impl SheetError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SheetError::Status { status: 429, .. })
    }
}

/// Converts a zero based column index to its letter(s): 0 → `A`, 26 → `AA`.
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// A1 reference for a zero based column and a one based row.
pub fn cell(col: usize, row: usize) -> String {
    format!("{}{row}", column_letter(col))
}

pub fn column_range(col: usize, from_row: usize, to_row: usize) -> String {
    format!("{}:{}", cell(col, from_row), cell(col, to_row))
}

/// Prefixes a range with its worksheet title: `'IUGU Subcontas'!A1:B2`.
pub fn qualified(sheet: &str, range: &str) -> String {
    format!("'{}'!{range}", sheet.replace('\'', "''"))
}

pub trait SheetClient {
    /// Reads the formatted value of one cell. Empty cells read as `""`.
    fn get_value(&self, sheet: &str, cell: &str) -> Result<String, SheetError>;

    /// Overwrites `range` with `rows`, row major.
    fn update_values(
        &self,
        sheet: &str,
        range: &str,
        rows: Vec<Vec<CellValue>>,
    ) -> Result<(), SheetError>;

    fn update_value(&self, sheet: &str, cell: &str, value: CellValue) -> Result<(), SheetError> {
        self.update_values(sheet, &format!("{cell}:{cell}"), vec![vec![value]])
    }

    /// Writes `values` downwards starting at `first_row` of column `col`.
    fn write_column(
        &self,
        sheet: &str,
        col: usize,
        first_row: usize,
        values: Vec<CellValue>,
    ) -> Result<(), SheetError> {
        if values.is_empty() {
            return Ok(());
        }
        let range = column_range(col, first_row, first_row + values.len() - 1);
        log::debug!("Writing {} values to {sheet}!{range}", values.len());
        self.update_values(sheet, &range, values.into_iter().map(|v| vec![v]).collect())
    }

    /// Blanks the first `rows` cells of column `col`.
    fn clear_column(&self, sheet: &str, col: usize, rows: usize) -> Result<(), SheetError> {
        self.clear_block(sheet, 1, col, 1, rows)
    }

    /// Blanks `width` x `height` cells whose top left corner is (`row`, `col`).
    fn clear_block(
        &self,
        sheet: &str,
        row: usize,
        col: usize,
        width: usize,
        height: usize,
    ) -> Result<(), SheetError> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let range = format!(
            "{}:{}",
            cell(col, row),
            cell(col + width - 1, row + height - 1)
        );
        log::debug!("Clearing {sheet}!{range}");
        self.update_values(sheet, &range, vec![vec![CellValue::Empty; width]; height])
    }

    /// Writes `header` at (`row`, `col`) and `rows` directly below it.
    /// Short rows are padded with empty cells.
    fn write_table(
        &self,
        sheet: &str,
        row: usize,
        col: usize,
        header: &[&str],
        rows: Vec<Vec<CellValue>>,
    ) -> Result<(), SheetError> {
        let width = rows
            .iter()
            .map(Vec::len)
            .chain(std::iter::once(header.len()))
            .max()
            .unwrap_or(0);
        if width == 0 {
            return Ok(());
        }
        let mut values = Vec::with_capacity(rows.len() + 1);
        values.push(header.iter().map(|h| CellValue::from(*h)).collect::<Vec<_>>());
        values.extend(rows);
        for line in &mut values {
            line.resize(width, CellValue::Empty);
        }
        let range = format!(
            "{}:{}",
            cell(col, row),
            cell(col + width - 1, row + values.len() - 1)
        );
        log::debug!("Writing table of {} rows to {sheet}!{range}", values.len() - 1);
        self.update_values(sheet, &range, values)
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use std::{cell::RefCell, collections::BTreeMap};

    use super::*;

    /// Splits an A1 cell reference into zero based column and one based row.
    pub fn parse_cell(reference: &str) -> Option<(usize, usize)> {
        let split = reference.find(|c: char| c.is_ascii_digit())?;
        let (letters, digits) = reference.split_at(split);
        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_uppercase()) {
            return None;
        }
        let col = letters
            .bytes()
            .fold(0usize, |acc, b| acc * 26 + (b - b'A' + 1) as usize)
            - 1;
        let row: usize = digits.parse().ok()?;
        (row > 0).then_some((col, row))
    }

    /// Records cells written per worksheet. Writes to `failing_sheet` fail with a 500.
    #[derive(Default)]
    pub struct MemorySheets {
        pub cells: RefCell<BTreeMap<(String, usize, usize), CellValue>>,
        pub writes: RefCell<Vec<(String, String)>>,
        pub failing_sheet: Option<String>,
    }

    impl MemorySheets {
        pub fn get(&self, sheet: &str, reference: &str) -> CellValue {
            let (col, row) = parse_cell(reference).expect("valid cell");
            self.cells
                .borrow()
                .get(&(sheet.to_owned(), row, col))
                .cloned()
                .unwrap_or(CellValue::Empty)
        }

        pub fn set(&self, sheet: &str, reference: &str, value: CellValue) {
            let (col, row) = parse_cell(reference).expect("valid cell");
            self.cells.borrow_mut().insert((sheet.to_owned(), row, col), value);
        }
    }

    impl SheetClient for MemorySheets {
        fn get_value(&self, sheet: &str, cell: &str) -> Result<String, SheetError> {
            Ok(match self.get(sheet, cell) {
                CellValue::Empty => String::new(),
                CellValue::Text(t) => t,
                CellValue::Int(i) => i.to_string(),
                CellValue::Number(n) => n.to_string(),
            })
        }

        fn update_values(
            &self,
            sheet: &str,
            range: &str,
            rows: Vec<Vec<CellValue>>,
        ) -> Result<(), SheetError> {
            if self.failing_sheet.as_deref() == Some(sheet) {
                return Err(SheetError::Status { status: 500, body: "boom".into() });
            }
            let start = range.split(':').next().unwrap_or(range);
            let (col, row) =
                parse_cell(start).ok_or_else(|| SheetError::Malformed(range.to_owned()))?;
            self.writes.borrow_mut().push((sheet.to_owned(), range.to_owned()));
            let mut cells = self.cells.borrow_mut();
            for (r, line) in rows.into_iter().enumerate() {
                for (c, value) in line.into_iter().enumerate() {
                    cells.insert((sheet.to_owned(), row + r, col + c), value);
                }
            }
            Ok(())
        }
    }
}
