use std::collections::BTreeMap;

use thiserror::Error;

/// One data row keyed by header name. Cells beyond a short row are absent.
pub type Record = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBatch {
    pub headers: Vec<String>,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CsvError {
    #[error("file is not valid UTF-8 (first invalid byte at offset {offset})")]
    NotUtf8 { offset: usize },
    #[error("unterminated quoted field starting on line {line}")]
    UnterminatedQuote { line: usize },
    #[error("row {row} has {found} fields but the header declares {expected}")]
    TooManyFields {
        row: usize,
        expected: usize,
        found: usize,
    },
}

impl CsvError {
    /// 1-based data row the defect belongs to, when it can be pinned to one.
    pub fn row(&self) -> Option<usize> {
        match self {
            Self::TooManyFields { row, .. } => Some(*row),
            Self::NotUtf8 { .. } | Self::UnterminatedQuote { .. } => None,
        }
    }
}

const UTF8_BOM: &str = "\u{feff}";

/// Parses a comma separated payload whose first non-blank line is the header.
///
/// Quoted fields may contain commas, line breaks and doubled quotes. Blank
/// lines are skipped. Header names and cell values are kept verbatim apart
/// from header trimming; blank checks belong to the validator.
pub fn parse_csv(bytes: &[u8]) -> Result<ParsedBatch, CsvError> {
    let text = std::str::from_utf8(bytes).map_err(|err| CsvError::NotUtf8 {
        offset: err.valid_up_to(),
    })?;
    let text = text.strip_prefix(UTF8_BOM).unwrap_or(text);

    let mut rows = split_rows(text)?.into_iter();
    let Some(header_row) = rows.next() else {
        return Ok(ParsedBatch {
            headers: Vec::new(),
            records: Vec::new(),
        });
    };
    let headers: Vec<String> = header_row
        .into_iter()
        .map(|name| name.trim().to_string())
        .collect();

    let mut records = Vec::new();
    for (index, cells) in rows.enumerate() {
        let row = index + 1;
        if cells.len() > headers.len() {
            return Err(CsvError::TooManyFields {
                row,
                expected: headers.len(),
                found: cells.len(),
            });
        }
        let mut record = Record::new();
        for (name, value) in headers.iter().zip(cells) {
            record.entry(name.clone()).or_insert(value);
        }
        records.push(record);
    }

    Ok(ParsedBatch { headers, records })
}

fn split_rows(text: &str) -> Result<Vec<Vec<String>>, CsvError> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1usize;
    let mut quote_started_on = 1usize;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(ch);
                }
                _ => field.push(ch),
            }
            continue;
        }
        match ch {
            '"' if field.is_empty() => {
                in_quotes = true;
                quote_started_on = line;
            }
            ',' => row.push(std::mem::take(&mut field)),
            '\r' | '\n' => {
                if ch == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                line += 1;
                row.push(std::mem::take(&mut field));
                push_row(&mut rows, std::mem::take(&mut row));
            }
            _ => field.push(ch),
        }
    }

    if in_quotes {
        return Err(CsvError::UnterminatedQuote {
            line: quote_started_on,
        });
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        push_row(&mut rows, row);
    }
    Ok(rows)
}

fn push_row(rows: &mut Vec<Vec<String>>, row: Vec<String>) {
    let blank = row.len() == 1 && row[0].trim().is_empty();
    if !blank {
        rows.push(row);
    }
}
