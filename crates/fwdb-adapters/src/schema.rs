//! Header normalization, row extraction and batch assembly.

use std::collections::HashMap;

use fwdb_core::{canonicalize_identity_text, Column, ContactRecord, EmailKey};
use serde::Serialize;
use strsim::jaro_winkler;
use thiserror::Error;

use crate::{CellValue, RawTable};

const SUGGESTION_THRESHOLD: f64 = 0.80;

/// Header form used for tolerant matching: trimmed, lower-cased, with spaces,
/// underscores and hyphens removed.
pub fn normalize_header(header: &str) -> String {
    header
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappedColumn {
    pub column: Column,
    pub index: usize,
    pub header: String,
}

/// Required column → raw header assignment for one sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnMapping {
    columns: Vec<MappedColumn>,
}

impl ColumnMapping {
    pub fn index_of(&self, column: Column) -> Option<usize> {
        self.columns
            .iter()
            .find(|m| m.column == column)
            .map(|m| m.index)
    }

    pub fn columns(&self) -> &[MappedColumn] {
        &self.columns
    }

    /// Required columns that were satisfied by a differently spelled header.
    pub fn renamed(&self) -> Vec<(String, String)> {
        self.columns
            .iter()
            .filter(|m| m.header.trim() != m.column.as_str())
            .map(|m| (m.column.as_str().to_string(), m.header.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sheet '{sheet}' is missing required columns: {}", column_list(.missing))]
pub struct SchemaError {
    pub sheet: String,
    pub missing: Vec<Column>,
    /// Closest raw header for a missing column, when one is similar enough.
    pub suggestions: Vec<(Column, String)>,
}

impl SchemaError {
    pub fn hints(&self) -> Vec<String> {
        self.suggestions
            .iter()
            .map(|(column, header)| format!("'{header}' looks like '{column}'"))
            .collect()
    }
}

fn column_list(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Map every required column onto a raw header; any gap rejects the sheet.
pub fn map_columns(sheet: &str, headers: &[String]) -> Result<ColumnMapping, SchemaError> {
    let mut normalized: HashMap<String, usize> = HashMap::new();
    for (idx, header) in headers.iter().enumerate() {
        normalized.entry(normalize_header(header)).or_insert(idx);
    }

    let mut columns = Vec::with_capacity(Column::ALL.len());
    let mut missing = Vec::new();
    for column in Column::ALL {
        let wanted = column.as_str();
        let found = normalized.get(&normalize_header(wanted)).copied().or_else(|| {
            headers
                .iter()
                .position(|h| h.trim().to_lowercase() == wanted.to_lowercase())
        });
        match found {
            Some(index) => columns.push(MappedColumn {
                column,
                index,
                header: headers[index].clone(),
            }),
            None => missing.push(column),
        }
    }

    if missing.is_empty() {
        return Ok(ColumnMapping { columns });
    }

    let taken = columns.iter().map(|m| m.index).collect::<Vec<_>>();
    let suggestions = missing
        .iter()
        .filter_map(|column| {
            let wanted = normalize_header(column.as_str());
            headers
                .iter()
                .enumerate()
                .filter(|(idx, h)| !taken.contains(idx) && !h.trim().is_empty())
                .map(|(_, h)| (h, jaro_winkler(&normalize_header(h), &wanted)))
                .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(h, _)| (*column, h.clone()))
        })
        .collect();

    Err(SchemaError {
        sheet: sheet.to_string(),
        missing,
        suggestions,
    })
}

/// Coerce a raw cell to canonical text. Blank, error and `nan` cells become "".
pub fn cell_text(cell: Option<&CellValue>) -> String {
    match cell {
        None | Some(CellValue::Empty) => String::new(),
        Some(CellValue::Text(s)) if s == "nan" => String::new(),
        Some(CellValue::Text(s)) => s.clone(),
        Some(CellValue::Int(i)) => i.to_string(),
        Some(CellValue::Float(f)) if f.is_nan() => String::new(),
        Some(CellValue::Float(f)) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Some(CellValue::Float(f)) => f.to_string(),
        Some(CellValue::Bool(b)) => String::from(if *b { "TRUE" } else { "FALSE" }),
    }
}

/// Project a raw table onto the required columns, in required order.
pub fn extract_rows(table: &RawTable, mapping: &ColumnMapping) -> Vec<ContactRecord> {
    table
        .rows
        .iter()
        .map(|row| {
            let mut record = ContactRecord::from_values(Column::ALL.map(|column| {
                cell_text(mapping.index_of(column).and_then(|idx| row.get(idx)))
                    .trim()
                    .to_string()
            }));
            record.email = canonicalize_identity_text(&record.email).trim().to_string();
            record
        })
        .filter(|record| !record.is_blank())
        .collect()
}

/// Canonical rows of one upload, unique by email key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Batch {
    records: Vec<ContactRecord>,
    pub collapsed_duplicates: usize,
    pub skipped_blank_email: usize,
}

impl Batch {
    pub fn records(&self) -> &[ContactRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = EmailKey> + '_ {
        self.records.iter().map(ContactRecord::key)
    }
}

/// De-duplicate by email key, last occurrence wins. Survivors keep the
/// position of their last occurrence; rows without an email are dropped.
pub fn assemble_batch(records: Vec<ContactRecord>) -> Batch {
    let mut last_seen: HashMap<EmailKey, usize> = HashMap::new();
    let mut skipped_blank_email = 0;
    for (idx, record) in records.iter().enumerate() {
        let key = record.key();
        if key.is_empty() {
            skipped_blank_email += 1;
            continue;
        }
        last_seen.insert(key, idx);
    }

    let total_with_key = records.len() - skipped_blank_email;
    let kept = records
        .into_iter()
        .enumerate()
        .filter(|(idx, record)| last_seen.get(&record.key()) == Some(idx))
        .map(|(_, record)| record)
        .collect::<Vec<_>>();

    Batch {
        collapsed_duplicates: total_with_key - kept.len(),
        skipped_blank_email,
        records: kept,
    }
}
