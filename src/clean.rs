//! Normalization of raw CSV rows into typed, keyed records

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::ingest::RawRecord;
use crate::registry::{ColumnSpec, DatasetSpec, DedupPolicy, MissingPolicy, SemanticType};

/// Typed field value; `Null` is an explicit "no data", never a stand-in zero
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Null,
}

impl Value {
    /// Rendering of the value inside a natural key; `None` for nulls
    pub fn as_key_part(&self) -> Option<String> {
        match self {
            Value::Int(x) => Some(x.to_string()),
            Value::Float(x) => Some(x.to_string()),
            Value::Text(x) => Some(x.clone()),
            Value::Date(x) => Some(x.to_string()),
            Value::Null => None,
        }
    }
}

/// Record row - vector of columns, each column is a tuple of its name and value
pub type Row = Vec<(String, Value)>;

/// One cleaned row: the joined natural key plus typed fields in schema order
#[derive(Debug, Clone, PartialEq)]
pub struct CleanRecord {
    pub key: String,
    pub fields: Row,
}

impl CleanRecord {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(c, _)| c.as_str() == column)
            .map(|(_, v)| v)
    }
}

/// Per-dataset cleaning counters, carried on the refresh run
#[derive(Debug, Default, Clone, Serialize)]
pub struct CleaningReport {
    pub total: u64,
    pub kept: u64,
    /// rows dropped by coercion failure, missing-value policy or a null key
    pub rejected: u64,
    /// rows dropped by natural-key deduplication
    pub duplicates: u64,
}

/// Clean a fetched batch against its dataset schema.
///
/// Pure over the input: the same raw sequence always yields the same
/// records and report.
pub fn clean(spec: &DatasetSpec, raw: &[RawRecord]) -> Result<(Vec<CleanRecord>, CleaningReport)> {
    let mut report = CleaningReport {
        total: raw.len() as u64,
        ..CleaningReport::default()
    };
    if raw.is_empty() {
        return Ok((Vec::new(), report));
    }

    let mapping = resolve_columns(spec, &raw[0])?;

    let mut records = Vec::with_capacity(raw.len());
    'rows: for rec in raw {
        let mut fields: Row = Vec::with_capacity(spec.columns.len());
        for (col, source) in spec.columns.iter().zip(mapping.iter().copied()) {
            let raw_val = source
                .and_then(|idx| rec.fields.get(idx))
                .map(|(_, v)| v.trim())
                .unwrap_or("");
            let value = if raw_val.is_empty() {
                match col.missing {
                    MissingPolicy::Reject => {
                        report.rejected += 1;
                        continue 'rows;
                    }
                    MissingPolicy::Zero => typed_zero(col.semantic),
                    MissingPolicy::Null => Value::Null,
                }
            } else {
                match coerce(raw_val, col.semantic) {
                    Some(v) => v,
                    None if col.required => {
                        report.rejected += 1;
                        continue 'rows;
                    }
                    None => Value::Null,
                }
            };
            fields.push((col.name.to_string(), value));
        }

        let mut key_parts = Vec::with_capacity(spec.natural_key.len());
        for part in spec.natural_key {
            let rendered = fields
                .iter()
                .find(|(c, _)| c.as_str() == *part)
                .and_then(|(_, v)| v.as_key_part());
            match rendered {
                Some(p) if !p.is_empty() => key_parts.push(p),
                _ => {
                    report.rejected += 1;
                    continue 'rows;
                }
            }
        }

        records.push(CleanRecord {
            key: key_parts.join("|"),
            fields,
        });
    }

    let deduped = dedup(records, spec.dedup, &mut report);
    report.kept = deduped.len() as u64;
    Ok((deduped, report))
}

/// Map each declared column to a source field index, by normalized
/// header name or alias. Fails when a required column has no source.
fn resolve_columns(spec: &DatasetSpec, first: &RawRecord) -> Result<Vec<Option<usize>>> {
    let normalized: Vec<String> = first
        .fields
        .iter()
        .map(|(h, _)| normalize_header(h))
        .collect();
    let mut mapping = Vec::with_capacity(spec.columns.len());
    for col in &spec.columns {
        let idx = normalized.iter().position(|h| matches_column(h, col));
        if idx.is_none() && col.required {
            return Err(Error::SchemaMismatch(format!(
                "{}: required column '{}' not found in source headers",
                spec.id, col.name
            )));
        }
        mapping.push(idx);
    }
    Ok(mapping)
}

fn matches_column(header: &str, col: &ColumnSpec) -> bool {
    header == col.name || col.aliases.iter().any(|a| *a == header)
}

/// Lowercase, fold diacritics and collapse non-alphanumerics to `_`
pub fn normalize_header(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    let mut last_underscore = true;
    for ch in header.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_underscore = false;
        } else if let Some(folded) = fold_diacritic(ch) {
            out.push_str(folded);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

fn fold_diacritic(ch: char) -> Option<&'static str> {
    match ch {
        'à' | 'â' | 'ä' => Some("a"),
        'ç' => Some("c"),
        'é' | 'è' | 'ê' | 'ë' => Some("e"),
        'î' | 'ï' => Some("i"),
        'ô' | 'ö' => Some("o"),
        'ù' | 'û' | 'ü' => Some("u"),
        'ÿ' => Some("y"),
        'œ' => Some("oe"),
        'æ' => Some("ae"),
        _ => None,
    }
}

fn typed_zero(semantic: SemanticType) -> Value {
    match semantic {
        SemanticType::Integer => Value::Int(0),
        SemanticType::Decimal => Value::Float(0.0),
        SemanticType::Text | SemanticType::Date => Value::Null,
    }
}

fn coerce(text: &str, semantic: SemanticType) -> Option<Value> {
    match semantic {
        SemanticType::Text => Some(Value::Text(text.to_string())),
        SemanticType::Integer => parse_integer(text).map(Value::Int),
        SemanticType::Decimal => parse_decimal(text).map(Value::Float),
        SemanticType::Date => parse_date(text).map(Value::Date),
    }
}

/// French extracts embed NBSP/space thousands separators
fn compact_number(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn parse_integer(s: &str) -> Option<i64> {
    compact_number(s).parse().ok()
}

fn parse_decimal(s: &str) -> Option<f64> {
    compact_number(s).replace(',', ".").parse().ok()
}

/// Accepts `YYYY-MM-DD`, `DD/MM/YYYY` and month-precision `YYYY-MM`
fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%d/%m/%Y"))
        .or_else(|_| NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d"))
        .ok()
}

fn dedup(
    records: Vec<CleanRecord>,
    policy: DedupPolicy,
    report: &mut CleaningReport,
) -> Vec<CleanRecord> {
    match policy {
        DedupPolicy::KeepLast => {
            let mut slot: HashMap<String, usize> = HashMap::new();
            let mut kept: Vec<Option<CleanRecord>> = Vec::with_capacity(records.len());
            for rec in records {
                if let Some(&i) = slot.get(&rec.key) {
                    kept[i] = None;
                    report.duplicates += 1;
                }
                slot.insert(rec.key.clone(), kept.len());
                kept.push(Some(rec));
            }
            kept.into_iter().flatten().collect()
        }
        DedupPolicy::RejectDuplicates => {
            let mut counts: HashMap<String, u64> = HashMap::new();
            for rec in &records {
                *counts.entry(rec.key.clone()).or_insert(0) += 1;
            }
            let mut kept = Vec::with_capacity(records.len());
            for rec in records {
                if counts[&rec.key] == 1 {
                    kept.push(rec);
                } else {
                    report.duplicates += 1;
                }
            }
            kept
        }
    }
}
