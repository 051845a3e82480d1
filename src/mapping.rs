//! Field mapping table: the declarative registry of every field pair the
//! reconciler knows about. Loaded once per invocation from a YAML document
//! (packaged default, or an override path) and consulted generically by the
//! loaders, the export projector, and the sync differ.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::SyncError;
use crate::table::Value;

const DEFAULT_FIELDS_YAML: &str = include_str!("default_fields.yaml");

/// Semantic type tag for a field in either schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Int,
    /// Integer that may legitimately be absent (beets flexible attributes).
    OptInt,
    /// 64-bit integer (file sizes).
    Long,
    Float,
    /// Raw byte path; decoded to text on load.
    Bytes,
}

impl FieldType {
    /// Default used when a source record lacks the field entirely.
    pub fn load_default(&self) -> Value {
        match self {
            FieldType::Text => Value::Text(String::new()),
            FieldType::Int | FieldType::Long => Value::Int(0),
            FieldType::OptInt | FieldType::Bytes => Value::Null,
            FieldType::Float => Value::Float(0.0),
        }
    }

    /// Canonical zero value: what "missing" collapses to when a consumer
    /// cannot represent null (export fill, sync comparison).
    pub fn zero(&self) -> Value {
        match self {
            FieldType::Text | FieldType::Bytes => Value::Text(String::new()),
            FieldType::Int | FieldType::Long | FieldType::OptInt => Value::Int(0),
            FieldType::Float => Value::Float(0.0),
        }
    }

    /// Reshape a raw value into this type. Unparseable values become null;
    /// presence is the loader's concern, shape is ours.
    pub fn coerce(&self, value: &Value) -> Value {
        match self {
            FieldType::Text | FieldType::Bytes => match value {
                Value::Null => Value::Null,
                other => Value::Text(other.render()),
            },
            FieldType::Int | FieldType::Long | FieldType::OptInt => match value {
                Value::Int(n) => Value::Int(*n),
                Value::Float(f) => Value::Int(*f as i64),
                Value::Text(s) => match s.trim() {
                    "" => Value::Null,
                    t => t
                        .parse::<i64>()
                        .map(Value::Int)
                        .or_else(|_| t.parse::<f64>().map(|f| Value::Int(f as i64)))
                        .unwrap_or(Value::Null),
                },
                Value::Null => Value::Null,
            },
            FieldType::Float => match value {
                Value::Float(f) => Value::Float(*f),
                Value::Int(n) => Value::Float(*n as f64),
                Value::Text(s) => match s.trim() {
                    "" => Value::Null,
                    t => t.parse::<f64>().map(Value::Float).unwrap_or(Value::Null),
                },
                Value::Null => Value::Null,
            },
        }
    }
}

/// Pure value transform applied when projecting beets -> Rekordbox.
/// A closed set, resolved at load time so a typo fails fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Beets format code to the Rekordbox `Kind` string.
    FormatToKind,
    /// Beets stores sample rate in kHz, Rekordbox in Hz.
    KhzToHz,
}

impl Transform {
    fn parse(name: &str) -> Result<Self, SyncError> {
        match name {
            "format_to_kind" => Ok(Transform::FormatToKind),
            "khz_to_hz" => Ok(Transform::KhzToHz),
            other => Err(SyncError::Mapping(format!(
                "unknown transform function '{other}'"
            ))),
        }
    }

    pub fn apply(&self, value: &Value) -> Value {
        match self {
            Transform::FormatToKind => match value {
                Value::Text(s) => Value::Text(format_to_kind(s).to_string()),
                other => other.clone(),
            },
            Transform::KhzToHz => match value {
                Value::Int(n) => Value::Int(n * 1000),
                Value::Float(f) => Value::Float(f * 1000.0),
                other => other.clone(),
            },
        }
    }
}

fn format_to_kind(format: &str) -> &str {
    match format {
        "AAC" => "M4A File",
        "MP3" => "MP3 File",
        "WAV" => "WAV File",
        other => other,
    }
}

#[derive(Debug, Deserialize)]
struct MappingDocument {
    #[allow(dead_code)]
    schema_version: u32,
    fields: Vec<RawRow>,
}

#[derive(Debug, Deserialize)]
struct RawRow {
    beets: Option<String>,
    beets_type: Option<FieldType>,
    rekordbox: Option<String>,
    rekordbox_type: Option<FieldType>,
    #[serde(default)]
    no_export: bool,
    #[serde(default)]
    sync: bool,
    convert: Option<String>,
}

/// One validated field correspondence.
#[derive(Debug, Clone)]
pub struct FieldRow {
    pub beets: Option<(String, FieldType)>,
    pub rekordbox: Option<(String, FieldType)>,
    pub no_export: bool,
    pub sync: bool,
    pub convert: Option<Transform>,
}

/// Export projection plan derived from the mapping.
#[derive(Debug, Clone)]
pub struct ExportMapping {
    /// Beets columns dropped from the projection (`no_export` or unmapped).
    pub drop: Vec<String>,
    /// (beets name, rekordbox name, rekordbox type, transform) for every
    /// exported field.
    pub renames: Vec<(String, String, FieldType, Option<Transform>)>,
}

/// A field pair eligible for two-way comparison. Sync eligibility is the
/// explicit `sync` column in the mapping table; there is no naming
/// convention fallback.
#[derive(Debug, Clone)]
pub struct SyncPair {
    pub beets: String,
    pub beets_type: FieldType,
    pub rekordbox: String,
}

#[derive(Debug, Clone)]
pub struct FieldMap {
    rows: Vec<FieldRow>,
}

impl FieldMap {
    /// Load from an override path, or the packaged default table.
    pub fn load(path: Option<&Path>) -> Result<Self, SyncError> {
        Self::from_yaml(&source_text(path)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self, SyncError> {
        let doc: MappingDocument = serde_yaml::from_str(text)?;

        // A beets field may appear on one row only: a second row would make
        // the export rename ambiguous. Rekordbox names may repeat (the
        // mirror rows share their attribute with the plain field), but a
        // rekordbox-only attribute is its row's identity.
        let mut seen_beets = HashSet::new();
        let mut seen_rekordbox_only = HashSet::new();
        let mut rows = Vec::with_capacity(doc.fields.len());
        for raw in doc.fields {
            let row = validate_row(raw)?;
            if let Some((beets_name, _)) = &row.beets {
                if !seen_beets.insert(beets_name.clone()) {
                    return Err(SyncError::Config(format!(
                        "duplicate mapping for beets field '{beets_name}'"
                    )));
                }
            } else if let Some((rb_name, _)) = &row.rekordbox {
                if !seen_rekordbox_only.insert(rb_name.clone()) {
                    return Err(SyncError::Config(format!(
                        "duplicate mapping for rekordbox attribute '{rb_name}'"
                    )));
                }
            }
            rows.push(row);
        }
        Ok(Self { rows })
    }

    /// Every (name, type) with a beets-side field, in table order.
    pub fn beets_fields(&self) -> Vec<(&str, FieldType)> {
        self.rows
            .iter()
            .filter_map(|r| r.beets.as_ref().map(|(n, t)| (n.as_str(), *t)))
            .collect()
    }

    /// Every (name, type) with a Rekordbox-side field, deduplicated by
    /// attribute name (mirror rows share their Rekordbox column; the first
    /// row wins).
    pub fn rekordbox_fields(&self) -> Vec<(&str, FieldType)> {
        let mut seen = HashSet::new();
        self.rows
            .iter()
            .filter_map(|r| r.rekordbox.as_ref().map(|(n, t)| (n.as_str(), *t)))
            .filter(|(n, _)| seen.insert(*n))
            .collect()
    }

    pub fn export_mapping(&self) -> ExportMapping {
        let mut drop = Vec::new();
        let mut renames = Vec::new();
        for row in &self.rows {
            let Some((beets_name, _)) = &row.beets else {
                continue;
            };
            match (&row.rekordbox, row.no_export) {
                (Some((rb_name, rb_type)), false) => renames.push((
                    beets_name.clone(),
                    rb_name.clone(),
                    *rb_type,
                    row.convert,
                )),
                _ => drop.push(beets_name.clone()),
            }
        }
        ExportMapping { drop, renames }
    }

    pub fn sync_pairs(&self) -> Vec<SyncPair> {
        self.rows
            .iter()
            .filter(|r| r.sync)
            .filter_map(|r| match (&r.beets, &r.rekordbox) {
                (Some((bn, bt)), Some((rn, _))) => Some(SyncPair {
                    beets: bn.clone(),
                    beets_type: *bt,
                    rekordbox: rn.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Raw YAML text of the mapping [`FieldMap::load`] parses for this path.
/// Also what the debug dump writes, so a dump is self-describing.
pub fn source_text(path: Option<&Path>) -> Result<String, SyncError> {
    match path {
        Some(path) => fs::read_to_string(path).map_err(|err| {
            SyncError::Config(format!(
                "cannot read field mapping {}: {err}",
                path.display()
            ))
        }),
        None => Ok(DEFAULT_FIELDS_YAML.to_string()),
    }
}

fn validate_row(raw: RawRow) -> Result<FieldRow, SyncError> {
    let beets = match (raw.beets, raw.beets_type) {
        (Some(name), Some(ty)) => Some((name, ty)),
        (None, None) => None,
        (Some(name), None) => {
            return Err(SyncError::Config(format!(
                "field '{name}' is missing beets_type"
            )));
        }
        (None, Some(_)) => {
            return Err(SyncError::Config(
                "beets_type given without a beets field name".to_string(),
            ));
        }
    };
    let rekordbox = match (raw.rekordbox, raw.rekordbox_type) {
        (Some(name), Some(ty)) => Some((name, ty)),
        (None, None) => None,
        (Some(name), None) => {
            return Err(SyncError::Config(format!(
                "field '{name}' is missing rekordbox_type"
            )));
        }
        (None, Some(_)) => {
            return Err(SyncError::Config(
                "rekordbox_type given without a rekordbox field name".to_string(),
            ));
        }
    };
    if beets.is_none() && rekordbox.is_none() {
        return Err(SyncError::Config(
            "mapping row names a field on neither side".to_string(),
        ));
    }
    if raw.sync && (beets.is_none() || rekordbox.is_none()) {
        return Err(SyncError::Config(format!(
            "sync requires both sides of the pair ({} -> {})",
            beets.as_ref().map(|(n, _)| n.as_str()).unwrap_or("-"),
            rekordbox.as_ref().map(|(n, _)| n.as_str()).unwrap_or("-"),
        )));
    }
    if raw.convert.is_some() && rekordbox.is_none() {
        return Err(SyncError::Config(
            "convert requires a rekordbox-side field".to_string(),
        ));
    }
    let convert = raw.convert.as_deref().map(Transform::parse).transpose()?;
    Ok(FieldRow {
        beets,
        rekordbox,
        no_export: raw.no_export,
        sync: raw.sync,
        convert,
    })
}
