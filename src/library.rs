//! The reconciliation core: project both libraries into keyed tables,
//! compute overlap and differences, derive export projections and sync
//! change sets. Everything here is driven by the field mapping; no
//! per-field logic.

use std::fs;
use std::path::Path;

use unicode_casefold::UnicodeCaseFold;
use unicode_normalization::UnicodeNormalization;

use crate::catalog::Item;
use crate::error::SyncError;
use crate::mapping::FieldMap;
use crate::rekordbox::RekordboxXml;
use crate::table::{Table, Value};

/// Join key for a filesystem path: canonical decomposed form, case-folded.
/// The two libraries may store the same file under different normalization
/// forms or casing; after this they compare equal.
pub fn normalize_key(path: &str) -> String {
    let decomposed: String = path.nfd().collect();
    decomposed.case_fold_default().collect()
}

/// Project beets items into the uniform table, one column per declared
/// beets field, keyed by the normalized path. Duplicate keys keep the
/// first item (beets ids are ordered, so the oldest wins).
pub fn load_beets_table(items: &[Item], map: &FieldMap) -> Result<Table, SyncError> {
    let fields = map.beets_fields();
    if !fields.iter().any(|(name, _)| *name == "path") {
        return Err(SyncError::Config(
            "field mapping must declare the beets 'path' field".to_string(),
        ));
    }

    let mut columns = std::collections::BTreeMap::new();
    for (name, ty) in &fields {
        let values: Vec<Value> = items.iter().map(|item| item.get(name, *ty)).collect();
        columns.insert(name.to_string(), values);
    }

    let mut keys = Vec::with_capacity(items.len());
    for item in items {
        match item.get("path", crate::mapping::FieldType::Bytes) {
            Value::Text(path) if !path.is_empty() => keys.push(normalize_key(&path)),
            _ => {
                return Err(SyncError::Load(format!(
                    "beets item {} has no path",
                    item.id
                )));
            }
        }
    }

    let mut table = Table::new(keys, columns)?;
    table.dedup_keys();
    Ok(table)
}

/// Project Rekordbox XML tracks into the uniform table. Every declared
/// attribute must be present on every track; the leading path separator
/// stripped by the export format is restored on `Location` before the key
/// is built.
pub fn load_rekordbox_table(xml: &RekordboxXml, map: &FieldMap) -> Result<Table, SyncError> {
    let fields = map.rekordbox_fields();
    if !fields.iter().any(|(name, _)| *name == "Location") {
        return Err(SyncError::Config(
            "field mapping must declare the rekordbox 'Location' attribute".to_string(),
        ));
    }

    let mut columns: std::collections::BTreeMap<String, Vec<Value>> = fields
        .iter()
        .map(|(name, _)| (name.to_string(), Vec::with_capacity(xml.tracks.len())))
        .collect();
    let mut keys = Vec::with_capacity(xml.tracks.len());

    for (index, track) in xml.tracks.iter().enumerate() {
        for (name, ty) in &fields {
            let raw = track.get(name).ok_or_else(|| {
                let label = track
                    .get("Name")
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("#{}", index + 1));
                SyncError::Load(format!(
                    "rekordbox track {label} is missing attribute '{name}'"
                ))
            })?;
            let value = if *name == "Location" {
                let path = format!("/{raw}");
                keys.push(normalize_key(&path));
                Value::Text(path)
            } else {
                ty.coerce(&Value::Text(raw.to_string()))
            };
            columns.entry(name.to_string()).or_default().push(value);
        }
    }

    let mut table = Table::new(keys, columns)?;
    table.dedup_keys();
    Ok(table)
}

/// Result of reconciling the two libraries. `only_*` are full sub-tables
/// so callers can report original paths, not just keys.
pub struct Reconciled {
    /// Inner join: one row per shared key, all columns from both sides.
    pub common: Table,
    /// Beets rows whose key is absent from the (filtered) Rekordbox table.
    pub only_beets: Table,
    /// Filtered Rekordbox rows whose key is absent from the beets table.
    pub only_rekordbox: Table,
    /// Rekordbox row count after the music-directory filter.
    pub rekordbox_in_scope: usize,
}

/// Reconcile the two tables. `music_dir` restricts the Rekordbox side to
/// paths under that root before any set is computed: out-of-root tracks are
/// out of scope, never "missing from beets".
pub fn crop(
    beets: &Table,
    rekordbox: &Table,
    music_dir: Option<&str>,
) -> Result<Reconciled, SyncError> {
    let filtered = match music_dir {
        Some(root) => rekordbox.filter_key_prefix(&normalize_key(root)),
        None => rekordbox.clone(),
    };

    let only_rekordbox = filtered.select(&filtered.difference_keys(beets));
    let only_beets = beets.select(&beets.difference_keys(&filtered));
    let common = beets.join(&filtered)?;

    Ok(Reconciled {
        rekordbox_in_scope: filtered.len(),
        common,
        only_beets,
        only_rekordbox,
    })
}

/// Project beets rows into Rekordbox schema: restrict to `row_filter` if
/// given, drop non-exported fields, rename, fill nulls with the Rekordbox
/// type's zero value, apply declared transforms. The result keeps the
/// original join key and is ready for the XML writer.
pub fn export_table(
    beets: &Table,
    map: &FieldMap,
    row_filter: Option<&[String]>,
) -> Result<Table, SyncError> {
    let base = match row_filter {
        Some(keys) => beets.select(keys),
        None => beets.clone(),
    };
    let plan = map.export_mapping();

    let dropped = base.drop_columns(&plan.drop);
    let renames: std::collections::BTreeMap<String, String> = plan
        .renames
        .iter()
        .map(|(beets_name, rb_name, _, _)| (beets_name.clone(), rb_name.clone()))
        .collect();
    let mut projected = dropped.rename_columns(&renames)?;

    for (_, rb_name, rb_type, transform) in &plan.renames {
        projected.fill_nulls(rb_name, &rb_type.zero());
        if let Some(transform) = transform {
            projected.map_column(rb_name, |value| transform.apply(value));
        }
    }
    Ok(projected)
}

/// One synced field's state on a row: the current beets value and the
/// incoming Rekordbox value, both reshaped to the beets type and never null.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub current: Value,
    pub incoming: Value,
}

impl FieldChange {
    pub fn differs(&self) -> bool {
        self.current != self.incoming
    }
}

/// One record's pending updates, keyed by the beets id because that is how
/// updates are applied. Carries every sync pair's state so callers can show
/// what actually changed.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackUpdate {
    pub id: i64,
    pub path: String,
    pub fields: Vec<FieldChange>,
}

impl TrackUpdate {
    pub fn changed_fields(&self) -> impl Iterator<Item = &FieldChange> {
        self.fields.iter().filter(|change| change.differs())
    }

    /// (field, value) pairs in the shape the catalog persists.
    pub fn to_field_values(&self) -> Vec<(String, Value)> {
        self.fields
            .iter()
            .map(|change| (change.field.clone(), change.incoming.clone()))
            .collect()
    }
}

/// Compare every sync pair across the common table. A row enters the
/// change set when any pair differs; nulls on either side compare as the
/// beets type's zero value. Emitted values are the Rekordbox side's,
/// reshaped to the beets type and never null, so applying the change set
/// and re-running yields an empty set.
pub fn sync_changes(common: &Table, map: &FieldMap) -> Result<Vec<TrackUpdate>, SyncError> {
    let pairs = map.sync_pairs();
    let ids = common
        .column("id")
        .ok_or_else(|| SyncError::Load("common table has no 'id' column".to_string()))?;
    let paths = common
        .column("path")
        .ok_or_else(|| SyncError::Load("common table has no 'path' column".to_string()))?;

    let mut updates = Vec::new();
    for row in 0..common.len() {
        let mut fields = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            let beets_raw = common.value(row, &pair.beets).ok_or_else(|| {
                SyncError::Load(format!("common table has no '{}' column", pair.beets))
            })?;
            let rb_raw = common.value(row, &pair.rekordbox).ok_or_else(|| {
                SyncError::Load(format!("common table has no '{}' column", pair.rekordbox))
            })?;

            let zero = pair.beets_type.zero();
            fields.push(FieldChange {
                field: pair.beets.clone(),
                current: filled(pair.beets_type.coerce(beets_raw), &zero),
                incoming: filled(pair.beets_type.coerce(rb_raw), &zero),
            });
        }
        if fields.iter().any(FieldChange::differs) {
            let id = match ids[row] {
                Value::Int(id) => id,
                ref other => {
                    return Err(SyncError::Load(format!(
                        "non-integer beets id in common table: {other:?}"
                    )));
                }
            };
            updates.push(TrackUpdate {
                id,
                path: paths[row].render(),
                fields,
            });
        }
    }
    Ok(updates)
}

fn filled(value: Value, zero: &Value) -> Value {
    if value.is_null() { zero.clone() } else { value }
}

/// Apply a change set one record at a time. Each record's persistence is
/// an independent unit: with `abort_on_error` false (the default policy) a
/// failing record is collected and the batch continues; with it true the
/// first failure aborts the remaining updates.
pub fn apply_updates<F>(
    updates: &[TrackUpdate],
    abort_on_error: bool,
    mut apply: F,
) -> Result<(usize, Vec<SyncError>), SyncError>
where
    F: FnMut(&TrackUpdate) -> Result<(), SyncError>,
{
    let mut applied = 0;
    let mut failures = Vec::new();
    for update in updates {
        match apply(update) {
            Ok(()) => applied += 1,
            Err(err) if abort_on_error => return Err(err),
            Err(err) => failures.push(err),
        }
    }
    Ok((applied, failures))
}

/// Serialize computed tables to a directory for offline inspection. Each
/// table becomes `<name>.json` and loads back equal to what was computed.
pub fn dump_tables(dir: &Path, tables: &[(&str, &Table)]) -> Result<(), SyncError> {
    fs::create_dir_all(dir)
        .map_err(|err| SyncError::Load(format!("cannot create {}: {err}", dir.display())))?;
    for (name, table) in tables {
        let path = dir.join(format!("{name}.json"));
        let json = serde_json::to_vec_pretty(table)
            .map_err(|err| SyncError::Load(format!("cannot serialize {name}: {err}")))?;
        fs::write(&path, json)
            .map_err(|err| SyncError::Load(format!("cannot write {}: {err}", path.display())))?;
    }
    Ok(())
}

/// Load a dumped table back. Counterpart of [`dump_tables`], used for
/// offline inspection and the dump round-trip tests.
pub fn load_dumped_table(path: &Path) -> Result<Table, SyncError> {
    let bytes = fs::read(path)
        .map_err(|err| SyncError::Load(format!("cannot read {}: {err}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| SyncError::Load(format!("cannot parse {}: {err}", path.display())))
}
