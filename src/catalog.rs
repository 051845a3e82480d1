//! Beets library access. The beets database keeps fixed track metadata as
//! columns on the `items` table and everything else (ratings, Rekordbox
//! mirrors) as text rows in `item_attributes`. The core only consumes the
//! narrow interface here: enumerate items, read a typed field with a
//! default, persist a set of field changes by item id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, params};

use crate::error::SyncError;
use crate::mapping::FieldType;
use crate::table::Value;

#[derive(Debug)]
pub struct Catalog {
    conn: Connection,
    item_columns: Vec<String>,
}

/// One library item: the stable integer id plus every known field value,
/// fixed columns and flexible attributes merged.
pub struct Item {
    pub id: i64,
    values: HashMap<String, Value>,
}

impl Item {
    /// Typed field access. A missing or null field yields the declared
    /// type's load default; stored values are reshaped to the declared type
    /// (flexible attributes are always text at rest).
    pub fn get(&self, field: &str, ty: FieldType) -> Value {
        let coerced = match self.values.get(field) {
            Some(raw) => ty.coerce(raw),
            None => Value::Null,
        };
        if coerced.is_null() {
            ty.load_default()
        } else {
            coerced
        }
    }
}

/// Flag beats environment beats the platform default beets location.
pub fn resolve_library_path(flag: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = flag {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var("BEETS_LIBRARY") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("beets").join("library.db"))
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn value_from_sql(raw: ValueRef<'_>) -> Value {
    match raw {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Int(n),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        // Beets stores paths as blobs.
        ValueRef::Blob(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        if path.is_dir() {
            return Err(SyncError::SourceUnavailable(format!(
                "beets library is a directory: {}",
                path.display()
            )));
        }
        if !path.is_file() {
            return Err(SyncError::SourceUnavailable(format!(
                "beets library not found: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .map_err(|err| {
                SyncError::SourceUnavailable(format!(
                    "cannot open beets library {}: {err}",
                    path.display()
                ))
            })?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .map_err(|err| SyncError::Load(format!("beets library pragma failed: {err}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, SyncError> {
        let item_columns = {
            let stmt = conn
                .prepare("SELECT * FROM items LIMIT 0")
                .map_err(|err| SyncError::Load(format!("not a beets library: {err}")))?;
            stmt.column_names().iter().map(|s| s.to_string()).collect()
        };
        Ok(Self { conn, item_columns })
    }

    /// All items, joined with their flexible attributes. `query` is an
    /// optional case-insensitive substring filter over title/artist/album.
    pub fn items(&self, query: Option<&str>) -> Result<Vec<Item>, SyncError> {
        let mut sql = String::from("SELECT * FROM items");
        let like;
        let mut bind: Vec<&dyn rusqlite::types::ToSql> = vec![];
        if let Some(q) = query {
            like = format!("%{}%", escape_like(q));
            sql.push_str(
                " WHERE title LIKE ?1 ESCAPE '\\' \
                 OR artist LIKE ?1 ESCAPE '\\' \
                 OR album LIKE ?1 ESCAPE '\\'",
            );
            bind.push(&like);
        }
        sql.push_str(" ORDER BY id");

        let mut items = Vec::new();
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| SyncError::Load(format!("beets items query failed: {err}")))?;
        let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt
            .query(bind.as_slice())
            .map_err(|err| SyncError::Load(format!("beets items query failed: {err}")))?;
        while let Some(row) = rows
            .next()
            .map_err(|err| SyncError::Load(format!("beets items read failed: {err}")))?
        {
            let mut values = HashMap::with_capacity(column_names.len());
            for (i, name) in column_names.iter().enumerate() {
                let raw = row
                    .get_ref(i)
                    .map_err(|err| SyncError::Load(format!("beets column read failed: {err}")))?;
                values.insert(name.clone(), value_from_sql(raw));
            }
            let id = match values.get("id") {
                Some(Value::Int(id)) => *id,
                _ => {
                    return Err(SyncError::Load(
                        "beets item row without an integer id".to_string(),
                    ));
                }
            };
            items.push(Item { id, values });
        }

        self.attach_flexible_attributes(&mut items)?;
        Ok(items)
    }

    fn attach_flexible_attributes(&self, items: &mut [Item]) -> Result<(), SyncError> {
        let by_id: HashMap<i64, usize> =
            items.iter().enumerate().map(|(i, item)| (item.id, i)).collect();
        let mut stmt = self
            .conn
            .prepare("SELECT entity_id, key, value FROM item_attributes")
            .map_err(|err| SyncError::Load(format!("beets attributes query failed: {err}")))?;
        let mut rows = stmt
            .query([])
            .map_err(|err| SyncError::Load(format!("beets attributes query failed: {err}")))?;
        while let Some(row) = rows
            .next()
            .map_err(|err| SyncError::Load(format!("beets attributes read failed: {err}")))?
        {
            let entity_id: i64 = row
                .get(0)
                .map_err(|err| SyncError::Load(format!("beets attribute row: {err}")))?;
            let key: String = row
                .get(1)
                .map_err(|err| SyncError::Load(format!("beets attribute row: {err}")))?;
            let value: Option<String> = row
                .get(2)
                .map_err(|err| SyncError::Load(format!("beets attribute row: {err}")))?;
            if let Some(&idx) = by_id.get(&entity_id) {
                let item = &mut items[idx];
                // Flexible attributes never shadow fixed columns.
                if !item.values.contains_key(&key) {
                    item.values
                        .insert(key, value.map(Value::Text).unwrap_or(Value::Null));
                }
            }
        }
        Ok(())
    }

    /// Persist a set of field changes for one item. Fixed columns update the
    /// `items` row; everything else upserts a flexible attribute. Applied
    /// and persisted immediately, one item per call.
    pub fn update_item(&self, id: i64, fields: &[(String, Value)]) -> Result<(), SyncError> {
        let update_err = |err: rusqlite::Error| SyncError::Update {
            track_id: id,
            message: err.to_string(),
        };
        for (field, value) in fields {
            if self.item_columns.iter().any(|c| c == field) {
                let sql = format!("UPDATE items SET \"{field}\" = ?1 WHERE id = ?2");
                self.conn
                    .execute(&sql, params![sql_value(value), id])
                    .map_err(update_err)?;
            } else {
                let text = value.render();
                let updated = self
                    .conn
                    .execute(
                        "UPDATE item_attributes SET value = ?1 \
                         WHERE entity_id = ?2 AND key = ?3",
                        params![text, id, field],
                    )
                    .map_err(update_err)?;
                if updated == 0 {
                    self.conn
                        .execute(
                            "INSERT INTO item_attributes (entity_id, key, value) \
                             VALUES (?1, ?2, ?3)",
                            params![id, field, text],
                        )
                        .map_err(update_err)?;
                }
            }
        }
        Ok(())
    }
}

fn sql_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Int(n) => rusqlite::types::Value::Integer(*n),
        Value::Float(f) => rusqlite::types::Value::Real(*f),
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
    }
}
