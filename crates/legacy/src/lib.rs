//! Duet legacy backend: the relational store objects lived in before unified storage.
//! Rows are keyed by org id + kind + name. Simple, synchronous SQLite; the async
//! adapter pushes calls onto the blocking pool.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

mod adapter;

pub use adapter::{namespace_for_org, org_for_namespace, LegacyAdapter};

#[derive(Debug, thiserror::Error)]
pub enum LegacyError {
    #[error("row already exists")]
    Duplicate,
    #[error("row not found")]
    Missing,
    #[error("version mismatch (current {current})")]
    VersionMismatch { current: i64 },
    #[error("uid precondition failed (stored {stored})")]
    UidMismatch { stored: String, current: i64 },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("connection lock poisoned")]
    Poisoned,
}

/// Backend-native row shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRow {
    pub org_id: i64,
    pub kind: String,
    pub name: String,
    pub uid: String,
    /// Drawn from a store-wide sequence, so it only ever grows.
    pub version: i64,
    pub generation: i64,
    pub created: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub spec: serde_json::Value,
}

/// Conditions an update must satisfy against the stored row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Precondition {
    pub version: Option<i64>,
    pub uid: Option<String>,
}

/// Caller-owned fields written by insert/update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFields {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub spec: serde_json::Value,
}

const COLUMNS: &str = "org_id, kind, name, uid, version, generation, created, labels, annotations, spec";

pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> anyhow::Result<Self> {
        let path = std::env::var("DUET_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> anyhow::Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        let me = Self::init(db)?;
        histogram!("legacy_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db)
    }

    fn init(db: rusqlite::Connection) -> anyhow::Result<Self> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS legacy_object (
                org_id      INTEGER NOT NULL,
                kind        TEXT NOT NULL,
                name        TEXT NOT NULL,
                uid         TEXT NOT NULL,
                version     INTEGER NOT NULL,
                generation  INTEGER NOT NULL,
                created     TEXT NOT NULL,
                labels      TEXT NOT NULL,
                annotations TEXT NOT NULL,
                spec        TEXT NOT NULL,
                PRIMARY KEY (org_id, kind, name)
            );
            CREATE TABLE IF NOT EXISTS legacy_sequence (
                id    INTEGER PRIMARY KEY CHECK (id = 0),
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO legacy_sequence(id, value) VALUES (0, 0);",
        )
        .context("creating legacy tables")?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, LegacyError> {
        self.db.lock().map_err(|_| LegacyError::Poisoned)
    }

    pub fn get(&self, org_id: i64, kind: &str, name: &str) -> Result<Option<LegacyRow>, LegacyError> {
        let started = std::time::Instant::now();
        let db = self.lock()?;
        let row = select_one(&db, org_id, kind, name)?;
        histogram!("legacy_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(row)
    }

    /// Insert a new row; `version` is assigned here, everything else is taken from `row`.
    pub fn insert(&self, mut row: LegacyRow) -> Result<LegacyRow, LegacyError> {
        let started = std::time::Instant::now();
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        if select_one(&tx, row.org_id, &row.kind, &row.name)?.is_some() {
            return Err(LegacyError::Duplicate);
        }
        row.version = next_version(&tx)?;
        tx.execute(
            &format!("INSERT INTO legacy_object({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            (
                row.org_id,
                &row.kind,
                &row.name,
                &row.uid,
                row.version,
                row.generation,
                &row.created,
                serde_json::to_string(&row.labels)?,
                serde_json::to_string(&row.annotations)?,
                serde_json::to_string(&row.spec)?,
            ),
        )?;
        tx.commit()?;
        histogram!("legacy_insert_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("legacy_write_total", 1u64, "op" => "insert");
        Ok(row)
    }

    /// Compare-and-swap update of the caller-owned fields. Generation advances
    /// only when `spec` changes.
    pub fn update(
        &self,
        org_id: i64,
        kind: &str,
        name: &str,
        fields: RowFields,
        pre: &Precondition,
    ) -> Result<LegacyRow, LegacyError> {
        let started = std::time::Instant::now();
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let mut row = select_one(&tx, org_id, kind, name)?.ok_or(LegacyError::Missing)?;
        if let Some(uid) = pre.uid.as_deref() {
            if uid != row.uid {
                return Err(LegacyError::UidMismatch { stored: row.uid, current: row.version });
            }
        }
        if let Some(expected) = pre.version {
            if expected != row.version {
                return Err(LegacyError::VersionMismatch { current: row.version });
            }
        }
        if row.spec != fields.spec {
            row.generation += 1;
            row.spec = fields.spec;
        }
        row.labels = fields.labels;
        row.annotations = fields.annotations;
        row.version = next_version(&tx)?;
        tx.execute(
            "UPDATE legacy_object
                SET version = ?4, generation = ?5, labels = ?6, annotations = ?7, spec = ?8
              WHERE org_id = ?1 AND kind = ?2 AND name = ?3",
            (
                org_id,
                kind,
                name,
                row.version,
                row.generation,
                serde_json::to_string(&row.labels)?,
                serde_json::to_string(&row.annotations)?,
                serde_json::to_string(&row.spec)?,
            ),
        )?;
        tx.commit()?;
        histogram!("legacy_update_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("legacy_write_total", 1u64, "op" => "update");
        Ok(row)
    }

    /// Hard delete. Returns whether a row existed.
    pub fn delete(&self, org_id: i64, kind: &str, name: &str) -> Result<bool, LegacyError> {
        let db = self.lock()?;
        let n = db.execute(
            "DELETE FROM legacy_object WHERE org_id = ?1 AND kind = ?2 AND name = ?3",
            (org_id, kind, name),
        )?;
        counter!("legacy_write_total", 1u64, "op" => "delete");
        Ok(n > 0)
    }

    /// Rows of `kind` ordered by (org_id, name), strictly after `after`.
    pub fn scan(
        &self,
        kind: &str,
        org_id: Option<i64>,
        after: Option<(i64, &str)>,
        limit: usize,
    ) -> Result<Vec<LegacyRow>, LegacyError> {
        let started = std::time::Instant::now();
        let (after_org, after_name) = after.unwrap_or((i64::MIN, ""));
        let db = self.lock()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {COLUMNS} FROM legacy_object
              WHERE kind = ?1
                AND (?2 IS NULL OR org_id = ?2)
                AND (org_id > ?3 OR (org_id = ?3 AND name > ?4))
              ORDER BY org_id, name
              LIMIT ?5"
        ))?;
        let mut rows = stmt.query((kind, org_id, after_org, after_name, limit as i64))?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(decode(raw_from(r)?)?);
        }
        histogram!("legacy_scan_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    /// Latest value handed out by the version sequence.
    pub fn current_version(&self) -> Result<i64, LegacyError> {
        let db = self.lock()?;
        Ok(db.query_row("SELECT value FROM legacy_sequence WHERE id = 0", [], |r| r.get(0))?)
    }
}

struct RawRow {
    org_id: i64,
    kind: String,
    name: String,
    uid: String,
    version: i64,
    generation: i64,
    created: String,
    labels: String,
    annotations: String,
    spec: String,
}

fn raw_from(r: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        org_id: r.get(0)?,
        kind: r.get(1)?,
        name: r.get(2)?,
        uid: r.get(3)?,
        version: r.get(4)?,
        generation: r.get(5)?,
        created: r.get(6)?,
        labels: r.get(7)?,
        annotations: r.get(8)?,
        spec: r.get(9)?,
    })
}

fn decode(raw: RawRow) -> Result<LegacyRow, LegacyError> {
    Ok(LegacyRow {
        org_id: raw.org_id,
        kind: raw.kind,
        name: raw.name,
        uid: raw.uid,
        version: raw.version,
        generation: raw.generation,
        created: raw.created,
        labels: serde_json::from_str(&raw.labels)?,
        annotations: serde_json::from_str(&raw.annotations)?,
        spec: serde_json::from_str(&raw.spec)?,
    })
}

fn select_one(db: &rusqlite::Connection, org_id: i64, kind: &str, name: &str) -> Result<Option<LegacyRow>, LegacyError> {
    let raw = db
        .query_row(
            &format!("SELECT {COLUMNS} FROM legacy_object WHERE org_id = ?1 AND kind = ?2 AND name = ?3"),
            (org_id, kind, name),
            raw_from,
        )
        .optional()?;
    raw.map(decode).transpose()
}

fn next_version(db: &rusqlite::Connection) -> Result<i64, LegacyError> {
    db.execute("UPDATE legacy_sequence SET value = value + 1 WHERE id = 0", [])?;
    Ok(db.query_row("SELECT value FROM legacy_sequence WHERE id = 0", [], |r| r.get(0))?)
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".duet");
        let _ = std::fs::create_dir_all(&p);
        p.push("legacy.db");
        return p.to_string_lossy().to_string();
    }
    "duet-legacy.db".to_string()
}
