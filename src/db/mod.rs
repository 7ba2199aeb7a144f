use crate::errors::{AppError, AppResult};
use crate::models::{ColumnInfo, StructuralSnapshot, TableInfo};
use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const BUSY_TIMEOUT: Duration = Duration::from_secs(1);
const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

pub trait Inspector: Send + Sync {
    fn inspect(&self, path: &Path) -> AppResult<StructuralSnapshot>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteInspector;

impl Inspector for SqliteInspector {
    fn inspect(&self, path: &Path) -> AppResult<StructuralSnapshot> {
        let metadata = fs::metadata(path)
            .map_err(|error| AppError::NotFound(format!("{}: {}", path.display(), error)))?;
        let wal_path = sidecar_path(path, "-wal");
        let shm_path = sidecar_path(path, "-shm");
        let wal_metadata = fs::metadata(&wal_path).ok();

        let last_modified = [metadata.modified().ok(), wal_metadata.as_ref().and_then(|meta| meta.modified().ok())]
            .into_iter()
            .flatten()
            .max()
            .map(to_utc);

        let conn = open_read_only(path)?;
        let tables = list_tables(&conn).map_err(inspection_error)?;

        Ok(StructuralSnapshot {
            tables,
            file_size: metadata.len(),
            wal_size: wal_metadata.map(|meta| meta.len()).unwrap_or(0),
            shm_size: fs::metadata(&shm_path).map(|meta| meta.len()).unwrap_or(0),
            last_modified,
            journal_mode: pragma_text(&conn, "journal_mode").map_err(inspection_error)?,
            page_size: pragma_i64(&conn, "page_size").map_err(inspection_error)?,
            page_count: pragma_i64(&conn, "page_count").map_err(inspection_error)?,
            freelist_count: pragma_i64(&conn, "freelist_count").map_err(inspection_error)?,
            encoding: pragma_text(&conn, "encoding").map_err(inspection_error)?,
            user_version: pragma_i64(&conn, "user_version").map_err(inspection_error)?,
            sqlite_version: conn
                .query_row("SELECT sqlite_version()", [], |row| row.get(0))
                .map_err(inspection_error)?,
            integrity: pragma_text(&conn, "quick_check(1)").map_err(inspection_error)?,
        })
    }
}

/// Opens a monitored database without ever taking a write lock on it.
pub fn open_read_only(path: &Path) -> AppResult<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )
    .map_err(|error| AppError::Inspection(format!("{}: {}", path.display(), error)))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

pub fn query_scalar(path: &Path, sql: &str) -> AppResult<Option<String>> {
    let conn = open_read_only(path)?;
    scalar(&conn, sql)
}

/// Runs a single-value query. Zero rows yield `None`; more than one row or column is an error.
pub fn scalar(conn: &Connection, sql: &str) -> AppResult<Option<String>> {
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        return Err(AppError::Query("Watch queries must be read-only".to_string()));
    }
    let columns = stmt.column_count();
    if columns != 1 {
        return Err(AppError::Query(format!(
            "Query must return exactly one column (got {})",
            columns
        )));
    }

    let mut rows = stmt.query([])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let value = value_to_string(row.get_ref(0)?);
    if rows.next()?.is_some() {
        return Err(AppError::Query("Query returned more than one row".to_string()));
    }
    Ok(value)
}

/// Lists files in `dir` that carry the SQLite header, sorted by path.
pub fn discover_databases(dir: &Path) -> AppResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && has_sqlite_header(&path) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

fn has_sqlite_header(path: &Path) -> bool {
    let mut header = [0u8; 16];
    fs::File::open(path)
        .and_then(|mut file| file.read_exact(&mut header))
        .map(|_| &header == SQLITE_MAGIC)
        .unwrap_or(false)
}

fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<TableInfo>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND substr(name, 1, 7) <> 'sqlite_'
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let quoted = quote_identifier(&name);
        let row_count = match conn.query_row(&format!("SELECT COUNT(*) FROM {quoted}"), [], |row| row.get(0)) {
            Ok(count) => Some(count),
            Err(error) => {
                tracing::debug!(table = %name, error = %error, "row count unavailable");
                None
            }
        };
        let columns = table_columns(conn, &quoted)?;
        tables.push(TableInfo {
            name,
            row_count,
            columns,
        });
    }
    Ok(tables)
}

fn table_columns(conn: &Connection, quoted_table: &str) -> rusqlite::Result<Vec<ColumnInfo>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({quoted_table})"))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                declared_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                not_null: row.get::<_, i64>(3)? != 0,
                primary_key: row.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

fn pragma_i64(conn: &Connection, pragma: &str) -> rusqlite::Result<i64> {
    conn.query_row(&format!("PRAGMA {pragma}"), [], |row| row.get(0))
}

fn pragma_text(conn: &Connection, pragma: &str) -> rusqlite::Result<String> {
    conn.query_row(&format!("PRAGMA {pragma}"), [], |row| row.get(0))
}

fn value_to_string(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(value) => Some(value.to_string()),
        ValueRef::Real(value) => Some(value.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        ValueRef::Blob(bytes) => Some(format!("<{} bytes>", bytes.len())),
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

fn inspection_error(error: rusqlite::Error) -> AppError {
    AppError::Inspection(error.to_string())
}
