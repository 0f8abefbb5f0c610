//! Relational sink
//!
//! SQLite-backed store for run records and the three artifact tables. Table
//! schemas are discovered from the data: columns are added as new keys show
//! up, and nested values are stored as JSON text.

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, instrument};
use userflow_common::types::Phase2Announcement;

/// Column stamped on every loaded row
pub const INSERTION_DATE_COLUMN: &str = "insertion_date";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: not a JSON object")]
    Parse { path: PathBuf, line: usize },
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// The three artifact tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Raw,
    Processed,
    DeadLetter,
}

impl ArtifactKind {
    pub fn table(self) -> &'static str {
        match self {
            ArtifactKind::Raw => "raw_users",
            ArtifactKind::Processed => "processed_users",
            ArtifactKind::DeadLetter => "invalid_users",
        }
    }

    /// Load order, matching [`Phase2Announcement::artifacts`]
    pub fn all() -> [ArtifactKind; 3] {
        [ArtifactKind::Raw, ArtifactKind::Processed, ArtifactKind::DeadLetter]
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// Result of loading one artifact file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// File missing or empty; nothing touched
    Skipped,
    /// Rows inserted
    Loaded(u64),
}

/// Run record row
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct RunRecord {
    pub id: i64,
    pub timestamp: String,
    pub raw_file: Option<String>,
    pub processed_file: Option<String>,
    pub dlq_file: Option<String>,
    pub valid_count: i64,
    pub invalid_count: i64,
}

/// How a column's values are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnEncoding {
    Integer,
    Real,
    Text,
    /// Objects and arrays serialized to JSON text
    Nested,
}

impl ColumnEncoding {
    /// Pick the encoding from a column's first non-null value
    pub fn for_value(value: &Value) -> Self {
        match value {
            Value::Object(_) | Value::Array(_) => ColumnEncoding::Nested,
            Value::Bool(_) => ColumnEncoding::Integer,
            Value::Number(n) if n.is_i64() || n.is_u64() => ColumnEncoding::Integer,
            Value::Number(_) => ColumnEncoding::Real,
            Value::String(_) | Value::Null => ColumnEncoding::Text,
        }
    }

    fn sql_type(self) -> &'static str {
        match self {
            ColumnEncoding::Integer => "INTEGER",
            ColumnEncoding::Real => "REAL",
            ColumnEncoding::Text | ColumnEncoding::Nested => "TEXT",
        }
    }

    fn encode(self, value: Option<&Value>) -> SqlValue {
        match value {
            None | Some(Value::Null) => SqlValue::Null,
            Some(v @ (Value::Object(_) | Value::Array(_))) => SqlValue::Text(v.to_string()),
            Some(v) if self == ColumnEncoding::Nested => SqlValue::Text(v.to_string()),
            Some(Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
            Some(Value::Number(n)) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => n
                    .as_f64()
                    .map(SqlValue::Real)
                    .unwrap_or_else(|| SqlValue::Text(n.to_string())),
            },
            Some(Value::String(s)) => SqlValue::Text(s.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

/// Columns in first-seen order with their encodings
fn plan_columns(rows: &[Map<String, Value>]) -> Vec<(String, ColumnEncoding)> {
    let mut columns: Vec<(String, Option<ColumnEncoding>)> = Vec::new();
    let mut seen = HashSet::new();

    for row in rows {
        for (key, value) in row {
            if seen.insert(key.as_str()) {
                columns.push((key.clone(), None));
            }
            if !value.is_null() {
                if let Some(slot) = columns.iter_mut().find(|(name, _)| name == key) {
                    if slot.1.is_none() {
                        slot.1 = Some(ColumnEncoding::for_value(value));
                    }
                }
            }
        }
    }

    let mut planned: Vec<(String, ColumnEncoding)> = columns
        .into_iter()
        .filter(|(name, _)| name != INSERTION_DATE_COLUMN)
        .map(|(name, encoding)| (name, encoding.unwrap_or(ColumnEncoding::Text)))
        .collect();
    planned.push((INSERTION_DATE_COLUMN.to_string(), ColumnEncoding::Text));
    planned
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn parse_rows(path: &Path, contents: &str) -> Result<Vec<Map<String, Value>>> {
    let mut rows = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(obj)) => rows.push(obj),
            _ => {
                return Err(SinkError::Parse {
                    path: path.to_path_buf(),
                    line: index + 1,
                })
            },
        }
    }
    Ok(rows)
}

/// SQLite sink; the loading stage is its only writer
#[derive(Clone)]
pub struct RelationalSink {
    pool: SqlitePool,
}

impl RelationalSink {
    /// Open (creating if needed) the database and run migrations
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| SinkError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        // One connection, kept open: a single writer, and in-memory
        // databases live only as long as their connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running migrations on it
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert one run record in its own transaction
    #[instrument(skip_all)]
    pub async fn record_run(&self, run: &Phase2Announcement) -> Result<i64> {
        let path_text = |p: &Option<PathBuf>| p.as_ref().map(|p| p.to_string_lossy().into_owned());

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO etl_runs (timestamp, raw_file, processed_file, dlq_file, valid_count, invalid_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(path_text(&run.raw_file))
        .bind(path_text(&run.processed_file))
        .bind(path_text(&run.dlq_file))
        .bind(i64::try_from(run.valid_count).unwrap_or(i64::MAX))
        .bind(i64::try_from(run.invalid_count).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let id = result.last_insert_rowid();
        info!(run_id = id, valid = run.valid_count, invalid = run.invalid_count, "Run recorded");
        Ok(id)
    }

    /// All run records, oldest first
    pub async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let runs = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT id, timestamp, raw_file, processed_file, dlq_file, valid_count, invalid_count
            FROM etl_runs
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }

    /// Append every line of a JSON-lines file to the artifact's table
    ///
    /// A missing or zero-length file is skipped. Any line that is not a JSON
    /// object fails the whole file and nothing is inserted. Reloading the same
    /// file appends its rows again.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn load_file(&self, path: &Path, kind: ArtifactKind) -> Result<LoadOutcome> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("File not found, skipping");
                return Ok(LoadOutcome::Skipped);
            },
            Err(source) => {
                return Err(SinkError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            },
        };
        if metadata.len() == 0 {
            info!("File is empty, skipping");
            return Ok(LoadOutcome::Skipped);
        }

        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SinkError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let mut rows = parse_rows(path, &contents)?;
        if rows.is_empty() {
            info!("File has no records, skipping");
            return Ok(LoadOutcome::Skipped);
        }

        let inserted_at = Value::String(Utc::now().to_rfc3339());
        for row in &mut rows {
            row.insert(INSERTION_DATE_COLUMN.to_string(), inserted_at.clone());
        }

        let columns = plan_columns(&rows);
        let table = kind.table();

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(table),
            columns
                .iter()
                .map(|(name, enc)| format!("{} {}", quote_ident(name), enc.sql_type()))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .execute(&mut *tx)
        .await?;

        let existing: HashSet<String> = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| row.get::<String, _>("name").to_ascii_lowercase())
            .collect();

        for (name, encoding) in &columns {
            if !existing.contains(&name.to_ascii_lowercase()) {
                debug!(table, column = %name, "Adding column");
                sqlx::query(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote_ident(table),
                    quote_ident(name),
                    encoding.sql_type()
                ))
                .execute(&mut *tx)
                .await?;
            }
        }

        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns
                .iter()
                .map(|(name, _)| quote_ident(name))
                .collect::<Vec<_>>()
                .join(", "),
            (1..=columns.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ")
        );

        for row in &rows {
            let mut query = sqlx::query(&insert_sql);
            for (name, encoding) in &columns {
                query = match encoding.encode(row.get(name)) {
                    SqlValue::Null => query.bind(Option::<String>::None),
                    SqlValue::Integer(i) => query.bind(i),
                    SqlValue::Real(f) => query.bind(f),
                    SqlValue::Text(s) => query.bind(s),
                };
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;

        let loaded = rows.len() as u64;
        info!(table, rows = loaded, "File loaded");
        Ok(LoadOutcome::Loaded(loaded))
    }

    /// Number of rows in an artifact table; zero if it was never created
    pub async fn row_count(&self, kind: ArtifactKind) -> Result<u64> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(kind.table())
        .fetch_one(&self.pool)
        .await?;
        if exists == 0 {
            return Ok(0);
        }

        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(kind.table())))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
