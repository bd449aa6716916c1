use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

use studyhall_api::db::Built;
use studyhall_api::db::migrations::MIGRATIONS;
use studyhall_api::{
    AiFileStatus, Course, Difficulty, Flashcard, LessonType, Lesson, LessonSummary, Material,
};

/// Shared database state
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }
}

/// Initialize the database: open connection, enable WAL, run migrations
pub fn init_db(data_dir: &Path) -> Result<Db> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("studyhall.db");
    let conn = Connection::open(&db_path).context("opening SQLite database")?;

    // Enable WAL mode for better concurrent read performance
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;

    run_migrations(&conn)?;

    Ok(Db {
        conn: Arc::new(Mutex::new(conn)),
    })
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    for &(name, sql) in MIGRATIONS {
        let already_applied: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM _migrations WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !already_applied {
            conn.execute_batch(sql)
                .with_context(|| format!("running migration {name}"))?;
            conn.execute("INSERT INTO _migrations (name) VALUES (?1)", [name])?;
            tracing::info!("Applied migration: {name}");
        }
    }

    Ok(())
}

// ── sea-query bridge ────────────────────────────────────────────────────────

/// Convert `sea_query::Values` into rusqlite bind params.
fn to_sql_values(values: &sea_query::Values) -> Vec<rusqlite::types::Value> {
    use rusqlite::types::Value as Sql;
    use sea_query::Value as Sq;

    values
        .0
        .iter()
        .map(|v| match v {
            Sq::String(Some(s)) => Sql::Text(s.as_str().to_string()),
            Sq::Int(Some(i)) => Sql::Integer(i64::from(*i)),
            Sq::BigInt(Some(i)) => Sql::Integer(*i),
            Sq::Unsigned(Some(i)) => Sql::Integer(i64::from(*i)),
            Sq::BigUnsigned(Some(i)) => Sql::Integer(i64::try_from(*i).unwrap_or(i64::MAX)),
            Sq::Bool(Some(b)) => Sql::Integer(i64::from(*b)),
            Sq::Double(Some(f)) => Sql::Real(*f),
            Sq::Bytes(Some(b)) => Sql::Blob(b.as_ref().clone()),
            _ => Sql::Null,
        })
        .collect()
}

pub fn sq_execute(conn: &Connection, built: Built) -> rusqlite::Result<usize> {
    let (sql, values) = built;
    conn.execute(&sql, rusqlite::params_from_iter(to_sql_values(&values)))
}

pub fn sq_query_row<T>(
    conn: &Connection,
    built: Built,
    f: impl FnOnce(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let (sql, values) = built;
    conn.query_row(&sql, rusqlite::params_from_iter(to_sql_values(&values)), f)
}

pub fn sq_query_map<T>(
    conn: &Connection,
    built: Built,
    f: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Vec<T>> {
    let (sql, values) = built;
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(to_sql_values(&values)), f)?;
    rows.collect()
}

/// `Ok(None)` instead of `QueryReturnedNoRows`.
pub fn optional<T>(result: rusqlite::Result<T>) -> rusqlite::Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Format of `refresh_tokens.expires_at`.
pub const TOKEN_EXPIRY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Delete refresh tokens that expired before `now`.
pub fn purge_expired_refresh_tokens(db: &Db, now: DateTime<Utc>) -> rusqlite::Result<usize> {
    let now = now.format(TOKEN_EXPIRY_FORMAT).to_string();
    sq_execute(&db.conn(), studyhall_api::db::users::purge_expired_refresh_tokens(&now))
}

// ── Row mappers ─────────────────────────────────────────────────────────────

fn json_list<T: serde::de::DeserializeOwned>(raw: &str) -> Vec<T> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Columns from `db::courses::course_select()`.
pub fn course_from_row(row: &Row<'_>) -> rusqlite::Result<Course> {
    Ok(Course {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        material_count: row.get(5)?,
    })
}

/// A material with its server-only columns.
#[derive(Debug, Clone)]
pub struct StoredMaterial {
    pub material: Material,
    pub storage_path: String,
}

/// Columns from `db::materials::material_select()`.
pub fn material_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMaterial> {
    let tags: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(StoredMaterial {
        material: Material {
            id: row.get(0)?,
            course_id: row.get(1)?,
            file_name: row.get(2)?,
            mime_type: row.get(3)?,
            size_bytes: row.get(4)?,
            tags: json_list(&tags),
            ai_status: AiFileStatus::parse(&status).unwrap_or_default(),
            ai_file_uri: row.get(7)?,
            ai_file_expires_at: row.get(8)?,
            created_at: row.get(9)?,
        },
        storage_path: row.get(10)?,
    })
}

pub fn lesson_summary_from_row(row: &Row<'_>) -> rusqlite::Result<LessonSummary> {
    let lesson_type: String = row.get(3)?;
    let topics: String = row.get(4)?;
    Ok(LessonSummary {
        id: row.get(0)?,
        course_id: row.get(1)?,
        title: row.get(2)?,
        lesson_type: LessonType::parse(&lesson_type).unwrap_or_default(),
        topics: json_list(&topics),
        message_count: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub fn lesson_from_row(row: &Row<'_>) -> rusqlite::Result<Lesson> {
    let lesson_type: String = row.get(3)?;
    let topics: String = row.get(4)?;
    let messages: String = row.get(5)?;
    Ok(Lesson {
        id: row.get(0)?,
        course_id: row.get(1)?,
        title: row.get(2)?,
        lesson_type: LessonType::parse(&lesson_type).unwrap_or_default(),
        topics: json_list(&topics),
        messages: json_list(&messages),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub fn flashcard_from_row(row: &Row<'_>) -> rusqlite::Result<Flashcard> {
    let difficulty: String = row.get(5)?;
    Ok(Flashcard {
        id: row.get(0)?,
        course_id: row.get(1)?,
        concept: row.get(2)?,
        definition: row.get(3)?,
        topic: row.get(4)?,
        difficulty: Difficulty::parse(&difficulty).unwrap_or_default(),
        created_at: row.get(6)?,
    })
}
