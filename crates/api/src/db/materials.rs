//! Material query builders.
//!
//! `tags` is stored as a JSON array of strings.

use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use super::Built;
use super::tables::Materials;
use crate::AiFileStatus;

/// Column order must match `material_from_row()`.
fn material_select() -> sea_query::SelectStatement {
    Query::select()
        .columns([
            Materials::Id,
            Materials::CourseId,
            Materials::FileName,
            Materials::MimeType,
            Materials::SizeBytes,
            Materials::Tags,
            Materials::AiStatus,
            Materials::AiFileUri,
            Materials::AiFileExpiresAt,
            Materials::CreatedAt,
            Materials::StoragePath,
        ])
        .from(Materials::Table)
        .to_owned()
}

/// Parameters for inserting a material.
pub struct InsertParams<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub course_id: &'a str,
    pub file_name: &'a str,
    pub mime_type: &'a str,
    pub size_bytes: i64,
    pub storage_path: &'a str,
    pub tags_json: &'a str,
}

pub fn insert(p: &InsertParams<'_>) -> Built {
    Query::insert()
        .into_table(Materials::Table)
        .columns([
            Materials::Id,
            Materials::UserId,
            Materials::CourseId,
            Materials::FileName,
            Materials::MimeType,
            Materials::SizeBytes,
            Materials::StoragePath,
            Materials::Tags,
        ])
        .values_panic([
            p.id.into(),
            p.user_id.into(),
            p.course_id.into(),
            p.file_name.into(),
            p.mime_type.into(),
            p.size_bytes.into(),
            p.storage_path.into(),
            p.tags_json.into(),
        ])
        .build(SqliteQueryBuilder)
}

pub fn list_by_course(user_id: &str, course_id: &str) -> Built {
    material_select()
        .and_where(Expr::col(Materials::UserId).eq(user_id))
        .and_where(Expr::col(Materials::CourseId).eq(course_id))
        .order_by(Materials::CreatedAt, Order::Asc)
        .build(SqliteQueryBuilder)
}

/// Every material the user owns, across courses.
pub fn list_by_user(user_id: &str) -> Built {
    material_select()
        .and_where(Expr::col(Materials::UserId).eq(user_id))
        .order_by(Materials::CreatedAt, Order::Asc)
        .build(SqliteQueryBuilder)
}

pub fn get(user_id: &str, id: &str) -> Built {
    material_select()
        .and_where(Expr::col(Materials::UserId).eq(user_id))
        .and_where(Expr::col(Materials::Id).eq(id))
        .build(SqliteQueryBuilder)
}

pub fn update_tags(user_id: &str, id: &str, tags_json: &str) -> Built {
    Query::update()
        .table(Materials::Table)
        .value(Materials::Tags, tags_json)
        .and_where(Expr::col(Materials::UserId).eq(user_id))
        .and_where(Expr::col(Materials::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// Cache the vendor file handle after a successful upload.
pub fn set_remote_file(
    user_id: &str,
    id: &str,
    ai_file_name: &str,
    ai_file_uri: &str,
    expires_at: Option<&str>,
) -> Built {
    Query::update()
        .table(Materials::Table)
        .value(Materials::AiStatus, AiFileStatus::Ready.as_str())
        .value(Materials::AiFileName, ai_file_name)
        .value(Materials::AiFileUri, ai_file_uri)
        .value(Materials::AiFileExpiresAt, expires_at.map(|s| s.to_string()))
        .and_where(Expr::col(Materials::UserId).eq(user_id))
        .and_where(Expr::col(Materials::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// Set status only (inline / failed). The cached handle is left alone so a
/// transient failure does not discard a still-valid upload.
pub fn set_ai_status(user_id: &str, id: &str, status: AiFileStatus) -> Built {
    Query::update()
        .table(Materials::Table)
        .value(Materials::AiStatus, status.as_str())
        .and_where(Expr::col(Materials::UserId).eq(user_id))
        .and_where(Expr::col(Materials::Id).eq(id))
        .build(SqliteQueryBuilder)
}

pub fn delete(user_id: &str, id: &str) -> Built {
    Query::delete()
        .from_table(Materials::Table)
        .and_where(Expr::col(Materials::UserId).eq(user_id))
        .and_where(Expr::col(Materials::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// Storage paths of a course's materials (object cleanup before course delete).
pub fn storage_paths_by_course(user_id: &str, course_id: &str) -> Built {
    Query::select()
        .column(Materials::StoragePath)
        .from(Materials::Table)
        .and_where(Expr::col(Materials::UserId).eq(user_id))
        .and_where(Expr::col(Materials::CourseId).eq(course_id))
        .build(SqliteQueryBuilder)
}
