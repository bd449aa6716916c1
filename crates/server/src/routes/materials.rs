use axum::{
    Json,
    extract::{Multipart, Path, Query, State, multipart::MultipartError},
    http::StatusCode,
};
use rusqlite::Connection;
use uuid::Uuid;

use studyhall_api::{
    ListMaterialsResponse, Material, MaterialListQuery, OkResponse, SignedUrlResponse,
    UpdateMaterialRequest, db, service,
};

use crate::AppConfig;
use crate::error::ApiErr;
use crate::objects::{self, ObjectStore};
use crate::routes::auth::{AuthUser, now_unix};
use crate::routes::courses::ensure_course;
use crate::storage::{
    Db, StoredMaterial, material_from_row, optional, sq_execute, sq_query_map, sq_query_row,
};
use crate::tutor::TutorState;

pub(crate) fn load_material(
    conn: &Connection,
    user_id: &str,
    material_id: &str,
) -> Result<StoredMaterial, ApiErr> {
    optional(sq_query_row(conn, db::materials::get(user_id, material_id), material_from_row))
        .map_err(ApiErr::from_db("load material"))?
        .ok_or_else(|| ApiErr::not_found("material not found"))
}

fn multipart_err(e: MultipartError) -> ApiErr {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiErr::payload_too_large("file exceeds the upload size limit")
    } else {
        ApiErr::bad_request(format!("invalid multipart body: {}", e.body_text()))
    }
}

struct UploadedFile {
    file_name: String,
    mime_type: String,
    bytes: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// POST /api/courses/{id}/materials: multipart upload.
///
/// Fields: `file` (required, exactly one) and any number of `tag` fields;
/// a `tags` field is split on commas.
pub async fn upload(
    State(db): State<Db>,
    State(store): State<ObjectStore>,
    State(config): State<AppConfig>,
    State(tutor): State<TutorState>,
    user: AuthUser,
    Path(course_id): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Material>), ApiErr> {
    ensure_course(&db.conn(), &user.user_id, &course_id)?;

    let mut file: Option<UploadedFile> = None;
    let mut raw_tags: Vec<String> = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_err)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if file.is_some() {
                    return Err(ApiErr::bad_request("only one file per upload"));
                }
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .filter(|n| !n.trim().is_empty())
                    .ok_or_else(|| ApiErr::bad_request("file name is required"))?;
                let declared = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(multipart_err)?;
                let mime_type = match declared.as_deref() {
                    None | Some("") | Some("application/octet-stream") => {
                        objects::guess_mime(&file_name).to_string()
                    }
                    Some(m) => m.to_string(),
                };
                file = Some(UploadedFile {
                    file_name,
                    mime_type,
                    bytes: bytes.to_vec(),
                });
            }
            "tag" => raw_tags.push(field.text().await.map_err(multipart_err)?),
            "tags" => {
                let text = field.text().await.map_err(multipart_err)?;
                raw_tags.extend(text.split(',').map(str::to_string));
            }
            _ => {}
        }
    }

    let file = file.ok_or_else(|| ApiErr::bad_request("missing `file` field"))?;
    if file.bytes.is_empty() {
        return Err(ApiErr::bad_request("file is empty"));
    }
    if file.bytes.len() as u64 > config.max_upload_bytes {
        return Err(ApiErr::payload_too_large(format!(
            "file exceeds the {} MB upload limit",
            config.max_upload_bytes / (1024 * 1024)
        )));
    }
    let tags = service::normalize_tags(&raw_tags)?;
    let tags_json = serde_json::to_string(&tags).map_err(ApiErr::from_db("encode tags"))?;

    let id = Uuid::new_v4().to_string();
    let storage_path = ObjectStore::material_path(&user.user_id, &course_id, &id, &file.file_name);
    store
        .put(&storage_path, &file.bytes)
        .await
        .map_err(ApiErr::from_db("store material"))?;

    let inserted = {
        let conn = db.conn();
        sq_execute(
            &conn,
            db::materials::insert(&db::materials::InsertParams {
                id: &id,
                user_id: &user.user_id,
                course_id: &course_id,
                file_name: &file.file_name,
                mime_type: &file.mime_type,
                size_bytes: studyhall_api::saturating_i64(file.bytes.len() as u64),
                storage_path: &storage_path,
                tags_json: &tags_json,
            }),
        )
        .and_then(|_| sq_execute(&conn, db::courses::touch(&user.user_id, &course_id)))
        .map_err(ApiErr::from_db("insert material"))
        .and_then(|_| load_material(&conn, &user.user_id, &id))
    };
    let stored = match inserted {
        Ok(stored) => stored,
        Err(e) => {
            let _ = store.delete(&storage_path).await;
            return Err(e);
        }
    };

    tutor.invalidate_course(&db, &user.user_id, &course_id);
    tracing::info!(
        material_id = %id,
        size = file.bytes.len(),
        mime = %file.mime_type,
        "material uploaded"
    );
    Ok((StatusCode::CREATED, Json(stored.material)))
}

// ---------------------------------------------------------------------------
// List / get
// ---------------------------------------------------------------------------

/// GET /api/courses/{id}/materials?topic=: materials of a course.
pub async fn list_for_course(
    State(db): State<Db>,
    user: AuthUser,
    Path(course_id): Path<String>,
    Query(q): Query<MaterialListQuery>,
) -> Result<Json<ListMaterialsResponse>, ApiErr> {
    let conn = db.conn();
    ensure_course(&conn, &user.user_id, &course_id)?;
    let stored = sq_query_map(
        &conn,
        db::materials::list_by_course(&user.user_id, &course_id),
        material_from_row,
    )
    .map_err(ApiErr::from_db("list materials"))?;

    let selected: Vec<&str> = q
        .topic
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .into_iter()
        .collect();
    let materials = stored
        .into_iter()
        .map(|s| s.material)
        .filter(|m| service::material_matches_topics(m, &selected))
        .collect();
    Ok(Json(ListMaterialsResponse { materials }))
}

/// GET /api/materials/{id}
pub async fn get(
    State(db): State<Db>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Material>, ApiErr> {
    let conn = db.conn();
    Ok(Json(load_material(&conn, &user.user_id, &id)?.material))
}

// ---------------------------------------------------------------------------
// Update / delete
// ---------------------------------------------------------------------------

/// PATCH /api/materials/{id}: replace the topic tags.
pub async fn update_tags(
    State(db): State<Db>,
    State(tutor): State<TutorState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateMaterialRequest>,
) -> Result<Json<Material>, ApiErr> {
    let tags = service::normalize_tags(&req.tags)?;
    let tags_json = serde_json::to_string(&tags).map_err(ApiErr::from_db("encode tags"))?;
    let stored = {
        let conn = db.conn();
        let current = load_material(&conn, &user.user_id, &id)?;
        sq_execute(&conn, db::materials::update_tags(&user.user_id, &id, &tags_json))
            .map_err(ApiErr::from_db("update tags"))?;
        StoredMaterial {
            material: Material {
                tags,
                ..current.material
            },
            ..current
        }
    };
    tutor.invalidate_course(&db, &user.user_id, &stored.material.course_id);
    Ok(Json(stored.material))
}

/// DELETE /api/materials/{id}: remove the row and the stored file.
pub async fn delete(
    State(db): State<Db>,
    State(store): State<ObjectStore>,
    State(tutor): State<TutorState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, ApiErr> {
    let stored = {
        let conn = db.conn();
        let stored = load_material(&conn, &user.user_id, &id)?;
        sq_execute(&conn, db::materials::delete(&user.user_id, &id))
            .map_err(ApiErr::from_db("delete material"))?;
        stored
    };
    if let Err(e) = store.delete(&stored.storage_path).await {
        tracing::warn!("delete object {}: {e}", stored.storage_path);
    }
    tutor.invalidate_course(&db, &user.user_id, &stored.material.course_id);
    Ok(Json(OkResponse { ok: true }))
}

// ---------------------------------------------------------------------------
// Signed URL
// ---------------------------------------------------------------------------

/// GET /api/materials/{id}/url: expiring download link.
pub async fn signed_url(
    State(db): State<Db>,
    State(store): State<ObjectStore>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<SignedUrlResponse>, ApiErr> {
    let stored = load_material(&db.conn(), &user.user_id, &id)?;
    let signed = store.signed_url(&stored.storage_path, now_unix());
    let expires_at = chrono::DateTime::from_timestamp(signed.expires_unix as i64, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    Ok(Json(SignedUrlResponse {
        url: signed.url,
        expires_at,
    }))
}
