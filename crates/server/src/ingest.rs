//! Material ingestion: get each selected material in front of the model.
//!
//! Small text files are inlined into the system prompt. Everything else is
//! uploaded to the provider's file store once; the returned handle is cached
//! on the material row and reused until shortly before it expires.

use chrono::{DateTime, Duration, Utc};

use studyhall_api::{AiFileStatus, db};
use studyhall_tutor::prompt::MaterialContext;
use studyhall_tutor::{FileUpload, GenerativeModel, Part};

use crate::objects::ObjectStore;
use crate::storage::{Db, StoredMaterial, sq_execute};

/// Text materials up to this size are inlined instead of uploaded.
pub const INLINE_MAX_BYTES: i64 = 200 * 1024;

/// A cached handle must stay valid at least this long to be reused.
const HANDLE_REUSE_MARGIN_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Inline,
    Reuse(Part),
    Upload,
}

pub fn is_text_material(mime_type: &str, file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    mime_type.starts_with("text/")
        || mime_type == "application/json"
        || lower.ends_with(".md")
        || lower.ends_with(".txt")
}

pub fn plan(stored: &StoredMaterial, now: DateTime<Utc>) -> Plan {
    let m = &stored.material;
    if is_text_material(&m.mime_type, &m.file_name) && m.size_bytes <= INLINE_MAX_BYTES {
        return Plan::Inline;
    }
    if let Some(uri) = m.ai_file_uri.as_deref().filter(|u| !u.is_empty()) {
        let still_valid = match m.ai_file_expires_at.as_deref() {
            // No expiry reported: trust the handle.
            None => true,
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|exp| exp.with_timezone(&Utc) > now + Duration::minutes(HANDLE_REUSE_MARGIN_MINUTES))
                .unwrap_or(false),
        };
        if still_valid {
            return Plan::Reuse(Part::File {
                mime_type: m.mime_type.clone(),
                uri: uri.to_string(),
            });
        }
    }
    Plan::Upload
}

/// Build the model context for `materials`. Never fails as a whole: a
/// material that cannot be prepared is marked `failed` and reported by name.
pub async fn build_context(
    db: &Db,
    store: &ObjectStore,
    model: &dyn GenerativeModel,
    user_id: &str,
    materials: &[StoredMaterial],
) -> MaterialContext {
    let mut ctx = MaterialContext::new();
    let now = Utc::now();

    for stored in materials {
        let m = &stored.material;
        let result = match plan(stored, now) {
            Plan::Inline => match store.get(&stored.storage_path).await {
                Ok(bytes) => {
                    ctx.add_inline(&m.file_name, &m.tags, &String::from_utf8_lossy(&bytes));
                    if m.ai_status != AiFileStatus::Inline {
                        set_status(db, user_id, &m.id, AiFileStatus::Inline);
                    }
                    Ok(())
                }
                Err(e) => Err(e.to_string()),
            },
            Plan::Reuse(part) => {
                ctx.add_file(&m.file_name, &m.tags, part);
                Ok(())
            }
            Plan::Upload => upload(db, store, model, user_id, stored)
                .await
                .map(|part| ctx.add_file(&m.file_name, &m.tags, part)),
        };

        if let Err(e) = result {
            tracing::warn!(material_id = %m.id, file = %m.file_name, "material ingestion failed: {e}");
            set_status(db, user_id, &m.id, AiFileStatus::Failed);
            ctx.add_failed(&m.file_name);
        }
    }

    ctx
}

async fn upload(
    db: &Db,
    store: &ObjectStore,
    model: &dyn GenerativeModel,
    user_id: &str,
    stored: &StoredMaterial,
) -> Result<Part, String> {
    let m = &stored.material;
    let bytes = store
        .get(&stored.storage_path)
        .await
        .map_err(|e| e.to_string())?;
    let remote = model
        .upload_file(FileUpload {
            display_name: m.file_name.clone(),
            mime_type: m.mime_type.clone(),
            bytes,
        })
        .await
        .map_err(|e| e.to_string())?;

    let expires_at = remote.expires_at.map(|t| t.to_rfc3339());
    let conn = db.conn();
    sq_execute(
        &conn,
        db::materials::set_remote_file(
            user_id,
            &m.id,
            &remote.name,
            &remote.uri,
            expires_at.as_deref(),
        ),
    )
    .map_err(|e| e.to_string())?;
    tracing::info!(material_id = %m.id, remote = %remote.name, "material uploaded to model provider");
    Ok(remote.as_part())
}

fn set_status(db: &Db, user_id: &str, material_id: &str, status: AiFileStatus) {
    let conn = db.conn();
    if let Err(e) = sq_execute(&conn, db::materials::set_ai_status(user_id, material_id, status)) {
        tracing::error!("set ai_status {status} on {material_id}: {e}");
    }
}
