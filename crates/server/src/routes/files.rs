use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
};
use serde::Deserialize;

use crate::error::ApiErr;
use crate::objects::{self, ObjectStore};
use crate::routes::auth::now_unix;

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: u64,
    pub signature: String,
}

/// GET /api/files/{*path}?expires=&signature=: serve stored bytes.
///
/// No bearer token: the signature is the credential.
pub async fn download(
    State(store): State<ObjectStore>,
    Path(path): Path<String>,
    Query(q): Query<SignedQuery>,
) -> Result<impl IntoResponse, ApiErr> {
    store.verify(&path, q.expires, &q.signature, now_unix())?;

    let bytes = store.get(&path).await.map_err(|e| {
        tracing::debug!("signed file fetch failed: {e:#}");
        ApiErr::not_found("file not found")
    })?;
    let file_name = path.rsplit('/').next().unwrap_or(&path);
    let mime = objects::guess_mime(file_name);
    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{file_name}\""),
            ),
        ],
        bytes,
    ))
}
