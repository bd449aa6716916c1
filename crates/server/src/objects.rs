//! Material bytes on local disk, reachable from outside only through
//! expiring HMAC-signed URLs (`/api/files/{path}?expires=&signature=`).

use anyhow::{Context, Result, bail};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use studyhall_api::ServiceError;
use studyhall_api::crypto;

#[derive(Clone)]
pub struct ObjectStore {
    root: PathBuf,
    secret: Arc<str>,
    base_url: Arc<str>,
    ttl_secs: u64,
}

/// A signed download link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    pub url: String,
    pub expires_unix: u64,
}

impl ObjectStore {
    pub fn new(root: PathBuf, secret: &str, base_url: &str, ttl_secs: u64) -> Self {
        Self {
            root,
            secret: Arc::from(secret),
            base_url: Arc::from(base_url.trim_end_matches('/')),
            ttl_secs,
        }
    }

    /// Storage key for a material: `{user}/{course}/{material}/{file}`.
    pub fn material_path(user_id: &str, course_id: &str, material_id: &str, file_name: &str) -> String {
        format!(
            "{user_id}/{course_id}/{material_id}/{}",
            sanitize_file_name(file_name)
        )
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if path.is_empty()
            || !rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            bail!("invalid object path: {path}");
        }
        Ok(self.root.join(rel))
    }

    pub async fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .with_context(|| format!("writing object {path}"))
    }

    pub async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full)
            .await
            .with_context(|| format!("reading object {path}"))
    }

    /// Remove an object and its now-empty material directory. Missing
    /// objects are not an error.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("deleting object {path}")),
        }
        if let Some(parent) = full.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }

    pub fn signed_url(&self, path: &str, now_unix: u64) -> SignedUrl {
        let expires_unix = now_unix.saturating_add(self.ttl_secs);
        let signature = crypto::sign_storage_path(path, expires_unix, &self.secret);
        let encoded: Vec<String> = path
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect();
        SignedUrl {
            url: format!(
                "{}/api/files/{}?expires={expires_unix}&signature={signature}",
                self.base_url,
                encoded.join("/")
            ),
            expires_unix,
        }
    }

    pub fn verify(
        &self,
        path: &str,
        expires_unix: u64,
        signature: &str,
        now_unix: u64,
    ) -> Result<(), ServiceError> {
        crypto::verify_storage_signature(path, expires_unix, signature, &self.secret, now_unix)
    }
}

/// Keep file names filesystem- and URL-safe.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(100)
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// Best-effort MIME type from a file extension.
pub fn guess_mime(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> ObjectStore {
        ObjectStore::new(dir.to_path_buf(), "secret", "http://localhost:3000/", 60)
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let path = ObjectStore::material_path("u1", "c1", "m1", "My Notes.md");
        assert_eq!(path, "u1/c1/m1/My_Notes.md");

        store.put(&path, b"hello").await.unwrap();
        assert_eq!(store.get(&path).await.unwrap(), b"hello");
        store.delete(&path).await.unwrap();
        assert!(store.get(&path).await.is_err());
        // Deleting twice is fine.
        store.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn traversal_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
        assert!(store.put("", b"x").await.is_err());
    }

    #[test]
    fn signed_url_verifies_until_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let signed = store.signed_url("u1/c1/m1/a.pdf", 1_000);
        assert_eq!(signed.expires_unix, 1_060);
        assert!(signed.url.starts_with("http://localhost:3000/api/files/u1/c1/m1/a.pdf?expires=1060&signature="));

        let signature = signed.url.rsplit_once("signature=").unwrap().1;
        assert!(store.verify("u1/c1/m1/a.pdf", 1_060, signature, 1_030).is_ok());
        assert!(store.verify("u1/c1/m1/a.pdf", 1_060, signature, 1_061).is_err());
        assert!(store.verify("u1/c1/m1/b.pdf", 1_060, signature, 1_030).is_err());
        assert!(store.verify("u1/c1/m1/a.pdf", 2_000, signature, 1_030).is_err());
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("../../evil.sh"), "evil.sh");
        assert_eq!(sanitize_file_name("..."), "file");
        assert_eq!(sanitize_file_name("résumé (1).pdf"), "r_sum___1_.pdf");
        assert_eq!(guess_mime("Lecture.PDF"), "application/pdf");
        assert_eq!(guess_mime("noext"), "application/octet-stream");
    }
}
