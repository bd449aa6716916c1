//! Shared business logic: framework-agnostic pure functions.
//!
//! Route handlers stay thin adapters: they validate through these helpers,
//! run the query builders from [`crate::db`], and shape the response.

use std::collections::BTreeMap;

use crate::{AuthTokenResponse, Material, ServiceError, TopicSummary};

/// Maximum number of topic tags on one material.
pub const MAX_TAGS: usize = 20;
/// Maximum length (in characters) of one topic tag.
pub const MAX_TAG_LEN: usize = 64;

// ─── Validation ─────────────────────────────────────────────────────────────

/// Validate and normalize an email address. Returns the lowercased, trimmed email.
pub fn validate_email(email: &str) -> Result<String, ServiceError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') || email.len() > 254 {
        return Err(ServiceError::BadRequest("invalid email address".into()));
    }
    Ok(email)
}

/// Validate a password (8-128 characters).
pub fn validate_password(password: &str) -> Result<(), ServiceError> {
    let len = password.chars().count();
    if len < 8 {
        return Err(ServiceError::BadRequest(
            "password must be at least 8 characters".into(),
        ));
    }
    if len > 128 {
        return Err(ServiceError::BadRequest(
            "password must be at most 128 characters".into(),
        ));
    }
    Ok(())
}

/// Validate and normalize a user nickname. Returns the trimmed nickname.
pub fn validate_nickname(nickname: &str) -> Result<String, ServiceError> {
    bounded_text(nickname, 64, "nickname must be 1-64 characters")
}

pub fn validate_course_name(name: &str) -> Result<String, ServiceError> {
    bounded_text(name, 120, "course name must be 1-120 characters")
}

/// Lesson titles.
pub fn validate_title(title: &str) -> Result<String, ServiceError> {
    bounded_text(title, 200, "title must be 1-200 characters")
}

/// Validate a flashcard's text fields. Returns the trimmed `(concept, definition)`.
pub fn validate_flashcard(concept: &str, definition: &str) -> Result<(String, String), ServiceError> {
    let concept = bounded_text(concept, 200, "concept must be 1-200 characters")?;
    let definition = bounded_text(definition, 2000, "definition must be 1-2000 characters")?;
    Ok((concept, definition))
}

fn bounded_text(value: &str, max_chars: usize, message: &str) -> Result<String, ServiceError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.chars().count() > max_chars {
        return Err(ServiceError::BadRequest(message.into()));
    }
    Ok(trimmed.to_string())
}

// ─── Topics ─────────────────────────────────────────────────────────────────

/// Normalize a single tag: trim and collapse inner whitespace.
pub fn normalize_tag(tag: &str) -> String {
    tag.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Comparison key for tags: full Unicode lowercase, so `Énergie` and
/// `ÉNERGIE` are the same topic.
pub fn tag_key(tag: &str) -> String {
    normalize_tag(tag).to_lowercase()
}

fn validate_tag(tag: &str) -> Result<(), ServiceError> {
    if tag.chars().count() > MAX_TAG_LEN {
        return Err(ServiceError::BadRequest(format!(
            "tag must be at most {MAX_TAG_LEN} characters"
        )));
    }
    Ok(())
}

/// Normalize a tag list. Empty tags are dropped; duplicates (ignoring case)
/// keep their first spelling.
pub fn normalize_tags<S: AsRef<str>>(tags: &[S]) -> Result<Vec<String>, ServiceError> {
    let mut out: Vec<String> = Vec::new();
    for raw in tags {
        let tag = normalize_tag(raw.as_ref());
        if tag.is_empty() {
            continue;
        }
        validate_tag(&tag)?;
        let key = tag_key(&tag);
        if out.iter().any(|t| tag_key(t) == key) {
            continue;
        }
        out.push(tag);
    }
    if out.len() > MAX_TAGS {
        return Err(ServiceError::BadRequest(format!(
            "at most {MAX_TAGS} tags per material"
        )));
    }
    Ok(out)
}

/// Topics are not stored: they are the distinct tags across materials.
/// Grouping ignores case; the first spelling seen is reported.
pub fn derive_topics(materials: &[Material]) -> Vec<TopicSummary> {
    let mut groups: BTreeMap<String, TopicSummary> = BTreeMap::new();
    for material in materials {
        let mut seen_here: Vec<String> = Vec::new();
        for tag in &material.tags {
            let key = tag_key(tag);
            if seen_here.contains(&key) {
                continue;
            }
            seen_here.push(key.clone());
            groups
                .entry(key)
                .or_insert_with(|| TopicSummary {
                    name: tag.clone(),
                    material_count: 0,
                })
                .material_count += 1;
        }
    }
    groups.into_values().collect()
}

/// An empty selection matches every material.
pub fn material_matches_topics<S: AsRef<str>>(material: &Material, selected: &[S]) -> bool {
    if selected.is_empty() {
        return true;
    }
    let tags: Vec<String> = material.tags.iter().map(|t| tag_key(t)).collect();
    selected
        .iter()
        .any(|topic| tags.contains(&tag_key(topic.as_ref())))
}

/// Validate the target name of a topic rename.
pub fn validate_topic_name(name: &str) -> Result<String, ServiceError> {
    let name = normalize_tag(name);
    if name.is_empty() {
        return Err(ServiceError::BadRequest("topic name is required".into()));
    }
    validate_tag(&name)?;
    Ok(name)
}

/// Rename `from` to `to` inside a tag list (case-insensitive match on
/// `from`). `Ok(None)` when the list does not contain `from`.
pub fn rename_tag(
    tags: &[String],
    from: &str,
    to: &str,
) -> Result<Option<Vec<String>>, ServiceError> {
    let to = validate_topic_name(to)?;
    let from = tag_key(from);
    if !tags.iter().any(|t| tag_key(t) == from) {
        return Ok(None);
    }
    let replaced: Vec<String> = tags
        .iter()
        .map(|t| {
            if tag_key(t) == from {
                to.clone()
            } else {
                t.clone()
            }
        })
        .collect();
    // Renaming onto an existing tag merges the two.
    normalize_tags(&replaced).map(Some)
}

/// Remove `name` from a tag list. Returns `None` when nothing was removed.
pub fn remove_tag(tags: &[String], name: &str) -> Option<Vec<String>> {
    let name = tag_key(name);
    let kept: Vec<String> = tags
        .iter()
        .filter(|t| tag_key(t) != name)
        .cloned()
        .collect();
    (kept.len() != tags.len()).then_some(kept)
}

// ─── API Key Generation ─────────────────────────────────────────────────────

/// Prefix that distinguishes API keys from JWTs in the `Authorization` header.
pub const API_KEY_PREFIX: &str = "shk_";

/// Generate a new API key with the `shk_` prefix.
pub fn generate_api_key() -> String {
    format!("{API_KEY_PREFIX}{}", uuid::Uuid::new_v4().simple())
}

/// Hash an API key for persistent storage and lookup.
pub fn hash_api_key(api_key: &str) -> String {
    crate::crypto::hash_token(api_key)
}

// ─── Auth Token Resolution ──────────────────────────────────────────────────

/// Result of resolving an auth token string.
pub enum AuthToken {
    /// JWT was valid; carries the extracted user_id.
    Jwt(String),
    /// Token is an API key; the caller must look up its hash in the DB.
    ApiKey(String),
}

/// Resolve an auth token string into either a verified JWT user_id or an API key.
pub fn resolve_auth_token(
    token: &str,
    jwt_secret: &str,
    now: u64,
) -> Result<AuthToken, ServiceError> {
    if token.starts_with(API_KEY_PREFIX) {
        return Ok(AuthToken::ApiKey(token.to_string()));
    }

    if jwt_secret.is_empty() {
        return Err(ServiceError::Unauthorized(
            "JWT authentication not configured".into(),
        ));
    }

    let user_id = crate::crypto::verify_jwt(token, jwt_secret, now)?;
    Ok(AuthToken::Jwt(user_id))
}

// ─── Token Bundle ───────────────────────────────────────────────────────────

/// Everything needed to insert a refresh token row and answer the client.
pub struct TokenBundle {
    /// SHA-256 hash of the refresh token (stored in DB).
    pub token_hash: String,
    /// UUID primary key for the refresh_tokens row.
    pub token_id: String,
    /// `datetime` string for the refresh token expiry (DB column value).
    pub expires_at: String,
    /// Ready-to-return API response.
    pub response: AuthTokenResponse,
}

/// Build a [`TokenBundle`] containing a JWT, refresh token, and the auth response.
pub fn prepare_token_bundle(
    jwt_secret: &str,
    user_id: &str,
    nickname: &str,
    now_unix: u64,
) -> Result<TokenBundle, ServiceError> {
    use crate::crypto;

    let access_token = crypto::sign_jwt(user_id, jwt_secret, now_unix);
    let refresh_token = crypto::generate_token()?;
    let token_hash = crypto::hash_token(&refresh_token);
    let token_id = uuid::Uuid::new_v4().to_string();

    let base = chrono::DateTime::from_timestamp(now_unix as i64, 0)
        .ok_or_else(|| ServiceError::Internal("invalid timestamp".into()))?;
    let expires_at = base
        .checked_add_signed(chrono::Duration::seconds(
            crypto::REFRESH_EXPIRY_SECS as i64,
        ))
        .ok_or_else(|| ServiceError::Internal("timestamp overflow".into()))?
        .format("%Y-%m-%d %H:%M:%S")
        .to_string();

    Ok(TokenBundle {
        token_hash,
        token_id,
        expires_at,
        response: AuthTokenResponse {
            access_token,
            refresh_token,
            expires_in: crypto::JWT_EXPIRY_SECS,
            user_id: user_id.to_string(),
            nickname: nickname.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AiFileStatus;

    fn material(id: &str, tags: &[&str]) -> Material {
        Material {
            id: id.into(),
            course_id: "c1".into(),
            file_name: format!("{id}.pdf"),
            mime_type: "application/pdf".into(),
            size_bytes: 10,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ai_status: AiFileStatus::Pending,
            ai_file_uri: None,
            ai_file_expires_at: None,
            created_at: "2024-01-01 00:00:00".into(),
        }
    }

    #[test]
    fn test_validate_nickname() {
        assert!(validate_nickname("alice").is_ok());
        assert_eq!(validate_nickname("  bob  ").unwrap(), "bob");
        assert!(validate_nickname("").is_err());
        assert!(validate_nickname("   ").is_err());
        assert!(validate_nickname(&"x".repeat(65)).is_err());
        assert!(validate_nickname(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn test_validate_email_lowercases() {
        assert_eq!(validate_email(" Ann@Example.COM ").unwrap(), "ann@example.com");
        assert!(validate_email("no-at-sign").is_err());
    }

    #[test]
    fn normalize_tags_dedupes_ignoring_case() {
        let tags = normalize_tags(&["  Cell   Biology ", "cell biology", "", "Genetics"]).unwrap();
        assert_eq!(tags, vec!["Cell Biology".to_string(), "Genetics".to_string()]);
    }

    #[test]
    fn normalize_tags_rejects_overlong_and_too_many() {
        assert!(normalize_tags(&["x".repeat(MAX_TAG_LEN + 1)]).is_err());
        let many: Vec<String> = (0..=MAX_TAGS).map(|i| format!("t{i}")).collect();
        assert!(normalize_tags(&many).is_err());
    }

    #[test]
    fn derive_topics_groups_and_counts() {
        let materials = vec![
            material("a", &["Genetics", "Cells"]),
            material("b", &["genetics"]),
            material("c", &[]),
        ];
        let topics = derive_topics(&materials);
        assert_eq!(
            topics,
            vec![
                TopicSummary {
                    name: "Cells".into(),
                    material_count: 1
                },
                TopicSummary {
                    name: "Genetics".into(),
                    material_count: 2
                },
            ]
        );
    }

    #[test]
    fn empty_topic_selection_matches_everything() {
        let m = material("a", &["Genetics"]);
        assert!(material_matches_topics::<&str>(&m, &[]));
        assert!(material_matches_topics(&m, &["GENETICS"]));
        assert!(!material_matches_topics(&m, &["Cells"]));
    }

    #[test]
    fn rename_tag_merges_into_existing() {
        let tags = vec!["Cells".to_string(), "cell".to_string()];
        assert_eq!(
            rename_tag(&tags, "cell", "cells").unwrap(),
            Some(vec!["Cells".to_string()])
        );
        assert_eq!(rename_tag(&tags, "missing", "x").unwrap(), None);
    }

    #[test]
    fn rename_tag_rejects_overlong_target() {
        let tags = vec!["Cells".to_string()];
        let err = rename_tag(&tags, "Cells", &"x".repeat(MAX_TAG_LEN + 1)).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(rename_tag(&tags, "Cells", "  ").is_err());
    }

    #[test]
    fn non_ascii_tags_fold_the_same_everywhere() {
        let tags = normalize_tags(&["Énergie", "énergie", "Travail"]).unwrap();
        assert_eq!(tags, vec!["Énergie".to_string(), "Travail".to_string()]);

        let a = material("a", &["Énergie"]);
        let b = material("b", &["ÉNERGIE"]);
        let topics = derive_topics(&[a.clone(), b]);
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].material_count, 2);

        assert!(material_matches_topics(&a, &["énergie"]));
        assert_eq!(remove_tag(&["ÉNERGIE".to_string()], "Énergie"), Some(vec![]));
        assert_eq!(
            rename_tag(&["énergie".to_string()], "ÉNERGIE", "Power").unwrap(),
            Some(vec!["Power".to_string()])
        );
    }

    #[test]
    fn remove_tag_reports_noop() {
        let tags = vec!["Cells".to_string(), "Genetics".to_string()];
        assert_eq!(remove_tag(&tags, "cells"), Some(vec!["Genetics".to_string()]));
        assert_eq!(remove_tag(&tags, "Physics"), None);
    }

    #[test]
    fn api_keys_resolve_without_jwt_secret() {
        let key = generate_api_key();
        assert!(matches!(
            resolve_auth_token(&key, "", 0),
            Ok(AuthToken::ApiKey(_))
        ));
        assert!(resolve_auth_token("not-a-jwt", "", 0).is_err());
    }

    #[test]
    fn token_bundle_refresh_expiry_is_seven_days_out() {
        let bundle = prepare_token_bundle("secret", "u1", "ann", 0).unwrap();
        assert_eq!(bundle.expires_at, "1970-01-08 00:00:00");
        assert_eq!(bundle.response.user_id, "u1");
        assert_eq!(bundle.token_hash, crate::crypto::hash_token(&bundle.response.refresh_token));
    }
}
