use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Serialize;

use studyhall_api::*;

use crate::retry::{RetryConfig, retry_post};

/// Called with the number of file bytes handed to the transport so far.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Upload bodies are streamed in chunks of this size so progress can be
/// reported while the request is in flight.
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Typed HTTP client for the studyhall API.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    retry: RetryConfig,
}

impl ApiClient {
    /// Create a new client with the given base URL and timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create from an existing `reqwest::Client`.
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn set_auth(&mut self, token: String) {
        self.auth_token = Some(token);
    }

    pub fn set_retry(&mut self, retry: RetryConfig) {
        self.retry = retry;
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    fn token_or_bail(&self) -> Result<&str> {
        self.auth_token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("not logged in (run `studyhall login`)"))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let token = self.token_or_bail()?;
        let resp = self
            .client
            .get(self.url(path))
            .query(query)
            .bearer_auth(token)
            .send()
            .await?;
        parse_response(resp).await
    }

    async fn post_json<B: Serialize + ?Sized, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let token = self.token_or_bail()?;
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        parse_response(resp).await
    }

    async fn delete_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let token = self.token_or_bail()?;
        let resp = self
            .client
            .delete(self.url(path))
            .bearer_auth(token)
            .send()
            .await?;
        parse_response(resp).await
    }

    // ── Health ────────────────────────────────────────────────────────────

    pub async fn health(&self) -> Result<HealthResponse> {
        let resp = self.client.get(self.url("/health")).send().await?;
        parse_response(resp).await
    }

    pub async fn capabilities(&self) -> Result<CapabilitiesResponse> {
        let resp = self.client.get(self.url("/capabilities")).send().await?;
        parse_response(resp).await
    }

    // ── Auth ──────────────────────────────────────────────────────────────

    pub async fn login(&self, req: &LoginRequest) -> Result<AuthTokenResponse> {
        let resp = retry_post(&self.client, &self.url("/auth/login"), None, req, &self.retry).await?;
        parse_response(resp).await
    }

    pub async fn register(&self, req: &AuthRegisterRequest) -> Result<AuthTokenResponse> {
        let resp = self
            .client
            .post(self.url("/auth/register"))
            .json(req)
            .send()
            .await?;
        parse_response(resp).await
    }

    pub async fn refresh(&self, req: &RefreshRequest) -> Result<AuthTokenResponse> {
        let resp = self
            .client
            .post(self.url("/auth/refresh"))
            .json(req)
            .send()
            .await?;
        parse_response(resp).await
    }

    pub async fn me(&self) -> Result<UserProfileResponse> {
        self.get_json("/auth/me", &[]).await
    }

    // ── Courses ───────────────────────────────────────────────────────────

    pub async fn list_courses(&self) -> Result<ListCoursesResponse> {
        self.get_json("/courses", &[]).await
    }

    pub async fn create_course(&self, req: &CreateCourseRequest) -> Result<Course> {
        self.post_json("/courses", req).await
    }

    pub async fn delete_course(&self, course_id: &str) -> Result<OkResponse> {
        self.delete_json(&format!("/courses/{course_id}")).await
    }

    // ── Materials / topics ────────────────────────────────────────────────

    pub async fn list_materials(
        &self,
        course_id: &str,
        topic: Option<&str>,
    ) -> Result<ListMaterialsResponse> {
        let query: Vec<(&str, String)> = topic.map(|t| ("topic", t.to_string())).into_iter().collect();
        self.get_json(&format!("/courses/{course_id}/materials"), &query)
            .await
    }

    /// Multipart upload of one file. `progress` sees the cumulative number
    /// of bytes handed to the connection.
    pub async fn upload_material(
        &self,
        course_id: &str,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
        tags: &[String],
        progress: ProgressFn,
    ) -> Result<Material> {
        let token = self.token_or_bail()?;
        let total = bytes.len() as u64;
        let chunks: Vec<Vec<u8>> = bytes
            .chunks(UPLOAD_CHUNK_BYTES)
            .map(<[u8]>::to_vec)
            .collect();
        let mut sent = 0u64;
        let body = futures::stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len() as u64;
            progress(sent);
            Ok::<_, std::io::Error>(chunk)
        }));

        let file = reqwest::multipart::Part::stream_with_length(reqwest::Body::wrap_stream(body), total)
            .file_name(file_name.to_string())
            .mime_str(mime_type)?;
        let mut form = reqwest::multipart::Form::new().part("file", file);
        for tag in tags {
            form = form.text("tag", tag.clone());
        }

        let resp = self
            .client
            .post(self.url(&format!("/courses/{course_id}/materials")))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        parse_response(resp).await
    }

    pub async fn list_topics(&self, course_id: Option<&str>) -> Result<ListTopicsResponse> {
        match course_id {
            Some(id) => self.get_json(&format!("/courses/{id}/topics"), &[]).await,
            None => self.get_json("/topics", &[]).await,
        }
    }

    // ── Lessons / tutor ───────────────────────────────────────────────────

    pub async fn create_lesson(&self, req: &CreateLessonRequest) -> Result<Lesson> {
        self.post_json("/lessons", req).await
    }

    pub async fn list_lessons(&self, course_id: Option<&str>) -> Result<ListLessonsResponse> {
        let query: Vec<(&str, String)> = course_id
            .map(|c| ("course_id", c.to_string()))
            .into_iter()
            .collect();
        self.get_json("/lessons", &query).await
    }

    pub async fn get_lesson(&self, lesson_id: &str) -> Result<Lesson> {
        self.get_json(&format!("/lessons/{lesson_id}"), &[]).await
    }

    /// One non-streaming tutor turn.
    pub async fn chat(&self, lesson_id: &str, message: &str) -> Result<ChatResponse> {
        self.post_json(
            &format!("/lessons/{lesson_id}/chat"),
            &ChatRequest {
                message: message.to_string(),
                stream: false,
            },
        )
        .await
    }

    pub async fn quiz(&self, lesson_id: &str, req: &QuizRequest) -> Result<ChatResponse> {
        self.post_json(&format!("/lessons/{lesson_id}/quiz"), req)
            .await
    }

    pub async fn grade_quiz(
        &self,
        lesson_id: &str,
        quiz_id: &str,
        req: &GradeQuizRequest,
    ) -> Result<QuizGrade> {
        self.post_json(&format!("/lessons/{lesson_id}/quiz/{quiz_id}/grade"), req)
            .await
    }

    // ── Flashcards ────────────────────────────────────────────────────────

    pub async fn create_flashcard(&self, req: &CreateFlashcardRequest) -> Result<Flashcard> {
        self.post_json("/flashcards", req).await
    }

    pub async fn generate_flashcards(
        &self,
        req: &GenerateFlashcardsRequest,
    ) -> Result<ListFlashcardsResponse> {
        self.post_json("/flashcards/generate", req).await
    }

    pub async fn study_deck(&self, query: &StudyQuery) -> Result<StudyDeckResponse> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(course_id) = &query.course_id {
            params.push(("course_id", course_id.clone()));
        }
        if let Some(topic) = &query.topic {
            params.push(("topic", topic.clone()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        self.get_json("/flashcards/study", &params).await
    }
}

/// Return the deserialized body on 2xx, otherwise an error carrying the
/// server's `{"error"}` message (or the raw body when it is not JSON).
async fn parse_response<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("{status}: {}", error_message(&body));
    }
    Ok(resp.json().await?)
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ApiError>(body)
        .map(|e| e.error)
        .unwrap_or_else(|_| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_server_error_field() {
        assert_eq!(error_message(r#"{"error":"course not found"}"#), "course not found");
        assert_eq!(error_message("  Bad Gateway \n"), "Bad Gateway");
    }

    #[test]
    fn base_url_is_normalized() {
        let client = ApiClient::with_client(reqwest::Client::new(), "http://localhost:3000/");
        assert_eq!(client.url("/courses"), "http://localhost:3000/api/courses");
        assert!(client.auth_token().is_none());
    }
}
