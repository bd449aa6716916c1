//! Shared API types, crypto, and SQL builders for studyhall.
//!
//! This crate is the **single source of truth** for all API request/response
//! types. The server, the typed client and the CLI all depend on it; only the
//! server enables the `backend` feature (crypto, SQL builders, validation).

use serde::{Deserialize, Serialize};

#[cfg(feature = "backend")]
pub mod crypto;
#[cfg(feature = "backend")]
pub mod db;
#[cfg(feature = "backend")]
pub mod service;

// ─── Shared Enums ────────────────────────────────────────────────────────────

/// Flashcard difficulty.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
        }
    }

    /// Case-insensitive parse; `None` for anything unknown.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "easy" => Some(Self::Easy),
            "medium" => Some(Self::Medium),
            "hard" => Some(Self::Hard),
            _ => None,
        }
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of study activity a lesson is centred on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LessonType {
    #[default]
    Chat,
    Quiz,
    Flashcards,
}

impl LessonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Quiz => "quiz",
            Self::Flashcards => "flashcards",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Self::Chat),
            "quiz" => Some(Self::Quiz),
            "flashcards" => Some(Self::Flashcards),
            _ => None,
        }
    }
}

impl std::fmt::Display for LessonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author of a lesson message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// State of a material's copy in the AI vendor's file storage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AiFileStatus {
    /// Never sent to the model yet.
    #[default]
    Pending,
    /// Small text file; inlined into the prompt instead of uploaded.
    Inline,
    /// Uploaded; `ai_file_uri` is usable until `ai_file_expires_at`.
    Ready,
    /// Last ingestion attempt failed.
    Failed,
}

impl AiFileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Inline => "inline",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "inline" => Some(Self::Inline),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for AiFileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a generated quiz question.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    MultipleChoice,
    TrueFalse,
}

// ─── Utilities ───────────────────────────────────────────────────────────────

/// Safely convert `u64` to `i64`, saturating at `i64::MAX` instead of wrapping.
pub fn saturating_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

// ─── Health / capabilities ───────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Runtime feature availability, returned by `GET /api/capabilities`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    pub auth_enabled: bool,
    pub ai_enabled: bool,
    pub max_upload_bytes: u64,
}

// ─── Auth ────────────────────────────────────────────────────────────────────

/// Email + password registration.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthRegisterRequest {
    pub email: String,
    pub password: String,
    pub nickname: String,
}

/// Email + password login.
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Returned on successful login / register / refresh.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthTokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    pub user_id: String,
    pub nickname: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: String,
}

/// Profile returned by `GET /api/auth/me`.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserProfileResponse {
    pub user_id: String,
    pub nickname: String,
    pub email: String,
    pub created_at: String,
}

/// Freshly issued API key. Shown once; only its hash is stored.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiKeyResponse {
    pub api_key: String,
}

/// Generic success response for operations that don't return data.
#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

// ─── Courses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub material_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateCourseRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateCourseRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListCoursesResponse {
    pub courses: Vec<Course>,
}

// ─── Materials ───────────────────────────────────────────────────────────────

/// An uploaded study document. Storage paths and vendor file names stay
/// server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Material {
    pub id: String,
    pub course_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ai_status: AiFileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_file_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_file_expires_at: Option<String>,
    pub created_at: String,
}

/// Replace a material's topic tags.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateMaterialRequest {
    pub tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MaterialListQuery {
    pub topic: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListMaterialsResponse {
    pub materials: Vec<Material>,
}

/// Expiring download link for a material's bytes.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignedUrlResponse {
    pub url: String,
    pub expires_at: String,
}

// ─── Topics ──────────────────────────────────────────────────────────────────

/// A topic derived from material tags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicSummary {
    pub name: String,
    pub material_count: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTopicsResponse {
    pub topics: Vec<TopicSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RenameTopicRequest {
    pub name: String,
}

// ─── Quizzes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuizQuestion {
    pub kind: QuestionKind,
    pub prompt: String,
    pub options: Vec<String>,
    pub answer_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// A generated quiz widget attached to an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quiz {
    pub id: String,
    pub title: String,
    pub questions: Vec<QuizQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionResult {
    pub index: usize,
    pub correct: bool,
    pub expected: usize,
    pub given: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuizGrade {
    pub correct: usize,
    pub total: usize,
    pub results: Vec<QuestionResult>,
}

impl Quiz {
    /// Grade positional answers. Missing answers count as wrong; answers past
    /// the last question are ignored.
    pub fn grade(&self, answers: &[Option<usize>]) -> QuizGrade {
        let results: Vec<QuestionResult> = self
            .questions
            .iter()
            .enumerate()
            .map(|(index, question)| {
                let given = answers.get(index).copied().flatten();
                QuestionResult {
                    index,
                    correct: given == Some(question.answer_index),
                    expected: question.answer_index,
                    given,
                }
            })
            .collect();
        QuizGrade {
            correct: results.iter().filter(|r| r.correct).count(),
            total: results.len(),
            results,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QuizRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_count: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GradeQuizRequest {
    pub answers: Vec<Option<usize>>,
}

// ─── Lessons ─────────────────────────────────────────────────────────────────

/// One entry of a lesson's ordered message log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LessonMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiz: Option<Quiz>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    pub course_id: String,
    pub title: String,
    pub lesson_type: LessonType,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub messages: Vec<LessonMessage>,
    pub created_at: String,
    pub updated_at: String,
}

impl Lesson {
    pub fn find_quiz(&self, quiz_id: &str) -> Option<&Quiz> {
        self.messages
            .iter()
            .filter_map(|m| m.quiz.as_ref())
            .find(|q| q.id == quiz_id)
    }
}

/// Lesson listing entry (message log omitted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonSummary {
    pub id: String,
    pub course_id: String,
    pub title: String,
    pub lesson_type: LessonType,
    #[serde(default)]
    pub topics: Vec<String>,
    pub message_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateLessonRequest {
    pub course_id: String,
    pub title: String,
    #[serde(default)]
    pub lesson_type: LessonType,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateLessonRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LessonListQuery {
    pub course_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListLessonsResponse {
    pub lessons: Vec<LessonSummary>,
}

// ─── Chat ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Respond with a `text/event-stream` instead of a JSON body.
    #[serde(default)]
    pub stream: bool,
}

/// Result of one tutor turn.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub lesson_id: String,
    pub message: LessonMessage,
    /// Materials that could not be attached to the model context.
    #[serde(default)]
    pub failed_materials: Vec<String>,
}

// ─── Flashcards ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flashcard {
    pub id: String,
    pub course_id: Option<String>,
    pub concept: String,
    pub definition: String,
    pub topic: Option<String>,
    pub difficulty: Difficulty,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateFlashcardRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    pub concept: String,
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub difficulty: Difficulty,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateFlashcardRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FlashcardListQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListFlashcardsResponse {
    pub flashcards: Vec<Flashcard>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateFlashcardsRequest {
    pub course_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StudyQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StudyDeckResponse {
    pub cards: Vec<Flashcard>,
}

// ─── Service Error ───────────────────────────────────────────────────────────

/// Framework-agnostic service error. Route adapters convert it into their
/// own response type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    PayloadTooLarge(String),
    Internal(String),
}

impl ServiceError {
    /// HTTP status code as a `u16`.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::PayloadTooLarge(_) => 413,
            Self::Internal(_) => 500,
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest(m)
            | Self::Unauthorized(m)
            | Self::Forbidden(m)
            | Self::NotFound(m)
            | Self::Conflict(m)
            | Self::PayloadTooLarge(m)
            | Self::Internal(m) => m,
        }
    }

    /// Build a closure that wraps a DB/IO error into `Internal`.
    pub fn from_db<E: std::fmt::Display>(context: &str) -> impl FnOnce(E) -> Self + '_ {
        move |e| Self::Internal(format!("{context}: {e}"))
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ServiceError {}

/// JSON error shape `{ "error": "..." }` returned by all error responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}

impl From<&ServiceError> for ApiError {
    fn from(e: &ServiceError) -> Self {
        Self {
            error: e.message().to_string(),
        }
    }
}
