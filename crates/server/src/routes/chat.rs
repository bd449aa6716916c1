use std::convert::Infallible;

use axum::{
    Json,
    extract::{Path, State},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use studyhall_api::{
    ApiError, ChatRequest, ChatResponse, GradeQuizRequest, LessonMessage, MessageRole, QuizGrade,
    QuizRequest, db,
};
use studyhall_tutor::{
    GenerateRequest, GenerativeModel, ModelReply, ToolMode, TutorError, prompt,
    tools::{self, CREATE_QUIZ},
};

use crate::error::ApiErr;
use crate::objects::ObjectStore;
use crate::routes::auth::AuthUser;
use crate::routes::lessons::load_lesson;
use crate::storage::{Db, sq_execute};
use crate::tutor::TutorState;

pub const MAX_MESSAGE_CHARS: usize = 8000;
const DEFAULT_QUIZ_QUESTIONS: u32 = 5;

fn validate_message(message: &str) -> Result<String, ApiErr> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err(ApiErr::bad_request("message is required"));
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiErr::bad_request(format!(
            "message must be at most {MAX_MESSAGE_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn new_message(role: MessageRole, content: String) -> LessonMessage {
    LessonMessage {
        id: Uuid::new_v4().to_string(),
        role,
        content,
        quiz: None,
        created_at: chrono::Utc::now().to_rfc3339(),
    }
}

/// Turn a model reply into the stored assistant message. A `create_quiz`
/// call becomes a quiz widget; an unusable one falls back to the text.
fn assistant_message(reply: &ModelReply) -> Result<LessonMessage, ApiErr> {
    let text = reply.text.trim().to_string();
    if let Some(call) = reply.find_call(CREATE_QUIZ) {
        match tools::parse_quiz(call) {
            Ok(quiz) => {
                let content = if text.is_empty() {
                    format!("Here is a quiz: {}", quiz.title)
                } else {
                    text
                };
                let mut message = new_message(MessageRole::Assistant, content);
                message.quiz = Some(quiz);
                return Ok(message);
            }
            Err(e) if !text.is_empty() => {
                tracing::warn!("ignoring quiz tool call: {e}");
            }
            Err(e) => return Err(e.into()),
        }
    }
    if text.is_empty() {
        return Err(TutorError::InvalidResponse("model returned an empty reply".into()).into());
    }
    Ok(new_message(MessageRole::Assistant, text))
}

/// Append messages to the stored log. Read and write happen under one
/// connection lock so concurrent turns cannot drop each other's messages.
fn persist_messages(
    db: &Db,
    user_id: &str,
    lesson_id: &str,
    new: &[LessonMessage],
) -> Result<(), ApiErr> {
    let conn = db.conn();
    let mut lesson = load_lesson(&conn, user_id, lesson_id)?;
    lesson.messages.extend_from_slice(new);
    let json =
        serde_json::to_string(&lesson.messages).map_err(ApiErr::from_db("encode messages"))?;
    sq_execute(&conn, db::lessons::update_messages(user_id, lesson_id, &json))
        .map_err(ApiErr::from_db("store messages"))?;
    Ok(())
}

struct Turn {
    user_id: String,
    lesson_id: String,
    user_message: String,
    failed_materials: Vec<String>,
}

impl Turn {
    /// Persist both sides of the turn and bring the cached session along.
    fn finish(
        self,
        db: &Db,
        tutor: &TutorState,
        user_visible: LessonMessage,
        reply: &ModelReply,
    ) -> Result<ChatResponse, ApiErr> {
        let assistant = assistant_message(reply)?;
        persist_messages(
            db,
            &self.user_id,
            &self.lesson_id,
            &[user_visible, assistant.clone()],
        )?;
        tutor.record_turn(&self.lesson_id, &self.user_message, &assistant);
        Ok(ChatResponse {
            lesson_id: self.lesson_id,
            message: assistant,
            failed_materials: self.failed_materials,
        })
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// POST /api/lessons/{id}/chat: one tutor turn, JSON or SSE.
pub async fn chat(
    State(db): State<Db>,
    State(store): State<ObjectStore>,
    State(tutor): State<TutorState>,
    user: AuthUser,
    Path(lesson_id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiErr> {
    let message = validate_message(&req.message)?;
    let model = tutor.model()?;
    let lesson = load_lesson(&db.conn(), &user.user_id, &lesson_id)?;
    let session = tutor.open_session(&db, &store, &user.user_id, &lesson).await?;
    let request = session.request(&message, vec![tools::quiz_tool()], ToolMode::Auto);

    let turn = Turn {
        user_id: user.user_id,
        lesson_id,
        user_message: message.clone(),
        failed_materials: session.failed_materials,
    };
    let user_visible = new_message(MessageRole::User, message);

    if !req.stream {
        let reply = model.generate(&request).await?;
        let response = turn.finish(&db, &tutor, user_visible, &reply)?;
        return Ok(Json(response).into_response());
    }

    let (tx, rx) = mpsc::channel::<Event>(32);
    tokio::spawn(async move {
        let outcome = match stream_reply(model.as_ref(), &request, &tx).await {
            Ok(reply) => turn.finish(&db, &tutor, user_visible, &reply),
            Err(e) => Err(e),
        };
        let last = match outcome {
            Ok(response) => json_event("message", &response),
            Err(e) => json_event(
                "error",
                &ApiError {
                    error: e.message().to_string(),
                },
            ),
        };
        // The client may already be gone; the turn is stored either way.
        let _ = tx.send(last).await;
    });

    let events = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

#[derive(Serialize)]
struct Delta<'a> {
    text: &'a str,
}

fn json_event<T: Serialize>(name: &str, data: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(data)
        .unwrap_or_else(|e| {
            tracing::error!("encode {name} event: {e}");
            Event::default()
                .event("error")
                .data(r#"{"error":"internal server error"}"#)
        })
}

/// Forward text chunks as `delta` events and return the merged reply.
async fn stream_reply(
    model: &dyn GenerativeModel,
    request: &GenerateRequest,
    tx: &mpsc::Sender<Event>,
) -> Result<ModelReply, ApiErr> {
    let mut chunks = model.generate_stream(request).await?;
    let mut reply = ModelReply::default();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if !chunk.text.is_empty() {
            let _ = tx
                .send(json_event("delta", &Delta { text: &chunk.text }))
                .await;
        }
        reply.merge(chunk);
    }
    Ok(reply)
}

// ---------------------------------------------------------------------------
// Quiz
// ---------------------------------------------------------------------------

/// POST /api/lessons/{id}/quiz: ask the tutor for a quiz right away.
pub async fn quiz(
    State(db): State<Db>,
    State(store): State<ObjectStore>,
    State(tutor): State<TutorState>,
    user: AuthUser,
    Path(lesson_id): Path<String>,
    Json(req): Json<QuizRequest>,
) -> Result<Json<ChatResponse>, ApiErr> {
    let count = req
        .question_count
        .unwrap_or(DEFAULT_QUIZ_QUESTIONS)
        .clamp(1, tools::MAX_QUESTIONS as u32);
    let topic = req
        .topic
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let model = tutor.model()?;
    let lesson = load_lesson(&db.conn(), &user.user_id, &lesson_id)?;
    let session = tutor.open_session(&db, &store, &user.user_id, &lesson).await?;
    let instruction = prompt::quiz_instruction(topic, count);
    let request = session.request(
        &instruction,
        vec![tools::quiz_tool()],
        ToolMode::Required(vec![CREATE_QUIZ.to_string()]),
    );
    let reply = model.generate(&request).await?;
    if reply.find_call(CREATE_QUIZ).is_none() {
        return Err(TutorError::InvalidToolCall("model did not produce a quiz".into()).into());
    }

    let visible = match topic {
        Some(topic) => format!("Quiz me on {topic} ({count} questions)"),
        None => format!("Quiz me on the course materials ({count} questions)"),
    };
    // The cache replays the same user text a rebuilt session reads from the log.
    let turn = Turn {
        user_id: user.user_id,
        lesson_id,
        user_message: visible.clone(),
        failed_materials: session.failed_materials,
    };
    let response = turn.finish(&db, &tutor, new_message(MessageRole::User, visible), &reply)?;
    tracing::info!(lesson_id = %response.lesson_id, "quiz generated");
    Ok(Json(response))
}

/// POST /api/lessons/{id}/quiz/{quiz_id}/grade
pub async fn grade(
    State(db): State<Db>,
    user: AuthUser,
    Path((lesson_id, quiz_id)): Path<(String, String)>,
    Json(req): Json<GradeQuizRequest>,
) -> Result<Json<QuizGrade>, ApiErr> {
    let lesson = load_lesson(&db.conn(), &user.user_id, &lesson_id)?;
    let quiz = lesson
        .find_quiz(&quiz_id)
        .ok_or_else(|| ApiErr::not_found("quiz not found"))?;
    Ok(Json(quiz.grade(&req.answers)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use studyhall_tutor::FunctionCall;

    #[test]
    fn message_validation_trims_and_bounds() {
        assert_eq!(validate_message("  hi ").unwrap(), "hi");
        assert!(validate_message("   ").is_err());
        assert!(validate_message(&"x".repeat(MAX_MESSAGE_CHARS + 1)).is_err());
    }

    #[test]
    fn quiz_call_becomes_widget_and_bad_call_falls_back_to_text() {
        let quiz_call = FunctionCall {
            name: CREATE_QUIZ.into(),
            args: serde_json::json!({
                "title": "Cells",
                "questions": [{
                    "kind": "true_false",
                    "prompt": "Cells have membranes.",
                    "options": [],
                    "answer_index": 0
                }]
            }),
        };
        let reply = ModelReply {
            text: String::new(),
            function_calls: vec![quiz_call],
        };
        let message = assistant_message(&reply).unwrap();
        assert_eq!(message.quiz.as_ref().unwrap().title, "Cells");
        assert!(message.content.contains("Cells"));

        let reply = ModelReply {
            text: "Let's review first.".into(),
            function_calls: vec![FunctionCall {
                name: CREATE_QUIZ.into(),
                args: serde_json::json!({"title": "x", "questions": []}),
            }],
        };
        let message = assistant_message(&reply).unwrap();
        assert!(message.quiz.is_none());
        assert_eq!(message.content, "Let's review first.");

        let err = assistant_message(&ModelReply::default()).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
