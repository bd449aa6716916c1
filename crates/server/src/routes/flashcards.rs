use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use rand::seq::SliceRandom;
use rusqlite::Connection;
use uuid::Uuid;

use studyhall_api::{
    CreateFlashcardRequest, Difficulty, Flashcard, FlashcardListQuery, GenerateFlashcardsRequest,
    LessonType, ListFlashcardsResponse, OkResponse, StudyDeckResponse, StudyQuery,
    UpdateFlashcardRequest, db, service,
};
use studyhall_tutor::{
    ToolMode, TutorError, prompt,
    tools::{self, CREATE_FLASHCARDS},
};

use crate::error::ApiErr;
use crate::objects::ObjectStore;
use crate::routes::auth::AuthUser;
use crate::routes::courses::ensure_course;
use crate::storage::{Db, flashcard_from_row, optional, sq_execute, sq_query_map, sq_query_row};
use crate::tutor::{TutorState, build_course_session};

const DEFAULT_GENERATE_COUNT: u32 = 10;
const DEFAULT_STUDY_LIMIT: u32 = 20;
const MAX_STUDY_LIMIT: u32 = 200;

fn load_flashcard(conn: &Connection, user_id: &str, id: &str) -> Result<Flashcard, ApiErr> {
    optional(sq_query_row(conn, db::flashcards::get(user_id, id), flashcard_from_row))
        .map_err(ApiErr::from_db("load flashcard"))?
        .ok_or_else(|| ApiErr::not_found("flashcard not found"))
}

fn clean_topic(topic: Option<&str>) -> Option<String> {
    topic.map(service::normalize_tag).filter(|t| !t.is_empty())
}

struct NewCard<'a> {
    course_id: Option<&'a str>,
    concept: &'a str,
    definition: &'a str,
    topic: Option<&'a str>,
    difficulty: Difficulty,
}

fn insert_card(conn: &Connection, user_id: &str, card: &NewCard<'_>) -> Result<Flashcard, ApiErr> {
    let id = Uuid::new_v4().to_string();
    sq_execute(
        conn,
        db::flashcards::insert(&db::flashcards::InsertParams {
            id: &id,
            user_id,
            course_id: card.course_id,
            concept: card.concept,
            definition: card.definition,
            topic: card.topic,
            difficulty: card.difficulty,
        }),
    )
    .map_err(ApiErr::from_db("insert flashcard"))?;
    load_flashcard(conn, user_id, &id)
}

// ---------------------------------------------------------------------------
// CRUD
// ---------------------------------------------------------------------------

/// POST /api/flashcards
pub async fn create(
    State(db): State<Db>,
    user: AuthUser,
    Json(req): Json<CreateFlashcardRequest>,
) -> Result<(StatusCode, Json<Flashcard>), ApiErr> {
    let (concept, definition) = service::validate_flashcard(&req.concept, &req.definition)?;
    let topic = clean_topic(req.topic.as_deref());
    let course_id = req.course_id.as_deref().filter(|c| !c.is_empty());

    let conn = db.conn();
    if let Some(course_id) = course_id {
        ensure_course(&conn, &user.user_id, course_id)?;
    }
    let card = insert_card(
        &conn,
        &user.user_id,
        &NewCard {
            course_id,
            concept: &concept,
            definition: &definition,
            topic: topic.as_deref(),
            difficulty: req.difficulty,
        },
    )?;
    Ok((StatusCode::CREATED, Json(card)))
}

/// Run a filtered listing; topics compare by `service::tag_key`.
fn query_flashcards(
    conn: &Connection,
    user_id: &str,
    q: &FlashcardListQuery,
) -> Result<Vec<Flashcard>, ApiErr> {
    let mut cards = sq_query_map(conn, db::flashcards::list(user_id, q), flashcard_from_row)
        .map_err(ApiErr::from_db("list flashcards"))?;
    if let Some(topic) = q.topic.as_deref() {
        let key = service::tag_key(topic);
        cards.retain(|c| c.topic.as_deref().is_some_and(|t| service::tag_key(t) == key));
    }
    Ok(cards)
}

/// GET /api/flashcards?course_id=&topic=&difficulty=
pub async fn list(
    State(db): State<Db>,
    user: AuthUser,
    Query(q): Query<FlashcardListQuery>,
) -> Result<Json<ListFlashcardsResponse>, ApiErr> {
    let conn = db.conn();
    let flashcards = query_flashcards(&conn, &user.user_id, &q)?;
    Ok(Json(ListFlashcardsResponse { flashcards }))
}

/// PUT /api/flashcards/{id}: partial update; omitted fields are kept.
/// An empty `topic` clears it.
pub async fn update(
    State(db): State<Db>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateFlashcardRequest>,
) -> Result<Json<Flashcard>, ApiErr> {
    let conn = db.conn();
    let current = load_flashcard(&conn, &user.user_id, &id)?;
    let (concept, definition) = service::validate_flashcard(
        req.concept.as_deref().unwrap_or(&current.concept),
        req.definition.as_deref().unwrap_or(&current.definition),
    )?;
    let topic = match req.topic.as_deref() {
        Some(topic) => clean_topic(Some(topic)),
        None => current.topic,
    };
    let difficulty = req.difficulty.unwrap_or(current.difficulty);

    sq_execute(
        &conn,
        db::flashcards::update(
            &user.user_id,
            &id,
            &concept,
            &definition,
            topic.as_deref(),
            difficulty,
        ),
    )
    .map_err(ApiErr::from_db("update flashcard"))?;
    Ok(Json(load_flashcard(&conn, &user.user_id, &id)?))
}

/// DELETE /api/flashcards/{id}
pub async fn delete(
    State(db): State<Db>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, ApiErr> {
    let conn = db.conn();
    load_flashcard(&conn, &user.user_id, &id)?;
    sq_execute(&conn, db::flashcards::delete(&user.user_id, &id))
        .map_err(ApiErr::from_db("delete flashcard"))?;
    Ok(Json(OkResponse { ok: true }))
}

// ---------------------------------------------------------------------------
// Generate / study
// ---------------------------------------------------------------------------

/// POST /api/flashcards/generate: have the tutor write cards from a
/// course's materials and store them.
pub async fn generate(
    State(db): State<Db>,
    State(store): State<ObjectStore>,
    State(tutor): State<TutorState>,
    user: AuthUser,
    Json(req): Json<GenerateFlashcardsRequest>,
) -> Result<(StatusCode, Json<ListFlashcardsResponse>), ApiErr> {
    let count = req
        .count
        .unwrap_or(DEFAULT_GENERATE_COUNT)
        .clamp(1, tools::MAX_FLASHCARDS as u32);
    let topic = clean_topic(req.topic.as_deref());
    let model = tutor.model()?;
    ensure_course(&db.conn(), &user.user_id, &req.course_id)?;

    let topics: Vec<String> = topic.iter().cloned().collect();
    let session = build_course_session(
        &db,
        &store,
        model.as_ref(),
        &user.user_id,
        &req.course_id,
        LessonType::Flashcards,
        &topics,
    )
    .await?;
    let request = session.request(
        &prompt::flashcard_instruction(topic.as_deref(), count),
        vec![tools::flashcard_tool()],
        ToolMode::Required(vec![CREATE_FLASHCARDS.to_string()]),
    );
    let reply = model.generate(&request).await?;
    let call = reply.find_call(CREATE_FLASHCARDS).ok_or_else(|| {
        ApiErr::from(TutorError::InvalidToolCall(
            "model did not produce flashcards".into(),
        ))
    })?;
    let drafts = tools::parse_flashcards(call)?;

    let conn = db.conn();
    let mut flashcards = Vec::with_capacity(drafts.len());
    for draft in drafts.into_iter().take(count as usize) {
        // Skip drafts that would fail manual validation rather than the batch.
        let Ok((concept, definition)) =
            service::validate_flashcard(&draft.concept, &draft.definition)
        else {
            continue;
        };
        let card_topic = topic
            .clone()
            .or_else(|| clean_topic(draft.topic.as_deref()));
        flashcards.push(insert_card(
            &conn,
            &user.user_id,
            &NewCard {
                course_id: Some(&req.course_id),
                concept: &concept,
                definition: &definition,
                topic: card_topic.as_deref(),
                difficulty: draft.difficulty,
            },
        )?);
    }
    if flashcards.is_empty() {
        return Err(TutorError::InvalidToolCall("no usable flashcards were generated".into()).into());
    }
    tracing::info!(course_id = %req.course_id, count = flashcards.len(), "flashcards generated");
    Ok((StatusCode::CREATED, Json(ListFlashcardsResponse { flashcards })))
}

/// GET /api/flashcards/study?course_id=&topic=&limit=: a shuffled deck.
pub async fn study(
    State(db): State<Db>,
    user: AuthUser,
    Query(q): Query<StudyQuery>,
) -> Result<Json<StudyDeckResponse>, ApiErr> {
    let limit = q.limit.unwrap_or(DEFAULT_STUDY_LIMIT).clamp(1, MAX_STUDY_LIMIT) as usize;
    let filter = FlashcardListQuery {
        course_id: q.course_id.filter(|c| !c.is_empty()),
        topic: q.topic.filter(|t| !t.trim().is_empty()),
        difficulty: None,
    };
    let mut cards = {
        let conn = db.conn();
        query_flashcards(&conn, &user.user_id, &filter)?
    };
    cards.shuffle(&mut rand::thread_rng());
    cards.truncate(limit);
    Ok(Json(StudyDeckResponse { cards }))
}
