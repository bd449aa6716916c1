use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use rusqlite::Connection;
use uuid::Uuid;

use studyhall_api::{
    CreateLessonRequest, Lesson, LessonListQuery, ListLessonsResponse, OkResponse,
    UpdateLessonRequest, db, service,
};

use crate::error::ApiErr;
use crate::routes::auth::AuthUser;
use crate::routes::courses::ensure_course;
use crate::storage::{
    Db, lesson_from_row, lesson_summary_from_row, optional, sq_execute, sq_query_map, sq_query_row,
};
use crate::tutor::TutorState;

pub(crate) fn load_lesson(conn: &Connection, user_id: &str, lesson_id: &str) -> Result<Lesson, ApiErr> {
    optional(sq_query_row(conn, db::lessons::get(user_id, lesson_id), lesson_from_row))
        .map_err(ApiErr::from_db("load lesson"))?
        .ok_or_else(|| ApiErr::not_found("lesson not found"))
}

/// POST /api/lessons
pub async fn create(
    State(db): State<Db>,
    user: AuthUser,
    Json(req): Json<CreateLessonRequest>,
) -> Result<(StatusCode, Json<Lesson>), ApiErr> {
    let title = service::validate_title(&req.title)?;
    let topics = service::normalize_tags(&req.topics)?;
    let topics_json = serde_json::to_string(&topics).map_err(ApiErr::from_db("encode topics"))?;
    let id = Uuid::new_v4().to_string();

    let conn = db.conn();
    ensure_course(&conn, &user.user_id, &req.course_id)?;
    sq_execute(
        &conn,
        db::lessons::insert(
            &id,
            &user.user_id,
            &req.course_id,
            &title,
            req.lesson_type.as_str(),
            &topics_json,
        ),
    )
    .map_err(ApiErr::from_db("insert lesson"))?;
    let lesson = load_lesson(&conn, &user.user_id, &id)?;
    tracing::info!(lesson_id = %id, lesson_type = %lesson.lesson_type, "lesson created");
    Ok((StatusCode::CREATED, Json(lesson)))
}

/// GET /api/lessons?course_id=: summaries, most recently active first.
pub async fn list(
    State(db): State<Db>,
    user: AuthUser,
    Query(q): Query<LessonListQuery>,
) -> Result<Json<ListLessonsResponse>, ApiErr> {
    let conn = db.conn();
    let course_id = q.course_id.as_deref().filter(|c| !c.is_empty());
    if let Some(course_id) = course_id {
        ensure_course(&conn, &user.user_id, course_id)?;
    }
    let lessons = sq_query_map(
        &conn,
        db::lessons::list(&user.user_id, course_id),
        lesson_summary_from_row,
    )
    .map_err(ApiErr::from_db("list lessons"))?;
    Ok(Json(ListLessonsResponse { lessons }))
}

/// GET /api/lessons/{id}: full lesson with its message log.
pub async fn get(
    State(db): State<Db>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Lesson>, ApiErr> {
    let conn = db.conn();
    Ok(Json(load_lesson(&conn, &user.user_id, &id)?))
}

/// PUT /api/lessons/{id}: retitle and/or change the topic selection.
pub async fn update(
    State(db): State<Db>,
    State(tutor): State<TutorState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateLessonRequest>,
) -> Result<Json<Lesson>, ApiErr> {
    let title = req.title.as_deref().map(service::validate_title).transpose()?;
    let topics = req
        .topics
        .as_deref()
        .map(service::normalize_tags)
        .transpose()?;

    let lesson = {
        let conn = db.conn();
        load_lesson(&conn, &user.user_id, &id)?;
        if let Some(title) = &title {
            sq_execute(&conn, db::lessons::update_title(&user.user_id, &id, title))
                .map_err(ApiErr::from_db("update lesson title"))?;
        }
        if let Some(topics) = &topics {
            let json =
                serde_json::to_string(topics).map_err(ApiErr::from_db("encode topics"))?;
            sq_execute(&conn, db::lessons::update_topics(&user.user_id, &id, &json))
                .map_err(ApiErr::from_db("update lesson topics"))?;
        }
        load_lesson(&conn, &user.user_id, &id)?
    };
    // A new topic selection changes which materials the tutor sees.
    if topics.is_some() {
        tutor.invalidate([id.as_str()]);
    }
    Ok(Json(lesson))
}

/// DELETE /api/lessons/{id}
pub async fn delete(
    State(db): State<Db>,
    State(tutor): State<TutorState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, ApiErr> {
    {
        let conn = db.conn();
        load_lesson(&conn, &user.user_id, &id)?;
        sq_execute(&conn, db::lessons::delete(&user.user_id, &id))
            .map_err(ApiErr::from_db("delete lesson"))?;
    }
    tutor.invalidate([id.as_str()]);
    Ok(Json(OkResponse { ok: true }))
}
