use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use rusqlite::Connection;
use uuid::Uuid;

use studyhall_api::{
    Course, CreateCourseRequest, ListCoursesResponse, OkResponse, UpdateCourseRequest, db, service,
};

use crate::error::ApiErr;
use crate::objects::ObjectStore;
use crate::routes::auth::AuthUser;
use crate::storage::{Db, course_from_row, optional, sq_execute, sq_query_map, sq_query_row};
use crate::tutor::TutorState;

/// 404 unless the course exists and belongs to the user.
pub(crate) fn ensure_course(conn: &Connection, user_id: &str, course_id: &str) -> Result<(), ApiErr> {
    let found = optional(sq_query_row(conn, db::courses::exists(user_id, course_id), |row| {
        row.get::<_, i64>(0)
    }))
    .map_err(ApiErr::from_db("check course"))?;
    found
        .map(|_| ())
        .ok_or_else(|| ApiErr::not_found("course not found"))
}

pub(crate) fn load_course(conn: &Connection, user_id: &str, course_id: &str) -> Result<Course, ApiErr> {
    optional(sq_query_row(conn, db::courses::get(user_id, course_id), course_from_row))
        .map_err(ApiErr::from_db("load course"))?
        .ok_or_else(|| ApiErr::not_found("course not found"))
}

fn clean_description(description: Option<&str>) -> Option<String> {
    description
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Create / list
// ---------------------------------------------------------------------------

/// POST /api/courses: create a course.
pub async fn create(
    State(db): State<Db>,
    user: AuthUser,
    Json(req): Json<CreateCourseRequest>,
) -> Result<(StatusCode, Json<Course>), ApiErr> {
    let name = service::validate_course_name(&req.name)?;
    let description = clean_description(req.description.as_deref());
    let id = Uuid::new_v4().to_string();

    let conn = db.conn();
    sq_execute(
        &conn,
        db::courses::insert(&id, &user.user_id, &name, description.as_deref()),
    )
    .map_err(ApiErr::from_db("insert course"))?;
    let course = load_course(&conn, &user.user_id, &id)?;
    Ok((StatusCode::CREATED, Json(course)))
}

/// GET /api/courses: the user's courses, most recently active first.
pub async fn list(State(db): State<Db>, user: AuthUser) -> Result<Json<ListCoursesResponse>, ApiErr> {
    let conn = db.conn();
    let courses = sq_query_map(&conn, db::courses::list(&user.user_id), course_from_row)
        .map_err(ApiErr::from_db("list courses"))?;
    Ok(Json(ListCoursesResponse { courses }))
}

// ---------------------------------------------------------------------------
// Get / update / delete
// ---------------------------------------------------------------------------

/// GET /api/courses/{id}
pub async fn get(
    State(db): State<Db>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Course>, ApiErr> {
    let conn = db.conn();
    Ok(Json(load_course(&conn, &user.user_id, &id)?))
}

/// PUT /api/courses/{id}: rename and/or change the description.
pub async fn update(
    State(db): State<Db>,
    State(tutor): State<TutorState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateCourseRequest>,
) -> Result<Json<Course>, ApiErr> {
    let name = req
        .name
        .as_deref()
        .map(service::validate_course_name)
        .transpose()?;

    let course = {
        let conn = db.conn();
        ensure_course(&conn, &user.user_id, &id)?;
        if let Some(name) = &name {
            sq_execute(&conn, db::courses::update_name(&user.user_id, &id, name))
                .map_err(ApiErr::from_db("update course name"))?;
        }
        if let Some(description) = &req.description {
            sq_execute(
                &conn,
                db::courses::update_description(&user.user_id, &id, description),
            )
            .map_err(ApiErr::from_db("update course description"))?;
        }
        load_course(&conn, &user.user_id, &id)?
    };
    // Course name and description are part of the tutor's system prompt.
    tutor.invalidate_course(&db, &user.user_id, &id);
    Ok(Json(course))
}

/// DELETE /api/courses/{id}: removes materials (rows and stored files) and
/// lessons; flashcards survive without a course.
pub async fn delete(
    State(db): State<Db>,
    State(store): State<ObjectStore>,
    State(tutor): State<TutorState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, ApiErr> {
    let (paths, lesson_ids) = {
        let conn = db.conn();
        ensure_course(&conn, &user.user_id, &id)?;
        let paths = sq_query_map(
            &conn,
            db::materials::storage_paths_by_course(&user.user_id, &id),
            |row| row.get::<_, String>(0),
        )
        .map_err(ApiErr::from_db("list material paths"))?;
        let lesson_ids = sq_query_map(
            &conn,
            db::lessons::ids_by_course(&user.user_id, &id),
            |row| row.get::<_, String>(0),
        )
        .map_err(ApiErr::from_db("list lessons"))?;
        sq_execute(&conn, db::courses::delete(&user.user_id, &id))
            .map_err(ApiErr::from_db("delete course"))?;
        (paths, lesson_ids)
    };

    tutor.invalidate(lesson_ids.iter().map(String::as_str));
    for path in &paths {
        if let Err(e) = store.delete(path).await {
            tracing::warn!("delete object {path}: {e}");
        }
    }
    tracing::info!(course_id = %id, materials = paths.len(), "course deleted");
    Ok(Json(OkResponse { ok: true }))
}
