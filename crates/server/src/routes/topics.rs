use axum::{
    Json,
    extract::{Path, State},
};
use rusqlite::Connection;

use studyhall_api::{
    ListTopicsResponse, Material, OkResponse, RenameTopicRequest, ServiceError, db, service,
};

use crate::error::ApiErr;
use crate::routes::auth::AuthUser;
use crate::routes::courses::ensure_course;
use crate::storage::{Db, lesson_summary_from_row, material_from_row, sq_execute, sq_query_map};
use crate::tutor::TutorState;

fn course_materials(conn: &Connection, user_id: &str, course_id: &str) -> Result<Vec<Material>, ApiErr> {
    let stored = sq_query_map(
        conn,
        db::materials::list_by_course(user_id, course_id),
        material_from_row,
    )
    .map_err(ApiErr::from_db("list materials"))?;
    Ok(stored.into_iter().map(|s| s.material).collect())
}

/// Apply `edit` to the tags of every material and lesson in a course.
/// Returns how many materials changed.
fn rewrite_course_tags(
    conn: &Connection,
    user_id: &str,
    course_id: &str,
    edit: impl Fn(&[String]) -> Result<Option<Vec<String>>, ServiceError>,
) -> Result<usize, ApiErr> {
    let mut changed = 0;
    for material in course_materials(conn, user_id, course_id)? {
        if let Some(tags) = edit(&material.tags)? {
            let json = serde_json::to_string(&tags).map_err(ApiErr::from_db("encode tags"))?;
            sq_execute(conn, db::materials::update_tags(user_id, &material.id, &json))
                .map_err(ApiErr::from_db("update material tags"))?;
            changed += 1;
        }
    }

    let lessons = sq_query_map(
        conn,
        db::lessons::list(user_id, Some(course_id)),
        lesson_summary_from_row,
    )
    .map_err(ApiErr::from_db("list lessons"))?;
    for lesson in lessons {
        if let Some(topics) = edit(&lesson.topics)? {
            let json = serde_json::to_string(&topics).map_err(ApiErr::from_db("encode topics"))?;
            sq_execute(conn, db::lessons::update_topics(user_id, &lesson.id, &json))
                .map_err(ApiErr::from_db("update lesson topics"))?;
        }
    }
    Ok(changed)
}

/// GET /api/topics: topics across all of the user's courses.
pub async fn list_all(State(db): State<Db>, user: AuthUser) -> Result<Json<ListTopicsResponse>, ApiErr> {
    let conn = db.conn();
    let stored = sq_query_map(&conn, db::materials::list_by_user(&user.user_id), material_from_row)
        .map_err(ApiErr::from_db("list materials"))?;
    let materials: Vec<Material> = stored.into_iter().map(|s| s.material).collect();
    Ok(Json(ListTopicsResponse {
        topics: service::derive_topics(&materials),
    }))
}

/// GET /api/courses/{id}/topics
pub async fn list_for_course(
    State(db): State<Db>,
    user: AuthUser,
    Path(course_id): Path<String>,
) -> Result<Json<ListTopicsResponse>, ApiErr> {
    let conn = db.conn();
    ensure_course(&conn, &user.user_id, &course_id)?;
    let materials = course_materials(&conn, &user.user_id, &course_id)?;
    Ok(Json(ListTopicsResponse {
        topics: service::derive_topics(&materials),
    }))
}

/// PUT /api/courses/{id}/topics/{name}: rename a topic on every material
/// (and lesson) of the course. Renaming onto an existing topic merges them.
pub async fn rename(
    State(db): State<Db>,
    State(tutor): State<TutorState>,
    user: AuthUser,
    Path((course_id, name)): Path<(String, String)>,
    Json(req): Json<RenameTopicRequest>,
) -> Result<Json<ListTopicsResponse>, ApiErr> {
    let to = service::validate_topic_name(&req.name)?;
    let from = service::normalize_tag(&name);

    let topics = {
        let conn = db.conn();
        ensure_course(&conn, &user.user_id, &course_id)?;
        let changed = rewrite_course_tags(&conn, &user.user_id, &course_id, |tags| {
            service::rename_tag(tags, &from, &to)
        })?;
        if changed == 0 {
            return Err(ApiErr::not_found("topic not found"));
        }
        service::derive_topics(&course_materials(&conn, &user.user_id, &course_id)?)
    };
    tutor.invalidate_course(&db, &user.user_id, &course_id);
    tracing::info!(course_id = %course_id, from = %from, to = %to, "topic renamed");
    Ok(Json(ListTopicsResponse { topics }))
}

/// DELETE /api/courses/{id}/topics/{name}: untag the topic everywhere in
/// the course. Materials themselves are kept.
pub async fn delete(
    State(db): State<Db>,
    State(tutor): State<TutorState>,
    user: AuthUser,
    Path((course_id, name)): Path<(String, String)>,
) -> Result<Json<OkResponse>, ApiErr> {
    let name = service::normalize_tag(&name);
    {
        let conn = db.conn();
        ensure_course(&conn, &user.user_id, &course_id)?;
        let changed = rewrite_course_tags(&conn, &user.user_id, &course_id, |tags| {
            Ok(service::remove_tag(tags, &name))
        })?;
        if changed == 0 {
            return Err(ApiErr::not_found("topic not found"));
        }
    }
    tutor.invalidate_course(&db, &user.user_id, &course_id);
    Ok(Json(OkResponse { ok: true }))
}
