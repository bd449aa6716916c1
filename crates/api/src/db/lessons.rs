//! Lesson query builders.
//!
//! `topics` and `messages` are JSON arrays. The message log is rewritten as a
//! whole on every turn.

use sea_query::{Alias, Expr, Order, Query, SqliteQueryBuilder};

use super::Built;
use super::tables::Lessons;

/// Listing columns (no message log). Order must match `lesson_summary_from_row()`.
fn summary_select() -> sea_query::SelectStatement {
    Query::select()
        .columns([
            Lessons::Id,
            Lessons::CourseId,
            Lessons::Title,
            Lessons::LessonType,
            Lessons::Topics,
        ])
        .expr_as(
            Expr::cust(r#"json_array_length("messages")"#),
            Alias::new("message_count"),
        )
        .columns([Lessons::CreatedAt, Lessons::UpdatedAt])
        .from(Lessons::Table)
        .to_owned()
}

pub fn insert(
    id: &str,
    user_id: &str,
    course_id: &str,
    title: &str,
    lesson_type: &str,
    topics_json: &str,
) -> Built {
    Query::insert()
        .into_table(Lessons::Table)
        .columns([
            Lessons::Id,
            Lessons::UserId,
            Lessons::CourseId,
            Lessons::Title,
            Lessons::LessonType,
            Lessons::Topics,
        ])
        .values_panic([
            id.into(),
            user_id.into(),
            course_id.into(),
            title.into(),
            lesson_type.into(),
            topics_json.into(),
        ])
        .build(SqliteQueryBuilder)
}

pub fn list(user_id: &str, course_id: Option<&str>) -> Built {
    let mut q = summary_select();
    q.and_where(Expr::col(Lessons::UserId).eq(user_id));
    if let Some(course_id) = course_id {
        q.and_where(Expr::col(Lessons::CourseId).eq(course_id));
    }
    q.order_by(Lessons::UpdatedAt, Order::Desc)
        .build(SqliteQueryBuilder)
}

/// Full lesson: `id, course_id, title, lesson_type, topics, messages,
/// created_at, updated_at`.
pub fn get(user_id: &str, id: &str) -> Built {
    Query::select()
        .columns([
            Lessons::Id,
            Lessons::CourseId,
            Lessons::Title,
            Lessons::LessonType,
            Lessons::Topics,
            Lessons::Messages,
            Lessons::CreatedAt,
            Lessons::UpdatedAt,
        ])
        .from(Lessons::Table)
        .and_where(Expr::col(Lessons::UserId).eq(user_id))
        .and_where(Expr::col(Lessons::Id).eq(id))
        .build(SqliteQueryBuilder)
}

pub fn update_title(user_id: &str, id: &str, title: &str) -> Built {
    Query::update()
        .table(Lessons::Table)
        .value(Lessons::Title, title)
        .value(Lessons::UpdatedAt, Expr::cust("datetime('now')"))
        .and_where(Expr::col(Lessons::UserId).eq(user_id))
        .and_where(Expr::col(Lessons::Id).eq(id))
        .build(SqliteQueryBuilder)
}

pub fn update_topics(user_id: &str, id: &str, topics_json: &str) -> Built {
    Query::update()
        .table(Lessons::Table)
        .value(Lessons::Topics, topics_json)
        .value(Lessons::UpdatedAt, Expr::cust("datetime('now')"))
        .and_where(Expr::col(Lessons::UserId).eq(user_id))
        .and_where(Expr::col(Lessons::Id).eq(id))
        .build(SqliteQueryBuilder)
}

pub fn update_messages(user_id: &str, id: &str, messages_json: &str) -> Built {
    Query::update()
        .table(Lessons::Table)
        .value(Lessons::Messages, messages_json)
        .value(Lessons::UpdatedAt, Expr::cust("datetime('now')"))
        .and_where(Expr::col(Lessons::UserId).eq(user_id))
        .and_where(Expr::col(Lessons::Id).eq(id))
        .build(SqliteQueryBuilder)
}

pub fn delete(user_id: &str, id: &str) -> Built {
    Query::delete()
        .from_table(Lessons::Table)
        .and_where(Expr::col(Lessons::UserId).eq(user_id))
        .and_where(Expr::col(Lessons::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// Ids of a course's lessons (cache invalidation before course delete).
pub fn ids_by_course(user_id: &str, course_id: &str) -> Built {
    Query::select()
        .column(Lessons::Id)
        .from(Lessons::Table)
        .and_where(Expr::col(Lessons::UserId).eq(user_id))
        .and_where(Expr::col(Lessons::CourseId).eq(course_id))
        .build(SqliteQueryBuilder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_without_course_binds_only_owner() {
        let (sql, values) = list("u1", None);
        assert!(sql.contains("json_array_length"), "{sql}");
        assert_eq!(values.0.len(), 1);
        let (_, values) = list("u1", Some("c1"));
        assert_eq!(values.0.len(), 2);
    }
}
