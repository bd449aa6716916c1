//! Flashcard query builders.

use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use super::Built;
use super::tables::Flashcards;
use crate::{Difficulty, FlashcardListQuery};

/// Column order must match `flashcard_from_row()`.
fn flashcard_select() -> sea_query::SelectStatement {
    Query::select()
        .columns([
            Flashcards::Id,
            Flashcards::CourseId,
            Flashcards::Concept,
            Flashcards::Definition,
            Flashcards::Topic,
            Flashcards::Difficulty,
            Flashcards::CreatedAt,
        ])
        .from(Flashcards::Table)
        .to_owned()
}

pub struct InsertParams<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub course_id: Option<&'a str>,
    pub concept: &'a str,
    pub definition: &'a str,
    pub topic: Option<&'a str>,
    pub difficulty: Difficulty,
}

pub fn insert(p: &InsertParams<'_>) -> Built {
    Query::insert()
        .into_table(Flashcards::Table)
        .columns([
            Flashcards::Id,
            Flashcards::UserId,
            Flashcards::CourseId,
            Flashcards::Concept,
            Flashcards::Definition,
            Flashcards::Topic,
            Flashcards::Difficulty,
        ])
        .values_panic([
            p.id.into(),
            p.user_id.into(),
            p.course_id.map(|s| s.to_string()).into(),
            p.concept.into(),
            p.definition.into(),
            p.topic.map(|s| s.to_string()).into(),
            p.difficulty.as_str().into(),
        ])
        .build(SqliteQueryBuilder)
}

/// Filtered listing. SQLite's `LOWER` only folds ASCII, so the topic filter
/// is applied by the caller with `service::tag_key`; here it only requires a
/// topic to be set.
pub fn list(user_id: &str, q: &FlashcardListQuery) -> Built {
    let mut select = flashcard_select();
    select.and_where(Expr::col(Flashcards::UserId).eq(user_id));
    if let Some(course_id) = q.course_id.as_deref() {
        select.and_where(Expr::col(Flashcards::CourseId).eq(course_id));
    }
    if q.topic.is_some() {
        select.and_where(Expr::col(Flashcards::Topic).is_not_null());
    }
    if let Some(difficulty) = q.difficulty {
        select.and_where(Expr::col(Flashcards::Difficulty).eq(difficulty.as_str()));
    }
    select
        .order_by(Flashcards::CreatedAt, Order::Asc)
        .build(SqliteQueryBuilder)
}

pub fn get(user_id: &str, id: &str) -> Built {
    flashcard_select()
        .and_where(Expr::col(Flashcards::UserId).eq(user_id))
        .and_where(Expr::col(Flashcards::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// Overwrite all editable fields (the route merges the patch first).
pub fn update(
    user_id: &str,
    id: &str,
    concept: &str,
    definition: &str,
    topic: Option<&str>,
    difficulty: Difficulty,
) -> Built {
    Query::update()
        .table(Flashcards::Table)
        .value(Flashcards::Concept, concept)
        .value(Flashcards::Definition, definition)
        .value(Flashcards::Topic, topic.map(|s| s.to_string()))
        .value(Flashcards::Difficulty, difficulty.as_str())
        .and_where(Expr::col(Flashcards::UserId).eq(user_id))
        .and_where(Expr::col(Flashcards::Id).eq(id))
        .build(SqliteQueryBuilder)
}

pub fn delete(user_id: &str, id: &str) -> Built {
    Query::delete()
        .from_table(Flashcards::Table)
        .and_where(Expr::col(Flashcards::UserId).eq(user_id))
        .and_where(Expr::col(Flashcards::Id).eq(id))
        .build(SqliteQueryBuilder)
}
