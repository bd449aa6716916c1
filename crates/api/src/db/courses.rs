//! Course query builders.

use sea_query::{Alias, Expr, Order, Query, SqliteQueryBuilder};

use super::Built;
use super::tables::Courses;

/// Standard course columns. Order must match `course_from_row()`.
fn course_select() -> sea_query::SelectStatement {
    Query::select()
        .columns([
            Courses::Id,
            Courses::Name,
            Courses::Description,
            Courses::CreatedAt,
            Courses::UpdatedAt,
        ])
        .expr_as(
            Expr::cust(
                r#"(SELECT COUNT(*) FROM "materials" WHERE "materials"."course_id" = "courses"."id")"#,
            ),
            Alias::new("material_count"),
        )
        .from(Courses::Table)
        .to_owned()
}

pub fn insert(id: &str, user_id: &str, name: &str, description: Option<&str>) -> Built {
    Query::insert()
        .into_table(Courses::Table)
        .columns([
            Courses::Id,
            Courses::UserId,
            Courses::Name,
            Courses::Description,
        ])
        .values_panic([
            id.into(),
            user_id.into(),
            name.into(),
            description.map(|s| s.to_string()).into(),
        ])
        .build(SqliteQueryBuilder)
}

/// All courses of a user, most recently updated first.
pub fn list(user_id: &str) -> Built {
    course_select()
        .and_where(Expr::col(Courses::UserId).eq(user_id))
        .order_by(Courses::UpdatedAt, Order::Desc)
        .build(SqliteQueryBuilder)
}

pub fn get(user_id: &str, id: &str) -> Built {
    course_select()
        .and_where(Expr::col(Courses::UserId).eq(user_id))
        .and_where(Expr::col(Courses::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// Selects `1` when the course exists and belongs to the user.
pub fn exists(user_id: &str, id: &str) -> Built {
    Query::select()
        .expr(Expr::val(1))
        .from(Courses::Table)
        .and_where(Expr::col(Courses::UserId).eq(user_id))
        .and_where(Expr::col(Courses::Id).eq(id))
        .build(SqliteQueryBuilder)
}

pub fn update_name(user_id: &str, id: &str, name: &str) -> Built {
    Query::update()
        .table(Courses::Table)
        .value(Courses::Name, name)
        .value(Courses::UpdatedAt, Expr::cust("datetime('now')"))
        .and_where(Expr::col(Courses::UserId).eq(user_id))
        .and_where(Expr::col(Courses::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// An empty description clears it.
pub fn update_description(user_id: &str, id: &str, description: &str) -> Built {
    let value: Option<String> = (!description.trim().is_empty()).then(|| description.trim().to_string());
    Query::update()
        .table(Courses::Table)
        .value(Courses::Description, value)
        .value(Courses::UpdatedAt, Expr::cust("datetime('now')"))
        .and_where(Expr::col(Courses::UserId).eq(user_id))
        .and_where(Expr::col(Courses::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// Bump `updated_at` (material or lesson activity).
pub fn touch(user_id: &str, id: &str) -> Built {
    Query::update()
        .table(Courses::Table)
        .value(Courses::UpdatedAt, Expr::cust("datetime('now')"))
        .and_where(Expr::col(Courses::UserId).eq(user_id))
        .and_where(Expr::col(Courses::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// Materials and lessons go with it (FK cascade); flashcards keep living
/// without a course link.
pub fn delete(user_id: &str, id: &str) -> Built {
    Query::delete()
        .from_table(Courses::Table)
        .and_where(Expr::col(Courses::UserId).eq(user_id))
        .and_where(Expr::col(Courses::Id).eq(id))
        .build(SqliteQueryBuilder)
}
