//! Account and credential query builders.

use sea_query::{Expr, Query, SqliteQueryBuilder};

use super::Built;
use super::tables::{RefreshTokens, Users};

/// `id, nickname, email, created_at`.
pub fn profile(user_id: &str) -> Built {
    Query::select()
        .columns([Users::Id, Users::Nickname, Users::Email, Users::CreatedAt])
        .from(Users::Table)
        .and_where(Expr::col(Users::Id).eq(user_id))
        .build(SqliteQueryBuilder)
}

/// `id, nickname, password_hash, password_salt` for a login attempt.
pub fn credentials_by_email(email: &str) -> Built {
    Query::select()
        .columns([
            Users::Id,
            Users::Nickname,
            Users::PasswordHash,
            Users::PasswordSalt,
        ])
        .from(Users::Table)
        .and_where(Expr::col(Users::Email).eq(email))
        .build(SqliteQueryBuilder)
}

/// `id` of the account owning an API key hash.
pub fn by_api_key_hash(key_hash: &str) -> Built {
    Query::select()
        .column(Users::Id)
        .from(Users::Table)
        .and_where(Expr::col(Users::ApiKeyHash).eq(key_hash))
        .build(SqliteQueryBuilder)
}

/// New account. `email` is unique; a duplicate fails with a constraint error.
pub fn insert(
    id: &str,
    nickname: &str,
    email: &str,
    password_hash: &str,
    password_salt: &str,
) -> Built {
    Query::insert()
        .into_table(Users::Table)
        .columns([
            Users::Id,
            Users::Nickname,
            Users::Email,
            Users::PasswordHash,
            Users::PasswordSalt,
        ])
        .values_panic([
            id.into(),
            nickname.into(),
            email.into(),
            password_hash.into(),
            password_salt.into(),
        ])
        .build(SqliteQueryBuilder)
}

/// One key per account: the previous key stops working.
pub fn set_api_key_hash(user_id: &str, key_hash: &str) -> Built {
    Query::update()
        .table(Users::Table)
        .value(Users::ApiKeyHash, key_hash)
        .and_where(Expr::col(Users::Id).eq(user_id))
        .build(SqliteQueryBuilder)
}

// ── Refresh tokens ─────────────────────────────────────────────────────────
//
// `expires_at` is stored as `YYYY-MM-DD HH:MM:SS` UTC, so string order is
// time order.

pub fn insert_refresh_token(id: &str, user_id: &str, token_hash: &str, expires_at: &str) -> Built {
    Query::insert()
        .into_table(RefreshTokens::Table)
        .columns([
            RefreshTokens::Id,
            RefreshTokens::UserId,
            RefreshTokens::TokenHash,
            RefreshTokens::ExpiresAt,
        ])
        .values_panic([
            id.into(),
            user_id.into(),
            token_hash.into(),
            expires_at.into(),
        ])
        .build(SqliteQueryBuilder)
}

/// `id, user_id, expires_at, nickname` for a presented refresh token.
pub fn find_refresh_token(token_hash: &str) -> Built {
    Query::select()
        .column((RefreshTokens::Table, RefreshTokens::Id))
        .column((RefreshTokens::Table, RefreshTokens::UserId))
        .column((RefreshTokens::Table, RefreshTokens::ExpiresAt))
        .column((Users::Table, Users::Nickname))
        .from(RefreshTokens::Table)
        .inner_join(
            Users::Table,
            Expr::col((Users::Table, Users::Id))
                .equals((RefreshTokens::Table, RefreshTokens::UserId)),
        )
        .and_where(Expr::col((RefreshTokens::Table, RefreshTokens::TokenHash)).eq(token_hash))
        .build(SqliteQueryBuilder)
}

/// Logout: drop the token the client presented.
pub fn revoke_refresh_token(token_hash: &str) -> Built {
    Query::delete()
        .from_table(RefreshTokens::Table)
        .and_where(Expr::col(RefreshTokens::TokenHash).eq(token_hash))
        .build(SqliteQueryBuilder)
}

/// Rotation: a refresh token is single use.
pub fn consume_refresh_token(id: &str) -> Built {
    Query::delete()
        .from_table(RefreshTokens::Table)
        .and_where(Expr::col(RefreshTokens::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// Tokens that expired before `now` (same format as `expires_at`).
pub fn purge_expired_refresh_tokens(now: &str) -> Built {
    Query::delete()
        .from_table(RefreshTokens::Table)
        .and_where(Expr::col(RefreshTokens::ExpiresAt).lt(now))
        .build(SqliteQueryBuilder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_compares_expiry_as_text() {
        let (sql, values) = purge_expired_refresh_tokens("2026-01-01 00:00:00");
        assert!(sql.starts_with(r#"DELETE FROM "refresh_tokens""#), "{sql}");
        assert!(sql.contains(r#""expires_at" < ?"#), "{sql}");
        assert_eq!(values.0.len(), 1);
    }

    #[test]
    fn api_key_lookup_selects_only_the_id() {
        let (sql, _) = by_api_key_hash("abc");
        assert!(sql.starts_with(r#"SELECT "id" FROM "users""#), "{sql}");
    }

    #[test]
    fn credentials_lookup_is_by_email_only() {
        let (sql, _) = credentials_by_email("ada@example.com");
        assert!(sql.contains(r#"WHERE "email" = ?"#), "{sql}");
        assert!(sql.contains("password_salt"));
    }
}
