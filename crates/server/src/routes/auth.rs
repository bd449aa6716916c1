use axum::{
    Json,
    extract::{FromRef, FromRequestParts, State},
    http::{StatusCode, request::Parts},
};
use uuid::Uuid;

use studyhall_api::{
    ApiKeyResponse, AuthRegisterRequest, AuthTokenResponse, LoginRequest, LogoutRequest,
    OkResponse, RefreshRequest, UserProfileResponse, crypto, db,
    service::{self, AuthToken},
};

use crate::AppConfig;
use crate::error::ApiErr;
use crate::storage::{
    Db, TOKEN_EXPIRY_FORMAT, is_unique_violation, optional, sq_execute, sq_query_row,
};

pub(crate) fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Auth extractor
// ---------------------------------------------------------------------------

/// Authenticated user from `Authorization: Bearer <jwt | shk_ api key>`.
/// A verified JWT is trusted as is; an API key costs one lookup.
pub struct AuthUser {
    pub user_id: String,
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Db: FromRef<S>,
    AppConfig: FromRef<S>,
{
    type Rejection = ApiErr;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let db = Db::from_ref(state);
        let config = AppConfig::from_ref(state);

        let token = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiErr::unauthorized("missing or invalid Authorization header"))?;

        let user_id = match service::resolve_auth_token(token, &config.jwt_secret, now_unix())? {
            AuthToken::Jwt(user_id) => user_id,
            AuthToken::ApiKey(key) => optional(sq_query_row(
                &db.conn(),
                db::users::by_api_key_hash(&service::hash_api_key(&key)),
                |row| row.get::<_, String>(0),
            ))
            .map_err(ApiErr::from_db("lookup api key"))?
            .ok_or_else(|| ApiErr::unauthorized("invalid API key"))?,
        };
        Ok(AuthUser { user_id })
    }
}

fn issue_tokens(
    db: &Db,
    config: &AppConfig,
    user_id: &str,
    nickname: &str,
) -> Result<AuthTokenResponse, ApiErr> {
    let bundle =
        service::prepare_token_bundle(&config.jwt_secret, user_id, nickname, now_unix())?;
    let conn = db.conn();
    sq_execute(
        &conn,
        db::users::insert_refresh_token(
            &bundle.token_id,
            user_id,
            &bundle.token_hash,
            &bundle.expires_at,
        ),
    )
    .map_err(ApiErr::from_db("insert refresh token"))?;
    Ok(bundle.response)
}

fn require_jwt(config: &AppConfig) -> Result<(), ApiErr> {
    if config.auth_enabled() {
        Ok(())
    } else {
        Err(ApiErr::internal("JWT_SECRET not configured"))
    }
}

// ---------------------------------------------------------------------------
// Register / login
// ---------------------------------------------------------------------------

/// POST /api/auth/register: create an account with email + password.
pub async fn register(
    State(db): State<Db>,
    State(config): State<AppConfig>,
    Json(req): Json<AuthRegisterRequest>,
) -> Result<(StatusCode, Json<AuthTokenResponse>), ApiErr> {
    require_jwt(&config)?;
    if !config.registration_open {
        return Err(ApiErr::forbidden("registration is currently closed"));
    }

    let email = service::validate_email(&req.email)?;
    service::validate_password(&req.password)?;
    let nickname = service::validate_nickname(&req.nickname)?;
    let (password_hash, password_salt) = crypto::hash_password(&req.password)?;
    let user_id = Uuid::new_v4().to_string();

    {
        let conn = db.conn();
        match sq_execute(
            &conn,
            db::users::insert(&user_id, &nickname, &email, &password_hash, &password_salt),
        ) {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(ApiErr::conflict("email already registered"));
            }
            Err(e) => return Err(ApiErr::from_db("register user")(e)),
        }
    }

    tracing::info!(user_id = %user_id, "user registered");
    let tokens = issue_tokens(&db, &config, &user_id, &nickname)?;
    Ok((StatusCode::CREATED, Json(tokens)))
}

/// POST /api/auth/login: exchange email + password for tokens.
pub async fn login(
    State(db): State<Db>,
    State(config): State<AppConfig>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthTokenResponse>, ApiErr> {
    require_jwt(&config)?;
    let email = service::validate_email(&req.email)?;

    let row: Option<(String, String, String, String)> = {
        let conn = db.conn();
        optional(sq_query_row(
            &conn,
            db::users::credentials_by_email(&email),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        ))
        .map_err(ApiErr::from_db("lookup user for login"))?
    };

    let Some((user_id, nickname, hash, salt)) = row else {
        return Err(ApiErr::unauthorized("invalid email or password"));
    };
    if !crypto::verify_password(&req.password, &hash, &salt) {
        return Err(ApiErr::unauthorized("invalid email or password"));
    }

    Ok(Json(issue_tokens(&db, &config, &user_id, &nickname)?))
}

// ---------------------------------------------------------------------------
// Refresh / logout
// ---------------------------------------------------------------------------

/// POST /api/auth/refresh: rotate a refresh token.
pub async fn refresh(
    State(db): State<Db>,
    State(config): State<AppConfig>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<AuthTokenResponse>, ApiErr> {
    require_jwt(&config)?;
    let token_hash = crypto::hash_token(&req.refresh_token);

    let (token_id, user_id, nickname) = {
        let conn = db.conn();
        let row: Option<(String, String, String, String)> = optional(sq_query_row(
            &conn,
            db::users::find_refresh_token(&token_hash),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        ))
        .map_err(ApiErr::from_db("lookup refresh token"))?;
        let Some((token_id, user_id, expires_at, nickname)) = row else {
            return Err(ApiErr::unauthorized("invalid refresh token"));
        };

        // Rotation: the presented token is spent either way.
        sq_execute(&conn, db::users::consume_refresh_token(&token_id))
            .map_err(ApiErr::from_db("delete refresh token"))?;

        let expired = chrono::NaiveDateTime::parse_from_str(&expires_at, TOKEN_EXPIRY_FORMAT)
            .map(|t| t.and_utc().timestamp() <= now_unix() as i64)
            .unwrap_or(true);
        if expired {
            return Err(ApiErr::unauthorized("refresh token expired"));
        }
        (token_id, user_id, nickname)
    };

    tracing::debug!(token_id = %token_id, "refresh token rotated");
    Ok(Json(issue_tokens(&db, &config, &user_id, &nickname)?))
}

/// POST /api/auth/logout: revoke a refresh token.
pub async fn logout(
    State(db): State<Db>,
    Json(req): Json<LogoutRequest>,
) -> Result<Json<OkResponse>, ApiErr> {
    let conn = db.conn();
    sq_execute(
        &conn,
        db::users::revoke_refresh_token(&crypto::hash_token(&req.refresh_token)),
    )
    .map_err(ApiErr::from_db("logout"))?;
    Ok(Json(OkResponse { ok: true }))
}

// ---------------------------------------------------------------------------
// Profile / API key
// ---------------------------------------------------------------------------

/// GET /api/auth/me: current user profile.
pub async fn me(State(db): State<Db>, user: AuthUser) -> Result<Json<UserProfileResponse>, ApiErr> {
    let conn = db.conn();
    let profile = sq_query_row(&conn, db::users::profile(&user.user_id), |row| {
        Ok(UserProfileResponse {
            user_id: row.get(0)?,
            nickname: row.get(1)?,
            email: row.get(2)?,
            created_at: row.get(3)?,
        })
    })
    .map_err(ApiErr::from_db("load profile"))?;
    Ok(Json(profile))
}

/// POST /api/auth/api-key: issue a new API key, replacing the previous one.
pub async fn issue_api_key(
    State(db): State<Db>,
    user: AuthUser,
) -> Result<Json<ApiKeyResponse>, ApiErr> {
    let api_key = service::generate_api_key();
    let conn = db.conn();
    sq_execute(
        &conn,
        db::users::set_api_key_hash(&user.user_id, &service::hash_api_key(&api_key)),
    )
    .map_err(ApiErr::from_db("store api key"))?;
    tracing::info!(user_id = %user.user_id, "api key issued");
    Ok(Json(ApiKeyResponse { api_key }))
}
