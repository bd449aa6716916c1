use axum::{
    Router,
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, post, put},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::objects::ObjectStore;
use crate::routes;
use crate::storage::Db;
use crate::tutor::TutorState;

/// Multipart framing overhead allowed on top of the file size limit.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub store: ObjectStore,
    pub config: AppConfig,
    pub tutor: TutorState,
}

impl FromRef<AppState> for Db {
    fn from_ref(state: &AppState) -> Self {
        state.db.clone()
    }
}

impl FromRef<AppState> for ObjectStore {
    fn from_ref(state: &AppState) -> Self {
        state.store.clone()
    }
}

impl FromRef<AppState> for AppConfig {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

impl FromRef<AppState> for TutorState {
    fn from_ref(state: &AppState) -> Self {
        state.tutor.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    let upload_limit = usize::try_from(state.config.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    let api = Router::new()
        // Health
        .route("/health", get(routes::health::health))
        .route("/capabilities", get(routes::capabilities::capabilities))
        // Auth
        .route("/auth/register", post(routes::auth::register))
        .route("/auth/login", post(routes::auth::login))
        .route("/auth/refresh", post(routes::auth::refresh))
        .route("/auth/logout", post(routes::auth::logout))
        .route("/auth/me", get(routes::auth::me))
        .route("/auth/api-key", post(routes::auth::issue_api_key))
        // Courses
        .route(
            "/courses",
            post(routes::courses::create).get(routes::courses::list),
        )
        .route(
            "/courses/{id}",
            get(routes::courses::get)
                .put(routes::courses::update)
                .delete(routes::courses::delete),
        )
        // Materials
        .route(
            "/courses/{id}/materials",
            post(routes::materials::upload)
                .layer(DefaultBodyLimit::max(upload_limit))
                .get(routes::materials::list_for_course),
        )
        .route(
            "/materials/{id}",
            get(routes::materials::get)
                .patch(routes::materials::update_tags)
                .delete(routes::materials::delete),
        )
        .route("/materials/{id}/url", get(routes::materials::signed_url))
        .route("/files/{*path}", get(routes::files::download))
        // Topics
        .route("/topics", get(routes::topics::list_all))
        .route(
            "/courses/{id}/topics",
            get(routes::topics::list_for_course),
        )
        .route(
            "/courses/{id}/topics/{name}",
            put(routes::topics::rename).delete(routes::topics::delete),
        )
        // Lessons
        .route(
            "/lessons",
            post(routes::lessons::create).get(routes::lessons::list),
        )
        .route(
            "/lessons/{id}",
            get(routes::lessons::get)
                .put(routes::lessons::update)
                .delete(routes::lessons::delete),
        )
        .route("/lessons/{id}/chat", post(routes::chat::chat))
        .route("/lessons/{id}/quiz", post(routes::chat::quiz))
        .route(
            "/lessons/{id}/quiz/{quiz_id}/grade",
            post(routes::chat::grade),
        )
        // Flashcards
        .route(
            "/flashcards",
            post(routes::flashcards::create).get(routes::flashcards::list),
        )
        .route("/flashcards/generate", post(routes::flashcards::generate))
        .route("/flashcards/study", get(routes::flashcards::study))
        .route(
            "/flashcards/{id}",
            put(routes::flashcards::update).delete(routes::flashcards::delete),
        );

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request, StatusCode, header};
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    use studyhall_tutor::{
        FileUpload, FunctionCall, GenerateRequest, GenerativeModel, ModelReply, Part, RemoteFile,
        Role, TutorError, prompt, tools,
    };

    use crate::storage::init_db;

    #[derive(Default)]
    struct FakeModel {
        replies: Mutex<VecDeque<ModelReply>>,
        requests: Mutex<Vec<GenerateRequest>>,
        uploads: AtomicUsize,
        /// Display names whose upload is rejected.
        broken: Mutex<Vec<String>>,
    }

    impl FakeModel {
        fn push(&self, reply: ModelReply) {
            self.replies.lock().unwrap().push_back(reply);
        }

        fn reject_upload(&self, name: &str) {
            self.broken.lock().unwrap().push(name.to_string());
        }

        fn last_request(&self) -> GenerateRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl GenerativeModel for FakeModel {
        fn name(&self) -> &str {
            "fake"
        }

        async fn generate(&self, request: &GenerateRequest) -> Result<ModelReply, TutorError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ModelReply::text("Happy to help.")))
        }

        async fn upload_file(&self, upload: FileUpload) -> Result<RemoteFile, TutorError> {
            if self.broken.lock().unwrap().contains(&upload.display_name) {
                return Err(TutorError::Vendor {
                    status: 400,
                    message: "unsupported file".into(),
                });
            }
            let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(RemoteFile {
                name: format!("files/{n}"),
                uri: format!("https://files.test/{n}"),
                mime_type: upload.mime_type,
                expires_at: Some(chrono::Utc::now() + chrono::Duration::days(2)),
            })
        }
    }

    struct TestApp {
        router: Router,
        tutor: TutorState,
        model: Arc<FakeModel>,
        _dir: TempDir,
    }

    fn test_app_with(model: Option<Arc<FakeModel>>) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().into_owned();
        let config = AppConfig::from_lookup(|name| match name {
            "JWT_SECRET" => Some("test-secret".into()),
            "STUDYHALL_DATA_DIR" => Some(data_dir.clone()),
            "STUDYHALL_MAX_UPLOAD_MB" => Some("1".into()),
            _ => None,
        });
        let db = init_db(&config.data_dir).unwrap();
        let store = ObjectStore::new(
            config.data_dir.join("objects"),
            &config.storage_secret,
            &config.base_url,
            config.signed_url_ttl_secs,
        );
        let fake = model.clone().unwrap_or_default();
        let tutor = TutorState::new(
            model.map(|m| m as Arc<dyn GenerativeModel>),
            config.chat_cache_capacity,
            config.chat_cache_ttl,
        );
        let router = build_router(AppState {
            db,
            store,
            config,
            tutor: tutor.clone(),
        });
        TestApp {
            router,
            tutor,
            model: fake,
            _dir: dir,
        }
    }

    fn test_app() -> TestApp {
        test_app_with(Some(Arc::new(FakeModel::default())))
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let (status, bytes) = send(app, req).await;
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn register(app: &Router, email: &str) -> String {
        let (status, body) = call(
            app,
            Method::POST,
            "/api/auth/register",
            None,
            Some(json!({"email": email, "password": "correct horse", "nickname": "ada"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["access_token"].as_str().unwrap().to_string()
    }

    async fn create_course(app: &Router, token: &str, name: &str) -> String {
        let (status, body) = call(
            app,
            Method::POST,
            "/api/courses",
            Some(token),
            Some(json!({"name": name})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_str().unwrap().to_string()
    }

    const BOUNDARY: &str = "studyhall-test-boundary";

    fn multipart_request(
        course_id: &str,
        token: &str,
        file_name: &str,
        mime: &str,
        bytes: &[u8],
        tags: &[&str],
    ) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: {mime}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
        for tag in tags {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"tag\"\r\n\r\n{tag}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method(Method::POST)
            .uri(format!("/api/courses/{course_id}/materials"))
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn upload(
        app: &Router,
        token: &str,
        course_id: &str,
        file_name: &str,
        mime: &str,
        bytes: &[u8],
        tags: &[&str],
    ) -> Value {
        let (status, body) = send(
            app,
            multipart_request(course_id, token, file_name, mime, bytes, tags),
        )
        .await;
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body
    }

    async fn create_lesson(app: &Router, token: &str, course_id: &str, topics: &[&str]) -> String {
        let (status, body) = call(
            app,
            Method::POST,
            "/api/lessons",
            Some(token),
            Some(json!({"course_id": course_id, "title": "Week 1", "topics": topics})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_str().unwrap().to_string()
    }

    fn quiz_reply() -> ModelReply {
        ModelReply {
            text: String::new(),
            function_calls: vec![FunctionCall {
                name: "create_quiz".into(),
                args: json!({
                    "title": "Cell basics",
                    "questions": [
                        {
                            "kind": "multiple_choice",
                            "prompt": "Powerhouse of the cell?",
                            "options": ["Nucleus", "Mitochondria", "Ribosome"],
                            "answer_index": 1
                        },
                        {
                            "kind": "true_false",
                            "prompt": "Plant cells have walls.",
                            "options": ["True", "False"],
                            "answer_index": 0
                        }
                    ]
                }),
            }],
        }
    }

    // ── Health / auth ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn health_and_capabilities() {
        let app = test_app_with(None);
        let (status, body) = call(&app.router, Method::GET, "/api/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&app.router, Method::GET, "/api/capabilities", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["auth_enabled"], true);
        assert_eq!(body["ai_enabled"], false);
        assert_eq!(body["max_upload_bytes"], 1024 * 1024);
    }

    #[tokio::test]
    async fn auth_register_login_refresh_and_reject() {
        let app = test_app();
        let r = &app.router;
        let token = register(r, "ada@example.com").await;

        let (status, body) = call(r, Method::GET, "/api/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["email"], "ada@example.com");

        let (status, _) = call(r, Method::GET, "/api/auth/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(r, Method::GET, "/api/courses", Some("garbage"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(
            r,
            Method::POST,
            "/api/auth/register",
            None,
            Some(json!({"email": "ADA@example.com", "password": "another one", "nickname": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            r,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({"email": "ada@example.com", "password": "wrong password"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, login) = call(
            r,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({"email": "ada@example.com", "password": "correct horse"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let refresh = login["refresh_token"].as_str().unwrap();

        let (status, _) = call(
            r,
            Method::POST,
            "/api/auth/refresh",
            None,
            Some(json!({"refresh_token": refresh})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        // Rotated: the old refresh token is spent.
        let (status, _) = call(
            r,
            Method::POST,
            "/api/auth/refresh",
            None,
            Some(json!({"refresh_token": refresh})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, key) = call(r, Method::POST, "/api/auth/api-key", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let api_key = key["api_key"].as_str().unwrap();
        let (status, _) = call(r, Method::GET, "/api/courses", Some(api_key), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, me) = call(r, Method::GET, "/api/auth/me", Some(api_key), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["nickname"], "ada");
        let (status, _) = call(r, Method::GET, "/api/auth/me", Some("shk_unknown"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    // ── Courses / materials ─────────────────────────────────────────────────

    #[tokio::test]
    async fn courses_are_scoped_to_their_owner() {
        let app = test_app();
        let r = &app.router;
        let ada = register(r, "ada@example.com").await;
        let bob = register(r, "bob@example.com").await;
        let course = create_course(r, &ada, "Biology").await;

        let (status, _) = call(r, Method::GET, &format!("/api/courses/{course}"), Some(&bob), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(
            r,
            Method::DELETE,
            &format!("/api/courses/{course}"),
            Some(&bob),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, list) = call(r, Method::GET, "/api/courses", Some(&bob), None).await;
        assert_eq!(list["courses"].as_array().unwrap().len(), 0);

        let (status, updated) = call(
            r,
            Method::PUT,
            &format!("/api/courses/{course}"),
            Some(&ada),
            Some(json!({"name": "  Cell Biology ", "description": "BIO 101"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["name"], "Cell Biology");
        assert_eq!(updated["description"], "BIO 101");

        let (status, _) = call(
            r,
            Method::POST,
            "/api/courses",
            Some(&ada),
            Some(json!({"name": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_list_topics_and_signed_download() {
        let app = test_app();
        let r = &app.router;
        let token = register(r, "ada@example.com").await;
        let course = create_course(r, &token, "Biology").await;

        let notes = b"Mitochondria make ATP.";
        let material = upload(
            r,
            &token,
            &course,
            "notes.txt",
            "text/plain",
            notes,
            &["Cells", " cells ", "Energy"],
        )
        .await;
        assert_eq!(material["tags"], json!(["Cells", "Energy"]));
        assert_eq!(material["size_bytes"], notes.len());
        upload(r, &token, &course, "genes.md", "application/octet-stream", b"# DNA", &["Genetics"]).await;

        let (_, list) = call(
            r,
            Method::GET,
            &format!("/api/courses/{course}/materials?topic=energy"),
            Some(&token),
            None,
        )
        .await;
        let listed = list["materials"].as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["file_name"], "notes.txt");

        let (_, all) = call(
            r,
            Method::GET,
            &format!("/api/courses/{course}/materials"),
            Some(&token),
            None,
        )
        .await;
        let all = all["materials"].as_array().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1]["mime_type"], "text/markdown");

        let (_, topics) = call(
            r,
            Method::GET,
            &format!("/api/courses/{course}/topics"),
            Some(&token),
            None,
        )
        .await;
        let names: Vec<&str> = topics["topics"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["Cells", "Energy", "Genetics"]);
        let (_, global) = call(r, Method::GET, "/api/topics", Some(&token), None).await;
        assert_eq!(global["topics"].as_array().unwrap().len(), 3);

        let (_, course_body) = call(
            r,
            Method::GET,
            &format!("/api/courses/{course}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(course_body["material_count"], 2);

        let id = material["id"].as_str().unwrap();
        let (status, signed) = call(
            r,
            Method::GET,
            &format!("/api/materials/{id}/url"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let url = signed["url"].as_str().unwrap();
        let path = url.strip_prefix("http://localhost:3000").unwrap();

        let (status, bytes) = send(r, Request::get(path).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, notes);

        let tampered = path.replace("signature=", "signature=AAAA");
        let (status, _) = send(r, Request::get(tampered).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, patched) = call(
            r,
            Method::PATCH,
            &format!("/api/materials/{id}"),
            Some(&token),
            Some(json!({"tags": ["Metabolism"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["tags"], json!(["Metabolism"]));

        let (status, _) = call(
            r,
            Method::DELETE,
            &format!("/api/materials/{id}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(r, Request::get(path).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_rejects_oversized_and_empty_files() {
        let app = test_app();
        let r = &app.router;
        let token = register(r, "ada@example.com").await;
        let course = create_course(r, &token, "Biology").await;

        let big = vec![b'a'; 1024 * 1024 + 1];
        let (status, _) = send(
            r,
            multipart_request(&course, &token, "big.txt", "text/plain", &big, &[]),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        let (status, _) = send(
            r,
            multipart_request(&course, &token, "empty.txt", "text/plain", b"", &[]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, list) = call(
            r,
            Method::GET,
            &format!("/api/courses/{course}/materials"),
            Some(&token),
            None,
        )
        .await;
        assert!(list["materials"].as_array().unwrap().is_empty());
    }

    // ── Lessons / chat ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn chat_turn_with_quiz_tool_call_then_grade() {
        let app = test_app();
        let r = &app.router;
        let token = register(r, "ada@example.com").await;
        let course = create_course(r, &token, "Biology").await;
        upload(r, &token, &course, "notes.txt", "text/plain", b"Mitochondria make ATP.", &["Cells"]).await;
        let lesson = create_lesson(r, &token, &course, &["cells"]).await;

        app.model.push(quiz_reply());
        let (status, body) = call(
            r,
            Method::POST,
            &format!("/api/lessons/{lesson}/chat"),
            Some(&token),
            Some(json!({"message": "Can you quiz me?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let quiz = &body["message"]["quiz"];
        assert_eq!(quiz["title"], "Cell basics");
        assert_eq!(quiz["questions"].as_array().unwrap().len(), 2);
        assert!(body["failed_materials"].as_array().unwrap().is_empty());

        // Text material is inlined into the system prompt, not uploaded.
        let request = app.model.last_request();
        assert!(request.system_instruction.contains("Mitochondria make ATP."));
        assert_eq!(app.model.uploads.load(Ordering::SeqCst), 0);

        let (_, stored) = call(r, Method::GET, &format!("/api/lessons/{lesson}"), Some(&token), None).await;
        let messages = stored["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");

        let quiz_id = quiz["id"].as_str().unwrap();
        let (status, grade) = call(
            r,
            Method::POST,
            &format!("/api/lessons/{lesson}/quiz/{quiz_id}/grade"),
            Some(&token),
            Some(json!({"answers": [1, null]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(grade["correct"], 1);
        assert_eq!(grade["total"], 2);

        let (status, _) = call(
            r,
            Method::POST,
            &format!("/api/lessons/{lesson}/quiz/nope/grade"),
            Some(&token),
            Some(json!({"answers": []})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            r,
            Method::POST,
            &format!("/api/lessons/{lesson}/chat"),
            Some(&token),
            Some(json!({"message": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn quiz_endpoint_forces_the_tool() {
        let app = test_app();
        let r = &app.router;
        let token = register(r, "ada@example.com").await;
        let course = create_course(r, &token, "Biology").await;
        let lesson = create_lesson(r, &token, &course, &[]).await;

        app.model.push(quiz_reply());
        let (status, body) = call(
            r,
            Method::POST,
            &format!("/api/lessons/{lesson}/quiz"),
            Some(&token),
            Some(json!({"topic": "Cells", "question_count": 99})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(body["message"]["quiz"].is_object());
        let request = app.model.last_request();
        assert_eq!(
            request.tool_mode,
            studyhall_tutor::ToolMode::Required(vec!["create_quiz".into()])
        );

        // The cached session replays the visible request, as a rebuilt one would.
        app.model.push(ModelReply::text("Let's talk about cells."));
        let (status, _) = call(
            r,
            Method::POST,
            &format!("/api/lessons/{lesson}/chat"),
            Some(&token),
            Some(json!({"message": "Explain question 1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.tutor.cached_sessions(), 1);
        let user_texts: Vec<String> = app
            .model
            .last_request()
            .contents
            .iter()
            .filter(|c| c.role == Role::User)
            .flat_map(|c| c.parts.iter())
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect();
        let max = tools::MAX_QUESTIONS as u32;
        assert!(user_texts.contains(&format!("Quiz me on Cells ({max} questions)")), "{user_texts:?}");
        assert!(!user_texts.contains(&prompt::quiz_instruction(Some("Cells"), max)));

        // A plain-text reply is not a quiz.
        app.model.push(ModelReply::text("Sure!"));
        let (status, _) = call(
            r,
            Method::POST,
            &format!("/api/lessons/{lesson}/quiz"),
            Some(&token),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn chat_sessions_are_cached_until_materials_change() {
        let app = test_app();
        let r = &app.router;
        let token = register(r, "ada@example.com").await;
        let course = create_course(r, &token, "Biology").await;
        let pdf = upload(r, &token, &course, "slides.pdf", "application/pdf", b"%PDF-1.4", &[]).await;
        let lesson = create_lesson(r, &token, &course, &[]).await;

        for message in ["What is ATP?", "And ADP?"] {
            let (status, _) = call(
                r,
                Method::POST,
                &format!("/api/lessons/{lesson}/chat"),
                Some(&token),
                Some(json!({"message": message})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(app.model.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(app.tutor.cached_sessions(), 1);
        // files preamble + ack, first turn, new user turn
        assert_eq!(app.model.last_request().contents.len(), 5);

        let (_, material) = call(
            r,
            Method::GET,
            &format!("/api/materials/{}", pdf["id"].as_str().unwrap()),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(material["ai_status"], "ready");

        upload(r, &token, &course, "more.txt", "text/plain", b"extra", &[]).await;
        assert_eq!(app.tutor.cached_sessions(), 0);
    }

    #[tokio::test]
    async fn failed_material_is_reported_and_the_rest_still_attached() {
        let app = test_app();
        let r = &app.router;
        let token = register(r, "ada@example.com").await;
        let course = create_course(r, &token, "Biology").await;
        upload(r, &token, &course, "slides.pdf", "application/pdf", b"%PDF-1.4 ok", &[]).await;
        let broken = upload(r, &token, &course, "scan.pdf", "application/pdf", b"%PDF-1.4 bad", &[]).await;
        let lesson = create_lesson(r, &token, &course, &[]).await;
        app.model.reject_upload("scan.pdf");

        let (status, body) = call(
            r,
            Method::POST,
            &format!("/api/lessons/{lesson}/chat"),
            Some(&token),
            Some(json!({"message": "Summarise the slides"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["failed_materials"], json!(["scan.pdf"]));

        let attached = app
            .model
            .last_request()
            .contents
            .iter()
            .flat_map(|c| c.parts.iter())
            .filter(|p| matches!(p, Part::File { .. }))
            .count();
        assert_eq!(attached, 1);
        assert_eq!(app.model.uploads.load(Ordering::SeqCst), 1);

        let (_, material) = call(
            r,
            Method::GET,
            &format!("/api/materials/{}", broken["id"].as_str().unwrap()),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(material["ai_status"], "failed");
        assert_eq!(app.tutor.cached_sessions(), 0);

        // The next turn retries the failed file and, once it works, caches.
        app.model.broken.lock().unwrap().clear();
        let (status, body) = call(
            r,
            Method::POST,
            &format!("/api/lessons/{lesson}/chat"),
            Some(&token),
            Some(json!({"message": "And the scan?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(body["failed_materials"].as_array().unwrap().is_empty());
        assert_eq!(app.tutor.cached_sessions(), 1);
    }

    #[tokio::test]
    async fn streaming_chat_emits_delta_then_message() {
        let app = test_app();
        let r = &app.router;
        let token = register(r, "ada@example.com").await;
        let course = create_course(r, &token, "Biology").await;
        let lesson = create_lesson(r, &token, &course, &[]).await;

        app.model.push(ModelReply::text("ATP stores energy."));
        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/lessons/{lesson}/chat"))
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"message": "What is ATP?", "stream": true}).to_string(),
            ))
            .unwrap();
        let resp = r.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8_lossy(&body);
        let delta = text.find("event: delta").unwrap();
        let message = text.find("event: message").unwrap();
        assert!(delta < message, "{text}");
        assert!(text.contains("ATP stores energy."));

        let (_, stored) = call(r, Method::GET, &format!("/api/lessons/{lesson}"), Some(&token), None).await;
        assert_eq!(stored["messages"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn chat_without_model_is_unavailable() {
        let app = test_app_with(None);
        let r = &app.router;
        let token = register(r, "ada@example.com").await;
        let course = create_course(r, &token, "Biology").await;
        let lesson = create_lesson(r, &token, &course, &[]).await;
        let (status, body) = call(
            r,
            Method::POST,
            &format!("/api/lessons/{lesson}/chat"),
            Some(&token),
            Some(json!({"message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("not configured"));
    }

    // ── Flashcards / topics / cascade ───────────────────────────────────────

    #[tokio::test]
    async fn flashcards_crud_study_and_generate() {
        let app = test_app();
        let r = &app.router;
        let token = register(r, "ada@example.com").await;
        let course = create_course(r, &token, "Biology").await;

        let (status, card) = call(
            r,
            Method::POST,
            "/api/flashcards",
            Some(&token),
            Some(json!({"course_id": course, "concept": "ATP", "definition": "Energy currency", "topic": " Cells "})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{card}");
        assert_eq!(card["topic"], "Cells");
        assert_eq!(card["difficulty"], "medium");
        let id = card["id"].as_str().unwrap();

        let (status, updated) = call(
            r,
            Method::PUT,
            &format!("/api/flashcards/{id}"),
            Some(&token),
            Some(json!({"difficulty": "hard"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["difficulty"], "hard");
        assert_eq!(updated["concept"], "ATP");

        let (status, _) = call(
            r,
            Method::POST,
            "/api/flashcards",
            Some(&token),
            Some(json!({"concept": "", "definition": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        app.model.push(ModelReply {
            text: String::new(),
            function_calls: vec![FunctionCall {
                name: "create_flashcards".into(),
                args: json!({"cards": [
                    {"concept": "Ribosome", "definition": "Builds proteins", "difficulty": "easy"},
                    {"concept": "", "definition": "dropped"},
                    {"concept": "Nucleus", "definition": "Holds DNA", "difficulty": "extreme"}
                ]}),
            }],
        });
        let (status, generated) = call(
            r,
            Method::POST,
            "/api/flashcards/generate",
            Some(&token),
            Some(json!({"course_id": course, "topic": "cells", "count": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{generated}");
        let cards = generated["flashcards"].as_array().unwrap();
        assert_eq!(cards.len(), 2);
        assert!(cards.iter().all(|c| c["topic"] == "cells"));
        assert_eq!(cards[1]["difficulty"], "medium");

        let (_, listed) = call(r, Method::GET, "/api/flashcards?topic=CELLS", Some(&token), None).await;
        assert_eq!(listed["flashcards"].as_array().unwrap().len(), 3);
        let (_, hard) = call(r, Method::GET, "/api/flashcards?difficulty=hard", Some(&token), None).await;
        assert_eq!(hard["flashcards"].as_array().unwrap().len(), 1);

        let (status, deck) = call(
            r,
            Method::GET,
            &format!("/api/flashcards/study?course_id={course}&limit=2"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deck["cards"].as_array().unwrap().len(), 2);

        let (status, _) = call(
            r,
            Method::DELETE,
            &format!("/api/flashcards/{id}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(
            r,
            Method::DELETE,
            &format!("/api/flashcards/{id}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn topic_rename_and_delete_touch_materials_and_lessons() {
        let app = test_app();
        let r = &app.router;
        let token = register(r, "ada@example.com").await;
        let course = create_course(r, &token, "Biology").await;
        upload(r, &token, &course, "a.txt", "text/plain", b"a", &["Cell Bio", "Energy"]).await;
        upload(r, &token, &course, "b.txt", "text/plain", b"b", &["cell bio"]).await;
        let lesson = create_lesson(r, &token, &course, &["Cell Bio"]).await;

        let (status, renamed) = call(
            r,
            Method::PUT,
            &format!("/api/courses/{course}/topics/cell%20bio"),
            Some(&token),
            Some(json!({"name": "Cytology"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{renamed}");
        assert_eq!(
            renamed["topics"],
            json!([
                {"name": "Cytology", "material_count": 2},
                {"name": "Energy", "material_count": 1}
            ])
        );
        let (_, stored) = call(r, Method::GET, &format!("/api/lessons/{lesson}"), Some(&token), None).await;
        assert_eq!(stored["topics"], json!(["Cytology"]));

        let (status, _) = call(
            r,
            Method::PUT,
            &format!("/api/courses/{course}/topics/missing"),
            Some(&token),
            Some(json!({"name": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            r,
            Method::PUT,
            &format!("/api/courses/{course}/topics/Cytology"),
            Some(&token),
            Some(json!({"name": "x".repeat(65)})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

        let (status, _) = call(
            r,
            Method::DELETE,
            &format!("/api/courses/{course}/topics/Energy"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, topics) = call(
            r,
            Method::GET,
            &format!("/api/courses/{course}/topics"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(topics["topics"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_ascii_topics_group_and_delete_as_one() {
        let app = test_app();
        let r = &app.router;
        let token = register(r, "ada@example.com").await;
        let course = create_course(r, &token, "Physique").await;
        let a = upload(r, &token, &course, "a.txt", "text/plain", b"a", &["Énergie", "énergie"]).await;
        assert_eq!(a["tags"], json!(["Énergie"]));
        upload(r, &token, &course, "b.txt", "text/plain", b"b", &["ÉNERGIE"]).await;

        let (_, topics) = call(r, Method::GET, "/api/topics", Some(&token), None).await;
        let topics = topics["topics"].as_array().unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0]["name"].as_str().unwrap().to_lowercase(), "énergie");
        assert_eq!(topics[0]["material_count"], 2);

        let (_, filtered) = call(
            r,
            Method::GET,
            &format!("/api/courses/{course}/materials?topic=%C3%A9nergie"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(filtered["materials"].as_array().unwrap().len(), 2);

        let (status, _) = call(
            r,
            Method::DELETE,
            &format!("/api/courses/{course}/topics/%C3%89nergie"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, topics) = call(r, Method::GET, "/api/topics", Some(&token), None).await;
        assert_eq!(topics["topics"], json!([]));

        let (_, card) = call(
            r,
            Method::POST,
            "/api/flashcards",
            Some(&token),
            Some(json!({"concept": "Joule", "definition": "Unit of energy", "topic": "Énergie"})),
        )
        .await;
        assert_eq!(card["topic"], "Énergie");
        let (_, listed) = call(
            r,
            Method::GET,
            "/api/flashcards?topic=%C3%89NERGIE",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(listed["flashcards"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn course_delete_cascades_but_keeps_flashcards() {
        let app = test_app();
        let r = &app.router;
        let token = register(r, "ada@example.com").await;
        let course = create_course(r, &token, "Biology").await;
        let material = upload(r, &token, &course, "a.txt", "text/plain", b"abc", &[]).await;
        let lesson = create_lesson(r, &token, &course, &[]).await;
        let (_, card) = call(
            r,
            Method::POST,
            "/api/flashcards",
            Some(&token),
            Some(json!({"course_id": course, "concept": "ATP", "definition": "Energy"})),
        )
        .await;

        let id = material["id"].as_str().unwrap();
        let (_, signed) = call(r, Method::GET, &format!("/api/materials/{id}/url"), Some(&token), None).await;
        let path = signed["url"]
            .as_str()
            .unwrap()
            .strip_prefix("http://localhost:3000")
            .unwrap()
            .to_string();

        let (status, _) = call(r, Method::DELETE, &format!("/api/courses/{course}"), Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(r, Method::GET, &format!("/api/materials/{id}"), Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(r, Method::GET, &format!("/api/lessons/{lesson}"), Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(r, Request::get(path).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, cards) = call(r, Method::GET, "/api/flashcards", Some(&token), None).await;
        let cards = cards["flashcards"].as_array().unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0]["id"], card["id"]);
        assert!(cards[0]["course_id"].is_null());
    }
}
