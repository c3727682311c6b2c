use anyhow::Result;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::access_log::{self, AccessLog};
use crate::auth;
use crate::config::Config;
use crate::db::Database;
use crate::handlers::{ai, files, git, iplogs, search, settings, terminal};
use crate::llm::LlmClient;
use crate::session::SessionStore;
use crate::usage::UsageLedger;
use crate::workspace::Workspace;

/// Everything a handler may touch. Cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub workspace: Workspace,
    pub db: Database,
    pub sessions: SessionStore,
    pub usage: UsageLedger,
    pub access_log: AccessLog,
    pub llm: Arc<dyn LlmClient>,
}

impl AppState {
    pub fn new(config: Config, db: Database, llm: Arc<dyn LlmClient>) -> Result<Self> {
        let workspace = Workspace::new(&config.base_path)?;
        let access_log = AccessLog::new(db.clone(), config.should_log_ips());
        Ok(Self {
            workspace,
            sessions: SessionStore::new(db.clone()),
            usage: UsageLedger::new(db.clone()),
            access_log,
            db,
            llm,
            config: Arc::new(config),
        })
    }
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/files", get(files::list))
        .route(
            "/file",
            get(files::read)
                .post(files::write)
                .put(files::write)
                .delete(files::delete)
                .patch(files::rename),
        )
        .route("/search", post(search::search))
        .route("/terminal", post(terminal::run))
        .route("/git", post(git::handle))
        .route("/ai", post(ai::chat))
        .route("/ai/usage", get(ai::usage))
        .route("/config", get(settings::config))
        .route("/iplogs", get(iplogs::list))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ));

    let api = Router::new()
        .route(
            "/auth",
            get(auth::status).post(auth::login).delete(auth::logout),
        )
        .merge(protected);

    let mut app = Router::new().nest("/api", api);

    if let Some(dir) = &state.config.frontend_dir {
        let index = ServeFile::new(dir.join("index.html"));
        app = app.fallback_service(ServeDir::new(dir).fallback(index));
    }

    app.layer(middleware::from_fn_with_state(
        state.clone(),
        access_log::log_requests,
    ))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, Completion};
    use crate::usage::today;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::response::Response;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct MockLlm {
        fail: bool,
        calls: AtomicUsize,
    }

    impl MockLlm {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl LlmClient for MockLlm {
        fn chat(&self, _system: &str, messages: &[ChatMessage]) -> anyhow::Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("provider unavailable");
            }
            Ok(Completion {
                content: format!("echo: {}", messages.last().map(|m| m.content.as_str()).unwrap_or("")),
                tokens: 7,
            })
        }
    }

    struct TestApp {
        _dir: TempDir,
        state: AppState,
        router: Router,
    }

    fn test_app(mut config: Config, llm: Arc<dyn LlmClient>) -> TestApp {
        let dir = TempDir::new().unwrap();
        config.base_path = dir.path().to_path_buf();
        let db = Database::open_in_memory().unwrap();
        let state = AppState::new(config, db, llm).unwrap();
        TestApp {
            router: router(state.clone()),
            state,
            _dir: dir,
        }
    }

    fn with_password(password: &str) -> Config {
        Config {
            password: password.to_string(),
            ..Config::default()
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        router.clone().oneshot(request).await.unwrap()
    }

    fn get_req(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn json_req(method: &str, uri: &str, body: Value, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Log in and return the `name=value` cookie pair
    async fn login(router: &Router, password: &str) -> String {
        let response = send(
            router,
            json_req("POST", "/api/auth", json!({ "password": password }), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        set_cookie.split(';').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_no_password_admits_everyone() {
        let app = test_app(Config::default(), MockLlm::new(false));
        let response = send(&app.router, get_req("/api/config", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let status = body_json(send(&app.router, get_req("/api/auth", None)).await).await;
        assert_eq!(status, json!({ "authenticated": true, "required": false }));
    }

    #[tokio::test]
    async fn test_password_required_without_cookie() {
        let app = test_app(with_password("secret"), MockLlm::new(false));
        let response = send(&app.router, get_req("/api/files", None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = send(
            &app.router,
            get_req("/api/files", Some("c00d_session=not-a-real-token")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_login_sets_cookie_and_admits() {
        let app = test_app(with_password("secret"), MockLlm::new(false));
        let response = send(
            &app.router,
            json_req("POST", "/api/auth", json!({ "password": "secret" }), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(set_cookie.starts_with("c00d_session="));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Path=/"));
        assert!(set_cookie.contains("Max-Age=86400"));

        let cookie = set_cookie.split(';').next().unwrap();
        let token = cookie.trim_start_matches("c00d_session=");
        assert_eq!(token.len(), 64);

        let response = send(&app.router, get_req("/api/files", Some(cookie))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let status = body_json(send(&app.router, get_req("/api/auth", Some(cookie))).await).await;
        assert_eq!(status["authenticated"], true);
        assert_eq!(status["required"], true);
        assert!(status["expires_at"].is_string());

        let status = body_json(send(&app.router, get_req("/api/auth", None)).await).await;
        assert_eq!(status, json!({ "authenticated": false, "required": true }));
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let app = test_app(with_password("secret"), MockLlm::new(false));
        let response = send(
            &app.router,
            json_req("POST", "/api/auth", json!({ "password": "guess" }), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_logout_revokes_session() {
        let app = test_app(with_password("secret"), MockLlm::new(false));
        let cookie = login(&app.router, "secret").await;

        let response = send(
            &app.router,
            Request::builder()
                .method("DELETE")
                .uri("/api/auth")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let cleared = response.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cleared.starts_with("c00d_session=;"));

        let response = send(&app.router, get_req("/api/files", Some(&cookie))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_path_escape_forbidden() {
        let app = test_app(Config::default(), MockLlm::new(false));
        for uri in [
            "/api/file?path=../secret.txt",
            "/api/files?path=..",
            "/api/file?path=a/../../b",
        ] {
            let response = send(&app.router, get_req(uri, None)).await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "uri {}", uri);
            let body = body_json(response).await;
            assert_eq!(body["code"], "access_denied");
        }

        let response = send(
            &app.router,
            json_req(
                "POST",
                "/api/terminal",
                json!({ "command": "ls", "cwd": "../.." }),
                None,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_file_write_read_round_trip() {
        let app = test_app(Config::default(), MockLlm::new(false));
        let response = send(
            &app.router,
            json_req(
                "PUT",
                "/api/file?path=src/new.txt",
                json!({ "content": "hello" }),
                None,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(send(&app.router, get_req("/api/file?path=src/new.txt", None)).await).await;
        assert_eq!(body["content"], "hello");

        let response = send(
            &app.router,
            Request::builder()
                .method("DELETE")
                .uri("/api/file?path=")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(app.state.workspace.root().exists());
    }

    #[tokio::test]
    async fn test_free_tier_quota() {
        let llm = MockLlm::new(false);
        let app = test_app(Config::default(), llm.clone());
        assert!(app.state.config.ai.is_metered());

        for i in 0..20 {
            let response = send(
                &app.router,
                json_req("POST", "/api/ai", json!({ "message": format!("q{}", i) }), None),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK, "call {}", i + 1);
            let body = body_json(response).await;
            assert_eq!(body["success"], true);
        }

        let response = send(
            &app.router,
            json_req("POST", "/api/ai", json!({ "message": "one more" }), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["code"], "quota_exceeded");

        assert_eq!(llm.calls.load(Ordering::SeqCst), 20);
        let usage = app.state.usage.usage(today()).unwrap();
        assert_eq!(usage.request_count, 20);
        assert_eq!(usage.token_count, 140);
    }

    #[tokio::test]
    async fn test_unmetered_config_skips_quota() {
        let mut config = Config::default();
        config.ai.api_key = "sk-test".to_string();
        config.ai.free_daily_limit = 1;
        let app = test_app(config, MockLlm::new(false));

        for _ in 0..3 {
            let response = send(
                &app.router,
                json_req("POST", "/api/ai", json!({ "message": "hi" }), None),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(app.state.usage.usage(today()).unwrap().request_count, 3);

        let usage = body_json(send(&app.router, get_req("/api/ai/usage", None)).await).await;
        assert_eq!(usage["limit"], "unlimited");
    }

    #[tokio::test]
    async fn test_failed_call_consumes_no_quota() {
        let app = test_app(Config::default(), MockLlm::new(true));
        let response = send(
            &app.router,
            json_req("POST", "/api/ai", json!({ "message": "hi" }), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "provider unavailable");
        assert_eq!(app.state.usage.usage(today()).unwrap().request_count, 0);
    }

    #[tokio::test]
    async fn test_allowlist_rejects_other_ips() {
        let mut config = Config::default();
        config.security.allowed_ips = vec!["10.0.0.1".to_string()];
        let app = test_app(config, MockLlm::new(false));

        let request = |ip: &str| {
            Request::builder()
                .uri("/api/config")
                .header("x-forwarded-for", ip)
                .body(Body::empty())
                .unwrap()
        };
        assert_eq!(
            send(&app.router, request("10.0.0.2")).await.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            send(&app.router, request("10.0.0.1")).await.status(),
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_access_log_records_forwarded_ip() {
        let app = test_app(Config::default(), MockLlm::new(false));
        let request = Request::builder()
            .uri("/api/config")
            .header("x-forwarded-for", "203.0.113.5, 10.0.0.1")
            .header(header::USER_AGENT, "test-agent")
            .body(Body::empty())
            .unwrap();
        send(&app.router, request).await;

        let logs = app.state.access_log.recent(10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].ip_address, "203.0.113.5");
        assert_eq!(logs[0].endpoint, "/api/config");
        assert_eq!(logs[0].method, "GET");
        assert_eq!(logs[0].user_agent, "test-agent");

        let request = Request::builder()
            .uri("/api/iplogs?view=unique")
            .header("x-forwarded-for", "203.0.113.5")
            .body(Body::empty())
            .unwrap();
        let body = body_json(send(&app.router, request).await).await;
        assert_eq!(body["view"], "unique");
        assert_eq!(body["ips"][0]["ip_address"], "203.0.113.5");
        assert_eq!(body["ips"][0]["request_count"], 2);
    }

    #[tokio::test]
    async fn test_iplogs_disabled() {
        let mut config = Config::default();
        config.security.log_ips = crate::config::LogIps::Disabled;
        let app = test_app(config, MockLlm::new(false));
        let body = body_json(send(&app.router, get_req("/api/iplogs", None)).await).await;
        assert_eq!(body["enabled"], false);
        assert!(app.state.access_log.recent(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locked_database_does_not_stall_runtime() {
        use std::time::{Duration, Instant};

        let app = test_app(with_password("secret"), MockLlm::new(false));
        let cookie = login(&app.router, "secret").await;

        let db = app.state.db.clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            db.with_conn(|_| {
                locked_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .unwrap();
        });
        locked_rx.recv().unwrap();

        // The access log and the session gate both wait on the lock
        let router = app.router.clone();
        let request = get_req("/api/files", Some(&cookie));
        let pending = tokio::spawn(async move { router.oneshot(request).await.unwrap() });

        // This test runs on a single-threaded runtime, so a handler holding
        // the thread would delay this timer until the lock is released
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(200));

        let response = pending.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        holder.join().unwrap();
    }
}
