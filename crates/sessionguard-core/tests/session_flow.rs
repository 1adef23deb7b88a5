//! End-to-end session flows over real HTTP against a loopback backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use sessionguard_core::auth::MemoryStorage;
use sessionguard_core::{
    Admission, ApiRequest, Config, HttpTransport, LogoutReason, Origin, RequestError,
    RouteRequirements, Role, SessionEvent,
};

struct BackendState {
    valid_access: String,
    refresh_accepted: bool,
    refresh_calls: usize,
}

type Backend = Arc<Mutex<BackendState>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn unauthorized() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"detail": "Given token not valid for any token type"})),
    )
}

async fn token(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body["email"] == "customer@example.com" && body["password"] == "correct horse" {
        (StatusCode::OK, Json(json!({"access": "A1", "refresh": "R1"})))
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "No active account found with the given credentials"})),
        )
    }
}

async fn token_refresh(State(backend): State<Backend>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let mut state = backend.lock().unwrap();
    state.refresh_calls += 1;
    if state.refresh_accepted && body["refresh"] == "R1" {
        state.valid_access = "A2".to_string();
        (StatusCode::OK, Json(json!({"access": "A2"})))
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Token is invalid or expired"})),
        )
    }
}

async fn permissions(State(backend): State<Backend>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    if bearer(&headers) != Some(backend.lock().unwrap().valid_access.clone()) {
        return unauthorized();
    }
    (
        StatusCode::OK,
        Json(json!({
            "user": {"id": 7, "email": "customer@example.com", "user_type": "customer"},
            "permissions": {"can_view_dashboard": true, "can_submit_claims": true, "can_approve_claims": false},
            "customer_profile": null,
            "dashboard_route": "/dashboard"
        })),
    )
}

async fn claims(State(backend): State<Backend>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    if bearer(&headers) != Some(backend.lock().unwrap().valid_access.clone()) {
        return unauthorized();
    }
    (StatusCode::OK, Json(json!([{"id": 1, "status": "submitted"}])))
}

async fn spawn_backend(refresh_accepted: bool) -> (Backend, String) {
    let backend = Arc::new(Mutex::new(BackendState {
        valid_access: "A1".to_string(),
        refresh_accepted,
        refresh_calls: 0,
    }));
    let app = Router::new()
        .route("/auth/token", post(token))
        .route("/auth/token/refresh", post(token_refresh))
        .route("/permissions", get(permissions))
        .route("/claims", get(claims))
        .with_state(Arc::clone(&backend));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (backend, format!("http://{}", addr))
}

fn origin(base_url: &str) -> Origin {
    let config = Config {
        backend_url: base_url.to_string(),
        ..Config::default()
    };
    let transport = HttpTransport::new(base_url, Duration::from_secs(5)).unwrap();
    Origin::new(config, Arc::new(MemoryStorage::new()), Arc::new(transport))
}

fn record(session: &sessionguard_core::Session) -> (Arc<Mutex<Vec<SessionEvent>>>, sessionguard_core::Subscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let subscription = session.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    (events, subscription)
}

#[tokio::test]
async fn test_expired_access_is_refreshed_and_request_retried() {
    init_tracing();
    let (backend, url) = spawn_backend(true).await;
    let session = origin(&url).open_context();

    session.login("customer@example.com", "correct horse").await.unwrap();
    // Access A1 expires on the backend
    backend.lock().unwrap().valid_access = "EXPIRED".to_string();

    let response = session.execute(ApiRequest::get("/claims")).await.unwrap();
    assert_eq!(response.status, 200);
    let claims: Vec<Value> = response.json().unwrap();
    assert_eq!(claims.len(), 1);

    let credential = session.credential().unwrap();
    assert_eq!(credential.access, "A2");
    assert_eq!(credential.refresh.as_deref(), Some("R1"));
    assert_eq!(backend.lock().unwrap().refresh_calls, 1);
}

#[tokio::test]
async fn test_rejected_refresh_forces_logout() {
    init_tracing();
    let (backend, url) = spawn_backend(false).await;
    let session = origin(&url).open_context();
    session.login("customer@example.com", "correct horse").await.unwrap();
    let (events, _subscription) = record(&session);
    backend.lock().unwrap().valid_access = "EXPIRED".to_string();

    let err = session.execute(ApiRequest::get("/claims")).await.unwrap_err();
    assert!(matches!(err, RequestError::Unauthorized));
    assert!(!session.is_authenticated());
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            SessionEvent::CredentialChanged,
            SessionEvent::ForceLogout(LogoutReason::RefreshFailed),
        ]
    );
    assert_eq!(
        session.admit("/claims", &RouteRequirements::authenticated()).await,
        Admission::RedirectToLogin {
            login_route: "/login".to_string(),
            return_to: "/claims".to_string(),
        }
    );
}

#[tokio::test]
async fn test_bad_password_is_reported_without_logout() {
    init_tracing();
    let (backend, url) = spawn_backend(true).await;
    let session = origin(&url).open_context();
    let (events, _subscription) = record(&session);

    let err = session.login("customer@example.com", "hunter2").await.unwrap_err();
    assert_eq!(err.status(), Some(401));
    assert_eq!(err.message(), "No active account found with the given credentials");
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(backend.lock().unwrap().refresh_calls, 0);
}

#[tokio::test]
async fn test_permissions_drive_route_admission() {
    init_tracing();
    let (_backend, url) = spawn_backend(true).await;
    let session = origin(&url).open_context();
    session.login("customer@example.com", "correct horse").await.unwrap();

    let snapshot = session.permissions(false).await.unwrap();
    assert_eq!(snapshot.role, Role::Customer);
    assert!(snapshot.has_capability("can_submit_claims"));

    let submit = RouteRequirements::authenticated().require_capability("can_submit_claims");
    assert_eq!(session.admit("/claims/new", &submit).await, Admission::Render);

    let staff = RouteRequirements::roles([Role::Underwriter, Role::Manager]);
    assert_eq!(
        session.admit("/admin-dashboard", &staff).await,
        Admission::Redirect {
            to: "/dashboard".to_string()
        }
    );
    assert_eq!(
        session.admit("/claims/review", &staff.clone().inline_panel()).await,
        Admission::NotAuthorized
    );
}
