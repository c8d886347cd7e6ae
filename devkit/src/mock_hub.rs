/*!
Mock Home Assistant REST API

Serves on an ephemeral localhost port:
- `GET /api/` -> 200 `{"message": "API running."}`
- `POST /api/states/{entity_id}` -> records the call, 201 (or a configured failure)
*/

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub entity_id: String,
    pub body: Value,
    pub authorization: Option<String>,
}

#[derive(Clone, Default)]
struct HubState {
    posts: Arc<Mutex<Vec<RecordedPost>>>,
    failures: Arc<Mutex<HashMap<String, u16>>>,
}

pub struct MockHub {
    addr: SocketAddr,
    state: HubState,
    server: JoinHandle<()>,
}

impl MockHub {
    pub async fn start() -> Result<Self> {
        let state = HubState::default();
        let app = Router::new()
            .route("/api/", get(api_status))
            .route("/api/states/{entity_id}", post(post_state))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::warn!(error = %e, "mock hub stopped");
            }
        });

        Ok(Self { addr, state, server })
    }

    /// Base URL without trailing slash, e.g. `http://127.0.0.1:40123`
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Answer every POST for `entity_id` with `status` instead of 201.
    pub fn fail_entity(&self, entity_id: &str, status: u16) {
        self.state.failures.lock().insert(entity_id.to_string(), status);
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.state.posts.lock().clone()
    }

    pub fn posts_for(&self, entity_id: &str) -> Vec<RecordedPost> {
        self.state
            .posts
            .lock()
            .iter()
            .filter(|post| post.entity_id == entity_id)
            .cloned()
            .collect()
    }
}

impl Drop for MockHub {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn api_status() -> Json<Value> {
    Json(json!({ "message": "API running." }))
}

async fn post_state(
    State(hub): State<HubState>,
    Path(entity_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    hub.posts.lock().push(RecordedPost {
        entity_id: entity_id.clone(),
        body: body.clone(),
        authorization,
    });

    let failure = hub.failures.lock().get(&entity_id).copied();
    match failure.and_then(|code| StatusCode::from_u16(code).ok()) {
        Some(status) => (status, Json(json!({ "message": "simulated failure" }))),
        None => (
            StatusCode::CREATED,
            Json(json!({
                "entity_id": entity_id,
                "state": body.get("state").cloned().unwrap_or(Value::Null),
                "attributes": body.get("attributes").cloned().unwrap_or_else(|| json!({})),
            })),
        ),
    }
}
