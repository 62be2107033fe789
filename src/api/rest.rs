// =============================================================================
// Control API — account CRUD and gateway control, Axum 0.7
// =============================================================================
//
// JSON over HTTP. Status codes: 200 read/update/completed action, 201
// create, 202 accepted (async control action still in flight), 204
// delete, 400 validation, 404 not found, 409 duplicate, 503 store or
// shutdown. Error body: {"error": {"kind", "message"}}.
//
// Control actions are relayed to the Supervisor over its command channel
// and awaited up to the configured ack budget; a slower action answers
// 202 and finishes in the background, observable via the event stream.
// =============================================================================

use std::sync::atomic::Ordering;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::errors::HubError;
use crate::events::{ActionStatus, Event, EventKind};
use crate::recovery::RecoveryCommand;
use crate::store::{Account, AccountDraft, AccountPatch};
use crate::supervisor::SupervisorCommand;

use super::ApiContext;

/// Build the full router: Control API plus the `/ws` upgrade endpoint.
pub fn router(ctx: ApiContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/accounts", get(list_accounts).post(create_account))
        .route(
            "/accounts/:id",
            get(get_account).put(update_account).delete(delete_account),
        )
        .route("/accounts/:id/start", post(control_start))
        .route("/accounts/:id/stop", post(control_stop))
        .route("/accounts/:id/restart", post(control_restart))
        .route("/health", get(health))
        .route("/ws", get(super::ws::ws_handler))
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Accounts
// =============================================================================

async fn list_accounts(State(ctx): State<ApiContext>) -> Result<Json<Vec<Account>>, HubError> {
    Ok(Json(ctx.store.list()?))
}

async fn get_account(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<Account>, HubError> {
    Ok(Json(ctx.store.get(&id)?))
}

async fn create_account(
    State(ctx): State<ApiContext>,
    Json(draft): Json<AccountDraft>,
) -> Result<impl IntoResponse, HubError> {
    let account = ctx.store.create(draft)?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn update_account(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
    Json(patch): Json<AccountPatch>,
) -> Result<Json<Account>, HubError> {
    Ok(Json(ctx.store.update(&id, patch)?))
}

/// Delete is legal while the session runs: the session is torn down first,
/// then the row is removed.
async fn delete_account(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, HubError> {
    ctx.store.get(&id)?;

    if ctx.state.session_of(&id).is_some() {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let _ = ctx
            .state
            .supervisor_tx
            .send(SupervisorCommand::Stop {
                account_id: id.clone(),
                reply: Some(reply_tx),
            })
            .await;
        let budget = ctx.state.config.read().control_ack_timeout_ms;
        let _ = tokio::time::timeout(
            tokio::time::Duration::from_millis(budget),
            reply_rx,
        )
        .await;
    }

    ctx.store.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Control actions
// =============================================================================

async fn control_start(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, HubError> {
    dispatch_action(ctx, id, "start").await
}

async fn control_stop(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, HubError> {
    dispatch_action(ctx, id, "stop").await
}

async fn control_restart(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, HubError> {
    dispatch_action(ctx, id, "restart").await
}

async fn dispatch_action(
    ctx: ApiContext,
    account_id: String,
    action: &'static str,
) -> Result<axum::response::Response, HubError> {
    if !ctx.state.accepting_actions.load(Ordering::Relaxed) {
        return Err(HubError::DependencyUnavailable("hub is shutting down".into()));
    }
    // 404 before anything else touches the session.
    ctx.store.get(&account_id)?;

    let requested = ctx.state.bus.publish(EventKind::ControlActionRequested {
        action: action.to_string(),
        account_id: account_id.clone(),
    });
    info!(account_id = %account_id, action, "control action requested");

    // An operator restart is also the manual reset of the recovery
    // attempt counter for a parked account.
    if action == "restart" {
        let _ = ctx
            .state
            .recovery_tx
            .send(RecoveryCommand::ResetAttempts {
                account_id: account_id.clone(),
            })
            .await;
    }

    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    let command = match action {
        "start" => SupervisorCommand::Start {
            account_id: account_id.clone(),
            reply: Some(reply_tx),
        },
        "stop" => SupervisorCommand::Stop {
            account_id: account_id.clone(),
            reply: Some(reply_tx),
        },
        _ => SupervisorCommand::Restart {
            account_id: account_id.clone(),
            reply: Some(reply_tx),
        },
    };
    ctx.state
        .supervisor_tx
        .send(command)
        .await
        .map_err(|_| HubError::DependencyUnavailable("supervisor unavailable".into()))?;

    let budget = ctx.state.config.read().control_ack_timeout_ms;
    let outcome = tokio::time::timeout(
        tokio::time::Duration::from_millis(budget),
        reply_rx,
    )
    .await;

    match outcome {
        Ok(Ok(Ok(()))) => Ok(completed(&ctx, requested.correlation_id, action, &account_id)),
        // Stop on an already-stopped session is an idempotent no-op.
        Ok(Ok(Err(HubError::NotFound(_)))) if action == "stop" => {
            Ok(completed(&ctx, requested.correlation_id, action, &account_id))
        }
        Ok(Ok(Err(e))) => {
            ctx.state.bus.publish_event(Event::correlated(
                EventKind::ControlActionCompleted {
                    action: action.to_string(),
                    account_id: account_id.clone(),
                    status: ActionStatus::Failed,
                    message: Some(e.to_string()),
                },
                requested.correlation_id,
            ));
            Err(e)
        }
        Ok(Err(_)) | Err(_) => {
            // Ack not delivered inside the budget: accepted-with-async.
            ctx.state.bus.publish_event(Event::correlated(
                EventKind::ControlActionCompleted {
                    action: action.to_string(),
                    account_id: account_id.clone(),
                    status: ActionStatus::Accepted,
                    message: None,
                },
                requested.correlation_id,
            ));
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({
                    "status": "accepted",
                    "action": action,
                    "account_id": account_id,
                })),
            )
                .into_response())
        }
    }
}

fn completed(
    ctx: &ApiContext,
    correlation_id: Uuid,
    action: &str,
    account_id: &str,
) -> axum::response::Response {
    ctx.state.bus.publish_event(Event::correlated(
        EventKind::ControlActionCompleted {
            action: action.to_string(),
            account_id: account_id.to_string(),
            status: ActionStatus::Completed,
            message: None,
        },
        correlation_id,
    ));
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "completed",
            "action": action,
            "account_id": account_id,
        })),
    )
        .into_response()
}

// =============================================================================
// Health
// =============================================================================

/// Always answers, even with subsystems degraded.
async fn health(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.build_snapshot())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::HubState;
    use crate::bus::EventBus;
    use crate::config::HubConfig;
    use crate::store::AccountStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tower::util::ServiceExt;

    fn app() -> (Router, ApiContext) {
        let bus = EventBus::new(256);
        let (sup_tx, mut sup_rx) = mpsc::channel(32);
        let (rec_tx, _rec_rx) = mpsc::channel(8);
        let (agg_tx, _agg_rx) = mpsc::channel(8);
        let mut config = HubConfig::default();
        config.control_ack_timeout_ms = 500;
        let state = Arc::new(HubState::new(config, bus.clone(), sup_tx, rec_tx, agg_tx));
        let store = Arc::new(AccountStore::open_in_memory(bus));

        // Stub supervisor: ack everything as success.
        tokio::spawn(async move {
            while let Some(cmd) = sup_rx.recv().await {
                match cmd {
                    SupervisorCommand::Start { reply: Some(r), .. }
                    | SupervisorCommand::Stop { reply: Some(r), .. }
                    | SupervisorCommand::Restart { reply: Some(r), .. }
                    | SupervisorCommand::Migrate { reply: Some(r), .. } => {
                        let _ = r.send(Ok(()));
                    }
                    _ => {}
                }
            }
        });

        let ctx = ApiContext { state, store };
        (router(ctx.clone()), ctx)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        }
    }

    fn draft_json(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "gateway_type": "CTP",
            "settings": {"md_address": "ws://127.0.0.1:9001"},
            "priority": 1,
        })
    }

    #[tokio::test]
    async fn create_returns_201_and_duplicate_409() {
        let (app, _ctx) = app();

        let response = app
            .clone()
            .oneshot(json_request("POST", "/accounts", draft_json("a1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["id"], "a1");
        assert_eq!(body["gateway_type"], "CTP");

        let response = app
            .clone()
            .oneshot(json_request("POST", "/accounts", draft_json("a1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "Duplicate");
    }

    #[tokio::test]
    async fn get_missing_account_is_404() {
        let (app, _ctx) = app();
        let response = app
            .oneshot(empty_request("GET", "/accounts/ghost"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "NotFound");
    }

    #[tokio::test]
    async fn update_and_delete_roundtrip() {
        let (app, _ctx) = app();
        app.clone()
            .oneshot(json_request("POST", "/accounts", draft_json("a1")))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/accounts/a1",
                serde_json::json!({"priority": 7}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["priority"], 7);

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", "/accounts/a1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty_request("DELETE", "/accounts/a1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn control_start_acks_as_completed() {
        let (app, _ctx) = app();
        app.clone()
            .oneshot(json_request("POST", "/accounts", draft_json("a1")))
            .await
            .unwrap();

        let response = app
            .oneshot(empty_request("POST", "/accounts/a1/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["action"], "start");
    }

    #[tokio::test]
    async fn control_on_missing_account_is_404() {
        let (app, _ctx) = app();
        let response = app
            .oneshot(empty_request("POST", "/accounts/ghost/restart"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn control_rejected_while_shutting_down() {
        let (app, ctx) = app();
        app.clone()
            .oneshot(json_request("POST", "/accounts", draft_json("a1")))
            .await
            .unwrap();
        ctx.state.accepting_actions.store(false, Ordering::Relaxed);

        let response = app
            .oneshot(empty_request("POST", "/accounts/a1/stop"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_always_answers() {
        let (app, _ctx) = app();
        let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert!(body["sessions"].is_array());
        assert!(body["health"].is_array());
        assert!(body["bindings"].is_array());
        assert!(body["recovery"].is_array());
    }

    #[tokio::test]
    async fn validation_error_maps_to_400() {
        let (app, _ctx) = app();
        let mut bad = draft_json("a1");
        bad["priority"] = serde_json::json!(0);
        let response = app
            .oneshot(json_request("POST", "/accounts", bad))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "ValidationError");
    }

    #[tokio::test]
    async fn gateway_type_is_validated_by_serde() {
        let (app, _ctx) = app();
        let bad = serde_json::json!({"id": "a1", "gateway_type": "XTP"});
        let response = app
            .oneshot(json_request("POST", "/accounts", bad))
            .await
            .unwrap();
        // Unknown enum variants are rejected at the extractor layer.
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
