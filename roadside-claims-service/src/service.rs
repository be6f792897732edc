use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{Next, from_fn},
    response::{
        Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use claim_flow::{
    AnalyticsAssistant, AnalyticsMessage, ArrangedService, BroadcastPublisher, ChatModel, Claim,
    ClaimError, ClaimStore, ClaimsSummary, ConversationConfig, ConversationRunner, Notification,
    PolicyDirectory, Stage, TranscriptEntry, TurnRequest,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

type ApiResult<T> = Result<Json<T>, ApiError>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

/// Maps a library failure to a status and a body safe to show the driver.
/// The detail only goes to the log.
fn claim_error(claim_id: Uuid, e: ClaimError) -> ApiError {
    let status = match &e {
        ClaimError::ClaimNotFound(_) => StatusCode::NOT_FOUND,
        ClaimError::VersionConflict { .. } => StatusCode::CONFLICT,
        _ if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::NOT_FOUND {
        info!(claim_id = %claim_id, "Claim not found");
    } else {
        error!(claim_id = %claim_id, error = %e, status = %status, "Claim request failed");
    }
    (status, Json(json!({ "error": e.user_message() })))
}

fn analytics_error(e: ClaimError) -> ApiError {
    let status = if e.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    error!(error = %e, status = %status, "Analytics request failed");
    (status, Json(json!({ "error": e.user_message() })))
}

#[derive(Clone)]
pub struct AppState {
    pub runner: ConversationRunner,
    pub analytics: AnalyticsAssistant,
    pub events: BroadcastPublisher,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ClaimStore>,
        directory: Arc<dyn PolicyDirectory>,
        model: Arc<dyn ChatModel>,
        config: ConversationConfig,
    ) -> Self {
        let events = BroadcastPublisher::default();
        let analytics = AnalyticsAssistant::new(store.clone(), model.clone(), config.model_timeout);
        let runner = ConversationRunner::new(store, directory, model, config)
            .with_publisher(Arc::new(events.clone()));
        Self {
            runner,
            analytics,
            events,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CreateClaimRequest {
    #[serde(default)]
    greeting: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRequest {
    user_message: String,
    #[serde(default)]
    conversation_history: Vec<TranscriptEntry>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
    status: Stage,
    claim: Claim,
}

#[derive(Debug, Deserialize)]
struct AnalyticsQuestion {
    message: String,
    #[serde(default)]
    conversation_history: Vec<AnalyticsMessage>,
}

#[derive(Debug, Serialize)]
struct AnalyticsAnswer {
    message: String,
}

#[derive(Debug, Serialize)]
struct ClaimView {
    claim: Claim,
    services: Vec<ArrangedService>,
    notifications: Vec<Notification>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/claims", post(create_claim).get(list_claims))
        .route("/claims/{id}", get(get_claim))
        .route("/claims/{id}/messages", post(post_message))
        .route("/claims/{id}/events", get(claim_events))
        .route("/analytics", get(analytics_summary))
        .route("/analytics/ask", post(ask_analytics))
        .layer(
            ServiceBuilder::new()
                .layer(from_fn(correlation_id_middleware))
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(app_state)
}

/// Runs every request inside an `http_request` span keyed by a fresh
/// correlation id, which is also echoed back to the caller.
async fn correlation_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let correlation_id = Uuid::new_v4().to_string();
    let header = HeaderValue::from_str(&correlation_id).ok();
    if let Some(value) = header.clone() {
        request.headers_mut().insert("x-correlation-id", value);
    }

    let span = tracing::info_span!(
        "http_request",
        correlation_id = %correlation_id,
        method = %request.method(),
        path = %request.uri().path()
    );
    let mut response = next.run(request).instrument(span).await;
    if let Some(value) = header {
        response.headers_mut().insert("x-correlation-id", value);
    }
    response
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Roadside Claims Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Conversational roadside assistance claims driven by LLM tool calling",
        "endpoints": {
            "POST /claims": "Start a new claim",
            "GET /claims": "Every claim, newest first",
            "GET /claims/{id}": "Claim snapshot with arranged services and notifications",
            "POST /claims/{id}/messages": "Send the driver's next message",
            "GET /claims/{id}/events": "Server-sent claim updates",
            "GET /analytics": "Portfolio figures across all claims",
            "POST /analytics/ask": "Ask the analytics assistant about the claims",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> &'static str {
    "OK"
}

async fn create_claim(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Claim>), ApiError> {
    let request: CreateClaimRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateClaimRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            warn!(error = %e, "Invalid create claim body");
            bad_request_error("Request body must be a JSON object")
        })?
    };

    let claim = state
        .runner
        .create_claim(request.greeting.as_deref())
        .await
        .map_err(|e| claim_error(Uuid::nil(), e))?;
    Ok((StatusCode::CREATED, Json(claim)))
}

async fn list_claims(State(state): State<AppState>) -> ApiResult<Vec<Claim>> {
    let claims = state
        .runner
        .store()
        .list_claims()
        .await
        .map_err(analytics_error)?;
    Ok(Json(claims))
}

async fn get_claim(
    State(state): State<AppState>,
    Path(claim_id): Path<Uuid>,
) -> ApiResult<ClaimView> {
    let store = state.runner.store();
    let claim = store
        .load(claim_id)
        .await
        .map_err(|e| claim_error(claim_id, e))?
        .ok_or_else(|| claim_error(claim_id, ClaimError::ClaimNotFound(claim_id)))?;
    let services = store
        .list_services(claim_id)
        .await
        .map_err(|e| claim_error(claim_id, e))?;
    let notifications = store
        .list_notifications(claim_id)
        .await
        .map_err(|e| claim_error(claim_id, e))?;

    Ok(Json(ClaimView {
        claim,
        services,
        notifications,
    }))
}

async fn post_message(
    State(state): State<AppState>,
    Path(claim_id): Path<Uuid>,
    Json(request): Json<MessageRequest>,
) -> ApiResult<MessageResponse> {
    if request.user_message.trim().is_empty() {
        return Err(bad_request_error("user_message must not be empty"));
    }
    info!(
        claim_id = %claim_id,
        message_length = request.user_message.len(),
        history = request.conversation_history.len(),
        "Processing driver message"
    );

    let outcome = state
        .runner
        .run_turn(TurnRequest {
            claim_id,
            user_message: request.user_message,
            prior_transcript: request.conversation_history,
        })
        .await
        .map_err(|e| claim_error(claim_id, e))?;

    Ok(Json(MessageResponse {
        message: outcome.message,
        status: outcome.stage,
        claim: outcome.claim,
    }))
}

async fn analytics_summary(State(state): State<AppState>) -> ApiResult<ClaimsSummary> {
    let summary = state.analytics.summary().await.map_err(analytics_error)?;
    Ok(Json(summary))
}

async fn ask_analytics(
    State(state): State<AppState>,
    Json(request): Json<AnalyticsQuestion>,
) -> ApiResult<AnalyticsAnswer> {
    if request.message.trim().is_empty() {
        return Err(bad_request_error("message must not be empty"));
    }
    info!(
        message_length = request.message.len(),
        history = request.conversation_history.len(),
        "Processing analytics question"
    );
    let message = state
        .analytics
        .ask(&request.message, &request.conversation_history)
        .await
        .map_err(analytics_error)?;
    Ok(Json(AnalyticsAnswer { message }))
}

async fn claim_events(
    State(state): State<AppState>,
    Path(claim_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Subscribe before the existence check so no commit slips between them.
    let rx = state.events.subscribe();
    state
        .runner
        .store()
        .load(claim_id)
        .await
        .map_err(|e| claim_error(claim_id, e))?
        .ok_or_else(|| claim_error(claim_id, ClaimError::ClaimNotFound(claim_id)))?;

    let stream = futures::stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.claim_id() == claim_id => {
                    let payload =
                        serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                    let event = Event::default().event("claim").data(payload);
                    return Some((Ok::<_, Infallible>(event), rx));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        claim_id = %claim_id,
                        skipped,
                        "Event subscriber lagged, dropping old events"
                    );
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}
