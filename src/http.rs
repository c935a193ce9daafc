//! HTTP surface — tracking redirects, provider webhooks, and read-only
//! campaign endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::TimestampPolicy;
use crate::events::{
    DeliveryEnvelope, EventIngestor, InboundEmailPayload, SchedulingEnvelope, SchedulingHandler,
};
use crate::inbound::SignalProcessor;
use crate::outbound::Outbox;
use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub clock: Arc<dyn Clock>,
    pub policy: TimestampPolicy,
    pub ingestor: Arc<EventIngestor>,
    pub scheduling: Arc<SchedulingHandler>,
    pub signals: Arc<SignalProcessor>,
    pub outbox: Arc<Outbox>,
}

/// Build the engine router.
pub fn engine_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/track/open/{tracking_id}", get(track_open))
        .route("/track/click/{tracking_id}", get(track_click))
        .route("/webhooks/delivery", post(delivery_webhook))
        .route("/webhooks/inbound", post(inbound_webhook))
        .route("/webhooks/scheduling", post(scheduling_webhook))
        .route("/api/send", post(send_campaign))
        .route("/api/contacts", get(list_contacts))
        .route("/api/stats", get(stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "outreach-engine"
    }))
}

// ── Tracking ────────────────────────────────────────────────────────

/// Open pixel hit. Always 204: the caller is an email renderer that
/// only wants an image, and tracking is best-effort.
async fn track_open(State(state): State<AppState>, Path(tracking_id): Path<String>) -> StatusCode {
    if let Err(e) = state
        .db
        .mark_opened(&tracking_id, state.clock.now(), state.policy)
        .await
    {
        warn!(tracking_id = %tracking_id, error = %e, "Open tracking failed");
    } else {
        debug!(tracking_id = %tracking_id, "Open recorded");
    }
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct ClickParams {
    url: Option<String>,
}

/// Click redirect. The recipient lands on the original URL whether or
/// not the click could be recorded.
async fn track_click(
    State(state): State<AppState>,
    Path(tracking_id): Path<String>,
    Query(params): Query<ClickParams>,
) -> Response {
    let Some(url) = params.url else {
        return (StatusCode::BAD_REQUEST, "Missing URL").into_response();
    };

    if let Err(e) = state
        .db
        .record_click(&tracking_id, state.clock.now(), state.policy)
        .await
    {
        warn!(tracking_id = %tracking_id, error = %e, "Click tracking failed");
    } else {
        debug!(tracking_id = %tracking_id, url = %url, "Click recorded");
    }

    Redirect::to(&url).into_response()
}

// ── Webhooks ────────────────────────────────────────────────────────

/// Provider events arrive at-least-once; any parseable envelope gets a
/// 204 so the provider stops retrying it.
async fn delivery_webhook(
    State(state): State<AppState>,
    Json(envelope): Json<DeliveryEnvelope>,
) -> StatusCode {
    if let Err(e) = state.ingestor.ingest(&envelope).await {
        warn!(event = %envelope.event, error = %e, "Delivery event ingestion failed");
    }
    StatusCode::NO_CONTENT
}

async fn inbound_webhook(
    State(state): State<AppState>,
    Json(payload): Json<InboundEmailPayload>,
) -> StatusCode {
    match payload.into_signal() {
        Some(signal) => {
            if let Err(e) = state.signals.process(&signal).await {
                warn!(from = %signal.from, error = %e, "Inbound webhook processing failed");
            }
        }
        None => warn!("Inbound webhook without sender dropped"),
    }
    StatusCode::NO_CONTENT
}

async fn scheduling_webhook(
    State(state): State<AppState>,
    Json(envelope): Json<SchedulingEnvelope>,
) -> StatusCode {
    if let Err(e) = state.scheduling.handle(&envelope).await {
        warn!(event = %envelope.event, error = %e, "Scheduling event handling failed");
    }
    StatusCode::NO_CONTENT
}

// ── Campaign API ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SendRequest {
    to: String,
    subject: String,
    html: String,
    #[serde(default)]
    campaign: Option<String>,
}

async fn send_campaign(State(state): State<AppState>, Json(body): Json<SendRequest>) -> Response {
    match state
        .outbox
        .send_campaign(&body.to, &body.subject, &body.html, body.campaign.as_deref())
        .await
    {
        Ok(message) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "id": message.id,
                "message_id": message.message_id,
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(recipient = %body.to, error = %e, "Campaign send failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn list_contacts(State(state): State<AppState>) -> Response {
    match state.db.list_contacts().await {
        Ok(contacts) => {
            let rows: Vec<serde_json::Value> = contacts
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "email": c.email,
                        "current_stage": c.current_stage.as_str(),
                        "stage_updated_at": c.stage_updated_at.to_rfc3339(),
                        "created_at": c.created_at.to_rfc3339(),
                    })
                })
                .collect();
            Json(rows).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn stats(State(state): State<AppState>) -> Response {
    match state.db.campaign_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    warn!(error = %e, "Request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ResponseClassifier;
    use crate::clock::ManualClock;
    use crate::error::DeliveryError;
    use crate::followup::FollowUpScheduler;
    use crate::outbound::{Mailer, SendReceipt, TemplateRenderer};
    use crate::stage::StageTracker;
    use crate::store::{LibSqlBackend, OutboundMessage};
    use crate::tracking::{PixelAttachment, TrackingRewriter};
    use async_trait::async_trait;
    use chrono::Utc;

    struct StubMailer;

    #[async_trait]
    impl Mailer for StubMailer {
        async fn send(
            &self,
            _to: &str,
            _subject: &str,
            _html: &str,
            _pixel: Option<&PixelAttachment>,
        ) -> Result<SendReceipt, DeliveryError> {
            Ok(SendReceipt {
                message_id: format!("{}@outreach.example", uuid::Uuid::new_v4()),
            })
        }
    }

    /// Start the router on a random port, return (base_url, db).
    async fn start_server() -> (String, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let mailer: Arc<dyn Mailer> = Arc::new(StubMailer);
        let tracker = Arc::new(StageTracker::new(Arc::clone(&db), Arc::clone(&clock)));
        let renderer = Arc::new(TemplateRenderer::new("https://calendly.com/demo"));
        let rewriter = Arc::new(TrackingRewriter::new(
            "https://track.example",
            "calendly.com",
        ));

        let state = AppState {
            db: Arc::clone(&db),
            clock: Arc::clone(&clock),
            policy: TimestampPolicy::FirstWins,
            ingestor: Arc::new(EventIngestor::new(
                Arc::clone(&db),
                Arc::clone(&clock),
                TimestampPolicy::FirstWins,
            )),
            scheduling: Arc::new(SchedulingHandler::new(
                Arc::clone(&tracker),
                Arc::clone(&mailer),
                renderer.clone(),
                Arc::clone(&db),
                Arc::clone(&clock),
            )),
            signals: Arc::new(SignalProcessor::new(
                Arc::clone(&db),
                ResponseClassifier::new("calendly.com"),
                Arc::clone(&tracker),
                Arc::clone(&clock),
            )),
            outbox: Arc::new(Outbox::new(
                Arc::clone(&db),
                mailer,
                rewriter,
                Arc::new(FollowUpScheduler::new(Arc::clone(&db), vec![3, 7, 14])),
                tracker,
                clock,
            )),
        };

        let app = engine_routes(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        (format!("http://127.0.0.1:{port}"), db)
    }

    async fn seed_outbound(db: &Arc<dyn Database>, id: &str) {
        db.insert_outbound(&OutboundMessage::new(
            id,
            format!("{id}@outreach.example"),
            "a@x.com",
            "Intro",
            "<p>hi</p>",
            None,
            Utc::now(),
        ))
        .await
        .unwrap();
    }

    fn no_redirect_client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (base, _db) = start_server().await;
        let body: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn open_endpoint_marks_message_and_returns_204() {
        let (base, db) = start_server().await;
        seed_outbound(&db, "t-1").await;

        let response = reqwest::get(format!("{base}/track/open/t-1")).await.unwrap();
        assert_eq!(response.status(), 204);

        let message = db.get_outbound("t-1").await.unwrap().unwrap();
        assert!(message.opened);
    }

    #[tokio::test]
    async fn open_for_unknown_id_still_204() {
        let (base, _db) = start_server().await;
        let response = reqwest::get(format!("{base}/track/open/nope")).await.unwrap();
        assert_eq!(response.status(), 204);
    }

    #[tokio::test]
    async fn click_redirects_to_original_url() {
        let (base, db) = start_server().await;
        seed_outbound(&db, "t-1").await;

        let response = no_redirect_client()
            .get(format!(
                "{base}/track/click/t-1?url=https%3A%2F%2Fexample.com%2Fpricing"
            ))
            .send()
            .await
            .unwrap();

        assert!(response.status().is_redirection());
        assert_eq!(
            response.headers()["location"],
            "https://example.com/pricing"
        );

        let message = db.get_outbound("t-1").await.unwrap().unwrap();
        assert_eq!(message.click_count, 1);
    }

    #[tokio::test]
    async fn click_without_url_is_400() {
        let (base, _db) = start_server().await;
        let response = reqwest::get(format!("{base}/track/click/t-1")).await.unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn delivery_webhook_applies_event() {
        let (base, db) = start_server().await;
        seed_outbound(&db, "t-1").await;

        let response = reqwest::Client::new()
            .post(format!("{base}/webhooks/delivery"))
            .json(&serde_json::json!({
                "event": "delivered",
                "message": { "headers": { "message-id": "<t-1@outreach.example>" } }
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);

        let message = db.get_outbound("t-1").await.unwrap().unwrap();
        assert!(message.delivered);
    }

    #[tokio::test]
    async fn delivery_webhook_without_message_id_is_absorbed() {
        let (base, _db) = start_server().await;
        let response = reqwest::Client::new()
            .post(format!("{base}/webhooks/delivery"))
            .json(&serde_json::json!({ "event": "opened" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);
    }

    #[tokio::test]
    async fn send_endpoint_creates_campaign() {
        let (base, db) = start_server().await;

        let response = reqwest::Client::new()
            .post(format!("{base}/api/send"))
            .json(&serde_json::json!({
                "to": "dr.smith@clinic.example",
                "subject": "Modernize your practice",
                "html": "<body><p>hello</p></body>",
                "campaign": "practice-automation"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);

        let body: serde_json::Value = response.json().await.unwrap();
        let id = body["id"].as_str().unwrap();
        assert_eq!(db.follow_ups_for(id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn contacts_and_stats_round_trip() {
        let (base, db) = start_server().await;
        db.insert_contact("a@x.com", crate::stage::Stage::New, Utc::now())
            .await
            .unwrap();

        let contacts: serde_json::Value = reqwest::get(format!("{base}/api/contacts"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(contacts.as_array().unwrap().len(), 1);
        assert_eq!(contacts[0]["current_stage"], "new");

        let stats: serde_json::Value = reqwest::get(format!("{base}/api/stats"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["contacts"], 1);
    }
}
