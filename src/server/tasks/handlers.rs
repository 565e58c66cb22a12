use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    response::{
        Sse,
        sse::{Event, KeepAlive},
    },
    routing::get,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::server::{
    config::AppState,
    scanner::events::{ScanEvent, ScanEventKind},
    shared::types::users::UserId,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub fn create_router() -> Router<Arc<AppState>> {
    Router::new().route("/stream", get(tasks_stream))
}

/// One SSE frame. Clients tolerate unknown and missing keys, so optional
/// fields are simply omitted.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamFrame {
    pub event_type: String,
    pub status: String,
    pub payload: FramePayload,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FramePayload {
    pub task_id: Uuid,
    pub seq: u64,
    pub collector: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_processed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_events: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl StreamFrame {
    pub fn from_event(event: &ScanEvent) -> Self {
        let (events_processed, total_events, output) = match &event.kind {
            ScanEventKind::ProgressTick {
                events_processed,
                total_events,
                ..
            }
            | ScanEventKind::StageComplete {
                events_processed,
                total_events,
                ..
            } => (Some(*events_processed), *total_events, None),
            kind => (None, None, serde_json::to_value(kind).ok()),
        };

        Self {
            event_type: "collector.scan".to_string(),
            status: event.kind.stream_status().to_string(),
            payload: FramePayload {
                task_id: event.task_id,
                seq: event.seq,
                collector: event.collector.to_string(),
                events_processed,
                total_events,
                output,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    task_id: Option<Uuid>,
}

/// Long-lived event stream over every task, or one task when `task_id` is
/// given. Dropping the connection drops the subscription.
async fn tasks_stream(
    State(state): State<Arc<AppState>>,
    _user: UserId,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let bus = state.services.event_bus.clone();
    let subscription = match query.task_id {
        Some(task_id) => bus.subscribe(task_id).await,
        None => bus.subscribe_all().await,
    };
    tracing::debug!(
        subscription_id = %subscription.subscription_id,
        "Stream client connected"
    );

    let stream = async_stream::stream! {
        while let Some(event) = subscription.next().await {
            let frame = StreamFrame::from_event(&event);
            match serde_json::to_string(&frame) {
                Ok(json) => yield Ok(Event::default().data(json)),
                Err(e) => {
                    tracing::warn!("Failed to serialize stream frame: {e}");
                }
            }
        }
        if subscription.dropped_count() > 0 {
            tracing::warn!(
                subscription_id = %subscription.subscription_id,
                "Stream client lagged, {} events dropped",
                subscription.dropped_count()
            );
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    )
}
