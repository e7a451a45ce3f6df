//! Event stream handler.

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::EventsQuery;
use crate::vm::EventKind;

/// GET /api/v1/vm/events - Stream lifecycle events via SSE.
///
/// Each SSE event is named after the event kind and carries the event as
/// JSON. Query parameters:
/// - `kind`: only "transition" or only "log" events
pub async fn stream_events(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let kind = query
        .kind
        .as_deref()
        .map(str::parse::<EventKind>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let mut subscription = state.supervisor.subscribe(kind);

    let stream = async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            match serde_json::to_string(&event) {
                Ok(data) => yield Ok(Event::default().event(event.kind().as_str()).data(data)),
                Err(e) => tracing::warn!(error = %e, "failed to encode event"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
