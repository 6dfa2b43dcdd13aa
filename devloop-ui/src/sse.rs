//! Server-Sent Events stream of engine events across all workspaces.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tracing::warn;

use crate::state::{AppState, WorkspaceEvent};

/// SSE endpoint handler.
///
/// Clients get a `connected` event, then one `engine` event per engine
/// notification, and a `lagged` event when they fall behind. After a lag
/// the context endpoint is the way to resynchronize.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(sse) = to_sse(&event) {
                        yield Ok(sse);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                    yield Ok(Event::default().event("lagged").data(format!("{{\"skipped\":{n}}}")));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn to_sse(event: &WorkspaceEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Event::default().event("engine").data(json)),
        Err(err) => {
            warn!(error = %err, "failed to serialize engine event");
            None
        }
    }
}
