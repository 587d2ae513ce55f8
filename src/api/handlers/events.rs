//! Event stream handler.

use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::api::state::{session_from, ApiState};
use crate::vm::SessionId;

/// Releases a session's exclusive operations and user binding when its
/// stream ends.
struct SessionCleanup {
    state: Arc<ApiState>,
    session: SessionId,
}

impl Drop for SessionCleanup {
    fn drop(&mut self) {
        tracing::info!(session = %self.session, "event stream closed");
        let ctx = self.state.ctx();
        ctx.registry.cleanup_session_locks(&self.session);
        ctx.collab.impersonator.unbind(&self.session);
    }
}

/// GET /api/v1/events - Stream events visible to the calling session.
///
/// The stream stays open for the life of the session; closing it ends the
/// session and releases every lock it still holds.
pub async fn stream_events(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let session = session_from(&headers);
    let rx = state.subscribe();
    let cleanup = SessionCleanup {
        state: state.clone(),
        session: session.clone(),
    };
    tracing::info!(session = %session, "event stream opened");

    let stream = async_stream::stream! {
        let _cleanup = cleanup;
        let mut events = BroadcastStream::new(rx);
        while let Some(item) = events.next().await {
            match item {
                Ok(event) if event.is_visible_to(&session) => {
                    match SseEvent::default().json_data(&event) {
                        Ok(sse) => yield Ok(sse),
                        Err(e) => tracing::warn!(error = %e, "failed to encode event"),
                    }
                }
                Ok(_) => {}
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(session = %session, skipped, "event stream lagged");
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
