//! API server state management.

use crate::api::error::ApiError;
use crate::cancel::CancelToken;
use crate::config::SnapvisorConfig;
use crate::context::{DispatcherContext, OpContext};
use crate::events::{BroadcastChannel, Event};
use crate::host::Impersonator;
use crate::vm::{SessionId, VmLocation};
use axum::http::HeaderMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Header naming the client session.
pub const SESSION_HEADER: &str = "x-session-id";

/// Header carrying the uid a named session acts as.
pub const SESSION_UID_HEADER: &str = "x-session-uid";

/// Shared API server state.
pub struct ApiState {
    ctx: DispatcherContext,
    events: Arc<BroadcastChannel>,
}

impl ApiState {
    /// Wrap an assembled context and the channel its events go to.
    pub fn new(ctx: DispatcherContext, events: Arc<BroadcastChannel>) -> Self {
        Self { ctx, events }
    }

    /// State with the host collaborators.
    pub fn from_config(config: SnapvisorConfig) -> crate::Result<Self> {
        let (ctx, events) = DispatcherContext::from_config(config)?;
        Ok(Self::new(ctx, events))
    }

    /// Dispatcher context.
    pub fn ctx(&self) -> &DispatcherContext {
        &self.ctx
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Session of the request, bound to the user it acts for.
    pub fn session(&self, headers: &HeaderMap) -> Result<SessionId, ApiError> {
        let session = session_from(headers);
        bind_session_user(self.ctx.collab.impersonator.as_ref(), &session, headers)?;
        Ok(session)
    }

    /// Resolve a VM by uuid or name.
    pub fn locate(&self, id: &str) -> Result<VmLocation, ApiError> {
        Ok(self.ctx.locate(id)?)
    }
}

fn named_session(headers: &HeaderMap) -> Option<SessionId> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(SessionId::new)
}

/// Session named by the request, or a fresh one.
pub fn session_from(headers: &HeaderMap) -> SessionId {
    named_session(headers).unwrap_or_else(SessionId::generate)
}

/// Bind the uid carried by the request to its session.
///
/// Only named sessions may carry a uid. The binding lasts until the
/// session's event stream closes.
pub fn bind_session_user(
    impersonator: &dyn Impersonator,
    session: &SessionId,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let Some(value) = headers.get(SESSION_UID_HEADER) else {
        return Ok(());
    };
    if named_session(headers).is_none() {
        return Err(ApiError::BadRequest(format!(
            "{} requires {}",
            SESSION_UID_HEADER, SESSION_HEADER
        )));
    }
    let uid = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("invalid {} header", SESSION_UID_HEADER)))?;
    impersonator.bind(session, uid);
    Ok(())
}

/// Cancels a request's operation if the handler future is dropped.
pub struct CancelOnDrop(CancelToken);

impl CancelOnDrop {
    /// Guard the operation's token.
    pub fn new(op: &OpContext) -> Self {
        Self(op.cancel.clone())
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Run an engine call on the blocking pool.
pub async fn blocking<T, F>(state: &Arc<ApiState>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&DispatcherContext) -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    Ok(tokio::task::spawn_blocking(move || f(state.ctx())).await??)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_session_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("alice"));
        assert_eq!(session_from(&headers), SessionId::new("alice"));
    }

    #[test]
    fn test_missing_session_gets_fresh_id() {
        let headers = HeaderMap::new();
        assert_ne!(session_from(&headers), session_from(&headers));
    }

    #[derive(Default)]
    struct Bindings(parking_lot::Mutex<Vec<(SessionId, u32)>>);

    impl Impersonator for Bindings {
        fn impersonate(&self, _session: &SessionId) -> crate::Result<()> {
            Ok(())
        }

        fn revert(&self) -> crate::Result<()> {
            Ok(())
        }

        fn bind(&self, session: &SessionId, uid: u32) {
            self.0.lock().push((session.clone(), uid));
        }
    }

    #[test]
    fn test_session_uid_is_bound() {
        let bindings = Bindings::default();
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("alice"));
        headers.insert(SESSION_UID_HEADER, HeaderValue::from_static("1000"));

        let session = session_from(&headers);
        bind_session_user(&bindings, &session, &headers).unwrap();
        assert_eq!(*bindings.0.lock(), vec![(SessionId::new("alice"), 1000)]);
    }

    #[test]
    fn test_session_uid_rejects_bad_headers() {
        let bindings = Bindings::default();
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_UID_HEADER, HeaderValue::from_static("1000"));
        let anonymous = session_from(&headers);
        assert!(matches!(
            bind_session_user(&bindings, &anonymous, &headers),
            Err(ApiError::BadRequest(_))
        ));

        headers.insert(SESSION_HEADER, HeaderValue::from_static("alice"));
        headers.insert(SESSION_UID_HEADER, HeaderValue::from_static("root"));
        assert!(matches!(
            bind_session_user(&bindings, &SessionId::new("alice"), &headers),
            Err(ApiError::BadRequest(_))
        ));
        assert!(bindings.0.lock().is_empty());
    }

    #[test]
    fn test_cancel_on_drop() {
        let op = OpContext::new(SessionId::new("alice"));
        drop(CancelOnDrop::new(&op));
        assert!(op.cancel.is_cancelled());
    }
}
