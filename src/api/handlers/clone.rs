//! Clone handler.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::{blocking, ApiState, CancelOnDrop};
use crate::clone::{CloneEngine, CloneOutcome, CloneRequest};
use crate::context::OpContext;

/// POST /api/v1/vms/:id/clone - Clone a VM.
pub async fn clone_vm(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CloneRequest>,
) -> Result<Json<CloneOutcome>, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name cannot be empty".into()));
    }
    let vm = state.locate(&id)?;
    let op = OpContext::new(state.session(&headers)?);
    let _cancel = CancelOnDrop::new(&op);

    let outcome = blocking(&state, move |ctx| {
        CloneEngine::new(ctx).clone_vm(&op, &vm, &req)
    })
    .await?;
    Ok(Json(outcome))
}
