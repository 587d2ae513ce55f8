//! VM catalogue handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::{ListVmsResponse, LocksResponse};

/// GET /api/v1/vms - List registered VMs.
pub async fn list_vms(State(state): State<Arc<ApiState>>) -> Json<ListVmsResponse> {
    Json(ListVmsResponse {
        vms: state.ctx().catalogue.list(),
    })
}

/// GET /api/v1/vms/:id/locks - Exclusive operations held on a VM.
pub async fn vm_locks(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<LocksResponse>, ApiError> {
    let vm = state.locate(&id)?;
    let registry = &state.ctx().registry;
    Ok(Json(LocksResponse {
        locker_session: registry.get_locker_session(&vm.id).map(|s| s.0),
        tasks: registry
            .get_tasks_under_exclusive_op(&vm.id)
            .into_iter()
            .map(|t| t.0)
            .collect(),
        held: registry.held_ops(&vm.id),
    }))
}
