//! Snapshot handlers.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::{blocking, ApiState, CancelOnDrop};
use crate::api::types::{
    DeleteSnapshotQuery, ListSnapshotsResponse, OkResponse, RevertQuery, SnapshotResponse,
};
use crate::context::OpContext;
use crate::snapshot::{CreateRequest, DeleteOptions, RevertOptions, RevertOutcome, SnapshotEngine};

/// GET /api/v1/vms/:id/snapshots - Snapshot tree of a VM.
pub async fn list_snapshots(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<ListSnapshotsResponse>, ApiError> {
    let vm = state.locate(&id)?;
    let snapshots = blocking(&state, move |ctx| SnapshotEngine::new(ctx).list(&vm)).await?;
    Ok(Json(ListSnapshotsResponse { snapshots }))
}

/// POST /api/v1/vms/:id/snapshots - Take a snapshot.
pub async fn create_snapshot(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateRequest>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let vm = state.locate(&id)?;
    let op = OpContext::new(state.session(&headers)?);
    let _cancel = CancelOnDrop::new(&op);

    let data = blocking(&state, move |ctx| {
        SnapshotEngine::new(ctx).create(&op, &vm, &req)
    })
    .await?;
    Ok(Json(data.into()))
}

/// DELETE /api/v1/vms/:id/snapshots/:guid - Delete a snapshot.
pub async fn delete_snapshot(
    State(state): State<Arc<ApiState>>,
    Path((id, guid)): Path<(String, String)>,
    Query(query): Query<DeleteSnapshotQuery>,
    headers: HeaderMap,
) -> Result<Json<OkResponse>, ApiError> {
    let vm = state.locate(&id)?;
    let op = OpContext::new(state.session(&headers)?);
    let _cancel = CancelOnDrop::new(&op);
    let options = DeleteOptions {
        child: query.child,
        merge: query.merge.unwrap_or(true),
    };

    blocking(&state, move |ctx| {
        SnapshotEngine::new(ctx).destroy(&op, &vm, &guid, options)
    })
    .await?;
    Ok(Json(OkResponse { ok: true }))
}

/// POST /api/v1/vms/:id/snapshots/:guid/revert - Revert to a snapshot.
pub async fn revert_snapshot(
    State(state): State<Arc<ApiState>>,
    Path((id, guid)): Path<(String, String)>,
    Query(query): Query<RevertQuery>,
    headers: HeaderMap,
) -> Result<Json<RevertOutcome>, ApiError> {
    let vm = state.locate(&id)?;
    let op = OpContext::new(state.session(&headers)?);
    let _cancel = CancelOnDrop::new(&op);
    let options = RevertOptions {
        skip_resume: query.skip_resume,
    };

    let outcome = blocking(&state, move |ctx| {
        SnapshotEngine::new(ctx).revert(&op, &vm, &guid, options)
    })
    .await?;
    Ok(Json(outcome))
}
