//! Status and health endpoints

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use vdisk_common::{VDiskId, VDiskStatus};
use vdisk_skeleton::messages::StatusRequest;
use vdisk_skeleton::{Addr, ClientRequest, NodeMsg, ReplyTo, Response as SkeletonResponse, SkeletonMsg};

const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// What the node has heard from its unit so far
#[derive(Debug, Clone)]
pub struct NodeView {
    pub vdisk_id: VDiskId,
    pub status: VDiskStatus,
    pub has_unreadable: bool,
    pub error: Option<String>,
    pub drop_requested: bool,
}

impl NodeView {
    pub const fn new(vdisk_id: VDiskId) -> Self {
        Self {
            vdisk_id,
            status: VDiskStatus::InitPending,
            has_unreadable: false,
            error: None,
            drop_requested: false,
        }
    }

    pub fn apply(&mut self, msg: NodeMsg) {
        match msg {
            NodeMsg::Status { vdisk_id, status } => {
                self.vdisk_id = vdisk_id;
                self.status = status;
            }
            NodeMsg::DropDonor { .. } => self.drop_requested = true,
            NodeMsg::DatabaseError { reason, .. } => self.error = Some(reason),
            NodeMsg::ScrubStatus { has_unreadable, .. } => self.has_unreadable = has_unreadable,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub skeleton: Addr<SkeletonMsg>,
    pub view: Arc<RwLock<NodeView>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Ask the skeleton for its status and merge it with the node's view
async fn status_handler(State(state): State<AppState>) -> Response {
    let view = state.view.read().clone();
    let (addr, mut rx) = Addr::channel();
    let request = ClientRequest::Status(StatusRequest {
        vdisk_id: view.vdisk_id,
    });
    if !state
        .skeleton
        .send(SkeletonMsg::client(request, ReplyTo::new(addr, 0)))
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "skeleton is gone").into_response();
    }

    let reply = match tokio::time::timeout(STATUS_TIMEOUT, rx.recv()).await {
        Ok(Some(reply)) => reply,
        Ok(None) => return (StatusCode::SERVICE_UNAVAILABLE, "no status reply").into_response(),
        Err(_) => return (StatusCode::GATEWAY_TIMEOUT, "status request timed out").into_response(),
    };
    let SkeletonResponse::Status(result) = reply.response else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "unexpected reply").into_response();
    };

    let mut body = json!({
        "vdisk_id": view.vdisk_id.to_string(),
        "reported_status": view.status,
        "has_unreadable": view.has_unreadable,
        "error": view.error,
        "drop_requested": view.drop_requested,
        "reply_status": result.status.to_string(),
        "reason": result.reason,
    });
    if let Some(info) = result.info {
        body["skeleton"] = json!({
            "state": info.state,
            "readiness": info.readiness,
            "repl_done": info.repl_done,
            "confirmed_lsn": info.confirmed_lsn,
            "db_birth_lsn": info.db_birth_lsn,
            "incarnation": info.incarnation,
            "emergency_queue_len": info.emergency_queue_len,
            "active_actors": info.active_actors,
            "logo_blobs": info.stat.logo_blobs,
            "blocks": info.stat.blocks,
            "barriers": info.stat.barriers,
        });
    }
    Json(body).into_response()
}

/// 200 only once the unit reported itself ready
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.view.read().status;
    if status == VDiskStatus::Ready {
        (StatusCode::OK, status.to_string())
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, status.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_tracks_reports() {
        let id = VDiskId::new(1, 1, 0, 0, 0);
        let mut view = NodeView::new(id);
        assert_eq!(view.status, VDiskStatus::InitPending);

        view.apply(NodeMsg::Status {
            vdisk_id: id,
            status: VDiskStatus::Ready,
        });
        view.apply(NodeMsg::ScrubStatus {
            vdisk_id: id,
            has_unreadable: true,
        });
        assert_eq!(view.status, VDiskStatus::Ready);
        assert!(view.has_unreadable);

        view.apply(NodeMsg::DatabaseError {
            vdisk_id: id,
            reason: "log write failed".to_string(),
        });
        assert_eq!(view.error.as_deref(), Some("log write failed"));
    }

    #[tokio::test]
    async fn test_health_follows_readiness() {
        let (skeleton, _rx) = Addr::channel();
        let view = Arc::new(RwLock::new(NodeView::new(VDiskId::default())));
        let state = AppState {
            skeleton,
            view: Arc::clone(&view),
        };
        let response = health_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        view.write().status = VDiskStatus::Ready;
        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
