use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::response::{error_response, json_response};
use crate::app_state::AppState;
use crate::billing::settlement::NodeExecutionRecord;

/// POST /internal/executions: enqueue a completed node execution for
/// asynchronous settlement. Accepting the record and settling it are
/// decoupled; the 202 only acknowledges the enqueue.
pub async fn handle_execution_intake(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let body = req.collect().await?.to_bytes();
    Ok(intake(&body, &state))
}

pub(crate) fn intake(body: &Bytes, state: &AppState) -> Response<BoxBody<Bytes, hyper::Error>> {
    let record: NodeExecutionRecord = match serde_json::from_slice(body) {
        Ok(record) => record,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid execution record: {e}"),
            );
        }
    };

    debug!(
        execution_id = %record.id,
        node_type = %record.node_type,
        "execution record received"
    );

    match state.settlement_tx.try_send(record) {
        Ok(()) => json_response(StatusCode::ACCEPTED, &json!({ "status": "accepted" })),
        Err(TrySendError::Full(record)) => {
            warn!(execution_id = %record.id, "settlement queue full, rejecting record");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "settlement queue full")
        }
        Err(TrySendError::Closed(_)) => {
            warn!("settlement worker is gone");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "settlement worker unavailable")
        }
    }
}
