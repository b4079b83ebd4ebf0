use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::{Method, Request, Response, StatusCode};
use rust_decimal::Decimal;
use serde_json::{Map, Number, Value};
use tracing::{debug, info, warn};

use super::payload::build_payload;
use super::response::{apply_cors_headers, full_body, relay_error_response};
use crate::app_state::AppState;
use crate::auth::extract_token;
use crate::billing::rules::{self, Breakdown};
use crate::errors::RelayError;
use crate::storage::models::RelayCharge;
use crate::storage::ChargeOutcome;
use crate::upstream::build_upstream_headers;

const ALLOWED_METHODS: [Method; 4] = [Method::GET, Method::POST, Method::PUT, Method::DELETE];

/// Entry point for every metered path: buffer the inbound body, run the
/// relay pipeline, and turn a `RelayError` into its wire response.
pub async fn handle_relay(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    match relay(
        parts.method,
        &path,
        query.as_deref(),
        &parts.headers,
        body,
        &state,
    )
    .await
    {
        Ok(response) => Ok(response),
        Err(e) => {
            if e.status() == StatusCode::INTERNAL_SERVER_ERROR {
                warn!(error = %e, path = %path, "relay failed");
            } else {
                debug!(error = %e, path = %path, "relay rejected");
            }
            Ok(relay_error_response(&e))
        }
    }
}

/// The relay pipeline over plain parts, so tests can drive it without a
/// hyper connection.
pub(crate) async fn relay(
    method: Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
    state: &AppState,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, RelayError> {
    if !ALLOWED_METHODS.contains(&method) {
        return Err(RelayError::MethodNotAllowed(method));
    }

    let token = extract_token(headers).ok_or(RelayError::Unauthorized)?;
    let account_id = state.authenticator.authenticate(&token).await?;

    let (prefix, sub_path) = split_path(path);
    let route = state
        .registry
        .resolve(prefix)
        .await?
        .ok_or(RelayError::NotFound("forwarding route"))?;
    let address = state
        .registry
        .resolve_address(route.id, sub_path)
        .await?
        .ok_or(RelayError::NotFound("forwarding address"))?;

    let payload = build_payload(query, address.content_kind, &body);
    let Breakdown {
        itemized_funds,
        total,
    } = rules::evaluate(&payload, &address.billing_rules);

    let charge = RelayCharge {
        account_id,
        forwarding_id: route.id,
        amount: total,
        itemized_funds: Value::Object(itemized_funds),
    };
    match state.ledger.charge_relay(&charge).await? {
        ChargeOutcome::Charged => {}
        ChargeOutcome::InsufficientBalance => return Err(RelayError::InsufficientBalance),
    }

    info!(
        account_id = %account_id,
        route = %route.path_prefix,
        sub_path,
        amount = %total,
        "relay admitted"
    );

    let outbound_headers = build_upstream_headers(headers, &route.extra_headers, &token);
    let target = build_target_url(&route.downstream_address, sub_path, query);
    let upstream = state
        .forwarder
        .send(method, &target, outbound_headers, body)
        .await?;

    let patched = inject_total_price(upstream.body, total);
    let mut response = Response::new(full_body(patched));
    *response.status_mut() = upstream.status;
    for (name, value) in &upstream.headers {
        // Length changes with the patch; hyper reframes the body itself.
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONNECTION {
            continue;
        }
        response.headers_mut().append(name.clone(), value.clone());
    }
    apply_cors_headers(response.headers_mut());

    Ok(response)
}

/// Split `/vision/analyze/deep` into `("vision", "analyze/deep")`.
fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((prefix, rest)) => (prefix, rest),
        None => (trimmed, ""),
    }
}

fn build_target_url(base: &str, sub_path: &str, query: Option<&str>) -> String {
    let mut url = format!("{}/{}", base.trim_end_matches('/'), sub_path);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Patch `metadata.usage.total_price` into a JSON object body. Any body that
/// is not a JSON object, or has a non-object `metadata`/`usage` in the way,
/// passes through untouched.
fn inject_total_price(body: Bytes, total: Decimal) -> Bytes {
    match try_inject(&body, total) {
        Some(patched) => patched,
        None => body,
    }
}

fn try_inject(body: &[u8], total: Decimal) -> Option<Bytes> {
    let mut root = match serde_json::from_slice::<Value>(body).ok()? {
        Value::Object(map) => map,
        _ => return None,
    };
    let price = Number::from_str(&total.normalize().to_string()).ok()?;

    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()?;
    let usage = metadata
        .entry("usage")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()?;
    usage.insert("total_price".to_string(), Value::Number(price));

    serde_json::to_vec(&Value::Object(root)).ok().map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;

    #[test]
    fn path_splits_into_prefix_and_remainder() {
        assert_eq!(split_path("/vision/analyze/deep"), ("vision", "analyze/deep"));
        assert_eq!(split_path("/vision/analyze"), ("vision", "analyze"));
        assert_eq!(split_path("/vision"), ("vision", ""));
        assert_eq!(split_path("/"), ("", ""));
    }

    #[test]
    fn target_url_joins_base_sub_path_and_query() {
        assert_eq!(
            build_target_url("http://backend:9000/api/", "analyze", Some("pages=3")),
            "http://backend:9000/api/analyze?pages=3"
        );
        assert_eq!(
            build_target_url("http://backend:9000/api", "analyze", None),
            "http://backend:9000/api/analyze"
        );
    }

    #[test]
    fn price_patch_creates_the_metadata_chain() {
        let body = Bytes::from(r#"{"result":"ok"}"#);
        let patched: Value =
            serde_json::from_slice(&inject_total_price(body, dec!(0.20))).unwrap();
        assert_eq!(
            patched,
            json!({"result": "ok", "metadata": {"usage": {"total_price": 0.2}}})
        );
    }

    #[test]
    fn price_patch_preserves_existing_metadata() {
        let body = Bytes::from(r#"{"metadata":{"usage":{"tokens":9},"trace":"t1"}}"#);
        let patched: Value = serde_json::from_slice(&inject_total_price(body, dec!(3))).unwrap();
        assert_eq!(
            patched,
            json!({"metadata": {"usage": {"tokens": 9, "total_price": 3}, "trace": "t1"}})
        );
    }

    #[test]
    fn non_object_bodies_pass_through_untouched() {
        let body = Bytes::from("plain text");
        assert_eq!(inject_total_price(body.clone(), dec!(1)), body);

        let array = Bytes::from("[1,2,3]");
        assert_eq!(inject_total_price(array.clone(), dec!(1)), array);
    }

    #[test]
    fn conflicting_metadata_shape_leaves_the_body_alone() {
        let body = Bytes::from(r#"{"metadata":"opaque"}"#);
        assert_eq!(inject_total_price(body.clone(), dec!(1)), body);
    }

    #[test]
    fn zero_total_is_still_patched() {
        let body = Bytes::from(r#"{"result":"ok"}"#);
        let patched: Value = serde_json::from_slice(&inject_total_price(body, dec!(0))).unwrap();
        assert_eq!(patched["metadata"]["usage"]["total_price"], json!(0));
    }
}
