use bytes::Bytes;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_LENGTH, COOKIE,
    HOST, TRANSFER_ENCODING,
};
use hyper::{Method, StatusCode};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("downstream request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Fully buffered response from the downstream service.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Shared HTTP client for the relay leg. Redirects are never followed; the
/// caller sees 3xx responses as-is.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new() -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Dispatch one relayed request. GET carries no body; every other
    /// allowed method forwards the inbound bytes untouched.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let mut request = self.client.request(method.clone(), url).headers(headers);
        if method != Method::GET {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Build the outbound header set: every inbound header except `Host` and the
/// framing headers the client recomputes, with the route's extra headers
/// merged on top. The auth header is replaced by the downstream session
/// cookie, and `Accept-Encoding: identity` keeps the response body
/// rewritable.
pub fn build_upstream_headers(
    inbound: &HeaderMap,
    extra_headers: &[(String, String)],
    token: &str,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if name == HOST || name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.remove(AUTHORIZATION);

    for (name, value) in extra_headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "dropping invalid extra header"),
        }
    }

    match HeaderValue::try_from(format!("x-token={token};")) {
        Ok(cookie) => {
            headers.insert(COOKIE, cookie);
        }
        Err(_) => warn!("token is not a valid cookie value, omitting session cookie"),
    }
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("proxy.example.com"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok-1"));
        headers.insert(COOKIE, HeaderValue::from_static("session=abc"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, br"));
        headers.insert("x-request-id", HeaderValue::from_static("req-9"));
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));
        headers
    }

    #[test]
    fn host_and_auth_are_dropped_and_cookie_replaced() {
        let headers = build_upstream_headers(&inbound(), &[], "tok-1");

        assert!(headers.get(HOST).is_none());
        assert!(headers.get(AUTHORIZATION).is_none());
        assert_eq!(headers.get(COOKIE).unwrap(), "x-token=tok-1;");
        assert_eq!(headers.get("x-request-id").unwrap(), "req-9");
    }

    #[test]
    fn repeated_headers_survive_the_copy() {
        let headers = build_upstream_headers(&inbound(), &[], "tok-1");
        let tags: Vec<_> = headers
            .get_all("x-tag")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        assert_eq!(tags, ["a", "b"]);
    }

    #[test]
    fn accept_encoding_is_forced_to_identity() {
        let headers = build_upstream_headers(&inbound(), &[], "tok-1");
        assert_eq!(headers.get(ACCEPT_ENCODING).unwrap(), "identity");
    }

    #[test]
    fn extra_headers_override_inbound_values() {
        let extras = vec![
            ("x-request-id".to_string(), "route-override".to_string()),
            ("x-api-version".to_string(), "2".to_string()),
        ];
        let headers = build_upstream_headers(&inbound(), &extras, "tok-1");

        assert_eq!(headers.get("x-request-id").unwrap(), "route-override");
        assert_eq!(headers.get("x-api-version").unwrap(), "2");
    }

    #[test]
    fn invalid_extra_headers_are_skipped() {
        let extras = vec![
            ("bad name".to_string(), "v".to_string()),
            ("x-ok".to_string(), "v".to_string()),
        ];
        let headers = build_upstream_headers(&inbound(), &extras, "tok-1");

        assert!(headers.get("x-ok").is_some());
        assert_eq!(headers.iter().filter(|(n, _)| n.as_str().contains(' ')).count(), 0);
    }
}
