use bytes::Bytes;
use serde_json::{Map, Value};
use url::form_urlencoded;

use crate::storage::models::ContentKind;

/// Flatten query parameters and body fields into the single payload the rule
/// evaluator walks.
///
/// Query and form values stay strings, the way they arrive on the wire; the
/// evaluator's numeric coercion handles them. Body fields override query
/// parameters on key collision. Bodies that fail to parse contribute nothing
/// rather than failing the request.
pub fn build_payload(query: Option<&str>, kind: ContentKind, body: &Bytes) -> Value {
    let mut payload = Map::new();

    if let Some(query) = query {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            payload.insert(key.into_owned(), Value::String(value.into_owned()));
        }
    }

    match kind {
        ContentKind::Form | ContentKind::UrlEncoded => {
            for (key, value) in form_urlencoded::parse(body.as_ref()) {
                payload.insert(key.into_owned(), Value::String(value.into_owned()));
            }
        }
        ContentKind::None | ContentKind::Json => {
            if let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(body) {
                for (key, value) in fields {
                    payload.insert(key, value);
                }
            }
        }
        // Raw and markup bodies carry no billable fields.
        ContentKind::Raw | ContentKind::Html | ContentKind::Xml => {}
    }

    Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn query_parameters_arrive_as_strings() {
        let payload = build_payload(Some("pages=20&lang=en"), ContentKind::None, &Bytes::new());
        assert_eq!(payload, json!({"pages": "20", "lang": "en"}));
    }

    #[test]
    fn json_body_fields_override_query_parameters() {
        let body = Bytes::from(r#"{"pages": 30, "model": "ocr-large"}"#);
        let payload = build_payload(Some("pages=20"), ContentKind::Json, &body);
        assert_eq!(payload, json!({"pages": 30, "model": "ocr-large"}));
    }

    #[test]
    fn form_bodies_are_decoded() {
        let body = Bytes::from("pages=7&note=a%20b");
        let payload = build_payload(None, ContentKind::Form, &body);
        assert_eq!(payload, json!({"pages": "7", "note": "a b"}));
    }

    #[test]
    fn raw_bodies_are_ignored() {
        let body = Bytes::from("pages=7");
        let payload = build_payload(Some("lang=en"), ContentKind::Raw, &body);
        assert_eq!(payload, json!({"lang": "en"}));
    }

    #[test]
    fn unparseable_or_non_object_json_contributes_nothing() {
        let garbled = build_payload(None, ContentKind::Json, &Bytes::from("{nope"));
        assert_eq!(garbled, json!({}));

        let array = build_payload(None, ContentKind::Json, &Bytes::from("[1,2]"));
        assert_eq!(array, json!({}));
    }
}
