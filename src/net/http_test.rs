use super::*;

// =============================================================================
// Method
// =============================================================================

#[test]
fn method_as_str_is_uppercase() {
    assert_eq!(Method::Get.as_str(), "GET");
    assert_eq!(Method::Post.as_str(), "POST");
    assert_eq!(Method::Put.as_str(), "PUT");
    assert_eq!(Method::Delete.as_str(), "DELETE");
}

#[test]
fn method_display_matches_as_str() {
    assert_eq!(Method::Post.to_string(), "POST");
}

#[test]
fn method_serializes_uppercase() {
    assert_eq!(serde_json::to_string(&Method::Delete).unwrap(), "\"DELETE\"");
}

#[test]
fn method_deserializes_from_uppercase() {
    let method: Method = serde_json::from_str("\"GET\"").unwrap();
    assert_eq!(method, Method::Get);
}

#[test]
fn method_rejects_lowercase() {
    assert!(serde_json::from_str::<Method>("\"get\"").is_err());
}

// =============================================================================
// TransportError
// =============================================================================

#[test]
fn transport_error_display_joins_context_and_detail() {
    let err = TransportError::new("http request failed", "connection refused");
    assert_eq!(err.to_string(), "http request failed: connection refused");
}
