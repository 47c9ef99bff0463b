//! Correlation and request ids supplied by callers.

use uuid::Uuid;

/// Header a caller may use to supply its own request/correlation id.
pub const REQUEST_ID_HEADER: &str = "x-requestid";

/// Parses a caller-supplied id. Only a well-formed, non-nil UUID counts.
pub fn parse_request_id(value: Option<&str>) -> Option<Uuid> {
    value
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
        .filter(|id| !id.is_nil())
}

/// Reuses a supplied id when it is a non-nil UUID, otherwise mints a fresh one.
pub fn resolve_correlation_id(supplied: Option<&str>) -> String {
    parse_request_id(supplied)
        .unwrap_or_else(Uuid::new_v4)
        .to_string()
}
