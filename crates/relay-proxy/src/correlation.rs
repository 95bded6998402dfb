//! Request id generation.

use uuid::Uuid;

/// Response header carrying the relay-assigned request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Generate a new request id (UUID v4).
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
