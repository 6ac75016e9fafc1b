//! User-Agent string sent by the HTTP transport.

/// Default User-Agent for storage API requests.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("transfer-engine/{version} (multipart-client)")
}
