//! The opaque context token proxies attach to `Get` requests.

use serde::Deserialize;
use tracing::debug;

/// Subscriber context: the proxy's namespace, node and pod. Parsed
/// best-effort; a malformed token degrades to an empty one rather than
/// failing the stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextToken {
    #[serde(default)]
    pub ns: String,
    #[serde(default, rename = "nodeName")]
    pub node_name: String,
    #[serde(default)]
    pub pod: String,
}

impl ContextToken {
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return Self::default();
        }
        match serde_json::from_str(raw) {
            Ok(token) => token,
            Err(error) => {
                debug!(%error, "ignoring malformed context token");
                Self::default()
            }
        }
    }
}
