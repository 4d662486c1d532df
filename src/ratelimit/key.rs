//! Bucket key generation for guarded requests.

use serde::{Deserialize, Serialize};

/// Client identity used when no forwarding header is present.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// How requests are partitioned into buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// One bucket per route.
    #[default]
    Endpoint,
    /// One bucket per route and client.
    EndpointAndClient,
}

/// A key that identifies one bucket.
///
/// The endpoint is always part of the key so that exhausting one route's
/// budget never affects another route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Route template or endpoint name
    pub endpoint: String,
    /// Client identity, when partitioning per client
    pub client: Option<String>,
}

impl BucketKey {
    /// Build the key for a request under `strategy`.
    pub fn new(strategy: KeyStrategy, endpoint: &str, client: Option<&str>) -> Self {
        let client = match strategy {
            KeyStrategy::Endpoint => None,
            KeyStrategy::EndpointAndClient => Some(
                client
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .unwrap_or(ANONYMOUS_CLIENT)
                    .to_string(),
            ),
        };

        Self {
            endpoint: endpoint.to_string(),
            client,
        }
    }
}

/// Percent-escape the separator and the escape character itself, so that
/// `|` appears in a rendered key only between endpoint and client.
fn escape_part(part: &str) -> std::borrow::Cow<'_, str> {
    if part.contains(['%', '|']) {
        part.replace('%', "%25").replace('|', "%7C").into()
    } else {
        part.into()
    }
}

/// Renders as `endpoint` or `endpoint|client`. Distinct keys always render
/// to distinct strings.
impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let endpoint = escape_part(&self.endpoint);
        match &self.client {
            Some(client) => write!(f, "{}|{}", endpoint, escape_part(client)),
            None => write!(f, "{}", endpoint),
        }
    }
}
