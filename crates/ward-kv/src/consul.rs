//! Consul KV backend using HTTP blocking queries.
//!
//! A read is `GET /v1/kv/<path>` (plus `recurse` for prefixes). When a
//! previous index is known the request carries `index` and `wait`, and
//! Consul holds it open until the data moves past that index or the wait
//! expires. The current index comes back in the `X-Consul-Index` header.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::trace;

use crate::backend::KvBackend;
use crate::error::{KvError, KvResult};
use crate::types::{KvPair, KvQuery, KvSnapshot};

/// Header carrying the query index.
pub const INDEX_HEADER: &str = "X-Consul-Index";

/// Header carrying the ACL token.
pub const TOKEN_HEADER: &str = "X-Consul-Token";

/// Default agent address.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8500";

/// Raw pair as returned by the KV endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
    modify_index: u64,
}

/// HTTP client for the Consul KV API.
#[derive(Debug, Clone)]
pub struct ConsulKv {
    client: reqwest::Client,
    base_url: reqwest::Url,
    token: Option<String>,
}

impl ConsulKv {
    /// Creates a client for the agent at `scheme://address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheme is not `http` or `https`, or the
    /// HTTP client cannot be built.
    pub fn new(scheme: &str, address: &str) -> KvResult<Self> {
        if scheme != "http" && scheme != "https" {
            return Err(KvError::Transport(format!(
                "unsupported scheme '{scheme}', expected http or https"
            )));
        }
        if address.is_empty() {
            return Err(KvError::Transport("address cannot be empty".to_string()));
        }
        let base = format!("{scheme}://{}", address.trim_end_matches('/'));
        let base_url = reqwest::Url::parse(&base)
            .map_err(|e| KvError::Transport(format!("invalid address '{address}': {e}")))?;
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    /// Sets the ACL token sent with every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// The `scheme://address` this client talks to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Builds the request URL for a query.
    ///
    /// Each segment of the key path is percent-encoded, so characters such
    /// as `?`, `#` and `%` stay part of the key instead of starting a query
    /// string or fragment.
    #[must_use]
    pub fn request_url(&self, query: &KvQuery, wait_index: u64, wait: Duration) -> String {
        let mut url = self.base_url.clone();
        // http(s) URLs always have a hierarchical path.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v1", "kv"])
                .extend(query.path().split('/'));
        }

        let blocking = wait_index > 0 && !wait.is_zero();
        if query.is_prefix() || blocking {
            let mut params = url.query_pairs_mut();
            if query.is_prefix() {
                params.append_pair("recurse", "true");
            }
            if blocking {
                params.append_pair("index", &wait_index.to_string());
                params.append_pair("wait", &format!("{}s", wait.as_secs().max(1)));
            }
        }
        url.into()
    }
}

impl KvBackend for ConsulKv {
    async fn fetch(
        &self,
        query: &KvQuery,
        wait_index: u64,
        wait: Duration,
    ) -> KvResult<KvSnapshot> {
        let url = self.request_url(query, wait_index, wait);
        // Consul adds up to wait/16 of jitter before answering.
        let timeout = wait + wait / 16 + Duration::from_secs(5);

        let mut request = self.client.get(&url).timeout(timeout);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        let response = request.send().await?;

        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| KvError::Decode(format!("missing {INDEX_HEADER} header")))
            .and_then(parse_index)?;

        let status = response.status();
        trace!(url = %url, status = status.as_u16(), index, "consul kv response");

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(KvSnapshot::empty(query.clone(), index));
        }
        if !status.is_success() {
            return Err(KvError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body = response.bytes().await?;
        let pairs = decode_pairs(&body)?;
        Ok(KvSnapshot::from_pairs(
            query.clone(),
            index,
            pairs.into_iter().filter(|p| query.matches(&p.key)),
        ))
    }
}

/// Parses an `X-Consul-Index` header value.
///
/// # Errors
///
/// Returns an error if the value is not an unsigned integer.
pub fn parse_index(value: &str) -> KvResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| KvError::Decode(format!("invalid {INDEX_HEADER} '{value}': {e}")))
}

/// Decodes a KV endpoint response body.
///
/// # Errors
///
/// Returns an error if the body is not a JSON array of pairs or a value is
/// not valid base64.
pub fn decode_pairs(body: &[u8]) -> KvResult<Vec<KvPair>> {
    let raw: Vec<RawPair> = serde_json::from_slice(body)
        .map_err(|e| KvError::Decode(format!("invalid kv response: {e}")))?;

    raw.into_iter()
        .map(|p| {
            let value = match p.value {
                Some(encoded) => STANDARD.decode(encoded.as_bytes()).map_err(|e| {
                    KvError::Decode(format!("invalid base64 value for '{}': {e}", p.key))
                })?,
                None => Vec::new(),
            };
            Ok(KvPair::new(p.key, value, p.modify_index))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ConsulKv {
        ConsulKv::new("http", DEFAULT_ADDRESS).expect("client")
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(ConsulKv::new("ftp", DEFAULT_ADDRESS).is_err());
        assert!(ConsulKv::new("http", "").is_err());
    }

    #[test]
    fn url_for_initial_key_read_has_no_blocking_params() {
        let query = KvQuery::key("config/services/consul/datacenter").expect("valid");
        assert_eq!(
            client().request_url(&query, 0, Duration::from_secs(300)),
            "http://127.0.0.1:8500/v1/kv/config/services/consul/datacenter"
        );
    }

    #[test]
    fn url_for_blocking_prefix_read() {
        let query = KvQuery::prefix("config/services/").expect("valid");
        assert_eq!(
            client().request_url(&query, 42, Duration::from_secs(300)),
            "http://127.0.0.1:8500/v1/kv/config/services/?recurse=true&index=42&wait=300s"
        );
    }

    #[test]
    fn sub_second_wait_rounds_up() {
        let query = KvQuery::key("a").expect("valid");
        assert_eq!(
            client().request_url(&query, 3, Duration::from_millis(200)),
            "http://127.0.0.1:8500/v1/kv/a?index=3&wait=1s"
        );
    }

    #[test]
    fn url_encodes_reserved_characters_in_key() {
        let query = KvQuery::key("app/a?recurse=true#frag").expect("valid");
        let url = client().request_url(&query, 0, Duration::ZERO);
        assert_eq!(url, "http://127.0.0.1:8500/v1/kv/app/a%3Frecurse=true%23frag");

        let parsed = reqwest::Url::parse(&url).expect("url");
        assert_eq!(parsed.query(), None);
        assert_eq!(parsed.fragment(), None);
    }

    #[test]
    fn url_encodes_percent_in_prefix() {
        let query = KvQuery::prefix("app/100%/").expect("valid");
        assert_eq!(
            client().request_url(&query, 0, Duration::ZERO),
            "http://127.0.0.1:8500/v1/kv/app/100%25/?recurse=true"
        );
    }

    #[test]
    fn base_url_is_normalized() {
        let kv = ConsulKv::new("https", "consul.internal:8501/").expect("client");
        assert_eq!(kv.base_url(), "https://consul.internal:8501/");
    }

    #[test]
    fn decode_pairs_reads_base64_values() {
        let body = br#"[
            {"Key": "config/region", "Value": "ZXUtd2VzdA==", "ModifyIndex": 12, "Flags": 0},
            {"Key": "config/folder/", "Value": null, "ModifyIndex": 3}
        ]"#;
        let pairs = decode_pairs(body).expect("decode");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].key, "config/region");
        assert_eq!(pairs[0].value, b"eu-west".to_vec());
        assert_eq!(pairs[0].modify_index, 12);
        assert!(pairs[1].value.is_empty());
    }

    #[test]
    fn decode_pairs_rejects_bad_base64() {
        let body = br#"[{"Key": "k", "Value": "***", "ModifyIndex": 1}]"#;
        let err = decode_pairs(body).expect_err("bad base64");
        assert!(err.to_string().contains("invalid base64 value for 'k'"));
    }

    #[test]
    fn parse_index_values() {
        assert_eq!(parse_index("1234").expect("valid"), 1234);
        assert_eq!(parse_index(" 7 ").expect("valid"), 7);
        assert!(parse_index("-1").is_err());
        assert!(parse_index("abc").is_err());
    }
}
