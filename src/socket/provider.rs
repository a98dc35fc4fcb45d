//! URL and sub-protocol providers
//!
//! Connection targets can be static, computed per attempt, or fetched
//! asynchronously (for example a ticketed URL minted right before each
//! connect). Providers are re-evaluated before every attempt.

use crate::{Error, Result};
use futures_util::future::BoxFuture;
use std::sync::Arc;

/// Source of the WebSocket URL, evaluated before every connect attempt
#[derive(Clone)]
pub enum UrlProvider {
    Static(String),
    Factory(Arc<dyn Fn() -> String + Send + Sync>),
    AsyncFactory(Arc<dyn Fn() -> BoxFuture<'static, Result<String>> + Send + Sync>),
}

impl UrlProvider {
    pub async fn resolve(&self) -> Result<String> {
        let url = match self {
            UrlProvider::Static(url) => url.clone(),
            UrlProvider::Factory(factory) => factory(),
            UrlProvider::AsyncFactory(factory) => factory().await?,
        };
        if url.is_empty() {
            return Err(Error::InvalidConfig(
                "URL provider returned an empty URL".to_string(),
            ));
        }
        Ok(url)
    }
}

impl std::fmt::Debug for UrlProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UrlProvider::Static(url) => f.debug_tuple("Static").field(url).finish(),
            UrlProvider::Factory(_) => f.write_str("Factory(..)"),
            UrlProvider::AsyncFactory(_) => f.write_str("AsyncFactory(..)"),
        }
    }
}

impl From<&str> for UrlProvider {
    fn from(url: &str) -> Self {
        UrlProvider::Static(url.to_string())
    }
}

impl From<String> for UrlProvider {
    fn from(url: String) -> Self {
        UrlProvider::Static(url)
    }
}

/// Source of the WebSocket sub-protocols, same forms as [`UrlProvider`]
#[derive(Clone, Default)]
pub enum ProtocolsProvider {
    #[default]
    None,
    Static(Vec<String>),
    Factory(Arc<dyn Fn() -> Vec<String> + Send + Sync>),
    AsyncFactory(Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<String>>> + Send + Sync>),
}

impl ProtocolsProvider {
    pub async fn resolve(&self) -> Result<Vec<String>> {
        match self {
            ProtocolsProvider::None => Ok(Vec::new()),
            ProtocolsProvider::Static(protocols) => Ok(protocols.clone()),
            ProtocolsProvider::Factory(factory) => Ok(factory()),
            ProtocolsProvider::AsyncFactory(factory) => factory().await,
        }
    }
}

impl std::fmt::Debug for ProtocolsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolsProvider::None => f.write_str("None"),
            ProtocolsProvider::Static(protocols) => {
                f.debug_tuple("Static").field(protocols).finish()
            }
            ProtocolsProvider::Factory(_) => f.write_str("Factory(..)"),
            ProtocolsProvider::AsyncFactory(_) => f.write_str("AsyncFactory(..)"),
        }
    }
}

/// Check whether a host names a local or private network destination
///
/// Matches `localhost`, `127.0.0.1`, the RFC 1918 ranges (`10.*`,
/// `192.168.*`, `172.16.*` through `172.31.*`) and the IPv4-mapped
/// loopback `[::ffff:7f00:1]`.
pub fn is_private_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if host.eq_ignore_ascii_case("localhost")
        || host == "127.0.0.1"
        || host.eq_ignore_ascii_case("::ffff:7f00:1")
    {
        return true;
    }
    if host.starts_with("10.") || host.starts_with("192.168.") {
        return true;
    }
    if let Some(rest) = host.strip_prefix("172.") {
        if let Some(second) = rest.split('.').next() {
            if let Ok(octet) = second.parse::<u8>() {
                return (16..=31).contains(&octet);
            }
        }
    }
    false
}

fn host_of(authority: &str) -> &str {
    if let Some(stripped) = authority.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            return &stripped[..end];
        }
    }
    authority
        .split(['/', ':', '?'])
        .next()
        .unwrap_or(authority)
}

/// Normalize a connection target into a `ws://` or `wss://` URL
///
/// `http(s)` schemes are rewritten to their WebSocket counterparts; a
/// scheme-less target defaults to `ws` for local and private hosts and
/// `wss` for everything else.
pub fn normalize_ws_url(raw: &str) -> Result<String> {
    if raw.starts_with("ws://") || raw.starts_with("wss://") {
        return Ok(raw.to_string());
    }
    if let Some(rest) = raw.strip_prefix("http://") {
        return Ok(format!("ws://{rest}"));
    }
    if let Some(rest) = raw.strip_prefix("https://") {
        return Ok(format!("wss://{rest}"));
    }
    if raw.contains("://") {
        return Err(Error::InvalidConfig(format!(
            "unsupported URL scheme: {raw}"
        )));
    }

    let scheme = if is_private_host(host_of(raw)) {
        "ws"
    } else {
        "wss"
    };
    Ok(format!("{scheme}://{raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_resolves() {
        let provider = UrlProvider::from("ws://localhost:4000");
        assert_eq!(provider.resolve().await.unwrap(), "ws://localhost:4000");
    }

    #[tokio::test]
    async fn test_factory_provider_reevaluates() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let counter = Arc::new(AtomicU32::new(0));
        let provider = {
            let counter = counter.clone();
            UrlProvider::Factory(Arc::new(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                format!("ws://host-{n}")
            }))
        };

        assert_eq!(provider.resolve().await.unwrap(), "ws://host-0");
        assert_eq!(provider.resolve().await.unwrap(), "ws://host-1");
    }

    #[tokio::test]
    async fn test_empty_url_is_config_error() {
        let provider = UrlProvider::from("");
        assert!(matches!(
            provider.resolve().await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_private_host_detection() {
        assert!(is_private_host("localhost"));
        assert!(is_private_host("127.0.0.1"));
        assert!(is_private_host("10.0.0.5"));
        assert!(is_private_host("192.168.1.20"));
        assert!(is_private_host("172.16.0.1"));
        assert!(is_private_host("172.31.255.1"));
        assert!(is_private_host("[::ffff:7f00:1]"));

        assert!(!is_private_host("172.15.0.1"));
        assert!(!is_private_host("172.32.0.1"));
        assert!(!is_private_host("example.com"));
        assert!(!is_private_host("11.0.0.1"));
    }

    #[test]
    fn test_normalize_schemes() {
        assert_eq!(normalize_ws_url("ws://a/b").unwrap(), "ws://a/b");
        assert_eq!(normalize_ws_url("http://a/b").unwrap(), "ws://a/b");
        assert_eq!(normalize_ws_url("https://a/b").unwrap(), "wss://a/b");
        assert_eq!(
            normalize_ws_url("localhost:4000/party").unwrap(),
            "ws://localhost:4000/party"
        );
        assert_eq!(
            normalize_ws_url("example.com/party").unwrap(),
            "wss://example.com/party"
        );
        assert!(normalize_ws_url("ftp://a/b").is_err());
    }
}
