//! Client key extraction from HTTP requests.

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{Result, TollgateError};

/// Where a request's client key comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySource {
    /// IP address of the connected peer
    #[default]
    PeerAddr,
    /// First entry of a header set by a trusted proxy, e.g. `x-forwarded-for`
    Header {
        /// Header name
        name: String,
    },
}

impl KeySource {
    /// Extract the client key for `req`.
    ///
    /// Failing to identify the client is an error distinct from any rate
    /// limit outcome.
    pub fn extract(&self, req: &Request) -> Result<String> {
        match self {
            KeySource::PeerAddr => req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
                .ok_or_else(|| {
                    TollgateError::KeyExtraction("peer address unavailable".to_string())
                }),
            KeySource::Header { name } => {
                let value = req.headers().get(name.as_str()).ok_or_else(|| {
                    TollgateError::KeyExtraction(format!("missing header {}", name))
                })?;
                let value = value.to_str().map_err(|_| {
                    TollgateError::KeyExtraction(format!("header {} is not valid text", name))
                })?;

                // Proxies append to the list; the first hop is the client
                match value.split(',').next().map(str::trim) {
                    Some(first) if !first.is_empty() => Ok(first.to_string()),
                    _ => Err(TollgateError::KeyExtraction(format!(
                        "header {} is empty",
                        name
                    ))),
                }
            }
        }
    }

    /// Check that a header source names a valid header.
    pub fn validate(&self) -> Result<()> {
        match self {
            KeySource::PeerAddr => Ok(()),
            KeySource::Header { name } => HeaderName::from_bytes(name.as_bytes())
                .map(|_| ())
                .map_err(|_| TollgateError::Config(format!("invalid key header name: {}", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request() -> Request {
        axum::http::Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    fn header_source() -> KeySource {
        KeySource::Header {
            name: "x-forwarded-for".to_string(),
        }
    }

    #[test]
    fn test_peer_addr_uses_ip_only() {
        let mut req = request();
        let addr: SocketAddr = "10.1.2.3:4000".parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));

        assert_eq!(KeySource::PeerAddr.extract(&req).unwrap(), "10.1.2.3");
    }

    #[test]
    fn test_peer_addr_same_host_different_ports_share_key() {
        let mut first = request();
        first
            .extensions_mut()
            .insert(ConnectInfo("10.1.2.3:4000".parse::<SocketAddr>().unwrap()));
        let mut second = request();
        second
            .extensions_mut()
            .insert(ConnectInfo("10.1.2.3:5000".parse::<SocketAddr>().unwrap()));

        assert_eq!(
            KeySource::PeerAddr.extract(&first).unwrap(),
            KeySource::PeerAddr.extract(&second).unwrap()
        );
    }

    #[test]
    fn test_missing_peer_addr_is_error() {
        let result = KeySource::PeerAddr.extract(&request());
        assert!(matches!(result, Err(TollgateError::KeyExtraction(_))));
    }

    #[test]
    fn test_header_takes_first_hop() {
        let req = axum::http::Request::builder()
            .header("x-forwarded-for", " 203.0.113.7 , 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(header_source().extract(&req).unwrap(), "203.0.113.7");
    }

    #[test]
    fn test_missing_or_empty_header_is_error() {
        assert!(matches!(
            header_source().extract(&request()),
            Err(TollgateError::KeyExtraction(_))
        ));

        let req = axum::http::Request::builder()
            .header("x-forwarded-for", " ")
            .body(Body::empty())
            .unwrap();
        assert!(matches!(
            header_source().extract(&req),
            Err(TollgateError::KeyExtraction(_))
        ));
    }

    #[test]
    fn test_validate_header_name() {
        assert!(header_source().validate().is_ok());
        let invalid = KeySource::Header {
            name: "bad header".to_string(),
        };
        assert!(matches!(invalid.validate(), Err(TollgateError::Config(_))));
    }
}
