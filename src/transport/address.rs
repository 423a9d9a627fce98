//! Logical-to-physical address rewriting.
//!
//! Callers address the server with realtime schemes (`ws`, `wss`). The
//! channel layer works on the physical HTTP address the upgrade request is
//! made against, so realtime schemes are rewritten to `http`/`https` before
//! the binding is built.

use std::fmt;

use url::{ParseError, Url};

use crate::error::TransportError;

/// Address schemes accepted by the socket client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scheme {
    /// `ws://`
    RealtimePlain,
    /// `wss://`
    RealtimeSecure,
    /// `http://`
    PlainHttp,
    /// `https://`
    SecureHttp,
}

impl Scheme {
    pub fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            "ws" => Some(Self::RealtimePlain),
            "wss" => Some(Self::RealtimeSecure),
            "http" => Some(Self::PlainHttp),
            "https" => Some(Self::SecureHttp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RealtimePlain => "ws",
            Self::RealtimeSecure => "wss",
            Self::PlainHttp => "http",
            Self::SecureHttp => "https",
        }
    }

    /// Physical scheme the channel layer uses for this logical scheme.
    pub fn physical(self) -> Self {
        match self {
            Self::RealtimePlain | Self::PlainHttp => Self::PlainHttp,
            Self::RealtimeSecure | Self::SecureHttp => Self::SecureHttp,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Self::RealtimeSecure | Self::SecureHttp)
    }
}

/// Transport security selected for a channel binding.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TransportSecurity {
    #[default]
    Plain,
    Tls,
}

/// Physical endpoint after rewriting.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EndpointAddress {
    /// Absolute `http`/`https` address.
    Absolute(Url),
    /// Relative address, passed through untouched.
    Relative(String),
}

impl EndpointAddress {
    pub fn as_url(&self) -> Option<&Url> {
        match self {
            Self::Absolute(url) => Some(url),
            Self::Relative(_) => None,
        }
    }

    pub fn security(&self) -> TransportSecurity {
        match self.as_url().and_then(|url| Scheme::parse(url.scheme())) {
            Some(scheme) if scheme.is_secure() => TransportSecurity::Tls,
            _ => TransportSecurity::Plain,
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute(url) => f.write_str(url.as_str()),
            Self::Relative(path) => f.write_str(path),
        }
    }
}

/// Rewrites a logical address into the physical endpoint address.
///
/// `ws` becomes `http` and `wss` becomes `https`; host, port, path, and
/// query are kept. HTTP addresses and relative addresses pass through.
/// Any other absolute scheme is rejected.
pub fn rewrite_address(address: &str) -> Result<EndpointAddress, TransportError> {
    let mut url = match Url::parse(address) {
        Ok(url) => url,
        Err(ParseError::RelativeUrlWithoutBase) => {
            return Ok(EndpointAddress::Relative(address.to_string()));
        }
        Err(err) => return Err(TransportError::invalid_address(address, err.to_string())),
    };

    let Some(scheme) = Scheme::parse(url.scheme()) else {
        return Err(TransportError::invalid_address(
            address,
            "must supply a websocket address (ws:// or wss://) or an http address (http:// or https://)",
        ));
    };

    let physical = scheme.physical();
    if physical != scheme {
        url.set_scheme(physical.as_str()).map_err(|()| {
            TransportError::invalid_address(address, "scheme cannot be rewritten")
        })?;
    }

    Ok(EndpointAddress::Absolute(url))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn absolute(address: &str) -> Url {
        match rewrite_address(address).expect("rewrite") {
            EndpointAddress::Absolute(url) => url,
            other => panic!("expected absolute address, got {other:?}"),
        }
    }

    #[test]
    fn realtime_plain_becomes_http() {
        let url = absolute("ws://example.com:8080/signal/connect?token=abc");
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host_str(), Some("example.com"));
        assert_eq!(url.port(), Some(8080));
        assert_eq!(url.path(), "/signal/connect");
        assert_eq!(url.query(), Some("token=abc"));
    }

    #[test]
    fn realtime_secure_becomes_https() {
        let url = absolute("wss://example.com/signal?transport=webSockets&clientId=c1");
        assert_eq!(url.as_str(), "https://example.com/signal?transport=webSockets&clientId=c1");
    }

    #[test]
    fn http_addresses_are_unchanged() {
        assert_eq!(absolute("http://h/a?b=c").as_str(), "http://h/a?b=c");
        assert_eq!(absolute("https://h:9443/a").as_str(), "https://h:9443/a");
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = rewrite_address("ftp://example.com/file").expect_err("ftp must fail");
        assert!(matches!(err, TransportError::InvalidAddress { .. }));
    }

    #[test]
    fn relative_address_passes_through() {
        let rewritten = rewrite_address("/signal/connect?x=1").expect("relative");
        assert_eq!(
            rewritten,
            EndpointAddress::Relative("/signal/connect?x=1".to_string())
        );
        assert_eq!(rewritten.security(), TransportSecurity::Plain);
    }

    #[test]
    fn security_follows_scheme() {
        assert_eq!(
            rewrite_address("wss://h/").expect("wss").security(),
            TransportSecurity::Tls
        );
        assert_eq!(
            rewrite_address("https://h/").expect("https").security(),
            TransportSecurity::Tls
        );
        assert_eq!(
            rewrite_address("ws://h/").expect("ws").security(),
            TransportSecurity::Plain
        );
    }

    #[test]
    fn rewriting_is_deterministic() {
        let first = rewrite_address("ws://h/p?q=1").expect("first");
        let second = rewrite_address("ws://h/p?q=1").expect("second");
        assert_eq!(first, second);
    }
}
