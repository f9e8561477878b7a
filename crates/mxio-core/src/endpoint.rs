//! Named endpoint type

use core::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A logical connection target: scheme, host name and port.
///
/// The host is kept as a name; resolution to a socket address happens at
/// connect time (or is delegated to an upstream proxy, which may resolve
/// the name itself).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamedEndpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl NamedEndpoint {
    /// Create an endpoint with the default `tcp` scheme.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NamedEndpoint {
            scheme: "tcp".into(),
            host: host.into(),
            port,
        }
    }

    /// Create an endpoint with an explicit scheme.
    pub fn with_scheme(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        NamedEndpoint {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NamedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Error parsing a [`NamedEndpoint`] from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointParseError {
    #[error("endpoint has no port: {0}")]
    MissingPort(String),
    #[error("endpoint has an invalid port: {0}")]
    InvalidPort(String),
    #[error("endpoint has an empty host: {0}")]
    EmptyHost(String),
}

impl FromStr for NamedEndpoint {
    type Err = EndpointParseError;

    /// Accepts `host:port` and `scheme://host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("tcp", s),
        };
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointParseError::InvalidPort(s.to_string()))?;
        Ok(NamedEndpoint::with_scheme(scheme, host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let ep = NamedEndpoint::new("example.org", 80);
        assert_eq!(format!("{}", ep), "tcp://example.org:80");
    }

    #[test]
    fn test_endpoint_parse_round_trip() {
        let ep: NamedEndpoint = "https://example.org:443".parse().unwrap();
        assert_eq!(ep.scheme, "https");
        assert_eq!(ep.host, "example.org");
        assert_eq!(ep.port, 443);
        assert_eq!(format!("{}", ep).parse::<NamedEndpoint>().unwrap(), ep);
    }

    #[test]
    fn test_endpoint_parse_default_scheme() {
        let ep: NamedEndpoint = "localhost:8080".parse().unwrap();
        assert_eq!(ep.scheme, "tcp");
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 8080);
    }

    #[test]
    fn test_endpoint_parse_errors() {
        assert!(matches!(
            "example.org".parse::<NamedEndpoint>(),
            Err(EndpointParseError::MissingPort(_))
        ));
        assert!(matches!(
            "example.org:http".parse::<NamedEndpoint>(),
            Err(EndpointParseError::InvalidPort(_))
        ));
        assert!(matches!(
            ":80".parse::<NamedEndpoint>(),
            Err(EndpointParseError::EmptyHost(_))
        ));
    }
}
