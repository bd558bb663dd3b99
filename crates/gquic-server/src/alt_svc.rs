//! HTTPS-to-QUIC advertisement headers.
//!
//! An HTTP/2 server fronting the same origin advertises the QUIC endpoint
//! with an `Alt-Svc` header (plus the legacy `Alternate-Protocol` form for
//! older clients), e.g. `quic=":443"; ma=2592000; v="33,32,31,30"`.

use gquic_core::protocol::SUPPORTED_VERSIONS;
use thiserror::Error;

/// How long clients may cache the advertisement, in seconds (30 days).
const ALT_SVC_MAX_AGE: u32 = 2_592_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AltSvcError {
    #[error("listen address has no port: {0}")]
    MissingPort(String),
    #[error("unknown service name in listen address: {0}")]
    UnknownService(String),
}

/// Header name/value pairs advertising a QUIC endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicHeaders {
    pub alt_svc: String,
    pub alternate_protocol: String,
}

/// Build the advertisement headers for a listen address such as
/// `127.0.0.1:443`, `:443`, or `:https`.
pub fn quic_headers(addr: &str) -> Result<QuicHeaders, AltSvcError> {
    let port = parse_port(addr)?;

    let mut versions: Vec<String> = SUPPORTED_VERSIONS
        .iter()
        .map(|version| version.to_string())
        .collect();
    versions.reverse();
    let versions = versions.join(",");

    Ok(QuicHeaders {
        alt_svc: format!("quic=\":{port}\"; ma={ALT_SVC_MAX_AGE}; v=\"{versions}\""),
        alternate_protocol: format!("{port}:quic"),
    })
}

fn parse_port(addr: &str) -> Result<u16, AltSvcError> {
    let port = match addr.rsplit_once(':') {
        Some((_, port)) if !port.is_empty() => port,
        _ => return Err(AltSvcError::MissingPort(addr.to_string())),
    };
    if let Ok(port) = port.parse::<u16>() {
        return Ok(port);
    }
    match port {
        "https" => Ok(443),
        "http" => Ok(80),
        other => Err(AltSvcError::UnknownService(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected() -> QuicHeaders {
        QuicHeaders {
            alt_svc: r#"quic=":443"; ma=2592000; v="33,32,31,30""#.to_string(),
            alternate_protocol: "443:quic".to_string(),
        }
    }

    #[test]
    fn builds_headers_from_a_bare_port() {
        assert_eq!(quic_headers(":443").expect("headers"), expected());
    }

    #[test]
    fn builds_headers_from_a_full_address() {
        assert_eq!(quic_headers("127.0.0.1:443").expect("headers"), expected());
    }

    #[test]
    fn resolves_service_names() {
        assert_eq!(quic_headers(":https").expect("headers"), expected());
    }

    #[test]
    fn is_idempotent() {
        let first = quic_headers(":https").expect("headers");
        let second = quic_headers(":https").expect("headers");
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_an_address_without_a_port() {
        assert!(matches!(
            quic_headers("localhost"),
            Err(AltSvcError::MissingPort(_))
        ));
    }

    #[test]
    fn rejects_unknown_service_names() {
        assert!(matches!(
            quic_headers(":gopher"),
            Err(AltSvcError::UnknownService(_))
        ));
    }
}
