// Relay endpoint derivation: host + room -> WebSocket URL.
//
// Rooms live under `/parties/main/<room>` on the relay. Bare hosts get `ws`
// on loopback and `wss` everywhere else.

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;
use url::Url;

pub const PARTIES_SEGMENT: &str = "parties";
pub const DEFAULT_PARTY: &str = "main";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("room identifier is empty")]
    EmptyRoom,

    #[error("room identifier `{0}` must not contain `/`")]
    InvalidRoom(String),

    #[error("relay host is empty")]
    EmptyHost,

    #[error("invalid relay host `{host}`: {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("unsupported relay scheme `{0}` (expected ws, wss, http or https)")]
    UnsupportedScheme(String),
}

/// A named room on a relay host, resolved to the WebSocket URL to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    host: String,
    room: String,
    url: Url,
}

impl RelayEndpoint {
    pub fn new(host: &str, room: &str) -> Result<Self, EndpointError> {
        let host = host.trim();
        let room = room.trim();
        if host.is_empty() {
            return Err(EndpointError::EmptyHost);
        }
        validate_room(room)?;

        let mut url = parse_base(host)?;
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|_| EndpointError::InvalidHost {
                host: host.to_string(),
                reason: "host cannot carry a path".to_string(),
            })?
            .clear()
            .extend([PARTIES_SEGMENT, DEFAULT_PARTY, room]);

        Ok(Self { host: host.to_string(), room: room.to_string(), url })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

pub fn validate_room(room: &str) -> Result<(), EndpointError> {
    if room.is_empty() {
        return Err(EndpointError::EmptyRoom);
    }
    if room.contains('/') {
        return Err(EndpointError::InvalidRoom(room.to_string()));
    }
    Ok(())
}

fn parse_base(host: &str) -> Result<Url, EndpointError> {
    let invalid = |error: url::ParseError| EndpointError::InvalidHost {
        host: host.to_string(),
        reason: error.to_string(),
    };

    if let Some((scheme, _)) = host.split_once("://") {
        let mut url = Url::parse(host).map_err(invalid)?;
        let mapped = match scheme.to_ascii_lowercase().as_str() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
        };
        if url.scheme() != mapped {
            // http(s) -> ws(s) are both special schemes, so the swap is accepted.
            url.set_scheme(mapped).map_err(|_| EndpointError::UnsupportedScheme(scheme.into()))?;
        }
        return Ok(url);
    }

    let mut url = Url::parse(&format!("ws://{host}")).map_err(invalid)?;
    if !is_loopback_host(url.host_str()) {
        url.set_scheme("wss").map_err(|_| EndpointError::UnsupportedScheme("wss".into()))?;
    }
    Ok(url)
}

pub fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}
