//! `snapcast://` URLs
//!
//! Format: `snapcast://HOST[:STREAM_PORT][/STREAM_NAME][?RPC_PORT=PORT]`

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

pub const SCHEME: &str = "snapcast://";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapcastUrl {
    pub host: String,
    pub stream_port: Option<u16>,
    pub stream_name: Option<String>,
    pub rpc_port: Option<u16>,
}

impl SnapcastUrl {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn is_snapcast_url(s: &str) -> bool {
        s.starts_with(SCHEME)
    }
}

impl FromStr for SnapcastUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::Config(format!("not a snapcast URL: {}", s)))?;

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };
        let (authority, stream_name) = match rest.split_once('/') {
            Some((authority, name)) => (authority, Some(percent_decode(name)?)),
            None => (rest, None),
        };
        let (host, stream_port) = match authority.split_once(':') {
            Some((host, port)) => (host, Some(parse_port(port)?)),
            None => (authority, None),
        };
        if host.is_empty() {
            return Err(Error::Config(format!("missing host in {}", s)));
        }

        let rpc_port = query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .find_map(|pair| pair.strip_prefix("RPC_PORT="))
            .map(parse_port)
            .transpose()?;

        Ok(Self {
            host: host.to_string(),
            stream_port,
            stream_name: stream_name.filter(|name| !name.is_empty()),
            rpc_port,
        })
    }
}

impl fmt::Display for SnapcastUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SCHEME, self.host)?;
        if let Some(port) = self.stream_port {
            write!(f, ":{}", port)?;
        }
        if let Some(name) = &self.stream_name {
            write!(f, "/{}", percent_encode(name))?;
        }
        if let Some(port) = self.rpc_port {
            write!(f, "?RPC_PORT={}", port)?;
        }
        Ok(())
    }
}

fn parse_port(s: &str) -> Result<u16, Error> {
    s.parse()
        .map_err(|_| Error::Config(format!("invalid port: {:?}", s)))
}

/// Keeps unreserved characters, escapes every other byte
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn percent_decode(s: &str) -> Result<String, Error> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| Error::Config(format!("bad escape in {:?}", s)))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| Error::Config(format!("stream name is not UTF-8: {:?}", s)))
}
