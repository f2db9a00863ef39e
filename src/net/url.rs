use anyhow::{Result, bail, ensure};

use super::Error;

const DEFAULT_TLS_PORT: u16 = 443;
const DEFAULT_PORT: u16 = 80;

//Host and port of the endpoint a CONNECT request is addressed to.
//The port is appended to the request in big-endian byte order.
#[derive(Debug, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn parse(endpoint: &str) -> Result<Self> {
        let (authority, use_tls) = match endpoint.split_once("://") {
            Some(("wss" | "https", rest)) => (rest, true),
            Some(("ws" | "http", rest)) => (rest, false),
            _ => bail!(Error::InvalidTarget(endpoint.to_owned())),
        };

        let authority = authority.split('/').next().unwrap_or_default();
        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => (
                host,
                port.parse()
                    .map_err(|_| Error::InvalidTarget(endpoint.to_owned()))?,
            ),
            None if use_tls => (authority, DEFAULT_TLS_PORT),
            None => (authority, DEFAULT_PORT),
        };
        ensure!(!host.is_empty(), Error::InvalidTarget(endpoint.to_owned()));

        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ProxyAddr {
    pub host: String,
    pub port: u16,
}

impl ProxyAddr {
    pub fn parse(uri: &str) -> Result<Self> {
        let Some(addr) = uri.trim().strip_prefix("socks5://") else {
            bail!(Error::InvalidProxy(uri.to_owned()));
        };

        let mut parts = addr.split(':');
        let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
            bail!(Error::InvalidProxy(uri.to_owned()));
        };
        ensure!(!host.is_empty(), Error::InvalidProxy(uri.to_owned()));

        Ok(Self {
            host: host.to_owned(),
            port: port
                .parse()
                .map_err(|_| Error::InvalidProxy(uri.to_owned()))?,
        })
    }
}
