pub mod socks5;
pub mod url;

use std::{
    fmt, io,
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
    vec,
};

use anyhow::{Context, Result};
use log::debug;

//Configuration and protocol errors, distinguishable by downcast from
//the io::Error transport failures the stream layer reports.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    InvalidProxy(String),
    InvalidTarget(String),
    Rejected(u8),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidProxy(uri) => write!(f, "Invalid SOCKS5 proxy URI: {uri}"),
            Self::InvalidTarget(endpoint) => write!(f, "Invalid target endpoint: {endpoint}"),
            Self::Rejected(code) => write!(
                f,
                "CONNECT rejected by proxy: {} ({code:#04x})",
                reject_reason(*code)
            ),
        }
    }
}

fn reject_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned reply code",
    }
}

pub fn resolve(host: &str, port: u16) -> Result<vec::IntoIter<SocketAddr>> {
    debug!("Resolving {host}:{port}");

    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {host}:{port}"))
}

pub fn try_connect(
    iter: impl Iterator<Item = SocketAddr>,
    timeout: Duration,
) -> Result<TcpStream, io::Error> {
    let mut io_error = None;
    for addr in iter {
        debug!("Connecting to {addr}");
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(sock) => {
                sock.set_nodelay(true)?;
                return Ok(sock);
            }
            Err(e) => io_error = Some(e),
        }
    }

    Err(io_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "No addresses resolved")))
}
