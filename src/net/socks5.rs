use std::{
    io::{ErrorKind, Read, Write},
    net::{Shutdown, TcpStream},
    sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
    thread,
    time::Duration,
};

use anyhow::{Context, Result, bail, ensure};
use log::debug;

use super::{
    Error, resolve, try_connect,
    url::{ProxyAddr, Target},
};

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH_NUM_METHODS: u8 = 0x01;
const NO_AUTH: u8 = 0x00;
const METHOD_SELECTION: [u8; 3] = [SOCKS_VERSION, NO_AUTH_NUM_METHODS, NO_AUTH];

const CONNECT_COMMAND: u8 = 0x01;
const RESERVED: u8 = 0x00;
const ADDRESS_TYPE_IPV4: u8 = 0x01;
const ADDRESS_TYPE_DOMAIN: u8 = 0x03;
const ADDRESS_TYPE_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;

const METHOD_REPLY_LEN: usize = 2;
const CONNECT_REPLY_LEN: usize = 4;
const PORT_LEN: usize = 2;

enum Phase {
    MethodSelection,
    Connect,
}

//A CONNECT reply ends with the bound address, either a fixed-length
//IPv4/IPv6 tail or a domain name prefixed with its own length byte.
enum ReplyTail {
    Fixed(usize),
    LengthPrefixed,
}

impl ReplyTail {
    fn of(address_type: u8) -> Self {
        match address_type {
            ADDRESS_TYPE_IPV4 => Self::Fixed(4 + PORT_LEN),
            ADDRESS_TYPE_IPV6 => Self::Fixed(16 + PORT_LEN),
            _ => Self::LengthPrefixed,
        }
    }
}

pub struct Negotiator<S: Read + Write> {
    stream: S,
    phase: Phase,
    request: Vec<u8>,
    response: Vec<u8>,
}

impl<S: Read + Write> Negotiator<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            phase: Phase::MethodSelection,
            request: Vec::default(),
            response: Vec::default(),
        }
    }

    pub fn negotiate(&mut self, endpoint: &str) -> Result<()> {
        self.send_method_selection()?;
        self.recv_reply()?;
        debug!("Proxy selected method: {:#04x}", self.response[1]);
        self.phase = Phase::Connect;

        self.send_connect(endpoint)?;
        self.recv_reply()?;
        self.finish_connect()
    }

    fn send_method_selection(&mut self) -> Result<()> {
        self.request.clear();
        self.request.extend_from_slice(&METHOD_SELECTION);
        self.stream.write_all(&self.request)?;

        Ok(())
    }

    fn send_connect(&mut self, endpoint: &str) -> Result<()> {
        let target = Target::parse(endpoint)?;

        self.request.clear();
        self.request.extend_from_slice(&[
            SOCKS_VERSION,
            CONNECT_COMMAND,
            RESERVED,
            ADDRESS_TYPE_DOMAIN,
            u8::try_from(target.host.len())?,
        ]);
        self.request.extend_from_slice(target.host.as_bytes());
        self.request.extend_from_slice(&target.port.to_be_bytes());
        self.stream.write_all(&self.request)?;

        Ok(())
    }

    fn recv_reply(&mut self) -> Result<()> {
        let len = match self.phase {
            Phase::MethodSelection => METHOD_REPLY_LEN,
            Phase::Connect => CONNECT_REPLY_LEN,
        };

        self.read_response(len)
    }

    fn finish_connect(&mut self) -> Result<()> {
        debug_assert!(matches!(self.phase, Phase::Connect));

        let reply = self.response[1];
        ensure!(reply == REPLY_SUCCEEDED, Error::Rejected(reply));

        //The bound address is consumed and discarded
        match ReplyTail::of(self.response[3]) {
            ReplyTail::Fixed(len) => self.read_response(len)?,
            ReplyTail::LengthPrefixed => {
                self.read_response(1)?;

                let len = usize::from(self.response[0]) + PORT_LEN;
                self.read_response(len)?;
            }
        }

        Ok(())
    }

    fn read_response(&mut self, len: usize) -> Result<()> {
        self.response.resize(len, 0);
        self.stream.read_exact(&mut self.response)?;

        Ok(())
    }
}

#[derive(Debug)]
pub struct Handshake {
    done_rx: Receiver<Result<()>>,
    sock_rx: Receiver<TcpStream>,
    sock: Option<TcpStream>,
}

impl Handshake {
    pub fn run(endpoint: &str, proxy_uri: &str, connect_timeout: Duration) -> Result<Self> {
        let proxy = ProxyAddr::parse(proxy_uri)?;
        let endpoint = endpoint.to_owned();

        let (done_tx, done_rx) = mpsc::sync_channel(1);
        let (sock_tx, sock_rx) = mpsc::sync_channel(1);

        thread::Builder::new()
            .name("socks".to_owned())
            .spawn(move || {
                //Sole send site, the handle sees at most one signal
                let _ = done_tx.send(negotiate_proxied(
                    &endpoint,
                    &proxy,
                    connect_timeout,
                    &sock_tx,
                ));
            })
            .context("Failed to spawn negotiator thread")?;

        Ok(Self {
            done_rx,
            sock_rx,
            sock: Option::default(),
        })
    }

    pub fn wait(mut self) -> Result<TcpStream> {
        self.done_rx
            .recv()
            .context("Negotiator exited without signaling")??;

        self.take_sock()
            .context("Missing stream after successful negotiation")
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Result<TcpStream> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(result) => {
                result?;

                self.take_sock()
                    .context("Missing stream after successful negotiation")
            }
            Err(RecvTimeoutError::Timeout) => {
                self.shutdown();

                //The failed read/write surfaces through the completion channel
                match self.done_rx.recv() {
                    Ok(Err(e)) => Err(e.context("SOCKS5 handshake timed out")),
                    _ => bail!("SOCKS5 handshake timed out"),
                }
            }
            Err(RecvTimeoutError::Disconnected) => bail!("Negotiator exited without signaling"),
        }
    }

    pub fn shutdown(&mut self) {
        if self.sock.is_none() {
            self.sock = self.sock_rx.try_recv().ok();
        }

        let Some(sock) = &self.sock else {
            return; //nothing connected yet
        };

        match sock.shutdown(Shutdown::Both) {
            Ok(()) => (),
            Err(e) if e.kind() == ErrorKind::NotConnected => (),
            Err(e) => panic!("Failed to close proxy stream: {e}"),
        }
    }

    fn take_sock(&mut self) -> Option<TcpStream> {
        if self.sock.is_none() {
            self.sock = self.sock_rx.try_recv().ok();
        }

        self.sock.take()
    }
}

fn negotiate_proxied(
    endpoint: &str,
    proxy: &ProxyAddr,
    timeout: Duration,
    sock_tx: &SyncSender<TcpStream>,
) -> Result<()> {
    let addrs = resolve(&proxy.host, proxy.port)?;
    let sock = try_connect(addrs, timeout)?;

    //Clone for the handle, shutdown and tunneling happen on the caller's side
    let _ = sock_tx.send(sock.try_clone()?);

    debug!("Negotiating with {}:{}", proxy.host, proxy.port);
    Negotiator::new(&sock).negotiate(endpoint)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Cursor},
        net::{TcpListener, TcpStream},
        thread::JoinHandle,
    };

    use super::*;

    struct ScriptedStream {
        replies: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl ScriptedStream {
        fn new(replies: Vec<u8>) -> Self {
            Self {
                replies: Cursor::new(replies),
                written: Vec::default(),
            }
        }

        fn remaining(&self) -> usize {
            self.replies.get_ref().len() - usize::try_from(self.replies.position()).unwrap()
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.replies.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn script(frames: &[&[u8]]) -> ScriptedStream {
        ScriptedStream::new(frames.concat())
    }

    #[test]
    fn method_selection_frame() {
        let mut stream = script(&[&[0x05, 0x00], &[0x05, 0x00, 0x00, 0x01], &[0u8; 6]]);
        Negotiator::new(&mut stream).negotiate("ws://example.com").unwrap();

        assert_eq!(stream.written[..3], [0x05, 0x01, 0x00]);
    }

    #[test]
    fn connect_frame() {
        let mut stream = script(&[&[0x05, 0x00], &[0x05, 0x00, 0x00, 0x01], &[0u8; 6]]);
        Negotiator::new(&mut stream)
            .negotiate("ws://example.com:1080")
            .unwrap();

        let mut expected = vec![0x05, 0x01, 0x00, 0x03, 0x0B];
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&1080u16.to_be_bytes());
        assert_eq!(&stream.written[3..], &expected[..]);
    }

    #[test]
    fn ipv4_reply_tail() {
        let mut stream = script(&[&[0x05, 0x00], &[0x05, 0x00, 0x00, 0x01], &[0u8; 6]]);
        Negotiator::new(&mut stream).negotiate("ws://example.com").unwrap();

        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn ipv6_reply_tail() {
        let mut stream = script(&[&[0x05, 0x00], &[0x05, 0x00, 0x00, 0x04], &[0u8; 18]]);
        Negotiator::new(&mut stream).negotiate("ws://example.com").unwrap();

        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn domain_reply_tail() {
        let mut stream = script(&[
            &[0x05, 0x00],
            &[0x05, 0x00, 0x00, 0x03],
            &[0x04],
            b"host",
            &[0x04, 0x38],
        ]);
        Negotiator::new(&mut stream).negotiate("ws://example.com").unwrap();

        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn rejected_connect_preserves_reply_code() {
        let mut stream = script(&[&[0x05, 0x00], &[0x05, 0x04, 0x00, 0x01], &[0u8; 6]]);
        let err = Negotiator::new(&mut stream)
            .negotiate("ws://example.com")
            .unwrap_err();

        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::Rejected(0x04)));
        assert_eq!(stream.remaining(), 6); //tail is not consumed on rejection
    }

    #[test]
    fn truncated_reply_is_a_transport_error() {
        let mut stream = script(&[&[0x05, 0x00], &[0x05]]);
        let err = Negotiator::new(&mut stream)
            .negotiate("ws://example.com")
            .unwrap_err();

        let io_error = err.downcast_ref::<io::Error>().unwrap();
        assert_eq!(io_error.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn target_parse_is_deferred() {
        let mut stream = script(&[&[0x05, 0x00]]);
        let err = Negotiator::new(&mut stream)
            .negotiate("ftp://example.com")
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidTarget(_))
        ));
        assert_eq!(stream.written.len(), 3); //method selection was already sent
    }

    #[test]
    fn invalid_proxy_fails_before_io() {
        let err = Handshake::run("ws://example.com", "socks5://localhost", Duration::from_secs(1))
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidProxy(_))
        ));
    }

    fn local_proxy<F>(server: F) -> (String, JoinHandle<()>)
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let proxy_uri = format!("socks5://{}", listener.local_addr().unwrap());

        let handle = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            server(sock);
        });

        (proxy_uri, handle)
    }

    fn read_connect_request(sock: &mut TcpStream) {
        let mut method_selection = [0u8; 3];
        sock.read_exact(&mut method_selection).unwrap();
        assert_eq!(method_selection, [0x05, 0x01, 0x00]);
        sock.write_all(&[0x05, 0x00]).unwrap();

        let mut header = [0u8; 5];
        sock.read_exact(&mut header).unwrap();
        assert_eq!(header[..4], [0x05, 0x01, 0x00, 0x03]);

        let mut rest = vec![0u8; usize::from(header[4]) + 2];
        sock.read_exact(&mut rest).unwrap();
    }

    #[test]
    fn handshake_over_tcp() {
        let (proxy_uri, server) = local_proxy(|mut sock| {
            read_connect_request(&mut sock);
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38])
                .unwrap();
            sock.write_all(b"ok").unwrap();
        });

        let handshake =
            Handshake::run("ws://example.com:1080", &proxy_uri, Duration::from_secs(5)).unwrap();
        let mut tunnel = handshake.wait().unwrap();

        let mut buf = [0u8; 2];
        tunnel.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");

        server.join().unwrap();
    }

    #[test]
    fn completion_signaled_exactly_once() {
        let (proxy_uri, server) = local_proxy(|mut sock| {
            read_connect_request(&mut sock);
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38])
                .unwrap();
        });

        let handshake =
            Handshake::run("ws://example.com", &proxy_uri, Duration::from_secs(5)).unwrap();
        server.join().unwrap();

        handshake.done_rx.recv().unwrap().unwrap();

        //The worker has a single send site and exits after it, a second
        //signal can never arrive
        assert!(handshake.done_rx.recv().is_err());
    }

    #[test]
    fn shutdown_fails_pending_read() {
        let (connected_tx, connected_rx) = mpsc::sync_channel(1);
        let (proxy_uri, server) = local_proxy(move |mut sock| {
            read_connect_request(&mut sock);
            connected_tx.send(()).unwrap();

            //Hold the connection open without replying until the client goes away
            let mut buf = [0u8; 1];
            let _ = sock.read(&mut buf);
        });

        let mut handshake =
            Handshake::run("ws://example.com", &proxy_uri, Duration::from_secs(5)).unwrap();
        connected_rx.recv().unwrap();

        handshake.shutdown();
        handshake.shutdown(); //idempotent
        assert!(handshake.wait().is_err());

        server.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let (proxy_uri, server) = local_proxy(|mut sock| {
            let mut method_selection = [0u8; 3];
            sock.read_exact(&mut method_selection).unwrap();

            //Never reply
            let mut rest = Vec::new();
            let _ = sock.read_to_end(&mut rest);
        });

        let handshake =
            Handshake::run("ws://example.com", &proxy_uri, Duration::from_secs(5)).unwrap();
        assert!(handshake.wait_timeout(Duration::from_millis(200)).is_err());

        server.join().unwrap();
    }
}
