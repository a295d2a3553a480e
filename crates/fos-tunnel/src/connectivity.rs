//! Server connectivity checks
//!
//! Three independent checks against a freshly started local proxy:
//!
//! - **UDP relay**: SOCKS5 UDP ASSOCIATE, then a DNS query relayed through it
//! - **Reachability**: plain TCP connect to the remote server
//! - **Credentials**: SOCKS5 CONNECT through the proxy plus an HTTP HEAD;
//!   a server that rejects the credentials drops the relayed stream, so any
//!   well-formed HTTP response proves them valid
//!
//! Every network operation has its own timeout so a single check cannot
//! hang forever.

use async_trait::async_trait;
use hickory_resolver::proto::op::{Message, MessageType, OpCode, Query};
use hickory_resolver::proto::rr::{Name, RecordType};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::header::{CONNECTION, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NO_AUTH: u8 = 0x00;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// SOCKS5 address types
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
const REPLY_SUCCESS: u8 = 0x00;

/// The individual checks a probe combines
#[async_trait]
pub trait ConnectivityChecks: Send + Sync {
    /// Does UDP relay work through the local proxy?
    async fn is_udp_forwarding_enabled(&self, local: SocketAddr) -> bool;

    /// Does the remote server accept TCP connections?
    async fn is_server_reachable(&self, host: &str, port: u16) -> bool;

    /// Do the configured credentials authenticate?
    async fn validate_server_credentials(&self, local: SocketAddr) -> bool;
}

/// Targets and timeouts for [`SocksConnectivity`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// DNS server queried through the UDP relay
    pub dns_server: SocketAddr,
    /// Name resolved by the UDP check
    pub dns_query_name: String,
    /// HTTP host fetched by the credentials check
    pub http_probe_host: String,
    pub http_probe_port: u16,
    /// Timeout for each network operation
    pub io_timeout_ms: u64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            dns_server: SocketAddr::from(([1, 1, 1, 1], 53)),
            dns_query_name: "example.com".to_string(),
            http_probe_host: "example.com".to_string(),
            http_probe_port: 80,
            io_timeout_ms: 10_000,
        }
    }
}

impl CheckConfig {
    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Socket-level implementation of [`ConnectivityChecks`]
#[derive(Debug, Clone, Default)]
pub struct SocksConnectivity {
    config: CheckConfig,
}

impl SocksConnectivity {
    pub fn new(config: CheckConfig) -> Self {
        Self { config }
    }

    async fn with_timeout<T, F>(&self, fut: F) -> std::io::Result<T>
    where
        F: std::future::Future<Output = std::io::Result<T>>,
    {
        tokio::time::timeout(self.config.io_timeout(), fut)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "check timed out"))?
    }

    async fn udp_relay_roundtrip(&self, local: SocketAddr) -> std::io::Result<()> {
        let mut control = TcpStream::connect(local).await?;
        socks_greet(&mut control).await?;

        // Client address unknown in advance: 0.0.0.0:0
        let mut request = vec![SOCKS5_VERSION, CMD_UDP_ASSOCIATE, 0x00];
        encode_addr(&mut request, &SocketAddr::from(([0, 0, 0, 0], 0)));
        control.write_all(&request).await?;

        let mut relay = read_reply(&mut control).await?;
        if relay.ip().is_unspecified() {
            relay.set_ip(local.ip());
        }
        debug!("UDP relay at {}", relay);

        let bind: SocketAddr = if relay.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(relay).await?;

        let query_id: u16 = rand::random();
        let mut datagram = vec![0x00, 0x00, 0x00];
        encode_addr(&mut datagram, &self.config.dns_server);
        datagram.extend_from_slice(&build_dns_query(query_id, &self.config.dns_query_name)?);
        socket.send(&datagram).await?;

        let mut buf = [0u8; 1500];
        let n = socket.recv(&mut buf).await?;
        let answer = Message::from_vec(strip_udp_header(&buf[..n])?)
            .map_err(|e| invalid(&format!("malformed DNS answer: {}", e)))?;
        if answer.id() == query_id && answer.message_type() == MessageType::Response {
            debug!("DNS answer relayed ({})", answer.response_code());
            Ok(())
        } else {
            Err(invalid("unexpected DNS answer"))
        }
    }

    async fn http_through_proxy(&self, local: SocketAddr) -> std::io::Result<StatusCode> {
        let mut stream = TcpStream::connect(local).await?;
        socks_greet(&mut stream).await?;

        let host = self.config.http_probe_host.as_bytes();
        if host.len() > u8::MAX as usize {
            return Err(invalid("probe host too long"));
        }
        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00, ADDR_DOMAIN, host.len() as u8];
        request.extend_from_slice(host);
        request.extend_from_slice(&self.config.http_probe_port.to_be_bytes());
        stream.write_all(&request).await?;
        read_reply(&mut stream).await?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(std::io::Error::other)?;
        let request = Request::builder()
            .method(Method::HEAD)
            .uri("/")
            .header(HOST, &self.config.http_probe_host)
            .header(CONNECTION, "close")
            .body(Empty::<Bytes>::new())
            .map_err(std::io::Error::other)?;

        // Drive the connection alongside the request; once it ends, the
        // response (or the error) is already with the sender
        let exchange = sender.send_request(request);
        tokio::pin!(exchange);
        tokio::pin!(conn);
        let response = tokio::select! {
            response = &mut exchange => response,
            _ = &mut conn => exchange.await,
        };
        Ok(response.map_err(std::io::Error::other)?.status())
    }
}

#[async_trait]
impl ConnectivityChecks for SocksConnectivity {
    async fn is_udp_forwarding_enabled(&self, local: SocketAddr) -> bool {
        match self.with_timeout(self.udp_relay_roundtrip(local)).await {
            Ok(()) => true,
            Err(e) => {
                debug!("UDP relay check failed: {}", e);
                false
            }
        }
    }

    async fn is_server_reachable(&self, host: &str, port: u16) -> bool {
        match self.with_timeout(TcpStream::connect((host, port))).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Server {}:{} unreachable: {}", host, port, e);
                false
            }
        }
    }

    async fn validate_server_credentials(&self, local: SocketAddr) -> bool {
        match self.with_timeout(self.http_through_proxy(local)).await {
            Ok(status) => {
                debug!("Credentials check answered {}", status);
                true
            }
            Err(e) => {
                debug!("Credentials check failed: {}", e);
                false
            }
        }
    }
}

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

/// Method negotiation, no authentication
async fn socks_greet(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [SOCKS5_VERSION, AUTH_NO_AUTH] {
        return Err(invalid("SOCKS5 method rejected"));
    }
    Ok(())
}

/// Read a request reply and return its bound address
async fn read_reply(stream: &mut TcpStream) -> std::io::Result<SocketAddr> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(invalid("invalid SOCKS version"));
    }
    if header[1] != REPLY_SUCCESS {
        return Err(invalid("SOCKS5 request refused"));
    }

    let ip = match header[3] {
        ADDR_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            IpAddr::V4(Ipv4Addr::from(ip))
        }
        ADDR_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            IpAddr::V6(Ipv6Addr::from(ip))
        }
        ADDR_DOMAIN => {
            // Bound domain names are not useful to us; skip it
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
        _ => return Err(invalid("invalid address type")),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(SocketAddr::new(ip, u16::from_be_bytes(port)))
}

fn encode_addr(buf: &mut Vec<u8>, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(ADDR_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(ADDR_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

/// Skip the SOCKS5 UDP request header (RSV, FRAG, ATYP, DST.ADDR, DST.PORT)
fn strip_udp_header(datagram: &[u8]) -> std::io::Result<&[u8]> {
    if datagram.len() < 4 {
        return Err(invalid("short UDP datagram"));
    }
    let addr_len = match datagram[3] {
        ADDR_IPV4 => 4,
        ADDR_IPV6 => 16,
        ADDR_DOMAIN => 1 + *datagram.get(4).ok_or_else(|| invalid("short UDP datagram"))? as usize,
        _ => return Err(invalid("invalid address type")),
    };
    let start = 4 + addr_len + 2;
    datagram
        .get(start..)
        .ok_or_else(|| invalid("short UDP datagram"))
}

/// Recursive A query for `name`
fn build_dns_query(id: u16, name: &str) -> std::io::Result<Vec<u8>> {
    let name = Name::from_ascii(name).map_err(|e| invalid(&format!("bad query name: {}", e)))?;
    let mut query = Message::new();
    query
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));
    query.to_vec().map_err(|e| invalid(&e.to_string()))
}
