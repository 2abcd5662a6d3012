//! Blocking socket transport speaking the memcached ASCII protocol.
//!
//! One connection per server, opened on first use and dropped on any failure
//! so the next request starts from a clean stream. Each phase of a call is
//! bounded by its own timeout: connecting by the connect timeout, writing the
//! request by the poll timeout, and waiting for the reply by
//! [`CallOptions::reply_timeout`].
//!
//! A `noreply` write can still draw an error line from the server, such as
//! `SERVER_ERROR object too large for cache`. After any `noreply` write the
//! next confirmed request on that stream is preceded by a `version` command,
//! and everything up to its `VERSION` reply is discarded.
//!
//! In UDP mode every request is a single datagram with the 8 byte frame
//! header (request id, sequence number, datagram count, reserved). Replies
//! may span several datagrams and are reassembled by sequence number.

use ahash::AHashMap;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::hash_map::Entry;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::{CallOptions, Item, Reply, Request, StoreMode, Transport, TransportError};
use crate::error::Phase;
use crate::server::ServerSpec;

const READ_CHUNK: usize = 16 * 1024;

/// Sent ahead of a confirmed request to delimit replies to `noreply` writes.
const FENCE: &[u8] = b"version\r\n";

/// Size of the UDP frame header.
pub const UDP_HEADER_LEN: usize = 8;

/// Largest request datagram, header included.
pub const MAX_DATAGRAM: usize = 1400;

/// Transport over `std::net` sockets.
#[derive(Debug, Default)]
pub struct SocketTransport {
    udp: bool,
    connections: AHashMap<String, Connection>,
    next_request_id: u16,
}

impl SocketTransport {
    pub fn new(udp: bool) -> Self {
        Self {
            udp,
            ..Default::default()
        }
    }

    pub fn tcp() -> Self {
        Self::new(false)
    }

    pub fn udp() -> Self {
        Self::new(true)
    }

    pub fn is_connected(&self, server: &ServerSpec) -> bool {
        self.connections.contains_key(&server.address())
    }

    fn request_id(&mut self) -> u16 {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.next_request_id
    }
}

impl Transport for SocketTransport {
    fn execute(
        &mut self,
        server: &ServerSpec,
        request: &Request,
        options: &CallOptions,
    ) -> Result<Reply, TransportError> {
        let noreply = options.buffers(request);
        let mut payload = BytesMut::with_capacity(64);
        encode(request, noreply, &mut payload);

        let request_id = self.request_id();
        let address = server.address();
        let connection = match self.connections.entry(address.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let connection = connect(server, self.udp, options.timeouts.connect)?;
                debug!(server = %address, udp = self.udp, "connected");
                entry.insert(connection)
            }
        };

        trace!(server = %address, key = request.key(), noreply, "sending request");
        let result = connection.round_trip(request_id, &payload, expect(request), noreply, options);
        if result.is_err() {
            self.connections.remove(&address);
        }
        result
    }

    fn disconnect(&mut self, server: &ServerSpec) {
        if self.connections.remove(&server.address()).is_some() {
            debug!(server = %server, "disconnected");
        }
    }

    fn disconnect_all(&mut self) {
        self.connections.clear();
    }

    fn fork(&self) -> Self {
        Self::new(self.udp)
    }
}

#[derive(Debug)]
enum Connection {
    Tcp {
        stream: TcpStream,
        recv_buf: BytesMut,
        /// A `noreply` write went out since the last confirmed reply.
        unconfirmed: bool,
    },
    Udp {
        socket: UdpSocket,
    },
}

fn connect(
    server: &ServerSpec,
    udp: bool,
    timeout: Duration,
) -> Result<Connection, TransportError> {
    let addrs = (server.hostname(), server.port())
        .to_socket_addrs()
        .map_err(TransportError::Connect)?;

    let mut last = io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("{server} resolved to no addresses"),
    );
    for addr in addrs {
        if udp {
            match bind_udp(addr) {
                Ok(socket) => return Ok(Connection::Udp { socket }),
                Err(e) => last = e,
            }
            continue;
        }
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).map_err(TransportError::Connect)?;
                return Ok(Connection::Tcp {
                    stream,
                    recv_buf: BytesMut::with_capacity(READ_CHUNK),
                    unconfirmed: false,
                });
            }
            Err(e) if is_timeout(&e) => return Err(TransportError::Timeout(Phase::Connect)),
            Err(e) => last = e,
        }
    }
    Err(TransportError::Connect(last))
}

fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let local = match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let socket = UdpSocket::bind(local)?;
    socket.connect(addr)?;
    Ok(socket)
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

fn classify(e: io::Error, phase: Phase) -> TransportError {
    if is_timeout(&e) {
        TransportError::Timeout(phase)
    } else {
        TransportError::Io(e)
    }
}

impl Connection {
    fn round_trip(
        &mut self,
        request_id: u16,
        payload: &[u8],
        expect: Expect,
        noreply: bool,
        options: &CallOptions,
    ) -> Result<Reply, TransportError> {
        match self {
            Connection::Tcp {
                stream,
                recv_buf,
                unconfirmed,
            } => {
                stream.set_write_timeout(Some(options.timeouts.poll))?;
                if noreply {
                    stream
                        .write_all(payload)
                        .map_err(|e| classify(e, Phase::Poll))?;
                    *unconfirmed = true;
                    return Ok(Reply::Buffered);
                }

                let fenced = std::mem::take(unconfirmed);
                if fenced {
                    stream
                        .write_all(FENCE)
                        .map_err(|e| classify(e, Phase::Poll))?;
                }
                stream
                    .write_all(payload)
                    .map_err(|e| classify(e, Phase::Poll))?;

                let deadline = Instant::now() + options.reply_timeout();
                let mut chunk = [0u8; READ_CHUNK];
                if fenced {
                    skip_to_fence(stream, recv_buf, deadline, &mut chunk)?;
                }
                loop {
                    if let Some((reply, consumed)) = parse_reply(recv_buf, expect)? {
                        recv_buf.advance(consumed);
                        return Ok(reply);
                    }
                    fill(stream, recv_buf, deadline, &mut chunk)?;
                }
            }
            Connection::Udp { socket } => {
                let datagram = frame(request_id, payload)?;
                socket.set_write_timeout(Some(options.timeouts.poll))?;
                socket
                    .send(&datagram)
                    .map_err(|e| classify(e, Phase::Poll))?;
                if noreply {
                    return Ok(Reply::Buffered);
                }
                socket.set_read_timeout(Some(options.reply_timeout()))?;
                let body = receive_datagrams(socket, request_id)?;
                match parse_reply(&body, expect)? {
                    Some((reply, _)) => Ok(reply),
                    None => Err(TransportError::Protocol("truncated datagram reply".into())),
                }
            }
        }
    }
}

/// Read at least one more chunk into `recv_buf` before `deadline`.
fn fill(
    stream: &mut TcpStream,
    recv_buf: &mut BytesMut,
    deadline: Instant,
    chunk: &mut [u8],
) -> Result<(), TransportError> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout(Phase::Receive));
        }
        stream.set_read_timeout(Some(remaining))?;
        match stream.read(chunk) {
            Ok(0) => return Err(TransportError::Closed),
            Ok(n) => {
                recv_buf.extend_from_slice(&chunk[..n]);
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(classify(e, Phase::Receive)),
        }
    }
}

/// Consume the replies to earlier `noreply` writes, through the `VERSION`
/// line that answers [`FENCE`]. Only error lines may precede it.
fn skip_to_fence(
    stream: &mut TcpStream,
    recv_buf: &mut BytesMut,
    deadline: Instant,
    chunk: &mut [u8],
) -> Result<(), TransportError> {
    loop {
        while let Some((line, used)) = next_line(recv_buf) {
            if line.starts_with(b"VERSION ") {
                recv_buf.advance(used);
                return Ok(());
            }
            match parse_line(line)? {
                Reply::ServerError(message) | Reply::ClientError(message) => {
                    debug!(%message, "discarding error reply to a noreply write");
                }
                other => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected reply {other:?} to a noreply write"
                    )));
                }
            }
            recv_buf.advance(used);
        }
        fill(stream, recv_buf, deadline, chunk)?;
    }
}

/// Frame a request as a single datagram.
fn frame(request_id: u16, payload: &[u8]) -> Result<Bytes, TransportError> {
    if payload.len() + UDP_HEADER_LEN > MAX_DATAGRAM {
        return Err(TransportError::Protocol(format!(
            "request of {} bytes does not fit in a datagram",
            payload.len()
        )));
    }
    let mut out = BytesMut::with_capacity(UDP_HEADER_LEN + payload.len());
    out.put_u16(request_id);
    out.put_u16(0);
    out.put_u16(1);
    out.put_u16(0);
    out.put_slice(payload);
    Ok(out.freeze())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    request_id: u16,
    sequence: u16,
    total: u16,
}

fn parse_frame(datagram: &[u8]) -> Option<(FrameHeader, &[u8])> {
    if datagram.len() < UDP_HEADER_LEN {
        return None;
    }
    let field = |i: usize| u16::from_be_bytes([datagram[i], datagram[i + 1]]);
    Some((
        FrameHeader {
            request_id: field(0),
            sequence: field(2),
            total: field(4),
        },
        &datagram[UDP_HEADER_LEN..],
    ))
}

fn receive_datagrams(socket: &UdpSocket, request_id: u16) -> Result<BytesMut, TransportError> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut parts: Vec<Option<Bytes>> = Vec::new();
    let mut received = 0;

    loop {
        let n = socket
            .recv(&mut buf)
            .map_err(|e| classify(e, Phase::Receive))?;
        let Some((header, body)) = parse_frame(&buf[..n]) else {
            return Err(TransportError::Protocol("short datagram".into()));
        };
        // leftovers of an abandoned request
        if header.request_id != request_id {
            continue;
        }
        if parts.is_empty() {
            parts = vec![None; usize::from(header.total.max(1))];
        }
        let slot = parts.get_mut(usize::from(header.sequence)).ok_or_else(|| {
            TransportError::Protocol(format!(
                "datagram {} of {} out of range",
                header.sequence, header.total
            ))
        })?;
        if slot.is_none() {
            *slot = Some(Bytes::copy_from_slice(body));
            received += 1;
        }
        if received == parts.len() {
            break;
        }
    }

    let mut joined = BytesMut::new();
    for part in parts.into_iter().flatten() {
        joined.extend_from_slice(&part);
    }
    Ok(joined)
}

/// Encode a request in the ASCII protocol.
pub fn encode(request: &Request, noreply: bool, buf: &mut BytesMut) {
    match request {
        Request::Get { keys } => encode_retrieval(buf, b"get", keys),
        Request::Gets { keys } => encode_retrieval(buf, b"gets", keys),
        Request::Store {
            mode,
            key,
            value,
            flags,
            exptime,
        } => {
            // <cmd> <key> <flags> <exptime> <bytes> [<cas unique>] [noreply]\r\n<data>\r\n
            buf.put_slice(mode.command().as_bytes());
            buf.put_u8(b' ');
            buf.put_slice(key.as_bytes());
            buf.put_slice(format!(" {flags} {exptime} {}", value.len()).as_bytes());
            if let StoreMode::Cas { unique } = mode {
                buf.put_slice(format!(" {unique}").as_bytes());
            }
            if noreply {
                buf.put_slice(b" noreply");
            }
            buf.put_slice(b"\r\n");
            buf.put_slice(value);
            buf.put_slice(b"\r\n");
        }
        Request::Delete { key } => {
            buf.put_slice(b"delete ");
            buf.put_slice(key.as_bytes());
            if noreply {
                buf.put_slice(b" noreply");
            }
            buf.put_slice(b"\r\n");
        }
        Request::Incr { key, delta } => encode_arithmetic(buf, b"incr", key, *delta),
        Request::Decr { key, delta } => encode_arithmetic(buf, b"decr", key, *delta),
        Request::Flush { delay: 0 } => buf.put_slice(b"flush_all\r\n"),
        Request::Flush { delay } => buf.put_slice(format!("flush_all {delay}\r\n").as_bytes()),
        Request::Stats => buf.put_slice(b"stats\r\n"),
    }
}

fn encode_retrieval(buf: &mut BytesMut, cmd: &[u8], keys: &[String]) {
    buf.put_slice(cmd);
    for key in keys {
        buf.put_u8(b' ');
        buf.put_slice(key.as_bytes());
    }
    buf.put_slice(b"\r\n");
}

fn encode_arithmetic(buf: &mut BytesMut, cmd: &[u8], key: &str, delta: u64) {
    buf.put_slice(cmd);
    buf.put_u8(b' ');
    buf.put_slice(key.as_bytes());
    buf.put_slice(format!(" {delta}\r\n").as_bytes());
}

/// Shape of the reply a request produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// `VALUE` blocks terminated by `END`.
    Values,
    /// `STAT` lines terminated by `END`.
    Stats,
    /// A single status line.
    Line,
}

pub fn expect(request: &Request) -> Expect {
    match request {
        Request::Get { .. } | Request::Gets { .. } => Expect::Values,
        Request::Stats => Expect::Stats,
        _ => Expect::Line,
    }
}

/// Parse one complete reply from the front of `buf`.
///
/// Returns the reply and the number of bytes it occupied, or `None` when more
/// bytes are needed.
pub fn parse_reply(
    buf: &[u8],
    expect: Expect,
) -> Result<Option<(Reply, usize)>, TransportError> {
    match expect {
        Expect::Line => match next_line(buf) {
            Some((line, used)) => Ok(Some((parse_line(line)?, used))),
            None => Ok(None),
        },
        Expect::Values => parse_values(buf),
        Expect::Stats => parse_stats(buf),
    }
}

fn next_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    buf.windows(2)
        .position(|w| w == b"\r\n")
        .map(|end| (&buf[..end], end + 2))
}

fn text(line: &[u8]) -> Result<&str, TransportError> {
    std::str::from_utf8(line)
        .map_err(|_| TransportError::Protocol("reply is not valid utf-8".into()))
}

fn parse_line(line: &[u8]) -> Result<Reply, TransportError> {
    let line = text(line)?;
    let reply = match line {
        "STORED" => Reply::Stored,
        "NOT_STORED" => Reply::NotStored,
        "EXISTS" => Reply::Exists,
        "NOT_FOUND" => Reply::NotFound,
        "DELETED" => Reply::Deleted,
        "OK" => Reply::Ok,
        "ERROR" => Reply::ClientError("unknown command".into()),
        _ => {
            if let Some(message) = line.strip_prefix("SERVER_ERROR ") {
                Reply::ServerError(message.to_string())
            } else if let Some(message) = line.strip_prefix("CLIENT_ERROR ") {
                Reply::ClientError(message.to_string())
            } else if let Ok(value) = line.trim_end().parse::<u64>() {
                // decr may pad the number with spaces
                Reply::Numeric(value)
            } else {
                return Err(TransportError::Protocol(format!("unexpected reply {line:?}")));
            }
        }
    };
    Ok(reply)
}

/// An error line where a multi-line reply was expected.
fn error_line(line: &[u8]) -> Result<Reply, TransportError> {
    match parse_line(line)? {
        reply @ (Reply::ServerError(_) | Reply::ClientError(_)) => Ok(reply),
        other => Err(TransportError::Protocol(format!("unexpected reply {other:?}"))),
    }
}

fn parse_values(buf: &[u8]) -> Result<Option<(Reply, usize)>, TransportError> {
    let mut pos = 0;
    let mut items = Vec::new();

    loop {
        let Some((line, used)) = next_line(&buf[pos..]) else {
            return Ok(None);
        };
        if line == b"END" {
            return Ok(Some((Reply::Values(items), pos + used)));
        }
        if !line.starts_with(b"VALUE ") {
            return Ok(Some((error_line(line)?, pos + used)));
        }

        // VALUE <key> <flags> <bytes> [<cas unique>]
        let header = text(line)?;
        let mut fields = header.split_ascii_whitespace().skip(1);
        let malformed = || TransportError::Protocol(format!("malformed value header {header:?}"));
        let key = fields.next().ok_or_else(malformed)?;
        let flags: u32 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(malformed)?;
        let len: usize = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(malformed)?;
        let cas: u64 = match fields.next() {
            Some(f) => f.parse().map_err(|_| malformed())?,
            None => 0,
        };

        let start = pos + used;
        let end = start
            .checked_add(len)
            .filter(|end| end.checked_add(2).is_some())
            .ok_or_else(|| TransportError::Protocol(format!("value length {len} overflows")))?;
        if buf.len() < end + 2 {
            return Ok(None);
        }
        if &buf[end..end + 2] != b"\r\n" {
            return Err(TransportError::Protocol(format!(
                "value for {key} is not terminated"
            )));
        }
        items.push(Item {
            key: key.to_string(),
            value: Bytes::copy_from_slice(&buf[start..end]),
            flags,
            cas,
        });
        pos = end + 2;
    }
}

fn parse_stats(buf: &[u8]) -> Result<Option<(Reply, usize)>, TransportError> {
    let mut pos = 0;
    let mut stats = Vec::new();

    loop {
        let Some((line, used)) = next_line(&buf[pos..]) else {
            return Ok(None);
        };
        pos += used;
        if line == b"END" {
            return Ok(Some((Reply::Stats(stats), pos)));
        }
        let Some(stat) = line.strip_prefix(b"STAT ") else {
            return Ok(Some((error_line(line)?, pos)));
        };
        let stat = text(stat)?;
        let (name, value) = stat.split_once(' ').unwrap_or((stat, ""));
        stats.push((name.to_string(), value.to_string()));
    }
}
