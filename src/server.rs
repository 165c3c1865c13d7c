use crate::config::Config;
use crate::directory::Directory;
use crate::error::ResultCode;
use crate::ldap_handler::{Request, Response, Session};
use crate::ldap_protocol::{
    encode_ldap_message, parse_ldap_message, parse_ldap_message_header, request_tag,
    response_ops, response_tag_for_request, BerWriter, ExtendedResponse, LdapMessage, LdapResult,
    ProtocolOp,
};
use crate::metrics::Metrics;
use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// OID of the unsolicited Notice of Disconnection (RFC 4511 4.4.1).
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// Largest LDAPMessage accepted from a client.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Top-level LDAP message is always a SEQUENCE (BER tag 0x30).
const LDAP_MESSAGE_SEQUENCE_TAG: u8 = 0x30;

/// Client stream: either plain TCP or TLS-wrapped (ldap:// and ldaps://).
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Result of trying to parse one LDAP message from the buffer.
pub enum TryParseResult {
    /// Not enough data yet.
    Incomplete,
    Message(LdapMessage),
    /// Well-framed but undecodable message, already consumed from the buffer.
    /// `response_tag` is None when the request kind has no response.
    ParseError {
        message_id: i32,
        response_tag: Option<u8>,
    },
}

/// Connection slots shared by every listener. None when unbounded.
pub fn connection_slots(config: &Config) -> Option<Arc<Semaphore>> {
    config
        .connection_limit()
        .map(|limit| Arc::new(Semaphore::new(limit)))
}

pub struct LdapServer {
    listener: TcpListener,
    directory: Directory,
    metrics: Arc<Metrics>,
    /// When Some, connections are LDAPS.
    tls_acceptor: Option<TlsAcceptor>,
    slots: Option<Arc<Semaphore>>,
}

impl LdapServer {
    /// Bind a listener. Port 0 picks a free port; see [`LdapServer::local_addr`].
    pub async fn bind(
        addr: &str,
        directory: Directory,
        metrics: Arc<Metrics>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        let slots = connection_slots(directory.config());
        Ok(Self {
            listener,
            directory,
            metrics,
            tls_acceptor,
            slots,
        })
    }

    /// Share connection slots with another listener.
    pub fn with_connection_slots(mut self, slots: Option<Arc<Semaphore>>) -> Self {
        self.slots = slots;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Accept connections until `shutdown` turns true, then wait for every
    /// connection to finish its in-flight operation and close.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let LdapServer {
            listener,
            directory,
            metrics,
            tls_acceptor,
            slots,
        } = self;
        let addr = listener.local_addr()?;
        let scheme = if tls_acceptor.is_some() { "ldaps" } else { "ldap" };
        info!("LDAP directory listening on {}://{}", scheme, addr);

        let signal = shutdown.clone();
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accept) => accept,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let permit = match &slots {
                        Some(slots) => match Arc::clone(slots).try_acquire_owned() {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                warn!("Connection limit reached, closing connection from {}", peer_addr);
                                metrics.connection_rejected();
                                drop(stream);
                                continue;
                            }
                        },
                        None => None,
                    };
                    debug!("New connection from {}", peer_addr);
                    let session = directory.connection();
                    let metrics = Arc::clone(&metrics);
                    let acceptor = tls_acceptor.clone();
                    let shutdown = signal.clone();
                    connections.spawn(async move {
                        let _permit = permit;
                        metrics.connection_opened();
                        let client_stream = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => Some(ClientStream::Tls(Box::new(tls_stream))),
                                Err(e) => {
                                    warn!("TLS handshake failed for {}: {}", peer_addr, e);
                                    None
                                }
                            },
                            None => Some(ClientStream::Tcp(stream)),
                        };
                        if let Some(client_stream) = client_stream {
                            if let Err(e) =
                                handle_client(client_stream, peer_addr, session, &metrics, shutdown).await
                            {
                                error!("Error handling client {}: {}", peer_addr, e);
                            }
                        }
                        metrics.connection_closed();
                    });
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        info!(
            "Listener {}://{} stopped; waiting for {} connections",
            scheme,
            addr,
            connections.len()
        );
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!("Connection task failed: {}", e);
            }
        }
        Ok(())
    }
}

async fn handle_client(
    mut stream: ClientStream,
    peer_addr: SocketAddr,
    mut session: Session,
    metrics: &Metrics,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    debug!("Handling client connection from {}", peer_addr);
    let mut buffer = BytesMut::with_capacity(4096);
    let mut read_buf = vec![0u8; 4096];

    loop {
        // Serve every complete message already buffered.
        loop {
            let parsed = match try_parse_message(&mut buffer) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Invalid LDAP framing from {}: {}", peer_addr, e);
                    metrics.inc_parse_error();
                    let notice = encode_notice_of_disconnection(ResultCode::ProtocolError, &e.to_string())?;
                    let _ = stream.write_all(&notice).await;
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
            };
            match parsed {
                TryParseResult::Incomplete => break,
                TryParseResult::ParseError {
                    message_id,
                    response_tag,
                } => {
                    metrics.inc_parse_error();
                    if let Some(response_tag) = response_tag {
                        let data = encode_error_response(
                            message_id,
                            response_tag,
                            ResultCode::ProtocolError,
                            "",
                            "Failed to parse LDAP message",
                        );
                        stream.write_all(&data).await?;
                        stream.flush().await?;
                    }
                }
                TryParseResult::Message(message) => {
                    if !process_message(&mut stream, &mut session, message, metrics).await? {
                        debug!("Client {} unbound", peer_addr);
                        let _ = stream.shutdown().await;
                        return Ok(());
                    }
                }
            }
        }

        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            read = stream.read(&mut read_buf) => {
                let n = read.with_context(|| format!("Read from {}", peer_addr))?;
                if n == 0 {
                    debug!("Client {} disconnected", peer_addr);
                    return Ok(());
                }
                buffer.extend_from_slice(&read_buf[..n]);
            }
            _ = shutdown.changed() => {}
        }
    }

    debug!("Closing connection from {} for shutdown", peer_addr);
    let notice = encode_notice_of_disconnection(ResultCode::Unavailable, "Server is shutting down")?;
    let _ = stream.write_all(&notice).await;
    let _ = stream.shutdown().await;
    Ok(())
}

/// Execute one message and write its responses. Returns false once the client has unbound.
async fn process_message(
    stream: &mut ClientStream,
    session: &mut Session,
    message: LdapMessage,
    metrics: &Metrics,
) -> Result<bool> {
    let LdapMessage {
        message_id,
        protocol_op,
        controls,
    } = message;
    // No controls are implemented, so only critical ones matter.
    let critical_control = controls
        .iter()
        .flatten()
        .find(|c| c.critical)
        .map(|c| c.ctype.clone());

    match protocol_op {
        ProtocolOp::Request(request) => {
            let op = request.operation();
            if matches!(request, Request::Unbind) {
                session.execute(request).await;
                metrics.inc_request(op);
                return Ok(false);
            }
            let tag = request_tag(&request);
            let start = Instant::now();
            let response = match critical_control {
                Some(oid) => {
                    let mut response = Response::with_code(ResultCode::UnavailableCriticalExtension);
                    response.diagnostic_message = format!("Unsupported critical control {}", oid);
                    response
                }
                None => session.execute(request).await,
            };
            debug!(
                "{} #{} -> {} ({} entries)",
                op,
                message_id,
                response.result_code.name(),
                response.entries.len()
            );
            metrics.observe(op, response.result_code, start.elapsed());
            for protocol_op in response_ops(tag, response) {
                let data = encode_ldap_message(&LdapMessage {
                    message_id,
                    protocol_op,
                    controls: None,
                })?;
                stream.write_all(&data).await?;
            }
            stream.flush().await?;
        }
        ProtocolOp::AbandonRequest(abandoned) => {
            // Operations run to completion before the next message is read.
            debug!("Abandon of message {} ignored", abandoned);
            metrics.inc_request("abandon");
        }
        ProtocolOp::ExtendedRequest(extended) => {
            let start = Instant::now();
            debug!("Rejecting extended operation {}", extended.request_name);
            let result = LdapResult::new(
                ResultCode::ProtocolError,
                &format!("Unsupported extended operation {}", extended.request_name),
            );
            metrics.observe("extended", result.result_code, start.elapsed());
            let data = encode_ldap_message(&LdapMessage {
                message_id,
                protocol_op: ProtocolOp::ExtendedResponse(ExtendedResponse {
                    result,
                    response_name: None,
                }),
                controls: None,
            })?;
            stream.write_all(&data).await?;
            stream.flush().await?;
        }
        other => {
            warn!("Ignoring unexpected protocol op from client: {:?}", other);
        }
    }
    Ok(true)
}

/// Total size of the BER element at the start of `buffer`, once its header is complete.
fn frame_length(buffer: &[u8]) -> Result<Option<usize>> {
    if buffer.len() < 2 {
        return Ok(None);
    }
    let first_byte = buffer[1];
    if (first_byte & 0x80) == 0 {
        // Short form
        return Ok(Some(2 + first_byte as usize));
    }
    // Long form
    let length_bytes = (first_byte & 0x7F) as usize;
    if length_bytes == 0 || length_bytes > 4 {
        anyhow::bail!("Invalid length encoding");
    }
    if buffer.len() < 2 + length_bytes {
        return Ok(None);
    }
    let length = buffer[2..2 + length_bytes]
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize);
    Ok(Some(2 + length_bytes + length))
}

fn try_parse_message(buffer: &mut BytesMut) -> Result<TryParseResult> {
    if buffer.is_empty() {
        return Ok(TryParseResult::Incomplete);
    }
    if buffer[0] != LDAP_MESSAGE_SEQUENCE_TAG {
        anyhow::bail!("Expected LDAPMessage SEQUENCE, got tag 0x{:02X}", buffer[0]);
    }
    let Some(total_length) = frame_length(buffer)? else {
        return Ok(TryParseResult::Incomplete);
    };
    if total_length > MAX_MESSAGE_SIZE {
        anyhow::bail!("Message of {} bytes exceeds the {} byte limit", total_length, MAX_MESSAGE_SIZE);
    }
    if buffer.len() < total_length {
        // Not enough data yet
        return Ok(TryParseResult::Incomplete);
    }

    let slice = &buffer[..total_length];
    let result = match parse_ldap_message(slice) {
        Ok(message) => TryParseResult::Message(message),
        Err(e) => {
            let hex_preview: String = slice
                .iter()
                .take(64)
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ");
            warn!(
                "Failed to parse LDAP message: {} (first 64 bytes: {})",
                e, hex_preview
            );
            let (message_id, response_tag) = match parse_ldap_message_header(slice) {
                Ok((message_id, request_tag)) => (message_id, response_tag_for_request(request_tag)),
                Err(_) => (0, None),
            };
            TryParseResult::ParseError {
                message_id,
                response_tag,
            }
        }
    };
    buffer.advance(total_length);
    Ok(result)
}

fn encode_error_response(
    message_id: i32,
    response_tag: u8,
    result_code: ResultCode,
    matched_dn: &str,
    diagnostic_message: &str,
) -> Vec<u8> {
    let mut writer = BerWriter::new();
    writer.write_sequence(|w| {
        w.write_integer(message_id);
        w.write_constructed(response_tag, |w| {
            w.write_enumerated(result_code.code());
            w.write_string(matched_dn);
            w.write_string(diagnostic_message);
        });
    });
    writer.into_vec()
}

fn encode_notice_of_disconnection(result_code: ResultCode, diagnostic_message: &str) -> Result<Vec<u8>> {
    encode_ldap_message(&LdapMessage {
        message_id: 0,
        protocol_op: ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: LdapResult::new(result_code, diagnostic_message),
            response_name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
        }),
        controls: None,
    })
}
