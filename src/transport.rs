//! Byte transports for one LDAP session: TCP, TLS over TCP, and Unix sockets.
//!
//! [`Transport`] wraps the stream with a coalesced write queue and a PDU
//! assembly buffer. Outgoing PDUs are queued and written in one flush;
//! incoming bytes accumulate until [`frame_length`] reports a whole message.

use bytes::BytesMut;
use rustls::client::ClientConfig;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tracing::debug;

use crate::error::{LdapError, Result};
use crate::ldap_protocol::frame_length;
use crate::tls;
use crate::url::{LdapUrl, Scheme};

const READ_CHUNK: usize = 16 * 1024;

pub enum Stream {
    Tcp(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

pub struct Transport {
    stream: Option<Stream>,
    read_buf: BytesMut,
    write_queue: BytesMut,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind())
            .field("buffered", &self.read_buf.len())
            .field("queued", &self.write_queue.len())
            .finish()
    }
}

impl Transport {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream: Some(stream),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_queue: BytesMut::new(),
        }
    }

    /// Open the stream named by `url`. `ldaps` needs a TLS configuration.
    pub async fn connect(url: &LdapUrl, tls_config: Option<Arc<ClientConfig>>, timeout: Option<Duration>) -> Result<Self> {
        let stream = match timeout {
            Some(limit) => tokio::time::timeout(limit, open_stream(url, tls_config)).await??,
            None => open_stream(url, tls_config).await?,
        };
        debug!("Connected to {} ({})", url.address(), kind_name(&stream));
        Ok(Self::new(stream))
    }

    pub fn kind(&self) -> &'static str {
        self.stream.as_ref().map(kind_name).unwrap_or("closed")
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, Some(Stream::Tls(_)))
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Append an encoded PDU to the write queue.
    pub fn queue(&mut self, pdu: &[u8]) {
        self.write_queue.extend_from_slice(pdu);
    }

    pub fn write_ready(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// A whole PDU is already buffered.
    pub fn read_ready(&self) -> bool {
        matches!(frame_length(&self.read_buf), Ok(Some(_)))
    }

    fn stream_mut(&mut self) -> Result<&mut Stream> {
        self.stream.as_mut().ok_or(LdapError::ClosedConnection)
    }

    /// Write out everything queued so far.
    pub async fn flush(&mut self) -> Result<()> {
        if self.write_queue.is_empty() {
            return Ok(());
        }
        let queued = self.write_queue.split();
        let stream = self.stream_mut()?;
        stream.write_all(&queued).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read until one PDU is complete and return its bytes. Cancel-safe: partial
    /// input stays in the assembly buffer.
    pub async fn read_pdu(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(len) = frame_length(&self.read_buf).map_err(|e| LdapError::Protocol(e.to_string()))? {
                let pdu = self.read_buf.split_to(len);
                return Ok(pdu.to_vec());
            }
            self.read_buf.reserve(READ_CHUNK);
            let stream = self.stream.as_mut().ok_or(LdapError::ClosedConnection)?;
            if stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(LdapError::ConnectionDown("server closed the connection".to_string()));
            }
        }
    }

    /// Upgrade the plain TCP stream in place after a successful StartTLS exchange.
    pub async fn start_tls(&mut self, config: Arc<ClientConfig>, host: &str) -> Result<()> {
        if !self.read_buf.is_empty() {
            return Err(LdapError::Protocol("unexpected data before TLS handshake".to_string()));
        }
        match self.stream.take() {
            Some(Stream::Tcp(tcp)) => {
                let tls = handshake(config, host, tcp).await?;
                self.stream = Some(Stream::Tls(Box::new(tls)));
                debug!("TLS established with {}", host);
                Ok(())
            }
            Some(other) => {
                let kind = kind_name(&other);
                self.stream = Some(other);
                Err(LdapError::InvalidArgument(format!("cannot start TLS on a {} transport", kind)))
            }
            None => Err(LdapError::ClosedConnection),
        }
    }

    pub async fn close(&mut self) {
        self.write_queue.clear();
        self.read_buf.clear();
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    /// Drop buffered input and the stream without a graceful shutdown.
    pub fn abort(&mut self) {
        self.write_queue.clear();
        self.read_buf.clear();
        self.stream = None;
    }

    #[cfg(unix)]
    pub fn as_raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        match self.stream.as_ref()? {
            Stream::Tcp(s) => Some(s.as_raw_fd()),
            Stream::Tls(s) => Some(s.get_ref().0.as_raw_fd()),
            Stream::Unix(s) => Some(s.as_raw_fd()),
        }
    }
}

async fn open_stream(url: &LdapUrl, tls_config: Option<Arc<ClientConfig>>) -> Result<Stream> {
    match url.scheme() {
        Scheme::Ldap => {
            let tcp = TcpStream::connect(url.address()).await?;
            tcp.set_nodelay(true)?;
            Ok(Stream::Tcp(tcp))
        }
        Scheme::Ldaps => {
            let config =
                tls_config.ok_or_else(|| LdapError::Tls("ldaps:// requires a TLS configuration".to_string()))?;
            let tcp = TcpStream::connect(url.address()).await?;
            tcp.set_nodelay(true)?;
            Ok(Stream::Tls(Box::new(handshake(config, url.host(), tcp).await?)))
        }
        #[cfg(unix)]
        Scheme::Ldapi => Ok(Stream::Unix(UnixStream::connect(url.host()).await?)),
        #[cfg(not(unix))]
        Scheme::Ldapi => Err(LdapError::ConnectionError("ldapi:// is only available on Unix".to_string())),
    }
}

fn kind_name(stream: &Stream) -> &'static str {
    match stream {
        Stream::Tcp(_) => "tcp",
        Stream::Tls(_) => "tls",
        #[cfg(unix)]
        Stream::Unix(_) => "unix",
    }
}

async fn handshake(config: Arc<ClientConfig>, host: &str, tcp: TcpStream) -> Result<ClientTlsStream<TcpStream>> {
    let name = tls::server_name(host).map_err(|e| LdapError::Tls(e.to_string()))?;
    TlsConnector::from(config)
        .connect(name, tcp)
        .await
        .map_err(|e| LdapError::Tls(format!("TLS handshake with {} failed: {}", host, e)))
}
