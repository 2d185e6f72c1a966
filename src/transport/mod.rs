use crate::config::SocketConfig;
use crate::protocol::{self, Packet};
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info_span, warn};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to configure socket ({operation}): {source}")]
    SocketConfig {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("connection {0} is closed")]
    Closed(SessionId),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The slice of a connection the request pacing core needs.
pub trait Link: Send + Sync + 'static {
    fn session_id(&self) -> SessionId;

    /// Writes one already-framed request.
    fn send(&self, frame: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Idempotent; never blocks.
    fn close(&self);
}

/// Receives everything the reader task decodes for a connection.
pub trait InboundHandler<L: Link>: Send + Sync + 'static {
    fn on_packet(&self, link: &L, packet: Packet) -> anyhow::Result<()>;

    /// Called once, after the reader task stops for any reason.
    fn on_closed(&self, _link: &L) {}
}

pub struct Connection {
    session_id: SessionId,
    peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

/// Read half of a freshly established connection, not yet being polled.
pub struct Inbound {
    reader: OwnedReadHalf,
    max_frame_size: usize,
}

impl Connection {
    pub async fn establish(
        host: &str,
        port: u16,
        config: &SocketConfig,
    ) -> Result<(Arc<Self>, Inbound), TransportError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| TransportError::Connect {
                addr: format!("{}:{}", host, port),
                source,
            })?;

        configure_socket(&stream, config)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);

        let connection = Arc::new(Self {
            session_id: SessionId::next(),
            peer,
            writer: Mutex::new(writer),
            closed,
        });
        let inbound = Inbound {
            reader,
            max_frame_size: config.max_frame_size,
        };

        Ok((connection, inbound))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(session = %self.session_id, error = %e, "write half shutdown failed");
        }
    }
}

impl Link for Connection {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.session_id));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        Ok(())
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

impl Inbound {
    pub fn spawn<H>(self, connection: Arc<Connection>, handler: Arc<H>) -> JoinHandle<()>
    where
        H: InboundHandler<Connection>,
    {
        let span = info_span!("inbound", session = %connection.session_id, peer = %connection.peer);
        tokio::spawn(self.run(connection, handler).instrument(span))
    }

    async fn run<H>(mut self, connection: Arc<Connection>, handler: Arc<H>)
    where
        H: InboundHandler<Connection>,
    {
        let mut closed = connection.closed.subscribe();

        loop {
            if connection.is_closed() {
                debug!("closed locally");
                break;
            }

            tokio::select! {
                _ = closed.changed() => continue,
                frame = protocol::read_frame(&mut self.reader, self.max_frame_size) => {
                    match frame {
                        Ok(Some(bytes)) => match Packet::from_bytes(&bytes) {
                            Ok(packet) => dispatch(&*handler, &connection, packet),
                            Err(e) => warn!(error = %e, "dropping undecodable frame"),
                        },
                        Ok(None) => {
                            debug!("peer closed the connection");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "read failed");
                            break;
                        }
                    }
                }
            }
        }

        connection.close();
        connection.shutdown_writer().await;
        handler.on_closed(&connection);
    }
}

fn dispatch<H>(handler: &H, connection: &Connection, packet: Packet)
where
    H: InboundHandler<Connection>,
{
    match catch_unwind(AssertUnwindSafe(|| handler.on_packet(connection, packet))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %format_args!("{e:#}"), "dropped inbound message"),
        Err(_) => error!("inbound handler panicked; message dropped"),
    }
}

fn configure_socket(stream: &TcpStream, config: &SocketConfig) -> Result<(), TransportError> {
    let sock_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(config.keepalive_secs))
        .with_interval(Duration::from_secs(10));
    sock_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|source| TransportError::SocketConfig {
            operation: "keepalive",
            source,
        })?;

    sock_ref
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|source| TransportError::SocketConfig {
            operation: "send buffer",
            source,
        })?;
    sock_ref
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|source| TransportError::SocketConfig {
            operation: "recv buffer",
            source,
        })?;

    stream
        .set_nodelay(config.nodelay)
        .map_err(|source| TransportError::SocketConfig {
            operation: "nodelay",
            source,
        })?;

    Ok(())
}
