use crate::config::{Config, SocketConfig, TargetConfig};
use crate::driver::RequestDriver;
use crate::gate::{FlowGates, SharedGates};
use crate::handler::ResponseHandler;
use crate::protocol::Packet;
use crate::stats::SharedStats;
use crate::transport::{Connection, InboundHandler, Link, SessionId, TransportError};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, info_span};

type Sessions = Arc<DashMap<SessionId, Arc<Connection>>>;

/// Opens the configured connections and starts one request driver per
/// connection. Nothing joins the drivers; a connection's entries disappear
/// when its transport closes.
pub struct ConnectionPool {
    target: TargetConfig,
    socket: SocketConfig,
    connections: usize,
    quota: u64,
    stats: SharedStats,
    gates: SharedGates,
    sessions: Sessions,
    handler: Arc<PoolHandler>,
}

struct PoolHandler {
    responses: ResponseHandler,
    gates: SharedGates,
    sessions: Sessions,
}

impl InboundHandler<Connection> for PoolHandler {
    fn on_packet(&self, link: &Connection, packet: Packet) -> anyhow::Result<()> {
        self.responses.handle(link, packet)?;
        Ok(())
    }

    fn on_closed(&self, link: &Connection) {
        let session_id = link.session_id();
        if self.gates.close_and_retire(session_id) {
            debug!(session = %session_id, "connection ended before its quota");
        }
        self.sessions.remove(&session_id);
    }
}

impl ConnectionPool {
    pub fn new(config: &Config, stats: SharedStats) -> Self {
        let gates = FlowGates::shared();
        let sessions: Sessions = Arc::new(DashMap::new());
        let quota = config.run.requests_per_connection;

        let handler = Arc::new(PoolHandler {
            responses: ResponseHandler::new(stats.clone(), gates.clone(), quota),
            gates: gates.clone(),
            sessions: sessions.clone(),
        });

        Self {
            target: config.target.clone(),
            socket: config.socket.clone(),
            connections: config.run.connections,
            quota,
            stats,
            gates,
            sessions,
            handler,
        }
    }

    /// Establishes connections one after another. A failed connection is
    /// logged and skipped. Returns how many came up.
    pub async fn start(&self) -> usize {
        let mut established = 0;

        for index in 0..self.connections {
            let span = info_span!("connect", index);
            match self.open().instrument(span).await {
                Ok(session_id) => {
                    info!(session = %session_id, "connection {} ready", index);
                    established += 1;
                }
                Err(e) => error!(error = %e, "connection {} failed", index),
            }
        }

        info!(
            "{}/{} connections established",
            established, self.connections
        );
        established
    }

    async fn open(&self) -> Result<SessionId, TransportError> {
        let (connection, inbound) =
            Connection::establish(&self.target.addr, self.target.port, &self.socket).await?;
        let session_id = connection.session_id();
        debug!(session = %session_id, peer = %connection.peer(), "connected");

        let gate = self.gates.register(session_id);
        self.gates.advance(session_id);
        self.sessions.insert(session_id, connection.clone());

        inbound.spawn(connection.clone(), self.handler.clone());
        RequestDriver::new(
            connection,
            gate,
            self.stats.clone(),
            self.quota,
            self.socket.max_frame_size,
        )
        .spawn();

        Ok(session_id)
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn gates(&self) -> &SharedGates {
        &self.gates
    }
}
