use crate::gate::{ResponseOutcome, SharedGates};
use crate::protocol::{Message, Packet, ProtocolError};
use crate::stats::SharedStats;
use crate::transport::Link;
use tracing::debug;

/// Turns each decoded reply into statistics and a gate decision for the
/// connection it arrived on.
pub struct ResponseHandler {
    stats: SharedStats,
    gates: SharedGates,
    quota: u64,
}

impl ResponseHandler {
    pub fn new(stats: SharedStats, gates: SharedGates, quota: u64) -> Self {
        Self {
            stats,
            gates,
            quota,
        }
    }

    /// Packets that do not classify are rejected before any counter or gate
    /// is touched. Replies for an unregistered connection are not counted.
    pub fn handle<L: Link>(&self, link: &L, packet: Packet) -> Result<ResponseOutcome, ProtocolError> {
        let message = Message::try_from(packet)?;
        let session_id = link.session_id();

        let outcome = self.gates.record_response(session_id, self.quota);
        if let Message::Heartbeat(heartbeat) = &message
            && outcome != ResponseOutcome::Unregistered
        {
            self.stats.record_receive(heartbeat.latency());
        }

        match outcome {
            ResponseOutcome::Completed { responses } => {
                debug!(session = %session_id, responses, "quota reached, closing connection");
                link.close();
            }
            ResponseOutcome::Advanced { .. } => {}
            ResponseOutcome::Unregistered => {
                debug!(session = %session_id, "reply for a retired connection");
            }
        }

        Ok(outcome)
    }
}
