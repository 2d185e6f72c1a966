use crate::gate::{FlowGate, GateSignal};
use crate::protocol::Heartbeat;
use crate::stats::SharedStats;
use crate::transport::Link;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverReport {
    pub sent: u64,
    pub failed: u64,
    /// The gate was retired before the driver used up its quota.
    pub stopped: bool,
}

/// Sends heartbeats on one connection, one at a time, each only after the
/// gate hands out a token.
pub struct RequestDriver<L: Link> {
    link: Arc<L>,
    gate: FlowGate,
    stats: SharedStats,
    quota: u64,
    max_frame_size: usize,
}

impl<L: Link> RequestDriver<L> {
    pub fn new(
        link: Arc<L>,
        gate: FlowGate,
        stats: SharedStats,
        quota: u64,
        max_frame_size: usize,
    ) -> Self {
        Self {
            link,
            gate,
            stats,
            quota,
            max_frame_size,
        }
    }

    pub fn spawn(self) -> JoinHandle<DriverReport> {
        let span = info_span!("driver", session = %self.link.session_id());
        tokio::spawn(self.run().instrument(span))
    }

    /// Every loop turn consumes one token, whether or not its send succeeds;
    /// the driver never takes more than `quota` tokens.
    pub async fn run(mut self) -> DriverReport {
        let mut report = DriverReport::default();

        while report.sent + report.failed < self.quota {
            if self.gate.wait().await == GateSignal::Stop {
                report.stopped = true;
                self.link.close();
                break;
            }

            let frame = match Heartbeat::now().to_packet().to_frame(self.max_frame_size) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "failed to encode heartbeat");
                    report.failed += 1;
                    continue;
                }
            };

            // counted before the write so a fast reply never outruns it
            self.stats.record_send();
            match self.link.send(frame).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    self.stats.revert_send();
                    report.failed += 1;
                    warn!(error = %e, "send failed");
                }
            }
        }

        debug!(
            sent = report.sent,
            failed = report.failed,
            stopped = report.stopped,
            "driver finished"
        );
        report
    }
}
