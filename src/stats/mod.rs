use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Process-wide request counters shared by every connection.
///
/// Each field is updated independently; a snapshot may observe `sent` and
/// `received` from slightly different instants.
#[derive(Debug, Default)]
pub struct Stats {
    sent: AtomicU64,
    received: AtomicU64,
    latency_nanos: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStats {
        Arc::new(Self::new())
    }

    pub fn record_send(&self) {
        self.sent.fetch_add(1, Ordering::AcqRel);
    }

    /// Undo a `record_send` whose request never reached the wire.
    pub fn revert_send(&self) {
        let _ = self
            .sent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |sent| {
                sent.checked_sub(1)
            });
    }

    pub fn record_receive(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.latency_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.received.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> Snapshot {
        // received before sent: a reply is only ever counted after its send
        let received = self.received.load(Ordering::Acquire);
        let latency_nanos = self.latency_nanos.load(Ordering::Relaxed);
        let sent = self.sent.load(Ordering::Acquire);

        let average_latency = if received == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(latency_nanos / received)
        };

        Snapshot {
            sent,
            received,
            total_latency: Duration::from_nanos(latency_nanos),
            average_latency,
        }
    }
}

pub type SharedStats = Arc<Stats>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub sent: u64,
    pub received: u64,
    pub total_latency: Duration,
    pub average_latency: Duration,
}

impl Snapshot {
    pub fn average_latency_ms(&self) -> f64 {
        self.average_latency.as_secs_f64() * 1_000.0
    }
}
