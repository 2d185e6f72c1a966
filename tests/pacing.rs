//! Drivers and the response handler wired through an in-memory link, with
//! replies delivered from a separate task per connection.

use futures::future::join_all;
use pacer::driver::RequestDriver;
use pacer::gate::{FlowGates, SharedGates};
use pacer::handler::ResponseHandler;
use pacer::protocol::{self, DEFAULT_MAX_FRAME_SIZE, Packet};
use pacer::stats::{SharedStats, Stats};
use pacer::transport::{Link, SessionId, TransportError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

struct LoopbackLink {
    id: SessionId,
    wire: mpsc::UnboundedSender<Vec<u8>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closes: AtomicUsize,
}

impl Link for LoopbackLink {
    fn session_id(&self) -> SessionId {
        self.id
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.wire.send(frame).map_err(|_| TransportError::Closed(self.id))
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn connect(
    id: u64,
    handler: Arc<ResponseHandler>,
) -> (Arc<LoopbackLink>, tokio::task::JoinHandle<()>) {
    let (wire, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let link = Arc::new(LoopbackLink {
        id: SessionId(id),
        wire,
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
        closes: AtomicUsize::new(0),
    });

    let peer = link.clone();
    let responder = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let mut bytes = &frame[..];
            let payload = protocol::read_frame(&mut bytes, DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap()
                .unwrap();
            peer.in_flight.fetch_sub(1, Ordering::SeqCst);
            handler
                .handle(&*peer, Packet::from_bytes(&payload).unwrap())
                .unwrap();
        }
    });

    (link, responder)
}

fn setup(quota: u64) -> (SharedStats, SharedGates, Arc<ResponseHandler>) {
    let stats = Stats::shared();
    let gates = FlowGates::shared();
    let handler = Arc::new(ResponseHandler::new(stats.clone(), gates.clone(), quota));
    (stats, gates, handler)
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_connection_completes_its_quota_one_request_at_a_time() {
    let connections = 8;
    let quota = 25;
    let (stats, gates, handler) = setup(quota);

    let mut links = Vec::new();
    let mut drivers = Vec::new();
    for id in 0..connections {
        let (link, _responder) = connect(id, handler.clone());
        let gate = gates.register(link.session_id());
        gates.advance(link.session_id());
        drivers.push(
            RequestDriver::new(link.clone(), gate, stats.clone(), quota, DEFAULT_MAX_FRAME_SIZE)
                .spawn(),
        );
        links.push(link);
    }

    let reports = join_all(drivers).await;
    for report in reports {
        let report = report.unwrap();
        assert_eq!(report.sent, quota);
        assert_eq!(report.failed, 0);
    }

    let total = connections * quota;
    assert!(eventually(|| stats.snapshot().received == total).await);
    assert!(eventually(|| gates.is_empty()).await);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.sent, total);
    assert!(snapshot.received <= snapshot.sent);
    for link in &links {
        assert_eq!(link.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(link.closes.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn received_never_overtakes_sent() {
    let quota = 200;
    let (stats, gates, handler) = setup(quota);

    let mut drivers = Vec::new();
    for id in 0..4 {
        let (link, _responder) = connect(100 + id, handler.clone());
        let gate = gates.register(link.session_id());
        gates.advance(link.session_id());
        drivers.push(
            RequestDriver::new(link, gate, stats.clone(), quota, DEFAULT_MAX_FRAME_SIZE).spawn(),
        );
    }

    let watcher = {
        let stats = stats.clone();
        tokio::spawn(async move {
            for _ in 0..2_000 {
                let snapshot = stats.snapshot();
                assert!(snapshot.received <= snapshot.sent);
                tokio::task::yield_now().await;
            }
        })
    };

    join_all(drivers).await;
    watcher.await.unwrap();
    assert!(eventually(|| stats.snapshot().received == 4 * quota).await);
}
