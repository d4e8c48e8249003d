#![allow(dead_code)]

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hirefire::backends::MemoryBroker;
use hirefire::error::BackendError;
use hirefire::inspect::{InspectionCache, TaskStatus};
use hirefire::procs::{load_procs, CeleryApp, CeleryProc, Proc, ProcFactory, ProcMeta, ProcSet};
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

// ========================================
// PROCS
// ========================================

/// A proc reporting a fixed quantity after `delay`, counting its evaluations
/// and how many of them overlap.
#[derive(Debug)]
pub struct ScriptedProc {
    meta: ProcMeta,
    quantity: Result<u64, String>,
    delay: Duration,
    pub probe: Arc<Probe>,
}

#[derive(Debug, Default)]
pub struct Probe {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Probe {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of evaluations seen running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ScriptedProc {
    pub fn new(name: &str, quantity: u64) -> Self {
        Self {
            meta: ProcMeta::new(name, "default").unwrap(),
            quantity: Ok(quantity),
            delay: Duration::ZERO,
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn failing(name: &str, reason: &str) -> Self {
        Self {
            quantity: Err(reason.to_string()),
            ..Self::new(name, 0)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_queues(mut self, queues: &[&str]) -> Self {
        self.meta = ProcMeta::new(self.meta.name().to_string(), queues.to_vec()).unwrap();
        self
    }

    pub fn with_probe(mut self, probe: Arc<Probe>) -> Self {
        self.probe = probe;
        self
    }
}

#[async_trait]
impl Proc for ScriptedProc {
    fn name(&self) -> &str {
        self.meta.name()
    }

    fn queues(&self) -> &[String] {
        self.meta.queues()
    }

    async fn quantity(&self, _cache: &InspectionCache) -> Result<u64, BackendError> {
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.quantity
            .clone()
            .map_err(BackendError::Unavailable)
    }
}

/// Builds a registry from ready-made procs.
pub fn proc_set(procs: Vec<Arc<dyn Proc>>) -> ProcSet {
    load_procs(procs, &ProcFactory::new()).unwrap()
}

/// Delays (ms) that finish out of registration order.
pub fn shuffled_delays(n: usize) -> Vec<u64> {
    (0..n).map(|i| ((i * 7 + 3) % 11) as u64 * 5).collect()
}

// ========================================
// BROKERS
// ========================================

pub fn setup_broker(identity: &str) -> Arc<MemoryBroker> {
    Arc::new(MemoryBroker::new(identity))
}

/// Declares `queue` with `depth` messages and binds it on worker `w1` with the
/// queue name as exchange and routing key.
pub fn declare(broker: &MemoryBroker, queue: &str, depth: u64) {
    broker.declare_queue(queue, depth);
    broker.bind_queue("w1", queue, queue, queue);
}

pub fn hold(broker: &MemoryBroker, queue: &str, status: TaskStatus, n: usize) {
    for _ in 0..n {
        broker.add_task("w1", status, queue, queue);
    }
}

pub fn celery_app(broker: &Arc<MemoryBroker>) -> CeleryApp {
    CeleryApp::new(broker.clone()).with_control(broker.clone())
}

pub fn celery_proc(name: &str, queues: &[&str], broker: &Arc<MemoryBroker>) -> CeleryProc {
    CeleryProc::new(name, queues.to_vec(), celery_app(broker)).unwrap()
}

// ========================================
// LOGS
// ========================================

/// Collects formatted log lines written by a test subscriber.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.contents().lines().filter(|line| line.contains(needle)).count()
    }

    /// A subscriber writing into this capture, to install with
    /// `tracing::subscriber::set_default`.
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
