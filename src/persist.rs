//! Fire-and-forget persistence.
//!
//! Lanes enqueue records into a bounded queue; a single writer task drains
//! it. A full queue drops the oldest pending record rather than blocking
//! ingestion. Bar metrics are throttled per instrument; trade entries and
//! exits are never throttled. Write failures retry a bounded number of
//! times, then the record is dropped with an error.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::types::SinkRecord;

const WRITE_RETRIES: u32 = 3;

/// Destination for pipeline records. The JSONL file sink stands in for the
/// external document store.
pub trait SignalSink: Send {
    fn write(&mut self, record: &SinkRecord) -> Result<()>;
}

/// One JSON object per line, flushed per record so a crash loses nothing.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening signal sink {:?}", path))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl SignalSink for JsonlSink {
    fn write(&mut self, record: &SinkRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory sink for tests and replay inspection.
#[derive(Clone, Default)]
pub struct MemorySink {
    pub records: Arc<Mutex<Vec<SinkRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<SinkRecord> {
        self.records.lock().expect("sink lock").clone()
    }
}

impl SignalSink for MemorySink {
    fn write(&mut self, record: &SinkRecord) -> Result<()> {
        self.records.lock().expect("sink lock").push(record.clone());
        Ok(())
    }
}

struct QueueInner {
    queue: Mutex<VecDeque<SinkRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

/// Cheap clonable producer handle held by every lane.
#[derive(Clone)]
pub struct PersistHandle {
    inner: Arc<QueueInner>,
}

impl PersistHandle {
    /// Standalone queue with no writer attached; records accumulate until a
    /// writer is spawned (or a test drains them).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queue: Mutex::new(VecDeque::new()),
                capacity,
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Take everything currently queued.
    pub fn drain(&self) -> Vec<SinkRecord> {
        let mut queue = self.inner.queue.lock().expect("persist queue lock");
        queue.drain(..).collect()
    }

    /// Enqueue without blocking. When full, the oldest pending record is
    /// dropped to make room.
    pub fn enqueue(&self, record: SinkRecord) {
        {
            let mut queue = self.inner.queue.lock().expect("persist queue lock");
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    warn!("persistence queue full, {} records dropped so far", dropped);
                }
            }
            queue.push_back(record);
        }
        self.inner.notify.notify_one();
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting the queue as live; the writer drains what remains and
    /// exits.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }
}

/// Spawn the single writer task draining `handle`. Returns the join handle
/// to await at shutdown.
pub fn spawn_writer(
    handle: &PersistHandle,
    mut sink: Box<dyn SignalSink>,
    clock: Arc<dyn Clock>,
    throttle_ms: i64,
) -> JoinHandle<()> {
    let worker = handle.clone();
    tokio::spawn(async move {
        // Last persisted time per instrument, for throttled record kinds.
        let mut last_written: HashMap<String, i64> = HashMap::new();

        loop {
            let record = {
                let mut queue = worker.inner.queue.lock().expect("persist queue lock");
                queue.pop_front()
            };

            let Some(record) = record else {
                if worker.inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                worker.inner.notify.notified().await;
                continue;
            };

            if record.is_throttled() {
                let now = clock.now_ms();
                let key = record.instrument().to_string();
                if let Some(&at) = last_written.get(&key) {
                    if now - at < throttle_ms {
                        continue;
                    }
                }
                last_written.insert(key, now);
            }

            write_with_retry(sink.as_mut(), &record);
        }
        info!("persistence writer drained and stopped");
    })
}

fn write_with_retry(sink: &mut dyn SignalSink, record: &SinkRecord) {
    for attempt in 1..=WRITE_RETRIES {
        match sink.write(record) {
            Ok(()) => return,
            Err(e) if attempt < WRITE_RETRIES => {
                warn!("persist write failed (attempt {}): {:#}", attempt, e);
            }
            Err(e) => {
                error!(
                    "persist write failed {} times, dropping record for {}: {:#}",
                    WRITE_RETRIES,
                    record.instrument(),
                    e
                );
            }
        }
    }
}
