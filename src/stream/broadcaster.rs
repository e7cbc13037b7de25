//! Single-producer fanout of encoded samples to per-session sinks.
//!
//! Every sink gets its own small bounded queue pumped by its own task, so a
//! stalled peer drops samples instead of blocking the encoder or the other
//! peers. The producer's `write` is a non-blocking enqueue per sink.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Per-sink queue depth; one frame of slack either side of the writer.
const SINK_QUEUE: usize = 4;

/// `webrtc::media::Sample` doesn't derive `Clone` upstream; all of its
/// fields do, so build an owned copy field-by-field.
fn clone_sample(sample: &Sample) -> Sample {
    Sample {
        data: sample.data.clone(),
        timestamp: sample.timestamp,
        duration: sample.duration,
        packet_timestamp: sample.packet_timestamp,
        prev_dropped_packets: sample.prev_dropped_packets,
        prev_padding_packets: sample.prev_padding_packets,
    }
}

/// Anything that can consume encoded samples. Outbound WebRTC tracks are the
/// production sink; tests attach counting or stalled sinks.
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn write(&self, sample: &Sample);
}

#[async_trait]
impl SampleSink for TrackLocalStaticSample {
    async fn write(&self, sample: &Sample) {
        // Write errors mean the peer went away; session cleanup handles it.
        let _ = self.write_sample(sample).await;
    }
}

struct SinkWorker {
    tx: mpsc::Sender<Sample>,
    handle: tokio::task::JoinHandle<()>,
}

struct Inner {
    sinks: HashMap<u64, SinkWorker>,
    next_id: u64,
    closed: bool,
}

/// Fanout hub owned by a mount; sessions attach and detach sinks while the
/// pipeline keeps writing.
pub struct SampleBroadcaster {
    inner: Mutex<Inner>,
}

impl SampleBroadcaster {
    pub fn new() -> Arc<SampleBroadcaster> {
        Arc::new(SampleBroadcaster {
            inner: Mutex::new(Inner {
                sinks: HashMap::new(),
                next_id: 0,
                closed: false,
            }),
        })
    }

    /// Register a sink and spawn its queue worker. The returned handle
    /// removes the sink again; calling it twice is a no-op.
    pub fn add(self: &Arc<Self>, sink: Arc<dyn SampleSink>) -> Detach {
        let mut inner = self.inner.lock().expect("broadcaster lock");
        if inner.closed {
            return Detach::noop();
        }
        let (tx, mut rx) = mpsc::channel::<Sample>(SINK_QUEUE);
        let handle = tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                sink.write(&sample).await;
            }
        });
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sinks.insert(id, SinkWorker { tx, handle });
        Detach {
            broadcaster: Arc::clone(self),
            id,
            done: AtomicBool::new(false),
        }
    }

    /// Fan one sample out to every sink. Full queues drop the sample for
    /// that sink only; after `close` this is a no-op.
    pub fn write(&self, sample: &Sample) {
        let inner = self.inner.lock().expect("broadcaster lock");
        if inner.closed {
            return;
        }
        for worker in inner.sinks.values() {
            let _ = worker.tx.try_send(clone_sample(sample));
        }
    }

    /// Stop all sink workers and reject further writes. One-shot.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("broadcaster lock");
        inner.closed = true;
        for (_, worker) in inner.sinks.drain() {
            worker.handle.abort();
        }
    }

    pub fn sink_count(&self) -> usize {
        self.inner.lock().expect("broadcaster lock").sinks.len()
    }

    fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().expect("broadcaster lock");
        if let Some(worker) = inner.sinks.remove(&id) {
            worker.handle.abort();
        }
    }
}

/// Removes one sink from its broadcaster; idempotent.
pub struct Detach {
    broadcaster: Arc<SampleBroadcaster>,
    id: u64,
    done: AtomicBool,
}

impl Detach {
    /// A detach bound to nothing; used when attaching was impossible.
    pub fn noop() -> Detach {
        Detach {
            broadcaster: SampleBroadcaster::new(),
            id: u64::MAX,
            done: AtomicBool::new(true),
        }
    }

    pub fn detach(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.broadcaster.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingSink {
        received: AtomicUsize,
    }

    #[async_trait]
    impl SampleSink for CountingSink {
        async fn write(&self, _sample: &Sample) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Never completes a write; saturates its queue immediately.
    struct StalledSink;

    #[async_trait]
    impl SampleSink for StalledSink {
        async fn write(&self, _sample: &Sample) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    fn sample() -> Sample {
        Sample {
            data: Bytes::from_static(&[0u8; 16]),
            duration: Duration::from_millis(33),
            timestamp: std::time::SystemTime::now(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_and_detach_restore_sink_set() {
        let bc = SampleBroadcaster::new();
        assert_eq!(bc.sink_count(), 0);
        let detach = bc.add(Arc::new(CountingSink {
            received: AtomicUsize::new(0),
        }));
        assert_eq!(bc.sink_count(), 1);
        detach.detach();
        assert_eq!(bc.sink_count(), 0);
        // second call is a no-op
        detach.detach();
        assert_eq!(bc.sink_count(), 0);
    }

    #[tokio::test]
    async fn test_samples_reach_attached_sink() {
        let bc = SampleBroadcaster::new();
        let sink = Arc::new(CountingSink {
            received: AtomicUsize::new(0),
        });
        let _detach = bc.add(Arc::clone(&sink) as Arc<dyn SampleSink>);
        for _ in 0..3 {
            bc.write(&sample());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.received.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stalled_sink_does_not_starve_others() {
        let bc = SampleBroadcaster::new();
        let fast = Arc::new(CountingSink {
            received: AtomicUsize::new(0),
        });
        let _d1 = bc.add(Arc::clone(&fast) as Arc<dyn SampleSink>);
        let _d2 = bc.add(Arc::new(StalledSink));
        // Far more samples than the stalled sink's queue can hold.
        for _ in 0..32 {
            bc.write(&sample());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            fast.received.load(Ordering::SeqCst) >= 28,
            "fast sink starved: {}",
            fast.received.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_write_after_close_is_noop() {
        let bc = SampleBroadcaster::new();
        let sink = Arc::new(CountingSink {
            received: AtomicUsize::new(0),
        });
        let _detach = bc.add(Arc::clone(&sink) as Arc<dyn SampleSink>);
        bc.close();
        bc.write(&sample());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.received.load(Ordering::SeqCst), 0);
        assert_eq!(bc.sink_count(), 0);
    }

    #[tokio::test]
    async fn test_add_after_close_is_noop() {
        let bc = SampleBroadcaster::new();
        bc.close();
        let detach = bc.add(Arc::new(CountingSink {
            received: AtomicUsize::new(0),
        }));
        assert_eq!(bc.sink_count(), 0);
        detach.detach();
    }
}
