//! Process-wide counters and live-resource gauges, all atomic.
//!
//! The counters observe backpressure: `frames_in >= frames_encoded +
//! frames_dropped`, and the gap between `frames_encoded` and `samples_sent`
//! is the writer-queue drop rate.

use crate::encode::Codec;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

static FRAMES_IN: AtomicU64 = AtomicU64::new(0);
static FRAMES_ENCODED: AtomicU64 = AtomicU64::new(0);
static FRAMES_DROPPED: AtomicU64 = AtomicU64::new(0);
static SAMPLES_SENT: AtomicU64 = AtomicU64::new(0);

static ACTIVE_PIPELINES: AtomicI64 = AtomicI64::new(0);
static ACTIVE_VP8: AtomicI64 = AtomicI64::new(0);
static ACTIVE_VP9: AtomicI64 = AtomicI64::new(0);
static ACTIVE_AV1: AtomicI64 = AtomicI64::new(0);
static ACTIVE_SOURCES: AtomicI64 = AtomicI64::new(0);

pub fn inc_frames_in() {
    FRAMES_IN.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_frames_encoded() {
    FRAMES_ENCODED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_frames_dropped() {
    FRAMES_DROPPED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_samples_sent(n: usize) {
    if n > 0 {
        SAMPLES_SENT.fetch_add(n as u64, Ordering::Relaxed);
    }
}

fn codec_gauge(codec: Codec) -> &'static AtomicI64 {
    match codec {
        Codec::Vp8 => &ACTIVE_VP8,
        Codec::Vp9 => &ACTIVE_VP9,
        Codec::Av1 => &ACTIVE_AV1,
    }
}

pub fn register_pipeline(codec: Codec) {
    ACTIVE_PIPELINES.fetch_add(1, Ordering::SeqCst);
    codec_gauge(codec).fetch_add(1, Ordering::SeqCst);
}

pub fn unregister_pipeline(codec: Codec) {
    ACTIVE_PIPELINES.fetch_sub(1, Ordering::SeqCst);
    codec_gauge(codec).fetch_sub(1, Ordering::SeqCst);
}

pub fn register_source() {
    ACTIVE_SOURCES.fetch_add(1, Ordering::SeqCst);
}

pub fn unregister_source() {
    ACTIVE_SOURCES.fetch_sub(1, Ordering::SeqCst);
}

/// Reset the monotonic counters (gauges track live resources and are left
/// alone). Called once at startup.
pub fn reset_counters() {
    FRAMES_IN.store(0, Ordering::SeqCst);
    FRAMES_ENCODED.store(0, Ordering::SeqCst);
    FRAMES_DROPPED.store(0, Ordering::SeqCst);
    SAMPLES_SENT.store(0, Ordering::SeqCst);
}

#[derive(Debug, Clone, Serialize)]
pub struct Counters {
    pub frames_in: u64,
    pub frames_encoded: u64,
    pub frames_dropped: u64,
    pub samples_sent: u64,
}

pub fn counters() -> Counters {
    Counters {
        frames_in: FRAMES_IN.load(Ordering::Relaxed),
        frames_encoded: FRAMES_ENCODED.load(Ordering::Relaxed),
        frames_dropped: FRAMES_DROPPED.load(Ordering::Relaxed),
        samples_sent: SAMPLES_SENT.load(Ordering::Relaxed),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Gauges {
    pub active_pipelines: i64,
    pub active_vp8: i64,
    pub active_vp9: i64,
    pub active_av1: i64,
    pub active_sources: i64,
}

pub fn gauges() -> Gauges {
    Gauges {
        active_pipelines: ACTIVE_PIPELINES.load(Ordering::SeqCst),
        active_vp8: ACTIVE_VP8.load(Ordering::SeqCst),
        active_vp9: ACTIVE_VP9.load(Ordering::SeqCst),
        active_av1: ACTIVE_AV1.load(Ordering::SeqCst),
        active_sources: ACTIVE_SOURCES.load(Ordering::SeqCst),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub worker_threads: usize,
    pub alive_tasks: usize,
}

/// Live task numbers from the tokio runtime, the closest analogue of a
/// goroutine count for leak detection.
pub fn runtime_stats() -> RuntimeStats {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let m = handle.metrics();
            RuntimeStats {
                worker_threads: m.num_workers(),
                alive_tasks: m.num_alive_tasks(),
            }
        }
        Err(_) => RuntimeStats {
            worker_threads: 0,
            alive_tasks: 0,
        },
    }
}
