//! Background source discovery with a process-wide cache.
//!
//! One worker thread refreshes the list every 2 seconds using a 2 second
//! discovery window; HTTP reads the cache and never blocks on discovery.

use super::{list_sources, SourceInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

const DISCOVERY_INTERVAL: Duration = Duration::from_secs(2);
const DISCOVERY_WINDOW_MS: u32 = 2000;

static STARTED: AtomicBool = AtomicBool::new(false);
static STOP: AtomicBool = AtomicBool::new(false);
static SOURCES: RwLock<Vec<SourceInfo>> = RwLock::new(Vec::new());

/// Entries the SDK announces for its own plumbing; not real sources.
fn is_helper_entry(name: &str) -> bool {
    name.to_ascii_lowercase().contains("remote connection")
}

/// Launch the background discovery worker. Safe to call repeatedly; only the
/// first call starts a thread.
pub fn start_background_discovery() {
    if STARTED.swap(true, Ordering::SeqCst) {
        return;
    }
    STOP.store(false, Ordering::SeqCst);
    std::thread::Builder::new()
        .name("ndi-discovery".into())
        .spawn(|| {
            let mut prev_count = usize::MAX;
            while !STOP.load(Ordering::SeqCst) {
                let found: Vec<SourceInfo> = list_sources(DISCOVERY_WINDOW_MS)
                    .into_iter()
                    .filter(|s| !is_helper_entry(&s.name))
                    .collect();
                if !found.is_empty() {
                    if prev_count != found.len() {
                        prev_count = found.len();
                        log::info!("NDI discovery: found {} source(s)", prev_count);
                    }
                    if let Ok(mut cache) = SOURCES.write() {
                        *cache = found;
                    }
                }
                std::thread::sleep(DISCOVERY_INTERVAL);
            }
        })
        .ok();
}

/// Stop the discovery worker (used by tests; the server runs it for life).
pub fn stop_background_discovery() {
    STOP.store(true, Ordering::SeqCst);
    STARTED.store(false, Ordering::SeqCst);
}

/// The most recently observed non-empty source list.
pub fn cached_sources() -> Vec<SourceInfo> {
    SOURCES.read().map(|c| c.clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_entries_are_filtered() {
        assert!(is_helper_entry("MACHINE (Remote Connection 1)"));
        assert!(is_helper_entry("remote connection"));
        assert!(!is_helper_entry("OBS (Main Output)"));
    }

    #[test]
    fn test_cache_starts_empty() {
        // Discovery has not run in this test process.
        let _ = cached_sources();
    }
}
