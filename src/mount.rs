//! Mount manager: a keyed registry of shared encoder pipelines.
//!
//! A mount is one running pipeline (source → encoder → broadcaster) for a
//! (source, variant) tuple, refcounted by attached sessions. Mounts are
//! created lazily on first attach, torn down after an idle grace period when
//! the last session leaves, and reaped by a provisional timer when a failed
//! negotiation never attaches at all.

use crate::config::StreamDefaults;
use crate::encode::Codec;
use crate::errors::CastError;
use crate::source::{NdiSource, Source, SourceDescriptor, SplashSource, SPLASH_URL};
use crate::stream::{Pipeline, PipelineConfig, SampleBroadcaster};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Grace period between the last session detaching and teardown.
pub const MOUNT_IDLE_TTL: Duration = Duration::from_secs(60);
/// Window for the first session to attach after mount creation.
pub const NO_SESSION_TTL: Duration = Duration::from_secs(10);
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(1);

/// Pipelines are keyed by source and encoding variant; sessions whose keys
/// collide share one encoder. Zero width/height means "native size".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub source_key: String,
    pub width: usize,
    pub height: usize,
    pub fps: u32,
    pub bitrate_kbps: u32,
}

impl VariantKey {
    pub fn composite(&self) -> String {
        format!(
            "{}|w{}|h{}|f{}|b{}",
            self.source_key, self.width, self.height, self.fps, self.bitrate_kbps
        )
    }
}

/// Variant constraints from a session request; zero means "use defaults".
#[derive(Debug, Clone, Copy, Default)]
pub struct VariantRequest {
    pub width: usize,
    pub height: usize,
    pub fps: u32,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MountState {
    Starting,
    Running,
    Stopped,
}

type PipelineSlot = Arc<Mutex<Option<Pipeline>>>;

struct MountInner {
    state: MountState,
    source: Option<Arc<Source>>,
    supervisor: Option<JoinHandle<()>>,
    sessions: HashSet<String>,
    idle_timer: Option<JoinHandle<()>>,
    no_session_timer: Option<JoinHandle<()>>,
    actual_width: usize,
    actual_height: usize,
}

pub struct Mount {
    pub key: VariantKey,
    pub name: String,
    pub url: String,
    pub codec: Codec,
    pub broadcaster: Arc<SampleBroadcaster>,
    pub created: DateTime<Utc>,
    pipeline: PipelineSlot,
    inner: Mutex<MountInner>,
}

impl Mount {
    fn new(key: VariantKey, desc: &SourceDescriptor, codec: Codec) -> Mount {
        Mount {
            key,
            name: desc.name.clone(),
            url: desc.url.clone(),
            codec,
            broadcaster: SampleBroadcaster::new(),
            created: Utc::now(),
            pipeline: Arc::new(Mutex::new(None)),
            inner: Mutex::new(MountInner {
                state: MountState::Starting,
                source: None,
                supervisor: None,
                sessions: HashSet::new(),
                idle_timer: None,
                no_session_timer: None,
                actual_width: 0,
                actual_height: 0,
            }),
        }
    }

    pub fn state(&self) -> MountState {
        self.inner.lock().expect("mount lock").state
    }

    pub fn ref_count(&self) -> usize {
        self.inner.lock().expect("mount lock").sessions.len()
    }

    /// Actual encoder geometry after native-size adoption, for response
    /// headers.
    pub fn actual_resolution(&self) -> (usize, usize) {
        let inner = self.inner.lock().expect("mount lock");
        (inner.actual_width, inner.actual_height)
    }

    /// Attaching a session cancels any armed idle or provisional timer.
    fn add_session(&self, id: &str) {
        let mut inner = self.inner.lock().expect("mount lock");
        inner.sessions.insert(id.to_string());
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }
        if let Some(timer) = inner.no_session_timer.take() {
            timer.abort();
        }
    }

    /// Detaching the last session arms the idle timer built by `arm_idle`.
    fn remove_session(&self, id: &str, arm_idle: impl FnOnce() -> JoinHandle<()>) {
        let mut inner = self.inner.lock().expect("mount lock");
        inner.sessions.remove(id);
        if inner.sessions.is_empty() && inner.idle_timer.is_none() && inner.state == MountState::Running {
            inner.idle_timer = Some(arm_idle());
        }
    }
}

pub struct MountManager {
    defaults: StreamDefaults,
    mounts: Mutex<HashMap<VariantKey, Arc<Mount>>>,
}

impl MountManager {
    pub fn new(defaults: StreamDefaults) -> Arc<MountManager> {
        Arc::new(MountManager {
            defaults,
            mounts: Mutex::new(HashMap::new()),
        })
    }

    /// Look up or lazily create the mount for a source and variant. The
    /// registry lock is held only to check and publish; source construction
    /// and pipeline start run outside it. A source that cannot be opened
    /// falls back to the synthetic generator, so the mount always starts
    /// unless the encoder itself fails.
    pub async fn ensure(
        self: &Arc<Self>,
        desc: &SourceDescriptor,
        want: VariantRequest,
    ) -> Result<Arc<Mount>, CastError> {
        let fps = if want.fps > 0 { want.fps } else { self.defaults.fps };
        let bitrate = if want.bitrate_kbps > 0 {
            want.bitrate_kbps
        } else {
            self.defaults.bitrate_kbps
        };
        let key = VariantKey {
            source_key: desc.id.clone(),
            width: want.width,
            height: want.height,
            fps,
            bitrate_kbps: bitrate,
        };

        let mount = {
            let mut mounts = self.mounts.lock().expect("registry lock");
            if let Some(existing) = mounts.get(&key) {
                if existing.state() != MountState::Stopped {
                    return Ok(Arc::clone(existing));
                }
            }
            let mount = Arc::new(Mount::new(key.clone(), desc, self.defaults.codec));
            mounts.insert(key, Arc::clone(&mount));
            mount
        };

        match self.start_mount(&mount).await {
            Ok(()) => Ok(mount),
            Err(e) => {
                log::warn!("mount {} start failed: {}", mount.key.composite(), e);
                self.teardown(&mount);
                Err(e)
            }
        }
    }

    async fn start_mount(self: &Arc<Self>, mount: &Arc<Mount>) -> Result<(), CastError> {
        let d = self.defaults;
        let key = &mount.key;
        let width = if key.width > 0 { key.width } else { d.width };
        let height = if key.height > 0 { key.height } else { d.height };

        let source: Arc<Source> = if is_splash(&mount.name, &mount.url) {
            Arc::new(Source::Splash(SplashSource::new(width, height)))
        } else {
            match NdiSource::new(&mount.url, &mount.name) {
                Ok(ndi) => {
                    if key.width > 0 && key.height > 0 {
                        ndi.set_output_size(key.width, key.height);
                    }
                    Arc::new(Source::Ndi(ndi))
                }
                Err(e) => {
                    log::warn!("source {} unavailable ({}), falling back to synthetic", mount.name, e);
                    Arc::new(Source::Splash(SplashSource::new(width, height)))
                }
            }
        };

        let pipeline = Pipeline::start(PipelineConfig {
            width,
            height,
            fps: key.fps,
            bitrate_kbps: key.bitrate_kbps,
            codec: mount.codec,
            vp8_speed: d.vp8_speed,
            vp8_dropframe: d.vp8_dropframe,
            source: Arc::clone(&source),
            sink: Arc::clone(&mount.broadcaster),
        })
        .await?;
        let (actual_w, actual_h) = pipeline.dimensions();
        *mount.pipeline.lock().expect("pipeline slot") = Some(pipeline);

        // Restart on native resolution changes only when the session did not
        // pin a target size; a pinned target is absorbed by the source-side
        // scaler instead.
        let supervisor = if source.reports_dimensions() && (key.width == 0 || key.height == 0) {
            Some(spawn_resolution_supervisor(
                Arc::clone(&source),
                Arc::clone(&mount.pipeline),
                Arc::clone(&mount.broadcaster),
                SupervisorParams {
                    codec: mount.codec,
                    fps: key.fps,
                    bitrate_kbps: key.bitrate_kbps,
                    vp8_speed: d.vp8_speed,
                    vp8_dropframe: d.vp8_dropframe,
                },
                mount.key.composite(),
            ))
        } else {
            None
        };

        let mut inner = mount.inner.lock().expect("mount lock");
        inner.state = MountState::Running;
        inner.source = Some(source);
        inner.supervisor = supervisor;
        inner.actual_width = actual_w;
        inner.actual_height = actual_h;
        if inner.sessions.is_empty() && inner.no_session_timer.is_none() {
            inner.no_session_timer = Some(self.spawn_teardown_timer(mount.key.clone(), NO_SESSION_TTL));
        }
        Ok(())
    }

    pub fn attach(&self, mount: &Mount, session_id: &str) {
        mount.add_session(session_id);
    }

    /// Detach a session; when the mount becomes empty the idle-TTL countdown
    /// starts.
    pub fn detach(self: &Arc<Self>, key: &VariantKey, session_id: &str) {
        let mount = {
            self.mounts.lock().expect("registry lock").get(key).cloned()
        };
        if let Some(mount) = mount {
            let manager = Arc::clone(self);
            let timer_key = key.clone();
            mount.remove_session(session_id, move || {
                manager.spawn_teardown_timer(timer_key, MOUNT_IDLE_TTL)
            });
        }
    }

    fn spawn_teardown_timer(self: &Arc<Self>, key: VariantKey, ttl: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            manager.teardown_if_idle(&key);
        })
    }

    fn teardown_if_idle(&self, key: &VariantKey) {
        let mount = {
            self.mounts.lock().expect("registry lock").get(key).cloned()
        };
        let Some(mount) = mount else { return };
        if mount.ref_count() > 0 {
            return;
        }
        self.teardown(&mount);
        log::info!("Mount {} torn down (idle)", key.composite());
    }

    /// One-shot: supervisor first, then pipeline, source, broadcaster, and
    /// finally removal from the registry.
    fn teardown(&self, mount: &Arc<Mount>) {
        let source = {
            let mut inner = mount.inner.lock().expect("mount lock");
            if inner.state == MountState::Stopped {
                return;
            }
            inner.state = MountState::Stopped;
            if let Some(supervisor) = inner.supervisor.take() {
                supervisor.abort();
            }
            if let Some(timer) = inner.idle_timer.take() {
                timer.abort();
            }
            if let Some(timer) = inner.no_session_timer.take() {
                timer.abort();
            }
            inner.source.take()
        };
        if let Some(pipeline) = mount.pipeline.lock().expect("pipeline slot").take() {
            pipeline.stop();
        }
        if let Some(source) = source {
            source.stop();
        }
        mount.broadcaster.close();

        let mut mounts = self.mounts.lock().expect("registry lock");
        if let Some(existing) = mounts.get(&mount.key) {
            if Arc::ptr_eq(existing, mount) {
                mounts.remove(&mount.key);
            }
        }
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.lock().expect("registry lock").len()
    }
}

pub fn is_splash(name: &str, url: &str) -> bool {
    name.eq_ignore_ascii_case("splash") || url.eq_ignore_ascii_case(SPLASH_URL)
}

#[derive(Clone, Copy)]
struct SupervisorParams {
    codec: Codec,
    fps: u32,
    bitrate_kbps: u32,
    vp8_speed: u32,
    vp8_dropframe: u32,
}

/// Samples `source.last()` once a second; on a native resolution change it
/// stops the current pipeline and starts a fresh one at the new geometry,
/// reusing the broadcaster so attached tracks never renegotiate.
fn spawn_resolution_supervisor(
    source: Arc<Source>,
    slot: PipelineSlot,
    sink: Arc<SampleBroadcaster>,
    params: SupervisorParams,
    label: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SUPERVISOR_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(frame) = source.last() else { continue };
            let (fw, fh) = (frame.width, frame.height);
            drop(frame);
            if fw < 2 || fh < 2 {
                continue;
            }
            let current = slot.lock().expect("pipeline slot").as_ref().map(|p| p.dimensions());
            let Some((cw, ch)) = current else { continue };
            if (fw, fh) == (cw, ch) {
                continue;
            }
            log::info!(
                "Pipeline({}): source resolution change {}x{} -> {}x{}, restarting",
                label,
                cw,
                ch,
                fw,
                fh
            );
            if let Some(pipeline) = slot.lock().expect("pipeline slot").as_ref() {
                pipeline.stop();
            }
            match Pipeline::start(PipelineConfig {
                width: fw,
                height: fh,
                fps: params.fps,
                bitrate_kbps: params.bitrate_kbps,
                codec: params.codec,
                vp8_speed: params.vp8_speed,
                vp8_dropframe: params.vp8_dropframe,
                source: Arc::clone(&source),
                sink: Arc::clone(&sink),
            })
            .await
            {
                Ok(pipeline) => {
                    *slot.lock().expect("pipeline slot") = Some(pipeline);
                }
                Err(e) => log::warn!("Pipeline({}) restart failed: {}", label, e),
            }
        }
    })
}

/// Current global source selection for the default `/whep` endpoint.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub name: String,
    pub url: String,
}

impl Selection {
    fn wants_splash(&self) -> bool {
        is_splash(&self.name, &self.url)
    }

    fn is_empty(&self) -> bool {
        self.name.is_empty() && self.url.is_empty()
    }
}

struct SharedInner {
    codec: Codec,
    broadcaster: Arc<SampleBroadcaster>,
    source: Arc<Source>,
    pipeline: PipelineSlot,
    supervisor: Option<JoinHandle<()>>,
}

/// The process-wide shared pipeline behind the default `POST /whep`
/// endpoint: one encoder for the globally selected source, fanning out to
/// every default session. Stopped when the last session leaves to save CPU.
pub struct SharedStream {
    defaults: StreamDefaults,
    inner: tokio::sync::Mutex<Option<SharedInner>>,
}

impl SharedStream {
    pub fn new(defaults: StreamDefaults) -> SharedStream {
        SharedStream {
            defaults,
            inner: tokio::sync::Mutex::new(None),
        }
    }

    /// Ensure a shared pipeline for this codec exists and return its
    /// broadcaster. A codec change tears the previous pipeline down first.
    pub async fn ensure(&self, codec: Codec, selection: &Selection) -> Result<Arc<SampleBroadcaster>, CastError> {
        let mut guard = self.inner.lock().await;
        if let Some(existing) = guard.as_ref() {
            if existing.codec == codec {
                return Ok(Arc::clone(&existing.broadcaster));
            }
        }
        if let Some(previous) = guard.take() {
            stop_shared(previous);
        }
        let broadcaster = SampleBroadcaster::new();
        let built = self.build(codec, selection, Arc::clone(&broadcaster)).await?;
        *guard = Some(built);
        Ok(broadcaster)
    }

    /// Apply the current selection to a running shared pipeline, reusing the
    /// broadcaster so attached sessions switch sources without renegotiation.
    /// No-op when nothing is running.
    pub async fn restart_with(&self, selection: &Selection) -> Result<(), CastError> {
        let mut guard = self.inner.lock().await;
        let Some(existing) = guard.take() else {
            return Ok(());
        };
        let codec = existing.codec;
        let broadcaster = Arc::clone(&existing.broadcaster);
        if let Some(supervisor) = existing.supervisor {
            supervisor.abort();
        }
        if let Some(pipeline) = existing.pipeline.lock().expect("pipeline slot").take() {
            pipeline.stop();
        }
        existing.source.stop();
        let built = self.build(codec, selection, broadcaster).await?;
        *guard = Some(built);
        Ok(())
    }

    /// Tear the shared pipeline down once no default sessions remain.
    pub async fn stop_if_idle(&self, remaining_sessions: usize) {
        if remaining_sessions > 0 {
            return;
        }
        let mut guard = self.inner.lock().await;
        if let Some(inner) = guard.take() {
            stop_shared(inner);
            log::info!("Shared pipeline stopped (no active sessions)");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    async fn build(
        &self,
        codec: Codec,
        selection: &Selection,
        broadcaster: Arc<SampleBroadcaster>,
    ) -> Result<SharedInner, CastError> {
        let d = self.defaults;
        let source: Arc<Source> = if selection.is_empty() || selection.wants_splash() {
            Arc::new(Source::Splash(SplashSource::new(d.width, d.height)))
        } else {
            match NdiSource::new(&selection.url, &selection.name) {
                Ok(ndi) => {
                    if d.width > 0 && d.height > 0 {
                        ndi.set_output_size(d.width, d.height);
                    }
                    Arc::new(Source::Ndi(ndi))
                }
                Err(e) => {
                    log::warn!("NDI source unavailable ({}), falling back to synthetic", e);
                    Arc::new(Source::Splash(SplashSource::new(d.width, d.height)))
                }
            }
        };

        let pipeline = Pipeline::start(PipelineConfig {
            width: d.width,
            height: d.height,
            fps: d.fps,
            bitrate_kbps: d.bitrate_kbps,
            codec,
            vp8_speed: d.vp8_speed,
            vp8_dropframe: d.vp8_dropframe,
            source: Arc::clone(&source),
            sink: Arc::clone(&broadcaster),
        })
        .await?;
        let slot: PipelineSlot = Arc::new(Mutex::new(Some(pipeline)));

        let supervisor = if source.reports_dimensions() {
            Some(spawn_resolution_supervisor(
                Arc::clone(&source),
                Arc::clone(&slot),
                Arc::clone(&broadcaster),
                SupervisorParams {
                    codec,
                    fps: d.fps,
                    bitrate_kbps: d.bitrate_kbps,
                    vp8_speed: d.vp8_speed,
                    vp8_dropframe: d.vp8_dropframe,
                },
                "shared".to_string(),
            ))
        } else {
            None
        };

        Ok(SharedInner {
            codec,
            broadcaster,
            source,
            pipeline: slot,
            supervisor,
        })
    }
}

fn stop_shared(inner: SharedInner) {
    if let Some(supervisor) = inner.supervisor {
        supervisor.abort();
    }
    if let Some(pipeline) = inner.pipeline.lock().expect("pipeline slot").take() {
        pipeline.stop();
    }
    inner.source.stop();
    inner.broadcaster.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_key_composite_format() {
        let key = VariantKey {
            source_key: "ndi-splash".to_string(),
            width: 640,
            height: 360,
            fps: 30,
            bitrate_kbps: 2000,
        };
        assert_eq!(key.composite(), "ndi-splash|w640|h360|f30|b2000");
    }

    #[test]
    fn test_variant_keys_collide_for_equal_requests() {
        let a = VariantKey {
            source_key: "cam".into(),
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_kbps: 4000,
        };
        let b = a.clone();
        assert_eq!(a, b);
        let mut map = HashMap::new();
        map.insert(a, 1);
        assert!(map.contains_key(&b));
    }

    #[test]
    fn test_splash_detection() {
        assert!(is_splash("Splash", ""));
        assert!(is_splash("SPLASH", ""));
        assert!(is_splash("", "ndi://Splash"));
        assert!(is_splash("", "NDI://SPLASH"));
        assert!(!is_splash("Studio", "ndi://studio"));
    }
}
