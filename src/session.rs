//! WHEP session lifecycle: one peer connection and one outbound video track
//! per session, bound to a mount's broadcaster.
//!
//! State machine: Offered → Answered → Connected → (Closed | Failed |
//! TimedOut). Signalling callbacks only enqueue events; a per-session
//! supervisor task reacts to them, so no heavy work runs in callback
//! context. Close is idempotent and ordered: timeout task, broadcaster
//! detach, peer connection, then the owner's close hook (mount refcount or
//! shared-pipeline idle check).

use crate::encode::Codec;
use crate::errors::CastError;
use crate::mount::VariantKey;
use crate::stream::{Detach, SampleBroadcaster, SampleSink};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Sessions still in New/Connecting this long after the answer are reaped.
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs once when a session closes, with the closing session and the number
/// of sessions remaining.
pub type CloseHook = Box<dyn FnOnce(&Session, usize) + Send + 'static>;

pub struct Session {
    pub id: String,
    pub codec: Codec,
    pub created: DateTime<Utc>,
    pub mount_key: Option<VariantKey>,
    pc: Arc<RTCPeerConnection>,
    detach: Detach,
    state: Mutex<RTCPeerConnectionState>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
    on_close: Mutex<Option<CloseHook>>,
}

/// Per-session entry in `/health`, for leak detection.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    pub id: String,
    pub codec: &'static str,
    pub created: String,
    pub pc_state: String,
    pub has_source: bool,
    pub has_stop: bool,
}

/// Result of a successful WHEP negotiation.
pub struct NewSession {
    pub id: String,
    pub answer_sdp: String,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Arc<SessionManager> {
        Arc::new(SessionManager {
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Negotiate a WHEP offer: build the peer connection and codec-matched
    /// track, attach the track to the broadcaster, answer, and wait for ICE
    /// gathering to complete (non-trickle). Any failure releases the peer
    /// connection and the broadcaster attachment before returning.
    pub async fn create(
        self: &Arc<Self>,
        offer_sdp: String,
        codec: Codec,
        broadcaster: &Arc<SampleBroadcaster>,
        mount_key: Option<VariantKey>,
        on_close: CloseHook,
    ) -> Result<NewSession, CastError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| CastError::SessionError(format!("codec registration failed: {}", e)))?;
        let api = APIBuilder::new().with_media_engine(media).build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(|e| CastError::SessionError(format!("peer connection failed: {}", e)))?,
        );

        let id = Uuid::new_v4().to_string();
        log::info!("WHEP session {}: created ({})", id, codec.as_str());

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: codec.mime_type().to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "crabcast".to_owned(),
        ));
        if let Err(e) = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            let _ = pc.close().await;
            return Err(CastError::SessionError(format!("add_track failed: {}", e)));
        }
        let detach = broadcaster.add(track as Arc<dyn SampleSink>);

        let answer_sdp = match negotiate(&pc, offer_sdp).await {
            Ok(sdp) => sdp,
            Err(e) => {
                detach.detach();
                let _ = pc.close().await;
                return Err(e);
            }
        };

        let session = Arc::new(Session {
            id: id.clone(),
            codec,
            created: Utc::now(),
            mount_key,
            pc: Arc::clone(&pc),
            detach,
            state: Mutex::new(pc.connection_state()),
            timeout_task: Mutex::new(None),
            on_close: Mutex::new(Some(on_close)),
        });
        self.sessions
            .lock()
            .expect("session map lock")
            .insert(id.clone(), Arc::clone(&session));

        // Connection-state events are queued to a supervisor task; the
        // callback itself stays trivial.
        let (state_tx, mut state_rx) = mpsc::unbounded_channel::<RTCPeerConnectionState>();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let _ = state_tx.send(state);
            Box::pin(async {})
        }));
        {
            let manager = Arc::clone(self);
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                while let Some(state) = state_rx.recv().await {
                    log::info!("Session {} state: {}", session.id, state);
                    *session.state.lock().expect("state lock") = state;
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed
                            | RTCPeerConnectionState::Closed
                            | RTCPeerConnectionState::Disconnected
                    ) {
                        manager.close(&session.id).await;
                        break;
                    }
                }
            });
        }

        // Reap sessions whose peers never complete setup.
        {
            let manager = Arc::clone(self);
            let session_for_timeout = Arc::clone(&session);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(SETUP_TIMEOUT).await;
                let state = session_for_timeout.pc.connection_state();
                if matches!(
                    state,
                    RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting
                ) {
                    log::info!(
                        "Session {}: setup timeout, cleaning up (state: {})",
                        session_for_timeout.id,
                        state
                    );
                    manager.close(&session_for_timeout.id).await;
                }
            });
            *session.timeout_task.lock().expect("timeout lock") = Some(handle);
        }

        Ok(NewSession { id, answer_sdp })
    }

    /// Close a session. Idempotent: the map removal decides who cleans up.
    pub async fn close(self: &Arc<Self>, id: &str) {
        let session = {
            self.sessions.lock().expect("session map lock").remove(id)
        };
        let Some(session) = session else { return };
        if let Some(timeout) = session.timeout_task.lock().expect("timeout lock").take() {
            timeout.abort();
        }
        session.detach.detach();
        let _ = session.pc.close().await;
        log::info!("WHEP session {}: closed", id);
        let remaining = self.sessions.lock().expect("session map lock").len();
        let hook = session.on_close.lock().expect("hook lock").take();
        if let Some(hook) = hook {
            hook(&session, remaining);
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().expect("session map lock").len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().expect("session map lock").contains_key(id)
    }

    pub fn details(&self) -> Vec<SessionDetail> {
        self.sessions
            .lock()
            .expect("session map lock")
            .values()
            .map(|s| SessionDetail {
                id: s.id.clone(),
                codec: s.codec.as_str(),
                created: s.created.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                pc_state: s.state.lock().expect("state lock").to_string(),
                has_source: s.mount_key.is_some(),
                has_stop: true,
            })
            .collect()
    }
}

/// WHEP answer flow: remote offer in, local answer out, ICE gathering
/// complete before the SDP leaves the building.
async fn negotiate(pc: &Arc<RTCPeerConnection>, offer_sdp: String) -> Result<String, CastError> {
    let offer = RTCSessionDescription::offer(offer_sdp)
        .map_err(|e| CastError::SessionError(format!("bad SDP offer: {}", e)))?;
    pc.set_remote_description(offer)
        .await
        .map_err(|e| CastError::SessionError(format!("set_remote_description failed: {}", e)))?;
    let answer = pc
        .create_answer(None)
        .await
        .map_err(|e| CastError::SessionError(format!("create_answer failed: {}", e)))?;
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .map_err(|e| CastError::SessionError(format!("set_local_description failed: {}", e)))?;
    let _ = gather_complete.recv().await;
    pc.local_description()
        .await
        .map(|d| d.sdp)
        .ok_or_else(|| CastError::SessionError("no local description after gathering".into()))
}
