//! End-to-end WHEP negotiation against the in-process router: real SDP
//! offers from a webrtc-rs peer, shared-pipeline and per-mount sessions,
//! variant sharing, and teardown.

#![cfg(feature = "vpx")]

use bytes::Bytes;
use clap::Parser;
use crabcast::config::Config;
use crabcast::http::{handle, AppState};
use crabcast::mount::{MountManager, Selection, SharedStream};
use crabcast::session::SessionManager;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

fn test_state() -> Arc<AppState> {
    let cfg = Config::parse_from([
        "crabcast",
        "--width",
        "320",
        "--height",
        "180",
        "--fps",
        "30",
        "--bitrate-kbps",
        "500",
    ]);
    let defaults = cfg.stream_defaults();
    Arc::new(AppState {
        sessions: SessionManager::new(),
        mounts: MountManager::new(defaults),
        shared: Arc::new(SharedStream::new(defaults)),
        selection: Mutex::new(Selection {
            name: "Splash".to_string(),
            url: String::new(),
        }),
        cfg,
    })
}

fn request(method: &str, path: &str, body: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("Content-Type", "application/sdp")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

async fn body_string(resp: Response<Full<Bytes>>) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// A receive-only video offer with ICE candidates gathered, as a WHEP player
/// would send.
async fn recvonly_offer() -> String {
    let mut media = MediaEngine::default();
    media.register_default_codecs().unwrap();
    let api = APIBuilder::new().with_media_engine(media).build();
    let pc = api.new_peer_connection(RTCConfiguration::default()).await.unwrap();
    pc.add_transceiver_from_kind(
        RTPCodecType::Video,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }),
    )
    .await
    .unwrap();
    let offer = pc.create_offer(None).await.unwrap();
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await.unwrap();
    let _ = gather_complete.recv().await;
    let sdp = pc.local_description().await.unwrap().sdp;
    pc.close().await.unwrap();
    sdp
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_whep_default_happy_path() {
    let state = test_state();
    let offer = recvonly_offer().await;

    let resp = handle(request("POST", "/whep", &offer), Arc::clone(&state)).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(resp.headers()["Content-Type"], "application/sdp");
    let location = resp.headers()["Location"].to_str().unwrap().to_string();
    assert!(location.starts_with("/whep/"));
    let answer = body_string(resp).await;
    assert!(answer.contains("v=0"));
    assert!(answer.contains("VP8"), "answer should negotiate VP8");

    assert_eq!(state.sessions.count(), 1);
    assert!(state.shared.is_running().await);

    // DELETE ends the session and, once idle, the shared pipeline.
    let resp = handle(request("DELETE", &location, ""), Arc::clone(&state)).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(state.sessions.count(), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!state.shared.is_running().await);

    // Idempotent: deleting again is still 204.
    let resp = handle(request("DELETE", &location, ""), state).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_variant_sharing_uses_one_mount() {
    let state = test_state();
    let path = "/whep/ndi/ndi-splash?w=320&h=180&fps=30&bitrateKbps=500";

    let offer_a = recvonly_offer().await;
    let resp_a = handle(request("POST", path, &offer_a), Arc::clone(&state)).await;
    assert_eq!(resp_a.status(), StatusCode::CREATED);
    assert_eq!(resp_a.headers()["X-Resolution"].to_str().unwrap(), "320x180@30");
    assert_eq!(resp_a.headers()["X-Bitrate-Kbps"].to_str().unwrap(), "500");
    let location_a = resp_a.headers()["Location"].to_str().unwrap().to_string();
    assert!(location_a.starts_with("/whep/ndi/ndi-splash/sessions/"));

    let offer_b = recvonly_offer().await;
    let resp_b = handle(request("POST", path, &offer_b), Arc::clone(&state)).await;
    assert_eq!(resp_b.status(), StatusCode::CREATED);
    let location_b = resp_b.headers()["Location"].to_str().unwrap().to_string();

    // Equal variant keys share a single pipeline.
    assert_eq!(state.mounts.mount_count(), 1);
    assert_eq!(state.sessions.count(), 2);

    // Closing one session leaves the mount running for the other.
    let resp = handle(request("DELETE", &location_a, ""), Arc::clone(&state)).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(state.sessions.count(), 1);
    assert_eq!(state.mounts.mount_count(), 1);

    // Closing the last session arms the idle TTL; the mount stays for now.
    let resp = handle(request("DELETE", &location_b, ""), Arc::clone(&state)).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(state.sessions.count(), 0);
    assert_eq!(state.mounts.mount_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mount_session_patch_is_accepted() {
    let state = test_state();
    let offer = recvonly_offer().await;
    let resp = handle(
        request("POST", "/whep/ndi/ndi-splash?w=320&h=180", &offer),
        Arc::clone(&state),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let location = resp.headers()["Location"].to_str().unwrap().to_string();

    let resp = handle(request("PATCH", &location, "candidate data"), Arc::clone(&state)).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = handle(request("DELETE", &location, ""), state).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_splash_key_is_case_insensitive() {
    let state = test_state();
    let offer = recvonly_offer().await;
    let resp = handle(
        request("POST", "/whep/ndi/SPLASH?w=320&h=180", &offer),
        Arc::clone(&state),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    // The canonical slug and the alias share one mount key.
    let offer2 = recvonly_offer().await;
    let resp2 = handle(
        request("POST", "/whep/ndi/ndi-splash?w=320&h=180", &offer2),
        Arc::clone(&state),
    )
    .await;
    assert_eq!(resp2.status(), StatusCode::CREATED);
    assert_eq!(state.mounts.mount_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_garbage_offer_is_client_error() {
    let state = test_state();
    let resp = handle(request("POST", "/whep", "this is not sdp"), state).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_health_reports_live_session() {
    let state = test_state();
    let offer = recvonly_offer().await;
    let resp = handle(request("POST", "/whep", &offer), Arc::clone(&state)).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let location = resp.headers()["Location"].to_str().unwrap().to_string();

    let resp = handle(request("GET", "/health", ""), Arc::clone(&state)).await;
    let parsed: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(parsed["sessions"], 1);
    let detail = &parsed["sessions_detail"][0];
    assert_eq!(detail["codec"], "vp8");
    assert!(detail["pc_state"].is_string());

    let _ = handle(request("DELETE", &location, ""), state).await;
}
