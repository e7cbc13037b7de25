//! crabcast: a WHEP egress server.
//!
//! One HTTP POST with an SDP offer buys a `Location`-addressed WebRTC
//! session carrying a single encoded video track. Upstream video comes from
//! an NDI network receiver or the built-in "Splash" synthetic pattern; each
//! (source, variant) tuple is encoded once and fanned out to every attached
//! peer.
//!
//! # Architecture
//! - Data plane: `source` → `yuv` → `encode` → `stream::SampleBroadcaster`
//!   → per-session sink → peer.
//! - Control plane: `http` → `session::SessionManager` →
//!   `mount::MountManager` → `stream::Pipeline`.
//!
//! # Usage
//! ```bash
//! crabcast --port 8000 --codec vp8
//! curl -X POST --data-binary @offer.sdp -H 'Content-Type: application/sdp' \
//!     http://localhost:8000/whep
//! ```

pub mod config;
pub mod encode;
pub mod errors;
pub mod http;
pub mod mount;
pub mod ndi;
pub mod session;
pub mod source;
pub mod stream;
pub mod yuv;

pub use errors::CastError;

/// Initialize logging for the server.
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "crabcast=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_crate_identity() {
        assert_eq!(NAME, "crabcast");
        assert!(!VERSION.is_empty());
    }
}
