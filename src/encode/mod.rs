//! Video encoders behind one small contract: feed planar I420, get back
//! zero or more compressed access units plus a keyframe flag.
//!
//! VP8 and VP9 wrap libvpx (feature `vpx`); AV1 wraps rav1e (feature `av1`).
//! A build without a codec feature still links: the stub constructors fail
//! with [`CastError::CodecUnavailable`] and everything else keeps working.

pub mod av1;
pub mod vpx;

use crate::errors::CastError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Video codecs this server can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Vp8,
    Vp9,
    Av1,
}

impl Codec {
    /// Parse a codec name; anything unknown falls back to VP8.
    pub fn parse(s: &str) -> Codec {
        match s.to_ascii_lowercase().as_str() {
            "vp9" => Codec::Vp9,
            "av1" => Codec::Av1,
            _ => Codec::Vp8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Codec::Vp8 => "vp8",
            Codec::Vp9 => "vp9",
            Codec::Av1 => "av1",
        }
    }

    /// RTP MIME type for the matching outbound track.
    pub fn mime_type(self) -> &'static str {
        match self {
            Codec::Vp8 => webrtc::api::media_engine::MIME_TYPE_VP8,
            Codec::Vp9 => webrtc::api::media_engine::MIME_TYPE_VP9,
            Codec::Av1 => webrtc::api::media_engine::MIME_TYPE_AV1,
        }
    }
}

/// Parameters shared by every encoder backend.
#[derive(Debug, Clone, Copy)]
pub struct EncoderConfig {
    pub width: usize,
    pub height: usize,
    pub fps: u32,
    pub bitrate_kbps: u32,
    /// `cpu_used` speed knob for libvpx (0 = best, 8 = fastest).
    pub speed: u32,
    /// Drop-frame threshold; 0 disables frame dropping.
    pub dropframe: u32,
}

/// Output of a single encode call: access units plus whether any was a key.
#[derive(Debug, Default)]
pub struct EncodedFrames {
    pub packets: Vec<Bytes>,
    pub keyframe: bool,
}

/// One encoder instance; variant selected by the negotiated codec.
pub enum VideoEncoder {
    Vpx(vpx::VpxEncoder),
    Av1(av1::Av1Encoder),
}

impl VideoEncoder {
    pub fn new(codec: Codec, cfg: &EncoderConfig) -> Result<VideoEncoder, CastError> {
        match codec {
            Codec::Vp8 | Codec::Vp9 => Ok(VideoEncoder::Vpx(vpx::VpxEncoder::new(codec, cfg)?)),
            Codec::Av1 => Ok(VideoEncoder::Av1(av1::Av1Encoder::new(cfg)?)),
        }
    }

    /// Encode one I420 frame. May return zero access units (the backend
    /// dropped the frame) or several.
    pub fn encode_i420(&mut self, y: &[u8], u: &[u8], v: &[u8]) -> Result<EncodedFrames, CastError> {
        match self {
            VideoEncoder::Vpx(e) => e.encode_i420(y, u, v),
            VideoEncoder::Av1(e) => e.encode_i420(y, u, v),
        }
    }

    /// Release the backend. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        match self {
            VideoEncoder::Vpx(e) => e.close(),
            VideoEncoder::Av1(e) => e.close(),
        }
    }
}

/// Encoder worker threads: one per core, capped at 16.
pub(crate) fn encoder_threads() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4).min(16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_parse_defaults_to_vp8() {
        assert_eq!(Codec::parse("vp9"), Codec::Vp9);
        assert_eq!(Codec::parse("AV1"), Codec::Av1);
        assert_eq!(Codec::parse("h264"), Codec::Vp8);
        assert_eq!(Codec::parse(""), Codec::Vp8);
    }

    #[test]
    fn test_mime_types_are_video() {
        for codec in [Codec::Vp8, Codec::Vp9, Codec::Av1] {
            assert!(codec.mime_type().starts_with("video/"));
        }
    }

    #[test]
    fn test_encoder_threads_bounded() {
        let n = encoder_threads();
        assert!(n >= 1 && n <= 16);
    }
}
