//! Server configuration: command-line flags with environment fallbacks.

use crate::encode::Codec;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "crabcast", version, about = "WHEP egress server for NDI and synthetic video sources")]
pub struct Config {
    /// HTTP bind host
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP bind port
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Encoder frame rate
    #[arg(long, env = "FPS", default_value_t = 30)]
    pub fps: u32,

    /// Video width (synthetic and initial encoder size)
    #[arg(long, env = "VIDEO_WIDTH", default_value_t = 1280)]
    pub width: usize,

    /// Video height (synthetic and initial encoder size)
    #[arg(long, env = "VIDEO_HEIGHT", default_value_t = 720)]
    pub height: usize,

    /// Target video bitrate (kbps)
    #[arg(long, env = "VIDEO_BITRATE_KBPS", default_value_t = 6000)]
    pub bitrate_kbps: u32,

    /// Video codec: vp8, vp9, or av1
    #[arg(long, env = "VIDEO_CODEC", default_value = "vp8")]
    pub codec: String,

    /// VP8 cpu_used speed (0 = best quality, 8 = fastest)
    #[arg(long, env = "VIDEO_VP8_SPEED", default_value_t = 8)]
    pub vp8_speed: u32,

    /// VP8 drop-frame threshold (0 = off, higher drops more)
    #[arg(long, env = "VIDEO_VP8_DROPFRAME", default_value_t = 25)]
    pub vp8_dropframe: u32,

    /// Preferred NDI source display name
    #[arg(long, env = "NDI_SOURCE", default_value = "")]
    pub ndi_source: String,

    /// Preferred NDI source URL (ndi://...)
    #[arg(long, env = "NDI_SOURCE_URL", default_value = "")]
    pub ndi_source_url: String,

    /// NDI receive colour format: bgra or uyvy
    #[arg(long = "color", env = "NDI_RECV_COLOR", default_value = "")]
    pub recv_color: String,

    /// Rescale filter: NONE, LINEAR, BILINEAR, BOX
    #[arg(long = "scale-filter", env = "YUV_SCALE_FILTER", default_value = "")]
    pub scale_filter: String,

    /// Whether POST /ndi/select retargets the live shared pipeline
    /// (false: selection only affects new sessions)
    #[arg(
        long,
        env = "NDI_SELECT_APPLIES_LIVE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub select_applies_live: bool,
}

/// The subset of configuration the media plane needs.
#[derive(Debug, Clone, Copy)]
pub struct StreamDefaults {
    pub width: usize,
    pub height: usize,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub codec: Codec,
    pub vp8_speed: u32,
    pub vp8_dropframe: u32,
}

impl Config {
    pub fn codec(&self) -> Codec {
        Codec::parse(&self.codec)
    }

    pub fn stream_defaults(&self) -> StreamDefaults {
        StreamDefaults {
            width: self.width,
            height: self.height,
            fps: if self.fps == 0 { 30 } else { self.fps },
            bitrate_kbps: self.bitrate_kbps,
            codec: self.codec(),
            vp8_speed: self.vp8_speed.min(8),
            vp8_dropframe: self.vp8_dropframe,
        }
    }

    /// Push the flag overrides that the conversion and capture layers read
    /// from the environment. Must run before the first frame is converted.
    pub fn apply_env_overrides(&self) {
        if !self.recv_color.is_empty() {
            let v = match self.recv_color.to_ascii_uppercase().as_str() {
                "BGRA" | "BGRX" => "BGRA".to_string(),
                "UYVY" => "UYVY".to_string(),
                other => other.to_string(),
            };
            std::env::set_var("NDI_RECV_COLOR", v);
        }
        if !self.scale_filter.is_empty() {
            std::env::set_var("YUV_SCALE_FILTER", self.scale_filter.to_ascii_uppercase());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut full = vec!["crabcast"];
        full.extend_from_slice(args);
        Config::parse_from(full)
    }

    #[test]
    fn test_defaults() {
        let cfg = parse(&[]);
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.fps, 30);
        assert_eq!((cfg.width, cfg.height), (1280, 720));
        assert_eq!(cfg.bitrate_kbps, 6000);
        assert_eq!(cfg.codec(), Codec::Vp8);
        assert!(cfg.select_applies_live);
    }

    #[test]
    fn test_flags_override() {
        let cfg = parse(&["--port", "9001", "--codec", "av1", "--select-applies-live", "false"]);
        assert_eq!(cfg.port, 9001);
        assert_eq!(cfg.codec(), Codec::Av1);
        assert!(!cfg.select_applies_live);
    }

    #[test]
    fn test_vp8_speed_is_clamped() {
        let cfg = parse(&["--vp8-speed", "99"]);
        assert_eq!(cfg.stream_defaults().vp8_speed, 8);
    }

    #[test]
    fn test_zero_fps_falls_back() {
        let cfg = parse(&["--fps", "0"]);
        assert_eq!(cfg.stream_defaults().fps, 30);
    }
}
