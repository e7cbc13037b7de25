//! AV1 encoding through rav1e, tuned for realtime egress: low latency, no
//! frame lag, automatic keyframes capped at 4x fps.

#[cfg(feature = "av1")]
mod real {
    use crate::encode::{encoder_threads, EncodedFrames, EncoderConfig};
    use crate::errors::CastError;
    use bytes::Bytes;
    use rav1e::prelude::{ChromaSampling, Config, Context, EncoderStatus, FrameType, Rational, SpeedSettings};

    pub struct Av1Encoder {
        ctx: Context<u8>,
        width: usize,
        height: usize,
        frame_count: u64,
        open: bool,
    }

    impl Av1Encoder {
        pub fn new(cfg: &EncoderConfig) -> Result<Av1Encoder, CastError> {
            if cfg.width < 2 || cfg.height < 2 || cfg.fps == 0 {
                return Err(CastError::EncodingError(format!(
                    "invalid av1 encoder config: {}x{}@{} {}kbps",
                    cfg.width, cfg.height, cfg.fps, cfg.bitrate_kbps
                )));
            }
            let mut enc = rav1e::prelude::EncoderConfig::default();
            enc.width = cfg.width;
            enc.height = cfg.height;
            enc.chroma_sampling = ChromaSampling::Cs420;
            enc.time_base = Rational::new(1, cfg.fps as u64);
            enc.bitrate = (cfg.bitrate_kbps as i32).saturating_mul(1000);
            enc.low_latency = true;
            enc.min_key_frame_interval = 0;
            enc.max_key_frame_interval = cfg.fps.saturating_mul(4) as u64;
            // rav1e's fastest preset is the realtime choice here; the vpx
            // speed knob does not map onto it.
            enc.speed_settings = SpeedSettings::from_preset(10);

            let config = Config::new().with_encoder_config(enc).with_threads(encoder_threads());
            let ctx: Context<u8> = config.new_context().map_err(|e| {
                CastError::EncodingError(format!(
                    "rav1e context failed for {}x{}@{} {}kbps: {:?}",
                    cfg.width, cfg.height, cfg.fps, cfg.bitrate_kbps, e
                ))
            })?;

            Ok(Av1Encoder {
                ctx,
                width: cfg.width,
                height: cfg.height,
                frame_count: 0,
                open: true,
            })
        }

        /// Encode one I420 frame: `y` must be `w*h`, `u` and `v` `(w/2)*(h/2)`.
        pub fn encode_i420(&mut self, y: &[u8], u: &[u8], v: &[u8]) -> Result<EncodedFrames, CastError> {
            if !self.open {
                return Err(CastError::EncodingError("encoder closed".into()));
            }
            let (w, h) = (self.width, self.height);
            if y.len() < w * h || u.len() < (w / 2) * (h / 2) || v.len() < (w / 2) * (h / 2) {
                return Err(CastError::EncodingError("bad plane sizes".into()));
            }
            let mut frame = self.ctx.new_frame();
            frame.planes[0].copy_from_raw_u8(y, w, 1);
            frame.planes[1].copy_from_raw_u8(u, w / 2, 1);
            frame.planes[2].copy_from_raw_u8(v, w / 2, 1);
            self.ctx
                .send_frame(frame)
                .map_err(|e| CastError::EncodingError(format!("rav1e send_frame failed: {:?}", e)))?;
            self.frame_count += 1;

            let mut out = EncodedFrames::default();
            loop {
                match self.ctx.receive_packet() {
                    Ok(pkt) => {
                        out.keyframe = out.keyframe || pkt.frame_type == FrameType::KEY;
                        out.packets.push(Bytes::from(pkt.data));
                    }
                    Err(EncoderStatus::Encoded) => continue,
                    Err(EncoderStatus::NeedMoreData) | Err(EncoderStatus::LimitReached) => break,
                    Err(e) => {
                        return Err(CastError::EncodingError(format!("rav1e receive_packet failed: {:?}", e)))
                    }
                }
            }
            Ok(out)
        }

        pub fn frame_count(&self) -> u64 {
            self.frame_count
        }

        pub fn close(&mut self) {
            self.open = false;
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_av1_encoder_creation() {
            let cfg = EncoderConfig {
                width: 320,
                height: 180,
                fps: 30,
                bitrate_kbps: 1000,
                speed: 8,
                dropframe: 0,
            };
            assert!(Av1Encoder::new(&cfg).is_ok());
        }

        #[test]
        fn test_av1_emits_keyframe_first() {
            let cfg = EncoderConfig {
                width: 64,
                height: 64,
                fps: 30,
                bitrate_kbps: 500,
                speed: 8,
                dropframe: 0,
            };
            let mut enc = Av1Encoder::new(&cfg).unwrap();
            let y = vec![128u8; 64 * 64];
            let u = vec![128u8; 32 * 32];
            let v = vec![128u8; 32 * 32];
            // Low-latency mode may take a couple of frames to flush the first
            // packet; feed a few and require a keyframe to appear.
            let mut saw_key = false;
            for _ in 0..5 {
                let out = enc.encode_i420(&y, &u, &v).unwrap();
                saw_key = saw_key || out.keyframe;
                if saw_key {
                    break;
                }
            }
            assert!(saw_key, "no keyframe within the first five frames");
        }
    }
}

#[cfg(feature = "av1")]
pub use real::Av1Encoder;

#[cfg(not(feature = "av1"))]
mod stub {
    use crate::encode::{EncodedFrames, EncoderConfig};
    use crate::errors::CastError;

    /// Placeholder when AV1 support is compiled out.
    pub struct Av1Encoder {
        _private: (),
    }

    impl Av1Encoder {
        pub fn new(_cfg: &EncoderConfig) -> Result<Av1Encoder, CastError> {
            Err(CastError::CodecUnavailable("av1 requires the `av1` build feature".into()))
        }

        pub fn encode_i420(&mut self, _y: &[u8], _u: &[u8], _v: &[u8]) -> Result<EncodedFrames, CastError> {
            Err(CastError::CodecUnavailable("av1 feature disabled".into()))
        }

        pub fn frame_count(&self) -> u64 {
            0
        }

        pub fn close(&mut self) {}
    }
}

#[cfg(not(feature = "av1"))]
pub use stub::Av1Encoder;
