//! VP8/VP9 encoding through libvpx.
//!
//! Realtime configuration: one-pass CBR, zero frame lag, automatic keyframes
//! capped at 4x fps, `cpu_used` speed knob, threads capped at 16.

#[cfg(feature = "vpx")]
mod real {
    use crate::encode::{encoder_threads, Codec, EncodedFrames, EncoderConfig};
    use crate::errors::CastError;
    use bytes::Bytes;
    use env_libvpx_sys as ffi;
    use std::os::raw::{c_int, c_uint, c_ulong};

    // ABI constants from vpx_encoder.h / vpx_image.h / vp8cx.h. The generated
    // names for enum members differ across bindings versions; the values are
    // part of the stable libvpx ABI.
    const VPX_CODEC_OK: ffi::vpx_codec_err_t = 0;
    const VPX_RC_ONE_PASS: ffi::vpx_enc_pass = 0;
    const VPX_CBR: ffi::vpx_rc_mode = 1;
    const VPX_KF_AUTO: ffi::vpx_kf_mode = 1;
    const VPX_IMG_FMT_I420: ffi::vpx_img_fmt_t = 0x102; // VPX_IMG_FMT_PLANAR | 2
    const VPX_CODEC_CX_FRAME_PKT: ffi::vpx_codec_cx_pkt_kind = 0;
    const VP8E_SET_CPUUSED: c_int = 13;
    const VPX_FRAME_IS_KEY: ffi::vpx_codec_frame_flags_t = 0x1;
    const VPX_DL_REALTIME: c_ulong = 1;

    pub struct VpxEncoder {
        ctx: ffi::vpx_codec_ctx_t,
        img: *mut ffi::vpx_image_t,
        width: usize,
        height: usize,
        pts: i64,
        frame_count: u64,
        open: bool,
    }

    // The context and image are only ever touched by the owning encoder loop.
    unsafe impl Send for VpxEncoder {}

    impl VpxEncoder {
        pub fn new(codec: Codec, cfg: &EncoderConfig) -> Result<VpxEncoder, CastError> {
            if cfg.width < 2 || cfg.height < 2 || cfg.fps == 0 {
                return Err(CastError::EncodingError(format!(
                    "invalid {} encoder config: {}x{}@{} {}kbps",
                    codec.as_str(),
                    cfg.width,
                    cfg.height,
                    cfg.fps,
                    cfg.bitrate_kbps
                )));
            }
            let iface = unsafe {
                match codec {
                    Codec::Vp9 => ffi::vpx_codec_vp9_cx(),
                    _ => ffi::vpx_codec_vp8_cx(),
                }
            };
            let mut enc_cfg: ffi::vpx_codec_enc_cfg_t = unsafe { std::mem::zeroed() };
            let res = unsafe { ffi::vpx_codec_enc_config_default(iface, &mut enc_cfg, 0) };
            if res != VPX_CODEC_OK {
                return Err(CastError::EncodingError(format!(
                    "vpx_codec_enc_config_default failed ({:?}) for {} {}x{}@{} {}kbps",
                    res,
                    codec.as_str(),
                    cfg.width,
                    cfg.height,
                    cfg.fps,
                    cfg.bitrate_kbps
                )));
            }
            enc_cfg.g_w = cfg.width as c_uint;
            enc_cfg.g_h = cfg.height as c_uint;
            enc_cfg.g_timebase.num = 1;
            enc_cfg.g_timebase.den = cfg.fps as c_int;
            if cfg.bitrate_kbps > 0 {
                enc_cfg.rc_target_bitrate = cfg.bitrate_kbps as c_uint;
            }
            enc_cfg.g_pass = VPX_RC_ONE_PASS;
            enc_cfg.g_lag_in_frames = 0;
            enc_cfg.g_threads = encoder_threads() as c_uint;
            enc_cfg.rc_end_usage = VPX_CBR;
            enc_cfg.kf_mode = VPX_KF_AUTO;
            enc_cfg.kf_max_dist = cfg.fps.saturating_mul(4) as c_uint;
            enc_cfg.rc_dropframe_thresh = cfg.dropframe as c_uint;

            let mut ctx: ffi::vpx_codec_ctx_t = unsafe { std::mem::zeroed() };
            let res = unsafe {
                ffi::vpx_codec_enc_init_ver(
                    &mut ctx,
                    iface,
                    &enc_cfg,
                    0,
                    ffi::VPX_ENCODER_ABI_VERSION as c_int,
                )
            };
            if res != VPX_CODEC_OK {
                return Err(CastError::EncodingError(format!(
                    "vpx_codec_enc_init_ver failed ({:?}) for {} {}x{}@{} {}kbps",
                    res,
                    codec.as_str(),
                    cfg.width,
                    cfg.height,
                    cfg.fps,
                    cfg.bitrate_kbps
                )));
            }
            unsafe {
                ffi::vpx_codec_control_(&mut ctx, VP8E_SET_CPUUSED, cfg.speed.min(8) as c_int);
            }

            let img = unsafe {
                ffi::vpx_img_alloc(
                    std::ptr::null_mut(),
                    VPX_IMG_FMT_I420,
                    cfg.width as c_uint,
                    cfg.height as c_uint,
                    1,
                )
            };
            if img.is_null() {
                unsafe { ffi::vpx_codec_destroy(&mut ctx) };
                return Err(CastError::EncodingError(format!(
                    "vpx_img_alloc failed for {}x{}",
                    cfg.width, cfg.height
                )));
            }

            Ok(VpxEncoder {
                ctx,
                img,
                width: cfg.width,
                height: cfg.height,
                pts: 0,
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
            unsafe {
                copy_plane((*self.img).planes[0], (*self.img).stride[0] as usize, y, w, h);
                copy_plane((*self.img).planes[1], (*self.img).stride[1] as usize, u, w / 2, h / 2);
                copy_plane((*self.img).planes[2], (*self.img).stride[2] as usize, v, w / 2, h / 2);
            }

            let flags: ffi::vpx_enc_frame_flags_t = 0;
            let res = unsafe {
                ffi::vpx_codec_encode(&mut self.ctx, self.img, self.pts, 1, flags, VPX_DL_REALTIME)
            };
            if res != VPX_CODEC_OK {
                return Err(CastError::EncodingError(format!("vpx_codec_encode failed ({:?})", res)));
            }
            self.pts += 1;
            self.frame_count += 1;

            let mut out = EncodedFrames::default();
            let mut iter: ffi::vpx_codec_iter_t = std::ptr::null();
            loop {
                let pkt = unsafe { ffi::vpx_codec_get_cx_data(&mut self.ctx, &mut iter) };
                if pkt.is_null() {
                    break;
                }
                let pkt = unsafe { &*pkt };
                if pkt.kind != VPX_CODEC_CX_FRAME_PKT {
                    continue;
                }
                let frame = unsafe { pkt.data.frame };
                let data = unsafe { std::slice::from_raw_parts(frame.buf as *const u8, frame.sz as usize) };
                out.packets.push(Bytes::copy_from_slice(data));
                out.keyframe = out.keyframe || (frame.flags & VPX_FRAME_IS_KEY) != 0;
            }
            Ok(out)
        }

        pub fn frame_count(&self) -> u64 {
            self.frame_count
        }

        pub fn close(&mut self) {
            if !self.img.is_null() {
                unsafe { ffi::vpx_img_free(self.img) };
                self.img = std::ptr::null_mut();
            }
            if self.open {
                unsafe { ffi::vpx_codec_destroy(&mut self.ctx) };
                self.open = false;
            }
        }
    }

    impl Drop for VpxEncoder {
        fn drop(&mut self) {
            self.close();
        }
    }

    /// Row-by-row copy into a strided libvpx plane.
    unsafe fn copy_plane(dst: *mut u8, stride: usize, src: &[u8], w: usize, h: usize) {
        for row in 0..h {
            std::ptr::copy_nonoverlapping(src.as_ptr().add(row * w), dst.add(row * stride), w);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn test_config(w: usize, h: usize) -> EncoderConfig {
            EncoderConfig {
                width: w,
                height: h,
                fps: 30,
                bitrate_kbps: 1000,
                speed: 8,
                dropframe: 0,
            }
        }

        #[test]
        fn test_vp8_encoder_creation() {
            let enc = VpxEncoder::new(Codec::Vp8, &test_config(320, 180));
            assert!(enc.is_ok(), "VP8 encoder should build: {:?}", enc.err());
        }

        #[test]
        fn test_invalid_config_is_rejected() {
            let cfg = EncoderConfig {
                width: 0,
                ..test_config(0, 180)
            };
            assert!(VpxEncoder::new(Codec::Vp8, &cfg).is_err());
        }

        #[test]
        fn test_first_frame_is_keyframe() {
            let (w, h) = (320, 180);
            let mut enc = VpxEncoder::new(Codec::Vp8, &test_config(w, h)).unwrap();
            let y = vec![128u8; w * h];
            let u = vec![128u8; (w / 2) * (h / 2)];
            let v = vec![128u8; (w / 2) * (h / 2)];
            let out = enc.encode_i420(&y, &u, &v).unwrap();
            assert!(!out.packets.is_empty(), "first frame should produce output");
            assert!(out.keyframe, "first frame should be a keyframe");
        }

        #[test]
        fn test_bad_plane_sizes_error() {
            let mut enc = VpxEncoder::new(Codec::Vp8, &test_config(320, 180)).unwrap();
            let y = vec![0u8; 16];
            let u = vec![0u8; 16];
            let v = vec![0u8; 16];
            assert!(enc.encode_i420(&y, &u, &v).is_err());
        }

        #[test]
        fn test_close_twice_is_safe() {
            let mut enc = VpxEncoder::new(Codec::Vp8, &test_config(320, 180)).unwrap();
            enc.close();
            enc.close();
        }
    }
}

#[cfg(feature = "vpx")]
pub use real::VpxEncoder;

#[cfg(not(feature = "vpx"))]
mod stub {
    use crate::encode::{Codec, EncodedFrames, EncoderConfig};
    use crate::errors::CastError;

    /// Placeholder when libvpx support is compiled out.
    pub struct VpxEncoder {
        _private: (),
    }

    impl VpxEncoder {
        pub fn new(codec: Codec, _cfg: &EncoderConfig) -> Result<VpxEncoder, CastError> {
            Err(CastError::CodecUnavailable(format!(
                "{} requires the `vpx` build feature",
                codec.as_str()
            )))
        }

        pub fn encode_i420(&mut self, _y: &[u8], _u: &[u8], _v: &[u8]) -> Result<EncodedFrames, CastError> {
            Err(CastError::CodecUnavailable("vpx feature disabled".into()))
        }

        pub fn frame_count(&self) -> u64 {
            0
        }

        pub fn close(&mut self) {}
    }
}

#[cfg(not(feature = "vpx"))]
pub use stub::VpxEncoder;
