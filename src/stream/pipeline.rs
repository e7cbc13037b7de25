//! The shared encoder pipeline: one ticker loop per mount pulling frames
//! from a source, converting to I420, encoding, and fanning samples out
//! through the async writer to the broadcaster.

use super::{metrics, SampleBroadcaster, SampleWriter};
use crate::encode::{Codec, EncoderConfig, VideoEncoder};
use crate::errors::CastError;
use crate::source::{NextFrame, PixelFormat, Source};
use crate::yuv;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;
use webrtc::media::Sample;

/// How long to wait for a first frame before falling back to configured
/// dimensions, and the sampling step while waiting.
const DIMENSION_WAIT: Duration = Duration::from_secs(1);
const DIMENSION_POLL: Duration = Duration::from_millis(50);

pub struct PipelineConfig {
    pub width: usize,
    pub height: usize,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub codec: Codec,
    pub vp8_speed: u32,
    pub vp8_dropframe: u32,
    pub source: Arc<Source>,
    pub sink: Arc<SampleBroadcaster>,
}

/// Handle to a running encoder loop. `stop` is idempotent; dropping the
/// handle also ends the loop.
pub struct Pipeline {
    quit: watch::Sender<bool>,
    stopped: AtomicBool,
    width: usize,
    height: usize,
    codec: Codec,
}

impl Pipeline {
    /// Build the encoder and spawn the loop. When the source can report a
    /// frame, its native dimensions win over the configured ones (the
    /// source-side scaler already produced target-sized frames if a target
    /// was requested).
    pub async fn start(cfg: PipelineConfig) -> Result<Pipeline, CastError> {
        let fps = if cfg.fps == 0 { 30 } else { cfg.fps };
        let mut width = if cfg.width == 0 { 1280 } else { cfg.width };
        let mut height = if cfg.height == 0 { 720 } else { cfg.height };

        if cfg.source.reports_dimensions() {
            let deadline = Instant::now() + DIMENSION_WAIT;
            loop {
                if let Some(frame) = cfg.source.last() {
                    if frame.width >= 2 && frame.height >= 2 {
                        width = frame.width;
                        height = frame.height;
                        break;
                    }
                }
                if Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(DIMENSION_POLL).await;
            }
        }

        width = (width & !1).max(2);
        height = (height & !1).max(2);
        let bitrate_kbps = if cfg.bitrate_kbps == 0 { 6000 } else { cfg.bitrate_kbps };
        // The synthetic pattern must keep animating, so frame dropping is
        // disabled for it regardless of configuration.
        let dropframe = if cfg.source.is_synthetic() { 0 } else { cfg.vp8_dropframe };

        let encoder = VideoEncoder::new(
            cfg.codec,
            &EncoderConfig {
                width,
                height,
                fps,
                bitrate_kbps,
                speed: cfg.vp8_speed,
                dropframe,
            },
        )?;
        metrics::register_pipeline(cfg.codec);

        let (quit_tx, quit_rx) = watch::channel(false);
        tokio::spawn(encoder_loop(
            encoder,
            cfg.codec,
            cfg.source,
            cfg.sink,
            width,
            height,
            fps,
            quit_rx,
        ));

        Ok(Pipeline {
            quit: quit_tx,
            stopped: AtomicBool::new(false),
            width,
            height,
            codec: cfg.codec,
        })
    }

    /// Actual encoder dimensions after native-size adoption.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.quit.send(true);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn encoder_loop(
    mut encoder: VideoEncoder,
    codec: Codec,
    source: Arc<Source>,
    sink: Arc<SampleBroadcaster>,
    width: usize,
    height: usize,
    fps: u32,
    mut quit: watch::Receiver<bool>,
) {
    let writer = SampleWriter::new(sink);
    let mut y = vec![0u8; width * height];
    let mut u = vec![0u8; (width / 2) * (height / 2)];
    let mut v = vec![0u8; (width / 2) * (height / 2)];
    let tick = Duration::from_secs(1) / fps;
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = quit.changed() => {
                if changed.is_err() || *quit.borrow() {
                    break;
                }
                continue;
            }
        }

        metrics::inc_frames_in();
        let frame = match source.next() {
            NextFrame::Frame(frame) => frame,
            NextFrame::Pending => continue,
            NextFrame::Ended => break,
        };

        // A frame smaller than the declared geometry (mid resolution change)
        // skips this tick; the supervisor restart catches up within a second.
        match frame.format {
            PixelFormat::Uyvy422 => {
                if frame.data.len() < width * height * 2 {
                    continue;
                }
                yuv::uyvy_to_i420(&frame.data, width, height, &mut y, &mut u, &mut v);
            }
            PixelFormat::Bgra => {
                if frame.data.len() < width * height * 4 {
                    continue;
                }
                yuv::bgra_to_i420(&frame.data, width, height, &mut y, &mut u, &mut v);
            }
        }
        drop(frame);

        let encoded = match encoder.encode_i420(&y, &u, &v) {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!("encode failed, stopping pipeline: {}", e);
                break;
            }
        };
        if encoded.packets.is_empty() {
            metrics::inc_frames_dropped();
        } else {
            metrics::inc_frames_encoded();
        }

        let mut accepted = 0;
        for access_unit in encoded.packets {
            let sample = Sample {
                data: access_unit,
                duration: tick,
                timestamp: SystemTime::now(),
                ..Default::default()
            };
            if writer.enqueue(sample) {
                accepted += 1;
            }
        }
        metrics::inc_samples_sent(accepted);
    }

    encoder.close();
    metrics::unregister_pipeline(codec);
}
