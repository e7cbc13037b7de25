//! Deterministic animated test pattern, always available as "Splash".

use super::{FrameBuf, NextFrame, PixelFormat};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Moving BGRA gradient keyed on wall-clock time since construction. Never
/// ends on its own; size is fixed at construction.
pub struct SplashSource {
    width: usize,
    height: usize,
    start: Instant,
    stopped: AtomicBool,
}

impl SplashSource {
    pub fn new(width: usize, height: usize) -> SplashSource {
        let width = (width & !1).max(2);
        let height = (height & !1).max(2);
        SplashSource {
            width,
            height,
            start: Instant::now(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn next(&self) -> NextFrame {
        if self.stopped.load(Ordering::Acquire) {
            return NextFrame::Ended;
        }
        NextFrame::Frame(Arc::new(self.render()))
    }

    /// Render the pattern at the current instant.
    pub fn render(&self) -> FrameBuf {
        let (w, h) = (self.width, self.height);
        let now = self.start.elapsed().as_secs_f64();
        let (tr, tg, tb) = ((now * 120.0) as usize, (now * 80.0) as usize, (now * 100.0) as usize);
        let mut data = vec![0u8; w * h * 4];
        for y in 0..h {
            for x in 0..w {
                let off = (y * w + x) * 4;
                data[off] = ((x + y + tb) % 256) as u8;
                data[off + 1] = ((y + tg) % 256) as u8;
                data[off + 2] = ((x + tr) % 256) as u8;
                data[off + 3] = 255;
            }
        }
        FrameBuf {
            data,
            width: w,
            height: h,
            format: PixelFormat::Bgra,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions_are_normalised() {
        let s = SplashSource::new(641, 361);
        assert_eq!((s.width(), s.height()), (640, 360));
        let s = SplashSource::new(0, 1);
        assert_eq!((s.width(), s.height()), (2, 2));
    }

    #[test]
    fn test_frames_are_full_and_opaque() {
        let s = SplashSource::new(64, 32);
        match s.next() {
            NextFrame::Frame(f) => {
                assert_eq!(f.data.len(), 64 * 32 * 4);
                assert_eq!(f.format, PixelFormat::Bgra);
                assert!(f.data.chunks_exact(4).all(|px| px[3] == 255));
            }
            _ => panic!("splash must always produce a frame"),
        }
    }

    #[test]
    fn test_stop_ends_the_source() {
        let s = SplashSource::new(16, 16);
        s.stop();
        s.stop();
        assert!(matches!(s.next(), NextFrame::Ended));
    }
}
