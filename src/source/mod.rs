//! Frame sources: the live NDI receiver and the synthetic Splash pattern.
//!
//! Both variants publish into a latest-wins frame slot: `next()` returns the
//! most recent frame without copying, and the encoder pipeline consumes it
//! before the capture worker stores the next one (the tick rate bounds this).

pub mod native;
pub mod synthetic;

pub use native::NdiSource;
pub use synthetic::SplashSource;

use std::sync::Arc;

/// Reserved descriptor for the synthetic generator; always serviceable.
pub const SPLASH_NAME: &str = "Splash";
pub const SPLASH_URL: &str = "ndi://Splash";

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgra,
    Uyvy422,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra => 4,
            PixelFormat::Uyvy422 => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Bgra => "bgra",
            PixelFormat::Uyvy422 => "uyvy422",
        }
    }
}

/// One captured frame with tight stride (`width * bytes_per_pixel`).
/// Dimensions are normalised to even values when the frame is stored.
pub struct FrameBuf {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub format: PixelFormat,
}

/// Result of polling a source for its latest frame.
pub enum NextFrame {
    Frame(Arc<FrameBuf>),
    /// Nothing has arrived yet; try again next tick.
    Pending,
    /// The source is closed and will never produce again.
    Ended,
}

/// Closed sum over the two source kinds.
pub enum Source {
    Ndi(NdiSource),
    Splash(SplashSource),
}

impl Source {
    /// Latest frame without copying.
    pub fn next(&self) -> NextFrame {
        match self {
            Source::Ndi(s) => s.next(),
            Source::Splash(s) => s.next(),
        }
    }

    /// Snapshot accessor used to probe native resolution before encoder
    /// init. `None` for sources that cannot report (the synthetic pattern
    /// has a fixed size and no capture delay).
    pub fn last(&self) -> Option<Arc<FrameBuf>> {
        match self {
            Source::Ndi(s) => s.last(),
            Source::Splash(_) => None,
        }
    }

    pub fn pixel_format(&self) -> PixelFormat {
        match self {
            Source::Ndi(s) => s.pixel_format(),
            Source::Splash(_) => PixelFormat::Bgra,
        }
    }

    /// Request pre-encode rescale to the given size; no-op for Splash.
    pub fn set_output_size(&self, w: usize, h: usize) {
        if let Source::Ndi(s) = self {
            s.set_output_size(w, h);
        }
    }

    /// Idempotent; releases the capture handle and worker.
    pub fn stop(&self) {
        match self {
            Source::Ndi(s) => s.stop(),
            Source::Splash(s) => s.stop(),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, Source::Splash(_))
    }

    /// Whether `last()` can ever report anything; the dimension probe and
    /// the resolution supervisor only make sense when it can.
    pub fn reports_dimensions(&self) -> bool {
        matches!(self, Source::Ndi(_))
    }
}

/// Descriptor served by the sources listing; `id` is the URL slug used in
/// WHEP mount paths.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub id: String,
    pub name: String,
    pub url: String,
}

impl SourceDescriptor {
    pub fn new(name: &str, url: &str) -> SourceDescriptor {
        SourceDescriptor {
            id: slug_key(name, url),
            name: name.to_string(),
            url: url.to_string(),
        }
    }

    pub fn splash() -> SourceDescriptor {
        SourceDescriptor::new(SPLASH_NAME, SPLASH_URL)
    }
}

/// Derive a URL-safe key from a source's URL (preferred) or display name:
/// lowercased, unsafe characters collapsed to `-`, empty collapses to "src".
pub fn slug_key(name: &str, url: &str) -> String {
    let base = if !url.is_empty() {
        url
    } else if !name.is_empty() {
        name
    } else {
        return "src".to_string();
    };
    let mut out = String::with_capacity(base.len());
    let mut last_dash = true; // trim leading dashes
    for c in base.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "src".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Selection heuristic: strings carrying a scheme or port are URLs, anything
/// else is a display name to match against discovery results.
pub fn looks_like_url(s: &str) -> bool {
    s.contains("://") || s.contains(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_key_from_name() {
        assert_eq!(slug_key("OBS (Main Output)", ""), "obs-main-output");
    }

    #[test]
    fn test_slug_key_prefers_url() {
        assert_eq!(slug_key("Anything", "ndi://Splash"), "ndi-splash");
    }

    #[test]
    fn test_slug_key_collapses_runs() {
        assert_eq!(slug_key("A  --  B", ""), "a-b");
        assert_eq!(slug_key("***", ""), "src");
        assert_eq!(slug_key("", ""), "src");
    }

    #[test]
    fn test_url_heuristic() {
        assert!(looks_like_url("ndi://host/stream"));
        assert!(looks_like_url("192.168.1.5:5961"));
        assert!(!looks_like_url("Studio Camera"));
    }

    #[test]
    fn test_splash_descriptor() {
        let d = SourceDescriptor::splash();
        assert_eq!(d.name, "Splash");
        assert_eq!(d.id, "ndi-splash");
    }
}
