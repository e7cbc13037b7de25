use std::fmt;

#[derive(Debug)]
pub enum CastError {
    /// The NDI runtime library could not be loaded.
    NdiUnavailable(String),
    /// No NDI source matched the requested name or URL.
    NoSource(String),
    /// Receiver or discovery failure inside the capture SDK.
    CaptureError(String),
    /// Encoder construction or mid-stream encode failure.
    EncodingError(String),
    /// The requested codec was compiled out of this build.
    CodecUnavailable(String),
    /// Peer connection, track, or SDP failure.
    SessionError(String),
    /// Broadcaster or pipeline failure.
    StreamError(String),
}

impl fmt::Display for CastError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CastError::NdiUnavailable(msg) => write!(f, "NDI not available: {}", msg),
            CastError::NoSource(msg) => write!(f, "NDI source not found: {}", msg),
            CastError::CaptureError(msg) => write!(f, "Capture error: {}", msg),
            CastError::EncodingError(msg) => write!(f, "Encoding error: {}", msg),
            CastError::CodecUnavailable(msg) => write!(f, "Codec unavailable: {}", msg),
            CastError::SessionError(msg) => write!(f, "Session error: {}", msg),
            CastError::StreamError(msg) => write!(f, "Stream error: {}", msg),
        }
    }
}

impl std::error::Error for CastError {}
