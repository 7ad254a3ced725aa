use thiserror::Error;

/// Errors reported to callers of the session control surface.
///
/// Evidence problems inside a single slot (an empty crop, a classifier that
/// cannot run) never surface here; they are absorbed by the session and the
/// slot simply keeps its last known status.
#[derive(Error, Debug)]
pub enum SlotwatchError {
    #[error("no active session `{0}`")]
    SessionNotFound(String),
    #[error("session `{0}` is already running")]
    SessionExists(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("invalid geometry for slot {slot_number}: {reason}")]
    InvalidGeometry { slot_number: u32, reason: String },
    #[error("invalid grid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
    #[error("image operation failed: {0}")]
    Vision(#[from] opencv::Error),
    #[error("capture resource failed to release: {0}")]
    Capture(String),
    #[error("frame processing aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, SlotwatchError>;
