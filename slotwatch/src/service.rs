// THEORY:
// `ServiceContext` is the explicit replacement for process-wide session state.
// It is built once at startup, shared by reference with whatever transport sits
// in front of it, and torn down with `shutdown`.
//
// The registry (`session_id -> session`) is the only structure shared between
// requests. It is write-locked only to insert or remove a session; per-frame
// work takes a read lock just long enough to clone the session handle, then
// locks that one session and runs the CPU-bound frame processing on tokio's
// blocking pool. Different sessions therefore never wait on each other.
//
// A session may own an external capture resource (a camera feed). Stopping the
// session releases that resource while the registry is still write-locked and
// before the entry is removed. A request that cloned the handle before the
// removal can still be waiting on the session lock, so `stop` also marks the
// session stopped under that lock; every locked operation checks the mark first
// and answers as if the session were already gone.

use crate::clock::{Clock, SystemClock};
use crate::codec;
use crate::config::SessionConfig;
use crate::core_modules::grid_session::{
    FrameReport, GridDetector, GridSession, ObjectLabeler, ProcessOptions,
};
use crate::core_modules::region::BgrFrame;
use crate::error::{Result, SlotwatchError};
use futures::future::join_all;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

const OUTPUT_JPEG_QUALITY: u8 = 80;

/// An externally owned frame source tied to a session's lifetime.
pub trait CaptureHandle: Send + Sync {
    fn release(&mut self) -> Result<()>;
}

struct LiveSession {
    grid: GridSession,
    stopped: bool,
}

type SessionHandle = Arc<Mutex<LiveSession>>;

struct SessionEntry {
    session: SessionHandle,
    capture: Option<Box<dyn CaptureHandle>>,
}

pub struct ServiceContext {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    clock: Arc<dyn Clock>,
    detector: Option<Arc<dyn GridDetector>>,
    labeler: Option<Arc<dyn ObjectLabeler>>,
}

impl Default for ServiceContext {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl ServiceContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
            detector: None,
            labeler: None,
        }
    }

    /// Grid detector handed to sessions started without a declared grid.
    pub fn with_detector(mut self, detector: Arc<dyn GridDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_labeler(mut self, labeler: Arc<dyn ObjectLabeler>) -> Self {
        self.labeler = Some(labeler);
        self
    }

    /// Starts a session and returns its declared slot count.
    pub async fn start(&self, session_id: &str, config: SessionConfig) -> Result<usize> {
        self.insert(session_id, config, None).await
    }

    pub async fn start_with_capture(
        &self,
        session_id: &str,
        config: SessionConfig,
        capture: Box<dyn CaptureHandle>,
    ) -> Result<usize> {
        self.insert(session_id, config, Some(capture)).await
    }

    async fn insert(
        &self,
        session_id: &str,
        config: SessionConfig,
        capture: Option<Box<dyn CaptureHandle>>,
    ) -> Result<usize> {
        let mut session = GridSession::new(config, self.clock.clone())?;
        if let Some(detector) = &self.detector {
            session = session.with_detector(detector.clone());
        }
        if let Some(labeler) = &self.labeler {
            session = session.with_labeler(labeler.clone());
        }
        let slot_count = session.slot_count();

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Err(SlotwatchError::SessionExists(session_id.to_string()));
        }
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                session: Arc::new(Mutex::new(LiveSession {
                    grid: session,
                    stopped: false,
                })),
                capture,
            },
        );
        info!("session `{}` started with {} slots", session_id, slot_count);
        Ok(slot_count)
    }

    /// Releases the session's capture resource, then removes the session.
    /// The session is removed even if the release fails. A frame already being
    /// processed finishes first; one still waiting for the session is refused.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| SlotwatchError::SessionNotFound(session_id.to_string()))?;
        entry.session.lock().await.stopped = true;
        let released = match entry.capture.as_mut() {
            Some(capture) => capture.release(),
            None => Ok(()),
        };
        sessions.remove(session_id);
        drop(sessions);

        match &released {
            Ok(()) => info!("session `{}` stopped", session_id),
            Err(e) => warn!("session `{}` stopped, capture release failed: {}", session_id, e),
        }
        released
    }

    pub async fn set_reference(&self, session_id: &str, frame: BgrFrame) -> Result<()> {
        let session = self.session(session_id).await?;
        run_locked(session_id, session, move |grid| grid.set_reference(frame)).await
    }

    /// Processes one decoded frame with annotation enabled.
    pub async fn process(&self, session_id: &str, frame: BgrFrame, use_ai: bool) -> Result<FrameReport> {
        let options = ProcessOptions {
            annotate: true,
            use_ai,
        };
        self.process_with(session_id, frame, options).await
    }

    pub async fn process_with(
        &self,
        session_id: &str,
        frame: BgrFrame,
        options: ProcessOptions,
    ) -> Result<FrameReport> {
        let session = self.session(session_id).await?;
        run_locked(session_id, session, move |grid| grid.process_frame(&frame, options)).await
    }

    /// Decodes an encoded frame, processes it and returns the report together
    /// with the JPEG-encoded annotated frame.
    pub async fn process_encoded(
        &self,
        session_id: &str,
        bytes: &[u8],
        use_ai: bool,
    ) -> Result<(FrameReport, Option<Vec<u8>>)> {
        let frame = codec::decode_frame(bytes)?;
        let mut report = self.process(session_id, frame, use_ai).await?;
        let encoded = report
            .annotated
            .take()
            .map(|annotated| codec::encode_jpeg(&annotated, OUTPUT_JPEG_QUALITY))
            .transpose()?;
        Ok((report, encoded))
    }

    pub async fn slot_count(&self, session_id: &str) -> Result<usize> {
        let session = self.session(session_id).await?;
        let guard = session.lock().await;
        if guard.stopped {
            return Err(SlotwatchError::SessionNotFound(session_id.to_string()));
        }
        Ok(guard.grid.slot_count())
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stops every session.
    pub async fn shutdown(&self) {
        let ids = self.session_ids().await;
        let results = join_all(ids.iter().map(|id| self.stop(id))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!("shutdown: {} sessions stopped, {} with errors", ids.len(), failed);
    }

    async fn session(&self, session_id: &str) -> Result<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.session.clone())
            .ok_or_else(|| SlotwatchError::SessionNotFound(session_id.to_string()))
    }
}

/// Locks one session and runs `work` on the blocking pool, unless the session
/// was stopped while this request waited for it.
async fn run_locked<T, F>(session_id: &str, session: SessionHandle, work: F) -> Result<T>
where
    F: FnOnce(&mut GridSession) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let mut guard = session.lock_owned().await;
    if guard.stopped {
        return Err(SlotwatchError::SessionNotFound(session_id.to_string()));
    }
    tokio::task::spawn_blocking(move || work(&mut guard.grid))
        .await
        .map_err(|e| SlotwatchError::Aborted(e.to_string()))?
}
