//! Session management module.
//!
//! This module bridges websocket connections to PTY-backed shells: spawning
//! the process, batching output, dispatching input frames and tearing
//! everything down exactly once. The registry tracks live sessions and
//! enforces the concurrent session cap.

pub mod bridge;
pub mod pty;
pub mod registry;
pub mod writer;

pub use bridge::{CloseReason, Session, SessionConfig, SessionError, SessionId, SessionInfo, SessionState};
pub use pty::{PtyCommand, PtyError, PtyProcess};
pub use registry::{AdmissionPermit, SessionRegistry};
pub use writer::{BufferedFrameWriter, WriterError};
