//! examsession-core — the test-taking session engine.
//!
//! This crate holds the data model, the async traits for every external
//! collaborator (attempt API, realtime channel, result consumers), and the
//! engine components built on them: the session clock, the answer store,
//! the autosave scheduler, the realtime adapter and the session controller
//! that ties them together.

pub mod autosave;
pub mod clock;
pub mod controller;
pub mod error;
pub mod handoff;
pub mod keyboard;
pub mod mock;
pub mod model;
pub mod parser;
pub mod realtime;
pub mod store;
pub mod traits;

pub use controller::{SessionConfig, SessionController, SessionDeps, StartMode};
pub use error::{ApiError, RealtimeError, SessionError};

/// Lock a std mutex, recovering the guard if a previous holder panicked.
///
/// Engine state stays usable after a panicking callback; answers must not be
/// lost because an unrelated observer misbehaved.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
