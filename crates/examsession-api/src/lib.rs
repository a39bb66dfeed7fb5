//! examsession-api — concrete collaborators for the session engine.
//!
//! Implements the `AttemptApi` trait over HTTP and loads the client and
//! session configuration from TOML and the environment.

pub mod config;
pub mod http;

pub use config::{load_config, load_config_from, ExamSessionConfig};
pub use http::HttpAttemptApi;
