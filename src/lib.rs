//! Simple to use cli for tracking time spent on projects.
//! Work is recorded as sessions: a session is started, kept alive by periodic heartbeats and
//! ended. Closed sessions end up as intervals in a plain text log per project, and a session
//! interrupted by a crash can be recovered from its lock file.
//!

pub mod cli;
pub mod error;
pub mod fs;
pub mod session;
pub mod storage;
pub mod utils;

pub use error::{Error, Result};
