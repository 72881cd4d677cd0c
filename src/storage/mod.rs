//! Storage is organized through [project_store::ProjectStore].
//! The basic idea is:
//!  - There is a directory with all the projects.
//!  - Every project has a log file with closed intervals, one `start - end` line each.
//!  - While a project is being worked on, it also has a lock file holding the open session.
//!    The lock is what prevents two sessions of one project and what a crashed session is
//!    recovered from.

pub mod interval;
pub mod interval_log;
pub mod pending;
pub mod project_store;
