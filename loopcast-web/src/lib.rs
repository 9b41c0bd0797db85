//! Loopcast Web - JSON API Server

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! Presentation boundary for the streaming controller. Handlers only
//! translate HTTP into core calls and serialise the results; all
//! orchestration lives in `loopcast-core`.

pub mod error;
pub mod handlers;
pub mod server;

// Re-export main types
pub use error::ApiError;
pub use server::{AppState, router, run_server};
