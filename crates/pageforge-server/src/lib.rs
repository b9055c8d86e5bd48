//! PageForge Server
//!
//! HTTP front end for the PageForge generation pipeline: SSE, buffered and
//! single-JSON generation endpoints for Gemini and Anthropic, usage
//! statistics, and a short-lived cache of finished sessions.

pub mod config;
pub mod error;
pub mod routes;
pub mod session;
pub mod state;

pub use config::{ConfigOverrides, ServerConfig};
pub use error::AppError;
pub use routes::create_router;
pub use session::{SessionRecord, SessionStore};
pub use state::{AppState, Provider};
