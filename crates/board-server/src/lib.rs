//! # board-server
//!
//! HTTP and WebSocket front end for the Board message board.
//!
//! - `GET /` - client page
//! - `GET /messages` - full history, ascending by id
//! - `DELETE /messages/{id}` - delete, always `204 No Content`
//! - `GET /ws` - live channel (`?format=msgpack` for binary frames)
//! - `GET /health` - liveness and subscriber count

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use error::ApiError;
pub use handlers::{app, run_server, AppState};
