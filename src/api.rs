//! HTTP API for status, diagnostics, and runtime control.

mod server;
mod state;

pub use server::{router, start_http_server};
pub use state::ApiState;
