#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! execd library — the streaming command-execution gateway.
//!
//! Building blocks, roughly bottom-up:
//! - `proc` — process-group spawning and signal control
//! - `stream` — concurrent output draining with line framing and caps
//! - `detect` — completion markers and artifact patterns
//! - `history` / `timeout` — duration history and adaptive timeouts
//! - `partial` — execution results, JSON repair, partial salvage
//! - `hooks` — lifecycle hook commands
//! - `sessions` — session pool and the execution driver
//! - `rpc` — JSON-RPC 2.0 over WebSocket
//! - `routes` — HTTP endpoints (health)

pub mod config;
pub mod detect;
pub mod history;
pub mod hooks;
pub mod partial;
pub mod proc;
pub mod routes;
pub mod rpc;
pub mod sessions;
pub mod state;
pub mod stream;
pub mod timeout;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use sessions::SessionManager;
pub use state::AppState;
