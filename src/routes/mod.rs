//! HTTP route handlers (everything that isn't the WebSocket).

pub mod health;
