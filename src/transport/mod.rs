//! Transport layer for call signaling
//!
//! Provides the WebSocket client that carries signaling messages.

pub mod websocket;

pub use websocket::WebSocketSignaling;
