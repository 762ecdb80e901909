//! HTTP and WebSocket transport for the SFU.

pub mod http;
