//! Library for `wardend`, the in-sandbox control plane.
//!
//! Six singleton managers share one address space behind an HTTP/WebSocket
//! front end: processes, terminals, port tracking, language servers, the
//! egress tunnel, and lifecycle. Each owns its OS resource exclusively;
//! everything external refers to entities by opaque id.

pub mod api;
pub mod error;
pub mod lifecycle;
pub mod lsp;
pub mod ports;
pub mod process;
pub mod terminal;
pub mod tunnel;
