//! The wire side of the protocol: byte buffer, message framing codec,
//! stream transport with its worker threads, per-transport registries and
//! the authentication handshake plumbing.

pub mod auth;
pub mod buffer;
pub mod codec;
pub mod frame;
pub mod registry;
pub mod shared;
pub mod transport;
