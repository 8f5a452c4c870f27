//! Local-transport plumbing shared by stubs and proxies.
//!
//! # Architecture
//!
//! - **protocol**: Interface trait, identifiers, reply envelope
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **transport**: Connection type over Unix socket pairs

pub mod codec;
pub mod protocol;
pub mod transport;
