//! Management RPC protocol for the gridmate agent, plus a client for it.
//!
//! The agent listens on a local TCP port and speaks sentinel-framed JSON
//! documents (see [`protocol`]); an HTTP-compatible variant of the same
//! protocol is served on the same port. [`client::AgentClient`] is the
//! console-side implementation of the raw transport.

pub mod client;
pub mod protocol;
