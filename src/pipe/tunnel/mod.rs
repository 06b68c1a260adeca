//! Reverse tunnel: a client registers a public port over a control channel and the
//! server hands each inbound connection on that port back to the client, paired by a
//! correlation id, over a fresh data connection.

pub mod client;
pub mod forwards;
pub mod pending;
pub mod protocol;
pub mod server;
pub mod splice;
