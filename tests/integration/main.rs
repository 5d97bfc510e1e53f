//! Integration test entry point
//!
//! Run with: cargo test --test integration
//!
//! Every scenario drives a real `BackendConnection` against a scripted
//! in-process backend speaking the server side of MySQL protocol 10 over an
//! in-memory duplex stream, so the suite needs no live database.

mod handshake;
mod mock;
mod query;
