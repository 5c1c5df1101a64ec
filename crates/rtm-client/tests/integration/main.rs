//! Integration test entry point for rtm-client.
//!
//! Run with: cargo test --test integration

mod harness;
mod connection;
mod session;
mod reconcile;
