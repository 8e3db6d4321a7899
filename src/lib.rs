//! SPM secure file-exchange server
//!
//! A single-threaded cooperative server: connections are advanced one small
//! step at a time from a shared FIFO, speaking a fixed-size, optionally
//! encrypted and signed text protocol.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod journal;
pub mod protocol;
pub mod protocol_core;
pub mod request;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod store;
pub mod ticket;
pub mod transport;
