//! Per-client request throttling for rethrottle.
//!
//! This crate provides the fixed-window throttle:
//! - A counter store client backed by Redis or process memory
//! - The decision engine comparing a client's hit count against the configured limit
//!
//! The window lives entirely in the store: every accepted hit increments the client's
//! counter and pushes its expiry `interval` into the future. Once the counter expires the
//! client starts over at zero.

#![deny(missing_docs)]

mod client_key;
mod engine;
mod error;
mod storage;

pub use client_key::ClientKey;
pub use engine::{Decision, Throttle};
pub use error::ThrottleError;
pub use storage::{CounterStore, HitResult, InMemoryStorage, RedisStorage, Storage, StorageError};
