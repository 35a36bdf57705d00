//! Tollgate - Distributed Token Bucket Rate Limiting
//!
//! This crate implements a token bucket rate limiter whose state lives in a
//! shared store. Any number of processes can enforce one budget per key
//! without a coordinator: each check is a single atomic script execution on
//! the store, which refills the bucket lazily and takes tokens in one step.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
