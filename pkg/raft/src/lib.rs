//! A leader-based consensus engine and replicated key-value store.
//!
//! `consensus` and `storage` hold the pure, synchronous rules (role
//! transitions, the RequestVote/AppendEntries acceptance tests, commit
//! advancement); `engine` drives those rules against real timers, threads
//! and a TCP transport. `kv` is the thin client-facing surface that
//! serializes `Put`/`Get` through the log.

#[macro_use] extern crate error_chain;
#[macro_use] extern crate serde_derive;

pub mod errors;
pub mod protos;
pub mod storage;
pub mod peer;
pub mod worker_pool;
pub mod rpc;
pub mod discovery;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod kv;
