//! # leaseq
//!
//! Persistent, store-backed work queue with priorities, delayed visibility
//! and renewable leases.
//!
//! Producers [`queue::Queue::send`] messages; consumers claim them with
//! `get`, which leases the message for the queue's reset duration. A
//! consumer that dies simply lets the lease run out and the message becomes
//! claimable again. [`worker::Listener`] wraps the claim, handle and settle
//! cycle with lease renewal and a retry budget.
//!
//! Storage is pluggable through [`store::Store`]: Postgres ([`db::PgStore`])
//! for production and [`store::MemoryStore`] for tests and single-process use.

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod worker;
