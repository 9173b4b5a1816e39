//! Core data model.
//!
//! A message is the only persisted entity: an opaque payload plus the
//! metadata the queue needs for ordering, delayed visibility and leasing.

pub mod message;

pub use message::{Document, Lease, Message, MessageId, NewMessage, Payload, now};
