//! Taskbus — broker-backed task RPC transport.
//!
//! Producers publish task requests on a durable queue with an attached
//! exclusive reply channel, then drain a stream of responses terminated by an
//! `END` sentinel plus one trailing metadata value. Workers consume tasks one
//! at a time (prefetch = 1) and answer through a per-task
//! [`Responder`](transport::Responder), reconnecting transparently when the
//! broker link fails.

pub mod broker;
pub mod config;
pub mod error;
pub mod transport;
pub mod wire;
