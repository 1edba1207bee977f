//! Request/response transport built on the broker primitives.

pub mod connection;
pub mod consumer;
pub mod health;
pub mod producer;

pub use connection::ConnectionManager;
pub use consumer::{Consumer, ConsumerState, Responder, TaskHandler};
pub use health::{HEALTH_CHECK_QUEUE, HealthReport, check_broker};
pub use producer::{Producer, ResponseStream};
