//! Backend capabilities the procs count against.
//!
//! A proc never talks to a broker SDK directly. It holds one of these
//! capabilities and asks it for numbers:
//!
//! - [`QueueDepth`]: how many messages a queue currently holds on the broker.
//! - [`WorkerControl`]: the broker's remote-control inspection interface
//!   (which tasks the workers are holding right now, and which queues they
//!   consume from).

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BackendError;

pub mod amqp;
pub mod memory;
pub mod redis;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;
pub use self::redis::{CeleryRedisBroker, RedisConnection};

/// Declared depth of a queue on the broker.
#[async_trait]
pub trait QueueDepth: Send + Sync + fmt::Debug {
    /// Returns [`BackendError::NotFound`] when the queue has not been declared yet.
    async fn declared_depth(&self, queue: &str) -> Result<u64, BackendError>;
}

/// The remote-control calls an inspector is allowed to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InspectMethod {
    ActiveQueues,
    Active,
    Reserved,
    Scheduled,
}

impl InspectMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            InspectMethod::ActiveQueues => "active_queues",
            InspectMethod::Active => "active",
            InspectMethod::Reserved => "reserved",
            InspectMethod::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for InspectMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker inspection for a broker application.
///
/// Replies follow the Celery remote-control shape: a JSON object keyed by
/// worker hostname whose values are arrays (tasks, or queue descriptions for
/// [`InspectMethod::ActiveQueues`]). `null` means no worker replied.
#[async_trait]
pub trait WorkerControl: Send + Sync + fmt::Debug {
    /// Stable identity of the broker application, used as the inspection cache key.
    fn identity(&self) -> &str;

    async fn inspect(&self, method: InspectMethod) -> Result<Value, BackendError>;
}
