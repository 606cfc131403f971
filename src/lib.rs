//! reliq: reliability and fleet coordination for Redis-backed job queues.
//!
//! This library augments a Redis job queue with the guarantees a fleet of
//! worker processes needs to survive crashes:
//!
//! - **Reliable fetch**: jobs are moved atomically from a queue's pending
//!   list into a per-process in-flight list, so a worker crash never loses
//!   a claimed job ([`Fetch`]).
//! - **Crash recovery**: a fleet-wide registry tracks which queues each
//!   live process watches; one elected process periodically detects dead
//!   processes and moves their stranded in-flight jobs back to pending
//!   ([`Resurrector`]).
//! - **Distributed lease**: maintenance work runs on at most one process
//!   at a time, with a minimum-interval guard that holds even under fast
//!   lock turnover ([`lock::run_exclusively`]).
//! - **Empty-queue index**: a two-tier (global + local) cache of queues
//!   known to have no pending work keeps the hot fetch path from hammering
//!   Redis ([`EmptyQueues`]).
//!
//! Delivery is at-least-once; consumers are expected to be idempotent.

pub mod config;
pub mod empty_queues;
pub mod error;
pub mod expirable_set;
pub mod fetch;
pub mod interval;
pub mod lock;
pub mod queue_name;
pub mod resurrector;
pub mod supervisor;
pub mod unit_of_work;

pub use config::{Config, ResurrectionCallback};
pub use empty_queues::EmptyQueues;
pub use error::{ConfigError, StoreError};
pub use expirable_set::ExpirableSet;
pub use fetch::{Fetch, NoPauses, NoThrottle, PauseStore, ThrottleOracle};
pub use queue_name::QueueName;
pub use resurrector::Resurrector;
pub use supervisor::{Supervisor, SupervisorError};
pub use unit_of_work::UnitOfWork;
