#![doc = include_str!("../README.md")]

pub mod config;
pub mod consumer;
pub mod envelope;
pub mod publisher;
pub mod retry;
pub mod stats;
pub mod topology;
pub mod transport;

#[doc(inline)]
pub use config::{Config, ConfigError};

#[doc(inline)]
pub use consumer::{
    Consumer, ConsumerHook, ConsumerOptions, ConsumerRunError, ConsumerRunErrorKind,
    ConsumerState, DefaultConsumerHook,
};

#[doc(inline)]
pub use envelope::Envelope;

#[doc(inline)]
pub use publisher::{PublishError, PublishErrorKind, Publisher};

#[doc(inline)]
pub use retry::{Backoff, RetryPolicy};

#[doc(inline)]
pub use topology::{Topology, TopologyError, ensure_topology};

#[doc(inline)]
pub use transport::{Transport, TransportError};
