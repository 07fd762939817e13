pub mod channel;
pub mod client;
pub mod error;
#[cfg(test)]
pub mod memory;
pub mod message;
pub mod rabbitmq;

pub use channel::{BrokerChannel, Topology};
pub use client::{BrokerClient, BrokerConfig, TaskPublisher};
pub use error::QueueError;
pub use message::Delivery;
pub use rabbitmq::RabbitMqChannel;
