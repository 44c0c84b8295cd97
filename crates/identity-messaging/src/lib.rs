// AMQP messaging layer with lapin
//
// This crate provides the broker implementation of the core publisher port:
// - RabbitMqBroker: implements BabyEventPublisher over a durable queue

pub mod broker;

pub use broker::RabbitMqBroker;
