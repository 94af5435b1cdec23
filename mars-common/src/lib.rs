pub mod config;
pub mod health;
pub mod kafka_producer;
pub mod metrics;
pub mod parser;
pub mod record;
pub mod retry;
