//! Live-cluster scenarios

mod helpers;
mod kafka_lifecycle;
