//! Command line / environment settings shared by every service binary.

use clap::{ArgAction, Args, ValueEnum};
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use std::time::Duration;

/// Consumer group partition assignment strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Assignor {
    Range,
    Roundrobin,
    Sticky,
}

impl Assignor {
    pub fn as_strategy(self) -> &'static str {
        match self {
            Assignor::Range => "range",
            Assignor::Roundrobin => "roundrobin",
            Assignor::Sticky => "cooperative-sticky",
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct KafkaArgs {
    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    pub kafka_brokers: String,

    #[arg(long, env = "KAFKA_SCHEMA_REGISTRY_URL", default_value = "http://localhost:8081")]
    pub schema_registry_url: String,

    /// "1" waits for the partition leader only; "all" waits for the full ISR.
    #[arg(long, env = "KAFKA_PRODUCER_ACKS", default_value = "1")]
    pub producer_acks: String,

    #[arg(long, env = "KAFKA_CONSUMER_ASSIGNOR", value_enum, default_value_t = Assignor::Range)]
    pub assignor: Assignor,

    /// Start new consumer groups from the oldest retained offset.
    #[arg(long, env = "KAFKA_CONSUMER_OLDEST", default_value_t = true, action = ArgAction::Set)]
    pub oldest: bool,

    #[arg(long, env = "KAFKA_CONSUMER_VERBOSE", default_value_t = false, action = ArgAction::Set)]
    pub verbose: bool,

    /// Pause before rejoining the group after a handler failure.
    #[arg(long, env = "KAFKA_CONSUMER_REJOIN_BACKOFF_MS", default_value_t = 1000)]
    pub rejoin_backoff_ms: u64,
}

impl KafkaArgs {
    pub fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.kafka_brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", &self.producer_acks)
            // Same key, same partition, compatible with the Java clients.
            .set("partitioner", "murmur2_random");
        config
    }

    pub fn consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("group.id", group_id)
            .set("bootstrap.servers", &self.kafka_brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("partition.assignment.strategy", self.assignor.as_strategy())
            .set(
                "auto.offset.reset",
                if self.oldest { "earliest" } else { "latest" },
            );

        if self.verbose {
            config
                .set("debug", "consumer,cgrp,topic,fetch")
                .set_log_level(RDKafkaLogLevel::Debug);
        }

        config
    }

    pub fn rejoin_backoff(&self) -> Duration {
        Duration::from_millis(self.rejoin_backoff_ms)
    }
}
