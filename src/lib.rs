// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Bounded retry with dead-letter escalation over RabbitMQ.
//!
//! Events are published to a topic exchange and consumed from a durable
//! queue. Failed deliveries are rejected into a TTL-delayed retry queue that
//! feeds back into the main exchange; after three retries, counted from the
//! broker's own `x-death` history, a message is moved to a dead-letter queue.

mod otel;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;
