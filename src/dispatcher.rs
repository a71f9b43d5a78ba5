// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Registers a manual-ack consumer on the payment queue and feeds each
//! delivery to a `RetryConsumer`. The prefetch count defaults to 1 and
//! deliveries are processed inline, one after another, so a consumer never
//! has more than one attempt in flight.

use crate::{channel::BrokerChannel, consumer::RetryConsumer, errors::AmqpError};
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::info;

/// Maximum unacknowledged deliveries held by this consumer
pub const DEFAULT_PREFETCH_COUNT: u16 = 1;

/// Drives a `RetryConsumer` from a broker consumer registration.
///
/// The dispatcher owns the consume loop: it sets the channel QoS, registers
/// the consumer and hands every delivery to the `RetryConsumer`, waiting for
/// it to be settled before taking the next one.
pub struct Dispatcher {
    channel: Arc<dyn BrokerChannel>,
    consumer: RetryConsumer,
    consumer_tag: String,
    prefetch_count: u16,
}

impl Dispatcher {
    /// Creates a new dispatcher with a prefetch count of `DEFAULT_PREFETCH_COUNT`.
    ///
    /// # Parameters
    /// * `channel` - Channel used to set QoS and register the consumer
    /// * `consumer` - Processes and settles each delivery
    /// * `consumer_tag` - Tag the consumer is registered under
    ///
    /// # Returns
    /// A new Dispatcher instance
    pub fn new(channel: Arc<dyn BrokerChannel>, consumer: RetryConsumer, consumer_tag: &str) -> Self {
        Dispatcher {
            channel,
            consumer,
            consumer_tag: consumer_tag.to_owned(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
        }
    }

    /// Sets a custom prefetch count (QoS).
    ///
    /// Deliveries are still processed one at a time; a larger value only lets
    /// the broker push ahead of the handler.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Consumes until the broker cancels the consumer or the channel fails.
    ///
    /// Handler failures are absorbed by the retry policy. Transport errors,
    /// on the delivery stream or while settling a delivery, end the loop and
    /// are returned; reconnecting is up to the caller.
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        self.channel.qos(self.prefetch_count).await?;

        let mut deliveries = self
            .channel
            .consume(self.consumer.queue(), &self.consumer_tag)
            .await?;

        info!(
            queue = self.consumer.queue(),
            prefetch = self.prefetch_count,
            "consumer started, waiting for messages"
        );

        while let Some(delivery) = deliveries.next().await {
            self.consumer.consume(&delivery?).await?;
        }

        info!("consumer stream closed");

        Ok(())
    }
}
