// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Connection setup, plus the `BrokerChannel` trait: the narrow set of channel
//! operations the topology, publisher and consumer need. `lapin::Channel`
//! implements it for real brokers; tests substitute mocks or an in-memory
//! broker.

use crate::{
    config::AppConfig,
    consumer::InboundMessage,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tracing::{debug, error};

/// Deliveries of a registered consumer, in arrival order.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage, AmqpError>>;

/// Channel operations used by this crate.
///
/// All methods are synchronous round-trips against the broker; a failure
/// means the channel is unusable and is reported as a transport error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares an exchange. Identical re-declarations are no-ops; conflicting
    /// ones fail.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue with the arguments rendered by `QueueDefinition::arguments`.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Positively acknowledges a single delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Negatively acknowledges a single delivery with `requeue=false`, handing
    /// it to the queue's dead-letter target.
    async fn reject(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries per consumer on this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Registers a manual-ack consumer on `queue`. Every delivery on the
    /// returned stream must be settled with `ack` or `reject`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;
}

#[async_trait]
impl BrokerChannel for Channel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.exchange_declare(
            def.name(),
            def.exchange_kind().into(),
            ExchangeDeclareOptions {
                passive: def.passive,
                durable: def.durable,
                auto_delete: def.delete,
                internal: def.internal,
                nowait: false,
            },
            def.arguments(),
        )
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                name = def.name(),
                "error to declare the exchange"
            );
            AmqpError::DeclareExchangeError(def.name().to_owned())
        })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.queue_declare(
            def.name(),
            QueueDeclareOptions {
                passive: def.passive,
                durable: def.durable,
                exclusive: def.exclusive,
                auto_delete: def.delete,
                nowait: false,
            },
            def.arguments(),
        )
        .await
        .map(|_| ())
        .map_err(|err| {
            error!(
                error = err.to_string(),
                name = def.name(),
                "error to declare the queue"
            );
            AmqpError::DeclareQueueError(def.name().to_owned())
        })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.queue_bind(
            binding.queue_name(),
            binding.exchange_name(),
            binding.key(),
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error to bind queue to exchange");
            AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            )
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                mandatory: false,
                immediate: false,
            },
            payload,
            properties,
        )
        .await
        .map(|_| ())
        .map_err(|err| {
            error!(error = err.to_string(), exchange, routing_key, "error publishing message");
            AmqpError::PublishingError
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error to ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue: false,
            },
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), delivery_tag, "error to nack msg");
            AmqpError::NackMessageError
        })
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::ConsumerDeclarationError(err.to_string())
            })?;

        Ok(consumer
            .map(|result| {
                result.map(InboundMessage::from).map_err(|err| {
                    error!(error = err.to_string(), "errors consume msg");
                    AmqpError::ConsumerError(err.to_string())
                })
            })
            .boxed())
    }
}

/// Connects to RabbitMQ with the configured settings and opens one channel.
///
/// The connection is named after `app.name` so it is identifiable in the
/// management UI.
pub async fn new_amqp_channel(cfg: &AppConfig) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app.name.clone()));

    let conn = match Connection::connect(&cfg.rabbitmq.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(
                error = err.to_string(),
                host = cfg.rabbitmq.host.as_str(),
                "failure to connect"
            );
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}
