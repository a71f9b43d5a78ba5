// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Turns a domain event into a persistent AMQP message and hands it to the
//! broker. Publishing is fire-and-forget: no publisher confirm is awaited.
//! Durability comes from the persistent delivery mode together with durable
//! exchanges and queues.

use crate::{channel::BrokerChannel, errors::AmqpError, otel, topology};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, LongInt, LongLongInt, LongString, ShortInt, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::info;
use uuid::Uuid;

/// Content type for the UTF-8 text payloads this crate publishes
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
/// AMQP delivery mode asking the broker to persist the message to disk
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Typed header values accepted on publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Bool(bool),
}

/// An outgoing message. `payload` is opaque to the publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishMessage {
    pub exchange: String,
    pub routing_key: String,
    pub msg_type: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Option<HashMap<String, HeaderValues>>,
}

impl PublishMessage {
    /// An event for the main exchange under `routing_key`.
    pub fn event(routing_key: &str, payload: impl Into<Vec<u8>>) -> Self {
        PublishMessage {
            exchange: topology::MAIN_EXCHANGE.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError>;
}

/// Publishes order events as persistent messages.
///
/// Every message gets a fresh UUID `message_id`, `delivery_mode = 2` and the
/// current trace context in its headers.
pub struct PedidoPublisher {
    channel: Arc<dyn BrokerChannel>,
}

impl PedidoPublisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `channel` - Channel the messages are published on
    ///
    /// # Returns
    /// An Arc-wrapped PedidoPublisher instance for sharing across tasks
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Arc<PedidoPublisher> {
        Arc::new(PedidoPublisher { channel })
    }

    /// Publishes a `pedido.creado` event to the main exchange.
    pub async fn publish_event(&self, ctx: &Context, payload: &str) -> Result<(), AmqpError> {
        self.publish(ctx, &PublishMessage::event(topology::MAIN_ROUTING_KEY, payload))
            .await
    }
}

#[async_trait]
impl Publisher for PedidoPublisher {
    /// Publishes one persistent message, carrying the trace context of `ctx`,
    /// a fresh message id and any caller-supplied headers.
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError> {
        let mut btree = otel::inject(ctx);

        if let Some(headers) = &msg.headers {
            btree_map(headers, &mut btree);
        }

        let mut properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_content_type(ShortString::from(TEXT_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(btree));

        if let Some(msg_type) = &msg.msg_type {
            properties = properties.with_type(ShortString::from(msg_type.clone()));
        }

        self.channel
            .publish(&msg.exchange, &msg.routing_key, &msg.payload, properties)
            .await?;

        info!(
            exchange = msg.exchange.as_str(),
            routing_key = msg.routing_key.as_str(),
            "event published"
        );

        Ok(())
    }
}

fn btree_map(hash_map: &HashMap<String, HeaderValues>, btree: &mut BTreeMap<ShortString, AMQPValue>) {
    for (key, value) in hash_map {
        let amqp_value = match value {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v.clone())),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(*v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(*v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValues::Bool(v) => AMQPValue::Boolean(*v),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }
}
