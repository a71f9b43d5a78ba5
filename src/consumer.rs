// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! Processes one delivery at a time and settles it according to the retry
//! policy:
//!
//! - handler succeeded: ack
//! - handler failed with retries left: nack with `requeue=false`; the main
//!   queue's dead-letter target routes it through the delay queue and back
//! - handler failed with no retries left: publish payload and properties to
//!   the dead-letter exchange, then ack
//!
//! The dead-letter publish and the ack are two separate broker calls. If the
//! process dies between them, the original delivery is redelivered and ends up
//! in the dead-letter queue twice. Acking first would instead lose it.

use crate::{
    channel::BrokerChannel,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
    retry::{attempt_count, RetryPolicy, Verdict},
    topology,
};
use lapin::{message::Delivery, BasicProperties};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, info, warn};

/// A delivery detached from the channel that produced it.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

impl From<Delivery> for InboundMessage {
    fn from(delivery: Delivery) -> Self {
        InboundMessage {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            payload: delivery.data,
            properties: delivery.properties,
        }
    }
}

/// Where messages that exhausted their retries are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRoute {
    pub exchange: String,
    pub routing_key: String,
}

impl Default for DeadLetterRoute {
    fn default() -> Self {
        DeadLetterRoute {
            exchange: topology::DEAD_LETTER_EXCHANGE.to_owned(),
            routing_key: topology::DEAD_LETTER_ROUTING_KEY.to_owned(),
        }
    }
}

/// Runs the handler on a delivery and settles it through the retry policy.
///
/// Holds no per-message state: the attempt number comes from the delivery's
/// `x-death` header, so any instance can pick up any redelivery.
pub struct RetryConsumer {
    channel: Arc<dyn BrokerChannel>,
    handler: Arc<dyn ConsumerHandler>,
    policy: RetryPolicy,
    queue: String,
    dead_letter: DeadLetterRoute,
    tracer: BoxedTracer,
}

impl RetryConsumer {
    /// Creates a consumer for the payment queue with the default policy and
    /// dead-letter route.
    ///
    /// # Parameters
    /// * `channel` - Channel used to ack, reject and publish to the dead-letter exchange
    /// * `handler` - Domain processing for each delivery
    ///
    /// # Returns
    /// A new RetryConsumer reading from `cola-pagos`
    pub fn new(channel: Arc<dyn BrokerChannel>, handler: Arc<dyn ConsumerHandler>) -> Self {
        RetryConsumer {
            channel,
            handler,
            policy: RetryPolicy::default(),
            queue: topology::MAIN_QUEUE.to_owned(),
            dead_letter: DeadLetterRoute::default(),
            tracer: global::tracer("amqp consumer"),
        }
    }

    /// Replaces the default retry budget.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Queue whose rejections count as attempts.
    pub fn with_queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_owned();
        self
    }

    pub fn with_dead_letter(mut self, route: DeadLetterRoute) -> Self {
        self.dead_letter = route;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Runs the handler on one delivery and settles it.
    ///
    /// Handler failures are not errors here: they become a `Retry` or
    /// `DeadLetter` verdict. An `Err` means the broker could not be told
    /// about the verdict and the channel should be considered lost.
    pub async fn consume(&self, msg: &InboundMessage) -> Result<Verdict, AmqpError> {
        let attempts = attempt_count(msg.properties.headers().as_ref(), &self.queue);
        let msg_type = msg
            .properties
            .kind()
            .as_ref()
            .map(|kind| kind.to_string())
            .unwrap_or_default();

        let span_name = if msg_type.is_empty() {
            msg.routing_key.as_str()
        } else {
            msg_type.as_str()
        };
        let (ctx, mut span) = otel::new_span(&msg.properties, &self.tracer, span_name);

        debug!(
            exchange = msg.exchange.as_str(),
            routing_key = msg.routing_key.as_str(),
            delivery_tag = msg.delivery_tag,
            attempts,
            "received"
        );

        let consumer_msg = ConsumerMessage {
            queue: self.queue.clone(),
            routing_key: msg.routing_key.clone(),
            msg_type,
            data: msg.payload.clone(),
            attempt: attempts,
        };

        let outcome = self.handler.exec(&ctx, &consumer_msg).await;
        if let Err(err) = &outcome {
            span.record_error(err);
        }

        let verdict = self.policy.decide(&outcome, attempts);

        let settled = match verdict {
            Verdict::Ack => {
                debug!("message successfully processed");
                self.channel.ack(msg.delivery_tag).await
            }
            Verdict::Retry { attempt, max } => {
                warn!(attempt, max, "error whiling handling msg, retrying ({}/{})", attempt, max);
                self.channel.reject(msg.delivery_tag).await
            }
            Verdict::DeadLetter { attempts } => {
                error!(attempts, "too many attempts, sending to dlq");
                self.dead_letter(msg).await
            }
        };

        match settled {
            Ok(()) => {
                if verdict == Verdict::Ack {
                    span.set_status(Status::Ok);
                } else {
                    span.set_status(Status::Error {
                        description: Cow::from("handler failed"),
                    });
                }
                Ok(verdict)
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                Err(err)
            }
        }
    }

    /// Publishes the message unchanged to the dead-letter route, then acks the
    /// original. The original stays unacked if the publish fails.
    async fn dead_letter(&self, msg: &InboundMessage) -> Result<(), AmqpError> {
        if let Err(err) = self
            .channel
            .publish(
                &self.dead_letter.exchange,
                &self.dead_letter.routing_key,
                &msg.payload,
                msg.properties.clone(),
            )
            .await
        {
            error!(error = err.to_string(), "error whiling sending to dlq");
            return Err(AmqpError::PublishingToDLQError);
        }

        self.channel.ack(msg.delivery_tag).await?;

        info!(
            exchange = self.dead_letter.exchange.as_str(),
            routing_key = self.dead_letter.routing_key.as_str(),
            "message moved to dead-letter queue"
        );

        Ok(())
    }
}
