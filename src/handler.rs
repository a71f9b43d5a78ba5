// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Domain processing is injected into the consumer through `ConsumerHandler`.
//! The consumer only cares whether `exec` returned `Ok` or `Err`; any error
//! spends one retry.

use crate::errors::HandlerError;
use async_trait::async_trait;
use opentelemetry::Context;
use tracing::{error, info};

/// A delivery as seen by domain processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub routing_key: String,
    pub msg_type: String,
    pub data: Vec<u8>,
    /// Retries already recorded for this message, 0 on first delivery
    pub attempt: u32,
}

impl ConsumerMessage {
    /// Payload as text; invalid UTF-8 sequences are replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Payment step triggered by `pedido.creado` events.
///
/// There is no payment backend behind it: with `simulate_failure` every
/// message fails, which drives it through the whole retry loop and into the
/// dead-letter queue.
#[derive(Debug, Clone, Copy)]
pub struct PaymentHandler {
    simulate_failure: bool,
}

impl PaymentHandler {
    pub fn new(simulate_failure: bool) -> Self {
        PaymentHandler { simulate_failure }
    }
}

#[async_trait]
impl ConsumerHandler for PaymentHandler {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        info!(attempt = msg.attempt, payload = msg.text(), "processing payment");

        if self.simulate_failure {
            let err = HandlerError::new("Error simulado en pago");
            error!(error = err.to_string(), "payment failed");
            return Err(err);
        }

        Ok(())
    }
}
