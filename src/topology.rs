// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares the exchanges, queues and bindings that implement routing,
//! delayed retry and dead-lettering. Nothing here holds runtime state: the
//! broker keeps the topology, and installing it again with the same
//! parameters is a no-op. Installing it with different parameters for an
//! existing entity is rejected by the broker and surfaces as a fatal
//! declaration error.
//!
//! The main components are:
//! - `Topology` trait: registration and installation of definitions
//! - `AmqpTopology`: installs registered definitions through a `BrokerChannel`
//! - `PedidosTopology`: the order/payment topology with its retry loop
//!
//! ```text
//! pedidos.exchange --pedido.creado--> cola-pagos --(nack)--> pedidos.retry
//!        ^                                                       |
//!        |                                                     retry
//!        |                                                       v
//!        +--------------(expired after 5s)---------------- cola-pagos-retry
//!
//! pedidos.dlx --pagos.error--> cola-pagos-dlq
//! ```

use crate::{
    channel::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Topic exchange events are published to
pub const MAIN_EXCHANGE: &str = "pedidos.exchange";
/// Direct exchange receiving messages rejected by the main queue
pub const RETRY_EXCHANGE: &str = "pedidos.retry";
/// Direct exchange receiving messages that exhausted their retries
pub const DEAD_LETTER_EXCHANGE: &str = "pedidos.dlx";

pub const MAIN_QUEUE: &str = "cola-pagos";
pub const RETRY_QUEUE: &str = "cola-pagos-retry";
pub const DEAD_LETTER_QUEUE: &str = "cola-pagos-dlq";

pub const MAIN_ROUTING_KEY: &str = "pedido.creado";
pub const RETRY_ROUTING_KEY: &str = "retry";
pub const DEAD_LETTER_ROUTING_KEY: &str = "pagos.error";

/// How long a rejected message waits in the retry queue, in milliseconds
pub const RETRY_DELAY_MS: i32 = 5000;

/// Interface for topology management.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding) -> Self;

    /// Declares everything registered, in order: exchanges, queues, bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Installs registered definitions through a `BrokerChannel`, in
/// registration order within each kind.
pub struct AmqpTopology<'tp> {
    channel: Arc<dyn BrokerChannel>,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology<'_> {
    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name());
            self.channel.declare_exchange(exch).await?;
            debug!("exchange: {} was created", exch.name());
        }

        Ok(())
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name());
            self.channel.declare_queue(def).await?;
            debug!("queue: {} was created", def.name());
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name(),
                binding.exchange_name(),
                binding.key()
            );
            self.channel.bind_queue(binding).await?;
        }

        debug!("queues were bound");

        Ok(())
    }
}

/// The order/payment topology: main, retry and dead-letter paths.
///
/// All exchanges and queues are durable and never auto-deleted. The main
/// queue dead-letters rejected messages to the retry exchange; the retry
/// queue holds them for `RETRY_DELAY_MS` and then dead-letters them back to
/// the main exchange under the original routing key.
#[derive(Debug, Clone)]
pub struct PedidosTopology {
    pub exchanges: Vec<ExchangeDefinition>,
    pub queues: Vec<QueueDefinition>,
    pub bindings: Vec<QueueBinding>,
}

impl Default for PedidosTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl PedidosTopology {
    pub fn new() -> Self {
        let exchanges = vec![
            ExchangeDefinition::new(MAIN_EXCHANGE).topic().durable(),
            ExchangeDefinition::new(RETRY_EXCHANGE).direct().durable(),
            ExchangeDefinition::new(DEAD_LETTER_EXCHANGE).direct().durable(),
        ];

        let queues = vec![
            QueueDefinition::new(DEAD_LETTER_QUEUE).durable(),
            QueueDefinition::new(RETRY_QUEUE)
                .durable()
                .ttl(RETRY_DELAY_MS)
                .dead_letter(MAIN_EXCHANGE, MAIN_ROUTING_KEY),
            QueueDefinition::new(MAIN_QUEUE)
                .durable()
                .dead_letter(RETRY_EXCHANGE, RETRY_ROUTING_KEY),
        ];

        let bindings = vec![
            QueueBinding::new(DEAD_LETTER_QUEUE)
                .exchange(DEAD_LETTER_EXCHANGE)
                .routing_key(DEAD_LETTER_ROUTING_KEY),
            QueueBinding::new(RETRY_QUEUE)
                .exchange(RETRY_EXCHANGE)
                .routing_key(RETRY_ROUTING_KEY),
            QueueBinding::new(MAIN_QUEUE)
                .exchange(MAIN_EXCHANGE)
                .routing_key(MAIN_ROUTING_KEY),
        ];

        PedidosTopology {
            exchanges,
            queues,
            bindings,
        }
    }

    /// Declares the whole topology. Safe to call on every startup.
    pub async fn provision(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        let topology = self
            .exchanges
            .iter()
            .fold(AmqpTopology::new(channel), |t, def| t.exchange(def));
        let topology = self.queues.iter().fold(topology, |t, def| t.queue(def));
        let topology = self
            .bindings
            .iter()
            .fold(topology, |t, binding| t.queue_binding(binding));

        topology.install().await?;

        info!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.bindings.len(),
            "topology provisioned"
        );

        Ok(())
    }

    /// Declares only the main exchange, which is all a publisher needs.
    pub async fn provision_publisher(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        let topology = self
            .exchanges
            .iter()
            .filter(|def| def.name() == MAIN_EXCHANGE)
            .fold(AmqpTopology::new(channel), |t, def| t.exchange(def));

        topology.install().await
    }
}
