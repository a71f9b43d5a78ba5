// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! End-to-end retry and dead-letter flow against an in-memory broker.
//!
//! `MemoryBroker` reproduces the RabbitMQ behaviour the topology relies on:
//! direct and topic routing, per-queue TTL measured on a manual clock, and
//! dead-lettering with `x-death` bookkeeping (one entry per queue and reason,
//! `count` incremented, most recent first).

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    types::{AMQPValue, FieldArray, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use pedidos_rabbitmq::{
    channel::{BrokerChannel, DeliveryStream},
    consumer::{InboundMessage, RetryConsumer},
    dispatcher::Dispatcher,
    errors::{AmqpError, HandlerError},
    exchange::{ExchangeDefinition, ExchangeKind},
    handler::{ConsumerHandler, ConsumerMessage, PaymentHandler},
    publisher::PedidoPublisher,
    queue::{QueueBinding, QueueDefinition},
    retry::{attempt_count, Verdict},
    topology::{PedidosTopology, DEAD_LETTER_QUEUE, MAIN_QUEUE, RETRY_QUEUE},
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
};

#[derive(Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    properties: BasicProperties,
    enqueued_at: u64,
}

struct MemoryQueue {
    def: QueueDefinition,
    ready: VecDeque<Stored>,
}

#[derive(Default)]
struct State {
    now: u64,
    next_tag: u64,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<QueueBinding>,
    unacked: HashMap<u64, (String, Stored)>,
    prefetch: Option<u16>,
}

#[derive(Default)]
struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    fn now(&self) -> u64 {
        self.state.lock().unwrap().now
    }

    fn depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (state.exchanges.len(), state.queues.len(), state.bindings.len())
    }

    fn prefetch(&self) -> Option<u16> {
        self.state.lock().unwrap().prefetch
    }

    fn unacked(&self) -> usize {
        self.state.lock().unwrap().unacked.len()
    }

    fn ready(&self, queue: &str) -> Vec<Stored> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// basic.get with manual ack.
    fn get(&self, queue: &str) -> Option<InboundMessage> {
        let mut state = self.state.lock().unwrap();
        let stored = state.queues.get_mut(queue)?.ready.pop_front()?;

        state.next_tag += 1;
        let tag = state.next_tag;
        state.unacked.insert(tag, (queue.to_owned(), stored.clone()));

        Some(InboundMessage {
            delivery_tag: tag,
            exchange: stored.exchange,
            routing_key: stored.routing_key,
            payload: stored.payload,
            properties: stored.properties,
        })
    }

    /// Moves the clock forward, expiring messages whose queue TTL elapsed.
    fn advance(&self, ms: u64) {
        let mut state = self.state.lock().unwrap();
        state.now += ms;
        let now = state.now;

        let mut expired = vec![];
        for (name, queue) in state.queues.iter_mut() {
            let Some(ttl) = queue.def.message_ttl() else {
                continue;
            };
            while queue
                .ready
                .front()
                .is_some_and(|m| m.enqueued_at + ttl as u64 <= now)
            {
                if let Some(msg) = queue.ready.pop_front() {
                    expired.push((name.clone(), msg));
                }
            }
        }

        for (queue, msg) in expired {
            dead_letter(&mut state, &queue, msg, "expired");
        }
    }
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => topic_matches(rest, key_rest),
        (Some((word, rest)), Some((k, key_rest))) => word == k && topic_matches(rest, key_rest),
        _ => false,
    }
}

fn route(state: &mut State, exchange: &str, routing_key: &str, stored: Stored) -> Result<(), AmqpError> {
    let kind = state
        .exchanges
        .get(exchange)
        .map(|e| e.exchange_kind())
        .ok_or(AmqpError::PublishingError)?;

    let targets: Vec<String> = state
        .bindings
        .iter()
        .filter(|b| b.exchange_name() == exchange)
        .filter(|b| match kind {
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => {
                let pattern: Vec<&str> = b.key().split('.').collect();
                let key: Vec<&str> = routing_key.split('.').collect();
                topic_matches(&pattern, &key)
            }
            _ => b.key() == routing_key,
        })
        .map(|b| b.queue_name().to_owned())
        .collect();

    for target in targets {
        if let Some(queue) = state.queues.get_mut(&target) {
            queue.ready.push_back(Stored {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                enqueued_at: state.now,
                ..stored.clone()
            });
        }
    }

    Ok(())
}

fn text(value: Option<&AMQPValue>) -> Option<String> {
    match value {
        Some(AMQPValue::LongString(v)) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        _ => None,
    }
}

fn dead_letter(state: &mut State, queue: &str, msg: Stored, reason: &str) {
    let Some(target) = state
        .queues
        .get(queue)
        .and_then(|q| q.def.dead_letter_target().cloned())
    else {
        return;
    };

    let mut headers = msg
        .properties
        .headers()
        .as_ref()
        .map(|h| h.inner().clone())
        .unwrap_or_default();

    let mut deaths: Vec<AMQPValue> = headers
        .get("x-death")
        .and_then(AMQPValue::as_array)
        .map(|a| a.as_slice().to_vec())
        .unwrap_or_default();

    let position = deaths.iter().position(|d| {
        d.as_field_table().is_some_and(|t| {
            text(t.inner().get("queue")).as_deref() == Some(queue)
                && text(t.inner().get("reason")).as_deref() == Some(reason)
        })
    });

    let entry = match position {
        Some(i) => {
            let mut entry = deaths.remove(i).as_field_table().map(|t| t.inner().clone()).unwrap_or_default();
            let count = entry
                .get("count")
                .and_then(AMQPValue::as_long_long_int)
                .unwrap_or(0);
            entry.insert(ShortString::from("count"), AMQPValue::LongLongInt(count + 1));
            entry
        }
        None => {
            let mut entry = BTreeMap::new();
            entry.insert(ShortString::from("count"), AMQPValue::LongLongInt(LongLongInt::from(1)));
            entry.insert(ShortString::from("queue"), AMQPValue::LongString(LongString::from(queue)));
            entry.insert(ShortString::from("reason"), AMQPValue::LongString(LongString::from(reason)));
            entry.insert(
                ShortString::from("exchange"),
                AMQPValue::LongString(LongString::from(msg.exchange.clone())),
            );
            entry
        }
    };
    deaths.insert(0, AMQPValue::FieldTable(FieldTable::from(entry)));

    headers.insert(
        ShortString::from("x-death"),
        AMQPValue::FieldArray(FieldArray::from(deaths)),
    );

    let stored = Stored {
        properties: msg.properties.clone().with_headers(FieldTable::from(headers)),
        ..msg
    };

    // A missing dead-letter exchange silently drops the message, as RabbitMQ does.
    let _ = route(state, &target.exchange, &target.routing_key, stored);
}

#[async_trait]
impl BrokerChannel for MemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        match state.exchanges.get(def.name()) {
            Some(existing) if existing != def => Err(AmqpError::DeclareExchangeError(def.name().to_owned())),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name().to_owned(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        match state.queues.get(def.name()) {
            Some(existing) if existing.def != *def => Err(AmqpError::DeclareQueueError(def.name().to_owned())),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name().to_owned(),
                    MemoryQueue {
                        def: def.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        if !state.exchanges.contains_key(binding.exchange_name()) || !state.queues.contains_key(binding.queue_name()) {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        let stored = Stored {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            properties,
            enqueued_at: state.now,
        };
        route(&mut state, exchange, routing_key, stored)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or(AmqpError::AckMessageError)
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        let (queue, msg) = state
            .unacked
            .remove(&delivery_tag)
            .ok_or(AmqpError::NackMessageError)?;
        dead_letter(&mut state, &queue, msg, "rejected");
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.state.lock().unwrap().prefetch = Some(prefetch_count);
        Ok(())
    }

    /// Delivers whatever is ready when the consumer registers, then ends.
    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        if !self.state.lock().unwrap().queues.contains_key(queue) {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        }

        let mut deliveries = vec![];
        while let Some(msg) = self.get(queue) {
            deliveries.push(Ok(msg));
        }
        Ok(stream::iter(deliveries).boxed())
    }
}

/// Fails while the recorded attempt is below `succeed_at`.
struct Flaky {
    succeed_at: Option<u32>,
    seen: Mutex<Vec<u32>>,
}

impl Flaky {
    fn new(succeed_at: Option<u32>) -> Arc<Self> {
        Arc::new(Flaky {
            succeed_at,
            seen: Mutex::new(vec![]),
        })
    }

    fn seen(&self) -> Vec<u32> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConsumerHandler for Flaky {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(msg.attempt);
        match self.succeed_at {
            Some(at) if msg.attempt >= at => Ok(()),
            _ => Err(HandlerError::new("payment gateway unavailable")),
        }
    }
}

async fn provisioned() -> Arc<MemoryBroker> {
    let broker = Arc::new(MemoryBroker::default());
    PedidosTopology::new()
        .provision(broker.clone())
        .await
        .expect("provision topology");
    broker
}

async fn publish(broker: &Arc<MemoryBroker>, payload: &str) {
    PedidoPublisher::new(broker.clone())
        .publish_event(&Context::new(), payload)
        .await
        .expect("publish event");
}

/// Consumes until nothing is left in the main or retry queue, letting the
/// clock run in one-second steps while messages wait out their delay.
/// Returns the clock reading at each delivery and each verdict.
async fn drain(broker: &Arc<MemoryBroker>, handler: Arc<dyn ConsumerHandler>) -> Vec<(u64, Verdict)> {
    let mut deliveries = vec![];

    for _ in 0..1000 {
        if let Some(msg) = broker.get(MAIN_QUEUE) {
            // A fresh consumer per delivery: nothing survives between attempts
            // except what the broker stores.
            let consumer = RetryConsumer::new(broker.clone(), handler.clone());
            let at = broker.now();
            let verdict = consumer.consume(&msg).await.expect("settle delivery");
            deliveries.push((at, verdict));
        } else if broker.depth(RETRY_QUEUE) > 0 {
            broker.advance(1000);
        } else {
            break;
        }
    }

    deliveries
}

#[tokio::test]
async fn provisioning_twice_is_idempotent() {
    let broker = provisioned().await;

    PedidosTopology::new()
        .provision(broker.clone())
        .await
        .expect("second provisioning");

    assert_eq!(broker.counts(), (3, 3, 3));
}

#[tokio::test]
async fn conflicting_redeclaration_is_fatal() {
    let broker = provisioned().await;

    let result = broker
        .declare_queue(&QueueDefinition::new(RETRY_QUEUE).durable().ttl(10_000))
        .await;

    assert_eq!(result, Err(AmqpError::DeclareQueueError(RETRY_QUEUE.to_owned())));
}

#[tokio::test]
async fn always_failing_message_ends_in_dead_letter_queue() {
    let broker = provisioned().await;
    publish(&broker, "Pedido creado: ID 123").await;

    let handler = Flaky::new(None);
    let deliveries = drain(&broker, handler.clone()).await;

    assert_eq!(handler.seen(), vec![0, 1, 2, 3]);
    assert_eq!(
        deliveries.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
        vec![
            Verdict::Retry { attempt: 1, max: 3 },
            Verdict::Retry { attempt: 2, max: 3 },
            Verdict::Retry { attempt: 3, max: 3 },
            Verdict::DeadLetter { attempts: 3 },
        ]
    );

    assert_eq!(broker.depth(MAIN_QUEUE), 0);
    assert_eq!(broker.depth(RETRY_QUEUE), 0);
    assert_eq!(broker.unacked(), 0);

    let dead = broker.ready(DEAD_LETTER_QUEUE);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, b"Pedido creado: ID 123".to_vec());
    assert_eq!(dead[0].properties.delivery_mode(), &Some(2));
    assert_eq!(attempt_count(dead[0].properties.headers().as_ref(), MAIN_QUEUE), 3);
}

#[tokio::test]
async fn retries_wait_at_least_the_queue_ttl() {
    let broker = provisioned().await;
    publish(&broker, "Pedido creado: ID 7").await;

    let deliveries = drain(&broker, Flaky::new(None)).await;
    let times: Vec<u64> = deliveries.iter().map(|(at, _)| *at).collect();

    assert_eq!(times.len(), 4);
    assert!(times.windows(2).all(|w| w[1] - w[0] >= 5000), "{times:?}");
}

#[tokio::test]
async fn success_on_a_retry_never_reaches_dead_letter_queue() {
    for k in 0..=3 {
        let broker = provisioned().await;
        publish(&broker, "Pedido creado: ID 9").await;

        let handler = Flaky::new(Some(k));
        let deliveries = drain(&broker, handler.clone()).await;

        assert_eq!(handler.seen(), (0..=k).collect::<Vec<_>>());
        assert_eq!(deliveries.last().map(|(_, v)| *v), Some(Verdict::Ack));
        assert_eq!(broker.depth(DEAD_LETTER_QUEUE), 0);
        assert_eq!(broker.depth(MAIN_QUEUE), 0);
        assert_eq!(broker.unacked(), 0);
    }
}

#[tokio::test]
async fn simulated_payment_failure_runs_the_full_loop() {
    let broker = provisioned().await;
    publish(&broker, "Pedido creado: ID 123").await;

    let deliveries = drain(&broker, Arc::new(PaymentHandler::new(true))).await;

    assert_eq!(deliveries.len(), 4);
    assert_eq!(broker.depth(DEAD_LETTER_QUEUE), 1);
}

#[tokio::test]
async fn messages_are_processed_independently() {
    let broker = provisioned().await;
    publish(&broker, "Pedido creado: ID 1").await;
    publish(&broker, "Pedido creado: ID 2").await;

    drain(&broker, Flaky::new(None)).await;

    let mut payloads: Vec<String> = broker
        .ready(DEAD_LETTER_QUEUE)
        .into_iter()
        .map(|m| String::from_utf8(m.payload).unwrap())
        .collect();
    payloads.sort();

    assert_eq!(payloads, vec!["Pedido creado: ID 1", "Pedido creado: ID 2"]);
}

#[tokio::test]
async fn dispatcher_settles_each_ready_delivery_with_prefetch_one() {
    let broker = provisioned().await;
    publish(&broker, "Pedido creado: ID 1").await;
    publish(&broker, "Pedido creado: ID 2").await;

    let consumer = RetryConsumer::new(broker.clone(), Arc::new(PaymentHandler::new(true)));
    Dispatcher::new(broker.clone(), consumer, "pedidos")
        .consume_blocking()
        .await
        .expect("consume ready deliveries");

    assert_eq!(broker.prefetch(), Some(1));
    assert_eq!(broker.depth(MAIN_QUEUE), 0);
    assert_eq!(broker.depth(RETRY_QUEUE), 2);
    assert_eq!(broker.unacked(), 0);
}
