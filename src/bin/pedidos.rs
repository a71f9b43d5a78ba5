// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! CLI for the order/payment flow
//!
//! Subcommands:
//! - `provision`: declare exchanges, queues and bindings, then exit
//! - `publish`: publish one `pedido.creado` event
//! - `consume`: run the payment consumer until Ctrl+C

use clap::{Parser, Subcommand};
use opentelemetry::Context;
use pedidos_rabbitmq::{
    channel::{new_amqp_channel, BrokerChannel},
    config::AppConfig,
    consumer::RetryConsumer,
    dispatcher::Dispatcher,
    errors::AmqpError,
    handler::PaymentHandler,
    logging,
    publisher::{PedidoPublisher, Publisher, PublishMessage},
    topology::{PedidosTopology, MAIN_ROUTING_KEY},
};
use std::{process::ExitCode, sync::Arc};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pedidos")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Declare the topology and exit
    Provision,
    /// Publish one event to the main exchange
    Publish {
        #[arg(long, default_value = "Pedido creado: ID 123")]
        payload: String,
        #[arg(long, default_value = MAIN_ROUTING_KEY)]
        routing_key: String,
    },
    /// Consume the payment queue with retry and dead-lettering
    Consume,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&cfg.app);

    let result = match cli.command {
        Command::Provision => provision(&cfg).await,
        Command::Publish {
            payload,
            routing_key,
        } => publish(&cfg, &payload, &routing_key).await,
        Command::Consume => consume(&cfg).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = err.to_string(), "exiting");
            ExitCode::FAILURE
        }
    }
}

async fn provision(cfg: &AppConfig) -> Result<(), AmqpError> {
    let (_conn, channel) = new_amqp_channel(cfg).await?;
    PedidosTopology::new().provision(channel).await
}

async fn publish(cfg: &AppConfig, payload: &str, routing_key: &str) -> Result<(), AmqpError> {
    let (_conn, channel) = new_amqp_channel(cfg).await?;
    let channel: Arc<dyn BrokerChannel> = channel;

    PedidosTopology::new()
        .provision_publisher(channel.clone())
        .await?;

    PedidoPublisher::new(channel)
        .publish(&Context::current(), &PublishMessage::event(routing_key, payload))
        .await
}

async fn consume(cfg: &AppConfig) -> Result<(), AmqpError> {
    let (_conn, channel) = new_amqp_channel(cfg).await?;

    PedidosTopology::new().provision(channel.clone()).await?;

    let handler = Arc::new(PaymentHandler::new(cfg.app.simulate_failure));
    let consumer = RetryConsumer::new(channel.clone(), handler);
    let dispatcher = Dispatcher::new(channel, consumer, &cfg.app.name);

    info!("payment service running (retry + dlq)");

    tokio::select! {
        result = dispatcher.consume_blocking() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}
