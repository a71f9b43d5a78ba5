// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging
//!
//! Installs the process-wide `tracing` subscriber used by the `pedidos`
//! binary. Output is the plain `fmt` layer without targets, filtered by the
//! `app.log_level` setting.

use crate::config::AppSettings;
use tracing::{debug, Level};

/// Installs the global subscriber for `settings.log_level`.
///
/// Unknown levels fall back to `info`. A subscriber that is already installed
/// is kept, so calling this from several tests is harmless.
pub fn init(settings: &AppSettings) {
    let level = max_level(&settings.log_level);

    let installed = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok();

    if installed {
        debug!(app = settings.name.as_str(), %level, "logging initialized");
    }
}

fn max_level(level: &str) -> Level {
    match level.trim().to_ascii_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}
