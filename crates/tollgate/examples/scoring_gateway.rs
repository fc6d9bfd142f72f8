// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Puts a gateway in front of a flaky, quota-limited scoring API.
//!
//! The simulated API fails every third call. The example shows:
//!
//! 1. Repeated requests being served from the cache
//! 2. Transient failures being retried with backoff
//! 3. Callers waiting for the rate limiter once the burst is spent
//!
//! Run with `cargo run --example scoring_gateway --features logs` to see the gateway events.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use layered::Execute;
use ohno::AppError;
use serde::Serialize;
use tick::Clock;
use tollgate::{Gateway, GatewayConfig, GatewayOptions};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Serialize)]
struct Startup {
    name: &'static str,
    sector: &'static str,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::registry().with(tracing_subscriber::fmt::layer()).init();

    let config = GatewayConfig {
        rate_limit_calls: 3,
        rate_limit_period_seconds: 3.0,
        retry_base_delay: 0.2,
        ..GatewayConfig::default()
    };

    let clock = Clock::new_tokio();
    let options = GatewayOptions::<ScoringError>::new(&clock).name("scoring").use_logs();
    let calls = Arc::new(AtomicU32::new(0));
    let api = Execute::new(move |startup: Startup| score(startup, Arc::clone(&calls)));
    let gateway = Gateway::new(&config, options, api)?;

    let startups = [
        Startup { name: "acme", sector: "robotics" },
        Startup { name: "globex", sector: "energy" },
        Startup { name: "acme", sector: "robotics" },
        Startup { name: "initech", sector: "software" },
        Startup { name: "hooli", sector: "search" },
        Startup { name: "globex", sector: "energy" },
    ];

    for startup in startups {
        let name = startup.name;
        match gateway.invoke(startup).await {
            Ok(score) => println!("{name}: {score:.2}"),
            Err(e) => println!("{name}: {e}"),
        }
    }

    println!("{}", serde_json::to_string_pretty(&gateway.stats())?);

    Ok(())
}

async fn score(startup: Startup, calls: Arc<AtomicU32>) -> Result<f64, ScoringError> {
    if calls.fetch_add(1, Ordering::SeqCst) % 3 == 2 {
        return Err(ScoringError);
    }

    #[expect(clippy::cast_precision_loss, reason = "names are short")]
    let score = (startup.name.len() + startup.sector.len()) as f64 / 20.0;
    Ok(score.min(1.0))
}

#[derive(Debug)]
struct ScoringError;

impl std::fmt::Display for ScoringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("scoring service temporarily unavailable")
    }
}

impl std::error::Error for ScoringError {}
