use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use pacer::{
    config::{ConcurrencyConfig, EngineConfig, TestConfig, ThroughputConfig},
    LogListener, Probe, ProbeError, ProbeValue, Scenario,
};
use tracing_subscriber::EnvFilter;

#[pacer::macros::outcome]
struct Checkout {
    order: u64,
    items: u8,
}

/// Pretends to be a checkout endpoint that gets slower, and then flaky, under load.
#[derive(Default)]
struct CheckoutProbe {
    orders: AtomicU64,
}

#[async_trait]
impl Probe for CheckoutProbe {
    async fn setup(&self) -> Result<(), ProbeError> {
        tracing::info!("Seeding the catalogue...");
        Ok(())
    }

    async fn execute(&self) -> Result<ProbeValue, ProbeError> {
        let order = self.orders.fetch_add(1, Ordering::Relaxed);
        let latency = Duration::from_millis(20 + order % 40);
        tokio::time::sleep(latency).await;

        if order % 97 == 0 {
            return Err(format!("order {order}: payment gateway timed out").into());
        }
        Ok(Checkout {
            order,
            items: (order % 5) as u8 + 1,
        }
        .into())
    }

    async fn teardown(&self) -> Result<(), ProbeError> {
        tracing::info!("Placed {} orders", self.orders.load(Ordering::Relaxed));
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Ramp up to 50 checkouts per second, hold, and come back down.
    // Bail out early if a whole 3s window is worse than 60ms on average.
    let config = TestConfig::builder()
        .concurrency(ConcurrencyConfig::builder().threads(10).build())
        .throughput(
            ThroughputConfig::builder()
                .tps(50.0)
                .ramp_up(Duration::from_secs(5))
                .hold_for(Duration::from_secs(20))
                .ramp_down(Duration::from_secs(5))
                .build(),
        )
        .engine(
            EngineConfig::builder()
                .aggregation_interval(Duration::from_secs(1))
                .build(),
        )
        .exit_conditions(vec!["failed if PeriodAverage > 60 for 3s"
            .parse()
            .expect("valid exit condition")])
        .build();

    let report = Scenario::builder()
        .name("checkout")
        .probe(Arc::new(CheckoutProbe::default()))
        .config(config)
        .aggregate_listeners(vec![Arc::new(LogListener)])
        .build()
        .run()
        .await
        .expect("scenario failed to run");

    println!("{report}");
    std::process::exit(report.outcome.exit_code());
}
