//! Sensor client: scan for the sample service, subscribe, print every report.
//!
//! Run with: cargo run --release
//!
//! Logging follows `RUST_LOG` (default `ble_sample_monitor=info`).

use ble_sample_monitor::{ClientConfig, Result, SampleClient};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ble_sample_monitor=info")),
        )
        .init();

    info!("Starting BLE sample client");

    let client = Arc::new(SampleClient::new(ClientConfig::default()).await?);

    let _reports = client.processor().on_report(|report| {
        println!("{}", report);
    });

    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ble_sample_monitor::Error::Internal(e.to_string()))?;
    println!("\nInterrupted!");

    client.shutdown().await?;

    match runner.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Client stopped with error: {}", e),
        Err(e) => error!("Client task failed: {}", e),
    }

    let extrema = client.processor().extrema();
    if let Some((min, max)) = extrema.bounds() {
        println!(
            "{} samples | Max Value: {:.2} | Min Value: {:.2}",
            extrema.count, max, min
        );
    }

    Ok(())
}
