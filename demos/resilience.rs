use std::time::Duration;

use admin_http::{
    BaseClient, CircuitBreakerConfig, ClientConfig, ProgressKind, RetryPolicy, TracingMiddleware,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("admin_http=debug")),
        )
        .init();

    let base_url = std::env::var("ADMIN_API_URL")?;

    let client = BaseClient::new(
        ClientConfig::new(base_url)
            .with_timeout(Duration::from_secs(5))
            .with_retry(
                RetryPolicy::default()
                    .with_max_attempts(4)
                    .with_delays(Duration::from_millis(200), Duration::from_secs(2)),
            )
            .with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_failure_threshold(3)
                    .with_recovery_timeout(Duration::from_secs(10)),
            )
            .with_middleware(TracingMiddleware)
            .with_debug(true),
    )?;

    client.progress().subscribe(ProgressKind::Download, |event| {
        if let Some(fraction) = event.fraction() {
            println!("{}: {:.0}%", event.request_id, fraction * 100.0);
        }
    });

    for round in 1..=5 {
        match client.get("/system/environment").await {
            Ok(response) => println!(
                "round {round}: {} after {} attempt(s)",
                response.status.code, response.meta.timing.attempts
            ),
            Err(err) => println!("round {round}: {} ({})", err.message(), err.code()),
        }
    }

    let health = client.health().await;
    println!("{health:#?}");
    println!("{:#?}", client.diagnostics());

    client.dispose();
    Ok(())
}
