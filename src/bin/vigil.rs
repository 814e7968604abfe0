use anyhow::Result;
use vigil::cli::{self, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let action = cli::start()?;

    // Any failed case surfaces as an error, so the process exits 1.
    let result = action.execute().await;

    telemetry::shutdown_tracer();

    result
}
