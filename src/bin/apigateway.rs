use anyhow::Result;
use apigateway::cli::{start, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let action = start()?;

    let result = action.execute().await;

    telemetry::shutdown_tracer();

    result
}
