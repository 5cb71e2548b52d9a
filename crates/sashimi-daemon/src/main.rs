use anyhow::Result;

use sashimi_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("sashimi-daemon")?;
    sashimi_daemon::server::run().await
}
