use gateway::GatewayConfig;

use common_sync::telemetry;

#[tokio::main]
async fn main() {
    telemetry::init("gateway");

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "gateway: invalid configuration");
            return;
        }
    };

    if let Err(err) = gateway::run_with_ctrl_c(config).await {
        tracing::error!(%err, "gateway exited with error");
    }
}
