use pulse_endpoint::config::EndpointConfig;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    pulse_endpoint::init_tracing()?;

    let config = EndpointConfig::from_env()?;
    pulse_endpoint::run(config).await
}
