use anyhow::Result;
use stream_relay::config::{LoggingSettings, Settings};
use stream_relay::Application;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingSettings) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("full") {
        builder.init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;
    init_tracing(&settings.logging);

    info!(
        address = %settings.listen_address(),
        helper = %settings.helper.binary,
        "Starting Stream Relay"
    );

    let app = Application::from_settings(settings)?;
    app.run().await?;

    Ok(())
}
