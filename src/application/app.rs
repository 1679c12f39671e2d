use crate::config::Settings;
use crate::proxy::RelayService;
use crate::Result;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Main application struct that coordinates all components
pub struct Application {
    settings: Settings,
    service: RelayService,
}

impl Application {
    #[instrument]
    pub async fn new() -> Result<Self> {
        let settings = Settings::new()?;
        Self::from_settings(settings)
    }

    pub fn from_settings(settings: Settings) -> Result<Self> {
        let service = RelayService::from_settings(&settings)?;
        Ok(Self { settings, service })
    }

    /// Wrap an already-built service, e.g. one using a substitute media helper
    pub fn with_service(settings: Settings, service: RelayService) -> Self {
        Self { settings, service }
    }

    /// Bind the configured address and serve until Ctrl-C
    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.settings.listen_address()).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let address = listener.local_addr()?;
        info!(
            %address,
            environment = %self.settings.application.environment,
            "Starting stream relay"
        );

        let maintenance = spawn_maintenance(
            self.service.clone(),
            Duration::from_secs(self.settings.application.maintenance_interval_secs.max(1)),
        );

        let router = self.service.into_router();
        let served = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        maintenance.abort();
        info!("Stream relay stopped");
        Ok(served?)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn service(&self) -> &RelayService {
        &self.service
    }
}

/// Periodically drop idle limiter buckets, admission entries and stale cache entries
fn spawn_maintenance(service: RelayService, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            service.prune();
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
