//! Relay service wiring
//!
//! `RelayService` owns every piece of shared state: caches, credential
//! suspension, the circuit breaker, admission gate and rate limiter. Each
//! instance is isolated, so tests build as many as they like.
//!
//! ```rust,ignore
//! use stream_relay::config::Settings;
//! use stream_relay::proxy::RelayService;
//!
//! let settings = Settings::new()?;
//! let service = RelayService::from_settings(&settings)?;
//! let router = service.into_router();
//! let listener = tokio::net::TcpListener::bind(settings.listen_address()).await?;
//! axum::serve(listener, router).await?;
//! ```

use crate::admission::{AdmissionGate, CircuitBreaker, RateLimiter};
use crate::config::Settings;
use crate::error::Result;
use crate::proxy::destination::{DestinationPolicy, DestinationValidator};
use crate::proxy::engine::{EngineConfig, ProxyEngine};
use crate::proxy::handlers;
use crate::proxy::headers::paths;
use crate::proxy::middleware::AuthConfig;
use crate::proxy::middleware_stack::ProxyMiddlewareStack;
use crate::resolver::{
    CredentialState, CredentialedHelper, ExtractorConfig, MediaHelper, ProcessHelper,
    SearchConfig, SearchResolver, StreamExtractor,
};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::debug;

/// State shared by every handler
pub struct RelayState {
    pub search: SearchResolver,
    pub extractor: StreamExtractor,
    pub engine: Arc<ProxyEngine>,
    pub credentials: Arc<CredentialState>,
    /// Origin for proxy URLs handed out by `/stream`
    pub public_base_url: Option<String>,
}

/// Counts of idle entries dropped by one maintenance pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub rate_limit_buckets: usize,
    pub admission_entries: usize,
    pub cache_entries: usize,
}

#[derive(Clone)]
pub struct RelayService {
    state: Arc<RelayState>,
    rate_limiter: Arc<RateLimiter>,
    auth: AuthConfig,
    max_body_bytes: usize,
}

impl RelayService {
    /// Build the service around the configured `yt-dlp` binary
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let helper = ProcessHelper::yt_dlp(
            settings.helper.binary.clone(),
            settings.helper.proxy.as_deref(),
        );
        Self::with_helper(settings, Arc::new(helper))
    }

    /// Build the service around any media helper
    pub fn with_helper(settings: &Settings, helper: Arc<dyn MediaHelper>) -> Result<Self> {
        let policy = DestinationPolicy::from_settings(&settings.destination)?;
        Self::with_components(settings, helper, DestinationValidator::new(policy))
    }

    pub fn with_components(
        settings: &Settings,
        helper: Arc<dyn MediaHelper>,
        validator: DestinationValidator,
    ) -> Result<Self> {
        let credentials = Arc::new(CredentialState::new(
            settings.helper.cookies_path.clone(),
            Duration::from_secs(settings.helper.credential_suspend_secs),
        ));
        let credentialed = CredentialedHelper::new(helper, Arc::clone(&credentials));

        let search = SearchResolver::new(
            credentialed.clone(),
            SearchConfig::from_settings(&settings.helper, &settings.cache),
        );
        let extractor = StreamExtractor::new(
            credentialed,
            ExtractorConfig::from_settings(&settings.helper, &settings.cache),
        );

        let engine = ProxyEngine::new(
            validator,
            Arc::new(CircuitBreaker::from_settings(&settings.circuit_breaker)),
            AdmissionGate::from_settings(&settings.admission),
            EngineConfig::from_settings(&settings.proxy),
        )?;

        let public_base_url = settings
            .application
            .public_base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);

        Ok(Self {
            state: Arc::new(RelayState {
                search,
                extractor,
                engine: Arc::new(engine),
                credentials,
                public_base_url,
            }),
            rate_limiter: Arc::new(RateLimiter::from_settings(&settings.rate_limit)),
            auth: AuthConfig::from_keys(settings.auth.api_keys.iter().cloned()),
            max_body_bytes: settings.application.max_body_bytes,
        })
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Drop idle rate-limit buckets, admission entries and expired cache entries
    pub fn prune(&self) -> PruneReport {
        let report = PruneReport {
            rate_limit_buckets: self.rate_limiter.prune(),
            admission_entries: self.state.engine.gate().prune(),
            cache_entries: self.state.search.purge_expired() + self.state.extractor.purge_expired(),
        };
        debug!(?report, "Maintenance pass complete");
        report
    }

    /// Create the Axum router with the full middleware stack
    pub fn into_router(self) -> Router {
        let router = Router::new()
            .route(paths::HEALTH, get(handlers::health))
            .route(paths::SEARCH, post(handlers::search))
            .route(paths::STREAM, post(handlers::stream))
            .route(
                paths::PROXY_STREAM,
                get(handlers::proxy_stream).head(handlers::proxy_stream),
            )
            .route(paths::CACHE_STATS, get(handlers::cache_stats))
            .route(paths::CACHE_CLEAR, post(handlers::cache_clear))
            .layer(RequestBodyLimitLayer::new(self.max_body_bytes))
            .with_state(self.state);

        ProxyMiddlewareStack::new(self.auth, self.rate_limiter).apply_to_router(router)
    }
}
