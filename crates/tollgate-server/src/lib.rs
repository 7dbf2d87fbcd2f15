//! Router assembly and background jobs for the gateway

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod auth;
mod health;
mod invalidate;
mod jobs;
mod request_meta;
pub mod scheduler;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware::Next;
use tollgate_audio::AudioPipeline;
use tollgate_auth::{KeyVerifier, VerifierOptions};
use tollgate_billing::{CallRecorder, PricingCatalog, SettlementEngine};
use tollgate_cache::{Cache, LocalCache, RedisCache};
use tollgate_config::{Config, DEFAULT_LOCAL_CAPACITY};
use tollgate_core::{LogNotifier, Notifier, WebhookNotifier};
use tollgate_llm::ChatPipeline;
use tollgate_store::{MemoryStore, PgStore, Store, StoreHandles};
use tollgate_upstream::{Dispatcher, ForwardOptions, UpstreamClient, UpstreamRegistry};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub use jobs::{BackgroundJobs, JobPeriods, SettlementPeriods, StaleRecovery};

const DEFAULT_LISTEN_ADDRESS: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 8080);

/// Assembled server with all routes, middleware and background jobs
pub struct Server {
    router: Router,
    listen_address: SocketAddr,
    jobs: BackgroundJobs,
}

/// Builds a [`Server`], optionally with injected backends
///
/// Backends not supplied are derived from the configuration: PostgreSQL when
/// `[database]` is set, otherwise the in-memory store; Redis when `[cache]`
/// is set, otherwise an in-process cache; the webhook notifier when
/// `[notify]` is set, otherwise log-only alerts.
pub struct ServerBuilder {
    config: Config,
    store: Option<StoreHandles>,
    cache: Option<Arc<dyn Cache>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl ServerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            cache: None,
            notifier: None,
        }
    }

    #[must_use]
    pub fn with_store<S: Store + 'static>(mut self, store: Arc<S>) -> Self {
        self.store = Some(StoreHandles::new(store));
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Connect backends, load the initial tables and assemble the router
    ///
    /// # Errors
    ///
    /// Returns an error if a backend cannot be reached or the initial
    /// upstream and pricing tables cannot be loaded
    #[allow(clippy::too_many_lines)]
    pub async fn build(self) -> anyhow::Result<Server> {
        let Self {
            config,
            store,
            cache,
            notifier,
        } = self;

        let listen_address = config.server.listen_address.unwrap_or(DEFAULT_LISTEN_ADDRESS);

        let store = match store {
            Some(store) => store,
            None => connect_store(&config).await?,
        };
        let cache = match cache {
            Some(cache) => cache,
            None => build_cache(&config)?,
        };
        let notifier = match notifier {
            Some(notifier) => notifier,
            None => build_notifier(&config)?,
        };

        // Initial tables; the gateway cannot route or price without them
        let registry = Arc::new(UpstreamRegistry::new());
        let endpoints = registry
            .reload(store.catalog.as_ref())
            .await
            .context("failed to load upstream endpoints")?;
        let catalog = Arc::new(PricingCatalog::new());
        let models = catalog
            .reload(store.catalog.as_ref())
            .await
            .context("failed to load pricing")?;
        tracing::info!(endpoints, models, "initial tables loaded");

        let verifier = Arc::new(KeyVerifier::new(
            VerifierOptions {
                key_prefix: config.auth.key_prefix.clone(),
                cache_ttl: config.auth.key_cache_ttl(),
                filter_min_capacity: config.auth.filter_min_capacity,
                rebuild_attempts: config.auth.filter_rebuild_attempts,
            },
            store.keys.clone(),
            cache,
            notifier.clone(),
        ));
        if let Err(e) = verifier.rebuild_filter().await {
            tracing::warn!(error = %e, "starting without an api key filter");
        }

        let upstream = &config.upstream;
        let client = UpstreamClient::new(upstream.connect_timeout()).context("failed to build upstream client")?;
        let dispatcher = Dispatcher::new(registry.clone(), upstream.max_attempts);
        let recorder = CallRecorder::new(store.calls.clone());
        let options = ForwardOptions {
            request_timeout: upstream.request_timeout(),
            stream_timeout: upstream.stream_timeout(),
            charge_on_upstream_error: config.billing.charge_on_upstream_error,
        };

        let chat = Arc::new(ChatPipeline::new(
            dispatcher.clone(),
            client.clone(),
            catalog.clone(),
            recorder.clone(),
            options,
        ));
        let audio = Arc::new(AudioPipeline::new(
            dispatcher,
            client,
            catalog.clone(),
            recorder.clone(),
            options,
        ));

        let settlement = Arc::new(SettlementEngine::new(
            store.ledger.clone(),
            notifier,
            config.settlement.batch_size,
            config.settlement.debounce(),
        ));

        // Proxied routes sit behind key verification
        let public_paths: Arc<[String]> = config.auth.public_paths.clone().into();
        let auth_verifier = verifier.clone();
        let api = Router::new()
            .merge(tollgate_llm::chat_router(chat))
            .merge(tollgate_audio::audio_router(audio))
            .layer(DefaultBodyLimit::max(config.server.max_body_bytes))
            .layer(axum::middleware::from_fn(move |req: Request, next: Next| {
                let verifier = auth_verifier.clone();
                let public_paths = public_paths.clone();
                async move { auth::auth_middleware(verifier, public_paths, req, next).await }
            }));

        let mut app = Router::new().merge(api);

        if config.server.health.enabled {
            app = app.route(&config.server.health.path, axum::routing::get(health::health_handler));
        }

        if let Some(internal_secret) = config.server.internal_secret.clone() {
            let state = invalidate::InvalidateState {
                verifier: verifier.clone(),
                internal_secret,
            };
            app = app.route(
                "/internal/invalidate-key",
                axum::routing::post(invalidate::invalidate_key_handler).with_state(state),
            );
        }

        // Request metadata is captured before auth so rejections echo the trace id
        app = app
            .layer(axum::middleware::from_fn(request_meta::request_meta_middleware))
            .layer(TraceLayer::new_for_http());

        let periods = JobPeriods {
            upstream_reload: upstream.refresh_interval(),
            pricing_reload: config.billing.pricing_refresh_interval(),
            filter_rebuild: config.auth.filter_rebuild_interval(),
            settlement: config.settlement.enabled.then(|| SettlementPeriods {
                batch: config.settlement.interval(),
                failed_reset: config.settlement.failed_reset_interval(),
            }),
            stale_recovery: StaleRecovery {
                period: config.settlement.stale_check_interval(),
                stale_after: config.settlement.stale_after(),
            },
        };

        Ok(Server {
            router: app,
            listen_address,
            jobs: BackgroundJobs {
                registry,
                catalog,
                catalog_store: store.catalog,
                verifier,
                settlement,
                recorder,
                periods,
            },
        })
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("store", &self.store.is_some())
            .field("cache", &self.cache.is_some())
            .field("notifier", &self.notifier.is_some())
            .finish_non_exhaustive()
    }
}

async fn connect_store(config: &Config) -> anyhow::Result<StoreHandles> {
    let Some(database) = &config.database else {
        tracing::warn!("no [database] configured, using the in-memory store");
        return Ok(StoreHandles::new(Arc::new(MemoryStore::new())));
    };

    let store = PgStore::connect(&database.url, database.max_connections)
        .await
        .context("failed to connect to the database")?;
    if database.run_migrations {
        store.run_migrations().await.context("failed to run migrations")?;
    }
    Ok(StoreHandles::new(Arc::new(store)))
}

fn build_cache(config: &Config) -> anyhow::Result<Arc<dyn Cache>> {
    match &config.cache {
        Some(cache) => {
            let redis = RedisCache::new(cache.url.as_str(), cache.key_prefix.clone())
                .context("failed to configure the shared cache")?;
            Ok(Arc::new(redis))
        }
        None => Ok(Arc::new(LocalCache::new(DEFAULT_LOCAL_CAPACITY))),
    }
}

fn build_notifier(config: &Config) -> anyhow::Result<Arc<dyn Notifier>> {
    match &config.notify {
        Some(notify) => {
            let webhook = WebhookNotifier::new(notify.webhook_url.clone(), Duration::from_secs(notify.timeout_seconds))
                .context("failed to build the alert webhook client")?;
            Ok(Arc::new(webhook))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}

impl Server {
    /// Build the server from configuration alone
    ///
    /// # Errors
    ///
    /// See [`ServerBuilder::build`]
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        ServerBuilder::new(config).build().await
    }

    pub const fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    /// Background jobs, for callers that drive the router themselves
    pub const fn jobs(&self) -> &BackgroundJobs {
        &self.jobs
    }

    pub fn settlement(&self) -> Arc<SettlementEngine> {
        self.jobs.settlement.clone()
    }

    pub fn verifier(&self) -> Arc<KeyVerifier> {
        self.jobs.verifier.clone()
    }

    /// Consume the server and return the inner router
    ///
    /// Useful for testing when the caller manages the listener
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Start the background jobs and serve requests
    ///
    /// Blocks until the cancellation token is triggered and every job has
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if binding the TCP listener or serving fails
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_address).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "server listening");

        let scheduler = self.jobs.start(shutdown.clone());

        let result = axum::serve(
            listener,
            self.router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("graceful shutdown initiated");
        })
        .await;

        scheduler.join().await;
        result?;
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listen_address", &self.listen_address)
            .finish_non_exhaustive()
    }
}
