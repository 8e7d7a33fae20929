//! The offline cache controller.

use std::sync::Arc;

use ekam_common::with_timeout;
use ekam_net::{Fetcher, NetError, Request, Response};
use futures::future::try_join_all;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, debug_span, info, trace, warn, Instrument};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::Clients;
use crate::config::ControllerConfig;
use crate::registration::{ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState};
use crate::strategy::{FetchOutcome, PassthroughReason, ServedResponse, Source, Strategy};
use crate::{ServiceWorkerError, ServiceWorkerEvent};

/// Intercepts requests for one scope and serves them from the network or
/// the current cache generation.
///
/// Cloning is cheap and every clone shares storage, registration and clients.
#[derive(Clone)]
pub struct OfflineController {
    config: Arc<ControllerConfig>,
    scope: Url,
    fetcher: Arc<dyn Fetcher>,
    caches: Arc<RwLock<CacheStorage>>,
    registration: Arc<RwLock<ServiceWorkerRegistration>>,
    clients: Arc<RwLock<Clients>>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl OfflineController {
    /// Create a controller with empty cache storage.
    pub fn new(
        config: ControllerConfig,
        scope: Url,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>), ServiceWorkerError> {
        Self::with_storage(
            config,
            scope,
            fetcher,
            Arc::new(RwLock::new(CacheStorage::new())),
        )
    }

    /// Create a controller over existing cache storage.
    ///
    /// Controllers for successive versions share storage this way.
    pub fn with_storage(
        config: ControllerConfig,
        scope: Url,
        fetcher: Arc<dyn Fetcher>,
        caches: Arc<RwLock<CacheStorage>>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>), ServiceWorkerError> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let controller = Self {
            config: Arc::new(config),
            registration: Arc::new(RwLock::new(ServiceWorkerRegistration::new(scope.clone()))),
            scope,
            fetcher,
            caches,
            clients: Arc::new(RwLock::new(Clients::new())),
            event_tx,
        };

        Ok((controller, event_rx))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Shared cache storage.
    pub fn caches(&self) -> Arc<RwLock<CacheStorage>> {
        Arc::clone(&self.caches)
    }

    /// Shared clients.
    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.clients)
    }

    /// State of the active worker, if any.
    pub async fn active_state(&self) -> Option<ServiceWorkerState> {
        self.registration
            .read()
            .await
            .active()
            .map(|worker| worker.state)
    }

    /// Resolve a manifest path against the scope.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        self.scope
            .join(path)
            .map_err(|e| ServiceWorkerError::Config(format!("cannot resolve {path}: {e}")))
    }

    // ==================== Lifecycle ====================

    /// Precache the manifest into this version's generation.
    ///
    /// Either every entry is stored or nothing is. On failure the installing
    /// worker becomes redundant and any active worker keeps running.
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        let cache_name = self.config.cache_name.clone();
        let worker_id = self.registration.write().await.update(&cache_name);
        self.emit_state(worker_id, ServiceWorkerState::Installing);

        info!(
            cache = %cache_name,
            assets = self.config.precache.len(),
            "Install: caching app shell"
        );

        let entries = match self.precache_all().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(cache = %cache_name, error = %e, "Install failed, keeping previous version");
                self.registration.write().await.install_failed(&e.to_string());
                self.emit_state(worker_id, ServiceWorkerState::Redundant);
                return Err(e);
            }
        };

        {
            let mut caches = self.caches.write().await;
            let cache = caches.open(&cache_name);
            for (request, response) in &entries {
                cache.put(request, response);
            }
            debug!(cache = %cache_name, entries = cache.len(), "App shell cached");
        }

        self.registration.write().await.install_complete(true);
        self.emit_state(worker_id, ServiceWorkerState::Installed);
        self.emit(ServiceWorkerEvent::SkipWaiting { worker_id });

        Ok(())
    }

    async fn precache_all(&self) -> Result<Vec<(Request, Response)>, ServiceWorkerError> {
        let requests = self
            .config
            .precache
            .iter()
            .map(|path| self.resolve(path).map(Request::get))
            .collect::<Result<Vec<_>, _>>()?;

        let fetches = requests.into_iter().map(|request| async move {
            let response = self.fetch_network(&request).await.map_err(|e| {
                ServiceWorkerError::InstallFailed {
                    url: request.url.to_string(),
                    reason: format!("{} ({})", e, e.kind()),
                }
            })?;

            if !response.is_cacheable() {
                return Err(ServiceWorkerError::InstallFailed {
                    url: request.url.to_string(),
                    reason: format!(
                        "status {} with {} response",
                        response.status,
                        response.response_type.as_str()
                    ),
                });
            }

            Ok::<_, ServiceWorkerError>((request, response))
        });

        try_join_all(fetches).await
    }

    /// Take over: delete every other generation, then claim open pages.
    pub async fn activate(&self) -> Result<(), ServiceWorkerError> {
        let worker_id = {
            let mut registration = self.registration.write().await;
            let controlled = self.clients.read().await.controlled_count();
            if !registration.can_activate(controlled) {
                return Err(ServiceWorkerError::State(
                    "no installed worker ready to activate".to_string(),
                ));
            }
            registration
                .begin_activation()
                .ok_or_else(|| ServiceWorkerError::State("waiting slot is empty".to_string()))?
        };
        self.emit_state(worker_id, ServiceWorkerState::Activating);

        info!(cache = %self.config.cache_name, "Activate");
        self.delete_stale_caches().await;

        self.registration.write().await.finish_activation();
        self.emit_state(worker_id, ServiceWorkerState::Activated);

        self.claim_clients(worker_id).await;
        Ok(())
    }

    /// Install then activate.
    pub async fn start(&self) -> Result<(), ServiceWorkerError> {
        self.install().await?;
        self.activate().await
    }

    /// Resume a version whose generation is already in storage.
    ///
    /// Used when storage was loaded from a snapshot.
    pub async fn restore(&self) -> Result<(), ServiceWorkerError> {
        if !self.caches.read().await.has(&self.config.cache_name) {
            return Err(ServiceWorkerError::NotFound(format!(
                "cache generation {}",
                self.config.cache_name
            )));
        }

        let worker_id = self
            .registration
            .write()
            .await
            .restore_active(&self.config.cache_name);
        self.emit_state(worker_id, ServiceWorkerState::Activated);
        debug!(cache = %self.config.cache_name, "Restored active controller");

        self.claim_clients(worker_id).await;
        Ok(())
    }

    /// Delete every generation except the current one.
    ///
    /// Returns the names removed. Each deletion stands alone.
    pub async fn delete_stale_caches(&self) -> Vec<String> {
        let mut caches = self.caches.write().await;
        let mut removed = Vec::new();

        for name in caches.keys() {
            if name == self.config.cache_name {
                continue;
            }
            if caches.delete(&name) {
                info!(cache = %name, "Removing old cache");
                self.emit(ServiceWorkerEvent::CacheDeleted {
                    cache_name: name.clone(),
                });
                removed.push(name);
            } else {
                warn!(cache = %name, "Old cache vanished before it could be removed");
            }
        }

        removed
    }

    async fn claim_clients(&self, worker_id: ServiceWorkerId) {
        let changed = self.clients.write().await.claim(worker_id, &self.scope);
        info!(clients = changed.len(), "Claiming clients");
        for client_id in changed {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id,
            });
        }
    }

    /// Drop every worker slot and release controlled pages. Storage is kept.
    pub async fn unregister(&self) {
        let mut registration = self.registration.write().await;
        if let Some(id) = registration.active().map(|w| w.id) {
            self.clients.write().await.release(id);
        }
        registration.unregister();
        info!(scope = %self.scope, "Unregistered");
    }

    // ==================== Fetch ====================

    /// Intercept one request.
    ///
    /// Passthrough requests are never read from or written to the cache.
    pub async fn handle_fetch(&self, request: &Request) -> Result<FetchOutcome, ServiceWorkerError> {
        let span = debug_span!("fetch", id = request.id.raw(), method = %request.method, url = %request.url);
        self.route(request).instrument(span).await
    }

    async fn route(&self, request: &Request) -> Result<FetchOutcome, ServiceWorkerError> {
        let strategy = Strategy::for_request(request, &self.config);

        if let Strategy::Passthrough(reason) = strategy {
            trace!(url = %request.url, method = %request.method, ?reason, "Not intercepted");
            return Ok(FetchOutcome::Passthrough(reason));
        }

        if !self.is_controlling().await {
            trace!(url = %request.url, "No active controller");
            return Ok(FetchOutcome::Passthrough(PassthroughReason::NotControlling));
        }

        let served = if strategy == Strategy::NetworkFirst {
            self.network_first(request).await?
        } else {
            self.cache_first(request).await?
        };

        Ok(FetchOutcome::Respond(served))
    }

    async fn is_controlling(&self) -> bool {
        self.registration
            .read()
            .await
            .active()
            .is_some_and(|w| w.is_active() && w.cache_name == self.config.cache_name)
    }

    async fn network_first(&self, request: &Request) -> Result<ServedResponse, ServiceWorkerError> {
        match self.fetch_network(request).await {
            Ok(response) => {
                self.store(request, &response).await;
                Ok(served(response, Source::Network))
            }
            Err(e) => {
                warn!(url = %request.url, kind = %e.kind(), error = %e, "Navigation failed, trying cache");

                if let Some(cached) = self.lookup(request).await? {
                    return Ok(served(cached, Source::Cache));
                }
                if let Some(offline) = self.offline_fallback().await? {
                    return Ok(served(offline, Source::OfflineFallback));
                }
                Err(network_error(request, &e))
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> Result<ServedResponse, ServiceWorkerError> {
        if let Some(cached) = self.lookup(request).await? {
            debug!(url = %request.url, "Returning cached response");
            return Ok(served(cached, Source::Cache));
        }

        match self.fetch_network(request).await {
            Ok(response) => {
                self.store(request, &response).await;
                Ok(served(response, Source::Network))
            }
            Err(e) => {
                if request.accepts_html() {
                    if let Some(offline) = self.offline_fallback().await? {
                        warn!(url = %request.url, kind = %e.kind(), "Fetch failed; returning offline page");
                        return Ok(served(offline, Source::OfflineFallback));
                    }
                }
                warn!(url = %request.url, kind = %e.kind(), error = %e, "Fetch failed");
                Err(network_error(request, &e))
            }
        }
    }

    /// Network fetch raced against the configured deadline.
    async fn fetch_network(&self, request: &Request) -> Result<Response, NetError> {
        let timeout = self.config.network_timeout();
        with_timeout(timeout, self.fetcher.fetch(request))
            .await
            .unwrap_or(Err(NetError::Timeout(timeout)))
    }

    async fn store(&self, request: &Request, response: &Response) {
        if !response.is_cacheable() {
            trace!(
                url = %request.url,
                status = %response.status,
                response_type = response.response_type.as_str(),
                "Not caching"
            );
            return;
        }

        self.caches
            .write()
            .await
            .open(&self.config.cache_name)
            .put(request, response);

        debug!(url = %request.url, "Caching new response");
        self.emit(ServiceWorkerEvent::ResponseCached {
            cache_name: self.config.cache_name.clone(),
            url: request.url.to_string(),
        });
    }

    async fn lookup(&self, request: &Request) -> Result<Option<Response>, ServiceWorkerError> {
        let caches = self.caches.read().await;
        caches
            .get(&self.config.cache_name)
            .and_then(|cache| cache.match_request(request))
            .map(|entry| entry.to_response())
            .transpose()
    }

    async fn offline_fallback(&self) -> Result<Option<Response>, ServiceWorkerError> {
        let url = self.resolve(&self.config.offline_url)?;
        let caches = self.caches.read().await;
        caches
            .get(&self.config.cache_name)
            .and_then(|cache| cache.match_url(&url))
            .map(|entry| entry.to_response())
            .transpose()
    }

    // ==================== Events ====================

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            cache_name: self.config.cache_name.clone(),
            new_state,
        });
    }
}

fn served(response: Response, source: Source) -> ServedResponse {
    ServedResponse { response, source }
}

fn network_error(request: &Request, error: &NetError) -> ServiceWorkerError {
    ServiceWorkerError::Network {
        url: request.url.to_string(),
        kind: error.kind(),
        message: error.to_string(),
    }
}
