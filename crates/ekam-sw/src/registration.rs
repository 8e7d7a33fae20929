//! Worker versions and the three registration slots.
//!
//! ```text
//! parsed ─► installing ─► installed ─► activating ─► activated
//!    │           │            │             │             │
//!    └───────────┴────────────┴─────────────┴─────────────┴──► redundant
//! ```
//!
//! A restored snapshot jumps straight from `parsed` to `activated`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    #[default]
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl ServiceWorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        }
    }

    fn can_become(self, next: Self) -> bool {
        use ServiceWorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Parsed, Activated)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
        ) || (next == Redundant && self != Redundant)
    }
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One controller version, bound to the cache generation it installs.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,
    pub cache_name: String,
    pub state: ServiceWorkerState,
    /// Take over as soon as installed, without waiting for pages to close.
    pub skip_waiting: bool,
    /// Why install failed, if it did.
    pub failure: Option<String>,
}

impl ServiceWorker {
    pub fn new(cache_name: &str) -> Self {
        Self {
            id: ServiceWorkerId::next(),
            cache_name: cache_name.to_string(),
            state: ServiceWorkerState::Parsed,
            skip_waiting: false,
            failure: None,
        }
    }

    /// Move to `next`. Illegal transitions are logged and ignored.
    pub fn advance(&mut self, next: ServiceWorkerState) -> bool {
        if !self.state.can_become(next) {
            warn!(worker = %self.id, from = %self.state, to = %next, "Ignoring illegal state change");
            return false;
        }
        debug!(worker = %self.id, cache = %self.cache_name, from = %self.state, to = %next, "State change");
        self.state = next;
        true
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }
}

/// Installing, waiting and active slots for one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    scope: Url,
    installing: Option<ServiceWorker>,
    waiting: Option<ServiceWorker>,
    active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn installing(&self) -> Option<&ServiceWorker> {
        self.installing.as_ref()
    }

    pub fn waiting(&self) -> Option<&ServiceWorker> {
        self.waiting.as_ref()
    }

    pub fn active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Start installing a new version. Any half-finished install is dropped.
    pub fn update(&mut self, cache_name: &str) -> ServiceWorkerId {
        let mut worker = ServiceWorker::new(cache_name);
        worker.advance(ServiceWorkerState::Installing);
        let id = worker.id;

        if let Some(mut stale) = self.installing.replace(worker) {
            stale.advance(ServiceWorkerState::Redundant);
        }
        id
    }

    /// Installing → waiting. A previously waiting version is superseded.
    pub fn install_complete(&mut self, skip_waiting: bool) {
        let Some(mut worker) = self.installing.take() else {
            return;
        };
        worker.skip_waiting = skip_waiting;
        worker.advance(ServiceWorkerState::Installed);

        if let Some(mut older) = self.waiting.replace(worker) {
            older.advance(ServiceWorkerState::Redundant);
        }
    }

    /// Installing → redundant. Waiting and active slots are untouched.
    pub fn install_failed(&mut self, reason: &str) {
        if let Some(mut worker) = self.installing.take() {
            worker.failure = Some(reason.to_string());
            worker.advance(ServiceWorkerState::Redundant);
        }
    }

    /// Whether the waiting version may take over while `controlled_clients`
    /// pages are still open.
    pub fn can_activate(&self, controlled_clients: usize) -> bool {
        self.waiting
            .as_ref()
            .is_some_and(|w| w.skip_waiting || controlled_clients == 0)
    }

    /// Waiting → activating in the active slot. The old active version
    /// becomes redundant.
    pub fn begin_activation(&mut self) -> Option<ServiceWorkerId> {
        let mut worker = self.waiting.take()?;
        worker.advance(ServiceWorkerState::Activating);
        let id = worker.id;

        if let Some(mut old) = self.active.replace(worker) {
            old.advance(ServiceWorkerState::Redundant);
        }
        Some(id)
    }

    pub fn finish_activation(&mut self) {
        if let Some(worker) = self.active.as_mut() {
            worker.advance(ServiceWorkerState::Activated);
        }
    }

    /// Put a version whose generation is already populated straight into
    /// the active slot.
    pub fn restore_active(&mut self, cache_name: &str) -> ServiceWorkerId {
        let mut worker = ServiceWorker::new(cache_name);
        worker.advance(ServiceWorkerState::Activated);
        let id = worker.id;

        if let Some(mut old) = self.active.replace(worker) {
            old.advance(ServiceWorkerState::Redundant);
        }
        id
    }

    /// Every slot becomes redundant and empty.
    pub fn unregister(&mut self) {
        for slot in [&mut self.active, &mut self.waiting, &mut self.installing] {
            if let Some(mut worker) = slot.take() {
                worker.advance(ServiceWorkerState::Redundant);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServiceWorkerState::*;

    fn registration() -> ServiceWorkerRegistration {
        ServiceWorkerRegistration::new(Url::parse("https://ekam.example/").unwrap())
    }

    fn activated(cache_name: &str) -> ServiceWorkerRegistration {
        let mut registration = registration();
        registration.update(cache_name);
        registration.install_complete(true);
        registration.begin_activation();
        registration.finish_activation();
        registration
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ServiceWorker::new("ekam-cache-v5");
        let b = ServiceWorker::new("ekam-cache-v5");
        assert_ne!(a.id, b.id);
        assert!(a.id.to_string().starts_with("sw-"));
    }

    #[test]
    fn test_slots_through_lifecycle() {
        let mut registration = registration();

        let id = registration.update("ekam-cache-v5");
        assert_eq!(registration.installing().map(|w| w.state), Some(Installing));

        registration.install_complete(true);
        assert!(registration.installing().is_none());
        assert_eq!(registration.waiting().map(|w| w.state), Some(Installed));

        assert_eq!(registration.begin_activation(), Some(id));
        assert_eq!(registration.active().map(|w| w.state), Some(Activating));

        registration.finish_activation();
        assert!(registration.active().unwrap().is_active());
        assert!(registration.waiting().is_none());
    }

    #[test]
    fn test_illegal_transition_is_ignored() {
        let mut worker = ServiceWorker::new("ekam-cache-v5");
        assert!(!worker.advance(Activating));
        assert_eq!(worker.state, Parsed);

        assert!(worker.advance(Redundant));
        assert!(!worker.advance(Redundant));
        assert!(!worker.advance(Installing));
    }

    #[test]
    fn test_failed_install_keeps_previous_active() {
        let mut registration = activated("ekam-cache-v4");

        registration.update("ekam-cache-v5");
        registration.install_failed("GET /login: 500");

        assert!(registration.installing().is_none());
        assert!(registration.waiting().is_none());
        let active = registration.active().unwrap();
        assert_eq!(active.cache_name, "ekam-cache-v4");
        assert!(active.is_active());
    }

    #[test]
    fn test_activation_replaces_old_version() {
        let mut registration = activated("ekam-cache-v4");

        registration.update("ekam-cache-v5");
        registration.install_complete(true);
        registration.begin_activation();
        registration.finish_activation();

        assert_eq!(registration.active().unwrap().cache_name, "ekam-cache-v5");
    }

    #[test]
    fn test_skip_waiting_gates_activation() {
        let mut registration = registration();
        registration.update("ekam-cache-v5");
        registration.install_complete(false);

        assert!(registration.can_activate(0));
        assert!(!registration.can_activate(2));

        registration.update("ekam-cache-v6");
        registration.install_complete(true);
        assert!(registration.can_activate(2));
        assert_eq!(registration.waiting().unwrap().cache_name, "ekam-cache-v6");
    }

    #[test]
    fn test_restore_and_unregister() {
        let mut registration = registration();
        registration.restore_active("ekam-cache-v5");
        assert!(registration.active().unwrap().is_active());

        registration.update("ekam-cache-v6");
        registration.unregister();

        assert!(registration.active().is_none());
        assert!(registration.installing().is_none());
        assert_eq!(registration.scope().as_str(), "https://ekam.example/");
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(Activated.to_string(), "activated");
        assert_eq!(serde_json::to_string(&Redundant).unwrap(), "\"redundant\"");
    }
}
