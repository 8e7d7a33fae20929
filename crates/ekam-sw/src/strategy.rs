//! Request classification and response provenance.

use ekam_net::{Request, Response};
use http::Method;

use crate::config::ControllerConfig;

/// Why a request was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughReason {
    /// Method other than GET.
    Method,
    /// URL scheme outside the fetchable set.
    Scheme,
    /// No activated controller yet.
    NotControlling,
}

/// How a request will be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Not intercepted; goes straight to the network.
    Passthrough(PassthroughReason),
    /// Network first, then cache, then the offline document.
    NetworkFirst,
    /// Cache first, then network, then the offline document for HTML.
    CacheFirst,
}

impl Strategy {
    /// Pick a strategy for `request`.
    pub fn for_request(request: &Request, config: &ControllerConfig) -> Self {
        if request.method != Method::GET {
            Strategy::Passthrough(PassthroughReason::Method)
        } else if !config.is_fetchable_scheme(request.url.scheme()) {
            Strategy::Passthrough(PassthroughReason::Scheme)
        } else if request.is_navigation() {
            Strategy::NetworkFirst
        } else {
            Strategy::CacheFirst
        }
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Network,
    Cache,
    OfflineFallback,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Network => "network",
            Source::Cache => "cache",
            Source::OfflineFallback => "offline-fallback",
        }
    }
}

/// A response handed back to the page.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub response: Response,
    pub source: Source,
}

/// Result of intercepting one request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The controller did not intercept; the host fetches normally.
    Passthrough(PassthroughReason),
    /// The controller answered.
    Respond(ServedResponse),
}

impl FetchOutcome {
    pub fn served(&self) -> Option<&ServedResponse> {
        match self {
            FetchOutcome::Respond(served) => Some(served),
            FetchOutcome::Passthrough(_) => None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, FetchOutcome::Passthrough(_))
    }
}
