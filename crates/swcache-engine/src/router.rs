//! Request classification and dispatch.

use swcache_net::{BypassList, Request, RequestMode, Response};
use tracing::debug;

use crate::strategy::{Retrieval, Strategy};
use crate::Result;

/// Routing class of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Never intercepted.
    Bypass,
    /// Page load.
    Navigation,
    /// Subresource.
    Asset,
}

impl RequestClass {
    /// Strategy for this class; `None` for bypassed requests.
    pub fn strategy(self) -> Option<Strategy> {
        match self {
            RequestClass::Bypass => None,
            RequestClass::Navigation => Some(Strategy::NetworkFirst),
            RequestClass::Asset => Some(Strategy::CacheFirst),
        }
    }
}

/// What the engine did with an intercepted request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Left to the runtime's default network handling.
    PassThrough,
    /// Answered by the engine.
    Respond(Response),
}

impl FetchOutcome {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, FetchOutcome::PassThrough)
    }

    pub fn response(self) -> Option<Response> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            FetchOutcome::PassThrough => None,
        }
    }
}

/// Routes requests to one strategy each.
#[derive(Debug, Clone, Default)]
pub struct RequestRouter {
    bypass: BypassList,
}

impl RequestRouter {
    pub fn new(bypass: BypassList) -> Self {
        Self { bypass }
    }

    pub fn bypass(&self) -> &BypassList {
        &self.bypass
    }

    /// Classify a request. First match wins: bypass, then navigation.
    pub fn classify(&self, request: &Request) -> RequestClass {
        if self.bypass.matches(&request.url) {
            RequestClass::Bypass
        } else if request.mode == RequestMode::Navigate || request.accepts("text/html") {
            RequestClass::Navigation
        } else {
            RequestClass::Asset
        }
    }

    /// Classify and run the matching strategy.
    pub async fn route(&self, request: &Request, retrieval: &Retrieval) -> Result<FetchOutcome> {
        let class = self.classify(request);
        let Some(strategy) = class.strategy() else {
            debug!(url = %request.url, "Bypassed");
            return Ok(FetchOutcome::PassThrough);
        };

        debug!(url = %request.url, method = %request.method, ?class, %strategy, "Routing request");
        retrieval
            .run(strategy, request)
            .await
            .map(FetchOutcome::Respond)
    }
}
