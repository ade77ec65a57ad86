//! # Request Dispatch
//!
//! Fans query requests out to the handlers registered in this process. Every
//! request carries the id of the service that issued it; handlers declare
//! whether they also act on requests this service issued itself.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::CoordinationResult;

/// Query operation requested by a client-facing service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryRequestMethod {
    Create,
    Plan,
    Predict,
    Next,
    Close,
    Cancel,
}

impl fmt::Display for QueryRequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Plan => "plan",
            Self::Predict => "predict",
            Self::Next => "next",
            Self::Close => "close",
            Self::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub request_id: Uuid,
    pub query_id: Uuid,
    pub method: QueryRequestMethod,
    /// Service id of the issuer
    pub origin: String,
}

impl QueryRequest {
    pub fn new(query_id: Uuid, method: QueryRequestMethod, origin: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            query_id,
            method,
            origin: origin.into(),
        }
    }
}

/// Which requests a handler receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerScope {
    /// Every request, including ones issued by this service
    AllRequests,
    /// Only requests issued by other services
    ExternalOnly,
}

#[async_trait]
pub trait QueryRequestHandler: Send + Sync {
    fn name(&self) -> &str;

    fn scope(&self) -> HandlerScope {
        HandlerScope::ExternalOnly
    }

    async fn handle(&self, request: &QueryRequest) -> CoordinationResult<()>;
}

/// Outcome of one dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub skipped: usize,
    /// `(handler, error)` for every handler that failed
    pub failed: Vec<(String, String)>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.delivered - self.failed.len()
    }
}

pub struct RequestDispatcher {
    service_id: String,
    handlers: Arc<RwLock<Vec<Arc<dyn QueryRequestHandler>>>>,
}

impl fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("service_id", &self.service_id)
            .finish()
    }
}

impl RequestDispatcher {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// A request issued by this service
    pub fn request(&self, query_id: Uuid, method: QueryRequestMethod) -> QueryRequest {
        QueryRequest::new(query_id, method, self.service_id.clone())
    }

    /// Register a handler, replacing any handler with the same name
    pub async fn register_handler(&self, handler: Arc<dyn QueryRequestHandler>) {
        let mut handlers = self.handlers.write().await;
        if let Some(existing) = handlers.iter_mut().find(|h| h.name() == handler.name()) {
            warn!(handler = handler.name(), "Replacing existing request handler");
            *existing = handler;
            return;
        }
        info!(handler = handler.name(), scope = ?handler.scope(), "Registered request handler");
        handlers.push(handler);
    }

    pub async fn unregister_handler(&self, name: &str) -> bool {
        let mut handlers = self.handlers.write().await;
        let before = handlers.len();
        handlers.retain(|h| h.name() != name);
        before != handlers.len()
    }

    pub fn is_self_originated(&self, request: &QueryRequest) -> bool {
        request.origin == self.service_id
    }

    /// Deliver `request` to every handler in scope, concurrently. A failing
    /// handler is logged and does not affect the others.
    pub async fn dispatch(&self, request: &QueryRequest) -> DispatchReport {
        let own = self.is_self_originated(request);
        let handlers: Vec<_> = self.handlers.read().await.clone();
        let (targets, skipped): (Vec<_>, Vec<_>) = handlers
            .into_iter()
            .partition(|h| !own || h.scope() == HandlerScope::AllRequests);

        debug!(
            request_id = %request.request_id,
            query_id = %request.query_id,
            method = %request.method,
            origin = %request.origin,
            targets = targets.len(),
            skipped = skipped.len(),
            "Dispatching query request"
        );

        let outcomes = join_all(targets.iter().map(|handler| async move {
            (handler.name().to_string(), handler.handle(request).await)
        }))
        .await;

        let mut report = DispatchReport {
            delivered: targets.len(),
            skipped: skipped.len(),
            failed: Vec::new(),
        };
        for (handler, outcome) in outcomes {
            if let Err(e) = outcome {
                error!(
                    handler = %handler,
                    request_id = %request.request_id,
                    query_id = %request.query_id,
                    method = %request.method,
                    error = %e,
                    "Request handler failed"
                );
                report.failed.push((handler, e.to_string()));
            }
        }
        report
    }
}
