use async_trait::async_trait;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::filter::EventFilter;
use crate::types::EventEnvelope;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

#[derive(Clone)]
pub struct Subscription {
    name: String,
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }
}

/// Handlers known to a dispatcher. Built once at startup and handed to
/// [`crate::EventDispatcher::start`]; there is no global registration.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    subscriptions: Vec<Subscription>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        self.subscriptions.push(Subscription {
            name: name.into(),
            filter,
            handler,
        });
        self
    }

    pub fn with(mut self, name: impl Into<String>, filter: EventFilter, handler: Arc<dyn EventHandler>) -> Self {
        self.register(name, filter, handler);
        self
    }

    /// Subscriptions whose filter accepts `envelope`, in registration order.
    pub fn matching<'a>(&'a self, envelope: &'a EventEnvelope) -> impl Iterator<Item = &'a Subscription> + 'a {
        self.subscriptions
            .iter()
            .filter(move |s| s.filter.matches(envelope))
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.subscriptions.iter().map(|s| s.name.as_str()).collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
