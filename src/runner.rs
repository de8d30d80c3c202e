//! # Execution Runner
//!
//! Drives a command handler against a service context in its own task and
//! settles the context afterwards:
//!
//! - handler done + `Suspended` → persist the snapshot, dispose in memory;
//! - handler done + any other status → finish if still active, delete any
//!   stored snapshot, dispose;
//! - handler failed on an active context → convert the failure into an
//!   error `Return` with `close = true`, then tear down and report.
//!
//! A cancelled context sends nothing during teardown; its pending waits
//! already failed with the cancellation error.
//!
//! The [`ContextManager`] is the live-context map: at most one in-memory
//! context exists per service channel id, and the transport layer routes
//! exclusively through it.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::observer::{ContextObserver, NoopObserver};
use crate::service::{ContextStatus, ServiceContext};
use crate::store::{ContextStore, StoredContext};

/// Business logic of one command, re-entered from the top on resume.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, context: Arc<ServiceContext>) -> Result<(), Error>;
}

/// Adapter turning an async closure into a [`CommandHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Arc<ServiceContext>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), Error>> + Send,
{
    async fn execute(&self, context: Arc<ServiceContext>) -> Result<(), Error> {
        (self.0)(context).await
    }
}

/// Concurrent map of live service contexts, keyed by service channel id.
#[derive(Debug, Default)]
pub struct ContextManager {
    contexts: DashMap<String, Arc<ServiceContext>>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, context: Arc<ServiceContext>) {
        self.contexts.insert(key.to_string(), context);
    }

    pub fn get(&self, key: &str) -> Option<Arc<ServiceContext>> {
        self.contexts.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, key: &str) -> Option<Arc<ServiceContext>> {
        self.contexts.remove(key).map(|(_, context)| context)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

/// Runs handlers to completion and settles their contexts.
#[derive(Clone)]
pub struct ExecutionRunner {
    store: Arc<dyn ContextStore>,
    manager: Arc<ContextManager>,
    observer: Arc<dyn ContextObserver>,
}

impl ExecutionRunner {
    pub fn new(store: Arc<dyn ContextStore>, manager: Arc<ContextManager>) -> Self {
        Self {
            store,
            manager,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Attach a service-level observer (receives `on_error`).
    pub fn with_observer(mut self, observer: Arc<dyn ContextObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Launch `handler` against `context` in its own task.
    pub fn spawn(
        &self,
        context: Arc<ServiceContext>,
        handler: Arc<dyn CommandHandler>,
    ) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move { runner.drive(context, handler).await })
    }

    async fn drive(&self, context: Arc<ServiceContext>, handler: Arc<dyn CommandHandler>) {
        let key = context
            .channel()
            .service_channel_id
            .clone()
            .unwrap_or_default();
        debug!(channel = %key, command = context.command().name(), "handler starting");

        match handler.execute(context.clone()).await {
            Ok(()) => match context.status() {
                ContextStatus::Suspended => {
                    let record = StoredContext {
                        channel: context.channel().clone(),
                        state: context.serialize(),
                    };
                    if let Err(store_error) = self.store.store(&key, &record).await {
                        error!(channel = %key, %store_error, "failed to persist suspended context");
                        self.observer.on_error(&store_error);
                    }
                    self.dispose(&key, &context);
                }
                ContextStatus::Cancelled => {
                    self.delete_stored(&key).await;
                    self.dispose(&key, &context);
                }
                status => {
                    if status != ContextStatus::Finished {
                        if let Err(finish_error) = context.finish().await {
                            warn!(channel = %key, %finish_error, "implicit finish failed");
                        }
                    }
                    self.delete_stored(&key).await;
                    self.dispose(&key, &context);
                }
            },
            Err(handler_error) => {
                warn!(
                    channel = %key,
                    command = context.command().name(),
                    %handler_error,
                    "handler failed"
                );
                if context.status() == ContextStatus::Active {
                    if let Err(report_error) = context.return_error(
                        handler_error.name(),
                        &handler_error.to_string(),
                        None,
                    ) {
                        warn!(channel = %key, %report_error, "could not record handler error");
                    }
                    if let Err(finish_error) = context.finish().await {
                        warn!(channel = %key, %finish_error, "error finish failed");
                    }
                }
                self.delete_stored(&key).await;
                self.dispose(&key, &context);
                self.observer.on_error(&handler_error);
            }
        }
        debug!(channel = %key, "handler settled");
    }

    async fn delete_stored(&self, key: &str) {
        if let Err(delete_error) = self.store.delete(key).await {
            warn!(channel = %key, %delete_error, "stored context delete failed");
        }
    }

    fn dispose(&self, key: &str, context: &Arc<ServiceContext>) {
        self.manager.remove(key);
        context.dispose();
    }
}
