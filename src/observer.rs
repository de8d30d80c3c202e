//! Observability hooks for context lifecycles.
//!
//! Both context sides report notable events through a [`ContextObserver`].
//! The default implementation of every method is a no-op, so observers
//! implement only what they care about.

use crate::error::Error;
use crate::message::Message;

/// Pluggable observer notified at the significant points of a context's
/// life. Methods are called from the dispatch and handler paths and must
/// not block.
pub trait ContextObserver: Send + Sync {
    /// A message arrived on the incoming half-channel, before dispatch.
    fn on_incoming_message(&self, _message: &Message) {}

    /// A message was admitted into the context's queues.
    fn on_message(&self, _message: &Message) {}

    /// A message was successfully delivered to the peer.
    fn on_outgoing_message(&self, _message: &Message) {}

    fn on_cancel(&self) {}

    fn on_suspend(&self) {}

    fn on_finish(&self) {}

    /// The peer closed the conversation (terminal `Return`).
    fn on_close(&self) {}

    /// The in-memory context is being torn down.
    fn on_dispose(&self) {}

    /// A handler or lifecycle failure that terminated the context.
    fn on_error(&self, _error: &Error) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ContextObserver for NoopObserver {}
