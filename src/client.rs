//! # Agent-Side Client Context
//!
//! The symmetric counterpart of the service context: callers use a
//! [`ClientContext`] to drive one invocation, read streamed `Return`
//! batches, answer upcalls (inputs, confirmations, payments) and cancel.
//!
//! A context is created (and routable) before the invoke handshake is
//! sent, because the service may start posting to the client channel as
//! soon as it has accepted the invoke; the service half-channel
//! coordinates are filled in when the handshake response arrives.
//!
//! Outbound sends retry retryable transport failures with exponential
//! backoff plus jitter; a terminal failure or retry exhaustion surfaces as
//! `SendMessageFailed` with the underlying cause attached.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelTarget, MessageSender};
use crate::defaults;
use crate::error::Error;
use crate::message::{InputEntry, Message};
use crate::observer::{ContextObserver, NoopObserver};
use crate::queue::AsyncQueue;

/// Lifecycle status of a client context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Invoked,
    Cancelled,
    Finished,
}

/// Retry policy for outbound sends.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub tries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_jitter: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            tries: defaults::SEND_RETRIES,
            base_delay: defaults::SEND_BASE_DELAY,
            multiplier: defaults::SEND_BACKOFF_MULTIPLIER,
            max_jitter: defaults::SEND_MAX_JITTER,
        }
    }
}

impl RetryOptions {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let backoff =
            self.base_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32 - 1);
        let jitter = if self.max_jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_jitter.as_millis() as u64)
        };
        Duration::from_millis(backoff as u64 + jitter)
    }
}

/// Agent-side per-invocation state.
pub struct ClientContext {
    channel: Mutex<Channel>,
    sender: Arc<dyn MessageSender>,
    observer: Arc<dyn ContextObserver>,
    retry: RetryOptions,
    status: Mutex<ClientStatus>,
    queue: AsyncQueue<Message>,
    provide_seq: AtomicU64,
    disposed: AtomicBool,
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("channel", &self.channel)
            .field("retry", &self.retry)
            .field("status", &self.status)
            .field("provide_seq", &self.provide_seq)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl ClientContext {
    /// Create a context; the channel may still lack its service half.
    pub fn new(channel: Channel, sender: Arc<dyn MessageSender>, retry: RetryOptions) -> Self {
        Self {
            channel: Mutex::new(channel),
            sender,
            observer: Arc::new(NoopObserver),
            retry,
            status: Mutex::new(ClientStatus::Invoked),
            queue: AsyncQueue::with_capacity(Some(defaults::MESSAGE_BUFFER_CAPACITY)),
            provide_seq: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    /// Attach an observer (call before sharing the context).
    pub fn with_observer(mut self, observer: Arc<dyn ContextObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn status(&self) -> ClientStatus {
        *self.status.lock()
    }

    /// Current channel coordinates.
    pub fn channel(&self) -> Channel {
        self.channel.lock().clone()
    }

    fn client_channel_id(&self) -> String {
        self.channel.lock().client_channel_id.clone()
    }

    /// Record the service half-channel coordinates from the handshake
    /// response.
    pub fn complete_handshake(
        &self,
        service_channel_id: &str,
        service_channel_url: &str,
        service_channel_token: &str,
    ) {
        let mut channel = self.channel.lock();
        channel.service_channel_id = Some(service_channel_id.to_string());
        channel.service_channel_url = Some(service_channel_url.to_string());
        channel.service_channel_token = Some(service_channel_token.to_string());
    }

    fn target(&self) -> Result<ChannelTarget, Error> {
        self.channel.lock().service_target().ok_or(Error::NotInvoked)
    }

    // ----- incoming ----------------------------------------------------

    /// Enqueue one incoming message for consumers.
    ///
    /// A `Return` with `close = true` makes the context terminal: queued
    /// messages stay readable until drained, then readers observe the end
    /// of the stream.
    pub fn handle_incoming_message(&self, message: Message) -> Result<(), Error> {
        self.observer.on_incoming_message(&message);
        let closes = matches!(&message, Message::Return { close: true, .. });
        self.queue.push(message)?;
        if closes {
            debug!(
                channel = %self.client_channel_id(),
                "terminal return received, closing"
            );
            *self.status.lock() = ClientStatus::Finished;
            self.queue.close();
            self.observer.on_close();
        }
        Ok(())
    }

    /// Await the next message; `None` means timeout or end of stream.
    pub async fn get_message(&self, timeout: Option<Duration>) -> Result<Option<Message>, Error> {
        self.queue
            .wait_for(|_| true, timeout)
            .await
            .map_err(Error::from)
    }

    /// Lazy, single-shot, finite sequence of incoming messages.
    pub fn messages(self: &Arc<Self>) -> MessageStream {
        MessageStream {
            context: Arc::clone(self),
            done: false,
        }
    }

    // ----- outbound ----------------------------------------------------

    /// Provide inputs the service asked for (or additional ones).
    pub async fn provide_inputs(&self, inputs: Vec<InputEntry>) -> Result<(), Error> {
        let seq = self.provide_seq.fetch_add(1, Ordering::Relaxed);
        self.send_message(Message::ProvideInput {
            inputs,
            seq: Some(seq),
        })
        .await
    }

    /// Answer a `RequestUserConfirmation` upcall.
    pub async fn provide_user_confirmation(
        &self,
        request: &Message,
        confirmed_by: &str,
    ) -> Result<(), Error> {
        let Message::RequestUserConfirmation { req_id, .. } = request else {
            return Err(Error::UnexpectedMessage {
                reason: format!("`{}` is not a confirmation request", request.kind()),
            });
        };
        self.send_message(Message::ProvideUserConfirmation {
            req_id: req_id.clone(),
            confirmed_by: confirmed_by.to_string(),
        })
        .await
    }

    /// Authorize a `RequestPayment` upcall, echoing its amount and currency.
    pub async fn authorize_payment(
        &self,
        request: &Message,
        payment_schema: &str,
        payment_id: &str,
        token: &str,
    ) -> Result<(), Error> {
        let Message::RequestPayment {
            req_id,
            amount,
            currency,
            ..
        } = request
        else {
            return Err(Error::UnexpectedMessage {
                reason: format!("`{}` is not a payment request", request.kind()),
            });
        };
        self.send_message(Message::AuthorizePayment {
            req_id: req_id.clone(),
            payment_id: payment_id.to_string(),
            payment_schema: payment_schema.to_string(),
            amount: *amount,
            currency: currency.clone(),
            token: token.to_string(),
            payment_data: None,
        })
        .await
    }

    /// Decline a `RequestPayment` upcall.
    pub async fn reject_payment(
        &self,
        request: &Message,
        reason: Option<&str>,
    ) -> Result<(), Error> {
        let Message::RequestPayment { req_id, .. } = request else {
            return Err(Error::UnexpectedMessage {
                reason: format!("`{}` is not a payment request", request.kind()),
            });
        };
        self.send_message(Message::RejectPayment {
            req_id: req_id.clone(),
            reason: reason.map(str::to_string),
        })
        .await
    }

    /// Cancel the invocation. Subsequent sends fail with `NotInvoked`.
    pub async fn cancel(&self) -> Result<(), Error> {
        self.send_message(Message::Cancel).await?;
        *self.status.lock() = ClientStatus::Cancelled;
        self.queue.close();
        debug!(channel = %self.client_channel_id(), "invocation cancelled");
        Ok(())
    }

    /// Send one message with retry on retryable transport failures.
    pub async fn send_message(&self, message: Message) -> Result<(), Error> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::AlreadyDisposed);
        }
        if self.status() != ClientStatus::Invoked {
            return Err(Error::NotInvoked);
        }
        let target = self.target()?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sender.send(&target, &message).await {
                Ok(()) => {
                    self.observer.on_outgoing_message(&message);
                    return Ok(());
                }
                Err(cause) if cause.is_retryable() && attempt < self.retry.tries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        channel = %target.channel_id,
                        attempt,
                        %cause,
                        ?delay,
                        "send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(cause) => {
                    return Err(Error::SendMessageFailed {
                        channel: self.client_channel_id(),
                        retries: attempt,
                        cause: Box::new(cause),
                    })
                }
            }
        }
    }

    // ----- teardown ----------------------------------------------------

    /// Tear down the in-memory context. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.flush(None);
        self.observer.on_dispose();
    }
}

/// Pull-based view of a context's incoming messages; ends cleanly when the
/// conversation closes or is cancelled.
pub struct MessageStream {
    context: Arc<ClientContext>,
    done: bool,
}

impl MessageStream {
    /// Next message, or `None` once the stream ends.
    pub async fn next(&mut self) -> Option<Message> {
        if self.done {
            return None;
        }
        match self.context.get_message(None).await {
            Ok(Some(message)) => Some(message),
            Ok(None) | Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::TransportError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct FlakySender {
        sent: Mutex<Vec<Message>>,
        failures_left: AtomicU32,
        retryable: bool,
    }

    impl FlakySender {
        fn reliable() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                failures_left: AtomicU32::new(0),
                retryable: true,
            })
        }

        fn failing(times: u32, retryable: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                failures_left: AtomicU32::new(times),
                retryable,
            })
        }
    }

    #[async_trait]
    impl MessageSender for FlakySender {
        async fn send(
            &self,
            _target: &ChannelTarget,
            message: &Message,
        ) -> Result<(), TransportError> {
            if self.failures_left.load(Ordering::Relaxed) > 0 {
                self.failures_left.fetch_sub(1, Ordering::Relaxed);
                return if self.retryable {
                    Err(TransportError::Unreachable {
                        message: "connection refused".into(),
                    })
                } else {
                    Err(TransportError::Rejected {
                        status: 400,
                        message: "bad request".into(),
                        body: None,
                    })
                };
            }
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }

    fn channel() -> Channel {
        Channel {
            protocol_version: "1.0.0".into(),
            command_name: None,
            client_channel_id: "c1".into(),
            client_channel_url: "http://agent/channel".into(),
            client_channel_token: "ct".into(),
            service_channel_id: Some("s1".into()),
            service_channel_url: Some("http://service/channel".into()),
            service_channel_token: Some("st".into()),
        }
    }

    fn quick_retry() -> RetryOptions {
        RetryOptions {
            tries: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 1.5,
            max_jitter: Duration::from_millis(1),
        }
    }

    fn context(sender: Arc<FlakySender>) -> Arc<ClientContext> {
        Arc::new(ClientContext::new(channel(), sender, quick_retry()))
    }

    fn terminal_return() -> Message {
        Message::Return {
            items: vec![],
            close: true,
            seq: Some(0),
        }
    }

    #[tokio::test]
    async fn test_close_return_finishes_after_drain() {
        let ctx = context(FlakySender::reliable());
        ctx.handle_incoming_message(Message::RequestUserConfirmation {
            req_id: "r1".into(),
            reason: None,
        })
        .unwrap();
        ctx.handle_incoming_message(terminal_return()).unwrap();
        assert_eq!(ctx.status(), ClientStatus::Finished);

        // Buffered messages, including the terminal return, drain in order.
        let mut stream = ctx.messages();
        assert!(matches!(
            stream.next().await,
            Some(Message::RequestUserConfirmation { .. })
        ));
        assert!(matches!(
            stream.next().await,
            Some(Message::Return { close: true, .. })
        ));
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_get_message_times_out_with_empty() {
        let ctx = context(FlakySender::reliable());
        let message = ctx
            .get_message(Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(message, None);
    }

    #[tokio::test]
    async fn test_sends_fail_before_handshake_completes() {
        let mut half_open = channel();
        half_open.service_channel_id = None;
        half_open.service_channel_url = None;
        half_open.service_channel_token = None;
        let ctx = ClientContext::new(half_open, FlakySender::reliable(), quick_retry());

        let error = ctx.provide_inputs(vec![]).await.unwrap_err();
        assert_eq!(error.name(), "NotInvoked");

        ctx.complete_handshake("s1", "http://service/channel", "st");
        ctx.provide_inputs(vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_retryable_failures_are_retried() {
        let sender = FlakySender::failing(2, true);
        let ctx = context(sender.clone());

        ctx.provide_inputs(vec![InputEntry {
            input_type: "name".into(),
            value: json!("John"),
        }])
        .await
        .unwrap();
        assert_eq!(sender.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_send_failure() {
        let sender = FlakySender::failing(3, true);
        let ctx = context(sender);

        let error = ctx.provide_inputs(vec![]).await.unwrap_err();
        match error {
            Error::SendMessageFailed {
                channel, retries, ..
            } => {
                assert_eq!(channel, "c1");
                assert_eq!(retries, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let sender = FlakySender::failing(1, false);
        let ctx = context(sender.clone());

        let error = ctx.provide_inputs(vec![]).await.unwrap_err();
        match error {
            Error::SendMessageFailed { retries, .. } => assert_eq!(retries, 1),
            other => panic!("unexpected error: {other}"),
        }
        assert!(sender.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_blocks_further_sends() {
        let sender = FlakySender::reliable();
        let ctx = context(sender.clone());

        ctx.cancel().await.unwrap();
        assert_eq!(ctx.status(), ClientStatus::Cancelled);
        assert!(matches!(sender.sent.lock()[0], Message::Cancel));

        let error = ctx.provide_inputs(vec![]).await.unwrap_err();
        assert_eq!(error.name(), "NotInvoked");
    }

    #[tokio::test]
    async fn test_upcall_replies_echo_request_correlation() {
        let sender = FlakySender::reliable();
        let ctx = context(sender.clone());

        let confirmation_request = Message::RequestUserConfirmation {
            req_id: "r42".into(),
            reason: Some("why".into()),
        };
        ctx.provide_user_confirmation(&confirmation_request, "me@example.com")
            .await
            .unwrap();

        let payment_request = Message::RequestPayment {
            req_id: "p7".into(),
            accepted_payment_schemas: vec!["test+jwt".into()],
            amount: 1000.0,
            currency: "TST".into(),
            description: "Test payment".into(),
        };
        ctx.authorize_payment(&payment_request, "test+jwt", "abc123", "token")
            .await
            .unwrap();

        let sent = sender.sent.lock().clone();
        assert_eq!(
            sent[0],
            Message::ProvideUserConfirmation {
                req_id: "r42".into(),
                confirmed_by: "me@example.com".into(),
            }
        );
        assert_eq!(
            sent[1],
            Message::AuthorizePayment {
                req_id: "p7".into(),
                payment_id: "abc123".into(),
                payment_schema: "test+jwt".into(),
                amount: 1000.0,
                currency: "TST".into(),
                token: "token".into(),
                payment_data: None,
            }
        );

        let error = ctx
            .provide_user_confirmation(&Message::Cancel, "me")
            .await
            .unwrap_err();
        assert_eq!(error.name(), "UnexpectedMessage");
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_blocks_sends() {
        let ctx = context(FlakySender::reliable());
        ctx.dispose();
        ctx.dispose();
        let error = ctx.provide_inputs(vec![]).await.unwrap_err();
        assert_eq!(error.name(), "AlreadyDisposed");
    }
}
