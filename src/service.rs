//! # Service-Side Execution Context
//!
//! A [`ServiceContext`] is the per-invocation conversation object on the
//! executing side. It interleaves handler-authored business logic with
//! incoming messages through two queues:
//!
//! - the *input buffer* holds provided inputs, demultiplexed out of the
//!   general message stream on arrival so `get_inputs` can wait per type;
//! - the *message queue* holds control traffic (confirmations, payment
//!   replies), which correlated upcalls drain with per-reqId predicates.
//!
//! Produced outputs and errors accumulate in a *return buffer* that is
//! flushed as a single batched `Return` at the next suspension point, at
//! `finish`/`suspend`, or after an incoming dispatch finds it non-empty.
//!
//! ## Status machine
//!
//! ```text
//! Initialized -- invoke accepted ------> Active
//! Active      -- suspend() ------------> Suspended
//! Active      -- finish() -------------> Finished
//! Active      -- Cancel received ------> Cancelled
//! Suspended   -- next incoming message > Active (via restore)
//! Finished / Cancelled: terminal
//! ```
//!
//! No message may be sent unless the status is `Active`. Dispatch of an
//! incoming message resolves before the handler observes its effects, so
//! the transport can acknowledge the POST without waiting on handler logic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{Channel, MessageSender};
use crate::command::{CommandDefinition, ConfigProfileDefinition};
use crate::defaults;
use crate::error::Error;
use crate::message::{InputEntry, Message, ReturnItem, UserConfirmation};
use crate::observer::{ContextObserver, NoopObserver};
use crate::queue::{AsyncQueue, QueueError};

/// Lifecycle status of a service context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextStatus {
    Initialized,
    Active,
    Suspended,
    Cancelled,
    Finished,
}

/// Persistable snapshot of a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedContext {
    pub status: ContextStatus,
    pub config_profiles: HashMap<String, Value>,
    pub state: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_queue: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_queue: Option<Vec<InputEntry>>,
}

/// Construction options for a service context.
#[derive(Debug)]
pub struct ServiceContextOptions {
    /// Validate `return_data` payloads against declared output schemas.
    pub validate_return_types: bool,
    /// Default payment schemas offered when a `request_payment` call does
    /// not override them.
    pub accepted_payment_schemas: Vec<String>,
    /// Config profile definitions the service declares, for invoke-time
    /// schema validation.
    pub profiles: HashMap<String, Arc<ConfigProfileDefinition>>,
    /// Capacity bound of each incoming queue.
    pub queue_capacity: usize,
}

impl Default for ServiceContextOptions {
    fn default() -> Self {
        Self {
            validate_return_types: true,
            accepted_payment_schemas: Vec::new(),
            profiles: HashMap::new(),
            queue_capacity: defaults::MESSAGE_BUFFER_CAPACITY,
        }
    }
}

/// Parameters of a `request_payment` upcall.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub amount: f64,
    pub currency: String,
    pub description: String,
    /// Overrides the context default when set.
    pub accepted_payment_schemas: Option<Vec<String>>,
}

/// Authorization record returned to the handler on successful payment.
///
/// `max_amount` is the *requested* amount: the ceiling the handler asked
/// for, independent of what the agent echoed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAuthorization {
    pub payment_id: String,
    pub payment_schema: String,
    pub max_amount: f64,
    pub currency: String,
    pub token: String,
}

/// Service-side per-invocation state. See the module docs for the overall
/// model; all mutability is interior so dispatch and the handler task can
/// share one `Arc`.
pub struct ServiceContext {
    command: Arc<CommandDefinition>,
    channel: Channel,
    options: ServiceContextOptions,
    sender: Arc<dyn MessageSender>,
    observer: Arc<dyn ContextObserver>,
    status: Mutex<ContextStatus>,
    state: Mutex<Value>,
    config_profiles: Mutex<HashMap<String, Value>>,
    messages: AsyncQueue<Message>,
    inputs: AsyncQueue<InputEntry>,
    return_buffer: Mutex<Vec<ReturnItem>>,
    /// Serializes return-buffer flushes so batches keep their order on the
    /// wire and a close can never be followed by another `Return`.
    flush_lock: tokio::sync::Mutex<()>,
    return_seq: AtomicU64,
    close_sent: AtomicBool,
    disposed: AtomicBool,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("command", &self.command)
            .field("channel", &self.channel)
            .field("options", &self.options)
            .field("status", &self.status)
            .field("state", &self.state)
            .field("config_profiles", &self.config_profiles)
            .field("return_buffer", &self.return_buffer)
            .field("return_seq", &self.return_seq)
            .field("close_sent", &self.close_sent)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl ServiceContext {
    /// Create a fresh context in `Initialized` status.
    pub fn new(
        sender: Arc<dyn MessageSender>,
        options: ServiceContextOptions,
        command: Arc<CommandDefinition>,
        channel: Channel,
    ) -> Self {
        let capacity = Some(options.queue_capacity);
        Self {
            command,
            channel,
            sender,
            observer: Arc::new(NoopObserver),
            status: Mutex::new(ContextStatus::Initialized),
            state: Mutex::new(Value::Null),
            config_profiles: Mutex::new(HashMap::new()),
            messages: AsyncQueue::with_capacity(capacity),
            inputs: AsyncQueue::with_capacity(capacity),
            return_buffer: Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            return_seq: AtomicU64::new(0),
            close_sent: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            options,
        }
    }

    /// Rebuild a context from a persisted snapshot.
    ///
    /// A snapshot taken in `Suspended` status resumes as `Active` so the
    /// handler's state machine continues where it left off; everything else
    /// is replayed verbatim.
    pub fn restore(
        sender: Arc<dyn MessageSender>,
        options: ServiceContextOptions,
        command: Arc<CommandDefinition>,
        channel: Channel,
        snapshot: SerializedContext,
    ) -> Self {
        let capacity = Some(options.queue_capacity);
        let status = match snapshot.status {
            ContextStatus::Suspended => ContextStatus::Active,
            other => other,
        };
        Self {
            command,
            channel,
            sender,
            observer: Arc::new(NoopObserver),
            status: Mutex::new(status),
            state: Mutex::new(snapshot.state),
            config_profiles: Mutex::new(snapshot.config_profiles),
            messages: AsyncQueue::seeded(snapshot.message_queue.unwrap_or_default(), capacity),
            inputs: AsyncQueue::seeded(snapshot.input_queue.unwrap_or_default(), capacity),
            return_buffer: Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            return_seq: AtomicU64::new(0),
            close_sent: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            options,
        }
    }

    /// Attach an observer (call before sharing the context).
    pub fn with_observer(mut self, observer: Arc<dyn ContextObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn status(&self) -> ContextStatus {
        *self.status.lock()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn command(&self) -> &Arc<CommandDefinition> {
        &self.command
    }

    fn set_status(&self, status: ContextStatus) {
        *self.status.lock() = status;
    }

    fn ensure_active(&self) -> Result<(), Error> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::AlreadyDisposed);
        }
        match self.status() {
            ContextStatus::Active => Ok(()),
            _ => Err(Error::NotActive),
        }
    }

    // ----- incoming dispatch -------------------------------------------

    /// Route one incoming message through the dispatch table.
    ///
    /// Rejections leave the context untouched; the transport layer maps the
    /// error onto an HTTP failure.
    pub async fn handle_incoming_message(&self, message: Message) -> Result<(), Error> {
        self.observer.on_incoming_message(&message);
        debug!(
            kind = message.kind(),
            status = ?self.status(),
            "dispatching incoming message"
        );

        match (self.status(), &message) {
            (ContextStatus::Initialized, Message::Invoke { .. }) => self.accept_invoke(&message)?,
            (ContextStatus::Initialized, other) => {
                return Err(Error::UnexpectedMessage {
                    reason: format!("`{}` received before invoke", other.kind()),
                })
            }
            (ContextStatus::Active, Message::Invoke { .. }) => {
                return Err(Error::UnexpectedMessage {
                    reason: "command has already been invoked".to_string(),
                })
            }
            (ContextStatus::Active, Message::ProvideInput { .. }) => {
                self.accept_provide_input(&message)?
            }
            (ContextStatus::Active, Message::ProvideUserConfirmation { .. })
            | (ContextStatus::Active, Message::AuthorizePayment { .. })
            | (ContextStatus::Active, Message::RejectPayment { .. }) => {
                self.messages.push(message.clone())?;
                self.observer.on_message(&message);
            }
            (ContextStatus::Active, Message::Cancel) => {
                self.cancel_from_peer();
                return Ok(());
            }
            (ContextStatus::Active, other) => {
                return Err(Error::UnexpectedMessage {
                    reason: format!("`{}` is not valid on the service channel", other.kind()),
                })
            }
            (_, _) => return Err(Error::NotActive),
        }

        // Anything buffered while no flush opportunity existed goes out now.
        if self.status() == ContextStatus::Active && !self.return_buffer.lock().is_empty() {
            self.flush_return_buffer(false).await?;
        }
        Ok(())
    }

    /// Validate and accept an `Invoke`, collecting every config profile and
    /// input error before rejecting.
    fn accept_invoke(&self, message: &Message) -> Result<(), Error> {
        let Message::Invoke {
            config_profiles,
            inputs,
            user_confirmation,
        } = message
        else {
            return Err(Error::UnexpectedMessage {
                reason: "expected invoke".to_string(),
            });
        };

        let mut failures: Vec<Error> = Vec::new();

        for profile in self.command.required_config_profiles() {
            match config_profiles.get(profile) {
                None => failures.push(Error::MissingConfigProfile {
                    profile: profile.clone(),
                }),
                Some(value) => {
                    if let Some(definition) = self.options.profiles.get(profile) {
                        let violations = definition.check(value);
                        if !violations.is_empty() {
                            failures.push(Error::InvalidConfigProfile {
                                profile: profile.clone(),
                                violations,
                            });
                        }
                    }
                }
            }
        }
        for supplied in config_profiles.keys() {
            if !self.command.requires_config_profile(supplied) {
                failures.push(Error::UnknownConfigProfile {
                    profile: supplied.clone(),
                });
            }
        }

        for entry in inputs {
            if let Err(error) = self.command.validate_input(&entry.input_type, &entry.value) {
                failures.push(error);
            }
        }

        if !failures.is_empty() {
            return Err(Error::invalid_message("invoke validation failed", failures));
        }

        *self.config_profiles.lock() = config_profiles.clone();
        self.set_status(ContextStatus::Active);
        self.inputs.push_all(inputs.clone())?;
        if let Some(confirmation) = user_confirmation {
            // Standing confirmation: consumable once by the first
            // confirmation wait, correlated by the empty reqId.
            self.messages.push(Message::ProvideUserConfirmation {
                req_id: String::new(),
                confirmed_by: confirmation.confirmed_by.clone(),
            })?;
        }
        debug!(command = self.command.name(), "invoke accepted");
        Ok(())
    }

    /// Validate a `ProvideInput` batch fail-fast; admit nothing from a batch
    /// that contains an invalid entry or that would overflow the buffer.
    fn accept_provide_input(&self, message: &Message) -> Result<(), Error> {
        let Message::ProvideInput { inputs, .. } = message else {
            return Err(Error::UnexpectedMessage {
                reason: "expected provideInput".to_string(),
            });
        };
        for entry in inputs {
            self.command.validate_input(&entry.input_type, &entry.value)?;
        }
        self.inputs.push_all(inputs.clone())?;
        self.observer.on_message(message);
        Ok(())
    }

    fn cancel_from_peer(&self) {
        debug!(command = self.command.name(), "cancel received");
        self.inputs.flush(Some(QueueError::Cancelled));
        self.messages.flush(Some(QueueError::Cancelled));
        self.set_status(ContextStatus::Cancelled);
        self.observer.on_cancel();
    }

    // ----- handler-visible API -----------------------------------------

    /// Collect `count` inputs of `input_type`, requesting more from the
    /// agent whenever the buffer runs dry.
    ///
    /// The first wait is unbounded (an agent may take arbitrary time to
    /// answer the initial request); once at least one item has been
    /// collected, further waits are bounded by `timeout`.
    pub async fn get_inputs<T: DeserializeOwned>(
        &self,
        input_type: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<T>, Error> {
        self.ensure_active()?;
        let mut collected: Vec<T> = Vec::with_capacity(count);

        while collected.len() < count {
            let wanted = input_type.to_string();
            if let Some(entry) = self.inputs.try_take(|e| e.input_type == wanted) {
                collected.push(serde_json::from_value(entry.value)?);
                continue;
            }

            let remaining = (count - collected.len()) as u32;
            self.send_request_input(input_type, remaining).await?;

            let wait = if collected.is_empty() {
                None
            } else {
                Some(timeout)
            };
            let wanted = input_type.to_string();
            match self.inputs.wait_for(move |e| e.input_type == wanted, wait).await {
                Ok(Some(entry)) => collected.push(serde_json::from_value(entry.value)?),
                Ok(None) => {
                    return Err(Error::InputTimeout {
                        input_type: input_type.to_string(),
                    })
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(collected)
    }

    /// Convenience: one input of `input_type` with the default timeout.
    pub async fn get_input<T: DeserializeOwned>(&self, input_type: &str) -> Result<T, Error> {
        let mut values = self
            .get_inputs(input_type, 1, defaults::UPCALL_TIMEOUT)
            .await?;
        values.pop().ok_or(Error::InputTimeout {
            input_type: input_type.to_string(),
        })
    }

    async fn send_request_input(&self, input_type: &str, min_count: u32) -> Result<(), Error> {
        let request =
            self.command
                .input_request(input_type, min_count)
                .ok_or(Error::UnknownInputType {
                    input_type: input_type.to_string(),
                })?;
        let mut inputs = indexmap::IndexMap::new();
        inputs.insert(input_type.to_string(), request);
        self.send_message(Message::RequestInput { inputs }).await
    }

    /// Ask the user for confirmation and wait for the correlated reply.
    ///
    /// A standing confirmation supplied on invoke (empty reqId) satisfies
    /// the first wait.
    pub async fn request_user_confirmation(
        &self,
        reason: Option<&str>,
        timeout: Duration,
    ) -> Result<UserConfirmation, Error> {
        self.ensure_active()?;
        let req_id = Uuid::new_v4().simple().to_string();
        self.send_message(Message::RequestUserConfirmation {
            req_id: req_id.clone(),
            reason: reason.map(str::to_string),
        })
        .await?;

        let wanted = req_id.clone();
        let reply = self
            .messages
            .wait_for(
                move |m| {
                    matches!(
                        m,
                        Message::ProvideUserConfirmation { req_id, .. }
                            if *req_id == wanted || req_id.is_empty()
                    )
                },
                Some(timeout),
            )
            .await?;

        match reply {
            Some(Message::ProvideUserConfirmation { confirmed_by, .. }) => {
                Ok(UserConfirmation { confirmed_by })
            }
            Some(other) => Err(Error::UnexpectedMessage {
                reason: format!("`{}` while awaiting confirmation", other.kind()),
            }),
            None => Err(Error::ConfirmationTimeout),
        }
    }

    /// Request payment authorization and wait for the correlated
    /// authorize/reject reply.
    pub async fn request_payment(
        &self,
        request: PaymentRequest,
        timeout: Duration,
    ) -> Result<PaymentAuthorization, Error> {
        self.ensure_active()?;
        let req_id = Uuid::new_v4().simple().to_string();
        let schemas = request
            .accepted_payment_schemas
            .clone()
            .unwrap_or_else(|| self.options.accepted_payment_schemas.clone());

        self.send_message(Message::RequestPayment {
            req_id: req_id.clone(),
            accepted_payment_schemas: schemas,
            amount: request.amount,
            currency: request.currency.clone(),
            description: request.description.clone(),
        })
        .await?;

        let wanted = req_id.clone();
        let reply = self
            .messages
            .wait_for(
                move |m| {
                    matches!(
                        m,
                        Message::AuthorizePayment { req_id, .. } | Message::RejectPayment { req_id, .. }
                            if *req_id == wanted
                    )
                },
                Some(timeout),
            )
            .await?;

        match reply {
            Some(Message::AuthorizePayment {
                payment_id,
                payment_schema,
                currency,
                token,
                ..
            }) => Ok(PaymentAuthorization {
                payment_id,
                payment_schema,
                max_amount: request.amount,
                currency,
                token,
            }),
            Some(Message::RejectPayment { reason, .. }) => Err(Error::PaymentRejected { reason }),
            Some(other) => Err(Error::UnexpectedMessage {
                reason: format!("`{}` while awaiting payment", other.kind()),
            }),
            None => Err(Error::PaymentTimeout),
        }
    }

    /// Append an output to the return buffer (sent on the next flush).
    pub fn return_data<T: Serialize>(
        &self,
        output_type: &str,
        data: T,
        summary: Option<&str>,
    ) -> Result<(), Error> {
        self.ensure_active()?;
        let value = serde_json::to_value(data)?;
        if self.options.validate_return_types {
            self.command.validate_output(output_type, &value)?;
        }
        self.return_buffer.lock().push(ReturnItem::Output {
            output_type: output_type.to_string(),
            data: value,
            summary: summary.map(str::to_string),
        });
        Ok(())
    }

    /// Append an error entry to the return buffer (no schema check).
    pub fn return_error(
        &self,
        error_name: &str,
        description: &str,
        data: Option<Value>,
    ) -> Result<(), Error> {
        self.ensure_active()?;
        self.return_buffer.lock().push(ReturnItem::Error {
            error_name: error_name.to_string(),
            description: description.to_string(),
            data,
        });
        Ok(())
    }

    /// Flush the return buffer with `close = true` and finish the context.
    pub async fn finish(&self) -> Result<(), Error> {
        self.ensure_active()?;
        self.flush_return_buffer(true).await?;
        self.set_status(ContextStatus::Finished);
        self.observer.on_finish();
        debug!(command = self.command.name(), "context finished");
        Ok(())
    }

    /// Flush pending outputs (without closing) and suspend the context.
    /// The execution runner persists the snapshot and disposes the
    /// in-memory context afterwards.
    pub async fn suspend(&self) -> Result<(), Error> {
        self.ensure_active()?;
        if !self.return_buffer.lock().is_empty() {
            self.flush_return_buffer(false).await?;
        }
        self.set_status(ContextStatus::Suspended);
        self.observer.on_suspend();
        debug!(command = self.command.name(), "context suspended");
        Ok(())
    }

    /// Stored value of a required config profile.
    pub fn get_config_profile<T: DeserializeOwned>(&self, profile: &str) -> Result<T, Error> {
        if !self.command.requires_config_profile(profile) {
            return Err(Error::ProfileNotRequired {
                profile: profile.to_string(),
            });
        }
        let value = self
            .config_profiles
            .lock()
            .get(profile)
            .cloned()
            .ok_or(Error::MissingConfigProfile {
                profile: profile.to_string(),
            })?;
        serde_json::from_value(value).map_err(Error::from)
    }

    /// Decode the user-chosen state value.
    pub fn state<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(self.state.lock().clone()).map_err(Error::from)
    }

    /// Replace the user-chosen state value.
    pub fn set_state<T: Serialize>(&self, state: &T) -> Result<(), Error> {
        *self.state.lock() = serde_json::to_value(state)?;
        Ok(())
    }

    pub fn raw_state(&self) -> Value {
        self.state.lock().clone()
    }

    // ----- outbound ----------------------------------------------------

    /// Send one message to the agent; only permitted while `Active`.
    pub async fn send_message(&self, message: Message) -> Result<(), Error> {
        self.ensure_active()?;
        let target = self.channel.client_target();
        self.sender
            .send(&target, &message)
            .await
            .map_err(Error::Transport)?;
        self.observer.on_outgoing_message(&message);
        Ok(())
    }

    /// Send the buffered return items as one batched `Return`.
    ///
    /// Uses double-buffering: the batch is swapped out, and on transport
    /// failure it is put back in front of anything buffered meanwhile so
    /// relative order is preserved.
    async fn flush_return_buffer(&self, close: bool) -> Result<(), Error> {
        let _guard = self.flush_lock.lock().await;
        if self.close_sent.load(Ordering::Acquire) {
            return Ok(());
        }

        let batch = {
            let mut buffer = self.return_buffer.lock();
            if buffer.is_empty() && !close {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };

        let seq = self.return_seq.fetch_add(1, Ordering::Relaxed);
        let message = Message::Return {
            items: batch.clone(),
            close,
            seq: Some(seq),
        };
        match self.send_message(message).await {
            Ok(()) => {
                if close {
                    self.close_sent.store(true, Ordering::Release);
                }
                Ok(())
            }
            Err(error) => {
                warn!(
                    command = self.command.name(),
                    %error,
                    "return flush failed, restoring batch"
                );
                let mut buffer = self.return_buffer.lock();
                let mut restored = batch;
                restored.append(&mut buffer);
                *buffer = restored;
                Err(error)
            }
        }
    }

    // ----- persistence & teardown --------------------------------------

    /// Snapshot for the context store.
    pub fn serialize(&self) -> SerializedContext {
        SerializedContext {
            status: self.status(),
            config_profiles: self.config_profiles.lock().clone(),
            state: self.state.lock().clone(),
            message_queue: Some(self.messages.snapshot()),
            input_queue: Some(self.inputs.snapshot()),
        }
    }

    /// Tear down the in-memory context. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inputs.flush(None);
        self.messages.flush(None);
        self.observer.on_dispose();
    }
}
