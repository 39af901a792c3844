use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::Outbox;
use crate::error::{CableError, Result};
use crate::filter::{panic_message, Filter};
use crate::inbox::{Inbox, PushOutcome};
use crate::message::Message;
use crate::protocol::CableCommand;

pub type MessageCallback = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Pending,
    Confirmed,
    Rejected,
    Closed,
}

#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

struct ChannelShared {
    name: String,
    params: Map<String, Value>,
    identifier: Arc<str>,
    state: Mutex<ChannelState>,
    inbox: Inbox,
    callback: Mutex<Option<MessageCallback>>,
    confirmation: Mutex<Option<oneshot::Sender<bool>>>,
    outbox: Outbox,
    receive_timeout: Duration,
}

impl Channel {
    pub(crate) fn new(
        name: &str,
        params: Map<String, Value>,
        identifier: &str,
        outbox: Outbox,
        receive_timeout: Duration,
        inbox_capacity: Option<usize>,
    ) -> (Self, oneshot::Receiver<bool>) {
        let (confirmed_tx, confirmed_rx) = oneshot::channel();
        let identifier: Arc<str> = Arc::from(identifier);
        let channel = Self {
            shared: Arc::new(ChannelShared {
                name: name.to_owned(),
                params,
                inbox: Inbox::new(identifier.clone(), inbox_capacity),
                identifier,
                state: Mutex::new(ChannelState::Pending),
                callback: Mutex::new(None),
                confirmation: Mutex::new(Some(confirmed_tx)),
                outbox,
                receive_timeout,
            }),
        };
        (channel, confirmed_rx)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.shared.params
    }

    pub fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    pub fn state(&self) -> ChannelState {
        *lock(&self.shared.state)
    }

    pub fn buffered(&self) -> usize {
        self.shared.inbox.len()
    }

    pub fn is_ignoring_reads(&self) -> bool {
        self.shared.inbox.is_ignoring_reads()
    }

    pub async fn perform(&self, action: &str, payload: Value) -> Result<()> {
        if self.state() != ChannelState::Confirmed {
            return Err(CableError::ChannelClosed(self.identifier().to_owned()));
        }
        let command = CableCommand::perform(self.identifier(), action, payload)?;
        self.shared.outbox.send(&command).await
    }

    pub async fn receive(&self, filter: impl Into<Filter>) -> Result<Option<Message>> {
        self.receive_within(filter, self.shared.receive_timeout).await
    }

    pub async fn receive_within(
        &self,
        filter: impl Into<Filter>,
        timeout: Duration,
    ) -> Result<Option<Message>> {
        self.shared.inbox.take(&filter.into(), timeout).await
    }

    pub async fn receive_n(
        &self,
        count: usize,
        filter: impl Into<Filter>,
    ) -> Result<Option<Vec<Message>>> {
        self.receive_n_within(count, filter, self.shared.receive_timeout).await
    }

    pub async fn receive_n_within(
        &self,
        count: usize,
        filter: impl Into<Filter>,
        timeout: Duration,
    ) -> Result<Option<Vec<Message>>> {
        self.shared
            .inbox
            .take_n(count, &filter.into(), timeout)
            .await
    }

    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.try_on_message(move |message| {
            callback(message);
            Ok(())
        });
    }

    pub fn try_on_message<F>(&self, callback: F)
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        *lock(&self.shared.callback) = Some(Arc::new(callback));
    }

    pub fn clear_on_message(&self) {
        *lock(&self.shared.callback) = None;
    }

    /// Every later receive times out; the callback keeps firing.
    pub fn ignore_reads(&self) {
        self.shared.inbox.ignore_reads();
        debug!("{} ignoring reads", self.identifier());
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        if matches!(self.state(), ChannelState::Closed | ChannelState::Rejected) {
            return Ok(());
        }
        let sent = self
            .shared
            .outbox
            .send(&CableCommand::unsubscribe(self.identifier()))
            .await;
        self.shared.outbox.forget(self.identifier());
        self.close();
        sent
    }

    pub(crate) fn shared_identifier(&self) -> Arc<str> {
        self.shared.identifier.clone()
    }

    pub(crate) fn confirm(&self) {
        {
            let mut state = lock(&self.shared.state);
            if *state != ChannelState::Pending {
                return;
            }
            *state = ChannelState::Confirmed;
        }
        if let Some(confirmed) = lock(&self.shared.confirmation).take() {
            let _ = confirmed.send(true);
        }
    }

    pub(crate) fn reject(&self) {
        *lock(&self.shared.state) = ChannelState::Rejected;
        if let Some(confirmed) = lock(&self.shared.confirmation).take() {
            let _ = confirmed.send(false);
        }
        self.shared.inbox.close();
    }

    pub(crate) fn close(&self) {
        {
            let mut state = lock(&self.shared.state);
            if *state != ChannelState::Rejected {
                *state = ChannelState::Closed;
            }
        }
        lock(&self.shared.confirmation).take();
        *lock(&self.shared.callback) = None;
        self.shared.inbox.close();
    }

    pub(crate) fn dispatch(&self, message: Message) {
        let callback = lock(&self.shared.callback).clone();
        if let Some(callback) = callback {
            let failure = match catch_unwind(AssertUnwindSafe(|| callback(&message))) {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(panic) => Some(panic_message(panic.as_ref(), "callback")),
            };
            if let Some(reason) = failure {
                self.shared.outbox.stats().record_callback_failure();
                let err = CableError::Callback {
                    channel: self.identifier().to_owned(),
                    reason,
                };
                warn!("{err}");
            }
        }

        if self.shared.inbox.push(message) == PushOutcome::EvictedOldest {
            self.shared.outbox.stats().record_eviction();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("identifier", &self.identifier())
            .field("state", &self.state())
            .field("buffered", &self.buffered())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
