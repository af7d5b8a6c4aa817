//! Core actor framework types and traits.
//!
//! Provides the building blocks for durable, single-threaded actors:
//! - `Actor` trait for defining actor behavior
//! - `ActorContext` with persisted state and a single alarm slot
//! - `ActorHandle` for sending messages and making request/response calls
//! - `run_actor_loop`, which serializes messages and alarm firings

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::db::{ActorStateStore, DbError};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages and alarms one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    /// On stop the mailbox is closed and messages already queued are still
    /// handled before the loop exits.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError>;

    /// Called when the pending alarm fires. The slot is already cleared.
    async fn on_alarm(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor starts (or restarts). Load persisted state here.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}

    /// Checked after every message and alarm. An idle actor stops the same
    /// way as on `Ok(false)`; the registry respawns it from storage on the
    /// next lookup.
    fn is_idle(&self, _ctx: &ActorContext) -> bool {
        false
    }
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    /// Durable key, `{kind}:{id}`.
    pub actor_key: String,

    shutdown: watch::Receiver<bool>,

    messages_processed: u64,

    alarms_fired: u64,

    storage: Arc<dyn ActorStateStore>,

    alarm: Option<DateTime<Utc>>,
}

impl ActorContext {
    pub fn new(
        actor_key: String,
        storage: Arc<dyn ActorStateStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            actor_key,
            shutdown,
            messages_processed: 0,
            alarms_fired: 0,
            storage,
            alarm: None,
        }
    }

    /// Loads the persisted state blob, if any.
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, ActorError> {
        match self.storage.load_state(&self.actor_key).await? {
            Some(value) => Ok(Some(
                serde_json::from_value(value).map_err(DbError::Serialization)?,
            )),
            None => Ok(None),
        }
    }

    /// Persists the state blob.
    pub async fn save<T: Serialize>(&self, state: &T) -> Result<(), ActorError> {
        let value = serde_json::to_value(state).map_err(DbError::Serialization)?;
        self.storage.save_state(&self.actor_key, &value).await?;
        Ok(())
    }

    /// The pending alarm, if one is armed.
    pub fn alarm(&self) -> Option<DateTime<Utc>> {
        self.alarm
    }

    /// Arms the alarm at `at`, replacing any pending one.
    ///
    /// The in-memory slot is updated before the write, so a failed write
    /// still leaves the alarm armed for this process.
    pub async fn set_alarm(&mut self, at: DateTime<Utc>) -> Result<(), ActorError> {
        self.alarm = Some(at);
        self.storage.save_alarm(&self.actor_key, Some(at)).await?;
        debug!(actor_key = %self.actor_key, alarm_at = %at, "Alarm armed");
        Ok(())
    }

    /// Arms the alarm `delay` from now.
    pub async fn set_alarm_in(&mut self, delay: Duration) -> Result<(), ActorError> {
        let delay =
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.set_alarm(at).await
    }

    /// Clears the pending alarm.
    pub async fn delete_alarm(&mut self) -> Result<(), ActorError> {
        if self.alarm.take().is_some() {
            self.storage.save_alarm(&self.actor_key, None).await?;
        }
        Ok(())
    }

    async fn restore_alarm(&mut self) -> Result<(), ActorError> {
        self.alarm = self.storage.load_alarm(&self.actor_key).await?;
        Ok(())
    }

    /// Clears the slot ahead of `on_alarm`.
    async fn take_fired_alarm(&mut self) {
        self.alarm = None;
        if let Err(e) = self.storage.save_alarm(&self.actor_key, None).await {
            warn!(actor_key = %self.actor_key, error = %e, "Failed to clear fired alarm");
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors. A failed message or alarm never stops
/// the actor; the next alarm or message runs as usual.
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("actor stopped")]
    ActorStopped,

    /// Durable storage failed.
    #[error("actor storage: {0}")]
    Storage(#[from] DbError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_key: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_key: self.actor_key.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    pub fn new(tx: mpsc::Sender<M>, actor_key: String) -> Self {
        Self { tx, actor_key }
    }

    /// Send a message to the actor.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Delivers `msg`, handing it back if the mailbox is already closed.
    pub async fn deliver(&self, msg: M) -> Result<(), M> {
        self.tx.send(msg).await.map_err(|e| e.0)
    }

    /// Sends a request built around a reply channel and waits for the reply.
    pub async fn call<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> M) -> Result<R, ActorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx)).await?;
        reply_rx.await.map_err(|_| ActorError::ActorStopped)
    }

    pub fn actor_key(&self) -> &str {
        &self.actor_key
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

/// Sleeps until the alarm instant, or forever when none is armed.
async fn alarm_elapsed(at: Option<DateTime<Utc>>) {
    match at {
        Some(at) => {
            let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(delay).await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Run the main actor loop.
pub async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut ctx: ActorContext,
) {
    let actor_key = ctx.actor_key.clone();
    let mut shutdown = ctx.shutdown.clone();

    if let Err(e) = ctx.restore_alarm().await {
        error!(actor_key = %actor_key, error = %e, "Failed to restore alarm");
        return;
    }

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_key = %actor_key, error = %e, "Actor failed to start");
        return;
    }

    debug!(actor_key = %actor_key, actor = actor.name(), "Actor started");

    loop {
        let alarm = ctx.alarm;

        let outcome = tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_key = %actor_key, "Actor received shutdown signal");
                    break;
                }
                continue;
            }

            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        ctx.messages_processed += 1;
                        actor.handle(msg, &mut ctx).await
                    }
                    None => {
                        debug!(actor_key = %actor_key, "Actor mailbox closed");
                        break;
                    }
                }
            }

            _ = alarm_elapsed(alarm) => {
                ctx.alarms_fired += 1;
                ctx.take_fired_alarm().await;
                actor.on_alarm(&mut ctx).await.map(|()| true)
            }
        };

        let stop = match outcome {
            Ok(keep_running) => !keep_running,
            Err(e) => {
                error!(actor_key = %actor_key, error = %e, "Actor error");
                false
            }
        };

        if stop || actor.is_idle(&ctx) {
            debug!(actor_key = %actor_key, requested = stop, "Actor stopping");
            drain_mailbox(&mut actor, &mut rx, &mut ctx).await;
            break;
        }
    }

    actor.on_stop(&mut ctx).await;

    debug!(
        actor_key = %actor_key,
        messages_processed = ctx.messages_processed,
        alarms_fired = ctx.alarms_fired,
        "Actor stopped"
    );
}

/// Closes the mailbox and handles what was queued before the close.
/// Senders that lose the race get their message back from `deliver`.
async fn drain_mailbox<A: Actor>(
    actor: &mut A,
    rx: &mut mpsc::Receiver<A::Message>,
    ctx: &mut ActorContext,
) {
    rx.close();
    while let Some(msg) = rx.recv().await {
        ctx.messages_processed += 1;
        if let Err(e) = actor.handle(msg, ctx).await {
            error!(actor_key = %ctx.actor_key, error = %e, "Actor error while draining");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[derive(Debug)]
    enum CounterMessage {
        Bump { reply: oneshot::Sender<u32> },
        ArmIn(Duration),
        Get { reply: oneshot::Sender<(u32, u32)> },
    }

    struct Counter {
        count: u32,
        alarms: u32,
    }

    #[async_trait]
    impl Actor for Counter {
        type Message = CounterMessage;

        fn name(&self) -> &str {
            "counter"
        }

        async fn on_start(&mut self, ctx: &mut ActorContext) -> Result<(), ActorError> {
            self.count = ctx.load::<u32>().await?.unwrap_or(0);
            Ok(())
        }

        async fn handle(
            &mut self,
            msg: CounterMessage,
            ctx: &mut ActorContext,
        ) -> Result<bool, ActorError> {
            match msg {
                CounterMessage::Bump { reply } => {
                    self.count += 1;
                    ctx.save(&self.count).await?;
                    let _ = reply.send(self.count);
                }
                CounterMessage::ArmIn(delay) => ctx.set_alarm_in(delay).await?,
                CounterMessage::Get { reply } => {
                    let _ = reply.send((self.count, self.alarms));
                }
            }
            Ok(true)
        }

        async fn on_alarm(&mut self, ctx: &mut ActorContext) -> Result<(), ActorError> {
            assert!(ctx.alarm().is_none());
            self.alarms += 1;
            Ok(())
        }
    }

    fn spawn_counter(
        storage: Arc<MemoryStore>,
    ) -> (ActorHandle<CounterMessage>, watch::Sender<bool>) {
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = ActorContext::new("counter:1".to_string(), storage, shutdown_rx);
        tokio::spawn(run_actor_loop(Counter { count: 0, alarms: 0 }, rx, ctx));
        (ActorHandle::new(tx, "counter:1".to_string()), shutdown_tx)
    }

    #[tokio::test]
    async fn test_call_round_trip_and_state_survives_restart() {
        let storage = Arc::new(MemoryStore::new());
        let (handle, shutdown) = spawn_counter(storage.clone());

        assert_eq!(handle.call(|reply| CounterMessage::Bump { reply }).await.unwrap(), 1);
        assert_eq!(handle.call(|reply| CounterMessage::Bump { reply }).await.unwrap(), 2);
        shutdown.send(true).unwrap();

        let (handle, _shutdown) = spawn_counter(storage);
        assert_eq!(handle.call(|reply| CounterMessage::Bump { reply }).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_rearming_replaces_pending_alarm() {
        let storage = Arc::new(MemoryStore::new());
        let (handle, _shutdown) = spawn_counter(storage.clone());

        handle
            .send(CounterMessage::ArmIn(Duration::from_secs(3600)))
            .await
            .unwrap();
        handle
            .send(CounterMessage::ArmIn(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (_, alarms) = handle.call(|reply| CounterMessage::Get { reply }).await.unwrap();
        assert_eq!(alarms, 1);
        assert!(storage.load_alarm("counter:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persisted_alarm_fires_after_restart() {
        let storage = Arc::new(MemoryStore::new());
        storage
            .save_alarm("counter:1", Some(Utc::now() - chrono::Duration::seconds(1)))
            .await
            .unwrap();

        let (handle, _shutdown) = spawn_counter(storage);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_, alarms) = handle.call(|reply| CounterMessage::Get { reply }).await.unwrap();
        assert_eq!(alarms, 1);
    }

    #[tokio::test]
    async fn test_call_on_stopped_actor() {
        let (tx, rx) = mpsc::channel::<CounterMessage>(1);
        drop(rx);
        let handle = ActorHandle::new(tx, "gone".to_string());
        let err = handle
            .call(|reply| CounterMessage::Bump { reply })
            .await
            .unwrap_err();
        assert!(matches!(err, ActorError::ActorStopped));
    }
}
