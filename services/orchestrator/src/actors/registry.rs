//! Keyed actor registry.
//!
//! Maps an identifier to the single live actor instance that owns it. Actors
//! are spawned lazily on first use and stay resident until they stop
//! themselves; exited entries are pruned on the next lookup. `recover`
//! respawns every actor with a persisted pending alarm after a process
//! restart.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::framework::{run_actor_loop, Actor, ActorContext, ActorError, ActorHandle, Message};
use crate::db::ActorStateStore;

const DEFAULT_MAILBOX_SIZE: usize = 64;

/// Deliveries attempted before giving up on an actor that keeps exiting.
const DELIVERY_ATTEMPTS: usize = 3;

struct LiveActor<M: Message> {
    handle: ActorHandle<M>,
    task: JoinHandle<()>,
}

type Factory<K, A> = dyn Fn(K) -> A + Send + Sync;

pub struct ActorRegistry<K, A: Actor> {
    kind: &'static str,
    storage: Arc<dyn ActorStateStore>,
    factory: Box<Factory<K, A>>,
    mailbox_size: usize,
    actors: Mutex<HashMap<K, LiveActor<A::Message>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<K, A> ActorRegistry<K, A>
where
    K: Copy + Eq + Hash + Display + FromStr + Send + 'static,
    A: Actor,
{
    pub fn new(
        kind: &'static str,
        storage: Arc<dyn ActorStateStore>,
        factory: impl Fn(K) -> A + Send + Sync + 'static,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            kind,
            storage,
            factory: Box::new(factory),
            mailbox_size: DEFAULT_MAILBOX_SIZE,
            actors: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Durable key for an actor of this kind.
    pub fn actor_key(&self, id: K) -> String {
        format!("{}:{}", self.kind, id)
    }

    /// The live actor for `id`, spawning it if needed.
    pub fn get(&self, id: K) -> Result<ActorHandle<A::Message>, ActorError> {
        if *self.shutdown_tx.borrow() {
            return Err(ActorError::ActorStopped);
        }

        let mut actors = self
            .actors
            .lock()
            .map_err(|_| ActorError::Internal(anyhow::anyhow!("actor registry lock poisoned")))?;

        actors.retain(|_, live| !live.task.is_finished());

        if let Some(live) = actors.get(&id) {
            if !live.handle.is_closed() {
                return Ok(live.handle.clone());
            }
            debug!(kind = self.kind, %id, "Actor stopping, respawning");
        }

        let actor_key = self.actor_key(id);
        let (tx, rx) = mpsc::channel(self.mailbox_size);
        let ctx = ActorContext::new(
            actor_key.clone(),
            self.storage.clone(),
            self.shutdown_tx.subscribe(),
        );
        let task = tokio::spawn(run_actor_loop((self.factory)(id), rx, ctx));
        let handle = ActorHandle::new(tx, actor_key);

        actors.insert(
            id,
            LiveActor {
                handle: handle.clone(),
                task,
            },
        );
        Ok(handle)
    }

    /// Sends a request to the actor for `id` and waits for the reply.
    ///
    /// A message refused by an actor that stopped between lookup and send is
    /// redelivered to a fresh instance.
    pub async fn call<R>(
        &self,
        id: K,
        make: impl FnOnce(oneshot::Sender<R>) -> A::Message,
    ) -> Result<R, ActorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut msg = make(reply_tx);
        for _ in 0..DELIVERY_ATTEMPTS {
            match self.get(id)?.deliver(msg).await {
                Ok(()) => return reply_rx.await.map_err(|_| ActorError::ActorStopped),
                Err(refused) => msg = refused,
            }
        }
        warn!(kind = self.kind, %id, "Actor kept exiting before delivery");
        Err(ActorError::ActorStopped)
    }

    /// Respawns every actor of this kind with a pending alarm.
    pub async fn recover(&self) -> Result<usize, ActorError> {
        let prefix = format!("{}:", self.kind);
        let pending = self.storage.pending_alarms(&prefix).await?;

        let mut recovered = 0;
        for (key, alarm_at) in pending {
            let raw = key.strip_prefix(prefix.as_str()).unwrap_or(&key);
            match raw.parse::<K>() {
                Ok(id) => {
                    self.get(id)?;
                    recovered += 1;
                }
                Err(_) => {
                    warn!(actor_key = %key, %alarm_at, "Skipping alarm with unparseable key");
                }
            }
        }

        info!(kind = self.kind, recovered, "Recovered actors with pending alarms");
        Ok(recovered)
    }

    pub fn live_count(&self) -> usize {
        self.actors
            .lock()
            .map(|actors| actors.values().filter(|a| !a.task.is_finished()).count())
            .unwrap_or(0)
    }

    /// Stops every actor, aborting any still running after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown_tx.send_replace(true);

        let drained: Vec<(K, LiveActor<A::Message>)> = match self.actors.lock() {
            Ok(mut actors) => actors.drain().collect(),
            Err(_) => return,
        };
        info!(kind = self.kind, count = drained.len(), "Stopping actors");

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if drained.iter().all(|(_, a)| a.task.is_finished()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for (id, actor) in &drained {
            if !actor.task.is_finished() {
                warn!(kind = self.kind, %id, "Force aborting actor");
                actor.task.abort();
            }
        }
    }
}
