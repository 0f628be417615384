// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The coordinator task.
//!
//! One task per session owns the [`Network`] and is its only mutator. It
//! serializes two inputs: the command queue (subscriptions and shutdown) and
//! the database change stream. Queued changes are coalesced up to
//! `max_coalesce` before propagation. Progress (the timestamp the network has
//! processed, or its poisoning error) is published on a `watch` channel that
//! `wait_until` and the transactional interceptor read.
use std::sync::Arc;

use rete_core::{Change, Network, ObserveError, ObserverId, ReteError, Timestamp};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, instrument, warn};

/// Registers an observer on the network; built by `Session::observe_with`.
pub(crate) type Subscribe = Box<dyn FnOnce(&mut Network) -> Result<ObserverId, ObserveError> + Send>;

/// Request sent to the coordinator.
pub(crate) enum Command {
    AddObserver(PendingAdd),
    RemoveObserver { id: ObserverId },
    Shutdown,
}

impl core::fmt::Debug for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AddObserver(pending) => f
                .debug_struct("AddObserver")
                .field("start", &pending.start)
                .finish_non_exhaustive(),
            Self::RemoveObserver { id } => f.debug_struct("RemoveObserver").field("id", id).finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

pub(crate) struct PendingAdd {
    pub(crate) start: Timestamp,
    pub(crate) subscribe: Subscribe,
    pub(crate) reply: oneshot::Sender<Result<ObserverId, ObserveError>>,
}

/// What the network has processed so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Running; every change up to this timestamp has been delivered.
    Running(Timestamp),
    /// Poisoned; terminal.
    Poisoned(ReteError),
}

enum Event {
    Command(Command),
    Change(Change),
    CommandsClosed,
    ChangesClosed,
}

pub(crate) struct Coordinator {
    label: Arc<str>,
    network: Network,
    commands: mpsc::UnboundedReceiver<Command>,
    changes: Option<mpsc::UnboundedReceiver<Change>>,
    progress: watch::Sender<Progress>,
    deferred: Vec<PendingAdd>,
    max_coalesce: usize,
}

async fn next_change(changes: &mut Option<mpsc::UnboundedReceiver<Change>>) -> Option<Change> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Coordinator {
    pub(crate) fn new(
        label: Arc<str>,
        network: Network,
        commands: mpsc::UnboundedReceiver<Command>,
        changes: mpsc::UnboundedReceiver<Change>,
        progress: watch::Sender<Progress>,
        max_coalesce: usize,
    ) -> Self {
        Self {
            label,
            network,
            commands,
            changes: Some(changes),
            progress,
            deferred: Vec::new(),
            max_coalesce: max_coalesce.max(1),
        }
    }

    #[instrument(name = "rete_coordinator", skip_all, fields(session = %self.label))]
    pub(crate) async fn run(mut self) {
        info!(timestamp = %self.network.timestamp(), "coordinator started");
        loop {
            let event = tokio::select! {
                biased;
                command = self.commands.recv() => command.map_or(Event::CommandsClosed, Event::Command),
                change = next_change(&mut self.changes) => change.map_or(Event::ChangesClosed, Event::Change),
            };
            match event {
                Event::Command(Command::AddObserver(pending)) => self.add(pending),
                Event::Command(Command::RemoveObserver { id }) => {
                    self.network.remove_observer(id);
                }
                Event::Change(change) => self.apply(change),
                Event::ChangesClosed => {
                    debug!("change stream closed");
                    self.changes = None;
                }
                Event::Command(Command::Shutdown) | Event::CommandsClosed => break,
            }
        }
        self.shut_down();
    }

    fn add(&mut self, pending: PendingAdd) {
        if self.network.poisoned().is_none() && pending.start > self.network.timestamp() {
            debug!(
                start = %pending.start,
                timestamp = %self.network.timestamp(),
                "deferring observer until the network catches up"
            );
            self.deferred.push(pending);
            return;
        }
        let PendingAdd { subscribe, reply, .. } = pending;
        let outcome = subscribe(&mut self.network);
        // The caller went away before the reply; do not leak its observer.
        if let Err(Ok(id)) = reply.send(outcome) {
            self.network.remove_observer(id);
        }
        self.publish();
    }

    fn apply(&mut self, first: Change) {
        if self.network.poisoned().is_some() {
            return;
        }
        let mut batch = vec![first];
        if let Some(changes) = self.changes.as_mut() {
            while batch.len() < self.max_coalesce {
                match changes.try_recv() {
                    Ok(next) => batch.push(next),
                    Err(_) => break,
                }
            }
        }
        let count = batch.len();
        let mut merged: Option<Change> = None;
        for change in batch {
            let next = match merged.take() {
                None => Ok(change),
                Some(acc) => acc.coalesce(change),
            };
            match next {
                Ok(change) => merged = Some(change),
                Err(err) => {
                    self.network.poison(err);
                    self.publish();
                    return;
                }
            }
        }
        if let Some(change) = merged {
            if count > 1 {
                debug!(count, timestamp = %change.after_timestamp(), "coalesced changes");
            }
            if let Err(err) = self.network.apply_change(&change) {
                warn!(%err, "propagation failed");
            }
        }
        self.release_deferred();
        self.publish();
    }

    fn release_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let timestamp = self.network.timestamp();
        // A poisoned network answers every waiting add with its error.
        let poisoned = self.network.poisoned().is_some();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|pending| poisoned || pending.start <= timestamp);
        self.deferred = waiting;
        for pending in ready {
            self.add(pending);
        }
    }

    fn publish(&self) {
        let next = match self.network.poisoned() {
            Some(err) => Progress::Poisoned(err.clone()),
            None => Progress::Running(self.network.timestamp()),
        };
        self.progress.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn shut_down(&mut self) {
        self.network.poison(ReteError::Shutdown);
        self.commands.close();
        let mut stragglers = std::mem::take(&mut self.deferred);
        while let Ok(command) = self.commands.try_recv() {
            if let Command::AddObserver(pending) = command {
                stragglers.push(pending);
            }
        }
        for pending in stragglers {
            // Poisoned: the subscribe closure fails without touching state.
            let outcome = (pending.subscribe)(&mut self.network);
            let _ = pending.reply.send(outcome);
        }
        self.publish();
        info!("coordinator stopped");
    }
}
