// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Session handle and subscriptions.
use std::sync::Arc;

use rete_core::store::Database;
use rete_core::{
    Cardinality, Data, MatchHandle, Network, ObserverId, Query, SnapshotRef, Timestamp, TokenSet,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::coordinator::{Command, Coordinator, PendingAdd, Progress, Subscribe};
use crate::error::SessionError;
use crate::scope::MatchScope;

#[derive(Debug)]
struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    progress: watch::Receiver<Progress>,
    database: Database,
    config: SessionConfig,
}

/// Cheap, cloneable handle to one running coordinator.
///
/// The coordinator task stops when [`Session::shutdown`] is called or when
/// every clone of the session (including those held by subscriptions) is
/// dropped. Either way the network ends poisoned with
/// [`rete_core::ReteError::Shutdown`].
#[derive(Clone, Debug)]
pub struct Session(Arc<Shared>);

impl Session {
    /// Starts a coordinator over `database` on the current tokio runtime.
    ///
    /// The network begins at the database's latest snapshot and receives
    /// every later commit.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(database: Database, config: SessionConfig) -> Self {
        let (snapshot, changes) = database.changes();
        let snapshot: SnapshotRef = snapshot;
        let network = Network::new(snapshot).with_strict(config.strict);
        let timestamp = network.timestamp();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(Progress::Running(timestamp));
        let coordinator = Coordinator::new(
            Arc::from(config.label.as_str()),
            network,
            commands_rx,
            changes,
            progress_tx,
            config.max_coalesce,
        );
        tokio::spawn(coordinator.run());
        info!(
            session = %config.label,
            %timestamp,
            strict = config.strict,
            "session started"
        );
        Self(Arc::new(Shared {
            commands: commands_tx,
            progress: progress_rx,
            database,
            config,
        }))
    }

    /// The database the session observes.
    pub fn database(&self) -> &Database {
        &self.0.database
    }

    /// Configuration the session was started with.
    pub fn config(&self) -> &SessionConfig {
        &self.0.config
    }

    /// Current coordinator progress.
    pub fn progress(&self) -> Progress {
        self.0.progress.borrow().clone()
    }

    /// Timestamp of the last change every observer has received.
    ///
    /// # Errors
    ///
    /// [`SessionError::Poisoned`] once the session is poisoned.
    pub fn timestamp(&self) -> Result<Timestamp, SessionError> {
        match self.progress() {
            Progress::Running(timestamp) => Ok(timestamp),
            Progress::Poisoned(err) => Err(SessionError::Poisoned(err)),
        }
    }

    /// Waits until the coordinator has processed `timestamp`.
    ///
    /// Returns the timestamp actually reached, which may be later.
    ///
    /// # Errors
    ///
    /// [`SessionError::Poisoned`] if the session is or becomes poisoned first,
    /// [`SessionError::Closed`] if the coordinator is gone.
    pub async fn wait_until(&self, timestamp: Timestamp) -> Result<Timestamp, SessionError> {
        let mut progress = self.0.progress.clone();
        let reached = progress
            .wait_for(|progress| match progress {
                Progress::Running(now) => *now >= timestamp,
                Progress::Poisoned(_) => true,
            })
            .await
            .map_err(|_| SessionError::Closed)?
            .clone();
        match reached {
            Progress::Running(now) => Ok(now),
            Progress::Poisoned(err) => Err(SessionError::Poisoned(err)),
        }
    }

    /// Subscribes `sink` to `query`.
    ///
    /// The coordinator waits until it has processed `start` before adding the
    /// observer. The sink then receives the current result as one assert-only
    /// set, followed by one set per change that affects the query. It runs
    /// inline on the coordinator and must not block.
    ///
    /// The observer is removed when the returned handle drops or when any of
    /// `dependencies` is invalidated.
    ///
    /// # Errors
    ///
    /// [`SessionError::Unsatisfied`] if a dependency is already invalid,
    /// [`SessionError::Poisoned`] if the session is poisoned.
    pub async fn observe_with<T, C, F>(
        &self,
        query: &Query<T, C>,
        start: Timestamp,
        dependencies: Vec<MatchHandle>,
        sink: F,
    ) -> Result<ObserverHandle, SessionError>
    where
        T: Data,
        C: Cardinality,
        F: FnMut(TokenSet<T>) + Send + 'static,
    {
        let query = query.clone();
        let subscribe: Subscribe =
            Box::new(move |network: &mut Network| network.add_observer(&query, dependencies, sink));
        let (reply, response) = oneshot::channel();
        self.0
            .commands
            .send(Command::AddObserver(PendingAdd {
                start,
                subscribe,
                reply,
            }))
            .map_err(|_| self.closed_error())?;
        let id = response.await.map_err(|_| self.closed_error())??;
        Ok(ObserverHandle {
            session: self.clone(),
            id,
            detached: false,
        })
    }

    /// Subscribes to `query`, buffering token sets in a [`Subscription`].
    ///
    /// # Errors
    ///
    /// Same as [`Session::observe_with`].
    pub async fn observe<T, C>(
        &self,
        query: &Query<T, C>,
        start: Timestamp,
        dependencies: Vec<MatchHandle>,
    ) -> Result<Subscription<T>, SessionError>
    where
        T: Data,
        C: Cardinality,
    {
        let (tx, sets) = mpsc::unbounded_channel();
        let handle = self
            .observe_with(query, start, dependencies, move |set| {
                // A dropped receiver is followed by RemoveObserver.
                let _ = tx.send(set);
            })
            .await?;
        Ok(Subscription { handle, sets })
    }

    /// Subscribes to `query` as of the database's latest commit.
    ///
    /// # Errors
    ///
    /// Same as [`Session::observe_with`].
    pub async fn subscribe<T, C>(&self, query: &Query<T, C>) -> Result<Subscription<T>, SessionError>
    where
        T: Data,
        C: Cardinality,
    {
        self.observe(query, self.0.database.timestamp(), Vec::new()).await
    }

    /// A root scope with no context matches.
    pub fn scope(&self) -> MatchScope {
        MatchScope::new(self.clone())
    }

    /// Stops the coordinator and waits until it has poisoned the network.
    ///
    /// Every pending and later operation fails with
    /// [`rete_core::ReteError::Shutdown`].
    pub async fn shutdown(&self) {
        if self.0.commands.send(Command::Shutdown).is_err() {
            debug!("shutdown requested on a stopped session");
        }
        let mut progress = self.0.progress.clone();
        // A closed channel means the coordinator already exited.
        let _ = progress
            .wait_for(|progress| matches!(progress, Progress::Poisoned(_)))
            .await;
    }

    /// The error reported when the coordinator stops answering.
    pub fn closed_error(&self) -> SessionError {
        match self.progress() {
            Progress::Poisoned(err) => SessionError::Poisoned(err),
            Progress::Running(_) => SessionError::Closed,
        }
    }

    fn remove_observer(&self, id: ObserverId) {
        if self.0.commands.send(Command::RemoveObserver { id }).is_err() {
            debug!(observer = id.value(), "session closed before unsubscribe");
        }
    }
}

/// Keeps an observer registered; unsubscribes on drop.
#[derive(Debug)]
pub struct ObserverHandle {
    session: Session,
    id: ObserverId,
    detached: bool,
}

impl ObserverHandle {
    /// Id of the observer on the coordinator.
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Leaves the observer registered after the handle drops.
    ///
    /// It is still removed when its dependencies are invalidated or the
    /// session stops.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if !self.detached {
            self.session.remove_observer(self.id);
        }
    }
}

/// Buffered stream of the token sets delivered to one observer.
///
/// The first set is always the replay of the result at subscription time.
#[derive(Debug)]
pub struct Subscription<T> {
    handle: ObserverHandle,
    sets: mpsc::UnboundedReceiver<TokenSet<T>>,
}

impl<T> Subscription<T> {
    /// Id of the underlying observer.
    pub fn id(&self) -> ObserverId {
        self.handle.id()
    }

    /// Next token set. `None` once the observer has been removed, by a
    /// dependency invalidation or by the session stopping.
    pub async fn next(&mut self) -> Option<TokenSet<T>> {
        self.sets.recv().await
    }

    /// Next token set if one is already buffered.
    pub fn try_next(&mut self) -> Option<TokenSet<T>> {
        self.sets.try_recv().ok()
    }
}
