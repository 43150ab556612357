//! The store: sole owner of a session's [`NotebookState`].
//!
//! Actions go into an inbox and are applied one at a time by a single task.
//! After each action the new snapshot is published on a `watch` channel and
//! the action itself is forwarded to every subscriber, so a subscriber that
//! sees an action can always read a state that already includes it.
//!
//! Each subscriber gets its own unbounded feed. A slow subscriber never
//! loses actions; it only falls behind.

use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::actions::Action;
use crate::state::{reduce_state, NotebookState};

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<Action>>>>;

/// An action on its way in, optionally with someone waiting for it to land.
#[derive(Debug)]
struct Envelope {
    action: Action,
    applied: Option<oneshot::Sender<Arc<NotebookState>>>,
}

/// Cloneable access to a running store.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    inbox: mpsc::UnboundedSender<Envelope>,
    state: watch::Receiver<Arc<NotebookState>>,
    subscribers: Subscribers,
}

impl StoreHandle {
    /// Queue an action. Never blocks; dropped with a warning once the store is gone.
    pub fn dispatch(&self, action: Action) {
        self.send(action, None);
    }

    /// Queue an action and wait for the snapshot that includes it.
    pub async fn dispatch_applied(&self, action: Action) -> Option<Arc<NotebookState>> {
        let (tx, rx) = oneshot::channel();
        self.send(action, Some(tx));
        rx.await.ok()
    }

    fn send(&self, action: Action, applied: Option<oneshot::Sender<Arc<NotebookState>>>) {
        let action_type = action.action_type();
        if self.inbox.send(Envelope { action, applied }).is_err() {
            warn!("[store] Store stopped, dropping {}", action_type);
        }
    }

    /// Latest snapshot.
    pub fn state(&self) -> Arc<NotebookState> {
        self.state.borrow().clone()
    }

    /// Every action applied from now on, in order and without gaps.
    ///
    /// The feed ends once the store stops.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Action> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    pub fn watch(&self) -> watch::Receiver<Arc<NotebookState>> {
        self.state.clone()
    }

    /// Wait until a snapshot satisfies `predicate` and return it.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&Arc<NotebookState>) -> bool,
    ) -> Option<Arc<NotebookState>> {
        let mut watch = self.watch();
        let state = watch.wait_for(predicate).await.ok()?;
        Some(Arc::clone(&state))
    }
}

pub struct Store {
    handle: StoreHandle,
    task: JoinHandle<()>,
}

impl Store {
    /// Start the reducer task with `initial` as the first snapshot.
    pub fn spawn(initial: NotebookState) -> Store {
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel::<Envelope>();
        let (state_tx, state_rx) = watch::channel(Arc::new(initial));
        let subscribers: Subscribers = Arc::default();

        let feeds = Arc::clone(&subscribers);
        let task = tokio::spawn(async move {
            while let Some(Envelope { action, applied }) = inbox_rx.recv().await {
                let current = state_tx.borrow().clone();
                let next = Arc::new(reduce_state(&current, &action));
                state_tx.send_replace(Arc::clone(&next));
                debug!("[store] Applied {}", action.action_type());
                if let Some(applied) = applied {
                    let _ = applied.send(next);
                }
                let mut feeds = match feeds.lock() {
                    Ok(feeds) => feeds,
                    Err(poisoned) => poisoned.into_inner(),
                };
                // Subscribers that dropped their receiver are forgotten.
                feeds.retain(|feed| feed.send(action.clone()).is_ok());
            }
            debug!("[store] Inbox closed");
        });

        Store {
            handle: StoreHandle {
                inbox: inbox_tx,
                state: state_rx,
                subscribers,
            },
            task,
        }
    }

    pub fn handle(&self) -> StoreHandle {
        self.handle.clone()
    }

    /// Stop the reducer task. Subscriber feeds end once their backlog is read.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::CellId;
    use crate::model::CellType;

    #[tokio::test]
    async fn test_dispatch_updates_state_then_broadcasts() {
        let store = Store::spawn(NotebookState::default());
        let handle = store.handle();
        let mut actions = handle.subscribe();

        handle.dispatch(Action::CreateCellAppend {
            new_id: CellId::from("a"),
            cell_type: CellType::Code,
            source: "1".into(),
        });

        let applied = actions.recv().await.unwrap();
        assert_eq!(applied.action_type(), "CREATE_CELL_APPEND");
        // The snapshot already includes the broadcast action.
        assert!(handle.state().notebook().cell(&CellId::from("a")).is_some());

        store.shutdown();
    }

    #[tokio::test]
    async fn test_slow_subscriber_sees_every_action() {
        let store = Store::spawn(NotebookState::default());
        let handle = store.handle();
        let mut actions = handle.subscribe();

        handle.dispatch(Action::AbortExecution { id: CellId::from("x") });
        for _ in 0..4200 {
            handle.dispatch(Action::create_cell_append(CellType::Code, ""));
        }
        handle.wait_for(|s| s.notebook().len() == 4200).await.unwrap();

        // Nothing was read while the store worked through the burst.
        let first = actions.recv().await.unwrap();
        assert_eq!(first.action_type(), "ABORT_EXECUTION");
        let mut appended = 0;
        while let Ok(action) = actions.try_recv() {
            assert_eq!(action.action_type(), "CREATE_CELL_APPEND");
            appended += 1;
        }
        assert_eq!(appended, 4200);

        store.shutdown();
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_forgotten() {
        let store = Store::spawn(NotebookState::default());
        let handle = store.handle();
        drop(handle.subscribe());
        let mut kept = handle.subscribe();

        handle.dispatch(Action::create_cell_append(CellType::Code, ""));
        assert_eq!(kept.recv().await.unwrap().action_type(), "CREATE_CELL_APPEND");
        assert_eq!(handle.subscribers.lock().unwrap().len(), 1);

        store.shutdown();
    }

    #[tokio::test]
    async fn test_actions_apply_in_dispatch_order() {
        let store = Store::spawn(NotebookState::default());
        let handle = store.handle();

        for name in ["a", "b", "c"] {
            handle.dispatch(Action::CreateCellAppend {
                new_id: CellId::from(name),
                cell_type: CellType::Markdown,
                source: String::new(),
            });
        }

        let state = handle
            .wait_for(|s| s.notebook().len() == 3)
            .await
            .unwrap();
        let order: Vec<&str> = state.notebook().cell_order().iter().map(CellId::as_str).collect();
        assert_eq!(order, vec!["a", "b", "c"]);

        store.shutdown();
    }

    #[tokio::test]
    async fn test_dispatch_applied_returns_including_snapshot() {
        let store = Store::spawn(NotebookState::default());
        let handle = store.handle();

        handle.dispatch(Action::create_cell_append(CellType::Code, ""));
        let state = handle
            .dispatch_applied(Action::create_cell_append(CellType::Raw, ""))
            .await
            .unwrap();
        assert_eq!(state.notebook().len(), 2);

        store.shutdown();
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_store() {
        let store = Store::spawn(NotebookState::default());
        let handle = store.handle();

        handle.dispatch(Action::ErrorExecuting {
            id: None,
            error: "boom".into(),
        });
        handle.dispatch(Action::create_cell_append(CellType::Code, ""));

        let state = handle.wait_for(|s| s.notebook().len() == 1).await.unwrap();
        assert_eq!(state.notifications.len(), 1);

        store.shutdown();
    }
}
