//! Rollback stack of committed values.
//!
//! ```ignore
//! let registry = Registry::builder()
//!     .plugin("history", History::factory(20))
//!     .build();
//! let history = registry.get_plugin::<History>("draft", "history").unwrap();
//! history.undo().await?;
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

use crate::cell::{events, Cell, CellError, ListenerId, SetOptions, WeakCell};
use crate::plugin::{Capability, PluginFactory};
use crate::value::Value;

/// Depth used when the factory config does not name one.
pub const DEFAULT_DEPTH: usize = 10;

struct HistoryState {
    past: VecDeque<Value>,
    current: Value,
    limit: usize,
    restoring: bool,
}

/// Records every committed value of a cell so writes can be undone.
///
/// Holds only a weak handle to its cell.
pub struct History {
    cell: WeakCell,
    listener: ListenerId,
    state: Arc<Mutex<HistoryState>>,
}

fn lock(state: &Mutex<HistoryState>) -> MutexGuard<'_, HistoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl History {
    /// Attaches a history of at most `limit` entries to `cell`.
    pub fn attach(cell: &Cell, limit: usize) -> Self {
        let state = Arc::new(Mutex::new(HistoryState {
            past: VecDeque::new(),
            current: cell.value(),
            limit,
            restoring: false,
        }));
        let recorder = Arc::clone(&state);
        let listener = cell.on(events::SET, move |args| {
            let Some(value) = args.first() else {
                return;
            };
            let mut state = lock(&recorder);
            let previous = std::mem::replace(&mut state.current, value.clone());
            if state.restoring || state.limit == 0 {
                return;
            }
            state.past.push_back(previous);
            while state.past.len() > state.limit {
                state.past.pop_front();
            }
        });
        History {
            cell: cell.downgrade(),
            listener,
            state,
        }
    }

    /// Plugin factory; the first config value overrides `limit`.
    pub fn factory(limit: usize) -> PluginFactory {
        PluginFactory::with_config(
            |cell: &Cell, config: &[Value]| {
                let limit = config
                    .first()
                    .and_then(Value::as_i64)
                    .and_then(|n| usize::try_from(n).ok())
                    .unwrap_or(DEFAULT_DEPTH);
                History::attach(cell, limit)
            },
            vec![Value::from(limit)],
        )
    }

    pub fn depth(&self) -> usize {
        lock(&self.state).past.len()
    }

    pub fn can_undo(&self) -> bool {
        self.depth() > 0
    }

    pub fn clear(&self) {
        lock(&self.state).past.clear();
    }

    /// Restores the previous committed value through the cell's setter path.
    ///
    /// Returns `false` when there is nothing to undo or the cell is gone.
    pub async fn undo(&self) -> Result<bool, CellError> {
        let Some(cell) = self.cell.upgrade() else {
            return Ok(false);
        };
        let previous = {
            let mut state = lock(&self.state);
            match state.past.pop_back() {
                Some(previous) => {
                    state.restoring = true;
                    previous
                }
                None => return Ok(false),
            }
        };
        trace!(key = cell.key(), "undoing last write");
        let outcome = cell
            .set_with_options(previous.clone(), SetOptions::forced())
            .await;
        let mut state = lock(&self.state);
        state.restoring = false;
        if outcome.is_err() {
            state.past.push_back(previous);
        }
        outcome.map(|()| true)
    }
}

impl Capability for History {
    fn dispose(&self) {
        if let Some(cell) = self.cell.upgrade() {
            cell.off(events::SET, self.listener);
        }
        lock(&self.state).past.clear();
    }
}

impl std::fmt::Debug for History {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("History")
            .field("depth", &state.past.len())
            .field("limit", &state.limit)
            .finish()
    }
}
