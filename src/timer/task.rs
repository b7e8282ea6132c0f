//! Cancellable timer task with a guarded owner reference

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::{TimerService, TimerTask};

/// Scheduling state of a [`FireEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireState {
    /// Not scheduled.
    Idle,
    /// Scheduled with a timer service, not yet fired.
    Armed,
    /// Owner detached; no further fire reaches it. Terminal.
    Cancelled,
}

/// A timer task that calls `action` on its owner when it fires.
///
/// The owner is held as a [`Weak`] reference behind a mutex. `fire` holds that
/// mutex for the whole delegate call and `cancel` takes it to detach the
/// owner, so once `cancel` returns no fire is running against the owner and
/// none ever will again.
///
/// Scheduling state lives behind a second, short-lived lock. Arming never
/// touches the owner lock, which lets the owner re-arm from inside `action`.
pub struct FireEvent<T: ?Sized> {
    name: &'static str,
    owner: Mutex<Option<Weak<T>>>,
    state: Mutex<FireState>,
    action: fn(&T),
}

impl<T: ?Sized + Send + Sync + 'static> FireEvent<T> {
    pub fn new(name: &'static str, owner: Weak<T>, action: fn(&T)) -> Self {
        Self {
            name,
            owner: Mutex::new(Some(owner)),
            state: Mutex::new(FireState::Idle),
            action,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> FireState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(FireState::Cancelled)
    }

    pub fn is_armed(&self) -> bool {
        self.state() == FireState::Armed
    }

    /// Schedules the task unless it is already armed or cancelled.
    ///
    /// Returns whether a new scheduling was made.
    pub fn arm(self: &Arc<Self>, service: &dyn TimerService, delay: Duration) -> bool {
        {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => return false,
            };
            if *state != FireState::Idle {
                return false;
            }
            *state = FireState::Armed;
        }
        let task: Arc<dyn TimerTask> = Arc::clone(self) as Arc<dyn TimerTask>;
        service.add(task, delay);
        true
    }

    /// Detaches the owner. Idempotent.
    ///
    /// Blocks while a fire is running, so must not be called from inside
    /// `action`.
    pub fn cancel(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = FireState::Cancelled;
        }
        let mut owner = match self.owner.lock() {
            Ok(owner) => owner,
            Err(poisoned) => poisoned.into_inner(),
        };
        owner.take();
    }
}

impl<T: ?Sized + Send + Sync + 'static> TimerTask for FireEvent<T> {
    fn fire(&self) {
        {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            if *state != FireState::Armed {
                return;
            }
            *state = FireState::Idle;
        }

        // Declared before the guard so the strong reference is released after
        // the owner lock: dropping the last reference may run the owner's
        // teardown, which cancels this task.
        let target: Option<Arc<T>>;
        let owner = match self.owner.lock() {
            Ok(owner) => owner,
            Err(_) => return,
        };
        target = owner.as_ref().and_then(Weak::upgrade);
        if let Some(target) = target.as_deref() {
            (self.action)(target);
        }
        drop(owner);
    }
}

impl<T: ?Sized> fmt::Debug for FireEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FireEvent")
            .field("name", &self.name)
            .field("state", &self.state.lock().map(|s| *s).ok())
            .finish_non_exhaustive()
    }
}
