use std::future::Future;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

struct ControlState {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ControlState {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }
}

/// A cancel token plus a wait group for one stage group.
///
/// Tasks spawned with [`AsyncControl::run`] receive the current token and are
/// expected to drain their input and return once it is cancelled.
pub struct AsyncControl {
    state: Mutex<ControlState>,
}

impl Default for AsyncControl {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ControlState::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControlState> {
        match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Replace the token and wait group so the group can run again.
    pub fn reset(&self) {
        *self.lock() = ControlState::new();
    }

    pub fn run<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let state = self.lock();
        let fut = task(state.token.clone());
        state.tracker.spawn(fut);
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.lock().token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.lock().token.cancel();
    }

    /// Cancel and wait for every task of the group to return.
    pub async fn wait_cancel(&self) {
        let tracker = {
            let state = self.lock();
            state.token.cancel();
            state.tracker.close();
            state.tracker.clone()
        };
        tracker.wait().await;
    }
}
