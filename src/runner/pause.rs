use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Ack = oneshot::Sender<()>;

/// Two-phase pause/resume handshake with the flush stage.
///
/// `pause` returns once the flush stage has acknowledged and parked itself;
/// `resume` returns once it has acknowledged the wake-up. A parked flush
/// stage also wakes when its cancel token fires.
pub struct PauseGate {
    pause_tx: mpsc::Sender<Ack>,
    pause_rx: Mutex<mpsc::Receiver<Ack>>,
    resume_tx: mpsc::Sender<Ack>,
    resume_rx: Mutex<mpsc::Receiver<Ack>>,
    paused: AtomicBool,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (pause_tx, pause_rx) = mpsc::channel(1);
        let (resume_tx, resume_rx) = mpsc::channel(1);
        Self {
            pause_tx,
            pause_rx: Mutex::new(pause_rx),
            resume_tx,
            resume_rx: Mutex::new(resume_rx),
            paused: AtomicBool::new(false),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Drop stale requests left over from a previous run.
    pub fn reset(&self) {
        if let Ok(mut rx) = self.pause_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
        if let Ok(mut rx) = self.resume_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Ask the flush stage to park. Returns false if the stage was cancelled
    /// before acknowledging.
    pub async fn pause(&self, flush_token: &CancellationToken) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        tokio::select! {
            sent = self.pause_tx.send(ack_tx) => {
                if sent.is_err() {
                    return false;
                }
            }
            _ = flush_token.cancelled() => return false,
        }
        tokio::select! {
            acked = ack_rx => acked.is_ok(),
            _ = flush_token.cancelled() => false,
        }
    }

    /// Wake a parked flush stage. A stage that is not parked is left alone.
    pub async fn resume(&self, flush_token: &CancellationToken) -> bool {
        if !self.is_paused() {
            return false;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        tokio::select! {
            sent = self.resume_tx.send(ack_tx) => {
                if sent.is_err() {
                    return false;
                }
            }
            _ = flush_token.cancelled() => return false,
        }
        tokio::select! {
            acked = ack_rx => acked.is_ok(),
            _ = flush_token.cancelled() => false,
        }
    }

    /// Next pause request; only the flush stage calls this.
    pub async fn next_pause_request(&self) -> Option<Ack> {
        self.pause_rx.lock().await.recv().await
    }

    pub fn try_pause_request(&self) -> Option<Ack> {
        self.pause_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Acknowledge a pause and park until resumed or cancelled. A request
    /// whose sender already gave up is discarded without parking; returns
    /// whether the stage actually parked.
    pub async fn wait_for_resume(&self, ack: Ack, flush_token: &CancellationToken) -> bool {
        self.paused.store(true, Ordering::SeqCst);
        if ack.send(()).is_err() {
            self.paused.store(false, Ordering::SeqCst);
            debug!("dropping pause request abandoned by its sender");
            return false;
        }
        let mut resume_rx = self.resume_rx.lock().await;
        tokio::select! {
            Some(ack) = resume_rx.recv() => {
                self.paused.store(false, Ordering::SeqCst);
                let _ = ack.send(());
            }
            _ = flush_token.cancelled() => {
                self.paused.store(false, Ordering::SeqCst);
            }
        }
        true
    }
}
