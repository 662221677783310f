use std::panic::AssertUnwindSafe;

use tokio::sync::mpsc;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Hands work to the context that owns the delivery callback (the UI thread in the app).
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: Task);
}

/// Runs tasks immediately on the relay task. A panicking task is logged and swallowed so
/// the relay still acknowledges the delivery and keeps its session.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, task: Task) {
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(task)) {
            let reason = panic
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            tracing::error!(%reason, "Delivery callback panicked");
        }
    }
}

/// Sending half of a [`DispatchQueue`].
#[derive(Clone)]
pub struct QueueDispatcher {
    tx: mpsc::UnboundedSender<Task>,
}

impl Dispatcher for QueueDispatcher {
    fn dispatch(&self, task: Task) {
        if self.tx.send(task).is_err() {
            tracing::warn!("Dispatch queue is gone, dropping delivery callback");
        }
    }
}

/// Tasks waiting to run on a single confined context, in the order they were dispatched.
pub struct DispatchQueue {
    rx: mpsc::UnboundedReceiver<Task>,
}

pub fn dispatch_queue() -> (QueueDispatcher, DispatchQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueDispatcher { tx }, DispatchQueue { rx })
}

impl DispatchQueue {
    /// Waits for the next task and runs it. Returns false once every dispatcher is dropped.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs whatever is already queued without waiting.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    pub async fn run(mut self) {
        while self.run_next().await {}
    }
}
