//! Background projection worker.
//!
//! Used when auto-projection is disabled on the engine: committed events are
//! published to a bus and a worker thread drains them into a projection.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::bus::{EventBus, Subscription};
use crate::message::Message;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Generic projection worker loop.
///
/// - Subscribes to an event bus
/// - Applies an idempotent handler for each message
/// - Supports graceful shutdown
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    /// Spawn a worker thread that processes events from the bus subscription.
    ///
    /// `handler` must be idempotent (at-least-once delivery safe).
    pub fn spawn<B, H, E>(name: &'static str, bus: B, mut handler: H) -> WorkerHandle
    where
        B: EventBus + Send + Sync + 'static,
        H: FnMut(Message) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, &mut handler))
            .expect("failed to spawn projection worker thread");

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

fn worker_loop<H, E>(
    name: &'static str,
    sub: Subscription,
    shutdown_rx: mpsc::Receiver<()>,
    handler: &mut H,
) where
    H: FnMut(Message) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(msg) => {
                if let Err(err) = handler(msg) {
                    warn!(worker = name, error = ?err, "projection worker handler failed");
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}
