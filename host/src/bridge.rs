//! # Runtime Bridge
//!
//! One dedicated OS thread running a current-thread tokio runtime. Every
//! transport operation and background task of a serial link runs there;
//! blocking callers on other threads hand work over and wait on a bounded
//! channel for the answer.
//!
//! ```text
//!   caller thread                 "ble-serial-io" thread
//!   ─────────────                 ──────────────────────
//!   run(fut, bound) ── spawn ───► fut.await
//!        │ recv_timeout(bound)         │
//!        ◄──────── result ─────────────┘
//! ```

use std::future::Future;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, error};
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Result, SerialError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of the background runtime thread
#[derive(Debug)]
pub struct Bridge {
    handle: Handle,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Bridge {
    /// Start the runtime thread
    pub fn start(name: &str) -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!("Runtime thread exiting");
            })?;

        let handle = match ready_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(SerialError::Io(e)),
            Err(_) => return Err(SerialError::RuntimeStopped),
        };

        Ok(Self {
            handle,
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shutdown).is_some()
    }

    /// Spawn a long-lived task on the runtime
    pub fn spawn<F>(&self, task: F) -> Result<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_running() {
            return Err(SerialError::RuntimeStopped);
        }
        Ok(self.handle.spawn(task))
    }

    /// Run `work` on the runtime and block until it finishes or `bound`
    /// elapses. Work still running at the bound is cancelled.
    pub fn run<F>(&self, work: F, bound: Duration) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.is_running() {
            return Err(SerialError::RuntimeStopped);
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let task = self.handle.spawn(async move {
            let _ = tx.send(work.await);
        });

        match rx.recv_timeout(bound) {
            Ok(output) => Ok(output),
            Err(RecvTimeoutError::Timeout) => {
                task.abort();
                Err(SerialError::Timeout(bound))
            }
            Err(RecvTimeoutError::Disconnected) => Err(SerialError::RuntimeStopped),
        }
    }

    /// Stop the runtime, cancelling every task on it, and join the thread.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if let Some(tx) = lock(&self.shutdown).take() {
            let _ = tx.send(());
        }
        if let Some(thread) = lock(&self.thread).take() {
            if thread.join().is_err() {
                error!("Runtime thread panicked");
            }
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
