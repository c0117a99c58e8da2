//! Synchronous front end for [`SensorClient`].
//!
//! Transport work runs on a single-threaded tokio runtime that lives on its
//! own OS thread. Every operation is submitted as a job and answered through
//! a [`Pending`] result: poll it with [`Pending::try_take`] from a UI tick,
//! block on it with [`Pending::wait`], `.await` it, or attach a completion
//! callback with [`Pending::on_complete`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use ledsense_rs::prelude::*;
//!
//! # fn main() -> ledsense_rs::Result<()> {
//! let bridge = Bridge::spawn(ClientConfig::default(), Arc::new(NullListener), BleTransport::new)?;
//! let devices = bridge.scan().wait()?;
//! if let Some(device) = devices.into_iter().next() {
//!     bridge.connect(device).wait()?;
//!     bridge.send(Command::State(true)).wait()?;
//! }
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::client::{SensorClient, StateHandle};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::Command;
use crate::store::ChannelStore;
use crate::transport::Transport;
use crate::types::{ConnectionState, SensorListener};

enum Job<D> {
    Scan {
        timeout: Duration,
        reply: oneshot::Sender<Result<Vec<D>>>,
    },
    Connect {
        device: D,
        timeout: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        command: Command,
        reply: oneshot::Sender<Result<()>>,
    },
}

// ── Pending ───────────────────────────────────────────────────────────────────

/// The eventual result of a submitted job.
///
/// Dropping a `Pending` does not cancel the job; its result is discarded.
/// A `Pending` created after the executor stopped resolves to
/// [`Error::ExecutorStopped`].
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
    runtime: Handle,
}

impl<T: Send + 'static> Pending<T> {
    fn ready(runtime: Handle, result: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx, runtime }
    }

    /// Non-blocking check. Returns `None` while the job is still running.
    ///
    /// Once a result has been returned, later calls report
    /// [`Error::ExecutorStopped`].
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::ExecutorStopped)),
        }
    }

    /// Block the calling thread until the job finishes.
    ///
    /// Must not be called from inside an async runtime; `.await` the
    /// `Pending` there instead.
    pub fn wait(self) -> Result<T> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(Error::ExecutorStopped))
    }

    /// Run `callback` with the result once the job finishes.
    ///
    /// The callback normally runs on the transport executor thread. If the
    /// executor stops first, it runs on whichever thread tears the executor
    /// down, or immediately on the calling thread when the executor is
    /// already gone. Marshal the result onto your own thread before touching
    /// UI state. The callback runs exactly once.
    pub fn on_complete(self, callback: impl FnOnce(Result<T>) + Send + 'static) {
        let mut completion = Completion {
            rx: self.rx,
            callback: Some(Box::new(callback)),
        };
        self.runtime.spawn(async move {
            let result = (&mut completion.rx)
                .await
                .unwrap_or(Err(Error::ExecutorStopped));
            completion.finish(result);
        });
    }
}

/// A callback waiting on a job's reply.
///
/// If the task holding it is dropped without being polled to the end, which
/// happens when the runtime shuts down or was already gone at spawn time,
/// the callback still runs from `Drop` with whatever result has arrived.
struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
    callback: Option<Box<dyn FnOnce(Result<T>) + Send>>,
}

impl<T> Completion<T> {
    fn finish(&mut self, result: Result<T>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if self.callback.is_some() {
            let result = self.rx.try_recv().unwrap_or(Err(Error::ExecutorStopped));
            self.finish(result);
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(Error::ExecutorStopped)))
    }
}

// ── Bridge ────────────────────────────────────────────────────────────────────

/// Owns the transport executor thread and the shared sample store.
pub struct Bridge<D> {
    jobs: Option<mpsc::UnboundedSender<Job<D>>>,
    runtime: Handle,
    state: StateHandle,
    store: Arc<ChannelStore>,
    config: ClientConfig,
    thread: Option<JoinHandle<()>>,
}

impl<D: Clone + Send + Sync + 'static> Bridge<D> {
    /// Start the executor thread, build the transport on it with
    /// `make_transport`, and return once it is ready.
    ///
    /// `make_transport` runs on the executor so transports that need an
    /// async setup (such as [`crate::ble::BleTransport::new`]) work.
    pub fn spawn<T, F, Fut>(
        config: ClientConfig,
        listener: Arc<dyn SensorListener>,
        make_transport: F,
    ) -> Result<Self>
    where
        T: Transport<Device = D>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let store = Arc::new(ChannelStore::new(config.buffer_capacity));
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel::<Job<D>>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(Handle, StateHandle)>>();

        let thread_store = Arc::clone(&store);
        let thread_config = config.clone();
        let thread = std::thread::Builder::new()
            .name("ledsense-transport".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(Error::Io(e)));
                        return;
                    }
                };
                rt.block_on(async move {
                    let transport = match make_transport().await {
                        Ok(t) => t,
                        Err(e) => {
                            error!("transport setup failed: {e}");
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let client = SensorClient::new(transport, thread_config, thread_store, listener);
                    let _ = ready_tx.send(Ok((Handle::current(), client.state_handle())));
                    run(client, jobs_rx).await;
                });
                debug!("transport executor stopped");
            })?;

        let (runtime, state) = match ready_rx.recv() {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::ExecutorStopped);
            }
        };

        Ok(Self {
            jobs: Some(jobs_tx),
            runtime,
            state,
            store,
            config,
            thread: Some(thread),
        })
    }

    /// Start the executor around an already-built transport.
    pub fn with_transport<T>(
        transport: T,
        config: ClientConfig,
        listener: Arc<dyn SensorListener>,
    ) -> Result<Self>
    where
        T: Transport<Device = D>,
    {
        Self::spawn(config, listener, move || async move { Ok(transport) })
    }

    /// Current connection state, read without a round trip to the executor.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The store inbound records land in. Snapshots can be taken from any
    /// thread.
    pub fn store(&self) -> &Arc<ChannelStore> {
        &self.store
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn submit<T: Send + 'static>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Job<D>,
    ) -> Pending<T> {
        let (tx, rx) = oneshot::channel();
        let queued = self
            .jobs
            .as_ref()
            .map(|jobs| jobs.send(make(tx)).is_ok())
            .unwrap_or(false);
        if !queued {
            return Pending::ready(self.runtime.clone(), Err(Error::ExecutorStopped));
        }
        Pending {
            rx,
            runtime: self.runtime.clone(),
        }
    }

    fn reject_unless_idle<T: Send + 'static>(&self) -> Option<Pending<T>> {
        match self.state() {
            ConnectionState::Disconnected => None,
            other => Some(Pending::ready(
                self.runtime.clone(),
                Err(Error::InvalidState(other)),
            )),
        }
    }

    fn reject_unless_connected<T: Send + 'static>(&self) -> Option<Pending<T>> {
        if self.is_connected() {
            None
        } else {
            Some(Pending::ready(self.runtime.clone(), Err(Error::NotConnected)))
        }
    }

    /// Scan for the configured discovery window.
    pub fn scan(&self) -> Pending<Vec<D>> {
        self.scan_for(self.config.scan_timeout())
    }

    /// Scan for `timeout`. Fails immediately with [`Error::InvalidState`]
    /// unless disconnected.
    pub fn scan_for(&self, timeout: Duration) -> Pending<Vec<D>> {
        if let Some(busy) = self.reject_unless_idle() {
            return busy;
        }
        self.submit(|reply| Job::Scan { timeout, reply })
    }

    /// Connect using the configured connect timeout.
    pub fn connect(&self, device: D) -> Pending<()> {
        self.connect_with_timeout(device, self.config.connect_timeout())
    }

    /// Fails immediately with [`Error::InvalidState`] unless disconnected.
    pub fn connect_with_timeout(&self, device: D, timeout: Duration) -> Pending<()> {
        if let Some(busy) = self.reject_unless_idle() {
            return busy;
        }
        self.submit(|reply| Job::Connect {
            device,
            timeout,
            reply,
        })
    }

    /// Fails immediately with [`Error::NotConnected`] when no link is up.
    pub fn disconnect(&self) -> Pending<()> {
        if let Some(fail) = self.reject_unless_connected() {
            return fail;
        }
        self.submit(|reply| Job::Disconnect { reply })
    }

    /// Queue `command` for transmission.
    ///
    /// Fails immediately with [`Error::NotConnected`] when no link is up;
    /// no job is queued. Commands submitted back to back are sent in
    /// submission order, but callers should wait for one send to finish
    /// before issuing the next.
    pub fn send(&self, command: Command) -> Pending<()> {
        if let Some(fail) = self.reject_unless_connected() {
            return fail;
        }
        self.submit(|reply| Job::Send { command, reply })
    }

    /// Disconnect if needed, stop the executor and join its thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("transport executor panicked");
            }
        }
    }
}

impl<D> Drop for Bridge<D> {
    fn drop(&mut self) {
        // Closing the queue lets the executor finish on its own.
        self.jobs.take();
    }
}

async fn run<T: Transport>(
    mut client: SensorClient<T>,
    mut jobs: mpsc::UnboundedReceiver<Job<T::Device>>,
) {
    let mut link_loss = client.link_loss_events();
    info!("transport executor ready");
    loop {
        tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => dispatch(&mut client, job).await,
                None => break,
            },
            Some(notice) = link_loss.recv() => client.handle_link_loss(notice).await,
        }
    }
    if client.state() == ConnectionState::Connected {
        if let Err(e) = client.disconnect().await {
            debug!("disconnect on shutdown: {e}");
        }
    }
}

async fn dispatch<T: Transport>(client: &mut SensorClient<T>, job: Job<T::Device>) {
    match job {
        Job::Scan { timeout, reply } => {
            let _ = reply.send(client.scan(timeout).await);
        }
        Job::Connect {
            device,
            timeout,
            reply,
        } => {
            let _ = reply.send(client.connect(&device, timeout).await);
        }
        Job::Disconnect { reply } => {
            let _ = reply.send(client.disconnect().await);
        }
        Job::Send { command, reply } => {
            let _ = reply.send(client.send(&command).await);
        }
    }
}
