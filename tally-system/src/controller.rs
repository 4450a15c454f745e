use std::io;
use std::sync::LazyLock;
use std::time::Duration;

use tokio::sync::watch;

/// Determines how to shut down the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Shut down gracefully within the configured shutdown timeout.
    ///
    /// Services flush their pending work before they terminate.
    Graceful,
    /// Shut down as quickly as possible without flushing.
    Immediate,
}

/// Shutdown request message sent by the [`Controller`] to subscribed services.
///
/// A handler has to ensure that it doesn't take longer than `timeout` to resolve the future.
/// Ideally, open work is persisted or finished in an orderly manner but no new requests are
/// accepted anymore.
///
/// After the timeout the process will shut down regardless of what the receivers of this message
/// do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

/// Global broadcast of the current shutdown state.
static SHUTDOWN: LazyLock<watch::Sender<Option<Shutdown>>> =
    LazyLock::new(|| watch::channel(None).0);

/// Notifies a service about an upcoming shutdown.
///
/// Obtain a handle via [`Controller::shutdown_handle`] and await [`notified`](Self::notified)
/// inside the service loop, typically as a branch of `tokio::select!`.
#[derive(Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Returns the current shutdown state without waiting.
    pub fn get(&self) -> Option<Shutdown> {
        self.0.borrow().clone()
    }

    /// Waits until a shutdown has been initiated and returns it.
    ///
    /// Resolves immediately if a shutdown is already in progress. Once this has returned, later
    /// calls wait for a changed shutdown request, such as an escalation from graceful to
    /// immediate.
    pub async fn notified(&mut self) -> Shutdown {
        loop {
            if let Some(shutdown) = self.0.borrow_and_update().clone() {
                return shutdown;
            }

            if self.0.changed().await.is_err() {
                return Shutdown { timeout: None };
            }
        }
    }
}

/// Service to start and gracefully stop the system runtime.
///
/// The controller listens for process signals and broadcasts a [`Shutdown`] to every service that
/// holds a [`ShutdownHandle`]:
///
///  - `SIGINT` and `SIGQUIT` request an immediate shutdown.
///  - `SIGTERM` requests a graceful shutdown with the configured timeout.
///
/// ### Example
///
/// ```
/// use std::time::Duration;
///
/// use tally_system::{Controller, Service, ShutdownHandle};
///
/// struct FlushOnShutdown;
///
/// impl Service for FlushOnShutdown {
///     type Interface = ();
///
///     async fn run(self, mut rx: tally_system::Receiver<()>) {
///         let mut shutdown = Controller::shutdown_handle();
///         loop {
///             tokio::select! {
///                 Some(()) = rx.recv() => (),
///                 _ = shutdown.notified() => break,
///                 else => break,
///             }
///         }
///     }
/// }
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// Controller::start(Duration::from_secs(10));
/// FlushOnShutdown.start_detached();
/// # });
/// ```
#[derive(Debug)]
pub struct Controller;

impl Controller {
    /// Starts a controller that monitors process signals in the current runtime.
    pub fn start(shutdown_timeout: Duration) {
        tokio::spawn(async move {
            if let Err(error) = monitor_signals(shutdown_timeout).await {
                tally_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to listen for process signals"
                );
            }
        });
    }

    /// Returns a [handle](ShutdownHandle) to receive shutdown notifications.
    pub fn shutdown_handle() -> ShutdownHandle {
        ShutdownHandle(SHUTDOWN.subscribe())
    }

    /// Initiates a shutdown of all services holding a [`ShutdownHandle`].
    ///
    /// A graceful shutdown carries `timeout`, an immediate one carries none.
    pub fn shutdown(mode: ShutdownMode, timeout: Duration) {
        let timeout = match mode {
            ShutdownMode::Graceful => Some(timeout),
            ShutdownMode::Immediate => None,
        };

        SHUTDOWN.send_replace(Some(Shutdown { timeout }));
    }
}

#[cfg(unix)]
async fn monitor_signals(timeout: Duration) -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_quit = signal(SignalKind::quit())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    loop {
        let mode = tokio::select! {
            biased;

            Some(()) = sig_int.recv() => {
                tally_log::info!("SIGINT received, exiting");
                ShutdownMode::Immediate
            }
            Some(()) = sig_quit.recv() => {
                tally_log::info!("SIGQUIT received, exiting");
                ShutdownMode::Immediate
            }
            Some(()) = sig_term.recv() => {
                tally_log::info!("SIGTERM received, stopping in {}s", timeout.as_secs());
                ShutdownMode::Graceful
            }
            else => return Ok(()),
        };

        Controller::shutdown(mode, timeout);
    }
}

#[cfg(not(unix))]
async fn monitor_signals(timeout: Duration) -> io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        tally_log::info!("ctrl-c received, stopping in {}s", timeout.as_secs());
        Controller::shutdown(ShutdownMode::Graceful, timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_notifies_handles() {
        let mut before = Controller::shutdown_handle();
        assert_eq!(before.get(), None);

        let waiter = tokio::spawn(async move { before.notified().await });
        tokio::task::yield_now().await;

        Controller::shutdown(ShutdownMode::Graceful, Duration::from_secs(3));
        let shutdown = waiter.await.unwrap();
        assert_eq!(shutdown.timeout, Some(Duration::from_secs(3)));

        // Handles created after the shutdown resolve immediately.
        let mut after = Controller::shutdown_handle();
        assert_eq!(after.notified().await, shutdown);
    }
}
