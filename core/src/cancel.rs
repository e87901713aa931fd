use std::convert::Infallible;
use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use crate::error::Error;
use crate::listener::{Listener, PeerConn};

/// Create a one-shot cancellation pair.
///
/// The [`CancelToken`] fires when [`Canceller::cancel`] runs (or the
/// `Canceller` is dropped); tokens are cheap to clone and hand to every
/// accept loop that should stop together.
pub fn cancellation() -> (Canceller, CancelToken) {
    // Zero-capacity channel: the token observes the sender disappearing,
    // nothing is ever actually sent.
    let (tx, rx) = bounded::<Infallible>(0);
    (
        Canceller {
            tx: Mutex::new(Some(tx)),
        },
        CancelToken { rx },
    )
}

/// The firing half of a cancellation pair.
pub struct Canceller {
    tx: Mutex<Option<Sender<Infallible>>>,
}

impl Canceller {
    /// Fire the cancellation. Idempotent; later calls are no-ops.
    pub fn cancel(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

/// The observing half of a cancellation pair.
#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<Infallible>,
}

impl CancelToken {
    /// Whether the pair has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub(crate) fn receiver(&self) -> &Receiver<Infallible> {
        &self.rx
    }
}

impl Listener {
    /// Accept one connection, racing the blocking accept against `token`.
    ///
    /// If the token fires first the listener is closed to force the
    /// blocking accept call to return, and [`Error::Cancelled`] is
    /// returned in place of the `Closed` noise the forced unblock
    /// produces. Closing is the only way to unblock a pending accept, so
    /// a cancelled listener accepts no further connections afterward.
    ///
    /// If the accept wins, its result is returned untouched and the
    /// watcher joins before this call returns, so the losing wait leaks
    /// nothing.
    ///
    /// Callers that never cancel can use [`Listener::accept`] directly,
    /// which is the plain blocking form.
    pub fn accept_with_cancel(&self, token: &CancelToken) -> Result<PeerConn, Error> {
        thread::scope(|scope| {
            let (done_tx, done_rx) = bounded::<()>(0);
            let cancel_rx = token.receiver().clone();

            scope.spawn(move || {
                crossbeam_channel::select! {
                    recv(cancel_rx) -> _ => {
                        tracing::debug!("accept cancelled, closing listener to unblock");
                        let _ = self.close();
                    }
                    recv(done_rx) -> _ => {}
                }
            });

            let result = self.accept();
            // Dropping the sender wakes the watcher's done branch.
            drop(done_tx);

            match result {
                Err(_) if token.is_cancelled() => Err(Error::Cancelled),
                other => other,
            }
        })
    }
}
