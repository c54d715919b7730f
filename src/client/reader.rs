//! [`ReaderHandle`]: the buffered reader on loan to whichever caller currently
//! holds the reader role, and the two ways it can be handed back.

use super::disconnect::disconnect_from_reader;
use super::slot::{ActiveReader, Handoff, Slot};
use super::Shared;
use crate::error::Result;
use crate::frame::Frame;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;

/// What a command wrapper tells `pass()` about the decode it just performed.
pub(crate) enum PassOutcome {
    /// The response decoded cleanly, or decoded to a server error (server
    /// errors are not connection-impacting). The reader role can continue.
    Healthy,
    /// The decode failed with an I/O error, a protocol violation, a timeout,
    /// or the read was interrupted by a close. The connection must be torn down.
    Disconnect,
}

pub(crate) struct ReaderHandle {
    active: ActiveReader,
    shared: Arc<Shared>,
}

impl ReaderHandle {
    pub(crate) fn new(active: ActiveReader, shared: Arc<Shared>) -> Self {
        Self { active, shared }
    }

    /// Reads the next frame, racing the socket read against a close-triggered
    /// interrupt. An interrupt is reported the same way any other
    /// connection-impacting failure is: the caller is expected to `pass` a
    /// [`PassOutcome::Disconnect`] in response.
    pub(crate) async fn read_frame(&mut self, deadline: Option<Duration>) -> Result<Option<Frame>> {
        tokio::select! {
            biased;
            _ = self.shared.interrupt.notified() => Err(crate::error::Error::closed()),
            result = self.active.conn.read_frame(deadline) => result,
        }
    }

    /// Relinquishes the reader role.
    pub(crate) async fn pass(self, outcome: PassOutcome) {
        let ReaderHandle { mut active, shared } = self;

        if matches!(outcome, PassOutcome::Disconnect) {
            disconnect_from_reader(shared, active).await;
            return;
        }

        if let Ok(tx) = active.queue_rx.try_recv() {
            let _ = tx.send(Handoff::Reader(active));
            return;
        }

        let mut guard = shared.slot.lock().await;
        match &mut *guard {
            Slot::Live(live) => match active.queue_rx.try_recv() {
                Ok(tx) => {
                    let _ = tx.send(Handoff::Reader(active));
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                    live.idle_reader = Some(active);
                }
            },
            Slot::Offline(_) | Slot::Closed => {
                drop(guard);
                drop(active);
                shared.retired.notify_one();
            }
        }
    }
}
