//! The connection slot and the handoff machinery that moves the reader role
//! between callers.

use crate::conn::{ConnReader, ConnWriter};

use tokio::sync::{mpsc, oneshot};

/// A single-cell container holding the one live connection, an offline error,
/// or the terminal closed sentinel. Doubles as the write lock: holding the
/// `tokio::sync::Mutex<Slot>` guard *is* taking the slot.
pub(crate) enum Slot {
    Live(LiveSlot),
    Offline(String),
    Closed,
}

pub(crate) struct LiveSlot {
    pub(crate) writer: ConnWriter,
    /// The producing half of the read queue. Cloned freely; every writer that
    /// doesn't win the reader role enqueues a handoff cell here.
    pub(crate) read_tx: mpsc::Sender<HandoffTx>,
    /// Present iff no reader is currently active.
    pub(crate) idle_reader: Option<ActiveReader>,
}

/// The buffered reader while it is either parked as the idle token or on loan
/// to whichever caller currently holds the reader role. `queue_rx` is the
/// consuming half of the read queue; only one task can hold it at a time,
/// which is what makes "holds `ActiveReader`" equivalent to "holds the reader
/// role".
pub(crate) struct ActiveReader {
    pub(crate) conn: ConnReader,
    pub(crate) queue_rx: mpsc::Receiver<HandoffTx>,
}

/// What a queued caller receives once the reader gets to them.
pub(crate) enum Handoff {
    Reader(ActiveReader),
    ConnectionLost,
}

pub(crate) type HandoffTx = oneshot::Sender<Handoff>;

/// Read-queue capacity: sized to track typical in-flight pipelining without
/// unbounded memory. Unix domain sockets get a larger queue since
/// they're commonly used for very high fan-in local workloads.
pub(crate) const TCP_QUEUE_CAPACITY: usize = 128;
pub(crate) const UNIX_QUEUE_CAPACITY: usize = 512;
