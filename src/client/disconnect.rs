//! The disconnect-from-reader routine.
//!
//! Invoked whenever the active reader has suffered a connection-impacting
//! failure (I/O error, protocol violation, timeout, or a close-triggered
//! interrupt). Must never block on the slot: its holder may itself be a
//! writer stuck trying to enqueue into a full read queue, and blocking here
//! would deadlock against it. So this drains the queue and tries the slot in
//! a loop, never holding one while waiting on the other.

use super::reconnect;
use super::slot::{ActiveReader, Handoff, Slot};
use super::Shared;

use std::sync::Arc;

pub(crate) async fn disconnect_from_reader(shared: Arc<Shared>, mut active: ActiveReader) {
    loop {
        if let Ok(tx) = active.queue_rx.try_recv() {
            let _ = tx.send(Handoff::ConnectionLost);
            continue;
        }

        match shared.slot.try_lock() {
            Ok(mut guard) => {
                if matches!(&*guard, Slot::Closed) {
                    drop(guard);
                    shared.retired.notify_one();
                    return;
                }

                *guard = Slot::Offline("connection lost".to_string());
                drop(guard);

                // A writer may have enqueued a waiter for this connection in the
                // gap between our last drain and taking the slot; catch it.
                while let Ok(tx) = active.queue_rx.try_recv() {
                    let _ = tx.send(Handoff::ConnectionLost);
                }

                shared.retired.notify_one();
                tokio::spawn(reconnect::run(shared.clone()));
                return;
            }
            Err(_) => {
                tokio::task::yield_now().await;
            }
        }
    }
}
