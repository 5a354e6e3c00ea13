//! Change notifications emitted by the tree and the job queue.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::node::NodeId;

/// A single change notification.
///
/// Node-carrying events reference arena ids; a subscriber reacting to
/// `DeletingChild` must resolve the id before the deletion completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEvent {
    /// The first job was enqueued; reading is underway.
    StartingReading,
    /// Both the runnable and the blocked job sets are empty.
    Finished,
    /// Reading was cancelled; affected directories are `Aborted`.
    Aborted,
    /// The whole tree is about to be dropped and rebuilt.
    Clearing,
    /// A node was inserted.
    ChildAdded(NodeId),
    /// A node is about to be removed.
    DeletingChild(NodeId),
    /// A directory's read state just became terminal.
    ReadJobFinished(NodeId),
    /// Emitted just before a directory transitions to its terminal state.
    FinalizeLocal(NodeId),
}

/// Fan-out of [`TreeEvent`]s to any number of subscribers.
///
/// Disconnected subscribers are dropped on the next emission.
#[derive(Debug, Default)]
pub(crate) struct EventHub {
    senders: Vec<Sender<TreeEvent>>,
}

impl EventHub {
    pub(crate) fn subscribe(&mut self) -> Receiver<TreeEvent> {
        let (tx, rx) = unbounded();
        self.senders.push(tx);
        rx
    }

    pub(crate) fn emit(&mut self, event: TreeEvent) {
        self.senders.retain(|tx| tx.send(event).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_reach_all_subscribers() {
        let mut hub = EventHub::default();
        let rx1 = hub.subscribe();
        let rx2 = hub.subscribe();

        hub.emit(TreeEvent::StartingReading);

        assert_eq!(rx1.try_recv(), Ok(TreeEvent::StartingReading));
        assert_eq!(rx2.try_recv(), Ok(TreeEvent::StartingReading));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let mut hub = EventHub::default();
        let rx = hub.subscribe();
        drop(hub.subscribe());

        hub.emit(TreeEvent::Finished);
        assert_eq!(hub.senders.len(), 1);
        assert_eq!(rx.try_recv(), Ok(TreeEvent::Finished));
    }
}
