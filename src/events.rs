use tokio::sync::broadcast;

use crate::types::BlockId;

/// Events published synchronously while the coordinator processes a block.
/// Observers must not assume post-event storage visibility until the
/// enclosing block application completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeViewEvent {
    SemanticallySuccessfulModifier(BlockId),
    SemanticallyFailedModifier(BlockId, String),
    SyntacticallyFailedModification(BlockId, String),
    RollbackFailed(String),
    DownloadRequested(Vec<BlockId>),
}

#[derive(Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<NodeViewEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeViewEvent> {
        self.sender.subscribe()
    }

    /// Lagging or absent subscribers never fail the publisher.
    pub fn publish(&self, event: NodeViewEvent) {
        let _ = self.sender.send(event);
    }
}
