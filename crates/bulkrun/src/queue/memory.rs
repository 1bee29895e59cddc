use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::{JobDescriptor, QueueError, WorkQueue};

/// In-process queue for embedding and tests. Cloning shares the channel.
#[derive(Clone)]
pub struct ChannelQueue {
    sender: Sender<JobDescriptor>,
    receiver: Receiver<JobDescriptor>,
}

impl ChannelQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }
}

impl Default for ChannelQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue for ChannelQueue {
    fn enqueue(&self, descriptor: &JobDescriptor) -> Result<(), QueueError> {
        self.sender
            .send(descriptor.clone())
            .map_err(|_| QueueError::Closed)
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<JobDescriptor>, QueueError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Closed),
        }
    }

    fn length(&self) -> Result<usize, QueueError> {
        Ok(self.receiver.len())
    }
}
