//! Mailbox of delivered user messages

use cohort_types::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// FIFO inbox filled by the dispatch task and drained by the application
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
    available: Notify,
}

impl Mailbox {
    /// Empty mailbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delivered message; never blocks
    pub fn push(&self, message: Message) {
        self.queue.lock().push_back(message);
        self.available.notify_one();
    }

    /// Remove and return the oldest message, waiting until one exists
    ///
    /// Each pushed message is returned by exactly one `pop`.
    pub async fn pop(&self) -> Message {
        loop {
            if let Some(message) = self.try_pop() {
                return message;
            }
            // A push between the check and this await leaves a stored permit,
            // so the wakeup is not lost.
            self.available.notified().await;
        }
    }

    /// Remove the oldest message if there is one
    pub fn try_pop(&self) -> Option<Message> {
        self.queue.lock().pop_front()
    }

    /// Whether nothing is waiting to be read
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Number of messages waiting
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}
