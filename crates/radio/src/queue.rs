//! Bounded priority queue of out-of-band commands

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use tokio::sync::Mutex;

use crate::framing::{Command, Frame};
use crate::RadioError;

/// Lowest priority; 0 is the highest.
pub const LOWEST_PRIORITY: u8 = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    pub command: Command,
    pub address: u8,
    pub priority: u8,
    pub payload: Vec<u8>,
    pub enqueued_at: Instant,
}

/// Result of executing one queued command.
#[derive(Debug)]
pub struct CommandOutcome {
    pub command: QueuedCommand,
    /// `Ok(None)` when the retry budget ran out.
    pub reply: Result<Option<Frame>, RadioError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub enqueued: u64,
    pub evicted: u64,
    pub rejected: u64,
}

/// Entries are ordered by `(priority, insertion sequence)`, so equal
/// priorities come out first-in first-out.
#[derive(Debug)]
pub struct CommandQueue {
    entries: BTreeMap<(u8, u64), QueuedCommand>,
    capacity: usize,
    next_seq: u64,
    counters: QueueCounters,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: capacity.max(1),
            next_seq: 0,
            counters: QueueCounters::default(),
        }
    }

    /// Returns `false` when the queue is full and the new entry does not
    /// outrank the worst queued one. A full queue evicts its worst entry to
    /// admit a strictly higher-priority command.
    pub fn enqueue(
        &mut self,
        command: Command,
        address: u8,
        priority: u8,
        payload: Vec<u8>,
    ) -> Result<bool, RadioError> {
        if priority > LOWEST_PRIORITY {
            return Err(RadioError::InvalidPriority(priority));
        }

        if self.entries.len() >= self.capacity {
            let worst = self.entries.keys().next_back().copied();
            match worst {
                Some(key) if priority < key.0 => {
                    if let Some(evicted) = self.entries.remove(&key) {
                        self.counters.evicted += 1;
                        warn!(
                            target: "queue",
                            "queue full, evicted {:?} for unit {} (priority {})",
                            evicted.command, evicted.address, evicted.priority
                        );
                    }
                }
                _ => {
                    self.counters.rejected += 1;
                    warn!(
                        target: "queue",
                        "queue full, dropped {:?} for unit {} (priority {})",
                        command, address, priority
                    );
                    return Ok(false);
                }
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            (priority, seq),
            QueuedCommand {
                command,
                address,
                priority,
                payload,
                enqueued_at: Instant::now(),
            },
        );
        self.counters.enqueued += 1;
        debug!(target: "queue", "queued {:?} for unit {} ({} pending)", command, address, self.entries.len());
        Ok(true)
    }

    pub fn dequeue(&mut self) -> Option<QueuedCommand> {
        self.entries.pop_first().map(|(_, cmd)| cmd)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn counters(&self) -> QueueCounters {
        self.counters
    }
}

/// Cloneable producer handle for code outside the polling path.
#[derive(Debug, Clone)]
pub struct CommandSender {
    queue: Arc<Mutex<CommandQueue>>,
}

impl CommandSender {
    pub(crate) fn new(queue: Arc<Mutex<CommandQueue>>) -> Self {
        Self { queue }
    }

    pub async fn enqueue(
        &self,
        command: Command,
        address: u8,
        priority: u8,
        payload: Vec<u8>,
    ) -> Result<bool, RadioError> {
        self.queue.lock().await.enqueue(command, address, priority, payload)
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(priorities: &[u8]) -> CommandQueue {
        let mut queue = CommandQueue::new(priorities.len());
        for (i, &p) in priorities.iter().enumerate() {
            assert!(queue.enqueue(Command::GetStatus, i as u8 + 1, p, vec![]).unwrap());
        }
        queue
    }

    #[test]
    fn test_priority_order_with_fifo_ties() {
        let mut queue = CommandQueue::new(10);
        queue.enqueue(Command::GetStatus, 1, 5, vec![]).unwrap();
        queue.enqueue(Command::Ping, 2, 0, vec![]).unwrap();
        queue.enqueue(Command::GetStatus, 3, 5, vec![]).unwrap();
        queue.enqueue(Command::SetMode, 4, 5, vec![1]).unwrap();

        let order: Vec<u8> = std::iter::from_fn(|| queue.dequeue()).map(|c| c.address).collect();
        assert_eq!(order, vec![2, 1, 3, 4]);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_full_queue_rejects_lower_priority() {
        let mut queue = filled(&[2, 3, 4, 5, 2, 3, 4, 5, 2, 3]);
        assert_eq!(queue.len(), 10);

        assert!(!queue.enqueue(Command::GetStatus, 42, 7, vec![]).unwrap());
        // equal to the worst is not strictly higher
        assert!(!queue.enqueue(Command::GetStatus, 43, 5, vec![]).unwrap());

        assert_eq!(queue.len(), 10);
        assert_eq!(queue.counters().rejected, 2);
        assert_eq!(queue.counters().evicted, 0);
    }

    #[test]
    fn test_full_queue_evicts_worst_for_higher_priority() {
        let mut queue = filled(&[1, 8, 8, 3]);
        assert!(queue.enqueue(Command::Ping, 99, 0, vec![]).unwrap());
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.counters().evicted, 1);

        let order: Vec<(u8, u8)> = std::iter::from_fn(|| queue.dequeue())
            .map(|c| (c.priority, c.address))
            .collect();
        // the most recently queued priority-8 entry (address 3) was evicted
        assert_eq!(order, vec![(0, 99), (1, 1), (3, 4), (8, 2)]);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut queue = CommandQueue::new(10);
        for i in 0..200u32 {
            let priority = (i * 7 % 10) as u8;
            queue.enqueue(Command::GetStatus, 1, priority, vec![]).unwrap();
            assert!(queue.len() <= 10);
            if i % 13 == 0 {
                queue.dequeue();
            }
        }
    }

    #[test]
    fn test_invalid_priority() {
        let mut queue = CommandQueue::new(2);
        assert!(matches!(
            queue.enqueue(Command::Ping, 1, 10, vec![]),
            Err(RadioError::InvalidPriority(10))
        ));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_sender_shares_queue() {
        let queue = Arc::new(Mutex::new(CommandQueue::new(4)));
        let sender = CommandSender::new(queue.clone());
        let other = sender.clone();

        assert!(sender.enqueue(Command::Ping, 1, 3, vec![]).await.unwrap());
        assert!(other.enqueue(Command::Ping, 2, 1, vec![]).await.unwrap());
        assert_eq!(sender.pending().await, 2);

        let first = queue.lock().await.dequeue().unwrap();
        assert_eq!(first.address, 2);
    }
}
