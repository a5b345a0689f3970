use crate::model::MessageDescriptor;
use std::collections::VecDeque;

/// Per-(queue, region) FIFO of inflight descriptors, owned exclusively by
/// the queue actor. Amortizes storage reads across many small `get_next`
/// calls; `len()` counts exactly the descriptors held here, nothing that is
/// merely durable in the inflight table.
#[derive(Debug)]
pub struct MessageBuffer {
    items: VecDeque<MessageDescriptor>,
    target: usize,
}

impl MessageBuffer {
    pub fn new(target: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(target),
            target,
        }
    }

    pub fn append(&mut self, batch: Vec<MessageDescriptor>) {
        self.items.extend(batch);
    }

    pub fn poll_up_to(&mut self, n: usize) -> Vec<MessageDescriptor> {
        let take = n.min(self.items.len());
        self.items.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// How many descriptors a refresh may still add before the upper bound.
    pub fn remaining_capacity(&self) -> usize {
        self.target.saturating_sub(self.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeuuid::TimeUuid;
    use uuid::Uuid;

    fn descriptor() -> MessageDescriptor {
        MessageDescriptor {
            queue_message_id: TimeUuid::now(),
            message_id: Uuid::new_v4(),
            shard_id: 0,
            queued_at_ms: 0,
            inflight_at_ms: 0,
            n_returned: 0,
        }
    }

    #[test]
    fn polls_in_fifo_order() {
        let mut buf = MessageBuffer::new(10);
        let batch: Vec<_> = (0..3).map(|_| descriptor()).collect();
        buf.append(batch.clone());

        assert_eq!(buf.poll_up_to(2), batch[..2].to_vec());
        assert_eq!(buf.poll_up_to(2), batch[2..].to_vec());
        assert!(buf.is_empty());
    }

    #[test]
    fn poll_never_blocks_on_a_short_buffer() {
        let mut buf = MessageBuffer::new(10);
        buf.append(vec![descriptor()]);
        assert_eq!(buf.poll_up_to(25).len(), 1);
        assert_eq!(buf.poll_up_to(25).len(), 0);
    }

    #[test]
    fn remaining_capacity_tracks_the_target() {
        let mut buf = MessageBuffer::new(4);
        assert_eq!(buf.remaining_capacity(), 4);
        buf.append((0..3).map(|_| descriptor()).collect());
        assert_eq!(buf.remaining_capacity(), 1);
        buf.append((0..3).map(|_| descriptor()).collect());
        // append does not enforce the target; capacity just clamps at 0.
        assert_eq!(buf.remaining_capacity(), 0);
        assert_eq!(buf.len(), 6);
    }
}
