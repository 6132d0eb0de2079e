use std::collections::{HashMap, VecDeque};

use generational_arena::Index;

use crate::error::{Result, RuntimeError};

/// Refers to a channel in the scheduler's registry. The generation tag makes
/// handles to a since-removed channel fail instead of aliasing a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub(crate) id: u64,
    pub(crate) generation: u32,
}

#[derive(Debug)]
struct ChannelEntry {
    generation: u32,
    msg_size: usize,
    capacity: usize,
    buffer: VecDeque<Box<[u8]>>,
    waiting_senders: VecDeque<(Index, Box<[u8]>)>,
    waiting_receivers: VecDeque<Index>,
    closed: bool,
}

/// What a send did, when it didn't fail outright.
#[derive(Debug)]
pub(crate) enum SendOutcome {
    /// A receiver was already waiting; wake it with this message.
    Rendezvous { receiver: Index, msg: Box<[u8]> },
    /// The message fit in the ring buffer.
    Buffered,
    /// No counterpart and no buffer space; the sender was enqueued with its
    /// message and must block.
    Parked,
}

/// What a receive did, when it didn't fail outright.
#[derive(Debug)]
pub(crate) enum RecvOutcome {
    /// A message was available. If taking it freed buffer space that a
    /// parked sender's message moved into, that sender must be woken.
    Delivered { msg: Box<[u8]>, unparked_sender: Option<Index> },
    /// Nothing available; the receiver was enqueued and must block.
    Parked,
}

/// Everyone still blocked on a channel at the moment it closed. Each gets
/// woken with `ChannelClosed`, in their FIFO wait order.
#[derive(Debug, Default)]
pub(crate) struct ClosedWaiters {
    pub senders: Vec<Index>,
    pub receivers: Vec<Index>,
}

/// Registry of all live channels, owned by the scheduler.
///
/// An entry lives until the channel is closed and its buffer drained, then
/// it is removed; ids are never reused, so handles to a reclaimed channel
/// keep failing as `ChannelClosed`.
///
/// Pairing discipline: the longest-waiting sender always meets the
/// longest-waiting receiver. Both wait queues are strictly FIFO, which is
/// what keeps deadline-ordered wakeups deterministic when several sleepers
/// report through one channel.
#[derive(Debug, Default)]
pub(crate) struct ChannelTable {
    entries: HashMap<u64, ChannelEntry>,
    next_id: u64,
    next_generation: u32,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, msg_size: usize, capacity: usize) -> ChannelHandle {
        let id = self.next_id;
        self.next_id += 1;
        let generation = self.next_generation;
        self.next_generation += 1;

        self.entries.insert(
            id,
            ChannelEntry {
                generation,
                msg_size,
                capacity,
                buffer: VecDeque::new(),
                waiting_senders: VecDeque::new(),
                waiting_receivers: VecDeque::new(),
                closed: false,
            },
        );
        ChannelHandle { id, generation }
    }

    fn entry_mut(&mut self, handle: ChannelHandle) -> Result<&mut ChannelEntry> {
        match self.entries.get_mut(&handle.id) {
            Some(entry) if entry.generation == handle.generation => Ok(entry),
            // Reclaimed entry or stale generation: the channel this handle
            // referred to is gone.
            _ => Err(RuntimeError::ChannelClosed),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn send(
        &mut self,
        handle: ChannelHandle,
        sender: Index,
        msg: Box<[u8]>,
    ) -> Result<SendOutcome> {
        let entry = self.entry_mut(handle)?;

        if msg.len() != entry.msg_size {
            return Err(RuntimeError::SizeMismatch {
                expected: entry.msg_size,
                got: msg.len(),
            });
        }
        if entry.closed {
            return Err(RuntimeError::ChannelClosed);
        }

        // Direct handoff to the longest-waiting receiver.
        if let Some(receiver) = entry.waiting_receivers.pop_front() {
            return Ok(SendOutcome::Rendezvous { receiver, msg });
        }

        if entry.buffer.len() < entry.capacity {
            entry.buffer.push_back(msg);
            return Ok(SendOutcome::Buffered);
        }

        // Unbuffered or full: park with the message until a receiver shows.
        entry.waiting_senders.push_back((sender, msg));
        Ok(SendOutcome::Parked)
    }

    pub fn recv(&mut self, handle: ChannelHandle, receiver: Index, len: usize) -> Result<RecvOutcome> {
        let entry = self.entry_mut(handle)?;

        if len != entry.msg_size {
            return Err(RuntimeError::SizeMismatch {
                expected: entry.msg_size,
                got: len,
            });
        }

        // Buffered messages drain first; a parked sender's message slides
        // into the slot this receive frees up.
        if let Some(msg) = entry.buffer.pop_front() {
            let unparked_sender = match entry.waiting_senders.pop_front() {
                Some((sender, pending)) => {
                    entry.buffer.push_back(pending);
                    Some(sender)
                }
                None => None,
            };
            // Last buffered message out of a closed channel retires the
            // entry; its id is never reused.
            if entry.closed && entry.buffer.is_empty() {
                self.entries.remove(&handle.id);
            }
            return Ok(RecvOutcome::Delivered { msg, unparked_sender });
        }

        // Rendezvous with the longest-waiting sender.
        if let Some((sender, msg)) = entry.waiting_senders.pop_front() {
            return Ok(RecvOutcome::Delivered { msg, unparked_sender: Some(sender) });
        }

        if entry.closed {
            return Err(RuntimeError::ChannelClosed);
        }

        entry.waiting_receivers.push_back(receiver);
        Ok(RecvOutcome::Parked)
    }

    /// Mark the channel closed and hand back every parked coroutine so the
    /// scheduler can fail their waits. Closing twice is a no-op. The entry
    /// itself is reclaimed as soon as its buffer is empty.
    pub fn close(&mut self, handle: ChannelHandle) -> Result<ClosedWaiters> {
        if !self.entries.contains_key(&handle.id) {
            // Already closed and reclaimed.
            return Ok(ClosedWaiters::default());
        }
        let entry = self.entry_mut(handle)?;
        if entry.closed {
            return Ok(ClosedWaiters::default());
        }
        entry.closed = true;
        let waiters = ClosedWaiters {
            senders: entry.waiting_senders.drain(..).map(|(idx, _)| idx).collect(),
            receivers: entry.waiting_receivers.drain(..).collect(),
        };
        if entry.buffer.is_empty() {
            self.entries.remove(&handle.id);
        }
        Ok(waiters)
    }

    /// Drop `coro` from the channel's wait queues (cancellation path).
    /// Returns whether it was actually waiting there.
    pub fn remove_waiter(&mut self, handle: ChannelHandle, coro: Index) -> bool {
        let entry = match self.entry_mut(handle) {
            Ok(entry) => entry,
            Err(_) => return false,
        };
        if let Some(pos) = entry.waiting_senders.iter().position(|(idx, _)| *idx == coro) {
            entry.waiting_senders.remove(pos);
            return true;
        }
        if let Some(pos) = entry.waiting_receivers.iter().position(|idx| *idx == coro) {
            entry.waiting_receivers.remove(pos);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use generational_arena::Arena;

    fn coros(n: usize) -> Vec<Index> {
        let mut arena = Arena::new();
        (0..n).map(|_| arena.insert(())).collect()
    }

    fn msg(byte: u8) -> Box<[u8]> {
        vec![byte; 4].into_boxed_slice()
    }

    #[test]
    fn rendezvous_pairs_fifo() {
        let c = coros(3);
        let mut table = ChannelTable::new();
        let ch = table.create(4, 0);

        // Two receivers park in order.
        assert!(matches!(table.recv(ch, c[0], 4), Ok(RecvOutcome::Parked)));
        assert!(matches!(table.recv(ch, c[1], 4), Ok(RecvOutcome::Parked)));

        // First send pairs with the longest-waiting receiver.
        match table.send(ch, c[2], msg(7)).unwrap() {
            SendOutcome::Rendezvous { receiver, msg } => {
                assert_eq!(receiver, c[0]);
                assert_eq!(&msg[..], &[7, 7, 7, 7]);
            }
            other => panic!("expected rendezvous, got {:?}", other),
        }
        match table.send(ch, c[2], msg(9)).unwrap() {
            SendOutcome::Rendezvous { receiver, .. } => assert_eq!(receiver, c[1]),
            other => panic!("expected rendezvous, got {:?}", other),
        }
    }

    #[test]
    fn unbuffered_send_parks_until_receive() {
        let c = coros(2);
        let mut table = ChannelTable::new();
        let ch = table.create(4, 0);

        assert!(matches!(table.send(ch, c[0], msg(1)), Ok(SendOutcome::Parked)));
        match table.recv(ch, c[1], 4).unwrap() {
            RecvOutcome::Delivered { msg, unparked_sender } => {
                assert_eq!(&msg[..], &[1, 1, 1, 1]);
                assert_eq!(unparked_sender, Some(c[0]));
            }
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[test]
    fn buffered_sends_complete_until_full() {
        let c = coros(2);
        let mut table = ChannelTable::new();
        let ch = table.create(4, 2);

        assert!(matches!(table.send(ch, c[0], msg(1)), Ok(SendOutcome::Buffered)));
        assert!(matches!(table.send(ch, c[0], msg(2)), Ok(SendOutcome::Buffered)));
        assert!(matches!(table.send(ch, c[0], msg(3)), Ok(SendOutcome::Parked)));

        // Receiving frees a slot; the parked sender's message moves in.
        match table.recv(ch, c[1], 4).unwrap() {
            RecvOutcome::Delivered { msg, unparked_sender } => {
                assert_eq!(&msg[..], &[1, 1, 1, 1]);
                assert_eq!(unparked_sender, Some(c[0]));
            }
            other => panic!("expected delivery, got {:?}", other),
        }
        // Buffer order preserved.
        match table.recv(ch, c[1], 4).unwrap() {
            RecvOutcome::Delivered { msg, unparked_sender } => {
                assert_eq!(&msg[..], &[2, 2, 2, 2]);
                assert_eq!(unparked_sender, None);
            }
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[test]
    fn size_mismatch_rejected_without_queue_damage() {
        let c = coros(2);
        let mut table = ChannelTable::new();
        let ch = table.create(4, 0);

        assert_eq!(
            table.send(ch, c[0], vec![0u8; 8].into_boxed_slice()).unwrap_err(),
            RuntimeError::SizeMismatch { expected: 4, got: 8 }
        );
        assert_eq!(
            table.recv(ch, c[1], 2).unwrap_err(),
            RuntimeError::SizeMismatch { expected: 4, got: 2 }
        );

        // The queues are untouched; a correct pair still rendezvouses.
        assert!(matches!(table.send(ch, c[0], msg(5)), Ok(SendOutcome::Parked)));
        assert!(matches!(
            table.recv(ch, c[1], 4),
            Ok(RecvOutcome::Delivered { .. })
        ));
    }

    #[test]
    fn close_reports_all_waiters_in_order() {
        let c = coros(3);
        let mut table = ChannelTable::new();
        let ch = table.create(4, 0);

        // One parked receiver on ch, one parked sender on ch2.
        table.recv(ch, c[0], 4).unwrap();
        let ch2 = table.create(4, 0);
        table.send(ch2, c[1], msg(1)).unwrap();

        let waiters = table.close(ch).unwrap();
        assert_eq!(waiters.receivers, vec![c[0]]);
        assert!(waiters.senders.is_empty());

        let waiters = table.close(ch2).unwrap();
        assert_eq!(waiters.senders, vec![c[1]]);

        // Idempotent.
        let again = table.close(ch).unwrap();
        assert!(again.senders.is_empty() && again.receivers.is_empty());
    }

    #[test]
    fn closed_channel_fails_both_sides() {
        let c = coros(1);
        let mut table = ChannelTable::new();
        let ch = table.create(4, 1);

        table.send(ch, c[0], msg(1)).unwrap();
        table.close(ch).unwrap();

        assert_eq!(table.send(ch, c[0], msg(2)).unwrap_err(), RuntimeError::ChannelClosed);
        // Buffered messages still drain after close.
        assert!(matches!(table.recv(ch, c[0], 4), Ok(RecvOutcome::Delivered { .. })));
        assert_eq!(table.recv(ch, c[0], 4).unwrap_err(), RuntimeError::ChannelClosed);
    }

    #[test]
    fn close_reclaims_an_empty_channel() {
        let c = coros(1);
        let mut table = ChannelTable::new();
        let ch = table.create(4, 0);
        assert_eq!(table.len(), 1);

        table.close(ch).unwrap();
        assert_eq!(table.len(), 0);

        // The handle keeps failing as closed, and close stays idempotent.
        assert_eq!(table.send(ch, c[0], msg(1)).unwrap_err(), RuntimeError::ChannelClosed);
        assert_eq!(table.recv(ch, c[0], 4).unwrap_err(), RuntimeError::ChannelClosed);
        let again = table.close(ch).unwrap();
        assert!(again.senders.is_empty() && again.receivers.is_empty());
    }

    #[test]
    fn draining_a_closed_channel_reclaims_it() {
        let c = coros(1);
        let mut table = ChannelTable::new();
        let ch = table.create(4, 2);

        table.send(ch, c[0], msg(1)).unwrap();
        table.send(ch, c[0], msg(2)).unwrap();
        table.close(ch).unwrap();
        // Buffered messages keep the entry alive until drained.
        assert_eq!(table.len(), 1);

        table.recv(ch, c[0], 4).unwrap();
        assert_eq!(table.len(), 1);
        table.recv(ch, c[0], 4).unwrap();
        assert_eq!(table.len(), 0);
        assert_eq!(table.recv(ch, c[0], 4).unwrap_err(), RuntimeError::ChannelClosed);
    }

    #[test]
    fn stale_generation_behaves_closed() {
        let c = coros(1);
        let mut table = ChannelTable::new();
        let ch = table.create(4, 0);
        let stale = ChannelHandle { id: ch.id, generation: ch.generation + 1 };

        assert_eq!(table.send(stale, c[0], msg(0)).unwrap_err(), RuntimeError::ChannelClosed);
        assert_eq!(table.recv(stale, c[0], 4).unwrap_err(), RuntimeError::ChannelClosed);
        assert!(table.close(stale).is_err());
    }

    #[test]
    fn remove_waiter_unlinks_exactly_one() {
        let c = coros(2);
        let mut table = ChannelTable::new();
        let ch = table.create(4, 0);

        table.recv(ch, c[0], 4).unwrap();
        table.recv(ch, c[1], 4).unwrap();

        assert!(table.remove_waiter(ch, c[0]));
        assert!(!table.remove_waiter(ch, c[0]));

        // c[1] is now the head of the queue.
        match table.send(ch, c[0], msg(3)).unwrap() {
            SendOutcome::Rendezvous { receiver, .. } => assert_eq!(receiver, c[1]),
            other => panic!("expected rendezvous, got {:?}", other),
        }
    }
}
