//! Message queues
//!
//! A message queue multiplexes any number of channel receive endpoints.
//! Attaching an endpoint moves it into the queue together with a caller
//! chosen tag; from then on, sends to that channel land in the queue as
//! `(tag, message)` pairs and the per-channel FIFO stays empty.
//!
//! Receives may carry an absolute deadline. A waiting receiver sits in both
//! the queue's blocked slot and the global wait queue; whichever fires first
//! cancels the other registration.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use sable_abi::{MessageFlags, MessageTag, TIMEOUT_NONE};
use spin::Mutex;

use crate::error::{KError, KResult};
use crate::ipc::channel::ReceiveRef;
use crate::ipc::message::Message;
use crate::process::Process;
use crate::sched;
use crate::sched::wait;
use crate::time;

struct MqState {
    queue: VecDeque<(MessageTag, Box<Message>)>,
    blocked_receiver: *mut Process,
    /// Receive endpoints owned by this queue. Kept for their refcounts; all
    /// delivery happens through the channel-side binding.
    channels: Vec<ReceiveRef>,
}

// The raw process pointer is only touched under the queue lock.
unsafe impl Send for MqState {}

pub struct MessageQueue {
    state: Mutex<MqState>,
}

impl MessageQueue {
    pub fn create() -> Arc<MessageQueue> {
        Arc::new(MessageQueue {
            state: Mutex::new(MqState {
                queue: VecDeque::new(),
                blocked_receiver: core::ptr::null_mut(),
                channels: Vec::new(),
            }),
        })
    }

    /// Bind a channel receive endpoint to this queue under `tag`.
    ///
    /// Anything already buffered in the channel is drained into the queue
    /// first. An endpoint can be bound at most once; on failure the endpoint
    /// is handed back so the caller can restore it.
    pub fn attach(
        mqueue: &Arc<MessageQueue>,
        receiver: ReceiveRef,
        tag: MessageTag,
    ) -> Result<(), (KError, ReceiveRef)> {
        let channel = Arc::clone(receiver.channel());
        let mut channel_state = channel.state.lock();
        if channel_state.mqueue.is_some() {
            drop(channel_state);
            return Err((KError::MqueueAlreadySet, receiver));
        }
        let mut state = mqueue.state.lock();
        let drained = !channel_state.queue.is_empty();
        while let Some(message) = channel_state.queue.pop_front() {
            state.queue.push_back((tag, message));
        }
        channel_state.mqueue = Some((Arc::downgrade(mqueue), tag));
        state.channels.push(receiver);
        if drained {
            Self::wake_locked(&mut state);
        }
        Ok(())
    }

    /// Deliver a message from a bound channel.
    pub fn push(&self, tag: MessageTag, message: Box<Message>) {
        let mut state = self.state.lock();
        state.queue.push_back((tag, message));
        Self::wake_locked(&mut state);
    }

    /// Put an entry back at the front after a failed delivery.
    pub fn unreceive(&self, tag: MessageTag, message: Box<Message>) {
        self.state.lock().queue.push_front((tag, message));
    }

    fn wake_locked(state: &mut MqState) {
        if !state.blocked_receiver.is_null() {
            let receiver = state.blocked_receiver;
            state.blocked_receiver = core::ptr::null_mut();
            unsafe {
                wait::remove(receiver);
                sched::enqueue(receiver);
            }
        }
    }

    /// Dequeue the next `(tag, message)` pair.
    ///
    /// `timeout` is an absolute timestamp: [`TIMEOUT_NONE`] blocks forever,
    /// zero never blocks (`WouldBlock` when empty), and a deadline already
    /// reached yields `TimedOut`. `PRIORITIZE_TIMEOUT` reports an expired
    /// deadline even when a message is ready.
    pub fn receive(
        &self,
        timeout: i64,
        flags: MessageFlags,
    ) -> KResult<(MessageTag, Box<Message>)> {
        loop {
            let mut state = self.state.lock();
            let deadline_expired =
                timeout != TIMEOUT_NONE && timeout != 0 && time::now() >= timeout;
            if deadline_expired && flags.contains(MessageFlags::PRIORITIZE_TIMEOUT) {
                return Err(KError::TimedOut);
            }
            if let Some(entry) = state.queue.pop_front() {
                return Ok(entry);
            }
            if flags.contains(MessageFlags::NONBLOCK) || timeout == 0 {
                return Err(KError::WouldBlock);
            }
            if deadline_expired {
                return Err(KError::TimedOut);
            }

            let current = sched::current();
            state.blocked_receiver = current;
            if timeout != TIMEOUT_NONE {
                unsafe { wait::insert_current(timeout) };
            }
            sched::block_current(&self.state, state);

            let timed_out =
                unsafe { (*current).timed_out.swap(false, Ordering::AcqRel) };
            if timed_out {
                // The wait queue won the race; withdraw the registration if
                // a concurrent sender has not already consumed it.
                let mut state = self.state.lock();
                if state.blocked_receiver == current {
                    state.blocked_receiver = core::ptr::null_mut();
                }
                return Err(KError::TimedOut);
            }
            // Woken by a sender (or spuriously): go around and re-check.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::channel::Channel;
    use alloc::vec;

    fn message(bytes: &[u8]) -> Box<Message> {
        Box::new(Message::new(bytes.to_vec(), vec![]))
    }

    const T1: MessageTag = MessageTag::new(1, 0);
    const T2: MessageTag = MessageTag::new(2, 0);

    #[test]
    fn bound_channel_routes_into_the_queue_with_its_tag() {
        let mqueue = MessageQueue::create();
        let (tx, rx) = Channel::create();
        MessageQueue::attach(&mqueue, rx, T1).map_err(|(e, _)| e).unwrap();

        tx.send(message(b"hello")).unwrap();
        let (tag, received) = mqueue
            .receive(TIMEOUT_NONE, MessageFlags::NONBLOCK)
            .unwrap();
        assert_eq!(tag, T1);
        assert_eq!(received.data, b"hello");
    }

    #[test]
    fn tags_follow_their_channels_in_commit_order() {
        let mqueue = MessageQueue::create();
        let (tx1, rx1) = Channel::create();
        let (tx2, rx2) = Channel::create();
        MessageQueue::attach(&mqueue, rx1, T1).map_err(|(e, _)| e).unwrap();
        MessageQueue::attach(&mqueue, rx2, T2).map_err(|(e, _)| e).unwrap();

        tx1.send(message(b"a")).unwrap();
        tx2.send(message(b"b")).unwrap();
        tx1.send(message(b"c")).unwrap();

        let tags: Vec<MessageTag> = (0..3)
            .map(|_| {
                mqueue
                    .receive(TIMEOUT_NONE, MessageFlags::NONBLOCK)
                    .unwrap()
                    .0
            })
            .collect();
        assert_eq!(tags, vec![T1, T2, T1]);
    }

    #[test]
    fn attach_drains_buffered_messages() {
        let mqueue = MessageQueue::create();
        let (tx, rx) = Channel::create();
        tx.send(message(b"early")).unwrap();
        tx.send(message(b"bird")).unwrap();
        MessageQueue::attach(&mqueue, rx, T2).map_err(|(e, _)| e).unwrap();

        let (tag, first) = mqueue
            .receive(TIMEOUT_NONE, MessageFlags::NONBLOCK)
            .unwrap();
        assert_eq!(tag, T2);
        assert_eq!(first.data, b"early");
        assert_eq!(
            mqueue
                .receive(TIMEOUT_NONE, MessageFlags::NONBLOCK)
                .unwrap()
                .1
                .data,
            b"bird"
        );
    }

    #[test]
    fn rebinding_a_channel_fails() {
        let mq1 = MessageQueue::create();
        let mq2 = MessageQueue::create();
        let (_tx, rx) = Channel::create();
        MessageQueue::attach(&mq1, rx, T1).map_err(|(e, _)| e).unwrap();

        // The endpoint now lives inside mq1; binding the same channel again
        // through a duplicate endpoint must fail.
        let (tx2, rx2) = Channel::create();
        MessageQueue::attach(&mq1, rx2, T1).map_err(|(e, _)| e).unwrap();
        let dup = {
            let state = mq1.state.lock();
            state.channels.last().unwrap().duplicate()
        };
        let err = MessageQueue::attach(&mq2, dup, T2).map_err(|(e, _)| e);
        assert_eq!(err, Err(KError::MqueueAlreadySet));
        drop(tx2);
    }

    #[test]
    fn empty_queue_does_not_block_with_nonblock() {
        let mqueue = MessageQueue::create();
        assert_eq!(
            mqueue
                .receive(TIMEOUT_NONE, MessageFlags::NONBLOCK)
                .map(|_| ()),
            Err(KError::WouldBlock)
        );
    }

    #[test]
    fn zero_timeout_never_blocks() {
        let mqueue = MessageQueue::create();
        assert_eq!(
            mqueue.receive(0, MessageFlags::empty()).map(|_| ()),
            Err(KError::WouldBlock)
        );
    }

    #[test]
    fn prioritized_expired_deadline_beats_a_ready_message() {
        let mqueue = MessageQueue::create();
        let (tx, rx) = Channel::create();
        MessageQueue::attach(&mqueue, rx, T1).map_err(|(e, _)| e).unwrap();
        tx.send(message(b"late")).unwrap();

        // The host clock reads 0, so any negative deadline has expired.
        assert_eq!(
            mqueue
                .receive(-1, MessageFlags::PRIORITIZE_TIMEOUT)
                .map(|_| ()),
            Err(KError::TimedOut)
        );
        // Without the flag the message is preferred.
        assert!(mqueue.receive(-1, MessageFlags::empty()).is_ok());
    }
}
