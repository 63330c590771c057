//! Channels
//!
//! A channel is a reference-counted rendezvous with an unbounded message
//! FIFO. Two capability kinds reference it: send endpoints and receive
//! endpoints, counted separately so either side can observe the other's
//! disappearance. A channel bound to a message queue never uses its own
//! FIFO; sends route straight into the queue together with the binding tag.
//!
//! The blocked receiver is a non-owning raw pointer into the process; wakeup
//! clears it before the channel lock is released, so a process pointer never
//! outlives its registration.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};

use sable_abi::MessageTag;
use spin::Mutex;

use crate::error::{KError, KResult};
use crate::ipc::message::Message;
use crate::ipc::mqueue::MessageQueue;
use crate::process::Process;
use crate::sched;

pub(super) struct ChannelState {
    pub(super) send_refs: usize,
    pub(super) recv_refs: usize,
    pub(super) queue: VecDeque<Box<Message>>,
    pub(super) blocked_receiver: *mut Process,
    /// Bound message queue. Weak: the queue owns this channel's receive
    /// endpoint, so a strong reference here would cycle and leak both.
    pub(super) mqueue: Option<(Weak<MessageQueue>, MessageTag)>,
}

// The raw process pointer is only touched under the channel lock.
unsafe impl Send for ChannelState {}

pub struct Channel {
    pub(super) state: Mutex<ChannelState>,
}

impl Channel {
    /// Create a channel and its two endpoints.
    pub fn create() -> (SendRef, ReceiveRef) {
        let channel = Arc::new(Channel {
            state: Mutex::new(ChannelState {
                send_refs: 1,
                recv_refs: 1,
                queue: VecDeque::new(),
                blocked_receiver: core::ptr::null_mut(),
                mqueue: None,
            }),
        });
        (
            SendRef {
                channel: Arc::clone(&channel),
            },
            ReceiveRef { channel },
        )
    }
}

/// Send endpoint. Copyable: cloning bumps the channel's send count.
pub struct SendRef {
    channel: Arc<Channel>,
}

impl Clone for SendRef {
    fn clone(&self) -> SendRef {
        self.channel.state.lock().send_refs += 1;
        SendRef {
            channel: Arc::clone(&self.channel),
        }
    }
}

impl Drop for SendRef {
    fn drop(&mut self) {
        let mut state = self.channel.state.lock();
        state.send_refs -= 1;
        if state.send_refs == 0 && !state.blocked_receiver.is_null() {
            // The receiver will find the queue empty and no senders left.
            let receiver = state.blocked_receiver;
            state.blocked_receiver = core::ptr::null_mut();
            drop(state);
            unsafe { sched::enqueue(receiver) };
        }
    }
}

impl SendRef {
    /// Append a message, or route it into the bound message queue. Never
    /// blocks.
    ///
    /// Fails with `ChannelClosed` when no receive endpoint remains; the
    /// message is dropped, releasing everything attached to it.
    pub fn send(&self, message: Box<Message>) -> KResult<()> {
        let mut state = self.channel.state.lock();
        if let Some((mqueue, tag)) = &state.mqueue {
            // A dead queue means the receive endpoint died with it; fall
            // through to the closed-channel report.
            if let Some(mqueue) = mqueue.upgrade() {
                let tag = *tag;
                drop(state);
                mqueue.push(tag, message);
                return Ok(());
            }
        }
        if state.recv_refs == 0 {
            return Err(KError::ChannelClosed);
        }
        state.queue.push_back(message);
        if !state.blocked_receiver.is_null() {
            let receiver = state.blocked_receiver;
            state.blocked_receiver = core::ptr::null_mut();
            drop(state);
            unsafe { sched::enqueue(receiver) };
        }
        Ok(())
    }

    /// Send and await the reply on an implicit reply channel.
    ///
    /// The callee answers through the message's reply endpoint, either with
    /// a payload or with an error code, which becomes this call's error.
    /// Returns user-facing error codes: the caller is always user space.
    pub fn call(&self, mut message: Box<Message>) -> Result<Box<Message>, u64> {
        let (reply_send, reply_recv) = Channel::create();
        message.reply = Some(reply_send);
        self.send(message)
            .map_err(|err| err.user_code().code())?;
        let reply = reply_recv
            .receive(false)
            .map_err(|err| err.user_code().code())?;
        match reply.error {
            Some(code) => Err(code),
            None => Ok(reply),
        }
    }

    /// Send, with the reply routed into `mqueue` under `tag` instead of
    /// blocking this process.
    pub fn call_async(
        &self,
        mut message: Box<Message>,
        mqueue: &Arc<MessageQueue>,
        tag: MessageTag,
    ) -> KResult<()> {
        let (reply_send, reply_recv) = Channel::create();
        message.reply = Some(reply_send);
        if let Err((err, _recv)) = MessageQueue::attach(mqueue, reply_recv, tag) {
            return Err(err);
        }
        self.send(message)
    }
}

/// Receive endpoint. Move-only from user space; the kernel clones it only
/// when binding resources.
pub struct ReceiveRef {
    channel: Arc<Channel>,
}

impl ReceiveRef {
    /// Kernel-internal duplication (resource binding). User-visible copies
    /// of receive endpoints do not exist.
    pub(crate) fn duplicate(&self) -> ReceiveRef {
        self.channel.state.lock().recv_refs += 1;
        ReceiveRef {
            channel: Arc::clone(&self.channel),
        }
    }

    pub(super) fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Pop the next message, blocking while the queue is empty.
    ///
    /// With `nonblock`, an empty queue yields `WouldBlock` instead. Once all
    /// send endpoints are gone and the queue is drained, yields
    /// `ChannelClosed`.
    pub fn receive(&self, nonblock: bool) -> KResult<Box<Message>> {
        loop {
            let mut state = self.channel.state.lock();
            if let Some(message) = state.queue.pop_front() {
                return Ok(message);
            }
            if state.send_refs == 0 {
                return Err(KError::ChannelClosed);
            }
            if nonblock {
                return Err(KError::WouldBlock);
            }
            state.blocked_receiver = sched::current();
            sched::block_current(&self.channel.state, state);
        }
    }

    /// Put a message back at the front of the queue.
    ///
    /// Used when delivery to the receiving process fails after the message
    /// was already popped.
    pub fn unreceive(&self, message: Box<Message>) {
        self.channel.state.lock().queue.push_front(message);
    }
}

impl Drop for ReceiveRef {
    fn drop(&mut self) {
        let mut state = self.channel.state.lock();
        state.recv_refs -= 1;
        let drained = if state.recv_refs == 0 {
            // No receiver will ever pop these; drop them now rather than at
            // channel destruction so attached capabilities release promptly.
            core::mem::take(&mut state.queue)
        } else {
            VecDeque::new()
        };
        // Dropped outside the lock: a queued message may carry an endpoint
        // of this very channel.
        drop(state);
        drop(drained);
    }
}

/// Reply to a received message, consuming its reply endpoint.
///
/// `message_reply_error` is this with an error message.
pub fn reply_to(message: &mut Message, reply: Box<Message>) -> KResult<()> {
    let target = message.reply.take().ok_or(KError::InvalidArg)?;
    target.send(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::AttachedHandle;
    use alloc::vec;

    fn data_message(bytes: &[u8]) -> Box<Message> {
        Box::new(Message::new(bytes.to_vec(), vec![]))
    }

    #[test]
    fn send_then_receive_preserves_bytes() {
        let (tx, rx) = Channel::create();
        tx.send(data_message(b"foo")).unwrap();
        let message = rx.receive(true).unwrap();
        assert_eq!(message.data, b"foo");
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (tx, rx) = Channel::create();
        for i in 0..10u8 {
            tx.send(data_message(&[i])).unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(rx.receive(true).unwrap().data, [i]);
        }
    }

    #[test]
    fn empty_queue_would_block() {
        let (_tx, rx) = Channel::create();
        assert_eq!(
            rx.receive(true).map(|_| ()),
            Err(KError::WouldBlock)
        );
    }

    #[test]
    fn receive_after_senders_gone_is_closed() {
        let (tx, rx) = Channel::create();
        tx.send(data_message(b"last")).unwrap();
        drop(tx);
        // The queued message is still delivered; only then is the channel
        // reported closed.
        assert_eq!(rx.receive(true).unwrap().data, b"last");
        assert_eq!(rx.receive(true).map(|_| ()), Err(KError::ChannelClosed));
    }

    #[test]
    fn send_without_receiver_is_closed() {
        let (tx, rx) = Channel::create();
        drop(rx);
        assert_eq!(tx.send(data_message(b"x")), Err(KError::ChannelClosed));
    }

    #[test]
    fn cloned_send_endpoint_keeps_channel_open() {
        let (tx, rx) = Channel::create();
        let tx2 = tx.clone();
        drop(tx);
        tx2.send(data_message(b"alive")).unwrap();
        assert_eq!(rx.receive(true).unwrap().data, b"alive");
    }

    #[test]
    fn attached_handles_travel_with_the_message() {
        let (inner_tx, inner_rx) = Channel::create();
        let (tx, rx) = Channel::create();

        let message = Box::new(Message::new(
            b"take this".to_vec(),
            vec![AttachedHandle::ChannelSend(inner_tx)],
        ));
        tx.send(message).unwrap();

        let mut received = rx.receive(true).unwrap();
        assert_eq!(received.handles.len(), 1);
        let AttachedHandle::ChannelSend(inner_tx) = received.handles.remove(0) else {
            panic!("wrong attached handle kind");
        };
        inner_tx.send(data_message(b"through")).unwrap();
        assert_eq!(inner_rx.receive(true).unwrap().data, b"through");
    }

    #[test]
    fn dropping_a_message_releases_attached_endpoints() {
        let (inner_tx, inner_rx) = Channel::create();
        let (tx, rx) = Channel::create();
        tx.send(Box::new(Message::new(
            vec![],
            vec![AttachedHandle::ChannelSend(inner_tx)],
        )))
        .unwrap();
        // Receiver frees the message without looking inside.
        drop(rx.receive(true).unwrap());
        assert_eq!(
            inner_rx.receive(true).map(|_| ()),
            Err(KError::ChannelClosed)
        );
    }

    #[test]
    fn reply_reaches_the_reply_channel() {
        let (tx, rx) = Channel::create();

        // A caller that does not block: wire the reply endpoint manually.
        let (reply_send, reply_recv) = Channel::create();
        let mut message = data_message(b"request");
        message.reply = Some(reply_send);
        tx.send(message).unwrap();

        let mut request = rx.receive(true).unwrap();
        assert_eq!(request.data, b"request");
        reply_to(&mut request, data_message(b"RESPONSE")).unwrap();

        assert_eq!(reply_recv.receive(true).unwrap().data, b"RESPONSE");
        // A second reply has nowhere to go.
        assert_eq!(
            reply_to(&mut request, data_message(b"again")),
            Err(KError::InvalidArg)
        );
    }

    #[test]
    fn error_reply_carries_the_code() {
        let (tx, rx) = Channel::create();
        let (reply_send, reply_recv) = Channel::create();
        let mut message = data_message(b"request");
        message.reply = Some(reply_send);
        tx.send(message).unwrap();

        let mut request = rx.receive(true).unwrap();
        reply_to(&mut request, Box::new(Message::from_error(23))).unwrap();
        let reply = reply_recv.receive(true).unwrap();
        assert_eq!(reply.error, Some(23));
    }

    #[test]
    fn unanswered_call_observes_closed_reply_channel() {
        let (tx, rx) = Channel::create();
        let (reply_send, reply_recv) = Channel::create();
        let mut message = data_message(b"request");
        message.reply = Some(reply_send);
        tx.send(message).unwrap();

        // The callee frees the request without replying.
        drop(rx.receive(true).unwrap());
        assert_eq!(
            reply_recv.receive(true).map(|_| ()),
            Err(KError::ChannelClosed)
        );
    }

    #[test]
    fn unreceive_restores_front_position() {
        let (tx, rx) = Channel::create();
        tx.send(data_message(b"first")).unwrap();
        tx.send(data_message(b"second")).unwrap();
        let message = rx.receive(true).unwrap();
        rx.unreceive(message);
        assert_eq!(rx.receive(true).unwrap().data, b"first");
        assert_eq!(rx.receive(true).unwrap().data, b"second");
    }
}
