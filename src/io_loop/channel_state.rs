use super::content_collector::{CollectorResult, ContentCollector};
use super::{ChannelMessage, ChannelRequest, ConfirmTimerKey, ReplyTx};
use crate::serialize::{IntoAmqpClass, OutputBuffer};
use crate::{
    Confirm, ConfirmPayload, ConsumerSink, Delivery, Error, Result, Return, SinkReplySlot,
};
use amq_protocol::frame::AMQPContentHeader;
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::channel::CloseOk as ChannelCloseOk;
use amq_protocol::protocol::channel::FlowOk;
use amq_protocol::protocol::confirm::AMQPMethod as AmqpConfirm;
use amq_protocol::protocol::AMQPClass;
use crossbeam_channel::Sender as CrossbeamSender;
use log::{debug, trace, warn};
use mio_extras::timer::{Timeout, Timer};
use std::collections::hash_map::HashMap;
use std::collections::{BTreeSet, VecDeque};

/// The channel slot's verdict after absorbing an inbound method: either the
/// channel lives on, or it is finished and must be unregistered. A `None`
/// reason is a clean client-initiated close; `Some` carries the server or
/// failure reason.
pub(super) struct ChannelTermination {
    pub(super) reason: Option<Error>,
}

enum RpcKind {
    Call,
    Get,
    Consume { consumer_tag: Option<String> },
    CloseChannel,
    FlowOkInternal,
}

struct RpcEntry {
    // Present until the entry reaches the head of the queue and its write is
    // issued.
    buf: Option<OutputBuffer>,
    sync: bool,
    kind: RpcKind,
    reply_tx: Option<ReplyTx>,
}

struct ConfirmMode {
    next_pub_seqno: u64,
    unconfirmed: BTreeSet<u64>,
    only_acks_received: bool,
    waiters: Vec<ConfirmWaiter>,
    next_waiter_id: u64,
}

struct ConfirmWaiter {
    id: u64,
    reply_tx: CrossbeamSender<Result<bool>>,
    timeout: Option<Timeout>,
}

enum Closing {
    // We sent channel.close and are waiting for close-ok.
    ClientInitiated,
    // The server's own close crossed ours on the wire; we replied close-ok
    // and keep waiting for the close-ok owed to us, but the server's reason
    // wins for the termination report.
    SimultaneousServerClose { reason: Error },
}

/// State machine for one open channel, driven entirely from the I/O thread.
///
/// Requests from the application enter a single FIFO. The head request's
/// write is issued immediately; a synchronous head then holds the queue until
/// its reply arrives, while asynchronous entries complete as soon as their
/// write is issued. This serializes synchronous round-trips (at most one
/// outstanding) while letting asynchronous chains drain eagerly.
///
/// Outgoing frames accumulate in `out` and are drained by the I/O loop after
/// every event; that drain point is the only coupling to the network writer,
/// so the same machine could feed a direct in-process endpoint.
pub(super) struct ChannelState {
    channel_id: u16,
    out: Vec<OutputBuffer>,
    rpc: VecDeque<RpcEntry>,
    consumers: HashMap<String, Box<dyn ConsumerSink>>,
    // Tag-less subscriptions park their sinks here until the server assigns
    // a tag in consume-ok. RPC serialization keeps the pairing unambiguous.
    anonymous: VecDeque<Box<dyn ConsumerSink>>,
    collector: ContentCollector,
    flow_active: bool,
    confirm: Option<ConfirmMode>,
    closing: Option<Closing>,
    return_handler: Option<CrossbeamSender<Return>>,
    confirm_handler: Option<CrossbeamSender<Confirm>>,
    flow_handler: Option<CrossbeamSender<bool>>,
}

impl ChannelState {
    pub(super) fn new(channel_id: u16) -> ChannelState {
        ChannelState {
            channel_id,
            out: Vec::new(),
            rpc: VecDeque::new(),
            consumers: HashMap::new(),
            anonymous: VecDeque::new(),
            collector: ContentCollector::new(),
            flow_active: true,
            confirm: None,
            closing: None,
            return_handler: None,
            confirm_handler: None,
            flow_handler: None,
        }
    }

    pub(super) fn take_outgoing(&mut self) -> Vec<OutputBuffer> {
        std::mem::take(&mut self.out)
    }

    fn push_out<M: IntoAmqpClass>(&mut self, method: M) -> Result<()> {
        let buf = OutputBuffer::with_method(self.channel_id, method)?;
        self.out.push(buf);
        Ok(())
    }

    /// True once no requests are queued or awaiting replies; connection
    /// close waits for every channel to reach this state.
    pub(super) fn is_rpc_idle(&self) -> bool {
        self.rpc.is_empty()
    }

    pub(super) fn handle_request(
        &mut self,
        request: ChannelRequest,
        timer: &mut Timer<ConfirmTimerKey>,
    ) -> Result<()> {
        match request {
            ChannelRequest::Rpc {
                buf,
                sync,
                has_content,
                is_publish,
                reply_tx,
            } => self.handle_rpc(buf, sync, has_content, is_publish, reply_tx),
            ChannelRequest::Get { buf, reply_tx } => {
                if self.closing.is_some() {
                    let _ = reply_tx.send(Err(Error::ClientClosedChannel));
                    return Ok(());
                }
                self.enqueue(RpcEntry {
                    buf: Some(buf),
                    sync: true,
                    kind: RpcKind::Get,
                    reply_tx: Some(reply_tx),
                });
                Ok(())
            }
            ChannelRequest::Consume {
                buf,
                consumer_tag,
                sink,
                reply_tx,
            } => self.handle_consume(buf, consumer_tag, sink, reply_tx),
            ChannelRequest::CloseChannel { buf, reply_tx } => {
                if self.closing.is_some() {
                    let _ = reply_tx.send(Err(Error::ClientClosedChannel));
                    return Ok(());
                }
                debug!("closing channel {}", self.channel_id);
                self.closing = Some(Closing::ClientInitiated);
                self.enqueue(RpcEntry {
                    buf: Some(buf),
                    sync: true,
                    kind: RpcKind::CloseChannel,
                    reply_tx: Some(reply_tx),
                });
                Ok(())
            }
            ChannelRequest::NextPublishSeqno { reply_tx } => {
                let seqno = self.confirm.as_ref().map_or(0, |c| c.next_pub_seqno);
                let _ = reply_tx.send(seqno);
                Ok(())
            }
            ChannelRequest::WaitForConfirms { timeout, reply_tx } => {
                let channel_id = self.channel_id;
                let confirm = match &mut self.confirm {
                    None => {
                        let _ = reply_tx.send(Err(Error::NotInConfirmMode));
                        return Ok(());
                    }
                    Some(confirm) => confirm,
                };
                if confirm.unconfirmed.is_empty() {
                    let _ = reply_tx.send(Ok(true));
                    return Ok(());
                }
                let id = confirm.next_waiter_id;
                confirm.next_waiter_id += 1;
                let timeout = timeout.map(|when| timer.set_timeout(when, (channel_id, id)));
                confirm.waiters.push(ConfirmWaiter {
                    id,
                    reply_tx,
                    timeout,
                });
                Ok(())
            }
            ChannelRequest::SetReturnHandler(handler) => {
                self.return_handler = handler;
                Ok(())
            }
            ChannelRequest::SetConfirmHandler(handler) => {
                self.confirm_handler = handler;
                Ok(())
            }
            ChannelRequest::SetFlowHandler(handler) => {
                self.flow_handler = handler;
                Ok(())
            }
            ChannelRequest::CallConsumer {
                consumer_tag,
                message,
                reply_tx,
            } => {
                match self.consumers.get_mut(&consumer_tag) {
                    Some(sink) => sink.on_call(message, SinkReplySlot::new(reply_tx)),
                    // dropping reply_tx fails the caller
                    None => warn!(
                        "consumer call for unknown tag {} on channel {}",
                        consumer_tag, self.channel_id
                    ),
                }
                Ok(())
            }
            ChannelRequest::NotifyConsumer {
                consumer_tag,
                message,
            } => {
                match self.consumers.get_mut(&consumer_tag) {
                    Some(sink) => sink.on_info(message),
                    None => warn!(
                        "consumer notification for unknown tag {} on channel {}",
                        consumer_tag, self.channel_id
                    ),
                }
                Ok(())
            }
            ChannelRequest::CloseConnection { .. } | ChannelRequest::Flush { .. } => {
                unreachable!("connection-level requests are handled by the I/O loop")
            }
        }
    }

    fn handle_rpc(
        &mut self,
        buf: OutputBuffer,
        sync: bool,
        has_content: bool,
        is_publish: bool,
        reply_tx: Option<ReplyTx>,
    ) -> Result<()> {
        if self.closing.is_some() {
            match reply_tx {
                Some(tx) => {
                    let _ = tx.send(Err(Error::ClientClosedChannel));
                }
                None => debug!(
                    "discarding cast on closing channel {}",
                    self.channel_id
                ),
            }
            return Ok(());
        }
        if has_content && !self.flow_active {
            match reply_tx {
                Some(tx) => {
                    let _ = tx.send(Err(Error::ChannelBlocked));
                }
                None => warn!(
                    "discarding content-bearing cast on flow-blocked channel {}",
                    self.channel_id
                ),
            }
            return Ok(());
        }
        if is_publish {
            if let Some(confirm) = &mut self.confirm {
                confirm.unconfirmed.insert(confirm.next_pub_seqno);
                confirm.next_pub_seqno += 1;
            }
        }
        self.enqueue(RpcEntry {
            buf: Some(buf),
            sync,
            kind: RpcKind::Call,
            reply_tx,
        });
        Ok(())
    }

    fn handle_consume(
        &mut self,
        buf: OutputBuffer,
        consumer_tag: Option<String>,
        sink: Box<dyn ConsumerSink>,
        reply_tx: ReplyTx,
    ) -> Result<()> {
        if self.closing.is_some() {
            let _ = reply_tx.send(Err(Error::ClientClosedChannel));
            return Ok(());
        }
        match &consumer_tag {
            Some(tag) => {
                if self.consumers.contains_key(tag) {
                    let _ = reply_tx.send(Err(Error::ConsumerTagAlreadyInUse {
                        channel_id: self.channel_id,
                        consumer_tag: tag.clone(),
                    }));
                    return Ok(());
                }
                // Register before the consume-ok so deliveries racing the
                // reply still find their sink.
                self.consumers.insert(tag.clone(), sink);
            }
            None => self.anonymous.push_back(sink),
        }
        self.enqueue(RpcEntry {
            buf: Some(buf),
            sync: true,
            kind: RpcKind::Consume { consumer_tag },
            reply_tx: Some(reply_tx),
        });
        Ok(())
    }

    fn enqueue(&mut self, entry: RpcEntry) {
        self.rpc.push_back(entry);
        self.pump();
    }

    fn pump(&mut self) {
        loop {
            let head = match self.rpc.front_mut() {
                Some(head) => head,
                None => return,
            };
            if let Some(buf) = head.buf.take() {
                self.out.push(buf);
            }
            if head.sync {
                return;
            }
            let entry = self.rpc.pop_front().unwrap();
            if let Some(tx) = entry.reply_tx {
                let _ = tx.send(Ok(ChannelMessage::Accepted));
            }
        }
    }

    fn complete_head(&mut self, message: ChannelMessage) -> Result<RpcKind> {
        let entry = match self.rpc.front() {
            Some(head) if head.sync && head.buf.is_none() => self.rpc.pop_front().unwrap(),
            _ => return Err(Error::FrameUnexpected),
        };
        if let Some(tx) = &entry.reply_tx {
            let _ = tx.send(Ok(message));
        }
        self.pump();
        Ok(entry.kind)
    }

    fn head_kind_is_get(&self) -> bool {
        matches!(
            self.rpc.front(),
            Some(RpcEntry {
                kind: RpcKind::Get,
                sync: true,
                buf: None,
                ..
            })
        )
    }

    pub(super) fn handle_method(
        &mut self,
        method: AMQPClass,
        timer: &mut Timer<ConfirmTimerKey>,
    ) -> Result<Option<ChannelTermination>> {
        trace!("channel {} received method {:?}", self.channel_id, method);
        match method {
            AMQPClass::Channel(AmqpChannel::Close(close)) => {
                let reason = Error::ServerClosedChannel {
                    channel_id: self.channel_id,
                    code: close.reply_code,
                    message: close.reply_text,
                };
                self.push_out(AmqpChannel::CloseOk(ChannelCloseOk {}))?;
                match self.closing {
                    Some(_) => {
                        // our close and the server's crossed; keep waiting
                        // for the close-ok owed to us
                        warn!(
                            "server closed channel {} while a local close was in flight",
                            self.channel_id
                        );
                        self.closing = Some(Closing::SimultaneousServerClose { reason });
                        Ok(None)
                    }
                    None => {
                        warn!("server closing channel {}: {}", self.channel_id, reason);
                        Ok(Some(ChannelTermination {
                            reason: Some(reason),
                        }))
                    }
                }
            }
            AMQPClass::Channel(AmqpChannel::CloseOk(close_ok)) => {
                match self.complete_head(ChannelMessage::Method(AMQPClass::Channel(
                    AmqpChannel::CloseOk(close_ok),
                )))? {
                    RpcKind::CloseChannel => (),
                    _ => return Err(Error::FrameUnexpected),
                }
                let reason = match self.closing.take() {
                    Some(Closing::SimultaneousServerClose { reason }) => Some(reason),
                    _ => None,
                };
                Ok(Some(ChannelTermination { reason }))
            }
            AMQPClass::Channel(AmqpChannel::Flow(flow)) => {
                debug!(
                    "server set flow active={} on channel {}",
                    flow.active, self.channel_id
                );
                self.flow_active = flow.active;
                if let Some(tx) = &self.flow_handler {
                    if tx.send(flow.active).is_err() {
                        warn!("flow handler is gone; unregistering");
                        self.flow_handler = None;
                    }
                }
                // The flow-ok ack queues behind any in-flight RPCs so their
                // replies are not held up.
                let buf = OutputBuffer::with_method(
                    self.channel_id,
                    AmqpChannel::FlowOk(FlowOk {
                        active: flow.active,
                    }),
                )?;
                self.enqueue(RpcEntry {
                    buf: Some(buf),
                    sync: false,
                    kind: RpcKind::FlowOkInternal,
                    reply_tx: None,
                });
                Ok(None)
            }
            AMQPClass::Basic(AmqpBasic::Deliver(deliver)) => {
                self.collector.collect_deliver(deliver)?;
                Ok(None)
            }
            AMQPClass::Basic(AmqpBasic::Return(ret)) => {
                self.collector.collect_return(ret)?;
                Ok(None)
            }
            AMQPClass::Basic(AmqpBasic::GetOk(get_ok)) => {
                if !self.head_kind_is_get() {
                    return Err(Error::FrameUnexpected);
                }
                self.collector.collect_get(get_ok)?;
                Ok(None)
            }
            AMQPClass::Basic(AmqpBasic::GetEmpty(_)) => {
                match self.complete_head(ChannelMessage::GetOk(Box::new(None)))? {
                    RpcKind::Get => Ok(None),
                    _ => Err(Error::FrameUnexpected),
                }
            }
            AMQPClass::Basic(AmqpBasic::Ack(ack)) => {
                self.apply_confirm(ack.delivery_tag, ack.multiple, false, timer);
                Ok(None)
            }
            AMQPClass::Basic(AmqpBasic::Nack(nack)) => {
                self.apply_confirm(nack.delivery_tag, nack.multiple, true, timer);
                Ok(None)
            }
            AMQPClass::Basic(AmqpBasic::ConsumeOk(consume_ok)) => {
                self.bind_consumer(consume_ok.consumer_tag)?;
                Ok(None)
            }
            AMQPClass::Basic(AmqpBasic::Cancel(cancel)) => {
                match self.consumers.remove(&cancel.consumer_tag) {
                    Some(mut sink) => sink.on_cancel(&cancel.consumer_tag),
                    None => warn!(
                        "server cancelled unknown consumer {} on channel {}",
                        cancel.consumer_tag, self.channel_id
                    ),
                }
                Ok(None)
            }
            AMQPClass::Basic(AmqpBasic::CancelOk(cancel_ok)) => {
                if let Some(mut sink) = self.consumers.remove(&cancel_ok.consumer_tag) {
                    sink.on_cancel_ok(&cancel_ok.consumer_tag);
                }
                self.complete_head(ChannelMessage::Method(AMQPClass::Basic(
                    AmqpBasic::CancelOk(cancel_ok),
                )))?;
                Ok(None)
            }
            AMQPClass::Confirm(AmqpConfirm::SelectOk(select_ok)) => {
                if self.confirm.is_none() {
                    debug!("channel {} entering confirm mode", self.channel_id);
                    self.confirm = Some(ConfirmMode {
                        next_pub_seqno: 1,
                        unconfirmed: BTreeSet::new(),
                        only_acks_received: true,
                        waiters: Vec::new(),
                        next_waiter_id: 0,
                    });
                }
                self.complete_head(ChannelMessage::Method(AMQPClass::Confirm(
                    AmqpConfirm::SelectOk(select_ok),
                )))?;
                Ok(None)
            }
            other => {
                self.complete_head(ChannelMessage::Method(other))?;
                Ok(None)
            }
        }
    }

    pub(super) fn handle_header(&mut self, header: AMQPContentHeader) -> Result<()> {
        if let Some(result) = self.collector.collect_header(header)? {
            self.dispatch_content(result)?;
        }
        Ok(())
    }

    pub(super) fn handle_body(&mut self, body: Vec<u8>) -> Result<()> {
        if let Some(result) = self.collector.collect_body(body)? {
            self.dispatch_content(result)?;
        }
        Ok(())
    }

    fn dispatch_content(&mut self, result: CollectorResult) -> Result<()> {
        match result {
            CollectorResult::Delivery((consumer_tag, delivery)) => {
                self.dispatch_delivery(consumer_tag, delivery);
                Ok(())
            }
            CollectorResult::Return(ret) => {
                match &self.return_handler {
                    Some(tx) => {
                        if tx.send(ret).is_err() {
                            warn!("return handler is gone; unregistering");
                            self.return_handler = None;
                        }
                    }
                    None => warn!(
                        "discarding returned message on channel {} (no return handler registered)",
                        self.channel_id
                    ),
                }
                Ok(())
            }
            CollectorResult::Get(get) => {
                match self.complete_head(ChannelMessage::GetOk(Box::new(Some(get))))? {
                    RpcKind::Get => Ok(()),
                    _ => Err(Error::FrameUnexpected),
                }
            }
        }
    }

    fn dispatch_delivery(&mut self, consumer_tag: String, delivery: Delivery) {
        match self.consumers.get_mut(&consumer_tag) {
            Some(sink) => {
                if sink.is_closed() {
                    warn!(
                        "consumer {} endpoint is gone; unregistering",
                        consumer_tag
                    );
                    self.consumers.remove(&consumer_tag);
                    return;
                }
                sink.on_deliver(delivery);
                if sink.is_closed() {
                    warn!(
                        "consumer {} endpoint is gone; unregistering",
                        consumer_tag
                    );
                    self.consumers.remove(&consumer_tag);
                }
            }
            None => warn!(
                "dropping delivery for unknown consumer tag {} on channel {}",
                consumer_tag, self.channel_id
            ),
        }
    }

    fn bind_consumer(&mut self, consumer_tag: String) -> Result<()> {
        let kind = self.complete_head(ChannelMessage::ConsumeOk(consumer_tag.clone()))?;
        match kind {
            RpcKind::Consume {
                consumer_tag: Some(chosen),
            } => {
                // Pre-registered under the client's tag; the server echoing a
                // different tag back would leave the registration dangling.
                if chosen != consumer_tag {
                    return Err(Error::FrameUnexpected);
                }
                if let Some(sink) = self.consumers.get_mut(&consumer_tag) {
                    sink.on_consume_ok(&consumer_tag);
                }
                Ok(())
            }
            RpcKind::Consume { consumer_tag: None } => {
                let mut sink = self.anonymous.pop_front().ok_or(Error::FrameUnexpected)?;
                if self.consumers.contains_key(&consumer_tag) {
                    return Err(Error::DuplicateConsumerTag {
                        channel_id: self.channel_id,
                        consumer_tag,
                    });
                }
                sink.on_consume_ok(&consumer_tag);
                self.consumers.insert(consumer_tag, sink);
                Ok(())
            }
            _ => Err(Error::FrameUnexpected),
        }
    }

    fn apply_confirm(
        &mut self,
        delivery_tag: u64,
        multiple: bool,
        is_nack: bool,
        timer: &mut Timer<ConfirmTimerKey>,
    ) {
        let confirm = match &mut self.confirm {
            Some(confirm) => confirm,
            None => {
                warn!(
                    "ignoring publisher confirm on channel {} (not in confirm mode)",
                    self.channel_id
                );
                return;
            }
        };
        if multiple {
            // keep only tags strictly greater than the acknowledged one
            confirm.unconfirmed = confirm.unconfirmed.split_off(&(delivery_tag + 1));
        } else {
            confirm.unconfirmed.remove(&delivery_tag);
        }
        if is_nack {
            confirm.only_acks_received = false;
        }
        if confirm.unconfirmed.is_empty() {
            for waiter in confirm.waiters.drain(..) {
                if let Some(timeout) = waiter.timeout {
                    timer.cancel_timeout(&timeout);
                }
                let _ = waiter.reply_tx.send(Ok(confirm.only_acks_received));
            }
            confirm.only_acks_received = true;
        }

        let payload = ConfirmPayload {
            delivery_tag,
            multiple,
        };
        let notification = if is_nack {
            Confirm::Nack(payload)
        } else {
            Confirm::Ack(payload)
        };
        if let Some(tx) = &self.confirm_handler {
            if tx.send(notification).is_err() {
                warn!("publisher-confirm handler is gone; unregistering");
                self.confirm_handler = None;
            }
        }
    }

    /// A `wait_for_confirms` timer fired; the waiter fails with a timeout
    /// and a late confirm will not revive it.
    pub(super) fn confirm_wait_expired(&mut self, waiter_id: u64) {
        if let Some(confirm) = &mut self.confirm {
            if let Some(pos) = confirm.waiters.iter().position(|w| w.id == waiter_id) {
                let waiter = confirm.waiters.swap_remove(pos);
                let _ = waiter.reply_tx.send(Err(Error::ConfirmsTimedOut));
            }
        }
    }

    /// Tear the channel down: fail queued requests, time out confirm
    /// waiters, and notify every sink. Called with the channel already
    /// removed from the registry.
    pub(super) fn terminate(
        &mut self,
        reason: Option<Error>,
        timer: &mut Timer<ConfirmTimerKey>,
    ) {
        let rpc_err = reason.clone().unwrap_or(Error::ClientClosedChannel);
        for entry in self.rpc.drain(..) {
            if let Some(tx) = entry.reply_tx {
                let _ = tx.send(Err(rpc_err.clone()));
            }
        }
        if let Some(confirm) = &mut self.confirm {
            for waiter in confirm.waiters.drain(..) {
                if let Some(timeout) = waiter.timeout {
                    timer.cancel_timeout(&timeout);
                }
                let _ = waiter.reply_tx.send(Err(rpc_err.clone()));
            }
        }
        for (_, mut sink) in self.consumers.drain() {
            if !sink.is_closed() {
                sink.on_terminate(reason.clone());
            }
        }
        for mut sink in self.anonymous.drain(..) {
            if !sink.is_closed() {
                sink.on_terminate(reason.clone());
            }
        }
        self.return_handler = None;
        self.confirm_handler = None;
        self.flow_handler = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerMessage, ForwardingSink};
    use amq_protocol::protocol::basic::{
        Ack, Cancel, Consume, ConsumeOk, Deliver, Nack, Publish, Qos, QosOk,
    };
    use amq_protocol::protocol::channel::{Close, Flow};
    use amq_protocol::protocol::confirm::{Select, SelectOk};
    use crossbeam_channel::Receiver;
    use std::time::Duration;

    struct Harness {
        state: ChannelState,
        timer: Timer<ConfirmTimerKey>,
    }

    impl Harness {
        fn new() -> Harness {
            Harness {
                state: ChannelState::new(1),
                timer: Timer::default(),
            }
        }

        fn call(&mut self, method: AmqpBasic) -> Receiver<Result<ChannelMessage>> {
            let (tx, rx) = crossbeam_channel::unbounded();
            let buf = OutputBuffer::with_method(1, method).unwrap();
            self.state
                .handle_request(
                    ChannelRequest::Rpc {
                        buf,
                        sync: true,
                        has_content: false,
                        is_publish: false,
                        reply_tx: Some(tx),
                    },
                    &mut self.timer,
                )
                .unwrap();
            rx
        }

        fn cast_publish(&mut self) {
            let buf = OutputBuffer::with_method(1, publish()).unwrap();
            self.state
                .handle_request(
                    ChannelRequest::Rpc {
                        buf,
                        sync: false,
                        has_content: true,
                        is_publish: true,
                        reply_tx: None,
                    },
                    &mut self.timer,
                )
                .unwrap();
        }

        fn call_publish(&mut self) -> Receiver<Result<ChannelMessage>> {
            let (tx, rx) = crossbeam_channel::unbounded();
            let buf = OutputBuffer::with_method(1, publish()).unwrap();
            self.state
                .handle_request(
                    ChannelRequest::Rpc {
                        buf,
                        sync: false,
                        has_content: true,
                        is_publish: true,
                        reply_tx: Some(tx),
                    },
                    &mut self.timer,
                )
                .unwrap();
            rx
        }

        fn consume(&mut self, tag: Option<&str>) -> (Receiver<Result<ChannelMessage>>, Receiver<ConsumerMessage>) {
            let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
            let (msg_tx, msg_rx) = crossbeam_channel::unbounded();
            let consumer_tag = tag.map(|t| t.to_string());
            let buf = OutputBuffer::with_method(
                1,
                AmqpBasic::Consume(Consume {
                    ticket: 0,
                    queue: "q".to_string(),
                    consumer_tag: consumer_tag.clone().unwrap_or_default(),
                    no_local: false,
                    no_ack: true,
                    exclusive: false,
                    nowait: false,
                    arguments: crate::FieldTable::new(),
                }),
            )
            .unwrap();
            self.state
                .handle_request(
                    ChannelRequest::Consume {
                        buf,
                        consumer_tag,
                        sink: Box::new(ForwardingSink::new(msg_tx)),
                        reply_tx,
                    },
                    &mut self.timer,
                )
                .unwrap();
            (reply_rx, msg_rx)
        }

        fn close(&mut self) -> Receiver<Result<ChannelMessage>> {
            let (tx, rx) = crossbeam_channel::unbounded();
            let buf = OutputBuffer::with_method(
                1,
                AmqpChannel::Close(Close {
                    reply_code: 200,
                    reply_text: String::new(),
                    class_id: 0,
                    method_id: 0,
                }),
            )
            .unwrap();
            self.state
                .handle_request(
                    ChannelRequest::CloseChannel { buf, reply_tx: tx },
                    &mut self.timer,
                )
                .unwrap();
            rx
        }

        fn wait_for_confirms(&mut self) -> Receiver<Result<bool>> {
            let (tx, rx) = crossbeam_channel::unbounded();
            self.state
                .handle_request(
                    ChannelRequest::WaitForConfirms {
                        timeout: None,
                        reply_tx: tx,
                    },
                    &mut self.timer,
                )
                .unwrap();
            rx
        }

        fn enable_confirms(&mut self) {
            let rx = self.select();
            self.method(AMQPClass::Confirm(AmqpConfirm::SelectOk(SelectOk {})));
            assert!(rx.try_recv().unwrap().is_ok());
        }

        fn select(&mut self) -> Receiver<Result<ChannelMessage>> {
            let (tx, rx) = crossbeam_channel::unbounded();
            let buf =
                OutputBuffer::with_method(1, AmqpConfirm::Select(Select { nowait: false }))
                    .unwrap();
            self.state
                .handle_request(
                    ChannelRequest::Rpc {
                        buf,
                        sync: true,
                        has_content: false,
                        is_publish: false,
                        reply_tx: Some(tx),
                    },
                    &mut self.timer,
                )
                .unwrap();
            rx
        }

        fn method(&mut self, method: AMQPClass) -> Option<ChannelTermination> {
            self.state.handle_method(method, &mut self.timer).unwrap()
        }

        fn writes(&mut self) -> usize {
            self.state.take_outgoing().len()
        }

        fn deliver(&mut self, tag: &str, payload: &[u8]) {
            self.method(AMQPClass::Basic(AmqpBasic::Deliver(Deliver {
                consumer_tag: tag.to_string(),
                delivery_tag: 1,
                redelivered: false,
                exchange: "".to_string(),
                routing_key: "k".to_string(),
            })));
            self.state
                .handle_header(AMQPContentHeader {
                    class_id: 60,
                    weight: 0,
                    body_size: payload.len() as u64,
                    properties: Default::default(),
                })
                .unwrap();
            if !payload.is_empty() {
                self.state.handle_body(payload.to_vec()).unwrap();
            }
        }
    }

    fn publish() -> AmqpBasic {
        AmqpBasic::Publish(Publish {
            ticket: 0,
            exchange: "".to_string(),
            routing_key: "k".to_string(),
            mandatory: false,
            immediate: false,
        })
    }

    fn qos() -> AmqpBasic {
        AmqpBasic::Qos(Qos {
            prefetch_size: 0,
            prefetch_count: 1,
            global: false,
        })
    }

    fn qos_ok() -> AMQPClass {
        AMQPClass::Basic(AmqpBasic::QosOk(QosOk {}))
    }

    fn ack(delivery_tag: u64, multiple: bool) -> AMQPClass {
        AMQPClass::Basic(AmqpBasic::Ack(Ack {
            delivery_tag,
            multiple,
        }))
    }

    fn nack(delivery_tag: u64, multiple: bool) -> AMQPClass {
        AMQPClass::Basic(AmqpBasic::Nack(Nack {
            delivery_tag,
            multiple,
            requeue: false,
        }))
    }

    fn consume_ok(tag: &str) -> AMQPClass {
        AMQPClass::Basic(AmqpBasic::ConsumeOk(ConsumeOk {
            consumer_tag: tag.to_string(),
        }))
    }

    #[test]
    fn at_most_one_outstanding_sync_rpc() {
        let mut t = Harness::new();
        let rx1 = t.call(qos());
        let rx2 = t.call(qos());
        // only the head write was issued
        assert_eq!(t.writes(), 1);
        assert!(rx1.try_recv().is_err());

        t.method(qos_ok());
        assert!(rx1.try_recv().unwrap().is_ok());
        // the second request advanced and wrote
        assert_eq!(t.writes(), 1);
        assert!(rx2.try_recv().is_err());

        t.method(qos_ok());
        assert!(rx2.try_recv().unwrap().is_ok());
    }

    #[test]
    fn async_chain_drains_eagerly_behind_no_sync_head() {
        let mut t = Harness::new();
        t.cast_publish();
        t.cast_publish();
        assert_eq!(t.writes(), 2);
    }

    #[test]
    fn async_waits_behind_sync_head() {
        let mut t = Harness::new();
        let rx = t.call(qos());
        t.cast_publish();
        // publish must not be written until the qos reply arrives
        assert_eq!(t.writes(), 1);
        t.method(qos_ok());
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(t.writes(), 1);
    }

    #[test]
    fn async_call_completes_on_write() {
        let mut t = Harness::new();
        let rx = t.call_publish();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Ok(ChannelMessage::Accepted)
        ));
    }

    #[test]
    fn flow_off_blocks_content_but_not_control() {
        let mut t = Harness::new();
        t.method(AMQPClass::Channel(AmqpChannel::Flow(Flow { active: false })));
        // flow-ok went out
        assert_eq!(t.writes(), 1);

        let rx = t.call_publish();
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::ChannelBlocked)));
        // content cast is discarded
        t.cast_publish();
        assert_eq!(t.writes(), 0);

        // non-content RPC still goes through
        let rx = t.call(qos());
        assert_eq!(t.writes(), 1);
        t.method(qos_ok());
        assert!(rx.try_recv().unwrap().is_ok());

        t.method(AMQPClass::Channel(AmqpChannel::Flow(Flow { active: true })));
        assert_eq!(t.writes(), 1);
        let rx = t.call_publish();
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(t.writes(), 1);
    }

    #[test]
    fn flow_ok_queues_behind_inflight_rpc() {
        let mut t = Harness::new();
        let rx = t.call(qos());
        assert_eq!(t.writes(), 1);
        t.method(AMQPClass::Channel(AmqpChannel::Flow(Flow { active: false })));
        // flow-ok is parked behind the outstanding qos
        assert_eq!(t.writes(), 0);
        t.method(qos_ok());
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(t.writes(), 1);
    }

    #[test]
    fn confirm_bookkeeping_and_multiple_ack() {
        let mut t = Harness::new();
        t.enable_confirms();
        t.cast_publish(); // seqno 1
        t.cast_publish(); // seqno 2
        t.cast_publish(); // seqno 3
        let waiter = t.wait_for_confirms();
        assert!(waiter.try_recv().is_err());

        t.method(ack(2, true)); // removes 1 and 2
        assert!(waiter.try_recv().is_err());
        t.method(ack(3, false));
        assert_eq!(waiter.try_recv().unwrap().unwrap(), true);
    }

    #[test]
    fn nack_reported_to_waiters_then_reset() {
        let mut t = Harness::new();
        t.enable_confirms();
        t.cast_publish(); // 1
        t.cast_publish(); // 2
        let waiter = t.wait_for_confirms();
        t.method(nack(1, false));
        t.method(ack(2, false));
        assert_eq!(waiter.try_recv().unwrap().unwrap(), false);

        // only_acks_received resets once the set drains
        t.cast_publish(); // 3
        let waiter = t.wait_for_confirms();
        t.method(ack(3, false));
        assert_eq!(waiter.try_recv().unwrap().unwrap(), true);
    }

    #[test]
    fn wait_with_no_outstanding_confirms_succeeds_immediately() {
        let mut t = Harness::new();
        t.enable_confirms();
        let waiter = t.wait_for_confirms();
        assert_eq!(waiter.try_recv().unwrap().unwrap(), true);
    }

    #[test]
    fn wait_without_confirm_mode_fails() {
        let mut t = Harness::new();
        let waiter = t.wait_for_confirms();
        assert!(matches!(
            waiter.try_recv().unwrap(),
            Err(Error::NotInConfirmMode)
        ));
    }

    #[test]
    fn expired_waiter_gets_timeout_and_late_ack_is_harmless() {
        let mut t = Harness::new();
        t.enable_confirms();
        t.cast_publish();
        let (tx, rx) = crossbeam_channel::unbounded();
        t.state
            .handle_request(
                ChannelRequest::WaitForConfirms {
                    timeout: Some(Duration::from_secs(30)),
                    reply_tx: tx,
                },
                &mut t.timer,
            )
            .unwrap();
        t.state.confirm_wait_expired(0);
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::ConfirmsTimedOut)));

        t.method(ack(1, false));
        // the waiter is gone; nothing further arrives
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn client_tag_registers_preemptively_and_duplicates_are_rejected() {
        let mut t = Harness::new();
        let (reply, messages) = t.consume(Some("tag-1"));
        // delivery racing ahead of consume-ok still routes
        t.deliver("tag-1", b"early");
        match messages.try_recv().unwrap() {
            ConsumerMessage::Delivery(delivery) => assert_eq!(delivery.content, b"early"),
            other => panic!("unexpected message {:?}", other),
        }

        t.method(consume_ok("tag-1"));
        match reply.try_recv().unwrap().unwrap() {
            ChannelMessage::ConsumeOk(tag) => assert_eq!(tag, "tag-1"),
            _ => panic!("expected consume-ok"),
        }

        let (reply, _messages) = t.consume(Some("tag-1"));
        assert!(matches!(
            reply.try_recv().unwrap(),
            Err(Error::ConsumerTagAlreadyInUse { .. })
        ));
    }

    #[test]
    fn anonymous_consumes_pair_in_order() {
        let mut t = Harness::new();
        let (reply1, messages1) = t.consume(None);
        t.method(consume_ok("amq.gen-1"));
        match reply1.try_recv().unwrap().unwrap() {
            ChannelMessage::ConsumeOk(tag) => assert_eq!(tag, "amq.gen-1"),
            _ => panic!("expected consume-ok"),
        }

        let (reply2, messages2) = t.consume(None);
        t.method(consume_ok("amq.gen-2"));
        match reply2.try_recv().unwrap().unwrap() {
            ChannelMessage::ConsumeOk(tag) => assert_eq!(tag, "amq.gen-2"),
            _ => panic!("expected consume-ok"),
        }

        t.deliver("amq.gen-1", b"one");
        t.deliver("amq.gen-2", b"two");
        assert!(matches!(
            messages1.try_recv().unwrap(),
            ConsumerMessage::Delivery(_)
        ));
        assert!(matches!(
            messages2.try_recv().unwrap(),
            ConsumerMessage::Delivery(_)
        ));
    }

    #[test]
    fn dead_sink_is_unregistered_before_next_dispatch() {
        let mut t = Harness::new();
        let (reply, messages) = t.consume(Some("tag-1"));
        t.method(consume_ok("tag-1"));
        reply.try_recv().unwrap().unwrap();

        drop(messages);
        t.deliver("tag-1", b"after-drop");
        assert!(t.state.consumers.is_empty());
    }

    #[test]
    fn server_cancel_notifies_sink() {
        let mut t = Harness::new();
        let (reply, messages) = t.consume(Some("tag-1"));
        t.method(consume_ok("tag-1"));
        reply.try_recv().unwrap().unwrap();

        t.method(AMQPClass::Basic(AmqpBasic::Cancel(Cancel {
            consumer_tag: "tag-1".to_string(),
            nowait: true,
        })));
        assert!(matches!(
            messages.try_recv().unwrap(),
            ConsumerMessage::ServerCancelled
        ));
        assert!(t.state.consumers.is_empty());
    }

    #[test]
    fn server_close_terminates_with_reason() {
        let mut t = Harness::new();
        let term = t
            .method(AMQPClass::Channel(AmqpChannel::Close(Close {
                reply_code: 406,
                reply_text: "PRECONDITION_FAILED".to_string(),
                class_id: 0,
                method_id: 0,
            })))
            .expect("server close should terminate the channel");
        // close-ok was sent back
        assert_eq!(t.writes(), 1);
        match term.reason {
            Some(Error::ServerClosedChannel { code: 406, .. }) => (),
            other => panic!("unexpected reason {:?}", other),
        }
    }

    #[test]
    fn simultaneous_close_waits_for_close_ok_and_reports_server_reason() {
        let mut t = Harness::new();
        let reply = t.close();
        assert_eq!(t.writes(), 1);

        // server's close crosses ours: we ack it and keep waiting
        let term = t.method(AMQPClass::Channel(AmqpChannel::Close(Close {
            reply_code: 406,
            reply_text: "PRECONDITION_FAILED".to_string(),
            class_id: 0,
            method_id: 0,
        })));
        assert!(term.is_none());
        assert_eq!(t.writes(), 1); // our close-ok reply

        let term = t
            .method(AMQPClass::Channel(AmqpChannel::CloseOk(ChannelCloseOk {})))
            .expect("close-ok finishes the handshake");
        assert!(reply.try_recv().unwrap().is_ok());
        match term.reason {
            Some(Error::ServerClosedChannel { code: 406, .. }) => (),
            other => panic!("unexpected reason {:?}", other),
        }
    }

    #[test]
    fn rpcs_after_close_are_rejected_and_second_close_reports_closing() {
        let mut t = Harness::new();
        let _reply = t.close();
        let rx = t.call(qos());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::ClientClosedChannel)
        ));
        let second = t.close();
        assert!(matches!(
            second.try_recv().unwrap(),
            Err(Error::ClientClosedChannel)
        ));
    }

    #[test]
    fn terminate_fails_pending_rpcs_and_notifies_sinks() {
        let mut t = Harness::new();
        let (reply, messages) = t.consume(Some("tag-1"));
        t.method(consume_ok("tag-1"));
        reply.try_recv().unwrap().unwrap();
        let pending = t.call(qos());

        let reason = Error::ServerClosedConnection {
            code: 320,
            message: "CONNECTION_FORCED".to_string(),
        };
        t.state.terminate(Some(reason), &mut t.timer);
        assert!(matches!(
            pending.try_recv().unwrap(),
            Err(Error::ServerClosedConnection { .. })
        ));
        assert!(matches!(
            messages.try_recv().unwrap(),
            ConsumerMessage::ServerClosedConnection(_)
        ));
        assert!(t.state.consumers.is_empty());
    }
}
