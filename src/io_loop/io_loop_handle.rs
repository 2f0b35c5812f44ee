use super::{ChannelMessage, ChannelRequest};
use crate::errors::TimedOutWaitingCloseOkSnafu;
use crate::serialize::{IntoAmqpClass, OutputBuffer};
use crate::{Confirm, ConsumerSink, Error, Get, Result, Return, SinkMessage};
use amq_protocol::protocol::AMQPClass;
use crossbeam_channel::Receiver as CrossbeamReceiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender as CrossbeamSender;
use mio_extras::channel::SyncSender as MioSyncSender;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Application-thread side of one channel's request pipe into the I/O loop.
///
/// Every synchronous request carries its own reply sender, so requests from
/// multiple clones of a channel handle queue up in the I/O thread's per
/// channel FIFO and are answered individually, in order.
pub(super) struct IoLoopHandle {
    channel_id: u16,
    buf: OutputBuffer,
    tx: MioSyncSender<ChannelRequest>,
}

impl IoLoopHandle {
    pub(super) fn new(channel_id: u16, tx: MioSyncSender<ChannelRequest>) -> IoLoopHandle {
        IoLoopHandle {
            channel_id,
            buf: OutputBuffer::empty(),
            tx,
        }
    }

    #[inline]
    pub(super) fn channel_id(&self) -> u16 {
        self.channel_id
    }

    pub(super) fn make_buf<M: IntoAmqpClass>(&mut self, method: M) -> Result<OutputBuffer> {
        debug_assert!(self.buf.is_empty());
        self.buf.push_method(self.channel_id, method)?;
        Ok(self.buf.drain_into_new_buf())
    }

    pub(super) fn scratch_buf(&mut self) -> &mut OutputBuffer {
        debug_assert!(self.buf.is_empty());
        &mut self.buf
    }

    pub(super) fn take_scratch(&mut self) -> OutputBuffer {
        self.buf.drain_into_new_buf()
    }

    /// Issue an RPC. A `Some` result is the broker's reply method; `None`
    /// means the request was asynchronous and has been accepted for ordered
    /// write.
    pub(super) fn call_rpc(
        &mut self,
        buf: OutputBuffer,
        sync: bool,
        has_content: bool,
        is_publish: bool,
    ) -> Result<Option<AMQPClass>> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(ChannelRequest::Rpc {
            buf,
            sync,
            has_content,
            is_publish,
            reply_tx: Some(reply_tx),
        })?;
        match self.recv(&reply_rx)? {
            ChannelMessage::Method(method) => Ok(Some(method)),
            ChannelMessage::Accepted => Ok(None),
            ChannelMessage::ConsumeOk(_) | ChannelMessage::GetOk(_) => {
                Err(Error::FrameUnexpected)
            }
        }
    }

    /// Issue a fire-and-forget request; the write is ordered behind any
    /// queued RPCs but no acknowledgement is awaited.
    pub(super) fn cast_rpc(
        &mut self,
        buf: OutputBuffer,
        has_content: bool,
        is_publish: bool,
    ) -> Result<()> {
        self.send(ChannelRequest::Rpc {
            buf,
            sync: false,
            has_content,
            is_publish,
            reply_tx: None,
        })
    }

    pub(super) fn consume(
        &mut self,
        buf: OutputBuffer,
        consumer_tag: Option<String>,
        sink: Box<dyn ConsumerSink>,
    ) -> Result<String> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(ChannelRequest::Consume {
            buf,
            consumer_tag,
            sink,
            reply_tx,
        })?;
        match self.recv(&reply_rx)? {
            ChannelMessage::ConsumeOk(tag) => Ok(tag),
            _ => Err(Error::FrameUnexpected),
        }
    }

    pub(super) fn get(&mut self, buf: OutputBuffer) -> Result<Option<Get>> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(ChannelRequest::Get { buf, reply_tx })?;
        match self.recv(&reply_rx)? {
            ChannelMessage::GetOk(get) => Ok(*get),
            _ => Err(Error::FrameUnexpected),
        }
    }

    /// Close this channel; waits a bounded time for the server's close-ok.
    pub(super) fn close_channel(&mut self, buf: OutputBuffer) -> Result<()> {
        const CLOSE_OK_WAIT: Duration = Duration::from_secs(3);

        let channel_id = self.channel_id;
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(ChannelRequest::CloseChannel { buf, reply_tx })?;
        match reply_rx.recv_timeout(CLOSE_OK_WAIT) {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => {
                TimedOutWaitingCloseOkSnafu { channel_id }.fail()
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::EventLoopDropped),
        }
    }

    /// Close the whole connection; waits for channels to flush and the
    /// server's close-ok, up to a bounded time.
    pub(super) fn close_connection(&mut self, buf: OutputBuffer) -> Result<()> {
        const CLOSE_WAIT: Duration = Duration::from_secs(60);

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(ChannelRequest::CloseConnection { buf, reply_tx })?;
        match reply_rx.recv_timeout(CLOSE_WAIT) {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => Err(Error::TimedOutClosingConnection),
            Err(RecvTimeoutError::Disconnected) => Err(Error::EventLoopDropped),
        }
    }

    pub(super) fn next_publish_seqno(&mut self) -> Result<u64> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(ChannelRequest::NextPublishSeqno { reply_tx })?;
        reply_rx.recv().map_err(|_| Error::EventLoopDropped)
    }

    pub(super) fn wait_for_confirms(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(ChannelRequest::WaitForConfirms { timeout, reply_tx })?;
        reply_rx.recv().map_err(|_| Error::EventLoopDropped)?
    }

    pub(super) fn set_return_handler(
        &mut self,
        handler: Option<CrossbeamSender<Return>>,
    ) -> Result<()> {
        self.send(ChannelRequest::SetReturnHandler(handler))
    }

    pub(super) fn set_confirm_handler(
        &mut self,
        handler: Option<CrossbeamSender<Confirm>>,
    ) -> Result<()> {
        self.send(ChannelRequest::SetConfirmHandler(handler))
    }

    pub(super) fn set_flow_handler(
        &mut self,
        handler: Option<CrossbeamSender<bool>>,
    ) -> Result<()> {
        self.send(ChannelRequest::SetFlowHandler(handler))
    }

    pub(super) fn call_consumer(
        &mut self,
        consumer_tag: String,
        message: SinkMessage,
    ) -> Result<SinkMessage> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(ChannelRequest::CallConsumer {
            consumer_tag,
            message,
            reply_tx,
        })?;
        reply_rx.recv().map_err(|_| Error::EventLoopDropped)
    }

    pub(super) fn notify_consumer(
        &mut self,
        consumer_tag: String,
        message: SinkMessage,
    ) -> Result<()> {
        self.send(ChannelRequest::NotifyConsumer {
            consumer_tag,
            message,
        })
    }

    /// Block until all writes queued so far are on the wire.
    pub(super) fn flush(&mut self) -> Result<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(ChannelRequest::Flush { reply_tx })?;
        reply_rx.recv().map_err(|_| Error::EventLoopDropped)
    }

    fn send(&mut self, request: ChannelRequest) -> Result<()> {
        // A send failure means the I/O thread is gone (it dropped the
        // receiving side while tearing down).
        self.tx
            .send(request)
            .map_err(|_| Error::EventLoopDropped)
    }

    fn recv(&mut self, rx: &CrossbeamReceiver<Result<ChannelMessage>>) -> Result<ChannelMessage> {
        rx.recv().map_err(|_| Error::EventLoopDropped)?
    }
}

/// Channel 0's handle: everything a regular channel has, plus connection
/// management plumbing (channel allocation and blocked notifications).
pub(super) struct IoLoopHandle0 {
    common: IoLoopHandle,
    set_blocked_tx: MioSyncSender<CrossbeamSender<crate::ConnectionBlockedNotification>>,
    alloc_chan_req_tx: MioSyncSender<Option<u16>>,
    alloc_chan_rep_rx: CrossbeamReceiver<Result<IoLoopHandle>>,
}

impl IoLoopHandle0 {
    pub(super) fn new(
        common: IoLoopHandle,
        set_blocked_tx: MioSyncSender<CrossbeamSender<crate::ConnectionBlockedNotification>>,
        alloc_chan_req_tx: MioSyncSender<Option<u16>>,
        alloc_chan_rep_rx: CrossbeamReceiver<Result<IoLoopHandle>>,
    ) -> IoLoopHandle0 {
        IoLoopHandle0 {
            common,
            set_blocked_tx,
            alloc_chan_req_tx,
            alloc_chan_rep_rx,
        }
    }

    pub(super) fn allocate_channel(&mut self, channel_id: Option<u16>) -> Result<IoLoopHandle> {
        self.alloc_chan_req_tx
            .send(channel_id)
            .map_err(|_| Error::EventLoopDropped)?;
        self.alloc_chan_rep_rx
            .recv()
            .map_err(|_| Error::EventLoopDropped)?
    }

    pub(super) fn set_blocked_tx(
        &mut self,
        tx: CrossbeamSender<crate::ConnectionBlockedNotification>,
    ) -> Result<()> {
        self.set_blocked_tx
            .send(tx)
            .map_err(|_| Error::EventLoopDropped)
    }
}

impl Deref for IoLoopHandle0 {
    type Target = IoLoopHandle;

    fn deref(&self) -> &IoLoopHandle {
        &self.common
    }
}

impl DerefMut for IoLoopHandle0 {
    fn deref_mut(&mut self) -> &mut IoLoopHandle {
        &mut self.common
    }
}
