use super::io_loop_handle::{IoLoopHandle, IoLoopHandle0};
use crate::serialize::{IntoAmqpClass, TryFromAmqpClass};
use crate::{
    ConnectionBlockedNotification, ConsumerSink, Error, Get, Result, Return, SinkMessage,
};
use crate::{AmqpProperties, Confirm};
use amq_protocol::protocol::basic::Consume;
use amq_protocol::protocol::basic::Get as AmqpGet;
use amq_protocol::protocol::basic::Publish;
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::channel::Close as ChannelClose;
use amq_protocol::protocol::channel::Open as ChannelOpen;
use amq_protocol::protocol::channel::OpenOk as ChannelOpenOk;
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::Close as ConnectionClose;
use amq_protocol::protocol::constants::REPLY_SUCCESS;
use amq_protocol::protocol::AMQPClass;
use crossbeam_channel::Sender as CrossbeamSender;
use log::{debug, trace};
use std::time::Duration;

/// Handle to the connection's own channel (channel 0).
pub(crate) struct Channel0Handle {
    handle: IoLoopHandle0,
    frame_max: usize,
}

impl Channel0Handle {
    pub(super) fn new(handle: IoLoopHandle0, frame_max: usize) -> Channel0Handle {
        assert_eq!(
            handle.channel_id(),
            0,
            "handle for Channel0 must be channel 0"
        );
        Channel0Handle { handle, frame_max }
    }

    pub(crate) fn close_connection(&mut self) -> Result<()> {
        let close = AmqpConnection::Close(ConnectionClose {
            reply_code: REPLY_SUCCESS as u16,
            reply_text: "goodbye".to_string(),
            class_id: 0,
            method_id: 0,
        });
        let buf = self.handle.make_buf(close)?;
        self.handle.close_connection(buf)
    }

    pub(crate) fn open_channel(&mut self, channel_id: Option<u16>) -> Result<ChannelHandle> {
        let handle = self.handle.allocate_channel(channel_id)?;
        let mut handle = ChannelHandle {
            handle,
            frame_max: self.frame_max,
        };

        debug!("opening channel {}", handle.channel_id());
        let open = AmqpChannel::Open(ChannelOpen {
            out_of_band: String::new(),
        });
        let open_ok: ChannelOpenOk = handle.call(open)?;
        trace!("got open-ok: {:?}", open_ok);
        Ok(handle)
    }

    pub(crate) fn set_blocked_tx(
        &mut self,
        tx: CrossbeamSender<ConnectionBlockedNotification>,
    ) -> Result<()> {
        self.handle.set_blocked_tx(tx)
    }
}

/// Handle to one application channel; owned by `Channel` behind a mutex.
pub(crate) struct ChannelHandle {
    handle: IoLoopHandle,
    frame_max: usize,
}

impl ChannelHandle {
    #[inline]
    pub(crate) fn channel_id(&self) -> u16 {
        self.handle.channel_id()
    }

    /// Typed synchronous RPC used by the convenience wrappers; the method
    /// must be one the broker answers with `T`.
    pub(crate) fn call<M: IntoAmqpClass, T: TryFromAmqpClass>(&mut self, method: M) -> Result<T> {
        match self.call_generic(method.into_class(), true)? {
            Some(reply) => T::try_from(reply),
            None => Err(Error::FrameUnexpected),
        }
    }

    pub(crate) fn call_generic(
        &mut self,
        method: AMQPClass,
        sync: bool,
    ) -> Result<Option<AMQPClass>> {
        let buf = self.handle.make_buf(method)?;
        self.handle.call_rpc(buf, sync, false, false)
    }

    pub(crate) fn cast(&mut self, method: AMQPClass) -> Result<()> {
        let buf = self.handle.make_buf(method)?;
        self.handle.cast_rpc(buf, false, false)
    }

    pub(crate) fn publish(
        &mut self,
        publish: Publish,
        content: &[u8],
        properties: &AmqpProperties,
        wait_for_write: bool,
    ) -> Result<()> {
        let channel_id = self.handle.channel_id();
        let frame_max = self.frame_max;
        self.handle.scratch_buf().push_method_with_content(
            channel_id,
            AmqpBasic::Publish(publish),
            Publish::get_class_id(),
            properties,
            content,
            frame_max,
        )?;
        let buf = self.handle.take_scratch();
        if wait_for_write {
            self.handle.call_rpc(buf, false, true, true).map(|_| ())
        } else {
            self.handle.cast_rpc(buf, true, true)
        }
    }

    pub(crate) fn consume(
        &mut self,
        consume: Consume,
        sink: Box<dyn ConsumerSink>,
    ) -> Result<String> {
        let consumer_tag = match consume.consumer_tag.as_str() {
            "" => None,
            tag => Some(tag.to_string()),
        };
        let buf = self.handle.make_buf(AmqpBasic::Consume(consume))?;
        self.handle.consume(buf, consumer_tag, sink)
    }

    pub(crate) fn get(&mut self, get: AmqpGet) -> Result<Option<Get>> {
        let buf = self.handle.make_buf(AmqpBasic::Get(get))?;
        self.handle.get(buf)
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        let close = AmqpChannel::Close(ChannelClose {
            reply_code: REPLY_SUCCESS as u16,
            reply_text: "goodbye".to_string(),
            class_id: 0,
            method_id: 0,
        });
        debug!("closing channel {}", self.channel_id());
        let buf = self.handle.make_buf(close)?;
        self.handle.close_channel(buf)
    }

    pub(crate) fn next_publish_seqno(&mut self) -> Result<u64> {
        self.handle.next_publish_seqno()
    }

    pub(crate) fn wait_for_confirms(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.handle.wait_for_confirms(timeout)
    }

    pub(crate) fn set_return_handler(
        &mut self,
        handler: Option<CrossbeamSender<Return>>,
    ) -> Result<()> {
        self.handle.set_return_handler(handler)
    }

    pub(crate) fn set_confirm_handler(
        &mut self,
        handler: Option<CrossbeamSender<Confirm>>,
    ) -> Result<()> {
        self.handle.set_confirm_handler(handler)
    }

    pub(crate) fn set_flow_handler(
        &mut self,
        handler: Option<CrossbeamSender<bool>>,
    ) -> Result<()> {
        self.handle.set_flow_handler(handler)
    }

    pub(crate) fn call_consumer(
        &mut self,
        consumer_tag: String,
        message: SinkMessage,
    ) -> Result<SinkMessage> {
        self.handle.call_consumer(consumer_tag, message)
    }

    pub(crate) fn notify_consumer(
        &mut self,
        consumer_tag: String,
        message: SinkMessage,
    ) -> Result<()> {
        self.handle.notify_consumer(consumer_tag, message)
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.handle.flush()
    }
}
