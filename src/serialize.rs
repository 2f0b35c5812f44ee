use crate::{Error, Result};
use amq_protocol::frame::generation::{
    gen_content_body_frame, gen_content_header_frame, gen_heartbeat_frame, gen_method_frame,
};
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::basic::AMQPProperties;
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::confirm::AMQPMethod as AmqpConfirm;
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::exchange::AMQPMethod as AmqpExchange;
use amq_protocol::protocol::queue::AMQPMethod as AmqpQueue;
use amq_protocol::protocol::tx::AMQPMethod as AmqpTx;
use amq_protocol::protocol::AMQPClass;
use cookie_factory::GenError;
use std::ops::{Index, RangeFrom};
use std::result::Result as StdResult;

/// Conversion from a raw method class into a specific expected method; used
/// to type the replies of synchronous RPCs.
pub trait TryFromAmqpClass: Sized {
    fn try_from(class: AMQPClass) -> Result<Self>;
}

macro_rules! impl_try_from_amqp_class {
    ($($module:ident :: $method:ident => $class:ident :: $variant:ident),+ $(,)?) => {
        $(impl TryFromAmqpClass for amq_protocol::protocol::$module::$method {
            fn try_from(class: AMQPClass) -> Result<Self> {
                match class {
                    AMQPClass::$class($class::$variant(method)) => Ok(method),
                    _ => Err(Error::FrameUnexpected),
                }
            }
        })+
    };
}

use amq_protocol::protocol::basic::AMQPMethod as Basic;
use amq_protocol::protocol::channel::AMQPMethod as Channel;
use amq_protocol::protocol::confirm::AMQPMethod as Confirm;
use amq_protocol::protocol::connection::AMQPMethod as Connection;
use amq_protocol::protocol::exchange::AMQPMethod as Exchange;
use amq_protocol::protocol::queue::AMQPMethod as Queue;
use amq_protocol::protocol::tx::AMQPMethod as Tx;

impl_try_from_amqp_class! {
    connection::CloseOk => Connection::CloseOk,
    channel::OpenOk => Channel::OpenOk,
    channel::CloseOk => Channel::CloseOk,
    channel::FlowOk => Channel::FlowOk,
    exchange::DeclareOk => Exchange::DeclareOk,
    exchange::DeleteOk => Exchange::DeleteOk,
    exchange::BindOk => Exchange::BindOk,
    exchange::UnbindOk => Exchange::UnbindOk,
    queue::DeclareOk => Queue::DeclareOk,
    queue::BindOk => Queue::BindOk,
    queue::UnbindOk => Queue::UnbindOk,
    queue::PurgeOk => Queue::PurgeOk,
    queue::DeleteOk => Queue::DeleteOk,
    basic::QosOk => Basic::QosOk,
    basic::CancelOk => Basic::CancelOk,
    basic::RecoverOk => Basic::RecoverOk,
    confirm::SelectOk => Confirm::SelectOk,
    tx::SelectOk => Tx::SelectOk,
    tx::CommitOk => Tx::CommitOk,
    tx::RollbackOk => Tx::RollbackOk,
}

/// Conversion from a raw inbound frame into a specific expected method on a
/// specific channel; used by the connection handshake.
pub trait TryFromAmqpFrame: Sized {
    fn try_from(channel_id: u16, frame: AMQPFrame) -> Result<Self>;
}

macro_rules! impl_try_from_amqp_frame {
    ($($module:ident :: $method:ident => $class:ident :: $variant:ident),+ $(,)?) => {
        $(impl TryFromAmqpFrame for amq_protocol::protocol::$module::$method {
            fn try_from(channel_id: u16, frame: AMQPFrame) -> Result<Self> {
                match frame {
                    AMQPFrame::Method(id, AMQPClass::$class($class::$variant(method)))
                        if id == channel_id =>
                    {
                        Ok(method)
                    }
                    _ => Err(Error::FrameUnexpected),
                }
            }
        })+
    };
}

impl_try_from_amqp_frame! {
    connection::Start => Connection::Start,
    connection::Secure => Connection::Secure,
    connection::Tune => Connection::Tune,
    connection::OpenOk => Connection::OpenOk,
    connection::Close => Connection::Close,
}

pub trait IntoAmqpClass {
    fn into_class(self) -> AMQPClass;
}

macro_rules! impl_into_amqp_class {
    ($($method:ty => $variant:ident),+ $(,)?) => {
        $(impl IntoAmqpClass for $method {
            fn into_class(self) -> AMQPClass {
                AMQPClass::$variant(self)
            }
        })+
    };
}

impl_into_amqp_class! {
    AmqpConnection => Connection,
    AmqpChannel => Channel,
    AmqpBasic => Basic,
    AmqpExchange => Exchange,
    AmqpQueue => Queue,
    AmqpConfirm => Confirm,
    AmqpTx => Tx,
}

impl IntoAmqpClass for AMQPClass {
    fn into_class(self) -> AMQPClass {
        self
    }
}

/// Buffer of serialized frames waiting to be handed to the I/O loop.
#[derive(Clone)]
pub struct OutputBuffer(Vec<u8>);

impl OutputBuffer {
    pub fn with_protocol_header() -> OutputBuffer {
        OutputBuffer(Vec::from("AMQP\x00\x00\x09\x01".as_bytes()))
    }

    pub fn empty() -> OutputBuffer {
        OutputBuffer(Vec::new())
    }

    pub fn with_method<M: IntoAmqpClass>(channel_id: u16, method: M) -> Result<OutputBuffer> {
        let mut buf = OutputBuffer::empty();
        buf.push_method(channel_id, method)?;
        Ok(buf)
    }

    pub fn push_method<M: IntoAmqpClass>(&mut self, channel_id: u16, method: M) -> Result<()> {
        let class = method.into_class();
        serialize(&mut self.0, |buf, pos| {
            gen_method_frame((buf, pos), channel_id, &class)
        })
    }

    /// Pushes a content-bearing method as a single unit: the method frame,
    /// the content header, and as many body frames as the negotiated frame
    /// max requires. Keeping the sequence in one buffer guarantees frames
    /// from other channels cannot be interleaved inside it.
    pub fn push_method_with_content<M: IntoAmqpClass>(
        &mut self,
        channel_id: u16,
        method: M,
        class_id: u16,
        properties: &AMQPProperties,
        content: &[u8],
        frame_max: usize,
    ) -> Result<()> {
        self.push_method(channel_id, method)?;
        serialize(&mut self.0, |buf, pos| {
            gen_content_header_frame((buf, pos), channel_id, class_id, content.len() as u64, properties)
        })?;
        // Each content frame has 8 bytes of overhead (7-byte header plus the
        // frame-end octet); a frame_max of 0 means the server put no bound on
        // frame sizes.
        let max_body = match frame_max {
            0 => content.len().max(1),
            n => n.saturating_sub(8).max(1),
        };
        for chunk in content.chunks(max_body) {
            serialize(&mut self.0, |buf, pos| {
                gen_content_body_frame((buf, pos), channel_id, chunk)
            })?;
        }
        Ok(())
    }

    pub fn push_heartbeat(&mut self) {
        // serializing a heartbeat frame cannot fail; safe to unwrap.
        serialize(&mut self.0, |buf, pos| gen_heartbeat_frame((buf, pos))).unwrap();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0.clear()
    }

    #[inline]
    pub fn drain_written(&mut self, n: usize) {
        self.0.drain(0..n);
    }

    #[inline]
    pub fn append(&mut self, mut other: OutputBuffer) {
        self.0.append(&mut other.0)
    }

    pub fn drain_into_new_buf(&mut self) -> OutputBuffer {
        let mut new_buf = OutputBuffer::empty();
        std::mem::swap(&mut new_buf.0, &mut self.0);
        new_buf
    }
}

impl Index<RangeFrom<usize>> for OutputBuffer {
    type Output = [u8];

    #[inline]
    fn index(&self, index: RangeFrom<usize>) -> &[u8] {
        &self.0[index]
    }
}

/// Output buffer that can be sealed once a connection close or close-ok has
/// been queued; anything pushed after sealing is silently discarded.
pub struct SealableOutputBuffer {
    inner: OutputBuffer,
    sealed: bool,
}

impl SealableOutputBuffer {
    pub fn new(inner: OutputBuffer) -> SealableOutputBuffer {
        SealableOutputBuffer {
            inner,
            sealed: false,
        }
    }

    #[inline]
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn push_method<M: IntoAmqpClass>(&mut self, channel_id: u16, method: M) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.inner.push_method(channel_id, method)
    }

    pub fn push_heartbeat(&mut self) {
        if !self.sealed {
            self.inner.push_heartbeat();
        }
    }

    pub fn append(&mut self, other: OutputBuffer) {
        if !self.sealed {
            self.inner.append(other);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.inner.clear()
    }

    #[inline]
    pub fn drain_written(&mut self, n: usize) {
        self.inner.drain_written(n)
    }
}

impl Index<RangeFrom<usize>> for SealableOutputBuffer {
    type Output = [u8];

    #[inline]
    fn index(&self, index: RangeFrom<usize>) -> &[u8] {
        &self.inner[index]
    }
}

fn serialize<F: Fn(&mut [u8], usize) -> StdResult<(&mut [u8], usize), GenError>>(
    buf: &mut Vec<u8>,
    f: F,
) -> Result<()> {
    let pos = buf.len();
    loop {
        let resize_to = match f(buf, pos) {
            Ok(_) => return Ok(()),
            Err(GenError::BufferTooSmall(n)) => n,
            Err(_) => return Err(Error::InternalSerializationError),
        };
        buf.resize(resize_to, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amq_protocol::protocol::basic::Publish;

    fn publish() -> AmqpBasic {
        AmqpBasic::Publish(Publish {
            ticket: 0,
            exchange: "".to_string(),
            routing_key: "test".to_string(),
            mandatory: false,
            immediate: false,
        })
    }

    // Content frames have 7 bytes of header (type, channel, size) and a
    // trailing frame-end octet.
    fn count_body_frames(buf: &[u8]) -> Vec<usize> {
        let mut sizes = Vec::new();
        let mut pos = 0;
        while pos < buf.len() {
            let size = u32::from_be_bytes([buf[pos + 3], buf[pos + 4], buf[pos + 5], buf[pos + 6]])
                as usize;
            if buf[pos] == 3 {
                sizes.push(size);
            }
            pos += size + 8;
        }
        sizes
    }

    #[test]
    fn small_content_is_a_single_body_frame() {
        let mut buf = OutputBuffer::empty();
        buf.push_method_with_content(
            1,
            publish(),
            Publish::get_class_id(),
            &AMQPProperties::default(),
            b"hello",
            4096,
        )
        .unwrap();
        assert_eq!(count_body_frames(&buf[0..]), vec![5]);
    }

    #[test]
    fn oversized_content_splits_at_frame_max_minus_overhead() {
        let frame_max = 4096;
        let content = vec![7u8; 2 * (frame_max - 8) + 100];
        let mut buf = OutputBuffer::empty();
        buf.push_method_with_content(
            1,
            publish(),
            Publish::get_class_id(),
            &AMQPProperties::default(),
            &content,
            frame_max,
        )
        .unwrap();
        assert_eq!(
            count_body_frames(&buf[0..]),
            vec![frame_max - 8, frame_max - 8, 100]
        );
    }

    #[test]
    fn zero_frame_max_does_not_split() {
        let content = vec![7u8; 1 << 18];
        let mut buf = OutputBuffer::empty();
        buf.push_method_with_content(
            1,
            publish(),
            Publish::get_class_id(),
            &AMQPProperties::default(),
            &content,
            0,
        )
        .unwrap();
        assert_eq!(count_body_frames(&buf[0..]), vec![1 << 18]);
    }

    #[test]
    fn sealed_buffer_discards_writes() {
        let mut buf = SealableOutputBuffer::new(OutputBuffer::empty());
        buf.push_method(0, publish()).unwrap();
        let len = buf.len();
        buf.seal();
        buf.push_method(0, publish()).unwrap();
        buf.push_heartbeat();
        assert_eq!(buf.len(), len);
    }
}
