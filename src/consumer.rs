use crate::{Channel, Delivery, Error, FieldTable, Result};
use crossbeam_channel::{Receiver, Sender};
use std::any::Any;
use std::cell::Cell;

/// Opaque payload for sink-directed calls and notifications.
pub type SinkMessage = Box<dyn Any + Send>;

/// Reply slot handed to [`ConsumerSink::on_call`](trait.ConsumerSink.html#method.on_call).
///
/// The sink may complete it inside the callback (a synchronous reply) or
/// stash it away and complete it later from any thread (a deferred reply).
/// Dropping the slot without completing it fails the caller.
pub struct SinkReplySlot(Sender<SinkMessage>);

impl SinkReplySlot {
    pub(crate) fn new(tx: Sender<SinkMessage>) -> SinkReplySlot {
        SinkReplySlot(tx)
    }

    /// Complete the pending call with `reply`.
    pub fn complete(self, reply: SinkMessage) {
        let _ = self.0.send(reply);
    }
}

/// Per-subscription event sink.
///
/// All callbacks for a given sink are invoked from the connection's I/O
/// thread, one event at a time; implementations never see reentrant or
/// concurrent dispatch. Because of that, callbacks must not block on
/// operations served by the same connection: long-running work stalls every
/// channel, and calling [`Channel`](struct.Channel.html) methods from inside
/// a callback can deadlock. Hand the event to another thread (or use the
/// built-in forwarding behavior via
/// [`Channel::consumer`](struct.Channel.html#method.consumer)) instead.
pub trait ConsumerSink: Send + 'static {
    /// The subscription was acknowledged by the server under `consumer_tag`.
    fn on_consume_ok(&mut self, _consumer_tag: &str) {}

    /// A client-requested cancel was acknowledged by the server.
    fn on_cancel_ok(&mut self, _consumer_tag: &str) {}

    /// The server cancelled this subscription (e.g., the queue was deleted).
    fn on_cancel(&mut self, _consumer_tag: &str) {}

    /// A message arrived for this subscription.
    fn on_deliver(&mut self, delivery: Delivery);

    /// An out-of-band notification sent via
    /// [`Channel::notify_consumer`](struct.Channel.html#method.notify_consumer).
    fn on_info(&mut self, _info: SinkMessage) {}

    /// A synchronous request sent via
    /// [`Channel::call_consumer`](struct.Channel.html#method.call_consumer).
    fn on_call(&mut self, _msg: SinkMessage, reply: SinkReplySlot) {
        reply.complete(Box::new(()));
    }

    /// The channel this sink is attached to is going away. `None` for a clean
    /// client-initiated teardown; `Some` carries the server or failure reason.
    fn on_terminate(&mut self, _reason: Option<Error>) {}

    /// True once the sink can no longer accept events (its backing endpoint
    /// is gone). Closed sinks are unregistered with a warning instead of
    /// receiving further events.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Messages delivered to the receiving side of a forwarding consumer.
// Clippy warns about ConsumerMessage::Delivery being much larger than the other variants, but we
// expect almost all instances of ConsumerMessage to be Deliveries.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub enum ConsumerMessage {
    /// A delivered message.
    Delivery(Delivery),

    /// The consumer was cancelled by the client; e.g., by calling
    /// [`Consumer::cancel`](struct.Consumer.html#method.cancel).
    ClientCancelled,

    /// The consumer has been cancelled by the server; e.g., because the queue the consumer is
    /// attached to was deleted.
    ServerCancelled,

    /// The client has closed the channel where this consumer was created.
    ClientClosedChannel,

    /// The server has closed the channel where this consumer was created.
    ServerClosedChannel(Error),

    /// The client has closed the connection where this consumer was created.
    ClientClosedConnection,

    /// The server has closed the connection where this consumer was created.
    ServerClosedConnection(Error),
}

/// The built-in sink: forwards every subscription event into a crossbeam
/// channel whose receiving half is held by the application (usually wrapped
/// in a [`Consumer`](struct.Consumer.html)).
pub struct ForwardingSink {
    tx: Sender<ConsumerMessage>,
    closed: bool,
}

impl ForwardingSink {
    pub fn new(tx: Sender<ConsumerMessage>) -> ForwardingSink {
        ForwardingSink { tx, closed: false }
    }

    fn forward(&mut self, message: ConsumerMessage) {
        if self.tx.send(message).is_err() {
            self.closed = true;
        }
    }
}

impl ConsumerSink for ForwardingSink {
    fn on_cancel_ok(&mut self, _consumer_tag: &str) {
        self.forward(ConsumerMessage::ClientCancelled);
    }

    fn on_cancel(&mut self, _consumer_tag: &str) {
        self.forward(ConsumerMessage::ServerCancelled);
    }

    fn on_deliver(&mut self, delivery: Delivery) {
        self.forward(ConsumerMessage::Delivery(delivery));
    }

    fn on_terminate(&mut self, reason: Option<Error>) {
        let message = match reason {
            None => ConsumerMessage::ClientClosedChannel,
            Some(Error::ClientClosedConnection) => ConsumerMessage::ClientClosedConnection,
            Some(err @ Error::ServerClosedChannel { .. }) => {
                ConsumerMessage::ServerClosedChannel(err)
            }
            Some(err) => ConsumerMessage::ServerClosedConnection(err),
        };
        self.forward(message);
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Options passed to the server when starting a consumer.
///
/// The [`default`](#impl-Default) implementation sets all boolean fields to false and has an empty
/// set of arguments.
#[derive(Clone, Debug, Default)]
pub struct ConsumerOptions {
    /// A specific consumer tag to use. If empty (the default), the server
    /// assigns a tag and reports it in `consume-ok`.
    pub consumer_tag: String,

    /// If true, the server will not send this consumer messages that were published by the
    /// consumer's connection.
    pub no_local: bool,

    /// If true, the server assumes all delivered messages are acknowledged, and the client should
    /// not acknowledge messages.
    pub no_ack: bool,

    /// If true, requires that this consumer is the only one attached to the queue. If other
    /// consumers are active, the server will close the channel.
    pub exclusive: bool,

    /// Extra arguments; these are optional in general, but may be needed for some plugins or
    /// server-specific features.
    pub arguments: FieldTable,
}

/// A forwarding consumer attached to an AMQP queue.
///
/// # Example
///
/// ```rust,no_run
/// use coney::{Consumer, ConsumerMessage, Result};
/// # use coney::Delivery;
///
/// # fn handle_delivery(_: Delivery) {}
/// // Receive (at least) n messages on the consumer, then cancel it.
/// fn consume_n_messages(consumer: Consumer, n: usize) -> Result<()> {
///     for (i, message) in consumer.receiver().iter().enumerate() {
///         match message {
///             ConsumerMessage::Delivery(delivery) => handle_delivery(delivery),
///             ConsumerMessage::ServerClosedChannel(err)
///             | ConsumerMessage::ServerClosedConnection(err) => return Err(err),
///             ConsumerMessage::ClientCancelled
///             | ConsumerMessage::ServerCancelled
///             | ConsumerMessage::ClientClosedChannel
///             | ConsumerMessage::ClientClosedConnection => break,
///         }
///         if i >= n {
///             consumer.cancel()?;
///         }
///     }
///     Ok(())
/// }
/// ```
pub struct Consumer<'a> {
    channel: &'a Channel,
    consumer_tag: String,
    rx: Receiver<ConsumerMessage>,
    cancelled: Cell<bool>,
}

impl Drop for Consumer<'_> {
    fn drop(&mut self) {
        let _ = self.cancel();
    }
}

impl Consumer<'_> {
    pub(crate) fn new(
        channel: &Channel,
        consumer_tag: String,
        rx: Receiver<ConsumerMessage>,
    ) -> Consumer {
        Consumer {
            channel,
            consumer_tag,
            rx,
            cancelled: Cell::new(false),
        }
    }

    /// The server-assigned consumer tag.
    #[inline]
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// The `crossbeam_channel::Receiver` on which messages will be delivered. Once a consumer
    /// message of any variant other than
    /// [`Delivery`](enum.ConsumerMessage.html#variant.Delivery) has been received, no more
    /// messages will be sent and the sending side of the channel will be dropped.
    #[inline]
    pub fn receiver(&self) -> &Receiver<ConsumerMessage> {
        &self.rx
    }

    /// Cancel this consumer.
    ///
    /// When the cancellation is acknowledged by the server, the channel returned by
    /// [`receiver`](#method.receiver) will receive a
    /// [`ConsumerMessage::ClientCancelled`](enum.ConsumerMessage.html#variant.ClientCancelled)
    /// message. This method does not consume `self` because it is inherently racy; the
    /// server may be sending us additional messages as we are attempting to cancel.
    ///
    /// Calling this method a second or later time will always return `Ok`; if you care about
    /// cancellation errors, you must capture the `Err` value on the first call.
    pub fn cancel(&self) -> Result<()> {
        if self.cancelled.get() {
            return Ok(());
        }
        self.cancelled.set(true);
        self.channel.basic_cancel(&self.consumer_tag)
    }

    /// Calls [`Delivery::ack`](struct.Delivery.html#method.ack) on `delivery` using the channel
    /// that contains this consumer.
    #[inline]
    pub fn ack(&self, delivery: &Delivery) -> Result<()> {
        delivery.ack(self.channel, false)
    }

    /// Calls [`Delivery::nack`](struct.Delivery.html#method.nack) on `delivery` using the channel
    /// that contains this consumer.
    #[inline]
    pub fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        delivery.nack(self.channel, false, requeue)
    }
}
