use crate::{AmqpProperties, Channel, Result};
use amq_protocol::protocol::basic::{Deliver, GetOk};

/// A message delivered to a consumer, or fetched via
/// [`basic_get`](struct.Channel.html#method.basic_get).
#[derive(Clone, Debug)]
pub struct Delivery {
    delivery_tag: u64,

    /// True if this message was previously delivered and has been requeued.
    pub redelivered: bool,

    /// The exchange the message was originally published to.
    pub exchange: String,

    /// The routing key the message was published with.
    pub routing_key: String,

    /// The message payload. An empty payload is a valid message; "no content
    /// at all" is represented by the absence of a `Delivery`.
    pub content: Vec<u8>,

    /// Message properties from the content header.
    pub properties: AmqpProperties,
}

impl Delivery {
    pub(crate) fn new(
        deliver: Deliver,
        content: Vec<u8>,
        properties: AmqpProperties,
    ) -> (String, Delivery) {
        (
            deliver.consumer_tag,
            Delivery {
                delivery_tag: deliver.delivery_tag,
                redelivered: deliver.redelivered,
                exchange: deliver.exchange,
                routing_key: deliver.routing_key,
                content,
                properties,
            },
        )
    }

    pub(crate) fn new_get_ok(
        get_ok: GetOk,
        content: Vec<u8>,
        properties: AmqpProperties,
    ) -> Delivery {
        Delivery {
            delivery_tag: get_ok.delivery_tag,
            redelivered: get_ok.redelivered,
            exchange: get_ok.exchange,
            routing_key: get_ok.routing_key,
            content,
            properties,
        }
    }

    /// The channel-scoped, monotonically increasing tag identifying this
    /// delivery for ack/nack purposes.
    #[inline]
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Acknowledge this delivery on the channel it arrived on.
    #[inline]
    pub fn ack(&self, channel: &Channel, multiple: bool) -> Result<()> {
        channel.basic_ack(self.delivery_tag, multiple)
    }

    /// Negatively acknowledge this delivery.
    #[inline]
    pub fn nack(&self, channel: &Channel, multiple: bool, requeue: bool) -> Result<()> {
        channel.basic_nack(self.delivery_tag, multiple, requeue)
    }

    /// Reject this delivery.
    #[inline]
    pub fn reject(&self, channel: &Channel, requeue: bool) -> Result<()> {
        channel.basic_reject(self.delivery_tag, requeue)
    }
}
