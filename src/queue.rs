use crate::{Channel, Consumer, ConsumerOptions, FieldTable, Get, Result};
use amq_protocol::protocol::queue::Declare;

/// Options passed to the server when declaring a queue.
///
/// The [`default`](#impl-Default) implementation sets all boolean fields to false and has an empty
/// set of arguments.
#[derive(Clone, Debug, Default)]
pub struct QueueDeclareOptions {
    /// If true, declares queue as durable (survives server restarts).
    pub durable: bool,

    /// If true, declares queue as exclusive: the queue may only be accessed by the current
    /// connection, and it will be deleted when the connection closes.
    pub exclusive: bool,

    /// If true, declares queue as auto-delete: the server will delete it once its last consumer
    /// is cancelled or disconnects.
    pub auto_delete: bool,

    /// Extra arguments; these are optional in general, but may be needed for some plugins or
    /// server-specific features.
    pub arguments: FieldTable,
}

impl QueueDeclareOptions {
    pub(crate) fn into_declare(self, name: String, passive: bool, nowait: bool) -> Declare {
        Declare {
            ticket: 0,
            queue: name,
            passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait,
            arguments: self.arguments,
        }
    }
}

/// Handle for a declared queue.
pub struct Queue<'a> {
    channel: &'a Channel,
    name: String,
}

impl Queue<'_> {
    pub(crate) fn new(channel: &Channel, name: String) -> Queue {
        Queue { channel, name }
    }

    /// The queue name; for server-named queues, this is the name from the
    /// server's `declare-ok`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Synchronously fetch a single message from this queue; `None` if the
    /// queue is empty.
    pub fn get(&self, no_ack: bool) -> Result<Option<Get>> {
        self.channel.basic_get(self.name(), no_ack)
    }

    /// Start a forwarding consumer on this queue.
    pub fn consume(&self, options: ConsumerOptions) -> Result<Consumer> {
        self.channel.consumer(self.name(), options)
    }

    /// Bind this queue to an exchange with the given routing key.
    pub fn bind<S0: Into<String>, S1: Into<String>>(
        &self,
        exchange: S0,
        routing_key: S1,
        arguments: FieldTable,
    ) -> Result<()> {
        self.channel
            .queue_bind(self.name(), exchange, routing_key, arguments)
    }

    /// Purge all messages from this queue; returns the number of purged
    /// messages.
    pub fn purge(&self) -> Result<u32> {
        self.channel.queue_purge(self.name())
    }

    /// Delete this queue; returns the number of messages deleted with it.
    pub fn delete(self, if_unused: bool, if_empty: bool) -> Result<u32> {
        self.channel.queue_delete(self.name(), if_unused, if_empty)
    }
}
