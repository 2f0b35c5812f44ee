use crate::errors::UseDedicatedOperationSnafu;
use crate::io_loop::ChannelHandle;
use crate::{
    AmqpProperties, Confirm, Consumer, ConsumerMessage, ConsumerOptions, ConsumerSink, Error,
    Exchange, ExchangeDeclareOptions, ExchangeType, FieldTable, Get, Queue, QueueDeclareOptions,
    Result, Return, SinkMessage,
};
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::basic::{
    Ack, Cancel, CancelOk, Consume, Get as AmqpGet, Nack, Publish, Qos, QosOk, Recover, RecoverOk,
    Reject,
};
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::confirm::AMQPMethod as AmqpConfirm;
use amq_protocol::protocol::confirm::{Select, SelectOk};
use amq_protocol::protocol::exchange::AMQPMethod as AmqpExchange;
use amq_protocol::protocol::exchange::{
    Bind as ExchangeBind, BindOk as ExchangeBindOk, DeclareOk as ExchangeDeclareOk,
    Delete as ExchangeDelete, DeleteOk as ExchangeDeleteOk, Unbind as ExchangeUnbind,
    UnbindOk as ExchangeUnbindOk,
};
use amq_protocol::protocol::queue::AMQPMethod as AmqpQueue;
use amq_protocol::protocol::queue::{
    Bind as QueueBind, BindOk as QueueBindOk, DeclareOk as QueueDeclareOk,
    Delete as QueueDelete, DeleteOk as QueueDeleteOk, Purge as QueuePurge,
    PurgeOk as QueuePurgeOk, Unbind as QueueUnbind, UnbindOk as QueueUnbindOk,
};
use amq_protocol::protocol::tx::AMQPMethod as AmqpTx;
use amq_protocol::protocol::tx::{
    Commit, CommitOk, Rollback, RollbackOk, Select as TxSelect, SelectOk as TxSelectOk,
};
use amq_protocol::protocol::AMQPClass;
use crossbeam_channel::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Handle to an open AMQP channel.
///
/// All operations are issued through the connection's I/O thread; requests
/// from clones of a channel queue up there and are served strictly in order,
/// with at most one synchronous method outstanding at a time.
#[derive(Clone)]
pub struct Channel {
    channel_id: u16,
    inner: Arc<Mutex<Inner>>,
}

enum Inner {
    Open(ChannelHandle),
    Closed,
}

impl Drop for Channel {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            let _ = self.close_impl();
        }
    }
}

impl Channel {
    pub(crate) fn new(handle: ChannelHandle) -> Channel {
        let channel_id = handle.channel_id();
        Channel {
            channel_id,
            inner: Arc::new(Mutex::new(Inner::Open(handle))),
        }
    }

    /// The channel number assigned to this channel.
    #[inline]
    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    fn with_handle<T, F: FnOnce(&mut ChannelHandle) -> Result<T>>(&self, f: F) -> Result<T> {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Inner::Open(handle) => f(handle),
            Inner::Closed => Err(Error::ClientClosedChannel),
        }
    }

    /// Close this channel. The first close performs the close handshake with
    /// the server; any later close reports that the channel is already
    /// closed and is otherwise a no-op.
    pub fn close(&self) -> Result<()> {
        self.close_impl()
    }

    fn close_impl(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Inner::Open(handle) => {
                let result = handle.close();
                // Mark the channel as closed even if the handshake failed;
                // there is nothing useful a retry could do.
                *inner = Inner::Closed;
                result
            }
            Inner::Closed => Err(Error::ClientClosedChannel),
        }
    }

    /// Send an arbitrary AMQP method on this channel and wait for its reply.
    ///
    /// Returns the broker's reply for synchronous methods and `None` for
    /// asynchronous methods (the write has been issued in order). Methods
    /// with dedicated operations (`channel.open`, `channel.close`,
    /// `basic.consume`, `basic.get`) and connection-class methods are
    /// rejected.
    pub fn call(&self, method: AMQPClass) -> Result<Option<AMQPClass>> {
        check_generic_method(&method)?;
        let sync = method_expects_reply(&method);
        self.with_handle(|handle| handle.call_generic(method, sync))
    }

    /// Send an arbitrary AMQP method without waiting for anything. The write
    /// is ordered behind previously issued requests.
    pub fn cast(&self, method: AMQPClass) -> Result<()> {
        check_generic_method(&method)?;
        self.with_handle(|handle| handle.cast(method))
    }

    /// Like [`call`](#method.call) for content-bearing methods. The only
    /// content-bearing client method in AMQP 0-9-1 is `basic.publish`.
    pub fn call_with_content(
        &self,
        method: AMQPClass,
        properties: &AmqpProperties,
        content: &[u8],
    ) -> Result<()> {
        match method {
            AMQPClass::Basic(AmqpBasic::Publish(publish)) => {
                self.with_handle(|handle| handle.publish(publish, content, properties, true))
            }
            other => UseDedicatedOperationSnafu {
                method: method_name(&other),
            }
            .fail(),
        }
    }

    /// Like [`cast`](#method.cast) for content-bearing methods.
    pub fn cast_with_content(
        &self,
        method: AMQPClass,
        properties: &AmqpProperties,
        content: &[u8],
    ) -> Result<()> {
        match method {
            AMQPClass::Basic(AmqpBasic::Publish(publish)) => {
                self.with_handle(|handle| handle.publish(publish, content, properties, false))
            }
            other => UseDedicatedOperationSnafu {
                method: method_name(&other),
            }
            .fail(),
        }
    }

    /// Publish a message to `exchange` with the given routing key.
    pub fn basic_publish<T: AsRef<[u8]>, S0: Into<String>, S1: Into<String>>(
        &self,
        content: T,
        exchange: S0,
        routing_key: S1,
        mandatory: bool,
        immediate: bool,
        properties: &AmqpProperties,
    ) -> Result<()> {
        let publish = Publish {
            ticket: 0,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            mandatory,
            immediate,
        };
        self.with_handle(|handle| handle.publish(publish, content.as_ref(), properties, false))
    }

    /// Synchronously fetch a single message from `queue`; `None` if it is
    /// empty.
    pub fn basic_get<S: Into<String>>(&self, queue: S, no_ack: bool) -> Result<Option<Get>> {
        let get = AmqpGet {
            ticket: 0,
            queue: queue.into(),
            no_ack,
        };
        self.with_handle(|handle| handle.get(get))
    }

    /// Acknowledge a delivery (and, if `multiple`, everything before it).
    pub fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.with_handle(|handle| {
            handle.cast(AMQPClass::Basic(AmqpBasic::Ack(Ack {
                delivery_tag,
                multiple,
            })))
        })
    }

    /// Negatively acknowledge a delivery.
    pub fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.with_handle(|handle| {
            handle.cast(AMQPClass::Basic(AmqpBasic::Nack(Nack {
                delivery_tag,
                multiple,
                requeue,
            })))
        })
    }

    /// Reject a delivery.
    pub fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.with_handle(|handle| {
            handle.cast(AMQPClass::Basic(AmqpBasic::Reject(Reject {
                delivery_tag,
                requeue,
            })))
        })
    }

    /// Set the prefetch window for this channel (or, with `global`, the
    /// whole connection - note RabbitMQ does not implement `global`).
    pub fn basic_qos(&self, prefetch_size: u32, prefetch_count: u16, global: bool) -> Result<()> {
        self.with_handle(|handle| {
            handle
                .call::<_, QosOk>(AmqpBasic::Qos(Qos {
                    prefetch_size,
                    prefetch_count,
                    global,
                }))
                .map(|_| ())
        })
    }

    /// Ask the server to redeliver all unacknowledged messages on this
    /// channel.
    pub fn basic_recover(&self, requeue: bool) -> Result<()> {
        self.with_handle(|handle| {
            handle
                .call::<_, RecoverOk>(AmqpBasic::Recover(Recover { requeue }))
                .map(|_| ())
        })
    }

    /// Start a consumer on `queue`, dispatching its subscription events to
    /// `sink`. Returns the effective consumer tag.
    pub fn consume<S: Into<String>>(
        &self,
        queue: S,
        options: ConsumerOptions,
        sink: Box<dyn ConsumerSink>,
    ) -> Result<String> {
        let consume = Consume {
            ticket: 0,
            queue: queue.into(),
            consumer_tag: options.consumer_tag,
            no_local: options.no_local,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            nowait: false,
            arguments: options.arguments,
        };
        self.with_handle(|handle| handle.consume(consume, sink))
    }

    /// Start a forwarding consumer on `queue`; events arrive on the returned
    /// [`Consumer`](struct.Consumer.html)'s receiver.
    pub fn consumer<S: Into<String>>(
        &self,
        queue: S,
        options: ConsumerOptions,
    ) -> Result<Consumer> {
        let (tx, rx) = crossbeam_channel::unbounded::<ConsumerMessage>();
        let tag = self.consume(queue, options, Box::new(crate::ForwardingSink::new(tx)))?;
        Ok(Consumer::new(self, tag, rx))
    }

    /// Cancel a consumer by tag.
    pub fn basic_cancel<S: Into<String>>(&self, consumer_tag: S) -> Result<()> {
        self.with_handle(|handle| {
            handle
                .call::<_, CancelOk>(AmqpBasic::Cancel(Cancel {
                    consumer_tag: consumer_tag.into(),
                    nowait: false,
                }))
                .map(|_| ())
        })
    }

    /// Synchronously call into a consumer sink; see
    /// [`ConsumerSink::on_call`](trait.ConsumerSink.html#method.on_call).
    pub fn call_consumer<S: Into<String>>(
        &self,
        consumer_tag: S,
        message: SinkMessage,
    ) -> Result<SinkMessage> {
        self.with_handle(|handle| handle.call_consumer(consumer_tag.into(), message))
    }

    /// Send an out-of-band notification to a consumer sink; see
    /// [`ConsumerSink::on_info`](trait.ConsumerSink.html#method.on_info).
    pub fn notify_consumer<S: Into<String>>(
        &self,
        consumer_tag: S,
        message: SinkMessage,
    ) -> Result<()> {
        self.with_handle(|handle| handle.notify_consumer(consumer_tag.into(), message))
    }

    /// Put this channel into publisher-confirm mode.
    pub fn enable_publisher_confirms(&self) -> Result<()> {
        self.with_handle(|handle| {
            handle
                .call::<_, SelectOk>(AmqpConfirm::Select(Select { nowait: false }))
                .map(|_| ())
        })
    }

    /// The sequence number the next published message will carry once
    /// publisher confirms are enabled (0 beforehand).
    pub fn next_publish_seqno(&self) -> Result<u64> {
        self.with_handle(|handle| handle.next_publish_seqno())
    }

    /// Block until every message published so far has been confirmed.
    /// Returns true if all were acked, false if any was nacked; fails with
    /// [`NotInConfirmMode`](enum.Error.html#variant.NotInConfirmMode) if
    /// confirms were never enabled or
    /// [`ConfirmsTimedOut`](enum.Error.html#variant.ConfirmsTimedOut) if
    /// `timeout` elapses first.
    pub fn wait_for_confirms(&self, timeout: Option<Duration>) -> Result<bool> {
        self.with_handle(|handle| handle.wait_for_confirms(timeout))
    }

    /// Receive returned (unroutable mandatory) messages on this channel.
    pub fn register_return_handler(&self) -> Result<Receiver<Return>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.with_handle(|handle| handle.set_return_handler(Some(tx)))?;
        Ok(rx)
    }

    pub fn unregister_return_handler(&self) -> Result<()> {
        self.with_handle(|handle| handle.set_return_handler(None))
    }

    /// Receive publisher-confirm notifications (acks and nacks) on this
    /// channel.
    pub fn register_confirm_handler(&self) -> Result<Receiver<Confirm>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.with_handle(|handle| handle.set_confirm_handler(Some(tx)))?;
        Ok(rx)
    }

    pub fn unregister_confirm_handler(&self) -> Result<()> {
        self.with_handle(|handle| handle.set_confirm_handler(None))
    }

    /// Receive flow-control notifications (`true` = resume, `false` =
    /// pause) on this channel.
    pub fn register_flow_handler(&self) -> Result<Receiver<bool>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.with_handle(|handle| handle.set_flow_handler(Some(tx)))?;
        Ok(rx)
    }

    pub fn unregister_flow_handler(&self) -> Result<()> {
        self.with_handle(|handle| handle.set_flow_handler(None))
    }

    /// Block until all writes issued on this connection so far are on the
    /// wire.
    pub fn flush(&self) -> Result<()> {
        self.with_handle(|handle| handle.flush())
    }

    /// Declare an exchange of the given type.
    pub fn exchange_declare<S: Into<String>>(
        &self,
        type_: ExchangeType,
        name: S,
        options: ExchangeDeclareOptions,
    ) -> Result<Exchange> {
        let name = name.into();
        let declare = options.into_declare(type_, name.clone(), false, false);
        self.with_handle(|handle| {
            handle
                .call::<_, ExchangeDeclareOk>(AmqpExchange::Declare(declare))
                .map(|_| ())
        })?;
        Ok(Exchange::new(self, name))
    }

    /// Declare an exchange without waiting for the server's confirmation.
    pub fn exchange_declare_nowait<S: Into<String>>(
        &self,
        type_: ExchangeType,
        name: S,
        options: ExchangeDeclareOptions,
    ) -> Result<Exchange> {
        let name = name.into();
        let declare = options.into_declare(type_, name.clone(), false, true);
        self.with_handle(|handle| {
            handle
                .call_generic(AMQPClass::Exchange(AmqpExchange::Declare(declare)), false)
                .map(|_| ())
        })?;
        Ok(Exchange::new(self, name))
    }

    /// Verify an exchange exists without modifying it.
    pub fn exchange_declare_passive<S: Into<String>>(&self, name: S) -> Result<Exchange> {
        let name = name.into();
        let declare =
            ExchangeDeclareOptions::default().into_declare(ExchangeType::Direct, name.clone(), true, false);
        self.with_handle(|handle| {
            handle
                .call::<_, ExchangeDeclareOk>(AmqpExchange::Declare(declare))
                .map(|_| ())
        })?;
        Ok(Exchange::new(self, name))
    }

    /// Delete an exchange.
    pub fn exchange_delete<S: Into<String>>(&self, name: S, if_unused: bool) -> Result<()> {
        let delete = ExchangeDelete {
            ticket: 0,
            exchange: name.into(),
            if_unused,
            nowait: false,
        };
        self.with_handle(|handle| {
            handle
                .call::<_, ExchangeDeleteOk>(AmqpExchange::Delete(delete))
                .map(|_| ())
        })
    }

    /// Bind `destination` to `source` (exchange-to-exchange binding).
    pub fn exchange_bind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        destination: S0,
        source: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let bind = ExchangeBind {
            ticket: 0,
            destination: destination.into(),
            source: source.into(),
            routing_key: routing_key.into(),
            nowait: false,
            arguments,
        };
        self.with_handle(|handle| {
            handle
                .call::<_, ExchangeBindOk>(AmqpExchange::Bind(bind))
                .map(|_| ())
        })
    }

    /// Undo an exchange-to-exchange binding.
    pub fn exchange_unbind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        destination: S0,
        source: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let unbind = ExchangeUnbind {
            ticket: 0,
            destination: destination.into(),
            source: source.into(),
            routing_key: routing_key.into(),
            nowait: false,
            arguments,
        };
        self.with_handle(|handle| {
            handle
                .call::<_, ExchangeUnbindOk>(AmqpExchange::Unbind(unbind))
                .map(|_| ())
        })
    }

    /// Declare a queue; an empty name asks the server to generate one. The
    /// returned handle carries the effective name.
    pub fn queue_declare<S: Into<String>>(
        &self,
        name: S,
        options: QueueDeclareOptions,
    ) -> Result<Queue> {
        let declare = options.into_declare(name.into(), false, false);
        let declare_ok = self.with_handle(|handle| {
            handle.call::<_, QueueDeclareOk>(AmqpQueue::Declare(declare))
        })?;
        Ok(Queue::new(self, declare_ok.queue))
    }

    /// Declare a queue without waiting for the server's confirmation. The
    /// name must not be empty (there is no declare-ok to carry a generated
    /// name back).
    pub fn queue_declare_nowait<S: Into<String>>(
        &self,
        name: S,
        options: QueueDeclareOptions,
    ) -> Result<Queue> {
        let name = name.into();
        let declare = options.into_declare(name.clone(), false, true);
        self.with_handle(|handle| {
            handle
                .call_generic(AMQPClass::Queue(AmqpQueue::Declare(declare)), false)
                .map(|_| ())
        })?;
        Ok(Queue::new(self, name))
    }

    /// Verify a queue exists without modifying it.
    pub fn queue_declare_passive<S: Into<String>>(&self, name: S) -> Result<Queue> {
        let declare = QueueDeclareOptions::default().into_declare(name.into(), true, false);
        let declare_ok = self.with_handle(|handle| {
            handle.call::<_, QueueDeclareOk>(AmqpQueue::Declare(declare))
        })?;
        Ok(Queue::new(self, declare_ok.queue))
    }

    /// Bind a queue to an exchange.
    pub fn queue_bind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        queue: S0,
        exchange: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let bind = QueueBind {
            ticket: 0,
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            nowait: false,
            arguments,
        };
        self.with_handle(|handle| {
            handle
                .call::<_, QueueBindOk>(AmqpQueue::Bind(bind))
                .map(|_| ())
        })
    }

    /// Unbind a queue from an exchange.
    pub fn queue_unbind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        queue: S0,
        exchange: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let unbind = QueueUnbind {
            ticket: 0,
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            arguments,
        };
        self.with_handle(|handle| {
            handle
                .call::<_, QueueUnbindOk>(AmqpQueue::Unbind(unbind))
                .map(|_| ())
        })
    }

    /// Purge all messages from a queue; returns the purged message count.
    pub fn queue_purge<S: Into<String>>(&self, queue: S) -> Result<u32> {
        let purge = QueuePurge {
            ticket: 0,
            queue: queue.into(),
            nowait: false,
        };
        self.with_handle(|handle| {
            handle
                .call::<_, QueuePurgeOk>(AmqpQueue::Purge(purge))
                .map(|purge_ok| purge_ok.message_count)
        })
    }

    /// Delete a queue; returns the count of messages deleted with it.
    pub fn queue_delete<S: Into<String>>(
        &self,
        queue: S,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32> {
        let delete = QueueDelete {
            ticket: 0,
            queue: queue.into(),
            if_unused,
            if_empty,
            nowait: false,
        };
        self.with_handle(|handle| {
            handle
                .call::<_, QueueDeleteOk>(AmqpQueue::Delete(delete))
                .map(|delete_ok| delete_ok.message_count)
        })
    }

    /// Put this channel into transaction mode.
    pub fn tx_select(&self) -> Result<()> {
        self.with_handle(|handle| {
            handle
                .call::<_, TxSelectOk>(AmqpTx::Select(TxSelect {}))
                .map(|_| ())
        })
    }

    /// Commit the current transaction.
    pub fn tx_commit(&self) -> Result<()> {
        self.with_handle(|handle| {
            handle
                .call::<_, CommitOk>(AmqpTx::Commit(Commit {}))
                .map(|_| ())
        })
    }

    /// Roll back the current transaction.
    pub fn tx_rollback(&self) -> Result<()> {
        self.with_handle(|handle| {
            handle
                .call::<_, RollbackOk>(AmqpTx::Rollback(Rollback {}))
                .map(|_| ())
        })
    }
}

/// Methods that must go through a dedicated `Channel` operation or are not
/// valid on a channel at all.
fn check_generic_method(method: &AMQPClass) -> Result<()> {
    let dedicated = match method {
        AMQPClass::Connection(_) => return Err(Error::ConnectionMethodNotAllowed),
        AMQPClass::Channel(AmqpChannel::Open(_)) => "channel.open",
        AMQPClass::Channel(AmqpChannel::Close(_)) => "channel.close",
        AMQPClass::Basic(AmqpBasic::Consume(_)) => "basic.consume",
        AMQPClass::Basic(AmqpBasic::Get(_)) => "basic.get",
        _ => return Ok(()),
    };
    UseDedicatedOperationSnafu { method: dedicated }.fail()
}

/// Whether the broker answers this method with a reply of its own (taking a
/// set `nowait` flag into account).
fn method_expects_reply(method: &AMQPClass) -> bool {
    match method {
        AMQPClass::Channel(AmqpChannel::Flow(_)) => true,
        AMQPClass::Exchange(AmqpExchange::Declare(m)) => !m.nowait,
        AMQPClass::Exchange(AmqpExchange::Delete(m)) => !m.nowait,
        AMQPClass::Exchange(AmqpExchange::Bind(m)) => !m.nowait,
        AMQPClass::Exchange(AmqpExchange::Unbind(m)) => !m.nowait,
        AMQPClass::Queue(AmqpQueue::Declare(m)) => !m.nowait,
        AMQPClass::Queue(AmqpQueue::Bind(m)) => !m.nowait,
        AMQPClass::Queue(AmqpQueue::Purge(m)) => !m.nowait,
        AMQPClass::Queue(AmqpQueue::Delete(m)) => !m.nowait,
        AMQPClass::Queue(AmqpQueue::Unbind(_)) => true,
        AMQPClass::Basic(AmqpBasic::Qos(_)) => true,
        AMQPClass::Basic(AmqpBasic::Cancel(m)) => !m.nowait,
        AMQPClass::Basic(AmqpBasic::Recover(_)) => true,
        AMQPClass::Confirm(AmqpConfirm::Select(m)) => !m.nowait,
        AMQPClass::Tx(_) => true,
        _ => false,
    }
}

fn method_name(method: &AMQPClass) -> String {
    format!("{:?}", method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use amq_protocol::protocol::channel::{Close, Flow, Open};
    use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
    use amq_protocol::protocol::connection::Close as ConnectionClose;

    #[test]
    fn connection_methods_are_rejected() {
        let method = AMQPClass::Connection(AmqpConnection::Close(ConnectionClose {
            reply_code: 200,
            reply_text: String::new(),
            class_id: 0,
            method_id: 0,
        }));
        assert!(matches!(
            check_generic_method(&method),
            Err(Error::ConnectionMethodNotAllowed)
        ));
    }

    #[test]
    fn lifecycle_methods_require_dedicated_operations() {
        let open = AMQPClass::Channel(AmqpChannel::Open(Open {
            out_of_band: String::new(),
        }));
        let close = AMQPClass::Channel(AmqpChannel::Close(Close {
            reply_code: 200,
            reply_text: String::new(),
            class_id: 0,
            method_id: 0,
        }));
        let consume = AMQPClass::Basic(AmqpBasic::Consume(Consume {
            ticket: 0,
            queue: String::new(),
            consumer_tag: String::new(),
            no_local: false,
            no_ack: false,
            exclusive: false,
            nowait: false,
            arguments: FieldTable::new(),
        }));
        for method in [open, close, consume].iter() {
            assert!(matches!(
                check_generic_method(method),
                Err(Error::UseDedicatedOperation { .. })
            ));
        }
    }

    #[test]
    fn flow_control_methods_pass_generic_checks() {
        let flow = AMQPClass::Channel(AmqpChannel::Flow(Flow { active: false }));
        assert!(check_generic_method(&flow).is_ok());
        assert!(method_expects_reply(&flow));
    }

    #[test]
    fn nowait_turns_sync_methods_async() {
        let declare = |nowait| {
            AMQPClass::Queue(AmqpQueue::Declare(
                QueueDeclareOptions::default().into_declare("q".to_string(), false, nowait),
            ))
        };
        assert!(method_expects_reply(&declare(false)));
        assert!(!method_expects_reply(&declare(true)));
    }

    #[test]
    fn publish_and_acks_are_async() {
        let publish = AMQPClass::Basic(AmqpBasic::Publish(Publish {
            ticket: 0,
            exchange: String::new(),
            routing_key: String::new(),
            mandatory: false,
            immediate: false,
        }));
        let ack = AMQPClass::Basic(AmqpBasic::Ack(Ack {
            delivery_tag: 1,
            multiple: false,
        }));
        assert!(!method_expects_reply(&publish));
        assert!(!method_expects_reply(&ack));
    }
}
