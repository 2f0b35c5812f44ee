use super::{Channel0Slot, Inner};
use crate::{Error, Result};
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::Close as ConnectionClose;
use amq_protocol::protocol::connection::CloseOk as ConnectionCloseOk;
use amq_protocol::protocol::{AMQPClass, AMQPHardError};
use crate::ConnectionBlockedNotification;
use log::{error, trace, warn};

/// Connection-level state after the handshake. Channel 0 traffic is policed
/// here; all other channels route through their slots' state machines.
pub(super) enum ConnectionState {
    Steady(Channel0Slot),
    ServerClosing(ConnectionClose),
    ClientClosed,
    ClientException,
}

impl ConnectionState {
    pub(super) fn process(&mut self, inner: &mut Inner, frame: AMQPFrame) -> Result<()> {
        let ch0_slot = match self {
            ConnectionState::Steady(ch0_slot) => ch0_slot,
            ConnectionState::ServerClosing(_)
            | ConnectionState::ClientClosed
            | ConnectionState::ClientException => {
                // Mid-teardown; the server may still have frames in flight.
                trace!("discarding frame received while closing: {:?}", frame);
                return Ok(());
            }
        };

        match frame {
            AMQPFrame::Heartbeat(0) => {
                trace!("received heartbeat");
                Ok(())
            }
            AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::Close(close))) => {
                warn!(
                    "server closing connection (code={} message={})",
                    close.reply_code, close.reply_text
                );
                inner.push_method(0, AmqpConnection::CloseOk(ConnectionCloseOk {}))?;
                inner.seal_writes();
                *self = ConnectionState::ServerClosing(close);
                Ok(())
            }
            AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::CloseOk(_))) => {
                inner.connection_close_ok();
                *self = ConnectionState::ClientClosed;
                Ok(())
            }
            AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::Blocked(blocked))) => {
                ch0_slot.notify_blocked(ConnectionBlockedNotification::Blocked {
                    reason: blocked.reason,
                });
                Ok(())
            }
            AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::Unblocked(_))) => {
                ch0_slot.notify_blocked(ConnectionBlockedNotification::Unblocked);
                Ok(())
            }
            AMQPFrame::Method(0, other) => {
                let text = format!("do not know how to handle channel 0 method {:?}", other);
                error!("{} - closing connection", text);
                let close = ConnectionClose {
                    reply_code: AMQPHardError::NOTIMPLEMENTED.get_id(),
                    reply_text: text,
                    class_id: 0,
                    method_id: 0,
                };
                inner.push_method(0, AmqpConnection::Close(close))?;
                inner.seal_writes();
                *self = ConnectionState::ClientException;
                Ok(())
            }
            AMQPFrame::Header(0, _, _) | AMQPFrame::Body(0, _) => {
                let text = format!("received illegal channel 0 frame {:?}", frame);
                error!("{} - closing connection", text);
                let close = ConnectionClose {
                    reply_code: AMQPHardError::NOTALLOWED.get_id(),
                    reply_text: text,
                    class_id: 0,
                    method_id: 0,
                };
                inner.push_method(0, AmqpConnection::Close(close))?;
                inner.seal_writes();
                *self = ConnectionState::ClientException;
                Ok(())
            }
            AMQPFrame::Method(n, AMQPClass::Connection(_)) => {
                error!("received connection method on channel {}", n);
                Err(Error::FrameUnexpected)
            }
            AMQPFrame::Method(n, method) => inner.handle_channel_method(n, method),
            AMQPFrame::Header(n, _, header) => inner.handle_channel_header(n, *header),
            AMQPFrame::Body(n, body) => inner.handle_channel_body(n, body),
            AMQPFrame::Heartbeat(n) => {
                trace!("discarding heartbeat frame on channel {}", n);
                Ok(())
            }
            other => {
                error!("received unexpected frame {:?}", other);
                Err(Error::FrameUnexpected)
            }
        }
    }
}
