use crate::connection_options::ConnectionOptions;
use crate::errors::*;
use crate::frame_buffer::FrameBuffer;
use crate::heartbeats::{HeartbeatKind, HeartbeatState, HeartbeatTimers};
use crate::serialize::{IntoAmqpClass, OutputBuffer, SealableOutputBuffer};
use crate::{
    Confirm, ConnectionBlockedNotification, ConnectionTuning, ConsumerSink, FieldTable, Get,
    IoStream, Return, Sasl, SinkMessage,
};
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::CloseOk as ConnectionCloseOk;
use amq_protocol::protocol::connection::TuneOk;
use amq_protocol::protocol::AMQPClass;
use crossbeam_channel::Receiver as CrossbeamReceiver;
use crossbeam_channel::SendError;
use crossbeam_channel::Sender as CrossbeamSender;
use log::{debug, error, trace, warn};
use mio::{Event, Evented, Events, Poll, PollOpt, Ready, Token};
use mio_extras::channel::sync_channel as mio_sync_channel;
use mio_extras::channel::Receiver as MioReceiver;
use mio_extras::timer::Timer;
use snafu::ResultExt;
use std::io;
use std::sync::mpsc::TryRecvError;
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

#[cfg(feature = "native-tls")]
use crate::stream::HandshakeStream;

mod channel_handle;
mod channel_slots;
mod channel_state;
mod connection_state;
mod content_collector;
mod handshake_state;
mod io_loop_handle;

pub(crate) use channel_handle::{Channel0Handle, ChannelHandle};
use channel_slots::ChannelSlots;
use channel_state::ChannelState;
use connection_state::ConnectionState;
use handshake_state::HandshakeState;
use io_loop_handle::{IoLoopHandle, IoLoopHandle0};

const STREAM: Token = Token(u16::max_value() as usize + 1);
const HEARTBEAT: Token = Token(u16::max_value() as usize + 2);
const ALLOC_CHANNEL: Token = Token(u16::max_value() as usize + 3);
const SET_BLOCKED_TX: Token = Token(u16::max_value() as usize + 4);
const CONFIRM_TIMER: Token = Token(u16::max_value() as usize + 5);

// How long a connection close may spend flushing channels and waiting for
// the server's close-ok, and how long we linger afterwards waiting for the
// server to drop the socket.
const CLOSE_FLUSH_WAIT: Duration = Duration::from_secs(60);
const SOCKET_CLOSE_GRACE: Duration = Duration::from_secs(1);

pub(crate) type ReplyTx = CrossbeamSender<Result<ChannelMessage>>;

/// Key for pending wait-for-confirms timeouts: (channel number, waiter id).
pub(crate) type ConfirmTimerKey = (u16, u64);

/// Requests sent from application handles into the I/O thread; one pollable
/// pipe per channel.
pub(crate) enum ChannelRequest {
    Rpc {
        buf: OutputBuffer,
        sync: bool,
        has_content: bool,
        is_publish: bool,
        reply_tx: Option<ReplyTx>,
    },
    Get {
        buf: OutputBuffer,
        reply_tx: ReplyTx,
    },
    Consume {
        buf: OutputBuffer,
        consumer_tag: Option<String>,
        sink: Box<dyn ConsumerSink>,
        reply_tx: ReplyTx,
    },
    CloseChannel {
        buf: OutputBuffer,
        reply_tx: ReplyTx,
    },
    CloseConnection {
        buf: OutputBuffer,
        reply_tx: ReplyTx,
    },
    NextPublishSeqno {
        reply_tx: CrossbeamSender<u64>,
    },
    WaitForConfirms {
        timeout: Option<Duration>,
        reply_tx: CrossbeamSender<Result<bool>>,
    },
    SetReturnHandler(Option<CrossbeamSender<Return>>),
    SetConfirmHandler(Option<CrossbeamSender<Confirm>>),
    SetFlowHandler(Option<CrossbeamSender<bool>>),
    CallConsumer {
        consumer_tag: String,
        message: SinkMessage,
        reply_tx: CrossbeamSender<SinkMessage>,
    },
    NotifyConsumer {
        consumer_tag: String,
        message: SinkMessage,
    },
    Flush {
        reply_tx: CrossbeamSender<()>,
    },
}

/// Replies from the I/O thread back to a blocked application handle.
pub(crate) enum ChannelMessage {
    /// The broker's reply to a synchronous method.
    Method(AMQPClass),

    /// An asynchronous request was accepted for ordered write.
    Accepted,

    /// `basic.consume-ok` carrying the effective consumer tag.
    ConsumeOk(String),

    /// A `basic.get` result; `None` if the queue was empty.
    GetOk(Box<Option<Get>>),
}

struct ChannelSlot {
    rx: MioReceiver<ChannelRequest>,
    state: ChannelState,
}

impl ChannelSlot {
    fn new(mio_channel_bound: usize, channel_id: u16) -> (ChannelSlot, IoLoopHandle) {
        let (mio_tx, mio_rx) = mio_sync_channel(mio_channel_bound);
        let slot = ChannelSlot {
            rx: mio_rx,
            state: ChannelState::new(channel_id),
        };
        (slot, IoLoopHandle::new(channel_id, mio_tx))
    }
}

pub(super) struct Channel0Slot {
    common: ChannelSlot,
    set_blocked_rx: MioReceiver<CrossbeamSender<ConnectionBlockedNotification>>,
    blocked_txs: Vec<CrossbeamSender<ConnectionBlockedNotification>>,
    alloc_chan_req_rx: MioReceiver<Option<u16>>,
    alloc_chan_rep_tx: CrossbeamSender<Result<IoLoopHandle>>,
}

impl Channel0Slot {
    fn new(mio_channel_bound: usize) -> (Channel0Slot, IoLoopHandle0) {
        let (common_slot, common_handle) = ChannelSlot::new(mio_channel_bound, 0);
        let (alloc_chan_req_tx, alloc_chan_req_rx) = mio_sync_channel(1);
        let (set_blocked_tx, set_blocked_rx) = mio_sync_channel(1);
        let (alloc_chan_rep_tx, alloc_chan_rep_rx) = crossbeam_channel::bounded(1);

        let slot = Channel0Slot {
            common: common_slot,
            set_blocked_rx,
            blocked_txs: Vec::new(),
            alloc_chan_req_rx,
            alloc_chan_rep_tx,
        };
        let handle = IoLoopHandle0::new(
            common_handle,
            set_blocked_tx,
            alloc_chan_req_tx,
            alloc_chan_rep_rx,
        );

        (slot, handle)
    }

    pub(super) fn notify_blocked(&mut self, note: ConnectionBlockedNotification) {
        let before = self.blocked_txs.len();
        self.blocked_txs.retain(|tx| tx.send(note.clone()).is_ok());
        if self.blocked_txs.len() != before {
            warn!("blocked-notification listener is gone; unregistering");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DeadlineKind {
    Handshake,
    CloseFlush,
    SocketGrace,
}

pub(crate) struct IoLoop {
    poll: Poll,
    frame_buffer: FrameBuffer,
    inner: Inner,

    // Bound for buffered outgoing writes. If we have more than this much data enqueued,
    // we will stop polling non-0 channels' requests for us to send more data.
    buffered_writes_high_water: usize,
    buffered_writes_low_water: usize,
}

impl IoLoop {
    pub(crate) fn new(tuning: ConnectionTuning) -> Result<Self> {
        let heartbeats = HeartbeatTimers::default();
        let confirm_timer = Timer::default();

        let poll = Poll::new().context(CreatePollHandleSnafu)?;
        poll.register(
            &heartbeats.timer,
            HEARTBEAT,
            Ready::readable(),
            PollOpt::edge(),
        )
        .context(RegisterWithPollHandleSnafu)?;
        poll.register(
            &confirm_timer,
            CONFIRM_TIMER,
            Ready::readable(),
            PollOpt::edge(),
        )
        .context(RegisterWithPollHandleSnafu)?;

        Ok(IoLoop {
            poll,
            frame_buffer: FrameBuffer::new(),
            inner: Inner::new(heartbeats, confirm_timer, tuning.mem_channel_bound),
            buffered_writes_high_water: tuning.buffered_writes_high_water,
            buffered_writes_low_water: tuning.buffered_writes_low_water,
        })
    }

    pub(crate) fn start<Auth: Sasl, S: IoStream>(
        mut self,
        stream: S,
        options: ConnectionOptions<Auth>,
    ) -> Result<(JoinHandle<Result<()>>, FieldTable, Channel0Handle)> {
        self.poll
            .register(&stream, STREAM, Ready::writable(), PollOpt::edge())
            .context(RegisterWithPollHandleSnafu)?;

        let (handshake_done_tx, handshake_done_rx) = crossbeam_channel::bounded(1);
        let (ch0_slot, ch0_handle) = Channel0Slot::new(self.inner.mio_channel_bound);

        let join_handle = Builder::new()
            .name("coney-io".to_string())
            .spawn(move || self.thread_main(stream, options, handshake_done_tx, ch0_slot, false))
            .context(ForkFailedSnafu)?;

        IoLoop::wait_for_amqp_handshake(ch0_handle, join_handle, handshake_done_rx)
    }

    #[cfg(feature = "native-tls")]
    pub(crate) fn start_tls<Auth: Sasl, S: HandshakeStream>(
        mut self,
        stream: S,
        options: ConnectionOptions<Auth>,
    ) -> Result<(JoinHandle<Result<()>>, FieldTable, Channel0Handle)> {
        self.poll
            .register(
                &stream,
                STREAM,
                Ready::readable() | Ready::writable(),
                PollOpt::edge(),
            )
            .context(RegisterWithPollHandleSnafu)?;

        let (handshake_done_tx, handshake_done_rx) = crossbeam_channel::bounded(1);
        let (ch0_slot, ch0_handle) = Channel0Slot::new(self.inner.mio_channel_bound);

        let join_handle = Builder::new()
            .name("coney-io".to_string())
            .spawn(move || self.thread_main_tls(stream, options, handshake_done_tx, ch0_slot))
            .context(ForkFailedSnafu)?;

        IoLoop::wait_for_amqp_handshake(ch0_handle, join_handle, handshake_done_rx)
    }

    fn wait_for_amqp_handshake(
        ch0_handle: IoLoopHandle0,
        join_handle: JoinHandle<Result<()>>,
        handshake_done_rx: CrossbeamReceiver<(usize, FieldTable)>,
    ) -> Result<(JoinHandle<Result<()>>, FieldTable, Channel0Handle)> {
        match handshake_done_rx.recv() {
            Ok((frame_max, server_properties)) => Ok((
                join_handle,
                server_properties,
                Channel0Handle::new(ch0_handle, frame_max),
            )),

            // If sender was dropped without sending, the I/O thread has failed; peel out
            // its final error.
            Err(_) => match join_handle.join() {
                Ok(Ok(())) => {
                    unreachable!("I/O thread ended successfully without completing handshake")
                }
                Ok(Err(err)) => Err(err),
                Err(panic) => IoThreadPanicSnafu {
                    message: format!("{:?}", panic),
                }
                .fail(),
            },
        }
    }

    #[cfg(feature = "native-tls")]
    fn thread_main_tls<Auth: Sasl, S: HandshakeStream>(
        mut self,
        stream: S,
        options: ConnectionOptions<Auth>,
        handshake_done_tx: CrossbeamSender<(usize, FieldTable)>,
        ch0_slot: Channel0Slot,
    ) -> Result<()> {
        trace!("starting TLS handshake");
        let stream = self.run_tls_handshake(stream, &options)?;
        trace!("finished TLS handshake");
        self.thread_main(stream, options, handshake_done_tx, ch0_slot, true)
    }

    #[cfg(feature = "native-tls")]
    fn run_tls_handshake<Auth: Sasl, S: HandshakeStream>(
        &mut self,
        mut stream: S,
        options: &ConnectionOptions<Auth>,
    ) -> Result<S::Stream> {
        self.inner.deadline = options
            .handshake_timeout
            .map(|timeout| (Instant::now() + timeout, DeadlineKind::Handshake));
        let mut state = None;
        self.run_io_loop(
            &mut stream,
            &mut state,
            |_, stream, state, _| {
                if state.is_none() {
                    *state = stream.progress_handshake()?;
                }
                Ok(())
            },
            false,
            |_, state| state.is_some(),
        )?;
        Ok(state.unwrap())
    }

    fn thread_main<Auth: Sasl, S: IoStream>(
        mut self,
        mut stream: S,
        options: ConnectionOptions<Auth>,
        handshake_done_tx: CrossbeamSender<(usize, FieldTable)>,
        ch0_slot: Channel0Slot,
        have_written_to_socket: bool,
    ) -> Result<()> {
        self.poll
            .register(
                &ch0_slot.common.rx,
                Token(0),
                Ready::readable(),
                PollOpt::edge(),
            )
            .context(RegisterWithPollHandleSnafu)?;
        self.poll
            .register(
                &ch0_slot.set_blocked_rx,
                SET_BLOCKED_TX,
                Ready::readable(),
                PollOpt::edge(),
            )
            .context(RegisterWithPollHandleSnafu)?;
        self.poll
            .register(
                &ch0_slot.alloc_chan_req_rx,
                ALLOC_CHANNEL,
                Ready::readable(),
                PollOpt::edge(),
            )
            .context(RegisterWithPollHandleSnafu)?;

        let (tune_ok, server_properties) =
            self.run_amqp_handshake(&mut stream, options, have_written_to_socket)?;
        self.inner.chan_slots.set_channel_max(tune_ok.channel_max);
        match handshake_done_tx.send((tune_ok.frame_max as usize, server_properties)) {
            Ok(_) => (),
            Err(_) => return Ok(()),
        }
        self.run_connection(&mut stream, ch0_slot)
    }

    fn run_amqp_handshake<Auth: Sasl, S: IoStream>(
        &mut self,
        stream: &mut S,
        options: ConnectionOptions<Auth>,
        have_written_to_socket: bool,
    ) -> Result<(TuneOk, FieldTable)> {
        self.inner.deadline = options
            .handshake_timeout
            .map(|timeout| (Instant::now() + timeout, DeadlineKind::Handshake));

        let mut state = HandshakeState::Start(options);
        let result = self.run_io_loop(
            stream,
            &mut state,
            Self::handle_handshake_event,
            have_written_to_socket,
            Self::is_handshake_done,
        );
        match result {
            Ok(()) => (),
            // The server drops the socket without a word when it rejects our
            // credentials (observable if we got past start-ok), and some
            // servers do the same instead of refusing the vhost politely.
            Err(Error::UnexpectedSocketClose) => {
                return match state {
                    HandshakeState::Secure(_, _) | HandshakeState::Tune(_, _) => {
                        Err(Error::InvalidCredentials)
                    }
                    HandshakeState::Open(_, _) => Err(Error::AccessRefused),
                    _ => Err(Error::UnexpectedSocketClose),
                };
            }
            Err(err) => return Err(err),
        }
        self.inner.deadline = None;
        match state {
            HandshakeState::Start(_)
            | HandshakeState::Secure(_, _)
            | HandshakeState::Tune(_, _)
            | HandshakeState::Open(_, _) => unreachable!(),
            HandshakeState::Done(tune_ok, server_properties) => Ok((tune_ok, server_properties)),
            HandshakeState::ServerClosing(close) => ServerClosedConnectionSnafu {
                code: close.reply_code,
                message: close.reply_text,
            }
            .fail(),
        }
    }

    fn handle_handshake_event<Auth: Sasl, S: IoStream>(
        &mut self,
        stream: &mut S,
        state: &mut HandshakeState<Auth>,
        event: Event,
    ) -> Result<()> {
        match event.token() {
            STREAM => {
                if event.readiness().is_writable() {
                    self.inner.write_to_stream(stream)?;
                }
                if event.readiness().is_readable() {
                    self.inner.read_from_stream(
                        stream,
                        &mut self.frame_buffer,
                        |inner, frame| state.process(inner, frame),
                    )?;
                }
            }
            HEARTBEAT => self.inner.process_heartbeat_timers()?,
            CONFIRM_TIMER => self.inner.process_confirm_timers(),
            _ => unreachable!("no channels exist during the handshake"),
        }
        Ok(())
    }

    fn is_handshake_done<Auth: Sasl>(&self, state: &HandshakeState<Auth>) -> bool {
        match state {
            HandshakeState::Start(_)
            | HandshakeState::Secure(_, _)
            | HandshakeState::Tune(_, _)
            | HandshakeState::Open(_, _) => false,
            HandshakeState::Done(_, _) => true,
            HandshakeState::ServerClosing(_) => {
                // server initiated a close (e.g., bad vhost). don't report that we're
                // done until all our writes have gone out
                assert!(
                    self.inner.are_writes_sealed(),
                    "writes should be sealed after getting a server close request"
                );
                !self.inner.has_data_to_write()
            }
        }
    }

    fn run_connection<S: IoStream>(
        &mut self,
        stream: &mut S,
        ch0_slot: Channel0Slot,
    ) -> Result<()> {
        let mut state = ConnectionState::Steady(ch0_slot);
        let result = self.run_io_loop(
            stream,
            &mut state,
            Self::handle_steady_event,
            true,
            Self::is_connection_done,
        );

        let finish = |state: &ConnectionState| -> (Result<()>, Error) {
            match state {
                ConnectionState::ClientClosed => (Ok(()), Error::ClientClosedConnection),
                ConnectionState::ServerClosing(close) => {
                    let reason = Error::ServerClosedConnection {
                        code: close.reply_code,
                        message: close.reply_text.clone(),
                    };
                    if close.reply_code == 200 {
                        (Ok(()), reason)
                    } else {
                        (Err(reason.clone()), reason)
                    }
                }
                ConnectionState::ClientException => {
                    (Err(Error::ClientException), Error::ClientException)
                }
                ConnectionState::Steady(_) => {
                    unreachable!("connection loop cannot end in the steady state")
                }
            }
        };

        let (ret, reason) = match result {
            Ok(()) => finish(&state),
            // Once closure is in motion, the server dropping the socket is
            // the expected end of the conversation, not a failure.
            Err(Error::UnexpectedSocketClose)
                if !matches!(state, ConnectionState::Steady(_)) =>
            {
                finish(&state)
            }
            Err(err) => (Err(err.clone()), err),
        };

        // Every channel observes the connection-wide closure before the I/O
        // thread (and therefore the connection handle) reports termination.
        self.inner.teardown(reason);
        ret
    }

    fn handle_steady_event<S: IoStream>(
        &mut self,
        stream: &mut S,
        state: &mut ConnectionState,
        event: Event,
    ) -> Result<()> {
        match event.token() {
            STREAM => {
                if event.readiness().is_writable() {
                    self.inner.write_to_stream(stream)?;
                }
                if event.readiness().is_readable() {
                    self.inner.read_from_stream(
                        stream,
                        &mut self.frame_buffer,
                        |inner, frame| state.process(inner, frame),
                    )?;
                }
            }
            HEARTBEAT => self.inner.process_heartbeat_timers()?,
            CONFIRM_TIMER => self.inner.process_confirm_timers(),
            SET_BLOCKED_TX => match state {
                ConnectionState::Steady(ch0_slot) => self.handle_set_blocked_tx(ch0_slot)?,
                _ => unreachable!("ch0 slot cannot be readable after it is dropped"),
            },
            ALLOC_CHANNEL => match state {
                ConnectionState::Steady(ch0_slot) => {
                    self.inner.allocate_channel(ch0_slot, &self.poll)?
                }
                _ => unreachable!("ch0 slot cannot be readable after it is dropped"),
            },
            Token(0) => match state {
                ConnectionState::Steady(ch0_slot) => {
                    self.inner.handle_channel0_readable(ch0_slot)?
                }
                _ => unreachable!("ch0 slot cannot be readable after it is dropped"),
            },
            Token(n) if n <= u16::max_value() as usize => {
                self.inner.handle_channel_readable(n as u16)?
            }
            _ => unreachable!(),
        }
        // RPC queues may just have drained; a pending connection close can
        // now go out.
        self.inner.maybe_finish_flush();
        Ok(())
    }

    fn handle_set_blocked_tx(&self, ch0_slot: &mut Channel0Slot) -> Result<()> {
        loop {
            let tx = match ch0_slot.set_blocked_rx.try_recv() {
                Ok(tx) => tx,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(Error::EventLoopClientDropped),
            };
            ch0_slot.blocked_txs.push(tx);
        }
    }

    fn is_connection_done(&self, state: &ConnectionState) -> bool {
        match state {
            ConnectionState::Steady(_) => false,
            // Wait out the socket-close grace period; EOF or the deadline
            // ends the loop.
            ConnectionState::ClientClosed => false,
            ConnectionState::ServerClosing(_) | ConnectionState::ClientException => {
                // we're mid-close, but not actually done until all our writes have gone out
                assert!(
                    self.inner.are_writes_sealed(),
                    "writes should be sealed after getting a server close request"
                );
                !self.inner.has_data_to_write()
            }
        }
    }

    fn check_deadline(&mut self) -> Result<bool> {
        match self.inner.deadline {
            Some((when, kind)) if Instant::now() >= when => match kind {
                DeadlineKind::Handshake => Err(Error::HandshakeTimedOut),
                DeadlineKind::CloseFlush => Err(Error::TimedOutClosingConnection),
                DeadlineKind::SocketGrace => Ok(true),
            },
            _ => Ok(false),
        }
    }

    fn run_io_loop<State, S, F, G>(
        &mut self,
        stream: &mut S,
        state: &mut State,
        mut handle_event: F,
        mut have_written_to_socket: bool,
        is_done: G,
    ) -> Result<()>
    where
        S: Evented,
        F: FnMut(&mut Self, &mut S, &mut State, Event) -> Result<()>,
        G: Fn(&Self, &State) -> bool,
    {
        // Since we're called multiple times (to run TLS handshake, then AMQP handshake,
        // then main loop), we don't know whether the socket is registered for RW or just
        // R at entry. Check and see if we have any outgoing data to send (e.g., done
        // with TLS handshake and need to send the AMQP protocol header), and reregister
        // for RW if so.
        //
        // HOWEVER - on Windows, it's important not to reregister for readable until we've
        // written some data on the socket; otherwise we can get spurious readable wakeups
        // which lead to a NotConnected error when we try to actually read.
        // have_written_to_socket lets us track this.
        if self.inner.has_data_to_write() && have_written_to_socket {
            trace!("reregistering socket for readable or writable");
            self.poll
                .reregister(
                    stream,
                    STREAM,
                    Ready::readable() | Ready::writable(),
                    PollOpt::edge(),
                )
                .context(RegisterWithPollHandleSnafu)?;
        }

        let mut events = Events::with_capacity(128);
        let mut listening_to_channels = true;
        loop {
            let poll_timeout = self
                .inner
                .deadline
                .map(|(when, _)| when.checked_duration_since(Instant::now()).unwrap_or_default());
            self.poll
                .poll(&mut events, poll_timeout)
                .context(FailedToPollSnafu)?;

            if events.is_empty() {
                if self.check_deadline()? {
                    return Ok(());
                }
                continue;
            }

            let had_data_to_write = self.inner.has_data_to_write();

            for event in events.iter() {
                handle_event(self, stream, state, event)?;
            }

            if is_done(self, state) {
                return Ok(());
            }
            if self.check_deadline()? {
                return Ok(());
            }

            // Avoid out-of-memory from very fast publishers. If we have more than
            // buffered_writes_high_water data enqueued to write already, unregister all
            // channels (other than channel 0), and don't reregister until we're down to
            // buffered_writes_low_water.
            if listening_to_channels && self.inner.outbuf.len() > self.buffered_writes_high_water {
                debug!("passed high water mark for buffered writes; blocking channels internally");
                self.inner.deregister_nonzero_channels(&self.poll)?;
                listening_to_channels = false;
            } else if !listening_to_channels
                && self.inner.outbuf.len() <= self.buffered_writes_low_water
            {
                debug!("returned below low water mark for buffered writes; resuming channels");
                self.inner.reregister_nonzero_channels(&self.poll)?;
                listening_to_channels = true;
            }

            // If we have data to write, reregister for readable|writable. This may be a
            // spurious reregistration, but also may not - if we wrote all the data we have
            // but didn't get a WouldBlock, and then later in the processing loop added
            // more data to write but didn't write it, mio won't wake us back up again next
            // pass unless we reregister.
            //
            // If we don't have data to write, only reregister for readable (without
            // writable) if we had data to write after the last poll; otherwise we know
            // we were already registered as readable only and don't need to rereg.
            if self.inner.has_data_to_write() && have_written_to_socket {
                trace!("reregistering socket for readable or writable");
                self.poll
                    .reregister(
                        stream,
                        STREAM,
                        Ready::readable() | Ready::writable(),
                        PollOpt::edge(),
                    )
                    .context(RegisterWithPollHandleSnafu)?;
            } else if had_data_to_write {
                trace!("reregistering socket for readable only");
                have_written_to_socket = true;
                self.poll
                    .reregister(stream, STREAM, Ready::readable(), PollOpt::edge())
                    .context(RegisterWithPollHandleSnafu)?;
            }
        }
    }
}

pub(super) struct Inner {
    // Buffer of data waiting to be written. May contain multiple serialized frames.
    // Once we've appended a connection Close or CloseOk, it will be sealed (so any
    // future writes will be silently discarded).
    outbuf: SealableOutputBuffer,

    // Handle to I/O loop timers for tracking rx/tx heartbeats.
    heartbeats: HeartbeatTimers,

    // Timer driving wait-for-confirms timeouts across all channels.
    confirm_timer: Timer<ConfirmTimerKey>,

    // Slots for open channels (channel numbers 1 and up; channel 0 is owned
    // by the connection state).
    chan_slots: ChannelSlots<ChannelSlot>,

    // Bound for in-memory channels that send to our I/O thread. (Channels going _from_
    // the I/O thread are unbounded to prevent blocking the I/O thread on slow receivers.)
    mio_channel_bound: usize,

    // If true, non-0 channels are registered with mio. (Channel 0 is always registered.)
    channels_are_registered: bool,

    // Callers blocked on flush() until the outbuf fully drains.
    flush_waiters: Vec<CrossbeamSender<()>>,

    // A connection.close waiting for every channel's RPC queue to drain
    // before it goes on the wire, and the caller waiting for close-ok.
    pending_close: Option<OutputBuffer>,
    conn_close_reply: Option<ReplyTx>,

    // Active loop deadline (handshake cap, close-flush cap, or socket-close
    // grace period).
    deadline: Option<(Instant, DeadlineKind)>,
}

impl Inner {
    fn new(
        heartbeats: HeartbeatTimers,
        confirm_timer: Timer<ConfirmTimerKey>,
        mio_channel_bound: usize,
    ) -> Self {
        Inner {
            outbuf: SealableOutputBuffer::new(OutputBuffer::with_protocol_header()),
            heartbeats,
            confirm_timer,
            chan_slots: ChannelSlots::new(),
            mio_channel_bound,
            channels_are_registered: true,
            flush_waiters: Vec::new(),
            pending_close: None,
            conn_close_reply: None,
            deadline: None,
        }
    }

    #[inline]
    fn are_writes_sealed(&self) -> bool {
        self.outbuf.is_sealed()
    }

    #[inline]
    fn seal_writes(&mut self) {
        trace!("sealing writes - no more data should be enqueued");
        self.outbuf.seal();
    }

    #[inline]
    pub(super) fn push_method<M: IntoAmqpClass>(
        &mut self,
        channel_id: u16,
        method: M,
    ) -> Result<()> {
        self.outbuf.push_method(channel_id, method)
    }

    #[inline]
    fn start_heartbeats(&mut self, interval: u16) {
        if interval > 0 {
            debug!("starting heartbeat timers ({} sec)", interval);
            self.heartbeats
                .start(Duration::from_secs(u64::from(interval)));
        }
    }

    #[inline]
    fn has_data_to_write(&self) -> bool {
        !self.outbuf.is_empty()
    }

    /// True once connection closure is underway and channels must reject new
    /// requests with a closing indication.
    fn closing(&self) -> bool {
        self.pending_close.is_some() || self.outbuf.is_sealed()
    }

    /// The server acknowledged our connection.close; release the caller and
    /// linger briefly for the server to drop the socket.
    pub(super) fn connection_close_ok(&mut self) {
        if let Some(tx) = self.conn_close_reply.take() {
            let _ = tx.send(Ok(ChannelMessage::Method(AMQPClass::Connection(
                AmqpConnection::CloseOk(ConnectionCloseOk {}),
            ))));
        }
        self.deadline = Some((
            Instant::now() + SOCKET_CLOSE_GRACE,
            DeadlineKind::SocketGrace,
        ));
    }

    /// Once a connection close is pending and every channel's RPC queue has
    /// drained, put the close on the wire and seal the buffer.
    fn maybe_finish_flush(&mut self) {
        if self.pending_close.is_none() {
            return;
        }
        let all_idle = self.chan_slots.iter().all(|(_, slot)| slot.state.is_rpc_idle());
        if all_idle {
            debug!("all channels flushed; sending connection close");
            let buf = self.pending_close.take().unwrap();
            self.outbuf.append(buf);
            self.seal_writes();
        }
    }

    /// Fail or notify everything still attached to this connection. Both
    /// directions of the channel registry are empty afterwards.
    fn teardown(&mut self, reason: Error) {
        debug!("tearing down connection: {}", reason);
        if let Some(tx) = self.conn_close_reply.take() {
            let _ = tx.send(Err(reason.clone()));
        }
        for (_, mut slot) in self.chan_slots.drain() {
            slot.state
                .terminate(Some(reason.clone()), &mut self.confirm_timer);
        }
        for tx in self.flush_waiters.drain(..) {
            let _ = tx.send(());
        }
    }

    fn deregister_nonzero_channels(&mut self, poll: &Poll) -> Result<()> {
        for (_, slot) in self.chan_slots.iter() {
            poll.deregister(&slot.rx)
                .context(DeregisterWithPollHandleSnafu)?;
        }
        self.channels_are_registered = false;
        Ok(())
    }

    fn reregister_nonzero_channels(&mut self, poll: &Poll) -> Result<()> {
        for (id, slot) in self.chan_slots.iter() {
            poll.reregister(
                &slot.rx,
                Token(*id as usize),
                Ready::readable(),
                PollOpt::edge(),
            )
            .context(RegisterWithPollHandleSnafu)?;
        }
        self.channels_are_registered = true;
        Ok(())
    }

    fn process_heartbeat_timers(&mut self) -> Result<()> {
        while let Some(kind) = self.heartbeats.timer.poll() {
            match kind {
                HeartbeatKind::Rx => match self.heartbeats.fire_rx() {
                    HeartbeatState::StillRunning => {
                        trace!("rx heartbeat timer fired, but have received data since last");
                    }
                    HeartbeatState::Expired => {
                        error!("missed heartbeats from server - closing connection");
                        return Err(Error::MissedServerHeartbeats);
                    }
                },
                HeartbeatKind::Tx => match self.heartbeats.fire_tx() {
                    HeartbeatState::StillRunning => {
                        trace!("tx heartbeat timer fired, but have sent data since last");
                    }
                    HeartbeatState::Expired => {
                        // if we already have data queued up to send, don't bother also
                        // enqueuing up a heartbeat frame
                        if self.outbuf.is_empty() {
                            debug!("sending heartbeat");
                            self.outbuf.push_heartbeat();
                        } else {
                            warn!("tx heartbeat fired, but already have queued data to write - possible socket problem");
                        }
                    }
                },
            }
        }
        Ok(())
    }

    fn process_confirm_timers(&mut self) {
        while let Some((channel_id, waiter_id)) = self.confirm_timer.poll() {
            if let Some(slot) = self.chan_slots.get_mut(channel_id) {
                slot.state.confirm_wait_expired(waiter_id);
            }
        }
    }

    fn handle_channel0_readable(&mut self, ch0_slot: &Channel0Slot) -> Result<()> {
        loop {
            match ch0_slot.common.rx.try_recv() {
                Ok(request) => self.process_channel0_request(request)?,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(Error::EventLoopClientDropped),
            }
        }
    }

    fn process_channel0_request(&mut self, request: ChannelRequest) -> Result<()> {
        match request {
            ChannelRequest::CloseConnection { buf, reply_tx } => {
                debug!("connection close requested; flushing channels");
                self.conn_close_reply = Some(reply_tx);
                self.pending_close = Some(buf);
                self.deadline = Some((
                    Instant::now() + CLOSE_FLUSH_WAIT,
                    DeadlineKind::CloseFlush,
                ));
                self.maybe_finish_flush();
                Ok(())
            }
            ChannelRequest::Flush { reply_tx } => {
                if self.outbuf.is_empty() {
                    let _ = reply_tx.send(());
                } else {
                    self.flush_waiters.push(reply_tx);
                }
                Ok(())
            }
            _ => unreachable!("unsupported request on channel 0"),
        }
    }

    fn handle_channel_readable(&mut self, channel_id: u16) -> Result<()> {
        loop {
            let request = match self.chan_slots.get_mut(channel_id) {
                // We've been asked to poll a receiver for a channel we dropped; this
                // is rare, but could happen if (e.g.) the server initiated a Close in this
                // same poll processing loop and we already saw it. In that case, we've
                // already removed channel_id from chan_slots, but now we've landed in a
                // still-pending readable event from poll. Bail out now without an error;
                // the dropped channel will propagate an appropriate message back out to
                // the channel handle.
                None => return Ok(()),
                Some(slot) => match slot.rx.try_recv() {
                    Ok(request) => request,
                    Err(TryRecvError::Empty) => return Ok(()),
                    // An application channel died without closing; per the
                    // termination policy this abnormal end takes the whole
                    // connection down.
                    Err(TryRecvError::Disconnected) => return Err(Error::EventLoopClientDropped),
                },
            };
            self.process_channel_request(channel_id, request)?;
        }
    }

    fn process_channel_request(&mut self, channel_id: u16, request: ChannelRequest) -> Result<()> {
        // flushes are connection-wide, not per-channel state
        if let ChannelRequest::Flush { reply_tx } = request {
            if self.outbuf.is_empty() {
                let _ = reply_tx.send(());
            } else {
                self.flush_waiters.push(reply_tx);
            }
            return Ok(());
        }

        let request = if self.closing() {
            match request {
                ChannelRequest::Rpc {
                    reply_tx: Some(tx), ..
                }
                | ChannelRequest::Get { reply_tx: tx, .. }
                | ChannelRequest::Consume { reply_tx: tx, .. }
                | ChannelRequest::CloseChannel { reply_tx: tx, .. } => {
                    let _ = tx.send(Err(Error::ClientClosedConnection));
                    return Ok(());
                }
                ChannelRequest::WaitForConfirms { reply_tx, .. } => {
                    let _ = reply_tx.send(Err(Error::ClientClosedConnection));
                    return Ok(());
                }
                ChannelRequest::Rpc { reply_tx: None, .. } => {
                    debug!(
                        "discarding cast on channel {} (connection closing)",
                        channel_id
                    );
                    return Ok(());
                }
                other => other,
            }
        } else {
            request
        };

        // safe to unwrap: we just pulled this request off the slot's receiver
        let slot = self.chan_slots.get_mut(channel_id).unwrap();
        slot.state.handle_request(request, &mut self.confirm_timer)?;
        let out = slot.state.take_outgoing();
        for buf in out {
            self.outbuf.append(buf);
        }
        Ok(())
    }

    pub(super) fn handle_channel_method(&mut self, channel_id: u16, method: AMQPClass) -> Result<()> {
        let slot = match self.chan_slots.get_mut(channel_id) {
            Some(slot) => slot,
            None => return ReceivedFrameWithBogusChannelIdSnafu { channel_id }.fail(),
        };
        let termination = slot.state.handle_method(method, &mut self.confirm_timer)?;
        let out = slot.state.take_outgoing();
        for buf in out {
            self.outbuf.append(buf);
        }
        if let Some(termination) = termination {
            self.finish_channel(channel_id, termination.reason);
        }
        Ok(())
    }

    pub(super) fn handle_channel_header(
        &mut self,
        channel_id: u16,
        header: amq_protocol::frame::AMQPContentHeader,
    ) -> Result<()> {
        let slot = match self.chan_slots.get_mut(channel_id) {
            Some(slot) => slot,
            None => return ReceivedFrameWithBogusChannelIdSnafu { channel_id }.fail(),
        };
        slot.state.handle_header(header)
    }

    pub(super) fn handle_channel_body(&mut self, channel_id: u16, body: Vec<u8>) -> Result<()> {
        let slot = match self.chan_slots.get_mut(channel_id) {
            Some(slot) => slot,
            None => return ReceivedFrameWithBogusChannelIdSnafu { channel_id }.fail(),
        };
        slot.state.handle_body(body)
    }

    fn finish_channel(&mut self, channel_id: u16, reason: Option<Error>) {
        debug!("channel {} finished ({:?})", channel_id, reason);
        if let Some(mut slot) = self.chan_slots.remove(channel_id) {
            slot.state.terminate(reason, &mut self.confirm_timer);
        }
    }

    fn allocate_channel(&mut self, ch0_slot: &Channel0Slot, poll: &Poll) -> Result<()> {
        loop {
            let new_channel_id = match ch0_slot.alloc_chan_req_rx.try_recv() {
                Ok(new_channel_id) => new_channel_id,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(Error::EventLoopClientDropped),
            };

            if self.closing() {
                let _ = ch0_slot
                    .alloc_chan_rep_tx
                    .send(Err(Error::ClientClosedConnection));
                continue;
            }

            let mio_channel_bound = self.mio_channel_bound;
            let channels_are_registered = self.channels_are_registered;
            let result = self.chan_slots.insert(new_channel_id, |new_channel_id| {
                let (slot, handle) = ChannelSlot::new(mio_channel_bound, new_channel_id);
                poll.register(
                    &slot.rx,
                    Token(new_channel_id as usize),
                    Ready::readable(),
                    PollOpt::edge(),
                )
                .context(RegisterWithPollHandleSnafu)?;
                if !channels_are_registered {
                    // If we're currently in a deregistered state (i.e., too much data to
                    // write), go ahead and deregister this new channel. We do the register+
                    // deregister dance so we can call reregister on this new channel even
                    // though it hadn't existed when we deregistered all the existing
                    // channels.
                    poll.deregister(&slot.rx)
                        .context(DeregisterWithPollHandleSnafu)?;
                }
                Ok((slot, handle))
            });
            match ch0_slot.alloc_chan_rep_tx.send(result) {
                Ok(()) => (),
                Err(SendError(Ok(handle))) => {
                    // send failed - clear the allocated channel
                    self.chan_slots.remove(handle.channel_id());
                }
                Err(SendError(Err(_))) => {
                    // send failed, but so did channel creation. do nothing
                }
            }
        }
    }

    fn read_from_stream<S, F>(
        &mut self,
        stream: &mut S,
        frame_buffer: &mut FrameBuffer,
        mut handler: F,
    ) -> Result<()>
    where
        S: IoStream,
        F: FnMut(&mut Inner, AMQPFrame) -> Result<()>,
    {
        let n = frame_buffer.read_from(stream, |frame| {
            trace!("read frame {:?}", frame);
            handler(self, frame)
        })?;
        if n > 0 {
            self.heartbeats.record_rx_activity();
        }
        Ok(())
    }

    fn write_to_stream<S: IoStream>(&mut self, stream: &mut S) -> Result<()> {
        let len = self.outbuf.len();
        let mut pos = 0;

        // Keep writing until we've written all len bytes or we hit WouldBlock.
        while pos < len {
            trace!("trying to write {} bytes", len - pos);
            let n = match stream.write(&self.outbuf[pos..]) {
                Ok(n) => {
                    trace!("wrote {} bytes", n);
                    self.heartbeats.record_tx_activity();
                    n
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => {
                        self.outbuf.drain_written(pos);
                        return Ok(());
                    }
                    _ => return Err(err).context(IoSnafu),
                },
            };
            pos += n;
        }

        // Wrote everything we have - use clear instead of .drain_written().
        self.outbuf.clear();
        for tx in self.flush_waiters.drain(..) {
            let _ = tx.send(());
        }
        Ok(())
    }
}
