use log::trace;
use mio_extras::timer::{Timeout, Timer};
use std::time::{Duration, Instant};

/// A server that misses two successive heartbeat intervals is considered
/// dead; this matches the AMQP recommendation.
const MAX_MISSED_SERVER_HEARTBEATS: u32 = 2;

#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum HeartbeatKind {
    Rx,
    Tx,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum HeartbeatState {
    StillRunning,
    Expired,
}

/// One direction of heartbeat monitoring: a repeating timeout that is pushed
/// back by `record_activity` calls.
#[derive(Debug)]
struct Heartbeat {
    kind: HeartbeatKind,
    last: Instant,
    timeout: Timeout,
    interval: Duration,
}

impl Heartbeat {
    fn start(kind: HeartbeatKind, interval: Duration, timer: &mut Timer<HeartbeatKind>) -> Heartbeat {
        assert!(
            interval > Duration::from_millis(0),
            "timer interval cannot be 0"
        );
        Heartbeat {
            kind,
            last: Instant::now(),
            timeout: timer.set_timeout(interval, kind),
            interval,
        }
    }

    fn record_activity(&mut self) {
        self.last = Instant::now();
    }

    fn fire(&mut self, timer: &mut Timer<HeartbeatKind>) -> HeartbeatState {
        timer.cancel_timeout(&self.timeout);

        // see if the heartbeat timer has expired (in which case we'll restart for
        // the full interval) or if there have been intervening record_activity()
        // calls for activity (in which case we'll restart for the remaining time).
        //
        // We'll add a bit of fudge in the comparison to handle imprecise wakeups;
        // during unit tests sometimes we wake up <1ms before expiration, but we
        // want to count that as expired anyway. AMQP heartbeats are scaled in
        // seconds, so a few ms is harmless.
        let elapsed = self.last.elapsed();
        let (when, state) = if self.interval <= elapsed + Duration::from_millis(5) {
            (self.interval, HeartbeatState::Expired)
        } else {
            (self.interval - elapsed, HeartbeatState::StillRunning)
        };

        trace!(
            "setting new heartbeat timer {:?} for {:?} (interval = {:?}, elapsed = {:?})",
            self.kind,
            when,
            self.interval,
            elapsed
        );
        self.timeout = timer.set_timeout(when, self.kind);
        state
    }
}

/// Heartbeat scheduling for a connection: a send timer at the negotiated
/// interval and a receive timer that expires after
/// `MAX_MISSED_SERVER_HEARTBEATS` intervals of silence from the server.
#[derive(Default)]
pub(crate) struct HeartbeatTimers {
    pub(crate) timer: Timer<HeartbeatKind>,
    directions: Option<(Heartbeat, Heartbeat)>,
}

impl HeartbeatTimers {
    pub(crate) fn start(&mut self, interval: Duration) {
        assert!(
            self.directions.is_none(),
            "heartbeat timer started multiple times"
        );
        let rx = Heartbeat::start(
            HeartbeatKind::Rx,
            MAX_MISSED_SERVER_HEARTBEATS * interval,
            &mut self.timer,
        );
        let tx = Heartbeat::start(HeartbeatKind::Tx, interval, &mut self.timer);
        self.directions = Some((rx, tx));
    }

    pub(crate) fn record_rx_activity(&mut self) {
        if let Some((rx, _)) = &mut self.directions {
            trace!("recording activity for rx heartbeat");
            rx.record_activity();
        }
    }

    pub(crate) fn record_tx_activity(&mut self) {
        if let Some((_, tx)) = &mut self.directions {
            trace!("recording activity for tx heartbeat");
            tx.record_activity();
        }
    }

    pub(crate) fn fire_rx(&mut self) -> HeartbeatState {
        let (rx, _) = self
            .directions
            .as_mut()
            .expect("fire_rx called on empty heartbeats");
        rx.fire(&mut self.timer)
    }

    pub(crate) fn fire_tx(&mut self) -> HeartbeatState {
        let (_, tx) = self
            .directions
            .as_mut()
            .expect("fire_tx called on empty heartbeats");
        tx.fire(&mut self.timer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll, PollOpt, Ready, Token};
    use mio_extras::timer::Builder;

    struct Harness {
        poll: Poll,
        events: Events,
        timer: Timer<HeartbeatKind>,
    }

    impl Harness {
        const TOKEN: Token = Token(0);

        fn new() -> Harness {
            let poll = Poll::new().unwrap();
            let events = Events::with_capacity(16);
            let timer = Builder::default().tick_duration(millis(10)).build();
            poll.register(&timer, Self::TOKEN, Ready::readable(), PollOpt::edge())
                .unwrap();
            Harness {
                poll,
                events,
                timer,
            }
        }

        fn poll(&mut self, timeout: Duration) {
            self.poll.poll(&mut self.events, Some(timeout)).unwrap();
        }

        fn poll_until_fire(&mut self, h: &mut Heartbeat) -> HeartbeatState {
            loop {
                self.poll.poll(&mut self.events, None).unwrap();
                for ev in &self.events {
                    assert_eq!(ev.token(), Self::TOKEN);
                    if self.timer.poll().is_some() {
                        return h.fire(&mut self.timer);
                    }
                }
            }
        }
    }

    fn millis(u: u64) -> Duration {
        Duration::from_millis(u)
    }

    fn assert_duration_is_about(one: Duration, two: Duration) {
        // NOTE: assumes two is >= 50ms, or will panic on the subtraction.
        // Fine for all our tests which are 100s of ms test durations
        assert!(one > two - millis(50));
        assert!(one < two + millis(50));
    }

    #[test]
    fn fire_after_expiration() {
        let mut t = Harness::new();
        let mut h = Heartbeat::start(HeartbeatKind::Tx, millis(400), &mut t.timer);
        let start = Instant::now();

        let state = t.poll_until_fire(&mut h);

        assert_duration_is_about(start.elapsed(), millis(400));
        assert_eq!(state, HeartbeatState::Expired);
    }

    #[test]
    fn fire_after_activity() {
        let mut t = Harness::new();
        let mut h = Heartbeat::start(HeartbeatKind::Tx, millis(400), &mut t.timer);
        let start = Instant::now();

        // timer shouldn't fire yet
        t.poll(millis(200));
        assert_duration_is_about(start.elapsed(), millis(200));
        assert!(t.events.is_empty());
        h.record_activity();

        // timer should fire, but should be set back to "still running"
        let state = t.poll_until_fire(&mut h);
        assert_duration_is_about(start.elapsed(), millis(400));
        assert_eq!(state, HeartbeatState::StillRunning);

        // timer should fire again and expire in just ~200ms
        let state = t.poll_until_fire(&mut h);
        assert_duration_is_about(start.elapsed(), millis(600));
        assert_eq!(state, HeartbeatState::Expired);
    }

    #[test]
    fn rx_expires_after_two_intervals() {
        let mut t = Harness::new();
        let mut timers = HeartbeatTimers {
            timer: Builder::default().tick_duration(millis(10)).build(),
            directions: None,
        };
        t.poll
            .register(&timers.timer, Token(1), Ready::readable(), PollOpt::edge())
            .unwrap();
        timers.start(millis(200));
        let start = Instant::now();

        loop {
            t.poll.poll(&mut t.events, None).unwrap();
            if let Some(HeartbeatKind::Rx) = timers.timer.poll() {
                break;
            }
        }
        assert_eq!(timers.fire_rx(), HeartbeatState::Expired);
        assert_duration_is_about(start.elapsed(), millis(400));
    }
}
