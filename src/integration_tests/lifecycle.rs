use super::{with_conn, with_test_url};
use crate::{
    AmqpProperties, Connection, ConsumerMessage, ConsumerOptions, Error, ExchangeDeclareOptions,
    ExchangeType, ForwardingSink, QueueDeclareOptions,
};
use std::time::Duration;

// Declaring an exchange with a type the broker has never heard of is a
// connection-level (hard) error; every channel dies with the connection.
#[test]
fn hard_error_terminates_the_connection() {
    with_test_url(|url| {
        let mut conn = Connection::insecure_open(url).unwrap();
        let chan_a = conn.open_channel(None).unwrap();
        let chan_b = conn.open_channel(None).unwrap();

        let bystander_queue = chan_b
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
            )
            .unwrap();
        let bystander = bystander_queue.consume(ConsumerOptions::default()).unwrap();

        let err = chan_a
            .exchange_declare(
                ExchangeType::Custom("x-no-such-type".to_string()),
                "coney-test-bad-type",
                ExchangeDeclareOptions::default(),
            )
            .unwrap_err();
        match err {
            Error::ServerClosedConnection { code, .. } => assert_eq!(code, 503),
            other => panic!("expected connection error, got {}", other),
        }

        // the unrelated channel observes the connection-wide closure
        match bystander
            .receiver()
            .recv_timeout(Duration::from_secs(10))
            .unwrap()
        {
            ConsumerMessage::ServerClosedConnection(_) => (),
            other => panic!("expected connection closure, got {:?}", other),
        }

        assert!(conn.close().is_err());
    })
}

// Redeclaring an exchange with a conflicting type is a channel-level (soft)
// error; the sibling channel and the connection survive.
#[test]
fn soft_error_terminates_only_its_channel() {
    with_conn(|conn| {
        let chan_a = conn.open_channel(None).unwrap();
        let chan_b = conn.open_channel(None).unwrap();

        chan_a
            .exchange_declare(
                ExchangeType::Direct,
                "coney-test-soft-error",
                ExchangeDeclareOptions {
                    auto_delete: true,
                    ..ExchangeDeclareOptions::default()
                },
            )
            .unwrap();

        let err = chan_a
            .exchange_declare(
                ExchangeType::Fanout,
                "coney-test-soft-error",
                ExchangeDeclareOptions {
                    auto_delete: true,
                    ..ExchangeDeclareOptions::default()
                },
            )
            .unwrap_err();
        match err {
            Error::ServerClosedChannel { code, .. } => assert_eq!(code, 406),
            other => panic!("expected channel error, got {}", other),
        }

        // the dead channel rejects further work...
        assert!(chan_a.basic_qos(0, 1, false).is_err());

        // ...but its sibling is untouched
        chan_b.basic_qos(0, 1, false).unwrap();
        chan_b.close().unwrap();
    })
}

#[test]
fn close_is_idempotent_from_the_application() {
    with_conn(|conn| {
        let chan = conn.open_channel(None).unwrap();
        chan.close().unwrap();
        assert!(matches!(chan.close(), Err(Error::ClientClosedChannel)));
    })
}

// Every channel must see the connection-wide closure notice, drain, and the
// connection must come down cleanly.
#[test]
fn graceful_shutdown_notifies_every_channel() {
    with_test_url(|url| {
        let mut conn = Connection::insecure_open(url).unwrap();

        let mut consumers = Vec::new();
        let mut channels = Vec::new();
        for _ in 0..4 {
            let chan = conn.open_channel(None).unwrap();
            let queue = chan
                .queue_declare(
                    "",
                    QueueDeclareOptions {
                        exclusive: true,
                        ..QueueDeclareOptions::default()
                    },
                )
                .unwrap();
            let (tx, rx) = crossbeam_channel::unbounded();
            chan.consume(
                queue.name(),
                ConsumerOptions::default(),
                Box::new(ForwardingSink::new(tx)),
            )
            .unwrap();
            consumers.push(rx);
            // leave an async publish in flight on each channel
            chan.basic_publish(
                b"pending",
                "",
                queue.name(),
                false,
                false,
                &AmqpProperties::default(),
            )
            .unwrap();
            channels.push(chan);
        }

        conn.close().unwrap();

        for rx in consumers {
            match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
                ConsumerMessage::ClientClosedConnection => (),
                other => panic!("expected client connection closure, got {:?}", other),
            }
        }
    })
}
