use super::with_chan;
use crate::{AmqpProperties, Error, QueueDeclareOptions};
use std::time::Duration;

#[test]
fn wait_for_confirms_covers_all_publishes() {
    with_chan(|chan| {
        let queue = chan
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
            )
            .unwrap();

        chan.enable_publisher_confirms().unwrap();
        assert_eq!(chan.next_publish_seqno().unwrap(), 1);

        for payload in &["a", "b", "c"] {
            chan.basic_publish(
                payload.as_bytes(),
                "",
                queue.name(),
                false,
                false,
                &AmqpProperties::default(),
            )
            .unwrap();
        }
        assert_eq!(chan.next_publish_seqno().unwrap(), 4);

        let all_acked = chan
            .wait_for_confirms(Some(Duration::from_secs(10)))
            .unwrap();
        assert!(all_acked);
    })
}

#[test]
fn wait_for_confirms_requires_confirm_mode() {
    with_chan(|chan| {
        assert!(matches!(
            chan.wait_for_confirms(None),
            Err(Error::NotInConfirmMode)
        ));
    })
}

#[test]
fn confirm_handler_sees_acks() {
    with_chan(|chan| {
        chan.enable_publisher_confirms().unwrap();
        let confirms = chan.register_confirm_handler().unwrap();

        chan.basic_publish(
            b"x",
            "",
            "coney-confirm-unroutable",
            false,
            false,
            &AmqpProperties::default(),
        )
        .unwrap();

        // even unroutable messages are confirmed
        confirms.recv_timeout(Duration::from_secs(10)).unwrap();
    })
}
