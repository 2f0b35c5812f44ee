use super::with_chan;
use crate::{
    AmqpProperties, ConsumerMessage, ConsumerOptions, ExchangeDeclareOptions, ExchangeType,
    FieldTable, QueueDeclareOptions,
};
use std::time::Duration;

#[test]
fn publish_and_consume_roundtrip() {
    with_chan(|chan| {
        let exchange = chan
            .exchange_declare(
                ExchangeType::Direct,
                "coney-test-pubsub",
                ExchangeDeclareOptions {
                    auto_delete: true,
                    ..ExchangeDeclareOptions::default()
                },
            )
            .unwrap();
        let queue = chan
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
            )
            .unwrap();
        queue
            .bind(exchange.name(), "test-key", FieldTable::new())
            .unwrap();

        let consumer = queue
            .consume(ConsumerOptions {
                no_ack: true,
                ..ConsumerOptions::default()
            })
            .unwrap();

        exchange
            .publish(b"hello", "test-key", false, &AmqpProperties::default())
            .unwrap();

        match consumer
            .receiver()
            .recv_timeout(Duration::from_secs(10))
            .unwrap()
        {
            ConsumerMessage::Delivery(delivery) => {
                assert_eq!(delivery.content, b"hello");
                assert!(!delivery.redelivered);
            }
            other => panic!("expected delivery, got {:?}", other),
        }

        consumer.cancel().unwrap();
    })
}

#[test]
fn get_from_queue() {
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

        assert!(queue.get(true).unwrap().is_none());

        chan.basic_publish(
            b"stored",
            "",
            queue.name(),
            false,
            false,
            &AmqpProperties::default(),
        )
        .unwrap();
        chan.flush().unwrap();

        // the publish is async; the broker may need a moment to route it
        let mut fetched = None;
        for _ in 0..50 {
            if let Some(get) = queue.get(true).unwrap() {
                fetched = Some(get);
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        let get = fetched.expect("message never became gettable");
        assert_eq!(get.delivery.content, b"stored");
    })
}

#[test]
fn returned_mandatory_message_reaches_handler() {
    with_chan(|chan| {
        let returns = chan.register_return_handler().unwrap();
        chan.basic_publish(
            b"nowhere",
            "",
            "coney-test-no-such-queue",
            true,
            false,
            &AmqpProperties::default(),
        )
        .unwrap();

        let ret = returns.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(ret.content, b"nowhere");
        assert_eq!(ret.reply_code, 312); // NO_ROUTE
    })
}
