//! Offline buffering and reconnect replay.

mod common;

use common::{accept_and_connack, connect, harness, Events, JsonCodec, BROKER_URI};
use mqttc::transport::mock;
use mqttc::{
    BufferConfig, ConnectOptions, MqttClient, MqttError, Packet, PacketCodec, QoS,
    ReconnectConfig,
};
use std::sync::Arc;
use std::time::Duration;

fn buffered_options() -> ConnectOptions {
    ConnectOptions::new("offline-test", BROKER_URI)
        .with_keep_alive(Duration::from_secs(0))
        .with_buffer(BufferConfig {
            enabled: true,
            max_messages: 100,
            delete_oldest: false,
            persist: false,
        })
}

#[tokio::test]
async fn publishes_without_buffering_fail_when_disconnected() {
    let (client, _broker, _) = harness();
    assert_eq!(
        client
            .publish("t", b"x".to_vec(), QoS::AtLeastOnce, false)
            .unwrap_err(),
        MqttError::NotConnected
    );
}

#[tokio::test]
async fn buffered_publishes_flush_once_connected() {
    let (client, mut broker, _) = harness();
    // Buffering policy comes from the options, so the first connect attempt
    // has to carry them before we go offline; connect, drop, then buffer.
    let options = buffered_options().with_reconnect(ReconnectConfig {
        enabled: true,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        max_attempts: None,
    });
    let events = Events::new();
    client.set_handler(Some(events.clone()));
    let conn = connect(&client, &mut broker, options).await;
    conn.close();
    events.wait_until(|e| !e.lost.lock().is_empty()).await;

    let token = client
        .publish("queued", b"later".to_vec(), QoS::AtLeastOnce, false)
        .unwrap();
    assert_eq!(client.buffered_count(), 1);
    assert!(!token.is_complete());

    let mut conn = accept_and_connack(&mut broker, false).await;
    let Packet::Publish(p) = conn.recv().await.unwrap() else {
        panic!("expected buffered PUBLISH");
    };
    assert_eq!(p.topic, "queued");
    assert_eq!(client.buffered_count(), 0);

    conn.send(&Packet::PubAck {
        packet_id: p.packet_id.unwrap(),
    })
    .await
    .unwrap();
    token.wait().await.unwrap();
}

#[tokio::test]
async fn full_buffer_rejects_new_messages_by_default() {
    let (client, mut broker, _) = harness();
    let options = buffered_options().with_buffer(BufferConfig {
        enabled: true,
        max_messages: 1,
        delete_oldest: false,
        persist: false,
    });
    let conn = connect(&client, &mut broker, options).await;
    conn.close();
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    client
        .publish("one", b"a".to_vec(), QoS::AtLeastOnce, false)
        .unwrap();
    assert_eq!(
        client
            .publish("two", b"b".to_vec(), QoS::AtLeastOnce, false)
            .unwrap_err(),
        MqttError::BufferFull
    );
}

#[tokio::test]
async fn delete_oldest_policy_discards_the_oldest_token() {
    let (client, mut broker, _) = harness();
    let options = buffered_options().with_buffer(BufferConfig {
        enabled: true,
        max_messages: 1,
        delete_oldest: true,
        persist: false,
    });
    let conn = connect(&client, &mut broker, options).await;
    conn.close();
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let oldest = client
        .publish("one", b"a".to_vec(), QoS::AtLeastOnce, false)
        .unwrap();
    let newest = client
        .publish("two", b"b".to_vec(), QoS::AtLeastOnce, false)
        .unwrap();

    assert!(matches!(
        oldest.wait().await.unwrap_err(),
        MqttError::BufferDiscarded(_)
    ));
    assert!(!newest.is_complete());
    assert_eq!(client.buffered_count(), 1);
}

#[tokio::test]
async fn buffered_messages_flush_in_publish_order() {
    let (client, mut broker, _) = harness();
    let options = buffered_options().with_reconnect(ReconnectConfig {
        enabled: true,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        max_attempts: None,
    });
    let events = Events::new();
    client.set_handler(Some(events.clone()));
    let conn = connect(&client, &mut broker, options).await;
    conn.close();
    events.wait_until(|e| !e.lost.lock().is_empty()).await;

    let tokens: Vec<_> = (0u8..5)
        .map(|i| {
            client
                .publish(format!("q/{i}"), vec![i], QoS::AtLeastOnce, false)
                .unwrap()
        })
        .collect();
    assert_eq!(client.buffered_count(), 5);

    let mut conn = accept_and_connack(&mut broker, false).await;
    for i in 0u8..5 {
        let Packet::Publish(p) = conn.recv().await.unwrap() else {
            panic!("expected PUBLISH");
        };
        assert_eq!(p.topic, format!("q/{i}"));
        assert_eq!(p.payload, vec![i]);
        conn.send(&Packet::PubAck {
            packet_id: p.packet_id.unwrap(),
        })
        .await
        .unwrap();
    }
    for token in tokens {
        token.wait().await.unwrap();
    }
}

#[tokio::test]
async fn unfinished_qos1_is_replayed_with_dup_after_reconnect() {
    let (client, mut broker, _) = harness();
    let options = ConnectOptions::new("replayer", BROKER_URI)
        .with_keep_alive(Duration::from_secs(0))
        .with_clean_session(false)
        .with_reconnect(ReconnectConfig {
            enabled: true,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts: None,
        });
    let events = Events::new();
    client.set_handler(Some(events.clone()));
    let mut conn = connect(&client, &mut broker, options).await;

    let token = client
        .publish("durable", b"must-arrive".to_vec(), QoS::AtLeastOnce, false)
        .unwrap();
    let Packet::Publish(first) = conn.recv().await.unwrap() else {
        panic!("expected PUBLISH");
    };
    assert!(!first.dup);
    let id = first.packet_id.unwrap();

    // Connection dies before the PUBACK.
    conn.close();
    let mut conn = accept_and_connack(&mut broker, true).await;

    let Packet::Publish(replayed) = conn.recv().await.unwrap() else {
        panic!("expected replayed PUBLISH");
    };
    assert_eq!(replayed.packet_id, Some(id));
    assert!(replayed.dup, "replay must set the dup flag");
    assert_eq!(replayed.payload, b"must-arrive");
    assert!(!token.is_complete());

    conn.send(&Packet::PubAck { packet_id: id }).await.unwrap();
    token.wait().await.unwrap();
}

#[tokio::test]
async fn qos2_past_pubrec_replays_pubrel_not_the_publish() {
    let (client, mut broker, _) = harness();
    let options = ConnectOptions::new("replayer2", BROKER_URI)
        .with_keep_alive(Duration::from_secs(0))
        .with_clean_session(false)
        .with_reconnect(ReconnectConfig {
            enabled: true,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts: None,
        });
    let mut conn = connect(&client, &mut broker, options).await;

    let token = client
        .publish("durable", b"x".to_vec(), QoS::ExactlyOnce, false)
        .unwrap();
    let Packet::Publish(p) = conn.recv().await.unwrap() else {
        panic!("expected PUBLISH");
    };
    let id = p.packet_id.unwrap();
    conn.send(&Packet::PubRec { packet_id: id }).await.unwrap();
    assert!(matches!(conn.recv().await.unwrap(), Packet::PubRel { .. }));

    // PUBCOMP never arrives; the handshake resumes from PUBREL.
    conn.close();
    let mut conn = accept_and_connack(&mut broker, true).await;
    let replayed = conn.recv().await.unwrap();
    assert!(matches!(replayed, Packet::PubRel { packet_id } if packet_id == id));

    conn.send(&Packet::PubComp { packet_id: id }).await.unwrap();
    token.wait().await.unwrap();
}

#[tokio::test]
async fn clean_session_reconnect_does_not_replay() {
    let (client, mut broker, _) = harness();
    let events = Events::new();
    client.set_handler(Some(events.clone()));
    let options = ConnectOptions::new("cleaner", BROKER_URI)
        .with_keep_alive(Duration::from_secs(0))
        .with_clean_session(true)
        .with_reconnect(ReconnectConfig {
            enabled: true,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts: None,
        });
    let mut conn = connect(&client, &mut broker, options).await;

    let token = client
        .publish("ephemeral", b"x".to_vec(), QoS::AtLeastOnce, false)
        .unwrap();
    conn.recv().await.unwrap();
    conn.close();

    let mut conn = accept_and_connack(&mut broker, false).await;
    events.wait_until(|e| e.connected.lock().len() == 2).await;

    // The unfinished delivery was dropped with the session, and nothing is
    // replayed: the next packet the broker sees is the fresh publish.
    assert!(matches!(
        token.wait().await.unwrap_err(),
        MqttError::ConnectionLost(_)
    ));
    client
        .publish("fresh", b"y".to_vec(), QoS::AtMostOnce, false)
        .unwrap();
    let Packet::Publish(p) = conn.recv().await.unwrap() else {
        panic!("expected PUBLISH");
    };
    assert_eq!(p.topic, "fresh");
}

#[tokio::test]
async fn persisted_state_survives_a_client_restart() {
    // Two client instances sharing one store stand in for a process restart.
    common::init_tracing();
    let codec: Arc<dyn PacketCodec> = Arc::new(JsonCodec);
    let store = Arc::new(mqttc::MemoryStore::new());
    let (mut broker, factory) = mock::broker(codec.clone());

    let options = ConnectOptions::new("restarter", BROKER_URI)
        .with_keep_alive(Duration::from_secs(0))
        .with_clean_session(false);

    let first = MqttClient::with_store(codec.clone(), store.clone());
    first.register_transport("mock", factory.clone());
    let mut conn = connect(&first, &mut broker, options.clone()).await;
    first
        .publish("durable", b"carried-over".to_vec(), QoS::AtLeastOnce, false)
        .unwrap();
    let Packet::Publish(p) = conn.recv().await.unwrap() else {
        panic!("expected PUBLISH");
    };
    let id = p.packet_id.unwrap();
    drop(conn);
    tokio::time::timeout(Duration::from_secs(5), async {
        while first.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    first.close().await.unwrap();

    let second = MqttClient::with_store(codec, store);
    second.register_transport("mock", factory);
    let mut conn = connect(&second, &mut broker, options).await;
    let Packet::Publish(replayed) = conn.recv().await.unwrap() else {
        panic!("expected replayed PUBLISH");
    };
    assert_eq!(replayed.packet_id, Some(id));
    assert!(replayed.dup);
    assert_eq!(replayed.payload, b"carried-over");
}

#[tokio::test]
async fn persisted_buffer_survives_a_client_restart() {
    common::init_tracing();
    let codec: Arc<dyn PacketCodec> = Arc::new(JsonCodec);
    let store = Arc::new(mqttc::MemoryStore::new());
    let (mut broker, factory) = mock::broker(codec.clone());

    let options = ConnectOptions::new("buffer-restart", BROKER_URI)
        .with_keep_alive(Duration::from_secs(0))
        .with_clean_session(false)
        .with_buffer(BufferConfig {
            enabled: true,
            max_messages: 10,
            delete_oldest: false,
            persist: true,
        });

    let first = MqttClient::with_store(codec.clone(), store.clone());
    first.register_transport("mock", factory.clone());
    let conn = connect(&first, &mut broker, options.clone()).await;
    conn.close();
    tokio::time::timeout(Duration::from_secs(5), async {
        while first.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    first
        .publish("held", b"until-later".to_vec(), QoS::AtLeastOnce, false)
        .unwrap();
    assert_eq!(first.buffered_count(), 1);
    first.close().await.unwrap();

    // A new process picks the buffered message up from the store and sends
    // it with the next session.
    let second = MqttClient::with_store(codec, store);
    second.register_transport("mock", factory);
    let mut conn = connect(&second, &mut broker, options).await;
    let Packet::Publish(p) = conn.recv().await.unwrap() else {
        panic!("expected buffered PUBLISH");
    };
    assert_eq!(p.topic, "held");
    assert_eq!(p.payload, b"until-later");
    conn.send(&Packet::PubAck {
        packet_id: p.packet_id.unwrap(),
    })
    .await
    .unwrap();
}
