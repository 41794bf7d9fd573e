use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use sawbridge_core::{Tag, TagDataType, TagTable, TagValue};
use sawbridge_fieldbus::{FieldBusSession, SessionConfig, SimFieldClient};
use sawbridge_proto::{ControlMessage, StatusMessage, TopicScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use uuid::Uuid;

fn parse_mqtt_url(url: &str) -> (String, u16) {
    let url = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(url);

    let parts: Vec<&str> = url.split(':').collect();

    let host = parts.first().copied().unwrap_or("localhost").to_string();
    let port = parts.get(1).and_then(|p| p.parse().ok()).unwrap_or(1883);

    (host, port)
}

async fn spawn_eventloop(mut eventloop: EventLoop) {
    loop {
        if eventloop.poll().await.is_err() {
            break;
        }
    }
}

fn tag(name: &str, address: &str, data_type: TagDataType) -> Tag {
    Tag {
        name: name.to_string(),
        address: address.to_string(),
        data_type,
        monitored: true,
        published: false,
        unit: None,
    }
}

/// Changes fed to the simulator arrive at observers in the order the
/// device produced them, end to end through the session pump.
#[tokio::test]
async fn simulator_updates_preserve_order() {
    let sim = SimFieldClient::with_values([
        ("ns=2;s=SawMill/PiecesCount".to_string(), TagValue::Integer(0)),
        ("ns=2;s=SawMill/IsWorking".to_string(), TagValue::Boolean(false)),
    ]);
    let tags = TagTable::new(vec![
        tag("pieces_count", "ns=2;s=SawMill/PiecesCount", TagDataType::Integer),
        tag("is_working", "ns=2;s=SawMill/IsWorking", TagDataType::Boolean),
    ])
    .unwrap();
    let session = FieldBusSession::new(
        Arc::new(sim.clone()),
        tags,
        SessionConfig {
            sampling_interval: Duration::from_millis(5),
            ..SessionConfig::default()
        },
    );

    let mut pieces = session.observe("pieces_count");
    session.connect().await.unwrap();

    // Wait for the subscription's initial-value delivery before mutating,
    // so the first sampling tick sees 0 rather than an already-updated value.
    let mut seen = Vec::new();
    let initial = timeout(Duration::from_secs(2), pieces.recv())
        .await
        .expect("timed out waiting for initial value")
        .expect("observer channel closed");
    seen.push(initial.value.as_i64().unwrap());

    for count in 1..=5 {
        sim.set("ns=2;s=SawMill/PiecesCount", TagValue::Integer(count));
        // Let a sampling tick pass so each value is seen distinctly.
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    while seen.len() < 6 {
        let update = timeout(Duration::from_secs(2), pieces.recv())
            .await
            .expect("timed out waiting for update")
            .expect("observer channel closed");
        seen.push(update.value.as_i64().unwrap());
    }

    // Initial value plus the five increments, in production order.
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(session.snapshot().int_tag("pieces_count"), 5);
}

/// Full broker round-trip: a status message published from a live session
/// snapshot arrives on the status topic, and a control payload published
/// to the control topic parses into a typed command.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_status_and_control_roundtrip() {
    if std::env::var("SAWBRIDGE_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set SAWBRIDGE_INTEGRATION=1 to run");
        return;
    }

    let broker = std::env::var("SAWBRIDGE_MQTT_BROKER")
        .unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let (host, port) = parse_mqtt_url(&broker);

    let scheme = TopicScheme::new("integration");

    let mut sub_opts = MqttOptions::new(format!("sub-{}", Uuid::new_v4()), host.clone(), port);
    sub_opts.set_keep_alive(Duration::from_secs(5));
    let (sub_client, mut sub_eventloop) = AsyncClient::new(sub_opts, 10);
    sub_client
        .subscribe(scheme.machine_wildcard(), QoS::AtLeastOnce)
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel();
    let status_topic = scheme.status();
    let control_topic = scheme.control();
    tokio::spawn(async move {
        let mut status_payload = None;
        let mut control_payload = None;
        loop {
            match sub_eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic == status_topic {
                        status_payload = Some(publish.payload.to_vec());
                    } else if publish.topic == control_topic {
                        control_payload = Some(publish.payload.to_vec());
                    }
                    if let (Some(status), Some(control)) =
                        (status_payload.clone(), control_payload.clone())
                    {
                        let _ = tx.send((status, control));
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    let mut pub_opts = MqttOptions::new(format!("pub-{}", Uuid::new_v4()), host, port);
    pub_opts.set_keep_alive(Duration::from_secs(5));
    let (pub_client, pub_eventloop) = AsyncClient::new(pub_opts, 10);
    tokio::spawn(spawn_eventloop(pub_eventloop));

    tokio::time::sleep(Duration::from_millis(200)).await;

    // Build a status message from a live simulator-backed session.
    let sim = SimFieldClient::with_values([(
        "ns=2;s=SawMill/CuttingSpeed".to_string(),
        TagValue::Float(4.5),
    )]);
    let tags = TagTable::new(vec![tag(
        "cutting_speed",
        "ns=2;s=SawMill/CuttingSpeed",
        TagDataType::Float,
    )])
    .unwrap();
    let session = FieldBusSession::new(
        Arc::new(sim),
        tags,
        SessionConfig {
            sampling_interval: Duration::from_millis(5),
            ..SessionConfig::default()
        },
    );
    session.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = StatusMessage::from_snapshot(&session.snapshot(), chrono::Utc::now());
    pub_client
        .publish(scheme.status(), QoS::AtLeastOnce, false, status.to_json().unwrap())
        .await
        .unwrap();
    pub_client
        .publish(
            scheme.control(),
            QoS::AtLeastOnce,
            false,
            br#"{"command": "start"}"#.to_vec(),
        )
        .await
        .unwrap();

    let (status_payload, control_payload) = timeout(Duration::from_secs(5), rx)
        .await
        .expect("timeout waiting for MQTT messages")
        .expect("subscriber dropped");

    let decoded: serde_json::Value = serde_json::from_slice(&status_payload).unwrap();
    assert_eq!(decoded["cuttingSpeed"], serde_json::json!(4.5));

    let command = ControlMessage::parse(&control_payload).unwrap();
    assert_eq!(command, sawbridge_core::Command::Start);
}
