mod common;

use std::time::Duration;

use common::{AckBehavior, FF02_CHAR, FakeGatt, GattScript, LinkBehavior, printer_service};
use crab_link::gatt::{CharProps, GattCharacteristic, GattService, WriteKind};
use crab_link::{Connection, GattConfig, GattPhase, GattTransport, PrintError, TransportKind, WriteTypePolicy};
use tokio::time::Instant;
use uuid::Uuid;

fn script(props: CharProps) -> GattScript {
    GattScript {
        services: printer_service(props),
        ..GattScript::default()
    }
}

fn transport(fake: &FakeGatt) -> GattTransport<FakeGatt> {
    GattTransport::new(fake.clone())
}

fn lengths(fake: &FakeGatt) -> Vec<usize> {
    fake.payloads().iter().map(Vec::len).collect()
}

#[tokio::test(start_paused = true)]
async fn test_connect_negotiates_mtu_and_selects_characteristic() {
    let fake = FakeGatt::new(script(CharProps::WRITE | CharProps::WRITE_WITHOUT_RESPONSE));
    let mut conn = transport(&fake);
    assert_eq!(conn.phase(), GattPhase::Disconnected);

    conn.connect().await.unwrap();

    assert!(conn.is_connected());
    assert_eq!(conn.kind(), TransportKind::Ble);
    assert_eq!(conn.phase(), GattPhase::Ready);
    assert_eq!(conn.negotiated_mtu(), Some(185));
    assert_eq!(conn.pacing().chunk_size, 182);
    assert_eq!(conn.characteristic().map(|c| c.uuid), Some(FF02_CHAR));
    assert!(!conn.can_read());
    assert_eq!(fake.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_without_mtu_answer_uses_minimum_chunk() {
    let fake = FakeGatt::new(GattScript {
        mtu_reply: None,
        ..script(CharProps::WRITE_WITHOUT_RESPONSE)
    });
    let mut conn = transport(&fake);
    conn.connect().await.unwrap();

    assert_eq!(conn.pacing().chunk_size, 20);
    conn.write(&[0x55; 45]);
    conn.send(Duration::ZERO).await.unwrap();
    assert_eq!(lengths(&fake), vec![20, 20, 5]);
}

#[tokio::test(start_paused = true)]
async fn test_send_chunks_to_mtu_with_gap() {
    let fake = FakeGatt::new(script(CharProps::WRITE | CharProps::WRITE_WITHOUT_RESPONSE));
    let mut conn = transport(&fake);
    conn.connect().await.unwrap();

    let payload: Vec<u8> = (0..400u16).map(|i| i as u8).collect();
    conn.write(&payload);
    let start = Instant::now();
    conn.send(Duration::ZERO).await.unwrap();

    assert_eq!(lengths(&fake), vec![182, 182, 36]);
    assert_eq!(fake.payloads().concat(), payload);

    let writes = fake.writes();
    assert!(writes.iter().all(|(_, kind, _)| *kind == WriteKind::WithoutResponse));
    for pair in writes.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(50));
    }
    // two gaps + 400 bytes at 2 bytes/ms
    assert!(start.elapsed() >= Duration::from_millis(100 + 200));
    assert_eq!(conn.phase(), GattPhase::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_gap_never_below_minimum() {
    let fake = FakeGatt::new(GattScript {
        mtu_reply: None,
        ..script(CharProps::WRITE_WITHOUT_RESPONSE)
    });
    let mut conn = transport(&fake).with_pacing(crab_link::Pacing::ble().with_chunk_delay(Duration::ZERO));
    conn.connect().await.unwrap();

    conn.write(&[0u8; 40]);
    conn.send(Duration::ZERO).await.unwrap();

    let writes = fake.writes();
    assert_eq!(writes.len(), 2);
    assert!(writes[1].0 - writes[0].0 >= Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn test_no_writable_characteristic() {
    let fake = FakeGatt::new(script(CharProps::READ | CharProps::NOTIFY));
    let mut conn = transport(&fake);

    let err = conn.connect().await.unwrap_err();
    match err {
        PrintError::Connection(msg) => assert!(msg.contains("No compatible print service"), "{msg}"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!conn.is_connected());
    assert_eq!(conn.phase(), GattPhase::Disconnected);
    assert_eq!(fake.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_service_writable_characteristic_is_used() {
    let service = Uuid::from_u128(0x0000ABCD_0000_1000_8000_00805F9B34FB);
    let characteristic = Uuid::from_u128(0x12345678_0000_1000_8000_00805F9B34FB);
    let fake = FakeGatt::new(GattScript {
        services: vec![GattService {
            uuid: service,
            characteristics: vec![GattCharacteristic {
                uuid: characteristic,
                service_uuid: service,
                properties: CharProps::WRITE,
            }],
        }],
        ..GattScript::default()
    });
    let mut conn = transport(&fake);

    conn.connect().await.unwrap();
    assert_eq!(conn.characteristic().map(|c| c.uuid), Some(characteristic));
}

#[tokio::test(start_paused = true)]
async fn test_link_timeout() {
    let fake = FakeGatt::new(GattScript {
        link: LinkBehavior::Silent,
        ..script(CharProps::WRITE)
    });
    let mut conn = transport(&fake);

    let start = Instant::now();
    let err = conn.connect().await.unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert!(err.to_string().contains("BLE connection timeout"));
    assert!(start.elapsed() >= Duration::from_secs(10));
    assert_eq!(conn.phase(), GattPhase::Disconnected);
    assert_eq!(fake.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_link_timeout_covers_blocking_open() {
    let fake = FakeGatt::new(GattScript {
        link: LinkBehavior::Hangs,
        ..script(CharProps::WRITE)
    });
    let mut conn = transport(&fake);

    let start = Instant::now();
    let err = conn.connect().await.unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert!(err.to_string().contains("BLE connection timeout"));
    // one deadline for the call and the rendezvous
    assert!(start.elapsed() >= Duration::from_secs(10));
    assert!(start.elapsed() < Duration::from_secs(11));
    assert_eq!(conn.phase(), GattPhase::Disconnected);
    assert_eq!(fake.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_timeout() {
    let fake = FakeGatt::new(GattScript {
        discovery_answers: false,
        ..script(CharProps::WRITE)
    });
    let config = GattConfig {
        discovery_timeout: Duration::from_secs(3),
        ..GattConfig::default()
    };
    let mut conn = transport(&fake).with_config(config);

    let err = conn.connect().await.unwrap_err();
    assert!(err.to_string().contains("BLE service discovery timeout"), "{err}");
    assert!(!conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_refused_link() {
    let fake = FakeGatt::new(GattScript {
        link: LinkBehavior::Refuses,
        ..script(CharProps::WRITE)
    });
    let mut conn = transport(&fake);

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, PrintError::Connection(_)), "{err:?}");
    assert_eq!(conn.phase(), GattPhase::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_releases_pending_connect() {
    let fake = FakeGatt::new(GattScript {
        link: LinkBehavior::Silent,
        ..script(CharProps::WRITE)
    });
    let mut conn = transport(&fake);
    let signal = conn.disconnect_signal();

    let connecting = tokio::spawn(async move {
        let result = conn.connect().await;
        (conn, result)
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    let start = Instant::now();
    signal.trigger();

    let (conn, result) = connecting.await.unwrap();
    assert!(matches!(result, Err(PrintError::Cancelled)), "{result:?}");
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(!conn.is_connected());
    assert_eq!(fake.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_twice_closes_once() {
    let fake = FakeGatt::new(script(CharProps::WRITE_WITHOUT_RESPONSE));
    let mut conn = transport(&fake);
    conn.connect().await.unwrap();
    conn.write(b"pending");

    conn.disconnect().await;
    conn.disconnect().await;

    assert_eq!(fake.closes(), 1);
    assert!(conn.batch().is_empty());
    assert_eq!(conn.phase(), GattPhase::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_opportunistic_falls_back_to_write_request() {
    let fake = FakeGatt::new(GattScript {
        reject_write_commands: true,
        ..script(CharProps::WRITE)
    });
    let mut conn = transport(&fake);
    conn.connect().await.unwrap();

    conn.write(b"hello");
    conn.send(Duration::ZERO).await.unwrap();

    let writes = fake.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1, WriteKind::WithResponse);
    assert_eq!(writes[0].2, b"hello");
}

#[tokio::test(start_paused = true)]
async fn test_opportunistic_uses_write_command_when_accepted() {
    let fake = FakeGatt::new(script(CharProps::WRITE));
    let mut conn = transport(&fake);
    conn.connect().await.unwrap();

    conn.write(b"hello");
    conn.send(Duration::ZERO).await.unwrap();
    assert_eq!(fake.writes()[0].1, WriteKind::WithoutResponse);
}

#[tokio::test(start_paused = true)]
async fn test_strict_policy_uses_write_request() {
    let fake = FakeGatt::new(script(CharProps::WRITE));
    let config = GattConfig {
        write_policy: WriteTypePolicy::Strict,
        ..GattConfig::default()
    };
    let mut conn = transport(&fake).with_config(config);
    conn.connect().await.unwrap();

    conn.write(b"hello");
    conn.send(Duration::ZERO).await.unwrap();
    assert_eq!(fake.writes()[0].1, WriteKind::WithResponse);
}

#[tokio::test(start_paused = true)]
async fn test_missing_write_response_is_soft() {
    let fake = FakeGatt::new(GattScript {
        ack: AckBehavior::Silent,
        ..script(CharProps::WRITE)
    });
    let config = GattConfig {
        write_policy: WriteTypePolicy::Strict,
        ..GattConfig::default()
    };
    let mut conn = transport(&fake).with_config(config);
    conn.connect().await.unwrap();

    conn.write(b"still printed");
    let start = Instant::now();
    conn.send(Duration::ZERO).await.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(conn.batch().is_empty());
    assert!(conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_blocked_write_request_is_soft() {
    let fake = FakeGatt::new(GattScript {
        ack: AckBehavior::Hangs,
        ..script(CharProps::WRITE)
    });
    let config = GattConfig {
        write_policy: WriteTypePolicy::Strict,
        ..GattConfig::default()
    };
    let mut conn = transport(&fake).with_config(config);
    conn.connect().await.unwrap();

    conn.write(&[0u8; 300]);
    let start = Instant::now();
    conn.send(Duration::ZERO).await.unwrap();

    assert_eq!(lengths(&fake), vec![182, 118]);
    assert!(start.elapsed() >= Duration::from_secs(4));
    assert!(start.elapsed() < Duration::from_secs(6));
    assert!(conn.batch().is_empty());
    assert!(conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_response_does_not_abort() {
    let fake = FakeGatt::new(GattScript {
        ack: AckBehavior::Nack,
        ..script(CharProps::WRITE)
    });
    let config = GattConfig {
        write_policy: WriteTypePolicy::Strict,
        ..GattConfig::default()
    };
    let mut conn = transport(&fake).with_config(config);
    conn.connect().await.unwrap();

    conn.write(&[0u8; 300]);
    conn.send(Duration::ZERO).await.unwrap();
    assert_eq!(lengths(&fake), vec![182, 118]);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_marks_disconnected() {
    let fake = FakeGatt::new(script(CharProps::WRITE_WITHOUT_RESPONSE));
    let mut conn = transport(&fake);
    conn.connect().await.unwrap();

    fake.drop_link();
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert!(!conn.is_connected());
    assert_eq!(conn.phase(), GattPhase::Disconnected);

    conn.write(b"kept");
    assert!(matches!(conn.send(Duration::ZERO).await, Err(PrintError::NotConnected)));
    assert_eq!(conn.batch().pending(), b"kept");

    // reconnect tears the stale session down first
    conn.connect().await.unwrap();
    assert!(conn.is_connected());
    assert_eq!(fake.opens(), 2);
    assert_eq!(fake.closes(), 1);
}
