//! Drivers talking to each other through the emulated channel over real TCP.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use seabridge_core::{CbrHeader, ConverterFields, FieldWidths, MacFrameType, MacHeader, NodeAddr, Packet, PacketCodec, PacketType};
use seabridge_gateway::{ChannelConfig, ChannelEmulator};
use seabridge_modem::{AbortReason, Evologics, ModemConfig, ModemDriver, ModemHandle, PhyNotification, TcpConnector};
use tokio::net::TcpListener;
use tokio::time::timeout;

const PATIENCE: Duration = Duration::from_secs(10);

fn channel(packet_loss: f32) -> ChannelConfig {
    ChannelConfig {
        bitrate_bps: 100_000,
        packet_loss,
        latency: Duration::from_millis(20),
        latency_jitter: Duration::ZERO,
        bursty_loss: false,
        ..Default::default()
    }
}

async fn start(config: ChannelConfig) -> (Arc<ChannelEmulator>, String) {
    let emulator = ChannelEmulator::start(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(emulator.clone().serve_modems(listener));
    (emulator, addr)
}

async fn node(address: NodeAddr, gateway: &str) -> ModemHandle {
    let mut codec = PacketCodec::standard(FieldWidths::default(), ConverterFields::default()).unwrap();
    codec.wire_type_id(PacketType::CBR).unwrap();
    let config = ModemConfig {
        address,
        tx_power: Some(1),
        bitrate_bps: 100_000,
        tx_guard: Duration::from_millis(5),
        delivery_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let driver = ModemDriver::new(config, Evologics, codec).unwrap();
    let mut handle = ModemHandle::spawn(driver, Arc::new(TcpConnector::new(gateway)));
    assert_eq!(next(&mut handle).await, PhyNotification::Ready);
    handle
}

async fn next(handle: &mut ModemHandle) -> PhyNotification {
    timeout(PATIENCE, handle.next_notification())
        .await
        .expect("no notification in time")
        .expect("driver stopped")
}

fn packet(src: NodeAddr, dst: NodeAddr, seq: u64) -> Packet {
    Packet::new(PacketType::CBR)
        .with_mac(MacHeader {
            frame_type: MacFrameType::Data,
            subtype: 0,
            src,
            dst,
            packet_id: None,
            tx_time: None,
        })
        .with_cbr(CbrHeader {
            seq,
            rftt: None,
            payload: Some(Bytes::from_static(b"ping")),
        })
}

#[tokio::test]
async fn packet_crosses_the_channel() {
    let (emulator, addr) = start(channel(0.0)).await;
    let mut a = node(1, &addr).await;
    let mut b = node(2, &addr).await;
    assert_eq!(emulator.nodes().await, vec![1, 2]);

    a.send(packet(1, 2, 7)).await.unwrap();
    match next(&mut a).await {
        PhyNotification::TxCompleted { attempts, .. } => assert_eq!(attempts, 1),
        other => panic!("unexpected {other:?}"),
    }
    match next(&mut b).await {
        PhyNotification::PacketReceived(p) => {
            assert!(!p.is_erroneous());
            assert_eq!(p.cbr, packet(1, 2, 7).cbr);
        }
        other => panic!("unexpected {other:?}"),
    }

    a.request_range(2).await.unwrap();
    match next(&mut a).await {
        PhyNotification::RangeMeasured { peer, propagation } => {
            assert_eq!(peer, 2);
            assert!(propagation >= Duration::from_millis(19) && propagation <= Duration::from_millis(21));
        }
        other => panic!("unexpected {other:?}"),
    }

    let stats = emulator.stats().await;
    assert_eq!(stats.frames_carried, 1);
    assert_eq!(stats.deliveries_confirmed, 1);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn lost_frames_exhaust_the_retries() {
    let (emulator, addr) = start(channel(1.0)).await;
    let mut a = node(1, &addr).await;
    let mut b = node(2, &addr).await;

    a.send(packet(1, 2, 1)).await.unwrap();
    match next(&mut a).await {
        PhyNotification::TxAborted { reason, .. } => {
            assert_eq!(reason, AbortReason::DeliveryFailed { attempts: 3 })
        }
        other => panic!("unexpected {other:?}"),
    }
    // every attempt is heard as a failed reception
    for _ in 0..3 {
        match next(&mut b).await {
            PhyNotification::PacketReceived(p) => assert!(p.is_erroneous()),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(emulator.stats().await.frames_dropped, 3);

    let stats = a.shutdown().await.unwrap();
    assert_eq!(stats.delivery_retries, 2);
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn broadcast_reaches_every_other_node() {
    let (_emulator, addr) = start(channel(0.0)).await;
    let mut a = node(1, &addr).await;
    let mut b = node(2, &addr).await;
    let mut c = node(3, &addr).await;

    let broadcast = FieldWidths::default().broadcast_address();
    a.send(packet(1, broadcast, 3)).await.unwrap();
    assert!(matches!(next(&mut a).await, PhyNotification::TxCompleted { .. }));
    for peer in [&mut b, &mut c] {
        match next(peer).await {
            PhyNotification::PacketReceived(p) => assert_eq!(p.mac_dst(), Some(broadcast)),
            other => panic!("unexpected {other:?}"),
        }
    }

    for handle in [a, b, c] {
        handle.shutdown().await.unwrap();
    }
}
