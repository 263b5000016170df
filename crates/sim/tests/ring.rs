use std::time::Duration;

use seabridge_gateway::ChannelConfig;
use seabridge_sim::scenarios::{cbr_exchange, Scenario};

fn fast_channel(packet_loss: f32) -> ChannelConfig {
    ChannelConfig {
        bitrate_bps: 100_000,
        packet_loss,
        latency: Duration::from_millis(10),
        latency_jitter: Duration::ZERO,
        bursty_loss: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn lossless_ring_delivers_everything() {
    let scenario = Scenario {
        nodes: 3,
        packets_per_node: 3,
        payload_bytes: 8,
        progress: false,
        ..Default::default()
    };
    let report = cbr_exchange(fast_channel(0.0), &scenario).await.unwrap();

    assert_eq!(report.nodes.len(), 3);
    assert_eq!(report.sent(), 9);
    assert_eq!(report.delivery_ratio(), 1.0);
    assert_eq!(report.mean_attempts(), 1.0);
    assert_eq!(report.channel.frames_carried, 9);
    for node in &report.nodes {
        assert_eq!(node.received, 3, "node {}", node.address);
        assert_eq!(node.rx_errors, 0);
        assert_eq!(node.driver.tx_completed, 3);
        let range = node.range_m.expect("range measured");
        assert!((range - 15.0).abs() < 1.5, "{range}");
    }
}

#[tokio::test]
async fn dead_channel_delivers_nothing() {
    let scenario = Scenario {
        nodes: 2,
        packets_per_node: 2,
        payload_bytes: 4,
        range_after: false,
        progress: false,
        ..Default::default()
    };
    let report = cbr_exchange(fast_channel(1.0), &scenario).await.unwrap();

    assert_eq!(report.delivered(), 0);
    // three attempts per packet, each one heard as a failed reception
    assert_eq!(report.mean_attempts(), 3.0);
    assert_eq!(report.channel.frames_dropped, 12);
    assert!(report.nodes.iter().all(|n| n.received == 0 && n.rx_errors == 6));
}
