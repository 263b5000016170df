//! HTTP status page.

use std::fmt::Write;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};

use crate::{ChannelEmulator, ChannelStats};

pub fn router(emulator: Arc<ChannelEmulator>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/stats", get(stats_handler))
        .with_state(emulator)
}

async fn stats_handler(State(emulator): State<Arc<ChannelEmulator>>) -> Json<ChannelStats> {
    Json(emulator.stats().await)
}

async fn root_handler(State(emulator): State<Arc<ChannelEmulator>>) -> Html<String> {
    let stats = emulator.stats().await;
    let config = emulator.config();
    let mut nodes = String::new();
    for (addr, peer) in emulator.peers().await {
        let _ = writeln!(nodes, "  <span class=\"metric\">{addr:>5}</span> <span class=\"dim\">{peer}</span>");
    }
    let html = format!(
        r#"
        <html>
        <head>
            <title>SeaBridge Channel Emulator</title>
            <style>
                body {{ font-family: monospace; background: #06121f; color: #7fdbff; padding: 20px; }}
                pre {{ font-size: 14px; line-height: 1.6; }}
                .header {{ color: #ffdc00; font-weight: bold; }}
                .metric {{ color: #7fdbff; }}
                .dim {{ color: #5a6b7b; }}
            </style>
        </head>
        <body>
        <pre class="header">SeaBridge Channel Emulator</pre>
        <pre>
<span class="dim">Bitrate:</span>          <span class="metric">{} bps</span>
<span class="dim">Propagation:</span>      <span class="metric">{:?} ± {:?}</span>
<span class="dim">Base loss:</span>        <span class="metric">{:.1}%{}</span>

<span class="dim">Connected Nodes:</span>  <span class="metric">{}</span>
<span class="dim">Queued Frames:</span>    <span class="metric">{}</span>
<span class="dim">Frames Carried:</span>   <span class="metric">{}</span> <span class="dim">({} bytes)</span>
<span class="dim">Frames Dropped:</span>   <span class="metric">{}</span>
<span class="dim">Delivered (ack):</span>  <span class="metric">{}</span>
<span class="dim">Overflowed:</span>       <span class="metric">{}</span>

<span class="dim">Nodes:</span>
{}</pre>
        </body>
        </html>
        "#,
        config.bitrate_bps,
        config.latency,
        config.latency_jitter,
        config.packet_loss * 100.0,
        if config.bursty_loss { " (bursty)" } else { "" },
        stats.connected_nodes,
        stats.queued_frames,
        stats.frames_carried,
        stats.bytes_carried,
        stats.frames_dropped,
        stats.deliveries_confirmed,
        stats.frames_overflowed,
        nodes,
    );
    Html(html)
}
