//! Minimal two-process demo: run once with `--server`, once with `--client <server-addr>`,
//! and watch a handful of video frames cross the wire.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use rstream_transport::{NackBufferConfig, RingBufferConfig, StreamKind, Transport, TransportConfig};

#[derive(Parser, Debug)]
#[command(name = "rstream-demo", about = "Demo driver for the reliable-over-UDP media transport")]
struct Args {
    /// Local address to bind.
    #[arg(long, default_value = "0.0.0.0:9400")]
    bind: SocketAddr,

    /// Run as the server (waits for a CONNECTION_ATTEMPT).
    #[arg(long, conflicts_with = "peer")]
    server: bool,

    /// Run as the client, connecting to this peer address.
    #[arg(long)]
    peer: Option<SocketAddr>,

    /// Number of demo video frames to send (client only).
    #[arg(long, default_value_t = 60)]
    frames: u32,

    /// Shared AES-128 key, as 32 hex characters. Demo-only; production deployments exchange
    /// this out of band.
    #[arg(long, default_value = "000102030405060708090a0b0c0d0e0f")]
    key_hex: String,
}

fn parse_key(hex: &str) -> [u8; 16] {
    let mut key = [0u8; 16];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).expect("key must be 32 hex characters");
    }
    key
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if !args.server && args.peer.is_none() {
        eprintln!("one of --server or --peer <addr> is required");
        std::process::exit(2);
    }

    let mut config = TransportConfig::new(args.bind, parse_key(&args.key_hex), args.server);
    config.peer_addr = args.peer;
    config.connect_timeout = Duration::from_secs(30);

    info!(bind = %args.bind, server = args.server, "starting transport");
    let transport = Transport::create(config).expect("handshake failed");
    info!("connected");

    if args.server {
        transport.register_nack_buffer(StreamKind::Video, NackBufferConfig::default());
        run_server(&transport);
    } else {
        transport.register_ring_buffer(StreamKind::Video, RingBufferConfig::default());
        run_client(&transport, args.frames);
    }
}

fn run_server(transport: &Transport) {
    let mut frame_id = 1u32;
    loop {
        if !transport.poll() {
            info!("connection lost, exiting");
            return;
        }
        let payload: Vec<u8> = (0..20_000).map(|i| (i & 0xff) as u8).collect();
        if let Err(e) = transport.send_frame(StreamKind::Video, &payload, frame_id, false) {
            info!("send_frame failed: {e}");
        }
        frame_id = frame_id.wrapping_add(1);
        std::thread::sleep(Duration::from_millis(16));
    }
}

fn run_client(transport: &Transport, frames: u32) {
    let mut received = 0u32;
    while received < frames {
        if !transport.poll() {
            info!("connection lost, exiting");
            return;
        }
        while let Some(frame) = transport.next_frame(StreamKind::Video) {
            received += 1;
            info!(frame_id = frame.frame_id, bytes = frame.bytes.len(), "received frame");
        }
        if let Some(reset_at) = transport.pending_stream_reset(StreamKind::Video) {
            info!(reset_at, "stream reset pending");
        }
    }
    info!(received, "demo complete");
}
