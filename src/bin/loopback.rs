//! Loopback demo
//!
//! Runs an H.264 talker and a listener in one process. The talker's
//! packets go through an in-process channel instead of a NIC; the
//! listener rebuilds RTP packets for a reader thread. A JSON report of
//! all diagnostics is printed at the end.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use avb_video_transport::{
    buffer::{BufferStats, ReadStatus, VideoDesc},
    clock::{ClockDiagnostics, ClockDomain, ClockSources, ClockSyncConfig, ClockSyncEngine, NetworkTime},
    config::ConfigRegistry,
    constants::*,
    packet::{
        avtp::{avtp_view, stream_id_of, RTP_HEADER_SIZE},
        MacAddress, Packet, PoolStats, StreamId,
    },
    stream::{
        AvbVideoStream, ChannelSink, Direction, LocalVideoStream, ReceiveParams, SrClass, StreamDiagnostics,
        StreamEnvironment, StreamState, TransmitParams, TransmitWorker, VideoFormat,
    },
};

const DURATION_KEY: &str = "loopback.duration.ms";
const DEFAULT_DURATION_MS: u64 = 2000;

const PACKET_RATE: u32 = 4000;
const PAYLOAD_SIZE: usize = 1000;
const PACKETS_PER_FRAME: u16 = 8;
/// 90 kHz RTP clock at 30 frames per second
const RTP_TICKS_PER_FRAME: u32 = 3000;
/// Packets queued before the worker starts
const PREFILL: u16 = 16;

#[derive(Serialize)]
struct Report {
    generated_at: DateTime<Utc>,
    packets_sent: u64,
    delivered_units: u64,
    delivered_bytes: u64,
    listener_state: StreamState,
    talker: StreamDiagnostics,
    listener: StreamDiagnostics,
    talker_buffer: BufferStats,
    listener_buffer: BufferStats,
    pool: Option<PoolStats>,
    clock: ClockDiagnostics,
}

/// Synthetic H.264 source producing RTP packets
struct RtpSource {
    sequence: u16,
    timestamp: u32,
    payload: Vec<u8>,
    packet: Vec<u8>,
}

impl RtpSource {
    fn new() -> Self {
        Self {
            sequence: 1,
            timestamp: 0,
            payload: (0..PAYLOAD_SIZE).map(|i| i as u8).collect(),
            packet: Vec::with_capacity(RTP_HEADER_SIZE + PAYLOAD_SIZE),
        }
    }

    fn next_packet(&mut self) -> &[u8] {
        let last_of_frame = self.sequence % PACKETS_PER_FRAME == 0;
        let mpt = if last_of_frame { 0xE0 } else { 0x60 };

        self.packet.clear();
        self.packet.extend_from_slice(&[0x80, mpt]);
        self.packet.extend_from_slice(&self.sequence.to_be_bytes());
        self.packet.extend_from_slice(&self.timestamp.to_be_bytes());
        self.packet.extend_from_slice(&0u32.to_be_bytes());
        self.packet.extend_from_slice(&self.payload);

        self.sequence = self.sequence.wrapping_add(1);
        if last_of_frame {
            self.timestamp = self.timestamp.wrapping_add(RTP_TICKS_PER_FRAME);
        }
        &self.packet
    }
}

fn load_config() -> Result<ConfigRegistry> {
    let path = match std::env::args().nth(1) {
        Some(arg) => Some(PathBuf::from(arg)),
        None => directories::ProjectDirs::from("org", "avb", "avb-video-transport")
            .map(|dirs| dirs.config_dir().join("loopback.toml"))
            .filter(|path| path.exists()),
    };

    match path {
        Some(path) => ConfigRegistry::load(&path).with_context(|| format!("loading {}", path.display())),
        None => {
            tracing::info!("No configuration file, using defaults");
            Ok(ConfigRegistry::new())
        }
    }
}

/// Feed received frames to the listener and drain its local stream
fn run_listener(
    packets: Receiver<Packet>,
    listener: Arc<AvbVideoStream>,
    local: Arc<LocalVideoStream>,
    clock: Arc<dyn NetworkTime>,
) -> (u64, u64) {
    let mut units = 0u64;
    let mut bytes = 0u64;
    let mut dest = vec![0u8; MAX_LOCAL_PACKET_SIZE + RTP_HEADER_SIZE];
    let mut desc = VideoDesc::default();
    let timeout = Duration::from_millis(RECEIVE_TIMEOUT_MS);

    loop {
        match packets.recv_timeout(timeout) {
            Ok(packet) => {
                let Some(avtp) = avtp_view(packet.frame()) else {
                    continue;
                };
                if stream_id_of(avtp) != Some(listener.stream_id()) {
                    continue;
                }
                // a real NIC holds the frame until its launch time
                let now = clock.approximate_time().max(packet.attime());
                listener.dispatch_packet(avtp, now);
            }
            Err(RecvTimeoutError::Timeout) => listener.on_packet_received(None),
            Err(RecvTimeoutError::Disconnected) => break,
        }

        loop {
            match local.read(&mut dest, &mut desc) {
                Ok(ReadStatus::Data(n)) => {
                    units += 1;
                    bytes += n as u64;
                }
                Ok(ReadStatus::Empty | ReadStatus::NoData) => break,
                Err(e) => {
                    tracing::error!("Listener read failed: {}", e);
                    break;
                }
            }
        }
    }

    (units, bytes)
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting AVB video loopback");

    let config = Arc::new(load_config()?);
    let duration = Duration::from_millis(config.get_u64(DURATION_KEY).unwrap_or(DEFAULT_DURATION_MS));

    let sync_config = ClockSyncConfig::from_registry(&config);
    let sources = ClockSources::for_config(&sync_config);
    let clock = Arc::new(ClockSyncEngine::new(sync_config, sources)?);
    let network_time: Arc<dyn NetworkTime> = clock.clone();

    let source_mac = MacAddress([0x02, 0x00, 0x5e, 0x10, 0x00, 0x01]);
    let env = StreamEnvironment::new(network_time.clone(), Arc::new(source_mac), config.clone());
    let stream_id = StreamId::from_mac(source_mac, 1);

    // Talker side
    let talker = Arc::new(AvbVideoStream::transmit(
        &env,
        TransmitParams {
            class: SrClass::Low,
            format: VideoFormat::Rtp,
            max_packet_rate: PACKET_RATE,
            max_packet_size: PAYLOAD_SIZE,
            stream_id,
            pool_size: DEFAULT_POOL_SIZE,
            dmac: MacAddress::AVTP_MULTICAST,
        },
        Arc::new(ClockDomain::ptp()),
    )?);
    let talker_local = Arc::new(LocalVideoStream::new(
        1,
        Direction::TransmitToNetwork,
        VideoFormat::Rtp,
        DEFAULT_RING_SIZE,
        PACKET_RATE,
        PAYLOAD_SIZE,
    )?);
    talker.connect_to(Some(talker_local.clone()))?;
    talker.activate(false);

    // Listener side
    let listener = Arc::new(AvbVideoStream::receive(
        &env,
        ReceiveParams {
            class: SrClass::Low,
            format: VideoFormat::Rtp,
            max_packet_rate: PACKET_RATE,
            max_packet_size: PAYLOAD_SIZE,
            stream_id,
            dmac: MacAddress::AVTP_MULTICAST,
        },
    )?);
    let listener_local = Arc::new(LocalVideoStream::new(
        2,
        Direction::ReceiveFromNetwork,
        VideoFormat::Rtp,
        DEFAULT_RING_SIZE,
        PACKET_RATE,
        PAYLOAD_SIZE,
    )?);
    listener.connect_to(Some(listener_local.clone()))?;
    listener.activate(false);

    let mut source = RtpSource::new();
    for _ in 0..PREFILL {
        talker_local.write_rtp(source.next_packet())?;
    }

    let (sink, packets) = ChannelSink::bounded(DEFAULT_POOL_SIZE);
    let mut worker = TransmitWorker::start(talker.clone(), network_time.clone(), sink)?;

    let receiver = {
        let listener = listener.clone();
        let local = listener_local.clone();
        let clock = network_time.clone();
        thread::Builder::new()
            .name("avb-rx-loopback".into())
            .spawn(move || run_listener(packets, listener, local, clock))?
    };

    tracing::info!(stream_id = %stream_id, ?duration, "Streaming");

    // Application writer: keep up with the packet rate on average
    let start = Instant::now();
    let mut written = u64::from(PREFILL);
    while start.elapsed() < duration {
        let due = start.elapsed().as_micros() as u64 * u64::from(PACKET_RATE) / 1_000_000 + u64::from(PREFILL);
        while written < due {
            talker_local.write_rtp(source.next_packet())?;
            written += 1;
        }
        thread::sleep(Duration::from_millis(1));
    }

    worker.stop();
    let (delivered_units, delivered_bytes) = receiver
        .join()
        .map_err(|_| anyhow::anyhow!("listener thread panicked"))?;

    let report = Report {
        generated_at: Utc::now(),
        packets_sent: worker.packets_sent(),
        delivered_units,
        delivered_bytes,
        listener_state: listener.state(),
        talker: talker.diagnostics(),
        listener: listener.diagnostics(),
        talker_buffer: talker_local.buffer().stats(),
        listener_buffer: listener_local.buffer().stats(),
        pool: talker.packet_pool().map(|pool| pool.stats()),
        clock: clock.diagnostics(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    tracing::info!("Loopback finished");
    Ok(())
}
