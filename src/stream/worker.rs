//! Transmit worker
//!
//! Drives a talker on its own OS thread: packets are prepared as soon as
//! their launch time comes within [`LAUNCH_WINDOW`] and handed to a
//! [`PacketSink`], which stands in for the network interface.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use super::video::AvbVideoStream;
use crate::clock::NetworkTime;
use crate::error::Result;
use crate::packet::Packet;

/// How far ahead of its launch time a packet is handed out
pub const LAUNCH_WINDOW: Duration = Duration::from_millis(2);

/// Longest single sleep, so a stop request is seen promptly
const MAX_WAIT: Duration = Duration::from_millis(5);

/// Pause when the talker had nothing at all to send
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Outbound path for finished packets
pub trait PacketSink: Send {
    /// Take one packet; false once the sink is closed for good
    fn send(&mut self, packet: Packet) -> bool;
}

/// In-process sink backed by a bounded channel
pub struct ChannelSink {
    tx: Sender<Packet>,
    dropped: u64,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<Packet>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx, dropped: 0 }, rx)
    }

    /// Packets dropped because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl PacketSink for ChannelSink {
    fn send(&mut self, packet: Packet) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            // the packet goes back to its pool on drop
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                tracing::trace!(dropped = self.dropped, "Packet sink full");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Worker thread feeding one talker into a sink
pub struct TransmitWorker {
    running: Arc<AtomicBool>,
    packets_sent: Arc<AtomicU64>,
    thread_handle: Option<JoinHandle<()>>,
}

impl TransmitWorker {
    /// Spawn the worker thread
    pub fn start<S>(stream: Arc<AvbVideoStream>, clock: Arc<dyn NetworkTime>, mut sink: S) -> Result<Self>
    where
        S: PacketSink + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let packets_sent = Arc::new(AtomicU64::new(0));
        let running_for_loop = Arc::clone(&running);
        let sent = Arc::clone(&packets_sent);
        let stream_id = stream.stream_id();

        let handle = thread::Builder::new()
            .name(format!("avb-tx-{}", stream_id))
            .spawn(move || {
                tracing::info!(stream_id = %stream_id, "Transmit worker started");

                while running_for_loop.load(Ordering::Relaxed) {
                    let Some(packet) = stream.prepare_packet() else {
                        thread::sleep(IDLE_WAIT);
                        continue;
                    };

                    if !wait_for_launch(&running_for_loop, clock.as_ref(), packet.attime()) {
                        break;
                    }
                    if !sink.send(packet) {
                        tracing::warn!(stream_id = %stream_id, "Packet sink closed");
                        break;
                    }
                    sent.fetch_add(1, Ordering::Relaxed);
                }

                running_for_loop.store(false, Ordering::SeqCst);
                tracing::info!(stream_id = %stream_id, "Transmit worker stopped");
            })?;

        Ok(Self {
            running,
            packets_sent,
            thread_handle: Some(handle),
        })
    }

    /// Stop the worker and wait for its thread
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }
}

impl Drop for TransmitWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleep until `attime` is within the launch window; false if stopped meanwhile
fn wait_for_launch(running: &AtomicBool, clock: &dyn NetworkTime, attime: u64) -> bool {
    let window = LAUNCH_WINDOW.as_nanos() as u64;
    loop {
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        let lead = attime.saturating_sub(clock.approximate_time());
        if lead <= window {
            return true;
        }
        thread::sleep(Duration::from_nanos(lead - window).min(MAX_WAIT));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockDomain;
    use crate::config::ConfigRegistry;
    use crate::packet::{MacAddress, StreamId};
    use crate::stream::{
        Direction, LocalVideoStream, SrClass, StreamEnvironment, TransmitParams, VideoFormat,
    };
    use std::time::Instant;

    struct MonotonicClock(Instant);

    impl NetworkTime for MonotonicClock {
        fn approximate_time(&self) -> u64 {
            self.0.elapsed().as_nanos() as u64 + 1
        }

        fn exact_time(&self) -> u64 {
            self.approximate_time()
        }
    }

    fn active_talker(clock: Arc<dyn NetworkTime>) -> Arc<AvbVideoStream> {
        let env = StreamEnvironment::new(
            clock,
            Arc::new(MacAddress([0x02, 0, 0, 0, 0, 0x07])),
            Arc::new(ConfigRegistry::new()),
        );
        let params = TransmitParams {
            class: SrClass::Low,
            format: VideoFormat::Rtp,
            max_packet_rate: 4000,
            max_packet_size: 500,
            stream_id: StreamId(0x77),
            pool_size: 32,
            dmac: MacAddress::AVTP_MULTICAST,
        };
        let stream = Arc::new(AvbVideoStream::transmit(&env, params, Arc::new(ClockDomain::raw())).unwrap());
        let local = Arc::new(LocalVideoStream::new(1, Direction::TransmitToNetwork, VideoFormat::Rtp, 8, 4000, 500).unwrap());
        stream.connect_to(Some(local)).unwrap();
        stream.activate(false);
        stream
    }

    #[test]
    fn test_worker_paces_packets() {
        let clock: Arc<dyn NetworkTime> = Arc::new(MonotonicClock(Instant::now()));
        let stream = active_talker(clock.clone());
        let (sink, rx) = ChannelSink::bounded(64);

        let mut worker = TransmitWorker::start(stream.clone(), clock, sink).unwrap();
        assert!(worker.is_running());

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(first.is_dummy());
        assert_eq!(second.attime() - first.attime(), 250_000);

        worker.stop();
        assert!(!worker.is_running());
        assert!(worker.packets_sent() >= 2);
    }

    #[test]
    fn test_worker_stops_when_sink_closes() {
        let clock: Arc<dyn NetworkTime> = Arc::new(MonotonicClock(Instant::now()));
        let stream = active_talker(clock.clone());
        let (sink, rx) = ChannelSink::bounded(4);
        drop(rx);

        let worker = TransmitWorker::start(stream, clock, sink).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!worker.is_running());
        assert_eq!(worker.packets_sent(), 0);
    }

    #[test]
    fn test_full_sink_drops_packets() {
        let pool = crate::packet::PacketPool::new(64, 4).unwrap();
        let (mut sink, rx) = ChannelSink::bounded(1);

        assert!(sink.send(pool.acquire().unwrap()));
        assert!(sink.send(pool.acquire().unwrap()));
        assert_eq!(sink.dropped(), 1);
        // the dropped packet is back in the pool
        assert_eq!(pool.free_count(), 3);
        drop(rx);
        assert!(!sink.send(pool.acquire().unwrap()));
    }

    #[test]
    fn test_wait_for_launch_honors_stop() {
        let clock = MonotonicClock(Instant::now());
        let running = AtomicBool::new(false);
        assert!(!wait_for_launch(&running, &clock, u64::MAX));

        running.store(true, Ordering::SeqCst);
        assert!(wait_for_launch(&running, &clock, 0));
    }
}
