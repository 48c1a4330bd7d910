//! AVTP engine for compressed video streams
//!
//! An [`AvbVideoStream`] is either a talker or a listener over one
//! shared core:
//!
//! - Talkers pull descriptors from the connected [`LocalVideoStream`],
//!   finalize the AVTP header in place and hand the packet out with its
//!   launch time set. With nothing queued they emit dummy packets so
//!   the reservation keeps flowing.
//! - Listeners validate incoming AVTP packets, follow the sequence
//!   number and only deliver payloads to the local stream once a run of
//!   consecutive good packets has been seen.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;

use super::local::{rtp_header, Direction, LocalVideoStream, VideoFormat, MAX_LOCAL_PACKET_SIZE};
use super::tspec::{SrClass, SrClassParams, TSpec};
use super::StreamEnvironment;
use crate::buffer::{ReadStatus, VideoDesc, VideoUnit};
use crate::clock::{ClockDomain, NetworkTime};
use crate::config::{keys, ConfigRegistry};
use crate::error::{Result, StreamError};
use crate::packet::avtp::{
    self, offset, read_u16, read_u32, write_u16, write_u32, AVTP_HEADER_SIZE, CIP_DATA_BLOCK_SIZE,
    CIP_DBS, CIP_FMT_MPEG_TS, CIP_FN_QPC_SPH, CIP_HEADER_SIZE, CIP_SID, CIP_SPH_BIT, CVF_D5_MARKER_BIT,
    CVF_FLAGS, CVF_FORMAT_RFC, CVF_FORMAT_SUBTYPE_H264, CVF_MARKER_BIT, CVF_PTV_BIT, ETH_HEADER_SIZE,
    H264_TIMESTAMP_SIZE, IEC61883_FLAGS, IEC61883_TAG_BIT, IEC61883_TAG_CHANNEL, IEC61883_TCODE_SY,
    RTP_HEADER_SIZE, SOURCE_PACKET_SIZE, SUBTYPE_CVF, SUBTYPE_IEC61883, TSP_SIZE, TU_BIT, TV_BIT,
};
use crate::packet::{MacAddress, Packet, PacketPool, StreamId};

/// SSRC of the RTP packets rebuilt for receive-side applications
pub const RECEIVE_SSRC: u32 = 0x4120_DB95;

pub const DEFAULT_VALIDATION_THRESHOLD: u32 = 100;

/// Largest H.264 or MPEG-TS payload a talker accepts per packet
pub const MAX_TRANSMIT_PAYLOAD: usize = MAX_LOCAL_PACKET_SIZE - AVTP_HEADER_SIZE - RTP_HEADER_SIZE;

/// Pool packets carry the Ethernet and AVTP headers plus room for the
/// CIP header or the RTP timestamp of the current CVF draft
const POOL_PACKET_OVERHEAD: usize = ETH_HEADER_SIZE + AVTP_HEADER_SIZE + CIP_HEADER_SIZE;

const RTP_MPT_MARKER: u8 = 0xE0;
const RTP_MPT_NO_MARKER: u8 = 0x60;

/// IEEE 1722a draft the CVF header follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Compatibility {
    /// Draft 5: marker in bit 2, format subtype 0
    D5,
    /// Draft 9
    D9,
    /// Draft 14: RTP timestamp in front of the payload, ptv bit
    #[default]
    Current,
}

impl Compatibility {
    /// Map a configuration value; anything unknown selects the current draft
    pub fn from_name(name: &str) -> Self {
        match name {
            "D5_1722a" => Compatibility::D5,
            "D9_1722a" => Compatibility::D9,
            _ => Compatibility::Current,
        }
    }

    /// Per-stream setting first, then the global one
    pub fn resolve(registry: &ConfigRegistry, stream_id: StreamId) -> Self {
        let key = format!("{}.{:x}", keys::COMPATIBILITY_VIDEO_H264, stream_id.0);
        registry
            .get_str(&key)
            .or_else(|| registry.get_str(keys::COMPATIBILITY_VIDEO))
            .map(Self::from_name)
            .unwrap_or_default()
    }

    /// AVTP bytes in front of an H.264 payload
    pub fn cvf_header_len(self) -> usize {
        match self {
            Compatibility::Current => AVTP_HEADER_SIZE + H264_TIMESTAMP_SIZE,
            _ => AVTP_HEADER_SIZE,
        }
    }

    fn marker_bit(self) -> u8 {
        match self {
            Compatibility::D5 => CVF_D5_MARKER_BIT,
            _ => CVF_MARKER_BIT,
        }
    }
}

/// How often received packets are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ValidationMode {
    /// Accept everything
    Never,
    /// Check until the stream is valid, then only follow the sequence
    #[default]
    Once,
    /// Check every packet
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValidationConfig {
    pub mode: ValidationMode,
    /// Consecutive good packets needed before the stream turns valid
    pub threshold: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            mode: ValidationMode::Once,
            threshold: DEFAULT_VALIDATION_THRESHOLD,
        }
    }
}

impl ValidationConfig {
    pub fn from_registry(registry: &ConfigRegistry) -> Self {
        let mut config = Self::default();
        match registry.get_u64(keys::VALIDATION_MODE) {
            Some(0) => config.mode = ValidationMode::Never,
            Some(1) | None => {}
            Some(2) => config.mode = ValidationMode::Always,
            Some(other) => {
                tracing::warn!(value = other, "Unknown receive validation mode, using once");
            }
        }
        if let Some(threshold) = registry.get_u64(keys::VALIDATION_THRESHOLD) {
            config.threshold = threshold.clamp(1, u64::from(u32::MAX)) as u32;
        }
        config
    }
}

/// Externally visible stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StreamState {
    #[default]
    Inactive,
    NoData,
    InvalidData,
    Valid,
}

/// Per-stream counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamDiagnostics {
    pub frames_tx: u64,
    pub dummy_frames_tx: u64,
    pub frames_rx: u64,
    pub sequence_mismatch: u64,
    pub unsupported_format: u64,
    pub late_timestamp: u64,
    pub early_timestamp: u64,
    pub stream_interrupted: u64,
}

/// Talker setup
#[derive(Debug, Clone, Copy)]
pub struct TransmitParams {
    pub class: SrClass,
    pub format: VideoFormat,
    pub max_packet_rate: u32,
    /// Payload bytes per packet, without AVTP or RTP headers
    pub max_packet_size: usize,
    pub stream_id: StreamId,
    pub pool_size: usize,
    pub dmac: MacAddress,
}

/// Listener setup
#[derive(Debug, Clone, Copy)]
pub struct ReceiveParams {
    pub class: SrClass,
    pub format: VideoFormat,
    pub max_packet_rate: u32,
    pub max_packet_size: usize,
    pub stream_id: StreamId,
    pub dmac: MacAddress,
}

struct TransmitState {
    pool: PacketPool,
    clock_domain: Arc<ClockDomain>,
    launch_delta: u32,
    presentation_offset: u32,
    /// Time the next payload passes the reference plane (wraps at 32 bits)
    ref_plane_time: u32,
    /// Launch time of the next packet; 0 until the first packet after activation
    launch_time: u64,
    /// AVTP sequence number of IEC 61883 packets
    sequence: u8,
    /// CIP data block counter
    dbc: u8,
    last_rtp_sequence: u16,
}

impl TransmitState {
    fn reset_time(&mut self, hard: bool, now: u64) {
        if hard || self.ref_plane_time == 0 {
            tracing::debug!(
                old_ref_plane = self.ref_plane_time,
                old_launch = self.launch_time,
                now,
                "Hard time reset"
            );
            self.launch_time = now;
            self.ref_plane_time = now as u32;
        } else {
            let delta = now.wrapping_sub(self.launch_time) as i64;
            tracing::debug!(
                old_ref_plane = self.ref_plane_time,
                old_launch = self.launch_time,
                now,
                delta,
                "Soft time reset"
            );
            // a launch time already in the future stays
            if delta > 0 {
                self.launch_time += delta as u64;
                self.ref_plane_time = self.ref_plane_time.wrapping_add(delta as u32);
            }
        }
    }

    fn advance(&mut self) {
        self.ref_plane_time = self.ref_plane_time.wrapping_add(self.launch_delta);
        self.launch_time += u64::from(self.launch_delta);
    }

    fn presentation_time(&self) -> u32 {
        self.ref_plane_time.wrapping_add(self.presentation_offset)
    }

    fn tu_field(&self) -> u8 {
        if self.clock_domain.is_locked() {
            0
        } else {
            TU_BIT
        }
    }

    fn check_rtp_sequence(&mut self, sequence: u16) {
        let expected = self.last_rtp_sequence.wrapping_add(1);
        if self.last_rtp_sequence != 0 && sequence != expected {
            tracing::warn!(expected, got = sequence, "RTP sequence error on transmit");
        }
        self.last_rtp_sequence = sequence;
    }

    fn finalize(&mut self, compatibility: Compatibility, desc: &VideoDesc, packet: &mut Packet, now: impl FnOnce() -> u64) {
        if self.launch_time == 0 {
            self.reset_time(true, now());
        }

        let payload_len = packet.payload().len();
        let presentation = self.presentation_time();
        let tu = self.tu_field();
        let avtp = &mut packet.buffer_mut()[ETH_HEADER_SIZE..];

        let stream_data_length = if desc.is_iec61883 {
            // tv is clear, the SPH carries the presentation time
            write_u32(avtp, offset::TIMESTAMP, 0);
            avtp[offset::SEQUENCE] = self.sequence;
            self.sequence = self.sequence.wrapping_add(1);

            let sdl = payload_len + CIP_HEADER_SIZE;
            avtp[offset::CIP..offset::CIP_PAYLOAD].copy_from_slice(&[
                CIP_SID,
                CIP_DBS,
                CIP_FN_QPC_SPH,
                self.dbc,
                CIP_FMT_MPEG_TS,
                0,
                0,
                0,
            ]);
            self.dbc = self.dbc.wrapping_add((sdl / CIP_DATA_BLOCK_SIZE) as u8);

            if !desc.has_sph {
                for at in (offset::CIP_PAYLOAD..offset::CIP + sdl).step_by(SOURCE_PACKET_SIZE) {
                    write_u32(avtp, at, presentation);
                }
            }
            sdl
        } else {
            match compatibility {
                Compatibility::D5 | Compatibility::D9 => {
                    write_u32(avtp, offset::TIMESTAMP, desc.rtp_timestamp);
                }
                Compatibility::Current => {
                    write_u32(avtp, offset::TIMESTAMP, presentation);
                    write_u32(avtp, offset::H264_TIMESTAMP, desc.rtp_timestamp);
                }
            }
            // AVTP and RTP sequence numbers share the low byte
            avtp[offset::SEQUENCE] = desc.rtp_sequence as u8;

            let mut marker = if desc.marker() { compatibility.marker_bit() } else { 0 };
            if compatibility == Compatibility::Current {
                marker |= CVF_PTV_BIT;
            }
            avtp[offset::MARKER] = marker;
            payload_len
        };

        write_u16(avtp, offset::STREAM_DATA_LENGTH, stream_data_length as u16);
        avtp[offset::TU] = tu;

        packet.set_attime(self.launch_time);
        self.advance();
    }

    fn finalize_dummy(&mut self, packet: &mut Packet, now: impl FnOnce() -> u64) {
        if self.launch_time == 0 {
            self.reset_time(true, now());
        }

        let tu = self.tu_field();
        packet.set_len(ETH_HEADER_SIZE + AVTP_HEADER_SIZE);
        let avtp = &mut packet.buffer_mut()[ETH_HEADER_SIZE..];
        write_u16(avtp, offset::STREAM_DATA_LENGTH, 0);
        avtp[offset::TU] = tu;

        packet.set_attime(self.launch_time);
        self.advance();
    }
}

struct ReceiveState {
    validation: ValidationConfig,
    internal_state: StreamState,
    validation_count: u32,
    last_sequence: u8,
    rtp_sequence_high: u8,
    /// Rebuilt RTP packet handed to the local stream
    scratch: BytesMut,
}

/// Direction-specific state
enum Role {
    Transmit(TransmitState),
    Receive(ReceiveState),
}

struct Core {
    active: bool,
    state: StreamState,
    local: Option<Arc<LocalVideoStream>>,
    diag: StreamDiagnostics,
    role: Role,
}

/// One AVB video stream, talker or listener
pub struct AvbVideoStream {
    stream_id: StreamId,
    direction: Direction,
    format: VideoFormat,
    compatibility: Compatibility,
    tspec: TSpec,
    dmac: MacAddress,
    max_packet_rate: u32,
    max_packet_size: usize,
    clock: Arc<dyn NetworkTime>,
    core: Mutex<Core>,
}

impl AvbVideoStream {
    /// Create a talker and pre-build every packet of its pool
    pub fn transmit(env: &StreamEnvironment, params: TransmitParams, clock_domain: Arc<ClockDomain>) -> Result<Self> {
        let TransmitParams {
            class,
            format,
            max_packet_rate,
            max_packet_size,
            stream_id,
            pool_size,
            dmac,
        } = params;

        if max_packet_rate == 0 || max_packet_size == 0 || max_packet_size > MAX_TRANSMIT_PAYLOAD {
            return Err(StreamError::InvalidParam(format!(
                "transmit rate {} size {} (max {})",
                max_packet_rate, max_packet_size, MAX_TRANSMIT_PAYLOAD
            ))
            .into());
        }
        let source_mac = env
            .interface
            .source_mac()
            .ok_or(StreamError::InitializationFailed("no source MAC address"))?;

        let class_params = SrClassParams::from_registry(&env.config);
        let tspec = TSpec::new((max_packet_size + AVTP_HEADER_SIZE) as u16, class, &class_params)
            .for_packet_rate(max_packet_rate);
        let compatibility = match format {
            VideoFormat::Rtp => Compatibility::resolve(&env.config, stream_id),
            VideoFormat::Iec61883 => Compatibility::default(),
        };

        let pool = PacketPool::new(max_packet_size + POOL_PACKET_OVERHEAD, pool_size)?;
        let template = frame_template(format, compatibility, &tspec, stream_id, dmac, source_mac);
        install_template(&pool, &template)?;

        tracing::info!(
            stream_id = %stream_id,
            ?class,
            ?format,
            ?compatibility,
            max_packet_rate,
            max_packet_size,
            launch_delta = tspec.launch_time_delta(),
            "Created video talker"
        );

        let role = Role::Transmit(TransmitState {
            pool,
            clock_domain,
            launch_delta: tspec.launch_time_delta(),
            presentation_offset: tspec.params.presentation_offset,
            ref_plane_time: 0,
            launch_time: 0,
            sequence: 0,
            dbc: 0,
            last_rtp_sequence: 0,
        });

        Ok(Self::with_role(
            env,
            stream_id,
            Direction::TransmitToNetwork,
            format,
            compatibility,
            tspec,
            dmac,
            max_packet_rate,
            max_packet_size,
            role,
        ))
    }

    /// Create a listener
    pub fn receive(env: &StreamEnvironment, params: ReceiveParams) -> Result<Self> {
        let ReceiveParams {
            class,
            format,
            max_packet_rate,
            max_packet_size,
            stream_id,
            dmac,
        } = params;

        if max_packet_rate == 0 || max_packet_size == 0 || max_packet_size > MAX_LOCAL_PACKET_SIZE {
            return Err(StreamError::InvalidParam(format!(
                "receive rate {} size {}",
                max_packet_rate, max_packet_size
            ))
            .into());
        }

        let class_params = SrClassParams::from_registry(&env.config);
        let tspec = TSpec::new((max_packet_size + AVTP_HEADER_SIZE) as u16, class, &class_params)
            .for_packet_rate(max_packet_rate);
        let compatibility = match format {
            VideoFormat::Rtp => Compatibility::resolve(&env.config, stream_id),
            VideoFormat::Iec61883 => Compatibility::default(),
        };
        let validation = ValidationConfig::from_registry(&env.config);

        tracing::info!(
            stream_id = %stream_id,
            ?format,
            ?compatibility,
            mode = ?validation.mode,
            threshold = validation.threshold,
            "Created video listener"
        );

        let role = Role::Receive(ReceiveState {
            validation,
            internal_state: StreamState::Inactive,
            validation_count: validation.threshold,
            last_sequence: 0,
            rtp_sequence_high: 0,
            scratch: BytesMut::with_capacity(max_packet_size + RTP_HEADER_SIZE),
        });

        Ok(Self::with_role(
            env,
            stream_id,
            Direction::ReceiveFromNetwork,
            format,
            compatibility,
            tspec,
            dmac,
            max_packet_rate,
            max_packet_size,
            role,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn with_role(
        env: &StreamEnvironment,
        stream_id: StreamId,
        direction: Direction,
        format: VideoFormat,
        compatibility: Compatibility,
        tspec: TSpec,
        dmac: MacAddress,
        max_packet_rate: u32,
        max_packet_size: usize,
        role: Role,
    ) -> Self {
        Self {
            stream_id,
            direction,
            format,
            compatibility,
            tspec,
            dmac,
            max_packet_rate,
            max_packet_size,
            clock: Arc::clone(&env.clock),
            core: Mutex::new(Core {
                active: false,
                state: StreamState::Inactive,
                local: None,
                diag: StreamDiagnostics::default(),
                role,
            }),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn format(&self) -> VideoFormat {
        self.format
    }

    pub fn compatibility(&self) -> Compatibility {
        self.compatibility
    }

    pub fn tspec(&self) -> &TSpec {
        &self.tspec
    }

    pub fn dmac(&self) -> MacAddress {
        self.dmac
    }

    pub fn max_packet_rate(&self) -> u32 {
        self.max_packet_rate
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn is_active(&self) -> bool {
        self.core.lock().active
    }

    pub fn is_connected(&self) -> bool {
        self.core.lock().local.is_some()
    }

    pub fn state(&self) -> StreamState {
        self.core.lock().state
    }

    pub fn diagnostics(&self) -> StreamDiagnostics {
        self.core.lock().diag
    }

    /// Talker packet pool
    pub fn packet_pool(&self) -> Option<PacketPool> {
        match &self.core.lock().role {
            Role::Transmit(tx) => Some(tx.pool.clone()),
            Role::Receive(_) => None,
        }
    }

    /// Launch time of the next talker packet, 0 before the first one
    pub fn next_launch_time(&self) -> Option<u64> {
        match &self.core.lock().role {
            Role::Transmit(tx) => Some(tx.launch_time),
            Role::Receive(_) => None,
        }
    }

    pub fn activate(&self, is_error: bool) {
        self.set_active(true, is_error);
    }

    pub fn deactivate(&self, is_error: bool) {
        self.set_active(false, is_error);
    }

    fn set_active(&self, active: bool, is_error: bool) {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if core.active == active {
            return;
        }
        core.active = active;
        if is_error {
            core.diag.stream_interrupted += 1;
        }

        if active {
            if let Role::Transmit(tx) = &mut core.role {
                // next packet performs a hard time reset
                tx.launch_time = 0;
            }
        }
        if let Some(local) = &core.local {
            local.set_client_active(active);
        }

        tracing::info!(stream_id = %self.stream_id, active, is_error, "Stream activation changed");
    }

    /// Attach a local stream, or detach with `None`
    ///
    /// Any previously attached local stream is disconnected first. Rate,
    /// size, direction and format must match this stream.
    pub fn connect_to(&self, local: Option<Arc<LocalVideoStream>>) -> Result<()> {
        let mut guard = self.core.lock();
        let core = &mut *guard;

        if let (Some(current), Some(requested)) = (&core.local, &local) {
            if Arc::ptr_eq(current, requested) {
                return Ok(());
            }
        }
        if let Some(old) = core.local.take() {
            old.disconnect();
        }
        let Some(local) = local else {
            tracing::info!(stream_id = %self.stream_id, "Local stream detached");
            return Ok(());
        };

        if local.max_packet_rate() != self.max_packet_rate
            || local.max_packet_size() != self.max_packet_size
            || local.direction() != self.direction
            || local.format() != self.format
        {
            tracing::error!(stream_id = %self.stream_id, local = local.id(), "Local stream parameters do not match");
            return Err(StreamError::Mismatch(format!(
                "local {} rate {} size {} {:?}/{:?}, stream rate {} size {} {:?}/{:?}",
                local.id(),
                local.max_packet_rate(),
                local.max_packet_size(),
                local.direction(),
                local.format(),
                self.max_packet_rate,
                self.max_packet_size,
                self.direction,
                self.format
            ))
            .into());
        }

        local.connect(self.stream_id)?;
        if let Role::Transmit(tx) = &core.role {
            local.set_packet_pool(Some(tx.pool.clone()));
        }
        local.set_client_active(self.direction == Direction::TransmitToNetwork && core.active);
        core.local = Some(local);
        Ok(())
    }

    /// Re-anchor the talker's launch and reference-plane times to now
    ///
    /// A hard reset jumps to now. A soft reset only moves times that lie
    /// in the past forward.
    pub fn reset_time(&self, hard: bool) {
        let mut core = self.core.lock();
        if let Role::Transmit(tx) = &mut core.role {
            tx.reset_time(hard, self.clock.exact_time());
        }
    }

    /// Next packet to transmit
    ///
    /// Returns `None` for inactive or unconnected talkers, for listeners,
    /// and when the pool has no packet for a dummy.
    pub fn prepare_packet(&self) -> Option<Packet> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let Role::Transmit(tx) = &mut core.role else {
            return None;
        };
        if !core.active {
            return None;
        }
        let local = core.local.as_ref()?;
        let clock = &self.clock;

        let mut desc = VideoDesc::default();
        if let ReadStatus::Data(_) = local.pop_for_transmit(&mut desc) {
            if let Some(mut packet) = desc.packet.take() {
                if !desc.is_iec61883 {
                    tx.check_rtp_sequence(desc.rtp_sequence);
                }
                tx.finalize(self.compatibility, &desc, &mut packet, || clock.exact_time());
                core.diag.frames_tx += 1;
                return Some(packet);
            }
        }

        match tx.pool.dummy_packet() {
            Some(mut packet) => {
                tx.finalize_dummy(&mut packet, || clock.exact_time());
                core.diag.dummy_frames_tx += 1;
                Some(packet)
            }
            None => {
                tracing::trace!(stream_id = %self.stream_id, "No packet left for a dummy");
                None
            }
        }
    }

    /// Entry point for packets addressed to this listener
    ///
    /// `avtp` starts at the AVTP header. With the tv bit set the
    /// timestamp is checked against `now` and counted as late or early.
    pub fn dispatch_packet(&self, avtp: &[u8], now: u64) {
        if self.direction != Direction::ReceiveFromNetwork {
            tracing::warn!(stream_id = %self.stream_id, "Packet dispatched to a talker");
            return;
        }

        let mut guard = self.core.lock();
        if avtp.len() >= AVTP_HEADER_SIZE && avtp[offset::FLAGS] & TV_BIT != 0 {
            let delta = read_u32(avtp, offset::TIMESTAMP).wrapping_sub(now as u32) as i32;
            if delta < 0 {
                guard.diag.late_timestamp += 1;
            } else if i64::from(delta) > i64::from(self.tspec.params.max_transit_time()) {
                guard.diag.early_timestamp += 1;
            }
        }
        self.receive_locked(&mut guard, Some(avtp));
    }

    /// Feed one received packet, or `None` when a receive tick saw nothing
    pub fn on_packet_received(&self, avtp: Option<&[u8]>) {
        let mut guard = self.core.lock();
        self.receive_locked(&mut guard, avtp);
    }

    fn receive_locked(&self, core: &mut Core, avtp: Option<&[u8]>) {
        let Role::Receive(rx) = &mut core.role else {
            return;
        };

        let old_state = rx.internal_state;
        let new_state = match avtp {
            None => StreamState::NoData,
            Some(p) => {
                core.diag.frames_rx += 1;
                self.classify(rx, core.state, &mut core.diag, p)
            }
        };

        if new_state == StreamState::Valid && rx.validation_count > 0 {
            rx.validation_count -= 1;
            if rx.validation_count == 0 {
                tracing::info!(stream_id = %self.stream_id, "Stream data valid");
                core.state = StreamState::Valid;
                if let Some(local) = &core.local {
                    local.set_client_active(true);
                }
            }
        }

        if new_state != old_state {
            rx.internal_state = new_state;
            if old_state == StreamState::Valid {
                tracing::debug!(stream_id = %self.stream_id, state = ?new_state, "Stream data invalid");
                rx.validation_count = rx.validation.threshold;
                core.state = new_state;
                if let Some(local) = &core.local {
                    local.set_client_active(false);
                }
            }
        }

        let Some(local) = &core.local else {
            return;
        };
        match (new_state, avtp) {
            (StreamState::Valid, Some(p)) => {
                if !self.deliver(rx, local, p) {
                    core.diag.unsupported_format += 1;
                }
            }
            (StreamState::NoData, _) => local.signal_no_data(),
            _ => {}
        }
    }

    /// Run the checks the validation mode asks for and follow the sequence
    fn classify(&self, rx: &mut ReceiveState, external: StreamState, diag: &mut StreamDiagnostics, p: &[u8]) -> StreamState {
        let mut state = StreamState::InvalidData;
        let mut rejected = false;

        if rx.validation.mode == ValidationMode::Never {
            state = StreamState::Valid;
        } else {
            if rx.validation.mode == ValidationMode::Always || external != StreamState::Valid {
                match self.validate(p) {
                    Ok(()) => state = StreamState::Valid,
                    Err(reason) => {
                        rejected = true;
                        diag.unsupported_format += 1;
                        tracing::trace!(stream_id = %self.stream_id, reason, "Packet failed validation");
                    }
                }
            }

            if rx.internal_state == StreamState::Valid && p.len() >= AVTP_HEADER_SIZE {
                let sequence = p[offset::SEQUENCE];
                if sequence == rx.last_sequence.wrapping_add(1) {
                    // a continuous sequence does not excuse a failed check
                    if !rejected {
                        state = StreamState::Valid;
                    }
                    if self.format == VideoFormat::Rtp && sequence < rx.last_sequence {
                        rx.rtp_sequence_high = rx.rtp_sequence_high.wrapping_add(1);
                    }
                } else {
                    diag.sequence_mismatch += 1;
                    tracing::debug!(
                        stream_id = %self.stream_id,
                        expected = rx.last_sequence.wrapping_add(1),
                        got = sequence,
                        mismatches = diag.sequence_mismatch,
                        "Sequence number mismatch"
                    );
                    state = StreamState::InvalidData;
                }
            }
        }

        if p.len() >= AVTP_HEADER_SIZE {
            rx.last_sequence = p[offset::SEQUENCE];
        }
        state
    }

    fn validate(&self, p: &[u8]) -> std::result::Result<(), &'static str> {
        if p.len() < AVTP_HEADER_SIZE {
            return Err("shorter than AVTP header");
        }
        let sdl = usize::from(read_u16(p, offset::STREAM_DATA_LENGTH));

        match self.format {
            VideoFormat::Iec61883 => {
                if p[offset::SUBTYPE] != SUBTYPE_IEC61883 {
                    return Err("not an IEC 61883 packet");
                }
                if p[offset::MARKER] & IEC61883_TAG_BIT == 0 {
                    return Err("IEC 61883-4 packet without CIP");
                }
                if sdl == 0 {
                    return Ok(());
                }
                if sdl < CIP_HEADER_SIZE || AVTP_HEADER_SIZE + sdl > p.len() {
                    return Err("stream data length exceeds packet");
                }
                let has_sph = p[offset::CIP_FN_QPC_SPH] & CIP_SPH_BIT != 0;
                let unit = if has_sph { SOURCE_PACKET_SIZE } else { TSP_SIZE };
                if (sdl - CIP_HEADER_SIZE) % unit != 0 {
                    tracing::trace!(stream_id = %self.stream_id, sdl, unit, "Payload is not a whole number of transport packets");
                }
                Ok(())
            }
            VideoFormat::Rtp => {
                if p[offset::SUBTYPE] != SUBTYPE_CVF {
                    return Err("not a CVF packet");
                }
                if p[offset::FORMAT] != CVF_FORMAT_RFC {
                    return Err("CVF format is not RFC payload");
                }
                // dummy packets stop after the common header
                if sdl == 0 {
                    return Ok(());
                }
                if p.len() < self.compatibility.cvf_header_len() + sdl {
                    return Err("stream data length exceeds packet");
                }
                Ok(())
            }
        }
    }

    /// Push a valid packet's payload to the local stream; false if it is malformed
    fn deliver(&self, rx: &mut ReceiveState, local: &LocalVideoStream, p: &[u8]) -> bool {
        if p.len() < AVTP_HEADER_SIZE {
            return false;
        }
        let sdl = usize::from(read_u16(p, offset::STREAM_DATA_LENGTH));
        if sdl == 0 {
            return true;
        }
        let rtp_sequence = (u16::from(rx.rtp_sequence_high) << 8) | u16::from(p[offset::SEQUENCE]);

        match self.format {
            VideoFormat::Rtp => {
                let header_len = self.compatibility.cvf_header_len();
                let Some(payload) = p.get(header_len..header_len + sdl) else {
                    return false;
                };
                let rtp_timestamp = match self.compatibility {
                    Compatibility::D5 | Compatibility::D9 => read_u32(p, offset::TIMESTAMP),
                    Compatibility::Current if p[offset::MARKER] & CVF_PTV_BIT != 0 => {
                        read_u32(p, offset::H264_TIMESTAMP)
                    }
                    Compatibility::Current => 0,
                };
                let mpt_field = if p[offset::MARKER] & self.compatibility.marker_bit() != 0 {
                    RTP_MPT_MARKER
                } else {
                    RTP_MPT_NO_MARKER
                };

                rx.scratch.clear();
                rx.scratch.put_slice(&rtp_header(mpt_field, rtp_sequence, rtp_timestamp, RECEIVE_SSRC));
                rx.scratch.put_slice(payload);
                self.push(
                    local,
                    &VideoUnit {
                        data: &rx.scratch[..],
                        rtp_sequence,
                        rtp_timestamp,
                        mpt_field,
                        ..VideoUnit::default()
                    },
                )
            }
            VideoFormat::Iec61883 => {
                if sdl < CIP_HEADER_SIZE {
                    return false;
                }
                let Some(payload) = p.get(offset::CIP_PAYLOAD..offset::CIP + sdl) else {
                    return false;
                };
                let has_sph = p[offset::CIP_FN_QPC_SPH] & CIP_SPH_BIT != 0;
                self.push(local, &VideoUnit::mpeg_ts(payload, has_sph, rtp_sequence))
            }
        }
    }

    /// False when the local stream cannot take the unit at all
    fn push(&self, local: &LocalVideoStream, unit: &VideoUnit<'_>) -> bool {
        match local.push_received(unit) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(stream_id = %self.stream_id, "Dropping received unit: {}", e);
                false
            }
        }
    }
}

/// Ethernet and AVTP header shared by every packet of a talker
fn frame_template(
    format: VideoFormat,
    compatibility: Compatibility,
    tspec: &TSpec,
    stream_id: StreamId,
    dmac: MacAddress,
    smac: MacAddress,
) -> BytesMut {
    let mut frame = avtp::ethernet_header(dmac, smac, tspec.vlan_tci());
    match format {
        VideoFormat::Rtp => {
            frame.put_u8(SUBTYPE_CVF);
            frame.put_u8(CVF_FLAGS);
        }
        VideoFormat::Iec61883 => {
            frame.put_u8(SUBTYPE_IEC61883);
            frame.put_u8(IEC61883_FLAGS);
        }
    }
    frame.put_u8(0); // sequence, per packet
    frame.put_u8(0); // tu, per packet
    frame.put_slice(&stream_id.to_bytes());
    frame.put_u32(0); // timestamp, per packet

    match (format, compatibility) {
        (VideoFormat::Rtp, Compatibility::D5) => frame.put_slice(&[CVF_FORMAT_RFC, 0, 0, 1]),
        (VideoFormat::Rtp, _) => frame.put_slice(&[CVF_FORMAT_RFC, CVF_FORMAT_SUBTYPE_H264, 0, 0]),
        // gateway info
        (VideoFormat::Iec61883, _) => frame.put_u32(0),
    }

    frame.put_u16(0); // stream data length, per packet
    match format {
        VideoFormat::Rtp => frame.put_u16(0),
        VideoFormat::Iec61883 => {
            frame.put_u8(IEC61883_TAG_CHANNEL);
            frame.put_u8(IEC61883_TCODE_SY);
        }
    }

    frame.resize(payload_offset(format, compatibility), 0);
    frame
}

/// Offset of the media payload from the frame start
fn payload_offset(format: VideoFormat, compatibility: Compatibility) -> usize {
    match format {
        VideoFormat::Rtp => ETH_HEADER_SIZE + compatibility.cvf_header_len(),
        VideoFormat::Iec61883 => ETH_HEADER_SIZE + AVTP_HEADER_SIZE + CIP_HEADER_SIZE,
    }
}

fn install_template(pool: &PacketPool, template: &[u8]) -> Result<()> {
    let mut reference = pool
        .acquire()
        .ok_or(StreamError::InitializationFailed("no reference packet in pool"))?;
    reference.set_len(0);
    if !reference.append(template) {
        return Err(StreamError::InitializationFailed("frame template exceeds packet size").into());
    }
    reference.set_payload_offset(template.len());
    pool.init_all_from_template(&reference)?;
    // the reference packet keeps its template when it returns
    Ok(())
}

impl Drop for AvbVideoStream {
    fn drop(&mut self) {
        if let Some(local) = self.core.get_mut().local.take() {
            local.disconnect();
        }
    }
}

impl std::fmt::Debug for AvbVideoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvbVideoStream")
            .field("stream_id", &self.stream_id)
            .field("direction", &self.direction)
            .field("format", &self.format)
            .field("compatibility", &self.compatibility)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::avtp::avtp_view;
    use crate::stream::NetworkInterface;
    use std::sync::atomic::{AtomicU64, Ordering};

    const NOW: u64 = 1_000_000;
    const TALKER_ID: StreamId = StreamId(0x0200_0000_0001_0001);

    struct FixedClock(AtomicU64);

    impl FixedClock {
        fn set(&self, now: u64) {
            self.0.store(now, Ordering::SeqCst);
        }
    }

    impl NetworkTime for FixedClock {
        fn approximate_time(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }

        fn exact_time(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn environment(config: ConfigRegistry) -> (StreamEnvironment, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock(AtomicU64::new(NOW)));
        let mac: Arc<dyn NetworkInterface> = Arc::new(MacAddress([0x02, 0, 0, 0, 0, 0x01]));
        let env = StreamEnvironment::new(clock.clone(), mac, Arc::new(config));
        (env, clock)
    }

    fn tx_params(format: VideoFormat, size: usize) -> TransmitParams {
        TransmitParams {
            class: SrClass::Low,
            format,
            max_packet_rate: 4000,
            max_packet_size: size,
            stream_id: TALKER_ID,
            pool_size: 16,
            dmac: MacAddress::AVTP_MULTICAST,
        }
    }

    fn rx_params(format: VideoFormat, size: usize) -> ReceiveParams {
        ReceiveParams {
            class: SrClass::Low,
            format,
            max_packet_rate: 4000,
            max_packet_size: size,
            stream_id: TALKER_ID,
            dmac: MacAddress::AVTP_MULTICAST,
        }
    }

    fn talker(env: &StreamEnvironment, format: VideoFormat, size: usize, domain: ClockDomain) -> (AvbVideoStream, Arc<LocalVideoStream>) {
        let stream = AvbVideoStream::transmit(env, tx_params(format, size), Arc::new(domain)).unwrap();
        let local = Arc::new(LocalVideoStream::new(1, Direction::TransmitToNetwork, format, 8, 4000, size).unwrap());
        stream.connect_to(Some(local.clone())).unwrap();
        stream.activate(false);
        (stream, local)
    }

    fn listener(env: &StreamEnvironment, format: VideoFormat, size: usize) -> (AvbVideoStream, Arc<LocalVideoStream>) {
        let stream = AvbVideoStream::receive(env, rx_params(format, size)).unwrap();
        let local = Arc::new(LocalVideoStream::new(2, Direction::ReceiveFromNetwork, format, 8, 4000, size).unwrap());
        stream.connect_to(Some(local.clone())).unwrap();
        (stream, local)
    }

    fn rtp_packet(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> Vec<u8> {
        let mpt = if marker { RTP_MPT_MARKER } else { RTP_MPT_NO_MARKER };
        let mut packet = rtp_header(mpt, seq, ts, 0x1111_2222).to_vec();
        packet.extend_from_slice(payload);
        packet
    }

    /// Current-draft CVF packet as a talker would send it
    fn cvf_packet(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; 28];
        p[offset::SUBTYPE] = SUBTYPE_CVF;
        p[offset::FLAGS] = CVF_FLAGS;
        p[offset::SEQUENCE] = seq;
        p[offset::STREAM_ID..offset::STREAM_ID + 8].copy_from_slice(&TALKER_ID.to_bytes());
        p[offset::FORMAT] = CVF_FORMAT_RFC;
        p[offset::FORMAT_SUBTYPE] = CVF_FORMAT_SUBTYPE_H264;
        write_u16(&mut p, offset::STREAM_DATA_LENGTH, payload.len() as u16);
        p[offset::MARKER] = CVF_PTV_BIT;
        p.extend_from_slice(payload);
        p
    }

    fn threshold(n: i64) -> ConfigRegistry {
        let mut config = ConfigRegistry::new();
        config.set(keys::VALIDATION_THRESHOLD, n);
        config
    }

    #[test]
    fn test_dummy_packets_step_launch_time() {
        let (env, _) = environment(ConfigRegistry::new());
        let domain = ClockDomain::new(crate::clock::ClockDomainKind::Derived);
        let (stream, _local) = talker(&env, VideoFormat::Rtp, 1460, domain);
        assert_eq!(stream.tspec().launch_time_delta(), 250_000);

        let first = stream.prepare_packet().unwrap();
        assert!(first.is_dummy());
        assert_eq!(first.attime(), NOW);
        assert_eq!(first.len(), ETH_HEADER_SIZE + AVTP_HEADER_SIZE);
        let avtp = avtp_view(first.frame()).unwrap();
        assert_eq!(read_u16(avtp, offset::STREAM_DATA_LENGTH), 0);
        // derived domain never locked
        assert_eq!(avtp[offset::TU], TU_BIT);

        let second = stream.prepare_packet().unwrap();
        assert_eq!(second.attime(), NOW + 250_000);
        let third = stream.prepare_packet().unwrap();
        assert_eq!(third.attime(), NOW + 500_000);
        assert_eq!(stream.diagnostics().dummy_frames_tx, 3);
    }

    #[test]
    fn test_inactive_or_unconnected_talker_sends_nothing() {
        let (env, _) = environment(ConfigRegistry::new());
        let stream = AvbVideoStream::transmit(&env, tx_params(VideoFormat::Rtp, 1000), Arc::new(ClockDomain::raw())).unwrap();
        stream.activate(false);
        assert!(stream.prepare_packet().is_none());

        let local = Arc::new(LocalVideoStream::new(1, Direction::TransmitToNetwork, VideoFormat::Rtp, 8, 4000, 1000).unwrap());
        stream.connect_to(Some(local)).unwrap();
        stream.deactivate(false);
        assert!(stream.prepare_packet().is_none());
        stream.activate(false);
        assert!(stream.prepare_packet().is_some());
    }

    #[test]
    fn test_transmit_param_checks() {
        let (env, _) = environment(ConfigRegistry::new());
        let domain = Arc::new(ClockDomain::raw());
        assert!(AvbVideoStream::transmit(&env, tx_params(VideoFormat::Rtp, MAX_TRANSMIT_PAYLOAD), domain.clone()).is_ok());
        assert!(AvbVideoStream::transmit(&env, tx_params(VideoFormat::Rtp, MAX_TRANSMIT_PAYLOAD + 1), domain.clone()).is_err());

        let mut params = tx_params(VideoFormat::Rtp, 1000);
        params.max_packet_rate = 0;
        assert!(AvbVideoStream::transmit(&env, params, domain).is_err());

        assert!(AvbVideoStream::receive(&env, rx_params(VideoFormat::Rtp, 1501)).is_err());
    }

    #[test]
    fn test_missing_source_mac_fails() {
        struct Unplugged;
        impl NetworkInterface for Unplugged {
            fn source_mac(&self) -> Option<MacAddress> {
                None
            }
        }
        let (mut env, _) = environment(ConfigRegistry::new());
        env.interface = Arc::new(Unplugged);
        let result = AvbVideoStream::transmit(&env, tx_params(VideoFormat::Rtp, 1000), Arc::new(ClockDomain::raw()));
        assert!(matches!(
            result,
            Err(crate::Error::Stream(StreamError::InitializationFailed(_)))
        ));
    }

    #[test]
    fn test_cvf_d5_template() {
        let mut config = ConfigRegistry::new();
        config.set(keys::COMPATIBILITY_VIDEO, "D5_1722a");
        let (env, _) = environment(config);
        let (stream, local) = talker(&env, VideoFormat::Rtp, 1000, ClockDomain::raw());
        assert_eq!(stream.compatibility(), Compatibility::D5);

        local.write_rtp(&rtp_packet(1, 0x0102_0304, true, &[7u8; 50])).unwrap();
        let packet = stream.prepare_packet().unwrap();
        assert_eq!(packet.payload_offset(), 42);
        assert_eq!(packet.len(), 42 + 50);

        let frame = packet.frame();
        assert_eq!(&frame[..6], &MacAddress::AVTP_MULTICAST.0);
        assert_eq!(&frame[6..12], &[0x02, 0, 0, 0, 0, 0x01]);
        let avtp = avtp_view(frame).unwrap();
        assert_eq!(avtp[offset::SUBTYPE], SUBTYPE_CVF);
        assert_eq!(avtp[offset::FLAGS], CVF_FLAGS);
        assert_eq!(&avtp[offset::STREAM_ID..offset::STREAM_ID + 8], &TALKER_ID.to_bytes());
        assert_eq!(&avtp[offset::FORMAT..offset::FORMAT + 4], &[CVF_FORMAT_RFC, 0, 0, 1]);
        assert_eq!(read_u32(avtp, offset::TIMESTAMP), 0x0102_0304);
        assert_eq!(avtp[offset::MARKER], CVF_D5_MARKER_BIT);
        // raw domain is always locked
        assert_eq!(avtp[offset::TU], 0);
    }

    #[test]
    fn test_cvf_current_finalize() {
        let (env, _) = environment(ConfigRegistry::new());
        let (stream, local) = talker(&env, VideoFormat::Rtp, 1000, ClockDomain::raw());
        assert_eq!(stream.compatibility(), Compatibility::Current);

        local.write_rtp(&rtp_packet(300, 0xAABB_CCDD, true, &[3u8; 100])).unwrap();
        local.write_rtp(&rtp_packet(301, 0xAABB_CCDE, false, &[4u8; 80])).unwrap();

        let packet = stream.prepare_packet().unwrap();
        assert!(!packet.is_dummy());
        assert_eq!(packet.attime(), NOW);
        assert_eq!(packet.payload_offset(), 46);
        let avtp = avtp_view(packet.frame()).unwrap();
        assert_eq!(&avtp[offset::FORMAT..offset::FORMAT + 2], &[CVF_FORMAT_RFC, CVF_FORMAT_SUBTYPE_H264]);
        assert_eq!(avtp[offset::SEQUENCE], 44);
        assert_eq!(read_u16(avtp, offset::STREAM_DATA_LENGTH), 100);
        assert_eq!(avtp[offset::MARKER], CVF_MARKER_BIT | CVF_PTV_BIT);
        assert_eq!(read_u32(avtp, offset::TIMESTAMP), NOW as u32 + 9_750_000);
        assert_eq!(read_u32(avtp, offset::H264_TIMESTAMP), 0xAABB_CCDD);
        assert_eq!(packet.payload(), &[3u8; 100][..]);

        let packet = stream.prepare_packet().unwrap();
        assert_eq!(packet.attime(), NOW + 250_000);
        let avtp = avtp_view(packet.frame()).unwrap();
        assert_eq!(avtp[offset::MARKER], CVF_PTV_BIT);
        assert_eq!(read_u32(avtp, offset::TIMESTAMP), NOW as u32 + 250_000 + 9_750_000);
        assert_eq!(stream.diagnostics().frames_tx, 2);
    }

    #[test]
    fn test_iec61883_finalize() {
        let (env, _) = environment(ConfigRegistry::new());
        let size = 7 * SOURCE_PACKET_SIZE;
        let (stream, local) = talker(&env, VideoFormat::Iec61883, size, ClockDomain::raw());

        local.write_mpeg_ts(&[0x47u8; 2 * TSP_SIZE], false, 1).unwrap();
        let packet = stream.prepare_packet().unwrap();
        assert_eq!(packet.payload_offset(), 50);

        let avtp = avtp_view(packet.frame()).unwrap();
        assert_eq!(avtp[offset::SUBTYPE], SUBTYPE_IEC61883);
        assert_eq!(avtp[offset::FLAGS], IEC61883_FLAGS);
        assert_eq!(avtp[offset::SEQUENCE], 0);
        assert_eq!(avtp[offset::MARKER], IEC61883_TAG_CHANNEL);
        assert_eq!(avtp[offset::TCODE], IEC61883_TCODE_SY);
        assert_eq!(read_u32(avtp, offset::TIMESTAMP), 0);
        assert_eq!(read_u16(avtp, offset::STREAM_DATA_LENGTH), 392);
        assert_eq!(
            &avtp[offset::CIP..offset::CIP_PAYLOAD],
            &[CIP_SID, CIP_DBS, CIP_FN_QPC_SPH, 0, CIP_FMT_MPEG_TS, 0, 0, 0]
        );

        let presentation = NOW as u32 + 9_750_000;
        assert_eq!(read_u32(avtp, offset::CIP_PAYLOAD), presentation);
        assert_eq!(read_u32(avtp, offset::CIP_PAYLOAD + SOURCE_PACKET_SIZE), presentation);
        assert_eq!(avtp[offset::CIP_PAYLOAD + 4], 0x47);

        local.write_mpeg_ts(&[0x47u8; TSP_SIZE], false, 2).unwrap();
        let packet = stream.prepare_packet().unwrap();
        let avtp = avtp_view(packet.frame()).unwrap();
        assert_eq!(avtp[offset::SEQUENCE], 1);
        // 392 / 24 data blocks in the first packet
        assert_eq!(avtp[offset::CIP_DBC], 16);
        assert_eq!(read_u16(avtp, offset::STREAM_DATA_LENGTH), 200);
    }

    #[test]
    fn test_soft_reset_only_moves_forward() {
        let (env, clock) = environment(ConfigRegistry::new());
        let (stream, _local) = talker(&env, VideoFormat::Rtp, 1000, ClockDomain::raw());

        assert_eq!(stream.prepare_packet().unwrap().attime(), NOW);
        assert_eq!(stream.next_launch_time(), Some(NOW + 250_000));

        clock.set(5_000_000);
        stream.reset_time(false);
        assert_eq!(stream.next_launch_time(), Some(5_000_000));

        clock.set(100);
        stream.reset_time(false);
        assert_eq!(stream.next_launch_time(), Some(5_000_000));

        stream.reset_time(true);
        assert_eq!(stream.next_launch_time(), Some(100));
    }

    #[test]
    fn test_reactivation_is_hard_reset() {
        let (env, clock) = environment(ConfigRegistry::new());
        let (stream, _local) = talker(&env, VideoFormat::Rtp, 1000, ClockDomain::raw());
        stream.prepare_packet().unwrap();

        stream.deactivate(true);
        clock.set(3_000_000);
        stream.activate(false);
        assert_eq!(stream.prepare_packet().unwrap().attime(), 3_000_000);
        assert_eq!(stream.diagnostics().stream_interrupted, 1);
    }

    #[test]
    fn test_connect_checks_parameters() {
        let (env, _) = environment(ConfigRegistry::new());
        let stream = AvbVideoStream::transmit(&env, tx_params(VideoFormat::Rtp, 1000), Arc::new(ClockDomain::raw())).unwrap();

        let wrong_rate = Arc::new(LocalVideoStream::new(1, Direction::TransmitToNetwork, VideoFormat::Rtp, 8, 2000, 1000).unwrap());
        assert!(matches!(
            stream.connect_to(Some(wrong_rate)),
            Err(crate::Error::Stream(StreamError::Mismatch(_)))
        ));

        let wrong_direction = Arc::new(LocalVideoStream::new(2, Direction::ReceiveFromNetwork, VideoFormat::Rtp, 8, 4000, 1000).unwrap());
        assert!(stream.connect_to(Some(wrong_direction)).is_err());

        let wrong_format = Arc::new(LocalVideoStream::new(3, Direction::TransmitToNetwork, VideoFormat::Iec61883, 8, 4000, 1000).unwrap());
        assert!(stream.connect_to(Some(wrong_format)).is_err());
        assert!(!stream.is_connected());

        let good = Arc::new(LocalVideoStream::new(4, Direction::TransmitToNetwork, VideoFormat::Rtp, 8, 4000, 1000).unwrap());
        stream.connect_to(Some(good.clone())).unwrap();
        assert_eq!(good.client(), Some(TALKER_ID));
        assert!(good.buffer().has_packet_pool());

        stream.connect_to(None).unwrap();
        assert!(!good.is_connected());
        assert!(!good.buffer().has_packet_pool());
    }

    #[test]
    fn test_local_stream_used_by_two_streams() {
        let (env, _) = environment(ConfigRegistry::new());
        let domain = Arc::new(ClockDomain::raw());
        let first = AvbVideoStream::transmit(&env, tx_params(VideoFormat::Rtp, 1000), domain.clone()).unwrap();
        let mut params = tx_params(VideoFormat::Rtp, 1000);
        params.stream_id = StreamId(0x99);
        let second = AvbVideoStream::transmit(&env, params, domain).unwrap();

        let local = Arc::new(LocalVideoStream::new(1, Direction::TransmitToNetwork, VideoFormat::Rtp, 8, 4000, 1000).unwrap());
        first.connect_to(Some(local.clone())).unwrap();
        assert!(matches!(
            second.connect_to(Some(local.clone())),
            Err(crate::Error::Stream(StreamError::AlreadyInUse))
        ));

        drop(first);
        assert!(!local.is_connected());
        second.connect_to(Some(local)).unwrap();
    }

    #[test]
    fn test_validation_needs_threshold_consecutive_packets() {
        let (env, _) = environment(threshold(5));
        let (stream, _local) = listener(&env, VideoFormat::Rtp, 1000);

        for seq in 1..=4 {
            stream.on_packet_received(Some(&cvf_packet(seq, &[1u8; 10])));
        }
        assert_ne!(stream.state(), StreamState::Valid);

        // gap: the run starts over
        stream.on_packet_received(Some(&cvf_packet(10, &[1u8; 10])));
        assert_eq!(stream.diagnostics().sequence_mismatch, 1);

        for seq in 11..=14 {
            stream.on_packet_received(Some(&cvf_packet(seq, &[1u8; 10])));
        }
        assert_ne!(stream.state(), StreamState::Valid);

        stream.on_packet_received(Some(&cvf_packet(15, &[1u8; 10])));
        assert_eq!(stream.state(), StreamState::Valid);
        assert_eq!(stream.diagnostics().frames_rx, 10);
    }

    #[test]
    fn test_sequence_break_after_valid() {
        let (env, _) = environment(threshold(2));
        let (stream, local) = listener(&env, VideoFormat::Rtp, 1000);

        stream.on_packet_received(Some(&cvf_packet(1, &[1u8; 10])));
        stream.on_packet_received(Some(&cvf_packet(2, &[1u8; 10])));
        assert_eq!(stream.state(), StreamState::Valid);
        assert_eq!(local.client_state(), crate::stream::ClientState::Active);

        stream.on_packet_received(Some(&cvf_packet(4, &[1u8; 10])));
        assert_eq!(stream.state(), StreamState::InvalidData);
        assert_eq!(local.client_state(), crate::stream::ClientState::Idle);
        assert_eq!(stream.diagnostics().sequence_mismatch, 1);
    }

    #[test]
    fn test_malformed_packets_count_unsupported() {
        let (env, _) = environment(threshold(1));
        let (stream, _local) = listener(&env, VideoFormat::Rtp, 1000);

        stream.on_packet_received(Some(&[0u8; 10]));
        let mut wrong_format = cvf_packet(1, &[0u8; 4]);
        wrong_format[offset::FORMAT] = 0x05;
        stream.on_packet_received(Some(&wrong_format));
        let mut truncated = cvf_packet(1, &[0u8; 40]);
        truncated.truncate(50);
        stream.on_packet_received(Some(&truncated));

        assert_eq!(stream.diagnostics().unsupported_format, 3);
        assert_ne!(stream.state(), StreamState::Valid);
    }

    #[test]
    fn test_always_mode_structural_failure_while_valid() {
        let mut config = threshold(1);
        config.set(keys::VALIDATION_MODE, 2i64);
        let (env, _) = environment(config);
        let (stream, local) = listener(&env, VideoFormat::Rtp, 1000);

        stream.on_packet_received(Some(&cvf_packet(1, &[1u8; 10])));
        stream.on_packet_received(Some(&cvf_packet(2, &[1u8; 10])));
        assert_eq!(stream.state(), StreamState::Valid);

        // in sequence, but not an RFC payload
        let mut wrong_format = cvf_packet(3, &[1u8; 10]);
        wrong_format[offset::FORMAT] = 0x05;
        stream.on_packet_received(Some(&wrong_format));
        assert_eq!(stream.state(), StreamState::InvalidData);
        assert_eq!(local.client_state(), crate::stream::ClientState::Idle);

        let diag = stream.diagnostics();
        assert_eq!(diag.unsupported_format, 1);
        assert_eq!(diag.sequence_mismatch, 0);

        stream.on_packet_received(Some(&cvf_packet(4, &[1u8; 10])));
        assert_eq!(stream.state(), StreamState::Valid);
    }

    #[test]
    fn test_iec61883_packet_without_tag_rejected() {
        let (env, _) = environment(threshold(1));
        let (stream, _local) = listener(&env, VideoFormat::Iec61883, 7 * SOURCE_PACKET_SIZE);

        let mut packet = vec![0u8; AVTP_HEADER_SIZE + CIP_HEADER_SIZE];
        packet[offset::SUBTYPE] = SUBTYPE_IEC61883;
        packet[offset::FLAGS] = IEC61883_FLAGS;
        packet[offset::SEQUENCE] = 1;
        write_u16(&mut packet, offset::STREAM_DATA_LENGTH, CIP_HEADER_SIZE as u16);
        packet[offset::MARKER] = 0x1F;
        packet[offset::TCODE] = IEC61883_TCODE_SY;

        stream.on_packet_received(Some(&packet));
        assert_eq!(stream.diagnostics().unsupported_format, 1);
        assert_ne!(stream.state(), StreamState::Valid);

        packet[offset::SEQUENCE] = 2;
        packet[offset::MARKER] = IEC61883_TAG_CHANNEL;
        stream.on_packet_received(Some(&packet));
        assert_eq!(stream.state(), StreamState::Valid);
        assert_eq!(stream.diagnostics().unsupported_format, 1);
    }

    #[test]
    fn test_never_mode_accepts_everything() {
        let mut config = threshold(1);
        config.set(keys::VALIDATION_MODE, 0i64);
        let (env, _) = environment(config);
        let (stream, _local) = listener(&env, VideoFormat::Rtp, 1000);

        let mut odd = cvf_packet(9, &[0u8; 4]);
        odd[offset::FORMAT] = 0x05;
        stream.on_packet_received(Some(&odd));
        assert_eq!(stream.state(), StreamState::Valid);
        assert_eq!(stream.diagnostics().unsupported_format, 0);
    }

    #[test]
    fn test_no_data_after_valid() {
        let (env, _) = environment(threshold(1));
        let (stream, local) = listener(&env, VideoFormat::Rtp, 1000);

        stream.on_packet_received(Some(&cvf_packet(1, &[5u8; 20])));
        assert_eq!(stream.state(), StreamState::Valid);

        stream.on_packet_received(None);
        assert_eq!(stream.state(), StreamState::NoData);

        let mut dest = [0u8; 1100];
        let mut desc = VideoDesc::default();
        assert_eq!(local.read(&mut dest, &mut desc).unwrap(), ReadStatus::Data(RTP_HEADER_SIZE + 20));
        assert_eq!(local.read(&mut dest, &mut desc).unwrap(), ReadStatus::NoData);
    }

    #[test]
    fn test_dispatch_counts_late_and_early() {
        let mut config = threshold(1);
        config.set(keys::COMPATIBILITY_VIDEO, "D9_1722a");
        let (env, _) = environment(config);
        let (stream, _local) = listener(&env, VideoFormat::Rtp, 1000);

        let mut packet = vec![0u8; 24];
        packet[offset::SUBTYPE] = SUBTYPE_CVF;
        packet[offset::FLAGS] = CVF_FLAGS;
        packet[offset::FORMAT] = CVF_FORMAT_RFC;

        write_u32(&mut packet, offset::TIMESTAMP, (NOW - 1000) as u32);
        stream.dispatch_packet(&packet, NOW);
        write_u32(&mut packet, offset::TIMESTAMP, (NOW + 20_000_000) as u32);
        stream.dispatch_packet(&packet, NOW);
        write_u32(&mut packet, offset::TIMESTAMP, (NOW + 1_000_000) as u32);
        stream.dispatch_packet(&packet, NOW);

        // tv clear: no check
        packet[offset::FLAGS] = 0x80;
        write_u32(&mut packet, offset::TIMESTAMP, 0);
        stream.dispatch_packet(&packet, NOW);

        let diag = stream.diagnostics();
        assert_eq!(diag.late_timestamp, 1);
        assert_eq!(diag.early_timestamp, 1);
        assert_eq!(diag.frames_rx, 4);
    }

    fn cvf_round_trip(compat: &str, expected: Compatibility) {
        let mut config = threshold(1);
        config.set(keys::COMPATIBILITY_VIDEO, compat);
        let (env, _) = environment(config);
        let (tx, tx_local) = talker(&env, VideoFormat::Rtp, 1000, ClockDomain::raw());
        let (rx, rx_local) = listener(&env, VideoFormat::Rtp, 1000);
        assert_eq!(tx.compatibility(), expected);
        assert_eq!(rx.compatibility(), expected);

        let payload: Vec<u8> = (0..200u16).map(|i| i as u8).collect();
        tx_local.write_rtp(&rtp_packet(7, 0x5555_AAAA, true, &payload)).unwrap();
        let packet = tx.prepare_packet().unwrap();
        rx.dispatch_packet(avtp_view(packet.frame()).unwrap(), NOW);
        assert_eq!(rx.state(), StreamState::Valid);

        let mut dest = [0u8; 1100];
        let mut desc = VideoDesc::default();
        let n = RTP_HEADER_SIZE + payload.len();
        assert_eq!(rx_local.read(&mut dest, &mut desc).unwrap(), ReadStatus::Data(n));
        assert_eq!(&dest[..RTP_HEADER_SIZE], &rtp_header(RTP_MPT_MARKER, 7, 0x5555_AAAA, RECEIVE_SSRC));
        assert_eq!(&dest[RTP_HEADER_SIZE..n], payload.as_slice());
        assert_eq!(desc.rtp_sequence, 7);
        assert!(desc.marker());
    }

    #[test]
    fn test_round_trip_cvf_d5() {
        cvf_round_trip("D5_1722a", Compatibility::D5);
    }

    #[test]
    fn test_round_trip_cvf_d9() {
        cvf_round_trip("D9_1722a", Compatibility::D9);
    }

    #[test]
    fn test_round_trip_cvf_current() {
        cvf_round_trip("default", Compatibility::Current);
    }

    fn dummy_reaches_listener(compat: &str, expected: Compatibility) {
        let mut config = threshold(1);
        config.set(keys::COMPATIBILITY_VIDEO, compat);
        let (env, _) = environment(config);
        let (tx, _tx_local) = talker(&env, VideoFormat::Rtp, 1000, ClockDomain::ptp());
        let (rx, _rx_local) = listener(&env, VideoFormat::Rtp, 1000);
        assert_eq!(rx.compatibility(), expected);

        let packet = tx.prepare_packet().unwrap();
        assert!(packet.is_dummy());
        let avtp = avtp_view(packet.frame()).unwrap();
        assert_eq!(avtp.len(), AVTP_HEADER_SIZE);

        rx.on_packet_received(Some(avtp));
        assert_eq!(rx.state(), StreamState::Valid);
        assert_eq!(rx.diagnostics().unsupported_format, 0);
    }

    #[test]
    fn test_dummy_validates_d5() {
        dummy_reaches_listener("D5_1722a", Compatibility::D5);
    }

    #[test]
    fn test_dummy_validates_d9() {
        dummy_reaches_listener("D9_1722a", Compatibility::D9);
    }

    #[test]
    fn test_dummy_validates_current() {
        dummy_reaches_listener("default", Compatibility::Current);
    }

    #[test]
    fn test_oversized_unit_counts_unsupported() {
        let (env, _) = environment(threshold(1));
        let (stream, local) = listener(&env, VideoFormat::Rtp, 1000);

        // fits the packet check, not the local ring
        stream.on_packet_received(Some(&cvf_packet(1, &[9u8; 1200])));
        assert_eq!(stream.state(), StreamState::Valid);
        assert_eq!(stream.diagnostics().unsupported_format, 1);
        assert_eq!(local.buffer().fill_level(), 0);
    }

    #[test]
    fn test_round_trip_iec61883() {
        let (env, _) = environment(threshold(1));
        let size = 7 * SOURCE_PACKET_SIZE;
        let (tx, tx_local) = talker(&env, VideoFormat::Iec61883, size, ClockDomain::raw());
        let (rx, rx_local) = listener(&env, VideoFormat::Iec61883, size);

        let mut tsps = vec![0u8; 2 * TSP_SIZE];
        tsps[0] = 0x47;
        tsps[TSP_SIZE] = 0x47;
        tx_local.write_mpeg_ts(&tsps, false, 1).unwrap();
        let packet = tx.prepare_packet().unwrap();
        rx.dispatch_packet(avtp_view(packet.frame()).unwrap(), NOW);
        assert_eq!(rx.state(), StreamState::Valid);

        let mut dest = [0u8; 2000];
        let mut desc = VideoDesc::default();
        assert_eq!(rx_local.read(&mut dest, &mut desc).unwrap(), ReadStatus::Data(2 * SOURCE_PACKET_SIZE));
        assert!(desc.has_sph);
        assert!(desc.is_iec61883);
        assert_eq!(read_u32(&dest, 0), NOW as u32 + 9_750_000);
        assert_eq!(dest[4], 0x47);
        assert_eq!(dest[SOURCE_PACKET_SIZE + 4], 0x47);
    }

    #[test]
    fn test_rtp_sequence_high_byte_on_wrap() {
        let (env, _) = environment(threshold(1));
        let (stream, local) = listener(&env, VideoFormat::Rtp, 1000);

        stream.on_packet_received(Some(&cvf_packet(255, &[1u8; 4])));
        stream.on_packet_received(Some(&cvf_packet(0, &[2u8; 4])));

        let mut dest = [0u8; 1100];
        let mut desc = VideoDesc::default();
        local.read(&mut dest, &mut desc).unwrap();
        assert_eq!(desc.rtp_sequence, 255);
        local.read(&mut dest, &mut desc).unwrap();
        assert_eq!(desc.rtp_sequence, 0x0100);
    }

    #[test]
    fn test_compatibility_resolution() {
        let mut config = ConfigRegistry::new();
        assert_eq!(Compatibility::resolve(&config, TALKER_ID), Compatibility::Current);

        config.set(keys::COMPATIBILITY_VIDEO, "D9_1722a");
        assert_eq!(Compatibility::resolve(&config, TALKER_ID), Compatibility::D9);

        config.set(format!("{}.{:x}", keys::COMPATIBILITY_VIDEO_H264, TALKER_ID.0), "D5_1722a");
        assert_eq!(Compatibility::resolve(&config, TALKER_ID), Compatibility::D5);
        assert_eq!(Compatibility::resolve(&config, StreamId(1)), Compatibility::D9);
    }

    #[test]
    fn test_validation_config_from_registry() {
        let config = ConfigRegistry::new();
        assert_eq!(ValidationConfig::from_registry(&config), ValidationConfig::default());

        let mut config = ConfigRegistry::new();
        config.set(keys::VALIDATION_MODE, 2i64);
        config.set(keys::VALIDATION_THRESHOLD, 0i64);
        let validation = ValidationConfig::from_registry(&config);
        assert_eq!(validation.mode, ValidationMode::Always);
        assert_eq!(validation.threshold, 1);
    }
}
