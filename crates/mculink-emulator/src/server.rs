//! The emulated device: answers protocol requests and streams telemetry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace, warn};

use mculink_frame::{decode_messages, encode_message, Command, ProtocolMessage, BROADCAST_ID};
use mculink_proto::{
    encode_size_records, ChannelBinding, ChannelMode, ConfigChannel, Control, QueryRegister,
    SizeRecord, TraceLevel, VariableType, WriteRegister,
};
use mculink_transport::{ChunkReceiver, Link};

use crate::registers::EmulatorConfig;

/// Telemetry tick period.
const TELEMETRY_TICK: Duration = Duration::from_millis(10);
/// Channel slots addressable through the 16-bit telemetry mask.
const CHANNEL_SLOTS: u8 = 16;
/// Low-speed channels are sampled every this many ticks.
const LOW_SPEED_DIVISOR: u64 = 20;
/// Waveform registers advance every this many ticks.
const WAVEFORM_DIVISOR: u64 = 5;

const IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport: {0}")]
    Transport(#[from] mculink_transport::TransportError),

    #[error("frame: {0}")]
    Frame(#[from] mculink_frame::FrameError),
}

pub type Result<T> = std::result::Result<T, EmulatorError>;

struct EmuState {
    config: EmulatorConfig,
    epoch: Instant,
    streaming: bool,
    tick: u64,
    decimation: u8,
    terminal: Vec<String>,
}

impl EmuState {
    fn timestamp(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32 & 0x00FF_FFFF
    }
}

/// A running emulated node bound to one transport link.
pub struct Emulator {
    state: Arc<Mutex<EmuState>>,
    stop: Arc<AtomicBool>,
    ingest: Option<JoinHandle<()>>,
    telemetry: Option<JoinHandle<()>>,
}

impl Emulator {
    pub fn start(
        link: Arc<dyn Link>,
        chunks: ChunkReceiver,
        config: EmulatorConfig,
    ) -> Result<Self> {
        let state = Arc::new(Mutex::new(EmuState {
            config,
            epoch: Instant::now(),
            streaming: true,
            tick: 0,
            decimation: 1,
            terminal: Vec::new(),
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let ingest = {
            let link = Arc::clone(&link);
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("mculink-emu-ingest".into())
                .spawn(move || ingest_loop(&*link, &state, &stop, chunks))?
        };

        let telemetry = {
            let link = Arc::clone(&link);
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("mculink-emu-telemetry".into())
                .spawn(move || telemetry_loop(&*link, &state, &stop))?
        };

        Ok(Self {
            state,
            stop,
            ingest: Some(ingest),
            telemetry: Some(telemetry),
        })
    }

    /// Debug strings received from the host, in arrival order.
    pub fn terminal(&self) -> Vec<String> {
        self.lock().terminal.clone()
    }

    pub fn shutdown(mut self) {
        self.stop_threads();
    }

    fn stop_threads(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.ingest.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.telemetry.take() {
            let _ = handle.join();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EmuState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

fn ingest_loop(link: &dyn Link, state: &Mutex<EmuState>, stop: &AtomicBool, chunks: ChunkReceiver) {
    let mut buf = BytesMut::new();
    while !stop.load(Ordering::Relaxed) {
        let chunk = match chunks.recv_timeout(IDLE_POLL) {
            Ok(chunk) => chunk,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        buf.extend_from_slice(&chunk);
        for msg in decode_messages(&mut buf) {
            let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            handle_message(&mut state, link, &msg);
        }
    }
}

fn telemetry_loop(link: &dyn Link, state: &Mutex<EmuState>, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(TELEMETRY_TICK);
        let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.streaming {
            continue;
        }
        state.tick += 1;
        let tick = state.tick;

        if tick % WAVEFORM_DIVISOR == 0 {
            for register in state.config.registers.iter_mut() {
                register.step(tick);
            }
        }

        let low_speed_due = tick % LOW_SPEED_DIVISOR == 0;
        let payload = telemetry_payload(&state, low_speed_due);
        if let Some(payload) = payload {
            let msg = ProtocolMessage::new(
                state.config.node_id,
                0,
                Command::ReadChannelData,
                payload,
            );
            transmit(link, &msg);
        }
    }
}

/// One telemetry frame covering channels due this tick, values packed in
/// ascending channel order. `None` when nothing is due.
fn telemetry_payload(state: &EmuState, include_low_speed: bool) -> Option<Vec<u8>> {
    let mut mask = 0u16;
    let mut values = Vec::new();
    let mut bound: Vec<_> = state
        .config
        .registers
        .iter()
        .filter(|r| r.channel.is_some())
        .filter(|r| {
            r.mode == ChannelMode::OnChange || (include_low_speed && r.mode == ChannelMode::LowSpeed)
        })
        .collect();
    bound.sort_by_key(|r| r.channel);
    for register in bound {
        let channel = register.channel.unwrap_or(0);
        mask |= 1 << channel;
        values.extend_from_slice(&register.value);
    }
    if mask == 0 {
        return None;
    }

    let timestamp = state.timestamp();
    let mut payload = vec![
        timestamp as u8,
        (timestamp >> 8) as u8,
        (timestamp >> 16) as u8,
    ];
    payload.extend_from_slice(&mask.to_le_bytes());
    payload.extend_from_slice(&values);
    Some(payload)
}

fn transmit(link: &dyn Link, msg: &ProtocolMessage) {
    match encode_message(msg) {
        Ok(frame) => {
            if let Err(e) = link.transmit(&frame) {
                warn!(error = %e, "emulator transmit failed");
            }
        }
        Err(e) => warn!(error = %e, "emulator cannot encode message"),
    }
}

fn reply(link: &dyn Link, state: &EmuState, msg_id: u8, command: Command, payload: impl Into<Bytes>) {
    let msg = ProtocolMessage::new(state.config.node_id, msg_id, command, payload);
    transmit(link, &msg);
}

fn send_trace(link: &dyn Link, state: &EmuState, level: TraceLevel, text: &str) {
    let mut payload = vec![level as u8];
    payload.extend_from_slice(text.as_bytes());
    reply(link, state, 0, Command::Tracing, payload);
}

fn handle_message(state: &mut EmuState, link: &dyn Link, msg: &ProtocolMessage) {
    if !msg.is_valid() {
        trace!(reason = msg.invalid_reason.as_deref().unwrap_or(""), "emulator ignoring invalid frame");
        return;
    }
    if msg.controller_id != state.config.node_id && msg.controller_id != BROADCAST_ID {
        return;
    }

    match msg.command {
        Some(Command::GetVersion) => {
            send_trace(link, state, TraceLevel::Debug, "version requested");
            let payload = state.config.identity.to_payload();
            reply(link, state, msg.msg_id, Command::GetVersion, payload);
        }
        Some(Command::GetInfo) => {
            reply(link, state, msg.msg_id, Command::GetInfo, size_table());
        }
        Some(Command::WriteRegister) => handle_write(state, link, msg),
        Some(Command::QueryRegister) => handle_query(state, link, msg),
        Some(Command::ConfigChannel) => handle_config_channel(state, link, msg),
        Some(Command::Decimation) => {
            if let Some(&decimation) = msg.payload.first() {
                state.decimation = decimation;
            }
            let current = state.decimation;
            reply(link, state, msg.msg_id, Command::Decimation, vec![current]);
        }
        Some(Command::ResetTime) => {
            state.epoch = Instant::now();
            reply(link, state, msg.msg_id, Command::ResetTime, Bytes::new());
        }
        Some(Command::ReadChannelData) => handle_read_channel_data(state, link, msg),
        Some(Command::DebugString) => {
            let text = String::from_utf8_lossy(&msg.payload).into_owned();
            debug!(%text, "debug string from host");
            state.terminal.push(text);
            reply(link, state, msg.msg_id, Command::DebugString, Bytes::new());
        }
        Some(Command::Tracing) | Some(Command::EmbeddedConfiguration) | None => {}
    }
}

fn size_table() -> Vec<u8> {
    let mut records = vec![
        SizeRecord {
            var_type: VariableType::MemoryAlignment,
            size: 1,
        },
        SizeRecord {
            var_type: VariableType::Pointer,
            size: 4,
        },
        SizeRecord {
            var_type: VariableType::Bool,
            size: 1,
        },
        SizeRecord {
            var_type: VariableType::Short,
            size: 2,
        },
        SizeRecord {
            var_type: VariableType::Int,
            size: 4,
        },
        SizeRecord {
            var_type: VariableType::Long,
            size: 8,
        },
        SizeRecord {
            var_type: VariableType::Float,
            size: 4,
        },
        SizeRecord {
            var_type: VariableType::Double,
            size: 8,
        },
    ];
    // Timestamp unit in µs, not a byte size.
    records.push(SizeRecord {
        var_type: VariableType::TimeStamp,
        size: 1000,
    });
    encode_size_records(&records)
}

fn handle_write(state: &mut EmuState, link: &dyn Link, msg: &ProtocolMessage) {
    let request = match WriteRegister::from_payload(&msg.payload) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "bad write request");
            return;
        }
    };
    let version = state.config.identity.protocol;
    let control = match Control::unpack(version, request.control) {
        Ok(control) => control,
        Err(e) => {
            debug!(error = %e, "bad write control byte");
            return;
        }
    };

    let status = match state.config.registers.iter_mut().find(|r| {
        r.offset == request.offset
            && r.direction == control.direction
            && r.deref_depth == control.deref_depth
            && usize::from(r.size) == request.value.len()
    }) {
        Some(register) => {
            register.value = request.value;
            0x00
        }
        None => 0x01,
    };
    reply(link, state, msg.msg_id, Command::WriteRegister, vec![status]);
}

fn handle_query(state: &mut EmuState, link: &dyn Link, msg: &ProtocolMessage) {
    let request = match QueryRegister::from_payload(&msg.payload) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "bad query request");
            return;
        }
    };
    let version = state.config.identity.protocol;
    let control = match Control::unpack(version, request.control) {
        Ok(control) => control,
        Err(e) => {
            debug!(error = %e, "bad query control byte");
            return;
        }
    };

    let response = state
        .config
        .registers
        .iter()
        .find(|r| {
            r.offset == request.offset
                && r.direction == control.direction
                && r.deref_depth == control.deref_depth
                && r.size == request.size
        })
        .map(|register| QueryRegister {
            offset: request.offset,
            control: request.control,
            size: register.value.len() as u8,
            value: register.value.clone(),
        });
    match response {
        Some(response) => {
            let payload = response.to_payload();
            reply(link, state, msg.msg_id, Command::QueryRegister, payload);
        }
        // Unknown register: echo the request so the host sees an empty read.
        None => reply(
            link,
            state,
            msg.msg_id,
            Command::QueryRegister,
            msg.payload.clone(),
        ),
    }
}

fn handle_config_channel(state: &mut EmuState, link: &dyn Link, msg: &ProtocolMessage) {
    let request = match ConfigChannel::from_payload(&msg.payload) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "bad channel config");
            reply(link, state, msg.msg_id, Command::ConfigChannel, vec![0u8; 8]);
            return;
        }
    };
    let version = state.config.identity.protocol;
    let channel = request.channel;
    if channel >= CHANNEL_SLOTS {
        debug!(channel, "channel index beyond the mask range");
        reply(link, state, msg.msg_id, Command::ConfigChannel, vec![0u8; 8]);
        return;
    }

    let response = match (request.mode, request.binding) {
        // Query: echo the current binding of the slot.
        (None, _) => state
            .config
            .registers
            .iter()
            .find(|r| r.channel == Some(channel))
            .and_then(|r| {
                let control = r.control().pack(version).ok()?;
                Some(
                    ConfigChannel::bind(
                        channel,
                        r.mode,
                        ChannelBinding {
                            offset: r.offset,
                            control,
                            size: r.size,
                        },
                    )
                    .to_payload(),
                )
            }),
        // Mode change. Off releases the slot. Echoed even when the slot
        // was already free, the host resets all slots after discovery.
        (Some(mode), None) => {
            if let Some(register) = state
                .config
                .registers
                .iter_mut()
                .find(|r| r.channel == Some(channel))
            {
                register.mode = mode;
                if mode == ChannelMode::Off {
                    register.channel = None;
                }
            }
            Some(ConfigChannel::set_mode(channel, mode).to_payload())
        }
        // Full binding: release the slot, then bind the matching register.
        (Some(mode), Some(binding)) => {
            for register in state.config.registers.iter_mut() {
                if register.channel == Some(channel) {
                    register.channel = None;
                    register.mode = ChannelMode::Off;
                }
            }
            state
                .config
                .registers
                .iter_mut()
                .find(|r| {
                    r.offset == binding.offset
                        && r.size == binding.size
                        && r.control().pack(version).ok() == Some(binding.control)
                })
                .map(|register| {
                    register.channel = Some(channel);
                    register.mode = mode;
                    ConfigChannel::bind(channel, mode, binding).to_payload()
                })
        }
    };

    let payload = response.unwrap_or_else(|| vec![0u8; 8]);
    reply(link, state, msg.msg_id, Command::ConfigChannel, payload);
}

fn handle_read_channel_data(state: &mut EmuState, link: &dyn Link, msg: &ProtocolMessage) {
    match msg.payload.first() {
        Some(0x00) => {
            state.streaming = false;
            reply(link, state, msg.msg_id, Command::ReadChannelData, Bytes::new());
        }
        Some(0x01) => {
            state.streaming = true;
            reply(link, state, msg.msg_id, Command::ReadChannelData, Bytes::new());
        }
        // One-shot: sample every channel configured as Once.
        Some(0x02) => {
            let mut mask = 0u16;
            let mut values = Vec::new();
            let mut once: Vec<_> = state
                .config
                .registers
                .iter()
                .filter(|r| r.channel.is_some() && r.mode == ChannelMode::Once)
                .collect();
            once.sort_by_key(|r| r.channel);
            for register in once {
                mask |= 1 << register.channel.unwrap_or(0);
                values.extend_from_slice(&register.value);
            }
            let timestamp = state.timestamp();
            let mut payload = vec![
                timestamp as u8,
                (timestamp >> 8) as u8,
                (timestamp >> 16) as u8,
            ];
            payload.extend_from_slice(&mask.to_le_bytes());
            payload.extend_from_slice(&values);
            reply(link, state, msg.msg_id, Command::ReadChannelData, payload);
        }
        _ => reply(link, state, msg.msg_id, Command::ReadChannelData, Bytes::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mculink_proto::{Direction, FirmwareVersion, ValueSource, VersionInfo};
    use mculink_transport::MemoryLink;

    fn test_state() -> EmuState {
        EmuState {
            config: EmulatorConfig::demo(1),
            epoch: Instant::now(),
            streaming: true,
            tick: 0,
            decimation: 1,
            terminal: Vec::new(),
        }
    }

    fn test_link() -> (Arc<dyn Link>, ChunkReceiver) {
        let ((device, _device_rx), (_host, host_rx)) = MemoryLink::pair();
        (Arc::new(device), host_rx)
    }

    fn replies(rx: &ChunkReceiver) -> Vec<ProtocolMessage> {
        let mut buf = BytesMut::new();
        while let Ok(chunk) = rx.try_recv() {
            buf.extend_from_slice(&chunk);
        }
        decode_messages(&mut buf)
    }

    #[test]
    fn version_request_answers_identity() {
        let (link, host_rx) = test_link();
        let mut state = test_state();
        handle_message(
            &mut state,
            &*link,
            &ProtocolMessage::new(BROADCAST_ID, 0, Command::GetVersion, Bytes::new()),
        );
        let msgs = replies(&host_rx);
        let version = msgs
            .iter()
            .find(|m| m.command == Some(Command::GetVersion))
            .expect("version reply");
        let info = VersionInfo::from_payload(&version.payload).unwrap();
        assert_eq!(info.name, "mculink-emu");
        assert_eq!(info.protocol, FirmwareVersion::V1_0);
    }

    #[test]
    fn write_updates_matching_register() {
        let (link, host_rx) = test_link();
        let mut state = test_state();

        // setpoint at 0x2004, ReadWrite Int, size 4
        let control = Control::new(Direction::ReadWrite, ValueSource::ElfParsed, 0)
            .pack(FirmwareVersion::V1_0)
            .unwrap();
        let payload = WriteRegister {
            offset: 0x2004,
            control,
            value: 7i32.to_le_bytes().to_vec(),
        }
        .to_payload();
        handle_message(
            &mut state,
            &*link,
            &ProtocolMessage::new(1, 3, Command::WriteRegister, payload),
        );

        let register = state
            .config
            .registers
            .iter()
            .find(|r| r.offset == 0x2004)
            .unwrap();
        assert_eq!(register.value, 7i32.to_le_bytes().to_vec());

        let msgs = replies(&host_rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg_id, 3);
        assert_eq!(&msgs[0].payload[..], &[0x00]);
    }

    #[test]
    fn write_to_unknown_register_reports_failure_status() {
        let (link, host_rx) = test_link();
        let mut state = test_state();

        let control = Control::new(Direction::Write, ValueSource::ElfParsed, 0)
            .pack(FirmwareVersion::V1_0)
            .unwrap();
        let payload = WriteRegister {
            offset: 0xDEAD,
            control,
            value: vec![1],
        }
        .to_payload();
        handle_message(
            &mut state,
            &*link,
            &ProtocolMessage::new(1, 1, Command::WriteRegister, payload),
        );
        let msgs = replies(&host_rx);
        assert_eq!(&msgs[0].payload[..], &[0x01]);
    }

    #[test]
    fn query_returns_register_value() {
        let (link, host_rx) = test_link();
        let mut state = test_state();
        state
            .config
            .registers
            .iter_mut()
            .find(|r| r.offset == 0x1000)
            .unwrap()
            .value = 99u32.to_le_bytes().to_vec();

        let control = Control::new(Direction::Read, ValueSource::ElfParsed, 0)
            .pack(FirmwareVersion::V1_0)
            .unwrap();
        let payload = QueryRegister::request(0x1000, control, 4).to_payload();
        handle_message(
            &mut state,
            &*link,
            &ProtocolMessage::new(1, 5, Command::QueryRegister, payload),
        );

        let msgs = replies(&host_rx);
        let response = QueryRegister::from_payload(&msgs[0].payload).unwrap();
        assert_eq!(response.size, 4);
        assert_eq!(response.value, 99u32.to_le_bytes().to_vec());
    }

    #[test]
    fn channel_binding_echoes_and_feeds_telemetry() {
        let (link, host_rx) = test_link();
        let mut state = test_state();

        let control = Control::new(Direction::Read, ValueSource::ElfParsed, 0)
            .pack(FirmwareVersion::V1_0)
            .unwrap();
        let payload = ConfigChannel::bind(
            2,
            ChannelMode::OnChange,
            ChannelBinding {
                offset: 0x1004,
                control,
                size: 1,
            },
        )
        .to_payload();
        handle_message(
            &mut state,
            &*link,
            &ProtocolMessage::new(1, 7, Command::ConfigChannel, payload.clone()),
        );

        let msgs = replies(&host_rx);
        assert_eq!(&msgs[0].payload[..], &payload[..]);

        let frame = telemetry_payload(&state, false).expect("telemetry due");
        let mask = u16::from_le_bytes([frame[3], frame[4]]);
        assert_eq!(mask, 1 << 2);
        assert_eq!(frame.len(), 5 + 1);
    }

    #[test]
    fn bind_beyond_the_mask_range_is_refused() {
        let (link, host_rx) = test_link();
        let mut state = test_state();

        let control = Control::new(Direction::Read, ValueSource::ElfParsed, 0)
            .pack(FirmwareVersion::V1_0)
            .unwrap();
        let payload = ConfigChannel::bind(
            20,
            ChannelMode::OnChange,
            ChannelBinding {
                offset: 0x1004,
                control,
                size: 1,
            },
        )
        .to_payload();
        handle_message(
            &mut state,
            &*link,
            &ProtocolMessage::new(1, 4, Command::ConfigChannel, payload),
        );

        let msgs = replies(&host_rx);
        assert_eq!(&msgs[0].payload[..], &[0u8; 8]);
        assert!(state.config.registers.iter().all(|r| r.channel.is_none()));
        assert!(telemetry_payload(&state, true).is_none());
    }

    #[test]
    fn turning_a_channel_off_releases_it() {
        let (link, host_rx) = test_link();
        let mut state = test_state();
        state.config.registers[0].channel = Some(0);
        state.config.registers[0].mode = ChannelMode::OnChange;

        handle_message(
            &mut state,
            &*link,
            &ProtocolMessage::new(1, 2, Command::ConfigChannel, vec![0u8, 0u8]),
        );
        assert_eq!(state.config.registers[0].channel, None);
        assert!(telemetry_payload(&state, true).is_none());

        let msgs = replies(&host_rx);
        assert_eq!(&msgs[0].payload[..], &[0, 0]);
    }

    #[test]
    fn once_channels_sample_on_request() {
        let (link, host_rx) = test_link();
        let mut state = test_state();
        state.config.registers[1].channel = Some(4);
        state.config.registers[1].mode = ChannelMode::Once;
        state.config.registers[1].value = vec![0x5A];

        handle_message(
            &mut state,
            &*link,
            &ProtocolMessage::new(1, 9, Command::ReadChannelData, vec![0x02]),
        );
        let msgs = replies(&host_rx);
        let mask = u16::from_le_bytes([msgs[0].payload[3], msgs[0].payload[4]]);
        assert_eq!(mask, 1 << 4);
        assert_eq!(msgs[0].payload[5], 0x5A);
    }

    #[test]
    fn messages_for_other_nodes_are_ignored() {
        let (link, host_rx) = test_link();
        let mut state = test_state();
        handle_message(
            &mut state,
            &*link,
            &ProtocolMessage::new(9, 0, Command::GetVersion, Bytes::new()),
        );
        assert!(replies(&host_rx).is_empty());
    }
}
