//! The session engine: ingest loop, ACK correlation, resend sweep and
//! command dispatch.
//!
//! Two background threads run per session. The ingest thread drains raw
//! chunks from the transport, carries the decode remainder across chunks
//! and dispatches every message. The resend thread sweeps the pending-ACK
//! set on a fixed tick. Both share one mutex over the whole session state
//! and stop cooperatively via an atomic flag.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use mculink_frame::{decode_messages, encode_message, Command, ProtocolMessage, BROADCAST_ID};
use mculink_proto::{
    parse_size_records, ChannelBinding, ChannelData, ChannelMode, ConfigChannel, Control,
    DebugString, Decimation, Direction, QueryRegister, RegisterValue, TraceEvent, VariableType,
    VersionInfo, WriteRegister,
};
use mculink_transport::{ChunkReceiver, Link};

use crate::error::{Result, SessionError};
use crate::node::{CpuNode, NodeSnapshot, Register, MAX_CHANNELS};
use crate::notify::{Notification, Notifier};

/// Resend sweep period.
pub const RESEND_TICK: Duration = Duration::from_millis(100);
/// Ticks a pending message may sit unacknowledged before it is resent.
pub const ACK_TIMEOUT_TICKS: u32 = 20;

const IDLE_POLL: Duration = Duration::from_millis(10);

struct Pending {
    message: ProtocolMessage,
    ticks: u32,
}

struct State {
    connected: bool,
    nodes: BTreeMap<u8, CpuNode>,
    msg_ids: HashMap<u8, u8>,
    pending: Vec<Pending>,
    decimation: u8,
    notifier: Notifier,
}

impl State {
    fn new() -> Self {
        Self {
            connected: true,
            nodes: BTreeMap::new(),
            msg_ids: HashMap::new(),
            pending: Vec::new(),
            decimation: 0,
            notifier: Notifier::default(),
        }
    }

    /// Ends the transport session: no more sends, nothing left to
    /// retransmit. Discovered nodes stay, they are a read model for the
    /// host application.
    fn drop_connection(&mut self) {
        self.connected = false;
        self.msg_ids.clear();
        self.pending.clear();
    }

    /// Next message id for a node, skipping zero. Unknown nodes (and
    /// broadcasts) get id 0, which means no ACK is expected.
    fn next_msg_id(&mut self, node_id: u8) -> u8 {
        match self.msg_ids.get_mut(&node_id) {
            Some(counter) => {
                *counter = counter.wrapping_add(1);
                if *counter == 0 {
                    *counter = 1;
                }
                *counter
            }
            None => 0,
        }
    }
}

/// A running protocol session over one transport link.
pub struct Session {
    link: Arc<dyn Link>,
    state: Arc<Mutex<State>>,
    stop: Arc<AtomicBool>,
    ingest: Option<JoinHandle<()>>,
    resend: Option<JoinHandle<()>>,
}

impl Session {
    /// Starts the engine over `link`, consuming the chunk stream the
    /// transport feeds into `chunks`.
    pub fn start(link: Arc<dyn Link>, chunks: ChunkReceiver) -> Result<Self> {
        let state = Arc::new(Mutex::new(State::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let ingest = {
            let link = Arc::clone(&link);
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("mculink-ingest".into())
                .spawn(move || ingest_loop(&*link, &state, &stop, chunks))?
        };

        let resend = {
            let link = Arc::clone(&link);
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("mculink-resend".into())
                .spawn(move || resend_loop(&*link, &state, &stop))?
        };

        Ok(Self {
            link,
            state,
            stop,
            ingest: Some(ingest),
            resend: Some(resend),
        })
    }

    /// Registers a notification subscriber.
    pub fn subscribe(&self) -> mpsc::Receiver<Notification> {
        self.lock().notifier.subscribe()
    }

    /// Broadcasts a version request to all nodes. Responses from unknown
    /// controller ids create nodes.
    pub fn discover(&self) -> Result<()> {
        let mut state = self.lock();
        let msg = message(&mut state, BROADCAST_ID, Command::GetVersion, Bytes::new());
        send(&mut state, &*self.link, msg)
    }

    pub fn get_version(&self, node_id: u8) -> Result<()> {
        let mut state = self.lock();
        let msg = message(&mut state, node_id, Command::GetVersion, Bytes::new());
        send(&mut state, &*self.link, msg)
    }

    pub fn get_info(&self, node_id: u8) -> Result<()> {
        let mut state = self.lock();
        let msg = message(&mut state, node_id, Command::GetInfo, Bytes::new());
        send(&mut state, &*self.link, msg)
    }

    /// Writes `value` to the register at `(offset, direction)`. The
    /// register must be known so the control byte can be built from its
    /// attributes.
    pub fn write_register(
        &self,
        node_id: u8,
        offset: u32,
        direction: Direction,
        value: &[u8],
    ) -> Result<()> {
        let mut state = self.lock();
        let control = register_control(&mut state, node_id, offset, direction)?;
        let payload = WriteRegister {
            offset,
            control,
            value: value.to_vec(),
        }
        .to_payload();
        let msg = message(&mut state, node_id, Command::WriteRegister, payload);
        send(&mut state, &*self.link, msg)
    }

    /// Requests the current value of a register once. Registers of
    /// unknown type are skipped, there is no way to size their reply.
    pub fn query_register(&self, node_id: u8, offset: u32, direction: Direction) -> Result<()> {
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(&node_id)
            .ok_or(SessionError::UnknownNode(node_id))?;
        let version = node.protocol_version;
        let register = node
            .registers
            .get(offset, direction)
            .ok_or(SessionError::UnknownRegister {
                node_id,
                offset,
                direction,
            })?;
        if register.var_type == VariableType::Unknown {
            debug!(node_id, offset, "skipping query of register with unknown type");
            return Ok(());
        }
        let control = register.control().pack(version)?;
        let size = register.size;
        let payload = QueryRegister::request(offset, control, size).to_payload();
        let msg = message(&mut state, node_id, Command::QueryRegister, payload);
        send(&mut state, &*self.link, msg)
    }

    /// Asks a node for the current configuration of one channel slot.
    pub fn query_channel(&self, node_id: u8, channel: u8) -> Result<()> {
        let mut state = self.lock();
        let payload = ConfigChannel::query(channel).to_payload();
        let msg = message(&mut state, node_id, Command::ConfigChannel, payload);
        send(&mut state, &*self.link, msg)
    }

    /// Binds a register to the first free channel slot and configures it
    /// on the node. Returns the slot index.
    pub fn bind_channel(
        &self,
        node_id: u8,
        offset: u32,
        direction: Direction,
        mode: ChannelMode,
    ) -> Result<u8> {
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(&node_id)
            .ok_or(SessionError::UnknownNode(node_id))?;
        let version = node.protocol_version;
        let register = node
            .registers
            .get(offset, direction)
            .ok_or(SessionError::UnknownRegister {
                node_id,
                offset,
                direction,
            })?;
        let control = register.control().pack(version)?;
        let size = register.size;
        let channel = node
            .channels
            .allocate((offset, direction))
            .ok_or(SessionError::NoFreeChannel(node_id))?;

        let payload = ConfigChannel::bind(
            channel,
            mode,
            ChannelBinding {
                offset,
                control,
                size,
            },
        )
        .to_payload();
        let msg = message(&mut state, node_id, Command::ConfigChannel, payload);
        if let Err(e) = send(&mut state, &*self.link, msg) {
            // A slot the node never heard about must not stay reserved.
            if let Some(node) = state.nodes.get_mut(&node_id) {
                node.channels.release(channel);
            }
            return Err(e);
        }
        Ok(channel)
    }

    /// Changes the mode of a bound channel. `Off` releases the slot.
    pub fn set_channel_mode(
        &self,
        node_id: u8,
        channel: u8,
        mode: ChannelMode,
    ) -> Result<()> {
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(&node_id)
            .ok_or(SessionError::UnknownNode(node_id))?;
        if node.channels.bound(channel).is_none() {
            return Err(SessionError::ChannelNotBound {
                node_id,
                channel,
            });
        }
        if mode == ChannelMode::Off {
            node.channels.release(channel);
        }
        let payload = ConfigChannel::set_mode(channel, mode).to_payload();
        let msg = message(&mut state, node_id, Command::ConfigChannel, payload);
        send(&mut state, &*self.link, msg)
    }

    /// Sets the telemetry decimation factor on a node.
    pub fn set_decimation(&self, node_id: u8, decimation: u8) -> Result<()> {
        let mut state = self.lock();
        let payload = Decimation(decimation).to_payload();
        let msg = message(&mut state, node_id, Command::Decimation, payload);
        send(&mut state, &*self.link, msg)
    }

    /// Queries the current decimation factor of a node.
    pub fn query_decimation(&self, node_id: u8) -> Result<()> {
        let mut state = self.lock();
        let msg = message(&mut state, node_id, Command::Decimation, Bytes::new());
        send(&mut state, &*self.link, msg)
    }

    /// Resets the telemetry clock on one node, or on all nodes when
    /// `node_id` is `None`.
    pub fn reset_time(&self, node_id: Option<u8>) -> Result<()> {
        let mut state = self.lock();
        let msg = match node_id {
            Some(id) => message(&mut state, id, Command::ResetTime, Bytes::new()),
            None => ProtocolMessage::new(BROADCAST_ID, 0, Command::ResetTime, Bytes::new()),
        };
        send(&mut state, &*self.link, msg)
    }

    /// Sends terminal input to a node.
    pub fn send_debug_string(&self, node_id: u8, text: &str) -> Result<()> {
        let mut state = self.lock();
        let payload = DebugString(text.to_owned()).to_payload();
        let msg = message(&mut state, node_id, Command::DebugString, payload);
        send(&mut state, &*self.link, msg)
    }

    /// Adds a register definition to a discovered node. The host
    /// application owns register knowledge; the protocol itself never
    /// enumerates them.
    pub fn add_register(&self, node_id: u8, register: Register) -> Result<()> {
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(&node_id)
            .ok_or(SessionError::UnknownNode(node_id))?;
        node.registers.insert(register);
        Ok(())
    }

    /// Latest value seen for a register, if any.
    pub fn register_value(
        &self,
        node_id: u8,
        offset: u32,
        direction: Direction,
    ) -> Option<(RegisterValue, Option<u32>)> {
        let mut state = self.lock();
        let node = state.nodes.get_mut(&node_id)?;
        let register = node.registers.get(offset, direction)?;
        register.value.clone().map(|v| (v, register.timestamp))
    }

    pub fn node_ids(&self) -> Vec<u8> {
        self.lock().nodes.keys().copied().collect()
    }

    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.lock().nodes.values().map(CpuNode::snapshot).collect()
    }

    /// Accumulated terminal output of a node.
    pub fn terminal(&self, node_id: u8) -> Result<String> {
        let state = self.lock();
        state
            .nodes
            .get(&node_id)
            .map(|node| node.terminal.clone())
            .ok_or(SessionError::UnknownNode(node_id))
    }

    pub fn decimation(&self) -> u8 {
        self.lock().decimation
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Drops transport session state. Pending retransmissions and message
    /// id counters are cleared; discovered nodes are kept, they are a
    /// read model for the host application.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.drop_connection();
        debug!("session disconnected");
    }

    /// Stops both background threads. They exit within one poll interval.
    pub fn shutdown(mut self) {
        self.stop_threads();
    }

    fn stop_threads(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.ingest.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.resend.take() {
            let _ = handle.join();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

fn message(state: &mut State, node_id: u8, command: Command, payload: impl Into<Bytes>) -> ProtocolMessage {
    let msg_id = if node_id == BROADCAST_ID {
        0
    } else {
        state.next_msg_id(node_id)
    };
    ProtocolMessage::new(node_id, msg_id, command, payload)
}

/// Encodes and transmits, registering the message for retransmission
/// when it carries a non-zero id.
fn send(state: &mut State, link: &dyn Link, msg: ProtocolMessage) -> Result<()> {
    if !state.connected {
        return Err(SessionError::NotConnected);
    }
    let frame = encode_message(&msg)?;
    if msg.msg_id != 0 {
        state.pending.push(Pending {
            message: msg,
            ticks: 0,
        });
    }
    link.transmit(&frame)?;
    Ok(())
}

fn register_control(
    state: &mut State,
    node_id: u8,
    offset: u32,
    direction: Direction,
) -> Result<u8> {
    let node = state
        .nodes
        .get_mut(&node_id)
        .ok_or(SessionError::UnknownNode(node_id))?;
    let version = node.protocol_version;
    let register = node
        .registers
        .get(offset, direction)
        .ok_or(SessionError::UnknownRegister {
            node_id,
            offset,
            direction,
        })?;
    Ok(register.control().pack(version)?)
}

fn ingest_loop(
    link: &dyn Link,
    state: &Mutex<State>,
    stop: &AtomicBool,
    chunks: ChunkReceiver,
) {
    let mut buf = BytesMut::new();
    while !stop.load(Ordering::Relaxed) {
        let chunk = match chunks.recv_timeout(IDLE_POLL) {
            Ok(chunk) => chunk,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("chunk source closed, ingest loop ending");
                let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                state.drop_connection();
                break;
            }
        };
        buf.extend_from_slice(&chunk);
        let messages = decode_messages(&mut buf);
        if messages.is_empty() {
            continue;
        }
        let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for msg in messages {
            handle_message(&mut state, link, msg);
        }
    }
}

fn resend_loop(link: &dyn Link, state: &Mutex<State>, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(RESEND_TICK);
        let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.connected {
            continue;
        }
        resend_sweep(&mut state, link);
    }
}

/// One resend tick: age every pending message and retransmit those past
/// the threshold with their original msg id.
fn resend_sweep(state: &mut State, link: &dyn Link) {
    for pending in &mut state.pending {
        pending.ticks += 1;
        if pending.ticks > ACK_TIMEOUT_TICKS {
            pending.ticks = 0;
            match encode_message(&pending.message) {
                Ok(frame) => {
                    trace!(
                        controller_id = pending.message.controller_id,
                        msg_id = pending.message.msg_id,
                        "resending unacknowledged message"
                    );
                    if let Err(e) = link.transmit(&frame) {
                        warn!(error = %e, "resend failed");
                    }
                }
                Err(e) => warn!(error = %e, "cannot encode pending message"),
            }
        }
    }
}

fn handle_message(state: &mut State, link: &dyn Link, mut msg: ProtocolMessage) {
    if msg.is_valid() {
        if let Some(pos) = state.pending.iter().position(|p| {
            p.message.controller_id == msg.controller_id
                && p.message.msg_id == msg.msg_id
                && p.message.command == msg.command
        }) {
            state.pending.remove(pos);
            msg.is_ack = true;
        }

        if let Some(reason) = dispatch(state, link, &msg) {
            debug!(
                controller_id = msg.controller_id,
                command = ?msg.command,
                reason,
                "dispatch failed"
            );
            msg.invalid_reason = Some(reason);
        }
    } else {
        trace!(
            controller_id = msg.controller_id,
            reason = msg.invalid_reason.as_deref().unwrap_or(""),
            "invalid frame"
        );
    }

    if let Some(node) = state.nodes.get_mut(&msg.controller_id) {
        node.message_count += 1;
        if !msg.is_valid() {
            node.invalid_count += 1;
        }
    }
}

/// Routes a valid message to its handler. A returned string marks the
/// message invalid without stopping the loop.
fn dispatch(state: &mut State, link: &dyn Link, msg: &ProtocolMessage) -> Option<String> {
    match msg.command {
        Some(Command::GetVersion) => dispatch_version(state, link, msg),
        Some(Command::GetInfo) => dispatch_info(state, msg),
        Some(Command::WriteRegister) => dispatch_write_register(msg),
        Some(Command::QueryRegister) => dispatch_query_register(state, msg),
        Some(Command::ConfigChannel) => dispatch_config_channel(msg),
        Some(Command::Decimation) => dispatch_decimation(state, msg),
        Some(Command::ResetTime) => None,
        Some(Command::ReadChannelData) => dispatch_channel_data(state, msg),
        Some(Command::DebugString) => dispatch_debug_string(state, msg),
        Some(Command::Tracing) => dispatch_trace(state, msg),
        // Recognized so frames carrying it stay valid; nothing to do.
        Some(Command::EmbeddedConfiguration) => None,
        None => Some("message has no command".to_owned()),
    }
}

fn dispatch_version(state: &mut State, link: &dyn Link, msg: &ProtocolMessage) -> Option<String> {
    let info = match VersionInfo::from_payload(&msg.payload) {
        Ok(info) => info,
        Err(e) => return Some(e.to_string()),
    };
    let id = msg.controller_id;
    if id == BROADCAST_ID {
        return Some("broadcast id cannot identify a node".to_owned());
    }
    if state.nodes.contains_key(&id) {
        return Some("node already known".to_owned());
    }

    debug!(node_id = id, name = %info.name, version = %info.protocol, "node discovered");
    state.nodes.insert(id, CpuNode::new(id, &info));
    state.msg_ids.insert(id, 0);
    state.notifier.publish(Notification::NodeDiscovered {
        node_id: id,
        info,
    });

    // Ask for the node's size table and reset every channel slot.
    let follow_up = message(state, id, Command::GetInfo, Bytes::new());
    if let Err(e) = send(state, link, follow_up) {
        warn!(error = %e, "info request after discovery failed");
    }
    for channel in 0..MAX_CHANNELS as u8 {
        let payload =
            ConfigChannel::set_mode(channel, ChannelMode::Off).to_payload();
        let off = message(state, id, Command::ConfigChannel, payload);
        if let Err(e) = send(state, link, off) {
            warn!(error = %e, channel, "channel reset after discovery failed");
        }
    }
    None
}

fn dispatch_info(state: &mut State, msg: &ProtocolMessage) -> Option<String> {
    let records = match parse_size_records(&msg.payload) {
        Ok(records) => records,
        Err(e) => return Some(e.to_string()),
    };
    let node = match state.nodes.get_mut(&msg.controller_id) {
        Some(node) => node,
        None => return Some("no node found for message".to_owned()),
    };
    for record in records {
        node.sizes.insert(record.var_type, record.size);
    }
    None
}

fn dispatch_write_register(msg: &ProtocolMessage) -> Option<String> {
    let status = match msg.payload.first() {
        Some(&status) => status,
        None => return Some("message too short for write register".to_owned()),
    };
    if status != 0 {
        debug!(controller_id = msg.controller_id, status, "write rejected by node");
    }
    None
}

fn dispatch_query_register(state: &mut State, msg: &ProtocolMessage) -> Option<String> {
    if msg.payload.len() < 7 {
        return Some("message too short for query register".to_owned());
    }
    let response = match QueryRegister::from_payload(&msg.payload) {
        Ok(response) => response,
        Err(e) => return Some(e.to_string()),
    };
    if response.size == 0 && response.value.is_empty() {
        return Some("node failed to read the register".to_owned());
    }
    let value_bytes = if response.size == 0 {
        response.value.as_slice()
    } else {
        &response.value[..response.value.len().min(response.size as usize)]
    };

    let node = match state.nodes.get_mut(&msg.controller_id) {
        Some(node) => node,
        None => return Some("no node found for message".to_owned()),
    };
    let control = match Control::unpack(node.protocol_version, response.control) {
        Ok(control) => control,
        Err(e) => return Some(e.to_string()),
    };
    let register = match node.registers.get_mut(response.offset, control.direction) {
        Some(register) => register,
        None => return Some("no register found for offset and direction".to_owned()),
    };

    let value = RegisterValue::new(register.var_type, Bytes::copy_from_slice(value_bytes));
    register.value = Some(value.clone());
    register.timestamp = None;
    let (offset, direction) = (register.offset, register.direction);
    state.notifier.publish(Notification::RegisterUpdated {
        node_id: msg.controller_id,
        offset,
        direction,
        value,
        timestamp: None,
    });
    None
}

fn dispatch_config_channel(msg: &ProtocolMessage) -> Option<String> {
    // The node echoes the applied configuration; the local table was
    // already updated when the request went out, so the echo only gets
    // validated here.
    match ConfigChannel::from_payload(&msg.payload) {
        Ok(_) if msg.payload.len() >= 2 => None,
        Ok(_) => Some("message too short for config channel".to_owned()),
        Err(e) => Some(e.to_string()),
    }
}

fn dispatch_decimation(state: &mut State, msg: &ProtocolMessage) -> Option<String> {
    match msg.payload.first() {
        Some(&decimation) => {
            state.decimation = decimation;
            None
        }
        None => Some("message too short for decimation".to_owned()),
    }
}

fn dispatch_channel_data(state: &mut State, msg: &ProtocolMessage) -> Option<String> {
    let data = match ChannelData::from_payload(&msg.payload) {
        Ok(data) => data,
        Err(e) => return Some(e.to_string()),
    };
    let node = match state.nodes.get_mut(&msg.controller_id) {
        Some(node) => node,
        None => return Some("no node found for message".to_owned()),
    };

    // Values are packed in ascending channel order. Walking the mask from
    // the highest slot down and peeling bytes off the tail keeps each
    // channel's bytes aligned with its register size.
    let mut remaining = data.values.clone();
    let mut updates = Vec::new();
    for channel in (0..MAX_CHANNELS as u8).rev() {
        if data.mask >> channel & 1 == 0 {
            continue;
        }
        let Some((offset, direction)) = node.channels.bound(channel) else {
            continue;
        };
        let Some(register) = node.registers.get_mut(offset, direction) else {
            continue;
        };
        let size = register.size as usize;
        if remaining.len() < size {
            return Some("channel data shorter than its mask demands".to_owned());
        }
        let value_bytes = remaining.split_off(remaining.len() - size);
        let value = RegisterValue::new(register.var_type, value_bytes);
        register.value = Some(value.clone());
        register.timestamp = Some(data.timestamp);
        updates.push((offset, direction, value));
    }

    for (offset, direction, value) in updates {
        state.notifier.publish(Notification::RegisterUpdated {
            node_id: msg.controller_id,
            offset,
            direction,
            value,
            timestamp: Some(data.timestamp),
        });
    }
    state.notifier.publish(Notification::ChannelData {
        node_id: msg.controller_id,
        timestamp: data.timestamp,
    });
    None
}

fn dispatch_debug_string(state: &mut State, msg: &ProtocolMessage) -> Option<String> {
    let DebugString(text) = DebugString::from_payload(&msg.payload);
    let node = match state.nodes.get_mut(&msg.controller_id) {
        Some(node) => node,
        None => return Some("no node found for message".to_owned()),
    };
    node.terminal.push_str(&text);
    state.notifier.publish(Notification::DebugString {
        node_id: msg.controller_id,
        text,
    });
    None
}

fn dispatch_trace(state: &mut State, msg: &ProtocolMessage) -> Option<String> {
    let event = match TraceEvent::from_payload(&msg.payload) {
        Ok(event) => event,
        Err(e) => return Some(e.to_string()),
    };
    if let Some(node) = state.nodes.get_mut(&msg.controller_id) {
        node.trace_log.push(event.clone());
    }
    state.notifier.publish(Notification::Trace {
        node_id: msg.controller_id,
        event,
    });
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use mculink_transport::MemoryLink;

    use mculink_proto::FirmwareVersion;

    fn test_link() -> (Arc<dyn Link>, ChunkReceiver) {
        let ((host, _host_rx), (_device, device_rx)) = MemoryLink::pair();
        (Arc::new(host), device_rx)
    }

    fn drain(rx: &ChunkReceiver) -> Vec<ProtocolMessage> {
        let mut buf = BytesMut::new();
        while let Ok(chunk) = rx.try_recv() {
            buf.extend_from_slice(&chunk);
        }
        decode_messages(&mut buf)
    }

    fn version_payload(name: &str) -> Vec<u8> {
        VersionInfo {
            protocol: FirmwareVersion::V1_0,
            application: FirmwareVersion::new(1, 2, 3),
            name: name.into(),
            serial: "SN-1".into(),
        }
        .to_payload()
    }

    fn discovered(state: &mut State, link: &dyn Link, id: u8) {
        handle_message(
            state,
            link,
            ProtocolMessage::new(id, 0, Command::GetVersion, version_payload("node")),
        );
    }

    #[test]
    fn msg_ids_skip_zero() {
        let mut state = State::new();
        assert_eq!(state.next_msg_id(9), 0, "unknown nodes get the no-ack id");

        state.msg_ids.insert(1, 0xFE);
        assert_eq!(state.next_msg_id(1), 0xFF);
        assert_eq!(state.next_msg_id(1), 1);
    }

    #[test]
    fn version_response_creates_node_and_resets_channels() {
        let (link, device_rx) = test_link();
        let mut state = State::new();
        let events = state.notifier.subscribe();

        discovered(&mut state, &*link, 2);

        let node = state.nodes.get(&2).expect("node created");
        assert_eq!(node.name, "node");
        assert_eq!(node.protocol_version, FirmwareVersion::V1_0);
        assert_eq!(node.message_count, 1);

        let sent = drain(&device_rx);
        assert_eq!(sent.len(), 1 + MAX_CHANNELS);
        assert_eq!(sent[0].command, Some(Command::GetInfo));
        assert_eq!(sent[0].msg_id, 1);
        for (i, msg) in sent[1..].iter().enumerate() {
            assert_eq!(msg.command, Some(Command::ConfigChannel));
            assert_eq!(&msg.payload[..], &[i as u8, 0]);
        }
        assert_eq!(state.pending.len(), 1 + MAX_CHANNELS);

        assert!(matches!(
            events.try_recv().unwrap(),
            Notification::NodeDiscovered { node_id: 2, .. }
        ));
    }

    #[test]
    fn duplicate_version_is_counted_invalid() {
        let (link, _device_rx) = test_link();
        let mut state = State::new();
        discovered(&mut state, &*link, 2);
        discovered(&mut state, &*link, 2);

        let node = state.nodes.get(&2).unwrap();
        assert_eq!(node.message_count, 2);
        assert_eq!(node.invalid_count, 1);
    }

    #[test]
    fn ack_resolves_pending_message() {
        let (link, device_rx) = test_link();
        let mut state = State::new();
        discovered(&mut state, &*link, 1);
        state.pending.clear();
        drain(&device_rx);

        let msg = message(&mut state, 1, Command::WriteRegister, vec![0u8; 8]);
        let (msg_id, command) = (msg.msg_id, msg.command.unwrap());
        send(&mut state, &*link, msg).unwrap();
        assert_eq!(state.pending.len(), 1);

        // Status-byte response with the same (controller, id, command) triple.
        handle_message(
            &mut state,
            &*link,
            ProtocolMessage::new(1, msg_id, command, vec![0u8]),
        );
        assert!(state.pending.is_empty());
        assert_eq!(state.nodes.get(&1).unwrap().invalid_count, 0);
    }

    #[test]
    fn unacknowledged_message_is_resent_with_same_id() {
        let (link, device_rx) = test_link();
        let mut state = State::new();
        discovered(&mut state, &*link, 1);
        state.pending.clear();
        drain(&device_rx);

        let msg = message(&mut state, 1, Command::GetInfo, Bytes::new());
        let msg_id = msg.msg_id;
        send(&mut state, &*link, msg).unwrap();
        drain(&device_rx);

        for _ in 0..ACK_TIMEOUT_TICKS {
            resend_sweep(&mut state, &*link);
        }
        assert!(drain(&device_rx).is_empty(), "resent before the threshold");

        resend_sweep(&mut state, &*link);
        let resent = drain(&device_rx);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].msg_id, msg_id);
        assert_eq!(resent[0].command, Some(Command::GetInfo));
        assert_eq!(state.pending.len(), 1, "still pending until acknowledged");
        assert_eq!(state.pending[0].ticks, 0, "tick counter restarts");
    }

    #[test]
    fn info_response_overrides_size_table() {
        let (link, _device_rx) = test_link();
        let mut state = State::new();
        discovered(&mut state, &*link, 1);

        // Double shrinks to 4 bytes, timestamp unit becomes 500 µs.
        let payload = vec![0x08, 0x04, 0x33, 0x0A, 0xF4, 0x01, 0x00, 0x00];
        handle_message(
            &mut state,
            &*link,
            ProtocolMessage::new(1, 0, Command::GetInfo, payload),
        );

        let node = state.nodes.get(&1).unwrap();
        assert_eq!(node.sizes[&VariableType::Double], 4);
        assert_eq!(node.sizes[&VariableType::TimeStamp], 500);
    }

    #[test]
    fn query_response_publishes_register_value() {
        let (link, _device_rx) = test_link();
        let mut state = State::new();
        discovered(&mut state, &*link, 1);
        let events = state.notifier.subscribe();

        let node = state.nodes.get_mut(&1).unwrap();
        node.registers.insert(Register::new(
            0x44,
            "counter",
            Direction::Read,
            VariableType::UInt,
            4,
        ));

        // control 0x80 = Read under the 1.0 layout
        let mut payload = 0x44u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0x80, 4, 0x2A, 0x00, 0x00, 0x00]);
        handle_message(
            &mut state,
            &*link,
            ProtocolMessage::new(1, 0, Command::QueryRegister, payload),
        );

        let node = state.nodes.get_mut(&1).unwrap();
        let register = node.registers.get(0x44, Direction::Read).unwrap();
        assert_eq!(register.value.as_ref().unwrap().as_u64(), Some(42));
        assert_eq!(node.invalid_count, 0);

        assert!(matches!(
            events.try_recv().unwrap(),
            Notification::RegisterUpdated {
                node_id: 1,
                offset: 0x44,
                timestamp: None,
                ..
            }
        ));
    }

    #[test]
    fn short_query_response_is_diagnostic_not_fatal() {
        let (link, _device_rx) = test_link();
        let mut state = State::new();
        discovered(&mut state, &*link, 1);

        handle_message(
            &mut state,
            &*link,
            ProtocolMessage::new(1, 0, Command::QueryRegister, vec![0u8; 6]),
        );
        let node = state.nodes.get(&1).unwrap();
        assert_eq!(node.invalid_count, 1);
    }

    #[test]
    fn channel_data_assigns_values_in_ascending_channel_order() {
        let (link, _device_rx) = test_link();
        let mut state = State::new();
        discovered(&mut state, &*link, 1);
        let events = state.notifier.subscribe();

        let node = state.nodes.get_mut(&1).unwrap();
        node.registers.insert(Register::new(
            0x10,
            "a",
            Direction::Read,
            VariableType::UChar,
            1,
        ));
        node.registers.insert(Register::new(
            0x20,
            "b",
            Direction::Read,
            VariableType::UShort,
            2,
        ));
        // Bind slot 0 to 0x10 and slot 3 to 0x20, leaving 1 and 2 free.
        assert_eq!(node.channels.allocate((0x10, Direction::Read)), Some(0));
        node.channels.allocate((0, Direction::Write));
        node.channels.allocate((0, Direction::Write));
        assert_eq!(node.channels.allocate((0x20, Direction::Read)), Some(3));
        node.channels.release(1);
        node.channels.release(2);

        let mut payload = vec![0x07, 0x00, 0x00]; // timestamp 7
        payload.extend_from_slice(&0b0000_1001u16.to_le_bytes());
        payload.extend_from_slice(&[0xAB, 0x01, 0x02]);
        handle_message(
            &mut state,
            &*link,
            ProtocolMessage::new(1, 0, Command::ReadChannelData, payload),
        );

        let node = state.nodes.get_mut(&1).unwrap();
        let low = node.registers.get(0x10, Direction::Read).unwrap();
        assert_eq!(&low.value.as_ref().unwrap().bytes[..], &[0xAB]);
        assert_eq!(low.timestamp, Some(7));
        let high = node.registers.get(0x20, Direction::Read).unwrap();
        assert_eq!(&high.value.as_ref().unwrap().bytes[..], &[0x01, 0x02]);

        // Two register updates (descending dispatch order), then the batch event.
        assert!(matches!(
            events.try_recv().unwrap(),
            Notification::RegisterUpdated { offset: 0x20, .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            Notification::RegisterUpdated { offset: 0x10, .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            Notification::ChannelData { timestamp: 7, .. }
        ));
    }

    #[test]
    fn truncated_channel_data_is_diagnostic() {
        let (link, _device_rx) = test_link();
        let mut state = State::new();
        discovered(&mut state, &*link, 1);

        let node = state.nodes.get_mut(&1).unwrap();
        node.registers.insert(Register::new(
            0x10,
            "a",
            Direction::Read,
            VariableType::UInt,
            4,
        ));
        node.channels.allocate((0x10, Direction::Read));

        let mut payload = vec![0, 0, 0];
        payload.extend_from_slice(&1u16.to_le_bytes());
        payload.extend_from_slice(&[0xAA, 0xBB]); // register wants 4 bytes
        handle_message(
            &mut state,
            &*link,
            ProtocolMessage::new(1, 0, Command::ReadChannelData, payload),
        );
        assert_eq!(state.nodes.get(&1).unwrap().invalid_count, 1);
    }

    #[test]
    fn debug_string_accumulates_terminal_text() {
        let (link, _device_rx) = test_link();
        let mut state = State::new();
        discovered(&mut state, &*link, 1);
        let events = state.notifier.subscribe();

        for chunk in ["boot ", "ok\n"] {
            handle_message(
                &mut state,
                &*link,
                ProtocolMessage::new(1, 0, Command::DebugString, chunk.as_bytes().to_vec()),
            );
        }
        assert_eq!(state.nodes.get(&1).unwrap().terminal, "boot ok\n");
        assert!(matches!(
            events.try_recv().unwrap(),
            Notification::DebugString { node_id: 1, .. }
        ));
    }

    #[test]
    fn trace_event_is_logged_and_published() {
        let (link, _device_rx) = test_link();
        let mut state = State::new();
        discovered(&mut state, &*link, 1);
        let events = state.notifier.subscribe();

        let mut payload = vec![4]; // error level
        payload.extend_from_slice(b"overrun");
        handle_message(
            &mut state,
            &*link,
            ProtocolMessage::new(1, 0, Command::Tracing, payload),
        );

        let node = state.nodes.get(&1).unwrap();
        assert_eq!(node.trace_log.len(), 1);
        assert_eq!(node.trace_log[0].text, "overrun");
        assert!(matches!(
            events.try_recv().unwrap(),
            Notification::Trace { node_id: 1, .. }
        ));
    }

    #[test]
    fn decimation_response_updates_session_value() {
        let (link, _device_rx) = test_link();
        let mut state = State::new();
        discovered(&mut state, &*link, 1);

        handle_message(
            &mut state,
            &*link,
            ProtocolMessage::new(1, 0, Command::Decimation, vec![5u8]),
        );
        assert_eq!(state.decimation, 5);
    }

    fn wait_until(deadline: std::time::Instant, mut done: impl FnMut() -> bool) {
        while !done() {
            assert!(
                std::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn losing_the_chunk_source_drops_the_connection() {
        let ((host, host_rx), (device, device_rx)) = MemoryLink::pair();
        let session = Session::start(Arc::new(host), host_rx).expect("session start");
        assert!(session.is_connected());

        drop(device);
        drop(device_rx);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        wait_until(deadline, || !session.is_connected());
        session.shutdown();
    }

    #[test]
    fn failed_bind_releases_the_channel_slot() {
        let ((host, host_rx), (device, _device_rx)) = MemoryLink::pair();
        let session = Session::start(Arc::new(host), host_rx).expect("session start");

        let frame = encode_message(&ProtocolMessage::new(
            1,
            0,
            Command::GetVersion,
            version_payload("node"),
        ))
        .expect("encode");
        device.transmit(&frame).expect("transmit");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        wait_until(deadline, || !session.node_ids().is_empty());

        session
            .add_register(1, Register::new(0x10, "r", Direction::Read, VariableType::UInt, 4))
            .expect("add register");
        session.disconnect();

        let err = session
            .bind_channel(1, 0x10, Direction::Read, ChannelMode::OnChange)
            .expect_err("send on a dead session");
        assert!(matches!(err, SessionError::NotConnected));
        assert_eq!(
            session.snapshots()[0].bound_channels,
            0,
            "slot reserved for a bind the node never saw"
        );
        session.shutdown();
    }
}
