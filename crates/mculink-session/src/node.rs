//! Per-node state: register map, channel table and counters.

use std::collections::HashMap;

use serde::Serialize;

use mculink_proto::{
    default_sizes, Control, Direction, FirmwareVersion, RegisterValue, TraceEvent, ValueSource,
    VariableType, VersionInfo,
};

/// Number of debug channel slots a node exposes.
pub const MAX_CHANNELS: usize = 16;

/// One addressable unit on a node. Within a node, `(offset, direction)`
/// is the lookup key.
#[derive(Debug, Clone)]
pub struct Register {
    pub offset: u32,
    pub name: String,
    pub direction: Direction,
    pub var_type: VariableType,
    /// Byte size on the wire; 0 means variable length.
    pub size: u8,
    pub deref_depth: u8,
    pub source: ValueSource,
    /// Most recent value seen, with the telemetry timestamp when it came
    /// from a channel batch.
    pub value: Option<RegisterValue>,
    pub timestamp: Option<u32>,
}

impl Register {
    pub fn new(
        offset: u32,
        name: impl Into<String>,
        direction: Direction,
        var_type: VariableType,
        size: u8,
    ) -> Self {
        Self {
            offset,
            name: name.into(),
            direction,
            var_type,
            size,
            deref_depth: 0,
            source: ValueSource::ElfParsed,
            value: None,
            timestamp: None,
        }
    }

    pub fn control(&self) -> Control {
        Control::new(self.direction, self.source, self.deref_depth)
    }
}

/// Register lookup keyed on `(offset, direction)`. The index is rebuilt
/// lazily whenever a lookup misses, so insertions stay cheap.
#[derive(Debug, Default)]
pub struct RegisterMap {
    registers: Vec<Register>,
    index: HashMap<(u32, Direction), usize>,
}

impl RegisterMap {
    pub fn insert(&mut self, register: Register) {
        self.registers.push(register);
    }

    pub fn get(&mut self, offset: u32, direction: Direction) -> Option<&Register> {
        let slot = self.resolve(offset, direction)?;
        self.registers.get(slot)
    }

    pub fn get_mut(&mut self, offset: u32, direction: Direction) -> Option<&mut Register> {
        let slot = self.resolve(offset, direction)?;
        self.registers.get_mut(slot)
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Register> {
        self.registers.iter()
    }

    fn resolve(&mut self, offset: u32, direction: Direction) -> Option<usize> {
        let key = (offset, direction);
        if !self.index.contains_key(&key) {
            self.rebuild();
        }
        self.index.get(&key).copied()
    }

    fn rebuild(&mut self) {
        self.index.clear();
        for (slot, register) in self.registers.iter().enumerate() {
            self.index.insert((register.offset, register.direction), slot);
        }
    }
}

/// Debug channel slots. A slot holds the `(offset, direction)` key of the
/// register bound to it; `Off` releases the slot rather than silencing it.
#[derive(Debug)]
pub struct ChannelTable {
    slots: Vec<Option<(u32, Direction)>>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self {
            slots: vec![None; MAX_CHANNELS],
        }
    }
}

impl ChannelTable {
    /// First free slot, bound to `key`. `None` when the table is full.
    pub fn allocate(&mut self, key: (u32, Direction)) -> Option<u8> {
        let free = self.slots.iter().position(Option::is_none)?;
        self.slots[free] = Some(key);
        Some(free as u8)
    }

    pub fn release(&mut self, channel: u8) {
        if let Some(slot) = self.slots.get_mut(channel as usize) {
            *slot = None;
        }
    }

    pub fn bound(&self, channel: u8) -> Option<(u32, Direction)> {
        self.slots.get(channel as usize).copied().flatten()
    }

    pub fn bound_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

/// A discovered microcontroller node.
#[derive(Debug)]
pub struct CpuNode {
    pub id: u8,
    pub name: String,
    pub serial: String,
    pub protocol_version: FirmwareVersion,
    pub application_version: FirmwareVersion,
    /// Per-type byte sizes, overridden by the node's info response.
    pub sizes: HashMap<VariableType, u32>,
    pub registers: RegisterMap,
    pub channels: ChannelTable,
    /// Accumulated terminal output from debug-string messages.
    pub terminal: String,
    pub trace_log: Vec<TraceEvent>,
    pub message_count: u64,
    pub invalid_count: u64,
}

impl CpuNode {
    pub fn new(id: u8, info: &VersionInfo) -> Self {
        Self {
            id,
            name: info.name.clone(),
            serial: info.serial.clone(),
            protocol_version: info.protocol,
            application_version: info.application,
            sizes: default_sizes(),
            registers: RegisterMap::default(),
            channels: ChannelTable::default(),
            terminal: String::new(),
            trace_log: Vec::new(),
            message_count: 0,
            invalid_count: 0,
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id,
            name: self.name.clone(),
            serial: self.serial.clone(),
            protocol_version: self.protocol_version,
            application_version: self.application_version,
            register_count: self.registers.len(),
            bound_channels: self.channels.bound_count(),
            message_count: self.message_count,
            invalid_count: self.invalid_count,
        }
    }
}

/// Read-only copy of a node's identity and counters, for display layers.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: u8,
    pub name: String,
    pub serial: String,
    pub protocol_version: FirmwareVersion,
    pub application_version: FirmwareVersion,
    pub register_count: usize,
    pub bound_channels: usize,
    pub message_count: u64,
    pub invalid_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(offset: u32, direction: Direction) -> Register {
        Register::new(offset, format!("r{offset}"), direction, VariableType::UInt, 4)
    }

    #[test]
    fn register_map_keys_on_offset_and_direction() {
        let mut map = RegisterMap::default();
        map.insert(register(0x10, Direction::Read));
        map.insert(register(0x10, Direction::Write));

        assert_eq!(map.get(0x10, Direction::Read).unwrap().direction, Direction::Read);
        assert_eq!(map.get(0x10, Direction::Write).unwrap().direction, Direction::Write);
        assert!(map.get(0x10, Direction::ReadWrite).is_none());
        assert!(map.get(0x20, Direction::Read).is_none());
    }

    #[test]
    fn register_map_index_catches_up_after_insert() {
        let mut map = RegisterMap::default();
        map.insert(register(1, Direction::Read));
        assert!(map.get(1, Direction::Read).is_some());

        // Index was built; a later insert must still be findable.
        map.insert(register(2, Direction::Read));
        assert!(map.get(2, Direction::Read).is_some());
    }

    #[test]
    fn channel_table_allocates_lowest_free_slot() {
        let mut table = ChannelTable::default();
        assert_eq!(table.allocate((0x10, Direction::Read)), Some(0));
        assert_eq!(table.allocate((0x20, Direction::Read)), Some(1));

        table.release(0);
        assert_eq!(table.allocate((0x30, Direction::Read)), Some(0));
        assert_eq!(table.bound(0), Some((0x30, Direction::Read)));
        assert_eq!(table.bound_count(), 2);
    }

    #[test]
    fn channel_table_full_returns_none() {
        let mut table = ChannelTable::default();
        for i in 0..MAX_CHANNELS {
            assert!(table.allocate((i as u32, Direction::Read)).is_some());
        }
        assert_eq!(table.allocate((99, Direction::Read)), None);
    }
}
