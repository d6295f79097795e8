//! Device-side register table.

use mculink_proto::{
    ChannelMode, Control, Direction, FirmwareVersion, ValueSource, VariableType, VersionInfo,
};

/// How a read-only register evolves over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    /// Value only changes through writes.
    Static,
    /// Increments by one every update tick.
    Counter,
    /// 8-bit sine sweep.
    Sine,
}

/// One register the emulated device exposes.
#[derive(Debug, Clone)]
pub struct EmuRegister {
    pub offset: u32,
    pub name: String,
    pub direction: Direction,
    pub source: ValueSource,
    pub deref_depth: u8,
    pub var_type: VariableType,
    pub size: u8,
    pub value: Vec<u8>,
    pub waveform: Waveform,
    /// Channel slot this register is currently bound to.
    pub channel: Option<u8>,
    pub mode: ChannelMode,
}

impl EmuRegister {
    pub fn new(
        offset: u32,
        name: impl Into<String>,
        direction: Direction,
        var_type: VariableType,
        size: u8,
        waveform: Waveform,
    ) -> Self {
        Self {
            offset,
            name: name.into(),
            direction,
            source: ValueSource::ElfParsed,
            deref_depth: 0,
            var_type,
            size,
            value: vec![0; size as usize],
            waveform,
            channel: None,
            mode: ChannelMode::Off,
        }
    }

    pub fn control(&self) -> Control {
        Control::new(self.direction, self.source, self.deref_depth)
    }

    /// Advances a waveform register by one step.
    pub fn step(&mut self, tick: u64) {
        match self.waveform {
            Waveform::Static => {}
            Waveform::Counter => {
                let mut carry = 1u16;
                for byte in self.value.iter_mut() {
                    let sum = u16::from(*byte) + carry;
                    *byte = sum as u8;
                    carry = sum >> 8;
                    if carry == 0 {
                        break;
                    }
                }
            }
            Waveform::Sine => {
                let angle = (tick % 64) as f64 / 64.0 * std::f64::consts::TAU;
                let sample = ((angle.sin() + 1.0) * 127.5) as u8;
                if let Some(first) = self.value.first_mut() {
                    *first = sample;
                }
            }
        }
    }
}

/// Identity and register table of one emulated node.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    pub node_id: u8,
    pub identity: VersionInfo,
    pub registers: Vec<EmuRegister>,
}

impl EmulatorConfig {
    /// A small demo node: a couple of telemetry sources and writable
    /// setpoints.
    pub fn demo(node_id: u8) -> Self {
        Self {
            node_id,
            identity: VersionInfo {
                protocol: FirmwareVersion::V1_0,
                application: FirmwareVersion::new(0, 1, 0),
                name: "mculink-emu".into(),
                serial: "EMU-0001".into(),
            },
            registers: vec![
                EmuRegister::new(
                    0x1000,
                    "counter",
                    Direction::Read,
                    VariableType::UInt,
                    4,
                    Waveform::Counter,
                ),
                EmuRegister::new(
                    0x1004,
                    "sine",
                    Direction::Read,
                    VariableType::UChar,
                    1,
                    Waveform::Sine,
                ),
                EmuRegister::new(
                    0x1005,
                    "counter16",
                    Direction::Read,
                    VariableType::UShort,
                    2,
                    Waveform::Counter,
                ),
                EmuRegister::new(
                    0x2000,
                    "enable",
                    Direction::Write,
                    VariableType::Bool,
                    1,
                    Waveform::Static,
                ),
                EmuRegister::new(
                    0x2004,
                    "setpoint",
                    Direction::ReadWrite,
                    VariableType::Int,
                    4,
                    Waveform::Static,
                ),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_carries_across_bytes() {
        let mut reg = EmuRegister::new(
            0,
            "c",
            Direction::Read,
            VariableType::UShort,
            2,
            Waveform::Counter,
        );
        reg.value = vec![0xFF, 0x00];
        reg.step(0);
        assert_eq!(reg.value, vec![0x00, 0x01]);
    }

    #[test]
    fn sine_stays_in_byte_range() {
        let mut reg = EmuRegister::new(
            0,
            "s",
            Direction::Read,
            VariableType::UChar,
            1,
            Waveform::Sine,
        );
        for tick in 0..128 {
            reg.step(tick);
        }
    }
}
