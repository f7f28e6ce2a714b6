//! Per-slave record owned by the bus.
//!
//! Slaves are created once by discovery and never destroyed while the bus
//! runs; topology changes are reported through DL status and error
//! counters, not by rewriting this model.

use bit_field::BitField;

use crate::mailbox::Mailbox;
use crate::register::ErrorCounters;
use crate::sii::Sii;

/// ESM states (AL control / AL status low nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlState {
    Init = 0x01,
    PreOperational = 0x02,
    Bootstrap = 0x03,
    SafeOperational = 0x04,
    Operational = 0x08,
    Invalid = 0x00,
}

/// Acknowledge/error flag ORed into AL status by a faulting slave.
pub const AL_STATUS_ACK: u8 = 0x10;

impl From<u8> for AlState {
    fn from(v: u8) -> Self {
        match v & 0x0F {
            0x01 => AlState::Init,
            0x02 => AlState::PreOperational,
            0x03 => AlState::Bootstrap,
            0x04 => AlState::SafeOperational,
            0x08 => AlState::Operational,
            _ => AlState::Invalid,
        }
    }
}

/// Geometry of a mailbox pair, as read from the EEPROM header words.
#[derive(Debug, Clone, Copy, Default)]
pub struct MailboxOffsets {
    pub recv_offset: u16,
    pub recv_size: u16,
    pub send_offset: u16,
    pub send_size: u16,
}

/// One direction of the process image of a slave.
#[derive(Debug, Clone, Copy, Default)]
pub struct PiMapping {
    /// Offset of this block in the client io buffer.
    pub offset: usize,
    /// Mapping size in bits.
    pub size: u32,
    /// Mapping size in bytes (bits rounded up).
    pub bsize: usize,
    /// Sync manager channel backing the mapping.
    pub sync_manager: u16,
    /// Logical address of the block.
    pub address: u32,
}

#[derive(Debug, Default)]
pub struct Slave {
    /// Configured station address (1000 + position).
    pub address: u16,
    /// Raw AL status byte, acknowledge flag included.
    pub al_status: u8,
    pub al_status_code: u16,

    pub vendor_id: u32,
    pub product_code: u32,
    pub revision_number: u32,
    pub serial_number: u32,

    pub mailbox: Mailbox,
    pub mailbox_bootstrap: MailboxOffsets,
    /// AoE/EoE/CoE/FoE/SoE bitmask from EEPROM word 0x1C.
    pub supported_mailbox: u16,

    pub eeprom_size: u16,
    pub eeprom_version: u16,

    /// Raw DL status word (register 0x110).
    pub dl_status: u16,
    pub error_counters: ErrorCounters<[u8; 26]>,
    pub(crate) previous_error_sum: u32,

    pub sii: Sii,

    /// Slave to master.
    pub input: PiMapping,
    /// Master to slave.
    pub output: PiMapping,
    /// When set, the user supplied `input`/`output` bsize and sync manager
    /// and mapping detection is skipped.
    pub is_static_mapping: bool,
}

impl Slave {
    pub fn al_state(&self) -> AlState {
        AlState::from(self.al_status)
    }

    pub fn error_acknowledged(&self) -> bool {
        self.al_status.get_bit(4)
    }

    pub fn supports_coe(&self) -> bool {
        self.supported_mailbox & crate::sii::mailbox_protocol::COE != 0
    }

    pub fn has_mailbox(&self) -> bool {
        self.supported_mailbox != 0 && self.mailbox.recv_size != 0
    }

    /// Sum of every error counter of the 0x300 block.
    pub fn total_error_count(&self) -> u32 {
        let mut sum = 0u32;
        for port in 0..4 {
            sum += self.error_counters.invalid_frame(port) as u32;
            sum += self.error_counters.physical_layer(port) as u32;
            sum += self.error_counters.lost_link(port) as u32;
        }
        sum + self.error_counters.malformed_frame() as u32 + self.error_counters.pdi_error() as u32
    }

    /// Errors accumulated since the previous call.
    pub fn relative_error_count(&mut self) -> u32 {
        let sum = self.total_error_count();
        let delta = sum.saturating_sub(self.previous_error_sum);
        self.previous_error_sum = sum;
        delta
    }

    /// Ports with an established link, from the last DL status refresh.
    pub fn open_ports(&self) -> u8 {
        let raw = self.dl_status.to_le_bytes();
        let view = crate::register::DlStatus(&raw[..]);
        [
            view.link_port0(),
            view.link_port1(),
            view.link_port2(),
            view.link_port3(),
        ]
        .iter()
        .filter(|up| **up)
        .count() as u8
    }
}
