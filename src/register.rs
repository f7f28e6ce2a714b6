//! ESC register map, as bitfield views over raw bytes.
//!
//! Every struct carries its `ADDRESS` and `SIZE`; multi-instance blocks
//! (FMMU, SyncManager) expose an `address(n)` helper instead.

use bitfield::*;

/// ESC type/revision/build block at 0x000; only the first byte is used for
/// discovery (broadcast read, WKC counts the slaves).
pub const TYPE_ADDRESS: u16 = 0x0000;

/// ECAT event mask register.
pub const ECAT_EVENT_MASK_ADDRESS: u16 = 0x0200;

/// DC control registers cleared during the bus reset.
pub const DC_SYSTEM_TIME_ADDRESS: u16 = 0x0910;
pub const DC_CYCLIC_CONTROL_ADDRESS: u16 = 0x0980;
pub const DC_SYNC_ACTIVATION_ADDRESS: u16 = 0x0981;

bitfield! {
    #[derive(Debug, Clone)]
    pub struct StationAddress([u8]);
    u16;
    pub configured_address, set_configured_address: 8*2-1, 0;
}

impl StationAddress<[u8; 2]> {
    pub const ADDRESS: u16 = 0x0010;
    pub const SIZE: usize = 2;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

bitfield! {
    #[derive(Debug, Clone)]
    pub struct DlStatus([u8]);
    pub pdi_operational, _: 0;
    pub pdi_watchdog_ok, _: 1;
    pub extended_link_detection, _: 2;
    pub link_port0, _: 4;
    pub link_port1, _: 5;
    pub link_port2, _: 6;
    pub link_port3, _: 7;
    pub loop_port0, _: 8;
    pub com_port0, _: 9;
    pub loop_port1, _: 10;
    pub com_port1, _: 11;
    pub loop_port2, _: 12;
    pub com_port2, _: 13;
    pub loop_port3, _: 14;
    pub com_port3, _: 15;
}

impl DlStatus<[u8; 2]> {
    pub const ADDRESS: u16 = 0x0110;
    pub const SIZE: usize = 2;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

bitfield! {
    #[derive(Debug, Clone)]
    pub struct AlControl([u8]);
    u8;
    pub state, set_state: 3, 0;
    pub acknowledge, set_acknowledge: 4;
}

impl AlControl<[u8; 2]> {
    pub const ADDRESS: u16 = 0x0120;
    pub const SIZE: usize = 2;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

bitfield! {
    /// AL status together with the status code word at 0x134; read as one
    /// six byte block.
    #[derive(Debug, Clone)]
    pub struct AlStatus([u8]);
    u8;
    pub state, _: 3, 0;
    pub change_error, _: 4;
    u16;
    pub al_status_code, _: 8*6-1, 8*4;
}

impl AlStatus<[u8; 6]> {
    pub const ADDRESS: u16 = 0x0130;
    pub const SIZE: usize = 6;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

/// Error counter block at 0x300: per-port RX errors, forwarded errors,
/// processing unit / PDI errors and lost links.
bitfield! {
    #[derive(Debug, Clone)]
    pub struct ErrorCounters([u8]);
    u8;
    pub invalid_frame_port0, _: 8*1-1, 8*0;
    pub physical_layer_port0, _: 8*2-1, 8*1;
    pub invalid_frame_port1, _: 8*3-1, 8*2;
    pub physical_layer_port1, _: 8*4-1, 8*3;
    pub invalid_frame_port2, _: 8*5-1, 8*4;
    pub physical_layer_port2, _: 8*6-1, 8*5;
    pub invalid_frame_port3, _: 8*7-1, 8*6;
    pub physical_layer_port3, _: 8*8-1, 8*7;
    pub forwarded_port0, _: 8*9-1, 8*8;
    pub forwarded_port1, _: 8*10-1, 8*9;
    pub forwarded_port2, _: 8*11-1, 8*10;
    pub forwarded_port3, _: 8*12-1, 8*11;
    pub malformed_frame, _: 8*13-1, 8*12;
    pub pdi_error, _: 8*14-1, 8*13;
    u16;
    pub spi_pdi_error, _: 8*16-1, 8*14;
    pub uc_pdi_error, _: 8*18-1, 8*16;
    pub avalon_pdi_error, _: 8*20-1, 8*18;
    pub axi_pdi_error, _: 8*22-1, 8*20;
    u8;
    pub lost_link_port0, _: 8*23-1, 8*22;
    pub lost_link_port1, _: 8*24-1, 8*23;
    pub lost_link_port2, _: 8*25-1, 8*24;
    pub lost_link_port3, _: 8*26-1, 8*25;
}

impl ErrorCounters<[u8; 26]> {
    pub const ADDRESS: u16 = 0x0300;
    pub const SIZE: usize = 26;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

impl Default for ErrorCounters<[u8; 26]> {
    fn default() -> Self {
        ErrorCounters::new()
    }
}

impl<B: AsRef<[u8]>> ErrorCounters<B> {
    pub fn invalid_frame(&self, port: usize) -> u8 {
        self.0.as_ref()[port * 2]
    }

    pub fn physical_layer(&self, port: usize) -> u8 {
        self.0.as_ref()[port * 2 + 1]
    }

    pub fn lost_link(&self, port: usize) -> u8 {
        self.0.as_ref()[22 + port]
    }
}

bitfield! {
    #[derive(Debug, Clone)]
    pub struct WatchdogDivider([u8]);
    u16;
    pub divider, set_divider: 8*2-1, 0;
}

impl WatchdogDivider<[u8; 2]> {
    pub const ADDRESS: u16 = 0x0400;
    pub const SIZE: usize = 2;

    /// 25 MHz ESC clock: a divider of 0x09C2 gives 100us increments.
    pub const DEFAULT_100US: u16 = 0x09C2;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

bitfield! {
    #[derive(Debug, Clone)]
    pub struct PdiWatchdog([u8]);
    u16;
    pub time, set_time: 8*2-1, 0;
}

impl PdiWatchdog<[u8; 2]> {
    pub const ADDRESS: u16 = 0x0410;
    pub const SIZE: usize = 2;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

bitfield! {
    #[derive(Debug, Clone)]
    pub struct PdoWatchdog([u8]);
    u16;
    pub time, set_time: 8*2-1, 0;
}

impl PdoWatchdog<[u8; 2]> {
    pub const ADDRESS: u16 = 0x0420;
    pub const SIZE: usize = 2;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

bitfield! {
    /// EEPROM configuration/PDI access register (0x500/0x501).
    #[derive(Debug, Clone)]
    pub struct EepromAccess([u8]);
    pub owner, set_owner: 0;
    pub reset_access, set_reset_access: 1;
    pub pdi_accessed, _: 8;
}

impl EepromAccess<[u8; 2]> {
    pub const ADDRESS: u16 = 0x0500;
    pub const SIZE: usize = 2;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

bitfield! {
    #[derive(Debug, Clone)]
    pub struct EepromControl([u8]);
    pub enable_write_access, set_enable_write_access: 0;
    pub read_size_8_bytes, _: 6;
    pub two_byte_address, _: 7;
    pub read_operation, set_read_operation: 8;
    pub write_operation, set_write_operation: 9;
    pub reload_operation, set_reload_operation: 10;
    pub checksum_error, _: 11;
    pub device_info_error, _: 12;
    pub command_error, _: 13;
    pub busy, _: 15;
}

impl EepromControl<[u8; 2]> {
    pub const ADDRESS: u16 = 0x0502;
    pub const SIZE: usize = 2;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

impl<B: AsRef<[u8]>> EepromControl<B> {
    pub fn is_ready(&self) -> bool {
        !self.busy() && !self.read_operation() && !self.write_operation()
            && !self.reload_operation()
    }
}

bitfield! {
    #[derive(Debug, Clone)]
    pub struct EepromAddress([u8]);
    u32;
    pub word_address, set_word_address: 8*4-1, 0;
}

impl EepromAddress<[u8; 4]> {
    pub const ADDRESS: u16 = 0x0504;
    pub const SIZE: usize = 4;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

bitfield! {
    #[derive(Debug, Clone)]
    pub struct EepromData([u8]);
    u64;
    pub data, _: 8*8-1, 0;
}

impl EepromData<[u8; 8]> {
    pub const ADDRESS: u16 = 0x0508;
    pub const SIZE: usize = 8;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

bitfield! {
    /// One SyncManager channel: 8 bytes starting at 0x800 + 8 * n.
    #[derive(Debug, Clone)]
    pub struct SyncManagerChannel([u8]);
    u16;
    pub start_address, set_start_address: 8*2-1, 0;
    pub length, set_length: 8*4-1, 8*2;
    u8;
    pub control, set_control: 8*5-1, 8*4;
    pub status, set_status: 8*6-1, 8*5;
    pub activate, set_activate: 8*7-1, 8*6;
    pub pdi_control, set_pdi_control: 8*8-1, 8*7;
}

impl SyncManagerChannel<[u8; 8]> {
    pub const BASE: u16 = 0x0800;
    pub const SIZE: usize = 8;
    /// Status byte offset within a channel (can_read/can_write polling).
    pub const STATUS_OFFSET: u16 = 5;
    /// Mailbox full flag in the status byte.
    pub const MAILBOX_FULL: u8 = 1 << 3;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }

    pub fn address(channel: u16) -> u16 {
        Self::BASE + channel * Self::SIZE as u16
    }

    pub fn status_address(channel: u16) -> u16 {
        Self::address(channel) + Self::STATUS_OFFSET
    }
}

bitfield! {
    /// One FMMU entry: 16 bytes starting at 0x600 + 16 * n.
    #[derive(Debug, Clone)]
    pub struct FmmuEntry([u8]);
    u32;
    pub logical_address, set_logical_address: 8*4-1, 0;
    u16;
    pub length, set_length: 8*6-1, 8*4;
    u8;
    pub logical_start_bit, set_logical_start_bit: 8*6+2, 8*6;
    pub logical_stop_bit, set_logical_stop_bit: 8*7+2, 8*7;
    u16;
    pub physical_address, set_physical_address: 8*10-1, 8*8;
    u8;
    pub physical_start_bit, set_physical_start_bit: 8*10+2, 8*10;
    pub fmmu_type, set_fmmu_type: 8*11+1, 8*11;
    pub activate, set_activate: 8*12, 8*12;
}

impl FmmuEntry<[u8; 16]> {
    pub const BASE: u16 = 0x0600;
    pub const SIZE: usize = 16;
    /// FMMU acts on read services (inputs, slave to master).
    pub const TYPE_READ: u8 = 1;
    /// FMMU acts on write services (outputs, master to slave).
    pub const TYPE_WRITE: u8 = 2;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }

    pub fn address(entry: u16) -> u16 {
        Self::BASE + entry * Self::SIZE as u16
    }
}

/// EEPROM command words for the control register.
pub mod eeprom_command {
    pub const NOP: u16 = 0x0000;
    pub const READ: u16 = 0x0100;
    pub const WRITE: u16 = 0x0201;
    pub const RELOAD: u16 = 0x0300;
}
