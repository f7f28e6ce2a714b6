//! The bus: discovery, addressing, EEPROM fetch, mailbox bring-up, ESM
//! transitions, process-image mapping and the cyclic operations.
//!
//! One `Bus` exclusively owns every [`Slave`]; clients refer to slaves by
//! position. The init path talks to the wire synchronously through
//! [`Link::write_then_read`], the cyclic path queues datagrams whose
//! answers land in callbacks during `process_awaiting_frames`.

mod cyclic;
mod mapping;

pub use cyclic::*;
pub use mapping::{BlockIo, PiFrame, MAX_BLOCKS_PER_FRAME, MAX_PI_FRAMES};

use core::time::Duration;

use heapless::Vec;
use log::{debug, info, warn};

use crate::error::{EcatError, UnexpectedWkc};
use crate::frame::{Command, CommandType, Frame, SlaveAddress, TargetSlave};
use crate::link::{Link, OnError};
use crate::mailbox::{Message, MessageStatus};
use crate::port::RawPort;
use crate::register::*;
use crate::sii::word;
use crate::slave::{AlState, Slave};
use crate::time::{Clock, SystemTime};

/// Logical address of the first process-image frame.
pub const LOGICAL_START_ADDRESS: u32 = 0x1000;

/// First configured station address; slave at position p gets 1000 + p.
pub const FIRST_STATION_ADDRESS: u16 = 1000;

const INIT_TIMEOUT: Duration = Duration::from_secs(1);
const PREOP_TIMEOUT: Duration = Duration::from_secs(3);
const EEPROM_READY_TRIES: usize = 10;

/// State shared with the datagram callbacks: everything a reply may touch.
pub struct BusData<'a> {
    pub(crate) slaves: &'a mut [Slave],
    pub(crate) slave_count: usize,
    pub(crate) pi_frames: Vec<PiFrame, MAX_PI_FRAMES>,
    pub(crate) iomap: Option<&'a mut [u8]>,
    /// Snapshot of the clock taken at the start of the current tick.
    pub(crate) now: SystemTime,
    pub(crate) invalid_wkc_count: usize,
}

impl<'a> BusData<'a> {
    pub fn slaves(&self) -> &[Slave] {
        &self.slaves[..self.slave_count]
    }

    pub fn slaves_mut(&mut self) -> &mut [Slave] {
        &mut self.slaves[..self.slave_count]
    }
}

/// Error callback signature for the cyclic `send_*` operations.
pub type BusErrorFn<'a> = OnError<BusData<'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Partial,
    Complete,
    /// One upload per subindex, packed back to back; for slaves without
    /// real complete-access support.
    EmulateComplete,
}

pub struct Bus<'a, N, R, C>
where
    N: RawPort,
    R: RawPort,
    C: Clock,
{
    pub(crate) link: Link<N, R, BusData<'a>>,
    pub(crate) data: BusData<'a>,
    pub(crate) clock: C,
    tiny_wait: Duration,
    big_wait: Duration,
}

impl<'a, N, R, C> Bus<'a, N, R, C>
where
    N: RawPort,
    R: RawPort,
    C: Clock,
{
    /// `slaves` is the storage for every slave the bus may discover.
    pub fn new(link: Link<N, R, BusData<'a>>, clock: C, slaves: &'a mut [Slave]) -> Self {
        Self {
            link,
            data: BusData {
                slaves,
                slave_count: 0,
                pi_frames: Vec::new(),
                iomap: None,
                now: SystemTime::ZERO,
                invalid_wkc_count: 0,
            },
            clock,
            tiny_wait: Duration::from_micros(200),
            big_wait: Duration::from_millis(10),
        }
    }

    /// Adapt the polling sleeps; unit tests zero them.
    pub fn configure_wait_latency(&mut self, tiny: Duration, big: Duration) {
        self.tiny_wait = tiny;
        self.big_wait = big;
    }

    pub fn detected_slaves(&self) -> usize {
        self.data.slave_count
    }

    pub fn slaves(&self) -> &[Slave] {
        self.data.slaves()
    }

    pub fn slaves_mut(&mut self) -> &mut [Slave] {
        self.data.slaves_mut()
    }

    pub fn slave_by_address(&self, address: u16) -> Option<usize> {
        self.data.slaves().iter().position(|s| s.address == address)
    }

    pub fn invalid_wkc_count(&self) -> usize {
        self.data.invalid_wkc_count
    }

    pub fn lost_frame_count(&self) -> usize {
        self.link.lost_frame_count()
    }

    // ------------------------------------------------------------------
    // write-then-read primitives (init path)
    // ------------------------------------------------------------------

    fn transfer(&mut self, command: Command, data: &[u8], size: u16) -> Result<Frame, EcatError> {
        let mut frame = Frame::new();
        frame.add_datagram(0, command, data, size)?;
        self.link.write_then_read(&mut frame)?;
        Ok(frame)
    }

    pub(crate) fn broadcast_read(&mut self, ado: u16, size: u16) -> Result<u16, EcatError> {
        let mut frame =
            self.transfer(Command::new(CommandType::BRD, 0, ado), &[], size)?;
        let (_, _, wkc) = frame.next_datagram().ok_or(EcatError::InvalidFrame)?;
        Ok(wkc)
    }

    pub(crate) fn broadcast_write(&mut self, ado: u16, data: &[u8]) -> Result<u16, EcatError> {
        let mut frame = self.transfer(
            Command::new(CommandType::BWR, 0, ado),
            data,
            data.len() as u16,
        )?;
        let (_, _, wkc) = frame.next_datagram().ok_or(EcatError::InvalidFrame)?;
        Ok(wkc)
    }

    /// Position-addressed write, used once to assign station addresses.
    fn position_write(&mut self, position: u16, ado: u16, data: &[u8]) -> Result<u16, EcatError> {
        let command = Command::new_write(
            TargetSlave::Single(SlaveAddress::Position(position)),
            ado,
        );
        let mut frame = self.transfer(command, data, data.len() as u16)?;
        let (_, _, wkc) = frame.next_datagram().ok_or(EcatError::InvalidFrame)?;
        Ok(wkc)
    }

    /// Station-addressed read; the reply payload is copied into `data`.
    pub(crate) fn station_read(
        &mut self,
        address: u16,
        ado: u16,
        data: &mut [u8],
    ) -> Result<u16, EcatError> {
        let command =
            Command::new_read(TargetSlave::Single(SlaveAddress::Station(address)), ado);
        let mut frame = self.transfer(command, &[], data.len() as u16)?;
        let (_, payload, wkc) = frame.next_datagram().ok_or(EcatError::InvalidFrame)?;
        let size = data.len().min(payload.len());
        data[..size].copy_from_slice(&payload[..size]);
        Ok(wkc)
    }

    pub(crate) fn station_write(
        &mut self,
        address: u16,
        ado: u16,
        data: &[u8],
    ) -> Result<u16, EcatError> {
        let command =
            Command::new_write(TargetSlave::Single(SlaveAddress::Station(address)), ado);
        let mut frame = self.transfer(command, data, data.len() as u16)?;
        let (_, _, wkc) = frame.next_datagram().ok_or(EcatError::InvalidFrame)?;
        Ok(wkc)
    }

    // ------------------------------------------------------------------
    // init sequence
    // ------------------------------------------------------------------

    /// Bring the bus from an unknown state to PRE-OP: discovery, reset,
    /// watchdogs, addressing, EEPROM fetch and mailbox configuration.
    /// `watchdog` is the PDI/PDO watchdog, in 100us steps internally.
    pub fn init(&mut self, watchdog: Duration) -> Result<(), EcatError> {
        self.detect_slaves()?;
        self.reset_slaves()?;
        self.configure_watchdogs(watchdog)?;

        // EEPROM back under ECAT control, in case a slave left it to PDI.
        self.broadcast_write(EepromAccess::ADDRESS, &[0, 0])?;

        self.set_addresses()?;

        self.request_state(AlState::Init)?;
        self.wait_for_state(AlState::Init, INIT_TIMEOUT, None)?;

        self.fetch_eeprom()?;
        self.configure_mailboxes()?;

        self.request_state(AlState::PreOperational)?;
        self.wait_for_state(AlState::PreOperational, PREOP_TIMEOUT, None)?;

        // One mailbox round to drain anything a slave still holds.
        self.send_mailboxes_write_checks(crate::link::ignore_error)?;
        self.send_mailboxes_read_checks(crate::link::ignore_error)?;
        self.process_awaiting_frames()?;
        self.send_read_messages(crate::link::ignore_error)?;
        self.process_awaiting_frames()?;

        info!("bus init done: {} slave(s) in PRE-OP", self.data.slave_count);
        Ok(())
    }

    fn detect_slaves(&mut self) -> Result<(), EcatError> {
        let wkc = self.broadcast_read(TYPE_ADDRESS, 1)?;
        if wkc == 0 {
            return Err(EcatError::NoSlaveDetected);
        }
        if wkc as usize > self.data.slaves.len() {
            return Err(EcatError::TooManySlaves(wkc));
        }
        self.data.slave_count = wkc as usize;
        for position in 0..self.data.slave_count {
            self.data.slaves[position] = Slave {
                address: FIRST_STATION_ADDRESS + position as u16,
                ..Slave::default()
            };
        }
        debug!("detected {} slave(s)", wkc);
        Ok(())
    }

    /// One broadcast write per register block that must not carry stale
    /// state into a new session.
    fn reset_slaves(&mut self) -> Result<(), EcatError> {
        let zeros = [0u8; 256];
        self.broadcast_write(FmmuEntry::BASE, &zeros[..256])?;
        self.broadcast_write(SyncManagerChannel::BASE, &zeros[..128])?;
        self.broadcast_write(DC_CYCLIC_CONTROL_ADDRESS, &zeros[..1])?;
        self.broadcast_write(DC_SYNC_ACTIVATION_ADDRESS, &zeros[..1])?;
        self.broadcast_write(DC_SYSTEM_TIME_ADDRESS, &zeros[..8])?;
        self.broadcast_write(ErrorCounters::ADDRESS, &zeros[..ErrorCounters::SIZE])?;
        self.broadcast_write(ECAT_EVENT_MASK_ADDRESS, &[0xFF, 0xFF])?;
        Ok(())
    }

    fn configure_watchdogs(&mut self, watchdog: Duration) -> Result<(), EcatError> {
        let ticks = watchdog.as_micros() / 100;
        if ticks > u16::MAX as u128 {
            return Err(EcatError::InvalidWatchdog);
        }
        let time = (ticks as u16).to_le_bytes();

        self.broadcast_write(
            WatchdogDivider::ADDRESS,
            &WatchdogDivider::DEFAULT_100US.to_le_bytes(),
        )?;
        self.broadcast_write(PdiWatchdog::ADDRESS, &time)?;
        self.broadcast_write(PdoWatchdog::ADDRESS, &time)?;
        Ok(())
    }

    fn set_addresses(&mut self) -> Result<(), EcatError> {
        for position in 0..self.data.slave_count {
            let address = self.data.slaves[position].address;
            let wkc =
                self.position_write(position as u16, StationAddress::ADDRESS, &address.to_le_bytes())?;
            if wkc != 1 {
                return Err(UnexpectedWkc { expected: 1, received: wkc }.into());
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // ESM
    // ------------------------------------------------------------------

    /// Request `state` from every slave at once.
    pub fn request_state(&mut self, state: AlState) -> Result<(), EcatError> {
        let mut control = AlControl::new();
        control.set_state(state as u8);
        let wkc = self.broadcast_write(AlControl::ADDRESS, &control.0)?;
        if wkc as usize != self.data.slave_count {
            return Err(UnexpectedWkc {
                expected: self.data.slave_count as u16,
                received: wkc,
            }
            .into());
        }
        debug!("requested state {:?}", state);
        Ok(())
    }

    /// Refresh one slave's AL status. A slave flagging an error raises
    /// `AlStatusCode`; a bad working counter leaves the record untouched.
    pub fn get_current_state(&mut self, position: usize) -> Result<AlState, EcatError> {
        let address = self.data.slaves[position].address;
        let mut status = [0u8; AlStatus::SIZE];
        let wkc = self.station_read(address, AlStatus::ADDRESS, &mut status)?;
        if wkc != 1 {
            return Ok(self.data.slaves[position].al_state());
        }

        let view = AlStatus(&status[..]);
        let slave = &mut self.data.slaves[position];
        slave.al_status = status[0];
        slave.al_status_code = view.al_status_code();
        if slave.error_acknowledged() {
            warn!(
                "slave {} error: {:#06x} ({})",
                address,
                slave.al_status_code,
                crate::al_status_code::AlStatusCode::from(slave.al_status_code).description()
            );
            return Err(EcatError::AlStatusCode {
                slave: address,
                code: slave.al_status_code,
            });
        }
        Ok(slave.al_state())
    }

    /// Poll every slave until all reached `target`. `cyclic` runs once per
    /// loop so process data can keep flowing while ramping to OPERATIONAL.
    pub fn wait_for_state(
        &mut self,
        target: AlState,
        timeout: Duration,
        cyclic: Option<fn(&mut Self)>,
    ) -> Result<(), EcatError> {
        let start = self.clock.since_epoch();
        loop {
            let mut reached = true;
            for position in 0..self.data.slave_count {
                if self.get_current_state(position)? != target {
                    reached = false;
                }
            }
            if reached {
                debug!("all slaves reached {:?}", target);
                return Ok(());
            }
            if let Some(callback) = cyclic {
                callback(self);
            }
            self.clock.sleep(self.tiny_wait);
            if self.clock.elapsed(start) > timeout {
                return Err(EcatError::Timeout);
            }
        }
    }

    // ------------------------------------------------------------------
    // EEPROM
    // ------------------------------------------------------------------

    /// Read one 4-byte EEPROM chunk at `word_address` from every slave,
    /// handing each value to `apply`.
    fn eeprom_read(
        &mut self,
        word_address: u16,
        apply: &mut dyn FnMut(&mut Slave, u32),
    ) -> Result<(), EcatError> {
        let mut request = [0u8; 6];
        request[..2].copy_from_slice(&eeprom_command::READ.to_le_bytes());
        request[2..].copy_from_slice(&(word_address as u32).to_le_bytes());
        self.broadcast_write(EepromControl::ADDRESS, &request)?;

        self.wait_eeprom_ready()?;

        for position in 0..self.data.slave_count {
            let address = self.data.slaves[position].address;
            let mut data = [0u8; 4];
            let wkc = self.station_read(address, EepromData::ADDRESS, &mut data)?;
            if wkc != 1 {
                return Err(UnexpectedWkc { expected: 1, received: wkc }.into());
            }
            apply(&mut self.data.slaves[position], u32::from_le_bytes(data));
        }
        Ok(())
    }

    fn wait_eeprom_ready(&mut self) -> Result<(), EcatError> {
        for position in 0..self.data.slave_count {
            let address = self.data.slaves[position].address;
            let mut tries = 0;
            loop {
                let mut control = [0u8; EepromControl::SIZE];
                self.station_read(address, EepromControl::ADDRESS, &mut control)?;
                let view = EepromControl(&control[..]);
                if view.command_error() {
                    return Err(crate::error::EepromError::CommandError.into());
                }
                if !view.busy() {
                    break;
                }
                tries += 1;
                if tries >= EEPROM_READY_TRIES {
                    return Err(crate::error::EepromError::Busy.into());
                }
                self.clock.sleep(self.tiny_wait);
            }
        }
        Ok(())
    }

    fn fetch_eeprom(&mut self) -> Result<(), EcatError> {
        self.eeprom_read(word::VENDOR_ID, &mut |s, w| s.vendor_id = w)?;
        self.eeprom_read(word::PRODUCT_CODE, &mut |s, w| s.product_code = w)?;
        self.eeprom_read(word::REVISION_NUMBER, &mut |s, w| s.revision_number = w)?;
        self.eeprom_read(word::SERIAL_NUMBER, &mut |s, w| s.serial_number = w)?;

        self.eeprom_read(word::BOOTSTRAP_MAILBOX, &mut |s, w| {
            s.mailbox_bootstrap.recv_offset = w as u16;
            s.mailbox_bootstrap.recv_size = (w >> 16) as u16;
        })?;
        self.eeprom_read(word::BOOTSTRAP_MAILBOX + 2, &mut |s, w| {
            s.mailbox_bootstrap.send_offset = w as u16;
            s.mailbox_bootstrap.send_size = (w >> 16) as u16;
        })?;
        self.eeprom_read(word::STANDARD_MAILBOX, &mut |s, w| {
            s.mailbox.recv_offset = w as u16;
            s.mailbox.recv_size = (w >> 16) as u16;
        })?;
        self.eeprom_read(word::STANDARD_MAILBOX + 2, &mut |s, w| {
            s.mailbox.send_offset = w as u16;
            s.mailbox.send_size = (w >> 16) as u16;
        })?;
        self.eeprom_read(word::MAILBOX_PROTOCOL, &mut |s, w| {
            s.supported_mailbox = w as u16;
        })?;
        self.eeprom_read(word::EEPROM_SIZE, &mut |s, w| {
            s.eeprom_size = w as u16;
            s.eeprom_version = (w >> 16) as u16;
        })?;

        self.fetch_eeprom_categories()?;

        for position in 0..self.data.slave_count {
            let slave = &mut self.data.slaves[position];
            slave.sii.parse();
            debug!(
                "slave {}: vendor {:#010x} product {:#010x}, {} TxPDO / {} RxPDO entries",
                slave.address,
                slave.vendor_id,
                slave.product_code,
                slave.sii.tx_pdo.len(),
                slave.sii.rx_pdo.len()
            );
        }
        Ok(())
    }

    /// Stream the category area into each slave's SII buffer until every
    /// slave saw its End marker (or ran out of room).
    fn fetch_eeprom_categories(&mut self) -> Result<(), EcatError> {
        let mut word_address = word::START_CATEGORY;
        let last_word = word::START_CATEGORY + 2 * crate::sii::SII_BUFFER_WORDS as u16;

        loop {
            let mut busy = false;
            self.eeprom_read(word_address, &mut |s, w| {
                if !category_stream_done(&s.sii) && s.sii.buffer.push(w).is_ok() {
                    busy = true;
                }
            })?;
            word_address += 2;
            if !busy || word_address >= last_word {
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // mailbox bring-up and client API
    // ------------------------------------------------------------------

    fn configure_mailboxes(&mut self) -> Result<(), EcatError> {
        for position in 0..self.data.slave_count {
            if self.data.slaves[position].supported_mailbox == 0 {
                continue;
            }
            let address = self.data.slaves[position].address;
            let config = self.data.slaves[position].mailbox.generate_sm_config();
            let wkc = self.station_write(address, SyncManagerChannel::BASE, &config)?;
            if wkc != 1 {
                return Err(UnexpectedWkc { expected: 1, received: wkc }.into());
            }
            if self.data.slaves[position].supports_coe() {
                self.data.slaves[position].mailbox.attach_emergency_listener();
            }
        }
        Ok(())
    }

    /// Poll mailbox states then exchange messages until the pending client
    /// message of `position` completes.
    fn wait_for_message(
        &mut self,
        position: usize,
        timeout: Duration,
    ) -> Result<Message, EcatError> {
        let start = self.clock.since_epoch();
        loop {
            let round: Result<(), EcatError> = (|| {
                self.send_mailboxes_write_checks(crate::link::fail_on_error)?;
                self.send_mailboxes_read_checks(crate::link::fail_on_error)?;
                self.process_awaiting_frames()?;
                self.send_write_messages(crate::link::fail_on_error)?;
                self.send_read_messages(crate::link::fail_on_error)?;
                self.process_awaiting_frames()
            })();
            if let Err(err) = round {
                self.data.slaves[position].mailbox.cancel_client_messages();
                return Err(err);
            }

            if let Some(message) = self.data.slaves[position].mailbox.take_completed() {
                return Ok(message);
            }

            self.clock.sleep(self.tiny_wait);
            if self.clock.elapsed(start) > timeout {
                self.data.slaves[position].mailbox.cancel_client_messages();
                return Err(EcatError::Timeout);
            }
        }
    }

    fn read_sdo_once(
        &mut self,
        position: usize,
        index: u16,
        subindex: u8,
        complete_access: bool,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, EcatError> {
        self.data.slaves[position].mailbox.create_sdo_upload(
            index,
            subindex,
            complete_access,
            data.len(),
            timeout,
        )?;
        let message = self.wait_for_message(position, timeout)?;
        match message.status() {
            MessageStatus::Success => {
                let payload = message.coe_data();
                let size = payload.len().min(data.len());
                data[..size].copy_from_slice(&payload[..size]);
                Ok(size)
            }
            MessageStatus::TimedOut => Err(EcatError::Timeout),
            status => Err(EcatError::Mailbox(status)),
        }
    }

    /// Read an object dictionary entry. Returns the byte size read.
    /// With `Access::EmulateComplete` the global timeout is at most
    /// N * `timeout` for an object of N subindexes.
    pub fn read_sdo(
        &mut self,
        position: usize,
        index: u16,
        subindex: u8,
        access: Access,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, EcatError> {
        match access {
            Access::Partial => {
                self.read_sdo_once(position, index, subindex, false, data, timeout)
            }
            Access::Complete => {
                self.read_sdo_once(position, index, subindex, true, data, timeout)
            }
            Access::EmulateComplete => {
                let mut head = [0u8; 4];
                self.read_sdo_once(position, index, 0, false, &mut head, timeout)?;
                let count = head[0];

                let mut cursor = 0usize;
                for sub in 1..=count {
                    let size = self.read_sdo_once(
                        position,
                        index,
                        sub,
                        false,
                        &mut data[cursor..],
                        timeout,
                    )?;
                    cursor += size;
                }
                Ok(cursor)
            }
        }
    }

    /// Write an object dictionary entry.
    pub fn write_sdo(
        &mut self,
        position: usize,
        index: u16,
        subindex: u8,
        complete_access: bool,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), EcatError> {
        self.data.slaves[position].mailbox.create_sdo_download(
            index,
            subindex,
            complete_access,
            data,
            timeout,
        )?;
        let message = self.wait_for_message(position, timeout)?;
        match message.status() {
            MessageStatus::Success => Ok(()),
            MessageStatus::TimedOut => Err(EcatError::Timeout),
            status => Err(EcatError::Mailbox(status)),
        }
    }

    /// Funnel an external gateway request to the slave its mailbox header
    /// addresses. Returns the position handling it.
    pub fn add_gateway_message(
        &mut self,
        raw: &[u8],
        gateway_index: u16,
        timeout: Duration,
    ) -> Result<usize, EcatError> {
        let address = crate::frame::MailboxHeader(raw).address();
        let position = self
            .slave_by_address(address)
            .ok_or(EcatError::NoSuchSlave(address))?;
        self.data.slaves[position]
            .mailbox
            .create_gateway_message(raw, gateway_index, timeout)?;
        Ok(position)
    }

    /// Completed gateway reply for `gateway_index` on slave `position`.
    pub fn take_gateway_reply(&mut self, position: usize, gateway_index: u16) -> Option<Message> {
        let mailbox = &mut self.data.slaves[position].mailbox;
        let message = mailbox.take_completed_gateway()?;
        if message.gateway_index() != Some(gateway_index) {
            // Another request of the same slave finished first.
            mailbox.put_back_completed_gateway(message);
            return None;
        }
        Some(message)
    }

    /// Reset the 0x300 error counter block of every slave.
    pub fn clear_error_counters(&mut self) -> Result<(), EcatError> {
        let zeros = [0u8; ErrorCounters::SIZE];
        let wkc = self.broadcast_write(ErrorCounters::ADDRESS, &zeros)?;
        if wkc as usize != self.data.slave_count {
            return Err(UnexpectedWkc {
                expected: self.data.slave_count as u16,
                received: wkc,
            }
            .into());
        }
        Ok(())
    }
}

/// True once the buffer holds a complete category chain (End header seen).
fn category_stream_done(sii: &crate::sii::Sii) -> bool {
    let total = sii.buffer.len() * 4;
    let byte = |i: usize| (sii.buffer[i / 4] >> (8 * (i % 4))) as u8;
    let word_at = |i: usize| byte(i) as u16 | (byte(i + 1) as u16) << 8;

    let mut pos = 0usize;
    loop {
        if pos + 4 > total {
            return false;
        }
        if word_at(pos) == 0xFFFF {
            return true;
        }
        let size = word_at(pos + 2) as usize * 2;
        pos += 4 + size;
    }
}
