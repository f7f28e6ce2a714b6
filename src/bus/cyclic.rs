//! Cyclic operations: each `send_*` queues datagrams through the link,
//! `process_awaiting_frames` collects the answers and dispatches them to
//! the callbacks below. Working counters are checked against the EtherCAT
//! rules: reads count 1 per reading slave, writes 1 per writing slave,
//! read-writes 1 + 2.

use log::warn;

use crate::bus::{Bus, BusData, BusErrorFn};
use crate::error::{DatagramState, EcatError};
use crate::frame::{Command, CommandType, SlaveAddress, TargetSlave, MAX_DATAGRAM_PAYLOAD};
use crate::link::ReplyHeader;
use crate::port::RawPort;
use crate::register::{AlStatus, DlStatus, ErrorCounters, SyncManagerChannel};
use crate::time::Clock;

impl<'a, N, R, C> Bus<'a, N, R, C>
where
    N: RawPort,
    R: RawPort,
    C: Clock,
{
    /// Collect every answer of the datagrams queued so far and run their
    /// callbacks; the per-datagram error callbacks run last.
    pub fn process_awaiting_frames(&mut self) -> Result<(), EcatError> {
        self.data.now = self.clock.since_epoch();
        self.link.process_datagrams(&mut self.data)
    }

    /// Keep-alive that touches no slave.
    pub fn send_nop(&mut self, on_error: BusErrorFn<'a>) -> Result<(), EcatError> {
        self.link.add_datagram(
            Command::new(CommandType::NOP, 0, 0),
            &[],
            1,
            on_nop_reply,
            on_error,
            0,
        )
    }

    /// One LRD per process-image frame; inputs land in the io buffer.
    pub fn send_logical_read(&mut self, on_error: BusErrorFn<'a>) -> Result<(), EcatError> {
        for index in 0..self.data.pi_frames.len() {
            let frame = &self.data.pi_frames[index];
            let (address, size) = (frame.address, frame.size);
            self.link.add_datagram(
                Command::new_logical(CommandType::LRD, address),
                &[],
                size as u16,
                on_logical_read_reply,
                on_error,
                index as u32,
            )?;
        }
        Ok(())
    }

    /// One LWR per process-image frame, gathered from the io buffer.
    pub fn send_logical_write(&mut self, on_error: BusErrorFn<'a>) -> Result<(), EcatError> {
        self.send_logical_out(CommandType::LWR, on_logical_write_reply, on_error)
    }

    /// One LRW per process-image frame: outputs go out, inputs come back.
    pub fn send_logical_read_write(&mut self, on_error: BusErrorFn<'a>) -> Result<(), EcatError> {
        self.send_logical_out(CommandType::LRW, on_logical_read_write_reply, on_error)
    }

    fn send_logical_out(
        &mut self,
        command: CommandType,
        on_reply: crate::link::OnReply<BusData<'a>>,
        on_error: BusErrorFn<'a>,
    ) -> Result<(), EcatError> {
        for index in 0..self.data.pi_frames.len() {
            let mut payload = [0u8; MAX_DATAGRAM_PAYLOAD];
            let frame = &self.data.pi_frames[index];
            let (address, size) = (frame.address, frame.size);
            if let Some(iomap) = self.data.iomap.as_deref() {
                for block in &frame.outputs {
                    payload[block.frame_offset..block.frame_offset + block.size]
                        .copy_from_slice(&iomap[block.io_offset..block.io_offset + block.size]);
                }
            }
            self.link.add_datagram(
                Command::new_logical(command, address),
                &payload[..size],
                size as u16,
                on_reply,
                on_error,
                index as u32,
            )?;
        }
        Ok(())
    }

    /// Refresh the 0x300 error counter block of every slave.
    pub fn send_refresh_error_counters(
        &mut self,
        on_error: BusErrorFn<'a>,
    ) -> Result<(), EcatError> {
        for position in 0..self.data.slave_count {
            let address = self.data.slaves[position].address;
            self.link.add_datagram(
                station_read(address, ErrorCounters::ADDRESS),
                &[],
                ErrorCounters::SIZE as u16,
                on_error_counters_reply,
                on_error,
                position as u32,
            )?;
        }
        Ok(())
    }

    /// Poll SM1 status of every mailbox slave: is there something to read?
    pub fn send_mailboxes_read_checks(
        &mut self,
        on_error: BusErrorFn<'a>,
    ) -> Result<(), EcatError> {
        for position in 0..self.data.slave_count {
            let slave = &self.data.slaves[position];
            if slave.supported_mailbox == 0 {
                continue;
            }
            let address = slave.address;
            self.link.add_datagram(
                station_read(address, SyncManagerChannel::status_address(1)),
                &[],
                1,
                on_read_check_reply,
                on_error,
                position as u32,
            )?;
        }
        Ok(())
    }

    /// Poll SM0 status of every mailbox slave: is there room to write?
    pub fn send_mailboxes_write_checks(
        &mut self,
        on_error: BusErrorFn<'a>,
    ) -> Result<(), EcatError> {
        for position in 0..self.data.slave_count {
            let slave = &self.data.slaves[position];
            if slave.supported_mailbox == 0 {
                continue;
            }
            let address = slave.address;
            self.link.add_datagram(
                station_read(address, SyncManagerChannel::status_address(0)),
                &[],
                1,
                on_write_check_reply,
                on_error,
                position as u32,
            )?;
        }
        Ok(())
    }

    /// Fetch the send-mailbox of every slave flagged readable.
    pub fn send_read_messages(&mut self, on_error: BusErrorFn<'a>) -> Result<(), EcatError> {
        for position in 0..self.data.slave_count {
            let slave = &self.data.slaves[position];
            if !slave.mailbox.can_read {
                continue;
            }
            let (address, offset, size) = (
                slave.address,
                slave.mailbox.send_offset,
                slave.mailbox.send_size,
            );
            self.link.add_datagram(
                station_read(address, offset),
                &[],
                size,
                on_read_message_reply,
                on_error,
                position as u32,
            )?;
        }
        Ok(())
    }

    /// Push the next pending message of every slave flagged writable.
    pub fn send_write_messages(&mut self, on_error: BusErrorFn<'a>) -> Result<(), EcatError> {
        let now = self.clock.since_epoch();
        let Self { link, data, .. } = self;
        for position in 0..data.slave_count {
            let slave = &mut data.slaves[position];
            if !slave.mailbox.can_write || !slave.mailbox.has_pending() {
                continue;
            }
            let (address, offset, size) = (
                slave.address,
                slave.mailbox.recv_offset,
                slave.mailbox.recv_size,
            );
            if let Some(message) = slave.mailbox.send(now) {
                link.add_datagram(
                    Command::new_write(
                        TargetSlave::Single(SlaveAddress::Station(address)),
                        offset,
                    ),
                    message.raw_data(),
                    size,
                    on_write_message_reply,
                    on_error,
                    position as u32,
                )?;
            }
        }
        Ok(())
    }

    /// Refresh the DL status word of every slave.
    pub fn send_get_dl_status(&mut self, on_error: BusErrorFn<'a>) -> Result<(), EcatError> {
        for position in 0..self.data.slave_count {
            let address = self.data.slaves[position].address;
            self.link.add_datagram(
                station_read(address, DlStatus::ADDRESS),
                &[],
                DlStatus::SIZE as u16,
                on_dl_status_reply,
                on_error,
                position as u32,
            )?;
        }
        Ok(())
    }

    /// Refresh AL status and AL status code of every slave. A slave
    /// flagging an error shows up through `Slave::error_acknowledged`;
    /// the synchronous `get_current_state` is the call that raises it.
    pub fn send_get_al_status(&mut self, on_error: BusErrorFn<'a>) -> Result<(), EcatError> {
        for position in 0..self.data.slave_count {
            let address = self.data.slaves[position].address;
            self.link.add_datagram(
                station_read(address, AlStatus::ADDRESS),
                &[],
                AlStatus::SIZE as u16,
                on_al_status_reply,
                on_error,
                position as u32,
            )?;
        }
        Ok(())
    }
}

fn station_read(address: u16, ado: u16) -> Command {
    Command::new_read(TargetSlave::Single(SlaveAddress::Station(address)), ado)
}

fn invalid_wkc(data: &mut BusData, expected: u16, wkc: u16) -> DatagramState {
    data.invalid_wkc_count += 1;
    warn!("invalid working counter: expected {}, got {}", expected, wkc);
    DatagramState::InvalidWkc
}

fn on_nop_reply(_: &mut BusData, _: u32, _: &ReplyHeader, _: &[u8], _: u16) -> DatagramState {
    DatagramState::Ok
}

fn on_logical_read_reply(
    data: &mut BusData,
    arg: u32,
    _header: &ReplyHeader,
    payload: &[u8],
    wkc: u16,
) -> DatagramState {
    let frame = &data.pi_frames[arg as usize];
    let expected = frame.inputs.len() as u16;
    if wkc != expected {
        return invalid_wkc(data, expected, wkc);
    }
    copy_inputs(data, arg as usize, payload);
    DatagramState::Ok
}

fn on_logical_write_reply(
    data: &mut BusData,
    arg: u32,
    _header: &ReplyHeader,
    _payload: &[u8],
    wkc: u16,
) -> DatagramState {
    let expected = data.pi_frames[arg as usize].outputs.len() as u16;
    if wkc != expected {
        return invalid_wkc(data, expected, wkc);
    }
    DatagramState::Ok
}

fn on_logical_read_write_reply(
    data: &mut BusData,
    arg: u32,
    _header: &ReplyHeader,
    payload: &[u8],
    wkc: u16,
) -> DatagramState {
    let frame = &data.pi_frames[arg as usize];
    let expected = (frame.inputs.len() + 2 * frame.outputs.len()) as u16;
    if wkc != expected {
        return invalid_wkc(data, expected, wkc);
    }
    copy_inputs(data, arg as usize, payload);
    DatagramState::Ok
}

fn copy_inputs(data: &mut BusData, frame_index: usize, payload: &[u8]) {
    let BusData { pi_frames, iomap, .. } = data;
    let Some(iomap) = iomap.as_deref_mut() else {
        return;
    };
    for block in &pi_frames[frame_index].inputs {
        if block.frame_offset + block.size > payload.len() {
            continue;
        }
        iomap[block.io_offset..block.io_offset + block.size]
            .copy_from_slice(&payload[block.frame_offset..block.frame_offset + block.size]);
    }
}

fn on_error_counters_reply(
    data: &mut BusData,
    arg: u32,
    _header: &ReplyHeader,
    payload: &[u8],
    wkc: u16,
) -> DatagramState {
    if wkc != 1 {
        return invalid_wkc(data, 1, wkc);
    }
    let slave = &mut data.slaves[arg as usize];
    let size = ErrorCounters::SIZE.min(payload.len());
    slave.error_counters.0[..size].copy_from_slice(&payload[..size]);
    DatagramState::Ok
}

fn on_read_check_reply(
    data: &mut BusData,
    arg: u32,
    _header: &ReplyHeader,
    payload: &[u8],
    wkc: u16,
) -> DatagramState {
    let slave = &mut data.slaves[arg as usize];
    if wkc != 1 {
        slave.mailbox.can_read = false;
        return invalid_wkc(data, 1, wkc);
    }
    slave.mailbox.can_read = payload[0] & SyncManagerChannel::MAILBOX_FULL != 0;
    DatagramState::Ok
}

fn on_write_check_reply(
    data: &mut BusData,
    arg: u32,
    _header: &ReplyHeader,
    payload: &[u8],
    wkc: u16,
) -> DatagramState {
    let slave = &mut data.slaves[arg as usize];
    if wkc != 1 {
        slave.mailbox.can_write = false;
        return invalid_wkc(data, 1, wkc);
    }
    slave.mailbox.can_write = payload[0] & SyncManagerChannel::MAILBOX_FULL == 0;
    DatagramState::Ok
}

fn on_read_message_reply(
    data: &mut BusData,
    arg: u32,
    _header: &ReplyHeader,
    payload: &[u8],
    wkc: u16,
) -> DatagramState {
    let now = data.now;
    let slave = &mut data.slaves[arg as usize];
    slave.mailbox.can_read = false;
    if wkc != 1 {
        return invalid_wkc(data, 1, wkc);
    }
    slave.mailbox.receive(payload, now);
    DatagramState::Ok
}

fn on_write_message_reply(
    data: &mut BusData,
    arg: u32,
    _header: &ReplyHeader,
    _payload: &[u8],
    wkc: u16,
) -> DatagramState {
    if wkc != 1 {
        // The slave did not take the message; it will expire on its own.
        return invalid_wkc(data, 1, wkc);
    }
    data.slaves[arg as usize].mailbox.can_write = false;
    DatagramState::Ok
}

fn on_dl_status_reply(
    data: &mut BusData,
    arg: u32,
    _header: &ReplyHeader,
    payload: &[u8],
    wkc: u16,
) -> DatagramState {
    if wkc != 1 {
        return invalid_wkc(data, 1, wkc);
    }
    data.slaves[arg as usize].dl_status = u16::from_le_bytes([payload[0], payload[1]]);
    DatagramState::Ok
}

fn on_al_status_reply(
    data: &mut BusData,
    arg: u32,
    _header: &ReplyHeader,
    payload: &[u8],
    wkc: u16,
) -> DatagramState {
    if wkc != 1 {
        return invalid_wkc(data, 1, wkc);
    }
    let slave = &mut data.slaves[arg as usize];
    slave.al_status = payload[0];
    slave.al_status_code = AlStatus(payload).al_status_code();
    DatagramState::Ok
}
