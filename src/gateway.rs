//! ETG.8200 diagnostic gateway: funnel mailbox requests received on an
//! external datagram socket into the bus' mailbox engine, and send the
//! replies back to their requesters.
//!
//! The gateway is driven from the same control loop as the bus: call
//! [`Gateway::fetch_request`] and [`Gateway::process_replies`] once per
//! tick around the mailbox exchanges.

use core::time::Duration;

use heapless::Vec;
use log::{debug, warn};

use crate::bus::Bus;
use crate::error::{EcatError, PhyError};
use crate::frame::{
    EthercatHeader, EthercatType, MailboxHeader, ETHERCAT_HEADER_SIZE, MAILBOX_HEADER_SIZE,
    MAX_FRAME_SIZE,
};
use crate::mailbox::{MessageStatus, GATEWAY_MAX_REQUEST, MAX_MAILBOX_FRAME};
use crate::port::RawPort;
use crate::time::Clock;

/// How long a forwarded request may wait on the bus before it is dropped.
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(1);

const MAX_PENDING_REQUESTS: usize = 16;

/// Datagram endpoint of the diagnostic network (typically UDP port
/// 0x88A4). Implementations live outside the core.
pub trait DiagSocket {
    /// Non-blocking receive: `Ok(None)` when no request is waiting. The
    /// `u16` identifies the requester for [`DiagSocket::send_to`].
    fn recv(&mut self, frame: &mut [u8]) -> Result<Option<(usize, u16)>, PhyError>;

    fn send_to(&mut self, frame: &[u8], to: u16) -> Result<(), PhyError>;
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    gateway_index: u16,
    /// Slave position handling the request; None when the master itself
    /// answered at fetch time.
    slave: usize,
    origin: u16,
}

pub struct Gateway<S: DiagSocket> {
    socket: S,
    next_index: u16,
    pending: Vec<PendingRequest, MAX_PENDING_REQUESTS>,
}

impl<S: DiagSocket> Gateway<S> {
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            next_index: 0,
            pending: Vec::new(),
        }
    }

    fn allocate_index(&mut self) -> u16 {
        let index = self.next_index & (GATEWAY_MAX_REQUEST - 1);
        self.next_index = self.next_index.wrapping_add(1);
        index
    }

    /// Try to fetch one request from the diagnostic network, validate it
    /// and hand it to the addressed slave's mailbox.
    pub fn fetch_request<N, R, C>(&mut self, bus: &mut Bus<N, R, C>) -> Result<(), EcatError>
    where
        N: RawPort,
        R: RawPort,
        C: Clock,
    {
        let mut frame = [0u8; MAX_FRAME_SIZE];
        let (size, origin) = match self.socket.recv(&mut frame)? {
            Some(request) => request,
            None => return Ok(()),
        };

        // Payload must hold a mailbox frame behind the EtherCAT header.
        if size < ETHERCAT_HEADER_SIZE + MAILBOX_HEADER_SIZE {
            warn!("gateway: request too short ({} bytes)", size);
            return Ok(());
        }
        let header = EthercatHeader(&frame[..]);
        if header.ethercat_type() != EthercatType::Mailbox as u8 {
            warn!("gateway: not a mailbox request");
            return Ok(());
        }

        let raw = &frame[ETHERCAT_HEADER_SIZE..size];
        let declared = MAILBOX_HEADER_SIZE + MailboxHeader(raw).length() as usize;
        if declared > raw.len() || declared > MAX_MAILBOX_FRAME {
            warn!("gateway: mailbox length exceeds the datagram");
            return Ok(());
        }
        let raw = &raw[..declared];

        let gateway_index = self.allocate_index();
        let address = MailboxHeader(raw).address();
        if address == 0 {
            // Local address: the master itself. No object dictionary is
            // served here; answer with an SDO abort right away.
            self.answer_master_request(raw, origin)?;
            return Ok(());
        }

        match bus.add_gateway_message(raw, gateway_index, GATEWAY_TIMEOUT) {
            Ok(slave) => {
                debug!("gateway: request {} routed to slave {}", gateway_index, address);
                if self
                    .pending
                    .push(PendingRequest { gateway_index, slave, origin })
                    .is_err()
                {
                    warn!("gateway: pending table full, request dropped");
                }
            }
            Err(err) => {
                warn!("gateway: request refused: {:?}", err);
            }
        }
        Ok(())
    }

    /// Send back every request the bus completed; forget the timed out.
    pub fn process_replies<N, R, C>(&mut self, bus: &mut Bus<N, R, C>) -> Result<(), EcatError>
    where
        N: RawPort,
        R: RawPort,
        C: Clock,
    {
        let mut index = 0;
        while index < self.pending.len() {
            let request = self.pending[index];
            let Some(message) = bus.take_gateway_reply(request.slave, request.gateway_index)
            else {
                index += 1;
                continue;
            };

            if message.status() == MessageStatus::Success {
                self.send_reply(message.raw_data(), request.origin)?;
            } else {
                warn!(
                    "gateway: request {} ended with {:?}, no reply sent",
                    request.gateway_index,
                    message.status()
                );
            }
            self.pending.swap_remove(index);
        }
        Ok(())
    }

    fn send_reply(&mut self, mailbox_frame: &[u8], origin: u16) -> Result<(), EcatError> {
        let mut frame = [0u8; MAX_FRAME_SIZE];
        let size = MAILBOX_HEADER_SIZE + MailboxHeader(mailbox_frame).length() as usize;
        let size = size.min(mailbox_frame.len());
        {
            let mut header = EthercatHeader(&mut frame[..]);
            header.set_length(size as u16);
            header.set_ethercat_type(EthercatType::Mailbox as u8);
        }
        frame[ETHERCAT_HEADER_SIZE..ETHERCAT_HEADER_SIZE + size]
            .copy_from_slice(&mailbox_frame[..size]);
        self.socket
            .send_to(&frame[..ETHERCAT_HEADER_SIZE + size], origin)?;
        Ok(())
    }

    /// Master-addressed requests get an immediate SDO abort: the master
    /// does not expose an object dictionary on the diagnostic port.
    fn answer_master_request(&mut self, raw: &[u8], origin: u16) -> Result<(), EcatError> {
        use crate::frame::coe::{sdo_request, CoeHeader, CoeService, SdoHeader};

        let mut reply = [0u8; MAX_MAILBOX_FRAME];
        let size = raw.len().min(reply.len());
        reply[..size].copy_from_slice(&raw[..size]);

        if size >= MAILBOX_HEADER_SIZE + 2 + 4 + 4 {
            CoeHeader(&mut reply[MAILBOX_HEADER_SIZE..]).set_coe_service(CoeService::SdoResponse);
            let sdo_offset = MAILBOX_HEADER_SIZE + 2;
            SdoHeader(&mut reply[sdo_offset..]).set_command(sdo_request::ABORT);
            // Unsupported access, ETG standard code.
            reply[sdo_offset + 4..sdo_offset + 8]
                .copy_from_slice(&0x0601_0000u32.to_le_bytes());
        }
        debug!("gateway: master-addressed request aborted");
        self.send_reply(&reply[..size.max(MAILBOX_HEADER_SIZE)], origin)
    }
}
