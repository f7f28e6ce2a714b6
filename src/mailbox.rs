//! Per-slave mailbox engine: CoE SDO transfers, SDO Information queries,
//! emergency reception and gateway forwarding.
//!
//! Outgoing messages queue in `to_send`; once written to the slave they
//! move to `to_process` and every inbound mailbox frame is offered to them
//! in FIFO order until one claims it. Multi-part transfers re-queue
//! themselves, the emergency listener stays subscribed forever.

use core::time::Duration;

use heapless::{Deque, Vec};
use log::{debug, warn};

use crate::error::EcatError;
use crate::frame::coe::*;
use crate::frame::{
    MailboxErrorDetail, MailboxErrorFrame, MailboxHeader, MailboxType, MAILBOX_ERROR_SIZE,
    MAILBOX_HEADER_SIZE,
};
use crate::register::SyncManagerChannel;
use crate::time::SystemTime;

/// Cap on one mailbox frame we build or store. Slaves with a larger receive
/// mailbox still work; outgoing frames are simply never bigger than this.
pub const MAX_MAILBOX_FRAME: usize = 512;
/// Cap on reassembled CoE data (segmented uploads, OD lists).
pub const MAX_COE_DATA: usize = 2048;

const MAX_PENDING: usize = 4;
/// `to_process` holds pending messages plus the emergency listener.
const MAX_PROCESSING: usize = MAX_PENDING + 1;
const MAX_EMERGENCIES: usize = 8;

/// Top bit of the mailbox address field marks gateway-owned messages
/// (ETG.8200); the low 10 bits select one of 1024 concurrent requests.
pub const GATEWAY_MESSAGE_MASK: u16 = 1 << 15;
pub const GATEWAY_MAX_REQUEST: u16 = 1024;

const COE_OFFSET: usize = MAILBOX_HEADER_SIZE;
const SDO_OFFSET: usize = COE_OFFSET + COE_HEADER_SIZE;
const PAYLOAD_OFFSET: usize = SDO_OFFSET + SDO_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingResult {
    /// The frame is not related to this message.
    Noop,
    /// Terminal: message leaves the processing list.
    Finalize,
    /// Multi-part transfer: back to the send queue for the next part.
    Continue,
    /// Frame consumed, message stays subscribed (emergency listener,
    /// fragmented SDO-Info replies).
    FinalizeAndKeep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Running,
    Success,
    TimedOut,
    /// Response carried an unexpected SDO service.
    WrongService,
    /// Response carried a command this engine does not speak.
    UnknownService,
    ClientBufferTooSmall,
    BadToggleBit,
    /// The slave answered with a mailbox ERROR frame.
    MailboxError(MailboxErrorDetail),
    /// ETG abort code, as received.
    Abort(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emergency {
    pub error_code: u16,
    pub error_register: u8,
    pub data: [u8; 5],
}

#[derive(Debug)]
struct SdoTransfer {
    /// Current request command specifier; switches to UPLOAD_SEGMENTED
    /// during a segmented upload.
    command: u8,
    index: u16,
    subindex: u8,
    /// Complete-access flag of the initial request, reused as the toggle
    /// bit once the transfer goes segmented.
    toggle: bool,
    client_capacity: usize,
    received: Vec<u8, MAX_COE_DATA>,
}

#[derive(Debug)]
struct SdoInfoTransfer {
    opcode: u8,
    client_capacity: usize,
    received: Vec<u8, MAX_COE_DATA>,
}

#[derive(Debug)]
struct GatewayTransfer {
    gateway_index: u16,
    /// Address of the original request, restored in the reply.
    address: u16,
}

#[derive(Debug)]
enum MessageKind {
    Sdo(SdoTransfer),
    SdoInfo(SdoInfoTransfer),
    Emergency,
    Gateway(GatewayTransfer),
}

#[derive(Debug)]
pub struct Message {
    data: Vec<u8, MAX_MAILBOX_FRAME>,
    status: MessageStatus,
    timeout: Duration,
    deadline: Option<SystemTime>,
    kind: MessageKind,
}

impl Message {
    pub fn status(&self) -> MessageStatus {
        self.status
    }

    /// Reassembled CoE payload of an upload or SDO-Info exchange.
    pub fn coe_data(&self) -> &[u8] {
        match &self.kind {
            MessageKind::Sdo(sdo) => &sdo.received,
            MessageKind::SdoInfo(info) => &info.received,
            _ => &[],
        }
    }

    /// Raw mailbox frame; for a completed gateway message this is the
    /// reply to forward.
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    pub fn gateway_index(&self) -> Option<u16> {
        match &self.kind {
            MessageKind::Gateway(gw) => Some(gw.gateway_index),
            _ => None,
        }
    }

    fn is_client(&self) -> bool {
        matches!(self.kind, MessageKind::Sdo(_) | MessageKind::SdoInfo(_))
    }

    fn set_counter(&mut self, counter: u8) {
        if !self.data.is_empty() {
            MailboxHeader(&mut self.data[..]).set_count(counter & 0x7);
        }
    }

    fn prepare_for_send(&mut self, now: SystemTime) {
        if self.timeout != Duration::ZERO {
            self.deadline = Some(now + self.timeout);
        }
    }

    fn expired(&self, now: SystemTime) -> bool {
        matches!(self.deadline, Some(deadline) if now >= deadline)
    }
}

/// Ordered removal; heapless `Vec` only swap-removes.
fn take_at<const N: usize>(list: &mut Vec<Message, N>, index: usize) -> Message {
    list[index..].rotate_left(1);
    list.pop().unwrap()
}

#[derive(Debug, Default)]
pub struct Mailbox {
    pub recv_offset: u16,
    pub recv_size: u16,
    pub send_offset: u16,
    pub send_size: u16,

    /// Data waiting in the slave's send mailbox.
    pub can_read: bool,
    /// Room for a new message in the slave's receive mailbox.
    pub can_write: bool,

    /// Session handle, rotating 1..7. Zero never goes on the wire.
    counter: u8,

    to_send: Deque<Message, MAX_PENDING>,
    to_process: Vec<Message, MAX_PROCESSING>,
    pub emergencies: Vec<Emergency, MAX_EMERGENCIES>,

    completed: Option<Message>,
    completed_gateway: Option<Message>,
}

impl Mailbox {
    /// Next session handle: 1,2,...,7,1,...
    pub fn next_counter(&mut self) -> u8 {
        self.counter += 1;
        if self.counter > 7 {
            self.counter = 1;
        }
        self.counter
    }

    /// Mailbox SyncManager pair, ready to FPWR at register 0x800.
    /// SM0 is master to slave (write access), SM1 slave to master.
    pub fn generate_sm_config(&self) -> [u8; 16] {
        let mut config = [0u8; 16];
        {
            let mut sm0 = SyncManagerChannel(&mut config[..8]);
            sm0.set_start_address(self.recv_offset);
            sm0.set_length(self.recv_size);
            sm0.set_control(0x26); // 1 buffer, write access, PDI IRQ
            sm0.set_activate(1);
        }
        {
            let mut sm1 = SyncManagerChannel(&mut config[8..]);
            sm1.set_start_address(self.send_offset);
            sm1.set_length(self.send_size);
            sm1.set_control(0x22); // 1 buffer, read access, PDI IRQ
            sm1.set_activate(1);
        }
        config
    }

    fn frame_capacity(&self) -> usize {
        (self.recv_size as usize).min(MAX_MAILBOX_FRAME)
    }

    fn new_message(&self, kind: MessageKind, timeout: Duration) -> Message {
        let mut data = Vec::new();
        data.resize(self.frame_capacity(), 0).ok();
        Message {
            data,
            status: MessageStatus::Running,
            timeout,
            deadline: None,
            kind,
        }
    }

    fn enqueue(&mut self, mut message: Message) -> Result<(), EcatError> {
        message.set_counter(self.next_counter());
        self.to_send
            .push_back(message)
            .map_err(|_| EcatError::MailboxBufferTooSmall)
    }

    /// Queue one SDO upload request (read from the slave dictionary).
    /// `client_capacity` bounds the answer the client is ready to take.
    pub fn create_sdo_upload(
        &mut self,
        index: u16,
        subindex: u8,
        complete_access: bool,
        client_capacity: usize,
        timeout: Duration,
    ) -> Result<(), EcatError> {
        if self.recv_size == 0 {
            return Err(EcatError::MailboxInactive);
        }

        let mut message = self.new_message(
            MessageKind::Sdo(SdoTransfer {
                command: sdo_request::UPLOAD,
                index,
                subindex,
                toggle: complete_access,
                client_capacity: client_capacity.min(MAX_COE_DATA),
                received: Vec::new(),
            }),
            timeout,
        );

        {
            let mut header = MailboxHeader(&mut message.data[..]);
            header.set_length(10);
            header.set_address(0); // local processing
            header.set_mb_type(MailboxType::CoE);
        }
        CoeHeader(&mut message.data[COE_OFFSET..]).set_coe_service(CoeService::SdoRequest);
        {
            let mut sdo = SdoHeader(&mut message.data[SDO_OFFSET..]);
            sdo.set_command(sdo_request::UPLOAD);
            sdo.set_complete_access(complete_access);
            sdo.set_index(index);
            sdo.set_sub_index(subindex);
        }
        self.enqueue(message)
    }

    /// Queue one SDO download request (write to the slave dictionary).
    /// Expedited when the value fits 4 bytes; normal otherwise. Payloads
    /// larger than the receive mailbox would need a segmented download,
    /// which this engine does not implement.
    pub fn create_sdo_download(
        &mut self,
        index: u16,
        subindex: u8,
        complete_access: bool,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), EcatError> {
        if self.recv_size == 0 {
            return Err(EcatError::MailboxInactive);
        }
        if data.len() > 4
            && data.len() + PAYLOAD_OFFSET + 4 > self.frame_capacity()
        {
            return Err(EcatError::NotImplemented);
        }

        let mut message = self.new_message(
            MessageKind::Sdo(SdoTransfer {
                command: sdo_request::DOWNLOAD,
                index,
                subindex,
                toggle: complete_access,
                client_capacity: 0,
                received: Vec::new(),
            }),
            timeout,
        );

        {
            let mut header = MailboxHeader(&mut message.data[..]);
            header.set_address(0);
            header.set_mb_type(MailboxType::CoE);
        }
        CoeHeader(&mut message.data[COE_OFFSET..]).set_coe_service(CoeService::SdoRequest);
        {
            let mut sdo = SdoHeader(&mut message.data[SDO_OFFSET..]);
            sdo.set_command(sdo_request::DOWNLOAD);
            sdo.set_complete_access(complete_access);
            sdo.set_index(index);
            sdo.set_sub_index(subindex);
        }

        let mut length = 10u16;
        if data.len() <= 4 {
            // Expedited transfer: value packed in the header payload.
            let mut sdo = SdoHeader(&mut message.data[SDO_OFFSET..]);
            sdo.set_transfer_type(true);
            sdo.set_size_indicator(true);
            sdo.set_block_size(((4 - data.len()) & 0x3) as u8);
            message.data[PAYLOAD_OFFSET..PAYLOAD_OFFSET + data.len()].copy_from_slice(data);
        } else {
            SdoHeader(&mut message.data[SDO_OFFSET..]).set_size_indicator(true);
            length += data.len() as u16;
            message.data[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 4]
                .copy_from_slice(&(data.len() as u32).to_le_bytes());
            message.data[PAYLOAD_OFFSET + 4..PAYLOAD_OFFSET + 4 + data.len()]
                .copy_from_slice(data);
        }
        MailboxHeader(&mut message.data[..]).set_length(length);

        self.enqueue(message)
    }

    fn create_sdo_info(
        &mut self,
        opcode: u8,
        request: &[u8],
        client_capacity: usize,
        timeout: Duration,
    ) -> Result<(), EcatError> {
        if self.recv_size == 0 {
            return Err(EcatError::MailboxInactive);
        }

        let mut message = self.new_message(
            MessageKind::SdoInfo(SdoInfoTransfer {
                opcode,
                client_capacity: client_capacity.min(MAX_COE_DATA),
                received: Vec::new(),
            }),
            timeout,
        );

        {
            let mut header = MailboxHeader(&mut message.data[..]);
            header.set_length((COE_HEADER_SIZE + SDO_INFO_HEADER_SIZE + request.len()) as u16);
            header.set_address(0);
            header.set_mb_type(MailboxType::CoE);
        }
        CoeHeader(&mut message.data[COE_OFFSET..]).set_coe_service(CoeService::SdoInformation);
        SdoInfoHeader(&mut message.data[SDO_OFFSET..]).set_opcode(opcode);
        let payload = SDO_OFFSET + SDO_INFO_HEADER_SIZE;
        message.data[payload..payload + request.len()].copy_from_slice(request);

        self.enqueue(message)
    }

    /// Object dictionary list query (SDO Information GET_OD_LIST).
    pub fn create_sdo_info_get_od_list(
        &mut self,
        list_type: OdListType,
        client_capacity: usize,
        timeout: Duration,
    ) -> Result<(), EcatError> {
        let request = (list_type as u16).to_le_bytes();
        self.create_sdo_info(
            sdo_info_op::GET_OD_LIST_REQUEST,
            &request,
            client_capacity,
            timeout,
        )
    }

    /// Object description query (SDO Information GET_OD).
    pub fn create_sdo_info_get_od(
        &mut self,
        index: u16,
        client_capacity: usize,
        timeout: Duration,
    ) -> Result<(), EcatError> {
        let request = index.to_le_bytes();
        self.create_sdo_info(sdo_info_op::GET_OD_REQUEST, &request, client_capacity, timeout)
    }

    /// Entry description query (SDO Information GET_ED), `value_info` being
    /// the default/minimum/maximum/unit-type bitmask.
    pub fn create_sdo_info_get_ed(
        &mut self,
        index: u16,
        subindex: u8,
        value_info: u8,
        client_capacity: usize,
        timeout: Duration,
    ) -> Result<(), EcatError> {
        let mut request = [0u8; 4];
        request[..2].copy_from_slice(&index.to_le_bytes());
        request[2] = subindex;
        request[3] = value_info;
        self.create_sdo_info(sdo_info_op::GET_ED_REQUEST, &request, client_capacity, timeout)
    }

    /// Register the permanent emergency listener. Idempotent.
    pub fn attach_emergency_listener(&mut self) {
        if self
            .to_process
            .iter()
            .any(|message| matches!(message.kind, MessageKind::Emergency))
        {
            return;
        }
        let listener = Message {
            data: Vec::new(),
            status: MessageStatus::Running,
            timeout: Duration::ZERO,
            deadline: None,
            kind: MessageKind::Emergency,
        };
        if self.to_process.push(listener).is_err() {
            warn!("no room for the emergency listener");
        }
    }

    /// Wrap an external ETG.8200 request for this slave's mailbox.
    pub fn create_gateway_message(
        &mut self,
        raw: &[u8],
        gateway_index: u16,
        timeout: Duration,
    ) -> Result<(), EcatError> {
        if self.recv_size == 0 {
            return Err(EcatError::MailboxInactive);
        }
        if raw.len() > self.frame_capacity() || raw.len() < MAILBOX_HEADER_SIZE {
            return Err(EcatError::MailboxBufferTooSmall);
        }

        let address = MailboxHeader(raw).address();
        let mut message = self.new_message(
            MessageKind::Gateway(GatewayTransfer { gateway_index, address }),
            timeout,
        );
        message.data[..raw.len()].copy_from_slice(raw);
        MailboxHeader(&mut message.data[..])
            .set_address(GATEWAY_MESSAGE_MASK | (gateway_index & (GATEWAY_MAX_REQUEST - 1)));
        self.enqueue(message)
    }

    /// Anything waiting to go on the wire?
    pub fn has_pending(&self) -> bool {
        !self.to_send.is_empty()
    }

    /// Dequeue the next message for writing into the slave's receive
    /// mailbox; it keeps waiting for its answer in the processing list.
    pub fn send(&mut self, now: SystemTime) -> Option<&Message> {
        let mut message = self.to_send.pop_front()?;
        message.prepare_for_send(now);
        if self.to_process.push(message).is_err() {
            warn!("mailbox processing list full, message dropped");
            return None;
        }
        self.to_process.last()
    }

    /// Offer one inbound mailbox frame to the pending messages. Expired
    /// messages transition to `TimedOut` first. Returns true when a
    /// message claimed the frame.
    pub fn receive(&mut self, raw: &[u8], now: SystemTime) -> bool {
        // Expiry pass, oldest first.
        let mut i = 0;
        while i < self.to_process.len() {
            if self.to_process[i].expired(now) {
                let mut message = take_at(&mut self.to_process, i);
                message.status = MessageStatus::TimedOut;
                debug!("mailbox message timed out");
                self.store_completed(message);
            } else {
                i += 1;
            }
        }

        if raw.len() < MAILBOX_HEADER_SIZE {
            return false;
        }

        let Self {
            to_process,
            emergencies,
            ..
        } = self;

        let mut claimed = None;
        for (i, message) in to_process.iter_mut().enumerate() {
            match process_message(message, raw, emergencies) {
                ProcessingResult::Noop => continue,
                result => {
                    claimed = Some((i, result));
                    break;
                }
            }
        }

        match claimed {
            None => false,
            Some((_, ProcessingResult::FinalizeAndKeep)) => true,
            Some((i, ProcessingResult::Continue)) => {
                let mut message = take_at(&mut self.to_process, i);
                message.set_counter(self.next_counter());
                if self.to_send.push_back(message).is_err() {
                    warn!("mailbox send queue full, transfer dropped");
                }
                true
            }
            Some((i, ProcessingResult::Finalize)) => {
                let message = take_at(&mut self.to_process, i);
                self.store_completed(message);
                true
            }
            Some((_, ProcessingResult::Noop)) => false,
        }
    }

    fn store_completed(&mut self, message: Message) {
        match message.kind {
            MessageKind::Gateway(_) => self.completed_gateway = Some(message),
            MessageKind::Emergency => {}
            _ => self.completed = Some(message),
        }
    }

    /// Completed client message (SDO / SDO-Info), if any.
    pub fn take_completed(&mut self) -> Option<Message> {
        self.completed.take()
    }

    /// Completed gateway message, if any.
    pub fn take_completed_gateway(&mut self) -> Option<Message> {
        self.completed_gateway.take()
    }

    pub(crate) fn put_back_completed_gateway(&mut self, message: Message) {
        self.completed_gateway = Some(message);
    }

    /// Drain the accumulated emergency list.
    pub fn take_emergencies(&mut self) -> Vec<Emergency, MAX_EMERGENCIES> {
        core::mem::take(&mut self.emergencies)
    }

    /// Forget every client message still queued; used when a caller gave
    /// up waiting. The emergency listener and gateway traffic survive.
    pub fn cancel_client_messages(&mut self) {
        let mut keep: Deque<Message, MAX_PENDING> = Deque::new();
        while let Some(message) = self.to_send.pop_front() {
            if !message.is_client() {
                keep.push_back(message).ok();
            }
        }
        self.to_send = keep;

        let mut i = 0;
        while i < self.to_process.len() {
            if self.to_process[i].is_client() {
                take_at(&mut self.to_process, i);
            } else {
                i += 1;
            }
        }
        self.completed = None;
    }
}

fn process_message(
    message: &mut Message,
    raw: &[u8],
    emergencies: &mut Vec<Emergency, MAX_EMERGENCIES>,
) -> ProcessingResult {
    let header = MailboxHeader(raw);

    match &mut message.kind {
        MessageKind::Emergency => {
            if raw.len() < COE_OFFSET + COE_HEADER_SIZE + EMERGENCY_SIZE {
                return ProcessingResult::Noop;
            }
            if header.mb_type() != MailboxType::CoE {
                return ProcessingResult::Noop;
            }
            if CoeHeader(&raw[COE_OFFSET..]).coe_service() != CoeService::Emergency {
                return ProcessingResult::Noop;
            }
            let frame = EmergencyFrame(&raw[COE_OFFSET + COE_HEADER_SIZE..]);
            let emergency = Emergency {
                error_code: frame.error_code(),
                error_register: frame.error_register(),
                data: frame.diagnostic(),
            };
            debug!("emergency received: code {:#06x}", emergency.error_code);
            if emergencies.push(emergency).is_err() {
                warn!("emergency list full, entry dropped");
            }
            ProcessingResult::FinalizeAndKeep
        }

        MessageKind::Gateway(gw) => {
            let own = MailboxHeader(&message.data[..]).address();
            if header.address() != own {
                return ProcessingResult::Noop;
            }
            let size = raw.len().min(MAILBOX_HEADER_SIZE + header.length() as usize);
            let address = gw.address;
            message.data.truncate(0);
            message.data.extend_from_slice(&raw[..size]).ok();
            MailboxHeader(&mut message.data[..]).set_address(address);
            message.status = MessageStatus::Success;
            ProcessingResult::Finalize
        }

        MessageKind::Sdo(sdo) => {
            // Gateway replies are never for a local message.
            if header.address() & GATEWAY_MESSAGE_MASK != 0 {
                return ProcessingResult::Noop;
            }
            if header.mb_type() == MailboxType::Error {
                return finalize_mailbox_error(message, raw);
            }
            if header.mb_type() != MailboxType::CoE || raw.len() < PAYLOAD_OFFSET {
                return ProcessingResult::Noop;
            }
            let service = CoeHeader(&raw[COE_OFFSET..]).coe_service();
            if service != CoeService::SdoRequest && service != CoeService::SdoResponse {
                return ProcessingResult::Noop;
            }

            let response = SdoHeader(&raw[SDO_OFFSET..]);
            // Only non-segmented exchanges echo index/subindex.
            if (sdo.command == sdo_request::UPLOAD || sdo.command == sdo_request::DOWNLOAD)
                && (response.index() != sdo.index || response.sub_index() != sdo.subindex)
            {
                return ProcessingResult::Noop;
            }

            if response.command() == sdo_request::ABORT {
                let code = read_u32(raw, PAYLOAD_OFFSET);
                warn!(
                    "SDO abort for {:#06x}:{}: {:?} ({:#010x})",
                    sdo.index,
                    sdo.subindex,
                    AbortCode::from(code),
                    code,
                );
                message.status = MessageStatus::Abort(code);
                return ProcessingResult::Finalize;
            }

            let step = match sdo.command {
                sdo_request::UPLOAD => process_upload(sdo, raw),
                sdo_request::UPLOAD_SEGMENTED => process_upload_segment(sdo, raw),
                sdo_request::DOWNLOAD => process_download(raw),
                sdo_request::DOWNLOAD_SEGMENTED => {
                    if response.command() == sdo_response::DOWNLOAD_SEGMENTED {
                        SdoStep::Done(MessageStatus::Success)
                    } else {
                        SdoStep::Done(MessageStatus::WrongService)
                    }
                }
                _ => SdoStep::Done(MessageStatus::UnknownService),
            };

            match step {
                SdoStep::Done(status) => {
                    message.status = status;
                    ProcessingResult::Finalize
                }
                SdoStep::NextSegment => {
                    rebuild_segment_request(message);
                    ProcessingResult::Continue
                }
            }
        }

        MessageKind::SdoInfo(info) => {
            if header.address() & GATEWAY_MESSAGE_MASK != 0 {
                return ProcessingResult::Noop;
            }
            if header.mb_type() == MailboxType::Error {
                return finalize_mailbox_error(message, raw);
            }
            if header.mb_type() != MailboxType::CoE || raw.len() < PAYLOAD_OFFSET {
                return ProcessingResult::Noop;
            }
            if CoeHeader(&raw[COE_OFFSET..]).coe_service() != CoeService::SdoInformation {
                return ProcessingResult::Noop;
            }

            let reply = SdoInfoHeader(&raw[SDO_OFFSET..]);
            if reply.opcode() == sdo_info_op::ERROR_REQUEST {
                let code = read_u32(raw, PAYLOAD_OFFSET);
                message.status = MessageStatus::Abort(code);
                return ProcessingResult::Finalize;
            }
            if reply.opcode() != info.opcode + 1 {
                message.status = MessageStatus::WrongService;
                return ProcessingResult::Finalize;
            }

            let length = (header.length() as usize)
                .saturating_sub(COE_HEADER_SIZE + SDO_INFO_HEADER_SIZE);
            let end = (PAYLOAD_OFFSET + length).min(raw.len());
            let payload = &raw[PAYLOAD_OFFSET..end];
            if info.received.len() + payload.len() > info.client_capacity {
                message.status = MessageStatus::ClientBufferTooSmall;
                return ProcessingResult::Finalize;
            }
            info.received.extend_from_slice(payload).ok();

            if reply.fragments_left() != 0 || reply.incomplete() {
                // The server pushes continuation fragments on its own;
                // stay subscribed without re-requesting.
                return ProcessingResult::FinalizeAndKeep;
            }
            message.status = MessageStatus::Success;
            ProcessingResult::Finalize
        }
    }
}

enum SdoStep {
    Done(MessageStatus),
    NextSegment,
}

fn read_u32(raw: &[u8], offset: usize) -> u32 {
    if raw.len() < offset + 4 {
        return 0;
    }
    u32::from_le_bytes([raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]])
}

fn finalize_mailbox_error(message: &mut Message, raw: &[u8]) -> ProcessingResult {
    if raw.len() < COE_OFFSET + MAILBOX_ERROR_SIZE {
        return ProcessingResult::Noop;
    }
    let detail = MailboxErrorFrame(&raw[COE_OFFSET..]).error_detail();
    warn!("mailbox error response: {:?}", detail);
    message.status = MessageStatus::MailboxError(detail);
    ProcessingResult::Finalize
}

fn process_upload(sdo: &mut SdoTransfer, raw: &[u8]) -> SdoStep {
    let header = MailboxHeader(raw);
    let response = SdoHeader(&raw[SDO_OFFSET..]);
    if response.command() != sdo_response::UPLOAD {
        return SdoStep::Done(MessageStatus::WrongService);
    }

    if response.transfer_type() {
        // Expedited: the value sits in the 4 header payload bytes.
        let size = 4 - response.block_size() as usize;
        if sdo.client_capacity < size {
            return SdoStep::Done(MessageStatus::ClientBufferTooSmall);
        }
        let end = (PAYLOAD_OFFSET + size).min(raw.len());
        sdo.received.extend_from_slice(&raw[PAYLOAD_OFFSET..end]).ok();
        return SdoStep::Done(MessageStatus::Success);
    }

    // Standard or segmented: the first four payload bytes carry the
    // complete object size.
    let complete_size = read_u32(raw, PAYLOAD_OFFSET) as usize;
    if sdo.client_capacity < complete_size {
        return SdoStep::Done(MessageStatus::ClientBufferTooSmall);
    }

    let data_length = (header.length() as usize).saturating_sub(10);
    if data_length >= complete_size {
        // The whole object fits this answer.
        let start = PAYLOAD_OFFSET + 4;
        let end = (start + complete_size).min(raw.len());
        sdo.received.extend_from_slice(&raw[start..end]).ok();
        return SdoStep::Done(MessageStatus::Success);
    }

    // Segmented: this answer carries its own segment size then the bytes.
    let segment_size = read_u32(raw, PAYLOAD_OFFSET + 4) as usize;
    let start = PAYLOAD_OFFSET + 8;
    let end = (start + segment_size).min(raw.len());
    sdo.received.extend_from_slice(&raw[start..end]).ok();

    sdo.command = sdo_request::UPLOAD_SEGMENTED;
    sdo.toggle = false; // first segment request carries toggle 0
    SdoStep::NextSegment
}

fn process_upload_segment(sdo: &mut SdoTransfer, raw: &[u8]) -> SdoStep {
    let header = MailboxHeader(raw);
    let response = SdoHeader(&raw[SDO_OFFSET..]);
    if response.command() != sdo_response::UPLOAD_SEGMENTED {
        return SdoStep::Done(MessageStatus::WrongService);
    }
    if response.complete_access() != sdo.toggle {
        return SdoStep::Done(MessageStatus::BadToggleBit);
    }

    let (start, size) = if header.length() == 10 {
        // Small segment packed in the spare header bytes.
        let packed = response.block_size() | (response.size_indicator() as u8) << 2;
        (PAYLOAD_OFFSET, 7usize.saturating_sub(packed as usize))
    } else {
        (PAYLOAD_OFFSET + 4, read_u32(raw, PAYLOAD_OFFSET) as usize)
    };

    if sdo.received.len() + size > sdo.client_capacity {
        return SdoStep::Done(MessageStatus::ClientBufferTooSmall);
    }
    let end = (start + size).min(raw.len());
    sdo.received.extend_from_slice(&raw[start..end]).ok();

    let more_follow = response.size_indicator();
    if !more_follow {
        return SdoStep::Done(MessageStatus::Success);
    }
    sdo.toggle = !sdo.toggle;
    SdoStep::NextSegment
}

fn process_download(raw: &[u8]) -> SdoStep {
    if SdoHeader(&raw[SDO_OFFSET..]).command() != sdo_response::DOWNLOAD {
        return SdoStep::Done(MessageStatus::WrongService);
    }
    SdoStep::Done(MessageStatus::Success)
}

/// Rewrite the outgoing request for the next upload segment.
fn rebuild_segment_request(message: &mut Message) {
    let toggle = match &message.kind {
        MessageKind::Sdo(sdo) => sdo.toggle,
        _ => return,
    };
    MailboxHeader(&mut message.data[..]).set_length(10);
    CoeHeader(&mut message.data[COE_OFFSET..]).set_coe_service(CoeService::SdoRequest);
    let mut sdo = SdoHeader(&mut message.data[SDO_OFFSET..]);
    sdo.set_command(sdo_request::UPLOAD_SEGMENTED);
    sdo.set_complete_access(toggle);
    sdo.set_transfer_type(false);
    sdo.set_size_indicator(false);
    sdo.set_block_size(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: SystemTime = SystemTime(1_000_000);

    fn mailbox() -> Mailbox {
        Mailbox {
            recv_size: 256,
            recv_offset: 0x1000,
            send_size: 256,
            send_offset: 0x1100,
            ..Mailbox::default()
        }
    }

    /// Builder for inbound mailbox frames.
    struct Reply {
        raw: [u8; 256],
    }

    impl Reply {
        fn new() -> Self {
            Self { raw: [0; 256] }
        }

        fn header(&mut self) -> MailboxHeader<&mut [u8]> {
            MailboxHeader(&mut self.raw[..])
        }

        fn coe(&mut self) -> CoeHeader<&mut [u8]> {
            CoeHeader(&mut self.raw[COE_OFFSET..])
        }

        fn sdo(&mut self) -> SdoHeader<&mut [u8]> {
            SdoHeader(&mut self.raw[SDO_OFFSET..])
        }

        fn sdo_info(&mut self) -> SdoInfoHeader<&mut [u8]> {
            SdoInfoHeader(&mut self.raw[SDO_OFFSET..])
        }

        fn payload_u32(&mut self, offset: usize, value: u32) {
            let at = PAYLOAD_OFFSET + offset;
            self.raw[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }

        fn coe_response(index: u16, subindex: u8) -> Self {
            let mut reply = Self::new();
            reply.header().set_mb_type(MailboxType::CoE);
            reply.coe().set_coe_service(CoeService::SdoResponse);
            reply.sdo().set_index(index);
            reply.sdo().set_sub_index(subindex);
            reply
        }
    }

    #[test]
    fn counter_rotates_one_to_seven() {
        let mut mailbox = mailbox();
        let mut seen = std::vec::Vec::new();
        for _ in 0..16 {
            seen.push(mailbox.next_counter());
        }
        assert_eq!(
            vec![1, 2, 3, 4, 5, 6, 7, 1, 2, 3, 4, 5, 6, 7, 1, 2],
            seen
        );
        assert!(!seen.contains(&0));
    }

    #[test]
    fn sync_manager_configuration() {
        let mut mailbox = mailbox();
        mailbox.send_size = 17;
        mailbox.send_offset = 8;
        mailbox.recv_size = 42;
        mailbox.recv_offset = 0x300;

        let config = mailbox.generate_sm_config();
        let sm0 = SyncManagerChannel(&config[..8]);
        assert_eq!(0x300, sm0.start_address());
        assert_eq!(42, sm0.length());
        assert_eq!(0x26, sm0.control());
        assert_eq!(1, sm0.activate());

        let sm1 = SyncManagerChannel(&config[8..]);
        assert_eq!(8, sm1.start_address());
        assert_eq!(17, sm1.length());
        assert_eq!(0x22, sm1.control());
        assert_eq!(1, sm1.activate());
    }

    #[test]
    fn unknown_frame_is_not_claimed() {
        let mut mailbox = mailbox();
        let raw = [0u8; 64];
        assert!(!mailbox.receive(&raw, NOW));
    }

    #[test]
    fn inactive_mailbox_rejects_sdo() {
        let mut mailbox = Mailbox::default();
        assert_eq!(
            Err(EcatError::MailboxInactive),
            mailbox.create_sdo_upload(0x1018, 1, false, 4, Duration::from_secs(1))
        );
    }

    #[test]
    fn sdo_upload_expedited() {
        let mut mailbox = mailbox();
        mailbox
            .create_sdo_upload(0x1018, 1, false, 4, Duration::from_secs(1))
            .unwrap();

        let request = mailbox.send(NOW).unwrap();
        assert_eq!(MessageStatus::Running, request.status());
        assert_eq!(256, request.raw_data().len());
        let header = MailboxHeader(request.raw_data());
        assert_eq!(MailboxType::CoE, header.mb_type());
        assert_eq!(1, header.count());
        let sdo = SdoHeader(&request.raw_data()[SDO_OFFSET..]);
        assert_eq!(sdo_request::UPLOAD, sdo.command());
        assert_eq!(0x1018, sdo.index());
        assert_eq!(1, sdo.sub_index());
        assert!(!sdo.complete_access());

        let mut reply = Reply::coe_response(0x1018, 1);
        reply.sdo().set_command(sdo_response::UPLOAD);
        reply.sdo().set_transfer_type(true);
        reply.sdo().set_block_size(0); // 4 bytes
        reply.payload_u32(0, 0xCAFEDECA);

        assert!(mailbox.receive(&reply.raw, NOW));
        let done = mailbox.take_completed().unwrap();
        assert_eq!(MessageStatus::Success, done.status());
        assert_eq!(&0xCAFEDECAu32.to_le_bytes(), done.coe_data());
    }

    #[test]
    fn sdo_upload_standard() {
        let mut mailbox = mailbox();
        mailbox
            .create_sdo_upload(0x1018, 1, false, 16, Duration::from_secs(1))
            .unwrap();
        mailbox.send(NOW).unwrap();

        let mut reply = Reply::coe_response(0x1018, 1);
        reply.header().set_length(10 + 8);
        reply.sdo().set_command(sdo_response::UPLOAD);
        reply.payload_u32(0, 8); // complete size
        reply.payload_u32(4, 0xDEADBEEF);
        reply.payload_u32(8, 0xA5A5A5A5);

        assert!(mailbox.receive(&reply.raw, NOW));
        let done = mailbox.take_completed().unwrap();
        assert_eq!(MessageStatus::Success, done.status());
        assert_eq!(8, done.coe_data().len());
        assert_eq!(&0xDEADBEEFu32.to_le_bytes(), &done.coe_data()[..4]);
        assert_eq!(&0xA5A5A5A5u32.to_le_bytes(), &done.coe_data()[4..]);
    }

    #[test]
    fn sdo_upload_segmented_reassembles_in_order() {
        let mut mailbox = mailbox();
        mailbox
            .create_sdo_upload(0x1018, 1, false, 24, Duration::from_secs(1))
            .unwrap();
        mailbox.send(NOW).unwrap();

        // First answer: 24 bytes total, 8 in this segment.
        let mut reply = Reply::coe_response(0x1018, 1);
        reply.header().set_length(10 + 8);
        reply.sdo().set_command(sdo_response::UPLOAD);
        reply.payload_u32(0, 24);
        reply.payload_u32(4, 8);
        reply.payload_u32(8, 0xDEADBEEF);
        reply.payload_u32(12, 0xA5A5A5A5);
        assert!(mailbox.receive(&reply.raw, NOW));

        // The transfer re-queued itself as a segment request, toggle 0.
        let request = mailbox.send(NOW).unwrap();
        let sdo = SdoHeader(&request.raw_data()[SDO_OFFSET..]);
        assert_eq!(sdo_request::UPLOAD_SEGMENTED, sdo.command());
        assert!(!sdo.complete_access());

        // Middle segment: more follow, toggle still 0.
        let mut segment = Reply::new();
        segment.header().set_mb_type(MailboxType::CoE);
        segment.header().set_length(10 + 8);
        segment.coe().set_coe_service(CoeService::SdoResponse);
        segment.sdo().set_command(sdo_response::UPLOAD_SEGMENTED);
        segment.sdo().set_size_indicator(true);
        segment.payload_u32(0, 8);
        segment.payload_u32(4, 0xCAFEDECA);
        segment.payload_u32(8, 0xD0D0FACE);
        assert!(mailbox.receive(&segment.raw, NOW));

        let request = mailbox.send(NOW).unwrap();
        let sdo = SdoHeader(&request.raw_data()[SDO_OFFSET..]);
        assert_eq!(sdo_request::UPLOAD_SEGMENTED, sdo.command());
        assert!(sdo.complete_access()); // toggled

        // Last segment: toggle 1, nothing follows.
        let mut last = Reply::new();
        last.header().set_mb_type(MailboxType::CoE);
        last.header().set_length(10 + 8);
        last.coe().set_coe_service(CoeService::SdoResponse);
        last.sdo().set_command(sdo_response::UPLOAD_SEGMENTED);
        last.sdo().set_complete_access(true);
        last.payload_u32(0, 8);
        last.payload_u32(4, 0xD1CECA5E);
        last.payload_u32(8, 0x00B0CAD0);
        assert!(mailbox.receive(&last.raw, NOW));

        let done = mailbox.take_completed().unwrap();
        assert_eq!(MessageStatus::Success, done.status());
        let mut expected = std::vec::Vec::new();
        for value in [0xDEADBEEFu32, 0xA5A5A5A5, 0xCAFEDECA, 0xD0D0FACE, 0xD1CECA5E, 0x00B0CAD0] {
            expected.extend_from_slice(&value.to_le_bytes());
        }
        assert_eq!(expected.as_slice(), done.coe_data());
    }

    #[test]
    fn sdo_upload_segment_bad_toggle() {
        let mut mailbox = mailbox();
        mailbox
            .create_sdo_upload(0x1018, 1, false, 24, Duration::from_secs(1))
            .unwrap();
        mailbox.send(NOW).unwrap();

        let mut reply = Reply::coe_response(0x1018, 1);
        reply.header().set_length(10 + 8);
        reply.sdo().set_command(sdo_response::UPLOAD);
        reply.payload_u32(0, 24);
        reply.payload_u32(4, 8);
        assert!(mailbox.receive(&reply.raw, NOW));
        mailbox.send(NOW).unwrap();

        // Segment response with toggle already 1: mismatch.
        let mut segment = Reply::new();
        segment.header().set_mb_type(MailboxType::CoE);
        segment.header().set_length(10 + 8);
        segment.coe().set_coe_service(CoeService::SdoResponse);
        segment.sdo().set_command(sdo_response::UPLOAD_SEGMENTED);
        segment.sdo().set_complete_access(true);
        segment.payload_u32(0, 8);
        assert!(mailbox.receive(&segment.raw, NOW));

        let done = mailbox.take_completed().unwrap();
        assert_eq!(MessageStatus::BadToggleBit, done.status());
    }

    #[test]
    fn sdo_download_expedited() {
        let mut mailbox = mailbox();
        let value = 0xCAFEDECAu32.to_le_bytes();
        mailbox
            .create_sdo_download(0x1018, 1, false, &value, Duration::from_secs(1))
            .unwrap();

        let request = mailbox.send(NOW).unwrap();
        let sdo = SdoHeader(&request.raw_data()[SDO_OFFSET..]);
        assert_eq!(sdo_request::DOWNLOAD, sdo.command());
        assert!(sdo.transfer_type());
        assert!(sdo.size_indicator());
        assert_eq!(0, sdo.block_size());
        assert_eq!(
            &value,
            &request.raw_data()[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 4]
        );

        let mut reply = Reply::coe_response(0x1018, 1);
        reply.sdo().set_command(sdo_response::DOWNLOAD);
        assert!(mailbox.receive(&reply.raw, NOW));
        assert_eq!(
            MessageStatus::Success,
            mailbox.take_completed().unwrap().status()
        );
    }

    #[test]
    fn sdo_download_normal_is_size_prefixed() {
        let mut mailbox = mailbox();
        let value = 0xCAFEDECADECACAFEu64.to_le_bytes();
        mailbox
            .create_sdo_download(0x1018, 1, true, &value, Duration::from_secs(1))
            .unwrap();

        let request = mailbox.send(NOW).unwrap();
        let header = MailboxHeader(request.raw_data());
        assert_eq!(10 + 8, header.length());
        let sdo = SdoHeader(&request.raw_data()[SDO_OFFSET..]);
        assert!(!sdo.transfer_type());
        assert!(sdo.size_indicator());
        assert!(sdo.complete_access());
        assert_eq!(
            &8u32.to_le_bytes(),
            &request.raw_data()[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 4]
        );
        assert_eq!(
            &value,
            &request.raw_data()[PAYLOAD_OFFSET + 4..PAYLOAD_OFFSET + 12]
        );
    }

    #[test]
    fn oversized_download_needs_segmenting() {
        let mut mailbox = mailbox();
        let blob = [0u8; 256];
        assert_eq!(
            Err(EcatError::NotImplemented),
            mailbox.create_sdo_download(0x1018, 1, false, &blob, Duration::from_secs(1))
        );
    }

    #[test]
    fn sdo_abort_carries_the_code() {
        let mut mailbox = mailbox();
        mailbox
            .create_sdo_download(0x1018, 1, false, &[0u8; 4], Duration::from_secs(1))
            .unwrap();
        mailbox.send(NOW).unwrap();

        let mut reply = Reply::coe_response(0x1018, 1);
        reply.sdo().set_command(sdo_request::ABORT);
        reply.payload_u32(0, 0x0601_0000);
        assert!(mailbox.receive(&reply.raw, NOW));

        let done = mailbox.take_completed().unwrap();
        assert_eq!(MessageStatus::Abort(0x0601_0000), done.status());
    }

    #[test]
    fn message_times_out_at_deadline() {
        let mut mailbox = mailbox();
        let timeout = Duration::from_millis(10);
        mailbox
            .create_sdo_download(0x1018, 1, false, &[0u8; 4], timeout)
            .unwrap();
        mailbox.send(NOW).unwrap();

        // Unrelated frame, before the deadline: still running.
        let mut unrelated = Reply::new();
        unrelated.header().set_mb_type(MailboxType::VoE);
        assert!(!mailbox.receive(&unrelated.raw, NOW + Duration::from_millis(1)));
        assert!(mailbox.take_completed().is_none());

        // At the deadline: timed out.
        assert!(!mailbox.receive(&unrelated.raw, NOW + timeout));
        let done = mailbox.take_completed().unwrap();
        assert_eq!(MessageStatus::TimedOut, done.status());
    }

    #[test]
    fn wrong_service_index_or_subindex_is_ignored() {
        let mut mailbox = mailbox();
        mailbox
            .create_sdo_download(0x1018, 1, true, &[0u8; 8], Duration::from_secs(1))
            .unwrap();
        mailbox.send(NOW).unwrap();

        let mut info = Reply::coe_response(0x1018, 1);
        info.coe().set_coe_service(CoeService::SdoInformation);
        assert!(!mailbox.receive(&info.raw, NOW));

        let mut wrong_index = Reply::coe_response(0x2000, 1);
        wrong_index.sdo().set_command(sdo_response::DOWNLOAD);
        assert!(!mailbox.receive(&wrong_index.raw, NOW));

        let mut wrong_subindex = Reply::coe_response(0x1018, 42);
        wrong_subindex.sdo().set_command(sdo_response::DOWNLOAD);
        assert!(!mailbox.receive(&wrong_subindex.raw, NOW));
    }

    #[test]
    fn emergency_listener_collects_and_survives() {
        let mut mailbox = mailbox();
        mailbox.attach_emergency_listener();
        mailbox.attach_emergency_listener(); // idempotent

        let mut reply = Reply::new();
        reply.header().set_mb_type(MailboxType::CoE);
        reply.coe().set_coe_service(CoeService::Emergency);
        reply.raw[COE_OFFSET + COE_HEADER_SIZE] = 0x10;
        reply.raw[COE_OFFSET + COE_HEADER_SIZE + 1] = 0x33;

        assert!(mailbox.receive(&reply.raw, NOW));
        assert!(mailbox.receive(&reply.raw, NOW)); // still subscribed
        assert_eq!(2, mailbox.emergencies.len());
        assert_eq!(0x3310, mailbox.emergencies[0].error_code);

        // Unrelated traffic does not feed the listener.
        let mut voe = Reply::new();
        voe.header().set_mb_type(MailboxType::VoE);
        voe.coe().set_coe_service(CoeService::Emergency);
        assert!(!mailbox.receive(&voe.raw, NOW));
        assert_eq!(2, mailbox.emergencies.len());
    }

    #[test]
    fn mailbox_error_response_finalizes_with_detail() {
        let mut mailbox = mailbox();
        mailbox
            .create_sdo_upload(0x1018, 1, false, 4, Duration::from_secs(1))
            .unwrap();
        mailbox.send(NOW).unwrap();

        let mut reply = Reply::new();
        reply.header().set_mb_type(MailboxType::Error);
        reply.raw[COE_OFFSET] = 0x01; // service type
        reply.raw[COE_OFFSET + 2] = 0x04; // detail: service not supported

        assert!(mailbox.receive(&reply.raw, NOW));
        let done = mailbox.take_completed().unwrap();
        assert_eq!(
            MessageStatus::MailboxError(MailboxErrorDetail::ServiceNotSupported),
            done.status()
        );
    }

    #[test]
    fn sdo_info_od_list_roundtrip() {
        let mut mailbox = mailbox();
        mailbox
            .create_sdo_info_get_od_list(OdListType::All, 128, Duration::from_secs(1))
            .unwrap();

        let request = mailbox.send(NOW).unwrap();
        let info = SdoInfoHeader(&request.raw_data()[SDO_OFFSET..]);
        assert_eq!(sdo_info_op::GET_OD_LIST_REQUEST, info.opcode());
        assert!(!info.incomplete());
        assert_eq!(0, info.fragments_left());

        let mut reply = Reply::new();
        reply.header().set_mb_type(MailboxType::CoE);
        reply.header().set_length(10);
        reply.coe().set_coe_service(CoeService::SdoInformation);
        reply.sdo_info().set_opcode(sdo_info_op::GET_OD_LIST_RESPONSE);
        reply.payload_u32(0, 0x1018_0001);

        assert!(mailbox.receive(&reply.raw, NOW));
        let done = mailbox.take_completed().unwrap();
        assert_eq!(MessageStatus::Success, done.status());
        assert_eq!(4, done.coe_data().len());
    }

    #[test]
    fn sdo_info_fragments_accumulate() {
        let mut mailbox = mailbox();
        mailbox
            .create_sdo_info_get_od_list(OdListType::All, 128, Duration::from_secs(1))
            .unwrap();
        mailbox.send(NOW).unwrap();

        let mut first = Reply::new();
        first.header().set_mb_type(MailboxType::CoE);
        first.header().set_length(10);
        first.coe().set_coe_service(CoeService::SdoInformation);
        first.sdo_info().set_opcode(sdo_info_op::GET_OD_LIST_RESPONSE);
        first.sdo_info().set_incomplete(true);
        first.sdo_info().set_fragments_left(1);
        first.payload_u32(0, 0x2222_1111);
        assert!(mailbox.receive(&first.raw, NOW));
        assert!(mailbox.take_completed().is_none()); // still waiting

        let mut last = Reply::new();
        last.header().set_mb_type(MailboxType::CoE);
        last.header().set_length(10);
        last.coe().set_coe_service(CoeService::SdoInformation);
        last.sdo_info().set_opcode(sdo_info_op::GET_OD_LIST_RESPONSE);
        last.payload_u32(0, 0x4444_3333);
        assert!(mailbox.receive(&last.raw, NOW));

        let done = mailbox.take_completed().unwrap();
        assert_eq!(MessageStatus::Success, done.status());
        assert_eq!(8, done.coe_data().len());
        assert_eq!(&0x2222_1111u32.to_le_bytes(), &done.coe_data()[..4]);
        assert_eq!(&0x4444_3333u32.to_le_bytes(), &done.coe_data()[4..]);
    }

    #[test]
    fn sdo_info_error_and_wrong_opcode() {
        let mut mailbox = mailbox();
        mailbox
            .create_sdo_info_get_od_list(OdListType::All, 128, Duration::from_secs(1))
            .unwrap();
        mailbox.send(NOW).unwrap();

        // Gateway-address frames are skipped entirely.
        let mut gateway = Reply::new();
        gateway.header().set_mb_type(MailboxType::CoE);
        gateway.header().set_address(GATEWAY_MESSAGE_MASK);
        assert!(!mailbox.receive(&gateway.raw, NOW));

        // Error request carries the abort code.
        let mut error = Reply::new();
        error.header().set_mb_type(MailboxType::CoE);
        error.header().set_length(10);
        error.coe().set_coe_service(CoeService::SdoInformation);
        error.sdo_info().set_opcode(sdo_info_op::ERROR_REQUEST);
        error.payload_u32(0, 0x0800_0000);
        assert!(mailbox.receive(&error.raw, NOW));
        assert_eq!(
            MessageStatus::Abort(0x0800_0000),
            mailbox.take_completed().unwrap().status()
        );

        // Echoing the request opcode back is a wrong service.
        mailbox
            .create_sdo_info_get_od_list(OdListType::All, 128, Duration::from_secs(1))
            .unwrap();
        mailbox.send(NOW).unwrap();
        let mut echo = Reply::new();
        echo.header().set_mb_type(MailboxType::CoE);
        echo.header().set_length(10);
        echo.coe().set_coe_service(CoeService::SdoInformation);
        echo.sdo_info().set_opcode(sdo_info_op::GET_OD_LIST_REQUEST);
        assert!(mailbox.receive(&echo.raw, NOW));
        assert_eq!(
            MessageStatus::WrongService,
            mailbox.take_completed().unwrap().status()
        );
    }

    #[test]
    fn gateway_message_swaps_and_restores_address() {
        const GATEWAY_INDEX: u16 = 42;
        let mut mailbox = mailbox();

        // A remote master's upload request addressed to station 1001.
        let mut raw = [0u8; 16];
        {
            let mut header = MailboxHeader(&mut raw[..]);
            header.set_length(10);
            header.set_address(1001);
            header.set_mb_type(MailboxType::CoE);
        }
        CoeHeader(&mut raw[COE_OFFSET..]).set_coe_service(CoeService::SdoRequest);

        mailbox
            .create_gateway_message(&raw, GATEWAY_INDEX, Duration::from_secs(1))
            .unwrap();
        let pending = mailbox.send(NOW).unwrap();
        assert_eq!(
            GATEWAY_MESSAGE_MASK | GATEWAY_INDEX,
            MailboxHeader(pending.raw_data()).address()
        );

        // The slave's answer echoes the gateway address.
        let mut reply = Reply::new();
        reply.header().set_length(10);
        reply.header().set_address(GATEWAY_MESSAGE_MASK | GATEWAY_INDEX);
        reply.header().set_mb_type(MailboxType::CoE);
        reply.coe().set_coe_service(CoeService::SdoResponse);
        assert!(mailbox.receive(&reply.raw, NOW));

        let done = mailbox.take_completed_gateway().unwrap();
        assert_eq!(MessageStatus::Success, done.status());
        assert_eq!(Some(GATEWAY_INDEX), done.gateway_index());
        // Original address restored for the reply on the diag network.
        assert_eq!(1001, MailboxHeader(done.raw_data()).address());
    }

    #[test]
    fn cancel_client_messages_spares_the_listener() {
        let mut mailbox = mailbox();
        mailbox.attach_emergency_listener();
        mailbox
            .create_sdo_upload(0x1018, 1, false, 4, Duration::from_secs(1))
            .unwrap();
        mailbox.send(NOW).unwrap();
        mailbox
            .create_sdo_upload(0x1018, 2, false, 4, Duration::from_secs(1))
            .unwrap();

        mailbox.cancel_client_messages();
        assert!(!mailbox.has_pending());

        // The listener still works.
        let mut reply = Reply::new();
        reply.header().set_mb_type(MailboxType::CoE);
        reply.coe().set_coe_service(CoeService::Emergency);
        assert!(mailbox.receive(&reply.raw, NOW));
        assert_eq!(1, mailbox.emergencies.len());
    }
}
