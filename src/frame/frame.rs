use log::warn;

use crate::error::{EcatError, PhyError};
use crate::frame::ethercat::*;
use crate::port::RawPort;

const FIRST_DATAGRAM_OFFSET: usize = ETHERNET_HEADER_SIZE + ETHERCAT_HEADER_SIZE;

/// One Ethernet frame worth of chained EtherCAT datagrams.
///
/// The same buffer is used to build outgoing frames and to parse answers:
/// `add_datagram`/`finalize` on the way out, `next_datagram` on the way
/// back. Frames are ephemeral; the context is reset after each send or
/// full iteration.
#[derive(Debug)]
pub struct Frame {
    buffer: [u8; MAX_FRAME_SIZE],
    /// Offset of the next datagram to write or to pop.
    next_offset: usize,
    /// Offset of the last written datagram header, patched on finalize.
    last_offset: usize,
    datagram_counter: usize,
    datagram_available: bool,
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl Frame {
    pub fn new() -> Self {
        let mut frame = Self {
            buffer: [0; MAX_FRAME_SIZE],
            next_offset: FIRST_DATAGRAM_OFFSET,
            last_offset: FIRST_DATAGRAM_OFFSET,
            datagram_counter: 0,
            datagram_available: false,
        };
        EthernetHeader(&mut frame.buffer[..]).set_ethercat_default(PRIMARY_MAC);
        {
            let mut header = EthercatHeader(&mut frame.buffer[ETHERNET_HEADER_SIZE..]);
            header.set_length(0);
            header.set_ethercat_type(EthercatType::Pdu as u8);
        }
        frame
    }

    /// Rebuild a frame from received bytes; used by tests and simulators.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut frame = Self::new();
        frame.buffer[..data.len()].copy_from_slice(data);
        frame.datagram_available = true;
        frame
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn datagram_counter(&self) -> usize {
        self.datagram_counter
    }

    pub fn is_datagram_available(&self) -> bool {
        self.datagram_available
    }

    /// Bytes still available for datagrams (headers + payload + wkc).
    pub fn free_space(&self) -> usize {
        MAX_DATAGRAMS_SIZE - (self.next_offset - FIRST_DATAGRAM_OFFSET)
    }

    pub fn is_full(&self) -> bool {
        if self.datagram_counter >= MAX_DATAGRAMS_PER_FRAME {
            return true;
        }
        self.free_space() < datagram_size(0)
    }

    fn reset_context(&mut self) {
        self.next_offset = FIRST_DATAGRAM_OFFSET;
        self.last_offset = FIRST_DATAGRAM_OFFSET;
        self.datagram_counter = 0;
        self.datagram_available = false;
    }

    /// Forget any accumulated datagram length, keeping the Ethernet header.
    pub fn clear(&mut self) {
        EthercatHeader(&mut self.buffer[ETHERNET_HEADER_SIZE..]).set_length(0);
    }

    fn declared_length(&self) -> usize {
        EthercatHeader(&self.buffer[ETHERNET_HEADER_SIZE..]).length() as usize
    }

    /// Append one datagram. Read-only commands travel with a zeroed payload
    /// area of `size` bytes whatever `data` holds; other commands copy
    /// `data` in (zero-padded up to `size`).
    pub fn add_datagram(
        &mut self,
        index: u8,
        command: Command,
        data: &[u8],
        size: u16,
    ) -> Result<(), EcatError> {
        let payload = size as usize;
        if payload > MAX_DATAGRAM_PAYLOAD {
            return Err(EcatError::DatagramTooLarge);
        }
        if self.is_full() || self.free_space() < datagram_size(payload) {
            return Err(EcatError::FrameFull);
        }

        {
            let mut header = DatagramHeader(&mut self.buffer[self.next_offset..]);
            header.set_command(command.c_type as u8);
            header.set_index(index);
            header.set_adp(command.adp);
            header.set_ado(command.ado);
            header.set_length(size & 0x7FF);
            header.set_circulating(false);
            // Rewritten on finalize for the last datagram of the frame.
            header.set_more_follows(true);
            // Clear IRQ so slaves OR their event bits on a clean slate.
            header.set_irq(0);
        }

        let payload_offset = self.next_offset + DATAGRAM_HEADER_SIZE;
        let area = &mut self.buffer[payload_offset..payload_offset + payload];
        if command.c_type.is_read_only() {
            area.fill(0);
        } else {
            let copied = data.len().min(payload);
            area[..copied].copy_from_slice(&data[..copied]);
            area[copied..].fill(0);
        }

        // Working counter slot starts at zero.
        self.buffer[payload_offset + payload] = 0;
        self.buffer[payload_offset + payload + 1] = 0;

        let length = self.declared_length() + datagram_size(payload);
        EthercatHeader(&mut self.buffer[ETHERNET_HEADER_SIZE..])
            .set_length((length & 0x7FF) as u16);

        self.last_offset = self.next_offset;
        self.next_offset = payload_offset + payload + WKC_SIZE;
        self.datagram_counter += 1;
        Ok(())
    }

    /// Close the datagram chain and pad the frame; returns the number of
    /// bytes to put on the wire.
    pub fn finalize(&mut self) -> usize {
        DatagramHeader(&mut self.buffer[self.last_offset..]).set_more_follows(false);
        let end = self.next_offset;
        self.reset_context();

        let to_write = ETHERNET_HEADER_SIZE + ETHERCAT_HEADER_SIZE + self.declared_length();
        if to_write < MIN_FRAME_SIZE {
            self.buffer[end..MIN_FRAME_SIZE].fill(0);
            return MIN_FRAME_SIZE;
        }
        to_write
    }

    /// Index of the datagram `next_datagram` would yield, without consuming.
    pub(crate) fn peek_index(&self) -> Option<u8> {
        if !self.datagram_available {
            return None;
        }
        Some(DatagramHeader(&self.buffer[self.next_offset..]).index())
    }

    /// Pop the next datagram of a received frame as (header, payload, wkc).
    /// After the last one (`more_follows == 0`) the context resets and the
    /// iteration starts over on the next received frame.
    pub fn next_datagram(&mut self) -> Option<(DatagramHeader<[u8; DATAGRAM_HEADER_SIZE]>, &[u8], u16)> {
        if !self.datagram_available {
            return None;
        }

        let mut raw = [0u8; DATAGRAM_HEADER_SIZE];
        raw.copy_from_slice(&self.buffer[self.next_offset..self.next_offset + DATAGRAM_HEADER_SIZE]);
        let header = DatagramHeader(raw);

        let payload_offset = self.next_offset + DATAGRAM_HEADER_SIZE;
        let length = header.length() as usize;
        let wkc_offset = payload_offset + length;
        let wkc = u16::from_le_bytes([self.buffer[wkc_offset], self.buffer[wkc_offset + 1]]);

        if header.more_follows() {
            self.next_offset = wkc_offset + WKC_SIZE;
        } else {
            self.reset_context();
        }

        Some((header, &self.buffer[payload_offset..payload_offset + length], wkc))
    }

    /// Finalize and write this frame on `port`. The frame is cleared either
    /// way so the buffer can be reused immediately.
    pub fn write_to<P: RawPort>(&mut self, port: &mut P, source: u64) -> Result<(), EcatError> {
        EthernetHeader(&mut self.buffer[..]).set_source(source);
        let to_write = self.finalize();
        let result = port.write(&self.buffer[..to_write]);
        self.clear();
        match result {
            Ok(written) if written == to_write => Ok(()),
            Ok(_) => Err(EcatError::Phy(PhyError::PartialWrite)),
            Err(err) => Err(EcatError::Phy(err)),
        }
    }

    /// Read one frame from `port` into this buffer. `Ok(0)` is the benign
    /// "no data" of the null port; a frame that is not EtherCAT or whose
    /// size does not match its header is dropped as `InvalidFrame`.
    pub fn read_from<P: RawPort>(&mut self, port: &mut P) -> Result<usize, EcatError> {
        self.reset_context();
        let read = port.read(&mut self.buffer)?;
        if read == 0 {
            return Ok(0);
        }

        if EthernetHeader(&self.buffer[..]).ether_type() != ETHERCAT_TYPE {
            warn!("dropped frame: not EtherCAT");
            return Err(EcatError::InvalidFrame);
        }

        let mut expected = ETHERNET_HEADER_SIZE + ETHERCAT_HEADER_SIZE + self.declared_length();
        self.clear();
        if expected < MIN_FRAME_SIZE {
            expected = MIN_FRAME_SIZE;
        }
        if read != expected {
            warn!("dropped frame: read {} bytes, header declares {}", read, expected);
            return Err(EcatError::InvalidFrame);
        }

        self.datagram_available = true;
        Ok(read)
    }
}
