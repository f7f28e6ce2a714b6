//! Process-image mapping: detect each slave's PDO layout (CoE object
//! dictionary, falling back to the SII tables), pack every slave into
//! logical-address windows, then program the process-data SyncManagers and
//! the FMMUs.

use core::time::Duration;

use heapless::Vec;
use log::{debug, warn};

use crate::bus::{Access, Bus, LOGICAL_START_ADDRESS};
use crate::error::{EcatError, UnexpectedWkc};
use crate::port::RawPort;
use crate::register::{FmmuEntry, SyncManagerChannel};
use crate::time::Clock;

/// CoE index of the SM communication types object.
const SM_COM_TYPE: u16 = 0x1C00;
/// CoE index of the first SM PDO assignment object.
const SM_CHANNEL: u16 = 0x1C10;

/// SM com type values for PDO-carrying channels.
const SM_TYPE_OUTPUT: u8 = 3;
const SM_TYPE_INPUT: u8 = 4;

/// One logical window fits a standard Ethernet frame.
const MAX_PI_FRAME_SIZE: usize = 1486;

pub const MAX_PI_FRAMES: usize = 8;
pub const MAX_BLOCKS_PER_FRAME: usize = 32;

const MAPPING_SDO_TIMEOUT: Duration = Duration::from_secs(1);

/// One slave's share of a process-image frame.
#[derive(Debug, Clone, Copy)]
pub struct BlockIo {
    /// Offset in the client io buffer.
    pub io_offset: usize,
    /// Offset inside the logical frame.
    pub frame_offset: usize,
    /// Size in bytes.
    pub size: usize,
    /// Owning slave position.
    pub slave: usize,
}

/// A logical-address window, emitted as one LRD/LWR/LRW per cycle.
#[derive(Debug, Default)]
pub struct PiFrame {
    pub address: u32,
    /// Window size in bytes (inputs then outputs).
    pub size: usize,
    pub inputs: Vec<BlockIo, MAX_BLOCKS_PER_FRAME>,
    pub outputs: Vec<BlockIo, MAX_BLOCKS_PER_FRAME>,
}

impl<'a, N, R, C> Bus<'a, N, R, C>
where
    N: RawPort,
    R: RawPort,
    C: Clock,
{
    /// Detect the PDO layout of every slave, lay the process image out over
    /// `iomap` (inputs first, then outputs) and program SM2/SM3 and the
    /// FMMUs. The ESM is left where it is; request SAFE-OP afterwards.
    ///
    /// `iomap` must stay untouched by the client between `process_data`
    /// cycles and must not be swapped without re-running this.
    pub fn create_mapping(&mut self, iomap: &'a mut [u8]) -> Result<(), EcatError> {
        self.detect_mapping()?;
        self.build_pi_frames(iomap.len())?;
        self.configure_pdo_sync_managers()?;
        self.configure_fmmus()?;
        self.data.iomap = Some(iomap);
        Ok(())
    }

    fn detect_mapping(&mut self) -> Result<(), EcatError> {
        for position in 0..self.data.slave_count {
            let slave = &mut self.data.slaves[position];
            if slave.is_static_mapping {
                // User-supplied bsize / sync manager pair is used as-is.
                slave.input.size = (slave.input.bsize * 8) as u32;
                slave.output.size = (slave.output.bsize * 8) as u32;
                continue;
            }
            slave.input = Default::default();
            slave.output = Default::default();
            slave.input.sync_manager = 3;
            slave.output.sync_manager = 2;

            if slave.supports_coe() {
                self.detect_mapping_coe(position)?;
            } else {
                // No CoE: trust the SII PDO lists.
                let slave = &mut self.data.slaves[position];
                slave.input.size =
                    slave.sii.tx_pdo.iter().map(|e| e.bit_length as u32).sum();
                slave.output.size =
                    slave.sii.rx_pdo.iter().map(|e| e.bit_length as u32).sum();
            }

            let slave = &mut self.data.slaves[position];
            slave.input.bsize = slave.input.size.div_ceil(8) as usize;
            slave.output.bsize = slave.output.size.div_ceil(8) as usize;
            debug!(
                "slave {}: mapping in {} bits / out {} bits",
                slave.address, slave.input.size, slave.output.size
            );
        }
        Ok(())
    }

    /// Walk 0x1C00 then each assigned PDO object of the slave dictionary,
    /// summing mapped entry bit lengths per direction.
    fn detect_mapping_coe(&mut self, position: usize) -> Result<(), EcatError> {
        let mut com_types = [0u8; 8];
        let count = self.read_sdo(
            position,
            SM_COM_TYPE,
            0,
            Access::EmulateComplete,
            &mut com_types,
            MAPPING_SDO_TIMEOUT,
        )?;

        for (channel, com_type) in com_types[..count].iter().enumerate() {
            let is_output = match *com_type {
                SM_TYPE_OUTPUT => true,
                SM_TYPE_INPUT => false,
                _ => continue,
            };

            let mut assigned = [0u8; 64];
            let assigned_len = self.read_sdo(
                position,
                SM_CHANNEL + channel as u16,
                0,
                Access::EmulateComplete,
                &mut assigned,
                MAPPING_SDO_TIMEOUT,
            )?;

            let mut bits = 0u32;
            for pdo in assigned[..assigned_len].chunks_exact(2) {
                let pdo_index = u16::from_le_bytes([pdo[0], pdo[1]]);
                if pdo_index == 0 {
                    continue;
                }
                let mut entries = [0u8; 256];
                let entries_len = self.read_sdo(
                    position,
                    pdo_index,
                    0,
                    Access::EmulateComplete,
                    &mut entries,
                    MAPPING_SDO_TIMEOUT,
                )?;
                for entry in entries[..entries_len].chunks_exact(4) {
                    let mapping = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
                    // Low byte of a PDO mapping entry is its bit length.
                    bits += mapping & 0xFF;
                }
            }

            let slave = &mut self.data.slaves[position];
            let direction = if is_output { &mut slave.output } else { &mut slave.input };
            direction.size += bits;
            direction.sync_manager = channel as u16;
        }
        Ok(())
    }

    /// Pack every slave into logical windows. A slave's input (resp.
    /// output) block never straddles two frames; the io buffer holds all
    /// inputs first, then all outputs.
    fn build_pi_frames(&mut self, iomap_len: usize) -> Result<(), EcatError> {
        let count = self.data.slave_count;
        let total_inputs: usize = self.data.slaves()[..count]
            .iter()
            .map(|s| s.input.bsize)
            .sum();
        let total_outputs: usize = self.data.slaves()[..count]
            .iter()
            .map(|s| s.output.bsize)
            .sum();
        if total_inputs + total_outputs > iomap_len {
            return Err(EcatError::IoMapTooSmall);
        }

        self.data.pi_frames.clear();

        let mut input_io = 0usize; // read section cursor
        let mut output_io = total_inputs; // write section cursor
        let mut first = 0usize;
        let mut address = LOGICAL_START_ADDRESS;

        while first < count {
            // Greedy fill: as many slaves as one window can hold.
            let mut last = first;
            let mut in_bytes = 0usize;
            let mut out_bytes = 0usize;
            while last < count {
                let slave = &self.data.slaves()[last];
                let needed = slave.input.bsize + slave.output.bsize;
                if needed > MAX_PI_FRAME_SIZE {
                    return Err(EcatError::DatagramTooLarge);
                }
                if in_bytes + out_bytes + needed > MAX_PI_FRAME_SIZE {
                    break;
                }
                in_bytes += slave.input.bsize;
                out_bytes += slave.output.bsize;
                last += 1;
            }

            let mut frame = PiFrame {
                address,
                size: in_bytes + out_bytes,
                inputs: Vec::new(),
                outputs: Vec::new(),
            };

            // Inputs occupy the front of the window, outputs follow.
            let mut in_cursor = 0usize;
            let mut out_cursor = in_bytes;
            for position in first..last {
                let slave = &mut self.data.slaves[position];
                if slave.input.bsize > 0 {
                    slave.input.offset = input_io;
                    slave.input.address = address + in_cursor as u32;
                    frame
                        .inputs
                        .push(BlockIo {
                            io_offset: input_io,
                            frame_offset: in_cursor,
                            size: slave.input.bsize,
                            slave: position,
                        })
                        .map_err(|_| EcatError::IoMapTooSmall)?;
                    input_io += slave.input.bsize;
                    in_cursor += slave.input.bsize;
                }
                if slave.output.bsize > 0 {
                    slave.output.offset = output_io;
                    slave.output.address = address + out_cursor as u32;
                    frame
                        .outputs
                        .push(BlockIo {
                            io_offset: output_io,
                            frame_offset: out_cursor,
                            size: slave.output.bsize,
                            slave: position,
                        })
                        .map_err(|_| EcatError::IoMapTooSmall)?;
                    output_io += slave.output.bsize;
                    out_cursor += slave.output.bsize;
                }
            }

            address += frame.size as u32;
            if self.data.pi_frames.push(frame).is_err() {
                return Err(EcatError::IoMapTooSmall);
            }
            first = last;
        }

        debug!(
            "process image: {} frame(s), {} in / {} out bytes",
            self.data.pi_frames.len(),
            total_inputs,
            total_outputs
        );
        Ok(())
    }

    /// Physical RAM start of the process data, output then input: the SII
    /// SyncManager table when it says so, behind the mailboxes otherwise.
    fn physical_addresses(&self, position: usize) -> (u16, u16) {
        let slave = &self.data.slaves()[position];

        let from_sii = |channel: usize| -> Option<u16> {
            slave
                .sii
                .sync_managers
                .get(channel)
                .map(|sm| sm.start_address)
                .filter(|start| *start != 0)
        };

        let default_start = if slave.has_mailbox() {
            slave.mailbox.recv_offset + slave.mailbox.recv_size
        } else {
            0x1000
        };

        let out_channel = slave.output.sync_manager as usize;
        let in_channel = slave.input.sync_manager as usize;
        let out_start = from_sii(out_channel).unwrap_or(default_start);
        let in_start =
            from_sii(in_channel).unwrap_or(out_start + slave.output.bsize as u16);
        (out_start, in_start)
    }

    fn configure_pdo_sync_managers(&mut self) -> Result<(), EcatError> {
        for position in 0..self.data.slave_count {
            let (out_start, in_start) = self.physical_addresses(position);
            let slave = &self.data.slaves()[position];
            let address = slave.address;
            let out = (slave.output.sync_manager, out_start, slave.output.bsize, 0x64u8);
            let into = (slave.input.sync_manager, in_start, slave.input.bsize, 0x20u8);

            for (channel, start, bsize, control) in [out, into] {
                if bsize == 0 {
                    continue;
                }
                let mut config = [0u8; 8];
                {
                    let mut sm = SyncManagerChannel(&mut config[..]);
                    sm.set_start_address(start);
                    sm.set_length(bsize as u16);
                    // 0x64: buffered, write access, watchdog trigger.
                    // 0x20: buffered, read access.
                    sm.set_control(control);
                    sm.set_activate(1);
                }
                let wkc =
                    self.station_write(address, SyncManagerChannel::address(channel), &config)?;
                if wkc != 1 {
                    return Err(UnexpectedWkc { expected: 1, received: wkc }.into());
                }
            }
        }
        Ok(())
    }

    /// One FMMU per direction: FMMU0 maps the output window onto the
    /// slave's RAM (write), FMMU1 the input window (read).
    fn configure_fmmus(&mut self) -> Result<(), EcatError> {
        for position in 0..self.data.slave_count {
            let (out_start, in_start) = self.physical_addresses(position);
            let slave = &self.data.slaves()[position];
            let address = slave.address;
            if slave.output.bsize == 0 && slave.input.bsize == 0 {
                continue;
            }

            let mut config = [0u8; 32];
            fill_fmmu(
                &mut config[..16],
                slave.output.address,
                slave.output.bsize,
                out_start,
                FmmuEntry::TYPE_WRITE,
            );
            fill_fmmu(
                &mut config[16..],
                slave.input.address,
                slave.input.bsize,
                in_start,
                FmmuEntry::TYPE_READ,
            );

            let wkc = self.station_write(address, FmmuEntry::BASE, &config)?;
            if wkc != 1 {
                warn!("FMMU configuration of slave {} not taken", address);
                return Err(UnexpectedWkc { expected: 1, received: wkc }.into());
            }
        }
        Ok(())
    }
}

fn fill_fmmu(buffer: &mut [u8], logical: u32, bsize: usize, physical: u16, fmmu_type: u8) {
    let mut fmmu = FmmuEntry(buffer);
    fmmu.set_logical_address(logical);
    fmmu.set_length(bsize as u16);
    fmmu.set_logical_start_bit(0);
    fmmu.set_logical_stop_bit(7);
    fmmu.set_physical_address(physical);
    fmmu.set_physical_start_bit(0);
    fmmu.set_fmmu_type(fmmu_type);
    fmmu.set_activate((bsize > 0) as u8);
}
