use core::time::Duration;

use crate::error::PhyError;

/// One raw Ethernet endpoint, as seen by the link layer.
///
/// Implementations live outside the core (AF_PACKET, pcap, a simulator...).
/// `write` must put one full frame on the wire: a partial write is an error.
/// `read` must return one full frame, `Ok(0)` meaning "no interface here"
/// (see [`NullPort`]), `Err(PhyError::Timeout)` when the configured timeout
/// elapsed with nothing to read.
pub trait RawPort {
    fn open(&mut self, interface: &str) -> Result<(), PhyError>;

    /// `None` means blocking reads/writes.
    fn set_timeout(&mut self, timeout: Option<Duration>);

    /// Idempotent and infallible.
    fn close(&mut self);

    fn write(&mut self, frame: &[u8]) -> Result<usize, PhyError>;

    fn read(&mut self, frame: &mut [u8]) -> Result<usize, PhyError>;
}

/// Placeholder for the redundancy interface when the master runs on a
/// single NIC. Writes succeed without side effect, reads yield no data.
#[derive(Debug, Default)]
pub struct NullPort;

impl RawPort for NullPort {
    fn open(&mut self, _interface: &str) -> Result<(), PhyError> {
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Option<Duration>) {}

    fn close(&mut self) {}

    fn write(&mut self, frame: &[u8]) -> Result<usize, PhyError> {
        Ok(frame.len())
    }

    fn read(&mut self, _frame: &mut [u8]) -> Result<usize, PhyError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_port_swallows_writes_and_reads_nothing() {
        let mut port = NullPort;
        assert_eq!(Ok(60), port.write(&[0u8; 60]));
        let mut buffer = [0u8; 64];
        assert_eq!(Ok(0), port.read(&mut buffer));
        port.close();
        port.close();
    }
}
