use crate::mailbox::MessageStatus;

/// Final state of one datagram at the end of a `process_datagrams` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramState {
    Ok,
    /// No answer was seen for this datagram during the tick.
    Lost,
    /// The frame carrying this datagram could not be written.
    SendError,
    /// An answer was seen but its working counter did not match.
    InvalidWkc,
    /// An answer was seen but no handler was armed for its index.
    NoHandler,
}

/// Failure of the underlying network port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyError {
    Timeout,
    /// `write` accepted fewer bytes than requested.
    PartialWrite,
    /// OS level failure, carrying the errno when available.
    Io(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnexpectedWkc {
    pub expected: u16,
    pub received: u16,
}

impl From<(u16, u16)> for UnexpectedWkc {
    fn from(v: (u16, u16)) -> Self {
        let (expected, received) = v;
        Self { expected, received }
    }
}

/// EEPROM access failures reported by the ESC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EepromError {
    Busy,
    ChecksumError,
    DeviceInfoError,
    CommandError,
    AcknowledgeMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcatError {
    /// Broadcast discovery returned a zero working counter.
    NoSlaveDetected,
    /// Requested watchdog is outside (0, u16::MAX * 100us].
    InvalidWatchdog,
    /// 255 datagrams are already in flight.
    TooManyInFlight,
    /// Received frame is not a well-formed EtherCAT frame.
    InvalidFrame,
    /// Datagram payload does not fit the Ethernet MTU.
    DatagramTooLarge,
    /// Frame cannot host another datagram.
    FrameFull,
    UnexpectedWkc(UnexpectedWkc),
    /// A slave acknowledged an error: AL status code as read from 0x134.
    AlStatusCode { slave: u16, code: u16 },
    Datagram(DatagramState),
    /// Slave has no (active) mailbox.
    MailboxInactive,
    /// Message does not fit the slave receive mailbox.
    MailboxBufferTooSmall,
    /// A mailbox exchange terminated with a non-success status.
    Mailbox(MessageStatus),
    /// No such slave on this bus.
    NoSuchSlave(u16),
    /// More slaves answered discovery than the caller provided storage for.
    TooManySlaves(u16),
    /// Client io buffer cannot hold the mapped process image.
    IoMapTooSmall,
    Timeout,
    /// Segmented SDO download is not supported.
    NotImplemented,
    Eeprom(EepromError),
    Phy(PhyError),
}

impl From<PhyError> for EcatError {
    fn from(err: PhyError) -> Self {
        Self::Phy(err)
    }
}

impl From<DatagramState> for EcatError {
    fn from(state: DatagramState) -> Self {
        Self::Datagram(state)
    }
}

impl From<UnexpectedWkc> for EcatError {
    fn from(wkc: UnexpectedWkc) -> Self {
        Self::UnexpectedWkc(wkc)
    }
}

impl From<EepromError> for EcatError {
    fn from(err: EepromError) -> Self {
        Self::Eeprom(err)
    }
}
