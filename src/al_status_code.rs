//! AL status codes (register 0x134), as defined by ETG.1000.6 table 13.

use num_enum::FromPrimitive;

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq)]
#[repr(u16)]
pub enum AlStatusCode {
    NoError = 0x0000,
    UnspecifiedError = 0x0001,
    NoMemory = 0x0002,
    InvalidRevision = 0x0004,
    InvalidDeviceSetup = 0x0003,
    SiiInformationDoesNotMatchFirmware = 0x0006,
    FirmwareUpdateNotSuccessful = 0x0007,
    LicenceError = 0x000E,
    InvalidRequestedStateChange = 0x0011,
    UnknownRequestedState = 0x0012,
    BootstrapNotSupported = 0x0013,
    NoValidFirmware = 0x0014,
    InvalidMailboxConfiguration = 0x0015,
    InvalidSyncManagerConfiguration = 0x0017,
    NoValidInputsAvailable = 0x0018,
    NoValidOutputs = 0x0019,
    SynchronizationError = 0x001A,
    SyncManagerWatchdog = 0x001B,
    InvalidSyncManagerTypes = 0x001C,
    InvalidOutputConfiguration = 0x001D,
    InvalidInputConfiguration = 0x001E,
    InvalidWatchdogConfiguration = 0x001F,
    SlaveNeedsColdStart = 0x0020,
    SlaveNeedsInit = 0x0021,
    SlaveNeedsPreop = 0x0022,
    SlaveNeedsSafeop = 0x0023,
    InvalidInputMapping = 0x0024,
    InvalidOutputMapping = 0x0025,
    InconsistentSettings = 0x0026,
    FreerunNotSupported = 0x0027,
    SynchronizationNotSupported = 0x0028,
    FreerunNeedsThreeBufferMode = 0x0029,
    BackgroundWatchdog = 0x002A,
    NoValidInputsAndOutputs = 0x002B,
    FatalSyncError = 0x002C,
    NoSyncError = 0x002D,
    InvalidDcSyncConfiguration = 0x0030,
    InvalidDcLatchConfiguration = 0x0031,
    PllError = 0x0032,
    DcSyncIoError = 0x0033,
    DcSyncTimeoutError = 0x0034,
    DcInvalidSyncCycleTime = 0x0035,
    DcSync0CycleTime = 0x0036,
    DcSync1CycleTime = 0x0037,
    MbxAoe = 0x0041,
    MbxEoe = 0x0042,
    MbxCoe = 0x0043,
    MbxFoe = 0x0044,
    MbxSoe = 0x0045,
    MbxVoe = 0x004F,
    EepromNoAccess = 0x0050,
    EepromError = 0x0051,
    SlaveRestartedLocally = 0x0060,
    DeviceIdentificationValueUpdated = 0x0061,
    ApplicationControllerAvailable = 0x00F0,
    #[num_enum(default)]
    Unknown,
}

impl AlStatusCode {
    pub fn description(self) -> &'static str {
        match self {
            AlStatusCode::NoError => "No error",
            AlStatusCode::UnspecifiedError => "Unspecified error",
            AlStatusCode::NoMemory => "No memory",
            AlStatusCode::InvalidRevision => "Invalid revision",
            AlStatusCode::InvalidDeviceSetup => "Invalid device setup",
            AlStatusCode::SiiInformationDoesNotMatchFirmware => {
                "SII/EEPROM information does not match firmware"
            }
            AlStatusCode::FirmwareUpdateNotSuccessful => {
                "Firmware update not successful, old firmware still running"
            }
            AlStatusCode::LicenceError => "Licence error",
            AlStatusCode::InvalidRequestedStateChange => "Invalid requested state change",
            AlStatusCode::UnknownRequestedState => "Unknown requested state",
            AlStatusCode::BootstrapNotSupported => "Bootstrap not supported",
            AlStatusCode::NoValidFirmware => "No valid firmware",
            AlStatusCode::InvalidMailboxConfiguration => "Invalid mailbox configuration",
            AlStatusCode::InvalidSyncManagerConfiguration => {
                "Invalid sync manager configuration"
            }
            AlStatusCode::NoValidInputsAvailable => "No valid inputs available",
            AlStatusCode::NoValidOutputs => "No valid outputs",
            AlStatusCode::SynchronizationError => "Synchronization error",
            AlStatusCode::SyncManagerWatchdog => "Sync manager watchdog",
            AlStatusCode::InvalidSyncManagerTypes => "Invalid sync manager types",
            AlStatusCode::InvalidOutputConfiguration => "Invalid output configuration",
            AlStatusCode::InvalidInputConfiguration => "Invalid input configuration",
            AlStatusCode::InvalidWatchdogConfiguration => "Invalid watchdog configuration",
            AlStatusCode::SlaveNeedsColdStart => "Slave needs cold start",
            AlStatusCode::SlaveNeedsInit => "Slave needs INIT",
            AlStatusCode::SlaveNeedsPreop => "Slave needs PRE-OP",
            AlStatusCode::SlaveNeedsSafeop => "Slave needs SAFE-OP",
            AlStatusCode::InvalidInputMapping => "Invalid input mapping",
            AlStatusCode::InvalidOutputMapping => "Invalid output mapping",
            AlStatusCode::InconsistentSettings => "Inconsistent settings",
            AlStatusCode::FreerunNotSupported => "Freerun not supported",
            AlStatusCode::SynchronizationNotSupported => "Synchronization not supported",
            AlStatusCode::FreerunNeedsThreeBufferMode => "Freerun needs 3 buffer mode",
            AlStatusCode::BackgroundWatchdog => "Background watchdog",
            AlStatusCode::NoValidInputsAndOutputs => "No valid inputs and outputs",
            AlStatusCode::FatalSyncError => "Fatal sync error",
            AlStatusCode::NoSyncError => "No sync error",
            AlStatusCode::InvalidDcSyncConfiguration => "Invalid DC SYNC configuration",
            AlStatusCode::InvalidDcLatchConfiguration => "Invalid DC latch configuration",
            AlStatusCode::PllError => "PLL error",
            AlStatusCode::DcSyncIoError => "DC sync IO error",
            AlStatusCode::DcSyncTimeoutError => "DC sync timeout error",
            AlStatusCode::DcInvalidSyncCycleTime => "DC invalid sync cycle time",
            AlStatusCode::DcSync0CycleTime => "DC SYNC0 cycle time",
            AlStatusCode::DcSync1CycleTime => "DC SYNC1 cycle time",
            AlStatusCode::MbxAoe => "MBX_AOE",
            AlStatusCode::MbxEoe => "MBX_EOE",
            AlStatusCode::MbxCoe => "MBX_COE",
            AlStatusCode::MbxFoe => "MBX_FOE",
            AlStatusCode::MbxSoe => "MBX_SOE",
            AlStatusCode::MbxVoe => "MBX_VOE",
            AlStatusCode::EepromNoAccess => "EEPROM no access",
            AlStatusCode::EepromError => "EEPROM error",
            AlStatusCode::SlaveRestartedLocally => "Slave restarted locally",
            AlStatusCode::DeviceIdentificationValueUpdated => {
                "Device identification value updated"
            }
            AlStatusCode::ApplicationControllerAvailable => "Application controller available",
            AlStatusCode::Unknown => "Unknown AL status code",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_wire_value() {
        assert_eq!(AlStatusCode::SlaveNeedsColdStart, AlStatusCode::from(0x0020u16));
        assert_eq!("Slave needs cold start", AlStatusCode::from(0x0020u16).description());
        assert_eq!(AlStatusCode::Unknown, AlStatusCode::from(0x4242u16));
    }
}
