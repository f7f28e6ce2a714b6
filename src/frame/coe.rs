//! CANopen-over-EtherCAT wire structures (ETG.1000.6 chapter 5.6).

use bitfield::*;
use num_enum::FromPrimitive;

pub const COE_HEADER_SIZE: usize = 2;
pub const SDO_HEADER_SIZE: usize = 4;
pub const SDO_INFO_HEADER_SIZE: usize = 4;
pub const EMERGENCY_SIZE: usize = 8;

bitfield! {
    #[derive(Debug, Clone)]
    pub struct CoeHeader([u8]);
    u16;
    pub number, set_number: 8, 0;
    u8;
    pub service, set_service: 15, 12;
}

impl CoeHeader<[u8; COE_HEADER_SIZE]> {
    pub const SIZE: usize = COE_HEADER_SIZE;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

impl<B: AsRef<[u8]>> CoeHeader<B> {
    pub fn coe_service(&self) -> CoeService {
        CoeService::from(self.service())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> CoeHeader<B> {
    pub fn set_coe_service(&mut self, service: CoeService) {
        self.set_service(service as u8)
    }
}

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq)]
#[repr(u8)]
pub enum CoeService {
    Emergency = 1,
    SdoRequest = 2,
    SdoResponse = 3,
    TxPdo = 4,
    RxPdo = 5,
    TxPdoRemoteRequest = 6,
    RxPdoRemoteRequest = 7,
    SdoInformation = 8,
    #[num_enum(default)]
    Other,
}

bitfield! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SdoHeader([u8]);
    pub size_indicator, set_size_indicator: 0;
    pub transfer_type, set_transfer_type: 1;
    u8;
    pub block_size, set_block_size: 3, 2;
    pub complete_access, set_complete_access: 4;
    pub command, set_command: 7, 5;
    u16;
    pub index, set_index: 23, 8;
    u8;
    pub sub_index, set_sub_index: 31, 24;
}

impl SdoHeader<[u8; SDO_HEADER_SIZE]> {
    pub const SIZE: usize = SDO_HEADER_SIZE;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

/// SDO command specifiers, request side.
pub mod sdo_request {
    pub const DOWNLOAD_SEGMENTED: u8 = 0;
    pub const DOWNLOAD: u8 = 1;
    pub const UPLOAD: u8 = 2;
    pub const UPLOAD_SEGMENTED: u8 = 3;
    pub const ABORT: u8 = 4;
}

/// SDO command specifiers, response side.
pub mod sdo_response {
    pub const UPLOAD_SEGMENTED: u8 = 0;
    pub const DOWNLOAD_SEGMENTED: u8 = 1;
    pub const UPLOAD: u8 = 2;
    pub const DOWNLOAD: u8 = 3;
}

bitfield! {
    #[derive(Debug, Clone)]
    pub struct SdoInfoHeader([u8]);
    u8;
    pub opcode, set_opcode: 6, 0;
    pub incomplete, set_incomplete: 7;
    u16;
    pub fragments_left, set_fragments_left: 31, 16;
}

impl SdoInfoHeader<[u8; SDO_INFO_HEADER_SIZE]> {
    pub const SIZE: usize = SDO_INFO_HEADER_SIZE;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

/// SDO Information opcodes. A response opcode is its request plus one.
pub mod sdo_info_op {
    pub const GET_OD_LIST_REQUEST: u8 = 1;
    pub const GET_OD_LIST_RESPONSE: u8 = 2;
    pub const GET_OD_REQUEST: u8 = 3;
    pub const GET_OD_RESPONSE: u8 = 4;
    pub const GET_ED_REQUEST: u8 = 5;
    pub const GET_ED_RESPONSE: u8 = 6;
    pub const ERROR_REQUEST: u8 = 7;
}

/// Object dictionary list selectors for GET_OD_LIST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OdListType {
    NumberOfObjects = 0,
    All = 1,
    RxPdoMappable = 2,
    TxPdoMappable = 3,
    Backup = 4,
    Settings = 5,
}

/// Value-info bitmask for GET_ED.
pub mod value_info {
    pub const UNIT_TYPE: u8 = 0x08;
    pub const DEFAULT: u8 = 0x10;
    pub const MINIMUM: u8 = 0x20;
    pub const MAXIMUM: u8 = 0x40;
}

bitfield! {
    #[derive(Debug, Clone)]
    pub struct EmergencyFrame([u8]);
    u16;
    pub error_code, _: 15, 0;
    u8;
    pub error_register, _: 23, 16;
}

impl EmergencyFrame<[u8; EMERGENCY_SIZE]> {
    pub const SIZE: usize = EMERGENCY_SIZE;

    pub fn new() -> Self {
        Self([0; Self::SIZE])
    }
}

impl<B: AsRef<[u8]>> EmergencyFrame<B> {
    /// Manufacturer specific diagnostic bytes.
    pub fn diagnostic(&self) -> [u8; 5] {
        let mut data = [0; 5];
        data.copy_from_slice(&self.0.as_ref()[3..8]);
        data
    }
}

/// ETG standard SDO abort codes.
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq)]
#[repr(u32)]
pub enum AbortCode {
    NoToggleBitChange = 0x05_03_00_00,
    Timeout = 0x05_04_00_00,
    UnknownClient = 0x05_04_00_01,
    OutsideMemoryRange = 0x05_04_00_05,
    NotSupportedAccess = 0x06_01_00_00,
    WriteOnly = 0x06_01_00_01,
    ReadOnly = 0x06_01_00_02,
    SubIndexCannotBeWritten = 0x06_01_00_03,
    NoSupportForVariableLength = 0x06_01_00_04,
    LengthExceedsMailboxSize = 0x06_01_00_05,
    ObjectMappedToRxPdo = 0x06_01_00_06,
    DoesNotExistInDictionary = 0x06_02_00_00,
    UnableToMapToPdo = 0x06_04_00_41,
    PdoLimit = 0x06_04_00_42,
    ParameterIncompatibility = 0x06_04_00_43,
    DeviceIncompatibility = 0x06_04_00_47,
    WriteProtected = 0x06_06_00_00,
    ParameterLengthMismatch = 0x06_07_00_10,
    ParameterLengthTooLong = 0x06_07_00_12,
    ParameterLengthTooShort = 0x06_07_00_13,
    SubIndexDoesNotExist = 0x06_09_00_11,
    ValueRangeExceeded = 0x06_09_00_30,
    WriteParameterTooLarge = 0x06_09_00_31,
    WriteParameterTooSmall = 0x06_09_00_32,
    ModuleListMismatch = 0x06_09_00_33,
    MaxLessThanMin = 0x06_09_00_36,
    GeneralError = 0x08_00_00_00,
    CannotTransfer = 0x08_00_00_20,
    CannotTransferLocalControl = 0x08_00_00_21,
    CannotTransferInCurrentState = 0x08_00_00_22,
    NoObjectDictionary = 0x08_00_00_23,
    #[num_enum(default)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdo_header_layout() {
        let mut header = SdoHeader::new();
        header.set_size_indicator(true);
        header.set_transfer_type(true);
        header.set_block_size(0);
        header.set_complete_access(false);
        header.set_command(sdo_request::DOWNLOAD);
        header.set_index(0x1018);
        header.set_sub_index(1);

        // expedited download of 4 bytes at 0x1018:1
        assert_eq!([0x23, 0x18, 0x10, 0x01], header.0);
    }

    #[test]
    fn sdo_info_header_layout() {
        let mut header = SdoInfoHeader::new();
        header.set_opcode(sdo_info_op::GET_OD_LIST_REQUEST);
        header.set_incomplete(false);
        header.set_fragments_left(0);
        assert_eq!([0x01, 0x00, 0x00, 0x00], header.0);
    }

    #[test]
    fn emergency_fields() {
        let raw = [0x10, 0x33, 0x81, 1, 2, 3, 4, 5];
        let frame = EmergencyFrame(&raw[..]);
        assert_eq!(0x3310, frame.error_code());
        assert_eq!(0x81, frame.error_register());
        assert_eq!([1, 2, 3, 4, 5], frame.diagnostic());
    }

    #[test]
    fn abort_codes_from_wire() {
        assert_eq!(AbortCode::NotSupportedAccess, AbortCode::from(0x0601_0000u32));
        assert_eq!(AbortCode::Unknown, AbortCode::from(0x1234_5678u32));
    }
}
