//! Slave Information Interface: the category area of the slave EEPROM,
//! parsed into bounded in-memory tables.
//!
//! The raw buffer is filled word by word during the bus EEPROM fetch
//! (starting at word 0x40) and walked once afterwards. Unknown categories
//! are skipped by their declared size; 0xFFFF ends the walk.

use bit_field::BitField;
use heapless::{String, Vec};
use log::warn;
use num_enum::FromPrimitive;

/// Capacity of the raw category area, in 32-bit words.
pub const SII_BUFFER_WORDS: usize = 512;
pub const SII_MAX_STRINGS: usize = 16;
pub const SII_STRING_LEN: usize = 48;
pub const SII_MAX_PDO_ENTRIES: usize = 32;
pub const SII_MAX_SYNC_MANAGERS: usize = 8;
pub const SII_MAX_FMMUS: usize = 8;

/// EEPROM word addresses of the fixed header area.
pub mod word {
    pub const VENDOR_ID: u16 = 0x08;
    pub const PRODUCT_CODE: u16 = 0x0A;
    pub const REVISION_NUMBER: u16 = 0x0C;
    pub const SERIAL_NUMBER: u16 = 0x0E;
    pub const BOOTSTRAP_MAILBOX: u16 = 0x14;
    pub const STANDARD_MAILBOX: u16 = 0x18;
    pub const MAILBOX_PROTOCOL: u16 = 0x1C;
    pub const EEPROM_SIZE: u16 = 0x3E;
    pub const START_CATEGORY: u16 = 0x40;
}

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq)]
#[repr(u16)]
pub enum CategoryType {
    Strings = 10,
    DataTypes = 20,
    General = 30,
    Fmmu = 40,
    SyncManagers = 41,
    TxPdo = 50,
    RxPdo = 51,
    Dc = 60,
    End = 0xFFFF,
    #[num_enum(default)]
    Other = 0,
}

/// Mailbox protocol bitmask, EEPROM word 0x1C.
pub mod mailbox_protocol {
    pub const NONE: u16 = 0x00;
    pub const AOE: u16 = 0x01;
    pub const EOE: u16 = 0x02;
    pub const COE: u16 = 0x04;
    pub const FOE: u16 = 0x08;
    pub const SOE: u16 = 0x10;
}

/// General category, trimmed to the fields the master acts on.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneralEntry {
    pub group_info_id: u8,
    pub image_name_id: u8,
    pub device_order_id: u8,
    pub device_name_id: u8,
    pub coe_details: u8,
    pub foe_details: u8,
    pub eoe_details: u8,
    pub flags: u8,
    pub current_on_ebus: i16,
    pub physical_memory_address: u16,
}

impl GeneralEntry {
    pub fn sdo_enabled(&self) -> bool {
        self.coe_details.get_bit(0)
    }

    pub fn sdo_info(&self) -> bool {
        self.coe_details.get_bit(1)
    }

    pub fn pdo_assign(&self) -> bool {
        self.coe_details.get_bit(2)
    }

    pub fn pdo_configuration(&self) -> bool {
        self.coe_details.get_bit(3)
    }

    pub fn sdo_complete_access(&self) -> bool {
        self.coe_details.get_bit(5)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncManagerEntry {
    pub start_address: u16,
    pub length: u16,
    pub control: u8,
    pub status: u8,
    pub enable: u8,
    pub sm_type: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PdoEntry {
    pub index: u16,
    pub subindex: u8,
    /// Index into [`Sii::strings`]; 0 is the empty string.
    pub name: u8,
    pub data_type: u8,
    pub bit_length: u8,
    pub flags: u16,
}

#[derive(Debug, Default)]
pub struct Sii {
    /// Raw category area, one EEPROM fetch word per entry, little-endian.
    pub buffer: Vec<u32, SII_BUFFER_WORDS>,
    pub strings: Vec<String<SII_STRING_LEN>, SII_MAX_STRINGS>,
    pub general: Option<GeneralEntry>,
    pub fmmus: Vec<u8, SII_MAX_FMMUS>,
    pub sync_managers: Vec<SyncManagerEntry, SII_MAX_SYNC_MANAGERS>,
    pub tx_pdo: Vec<PdoEntry, SII_MAX_PDO_ENTRIES>,
    pub rx_pdo: Vec<PdoEntry, SII_MAX_PDO_ENTRIES>,
}

impl Sii {
    fn byte(&self, index: usize) -> u8 {
        (self.buffer[index / 4] >> (8 * (index % 4))) as u8
    }

    fn word_at(&self, index: usize) -> u16 {
        self.byte(index) as u16 | (self.byte(index + 1) as u16) << 8
    }

    fn byte_len(&self) -> usize {
        self.buffer.len() * 4
    }

    /// Walk the category chain and fill the parsed tables.
    pub fn parse(&mut self) {
        self.strings.clear();
        self.fmmus.clear();
        self.sync_managers.clear();
        self.tx_pdo.clear();
        self.rx_pdo.clear();
        self.general = None;

        let mut pos = 0usize;
        while pos + 4 <= self.byte_len() {
            let category = CategoryType::from(self.word_at(pos));
            let size = self.word_at(pos + 2) as usize * 2; // words to bytes
            let data = pos + 4;
            pos = data + size;
            if pos > self.byte_len() && category != CategoryType::End {
                warn!("truncated SII category {:?}", category);
                break;
            }

            match category {
                CategoryType::Strings => self.parse_strings(data),
                CategoryType::General => self.parse_general(data),
                CategoryType::Fmmu => self.parse_fmmus(data, size),
                CategoryType::SyncManagers => self.parse_sync_managers(data, size),
                CategoryType::TxPdo => self.parse_pdo(data, true),
                CategoryType::RxPdo => self.parse_pdo(data, false),
                CategoryType::End => break,
                // DataTypes, DC and vendor categories are skipped by size.
                _ => {}
            }
        }
    }

    fn parse_strings(&mut self, start: usize) {
        // Index 0 is reserved as the empty string.
        let _ = self.strings.push(String::new());

        let mut pos = start;
        let count = self.byte(pos);
        pos += 1;
        for _ in 0..count {
            let len = self.byte(pos) as usize;
            pos += 1;
            let mut name = String::new();
            for i in 0..len {
                let _ = name.push(self.byte(pos + i) as char);
            }
            pos += len;
            if self.strings.push(name).is_err() {
                warn!("SII string table full");
                return;
            }
        }
    }

    fn parse_general(&mut self, start: usize) {
        self.general = Some(GeneralEntry {
            group_info_id: self.byte(start),
            image_name_id: self.byte(start + 1),
            device_order_id: self.byte(start + 2),
            device_name_id: self.byte(start + 3),
            coe_details: self.byte(start + 5),
            foe_details: self.byte(start + 6),
            eoe_details: self.byte(start + 7),
            flags: self.byte(start + 13),
            current_on_ebus: self.word_at(start + 14) as i16,
            physical_memory_address: self.word_at(start + 20),
        });
    }

    fn parse_fmmus(&mut self, start: usize, size: usize) {
        for i in 0..size {
            if self.fmmus.push(self.byte(start + i)).is_err() {
                return;
            }
        }
    }

    fn parse_sync_managers(&mut self, start: usize, size: usize) {
        let mut pos = start;
        while pos + 8 <= start + size {
            let entry = SyncManagerEntry {
                start_address: self.word_at(pos),
                length: self.word_at(pos + 2),
                control: self.byte(pos + 4),
                status: self.byte(pos + 5),
                enable: self.byte(pos + 6),
                sm_type: self.byte(pos + 7),
            };
            pos += 8;
            if self.sync_managers.push(entry).is_err() {
                warn!("SII sync manager table full");
                return;
            }
        }
    }

    fn parse_pdo(&mut self, start: usize, tx: bool) {
        // PDO section header: index, entry count, sync manager,
        // synchronization, name, flags. Only the count is needed here.
        let count = self.byte(start + 2);
        let mut pos = start + 8;
        for _ in 0..count {
            let entry = PdoEntry {
                index: self.word_at(pos),
                subindex: self.byte(pos + 2),
                name: self.byte(pos + 3),
                data_type: self.byte(pos + 4),
                bit_length: self.byte(pos + 5),
                flags: self.word_at(pos + 6),
            };
            pos += 8;
            let table = if tx { &mut self.tx_pdo } else { &mut self.rx_pdo };
            if table.push(entry).is_err() {
                warn!("SII PDO table full");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sii_from_words(words: &[u32]) -> Sii {
        let mut sii = Sii::default();
        for word in words {
            sii.buffer.push(*word).unwrap();
        }
        sii.parse();
        sii
    }

    /// Canned category image: 1 TxPDO entry of 255 bits, 2 RxPDO entries of
    /// 255 and 128 bits, one empty SyncManager section.
    fn canned_pdo_image() -> Vec<u32, SII_BUFFER_WORDS> {
        let mut words: Vec<u32, SII_BUFFER_WORDS> = Vec::new();
        for word in [
            0x0008_0032, // TxPDO, 8 words
            0x0001_0000, // pdo index 0, one entry
            0x0000_0000,
            0x0000_0000,
            0x0000_FF00, // entry: 255 bits
            0x000C_0033, // RxPDO, 12 words
            0x0002_0000, // two entries
            0x0000_0000,
            0x0000_0000,
            0x0000_FF00, // 255 bits
            0x0000_0000,
            0x0000_8000, // 128 bits
            0x0008_0029, // SyncM, 8 words
            0x0000_0000,
            0x0000_0000,
            0x0000_0000,
            0x0000_0000,
            0xFFFF_FFFF, // end
        ] {
            words.push(word).unwrap();
        }
        words
    }

    #[test]
    fn parses_canned_pdo_sections() {
        let mut sii = Sii::default();
        sii.buffer = canned_pdo_image();
        sii.parse();

        assert_eq!(1, sii.tx_pdo.len());
        assert_eq!(255, sii.tx_pdo[0].bit_length);
        assert_eq!(2, sii.rx_pdo.len());
        assert_eq!(255, sii.rx_pdo[0].bit_length);
        assert_eq!(128, sii.rx_pdo[1].bit_length);
        assert_eq!(2, sii.sync_managers.len());
    }

    #[test]
    fn unknown_category_advances_by_declared_size() {
        // Unknown category type 0x77 of 2 words, then a TxPDO section with
        // one 8-bit entry. The parser must skip exactly 2 * 2 bytes of
        // opaque payload to land on the TxPDO header.
        let sii = sii_from_words(&[
            0x0002_0077, // unknown type 0x77, 2 words
            0xDEAD_BEEF, // opaque payload
            0x0008_0032, // TxPDO, 8 words
            0x0001_0000, // one entry
            0x0000_0000,
            0x0000_0000,
            0x0000_0800, // entry: 8 bits
            0xFFFF_FFFF,
        ]);
        assert_eq!(1, sii.tx_pdo.len());
        assert_eq!(8, sii.tx_pdo[0].bit_length);
    }

    #[test]
    fn odd_sized_category_keeps_byte_alignment() {
        // A 3-word category puts the next header mid-word in the fetch
        // stream; the byte walker must still land on it.
        let mut bytes: std::vec::Vec<u8> = vec![
            0x77, 0x00, 0x03, 0x00, // unknown type 0x77, 3 words
            1, 2, 3, 4, 5, 6, // 6 bytes of payload
            0x32, 0x00, 0x08, 0x00, // TxPDO, 8 words
            0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, // header, 1 entry
            0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, // entry: 8 bits
            0xFF, 0xFF, 0xFF, 0xFF,
        ];
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        let mut sii = Sii::default();
        for chunk in bytes.chunks(4) {
            sii.buffer
                .push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .unwrap();
        }
        sii.parse();
        assert_eq!(1, sii.tx_pdo.len());
        assert_eq!(8, sii.tx_pdo[0].bit_length);
    }

    #[test]
    fn parses_strings() {
        // Strings section, 3 words: count=2, "ab", "c", one pad byte.
        // Bytes: 02 02 'a' 'b' 01 'c' 00 00 ... -> words LE
        let sii = sii_from_words(&[
            0x0003_000A,
            u32::from_le_bytes([2, 2, b'a', b'b']),
            u32::from_le_bytes([1, b'c', 0, 0]),
            0x0000_0000,
            0xFFFF_FFFF,
        ]);
        assert_eq!(3, sii.strings.len());
        assert_eq!("", sii.strings[0].as_str());
        assert_eq!("ab", sii.strings[1].as_str());
        assert_eq!("c", sii.strings[2].as_str());
    }

    #[test]
    fn general_category_coe_details() {
        let mut bytes = [0u8; 32];
        bytes[0] = 1; // group info id
        bytes[5] = 0x27; // SDO + SDO info + PDO assign + complete access
        let mut words: std::vec::Vec<u32> = vec![0x0010_001E]; // General, 16 words
        for chunk in bytes.chunks(4) {
            words.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        words.push(0xFFFF_FFFF);
        let mut sii = Sii::default();
        for w in words {
            sii.buffer.push(w).unwrap();
        }
        sii.parse();

        let general = sii.general.unwrap();
        assert_eq!(1, general.group_info_id);
        assert!(general.sdo_enabled());
        assert!(general.sdo_info());
        assert!(general.pdo_assign());
        assert!(general.sdo_complete_access());
        assert!(!general.pdo_configuration());
    }
}
