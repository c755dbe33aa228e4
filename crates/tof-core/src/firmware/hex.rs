//! Intel HEX records.
//!
//! Firmware images are shipped as Intel HEX text. Each line is
//! `:LLAAAATT<data>CC` with LL data bytes, a 16-bit address, a record type
//! and a two's-complement checksum over every byte before it.

use std::fmt::Write as _;

use byteorder::{BigEndian, ByteOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Data,
    EndOfFile,
    ExtendedSegmentAddress,
    StartSegmentAddress,
    ExtendedLinearAddress,
    StartLinearAddress,
}

impl RecordType {
    pub fn code(self) -> u8 {
        match self {
            RecordType::Data => 0x00,
            RecordType::EndOfFile => 0x01,
            RecordType::ExtendedSegmentAddress => 0x02,
            RecordType::StartSegmentAddress => 0x03,
            RecordType::ExtendedLinearAddress => 0x04,
            RecordType::StartLinearAddress => 0x05,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(RecordType::Data),
            0x01 => Some(RecordType::EndOfFile),
            0x02 => Some(RecordType::ExtendedSegmentAddress),
            0x03 => Some(RecordType::StartSegmentAddress),
            0x04 => Some(RecordType::ExtendedLinearAddress),
            0x05 => Some(RecordType::StartLinearAddress),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub kind: RecordType,
    pub address: u16,
    pub data: Vec<u8>,
}

impl HexRecord {
    pub fn new(kind: RecordType, address: u16, data: Vec<u8>) -> Self {
        Self {
            kind,
            address,
            data,
        }
    }

    pub fn end_of_file() -> Self {
        Self::new(RecordType::EndOfFile, 0, Vec::new())
    }

    /// Parse one line. Surrounding whitespace must already be stripped.
    pub fn parse(line: &str) -> Result<Self, String> {
        let digits = line
            .strip_prefix(':')
            .ok_or_else(|| "missing ':' start code".to_string())?;
        if digits.len() % 2 != 0 {
            return Err("odd number of hex digits".into());
        }

        let mut bytes = Vec::with_capacity(digits.len() / 2);
        for i in (0..digits.len()).step_by(2) {
            let pair = digits
                .get(i..i + 2)
                .ok_or_else(|| "non-ASCII character".to_string())?;
            let b = u8::from_str_radix(pair, 16).map_err(|_| format!("bad hex digits '{pair}'"))?;
            bytes.push(b);
        }

        if bytes.len() < 5 {
            return Err("record too short".into());
        }
        let len = bytes[0] as usize;
        if bytes.len() != len + 5 {
            return Err(format!("length field {len} does not match record"));
        }
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            return Err("checksum mismatch".into());
        }
        let kind = RecordType::from_code(bytes[3])
            .ok_or_else(|| format!("unknown record type {:#04x}", bytes[3]))?;

        Ok(Self {
            kind,
            address: BigEndian::read_u16(&bytes[1..3]),
            data: bytes[4..4 + len].to_vec(),
        })
    }

    /// Upper address bits carried by an extended address record.
    pub fn extended_base(&self) -> Option<u32> {
        if self.data.len() != 2 {
            return None;
        }
        let value = u32::from(BigEndian::read_u16(&self.data));
        match self.kind {
            RecordType::ExtendedLinearAddress => Some(value << 16),
            RecordType::ExtendedSegmentAddress => Some(value << 4),
            _ => None,
        }
    }

    pub fn encode(&self) -> String {
        let mut raw = Vec::with_capacity(self.data.len() + 5);
        raw.push(self.data.len() as u8);
        raw.extend_from_slice(&self.address.to_be_bytes());
        raw.push(self.kind.code());
        raw.extend_from_slice(&self.data);
        let sum = raw.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        raw.push(sum.wrapping_neg());

        let mut out = String::with_capacity(raw.len() * 2 + 1);
        out.push(':');
        for b in raw {
            let _ = write!(out, "{b:02X}");
        }
        out
    }
}

/// Render `image` as Intel HEX text loaded at `base`, `per_record` bytes
/// per data line, terminated by an end-of-file record.
pub fn encode_image(base: u32, image: &[u8], per_record: usize) -> String {
    let per_record = per_record.clamp(1, 255);
    let mut out = String::new();
    let mut upper = None;

    for (i, chunk) in image.chunks(per_record).enumerate() {
        let addr = base.wrapping_add((i * per_record) as u32);
        let hi = (addr >> 16) as u16;
        if upper != Some(hi) {
            let rec = HexRecord::new(
                RecordType::ExtendedLinearAddress,
                0,
                hi.to_be_bytes().to_vec(),
            );
            out.push_str(&rec.encode());
            out.push('\n');
            upper = Some(hi);
        }
        let rec = HexRecord::new(RecordType::Data, addr as u16, chunk.to_vec());
        out.push_str(&rec.encode());
        out.push('\n');
    }
    out.push_str(&HexRecord::end_of_file().encode());
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_record() {
        let rec = HexRecord::parse(":0300300002337A1E").unwrap();
        assert_eq!(rec.kind, RecordType::Data);
        assert_eq!(rec.address, 0x0030);
        assert_eq!(rec.data, vec![0x02, 0x33, 0x7A]);
    }

    #[test]
    fn test_parse_eof_and_extended() {
        let eof = HexRecord::parse(":00000001FF").unwrap();
        assert_eq!(eof.kind, RecordType::EndOfFile);

        let ext = HexRecord::parse(":020000042000DA").unwrap();
        assert_eq!(ext.extended_base(), Some(0x2000_0000));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(HexRecord::parse("0300300002337A1E").is_err());
        assert!(HexRecord::parse(":0300300002337A1F").is_err());
        assert!(HexRecord::parse(":0400300002337A1E").is_err());
        assert!(HexRecord::parse(":00000009F7").is_err());
        assert!(HexRecord::parse(":0G").is_err());
    }

    #[test]
    fn test_encode_matches_reference() {
        let rec = HexRecord::new(RecordType::Data, 0x0030, vec![0x02, 0x33, 0x7A]);
        assert_eq!(rec.encode(), ":0300300002337A1E");
        assert_eq!(HexRecord::end_of_file().encode(), ":00000001FF");
    }

    #[test]
    fn test_encode_image_layout() {
        let text = encode_image(0x2000_0000, &[0xAA; 40], 16);
        let lines: Vec<&str> = text.lines().collect();
        // ext linear + 3 data + eof
        assert_eq!(lines.len(), 5);
        let parsed: Vec<HexRecord> = lines.iter().map(|l| HexRecord::parse(l).unwrap()).collect();
        assert_eq!(parsed[0].extended_base(), Some(0x2000_0000));
        assert_eq!(parsed[1].data.len(), 16);
        assert_eq!(parsed[3].address, 32);
        assert_eq!(parsed[3].data.len(), 8);
        assert_eq!(parsed[4].kind, RecordType::EndOfFile);
    }
}
