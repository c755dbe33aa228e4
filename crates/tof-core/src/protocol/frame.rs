//! Frames handed to consumers through the frame queue.
//!
//! Serialized form: `[kind][len lo][len hi][payload..]`.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;

/// Frame header size.
pub const FRAME_HEADER_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Raw App0 result record.
    Results,
    /// Diagnostic state mask.
    Diagnostic,
    /// Session-generated error report.
    Error,
}

impl FrameKind {
    pub fn id(self) -> u8 {
        match self {
            FrameKind::Results => 0x01,
            FrameKind::Diagnostic => 0x02,
            FrameKind::Error => 0x03,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(FrameKind::Results),
            0x02 => Some(FrameKind::Diagnostic),
            0x03 => Some(FrameKind::Error),
            _ => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Results => write!(f, "results"),
            FrameKind::Diagnostic => write!(f, "diagnostic"),
            FrameKind::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        let mut len = [0u8; 2];
        LittleEndian::write_u16(&mut len, self.payload.len() as u16);
        out.push(self.kind.id());
        out.extend_from_slice(&len);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse one serialized frame, returning it and the bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Option<(Self, usize)> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let kind = FrameKind::from_id(bytes[0])?;
        let len = LittleEndian::read_u16(&bytes[1..3]) as usize;
        let end = FRAME_HEADER_SIZE + len;
        if bytes.len() < end {
            return None;
        }
        Some((Self::new(kind, bytes[FRAME_HEADER_SIZE..end].to_vec()), end))
    }

    /// Decode the payload of a [`FrameKind::Results`] frame.
    pub fn result(&self) -> Option<ResultRecord> {
        match self.kind {
            FrameKind::Results => ResultRecord::parse(&self.payload),
            _ => None,
        }
    }

    /// Decode the payload of a [`FrameKind::Error`] frame.
    pub fn error_report(&self) -> Option<ErrorReport> {
        match (self.kind, self.payload.as_slice()) {
            (FrameKind::Error, [code, status, ..]) => Some(ErrorReport {
                code: ErrorCode::from_id(*code),
                device_status: *status,
            }),
            _ => None,
        }
    }
}

/// One App0 ranging result, as laid out at [`REG_RESULTS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultRecord {
    pub result_number: u8,
    /// Confidence, 0..=63.
    pub reliability: u8,
    /// Measurement status bits from the upper part of the info byte.
    pub status: u8,
    pub distance_mm: u16,
    pub sys_clock: u32,
    pub state_data: [u8; ALG_STATE_SIZE],
    pub temperature: i8,
    pub reference_hits: u32,
    pub object_hits: u32,
}

impl ResultRecord {
    pub const SIZE: usize = RESULT_RECORD_SIZE;

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut state_data = [0u8; ALG_STATE_SIZE];
        state_data.copy_from_slice(&bytes[8..8 + ALG_STATE_SIZE]);
        Some(Self {
            result_number: bytes[0],
            reliability: bytes[1] & 0x3F,
            status: bytes[1] >> 6,
            distance_mm: LittleEndian::read_u16(&bytes[2..4]),
            sys_clock: LittleEndian::read_u32(&bytes[4..8]),
            state_data,
            temperature: bytes[19] as i8,
            reference_hits: LittleEndian::read_u32(&bytes[20..24]),
            object_hits: LittleEndian::read_u32(&bytes[24..28]),
        })
    }

    pub fn to_bytes(&self) -> [u8; RESULT_RECORD_SIZE] {
        let mut out = [0u8; RESULT_RECORD_SIZE];
        out[0] = self.result_number;
        out[1] = (self.reliability & 0x3F) | (self.status << 6);
        LittleEndian::write_u16(&mut out[2..4], self.distance_mm);
        LittleEndian::write_u32(&mut out[4..8], self.sys_clock);
        out[8..8 + ALG_STATE_SIZE].copy_from_slice(&self.state_data);
        out[19] = self.temperature as u8;
        LittleEndian::write_u32(&mut out[20..24], self.reference_hits);
        LittleEndian::write_u32(&mut out[24..28], self.object_hits);
        out
    }
}

/// Error classes reported through the frame queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Communication,
    BufferOverflow,
    Device,
    Other(u8),
}

impl ErrorCode {
    pub fn id(self) -> u8 {
        match self {
            ErrorCode::Communication => 0x01,
            ErrorCode::BufferOverflow => 0x02,
            ErrorCode::Device => 0x03,
            ErrorCode::Other(id) => id,
        }
    }

    pub fn from_id(id: u8) -> Self {
        match id {
            0x01 => ErrorCode::Communication,
            0x02 => ErrorCode::BufferOverflow,
            0x03 => ErrorCode::Device,
            other => ErrorCode::Other(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Communication => write!(f, "communication"),
            ErrorCode::BufferOverflow => write!(f, "buffer overflow"),
            ErrorCode::Device => write!(f, "device"),
            ErrorCode::Other(id) => write!(f, "error {id:#04x}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorReport {
    pub code: ErrorCode,
    /// Device status code at the time of the report, 0 if none.
    pub device_status: u8,
}

impl ErrorReport {
    pub fn to_frame(self) -> Frame {
        Frame::new(FrameKind::Error, vec![self.code.id(), self.device_status])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_record_layout() {
        let mut raw = [0u8; RESULT_RECORD_SIZE];
        raw[0] = 7;
        raw[1] = 0x40 | 0x2A;
        raw[2] = 0xE8;
        raw[3] = 0x03;
        raw[19] = 0xF6;
        raw[24] = 0x10;

        let rec = ResultRecord::parse(&raw).unwrap();
        assert_eq!(rec.result_number, 7);
        assert_eq!(rec.reliability, 42);
        assert_eq!(rec.status, 1);
        assert_eq!(rec.distance_mm, 1000);
        assert_eq!(rec.temperature, -10);
        assert_eq!(rec.object_hits, 0x10);
        assert_eq!(rec.to_bytes(), raw);

        assert!(ResultRecord::parse(&raw[..10]).is_none());
    }

    #[test]
    fn test_frame_serialization() {
        let frame = ErrorReport {
            code: ErrorCode::BufferOverflow,
            device_status: 0,
        }
        .to_frame();
        let bytes = frame.to_bytes();
        assert_eq!(bytes, vec![0x03, 0x02, 0x00, 0x02, 0x00]);

        let (parsed, used) = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(parsed.error_report().unwrap().code, ErrorCode::BufferOverflow);
        assert!(parsed.result().is_none());

        assert!(Frame::from_bytes(&bytes[..4]).is_none());
        assert!(Frame::from_bytes(&[0x7F, 0, 0]).is_none());
    }
}
