use crate::{AppError, AppResult};

pub const SESSION_HEADER_SIZE: usize = 4;

/// NetBIOS-style session message types seen on port 445.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMessageType {
    SessionMessage,
    KeepAlive,
    Other(u8),
}

impl From<u8> for SessionMessageType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => SessionMessageType::SessionMessage,
            0x85 => SessionMessageType::KeepAlive,
            other => SessionMessageType::Other(other),
        }
    }
}

/// The 4 byte prefix in front of every message: a type byte and a 24 bit
/// big-endian length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHeader {
    pub kind: SessionMessageType,
    pub length: usize,
}

impl SessionHeader {
    pub fn parse(raw: [u8; SESSION_HEADER_SIZE], max_message_size: usize) -> AppResult<Self> {
        let kind = SessionMessageType::from(raw[0]);
        let length = u32::from_be_bytes([0, raw[1], raw[2], raw[3]]) as usize;
        if length > max_message_size {
            return Err(AppError::MalformedProtocol(format!(
                "message of length {} is too large, limit {}",
                length, max_message_size
            )));
        }
        Ok(SessionHeader { kind, length })
    }

    pub fn encode(length: usize) -> AppResult<[u8; SESSION_HEADER_SIZE]> {
        if length > crate::service::MAX_STREAM_PROT_LEN {
            return Err(AppError::InvalidValue(format!(
                "response of length {} does not fit a session header",
                length
            )));
        }
        let be = (length as u32).to_be_bytes();
        Ok([0x00, be[1], be[2], be[3]])
    }
}
