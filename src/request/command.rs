use bytes::Buf;

use crate::{AppError, AppResult};

pub const SMB2_PROTO_ID: [u8; 4] = [0xFE, b'S', b'M', b'B'];
pub const SMB2_HEADER_SIZE: usize = 64;

/// response bit in the header flags
pub const SMB2_FLAGS_SERVER_TO_REDIR: u32 = 0x0000_0001;
pub const SMB2_FLAGS_ASYNC_COMMAND: u32 = 0x0000_0002;

pub const STATUS_SUCCESS: u32 = 0x0000_0000;
pub const STATUS_PENDING: u32 = 0x0000_0103;
pub const STATUS_INVALID_PARAMETER: u32 = 0xC000_000D;
pub const STATUS_INSUFFICIENT_RESOURCES: u32 = 0xC000_009A;
pub const STATUS_NOT_SUPPORTED: u32 = 0xC000_00BB;
pub const STATUS_CANCELLED: u32 = 0xC000_0120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Smb2Command {
    Negotiate = 0x0000,
    SessionSetup = 0x0001,
    Logoff = 0x0002,
    TreeConnect = 0x0003,
    TreeDisconnect = 0x0004,
    Create = 0x0005,
    Close = 0x0006,
    Flush = 0x0007,
    Read = 0x0008,
    Write = 0x0009,
    Lock = 0x000a,
    Ioctl = 0x000b,
    Cancel = 0x000c,
    Echo = 0x000d,
    QueryDirectory = 0x000e,
    ChangeNotify = 0x000f,
    QueryInfo = 0x0010,
    SetInfo = 0x0011,
    OplockBreak = 0x0012,
}

impl TryFrom<u16> for Smb2Command {
    type Error = AppError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0000 => Smb2Command::Negotiate,
            0x0001 => Smb2Command::SessionSetup,
            0x0002 => Smb2Command::Logoff,
            0x0003 => Smb2Command::TreeConnect,
            0x0004 => Smb2Command::TreeDisconnect,
            0x0005 => Smb2Command::Create,
            0x0006 => Smb2Command::Close,
            0x0007 => Smb2Command::Flush,
            0x0008 => Smb2Command::Read,
            0x0009 => Smb2Command::Write,
            0x000A => Smb2Command::Lock,
            0x000B => Smb2Command::Ioctl,
            0x000C => Smb2Command::Cancel,
            0x000D => Smb2Command::Echo,
            0x000E => Smb2Command::QueryDirectory,
            0x000F => Smb2Command::ChangeNotify,
            0x0010 => Smb2Command::QueryInfo,
            0x0011 => Smb2Command::SetInfo,
            0x0012 => Smb2Command::OplockBreak,
            other => {
                return Err(AppError::MalformedProtocol(format!(
                    "unknown smb2 command {:#06x}",
                    other
                )))
            }
        })
    }
}

impl From<Smb2Command> for u16 {
    fn from(value: Smb2Command) -> Self {
        value as u16
    }
}

/// The fields of a sync SMB2 header the core looks at. Everything past
/// these belongs to the command layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2Header {
    pub credit_charge: u16,
    pub command: Smb2Command,
    pub credit_request: u16,
    pub flags: u32,
    pub next_command: u32,
    pub message_id: u64,
}

impl Smb2Header {
    /// Reads the header at the start of `buf` without consuming it.
    pub fn peek(buf: &[u8]) -> AppResult<Smb2Header> {
        if buf.len() < SMB2_HEADER_SIZE {
            return Err(AppError::MalformedProtocol(format!(
                "smb2 header needs {} bytes, got {}",
                SMB2_HEADER_SIZE,
                buf.len()
            )));
        }
        if buf[..4] != SMB2_PROTO_ID {
            return Err(AppError::MalformedProtocol(format!(
                "bad protocol id {:02x?}",
                &buf[..4]
            )));
        }
        let mut cursor = &buf[4..SMB2_HEADER_SIZE];
        let _structure_size = cursor.get_u16_le();
        let credit_charge = cursor.get_u16_le();
        let _status = cursor.get_u32_le();
        let command = Smb2Command::try_from(cursor.get_u16_le())?;
        let credit_request = cursor.get_u16_le();
        let flags = cursor.get_u32_le();
        let next_command = cursor.get_u32_le();
        let message_id = cursor.get_u64_le();

        Ok(Smb2Header {
            credit_charge,
            command,
            credit_request,
            flags,
            next_command,
            message_id,
        })
    }

    pub fn is_compounded(&self) -> bool {
        self.next_command != 0
    }

    /// Async id of a header carrying the async flag. It sits where a sync
    /// header has its reserved and tree id fields.
    pub fn peek_async_id(buf: &[u8]) -> Option<u64> {
        let header = Smb2Header::peek(buf).ok()?;
        if header.flags & SMB2_FLAGS_ASYNC_COMMAND == 0 {
            return None;
        }
        let mut field = &buf[32..40];
        Some(field.get_u64_le())
    }

    /// Encodes a 64 byte sync header. Test clients and the reference
    /// collaborator use it; the core itself only ever peeks.
    pub fn encode(&self, status: u32, out: &mut bytes::BytesMut) {
        self.encode_with(self.flags, status, 0, out);
    }

    pub fn encode_async(&self, status: u32, async_id: u64, out: &mut bytes::BytesMut) {
        self.encode_with(self.flags | SMB2_FLAGS_ASYNC_COMMAND, status, async_id, out);
    }

    fn encode_with(&self, flags: u32, status: u32, id_field: u64, out: &mut bytes::BytesMut) {
        use bytes::BufMut;

        out.put_slice(&SMB2_PROTO_ID);
        out.put_u16_le(SMB2_HEADER_SIZE as u16);
        out.put_u16_le(self.credit_charge);
        out.put_u32_le(status);
        out.put_u16_le(self.command.into());
        out.put_u16_le(self.credit_request);
        out.put_u32_le(flags);
        out.put_u32_le(self.next_command);
        out.put_u64_le(self.message_id);
        // async id, or reserved and tree id
        out.put_u64_le(id_field);
        // session id, signature
        out.put_u64_le(0);
        out.put_bytes(0, 16);
    }
}
