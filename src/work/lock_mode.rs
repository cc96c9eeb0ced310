use crate::request::{Smb2Command, Smb2Header};

/// How a request holds the connection's serialization lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// read-only request, may overlap other shared requests
    Shared,
    /// mutating request, runs alone on the connection
    Exclusive,
}

/// Read-only only when the command stands alone in its message; a chained
/// message is always exclusive even if every command in it reads.
pub fn lock_mode_for(command: Smb2Command, compounded: bool) -> LockMode {
    if compounded {
        return LockMode::Exclusive;
    }
    match command {
        Smb2Command::Read
        | Smb2Command::QueryDirectory
        | Smb2Command::QueryInfo
        | Smb2Command::OplockBreak
        | Smb2Command::Echo => LockMode::Shared,
        _ => LockMode::Exclusive,
    }
}

/// Classifies a raw request buffer. Anything that does not parse as an SMB2
/// header is treated as mutating.
pub fn classify_request(request: &[u8]) -> LockMode {
    match Smb2Header::peek(request) {
        Ok(header) => lock_mode_for(header.command, header.is_compounded()),
        Err(_) => LockMode::Exclusive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SMB2_HEADER_SIZE;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case(Smb2Command::Read, LockMode::Shared)]
    #[case(Smb2Command::QueryDirectory, LockMode::Shared)]
    #[case(Smb2Command::QueryInfo, LockMode::Shared)]
    #[case(Smb2Command::OplockBreak, LockMode::Shared)]
    #[case(Smb2Command::Echo, LockMode::Shared)]
    #[case(Smb2Command::Write, LockMode::Exclusive)]
    #[case(Smb2Command::Create, LockMode::Exclusive)]
    #[case(Smb2Command::SetInfo, LockMode::Exclusive)]
    #[case(Smb2Command::Negotiate, LockMode::Exclusive)]
    #[case(Smb2Command::SessionSetup, LockMode::Exclusive)]
    #[case(Smb2Command::ChangeNotify, LockMode::Exclusive)]
    #[case(Smb2Command::Cancel, LockMode::Exclusive)]
    fn test_single_command(#[case] command: Smb2Command, #[case] expected: LockMode) {
        assert_eq!(lock_mode_for(command, false), expected);
    }

    #[rstest]
    #[case(Smb2Command::Read)]
    #[case(Smb2Command::QueryInfo)]
    #[case(Smb2Command::Echo)]
    #[case(Smb2Command::Write)]
    fn test_compounded_is_exclusive(#[case] command: Smb2Command) {
        assert_eq!(lock_mode_for(command, true), LockMode::Exclusive);
    }

    #[test]
    fn test_classify_raw_buffers() {
        let mut read = BytesMut::new();
        Smb2Header {
            credit_charge: 1,
            command: Smb2Command::Read,
            credit_request: 1,
            flags: 0,
            next_command: 0,
            message_id: 7,
        }
        .encode(0, &mut read);
        assert_eq!(classify_request(&read), LockMode::Shared);

        assert_eq!(classify_request(&[0u8; SMB2_HEADER_SIZE]), LockMode::Exclusive);
        assert_eq!(classify_request(&[]), LockMode::Exclusive);
    }
}
