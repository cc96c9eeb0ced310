use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// accepted, nothing negotiated yet
    New,
    /// waiting for the protocol negotiation to complete
    NeedNegotiate,
    /// fully established
    Good,
    /// fatal transport error seen, reads abort until the session is torn down
    NeedReconnect,
    /// shutdown requested, terminal
    Exiting,
}

impl ConnectionStatus {
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        if self == next {
            return self != Exiting;
        }
        match (self, next) {
            (Exiting, _) => false,
            (_, Exiting) => true,
            (New, NeedNegotiate) => true,
            (NeedNegotiate, Good) => true,
            (New | NeedNegotiate | Good, NeedReconnect) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::New => "NEW",
            ConnectionStatus::NeedNegotiate => "NEED_NEGOTIATE",
            ConnectionStatus::Good => "GOOD",
            ConnectionStatus::NeedReconnect => "NEED_RECONNECT",
            ConnectionStatus::Exiting => "EXITING",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionStatus::{self, *};
    use rstest::rstest;

    #[rstest]
    #[case(New, NeedNegotiate, true)]
    #[case(NeedNegotiate, Good, true)]
    #[case(Good, NeedReconnect, true)]
    #[case(NeedReconnect, Exiting, true)]
    #[case(New, Exiting, true)]
    #[case(Good, Good, true)]
    #[case(New, Good, false)]
    #[case(NeedReconnect, Good, false)]
    #[case(Good, New, false)]
    #[case(Exiting, New, false)]
    #[case(Exiting, Exiting, false)]
    fn test_transitions(
        #[case] from: ConnectionStatus,
        #[case] to: ConnectionStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }
}
