//! `WebSocket` close codes (RFC 6455 §7.4.1).

/// Close codes the broker sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure.
    Normal = 1000,
    /// Server shutting down, or connection refused during shutdown.
    GoingAway = 1001,
    /// Protocol violation.
    ProtocolError = 1002,
    /// Data type the endpoint cannot accept.
    UnacceptableData = 1003,
    /// Message violated server policy (auth, admission).
    PolicyViolation = 1008,
}

impl CloseCode {
    /// Numeric wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Parse a wire value this broker knows about.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::ProtocolError),
            1003 => Some(Self::UnacceptableData),
            1008 => Some(Self::PolicyViolation),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values() {
        assert_eq!(CloseCode::Normal.as_u16(), 1000);
        assert_eq!(CloseCode::GoingAway.as_u16(), 1001);
        assert_eq!(CloseCode::PolicyViolation.as_u16(), 1008);
    }

    #[test]
    fn parse_known_and_unknown() {
        for code in [
            CloseCode::Normal,
            CloseCode::GoingAway,
            CloseCode::ProtocolError,
            CloseCode::UnacceptableData,
            CloseCode::PolicyViolation,
        ] {
            assert_eq!(CloseCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(CloseCode::from_u16(4000), None);
    }
}
