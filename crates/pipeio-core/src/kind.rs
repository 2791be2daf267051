//! Pipe direction, transmission mode, kind and connection state types

use core::fmt;

/// Which directions a pipe end supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipeDirection {
    /// Read only
    In = 1,

    /// Write only
    Out = 2,

    /// Read and write
    InOut = 3,
}

impl PipeDirection {
    #[inline]
    pub const fn can_read(&self) -> bool {
        matches!(self, PipeDirection::In | PipeDirection::InOut)
    }

    #[inline]
    pub const fn can_write(&self) -> bool {
        matches!(self, PipeDirection::Out | PipeDirection::InOut)
    }
}

/// Transmission discipline of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransmissionMode {
    /// Byte stream, no boundaries
    #[default]
    Byte = 0,

    /// Write boundaries preserved on the read side
    Message = 1,
}

impl From<u8> for TransmissionMode {
    fn from(v: u8) -> Self {
        match v {
            1 => TransmissionMode::Message,
            _ => TransmissionMode::Byte,
        }
    }
}

/// Capability set of a pipe end.
///
/// Decides how mode and buffer-size queries are answered: from the values
/// cached at construction, or from the live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    /// Unnamed pipe pair. Byte mode only.
    Anonymous,

    /// Named endpoint created by this process.
    Named,

    /// Wraps a handle supplied from outside. Cached values are not trusted.
    FromExistingHandle,
}

impl PipeKind {
    /// Whether values cached at construction may be trusted by default
    #[inline]
    pub const fn trusts_cache(&self) -> bool {
        !matches!(self, PipeKind::FromExistingHandle)
    }

    /// Whether message read mode can be selected
    #[inline]
    pub const fn supports_message_mode(&self) -> bool {
        !matches!(self, PipeKind::Anonymous)
    }
}

impl fmt::Display for PipeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeKind::Anonymous => write!(f, "anonymous"),
            PipeKind::Named => write!(f, "named"),
            PipeKind::FromExistingHandle => write!(f, "existing-handle"),
        }
    }
}

/// Connection state.
///
/// Moves forward only: Unconnected → Connected → {Broken | Closed}.
/// Explicit close moves any state to Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PipeState {
    /// Created, handshake not finished
    Unconnected = 0,

    /// Usable for I/O
    Connected = 1,

    /// Peer went away or the handle became unusable
    Broken = 2,

    /// Closed by the owner, handle released
    Closed = 3,
}

impl PipeState {
    /// No new operation may start
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, PipeState::Broken | PipeState::Closed)
    }
}

impl From<u8> for PipeState {
    fn from(v: u8) -> Self {
        match v {
            0 => PipeState::Unconnected,
            1 => PipeState::Connected,
            2 => PipeState::Broken,
            _ => PipeState::Closed,
        }
    }
}

impl From<PipeState> for u8 {
    fn from(state: PipeState) -> u8 {
        state as u8
    }
}

impl fmt::Display for PipeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeState::Unconnected => write!(f, "UNCONNECTED"),
            PipeState::Connected => write!(f, "CONNECTED"),
            PipeState::Broken => write!(f, "BROKEN"),
            PipeState::Closed => write!(f, "CLOSED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_caps() {
        assert!(PipeDirection::In.can_read());
        assert!(!PipeDirection::In.can_write());
        assert!(PipeDirection::Out.can_write());
        assert!(!PipeDirection::Out.can_read());
        assert!(PipeDirection::InOut.can_read() && PipeDirection::InOut.can_write());
    }

    #[test]
    fn test_state_ordering() {
        assert!(PipeState::Unconnected < PipeState::Connected);
        assert!(PipeState::Connected < PipeState::Broken);
        assert!(PipeState::Broken.is_terminal());
        assert!(PipeState::Closed.is_terminal());
        assert!(!PipeState::Connected.is_terminal());
        assert_eq!(PipeState::from(u8::from(PipeState::Broken)), PipeState::Broken);
    }

    #[test]
    fn test_kind_caps() {
        assert!(!PipeKind::FromExistingHandle.trusts_cache());
        assert!(PipeKind::Named.trusts_cache());
        assert!(!PipeKind::Anonymous.supports_message_mode());
    }
}
