//! Event records delivered to task event queues.

/// Kind of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum EventKind {
    /// Keyboard input; `data[0]` is the key code, `data[1]` the pressed flag.
    Key = 1,
    /// Pointer input; `data[0]`/`data[1]` are packed deltas and buttons.
    Mouse = 2,
    /// A timer registered by the task fired.
    Timer = 3,
    /// A child process exited; `data[0]` is the pid, `data[1]` the code.
    ProcessExit = 4,
    /// Application-defined payload.
    User = 5,
}

impl EventKind {
    /// Decode a raw kind value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(EventKind::Key),
            2 => Some(EventKind::Mouse),
            3 => Some(EventKind::Timer),
            4 => Some(EventKind::ProcessExit),
            5 => Some(EventKind::User),
            _ => None,
        }
    }
}

/// One event as laid out in user memory (24 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(C)]
pub struct Event {
    /// Event kind.
    pub kind: EventKind,
    /// Reserved, always zero.
    pub _pad: u32,
    /// Kind-specific payload.
    pub data: [u64; 2],
}

impl Event {
    /// Size of the user-visible record.
    pub const SIZE: usize = 24;

    /// Build an event.
    pub const fn new(kind: EventKind, a: u64, b: u64) -> Self {
        Self {
            kind,
            _pad: 0,
            data: [a, b],
        }
    }

    /// Serialize into the little-endian user layout.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        out[8..16].copy_from_slice(&self.data[0].to_le_bytes());
        out[16..24].copy_from_slice(&self.data[1].to_le_bytes());
        out
    }

    /// Parse the little-endian user layout.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Option<Self> {
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[0..4]);
        let kind = EventKind::from_raw(u32::from_le_bytes(word))?;
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&bytes[8..16]);
        b.copy_from_slice(&bytes[16..24]);
        Some(Self::new(kind, u64::from_le_bytes(a), u64::from_le_bytes(b)))
    }
}
