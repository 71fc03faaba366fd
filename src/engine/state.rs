use std::fmt;

/// Power state of a session's VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Missing = 0,
    Available = 1,
    PowerOff = 2,
    Saved = 3,
    Paused = 4,
    Running = 5,
}

impl SessionState {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decode a persisted state; unknown codes map to `Missing`.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => SessionState::Available,
            2 => SessionState::PowerOff,
            3 => SessionState::Saved,
            4 => SessionState::Paused,
            5 => SessionState::Running,
            _ => SessionState::Missing,
        }
    }

    /// Whether the VM exists on the hypervisor.
    pub fn is_open(self) -> bool {
        !matches!(self, SessionState::Missing | SessionState::Available)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Missing => "MISSING",
            SessionState::Available => "AVAILABLE",
            SessionState::PowerOff => "POWEROFF",
            SessionState::Saved => "SAVED",
            SessionState::Paused => "PAUSED",
            SessionState::Running => "RUNNING",
        };
        f.write_str(name)
    }
}

/// Bit flags stored in a session's `flags` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionFlags(pub u32);

impl SessionFlags {
    pub const SYSTEM_64BIT: u32 = 1;
    pub const DEPLOYMENT_HDD: u32 = 2;
    pub const GUEST_ADDITIONS: u32 = 4;
    pub const FLOPPY_IO: u32 = 8;
    pub const HEADFUL: u32 = 16;
    pub const GRAPHICAL: u32 = 32;
    pub const DUAL_NIC: u32 = 64;
    pub const SERIAL_LOGFILE: u32 = 128;
    pub const DEPLOYMENT_HDD_LOCAL: u32 = 256;
    pub const IMPORT_OVA: u32 = 512;
    pub const DEPLOYMENT_ISO_LOCAL: u32 = 1024;

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    /// Machine architecture implied by the 64-bit flag.
    pub fn arch(self) -> &'static str {
        if self.contains(Self::SYSTEM_64BIT) {
            "x86_64"
        } else {
            "i386"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_round_trip() {
        for s in [
            SessionState::Missing,
            SessionState::Available,
            SessionState::PowerOff,
            SessionState::Saved,
            SessionState::Paused,
            SessionState::Running,
        ] {
            assert_eq!(SessionState::from_code(s.code()), s);
        }
        assert_eq!(SessionState::from_code(42), SessionState::Missing);
        assert!(SessionState::Saved.is_open());
        assert!(!SessionState::Available.is_open());
    }

    #[test]
    fn test_flags() {
        let flags = SessionFlags(SessionFlags::SYSTEM_64BIT | SessionFlags::HEADFUL);
        assert!(flags.contains(SessionFlags::HEADFUL));
        assert!(!flags.contains(SessionFlags::DEPLOYMENT_HDD));
        assert_eq!(flags.arch(), "x86_64");
        assert_eq!(SessionFlags(0).arch(), "i386");
    }
}
