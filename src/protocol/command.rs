//! Command codes understood by the dispatcher.

/// Known command codes.
///
/// Frames carry the raw `u16`; unknown codes still decode and are rejected
/// at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    /// Chat message.
    TextMessage = 1,
    /// First packet of a file transfer, payload is the filename.
    FileStart = 2,
    /// File content chunk.
    FileData = 3,
    /// File transfer finished.
    FileComplete = 4,
    /// Connectivity probe.
    TestConnect = 1981,
}

impl Command {
    /// Wire value of this command.
    pub const fn code(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Command {
    type Error = u16;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Command::TextMessage),
            2 => Ok(Command::FileStart),
            3 => Ok(Command::FileData),
            4 => Ok(Command::FileComplete),
            1981 => Ok(Command::TestConnect),
            other => Err(other),
        }
    }
}

impl From<Command> for u16 {
    fn from(command: Command) -> u16 {
        command.code()
    }
}
