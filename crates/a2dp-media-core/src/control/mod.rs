//! Control-path protocol
//!
//! The audio HAL drives the stream with single-byte commands and expects a
//! single-byte acknowledgement for each. Some commands complete
//! asynchronously, so at most one command is kept pending until the
//! session reports back.

use std::io::{Read, Write};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Commands accepted on the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCommand {
    CheckReady = 1,
    Start = 2,
    Stop = 3,
    Suspend = 4,
    GetAudioConfig = 5,
    OffloadStart = 6,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Unknown control command 0x{0:02x}")]
pub struct UnknownCommand(pub u8);

impl TryFrom<u8> for ControlCommand {
    type Error = UnknownCommand;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::CheckReady),
            2 => Ok(Self::Start),
            3 => Ok(Self::Stop),
            4 => Ok(Self::Suspend),
            5 => Ok(Self::GetAudioConfig),
            6 => Ok(Self::OffloadStart),
            other => Err(UnknownCommand(other)),
        }
    }
}

/// Acknowledgement byte values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    Success = 0,
    Failure = 1,
    IncallFailure = 2,
    Unsupported = 3,
}

impl AckStatus {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::Failure),
            2 => Some(Self::IncallFailure),
            3 => Some(Self::Unsupported),
            _ => None,
        }
    }
}

/// Control channel endpoint and the command awaiting its ack
#[derive(Default)]
pub struct ControlSession {
    writer: Option<Box<dyn Write + Send>>,
    pending: Option<ControlCommand>,
    acks_written: u64,
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("attached", &self.writer.is_some())
            .field("pending", &self.pending)
            .field("acks_written", &self.acks_written)
            .finish()
    }
}

impl ControlSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, writer: Box<dyn Write + Send>) {
        if self.writer.is_some() {
            debug!("Replacing attached control channel");
        }
        self.writer = Some(writer);
        info!("Control channel attached");
    }

    /// Drops the writer and any pending command
    pub fn detach(&mut self) {
        self.writer = None;
        self.pending = None;
        info!("Control channel detached");
    }

    pub fn is_attached(&self) -> bool {
        self.writer.is_some()
    }

    pub fn pending(&self) -> Option<ControlCommand> {
        self.pending
    }

    pub fn acks_written(&self) -> u64 {
        self.acks_written
    }

    /// Makes `cmd` the pending command, failing the one it supersedes
    pub fn begin(&mut self, cmd: ControlCommand) {
        if let Some(old) = self.pending.take() {
            warn!(?old, new = ?cmd, "Pending command superseded");
            self.write(&[AckStatus::Failure as u8]);
        }
        self.pending = Some(cmd);
    }

    /// Acknowledges the pending command
    ///
    /// Returns false (and writes nothing) when no command is pending.
    pub fn ack(&mut self, status: AckStatus) -> bool {
        self.ack_with(status, &[])
    }

    /// Acknowledges the pending command and appends `payload`
    pub fn ack_with(&mut self, status: AckStatus, payload: &[u8]) -> bool {
        let Some(cmd) = self.pending.take() else {
            warn!(?status, "Ack with no pending command, ignored");
            return false;
        };
        debug!(?cmd, ?status, "Control ack");
        let mut bytes = Vec::with_capacity(1 + payload.len());
        bytes.push(status as u8);
        bytes.extend_from_slice(payload);
        self.write(&bytes);
        true
    }

    /// Acknowledges only if the pending command is one of `expected`
    pub fn ack_if(&mut self, expected: &[ControlCommand], status: AckStatus) -> bool {
        match self.pending {
            Some(cmd) if expected.contains(&cmd) => self.ack(status),
            _ => false,
        }
    }

    /// Fails the pending command, if there is one
    pub fn fail_pending(&mut self) -> bool {
        if self.pending.is_some() {
            self.ack(AckStatus::Failure)
        } else {
            false
        }
    }

    /// Writes an ack for a command that never became pending
    pub fn reject(&mut self, status: AckStatus) {
        self.write(&[status as u8]);
    }

    fn write(&mut self, bytes: &[u8]) {
        let Some(writer) = self.writer.as_mut() else {
            debug!("No control channel attached, ack dropped");
            return;
        };
        match writer.write_all(bytes).and_then(|_| writer.flush()) {
            Ok(()) => self.acks_written += 1,
            Err(e) => {
                warn!(error = %e, "Control channel write failed, detaching");
                self.writer = None;
            }
        }
    }
}

/// Reads command bytes until EOF, handing each to `on_command`
///
/// Returns when the reader hits EOF or an error; `on_command` returning
/// false stops early.
pub fn read_commands<R: Read>(mut reader: R, mut on_command: impl FnMut(u8) -> bool) {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => {
                debug!("Control channel EOF");
                return;
            }
            Ok(_) => {
                if !on_command(byte[0]) {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Control channel read failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn session() -> (ControlSession, SharedBuf) {
        let buf = SharedBuf::default();
        let mut session = ControlSession::new();
        session.attach(Box::new(buf.clone()));
        (session, buf)
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(ControlCommand::try_from(2), Ok(ControlCommand::Start));
        assert_eq!(ControlCommand::try_from(6), Ok(ControlCommand::OffloadStart));
        assert_eq!(ControlCommand::try_from(0), Err(UnknownCommand(0)));
        assert_eq!(ControlCommand::try_from(7), Err(UnknownCommand(7)));
        assert_eq!(AckStatus::from_byte(2), Some(AckStatus::IncallFailure));
    }

    #[test]
    fn test_ack_clears_pending() {
        let (mut session, buf) = session();
        session.begin(ControlCommand::Start);
        assert!(session.ack(AckStatus::Success));
        assert_eq!(session.pending(), None);
        assert!(!session.ack(AckStatus::Success));
        assert_eq!(*buf.0.lock().unwrap(), vec![0]);
    }

    #[test]
    fn test_superseded_command_gets_failure() {
        let (mut session, buf) = session();
        session.begin(ControlCommand::Start);
        session.begin(ControlCommand::Stop);
        session.ack(AckStatus::Success);
        assert_eq!(*buf.0.lock().unwrap(), vec![1, 0]);
        assert_eq!(session.acks_written(), 2);
    }

    #[test]
    fn test_ack_if_matches_pending() {
        let (mut session, buf) = session();
        session.begin(ControlCommand::Suspend);
        assert!(!session.ack_if(&[ControlCommand::Start], AckStatus::Success));
        assert!(session.ack_if(&[ControlCommand::Stop, ControlCommand::Suspend], AckStatus::Success));
        assert_eq!(*buf.0.lock().unwrap(), vec![0]);
    }

    #[test]
    fn test_ack_with_payload() {
        let (mut session, buf) = session();
        session.begin(ControlCommand::GetAudioConfig);
        session.ack_with(AckStatus::Success, &[0x44, 0xAC, 0, 0, 2]);
        assert_eq!(*buf.0.lock().unwrap(), vec![0, 0x44, 0xAC, 0, 0, 2]);
    }

    #[test]
    fn test_detach_drops_pending() {
        let (mut session, _buf) = session();
        session.begin(ControlCommand::Start);
        session.detach();
        assert!(!session.is_attached());
        assert_eq!(session.pending(), None);
        assert!(!session.fail_pending());
    }

    #[test]
    fn test_read_commands_until_eof() {
        let mut seen = Vec::new();
        read_commands(&[1u8, 3, 9][..], |b| {
            seen.push(b);
            true
        });
        assert_eq!(seen, vec![1, 3, 9]);
    }
}
