//! Protocol commands
//!
//! Defines the command table understood by the bridge firmware and the
//! caller-facing request type.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::{DispatchError, MAX_TARGET_ID, PAYLOAD_LEN};

/// Commands with a well-known name on the firmware side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseCommand {
    /// Reset device state
    Reset,
    /// Ready check
    Ready,
    /// Test pattern
    Test,
    /// Start playback at the scheduled instant
    Play,
    /// Pause playback at the scheduled instant
    Pause,
}

impl BaseCommand {
    /// Every named command, in table order
    pub const ALL: [BaseCommand; 5] = [
        BaseCommand::Reset,
        BaseCommand::Ready,
        BaseCommand::Test,
        BaseCommand::Play,
        BaseCommand::Pause,
    ];

    /// Numeric code sent on the wire (before slot folding)
    pub fn code(&self) -> u8 {
        match self {
            BaseCommand::Reset => 0x01,
            BaseCommand::Ready => 0x02,
            BaseCommand::Test => 0x03,
            BaseCommand::Play => 0xA0,
            BaseCommand::Pause => 0xA1,
        }
    }

    /// Canonical upper-case name
    pub fn name(&self) -> &'static str {
        match self {
            BaseCommand::Reset => "RESET",
            BaseCommand::Ready => "READY",
            BaseCommand::Test => "TEST",
            BaseCommand::Play => "PLAY",
            BaseCommand::Pause => "PAUSE",
        }
    }

    /// Look up a command by name, ignoring case
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|cmd| cmd.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Look up a command by its numeric code
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|cmd| cmd.code() == code)
    }
}

/// A command as supplied by the caller: a table name or a raw code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandId {
    Named(String),
    Numeric(u8),
}

impl CommandId {
    /// Resolve to the numeric base code
    pub fn resolve(&self) -> Result<u8, DispatchError> {
        match self {
            CommandId::Named(name) => BaseCommand::from_name(name)
                .map(|cmd| cmd.code())
                .ok_or_else(|| DispatchError::UnknownCommand(name.clone())),
            CommandId::Numeric(code) => Ok(*code),
        }
    }
}

impl From<u8> for CommandId {
    fn from(code: u8) -> Self {
        CommandId::Numeric(code)
    }
}

impl From<BaseCommand> for CommandId {
    fn from(cmd: BaseCommand) -> Self {
        CommandId::Named(cmd.name().to_string())
    }
}

impl From<&str> for CommandId {
    fn from(name: &str) -> Self {
        CommandId::Named(name.to_string())
    }
}

impl FromStr for CommandId {
    type Err = DispatchError;

    /// Accepts `0x`-prefixed hex, plain decimal, or a table name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let numeric = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(u8::from_str_radix(hex, 16))
        } else if s.chars().all(|c| c.is_ascii_digit()) && !s.is_empty() {
            Some(s.parse::<u8>())
        } else {
            None
        };

        match numeric {
            Some(Ok(code)) => Ok(CommandId::Numeric(code)),
            Some(Err(_)) => Err(DispatchError::UnknownCommand(s.to_string())),
            None => {
                let cmd = BaseCommand::from_name(s)
                    .ok_or_else(|| DispatchError::UnknownCommand(s.to_string()))?;
                Ok(cmd.into())
            }
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandId::Named(name) => write!(f, "{}", name.to_ascii_uppercase()),
            CommandId::Numeric(code) => match BaseCommand::from_code(*code) {
                Some(cmd) => write!(f, "{} ({:#04x})", cmd.name(), code),
                None => write!(f, "{:#04x}", code),
            },
        }
    }
}

/// Deduplicated set of target device ids, stored as the wire bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSet {
    mask: u64,
}

impl TargetSet {
    /// Build from device ids; duplicates collapse
    pub fn from_ids<I: IntoIterator<Item = u8>>(ids: I) -> Result<Self, DispatchError> {
        let mut mask = 0u64;
        for id in ids {
            if id > MAX_TARGET_ID {
                return Err(DispatchError::TargetOutOfRange(id));
            }
            mask |= 1 << id;
        }
        Ok(Self { mask })
    }

    /// Bitmask with bit `n` set for device `n`
    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// No device selected
    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Number of selected devices
    pub fn len(&self) -> usize {
        self.mask.count_ones() as usize
    }

    /// Whether device `id` is selected
    pub fn contains(&self, id: u8) -> bool {
        id <= MAX_TARGET_ID && self.mask & (1 << id) != 0
    }

    /// Device ids in ascending order
    pub fn ids(&self) -> Vec<u8> {
        (0..=MAX_TARGET_ID).filter(|id| self.contains(*id)).collect()
    }
}

impl FromStr for TargetSet {
    type Err = DispatchError;

    /// Parse a comma-separated id list such as `"0, 1,5"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut ids = Vec::new();
        for part in s.split(',').map(str::trim) {
            let id = part
                .parse::<u8>()
                .map_err(|_| DispatchError::InvalidTarget(part.to_string()))?;
            ids.push(id);
        }
        Self::from_ids(ids)
    }
}

/// A request to dispatch one timed command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Command to send
    pub command: CommandId,
    /// Time from dispatch until the device should act
    pub delay: Duration,
    /// Optional secondary lead time (sent as 0 when absent)
    pub lead_time: Option<Duration>,
    /// Target device ids
    pub targets: Vec<u8>,
    /// Auxiliary payload (color/channel data or a sub-command argument)
    pub payload: [u32; PAYLOAD_LEN],
    /// Retry budget; `None` uses the dispatcher default
    pub retries: Option<u32>,
    /// Permit an empty target set (a device-wide broadcast)
    pub allow_empty_targets: bool,
}

impl CommandRequest {
    /// Create a request with no targets, zero payload and the default retry budget
    pub fn new(command: impl Into<CommandId>, delay: Duration) -> Self {
        Self {
            command: command.into(),
            delay,
            lead_time: None,
            targets: Vec::new(),
            payload: [0; PAYLOAD_LEN],
            retries: None,
            allow_empty_targets: false,
        }
    }

    /// Create a request from a delay in seconds, rejecting negative or non-finite values
    pub fn with_delay_secs(
        command: impl Into<CommandId>,
        delay_secs: f64,
    ) -> Result<Self, DispatchError> {
        let delay = Duration::try_from_secs_f64(delay_secs)
            .map_err(|_| DispatchError::InvalidDelay(format!("{delay_secs}s")))?;
        Ok(Self::new(command, delay))
    }

    /// Add target device ids
    pub fn targets<I: IntoIterator<Item = u8>>(mut self, ids: I) -> Self {
        self.targets.extend(ids);
        self
    }

    /// Add a single target device id
    pub fn target(mut self, id: u8) -> Self {
        self.targets.push(id);
        self
    }

    /// Set the secondary lead time
    pub fn lead_time(mut self, lead: Duration) -> Self {
        self.lead_time = Some(lead);
        self
    }

    /// Set the auxiliary payload
    pub fn payload(mut self, payload: [u32; PAYLOAD_LEN]) -> Self {
        self.payload = payload;
        self
    }

    /// Override the dispatcher's default retry budget
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Accept an empty target set for this request
    pub fn allow_empty_targets(mut self) -> Self {
        self.allow_empty_targets = true;
        self
    }

    /// Deduplicated targets as a bitmask set
    pub fn target_set(&self) -> Result<TargetSet, DispatchError> {
        TargetSet::from_ids(self.targets.iter().copied())
    }
}
