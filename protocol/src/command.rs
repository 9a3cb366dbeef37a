use core::fmt;
use core::str;

use crate::{ANALOG_SAMPLE_BYTES, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Analog,
    Digital,
}

impl ChannelKind {
    pub const fn as_byte(self) -> u8 {
        match self {
            ChannelKind::Analog => b'A',
            ChannelKind::Digital => b'D',
        }
    }

    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'A' => Some(ChannelKind::Analog),
            b'D' => Some(ChannelKind::Digital),
            _ => None,
        }
    }
}

/// One host-to-device command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `*`: abandon any run and return to idle.
    Reset,
    /// `+`: stop the run, or acknowledge an abort.
    Stop,
    Identify,
    SetSampleRate(u32),
    SetSampleLimit(u32),
    /// `a{n}`: query the scale of analog channel `n`.
    AnalogScale(u8),
    /// `F` (fixed sample count) or `C` (stream until stopped).
    Arm { continuous: bool },
    SetChannel {
        kind: ChannelKind,
        channel: u8,
        enabled: bool,
    },
    PinName { kind: ChannelKind, index: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    Empty,
    UnknownCommand(u8),
    MissingArgument,
    InvalidArgument,
    OutOfRange,
}

impl CommandError {
    pub const fn as_str(self) -> &'static str {
        match self {
            CommandError::Empty => "empty command",
            CommandError::UnknownCommand(_) => "unknown command",
            CommandError::MissingArgument => "missing argument",
            CommandError::InvalidArgument => "invalid argument",
            CommandError::OutOfRange => "argument out of range",
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CommandError {}

pub(crate) fn parse_decimal(digits: &[u8]) -> Result<u32, CommandError> {
    if digits.is_empty() {
        return Err(CommandError::MissingArgument);
    }
    let text = str::from_utf8(digits).map_err(|_| CommandError::InvalidArgument)?;
    text.parse::<u32>()
        .map_err(|_| CommandError::InvalidArgument)
}

fn parse_u8(digits: &[u8]) -> Result<u8, CommandError> {
    let value = parse_decimal(digits)?;
    u8::try_from(value).map_err(|_| CommandError::OutOfRange)
}

impl Command {
    /// Parse a line without its terminator.
    pub fn parse(line: &[u8]) -> Result<Self, CommandError> {
        let (&head, args) = line.split_first().ok_or(CommandError::Empty)?;

        match head {
            b'*' => Ok(Command::Reset),
            b'+' => Ok(Command::Stop),
            b'i' => Ok(Command::Identify),
            b'R' => {
                let rate = parse_decimal(args)?;
                if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
                    return Err(CommandError::OutOfRange);
                }
                Ok(Command::SetSampleRate(rate))
            }
            b'L' => match parse_decimal(args)? {
                0 => Err(CommandError::OutOfRange),
                limit => Ok(Command::SetSampleLimit(limit)),
            },
            b'a' => parse_u8(args).map(Command::AnalogScale),
            b'F' => Ok(Command::Arm { continuous: false }),
            b'C' => Ok(Command::Arm { continuous: true }),
            b'A' | b'D' => {
                let kind = match ChannelKind::from_byte(head) {
                    Some(kind) => kind,
                    None => return Err(CommandError::UnknownCommand(head)),
                };
                let (&flag, channel) = args.split_first().ok_or(CommandError::MissingArgument)?;
                let enabled = match flag {
                    b'0' => false,
                    b'1' => true,
                    _ => return Err(CommandError::InvalidArgument),
                };
                let channel = parse_u8(channel)?;
                if channel > 31 {
                    return Err(CommandError::OutOfRange);
                }
                Ok(Command::SetChannel {
                    kind,
                    channel,
                    enabled,
                })
            }
            b'n' => {
                let (&kind, index) = args.split_first().ok_or(CommandError::MissingArgument)?;
                let kind = ChannelKind::from_byte(kind).ok_or(CommandError::InvalidArgument)?;
                Ok(Command::PinName {
                    kind,
                    index: parse_u8(index)?,
                })
            }
            other => Err(CommandError::UnknownCommand(other)),
        }
    }

    /// `*` and `+` act on their own and are never line terminated.
    pub const fn is_immediate(&self) -> bool {
        matches!(self, Command::Reset | Command::Stop)
    }
}

/// Wire text of the command, without a terminator.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Command::Reset => f.write_str("*"),
            Command::Stop => f.write_str("+"),
            Command::Identify => f.write_str("i"),
            Command::SetSampleRate(rate) => write!(f, "R{rate}"),
            Command::SetSampleLimit(limit) => write!(f, "L{limit}"),
            Command::AnalogScale(channel) => write!(f, "a{channel}"),
            Command::Arm { continuous: false } => f.write_str("F"),
            Command::Arm { continuous: true } => f.write_str("C"),
            Command::SetChannel {
                kind,
                channel,
                enabled,
            } => write!(
                f,
                "{}{}{channel}",
                kind.as_byte() as char,
                u8::from(enabled)
            ),
            Command::PinName { kind, index } => write!(f, "n{}{index}", kind.as_byte() as char),
        }
    }
}

/// Reply to `i`: `SRPICO,A{analog:02}{bytes}D{digital:02},{version:02}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub analog_channels: u8,
    pub analog_bytes: u8,
    pub digital_channels: u8,
    pub version: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityError {
    BadPrefix,
    Malformed,
    UnsupportedAnalogWidth(u8),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::BadPrefix => f.write_str("not an SRPICO device"),
            IdentityError::Malformed => f.write_str("malformed identify string"),
            IdentityError::UnsupportedAnalogWidth(width) => {
                write!(f, "unsupported analog sample width {width}")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for IdentityError {}

impl Identity {
    pub const PREFIX: &'static str = "SRPICO,";

    pub const fn new(analog_channels: u8, digital_channels: u8, version: u8) -> Self {
        Self {
            analog_channels,
            analog_bytes: ANALOG_SAMPLE_BYTES,
            digital_channels,
            version,
        }
    }

    pub fn parse(text: &str) -> Result<Self, IdentityError> {
        let body = text
            .trim()
            .strip_prefix(Self::PREFIX)
            .ok_or(IdentityError::BadPrefix)?;
        let bytes = body.as_bytes();
        // A aa b D dd , vv
        if bytes.len() != 10 || bytes[0] != b'A' || bytes[4] != b'D' || bytes[7] != b',' {
            return Err(IdentityError::Malformed);
        }

        let number = |range: core::ops::Range<usize>| -> Result<u8, IdentityError> {
            parse_decimal(&bytes[range])
                .ok()
                .and_then(|v| u8::try_from(v).ok())
                .ok_or(IdentityError::Malformed)
        };

        let identity = Self {
            analog_channels: number(1..3)?,
            analog_bytes: number(3..4)?,
            digital_channels: number(5..7)?,
            version: number(8..10)?,
        };
        if identity.analog_bytes != ANALOG_SAMPLE_BYTES {
            return Err(IdentityError::UnsupportedAnalogWidth(identity.analog_bytes));
        }
        Ok(identity)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}A{:02}{}D{:02},{:02}",
            Self::PREFIX,
            self.analog_channels,
            self.analog_bytes,
            self.digital_channels,
            self.version
        )
    }
}

/// Reply to `a{n}`: integer microvolts per 7-bit code and offset, as `{scale}x{offset}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalogScale {
    pub microvolts_per_code: u32,
    pub offset_microvolts: i32,
}

impl AnalogScale {
    /// 3.3 V across 7 bits.
    pub const DEFAULT: Self = Self {
        microvolts_per_code: 25_700,
        offset_microvolts: 0,
    };

    pub fn parse(text: &str) -> Option<Self> {
        let (scale, offset) = text.trim().split_once('x')?;
        Some(Self {
            microvolts_per_code: scale.parse().ok()?,
            offset_microvolts: offset.parse().ok()?,
        })
    }

    pub fn volts(&self, code: u8) -> f32 {
        (f64::from(code) * f64::from(self.microvolts_per_code) + f64::from(self.offset_microvolts))
            as f32
            / 1_000_000.0
    }
}

impl Default for AnalogScale {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for AnalogScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.microvolts_per_code, self.offset_microvolts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_command() {
        assert_eq!(Command::parse(b"*"), Ok(Command::Reset));
        assert_eq!(Command::parse(b"i"), Ok(Command::Identify));
        assert_eq!(Command::parse(b"R5000"), Ok(Command::SetSampleRate(5000)));
        assert_eq!(Command::parse(b"L16"), Ok(Command::SetSampleLimit(16)));
        assert_eq!(Command::parse(b"a2"), Ok(Command::AnalogScale(2)));
        assert_eq!(Command::parse(b"F"), Ok(Command::Arm { continuous: false }));
        assert_eq!(Command::parse(b"C"), Ok(Command::Arm { continuous: true }));
        assert_eq!(
            Command::parse(b"D117"),
            Ok(Command::SetChannel {
                kind: ChannelKind::Digital,
                channel: 17,
                enabled: true
            })
        );
        assert_eq!(
            Command::parse(b"A00"),
            Ok(Command::SetChannel {
                kind: ChannelKind::Analog,
                channel: 0,
                enabled: false
            })
        );
        assert_eq!(
            Command::parse(b"nA1"),
            Ok(Command::PinName {
                kind: ChannelKind::Analog,
                index: 1
            })
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        assert_eq!(Command::parse(b""), Err(CommandError::Empty));
        assert_eq!(Command::parse(b"R4999"), Err(CommandError::OutOfRange));
        assert_eq!(Command::parse(b"R120000017"), Err(CommandError::OutOfRange));
        assert_eq!(Command::parse(b"L0"), Err(CommandError::OutOfRange));
        assert_eq!(Command::parse(b"Lx"), Err(CommandError::InvalidArgument));
        assert_eq!(Command::parse(b"D2"), Err(CommandError::InvalidArgument));
        assert_eq!(Command::parse(b"D132"), Err(CommandError::OutOfRange));
        assert_eq!(Command::parse(b"nX1"), Err(CommandError::InvalidArgument));
        assert_eq!(Command::parse(b"t"), Err(CommandError::UnknownCommand(b't')));
    }

    #[test]
    fn display_matches_parse() {
        for command in [
            Command::SetSampleRate(120_000_000),
            Command::SetSampleLimit(1000),
            Command::SetChannel {
                kind: ChannelKind::Digital,
                channel: 20,
                enabled: true,
            },
            Command::PinName {
                kind: ChannelKind::Digital,
                index: 3,
            },
            Command::Arm { continuous: true },
        ] {
            let text = std::format!("{command}");
            assert_eq!(Command::parse(text.as_bytes()), Ok(command));
        }
    }

    #[test]
    fn identity_string() {
        let identity = Identity::new(3, 21, 2);
        let text = std::format!("{identity}");
        assert_eq!(text, "SRPICO,A031D21,02");
        assert_eq!(Identity::parse(&text), Ok(identity));
        assert_eq!(Identity::parse("SRPICO,A001D32,02\r\n").unwrap().digital_channels, 32);
    }

    #[test]
    fn identity_rejects_other_devices() {
        assert_eq!(Identity::parse("SiTerm v1.0"), Err(IdentityError::BadPrefix));
        assert_eq!(Identity::parse("SRPICO,A03"), Err(IdentityError::Malformed));
        assert_eq!(
            Identity::parse("SRPICO,A032D21,02"),
            Err(IdentityError::UnsupportedAnalogWidth(2))
        );
    }

    #[test]
    fn analog_scale_text() {
        let scale = AnalogScale::parse("25700x0").unwrap();
        assert_eq!(scale, AnalogScale::DEFAULT);
        assert_eq!(std::format!("{scale}"), "25700x0");
        assert!((scale.volts(127) - 3.2639).abs() < 1e-3);
        assert_eq!(AnalogScale::parse("25700,0"), None);
    }
}
