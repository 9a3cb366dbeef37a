use srpico_protocol::{ConfigError, IdentityError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("identify reply rejected: {0}")]
    Identity(#[from] IdentityError),

    #[error("channel configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("{requested} {kind} channels requested, device has {available}")]
    TooManyChannels {
        kind: &'static str,
        requested: u8,
        available: u8,
    },

    #[error("invalid trigger `{0}`")]
    TriggerSpec(String),

    #[error("a trigger needs at least one digital channel")]
    TriggerWithoutDigital,

    #[error("pre-trigger ratio {0}% is above 100%")]
    PretriggerRatio(u8),

    #[error("no acknowledgement for `{command}` (got {reply:?})")]
    NoAck { command: String, reply: String },

    #[error("unparseable analog scale {0:?}")]
    AnalogScale(String),

    #[error("unexpected byte {0:#04x} in sample stream")]
    Desync(u8),

    #[error("device aborted the run")]
    Aborted,

    #[error("malformed end-of-run trailer")]
    MalformedTrailer,
}

pub type HostResult<T> = Result<T, HostError>;
