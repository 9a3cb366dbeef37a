//! Turning user capture settings into the command sequence that arms a run.

use serde::{Deserialize, Serialize};
use srpico_protocol::{
    AnalogScale, ChannelConfig, ChannelKind, Command, Identity, PinMode, SliceFormat,
};
use tracing::info;

use crate::error::{HostError, HostResult};
use crate::rate::negotiate_sample_rate;
use crate::receiver::Receiver;
use crate::stage::{pretrig_entries, TriggerStage};
use crate::trigger::{PatternTrigger, TriggerMatcher};

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub digital_channels: u8,
    pub analog_channels: u8,
    pub sample_rate: u32,
    pub sample_limit: u32,
    /// Percentage of `sample_limit` kept from before the trigger.
    pub pretrigger_ratio: u8,
    /// Stream until stopped instead of ending at `sample_limit`.
    pub continuous: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            digital_channels: 8,
            analog_channels: 0,
            sample_rate: 1_000_000,
            sample_limit: 1_000,
            pretrigger_ratio: 10,
            continuous: false,
        }
    }
}

/// Pin mode implied by the channel counts a device reports.
pub fn pin_mode_for(identity: &Identity) -> PinMode {
    match (identity.analog_channels, identity.digital_channels) {
        (0, 32) => PinMode::Dig32,
        (0, _) => PinMode::Dig26,
        _ => PinMode::Base,
    }
}

/// A validated run, ready to be sent to a specific device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSetup {
    pub identity: Identity,
    pub config: ChannelConfig,
    pub format: SliceFormat,
    pub trigger: Option<PatternTrigger>,
    pub pretrig_entries: usize,
}

impl CaptureSettings {
    pub fn validate(
        &self,
        identity: &Identity,
        trigger: Option<PatternTrigger>,
    ) -> HostResult<CaptureSetup> {
        if self.digital_channels > identity.digital_channels {
            return Err(HostError::TooManyChannels {
                kind: "digital",
                requested: self.digital_channels,
                available: identity.digital_channels,
            });
        }
        if self.analog_channels > identity.analog_channels {
            return Err(HostError::TooManyChannels {
                kind: "analog",
                requested: self.analog_channels,
                available: identity.analog_channels,
            });
        }
        if self.pretrigger_ratio > 100 {
            return Err(HostError::PretriggerRatio(self.pretrigger_ratio));
        }
        if let Some(trigger) = &trigger {
            if self.digital_channels == 0 {
                return Err(HostError::TriggerWithoutDigital);
            }
            if trigger.highest_channel() >= self.digital_channels {
                return Err(HostError::TriggerSpec(trigger.to_string()));
            }
        }

        let config = ChannelConfig {
            digital_mask: low_bits(self.digital_channels),
            analog_mask: low_bits(self.analog_channels) as u8,
            sample_rate: negotiate_sample_rate(self.sample_rate, self.analog_channels),
            sample_limit: self.sample_limit.max(1),
            // A software trigger needs the device streaming until the host stops it.
            continuous: self.continuous || trigger.is_some(),
        };
        let format = config.slice_format(pin_mode_for(identity))?;
        let entries = match trigger {
            Some(_) => pretrig_entries(self.pretrigger_ratio, u64::from(config.sample_limit)),
            None => 0,
        };
        info!(
            rate = config.sample_rate,
            limit = config.sample_limit,
            digital = self.digital_channels,
            analog = self.analog_channels,
            mode = ?format.mode,
            "capture configured"
        );

        Ok(CaptureSetup {
            identity: *identity,
            config,
            format,
            trigger,
            pretrig_entries: entries,
        })
    }
}

fn low_bits(count: u8) -> u32 {
    match count {
        0 => 0,
        32..=u8::MAX => u32::MAX,
        n => (1u32 << n) - 1,
    }
}

impl CaptureSetup {
    /// Commands answered with `*`, in the order they are sent: every channel the
    /// device has is explicitly enabled or disabled, then rate and limit.
    pub fn configure_commands(&self) -> Vec<Command> {
        let mut commands = Vec::new();
        for channel in 0..self.identity.analog_channels {
            commands.push(Command::SetChannel {
                kind: ChannelKind::Analog,
                channel,
                enabled: self.config.analog_mask & (1 << channel) != 0,
            });
        }
        for channel in 0..self.identity.digital_channels {
            commands.push(Command::SetChannel {
                kind: ChannelKind::Digital,
                channel,
                enabled: self.config.digital_mask & (1 << channel) != 0,
            });
        }
        commands.push(Command::SetSampleRate(self.config.sample_rate));
        commands.push(Command::SetSampleLimit(self.config.sample_limit));
        commands
    }

    /// Queries whose replies are parsed with [`AnalogScale::parse`].
    pub fn scale_queries(&self) -> Vec<Command> {
        (0..self.format.analog_count)
            .map(Command::AnalogScale)
            .collect()
    }

    pub fn arm_command(&self) -> Command {
        Command::Arm {
            continuous: self.config.continuous,
        }
    }

    /// Samples the host forwards before ending the run.
    pub fn host_limit(&self) -> u64 {
        if self.config.continuous && self.trigger.is_none() {
            u64::MAX
        } else {
            u64::from(self.config.sample_limit)
        }
    }

    pub fn receiver(&self, scales: Vec<AnalogScale>) -> Receiver<PatternTrigger> {
        let stage = match &self.trigger {
            Some(trigger) => TriggerStage::triggered(
                trigger.clone(),
                self.host_limit(),
                self.pretrig_entries,
                self.format.analog_count as usize,
            ),
            None => TriggerStage::immediate(self.host_limit()),
        };
        Receiver::new(self.format, stage, scales)
    }

    /// Receiver with a caller-supplied matcher.
    pub fn receiver_with<M: TriggerMatcher>(
        &self,
        matcher: M,
        scales: Vec<AnalogScale>,
    ) -> Receiver<M> {
        let stage = TriggerStage::triggered(
            matcher,
            u64::from(self.config.sample_limit),
            self.pretrig_entries,
            self.format.analog_count as usize,
        );
        Receiver::new(self.format, stage, scales)
    }
}

/// Parse an `a{n}` reply, naming the reply on failure.
pub fn parse_scale(reply: &str) -> HostResult<AnalogScale> {
    AnalogScale::parse(reply).ok_or_else(|| HostError::AnalogScale(reply.to_owned()))
}
