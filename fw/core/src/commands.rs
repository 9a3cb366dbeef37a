use core::fmt::Write;

use heapless::{String, Vec};
use srpico_protocol::{
    AnalogScale, ChannelKind, Command, CommandError, Identity, PinMode, COMMAND_BUFFER_SIZE,
    PROTOCOL_VERSION,
};

use crate::shared::SharedState;

pub const RESPONSE_SIZE: usize = 24;

pub type Response = String<RESPONSE_SIZE>;

/// Line-buffers host bytes and applies complete commands to [`SharedState`].
pub struct CommandProcessor {
    pin_mode: PinMode,
    line: Vec<u8, COMMAND_BUFFER_SIZE>,
}

impl CommandProcessor {
    pub const fn new(pin_mode: PinMode) -> Self {
        Self {
            pin_mode,
            line: Vec::new(),
        }
    }

    /// Consume one byte from the host; returns the reply to send, if any.
    pub fn feed(&mut self, byte: u8, shared: &SharedState) -> Option<Response> {
        match byte {
            b'+' => {
                shared.request_stop();
                None
            }
            b'*' => {
                self.line.clear();
                shared.request_reset();
                None
            }
            b'\r' | b'\n' => {
                if self.line.is_empty() {
                    return None;
                }
                let response = match Command::parse(&self.line) {
                    Ok(command) => self.execute(command, shared),
                    Err(err) => {
                        self.reject(err);
                        None
                    }
                };
                self.line.clear();
                response
            }
            _ => {
                if self.line.push(byte).is_err() {
                    log::warn!("command longer than {} bytes discarded", COMMAND_BUFFER_SIZE);
                    self.line.clear();
                }
                None
            }
        }
    }

    fn reject(&self, err: CommandError) {
        match err {
            CommandError::UnknownCommand(head) => {
                log::warn!("unknown command {:?}", head as char)
            }
            other => log::warn!("rejected command: {}", other.as_str()),
        }
    }

    fn execute(&mut self, command: Command, shared: &SharedState) -> Option<Response> {
        match command {
            Command::Reset => {
                shared.request_reset();
                None
            }
            Command::Stop => {
                shared.request_stop();
                None
            }
            Command::Identify => {
                let identity = Identity::new(
                    self.pin_mode.analog_channels(),
                    self.pin_mode.digital_channels(),
                    PROTOCOL_VERSION,
                );
                format_response(format_args!("{identity}"))
            }
            Command::SetSampleRate(rate) => {
                shared.set_sample_rate(rate);
                ack()
            }
            Command::SetSampleLimit(limit) => {
                shared.set_sample_limit(limit);
                ack()
            }
            Command::AnalogScale(channel) => {
                if channel >= self.pin_mode.analog_channels() {
                    self.reject(CommandError::OutOfRange);
                    return None;
                }
                format_response(format_args!("{}", AnalogScale::DEFAULT))
            }
            Command::Arm { continuous } => {
                shared.set_continuous(continuous);
                shared.request_arm();
                None
            }
            Command::SetChannel {
                kind,
                channel,
                enabled,
            } => {
                if channel >= self.channel_count(kind) {
                    self.reject(CommandError::OutOfRange);
                    return None;
                }
                shared.set_channel(kind, channel, enabled);
                ack()
            }
            Command::PinName { kind, index } => match kind {
                ChannelKind::Digital => self
                    .pin_mode
                    .digital_gpio(index)
                    .and_then(|gpio| format_response(format_args!("GP{gpio}"))),
                ChannelKind::Analog => self
                    .pin_mode
                    .analog_gpio(index)
                    .and_then(|gpio| format_response(format_args!("ADC{index}_GP{gpio}"))),
            },
        }
    }

    fn channel_count(&self, kind: ChannelKind) -> u8 {
        match kind {
            ChannelKind::Analog => self.pin_mode.analog_channels(),
            ChannelKind::Digital => self.pin_mode.digital_channels(),
        }
    }
}

fn ack() -> Option<Response> {
    format_response(format_args!("*"))
}

fn format_response(args: core::fmt::Arguments<'_>) -> Option<Response> {
    let mut response = Response::new();
    response.write_fmt(args).ok()?;
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(processor: &mut CommandProcessor, shared: &SharedState, text: &str) -> Option<Response> {
        let mut last = None;
        for &byte in text.as_bytes() {
            if let Some(response) = processor.feed(byte, shared) {
                last = Some(response);
            }
        }
        last
    }

    #[test]
    fn identify_reports_pin_mode() {
        let shared = SharedState::new();
        let mut base = CommandProcessor::new(PinMode::Base);
        assert_eq!(send(&mut base, &shared, "i\n").unwrap(), "SRPICO,A031D21,02");

        let mut dig32 = CommandProcessor::new(PinMode::Dig32);
        assert_eq!(send(&mut dig32, &shared, "i\r").unwrap(), "SRPICO,A001D32,02");
    }

    #[test]
    fn configuration_commands_ack_and_apply() {
        let shared = SharedState::new();
        let mut processor = CommandProcessor::new(PinMode::Base);
        assert_eq!(send(&mut processor, &shared, "R200000\n").unwrap(), "*");
        assert_eq!(send(&mut processor, &shared, "L4000\n").unwrap(), "*");
        assert_eq!(send(&mut processor, &shared, "D10\n").unwrap(), "*");
        assert_eq!(send(&mut processor, &shared, "D11\n").unwrap(), "*");
        assert_eq!(send(&mut processor, &shared, "A10\n").unwrap(), "*");

        let config = shared.snapshot();
        assert_eq!(config.sample_rate, 200_000);
        assert_eq!(config.sample_limit, 4000);
        assert_eq!(config.digital_mask, 0b11);
        assert_eq!(config.analog_mask, 0b1);
    }

    #[test]
    fn invalid_commands_get_no_reply() {
        let shared = SharedState::new();
        let mut processor = CommandProcessor::new(PinMode::Base);
        assert_eq!(send(&mut processor, &shared, "R10\n"), None);
        assert_eq!(send(&mut processor, &shared, "D121\n"), None);
        assert_eq!(send(&mut processor, &shared, "A13\n"), None);
        assert_eq!(send(&mut processor, &shared, "x\n"), None);
        assert_eq!(shared.snapshot().sample_rate, srpico_protocol::DEFAULT_SAMPLE_RATE);
        assert_eq!(shared.snapshot().digital_mask, 0);
    }

    #[test]
    fn arm_has_no_reply_but_raises_request() {
        let shared = SharedState::new();
        let mut processor = CommandProcessor::new(PinMode::Base);
        assert_eq!(send(&mut processor, &shared, "C\n"), None);
        assert_eq!(shared.arm_requests(), 1);
        assert!(shared.snapshot().continuous);
        send(&mut processor, &shared, "F\n");
        assert!(!shared.snapshot().continuous);
    }

    #[test]
    fn pin_names() {
        let shared = SharedState::new();
        let mut base = CommandProcessor::new(PinMode::Base);
        assert_eq!(send(&mut base, &shared, "nD0\n").unwrap(), "GP2");
        assert_eq!(send(&mut base, &shared, "nA2\n").unwrap(), "ADC2_GP28");
        assert_eq!(send(&mut base, &shared, "nD21\n"), None);

        let mut dig26 = CommandProcessor::new(PinMode::Dig26);
        assert_eq!(send(&mut dig26, &shared, "nD25\n").unwrap(), "GP28");
        assert_eq!(send(&mut dig26, &shared, "nA0\n"), None);
    }

    #[test]
    fn analog_scale_query() {
        let shared = SharedState::new();
        let mut processor = CommandProcessor::new(PinMode::Base);
        assert_eq!(send(&mut processor, &shared, "a1\n").unwrap(), "25700x0");
        assert_eq!(send(&mut processor, &shared, "a3\n"), None);
    }

    #[test]
    fn stop_and_reset_act_immediately() {
        let shared = SharedState::new();
        let mut processor = CommandProcessor::new(PinMode::Base);
        processor.feed(b'+', &shared);
        assert_eq!(shared.stop_requests(), 1);

        // A reset in the middle of a line throws the partial line away.
        assert_eq!(send(&mut processor, &shared, "R50*i\n").unwrap(), "SRPICO,A031D21,02");
        assert_eq!(shared.reset_requests(), 1);
        assert_eq!(shared.snapshot().sample_rate, srpico_protocol::DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn overlong_line_is_discarded() {
        let shared = SharedState::new();
        let mut processor = CommandProcessor::new(PinMode::Base);
        assert_eq!(send(&mut processor, &shared, "R1234567890123456789012\n"), None);
        assert_eq!(send(&mut processor, &shared, "L20\n").unwrap(), "*");
    }
}
