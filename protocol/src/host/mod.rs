//! Host-side framing of commands.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use crate::command::Command;

pub const LINE_TERMINATOR: u8 = b'\n';

/// Bytes to send for `command`, including the line terminator where one is expected.
pub fn encode_command(command: &Command) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(16);
    encode_command_into(command, &mut buffer);
    buffer
}

pub fn encode_command_into(command: &Command, output: &mut Vec<u8>) -> usize {
    let mut text = String::new();
    // Writing into a String cannot fail.
    let _ = write!(text, "{command}");

    output.clear();
    output.extend_from_slice(text.as_bytes());
    if !command.is_immediate() {
        output.push(LINE_TERMINATOR);
    }
    output.len()
}

/// Strip line terminators and surrounding whitespace from a textual reply.
pub fn trim_response(raw: &[u8]) -> &[u8] {
    raw.trim_ascii()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ChannelKind;

    #[test]
    fn lines_are_newline_terminated() {
        assert_eq!(encode_command(&Command::SetSampleRate(5000)), b"R5000\n");
        assert_eq!(
            encode_command(&Command::SetChannel {
                kind: ChannelKind::Analog,
                channel: 1,
                enabled: true
            }),
            b"A11\n"
        );
    }

    #[test]
    fn reset_and_stop_are_bare() {
        assert_eq!(encode_command(&Command::Reset), b"*");
        assert_eq!(encode_command(&Command::Stop), b"+");
    }

    #[test]
    fn encode_into_reuses_buffer() {
        let mut buffer = Vec::new();
        encode_command_into(&Command::Identify, &mut buffer);
        let len = encode_command_into(&Command::Arm { continuous: false }, &mut buffer);
        assert_eq!(len, 2);
        assert_eq!(buffer, b"F\n");
    }

    #[test]
    fn trims_replies() {
        assert_eq!(trim_response(b"*\r\n"), b"*");
    }
}
