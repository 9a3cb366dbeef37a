//! Byte values of the device-to-host stream.
//!
//! `0x80..=0xFF` carry samples. Bytes `48..=127` are run lengths whose weight
//! depends on the encoding mode. Anything below 48 ends the run: `$` opens the
//! `$<byte_count>+` trailer, every other value (normally `!`) is an abort.

use core::fmt::Write;

use heapless::String;

/// Set on every byte that carries sample bits.
pub const DATA_FLAG: u8 = 0x80;

pub const ABORT_MARKER: u8 = b'!';
pub const ABORT_SEQUENCE: &[u8] = b"!!!";
pub const TRAILER_START: u8 = b'$';
pub const TRAILER_END: u8 = b'+';

/// Host to device: stop the run or acknowledge an abort. Sent without a line terminator.
pub const STOP: u8 = b'+';
/// Host to device: reset to idle. Sent without a line terminator.
pub const RESET: u8 = b'*';
/// Default acknowledgement of an accepted command.
pub const ACK: &[u8] = b"*";

/// Lowest run byte; everything below it is a control byte.
pub const RUN_BYTE_MIN: u8 = 48;
/// Largest run byte, used on its own to flush one full chunk.
pub const RUN_CHUNK_BYTE: u8 = 127;

/// D4 run bytes count multiples of eight samples.
pub const D4_RUN_UNIT: u32 = 8;
pub const D4_RUN_BASE: u8 = 47;
pub const D4_RUN_CHUNK: u32 = 640;
/// Longest run a D4 sample byte can carry in bits 6..4.
pub const D4_EMBEDDED_RUN_MAX: u32 = 7;

/// Wide runs of 1..=32 are single steps; longer runs count in units of 32.
pub const WIDE_SHORT_RUN_MAX: u32 = 32;
pub const WIDE_SHORT_RUN_BASE: u8 = 47;
pub const WIDE_LONG_RUN_BASE: u8 = 78;
pub const WIDE_LONG_RUN_UNIT: u32 = 32;
pub const WIDE_RUN_CHUNK: u32 = 1568;

/// Transmit buffer capacity of the encoder.
pub const TX_BUFFER_SIZE: usize = 260;
/// Flush threshold for the wide and analog encoders.
pub const FLUSH_THRESHOLD: usize = 20;
/// Flush threshold for the D4 encoder.
pub const D4_FLUSH_THRESHOLD: usize = 64;
/// While a D4 run keeps producing chunk bytes, flush as soon as this many are queued.
pub const D4_CHUNK_FLUSH_THRESHOLD: usize = 3;

pub const fn is_data(byte: u8) -> bool {
    byte & DATA_FLAG != 0
}

pub const fn is_run(byte: u8) -> bool {
    byte >= RUN_BYTE_MIN && byte < DATA_FLAG
}

/// Samples represented by a D4 run byte.
pub const fn d4_run_length(byte: u8) -> u32 {
    (byte - D4_RUN_BASE) as u32 * D4_RUN_UNIT
}

/// Samples represented by a wide-mode run byte.
pub const fn wide_run_length(byte: u8) -> u32 {
    if byte <= WIDE_SHORT_RUN_BASE + WIDE_SHORT_RUN_MAX as u8 {
        (byte - WIDE_SHORT_RUN_BASE) as u32
    } else {
        (byte - WIDE_LONG_RUN_BASE) as u32 * WIDE_LONG_RUN_UNIT
    }
}

/// Longest trailer: `$` + ten digits + `+`.
pub const TRAILER_MAX_LEN: usize = 12;

pub fn format_trailer(byte_count: u32) -> String<TRAILER_MAX_LEN> {
    let mut out = String::new();
    // Cannot overflow: a u32 has at most ten digits.
    let _ = write!(out, "${byte_count}+");
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trailer {
    /// More bytes are needed before the closing `+`.
    Incomplete,
    Complete { byte_count: u32, len: usize },
    Malformed,
}

/// Parse `$<digits>+` at the start of `bytes`.
pub fn parse_trailer(bytes: &[u8]) -> Trailer {
    match bytes.first() {
        None => return Trailer::Incomplete,
        Some(&TRAILER_START) => {}
        Some(_) => return Trailer::Malformed,
    }

    let mut count: u32 = 0;
    for (idx, &byte) in bytes.iter().enumerate().skip(1) {
        match byte {
            b'0'..=b'9' => {
                count = match count
                    .checked_mul(10)
                    .and_then(|c| c.checked_add(u32::from(byte - b'0')))
                {
                    Some(c) => c,
                    None => return Trailer::Malformed,
                };
            }
            TRAILER_END if idx > 1 => {
                return Trailer::Complete {
                    byte_count: count,
                    len: idx + 1,
                };
            }
            _ => return Trailer::Malformed,
        }
        if idx >= TRAILER_MAX_LEN {
            return Trailer::Malformed;
        }
    }
    Trailer::Incomplete
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_byte_weights() {
        assert_eq!(d4_run_length(48), 8);
        assert_eq!(d4_run_length(RUN_CHUNK_BYTE), D4_RUN_CHUNK);
        assert_eq!(wide_run_length(48), 1);
        assert_eq!(wide_run_length(79), 32);
        assert_eq!(wide_run_length(80), 64);
        assert_eq!(wide_run_length(RUN_CHUNK_BYTE), WIDE_RUN_CHUNK);
    }

    #[test]
    fn byte_classes_do_not_overlap() {
        assert!(is_data(0x80));
        assert!(!is_run(0x80));
        assert!(is_run(48));
        assert!(!is_run(TRAILER_START));
        assert!(!is_run(ABORT_MARKER));
    }

    #[test]
    fn trailer_roundtrip() {
        let text = format_trailer(4096);
        assert_eq!(text.as_str(), "$4096+");
        assert_eq!(
            parse_trailer(text.as_bytes()),
            Trailer::Complete {
                byte_count: 4096,
                len: 6
            }
        );
    }

    #[test]
    fn trailer_needs_closing_plus() {
        assert_eq!(parse_trailer(b"$12"), Trailer::Incomplete);
        assert_eq!(parse_trailer(b""), Trailer::Incomplete);
        assert_eq!(parse_trailer(b"$+"), Trailer::Malformed);
        assert_eq!(parse_trailer(b"#12+"), Trailer::Malformed);
        assert_eq!(parse_trailer(b"$1x+"), Trailer::Malformed);
    }
}
