use crate::MAX_ANALOG_CHANNELS;
use crate::channels::{EncodingMode, SliceFormat};
use crate::wire::{self, DATA_FLAG, TRAILER_START};

/// Receives decoded slices in stream order.
pub trait SliceSink {
    /// A new slice: the digital word and one 7-bit code per enabled analog channel.
    fn slice(&mut self, digital: u32, analog: &[u8]);

    /// `count` more copies of the most recent slice.
    fn repeat(&mut self, count: u32);
}

/// Why a decode pass stopped before the end of its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// `$` seen: the byte-count trailer starts at `Decoded::consumed`.
    Trailer,
    /// Any other non-data byte, normally the `!` abort marker.
    Abort(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Bytes accepted as sample or run data.
    ///
    /// Without an `end`, input past this offset is an incomplete slice and must be
    /// offered again, prefixed to the next read.
    pub consumed: usize,
    pub end: Option<StreamEnd>,
}

/// Inverse of [`crate::SliceEncoder`] for one run.
pub struct SliceDecoder {
    format: SliceFormat,
    run: u32,
    primed: bool,
}

impl SliceDecoder {
    pub const fn new(format: SliceFormat) -> Self {
        Self {
            format,
            run: 0,
            primed: false,
        }
    }

    pub const fn format(&self) -> &SliceFormat {
        &self.format
    }

    pub fn decode<S: SliceSink>(&mut self, input: &[u8], sink: &mut S) -> Decoded {
        let decoded = match self.format.mode {
            EncodingMode::D4 => self.decode_d4(input, sink),
            EncodingMode::Wide | EncodingMode::Analog => self.decode_slices(input, sink),
        };
        self.flush_run(sink);
        decoded
    }

    fn flush_run<S: SliceSink>(&mut self, sink: &mut S) {
        if self.run == 0 {
            return;
        }
        let mut count = self.run;
        self.run = 0;
        if !self.primed {
            // A run before any sample repeats the all-low slice.
            sink.slice(0, &[0; MAX_ANALOG_CHANNELS][..self.format.analog_count as usize]);
            self.primed = true;
            count -= 1;
        }
        if count > 0 {
            sink.repeat(count);
        }
    }

    fn emit<S: SliceSink>(&mut self, digital: u32, analog: &[u8], sink: &mut S) {
        self.flush_run(sink);
        sink.slice(digital, analog);
        self.primed = true;
    }

    fn decode_d4<S: SliceSink>(&mut self, input: &[u8], sink: &mut S) -> Decoded {
        for (idx, &byte) in input.iter().enumerate() {
            if wire::is_data(byte) {
                self.run += u32::from((byte >> 4) & 0x7);
                self.emit(u32::from(byte & 0xF) & self.format.digital_mask, &[], sink);
            } else if wire::is_run(byte) {
                self.run += wire::d4_run_length(byte);
            } else {
                return Decoded {
                    consumed: idx,
                    end: Some(end_for(byte)),
                };
            }
        }
        Decoded {
            consumed: input.len(),
            end: None,
        }
    }

    fn decode_slices<S: SliceSink>(&mut self, input: &[u8], sink: &mut S) -> Decoded {
        let fields = self.format.digital_fields as usize;
        let analog = self.format.analog_count as usize;
        let width = self.format.wire_slice_bytes();
        let allow_runs = self.format.mode == EncodingMode::Wide;

        let mut idx = 0;
        while idx < input.len() {
            let byte = input[idx];

            if wire::is_run(byte) && allow_runs {
                self.run += wire::wide_run_length(byte);
                idx += 1;
                continue;
            }
            if !wire::is_data(byte) {
                return Decoded {
                    consumed: idx,
                    end: Some(end_for(byte)),
                };
            }
            if idx + width > input.len() {
                break;
            }

            let slice = &input[idx..idx + width];
            if let Some(pos) = slice.iter().position(|&b| !wire::is_data(b)) {
                // A control byte inside a slice means bytes were lost.
                return Decoded {
                    consumed: idx + pos,
                    end: Some(StreamEnd::Abort(slice[pos])),
                };
            }

            let mut digital: u64 = 0;
            for (field, &b) in slice[..fields].iter().enumerate() {
                digital |= u64::from(b & !DATA_FLAG) << (7 * field);
            }
            let mut codes = [0u8; MAX_ANALOG_CHANNELS];
            for (code, &b) in codes.iter_mut().zip(&slice[fields..]) {
                *code = b & !DATA_FLAG;
            }

            self.emit(digital as u32, &codes[..analog], sink);
            idx += width;
        }

        Decoded {
            consumed: idx,
            end: None,
        }
    }
}

fn end_for(byte: u8) -> StreamEnd {
    if byte == TRAILER_START {
        StreamEnd::Trailer
    } else {
        StreamEnd::Abort(byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelConfig, PinMode};
    use crate::encoder::{ByteSink, HalfBuffer, SliceEncoder};
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Slices {
        digital: Vec<u32>,
        analog: Vec<Vec<u8>>,
    }

    impl SliceSink for Slices {
        fn slice(&mut self, digital: u32, analog: &[u8]) {
            self.digital.push(digital);
            self.analog.push(analog.to_vec());
        }

        fn repeat(&mut self, count: u32) {
            let digital = *self.digital.last().unwrap();
            let analog = self.analog.last().unwrap().clone();
            for _ in 0..count {
                self.digital.push(digital);
                self.analog.push(analog.clone());
            }
        }
    }

    impl ByteSink for Vec<u8> {
        fn send(&mut self, bytes: &[u8]) {
            self.extend_from_slice(bytes);
        }
    }

    fn format(digital_mask: u32, analog_mask: u8, pin_mode: PinMode) -> SliceFormat {
        ChannelConfig {
            digital_mask,
            analog_mask,
            ..ChannelConfig::default()
        }
        .slice_format(pin_mode)
        .unwrap()
    }

    /// Lay samples out the way the capture hardware writes them.
    fn raw_half(format: &SliceFormat, digital: &[u32], analog: &[Vec<u8>]) -> (Vec<u8>, Vec<u8>) {
        let mut dig = Vec::new();
        match format.read_width() {
            None => {}
            Some(crate::ReadWidth::Nibble) => {
                for pair in digital.chunks(2) {
                    let hi = pair.get(1).copied().unwrap_or(0);
                    dig.push((pair[0] as u8 & 0xF) | ((hi as u8 & 0xF) << 4));
                }
            }
            Some(crate::ReadWidth::Byte) => dig.extend(digital.iter().map(|&v| v as u8)),
            Some(crate::ReadWidth::Half) => {
                for &v in digital {
                    dig.extend_from_slice(&(v as u16).to_le_bytes());
                }
            }
            Some(crate::ReadWidth::Word) => {
                for &v in digital {
                    dig.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
        let ana = analog.iter().flatten().copied().collect();
        (dig, ana)
    }

    fn roundtrip(format: SliceFormat, digital: &[u32], analog: &[Vec<u8>]) -> Slices {
        let samples = digital.len().max(analog.len());
        let (dig, ana) = raw_half(&format, digital, analog);
        let mut wire = Vec::new();
        let mut encoder = SliceEncoder::new(format);
        encoder.encode_half(&HalfBuffer::new(&dig, &ana), samples, &mut wire);

        let mut out = Slices::default();
        let mut decoder = SliceDecoder::new(format);
        let decoded = decoder.decode(&wire, &mut out);
        assert_eq!(decoded.consumed, wire.len());
        assert_eq!(decoded.end, None);
        out
    }

    #[test]
    fn d4_scenario_reproduces_samples() {
        let format = format(0xF, 0, PinMode::Base);
        let digital = [1, 1, 1, 1, 1, 1, 1, 1, 2];
        let out = roundtrip(format, &digital, &[]);
        assert_eq!(out.digital, digital.to_vec());
    }

    #[test]
    fn d4_drops_bits_of_disabled_pins() {
        let format = format(0x3, 0, PinMode::Base);
        let mut out = Slices::default();
        let mut decoder = SliceDecoder::new(format);
        decoder.decode(&[0x8D, 0x86, 0xBF], &mut out);
        assert_eq!(out.digital, vec![1, 2, 2, 2, 2, 3]);
    }

    #[test]
    fn d4_roundtrip_mixed_runs() {
        let format = format(0xF, 0, PinMode::Base);
        let mut digital = Vec::new();
        for (value, len) in [(0u32, 1), (15, 700), (3, 7), (4, 1), (4, 9), (0, 1290), (9, 3)] {
            digital.extend(std::iter::repeat_n(value, len));
        }
        let alternating: Vec<u32> = (0..64).map(|i| i % 2 * 15).collect();
        digital.extend(alternating);

        let out = roundtrip(format, &digital, &[]);
        assert_eq!(out.digital, digital);
    }

    #[test]
    fn wide_roundtrip_every_width() {
        for (mask, pin_mode) in [
            (0x1Fu32, PinMode::Base),
            (0xFFF, PinMode::Base),
            (0x1F_FFFF, PinMode::Base),
            (u32::MAX, PinMode::Dig32),
        ] {
            let format = format(mask, 0, pin_mode);
            let mut digital = vec![0u32, mask, mask, 0];
            digital.extend(std::iter::repeat_n(mask, 3000));
            digital.extend((0..50).map(|i| if i % 2 == 0 { 0 } else { mask }));
            digital.extend(std::iter::repeat_n(1, 33));
            digital.extend(std::iter::repeat_n(2, 64));

            let out = roundtrip(format, &digital, &[]);
            assert_eq!(out.digital, digital, "mask {mask:#x}");
        }
    }

    #[test]
    fn analog_roundtrip_yields_7bit_codes() {
        let format = format(0x7F, 0x7, PinMode::Base);
        let digital: Vec<u32> = (0..40).map(|i| i % 0x80).collect();
        let analog: Vec<Vec<u8>> = (0..40u32)
            .map(|i| vec![0, 255, (i * 6) as u8])
            .collect();

        let out = roundtrip(format, &digital, &analog);
        assert_eq!(out.digital, digital);
        let expected: Vec<Vec<u8>> = analog
            .iter()
            .map(|s| s.iter().map(|&v| v >> 1).collect())
            .collect();
        assert_eq!(out.analog, expected);
    }

    #[test]
    fn partial_slice_is_left_for_the_next_read() {
        let format = format(0xFFF, 0, PinMode::Base);
        let mut out = Slices::default();
        let mut decoder = SliceDecoder::new(format);

        let first = decoder.decode(&[0x81, 0x82, 50, 0x83], &mut out);
        assert_eq!(first, Decoded { consumed: 3, end: None });
        assert_eq!(out.digital, vec![0x101, 0x101, 0x101, 0x101]);

        let second = decoder.decode(&[0x83, 0x80], &mut out);
        assert_eq!(second.consumed, 2);
        assert_eq!(out.digital.last(), Some(&3));
    }

    #[test]
    fn dollar_starts_trailer_and_bang_aborts() {
        let format = format(0x3, 0, PinMode::Base);
        let mut out = Slices::default();
        let mut decoder = SliceDecoder::new(format);

        let decoded = decoder.decode(b"\x81\x82$12+", &mut out);
        assert_eq!(
            decoded,
            Decoded {
                consumed: 2,
                end: Some(StreamEnd::Trailer)
            }
        );

        let aborted = decoder.decode(b"!!!", &mut out);
        assert_eq!(aborted.end, Some(StreamEnd::Abort(b'!')));
        assert_eq!(aborted.consumed, 0);
    }

    #[test]
    fn analog_mode_rejects_run_bytes() {
        let format = format(0, 0x1, PinMode::Base);
        let mut out = Slices::default();
        let mut decoder = SliceDecoder::new(format);

        let decoded = decoder.decode(&[0x90, 60, 0x90], &mut out);
        assert_eq!(decoded.end, Some(StreamEnd::Abort(60)));
        assert_eq!(out.analog, vec![vec![0x10]]);
    }
}
