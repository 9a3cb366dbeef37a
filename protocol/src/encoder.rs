use heapless::Vec;

use crate::channels::{EncodingMode, ReadWidth, SliceFormat};
use crate::wire::{
    D4_CHUNK_FLUSH_THRESHOLD, D4_FLUSH_THRESHOLD, D4_RUN_BASE, D4_RUN_CHUNK, D4_RUN_UNIT,
    DATA_FLAG, FLUSH_THRESHOLD, RUN_CHUNK_BYTE, TX_BUFFER_SIZE, WIDE_LONG_RUN_BASE,
    WIDE_LONG_RUN_UNIT, WIDE_RUN_CHUNK, WIDE_SHORT_RUN_BASE, WIDE_SHORT_RUN_MAX,
};

/// Destination of encoded bytes, normally the serial transport.
pub trait ByteSink {
    fn send(&mut self, bytes: &[u8]);
}

/// Raw samples of one buffer half as the capture hardware left them.
///
/// Digital samples are packed little-endian at the format's read width, analog
/// bytes are interleaved one per enabled channel.
#[derive(Debug, Clone, Copy)]
pub struct HalfBuffer<'a> {
    pub digital: &'a [u8],
    pub analog: &'a [u8],
}

impl<'a> HalfBuffer<'a> {
    pub const fn new(digital: &'a [u8], analog: &'a [u8]) -> Self {
        Self { digital, analog }
    }

    /// Little-endian word `index` of the digital segment, zero-padded past the end.
    fn word(&self, index: usize) -> u32 {
        let mut bytes = [0u8; 4];
        let start = index * 4;
        if start < self.digital.len() {
            let end = (start + 4).min(self.digital.len());
            bytes[..end - start].copy_from_slice(&self.digital[start..end]);
        }
        u32::from_le_bytes(bytes)
    }

    fn digital_raw(&self, width: ReadWidth, sample: usize) -> u32 {
        match width {
            ReadWidth::Nibble => u32::from(self.digital[sample / 2] >> ((sample & 1) * 4)) & 0xF,
            ReadWidth::Byte => u32::from(self.digital[sample]),
            ReadWidth::Half => {
                let at = sample * 2;
                u32::from(u16::from_le_bytes([self.digital[at], self.digital[at + 1]]))
            }
            ReadWidth::Word => {
                let at = sample * 4;
                u32::from_le_bytes([
                    self.digital[at],
                    self.digital[at + 1],
                    self.digital[at + 2],
                    self.digital[at + 3],
                ])
            }
        }
    }

    /// Samples both segments can supply for `format`.
    pub fn capacity(&self, format: &SliceFormat) -> usize {
        let digital = match format.read_width() {
            Some(width) => self.digital.len() * 8 / width.bits() as usize,
            None => usize::MAX,
        };
        let analog = match format.analog_count {
            0 => usize::MAX,
            n => self.analog.len() / n as usize,
        };
        digital.min(analog)
    }
}

const fn nibble(word: u32, index: usize) -> u8 {
    ((word >> (index * 4)) & 0xF) as u8
}

/// Turns buffer halves into the run-length encoded wire stream.
///
/// Each half is encoded independently and starts with a raw sample, so the
/// decoder never needs state from an earlier half to interpret a run.
pub struct SliceEncoder {
    format: SliceFormat,
    tx: Vec<u8, TX_BUFFER_SIZE>,
    emitted: u32,
}

impl SliceEncoder {
    pub const fn new(format: SliceFormat) -> Self {
        Self {
            format,
            tx: Vec::new(),
            emitted: 0,
        }
    }

    pub const fn format(&self) -> &SliceFormat {
        &self.format
    }

    /// Bytes handed to the sink since construction, modulo 2^32.
    pub const fn bytes_emitted(&self) -> u32 {
        self.emitted
    }

    /// Encode the first `samples` slices of `half` and flush everything to `sink`.
    ///
    /// Returns the number of bytes written for this half.
    pub fn encode_half<S: ByteSink>(
        &mut self,
        half: &HalfBuffer<'_>,
        samples: usize,
        sink: &mut S,
    ) -> usize {
        let samples = samples.min(half.capacity(&self.format));
        let before = self.emitted;
        if samples > 0 {
            match self.format.mode {
                EncodingMode::D4 => self.encode_d4(half, samples, sink),
                EncodingMode::Wide => self.encode_wide(half, samples, sink),
                EncodingMode::Analog => self.encode_analog(half, samples, sink),
            }
        }
        self.flush(sink);
        self.emitted.wrapping_sub(before) as usize
    }

    fn push<S: ByteSink>(&mut self, byte: u8, sink: &mut S) {
        if self.tx.is_full() {
            self.flush(sink);
        }
        // Room was just made above.
        let _ = self.tx.push(byte);
    }

    fn flush<S: ByteSink>(&mut self, sink: &mut S) {
        if self.tx.is_empty() {
            return;
        }
        sink.send(&self.tx);
        self.emitted = self.emitted.wrapping_add(self.tx.len() as u32);
        self.tx.clear();
    }

    fn flush_above<S: ByteSink>(&mut self, threshold: usize, sink: &mut S) {
        if self.tx.len() >= threshold {
            self.flush(sink);
        }
    }

    /// Emit the multiple-of-eight part of a D4 run and return the remainder (0..=7).
    fn push_d4_run<S: ByteSink>(&mut self, mut run: u32, sink: &mut S) -> u32 {
        while run >= D4_RUN_CHUNK {
            self.push(RUN_CHUNK_BYTE, sink);
            run -= D4_RUN_CHUNK;
        }
        if run >= D4_RUN_UNIT {
            self.push(D4_RUN_BASE + (run / D4_RUN_UNIT) as u8, sink);
            run %= D4_RUN_UNIT;
        }
        run
    }

    /// Word `index` of a D4 half with the nibble bits of disabled pins cleared.
    fn d4_word(&self, half: &HalfBuffer<'_>, index: usize) -> u32 {
        half.word(index) & ((self.format.digital_mask & 0xF) * 0x1111_1111)
    }

    fn encode_d4<S: ByteSink>(&mut self, half: &HalfBuffer<'_>, samples: usize, sink: &mut S) {
        let first = self.d4_word(half, 0);
        let head = samples.min(8);
        for idx in 0..head {
            self.push(DATA_FLAG | nibble(first, idx), sink);
        }

        let mut last_word = first;
        let mut last_nibble = nibble(first, head - 1);
        let mut run: u32 = 0;

        for word_idx in 1..samples.div_ceil(8) {
            let count = (samples - word_idx * 8).min(8);

            while run >= D4_RUN_CHUNK {
                self.push(RUN_CHUNK_BYTE, sink);
                run -= D4_RUN_CHUNK;
                self.flush_above(D4_CHUNK_FLUSH_THRESHOLD + 1, sink);
            }

            let word = self.d4_word(half, word_idx);
            // All eight nibbles repeat the previous value.
            if count == 8 && word == last_word && (word >> 4) == (word & 0x0FFF_FFFF) {
                run += 8;
                continue;
            }

            for idx in 0..count {
                let value = nibble(word, idx);
                if value == last_nibble {
                    run += 1;
                } else {
                    let embedded = self.push_d4_run(run, sink);
                    self.push(DATA_FLAG | value | ((embedded as u8) << 4), sink);
                    run = 0;
                    last_nibble = value;
                }
            }
            last_word = word;
            self.flush_above(D4_FLUSH_THRESHOLD, sink);
        }

        let embedded = self.push_d4_run(run, sink);
        if embedded > 0 {
            // The final sample byte itself stands for the last repeat.
            self.push(
                DATA_FLAG | last_nibble | (((embedded - 1) as u8) << 4),
                sink,
            );
        }
    }

    fn read_digital(&self, half: &HalfBuffer<'_>, width: ReadWidth, sample: usize) -> u32 {
        let mut value = half.digital_raw(width, sample);
        if width == ReadWidth::Word {
            value = self.format.pin_mode.compact_word(value);
        }
        value & self.format.digital_mask
    }

    fn push_digital<S: ByteSink>(&mut self, mut value: u32, sink: &mut S) {
        for _ in 0..self.format.digital_fields {
            self.push(DATA_FLAG | (value as u8 & 0x7F), sink);
            value >>= 7;
        }
    }

    fn push_wide_run<S: ByteSink>(&mut self, mut run: u32, sink: &mut S) {
        while run >= WIDE_RUN_CHUNK {
            self.push(RUN_CHUNK_BYTE, sink);
            run -= WIDE_RUN_CHUNK;
        }
        if run > WIDE_SHORT_RUN_MAX {
            let units = run / WIDE_LONG_RUN_UNIT;
            self.push(WIDE_LONG_RUN_BASE + units as u8, sink);
            run -= units * WIDE_LONG_RUN_UNIT;
        }
        if run > 0 {
            self.push(WIDE_SHORT_RUN_BASE + run as u8, sink);
        }
    }

    fn encode_wide<S: ByteSink>(&mut self, half: &HalfBuffer<'_>, samples: usize, sink: &mut S) {
        let Some(width) = self.format.read_width() else {
            return;
        };

        let mut last = self.read_digital(half, width, 0);
        self.push_digital(last, sink);

        let mut run: u32 = 0;
        for sample in 1..samples {
            let value = self.read_digital(half, width, sample);
            if value == last {
                run += 1;
                if run == WIDE_RUN_CHUNK {
                    self.push(RUN_CHUNK_BYTE, sink);
                    run = 0;
                    self.flush_above(FLUSH_THRESHOLD, sink);
                }
                continue;
            }
            self.push_wide_run(run, sink);
            run = 0;
            self.push_digital(value, sink);
            last = value;
            self.flush_above(FLUSH_THRESHOLD, sink);
        }
        self.push_wide_run(run, sink);
    }

    fn encode_analog<S: ByteSink>(&mut self, half: &HalfBuffer<'_>, samples: usize, sink: &mut S) {
        let width = self.format.read_width();
        let channels = self.format.analog_count as usize;

        for sample in 0..samples {
            if let Some(width) = width {
                let value = self.read_digital(half, width, sample);
                self.push_digital(value, sink);
            }
            for &raw in &half.analog[sample * channels..(sample + 1) * channels] {
                self.push(DATA_FLAG | (raw >> 1), sink);
            }
            self.flush_above(FLUSH_THRESHOLD, sink);
        }
    }
}
