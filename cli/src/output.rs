//! Sample sinks that write a capture out as CSV or VCD.
//!
//! [`SampleSink`] cannot fail, so the first write error is kept and returned
//! from `finish`; later samples are dropped.

use std::io::{self, Write};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use srpico_host::{SampleSink, SampleView};
use strum::{Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Display, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Csv,
    Vcd,
}

/// Channel layout shared by both writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub digital_channels: u8,
    pub analog_channels: u8,
    pub sample_rate: u32,
}

impl Layout {
    fn nanos(&self, index: u64) -> u64 {
        (u128::from(index) * 1_000_000_000 / u128::from(self.sample_rate.max(1))) as u64
    }
}

pub trait CaptureWriter: SampleSink {
    /// Flush everything and report the first error hit while writing.
    fn finish(&mut self) -> io::Result<()>;
}

pub fn writer_for<W: Write + 'static>(
    format: OutputFormat,
    layout: Layout,
    out: W,
) -> Box<dyn CaptureWriter> {
    match format {
        OutputFormat::Csv => Box::new(CsvWriter::new(out, layout)),
        OutputFormat::Vcd => Box::new(VcdWriter::new(out, layout)),
    }
}

/// One row per sample: index, time, digital bits, analog volts, trigger mark.
pub struct CsvWriter<W: Write> {
    out: W,
    layout: Layout,
    index: u64,
    header_written: bool,
    trigger_pending: bool,
    error: Option<io::Error>,
}

impl<W: Write> CsvWriter<W> {
    pub fn new(out: W, layout: Layout) -> Self {
        Self {
            out,
            layout,
            index: 0,
            header_written: false,
            trigger_pending: false,
            error: None,
        }
    }

    fn write_header(&mut self) -> io::Result<()> {
        write!(self.out, "sample,time_s")?;
        for channel in 0..self.layout.digital_channels {
            write!(self.out, ",D{channel}")?;
        }
        for channel in 0..self.layout.analog_channels {
            write!(self.out, ",A{channel}")?;
        }
        writeln!(self.out, ",trigger")
    }

    fn write_view(&mut self, view: SampleView<'_>) -> io::Result<()> {
        if !self.header_written {
            self.write_header()?;
            self.header_written = true;
        }
        let digital = view.digital();
        let rate = f64::from(self.layout.sample_rate.max(1));
        for row in 0..view.len() {
            write!(self.out, "{},{:.9}", self.index, self.index as f64 / rate)?;
            let word = digital.get(row).copied().unwrap_or(0);
            for channel in 0..self.layout.digital_channels {
                write!(self.out, ",{}", word >> channel & 1)?;
            }
            for channel in 0..usize::from(self.layout.analog_channels) {
                let volts = view.analog(channel).get(row).copied().unwrap_or(0.0);
                write!(self.out, ",{volts:.4}")?;
            }
            let mark = u8::from(std::mem::take(&mut self.trigger_pending));
            writeln!(self.out, ",{mark}")?;
            self.index += 1;
        }
        Ok(())
    }
}

impl<W: Write> SampleSink for CsvWriter<W> {
    fn samples(&mut self, view: SampleView<'_>) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.write_view(view) {
            tracing::error!("csv write failed: {err}");
            self.error = Some(err);
        }
    }

    fn trigger(&mut self) {
        self.trigger_pending = true;
    }
}

impl<W: Write> CaptureWriter for CsvWriter<W> {
    fn finish(&mut self) -> io::Result<()> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        if !self.header_written {
            self.write_header()?;
            self.header_written = true;
        }
        self.out.flush()
    }
}

/// Value change dump, readable by PulseView and GTKWave.
///
/// Digital channels are 1-bit wires, analog channels 64-bit reals, plus a
/// `TRIG` wire that pulses on the triggering sample. Times are in nanoseconds.
pub struct VcdWriter<W: Write> {
    out: W,
    layout: Layout,
    index: u64,
    header_written: bool,
    previous: Option<(u32, Vec<f32>)>,
    trigger_pending: bool,
    trigger_high: bool,
    error: Option<io::Error>,
}

impl<W: Write> VcdWriter<W> {
    pub fn new(out: W, layout: Layout) -> Self {
        Self {
            out,
            layout,
            index: 0,
            header_written: false,
            previous: None,
            trigger_pending: false,
            trigger_high: false,
            error: None,
        }
    }

    /// Printable identifier for variable `n`; digital first, then analog, then the trigger.
    fn id(n: usize) -> char {
        (b'!' + n as u8) as char
    }

    fn analog_id(&self, channel: usize) -> char {
        Self::id(usize::from(self.layout.digital_channels) + channel)
    }

    fn trigger_id(&self) -> char {
        Self::id(usize::from(self.layout.digital_channels) + usize::from(self.layout.analog_channels))
    }

    fn write_header(&mut self) -> io::Result<()> {
        writeln!(self.out, "$version {} {} $end", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))?;
        writeln!(self.out, "$timescale 1 ns $end")?;
        writeln!(self.out, "$scope module srpico $end")?;
        for channel in 0..usize::from(self.layout.digital_channels) {
            writeln!(self.out, "$var wire 1 {} D{channel} $end", Self::id(channel))?;
        }
        for channel in 0..usize::from(self.layout.analog_channels) {
            writeln!(self.out, "$var real 64 {} A{channel} $end", self.analog_id(channel))?;
        }
        writeln!(self.out, "$var wire 1 {} TRIG $end", self.trigger_id())?;
        writeln!(self.out, "$upscope $end")?;
        writeln!(self.out, "$enddefinitions $end")
    }

    fn write_view(&mut self, view: SampleView<'_>) -> io::Result<()> {
        if !self.header_written {
            self.write_header()?;
            self.header_written = true;
        }
        let digital = view.digital();
        let analog_channels = usize::from(self.layout.analog_channels);
        let mut volts = Vec::with_capacity(analog_channels);
        for row in 0..view.len() {
            let word = digital.get(row).copied().unwrap_or(0);
            volts.clear();
            volts.extend((0..analog_channels).map(|ch| view.analog(ch).get(row).copied().unwrap_or(0.0)));
            let trigger = std::mem::take(&mut self.trigger_pending);

            let (changed_bits, changed_analog) = match &self.previous {
                None => (u32::MAX, vec![true; analog_channels]),
                Some((prev_word, prev_volts)) => (
                    word ^ prev_word,
                    volts.iter().zip(prev_volts).map(|(a, b)| a != b).collect(),
                ),
            };
            let first = self.previous.is_none();
            let any = changed_bits & digital_mask(self.layout.digital_channels) != 0
                || changed_analog.iter().any(|&c| c)
                || trigger
                || self.trigger_high
                || first;
            if any {
                writeln!(self.out, "#{}", self.layout.nanos(self.index))?;
                if first {
                    writeln!(self.out, "$dumpvars")?;
                }
                for channel in 0..self.layout.digital_channels {
                    if changed_bits >> channel & 1 != 0 {
                        writeln!(self.out, "{}{}", word >> channel & 1, Self::id(channel.into()))?;
                    }
                }
                for (channel, &changed) in changed_analog.iter().enumerate() {
                    if changed {
                        writeln!(self.out, "r{} {}", volts[channel], self.analog_id(channel))?;
                    }
                }
                if first || trigger != self.trigger_high {
                    writeln!(self.out, "{}{}", u8::from(trigger), self.trigger_id())?;
                    self.trigger_high = trigger;
                }
                if first {
                    writeln!(self.out, "$end")?;
                }
            }
            self.previous = Some((word, volts.clone()));
            self.index += 1;
        }
        Ok(())
    }
}

fn digital_mask(channels: u8) -> u32 {
    match channels {
        0 => 0,
        32..=u8::MAX => u32::MAX,
        n => (1 << n) - 1,
    }
}

impl<W: Write> SampleSink for VcdWriter<W> {
    fn samples(&mut self, view: SampleView<'_>) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.write_view(view) {
            tracing::error!("vcd write failed: {err}");
            self.error = Some(err);
        }
    }

    fn trigger(&mut self) {
        self.trigger_pending = true;
    }
}

impl<W: Write> CaptureWriter for VcdWriter<W> {
    fn finish(&mut self) -> io::Result<()> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        if !self.header_written {
            self.write_header()?;
            self.header_written = true;
        }
        // Close the last sample period so viewers show its full width.
        writeln!(self.out, "#{}", self.layout.nanos(self.index))?;
        self.out.flush()
    }
}
