use srpico_protocol::{AnalogScale, SliceSink};

/// Decoded samples of one read, one column per enabled channel group.
///
/// `digital` is empty when no digital channel is enabled; otherwise every
/// column has `len()` entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleBatch {
    digital: Vec<u32>,
    analog: Vec<Vec<f32>>,
    has_digital: bool,
    len: usize,
}

impl SampleBatch {
    pub fn new(has_digital: bool, analog_channels: usize) -> Self {
        Self {
            digital: Vec::new(),
            analog: vec![Vec::new(); analog_channels],
            has_digital,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn has_digital(&self) -> bool {
        self.has_digital
    }

    pub fn analog_channels(&self) -> usize {
        self.analog.len()
    }

    pub fn digital(&self) -> &[u32] {
        &self.digital
    }

    pub fn analog(&self, channel: usize) -> &[f32] {
        self.analog.get(channel).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn push(&mut self, digital: u32, volts: impl IntoIterator<Item = f32>) {
        if self.has_digital {
            self.digital.push(digital);
        }
        for (column, value) in self.analog.iter_mut().zip(volts) {
            column.push(value);
        }
        self.len += 1;
    }

    /// Append `count` copies of the last sample.
    pub fn repeat_last(&mut self, count: usize) {
        if self.len == 0 {
            return;
        }
        if let Some(&last) = self.digital.last() {
            self.digital.resize(self.digital.len() + count, last);
        }
        for column in &mut self.analog {
            if let Some(&last) = column.last() {
                column.resize(column.len() + count, last);
            }
        }
        self.len += count;
    }

    pub fn clear(&mut self) {
        self.digital.clear();
        for column in &mut self.analog {
            column.clear();
        }
        self.len = 0;
    }

    pub fn view(&self) -> SampleView<'_> {
        self.slice(0, self.len)
    }

    /// Samples `start..end`, clamped to the batch.
    pub fn slice(&self, start: usize, end: usize) -> SampleView<'_> {
        let end = end.min(self.len);
        SampleView {
            batch: self,
            start: start.min(end),
            end,
        }
    }
}

/// Borrowed window into a [`SampleBatch`].
#[derive(Debug, Clone, Copy)]
pub struct SampleView<'a> {
    batch: &'a SampleBatch,
    start: usize,
    end: usize,
}

impl<'a> SampleView<'a> {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn has_digital(&self) -> bool {
        self.batch.has_digital
    }

    pub fn analog_channels(&self) -> usize {
        self.batch.analog_channels()
    }

    /// Digital words, empty when no digital channel is enabled.
    pub fn digital(&self) -> &'a [u32] {
        if self.batch.has_digital {
            &self.batch.digital[self.start..self.end]
        } else {
            &[]
        }
    }

    pub fn analog(&self, channel: usize) -> &'a [f32] {
        let column = self.batch.analog(channel);
        column.get(self.start..self.end).unwrap_or(&[])
    }
}

/// Consumer of the samples a run forwards, in order.
pub trait SampleSink {
    fn samples(&mut self, view: SampleView<'_>);

    /// The trigger fired between the previous and the next call to `samples`.
    fn trigger(&mut self) {}
}

/// Turns decoder output into batch rows, scaling analog codes to volts.
pub(crate) struct Collector<'a> {
    pub batch: &'a mut SampleBatch,
    pub scales: &'a [AnalogScale],
}

impl SliceSink for Collector<'_> {
    fn slice(&mut self, digital: u32, analog: &[u8]) {
        let scales = self.scales;
        let volts = analog
            .iter()
            .zip(scales)
            .map(|(&code, scale)| scale.volts(code));
        self.batch.push(digital, volts);
    }

    fn repeat(&mut self, count: u32) {
        self.batch.repeat_last(count as usize);
    }
}
