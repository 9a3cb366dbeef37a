//! Host-side stand-ins for the capture peripherals and the serial link.
//!
//! Time only moves when the test advances [`SimClock`] or when bytes are pushed
//! through a [`SimLink`], which makes slow links and overruns reproducible.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use srpico_protocol::ReadWidth;

use crate::arena::ChainMode;
use crate::hardware::{CaptureHardware, CapturePlan, Completions, Half, HardwareError};
use crate::transport::Transport;

/// Shared microsecond counter.
#[derive(Debug, Clone, Default)]
pub struct SimClock(Rc<Cell<u64>>);

impl SimClock {
    pub fn now(&self) -> u64 {
        self.0.get()
    }

    pub fn advance(&self, micros: u64) {
        self.0.set(self.0.get() + micros);
    }
}

/// Pin levels at one sample instant.
///
/// `digital` holds the raw pin word as the digital producer shifts it in; only
/// the low bits of the plan's read width are stored. `analog` holds 8-bit codes
/// for ADC inputs 0..3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimSample {
    pub digital: u32,
    pub analog: [u8; 3],
}

type Source = Box<dyn FnMut(u64) -> SimSample>;

/// Simulated sampler, ADC and DMA chain writing into an owned arena.
///
/// Each half fills in `samples_per_half / sample_rate` of clock time. Content
/// is written when the completion is taken, from `source(sample_index)`.
pub struct SimHardware {
    clock: SimClock,
    arena: Vec<u8>,
    source: Source,
    plan: Option<CapturePlan>,
    started_at: Option<u64>,
    stopped_at: Option<u64>,
    delivered: u64,
    fault: bool,
    configure_calls: usize,
}

impl SimHardware {
    pub fn new(
        clock: SimClock,
        arena_len: usize,
        source: impl FnMut(u64) -> SimSample + 'static,
    ) -> Self {
        Self {
            clock,
            arena: vec![0; arena_len],
            source: Box::new(source),
            plan: None,
            started_at: None,
            stopped_at: None,
            delivered: 0,
            fault: false,
            configure_calls: 0,
        }
    }

    /// Producers running and DMA chained.
    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.stopped_at.is_none()
    }

    pub fn configure_calls(&self) -> usize {
        self.configure_calls
    }

    /// Make the producers report a FIFO stall.
    pub fn inject_fault(&mut self) {
        self.fault = true;
    }

    fn fill_micros(plan: &CapturePlan) -> u64 {
        let micros = u64::from(plan.layout.samples_per_half) * 1_000_000
            / u64::from(plan.sample_rate.max(1));
        micros.max(1)
    }

    /// Halves filled so far, counting from the start of the run.
    fn filled(&self) -> u64 {
        let (Some(plan), Some(start)) = (self.plan.as_ref(), self.started_at) else {
            return 0;
        };
        let now = self.stopped_at.unwrap_or_else(|| self.clock.now());
        let filled = now.saturating_sub(start) / Self::fill_micros(plan);
        match plan.chain() {
            ChainMode::Single => filled.min(2),
            ChainMode::PingPong => filled,
        }
    }

    fn write_half(&mut self, index: u64) {
        let Some(plan) = self.plan else {
            return;
        };
        let half = Half::from_index(index);
        let samples = plan.layout.samples_per_half as usize;
        let first = index * samples as u64;
        let analog_count = plan.format.analog_count as usize;
        let width = plan.format.read_width();
        let digital = plan.layout.digital_range(half);
        let analog = plan.layout.analog_range(half);

        for i in 0..samples {
            let sample = (self.source)(first + i as u64);
            if let Some(width) = width {
                let seg = &mut self.arena[digital.clone()];
                store_digital(seg, width, i, sample.digital);
            }
            for (ch, code) in sample.analog.iter().take(analog_count).enumerate() {
                self.arena[analog.start + i * analog_count + ch] = *code;
            }
        }
    }
}

fn store_digital(seg: &mut [u8], width: ReadWidth, sample: usize, value: u32) {
    match width {
        ReadWidth::Nibble => {
            let shift = (sample & 1) * 4;
            let byte = &mut seg[sample / 2];
            *byte = (*byte & !(0xF << shift)) | (((value & 0xF) as u8) << shift);
        }
        ReadWidth::Byte => seg[sample] = value as u8,
        ReadWidth::Half => {
            seg[sample * 2..sample * 2 + 2].copy_from_slice(&(value as u16).to_le_bytes())
        }
        ReadWidth::Word => seg[sample * 4..sample * 4 + 4].copy_from_slice(&value.to_le_bytes()),
    }
}

impl CaptureHardware for SimHardware {
    fn arena(&self) -> &[u8] {
        &self.arena
    }

    fn configure(&mut self, plan: &CapturePlan) -> Result<(), HardwareError> {
        self.configure_calls += 1;
        if plan.layout.total_bytes() > self.arena.len() {
            return Err(HardwareError::ArenaTooSmall);
        }
        self.plan = Some(*plan);
        self.started_at = None;
        self.stopped_at = None;
        self.delivered = 0;
        self.fault = false;
        Ok(())
    }

    fn start(&mut self) {
        if self.plan.is_some() {
            self.started_at = Some(self.clock.now());
        }
    }

    fn take_completions(&mut self) -> Completions {
        let Some(plan) = self.plan else {
            return Completions::NONE;
        };
        let filled = self.filled();
        if filled <= self.delivered {
            return Completions::NONE;
        }

        // Earlier halves were overwritten by later ones; only the last two are visible.
        let first = self.delivered.max(filled.saturating_sub(2));
        let mut events = Completions::NONE;
        for index in first..filled {
            self.write_half(index);
            events |= plan.completion_mask(Half::from_index(index));
        }
        self.delivered = filled;
        events
    }

    fn is_busy(&self, half: Half) -> bool {
        if !self.is_running() {
            return false;
        }
        let Some(plan) = self.plan.as_ref() else {
            return false;
        };
        let filling = self.filled();
        if plan.chain() == ChainMode::Single && filling >= 2 {
            return false;
        }
        Half::from_index(filling) == half
    }

    fn producer_fault(&self) -> bool {
        self.fault
    }

    fn halt(&mut self) {
        if self.is_running() {
            self.stopped_at = Some(self.clock.now());
        }
    }

    fn reset(&mut self) {
        self.halt();
        self.plan = None;
        self.started_at = None;
        self.stopped_at = None;
        self.delivered = 0;
        self.fault = false;
    }

    fn now_micros(&self) -> u64 {
        self.clock.now()
    }
}

/// Serial link whose writes cost `byte_micros` of clock time per byte.
pub struct SimLink {
    clock: SimClock,
    byte_micros: u64,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl SimLink {
    pub fn new(clock: SimClock) -> Self {
        Self {
            clock,
            byte_micros: 0,
            rx: VecDeque::new(),
            tx: Vec::new(),
        }
    }

    pub fn set_byte_micros(&mut self, micros: u64) {
        self.byte_micros = micros;
    }

    /// Queue bytes as if the host had sent them.
    pub fn host_send(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    /// Everything the device wrote since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.tx)
    }
}

impl Transport for SimLink {
    fn write(&mut self, bytes: &[u8]) -> usize {
        self.clock.advance(bytes.len() as u64 * self.byte_micros);
        self.tx.extend_from_slice(bytes);
        bytes.len()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }
}
