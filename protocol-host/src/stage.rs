//! Software trigger: holds samples back until the trigger fires, then forwards
//! the pre-trigger window followed by everything after it.

use tracing::{debug, info};

use crate::batch::{SampleBatch, SampleSink};
use crate::ring::PretrigRing;
use crate::trigger::TriggerMatcher;

/// Pre-trigger depth for `ratio` percent of `limit` samples.
pub fn pretrig_entries(ratio: u8, limit: u64) -> usize {
    (u64::from(ratio.min(100)) * limit / 100) as usize
}

pub struct TriggerStage<M> {
    matcher: Option<M>,
    limit: u64,
    pretrig_entries: usize,
    fired: bool,
    sent: u64,
    digital_ring: PretrigRing<u32>,
    analog_rings: Vec<PretrigRing<f32>>,
    seen: u64,
    trigger_at: Option<u64>,
}

impl<M: TriggerMatcher> TriggerStage<M> {
    /// A stage that forwards every sample up to `limit`.
    pub fn immediate(limit: u64) -> Self {
        Self::build(None, limit, 0, 0)
    }

    /// A stage that waits for `matcher`, keeping `pretrig_entries` samples of history.
    pub fn triggered(matcher: M, limit: u64, pretrig_entries: usize, analog_channels: usize) -> Self {
        Self::build(Some(matcher), limit, pretrig_entries.min(limit as usize), analog_channels)
    }

    fn build(matcher: Option<M>, limit: u64, pretrig_entries: usize, analog_channels: usize) -> Self {
        let fired = matcher.is_none();
        let ring_size = if fired { 0 } else { pretrig_entries };
        Self {
            matcher,
            limit,
            pretrig_entries: ring_size,
            fired,
            sent: 0,
            digital_ring: PretrigRing::with_capacity(ring_size),
            analog_rings: (0..analog_channels)
                .map(|_| PretrigRing::with_capacity(ring_size))
                .collect(),
            seen: 0,
            trigger_at: None,
        }
    }

    pub fn fired(&self) -> bool {
        self.fired
    }

    /// Samples forwarded so far; never above the limit.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn is_complete(&self) -> bool {
        self.sent >= self.limit
    }

    /// Absolute index of the triggering sample.
    pub fn trigger_at(&self) -> Option<u64> {
        self.trigger_at
    }

    /// Offer the next decoded batch.
    pub fn push<S: SampleSink + ?Sized>(&mut self, batch: &SampleBatch, sink: &mut S) {
        if batch.is_empty() {
            return;
        }
        let first = self.seen;
        self.seen += batch.len() as u64;

        if self.fired {
            self.forward(batch, 0, sink);
            return;
        }

        let hit = self
            .matcher
            .as_mut()
            .and_then(|matcher| matcher.check(batch.digital()));
        match hit {
            Some(offset) => self.fire(batch, offset, first, sink),
            None => self.remember(batch),
        }
    }

    fn forward<S: SampleSink + ?Sized>(&mut self, batch: &SampleBatch, from: usize, sink: &mut S) {
        let remaining = self.limit.saturating_sub(self.sent);
        let count = ((batch.len() - from) as u64).min(remaining) as usize;
        if count == 0 {
            return;
        }
        sink.samples(batch.slice(from, from + count));
        self.sent += count as u64;
    }

    fn fire<S: SampleSink + ?Sized>(
        &mut self,
        batch: &SampleBatch,
        offset: usize,
        first: u64,
        sink: &mut S,
    ) {
        let from_batch = offset.min(self.pretrig_entries);
        let from_ring = self.digital_ring.len().min(self.pretrig_entries - from_batch);
        info!(
            at = first + offset as u64,
            pre = from_ring + from_batch,
            "trigger fired"
        );

        if from_ring > 0 {
            let mut history = SampleBatch::new(batch.has_digital(), self.analog_rings.len());
            let mut analog: Vec<_> = self
                .analog_rings
                .iter()
                .map(|ring| ring.newest(from_ring))
                .collect();
            for digital in self.digital_ring.newest(from_ring) {
                let volts: Vec<f32> = analog.iter_mut().map(|it| it.next().unwrap_or(0.0)).collect();
                history.push(digital, volts);
            }
            sink.samples(history.view());
        }
        if from_batch > 0 {
            sink.samples(batch.slice(offset - from_batch, offset));
        }
        self.sent = (from_ring + from_batch) as u64;
        self.fired = true;
        self.trigger_at = Some(first + offset as u64);
        self.release_rings();

        sink.trigger();
        self.forward(batch, offset, sink);
    }

    fn remember(&mut self, batch: &SampleBatch) {
        if self.pretrig_entries == 0 {
            return;
        }
        let tail = batch.len().saturating_sub(self.pretrig_entries);
        let view = batch.slice(tail, batch.len());
        if batch.has_digital() {
            self.digital_ring.extend_from_slice(view.digital());
        } else {
            // Keep the ring length in step with the analog rings.
            for _ in 0..view.len() {
                self.digital_ring.push(0);
            }
        }
        for (channel, ring) in self.analog_rings.iter_mut().enumerate() {
            ring.extend_from_slice(view.analog(channel));
        }
        debug!(held = self.digital_ring.len(), "no trigger in batch");
    }

    fn release_rings(&mut self) {
        self.digital_ring.release();
        for ring in &mut self.analog_rings {
            ring.release();
        }
    }

    /// Free per-run storage.
    pub fn release(&mut self) {
        self.release_rings();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::SampleView;
    use crate::trigger::PatternTrigger;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        digital: Vec<u32>,
        analog: Vec<f32>,
        trigger_index: Option<usize>,
    }

    impl SampleSink for Recorder {
        fn samples(&mut self, view: SampleView<'_>) {
            self.digital.extend_from_slice(view.digital());
            if view.analog_channels() > 0 {
                self.analog.extend_from_slice(view.analog(0));
            }
        }

        fn trigger(&mut self) {
            self.trigger_index = Some(self.digital.len());
        }
    }

    /// Counter samples with a single high bit 8 at `at`.
    fn stream(len: u32, at: u32) -> Vec<u32> {
        (0..len).map(|i| if i == at { 0x100 | i & 0xFF } else { i & 0xFF }).collect()
    }

    fn batches(samples: &[u32], size: usize) -> Vec<SampleBatch> {
        samples
            .chunks(size)
            .map(|chunk| {
                let mut batch = SampleBatch::new(true, 1);
                for &s in chunk {
                    batch.push(s, [s as f32]);
                }
                batch
            })
            .collect()
    }

    fn run(limit: u64, ratio: u8, at: u32, batch_size: usize) -> Recorder {
        let trigger: PatternTrigger = "8=1".parse().unwrap();
        let mut stage = TriggerStage::triggered(trigger, limit, pretrig_entries(ratio, limit), 1);
        let mut recorder = Recorder::default();
        for batch in batches(&stream(at + 2 * limit as u32, at), batch_size) {
            stage.push(&batch, &mut recorder);
        }
        assert_eq!(stage.sent(), limit);
        assert_eq!(stage.trigger_at(), Some(u64::from(at)));
        recorder
    }

    #[test]
    fn window_is_min_of_history_and_ratio() {
        for (limit, ratio, at, batch_size) in [
            (100, 20, 500, 64),
            (100, 20, 5, 64),
            (100, 20, 25, 7),
            (100, 0, 300, 50),
            (100, 100, 1_000, 33),
            (50, 50, 30, 1),
        ] {
            let rec = run(limit, ratio, at, batch_size);
            let window = pretrig_entries(ratio, limit);
            let pre = (at as usize).min(window);
            assert_eq!(rec.trigger_index, Some(pre), "{limit} {ratio} {at} {batch_size}");
            assert_eq!(rec.digital.len(), limit as usize);

            let expected: Vec<u32> = stream(at + 2 * limit as u32, at)
                [at as usize - pre..at as usize - pre + limit as usize]
                .to_vec();
            assert_eq!(rec.digital, expected);
            let volts: Vec<f32> = expected.iter().map(|&s| s as f32).collect();
            assert_eq!(rec.analog, volts);
        }
    }

    #[test]
    fn immediate_stage_truncates_at_limit() {
        let mut stage = TriggerStage::<PatternTrigger>::immediate(10);
        let mut rec = Recorder::default();
        for batch in batches(&(0..25).collect::<Vec<_>>(), 4) {
            stage.push(&batch, &mut rec);
        }
        assert_eq!(rec.digital, (0..10).collect::<Vec<_>>());
        assert!(stage.is_complete());
        assert_eq!(rec.trigger_index, None);
    }
}
