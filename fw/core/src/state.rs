use srpico_protocol::{wire, ChannelConfig, ConfigError, PinMode, SliceEncoder};

use crate::arena::{BufferLayout, LayoutError};
use crate::hardware::{CaptureHardware, CapturePlan, ClockDivider, Completions, Half, HardwareError};
use crate::shared::{DeviceState, SharedState};
use crate::transport::{write_with_retry, LinkSink, Transport};
use crate::{ABORT_REPEAT_MICROS, MIN_SAMPLE_LIMIT, SYS_CLOCK_HZ};

/// Why arming was refused. The device stays idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmError {
    Config(ConfigError),
    Layout(LayoutError),
}

/// Why a run was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Both halves completed before either was drained.
    BothHalvesComplete,
    /// More than one completed half was waiting to be drained.
    HalfOverrun,
    /// After a drain the other half was no longer being written.
    DrainTooSlow,
    ProducerFault,
    /// Hardware finished without delivering the requested samples.
    MissingSamples,
    AnalogRateTooHigh,
    Hardware(HardwareError),
}

impl AbortReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            AbortReason::BothHalvesComplete => "BothHalvesComplete",
            AbortReason::HalfOverrun => "HalfOverrun",
            AbortReason::DrainTooSlow => "DrainTooSlow",
            AbortReason::ProducerFault => "ProducerFault",
            AbortReason::MissingSamples => "MissingSamples",
            AbortReason::AnalogRateTooHigh => "AnalogRateTooHigh",
            AbortReason::Hardware(err) => err.as_str(),
        }
    }
}

/// Bookkeeping for one armed run.
struct Run {
    config: ChannelConfig,
    plan: CapturePlan,
    encoder: SliceEncoder,
    pending: Completions,
    completed_halves: u64,
    drained_halves: u64,
    sent_samples: u64,
    stop_requested: bool,
}

impl Run {
    /// Samples to encode from the next half, accounting them as sent.
    fn take_slice_count(&mut self) -> usize {
        let mut count = u64::from(self.plan.layout.samples_per_half);
        if !self.config.continuous {
            let remaining = u64::from(self.config.sample_limit).saturating_sub(self.sent_samples);
            count = count.min(remaining);
        }
        self.sent_samples += count;
        count as usize
    }

    fn limit_reached(&self) -> bool {
        self.sent_samples >= u64::from(self.config.sample_limit)
    }
}

/// Device acquisition state machine.
///
/// Owns the published [`DeviceState`]. Requests from the command context are
/// picked up by comparing the shared request counters with the last values seen.
pub struct Acquisition {
    pin_mode: PinMode,
    state: DeviceState,
    run: Option<Run>,
    seen_arm: u32,
    seen_stop: u32,
    seen_reset: u32,
    last_abort: Option<AbortReason>,
    last_arm_error: Option<ArmError>,
    abort_notice_at: Option<u64>,
    last_byte_count: Option<u32>,
}

impl Acquisition {
    pub const fn new(pin_mode: PinMode) -> Self {
        Self {
            pin_mode,
            state: DeviceState::Idle,
            run: None,
            seen_arm: 0,
            seen_stop: 0,
            seen_reset: 0,
            last_abort: None,
            last_arm_error: None,
            abort_notice_at: None,
            last_byte_count: None,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn last_abort(&self) -> Option<AbortReason> {
        self.last_abort
    }

    pub fn last_arm_error(&self) -> Option<ArmError> {
        self.last_arm_error
    }

    /// Byte count reported in the most recent trailer.
    pub fn last_byte_count(&self) -> Option<u32> {
        self.last_byte_count
    }

    /// The plan of the run in progress.
    pub fn plan(&self) -> Option<&CapturePlan> {
        self.run.as_ref().map(|run| &run.plan)
    }

    /// Advance by one step. Never blocks on the hardware; may wait briefly on the transport.
    pub fn service<H, T>(&mut self, shared: &SharedState, hw: &mut H, link: &mut T)
    where
        H: CaptureHardware,
        T: Transport + ?Sized,
    {
        self.take_requests(shared, hw);

        match self.state {
            DeviceState::Idle | DeviceState::Started => {}
            DeviceState::Sending => {
                self.poll_completions(hw);
                self.drain(hw, link);
            }
            DeviceState::DmaDone => self.drain(hw, link),
            DeviceState::SamplesSent => self.finish(hw, link),
            DeviceState::Aborted => self.signal_abort(hw, link),
        }

        shared.publish_state(self.state);
    }

    fn set_state(&mut self, state: DeviceState) {
        if self.state != state {
            log::debug!("state {} -> {}", self.state.as_str(), state.as_str());
            self.state = state;
        }
    }

    fn take_requests<H: CaptureHardware>(&mut self, shared: &SharedState, hw: &mut H) {
        let reset = shared.reset_requests();
        if reset != self.seen_reset {
            self.seen_reset = reset;
            log::info!("reset requested in {}", self.state.as_str());
            self.enter_idle(hw);
        }

        let stop = shared.stop_requests();
        if stop != self.seen_stop {
            self.seen_stop = stop;
            match self.state {
                DeviceState::Aborted | DeviceState::Started => self.enter_idle(hw),
                DeviceState::Sending | DeviceState::DmaDone => {
                    if let Some(run) = self.run.as_mut() {
                        run.stop_requested = true;
                    }
                }
                DeviceState::Idle | DeviceState::SamplesSent => {}
            }
        }

        let arm = shared.arm_requests();
        if arm != self.seen_arm {
            self.seen_arm = arm;
            if self.state == DeviceState::Idle {
                self.arm(shared.snapshot(), hw);
            } else {
                log::warn!("arm ignored in {}", self.state.as_str());
            }
        }
    }

    /// Entering idle always tears the hardware down and forgets the run.
    fn enter_idle<H: CaptureHardware>(&mut self, hw: &mut H) {
        hw.reset();
        self.run = None;
        self.abort_notice_at = None;
        self.set_state(DeviceState::Idle);
    }

    fn abort<H: CaptureHardware>(&mut self, hw: &mut H, reason: AbortReason) {
        if let Some(run) = self.run.as_ref() {
            log::error!(
                "run aborted: {} (completed {}, drained {}, sent {})",
                reason.as_str(),
                run.completed_halves,
                run.drained_halves,
                run.sent_samples
            );
        } else {
            log::error!("run aborted: {}", reason.as_str());
        }
        hw.halt();
        self.last_abort = Some(reason);
        self.abort_notice_at = None;
        self.set_state(DeviceState::Aborted);
    }

    fn arm<H: CaptureHardware>(&mut self, mut config: ChannelConfig, hw: &mut H) {
        self.set_state(DeviceState::Started);
        self.last_abort = None;
        self.last_arm_error = None;

        // Bits 1..3 of the rate are side-channel flags the host may set.
        let flags = (config.sample_rate & 0xE) as u8;
        config.sample_rate &= !1;
        config.sample_limit = config
            .sample_limit
            .max(MIN_SAMPLE_LIMIT)
            .checked_next_multiple_of(4)
            .unwrap_or(u32::MAX & !3);

        let format = match config.slice_format(self.pin_mode) {
            Ok(format) => format,
            Err(err) => return self.refuse(ArmError::Config(err)),
        };
        let layout = match BufferLayout::plan(
            &format,
            config.sample_limit,
            config.continuous,
            hw.arena().len(),
        ) {
            Ok(layout) => layout,
            Err(err) => return self.refuse(ArmError::Layout(err)),
        };

        let digital_divider = (format.nibbles > 0)
            .then(|| ClockDivider::for_rate(SYS_CLOCK_HZ, config.sample_rate));
        let analog_divider = if format.analog_count > 0 {
            match ClockDivider::for_adc(config.sample_rate, format.analog_count) {
                Some(div) => Some(div),
                // Nothing is configured yet; the host still sees `!!!` and acknowledges it.
                None => return self.abort(hw, AbortReason::AnalogRateTooHigh),
            }
        } else {
            None
        };

        let plan = CapturePlan {
            format,
            layout,
            sample_rate: config.sample_rate,
            digital_divider,
            analog_divider,
        };
        log::info!(
            "arm: rate {} limit {} cont {} flags {:#x} mode {:?} d {:#x} a {:#x}",
            config.sample_rate,
            config.sample_limit,
            config.continuous,
            flags,
            format.mode,
            config.digital_mask,
            config.analog_mask
        );
        log::info!(
            "layout: {} chunks of {} bytes, {} samples/half, halves {:?}, chain {:?}",
            layout.chunks,
            layout.chunk_bytes,
            layout.samples_per_half,
            layout.expected_halves,
            layout.chain
        );

        if let Err(err) = hw.configure(&plan) {
            return self.abort(hw, AbortReason::Hardware(err));
        }

        self.run = Some(Run {
            config,
            plan,
            encoder: SliceEncoder::new(format),
            pending: Completions::NONE,
            completed_halves: 0,
            drained_halves: 0,
            sent_samples: 0,
            stop_requested: false,
        });
        hw.start();
        self.set_state(DeviceState::Sending);
    }

    fn refuse(&mut self, err: ArmError) {
        log::warn!("arm refused: {:?}", err);
        self.last_arm_error = Some(err);
        self.set_state(DeviceState::Idle);
    }

    /// Count half completions while the hardware runs.
    fn poll_completions<H: CaptureHardware>(&mut self, hw: &mut H) {
        if self.state != DeviceState::Sending {
            return;
        }
        let Some(run) = self.run.as_mut() else {
            return;
        };

        if hw.producer_fault() {
            return self.abort(hw, AbortReason::ProducerFault);
        }

        run.pending |= hw.take_completions();
        let checked = run.plan.layout.overflow_checked();
        let h0 = run.plan.completion_mask(Half::H0);
        let h1 = run.plan.completion_mask(Half::H1);

        let mut done = run.stop_requested;
        if !done {
            if checked && run.pending.intersects(h0) && run.pending.intersects(h1) {
                return self.abort(hw, AbortReason::BothHalvesComplete);
            }
            // Halves complete in order; count the one due next first.
            let (first, second) = match Half::from_index(run.completed_halves) {
                Half::H0 => (h0, h1),
                Half::H1 => (h1, h0),
            };
            for mask in [first, second] {
                if run.pending.contains(mask) {
                    run.pending.remove(mask);
                    run.completed_halves += 1;
                }
            }

            if checked && run.completed_halves - run.drained_halves > 1 {
                return self.abort(hw, AbortReason::HalfOverrun);
            }
            done = run
                .plan
                .layout
                .expected_halves
                .is_some_and(|expected| run.completed_halves >= u64::from(expected));
        }

        if done {
            hw.halt();
            run.pending = Completions::NONE;
            self.set_state(DeviceState::DmaDone);
        }
    }

    /// Encode the oldest completed half, then decide whether the run is over.
    fn drain<H, T>(&mut self, hw: &mut H, link: &mut T)
    where
        H: CaptureHardware,
        T: Transport + ?Sized,
    {
        let Some(run) = self.run.as_mut() else {
            return self.enter_idle(hw);
        };

        if run.completed_halves > run.drained_halves && !run.stop_requested {
            let half = Half::from_index(run.drained_halves);
            let samples = run.take_slice_count();
            let view = run.plan.layout.view(hw.arena(), half);
            let mut sink = LinkSink::new(link);
            let written = run.encoder.encode_half(&view, samples, &mut sink);
            if sink.dropped() > 0 {
                log::warn!("transport dropped {} bytes", sink.dropped());
            }
            run.drained_halves += 1;
            log::trace!("drained {:?}: {} samples, {} bytes", half, samples, written);

            if self.state == DeviceState::Sending && run.plan.layout.overflow_checked() {
                // Pick up a completion that raced the drain before judging the other half.
                self.poll_completions(hw);
                if self.state == DeviceState::Sending
                    && (!hw.is_busy(half.other()) || hw.producer_fault())
                {
                    return self.abort(hw, AbortReason::DrainTooSlow);
                }
            }
        }

        let Some(run) = self.run.as_ref() else {
            return;
        };
        if run.stop_requested {
            if self.state == DeviceState::Sending {
                hw.halt();
            }
            self.set_state(DeviceState::SamplesSent);
        } else if self.state == DeviceState::DmaDone {
            let undrained = run.completed_halves - run.drained_halves;
            if run.limit_reached() || run.config.continuous {
                self.set_state(DeviceState::SamplesSent);
            } else if undrained == 0 {
                self.abort(hw, AbortReason::MissingSamples);
            }
        }
    }

    fn finish<H, T>(&mut self, hw: &mut H, link: &mut T)
    where
        H: CaptureHardware,
        T: Transport + ?Sized,
    {
        let byte_count = self
            .run
            .as_ref()
            .map_or(0, |run| run.encoder.bytes_emitted());
        let trailer = wire::format_trailer(byte_count);
        if write_with_retry(link, trailer.as_bytes()).is_err() {
            log::warn!("trailer not delivered");
        }
        if let Some(run) = self.run.as_ref() {
            log::info!(
                "run complete: {} samples, {} bytes",
                run.sent_samples,
                byte_count
            );
        }
        self.last_byte_count = Some(byte_count);
        self.enter_idle(hw);
    }

    /// Repeat the abort marker until the host acknowledges with `+`.
    fn signal_abort<H, T>(&mut self, hw: &mut H, link: &mut T)
    where
        H: CaptureHardware,
        T: Transport + ?Sized,
    {
        let now = hw.now_micros();
        let due = self
            .abort_notice_at
            .is_none_or(|at| now.saturating_sub(at) >= ABORT_REPEAT_MICROS);
        if due {
            if write_with_retry(link, wire::ABORT_SEQUENCE).is_err() {
                log::warn!("abort marker not delivered");
            }
            self.abort_notice_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimClock, SimHardware, SimLink, SimSample};
    use crate::{commands::CommandProcessor, ARENA_SIZE};
    use pretty_assertions::assert_eq;
    use srpico_protocol::wire::{parse_trailer, Trailer};

    struct Rig {
        clock: SimClock,
        shared: SharedState,
        commands: CommandProcessor,
        acquisition: Acquisition,
        hw: SimHardware,
        link: SimLink,
        output: Vec<u8>,
        states: Vec<DeviceState>,
    }

    impl Rig {
        fn new(source: impl FnMut(u64) -> SimSample + 'static) -> Self {
            let clock = SimClock::default();
            Self {
                hw: SimHardware::new(clock.clone(), ARENA_SIZE, source),
                link: SimLink::new(clock.clone()),
                clock,
                shared: SharedState::new(),
                commands: CommandProcessor::new(PinMode::Base),
                acquisition: Acquisition::new(PinMode::Base),
                output: Vec::new(),
                states: Vec::new(),
            }
        }

        fn host(&mut self, text: &str) {
            for &byte in text.as_bytes() {
                if let Some(resp) = self.commands.feed(byte, &self.shared) {
                    assert_eq!(resp, "*");
                }
            }
        }

        fn step(&mut self, micros: u64) {
            self.clock.advance(micros);
            self.acquisition
                .service(&self.shared, &mut self.hw, &mut self.link);
            self.output.extend(self.link.take_output());
            if self.states.last() != Some(&self.acquisition.state()) {
                self.states.push(self.acquisition.state());
            }
        }

        fn run_until_idle(&mut self, micros: u64, max_steps: usize) {
            for _ in 0..max_steps {
                self.step(micros);
                if self.acquisition.state() == DeviceState::Idle {
                    return;
                }
            }
            panic!("still {:?}", self.acquisition.state());
        }

        fn trailer_count(&self) -> u32 {
            let start = self.output.iter().rposition(|&b| b == b'$').unwrap();
            match parse_trailer(&self.output[start..]) {
                Trailer::Complete { byte_count, .. } => byte_count,
                other => panic!("bad trailer {other:?}"),
            }
        }
    }

    fn constant(digital: u32) -> impl FnMut(u64) -> SimSample {
        move |_| SimSample {
            digital,
            analog: [0; 3],
        }
    }

    #[test]
    fn fixed_run_sends_data_then_trailer() {
        let mut rig = Rig::new(|i| SimSample {
            digital: (i / 100 % 16) as u32,
            analog: [0; 3],
        });
        rig.host("D10\nD11\nD12\nD13\nR100000\nL5000\nF\n");
        rig.run_until_idle(50, 100_000);

        assert_eq!(
            rig.states,
            vec![
                DeviceState::Sending,
                DeviceState::SamplesSent,
                DeviceState::Idle
            ]
        );
        let count = rig.trailer_count();
        assert_eq!(count as usize, rig.output.len() - format!("${count}+").len());
        assert_eq!(rig.acquisition.last_byte_count(), Some(count));
        assert_eq!(rig.shared.state(), DeviceState::Idle);
        assert!(!rig.hw.is_running());
    }

    #[test]
    fn limit_is_rounded_and_rate_made_even() {
        let mut rig = Rig::new(constant(1));
        rig.host("D10\nR100001\nL5\nF\n");
        rig.step(0);

        let plan = *rig.acquisition.plan().unwrap();
        assert_eq!(plan.sample_rate, 100_000);
        rig.run_until_idle(50, 100_000);
        // Raw baseline of 8 nibbles then a run covering the other eight samples.
        assert_eq!(&rig.output[..8], &[0x81; 8]);
    }

    #[test]
    fn arm_without_channels_stays_idle() {
        let mut rig = Rig::new(constant(0));
        rig.host("F\n");
        rig.step(10);

        assert_eq!(rig.acquisition.state(), DeviceState::Idle);
        assert_eq!(
            rig.acquisition.last_arm_error(),
            Some(ArmError::Config(ConfigError::NoChannels))
        );
        assert!(rig.output.is_empty());
        assert_eq!(rig.hw.configure_calls(), 0);
    }

    #[test]
    fn analog_too_fast_aborts() {
        let mut rig = Rig::new(constant(0));
        rig.host("A10\nA11\nR1000000\nF\n");
        rig.step(10);

        assert_eq!(rig.acquisition.state(), DeviceState::Aborted);
        assert_eq!(
            rig.acquisition.last_abort(),
            Some(AbortReason::AnalogRateTooHigh)
        );
        assert_eq!(rig.states, vec![DeviceState::Aborted]);
        assert_eq!(rig.hw.configure_calls(), 0);
        assert!(!rig.hw.is_running());
    }

    #[test]
    fn flag_bits_ride_along_with_the_rate() {
        let mut rig = Rig::new(|i| SimSample {
            digital: (i / 40 % 4) as u32,
            analog: [0; 3],
        });
        rig.host("D10\nD11\nR100007\nL5000\nF\n");
        rig.step(0);

        let plan = *rig.acquisition.plan().unwrap();
        assert_eq!(plan.sample_rate, 100_006);
        assert_eq!(
            plan.digital_divider,
            Some(ClockDivider::for_rate(SYS_CLOCK_HZ, 100_006))
        );
        rig.run_until_idle(50, 100_000);
        let count = rig.trailer_count();
        assert_eq!(count as usize, rig.output.len() - format!("${count}+").len());
    }

    #[test]
    fn d4_limit_inside_a_word_is_sent_in_full() {
        let mut rig = Rig::new(|i| SimSample {
            digital: (i % 16) as u32,
            analog: [0; 3],
        });
        // 20 samples: two whole words and half of a third.
        rig.host("D10\nD11\nD12\nD13\nR100000\nL20\nF\n");
        rig.run_until_idle(50, 100_000);

        let mut expected: Vec<u8> = (0..20u8).map(|i| 0x80 | (i % 16)).collect();
        expected.extend_from_slice(b"$20+");
        assert_eq!(rig.output, expected);
        assert_eq!(rig.acquisition.last_byte_count(), Some(20));
    }

    #[test]
    fn top_rate_runs_the_producer_undivided() {
        let mut rig = Rig::new(constant(1));
        rig.host("D10\nR120000016\nL5000\nF\n");
        rig.step(0);

        let plan = *rig.acquisition.plan().unwrap();
        assert_eq!(plan.sample_rate, 120_000_016);
        assert_eq!(
            plan.digital_divider,
            Some(ClockDivider {
                integer: 1,
                fraction: 0
            })
        );
    }

    #[test]
    fn slow_drain_aborts_and_never_completes() {
        let mut rig = Rig::new(|i| SimSample {
            digital: (i % 2) as u32 * 0x1F,
            analog: [0; 3],
        });
        // Alternating data defeats run-length encoding; a slow link cannot keep up.
        rig.link.set_byte_micros(50);
        rig.host("D10\nD11\nD12\nD13\nD14\nR1000000\nL2000000\nF\n");
        for _ in 0..1_000 {
            rig.step(1_000);
            if rig.acquisition.state() == DeviceState::Aborted {
                break;
            }
        }

        assert_eq!(rig.acquisition.state(), DeviceState::Aborted);
        assert!(!rig.states.contains(&DeviceState::SamplesSent));
        assert!(matches!(
            rig.acquisition.last_abort(),
            Some(AbortReason::DrainTooSlow | AbortReason::HalfOverrun | AbortReason::BothHalvesComplete)
        ));
    }

    #[test]
    fn abort_marker_repeats_until_acknowledged() {
        let mut rig = Rig::new(constant(0));
        rig.host("A10\nA11\nR1000000\nF\n");
        rig.step(10);
        rig.step(10);
        assert_eq!(rig.output, b"!!!");

        rig.step(ABORT_REPEAT_MICROS);
        assert_eq!(rig.output, b"!!!!!!");

        rig.host("+");
        rig.step(10);
        assert_eq!(rig.acquisition.state(), DeviceState::Idle);
        rig.step(ABORT_REPEAT_MICROS);
        assert_eq!(rig.output.len(), 6);
    }

    #[test]
    fn stop_ends_continuous_run_with_trailer() {
        let mut rig = Rig::new(|i| SimSample {
            digital: (i / 7 % 2) as u32,
            analog: [0; 3],
        });
        rig.host("D10\nR1000000\nC\n");
        for _ in 0..50 {
            rig.step(20_000);
        }
        assert_eq!(rig.acquisition.state(), DeviceState::Sending);
        assert!(!rig.output.is_empty());

        rig.host("+");
        rig.run_until_idle(10, 10);
        let count = rig.trailer_count();
        assert_eq!(count as usize, rig.output.len() - format!("${count}+").len());
        assert!(rig.states.contains(&DeviceState::SamplesSent));
    }

    #[test]
    fn reset_tears_down_a_running_capture() {
        let mut rig = Rig::new(constant(3));
        rig.host("D10\nD11\nR5000\nC\n");
        rig.step(10);
        assert_eq!(rig.acquisition.state(), DeviceState::Sending);
        assert!(rig.hw.is_running());

        rig.host("*");
        rig.step(10);
        assert_eq!(rig.acquisition.state(), DeviceState::Idle);
        assert!(!rig.hw.is_running());
        assert!(rig.acquisition.plan().is_none());
    }

    #[test]
    fn stop_while_idle_is_ignored() {
        let mut rig = Rig::new(constant(0));
        rig.host("+");
        rig.step(10);
        assert_eq!(rig.acquisition.state(), DeviceState::Idle);
        assert!(rig.output.is_empty());
    }

    #[test]
    fn producer_fault_aborts() {
        let mut rig = Rig::new(constant(1));
        rig.host("D10\nD11\nD12\nD13\nD14\nR10000\nC\n");
        rig.step(10);
        rig.hw.inject_fault();
        rig.step(10);
        assert_eq!(rig.acquisition.last_abort(), Some(AbortReason::ProducerFault));
    }
}
