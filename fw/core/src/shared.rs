//! State shared between the command context and the acquisition context.
//!
//! Every field has exactly one writer. The command context owns the channel
//! configuration and the request counters; the acquisition context owns the
//! published [`DeviceState`]. Requests are counters rather than flags so the
//! reader can tell a new request from one it already handled without ever
//! writing the field back.

use portable_atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use srpico_protocol::{ChannelConfig, ChannelKind, DEFAULT_SAMPLE_LIMIT, DEFAULT_SAMPLE_RATE};

/// Device-side run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Started,
    Sending,
    DmaDone,
    SamplesSent,
    /// Entered from `Sending` or `DmaDone` on overflow or fault, and straight from
    /// `Started` when the ADC cannot reach the requested rate. Left only by `+` or reset.
    Aborted,
}

impl DeviceState {
    const fn as_u8(self) -> u8 {
        match self {
            DeviceState::Idle => 0,
            DeviceState::Started => 1,
            DeviceState::Sending => 2,
            DeviceState::DmaDone => 3,
            DeviceState::SamplesSent => 4,
            DeviceState::Aborted => 5,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => DeviceState::Started,
            2 => DeviceState::Sending,
            3 => DeviceState::DmaDone,
            4 => DeviceState::SamplesSent,
            5 => DeviceState::Aborted,
            _ => DeviceState::Idle,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            DeviceState::Idle => "Idle",
            DeviceState::Started => "Started",
            DeviceState::Sending => "Sending",
            DeviceState::DmaDone => "DmaDone",
            DeviceState::SamplesSent => "SamplesSent",
            DeviceState::Aborted => "Aborted",
        }
    }
}

pub struct SharedState {
    // Written by the command context.
    digital_mask: AtomicU32,
    analog_mask: AtomicU8,
    sample_rate: AtomicU32,
    sample_limit: AtomicU32,
    continuous: AtomicBool,
    arm_requests: AtomicU32,
    stop_requests: AtomicU32,
    reset_requests: AtomicU32,

    // Written by the acquisition context.
    state: AtomicU8,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub const fn new() -> Self {
        Self {
            digital_mask: AtomicU32::new(0),
            analog_mask: AtomicU8::new(0),
            sample_rate: AtomicU32::new(DEFAULT_SAMPLE_RATE),
            sample_limit: AtomicU32::new(DEFAULT_SAMPLE_LIMIT),
            continuous: AtomicBool::new(false),
            arm_requests: AtomicU32::new(0),
            stop_requests: AtomicU32::new(0),
            reset_requests: AtomicU32::new(0),
            state: AtomicU8::new(DeviceState::Idle.as_u8()),
        }
    }

    /// Copy of the configuration as the next run will see it.
    pub fn snapshot(&self) -> ChannelConfig {
        ChannelConfig {
            digital_mask: self.digital_mask.load(Ordering::Acquire),
            analog_mask: self.analog_mask.load(Ordering::Acquire),
            sample_rate: self.sample_rate.load(Ordering::Acquire),
            sample_limit: self.sample_limit.load(Ordering::Acquire),
            continuous: self.continuous.load(Ordering::Acquire),
        }
    }

    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Release);
    }

    pub fn set_sample_limit(&self, limit: u32) {
        self.sample_limit.store(limit, Ordering::Release);
    }

    pub fn set_continuous(&self, continuous: bool) {
        self.continuous.store(continuous, Ordering::Release);
    }

    /// Enable or disable one channel. Only the command context may call this.
    pub fn set_channel(&self, kind: ChannelKind, channel: u8, enabled: bool) {
        match kind {
            ChannelKind::Digital => {
                let bit = 1u32 << channel;
                let mask = self.digital_mask.load(Ordering::Relaxed);
                let mask = if enabled { mask | bit } else { mask & !bit };
                self.digital_mask.store(mask, Ordering::Release);
            }
            ChannelKind::Analog => {
                let bit = 1u8 << channel;
                let mask = self.analog_mask.load(Ordering::Relaxed);
                let mask = if enabled { mask | bit } else { mask & !bit };
                self.analog_mask.store(mask, Ordering::Release);
            }
        }
    }

    fn bump(counter: &AtomicU32) {
        let next = counter.load(Ordering::Relaxed).wrapping_add(1);
        counter.store(next, Ordering::Release);
    }

    pub fn request_arm(&self) {
        Self::bump(&self.arm_requests);
    }

    pub fn request_stop(&self) {
        Self::bump(&self.stop_requests);
    }

    pub fn request_reset(&self) {
        Self::bump(&self.reset_requests);
    }

    pub fn arm_requests(&self) -> u32 {
        self.arm_requests.load(Ordering::Acquire)
    }

    pub fn stop_requests(&self) -> u32 {
        self.stop_requests.load(Ordering::Acquire)
    }

    pub fn reset_requests(&self) -> u32 {
        self.reset_requests.load(Ordering::Acquire)
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn publish_state(&self, state: DeviceState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}
