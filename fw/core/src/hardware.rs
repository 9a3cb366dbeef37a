//! Seam between the acquisition state machine and the capture peripherals.
//!
//! A board crate implements [`CaptureHardware`] over its digital sampler, ADC
//! and the pair of chained DMA channels that write each buffer half.

use core::ops::{BitOr, BitOrAssign};

use srpico_protocol::SliceFormat;

use crate::arena::{BufferLayout, ChainMode};
use crate::{ADC_CLOCK_HZ, ADC_MIN_PERIOD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    H0,
    H1,
}

impl Half {
    /// Half filled by the `index`-th completion of a run.
    pub const fn from_index(index: u64) -> Self {
        if index % 2 == 0 {
            Half::H0
        } else {
            Half::H1
        }
    }

    pub const fn other(self) -> Self {
        match self {
            Half::H0 => Half::H1,
            Half::H1 => Half::H0,
        }
    }
}

/// Set of half-complete events raised by the DMA movers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completions(u8);

impl Completions {
    pub const NONE: Self = Self(0);
    pub const DIGITAL_H0: Self = Self(1 << 0);
    pub const DIGITAL_H1: Self = Self(1 << 1);
    pub const ANALOG_H0: Self = Self(1 << 2);
    pub const ANALOG_H1: Self = Self(1 << 3);

    /// Events that together mark `half` as filled.
    pub const fn for_half(half: Half, digital: bool, analog: bool) -> Self {
        let (d, a) = match half {
            Half::H0 => (Self::DIGITAL_H0.0, Self::ANALOG_H0.0),
            Half::H1 => (Self::DIGITAL_H1.0, Self::ANALOG_H1.0),
        };
        let mut bits = 0;
        if digital {
            bits |= d;
        }
        if analog {
            bits |= a;
        }
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for Completions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Completions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Integer plus 1/256 fractional clock divider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockDivider {
    pub integer: u32,
    pub fraction: u8,
}

impl ClockDivider {
    /// Divider that clocks one digital sample per `rate` Hz from `sys_clock_hz`.
    ///
    /// Rates at or above the system clock run undivided; an integer part of 0
    /// would select the slowest divider instead.
    pub const fn for_rate(sys_clock_hz: u32, rate: u32) -> Self {
        if rate >= sys_clock_hz {
            return Self {
                integer: 1,
                fraction: 0,
            };
        }
        let integer = sys_clock_hz / rate;
        let remainder = (sys_clock_hz % rate) as u64;
        Self {
            integer,
            fraction: (remainder * 256 / rate as u64) as u8,
        }
    }

    /// ADC period in reference clock cycles for `rate` samples per second on each of
    /// `channels` round-robin inputs. `None` when the converter cannot keep up.
    pub const fn for_adc(rate: u32, channels: u8) -> Option<Self> {
        let conversions = rate as u64 * channels as u64;
        if conversions == 0 {
            return None;
        }
        let period = ADC_CLOCK_HZ as u64 / conversions;
        if period < ADC_MIN_PERIOD as u64 {
            return None;
        }
        Some(Self {
            integer: period as u32,
            fraction: 0,
        })
    }
}

/// Everything the peripherals need to start one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePlan {
    pub format: SliceFormat,
    pub layout: BufferLayout,
    pub sample_rate: u32,
    pub digital_divider: Option<ClockDivider>,
    pub analog_divider: Option<ClockDivider>,
}

impl CapturePlan {
    pub const fn chain(&self) -> ChainMode {
        self.layout.chain
    }

    pub const fn completion_mask(&self, half: Half) -> Completions {
        Completions::for_half(
            half,
            self.format.nibbles > 0,
            self.format.analog_count > 0,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareError {
    ArenaTooSmall,
    Unsupported,
}

impl HardwareError {
    pub const fn as_str(self) -> &'static str {
        match self {
            HardwareError::ArenaTooSmall => "ArenaTooSmall",
            HardwareError::Unsupported => "Unsupported",
        }
    }
}

pub trait CaptureHardware {
    /// Memory both halves live in. Only read while the matching half is not being written.
    fn arena(&self) -> &[u8];

    /// Program producers and DMA for `plan` without starting them.
    fn configure(&mut self, plan: &CapturePlan) -> Result<(), HardwareError>;

    fn start(&mut self);

    /// Half-complete events raised since the previous call.
    fn take_completions(&mut self) -> Completions;

    /// Whether the DMA mover for `half` is currently writing it.
    fn is_busy(&self, half: Half) -> bool;

    /// A producer FIFO stalled or overran since `start`.
    fn producer_fault(&self) -> bool;

    /// Break the DMA chain and mask completion events; buffer contents stay valid.
    fn halt(&mut self);

    /// Stop producers, abort DMA and drop every pending event.
    fn reset(&mut self);

    fn now_micros(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_sets() {
        let h0 = Completions::for_half(Half::H0, true, true);
        assert_eq!(h0, Completions::DIGITAL_H0 | Completions::ANALOG_H0);
        let mut pending = Completions::DIGITAL_H0;
        assert!(!pending.contains(h0));
        pending |= Completions::ANALOG_H0;
        assert!(pending.contains(h0));
        pending.remove(h0);
        assert!(pending.is_empty());
        assert!(!Completions::for_half(Half::H1, true, false).intersects(h0));
    }

    #[test]
    fn digital_divider_keeps_fraction() {
        let div = ClockDivider::for_rate(120_000_000, 7_000_000);
        assert_eq!(div.integer, 17);
        assert_eq!(div.fraction, 36);
    }

    #[test]
    fn digital_divider_never_drops_below_one() {
        let top = ClockDivider::for_rate(120_000_000, 120_000_016);
        assert_eq!(
            top,
            ClockDivider {
                integer: 1,
                fraction: 0
            }
        );
        assert_eq!(ClockDivider::for_rate(120_000_000, 120_000_000), top);
        assert_eq!(ClockDivider::for_rate(120_000_000, 119_999_999).integer, 1);
    }

    #[test]
    fn adc_divider_limits_rate() {
        assert_eq!(
            ClockDivider::for_adc(500_000, 1),
            Some(ClockDivider {
                integer: 96,
                fraction: 0
            })
        );
        assert_eq!(ClockDivider::for_adc(250_001, 2), None);
        assert_eq!(ClockDivider::for_adc(5_000, 3).map(|d| d.integer), Some(3200));
    }

    #[test]
    fn halves_alternate() {
        assert_eq!(Half::from_index(0), Half::H0);
        assert_eq!(Half::from_index(3), Half::H1);
        assert_eq!(Half::H0.other(), Half::H1);
    }
}
