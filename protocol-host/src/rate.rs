//! Sample-rate negotiation done on the host before `R` is sent.

use srpico_protocol::MIN_SAMPLE_RATE;
use tracing::warn;

/// ADC reference clock the device divides for analog sampling.
pub const ADC_CLOCK_HZ: u64 = 48_000_000;

/// Highest rate the digital sampler accepts.
pub const MAX_DIGITAL_RATE: u32 = 120_000_000;

/// Bits 1..3 of the rate are passed through to the device untouched.
pub const CFG_BITS_MASK: u32 = 0xE;

/// Highest per-channel rate with `analog_channels` enabled.
pub const fn max_rate_for(analog_channels: u8) -> u32 {
    match analog_channels {
        0 => MAX_DIGITAL_RATE,
        1 => 500_000,
        2 => 250_000,
        _ => 166_667,
    }
}

/// Clamp `requested` to what the device can sample and round it to an integer ADC
/// divisor when analog channels are enabled. The side-channel bits of the request
/// are carried over into the low nibble of the result.
pub fn negotiate_sample_rate(requested: u32, analog_channels: u8) -> u32 {
    let cfg_bits = requested & CFG_BITS_MASK;
    let mut rate = requested;

    let ceiling = max_rate_for(analog_channels);
    if rate > ceiling {
        warn!(requested, ceiling, analog_channels, "sample rate above limit, clamping");
        rate = ceiling;
    }
    if rate < MIN_SAMPLE_RATE {
        warn!(requested, floor = MIN_SAMPLE_RATE, "sample rate below limit, clamping");
        rate = MIN_SAMPLE_RATE;
    }

    if analog_channels > 0 {
        let channels = u64::from(analog_channels);
        let mut divisor = ADC_CLOCK_HZ / (u64::from(rate) * channels);
        if ADC_CLOCK_HZ % divisor != 0 {
            divisor += 1;
        }
        let integral = (ADC_CLOCK_HZ / (divisor * channels)) as u32;
        if integral != rate {
            warn!(from = rate, to = integral, divisor, "rate moved to an integer ADC divisor");
            rate = integral;
        }
    }

    // The low nibble is reserved for the side-channel bits.
    let mut base = rate & !0xF;
    if base < MIN_SAMPLE_RATE {
        base += 0x10;
    }
    let negotiated = base | cfg_bits;
    if cfg_bits != 0 {
        warn!(cfg_bits, negotiated, "side-channel bits embedded in sample rate");
    }
    negotiated
}
