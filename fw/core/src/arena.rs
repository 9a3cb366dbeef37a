//! Sizing of the two capture halves inside the arena.
//!
//! The arena is laid out as `[D0 | D1 | A0 | A1]`: both digital segments first,
//! then both analog segments. Every offset comes from [`BufferLayout`] and is
//! checked against the arena length when the layout is planned.

use core::ops::Range;

use srpico_protocol::{HalfBuffer, SliceFormat};

use crate::hardware::Half;

/// How the two DMA movers are chained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    /// H0 -> H1 -> H0 ... until halted.
    PingPong,
    /// H0 -> H1 then stop: the run fits in the two halves.
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    NoChannels,
    ArenaTooSmall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Smallest unit holding whole digital words, analog slices and raw slices.
    pub chunk_bytes: usize,
    /// Chunks across both halves; always even.
    pub chunks: usize,
    /// Digital bytes in one half.
    pub digital_bytes: usize,
    /// Analog bytes in one half.
    pub analog_bytes: usize,
    pub samples_per_half: u32,
    /// Half completions a fixed run waits for; `None` when continuous.
    pub expected_halves: Option<u32>,
    pub chain: ChainMode,
}

impl BufferLayout {
    pub fn plan(
        format: &SliceFormat,
        sample_limit: u32,
        continuous: bool,
        arena_len: usize,
    ) -> Result<Self, LayoutError> {
        let digital = format.nibbles as usize;
        let analog = 2 * format.analog_count as usize;
        let total = digital + analog;
        if total == 0 {
            return Err(LayoutError::NoChannels);
        }

        let mut chunk_bytes = total * 32;
        if analog > 0 {
            chunk_bytes *= analog;
        }
        if digital > 0 {
            chunk_bytes *= digital;
        }
        let chunk_samples = chunk_bytes * 2 / total;

        let mut chunks = (arena_len / chunk_bytes) & !1;
        if chunks == 0 {
            return Err(LayoutError::ArenaTooSmall);
        }

        let mut chain = ChainMode::PingPong;
        let needed = ((sample_limit as usize / chunk_samples) + 2) & !1;
        if !continuous && chunks > needed {
            chunks = needed;
            chain = ChainMode::Single;
        }

        let samples_per_half = (chunk_samples * chunks / 2) as u32;
        let expected_halves = if continuous {
            None
        } else {
            Some(sample_limit.div_ceil(samples_per_half))
        };

        Ok(Self {
            chunk_bytes,
            chunks,
            digital_bytes: chunks * chunk_bytes * digital / (total * 2),
            analog_bytes: chunks * chunk_bytes * analog / (total * 2),
            samples_per_half,
            expected_halves,
            chain,
        })
    }

    /// Whether losing a half is possible and must be watched for.
    pub const fn overflow_checked(&self) -> bool {
        matches!(self.chain, ChainMode::PingPong)
    }

    /// Arena bytes used by both halves.
    pub const fn total_bytes(&self) -> usize {
        2 * (self.digital_bytes + self.analog_bytes)
    }

    pub const fn digital_range(&self, half: Half) -> Range<usize> {
        let start = match half {
            Half::H0 => 0,
            Half::H1 => self.digital_bytes,
        };
        start..start + self.digital_bytes
    }

    pub const fn analog_range(&self, half: Half) -> Range<usize> {
        let base = 2 * self.digital_bytes;
        let start = match half {
            Half::H0 => base,
            Half::H1 => base + self.analog_bytes,
        };
        start..start + self.analog_bytes
    }

    /// Typed view of `half` inside `arena`. Segments past the end of `arena` come back empty.
    pub fn view<'a>(&self, arena: &'a [u8], half: Half) -> HalfBuffer<'a> {
        HalfBuffer::new(
            arena.get(self.digital_range(half)).unwrap_or(&[]),
            arena.get(self.analog_range(half)).unwrap_or(&[]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ARENA_SIZE;
    use srpico_protocol::{ChannelConfig, PinMode};

    fn format(digital_mask: u32, analog_mask: u8) -> SliceFormat {
        ChannelConfig {
            digital_mask,
            analog_mask,
            ..ChannelConfig::default()
        }
        .slice_format(PinMode::Base)
        .unwrap()
    }

    #[test]
    fn sizing_invariants_hold_for_every_mask() {
        for digital in 0..=21u32 {
            for analog in 0..=3u32 {
                if digital == 0 && analog == 0 {
                    continue;
                }
                let fmt = format(((1u64 << digital) - 1) as u32, ((1u32 << analog) - 1) as u8);
                for arena in [4_096usize, 65_536, 100_000, ARENA_SIZE] {
                    for (limit, continuous) in [(16, false), (100_000, false), (16, true)] {
                        let Ok(layout) = BufferLayout::plan(&fmt, limit, continuous, arena) else {
                            continue;
                        };
                        assert_eq!(layout.digital_bytes % 4, 0, "d={digital} a={analog}");
                        assert!(layout.total_bytes() <= arena);
                        assert_eq!(
                            layout.digital_bytes,
                            fmt.digital_bytes_for(layout.samples_per_half as usize)
                        );
                        assert_eq!(
                            layout.analog_bytes,
                            fmt.analog_bytes_for(layout.samples_per_half as usize)
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn short_fixed_run_cuts_the_chain() {
        let layout = BufferLayout::plan(&format(0xF, 0), 1000, false, ARENA_SIZE).unwrap();
        assert_eq!(layout.chain, ChainMode::Single);
        assert!(!layout.overflow_checked());
        assert!(layout.samples_per_half as u64 * 2 >= 1000);
        assert_eq!(layout.samples_per_half, 512);
        assert_eq!(layout.expected_halves, Some(2));
    }

    #[test]
    fn long_and_continuous_runs_ping_pong() {
        let long = BufferLayout::plan(&format(0xFF, 0), 10_000_000, false, ARENA_SIZE).unwrap();
        assert_eq!(long.chain, ChainMode::PingPong);
        assert_eq!(long.chunks, (ARENA_SIZE / long.chunk_bytes) & !1);
        assert_eq!(
            long.expected_halves,
            Some(10_000_000u32.div_ceil(long.samples_per_half))
        );

        let cont = BufferLayout::plan(&format(0xFF, 0), 16, true, ARENA_SIZE).unwrap();
        assert_eq!(cont.chain, ChainMode::PingPong);
        assert_eq!(cont.expected_halves, None);
    }

    #[test]
    fn segments_follow_each_other() {
        let layout = BufferLayout::plan(&format(0xF, 0x3), 50_000, false, ARENA_SIZE).unwrap();
        assert_eq!(layout.digital_range(Half::H0).end, layout.digital_range(Half::H1).start);
        assert_eq!(layout.digital_range(Half::H1).end, layout.analog_range(Half::H0).start);
        assert_eq!(layout.analog_range(Half::H0).end, layout.analog_range(Half::H1).start);
        assert_eq!(layout.analog_range(Half::H1).end, layout.total_bytes());
    }

    #[test]
    fn arena_must_hold_two_chunks() {
        assert_eq!(
            BufferLayout::plan(&format(0x1F_FFFF, 0x7), 16, false, 4_096),
            Err(LayoutError::ArenaTooSmall)
        );
    }
}
