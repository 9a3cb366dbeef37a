use core::fmt;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_SAMPLE_LIMIT, DEFAULT_SAMPLE_RATE};

/// Physical pin assignment the firmware was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinMode {
    /// 21 digital inputs on GP2..GP22 plus three ADC inputs on GP26..GP28.
    #[default]
    Base,
    /// 26 digital inputs: GP0..GP22 and GP26..GP28, no analog.
    Dig26,
    /// 32 digital inputs on GP0..GP31, no analog.
    Dig32,
}

impl PinMode {
    pub const fn digital_channels(self) -> u8 {
        match self {
            PinMode::Base => 21,
            PinMode::Dig26 => 26,
            PinMode::Dig32 => 32,
        }
    }

    pub const fn analog_channels(self) -> u8 {
        match self {
            PinMode::Base => 3,
            PinMode::Dig26 | PinMode::Dig32 => 0,
        }
    }

    /// GPIO number wired to digital channel `index`.
    pub const fn digital_gpio(self, index: u8) -> Option<u8> {
        if index >= self.digital_channels() {
            return None;
        }
        Some(match self {
            PinMode::Base => index + 2,
            PinMode::Dig26 if index < 23 => index,
            PinMode::Dig26 => index + 3,
            PinMode::Dig32 => index,
        })
    }

    /// GPIO number wired to analog channel `index`.
    pub const fn analog_gpio(self, index: u8) -> Option<u8> {
        if index >= self.analog_channels() {
            return None;
        }
        Some(26 + index)
    }

    /// Squeeze a raw 32-bit pin read into consecutive channel bits.
    ///
    /// `Dig26` samples GP0..GP31 in one word but GP23..GP25 are not inputs, so
    /// GP26..GP28 are shifted down to channels 23..25.
    pub const fn compact_word(self, raw: u32) -> u32 {
        match self {
            PinMode::Dig26 => (raw & 0x007F_FFFF) | ((raw & 0x1C00_0000) >> 3),
            PinMode::Base | PinMode::Dig32 => raw,
        }
    }
}

/// Channel selection and run parameters, as set by the command interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub digital_mask: u32,
    pub analog_mask: u8,
    pub sample_rate: u32,
    pub sample_limit: u32,
    pub continuous: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            digital_mask: 0,
            analog_mask: 0,
            sample_rate: DEFAULT_SAMPLE_RATE,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            continuous: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    NoChannels,
    NonContiguousDigital { mask: u32 },
    NonContiguousAnalog { mask: u8 },
    TooManyDigital { requested: u8, available: u8 },
    TooManyAnalog { requested: u8, available: u8 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ConfigError::NoChannels => f.write_str("no channels enabled"),
            ConfigError::NonContiguousDigital { mask } => {
                write!(f, "digital channels {mask:#x} must start at 0 and be contiguous")
            }
            ConfigError::NonContiguousAnalog { mask } => {
                write!(f, "analog channels {mask:#x} must start at 0 and be contiguous")
            }
            ConfigError::TooManyDigital {
                requested,
                available,
            } => write!(f, "{requested} digital channels requested, {available} available"),
            ConfigError::TooManyAnalog {
                requested,
                available,
            } => write!(f, "{requested} analog channels requested, {available} available"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ConfigError {}

impl ChannelConfig {
    pub const fn digital_count(&self) -> u8 {
        self.digital_mask.count_ones() as u8
    }

    pub const fn analog_count(&self) -> u8 {
        self.analog_mask.count_ones() as u8
    }

    /// Derive the wire encoding for this configuration.
    pub fn slice_format(&self, pin_mode: PinMode) -> Result<SliceFormat, ConfigError> {
        let digital = self.digital_count();
        let analog = self.analog_count();

        if digital == 0 && analog == 0 {
            return Err(ConfigError::NoChannels);
        }
        if self.digital_mask & self.digital_mask.wrapping_add(1) != 0 {
            return Err(ConfigError::NonContiguousDigital {
                mask: self.digital_mask,
            });
        }
        if self.analog_mask & self.analog_mask.wrapping_add(1) != 0 {
            return Err(ConfigError::NonContiguousAnalog {
                mask: self.analog_mask,
            });
        }
        if digital > pin_mode.digital_channels() {
            return Err(ConfigError::TooManyDigital {
                requested: digital,
                available: pin_mode.digital_channels(),
            });
        }
        if analog > pin_mode.analog_channels() {
            return Err(ConfigError::TooManyAnalog {
                requested: analog,
                available: pin_mode.analog_channels(),
            });
        }

        Ok(SliceFormat::new(self.digital_mask, analog, pin_mode))
    }
}

/// Wire encoding of a run, chosen once at arm time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingMode {
    /// Up to four digital channels, one nibble per sample with embedded run counts.
    D4,
    /// Five or more digital channels, 7-bit fields per sample plus run bytes.
    Wide,
    /// Any analog channel enabled: fixed-width slices, never run-length encoded.
    Analog,
}

/// How many bits of memory the digital producer writes per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadWidth {
    Nibble,
    Byte,
    Half,
    Word,
}

impl ReadWidth {
    pub const fn bits(self) -> u32 {
        match self {
            ReadWidth::Nibble => 4,
            ReadWidth::Byte => 8,
            ReadWidth::Half => 16,
            ReadWidth::Word => 32,
        }
    }
}

/// Everything both codec sides need to agree on for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceFormat {
    pub mode: EncodingMode,
    pub digital_mask: u32,
    pub digital_count: u8,
    pub analog_count: u8,
    /// Digital sample width in 4-bit units (0 when no digital channel is enabled).
    pub nibbles: u8,
    /// 7-bit fields carrying one digital sample on the wire.
    pub digital_fields: u8,
    pub pin_mode: PinMode,
}

impl SliceFormat {
    fn new(digital_mask: u32, analog_count: u8, pin_mode: PinMode) -> Self {
        let digital_count = digital_mask.count_ones() as u8;

        let mut nibbles = 0u8;
        if digital_mask & 0x0000_000F != 0 {
            nibbles += 1;
        }
        if digital_mask & 0x0000_00F0 != 0 {
            nibbles += 1;
        }
        if digital_mask & 0x0000_FF00 != 0 {
            nibbles += 2;
        }
        if digital_mask & 0xFFFF_0000 != 0 {
            nibbles += 4;
        }
        // The analog path reads whole bytes so it never has to split a nibble pair.
        if nibbles == 1 && analog_count > 0 {
            nibbles = 2;
        }

        let mode = if analog_count > 0 {
            EncodingMode::Analog
        } else if nibbles == 1 {
            EncodingMode::D4
        } else {
            EncodingMode::Wide
        };

        Self {
            mode,
            digital_mask,
            digital_count,
            analog_count,
            nibbles,
            digital_fields: digital_count.div_ceil(7),
            pin_mode,
        }
    }

    pub const fn read_width(&self) -> Option<ReadWidth> {
        match self.nibbles {
            0 => None,
            1 => Some(ReadWidth::Nibble),
            2 => Some(ReadWidth::Byte),
            4 => Some(ReadWidth::Half),
            _ => Some(ReadWidth::Word),
        }
    }

    /// Number of pins the digital producer shifts in per sample.
    pub const fn pin_count(&self) -> u8 {
        self.nibbles * 4
    }

    /// Bytes one slice occupies on the wire in the fixed-width modes.
    pub const fn wire_slice_bytes(&self) -> usize {
        self.digital_fields as usize + self.analog_count as usize
    }

    /// Raw (in-memory) slice width in 4-bit units: digital nibbles plus two per analog byte.
    pub const fn raw_slice_nibbles(&self) -> u32 {
        self.nibbles as u32 + 2 * self.analog_count as u32
    }

    /// Digital bytes stored in memory for `samples` samples.
    pub const fn digital_bytes_for(&self, samples: usize) -> usize {
        samples * self.nibbles as usize / 2
    }

    /// Analog bytes stored in memory for `samples` samples.
    pub const fn analog_bytes_for(&self, samples: usize) -> usize {
        samples * self.analog_count as usize
    }
}
