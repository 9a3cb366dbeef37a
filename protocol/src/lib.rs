#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Shared wire format for the SRPICO sampler.
//!
//! Both sides of the link depend on this crate: the firmware encodes captured
//! half-buffers with [`encoder::SliceEncoder`] and the host rebuilds slices with
//! [`decoder::SliceDecoder`]. Channel configuration is never renegotiated on the
//! wire, so both ends derive the active encoding from the same [`ChannelConfig`].

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod channels;
pub mod command;
pub mod decoder;
pub mod encoder;
#[cfg(feature = "alloc")]
pub mod host;
pub mod wire;

pub use channels::{ChannelConfig, ConfigError, EncodingMode, PinMode, ReadWidth, SliceFormat};
pub use command::{AnalogScale, ChannelKind, Command, CommandError, Identity, IdentityError};
pub use decoder::{Decoded, SliceDecoder, SliceSink, StreamEnd};
pub use encoder::{ByteSink, HalfBuffer, SliceEncoder};

/// Version reported in the identify string.
pub const PROTOCOL_VERSION: u8 = 2;

pub const MIN_SAMPLE_RATE: u32 = 5_000;
pub const MAX_SAMPLE_RATE: u32 = 120_000_016;

pub const DEFAULT_SAMPLE_RATE: u32 = 5_000;
pub const DEFAULT_SAMPLE_LIMIT: u32 = 10;

pub const MAX_ANALOG_CHANNELS: usize = 3;
pub const MAX_DIGITAL_CHANNELS: usize = 32;

/// Longest command line the device buffers before discarding it.
pub const COMMAND_BUFFER_SIZE: usize = 20;

/// Every analog sample is a single byte on the wire.
pub const ANALOG_SAMPLE_BYTES: u8 = 1;
