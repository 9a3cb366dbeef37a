#![cfg_attr(not(any(test, feature = "sim")), no_std)]

//! Acquisition core of the SRPICO firmware.
//!
//! The peripheral drivers live in the board crate; everything here talks to
//! them through [`hardware::CaptureHardware`] and [`transport::Transport`], so
//! the state machine and the encoder hand-off run unchanged under test.

pub mod arena;
pub mod commands;
pub mod hardware;
pub mod shared;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod state;
pub mod transport;

use srpico_protocol::PinMode;

use crate::commands::CommandProcessor;
use crate::hardware::CaptureHardware;
use crate::shared::SharedState;
use crate::state::Acquisition;
use crate::transport::{write_with_retry, Transport};

/// Bytes reserved for both buffer halves.
pub const ARENA_SIZE: usize = 220_000;

/// System clock the digital sampler divides down.
pub const SYS_CLOCK_HZ: u32 = 120_000_000;
/// ADC reference clock.
pub const ADC_CLOCK_HZ: u32 = 48_000_000;
/// Clock cycles one ADC conversion takes.
pub const ADC_MIN_PERIOD: u32 = 96;

/// Smallest run the device will arm.
pub const MIN_SAMPLE_LIMIT: u32 = 16;

/// Interval between repeated abort markers.
pub const ABORT_REPEAT_MICROS: u64 = 1_000_000;

/// Single-loop device: command handling and acquisition polled from one context.
///
/// Dual-core targets can instead run [`CommandProcessor`] and [`Acquisition`]
/// separately against one `'static` [`SharedState`].
pub struct Device<H> {
    shared: SharedState,
    commands: CommandProcessor,
    acquisition: Acquisition,
    hardware: H,
}

impl<H: CaptureHardware> Device<H> {
    pub fn new(pin_mode: PinMode, hardware: H) -> Self {
        Self {
            shared: SharedState::new(),
            commands: CommandProcessor::new(pin_mode),
            acquisition: Acquisition::new(pin_mode),
            hardware,
        }
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn acquisition(&self) -> &Acquisition {
        &self.acquisition
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    /// Handle pending host bytes, then advance the acquisition one step.
    pub fn poll<T: Transport>(&mut self, link: &mut T) {
        while let Some(byte) = link.read_byte() {
            if let Some(response) = self.commands.feed(byte, &self.shared) {
                if write_with_retry(link, response.as_bytes()).is_err() {
                    log::warn!("dropped response {}", response.as_str());
                }
            }
        }
        self.acquisition
            .service(&self.shared, &mut self.hardware, link);
    }
}
