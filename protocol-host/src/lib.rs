//! Host side of the SRPICO sampler protocol.
//!
//! Nothing in here performs I/O. The caller owns the serial port, sends the
//! commands produced by [`CaptureSetup`] and feeds every byte read back into a
//! [`Receiver`], which decodes the stream, applies the software trigger and
//! hands ordered samples to a [`SampleSink`].

pub mod batch;
pub mod error;
pub mod rate;
pub mod receiver;
pub mod ring;
pub mod setup;
pub mod stage;
pub mod trigger;

pub use batch::{SampleBatch, SampleSink, SampleView};
pub use error::{HostError, HostResult};
pub use rate::negotiate_sample_rate;
pub use receiver::{Progress, Receiver, RunSummary, RxState};
pub use ring::PretrigRing;
pub use setup::{pin_mode_for, parse_scale, CaptureSettings, CaptureSetup};
pub use stage::{pretrig_entries, TriggerStage};
pub use trigger::{Condition, PatternTrigger, TriggerMatcher};

pub use srpico_protocol::host::{encode_command, trim_response, LINE_TERMINATOR};
pub use srpico_protocol::{AnalogScale, Command, Identity};

use std::time::Duration;

/// How long to wait for a reply to a configuration command.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long to keep draining after a stop before giving up on the trailer.
pub const STOP_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
