//! Receive session for one armed run.
//!
//! The session never touches the link itself: the caller feeds it whatever the
//! port returned and acts on the returned [`Progress`].

use srpico_protocol::wire::{self, Trailer};
use srpico_protocol::{AnalogScale, SliceDecoder, SliceFormat, StreamEnd};
use tracing::{debug, error, info, warn};

use crate::batch::{Collector, SampleBatch, SampleSink};
use crate::error::HostError;
use crate::stage::TriggerStage;
use crate::trigger::TriggerMatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Idle,
    /// Sample data is streaming.
    Active,
    /// `$` seen; waiting for the rest of the byte-count trailer.
    Stopped,
    Abort,
}

/// What the caller should do after a [`Receiver::feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub state: RxState,
    /// Send the stop byte `+` to the device.
    pub send_stop: bool,
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub samples: u64,
    /// Data and run bytes consumed by the decoder.
    pub host_bytes: u64,
    /// Count reported in the device trailer, if one arrived.
    pub device_bytes: Option<u32>,
    pub trigger_at: Option<u64>,
    pub error: Option<HostError>,
}

impl RunSummary {
    /// Both sides agree on the number of bytes sent.
    pub fn bytes_match(&self) -> bool {
        self.device_bytes
            .is_some_and(|count| counts_agree(count, self.host_bytes))
    }
}

/// The device counter is 32 bits wide and wraps on long continuous runs.
fn counts_agree(device: u32, host: u64) -> bool {
    device == host as u32
}

pub struct Receiver<M> {
    decoder: SliceDecoder,
    stage: TriggerStage<M>,
    scales: Vec<AnalogScale>,
    batch: SampleBatch,
    pending: Vec<u8>,
    state: RxState,
    host_bytes: u64,
    device_bytes: Option<u32>,
    stop_sent: bool,
    error: Option<HostError>,
}

impl<M: TriggerMatcher> Receiver<M> {
    /// `scales` holds one entry per enabled analog channel; missing entries use the default.
    pub fn new(format: SliceFormat, stage: TriggerStage<M>, mut scales: Vec<AnalogScale>) -> Self {
        let analog = format.analog_count as usize;
        scales.resize(analog, AnalogScale::DEFAULT);
        Self {
            decoder: SliceDecoder::new(format),
            stage,
            scales,
            batch: SampleBatch::new(format.digital_count > 0, analog),
            pending: Vec::new(),
            state: RxState::Active,
            host_bytes: 0,
            device_bytes: None,
            stop_sent: false,
            error: None,
        }
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    pub fn sent_samples(&self) -> u64 {
        self.stage.sent()
    }

    pub fn host_bytes(&self) -> u64 {
        self.host_bytes
    }

    /// Process bytes read from the device.
    pub fn feed<S: SampleSink + ?Sized>(&mut self, bytes: &[u8], sink: &mut S) -> Progress {
        match self.state {
            RxState::Idle | RxState::Abort => {
                if !bytes.is_empty() {
                    debug!(len = bytes.len(), "ignoring bytes after end of run");
                }
            }
            RxState::Active => {
                self.pending.extend_from_slice(bytes);
                self.decode(sink);
            }
            RxState::Stopped => {
                self.pending.extend_from_slice(bytes);
                self.check_trailer();
            }
        }

        let send_stop =
            self.state == RxState::Active && self.stage.is_complete() && !self.stop_sent;
        if send_stop {
            debug!(sent = self.stage.sent(), bytes = self.host_bytes, "sample limit reached");
            self.stop_sent = true;
        }
        Progress {
            state: self.state,
            send_stop,
        }
    }

    fn decode<S: SampleSink + ?Sized>(&mut self, sink: &mut S) {
        let decoded = {
            let mut collector = Collector {
                batch: &mut self.batch,
                scales: &self.scales,
            };
            self.decoder.decode(&self.pending, &mut collector)
        };
        self.host_bytes += decoded.consumed as u64;
        debug!(
            consumed = decoded.consumed,
            samples = self.batch.len(),
            "decoded batch"
        );
        self.stage.push(&self.batch, sink);
        self.batch.clear();
        self.pending.drain(..decoded.consumed);

        match decoded.end {
            None => {}
            Some(StreamEnd::Trailer) => {
                self.state = RxState::Stopped;
                self.check_trailer();
            }
            Some(StreamEnd::Abort(byte)) => {
                if byte == wire::ABORT_MARKER {
                    error!("device aborted the run");
                    self.error = Some(HostError::Aborted);
                } else {
                    error!(byte, "protocol desync");
                    self.error = Some(HostError::Desync(byte));
                }
                self.pending.clear();
                self.state = RxState::Abort;
            }
        }
    }

    fn check_trailer(&mut self) {
        match wire::parse_trailer(&self.pending) {
            Trailer::Incomplete => debug!("waiting for the rest of the trailer"),
            Trailer::Complete { byte_count, len } => {
                if !counts_agree(byte_count, self.host_bytes) {
                    error!(
                        device = byte_count,
                        host = self.host_bytes,
                        "byte counts differ, data may have been lost"
                    );
                }
                if self.pending.len() > len {
                    warn!(extra = self.pending.len() - len, "bytes after the trailer");
                }
                info!(
                    samples = self.stage.sent(),
                    bytes = byte_count,
                    "run complete"
                );
                self.device_bytes = Some(byte_count);
                self.pending.clear();
                self.state = RxState::Idle;
            }
            Trailer::Malformed => {
                error!("malformed trailer");
                self.error = Some(HostError::MalformedTrailer);
                self.pending.clear();
                self.state = RxState::Abort;
            }
        }
    }

    /// Whether a stop byte must go out before the device will return to idle.
    ///
    /// A streaming run needs `+` to end; an aborted one needs it as acknowledgement.
    pub fn stop_needed(&self) -> bool {
        match self.state {
            RxState::Active => !self.stop_sent,
            RxState::Abort => true,
            RxState::Idle | RxState::Stopped => false,
        }
    }

    pub fn mark_stop_sent(&mut self) {
        self.stop_sent = true;
    }

    /// End the session and free per-run buffers. Safe to call any number of times.
    pub fn finish(&mut self) -> RunSummary {
        if self.state != RxState::Idle {
            debug!(state = ?self.state, "finishing receive session");
        }
        if matches!(self.state, RxState::Active | RxState::Stopped) {
            self.state = RxState::Idle;
        }
        self.pending = Vec::new();
        self.batch.clear();
        self.stage.release();
        RunSummary {
            samples: self.stage.sent(),
            host_bytes: self.host_bytes,
            device_bytes: self.device_bytes,
            trigger_at: self.stage.trigger_at(),
            error: self.error.clone(),
        }
    }
}
