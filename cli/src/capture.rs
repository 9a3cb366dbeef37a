//! One capture run: configure, arm, receive, stop.

use color_eyre::{Result, eyre::bail};
use serde::Serialize;
use srpico_host::rate::CFG_BITS_MASK;
use srpico_host::{
    AnalogScale, CaptureSettings, CaptureSetup, Command, PatternTrigger, RunSummary, RxState,
    SampleSink, parse_scale,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::link::DeviceLink;

const READ_CHUNK: usize = 16 * 1024;

/// A configured device, ready to arm.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub setup: CaptureSetup,
    pub scales: Vec<AnalogScale>,
}

impl Prepared {
    /// Rate the device samples at, without the side-channel bits.
    pub fn sample_rate(&self) -> u32 {
        self.setup.config.sample_rate & !CFG_BITS_MASK
    }
}

/// Reset the device, check what it is, and send the run configuration.
#[instrument(skip_all)]
pub async fn prepare<S: AsyncRead + AsyncWrite + Unpin>(
    link: &mut DeviceLink<S>,
    settings: &CaptureSettings,
    trigger: Option<PatternTrigger>,
) -> Result<Prepared> {
    link.reset().await?;
    let identity = link.identify().await?;
    info!(%identity, "device found");

    let setup = settings.validate(&identity, trigger)?;
    for command in setup.configure_commands() {
        link.expect_ack(&command).await?;
    }
    let mut scales = Vec::new();
    for query in setup.scale_queries() {
        let reply = link.request(&query).await?.unwrap_or_default();
        scales.push(parse_scale(&reply)?);
    }
    Ok(Prepared { setup, scales })
}

enum Event {
    Interrupted,
    DrainExpired,
    Read(usize),
}

/// Arm the run and feed everything the device sends to `sink` until the run ends.
///
/// Cancelling `cancel` stops the run the same way reaching the limit does:
/// `+` goes out and the trailer is awaited for a bounded time.
#[instrument(skip_all)]
pub async fn receive<S, K>(
    link: &mut DeviceLink<S>,
    prepared: &Prepared,
    sink: &mut K,
    cancel: &CancellationToken,
) -> Result<RunSummary>
where
    S: AsyncRead + AsyncWrite + Unpin,
    K: SampleSink + ?Sized,
{
    let stop_drain = link.timing().stop_drain;
    let mut receiver = prepared.setup.receiver(prepared.scales.clone());
    link.send(&prepared.setup.arm_command()).await?;
    info!(
        continuous = prepared.setup.config.continuous,
        trigger = prepared.setup.trigger.is_some(),
        "armed"
    );

    let mut buffer = vec![0u8; READ_CHUNK];
    let mut deadline: Option<Instant> = None;
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled(), if deadline.is_none() => Event::Interrupted,
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                Event::DrainExpired
            }
            read = link.read_some(&mut buffer) => Event::Read(read?),
        };

        match event {
            Event::Interrupted => {
                info!(samples = receiver.sent_samples(), "capture interrupted");
                if receiver.stop_needed() {
                    link.send(&Command::Stop).await?;
                    receiver.mark_stop_sent();
                }
                deadline = Some(Instant::now() + stop_drain);
            }
            Event::DrainExpired => {
                warn!(state = ?receiver.state(), "no end-of-run trailer after stop");
                break;
            }
            Event::Read(0) => {
                receiver.finish();
                bail!("device closed the link mid-run");
            }
            Event::Read(n) => {
                let progress = receiver.feed(&buffer[..n], sink);
                if progress.send_stop {
                    link.send(&Command::Stop).await?;
                    deadline.get_or_insert_with(|| Instant::now() + stop_drain);
                }
                match progress.state {
                    RxState::Idle => break,
                    RxState::Abort => {
                        // `+` acknowledges the abort and returns the device to idle.
                        if receiver.stop_needed() {
                            link.send(&Command::Stop).await?;
                            receiver.mark_stop_sent();
                        }
                        link.drain().await?;
                        break;
                    }
                    RxState::Active | RxState::Stopped => {}
                }
            }
        }
    }
    Ok(receiver.finish())
}

/// What gets printed after a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureReport {
    pub samples: u64,
    pub sample_rate: u32,
    pub host_bytes: u64,
    pub device_bytes: Option<u32>,
    pub bytes_match: bool,
    pub trigger_at: Option<u64>,
    pub error: Option<String>,
}

impl CaptureReport {
    pub fn new(prepared: &Prepared, summary: &RunSummary) -> Self {
        Self {
            samples: summary.samples,
            sample_rate: prepared.sample_rate(),
            host_bytes: summary.host_bytes,
            device_bytes: summary.device_bytes,
            bytes_match: summary.bytes_match(),
            trigger_at: summary.trigger_at,
            error: summary.error.as_ref().map(ToString::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use srpico_fw::sim::{SimClock, SimHardware, SimLink, SimSample};
    use srpico_fw::{ARENA_SIZE, Device};
    use srpico_host::SampleView;
    use srpico_protocol::PinMode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
    use tokio::time::timeout;

    use crate::link::Timing;

    fn timing() -> Timing {
        Timing {
            response: Duration::from_millis(200),
            quiet: Duration::from_millis(20),
            stop_drain: Duration::from_millis(500),
        }
    }

    /// Runs the device core against simulated hardware on the far end of `port`,
    /// advancing the virtual clock by `step_micros` per poll.
    async fn simulated_device(
        mut port: DuplexStream,
        source: impl FnMut(u64) -> SimSample + 'static,
        step_micros: u64,
        done: CancellationToken,
    ) {
        let clock = SimClock::default();
        let mut device = Device::new(
            PinMode::Base,
            SimHardware::new(clock.clone(), ARENA_SIZE, source),
        );
        let mut link = SimLink::new(clock.clone());
        let mut buffer = [0u8; 256];
        while !done.is_cancelled() {
            if let Ok(read) = timeout(Duration::from_millis(1), port.read(&mut buffer)).await {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => link.host_send(&buffer[..n]),
                }
            }
            clock.advance(step_micros);
            device.poll(&mut link);
            let output = link.take_output();
            if !output.is_empty() && port.write_all(&output).await.is_err() {
                break;
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        digital: Vec<u32>,
        interrupt_after: Option<(usize, CancellationToken)>,
    }

    impl SampleSink for Recorder {
        fn samples(&mut self, view: SampleView<'_>) {
            self.digital.extend_from_slice(view.digital());
            if let Some((after, token)) = &self.interrupt_after {
                if self.digital.len() >= *after {
                    token.cancel();
                }
            }
        }
    }

    #[tokio::test]
    async fn fixed_run_over_a_byte_pipe() {
        let (host, port) = duplex(1 << 16);
        let done = CancellationToken::new();
        let source = |i: u64| ((i / 5) % 16) as u32;
        let device = simulated_device(
            port,
            move |i| SimSample {
                digital: source(i),
                analog: [0; 3],
            },
            500,
            done.clone(),
        );

        let host = async {
            let mut link = DeviceLink::new(host, timing());
            let settings = CaptureSettings {
                digital_channels: 4,
                sample_rate: 1_000_000,
                sample_limit: 5_000,
                ..CaptureSettings::default()
            };
            let prepared = prepare(&mut link, &settings, None).await.unwrap();
            let mut recorder = Recorder::default();
            let summary = receive(&mut link, &prepared, &mut recorder, &CancellationToken::new())
                .await
                .unwrap();
            done.cancel();
            (prepared, summary, recorder)
        };

        let ((prepared, summary, recorder), ()) = tokio::join!(host, device);
        assert_eq!(recorder.digital, (0..5_000).map(source).collect::<Vec<_>>());
        let report = CaptureReport::new(&prepared, &summary);
        assert_eq!(report.samples, 5_000);
        assert_eq!(report.sample_rate, 1_000_000);
        assert!(report.bytes_match, "{report:?}");
        assert_eq!(report.error, None);
    }

    #[tokio::test]
    async fn interrupting_a_continuous_run_still_collects_the_trailer() {
        let (host, port) = duplex(1 << 16);
        let done = CancellationToken::new();
        let device = simulated_device(
            port,
            |i| SimSample {
                digital: (i % 3) as u32,
                analog: [0; 3],
            },
            5_000,
            done.clone(),
        );

        let host = async {
            let mut link = DeviceLink::new(host, timing());
            let settings = CaptureSettings {
                digital_channels: 2,
                sample_rate: 1_000_000,
                continuous: true,
                ..CaptureSettings::default()
            };
            let prepared = prepare(&mut link, &settings, None).await.unwrap();
            let cancel = CancellationToken::new();
            let mut recorder = Recorder {
                interrupt_after: Some((1, cancel.clone())),
                ..Recorder::default()
            };
            let summary = receive(&mut link, &prepared, &mut recorder, &cancel)
                .await
                .unwrap();
            done.cancel();
            (summary, recorder)
        };

        let ((summary, recorder), ()) = tokio::join!(host, device);
        assert!(!recorder.digital.is_empty());
        assert_eq!(summary.samples, recorder.digital.len() as u64);
        assert!(summary.bytes_match(), "{summary:?}");
        assert_eq!(summary.error, None);
    }
}
