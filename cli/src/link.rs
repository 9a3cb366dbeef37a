//! The serial connection to the sampler.
//!
//! Replies carry no terminator: a reply is whatever arrives before the line
//! goes quiet.

use std::time::Duration;

use color_eyre::{Result, eyre::eyre};
use srpico_host::{Command, HostError, Identity, encode_command, trim_response};
use srpico_protocol::ChannelKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace};

/// Timing of the command exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Longest wait for the first byte of a reply.
    pub response: Duration,
    /// Silence that ends a reply or a drain.
    pub quiet: Duration,
    /// How long to keep reading after a stop before giving up on the trailer.
    pub stop_drain: Duration,
}

pub struct DeviceLink<S> {
    stream: S,
    timing: Timing,
}

impl DeviceLink<SerialStream> {
    pub fn open(port: &str, baud_rate: u32, timing: Timing) -> Result<Self> {
        let serial_port_builder = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .timeout(timing.response);

        let serial_port = serial_port_builder
            .open_native_async()
            .map_err(|e| eyre!("Failed to open serial port {port}: {e}"))?;

        tokio_serial::SerialPort::clear(&serial_port, tokio_serial::ClearBuffer::All)
            .map_err(|e| eyre!("Failed to clear serial port buffer: {e}"))?;

        debug!(port, baud_rate, "serial port open");
        Ok(Self::new(serial_port, timing))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> DeviceLink<S> {
    pub fn new(stream: S, timing: Timing) -> Self {
        Self { stream, timing }
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub async fn send(&mut self, command: &Command) -> Result<()> {
        trace!(%command, "send");
        self.stream.write_all(&encode_command(command)).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read whatever the device sends next; `0` means the link closed.
    pub async fn read_some(&mut self, buffer: &mut [u8]) -> Result<usize> {
        Ok(self.stream.read(buffer).await?)
    }

    /// Read until the line has been quiet for `quiet`, giving up after `first` with no byte at all.
    async fn read_until_quiet(&mut self, first: Duration) -> Result<Vec<u8>> {
        let mut reply = Vec::new();
        let mut chunk = [0u8; 64];
        let mut wait = first;
        loop {
            match timeout(wait, self.stream.read(&mut chunk)).await {
                Err(_) | Ok(Ok(0)) => return Ok(reply),
                Ok(Ok(n)) => reply.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
            wait = self.timing.quiet;
        }
    }

    /// Send `command` and return its textual reply, or `None` if the device stayed silent.
    pub async fn request(&mut self, command: &Command) -> Result<Option<String>> {
        self.send(command).await?;
        let raw = self.read_until_quiet(self.timing.response).await?;
        if raw.is_empty() {
            debug!(%command, "no reply");
            return Ok(None);
        }
        let text = String::from_utf8_lossy(trim_response(&raw));
        let reply = strip_ansi_escapes::strip_str(text);
        trace!(%command, reply = %reply, "reply");
        Ok(Some(reply))
    }

    /// Send a configuration command that must be answered with `*`.
    pub async fn expect_ack(&mut self, command: &Command) -> Result<()> {
        match self.request(command).await? {
            Some(reply) if reply == "*" => Ok(()),
            reply => Err(HostError::NoAck {
                command: command.to_string(),
                reply: reply.unwrap_or_default(),
            }
            .into()),
        }
    }

    /// Discard input until the line goes quiet; returns the bytes dropped.
    pub async fn drain(&mut self) -> Result<usize> {
        let dropped = self.read_until_quiet(self.timing.quiet).await?.len();
        if dropped > 0 {
            debug!(dropped, "drained stale input");
        }
        Ok(dropped)
    }

    /// Abandon whatever the device was doing and flush the line.
    pub async fn reset(&mut self) -> Result<()> {
        self.send(&Command::Reset).await?;
        self.drain().await?;
        Ok(())
    }

    pub async fn identify(&mut self) -> Result<Identity> {
        let reply = self
            .request(&Command::Identify)
            .await?
            .ok_or_else(|| eyre!("device did not answer the identify command"))?;
        Ok(Identity::parse(&reply).map_err(HostError::from)?)
    }

    /// Pin name behind each channel, digital first.
    pub async fn pin_names(&mut self, identity: &Identity) -> Result<Vec<(String, String)>> {
        let mut names = Vec::new();
        let channels = (0..identity.digital_channels)
            .map(|index| (ChannelKind::Digital, index))
            .chain((0..identity.analog_channels).map(|index| (ChannelKind::Analog, index)));
        for (kind, index) in channels {
            let label = format!("{}{index}", kind.as_byte() as char);
            let name = self
                .request(&Command::PinName { kind, index })
                .await?
                .unwrap_or_else(|| "?".to_owned());
            names.push((label, name));
        }
        Ok(names)
    }
}
