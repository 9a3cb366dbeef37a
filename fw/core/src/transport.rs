use srpico_protocol::ByteSink;

/// Consecutive writes that may make no progress before a transfer is given up.
pub const WRITE_RETRY_LIMIT: u32 = 10_000;

/// Byte link to the host (USB CDC or UART).
pub trait Transport {
    /// Queue bytes for the host, returning how many were accepted.
    fn write(&mut self, bytes: &[u8]) -> usize;

    /// Next received byte, if one is waiting. Never blocks.
    fn read_byte(&mut self) -> Option<u8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stalled {
    pub written: usize,
}

pub fn write_with_retry<T: Transport + ?Sized>(link: &mut T, data: &[u8]) -> Result<(), Stalled> {
    let mut offset = 0;
    let mut idle = 0;
    while offset < data.len() {
        match link.write(&data[offset..]) {
            0 => {
                idle += 1;
                if idle >= WRITE_RETRY_LIMIT {
                    return Err(Stalled { written: offset });
                }
            }
            n => {
                offset += n;
                idle = 0;
            }
        }
    }
    Ok(())
}

/// Feeds encoder output into a transport, counting what could not be delivered.
pub struct LinkSink<'a, T: ?Sized> {
    link: &'a mut T,
    dropped: usize,
}

impl<'a, T: Transport + ?Sized> LinkSink<'a, T> {
    pub fn new(link: &'a mut T) -> Self {
        Self { link, dropped: 0 }
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl<T: Transport + ?Sized> ByteSink for LinkSink<'_, T> {
    fn send(&mut self, bytes: &[u8]) {
        if let Err(stalled) = write_with_retry(self.link, bytes) {
            // No retransmission: the host sees the gap through the trailer count.
            self.dropped += bytes.len() - stalled.written;
        }
    }
}
