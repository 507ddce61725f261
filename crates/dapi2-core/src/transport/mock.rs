//! Scripted channel for testing the link layer.

use std::collections::VecDeque;
use std::time::Duration;

use super::traits::{Channel, TransportError};

/// Channel that replays queued bytes and records every write.
///
/// An empty queue reads as a timeout, which is how tests exercise the
/// link's retry paths.
#[derive(Debug, Default)]
pub struct MockChannel {
    incoming: VecDeque<u8>,
    write_log: Vec<Vec<u8>>,
    baud: u32,
    baud_changes: Vec<u32>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            baud: 115_200,
            ..Self::default()
        }
    }

    /// Queues bytes to be returned by subsequent reads.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.incoming.extend(bytes);
    }

    /// All writes captured so far.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.write_log.clone()
    }

    pub fn clear_writes(&mut self) {
        self.write_log.clear();
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Baud rates applied over the channel's lifetime, in order.
    pub fn baud_changes(&self) -> &[u32] {
        &self.baud_changes
    }
}

impl Channel for MockChannel {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.write_log.push(bytes.to_vec());
        Ok(())
    }

    fn read_byte(&mut self, _timeout: Duration) -> Result<Option<u8>, TransportError> {
        Ok(self.incoming.pop_front())
    }

    fn flush_input(&mut self) -> Result<(), TransportError> {
        self.incoming.clear();
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.baud = baud;
        self.baud_changes.push(baud);
        Ok(())
    }

    fn descriptor(&self) -> String {
        format!("mock@{}", self.baud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_and_drain() {
        let mut mock = MockChannel::new();
        mock.queue(&[0x01, 0x02]);

        let t = Duration::from_millis(1);
        assert_eq!(mock.read_byte(t).unwrap(), Some(0x01));
        assert_eq!(mock.read_byte(t).unwrap(), Some(0x02));
        assert_eq!(mock.read_byte(t).unwrap(), None);
    }

    #[test]
    fn test_write_capture() {
        let mut mock = MockChannel::new();
        mock.write(&[0xAA]).unwrap();
        mock.write(&[0xBB, 0xCC]).unwrap();
        assert_eq!(mock.writes(), vec![vec![0xAA], vec![0xBB, 0xCC]]);
    }

    #[test]
    fn test_flush_discards_pending() {
        let mut mock = MockChannel::new();
        mock.queue(&[0x01]);
        mock.flush_input().unwrap();
        assert_eq!(mock.read_byte(Duration::from_millis(1)).unwrap(), None);
    }
}
