//! TCP proxy channel.
//!
//! A proxy server multiplexes several boards behind one TCP port. The
//! session has two phases: an ASCII control phase (`sendconn` to list
//! boards, `selectconn:<idx>` to bind one) and a data phase in which
//! every frame travels as one hex-encoded ASCII line. Frame traffic
//! before a successful `selectconn` is refused.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use tracing::{debug, instrument};

use super::traits::{Channel, TransportError};

const LINE_TIMEOUT: Duration = Duration::from_secs(2);

/// A board reachable through the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEntry {
    pub index: u32,
    pub name: String,
}

pub struct ProxyChannel {
    stream: TcpStream,
    addr: String,
    /// Decoded reply bytes not yet consumed by `read_byte`.
    pending: Vec<u8>,
    selected: bool,
}

impl ProxyChannel {
    /// Connects to a proxy server. No board is selected yet.
    #[instrument]
    pub fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).map_err(|e| TransportError::OpenFailed {
            port: addr.to_string(),
            message: e.to_string(),
        })?;
        stream.set_nodelay(true)?;
        debug!(addr, "proxy connected");
        Ok(Self {
            stream,
            addr: addr.to_string(),
            pending: Vec::new(),
            selected: false,
        })
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\n")?;
        Ok(())
    }

    /// Reads one newline-terminated line, waiting at most `timeout`
    /// for the first byte.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let mut line = Vec::new();
        self.stream.set_read_timeout(Some(timeout))?;
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read_exact(&mut byte) {
                Ok(()) => {
                    if byte[0] == b'\n' {
                        let text = String::from_utf8_lossy(&line).trim().to_string();
                        return Ok(Some(text));
                    }
                    line.push(byte[0]);
                }
                Err(e)
                    if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock =>
                {
                    if line.is_empty() {
                        return Ok(None);
                    }
                    // Mid-line stall: keep waiting up to the same bound.
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn control_reply(&mut self, request: &str) -> Result<String, TransportError> {
        self.send_line(request)?;
        match self.read_line(LINE_TIMEOUT)? {
            Some(reply) => Ok(reply),
            None => Err(TransportError::ResponseTimeout {
                timeout_ms: LINE_TIMEOUT.as_millis() as u64,
            }),
        }
    }

    /// Asks the proxy for the boards it can reach.
    pub fn connections(&mut self) -> Result<Vec<ProxyEntry>, TransportError> {
        let reply = self.control_reply("sendconn")?;
        if reply == "errornoavailableconnection" {
            return Err(TransportError::NoAvailableConnection);
        }
        let mut entries = Vec::new();
        for pair in reply.split(':').filter(|p| !p.is_empty()) {
            let (index, name) = pair
                .split_once('/')
                .ok_or_else(|| TransportError::ProxyProtocol {
                    reply: reply.clone(),
                })?;
            let index = index
                .parse::<u32>()
                .map_err(|_| TransportError::ProxyProtocol {
                    reply: reply.clone(),
                })?;
            entries.push(ProxyEntry {
                index,
                name: name.to_string(),
            });
        }
        Ok(entries)
    }

    /// Binds this session to the board at `index`, entering the data
    /// phase.
    #[instrument(skip(self))]
    pub fn select(&mut self, index: u32) -> Result<(), TransportError> {
        let reply = self.control_reply(&format!("selectconn:{index}"))?;
        match reply.as_str() {
            "ACK" => {
                self.selected = true;
                debug!(index, "proxy connection selected");
                Ok(())
            }
            "errornoconnectiononindex" => Err(TransportError::NoConnectionOnIndex { index }),
            "errorupdatedsocketstorage" => Err(TransportError::StorageChanged),
            "errornoavailableconnection" => Err(TransportError::NoAvailableConnection),
            _ => Err(TransportError::ProxyProtocol { reply }),
        }
    }

    fn decode_data_line(&mut self, line: &str) -> Result<(), TransportError> {
        if line == "errornoconnectionset" {
            return Err(TransportError::NoConnectionSelected);
        }
        let bytes = hex::decode(line).map_err(|_| TransportError::ProxyProtocol {
            reply: line.to_string(),
        })?;
        self.pending.extend(bytes);
        Ok(())
    }
}

impl Channel for ProxyChannel {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.selected {
            return Err(TransportError::NoConnectionSelected);
        }
        self.send_line(&hex::encode(bytes))
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        if !self.selected {
            return Err(TransportError::NoConnectionSelected);
        }
        if self.pending.is_empty() {
            match self.read_line(timeout)? {
                Some(line) => self.decode_data_line(&line)?,
                None => return Ok(None),
            }
        }
        if self.pending.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.pending.remove(0)))
        }
    }

    fn flush_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        Ok(())
    }

    fn set_baud_rate(&mut self, _baud: u32) -> Result<(), TransportError> {
        // The proxy owns the physical line; nothing to do here.
        Ok(())
    }

    fn descriptor(&self) -> String {
        format!("proxy://{}", self.addr)
    }
}

impl std::fmt::Debug for ProxyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyChannel")
            .field("addr", &self.addr)
            .field("selected", &self.selected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::thread;

    /// Minimal scripted proxy server: answers the control phase, then
    /// echoes a canned hex line for every data line received.
    fn spawn_proxy(
        connections: &'static str,
        select_reply: &'static str,
        data_reply: &'static str,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut stream = stream;
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                let reply = match line.trim() {
                    "sendconn" => connections,
                    s if s.starts_with("selectconn:") => select_reply,
                    _ => data_reply,
                };
                stream.write_all(reply.as_bytes()).unwrap();
                stream.write_all(b"\n").unwrap();
                line.clear();
            }
        });
        addr
    }

    #[test]
    fn test_connection_listing() {
        let addr = spawn_proxy("0/MB30 sn1234:1/MB60 bench", "ACK", "");
        let mut proxy = ProxyChannel::connect(&addr).unwrap();
        let entries = proxy.connections().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 0);
        assert_eq!(entries[0].name, "MB30 sn1234");
        assert_eq!(entries[1].index, 1);
    }

    #[test]
    fn test_no_available_connection() {
        let addr = spawn_proxy("errornoavailableconnection", "ACK", "");
        let mut proxy = ProxyChannel::connect(&addr).unwrap();
        assert!(matches!(
            proxy.connections(),
            Err(TransportError::NoAvailableConnection)
        ));
    }

    #[test]
    fn test_select_errors() {
        let addr = spawn_proxy("", "errornoconnectiononindex", "");
        let mut proxy = ProxyChannel::connect(&addr).unwrap();
        assert!(matches!(
            proxy.select(3),
            Err(TransportError::NoConnectionOnIndex { index: 3 })
        ));
    }

    #[test]
    fn test_data_refused_before_select() {
        let addr = spawn_proxy("", "ACK", "");
        let mut proxy = ProxyChannel::connect(&addr).unwrap();
        assert!(matches!(
            proxy.write(&[0x01]),
            Err(TransportError::NoConnectionSelected)
        ));
        assert!(matches!(
            proxy.read_byte(Duration::from_millis(10)),
            Err(TransportError::NoConnectionSelected)
        ));
    }

    #[test]
    fn test_data_phase_hex_roundtrip() {
        // Server answers every data line with the hex of an ACK byte.
        let addr = spawn_proxy("0/MB30", "ACK", "06");
        let mut proxy = ProxyChannel::connect(&addr).unwrap();
        proxy.select(0).unwrap();

        proxy.write(&[0x01, 0x00, 0x04, 0xAB, 0xCD]).unwrap();
        let byte = proxy.read_byte(Duration::from_secs(2)).unwrap();
        assert_eq!(byte, Some(0x06));
    }
}
