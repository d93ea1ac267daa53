//! In-memory serial link for tests and offline use.
//!
//! `MockConnector` pretends a fixed set of ports exists. Opening one yields a link whose
//! far end is a [`MockDevice`]: the test pushes reply lines into it and inspects what
//! the transport wrote.
//!
//! Like a real tty opened for exclusive use, a port stays busy until both halves of its
//! link are dropped. Opening it again before then fails.

use super::{SerialConnector, SerialLink};
use crate::error::{AppResult, Cn0503Error};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connector over a set of simulated ports.
#[derive(Clone, Default)]
pub struct MockConnector {
    ports: Vec<String>,
    devices: Arc<Mutex<Vec<MockDevice>>>,
}

impl MockConnector {
    /// Connector that pretends `ports` exist.
    pub fn new<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ports: ports.into_iter().map(Into::into).collect(),
            devices: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Far end of the most recently opened link.
    pub fn device(&self) -> Option<MockDevice> {
        self.devices.lock().last().cloned()
    }

    /// Number of links opened so far.
    pub fn open_count(&self) -> usize {
        self.devices.lock().len()
    }
}

impl SerialConnector for MockConnector {
    fn open(&self, port: &str, _baud_rate: u32, timeout: Duration) -> AppResult<SerialLink> {
        if !self.ports.iter().any(|p| p == port) {
            return Err(Cn0503Error::Connection {
                port: port.to_string(),
                reason: "No such device".to_string(),
            });
        }

        let mut devices = self.devices.lock();
        if devices.iter().any(|d| d.port == port && d.is_open()) {
            return Err(Cn0503Error::Connection {
                port: port.to_string(),
                reason: "Device or resource busy".to_string(),
            });
        }

        let (to_host, from_device) = unbounded();
        let device = MockDevice {
            port: port.to_string(),
            to_host: Arc::new(Mutex::new(Some(to_host))),
            writes: Arc::new(Mutex::new(Vec::new())),
            fail_writes: Arc::new(AtomicBool::new(false)),
            in_use: Arc::new(AtomicBool::new(true)),
        };
        let lease = Arc::new(PortLease(device.in_use.clone()));

        let reader = MockReader {
            incoming: from_device,
            pending: VecDeque::new(),
            timeout,
            _lease: lease.clone(),
        };
        let writer = MockWriter {
            writes: device.writes.clone(),
            fail_writes: device.fail_writes.clone(),
            _lease: lease,
        };

        devices.push(device);
        Ok(SerialLink {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    fn scan(&self) -> AppResult<Vec<String>> {
        Ok(self.ports.clone())
    }
}

/// Device side of a simulated link.
#[derive(Clone)]
pub struct MockDevice {
    port: String,
    to_host: Arc<Mutex<Option<Sender<Vec<u8>>>>>,
    writes: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
    fail_writes: Arc<AtomicBool>,
    in_use: Arc<AtomicBool>,
}

impl MockDevice {
    /// Port this link was opened on.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Whether the host still holds either half of this link.
    pub fn is_open(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Send one reply line to the host. A `\n` is appended.
    pub fn push_line(&self, line: &str) {
        self.push_bytes(format!("{line}\n").as_bytes());
    }

    /// Send raw bytes to the host.
    pub fn push_bytes(&self, bytes: &[u8]) {
        if let Some(tx) = self.to_host.lock().as_ref() {
            let _ = tx.send(bytes.to_vec());
        }
    }

    /// Everything the host wrote, decoded lossily.
    pub fn written(&self) -> String {
        let bytes: Vec<u8> = self
            .writes
            .lock()
            .iter()
            .flat_map(|(_, chunk)| chunk.iter().copied())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Each host write as it arrived, with its arrival time.
    pub fn writes(&self) -> Vec<(Instant, Vec<u8>)> {
        self.writes.lock().clone()
    }

    /// Complete lines the host wrote, without terminators.
    pub fn written_lines(&self) -> Vec<String> {
        let text = self.written();
        let complete = text.rsplit_once('\n').map_or("", |(head, _)| head);
        if complete.is_empty() && !text.starts_with('\n') {
            return Vec::new();
        }
        complete.split('\n').map(str::to_string).collect()
    }

    /// Poll until `predicate` accepts the written lines or `timeout` expires.
    pub fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[String]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.written_lines()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Make every subsequent host write fail with a broken pipe.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Unplug the device: the host sees end of stream on its next read.
    pub fn hang_up(&self) {
        self.to_host.lock().take();
    }
}

/// Marks the port busy while either half of a link is alive.
struct PortLease(Arc<AtomicBool>);

impl Drop for PortLease {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct MockReader {
    incoming: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    timeout: Duration,
    _lease: Arc<PortLease>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.incoming.recv_timeout(self.timeout) {
                Ok(bytes) => self.pending.extend(bytes),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(ErrorKind::TimedOut, "Operation timed out"))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

struct MockWriter {
    writes: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
    fail_writes: Arc<AtomicBool>,
    _lease: Arc<PortLease>,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "Device unplugged"));
        }
        self.writes.lock().push((Instant::now(), buf.to_vec()));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_port_fails_to_open() {
        let connector = MockConnector::new(["/dev/ttyMOCK0"]);
        assert!(matches!(
            connector.open("/dev/ttyUSB9", 115_200, Duration::from_millis(10)),
            Err(Cn0503Error::Connection { .. })
        ));
        assert_eq!(connector.scan().unwrap(), vec!["/dev/ttyMOCK0"]);
    }

    #[test]
    fn link_carries_bytes_both_ways() {
        let connector = MockConnector::new(["mock"]);
        let mut link = connector
            .open("mock", 115_200, Duration::from_millis(10))
            .unwrap();
        let device = connector.device().unwrap();

        device.push_line("RESP: IDLE=1");
        let mut buf = [0u8; 64];
        let n = link.reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"RESP: IDLE=1\n");

        link.writer.write_all(b"IDLE?\nODR").unwrap();
        assert_eq!(device.written_lines(), vec!["IDLE?"]);

        device.hang_up();
        assert_eq!(link.reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn reader_times_out_without_data() {
        let connector = MockConnector::new(["mock"]);
        let mut link = connector
            .open("mock", 115_200, Duration::from_millis(5))
            .unwrap();
        let mut buf = [0u8; 1];
        let err = link.reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn port_is_busy_until_both_halves_drop() {
        let connector = MockConnector::new(["mock"]);
        let link = connector
            .open("mock", 115_200, Duration::from_millis(5))
            .unwrap();
        let SerialLink { reader, writer } = link;

        drop(writer);
        assert!(connector.device().unwrap().is_open());
        match connector.open("mock", 115_200, Duration::from_millis(5)) {
            Err(Cn0503Error::Connection { reason, .. }) => {
                assert_eq!(reason, "Device or resource busy")
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("second open of a held port succeeded"),
        }
        assert_eq!(connector.open_count(), 1);

        drop(reader);
        assert!(!connector.device().unwrap().is_open());
        assert!(connector.open("mock", 115_200, Duration::from_millis(5)).is_ok());
        assert_eq!(connector.open_count(), 2);
    }

    #[test]
    fn each_write_is_recorded_separately() {
        let connector = MockConnector::new(["mock"]);
        let mut link = connector
            .open("mock", 115_200, Duration::from_millis(5))
            .unwrap();
        let device = connector.device().unwrap();

        link.writer.write_all(b"O").unwrap();
        link.writer.write_all(b"DR?\n").unwrap();

        let writes = device.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].1, b"O");
        assert_eq!(writes[1].1, b"DR?\n");
        assert!(writes[0].0 <= writes[1].0);
        assert_eq!(device.written_lines(), vec!["ODR?"]);
    }
}
