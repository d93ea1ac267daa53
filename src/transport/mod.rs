//! Serial transport.
//!
//! A [`Transport`] owns one serial link at a time. A reader thread (`cn0503-rx`) frames the
//! incoming byte stream into lines and pushes them, undecoded, onto a bounded inbound
//! queue. A writer thread (`cn0503-tx`) drains a bounded outbound queue onto the wire.
//! A full inbound queue blocks the reader, so a slow consumer throttles the link instead
//! of losing lines.
//!
//! Ports are opened with a short read timeout so the reader re-checks its link every
//! [`POLL_INTERVAL`]. Closing a link joins both threads, which releases the port before
//! [`Transport::disconnect`] returns and lets the same port be opened again at once.
//!
//! A read or write fault closes the link from inside the failing thread. Either way the
//! caller learns about it from [`Transport::is_connected`] or from a single
//! [`LinkEvent::ConnectionLost`] per link.

pub mod line_reader;
pub mod mock;

use crate::config::ProtocolSettings;
use crate::error::{AppResult, Cn0503Error};
use crossbeam_channel::{bounded, select, unbounded, Receiver, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub use mock::{MockConnector, MockDevice};

/// How often blocked threads re-check whether their link is still running. Also the
/// longest a single port read may block.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The two halves of an open serial port.
pub struct SerialLink {
    /// Owned by the reader thread
    pub reader: Box<dyn Read + Send>,
    /// Owned by the writer thread
    pub writer: Box<dyn Write + Send>,
}

/// Opens serial links and enumerates ports.
///
/// The transport only talks to hardware through this trait, so tests can swap in
/// [`MockConnector`].
pub trait SerialConnector: Send + Sync {
    /// Open `port`. Fails with [`Cn0503Error::Connection`] if the device is missing, busy
    /// or not accessible.
    fn open(&self, port: &str, baud_rate: u32, timeout: Duration) -> AppResult<SerialLink>;

    /// Names of the serial devices present on the host.
    fn scan(&self) -> AppResult<Vec<String>>;
}

/// Host serial ports through the `serialport` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSerial;

#[cfg(feature = "instrument_serial")]
impl SerialConnector for SystemSerial {
    fn open(&self, port: &str, baud_rate: u32, timeout: Duration) -> AppResult<SerialLink> {
        let connection_error = |e: serialport::Error| Cn0503Error::Connection {
            port: port.to_string(),
            reason: e.to_string(),
        };

        let reader = serialport::new(port, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(connection_error)?;
        let writer = reader.try_clone().map_err(connection_error)?;

        debug!("Serial port '{}' opened at {} baud", port, baud_rate);
        Ok(SerialLink {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    fn scan(&self) -> AppResult<Vec<String>> {
        let ports = serialport::available_ports().map_err(std::io::Error::from)?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl SerialConnector for SystemSerial {
    fn open(&self, _port: &str, _baud_rate: u32, _timeout: Duration) -> AppResult<SerialLink> {
        Err(Cn0503Error::SerialFeatureDisabled)
    }

    fn scan(&self) -> AppResult<Vec<String>> {
        Err(Cn0503Error::SerialFeatureDisabled)
    }
}

/// Link status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link on this port was closed, by request or by an I/O fault
    ConnectionLost {
        /// Port name as passed to [`Transport::connect`]
        port: String,
    },
}

/// State shared by one open link and its two threads.
struct LinkHandle {
    port: String,
    running: AtomicBool,
    connected: AtomicBool,
    events: Sender<LinkEvent>,
}

impl LinkHandle {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stop both threads. Signals the loss exactly once per link.
    fn quit(&self) {
        self.running.store(false, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(port = %self.port, "Serial port disconnected");
            let _ = self.events.send(LinkEvent::ConnectionLost {
                port: self.port.clone(),
            });
        }
    }
}

struct ActiveLink {
    handle: Arc<LinkHandle>,
    /// Dropping this wakes the writer
    shutdown: Option<Sender<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl ActiveLink {
    fn stop(&mut self) {
        self.handle.quit();
        self.shutdown.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        // Reads time out every poll interval, so this returns promptly. The port handle
        // is closed once the thread is gone.
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!(port = %self.handle.port, "Reader thread panicked");
            }
        }
    }
}

/// Owner of the serial link and of the inbound and outbound queues.
///
/// The queues outlive individual links, so consumers keep their receivers across
/// reconnects.
pub struct Transport {
    connector: Arc<dyn SerialConnector>,
    settings: ProtocolSettings,
    read_timeout: Duration,
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<Vec<u8>>,
    outbound_tx: Sender<Vec<u8>>,
    outbound_rx: Receiver<Vec<u8>>,
    link_events_tx: Sender<LinkEvent>,
    link_events_rx: Receiver<LinkEvent>,
    active: Mutex<Option<ActiveLink>>,
}

impl Transport {
    /// Transport with no open link. `read_timeout` bounds how long a send waits for
    /// room in the outbound queue.
    pub fn new(
        connector: Arc<dyn SerialConnector>,
        settings: ProtocolSettings,
        read_timeout: Duration,
    ) -> Self {
        let (inbound_tx, inbound_rx) = bounded(settings.inbound_queue_capacity);
        let (outbound_tx, outbound_rx) = bounded(settings.outbound_queue_capacity);
        let (link_events_tx, link_events_rx) = unbounded();
        Self {
            connector,
            settings,
            read_timeout,
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
            link_events_tx,
            link_events_rx,
            active: Mutex::new(None),
        }
    }

    /// Open `port` and start the reader and writer threads.
    ///
    /// An existing link is closed first. Bytes still queued for a previous link are
    /// discarded.
    pub fn connect(&self, port: &str, baud_rate: u32) -> AppResult<()> {
        let mut active = self.active.lock();
        if let Some(mut previous) = active.take() {
            previous.stop();
        }

        info!("COM port is {}", port);
        let link = self
            .connector
            .open(port, baud_rate, self.read_timeout.min(POLL_INTERVAL))?;

        let stale = self.outbound_rx.try_iter().count();
        if stale > 0 {
            debug!(stale, "Discarded queued bytes from the previous link");
        }

        let handle = Arc::new(LinkHandle {
            port: port.to_string(),
            running: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            events: self.link_events_tx.clone(),
        });
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let reader = {
            let handle = handle.clone();
            let inbound = self.inbound_tx.clone();
            let max_line_bytes = self.settings.max_line_bytes;
            let mut port_reader = link.reader;
            thread::Builder::new()
                .name("cn0503-rx".to_string())
                .spawn(move || reader_loop(&mut *port_reader, &handle, &inbound, max_line_bytes))
        };
        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                handle.quit();
                return Err(e.into());
            }
        };

        let writer = {
            let handle = handle.clone();
            let outbound = self.outbound_rx.clone();
            let mut port_writer = link.writer;
            thread::Builder::new()
                .name("cn0503-tx".to_string())
                .spawn(move || writer_loop(&mut *port_writer, &handle, &outbound, &shutdown_rx))
        };
        let writer = match writer {
            Ok(writer) => writer,
            Err(e) => {
                handle.quit();
                return Err(e.into());
            }
        };

        *active = Some(ActiveLink {
            handle,
            shutdown: Some(shutdown_tx),
            reader: Some(reader),
            writer: Some(writer),
        });
        info!("Connected");
        Ok(())
    }

    /// Close the link. Returns whether a link was open.
    ///
    /// Calling this repeatedly is harmless and signals the loss only once.
    pub fn disconnect(&self) -> bool {
        match self.active.lock().take() {
            Some(mut link) => {
                let was_connected = link.handle.is_connected();
                link.stop();
                was_connected
            }
            None => false,
        }
    }

    /// Whether a link is open and has not failed.
    pub fn is_connected(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|link| link.handle.is_connected())
    }

    /// Port of the current link, if it is still up.
    pub fn port(&self) -> Option<String> {
        self.active
            .lock()
            .as_ref()
            .filter(|link| link.handle.is_connected())
            .map(|link| link.handle.port.clone())
    }

    /// Queue `text` for transmission.
    ///
    /// With `slow` every character is queued on its own, `slow_char_delay` apart, so the
    /// device's receive buffer keeps up while it is streaming. The caller's thread does
    /// the pacing.
    pub fn send(&self, text: &str, slow: bool) -> AppResult<()> {
        if !self.is_connected() {
            return Err(Cn0503Error::NotConnected);
        }
        debug!(slow, "Sending {:?}", text);

        if slow {
            let mut buf = [0u8; 4];
            for ch in text.chars() {
                self.enqueue(ch.encode_utf8(&mut buf).as_bytes().to_vec())?;
                thread::sleep(self.settings.slow_char_delay());
            }
            Ok(())
        } else {
            self.enqueue(text.as_bytes().to_vec())
        }
    }

    fn enqueue(&self, bytes: Vec<u8>) -> AppResult<()> {
        match self.outbound_tx.send_timeout(bytes, self.read_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                Err(Cn0503Error::Timeout("space in the outbound queue".to_string()))
            }
            Err(SendTimeoutError::Disconnected(_)) => Err(Cn0503Error::NotConnected),
        }
    }

    /// Serial devices present on the host. Does not touch the current link.
    pub fn scan(&self) -> AppResult<Vec<String>> {
        self.connector.scan()
    }

    /// Receiving end of the inbound line queue.
    pub fn inbound(&self) -> Receiver<Vec<u8>> {
        self.inbound_rx.clone()
    }

    /// Receiving end of the link event channel.
    pub fn link_events(&self) -> Receiver<LinkEvent> {
        self.link_events_rx.clone()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn reader_loop(
    port: &mut (dyn Read + Send),
    link: &LinkHandle,
    inbound: &Sender<Vec<u8>>,
    max_line_bytes: usize,
) {
    while link.is_running() {
        let mut line = match line_reader::read_line(&mut *port, max_line_bytes, &link.running) {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Serial read failed");
                link.quit();
                break;
            }
        };

        // Block while the consumer catches up, but not past the end of this link
        loop {
            match inbound.send_timeout(line, POLL_INTERVAL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(back)) => {
                    if !link.is_running() {
                        return;
                    }
                    line = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    link.quit();
                    return;
                }
            }
        }
    }
    debug!("Reader thread exiting");
}

fn writer_loop(
    port: &mut (dyn Write + Send),
    link: &LinkHandle,
    outbound: &Receiver<Vec<u8>>,
    shutdown: &Receiver<()>,
) {
    while link.is_running() {
        let bytes = select! {
            recv(outbound) -> msg => match msg {
                Ok(bytes) => bytes,
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
            default(POLL_INTERVAL) => continue,
        };
        if let Err(e) = port.write_all(&bytes).and_then(|_| port.flush()) {
            warn!(error = %e, "Failed to do a serial write");
            link.quit();
            break;
        }
    }
    debug!("Writer thread exiting");
}
