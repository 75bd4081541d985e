//! Connection drivers
//!
//! Each link owns one dedicated reader thread. The thread only recognises
//! frames and queues them; one task per link on a tokio runtime drains the
//! queue, decodes and notifies listeners in arrival order, so slow listeners
//! never stall reception. Anything that waits for a reply runs on the
//! caller's task.
//!
//! The byte-level collaborators are small traits so a serial port driver, a
//! socket, or an in-memory channel can sit underneath:
//!
//! - [`ByteSink`] / [`ByteSource`] for the MX1 serial stream
//! - [`ByteSink`] / [`DatagramSource`] for ZCAN over UDP

use std::io::{self, Read, Write};
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, trace, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::config::LinkConfig;
use crate::correlator::ReplyCorrelator;
use crate::dispatch::Dispatcher;
use crate::error::{DccError, Result};
use crate::framer::{Framer, FramerEvent};
use crate::hex;
use crate::mx1::Mx1Codec;
use crate::packet::Packet;
use crate::selector::Selector;
use crate::zcan;

/// How often idle readers wake up to check for close
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Largest datagram the ZCAN reader accepts
pub const MAX_DATAGRAM: usize = 2048;

/// Destination for raw outgoing bytes
pub trait ByteSink: Send + Sync {
    /// Write all of `bytes`
    fn write(&self, bytes: &[u8]) -> io::Result<()>;
}

/// Origin of the raw incoming byte stream
pub trait ByteSource: Send + 'static {
    /// Feed every received byte to `on_byte` until it returns `false` or the
    /// stream ends
    ///
    /// Whenever a read times out without data the loop asks `keep_running`
    /// and returns once it says `false`. Returns `Ok` at end of stream.
    fn read_loop(
        &mut self,
        on_byte: &mut dyn FnMut(u8) -> bool,
        keep_running: &dyn Fn() -> bool,
    ) -> io::Result<()>;
}

/// Origin of incoming datagrams
pub trait DatagramSource: Send + 'static {
    /// Next datagram, or `None` if nothing arrived within the poll interval
    fn recv_datagram(&mut self) -> io::Result<Option<Bytes>>;
}

/// Anything that can transmit a [`Packet`]
pub trait PacketSink {
    /// Encode and send `packet`
    fn send_packet(&self, packet: &Packet) -> Result<()>;
}

impl<T: ByteSink + ?Sized> ByteSink for Arc<T> {
    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        (**self).write(bytes)
    }
}

impl<W: Write + Send> ByteSink for Mutex<W> {
    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(bytes)?;
        writer.flush()
    }
}

/// Sends to the connected peer
impl ByteSink for UdpSocket {
    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let sent = self.send(bytes)?;
        if sent != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("sent {} of {} bytes", sent, bytes.len()),
            ));
        }
        Ok(())
    }
}

/// Bytes pushed into a channel by some other driver
impl ByteSource for mpsc::Receiver<Vec<u8>> {
    fn read_loop(
        &mut self,
        on_byte: &mut dyn FnMut(u8) -> bool,
        keep_running: &dyn Fn() -> bool,
    ) -> io::Result<()> {
        loop {
            let chunk = match self.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => chunk,
                Err(RecvTimeoutError::Timeout) if keep_running() => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Ok(())
                }
            };
            for byte in chunk {
                if !on_byte(byte) {
                    return Ok(());
                }
            }
        }
    }
}

/// Datagrams pushed into a channel by some other driver
impl DatagramSource for mpsc::Receiver<Vec<u8>> {
    fn recv_datagram(&mut self) -> io::Result<Option<Bytes>> {
        match self.recv_timeout(POLL_INTERVAL) {
            Ok(datagram) => Ok(Some(Bytes::from(datagram))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "datagram channel closed",
            )),
        }
    }
}

/// Reads from a socket with a read timeout set
impl DatagramSource for UdpSocket {
    fn recv_datagram(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = [0u8; MAX_DATAGRAM];
        match self.recv(&mut buf) {
            Ok(n) => Ok(Some(Bytes::copy_from_slice(&buf[..n]))),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// [`ByteSource`] over any blocking reader, such as a serial port handle
pub struct ReadSource<R> {
    reader: R,
}

impl<R: Read + Send + 'static> ReadSource<R> {
    /// Wrap a reader
    pub fn new(reader: R) -> Self {
        ReadSource { reader }
    }
}

impl<R: Read + Send + 'static> ByteSource for ReadSource<R> {
    fn read_loop(
        &mut self,
        on_byte: &mut dyn FnMut(u8) -> bool,
        keep_running: &dyn Fn() -> bool,
    ) -> io::Result<()> {
        let mut buf = [0u8; 256];
        loop {
            let n = match self.reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    if !keep_running() {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            for &byte in &buf[..n] {
                if !on_byte(byte) {
                    return Ok(());
                }
            }
        }
    }
}

struct Mx1Shared {
    sink: Box<dyn ByteSink>,
    framer: Mutex<Framer>,
    codec: Mx1Codec,
    // taken on close; the dispatch task ends once the queue is drained
    events: Mutex<Option<UnboundedSender<FramerEvent>>>,
    dispatcher: Arc<Dispatcher>,
    closed: AtomicBool,
}

impl Mx1Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.framer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.dispatcher.close();
        debug!("mx1 link closed");
    }

    fn run_reader(&self, mut source: impl ByteSource) {
        let result = source.read_loop(
            &mut |byte| {
                if self.is_closed() {
                    return false;
                }
                let event = self
                    .framer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_byte(byte);
                if let Some(event) = event {
                    self.hand_off(event);
                }
                true
            },
            &|| !self.is_closed(),
        );

        match result {
            Ok(()) => debug!("mx1 reader: end of stream"),
            Err(e) => error!("mx1 reader: {}", e),
        }
        self.close();
    }

    fn hand_off(&self, event: FramerEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = events.as_ref() {
            // a stopped dispatch task means the link is closing
            let _ = tx.send(event);
        }
    }
}

/// Decode and notify MX1 events one at a time, in the order the reader saw
/// them
async fn run_mx1_dispatch(
    mut events: UnboundedReceiver<FramerEvent>,
    codec: Mx1Codec,
    dispatcher: Arc<Dispatcher>,
) {
    while let Some(event) = events.recv().await {
        match event {
            FramerEvent::Frame(frame) => {
                let raw = frame.clone();
                match codec.decode(frame) {
                    Ok(packet) => dispatcher.dispatch(packet),
                    Err(e @ DccError::CrcMismatch { .. }) => {
                        warn!("mx1: dropping corrupt frame [{}]: {}", hex::format(&raw), e)
                    }
                    Err(e) => warn!("mx1: dropping frame [{}]: {}", hex::format(&raw), e),
                }
            }
            FramerEvent::LinkError => dispatcher.link_error(),
        }
    }
    trace!("mx1 dispatch task done");
}

/// Serial MX1 connection to a command station
pub struct Mx1Link {
    shared: Arc<Mx1Shared>,
    correlator: ReplyCorrelator,
    sequence: AtomicU8,
    config: LinkConfig,
}

impl Mx1Link {
    /// Start the reader thread on `source` and send through `sink`
    ///
    /// Received frames are decoded and dispatched in order by one task on
    /// `runtime`.
    pub fn open<S, K>(source: S, sink: K, config: LinkConfig, runtime: Handle) -> Result<Self>
    where
        S: ByteSource,
        K: ByteSink + 'static,
    {
        config.validate()?;
        let dispatcher = Arc::new(Dispatcher::new());
        let codec = Mx1Codec::new(&config);
        let (tx, rx) = unbounded_channel();
        let shared = Arc::new(Mx1Shared {
            sink: Box::new(sink),
            framer: Mutex::new(Framer::new(config.max_frame_size)),
            codec,
            events: Mutex::new(Some(tx)),
            dispatcher: dispatcher.clone(),
            closed: AtomicBool::new(false),
        });
        runtime.spawn(run_mx1_dispatch(rx, codec, dispatcher.clone()));

        let reader = shared.clone();
        thread::Builder::new()
            .name("mx1-reader".into())
            .spawn(move || reader.run_reader(source))?;
        debug!("mx1 link open");

        Ok(Mx1Link {
            shared,
            correlator: ReplyCorrelator::new(dispatcher),
            sequence: AtomicU8::new(0),
            config,
        })
    }

    /// Encode, frame and write `packet`
    ///
    /// A write failure closes the link.
    pub fn send(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(DccError::ConnectionClosed);
        }
        let wire = self.shared.codec.encode_wire(packet)?;
        debug!("mx1 tx {}", packet);
        trace!("mx1 tx [{}]", hex::format(&wire));
        self.shared.sink.write(&wire).map_err(|e| {
            error!("mx1 write failed: {}", e);
            self.shared.close();
            DccError::Io(e)
        })
    }

    /// Sequence number for the next request; wraps at 255
    pub fn next_sequence(&self) -> u8 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Send `packet` and wait up to the configured reply timeout for the
    /// first reply `selector` accepts and `extractor` can read
    pub async fn request<T, S, E>(&self, packet: &Packet, selector: S, extractor: E) -> Result<T>
    where
        T: Send + 'static,
        S: Selector + 'static,
        E: Fn(&Packet) -> Option<T> + Send + Sync + 'static,
    {
        self.correlator
            .send_and_await(self, packet, selector, extractor, self.config.reply_timeout())
            .await
    }

    /// Listener registry of this link
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.shared.dispatcher
    }

    /// Request/reply matcher of this link
    pub fn correlator(&self) -> &ReplyCorrelator {
        &self.correlator
    }

    /// Settings the link was opened with
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Stop processing input, drop any partial frame and fail outstanding
    /// requests
    ///
    /// The reader thread exits on its next byte or idle poll.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Whether the link has been closed, by the caller or by an I/O failure
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl PacketSink for Mx1Link {
    fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.send(packet)
    }
}

impl Drop for Mx1Link {
    fn drop(&mut self) {
        self.close();
    }
}

struct ZcanShared {
    sink: Box<dyn ByteSink>,
    datagrams: Mutex<Option<UnboundedSender<Bytes>>>,
    dispatcher: Arc<Dispatcher>,
    closed: AtomicBool,
}

impl ZcanShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.datagrams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.dispatcher.close();
        debug!("zcan link closed");
    }

    fn run_reader(&self, mut source: impl DatagramSource) {
        while !self.is_closed() {
            match source.recv_datagram() {
                Ok(Some(datagram)) => self.hand_off(datagram),
                Ok(None) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("zcan reader: end of stream");
                    break;
                }
                Err(e) => {
                    error!("zcan reader: {}", e);
                    break;
                }
            }
        }
        self.close();
    }

    fn hand_off(&self, datagram: Bytes) {
        let datagrams = self.datagrams.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = datagrams.as_ref() {
            let _ = tx.send(datagram);
        }
    }
}

/// Decode and notify ZCAN datagrams one at a time, in arrival order
async fn run_zcan_dispatch(mut datagrams: UnboundedReceiver<Bytes>, dispatcher: Arc<Dispatcher>) {
    while let Some(datagram) = datagrams.recv().await {
        trace!("zcan rx [{}]", hex::format(&datagram));
        match zcan::decode_all(&datagram) {
            Ok(packets) => {
                for packet in packets {
                    dispatcher.dispatch(packet);
                }
            }
            Err(e) => warn!(
                "zcan: dropping malformed datagram [{}]: {}",
                hex::format(&datagram),
                e
            ),
        }
    }
    trace!("zcan dispatch task done");
}

/// ZCAN-over-UDP connection to a command station
pub struct ZcanLink {
    shared: Arc<ZcanShared>,
    correlator: ReplyCorrelator,
    config: LinkConfig,
}

impl ZcanLink {
    /// Start the reader thread on `source` and send through `sink`
    pub fn open<S, K>(source: S, sink: K, config: LinkConfig, runtime: Handle) -> Result<Self>
    where
        S: DatagramSource,
        K: ByteSink + 'static,
    {
        config.validate()?;
        let dispatcher = Arc::new(Dispatcher::new());
        let (tx, rx) = unbounded_channel();
        let shared = Arc::new(ZcanShared {
            sink: Box::new(sink),
            datagrams: Mutex::new(Some(tx)),
            dispatcher: dispatcher.clone(),
            closed: AtomicBool::new(false),
        });
        runtime.spawn(run_zcan_dispatch(rx, dispatcher.clone()));

        let reader = shared.clone();
        thread::Builder::new()
            .name("zcan-reader".into())
            .spawn(move || reader.run_reader(source))?;
        debug!("zcan link open");

        Ok(ZcanLink {
            shared,
            correlator: ReplyCorrelator::new(dispatcher),
            config,
        })
    }

    /// Bind an ephemeral local port and exchange datagrams with `station`
    pub fn connect(
        station: impl ToSocketAddrs,
        config: LinkConfig,
        runtime: Handle,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(station)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let reader = socket.try_clone()?;
        debug!("zcan socket {} -> {}", socket.local_addr()?, socket.peer_addr()?);
        Self::open(reader, socket, config, runtime)
    }

    /// Encode and write `packet`
    ///
    /// A write failure closes the link.
    pub fn send(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(DccError::ConnectionClosed);
        }
        let wire = zcan::encode(packet)?;
        debug!("zcan tx {}", packet);
        self.shared.sink.write(&wire).map_err(|e| {
            error!("zcan write failed: {}", e);
            self.shared.close();
            DccError::Io(e)
        })
    }

    /// Network id stamped on outgoing packets
    pub fn sender_id(&self) -> u16 {
        self.config.sender_id
    }

    /// Send `packet` and wait up to the configured reply timeout for the
    /// first reply `selector` accepts and `extractor` can read
    pub async fn request<T, S, E>(&self, packet: &Packet, selector: S, extractor: E) -> Result<T>
    where
        T: Send + 'static,
        S: Selector + 'static,
        E: Fn(&Packet) -> Option<T> + Send + Sync + 'static,
    {
        self.correlator
            .send_and_await(self, packet, selector, extractor, self.config.reply_timeout())
            .await
    }

    /// Listener registry of this link
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.shared.dispatcher
    }

    /// Request/reply matcher of this link
    pub fn correlator(&self) -> &ReplyCorrelator {
        &self.correlator
    }

    /// Settings the link was opened with
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Stop processing input and fail outstanding requests
    pub fn close(&self) {
        self.shared.close();
    }

    /// Whether the link has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl PacketSink for ZcanLink {
    fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.send(packet)
    }
}

impl Drop for ZcanLink {
    fn drop(&mut self) {
        self.close();
    }
}
