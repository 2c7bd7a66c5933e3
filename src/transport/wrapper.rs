//! Per-channel TLS session driver.
//!
//! [`EngineWrapper`] binds one [`TlsEngine`] to one [`Channel`]. It runs the
//! handshake to completion, turns outbound plaintext into records written to
//! the channel, decodes inbound records (buffering partial ones across calls)
//! and coordinates the close_notify exchange.
//!
//! Locking: the outbound path holds the wrap lock, the inbound path holds the
//! unwrap lock, and each individual engine call takes the engine lock. Locks
//! are always taken in that order (wrap, unwrap, engine) and the engine lock is
//! never held across channel I/O.

use super::buffer::{grow, RecordBuf};
use super::engine::{EngineResult, HandshakeStatus, Status, TlsEngine};
use super::{write_all, Channel, ChannelRead};
use crate::error::Error;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

struct WrapState {
    // Ciphertext staging for outbound records.
    dst: RecordBuf,
}

struct UnwrapState {
    // Ciphertext read from the channel. Holds any partial record between calls.
    src: RecordBuf,
    // Bytes of `src` not yet consumed by the engine.
    remaining: usize,
}

/// A TLS session over a non-blocking channel.
pub struct EngineWrapper<C: Channel> {
    channel: Arc<C>,
    engine: Mutex<Box<dyn TlsEngine>>,
    wrap: Mutex<WrapState>,
    unwrap: Mutex<UnwrapState>,
    closed: AtomicBool,
    secure: AtomicBool,
    // Set once the close_notify exchange has run.
    shut_down: AtomicBool,
    packet_size: usize,
    application_size: usize,
    spin_timeout: Option<Duration>,
}

impl<C: Channel> EngineWrapper<C> {
    pub fn new(channel: Arc<C>, engine: Box<dyn TlsEngine>) -> Self {
        let packet_size = engine.packet_buffer_size();
        let application_size = engine.application_buffer_size();
        Self {
            channel,
            engine: Mutex::new(engine),
            wrap: Mutex::new(WrapState {
                dst: RecordBuf::with_capacity(packet_size),
            }),
            unwrap: Mutex::new(UnwrapState {
                src: RecordBuf::with_capacity(packet_size),
                remaining: 0,
            }),
            closed: AtomicBool::new(false),
            secure: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            packet_size,
            application_size,
            spin_timeout: None,
        }
    }

    /// Bounds how long the handshake may wait for the peer. Unbounded by default.
    pub fn with_spin_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.spin_timeout = timeout;
        self
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    pub fn is_secure(&self) -> bool {
        self.secure.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn handshake_status(&self) -> HandshakeStatus {
        self.engine.lock().handshake_status()
    }

    /// True when undecoded ciphertext is buffered from an earlier read.
    pub fn has_leftover(&self) -> bool {
        self.unwrap.lock().remaining > 0
    }

    pub fn application_buffer_size(&self) -> usize {
        self.application_size
    }

    /// Drives the handshake until the engine no longer needs wrap, unwrap or
    /// task steps. Waits for peer data by spinning, so it should only run
    /// while the channel is not being read elsewhere.
    pub fn handshake(&self) -> Result<(), Error> {
        let id = self.channel.id();
        self.engine.lock().begin_handshake()?;

        let mut scratch = RecordBuf::with_capacity(self.application_size);
        let mut status = self.handshake_status();
        while status.is_handshaking() {
            trace!(id, ?status, "Handshake step");
            status = match status {
                HandshakeStatus::NeedTask => {
                    self.run_delegated_tasks();
                    self.handshake_status()
                }
                HandshakeStatus::NeedWrap => {
                    scratch.clear();
                    scratch.flip();
                    self.wrap_and_send(&mut scratch, false)?.handshake_status
                }
                HandshakeStatus::NeedUnwrap => {
                    scratch.clear();
                    self.receive(&mut scratch, true)?.handshake_status
                }
                HandshakeStatus::NotHandshaking | HandshakeStatus::Finished => break,
            };
        }

        let secure = status == HandshakeStatus::Finished
            || (self.is_secure() && !self.is_closed());
        self.secure.store(secure, Ordering::Release);
        debug!(id, secure, "Handshake driver done");
        Ok(())
    }

    fn run_delegated_tasks(&self) {
        loop {
            // Bound separately so the engine lock is released before the task runs.
            let task = self.engine.lock().delegated_task();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Wraps whatever `src` holds into records and writes them to the channel.
    ///
    /// With `ignore_close` unset, a closed wrapper is shut down and the call
    /// fails with [`Error::ChannelClosed`].
    pub fn wrap_and_send(&self, src: &mut RecordBuf, ignore_close: bool) -> Result<EngineResult, Error> {
        if !ignore_close && self.is_closed() {
            self.close()?;
            return Err(Error::ChannelClosed);
        }
        let mut state = self.wrap.lock();
        self.wrap_and_send_locked(&mut state, src, ignore_close)
    }

    fn wrap_and_send_locked(
        &self,
        state: &mut WrapState,
        src: &mut RecordBuf,
        ignore_close: bool,
    ) -> Result<EngineResult, Error> {
        state.dst.clear();
        let result = loop {
            let result = self.engine.lock().wrap(src, &mut state.dst)?;
            if result.status != Status::BufferOverflow {
                break result;
            }
            grow(&mut state.dst, true, self.packet_size);
            debug!(id = self.channel.id(), capacity = state.dst.capacity(), "Grew outbound record buffer");
        };

        if result.status == Status::Closed && !ignore_close {
            self.closed.store(true, Ordering::Release);
            return Ok(result);
        }
        if result.bytes_produced > 0 {
            state.dst.flip();
            write_all(&*self.channel, state.dst.chunk())?;
        }
        Ok(result)
    }

    /// One wrap-and-send step, re-driving the handshake if the engine asks
    /// for it afterwards.
    pub fn send(&self, src: &mut RecordBuf) -> Result<EngineResult, Error> {
        let result = self.wrap_and_send(src, false)?;
        if result.handshake_status.is_handshaking() {
            self.handshake()?;
        }
        Ok(result)
    }

    /// Sends everything in `src`. A [`Status::Closed`] result stops the loop,
    /// shuts the wrapper down and is returned to the caller.
    pub fn send_data(&self, src: &mut RecordBuf) -> Result<EngineResult, Error> {
        let mut result = EngineResult::new(Status::Ok, self.handshake_status(), 0, 0);
        while src.has_remaining() {
            result = self.send(src)?;
            if result.status == Status::Closed {
                self.close()?;
                return Ok(result);
            }
            if result.bytes_consumed == 0
                && result.bytes_produced == 0
                && !self.handshake_status().is_handshaking()
            {
                return Err(Error::HandshakeFailed(
                    "engine accepted no application data".to_string(),
                ));
            }
        }
        Ok(result)
    }

    /// Reads from the channel and unwraps one record into `dst`.
    ///
    /// On entry `dst` is in fill mode; on return it is flipped and holds the
    /// decoded plaintext, and may have been replaced by a larger buffer. With
    /// `allow_spin` unset, a read that finds no data while the buffered bytes
    /// are still short of a record returns [`Status::BufferUnderflow`] and
    /// keeps those bytes for the next call. With `allow_spin` set the call
    /// yields and retries until a record completes.
    pub fn receive(&self, dst: &mut RecordBuf, allow_spin: bool) -> Result<EngineResult, Error> {
        let mut state = self.unwrap.lock();
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let result = self.receive_locked(&mut state, dst, allow_spin);
        if result.is_err() {
            // The session is unusable after a failed read or decode.
            state.remaining = 0;
        }
        result
    }

    fn receive_locked(
        &self,
        state: &mut UnwrapState,
        dst: &mut RecordBuf,
        allow_spin: bool,
    ) -> Result<EngineResult, Error> {
        let UnwrapState { src, remaining } = state;

        let mut need_data = if *remaining > 0 {
            src.compact();
            src.flip();
            false
        } else {
            src.clear();
            true
        };
        let deadline = match (allow_spin, self.spin_timeout) {
            (true, Some(timeout)) => Some(Instant::now() + timeout),
            _ => None,
        };

        let result = loop {
            if need_data {
                let read = self.fill(src, allow_spin, deadline)?;
                src.flip();
                if read == 0 && !allow_spin {
                    *remaining = src.remaining();
                    dst.flip();
                    let status = self.handshake_status();
                    return Ok(EngineResult::new(Status::BufferUnderflow, status, 0, 0));
                }
            }

            let result = self.engine.lock().unwrap(src, dst)?;
            match result.status {
                Status::Ok => break result,
                Status::BufferUnderflow => {
                    if src.limit() == src.capacity() {
                        grow(src, false, self.packet_size);
                    } else {
                        let limit = src.limit();
                        src.set_limit(src.capacity());
                        src.set_position(limit);
                    }
                    need_data = true;
                }
                Status::BufferOverflow => {
                    grow(dst, true, self.application_size);
                    need_data = false;
                }
                Status::Closed => {
                    self.closed.store(true, Ordering::Release);
                    break result;
                }
            }
        };

        *remaining = src.remaining();
        dst.flip();
        Ok(result)
    }

    // One channel read into the fill-mode `src`. Returns 0 only when nothing
    // was available and spinning is not allowed.
    fn fill(&self, src: &mut RecordBuf, allow_spin: bool, deadline: Option<Instant>) -> Result<usize, Error> {
        loop {
            match self.channel.read(src.chunk_mut())? {
                ChannelRead::Data(n) if n > 0 => {
                    src.advance(n);
                    return Ok(n);
                }
                ChannelRead::Eof => return Err(Error::ChannelClosed),
                ChannelRead::Data(_) | ChannelRead::WouldBlock if !allow_spin => return Ok(0),
                ChannelRead::Data(_) | ChannelRead::WouldBlock => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Err(Error::HandshakeTimeout);
                    }
                    thread::yield_now();
                }
            }
        }
    }

    /// Non-spinning receive for the application read path. A [`Status::Closed`]
    /// result shuts the wrapper down; a handshake request is driven to
    /// completion before returning.
    pub fn receive_data(&self, dst: &mut RecordBuf) -> Result<EngineResult, Error> {
        let result = self.receive(dst, false)?;
        if result.status == Status::Closed {
            self.close()?;
            return Ok(result);
        }
        if result.handshake_status.is_handshaking() {
            self.handshake()?;
        }
        Ok(result)
    }

    /// Flushes pending records, sends close_notify and closes the inbound
    /// side. Runs the exchange once; later calls return `Ok(())` immediately.
    ///
    /// A peer that vanished without its own close_notify is logged, not
    /// reported as an error.
    pub fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);
        let mut wrap = self.wrap.lock();
        let _unwrap = self.unwrap.lock();
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let id = self.channel.id();
        let mut empty = RecordBuf::with_capacity(0);
        self.flush_closing(&mut wrap, &mut empty)?;
        self.engine.lock().close_outbound();
        self.flush_closing(&mut wrap, &mut empty)?;

        let inbound = self.engine.lock().close_inbound();
        match inbound {
            Ok(()) => {}
            Err(Error::InboundTruncated) => {
                info!(id, peer = ?self.channel.peer_addr(), "Peer closed without close_notify, possible truncation");
            }
            Err(err) => return Err(err),
        }
        debug!(id, "Secure session closed");
        Ok(())
    }

    // Wraps until the engine has nothing more to emit or its close_notify is
    // out. A peer that already hung up ends the flush quietly.
    fn flush_closing(&self, wrap: &mut WrapState, empty: &mut RecordBuf) -> Result<(), Error> {
        loop {
            if self.engine.lock().is_outbound_done() {
                return Ok(());
            }
            match self.wrap_and_send_locked(wrap, empty, true) {
                Ok(result) if result.status == Status::Closed || result.bytes_produced == 0 => {
                    return Ok(())
                }
                Ok(_) => {}
                Err(err) if err.is_peer_closed() => {
                    debug!(id = self.channel.id(), %err, "Peer gone while flushing close");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }
}
