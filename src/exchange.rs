//! Sans-I/O transaction engine
//!
//! [`Exchange`] owns the connection state, the [`SessionContext`] and the
//! receive buffer, and decides what happens next; the async and blocking
//! clients only move bytes. A caller drives it like this:
//!
//! ```text
//! begin_connect -> (transport connects) -> connected()
//!     Some(hello) -> send hello, feed replies to on_handshake_data until true
//! prepare(address, ...) -> Transaction
//! while let Some(frame) = next_frame(&tx) {
//!     send frame; sent(); feed chunks to on_data(&mut tx, ..) until true
//! }
//! finish(tx)
//! ```
//!
//! Any transport failure must be reported through [`Exchange::fail`] so the
//! state falls back to `Disconnected`.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{PlcError, PlcResult};
use crate::framing::FrameBuffer;
use crate::protocol::{CommandFrame, DataPayload, FrameCodec, Operation, SessionContext};

/// Client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Sending,
    Receiving,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Sending => "sending",
            ConnectionState::Receiving => "receiving",
        };
        f.write_str(name)
    }
}

/// One logical read or write, already split and encoded
#[derive(Debug)]
pub struct Transaction {
    operation: Operation,
    frames: Vec<(CommandFrame, Vec<u8>)>,
    index: usize,
    results: Vec<DataPayload>,
}

impl Transaction {
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Number of wire frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames answered so far
    pub fn completed(&self) -> usize {
        self.index
    }

    pub fn is_complete(&self) -> bool {
        self.index >= self.frames.len()
    }

    /// The frame currently awaiting its reply
    pub fn current(&self) -> Option<&CommandFrame> {
        self.frames.get(self.index).map(|(frame, _)| frame)
    }
}

/// Protocol-independent request/response state machine
#[derive(Debug)]
pub struct Exchange {
    codec: Arc<dyn FrameCodec>,
    state: ConnectionState,
    session: SessionContext,
    buffer: FrameBuffer,
}

impl Exchange {
    pub fn new(codec: Arc<dyn FrameCodec>) -> Self {
        let session = codec.new_session();
        Self {
            codec,
            state: ConnectionState::Disconnected,
            session,
            buffer: FrameBuffer::default(),
        }
    }

    pub fn codec(&self) -> &Arc<dyn FrameCodec> {
        &self.codec
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Bytes dropped as line noise on this connection
    pub fn discarded(&self) -> usize {
        self.buffer.discarded()
    }

    /// A new connection attempt starts from a fresh session
    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
        self.session = self.codec.new_session();
        self.buffer = FrameBuffer::default();
    }

    /// The transport is open; returns the handshake frame to send, if any
    pub fn connected(&mut self) -> Option<Vec<u8>> {
        match self.codec.handshake_request(&self.session) {
            Some(hello) => {
                debug!("{} handshake started", self.codec.name());
                self.state = ConnectionState::Handshaking;
                Some(hello)
            }
            None => {
                self.state = ConnectionState::Ready;
                None
            }
        }
    }

    /// Feed handshake reply bytes; `Ok(true)` once the session is ready
    pub fn on_handshake_data(&mut self, data: &[u8]) -> PlcResult<bool> {
        if self.state != ConnectionState::Handshaking {
            return Err(PlcError::connection(format!("handshake data while {}", self.state)));
        }
        self.buffer.extend(data);
        let codec = &self.codec;
        let reply = match self.buffer.next_frame(|buf| codec.handshake_progress(buf)) {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(false),
            Err(e) => return Err(self.fail(e)),
        };
        if let Err(e) = self.codec.accept_handshake(&reply, &mut self.session) {
            return Err(self.fail(e));
        }
        debug!(
            "{} handshake done: local node {}, remote node {}",
            self.codec.name(),
            self.session.local_node,
            self.session.remote_node
        );
        self.state = ConnectionState::Ready;
        Ok(true)
    }

    /// Resolve, split and encode a request; performs no I/O
    pub fn prepare(
        &mut self,
        address: &str,
        operation: Operation,
        points: usize,
        payload: Option<&DataPayload>,
    ) -> PlcResult<Transaction> {
        if self.state != ConnectionState::Ready {
            return Err(PlcError::connection(format!("cannot start a request while {}", self.state)));
        }
        let spec = self.codec.resolve(address)?;
        let frames = self
            .codec
            .encode_request(&spec, operation, points, payload, &mut self.session)?;
        debug!(
            "{} {} {} x{} in {} frame(s)",
            self.codec.name(),
            operation,
            address,
            points,
            frames.len()
        );
        Ok(Transaction {
            operation,
            frames,
            index: 0,
            results: Vec::new(),
        })
    }

    /// Next encoded frame to put on the wire
    pub fn next_frame<'t>(&mut self, transaction: &'t Transaction) -> Option<&'t [u8]> {
        let (_, bytes) = transaction.frames.get(transaction.index)?;
        self.state = ConnectionState::Sending;
        Some(bytes)
    }

    /// The frame returned by [`next_frame`](Self::next_frame) was written
    pub fn sent(&mut self) {
        self.state = ConnectionState::Receiving;
        self.buffer.clear();
    }

    /// Feed received bytes; `Ok(true)` once the current frame is answered
    pub fn on_data(&mut self, transaction: &mut Transaction, data: &[u8]) -> PlcResult<bool> {
        if self.state != ConnectionState::Receiving {
            return Err(PlcError::connection(format!("received data while {}", self.state)));
        }
        let request = match transaction.frames.get(transaction.index) {
            Some((request, _)) => request,
            None => return Err(PlcError::internal("transaction has no outstanding frame")),
        };

        self.buffer.extend(data);
        let codec = &self.codec;
        let raw = match self.buffer.next_frame(|buf| codec.response_progress(buf, request)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(false),
            Err(e) => return Err(self.fail(e)),
        };
        if !self.buffer.is_empty() {
            warn!("{} trailing bytes after {} reply", self.buffer.len(), self.codec.name());
        }

        let response = match self.codec.decode_response(&raw, request, &self.session) {
            Ok(response) => response,
            Err(e) => return Err(self.fail(e)),
        };
        if let Some(payload) = response.payload {
            transaction.results.push(payload);
        }
        transaction.index += 1;
        self.state = ConnectionState::Ready;
        Ok(true)
    }

    /// Record a failure and hand the error back
    ///
    /// Errors that leave the link desynchronised drop to `Disconnected`;
    /// status replies leave the session ready for the next request.
    pub fn fail(&mut self, error: PlcError) -> PlcError {
        if error.breaks_session() {
            if self.state != ConnectionState::Disconnected {
                warn!("{} session dropped: {}", self.codec.name(), error);
            }
            self.state = ConnectionState::Disconnected;
            self.buffer.clear();
        } else if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Ready;
        }
        error
    }

    /// Concatenate sub-frame results in request order
    pub fn finish(&mut self, transaction: Transaction) -> PlcResult<Option<DataPayload>> {
        if !transaction.is_complete() {
            return Err(PlcError::internal(format!(
                "transaction finished after {} of {} frames",
                transaction.index,
                transaction.frames.len()
            )));
        }
        match transaction.operation {
            Operation::Write => Ok(None),
            Operation::Read => DataPayload::concat(transaction.results).map(Some),
        }
    }

    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.buffer.clear();
    }
}
