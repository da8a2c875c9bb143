//! Per-stream state (RFC 9113 §5.1).

use bytes::{Bytes, BytesMut};

use super::flow::FlowWindow;
use super::frame::{Reason, StreamId};

/// Stream states. Reserved states exist only for push, which this server
/// never initiates; they are kept for completeness of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// A single HTTP/2 stream: identity, state, flow windows, and the request
/// being accumulated on it.
#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) id: StreamId,
    pub(crate) state: State,
    pub(crate) send_window: FlowWindow,
    pub(crate) recv_window: FlowWindow,
    /// Error recorded by RST_STREAM, either direction.
    pub(crate) error: Option<Reason>,
    /// The single closure callback has fired.
    pub(crate) closed_notified: bool,
    /// Decoded request header list.
    pub(crate) headers: Vec<(Vec<u8>, Vec<u8>)>,
    /// Request body accumulating until END_STREAM.
    pub(crate) body: BytesMut,
    /// Response body bytes deferred on flow control.
    pub(crate) pending_send: Bytes,
    /// END_STREAM still owed once `pending_send` drains.
    pub(crate) pending_end_stream: bool,
    /// Trailing HEADERS to emit after the body, carrying END_STREAM.
    pub(crate) pending_trailers: Option<Vec<(Vec<u8>, Vec<u8>)>>,
    /// The request has been handed to a handler.
    pub(crate) dispatched: bool,
}

impl Stream {
    pub(crate) fn new(id: StreamId, send_window: u32, recv_window: u32) -> Stream {
        Stream {
            id,
            state: State::Idle,
            send_window: FlowWindow::new(send_window),
            recv_window: FlowWindow::new(recv_window),
            error: None,
            closed_notified: false,
            headers: Vec::new(),
            body: BytesMut::new(),
            pending_send: Bytes::new(),
            pending_end_stream: false,
            pending_trailers: None,
            dispatched: false,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Peer HEADERS observed on this stream.
    pub(crate) fn recv_headers(&mut self, end_stream: bool) -> Result<(), Reason> {
        self.state = match self.state {
            State::Idle => {
                if end_stream {
                    State::HalfClosedRemote
                } else {
                    State::Open
                }
            }
            // Trailing HEADERS must end the stream.
            State::Open if end_stream => State::HalfClosedRemote,
            State::HalfClosedLocal if end_stream => State::Closed,
            State::Closed => return Err(Reason::STREAM_CLOSED),
            _ => return Err(Reason::PROTOCOL_ERROR),
        };
        Ok(())
    }

    pub(crate) fn recv_data(&mut self, end_stream: bool) -> Result<(), Reason> {
        self.state = match self.state {
            State::Open => {
                if end_stream {
                    State::HalfClosedRemote
                } else {
                    State::Open
                }
            }
            State::HalfClosedLocal => {
                if end_stream {
                    State::Closed
                } else {
                    State::HalfClosedLocal
                }
            }
            State::Closed | State::HalfClosedRemote => return Err(Reason::STREAM_CLOSED),
            _ => return Err(Reason::PROTOCOL_ERROR),
        };
        Ok(())
    }

    pub(crate) fn send_headers(&mut self, end_stream: bool) -> Result<(), Reason> {
        self.state = match self.state {
            State::Idle => {
                if end_stream {
                    State::HalfClosedLocal
                } else {
                    State::Open
                }
            }
            State::Open if end_stream => State::HalfClosedLocal,
            State::Open => State::Open,
            State::HalfClosedRemote if end_stream => State::Closed,
            State::HalfClosedRemote => State::HalfClosedRemote,
            _ => return Err(Reason::PROTOCOL_ERROR),
        };
        Ok(())
    }

    pub(crate) fn send_data(&mut self, end_stream: bool) -> Result<(), Reason> {
        self.state = match self.state {
            State::Open => {
                if end_stream {
                    State::HalfClosedLocal
                } else {
                    State::Open
                }
            }
            State::HalfClosedRemote => {
                if end_stream {
                    State::Closed
                } else {
                    State::HalfClosedRemote
                }
            }
            _ => return Err(Reason::PROTOCOL_ERROR),
        };
        Ok(())
    }

    /// RST_STREAM in either direction closes immediately.
    pub(crate) fn reset(&mut self, reason: Reason) {
        self.error = Some(reason);
        self.state = State::Closed;
    }
}
