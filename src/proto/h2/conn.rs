//! The HTTP/2 connection state machine (RFC 9113).
//!
//! Sans-io: [`Connection::recv`] consumes wire bytes out of the receive
//! buffer and surfaces [`Event`]s; queued frames accumulate in an output
//! buffer the transport driver drains with [`Connection::take_output`]. All
//! protocol state (preface, SETTINGS exchange, streams, flow control, HPACK,
//! GOAWAY) lives here, untouched by I/O concerns, which is what makes the
//! whole machine testable byte-for-byte.

use std::collections::{HashMap, VecDeque};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::flow::FlowWindow;
use super::frame::{self, FrameHead, Kind, Reason, StreamId, FRAME_HEADER_LEN, PREFACE};
use super::hpack;
use super::stream::{State, Stream};
use crate::config::{Http2Config, DEFAULT_INITIAL_WINDOW_SIZE, MAX_MAX_FRAME_SIZE, MIN_MAX_FRAME_SIZE};
use crate::error::{Error, Result};

/// Closed stream ids retained to absorb late RST_STREAM / WINDOW_UPDATE.
const CLOSED_STREAM_RETENTION: usize = 16;

/// Connection-level protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    AwaitingPreface,
    AwaitingSettings,
    Open,
    GoAwaySent,
    GoAwayReceived,
    Closed,
}

/// Peer SETTINGS snapshot, RFC 9113 defaults until the first frame arrives.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeerSettings {
    pub(crate) header_table_size: u32,
    pub(crate) enable_push: bool,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) initial_window_size: u32,
    pub(crate) max_frame_size: u32,
    pub(crate) max_header_list_size: Option<u32>,
}

impl Default for PeerSettings {
    fn default() -> Self {
        PeerSettings {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: MIN_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

/// Protocol events surfaced to the connection driver.
#[derive(Debug)]
pub(crate) enum Event {
    /// A request finished accumulating (END_STREAM observed).
    Request {
        stream_id: StreamId,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
        body: Bytes,
    },
    /// A request body overran `max_body_bytes`; the driver answers 413.
    RequestTooLarge(StreamId),
    /// A stream died by RST_STREAM, either direction.
    StreamReset(StreamId, Reason),
    /// The peer sent GOAWAY; drain and go home.
    GoAwayReceived(Reason),
}

pub(crate) struct Connection {
    state: ConnectionState,
    config: Http2Config,
    peer: PeerSettings,
    send_window: FlowWindow,
    recv_window: FlowWindow,
    encoder: hpack::Encoder,
    decoder: hpack::Decoder,
    streams: HashMap<StreamId, Stream>,
    recently_closed: VecDeque<StreamId>,
    last_peer_stream_id: StreamId,
    /// HEADERS + CONTINUATION accumulator.
    header_block: BytesMut,
    expecting_continuation: bool,
    header_block_stream_id: StreamId,
    header_block_end_stream: bool,
    output: BytesMut,
    settings_sent: bool,
    settings_ack_received: bool,
    is_server: bool,
    active_streams: u32,
    streams_opened: u32,
    max_body_bytes: usize,
}

impl Connection {
    pub(crate) fn new(config: &Http2Config, max_body_bytes: usize, is_server: bool) -> Connection {
        Connection {
            state: ConnectionState::AwaitingPreface,
            config: config.clone(),
            peer: PeerSettings::default(),
            send_window: FlowWindow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            recv_window: FlowWindow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            encoder: hpack::Encoder::new(4096),
            decoder: hpack::Decoder::new(config.header_table_size as usize),
            streams: HashMap::new(),
            recently_closed: VecDeque::with_capacity(CLOSED_STREAM_RETENTION),
            last_peer_stream_id: 0,
            header_block: BytesMut::new(),
            expecting_continuation: false,
            header_block_stream_id: 0,
            header_block_end_stream: false,
            output: BytesMut::new(),
            settings_sent: false,
            settings_ack_received: false,
            is_server,
            active_streams: 0,
            streams_opened: 0,
            max_body_bytes,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn peer_settings(&self) -> &PeerSettings {
        &self.peer
    }

    /// The peer has acknowledged our SETTINGS.
    pub(crate) fn settings_acked(&self) -> bool {
        self.settings_ack_received
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    pub(crate) fn take_output(&mut self) -> Bytes {
        self.output.split().freeze()
    }

    /// Streams still delivering or awaiting responses.
    pub(crate) fn has_active_streams(&self) -> bool {
        self.active_streams > 0
            || self
                .streams
                .values()
                .any(|stream| !stream.pending_send.is_empty())
    }

    pub(crate) fn is_draining(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::GoAwaySent | ConnectionState::GoAwayReceived
        )
    }

    /// Sends the local SETTINGS (and the connection window top-up)
    /// immediately; used on ALPN-negotiated h2 where the server speaks
    /// first.
    pub(crate) fn send_initial_settings(&mut self) {
        if self.settings_sent {
            return;
        }
        self.settings_sent = true;
        let entries = [
            (frame::SETTINGS_HEADER_TABLE_SIZE, self.config.header_table_size),
            (frame::SETTINGS_ENABLE_PUSH, 0),
            (
                frame::SETTINGS_MAX_CONCURRENT_STREAMS,
                self.config.max_concurrent_streams,
            ),
            (
                frame::SETTINGS_INITIAL_WINDOW_SIZE,
                self.config.initial_window_size,
            ),
            (frame::SETTINGS_MAX_FRAME_SIZE, self.config.max_frame_size),
            (
                frame::SETTINGS_MAX_HEADER_LIST_SIZE,
                self.config.max_header_list_size,
            ),
        ];
        frame::encode_settings(&mut self.output, &entries);

        // Top the connection receive window up past the RFC initial 65535.
        let configured = self.config.connection_window_size;
        if configured > DEFAULT_INITIAL_WINDOW_SIZE {
            let increment = configured - DEFAULT_INITIAL_WINDOW_SIZE;
            frame::encode_window_update(&mut self.output, 0, increment);
            // The increase cannot overflow: configured is validated.
            let _ = self.recv_window.increase(increment);
        }
    }

    /// Consumes as many complete frames from `buf` as possible.
    ///
    /// Connection errors queue a GOAWAY, close the connection, and surface
    /// as `Err`; stream errors queue RST_STREAM and keep going.
    pub(crate) fn recv(&mut self, buf: &mut BytesMut, events: &mut Vec<Event>) -> Result<()> {
        loop {
            match self.state {
                ConnectionState::Closed => {
                    buf.clear();
                    return Ok(());
                }
                ConnectionState::AwaitingPreface => {
                    if buf.len() < PREFACE.len() {
                        return Ok(());
                    }
                    if &buf[..PREFACE.len()] != PREFACE {
                        debug!("bad connection preface");
                        return self.connection_error(Reason::PROTOCOL_ERROR);
                    }
                    buf.advance(PREFACE.len());
                    trace!("client preface received");
                    self.send_initial_settings();
                    self.state = ConnectionState::AwaitingSettings;
                }
                _ => {
                    if buf.len() < FRAME_HEADER_LEN {
                        return Ok(());
                    }
                    let head = FrameHead::parse(&buf[..FRAME_HEADER_LEN]);
                    if head.len > self.config.max_frame_size {
                        debug!(len = head.len, "frame exceeds SETTINGS_MAX_FRAME_SIZE");
                        return self.connection_error(Reason::FRAME_SIZE_ERROR);
                    }
                    let total = FRAME_HEADER_LEN + head.len as usize;
                    if buf.len() < total {
                        return Ok(());
                    }
                    buf.advance(FRAME_HEADER_LEN);
                    let payload = buf.split_to(head.len as usize).freeze();
                    self.process_frame(head, payload, events)?;
                }
            }
        }
    }

    fn process_frame(
        &mut self,
        head: FrameHead,
        payload: Bytes,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        trace!(kind = ?head.kind, stream_id = head.stream_id, len = head.len, "recv frame");

        // A CONTINUATION sequence admits no interleaving whatsoever.
        if self.expecting_continuation
            && (head.kind != Kind::Continuation || head.stream_id != self.header_block_stream_id)
        {
            debug!("frame interleaved into a CONTINUATION sequence");
            return self.connection_error(Reason::PROTOCOL_ERROR);
        }

        // The first frame after the preface must be the peer SETTINGS.
        if self.state == ConnectionState::AwaitingSettings
            && !matches!(head.kind, Kind::Settings)
        {
            debug!("expected SETTINGS after preface, got {:?}", head.kind);
            return self.connection_error(Reason::PROTOCOL_ERROR);
        }

        match head.kind {
            Kind::Data => self.recv_data(head, payload, events),
            Kind::Headers => self.recv_headers(head, payload, events),
            Kind::Priority => self.recv_priority(head, payload),
            Kind::Reset => self.recv_reset(head, payload, events),
            Kind::Settings => self.recv_settings(head, payload),
            Kind::PushPromise => {
                // Clients cannot push, and we never enable it anyway.
                debug!("received PUSH_PROMISE");
                self.connection_error(Reason::PROTOCOL_ERROR)
            }
            Kind::Ping => self.recv_ping(head, payload),
            Kind::GoAway => self.recv_go_away(payload, events),
            Kind::WindowUpdate => self.recv_window_update(head, payload, events),
            Kind::Continuation => self.recv_continuation(head, payload, events),
            Kind::Unknown(kind) => {
                trace!(kind, "ignoring unknown frame type");
                Ok(())
            }
        }
    }

    // ===== frame handlers =====

    fn recv_data(&mut self, head: FrameHead, mut payload: Bytes, events: &mut Vec<Event>) -> Result<()> {
        if head.stream_id == 0 {
            return self.connection_error(Reason::PROTOCOL_ERROR);
        }

        // Padding counts against both windows; the connection window first.
        // A stream overrun also tears the connection down: a peer that
        // ignores stream windows is not worth keeping.
        if self.recv_window.consume(head.len).is_err() {
            debug!("connection flow-control window overrun");
            return self.connection_error(Reason::FLOW_CONTROL_ERROR);
        }

        let Some(stream) = self.streams.get_mut(&head.stream_id) else {
            if self.recently_closed.contains(&head.stream_id) {
                self.replenish_connection_window();
                return Ok(());
            }
            debug!(stream_id = head.stream_id, "DATA on unknown stream");
            return self.connection_error(Reason::PROTOCOL_ERROR);
        };

        if stream.recv_window.consume(head.len).is_err() {
            debug!(stream_id = head.stream_id, "stream flow-control window overrun");
            return self.connection_error(Reason::FLOW_CONTROL_ERROR);
        }

        if let Err(reason) = stream.recv_data(head.is_end_stream()) {
            self.replenish_connection_window();
            return self.stream_error(head.stream_id, reason, events);
        }

        if head.is_padded() {
            if let Err(reason) = frame::strip_padding(&mut payload) {
                return self.connection_error(reason);
            }
        }

        let stream = self.streams.get_mut(&head.stream_id).expect("stream just touched");
        stream.body.extend_from_slice(&payload);
        if stream.body.len() > self.max_body_bytes {
            debug!(stream_id = head.stream_id, "request body over limit");
            stream.body.clear();
            if !stream.dispatched {
                stream.dispatched = true;
                events.push(Event::RequestTooLarge(head.stream_id));
            }
        }

        self.replenish_connection_window();
        self.replenish_stream_window(head.stream_id);

        if head.is_end_stream() {
            self.maybe_dispatch(head.stream_id, events);
            self.finish_stream_if_closed(head.stream_id, events);
        }
        Ok(())
    }

    fn recv_headers(&mut self, head: FrameHead, mut payload: Bytes, events: &mut Vec<Event>) -> Result<()> {
        if head.stream_id == 0 {
            return self.connection_error(Reason::PROTOCOL_ERROR);
        }
        if self.is_server && head.stream_id % 2 == 0 {
            debug!(stream_id = head.stream_id, "client used even stream id");
            return self.connection_error(Reason::PROTOCOL_ERROR);
        }

        if head.is_padded() {
            if let Err(reason) = frame::strip_padding(&mut payload) {
                return self.connection_error(reason);
            }
        }
        if head.has_priority() {
            if let Err(reason) = frame::strip_priority(&mut payload) {
                return self.connection_error(reason);
            }
        }

        let is_new = head.stream_id > self.last_peer_stream_id;
        if is_new {
            self.last_peer_stream_id = head.stream_id;
            let refused =
                self.is_draining() || self.active_streams >= self.config.max_concurrent_streams;
            if refused {
                // No stream is created, but the header block below still
                // runs through the decoder: skipping it would desync the
                // HPACK dynamic tables for every later stream.
                self.remember_closed(head.stream_id);
                frame::encode_reset(&mut self.output, head.stream_id, Reason::REFUSED_STREAM);
            } else {
                self.streams_opened += 1;
                let stream = Stream::new(
                    head.stream_id,
                    self.peer.initial_window_size,
                    self.config.initial_window_size,
                );
                self.streams.insert(head.stream_id, stream);
                self.active_streams += 1;

                if self.config.max_streams_per_connection != 0
                    && self.streams_opened >= self.config.max_streams_per_connection
                {
                    debug!("lifetime stream budget reached, starting graceful GOAWAY");
                    self.go_away(Reason::NO_ERROR);
                }
            }
        } else if !self.streams.contains_key(&head.stream_id) {
            // Reopening a closed stream is a connection error regardless of
            // the retention FIFO; retention absorbs only late RST/WINDOW.
            debug!(stream_id = head.stream_id, "HEADERS on closed stream");
            return self.connection_error(Reason::PROTOCOL_ERROR);
        }

        self.header_block.clear();
        self.header_block.extend_from_slice(&payload);
        self.header_block_stream_id = head.stream_id;
        self.header_block_end_stream = head.is_end_stream();

        if head.is_end_headers() {
            self.finish_header_block(events)
        } else {
            self.expecting_continuation = true;
            Ok(())
        }
    }

    fn recv_continuation(&mut self, head: FrameHead, payload: Bytes, events: &mut Vec<Event>) -> Result<()> {
        if !self.expecting_continuation || head.stream_id != self.header_block_stream_id {
            return self.connection_error(Reason::PROTOCOL_ERROR);
        }
        self.header_block.extend_from_slice(&payload);
        if self.header_block.len() > self.config.max_header_list_size as usize * 2 {
            // Compressed accumulation far past the advertised list bound.
            self.expecting_continuation = false;
            let stream_id = self.header_block_stream_id;
            self.header_block.clear();
            return self.stream_error(stream_id, Reason::COMPRESSION_ERROR, events);
        }
        if head.is_end_headers() {
            self.expecting_continuation = false;
            self.finish_header_block(events)
        } else {
            Ok(())
        }
    }

    /// Runs the accumulated block through HPACK exactly once and routes the
    /// result: request headers on a fresh stream, trailers on an open one.
    fn finish_header_block(&mut self, events: &mut Vec<Event>) -> Result<()> {
        self.expecting_continuation = false;
        let stream_id = self.header_block_stream_id;
        let end_stream = self.header_block_end_stream;
        let block = self.header_block.split().freeze();

        let headers = match self
            .decoder
            .decode(&block, self.config.max_header_list_size as usize)
        {
            Ok(headers) => headers,
            Err(err) => {
                debug!(stream_id, error = %err, "header block rejected");
                return self.stream_error(stream_id, Reason::COMPRESSION_ERROR, events);
            }
        };

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            // Refused above; the block still had to pass through the decoder
            // to keep the dynamic table in sync.
            return Ok(());
        };

        let first_block = stream.state == State::Idle;
        if let Err(reason) = stream.recv_headers(end_stream) {
            return self.stream_error(stream_id, reason, events);
        }

        if first_block {
            if let Err(reason) = validate_request_headers(&headers) {
                return self.stream_error(stream_id, reason, events);
            }
            let stream = self.streams.get_mut(&stream_id).expect("stream exists");
            stream.headers = headers;
        }
        // Trailers are decoded for HPACK state but otherwise dropped.

        if end_stream {
            self.maybe_dispatch(stream_id, events);
            self.finish_stream_if_closed(stream_id, events);
        }
        Ok(())
    }

    fn recv_priority(&mut self, head: FrameHead, payload: Bytes) -> Result<()> {
        if head.stream_id == 0 {
            return self.connection_error(Reason::PROTOCOL_ERROR);
        }
        if payload.len() != 5 {
            return self.connection_error(Reason::FRAME_SIZE_ERROR);
        }
        // Priority scheduling is acknowledged but not acted upon.
        Ok(())
    }

    fn recv_reset(&mut self, head: FrameHead, payload: Bytes, events: &mut Vec<Event>) -> Result<()> {
        if head.stream_id == 0 {
            return self.connection_error(Reason::PROTOCOL_ERROR);
        }
        let reason = match frame::parse_reset(&payload) {
            Ok(reason) => reason,
            Err(reason) => return self.connection_error(reason),
        };
        if let Some(mut stream) = self.streams.remove(&head.stream_id) {
            if !stream.is_closed() {
                self.active_streams -= 1;
            }
            stream.reset(reason);
            if !stream.closed_notified {
                events.push(Event::StreamReset(head.stream_id, reason));
            }
            self.remember_closed(head.stream_id);
            return Ok(());
        }
        if self.recently_closed.contains(&head.stream_id) {
            return Ok(());
        }
        if head.stream_id > self.last_peer_stream_id {
            // RST on an idle stream.
            return self.connection_error(Reason::PROTOCOL_ERROR);
        }
        debug!(stream_id = head.stream_id, "RST_STREAM past retention");
        self.connection_error(Reason::PROTOCOL_ERROR)
    }

    fn recv_settings(&mut self, head: FrameHead, payload: Bytes) -> Result<()> {
        if head.stream_id != 0 {
            return self.connection_error(Reason::PROTOCOL_ERROR);
        }
        if head.is_ack() {
            if !payload.is_empty() {
                return self.connection_error(Reason::FRAME_SIZE_ERROR);
            }
            trace!("settings ACK received");
            self.settings_ack_received = true;
            return Ok(());
        }

        let entries = match frame::parse_settings_payload(&payload) {
            Ok(entries) => entries,
            Err(reason) => return self.connection_error(reason),
        };

        for (id, value) in entries {
            match id {
                frame::SETTINGS_HEADER_TABLE_SIZE => {
                    self.peer.header_table_size = value;
                    self.encoder.set_max_table_size(value as usize);
                }
                frame::SETTINGS_ENABLE_PUSH => match value {
                    0 => self.peer.enable_push = false,
                    1 => self.peer.enable_push = true,
                    _ => return self.connection_error(Reason::PROTOCOL_ERROR),
                },
                frame::SETTINGS_MAX_CONCURRENT_STREAMS => {
                    self.peer.max_concurrent_streams = Some(value);
                }
                frame::SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value > crate::config::MAX_WINDOW_SIZE {
                        return self.connection_error(Reason::FLOW_CONTROL_ERROR);
                    }
                    // Re-apply the delta to every existing stream's send
                    // window; results may go negative.
                    let delta = i64::from(value) - i64::from(self.peer.initial_window_size);
                    self.peer.initial_window_size = value;
                    for stream in self.streams.values_mut() {
                        if stream.send_window.adjust(delta).is_err() {
                            return self.connection_error(Reason::FLOW_CONTROL_ERROR);
                        }
                    }
                }
                frame::SETTINGS_MAX_FRAME_SIZE => {
                    if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return self.connection_error(Reason::PROTOCOL_ERROR);
                    }
                    self.peer.max_frame_size = value;
                }
                frame::SETTINGS_MAX_HEADER_LIST_SIZE => {
                    self.peer.max_header_list_size = Some(value);
                }
                unknown => {
                    trace!(id = unknown, value, "ignoring unknown setting");
                }
            }
        }

        frame::encode_settings_ack(&mut self.output);
        if self.state == ConnectionState::AwaitingSettings {
            self.state = ConnectionState::Open;
            trace!("connection open");
        }
        self.pump_all_pending();
        Ok(())
    }

    fn recv_ping(&mut self, head: FrameHead, payload: Bytes) -> Result<()> {
        if head.stream_id != 0 {
            return self.connection_error(Reason::PROTOCOL_ERROR);
        }
        if payload.len() != 8 {
            return self.connection_error(Reason::FRAME_SIZE_ERROR);
        }
        if head.is_ack() {
            // No locally initiated pings outstanding.
            return Ok(());
        }
        let mut echo = [0u8; 8];
        echo.copy_from_slice(&payload);
        frame::encode_ping(&mut self.output, true, echo);
        Ok(())
    }

    fn recv_go_away(&mut self, payload: Bytes, events: &mut Vec<Event>) -> Result<()> {
        let go_away = match frame::parse_go_away(&payload) {
            Ok(go_away) => go_away,
            Err(reason) => return self.connection_error(reason),
        };
        debug!(last_stream_id = go_away.last_stream_id, reason = %go_away.reason, "GOAWAY received");
        if self.state != ConnectionState::GoAwaySent {
            self.state = ConnectionState::GoAwayReceived;
        }
        events.push(Event::GoAwayReceived(go_away.reason));
        Ok(())
    }

    fn recv_window_update(&mut self, head: FrameHead, payload: Bytes, events: &mut Vec<Event>) -> Result<()> {
        let increment = match frame::parse_window_update(&payload) {
            Ok(increment) => increment,
            Err(reason) => return self.connection_error(reason),
        };

        if head.stream_id == 0 {
            if increment == 0 {
                return self.connection_error(Reason::PROTOCOL_ERROR);
            }
            if self.send_window.increase(increment).is_err() {
                return self.connection_error(Reason::FLOW_CONTROL_ERROR);
            }
            self.pump_all_pending();
            return Ok(());
        }

        if increment == 0 {
            return self.stream_error(head.stream_id, Reason::PROTOCOL_ERROR, events);
        }
        match self.streams.get_mut(&head.stream_id) {
            Some(stream) => {
                if stream.send_window.increase(increment).is_err() {
                    return self.stream_error(head.stream_id, Reason::FLOW_CONTROL_ERROR, events);
                }
                self.pump_stream(head.stream_id);
                Ok(())
            }
            None if self.recently_closed.contains(&head.stream_id) => Ok(()),
            None if head.stream_id > self.last_peer_stream_id => {
                self.connection_error(Reason::PROTOCOL_ERROR)
            }
            None => self.connection_error(Reason::PROTOCOL_ERROR),
        }
    }

    // ===== response sending =====

    /// Queues a response for `stream_id`: one HEADERS block (split into
    /// CONTINUATION frames when oversized) plus as much DATA as flow
    /// control admits; the rest parks on the stream.
    pub(crate) fn send_response(
        &mut self,
        stream_id: StreamId,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
        body: Bytes,
        trailers: Option<Vec<(Vec<u8>, Vec<u8>)>>,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            debug!(stream_id, "response for a stream that is gone");
            return Ok(());
        };

        let end_stream = body.is_empty() && trailers.is_none();
        if let Err(reason) = stream.send_headers(end_stream) {
            return self.stream_error(stream_id, reason, events);
        }

        let mut fragment = Vec::new();
        self.encoder.encode(
            headers.iter().map(|(n, v)| (n.as_slice(), v.as_slice())),
            &mut fragment,
        );

        let max = self.peer.max_frame_size as usize;
        if fragment.len() <= max {
            frame::encode_headers(&mut self.output, stream_id, &fragment, end_stream);
        } else {
            let mut flags = if end_stream { frame::FLAG_END_STREAM } else { 0 };
            let mut chunks = fragment.chunks(max).peekable();
            let first = chunks.next().expect("fragment is non-empty");
            frame::encode_frame_head(&mut self.output, first.len(), Kind::Headers, flags, stream_id);
            self.output.extend_from_slice(first);
            while let Some(chunk) = chunks.next() {
                flags = if chunks.peek().is_none() {
                    frame::FLAG_END_HEADERS
                } else {
                    0
                };
                frame::encode_frame_head(
                    &mut self.output,
                    chunk.len(),
                    Kind::Continuation,
                    flags,
                    stream_id,
                );
                self.output.extend_from_slice(chunk);
            }
        }

        if end_stream {
            self.finish_stream_if_closed(stream_id, events);
            return Ok(());
        }

        let stream = self.streams.get_mut(&stream_id).expect("stream exists");
        stream.pending_send = body;
        stream.pending_end_stream = trailers.is_none();
        stream.pending_trailers = trailers;
        self.pump_stream(stream_id);
        self.finish_stream_if_closed(stream_id, events);
        Ok(())
    }

    /// Sends whatever DATA the windows currently admit for one stream,
    /// followed by trailing HEADERS once the body drains.
    fn pump_stream(&mut self, stream_id: StreamId) {
        loop {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                return;
            };
            if stream.pending_send.is_empty() {
                if let Some(trailers) = stream.pending_trailers.take() {
                    if stream.send_headers(true).is_ok() {
                        let mut fragment = Vec::new();
                        self.encoder.encode(
                            trailers.iter().map(|(n, v)| (n.as_slice(), v.as_slice())),
                            &mut fragment,
                        );
                        frame::encode_headers(&mut self.output, stream_id, &fragment, true);
                        let mut events = Vec::new();
                        self.finish_stream_if_closed(stream_id, &mut events);
                    }
                }
                return;
            }
            let allowed = stream
                .send_window
                .available()
                .min(self.send_window.available())
                .min(i64::from(self.peer.max_frame_size));
            if allowed <= 0 {
                trace!(stream_id, "DATA deferred on flow control");
                return;
            }
            let take = (allowed as usize).min(stream.pending_send.len());
            let chunk = stream.pending_send.split_to(take);
            let end_stream = stream.pending_send.is_empty() && stream.pending_end_stream;

            // The caller guaranteed capacity, consume cannot fail.
            let _ = stream.send_window.consume(take as u32);
            let _ = self.send_window.consume(take as u32);
            if stream.send_data(end_stream).is_err() {
                // Stream died while data was parked; drop the rest.
                stream.pending_send = Bytes::new();
                return;
            }
            frame::encode_data(&mut self.output, stream_id, &chunk, end_stream);
            if end_stream {
                let mut events = Vec::new();
                self.finish_stream_if_closed(stream_id, &mut events);
                return;
            }
        }
    }

    fn pump_all_pending(&mut self) {
        let ids: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, stream)| !stream.pending_send.is_empty())
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            self.pump_stream(id);
        }
    }

    /// Resets a stream from the server side (handler failure, cancel).
    pub(crate) fn reset_stream(&mut self, stream_id: StreamId, reason: Reason) {
        if let Some(mut stream) = self.streams.remove(&stream_id) {
            if !stream.is_closed() {
                self.active_streams -= 1;
            }
            stream.reset(reason);
            frame::encode_reset(&mut self.output, stream_id, reason);
            self.remember_closed(stream_id);
        }
    }

    /// Starts a graceful shutdown: GOAWAY with the highest processed stream
    /// id; existing streams drain.
    pub(crate) fn go_away(&mut self, reason: Reason) {
        if matches!(self.state, ConnectionState::GoAwaySent | ConnectionState::Closed) {
            return;
        }
        frame::encode_go_away(&mut self.output, self.last_peer_stream_id, reason);
        self.state = ConnectionState::GoAwaySent;
    }

    // ===== internals =====

    fn maybe_dispatch(&mut self, stream_id: StreamId, events: &mut Vec<Event>) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.dispatched {
            return;
        }
        stream.dispatched = true;
        let headers = std::mem::take(&mut stream.headers);
        let body = stream.body.split().freeze();
        events.push(Event::Request {
            stream_id,
            headers,
            body,
        });
    }

    /// Closed + notified streams leave the map and enter the retention FIFO.
    fn finish_stream_if_closed(&mut self, stream_id: StreamId, events: &mut Vec<Event>) {
        let Some(stream) = self.streams.get(&stream_id) else {
            return;
        };
        if !stream.is_closed() {
            return;
        }
        let mut stream = self.streams.remove(&stream_id).expect("stream exists");
        self.active_streams -= 1;
        if !stream.closed_notified {
            stream.closed_notified = true;
            if let Some(reason) = stream.error {
                events.push(Event::StreamReset(stream_id, reason));
            }
        }
        trace!(stream_id = stream.id, "stream retired");
        self.remember_closed(stream_id);
    }

    fn remember_closed(&mut self, stream_id: StreamId) {
        if self.recently_closed.len() == CLOSED_STREAM_RETENTION {
            self.recently_closed.pop_front();
        }
        self.recently_closed.push_back(stream_id);
    }

    /// WINDOW_UPDATE once the connection receive window dips below half of
    /// its configured size.
    fn replenish_connection_window(&mut self) {
        let configured = i64::from(self.config.connection_window_size);
        let available = self.recv_window.available();
        if available < configured / 2 {
            let increment = (configured - available) as u32;
            if increment > 0 {
                frame::encode_window_update(&mut self.output, 0, increment);
                let _ = self.recv_window.increase(increment);
            }
        }
    }

    fn replenish_stream_window(&mut self, stream_id: StreamId) {
        let initial = i64::from(self.config.initial_window_size);
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if matches!(stream.state, State::HalfClosedRemote | State::Closed) {
            // Peer finished sending; no point topping up.
            return;
        }
        let available = stream.recv_window.available();
        if available < initial / 2 {
            let increment = (initial - available) as u32;
            if increment > 0 {
                frame::encode_window_update(&mut self.output, stream_id, increment);
                let _ = stream.recv_window.increase(increment);
            }
        }
    }

    fn stream_error(&mut self, stream_id: StreamId, reason: Reason, events: &mut Vec<Event>) -> Result<()> {
        warn!(stream_id, reason = %reason, "stream error");
        frame::encode_reset(&mut self.output, stream_id, reason);
        if let Some(mut stream) = self.streams.remove(&stream_id) {
            if !stream.is_closed() {
                self.active_streams -= 1;
            }
            stream.reset(reason);
            if !stream.closed_notified {
                events.push(Event::StreamReset(stream_id, reason));
            }
        }
        self.remember_closed(stream_id);
        Ok(())
    }

    fn connection_error(&mut self, reason: Reason) -> Result<()> {
        warn!(reason = %reason, "connection error, sending GOAWAY");
        frame::encode_go_away(&mut self.output, self.last_peer_stream_id, reason);
        self.state = ConnectionState::Closed;
        Err(Error::new_h2_conn(reason))
    }
}

/// Request pseudo-header and field validation (RFC 9113 §8.3).
fn validate_request_headers(headers: &[(Vec<u8>, Vec<u8>)]) -> std::result::Result<(), Reason> {
    let mut method = None;
    let mut scheme = false;
    let mut path_ok = None;
    let mut authority = false;
    let mut seen_regular = false;

    for (name, value) in headers {
        if name.first() == Some(&b':') {
            if seen_regular {
                return Err(Reason::PROTOCOL_ERROR);
            }
            match name.as_slice() {
                b":method" if method.is_none() => method = Some(value.clone()),
                b":scheme" if !scheme => scheme = true,
                b":path" if path_ok.is_none() => path_ok = Some(!value.is_empty()),
                b":authority" if !authority => authority = true,
                _ => return Err(Reason::PROTOCOL_ERROR),
            }
        } else {
            seen_regular = true;
            if name.iter().any(|b| b.is_ascii_uppercase()) {
                return Err(Reason::PROTOCOL_ERROR);
            }
            match name.as_slice() {
                b"connection" | b"keep-alive" | b"proxy-connection" | b"transfer-encoding"
                | b"upgrade" => return Err(Reason::PROTOCOL_ERROR),
                b"te" if value.as_slice() != b"trailers" => {
                    return Err(Reason::PROTOCOL_ERROR)
                }
                _ => {}
            }
        }
    }

    let Some(method) = method else {
        return Err(Reason::PROTOCOL_ERROR);
    };
    if method == b"CONNECT" {
        // CONNECT uses authority-form only.
        if scheme || path_ok.is_some() || !authority {
            return Err(Reason::PROTOCOL_ERROR);
        }
        return Ok(());
    }
    if !scheme || path_ok != Some(true) {
        return Err(Reason::PROTOCOL_ERROR);
    }
    Ok(())
}
