//! Per-request protocol state machine.
//!
//! One `Exchange` frames one request, runs the service, and queues the
//! response. [`Exchange::consume`] advances as far as buffered bytes allow
//! and returns when it needs more; the connection driver re-invokes it on
//! the next read event. The exchange never touches the connection that owns
//! it: pausing, resuming, and ending all go through the flow-control
//! capability.

use std::rc::Rc;

use bytes::Bytes;
use log::{debug, error};

use crate::{
    connection::{ConnCtx, control::EndAction},
    http::{
        BodyFraming, MAX_HEADER_COUNT, Method, ProtocolError, Request, RequestHead, Response,
        Version, parse_header_line, parse_request_line,
    },
    input::InputBuffer,
    metrics,
    service::Service,
};

/// Result of one state-machine step.
enum Step {
    /// The state advanced; keep stepping on the same buffered bytes.
    Advanced,
    /// More bytes (or the service) are needed; give control back.
    Suspend,
}

enum ExchangeState {
    /// Waiting for the request line's terminating CRLF.
    RequestLine,
    /// Request line parsed; collecting header lines.
    Headers {
        method: Method,
        target: String,
        version: Version,
        headers: Vec<(String, String)>,
    },
    /// Head complete; collecting `remaining` body bytes.
    Body {
        head: RequestHead,
        remaining: usize,
        body: Vec<u8>,
    },
    /// Fully framed, about to be dispatched.
    Ready { head: RequestHead, body: Bytes },
    /// The service call is in flight.
    Executing,
    /// The response is being encoded and queued.
    WritingResponse,
    /// Done. Further bytes are discarded until end of stream.
    Complete,
}

impl ExchangeState {
    fn name(&self) -> &'static str {
        match self {
            Self::RequestLine => "request-line",
            Self::Headers { .. } => "headers",
            Self::Body { .. } => "body",
            Self::Ready { .. } => "ready",
            Self::Executing => "executing",
            Self::WritingResponse => "writing-response",
            Self::Complete => "complete",
        }
    }
}

/// One request/response exchange on a connection.
pub(crate) struct Exchange<S: Service> {
    ctx: Rc<ConnCtx<S>>,
    state: ExchangeState,
    head_bytes: usize,
    /// Version from the request line, once one parsed; error responses
    /// echo it.
    version: Option<Version>,
    seq: u64,
}

impl<S: Service> Exchange<S> {
    /// Create the exchange with sequence number `seq` on its connection.
    pub(crate) fn new(ctx: Rc<ConnCtx<S>>, seq: u64) -> Self {
        Self {
            ctx,
            state: ExchangeState::RequestLine,
            head_bytes: 0,
            version: None,
            seq,
        }
    }

    /// Position of this exchange in the connection's lifetime, starting
    /// at zero.
    pub(crate) fn seq(&self) -> u64 { self.seq }

    /// Name of the current state, for logging.
    pub(crate) fn state_name(&self) -> &'static str { self.state.name() }

    /// Advance on newly committed bytes.
    ///
    /// Returns once no further progress is possible: more bytes are needed,
    /// or the exchange finished and recorded an end transition for the
    /// driver to apply.
    pub(crate) async fn consume(&mut self, input: &mut InputBuffer) {
        loop {
            let step = match self.state {
                ExchangeState::RequestLine => self.step_request_line(input),
                ExchangeState::Headers { .. } => self.step_headers(input),
                ExchangeState::Body { .. } => self.step_body(input),
                ExchangeState::Ready { .. } => {
                    self.execute().await;
                    return;
                }
                ExchangeState::Executing | ExchangeState::WritingResponse => return,
                ExchangeState::Complete => {
                    self.step_drain(input);
                    return;
                }
            };
            match step {
                Ok(Step::Advanced) => {}
                Ok(Step::Suspend) => return,
                Err(violation) => {
                    self.reject(&violation);
                    return;
                }
            }
        }
    }

    fn step_request_line(&mut self, input: &mut InputBuffer) -> Result<Step, ProtocolError> {
        let max = self.ctx.max_head_bytes;
        let buf = input.buffered();
        let Some(line_end) = find_crlf(buf) else {
            if buf.len() > max {
                return Err(ProtocolError::HeadTooLarge { max });
            }
            if input.is_eof() {
                if buf.is_empty() {
                    debug!(
                        "connection closed by peer before a request: id={}",
                        self.ctx.id
                    );
                } else {
                    debug!("end of stream inside request line: id={}", self.ctx.id);
                }
                self.ctx.control.end(EndAction::Disconnect);
                self.state = ExchangeState::Complete;
            }
            return Ok(Step::Suspend);
        };
        let (method, target, version) = parse_request_line(&buf[..line_end])?;
        self.version = Some(version);
        input.consume(line_end + 2);
        self.head_bytes = line_end + 2;
        if self.head_bytes > max {
            return Err(ProtocolError::HeadTooLarge { max });
        }
        self.state = ExchangeState::Headers {
            method,
            target,
            version,
            headers: Vec::new(),
        };
        Ok(Step::Advanced)
    }

    fn step_headers(&mut self, input: &mut InputBuffer) -> Result<Step, ProtocolError> {
        let ExchangeState::Headers {
            method,
            target,
            version,
            mut headers,
        } = std::mem::replace(&mut self.state, ExchangeState::Complete)
        else {
            debug_assert!(false, "step_headers outside the header state");
            return Ok(Step::Suspend);
        };
        let max = self.ctx.max_head_bytes;
        loop {
            let buf = input.buffered();
            let Some(line_end) = find_crlf(buf) else {
                if self.head_bytes + buf.len() > max {
                    return Err(ProtocolError::HeadTooLarge { max });
                }
                if input.is_eof() {
                    debug!("end of stream inside header block: id={}", self.ctx.id);
                    self.ctx.control.end(EndAction::Disconnect);
                    return Ok(Step::Suspend);
                }
                self.state = ExchangeState::Headers {
                    method,
                    target,
                    version,
                    headers,
                };
                return Ok(Step::Suspend);
            };
            if line_end == 0 {
                // Blank line: the head is complete.
                input.consume(2);
                self.head_bytes += 2;
                let head = RequestHead::from_parts(method, target, version, headers);
                let framing = head.body_framing(self.ctx.max_body_bytes)?;
                self.state = match framing {
                    BodyFraming::None => ExchangeState::Ready {
                        head,
                        body: Bytes::new(),
                    },
                    BodyFraming::Length(remaining) => ExchangeState::Body {
                        head,
                        remaining,
                        body: Vec::with_capacity(remaining),
                    },
                };
                return Ok(Step::Advanced);
            }
            if headers.len() == MAX_HEADER_COUNT {
                return Err(ProtocolError::TooManyHeaders);
            }
            let parsed = parse_header_line(&buf[..line_end])?;
            input.consume(line_end + 2);
            self.head_bytes += line_end + 2;
            if self.head_bytes > max {
                return Err(ProtocolError::HeadTooLarge { max });
            }
            headers.push(parsed);
        }
    }

    fn step_body(&mut self, input: &mut InputBuffer) -> Result<Step, ProtocolError> {
        let ExchangeState::Body {
            head,
            mut remaining,
            mut body,
        } = std::mem::replace(&mut self.state, ExchangeState::Complete)
        else {
            debug_assert!(false, "step_body outside the body state");
            return Ok(Step::Suspend);
        };
        let take = input.available().min(remaining);
        if take > 0 {
            body.extend_from_slice(&input.buffered()[..take]);
            input.consume(take);
            remaining -= take;
        }
        if remaining == 0 {
            self.state = ExchangeState::Ready {
                head,
                body: Bytes::from(body),
            };
            return Ok(Step::Advanced);
        }
        if input.is_eof() {
            debug!(
                "end of stream inside body: id={}, missing={remaining}",
                self.ctx.id
            );
            self.ctx.control.end(EndAction::Disconnect);
            return Ok(Step::Suspend);
        }
        self.state = ExchangeState::Body {
            head,
            remaining,
            body,
        };
        Ok(Step::Suspend)
    }

    /// Dispatch the framed request and queue its response.
    async fn execute(&mut self) {
        let ExchangeState::Ready { head, body } =
            std::mem::replace(&mut self.state, ExchangeState::Executing)
        else {
            debug_assert!(false, "execute outside the ready state");
            return;
        };
        let version = head.version;
        let request_keep_alive = head.keep_alive();
        let outcome = self.ctx.service.call(Request { head, body }).await;
        self.state = ExchangeState::WritingResponse;
        let (response, reuse) = match outcome {
            Ok(produced) => (produced.response, produced.reuse),
            Err(err) => {
                error!("service failed: id={}, error={err}", self.ctx.id);
                metrics::inc_errors();
                (Response::new(500), false)
            }
        };
        let keep = request_keep_alive && reuse;
        self.send_response(&response, version, keep);
        self.state = ExchangeState::Complete;
        metrics::inc_exchanges();
        if self.ctx.outbound.over_backlog() {
            self.ctx.control.pause();
        }
        self.ctx.control.end(if keep {
            EndAction::KeepAlive
        } else {
            EndAction::HalfClose
        });
    }

    /// Discard bytes after completion; request teardown at end of stream.
    fn step_drain(&mut self, input: &mut InputBuffer) {
        let stale = input.available();
        if stale > 0 {
            input.consume(stale);
        }
        if input.is_eof() {
            self.ctx.control.end(EndAction::Disconnect);
        }
    }

    /// Answer a protocol violation with a minimal response, then half-close.
    fn reject(&mut self, violation: &ProtocolError) {
        debug!(
            "protocol violation: id={}, exchange={}, error={violation}",
            self.ctx.id, self.seq
        );
        metrics::inc_errors();
        let response = Response::new(status_for(violation));
        // Violations before a parsed request line default to 1.1.
        let version = self.version.unwrap_or(Version::Http11);
        self.send_response(&response, version, false);
        self.state = ExchangeState::Complete;
        self.ctx.control.end(EndAction::HalfClose);
    }

    fn send_response(&self, response: &Response, version: Version, keep_alive: bool) {
        let mut lease = self.ctx.pool.lease(response.body_len() + 256);
        response.encode_into(&mut lease, version, keep_alive);
        if let Err(err) = self.ctx.outbound.write(lease) {
            debug!("response dropped: id={}, error={err}", self.ctx.id);
            self.ctx.control.end(EndAction::Disconnect);
        }
    }
}

/// Index of the first CRLF in `buf`.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Status answering each violation; 501 for unknown transfer codings per
/// RFC 7230 section 3.3.1.
fn status_for(violation: &ProtocolError) -> u16 {
    match violation {
        ProtocolError::HeadTooLarge { .. } => 431,
        ProtocolError::BodyTooLarge { .. } => 413,
        ProtocolError::UnsupportedTransferEncoding => 501,
        _ => 400,
    }
}
