//! Call tracking over one framed RTSP byte stream.
//!
//! The bus is sans-io: socket plumbing lives in
//! [`connection`](crate::rtsp::connection), which feeds raw bytes in and
//! pulls sealed wire buffers out. The owning loop drives the bus with
//! `feed` / `poll_event` / `hup` and is responsible for routing the
//! resulting [`BusEvent`]s.
//!
//! Every call gets exactly one completion: a matched reply, a timeout, or
//! an abort when the transport dies. Replies are matched by the CSeq
//! cookie assigned at seal time; cookies of remote origin carry the top
//! bit and therefore never collide with ours in the waiting table.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::rtsp::message::Message;
use crate::rtsp::parser::Parser;
use crate::rtsp::rtsp_error::RtspError;

/// 5s default timeout for calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum BusEvent {
    /// A reply matched an in-flight call.
    Reply { request: u64, msg: Message },
    /// An in-flight call saw no reply within its timeout.
    Timeout { request: u64 },
    /// The transport died before the call completed.
    Aborted { request: u64 },
    /// Unsolicited request, data frame, or unknown message.
    Incoming(Message),
    /// The transport is gone; emitted once, after all `Aborted` events.
    Hup,
}

#[derive(Debug)]
struct Pending {
    deadline: Instant,
}

#[derive(Debug, Default)]
pub struct RtspBus {
    parser: Parser,
    cookies: u64,
    waiting: HashMap<u64, Pending>,
    outgoing: VecDeque<(u64, Bytes)>,
    events: VecDeque<BusEvent>,
    default_timeout: Option<Duration>,
    dead: bool,
}

impl RtspBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_cookie(&mut self) -> u64 {
        // Skip 0, keep the remote-namespace bit clear.
        self.cookies = (self.cookies + 1) & (u64::MAX >> 1);
        if self.cookies == 0 {
            self.cookies = 1;
        }
        self.cookies
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Seal and queue a message for transmission; no reply is awaited.
    ///
    /// # Errors
    /// `Dead` once the transport failed.
    pub fn send(&mut self, mut m: Message) -> Result<u64, RtspError> {
        if self.dead {
            return Err(RtspError::Dead);
        }
        let fallback = if m.cookie() == 0 { self.next_cookie() } else { 0 };
        m.seal(fallback)?;
        let cookie = m.cookie();
        if let Some(raw) = m.raw() {
            self.outgoing.push_back((cookie, raw.clone()));
        }
        Ok(cookie)
    }

    /// Seal and queue a request, awaiting its reply. The completion is
    /// surfaced later as `Reply`, `Timeout` or `Aborted`, exactly one of
    /// them.
    ///
    /// # Errors
    /// `Dead` once the transport failed.
    pub fn call(
        &mut self,
        m: Message,
        timeout: Option<Duration>,
        now: Instant,
    ) -> Result<u64, RtspError> {
        let cookie = self.send(m)?;
        let timeout = timeout
            .or(self.default_timeout)
            .unwrap_or(DEFAULT_CALL_TIMEOUT);
        self.waiting.insert(cookie, Pending {
            deadline: now + timeout,
        });
        Ok(cookie)
    }

    /// Withdraw a call. The message also leaves the outbound queue unless
    /// its transmission already started; a transmission is never
    /// interrupted mid-message.
    pub fn cancel(&mut self, cookie: u64) {
        self.waiting.remove(&cookie);
        self.outgoing.retain(|(c, _)| *c != cookie);
    }

    /// Hand the next wire buffer to the transport. Once taken, the
    /// message counts as in transmission.
    pub fn take_outgoing(&mut self) -> Option<Bytes> {
        self.outgoing.pop_front().map(|(_, raw)| raw)
    }

    #[must_use]
    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Feed received bytes into the wire parser.
    ///
    /// # Errors
    /// A framing violation; the caller must `hup` the bus.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), RtspError> {
        self.parser.feed(data)
    }

    /// Next due completion or incoming message, if any.
    pub fn poll_event(&mut self, now: Instant) -> Option<BusEvent> {
        if let Some(ev) = self.events.pop_front() {
            return Some(ev);
        }

        while let Some(m) = self.parser.next_message() {
            if m.is_reply() {
                let request = m.wire_cookie();
                if self.waiting.remove(&request).is_some() {
                    return Some(BusEvent::Reply { request, msg: m });
                }
                // A reply nobody waits for (timed out or cancelled).
                continue;
            }
            return Some(BusEvent::Incoming(m));
        }

        let expired = self
            .waiting
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| *k)
            .min();
        if let Some(request) = expired {
            self.waiting.remove(&request);
            return Some(BusEvent::Timeout { request });
        }

        None
    }

    /// Earliest pending-call deadline; the owning loop sleeps until then.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.waiting.values().map(|p| p.deadline).min()
    }

    /// Transport teardown. Pending input already parsed is still
    /// delivered by `poll_event` before the queued `Aborted`/`Hup`
    /// events, so no data is lost when the peer sends and immediately
    /// closes.
    pub fn hup(&mut self) {
        if self.dead {
            return;
        }
        self.dead = true;
        self.outgoing.clear();

        // Drain parsed input ahead of the HUP notifications.
        let now_events: Vec<BusEvent> = std::iter::from_fn(|| {
            self.parser.next_message().map(|m| {
                if m.is_reply() {
                    let request = m.wire_cookie();
                    if self.waiting.remove(&request).is_some() {
                        return Some(BusEvent::Reply { request, msg: m });
                    }
                    None
                } else {
                    Some(BusEvent::Incoming(m))
                }
            })
        })
        .flatten()
        .collect();
        self.events.extend(now_events);

        let mut aborted: Vec<u64> = self.waiting.drain().map(|(k, _)| k).collect();
        aborted.sort_unstable();
        for request in aborted {
            self.events.push_back(BusEvent::Aborted { request });
        }
        self.events.push_back(BusEvent::Hup);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn call_matches_reply_exactly_once() {
        let mut bus = RtspBus::new();
        let t0 = now();

        let m = Message::request("OPTIONS", "*");
        let cookie = bus.call(m, None, t0).expect("call");
        assert!(bus.take_outgoing().is_some());

        let wire = format!("RTSP/1.0 200 OK\r\nCSeq: {cookie}\r\n\r\n");
        bus.feed(wire.as_bytes()).expect("feed");

        match bus.poll_event(t0) {
            Some(BusEvent::Reply { request, msg }) => {
                assert_eq!(request, cookie);
                assert!(msg.is_reply_code(200));
            }
            other => panic!("expected Reply, got {other:?}"),
        }
        assert!(bus.poll_event(t0).is_none());

        // A duplicate reply is dropped, not double-delivered.
        bus.feed(wire.as_bytes()).expect("feed");
        assert!(bus.poll_event(t0).is_none());
    }

    #[test]
    fn call_times_out_once() {
        let mut bus = RtspBus::new();
        let t0 = now();
        let cookie = bus
            .call(
                Message::request("OPTIONS", "*"),
                Some(Duration::from_secs(5)),
                t0,
            )
            .expect("call");

        assert!(bus.poll_event(t0).is_none());
        let later = t0 + Duration::from_secs(6);
        match bus.poll_event(later) {
            Some(BusEvent::Timeout { request }) => assert_eq!(request, cookie),
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(bus.poll_event(later).is_none());
    }

    #[test]
    fn hup_aborts_pending_calls_after_drained_input() {
        let mut bus = RtspBus::new();
        let t0 = now();
        let c1 = bus
            .call(Message::request("OPTIONS", "*"), None, t0)
            .expect("call");

        // Peer sends a request and closes immediately: the request must
        // still be delivered, before the abort and the hup.
        bus.feed(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\nRequire: org.wfa.wfd1.0\r\n\r\n")
            .expect("feed");
        bus.hup();

        match bus.poll_event(t0) {
            Some(BusEvent::Incoming(m)) => assert_eq!(m.method(), Some("OPTIONS")),
            other => panic!("expected Incoming, got {other:?}"),
        }
        match bus.poll_event(t0) {
            Some(BusEvent::Aborted { request }) => assert_eq!(request, c1),
            other => panic!("expected Aborted, got {other:?}"),
        }
        assert!(matches!(bus.poll_event(t0), Some(BusEvent::Hup)));

        assert!(bus.send(Message::request("OPTIONS", "*")).is_err());
    }

    #[test]
    fn cancel_removes_unsent_message() {
        let mut bus = RtspBus::new();
        let t0 = now();
        let c = bus
            .call(Message::request("OPTIONS", "*"), None, t0)
            .expect("call");
        bus.cancel(c);
        assert!(bus.take_outgoing().is_none());
        assert!(bus.poll_event(t0 + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn cancel_after_send_started_keeps_wire_bytes() {
        let mut bus = RtspBus::new();
        let t0 = now();
        let c = bus
            .call(Message::request("OPTIONS", "*"), None, t0)
            .expect("call");
        let taken = bus.take_outgoing();
        assert!(taken.is_some());
        bus.cancel(c);
        // Already handed to the transport; nothing to retract.
        assert!(bus.take_outgoing().is_none());
    }

    #[test]
    fn local_cookies_are_monotonic_and_distinct() {
        let mut bus = RtspBus::new();
        let t0 = now();
        let a = bus
            .call(Message::request("OPTIONS", "*"), None, t0)
            .expect("call");
        let b = bus
            .call(Message::request("GET_PARAMETER", "rtsp://localhost/wfd1.0"), None, t0)
            .expect("call");
        assert!(b > a);
        assert_eq!(a & (1 << 63), 0);
    }
}
