//! End-to-end RTSP framing over a real loopback TCP connection: a
//! Source session on one side, a scripted sink double on the other.

#![allow(clippy::expect_used)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use rustycast::log::NoopLogSink;
use rustycast::rtsp::connection::{ConnEvent, ConnWriter, spawn_connection_threads};
use rustycast::rtsp::{Message, Parser};
use rustycast::wfd::WfdSession;
use rustycast::wfd::dispatch::MessageId;
use rustycast::wfd::session::SessionState;

/// A blocking test double on the sink side of the TCP connection.
struct SinkDouble {
    stream: TcpStream,
    parser: Parser,
}

impl SinkDouble {
    fn recv(&mut self) -> Message {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = [0u8; 2048];
        loop {
            if let Some(m) = self.parser.next_message() {
                return m;
            }
            assert!(Instant::now() < deadline, "sink double timed out");
            let n = self.stream.read(&mut buf).expect("sink read");
            assert!(n > 0, "source closed early");
            self.parser.feed(&buf[..n]).expect("sink parse");
        }
    }

    fn send_raw(&mut self, text: &str) {
        self.stream.write_all(text.as_bytes()).expect("sink write");
    }

    fn reply_ok(&mut self, req: &Message, headers: &[(&str, &str)], body: Option<&str>) {
        let mut text = format!("RTSP/1.0 200 OK\r\nCSeq: {}\r\n", req.wire_cookie());
        for (k, v) in headers {
            text.push_str(&format!("{k}: {v}\r\n"));
        }
        match body {
            Some(b) => text.push_str(&format!(
                "Content-Type: text/parameters\r\nContent-Length: {}\r\n\r\n{}",
                b.len(),
                b
            )),
            None => text.push_str("\r\n"),
        }
        self.send_raw(&text);
    }
}

/// Drive the session with received connection events until `done`.
fn pump_until(
    session: &mut WfdSession,
    rx: &mpsc::Receiver<(u32, ConnEvent)>,
    writer: &ConnWriter,
    done: impl Fn(&WfdSession) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        for raw in session.take_wire() {
            assert!(writer.send(raw));
        }
        if done(session) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "session did not reach expected point"
        );

        let now = Instant::now();
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok((_, ConnEvent::Bytes(data))) => session.feed_bytes(&data, now),
            Ok((_, ConnEvent::Hup)) => session.transport_hup(now),
            Err(_) => {}
        }
        for raw in session.take_wire() {
            assert!(writer.send(raw));
        }
    }
}

#[test]
fn source_negotiates_m1_to_m6_over_loopback() {
    let now = Instant::now();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");

    // The sink double dials the Source's listener, like a real sink
    // would dial the RTSP port from the Device Info sub-element.
    let sink_stream = TcpStream::connect(addr).expect("sink connect");
    sink_stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    let mut sink = SinkDouble {
        stream: sink_stream,
        parser: Parser::new(),
    };

    let (accepted, _) = listener.accept().expect("accept");

    // Source session wired up through the real connection threads.
    let mut session = WfdSession::new_out(1, "127.0.0.1", addr.port(), Arc::new(NoopLogSink));
    let (tx, rx) = mpsc::channel::<(u32, ConnEvent)>();
    let writer = spawn_connection_threads(accepted, tx, |ev| (1, ev)).expect("connection threads");

    session.attach_transport();
    session.start_caps_exchange(now).expect("caps exchange");
    for raw in session.take_wire() {
        assert!(writer.send(raw));
    }

    // M1 arrives at the sink.
    let m1 = sink.recv();
    assert_eq!(m1.method(), Some("OPTIONS"));
    assert_eq!(m1.header_value("Require"), Some("org.wfa.wfd1.0"));
    sink.reply_ok(
        &m1,
        &[(
            "Public",
            "org.wfa.wfd1.0, GET_PARAMETER, SET_PARAMETER, SETUP, PLAY, PAUSE, TEARDOWN",
        )],
        None,
    );

    // The options answer chains the capability query.
    pump_until(&mut session, &rx, &writer, |s| {
        s.last_request() == Some(MessageId::M3GetParameter)
    });

    let m3 = sink.recv();
    assert_eq!(m3.method(), Some("GET_PARAMETER"));
    assert_eq!(m3.uri(), Some("rtsp://localhost/wfd1.0"));
    sink.reply_ok(
        &m3,
        &[],
        Some(
            "wfd_video_formats: 00 00 02 10 00000080 00000000 00000000 00 0000 0000 00 none none\n\
             wfd_audio_codecs: LPCM 00000003 00\n\
             wfd_client_rtp_ports: RTP/AVP/UDP;unicast 1991 0 mode=play",
        ),
    );

    pump_until(&mut session, &rx, &writer, |s| {
        s.last_request() == Some(MessageId::M4SetParameter)
    });

    let m4 = sink.recv();
    assert_eq!(m4.method(), Some("SET_PARAMETER"));
    assert_eq!(
        m4.body_param("wfd_client_rtp_ports"),
        Some("RTP/AVP/UDP;unicast 1991 0 mode=play")
    );
    assert_eq!(
        m4.body_param("wfd_presentation_URL"),
        Some("rtsp://127.0.0.1/wfd1.0/streamid=0 none")
    );
    sink.reply_ok(&m4, &[], None);

    // M4's reply establishes the session and triggers M5 SETUP.
    pump_until(&mut session, &rx, &writer, |s| {
        s.state() == SessionState::Established
    });

    let m5 = sink.recv();
    assert_eq!(m5.body_param("wfd_trigger_method"), Some("SETUP"));
    sink.reply_ok(&m5, &[], None);

    // The sink performs SETUP; the source answers with its session id
    // and server ports.
    sink.send_raw(
        "SETUP rtsp://127.0.0.1/wfd1.0/streamid=0 RTSP/1.0\r\n\
         CSeq: 1\r\n\
         Transport: RTP/AVP/UDP;unicast;client_port=1991-1992\r\n\r\n",
    );

    pump_until(&mut session, &rx, &writer, |s| {
        s.state() == SessionState::SettingUp
    });

    let setup_rep = sink.recv();
    assert!(setup_rep.is_reply_code(200));
    assert_eq!(setup_rep.header_value("Session"), Some("1;timeout=30"));
    assert_eq!(
        setup_rep.header_value("Transport"),
        Some("RTP/AVP/UDP;unicast;client_port=1991-1992;server_port=16384-16385")
    );
    assert!(setup_rep.header_value("Date").is_some());
    assert_eq!(setup_rep.wire_cookie(), 1);
}
