//! TCP plumbing for an [`RtspBus`](crate::rtsp::bus::RtspBus).
//!
//! One reader thread and one writer thread per connection. The reader
//! forwards raw byte chunks to the owning loop, which feeds them into its
//! bus; the writer drains sealed wire buffers. Write errors are not
//! reported eagerly: input that is already in flight from the remote must
//! be consumed first, so the writer just stops and the reader surfaces
//! the HUP.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;

use bytes::Bytes;

#[derive(Debug)]
pub enum ConnEvent {
    Bytes(Vec<u8>),
    Hup,
}

/// Cloneable handle feeding the writer thread.
#[derive(Clone)]
pub struct ConnWriter {
    tx: mpsc::Sender<Bytes>,
    stream: std::sync::Arc<TcpStream>,
}

impl ConnWriter {
    /// Queue one sealed wire buffer. Returns false once the writer is
    /// gone; the reader will report the HUP.
    pub fn send(&self, raw: Bytes) -> bool {
        self.tx.send(raw).is_ok()
    }

    /// Close the socket; the reader thread sees EOF and exits.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Spawn reader + writer threads for one established RTSP connection.
///
/// `wrap` lifts connection events into the owner's event type, typically
/// tagging them with a session id.
///
/// # Errors
/// Fails when the stream cannot be cloned for the second thread.
pub fn spawn_connection_threads<E, F>(
    stream: TcpStream,
    to_owner: mpsc::Sender<E>,
    wrap: F,
) -> std::io::Result<ConnWriter>
where
    E: Send + 'static,
    F: Fn(ConnEvent) -> E + Send + 'static,
{
    let read_stream = stream.try_clone()?;
    let mut write_stream = stream.try_clone()?;
    let shutdown_handle = std::sync::Arc::new(stream);

    let (tx_wire, rx_wire) = mpsc::channel::<Bytes>();

    // READER THREAD: socket -> owner loop
    thread::spawn(move || {
        let mut stream = read_stream;
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    // No 0-length reads on streams; this is EOF.
                    let _ = to_owner.send(wrap(ConnEvent::Hup));
                    break;
                }
                Ok(n) => {
                    if to_owner.send(wrap(ConnEvent::Bytes(buf[..n].to_vec()))).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => {
                    let _ = to_owner.send(wrap(ConnEvent::Hup));
                    break;
                }
            }
        }
    });

    // WRITER THREAD: owner loop -> socket
    thread::spawn(move || {
        while let Ok(raw) = rx_wire.recv() {
            if write_stream.write_all(&raw).is_err() {
                // Deferred to the read side: the reader keeps draining
                // whatever the remote managed to send and then reports
                // the HUP.
                break;
            }
            let _ = write_stream.flush();
        }
    });

    Ok(ConnWriter {
        tx: tx_wire,
        stream: shutdown_handle,
    })
}
