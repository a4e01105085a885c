//! TCP transport with length-prefixed framing.
//!
//! One persistent connection is kept per destination and reused across
//! sends. Each frame is a 4-character zero-padded decimal length followed
//! by that many payload bytes. A failed send discards the cached connection
//! and retries once on a fresh one; beyond that the message is dropped.
//! The protocol layered on top assumes a perfect link, so transport errors
//! are a liveness concern only and are logged rather than surfaced.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, warn};

use super::{Delivered, LinkHandle, Outgoing};

/// Number of decimal digits in the length prefix.
const LEN_PREFIX: usize = 4;

/// Largest payload the framing can express.
const MAX_PAYLOAD: usize = 9999;

/// A TCP-backed point-to-point link bound to one local address.
pub struct TcpLink;

impl TcpLink {
    /// Bind the listener and spawn the ingress and egress threads.
    ///
    /// The returned handle is the only way to talk to the link; dropping
    /// its `req` sender shuts the egress thread down.
    pub fn bind(address: &str) -> std::io::Result<LinkHandle> {
        let listener = TcpListener::bind(address)?;

        let (ind_tx, ind_rx) = unbounded::<Delivered>();
        let (req_tx, req_rx) = unbounded::<Outgoing>();

        // Ingress: accept connections forever, one reader thread per peer
        // connection. Connections stay open for the lifetime of the peer.
        thread::spawn(move || loop {
            match listener.accept() {
                Ok((stream, remote)) => {
                    debug!(%remote, "accepted peer connection");
                    let ind_tx = ind_tx.clone();
                    thread::spawn(move || read_frames(stream, remote.to_string(), ind_tx));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        });

        // Egress: drain submissions, reusing one cached connection per
        // destination.
        thread::spawn(move || {
            let mut cache: HashMap<String, TcpStream> = HashMap::new();
            for out in req_rx.iter() {
                send_frame(&mut cache, &out);
            }
        });

        Ok(LinkHandle {
            req: req_tx,
            ind: ind_rx,
        })
    }
}

/// Read frames off one inbound connection until it closes or corrupts.
fn read_frames(mut stream: TcpStream, from: String, ind_tx: Sender<Delivered>) {
    loop {
        let mut len_buf = [0u8; LEN_PREFIX];
        if let Err(e) = stream.read_exact(&mut len_buf) {
            debug!(%from, error = %e, "connection closed by peer");
            return;
        }
        let len = match std::str::from_utf8(&len_buf)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            Some(len) => len,
            None => {
                warn!(%from, "malformed length prefix, discarding connection");
                return;
            }
        };
        let mut payload = vec![0u8; len];
        if let Err(e) = stream.read_exact(&mut payload) {
            warn!(%from, error = %e, "short read, discarding connection");
            return;
        }
        let message = match String::from_utf8(payload) {
            Ok(m) => m,
            Err(_) => {
                warn!(%from, "non-text payload, discarding connection");
                return;
            }
        };
        if ind_tx
            .send(Delivered {
                from: from.clone(),
                message,
            })
            .is_err()
        {
            return;
        }
    }
}

/// Send one framed payload, dialing or re-dialing the destination as needed.
fn send_frame(cache: &mut HashMap<String, TcpStream>, out: &Outgoing) {
    if out.message.len() > MAX_PAYLOAD {
        warn!(to = %out.to, len = out.message.len(), "payload exceeds frame limit, dropped");
        return;
    }

    let frame = format!("{:04}{}", out.message.len(), out.message);

    // Reuse the cached connection when there is one; a failed write
    // discards it and retries exactly once on a fresh connection.
    if let Some(conn) = cache.get_mut(&out.to) {
        if conn.write_all(frame.as_bytes()).is_ok() {
            return;
        }
        debug!(to = %out.to, "send failed, retrying on a fresh connection");
        cache.remove(&out.to);
    }

    match TcpStream::connect(&out.to) {
        Ok(mut conn) => {
            debug!(to = %out.to, "connection opened");
            if let Err(e) = conn.write_all(frame.as_bytes()) {
                warn!(to = %out.to, error = %e, "send failed, message dropped");
                return;
            }
            cache.insert(out.to.clone(), conn);
        }
        Err(e) => {
            warn!(to = %out.to, error = %e, "connect failed, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_framed_round_trip() {
        let a = TcpLink::bind("127.0.0.1:39501").unwrap();
        let b = TcpLink::bind("127.0.0.1:39502").unwrap();

        a.req
            .send(Outgoing {
                to: "127.0.0.1:39502".to_string(),
                message: "reqEntry;0;1".to_string(),
            })
            .unwrap();

        let got = b.ind.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.message, "reqEntry;0;1");

        // Same connection carries subsequent frames in order.
        for i in 0..5 {
            a.req
                .send(Outgoing {
                    to: "127.0.0.1:39502".to_string(),
                    message: format!("respOk;{}", i),
                })
                .unwrap();
        }
        for i in 0..5 {
            let got = b.ind.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(got.message, format!("respOk;{}", i));
        }
    }

    #[test]
    fn test_oversized_payload_dropped() {
        let a = TcpLink::bind("127.0.0.1:39503").unwrap();
        let b = TcpLink::bind("127.0.0.1:39504").unwrap();

        a.req
            .send(Outgoing {
                to: "127.0.0.1:39504".to_string(),
                message: "x".repeat(MAX_PAYLOAD + 1),
            })
            .unwrap();
        a.req
            .send(Outgoing {
                to: "127.0.0.1:39504".to_string(),
                message: "snap;0".to_string(),
            })
            .unwrap();

        // Only the in-range payload arrives.
        let got = b.ind.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.message, "snap;0");
    }
}
