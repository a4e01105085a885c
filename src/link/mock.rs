//! In-process link network for tests.
//!
//! Wires a fixed group of peers together over crossbeam channels, keeping
//! the same channel-pair contract as the TCP link. Each peer gets one
//! inbox; a router thread per peer forwards its submissions to the
//! destination inbox, so messages from one sender to one receiver arrive
//! in submission order.

use std::collections::HashMap;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{Delivered, LinkHandle, Outgoing};

/// A network of in-process links for `n` peers.
///
/// Addresses are synthetic (`mock:<i>`) unless supplied. Endpoints can be
/// taken once per peer.
pub struct MockLinkNet {
    addresses: Vec<String>,
    inbox_txs: HashMap<String, Sender<Delivered>>,
    inbox_rxs: Vec<Option<Receiver<Delivered>>>,
}

impl MockLinkNet {
    /// Create a network of `n` peers with synthetic addresses.
    pub fn new(n: usize) -> Self {
        let addresses = (0..n).map(|i| format!("mock:{}", i)).collect();
        Self::with_addresses(addresses)
    }

    /// Create a network with the given address list.
    pub fn with_addresses(addresses: Vec<String>) -> Self {
        let mut inbox_txs = HashMap::new();
        let mut inbox_rxs = Vec::new();
        for addr in &addresses {
            let (tx, rx) = unbounded();
            inbox_txs.insert(addr.clone(), tx);
            inbox_rxs.push(Some(rx));
        }
        MockLinkNet {
            addresses,
            inbox_txs,
            inbox_rxs,
        }
    }

    /// The address list, in peer order.
    pub fn addresses(&self) -> Vec<String> {
        self.addresses.clone()
    }

    /// Take the link handle for peer `id`. Panics if taken twice.
    pub fn endpoint(&mut self, id: usize) -> LinkHandle {
        let ind = self.inbox_rxs[id]
            .take()
            .expect("endpoint already taken for this peer");

        let (req_tx, req_rx) = unbounded::<Outgoing>();
        let from = self.addresses[id].clone();
        let routes = self.inbox_txs.clone();

        // Router: forward each submission to the destination inbox. One
        // thread per sender keeps per-pair FIFO order.
        thread::spawn(move || {
            for out in req_rx.iter() {
                if let Some(tx) = routes.get(&out.to) {
                    let _ = tx.send(Delivered {
                        from: from.clone(),
                        message: out.message,
                    });
                }
            }
        });

        LinkHandle { req: req_tx, ind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_mock_routing_and_order() {
        let mut net = MockLinkNet::new(3);
        let ep0 = net.endpoint(0);
        let ep1 = net.endpoint(1);

        for i in 0..4 {
            ep0.req
                .send(Outgoing {
                    to: "mock:1".to_string(),
                    message: format!("respOk;{}", i),
                })
                .unwrap();
        }

        for i in 0..4 {
            let got = ep1.ind.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(got.from, "mock:0");
            assert_eq!(got.message, format!("respOk;{}", i));
        }
    }

    #[test]
    fn test_self_addressed_delivery() {
        let mut net = MockLinkNet::new(2);
        let ep0 = net.endpoint(0);

        ep0.req
            .send(Outgoing {
                to: "mock:0".to_string(),
                message: "snap;0".to_string(),
            })
            .unwrap();

        let got = ep0.ind.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got.message, "snap;0");
    }
}
