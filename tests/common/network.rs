use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use ed25519_dalek::VerifyingKey;
use pbft_rs::{
    networking::{
        messages::Packet,
        network::{Network, Session},
    },
    types::sealer_set::SealerSet,
};

/// Faults that a [`NetworkStub`] injects into the packets it handles.
#[derive(Clone, Copy, Default)]
pub(crate) struct Faults {
    /// Deliver every packet twice.
    pub(crate) duplicate: bool,
    /// Deliver packets alternately newest first and oldest first, instead of in the order they were sent.
    pub(crate) reorder: bool,
}

/// A mock network stub which passes packets from and to threads using channels.
///
/// Peers between which the link is cut neither see each other in their sessions nor exchange packets.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    my_verifying_key: VerifyingKey,
    all_peers: HashMap<VerifyingKey, Sender<(VerifyingKey, Packet)>>,
    unreachable: HashSet<VerifyingKey>,
    inbox: Arc<Mutex<Receiver<(VerifyingKey, Packet)>>>,
    faults: Faults,
    held: Arc<Mutex<(VecDeque<(VerifyingKey, Packet)>, bool)>>,
}

impl NetworkStub {
    fn is_reachable(&self, peer: &VerifyingKey) -> bool {
        *peer != self.my_verifying_key && !self.unreachable.contains(peer)
    }
}

fn session_of(peer: VerifyingKey) -> Session {
    Session {
        node_id: peer,
        endpoint: STANDARD_NO_PAD.encode(peer.to_bytes()),
    }
}

impl Network for NetworkStub {
    fn init_sealer_set(&mut self, _: SealerSet) {}

    fn update_sealer_set(&mut self, _: SealerSet) {}

    fn sessions(&self) -> Vec<Session> {
        self.all_peers
            .keys()
            .filter(|peer| self.is_reachable(peer))
            .map(|peer| session_of(*peer))
            .collect()
    }

    fn send(&mut self, peer: VerifyingKey, packet: Packet) {
        if !self.is_reachable(&peer) {
            return;
        }
        if let Some(peer) = self.all_peers.get(&peer) {
            if self.faults.duplicate {
                let _ = peer.send((self.my_verifying_key, packet.clone()));
            }
            let _ = peer.send((self.my_verifying_key, packet));
        }
    }

    fn multicast(&mut self, peers: &[VerifyingKey], packet: Packet) {
        for peer in peers {
            self.send(*peer, packet.clone());
        }
    }

    fn recv(&mut self) -> Option<(Session, Packet)> {
        if !self.faults.reorder {
            return match self.inbox.lock().unwrap().try_recv() {
                Ok((origin, packet)) => Some((session_of(origin), packet)),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => panic!(),
            };
        }

        let inbox = self.inbox.lock().unwrap();
        let mut held = self.held.lock().unwrap();
        let (queue, newest_first) = &mut *held;
        loop {
            match inbox.try_recv() {
                Ok(received) => queue.push_back(received),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => panic!(),
            }
        }
        *newest_first = !*newest_first;
        let next = if *newest_first {
            queue.pop_back()
        } else {
            queue.pop_front()
        };
        next.map(|(origin, packet)| (session_of(origin), packet))
    }
}

/// Create a fully connected mock network.
pub(crate) fn mock_network(peers: impl Iterator<Item = VerifyingKey>) -> Vec<NetworkStub> {
    build_network(peers, &[], Faults::default())
}

/// Create a mock network in which the peers at each pair of positions in `cut_links` cannot reach each other.
pub(crate) fn mock_network_with_cut_links(
    peers: impl Iterator<Item = VerifyingKey>,
    cut_links: &[(usize, usize)],
) -> Vec<NetworkStub> {
    build_network(peers, cut_links, Faults::default())
}

/// Create a fully connected mock network that injects `faults` into every link.
pub(crate) fn mock_network_with_faults(peers: impl Iterator<Item = VerifyingKey>, faults: Faults) -> Vec<NetworkStub> {
    build_network(peers, &[], faults)
}

fn build_network(
    peers: impl Iterator<Item = VerifyingKey>,
    cut_links: &[(usize, usize)],
    faults: Faults,
) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(VerifyingKey, Receiver<(VerifyingKey, Packet)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();
    let keys: Vec<VerifyingKey> = peer_and_inboxes.iter().map(|(peer, _)| *peer).collect();

    peer_and_inboxes
        .into_iter()
        .enumerate()
        .map(|(i, (my_verifying_key, inbox))| {
            let unreachable = cut_links
                .iter()
                .filter_map(|(a, b)| match (*a == i, *b == i) {
                    (true, _) => Some(keys[*b]),
                    (_, true) => Some(keys[*a]),
                    _ => None,
                })
                .collect();
            NetworkStub {
                my_verifying_key,
                all_peers: all_peers.clone(),
                unreachable,
                inbox: Arc::new(Mutex::new(inbox)),
                faults,
                held: Arc::new(Mutex::new((VecDeque::new(), false))),
            }
        })
        .collect()
}
