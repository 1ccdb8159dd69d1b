//! In-process mailbox transport with disconnect tracking.
//!
//! A [`Mailbox`] is a typed, at-most-once-per-message delivery endpoint;
//! its [`Address`] can be copied into wire messages and sent across
//! threads. Delivery is fire-and-forget: messages to a peer that is down,
//! or to a mailbox that has been dropped, vanish silently. The
//! [`MailboxManager`] tracks which peers are still reachable and hands out
//! per-peer disconnect signals.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::cluster::identity::PeerId;
use crate::cluster::signal::Signal;

/// Address of a [`Mailbox`]. Cloning is cheap; every clone delivers to the
/// same mailbox.
pub struct Address<T> {
    peer: PeerId,
    tx: Sender<T>,
}

impl<T> Address<T> {
    /// Peer that owns the destination mailbox.
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

impl<T> Clone for Address<T> {
    fn clone(&self) -> Self {
        Self {
            peer: self.peer,
            tx: self.tx.clone(),
        }
    }
}

impl<T> fmt::Debug for Address<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.peer)
    }
}

/// Receiving end of a typed mailbox. Dropping it guarantees no further
/// delivery.
pub struct Mailbox<T> {
    rx: Receiver<T>,
}

impl<T> Mailbox<T> {
    /// Create a mailbox owned by `peer` and its address.
    pub fn new(peer: PeerId) -> (Mailbox<T>, Address<T>) {
        let (tx, rx) = unbounded();
        (Mailbox { rx }, Address { peer, tx })
    }

    /// Receiver for use in `select!` waits.
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}

#[derive(Default)]
struct PeerState {
    down: bool,
    lost: Signal,
}

/// Connectivity registry for the in-process transport.
#[derive(Clone)]
pub struct MailboxManager {
    local: PeerId,
    peers: Arc<Mutex<HashMap<PeerId, PeerState>>>,
}

impl MailboxManager {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Identity of the process this manager runs in; reply mailboxes are
    /// created under it.
    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    /// Reply mailbox owned by the local peer.
    pub fn mailbox<T>(&self) -> (Mailbox<T>, Address<T>) {
        Mailbox::new(self.local)
    }

    /// Signal pulsed when `peer` is lost. Pre-pulsed if it already is.
    pub fn disconnect_watcher(&self, peer: PeerId) -> Signal {
        let mut peers = self.peers.lock().unwrap_or_else(|err| err.into_inner());
        let state = peers.entry(peer).or_default();
        let signal = state.lost.clone();
        if state.down {
            signal.pulse();
        }
        signal
    }

    /// Mark `peer` unreachable and pulse every watcher on it.
    pub fn disconnect(&self, peer: PeerId) {
        let signal = {
            let mut peers = self.peers.lock().unwrap_or_else(|err| err.into_inner());
            let state = peers.entry(peer).or_default();
            state.down = true;
            state.lost.clone()
        };
        signal.pulse();
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        let peers = self.peers.lock().unwrap_or_else(|err| err.into_inner());
        peers.get(&peer).is_none_or(|state| !state.down)
    }

    /// Fire-and-forget send.
    pub fn send<T>(&self, addr: &Address<T>, message: T) {
        if !self.is_connected(addr.peer) {
            return;
        }
        let _ = addr.tx.send(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::TryRecvError;

    #[test]
    fn send_delivers_to_live_peer() {
        let manager = MailboxManager::new(PeerId::fresh());
        let peer = PeerId::fresh();
        let (mailbox, addr) = Mailbox::<u32>::new(peer);
        manager.send(&addr, 7);
        assert_eq!(mailbox.receiver().try_recv(), Ok(7));
    }

    #[test]
    fn send_to_disconnected_peer_is_dropped() {
        let manager = MailboxManager::new(PeerId::fresh());
        let peer = PeerId::fresh();
        let (mailbox, addr) = Mailbox::<u32>::new(peer);
        manager.disconnect(peer);
        manager.send(&addr, 7);
        assert_eq!(mailbox.receiver().try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn send_to_dropped_mailbox_is_silent() {
        let manager = MailboxManager::new(PeerId::fresh());
        let peer = PeerId::fresh();
        let (mailbox, addr) = Mailbox::<u32>::new(peer);
        drop(mailbox);
        manager.send(&addr, 7);
    }

    #[test]
    fn disconnect_pulses_existing_and_later_watchers() {
        let manager = MailboxManager::new(PeerId::fresh());
        let peer = PeerId::fresh();
        let before = manager.disconnect_watcher(peer);
        assert!(!before.is_pulsed());
        manager.disconnect(peer);
        assert!(before.is_pulsed());
        let after = manager.disconnect_watcher(peer);
        assert!(after.is_pulsed());
        assert!(!manager.is_connected(peer));
    }
}
