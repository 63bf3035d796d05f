//! Client request windows.
//!
//! Tracks every request the replica has heard of, per `(client, req_no)`:
//! the digests peers have acked, the body once it is available locally, and
//! whether a some-correct quorum vouches for one digest. A request becomes
//! *ready* — eligible for batching — once it is both correct and available.

use ordinal_core::{Actions, Msg, RequestWindowStatus};
use ordinal_types::{ClientId, Config, Digest, NetworkConfig, NodeId, ReqNo, Request, RequestAck};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// A request that just became correct and available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyRequest {
    pub ack: RequestAck,
    pub size: usize,
}

/// Everything that changed in the pool as a consequence of one input.
#[derive(Debug, Default)]
pub struct PoolUpdate {
    pub actions: Actions,
    /// A body became available under this ack; slots parked on it can move.
    pub available: Option<RequestAck>,
    /// The request crossed the correct+available bar for the first time.
    pub ready: Option<ReadyRequest>,
}

#[derive(Default)]
struct RequestEntry {
    /// Ack sets per digest, deduplicated by source.
    acks: BTreeMap<Digest, BTreeSet<NodeId>>,
    /// The digest backed by a some-correct quorum, once one exists.
    correct_digest: Option<Digest>,
    /// Our own hash of the body, once computed.
    my_digest: Option<Digest>,
    /// Bodies by digest.
    bodies: BTreeMap<Digest, Request>,
    /// A body whose hash is still outstanding.
    unhashed: Option<Request>,
    acked_locally: bool,
    ready_reported: bool,
    forwarded: bool,
    committed: bool,
}

struct ClientWindow {
    /// Lowest request number still tracked; everything below was committed
    /// and garbage-collected.
    low_req_no: ReqNo,
    entries: BTreeMap<ReqNo, RequestEntry>,
}

impl ClientWindow {
    fn new() -> Self {
        Self {
            low_req_no: ReqNo(1),
            entries: BTreeMap::new(),
        }
    }
}

/// All client request windows known to this replica.
pub struct RequestPool {
    windows: BTreeMap<ClientId, ClientWindow>,
    next_local_req_no: ReqNo,
    config: Arc<Config>,
    network: Arc<NetworkConfig>,
}

impl RequestPool {
    pub fn new(network: Arc<NetworkConfig>, config: Arc<Config>) -> Self {
        Self {
            windows: BTreeMap::new(),
            next_local_req_no: ReqNo(1),
            config,
            network,
        }
    }

    fn entry(&mut self, client_id: &ClientId, req_no: ReqNo) -> Option<&mut RequestEntry> {
        let window = self
            .windows
            .entry(client_id.clone())
            .or_insert_with(ClientWindow::new);
        if req_no < window.low_req_no {
            trace!(client = %client_id, %req_no, "request below client window");
            return None;
        }
        Some(window.entries.entry(req_no).or_default())
    }

    /// Attribute a proposal to the local client and request its digest.
    pub fn propose(&mut self, data: Vec<u8>) -> Actions {
        let req_no = self.next_local_req_no;
        self.next_local_req_no = req_no.next();

        let request = Request {
            client_id: self.config.client_id.clone(),
            req_no,
            data,
        };

        let mut actions = Actions::default();
        actions.hash_request(&request);

        let client_id = request.client_id.clone();
        if let Some(entry) = self.entry(&client_id, req_no) {
            entry.unhashed = Some(request);
        }
        actions
    }

    /// The host hashed a request body.
    pub fn apply_request_digest(
        &mut self,
        client_id: &ClientId,
        req_no: ReqNo,
        digest: Digest,
    ) -> PoolUpdate {
        let mut update = PoolUpdate::default();
        let Some(entry) = self.entry(client_id, req_no) else {
            return update;
        };
        let Some(request) = entry.unhashed.take() else {
            // Replayed completion; the slot of work was already absorbed.
            return update;
        };

        entry.my_digest = Some(digest.clone());
        entry.bodies.insert(digest.clone(), request);

        let ack = RequestAck {
            client_id: client_id.clone(),
            req_no,
            digest,
        };

        if !entry.acked_locally {
            entry.acked_locally = true;
            update.actions.send(Msg::RequestAck(ack.clone()));
        }

        update.available = Some(ack);
        update.ready = Self::check_ready(entry);
        update
    }

    /// A peer (possibly ourselves, via loopback) acked a request digest.
    pub fn apply_ack(&mut self, source: NodeId, ack: &RequestAck) -> Option<ReadyRequest> {
        let some_correct = self.network.some_correct_quorum();
        let entry = self.entry(&ack.client_id, ack.req_no)?;
        if entry.committed {
            return None;
        }

        let agreeing = entry.acks.entry(ack.digest.clone()).or_default();
        if !agreeing.insert(source) {
            return None;
        }

        if entry.correct_digest.is_none() && agreeing.len() >= some_correct {
            entry.correct_digest = Some(ack.digest.clone());
            debug!(client = %ack.client_id, req_no = %ack.req_no, "request proven correct");
        }

        Self::check_ready(entry)
    }

    /// A request body arrived via `Forward`; hash it unless we already know
    /// (or are computing) its digest.
    pub fn supply_forward(&mut self, request: Request) -> Actions {
        let mut actions = Actions::default();
        let client_id = request.client_id.clone();
        let req_no = request.req_no;
        let Some(entry) = self.entry(&client_id, req_no) else {
            return actions;
        };
        if entry.committed || entry.my_digest.is_some() || entry.unhashed.is_some() {
            return actions;
        }
        actions.hash_request(&request);
        entry.unhashed = Some(request);
        actions
    }

    /// A request body arrived with its digest attached (leader forward).
    pub fn supply_forward_request(&mut self, request: Request, digest: Digest) -> PoolUpdate {
        let mut update = PoolUpdate::default();
        let client_id = request.client_id.clone();
        let req_no = request.req_no;
        let Some(entry) = self.entry(&client_id, req_no) else {
            return update;
        };
        if entry.committed || entry.bodies.contains_key(&digest) {
            return update;
        }

        entry.bodies.insert(digest.clone(), request);
        update.available = Some(RequestAck {
            client_id,
            req_no,
            digest,
        });
        update.ready = Self::check_ready(entry);
        update
    }

    fn check_ready(entry: &mut RequestEntry) -> Option<ReadyRequest> {
        if entry.ready_reported || entry.committed {
            return None;
        }
        let digest = entry.correct_digest.clone()?;
        let body = entry.bodies.get(&digest)?;
        entry.ready_reported = true;
        Some(ReadyRequest {
            size: body.data.len(),
            ack: RequestAck {
                client_id: body.client_id.clone(),
                req_no: body.req_no,
                digest,
            },
        })
    }

    /// Whether a some-correct quorum vouches for exactly this ack's digest.
    pub fn is_correct(&self, ack: &RequestAck) -> bool {
        self.windows
            .get(&ack.client_id)
            .and_then(|w| w.entries.get(&ack.req_no))
            .map(|e| e.correct_digest.as_ref() == Some(&ack.digest))
            .unwrap_or(false)
    }

    /// The body for an ack, if available locally.
    pub fn body(&self, ack: &RequestAck) -> Option<&Request> {
        self.windows
            .get(&ack.client_id)
            .and_then(|w| w.entries.get(&ack.req_no))
            .and_then(|e| e.bodies.get(&ack.digest))
    }

    /// Record that the body was unicast to its bucket leader; returns false
    /// if it already was.
    pub fn mark_forwarded(&mut self, ack: &RequestAck) -> bool {
        let Some(entry) = self
            .windows
            .get_mut(&ack.client_id)
            .and_then(|w| w.entries.get_mut(&ack.req_no))
        else {
            return false;
        };
        if entry.forwarded {
            return false;
        }
        entry.forwarded = true;
        true
    }

    /// The request was delivered in a committed batch; slide the client
    /// window past any contiguous committed prefix.
    pub fn mark_committed(&mut self, ack: &RequestAck) {
        let Some(window) = self.windows.get_mut(&ack.client_id) else {
            return;
        };
        if let Some(entry) = window.entries.get_mut(&ack.req_no) {
            entry.committed = true;
        }
        while let Some(entry) = window.entries.get(&window.low_req_no) {
            if !entry.committed {
                break;
            }
            window.entries.remove(&window.low_req_no);
            window.low_req_no = window.low_req_no.next();
        }
    }

    /// Every request currently correct, available and undelivered. Used when
    /// a new epoch is installed to re-seed its batching state.
    pub fn ready_requests(&self) -> Vec<ReadyRequest> {
        let mut ready = Vec::new();
        for window in self.windows.values() {
            for entry in window.entries.values() {
                if entry.committed {
                    continue;
                }
                let Some(digest) = &entry.correct_digest else {
                    continue;
                };
                if let Some(body) = entry.bodies.get(digest) {
                    ready.push(ReadyRequest {
                        size: body.data.len(),
                        ack: RequestAck {
                            client_id: body.client_id.clone(),
                            req_no: body.req_no,
                            digest: digest.clone(),
                        },
                    });
                }
            }
        }
        ready
    }

    /// Forget which bodies were forwarded; leadership may have moved.
    pub fn reset_forwarding(&mut self) {
        for window in self.windows.values_mut() {
            for entry in window.entries.values_mut() {
                entry.forwarded = false;
            }
        }
    }

    /// Re-request the digests of bodies whose hash never completed.
    pub fn tick(&mut self) -> Actions {
        let mut actions = Actions::default();
        for window in self.windows.values() {
            for entry in window.entries.values() {
                if let Some(request) = &entry.unhashed {
                    actions.hash_request(request);
                }
            }
        }
        actions
    }

    pub fn status(&self) -> Vec<RequestWindowStatus> {
        self.windows
            .iter()
            .map(|(client_id, window)| {
                let high = window
                    .entries
                    .keys()
                    .next_back()
                    .copied()
                    .unwrap_or(window.low_req_no);
                RequestWindowStatus {
                    client_id: client_id.clone(),
                    low_req_no: window.low_req_no,
                    high_req_no: high,
                    correct: window
                        .entries
                        .iter()
                        .filter(|(_, e)| e.correct_digest.is_some())
                        .map(|(req_no, _)| *req_no)
                        .collect(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordinal_types::BatchParameters;

    fn pool(n: u64, f: u64) -> RequestPool {
        let network = Arc::new(NetworkConfig {
            nodes: (0..n).map(NodeId).collect(),
            f,
            checkpoint_interval: 5,
            number_of_buckets: 1,
            max_epoch_length: 200,
            watermark_width: 10,
        });
        let config = Arc::new(Config {
            id: NodeId(0),
            client_id: ClientId::from("client-1"),
            batch_parameters: BatchParameters { cut_size_bytes: 1 },
            buffer_size: 32,
        });
        RequestPool::new(network, config)
    }

    fn ack(req_no: u64, digest: &str) -> RequestAck {
        RequestAck {
            client_id: ClientId::from("client-1"),
            req_no: ReqNo(req_no),
            digest: Digest::from(digest),
        }
    }

    #[test]
    fn propose_hashes_then_acks() {
        let mut p = pool(4, 1);
        let actions = p.propose(b"data".to_vec());
        assert_eq!(actions.hash.len(), 1);
        assert!(actions.broadcast.is_empty());

        let update =
            p.apply_request_digest(&ClientId::from("client-1"), ReqNo(1), Digest::from("d"));
        assert_eq!(
            update.actions.broadcast,
            vec![Msg::RequestAck(ack(1, "d"))]
        );
        // Not ready until a quorum of acks lands.
        assert!(update.ready.is_none());
        assert_eq!(update.available, Some(ack(1, "d")));
    }

    #[test]
    fn ready_needs_correctness_and_availability() {
        let mut p = pool(4, 1);
        p.propose(b"data".to_vec());
        p.apply_request_digest(&ClientId::from("client-1"), ReqNo(1), Digest::from("d"));

        assert!(p.apply_ack(NodeId(0), &ack(1, "d")).is_none());
        let ready = p.apply_ack(NodeId(1), &ack(1, "d")).expect("quorum");
        assert_eq!(ready.ack, ack(1, "d"));
        assert_eq!(ready.size, 4);

        // Only reported once.
        assert!(p.apply_ack(NodeId(2), &ack(1, "d")).is_none());
        assert!(p.is_correct(&ack(1, "d")));
    }

    #[test]
    fn split_acks_do_not_reach_quorum() {
        let mut p = pool(4, 1);
        p.propose(b"data".to_vec());
        p.apply_request_digest(&ClientId::from("client-1"), ReqNo(1), Digest::from("d"));
        p.apply_ack(NodeId(1), &ack(1, "x"));
        p.apply_ack(NodeId(2), &ack(1, "y"));
        assert!(!p.is_correct(&ack(1, "d")));
        assert!(!p.is_correct(&ack(1, "x")));
    }

    #[test]
    fn duplicate_acks_from_one_source_count_once() {
        let mut p = pool(4, 1);
        p.propose(b"data".to_vec());
        p.apply_request_digest(&ClientId::from("client-1"), ReqNo(1), Digest::from("d"));
        assert!(p.apply_ack(NodeId(1), &ack(1, "d")).is_none());
        assert!(p.apply_ack(NodeId(1), &ack(1, "d")).is_none());
        assert!(!p.is_correct(&ack(1, "d")));
    }

    #[test]
    fn forwarded_body_becomes_available_for_quorum() {
        // Another replica's request: acks arrive first, the leader's
        // ForwardRequest supplies the body.
        let mut p = pool(4, 1);
        p.apply_ack(NodeId(1), &ack(1, "d"));
        assert!(p.apply_ack(NodeId(2), &ack(1, "d")).is_none()); // correct, not available

        let request = Request {
            client_id: ClientId::from("client-1"),
            req_no: ReqNo(1),
            data: b"data".to_vec(),
        };
        let update = p.supply_forward_request(request, Digest::from("d"));
        assert_eq!(update.available, Some(ack(1, "d")));
        assert_eq!(update.ready.expect("ready").ack, ack(1, "d"));
    }

    #[test]
    fn forward_without_digest_is_hashed() {
        let mut p = pool(4, 1);
        let request = Request {
            client_id: ClientId::from("client-1"),
            req_no: ReqNo(1),
            data: b"data".to_vec(),
        };
        let actions = p.supply_forward(request.clone());
        assert_eq!(actions.hash.len(), 1);
        // A second copy does not re-hash.
        assert!(p.supply_forward(request).is_empty());

        let update =
            p.apply_request_digest(&ClientId::from("client-1"), ReqNo(1), Digest::from("d"));
        assert_eq!(update.actions.broadcast.len(), 1);
    }

    #[test]
    fn window_slides_past_committed_requests() {
        let mut p = pool(4, 1);
        p.propose(b"one".to_vec());
        p.apply_request_digest(&ClientId::from("client-1"), ReqNo(1), Digest::from("d1"));
        p.apply_ack(NodeId(0), &ack(1, "d1"));
        p.apply_ack(NodeId(1), &ack(1, "d1"));

        p.mark_committed(&ack(1, "d1"));
        let status = p.status();
        assert_eq!(status[0].low_req_no, ReqNo(2));

        // Replayed acks below the window are inert.
        assert!(p.apply_ack(NodeId(2), &ack(1, "d1")).is_none());
        assert!(!p.is_correct(&ack(1, "d1")));
    }

    #[test]
    fn tick_reissues_outstanding_hashes() {
        let mut p = pool(4, 1);
        p.propose(b"data".to_vec());
        let actions = p.tick();
        assert_eq!(actions.hash.len(), 1);
        p.apply_request_digest(&ClientId::from("client-1"), ReqNo(1), Digest::from("d"));
        assert!(p.tick().is_empty());
    }
}
