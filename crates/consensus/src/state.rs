//! Top-level state machine: input demultiplexing and fault containment.

use crate::checkpoints::CheckpointTracker;
use crate::epoch::ActiveEpoch;
use crate::nodemsgs::{Admission, NodeMsgs};
use crate::requests::{PoolUpdate, RequestPool};
use ordinal_core::{ActionResults, Actions, HashOrigin, Msg, Status};
use ordinal_types::{
    Config, ConfigError, Digest, EpochConfig, NetworkConfig, NodeId, SeqNo,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// A violation of the Byzantine fault assumptions.
///
/// The only error class that escapes the event loop. Once raised, the state
/// machine is halted: every further operation returns the same error and no
/// actions are produced. Recovery (state transfer) is a host concern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("local checkpoint value for seq {seq_no} disagrees with the network-committed value")]
    CheckpointDisagreement { seq_no: SeqNo },

    #[error("{leader} equivocated: conflicting preprepares for seq {seq_no} in {epoch}")]
    PreprepareEquivocation {
        leader: NodeId,
        epoch: ordinal_types::EpochNo,
        seq_no: SeqNo,
    },
}

/// Errors surfaced by operations that both validate configuration and run
/// protocol logic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateMachineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// The deterministic replica core.
///
/// Owns the checkpoint tracker, the per-peer admission gates, the client
/// request windows and (once the epoch-change collaborator installs one) the
/// active epoch. Strictly single-threaded; the serializer funnels all inputs
/// through one call at a time.
pub struct StateMachine {
    local: Arc<Config>,
    network: Arc<NetworkConfig>,

    tracker: CheckpointTracker,
    gates: BTreeMap<NodeId, NodeMsgs>,
    pool: RequestPool,
    epoch: Option<ActiveEpoch>,

    halted: Option<FatalError>,
}

impl StateMachine {
    /// Validate the configuration and build an idle machine. No epoch is
    /// active until [`StateMachine::set_active_epoch`] installs one.
    pub fn new(
        network: NetworkConfig,
        config: Config,
        initial_checkpoints: &BTreeMap<SeqNo, Digest>,
    ) -> Result<Self, ConfigError> {
        network.validate()?;
        if !network.nodes.contains(&config.id) {
            return Err(ConfigError::UnknownLocalNode { id: config.id });
        }

        let network = Arc::new(network);
        let config = Arc::new(config);

        let tracker = CheckpointTracker::new(initial_checkpoints, network.clone(), config.id)?;
        let gates = network
            .nodes
            .iter()
            .map(|id| {
                (
                    *id,
                    NodeMsgs::new(*id, network.number_of_buckets, config.buffer_size),
                )
            })
            .collect();

        Ok(Self {
            pool: RequestPool::new(network.clone(), config.clone()),
            local: config,
            network,
            tracker,
            gates,
            epoch: None,
            halted: None,
        })
    }

    pub fn id(&self) -> NodeId {
        self.local.id
    }

    /// Install the epoch the external epoch-change collaborator agreed on.
    ///
    /// Points every peer gate at the new epoch and replays anything they
    /// parked while no epoch was active.
    pub fn set_active_epoch(&mut self, epoch: EpochConfig) -> Result<Actions, StateMachineError> {
        if let Some(err) = &self.halted {
            return Err(err.clone().into());
        }
        epoch.validate(&self.network)?;

        let number = epoch.number;
        self.epoch = Some(ActiveEpoch::new(
            epoch,
            self.network.clone(),
            self.local.clone(),
        ));
        self.pool.reset_forwarding();

        let mut actions = Actions::default();

        // Batch whatever was already correct and available before the epoch
        // existed.
        for ready in self.pool.ready_requests() {
            if let Some(active) = self.epoch.as_mut() {
                actions.append(active.on_request_ready(ready, &mut self.pool));
            }
        }

        let mut replays = Vec::new();
        for (peer, gate) in self.gates.iter_mut() {
            let peer = *peer;
            for msg in gate.set_active_epoch(number) {
                replays.push((peer, msg));
            }
        }
        for (source, msg) in replays {
            match self.step_inner(source, msg) {
                Ok(more) => actions.append(more),
                Err(err) => {
                    self.halted = Some(err.clone());
                    return Err(err.into());
                }
            }
        }

        self.note_commits(&actions);
        Ok(actions)
    }

    /// Attribute a proposal to the local client.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<Actions, FatalError> {
        self.guarded(|sm| Ok(sm.pool.propose(data)))
    }

    /// Admit and route one inbound message.
    pub fn step(&mut self, source: NodeId, msg: Msg) -> Result<Actions, FatalError> {
        self.guarded(|sm| sm.step_inner(source, msg))
    }

    /// Resume slots and checkpoints whose host-side work completed.
    pub fn apply(&mut self, results: ActionResults) -> Result<Actions, FatalError> {
        self.guarded(|sm| sm.apply_inner(results))
    }

    /// Timer-driven progress: re-issue outstanding idempotent work.
    pub fn tick(&mut self) -> Result<Actions, FatalError> {
        self.guarded(|sm| {
            let mut actions = sm.pool.tick();
            if let Some(epoch) = sm.epoch.as_mut() {
                actions.append(epoch.tick());
            }
            Ok(actions)
        })
    }

    fn guarded<F>(&mut self, f: F) -> Result<Actions, FatalError>
    where
        F: FnOnce(&mut Self) -> Result<Actions, FatalError>,
    {
        if let Some(err) = &self.halted {
            return Err(err.clone());
        }
        match f(self) {
            Ok(actions) => {
                self.note_commits(&actions);
                Ok(actions)
            }
            Err(err) => {
                error!(%err, "halting state machine");
                self.halted = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Slide client windows past everything just delivered.
    fn note_commits(&mut self, actions: &Actions) {
        for entry in &actions.commits {
            for ack in &entry.batch {
                self.pool.mark_committed(ack);
            }
        }
    }

    fn watermarks(&self) -> (SeqNo, SeqNo) {
        match &self.epoch {
            Some(epoch) => (epoch.low_watermark(), epoch.high_watermark()),
            // Without an epoch there is no window to enforce; checkpoints
            // still flow.
            None => (SeqNo(0), SeqNo(u64::MAX)),
        }
    }

    fn step_inner(&mut self, source: NodeId, msg: Msg) -> Result<Actions, FatalError> {
        let (low, high) = self.watermarks();
        let Some(gate) = self.gates.get_mut(&source) else {
            warn!(%source, "message from unknown node");
            return Ok(Actions::default());
        };
        match gate.process(&msg, low, high) {
            Admission::Accept => self.route(source, msg),
            Admission::Buffered | Admission::Dropped(_) => Ok(Actions::default()),
        }
    }

    fn route(&mut self, source: NodeId, msg: Msg) -> Result<Actions, FatalError> {
        match msg {
            Msg::Preprepare {
                epoch,
                seq_no,
                batch,
            } => {
                let Some(active) = self.epoch.as_mut() else {
                    return Ok(Actions::default());
                };
                if active.epoch_no() != epoch {
                    return Ok(Actions::default());
                }
                active.apply_preprepare(source, seq_no, batch, &self.pool)
            }

            Msg::Prepare {
                epoch,
                seq_no,
                digest,
            } => Ok(self
                .active_for(epoch)
                .map(|active| active.apply_prepare(source, seq_no, digest))
                .unwrap_or_default()),

            Msg::Commit {
                epoch,
                seq_no,
                digest,
            } => Ok(self
                .active_for(epoch)
                .map(|active| active.apply_commit(source, seq_no, digest))
                .unwrap_or_default()),

            Msg::Checkpoint { seq_no, value } => {
                let changed = self.tracker.apply_checkpoint_msg(source, seq_no, value)?;
                let mut actions = Actions::default();
                if changed {
                    self.maybe_advance(&mut actions);
                }
                Ok(actions)
            }

            Msg::RequestAck(ack) => {
                let mut actions = Actions::default();
                if let Some(ready) = self.pool.apply_ack(source, &ack) {
                    if let Some(active) = self.epoch.as_mut() {
                        actions.append(active.on_request_ready(ready, &mut self.pool));
                    }
                }
                Ok(actions)
            }

            Msg::Forward { request, .. } => Ok(self.pool.supply_forward(request)),

            Msg::ForwardRequest { request, digest } => {
                let update = self.pool.supply_forward_request(request, digest);
                Ok(self.absorb_pool_update(update))
            }

            other => {
                // Epoch-change traffic is owned by the external collaborator.
                trace!(kind = ?other.kind(), "ignoring collaborator message");
                Ok(Actions::default())
            }
        }
    }

    fn active_for(&mut self, epoch: ordinal_types::EpochNo) -> Option<&mut ActiveEpoch> {
        self.epoch
            .as_mut()
            .filter(|active| active.epoch_no() == epoch)
    }

    fn absorb_pool_update(&mut self, update: PoolUpdate) -> Actions {
        let PoolUpdate {
            mut actions,
            available,
            ready,
        } = update;
        if let Some(active) = self.epoch.as_mut() {
            if let Some(ack) = available {
                actions.append(active.on_request_available(&ack));
            }
            if let Some(ready) = ready {
                actions.append(active.on_request_ready(ready, &mut self.pool));
            }
        }
        actions
    }

    fn apply_inner(&mut self, results: ActionResults) -> Result<Actions, FatalError> {
        let mut actions = Actions::default();

        for hash in results.hashes {
            match hash.origin {
                HashOrigin::Request { client_id, req_no } => {
                    let update = self
                        .pool
                        .apply_request_digest(&client_id, req_no, hash.digest);
                    actions.append(self.absorb_pool_update(update));
                }
                HashOrigin::Batch { epoch, seq_no } => {
                    if let Some(active) =
                        self.epoch.as_mut().filter(|a| a.epoch_no() == epoch)
                    {
                        actions.append(active.apply_batch_digest(seq_no, hash.digest, &self.pool));
                    }
                }
            }
        }

        for validation in results.validations {
            if let Some(active) = self.active_for(validation.epoch) {
                actions.append(active.apply_validate_result(validation.seq_no, validation.valid));
            }
            if !validation.valid {
                debug!(seq_no = %validation.seq_no, "validation failed, leader suspected");
            }
        }

        for ack in results.persisted {
            if let Some(active) = self.epoch.as_mut() {
                active.apply_persist_ack(ack.id);
            }
        }

        for checkpoint in results.checkpoints {
            let (cp_actions, changed) = self
                .tracker
                .apply_checkpoint_result(checkpoint.seq_no, checkpoint.value)?;
            actions.append(cp_actions);
            if changed {
                self.maybe_advance(&mut actions);
            }
        }

        Ok(actions)
    }

    fn maybe_advance(&mut self, actions: &mut Actions) {
        let Some(active) = self.epoch.as_mut() else {
            return;
        };
        if active.advance_watermarks(&self.tracker, actions) {
            let low = active.low_watermark();
            self.tracker.truncate(low);
            for gate in self.gates.values_mut() {
                gate.truncate(low);
            }
        }
    }

    /// Structured snapshot for the host; purely observational.
    pub fn status(&self) -> Status {
        let (low_watermark, high_watermark) = match &self.epoch {
            Some(epoch) => (epoch.low_watermark(), epoch.high_watermark()),
            None => (SeqNo(0), SeqNo(0)),
        };

        let leaders = self.epoch.as_ref().map(|e| e.leaders().to_vec());
        let nodes = self
            .gates
            .values()
            .map(|gate| {
                let mut node = gate.status(leaders.as_deref());
                if let Some(highest) = self.tracker.highest_for(node.id) {
                    node.last_checkpoint = highest;
                }
                if let Some(epoch) = &self.epoch {
                    node.suspicions = epoch.suspicions_of(node.id);
                }
                node
            })
            .collect();

        Status {
            node_id: self.local.id,
            low_watermark,
            high_watermark,
            active_epoch: self.epoch.as_ref().map(|e| e.epoch_no()),
            nodes,
            buckets: self.epoch.as_ref().map(|e| e.status()).unwrap_or_default(),
            checkpoints: self.tracker.status(),
            request_windows: self.pool.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordinal_types::{
        BatchParameters, ClientId, EpochNo, RequestAck, ReqNo, StableCheckpoint,
    };

    fn network(n: u64, f: u64, interval: u64, buckets: u64) -> NetworkConfig {
        NetworkConfig {
            nodes: (0..n).map(NodeId).collect(),
            f,
            checkpoint_interval: interval,
            number_of_buckets: buckets,
            max_epoch_length: 200,
            watermark_width: interval * 2,
        }
    }

    fn config(id: u64) -> Config {
        Config {
            id: NodeId(id),
            client_id: ClientId::from("client-1"),
            batch_parameters: BatchParameters { cut_size_bytes: 1 },
            buffer_size: 32,
        }
    }

    fn machine(n: u64, f: u64, interval: u64, buckets: u64) -> StateMachine {
        let initial = BTreeMap::from([(SeqNo(0), Digest::default())]);
        StateMachine::new(network(n, f, interval, buckets), config(0), &initial).unwrap()
    }

    fn epoch(number: u64, leaders: Vec<u64>) -> EpochConfig {
        EpochConfig {
            number: EpochNo(number),
            leaders: leaders.into_iter().map(NodeId).collect(),
            starting_checkpoint: StableCheckpoint::default(),
        }
    }

    #[test]
    fn construction_validates_configuration() {
        let initial = BTreeMap::from([(SeqNo(0), Digest::default())]);
        assert!(matches!(
            StateMachine::new(network(3, 1, 5, 1), config(0), &initial),
            Err(ConfigError::InsufficientNodes { .. })
        ));
        assert!(matches!(
            StateMachine::new(network(4, 1, 5, 1), config(9), &initial),
            Err(ConfigError::UnknownLocalNode { .. })
        ));
        assert_eq!(
            StateMachine::new(network(4, 1, 5, 1), config(0), &BTreeMap::new()).err(),
            Some(ConfigError::EmptyInitialCheckpoints)
        );
    }

    #[test]
    fn wrong_epoch_messages_are_discarded_until_switch() {
        let mut sm = machine(4, 1, 5, 1);
        sm.set_active_epoch(epoch(3, vec![0])).unwrap();

        let prepare = Msg::Prepare {
            epoch: EpochNo(4),
            seq_no: SeqNo(1),
            digest: Digest::from("d"),
        };
        let actions = sm.step(NodeId(1), prepare.clone()).unwrap();
        assert!(actions.is_empty());
        let before = sm.status();
        assert_eq!(before.nodes[1].rejected, 1);
        assert_eq!(before.nodes[1].admitted, 0);

        // Once the collaborator switches the epoch the same message is
        // admitted; the dropped copy is not replayed.
        sm.set_active_epoch(epoch(4, vec![0])).unwrap();
        sm.step(NodeId(1), prepare).unwrap();
        let after = sm.status();
        assert_eq!(after.nodes[1].rejected, 1);
        assert_eq!(after.nodes[1].admitted, 1);
    }

    #[test]
    fn messages_buffer_until_first_epoch() {
        let mut sm = machine(4, 1, 5, 4);
        // Leader 3's preprepare arrives before any epoch is active.
        let preprepare = Msg::Preprepare {
            epoch: EpochNo(2),
            seq_no: SeqNo(2),
            batch: vec![RequestAck {
                client_id: ClientId::from("client-1"),
                req_no: ReqNo(1),
                digest: Digest::from("request-digest"),
            }],
        };
        assert!(sm.step(NodeId(3), preprepare).unwrap().is_empty());

        // Installing the epoch replays it; the slot parks on the missing
        // request body rather than hashing.
        let actions = sm.set_active_epoch(epoch(2, vec![0, 1, 3, 2])).unwrap();
        assert!(actions.hash.is_empty());
        let status = sm.status();
        assert_eq!(status.nodes[3].admitted, 1);
    }

    #[test]
    fn halt_is_permanent() {
        let mut sm = machine(4, 1, 5, 1);
        sm.set_active_epoch(epoch(3, vec![0])).unwrap();

        sm.apply(ActionResults {
            checkpoints: vec![ordinal_core::CheckpointResult {
                seq_no: SeqNo(5),
                value: Digest::from("mine"),
            }],
            ..Default::default()
        })
        .unwrap();

        sm.step(
            NodeId(1),
            Msg::Checkpoint {
                seq_no: SeqNo(5),
                value: Digest::from("theirs"),
            },
        )
        .unwrap();
        let err = sm
            .step(
                NodeId(2),
                Msg::Checkpoint {
                    seq_no: SeqNo(5),
                    value: Digest::from("theirs"),
                },
            )
            .unwrap_err();
        assert_eq!(err, FatalError::CheckpointDisagreement { seq_no: SeqNo(5) });

        // Every further operation reports the same terminal error.
        assert_eq!(sm.propose(b"data".to_vec()).unwrap_err(), err);
        assert_eq!(sm.tick().unwrap_err(), err);
        assert_eq!(
            sm.step(NodeId(3), Msg::Checkpoint { seq_no: SeqNo(5), value: Digest::from("theirs") })
                .unwrap_err(),
            err
        );
    }

    #[test]
    fn collaborator_messages_are_ignored() {
        let mut sm = machine(4, 1, 5, 1);
        sm.set_active_epoch(epoch(3, vec![0])).unwrap();
        let actions = sm
            .step(
                NodeId(1),
                Msg::Suspect {
                    epoch: EpochNo(7),
                    suspect: NodeId(0),
                },
            )
            .unwrap();
        assert!(actions.is_empty());
    }
}
