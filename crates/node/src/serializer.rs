//! The serializer event loop.

use ordinal_consensus::{FatalError, StateMachine};
use ordinal_core::{ActionResults, Actions, Msg};
use ordinal_types::NodeId;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Handle the host keeps while the serializer runs.
///
/// Dropping the handle (or calling [`SerializerHandle::done`]) terminates
/// the loop: in-flight inputs are discarded and no further actions are
/// produced.
pub struct SerializerHandle {
    propose_tx: mpsc::Sender<Vec<u8>>,
    step_tx: mpsc::Sender<(NodeId, Msg)>,
    results_tx: mpsc::Sender<ActionResults>,
    tick_tx: mpsc::Sender<()>,
    actions_rx: mpsc::Receiver<Actions>,
    done_tx: Option<oneshot::Sender<()>>,
}

impl SerializerHandle {
    /// Submit a client proposal.
    pub async fn propose(&self, data: Vec<u8>) -> bool {
        self.propose_tx.send(data).await.is_ok()
    }

    /// Deliver an inbound peer message.
    pub async fn step(&self, source: NodeId, msg: Msg) -> bool {
        self.step_tx.send((source, msg)).await.is_ok()
    }

    /// Deliver completed action results.
    pub async fn complete(&self, results: ActionResults) -> bool {
        self.results_tx.send(results).await.is_ok()
    }

    /// Drive timer-based progress.
    pub async fn tick(&self) -> bool {
        self.tick_tx.send(()).await.is_ok()
    }

    /// Take the next emitted actions record; `None` once the loop stopped.
    pub async fn actions(&mut self) -> Option<Actions> {
        self.actions_rx.recv().await
    }

    /// Signal the loop to stop.
    pub fn done(mut self) {
        if let Some(done_tx) = self.done_tx.take() {
            let _ = done_tx.send(());
        }
    }
}

impl Drop for SerializerHandle {
    fn drop(&mut self) {
        if let Some(done_tx) = self.done_tx.take() {
            let _ = done_tx.send(());
        }
    }
}

/// Single-threaded event loop around a [`StateMachine`].
///
/// At most one event is processed at a time; each event's non-empty action
/// record is emitted exactly once, and new inputs are not consumed while an
/// emitted record is still waiting on the consumer (the output channel
/// carries a single record).
pub struct Serializer {
    machine: StateMachine,
    propose_rx: mpsc::Receiver<Vec<u8>>,
    step_rx: mpsc::Receiver<(NodeId, Msg)>,
    results_rx: mpsc::Receiver<ActionResults>,
    tick_rx: mpsc::Receiver<()>,
    actions_tx: mpsc::Sender<Actions>,
    done_rx: oneshot::Receiver<()>,
}

impl Serializer {
    /// Wrap a state machine. `buffer_size` sizes the input channels (the
    /// host's `Config::buffer_size`).
    pub fn new(machine: StateMachine, buffer_size: usize) -> (Self, SerializerHandle) {
        let buffer = buffer_size.max(1);
        let (propose_tx, propose_rx) = mpsc::channel(buffer);
        let (step_tx, step_rx) = mpsc::channel(buffer);
        let (results_tx, results_rx) = mpsc::channel(buffer);
        let (tick_tx, tick_rx) = mpsc::channel(buffer);
        let (actions_tx, actions_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = oneshot::channel();

        let serializer = Self {
            machine,
            propose_rx,
            step_rx,
            results_rx,
            tick_rx,
            actions_tx,
            done_rx,
        };
        let handle = SerializerHandle {
            propose_tx,
            step_tx,
            results_tx,
            tick_tx,
            actions_rx,
            done_tx: Some(done_tx),
        };
        (serializer, handle)
    }

    /// Run until the done signal (clean stop, `Ok`) or a fatal protocol
    /// violation (`Err`). Consumes the loop; the machine state dies with it.
    pub async fn run(mut self) -> Result<(), FatalError> {
        let node = self.machine.id();
        info!(%node, "serializer running");

        let mut pending: Option<Actions> = None;
        loop {
            if let Some(actions) = pending.take() {
                // One record in flight: nothing else is consumed until the
                // host takes it. A done signal discards it.
                tokio::select! {
                    biased;
                    _ = &mut self.done_rx => {
                        debug!(%node, "serializer stopped with undelivered actions");
                        return Ok(());
                    }
                    sent = self.actions_tx.send(actions) => {
                        if sent.is_err() {
                            debug!(%node, "actions consumer went away");
                            return Ok(());
                        }
                    }
                }
                continue;
            }

            let result = tokio::select! {
                biased;
                _ = &mut self.done_rx => {
                    debug!(%node, "serializer stopped");
                    return Ok(());
                }
                Some(results) = self.results_rx.recv() => self.machine.apply(results),
                Some((source, msg)) = self.step_rx.recv() => self.machine.step(source, msg),
                Some(data) = self.propose_rx.recv() => self.machine.propose(data),
                Some(()) = self.tick_rx.recv() => self.machine.tick(),
                else => {
                    debug!(%node, "all input channels closed");
                    return Ok(());
                }
            };

            match result {
                Ok(actions) if !actions.is_empty() => pending = Some(actions),
                Ok(_) => {}
                Err(fatal) => {
                    // Terminal: surface the violation to whoever joins us.
                    return Err(fatal);
                }
            }
        }
    }

    /// Borrow the wrapped machine (status snapshots before `run`).
    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Mutable access for host-driven setup (epoch installation) before the
    /// loop starts.
    pub fn machine_mut(&mut self) -> &mut StateMachine {
        &mut self.machine
    }
}
