//! Thread-per-node orchestration of several simulators.
//!
//! Each node runs its own run loop on a dedicated thread between [`Simulation::start`]
//! and [`Simulation::join`]. Nodes only interact through what the host wires between
//! them (shared devices, clock events posting through a [`crate::SimHandle`]).

use std::collections::BTreeMap;
use std::fmt;
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::sim::{SimHandle, Simulator};
use crate::{RunOutcome, SimError};

/// Key of a node inside a [`Simulation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Raw key value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type RunResult = Result<RunOutcome, SimError>;

enum Node {
    Parked(Box<Simulator>),
    Running {
        handle: SimHandle,
        thread: JoinHandle<(Box<Simulator>, RunResult)>,
    },
}

/// A set of nodes run concurrently.
#[derive(Default)]
pub struct Simulation {
    next_id: u32,
    nodes: BTreeMap<NodeId, Node>,
}

impl Simulation {
    /// Creates an empty simulation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parked node.
    pub fn add_node(&mut self, simulator: Simulator) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        debug!("adding node {} as {id}", simulator.id());
        self.nodes.insert(id, Node::Parked(Box::new(simulator)));
        id
    }

    /// Removes a node, stopping and joining it first when it runs.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::NodeMissing`] for an unknown key and
    /// [`SimError::NodePanicked`] when the node's thread panicked.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Simulator, SimError> {
        let node = self
            .nodes
            .remove(&id)
            .ok_or(SimError::NodeMissing { id: id.0 })?;
        let simulator = match node {
            Node::Parked(simulator) => simulator,
            Node::Running { handle, thread } => {
                handle.stop();
                let (simulator, _) = Self::join_thread(id, thread)?;
                simulator
            }
        };
        debug!("removed node {id}");
        Ok(*simulator)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` without nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Keys of all nodes in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Parked node; `None` while it runs or when unknown.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Simulator> {
        match self.nodes.get(&id)? {
            Node::Parked(simulator) => Some(simulator.as_ref()),
            Node::Running { .. } => None,
        }
    }

    /// Parked node, mutable.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Simulator> {
        match self.nodes.get_mut(&id)? {
            Node::Parked(simulator) => Some(simulator.as_mut()),
            Node::Running { .. } => None,
        }
    }

    /// Handle of a node, available while it runs.
    #[must_use]
    pub fn handle(&self, id: NodeId) -> Option<SimHandle> {
        match self.nodes.get(&id)? {
            Node::Parked(simulator) => Some(simulator.handle()),
            Node::Running { handle, .. } => Some(handle.clone()),
        }
    }

    /// Returns `true` while any node has a thread.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.nodes
            .values()
            .any(|node| matches!(node, Node::Running { .. }))
    }

    /// Starts every parked node on its own thread.
    pub fn start(&mut self) {
        let parked: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, node)| matches!(node, Node::Parked(_)))
            .map(|(id, _)| *id)
            .collect();
        debug!("starting {} node(s)", parked.len());
        for id in parked {
            let Some(Node::Parked(mut simulator)) = self.nodes.remove(&id) else {
                continue;
            };
            let handle = simulator.handle();
            let thread = thread::spawn(move || {
                let result = simulator.start();
                (simulator, result)
            });
            self.nodes.insert(id, Node::Running { handle, thread });
        }
    }

    /// Asks every running node to stop at its next boundary.
    pub fn stop(&self) {
        for node in self.nodes.values() {
            if let Node::Running { handle, .. } = node {
                handle.stop();
            }
        }
    }

    /// Waits for every running node and parks it again.
    ///
    /// Returns each joined node's run result. A node whose thread panicked is removed
    /// and reported as [`SimError::NodePanicked`].
    pub fn join(&mut self) -> Vec<(NodeId, RunResult)> {
        let running: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, node)| matches!(node, Node::Running { .. }))
            .map(|(id, _)| *id)
            .collect();
        let mut results = Vec::with_capacity(running.len());
        for id in running {
            let Some(Node::Running { thread, .. }) = self.nodes.remove(&id) else {
                continue;
            };
            match Self::join_thread(id, thread) {
                Ok((simulator, result)) => {
                    self.nodes.insert(id, Node::Parked(simulator));
                    results.push((id, result));
                }
                Err(err) => results.push((id, Err(err))),
            }
        }
        debug!("joined {} node(s)", results.len());
        results
    }

    /// Stops and joins every node, keeping them for a later [`Self::start`].
    pub fn pause(&mut self) -> Vec<(NodeId, RunResult)> {
        self.stop();
        self.join()
    }

    fn join_thread(
        id: NodeId,
        thread: JoinHandle<(Box<Simulator>, RunResult)>,
    ) -> Result<(Box<Simulator>, RunResult), SimError> {
        let (simulator, result) = thread.join().map_err(|_| {
            warn!("node {id} panicked");
            SimError::NodePanicked { id: id.0 }
        })?;
        // A stop that raced with BREAK or a fault must not end the next run early.
        let _ = simulator.interpreter().handle().take_stop();
        Ok((simulator, result))
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        if self.is_running() {
            self.pause();
        }
    }
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_map();
        for (id, node) in &self.nodes {
            match node {
                Node::Parked(simulator) => list.entry(id, simulator),
                Node::Running { handle, .. } => list.entry(id, handle),
            };
        }
        list.finish()
    }
}
