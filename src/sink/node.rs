//! Sink node: owns the endpoint and answers the orchestrator's lifecycle calls

use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::enumerator::Enumerator;
use crate::error::{SinkError, SinkResult};
use crate::pipeline::BufferPool;
use crate::sink::endpoint::SinkEndpoint;
use crate::SinkConfig;

/// Lifecycle state as seen by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Stopped,
    Paused,
    Running,
}

/// Graph a node has joined, seen only through a weak back-reference
pub trait FilterGraph: Send + Sync {
    fn name(&self) -> &str;
}

pub type PinEnumerator = Enumerator<Arc<SinkEndpoint>>;

pub struct NodeInfo {
    pub name: String,
    pub graph: Option<Arc<dyn FilterGraph>>,
}

impl fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeInfo")
            .field("name", &self.name)
            .field("graph", &self.graph.as_ref().map(|g| g.name().to_string()))
            .finish()
    }
}

/// Terminal node of the capture graph.
///
/// The lifecycle calls are acknowledgements: nothing in the endpoint or pool
/// depends on them, frames are accepted whenever the endpoint is connected.
pub struct SinkNode {
    name: String,
    endpoint: Arc<SinkEndpoint>,
    pins: Arc<[Arc<SinkEndpoint>]>,
    state: NodeState,
    started_at: Option<DateTime<Utc>>,
    graph: Option<Weak<dyn FilterGraph>>,
}

impl SinkNode {
    pub fn new(config: &SinkConfig, pool: Arc<BufferPool>) -> Self {
        let endpoint = SinkEndpoint::new(&config.name, config.accepted_formats.clone(), pool);
        Self::with_endpoint(&config.name, endpoint)
    }

    pub fn with_endpoint(name: &str, endpoint: SinkEndpoint) -> Self {
        let endpoint = Arc::new(endpoint);
        endpoint.set_owner(name);
        Self {
            name: name.to_string(),
            pins: Arc::from(vec![Arc::clone(&endpoint)]),
            endpoint,
            state: NodeState::Stopped,
            started_at: None,
            graph: None,
        }
    }

    pub fn endpoint(&self) -> &Arc<SinkEndpoint> {
        &self.endpoint
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// When the current run started, if running
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn run(&mut self, start: DateTime<Utc>) {
        self.started_at = Some(start);
        self.transition(NodeState::Running);
    }

    pub fn pause(&mut self) {
        self.transition(NodeState::Paused);
    }

    pub fn stop(&mut self) {
        self.started_at = None;
        self.transition(NodeState::Stopped);
    }

    fn transition(&mut self, to: NodeState) {
        let from = std::mem::replace(&mut self.state, to);
        if from != to {
            info!(node = %self.name, ?from, ?to, "node state changed");
        }
    }

    /// Cursor over the node's pins (just the one endpoint)
    pub fn pins(&self) -> PinEnumerator {
        PinEnumerator::new(Arc::clone(&self.pins))
    }

    pub fn find_pin(&self, id: &str) -> SinkResult<Arc<SinkEndpoint>> {
        self.pins
            .iter()
            .find(|pin| pin.id() == id)
            .cloned()
            .ok_or_else(|| SinkError::PinNotFound(id.to_string()))
    }

    /// Record the graph this node now belongs to and the name it goes by there
    pub fn join_graph(&mut self, graph: Weak<dyn FilterGraph>, name: &str) {
        self.name = name.to_string();
        self.endpoint.set_owner(name);
        self.graph = Some(graph);
        info!(node = %self.name, "joined graph");
    }

    pub fn leave_graph(&mut self) {
        self.graph = None;
    }

    /// Name plus the owning graph, if it is still alive
    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            name: self.name.clone(),
            graph: self.graph.as_ref().and_then(Weak::upgrade),
        }
    }
}
