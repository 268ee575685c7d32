pub mod endpoint;
pub mod node;

pub use endpoint::{
    AllocatorProperties, ConnectionState, Peer, PeerRef, PinDirection, PinInfo, SinkEndpoint,
};
pub use node::{FilterGraph, NodeInfo, NodeState, PinEnumerator, SinkNode};
