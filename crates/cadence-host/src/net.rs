//! Narrow views of the networking layer that a script host talks to.

use tracing::trace;
use uuid::Uuid;

/// Role of a peer in the simulation network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// Aggregates audio streams
    AudioMixer,
    /// Aggregates avatar state
    AvatarMixer,
    EntityServer,
    Other,
}

/// A connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: Uuid,
    pub node_type: NodeType,
}

impl Node {
    pub fn new(id: Uuid, node_type: NodeType) -> Self {
        Self { id, node_type }
    }
}

/// Packet types a script host emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    MicrophoneAudioNoEcho = 3,
    SilentAudioFrame = 5,
    AvatarData = 6,
}

impl PacketType {
    pub fn version(self) -> u8 {
        match self {
            PacketType::MicrophoneAudioNoEcho | PacketType::SilentAudioFrame => 4,
            PacketType::AvatarData => 3,
        }
    }
}

/// Directory of connected peers, owned by the networking layer.
///
/// Implementations are shared between threads; the host only ever reads the
/// peer list and hands datagrams over for unreliable delivery.
pub trait NodeDirectory: Send + Sync {
    /// Visit every connected peer
    fn each_node(&self, visitor: &mut dyn FnMut(&Node));

    /// Send one datagram to one peer
    fn send_datagram(&self, bytes: &[u8], node: &Node);

    /// Start a packet of the given type: `[type][version]`
    fn populate_header(&self, packet_type: PacketType) -> Vec<u8> {
        vec![packet_type as u8, packet_type.version()]
    }

    /// Peers of one role, collected so sends happen outside `each_node`
    fn nodes_of_type(&self, node_type: NodeType) -> Vec<Node> {
        let mut nodes = Vec::new();
        self.each_node(&mut |node| {
            if node.node_type == node_type {
                nodes.push(node.clone());
            }
        });
        nodes
    }

    /// Send the same datagram to every peer of one role
    fn broadcast_to_nodes(&self, bytes: &[u8], node_type: NodeType) -> usize {
        let nodes = self.nodes_of_type(node_type);
        for node in &nodes {
            self.send_datagram(bytes, node);
        }
        nodes.len()
    }
}

/// Queue of outgoing entity edit messages
pub trait EntityPacketSender: Send + Sync {
    fn servers_exist(&self) -> bool;
    fn release_queued_messages(&self);
    /// Whether the sender runs its own thread
    fn is_threaded(&self) -> bool;
    /// Push queued packets out on the caller's thread
    fn process(&self);
}

/// Release queued entity edits and, for an unthreaded sender, send them now
pub fn flush_entity_edits(sender: &dyn EntityPacketSender) {
    if !sender.servers_exist() {
        return;
    }

    sender.release_queued_messages();
    if !sender.is_threaded() {
        trace!(target: "scripting", "Processing entity edits inline");
        sender.process();
    }
}
