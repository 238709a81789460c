//! Connections: the directed edges of the flow graph.
//!
//! A connection binds an immutable source/destination pair, subscribes to a
//! non-empty set of the source's relationship names, and owns the queue that
//! buffers flow files between the two endpoints. Endpoints never change
//! after creation; rerouting is delete-and-recreate.

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::Arc;

use crate::model::connectable::Connectable;
use crate::model::queue::FlowFileQueue;
use crate::types::Position;

/// A directed edge carrying flow files between two connectables.
pub struct Connection {
    id: String,
    /// Optional display name; status reporting falls back to the joined
    /// relationship names when unset.
    name: RwLock<Option<String>>,
    source: Arc<Connectable>,
    destination: Arc<Connectable>,
    relationships: RwLock<FxHashSet<String>>,
    bend_points: RwLock<Vec<Position>>,
    queue: FlowFileQueue,
}

impl Connection {
    /// Build a connection and register it on both endpoints.
    ///
    /// `relationships` must be non-empty; the caller (the controller façade)
    /// validates that every name is declared by the source.
    #[must_use]
    pub fn connect(
        id: impl Into<String>,
        source: Arc<Connectable>,
        destination: Arc<Connectable>,
        relationships: FxHashSet<String>,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            id: id.into(),
            name: RwLock::new(None),
            source: source.clone(),
            destination: destination.clone(),
            relationships: RwLock::new(relationships),
            bend_points: RwLock::new(Vec::new()),
            queue: FlowFileQueue::new(),
        });
        source.register_outgoing(&connection);
        destination.register_incoming(&connection);
        connection
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        *self.name.write() = name;
    }

    /// Display name for status: the explicit name when set, otherwise the
    /// subscribed relationship names joined with ", ".
    #[must_use]
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.read().clone() {
            if !name.is_empty() {
                return name;
            }
        }
        let mut names: Vec<String> = self.relationships.read().iter().cloned().collect();
        names.sort();
        names.join(", ")
    }

    #[must_use]
    pub fn source(&self) -> &Arc<Connectable> {
        &self.source
    }

    #[must_use]
    pub fn destination(&self) -> &Arc<Connectable> {
        &self.destination
    }

    #[must_use]
    pub fn relationships(&self) -> FxHashSet<String> {
        self.relationships.read().clone()
    }

    pub fn set_relationships(&self, relationships: FxHashSet<String>) {
        *self.relationships.write() = relationships;
    }

    /// Whether this connection subscribes to the given relationship name.
    #[must_use]
    pub fn subscribes_to(&self, relationship: &str) -> bool {
        self.relationships.read().contains(relationship)
    }

    #[must_use]
    pub fn bend_points(&self) -> Vec<Position> {
        self.bend_points.read().clone()
    }

    pub fn set_bend_points(&self, bends: Vec<Position>) {
        *self.bend_points.write() = bends;
    }

    #[must_use]
    pub fn queue(&self) -> &FlowFileQueue {
        &self.queue
    }

    /// Detach from both endpoints. Called by the owning group on removal,
    /// after verifying the queue is empty.
    pub(crate) fn detach(&self) {
        self.source.unregister_connection(&self.id);
        self.destination.unregister_connection(&self.id);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("source", &self.source.id())
            .field("destination", &self.destination.id())
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectableKind;

    fn endpoints() -> (Arc<Connectable>, Arc<Connectable>) {
        (
            Arc::new(Connectable::new("src", ConnectableKind::Processor, "src")),
            Arc::new(Connectable::new("dst", ConnectableKind::Funnel, "dst")),
        )
    }

    #[test]
    fn connect_registers_both_endpoints() {
        let (source, destination) = endpoints();
        let connection = Connection::connect(
            "c1",
            source.clone(),
            destination.clone(),
            FxHashSet::from_iter(["success".to_string()]),
        );

        assert_eq!(source.outgoing_connections().len(), 1);
        assert_eq!(destination.incoming_connections().len(), 1);
        assert!(connection.subscribes_to("success"));
        assert!(!connection.subscribes_to("failure"));
    }

    #[test]
    fn detach_unregisters_both_endpoints() {
        let (source, destination) = endpoints();
        let connection = Connection::connect(
            "c1",
            source.clone(),
            destination.clone(),
            FxHashSet::from_iter(["success".to_string()]),
        );

        connection.detach();
        assert!(source.outgoing_connections().is_empty());
        assert!(destination.incoming_connections().is_empty());
    }

    #[test]
    fn display_name_falls_back_to_relationships() {
        let (source, destination) = endpoints();
        let connection = Connection::connect(
            "c1",
            source,
            destination,
            FxHashSet::from_iter(["b".to_string(), "a".to_string()]),
        );
        assert_eq!(connection.display_name(), "a, b");

        connection.set_name(Some("my edge".to_string()));
        assert_eq!(connection.display_name(), "my edge");
    }
}
