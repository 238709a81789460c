//! Process groups: the recursive containers of the flow graph.
//!
//! A group owns its children (sub-groups, processors, ports, funnels,
//! labels, remote groups, and connections) behind one reader/writer lock.
//! Identifier uniqueness across the whole tree is enforced one level up by
//! the controller's global index; the group itself enforces the sibling
//! invariants: port-name uniqueness and removal preconditions.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::model::connectable::Connectable;
use crate::model::connection::Connection;
use crate::model::queue::QueueSize;
use crate::repository::SiteToSiteClient;
use crate::types::Position;

use miette::Diagnostic;
use thiserror::Error;

/// Structural errors raised by group mutations.
#[derive(Debug, Error, Diagnostic)]
pub enum GroupError {
    #[error("group {group_id} already has an input port named {name}")]
    #[diagnostic(code(floweave::group::duplicate_input_port_name))]
    DuplicateInputPortName { group_id: String, name: String },

    #[error("group {group_id} already has an output port named {name}")]
    #[diagnostic(code(floweave::group::duplicate_output_port_name))]
    DuplicateOutputPortName { group_id: String, name: String },

    #[error("component {id} is not a member of group {group_id}")]
    #[diagnostic(code(floweave::group::unknown_member))]
    UnknownMember { group_id: String, id: String },

    #[error("component {id} is running and must be stopped before removal")]
    #[diagnostic(code(floweave::group::remove_running))]
    RemoveRunning { id: String },

    #[error("connection {id} still holds {count} flow files and cannot be removed")]
    #[diagnostic(
        code(floweave::group::remove_nonempty_connection),
        help("Drain or expire the queue before removing the connection.")
    )]
    RemoveNonEmptyConnection { id: String, count: usize },
}

/// An inert annotation on the canvas.
pub struct Label {
    id: String,
    text: RwLock<String>,
    position: RwLock<Position>,
    size: RwLock<(f64, f64)>,
}

impl Label {
    #[must_use]
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: RwLock::new(text.into()),
            position: RwLock::new(Position::default()),
            size: RwLock::new((150.0, 150.0)),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn text(&self) -> String {
        self.text.read().clone()
    }

    pub fn set_text(&self, text: impl Into<String>) {
        *self.text.write() = text.into();
    }

    #[must_use]
    pub fn position(&self) -> Position {
        *self.position.read()
    }

    pub fn set_position(&self, position: Position) {
        *self.position.write() = position;
    }

    #[must_use]
    pub fn size(&self) -> (f64, f64) {
        *self.size.read()
    }

    pub fn set_size(&self, width: f64, height: f64) {
        *self.size.write() = (width, height);
    }
}

/// A port discovered on a remote instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemotePortDescriptor {
    pub id: String,
    pub name: String,
    pub target_running: bool,
}

/// Ports advertised by a remote instance, as returned by a refresh.
#[derive(Clone, Debug, Default)]
pub struct RemoteFlowContents {
    pub input_ports: Vec<RemotePortDescriptor>,
    pub output_ports: Vec<RemotePortDescriptor>,
}

/// A reference to a process group running on another instance.
///
/// Port descriptors are discovered by [`refresh_flow_contents`]
/// (RemoteProcessGroup::refresh_flow_contents) and cached; communications
/// failures are recorded, not propagated.
pub struct RemoteProcessGroup {
    id: String,
    target_uri: String,
    name: RwLock<String>,
    comments: RwLock<String>,
    position: RwLock<Position>,
    group_id: RwLock<String>,
    communications_timeout: RwLock<Duration>,
    yield_period: RwLock<Duration>,
    transmitting: AtomicBool,
    input_ports: RwLock<FxHashMap<String, RemotePortDescriptor>>,
    output_ports: RwLock<FxHashMap<String, RemotePortDescriptor>>,
    authorization_issue: RwLock<Option<String>>,
    client: RwLock<Option<Arc<dyn SiteToSiteClient>>>,
}

impl RemoteProcessGroup {
    #[must_use]
    pub fn new(id: impl Into<String>, target_uri: impl Into<String>) -> Self {
        let target_uri = target_uri.into();
        Self {
            id: id.into(),
            name: RwLock::new(target_uri.clone()),
            target_uri,
            comments: RwLock::new(String::new()),
            position: RwLock::new(Position::default()),
            group_id: RwLock::new(String::new()),
            communications_timeout: RwLock::new(Duration::from_secs(30)),
            yield_period: RwLock::new(Duration::from_secs(10)),
            transmitting: AtomicBool::new(false),
            input_ports: RwLock::new(FxHashMap::default()),
            output_ports: RwLock::new(FxHashMap::default()),
            authorization_issue: RwLock::new(None),
            client: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn target_uri(&self) -> &str {
        &self.target_uri
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    #[must_use]
    pub fn comments(&self) -> String {
        self.comments.read().clone()
    }

    pub fn set_comments(&self, comments: impl Into<String>) {
        *self.comments.write() = comments.into();
    }

    #[must_use]
    pub fn position(&self) -> Position {
        *self.position.read()
    }

    pub fn set_position(&self, position: Position) {
        *self.position.write() = position;
    }

    #[must_use]
    pub fn group_id(&self) -> String {
        self.group_id.read().clone()
    }

    pub fn set_group_id(&self, group_id: impl Into<String>) {
        *self.group_id.write() = group_id.into();
    }

    #[must_use]
    pub fn communications_timeout(&self) -> Duration {
        *self.communications_timeout.read()
    }

    pub fn set_communications_timeout(&self, timeout: Duration) {
        *self.communications_timeout.write() = timeout;
    }

    #[must_use]
    pub fn yield_period(&self) -> Duration {
        *self.yield_period.read()
    }

    pub fn set_yield_period(&self, period: Duration) {
        *self.yield_period.write() = period;
    }

    #[must_use]
    pub fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::SeqCst)
    }

    pub fn set_transmitting(&self, transmitting: bool) {
        self.transmitting.store(transmitting, Ordering::SeqCst);
    }

    pub fn set_client(&self, client: Arc<dyn SiteToSiteClient>) {
        *self.client.write() = Some(client);
    }

    #[must_use]
    pub fn input_ports(&self) -> Vec<RemotePortDescriptor> {
        self.input_ports.read().values().cloned().collect()
    }

    #[must_use]
    pub fn output_ports(&self) -> Vec<RemotePortDescriptor> {
        self.output_ports.read().values().cloned().collect()
    }

    pub fn set_input_ports(&self, ports: Vec<RemotePortDescriptor>) {
        let mut map = self.input_ports.write();
        map.clear();
        map.extend(ports.into_iter().map(|p| (p.id.clone(), p)));
    }

    pub fn set_output_ports(&self, ports: Vec<RemotePortDescriptor>) {
        let mut map = self.output_ports.write();
        map.clear();
        map.extend(ports.into_iter().map(|p| (p.id.clone(), p)));
    }

    /// Most recent authorisation failure reported by the remote side.
    #[must_use]
    pub fn authorization_issue(&self) -> Option<String> {
        self.authorization_issue.read().clone()
    }

    /// Re-discover the remote instance's port descriptors.
    ///
    /// Errors are returned for the caller to log; the cached descriptors
    /// keep their previous values on failure.
    pub async fn refresh_flow_contents(&self) -> Result<(), crate::repository::RepositoryError> {
        let client = self.client.read().clone();
        let Some(client) = client else {
            return Ok(());
        };
        let timeout = self.communications_timeout();
        match client.discover_ports(&self.target_uri, timeout).await {
            Ok(contents) => {
                self.set_input_ports(contents.input_ports);
                self.set_output_ports(contents.output_ports);
                *self.authorization_issue.write() = None;
                Ok(())
            }
            Err(error) => {
                if error.is_authorization() {
                    *self.authorization_issue.write() = Some(error.to_string());
                }
                Err(error)
            }
        }
    }
}

impl fmt::Debug for RemoteProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProcessGroup")
            .field("id", &self.id)
            .field("target_uri", &self.target_uri)
            .field("transmitting", &self.is_transmitting())
            .finish()
    }
}

#[derive(Default)]
struct GroupChildren {
    groups: FxHashMap<String, Arc<ProcessGroup>>,
    processors: FxHashMap<String, Arc<Connectable>>,
    input_ports: FxHashMap<String, Arc<Connectable>>,
    output_ports: FxHashMap<String, Arc<Connectable>>,
    funnels: FxHashMap<String, Arc<Connectable>>,
    labels: FxHashMap<String, Arc<Label>>,
    remote_groups: FxHashMap<String, Arc<RemoteProcessGroup>>,
    connections: FxHashMap<String, Arc<Connection>>,
}

/// A recursive container of connectables and sub-groups.
pub struct ProcessGroup {
    id: String,
    name: RwLock<String>,
    comments: RwLock<String>,
    position: RwLock<Position>,
    /// Parent group id; `None` iff this is the root group.
    parent_id: Option<String>,
    children: RwLock<GroupChildren>,
}

impl ProcessGroup {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: RwLock::new(name.into()),
            comments: RwLock::new(String::new()),
            position: RwLock::new(Position::default()),
            parent_id,
            children: RwLock::new(GroupChildren::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    #[must_use]
    pub fn comments(&self) -> String {
        self.comments.read().clone()
    }

    pub fn set_comments(&self, comments: impl Into<String>) {
        *self.comments.write() = comments.into();
    }

    #[must_use]
    pub fn position(&self) -> Position {
        *self.position.read()
    }

    pub fn set_position(&self, position: Position) {
        *self.position.write() = position;
    }

    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    // ---- membership ------------------------------------------------------

    pub fn add_group(&self, group: Arc<ProcessGroup>) {
        self.children
            .write()
            .groups
            .insert(group.id().to_string(), group);
    }

    pub fn add_processor(&self, processor: Arc<Connectable>) {
        processor.set_group_id(&self.id);
        self.children
            .write()
            .processors
            .insert(processor.id().to_string(), processor);
    }

    /// Add an input port, enforcing sibling name uniqueness.
    pub fn add_input_port(&self, port: Arc<Connectable>) -> Result<(), GroupError> {
        let mut children = self.children.write();
        if children
            .input_ports
            .values()
            .any(|existing| existing.name() == port.name())
        {
            return Err(GroupError::DuplicateInputPortName {
                group_id: self.id.clone(),
                name: port.name(),
            });
        }
        port.set_group_id(&self.id);
        children.input_ports.insert(port.id().to_string(), port);
        Ok(())
    }

    /// Add an output port, enforcing sibling name uniqueness.
    pub fn add_output_port(&self, port: Arc<Connectable>) -> Result<(), GroupError> {
        let mut children = self.children.write();
        if children
            .output_ports
            .values()
            .any(|existing| existing.name() == port.name())
        {
            return Err(GroupError::DuplicateOutputPortName {
                group_id: self.id.clone(),
                name: port.name(),
            });
        }
        port.set_group_id(&self.id);
        children.output_ports.insert(port.id().to_string(), port);
        Ok(())
    }

    pub fn add_funnel(&self, funnel: Arc<Connectable>) {
        funnel.set_group_id(&self.id);
        self.children
            .write()
            .funnels
            .insert(funnel.id().to_string(), funnel);
    }

    pub fn add_label(&self, label: Arc<Label>) {
        self.children
            .write()
            .labels
            .insert(label.id().to_string(), label);
    }

    pub fn add_remote_group(&self, remote: Arc<RemoteProcessGroup>) {
        remote.set_group_id(&self.id);
        self.children
            .write()
            .remote_groups
            .insert(remote.id().to_string(), remote);
    }

    pub fn add_connection(&self, connection: Arc<Connection>) {
        self.children
            .write()
            .connections
            .insert(connection.id().to_string(), connection);
    }

    /// Remove a processor, port, or funnel. The component must be stopped.
    pub fn remove_connectable(&self, id: &str) -> Result<Arc<Connectable>, GroupError> {
        let mut children = self.children.write();
        let found = children
            .processors
            .get(id)
            .or_else(|| children.input_ports.get(id))
            .or_else(|| children.output_ports.get(id))
            .or_else(|| children.funnels.get(id))
            .cloned();
        let Some(connectable) = found else {
            return Err(GroupError::UnknownMember {
                group_id: self.id.clone(),
                id: id.to_string(),
            });
        };
        if connectable.scheduled_state().is_running() {
            return Err(GroupError::RemoveRunning { id: id.to_string() });
        }
        children.processors.remove(id);
        children.input_ports.remove(id);
        children.output_ports.remove(id);
        children.funnels.remove(id);
        Ok(connectable)
    }

    /// Remove a connection. Its queue must be empty.
    pub fn remove_connection(&self, id: &str) -> Result<Arc<Connection>, GroupError> {
        let mut children = self.children.write();
        let Some(connection) = children.connections.get(id).cloned() else {
            return Err(GroupError::UnknownMember {
                group_id: self.id.clone(),
                id: id.to_string(),
            });
        };
        let size = connection.queue().size();
        if size.object_count > 0 {
            return Err(GroupError::RemoveNonEmptyConnection {
                id: id.to_string(),
                count: size.object_count,
            });
        }
        children.connections.remove(id);
        connection.detach();
        Ok(connection)
    }

    pub fn remove_label(&self, id: &str) -> Result<Arc<Label>, GroupError> {
        self.children
            .write()
            .labels
            .remove(id)
            .ok_or_else(|| GroupError::UnknownMember {
                group_id: self.id.clone(),
                id: id.to_string(),
            })
    }

    pub fn remove_remote_group(&self, id: &str) -> Result<Arc<RemoteProcessGroup>, GroupError> {
        self.children
            .write()
            .remote_groups
            .remove(id)
            .ok_or_else(|| GroupError::UnknownMember {
                group_id: self.id.clone(),
                id: id.to_string(),
            })
    }

    // ---- queries ---------------------------------------------------------

    #[must_use]
    pub fn groups(&self) -> Vec<Arc<ProcessGroup>> {
        self.children.read().groups.values().cloned().collect()
    }

    #[must_use]
    pub fn processors(&self) -> Vec<Arc<Connectable>> {
        self.children.read().processors.values().cloned().collect()
    }

    #[must_use]
    pub fn input_ports(&self) -> Vec<Arc<Connectable>> {
        self.children.read().input_ports.values().cloned().collect()
    }

    #[must_use]
    pub fn output_ports(&self) -> Vec<Arc<Connectable>> {
        self.children
            .read()
            .output_ports
            .values()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn funnels(&self) -> Vec<Arc<Connectable>> {
        self.children.read().funnels.values().cloned().collect()
    }

    #[must_use]
    pub fn labels(&self) -> Vec<Arc<Label>> {
        self.children.read().labels.values().cloned().collect()
    }

    #[must_use]
    pub fn remote_groups(&self) -> Vec<Arc<RemoteProcessGroup>> {
        self.children
            .read()
            .remote_groups
            .values()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.children.read().connections.values().cloned().collect()
    }

    /// Every connectable directly owned by this group.
    #[must_use]
    pub fn connectables(&self) -> Vec<Arc<Connectable>> {
        let children = self.children.read();
        children
            .processors
            .values()
            .chain(children.input_ports.values())
            .chain(children.output_ports.values())
            .chain(children.funnels.values())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn input_port_by_name(&self, name: &str) -> Option<Arc<Connectable>> {
        self.children
            .read()
            .input_ports
            .values()
            .find(|port| port.name() == name)
            .cloned()
    }

    #[must_use]
    pub fn output_port_by_name(&self, name: &str) -> Option<Arc<Connectable>> {
        self.children
            .read()
            .output_ports
            .values()
            .find(|port| port.name() == name)
            .cloned()
    }

    /// Depth-first search for a connectable anywhere under this group.
    #[must_use]
    pub fn find_connectable(&self, id: &str) -> Option<Arc<Connectable>> {
        {
            let children = self.children.read();
            let found = children
                .processors
                .get(id)
                .or_else(|| children.input_ports.get(id))
                .or_else(|| children.output_ports.get(id))
                .or_else(|| children.funnels.get(id))
                .cloned();
            if found.is_some() {
                return found;
            }
        }
        self.groups()
            .into_iter()
            .find_map(|group| group.find_connectable(id))
    }

    /// Depth-first search for a group anywhere under (or equal to) this one.
    #[must_use]
    pub fn find_group(self: &Arc<Self>, id: &str) -> Option<Arc<ProcessGroup>> {
        if self.id == id {
            return Some(self.clone());
        }
        self.groups().into_iter().find_map(|group| group.find_group(id))
    }

    /// All connections in this group and every descendant.
    #[must_use]
    pub fn find_all_connections(&self) -> Vec<Arc<Connection>> {
        let mut connections = self.connections();
        for group in self.groups() {
            connections.extend(group.find_all_connections());
        }
        connections
    }

    /// All remote groups in this group and every descendant.
    #[must_use]
    pub fn find_all_remote_groups(&self) -> Vec<Arc<RemoteProcessGroup>> {
        let mut remotes = self.remote_groups();
        for group in self.groups() {
            remotes.extend(group.find_all_remote_groups());
        }
        remotes
    }

    /// Sum of every queue in this subtree.
    #[must_use]
    pub fn total_queued(&self) -> QueueSize {
        let mut total = QueueSize::default();
        for connection in self.find_all_connections() {
            let size = connection.queue().size();
            total.object_count += size.object_count;
            total.byte_count += size.byte_count;
        }
        total
    }

    /// Whether any entity in this subtree carries the given id.
    #[must_use]
    pub fn contains_id(&self, id: &str) -> bool {
        if self.id == id {
            return true;
        }
        let children = self.children.read();
        if children.processors.contains_key(id)
            || children.input_ports.contains_key(id)
            || children.output_ports.contains_key(id)
            || children.funnels.contains_key(id)
            || children.labels.contains_key(id)
            || children.remote_groups.contains_key(id)
            || children.connections.contains_key(id)
        {
            return true;
        }
        drop(children);
        self.groups().into_iter().any(|group| group.contains_id(id))
    }

    /// Invoke shutdown hooks on every processor in the subtree.
    pub fn shutdown(&self) {
        for processor in self.processors() {
            if let Some(handle) = processor.processor() {
                handle.extension.sync_scope(|| handle.plugin.on_shutdown());
            }
        }
        for group in self.groups() {
            group.shutdown();
        }
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let children = self.children.read();
        f.debug_struct("ProcessGroup")
            .field("id", &self.id)
            .field("name", &self.name.read().clone())
            .field("processors", &children.processors.len())
            .field("groups", &children.groups.len())
            .field("connections", &children.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectableKind, ScheduledState};
    use rustc_hash::FxHashSet;

    fn processor(id: &str) -> Arc<Connectable> {
        Arc::new(Connectable::new(id, ConnectableKind::Processor, id))
    }

    #[test]
    fn sibling_port_names_must_be_unique() {
        let group = ProcessGroup::new("g1", "group", None);
        let a = Arc::new(Connectable::new("in1", ConnectableKind::InputPort, "in"));
        let b = Arc::new(Connectable::new("in2", ConnectableKind::InputPort, "in"));

        group.add_input_port(a).unwrap();
        let err = group.add_input_port(b).unwrap_err();
        assert!(matches!(err, GroupError::DuplicateInputPortName { .. }));
    }

    #[test]
    fn running_component_cannot_be_removed() {
        let group = ProcessGroup::new("g1", "group", None);
        let proc = processor("p1");
        group.add_processor(proc.clone());
        proc.store_scheduled_state(ScheduledState::Running);

        let err = group.remove_connectable("p1").unwrap_err();
        assert!(matches!(err, GroupError::RemoveRunning { .. }));

        proc.store_scheduled_state(ScheduledState::Stopped);
        assert!(group.remove_connectable("p1").is_ok());
    }

    #[test]
    fn nonempty_connection_cannot_be_removed() {
        let group = ProcessGroup::new("g1", "group", None);
        let src = processor("src");
        let dst = processor("dst");
        group.add_processor(src.clone());
        group.add_processor(dst.clone());
        let conn = Connection::connect(
            "c1",
            src,
            dst,
            FxHashSet::from_iter(["success".to_string()]),
        );
        group.add_connection(conn.clone());
        conn.queue()
            .put(crate::model::flowfile::FlowFileRecord::builder().id(1).build());

        let err = group.remove_connection("c1").unwrap_err();
        assert!(matches!(err, GroupError::RemoveNonEmptyConnection { .. }));

        let mut expired = Vec::new();
        conn.queue().poll(&mut expired);
        assert!(group.remove_connection("c1").is_ok());
    }

    #[test]
    fn recursive_find_traverses_subgroups() {
        let root = Arc::new(ProcessGroup::new("root", "root", None));
        let child = Arc::new(ProcessGroup::new("child", "child", Some("root".to_string())));
        let proc = processor("deep");
        child.add_processor(proc);
        root.add_group(child);

        assert!(root.find_connectable("deep").is_some());
        assert!(root.find_group("child").is_some());
        assert!(root.contains_id("deep"));
        assert!(!root.contains_id("missing"));
    }

    #[test]
    fn total_queued_sums_subtree() {
        let root = Arc::new(ProcessGroup::new("root", "root", None));
        let child = Arc::new(ProcessGroup::new("child", "child", Some("root".to_string())));
        let a = processor("a");
        let b = processor("b");
        let c = processor("c");
        let conn1 = Connection::connect(
            "c1",
            a.clone(),
            b.clone(),
            FxHashSet::from_iter(["x".to_string()]),
        );
        let conn2 = Connection::connect(
            "c2",
            b,
            c,
            FxHashSet::from_iter(["x".to_string()]),
        );
        root.add_connection(conn1.clone());
        child.add_connection(conn2.clone());
        root.add_group(child);

        conn1
            .queue()
            .put(crate::model::flowfile::FlowFileRecord::builder().id(1).size(10).build());
        conn2
            .queue()
            .put(crate::model::flowfile::FlowFileRecord::builder().id(2).size(5).build());

        let total = root.total_queued();
        assert_eq!(total.object_count, 2);
        assert_eq!(total.byte_count, 15);
    }
}
