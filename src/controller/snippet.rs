//! Snippet instantiation: adding a pre-validated sub-graph to a target
//! group in one atomic step.
//!
//! Validation runs first and checks everything that can fail; only a fully
//! valid snippet mutates the controller, so a rejected call leaves the
//! target group untouched. Instantiation order is labels, funnels, ports,
//! processors, remote groups, child groups (recursively), connections.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::controller::{ControllerError, FlowController};
use crate::model::connectable::{Connectable, ProcessorHandle};
use crate::model::connection::Connection;
use crate::model::group::{Label, ProcessGroup, RemoteProcessGroup};
use crate::types::{ConnectableKind, Position, SchedulingStrategy};

/// Snippet validation failures. Any of these leaves the live graph
/// unchanged.
#[derive(Debug, Error, Diagnostic)]
pub enum SnippetError {
    #[error("snippet identifier {id} already exists in the flow")]
    #[diagnostic(code(floweave::snippet::duplicate_id))]
    DuplicateId { id: String },

    #[error("snippet contains identifier {id} more than once")]
    #[diagnostic(code(floweave::snippet::duplicate_within_snippet))]
    DuplicateWithinSnippet { id: String },

    #[error("group {group_id} already has an input port named {name}")]
    #[diagnostic(code(floweave::snippet::input_port_name_collision))]
    InputPortNameCollision { group_id: String, name: String },

    #[error("group {group_id} already has an output port named {name}")]
    #[diagnostic(code(floweave::snippet::output_port_name_collision))]
    OutputPortNameCollision { group_id: String, name: String },

    #[error("invalid processor type: {type_name}")]
    #[diagnostic(code(floweave::snippet::unknown_processor_type))]
    UnknownProcessorType { type_name: String },

    #[error("invalid flow-file prioritizer type: {type_name}")]
    #[diagnostic(code(floweave::snippet::unknown_prioritizer_type))]
    UnknownPrioritizerType { type_name: String },

    #[error("connection {connection_id} references {endpoint_id}, which is neither in the snippet nor in the flow")]
    #[diagnostic(code(floweave::snippet::dangling_connection))]
    DanglingConnection {
        connection_id: String,
        endpoint_id: String,
    },
}

/// A label in a snippet.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LabelSpec {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
}

/// A funnel in a snippet.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FunnelSpec {
    pub id: String,
    #[serde(default)]
    pub position: Position,
}

/// A port in a snippet.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PortSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,
}

/// A processor in a snippet.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcessorSpec {
    pub id: String,
    pub type_name: String,
    pub name: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub scheduling_strategy: Option<SchedulingStrategy>,
    #[serde(default)]
    pub scheduling_period_millis: Option<u64>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,
    #[serde(default)]
    pub yield_millis: Option<u64>,
    #[serde(default)]
    pub penalization_millis: Option<u64>,
    #[serde(default)]
    pub properties: FxHashMap<String, String>,
    #[serde(default)]
    pub auto_terminated: Vec<String>,
}

/// A remote process group in a snippet.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RemoteGroupSpec {
    pub id: String,
    pub target_uri: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub communications_timeout_millis: Option<u64>,
    #[serde(default)]
    pub yield_millis: Option<u64>,
}

/// A child group in a snippet.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GroupSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub contents: FlowSnippet,
}

/// A connection in a snippet.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub id: String,
    pub source_id: String,
    pub destination_id: String,
    #[serde(default)]
    pub relationships: Vec<String>,
    #[serde(default)]
    pub prioritizers: Vec<String>,
    #[serde(default)]
    pub back_pressure_object_threshold: Option<usize>,
    #[serde(default)]
    pub back_pressure_byte_threshold: Option<u64>,
    #[serde(default)]
    pub flowfile_expiration_millis: Option<u64>,
    #[serde(default)]
    pub bend_points: Vec<Position>,
}

/// A serialisable sub-graph.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FlowSnippet {
    #[serde(default)]
    pub labels: Vec<LabelSpec>,
    #[serde(default)]
    pub funnels: Vec<FunnelSpec>,
    #[serde(default)]
    pub input_ports: Vec<PortSpec>,
    #[serde(default)]
    pub output_ports: Vec<PortSpec>,
    #[serde(default)]
    pub processors: Vec<ProcessorSpec>,
    #[serde(default)]
    pub remote_groups: Vec<RemoteGroupSpec>,
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
}

impl FlowSnippet {
    fn collect_ids<'a>(&'a self, out: &mut Vec<&'a str>) {
        for label in &self.labels {
            out.push(&label.id);
        }
        for funnel in &self.funnels {
            out.push(&funnel.id);
        }
        for port in self.input_ports.iter().chain(&self.output_ports) {
            out.push(&port.id);
        }
        for processor in &self.processors {
            out.push(&processor.id);
        }
        for remote in &self.remote_groups {
            out.push(&remote.id);
        }
        for connection in &self.connections {
            out.push(&connection.id);
        }
        for group in &self.groups {
            out.push(&group.id);
            group.contents.collect_ids(out);
        }
    }

    fn collect_processors<'a>(&'a self, out: &mut Vec<&'a ProcessorSpec>) {
        out.extend(self.processors.iter());
        for group in &self.groups {
            group.contents.collect_processors(out);
        }
    }

    fn collect_connections<'a>(&'a self, out: &mut Vec<&'a ConnectionSpec>) {
        out.extend(self.connections.iter());
        for group in &self.groups {
            group.contents.collect_connections(out);
        }
    }

    /// Ids of every vertex a connection may legally reference: funnels,
    /// ports, and processors, at any nesting depth. Labels, connections,
    /// and group ids are deliberately excluded.
    fn collect_connectable_ids<'a>(&'a self, out: &mut FxHashSet<&'a str>) {
        for funnel in &self.funnels {
            out.insert(&funnel.id);
        }
        for port in self.input_ports.iter().chain(&self.output_ports) {
            out.insert(&port.id);
        }
        for processor in &self.processors {
            out.insert(&processor.id);
        }
        for group in &self.groups {
            group.contents.collect_connectable_ids(out);
        }
    }
}

impl FlowController {
    /// Add a snippet to the target group atomically. Validation failures
    /// raise before any mutation, so the group is byte-for-byte unchanged
    /// on error.
    #[tracing::instrument(skip(self, snippet), err)]
    pub fn instantiate_snippet(
        &self,
        group_id: &str,
        snippet: &FlowSnippet,
    ) -> Result<(), ControllerError> {
        let _write = self.lock.write();
        let group = self
            .root_group
            .find_group(group_id)
            .ok_or_else(|| ControllerError::UnknownGroup {
                id: group_id.to_string(),
            })?;

        self.validate_snippet(&group, snippet)?;
        self.instantiate_into(&group, snippet)?;
        Ok(())
    }

    fn validate_snippet(
        &self,
        group: &Arc<ProcessGroup>,
        snippet: &FlowSnippet,
    ) -> Result<(), SnippetError> {
        // Identifier uniqueness: within the snippet and against the flow.
        let mut ids = Vec::new();
        snippet.collect_ids(&mut ids);
        let mut seen = FxHashSet::default();
        for id in &ids {
            if !seen.insert(*id) {
                return Err(SnippetError::DuplicateWithinSnippet {
                    id: (*id).to_string(),
                });
            }
            if self.id_in_use(id) {
                return Err(SnippetError::DuplicateId {
                    id: (*id).to_string(),
                });
            }
        }

        // Port name collisions against the target group's siblings.
        for port in &snippet.input_ports {
            if group.input_port_by_name(&port.name).is_some() {
                return Err(SnippetError::InputPortNameCollision {
                    group_id: group.id().to_string(),
                    name: port.name.clone(),
                });
            }
        }
        for port in &snippet.output_ports {
            if group.output_port_by_name(&port.name).is_some() {
                return Err(SnippetError::OutputPortNameCollision {
                    group_id: group.id().to_string(),
                    name: port.name.clone(),
                });
            }
        }

        // Every processor type and prioritizer type must be registered.
        let mut processors = Vec::new();
        snippet.collect_processors(&mut processors);
        for processor in processors {
            if !self.registry.has_processor(&processor.type_name) {
                return Err(SnippetError::UnknownProcessorType {
                    type_name: processor.type_name.clone(),
                });
            }
        }

        let mut connections = Vec::new();
        snippet.collect_connections(&mut connections);
        // Endpoints must resolve to a vertex: a connectable the snippet
        // brings along, or one already live in the flow. An id that merely
        // exists (a label, a connection, a group) is not a valid endpoint.
        let mut snippet_connectables = FxHashSet::default();
        snippet.collect_connectable_ids(&mut snippet_connectables);
        for connection in connections {
            for prioritizer in &connection.prioritizers {
                if !self.registry.has_prioritizer(prioritizer) {
                    return Err(SnippetError::UnknownPrioritizerType {
                        type_name: prioritizer.clone(),
                    });
                }
            }
            for endpoint in [&connection.source_id, &connection.destination_id] {
                if !snippet_connectables.contains(endpoint.as_str())
                    && self.root_group.find_connectable(endpoint).is_none()
                {
                    return Err(SnippetError::DanglingConnection {
                        connection_id: connection.id.clone(),
                        endpoint_id: endpoint.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    fn instantiate_into(
        &self,
        group: &Arc<ProcessGroup>,
        snippet: &FlowSnippet,
    ) -> Result<(), ControllerError> {
        for spec in &snippet.labels {
            self.claim_id(&spec.id)?;
            let label = Arc::new(Label::new(&spec.id, &spec.text));
            label.set_position(spec.position);
            if let (Some(width), Some(height)) = (spec.width, spec.height) {
                label.set_size(width, height);
            }
            group.add_label(label);
        }

        for spec in &snippet.funnels {
            self.claim_id(&spec.id)?;
            let funnel = Arc::new(Connectable::new(&spec.id, ConnectableKind::Funnel, "Funnel"));
            funnel.set_position(spec.position);
            group.add_funnel(funnel);
        }

        for spec in &snippet.input_ports {
            self.claim_id(&spec.id)?;
            let kind = if group.is_root() {
                ConnectableKind::RootInputPort
            } else {
                ConnectableKind::InputPort
            };
            let port = Arc::new(Connectable::new(&spec.id, kind, &spec.name));
            port.set_position(spec.position);
            port.set_comments(&spec.comments);
            if let Some(max) = spec.max_concurrent_tasks {
                port.set_max_concurrent_tasks(max);
            }
            group.add_input_port(port)?;
        }

        for spec in &snippet.output_ports {
            self.claim_id(&spec.id)?;
            let kind = if group.is_root() {
                ConnectableKind::RootOutputPort
            } else {
                ConnectableKind::OutputPort
            };
            let port = Arc::new(Connectable::new(&spec.id, kind, &spec.name));
            port.set_position(spec.position);
            port.set_comments(&spec.comments);
            if let Some(max) = spec.max_concurrent_tasks {
                port.set_max_concurrent_tasks(max);
            }
            group.add_output_port(port)?;
        }

        for spec in &snippet.processors {
            self.claim_id(&spec.id)?;
            let (plugin, extension) = self.registry.create_processor(&spec.type_name)?;
            let handle = ProcessorHandle::new(&spec.type_name, plugin, extension);
            let processor = Arc::new(
                Connectable::new(&spec.id, ConnectableKind::Processor, &spec.name)
                    .with_processor(handle),
            );
            processor.set_position(spec.position);
            processor.set_comments(&spec.comments);
            if let Some(strategy) = spec.scheduling_strategy {
                processor.set_scheduling_strategy(strategy);
            }
            // Strategy is applied before the values it interprets.
            if let Some(max) = spec.max_concurrent_tasks {
                processor.set_max_concurrent_tasks(max);
            }
            if let Some(millis) = spec.scheduling_period_millis {
                processor.set_scheduling_period(Duration::from_millis(millis));
            }
            if let Some(expression) = &spec.cron_expression {
                processor.set_cron_expression(Some(expression.clone()));
            }
            if let Some(millis) = spec.yield_millis {
                processor.set_yield_period(Duration::from_millis(millis));
            }
            if let Some(millis) = spec.penalization_millis {
                processor.set_penalization_period(Duration::from_millis(millis));
            }
            if let Some(handle) = processor.processor() {
                for (key, value) in &spec.properties {
                    handle.set_property(key, value);
                }
                handle.set_auto_terminated(spec.auto_terminated.iter().cloned().collect());
                handle.extension.sync_scope(|| handle.plugin.on_added());
            }
            group.add_processor(processor);
        }

        for spec in &snippet.remote_groups {
            self.claim_id(&spec.id)?;
            let remote = Arc::new(RemoteProcessGroup::new(&spec.id, &spec.target_uri));
            remote.set_position(spec.position);
            remote.set_comments(&spec.comments);
            if let Some(millis) = spec.communications_timeout_millis {
                remote.set_communications_timeout(Duration::from_millis(millis));
            }
            if let Some(millis) = spec.yield_millis {
                remote.set_yield_period(Duration::from_millis(millis));
            }
            if let Some(client) = &self.site_to_site_client {
                remote.set_client(client.clone());
            }
            group.add_remote_group(remote);
        }

        for spec in &snippet.groups {
            self.claim_id(&spec.id)?;
            let child = Arc::new(ProcessGroup::new(
                &spec.id,
                &spec.name,
                Some(group.id().to_string()),
            ));
            child.set_position(spec.position);
            child.set_comments(&spec.comments);
            group.add_group(child.clone());
            self.instantiate_into(&child, &spec.contents)?;
        }

        for spec in &snippet.connections {
            self.claim_id(&spec.id)?;
            let source = self
                .root_group
                .find_connectable(&spec.source_id)
                .ok_or_else(|| ControllerError::UnknownComponent {
                    id: spec.source_id.clone(),
                })?;
            let destination = self
                .root_group
                .find_connectable(&spec.destination_id)
                .ok_or_else(|| ControllerError::UnknownComponent {
                    id: spec.destination_id.clone(),
                })?;
            let relationships: FxHashSet<String> = if spec.relationships.is_empty() {
                FxHashSet::from_iter([crate::model::ANONYMOUS_RELATIONSHIP.to_string()])
            } else {
                spec.relationships.iter().cloned().collect()
            };
            let connection =
                Connection::connect(&spec.id, source, destination.clone(), relationships);
            if let Some(threshold) = spec.back_pressure_object_threshold {
                connection.queue().set_back_pressure_object_threshold(threshold);
            }
            if let Some(threshold) = spec.back_pressure_byte_threshold {
                connection.queue().set_back_pressure_byte_threshold(threshold);
            }
            if let Some(millis) = spec.flowfile_expiration_millis {
                connection
                    .queue()
                    .set_flowfile_expiration(Duration::from_millis(millis));
            }
            if !spec.prioritizers.is_empty() {
                let mut chain = Vec::with_capacity(spec.prioritizers.len());
                for name in &spec.prioritizers {
                    chain.push(self.registry.prioritizer(name)?);
                }
                connection.queue().set_prioritizers(chain);
            }
            connection.set_bend_points(spec.bend_points.clone());
            self.wire_readiness(&connection, destination);
            group.add_connection(connection);
        }

        Ok(())
    }
}
