mod common;

use floweave::controller::snippet::{
    ConnectionSpec, FlowSnippet, FunnelSpec, GroupSpec, LabelSpec, PortSpec, ProcessorSpec,
};

use common::*;

fn simple_snippet() -> FlowSnippet {
    FlowSnippet {
        funnels: vec![FunnelSpec {
            id: "snip-funnel".into(),
            ..Default::default()
        }],
        input_ports: vec![PortSpec {
            id: "snip-in".into(),
            name: "ingest".into(),
            ..Default::default()
        }],
        processors: vec![ProcessorSpec {
            id: "snip-proc".into(),
            type_name: "GenerateProcessor".into(),
            name: "generator".into(),
            ..Default::default()
        }],
        connections: vec![ConnectionSpec {
            id: "snip-conn".into(),
            source_id: "snip-proc".into(),
            destination_id: "snip-funnel".into(),
            relationships: vec!["success".into()],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn group_fingerprint(harness: &Harness, group_id: &str) -> (usize, usize, Vec<String>) {
    let group = harness.controller.group(group_id).unwrap();
    let mut port_names: Vec<String> = group
        .input_ports()
        .iter()
        .map(|port| port.name())
        .collect();
    port_names.sort();
    (
        group.connectables().len(),
        group.connections().len(),
        port_names,
    )
}

#[tokio::test]
async fn snippet_instantiates_in_order() {
    let harness = standalone_harness().await;
    let controller = &harness.controller;
    let root = harness.root();

    controller.instantiate_snippet(&root, &simple_snippet()).unwrap();

    let group = controller.group(&root).unwrap();
    assert!(group.find_connectable("snip-proc").is_some());
    assert!(group.find_connectable("snip-funnel").is_some());
    assert!(group.input_port_by_name("ingest").is_some());
    assert_eq!(group.connections().len(), 1);

    // The instantiated processor is fully usable.
    controller.start_processor("snip-proc").unwrap();
    controller.stop_processor("snip-proc").unwrap();
}

#[tokio::test]
async fn unknown_processor_type_leaves_group_unchanged() {
    let harness = standalone_harness().await;
    let controller = &harness.controller;
    let root = harness.root();

    controller
        .create_local_input_port(&root, "existing-port", "existing")
        .unwrap();
    let before = group_fingerprint(&harness, &root);

    let mut snippet = simple_snippet();
    snippet.processors[0].type_name = "NoSuchProcessor".into();

    let err = controller
        .instantiate_snippet(&root, &snippet)
        .unwrap_err();
    assert!(err.to_string().contains("invalid processor type"));

    assert_eq!(group_fingerprint(&harness, &root), before);
    // None of the snippet ids leaked into the flow.
    assert!(controller.find_connectable("snip-proc").is_none());
    assert!(controller.find_connectable("snip-funnel").is_none());
}

#[tokio::test]
async fn duplicate_identifier_anywhere_rejects_snippet() {
    let harness = standalone_harness().await;
    let controller = &harness.controller;
    let root = harness.root();

    let child = controller
        .create_process_group(&root, "child", "child group")
        .unwrap();
    controller
        .create_processor(child.id(), "NoopProcessor", "snip-proc", "occupies id")
        .unwrap();
    let before = group_fingerprint(&harness, &root);

    let err = controller
        .instantiate_snippet(&root, &simple_snippet())
        .unwrap_err();
    assert!(err.to_string().contains("already exists in the flow"));
    assert_eq!(group_fingerprint(&harness, &root), before);
}

#[tokio::test]
async fn port_name_collision_rejects_snippet() {
    let harness = standalone_harness().await;
    let controller = &harness.controller;
    let root = harness.root();

    controller
        .create_local_input_port(&root, "port-1", "ingest")
        .unwrap();
    let before = group_fingerprint(&harness, &root);

    let err = controller
        .instantiate_snippet(&root, &simple_snippet())
        .unwrap_err();
    assert!(err.to_string().contains("already has an input port named"));
    assert_eq!(group_fingerprint(&harness, &root), before);
}

#[tokio::test]
async fn unknown_prioritizer_rejects_snippet() {
    let harness = standalone_harness().await;
    let controller = &harness.controller;
    let root = harness.root();
    let before = group_fingerprint(&harness, &root);

    let mut snippet = simple_snippet();
    snippet.connections[0].prioritizers = vec!["NoSuchPrioritizer".into()];

    let err = controller
        .instantiate_snippet(&root, &snippet)
        .unwrap_err();
    assert!(err.to_string().contains("invalid flow-file prioritizer type"));
    assert_eq!(group_fingerprint(&harness, &root), before);
}

#[tokio::test]
async fn nested_groups_instantiate_recursively() {
    let harness = standalone_harness().await;
    let controller = &harness.controller;
    let root = harness.root();

    let snippet = FlowSnippet {
        groups: vec![GroupSpec {
            id: "nested".into(),
            name: "nested group".into(),
            contents: FlowSnippet {
                processors: vec![ProcessorSpec {
                    id: "nested-proc".into(),
                    type_name: "NoopProcessor".into(),
                    name: "inner".into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }],
        connections: vec![],
        ..Default::default()
    };

    controller.instantiate_snippet(&root, &snippet).unwrap();
    assert!(controller.group("nested").is_some());
    assert!(controller.find_connectable("nested-proc").is_some());

    // Nested ids are claimed globally.
    let err = controller
        .create_funnel(&root, "nested-proc")
        .unwrap_err();
    assert!(err.to_string().contains("already in use"));
}

#[tokio::test]
async fn snippet_connection_may_reference_existing_components() {
    let harness = standalone_harness().await;
    let controller = &harness.controller;
    let root = harness.root();

    controller.create_funnel(&root, "existing-funnel").unwrap();

    let snippet = FlowSnippet {
        processors: vec![ProcessorSpec {
            id: "snip-proc".into(),
            type_name: "GenerateProcessor".into(),
            name: "generator".into(),
            ..Default::default()
        }],
        connections: vec![ConnectionSpec {
            id: "bridge".into(),
            source_id: "snip-proc".into(),
            destination_id: "existing-funnel".into(),
            relationships: vec!["success".into()],
            ..Default::default()
        }],
        ..Default::default()
    };
    controller.instantiate_snippet(&root, &snippet).unwrap();
    assert!(controller.find_connection("bridge").is_some());

    // A dangling endpoint is caught by validation.
    let dangling = FlowSnippet {
        connections: vec![ConnectionSpec {
            id: "dangling".into(),
            source_id: "ghost".into(),
            destination_id: "existing-funnel".into(),
            relationships: vec![],
            ..Default::default()
        }],
        ..Default::default()
    };
    let err = controller
        .instantiate_snippet(&root, &dangling)
        .unwrap_err();
    assert!(err.to_string().contains("neither in the snippet nor in the flow"));
}

#[tokio::test]
async fn connection_endpoint_must_be_a_connectable() {
    let harness = standalone_harness().await;
    let controller = &harness.controller;
    let root = harness.root();

    // The id exists in the flow, but names a label, not a vertex.
    controller
        .create_label(&root, "note-1", "a note")
        .unwrap();
    controller.create_funnel(&root, "f1").unwrap();
    let before = group_fingerprint(&harness, &root);

    let snippet = FlowSnippet {
        funnels: vec![FunnelSpec {
            id: "snip-funnel".into(),
            ..Default::default()
        }],
        connections: vec![ConnectionSpec {
            id: "to-label".into(),
            source_id: "snip-funnel".into(),
            destination_id: "note-1".into(),
            relationships: vec![],
            ..Default::default()
        }],
        ..Default::default()
    };
    let err = controller
        .instantiate_snippet(&root, &snippet)
        .unwrap_err();
    assert!(err.to_string().contains("neither in the snippet nor in the flow"));
    assert_eq!(group_fingerprint(&harness, &root), before);
    assert!(controller.find_connectable("snip-funnel").is_none());

    // Same for an endpoint naming the snippet's own label.
    let snippet = FlowSnippet {
        labels: vec![LabelSpec {
            id: "snip-note".into(),
            text: "inner note".into(),
            ..Default::default()
        }],
        connections: vec![ConnectionSpec {
            id: "to-own-label".into(),
            source_id: "f1".into(),
            destination_id: "snip-note".into(),
            relationships: vec![],
            ..Default::default()
        }],
        ..Default::default()
    };
    let err = controller
        .instantiate_snippet(&root, &snippet)
        .unwrap_err();
    assert!(err.to_string().contains("neither in the snippet nor in the flow"));
    assert_eq!(group_fingerprint(&harness, &root), before);
    assert!(controller.find_connection("to-own-label").is_none());
}
