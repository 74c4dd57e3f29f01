//! The serialization contract: transferred results, round-trip stability
//! and reconstruction of the graph shape.

use pretty_assertions::assert_eq;
use serde_json::json;

use trellis::errors::RestoreError;
use trellis::node::{prop, Blueprint};
use trellis::rule::annotations::required;
use trellis::rule::RuleId;
use trellis::snapshot::NodeSnapshot;

fn form() -> Blueprint {
    Blueprint::entity("Form")
        .property(prop("title").display("Title"))
        .property(prop("note").display("Note"))
        .rule(required("title"))
        .rule(required("note"))
}

fn order() -> Blueprint {
    let line = Blueprint::entity("Line")
        .property(prop("sku"))
        .property(prop("qty").default_value(1));
    Blueprint::entity("Order")
        .property(prop("number"))
        .child("shipping", Blueprint::entity("Address").property(prop("city")))
        .list("lines", line)
}

#[tokio::test]
async fn transferred_messages_attach_to_their_ordinals() {
    let node = form().create();
    node.wait_for_tasks().await.unwrap();
    assert_eq!(node.messages().len(), 2);

    let snapshot = node.snapshot();
    let restored = form().restore(&snapshot).unwrap();

    // restoring applies messages as data: nothing executed, nothing busy
    assert!(!restored.is_busy());
    assert!(!restored.is_valid());
    assert_eq!(restored.messages(), node.messages());

    // fixing the title clears exactly the title rule's message; the note
    // rule's ordinal keeps its message untouched
    restored.set("title", "fixed").unwrap();
    restored.wait_for_tasks().await.unwrap();

    let messages = restored.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].path, "note");
    assert_eq!(messages[0].rule, RuleId(1));
}

#[tokio::test]
async fn round_trips_do_not_drift() {
    let node = form().create();
    node.wait_for_tasks().await.unwrap();
    node.set("title", "stable").unwrap();
    node.wait_for_tasks().await.unwrap();

    let first = node.snapshot();
    let second = form().restore(&first).unwrap().snapshot();
    let third = form().restore(&second).unwrap().snapshot();

    assert_eq!(first, second);
    assert_eq!(second, third);
}

#[tokio::test]
async fn snapshots_survive_a_wire_round_trip() {
    let node = form().create();
    node.wait_for_tasks().await.unwrap();

    let snapshot = node.snapshot();
    let wire = serde_json::to_string(&snapshot).unwrap();
    let decoded: NodeSnapshot = serde_json::from_str(&wire).unwrap();

    assert_eq!(snapshot, decoded);
    let restored = form().restore(&decoded).unwrap();
    assert_eq!(restored.messages(), node.messages());
}

#[tokio::test]
async fn graph_shape_and_flags_survive_restoration() {
    let root = order().fetch();
    root.load("number", "ORD-7").unwrap();
    root.child("shipping").unwrap().set("city", "Turin").unwrap();

    let line_bp = Blueprint::entity("Line")
        .property(prop("sku"))
        .property(prop("qty").default_value(1));
    let kept = line_bp.fetch();
    kept.load("sku", "A-1").unwrap();
    let dropped = line_bp.fetch();
    dropped.load("sku", "B-2").unwrap();

    let lines = root.list("lines").unwrap();
    lines.add(kept.clone()).unwrap();
    lines.add(dropped.clone()).unwrap();
    lines.remove(&dropped).unwrap();
    root.delete();

    let snapshot = root.snapshot();
    let restored = order().restore(&snapshot).unwrap();

    assert!(restored.is_deleted());
    assert_eq!(restored.get("number").unwrap(), json!("ORD-7"));

    // parent back-references point at the restored instances themselves
    let shipping = restored.child("shipping").unwrap();
    assert_eq!(shipping.parent().unwrap(), restored);
    assert_eq!(shipping.get("city").unwrap(), json!("Turin"));
    assert!(shipping.property("city").unwrap().modified);

    let lines = restored.list("lines").unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines.deleted().len(), 1);
    let item = lines.get(0).unwrap();
    assert_eq!(item.parent().unwrap(), restored);
    assert!(item.is_child());
    assert!(lines.deleted()[0].is_deleted());

    // a second capture of the restored graph is identical
    assert_eq!(restored.snapshot(), snapshot);

    // modification still propagates through the rebuilt links
    restored.child("shipping").unwrap().set("city", "Milan").unwrap();
    assert!(restored.is_modified());
}

#[tokio::test]
async fn restoring_with_the_wrong_blueprint_is_rejected() {
    let node = form().create();
    node.wait_for_tasks().await.unwrap();
    let snapshot = node.snapshot();

    let err = order().restore(&snapshot).unwrap_err();
    assert!(matches!(err, RestoreError::KindMismatch { .. }));
}

#[tokio::test]
async fn unknown_rule_ordinals_are_rejected() {
    let node = form().create();
    node.wait_for_tasks().await.unwrap();
    let mut snapshot = node.snapshot();
    snapshot.properties[0].messages[0].rule = RuleId(9);

    let err = form().restore(&snapshot).unwrap_err();
    assert!(matches!(err, RestoreError::UnknownRule { .. }));
}
