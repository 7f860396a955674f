mod common;

use common::{execution_position, Harness};
use trellis_core::{ContainerRole, DeviceSpec, NodeId};

fn group(harness: &Harness, context: NodeId, node: NodeId) -> i32 {
    harness
        .app
        .provider(context)
        .and_then(|p| p.state().group(node))
        .unwrap_or_else(|| panic!("{} has no group", node))
}

#[tokio::test]
async fn test_server_order_follows_graph_order_after_boot() {
    let (mut harness, context) = Harness::with_context("main").await;
    let a = harness.app.add_track(context, Some("a")).unwrap();
    let b = harness.app.add_track(context, Some("b")).unwrap();
    let fx = harness.app.add_device(a, DeviceSpec::effect("reverb"), None).unwrap();
    harness.app.boot().await.unwrap();

    assert!(harness.app.graph_order(a) < harness.app.graph_order(b));
    let order = harness.app.query_tree(context).unwrap().execution_order();
    let pos = |node| execution_position(&order, group(&harness, context, node));
    assert!(pos(a) < pos(fx));
    assert!(pos(fx) < pos(b));
    let master = harness.app.master_track(context).unwrap();
    assert!(pos(b) < pos(master));
}

#[tokio::test]
async fn test_inserted_track_lands_before_its_next_sibling() {
    let (mut harness, context) = Harness::with_context("main").await;
    let a = harness.app.add_track(context, Some("a")).unwrap();
    harness.app.boot().await.unwrap();

    let first = harness.app.insert_track(context, Some(0), Some("first")).unwrap();
    assert_eq!(harness.app.tracks(context), vec![first, a]);

    let order = harness.app.query_tree(context).unwrap().execution_order();
    let pos = |node| execution_position(&order, group(&harness, context, node));
    assert!(pos(first) < pos(a));
}

#[tokio::test]
async fn test_moved_track_is_rebuilt_in_its_new_place() {
    let (mut harness, context) = Harness::with_context("main").await;
    let a = harness.app.add_track(context, Some("a")).unwrap();
    let b = harness.app.add_track(context, Some("b")).unwrap();
    harness.app.boot().await.unwrap();
    let old_group = group(&harness, context, b);

    harness
        .app
        .move_node(b, context, ContainerRole::Tracks, Some(0))
        .unwrap();
    assert_eq!(harness.app.tracks(context), vec![b, a]);

    let backend = harness.backend("main");
    assert!(backend.nodes_freed().contains(&old_group));
    let order = harness.app.query_tree(context).unwrap().execution_order();
    let pos = |node| execution_position(&order, group(&harness, context, node));
    assert!(pos(b) < pos(a));
}

#[tokio::test]
async fn test_sub_tracks_run_inside_their_parent() {
    let (mut harness, context) = Harness::with_context("main").await;
    let parent = harness.app.add_track(context, Some("bus")).unwrap();
    let child = harness.app.add_track(parent, Some("child")).unwrap();
    let after = harness.app.add_track(context, Some("after")).unwrap();
    harness.app.boot().await.unwrap();

    assert_eq!(harness.app.tracks(parent), vec![child]);
    let server = harness.app.query_tree(context).unwrap();
    let parent_group = group(&harness, context, parent);
    assert!(server
        .find(parent_group)
        .and_then(|node| node.find(group(&harness, context, child)))
        .is_some());

    let order = server.execution_order();
    let pos = |node| execution_position(&order, group(&harness, context, node));
    assert!(pos(parent) < pos(child));
    assert!(pos(child) < pos(after));
}
