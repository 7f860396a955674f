mod common;

use common::{drain, Harness};
use trellis_core::{Error, Event, ValidationError};

#[tokio::test]
async fn test_width_change_is_one_bundle() {
    let (mut harness, context) = Harness::with_context("main").await;
    let track = harness.app.add_track(context, Some("wide")).unwrap();
    harness.app.boot().await.unwrap();
    let backend = harness.backend("main");
    backend.clear();
    let events = harness.app.subscribe();

    harness.app.set_node_channel_count(track, Some(4)).unwrap();

    assert_eq!(backend.bundles().len(), 1);
    assert!(backend.synths_created().iter().any(|def| def == "mixer/patch/4x4"));
    assert_eq!(harness.app.effective_channel_count(track), Some(4));
    let uuid = harness.app.tree().uuid(track);
    assert!(drain(&events).contains(&Event::ChannelCountChanged {
        uuid,
        channel_count: 4,
    }));
}

#[tokio::test]
async fn test_application_width_reaches_every_track() {
    let (mut harness, context) = Harness::with_context("main").await;
    let a = harness.app.add_track(context, None).unwrap();
    let b = harness.app.add_track(context, None).unwrap();
    assert_eq!(harness.app.effective_channel_count(a), Some(2));

    harness.app.set_channel_count(1).unwrap();
    assert_eq!(harness.app.effective_channel_count(a), Some(1));
    assert_eq!(harness.app.effective_channel_count(b), Some(1));

    assert!(matches!(
        harness.app.set_channel_count(9),
        Err(Error::Validation(ValidationError::InvalidChannelCount(9)))
    ));
    assert_eq!(harness.app.channel_count(), 1);
}

#[tokio::test]
async fn test_rejected_bundle_rolls_everything_back() {
    let (mut harness, context) = Harness::with_context("main").await;
    let existing = harness.app.add_track(context, Some("existing")).unwrap();
    harness.app.boot().await.unwrap();
    let backend = harness.backend("main");
    let server_before = backend.tree();
    let events = harness.app.subscribe();

    backend.reject_next_bundles(1);
    let result = harness.app.add_track(context, Some("doomed"));

    assert!(matches!(result, Err(Error::Backend(_))));
    assert_eq!(harness.app.tracks(context), vec![existing]);
    assert_eq!(backend.tree(), server_before);
    assert!(drain(&events).is_empty());

    // The next edit replays cleanly on top of the restored bookkeeping.
    let track = harness.app.add_track(context, Some("retry")).unwrap();
    assert!(harness.app.provider(context).unwrap().state().group(track).is_some());
    assert!(harness.app.provider(context).unwrap().pending().is_empty());
    assert_eq!(drain(&events).len(), 1);
}

#[tokio::test]
async fn test_grouped_edits_share_a_bundle() {
    let (mut harness, context) = Harness::with_context("main").await;
    harness.app.boot().await.unwrap();
    let backend = harness.backend("main");
    backend.clear();
    let events = harness.app.subscribe();

    let (a, b) = harness
        .app
        .grouped(|app| {
            let a = app.add_track(context, Some("a"))?;
            let b = app.add_track(context, Some("b"))?;
            app.set_parameter(a, "gain", -6.0)?;
            Ok((a, b))
        })
        .unwrap();

    assert_eq!(backend.bundles().len(), 1);
    assert_eq!(harness.app.parameter_value(a, "gain"), Some(-6.0));
    let added: Vec<_> = drain(&events)
        .into_iter()
        .filter(|e| matches!(e, Event::EntityAdded { .. }))
        .collect();
    assert_eq!(added.len(), 2);
    assert!(harness.app.tree().is_attached(b));
}

#[tokio::test]
async fn test_failed_validation_changes_nothing() {
    let (mut harness, context) = Harness::with_context("main").await;
    let track = harness.app.add_track(context, None).unwrap();
    let before = harness.app.serialize();

    let result = harness.app.grouped(|app| {
        app.add_track(context, Some("partial"))?;
        app.set_parameter(track, "no-such-parameter", 1.0)
    });

    assert!(matches!(
        result,
        Err(Error::Validation(ValidationError::UnknownParameter { .. }))
    ));
    assert_eq!(harness.app.serialize(), before);
}

#[tokio::test]
async fn test_sibling_rejection_rebuilds_a_context_that_already_applied() {
    let mut harness = Harness::new();
    let a = harness.app.add_context(Some("a")).await.unwrap();
    let b = harness.app.add_context(Some("b")).await.unwrap();
    harness.app.add_track(a, None).unwrap();
    harness.app.add_track(b, None).unwrap();
    harness.app.boot().await.unwrap();
    let server_a = harness.backend("a");
    let nodes_before = server_a.tree().node_count();
    let group_before = harness.app.provider(a).and_then(|p| p.state().group(a)).unwrap();

    harness.backend("b").reject_next_bundles(1);
    assert!(matches!(harness.app.set_channel_count(4), Err(Error::Backend(_))));
    assert_eq!(harness.app.channel_count(), 2);

    // Context a is rebuilt at the old width under fresh ids.
    let provider = harness.app.provider(a).unwrap();
    let group = provider.state().group(a).unwrap();
    assert!(group > group_before);
    assert!(provider.pending().is_empty());
    let tree = server_a.tree();
    assert_eq!(tree.node_count(), nodes_before);
    assert!(tree.find(group_before).is_none());
    assert!(tree.find(group).is_some());

    let track = harness.app.add_track(a, Some("after")).unwrap();
    assert!(harness.app.provider(a).unwrap().state().group(track).is_some());
    harness.app.add_track(b, Some("after")).unwrap();
}
