mod common;

use common::{drain, Harness};
use trellis_audio::RawArg;
use trellis_core::tree::PatchRole;
use trellis_core::{Error, Event, NodeId, ServerNode, ValidationError};

/// The `mute` value last set on or created with `node`'s output patch.
fn mute_of(server: &ServerNode, harness: &Harness, node: NodeId) -> Option<f32> {
    let allocation = harness
        .app
        .provider(harness.app.tree().context_of(node)?)?
        .state()
        .allocation(node)?;
    let slot = harness
        .app
        .tree()
        .payload(node)
        .patch_slot(PatchRole::Output)?;
    let synth = allocation.synths.get(&slot)?;
    server.find(synth.node_id)?;
    synth
        .spec
        .controls
        .iter()
        .find(|(name, _)| name == "mute")
        .map(|(_, value)| *value)
}

#[tokio::test]
async fn test_mute_sets_the_output_patch() {
    let (mut harness, context) = Harness::with_context("main").await;
    let track = harness.app.add_track(context, None).unwrap();
    harness.app.boot().await.unwrap();
    let backend = harness.backend("main");
    backend.clear();
    let events = harness.app.subscribe();

    harness.app.set_muted(track, true).unwrap();

    let sets = backend.messages_to("/n_set");
    assert_eq!(sets.len(), 1);
    assert!(sets[0].args.contains(&RawArg::Str("mute".to_string())));
    assert!(sets[0].args.contains(&RawArg::Float(1.0)));
    assert_eq!(mute_of(&backend.tree(), &harness, track), Some(1.0));
    assert_eq!(
        drain(&events),
        vec![Event::MixerChanged {
            uuid: harness.app.tree().uuid(track),
            muted: true,
            soloed: false,
            cued: false,
        }]
    );

    backend.clear();
    harness.app.set_muted(track, true).unwrap();
    assert!(backend.bundles().is_empty());
    assert!(drain(&events).is_empty());
}

#[tokio::test]
async fn test_exclusive_solo_replaces_other_solos() {
    let (mut harness, context) = Harness::with_context("main").await;
    let a = harness.app.add_track(context, None).unwrap();
    let b = harness.app.add_track(context, None).unwrap();
    let c = harness.app.add_track(context, None).unwrap();
    harness.app.boot().await.unwrap();
    let backend = harness.backend("main");

    harness.app.set_soloed(a, true, false).unwrap();
    harness.app.set_soloed(b, true, false).unwrap();
    assert!(!harness.app.is_silenced(a));
    assert!(!harness.app.is_silenced(b));
    assert!(harness.app.is_silenced(c));
    assert_eq!(mute_of(&backend.tree(), &harness, c), Some(1.0));

    harness.app.set_soloed(c, true, true).unwrap();
    assert!(!harness.app.mixer_state(a).unwrap().soloed);
    assert!(!harness.app.mixer_state(b).unwrap().soloed);
    assert!(harness.app.is_silenced(a));
    assert_eq!(mute_of(&backend.tree(), &harness, a), Some(1.0));
    assert_eq!(mute_of(&backend.tree(), &harness, c), Some(0.0));

    harness.app.set_soloed(c, false, false).unwrap();
    for track in [a, b, c] {
        assert_eq!(mute_of(&backend.tree(), &harness, track), Some(0.0));
    }
}

#[tokio::test]
async fn test_cue_adds_a_patch_into_the_cue_track() {
    let (mut harness, context) = Harness::with_context("main").await;
    let a = harness.app.add_track(context, None).unwrap();
    let b = harness.app.add_track(context, None).unwrap();
    harness.app.boot().await.unwrap();
    let backend = harness.backend("main");
    let before = backend.tree().node_count();

    harness.app.set_cued(a, true, false).unwrap();
    assert_eq!(backend.tree().node_count(), before + 1);

    harness.app.set_cued(b, true, true).unwrap();
    assert!(!harness.app.mixer_state(a).unwrap().cued);
    assert!(harness.app.mixer_state(b).unwrap().cued);
    assert_eq!(backend.tree().node_count(), before + 1);

    harness.app.set_cued(b, false, false).unwrap();
    assert_eq!(backend.tree().node_count(), before);
}

#[tokio::test]
async fn test_switches_reject_other_kinds() {
    let (mut harness, context) = Harness::with_context("main").await;
    let master = harness.app.master_track(context).unwrap();
    let track = harness.app.add_track(context, None).unwrap();
    let rack = harness.app.add_rack(track, None).unwrap();
    let chain = harness.app.add_chain(rack, None).unwrap();

    assert!(matches!(
        harness.app.set_muted(master, true),
        Err(Error::Validation(ValidationError::Unsupported { .. }))
    ));
    assert!(matches!(
        harness.app.set_cued(chain, true, false),
        Err(Error::Validation(ValidationError::Unsupported { .. }))
    ));
    harness.app.set_muted(chain, true).unwrap();
    assert!(harness.app.is_silenced(chain));
    assert!(!harness.app.is_silenced(track));
}
