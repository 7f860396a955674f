mod common;

use common::{drain, note, Harness};
use trellis_audio::RawArg;
use trellis_core::{DeviceSpec, Event, MidiMessage};

fn gate_offs(harness: &Harness, name: &str) -> usize {
    harness
        .backend(name)
        .messages_to("/n_set")
        .iter()
        .filter(|m| m.args.get(1).and_then(RawArg::as_str) == Some("gate"))
        .count()
}

fn voices_started(harness: &Harness, name: &str, def: &str) -> usize {
    harness
        .backend(name)
        .synths_created()
        .iter()
        .filter(|d| *d == def)
        .count()
}

#[tokio::test]
async fn test_fired_slot_plays_through_its_instrument() {
    let (mut harness, context) = Harness::with_context("main").await;
    let track = harness.app.add_track(context, Some("lead")).unwrap();
    harness
        .app
        .add_device(track, DeviceSpec::instrument("default"), None)
        .unwrap();
    harness.app.add_scene(None).unwrap();
    let slot = harness.app.slots(track)[0];
    harness
        .app
        .add_clip(slot, 1.0, false, &[note(0.0, 0.25, 60)])
        .unwrap();
    harness.app.boot().await.unwrap();

    harness.app.fire_slot(slot).unwrap();
    assert_eq!(voices_started(&harness, "main", "default"), 1);
    assert_eq!(gate_offs(&harness, "main"), 0);
    assert!(harness.app.playing(track).is_some());

    harness.app.advance_to(0.25).unwrap();
    assert_eq!(gate_offs(&harness, "main"), 1);

    harness.app.advance_to(2.0).unwrap();
    assert_eq!(voices_started(&harness, "main", "default"), 1);
}

#[tokio::test]
async fn test_scene_fires_every_track_in_one_update() {
    let (mut harness, context) = Harness::with_context("main").await;
    let a = harness.app.add_track(context, Some("a")).unwrap();
    let b = harness.app.add_track(context, Some("b")).unwrap();
    harness.app.add_scene(Some("intro")).unwrap();
    harness.app.add_scene(Some("drop")).unwrap();
    for track in [a, b] {
        let slot = harness.app.slots(track)[1];
        harness
            .app
            .add_clip(slot, 1.0, true, &[note(0.0, 0.5, 48)])
            .unwrap();
    }
    let events = harness.app.subscribe();

    harness.app.fire_scene(1).unwrap();

    let events = drain(&events);
    let launched = events
        .iter()
        .filter(|e| matches!(e, Event::ClipLaunched { .. }))
        .count();
    assert_eq!(launched, 2);
    assert_eq!(harness.app.playing(a).map(|p| p.slot), Some(harness.app.slots(a)[1]));
    assert_eq!(harness.app.playing(b).map(|p| p.slot), Some(harness.app.slots(b)[1]));
    assert!(harness.app.fire_scene(2).is_err());
}

#[tokio::test]
async fn test_rack_fans_midi_out_to_every_chain() {
    let (mut harness, context) = Harness::with_context("main").await;
    let track = harness.app.add_track(context, Some("layers")).unwrap();
    let rack = harness.app.add_rack(track, None).unwrap();
    for def in ["pad", "bass"] {
        let chain = harness.app.add_chain(rack, Some(def)).unwrap();
        harness
            .app
            .add_device(chain, DeviceSpec::effect("eq"), None)
            .unwrap();
        harness
            .app
            .add_device(chain, DeviceSpec::instrument(def), None)
            .unwrap();
    }
    harness.app.boot().await.unwrap();

    harness
        .app
        .perform(
            track,
            &[MidiMessage::NoteOn {
                pitch: 60,
                velocity: 90.0,
            }],
        )
        .unwrap();

    assert_eq!(voices_started(&harness, "main", "pad"), 1);
    assert_eq!(voices_started(&harness, "main", "bass"), 1);

    harness
        .app
        .perform(track, &[MidiMessage::NoteOff { pitch: 60 }])
        .unwrap();
    assert_eq!(gate_offs(&harness, "main"), 2);
}

#[tokio::test]
async fn test_stop_releases_sounding_notes() {
    let (mut harness, context) = Harness::with_context("main").await;
    let track = harness.app.add_track(context, None).unwrap();
    harness
        .app
        .add_device(track, DeviceSpec::instrument("default"), None)
        .unwrap();
    harness.app.add_scene(None).unwrap();
    let slot = harness.app.slots(track)[0];
    harness
        .app
        .add_clip(slot, 1.0, true, &[note(0.0, 1.0, 60), note(0.0, 1.0, 67)])
        .unwrap();
    harness.app.boot().await.unwrap();
    harness.app.fire_slot(slot).unwrap();
    harness.app.advance_to(0.5).unwrap();
    assert_eq!(gate_offs(&harness, "main"), 0);

    assert!(harness.app.stop().unwrap());

    assert_eq!(gate_offs(&harness, "main"), 2);
    assert!(harness.app.playing(track).is_none());
    assert!(!harness.app.transport().is_running());
}

async fn playing_instrument(notes: &[trellis_core::Note]) -> (Harness, trellis_core::NodeId, trellis_core::NodeId) {
    let (mut harness, context) = Harness::with_context("main").await;
    let track = harness.app.add_track(context, None).unwrap();
    harness
        .app
        .add_device(track, DeviceSpec::instrument("default"), None)
        .unwrap();
    harness.app.add_scene(None).unwrap();
    let slot = harness.app.slots(track)[0];
    harness.app.add_clip(slot, 1.0, true, notes).unwrap();
    harness.app.boot().await.unwrap();
    harness.app.fire_slot(slot).unwrap();
    (harness, track, slot)
}

#[tokio::test]
async fn test_replacing_a_playing_clip_releases_its_notes() {
    let (mut harness, track, slot) = playing_instrument(&[note(0.0, 1.0, 60)]).await;
    harness.app.advance_to(0.25).unwrap();
    assert_eq!(gate_offs(&harness, "main"), 0);

    harness.app.add_clip(slot, 1.0, true, &[]).unwrap();

    assert_eq!(gate_offs(&harness, "main"), 1);
    assert!(harness.app.playing(track).unwrap().sounding.is_empty());
    harness.app.stop().unwrap();
    assert_eq!(gate_offs(&harness, "main"), 1);
}

#[tokio::test]
async fn test_removing_a_sounding_note_releases_only_that_pitch() {
    let (mut harness, track, slot) = playing_instrument(&[note(0.0, 1.0, 60), note(0.0, 1.0, 67)]).await;
    let clip = harness.app.clip(slot).unwrap();
    harness.app.advance_to(0.5).unwrap();

    assert_eq!(harness.app.remove_notes(clip, &[note(0.0, 1.0, 60)]).unwrap(), 1);

    assert_eq!(gate_offs(&harness, "main"), 1);
    let sounding: Vec<u8> = harness.app.playing(track).unwrap().sounding.iter().copied().collect();
    assert_eq!(sounding, vec![67]);
    harness.app.stop().unwrap();
    assert_eq!(gate_offs(&harness, "main"), 2);
}
