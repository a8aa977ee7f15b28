mod common;

use common::{Bench, point, profile, waypoint};
use sc_control::{ControlError, FocusPointPatch, Owner, PlayOptions};
use sc_dynamixel::Register;
use sc_units::axis;

/// pan 26.565° -> (26.565 + 180) / (360 / 4096)
const PAN_RIGHT: u32 = 2350;
const PAN_LEFT: u32 = 1746;
const LEVEL: u32 = 2048;

fn bench_at_slider_zero() -> Bench {
    let mut b = Bench::new();
    b.sim.set_position(axis::SLIDER, 0);
    b.tick();
    b
}

#[test]
fn aims_at_a_point_level_with_the_slider() {
    let mut b = bench_at_slider_zero();
    let p = b.rig.add_point(point("door", 100.0, 0.0, 200.0)).unwrap();

    let status = b.rig.start_tracking(p.id).unwrap();
    assert!(status.active);
    assert_eq!(status.current_point_id, Some(p.id));
    assert_eq!(status.owner, Some(Owner::Operator));
    assert_eq!(status.pan_deg, Some(26.57));
    assert_eq!(status.tilt_deg, Some(0.0));

    assert_eq!(b.sim.goal(axis::PAN), Some(PAN_RIGHT));
    assert_eq!(b.sim.goal(axis::TILT), Some(LEVEL));
    b.tick();
    // unchanged goals are not re-sent
    assert_eq!(b.sim.writes_to(axis::PAN, Register::GoalPosition), vec![PAN_RIGHT]);
}

#[test]
fn tilt_follows_the_slider() {
    let mut b = bench_at_slider_zero();
    let p = b.rig.add_point(point("shelf", 0.0, 300.0, 300.0)).unwrap();
    b.rig.start_tracking(p.id).unwrap();
    let before = b.rig.tracking_status().tilt_deg.unwrap();
    assert!((before - 45.0).abs() < 0.01);

    // far end of the rail, closer to the point's height
    b.sim.set_position(axis::SLIDER, 4095);
    b.tick();
    let after = b.rig.tracking_status().tilt_deg.unwrap();
    assert!(after < before);
    assert!(b.rig.tracking_status().active);
}

#[test]
fn switching_points_replaces_the_session() {
    let mut b = bench_at_slider_zero();
    let a = b.rig.add_point(point("a", 100.0, 0.0, 200.0)).unwrap();
    let c = b.rig.add_point(point("b", -100.0, 0.0, 200.0)).unwrap();

    b.rig.start_tracking(a.id).unwrap();
    let status = b.rig.start_tracking(c.id).unwrap();
    assert_eq!(status.current_point_id, Some(c.id));

    b.sim.clear_writes();
    for _ in 0..5 {
        b.tick();
    }
    assert_eq!(b.sim.goal(axis::PAN), Some(PAN_LEFT));
    assert!(!b.sim.writes_to(axis::PAN, Register::GoalPosition).contains(&PAN_RIGHT));
    assert_eq!(b.rig.tracking_status().current_point_id, Some(c.id));
}

#[test]
fn deleting_the_tracked_point_stops_tracking() {
    let mut b = bench_at_slider_zero();
    let p = b.rig.add_point(point("gone", 100.0, 0.0, 200.0)).unwrap();
    b.rig.start_tracking(p.id).unwrap();

    b.rig.delete_point(p.id).unwrap();
    let status = b.rig.tracking_status();
    assert!(!status.active);
    assert_eq!(status.current_point_id, None);

    b.sim.clear_writes();
    b.tick();
    assert!(b.sim.writes().is_empty());
    assert!(matches!(b.rig.start_tracking(p.id), Err(ControlError::NotFound(_))));
}

#[test]
fn editing_the_tracked_point_reaims_on_the_next_tick() {
    let mut b = bench_at_slider_zero();
    let p = b.rig.add_point(point("p", 100.0, 0.0, 200.0)).unwrap();
    b.rig.start_tracking(p.id).unwrap();
    let patch = FocusPointPatch {
        x: Some(-100.0),
        ..FocusPointPatch::default()
    };
    b.rig.update_point(p.id, patch).unwrap();
    b.tick();
    assert_eq!(b.sim.goal(axis::PAN), Some(PAN_LEFT));
}

#[test]
fn playback_on_shared_axes_stops_tracking_before_its_first_command() {
    let mut b = bench_at_slider_zero();
    let p = b.rig.add_point(point("p", 100.0, 0.0, 200.0)).unwrap();
    b.rig.start_tracking(p.id).unwrap();
    b.sim.clear_writes();

    let pan_move = profile("pan", vec![waypoint(&[(axis::PAN, 1000)], 100)]);
    b.rig.play_profile(pan_move, PlayOptions::default()).unwrap();
    assert!(!b.rig.tracking_status().active);

    let writes = b.sim.writes();
    assert_eq!(writes.first().map(|w| w.1), Some(Register::ProfileAcceleration));
    assert!(
        writes
            .iter()
            .filter(|w| w.1 == Register::GoalPosition)
            .all(|w| *w == (axis::PAN, Register::GoalPosition, 1000))
    );

    b.sim.clear_writes();
    b.sim.set_position(axis::SLIDER, 3000);
    b.tick();
    assert!(b.sim.writes_to(axis::TILT, Register::GoalPosition).is_empty());
}

#[test]
fn tracking_takes_over_shared_axes_from_playback() {
    let mut b = bench_at_slider_zero();
    let p = b.rig.add_point(point("p", 100.0, 0.0, 200.0)).unwrap();
    let both = profile(
        "both",
        vec![waypoint(&[(axis::TURNTABLE, 100), (axis::PAN, 3000)], 10)],
    );
    b.rig.play_profile(both, PlayOptions::default()).unwrap();
    b.rig.start_tracking(p.id).unwrap();

    assert!(b.rig.playback_status().active);
    b.tick();
    assert_eq!(b.sim.goal(axis::PAN), Some(PAN_RIGHT));
    assert_eq!(b.sim.goal(axis::TURNTABLE), Some(100));
}

#[test]
fn manual_pan_command_stops_tracking_but_slider_moves_do_not() {
    let mut b = bench_at_slider_zero();
    let p = b.rig.add_point(point("p", 100.0, 0.0, 200.0)).unwrap();
    b.rig.start_tracking(p.id).unwrap();

    b.rig.set_goal(axis::SLIDER, 500, 200).unwrap();
    assert!(b.rig.tracking_status().active);
    b.rig.set_goal(axis::PAN, 2048, 200).unwrap();
    assert!(!b.rig.tracking_status().active);

    b.tick();
    assert_eq!(b.sim.goal(axis::PAN), Some(2048));
}

#[test]
fn focus_linked_profile_drives_tracking_and_hands_it_over() {
    let mut b = bench_at_slider_zero();
    let a = b.rig.add_point(point("a", 100.0, 0.0, 200.0)).unwrap();
    let c = b.rig.add_point(point("c", -100.0, 0.0, 200.0)).unwrap();

    let mut first = waypoint(&[(axis::SLIDER, 100), (axis::PAN, 100)], 300);
    first.focus_point_id = Some(a.id);
    let middle = waypoint(&[(axis::SLIDER, 200)], 300);
    let mut last = waypoint(&[(axis::SLIDER, 0)], 300);
    last.focus_point_id = Some(c.id);
    b.rig
        .play_profile(profile("linked", vec![first, middle, last]), PlayOptions::default())
        .unwrap();

    let status = b.rig.tracking_status();
    assert_eq!(status.current_point_id, Some(a.id));
    assert_eq!(status.owner, Some(Owner::Playback));

    assert!(b.run_until(100, |rig| !rig.playback_status().active));
    let status = b.rig.tracking_status();
    assert!(status.active);
    assert_eq!(status.current_point_id, Some(c.id));
    assert_eq!(status.owner, Some(Owner::Operator));
    assert!(!b.sim.writes_to(axis::PAN, Register::GoalPosition).contains(&100));

    let unrelated = profile("turn", vec![waypoint(&[(axis::TURNTABLE, 10)], 10)]);
    b.rig.play_profile(unrelated, PlayOptions::default()).unwrap();
    b.rig.stop_playback();
    assert!(b.rig.tracking_status().active);
}

#[test]
fn stopping_a_focus_linked_playback_ends_its_tracking() {
    let mut b = bench_at_slider_zero();
    let a = b.rig.add_point(point("a", 0.0, 500.0, 500.0)).unwrap();
    let mut wp = waypoint(&[(axis::SLIDER, 3000)], 10);
    wp.focus_point_id = Some(a.id);
    b.rig.play_profile(profile("slow", vec![wp]), PlayOptions::default()).unwrap();
    b.tick();
    assert!(b.rig.tracking_status().active);

    b.rig.stop_playback();
    assert!(!b.rig.tracking_status().active);
}

#[test]
fn focus_linked_profile_needs_its_points() {
    let b = bench_at_slider_zero();
    let mut wp = waypoint(&[(axis::SLIDER, 100)], 10);
    wp.focus_point_id = Some(42);
    assert!(matches!(
        b.rig.play_profile(profile("x", vec![wp]), PlayOptions::default()),
        Err(ControlError::NotFound(_))
    ));
}

#[test]
fn failed_play_keeps_tracking_in_charge() {
    let mut b = bench_at_slider_zero();
    let p = b.rig.add_point(point("door", 100.0, 0.0, 200.0)).unwrap();
    b.rig.start_tracking(p.id).unwrap();

    b.sim.fail_writes(axis::SLIDER, true);
    let slide = profile("slide", vec![waypoint(&[(axis::SLIDER, 2000)], 100)]);
    let err = b.rig.play_profile(slide.clone(), PlayOptions::default()).unwrap_err();
    assert!(matches!(err, ControlError::Transport(_)));
    assert!(!b.rig.playback_status().active);
    assert!(b.rig.tracking_status().active);

    b.sim.fail_writes(axis::SLIDER, false);
    for _ in 0..5 {
        b.tick();
    }
    assert!(b.rig.tracking_status().active);
    assert_eq!(b.sim.goal(axis::PAN), Some(PAN_RIGHT));

    // once the bus is healthy the same profile takes over the slider
    b.rig.play_profile(slide, PlayOptions::default()).unwrap();
    assert!(b.rig.playback_status().active);
    assert!(!b.rig.tracking_status().active);
}
