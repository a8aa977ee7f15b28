mod common;

use common::{Bench, profile, waypoint};
use sc_control::{ControlError, PlayOptions, TorqueTarget};
use sc_dynamixel::Register;
use sc_units::axis;

#[test]
fn three_points_advance_in_order_then_idle() {
    let mut b = Bench::new();
    b.tick();
    let p = profile(
        "sweep",
        vec![
            waypoint(&[(axis::TURNTABLE, 1000)], 200),
            waypoint(&[(axis::TURNTABLE, 1500)], 200),
            waypoint(&[(axis::TURNTABLE, 2500)], 200),
        ],
    );
    b.rig.save_profile(p).unwrap();

    let status = b.rig.play("sweep", PlayOptions::default()).unwrap();
    assert!(status.active);
    assert_eq!((status.index, status.total), (Some(0), 3));
    assert_eq!(status.profile.as_deref(), Some("sweep"));

    let mut seen = vec![0];
    let finished = b.run_until(200, |rig| {
        let s = rig.playback_status();
        if let Some(i) = s.index
            && seen.last() != Some(&i)
        {
            seen.push(i);
        }
        !s.active
    });
    assert!(finished);
    assert_eq!(seen, vec![0, 1, 2]);
    assert_eq!(
        b.sim.writes_to(axis::TURNTABLE, Register::GoalPosition),
        vec![1000, 1500, 2500]
    );
    // arrival is within tolerance; one more tick settles the motor
    b.tick();
    assert_eq!(b.sim.position(axis::TURNTABLE), Some(2500));
}

#[test]
fn stop_takes_effect_before_the_next_tick() {
    let mut b = Bench::new();
    b.tick();
    let p = profile(
        "long",
        vec![
            waypoint(&[(axis::ZOOM, 2100)], 50),
            waypoint(&[(axis::ZOOM, 4000)], 10),
            waypoint(&[(axis::ZOOM, 0)], 10),
        ],
    );
    b.rig.play_profile(p, PlayOptions::default()).unwrap();
    assert!(b.run_until(50, |rig| rig.playback_status().index == Some(1)));

    let status = b.rig.stop_playback();
    assert!(!status.active);
    assert!(!b.rig.playback_status().active);

    let goals = b.sim.writes_to(axis::ZOOM, Register::GoalPosition);
    for _ in 0..5 {
        b.tick();
    }
    // the hold written by stop is the last goal
    let after = b.sim.writes_to(axis::ZOOM, Register::GoalPosition);
    assert_eq!(after.len(), goals.len());
    assert_eq!(goals[..2], [2100, 4000]);
}

#[test]
fn repeat_loops_until_stopped() {
    let mut b = Bench::new();
    b.tick();
    let p = profile(
        "loop",
        vec![
            waypoint(&[(axis::TURNTABLE, 1800)], 500),
            waypoint(&[(axis::TURNTABLE, 2300)], 500),
        ],
    );
    b.rig.play_profile(p, PlayOptions { repeat: true }).unwrap();
    assert!(b.run_until(200, |rig| rig.playback_status().completed_iterations >= 2));
    assert!(b.rig.playback_status().active);
    b.rig.stop_playback();
    assert!(!b.rig.playback_status().active);
}

#[test]
fn failed_issue_is_retried_on_the_next_tick() {
    let mut b = Bench::new();
    b.tick();
    let p = profile(
        "retry",
        vec![
            waypoint(&[(axis::ZOOM, 2048)], 100),
            waypoint(&[(axis::ZOOM, 2200)], 100),
        ],
    );
    b.rig.play_profile(p, PlayOptions::default()).unwrap();
    b.sim.fail_writes(axis::ZOOM, true);
    b.tick();
    b.tick();
    assert_eq!(b.rig.playback_status().index, Some(1));
    assert!(b.rig.playback_status().active);

    b.sim.fail_writes(axis::ZOOM, false);
    assert!(b.run_until(100, |rig| !rig.playback_status().active));
    assert_eq!(b.sim.writes_to(axis::ZOOM, Register::GoalPosition), vec![2048, 2200]);
}

#[test]
fn manual_command_or_torque_release_stops_playback_on_that_motor() {
    let mut b = Bench::new();
    b.tick();
    let p = profile("a", vec![waypoint(&[(axis::TURNTABLE, 100)], 10)]);
    b.rig.play_profile(p.clone(), PlayOptions::default()).unwrap();

    b.rig.set_goal(axis::ZOOM, 1000, 100).unwrap();
    assert!(b.rig.playback_status().active);
    b.rig.set_goal(axis::TURNTABLE, 3000, 100).unwrap();
    assert!(!b.rig.playback_status().active);

    b.rig.play_profile(p, PlayOptions::default()).unwrap();
    b.rig.set_torque(TorqueTarget::One(axis::TURNTABLE), false).unwrap();
    assert!(!b.rig.playback_status().active);
}

#[test]
fn invalid_manual_command_leaves_playback_running() {
    let mut b = Bench::new();
    b.tick();
    let p = profile("a", vec![waypoint(&[(axis::TURNTABLE, 100)], 10)]);
    b.rig.play_profile(p, PlayOptions::default()).unwrap();
    assert!(matches!(
        b.rig.set_goal(axis::TURNTABLE, 5000, 100),
        Err(ControlError::InvalidInput(_))
    ));
    assert!(b.rig.playback_status().active);
}

#[test]
fn profiles_outside_the_limits_are_refused() {
    let b = Bench::new();
    let p = profile("bad", vec![waypoint(&[(9, 100)], 10)]);
    assert!(matches!(b.rig.save_profile(p.clone()), Err(ControlError::InvalidInput(_))));
    assert!(matches!(
        b.rig.play_profile(p, PlayOptions::default()),
        Err(ControlError::InvalidInput(_))
    ));
    assert!(b.rig.list_profiles().is_empty());
}
