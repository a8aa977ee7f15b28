#![allow(dead_code)]

use cu29_clock::{RobotClock, RobotClockMock};
use sc_control::{NewFocusPoint, Profile, ProfilePoint, SliderRig, SystemConfig};
use sc_dynamixel::{SimBus, SimHandle};
use sc_units::MotorId;
use std::time::Duration;

pub const TICK: Duration = Duration::from_millis(50);

/// A rig on the simulated bus, both driven by one mock clock.
pub struct Bench {
    pub rig: SliderRig,
    pub sim: SimHandle,
    pub clock: RobotClockMock,
}

impl Bench {
    pub fn new() -> Self {
        Self::with_config(SystemConfig::default())
    }

    pub fn with_config(config: SystemConfig) -> Self {
        let (clock, mock) = RobotClock::mock();
        let bus = SimBus::new(sc_units::axis::ALL, clock.clone());
        let sim = bus.handle();
        let rig = SliderRig::new(config, Box::new(bus), clock).unwrap();
        Self { rig, sim, clock: mock }
    }

    /// Moves the clock one tick forward.
    pub fn step(&self) {
        self.clock.set_value(self.clock.value() + TICK.as_nanos() as u64);
    }

    /// Moves the clock one tick forward, then ticks the rig.
    pub fn tick(&mut self) {
        self.step();
        self.rig.tick().unwrap();
    }

    /// Ticks until `done` holds, at most `max` times.
    pub fn run_until(&mut self, max: usize, mut done: impl FnMut(&SliderRig) -> bool) -> bool {
        for _ in 0..max {
            self.tick();
            if done(&self.rig) {
                return true;
            }
        }
        false
    }
}

pub fn point(name: &str, x: f64, y: f64, z: f64) -> NewFocusPoint {
    NewFocusPoint {
        name: name.into(),
        description: String::new(),
        x,
        y,
        z,
        color: None,
    }
}

pub fn waypoint(targets: &[(MotorId, i32)], velocity: u32) -> ProfilePoint {
    ProfilePoint {
        positions: targets.iter().copied().collect(),
        velocity,
        focus_point_id: None,
    }
}

pub fn profile(name: &str, points: Vec<ProfilePoint>) -> Profile {
    Profile {
        name: name.into(),
        points,
        acceleration: 0,
    }
}
