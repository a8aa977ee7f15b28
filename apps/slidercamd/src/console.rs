//! JSON-lines front end: one request object per stdin line, one response
//! object per stdout line.
//!
//! ```text
//! {"op":"set_goal","id":3,"position":2300,"velocity":200}
//! {"success":true,"message":"ok"}
//! {"op":"start_tracking","id":1}
//! {"success":true,"message":"ok","data":{"active":true,"current_point_id":1,...}}
//! ```

use anyhow::Context;
use log::{debug, info};
use sc_control::{
    CommandOutcome, ControlError, FocusPointPatch, NewFocusPoint, PidGains, PlayOptions, PointId, Profile, SliderRig,
    TorqueTarget,
};
use sc_dynamixel::MotorId;
use sc_units::axis;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Status,
    CachedStatus,
    SetGoal {
        id: MotorId,
        position: i32,
        velocity: u32,
    },
    SetAcceleration {
        id: MotorId,
        acceleration: u32,
    },
    SetTorque {
        target: TorqueTarget,
        enabled: bool,
    },
    /// Zeroes a motor at its present position; the slider when `id` is
    /// left out.
    Home {
        #[serde(default)]
        id: Option<MotorId>,
    },
    PidGains {
        id: MotorId,
    },
    SetPidGains {
        id: MotorId,
        gains: PidGains,
    },
    ListProfiles,
    SaveProfile {
        profile: Profile,
    },
    LoadProfile {
        name: String,
    },
    DeleteProfile {
        name: String,
    },
    Play {
        name: String,
        #[serde(default)]
        options: PlayOptions,
    },
    Stop,
    PlaybackStatus,
    ListPoints,
    AddPoint {
        point: NewFocusPoint,
    },
    UpdatePoint {
        id: PointId,
        patch: FocusPointPatch,
    },
    DeletePoint {
        id: PointId,
    },
    StartTracking {
        id: PointId,
    },
    StopTracking,
    TrackingStatus,
}

#[derive(Debug, Serialize)]
struct Response {
    #[serde(flatten)]
    outcome: CommandOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl Response {
    fn done() -> Self {
        Self {
            outcome: CommandOutcome::ok("ok"),
            data: None,
        }
    }

    fn with<T: Serialize>(value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(data) => Self {
                data: Some(data),
                ..Self::done()
            },
            Err(e) => Self::rejected(&e.to_string()),
        }
    }

    fn rejected(message: &str) -> Self {
        Self {
            outcome: CommandOutcome {
                success: false,
                message: message.to_string(),
                kind: None,
            },
            data: None,
        }
    }
}

impl From<ControlError> for Response {
    fn from(e: ControlError) -> Self {
        Self {
            outcome: CommandOutcome::from(&e),
            data: None,
        }
    }
}

fn reply<T: Serialize>(result: Result<T, ControlError>) -> Response {
    result.map_or_else(Response::from, Response::with)
}

fn handle(rig: &SliderRig, request: Request) -> Response {
    match request {
        Request::Status => reply(rig.bulk_status()),
        Request::CachedStatus => Response::with(rig.cached_status()),
        Request::SetGoal { id, position, velocity } => reply(rig.set_goal(id, position, velocity)),
        Request::SetAcceleration { id, acceleration } => reply(rig.set_profile_acceleration(id, acceleration)),
        Request::SetTorque { target, enabled } => reply(rig.set_torque(target, enabled)),
        Request::Home { id } => {
            let id = id.unwrap_or(axis::SLIDER);
            reply(rig.home(id).map(|offset| json!({ "id": id, "homing_offset": offset })))
        }
        Request::PidGains { id } => reply(rig.pid_gains(id)),
        Request::SetPidGains { id, gains } => reply(rig.set_pid_gains(id, gains)),
        Request::ListProfiles => Response::with(rig.list_profiles()),
        Request::SaveProfile { profile } => reply(rig.save_profile(profile)),
        Request::LoadProfile { name } => reply(rig.load_profile(&name)),
        Request::DeleteProfile { name } => reply(rig.delete_profile(&name)),
        Request::Play { name, options } => reply(rig.play(&name, options)),
        Request::Stop => Response::with(rig.stop_playback()),
        Request::PlaybackStatus => Response::with(rig.playback_status()),
        Request::ListPoints => Response::with(rig.list_points()),
        Request::AddPoint { point } => reply(rig.add_point(point)),
        Request::UpdatePoint { id, patch } => reply(rig.update_point(id, patch)),
        Request::DeletePoint { id } => reply(rig.delete_point(id)),
        Request::StartTracking { id } => reply(rig.start_tracking(id)),
        Request::StopTracking => Response::with(rig.stop_tracking()),
        Request::TrackingStatus => Response::with(rig.tracking_status()),
    }
}

fn respond(line: &str, rig: &SliderRig) -> Response {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => {
            debug!("request: {request:?}");
            handle(rig, request)
        }
        Err(e) => Response::rejected(&format!("bad request: {e}")),
    }
}

/// Serves requests until stdin closes or `running` is cleared.
pub fn serve(rig: &SliderRig, running: &AtomicBool) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel::<String>();
    // stdin reads block, so they live on their own thread
    thread::Builder::new()
        .name("sc-console".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("starting the console reader")?;

    info!("ready for requests on stdin");
    let mut out = io::stdout().lock();
    while running.load(Ordering::Relaxed) {
        let line = match rx.recv_timeout(SHUTDOWN_POLL) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = respond(&line, rig);
        serde_json::to_writer(&mut out, &response).context("writing response")?;
        writeln!(out).context("writing response")?;
        out.flush().context("writing response")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_control::SystemConfig;
    use cu29_clock::RobotClock;
    use sc_dynamixel::SimBus;

    fn rig() -> SliderRig {
        let (clock, _mock) = RobotClock::mock();
        let bus = SimBus::new([1, 2, 3, 4, 5, 6], clock.clone());
        SliderRig::new(SystemConfig::default(), Box::new(bus), clock).unwrap()
    }

    fn call(rig: &SliderRig, line: &str) -> Value {
        serde_json::to_value(respond(line, rig)).unwrap()
    }

    #[test]
    fn commands_report_success_and_data() {
        let rig = rig();
        let v = call(&rig, r#"{"op":"set_goal","id":3,"position":2300,"velocity":200}"#);
        assert_eq!(v["success"], true);
        assert!(v.get("data").is_none() || v["data"].is_null());

        let v = call(&rig, r#"{"op":"add_point","point":{"name":"door","x":100,"y":0,"z":200}}"#);
        assert_eq!(v["data"]["id"], 1);
        let v = call(&rig, r#"{"op":"status"}"#);
        assert_eq!(v["data"]["motors"].as_array().unwrap().len(), 6);
        let v = call(&rig, r#"{"op":"set_torque","target":"all","enabled":false}"#);
        assert_eq!(v["data"], serde_json::json!([1, 2, 3, 4, 5, 6]));
        let v = call(&rig, r#"{"op":"set_torque","target":{"one":2},"enabled":true}"#);
        assert_eq!(v["success"], true);
    }

    #[test]
    fn failures_carry_a_message_and_kind() {
        let rig = rig();
        let v = call(&rig, r#"{"op":"set_goal","id":3,"position":9000,"velocity":200}"#);
        assert_eq!(v["success"], false);
        assert_eq!(v["kind"], "invalid_input");

        let v = call(&rig, r#"{"op":"play","name":"missing"}"#);
        assert_eq!(v["kind"], "not_found");

        let v = call(&rig, "{not json");
        assert_eq!(v["success"], false);
        assert!(v["message"].as_str().unwrap().starts_with("bad request"));
    }

    #[test]
    fn save_then_play_a_profile() {
        let rig = rig();
        let v = call(
            &rig,
            r#"{"op":"save_profile","profile":{"name":"p","points":[{"positions":{"1":1000},"velocity":100}]}}"#,
        );
        assert_eq!(v["success"], true);
        let v = call(&rig, r#"{"op":"play","name":"p","options":{"repeat":true}}"#);
        assert_eq!(v["data"]["active"], true);
        assert_eq!(v["data"]["repeat"], true);
        let v = call(&rig, r#"{"op":"stop"}"#);
        assert_eq!(v["data"]["active"], false);
    }

    #[test]
    fn home_defaults_to_the_slider() {
        let (clock, _mock) = RobotClock::mock();
        let bus = SimBus::new([1, 2, 3, 4, 5, 6], clock.clone());
        let sim = bus.handle();
        let rig = SliderRig::new(SystemConfig::default(), Box::new(bus), clock).unwrap();
        sim.set_position(2, 1800);

        let v = call(&rig, r#"{"op":"home"}"#);
        assert_eq!(v["success"], true);
        assert_eq!(v["data"], json!({ "id": 2, "homing_offset": -1800 }));
        assert_eq!(sim.position(2), Some(0));

        let v = call(&rig, r#"{"op":"home","id":9}"#);
        assert_eq!(v["kind"], "invalid_input");
    }
}
