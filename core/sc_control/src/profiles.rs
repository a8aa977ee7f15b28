use crate::error::ControlError;
use crate::motor::{Limits, MAX_PROFILE_VALUE};
use crate::points::PointId;
use crate::storage::{self, StorageError};
use log::{info, warn};
use sc_units::MotorId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Matches the rig's stock profile acceleration.
pub const DEFAULT_ACCELERATION: u32 = 1800;

fn default_acceleration() -> u32 {
    DEFAULT_ACCELERATION
}

/// One waypoint: target steps per motor, reached at `velocity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilePoint {
    pub positions: BTreeMap<MotorId, i32>,
    pub velocity: u32,
    /// Aim at this focus point while the waypoint plays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_point_id: Option<PointId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub points: Vec<ProfilePoint>,
    #[serde(default = "default_acceleration")]
    pub acceleration: u32,
}

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileSummary {
    pub name: String,
    pub points: usize,
    pub acceleration: u32,
    pub focus_linked: bool,
}

impl Profile {
    /// Every motor any waypoint moves.
    pub fn motor_ids(&self) -> BTreeSet<MotorId> {
        self.points
            .iter()
            .flat_map(|p| p.positions.keys().copied())
            .collect()
    }

    pub fn is_focus_linked(&self) -> bool {
        self.points.iter().any(|p| p.focus_point_id.is_some())
    }

    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            name: self.name.clone(),
            points: self.points.len(),
            acceleration: self.acceleration,
            focus_linked: self.is_focus_linked(),
        }
    }

    /// Names double as file names, so they are kept to a safe alphabet.
    pub fn validate_name(name: &str) -> Result<(), ControlError> {
        let ok = !name.is_empty()
            && name.len() <= 64
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' '))
            && !name.starts_with(' ')
            && !name.ends_with(' ');
        if !ok {
            return Err(ControlError::invalid(format!(
                "profile name '{name}' must be 1-64 letters, digits, '-', '_' or inner spaces"
            )));
        }
        Ok(())
    }

    /// Checks ids, targets and velocities against the rig's motors.
    ///
    /// An empty profile is valid to store; playing it is what fails.
    pub fn validate(&self, limits: impl Fn(MotorId) -> Option<Limits>) -> Result<(), ControlError> {
        Self::validate_name(&self.name)?;
        if self.acceleration > MAX_PROFILE_VALUE {
            return Err(ControlError::invalid(format!(
                "acceleration {} above {MAX_PROFILE_VALUE}",
                self.acceleration
            )));
        }
        for (i, point) in self.points.iter().enumerate() {
            if point.velocity == 0 || point.velocity > MAX_PROFILE_VALUE {
                return Err(ControlError::invalid(format!(
                    "point {i}: velocity must be within 1..={MAX_PROFILE_VALUE}"
                )));
            }
            for (&id, &target) in &point.positions {
                let Some(l) = limits(id) else {
                    return Err(ControlError::invalid(format!("point {i}: unknown motor id {id}")));
                };
                if !l.contains(target) {
                    return Err(ControlError::invalid(format!(
                        "point {i}: target {target} for motor {id} outside {}..={}",
                        l.min, l.max
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Named profiles, optionally persisted as one `<name>.json` per profile.
#[derive(Debug, Default)]
pub struct ProfileStore {
    profiles: BTreeMap<String, Profile>,
    dir: Option<PathBuf>,
}

impl ProfileStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads every `*.json` in `dir`; unreadable files are skipped with a
    /// warning so one bad file doesn't hide the rest.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        let mut profiles = BTreeMap::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries.collect::<Result<Vec<_>, _>>(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
        .map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;

        for entry in entries {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match storage::read_json::<Profile>(&path) {
                Ok(Some(p)) => {
                    profiles.insert(p.name.clone(), p);
                }
                Ok(None) => {}
                Err(e) => warn!("skipping profile file: {e}"),
            }
        }
        info!("loaded {} profiles from {}", profiles.len(), dir.display());
        Ok(Self {
            profiles,
            dir: Some(dir),
        })
    }

    pub fn list(&self) -> Vec<ProfileSummary> {
        self.profiles.values().map(Profile::summary).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    pub fn load(&self, name: &str) -> Result<Profile, ControlError> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(format!("profile '{name}'")))
    }

    /// Inserts or overwrites. Validation is the caller's job, since it
    /// needs the motor table.
    pub fn save(&mut self, profile: Profile) -> Result<(), ControlError> {
        Profile::validate_name(&profile.name)?;
        if let Some(dir) = &self.dir {
            storage::write_json(&dir.join(format!("{}.json", profile.name)), &profile)?;
        }
        info!("profile '{}' saved ({} points)", profile.name, profile.points.len());
        self.profiles.insert(profile.name.clone(), profile);
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<(), ControlError> {
        if !self.contains(name) {
            return Err(ControlError::NotFound(format!("profile '{name}'")));
        }
        if let Some(dir) = &self.dir {
            storage::remove(&dir.join(format!("{name}.json")))?;
        }
        self.profiles.remove(name);
        info!("profile '{name}' deleted");
        Ok(())
    }
}
