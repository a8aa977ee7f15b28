//! Stored 3D aim targets.
//!
//! Coordinates are in millimetres in the rig frame: `y` runs along the
//! slider rail, `x` is the lateral offset and `z` the depth. Ids are handed
//! out from a persisted counter and never reused, so a deleted point's id
//! can't silently start referring to a different target.

use crate::error::ControlError;
use crate::storage::{self, StorageError};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub type PointId = u32;

const DEFAULT_COLOR: &str = "#ff4136";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusPoint {
    pub id: PointId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input of [`PointStore::add`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewFocusPoint {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub color: Option<String>,
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FocusPointPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub color: Option<String>,
}

fn validate_name(name: &str) -> Result<(), ControlError> {
    if name.trim().is_empty() {
        return Err(ControlError::invalid("focus point name must not be empty"));
    }
    Ok(())
}

fn validate_color(color: &str) -> Result<(), ControlError> {
    let ok = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if !ok {
        return Err(ControlError::invalid(format!("color must look like #rrggbb, got '{color}'")));
    }
    Ok(())
}

fn validate_coords(coords: [f64; 3]) -> Result<(), ControlError> {
    if coords.iter().any(|c| !c.is_finite()) {
        return Err(ControlError::invalid("coordinates must be finite"));
    }
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PointFile {
    next_id: PointId,
    points: Vec<FocusPoint>,
}

/// Focus points keyed by id, optionally backed by a JSON file.
#[derive(Debug)]
pub struct PointStore {
    points: BTreeMap<PointId, FocusPoint>,
    next_id: PointId,
    path: Option<PathBuf>,
}

impl Default for PointStore {
    fn default() -> Self {
        Self {
            points: BTreeMap::new(),
            next_id: 1,
            path: None,
        }
    }
}

impl PointStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads `path` if it exists; later mutations are written back to it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let file: PointFile = storage::read_json(&path)?.unwrap_or_default();
        let points: BTreeMap<_, _> = file.points.into_iter().map(|p| (p.id, p)).collect();
        let floor = points.keys().next_back().map_or(1, |id| id.saturating_add(1));
        info!("loaded {} focus points from {}", points.len(), path.display());
        Ok(Self {
            points,
            next_id: file.next_id.max(floor),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn list(&self) -> Vec<FocusPoint> {
        self.points.values().cloned().collect()
    }

    pub fn get(&self, id: PointId) -> Option<&FocusPoint> {
        self.points.get(&id)
    }

    pub fn require(&self, id: PointId) -> Result<&FocusPoint, ControlError> {
        self.get(id)
            .ok_or_else(|| ControlError::NotFound(format!("focus point {id}")))
    }

    pub fn add(&mut self, new: NewFocusPoint) -> Result<FocusPoint, ControlError> {
        validate_name(&new.name)?;
        validate_coords([new.x, new.y, new.z])?;
        let color = new.color.unwrap_or_else(|| DEFAULT_COLOR.to_string());
        validate_color(&color)?;
        let next_id = self
            .next_id
            .checked_add(1)
            .filter(|_| !self.points.contains_key(&self.next_id))
            .ok_or_else(|| ControlError::invalid("focus point ids are exhausted"))?;

        let now = Utc::now();
        let point = FocusPoint {
            id: self.next_id,
            name: new.name.trim().to_string(),
            description: new.description,
            x: new.x,
            y: new.y,
            z: new.z,
            color: color.to_ascii_lowercase(),
            created_at: now,
            updated_at: now,
        };
        self.commit(Some(point.clone()), None, next_id)?;
        info!("focus point {} '{}' added", point.id, point.name);
        Ok(point)
    }

    pub fn update(&mut self, id: PointId, patch: FocusPointPatch) -> Result<FocusPoint, ControlError> {
        let mut point = self.require(id)?.clone();
        if let Some(name) = patch.name {
            validate_name(&name)?;
            point.name = name.trim().to_string();
        }
        if let Some(description) = patch.description {
            point.description = description;
        }
        point.x = patch.x.unwrap_or(point.x);
        point.y = patch.y.unwrap_or(point.y);
        point.z = patch.z.unwrap_or(point.z);
        validate_coords([point.x, point.y, point.z])?;
        if let Some(color) = patch.color {
            validate_color(&color)?;
            point.color = color.to_ascii_lowercase();
        }
        point.updated_at = Utc::now();

        self.commit(Some(point.clone()), None, self.next_id)?;
        Ok(point)
    }

    pub fn delete(&mut self, id: PointId) -> Result<FocusPoint, ControlError> {
        let point = self.require(id)?.clone();
        self.commit(None, Some(id), self.next_id)?;
        info!("focus point {id} deleted");
        Ok(point)
    }

    /// Persists the would-be state first and only then applies it in memory.
    fn commit(
        &mut self,
        upsert: Option<FocusPoint>,
        remove: Option<PointId>,
        next_id: PointId,
    ) -> Result<(), ControlError> {
        if let Some(path) = &self.path {
            let mut points: Vec<FocusPoint> = self
                .points
                .values()
                .filter(|p| Some(p.id) != remove && Some(p.id) != upsert.as_ref().map(|u| u.id))
                .cloned()
                .collect();
            points.extend(upsert.iter().cloned());
            points.sort_by_key(|p| p.id);
            storage::write_json(path, &PointFile { next_id, points })?;
        }
        if let Some(id) = remove {
            self.points.remove(&id);
        }
        if let Some(point) = upsert {
            self.points.insert(point.id, point);
        }
        self.next_id = next_id;
        Ok(())
    }
}
