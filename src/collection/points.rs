use serde::{Deserialize, Serialize};

use crate::error::{AcqError, AppResult};

/// A named sample position. Missing coordinates keep the stage where it was
/// before the collection started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionPoint {
    /// Unique name, appended to file names
    pub name: String,
    /// Horizontal position
    pub x: Option<f64>,
    /// Vertical position
    pub y: Option<f64>,
    /// Focus position
    pub z: Option<f64>,
    /// Disabled points are skipped
    pub enabled: bool,
}

/// Ordered list of collection points; insertion order is scan order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionPoints {
    points: Vec<CollectionPoint>,
}

impl CollectionPoints {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an enabled point. Names must be unique.
    pub fn add_point(
        &mut self,
        name: impl Into<String>,
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
    ) -> AppResult<()> {
        let name = name.into();
        if self.get(&name).is_some() {
            return Err(AcqError::DuplicatePoint(name));
        }
        self.points.push(CollectionPoint {
            name,
            x,
            y,
            z,
            enabled: true,
        });
        Ok(())
    }

    /// First free `posN` name.
    pub fn next_auto_name(&self) -> String {
        (self.points.len() + 1..)
            .map(|n| format!("pos{}", n))
            .find(|name| self.get(name).is_none())
            .unwrap_or_else(|| "pos".to_string())
    }

    /// Remove a point by name.
    pub fn delete_point(&mut self, name: &str) -> AppResult<CollectionPoint> {
        let index = self
            .points
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| AcqError::UnknownPoint(name.to_string()))?;
        Ok(self.points.remove(index))
    }

    /// Remove every point.
    pub fn clear_points(&mut self) {
        self.points.clear();
    }

    /// Enable or disable one point.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> AppResult<()> {
        let point = self
            .points
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| AcqError::UnknownPoint(name.to_string()))?;
        point.enabled = enabled;
        Ok(())
    }

    /// Enable or disable every point.
    pub fn enable_all(&mut self, enabled: bool) {
        for point in &mut self.points {
            point.enabled = enabled;
        }
    }

    /// Look up a point.
    pub fn get(&self, name: &str) -> Option<&CollectionPoint> {
        self.points.iter().find(|p| p.name == name)
    }

    /// All points in scan order.
    pub fn iter(&self) -> impl Iterator<Item = &CollectionPoint> {
        self.points.iter()
    }

    /// Enabled points in scan order.
    pub fn enabled(&self) -> impl Iterator<Item = &CollectionPoint> {
        self.points.iter().filter(|p| p.enabled)
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
