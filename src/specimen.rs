//! Specimens under test and their recorded data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{telemetry::TelemetrySample, units::Geometry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specimen {
    pub name: String,
    pub gauge_length_mm: f64,
    pub area_mm2: f64,
    /// Samples of the last completed test, if any.
    pub test_data: Option<Vec<TelemetrySample>>,
    /// Whether the specimen is shown in overlays.
    pub visible: bool,
}

impl Specimen {
    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.gauge_length_mm, self.area_mm2)
    }

    pub fn has_data(&self) -> bool {
        self.test_data.is_some()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpecimenError {
    #[error("Specimen name cannot be empty.")]
    EmptyName,
    #[error("A specimen named '{0}' already exists.")]
    DuplicateName(String),
    #[error("Gauge length must be greater than 0.")]
    InvalidGaugeLength,
    #[error("Area must be greater than 0.")]
    InvalidArea,
    #[error("No specimen named '{0}'.")]
    NotFound(String),
}

/// Specimens in creation order, plus the current selection.
#[derive(Debug, Clone, Default)]
pub struct SpecimenRegistry {
    specimens: Vec<Specimen>,
    selected: Option<String>,
}

impl SpecimenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.specimens.iter().position(|s| s.name == name)
    }

    fn validated(
        &self,
        name: &str,
        gauge_length_mm: f64,
        area_mm2: f64,
        renaming: Option<&str>,
    ) -> Result<String, SpecimenError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SpecimenError::EmptyName);
        }
        if renaming != Some(name) && self.position(name).is_some() {
            return Err(SpecimenError::DuplicateName(name.to_string()));
        }
        if !(gauge_length_mm > 0.0) {
            return Err(SpecimenError::InvalidGaugeLength);
        }
        if !(area_mm2 > 0.0) {
            return Err(SpecimenError::InvalidArea);
        }
        Ok(name.to_string())
    }

    /// Create a specimen and select it.
    pub fn create(
        &mut self,
        name: &str,
        gauge_length_mm: f64,
        area_mm2: f64,
    ) -> Result<&Specimen, SpecimenError> {
        let name = self.validated(name, gauge_length_mm, area_mm2, None)?;
        self.specimens.push(Specimen {
            name: name.clone(),
            gauge_length_mm,
            area_mm2,
            test_data: None,
            visible: true,
        });
        self.selected = Some(name);
        Ok(&self.specimens[self.specimens.len() - 1])
    }

    /// Change name and geometry. Test data and visibility are kept.
    pub fn edit(
        &mut self,
        current: &str,
        name: &str,
        gauge_length_mm: f64,
        area_mm2: f64,
    ) -> Result<(), SpecimenError> {
        let index = self
            .position(current)
            .ok_or_else(|| SpecimenError::NotFound(current.to_string()))?;
        let name = self.validated(name, gauge_length_mm, area_mm2, Some(current))?;

        if self.selected.as_deref() == Some(current) {
            self.selected = Some(name.clone());
        }
        let specimen = &mut self.specimens[index];
        specimen.name = name;
        specimen.gauge_length_mm = gauge_length_mm;
        specimen.area_mm2 = area_mm2;
        Ok(())
    }

    /// Delete a specimen. Clears the selection if it pointed at it.
    pub fn delete(&mut self, name: &str) -> Result<Specimen, SpecimenError> {
        let index = self
            .position(name)
            .ok_or_else(|| SpecimenError::NotFound(name.to_string()))?;
        if self.selected.as_deref() == Some(name) {
            self.selected = None;
        }
        Ok(self.specimens.remove(index))
    }

    pub fn select(&mut self, name: &str) -> Result<(), SpecimenError> {
        if self.position(name).is_none() {
            return Err(SpecimenError::NotFound(name.to_string()));
        }
        self.selected = Some(name.to_string());
        Ok(())
    }

    pub fn selected(&self) -> Option<&Specimen> {
        let name = self.selected.as_deref()?;
        self.get(name)
    }

    pub fn get(&self, name: &str) -> Option<&Specimen> {
        self.specimens.iter().find(|s| s.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut Specimen, SpecimenError> {
        self.specimens
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| SpecimenError::NotFound(name.to_string()))
    }

    /// Replace the test data of a specimen.
    pub fn attach_data(&mut self, name: &str, samples: Vec<TelemetrySample>) -> Result<(), SpecimenError> {
        self.get_mut(name)?.test_data = Some(samples);
        Ok(())
    }

    /// Drop the test data of a specimen once the operator agreed to overwrite it.
    pub fn clear_data(&mut self, name: &str) -> Result<(), SpecimenError> {
        self.get_mut(name)?.test_data = None;
        Ok(())
    }

    pub fn set_visible(&mut self, name: &str, visible: bool) -> Result<(), SpecimenError> {
        self.get_mut(name)?.visible = visible;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Specimen> {
        self.specimens.iter()
    }

    pub fn len(&self) -> usize {
        self.specimens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specimens.is_empty()
    }
}
