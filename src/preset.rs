//! Named quad presets stored as JSON files
//!
//! A preset file holds a label and exactly four corners in winding order:
//!
//! ```json
//! { "label": "wall-A", "corners": [[10.0, 10.0], [200.0, 15.0], [190.0, 210.0], [5.0, 195.0]] }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::config::Point;
use crate::quad::Quad;

#[derive(Debug, Error)]
pub enum PresetError {
    #[error("invalid preset name {0:?}")]
    InvalidName(String),
    #[error("preset I/O on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed preset {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("preset {path:?} has a non-finite corner")]
    InvalidCorner { path: PathBuf },
}

/// A labeled snapshot of the four quad corners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub label: String,
    pub corners: [[f64; 2]; 4],
}

impl Preset {
    pub fn from_quad(label: impl Into<String>, quad: &Quad) -> Self {
        Self {
            label: label.into(),
            corners: quad.corners().map(|p| [p.x, p.y]),
        }
    }

    pub fn points(&self) -> [Point; 4] {
        self.corners.map(|[x, y]| Point::new(x, y))
    }
}

/// Directory of `<name>.json` preset files
#[derive(Debug, Clone)]
pub struct PresetStore {
    dir: PathBuf,
}

impl PresetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, PresetError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(&['/', '\\', '\0'][..]);
        if !valid {
            return Err(PresetError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", name)))
    }

    /// Write `preset` under `name`, replacing any previous file atomically
    pub fn save(&self, name: &str, preset: &Preset) -> Result<PathBuf, PresetError> {
        let path = self.path_for(name)?;

        std::fs::create_dir_all(&self.dir).map_err(|source| PresetError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let json = serde_json::to_string_pretty(preset).map_err(|source| PresetError::Parse {
            path: path.clone(),
            source,
        })?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(|source| PresetError::Io {
                path: path.clone(),
                source,
            })?;

        info!("Saved preset {:?} ({}) to {:?}", name, preset.label, path);
        Ok(path)
    }

    /// Read the preset stored under `name`; fully validated before returning
    pub fn load(&self, name: &str) -> Result<Preset, PresetError> {
        let path = self.path_for(name)?;
        let content = std::fs::read_to_string(&path).map_err(|source| PresetError::Io {
            path: path.clone(),
            source,
        })?;
        let preset: Preset = serde_json::from_str(&content).map_err(|source| PresetError::Parse {
            path: path.clone(),
            source,
        })?;

        if preset.corners.iter().flatten().any(|v| !v.is_finite()) {
            return Err(PresetError::InvalidCorner { path });
        }

        info!("Loaded preset {:?} ({}) from {:?}", name, preset.label, path);
        Ok(preset)
    }

    /// Load `name` and replace the quad's corners. The quad is untouched on
    /// any failure.
    pub fn load_into(&self, name: &str, quad: &mut Quad) -> Result<Preset, PresetError> {
        let preset = self.load(name)?;
        quad.replace(preset.points());
        Ok(preset)
    }

    /// Names of all stored presets, sorted
    pub fn list(&self) -> Result<Vec<String>, PresetError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PresetError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}
