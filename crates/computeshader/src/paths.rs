use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use directories_next::ProjectDirs;

pub const ENV_CONFIG_DIR: &str = "COMPUTESHADER_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "COMPUTESHADER_DATA_DIR";

const QUALIFIER: &str = "org";
const ORGANISATION: &str = "ComputeShader";
const APPLICATION: &str = "computeshader";

const SCENE_FILE: &str = "scene.toml";

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn discover() -> Result<Self> {
        let project_dirs = ProjectDirs::from(QUALIFIER, ORGANISATION, APPLICATION)
            .ok_or_else(|| anyhow!("failed to determine user directories"))?;

        let config_dir = resolve_dir(ENV_CONFIG_DIR, project_dirs.config_dir())
            .context("failed to resolve computeshader config directory")?;
        let data_dir = resolve_dir(ENV_DATA_DIR, project_dirs.data_dir())
            .context("failed to resolve computeshader data directory")?;

        Ok(Self {
            config_dir,
            data_dir,
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn scene_roots(&self) -> Vec<PathBuf> {
        vec![self.config_dir.join("scenes"), self.data_dir.join("scenes")]
    }

    /// Finds a scene by path, then by name under the scene roots.
    ///
    /// A name may omit the `.toml` extension or point at a directory that
    /// holds a `scene.toml`.
    pub fn resolve_scene(&self, name: &str) -> Result<PathBuf> {
        let direct = Path::new(name);
        if let Some(found) = scene_file(direct) {
            return Ok(found);
        }
        if direct.is_relative() {
            for root in self.scene_roots() {
                if let Some(found) = scene_file(&root.join(name)) {
                    return Ok(found);
                }
            }
        }
        let searched = self
            .scene_roots()
            .iter()
            .map(|root| root.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        bail!("scene '{name}' not found (searched the working directory, {searched})")
    }
}

#[cfg(test)]
impl AppPaths {
    pub fn from_raw(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            config_dir,
            data_dir,
        }
    }
}

fn scene_file(candidate: &Path) -> Option<PathBuf> {
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }
    if candidate.is_dir() {
        let inner = candidate.join(SCENE_FILE);
        return inner.is_file().then_some(inner);
    }
    let with_extension = candidate.with_extension("toml");
    with_extension.is_file().then_some(with_extension)
}

fn resolve_dir(env_var: &str, default: &Path) -> Result<PathBuf> {
    if let Some(value) = env_override(env_var) {
        return Ok(value);
    }
    Ok(default.to_path_buf())
}

fn env_override(name: &str) -> Option<PathBuf> {
    match env::var_os(name) {
        Some(value) if !value.is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}
