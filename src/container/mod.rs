// src/container/mod.rs
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env,
    path::{Path, PathBuf},
    process::Command,
    time::Instant,
};
use tracing::{debug, info};

use crate::config::ContainerConfig;

/// A container image as `repository:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: &str, tag: &str) -> Self {
        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        }
    }

    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// Last path segment of the repository, e.g. `geocoder`.
    pub fn short_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }

    /// File the DeGAUSS images write next to their input:
    /// `<input stem>_<short name>_<tag>_<suffix>.csv`.
    pub fn output_path(&self, input: &Path, suffix: &str) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = format!("{}_{}_{}_{}.csv", stem, self.short_name(), self.tag, suffix);
        input.with_file_name(name)
    }
}

/// One `run --rm` of an image with a single bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInvocation {
    pub image: String,
    pub mount_source: PathBuf,
    pub mount_target: String,
    pub args: Vec<String>,
}

/// Runs a container to completion. Tools are consumed through a
/// file-in/file-out contract, so only success or failure is reported.
pub trait ContainerRunner: Send + Sync {
    fn run(&self, invocation: &ContainerInvocation) -> Result<()>;
}

/// Shells out to the docker CLI (or anything with the same `run` syntax).
pub struct DockerRunner {
    program: String,
}

impl DockerRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ContainerRunner for DockerRunner {
    #[tracing::instrument(level = "info", skip(self, invocation), fields(image = %invocation.image))]
    fn run(&self, invocation: &ContainerInvocation) -> Result<()> {
        let volume = format!(
            "{}:{}",
            invocation.mount_source.display(),
            invocation.mount_target
        );
        debug!(program = %self.program, volume = %volume, args = ?invocation.args, "container run");

        let start = Instant::now();
        let output = Command::new(&self.program)
            .args(["run", "--rm", "-v", volume.as_str(), invocation.image.as_str()])
            .args(&invocation.args)
            .output()
            .with_context(|| format!("spawning `{}`", self.program))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                invocation.image,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        info!(elapsed = ?start.elapsed(), "container finished");
        debug!(stdout = %String::from_utf8_lossy(&output.stdout), "container output");
        Ok(())
    }
}

/// Builds invocations that mount a local work folder and point the tool at
/// one file inside it.
#[derive(Debug, Clone)]
pub struct Workspace {
    mount_point: String,
    host_root: Option<PathBuf>,
    local_root: PathBuf,
}

impl Workspace {
    pub fn from_config(cfg: &ContainerConfig) -> Result<Self> {
        let local_root = env::current_dir().context("reading current directory")?;
        Ok(Self {
            mount_point: cfg.mount_point.clone(),
            host_root: cfg.host_root.clone(),
            local_root,
        })
    }

    /// Path of `local` as the container host sees it.
    pub fn host_path(&self, local: &Path) -> PathBuf {
        let abs = if local.is_absolute() {
            local.to_path_buf()
        } else {
            self.local_root.join(local)
        };
        match &self.host_root {
            Some(host_root) => match abs.strip_prefix(&self.local_root) {
                Ok(rel) => host_root.join(rel),
                Err(_) => abs,
            },
            None => abs,
        }
    }

    /// Invocation running `image` on `input`, which must sit in the mounted
    /// folder, followed by `extra` arguments.
    pub fn invocation(&self, image: &ImageRef, input: &Path, extra: &[String]) -> Result<ContainerInvocation> {
        let folder = input
            .parent()
            .with_context(|| format!("{} has no parent folder", input.display()))?;
        let file_name = input
            .file_name()
            .with_context(|| format!("{} has no file name", input.display()))?
            .to_string_lossy();

        let mut args = vec![format!(
            "{}/{}",
            self.mount_point.trim_end_matches('/'),
            file_name
        )];
        args.extend(extra.iter().cloned());

        Ok(ContainerInvocation {
            image: image.reference(),
            mount_source: self.host_path(folder),
            mount_target: self.mount_point.clone(),
            args,
        })
    }
}
