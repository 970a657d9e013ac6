//! Environment id detection from project context and live machines.

use std::collections::BTreeSet;

use camino::Utf8Path;

use crate::error::DriverError;
use crate::fs;
use crate::resource::EnvironmentId;

/// What the working directory says about the project.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProjectContext {
    /// Compose `name:` or directory name.
    pub project_name: Option<String>,
    /// Checked-out git branch, when known.
    pub branch: Option<String>,
    /// Append the branch to the project name.
    pub include_branch: bool,
}

impl ProjectContext {
    /// Builds a context for `dir`.
    ///
    /// `compose_name` wins over the directory name. The branch comes from
    /// `.git/HEAD` and is absent for detached heads or non-git directories.
    #[must_use]
    pub fn discover(dir: &Utf8Path, compose_name: Option<String>, include_branch: bool) -> Self {
        let project_name = compose_name
            .filter(|name| !name.trim().is_empty())
            .or_else(|| dir.file_name().map(str::to_owned));
        Self {
            project_name,
            branch: read_git_branch(dir),
            include_branch,
        }
    }
}

fn read_git_branch(dir: &Utf8Path) -> Option<String> {
    let head = fs::read_to_string(dir.join(".git").join("HEAD").as_str()).ok()?;
    head.trim()
        .strip_prefix("ref: refs/heads/")
        .map(str::to_owned)
}

/// Pluggable strategy for picking an environment id when none is given.
pub trait EnvironmentDetector: Send + Sync {
    /// Derives an id from the project context, or `None` when the context
    /// carries nothing usable.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Configuration`] when the context yields a
    /// name that cannot be normalized.
    fn from_project(&self, context: &ProjectContext) -> Result<Option<EnvironmentId>, DriverError>;

    /// Chooses among the environments that currently have machines.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Configuration`] when there are none and
    /// [`DriverError::AmbiguousEnvironment`] when there are several.
    fn from_live(&self, live: &BTreeSet<EnvironmentId>) -> Result<EnvironmentId, DriverError> {
        let mut candidates = live.iter();
        match (candidates.next(), candidates.next()) {
            (Some(only), None) => Ok(only.clone()),
            (None, _) => Err(DriverError::Configuration(String::from(
                "no environment id given and no running environment found; pass --id",
            ))),
            (Some(_), Some(_)) => Err(DriverError::AmbiguousEnvironment {
                candidates: live.iter().map(|id| id.as_str().to_owned()).collect(),
            }),
        }
    }
}

/// Project name, optionally suffixed with the branch.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultDetector;

impl EnvironmentDetector for DefaultDetector {
    fn from_project(&self, context: &ProjectContext) -> Result<Option<EnvironmentId>, DriverError> {
        let Some(name) = context.project_name.as_deref() else {
            return Ok(None);
        };
        let raw = match context.branch.as_deref() {
            Some(branch) if context.include_branch => format!("{name}-{branch}"),
            _ => name.to_owned(),
        };
        EnvironmentId::normalize(&raw).map(Some)
    }
}
