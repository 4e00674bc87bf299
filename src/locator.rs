use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::git_funcs::VcsProvider;
use crate::url_parser::{self, RemoteUrl, ROUTING_SEGMENT};

const VCS_MARKER: &str = ".git";

/// Identity of the local clone, recomputed from live git state on every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryContext {
    pub remote_name: String,
    pub remote_url: String,
    pub branch: String,
    pub location: RemoteUrl,
}

impl RepositoryContext {
    pub fn base_url(&self) -> &str {
        &self.location.base_url
    }

    pub fn path_prefix(&self) -> &str {
        &self.location.path_prefix
    }

    pub fn repository_name(&self) -> Option<&str> {
        self.location.repository_name.as_deref()
    }

    /// Project and repository, or a user error when the remote URL does not carry them.
    pub fn coordinates(&self) -> Result<(&str, &str)> {
        self.location.coordinates().ok_or_else(|| {
            Error::user(format!(
                "remote URL '{}' does not match the expected Bitbucket layout \
                 (.../scm/<project>/<repository>)",
                self.remote_url
            ))
        })
    }
}

pub fn has_marker(dir: &Path) -> bool {
    dir.join(VCS_MARKER).exists()
}

/// Filesystem root or drive root: the walk cannot go further up.
pub fn is_root(dir: &Path) -> bool {
    dir.parent().is_none()
}

pub fn find_root(start: &Path) -> Result<PathBuf> {
    find_root_with(start, has_marker)
}

pub fn find_root_with(start: &Path, marker: impl Fn(&Path) -> bool) -> Result<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        if marker(&current) {
            debug!("repository root: {}", current.display());
            return Ok(current);
        }
        if is_root(&current) {
            return Err(Error::NoRepositoryFound(start.to_path_buf()));
        }
        current.pop();
        debug!("new dir {}", current.display());
    }
}

/// Builds the context from the first remote; further remotes are ignored.
pub fn locate(vcs: &impl VcsProvider) -> Result<RepositoryContext> {
    let remote = vcs
        .remotes()?
        .into_iter()
        .next()
        .ok_or_else(|| Error::user("the repository has no remote configured"))?;
    let location = url_parser::parse(&remote.url)?;
    let branch = vcs.active_branch()?;

    match location.coordinates() {
        Some((project, repo)) => {
            info!("Repository project name: {project}");
            info!("Repository name: {repo}");
        }
        None => warn!(
            "This repository does not seem to be hosted on a Bitbucket server: \
             cannot find '{ROUTING_SEGMENT}/<project>/<repository>' in the URL '{}'",
            remote.url
        ),
    }
    debug!("Bitbucket basepath: {}", location.path_prefix);
    debug!("Bitbucket baseurl: {}", location.base_url);
    info!("Current branch: {branch}");

    Ok(RepositoryContext {
        remote_name: remote.name,
        remote_url: remote.url,
        branch,
        location,
    })
}
