use std::cell::Cell;
use std::path::Path;

use git2::{
    BranchType, Cred, CredentialType, ErrorCode, FetchOptions, PushOptions, RemoteCallbacks,
    Repository, Status, StatusOptions,
};
use thiserror::Error;
use tracing::debug;

const MAX_CREDENTIAL_ATTEMPTS: usize = 3;

#[derive(Error, Debug)]
pub enum VcsError {
    #[error("branch '{branch}' has no upstream branch yet")]
    NoUpstream { branch: String },

    #[error("HEAD is detached, please check out a branch first")]
    DetachedHead,

    #[error("push of '{refname}' rejected by remote: {message}")]
    PushRejected { refname: String, message: String },

    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub url: String,
}

/// Version control operations needed by the pull request workflow.
pub trait VcsProvider {
    /// Remotes in configuration order.
    fn remotes(&self) -> Result<Vec<Remote>, VcsError>;

    fn active_branch(&self) -> Result<String, VcsError>;

    /// True when tracked files differ between HEAD, the index and the working tree.
    fn is_dirty(&self) -> Result<bool, VcsError>;

    fn fetch(&self, remote: &str) -> Result<(), VcsError>;

    fn push(&self, branch: &str, remote: &str, establish_tracking: bool) -> Result<(), VcsError>;

    /// Commits only on the local branch and commits only on its upstream.
    /// Fails with [`VcsError::NoUpstream`] when the branch was never pushed.
    fn commits_ahead_behind(&self, branch: &str) -> Result<(usize, usize), VcsError>;
}

pub struct GitRepo {
    repo: Repository,
}

impl GitRepo {
    pub fn open(root: &Path) -> Result<Self, VcsError> {
        Ok(Self {
            repo: Repository::open(root)?,
        })
    }
}

impl VcsProvider for GitRepo {
    fn remotes(&self) -> Result<Vec<Remote>, VcsError> {
        let names = self.repo.remotes()?;
        let mut remotes = Vec::new();
        for name in names.iter().flatten() {
            let remote = self.repo.find_remote(name)?;
            if let Some(url) = remote.url() {
                remotes.push(Remote {
                    name: name.to_string(),
                    url: url.to_string(),
                });
            }
        }
        Ok(remotes)
    }

    fn active_branch(&self) -> Result<String, VcsError> {
        let head = match self.repo.head() {
            Ok(head) => head,
            // A fresh repository has an unborn HEAD that still names a branch
            Err(e) if e.code() == ErrorCode::UnbornBranch => {
                let head = self.repo.find_reference("HEAD")?;
                let target = head.symbolic_target().ok_or(VcsError::DetachedHead)?;
                return Ok(target.trim_start_matches("refs/heads/").to_string());
            }
            Err(e) => return Err(e.into()),
        };
        if !head.is_branch() {
            return Err(VcsError::DetachedHead);
        }
        head.shorthand()
            .map(str::to_string)
            .ok_or(VcsError::DetachedHead)
    }

    fn is_dirty(&self) -> Result<bool, VcsError> {
        let mut opts = StatusOptions::new();
        opts.include_ignored(false).include_untracked(false);

        let statuses = self.repo.statuses(Some(&mut opts))?;
        let mut dirty = false;
        for status in statuses.iter().filter(|s| s.status() != Status::CURRENT) {
            debug!(
                "uncommitted change in {}: {:?}",
                status.path().unwrap_or(""),
                status.status()
            );
            dirty = true;
        }
        Ok(dirty)
    }

    fn fetch(&self, remote: &str) -> Result<(), VcsError> {
        let config = self.repo.config()?;
        let mut remote = self.repo.find_remote(remote)?;
        let mut opts = FetchOptions::new();
        opts.remote_callbacks(remote_callbacks(&config));
        remote.fetch(&[] as &[&str], Some(&mut opts), None)?;
        Ok(())
    }

    fn push(&self, branch: &str, remote_name: &str, establish_tracking: bool) -> Result<(), VcsError> {
        let config = self.repo.config()?;
        let mut remote = self.repo.find_remote(remote_name)?;
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");

        let rejection = Cell::new(None);
        {
            let mut callbacks = remote_callbacks(&config);
            callbacks.push_update_reference(|refname, status| {
                if let Some(message) = status {
                    rejection.set(Some(VcsError::PushRejected {
                        refname: refname.to_string(),
                        message: message.to_string(),
                    }));
                }
                Ok(())
            });
            let mut opts = PushOptions::new();
            opts.remote_callbacks(callbacks);
            remote.push(&[refspec.as_str()], Some(&mut opts))?;
        }
        if let Some(err) = rejection.into_inner() {
            return Err(err);
        }

        if establish_tracking {
            let mut local = self.repo.find_branch(branch, BranchType::Local)?;
            local.set_upstream(Some(&format!("{remote_name}/{branch}")))?;
        }
        Ok(())
    }

    fn commits_ahead_behind(&self, branch: &str) -> Result<(usize, usize), VcsError> {
        let local = self.repo.find_branch(branch, BranchType::Local)?;
        let upstream = match local.upstream() {
            Ok(upstream) => upstream,
            Err(e) if e.code() == ErrorCode::NotFound => {
                return Err(VcsError::NoUpstream {
                    branch: branch.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let local_oid = local.get().peel_to_commit()?.id();
        let upstream_oid = upstream.get().peel_to_commit()?.id();
        Ok(self.repo.graph_ahead_behind(local_oid, upstream_oid)?)
    }
}

/// SSH agent for ssh remotes, git credential helpers for https.
fn remote_callbacks(config: &git2::Config) -> RemoteCallbacks<'_> {
    let mut attempts = 0;
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username, allowed| {
        attempts += 1;
        if attempts > MAX_CREDENTIAL_ATTEMPTS {
            return Err(git2::Error::from_str("authentication failed"));
        }
        if allowed.contains(CredentialType::SSH_KEY) {
            Cred::ssh_key_from_agent(username.unwrap_or("git"))
        } else if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            Cred::credential_helper(config, url, username)
        } else {
            Cred::default()
        }
    });
    callbacks
}
