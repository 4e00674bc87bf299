//! Pull request workflow: safety checks, branch synchronisation, interactive
//! fallbacks and finally the call to the review server. Steps run strictly in
//! order and the first failure aborts the whole command.

use tracing::{debug, info, warn};

use crate::config::{project_setting_key, ConfigDocument, ServerProfile};
use crate::error::{Error, Result};
use crate::git_funcs::{VcsError, VcsProvider};
use crate::locator::RepositoryContext;
use crate::prompt::Prompter;
use crate::review_funcs::{NewPullRequest, PullRequest, ReviewService};
use crate::url_parser;

pub const TITLE_PLACEHOLDER: &str = "Insert title";
pub const DEFAULT_TITLE: &str = "Please customize the title";
const DESCRIPTION_MARKER: &str =
    "#Insert PR description above this line (quit without saving to leave it empty)";

#[derive(Debug, Default, Clone, Copy)]
pub struct PrOptions<'a> {
    pub title: Option<&'a str>,
    pub description: Option<&'a str>,
}

/// The configured server must be the one hosting the repository.
pub fn check_identity(server: &ServerProfile, ctx: &RepositoryContext) -> Result<()> {
    if !url_parser::same_location(&server.base_url, ctx.base_url())? {
        return Err(Error::UrlMismatch {
            server: server.base_url.clone(),
            repository: ctx.base_url().to_string(),
        });
    }
    Ok(())
}

pub fn set_default_branch(
    document: &mut ConfigDocument,
    ctx: &RepositoryContext,
    server: &ServerProfile,
    branch: &str,
) -> Result<()> {
    check_identity(server, ctx)?;
    info!(
        "Setting branch '{branch}' as default target branch for PR on repository {}",
        ctx.repository_name().unwrap_or(&ctx.remote_url)
    );
    document.set_default_branch(&ctx.remote_url, branch);
    Ok(())
}

pub async fn list_pull_requests(
    service: &impl ReviewService,
    ctx: &RepositoryContext,
    server: &ServerProfile,
) -> Result<Vec<PullRequest>> {
    check_identity(server, ctx)?;
    let (project, repository) = ctx.coordinates()?;
    info!("Listing PR for repository: {project}/{repository}");
    Ok(service.list_pull_requests(project, repository).await?)
}

pub struct PullRequestFlow<'a, V, S, P> {
    vcs: &'a V,
    service: &'a S,
    prompter: &'a P,
}

impl<'a, V: VcsProvider, S: ReviewService, P: Prompter> PullRequestFlow<'a, V, S, P> {
    pub fn new(vcs: &'a V, service: &'a S, prompter: &'a P) -> Self {
        Self {
            vcs,
            service,
            prompter,
        }
    }

    pub async fn create(
        &self,
        document: &ConfigDocument,
        ctx: &RepositoryContext,
        server: &ServerProfile,
        options: PrOptions<'_>,
    ) -> Result<PullRequest> {
        check_identity(server, ctx)?;
        let (project, repository) = ctx.coordinates()?;
        let common = &document.common;

        if common.pr_set_ignore_dirty_workarea {
            warn!("Ignoring dirty working area");
        } else if self.vcs.is_dirty()? {
            return Err(Error::user(
                "Please commit all uncommitted changes before creating PR",
            ));
        }

        if common.pr_set_auto_fetch {
            info!("Fetching from remote: {}", ctx.remote_name);
            self.vcs.fetch(&ctx.remote_name)?;
        }

        if common.pr_set_auto_push {
            self.push_local_commits(ctx)?;
        }

        let title = self.resolve_title(
            options.title,
            common.pr_set_repo_title.then_some(repository),
        )?;
        let description =
            self.resolve_description(options.description, common.pr_set_empty_description)?;
        let target = self.resolve_target(document.default_branch(&ctx.remote_url))?;
        let reviewers = document.reviewers(&project_setting_key(ctx.path_prefix(), project));

        debug!("PR recap:\n\tTitle: '{title}'");
        debug!("\tDescription: '{description}'");
        debug!("\tTarget branch:'{target}'");
        debug!("\tReviewers:'{}'", reviewers.join(","));

        let created = self
            .service
            .create_pull_request(&NewPullRequest {
                project,
                repository,
                title: &title,
                from_branch: &ctx.branch,
                to_branch: &target,
                description: &description,
                reviewers: &reviewers,
            })
            .await?;
        Ok(created)
    }

    fn push_local_commits(&self, ctx: &RepositoryContext) -> Result<()> {
        let branch = ctx.branch.as_str();
        let remote = ctx.remote_name.as_str();
        match self.vcs.commits_ahead_behind(branch) {
            Ok((ahead, behind)) => {
                if behind > 0 {
                    warn!("Local branch {branch} is {behind} commit(s) behind its upstream");
                }
                if ahead > 0 {
                    info!("Local branch {branch} contains new commits, pushing to remote server");
                    self.vcs.push(branch, remote, false)?;
                }
            }
            Err(VcsError::NoUpstream { .. }) => {
                info!(
                    "Local branch {branch} will be pushed, since it is not present in remote {remote}"
                );
                self.vcs.push(branch, remote, true)?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn resolve_title(&self, explicit: Option<&str>, repository: Option<&str>) -> Result<String> {
        let title = match explicit {
            Some(title) => title.to_string(),
            None => match self.prompter.edit(TITLE_PLACEHOLDER)? {
                Some(edited) if !edited.trim().is_empty() && edited.trim() != TITLE_PLACEHOLDER => {
                    edited.trim().to_string()
                }
                _ => DEFAULT_TITLE.to_string(),
            },
        };
        Ok(match repository {
            Some(repository) => format!("[{repository}] - {title}"),
            None => title,
        })
    }

    fn resolve_description(&self, explicit: Option<&str>, leave_empty: bool) -> Result<String> {
        if let Some(description) = explicit {
            return Ok(description.to_string());
        }
        if leave_empty {
            return Ok(String::new());
        }
        let template = format!("\n\n\n{DESCRIPTION_MARKER}\n");
        let description = self
            .prompter
            .edit(&template)?
            .map(|text| {
                text.split_once(DESCRIPTION_MARKER)
                    .map_or(text.as_str(), |(above, _)| above)
                    .trim()
                    .to_string()
            })
            .unwrap_or_default();
        Ok(description)
    }

    fn resolve_target(&self, default: &str) -> Result<String> {
        let answer = self
            .prompter
            .input(&format!("Please provide target branch (default: {default}): "))?;
        let answer = answer.trim();
        Ok(if answer.is_empty() { default } else { answer }.to_string())
    }
}
