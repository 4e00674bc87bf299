use std::io;

use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;

use crate::config::ServerProfile;
use crate::review_funcs::{Project, PullRequest, RemoteRepository};

#[derive(Debug, Parser)]
#[command(author, version, long_about = "Bitbucket Server pull request client")]
pub struct Args {
    /// Show debug output
    #[arg(short, long, global = true, action = clap::ArgAction::SetTrue)]
    pub debug: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or list pull requests for the current repository
    #[command(visible_alias = "p")]
    Pr(PrArgs),
    /// Manage servers and options
    #[command(visible_alias = "c")]
    Config(ConfigArgs),
    /// Browse projects and repositories of a server
    #[command(visible_alias = "r")]
    Remote(RemoteArgs),
}

#[derive(Debug, Default, clap::Args)]
pub struct PrArgs {
    /// List open pull requests of the repository
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    pub list: bool,
    /// Pull request title, skips the editor
    #[arg(short, long)]
    pub title: Option<String>,
    /// Pull request description, skips the editor
    #[arg(long)]
    pub description: Option<String>,
    /// Remember BRANCH as the default target branch of this repository
    #[arg(long, value_name = "BRANCH")]
    pub set_default_branch: Option<String>,
}

#[derive(Debug, Default, clap::Args)]
pub struct ConfigArgs {
    /// List configured servers
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    pub list: bool,
    #[arg(long, value_name = "URL")]
    pub server_base_url: Option<String>,
    #[arg(long, value_name = "SHORTCUT")]
    pub server_shortcut: Option<String>,
    #[arg(long)]
    pub username: Option<String>,
    #[arg(long)]
    pub token: Option<String>,
    #[arg(long, value_name = "SHORTCUT")]
    pub set_default_server: Option<String>,
    /// Prefix default PR titles with the repository name
    #[arg(long, value_name = "BOOL")]
    pub pr_set_repo_title: Option<bool>,
    /// Create PRs without asking for a description
    #[arg(long, value_name = "BOOL")]
    pub pr_set_empty_description: Option<bool>,
    /// Fetch the remote before creating a PR
    #[arg(long, value_name = "BOOL")]
    pub pr_set_auto_fetch: Option<bool>,
    /// Push local commits before creating a PR
    #[arg(long, value_name = "BOOL")]
    pub pr_set_auto_push: Option<bool>,
    /// Allow PR creation with uncommitted changes
    #[arg(long, value_name = "BOOL")]
    pub pr_set_ignore_dirty_workarea: Option<bool>,
    /// Comma separated user names, needs --project and --server
    #[arg(long, value_name = "USERS")]
    pub set_default_pr_reviewers: Option<String>,
    #[arg(long)]
    pub project: Option<String>,
    #[arg(long, value_name = "SHORTCUT")]
    pub server: Option<String>,
}

#[derive(Debug, Default, clap::Args)]
pub struct RemoteArgs {
    /// Server shortcut, the default server when omitted
    #[arg(short, long)]
    pub server: Option<String>,
    /// List the repositories of PROJECT instead of the projects
    #[arg(short, long)]
    pub project: Option<String>,
}

pub fn write_usage(out: &mut impl io::Write) -> io::Result<()> {
    Args::command().write_help(out)
}

pub fn append_with_newline(new_str: &str, buffer: &mut String) {
    buffer.push('\n');
    buffer.push_str(new_str);
}

pub fn format_pull_request(pr: &PullRequest) -> String {
    let mut output = format!(">> PR {} - {}", pr.id, pr.title.bold());
    append_with_newline(
        &format!("{} > {}", pr.from_ref.display_id, pr.to_ref.display_id),
        &mut output,
    );
    let description = pr
        .description
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or("empty");
    append_with_newline(&format!("Description: {description}"), &mut output);
    if !pr.reviewers.is_empty() {
        append_with_newline("Reviewers:", &mut output);
        for reviewer in &pr.reviewers {
            append_with_newline(
                &format!("  {} - {}", reviewer.user.display_name, reviewer.user.name),
                &mut output,
            );
        }
    }
    output
}

pub fn format_server(server: &ServerProfile, is_default: bool) -> String {
    let marker = if is_default { "*" } else { " " };
    format!(
        "{marker} {} - {} (user: {}, token: {})",
        server.shortcut.green(),
        server.base_url,
        server.username,
        mask_token(&server.token)
    )
}

pub fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return String::new();
    }
    let visible: String = token.chars().take(2).collect();
    format!("{visible}{}", "*".repeat(6))
}

pub fn format_project(project: &Project) -> String {
    format!("{} ({})", project.key.cyan(), project.name)
}

pub fn format_repository(repository: &RemoteRepository) -> String {
    if repository.slug == repository.name {
        repository.slug.clone()
    } else {
        format!("{} ({})", repository.slug, repository.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review_funcs::{RefInfo, Reviewer, User};

    fn pull_request(description: Option<&str>) -> PullRequest {
        PullRequest {
            id: 42,
            title: "[widgets] - Add gears".into(),
            description: description.map(str::to_string),
            from_ref: RefInfo {
                display_id: "feature-x".into(),
            },
            to_ref: RefInfo {
                display_id: "master".into(),
            },
            reviewers: vec![Reviewer {
                user: User {
                    name: "alice".into(),
                    display_name: "Alice A.".into(),
                },
            }],
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_aliases_and_global_debug() {
        let args = Args::try_parse_from(["bpc", "p", "-d", "--title", "Fix"]).unwrap();
        assert!(args.debug);
        match args.command {
            Some(Command::Pr(pr)) => assert_eq!(pr.title.as_deref(), Some("Fix")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_boolean_options() {
        let args = Args::try_parse_from(["bpc", "config", "--pr-set-auto-push", "false"]).unwrap();
        match args.command {
            Some(Command::Config(config)) => {
                assert_eq!(config.pr_set_auto_push, Some(false));
                assert_eq!(config.pr_set_auto_fetch, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Args::try_parse_from(["bpc", "config", "--pr-set-auto-push", "maybe"]).is_err());
    }

    #[test]
    fn usage_lists_the_subcommands() {
        let mut out = Vec::new();
        write_usage(&mut out).unwrap();
        let usage = String::from_utf8(out).unwrap();
        for command in ["pr", "config", "remote"] {
            assert!(usage.contains(command), "{usage}");
        }
    }

    #[test]
    fn no_subcommand_is_allowed() {
        assert!(Args::try_parse_from(["bpc"]).unwrap().command.is_none());
    }

    #[test]
    fn formats_pull_request() {
        colored::control::set_override(false);
        let text = format_pull_request(&pull_request(None));
        assert_eq!(
            text,
            ">> PR 42 - [widgets] - Add gears\nfeature-x > master\nDescription: empty\nReviewers:\n  Alice A. - alice"
        );
        assert!(format_pull_request(&pull_request(Some("Adds gears"))).contains("Description: Adds gears"));
    }

    #[test]
    fn masks_tokens() {
        assert_eq!(mask_token("secret"), "se******");
        assert_eq!(mask_token(""), "");
    }
}
