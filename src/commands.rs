use std::env;

use tracing::{debug, error, info, warn};

use crate::config::{project_setting_key, CommonOptions, ConfigFs, ServerProfile, Session};
use crate::error::{Error, Result};
use crate::git_funcs::GitRepo;
use crate::locator;
use crate::pr::{self, PrOptions, PullRequestFlow};
use crate::prompt::Prompter;
use crate::review_funcs::{BitbucketClient, ReviewService};
use crate::servers::Resolution;
use crate::url_parser;
use crate::utils::{self, ConfigArgs, PrArgs, RemoteArgs};

pub async fn run_pr<F: ConfigFs>(
    session: &mut Session<F>,
    args: &PrArgs,
    prompter: &impl Prompter,
) -> Result<()> {
    let root = locator::find_root(&env::current_dir()?)?;
    let vcs = GitRepo::open(&root)?;
    let ctx = locator::locate(&vcs)?;

    let server = match session.registry().resolve(ctx.base_url())? {
        Resolution::Configured(server) => server,
        Resolution::Unconfigured => {
            return Err(Error::UnconfiguredServer {
                base_url: ctx.base_url().to_string(),
            })
        }
    };
    info!(">> Using {}", server.shortcut);

    if let Some(branch) = &args.set_default_branch {
        pr::set_default_branch(&mut session.document, &ctx, &server, branch)?;
        return session.save();
    }

    let client = BitbucketClient::new(&server);
    if args.list {
        let pull_requests = pr::list_pull_requests(&client, &ctx, &server).await?;
        if pull_requests.is_empty() {
            info!("No open pull request");
        }
        for pull_request in &pull_requests {
            println!("{}\n", utils::format_pull_request(pull_request));
        }
        return Ok(());
    }

    let options = PrOptions {
        title: args.title.as_deref(),
        description: args.description.as_deref(),
    };
    let created = PullRequestFlow::new(&vcs, &client, prompter)
        .create(&session.document, &ctx, &server, options)
        .await?;
    info!("PR created");
    println!("{}", utils::format_pull_request(&created));
    Ok(())
}

/// Options are applied by priority: only the first matching action runs.
pub fn run_config<F: ConfigFs>(
    session: &mut Session<F>,
    args: &ConfigArgs,
    prompter: &impl Prompter,
) -> Result<()> {
    if args.list {
        for line in server_listing(session) {
            println!("{line}");
        }
        return Ok(());
    }

    if apply_pr_options(&mut session.document.common, args) {
        return session.save();
    }

    if let Some(reviewers) = &args.set_default_pr_reviewers {
        return set_default_reviewers(session, args, reviewers);
    }

    if let Some(shortcut) = &args.set_default_server {
        session.registry().set_default(shortcut)?;
        info!("Default server is now {shortcut}");
        return session.save();
    }

    add_server(session, Some(args), prompter)
}

pub fn server_listing<F: ConfigFs>(session: &mut Session<F>) -> Vec<String> {
    let registry = session.registry();
    let default = registry.default_shortcut().map(str::to_string);
    registry
        .enumerate()
        .into_iter()
        .map(|server| {
            let is_default = default.as_deref() == Some(server.shortcut.as_str());
            utils::format_server(server, is_default)
        })
        .collect()
}

fn apply_pr_options(common: &mut CommonOptions, args: &ConfigArgs) -> bool {
    let mut changed = false;
    for (requested, option, name) in [
        (args.pr_set_repo_title, &mut common.pr_set_repo_title, "pr_set_repo_title"),
        (
            args.pr_set_empty_description,
            &mut common.pr_set_empty_description,
            "pr_set_empty_description",
        ),
        (args.pr_set_auto_fetch, &mut common.pr_set_auto_fetch, "pr_set_auto_fetch"),
        (args.pr_set_auto_push, &mut common.pr_set_auto_push, "pr_set_auto_push"),
        (
            args.pr_set_ignore_dirty_workarea,
            &mut common.pr_set_ignore_dirty_workarea,
            "pr_set_ignore_dirty_workarea",
        ),
    ] {
        if let Some(value) = requested {
            info!("Setting {name} to {value}");
            *option = value;
            changed = true;
        }
    }
    changed
}

fn set_default_reviewers<F: ConfigFs>(
    session: &mut Session<F>,
    args: &ConfigArgs,
    reviewers: &str,
) -> Result<()> {
    let project = args
        .project
        .as_deref()
        .ok_or_else(|| Error::user("please specify the project with --project"))?;
    let shortcut = args
        .server
        .as_deref()
        .ok_or_else(|| Error::user("please specify the server with --server"))?;
    let server = session
        .registry()
        .get(shortcut)
        .cloned()
        .ok_or_else(|| Error::user(format!("server '{shortcut}' is not configured")))?;

    let prefix = url_parser::parse(&server.base_url)?.path_prefix;
    let key = project_setting_key(&prefix, project);
    debug!("Reviewers list for {key}: {reviewers}");
    session.document.set_reviewers(&key, reviewers);
    info!("Default reviewers set for project {project} on {shortcut}");
    session.save()
}

/// Registers a server from the given flags, asking for whatever is missing.
pub fn add_server<F: ConfigFs>(
    session: &mut Session<F>,
    args: Option<&ConfigArgs>,
    prompter: &impl Prompter,
) -> Result<()> {
    let ask = |given: Option<&String>, prompt: &str| -> Result<String> {
        match given {
            Some(value) => Ok(value.trim().to_string()),
            None => Ok(prompter.input(prompt)?.trim().to_string()),
        }
    };

    info!("Configuring a Bitbucket server");
    let shortcut = ask(args.and_then(|a| a.server_shortcut.as_ref()), "Bitbucket shortcut: ")?;
    let base_url = ask(args.and_then(|a| a.server_base_url.as_ref()), "Bitbucket address: ")?;
    let username = ask(args.and_then(|a| a.username.as_ref()), "Bitbucket user: ")?;
    let token = ask(args.and_then(|a| a.token.as_ref()), "Bitbucket token: ")?;

    if shortcut.is_empty() || base_url.is_empty() {
        return Err(Error::user("server shortcut and address are required"));
    }
    if username.is_empty() || token.is_empty() {
        warn!("No credentials given for {shortcut}, requests will be rejected by the server");
    }

    session.registry().add(ServerProfile {
        shortcut: shortcut.clone(),
        base_url,
        username,
        token,
    })?;
    session.save()?;
    info!("Server {shortcut} saved");
    Ok(())
}

pub async fn run_remote<F: ConfigFs>(session: &mut Session<F>, args: &RemoteArgs) -> Result<()> {
    let server = remote_server(session, args.server.as_deref())?;
    info!(">> Using {}", server.shortcut);
    let client = BitbucketClient::new(&server);
    for line in remote_listing(&client, &server, args.project.as_deref()).await? {
        println!("{line}");
    }
    Ok(())
}

/// The requested server, or the default one when it is unknown or omitted.
fn remote_server<F: ConfigFs>(
    session: &mut Session<F>,
    requested: Option<&str>,
) -> Result<ServerProfile> {
    let registry = session.registry();
    if let Some(server) = requested.and_then(|shortcut| registry.get(shortcut)) {
        return Ok(server.clone());
    }
    let default = registry.default_server()?;
    if let Some(shortcut) = requested {
        warn!(
            "Server {shortcut} is not configured, using the default one ({})",
            default.shortcut
        );
    }
    Ok(default.clone())
}

pub async fn remote_listing(
    service: &impl ReviewService,
    server: &ServerProfile,
    project: Option<&str>,
) -> Result<Vec<String>> {
    match project {
        Some(project) => match service.list_repositories(project).await {
            Ok(repositories) => Ok(repositories.iter().map(utils::format_repository).collect()),
            Err(e) => {
                error!(
                    "Project {project} does not exist in server {}: {e}",
                    server.shortcut
                );
                Ok(Vec::new())
            }
        },
        None => {
            let projects = service.list_projects().await?;
            Ok(projects.iter().map(utils::format_project).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{sample_document, MemFs};
    use crate::config::{ConfigDocument, ConfigStore, LoadOutcome, OsFs};
    use crate::prompt::tests::ScriptedPrompter;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_path() -> PathBuf {
        PathBuf::from("/home/jdoe/.bpc/config.json")
    }

    fn session(document: ConfigDocument) -> Session<MemFs> {
        let store = ConfigStore::new(config_path(), MemFs::default());
        Session::open(store, document).unwrap()
    }

    fn config(edit: impl FnOnce(&mut ConfigArgs)) -> ConfigArgs {
        let mut args = ConfigArgs::default();
        edit(&mut args);
        args
    }

    #[test]
    fn listing_marks_the_default_server() {
        colored::control::set_override(false);
        let mut session = session(sample_document());
        let lines = server_listing(&mut session);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("* corp - https://git.example.com"));
        assert!(!lines[0].contains("secret"));
    }

    #[test]
    fn pr_options_take_priority_over_server_creation() {
        let mut session = session(sample_document());
        let prompter = ScriptedPrompter::default();
        let args = config(|a| {
            a.pr_set_auto_push = Some(false);
            a.pr_set_ignore_dirty_workarea = Some(true);
            a.server_shortcut = Some("other".into());
        });

        run_config(&mut session, &args, &prompter).unwrap();

        assert!(!session.document.common.pr_set_auto_push);
        assert!(session.document.common.pr_set_ignore_dirty_workarea);
        assert!(session.document.common.pr_set_auto_fetch);
        assert!(!session.document.servers.contains_key("other"));
        assert!(prompter.shown.borrow().is_empty());
    }

    #[test]
    fn reviewers_are_keyed_by_server_prefix_and_project() {
        let mut document = sample_document();
        document.servers.insert(
            "tools".into(),
            ServerProfile {
                shortcut: "tools".into(),
                base_url: "https://git.example.com/tools".into(),
                username: "jdoe".into(),
                token: "secret".into(),
            },
        );
        let mut session = session(document);
        let args = config(|a| {
            a.set_default_pr_reviewers = Some("alice, bob".into());
            a.project = Some("ENG".into());
            a.server = Some("tools".into());
        });

        run_config(&mut session, &args, &ScriptedPrompter::default()).unwrap();

        assert_eq!(session.document.reviewers("tools-ENG"), vec!["alice", "bob"]);
        assert!(session.document.reviewers("-ENG").is_empty());
    }

    #[test]
    fn reviewers_need_project_and_server() {
        let mut session = session(sample_document());
        let args = config(|a| {
            a.set_default_pr_reviewers = Some("alice".into());
            a.project = Some("ENG".into());
        });
        let err = run_config(&mut session, &args, &ScriptedPrompter::default()).unwrap_err();
        assert!(matches!(err, Error::User(_)));

        let args = config(|a| {
            a.set_default_pr_reviewers = Some("alice".into());
            a.project = Some("ENG".into());
            a.server = Some("nope".into());
        });
        let err = run_config(&mut session, &args, &ScriptedPrompter::default()).unwrap_err();
        assert!(matches!(err, Error::User(_)));
    }

    #[test]
    fn unknown_default_server_is_refused() {
        let mut session = session(sample_document());
        let args = config(|a| a.set_default_server = Some("nope".into()));
        let err = run_config(&mut session, &args, &ScriptedPrompter::default()).unwrap_err();
        assert!(matches!(err, Error::User(_)));
        assert_eq!(session.document.common.default_server, "corp");
    }

    #[test]
    fn adds_server_from_flags() {
        let mut session = session(sample_document());
        let args = config(|a| {
            a.server_shortcut = Some("oss".into());
            a.server_base_url = Some("https://code.example.org/".into());
            a.username = Some("jane".into());
            a.token = Some("t0k".into());
        });
        let prompter = ScriptedPrompter::default();

        run_config(&mut session, &args, &prompter).unwrap();

        let added = &session.document.servers["oss"];
        assert_eq!(added.base_url, "https://code.example.org");
        assert_eq!(session.document.url_shortcut_map["https://code.example.org"], "oss");
        assert_eq!(session.document.common.default_server, "corp");
        assert!(prompter.shown.borrow().is_empty());
    }

    #[test]
    fn first_server_is_prompted_and_becomes_default() {
        let mut session = session(ConfigDocument::default());
        let prompter = ScriptedPrompter::answering(&[
            "corp",
            "https://git.example.com/tools",
            "jdoe",
            "secret",
        ]);

        add_server(&mut session, None, &prompter).unwrap();

        assert_eq!(prompter.shown.borrow().len(), 4);
        assert_eq!(session.document.common.default_server, "corp");
        assert_eq!(session.document.url_shortcut_map["https://git.example.com/tools"], "corp");
    }

    #[test]
    fn server_creation_is_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".bpc").join("config.json");
        let store = ConfigStore::new(path.clone(), OsFs);
        let mut session = Session::open(store, ConfigDocument::default()).unwrap();
        let prompter =
            ScriptedPrompter::answering(&["corp", "https://git.example.com", "jdoe", "secret"]);

        add_server(&mut session, None, &prompter).unwrap();

        let LoadOutcome::Existing(reloaded) = ConfigStore::new(path, OsFs).load().unwrap() else {
            panic!("configuration was not written");
        };
        assert_eq!(reloaded.servers["corp"].base_url, "https://git.example.com");
        assert_eq!(reloaded.common.default_server, "corp");
    }

    #[test]
    fn missing_address_is_a_user_error() {
        let mut session = session(ConfigDocument::default());
        let prompter = ScriptedPrompter::answering(&["corp", "", "jdoe", "secret"]);
        let err = add_server(&mut session, None, &prompter).unwrap_err();
        assert!(matches!(err, Error::User(_)));
        assert!(session.document.servers.is_empty());
    }

    #[test]
    fn unknown_remote_server_falls_back_to_default() {
        let mut session = session(sample_document());
        let server = remote_server(&mut session, Some("nope")).unwrap();
        assert_eq!(server.shortcut, "corp");
        let server = remote_server(&mut session, None).unwrap();
        assert_eq!(server.shortcut, "corp");
    }

    #[test]
    fn remote_needs_a_default_server() {
        let mut session = session(ConfigDocument::default());
        assert!(matches!(remote_server(&mut session, None), Err(Error::User(_))));
        assert!(matches!(remote_server(&mut session, Some("nope")), Err(Error::User(_))));
    }

    #[test]
    fn requested_remote_server_needs_no_default() {
        let mut document = sample_document();
        document.common.default_server.clear();
        let mut session = session(document);
        let server = remote_server(&mut session, Some("corp")).unwrap();
        assert_eq!(server.shortcut, "corp");
    }

    #[test]
    fn added_address_matches_repository_remotes() {
        let mut session = session(ConfigDocument::default());
        let args = config(|a| {
            a.server_shortcut = Some("corp".into());
            a.server_base_url = Some("https://Git.Example.com:443".into());
            a.username = Some("jdoe".into());
            a.token = Some("secret".into());
        });
        run_config(&mut session, &args, &ScriptedPrompter::default()).unwrap();

        let remote = url_parser::parse("https://Git.Example.com:443/scm/ENG/widgets.git").unwrap();
        assert!(matches!(
            session.registry().resolve(&remote.base_url).unwrap(),
            Resolution::Configured(_)
        ));
    }

    #[test]
    fn address_of_another_server_is_refused() {
        let mut session = session(sample_document());
        let args = config(|a| {
            a.server_shortcut = Some("dup".into());
            a.server_base_url = Some("https://git.example.com/".into());
            a.username = Some("jdoe".into());
            a.token = Some("secret".into());
        });
        let err = run_config(&mut session, &args, &ScriptedPrompter::default()).unwrap_err();
        assert!(matches!(err, Error::User(_)));
        assert!(!session.document.servers.contains_key("dup"));
    }

    fn profile(base_url: String) -> ServerProfile {
        ServerProfile {
            shortcut: "corp".into(),
            base_url,
            username: "jdoe".into(),
            token: "secret".into(),
        }
    }

    #[tokio::test]
    async fn lists_projects_and_repositories() {
        colored::control::set_override(false);
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "values": [{"key": "ENG", "name": "Engineering"}],
                "isLastPage": true
            })))
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/ENG/repos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "values": [{"slug": "widgets", "name": "widgets"}],
                "isLastPage": true
            })))
            .mount(&mock)
            .await;
        let server = profile(mock.uri());
        let client = BitbucketClient::new(&server);

        let projects = remote_listing(&client, &server, None).await.unwrap();
        assert_eq!(projects, vec!["ENG (Engineering)"]);
        let repositories = remote_listing(&client, &server, Some("ENG")).await.unwrap();
        assert_eq!(repositories, vec!["widgets"]);
    }

    #[tokio::test]
    async fn unknown_project_lists_nothing() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/NOPE/repos"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "errors": [{"message": "Project NOPE does not exist."}]
            })))
            .mount(&mock)
            .await;
        let server = profile(mock.uri());
        let client = BitbucketClient::new(&server);

        let lines = remote_listing(&client, &server, Some("NOPE")).await.unwrap();
        assert!(lines.is_empty());
    }
}
