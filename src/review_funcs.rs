use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ServerProfile;

const API_PATH: &str = "rest/api/1.0";

#[derive(Error, Debug)]
pub enum ServiceError {
    /// The server answered with an error; `message` is the first one it reported.
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Project {
    pub key: String,
    pub name: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RemoteRepository {
    pub slug: String,
    pub name: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub from_ref: RefInfo,
    pub to_ref: RefInfo,
    #[serde(default)]
    pub reviewers: Vec<Reviewer>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RefInfo {
    pub display_id: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Reviewer {
    pub user: User,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPullRequest<'a> {
    pub project: &'a str,
    pub repository: &'a str,
    pub title: &'a str,
    pub from_branch: &'a str,
    pub to_branch: &'a str,
    pub description: &'a str,
    pub reviewers: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    values: Vec<T>,
    #[serde(default = "last_page")]
    is_last_page: bool,
    next_page_start: Option<u64>,
}

fn last_page() -> bool {
    true
}

#[derive(Deserialize)]
struct ErrorBody {
    errors: Vec<ErrorEntry>,
}

#[derive(Deserialize)]
struct ErrorEntry {
    message: String,
}

/// Operations against the code review server.
pub trait ReviewService {
    async fn list_projects(&self) -> Result<Vec<Project>, ServiceError>;

    async fn list_repositories(&self, project: &str) -> Result<Vec<RemoteRepository>, ServiceError>;

    async fn list_pull_requests(
        &self,
        project: &str,
        repository: &str,
    ) -> Result<Vec<PullRequest>, ServiceError>;

    async fn create_pull_request(
        &self,
        request: &NewPullRequest<'_>,
    ) -> Result<PullRequest, ServiceError>;
}

/// Bitbucket Server REST API client.
pub struct BitbucketClient {
    client: reqwest::Client,
    api_root: String,
    authorization: String,
}

impl BitbucketClient {
    pub fn new(server: &ServerProfile) -> Self {
        debug!("Connecting...{} {}", server.base_url, server.username);
        let credentials = STANDARD.encode(format!("{}:{}", server.username, server.token));
        Self {
            client: reqwest::Client::new(),
            api_root: format!("{}/{API_PATH}", server.base_url.trim_end_matches('/')),
            authorization: format!("Basic {credentials}"),
        }
    }

    async fn get_paged<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, ServiceError> {
        let url = format!("{}/{}", self.api_root, path);
        let mut values = Vec::new();
        let mut start = 0;
        loop {
            let response = self
                .client
                .get(&url)
                .query(&[("start", start)])
                .header(AUTHORIZATION, &self.authorization)
                .header(ACCEPT, "application/json")
                .send()
                .await?;
            let page: Page<T> = check_status(response).await?.json().await?;
            values.extend(page.values);
            match (page.is_last_page, page.next_page_start) {
                (false, Some(next)) if next > start => start = next,
                (false, _) => {
                    warn!("{url}: paging did not advance past {start}, stopping");
                    break;
                }
                _ => break,
            }
        }
        Ok(values)
    }
}

impl ReviewService for BitbucketClient {
    async fn list_projects(&self) -> Result<Vec<Project>, ServiceError> {
        self.get_paged("projects").await
    }

    async fn list_repositories(&self, project: &str) -> Result<Vec<RemoteRepository>, ServiceError> {
        self.get_paged(&format!("projects/{project}/repos")).await
    }

    async fn list_pull_requests(
        &self,
        project: &str,
        repository: &str,
    ) -> Result<Vec<PullRequest>, ServiceError> {
        self.get_paged(&format!("projects/{project}/repos/{repository}/pull-requests"))
            .await
    }

    async fn create_pull_request(
        &self,
        request: &NewPullRequest<'_>,
    ) -> Result<PullRequest, ServiceError> {
        let url = format!(
            "{}/projects/{}/repos/{}/pull-requests",
            self.api_root, request.project, request.repository
        );
        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, &self.authorization)
            .header(ACCEPT, "application/json")
            .json(&pull_request_body(request))
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }
}

pub fn pull_request_body(request: &NewPullRequest<'_>) -> Value {
    let endpoint = |branch: &str| {
        json!({
            "id": format!("refs/heads/{branch}"),
            "repository": {
                "slug": request.repository,
                "project": { "key": request.project },
            },
        })
    };
    let reviewers: Vec<Value> = request
        .reviewers
        .iter()
        .map(|name| json!({ "user": { "name": name } }))
        .collect();

    json!({
        "title": request.title,
        "description": request.description,
        "state": "OPEN",
        "open": true,
        "closed": false,
        "fromRef": endpoint(request.from_branch),
        "toRef": endpoint(request.to_branch),
        "locked": false,
        "reviewers": reviewers,
    })
}

async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await?;
    let reported = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|body| body.errors.into_iter().next())
        .map(|entry| entry.message);
    let message = match reported {
        Some(message) => message,
        None if status == StatusCode::UNAUTHORIZED => format!(
            "Bitbucket API request failed with status: {status}. \nCheck the username and token configured for this server."
        ),
        None => format!("Bitbucket API request failed with status: {status}."),
    };
    Err(ServiceError::Rejected { status, message })
}
