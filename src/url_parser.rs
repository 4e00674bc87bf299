//! Repository identity from a remote URL.
//!
//! Bitbucket Server clone URLs look like
//! `https://host[:port]/scm/PROJECT/REPO[.git]`, but the server may be
//! deployed under a sub-path: `https://host/subpath/scm/PROJECT/REPO.git`.
//! Everything before the `scm` segment is the path prefix and belongs to the
//! server's base URL.

use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

pub const ROUTING_SEGMENT: &str = "scm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUrl {
    /// scheme://host[:port][/prefix]
    pub base_url: String,
    pub path_prefix: String,
    pub project_key: Option<String>,
    pub repository_name: Option<String>,
}

impl RemoteUrl {
    /// Project and repository, when the URL follows the hosted-repository convention.
    pub fn coordinates(&self) -> Option<(&str, &str)> {
        match (&self.project_key, &self.repository_name) {
            (Some(project), Some(repo)) => Some((project, repo)),
            _ => None,
        }
    }
}

pub fn parse(remote_url: &str) -> Result<RemoteUrl> {
    let url = Url::parse(remote_url).map_err(|source| Error::Url {
        url: remote_url.to_string(),
        source,
    })?;

    let mut segments = url.path().split('/').filter(|s| !s.is_empty());
    let mut prefix = Vec::new();
    let mut found_routing = false;
    for segment in segments.by_ref() {
        if segment == ROUTING_SEGMENT {
            found_routing = true;
            break;
        }
        prefix.push(segment);
    }

    let (project_key, repository_name) = match (found_routing, segments.next(), segments.next()) {
        (true, Some(project), Some(repo)) => {
            let repo = repo.strip_suffix(".git").unwrap_or(repo);
            (Some(project.to_string()), Some(repo.to_string()))
        }
        _ => (None, None),
    };

    let path_prefix = prefix.join("/");
    let parsed = RemoteUrl {
        base_url: server_root(&url, &path_prefix),
        path_prefix,
        project_key,
        repository_name,
    };
    debug!(?parsed, "parsed remote URL");
    Ok(parsed)
}

fn server_root(url: &Url, path_prefix: &str) -> String {
    let mut root = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        root.push_str(&format!(":{port}"));
    }
    if !path_prefix.is_empty() {
        root.push('/');
        root.push_str(path_prefix);
    }
    root
}

/// True when both URLs point at the same server location: scheme, host,
/// explicit port and path (ignoring a trailing slash) must all match.
pub fn same_location(first: &str, second: &str) -> Result<bool> {
    let parse = |raw: &str| {
        Url::parse(raw).map_err(|source| Error::Url {
            url: raw.to_string(),
            source,
        })
    };
    let (f, s) = (parse(first)?, parse(second)?);
    Ok(f.scheme() == s.scheme()
        && f.host_str() == s.host_str()
        && f.port() == s.port()
        && f.path().trim_end_matches('/') == s.path().trim_end_matches('/'))
}
