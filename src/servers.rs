use tracing::{debug, info};

use crate::config::{ConfigDocument, ServerProfile};
use crate::error::{Error, Result};
use crate::url_parser;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Configured(ServerProfile),
    /// No server is mapped to the base URL; the user has to add one.
    Unconfigured,
}

/// View over the `servers` and `url-shortcut-map` sections of the configuration.
pub struct ServerRegistry<'a> {
    document: &'a mut ConfigDocument,
}

impl<'a> ServerRegistry<'a> {
    pub fn new(document: &'a mut ConfigDocument) -> Self {
        Self { document }
    }

    /// Every mapped shortcut and the default server must name a configured server.
    pub fn validate(&self) -> Result<()> {
        for (url, shortcut) in &self.document.url_shortcut_map {
            if !self.document.servers.contains_key(shortcut) {
                return Err(Error::Consistency(format!(
                    "server '{shortcut}' is listed in url-shortcut-map for {url}, but not in servers"
                )));
            }
        }
        let default = &self.document.common.default_server;
        if !default.is_empty() && !self.document.servers.contains_key(default) {
            return Err(Error::Consistency(format!(
                "default server '{default}' is not configured"
            )));
        }
        Ok(())
    }

    pub fn resolve(&self, base_url: &str) -> Result<Resolution> {
        let Some(shortcut) = self.mapped_shortcut(base_url) else {
            debug!("no server mapped to {base_url}");
            return Ok(Resolution::Unconfigured);
        };
        self.document
            .servers
            .get(shortcut)
            .cloned()
            .map(Resolution::Configured)
            .ok_or_else(|| {
                Error::Consistency(format!(
                    "server '{shortcut}' is listed in url-shortcut-map, but not in servers"
                ))
            })
    }

    /// Exact key first, then keys written by hand that normalize to `base_url`.
    fn mapped_shortcut(&self, base_url: &str) -> Option<&String> {
        let map = &self.document.url_shortcut_map;
        map.get(base_url).or_else(|| {
            map.iter()
                .find(|(url, _)| {
                    url_parser::parse(url).is_ok_and(|parsed| parsed.base_url == base_url)
                })
                .map(|(_, shortcut)| shortcut)
        })
    }

    pub fn get(&self, shortcut: &str) -> Option<&ServerProfile> {
        self.document.servers.get(shortcut)
    }

    pub fn default_shortcut(&self) -> Option<&str> {
        Some(self.document.common.default_server.as_str()).filter(|s| !s.is_empty())
    }

    pub fn default_server(&self) -> Result<&ServerProfile> {
        let shortcut = self
            .default_shortcut()
            .ok_or_else(|| Error::user("missing default server, set one with 'bpc config --set-default-server'"))?;
        self.get(shortcut).ok_or_else(|| {
            Error::Consistency(format!("default server '{shortcut}' is not configured"))
        })
    }

    pub fn set_default(&mut self, shortcut: &str) -> Result<()> {
        if !self.document.servers.contains_key(shortcut) {
            return Err(Error::user(format!(
                "cannot find server '{shortcut}' in bpc configuration"
            )));
        }
        info!("Setting server {shortcut} as default one");
        self.document.common.default_server = shortcut.to_string();
        Ok(())
    }

    /// Adds or replaces a server. The first server added becomes the default.
    /// An address already owned by another shortcut is refused.
    pub fn add(&mut self, mut profile: ServerProfile) -> Result<()> {
        // stored the way repository remotes are parsed, so lookups compare like with like
        profile.base_url = url_parser::parse(&profile.base_url)?.base_url;

        let map = &mut self.document.url_shortcut_map;
        if let Some(owner) = map.get(&profile.base_url) {
            if *owner != profile.shortcut {
                return Err(Error::user(format!(
                    "{} is already configured as server '{owner}'",
                    profile.base_url
                )));
            }
        }
        if let Some(previous) = self.document.servers.get(&profile.shortcut) {
            if previous.base_url != profile.base_url
                && map.get(&previous.base_url) == Some(&profile.shortcut)
            {
                map.remove(&previous.base_url);
            }
        }
        map.insert(profile.base_url.clone(), profile.shortcut.clone());
        if self.document.common.default_server.is_empty() {
            self.document.common.default_server = profile.shortcut.clone();
        }
        info!("Configured server {} ({})", profile.shortcut, profile.base_url);
        self.document.servers.insert(profile.shortcut.clone(), profile);
        Ok(())
    }

    /// Servers in shortcut order.
    pub fn enumerate(&self) -> Vec<&ServerProfile> {
        self.document.servers.values().collect()
    }
}
