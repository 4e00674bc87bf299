//! On-disk settings: servers, URL shortcuts, per-repository and per-project
//! overrides. The document is versioned; older documents are upgraded on
//! load by an ordered list of migration steps that only ever add keys.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::servers::ServerRegistry;

pub const CONFIG_VERSION: u32 = 3;
pub const CONFIG_ENV: &str = "BPC_CONFIG";

const DEFAULT_TARGET_BRANCH: &str = "master";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProfile {
    pub shortcut: String,
    #[serde(rename = "baseurl")]
    pub base_url: String,
    pub username: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositorySetting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_default_branch: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSetting {
    /// Comma separated user names
    #[serde(rename = "pr-reviewers", default, skip_serializing_if = "Option::is_none")]
    pub pr_reviewers: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonOptions {
    #[serde(default)]
    pub default_server: String,
    #[serde(default, deserialize_with = "flag")]
    pub pr_set_repo_title: bool,
    #[serde(default, deserialize_with = "flag")]
    pub pr_set_empty_description: bool,
    #[serde(default, deserialize_with = "flag")]
    pub pr_set_auto_fetch: bool,
    #[serde(default, deserialize_with = "flag")]
    pub pr_set_auto_push: bool,
    #[serde(default, deserialize_with = "flag")]
    pub pr_set_ignore_dirty_workarea: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for CommonOptions {
    fn default() -> Self {
        Self {
            default_server: String::new(),
            pr_set_repo_title: true,
            pr_set_empty_description: true,
            pr_set_auto_fetch: true,
            pr_set_auto_push: true,
            pr_set_ignore_dirty_workarea: false,
            extra: BTreeMap::new(),
        }
    }
}

/// Booleans were historically stored as the strings "true"/"false".
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => Ok(value),
        Flag::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "on" | "1" => Ok(true),
            "false" | "no" | "n" | "off" | "0" | "" => Ok(false),
            other => Err(D::Error::custom(format!("invalid boolean '{other}'"))),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub common: CommonOptions,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerProfile>,
    #[serde(rename = "url-shortcut-map", default)]
    pub url_shortcut_map: BTreeMap<String, String>,
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositorySetting>,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectSetting>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            common: CommonOptions::default(),
            servers: BTreeMap::new(),
            url_shortcut_map: BTreeMap::new(),
            repositories: BTreeMap::new(),
            projects: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// Key of the `projects` section: `<path prefix>-<project key>`.
pub fn project_setting_key(path_prefix: &str, project_key: &str) -> String {
    format!("{path_prefix}-{project_key}")
}

impl ConfigDocument {
    pub fn default_branch(&self, remote_url: &str) -> &str {
        self.repositories
            .get(remote_url)
            .and_then(|setting| setting.pr_default_branch.as_deref())
            .unwrap_or(DEFAULT_TARGET_BRANCH)
    }

    pub fn set_default_branch(&mut self, remote_url: &str, branch: &str) {
        self.repositories
            .entry(remote_url.to_string())
            .or_default()
            .pr_default_branch = Some(branch.to_string());
    }

    /// Reviewers configured for a project; empty when none are set.
    pub fn reviewers(&self, project_key: &str) -> Vec<String> {
        self.projects
            .get(project_key)
            .and_then(|setting| setting.pr_reviewers.as_deref())
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_reviewers(&mut self, project_key: &str, reviewers: &str) {
        self.projects
            .entry(project_key.to_string())
            .or_default()
            .pr_reviewers = Some(reviewers.to_string());
    }
}

type MigrationStep = fn(&mut Map<String, Value>);

/// `MIGRATIONS[n]` upgrades a document from version `n` to `n + 1`.
const MIGRATIONS: [MigrationStep; CONFIG_VERSION as usize] =
    [add_base_sections, add_sync_options, add_dirty_workarea_option];

/// v0 -> v1: `common`, `servers`, `url-shortcut-map`, `repositories`;
/// common `default_server`, `pr_set_repo_title`, `pr_set_empty_description`.
fn add_base_sections(doc: &mut Map<String, Value>) {
    for section in ["common", "servers", "url-shortcut-map", "repositories"] {
        ensure_section(doc, section);
    }
    if let Some(common) = ensure_section(doc, "common") {
        ensure_key(common, "default_server", json!(""));
        ensure_key(common, "pr_set_repo_title", json!(true));
        ensure_key(common, "pr_set_empty_description", json!(true));
    }
}

/// v1 -> v2: common `pr_set_auto_fetch`, `pr_set_auto_push`; section `projects`.
fn add_sync_options(doc: &mut Map<String, Value>) {
    if let Some(common) = ensure_section(doc, "common") {
        ensure_key(common, "pr_set_auto_fetch", json!(true));
        ensure_key(common, "pr_set_auto_push", json!(true));
    }
    ensure_section(doc, "projects");
}

/// v2 -> v3: common `pr_set_ignore_dirty_workarea`.
fn add_dirty_workarea_option(doc: &mut Map<String, Value>) {
    if let Some(common) = ensure_section(doc, "common") {
        ensure_key(common, "pr_set_ignore_dirty_workarea", json!(false));
    }
}

fn ensure_section<'a>(doc: &'a mut Map<String, Value>, key: &str) -> Option<&'a mut Map<String, Value>> {
    doc.entry(key).or_insert_with(|| json!({})).as_object_mut()
}

fn ensure_key(map: &mut Map<String, Value>, key: &str, value: Value) {
    map.entry(key).or_insert(value);
}

/// Version of a raw document. Old documents kept it as `common.version`,
/// sometimes as a string. Out of range values saturate so they stay "too new".
pub fn schema_version(doc: &Map<String, Value>) -> u32 {
    let as_version = |value: &Value| {
        let wide = match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        wide.map(|v| u32::try_from(v).unwrap_or(u32::MAX))
    };
    doc.get("version")
        .and_then(as_version)
        .or_else(|| {
            doc.get("common")
                .and_then(|common| common.get("version"))
                .and_then(as_version)
        })
        .unwrap_or(0)
}

/// Applies every pending step until the document reaches [`CONFIG_VERSION`].
pub fn migrate(mut doc: Map<String, Value>) -> Map<String, Value> {
    let mut version = schema_version(&doc);
    while let Some(step) = MIGRATIONS.get(version as usize) {
        debug!("migrating configuration from version {} to {}", version, version + 1);
        step(&mut doc);
        version += 1;
        doc.insert("version".to_string(), json!(version));
    }
    doc
}

/// Filesystem operations used by [`ConfigStore`].
pub trait ConfigFs {
    /// `None` when the file does not exist.
    fn read(&self, path: &Path) -> io::Result<Option<String>>;
    fn write(&self, path: &Path, contents: &str) -> io::Result<()>;
    fn copy(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove(&self, path: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

pub struct OsFs;

impl ConfigFs for OsFs {
    fn read(&self, path: &Path) -> io::Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::copy(from, to).map(|_| ())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }
}

#[derive(Debug)]
pub enum LoadOutcome {
    Existing(ConfigDocument),
    /// No file, or an empty one: first-time setup is needed.
    Empty(ConfigDocument),
}

pub struct ConfigStore<F = OsFs> {
    path: PathBuf,
    fs: F,
}

impl ConfigStore<OsFs> {
    /// `$BPC_CONFIG`, or `~/.bpc/config.json`.
    pub fn default_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let home = dirs::home_dir()
            .ok_or_else(|| Error::user("cannot determine the home directory"))?;
        Ok(home.join(".bpc").join("config.json"))
    }
}

impl<F: ConfigFs> ConfigStore<F> {
    pub fn new(path: PathBuf, fs: F) -> Self {
        Self { path, fs }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        with_suffix(&self.path, ".backup")
    }

    pub fn load(&self) -> Result<LoadOutcome> {
        let raw = match self.fs.read(&self.path)? {
            Some(raw) if !raw.trim().is_empty() => raw,
            _ => {
                info!(
                    "Configuration file is empty, please add at least one Bitbucket server entry"
                );
                return Ok(LoadOutcome::Empty(ConfigDocument::default()));
            }
        };

        let corrupt = |source| Error::CorruptConfig {
            path: self.path.clone(),
            source,
        };
        let map = match serde_json::from_str::<Value>(&raw).map_err(corrupt)? {
            Value::Object(map) => map,
            _ => return Err(corrupt(serde_json::Error::custom("expected a JSON object"))),
        };

        let version = schema_version(&map);
        if version > CONFIG_VERSION {
            return Err(Error::user(format!(
                "configuration file '{}' uses version {version}, newer than the supported {CONFIG_VERSION}",
                self.path.display()
            )));
        }

        let document: ConfigDocument =
            serde_json::from_value(Value::Object(migrate(map))).map_err(corrupt)?;

        if version < CONFIG_VERSION {
            warn!(
                "Current config file is using old version {version}: upgrading to version {CONFIG_VERSION}"
            );
            let stamped = with_suffix(
                &self.backup_path(),
                &Local::now().format("-%Y%m%d-%H%M%S").to_string(),
            );
            self.fs.copy(&self.path, &stamped)?;
            self.save(&document)?;
        }
        Ok(LoadOutcome::Existing(document))
    }

    /// Backup, write, and restore the backup if the write fails.
    pub fn save(&self, document: &ConfigDocument) -> Result<()> {
        let contents = to_pretty_json(document)?;
        if let Some(parent) = self.path.parent() {
            self.fs.create_dir_all(parent)?;
        }
        info!("Writing config file {}", self.path.display());

        if !self.fs.exists(&self.path) {
            if let Err(e) = self.fs.write(&self.path, &contents) {
                if let Err(rm) = self.fs.remove(&self.path) {
                    warn!("cannot remove partial config file: {rm}");
                }
                return Err(e.into());
            }
            return Ok(());
        }

        let backup = self.backup_path();
        self.fs.copy(&self.path, &backup)?;
        if let Err(e) = self.fs.write(&self.path, &contents) {
            error!("Error writing config file, restoring {}", backup.display());
            self.fs.copy(&backup, &self.path)?;
            return Err(e.into());
        }
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Four-space indented JSON with sorted keys.
fn to_pretty_json(document: &ConfigDocument) -> Result<String> {
    let to_io = |e: serde_json::Error| io::Error::new(io::ErrorKind::InvalidData, e);
    // serde_json::Map is ordered, so going through Value sorts every key
    let value = serde_json::to_value(document).map_err(to_io)?;
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser).map_err(to_io)?;
    buf.push(b'\n');
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e).into())
}

/// Configuration state for one command invocation.
pub struct Session<F = OsFs> {
    store: ConfigStore<F>,
    pub document: ConfigDocument,
}

impl<F: ConfigFs> Session<F> {
    /// Checks the cross-references of a loaded document before handing it out.
    pub fn open(store: ConfigStore<F>, mut document: ConfigDocument) -> Result<Self> {
        ServerRegistry::new(&mut document).validate()?;
        Ok(Self { store, document })
    }

    pub fn registry(&mut self) -> ServerRegistry<'_> {
        ServerRegistry::new(&mut self.document)
    }

    pub fn save(&self) -> Result<()> {
        self.store.save(&self.document)
    }
}
