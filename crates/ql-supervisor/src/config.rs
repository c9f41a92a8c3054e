//! Declarative app + reservation configuration.
//!
//! The config document is a single JSON file in the supervisor's working
//! directory. It is always rewritten whole (write-then-rename); partial
//! mutation of the file never happens. Invariants: app ids are unique, no
//! two apps share a non-zero port, app ports do not collide with
//! reservations, and the supervisor's own reservation is always present.

use parking_lot::RwLock;
use ql_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// The supervisor's own port. Its reservation may not be removed.
pub const SUPERVISOR_PORT: u16 = 8000;

const CONFIG_FILE: &str = "quicklaunch.json";

fn default_startup_timeout() -> u64 {
    30_000
}

fn default_max_restart_attempts() -> u32 {
    3
}

/// One managed app as declared by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 0 means scheduled-only (no server port).
    #[serde(default)]
    pub port: u16,
    /// Absolute directory the command runs in.
    pub path: String,
    /// Whitespace-split argv.
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colors: Option<Vec<String>>,
    /// Path appended to `http://localhost:<port>`; null means root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: u64,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// `HH:MM` or 5-field cron.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default)]
    pub schedule_enabled: bool,
    #[serde(default)]
    pub run_if_missed: bool,
    /// For hybrid apps: the periodic task run beside the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_command: Option<String>,
}

/// The persisted document: apps plus port reservations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub apps: Vec<AppConfig>,
    #[serde(default)]
    pub reserved_ports: BTreeMap<u16, String>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        let mut reserved_ports = BTreeMap::new();
        reserved_ports.insert(SUPERVISOR_PORT, "QuickLaunch supervisor".to_string());
        Self {
            apps: Vec::new(),
            reserved_ports,
        }
    }
}

/// Why the registry rejects a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryReason {
    Reserved,
    App,
}

/// Registry-side view of a port check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCheck {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RegistryReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_by: Option<String>,
}

impl ConfigDocument {
    /// Validate document invariants.
    pub fn validate(&self) -> Result<()> {
        let mut ids = std::collections::HashSet::new();
        let mut ports = std::collections::HashMap::new();

        for app in &self.apps {
            if !ids.insert(app.id.as_str()) {
                return Err(Error::invalid_config(format!("duplicate app id '{}'", app.id)));
            }
            if app.port == 0 {
                continue;
            }
            if let Some(other) = ports.insert(app.port, app.id.as_str()) {
                return Err(Error::invalid_config(format!(
                    "apps '{}' and '{}' both declare port {}",
                    other, app.id, app.port
                )));
            }
            if self.reserved_ports.contains_key(&app.port) {
                return Err(Error::invalid_config(format!(
                    "app '{}' declares reserved port {}",
                    app.id, app.port
                )));
            }
        }

        if !self.reserved_ports.contains_key(&SUPERVISOR_PORT) {
            return Err(Error::invalid_config(format!(
                "reservation for supervisor port {} is missing",
                SUPERVISOR_PORT
            )));
        }

        Ok(())
    }

    /// Registry-only availability check for `port`, optionally ignoring
    /// one app's own declaration.
    pub fn check_port(&self, port: u16, exclude_app: Option<&str>) -> RegistryCheck {
        if let Some(description) = self.reserved_ports.get(&port) {
            return RegistryCheck {
                available: false,
                reason: Some(RegistryReason::Reserved),
                used_by: Some(description.clone()),
            };
        }

        for app in &self.apps {
            if app.port == port && Some(app.id.as_str()) != exclude_app {
                return RegistryCheck {
                    available: false,
                    reason: Some(RegistryReason::App),
                    used_by: Some(app.name.clone()),
                };
            }
        }

        RegistryCheck {
            available: true,
            reason: None,
            used_by: None,
        }
    }

    /// Smallest free port ≥ `base` per the registry (no OS probe).
    pub fn suggest_port(&self, base: u16) -> Result<u16> {
        let mut candidate = base;
        loop {
            if self.check_port(candidate, None).available {
                return Ok(candidate);
            }
            if candidate == u16::MAX {
                return Err(Error::internal(format!(
                    "no free port available at or above {}",
                    base
                )));
            }
            candidate += 1;
        }
    }

    pub fn app(&self, id: &str) -> Option<&AppConfig> {
        self.apps.iter().find(|app| app.id == id)
    }
}

/// The config store: an in-memory document mirrored to disk.
///
/// Concurrent writers are serialized by the RPC surface; the store only
/// guarantees that the file on disk is never partially written.
pub struct ConfigStore {
    path: PathBuf,
    doc: RwLock<ConfigDocument>,
}

impl ConfigStore {
    /// Load the document from `dir`, creating a default one if absent.
    pub async fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);

        let mut doc = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config document found, creating {}", path.display());
                let doc = ConfigDocument::default();
                write_atomic(&path, &doc).await?;
                doc
            }
            Err(e) => return Err(e.into()),
        };

        // The supervisor's own reservation is always present, even when a
        // hand-edited document dropped it.
        doc.reserved_ports
            .entry(SUPERVISOR_PORT)
            .or_insert_with(|| "QuickLaunch supervisor".to_string());

        doc.validate()?;
        Ok(Self {
            path,
            doc: RwLock::new(doc),
        })
    }

    /// Best-effort snapshot of the current document.
    pub fn snapshot(&self) -> ConfigDocument {
        self.doc.read().clone()
    }

    pub fn app(&self, id: &str) -> Option<AppConfig> {
        self.doc.read().app(id).cloned()
    }

    /// Apply a mutation, validate, persist the whole document, then commit
    /// it to memory. On any failure the in-memory document is unchanged.
    pub async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ConfigDocument) -> Result<T>,
    {
        let mut updated = self.snapshot();
        let out = f(&mut updated)?;
        updated.validate()?;
        write_atomic(&self.path, &updated).await?;
        *self.doc.write() = updated;
        Ok(out)
    }
}

async fn write_atomic(path: &Path, doc: &ConfigDocument) -> Result<()> {
    let json = serde_json::to_string_pretty(doc)?;
    let temp = path.with_extension("json.tmp");
    tokio::fs::write(&temp, json).await?;
    tokio::fs::rename(&temp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn app(id: &str, port: u16) -> AppConfig {
        AppConfig {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            port,
            path: "/tmp".to_string(),
            command: "npm run dev".to_string(),
            icon: None,
            icon_path: None,
            colors: None,
            health_check_url: None,
            startup_timeout: default_startup_timeout(),
            auto_restart: false,
            max_restart_attempts: default_max_restart_attempts(),
            schedule: None,
            schedule_enabled: false,
            run_if_missed: false,
            schedule_command: None,
        }
    }

    #[test]
    fn test_default_document_reserves_supervisor_port() {
        let doc = ConfigDocument::default();
        assert_eq!(
            doc.reserved_ports.get(&SUPERVISOR_PORT).map(String::as_str),
            Some("QuickLaunch supervisor")
        );
        doc.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_duplicate_ids_and_ports() {
        let mut doc = ConfigDocument::default();
        doc.apps.push(app("a", 5173));
        doc.apps.push(app("a", 5174));
        assert!(doc.validate().is_err());

        let mut doc = ConfigDocument::default();
        doc.apps.push(app("a", 5173));
        doc.apps.push(app("b", 5173));
        assert!(doc.validate().is_err());

        let mut doc = ConfigDocument::default();
        doc.apps.push(app("a", SUPERVISOR_PORT));
        assert!(doc.validate().is_err());
    }

    #[test]
    fn test_check_port_reasons() {
        let mut doc = ConfigDocument::default();
        doc.apps.push(app("a", 5173));

        let check = doc.check_port(SUPERVISOR_PORT, None);
        assert!(!check.available);
        assert_eq!(check.reason, Some(RegistryReason::Reserved));

        let check = doc.check_port(5173, None);
        assert!(!check.available);
        assert_eq!(check.reason, Some(RegistryReason::App));

        // The app's own port is free when excluded.
        let check = doc.check_port(5173, Some("a"));
        assert!(check.available);

        assert!(doc.check_port(5999, None).available);
    }

    #[test]
    fn test_suggest_skips_taken_ports() {
        let mut doc = ConfigDocument::default();
        doc.apps.push(app("a", 5174));
        doc.reserved_ports.insert(5175, "tools".to_string());

        assert_eq!(doc.suggest_port(5174).unwrap(), 5176);
    }

    #[tokio::test]
    async fn test_open_creates_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ConfigStore::open(dir.path()).await.unwrap();
            store
                .mutate(|doc| {
                    doc.apps.push(app("a", 5173));
                    Ok(())
                })
                .await
                .unwrap();
        }

        let store = ConfigStore::open(dir.path()).await.unwrap();
        assert!(store.app("a").is_some());
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_document_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();

        let result = store
            .mutate(|doc| {
                doc.apps.push(app("a", SUPERVISOR_PORT));
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert!(store.snapshot().apps.is_empty());
    }
}
