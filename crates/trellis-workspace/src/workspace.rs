use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use trellis_dashboard::DashboardItem;
use trellis_events::{DashboardEvent, DashboardEventBus, EventSubscription};

/// Errors from loading a mod or resolving its resources.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
  #[error("failed to read mod file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse mod file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("duplicate resource name '{name}' in mod")]
  DuplicateResource { name: String },
}

/// The on-disk mod definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModDef {
  pub name: String,
  #[serde(default)]
  pub dashboards: Vec<DashboardItem>,
  /// Snapshot name to file path, relative to the mod directory.
  #[serde(default)]
  pub snapshots: HashMap<String, PathBuf>,
}

/// A loaded mod plus the session event bus.
pub struct Workspace {
  mod_name: String,
  path: PathBuf,
  /// Every resource in the mod, flattened and keyed by full name.
  resources: HashMap<String, DashboardItem>,
  snapshots: HashMap<String, PathBuf>,
  bus: DashboardEventBus,
}

impl Workspace {
  /// Build a workspace from an already-parsed mod definition.
  ///
  /// `path` is the mod directory; snapshot paths resolve relative to it.
  pub fn new(mod_def: ModDef, path: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
    let path = path.into();
    let mut resources = HashMap::new();
    for dashboard in &mod_def.dashboards {
      index_item(dashboard, &mut resources)?;
    }

    let snapshots = mod_def
      .snapshots
      .into_iter()
      .map(|(name, snapshot_path)| {
        let resolved = if snapshot_path.is_absolute() {
          snapshot_path
        } else {
          path.join(snapshot_path)
        };
        (name, resolved)
      })
      .collect();

    Ok(Self {
      mod_name: mod_def.name,
      path,
      resources,
      snapshots,
      bus: DashboardEventBus::new(),
    })
  }

  /// Load a mod file (JSON) and build the workspace around it.
  pub async fn load(mod_file: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
    let mod_file = mod_file.as_ref();
    let content = tokio::fs::read_to_string(mod_file)
      .await
      .map_err(|source| WorkspaceError::Read {
        path: mod_file.to_path_buf(),
        source,
      })?;

    let mod_def: ModDef =
      serde_json::from_str(&content).map_err(|source| WorkspaceError::Parse {
        path: mod_file.to_path_buf(),
        source,
      })?;

    debug!(mod_name = %mod_def.name, "loaded mod");
    let dir = mod_file.parent().unwrap_or(Path::new(".")).to_path_buf();
    Self::new(mod_def, dir)
  }

  pub fn mod_name(&self) -> &str {
    &self.mod_name
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Look up a resource by fully-qualified name.
  pub fn get_resource(&self, name: &str) -> Option<&DashboardItem> {
    self.resources.get(name)
  }

  /// Resolve a snapshot name to its file path.
  pub fn snapshot_path(&self, name: &str) -> Option<&Path> {
    self.snapshots.get(name).map(PathBuf::as_path)
  }

  /// Publish a dashboard event to all registered subscribers.
  pub fn publish_event(&self, event: DashboardEvent) {
    self.bus.publish(event);
  }

  /// Subscribe to all events published through this workspace.
  pub fn subscribe(&self) -> EventSubscription {
    self.bus.subscribe()
  }

  /// Subscribe to one session's events.
  pub fn subscribe_session(&self, session: &str) -> EventSubscription {
    self.bus.subscribe_session(session)
  }
}

fn index_item(
  item: &DashboardItem,
  resources: &mut HashMap<String, DashboardItem>,
) -> Result<(), WorkspaceError> {
  if resources
    .insert(item.full_name.clone(), item.clone())
    .is_some()
  {
    return Err(WorkspaceError::DuplicateResource {
      name: item.full_name.clone(),
    });
  }
  for child in &item.children {
    index_item(child, resources)?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use trellis_dashboard::ItemKind;

  fn leaf(full_name: &str, kind: ItemKind) -> DashboardItem {
    DashboardItem {
      full_name: full_name.to_string(),
      short_name: full_name.rsplit('.').next().unwrap_or(full_name).to_string(),
      kind,
      title: None,
      sql: None,
      args: vec![],
      depends_on: vec![],
      value: None,
      database: None,
      search_path: None,
      children: vec![],
      properties: HashMap::new(),
    }
  }

  #[test]
  fn indexes_nested_resources() {
    let mut root = leaf("m.dashboard.main", ItemKind::Dashboard);
    root.children.push(leaf("m.chart.sales", ItemKind::Chart));

    let mod_def = ModDef {
      name: "m".to_string(),
      dashboards: vec![root],
      snapshots: HashMap::new(),
    };
    let workspace = Workspace::new(mod_def, "/tmp/mod").expect("workspace");

    assert!(workspace.get_resource("m.dashboard.main").is_some());
    assert!(workspace.get_resource("m.chart.sales").is_some());
    assert!(workspace.get_resource("m.chart.missing").is_none());
  }

  #[test]
  fn duplicate_resources_are_rejected() {
    let mod_def = ModDef {
      name: "m".to_string(),
      dashboards: vec![
        leaf("m.dashboard.main", ItemKind::Dashboard),
        leaf("m.dashboard.main", ItemKind::Dashboard),
      ],
      snapshots: HashMap::new(),
    };

    let result = Workspace::new(mod_def, "/tmp/mod");
    assert!(matches!(
      result,
      Err(WorkspaceError::DuplicateResource { .. })
    ));
  }

  #[test]
  fn snapshot_paths_resolve_relative_to_mod_dir() {
    let mut snapshots = HashMap::new();
    snapshots.insert("latest".to_string(), PathBuf::from("snaps/latest.json"));

    let mod_def = ModDef {
      name: "m".to_string(),
      dashboards: vec![],
      snapshots,
    };
    let workspace = Workspace::new(mod_def, "/tmp/mod").expect("workspace");

    assert_eq!(
      workspace.snapshot_path("latest"),
      Some(Path::new("/tmp/mod/snaps/latest.json"))
    );
    assert!(workspace.snapshot_path("missing").is_none());
  }

  #[tokio::test]
  async fn load_parses_mod_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mod_file = dir.path().join("mod.json");
    std::fs::write(
      &mod_file,
      r#"{
        "name": "demo",
        "dashboards": [
          {
            "full_name": "demo.dashboard.main",
            "short_name": "main",
            "type": "dashboard"
          }
        ]
      }"#,
    )
    .expect("write mod file");

    let workspace = Workspace::load(&mod_file).await.expect("load");
    assert_eq!(workspace.mod_name(), "demo");
    assert!(workspace.get_resource("demo.dashboard.main").is_some());
  }
}
