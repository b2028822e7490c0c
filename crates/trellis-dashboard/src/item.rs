use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The resource kind of a dashboard item.
///
/// This is a closed set: per-variant runtime behavior lives in the executor's
/// dispatch over this tag, not in trait objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
  Dashboard,
  Container,
  Panel,
  Query,
  Input,
  Chart,
  Table,
  Card,
  Image,
  Text,
  Benchmark,
  Control,
}

impl ItemKind {
  /// Kinds that complete by aggregating their children.
  pub fn is_container(&self) -> bool {
    matches!(self, Self::Dashboard | Self::Container | Self::Benchmark)
  }

  /// The snake_case tag used in mod files and node ids.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Dashboard => "dashboard",
      Self::Container => "container",
      Self::Panel => "panel",
      Self::Query => "query",
      Self::Input => "input",
      Self::Chart => "chart",
      Self::Table => "table",
      Self::Card => "card",
      Self::Image => "image",
      Self::Text => "text",
      Self::Benchmark => "benchmark",
      Self::Control => "control",
    }
  }

  /// Kinds that may carry SQL and issue one query per execution attempt.
  pub fn is_query_bearing(&self) -> bool {
    matches!(
      self,
      Self::Panel | Self::Query | Self::Chart | Self::Table | Self::Card | Self::Image
        | Self::Control
    )
  }
}

impl std::fmt::Display for ItemKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A declared runtime dependency: either a named input value or the output of
/// a sibling item, referenced by resource name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "name", rename_all = "snake_case")]
pub enum DependencySource {
  Input(String),
  Item(String),
}

/// A query argument value: a literal, or resolved at runtime from a
/// dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
  Dependency(DependencySource),
  Literal(serde_json::Value),
}

/// A positional query argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryArg {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  pub value: ArgValue,
}

/// One declarative dashboard resource instance.
///
/// Items own their children; the mod file is a literal tree. Names are
/// fully qualified (`mod.kind.short_name`) and immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardItem {
  pub full_name: String,
  pub short_name: String,
  #[serde(rename = "type")]
  pub kind: ItemKind,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  /// Query text for query-bearing kinds. Static kinds leave this unset.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sql: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub args: Vec<QueryArg>,
  /// Dependencies not implied by `args` (e.g. an input whose allowed values
  /// are narrowed by another input).
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub depends_on: Vec<DependencySource>,
  /// Static content for text/image items without a query.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub value: Option<serde_json::Value>,
  /// Backend overrides. Only the root item's values are consulted; the
  /// execution tree selects a single client.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub database: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub search_path: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub children: Vec<DashboardItem>,
  /// Free-form display properties passed through to subscribers untouched.
  #[serde(default, skip_serializing_if = "HashMap::is_empty")]
  pub properties: HashMap<String, serde_json::Value>,
}

impl DashboardItem {
  /// All dependencies this item declares: explicit `depends_on` entries
  /// followed by dependencies referenced from `args`.
  pub fn declared_dependencies(&self) -> Vec<DependencySource> {
    let mut deps = self.depends_on.clone();
    for arg in &self.args {
      if let ArgValue::Dependency(dep) = &arg.value {
        deps.push(dep.clone());
      }
    }
    deps
  }
}
