//! End-to-end executor tests against a mock SQL backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use trellis_dashboard::{
  ArgValue, DashboardItem, DependencySource, ItemKind, NodeState, QueryArg, RunStatus,
};
use trellis_db::{ClientFactory, ClientKey, ClientPool, ConnectOptions, DbError, SqlClient,
  TableColumn, TableData};
use trellis_events::{DashboardEvent, EventSubscription};
use trellis_executor::{DashboardExecutor, ExecutorConfig, ExecutorError};
use trellis_workspace::{ModDef, Workspace};

/// A backend returning one canned row per query, with optional latency and
/// failure injection.
struct MockClient {
  delay: Option<Duration>,
  fail_sql: Option<String>,
  queries: Mutex<Vec<(String, Vec<Value>)>>,
}

impl MockClient {
  fn new(delay: Option<Duration>, fail_sql: Option<String>) -> Self {
    Self {
      delay,
      fail_sql,
      queries: Mutex::new(Vec::new()),
    }
  }

  fn recorded_queries(&self) -> Vec<(String, Vec<Value>)> {
    self.queries.lock().expect("queries poisoned").clone()
  }
}

#[async_trait::async_trait]
impl SqlClient for MockClient {
  async fn query(&self, sql: &str, args: &[Value]) -> Result<TableData, DbError> {
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    self
      .queries
      .lock()
      .expect("queries poisoned")
      .push((sql.to_string(), args.to_vec()));
    if self.fail_sql.as_deref() == Some(sql) {
      return Err(DbError::UnsupportedArgument {
        message: "injected failure".to_string(),
      });
    }
    Ok(TableData {
      columns: vec![TableColumn {
        name: "value".to_string(),
        data_type: "text".to_string(),
      }],
      rows: vec![vec![json!("ok")]],
    })
  }

  async fn close(&self) {}
}

struct MockFactory {
  client: Arc<MockClient>,
}

#[async_trait::async_trait]
impl ClientFactory for MockFactory {
  async fn connect(&self, _key: &ClientKey) -> Result<Arc<dyn SqlClient>, DbError> {
    Ok(self.client.clone())
  }
}

struct Harness {
  executor: DashboardExecutor,
  workspace: Arc<Workspace>,
  client: Arc<MockClient>,
}

fn harness(root: DashboardItem, config: ExecutorConfig) -> Harness {
  harness_with_client(root, config, Arc::new(MockClient::new(None, None)))
}

fn harness_with_client(
  root: DashboardItem,
  config: ExecutorConfig,
  client: Arc<MockClient>,
) -> Harness {
  let mod_def = ModDef {
    name: "m".to_string(),
    dashboards: vec![root],
    snapshots: HashMap::new(),
  };
  let workspace = Arc::new(Workspace::new(mod_def, "/tmp/m").expect("workspace"));
  let pool = Arc::new(ClientPool::new(
    Arc::new(MockFactory {
      client: client.clone(),
    }),
    "sqlite::memory:",
  ));
  Harness {
    executor: DashboardExecutor::with_config(pool, config),
    workspace,
    client,
  }
}

fn item(full_name: &str, kind: ItemKind) -> DashboardItem {
  DashboardItem {
    full_name: full_name.to_string(),
    short_name: full_name
      .rsplit('.')
      .next()
      .unwrap_or(full_name)
      .to_string(),
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

/// A dashboard with one free input and one chart depending on it.
fn region_dashboard() -> DashboardItem {
  let mut root = item("m.dashboard.main", ItemKind::Dashboard);
  root.children.push(item("m.input.region", ItemKind::Input));
  let mut chart = item("m.chart.sales", ItemKind::Chart);
  chart.sql = Some("select * from sales where region = $1".to_string());
  chart.args = vec![QueryArg {
    name: None,
    value: ArgValue::Dependency(DependencySource::Input("region".to_string())),
  }];
  root.children.push(chart);
  root
}

/// Inputs A (free), B (depends on A), C (depends on B).
fn cascade_dashboard() -> DashboardItem {
  let mut root = item("m.dashboard.main", ItemKind::Dashboard);
  root.children.push(item("m.input.a", ItemKind::Input));
  let mut b = item("m.input.b", ItemKind::Input);
  b.depends_on = vec![DependencySource::Input("a".to_string())];
  root.children.push(b);
  let mut c = item("m.input.c", ItemKind::Input);
  c.depends_on = vec![DependencySource::Input("b".to_string())];
  root.children.push(c);
  root
}

fn inputs(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
  pairs
    .iter()
    .map(|(name, value)| (name.to_string(), value.clone()))
    .collect()
}

async fn wait_for_event<F>(sub: &mut EventSubscription, pred: F) -> DashboardEvent
where
  F: Fn(&DashboardEvent) -> bool,
{
  tokio::time::timeout(Duration::from_secs(2), async {
    loop {
      let event = sub.recv().await;
      if pred(&event) {
        return event;
      }
    }
  })
  .await
  .expect("timed out waiting for event")
}

async fn wait_for_status(
  executor: &DashboardExecutor,
  session: &str,
  expected: RunStatus,
) -> Arc<trellis_executor::ExecutionTree> {
  tokio::time::timeout(Duration::from_secs(2), async {
    loop {
      if let Some(tree) = executor.get_execution(session) {
        if tree.run_status() == expected {
          return tree;
        }
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .expect("timed out waiting for run status")
}

// --- S1: interactive happy path ---

#[tokio::test]
async fn interactive_input_unblocks_query_node() {
  let h = harness(region_dashboard(), ExecutorConfig::default());
  let mut sub = h.workspace.subscribe();

  h.executor
    .execute_dashboard(
      "s1",
      "m.dashboard.main",
      HashMap::new(),
      &h.workspace,
      ConnectOptions::default(),
    )
    .await
    .expect("execute");

  wait_for_event(&mut sub, |e| {
    matches!(e, DashboardEvent::ExecutionStarted { session, .. } if session == "s1")
  })
  .await;

  // the query node blocks until its input arrives
  wait_for_event(&mut sub, |e| {
    matches!(
      e,
      DashboardEvent::LeafNodeUpdated { node_id, state, .. }
        if node_id == "main.chart.sales" && *state == NodeState::Blocked
    )
  })
  .await;

  h.executor
    .on_input_changed("s1", inputs(&[("region", json!("us-east-1"))]), "region")
    .await
    .expect("input change");

  wait_for_event(&mut sub, |e| {
    matches!(
      e,
      DashboardEvent::LeafNodeComplete { node_id, state, .. }
        if node_id == "main.chart.sales" && *state == NodeState::Complete
    )
  })
  .await;
  wait_for_event(&mut sub, |e| {
    matches!(
      e,
      DashboardEvent::ExecutionComplete { status, .. } if *status == RunStatus::Complete
    )
  })
  .await;

  // the query saw the resolved input value
  let queries = h.client.recorded_queries();
  assert_eq!(queries.len(), 1);
  assert_eq!(queries[0].1, vec![json!("us-east-1")]);
}

// --- S2: batch missing inputs / property 2 ---

#[tokio::test]
async fn batch_mode_rejects_missing_inputs() {
  let h = harness(
    region_dashboard(),
    ExecutorConfig {
      interactive: false,
      request_deadline: None,
    },
  );

  let result = h
    .executor
    .execute_dashboard(
      "s1",
      "m.dashboard.main",
      HashMap::new(),
      &h.workspace,
      ConnectOptions::default(),
    )
    .await;

  let err = result.expect_err("must fail");
  assert!(matches!(err, ExecutorError::MissingInputs { .. }));
  assert!(err
    .to_string()
    .contains("input 'region' must be provided"));
  // the tree was never registered
  assert!(h.executor.get_execution("s1").is_none());
}

#[tokio::test]
async fn batch_mode_completes_with_all_inputs() {
  let h = harness(
    region_dashboard(),
    ExecutorConfig {
      interactive: false,
      request_deadline: None,
    },
  );
  let mut sub = h.workspace.subscribe();

  h.executor
    .execute_dashboard(
      "s1",
      "m.dashboard.main",
      inputs(&[("region", json!("eu-west-1"))]),
      &h.workspace,
      ConnectOptions::default(),
    )
    .await
    .expect("execute");

  wait_for_event(&mut sub, |e| {
    matches!(
      e,
      DashboardEvent::ExecutionComplete { status, .. } if *status == RunStatus::Complete
    )
  })
  .await;

  let tree = h.executor.get_execution("s1").expect("registered");
  assert_eq!(
    tree.node_output("main.input.region"),
    Some(json!("eu-west-1"))
  );
}

// --- S3: input cascade / property 3 ---

#[tokio::test]
async fn changed_input_clears_dependents_and_reexecutes() {
  let h = harness(cascade_dashboard(), ExecutorConfig::default());
  let mut sub = h.workspace.subscribe();

  h.executor
    .execute_dashboard(
      "s1",
      "m.dashboard.main",
      inputs(&[("a", json!("x")), ("b", json!("y")), ("c", json!("z"))]),
      &h.workspace,
      ConnectOptions::default(),
    )
    .await
    .expect("execute");
  let first = wait_for_status(&h.executor, "s1", RunStatus::Complete).await;

  h.executor
    .on_input_changed(
      "s1",
      inputs(&[("a", json!("x2")), ("b", json!("y")), ("c", json!("z"))]),
      "a",
    )
    .await
    .expect("input change");

  let cleared = wait_for_event(&mut sub, |e| {
    matches!(e, DashboardEvent::InputValuesCleared { .. })
  })
  .await;
  match cleared {
    DashboardEvent::InputValuesCleared { cleared_inputs, .. } => {
      assert_eq!(cleared_inputs, vec!["b".to_string(), "c".to_string()]);
    }
    other => panic!("unexpected event: {other:?}"),
  }

  // previous value of "a" was non-null, so the dashboard re-executes; the
  // new run blocks on the cleared inputs
  let second = wait_for_status(&h.executor, "s1", RunStatus::Blocked).await;
  assert_ne!(first.id(), second.id());
  assert_eq!(second.node_output("main.input.a"), Some(json!("x2")));
  assert_eq!(second.node_state("main.input.b"), Some(NodeState::Blocked));
  assert_eq!(second.node_state("main.input.c"), Some(NodeState::Blocked));
}

#[tokio::test]
async fn input_clearing_terminates_on_cyclic_declarations() {
  // a <-> b declared cycle, c depends on b
  let mut root = item("m.dashboard.main", ItemKind::Dashboard);
  let mut a = item("m.input.a", ItemKind::Input);
  a.depends_on = vec![DependencySource::Input("b".to_string())];
  root.children.push(a);
  let mut b = item("m.input.b", ItemKind::Input);
  b.depends_on = vec![DependencySource::Input("a".to_string())];
  root.children.push(b);
  let mut c = item("m.input.c", ItemKind::Input);
  c.depends_on = vec![DependencySource::Input("b".to_string())];
  root.children.push(c);

  let h = harness(root, ExecutorConfig::default());
  let mut sub = h.workspace.subscribe();

  h.executor
    .execute_dashboard(
      "s1",
      "m.dashboard.main",
      inputs(&[("a", json!("1")), ("b", json!("2")), ("c", json!("3"))]),
      &h.workspace,
      ConnectOptions::default(),
    )
    .await
    .expect("execute");
  wait_for_status(&h.executor, "s1", RunStatus::Complete).await;

  h.executor
    .on_input_changed(
      "s1",
      inputs(&[("a", json!("changed")), ("b", json!("2")), ("c", json!("3"))]),
      "a",
    )
    .await
    .expect("input change");

  let cleared = wait_for_event(&mut sub, |e| {
    matches!(e, DashboardEvent::InputValuesCleared { .. })
  })
  .await;
  match cleared {
    DashboardEvent::InputValuesCleared { cleared_inputs, .. } => {
      assert_eq!(cleared_inputs, vec!["b".to_string(), "c".to_string()]);
    }
    other => panic!("unexpected event: {other:?}"),
  }
}

// --- S4: replacement / property 1 ---

#[tokio::test]
async fn replacement_cancels_the_previous_execution() {
  let slow = Arc::new(MockClient::new(Some(Duration::from_millis(200)), None));
  let mut root = region_dashboard();
  let mut other = item("m.dashboard.other", ItemKind::Dashboard);
  let mut card = item("m.card.count", ItemKind::Card);
  card.sql = Some("select count(*) from sales".to_string());
  other.children.push(card);
  root.children.push(other);

  let h = harness_with_client(root, ExecutorConfig::default(), slow);
  let mut sub = h.workspace.subscribe();

  h.executor
    .execute_dashboard(
      "s1",
      "m.dashboard.main",
      inputs(&[("region", json!("us-east-1"))]),
      &h.workspace,
      ConnectOptions::default(),
    )
    .await
    .expect("first execute");
  let first = h.executor.get_execution("s1").expect("first registered");

  h.executor
    .execute_dashboard(
      "s1",
      "m.dashboard.other",
      HashMap::new(),
      &h.workspace,
      ConnectOptions::default(),
    )
    .await
    .expect("second execute");

  let current = h.executor.get_execution("s1").expect("second registered");
  assert_eq!(current.root_resource(), "m.dashboard.other");
  assert_ne!(current.id(), first.id());

  wait_for_event(&mut sub, |e| {
    matches!(
      e,
      DashboardEvent::ExecutionError { error, .. } if error == "dashboard execution cancelled"
    )
  })
  .await;

  let second_id = current.id().to_string();
  wait_for_event(&mut sub, |e| {
    matches!(
      e,
      DashboardEvent::ExecutionComplete { execution_id, status, .. }
        if *execution_id == second_id && *status == RunStatus::Complete
    )
  })
  .await;
}

// --- S5: deadline ---

#[tokio::test]
async fn deadline_normalizes_to_execution_timed_out() {
  let slow = Arc::new(MockClient::new(Some(Duration::from_millis(500)), None));
  let h = harness_with_client(
    region_dashboard(),
    ExecutorConfig {
      interactive: true,
      request_deadline: Some(Duration::from_millis(20)),
    },
    slow,
  );
  let mut sub = h.workspace.subscribe();

  // result may be Ok (deadline fires later) or the normalized timeout
  let _ = h
    .executor
    .execute_dashboard(
      "s1",
      "m.dashboard.main",
      inputs(&[("region", json!("us-east-1"))]),
      &h.workspace,
      ConnectOptions::default(),
    )
    .await;

  wait_for_event(&mut sub, |e| {
    matches!(
      e,
      DashboardEvent::ExecutionError { error, .. } if error == "execution timed out"
    )
  })
  .await;
}

// --- S6: unknown session / property 6 ---

#[tokio::test]
async fn input_change_for_unknown_session_fails_without_events() {
  let h = harness(region_dashboard(), ExecutorConfig::default());
  let mut sub = h.workspace.subscribe();

  let err = h
    .executor
    .on_input_changed("nope", HashMap::new(), "x")
    .await
    .expect_err("must fail");

  assert!(matches!(err, ExecutorError::SessionNotFound { .. }));
  assert!(err.to_string().contains("nope"));
  tokio::time::sleep(Duration::from_millis(20)).await;
  assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn cancel_unknown_session_is_a_noop() {
  let h = harness(region_dashboard(), ExecutorConfig::default());
  let mut sub = h.workspace.subscribe();

  h.executor.cancel_execution_for_session("nope");

  tokio::time::sleep(Duration::from_millis(20)).await;
  assert!(sub.try_recv().is_none());
}

// --- property 4: event ordering ---

#[tokio::test]
async fn events_are_ordered_started_nodes_complete() {
  let h = harness(region_dashboard(), ExecutorConfig::default());
  let mut sub = h.workspace.subscribe();

  h.executor
    .execute_dashboard(
      "s1",
      "m.dashboard.main",
      inputs(&[("region", json!("us-east-1"))]),
      &h.workspace,
      ConnectOptions::default(),
    )
    .await
    .expect("execute");

  let mut events = Vec::new();
  loop {
    let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
      .await
      .expect("event stream stalled");
    let done = matches!(event, DashboardEvent::ExecutionComplete { .. });
    events.push(event);
    if done {
      break;
    }
  }

  assert!(matches!(events.first(), Some(DashboardEvent::ExecutionStarted { .. })));
  assert!(matches!(events.last(), Some(DashboardEvent::ExecutionComplete { .. })));
  for event in &events[1..events.len() - 1] {
    assert!(matches!(
      event,
      DashboardEvent::LeafNodeUpdated { .. }
        | DashboardEvent::LeafNodeComplete { .. }
        | DashboardEvent::LeafNodeError { .. }
    ));
  }
}

// --- property 5: cancellation progress ---

#[tokio::test]
async fn cancellation_drives_all_nodes_terminal() {
  let slow = Arc::new(MockClient::new(Some(Duration::from_millis(500)), None));
  let h = harness_with_client(region_dashboard(), ExecutorConfig::default(), slow);

  h.executor
    .execute_dashboard(
      "s1",
      "m.dashboard.main",
      inputs(&[("region", json!("us-east-1"))]),
      &h.workspace,
      ConnectOptions::default(),
    )
    .await
    .expect("execute");
  let tree = h.executor.get_execution("s1").expect("registered");

  h.executor.cancel_execution_for_session("s1");
  assert!(h.executor.get_execution("s1").is_none());

  tokio::time::timeout(Duration::from_secs(2), async {
    loop {
      if tree.run_status() == RunStatus::Cancelled {
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .expect("execution did not reach cancelled status");

  for id in tree.node_ids() {
    assert!(tree.node_state(&id).is_some_and(|s| s.is_terminal()));
  }
}

// --- error halts the remainder of the tree ---

#[tokio::test]
async fn node_error_halts_execution_and_cancels_the_rest() {
  let failing = Arc::new(MockClient::new(
    None,
    Some("select * from broken".to_string()),
  ));
  let mut root = item("m.dashboard.main", ItemKind::Dashboard);
  let mut bad = item("m.query.bad", ItemKind::Query);
  bad.sql = Some("select * from broken".to_string());
  root.children.push(bad);
  let mut dependent = item("m.chart.downstream", ItemKind::Chart);
  dependent.sql = Some("select * from fine".to_string());
  dependent.depends_on = vec![DependencySource::Item("m.query.bad".to_string())];
  root.children.push(dependent);

  let h = harness_with_client(root, ExecutorConfig::default(), failing);
  let mut sub = h.workspace.subscribe();

  h.executor
    .execute_dashboard(
      "s1",
      "m.dashboard.main",
      HashMap::new(),
      &h.workspace,
      ConnectOptions::default(),
    )
    .await
    .expect("execute");

  wait_for_event(&mut sub, |e| {
    matches!(
      e,
      DashboardEvent::LeafNodeError { node_id, .. } if node_id == "main.query.bad"
    )
  })
  .await;
  wait_for_event(&mut sub, |e| matches!(e, DashboardEvent::ExecutionError { .. })).await;

  let tree = h.executor.get_execution("s1").expect("registered");
  assert_eq!(tree.run_status(), RunStatus::Error);
  assert_eq!(
    tree.node_state("main.chart.downstream"),
    Some(NodeState::Cancelled)
  );
  // the failing query ran; the dependent chart never did
  assert_eq!(h.client.recorded_queries().len(), 1);
}

// --- snapshots ---

#[tokio::test]
async fn load_snapshot_returns_the_deserialized_map() {
  let dir = tempfile::tempdir().expect("tempdir");
  let snapshot_path = dir.path().join("latest.json");
  std::fs::write(
    &snapshot_path,
    r#"{"schema_version": "1", "panels": {"p1": {"status": "complete"}}}"#,
  )
  .expect("write snapshot");

  let mut snapshots = HashMap::new();
  snapshots.insert("latest".to_string(), snapshot_path);
  let mod_def = ModDef {
    name: "m".to_string(),
    dashboards: vec![region_dashboard()],
    snapshots,
  };
  let workspace = Workspace::new(mod_def, dir.path()).expect("workspace");
  let pool = Arc::new(ClientPool::new(
    Arc::new(MockFactory {
      client: Arc::new(MockClient::new(None, None)),
    }),
    "sqlite::memory:",
  ));
  let executor = DashboardExecutor::new(pool);

  let snapshot = executor
    .load_snapshot("s1", "latest", &workspace)
    .await
    .expect("load");
  assert_eq!(snapshot["schema_version"], json!("1"));
  assert_eq!(snapshot["panels"]["p1"]["status"], json!("complete"));

  let err = executor
    .load_snapshot("s1", "missing", &workspace)
    .await
    .expect_err("unknown snapshot");
  assert!(matches!(err, ExecutorError::SnapshotNotFound { .. }));
}

#[tokio::test]
async fn load_snapshot_missing_file_is_reported() {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut snapshots = HashMap::new();
  snapshots.insert("gone".to_string(), dir.path().join("gone.json"));
  let mod_def = ModDef {
    name: "m".to_string(),
    dashboards: vec![],
    snapshots,
  };
  let workspace = Workspace::new(mod_def, dir.path()).expect("workspace");
  let pool = Arc::new(ClientPool::new(
    Arc::new(MockFactory {
      client: Arc::new(MockClient::new(None, None)),
    }),
    "sqlite::memory:",
  ));
  let executor = DashboardExecutor::new(pool);

  let err = executor
    .load_snapshot("s1", "gone", &workspace)
    .await
    .expect_err("missing file");
  assert!(matches!(err, ExecutorError::SnapshotMissing { .. }));
  assert!(err.to_string().contains("does not exist"));
}
