//! Integration tests: drive complete composite executions through the
//! coordinator over in-memory collaborators. A dispatcher task drains
//! the local bus exactly like the worker binary, and registered leaf
//! behaviors stand in for external tool runtimes: they read the staged
//! arguments, write `response.aio`, and publish `ratio::tool_response`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ratio_core::bus::{Event, EventBus};
use ratio_core::bus_local::LocalEventBus;
use ratio_core::engine::exec_path_for;
use ratio_core::events::{
    SystemExecuteToolRequest, SystemExecuteToolResponse, EXECUTE_COMPOSITE_TOOL,
    PARALLEL_COMPLETION_RECONCILIATION, TOOL_RESPONSE,
};
use ratio_core::jwt::{InternalJwtManager, LocalKeySigner, TokenRequest};
use ratio_core::process_table::ProcessTable;
use ratio_core::process_table_memory::MemoryProcessTable;
use ratio_core::storage::StorageClient;
use ratio_core::storage_memory::MemoryStorage;
use ratio_core::types::{Process, ProcessStatus};
use ratio_core::{Coordinator, CoordinatorConfig, ExecuteToolRequest, Reconciler, ReconcilerConfig};
use serde_json::{json, Map, Value};

type LeafBehavior =
    Box<dyn Fn(Map<String, Value>) -> Result<Map<String, Value>, String> + Send + Sync>;

struct Harness {
    storage: Arc<MemoryStorage>,
    processes: Arc<MemoryProcessTable>,
    bus: Arc<dyn EventBus>,
    jwt: Arc<InternalJwtManager>,
    coordinator: Arc<Coordinator>,
    caller_token: String,
    /// Endpoint → argument bodies each leaf invocation received.
    received: Arc<Mutex<HashMap<String, Vec<Map<String, Value>>>>>,
}

impl Harness {
    async fn start(leaf_tools: HashMap<&'static str, LeafBehavior>) -> Harness {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_directory("/work").await;

        let processes = Arc::new(MemoryProcessTable::new());
        let jwt = Arc::new(InternalJwtManager::new(
            Arc::new(LocalKeySigner::new("test-key", b"secret".to_vec())),
            30,
        ));

        let (bus, mut rx) = LocalEventBus::channel();
        let bus: Arc<dyn EventBus> = Arc::new(bus);

        let coordinator = Arc::new(Coordinator::new(
            storage.clone() as Arc<dyn StorageClient>,
            processes.clone() as Arc<dyn ProcessTable>,
            bus.clone(),
            jwt.clone(),
            CoordinatorConfig {
                default_working_directory: None,
                reconciliation_delay: Duration::from_millis(200),
                noop_response_delay: Duration::from_millis(50),
            },
        ));

        let (caller_token, _) = jwt
            .create_token(TokenRequest {
                entity: "ada".to_string(),
                authorized_groups: vec!["engineers".to_string()],
                primary_group: "engineers".to_string(),
                home: Some("/work".to_string()),
                is_admin: false,
                custom_claims: Map::new(),
            })
            .unwrap();

        let received: Arc<Mutex<HashMap<String, Vec<Map<String, Value>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        {
            let coordinator = coordinator.clone();
            let storage = storage.clone();
            let bus = bus.clone();
            let received = received.clone();
            let leaf_tools = Arc::new(leaf_tools);

            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let outcome = dispatch(
                        &coordinator,
                        &storage,
                        &bus,
                        &received,
                        &leaf_tools,
                        event,
                    )
                    .await;
                    if let Err(err) = outcome {
                        eprintln!("handler error: {err}");
                    }
                }
            });
        }

        Harness {
            storage,
            processes,
            bus,
            jwt,
            coordinator,
            caller_token,
            received,
        }
    }

    async fn execute(&self, request: ExecuteToolRequest) -> String {
        self.coordinator
            .execute_tool(request, &self.caller_token)
            .await
            .unwrap()
    }

    /// Poll the process table until the process reaches a terminal
    /// status.
    async fn wait_for_terminal(&self, process_id: &str) -> Process {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(process) = self.processes.get_by_id(process_id).await.unwrap() {
                if process.execution_status.is_terminal() {
                    return process;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "process {process_id} did not finish in time"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn received_by(&self, endpoint: &str) -> Vec<Map<String, Value>> {
        self.received
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }

    async fn child_by_execution_id(&self, parent_id: &str, execution_id: &str) -> Option<Process> {
        self.processes
            .get_by_parent(parent_id)
            .await
            .unwrap()
            .into_iter()
            .find(|child| child.execution_id.as_deref() == Some(execution_id))
    }
}

async fn dispatch(
    coordinator: &Arc<Coordinator>,
    storage: &Arc<MemoryStorage>,
    bus: &Arc<dyn EventBus>,
    received: &Arc<Mutex<HashMap<String, Vec<Map<String, Value>>>>>,
    leaf_tools: &Arc<HashMap<&'static str, LeafBehavior>>,
    event: Event,
) -> anyhow::Result<()> {
    match event.event_type.as_str() {
        EXECUTE_COMPOSITE_TOOL => {
            coordinator.handle_execute_composite(event.body_as()?).await?;
        }
        TOOL_RESPONSE => {
            coordinator.handle_tool_response(event.body_as()?).await?;
        }
        PARALLEL_COMPLETION_RECONCILIATION => {
            coordinator
                .handle_parallel_reconciliation(event.body_as()?)
                .await?;
        }
        endpoint => {
            let Some(behavior) = leaf_tools.get(endpoint) else {
                return Ok(());
            };

            let request: SystemExecuteToolRequest = event.body_as()?;
            let arguments: Map<String, Value> = match &request.arguments_path {
                Some(path) => serde_json::from_str(
                    &storage
                        .latest_data(path)
                        .await
                        .ok_or_else(|| anyhow::anyhow!("arguments file {path} missing"))?,
                )?,
                None => Map::new(),
            };

            received
                .lock()
                .unwrap()
                .entry(endpoint.to_string())
                .or_default()
                .push(arguments.clone());

            match behavior(arguments) {
                Ok(body) => {
                    let child_dir =
                        exec_path_for(&request.working_directory, &request.process_id);
                    let response_path = format!("{child_dir}/response.aio");
                    storage
                        .seed_file(
                            &response_path,
                            "ratio::agent_io",
                            &serde_json::to_string(&Value::Object(body))?,
                        )
                        .await;

                    bus.publish(
                        Event::new(
                            TOOL_RESPONSE,
                            &SystemExecuteToolResponse {
                                failure: None,
                                parent_process_id: request.parent_process_id,
                                process_id: request.process_id,
                                response: Some(response_path),
                                status: "success".to_string(),
                                token: request.token,
                            },
                        )?,
                        None,
                    )
                    .await?;
                }
                Err(message) => {
                    bus.publish(
                        Event::new(
                            TOOL_RESPONSE,
                            &SystemExecuteToolResponse {
                                failure: Some(message),
                                parent_process_id: request.parent_process_id,
                                process_id: request.process_id,
                                response: None,
                                status: "failure".to_string(),
                                token: request.token,
                            },
                        )?,
                        None,
                    )
                    .await?;
                }
            }
        }
    }
    Ok(())
}

fn leaf(endpoint: &str, arguments: Value, responses: Value) -> Value {
    json!({
        "system_event_endpoint": endpoint,
        "arguments": arguments,
        "responses": responses
    })
}

fn request(definition: Value, arguments: Value) -> ExecuteToolRequest {
    serde_json::from_value(json!({
        "tool_definition": definition,
        "arguments": arguments,
        "working_directory": "/work"
    }))
    .unwrap()
}

/// Two-step pipeline: `a` produces a string, `b` consumes it by
/// reference. No composite response definition, so no response file.
#[tokio::test]
async fn test_linear_pipeline() {
    let mut tools: HashMap<&'static str, LeafBehavior> = HashMap::new();
    tools.insert(
        "ratio::tool_a",
        Box::new(|_| Ok(serde_json::from_value(json!({"out": "hello"})).unwrap())),
    );
    tools.insert("ratio::tool_b", Box::new(|_| Ok(Map::new())));

    let harness = Harness::start(tools).await;

    let process_id = harness
        .execute(request(
            json!({
                "instructions": [
                    {
                        "execution_id": "a",
                        "tool_definition": leaf(
                            "ratio::tool_a",
                            json!([]),
                            json!([{"name": "out", "type_name": "string"}])
                        )
                    },
                    {
                        "execution_id": "b",
                        "tool_definition": leaf(
                            "ratio::tool_b",
                            json!([{"name": "in", "type_name": "string"}]),
                            json!([])
                        ),
                        "arguments": {"in": "REF:a.out"}
                    }
                ]
            }),
            json!({}),
        ))
        .await;

    let root = harness.wait_for_terminal(&process_id).await;
    assert_eq!(root.execution_status, ProcessStatus::Completed);
    assert!(root.response_path.is_none());

    // b received a's output by reference.
    let deliveries = harness.received_by("ratio::tool_b");
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0]["in"], json!("hello"));

    // No composite response file was written.
    assert!(
        !harness
            .storage
            .file_exists(&format!("/work/agent_exec-{process_id}/response.aio"))
            .await
    );

    // Both children completed.
    for execution_id in ["a", "b"] {
        let child = harness
            .child_by_execution_id(&process_id, execution_id)
            .await
            .unwrap();
        assert_eq!(child.execution_status, ProcessStatus::Completed);
    }
}

/// The composite's response reference map assembles the root response
/// file from a child's output.
#[tokio::test]
async fn test_composite_response_assembly() {
    let mut tools: HashMap<&'static str, LeafBehavior> = HashMap::new();
    tools.insert(
        "ratio::tool_a",
        Box::new(|_| Ok(serde_json::from_value(json!({"out": "world"})).unwrap())),
    );

    let harness = Harness::start(tools).await;

    let process_id = harness
        .execute(request(
            json!({
                "instructions": [
                    {
                        "execution_id": "a",
                        "tool_definition": leaf(
                            "ratio::tool_a",
                            json!([]),
                            json!([{"name": "out", "type_name": "string"}])
                        )
                    }
                ],
                "responses": [{"name": "msg", "type_name": "string", "required": true}],
                "response_reference_map": {"msg": "REF:a.out"}
            }),
            json!({}),
        ))
        .await;

    let root = harness.wait_for_terminal(&process_id).await;
    assert_eq!(root.execution_status, ProcessStatus::Completed);

    let response_path = root.response_path.unwrap();
    assert_eq!(
        response_path,
        format!("/work/agent_exec-{process_id}/response.aio")
    );
    let body: Value =
        serde_json::from_str(&harness.storage.latest_data(&response_path).await.unwrap()).unwrap();
    assert_eq!(body, json!({"msg": "world"}));
}

/// A false condition skips the instruction; downstream references to the
/// skipped node resolve to the type's null value.
#[tokio::test]
async fn test_conditional_skip_with_downstream() {
    let mut tools: HashMap<&'static str, LeafBehavior> = HashMap::new();
    tools.insert(
        "ratio::tool_a",
        Box::new(|_| Ok(serde_json::from_value(json!({"n": 0})).unwrap())),
    );
    tools.insert("ratio::tool_b", Box::new(|_| panic!("b must not run")));
    tools.insert("ratio::tool_c", Box::new(|_| Ok(Map::new())));

    let harness = Harness::start(tools).await;

    let process_id = harness
        .execute(request(
            json!({
                "instructions": [
                    {
                        "execution_id": "a",
                        "tool_definition": leaf(
                            "ratio::tool_a",
                            json!([]),
                            json!([{"name": "n", "type_name": "number"}])
                        )
                    },
                    {
                        "execution_id": "b",
                        "tool_definition": leaf(
                            "ratio::tool_b",
                            json!([]),
                            json!([{"name": "x", "type_name": "string"}])
                        ),
                        "conditions": [
                            {"param": "REF:a.n", "operator": "greater_than", "value": 0}
                        ],
                        "dependencies": ["a"]
                    },
                    {
                        "execution_id": "c",
                        "tool_definition": leaf(
                            "ratio::tool_c",
                            json!([{"name": "v", "type_name": "string"}]),
                            json!([])
                        ),
                        "arguments": {"v": "REF:b.x"}
                    }
                ]
            }),
            json!({}),
        ))
        .await;

    let root = harness.wait_for_terminal(&process_id).await;
    assert_eq!(root.execution_status, ProcessStatus::Completed);

    let skipped = harness
        .child_by_execution_id(&process_id, "b")
        .await
        .unwrap();
    assert_eq!(skipped.execution_status, ProcessStatus::Skipped);

    // b's synthetic response carries a null for its declared field.
    let synthetic: Value = serde_json::from_str(
        &harness
            .storage
            .latest_data(&skipped.response_path.unwrap())
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(synthetic, json!({"x": null}));

    // c observed the null through its reference.
    let deliveries = harness.received_by("ratio::tool_c");
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0]["v"], Value::Null);

    assert!(harness.received_by("ratio::tool_b").is_empty());
}

/// Parallel fan-out over an argument list: siblings run per element and
/// the aggregate preserves index order.
#[tokio::test]
async fn test_parallel_fan_out() {
    let mut tools: HashMap<&'static str, LeafBehavior> = HashMap::new();
    tools.insert(
        "ratio::tool_f",
        Box::new(|arguments| {
            let item = arguments["item"].as_str().unwrap_or_default();
            Ok(serde_json::from_value(json!({"out": format!("{item}!")})).unwrap())
        }),
    );
    tools.insert("ratio::collector", Box::new(|_| Ok(Map::new())));

    let harness = Harness::start(tools).await;

    let process_id = harness
        .execute(request(
            json!({
                "arguments": [{"name": "items", "type_name": "list"}],
                "instructions": [
                    {
                        "execution_id": "f",
                        "tool_definition": leaf(
                            "ratio::tool_f",
                            json!([{"name": "item", "type_name": "any"}]),
                            json!([{"name": "out", "type_name": "string"}])
                        ),
                        "parallel_execution": {
                            "iterate_over": "REF:arguments.items",
                            "item_argument": "item"
                        }
                    },
                    {
                        "execution_id": "g",
                        "tool_definition": leaf(
                            "ratio::collector",
                            json!([{"name": "all", "type_name": "list"}]),
                            json!([])
                        ),
                        "arguments": {"all": "REF:f.response"}
                    }
                ]
            }),
            json!({"items": ["p", "q", "r"]}),
        ))
        .await;

    let root = harness.wait_for_terminal(&process_id).await;
    assert_eq!(root.execution_status, ProcessStatus::Completed);

    // All three siblings completed under their synthetic ids.
    for index in 0..3 {
        let sibling = harness
            .child_by_execution_id(&process_id, &format!("f[{index}]"))
            .await
            .unwrap();
        assert_eq!(sibling.execution_status, ProcessStatus::Completed);
    }

    // The collector saw the ordered aggregate.
    let deliveries = harness.received_by("ratio::collector");
    assert_eq!(deliveries.len(), 1);
    assert_eq!(
        deliveries[0]["all"],
        json!([{"out": "p!"}, {"out": "q!"}, {"out": "r!"}])
    );
}

/// One failed sibling fails the whole group and the root with it; late
/// sibling responses are observed and discarded.
#[tokio::test]
async fn test_parallel_failure() {
    let mut tools: HashMap<&'static str, LeafBehavior> = HashMap::new();
    tools.insert(
        "ratio::tool_f",
        Box::new(|arguments| {
            let item = arguments["item"].as_str().unwrap_or_default();
            if item == "q" {
                Err("boom".to_string())
            } else {
                Ok(serde_json::from_value(json!({"out": format!("{item}!")})).unwrap())
            }
        }),
    );

    let harness = Harness::start(tools).await;

    let process_id = harness
        .execute(request(
            json!({
                "arguments": [{"name": "items", "type_name": "list"}],
                "instructions": [
                    {
                        "execution_id": "f",
                        "tool_definition": leaf(
                            "ratio::tool_f",
                            json!([{"name": "item", "type_name": "any"}]),
                            json!([{"name": "out", "type_name": "string"}])
                        ),
                        "parallel_execution": {
                            "iterate_over": "REF:arguments.items",
                            "item_argument": "item"
                        }
                    }
                ]
            }),
            json!({"items": ["p", "q", "r"]}),
        ))
        .await;

    let root = harness.wait_for_terminal(&process_id).await;
    assert_eq!(root.execution_status, ProcessStatus::Failed);
    assert!(root.status_message.unwrap().contains("boom"));

    // The surviving siblings' late responses did not resurrect the root.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let after = harness
        .processes
        .get_by_id(&process_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.execution_status, ProcessStatus::Failed);
}

/// The reconciliation sweep times out an ancient RUNNING process and the
/// resulting failure event closes its parent.
#[tokio::test]
async fn test_timeout_sweep() {
    let harness = Harness::start(HashMap::new()).await;

    let parent = Process::new("ada", "/work");
    harness.processes.put(&parent).await.unwrap();

    let mut child = parent.create_child("slow_leaf", "ada", "/work", ProcessStatus::Running);
    child.started_on = chrono::Utc::now() - chrono::Duration::minutes(16);
    harness.processes.put(&child).await.unwrap();

    let reconciler = Reconciler::new(
        harness.processes.clone() as Arc<dyn ProcessTable>,
        harness.bus.clone(),
        harness.jwt.clone(),
        ReconcilerConfig::default(),
    );
    let summary = reconciler.run_sweep().await.unwrap();
    assert_eq!(summary.timed_out, vec![child.process_id.clone()]);

    let timed_out = harness
        .processes
        .get_by_id(&child.process_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(timed_out.execution_status, ProcessStatus::TimedOut);

    let parent_after = harness.wait_for_terminal(&parent.process_id).await;
    assert_eq!(parent_after.execution_status, ProcessStatus::Failed);
    assert!(parent_after
        .status_message
        .unwrap()
        .contains("process timed out after 15 minutes"));
}

/// An empty composite completes immediately with no response file.
#[tokio::test]
async fn test_empty_composite_completes_immediately() {
    let harness = Harness::start(HashMap::new()).await;

    let process_id = harness
        .execute(request(json!({"instructions": []}), json!({})))
        .await;

    let root = harness.wait_for_terminal(&process_id).await;
    assert_eq!(root.execution_status, ProcessStatus::Completed);
    assert!(root.response_path.is_none());
}

/// Bad submissions are rejected up front and leave no process behind.
#[tokio::test]
async fn test_invalid_submission_rejected() {
    let harness = Harness::start(HashMap::new()).await;

    // Missing required argument.
    let err = harness
        .coordinator
        .execute_tool(
            request(
                json!({
                    "arguments": [{"name": "needed", "type_name": "string", "required": true}],
                    "instructions": []
                }),
                json!({}),
            ),
            &harness.caller_token,
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    // Duplicate execution ids.
    let err = harness
        .coordinator
        .execute_tool(
            request(
                json!({
                    "instructions": [
                        {"execution_id": "a", "tool_definition": leaf("ratio::x", json!([]), json!([]))},
                        {"execution_id": "a", "tool_definition": leaf("ratio::x", json!([]), json!([]))}
                    ]
                }),
                json!({}),
            ),
            &harness.caller_token,
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    // Nothing survived either rejection.
    assert!(harness
        .processes
        .list_by_status(ProcessStatus::Running)
        .await
        .unwrap()
        .is_empty());
}

/// Denied working-directory access is a 403.
#[tokio::test]
async fn test_denied_working_directory() {
    let harness = Harness::start(HashMap::new()).await;
    harness.storage.deny("/work", "write").await;

    let err = harness
        .coordinator
        .execute_tool(
            request(json!({"instructions": []}), json!({})),
            &harness.caller_token,
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 403);
}

/// Nested composite: a composite instruction inside a composite runs as
/// its own child process and reports back to its parent.
#[tokio::test]
async fn test_nested_composite() {
    let mut tools: HashMap<&'static str, LeafBehavior> = HashMap::new();
    tools.insert(
        "ratio::inner_leaf",
        Box::new(|_| Ok(serde_json::from_value(json!({"out": "deep"})).unwrap())),
    );
    tools.insert("ratio::outer_leaf", Box::new(|_| Ok(Map::new())));

    let harness = Harness::start(tools).await;

    let inner_composite = json!({
        "instructions": [
            {
                "execution_id": "inner_step",
                "tool_definition": leaf(
                    "ratio::inner_leaf",
                    json!([]),
                    json!([{"name": "out", "type_name": "string"}])
                )
            }
        ],
        "responses": [{"name": "result", "type_name": "string", "required": true}],
        "response_reference_map": {"result": "REF:inner_step.out"}
    });

    let process_id = harness
        .execute(request(
            json!({
                "instructions": [
                    {
                        "execution_id": "nested",
                        "tool_definition": inner_composite
                    },
                    {
                        "execution_id": "after",
                        "tool_definition": leaf(
                            "ratio::outer_leaf",
                            json!([{"name": "text", "type_name": "string"}]),
                            json!([])
                        ),
                        "arguments": {"text": "REF:nested.result"}
                    }
                ]
            }),
            json!({}),
        ))
        .await;

    let root = harness.wait_for_terminal(&process_id).await;
    assert_eq!(root.execution_status, ProcessStatus::Completed);

    let nested = harness
        .child_by_execution_id(&process_id, "nested")
        .await
        .unwrap();
    assert_eq!(nested.execution_status, ProcessStatus::Completed);

    let deliveries = harness.received_by("ratio::outer_leaf");
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0]["text"], json!("deep"));
}

/// A matching system event fires a subscription's tool as its owner;
/// a second event inside the recursion window is suppressed.
#[tokio::test]
async fn test_subscription_fires_execution() {
    use ratio_core::events::GeneralSystemEvent;
    use ratio_core::subscriptions::{
        GeneralSubscription, MemoryFilesystemSubscriptionTable, MemorySubscriptionTable,
        SubscriptionDispatcher, SubscriptionDispatcherConfig, SubscriptionTable,
    };

    let mut tools: HashMap<&'static str, LeafBehavior> = HashMap::new();
    tools.insert("ratio::reindex", Box::new(|_| Ok(Map::new())));

    let harness = Harness::start(tools).await;

    // The watched tool definition lives in storage.
    let definition = leaf("ratio::reindex", json!([]), json!([]));
    harness
        .storage
        .seed_file(
            "/tools/reindex.tool",
            "ratio::tool",
            &serde_json::to_string(&definition).unwrap(),
        )
        .await;

    let table = Arc::new(MemorySubscriptionTable::new());
    let subscription = GeneralSubscription::new(
        "ratio::entity_created",
        "/tools/reindex.tool",
        "ada",
        "/work",
    );
    table.put(&subscription).await.unwrap();

    let dispatcher = SubscriptionDispatcher::new(
        table.clone(),
        Arc::new(MemoryFilesystemSubscriptionTable::new()),
        harness.coordinator.clone(),
        harness.jwt.clone(),
        SubscriptionDispatcherConfig::default(),
    );

    let event = GeneralSystemEvent {
        system_event_type: "ratio::entity_created".to_string(),
        event_details: serde_json::from_value(json!({"entity": "new-user"})).unwrap(),
        source_system: Some("auth".to_string()),
    };

    let fired = dispatcher.handle_general_event(event.clone()).await.unwrap();
    assert_eq!(fired.len(), 1);

    let root = harness.wait_for_terminal(&fired[0]).await;
    assert_eq!(root.execution_status, ProcessStatus::Completed);
    assert_eq!(root.process_owner, "ada");

    // Firing again immediately trips the recursion defense.
    let suppressed = dispatcher.handle_general_event(event).await.unwrap();
    assert!(suppressed.is_empty());
}

/// A file event fires subscriptions watching the parent directory.
#[tokio::test]
async fn test_file_event_fires_directory_subscription() {
    use ratio_core::events::FileUpdateEvent;
    use ratio_core::subscriptions::{
        FilesystemSubscription, FilesystemSubscriptionTable, MemoryFilesystemSubscriptionTable,
        MemorySubscriptionTable, SubscriptionDispatcher, SubscriptionDispatcherConfig,
    };

    let mut tools: HashMap<&'static str, LeafBehavior> = HashMap::new();
    tools.insert("ratio::ingest", Box::new(|_| Ok(Map::new())));

    let harness = Harness::start(tools).await;

    let definition = leaf("ratio::ingest", json!([]), json!([]));
    harness
        .storage
        .seed_file(
            "/tools/ingest.tool",
            "ratio::tool",
            &serde_json::to_string(&definition).unwrap(),
        )
        .await;

    let fs_table = Arc::new(MemoryFilesystemSubscriptionTable::new());
    let mut subscription = FilesystemSubscription::new(
        "/inbox",
        "created",
        "/tools/ingest.tool",
        "ada",
        "/work",
    );
    subscription.single_use = true;
    fs_table.put(&subscription).await.unwrap();

    let dispatcher = SubscriptionDispatcher::new(
        Arc::new(MemorySubscriptionTable::new()),
        fs_table.clone(),
        harness.coordinator.clone(),
        harness.jwt.clone(),
        SubscriptionDispatcherConfig::default(),
    );

    let fired = dispatcher
        .handle_file_event(FileUpdateEvent {
            file_path: "/inbox/report.csv".to_string(),
            file_type: Some("ratio::file".to_string()),
            file_event_type: "created".to_string(),
            details: Map::new(),
        })
        .await
        .unwrap();
    assert_eq!(fired.len(), 1);

    let root = harness.wait_for_terminal(&fired[0]).await;
    assert_eq!(root.execution_status, ProcessStatus::Completed);

    // Single-use subscriptions are consumed.
    assert!(fs_table.get_by_path("/inbox").await.unwrap().is_empty());

    // Mismatched event types do not fire.
    let none = dispatcher
        .handle_file_event(FileUpdateEvent {
            file_path: "/inbox/other.csv".to_string(),
            file_type: None,
            file_event_type: "deleted".to_string(),
            details: Map::new(),
        })
        .await
        .unwrap();
    assert!(none.is_empty());
}
