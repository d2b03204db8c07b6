use crate::error::EngineResult;
use crate::events::{FileUpdateEvent, GeneralSystemEvent};
use crate::handlers::{Coordinator, ExecuteToolRequest};
use crate::jwt::{InternalJwtManager, TokenRequest};
use crate::storage::ValidateFileAccessRequest;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

// ─── Subscription model ───────────────────────────────────────

/// A stored trigger: when a matching system event arrives, execute the
/// referenced tool definition as the subscription's owner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneralSubscription {
    pub subscription_id: String,
    pub event_type: String,
    /// Path to the tool definition to execute.
    pub tool_definition: String,
    pub process_owner: String,
    pub execution_working_directory: String,
    /// Exact-match conditions against the event details.
    #[serde(default)]
    pub filter_conditions: Map<String, Value>,
    #[serde(default)]
    pub single_use: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<DateTime<Utc>>,
}

impl GeneralSubscription {
    pub fn new(
        event_type: &str,
        tool_definition: &str,
        process_owner: &str,
        execution_working_directory: &str,
    ) -> Self {
        Self {
            subscription_id: Uuid::now_v7().to_string(),
            event_type: event_type.to_string(),
            tool_definition: tool_definition.to_string(),
            process_owner: process_owner.to_string(),
            execution_working_directory: execution_working_directory.to_string(),
            filter_conditions: Map::new(),
            single_use: false,
            last_execution: None,
        }
    }
}

#[async_trait]
pub trait SubscriptionTable: Send + Sync {
    async fn get_by_event_type(&self, event_type: &str) -> Result<Vec<GeneralSubscription>>;
    async fn put(&self, subscription: &GeneralSubscription) -> Result<()>;
    async fn delete(&self, subscription_id: &str) -> Result<()>;
}

/// A trigger on a file path (or a whole directory): when the content
/// store reports a matching create/update/delete, execute the tool as
/// the subscription's owner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilesystemSubscription {
    pub subscription_id: String,
    /// The watched file or directory path.
    pub file_path: String,
    /// `created`, `updated`, or `deleted`.
    pub file_event_type: String,
    /// When set, only files of this type fire the subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    pub tool_definition: String,
    pub process_owner: String,
    pub execution_working_directory: String,
    #[serde(default)]
    pub single_use: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<DateTime<Utc>>,
}

impl FilesystemSubscription {
    pub fn new(
        file_path: &str,
        file_event_type: &str,
        tool_definition: &str,
        process_owner: &str,
        execution_working_directory: &str,
    ) -> Self {
        Self {
            subscription_id: Uuid::now_v7().to_string(),
            file_path: file_path.to_string(),
            file_event_type: file_event_type.to_string(),
            file_type: None,
            tool_definition: tool_definition.to_string(),
            process_owner: process_owner.to_string(),
            execution_working_directory: execution_working_directory.to_string(),
            single_use: false,
            last_execution: None,
        }
    }
}

#[async_trait]
pub trait FilesystemSubscriptionTable: Send + Sync {
    /// Subscriptions watching exactly this path.
    async fn get_by_path(&self, file_path: &str) -> Result<Vec<FilesystemSubscription>>;
    async fn put(&self, subscription: &FilesystemSubscription) -> Result<()>;
    async fn delete(&self, subscription_id: &str) -> Result<()>;
}

/// In-memory implementation of [`FilesystemSubscriptionTable`].
pub struct MemoryFilesystemSubscriptionTable {
    inner: RwLock<HashMap<String, FilesystemSubscription>>,
}

impl MemoryFilesystemSubscriptionTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryFilesystemSubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FilesystemSubscriptionTable for MemoryFilesystemSubscriptionTable {
    async fn get_by_path(&self, file_path: &str) -> Result<Vec<FilesystemSubscription>> {
        let r = self.inner.read().await;
        let mut matching: Vec<FilesystemSubscription> = r
            .values()
            .filter(|subscription| subscription.file_path == file_path)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));
        Ok(matching)
    }

    async fn put(&self, subscription: &FilesystemSubscription) -> Result<()> {
        let mut w = self.inner.write().await;
        w.insert(subscription.subscription_id.clone(), subscription.clone());
        Ok(())
    }

    async fn delete(&self, subscription_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.remove(subscription_id);
        Ok(())
    }
}

/// In-memory implementation of [`SubscriptionTable`] for POC/testing.
pub struct MemorySubscriptionTable {
    inner: RwLock<HashMap<String, GeneralSubscription>>,
}

impl MemorySubscriptionTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemorySubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionTable for MemorySubscriptionTable {
    async fn get_by_event_type(&self, event_type: &str) -> Result<Vec<GeneralSubscription>> {
        let r = self.inner.read().await;
        let mut matching: Vec<GeneralSubscription> = r
            .values()
            .filter(|subscription| subscription.event_type == event_type)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));
        Ok(matching)
    }

    async fn put(&self, subscription: &GeneralSubscription) -> Result<()> {
        let mut w = self.inner.write().await;
        w.insert(subscription.subscription_id.clone(), subscription.clone());
        Ok(())
    }

    async fn delete(&self, subscription_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.remove(subscription_id);
        Ok(())
    }
}

// ─── Dispatcher ───────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct SubscriptionDispatcherConfig {
    pub recursion_detection_enabled: bool,
    /// A subscription that fired within this window is suppressed.
    pub recursion_detection_threshold: Duration,
    /// Expiry on the tokens minted for subscription owners.
    pub owner_token_expiry_minutes: i64,
}

impl Default for SubscriptionDispatcherConfig {
    fn default() -> Self {
        Self {
            recursion_detection_enabled: true,
            recursion_detection_threshold: Duration::seconds(60),
            owner_token_expiry_minutes: 15,
        }
    }
}

/// Matches system and file events against subscriptions and fires an
/// execute-tool request per match, as the subscription owner.
pub struct SubscriptionDispatcher {
    table: Arc<dyn SubscriptionTable>,
    fs_table: Arc<dyn FilesystemSubscriptionTable>,
    coordinator: Arc<Coordinator>,
    jwt: Arc<InternalJwtManager>,
    config: SubscriptionDispatcherConfig,
}

impl SubscriptionDispatcher {
    pub fn new(
        table: Arc<dyn SubscriptionTable>,
        fs_table: Arc<dyn FilesystemSubscriptionTable>,
        coordinator: Arc<Coordinator>,
        jwt: Arc<InternalJwtManager>,
        config: SubscriptionDispatcherConfig,
    ) -> Self {
        Self {
            table,
            fs_table,
            coordinator,
            jwt,
            config,
        }
    }

    fn matches_filter(event_details: &Map<String, Value>, filter: &Map<String, Value>) -> bool {
        filter
            .iter()
            .all(|(key, expected)| event_details.get(key) == Some(expected))
    }

    fn owner_token(&self, entity: &str) -> EngineResult<String> {
        let (token, _) = self.jwt.create_token_with_expiry(
            TokenRequest {
                entity: entity.to_string(),
                authorized_groups: vec!["system".to_string()],
                primary_group: "system".to_string(),
                home: None,
                is_admin: false,
                custom_claims: Map::new(),
            },
            self.config.owner_token_expiry_minutes,
        )?;
        Ok(token)
    }

    /// Handle one general system event: fire every matching
    /// subscription that passes its filter, recursion, and access
    /// checks. Firings that fail are reported and skipped; one bad
    /// subscription never blocks the rest.
    pub async fn handle_general_event(&self, event: GeneralSystemEvent) -> Result<Vec<String>> {
        let subscriptions = self.table.get_by_event_type(&event.system_event_type).await?;
        if subscriptions.is_empty() {
            tracing::debug!(event_type = %event.system_event_type, "no subscriptions for event type");
            return Ok(Vec::new());
        }

        let mut fired = Vec::new();

        for mut subscription in subscriptions {
            if !subscription.filter_conditions.is_empty()
                && !Self::matches_filter(&event.event_details, &subscription.filter_conditions)
            {
                tracing::debug!(
                    subscription_id = %subscription.subscription_id,
                    "event does not match filter conditions"
                );
                continue;
            }

            if self.config.recursion_detection_enabled {
                if let Some(last_execution) = subscription.last_execution {
                    let threshold = Utc::now() - self.config.recursion_detection_threshold;
                    if last_execution > threshold {
                        tracing::warn!(
                            subscription_id = %subscription.subscription_id,
                            event_type = %subscription.event_type,
                            "possible recursion detected, suppressing subscription firing"
                        );
                        continue;
                    }
                }
            }

            let token = match self.owner_token(&subscription.process_owner) {
                Ok(token) => token,
                Err(err) => {
                    tracing::warn!(
                        subscription_id = %subscription.subscription_id,
                        error = %err,
                        "failed to mint owner token"
                    );
                    continue;
                }
            };

            // The owner must be able to execute the definition.
            let access = self
                .coordinator
                .storage
                .validate_file_access(
                    &token,
                    ValidateFileAccessRequest {
                        file_path: subscription.tool_definition.clone(),
                        requested_permission_names: vec!["execute".to_string()],
                    },
                )
                .await?;

            if access.status_code == 404 {
                tracing::warn!(
                    subscription_id = %subscription.subscription_id,
                    path = %subscription.tool_definition,
                    "tool definition for subscription not found"
                );
                continue;
            }
            let entity_has_access = access
                .body
                .get("entity_has_access")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !entity_has_access {
                tracing::warn!(
                    subscription_id = %subscription.subscription_id,
                    owner = %subscription.process_owner,
                    "subscription owner lacks execute access to tool definition"
                );
                continue;
            }

            let mut arguments = Map::new();
            arguments.insert("event_type".to_string(), json!(event.system_event_type));
            arguments.insert(
                "event_details".to_string(),
                Value::Object(event.event_details.clone()),
            );
            arguments.insert(
                "source_system".to_string(),
                event
                    .source_system
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            );

            let request = ExecuteToolRequest {
                tool_definition: None,
                tool_definition_path: Some(subscription.tool_definition.clone()),
                arguments,
                working_directory: Some(subscription.execution_working_directory.clone()),
            };

            match self.coordinator.execute_tool(request, &token).await {
                Ok(process_id) => {
                    tracing::debug!(
                        subscription_id = %subscription.subscription_id,
                        process_id = %process_id,
                        "subscription fired"
                    );

                    if subscription.single_use {
                        self.table.delete(&subscription.subscription_id).await?;
                    } else {
                        subscription.last_execution = Some(Utc::now());
                        self.table.put(&subscription).await?;
                    }

                    fired.push(process_id);
                }
                Err(err) => {
                    tracing::warn!(
                        subscription_id = %subscription.subscription_id,
                        error = %err,
                        "subscription tool execution failed"
                    );
                    continue;
                }
            }
        }

        Ok(fired)
    }
}

impl SubscriptionDispatcher {
    /// Handle one file event: subscriptions on the file itself and on
    /// its parent directory both fire, subject to the same
    /// filter/recursion/access checks as general subscriptions.
    pub async fn handle_file_event(&self, event: FileUpdateEvent) -> Result<Vec<String>> {
        let mut subscriptions = self.fs_table.get_by_path(&event.file_path).await?;
        let parent_dir = crate::storage::parent_directory(&event.file_path);
        if !parent_dir.is_empty() {
            subscriptions.extend(self.fs_table.get_by_path(&parent_dir).await?);
        }

        if subscriptions.is_empty() {
            tracing::debug!(file_path = %event.file_path, "no filesystem subscriptions for path");
            return Ok(Vec::new());
        }

        let mut fired = Vec::new();

        for mut subscription in subscriptions {
            if let Some(wanted_type) = &subscription.file_type {
                if event.file_type.as_deref() != Some(wanted_type.as_str()) {
                    tracing::debug!(
                        subscription_id = %subscription.subscription_id,
                        "file type does not match subscription"
                    );
                    continue;
                }
            }

            if subscription.file_event_type != event.file_event_type {
                tracing::debug!(
                    subscription_id = %subscription.subscription_id,
                    "file event type does not match subscription"
                );
                continue;
            }

            if self.config.recursion_detection_enabled {
                if let Some(last_execution) = subscription.last_execution {
                    let threshold = Utc::now() - self.config.recursion_detection_threshold;
                    if last_execution > threshold {
                        tracing::warn!(
                            subscription_id = %subscription.subscription_id,
                            file_path = %subscription.file_path,
                            "possible recursion detected, suppressing subscription firing"
                        );
                        continue;
                    }
                }
            }

            let token = match self.owner_token(&subscription.process_owner) {
                Ok(token) => token,
                Err(err) => {
                    tracing::warn!(
                        subscription_id = %subscription.subscription_id,
                        error = %err,
                        "failed to mint owner token"
                    );
                    continue;
                }
            };

            let access = self
                .coordinator
                .storage
                .validate_file_access(
                    &token,
                    ValidateFileAccessRequest {
                        file_path: subscription.tool_definition.clone(),
                        requested_permission_names: vec!["execute".to_string()],
                    },
                )
                .await?;

            let entity_has_access = access
                .body
                .get("entity_has_access")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if access.status_code == 404 || !entity_has_access {
                tracing::warn!(
                    subscription_id = %subscription.subscription_id,
                    path = %subscription.tool_definition,
                    "tool definition missing or owner lacks execute access"
                );
                continue;
            }

            let mut arguments = Map::new();
            arguments.insert("file_path".to_string(), json!(event.file_path));
            arguments.insert("file_event_type".to_string(), json!(event.file_event_type));
            arguments.insert(
                "event_details".to_string(),
                Value::Object(event.details.clone()),
            );

            let request = ExecuteToolRequest {
                tool_definition: None,
                tool_definition_path: Some(subscription.tool_definition.clone()),
                arguments,
                working_directory: Some(subscription.execution_working_directory.clone()),
            };

            match self.coordinator.execute_tool(request, &token).await {
                Ok(process_id) => {
                    tracing::debug!(
                        subscription_id = %subscription.subscription_id,
                        process_id = %process_id,
                        "filesystem subscription fired"
                    );

                    if subscription.single_use {
                        self.fs_table.delete(&subscription.subscription_id).await?;
                    } else {
                        subscription.last_execution = Some(Utc::now());
                        self.fs_table.put(&subscription).await?;
                    }

                    fired.push(process_id);
                }
                Err(err) => {
                    tracing::warn!(
                        subscription_id = %subscription.subscription_id,
                        error = %err,
                        "subscription tool execution failed"
                    );
                    continue;
                }
            }
        }

        Ok(fired)
    }
}
