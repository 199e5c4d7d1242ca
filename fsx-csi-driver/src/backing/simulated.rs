//! In-process backing store with failure injection.
//!
//! Behaves like the managed service closely enough for conformance runs:
//! client tokens are honoured, new file systems report `CREATING` for a
//! configurable number of describe calls before turning `AVAILABLE`, and
//! rejected subnets or exhausted quota fail the create call.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BackingStore, CreateParams, FileSystem};
use crate::error::{Error, Result};
use crate::types::Lifecycle;

/// Tunables of the simulated store.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub region: String,
    /// Describe calls that still report `CREATING` before `AVAILABLE`.
    pub describes_until_available: u32,
    /// Subnets that make `create` fail with `InvalidSubnet`.
    pub rejected_subnets: BTreeSet<String>,
    /// Total capacity the account may hold.
    pub capacity_quota_gib: Option<u64>,
    /// Artificial latency of every call.
    pub latency: Duration,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            describes_until_available: 2,
            rejected_subnets: BTreeSet::new(),
            capacity_quota_gib: None,
            latency: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct Entry {
    fs: FileSystem,
    client_token: String,
    describes: u32,
}

#[derive(Debug, Default)]
struct State {
    file_systems: HashMap<String, Entry>,
    tokens: HashMap<String, String>,
    create_failures: VecDeque<Error>,
    describe_failures: VecDeque<Error>,
    delete_failures: VecDeque<Error>,
    provisioning_failure: Option<String>,
    never_available: bool,
}

/// Simulated managed file system service.
#[derive(Debug, Default)]
pub struct SimulatedBackingStore {
    config: SimulatedConfig,
    state: Mutex<State>,
    create_calls: AtomicUsize,
    describe_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl SimulatedBackingStore {
    pub fn new() -> Self {
        Self::with_config(SimulatedConfig::default())
    }

    pub fn with_config(config: SimulatedConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            create_calls: AtomicUsize::new(0),
            describe_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` create calls with `error`.
    pub async fn fail_next_creates(&self, count: usize, error: Error) {
        let mut state = self.state.lock().await;
        state
            .create_failures
            .extend(std::iter::repeat_n(error, count));
    }

    /// Fail the next `count` describe calls with `error`.
    pub async fn fail_next_describes(&self, count: usize, error: Error) {
        let mut state = self.state.lock().await;
        state
            .describe_failures
            .extend(std::iter::repeat_n(error, count));
    }

    /// Fail the next `count` delete calls with `error`.
    pub async fn fail_next_deletes(&self, count: usize, error: Error) {
        let mut state = self.state.lock().await;
        state
            .delete_failures
            .extend(std::iter::repeat_n(error, count));
    }

    /// File systems created from now on end up `FAILED` with `reason`.
    pub async fn fail_provisioning(&self, reason: impl Into<String>) {
        self.state.lock().await.provisioning_failure = Some(reason.into());
    }

    /// Keep every file system in `CREATING` forever.
    pub async fn set_never_available(&self, never: bool) {
        self.state.lock().await.never_available = never;
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub async fn contains(&self, resource_id: &str) -> bool {
        self.state
            .lock()
            .await
            .file_systems
            .contains_key(resource_id)
    }

    pub async fn file_system_count(&self) -> usize {
        self.state.lock().await.file_systems.len()
    }

    async fn simulate_latency(&self) {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
    }

    fn new_resource_id() -> (String, String) {
        let hex = Uuid::new_v4().simple().to_string();
        (format!("fs-{}", &hex[..17]), hex[17..25].to_string())
    }
}

#[async_trait]
impl BackingStore for SimulatedBackingStore {
    async fn create(&self, params: &CreateParams) -> Result<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        if let Some(error) = state.create_failures.pop_front() {
            debug!(token = %params.client_token, error = %error, "Injected create failure");
            return Err(error);
        }

        if let Some(existing) = state.tokens.get(&params.client_token) {
            debug!(token = %params.client_token, resource_id = %existing, "Client token reused");
            return Ok(existing.clone());
        }

        if self.config.rejected_subnets.contains(&params.subnet_id) {
            return Err(Error::terminal(
                "InvalidSubnet",
                format!("subnet '{}' does not exist", params.subnet_id),
            ));
        }
        if params.capacity_gib == 0 {
            return Err(Error::terminal(
                "InvalidParameter",
                "storage capacity must be positive",
            ));
        }

        if let Some(quota) = self.config.capacity_quota_gib {
            let used: u64 = state.file_systems.values().map(|e| e.fs.capacity_gib).sum();
            if used + params.capacity_gib > quota {
                return Err(Error::terminal(
                    "ServiceLimitExceeded",
                    format!(
                        "requested {} GiB with {} of {} GiB in use",
                        params.capacity_gib, used, quota
                    ),
                ));
            }
        }

        let (resource_id, mount_name) = Self::new_resource_id();
        let fs = FileSystem {
            resource_id: resource_id.clone(),
            lifecycle: Lifecycle::Creating,
            capacity_gib: params.capacity_gib,
            dns_name: format!(
                "{}.fsx.{}.amazonaws.com",
                resource_id, self.config.region
            ),
            mount_name,
            failure_reason: None,
        };

        state
            .tokens
            .insert(params.client_token.clone(), resource_id.clone());
        state.file_systems.insert(
            resource_id.clone(),
            Entry {
                fs,
                client_token: params.client_token.clone(),
                describes: 0,
            },
        );

        info!(
            resource_id = %resource_id,
            capacity_gib = params.capacity_gib,
            subnet_id = %params.subnet_id,
            "Simulated file system created"
        );
        Ok(resource_id)
    }

    async fn describe(&self, resource_id: &str) -> Result<FileSystem> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        if let Some(error) = state.describe_failures.pop_front() {
            return Err(error);
        }

        let provisioning_failure = state.provisioning_failure.clone();
        let never_available = state.never_available;
        let threshold = self.config.describes_until_available;

        let entry = state
            .file_systems
            .get_mut(resource_id)
            .ok_or_else(|| Error::NotFound(format!("file system '{}'", resource_id)))?;

        entry.describes += 1;
        if entry.fs.lifecycle == Lifecycle::Creating && entry.describes > threshold {
            if let Some(reason) = provisioning_failure {
                entry.fs.lifecycle = Lifecycle::Failed;
                entry.fs.failure_reason = Some(reason);
            } else if !never_available {
                entry.fs.lifecycle = Lifecycle::Available;
            }
        }

        Ok(entry.fs.clone())
    }

    async fn delete(&self, resource_id: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        if let Some(error) = state.delete_failures.pop_front() {
            return Err(error);
        }

        let entry = state
            .file_systems
            .remove(resource_id)
            .ok_or_else(|| Error::NotFound(format!("file system '{}'", resource_id)))?;
        state.tokens.remove(&entry.client_token);

        info!(resource_id = %resource_id, "Simulated file system deleted");
        Ok(())
    }
}
