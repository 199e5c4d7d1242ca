//! Provisioning state machine.
//!
//! Drives each named volume through `Pending → Creating → Polling → Ready`,
//! with `Failed` reachable from `Creating` and `Polling`. Work on one name is
//! serialized through [`KeyedLocks`]; readiness polling runs in a background
//! task per volume and publishes every record change on a watch channel.
//!
//! The create submission also runs in its own task, so a caller that goes
//! away mid-create never strands a record in `Creating`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::backing::{BackingStore, CreateParams, FileSystem};
use crate::config::{CapacityPolicy, DriverConfig, PollingConfig};
use crate::error::{Error, Result};
use crate::idempotency::{KeyGuard, KeyedLocks};
use crate::metrics;
use crate::retry::{RetryPolicy, with_retry};
use crate::types::{Lifecycle, VolumeRecord, VolumeRequest, VolumeState};
use crate::volume_id::VolumeIdMapper;

/// Tag attached to every created file system.
pub const VOLUME_NAME_TAG: &str = "CSIVolumeName";
/// Volume context keys filled in once a volume is ready.
pub const CONTEXT_DNS_NAME: &str = "dnsname";
pub const CONTEXT_MOUNT_NAME: &str = "mountname";

#[derive(Default)]
struct Poller {
    handle: Option<JoinHandle<()>>,
    cancelled: bool,
}

/// One tracked volume: its record channel and its poller, if any.
struct VolumeSlot {
    record: watch::Sender<VolumeRecord>,
    poller: Mutex<Poller>,
}

impl VolumeSlot {
    fn new(record: VolumeRecord) -> Self {
        let (record, _) = watch::channel(record);
        Self {
            record,
            poller: Mutex::new(Poller::default()),
        }
    }

    fn snapshot(&self) -> VolumeRecord {
        self.record.borrow().clone()
    }

    /// Apply `f` to a copy of the record and publish it only if `f` succeeds.
    fn apply<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut VolumeRecord) -> Result<()>,
    {
        let mut outcome = Ok(());
        self.record.send_if_modified(|record| {
            let mut next = record.clone();
            match f(&mut next) {
                Ok(()) => {
                    let changed = next != *record;
                    *record = next;
                    changed
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        outcome
    }

    /// Wait until no create submission is in flight for this record.
    async fn settled(&self) -> VolumeRecord {
        let mut rx = self.record.subscribe();
        match rx
            .wait_for(|r| !matches!(r.state, VolumeState::Pending | VolumeState::Creating))
            .await
        {
            Ok(record) => record.clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// A poller registered after the slot was cancelled is aborted at once.
    fn set_poller(&self, handle: JoinHandle<()>) {
        let mut poller = self.poller.lock().unwrap_or_else(|p| p.into_inner());
        if poller.cancelled {
            handle.abort();
        } else {
            poller.handle = Some(handle);
        }
    }

    fn cancel_poller(&self) -> bool {
        let mut poller = self.poller.lock().unwrap_or_else(|p| p.into_inner());
        poller.cancelled = true;
        match poller.handle.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }
}

/// State shared with the submission and poller tasks.
struct Shared {
    backing: Arc<dyn BackingStore>,
    mapper: VolumeIdMapper,
    volumes: RwLock<HashMap<String, Arc<VolumeSlot>>>,
    polling: PollingConfig,
    retry: RetryPolicy,
}

/// Provisioning state machine over a [`BackingStore`].
pub struct Provisioner {
    shared: Arc<Shared>,
    locks: KeyedLocks,
    capacity: CapacityPolicy,
}

impl Provisioner {
    pub fn new(backing: Arc<dyn BackingStore>, config: &DriverConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                backing,
                mapper: VolumeIdMapper::new(),
                volumes: RwLock::new(HashMap::new()),
                polling: config.polling,
                retry: config.retry.clone(),
            }),
            locks: KeyedLocks::new(),
            capacity: config.capacity,
        }
    }

    /// Serialize work on `name` with create and delete of the same name.
    pub async fn lock(&self, name: &str) -> KeyGuard<'_> {
        self.locks.lock(name).await
    }

    pub fn mapper(&self) -> &VolumeIdMapper {
        &self.shared.mapper
    }

    /// Create a volume, or return the existing record for its name.
    pub async fn create(&self, request: &VolumeRequest) -> Result<VolumeRecord> {
        let guard = self.lock(&request.name).await;
        self.create_locked(&guard, request).await
    }

    /// [`create`](Self::create) for a caller already holding the name's lock.
    ///
    /// Returns once the backing store accepted the request; readiness is
    /// tracked in the background (see [`wait_ready`](Self::wait_ready)).
    /// Dropping the returned future does not abort the submission: the record
    /// still reaches `Polling` or `Failed`, and the next call for the name
    /// waits for that outcome.
    #[instrument(skip(self, guard, request), fields(name = %request.name))]
    pub async fn create_locked(
        &self,
        guard: &KeyGuard<'_>,
        request: &VolumeRequest,
    ) -> Result<VolumeRecord> {
        debug_assert_eq!(guard.key(), request.name);

        if request.name.is_empty() {
            return Err(Error::terminal("InvalidParameter", "volume name is required"));
        }
        if request.capacity.bytes() == 0 {
            return Err(Error::terminal(
                "InvalidParameter",
                "requested capacity must be positive",
            ));
        }

        let existing = self.shared.volumes.read().await.get(&request.name).cloned();
        if let Some(slot) = existing {
            if matches!(slot.snapshot().state, VolumeState::Pending | VolumeState::Creating) {
                info!("Earlier create still submitting, waiting for it");
            }
            let record = slot.settled().await;
            if record.state != VolumeState::Failed {
                debug!(state = %record.state, "Volume already known, returning existing record");
                return Ok(record);
            }
            info!(
                error = ?record.error,
                "Previous attempt failed, starting a fresh one"
            );
            self.shared.discard(&request.name, &slot).await;
        }

        let capacity_gib = self.capacity.round_up(request.capacity);
        let slot = Arc::new(VolumeSlot::new(VolumeRecord::new(&request.name, capacity_gib)));
        self.shared
            .volumes
            .write()
            .await
            .insert(request.name.clone(), slot.clone());
        if let Err(e) = slot.apply(|r| r.transition(VolumeState::Creating)) {
            self.shared.volumes.write().await.remove(&request.name);
            return Err(e);
        }
        self.shared.refresh_volume_gauges().await;

        let params = CreateParams {
            client_token: request.name.clone(),
            capacity_gib,
            subnet_id: request.parameters.subnet_id.clone(),
            security_group_ids: request.parameters.security_group_ids.clone(),
            tags: BTreeMap::from([(VOLUME_NAME_TAG.to_string(), request.name.clone())]),
            extra: request.parameters.extra.clone(),
        };

        info!(
            capacity_gib,
            subnet_id = %params.subnet_id,
            "Submitting file system create"
        );

        let submission = tokio::spawn(
            self.shared
                .clone()
                .submit(slot, request.name.clone(), params)
                .in_current_span(),
        );
        match submission.await {
            Ok(result) => result,
            Err(e) => Err(Error::terminal(
                "Internal",
                format!("create submission did not complete: {}", e),
            )),
        }
    }

    /// Delete a volume in any state. Deleting an unknown name succeeds.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let guard = self.lock(name).await;
        self.delete_locked(&guard, name).await
    }

    /// [`delete`](Self::delete) for a caller already holding the name's lock.
    ///
    /// The record leaves the cache before the backing store is called, so a
    /// failed backing delete never blocks a later create of the same name.
    /// A create submission still in flight is awaited first so the resource
    /// it produces is deleted too.
    #[instrument(skip(self, guard))]
    pub async fn delete_locked(&self, guard: &KeyGuard<'_>, name: &str) -> Result<()> {
        debug_assert_eq!(guard.key(), name);

        let Some(slot) = self.shared.volumes.write().await.remove(name) else {
            info!("Volume not tracked, treating as already deleted");
            return Ok(());
        };

        if matches!(slot.snapshot().state, VolumeState::Pending | VolumeState::Creating) {
            info!("Waiting for in-flight create before deleting");
        }
        let record = slot.settled().await;

        if slot.cancel_poller() {
            info!("Cancelled readiness polling");
        }
        let resource_id = self
            .shared
            .mapper
            .unbind(name)
            .await
            .or(record.resource_id);
        self.shared.refresh_volume_gauges().await;

        let Some(resource_id) = resource_id else {
            info!("Volume had no backing resource");
            return Ok(());
        };

        let backing = &self.shared.backing;
        match with_retry(&self.shared.retry, "delete", || backing.delete(&resource_id)).await {
            Ok(()) => {
                info!(resource_id = %resource_id, "File system deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(resource_id = %resource_id, "File system not found, treating as already deleted");
                Ok(())
            }
            Err(e) => {
                error!(resource_id = %resource_id, error = %e, "File system delete failed");
                Err(e)
            }
        }
    }

    /// Current record of `name`.
    pub async fn status(&self, name: &str) -> Option<VolumeRecord> {
        self.shared
            .volumes
            .read()
            .await
            .get(name)
            .map(|slot| slot.snapshot())
    }

    /// Resolve once `name` is `Ready` or `Failed`.
    ///
    /// A `Failed` record yields its stored error; a volume deleted while
    /// waiting yields [`Error::Cancelled`].
    pub async fn wait_ready(&self, name: &str) -> Result<VolumeRecord> {
        let mut rx = self
            .shared
            .volumes
            .read()
            .await
            .get(name)
            .map(|slot| slot.record.subscribe())
            .ok_or_else(|| Error::NotFound(format!("volume '{}'", name)))?;

        let record = match rx.wait_for(|r| r.state.is_terminal()).await {
            Ok(record) => record.clone(),
            Err(_) => return Err(Error::Cancelled(name.to_string())),
        };

        match record.state {
            VolumeState::Ready => Ok(record),
            _ => Err(record.error.unwrap_or_else(|| {
                Error::terminal("ProvisioningFailed", format!("volume '{}' failed", name))
            })),
        }
    }

    /// Stream of record snapshots, starting with the current one.
    pub async fn subscribe(&self, name: &str) -> Option<WatchStream<VolumeRecord>> {
        self.shared
            .volumes
            .read()
            .await
            .get(name)
            .map(|slot| WatchStream::new(slot.record.subscribe()))
    }

    /// All records, sorted by name.
    pub async fn list(&self) -> Vec<VolumeRecord> {
        let mut records: Vec<VolumeRecord> = self
            .shared
            .volumes
            .read()
            .await
            .values()
            .map(|slot| slot.snapshot())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }
}

impl Drop for Provisioner {
    fn drop(&mut self) {
        if let Ok(volumes) = self.shared.volumes.try_read() {
            for slot in volumes.values() {
                slot.cancel_poller();
            }
        }
    }
}

impl Shared {
    /// Submit the create, bind the resource ID and start polling.
    async fn submit(
        self: Arc<Self>,
        slot: Arc<VolumeSlot>,
        name: String,
        params: CreateParams,
    ) -> Result<VolumeRecord> {
        let created = with_retry(&self.retry, "create", || self.backing.create(&params)).await;
        let resource_id = match created {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "File system create failed");
                self.fail(&slot, e.clone()).await;
                return Err(e);
            }
        };

        if let Err(e) = self.mapper.bind(&name, &resource_id).await {
            error!(resource_id = %resource_id, error = %e, "Resource ID already claimed");
            self.fail(&slot, e.clone()).await;
            return Err(e);
        }
        let submitted = slot.apply(|r| {
            r.assign_resource_id(&resource_id)?;
            r.transition(VolumeState::Polling)
        });
        if let Err(e) = submitted {
            error!(resource_id = %resource_id, error = %e, "Could not record submitted file system");
            self.fail(&slot, e.clone()).await;
            return Err(e);
        }

        info!(resource_id = %resource_id, "File system submitted, polling for readiness");
        let record = slot.snapshot();
        self.spawn_poller(&slot, name, resource_id);
        self.refresh_volume_gauges().await;

        Ok(record)
    }

    async fn fail(&self, slot: &VolumeSlot, error: Error) {
        if let Err(e) = slot.apply(|r| r.fail(error)) {
            warn!(error = %e, "Could not mark volume failed");
        }
        self.refresh_volume_gauges().await;
    }

    /// Drop a failed record and, best effort, the resource it left behind.
    async fn discard(&self, name: &str, slot: &VolumeSlot) {
        self.volumes.write().await.remove(name);
        slot.cancel_poller();

        let Some(resource_id) = self.mapper.unbind(name).await else {
            return;
        };
        match with_retry(&self.retry, "delete", || self.backing.delete(&resource_id)).await {
            Ok(()) => info!(resource_id = %resource_id, "Deleted resource of failed attempt"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(
                resource_id = %resource_id,
                error = %e,
                "Could not delete resource of failed attempt"
            ),
        }
    }

    fn spawn_poller(self: &Arc<Self>, slot: &Arc<VolumeSlot>, name: String, resource_id: String) {
        let shared = self.clone();
        let task_slot = slot.clone();

        let handle = tokio::spawn(async move {
            poll_until_terminal(&shared, &task_slot, &name, &resource_id).await;
            shared.refresh_volume_gauges().await;
        });
        slot.set_poller(handle);
    }

    async fn refresh_volume_gauges(&self) {
        let volumes = self.volumes.read().await;
        let mut counts: HashMap<VolumeState, usize> = HashMap::new();
        for slot in volumes.values() {
            *counts.entry(slot.record.borrow().state).or_default() += 1;
        }
        for state in VolumeState::ALL {
            metrics::set_volume_count(state.as_str(), counts.get(&state).copied().unwrap_or(0));
        }
    }
}

/// Background task: poll until the file system settles or the deadline passes.
async fn poll_until_terminal(shared: &Shared, slot: &VolumeSlot, name: &str, resource_id: &str) {
    let polling = shared.polling;
    let outcome = tokio::time::timeout(
        polling.timeout(),
        wait_available(shared.backing.as_ref(), slot, resource_id, polling),
    )
    .await;

    let result = match outcome {
        Ok(Ok(fs)) => {
            info!(name = %name, resource_id = %resource_id, dns_name = %fs.dns_name, "Volume ready");
            slot.apply(|r| {
                r.context
                    .insert(CONTEXT_DNS_NAME.to_string(), fs.dns_name.clone());
                r.context
                    .insert(CONTEXT_MOUNT_NAME.to_string(), fs.mount_name.clone());
                r.capacity_gib = fs.capacity_gib;
                r.transition(VolumeState::Ready)
            })
        }
        Ok(Err(e)) => {
            error!(name = %name, resource_id = %resource_id, error = %e, "Volume failed");
            slot.apply(|r| r.fail(e))
        }
        Err(_) => {
            error!(
                name = %name,
                resource_id = %resource_id,
                timeout_ms = polling.timeout_ms,
                "Timed out waiting for volume"
            );
            slot.apply(|r| {
                r.fail(Error::Timeout {
                    name: name.to_string(),
                    elapsed: polling.timeout(),
                })
            })
        }
    };

    if let Err(e) = result {
        warn!(name = %name, error = %e, "Poller could not record outcome");
    }
}

async fn wait_available(
    backing: &dyn BackingStore,
    slot: &VolumeSlot,
    resource_id: &str,
    polling: PollingConfig,
) -> Result<FileSystem> {
    loop {
        match backing.describe(resource_id).await {
            Ok(fs) => {
                let lifecycle = fs.lifecycle;
                slot.record
                    .send_modify(|r| r.last_status = Some(lifecycle));
                metrics::record_poll(&lifecycle.to_string().to_lowercase());

                match lifecycle {
                    Lifecycle::Available => return Ok(fs),
                    Lifecycle::Creating => {
                        debug!(resource_id = %resource_id, "File system still creating");
                    }
                    Lifecycle::Failed | Lifecycle::Misconfigured => {
                        return Err(Error::terminal(
                            "FileSystemFailed",
                            fs.failure_reason
                                .unwrap_or_else(|| format!("file system is {}", lifecycle)),
                        ));
                    }
                    Lifecycle::Deleting => {
                        return Err(Error::terminal(
                            "FileSystemDeleting",
                            format!("file system '{}' is being deleted", resource_id),
                        ));
                    }
                }
            }
            Err(e) if e.is_retryable() => {
                metrics::record_poll("transient");
                warn!(resource_id = %resource_id, error = %e, "Describe failed, will poll again");
            }
            Err(e) => return Err(e),
        }

        tokio::time::sleep(polling.interval()).await;
    }
}
