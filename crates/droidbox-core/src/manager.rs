//! The instance state machine.
//!
//! [`InstanceManager`] owns the authoritative record for every instance and
//! sequences the other components through the lifecycle: ports → sandbox →
//! namespace → routing → DNS → start → boot wait. Provisioning runs on a
//! spawned task per instance; any step failure lands the record in `Failed`
//! with a message and rolls back every acquired resource. Deletes set a
//! tombstone that stops an in-flight task at its next step boundary, join
//! the task, and then tear down whatever was built.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use droidbox_error::CommonError;
use droidbox_net::{
    AddressPool, CommandRunner, ConnectivityReport, NetworkIsolator, RoutingPolicy, TrafficRouter,
};
use droidbox_runtime::{
    image_for_version, ExecOutput, HealthVerdict, PortAllocator, SandboxConfig,
    SandboxOrchestrator, SandboxPorts, SandboxRuntime, SandboxStats,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::instance::{Instance, InstanceId, InstanceSpec, InstanceState, ListFilter, StateEvent};

/// Broadcast capacity for state-change events.
const EVENT_CAPACITY: usize = 256;

/// Pause between teardown and re-provisioning on restart.
const RESTART_PAUSE: Duration = Duration::from_secs(2);

/// Default line count for log retrieval.
pub const DEFAULT_LOG_TAIL: usize = 100;

/// Resources stripped from a record for exactly-once release.
struct ResourceBundle {
    name: String,
    had_sandbox: bool,
    ports: Option<SandboxPorts>,
    netns: Option<String>,
    ip: Option<Ipv4Addr>,
}

struct ManagerInner {
    instances: RwLock<HashMap<InstanceId, Instance>>,
    /// Ids whose delete has begun; provisioning aborts at its next boundary.
    tombstones: Mutex<HashSet<InstanceId>>,
    /// Live lifecycle tasks, joined by delete before teardown.
    tasks: Mutex<HashMap<InstanceId, JoinHandle<()>>>,
    runtime: Arc<dyn SandboxRuntime>,
    orchestrator: SandboxOrchestrator,
    ports: PortAllocator,
    addresses: AddressPool,
    isolator: NetworkIsolator,
    router: TrafficRouter,
    events: broadcast::Sender<StateEvent>,
    instances_dir: PathBuf,
}

/// Coordinates instance lifecycles across the runtime, isolator, and router.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct InstanceManager {
    inner: Arc<ManagerInner>,
}

impl InstanceManager {
    /// Builds a manager from configuration and the two external seams.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::Config`] when the configured subnet is
    /// malformed or too small to hold any sandbox address.
    pub fn new(
        config: &Config,
        runtime: Arc<dyn SandboxRuntime>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let addresses = AddressPool::new(config.network.subnet()?)?;
        let isolator = NetworkIsolator::new(
            Arc::clone(&runner),
            config.network.isolator(addresses.gateway())?,
        );
        let router = TrafficRouter::new(runner, config.routing_state_dir());
        let orchestrator =
            SandboxOrchestrator::with_timing(Arc::clone(&runtime), config.runtime.timing());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                instances: RwLock::new(HashMap::new()),
                tombstones: Mutex::new(HashSet::new()),
                tasks: Mutex::new(HashMap::new()),
                runtime,
                orchestrator,
                ports: PortAllocator::default(),
                addresses,
                isolator,
                router,
                events,
                instances_dir: config.instances_dir(),
            }),
        })
    }

    /// Subscribes to state-change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.inner.events.subscribe()
    }

    /// Enables host-side IP forwarding for namespace egress.
    ///
    /// # Errors
    ///
    /// Returns an error when the forwarding sysctl cannot be written.
    pub fn enable_ip_forward(&self) -> Result<()> {
        self.inner.isolator.enable_ip_forward()?;
        Ok(())
    }

    /// Validates `spec` and registers a new instance in `Creating`.
    ///
    /// Provisioning continues on a background task; the returned record is
    /// the pending instance. Anything that fails after this call returns is
    /// recorded on the instance as state `Failed` plus an error message,
    /// never raised to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::Unsupported`] for unknown OS versions and
    /// [`CommonError::Config`] for malformed limits or proxy endpoints;
    /// nothing is registered in either case.
    pub fn create_instance(&self, spec: InstanceSpec) -> Result<Instance> {
        spec.validate()?;
        let instance = Instance::new(spec);
        let id = instance.id.clone();
        {
            let mut instances = self.inner.write_instances()?;
            instances.insert(id.clone(), instance.clone());
        }
        self.send_event(&id, InstanceState::Creating, instance.created_at);
        info!(instance = %id, name = %instance.name, "instance registered");

        let manager = self.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            manager.provision(&task_id).await;
        });
        self.track_task(&id, task);
        Ok(instance)
    }

    /// Returns a snapshot of one instance.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::NotFound`] for unknown ids.
    pub fn get_instance(&self, id: &InstanceId) -> Result<Instance> {
        let instances = self.inner.read_instances()?;
        instances
            .get(id)
            .cloned()
            .ok_or_else(|| CommonError::not_found(format!("instance {id}")).into())
    }

    /// Lists instances matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error only when the registry lock is poisoned.
    pub fn list_instances(&self, filter: &ListFilter) -> Result<Vec<Instance>> {
        let mut list: Vec<Instance> = {
            let instances = self.inner.read_instances()?;
            instances
                .values()
                .filter(|instance| filter.matches(instance))
                .cloned()
                .collect()
        };
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Starts a stopped instance's sandbox.
    ///
    /// Running instances are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::InvalidState`] outside `Running`/`Stopped`
    /// and any orchestrator error from the start itself.
    pub async fn start_instance(&self, id: &InstanceId) -> Result<()> {
        let instance = self.get_instance(id)?;
        match instance.state {
            InstanceState::Running => return Ok(()),
            InstanceState::Stopped => {}
            other => {
                return Err(CommonError::invalid_state(format!(
                    "cannot start instance {id} in state {other}"
                ))
                .into())
            }
        }
        self.inner.orchestrator.start_sandbox(&instance.name).await?;
        self.set_state(id, InstanceState::Running);
        Ok(())
    }

    /// Stops a running instance's sandbox.
    ///
    /// Stopped instances are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::InvalidState`] outside `Running`/`Stopped`
    /// and any orchestrator error from the stop itself.
    pub async fn stop_instance(&self, id: &InstanceId) -> Result<()> {
        let instance = self.get_instance(id)?;
        match instance.state {
            InstanceState::Stopped => return Ok(()),
            InstanceState::Running => {}
            other => {
                return Err(CommonError::invalid_state(format!(
                    "cannot stop instance {id} in state {other}"
                ))
                .into())
            }
        }
        self.inner.orchestrator.stop_sandbox(&instance.name).await?;
        self.set_state(id, InstanceState::Stopped);
        Ok(())
    }

    /// Tears the instance down and provisions it again with the stored spec.
    ///
    /// The id and spec are preserved; ports and addresses are released and
    /// drawn fresh. Teardown, a two second pause, and re-provisioning run on
    /// a background task, so the record re-enters `Creating` shortly after
    /// this returns.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::InvalidState`] while the instance is still
    /// provisioning or already restarting.
    pub fn restart_instance(&self, id: &InstanceId) -> Result<()> {
        let instance = self.get_instance(id)?;
        if instance.state.is_provisioning() {
            return Err(CommonError::invalid_state(format!(
                "instance {id} is still provisioning"
            ))
            .into());
        }
        info!(instance = %id, state = %instance.state, "restarting instance");

        let manager = self.clone();
        let task_id = id.clone();
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if tasks.get(id).is_some_and(|task| !task.is_finished()) {
            return Err(CommonError::invalid_state(format!(
                "instance {id} already has a lifecycle task running"
            ))
            .into());
        }
        let task = tokio::spawn(async move {
            manager.teardown(&task_id).await;
            manager.set_state(&task_id, InstanceState::Creating);
            tokio::time::sleep(RESTART_PAUSE).await;
            manager.provision(&task_id).await;
        });
        tasks.insert(id.clone(), task);
        Ok(())
    }

    /// Deletes an instance, tearing down whatever exists.
    ///
    /// Legal from any state. A delete during provisioning stops the
    /// lifecycle task at its next step boundary, joins it, and then tears
    /// down the partially built resources; every teardown step is attempted
    /// and absent pieces are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::NotFound`] for unknown ids and
    /// [`CommonError::InvalidState`] when a delete is already in flight.
    pub async fn delete_instance(&self, id: &InstanceId) -> Result<()> {
        {
            let instances = self.inner.read_instances()?;
            if !instances.contains_key(id) {
                return Err(CommonError::not_found(format!("instance {id}")).into());
            }
        }
        {
            let mut tombstones = self
                .inner
                .tombstones
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !tombstones.insert(id.clone()) {
                return Err(CommonError::invalid_state(format!(
                    "instance {id} is already being deleted"
                ))
                .into());
            }
        }

        let task = {
            let mut tasks = self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            tasks.remove(id)
        };
        if let Some(task) = task {
            debug!(instance = %id, "waiting for lifecycle task before delete");
            if let Err(err) = task.await {
                warn!(instance = %id, error = %err, "lifecycle task join failed");
            }
        }

        self.teardown(id).await;
        self.inner
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.inner
            .tombstones
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        info!(instance = %id, "instance deleted");
        Ok(())
    }

    /// Resource usage snapshot for the instance's sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::NotFound`] for unknown ids; a stopped sandbox
    /// yields a snapshot whose sections carry a not-running marker.
    pub async fn instance_stats(&self, id: &InstanceId) -> Result<SandboxStats> {
        let instance = self.get_instance(id)?;
        Ok(self.inner.orchestrator.stats(&instance.name).await?)
    }

    /// The last `tail` lines of sandbox output.
    ///
    /// Callers without a preference use [`DEFAULT_LOG_TAIL`].
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::NotFound`] for unknown ids and engine errors
    /// from the log read.
    pub async fn instance_logs(&self, id: &InstanceId, tail: usize) -> Result<String> {
        let instance = self.get_instance(id)?;
        Ok(self.inner.orchestrator.logs(&instance.name, tail).await?)
    }

    /// Runs a command inside the instance's sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotRunning`](droidbox_runtime::RuntimeError)
    /// when the sandbox is not running, [`CommonError::Timeout`] when the
    /// command exceeds the exec timeout.
    pub async fn exec_in_instance(
        &self,
        id: &InstanceId,
        command: &[String],
    ) -> Result<ExecOutput> {
        let instance = self.get_instance(id)?;
        Ok(self.inner.orchestrator.exec(&instance.name, command).await?)
    }

    /// Swaps the instance's egress routing policy.
    ///
    /// The previous redirect is removed before the new policy is applied.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::InvalidState`] for instances provisioned
    /// without a private namespace.
    pub fn update_routing(&self, id: &InstanceId, policy: RoutingPolicy) -> Result<()> {
        let instance = self.get_instance(id)?;
        let Some(netns) = instance.netns else {
            return Err(CommonError::invalid_state(format!(
                "instance {id} has no private namespace"
            ))
            .into());
        };
        info!(instance = %id, policy = policy.kind(), "updating routing");
        self.inner.router.update_routing(&netns, &policy)?;
        self.update_record(id, |record| record.spec.routing = policy)?;
        Ok(())
    }

    /// Probes the instance's namespace from the inside.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::InvalidState`] for instances provisioned
    /// without a private namespace.
    pub fn verify_connectivity(&self, id: &InstanceId) -> Result<ConnectivityReport> {
        let instance = self.get_instance(id)?;
        let Some(netns) = instance.netns else {
            return Err(CommonError::invalid_state(format!(
                "instance {id} has no private namespace"
            ))
            .into());
        };
        Ok(self.inner.isolator.verify_connectivity(&netns))
    }

    /// Live port counts per pool, `(adb, vnc)`.
    ///
    /// # Errors
    ///
    /// Returns an error only when a pool lock is poisoned.
    pub fn port_usage(&self) -> Result<(usize, usize)> {
        Ok(self.inner.ports.in_use()?)
    }

    /// Waits for the instance's in-flight lifecycle task, if any.
    ///
    /// Useful for embedders and tests that need to observe the settled
    /// outcome of a create or restart.
    pub async fn await_provision(&self, id: &InstanceId) {
        let task = {
            let mut tasks = self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            tasks.remove(id)
        };
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(instance = %id, error = %err, "lifecycle task join failed");
            }
        }
    }

    /// Health probe for the monitor.
    pub(crate) async fn check_health(&self, id: &InstanceId) -> Result<HealthVerdict> {
        let instance = self.get_instance(id)?;
        Ok(self.inner.orchestrator.check_health(&instance.name).await?)
    }

    /// Marks an instance `Failed` with a reason.
    pub(crate) fn mark_failed(&self, id: &InstanceId, message: &str) {
        let now = Utc::now();
        {
            let mut instances = self
                .inner
                .instances
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(instance) = instances.get_mut(id) else {
                return;
            };
            instance.state = InstanceState::Failed;
            instance.error = Some(message.to_string());
            instance.stopped_at = Some(now);
        }
        self.send_event(id, InstanceState::Failed, now);
    }

    /// Stamps a successful health probe.
    pub(crate) fn record_heartbeat(&self, id: &InstanceId) {
        let mut instances = self
            .inner
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(instance) = instances.get_mut(id) {
            instance.last_heartbeat = Some(Utc::now());
        }
    }

    /// Drives one instance towards `Running`, handling failure and abort.
    async fn provision(&self, id: &InstanceId) {
        match self.provision_steps(id).await {
            Ok(()) => {}
            Err(err) if err.is_aborted() => {
                debug!(instance = %id, "provisioning aborted by delete");
            }
            Err(err) => {
                warn!(instance = %id, error = %err, "provisioning failed");
                self.mark_failed(id, &err.to_string());
                self.teardown(id).await;
            }
        }
    }

    /// The provisioning sequence proper.
    ///
    /// A delete tombstone is honored at every step boundary; the delete
    /// path then owns teardown of whatever was acquired.
    async fn provision_steps(&self, id: &InstanceId) -> Result<()> {
        self.ensure_not_deleted(id)?;
        let ports = self.inner.ports.allocate_pair()?;
        self.update_record(id, |record| record.ports = Some(ports))?;
        debug!(instance = %id, adb = ports.adb, vnc = ports.vnc, "ports allocated");

        self.ensure_not_deleted(id)?;
        let snapshot = self.get_instance(id)?;
        let config = self.sandbox_config(&snapshot, ports)?;
        let handle = self.inner.runtime.create(&config).await?;
        debug!(instance = %id, sandbox = %handle.id, "sandbox created");
        self.update_record(id, |record| record.handle = Some(handle))?;
        self.set_state(id, InstanceState::Configuring);

        if snapshot.spec.needs_namespace() {
            self.ensure_not_deleted(id)?;
            let ip = self.inner.addresses.allocate()?;
            self.update_record(id, |record| record.ip = Some(ip))?;
            let netns = id.netns_name();
            self.inner.isolator.create_namespace(&netns, ip)?;
            self.update_record(id, |record| record.netns = Some(netns.clone()))?;
            debug!(instance = %id, netns, %ip, "namespace wired");

            self.ensure_not_deleted(id)?;
            self.inner.router.configure(&netns, &snapshot.spec.routing)?;

            self.ensure_not_deleted(id)?;
            self.inner
                .isolator
                .configure_dns(&netns, &snapshot.spec.dns_servers)?;
        }

        self.ensure_not_deleted(id)?;
        self.inner.orchestrator.start_sandbox(&snapshot.name).await?;
        self.inner.orchestrator.wait_for_boot(&snapshot.name).await?;

        self.ensure_not_deleted(id)?;
        self.set_state(id, InstanceState::Running);
        info!(instance = %id, name = %snapshot.name, "instance running");
        Ok(())
    }

    /// Best-effort teardown of everything the record holds.
    ///
    /// Resources are stripped from the record first, so concurrent teardown
    /// paths release each resource at most once. Every step runs regardless
    /// of earlier failures.
    async fn teardown(&self, id: &InstanceId) {
        let Some(bundle) = self.take_resources(id) else {
            return;
        };

        if bundle.had_sandbox {
            if let Err(err) = self.inner.orchestrator.remove_sandbox(&bundle.name).await {
                warn!(instance = %id, error = %err, "sandbox removal failed");
            }
        }
        if let Some(netns) = &bundle.netns {
            self.inner.router.remove_routing(netns);
            self.inner.isolator.destroy_namespace(netns);
        }
        if let Some(ip) = bundle.ip {
            self.inner.addresses.release(ip);
        }
        if let Some(ports) = bundle.ports {
            self.inner.ports.release_pair(ports);
        }
    }

    fn take_resources(&self, id: &InstanceId) -> Option<ResourceBundle> {
        let mut instances = self
            .inner
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let instance = instances.get_mut(id)?;
        Some(ResourceBundle {
            name: instance.name.clone(),
            had_sandbox: instance.handle.take().is_some(),
            ports: instance.ports.take(),
            netns: instance.netns.take(),
            ip: instance.ip.take(),
        })
    }

    fn sandbox_config(&self, instance: &Instance, ports: SandboxPorts) -> Result<SandboxConfig> {
        let image = image_for_version(&instance.spec.os_version)?;
        Ok(SandboxConfig {
            name: instance.name.clone(),
            image: image.to_string(),
            env: instance.spec.profile.build_environment(),
            adb_port: ports.adb,
            vnc_port: ports.vnc,
            memory_bytes: instance.spec.resources.memory_bytes()?,
            cpu_quota: instance.spec.resources.cpu_quota(),
            isolated: instance.spec.needs_namespace(),
            data_dir: self.inner.instances_dir.join(&instance.name),
        })
    }

    fn ensure_not_deleted(&self, id: &InstanceId) -> Result<()> {
        let deleted = self
            .inner
            .tombstones
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id);
        if deleted {
            return Err(CoreError::aborted(format!(
                "instance {id} deleted during provisioning"
            )));
        }
        Ok(())
    }

    fn update_record(&self, id: &InstanceId, apply: impl FnOnce(&mut Instance)) -> Result<()> {
        let mut instances = self.inner.write_instances()?;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| CommonError::not_found(format!("instance {id}")))?;
        apply(instance);
        Ok(())
    }

    /// Updates a record's state, timestamps, and broadcasts the transition.
    fn set_state(&self, id: &InstanceId, state: InstanceState) {
        let now = Utc::now();
        {
            let mut instances = self
                .inner
                .instances
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(instance) = instances.get_mut(id) else {
                return;
            };
            instance.state = state;
            match state {
                InstanceState::Creating => {
                    instance.error = None;
                    instance.started_at = None;
                    instance.last_heartbeat = None;
                }
                InstanceState::Running => {
                    instance.started_at = Some(now);
                    instance.error = None;
                }
                InstanceState::Stopped => instance.stopped_at = Some(now),
                InstanceState::Configuring | InstanceState::Failed => {}
            }
        }
        self.send_event(id, state, now);
    }

    fn send_event(&self, id: &InstanceId, state: InstanceState, at: DateTime<Utc>) {
        let _ = self.inner.events.send(StateEvent {
            id: id.clone(),
            state,
            at,
        });
    }

    fn track_task(&self, id: &InstanceId, task: JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), task);
    }
}

impl ManagerInner {
    fn read_instances(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<InstanceId, Instance>>> {
        self.instances
            .read()
            .map_err(|_| CoreError::from(CommonError::internal("instance registry lock poisoned")))
    }

    fn write_instances(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<InstanceId, Instance>>> {
        self.instances
            .write()
            .map_err(|_| CoreError::from(CommonError::internal("instance registry lock poisoned")))
    }
}
