//! Resolves requests for hosts of a role into concrete hosts.
//!
//! Cloud pools reuse what is already running before paying for anything
//! new: running hosts tagged with the role, then running untagged hosts,
//! then stopped hosts, and only then fresh allocations.

pub mod aws;
pub mod baremetal;
pub mod local;

use crate::config::ReleaseMode;
use crate::error::ExpError;
use crate::{machines_needed, Host, HostStatus, Role};
use async_trait::async_trait;
use color_eyre::Report;
use std::collections::HashSet;
use std::time::Duration;

#[async_trait]
pub trait Pool: Send {
    fn name(&self) -> &'static str;

    /// Returns exactly `ceil(desired / cluster_size)` running hosts with
    /// `role`.
    async fn resolve(
        &mut self,
        role: Role,
        desired: usize,
        cluster_size: usize,
    ) -> Result<Vec<Host>, Report>;

    /// Gives back every host handed out so far.
    async fn release(&mut self, mode: ReleaseMode) -> Result<(), Report>;
}

/// A provider-side instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub host: Host,
    pub instance_type: String,
}

impl Instance {
    pub fn id(&self) -> &str {
        self.host.id.as_deref().unwrap_or("")
    }
}

/// Cloud API used by `CloudPool`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Every instance managed by the harness that is not terminated.
    async fn instances(&self) -> Result<Vec<Instance>, Report>;

    fn instance_type(&self, role: Role) -> String;

    async fn start(&self, ids: &[String]) -> Result<(), Report>;

    /// Requests `count` new instances; returns their ids.
    async fn allocate(
        &self,
        role: Role,
        count: usize,
    ) -> Result<Vec<String>, Report>;

    async fn set_role(&self, ids: &[String], role: Role) -> Result<(), Report>;

    async fn stop(&self, ids: &[String]) -> Result<(), Report>;

    async fn terminate(&self, ids: &[String]) -> Result<(), Report>;
}

pub struct CloudPool<P> {
    provider: P,
    provision_timeout: Duration,
    poll_interval: Duration,
    // ids of every host handed out
    handed_out: Vec<String>,
}

impl<P: Provider> CloudPool<P> {
    pub fn new(
        provider: P,
        provision_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            provider,
            provision_timeout,
            poll_interval,
            handed_out: Vec::new(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    // Waits until every instance in `pending` is running, tagging each one
    // with `role` as soon as it is.
    async fn await_running(
        &self,
        role: Role,
        mut pending: HashSet<String>,
    ) -> Result<(), Report> {
        while !pending.is_empty() {
            let ready: Vec<String> = self
                .provider
                .instances()
                .await?
                .into_iter()
                .filter(|instance| {
                    instance.host.status == HostStatus::Running
                        && pending.contains(instance.id())
                })
                .map(|instance| instance.id().to_string())
                .collect();
            if !ready.is_empty() {
                self.provider.set_role(&ready, role).await?;
                for id in &ready {
                    pending.remove(id);
                }
                tracing::info!(
                    "{} {} host(s) ready, {} pending",
                    ready.len(),
                    role,
                    pending.len()
                );
            }
            if !pending.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Ok(())
    }

    // Gives back what a failed `resolve` started.
    async fn undo(&self, restarted: &[String], allocated: &[String]) {
        if !restarted.is_empty() {
            if let Err(e) = self.provider.stop(restarted).await {
                tracing::warn!("error stopping {:?}: {:?}", restarted, e);
            }
        }
        if !allocated.is_empty() {
            if let Err(e) = self.provider.terminate(allocated).await {
                tracing::warn!("error terminating {:?}: {:?}", allocated, e);
            }
        }
    }
}

#[async_trait]
impl<P: Provider> Pool for CloudPool<P> {
    fn name(&self) -> &'static str {
        "cloud"
    }

    async fn resolve(
        &mut self,
        role: Role,
        desired: usize,
        cluster_size: usize,
    ) -> Result<Vec<Host>, Report> {
        let needed = machines_needed(desired, cluster_size);
        if needed == 0 {
            return Ok(Vec::new());
        }

        let instances = self.provider.instances().await?;
        let running = |instance: &&Instance, with: Role| {
            let host = &instance.host;
            host.status == HostStatus::Running && host.role == with
        };
        let mut have = instances.iter().filter(|i| running(i, role)).count();
        tracing::debug!("{} running {} host(s), {} needed", have, role, needed);

        // adopt running untagged hosts
        if have < needed {
            let adopt: Vec<String> = instances
                .iter()
                .filter(|i| running(i, Role::None))
                .take(needed - have)
                .map(|i| i.id().to_string())
                .collect();
            if !adopt.is_empty() {
                let count = adopt.len();
                tracing::info!("adopting {} free host(s) as {}", count, role);
                self.provider.set_role(&adopt, role).await?;
                have += adopt.len();
            }
        }

        let mut restarted = Vec::new();
        let mut allocated = Vec::new();
        if have < needed {
            // restart stopped hosts of the right type first
            let instance_type = self.provider.instance_type(role);
            restarted = instances
                .iter()
                .filter(|i| {
                    i.host.status == HostStatus::Stopped
                        && (i.host.role == role || i.host.role == Role::None)
                        && i.instance_type == instance_type
                })
                .take(needed - have)
                .map(|i| i.id().to_string())
                .collect();
            if !restarted.is_empty() {
                let count = restarted.len();
                tracing::info!("restarting {} host(s) as {}", count, role);
                self.provider.start(&restarted).await?;
            }

            let missing = needed - have - restarted.len();
            if missing > 0 {
                tracing::info!("allocating {} new {} host(s)", missing, role);
                allocated = self.provider.allocate(role, missing).await?;
                if allocated.len() < missing {
                    let available = have + restarted.len() + allocated.len();
                    self.undo(&restarted, &allocated).await;
                    return Err(ExpError::InsufficientCapacity {
                        role: role.to_string(),
                        wanted: needed,
                        available,
                    }
                    .into());
                }
            }
        }

        // hosts already running are tagged too, in case they were pending
        // with another role
        let pending: HashSet<String> =
            restarted.iter().chain(allocated.iter()).cloned().collect();
        let wait = self.await_running(role, pending);
        match tokio::time::timeout(self.provision_timeout, wait).await {
            Ok(result) => result?,
            Err(_) => {
                self.undo(&restarted, &allocated).await;
                return Err(ExpError::ProvisioningTimeout {
                    what: format!("{} {} host(s)", needed, role),
                    secs: self.provision_timeout.as_secs(),
                }
                .into());
            }
        }

        let mut hosts: Vec<Host> = self
            .provider
            .instances()
            .await?
            .into_iter()
            .filter(|i| {
                i.host.status == HostStatus::Running && i.host.role == role
            })
            .map(|i| i.host)
            .collect();
        hosts.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        if hosts.len() < needed {
            return Err(ExpError::InsufficientCapacity {
                role: role.to_string(),
                wanted: needed,
                available: hosts.len(),
            }
            .into());
        }
        hosts.truncate(needed);

        for host in &hosts {
            if let Some(id) = &host.id {
                if !self.handed_out.contains(id) {
                    self.handed_out.push(id.clone());
                }
            }
        }
        Ok(hosts)
    }

    async fn release(&mut self, mode: ReleaseMode) -> Result<(), Report> {
        let ids = std::mem::take(&mut self.handed_out);
        if ids.is_empty() || mode == ReleaseMode::Keep {
            return Ok(());
        }
        tracing::info!("releasing {} host(s): {:?}", ids.len(), mode);
        self.provider.set_role(&ids, Role::None).await?;
        match mode {
            ReleaseMode::Keep | ReleaseMode::Untag => {}
            ReleaseMode::Stop => self.provider.stop(&ids).await?,
            ReleaseMode::Terminate => self.provider.terminate(&ids).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const TYPE: &str = "c5.2xlarge";

    #[derive(Default)]
    struct Calls {
        allocated: usize,
        started: Vec<String>,
        stopped: Vec<String>,
        terminated: Vec<String>,
    }

    // Instances pending in one listing are running in the next, unless
    // `stuck` is set.
    #[derive(Default)]
    struct FakeProvider {
        instances: Mutex<Vec<Instance>>,
        calls: Mutex<Calls>,
        stuck: bool,
    }

    impl FakeProvider {
        fn with(instances: Vec<(Role, HostStatus)>) -> Self {
            let provider = Self::default();
            for (role, status) in instances {
                provider.add(role, status);
            }
            provider
        }

        fn add(&self, role: Role, status: HostStatus) -> String {
            let mut instances = self.instances.lock().unwrap();
            let id = format!("i-{:03}", instances.len());
            let address = format!("10.0.0.{}", instances.len());
            let ssh_address = format!("ec2-{}", id);
            let mut host =
                Host::new(Some(id.clone()), address, ssh_address, role);
            host.status = status;
            instances.push(Instance {
                host,
                instance_type: TYPE.to_string(),
            });
            id
        }

        fn update(&self, ids: &[String], f: impl Fn(&mut Host)) {
            let mut instances = self.instances.lock().unwrap();
            for instance in instances.iter_mut() {
                if ids.iter().any(|id| id == instance.id()) {
                    f(&mut instance.host);
                }
            }
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        async fn instances(&self) -> Result<Vec<Instance>, Report> {
            let mut instances = self.instances.lock().unwrap();
            let listed = instances.clone();
            if !self.stuck {
                for instance in instances.iter_mut() {
                    if instance.host.status == HostStatus::Pending {
                        instance.host.status = HostStatus::Running;
                    }
                }
            }
            Ok(listed)
        }

        fn instance_type(&self, _: Role) -> String {
            TYPE.to_string()
        }

        async fn start(&self, ids: &[String]) -> Result<(), Report> {
            self.calls.lock().unwrap().started.extend_from_slice(ids);
            self.update(ids, |host| host.status = HostStatus::Pending);
            Ok(())
        }

        async fn allocate(
            &self,
            _: Role,
            count: usize,
        ) -> Result<Vec<String>, Report> {
            self.calls.lock().unwrap().allocated += count;
            Ok((0..count)
                .map(|_| self.add(Role::None, HostStatus::Pending))
                .collect())
        }

        async fn set_role(
            &self,
            ids: &[String],
            role: Role,
        ) -> Result<(), Report> {
            self.update(ids, |host| host.role = role);
            Ok(())
        }

        async fn stop(&self, ids: &[String]) -> Result<(), Report> {
            self.calls.lock().unwrap().stopped.extend_from_slice(ids);
            self.update(ids, |host| host.status = HostStatus::Stopped);
            Ok(())
        }

        async fn terminate(&self, ids: &[String]) -> Result<(), Report> {
            self.calls.lock().unwrap().terminated.extend_from_slice(ids);
            self.update(ids, |host| host.status = HostStatus::Terminated);
            Ok(())
        }
    }

    fn pool(provider: FakeProvider) -> CloudPool<FakeProvider> {
        let timeout = Duration::from_millis(200);
        CloudPool::new(provider, timeout, Duration::from_millis(5))
    }

    fn ids(hosts: &[Host]) -> Vec<&str> {
        hosts.iter().map(|host| host.id.as_deref().unwrap()).collect()
    }

    #[tokio::test]
    async fn reuses_running_hosts() {
        let mut pool = pool(FakeProvider::with(vec![
            (Role::Caching, HostStatus::Running),
            (Role::Caching, HostStatus::Running),
            (Role::Caching, HostStatus::Running),
        ]));
        let hosts = pool.resolve(Role::Caching, 3, 1).await.unwrap();
        assert_eq!(ids(&hosts), vec!["i-000", "i-001", "i-002"]);
        assert_eq!(pool.provider().calls.lock().unwrap().allocated, 0);
    }

    #[tokio::test]
    async fn oversupply_is_not_used() {
        let mut pool = pool(FakeProvider::with(vec![
            (Role::Backing, HostStatus::Running),
            (Role::Caching, HostStatus::Running),
            (Role::Caching, HostStatus::Running),
            (Role::Caching, HostStatus::Running),
        ]));
        // 3 slots, 2 per host
        let hosts = pool.resolve(Role::Caching, 3, 2).await.unwrap();
        assert_eq!(ids(&hosts), vec!["i-001", "i-002"]);
    }

    #[tokio::test]
    async fn adopts_then_restarts_then_allocates() {
        let mut pool = pool(FakeProvider::with(vec![
            (Role::Caching, HostStatus::Running),
            (Role::None, HostStatus::Running),
            (Role::None, HostStatus::Stopped),
            (Role::Backing, HostStatus::Running),
        ]));
        let hosts = pool.resolve(Role::Caching, 4, 1).await.unwrap();
        assert_eq!(ids(&hosts), vec!["i-000", "i-001", "i-002", "i-004"]);
        assert!(hosts.iter().all(|host| host.role == Role::Caching));

        let calls = pool.provider().calls.lock().unwrap();
        assert_eq!(calls.started, vec!["i-002".to_string()]);
        assert_eq!(calls.allocated, 1);
    }

    #[tokio::test]
    async fn timeout_releases_started_hosts() {
        let provider = FakeProvider {
            stuck: true,
            ..FakeProvider::default()
        };
        let mut pool = pool(provider);
        let error = pool.resolve(Role::Client, 2, 1).await.unwrap_err();
        assert!(matches!(
            ExpError::find(&error),
            Some(ExpError::ProvisioningTimeout { .. })
        ));
        let calls = pool.provider().calls.lock().unwrap();
        let terminated = vec!["i-000".to_string(), "i-001".to_string()];
        assert_eq!(calls.terminated, terminated);
    }

    #[tokio::test]
    async fn release_modes() {
        let mut pool = pool(FakeProvider::with(vec![
            (Role::Caching, HostStatus::Running),
            (Role::Backing, HostStatus::Running),
        ]));
        pool.resolve(Role::Caching, 1, 1).await.unwrap();
        pool.release(ReleaseMode::Untag).await.unwrap();
        let instances = pool.provider().instances().await.unwrap();
        assert_eq!(instances[0].host.role, Role::None);
        assert_eq!(instances[0].host.status, HostStatus::Running);

        pool.resolve(Role::Backing, 1, 1).await.unwrap();
        pool.release(ReleaseMode::Stop).await.unwrap();
        let calls = pool.provider().calls.lock().unwrap();
        assert_eq!(calls.stopped, vec!["i-001".to_string()]);
    }

    #[tokio::test]
    async fn nothing_needed() {
        let mut pool = pool(FakeProvider::default());
        assert!(pool.resolve(Role::Backing, 0, 1).await.unwrap().is_empty());
    }
}
