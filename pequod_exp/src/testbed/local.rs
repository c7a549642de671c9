use super::Pool;
use crate::config::ReleaseMode;
use crate::{machines_needed, Host, Role};
use async_trait::async_trait;
use color_eyre::Report;

/// Every host is this machine; nothing goes through ssh.
#[derive(Debug, Default)]
pub struct LocalPool;

#[async_trait]
impl Pool for LocalPool {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn resolve(
        &mut self,
        role: Role,
        desired: usize,
        cluster_size: usize,
    ) -> Result<Vec<Host>, Report> {
        let needed = machines_needed(desired, cluster_size);
        Ok(vec![Host::local(role); needed])
    }

    async fn release(&mut self, _: ReleaseMode) -> Result<(), Report> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_of_localhost() {
        let hosts = LocalPool.resolve(Role::Caching, 5, 2).await.unwrap();
        assert_eq!(hosts.len(), 3);
        assert!(hosts.iter().all(Host::is_local));
    }
}
