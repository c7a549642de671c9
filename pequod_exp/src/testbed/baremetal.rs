use super::Pool;
use crate::config::ReleaseMode;
use crate::error::ExpError;
use crate::{machines_needed, Host, Role};
use async_trait::async_trait;
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use std::path::Path;

/// A fixed list of machines read from a file with one machine per line:
/// `[role] [user@]host`. Lines starting with `#` are ignored.
pub struct StaticPool {
    machines: Vec<Host>,
    // indexes into `machines`
    handed_out: Vec<usize>,
}

impl StaticPool {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Report> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .wrap_err_with(|| {
                format!("read machines file {}", path.display())
            })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, Report> {
        let mut machines = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<_> = line.split_whitespace().collect();
            let (role, target) = match parts.as_slice() {
                [target] => (Role::None, *target),
                [role, target] => {
                    let role = role
                        .parse::<Role>()
                        .map_err(ExpError::InvalidDefinition)?;
                    (role, *target)
                }
                _ => {
                    return Err(ExpError::InvalidDefinition(format!(
                        "machine should have the form `[role] [user@]host`: {}",
                        line
                    ))
                    .into())
                }
            };
            // the address peers use drops the user
            let address = target.rsplit('@').next().unwrap_or(target);
            machines.push(Host::new(None, address, target, role));
        }
        Ok(Self {
            machines,
            handed_out: Vec::new(),
        })
    }

    pub fn machines(&self) -> &[Host] {
        &self.machines
    }
}

#[async_trait]
impl Pool for StaticPool {
    fn name(&self) -> &'static str {
        "baremetal"
    }

    async fn resolve(
        &mut self,
        role: Role,
        desired: usize,
        cluster_size: usize,
    ) -> Result<Vec<Host>, Report> {
        let needed = machines_needed(desired, cluster_size);
        // machines listed with this role first, then unassigned ones
        let free = |index: &usize| !self.handed_out.contains(index);
        let candidates: Vec<usize> = (0..self.machines.len())
            .filter(|i| free(i) && self.machines[*i].role == role)
            .chain(
                (0..self.machines.len())
                    .filter(|i| {
                        free(i) && self.machines[*i].role == Role::None
                    }),
            )
            .take(needed)
            .collect();
        if candidates.len() < needed {
            return Err(ExpError::InsufficientCapacity {
                role: role.to_string(),
                wanted: needed,
                available: candidates.len(),
            }
            .into());
        }

        let hosts = candidates
            .iter()
            .map(|index| {
                let mut host = self.machines[*index].clone();
                host.role = role;
                host
            })
            .collect();
        self.handed_out.extend(candidates);
        Ok(hosts)
    }

    async fn release(&mut self, mode: ReleaseMode) -> Result<(), Report> {
        if mode != ReleaseMode::Keep {
            tracing::debug!("baremetal machines are never stopped");
        }
        self.handed_out.clear();
        Ok(())
    }
}
