use crate::error::ExpError;
use crate::{machines_needed, Host, Role};
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use std::fmt::Write as _;
use std::path::Path;

pub type SlotIndex = usize;

/// Name of the manifest file shared with every server and client.
pub const MANIFEST_FILE: &str = "hosts.txt";
/// Name of the manifest listing the database instances (write-around mode).
pub const DB_MANIFEST_FILE: &str = "dbhosts.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Global slot index: backing slots come first, then caching slots.
    pub index: SlotIndex,
    pub role: Role,
    pub host: Host,
    pub port: u16,
}

/// Ordered mapping from logical slot to `(host, port)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    slots: Vec<Slot>,
    backing_slots: usize,
}

impl Topology {
    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    pub fn slot(&self, index: SlotIndex) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn backing_slots(&self) -> usize {
        self.backing_slots
    }

    pub fn caching_slots(&self) -> usize {
        self.slots.len() - self.backing_slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Distinct hosts in slot order.
    pub fn hosts(&self) -> Vec<&Host> {
        let mut hosts: Vec<&Host> = Vec::new();
        for slot in &self.slots {
            let address = &slot.host.ssh_address;
            if !hosts.iter().any(|host| &host.ssh_address == address) {
                hosts.push(&slot.host);
            }
        }
        hosts
    }

    /// Manifest content: one `<host>\t<port>` line per slot.
    pub fn manifest(&self) -> String {
        let mut content = String::new();
        for slot in &self.slots {
            let _ = writeln!(content, "{}\t{}", slot.host.address, slot.port);
        }
        content
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), Report> {
        let path = path.as_ref();
        std::fs::write(path, self.manifest())
            .wrap_err_with(|| format!("write manifest {}", path.display()))
    }
}

/// Maps backing slots and then caching slots to hosts, `cluster_size` slots
/// per host. The slot with global index `g` listens on `base_port + g`, so
/// slots sharing a host never share a port.
pub fn build_topology(
    backing_hosts: &[Host],
    caching_hosts: &[Host],
    backing_slots: usize,
    caching_slots: usize,
    cluster_size: usize,
    base_port: u16,
) -> Result<Topology, Report> {
    let cluster_size = cluster_size.max(1);
    check_capacity(Role::Backing, backing_hosts, backing_slots, cluster_size)?;
    check_capacity(Role::Caching, caching_hosts, caching_slots, cluster_size)?;

    let mut slots = Vec::with_capacity(backing_slots + caching_slots);
    let roles = std::iter::repeat((Role::Backing, backing_hosts))
        .take(backing_slots)
        .enumerate()
        .chain(
            std::iter::repeat((Role::Caching, caching_hosts))
                .take(caching_slots)
                .enumerate(),
        );
    for (index, (role_slot, (role, hosts))) in roles.enumerate() {
        let host = hosts[role_slot / cluster_size].clone();
        let port = slot_port(base_port, index)?;
        slots.push(Slot {
            index,
            role,
            host,
            port,
        });
    }

    Ok(Topology {
        slots,
        backing_slots,
    })
}

fn check_capacity(
    role: Role,
    hosts: &[Host],
    slots: usize,
    cluster_size: usize,
) -> Result<(), Report> {
    let wanted = machines_needed(slots, cluster_size);
    if hosts.len() < wanted {
        return Err(ExpError::InsufficientCapacity {
            role: role.to_string(),
            wanted,
            available: hosts.len(),
        }
        .into());
    }
    Ok(())
}

fn slot_port(base_port: u16, index: SlotIndex) -> Result<u16, Report> {
    u16::try_from(base_port as usize + index).map_err(|_| {
        ExpError::InvalidDefinition(format!(
            "slot {} does not fit a port starting at {}",
            index, base_port
        ))
        .into()
    })
}

/// Writes a database manifest: one `<host>\t<port>` line per instance.
pub fn write_db_manifest(
    path: impl AsRef<Path>,
    instances: &[(String, u16)],
) -> Result<(), Report> {
    let path = path.as_ref();
    let mut content = String::new();
    for (host, port) in instances {
        let _ = writeln!(content, "{}\t{}", host, port);
    }
    std::fs::write(path, content)
        .wrap_err_with(|| format!("write db manifest {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(prefix: &str, count: usize, role: Role) -> Vec<Host> {
        (0..count)
            .map(|i| {
                let address = format!("10.0.{}.{}", prefix.len(), i);
                let name = format!("{}-{}", prefix, i);
                Host::new(Some(name), address.clone(), address, role)
            })
            .collect()
    }

    #[test]
    fn backing_then_caching() {
        let backing = hosts("b", 1, Role::Backing);
        let caching = hosts("cc", 2, Role::Caching);
        let topology =
            build_topology(&backing, &caching, 1, 4, 2, 9000).unwrap();

        assert_eq!(topology.len(), 5);
        assert_eq!(topology.backing_slots(), 1);
        assert_eq!(topology.caching_slots(), 4);
        assert_eq!(
            topology.manifest(),
            "10.0.1.0\t9000\n\
             10.0.2.0\t9001\n\
             10.0.2.0\t9002\n\
             10.0.2.1\t9003\n\
             10.0.2.1\t9004\n"
        );
        let roles: Vec<_> = topology.slots().map(|slot| slot.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::Backing,
                Role::Caching,
                Role::Caching,
                Role::Caching,
                Role::Caching
            ]
        );
        assert_eq!(topology.hosts().len(), 3);
    }

    #[test]
    fn not_enough_hosts() {
        let caching = hosts("c", 1, Role::Caching);
        let error = build_topology(&[], &caching, 0, 3, 2, 9000).unwrap_err();
        assert!(matches!(
            ExpError::find(&error),
            Some(ExpError::InsufficientCapacity { wanted: 2, available: 1, .. })
        ));
    }

    #[test]
    fn write_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let caching = vec![Host::local(Role::Caching)];
        let topology = build_topology(&[], &caching, 0, 2, 2, 7000).unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        topology.write(&path).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content, "127.0.0.1\t7000\n127.0.0.1\t7001\n");
    }
}
