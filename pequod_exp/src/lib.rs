#![deny(rust_2018_idioms)]

pub mod aggregate;
pub mod config;
pub mod error;
pub mod topology;

#[cfg(feature = "exp")]
pub mod bench;
#[cfg(feature = "exp")]
pub mod machine;
#[cfg(feature = "exp")]
pub mod process;
#[cfg(feature = "exp")]
pub mod progress;
#[cfg(feature = "exp")]
pub mod testbed;

// Re-exports.
pub use config::{ExperimentFile, Options};
pub use error::ExpError;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Builds a `Vec<String>` out of anything that implements `ToString`.
#[macro_export]
macro_rules! args {
    ($($element:expr),*) => {{
        #[allow(unused_mut)]
        let mut vs: Vec<String> = Vec::new();
        $(vs.push($element.to_string());)*
        vs
    }};
    ($($element:expr,)*) => {{
        $crate::args![$($element),*]
    }};
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Backing,
    Caching,
    Client,
    None,
}

impl Role {
    /// Value of the `role` tag set on cloud instances.
    pub fn name(&self) -> &'static str {
        match self {
            Role::Backing => "backing",
            Role::Caching => "caching",
            Role::Client => "client",
            Role::None => "none",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backing" => Ok(Role::Backing),
            // older machine files use `cache`
            "caching" | "cache" => Ok(Role::Caching),
            "client" => Ok(Role::Client),
            "none" => Ok(Role::None),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Pending,
    Running,
    Stopped,
    Terminated,
}

/// An addressable compute resource handed out by a pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Host {
    /// Provider-assigned identifier (e.g. an EC2 instance id).
    pub id: Option<String>,
    /// Address other processes use to reach this host; this is what ends up
    /// in the topology manifest.
    pub address: String,
    /// Address the coordinator uses to ssh into this host.
    pub ssh_address: String,
    pub role: Role,
    pub status: HostStatus,
}

impl Host {
    pub fn new(
        id: Option<String>,
        address: impl Into<String>,
        ssh_address: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            id,
            address: address.into(),
            ssh_address: ssh_address.into(),
            role,
            status: HostStatus::Running,
        }
    }

    pub fn local(role: Role) -> Self {
        Self::new(None, LOCALHOST, LOCALHOST, role)
    }

    pub fn is_local(&self) -> bool {
        self.ssh_address == LOCALHOST
    }

    /// Key used to order hosts deterministically.
    pub fn sort_key(&self) -> (&str, &str) {
        (self.id.as_deref().unwrap_or(""), self.ssh_address.as_str())
    }
}

pub const LOCALHOST: &str = "127.0.0.1";

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Testbed {
    Local,
    Baremetal,
    Aws,
}

impl Testbed {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Baremetal => "baremetal",
            Self::Aws => "aws",
        }
    }

    pub fn is_local(&self) -> bool {
        self == &Testbed::Local
    }
}

impl FromStr for Testbed {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "baremetal" => Ok(Self::Baremetal),
            "aws" => Ok(Self::Aws),
            other => Err(format!("unknown testbed: {}", other)),
        }
    }
}

/// Number of machines needed to hold `slots` logical slots when
/// `cluster_size` slots share a machine.
pub fn machines_needed(slots: usize, cluster_size: usize) -> usize {
    let cluster_size = cluster_size.max(1);
    (slots + cluster_size - 1) / cluster_size
}
