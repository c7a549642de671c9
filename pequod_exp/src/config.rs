use crate::error::ExpError;
use crate::{Role, Testbed};
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// harness defaults
const NBACKING: usize = 1;
const NCACHING: usize = 5;
const NGROUPS: usize = 1;
const CLUSTER_SIZE: usize = 1;
const START_PORT: u16 = 7000;
const DB_START_PORT: u16 = 10000;
// how much ports move after each definition with `--moveports`
pub const PORT_SHIFT: u16 = 100;
const EXPFILE: &str = "exp/testexperiments.yml";
const RESULTS_DIR: &str = "results";
const REMOTE_DIR: &str = "pequod";
const RAMFS: &str = "/mnt/tmp";
const DUMPS_DIR: &str = "dumps";

// polling config
const READINESS_DELAY_SECS: u64 = 3;
const READINESS_TIMEOUT_SECS: u64 = 60;
const PROVISION_TIMEOUT_SECS: u64 = 10 * 60; // 10 minutes
const SSH_TIMEOUT_SECS: u64 = 5 * 60; // 5 minutes
const DB_READY_TIMEOUT_SECS: u64 = 60;
const POLL_INTERVAL_SECS: u64 = 5;

// aws config
const AWS_REGION: &str = "us-east-1";
const AWS_INSTANCE_TYPE: &str = "c5.2xlarge";
const AWS_KEY_NAME: &str = "pequod";
const AWS_SECURITY_GROUP: &str = "pequod";
const AWS_USER: &str = "ubuntu";

/// Contents of an experiment file: the list of experiments under `exps`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentFile {
    pub exps: Vec<Experiment>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Experiment {
    pub name: String,
    pub defs: Vec<WorkloadDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<PlotSpec>,
}

/// One named scenario of an experiment. Every command is an opaque string
/// handed to the executor after placeholder substitution.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadDef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, rename = "def_part")]
    pub part: Option<String>,
    #[serde(default, rename = "def_build")]
    pub build: Option<String>,
    #[serde(default, rename = "backendcmd")]
    pub backend_cmd: Option<String>,
    #[serde(default, rename = "cachecmd")]
    pub cache_cmd: Option<String>,
    #[serde(default, rename = "initcmd")]
    pub init_cmd: Option<String>,
    #[serde(default, rename = "populatecmd")]
    pub populate_cmd: Option<String>,
    #[serde(default, rename = "clientcmd")]
    pub client_cmd: Option<String>,
    #[serde(default, rename = "def_single_pop")]
    pub single_pop: bool,
    #[serde(default, rename = "def_db_type")]
    pub db_type: Option<DbType>,
    #[serde(default, rename = "def_db_compare")]
    pub db_compare: bool,
    #[serde(default, rename = "def_db_writearound")]
    pub db_writearound: bool,
    #[serde(default, rename = "def_db_flags")]
    pub db_flags: Option<String>,
    #[serde(default, rename = "def_db_sql_script")]
    pub db_sql_script: Option<String>,
    #[serde(default, rename = "def_db_s_import")]
    pub db_import: Option<String>,
    #[serde(default, rename = "def_db_in_memory")]
    pub db_in_memory: bool,
    #[serde(default, rename = "def_redis_compare")]
    pub redis_compare: bool,
    #[serde(default, rename = "def_memcache_compare")]
    pub memcache_compare: bool,
    #[serde(default, rename = "def_memcache_args")]
    pub memcache_args: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    Postgres,
    Berkeleydb,
}

/// Which store replaces the pequod servers, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Postgres,
    Redis,
    Memcache,
}

/// Plot metadata; only passed through to the plotting tools.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PlotSpec {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: Vec<PlotData>,
    #[serde(default)]
    pub lines: Vec<String>,
    #[serde(default)]
    pub points: Vec<serde_json::Value>,
    #[serde(default)]
    pub xlabel: Option<String>,
    #[serde(default)]
    pub ylabel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PlotData {
    pub from: String,
    pub attr: String,
    #[serde(default)]
    pub agg: Option<String>,
}

impl ExperimentFile {
    /// Loads and validates an experiment file. JSON files are accepted too,
    /// since they're valid YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Report> {
        let path = path.as_ref();
        let display = path.display();
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("read experiment file {}", display))?;
        Self::parse(&content)
            .wrap_err_with(|| format!("load experiment file {}", display))
    }

    pub fn parse(content: &str) -> Result<Self, Report> {
        let file: Self = serde_yaml::from_str(content)
            .map_err(|e| ExpError::InvalidDefinition(e.to_string()))?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<(), Report> {
        let mut names = HashSet::new();
        for exp in &self.exps {
            if exp.name.is_empty() {
                return Err(invalid("experiment without a name"));
            }
            if !names.insert(exp.name.as_str()) {
                let reason = format!("duplicate experiment '{}'", exp.name);
                return Err(invalid(reason));
            }
            exp.validate()?;
        }
        Ok(())
    }

    /// Selects the definitions to run, in file order. With no filters every
    /// definition not marked `disabled` is selected; otherwise a definition
    /// runs if a pattern matches its experiment name, its own name, or
    /// `experiment/definition`.
    pub fn select(
        &self,
        filters: &[String],
    ) -> Result<Vec<(&Experiment, &WorkloadDef)>, Report> {
        let patterns = filters
            .iter()
            .map(|filter| {
                glob::Pattern::new(filter).map_err(|e| {
                    invalid(format!("bad filter pattern '{}': {}", filter, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut selected = Vec::new();
        for exp in &self.exps {
            for def in &exp.defs {
                let run = if patterns.is_empty() {
                    !def.disabled
                } else {
                    patterns.iter().any(|pattern| {
                        pattern.matches(&exp.name)
                            || def.name.as_deref().map_or(false, |name| {
                                let full = format!("{}/{}", exp.name, name);
                                pattern.matches(name) || pattern.matches(&full)
                            })
                    })
                };
                if run {
                    selected.push((exp, def));
                }
            }
        }
        Ok(selected)
    }
}

impl Experiment {
    fn validate(&self) -> Result<(), Report> {
        let mut names = HashSet::new();
        for def in &self.defs {
            if !names.insert(def.name.as_deref()) {
                let name = def.name.as_deref().unwrap_or("<unnamed>");
                return Err(invalid(format!(
                    "duplicate definition '{}' in experiment '{}'",
                    name, self.name
                )));
            }
            def.validate().wrap_err_with(|| {
                format!(
                    "experiment '{}', definition '{}'",
                    self.name,
                    def.display_name()
                )
            })?;
        }
        Ok(())
    }
}

impl WorkloadDef {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// The store standing in for pequod servers. Pequod servers are never
    /// started when this is set.
    pub fn comparison(&self) -> Option<Comparison> {
        if self.db_compare {
            Some(Comparison::Postgres)
        } else if self.redis_compare {
            Some(Comparison::Redis)
        } else if self.memcache_compare {
            Some(Comparison::Memcache)
        } else {
            None
        }
    }

    /// Whether pequod servers use postgres as their backing database.
    pub fn uses_postgres_backend(&self) -> bool {
        self.comparison().is_none() && self.db_type == Some(DbType::Postgres)
    }

    pub fn uses_berkeleydb(&self) -> bool {
        self.comparison().is_none() && self.db_type == Some(DbType::Berkeleydb)
    }

    /// Whether the backing databases can be dumped to, or restored from, an
    /// archive: only write-around definitions keep the data in postgres.
    pub fn uses_db_archive(&self) -> bool {
        self.db_writearound && self.uses_postgres_backend()
    }

    pub fn validate(&self) -> Result<(), Report> {
        let comparisons =
            [self.db_compare, self.redis_compare, self.memcache_compare]
                .iter()
                .filter(|flag| **flag)
                .count();
        if comparisons > 1 {
            return Err(invalid(
                "def_db_compare, def_redis_compare and def_memcache_compare \
                 are mutually exclusive",
            ));
        }
        if self.client_cmd.is_none() {
            return Err(invalid("clientcmd is required"));
        }
        if self.db_compare && self.db_type != Some(DbType::Postgres) {
            return Err(invalid(
                "def_db_compare requires def_db_type: postgres",
            ));
        }
        if self.db_compare && self.db_writearound {
            return Err(invalid(
                "def_db_compare and def_db_writearound conflict",
            ));
        }
        if self.db_writearound && self.db_type != Some(DbType::Postgres) {
            return Err(invalid(
                "def_db_writearound requires def_db_type: postgres",
            ));
        }
        if self.memcache_args.is_some() && !self.memcache_compare {
            return Err(invalid(
                "def_memcache_args requires def_memcache_compare",
            ));
        }
        if self.comparison().is_none() {
            if self.backend_cmd.is_none() || self.cache_cmd.is_none() {
                return Err(invalid(
                    "backendcmd and cachecmd are required unless comparing \
                     against another store",
                ));
            }
        } else if self.backend_cmd.is_some() || self.cache_cmd.is_some() {
            return Err(invalid(
                "comparison definitions start no pequod servers; drop \
                 backendcmd and cachecmd",
            ));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> Report {
    ExpError::InvalidDefinition(reason.into()).into()
}

/// How a fixed topology is declared ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Sleep for a fixed amount of time.
    Delay(Duration),
    /// Connect to every listening port until all accept.
    Probe { timeout: Duration, interval: Duration },
}

/// What happens to provisioned hosts once the run is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Leave hosts running and tagged.
    Keep,
    /// Clear the role so a later run can adopt the host.
    Untag,
    Stop,
    Terminate,
}

impl ReleaseMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::Untag => "untag",
            Self::Stop => "stop",
            Self::Terminate => "terminate",
        }
    }
}

impl fmt::Display for ReleaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ReleaseMode {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep" => Ok(Self::Keep),
            "untag" => Ok(Self::Untag),
            "stop" => Ok(Self::Stop),
            "terminate" => Ok(Self::Terminate),
            _ => Err(invalid(format!("unknown release mode '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub user: Option<String>,
    pub key: Option<PathBuf>,
    pub forward_agent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsConfig {
    pub region: String,
    pub ami: Option<String>,
    pub key_name: String,
    pub security_group: String,
    pub backing_instance_type: String,
    pub caching_instance_type: String,
    pub client_instance_type: String,
}

impl AwsConfig {
    pub fn instance_type(&self, role: Role) -> &str {
        match role {
            Role::Backing => &self.backing_instance_type,
            Role::Caching => &self.caching_instance_type,
            Role::Client | Role::None => &self.client_instance_type,
        }
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: AWS_REGION.to_string(),
            ami: None,
            key_name: AWS_KEY_NAME.to_string(),
            security_group: AWS_SECURITY_GROUP.to_string(),
            backing_instance_type: AWS_INSTANCE_TYPE.to_string(),
            caching_instance_type: AWS_INSTANCE_TYPE.to_string(),
            client_instance_type: AWS_INSTANCE_TYPE.to_string(),
        }
    }
}

/// Harness options; built once from the command line.
#[derive(Debug, Clone)]
pub struct Options {
    pub expfile: PathBuf,
    pub filters: Vec<String>,
    pub testbed: Testbed,
    pub machines_file: Option<PathBuf>,
    pub nbacking: usize,
    pub ncaching: usize,
    pub ngroups: usize,
    pub cluster_size: usize,
    pub start_port: u16,
    pub db_start_port: u16,
    pub move_ports: bool,
    pub link: Option<String>,
    pub affinity: bool,
    pub start_cpu: usize,
    pub max_cpus: usize,
    pub perf_server: Option<usize>,
    pub part: Option<String>,
    pub killall: bool,
    /// Dump the backing databases after populate.
    pub dump_db: bool,
    /// Restore the backing databases instead of running populate.
    pub load_db: bool,
    pub dumps_dir: PathBuf,
    pub prep_only: bool,
    pub prep_cmd: Option<String>,
    pub update_cmd: Option<String>,
    pub release: ReleaseMode,
    pub ssh: SshConfig,
    pub aws: AwsConfig,
    pub results_dir: PathBuf,
    pub remote_dir: String,
    pub ramfs: PathBuf,
    pub readiness: Readiness,
    pub provision_timeout: Duration,
    pub ssh_timeout: Duration,
    pub db_ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            expfile: PathBuf::from(EXPFILE),
            filters: Vec::new(),
            testbed: Testbed::Local,
            machines_file: None,
            nbacking: NBACKING,
            ncaching: NCACHING,
            ngroups: NGROUPS,
            cluster_size: CLUSTER_SIZE,
            start_port: START_PORT,
            db_start_port: DB_START_PORT,
            move_ports: false,
            link: None,
            affinity: false,
            start_cpu: 0,
            max_cpus: 24,
            perf_server: None,
            part: None,
            killall: false,
            dump_db: false,
            load_db: false,
            dumps_dir: PathBuf::from(DUMPS_DIR),
            prep_only: false,
            prep_cmd: None,
            update_cmd: None,
            release: ReleaseMode::Stop,
            ssh: SshConfig {
                user: None,
                key: None,
                forward_agent: true,
            },
            aws: AwsConfig::default(),
            results_dir: PathBuf::from(RESULTS_DIR),
            remote_dir: REMOTE_DIR.to_string(),
            ramfs: PathBuf::from(RAMFS),
            readiness: Readiness::Delay(Duration::from_secs(
                READINESS_DELAY_SECS,
            )),
            provision_timeout: Duration::from_secs(PROVISION_TIMEOUT_SECS),
            ssh_timeout: Duration::from_secs(SSH_TIMEOUT_SECS),
            db_ready_timeout: Duration::from_secs(DB_READY_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
        }
    }
}

impl Options {
    pub fn servers(&self) -> usize {
        self.nbacking + self.ncaching
    }

    /// Number of database instances when pequod servers are backed by
    /// postgres: one per backing slot, or one per caching slot if there are
    /// no backing slots.
    pub fn ndbs(&self) -> usize {
        if self.nbacking > 0 {
            self.nbacking
        } else {
            self.ncaching
        }
    }

    /// Directory holding the database archives of a definition; database
    /// `s` is stored in `pequod_<s>` within it.
    pub fn db_archive(&self, exp: &str, def: &str) -> PathBuf {
        self.dumps_dir
            .join(exp)
            .join(def)
            .join(format!("nshard_{}", self.ndbs()))
    }

    pub fn default_probe() -> Readiness {
        Readiness::Probe {
            timeout: Duration::from_secs(READINESS_TIMEOUT_SECS),
            interval: Duration::from_millis(500),
        }
    }

    pub fn check(&self) -> Result<(), Report> {
        if self.servers() == 0 {
            return Err(invalid(
                "at least one backing or caching server is needed",
            ));
        }
        if self.ngroups == 0 {
            return Err(invalid("at least one client group is needed"));
        }
        if self.cluster_size == 0 {
            return Err(invalid("cluster size should be positive"));
        }
        if self.testbed == Testbed::Baremetal && self.machines_file.is_none() {
            return Err(invalid("the baremetal testbed needs a machines file"));
        }
        Ok(())
    }

    pub fn ssh_user(&self) -> Option<String> {
        match (&self.ssh.user, self.testbed) {
            (Some(user), _) => Some(user.clone()),
            (None, Testbed::Aws) => Some(AWS_USER.to_string()),
            (None, _) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"
exps:
  - name: evict-policy
    defs:
      - name: no-evict
        def_part: twitternew
        backendcmd: ./obj/pqserver
        cachecmd: ./obj/pqserver
        clientcmd: ./obj/pqserver --twitternew
      - name: lru-tomb
        def_part: twitternew
        backendcmd: ./obj/pqserver
        cachecmd: ./obj/pqserver --evict-tomb
        clientcmd: ./obj/pqserver --twitternew
      - name: multi-sink-tomb
        def_part: twitternew
        backendcmd: ./obj/pqserver
        cachecmd: ./obj/pqserver --evict-multi
        clientcmd: ./obj/pqserver --twitternew
        disabled: true
    plot:
      type: line
      data:
        - from: client
          attr: wall_time
      lines: [no-evict, lru-tomb]
      points: [0, 5]
      xlabel: Unsubscribe rate
      ylabel: Runtime (s)
  - name: postgres
    defs:
      - def_db_type: postgres
        def_db_compare: true
        def_db_sql_script: scripts/exp/twitter-pg-schema.sql
        populatecmd: ./obj/pqserver --dbshim
        clientcmd: ./obj/pqserver --dbshim
"#;

    fn names(selected: Vec<(&Experiment, &WorkloadDef)>) -> Vec<String> {
        selected
            .into_iter()
            .map(|(_, def)| def.display_name().to_string())
            .collect()
    }

    #[test]
    fn parse_file() {
        let file = ExperimentFile::parse(FILE).unwrap();
        assert_eq!(file.exps.len(), 2);
        let evict = &file.exps[0];
        assert_eq!(evict.defs.len(), 3);
        let cache_cmd = evict.defs[1].cache_cmd.as_deref();
        assert_eq!(cache_cmd, Some("./obj/pqserver --evict-tomb"));
        let plot = evict.plot.as_ref().unwrap();
        assert_eq!(plot.data[0].attr, "wall_time");

        let postgres = &file.exps[1].defs[0];
        assert_eq!(postgres.comparison(), Some(Comparison::Postgres));
        assert!(!postgres.uses_postgres_backend());
        assert_eq!(postgres.display_name(), "");
    }

    #[test]
    fn glob_filter() {
        let file = ExperimentFile::parse(FILE).unwrap();
        let selected = file.select(&["*-tomb".to_string()]).unwrap();
        assert_eq!(names(selected), vec!["lru-tomb", "multi-sink-tomb"]);
    }

    #[test]
    fn disabled_skipped_without_filters() {
        let file = ExperimentFile::parse(FILE).unwrap();
        let selected = file.select(&[]).unwrap();
        assert_eq!(names(selected), vec!["no-evict", "lru-tomb", ""]);
    }

    #[test]
    fn filter_by_experiment() {
        let file = ExperimentFile::parse(FILE).unwrap();
        let selected = file.select(&["post*".to_string()]).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0.name, "postgres");

        let selected = file.select(&["evict-policy/no-*".to_string()]).unwrap();
        assert_eq!(names(selected), vec!["no-evict"]);
    }

    #[test]
    fn unknown_keys_rejected() {
        let content = r#"
exps:
  - name: x
    defs:
      - clientcmd: a
        backendcmd: b
        cachecmd: c
        servercmd: d
"#;
        let error = ExperimentFile::parse(content).unwrap_err();
        assert!(matches!(
            ExpError::find(&error),
            Some(ExpError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn conflicting_modes_rejected() {
        let mut def = WorkloadDef {
            client_cmd: Some("client".to_string()),
            db_type: Some(DbType::Postgres),
            db_compare: true,
            db_writearound: true,
            ..Default::default()
        };
        assert!(def.validate().is_err());

        def.db_writearound = false;
        assert!(def.validate().is_ok());

        def.redis_compare = true;
        assert!(def.validate().is_err());

        let def = WorkloadDef {
            client_cmd: Some("client".to_string()),
            backend_cmd: Some("server".to_string()),
            ..Default::default()
        };
        assert!(def.validate().is_err());
    }

    #[test]
    fn duplicate_names_rejected() {
        let content = r#"
exps:
  - name: x
    defs:
      - clientcmd: a
        backendcmd: b
        cachecmd: c
      - clientcmd: a
        backendcmd: b
        cachecmd: c
"#;
        assert!(ExperimentFile::parse(content).is_err());

        let content =
            "exps:\n  - name: x\n    defs: []\n  - name: x\n    defs: []\n";
        assert!(ExperimentFile::parse(content).is_err());
    }

    #[test]
    fn json_is_accepted() {
        let content = r#"{"exps": [{"name": "basic", "defs": [
            {"name": "a", "backendcmd": "s", "cachecmd": "s", "clientcmd": "c"}
        ]}]}"#;
        let file = ExperimentFile::parse(content).unwrap();
        assert_eq!(file.exps[0].defs[0].backend_cmd.as_deref(), Some("s"));
    }

    #[test]
    fn release_modes() {
        for mode in [
            ReleaseMode::Keep,
            ReleaseMode::Untag,
            ReleaseMode::Stop,
            ReleaseMode::Terminate,
        ] {
            assert_eq!(mode.name().parse::<ReleaseMode>().unwrap(), mode);
        }
        assert_eq!("untag".parse::<ReleaseMode>().unwrap(), ReleaseMode::Untag);
        let error = "destroy".parse::<ReleaseMode>().unwrap_err();
        assert!(matches!(
            ExpError::find(&error),
            Some(ExpError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn db_archives() {
        let def = WorkloadDef {
            client_cmd: Some("client".to_string()),
            backend_cmd: Some("server".to_string()),
            cache_cmd: Some("server".to_string()),
            db_type: Some(DbType::Postgres),
            db_writearound: true,
            ..Default::default()
        };
        assert!(def.uses_db_archive());
        let plain = WorkloadDef {
            db_writearound: false,
            ..def.clone()
        };
        assert!(!plain.uses_db_archive());

        let options = Options {
            nbacking: 2,
            ..Options::default()
        };
        assert_eq!(
            options.db_archive("writearound", "base"),
            PathBuf::from("dumps/writearound/base/nshard_2")
        );
        let options = Options {
            nbacking: 0,
            ncaching: 3,
            ..Options::default()
        };
        assert_eq!(
            options.db_archive("writearound", "base"),
            PathBuf::from("dumps/writearound/base/nshard_3")
        );
    }

    #[test]
    fn shipped_experiments_are_valid() {
        let content = include_str!("../exp/testexperiments.yml");
        let file = ExperimentFile::parse(content).unwrap();
        let names: Vec<_> =
            file.exps.iter().map(|exp| exp.name.as_str()).collect();
        assert_eq!(names, vec!["basic", "writearound", "eviction", "compare"]);

        // the postgres comparison is disabled by default
        let selected = file.select(&[]).unwrap();
        assert_eq!(selected.len(), 5);
        let selected = file.select(&["compare/postgres".to_string()]).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].1.comparison(), Some(Comparison::Postgres));
    }
}
