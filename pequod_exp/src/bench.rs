use crate::aggregate::{self, Record};
use crate::config::{
    Comparison, Experiment, ExperimentFile, Options, Readiness, WorkloadDef,
    PORT_SHIFT,
};
use crate::error::ExpError;
use crate::machine::{Machine, RemoteCommand};
use crate::process::{Interrupt, ProcessRegistry, ProcessSummary};
use crate::progress::TracingProgressBar;
use crate::testbed::Pool;
use crate::topology::{self, Topology, DB_MANIFEST_FILE, MANIFEST_FILE};
use crate::{args, machines_needed, Host, Role};
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use std::collections::HashMap;
use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::instrument;
use tracing_futures::Instrument;

const LAST_LINK: &str = "last";
const PLOT_FILE: &str = "plot.json";
const CMD_LOG_FILE: &str = "cmd_log.txt";
const STORE_DIR: &str = "store";
const DB_NAME: &str = "pequod";
const KILLALL: &[&str] = &["pqserver", "postgres", "memcached", "redis-server"];
const PG_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    ProvisionTopology,
    StartDatabases,
    StartServers,
    AwaitReadiness,
    Initialize,
    Populate,
    RunClients,
    Collect,
    Teardown,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::ProvisionTopology => "provision_topology",
            Self::StartDatabases => "start_databases",
            Self::StartServers => "start_servers",
            Self::AwaitReadiness => "await_readiness",
            Self::Initialize => "initialize",
            Self::Populate => "populate",
            Self::RunClients => "run_clients",
            Self::Collect => "collect",
            Self::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Done,
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct DefinitionReport {
    pub experiment: String,
    pub definition: String,
    pub result_dir: PathBuf,
    pub phases: Vec<(Phase, PhaseOutcome)>,
    /// Populate and client workers that exited with a non-zero code.
    pub failed_workers: Vec<String>,
    /// The error that ended the definition early, if any.
    pub error: Option<String>,
    pub aggregate: Option<Record>,
    /// Final state of every process spawned for the definition, servers
    /// first, as left by teardown.
    pub processes: Vec<ProcessSummary>,
    /// Set when the run can't go on after this definition: the pool could
    /// not be satisfied or the operator interrupted.
    pub aborts_run: bool,
}

impl DefinitionReport {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.failed_workers.is_empty()
    }

    pub fn outcome(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.phases
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, outcome)| outcome)
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub result_dir: Option<PathBuf>,
    pub definitions: Vec<DefinitionReport>,
    pub interrupted: bool,
    pub error: Option<String>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        !self.interrupted
            && self.error.is_none()
            && self.definitions.iter().all(DefinitionReport::success)
    }
}

/// Values substituted for `{hosts}`, `{nbacking}`, `{ncaching}`,
/// `{ngroups}`, `{resultdir}` and `{part}` in definition commands.
#[derive(Debug, Clone)]
pub struct Placeholders {
    pub hosts: String,
    pub nbacking: usize,
    pub ncaching: usize,
    pub ngroups: usize,
    pub resultdir: String,
    pub part: String,
}

impl Placeholders {
    pub fn substitute(&self, line: &str) -> String {
        line.replace("{hosts}", &self.hosts)
            .replace("{nbacking}", &self.nbacking.to_string())
            .replace("{ncaching}", &self.ncaching.to_string())
            .replace("{ngroups}", &self.ngroups.to_string())
            .replace("{resultdir}", &self.resultdir)
            .replace("{part}", &self.part)
    }
}

/// Every command issued for a definition, one per line.
struct CommandLog {
    file: std::fs::File,
}

impl CommandLog {
    fn create(path: &Path) -> Result<Self, Report> {
        let file = std::fs::File::create(path)
            .wrap_err_with(|| format!("create {}", path.display()))?;
        Ok(Self { file })
    }

    fn record(&mut self, host: &str, command: &RemoteCommand) {
        if let Err(e) = writeln!(self.file, "[{}] {}", host, command) {
            tracing::warn!("error writing command log: {:?}", e);
        }
    }
}

// State of a single definition run.
struct DefinitionRun {
    experiment: String,
    def: WorkloadDef,
    dir: PathBuf,
    log: CommandLog,
    placeholders: Placeholders,
    topology: Option<Topology>,
    clients: Vec<Host>,
    // postgres instances
    databases: Vec<(Host, u16)>,
    // endpoints of the comparison stores
    stores: Vec<(Host, u16)>,
    // store directories to remove at teardown
    scratch: Vec<(Host, PathBuf)>,
    servers: ProcessRegistry,
    // finished build, setup and worker processes
    retired: ProcessRegistry,
    phases: Vec<(Phase, PhaseOutcome)>,
    failed_workers: Vec<String>,
    pool_failed: bool,
}

impl DefinitionRun {
    fn hosts_file(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    fn db_hosts_file(&self) -> PathBuf {
        self.dir.join(DB_MANIFEST_FILE)
    }

    fn file(&self, name: impl AsRef<Path>) -> PathBuf {
        self.dir.join(name)
    }

    // Server and client hosts, each once.
    fn participants(&self) -> Vec<Host> {
        let servers = self.topology.iter().flat_map(|topology| {
            topology.slots().map(|slot| slot.host.clone())
        });
        distinct(servers.chain(self.clients.iter().cloned()))
    }

    fn record(&mut self, phase: Phase, outcome: PhaseOutcome) {
        match &outcome {
            PhaseOutcome::Done => tracing::info!("{} done", phase),
            PhaseOutcome::Skipped => tracing::debug!("{} skipped", phase),
            PhaseOutcome::Failed(e) => {
                tracing::warn!("{} failed: {}", phase, e)
            }
        }
        self.phases.push((phase, outcome));
    }

    // Records the outcome of a phase; `Ok(false)` means it was skipped.
    fn finish(
        &mut self,
        phase: Phase,
        result: Result<bool, Report>,
    ) -> Result<(), Report> {
        match result {
            Ok(true) => {
                self.record(phase, PhaseOutcome::Done);
                Ok(())
            }
            Ok(false) => {
                self.record(phase, PhaseOutcome::Skipped);
                Ok(())
            }
            Err(e) => {
                self.record(phase, PhaseOutcome::Failed(format!("{:#}", e)));
                Err(e)
            }
        }
    }

    // Like `finish`, but worker failures are recorded and the run goes on.
    fn finish_workers(
        &mut self,
        phase: Phase,
        result: Result<bool, Report>,
    ) -> Result<(), Report> {
        if let Err(e) = &result {
            if let Some(ExpError::PartialFailure { failed, .. }) =
                ExpError::find(e)
            {
                self.failed_workers.extend(failed.iter().cloned());
                self.record(phase, PhaseOutcome::Failed(format!("{:#}", e)));
                return Ok(());
            }
        }
        self.finish(phase, result)
    }

    fn summaries(&self) -> Vec<ProcessSummary> {
        let mut summaries = self.servers.summaries();
        summaries.extend(self.retired.summaries());
        summaries
    }
}

/// Everything the sequencer needs, passed around explicitly.
pub struct OrchestratorContext {
    options: Options,
    pool: Box<dyn Pool>,
    interrupt: Interrupt,
    progress: TracingProgressBar,
    user: Option<String>,
    start_port: u16,
    db_start_port: u16,
    run_dir: Option<PathBuf>,
    hosts: HashMap<Role, Vec<Host>>,
}

impl OrchestratorContext {
    pub fn new(
        options: Options,
        pool: Box<dyn Pool>,
        interrupt: Interrupt,
        progress: TracingProgressBar,
    ) -> Self {
        let user = options.ssh_user();
        let start_port = options.start_port;
        let db_start_port = options.db_start_port;
        Self {
            options,
            pool,
            interrupt,
            progress,
            user,
            start_port,
            db_start_port,
            run_dir: None,
            hosts: HashMap::new(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Runs every selected definition in file order, then releases the
    /// pool.
    pub async fn run(&mut self, file: &ExperimentFile) -> RunReport {
        let mut report = RunReport::default();
        let result = self.run_definitions(file, &mut report).await;
        if let Err(e) = result {
            tracing::error!("run aborted: {:?}", e);
            report.interrupted |= ExpError::is_interrupted(&e);
            report.error = Some(format!("{:#}", e));
        }
        report.result_dir = self.run_dir.clone();

        if let Err(e) = self.write_plots(file) {
            tracing::warn!("error writing plot metadata: {:?}", e);
        }
        if let Err(e) = self.release().await {
            tracing::error!("error releasing hosts: {:?}", e);
            report.error.get_or_insert_with(|| format!("{:#}", e));
        }
        self.progress.finish();
        report
    }

    /// Gives every host back to the pool according to the release mode.
    pub async fn release(&mut self) -> Result<(), Report> {
        self.hosts.clear();
        self.pool.release(self.options.release).await
    }

    async fn run_definitions(
        &mut self,
        file: &ExperimentFile,
        report: &mut RunReport,
    ) -> Result<(), Report> {
        self.options.check().wrap_err("invalid options")?;
        let selected = file.select(&self.options.filters)?;
        if selected.is_empty() {
            tracing::warn!("no definition selected");
            return Ok(());
        }

        if self.needs_preparation() {
            self.prepare().await?;
        }

        for (exp, def) in selected {
            self.check_interrupt()?;
            let definition = self.run_definition(exp, def).await?;
            let aborts_run = definition.aborts_run;
            let error = definition.error.clone();
            if definition.success() {
                tracing::info!(
                    "done {}/{}; results are stored at {}",
                    exp.name,
                    def.display_name(),
                    definition.result_dir.display()
                );
            } else {
                tracing::error!(
                    "{}/{} failed (results at {}): {}",
                    exp.name,
                    def.display_name(),
                    definition.result_dir.display(),
                    error.as_deref().unwrap_or("worker failure"),
                );
            }
            report.definitions.push(definition);

            if self.options.move_ports {
                self.start_port = self.start_port.saturating_add(PORT_SHIFT);
                self.db_start_port =
                    self.db_start_port.saturating_add(PORT_SHIFT);
            }
            if aborts_run {
                report.interrupted |= self.interrupt.is_set();
                report.error = error;
                break;
            }
        }
        Ok(())
    }

    fn needs_preparation(&self) -> bool {
        let options = &self.options;
        !options.testbed.is_local()
            && (options.prep_cmd.is_some() || options.update_cmd.is_some())
    }

    /// Resolves every host the run needs and runs the preparation and
    /// update commands on each of them.
    pub async fn prepare(&mut self) -> Result<Vec<Host>, Report> {
        self.options.check().wrap_err("invalid options")?;
        let mut hosts = self.hosts(Role::Backing, self.options.nbacking).await?;
        hosts.extend(self.hosts(Role::Caching, self.options.ncaching).await?);
        hosts.extend(self.hosts(Role::Client, self.options.ngroups).await?);
        let hosts = distinct(hosts);

        let commands: Vec<_> = self
            .options
            .prep_cmd
            .iter()
            .chain(self.options.update_cmd.iter())
            .cloned()
            .collect();
        for command in commands {
            tracing::info!("running `{}` on {} host(s)", command, hosts.len());
            let command = RemoteCommand::new(args!["sh", "-c", command]);
            let runs = hosts.iter().map(|host| {
                let machine = self.machine(host);
                let command = command.clone();
                async move { machine.exec(&command).await }
            });
            for result in futures::future::join_all(runs).await {
                result.wrap_err("prepare hosts")?;
            }
        }
        Ok(hosts)
    }

    fn check_interrupt(&self) -> Result<(), Report> {
        if self.interrupt.is_set() {
            return Err(ExpError::Interrupted.into());
        }
        Ok(())
    }

    fn machine(&self, host: &Host) -> Machine {
        Machine::for_host(host, self.user.clone(), &self.options.ssh)
    }

    fn command(&self, machine: &Machine, line: &str) -> RemoteCommand {
        self.in_remote_dir(machine, RemoteCommand::parse(line))
    }

    // Remote commands run from the checkout, where relative result paths
    // point at the remote copy of the result directory.
    fn in_remote_dir(
        &self,
        machine: &Machine,
        command: RemoteCommand,
    ) -> RemoteCommand {
        if machine.is_local() {
            command
        } else {
            command.cwd(self.options.remote_dir.clone())
        }
    }

    // Path of `path` for commands that don't run from the checkout.
    fn remote_path(&self, machine: &Machine, path: &Path) -> PathBuf {
        if machine.is_local() || path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.options.remote_dir).join(path)
        }
    }

    async fn hosts(
        &mut self,
        role: Role,
        slots: usize,
    ) -> Result<Vec<Host>, Report> {
        let needed = machines_needed(slots, self.options.cluster_size);
        if let Some(hosts) = self.hosts.get(&role) {
            if hosts.len() >= needed {
                return Ok(hosts[..needed].to_vec());
            }
        }
        let hosts = self
            .pool
            .resolve(role, slots, self.options.cluster_size)
            .await
            .wrap_err_with(|| format!("resolve {} {} host(s)", needed, role))?;

        // new hosts may take a while to accept ssh connections
        let timeout = self.options.ssh_timeout;
        let backoff = self.options.poll_interval;
        let waits = hosts.iter().filter(|host| !host.is_local()).map(|host| {
            let machine = self.machine(host);
            async move { machine.wait_reachable(timeout, backoff).await }
        });
        for result in futures::future::join_all(waits).await {
            result?;
        }
        self.hosts.insert(role, hosts.clone());
        Ok(hosts)
    }

    fn run_dir(&mut self) -> Result<PathBuf, Report> {
        if let Some(dir) = &self.run_dir {
            return Ok(dir.clone());
        }
        let results = &self.options.results_dir;
        let now = chrono::Local::now();
        let name = format!("exp_{}", now.format("%Y_%m_%d-%H_%M_%S"));
        let dir = results.join(&name);
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("create {}", dir.display()))?;

        replace_symlink(&name, &results.join(LAST_LINK))?;
        if let Some(link) = &self.options.link {
            replace_symlink(&name, &results.join(link))?;
        }
        self.run_dir = Some(dir.clone());
        Ok(dir)
    }

    fn write_plots(&self, file: &ExperimentFile) -> Result<(), Report> {
        let run_dir = match &self.run_dir {
            Some(dir) => dir,
            None => return Ok(()),
        };
        for exp in &file.exps {
            let exp_dir = run_dir.join(&exp.name);
            if let (Some(plot), true) = (&exp.plot, exp_dir.is_dir()) {
                let path = exp_dir.join(PLOT_FILE);
                let content = serde_json::to_string_pretty(plot)
                    .wrap_err("serialize plot")?;
                std::fs::write(&path, content)
                    .wrap_err_with(|| format!("write {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Runs one definition through every phase. The returned error is only
    /// set for failures that should stop the whole run before anything was
    /// attempted (e.g. the result directory can't be created).
    #[instrument(
        skip_all,
        fields(exp = %exp.name, def = %def.display_name())
    )]
    pub async fn run_definition(
        &mut self,
        exp: &Experiment,
        def: &WorkloadDef,
    ) -> Result<DefinitionReport, Report> {
        tracing::info!("running definition");
        let dir = self.run_dir()?.join(&exp.name).join(def.display_name());
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("create {}", dir.display()))?;
        let log = CommandLog::create(&dir.join(CMD_LOG_FILE))?;
        let part = self.options.part.clone().or_else(|| def.part.clone());
        let placeholders = Placeholders {
            hosts: dir.join(MANIFEST_FILE).display().to_string(),
            nbacking: self.options.nbacking,
            ncaching: self.options.ncaching,
            ngroups: self.options.ngroups,
            resultdir: dir.display().to_string(),
            part: part.unwrap_or_default(),
        };

        let mut run = DefinitionRun {
            experiment: exp.name.clone(),
            def: def.clone(),
            dir,
            log,
            placeholders,
            topology: None,
            clients: Vec::new(),
            databases: Vec::new(),
            stores: Vec::new(),
            scratch: Vec::new(),
            servers: ProcessRegistry::new(),
            retired: ProcessRegistry::new(),
            phases: Vec::new(),
            failed_workers: Vec::new(),
            pool_failed: false,
        };

        let result = self.sequence(&mut run).await;
        let interrupted =
            matches!(&result, Err(e) if ExpError::is_interrupted(e));

        // collect whatever was produced, unless the operator wants out
        let collect = !interrupted && run.topology.is_some();
        if collect {
            let collected = self.collect(&mut run).await;
            run.record(Phase::Collect, outcome(collected));
        } else {
            run.record(Phase::Collect, PhaseOutcome::Skipped);
        }
        let aggregate = if collect {
            aggregate::aggregate_dir(&run.dir).unwrap_or_else(|e| {
                tracing::warn!("error aggregating results: {:?}", e);
                None
            })
        } else {
            None
        };

        let teardown = self.teardown(&mut run).await;
        run.record(Phase::Teardown, outcome(teardown));

        let error = result.err().map(|e| {
            tracing::debug!("{:?}", e);
            format!("{:#}", e)
        });
        Ok(DefinitionReport {
            processes: run.summaries(),
            experiment: run.experiment,
            definition: run.def.display_name().to_string(),
            result_dir: run.dir,
            phases: run.phases,
            failed_workers: run.failed_workers,
            error,
            aggregate,
            aborts_run: interrupted || run.pool_failed,
        })
    }

    // Build through RunClients; stops at the first fatal failure.
    async fn sequence(
        &mut self,
        run: &mut DefinitionRun,
    ) -> Result<(), Report> {
        self.check_interrupt()?;
        let result = self.build(run).await;
        run.finish(Phase::Build, result)?;

        self.check_interrupt()?;
        let result = self.provision(run).await;
        run.finish(Phase::ProvisionTopology, result)?;

        self.check_interrupt()?;
        let result = self.start_databases(run).await;
        run.finish(Phase::StartDatabases, result)?;

        self.check_interrupt()?;
        let result = self.start_servers(run).await;
        run.finish(Phase::StartServers, result)?;

        self.check_interrupt()?;
        let result = self.await_readiness(run).await;
        run.finish(Phase::AwaitReadiness, result)?;

        self.check_interrupt()?;
        let result = self.initialize(run).await;
        run.finish(Phase::Initialize, result)?;

        self.check_interrupt()?;
        let result = self.populate(run).await;
        run.finish_workers(Phase::Populate, result)?;

        self.check_interrupt()?;
        let result = self.run_clients(run).await;
        run.finish_workers(Phase::RunClients, result)?;
        Ok(())
    }

    async fn build(&mut self, run: &mut DefinitionRun) -> Result<bool, Report> {
        let build = match &run.def.build {
            Some(build) => run.placeholders.substitute(build),
            None => return Ok(false),
        };
        let hosts = distinct(self.server_hosts(run).await?);

        // build commands are shell lines
        let mut registry = ProcessRegistry::new();
        for (index, host) in hosts.iter().enumerate() {
            let machine = self.machine(host);
            machine.mkdir(self.remote_path(&machine, &run.dir)).await?;
            let sink = if hosts.len() == 1 {
                run.file("fart_build.txt")
            } else {
                run.file(format!("fart_build_{}.txt", index))
            };
            let command = self.in_remote_dir(
                &machine,
                RemoteCommand::new(args!["sh", "-c", build.clone()]),
            );
            run.log.record(machine.name(), &command);
            let name = format!("build_{}", index);
            registry.register(machine.spawn(name, &command, &sink, &sink)?);
        }
        self.wait_workers(run, registry, "build")
            .await
            .map_err(|e| {
                if ExpError::is_interrupted(&e) {
                    e
                } else {
                    e.wrap_err("build failed")
                }
            })?;
        Ok(true)
    }

    // Backing and caching hosts, resolving them if needed.
    async fn server_hosts(
        &mut self,
        run: &mut DefinitionRun,
    ) -> Result<Vec<Host>, Report> {
        let nbacking = self.options.nbacking;
        let ncaching = self.options.ncaching;
        let result = async {
            let mut hosts = self.hosts(Role::Backing, nbacking).await?;
            hosts.extend(self.hosts(Role::Caching, ncaching).await?);
            Ok::<_, Report>(hosts)
        }
        .await;
        if result.is_err() {
            run.pool_failed = true;
        }
        result
    }

    async fn provision(
        &mut self,
        run: &mut DefinitionRun,
    ) -> Result<bool, Report> {
        let nbacking = self.options.nbacking;
        let ncaching = self.options.ncaching;
        let backing = self.hosts(Role::Backing, nbacking).await;
        let caching = self.hosts(Role::Caching, ncaching).await;
        let clients = self.hosts(Role::Client, self.options.ngroups).await;
        let (backing, caching, clients) = match (backing, caching, clients) {
            (Ok(b), Ok(c), Ok(cl)) => (b, c, cl),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                run.pool_failed = true;
                return Err(e);
            }
        };

        let topology = topology::build_topology(
            &backing,
            &caching,
            nbacking,
            ncaching,
            self.options.cluster_size,
            self.start_port,
        )?;
        topology.write(run.hosts_file())?;

        // database instances
        if run.def.uses_postgres_backend() {
            let ndbs = self.options.ndbs();
            for slot in topology.slots().take(ndbs) {
                let port = self.db_port(slot.index)?;
                run.databases.push((slot.host.clone(), port));
            }
        } else if run.def.comparison() == Some(Comparison::Postgres) {
            let first = topology.slots().nth(nbacking).ok_or_else(|| {
                ExpError::InvalidDefinition(
                    "comparing against a database needs at least one \
                     caching slot"
                        .to_string(),
                )
            })?;
            run.databases.push((first.host.clone(), self.db_start_port));
        }
        if !run.databases.is_empty() {
            let instances: Vec<_> = run
                .databases
                .iter()
                .map(|(host, port)| (host.address.clone(), *port))
                .collect();
            topology::write_db_manifest(run.db_hosts_file(), &instances)?;
        }
        run.topology = Some(topology);
        run.clients = clients;

        // every participant gets the manifests
        for host in run.participants() {
            let machine = self.machine(&host);
            if machine.is_local() {
                continue;
            }
            let dir = self.remote_path(&machine, &run.dir);
            machine.mkdir(&dir).await?;
            machine
                .copy_to(run.hosts_file(), dir.join(MANIFEST_FILE))
                .await
                .wrap_err("copy manifest")?;
            if !run.databases.is_empty() {
                machine
                    .copy_to(run.db_hosts_file(), dir.join(DB_MANIFEST_FILE))
                    .await
                    .wrap_err("copy db manifest")?;
            }
        }
        if self.options.killall {
            self.killall(run).await;
        }
        Ok(true)
    }

    fn db_port(&self, index: usize) -> Result<u16, Report> {
        u16::try_from(self.db_start_port as usize + index).map_err(|_| {
            let reason = format!("database {} does not fit a port", index);
            ExpError::InvalidDefinition(reason).into()
        })
    }

    // Directory for database and redis files on `host`.
    async fn store_dir(
        &self,
        run: &mut DefinitionRun,
        host: &Host,
    ) -> Result<PathBuf, Report> {
        let machine = self.machine(host);
        let dir = if run.def.db_in_memory {
            let ramfs = &self.options.ramfs;
            let check = RemoteCommand::new(args!["df", ramfs.display()]);
            run.log.record(machine.name(), &check);
            machine.exec(&check).await.wrap_err_with(|| {
                format!(
                    "memory filesystem {} not found on {}",
                    ramfs.display(),
                    machine.name()
                )
            })?;
            let relative =
                run.dir.strip_prefix("/").unwrap_or(run.dir.as_path());
            ramfs.join(relative).join(STORE_DIR)
        } else {
            run.dir.join(STORE_DIR)
        };
        let on_host = self.remote_path(&machine, &dir);
        machine.mkdir(&on_host).await?;
        let known = run.scratch.iter().any(|(h, d)| h == host && d == &on_host);
        if run.def.db_in_memory && !known {
            run.scratch.push((host.clone(), on_host));
        }
        Ok(dir)
    }

    async fn start_databases(
        &mut self,
        run: &mut DefinitionRun,
    ) -> Result<bool, Report> {
        let topology = match &run.topology {
            Some(topology) => topology.clone(),
            None => return Ok(false),
        };
        let caching: Vec<_> = topology
            .slots()
            .filter(|slot| slot.role == Role::Caching)
            .cloned()
            .collect();
        let mut started = false;

        if !run.databases.is_empty() {
            // a compared database serves every caching slot
            let ncpus = if run.def.db_compare {
                self.options.ncaching
            } else {
                1
            };
            let databases = run.databases.clone();
            for (index, (host, port)) in databases.into_iter().enumerate() {
                self.start_postgres(run, index, &host, port, ncpus).await?;
            }
            started = true;
        }

        match run.def.comparison() {
            Some(Comparison::Redis) => {
                for (index, slot) in caching.iter().enumerate() {
                    self.start_redis(run, index, &slot.host, slot.port).await?;
                }
                started = true;
            }
            Some(Comparison::Memcache) => {
                for (index, slot) in caching.iter().enumerate() {
                    self.start_memcache(run, index, &slot.host, slot.port)?;
                }
                started = true;
            }
            Some(Comparison::Postgres) => {
                run.stores = run.databases.clone();
            }
            None => {}
        }
        if matches!(
            run.def.comparison(),
            Some(Comparison::Redis | Comparison::Memcache)
        ) {
            run.stores = caching
                .iter()
                .map(|slot| (slot.host.clone(), slot.port))
                .collect();
        }
        Ok(started)
    }

    async fn start_postgres(
        &mut self,
        run: &mut DefinitionRun,
        index: usize,
        host: &Host,
        port: u16,
        ncpus: usize,
    ) -> Result<(), Report> {
        let machine = self.machine(host);
        let sink = run.file(format!("fart_db_{}.txt", index));
        let store = self.store_dir(run, host).await?;
        let db_path = store.join(format!("postgres_{}", index));
        let address = host.address.clone();

        let initdb = RemoteCommand::new(args![
            "initdb",
            db_path.display(),
            "-E",
            "utf8",
            "-A",
            "trust"
        ]);
        self.run_sync(run, &machine, "initdb", initdb, &sink).await?;

        let mut postgres = RemoteCommand::new(args![
            "postgres",
            "-h",
            address,
            "-p",
            port,
            "-D",
            db_path.display()
        ]);
        if let Some(flags) = &run.def.db_flags {
            let flags = flags.split_whitespace().map(String::from);
            postgres = postgres.args(flags);
        }
        if self.options.affinity {
            let cpus: Vec<_> = (0..ncpus.max(1))
                .map(|c| (self.options.start_cpu + index + c).to_string())
                .collect();
            postgres = postgres.wrap(args!["numactl", "-C", cpus.join(",")]);
        }
        let postgres = self.in_remote_dir(&machine, postgres);
        run.log.record(machine.name(), &postgres);
        let name = format!("postgres_{}", index);
        let handle = machine.spawn(name, &postgres, &sink, &sink)?;
        run.servers.register(handle);

        self.await_postgres(&machine, &address, port).await?;

        let createdb = RemoteCommand::new(args![
            "createdb", "-h", address, "-p", port, DB_NAME
        ]);
        self.run_sync(run, &machine, "createdb", createdb, &sink).await?;

        if let Some(script) = run.def.db_sql_script.clone() {
            let psql = RemoteCommand::new(args![
                "psql", "-h", address, "-p", port, DB_NAME, "-f", script
            ]);
            self.run_sync(run, &machine, "psql", psql, &sink).await?;
        }
        if let Some(archive) = run.def.db_import.clone() {
            let restore = RemoteCommand::new(args![
                "pg_restore", "-a", "-h", address, "-p", port, "-d", DB_NAME,
                "-Fc", archive
            ]);
            self.run_sync(run, &machine, "pg_restore", restore, &sink)
                .await?;
        }
        Ok(())
    }

    async fn await_postgres(
        &self,
        machine: &Machine,
        address: &str,
        port: u16,
    ) -> Result<(), Report> {
        let ready = RemoteCommand::new(args![
            "pg_isready", "-q", "-h", address, "-p", port
        ]);
        let poll = async {
            while machine.exec(&ready).await.is_err() {
                tokio::time::sleep(PG_POLL_INTERVAL).await;
            }
        };
        let timeout = self.options.db_ready_timeout;
        tokio::select! {
            result = tokio::time::timeout(timeout, poll) => result.map_err(|_| {
                ExpError::ProvisioningTimeout {
                    what: format!("postgres on {}:{}", address, port),
                    secs: timeout.as_secs(),
                }
                .into()
            }),
            _ = self.interrupt.fired() => Err(ExpError::Interrupted.into()),
        }
    }

    async fn start_redis(
        &mut self,
        run: &mut DefinitionRun,
        index: usize,
        host: &Host,
        port: u16,
    ) -> Result<(), Report> {
        let machine = self.machine(host);
        let store = self.store_dir(run, host).await?;
        let data_dir = store.join(format!("redis_{}", index));
        machine.mkdir(self.remote_path(&machine, &data_dir)).await?;

        let mut redis = RemoteCommand::new(args![
            "redis-server",
            "--port",
            port,
            "--dir",
            data_dir.display(),
            "--pidfile",
            store.join(format!("redis.pid.{}", index)).display(),
            "--save",
            "",
            "--protected-mode",
            "no"
        ]);
        if self.options.affinity {
            let cpu = self.options.start_cpu + index;
            redis = redis.wrap(args!["numactl", "-C", cpu]);
        }
        let redis = self.in_remote_dir(&machine, redis);
        let sink = run.file(format!("fart_redis_{}.txt", index));
        run.log.record(machine.name(), &redis);
        let name = format!("redis_{}", index);
        let handle = machine.spawn(name, &redis, &sink, &sink)?;
        run.servers.register(handle);
        Ok(())
    }

    fn start_memcache(
        &self,
        run: &mut DefinitionRun,
        index: usize,
        host: &Host,
        port: u16,
    ) -> Result<(), Report> {
        let machine = self.machine(host);
        let mut memcached = RemoteCommand::new(args!["memcached"]);
        if let Some(extra) = &run.def.memcache_args {
            let extra = extra.split_whitespace().map(String::from);
            memcached = memcached.args(extra);
        }
        memcached = memcached.args(args!["-t", 1, "-p", port]);
        if self.options.affinity {
            let cpu = self.options.start_cpu + index;
            memcached = memcached.wrap(args!["numactl", "-C", cpu]);
        }
        let memcached = self.in_remote_dir(&machine, memcached);
        let sink = run.file(format!("fart_memcache_{}.txt", index));
        run.log.record(machine.name(), &memcached);
        let name = format!("memcache_{}", index);
        let handle = machine.spawn(name, &memcached, &sink, &sink)?;
        run.servers.register(handle);
        Ok(())
    }

    async fn start_servers(
        &mut self,
        run: &mut DefinitionRun,
    ) -> Result<bool, Report> {
        if run.def.comparison().is_some() {
            return Ok(false);
        }
        let topology = match &run.topology {
            Some(topology) => topology.clone(),
            None => return Ok(false),
        };
        let ndbs = self.options.ndbs();
        for slot in topology.slots() {
            let line = match slot.role {
                Role::Backing => run.def.backend_cmd.as_deref(),
                _ => run.def.cache_cmd.as_deref(),
            }
            .map(|line| run.placeholders.substitute(line))
            .ok_or_else(|| {
                let reason = "missing server command".to_string();
                ExpError::InvalidDefinition(reason)
            })?;

            let machine = self.machine(&slot.host);
            let mut command = self.command(&machine, &line);

            // database arguments
            if slot.index < ndbs {
                if run.def.uses_berkeleydb() {
                    let store = self.store_dir(run, &slot.host).await?;
                    command = command.args(args![
                        "--berkeleydb",
                        format!("--dbname={}_{}", DB_NAME, slot.index),
                        format!("--dbenvpath={}", store.display())
                    ]);
                } else if let Some((db_host, db_port)) =
                    run.databases.get(slot.index)
                {
                    command = command.args(args![
                        "--postgres",
                        format!("--dbname={}", DB_NAME),
                        format!("--dbhost={}", db_host.address),
                        format!("--dbport={}", db_port)
                    ]);
                    if run.def.db_writearound {
                        command = command.arg("--monitordb");
                    }
                }
            }

            command = command
                .arg(format!("-H={}", run.hosts_file().display()))
                .arg(format!("-B={}", self.options.nbacking));
            if !run.placeholders.part.is_empty() {
                command = command.arg(format!("-P={}", run.placeholders.part));
            }
            command = command.arg(format!("-kl={}", slot.port));

            // prefixes, outermost first
            let mut prefix = Vec::new();
            if self.options.affinity {
                let cpu = self.options.start_cpu + slot.index;
                prefix.extend(args!["numactl", "-C", cpu]);
            }
            if self.options.perf_server == Some(slot.index) {
                let output = run.file(format!("perf-{}.dat", slot.index));
                prefix.extend(args![
                    "perf",
                    "record",
                    "-g",
                    "-o",
                    output.display()
                ]);
            }
            if !prefix.is_empty() {
                command = command.wrap(prefix);
            }

            let sink = run.file(format!("fart_srv_{}.txt", slot.index));
            run.log.record(machine.name(), &command);
            let name = format!("server_{}", slot.index);
            let handle = machine.spawn(name, &command, &sink, &sink)?;
            run.servers.register(handle);
        }
        Ok(true)
    }

    async fn await_readiness(
        &mut self,
        run: &mut DefinitionRun,
    ) -> Result<bool, Report> {
        if run.servers.is_empty() {
            return Ok(false);
        }
        match self.options.readiness {
            Readiness::Delay(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.interrupt.fired() => {
                        return Err(ExpError::Interrupted.into());
                    }
                }
            }
            Readiness::Probe { timeout, interval } => {
                let endpoints = endpoints(run);
                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    let dials = endpoints.iter().map(|(address, port)| {
                        accepts(address, *port, interval)
                    });
                    let accepted = futures::future::join_all(dials).await;
                    let pending = accepted.iter().filter(|ok| !**ok).count();
                    if pending == 0 {
                        break;
                    }
                    // a server that died never starts accepting
                    check_servers(&mut run.servers)?;
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ExpError::ProvisioningTimeout {
                            what: format!(
                                "{} of {} endpoint(s) to accept connections",
                                pending,
                                endpoints.len()
                            ),
                            secs: timeout.as_secs(),
                        }
                        .into());
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = self.interrupt.fired() => {
                            return Err(ExpError::Interrupted.into());
                        }
                    }
                }
            }
        }
        check_servers(&mut run.servers)?;
        Ok(true)
    }

    async fn initialize(
        &mut self,
        run: &mut DefinitionRun,
    ) -> Result<bool, Report> {
        let line = match &run.def.init_cmd {
            Some(line) => run.placeholders.substitute(line),
            None => return Ok(false),
        };
        let host = run.clients.first().cloned().ok_or_else(|| {
            ExpError::InvalidDefinition("no client host".to_string())
        })?;
        let machine = self.machine(&host);
        let mut command = self
            .command(&machine, &line)
            .args(self.store_args(run, 1, false));
        if self.options.affinity {
            let cpu = self.options.start_cpu + self.options.servers();
            command = command.wrap(args!["numactl", "-C", cpu]);
        }
        let sink = run.file("fart_init.txt");
        tracing::info!("initializing cache servers");
        self.run_sync(run, &machine, "init", command, &sink).await?;
        Ok(true)
    }

    // Loads the backend, from the populate workers or from a database
    // archive, and dumps it when asked to.
    async fn populate(
        &mut self,
        run: &mut DefinitionRun,
    ) -> Result<bool, Report> {
        let archive = run.def.uses_db_archive();
        let mut done = false;
        if self.options.load_db && archive {
            self.restore_databases(run).await?;
            done = true;
        } else if let Some(line) = run.def.populate_cmd.clone() {
            let line = run.placeholders.substitute(&line);
            self.run_populate(run, &line).await?;
            done = true;
        }
        if self.options.dump_db && archive {
            self.dump_databases(run).await?;
            done = true;
        }
        Ok(done)
    }

    async fn run_populate(
        &mut self,
        run: &mut DefinitionRun,
        line: &str,
    ) -> Result<(), Report> {
        let npop = if run.def.single_pop {
            1
        } else {
            self.options.ngroups
        };
        tracing::info!("populating backend with {} worker(s)", npop);
        let mut registry = ProcessRegistry::new();
        for index in 0..npop {
            let host = &run.clients[index % run.clients.len()];
            let machine = self.machine(host);
            let mut command = self
                .command(&machine, line)
                .args(self.store_args(run, npop, true))
                .args(args![
                    format!("--ngroups={}", npop),
                    format!("--groupid={}", index)
                ]);
            if let Some(cpus) = self.worker_cpus(index, npop, npop > 1) {
                command = command.wrap(args!["numactl", "-C", cpus]);
            }
            let sink = run.file(format!("fart_pop_{}.txt", index));
            run.log.record(machine.name(), &command);
            let name = format!("populate_{}", index);
            registry.register(machine.spawn(name, &command, &sink, &sink)?);
        }
        self.wait_workers(run, registry, "populate").await
    }

    // Restores every backing database from the archive an earlier run
    // dumped.
    async fn restore_databases(
        &mut self,
        run: &mut DefinitionRun,
    ) -> Result<(), Report> {
        let archive = self
            .options
            .db_archive(&run.experiment, run.def.display_name());
        tracing::info!("populating backend from {}", archive.display());
        let mut registry = ProcessRegistry::new();
        let databases = run.databases.clone();
        for (index, (host, port)) in databases.into_iter().enumerate() {
            let machine = self.machine(&host);
            let file = archive.join(format!("{}_{}", DB_NAME, index));
            let restore = RemoteCommand::new(args![
                "pg_restore",
                "-h",
                host.address,
                "-p",
                port,
                "-d",
                DB_NAME,
                "-a",
                file.display()
            ]);
            let restore = self.in_remote_dir(&machine, restore);
            let sink = run.file(format!("fart_db_{}.txt", index));
            run.log.record(machine.name(), &restore);
            let name = format!("restore_{}", index);
            registry.register(machine.spawn(name, &restore, &sink, &sink)?);
        }
        self.wait_workers(run, registry, "restore").await
    }

    // Dumps every backing database to the definition's archive, replacing
    // an earlier dump.
    async fn dump_databases(
        &mut self,
        run: &mut DefinitionRun,
    ) -> Result<(), Report> {
        let archive = self
            .options
            .db_archive(&run.experiment, run.def.display_name());
        tracing::info!("dumping backend to {}", archive.display());
        let mut registry = ProcessRegistry::new();
        let databases = run.databases.clone();
        for (index, (host, port)) in databases.into_iter().enumerate() {
            let machine = self.machine(&host);
            let file = archive.join(format!("{}_{}", DB_NAME, index));

            // pg_dump wants to create the directory itself
            let on_host = self.remote_path(&machine, &file);
            let rm = RemoteCommand::new(args!["rm", "-rf", on_host.display()]);
            run.log.record(machine.name(), &rm);
            machine.exec(&rm).await?;
            machine.mkdir(self.remote_path(&machine, &archive)).await?;

            let dump = RemoteCommand::new(args![
                "pg_dump",
                "-h",
                host.address,
                "-p",
                port,
                "-f",
                file.display(),
                "-a",
                "-F",
                "d",
                DB_NAME
            ]);
            let dump = self.in_remote_dir(&machine, dump);
            let sink = run.file(format!("fart_db_{}.txt", index));
            run.log.record(machine.name(), &dump);
            let name = format!("dump_{}", index);
            registry.register(machine.spawn(name, &dump, &sink, &sink)?);
        }
        self.wait_workers(run, registry, "dump").await
    }

    async fn run_clients(
        &mut self,
        run: &mut DefinitionRun,
    ) -> Result<bool, Report> {
        let line = run
            .def
            .client_cmd
            .as_deref()
            .map(|line| run.placeholders.substitute(line))
            .ok_or_else(|| {
                ExpError::InvalidDefinition("clientcmd is required".to_string())
            })?;
        let ngroups = self.options.ngroups;
        tracing::info!("starting {} client group(s)", ngroups);
        let mut registry = ProcessRegistry::new();
        for group in 0..ngroups {
            let host = &run.clients[group % run.clients.len()];
            let machine = self.machine(host);
            let mut command = self
                .command(&machine, &line)
                .args(self.store_args(run, ngroups, true))
                .args(args![
                    format!("--ngroups={}", ngroups),
                    format!("--groupid={}", group)
                ]);
            if let Some(cpus) = self.worker_cpus(group, ngroups, true) {
                command = command.wrap(args!["numactl", "-C", cpus]);
            }
            let prefix = aggregate::CLIENT_OUTPUT_PREFIX;
            let output = run.file(format!("{}{}.json", prefix, group));
            let sink = run.file(format!("fart_app_{}.txt", group));
            run.log.record(machine.name(), &command);
            let name = format!("client_{}", group);
            registry.register(machine.spawn(name, &command, &output, &sink)?);
        }
        self.wait_workers(run, registry, "clients").await?;
        Ok(true)
    }

    // Waits for every process in `registry`, which is then kept for the
    // definition report.
    async fn wait_workers(
        &self,
        run: &mut DefinitionRun,
        mut registry: ProcessRegistry,
        what: &'static str,
    ) -> Result<(), Report> {
        self.progress.start(registry.len() as u64, what);
        let result = registry
            .wait_all(&self.interrupt, &self.progress)
            .instrument(tracing::info_span!("workers", phase = what))
            .await;
        run.retired.absorb(registry);
        result.map(|_| ())
    }

    // Arguments telling a client-side process where the data lives.
    fn store_args(
        &self,
        run: &DefinitionRun,
        nworkers: usize,
        writearound: bool,
    ) -> Vec<String> {
        let mut store_args = Vec::new();
        match (run.def.comparison(), run.databases.first()) {
            (Some(Comparison::Postgres), Some((db_host, db_port))) => {
                let pool = db_pool_size(self.options.ncaching, nworkers);
                store_args.push(format!("--dbport={}", db_port));
                store_args.push(format!("--dbpool-max={}", pool));
                if !db_host.is_local() {
                    store_args.push(format!("--dbhost={}", db_host.address));
                }
            }
            _ => {
                store_args.push(format!("-H={}", run.hosts_file().display()));
                store_args.push(format!("-B={}", self.options.nbacking));
            }
        }
        if writearound && run.def.db_writearound {
            let hostfile = run.db_hosts_file();
            store_args.push("--writearound".to_string());
            store_args.push(format!("--dbhostfile={}", hostfile.display()));
        }
        store_args
    }

    // CPUs for client-side worker `index` out of `nworkers` when pinning.
    fn worker_cpus(
        &self,
        index: usize,
        nworkers: usize,
        share: bool,
    ) -> Option<String> {
        if !self.options.affinity {
            return None;
        }
        let first = self.options.start_cpu + self.options.servers();
        let shared = client_cpu_list(first, nworkers, self.options.max_cpus);
        Some(match shared {
            Some(list) if share => list,
            _ => (first + index).to_string(),
        })
    }

    // Runs `command` to completion with its output in `sink`.
    async fn run_sync(
        &self,
        run: &mut DefinitionRun,
        machine: &Machine,
        name: &str,
        command: RemoteCommand,
        sink: &Path,
    ) -> Result<(), Report> {
        let command = self.in_remote_dir(machine, command);
        run.log.record(machine.name(), &command);
        let mut handle = machine.spawn(name, &command, sink, sink)?;
        let code = tokio::select! {
            code = handle.wait() => Some(code),
            _ = self.interrupt.fired() => None,
        };
        if code.is_none() {
            handle.kill().await;
        }
        run.retired.register(handle);
        match code {
            Some(code) => match code? {
                0 => Ok(()),
                code => Err(ExpError::RemoteCommand {
                    host: machine.name().to_string(),
                    command: command.to_string(),
                    code: Some(code),
                }
                .into()),
            },
            None => Err(ExpError::Interrupted.into()),
        }
    }

    async fn collect(
        &mut self,
        run: &mut DefinitionRun,
    ) -> Result<bool, Report> {
        for host in run.participants() {
            let machine = self.machine(&host);
            if machine.is_local() {
                continue;
            }
            let from = self.remote_path(&machine, &run.dir).join("*");
            if let Err(e) = machine.copy_from(&from, &run.dir).await {
                let name = machine.name();
                tracing::warn!("missing results from {}: {:?}", name, e);
            }
        }
        Ok(true)
    }

    async fn teardown(
        &mut self,
        run: &mut DefinitionRun,
    ) -> Result<bool, Report> {
        tracing::debug!("killing {} process(es)", run.servers.running());
        run.servers.kill_all().await;
        run.retired.kill_all().await;
        if self.options.killall && run.topology.is_some() {
            self.killall(run).await;
        }
        for (host, dir) in std::mem::take(&mut run.scratch) {
            let machine = self.machine(&host);
            let rm = RemoteCommand::new(args!["rm", "-rf", dir.display()]);
            run.log.record(machine.name(), &rm);
            if let Err(e) = machine.exec(&rm).await {
                tracing::warn!("error removing {}: {:?}", dir.display(), e);
            }
        }
        Ok(true)
    }

    async fn killall(&self, run: &mut DefinitionRun) {
        for host in run.participants() {
            let machine = self.machine(&host);
            let mut killall = RemoteCommand::new(args!["killall", "-q"]);
            killall = killall.args(KILLALL.iter().map(|name| name.to_string()));
            run.log.record(machine.name(), &killall);
            // fails when there's nothing to kill
            let _ = machine.exec(&killall).await;
        }
    }
}

// Hosts with distinct ssh addresses, in order.
fn distinct(hosts: impl IntoIterator<Item = Host>) -> Vec<Host> {
    let mut distinct: Vec<Host> = Vec::new();
    for host in hosts {
        if !distinct.iter().any(|h| h.ssh_address == host.ssh_address) {
            distinct.push(host);
        }
    }
    distinct
}

fn outcome(result: Result<bool, Report>) -> PhaseOutcome {
    match result {
        Ok(true) => PhaseOutcome::Done,
        Ok(false) => PhaseOutcome::Skipped,
        Err(e) => PhaseOutcome::Failed(format!("{:#}", e)),
    }
}

// Fails if a server or store already exited.
fn check_servers(servers: &mut ProcessRegistry) -> Result<(), Report> {
    match servers.exited().into_iter().next() {
        Some(exit) => Err(ExpError::RemoteCommand {
            host: exit.host,
            command: format!("{} exited before the clients started", exit.name),
            code: exit.code,
        }
        .into()),
        None => Ok(()),
    }
}

// Listening endpoints of the pequod servers, or of the compared stores.
fn endpoints(run: &DefinitionRun) -> Vec<(String, u16)> {
    if run.def.comparison().is_some() {
        run.stores
            .iter()
            .map(|(host, port)| (dial_address(host), *port))
            .collect()
    } else {
        run.topology
            .iter()
            .flat_map(|topology| topology.slots())
            .map(|slot| (dial_address(&slot.host), slot.port))
            .collect()
    }
}

/// Connections each worker opens to a compared database.
pub fn db_pool_size(ncaching: usize, nworkers: usize) -> usize {
    if nworkers >= ncaching {
        1
    } else {
        (ncaching + nworkers - 1) / nworkers.max(1)
    }
}

/// When client workers don't fit in the CPUs left after the servers, they
/// all share those CPUs.
pub fn client_cpu_list(
    first: usize,
    nworkers: usize,
    max_cpus: usize,
) -> Option<String> {
    if first + nworkers <= max_cpus || first >= max_cpus {
        return None;
    }
    let cpus: Vec<_> = (first..max_cpus).map(|cpu| cpu.to_string()).collect();
    Some(cpus.join(","))
}

fn dial_address(host: &Host) -> String {
    host.ssh_address
        .rsplit('@')
        .next()
        .unwrap_or(&host.ssh_address)
        .to_string()
}

// Whether `address:port` accepts a connection within `wait`.
async fn accepts(address: &str, port: u16, wait: Duration) -> bool {
    let connect = tokio::net::TcpStream::connect((address, port));
    matches!(tokio::time::timeout(wait, connect).await, Ok(Ok(_)))
}

fn replace_symlink(target: &str, link: &Path) -> Result<(), Report> {
    if link.symlink_metadata().is_ok() {
        std::fs::remove_file(link)
            .wrap_err_with(|| format!("remove {}", link.display()))?;
    }
    std::os::unix::fs::symlink(target, link)
        .wrap_err_with(|| format!("symlink {}", link.display()))
}
