use pequod_exp::bench::{OrchestratorContext, Phase, PhaseOutcome, RunReport};
use pequod_exp::config::{Options, Readiness};
use pequod_exp::process::{Interrupt, ProcessState};
use pequod_exp::progress::TracingProgressBar;
use pequod_exp::testbed::local::LocalPool;
use pequod_exp::ExperimentFile;
use std::path::Path;
use std::time::{Duration, Instant};

const SERVER: &str = "exec sleep 30\n";

const CLIENT: &str = r#"case "$*" in
  *--groupid=1*) exit 3 ;;
esac
echo '{"nposts": 10, "server_time": 2.0, "mode": "twitter"}'
"#;

const OK_CLIENT: &str = r#"echo '{"nposts": 10, "server_time": 2.0}'
"#;

const SLOW_CLIENT: &str = "exec sleep 30\n";

const INIT: &str = "echo initialized \"$@\"\n";

const POPULATE: &str = "echo populated \"$@\"\n";

const BAD_POPULATE: &str = r#"case "$*" in
  *--groupid=1*) exit 4 ;;
esac
echo populated
"#;

fn script(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    format!("sh {}", path.display())
}

fn options(dir: &Path, ngroups: usize) -> Options {
    Options {
        results_dir: dir.join("results"),
        dumps_dir: dir.join("dumps"),
        nbacking: 1,
        ncaching: 2,
        ngroups,
        readiness: Readiness::Delay(Duration::from_millis(200)),
        ..Options::default()
    }
}

fn experiments(dir: &Path, client: &str) -> ExperimentFile {
    let server = script(dir, "server.sh", SERVER);
    let client = script(dir, "client.sh", client);
    let ok_client = script(dir, "ok_client.sh", OK_CLIENT);
    let init = script(dir, "init.sh", INIT);
    let populate = script(dir, "populate.sh", POPULATE);
    let bad_populate = script(dir, "bad_populate.sh", BAD_POPULATE);
    let yaml = format!(
        r#"
exps:
  - name: twitter
    defs:
      - name: base
        backendcmd: "{server}"
        cachecmd: "{server}"
        clientcmd: "{client}"
      - name: other
        backendcmd: "{server}"
        cachecmd: "{server}"
        clientcmd: "{client}"
    plot:
      type: line
      data:
        - from: base
          attr: nposts
  - name: phases
    defs:
      - name: badbuild
        def_build: "echo broken; exit 1"
        backendcmd: "{server}"
        cachecmd: "{server}"
        clientcmd: "{ok_client}"
      - name: full
        def_build: "echo built"
        backendcmd: "{server}"
        cachecmd: "{server}"
        initcmd: "{init}"
        populatecmd: "{populate}"
        clientcmd: "{ok_client}"
      - name: badpop
        backendcmd: "{server}"
        cachecmd: "{server}"
        populatecmd: "{bad_populate}"
        clientcmd: "{ok_client}"
"#,
        server = server,
        client = client,
        ok_client = ok_client,
        init = init,
        populate = populate,
        bad_populate = bad_populate,
    );
    ExperimentFile::parse(&yaml).unwrap()
}

async fn run(
    options: Options,
    file: &ExperimentFile,
    interrupt: Interrupt,
) -> RunReport {
    let mut context = OrchestratorContext::new(
        options,
        Box::new(LocalPool),
        interrupt,
        TracingProgressBar::hidden(),
    );
    context.run(file).await
}

fn read(path: impl AsRef<Path>) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn single_definition_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let file = experiments(dir.path(), CLIENT);
    let mut options = options(dir.path(), 1);
    options.filters = vec!["twitter/base".to_string()];

    let report = run(options, &file, Interrupt::new()).await;
    assert!(report.success(), "{:?}", report);
    assert_eq!(report.definitions.len(), 1);

    let definition = &report.definitions[0];
    let phases: Vec<_> =
        definition.phases.iter().map(|(phase, _)| *phase).collect();
    assert_eq!(
        phases,
        vec![
            Phase::Build,
            Phase::ProvisionTopology,
            Phase::StartDatabases,
            Phase::StartServers,
            Phase::AwaitReadiness,
            Phase::Initialize,
            Phase::Populate,
            Phase::RunClients,
            Phase::Collect,
            Phase::Teardown,
        ]
    );
    let done = Some(&PhaseOutcome::Done);
    assert_eq!(definition.outcome(Phase::Build), Some(&PhaseOutcome::Skipped));
    assert_eq!(definition.outcome(Phase::StartServers), done);
    assert_eq!(definition.outcome(Phase::RunClients), done);

    let result_dir = &definition.result_dir;
    let manifest = read(result_dir.join("hosts.txt"));
    assert_eq!(manifest.lines().count(), 3);
    assert!(result_dir.join("cmd_log.txt").is_file());
    assert!(result_dir.join("fart_srv_0.txt").is_file());
    assert!(result_dir.join("output_app_0.json").is_file());

    let aggregate = definition.aggregate.as_ref().unwrap();
    assert_eq!(aggregate["nposts"], serde_json::json!(10));
    assert_eq!(aggregate["mode"], serde_json::json!("twitter"));
    assert!(result_dir.join("aggregate_output_app.json").is_file());

    // the run directory is linked and plot metadata is next to the definitions
    let results = dir.path().join("results");
    let last = std::fs::read_link(results.join("last")).unwrap();
    assert_eq!(results.join(last), report.result_dir.unwrap());
    assert!(result_dir.parent().unwrap().join("plot.json").is_file());
}

#[tokio::test]
async fn build_initialize_and_populate_run_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let file = experiments(dir.path(), CLIENT);
    let mut options = options(dir.path(), 1);
    options.ncaching = 1;
    options.filters = vec!["phases/full".to_string()];
    // not a write-around definition: there's nothing to dump or restore
    options.dump_db = true;
    options.load_db = true;

    let report = run(options, &file, Interrupt::new()).await;
    assert!(report.success(), "{:?}", report);
    let definition = &report.definitions[0];
    for phase in [
        Phase::Build,
        Phase::ProvisionTopology,
        Phase::StartServers,
        Phase::AwaitReadiness,
        Phase::Initialize,
        Phase::Populate,
        Phase::RunClients,
        Phase::Collect,
        Phase::Teardown,
    ] {
        let outcome = definition.outcome(phase);
        assert_eq!(outcome, Some(&PhaseOutcome::Done), "{}", phase);
    }
    let skipped = Some(&PhaseOutcome::Skipped);
    assert_eq!(definition.outcome(Phase::StartDatabases), skipped);

    let result_dir = &definition.result_dir;
    assert_eq!(read(result_dir.join("hosts.txt")).lines().count(), 2);
    assert_eq!(read(result_dir.join("fart_build.txt")), "built\n");
    let init = read(result_dir.join("fart_init.txt"));
    assert!(init.starts_with("initialized -H="), "{}", init);
    let populate = read(result_dir.join("fart_pop_0.txt"));
    assert!(populate.contains("--ngroups=1 --groupid=0"), "{}", populate);
    assert!(!dir.path().join("dumps").exists());

    // the command log follows the phases
    let log = read(result_dir.join("cmd_log.txt"));
    let position = |needle: &str| log.find(needle).unwrap();
    assert!(position("echo built") < position("server.sh"));
    assert!(position("server.sh") < position("init.sh"));
    assert!(position("init.sh") < position("populate.sh"));
    assert!(position("populate.sh") < position("ok_client.sh"));

    let names: Vec<_> = definition
        .processes
        .iter()
        .map(|process| process.name.as_str())
        .collect();
    assert_eq!(
        names,
        vec![
            "server_0",
            "server_1",
            "build_0",
            "init",
            "populate_0",
            "client_0",
        ]
    );
    let aggregate = definition.aggregate.as_ref().unwrap();
    assert_eq!(aggregate["nposts"], serde_json::json!(10));
}

#[tokio::test]
async fn failed_build_ends_the_definition() {
    let dir = tempfile::tempdir().unwrap();
    let file = experiments(dir.path(), CLIENT);
    let mut options = options(dir.path(), 1);
    options.filters = vec!["badbuild".to_string(), "full".to_string()];

    let report = run(options, &file, Interrupt::new()).await;
    assert!(!report.success());
    assert!(!report.interrupted);
    assert_eq!(report.definitions.len(), 2);

    let failed = &report.definitions[0];
    assert_eq!(failed.definition, "badbuild");
    assert!(!failed.aborts_run);
    let error = failed.error.as_deref().unwrap();
    assert!(error.contains("build failed"), "{}", error);
    assert!(matches!(
        failed.outcome(Phase::Build),
        Some(PhaseOutcome::Failed(_))
    ));
    assert_eq!(failed.outcome(Phase::StartServers), None);
    assert_eq!(failed.outcome(Phase::RunClients), None);
    let skipped = Some(&PhaseOutcome::Skipped);
    assert_eq!(failed.outcome(Phase::Collect), skipped);
    assert_eq!(failed.outcome(Phase::Teardown), Some(&PhaseOutcome::Done));
    assert!(failed.aggregate.is_none());
    assert_eq!(read(failed.result_dir.join("fart_build.txt")), "broken\n");

    // the next definition still runs
    let next = &report.definitions[1];
    assert_eq!(next.definition, "full");
    assert!(next.success(), "{:?}", next);
}

#[tokio::test]
async fn failed_populate_worker_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let file = experiments(dir.path(), CLIENT);
    let mut options = options(dir.path(), 2);
    options.filters = vec!["phases/badpop".to_string()];

    let report = run(options, &file, Interrupt::new()).await;
    assert!(!report.success());
    let definition = &report.definitions[0];
    assert_eq!(definition.failed_workers, vec!["populate_1".to_string()]);
    assert!(definition.error.is_none());
    assert!(matches!(
        definition.outcome(Phase::Populate),
        Some(PhaseOutcome::Failed(_))
    ));

    // clients still run against what was populated
    let done = Some(&PhaseOutcome::Done);
    assert_eq!(definition.outcome(Phase::RunClients), done);
    let aggregate = definition.aggregate.as_ref().unwrap();
    assert_eq!(aggregate["nposts"], serde_json::json!(20));
    let populate = definition
        .processes
        .iter()
        .find(|process| process.name == "populate_1")
        .unwrap();
    assert_eq!(populate.state, ProcessState::Exited(4));
}

#[tokio::test]
async fn failed_client_group_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let file = experiments(dir.path(), CLIENT);
    let mut options = options(dir.path(), 3);
    options.filters = vec!["base".to_string()];

    let report = run(options, &file, Interrupt::new()).await;
    assert!(!report.success());
    assert!(!report.interrupted);

    let definition = &report.definitions[0];
    assert_eq!(definition.failed_workers, vec!["client_1".to_string()]);
    assert!(definition.error.is_none());
    assert!(matches!(
        definition.outcome(Phase::RunClients),
        Some(PhaseOutcome::Failed(_))
    ));
    let done = Some(&PhaseOutcome::Done);
    assert_eq!(definition.outcome(Phase::Collect), done);

    // the two groups that succeeded are aggregated
    let aggregate = definition.aggregate.as_ref().unwrap();
    assert_eq!(aggregate["nposts"], serde_json::json!(20));
    assert_eq!(aggregate["server_time"], serde_json::json!(2.0));
}

#[tokio::test]
async fn interrupt_tears_everything_down() {
    let dir = tempfile::tempdir().unwrap();
    let file = experiments(dir.path(), SLOW_CLIENT);
    let options = options(dir.path(), 2);

    let interrupt = Interrupt::new();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.trigger();
    });

    let start = Instant::now();
    let report = run(options, &file, interrupt).await;
    assert!(start.elapsed() < Duration::from_secs(20));
    assert!(report.interrupted);
    assert!(!report.success());

    // the second definition never starts
    assert_eq!(report.definitions.len(), 1);
    let definition = &report.definitions[0];
    assert!(definition.aborts_run);
    let skipped = Some(&PhaseOutcome::Skipped);
    assert_eq!(definition.outcome(Phase::Collect), skipped);
    let done = Some(&PhaseOutcome::Done);
    assert_eq!(definition.outcome(Phase::Teardown), done);
    assert!(definition.aggregate.is_none());

    // every server and client was killed, and is gone
    let names: Vec<_> = definition
        .processes
        .iter()
        .map(|process| process.name.as_str())
        .collect();
    assert_eq!(
        names,
        vec!["server_0", "server_1", "server_2", "client_0", "client_1"]
    );
    for process in &definition.processes {
        assert_eq!(process.state, ProcessState::Killed, "{}", process.name);
        let pid = process.pid.unwrap();
        let proc_dir = format!("/proc/{}", pid);
        assert!(!Path::new(&proc_dir).exists(), "{} survived", process.name);
    }
}

#[tokio::test]
async fn server_exiting_early_fails_the_definition() {
    let dir = tempfile::tempdir().unwrap();
    let file = experiments(dir.path(), CLIENT);
    script(dir.path(), "server.sh", "exit 1\n");
    let mut options = options(dir.path(), 1);
    options.filters = vec!["*/other".to_string()];
    options.readiness = Readiness::Delay(Duration::from_secs(1));

    let report = run(options, &file, Interrupt::new()).await;
    assert!(!report.success());
    let definition = &report.definitions[0];
    assert_eq!(definition.definition, "other");
    assert!(definition.error.is_some());
    assert!(matches!(
        definition.outcome(Phase::AwaitReadiness),
        Some(PhaseOutcome::Failed(_))
    ));
    assert_eq!(definition.outcome(Phase::RunClients), None);
    let done = Some(&PhaseOutcome::Done);
    assert_eq!(definition.outcome(Phase::Teardown), done);
}

#[tokio::test]
async fn connect_readiness_notices_a_crashed_server() {
    let dir = tempfile::tempdir().unwrap();
    let file = experiments(dir.path(), CLIENT);
    script(dir.path(), "server.sh", "exit 1\n");
    let mut options = options(dir.path(), 1);
    options.filters = vec!["*/other".to_string()];
    options.start_port = 47000;
    options.readiness = Readiness::Probe {
        timeout: Duration::from_secs(30),
        interval: Duration::from_millis(100),
    };

    let start = Instant::now();
    let report = run(options, &file, Interrupt::new()).await;
    // well before the readiness timeout
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(!report.success());
    let definition = &report.definitions[0];
    let error = definition.error.as_deref().unwrap();
    assert!(error.contains("exited before the clients started"), "{}", error);
    assert!(matches!(
        definition.outcome(Phase::AwaitReadiness),
        Some(PhaseOutcome::Failed(_))
    ));
    assert_eq!(definition.outcome(Phase::RunClients), None);
}

#[tokio::test]
async fn invalid_options_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let file = experiments(dir.path(), CLIENT);
    let options = options(dir.path(), 0);

    let report = run(options, &file, Interrupt::new()).await;
    assert!(!report.success());
    assert!(!report.interrupted);
    assert!(report.definitions.is_empty());
    assert!(report.result_dir.is_none());
    let error = report.error.as_deref().unwrap();
    assert!(error.contains("client group"), "{}", error);
}

#[tokio::test]
async fn unmatched_filter_runs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let file = experiments(dir.path(), CLIENT);
    let mut options = options(dir.path(), 1);
    options.filters = vec!["no-such-*".to_string()];

    let report = run(options, &file, Interrupt::new()).await;
    assert!(report.definitions.is_empty());
    assert!(report.result_dir.is_none());
    assert!(report.success());
}
