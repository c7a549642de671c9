use clap::{App, Arg, ArgMatches};
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use pequod_exp::bench::OrchestratorContext;
use pequod_exp::config::{Options, Readiness, ReleaseMode};
use pequod_exp::process::{Interrupt, INTERRUPTED_EXIT_CODE};
use pequod_exp::progress::TracingProgressBar;
use pequod_exp::testbed::aws::Ec2Provider;
use pequod_exp::testbed::baremetal::StaticPool;
use pequod_exp::testbed::local::LocalPool;
use pequod_exp::testbed::{CloudPool, Pool};
use pequod_exp::{ExpError, ExperimentFile, Testbed};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;
    let options = parse_args()?;
    let progress = TracingProgressBar::init(0);

    let file = ExperimentFile::load(&options.expfile)?;
    let interrupt = Interrupt::new();
    interrupt.listen_ctrl_c();

    let pool = pool(&options).await?;
    tracing::info!(
        "testbed: {} | backing: {} | caching: {} | client groups: {}",
        pool.name(),
        options.nbacking,
        options.ncaching,
        options.ngroups
    );
    let prep_only = options.prep_only;
    let mut context =
        OrchestratorContext::new(options, pool, interrupt, progress);

    if prep_only {
        let hosts = context.prepare().await;
        context.release().await?;
        let hosts = hosts?;
        tracing::info!("prepared {} host(s)", hosts.len());
        return Ok(());
    }

    let report = context.run(&file).await;
    for definition in &report.definitions {
        let status = if definition.success() { "ok" } else { "FAILED" };
        println!(
            "{}/{}: {} ({})",
            definition.experiment,
            definition.definition,
            status,
            definition.result_dir.display()
        );
    }
    if let Some(dir) = &report.result_dir {
        println!("results: {}", dir.display());
    }
    if !report.success() {
        if let Some(error) = &report.error {
            eprintln!("error: {}", error);
        }
        let code = if report.interrupted {
            INTERRUPTED_EXIT_CODE
        } else {
            1
        };
        std::process::exit(code);
    }
    Ok(())
}

async fn pool(options: &Options) -> Result<Box<dyn Pool>, Report> {
    let pool: Box<dyn Pool> = match options.testbed {
        Testbed::Local => Box::new(LocalPool),
        Testbed::Baremetal => {
            let path = options.machines_file.as_ref().ok_or_else(|| {
                let reason = "missing machines file".to_string();
                ExpError::InvalidDefinition(reason)
            })?;
            Box::new(StaticPool::load(path).await?)
        }
        Testbed::Aws => {
            let provider = Ec2Provider::new(options.aws.clone())?;
            Box::new(CloudPool::new(
                provider,
                options.provision_timeout,
                options.poll_interval,
            ))
        }
    };
    Ok(pool)
}

fn parse_args() -> Result<Options, Report> {
    let matches = App::new("main")
        .version("0.1")
        .about("Runs pequod experiments on local, baremetal or aws testbeds.")
        .arg(
            Arg::with_name("filters")
                .value_name("PATTERN")
                .help(
                    "glob patterns selecting experiments or definitions (as \
                     `exp`, `def` or `exp/def`); by default every enabled \
                     definition runs",
                )
                .multiple(true),
        )
        .arg(
            Arg::with_name("expfile")
                .short("e")
                .long("expfile")
                .value_name("FILE")
                .help("experiment file; default: exp/testexperiments.yml")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("testbed")
                .long("testbed")
                .value_name("TESTBED")
                .possible_values(&["local", "baremetal", "aws"])
                .help("where to run; default: local")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("machines")
                .long("machines")
                .value_name("FILE")
                .help(
                    "file listing baremetal machines, one `[role] \
                     [user@]host` per line",
                )
                .takes_value(true),
        )
        .arg(
            Arg::with_name("backing")
                .short("b")
                .long("backing")
                .value_name("N")
                .help("number of backing servers; default: 1")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("caching")
                .short("c")
                .long("caching")
                .value_name("N")
                .help("number of caching servers; default: 5")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("clientgroups")
                .short("g")
                .long("clientgroups")
                .value_name("N")
                .help("number of client groups; default: 1")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("cluster_size")
                .long("cluster-size")
                .value_name("N")
                .help("number of server slots per machine; default: 1")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("startport")
                .short("p")
                .long("startport")
                .value_name("PORT")
                .help("port of the first server slot; default: 7000")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("dbstartport")
                .short("D")
                .long("dbstartport")
                .value_name("PORT")
                .help("port of the first database; default: 10000")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("moveports")
                .short("M")
                .long("moveports")
                .help("shift every port after each definition"),
        )
        .arg(
            Arg::with_name("link")
                .short("L")
                .long("link")
                .value_name("NAME")
                .help("also link the result directory as results/NAME")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("affinity")
                .short("a")
                .long("affinity")
                .help("pin every process to its own cpu with numactl"),
        )
        .arg(
            Arg::with_name("startcpu")
                .short("A")
                .long("startcpu")
                .value_name("CPU")
                .help("first cpu used when pinning; default: 0")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("maxcpus")
                .long("maxcpus")
                .value_name("N")
                .help("number of cpus available for pinning; default: all")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("perfserver")
                .short("P")
                .long("perfserver")
                .value_name("SLOT")
                .help("run the server in this slot under `perf record`")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("part")
                .short("f")
                .long("part")
                .value_name("NAME")
                .help(
                    "partition function passed to servers; overrides \
                     def_part",
                )
                .takes_value(true),
        )
        .arg(
            Arg::with_name("killall")
                .short("K")
                .long("killall")
                .help(
                    "kill leftover servers and stores before and after each \
                     definition",
                ),
        )
        .arg(
            Arg::with_name("dumpdb")
                .short("d")
                .long("dumpdb")
                .help(
                    "dump the backing databases of write-around definitions \
                     to dumps/EXP/DEF/nshard_N after populating them",
                ),
        )
        .arg(
            Arg::with_name("loaddb")
                .short("l")
                .long("loaddb")
                .help(
                    "restore the backing databases of write-around \
                     definitions from an earlier --dumpdb instead of \
                     populating them",
                ),
        )
        .arg(
            Arg::with_name("prep")
                .long("prep")
                .help("only provision and prepare hosts, then exit"),
        )
        .arg(
            Arg::with_name("prep_cmd")
                .long("prep-cmd")
                .value_name("CMD")
                .help(
                    "shell command run on every remote host before the first \
                     definition",
                )
                .takes_value(true),
        )
        .arg(
            Arg::with_name("update_cmd")
                .long("update-cmd")
                .value_name("CMD")
                .help(
                    "shell command run on every remote host after the \
                     preparation command",
                )
                .takes_value(true),
        )
        .arg(
            Arg::with_name("release")
                .long("release")
                .value_name("MODE")
                .possible_values(&["keep", "untag", "stop", "terminate"])
                .help(
                    "what happens to cloud hosts once the run is over: keep \
                     them running, untag them for reuse, stop or terminate \
                     them; default: stop",
                )
                .takes_value(true)
                .conflicts_with_all(&["keep", "terminate"]),
        )
        .arg(
            Arg::with_name("keep")
                .long("keep")
                .help("same as --release keep")
                .conflicts_with("terminate"),
        )
        .arg(
            Arg::with_name("terminate")
                .long("terminate")
                .help("same as --release terminate"),
        )
        .arg(
            Arg::with_name("user")
                .short("u")
                .long("user")
                .value_name("USER")
                .help("ssh user for remote hosts")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("key")
                .long("key")
                .value_name("FILE")
                .help("ssh private key; by default the ssh agent is used")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("results_dir")
                .long("results-dir")
                .value_name("DIR")
                .help("local result directory; default: results")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("remote_dir")
                .long("remote-dir")
                .value_name("DIR")
                .help(
                    "pequod checkout on remote hosts, relative to the ssh \
                     user's home; default: pequod",
                )
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ramfs")
                .long("ramfs")
                .value_name("DIR")
                .help(
                    "memory filesystem used by def_db_in_memory; default: \
                     /mnt/tmp",
                )
                .takes_value(true),
        )
        .arg(
            Arg::with_name("readiness_delay")
                .long("readiness-delay")
                .value_name("SECS")
                .help("seconds to wait for servers to come up; default: 3")
                .takes_value(true)
                .conflicts_with("readiness_probe"),
        )
        .arg(
            Arg::with_name("readiness_probe")
                .long("readiness-probe")
                .help(
                    "wait until every server port accepts connections \
                     instead of sleeping",
                ),
        )
        .arg(
            Arg::with_name("readiness_timeout")
                .long("readiness-timeout")
                .value_name("SECS")
                .help("how long to probe server ports; default: 60")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("provision_timeout")
                .long("provision-timeout")
                .value_name("SECS")
                .help(
                    "how long to wait for cloud hosts to be running; \
                     default: 600",
                )
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ssh_timeout")
                .long("ssh-timeout")
                .value_name("SECS")
                .help(
                    "how long to wait for new hosts to accept ssh; default: \
                     300",
                )
                .takes_value(true),
        )
        .arg(
            Arg::with_name("region")
                .long("region")
                .value_name("REGION")
                .help("aws region; default: us-east-1")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ami")
                .long("ami")
                .value_name("AMI")
                .help("image for new aws instances")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("key_name")
                .long("key-name")
                .value_name("NAME")
                .help("aws key pair for new instances; default: pequod")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("security_group")
                .long("security-group")
                .value_name("NAME")
                .help("aws security group for new instances; default: pequod")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("instance_type")
                .long("instance-type")
                .value_name("TYPE")
                .help(
                    "aws instance type for every role; default: c5.2xlarge",
                )
                .takes_value(true),
        )
        .arg(
            Arg::with_name("backing_instance_type")
                .long("backing-instance-type")
                .value_name("TYPE")
                .help("aws instance type for backing hosts")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("caching_instance_type")
                .long("caching-instance-type")
                .value_name("TYPE")
                .help("aws instance type for caching hosts")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("client_instance_type")
                .long("client-instance-type")
                .value_name("TYPE")
                .help("aws instance type for client hosts")
                .takes_value(true),
        )
        .get_matches();

    let options = options(&matches)?;
    options.check()?;
    Ok(options)
}

fn options(matches: &ArgMatches<'_>) -> Result<Options, Report> {
    let mut options = Options {
        max_cpus: num_cpus::get(),
        ..Options::default()
    };

    options.filters = matches
        .values_of("filters")
        .map(|values| values.map(String::from).collect())
        .unwrap_or_default();
    if let Some(expfile) = matches.value_of("expfile") {
        options.expfile = PathBuf::from(expfile);
    }
    options.testbed = parse(matches, "testbed")?.unwrap_or(options.testbed);
    options.machines_file = matches.value_of("machines").map(PathBuf::from);

    options.nbacking = parse(matches, "backing")?.unwrap_or(options.nbacking);
    options.ncaching = parse(matches, "caching")?.unwrap_or(options.ncaching);
    options.ngroups =
        parse(matches, "clientgroups")?.unwrap_or(options.ngroups);
    options.cluster_size =
        parse(matches, "cluster_size")?.unwrap_or(options.cluster_size);
    options.start_port =
        parse(matches, "startport")?.unwrap_or(options.start_port);
    options.db_start_port =
        parse(matches, "dbstartport")?.unwrap_or(options.db_start_port);
    options.move_ports = matches.is_present("moveports");
    options.link = matches.value_of("link").map(String::from);

    options.affinity = matches.is_present("affinity");
    options.start_cpu =
        parse(matches, "startcpu")?.unwrap_or(options.start_cpu);
    options.max_cpus = parse(matches, "maxcpus")?.unwrap_or(options.max_cpus);
    options.perf_server = parse(matches, "perfserver")?;
    options.part = matches.value_of("part").map(String::from);
    options.killall = matches.is_present("killall");
    options.dump_db = matches.is_present("dumpdb");
    options.load_db = matches.is_present("loaddb");

    options.prep_only = matches.is_present("prep");
    options.prep_cmd = matches.value_of("prep_cmd").map(String::from);
    options.update_cmd = matches.value_of("update_cmd").map(String::from);
    options.release = if matches.is_present("keep") {
        ReleaseMode::Keep
    } else if matches.is_present("terminate") {
        ReleaseMode::Terminate
    } else {
        parse(matches, "release")?.unwrap_or(options.release)
    };

    if let Some(user) = matches.value_of("user") {
        options.ssh.user = Some(user.to_string());
    }
    options.ssh.key = matches.value_of("key").map(PathBuf::from);
    if let Some(dir) = matches.value_of("results_dir") {
        options.results_dir = PathBuf::from(dir);
    }
    if let Some(dir) = matches.value_of("remote_dir") {
        options.remote_dir = dir.to_string();
    }
    if let Some(ramfs) = matches.value_of("ramfs") {
        options.ramfs = PathBuf::from(ramfs);
    }

    if matches.is_present("readiness_probe") {
        options.readiness = match Options::default_probe() {
            Readiness::Probe { interval, timeout } => Readiness::Probe {
                interval,
                timeout: parse_secs(matches, "readiness_timeout")?
                    .unwrap_or(timeout),
            },
            delay => delay,
        };
    } else if let Some(delay) = parse_secs(matches, "readiness_delay")? {
        options.readiness = Readiness::Delay(delay);
    }
    if let Some(timeout) = parse_secs(matches, "provision_timeout")? {
        options.provision_timeout = timeout;
    }
    if let Some(timeout) = parse_secs(matches, "ssh_timeout")? {
        options.ssh_timeout = timeout;
    }

    let aws = &mut options.aws;
    if let Some(region) = matches.value_of("region") {
        aws.region = region.to_string();
    }
    aws.ami = matches.value_of("ami").map(String::from);
    if let Some(key_name) = matches.value_of("key_name") {
        aws.key_name = key_name.to_string();
    }
    if let Some(group) = matches.value_of("security_group") {
        aws.security_group = group.to_string();
    }
    if let Some(instance_type) = matches.value_of("instance_type") {
        aws.backing_instance_type = instance_type.to_string();
        aws.caching_instance_type = instance_type.to_string();
        aws.client_instance_type = instance_type.to_string();
    }
    if let Some(instance_type) = matches.value_of("backing_instance_type") {
        aws.backing_instance_type = instance_type.to_string();
    }
    if let Some(instance_type) = matches.value_of("caching_instance_type") {
        aws.caching_instance_type = instance_type.to_string();
    }
    if let Some(instance_type) = matches.value_of("client_instance_type") {
        aws.client_instance_type = instance_type.to_string();
    }
    Ok(options)
}

fn parse<T>(matches: &ArgMatches<'_>, name: &str) -> Result<Option<T>, Report>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    matches
        .value_of(name)
        .map(|value| {
            value.parse::<T>().map_err(|e| {
                let reason = format!("--{} {}: {}", name, value, e);
                ExpError::InvalidDefinition(reason).into()
            })
        })
        .transpose()
}

fn parse_secs(
    matches: &ArgMatches<'_>,
    name: &str,
) -> Result<Option<Duration>, Report> {
    let secs = parse::<u64>(matches, name).wrap_err("parse seconds")?;
    Ok(secs.map(Duration::from_secs))
}
