use clap::{App, Arg};
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use pequod_exp::aggregate;

fn main() -> Result<(), Report> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let matches = App::new("aggregate")
        .version("0.1")
        .about("Aggregates the client output files of result directories.")
        .arg(
            Arg::with_name("dirs")
                .value_name("DIR")
                .help("result directories holding output_app_*.json files")
                .required(true)
                .multiple(true),
        )
        .get_matches();

    let mut failed = false;
    for dir in matches.values_of("dirs").into_iter().flatten() {
        match aggregate::aggregate_dir(dir)? {
            Some(record) => {
                let json = serde_json::to_string_pretty(&record)
                    .wrap_err("serialize aggregate")?;
                println!("{}", json);
            }
            None => {
                eprintln!("{}: nothing to aggregate", dir);
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
