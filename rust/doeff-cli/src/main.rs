//! `doeff` — run effect programs from the command line.
//!
//! Exit codes: 0 on success, 1 on program error, 2 on argument error
//! (clap's default for usage failures).

mod programs;

use clap::{Parser, Subcommand, ValueEnum};
use doeff_core::values::Value;
use doeff_rt::{run_program, EnvSource, RunProgramOptions};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "doeff", version, about = "Algebraic effects runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a registered program.
    Run(RunArgs),
    /// List the registered programs.
    List,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Name of a registered program (see `doeff list`).
    #[arg(long, short)]
    program: String,

    /// Environment entry as key=value (value parsed as JSON when
    /// possible, else taken as a string). Repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// TOML file of environment entries. Repeatable.
    #[arg(long = "env-file", value_name = "PATH")]
    env_file: Vec<PathBuf>,

    /// Skip loading ~/.doeff.toml.
    #[arg(long)]
    no_default_env: bool,

    #[arg(long, value_enum, default_value = "text")]
    format: Format,

    /// Render the failure trace to stderr on error.
    #[arg(long)]
    print_trace: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::List => {
            for p in programs::REGISTRY {
                println!("{:<14} {}", p.name, p.summary);
            }
            ExitCode::SUCCESS
        }
        Command::Run(args) => run_command(args),
    }
}

fn run_command(args: RunArgs) -> ExitCode {
    let Some(registered) = programs::find(&args.program) else {
        eprintln!(
            "error: unknown program {:?}; see `doeff list` for the registry",
            args.program
        );
        return ExitCode::from(2);
    };

    let mut envs: Vec<EnvSource> = Vec::new();
    let mut inline_env: BTreeMap<String, Value> = BTreeMap::new();
    for entry in &args.env {
        let Some((key, raw)) = entry.split_once('=') else {
            eprintln!("error: --env expects key=value, got {:?}", entry);
            return ExitCode::from(2);
        };
        inline_env.insert(key.to_string(), parse_env_value(raw));
    }
    for path in &args.env_file {
        envs.push(EnvSource::File(path.clone()));
    }
    if !inline_env.is_empty() {
        envs.push(EnvSource::Map(inline_env));
    }

    let options = RunProgramOptions {
        envs,
        load_default_env: !args.no_default_env,
        print_trace: args.print_trace,
        ..Default::default()
    };
    let outcome = run_program((registered.build)(), options);
    let result = outcome.run_result;

    match (args.format, result.into_result()) {
        (Format::Text, Ok(value)) => {
            println!("{}", value);
            ExitCode::SUCCESS
        }
        (Format::Text, Err(error)) => {
            eprintln!("error: {}", error);
            ExitCode::from(1)
        }
        (Format::Json, Ok(value)) => {
            let payload = serde_json::json!({
                "status": "ok",
                "result": value.to_json(),
                "result_type": value.type_name(),
                "program": registered.name,
                "interpreter": "<default run>",
                "apply": serde_json::Value::Null,
                "transformers": serde_json::Value::Array(vec![]),
            });
            println!("{}", payload);
            ExitCode::SUCCESS
        }
        (Format::Json, Err(error)) => {
            let payload = serde_json::json!({
                "status": "error",
                "error": error.kind(),
                "message": error.error.to_string(),
                "traceback": error.render_trace(),
            });
            println!("{}", payload);
            ExitCode::from(1)
        }
    }
}

/// Parse an --env value: JSON when it parses, raw string otherwise.
fn parse_env_value(raw: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => doeff_rt::json_to_value(&json),
        Err(_) => Value::Str(raw.to_string()),
    }
}
