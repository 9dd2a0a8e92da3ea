mod interactive;

use std::{fs::File, io::Read, path::PathBuf};

use anyhow::Result;
use cache_sim::{
    config::SimConfig,
    sim::{ExecuteMode, Simulation, SimulationOption},
    trace::Trace,
};
use clap::{Args, Parser, Subcommand};

#[cfg(feature = "stat")]
use terminal_size::terminal_size;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// replay traces through the cache hierarchy
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// File path to the machine configuration (json)
    #[arg(short, long)]
    config: PathBuf,
    /// File paths to the traces, one per core in configuration order
    #[arg(short, long, required = true, num_args = 1..)]
    traces: Vec<PathBuf>,
    /// Enable interactive mode
    #[arg(long)]
    interactive: bool,
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
    /// Give up after this many cycles
    #[arg(long)]
    max_cycles: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    match args.command {
        Command::Run(RunArgs {
            config,
            traces,
            interactive,
            verbose,
            max_cycles,
        }) => {
            if verbose {
                env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                    .init();
            } else {
                env_logger::init();
            }
            let config = SimConfig::from_reader(File::open(config)?)?;
            let traces = traces
                .into_iter()
                .map(|path| Trace::parse(&read_input(path)?))
                .collect::<Result<Vec<_>>>()?;
            log::info!("finished parsing {} traces.", traces.len());
            let mut sim = Simulation::new(&config, traces)?;
            execute(&mut sim, interactive, max_cycles)?;
            log::info!("finished execution.");
            output_stat(&sim);
            Ok(())
        }
    }
}

#[cfg(not(feature = "stat"))]
fn output_stat(_: &Simulation) {}

#[cfg(feature = "stat")]
fn output_stat(sim: &Simulation) {
    let max_width = get_terminal_width().unwrap_or(120) as usize;
    log::info!("statistics:\n{}", sim.collect_stat().view(max_width));
}

#[cfg(feature = "stat")]
fn get_terminal_width() -> Option<u16> {
    terminal_size().map(|(w, _)| w.0.saturating_sub(20))
}

fn read_input(input: PathBuf) -> Result<String> {
    let mut buf = String::new();
    let mut file = File::open(input)?;
    file.read_to_string(&mut buf)?;
    Ok(buf)
}

fn execute(sim: &mut Simulation, interactive: bool, max_cycles: Option<u64>) -> Result<()> {
    if interactive {
        return interactive::execute_interactive(sim);
    }
    let opt = SimulationOption {
        max_cycles,
        ..SimulationOption::new(ExecuteMode::Run)
    };
    let r = sim.single_cycle(&opt);
    match r.exit_code() {
        Some(c) if c.is_success() => Ok(()),
        Some(_) => {
            let how = sim.get_error_msg().unwrap_or_default();
            Err(anyhow::anyhow!("simulator returns an error: {how}. try executing process with --interactive to debug."))
        }
        None => Err(anyhow::anyhow!(
            "gave up at cycle #{} before the hierarchy drained",
            sim.cycle()
        )),
    }
}
