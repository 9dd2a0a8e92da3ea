use std::io::{stdin, stdout, Write};

use anyhow::Result;
use bitmask_enum::bitmask;
use cache_sim::sim::{BreakReason, ControlFlow, ExecuteMode, OnBreak, Simulation, SimulationOption, WatchingValues};

#[cfg(feature = "stat")]
use terminal_size::terminal_size;

peg::parser!(grammar command() for str {
    rule decimal() -> u64
        = n:$(quiet!{['0'..='9']+}) {? n.parse().map_err(|_| "decimal") }
        / expected!("decimal")
    rule radix() -> u64
        = quiet!{"0" ['x' | 'X']} n:$(quiet!{['0'..='9'|'a'..='f'|'A'..='F']+}) {?
            u64::from_str_radix(n, 16).map_err(|_| "hexadecimal")
        }
        / decimal()
    rule label() -> String
        = l:$(quiet!{
            [ c if c.is_ascii_alphanumeric() || c == '_' || c == '-' ]+
        }) { l.to_string() }
        / expected!("label")
    rule dir() = "directory" / "dir"
    rule dyn_command() -> ExecuteMode
        = "run" { ExecuteMode::Run }
        / "drain" { ExecuteMode::Drain }
        / "step" step:(__ n:radix() { n })? { ExecuteMode::RunStep(step.unwrap_or(1)) }
    rule static_command() -> StaticCommand
        = "watch" __ wk:watch_kind() { StaticCommand::Watch(Operation::Add, wk) }
        / "unwatch" __ wk:watch_kind() { StaticCommand::Watch(Operation::Remove, wk) }
        / "show" __ sk:show_kind() { StaticCommand::Show(sk) }
    rule watch_kind() -> WatchingKind
        = dir() { WatchingKind::Directory }
        / "cycle" { WatchingKind::Cycle }
        / addr:radix() { WatchingKind::Line(addr) }
    rule show_kind() -> ShowKind
        = "stat" { ShowKind::Stat }
        / "cache" __ l:label() { ShowKind::Cache(l) }
        / "mshr" __ l:label() { ShowKind::Mshr(l) }
        / dir() { ShowKind::Directory }
        / "cycle" { ShowKind::Cycle }
        / ("watchings" / "watch") { ShowKind::Watchings }
    pub(crate) rule parse_command() -> Command
        = _ s:static_command() _ { Command::Static(s) }
        / _ "exit" _ { Command::Exit }
        / _ d:dyn_command()? _ { Command::Dynamic(d) }
        / expected!("command")

    rule ws() = quiet!{[' ' | '\t' | '\r' | '\n']}
        / expected!("whitespace")
    rule _() = ws()*
    rule __() = ws()+
});

pub(crate) enum Command {
    Dynamic(Option<ExecuteMode>),
    Static(StaticCommand),
    Exit,
}

pub(crate) enum StaticCommand {
    Show(ShowKind),
    Watch(Operation, WatchingKind),
}

pub(crate) enum Operation {
    Add,
    Remove,
}

pub(crate) enum WatchingKind {
    Directory,
    Cycle,
    Line(u64),
}

pub(crate) enum ShowKind {
    Stat,
    Cache(String),
    Mshr(String),
    Directory,
    Cycle,
    Watchings,
}

/// what is printed after every break besides the watched lines.
#[bitmask(u8)]
enum WatchExtra {
    Directory,
    Cycle,
}

#[cfg(feature = "stat")]
fn get_terminal_width() -> Option<u16> {
    terminal_size().map(|(w, _)| w.0.saturating_sub(20))
}

pub fn execute_interactive(sim: &mut Simulation) -> Result<()> {
    let mut opt = SimulationOption::new(ExecuteMode::RunStep(1));
    let mut watching_extra = WatchExtra::none();
    #[cfg(feature = "stat")]
    let width = get_terminal_width();
    println!("entering interactive.");
    'interactive: loop {
        let mut show = None;
        let update_mode = 'input: loop {
            if let Some(show) = show.take() {
                match show {
                    ShowKind::Cycle => {
                        println!("cycle #{}", sim.cycle());
                    }
                    #[cfg(feature = "stat")]
                    ShowKind::Stat => {
                        println!("{}", sim.collect_stat().view(width.unwrap_or(60) as usize));
                    }
                    #[cfg(not(feature = "stat"))]
                    ShowKind::Stat => {
                        println!("try compile with `--features stat`");
                    }
                    ShowKind::Cache(label) => match sim.cache_by_label(&label) {
                        Some(cache) => println!("{}", cache.lines_view()),
                        None => println!("no cache labelled {label}"),
                    },
                    ShowKind::Mshr(label) => match sim.cache_by_label(&label) {
                        Some(cache) => println!("{}", cache.mshr_view()),
                        None => println!("no cache labelled {label}"),
                    },
                    ShowKind::Directory => {
                        println!("{}", sim.directory().lines_view());
                    }
                    ShowKind::Watchings => {
                        let mut printed = false;
                        macro_rules! print_unless_printed_yet {
                            () => {
                                if !printed {
                                    println!("watching these values:");
                                    printed = true;
                                }
                            };
                        }
                        if !opt.watchings.is_empty() {
                            print_unless_printed_yet!();
                            print!("\tlines: ");
                            println!(
                                "{}",
                                opt.watchings
                                    .iter()
                                    .map(|a| format!("{a:#x}"))
                                    .collect::<Vec<_>>()
                                    .join(", ")
                            );
                        }
                        if watching_extra.contains(WatchExtra::Directory) {
                            print_unless_printed_yet!();
                            println!("\tdirectory");
                        }
                        if watching_extra.contains(WatchExtra::Cycle) {
                            print_unless_printed_yet!();
                            println!("\tcycle");
                        }
                        if !printed {
                            println!("nothing to watch.");
                        }
                    }
                }
            }
            // prompt string
            print!("{} > ", opt.mode);
            stdout().flush()?;
            let mut str = String::new();
            if stdin().read_line(&mut str)? == 0 {
                break 'interactive;
            }
            let parsed = match command::parse_command(&str) {
                Ok(p) => p,
                Err(e) => {
                    println!("parse error: expected {}", e.expected);
                    continue;
                }
            };
            match parsed {
                Command::Dynamic(d) => {
                    break 'input d;
                }
                Command::Static(s) => {
                    use Operation::*;
                    match s {
                        StaticCommand::Show(s) => show = Some(s),
                        StaticCommand::Watch(Add, w) => {
                            match w {
                                WatchingKind::Line(a) => {
                                    if !opt.watchings.contains(&a) {
                                        opt.watchings.push(a);
                                    }
                                }
                                WatchingKind::Directory => watching_extra |= WatchExtra::Directory,
                                WatchingKind::Cycle => watching_extra |= WatchExtra::Cycle,
                            }
                            show = Some(ShowKind::Watchings)
                        }
                        StaticCommand::Watch(Remove, w) => {
                            match w {
                                WatchingKind::Line(a) => {
                                    if let Some(index) = opt.watchings.iter().position(|aa| *aa == a) {
                                        opt.watchings.remove(index);
                                    }
                                }
                                WatchingKind::Directory => watching_extra &= !WatchExtra::Directory,
                                WatchingKind::Cycle => watching_extra &= !WatchExtra::Cycle,
                            }
                            show = Some(ShowKind::Watchings)
                        }
                    };
                    continue 'input;
                }
                Command::Exit => {
                    sim.exit_sim();
                    break 'interactive;
                }
            }
        };
        if let Some(mode) = update_mode {
            println!("mode: {mode}");
            opt.mode = mode;
        }
        match sim.single_cycle(&opt) {
            ControlFlow::Break(OnBreak {
                watchings: WatchingValues { line_map },
                reason,
            }) => {
                use BreakReason::*;
                match reason {
                    StepEnded => (),
                    CycleLimit => println!("cycle limit reached"),
                    CannotRestart => {
                        let e = sim.get_error_msg().unwrap_or_default();
                        println!("cannot restart simulator due to previous error: {e}")
                    }
                    Failed => {
                        let e = sim.get_error_msg().unwrap_or_default();
                        let cy = sim.cycle();
                        println!("failed at #{cy}: {e}")
                    }
                }
                if watching_extra.contains(WatchExtra::Cycle) {
                    println!("cycle #{}", sim.cycle());
                }
                if watching_extra.contains(WatchExtra::Directory) {
                    println!("{}", sim.directory().lines_view());
                }
                for (addr, holders) in line_map {
                    if holders.is_empty() {
                        println!("{addr:#x}: I everywhere");
                    } else {
                        let holders = holders
                            .iter()
                            .map(|(label, status)| format!("{label}:{status}"))
                            .collect::<Vec<_>>()
                            .join(", ");
                        println!("{addr:#x}: {holders}");
                    }
                }
                continue;
            }
            ControlFlow::Exit => {
                println!("hierarchy drained");
                break 'interactive;
            }
        }
    }
    println!("exiting interactive.");
    Ok(())
}
