/// Bus-Off Attack Demo
///
/// Runs a victim ECU, a bystander and a timing-synchronised attacker on the
/// simulated bus until the victim is driven bus-off or the run time expires.
use can_busoff_sim::config::ScenarioConfig;
use can_busoff_sim::event_log::{verify_log_file, BusEventLogger};
use can_busoff_sim::reporter::{print_summary, ConsoleReporter};
use can_busoff_sim::runtime::launch_scenario;
use can_busoff_sim::{BusEvent, BusObserver, FaultState, NodeId, Simulation};
use colored::*;
use std::process;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

struct Options {
    scenario: ScenarioConfig,
    sync: bool,
    max_ticks: u64,
    verbose: bool,
    save_path: Option<String>,
}

fn print_usage() {
    println!("{}", "Usage: busoff_attack [OPTIONS]".bright_white().bold());
    println!();
    println!("  --scenario, -s <file>   Load scenario JSON");
    println!("  --duration, -d <secs>   Wall-clock run time (async mode)");
    println!("  --sync                  Deterministic tick-driven run");
    println!("  --ticks <n>             Tick limit for --sync (default 200000)");
    println!("  --lead <ticks>          Attacker lead before the victim is due");
    println!("  --victim-tec <n>        Start the victim with this TEC");
    println!("  --no-attack             Run without the attacker");
    println!("  --log <file>            Write a chained JSON-lines event log");
    println!("  --save-scenario <file>  Write the effective scenario and exit");
    println!("  --verbose, -v           Print every frame");
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(v) => v,
        None => {
            eprintln!("{} Missing value for {}", "✗".red(), flag);
            process::exit(1);
        }
    }
}

fn parse_args() -> Result<Options, Box<dyn std::error::Error + Send + Sync>> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options {
        scenario: ScenarioConfig::default(),
        sync: false,
        max_ticks: 200_000,
        verbose: false,
        save_path: None,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--scenario" | "-s" => {
                options.scenario = ScenarioConfig::load_from_file(value(&args, i, flag))?;
                i += 2;
            }
            "--duration" | "-d" => {
                options.scenario.duration_secs = value(&args, i, flag).parse()?;
                i += 2;
            }
            "--ticks" => {
                options.max_ticks = value(&args, i, flag).parse()?;
                i += 2;
            }
            "--lead" => {
                let lead: u64 = value(&args, i, flag).parse()?;
                if let Some(attacker) = options.scenario.attacker.as_mut() {
                    attacker.lead_ticks = lead;
                }
                i += 2;
            }
            "--victim-tec" => {
                options.scenario.victim.initial_tec = value(&args, i, flag).parse()?;
                i += 2;
            }
            "--log" => {
                options.scenario.event_log_path = Some(value(&args, i, flag).to_string());
                i += 2;
            }
            "--save-scenario" => {
                options.save_path = Some(value(&args, i, flag).to_string());
                i += 2;
            }
            "--no-attack" => {
                options.scenario.attacker = None;
                i += 1;
            }
            "--sync" => {
                options.sync = true;
                i += 1;
            }
            "--verbose" | "-v" => {
                options.verbose = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            other => {
                eprintln!("{} Unknown option: {}", "✗".red(), other);
                print_usage();
                process::exit(1);
            }
        }
    }

    options.scenario.validate()?;
    Ok(options)
}

fn print_banner(scenario: &ScenarioConfig) {
    println!(
        "{}",
        "═══════════════════════════════════════════════════════════════"
            .red()
            .bold()
    );
    println!(
        "{}",
        "              CAN BUS-OFF ATTACK SIMULATION                    "
            .red()
            .bold()
    );
    println!(
        "{}",
        "═══════════════════════════════════════════════════════════════"
            .red()
            .bold()
    );
    println!();
    println!(
        "  Victim:    {} │ ID 0x{:03X} │ every {} ticks",
        scenario.victim.name.bright_white(),
        scenario.victim.can_id,
        scenario.victim.period_ticks
    );
    for bystander in &scenario.bystanders {
        println!(
            "  Bystander: {} │ ID 0x{:03X} │ every {} ticks",
            bystander.name.bright_white(),
            bystander.can_id,
            bystander.period_ticks
        );
    }
    match &scenario.attacker {
        Some(attacker) => println!(
            "  Attacker:  {} │ lead {} ticks",
            attacker.name.bright_red(),
            attacker.lead_ticks
        ),
        None => println!("  Attacker:  {}", "none".bright_black()),
    }
    println!();
}

fn open_logger(
    scenario: &ScenarioConfig,
) -> Result<Option<BusEventLogger>, Box<dyn std::error::Error + Send + Sync>> {
    match &scenario.event_log_path {
        Some(path) => {
            let logger = BusEventLogger::new("busoff_attack", path)?;
            println!(
                "{} Event log: {}",
                "ℹ".bright_blue(),
                logger.log_path().display().to_string().bright_white()
            );
            Ok(Some(logger))
        }
        None => Ok(None),
    }
}

fn report_log(logger: &Option<BusEventLogger>) {
    let Some(logger) = logger else {
        return;
    };
    match verify_log_file(logger.log_path()) {
        Ok(result) if result.verified => println!(
            "{} Event log verified ({} entries)",
            "✓".green(),
            result.total_entries
        ),
        Ok(result) => println!(
            "{} Event log failed verification: {:?}",
            "✗".red(),
            result.issues
        ),
        Err(e) => println!("{} {}", "✗".red(), e),
    }
}

fn run_sync(options: &Options) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let scenario = &options.scenario;
    let mut sim = Simulation::from_scenario(scenario)?;
    sim.add_observer(Box::new(ConsoleReporter::new(options.verbose)));
    let logger = open_logger(scenario)?;
    if let Some(logger) = &logger {
        sim.add_observer(Box::new(logger.clone()));
    }

    let victim = NodeId::new(scenario.victim.name.clone(), scenario.victim.node_id);
    println!("{} Running deterministic simulation...", "→".green());
    match sim.run_until_bus_off(&victim, options.max_ticks)? {
        Some(tick) => println!(
            "{} {} is BUS-OFF at tick {}",
            "☠".red().bold(),
            victim.to_string().bright_white().bold(),
            tick
        ),
        None => println!(
            "{} {} survived {} ticks",
            "✓".green(),
            victim,
            options.max_ticks
        ),
    }

    print_summary(&sim.arbiter().node_snapshots(), sim.arbiter().stats());
    report_log(&logger);
    Ok(())
}

async fn run_async(options: &Options) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let scenario = &options.scenario;
    let logger = open_logger(scenario)?;
    let mut observers: Vec<Box<dyn BusObserver>> =
        vec![Box::new(ConsoleReporter::new(options.verbose))];
    if let Some(logger) = &logger {
        observers.push(Box::new(logger.clone()));
    }

    println!("{} Starting bus runtime...", "→".green());
    let run = launch_scenario(scenario, observers)?;
    let mut events = run.handle().subscribe();
    let victim_id = run.victim().clone();
    println!(
        "{} Running for up to {} seconds...",
        "✓".green().bold(),
        scenario.duration_secs
    );
    println!();

    let deadline = tokio::time::sleep(Duration::from_secs(scenario.duration_secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(BusEvent::FaultStateChanged { node, to: FaultState::BusOff, tick, .. })
                    if node == victim_id =>
                {
                    println!(
                        "{} Victim driven BUS-OFF at tick {}",
                        "☠".red().bold(),
                        tick
                    );
                    // let the attacker's last frame finish
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    let arbiter = run.finish().await?;
    print_summary(&arbiter.node_snapshots(), arbiter.stats());
    report_log(&logger);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let options = parse_args()?;

    if let Some(path) = &options.save_path {
        options.scenario.save_to_file(path)?;
        println!("{} Scenario written to {}", "✓".green(), path.bright_white());
        return Ok(());
    }

    print_banner(&options.scenario);
    if options.sync {
        run_sync(&options)
    } else {
        run_async(&options).await
    }
}
