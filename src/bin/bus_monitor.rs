use can_busoff_sim::config::ScenarioConfig;
use can_busoff_sim::reporter::colored_state;
use can_busoff_sim::runtime::{launch_scenario, BusHandle, RuntimeSnapshot};
use can_busoff_sim::{BusEvent, FaultState};
use colored::*;
use crossterm::{
    cursor,
    event::{self, Event, KeyCode},
    execute,
    terminal::{self, ClearType},
};
use std::io::{self, Write};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

const REFRESH: Duration = Duration::from_millis(100);
const EVENT_LINES: usize = 12;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args: Vec<String> = std::env::args().collect();
    let scenario = match args.get(1) {
        Some(path) => ScenarioConfig::load_from_file(path)?,
        None => ScenarioConfig::default(),
    };

    let run = launch_scenario(&scenario, Vec::new())?;
    let handle = run.handle();

    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    let outcome = dashboard(&handle, &mut stdout).await;

    // restore the terminal before reporting any error from the loop
    let restored = terminal::disable_raw_mode();
    execute!(stdout, terminal::Clear(ClearType::All))?;
    execute!(stdout, cursor::MoveTo(0, 0))?;
    restored?;
    outcome?;

    run.finish().await?;
    println!("Monitor stopped.");

    Ok(())
}

async fn dashboard(
    handle: &BusHandle,
    stdout: &mut io::Stdout,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut events = handle.subscribe();
    let mut recent: Vec<String> = Vec::new();
    execute!(stdout, terminal::Clear(ClearType::All))?;

    loop {
        if event::poll(Duration::from_millis(10))? {
            if let Event::Key(key_event) = event::read()? {
                if key_event.code == KeyCode::Char('q') {
                    return Ok(());
                }
            }
        }

        loop {
            match events.try_recv() {
                Ok(event) => {
                    if let Some(line) = format_event(&event) {
                        recent.push(line);
                        if recent.len() > EVENT_LINES {
                            recent.remove(0);
                        }
                    }
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        let snapshot = handle.snapshot().await?;
        draw(stdout, &snapshot, &recent)?;
        tokio::time::sleep(REFRESH).await;
    }
}

fn format_event(event: &BusEvent) -> Option<String> {
    match event {
        BusEvent::FrameAborted {
            offender,
            state_at_detection,
            tick,
        } => Some(format!(
            "[t={:>8}] {} frame destroyed, offender {} ({})",
            tick,
            "✗".red(),
            offender,
            colored_state(*state_at_detection)
        )),
        BusEvent::FaultStateChanged {
            node, from, to, tick, ..
        } => Some(format!(
            "[t={:>8}] {} {} → {}",
            tick,
            node.to_string().bright_white().bold(),
            colored_state(*from),
            colored_state(*to)
        )),
        _ => None,
    }
}

fn draw(stdout: &mut io::Stdout, snapshot: &RuntimeSnapshot, recent: &[String]) -> io::Result<()> {
    execute!(stdout, cursor::MoveTo(0, 0))?;
    execute!(stdout, terminal::Clear(ClearType::FromCursorDown))?;
    writeln!(
        stdout,
        "\r{}",
        "═══════════════════════════════════════════════════════════════".cyan().bold()
    )?;
    writeln!(
        stdout,
        "\r{}",
        "              CAN FAULT CONFINEMENT MONITOR  (q to quit)       ".cyan().bold()
    )?;
    writeln!(
        stdout,
        "\r{}",
        "═══════════════════════════════════════════════════════════════".cyan().bold()
    )?;
    writeln!(
        stdout,
        "\r Tick: {} │ Bus: {} │ Load: {:.1}%",
        snapshot.tick.to_string().bright_white(),
        snapshot.state.to_string().yellow(),
        snapshot.stats.bus_load() * 100.0
    )?;
    writeln!(stdout, "\r")?;

    for node in &snapshot.nodes {
        let bar_len = usize::from(node.tec.min(256) / 8);
        let bar = "█".repeat(bar_len);
        let bar = match node.state {
            FaultState::ErrorActive => bar.green(),
            FaultState::ErrorPassive => bar.yellow(),
            FaultState::BusOff => bar.red(),
        };
        writeln!(
            stdout,
            "\r {:<22} TEC {:>3} REC {:>3} {:<14} {}",
            node.node.to_string(),
            node.tec,
            node.rec,
            colored_state(node.state),
            bar
        )?;
    }

    writeln!(stdout, "\r")?;
    writeln!(
        stdout,
        "\r Committed: {} │ Aborted: {} │ Flags A/P: {}/{}",
        snapshot.stats.frames_committed,
        snapshot.stats.frames_aborted,
        snapshot.stats.active_flags,
        snapshot.stats.passive_flags
    )?;
    writeln!(stdout, "\r")?;
    for line in recent {
        writeln!(stdout, "\r {}", line)?;
    }
    stdout.flush()
}
