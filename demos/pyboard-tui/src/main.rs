//! Terminal front end for a MicroPython board.
//!
//! Run with: cargo run -p pyboard-tui -- --port /dev/ttyACM0
//! Without hardware: cargo run -p pyboard-tui -- --simulate

mod app;
mod ui;

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use clap::Parser;
use crossterm::{
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use pyboard_core::{BaudRate, ControllerConfig, OutputRouter, SimulatedBoard};
use pyboard_serial::{SerialConnector, SystemPortLister};
use pyboard_session::{PortMonitor, SessionManager};
use ratatui::{Terminal, backend::CrosstermBackend};

use crate::app::App;

/// Port name of the simulated board.
const SIM_PORT: &str = "sim0";

#[derive(Parser, Debug)]
#[command(name = "pyboard-tui", version, about = "Browse and run code on a MicroPython board")]
struct Cli {
    /// Serial port to connect to at startup
    #[arg(short, long, env = "PYBOARD_PORT")]
    port: Option<String>,

    /// Baud rate, 115200 or 9600 (overrides the config file)
    #[arg(short, long)]
    baud: Option<u32>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use an in-memory board instead of a serial port
    #[arg(long)]
    simulate: bool,

    /// Write tracing output to this file
    #[arg(long, env = "PYBOARD_TRACE_FILE")]
    trace_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.trace_file.as_deref())?;

    let mut config = ControllerConfig::load(cli.config.as_deref())
        .await
        .context("Failed to load config")?;
    if let Some(baud) = cli.baud {
        config.baud_rate = BaudRate::try_from(baud)?;
    }

    let (router, log, console) = OutputRouter::buffered();
    let (manager, mut monitor, port) = if cli.simulate {
        let board = demo_board();
        let manager = SessionManager::new(board.clone(), router.clone(), &config);
        let monitor = PortMonitor::spawn(
            board,
            manager.subscribe_status(),
            router,
            config.poll_interval(),
        );
        (manager, monitor, cli.port.or_else(|| Some(SIM_PORT.to_string())))
    } else {
        let manager = SessionManager::new(
            SerialConnector::new(config.handshake_timeout()),
            router.clone(),
            &config,
        );
        let monitor = PortMonitor::spawn(
            SystemPortLister,
            manager.subscribe_status(),
            router,
            config.poll_interval(),
        );
        (manager, monitor, cli.port)
    };
    tracing::info!(simulate = cli.simulate, ?config, "Starting");

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(manager.clone(), monitor.ports(), log, console, config.baud_rate);
    if let Some(port) = port {
        app.connect_to(port);
    }
    let result = app.run(&mut terminal).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    manager.shutdown().await;
    monitor.shutdown().await;

    result.context("Terminal error")
}

/// Tracing goes to a file; the terminal belongs to the UI.
fn init_tracing(path: Option<&Path>) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let Some(path) = path else {
        return Ok(());
    };
    let file = File::create(path)
        .with_context(|| format!("Failed to create trace file {}", path.display()))?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pyboard_session=debug,pyboard_serial=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .with(filter)
        .init();
    Ok(())
}

fn demo_board() -> SimulatedBoard {
    let board = SimulatedBoard::with_ports([SIM_PORT]);
    board.add_file("boot.py", b"# boot.py -- run on boot-up\n".to_vec());
    board.add_file(
        "main.py",
        b"import time\nfor i in range(3):\n    print('tick', i)\n    time.sleep(1)\n".to_vec(),
    );
    board.add_dir("lib");
    board.add_file("lib/util.py", b"def add(a, b):\n    return a + b\n".to_vec());
    board.script_output("print('hello')", b"hello\r\n".to_vec());
    board.script_output("help()", b"Welcome to the simulated board!\r\n".to_vec());
    board
}
