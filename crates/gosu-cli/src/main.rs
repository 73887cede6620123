//! gosu CLI entry point.
//!
//! Usage:
//!   gosu                       # Run the daemon if the lock is free, else client help
//!   gosu daemon                # Run as daemon (falls through to client when one runs)
//!   gosu list|ls <pattern>     # List jobs
//!   gosu view|v <pattern>      # Auto-refreshing job view
//!   gosu launch|a <task> [..]  # Launch a job
//!   gosu update|u <task> [..]  # Install/replace a job without starting it
//!   gosu start|stop|restart|kill|delete <pattern>
//!   gosu signal <name>         # Fire a named event
//!   gosu get <job:key>         # Read a whiteboard value
//!   gosu put <job:key> <json>  # Write a whiteboard value
//!   gosu shutdown              # Stop the daemon

mod args;
mod commands;
mod table;

use std::process::ExitCode;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> ExitCode {
    // Respects RUST_LOG.
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let verb = argv.first().map(|s| s.to_lowercase()).unwrap_or_default();

    if (argv.is_empty() || verb == "daemon") && gosu_core::lock::try_acquire() {
        return run_daemon();
    }

    match run_client(&verb, &argv[1.min(argv.len())..]) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Mirror every job log line onto the daemon's console.
struct ConsoleHook;

impl gosu_core::logging::LogHook for ConsoleHook {
    fn write(&self, _namespace: &str, line: &str, _stream: gosu_core::logging::Stream) {
        print!("{line}");
    }
}

fn run_daemon() -> ExitCode {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let _hook = gosu_core::logging::register_hook(std::sync::Arc::new(ConsoleHook));
    let result = rt.block_on(async {
        let session = gosu_core::Session::open().await?;
        session.wait().await;
        Ok::<_, anyhow::Error>(())
    });
    gosu_core::lock::Lockfile::at_home().release();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run_client(verb: &str, rest: &[String]) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(commands::run(verb, rest))
}
