//! vmhost CLI entry point.
//!
//! Runs scripts in order on a persistent VM worker, optionally capturing
//! everything they print.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vmhost_common::{ConfigFile, RuntimeConfig};
use vmhost_core::{Interpreter, LogListener, Script};
use vmhost_logging::{TERMINAL_MARKER, TracingNativeLog, capture};

#[derive(Debug, Parser)]
#[command(name = "vmhost", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "VMHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Capture script stdout/stderr and route it through the log.
    #[arg(long)]
    capture: bool,

    /// Inline script text. May be repeated.
    #[arg(short = 'e', long = "eval")]
    eval: Vec<String>,

    /// Script files, run after the ones listed in the configuration.
    scripts: Vec<PathBuf>,
}

/// Echoes captured lines to the original stdout/stderr.
struct ConsoleListener {
    out: File,
    err: File,
}

impl ConsoleListener {
    fn new() -> io::Result<Self> {
        Ok(Self {
            out: File::from(io::stdout().as_fd().try_clone_to_owned()?),
            err: File::from(io::stderr().as_fd().try_clone_to_owned()?),
        })
    }
}

impl LogListener for ConsoleListener {
    fn accept(&self, line: &str) {
        if line != TERMINAL_MARKER {
            let _ = (&self.out).write_all(format!("{line}\n").as_bytes());
        }
    }

    fn on_error(&self, line: &str) {
        let _ = (&self.err).write_all(format!("{line}\n").as_bytes());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Log to a copy of stderr taken before any redirection, so our own
    // events never feed back into capture.
    let log_writer = File::from(
        io::stderr()
            .as_fd()
            .try_clone_to_owned()
            .context("Failed to duplicate stderr")?,
    );

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vmhost=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(Arc::new(log_writer)))
        .init();

    info!("Starting vmhost");

    let result = run(cli).await;

    // Restores stdio before any error is printed.
    Interpreter::destroy_global();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let (mut config, entries) = match &cli.config {
        Some(path) => {
            let file = ConfigFile::from_file(path)
                .with_context(|| format!("Failed to load config '{}'", path.display()))?;
            (file.runtime, file.scripts)
        }
        None => (RuntimeConfig::default(), Vec::new()),
    };
    if cli.capture {
        config.logging.enabled = true;
    }

    let mut jobs = Vec::new();
    for entry in entries {
        jobs.push((entry.id, Script::from_file(&entry.path)?));
    }
    for path in &cli.scripts {
        jobs.push((path.display().to_string(), Script::from_file(path)?));
    }
    for (i, text) in cli.eval.into_iter().enumerate() {
        jobs.push((format!("eval-{i}"), Script::from(text)));
    }
    if jobs.is_empty() {
        anyhow::bail!("Nothing to run: pass script files, --eval, or [[scripts]] in the config");
    }

    let listener: Option<Arc<dyn LogListener>> = if config.logging.enabled {
        capture::set_native_log(Some(Arc::new(TracingNativeLog)));
        Some(Arc::new(
            ConsoleListener::new().context("Failed to duplicate stdio")?,
        ))
    } else {
        None
    };

    info!(
        scripts = jobs.len(),
        program = %config.engine.program,
        capture = config.logging.enabled,
        "Configuration loaded"
    );

    let mut interpreter = Interpreter::new(config, listener);
    let mut pending = Vec::with_capacity(jobs.len());
    for (name, script) in jobs {
        let completion = interpreter
            .submit(script)
            .with_context(|| format!("Failed to start VM for '{name}'"))?;
        pending.push((name, completion));
    }

    let mut failures = 0usize;
    for (name, completion) in pending {
        let status = completion.await;
        if status == 0 {
            info!(script = %name, "Script completed");
        } else {
            warn!(script = %name, status, "Script failed");
            failures += 1;
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} script(s) failed");
    }
    Ok(())
}
