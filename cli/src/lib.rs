//! Command-line front end for the firstfail engine.
//!
//! ## Commands
//!
//! - `firstfail` or `firstfail loop`: watch for new packages and bisect regressions
//! - `firstfail run --success <PKG> --fail <PKG> --case <CASE>`: bisect one case
//! - `firstfail flash --pkg <PKG>`: flash a package
//! - `firstfail test --pkg <PKG> [--case <CASE>]`: flash, prepare and test a package

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use firstfail_core::config::{Config, ConfigLoader};
use firstfail_core::pipeline::Pipeline;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "firstfail", version, about = "Find the build that broke a test case")]
pub struct Cli {
    /// Home directory holding config.toml (defaults to $FIRSTFAIL_HOME or ~/.firstfail).
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Device serial, overriding the configured one.
    #[arg(long, short = 'd', global = true)]
    pub device: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the automation loop until interrupted.
    Loop,
    /// Bisect one test case between a passing and a failing package.
    Run(RunArgs),
    /// Flash a package onto the device.
    Flash(FlashArgs),
    /// Flash a package and run the suite or a single case.
    Test(TestArgs),
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Package on which the case passes.
    #[arg(long, short = 's')]
    pub success: String,

    /// Package on which the case fails.
    #[arg(long, short = 'f')]
    pub fail: String,

    /// Test case to bisect.
    #[arg(long = "case", short = 't')]
    pub case: String,
}

#[derive(Debug, Parser)]
pub struct FlashArgs {
    #[arg(long, short = 'p')]
    pub pkg: String,
}

#[derive(Debug, Parser)]
pub struct TestArgs {
    #[arg(long, short = 'p')]
    pub pkg: String,

    /// Run only this case instead of the whole suite.
    #[arg(long = "case", short = 't')]
    pub case: Option<String>,
}

impl Cli {
    pub fn load_config(&self) -> anyhow::Result<Config> {
        let mut loader = ConfigLoader::new();
        if let Some(home) = &self.home {
            loader = loader.with_home(home.clone());
        }
        let mut config = loader.load()?;
        if let Some(device) = &self.device {
            config.device = device.clone();
        }
        Ok(config)
    }
}

/// Execute the parsed command.
pub async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let config = cli.load_config()?;
    let mut pipeline = Pipeline::from_config(&config)?;
    tracing::info!(
        "firstfail v{} using {} / {} on {}",
        firstfail_core::VERSION,
        config.pkg_manager,
        config.tester,
        config.device
    );

    match cli.command.unwrap_or(Command::Loop) {
        Command::Loop => pipeline.run_forever(&cancel).await?,
        Command::Run(args) => {
            let first = pipeline
                .bisect(&args.case, &args.success, &args.fail, &cancel)
                .await?;
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "first failing build: {}", first.build)?;
            writeln!(stdout, "issue: {}", first.issue)?;
        }
        Command::Flash(args) => {
            pipeline.flash(&args.pkg, &cancel).await?;
            writeln!(std::io::stdout(), "flashed {}", args.pkg)?;
        }
        Command::Test(args) => {
            let results = pipeline
                .flash_and_test(&args.pkg, args.case.as_deref(), &cancel)
                .await?;
            let mut stdout = std::io::stdout().lock();
            for result in &results {
                writeln!(stdout, "{}\t{:?}", result.test_case, result.status)?;
            }
            let failed = results.iter().filter(|r| !r.passed()).count();
            if failed > 0 {
                anyhow::bail!("{failed} of {} test cases failed", results.len());
            }
        }
    }
    Ok(())
}
