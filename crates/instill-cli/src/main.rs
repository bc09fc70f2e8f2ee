use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use instill_installer::{default_system_root, InstallRequest, SystemLayout};
use tracing_subscriber::EnvFilter;

mod completion;
mod core_flows;
mod render;

use completion::{write_completions_script, CliCompletionShell};
use core_flows::{
    run_build_command, run_doctor_command, run_install_command, run_list_command,
    run_plan_command, run_uninstall_command, run_validate_command, run_verify_command,
};
use render::current_output_style;

const ROOT_ENV: &str = "INSTILL_ROOT";

#[derive(Parser, Debug)]
#[command(name = "instill")]
#[command(about = "Declarative installer package compiler and engine", long_about = None)]
struct Cli {
    /// System root to install into. Falls back to $INSTILL_ROOT, then the
    /// per-user default.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a descriptor and write the package artifact.
    Build {
        descriptor: PathBuf,
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Run every build-time check without writing anything.
    Validate {
        descriptor: PathBuf,
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Show the resolved mode and ordered actions without changing anything.
    Plan {
        package: PathBuf,
        #[command(flatten)]
        options: InstallOptions,
    },
    Install {
        package: PathBuf,
        #[command(flatten)]
        options: InstallOptions,
    },
    Uninstall {
        upgrade_code: String,
    },
    List,
    /// Check that every installed component's key path is present.
    Verify {
        upgrade_code: String,
    },
    Doctor,
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
struct InstallOptions {
    /// Treat the session as running with administrative rights.
    #[arg(long)]
    elevated: bool,
    /// Re-install the same version instead of declining.
    #[arg(long)]
    repair: bool,
    #[arg(long = "feature", value_name = "ID")]
    features: Vec<String>,
    #[arg(long = "without-feature", value_name = "ID")]
    without_features: Vec<String>,
}

impl InstallOptions {
    fn request(&self) -> InstallRequest {
        InstallRequest {
            elevated: self.elevated,
            repair: self.repair,
            include_features: self.features.clone(),
            exclude_features: self.without_features.clone(),
        }
    }
}

fn resolve_system_root(flag: Option<&Path>, env_root: Option<&str>) -> Result<PathBuf> {
    if let Some(root) = flag {
        return Ok(root.to_path_buf());
    }
    match env_root.map(str::trim).filter(|value| !value.is_empty()) {
        Some(root) => Ok(PathBuf::from(root)),
        None => default_system_root(),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
}

fn run_cli(cli: Cli) -> Result<ExitCode> {
    let output_style = current_output_style();
    let system_layout = || -> Result<SystemLayout> {
        let env_root = std::env::var(ROOT_ENV).ok();
        Ok(SystemLayout::new(resolve_system_root(
            cli.root.as_deref(),
            env_root.as_deref(),
        )?))
    };

    match &cli.command {
        Commands::Build {
            descriptor,
            source,
            output,
        } => run_build_command(descriptor, source, output, output_style),
        Commands::Validate { descriptor, source } => {
            run_validate_command(descriptor, source.as_deref(), output_style)
        }
        Commands::Plan { package, options } => {
            run_plan_command(&system_layout()?, package, &options.request(), output_style)
        }
        Commands::Install { package, options } => {
            run_install_command(&system_layout()?, package, &options.request(), output_style)
        }
        Commands::Uninstall { upgrade_code } => {
            run_uninstall_command(&system_layout()?, upgrade_code, output_style)
        }
        Commands::List => run_list_command(&system_layout()?, output_style),
        Commands::Verify { upgrade_code } => {
            run_verify_command(&system_layout()?, upgrade_code, output_style)
        }
        Commands::Doctor => run_doctor_command(&system_layout()?, output_style),
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout();
            write_completions_script(*shell, &mut stdout)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run_cli(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
