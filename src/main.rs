mod cli;

use anyhow::{anyhow, Result};
use clap::Parser;
use cli::{Cli, Commands, ListFormat};
use relma::config::{self, Config};
use relma::github::GitHubClient;
use relma::lifecycle::{
    BatchReport, EntryStatus, InstallReport, Operation, Outcome, PlannedEntry, UpgradePlan,
};
use relma::manifest::Releases;
use relma::reference::{parse_identity, ReleaseRef};
use relma::{App, RelmaError, Scope};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<RelmaError>() {
                Some(err) => eprintln!("error[{}]: {:#}", err.class(), e),
                None => eprintln!("error: {:#}", e),
            }
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config_path = config::config_file_path()?;
    let config = config::load_config(&config_path)?;

    match cli.command {
        Commands::Init => {
            config::init_config_file(&config_path, &config)?;
            let report = app(config, cli.quiet).init()?;
            println!("config:   {}", config_path.display());
            println!("root:     {}", report.root.display());
            println!("bin:      {}", report.bin_dir.display());
            println!("releases: {}", report.releases_file.display());
        }

        Commands::Edit { editor } => {
            if !config_path.exists() {
                return Err(anyhow!(
                    "Config file {} does not exist. Run `relma init` first.",
                    config_path.display()
                ));
            }
            config::edit_config(&config_path, editor.as_deref())?;
        }

        Commands::Install { github_release_url } => {
            let reference = ReleaseRef::parse(&github_release_url)?;
            let app = app(config, cli.quiet);
            if let Outcome::Installed(report) = app.run(Operation::Install(reference)).await? {
                print_install(&report);
            }
        }

        Commands::Update { releases } => {
            let scope = Scope::parse(&releases)?;
            let app = app(config, cli.quiet);
            if let Outcome::Updated(report) = app.run(Operation::Update(scope)).await? {
                print_batch(&report);
                return Ok(exit_code(&report));
            }
        }

        Commands::Upgrade { yes, releases } => {
            let scope = Scope::parse(&releases)?;
            let app = app(config, cli.quiet);
            match app.run(Operation::Upgrade { scope, yes }).await? {
                Outcome::Upgraded(report) => {
                    print_batch(&report);
                    return Ok(exit_code(&report));
                }
                Outcome::UpgradePlanned(plan) => {
                    print_plan(&plan);
                    if plan.is_empty() {
                        let report = settle(plan);
                        return Ok(exit_code(&report));
                    }
                    if !confirm("Upgrade these releases?")? {
                        println!("Nothing upgraded.");
                        return Ok(exit_code(&settle(plan)));
                    }
                    let report = app.apply_upgrade(plan).await?;
                    print_batch(&report);
                    return Ok(exit_code(&report));
                }
                _ => {}
            }
        }

        Commands::Uninstall { owner_repo } => {
            let (owner, repo) = parse_identity(&owner_repo)?;
            let app = app(config, cli.quiet);
            if let Outcome::Uninstalled(report) =
                app.run(Operation::Uninstall { owner, repo }).await?
            {
                for path in &report.missing {
                    eprintln!("warning: {} was already missing", path.display());
                }
                for path in &report.kept {
                    eprintln!("note: kept {}, another release provides it", path.display());
                }
                println!(
                    "Uninstalled {} {} ({} file(s) removed)",
                    report.release.identity(),
                    report.release.version,
                    report.removed.len()
                );
            }
        }

        Commands::List { format } => {
            let releases = app(config, cli.quiet).list()?;
            print_releases(&releases, format)?;
        }

        Commands::Root => {
            println!("{}", config.relma_root.display());
        }
    }

    Ok(0)
}

fn app(config: Config, quiet: bool) -> App {
    let client = GitHubClient::new(&config).with_progress(!quiet);
    App::new(config, client)
}

fn setup_logging(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if cli.quiet {
        "error"
    } else if cli.verbose == 0 {
        "warn"
    } else if cli.verbose == 1 {
        "info"
    } else {
        "debug"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();
}

fn confirm(prompt: &str) -> Result<bool> {
    let term = console::Term::stderr();
    term.write_str(&format!("{} [y/N] ", prompt))?;
    let answer = term.read_line()?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn exit_code(report: &BatchReport) -> i32 {
    if report.has_failures() {
        1
    } else {
        0
    }
}

/// Report of a plan that will not be applied.
fn settle(plan: UpgradePlan) -> BatchReport {
    let mut report = BatchReport::default();
    for entry in plan.entries {
        if let PlannedEntry::Settled(settled) = entry {
            report.entries.push(settled);
        }
    }
    report
}

fn print_install(report: &InstallReport) {
    let release = &report.release;
    match &report.previous_version {
        Some(previous) if previous != &release.version => println!(
            "Installed {} {} (replaced {})",
            release.identity(),
            release.version,
            previous
        ),
        _ => println!("Installed {} {}", release.identity(), release.version),
    }
    for file in &release.installed_files {
        println!("  {}", file.path);
    }
}

fn print_plan(plan: &UpgradePlan) {
    for entry in &plan.entries {
        match entry {
            PlannedEntry::Pending(pending) => println!(
                "  {}: {} -> {}",
                pending.current.identity(),
                pending.current.version,
                pending.resolved.version
            ),
            PlannedEntry::Settled(settled) => match &settled.status {
                EntryStatus::Failed(e) => {
                    println!("  {}: error[{}]: {}", settled.identity(), e.class(), e)
                }
                EntryStatus::Current { version } => {
                    println!("  {}: {} (up to date)", settled.identity(), version)
                }
                _ => {}
            },
        }
    }
    if plan.is_empty() {
        println!("All releases are up to date.");
    }
}

fn print_batch(report: &BatchReport) {
    for entry in &report.entries {
        let identity = entry.identity();
        match &entry.status {
            EntryStatus::Current { version } => println!("  {}: {} (up to date)", identity, version),
            EntryStatus::UpdateAvailable { current, latest } => {
                println!("  {}: {} -> {} (update available)", identity, current, latest)
            }
            EntryStatus::Upgraded { from, to } => {
                println!("  {}: {} -> {} (upgraded)", identity, from, to)
            }
            EntryStatus::Failed(e) => println!("  {}: error[{}]: {}", identity, e.class(), e),
        }
    }
    let failed = report.failures().count();
    if failed > 0 {
        println!("{} of {} release(s) failed", failed, report.entries.len());
    }
}

fn print_releases(releases: &Releases, format: ListFormat) -> Result<()> {
    match format {
        ListFormat::Json => println!("{}", serde_json::to_string_pretty(releases)?),
        ListFormat::Yaml => print!("{}", serde_yaml::to_string(releases)?),
        ListFormat::Plain => {
            if releases.is_empty() {
                println!("No releases installed yet.");
            }
            for release in releases {
                let latest = match &release.latest_version {
                    Some(latest) if latest != &release.version => {
                        format!(" (latest: {})", latest)
                    }
                    _ => String::new(),
                };
                println!("{} {}{}", release.identity(), release.version, latest);
            }
        }
    }
    Ok(())
}
