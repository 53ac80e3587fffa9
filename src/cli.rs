use clap::{Parser, Subcommand, ValueEnum};

fn get_version() -> &'static str {
    const BASE_VERSION: &str = env!("CARGO_PKG_VERSION");

    // If there's a git tag at HEAD, use just the tag (release build)
    if let Some(tag) = option_env!("RELMA_GIT_TAG") {
        return tag;
    }

    // Not on a tag - include commit hash and branch (dev build)
    let commit = option_env!("RELMA_GIT_COMMIT").unwrap_or("unknown");
    let branch = option_env!("RELMA_GIT_BRANCH").unwrap_or("unknown");

    // Leaked once at startup
    let version = format!("v{}-{} ({})", BASE_VERSION, commit, branch);
    Box::leak(version.into_boxed_str())
}

#[derive(Parser)]
#[command(name = "relma")]
#[command(about = "relma manages GitHub Releases versioning")]
#[command(version = get_version(), propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (use multiple times for more detail)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Reduce output to errors only
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the config file and the relma root directory
    Init,

    /// Edit the config file
    Edit {
        /// Editor to use instead of $EDITOR
        #[arg(short, long)]
        editor: Option<String>,
    },

    /// Install a GitHub release asset
    #[command(
        after_help = "Examples:\n  relma install https://github.com/jiro4989/nimjson/releases/download/v1.2.6/nimjson_linux.tar.gz\n  relma install jiro4989/nimjson   (reinstall the latest tag of a tracked release)"
    )]
    Install {
        /// Release asset URL, or owner/repo of an installed release
        github_release_url: String,
    },

    /// Check installed releases for newer tags
    Update {
        /// Releases to check (owner/repo); all when omitted
        releases: Vec<String>,
    },

    /// Upgrade installed releases to their latest tags
    Upgrade {
        /// Upgrade without asking for confirmation
        #[arg(short, long)]
        yes: bool,
        /// Releases to upgrade (owner/repo); all when omitted
        releases: Vec<String>,
    },

    /// Uninstall a release and every file it installed
    Uninstall {
        /// Release to remove (e.g., 'owner/repo')
        owner_repo: String,
    },

    /// List installed releases
    List {
        /// Output format
        #[arg(long, value_enum, default_value_t = ListFormat::Plain)]
        format: ListFormat,
    },

    /// Print the relma root directory
    Root,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    Plain,
    Json,
    Yaml,
}
