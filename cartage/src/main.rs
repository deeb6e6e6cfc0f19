//! Command line entry point.

mod admin;
mod nodes;

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use cartage_core::copy::run_copy_worker;
use cartage_core::{Config, Replicator};
use cartage_sync::compare::Comparator;
use cartage_sync::repair::Repairer;
use cartage_sync::Syncer;

use crate::admin::{Admin, AddOpts};

#[derive(Parser, Debug)]
#[command(
    name = "cartage",
    version,
    about = "Trigger-based table replication for PostgreSQL over a cascaded event queue"
)]
struct Cli {
    /// Job configuration file
    config: PathBuf,

    #[command(subcommand)]
    command: Cmd,

    /// More verbose logging, may repeat
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Log only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Replay events onto the local node
    Worker,

    /// Initial copy of one table (spawned internally by the worker)
    #[command(hide = true)]
    Copy {
        table: String,
        /// Detached mode; accepted for launcher compatibility
        #[arg(short = 'd', long)]
        daemon: bool,
    },

    /// Attach table(s) to the local node
    AddTable {
        tables: Vec<String>,
        #[command(flatten)]
        opts: AddOpts,
    },
    /// Detach table(s) from the local node
    RemoveTable {
        tables: Vec<String>,
        #[arg(long)]
        all: bool,
    },
    /// Change the handler of a replicated table
    ChangeHandler {
        table: String,
        #[command(flatten)]
        opts: AddOpts,
    },
    /// Attach sequence(s) to the local node
    AddSeq {
        seqs: Vec<String>,
        #[command(flatten)]
        opts: AddOpts,
    },
    /// Detach sequence(s) from the local node
    RemoveSeq {
        seqs: Vec<String>,
        #[arg(long)]
        all: bool,
    },
    /// List replicated tables on this node
    Tables {
        /// Show only table names, for scripting
        #[arg(long)]
        names_only: bool,
    },
    /// List replicated sequences on this node
    Seqs,
    /// List objects the local node has not attached yet
    Missing,
    /// Do a full copy of the table(s) again
    Resync {
        tables: Vec<String>,
        #[command(flatten)]
        opts: AddOpts,
    },
    /// Wait until all tables are in sync
    WaitSync,
    /// Compare table structure on both sides
    Check { tables: Vec<String> },
    /// Show pending foreign keys
    Fkeys,
    /// Compare table contents on both sides
    Compare {
        tables: Vec<String>,
        /// Just count rows, do not checksum data
        #[arg(long)]
        count_only: bool,
        #[arg(long)]
        force: bool,
    },
    /// Repair data on the subscriber
    Repair {
        tables: Vec<String>,
        /// Apply fixes directly instead of writing fix.<table>.sql
        #[arg(long)]
        apply: bool,
        /// Buffer size for coreutils sort
        #[arg(long)]
        sort_bufsize: Option<String>,
        /// Extra WHERE condition for selecting rows
        #[arg(long)]
        repair_where: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Execute SQL files on the whole replication set
    Execute { files: Vec<PathBuf> },
    /// Show info about all or specific handlers
    ShowHandlers { names: Vec<String> },

    /// Create the root node of a new cascade
    CreateRoot(nodes::CreateOpts),
    /// Create a branch node
    CreateBranch(nodes::CreateOpts),
    /// Create a leaf node
    CreateLeaf(nodes::CreateOpts),
    /// Show node status
    Status,
    /// Show node status (alias)
    NodeInfo,
    /// List cascade members
    Members,
    /// Pause the local worker
    Pause,
    /// Resume the local worker
    Resume,
    /// Drop a node from the cascade
    DropNode { node: String },
    /// Managed by the queue admin tooling
    #[command(hide = true)]
    ChangeProvider,
    #[command(hide = true)]
    RenameNode,
    #[command(hide = true)]
    TagDead,
    #[command(hide = true)]
    TagAlive,
    #[command(hide = true)]
    Takeover,
    #[command(hide = true)]
    Resurrect,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cartage={level},{level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let cf = Config::load(&cli.config)?;

    match cli.command {
        Cmd::Worker => {
            Replicator::new(cf, None)?.run().await?;
            Ok(0)
        }
        Cmd::Copy { table, daemon: _ } => {
            run_copy_worker(cf, &table).await?;
            Ok(0)
        }
        Cmd::Compare {
            tables,
            count_only,
            force,
        } => {
            let mut syncer = Syncer::new(cf)?;
            syncer.force = force;
            let mut runner = Comparator::new(count_only);
            Ok(syncer.run(&tables, &mut runner).await?)
        }
        Cmd::Repair {
            tables,
            apply,
            sort_bufsize,
            repair_where,
            force,
        } => {
            let mut syncer = Syncer::new(cf)?;
            syncer.force = force;
            let mut runner = Repairer::new(apply, sort_bufsize, repair_where);
            Ok(syncer.run(&tables, &mut runner).await?)
        }

        Cmd::AddTable { tables, opts } => Admin::new(cf).await?.add_table(&tables, &opts).await,
        Cmd::RemoveTable { tables, all } => {
            Admin::new(cf).await?.remove_table(&tables, all).await
        }
        Cmd::ChangeHandler { table, opts } => {
            Admin::new(cf).await?.change_handler(&table, &opts).await
        }
        Cmd::AddSeq { seqs, opts } => Admin::new(cf).await?.add_seq(&seqs, &opts).await,
        Cmd::RemoveSeq { seqs, all } => Admin::new(cf).await?.remove_seq(&seqs, all).await,
        Cmd::Tables { names_only } => Admin::new(cf).await?.tables(names_only).await,
        Cmd::Seqs => Admin::new(cf).await?.seqs().await,
        Cmd::Missing => Admin::new(cf).await?.missing().await,
        Cmd::Resync { tables, opts } => Admin::new(cf).await?.resync(&tables, &opts).await,
        Cmd::WaitSync => Admin::new(cf).await?.wait_sync().await,
        Cmd::Check { tables } => Admin::new(cf).await?.check(&tables).await,
        Cmd::Fkeys => Admin::new(cf).await?.fkeys().await,
        Cmd::Execute { files } => Admin::new(cf).await?.execute(&files).await,
        Cmd::ShowHandlers { names } => Admin::show_handlers(cf, &names),

        Cmd::CreateRoot(opts) => nodes::create_node(cf, "root", opts).await,
        Cmd::CreateBranch(opts) => nodes::create_node(cf, "branch", opts).await,
        Cmd::CreateLeaf(opts) => nodes::create_node(cf, "leaf", opts).await,
        Cmd::Status | Cmd::NodeInfo => nodes::status(cf).await,
        Cmd::Members => nodes::members(cf).await,
        Cmd::Pause => nodes::set_paused(cf, true).await,
        Cmd::Resume => nodes::set_paused(cf, false).await,
        Cmd::DropNode { node } => nodes::drop_node(cf, &node).await,
        Cmd::ChangeProvider
        | Cmd::RenameNode
        | Cmd::TagDead
        | Cmd::TagAlive
        | Cmd::Takeover
        | Cmd::Resurrect => {
            anyhow::bail!("this command is managed by the queue admin tooling")
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}
