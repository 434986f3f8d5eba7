use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "media-duper")]
#[command(about = "Group duplicate media and merge them safely", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run duplicate detection over every cataloged file
    Detect,
    /// List duplicate groups from the latest detection run
    Groups {
        /// Include resolved and dismissed groups
        #[arg(long)]
        all: bool,
    },
    /// Show the merge plan for a group without changing anything
    Plan {
        group_id: i64,
        /// File id to keep instead of the automatic choice
        #[arg(long)]
        keeper: Option<i64>,
    },
    /// Merge one or more groups, staging removals in the holding area
    Merge {
        #[arg(required = true)]
        group_ids: Vec<i64>,
        /// File id to keep; only valid with a single group
        #[arg(long)]
        keeper: Option<i64>,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// List merges that can still be undone
    UndoList,
    /// Undo a committed merge
    Undo {
        transaction_id: String,
        #[arg(short, long)]
        yes: bool,
    },
    /// Restore transactions left unfinished by a crash
    Recover,
    /// Print configuration values
    PrintConfig,
    /// Truncate all catalog tables
    TruncateDb,
}
