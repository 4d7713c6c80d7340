// src/cli/mod.rs
//! CLI definitions for aipbag
//!
//! Bag commands work on one bag directory in place:
//! - `init`, `add`, `set-meta`, `remove`, `finalize`, `validate`
//!
//! Service commands use the preservation service and its status store:
//! - `preserve` - submit a request, wait for it, print its status
//! - `status` - show a request's durable status
//! - `recover` - reconcile requests left by an interrupted run

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "aipbag")]
#[command(author = "aipbag contributors")]
#[command(version)]
#[command(about = "Build, validate and preserve dataset bags", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML); built-in defaults when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    // =========================================================================
    // Bag Commands
    // =========================================================================
    /// Create a bag skeleton (or resume an existing bag)
    Init {
        /// Bag root directory
        bag: PathBuf,

        /// Dataset identifier (e.g. ark:/88434/mds2-1234)
        #[arg(long)]
        id: String,
    },

    /// Add a data file to a bag
    Add {
        /// Bag root directory
        bag: PathBuf,

        /// File to copy into the bag
        file: PathBuf,

        /// Path inside the data zone (defaults to the file name)
        #[arg(long)]
        dest: Option<String>,
    },

    /// Merge a JSON record into a component's metadata
    SetMeta {
        /// Bag root directory
        bag: PathBuf,

        /// Component path; empty for the resource record
        #[arg(long, default_value = "")]
        component: String,

        /// JSON file holding the record to merge
        record: PathBuf,
    },

    /// Remove a component (and, for a collection, everything below it)
    Remove {
        /// Bag root directory
        bag: PathBuf,

        /// Component path
        component: String,
    },

    /// Inject components and inventory, write manifests and tag files
    Finalize {
        /// Bag root directory
        bag: PathBuf,
    },

    /// Validate a bag against the preservation profile
    ///
    /// Exits non-zero when any PROB issue is found.
    Validate {
        /// Bag root directory
        bag: PathBuf,

        /// Print issues as JSON instead of text
        #[arg(long)]
        json: bool,
    },

    // =========================================================================
    // Service Commands
    // =========================================================================
    /// Build, validate and archive a bag through the preservation service
    Preserve {
        /// Dataset identifier
        #[arg(long)]
        id: String,

        /// Source metadata document (POD JSON)
        #[arg(long)]
        metadata: PathBuf,

        /// Directory of data files to include
        #[arg(long)]
        data: Option<PathBuf>,

        /// Program converting source metadata to NERDm (stdin -> stdout)
        #[arg(long)]
        transform: Option<PathBuf>,

        /// Extra argument for the transform program (repeatable)
        #[arg(long = "transform-arg")]
        transform_args: Vec<String>,

        /// Directory serialized bags are archived to
        #[arg(long)]
        archive: PathBuf,

        /// Seconds to wait for the request to finish
        #[arg(long)]
        wait_secs: Option<u64>,
    },

    /// Show the status of a preservation request
    Status {
        /// Request ID, or a dataset identifier with --identifier
        target: String,

        /// Treat TARGET as a dataset identifier and show its latest request
        #[arg(long)]
        identifier: bool,
    },

    /// Fail builds left running by an interrupted service and resume queued requests
    Recover {
        /// Archive directory; when given, requeued requests are run to completion
        #[arg(long)]
        archive: Option<PathBuf>,

        /// Seconds to wait for each requeued request
        #[arg(long)]
        wait_secs: Option<u64>,
    },
}
