use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::parse_size;

/// flowpipe: NetFlow v5 collector and flow-record sorter
#[derive(Parser, Debug)]
#[command(name = "flowpipe", version, about)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Receive NetFlow v5 PDUs and write flow records to a file
    Collect(CollectArgs),
    /// Sort flow files by a list of fields
    Sort(SortArgs),
}

#[derive(Args, Debug, Default)]
pub struct CollectArgs {
    /// Flow file to write (overrides [collect] output)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Add a probe listening on HOST:PORT or :PORT (repeatable)
    #[arg(short, long)]
    pub listen: Vec<String>,

    /// Add a probe listening on a UNIX datagram socket
    #[arg(long, conflicts_with_all = ["listen", "pdu_file"])]
    pub unix_socket: Option<PathBuf>,

    /// Add a probe replaying a file of raw v5 PDUs
    #[arg(long, conflicts_with = "listen")]
    pub pdu_file: Option<PathBuf>,

    /// Name of the probe created from the command line
    #[arg(long, default_value = "cli")]
    pub probe_name: String,

    /// Hosts the command-line probe accepts PDUs from (repeatable)
    #[arg(long)]
    pub accept_from: Vec<String>,

    /// Log flags for the command-line probe: timestamps, missing, bad, none
    #[arg(long, value_delimiter = ',')]
    pub log_flags: Vec<String>,

    /// Seconds between statistics lines (0 = only at exit)
    #[arg(long)]
    pub stats_interval: Option<u64>,

    /// Write a JSON statistics summary on exit
    #[arg(long)]
    pub stats_json: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct SortArgs {
    /// Flow files to sort
    pub inputs: Vec<PathBuf>,

    /// Comma-separated list of fields to sort by
    #[arg(long)]
    pub fields: Option<String>,

    /// Sort in descending order
    #[arg(long)]
    pub reverse: bool,

    /// Inputs are already sorted by --fields; only merge them
    #[arg(long)]
    pub presorted_input: bool,

    /// Memory budget, e.g. 512m or 2g
    #[arg(short = 'S', long, value_parser = parse_size)]
    pub sort_buffer_size: Option<usize>,

    /// Directory for temporary files
    #[arg(short = 'T', long)]
    pub temp_directory: Option<PathBuf>,

    /// Output flow file (default: standard output)
    #[arg(short, long)]
    pub output_path: Option<PathBuf>,

    /// Most files to merge at once
    #[arg(long)]
    pub max_merge_files: Option<usize>,

    /// Print the available sort fields and exit
    #[arg(long)]
    pub list_fields: bool,
}
