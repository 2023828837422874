//! Command-line entry surface. Full argument parsing is out of scope beyond a minimal launcher,
//! so this keeps only the two subcommands needed to exercise the library end-to-end, with the
//! same `clap` derive usage, verbosity counting, and help styling as the rest of the ambient
//! logging and config stack.

use clap::builder::styling::{AnsiColor, Styles};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// fieldmux: a multiplexing I/O server for gridded scientific fields.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Silence user-facing informational output on stdout.
    #[arg(short = 'q', long, global = true, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity on stderr: -v debug, -vv trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Write detailed logs to this file (or "stderr") instead of a daily-rolling default.
    #[arg(long, global = true, help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a plan-execution server: bind the configured transport, receive client fields, and
    /// feed every configured plan.
    Serve {
        /// Path to a YAML or JSON configuration document.
        #[arg(short, long)]
        config: PathBuf,

        /// Host to bind the transport on.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind the transport on.
        #[arg(long, default_value_t = 9000)]
        port: u16,

        /// Which configured server this process is, among `servers[*].ports` flattened in
        /// order; determines this process's peer id for hash dispatch.
        #[arg(long, default_value_t = 0)]
        server_index: usize,
    },

    /// Write a single demonstration field through the client facade and close, against an
    /// already-running server.
    ClientDemo {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 9100)]
        port: u16,

        /// Client id, used to derive this client's server assignment under hash dispatch.
        #[arg(long, default_value_t = 0)]
        client_id: u64,
    },
}
