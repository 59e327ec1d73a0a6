// src/cli.rs
//! CLI definitions for apexd
//!
//! Every service operation is one subcommand. The command implementations
//! live in `main.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "apexd")]
#[command(version)]
#[command(about = "Atomic update package daemon", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML); built-in defaults when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Run the boot activation pass before the command
    #[arg(long, global = true)]
    pub boot: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the boot activation pass
    Boot,

    /// Verify and install packages for activation at next boot
    Stage {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Verify the packages staged for a session
    Submit {
        session_id: i32,

        /// Child session id (repeatable)
        #[arg(long = "child")]
        children: Vec<i32>,

        /// Record the session as a rollback
        #[arg(long)]
        rollback: bool,
    },

    /// Mark a verified session ready for the next boot
    MarkReady { session_id: i32 },

    /// Commit an activated session
    MarkSuccessful { session_id: i32 },

    /// Abort a session that has not been activated
    Abort { session_id: i32 },

    /// List every session
    Sessions,

    /// Show one session
    Session { session_id: i32 },

    /// Show active packages, or the active version of one package
    Active { name: Option<String> },

    /// Activate a package immediately
    Activate { path: PathBuf },

    /// Deactivate a package immediately
    Deactivate { path: PathBuf },

    /// Run pre-install hooks without activating
    Preinstall {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Run post-install hooks without activating
    Postinstall {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Generate an Ed25519 signing key pair
    Keygen {
        /// Output path for the private key; the public key is written next to it with `.pub`
        out: PathBuf,

        /// Key identifier recorded in the key files
        #[arg(long)]
        key_id: Option<String>,
    },

    /// Build a signed package from a payload directory
    Pack {
        /// Directory whose files become the payload
        payload_dir: PathBuf,

        /// Manifest (JSON)
        #[arg(short, long)]
        manifest: PathBuf,

        /// Private key file
        #[arg(short, long)]
        key: PathBuf,

        /// Output package path
        #[arg(short, long)]
        output: PathBuf,
    },
}
