//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use transfer_core::ByteRange;

/// Smallest part size accepted on the command line (64 KiB).
const MIN_PART_SIZE: u64 = 64 * 1024;

/// Largest part size accepted on the command line (5 GiB).
const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Resumable multipart uploads and ranged downloads for object storage.
///
/// Service location and credentials come from the config file
/// (`$XDG_CONFIG_HOME/transfer/config.toml`) or the flags below;
/// `TRANSFER_ACCESS_TOKEN` overrides the stored token.
#[derive(Parser, Debug)]
#[command(name = "transfer")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Parts in flight per transfer (1-32)
    #[arg(short = 'c', long, global = true, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub concurrency: Option<u8>,

    /// Maximum attempts per part for transient failures (1-10)
    #[arg(short = 'r', long, global = true, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub max_retries: Option<u8>,

    /// Part size in bytes (65536-5368709120)
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(MIN_PART_SIZE..=MAX_PART_SIZE))]
    pub part_size: Option<u64>,

    /// Config file to use instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Service root URL
    #[arg(long, global = true, value_name = "URL")]
    pub base_url: Option<String>,

    /// Library the space belongs to
    #[arg(long, global = true)]
    pub library_id: Option<String>,

    /// Space holding the objects
    #[arg(long, global = true)]
    pub space_id: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Transfer direction and its arguments.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a local file as a multipart object
    Upload {
        /// Local file to read
        local: PathBuf,

        /// Remote object path
        remote: String,

        /// Namespace prefix for the remote path
        #[arg(long)]
        scope: Option<String>,

        /// Replace an existing object instead of failing
        #[arg(long)]
        overwrite: bool,

        /// Custom metadata entry (repeatable)
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,

        /// Continue the upload session printed by an interrupted run
        #[arg(long, value_name = "KEY")]
        resume_key: Option<String>,
    },

    /// Download a remote object into a local file
    Download {
        /// Remote object path
        remote: String,

        /// Local file to write
        local: PathBuf,

        /// Namespace prefix for the remote path
        #[arg(long)]
        scope: Option<String>,

        /// Byte range START-END (END exclusive) or START- for the rest
        #[arg(long, value_name = "START-END", value_parser = parse_range)]
        range: Option<ByteRange>,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("metadata key is empty in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_range(raw: &str) -> Result<ByteRange, String> {
    let (start, end) = raw
        .split_once('-')
        .ok_or_else(|| format!("expected START-END or START-, got '{raw}'"))?;
    let start: u64 = start
        .trim()
        .parse()
        .map_err(|_| format!("invalid range start in '{raw}'"))?;
    let end = match end.trim() {
        "" => None,
        end => Some(
            end.parse::<u64>()
                .map_err(|_| format!("invalid range end in '{raw}'"))?,
        ),
    };
    ByteRange::new(start, end).map_err(|e| e.to_string())
}
