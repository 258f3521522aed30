use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "refdata-sync")]
#[command(about = "Keep a local cache of securities and daily bars in sync with a market data provider")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings JSON. Built-in defaults are used when omitted.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Overrides the store directory from the settings.
    #[arg(short, long)]
    pub store: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch missing daily bars
    Update {
        /// Tickers to update; every cached security when empty
        tickers: Vec<String>,

        /// Refetch full history from the earliest allowed date
        #[arg(short, long)]
        force: bool,

        /// Last date to fetch (YYYY-MM-DD), defaults to today at the exchange
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },

    /// Resolve exchange details for a ticker
    Contract { ticker: String },

    /// Fetch company name, sector and industry for a ticker
    Company { ticker: String },

    /// Download the provider's symbol listing
    Symbols {
        /// Print at most this many symbols
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Download the provider's sector list
    Sectors,

    /// Add tickers to the cache without fetching anything
    Add { tickers: Vec<String> },

    /// Remove tickers and their bars from the cache
    Remove { tickers: Vec<String> },

    /// Show cached securities
    List,

    /// Show provider and cache status
    Status,
}
