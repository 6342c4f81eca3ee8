//! APKES command-line tools.
//!
//! Simulate a neighborhood of nodes establishing pairwise keys over an
//! in-process radio, and provision or inspect the flash images real
//! deployments boot from.

mod config;
mod sim;

use anyhow::{Result, anyhow};
use apkes_crypto::Prng;
use apkes_store::{FileFlash, NonVolatile, Region, preload_keying, restore_keying_material,
    restore_neighbors};
use clap::{Parser, Subcommand};
use config::SimConfig;
use std::path::{Path, PathBuf};

/// APKES - pairwise key establishment tools
#[derive(Parser)]
#[command(name = "apkes")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a neighborhood of nodes on an in-process radio
    Sim {
        /// Number of nodes
        #[arg(short, long)]
        nodes: Option<usize>,

        /// Simulated runtime in seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Trickle minimum interval in seconds
        #[arg(long)]
        i_min: Option<u64>,

        /// Base PRNG seed byte for a reproducible run
        #[arg(long)]
        seed: Option<u8>,

        /// TOML file with simulation parameters
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Provision a flash image with a PRNG seed and master key
    Preload {
        /// Flash image path (created if missing)
        #[arg(short, long)]
        image: PathBuf,

        /// 16-byte seed as hex; random when omitted
        #[arg(long)]
        seed: Option<String>,

        /// 16-byte master key as hex; random when omitted
        #[arg(long)]
        master: Option<String>,
    },

    /// Inspect a flash image
    Show {
        /// Flash image path
        #[arg(short, long)]
        image: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Sim {
            nodes,
            duration,
            i_min,
            seed,
            config,
        } => {
            let mut sim_config = match config {
                Some(path) => SimConfig::load(&path)?,
                None => SimConfig::default(),
            };
            if let Some(nodes) = nodes {
                sim_config.nodes = nodes;
            }
            if let Some(duration) = duration {
                sim_config.duration_secs = duration;
            }
            if let Some(i_min) = i_min {
                sim_config.i_min_secs = i_min;
            }
            if let Some(seed) = seed {
                sim_config.seed = Some(seed);
            }
            sim::run(&sim_config)
        }
        Commands::Preload {
            image,
            seed,
            master,
        } => preload(&image, seed.as_deref(), master.as_deref()),
        Commands::Show { image } => show(&image),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

fn preload(image: &Path, seed: Option<&str>, master: Option<&str>) -> Result<()> {
    let mut flash = FileFlash::open(image)?;
    let seed = hex_or_random(seed)?;
    let master = hex_or_random(master)?;
    preload_keying(&mut flash, &seed, &master)?;

    println!("image:  {}", image.display());
    println!("seed:   {}", hex::encode(seed));
    println!("master: {}", hex::encode(master));
    Ok(())
}

fn hex_or_random(value: Option<&str>) -> Result<[u8; 16]> {
    match value {
        Some(text) => {
            let bytes = hex::decode(text)?;
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("expected exactly 16 hex-encoded bytes"))
        }
        None => {
            let mut prng = Prng::from_entropy();
            let mut bytes = [0u8; 16];
            prng.fill(&mut bytes);
            Ok(bytes)
        }
    }
}

fn show(image: &Path) -> Result<()> {
    let flash = FileFlash::open(image)?;

    let mut head = [0u8; 20];
    flash.read_at(Region::KeyingMaterial, 0, &mut head)?;
    if head.iter().all(|&b| b == 0xFF) {
        println!("keying region: not provisioned");
    } else {
        let boot_count = u32::from_le_bytes(head[16..20].try_into()?);
        let mut master = [0u8; 16];
        restore_keying_material(&flash, 0, &mut master)?;
        println!("seed:       {}", hex::encode(&head[..16]));
        println!("boot count: {boot_count}");
        println!("master:     {}", hex::encode(master));
    }

    let records = restore_neighbors(&flash)?;
    println!("neighbors:  {}", records.len());
    for r in &records {
        println!(
            "  {} short {:#06x} local {} foreign {} status {} expires {}s",
            hex::encode(r.extended_addr),
            r.short_addr,
            r.local_index,
            r.foreign_index,
            r.status,
            r.expiration_secs
        );
    }
    Ok(())
}
