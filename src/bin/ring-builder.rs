//! Operator tool over a persisted ring builder.
//!
//! Usage:
//!   ring-builder --builder object.builder create 10 3
//!   ring-builder --builder object.builder add --zone 1 --weight 100 --address 10.0.0.1:6200 --drive sdb
//!   ring-builder --builder object.builder rebalance --ring object.ring

use {
    anyhow::{Context, Result, bail},
    clap::{Parser, Subcommand},
    replica_ring::{
        DeviceSpec,
        Dispersion,
        RebalanceSummary,
        RingBuilder,
        RingError,
        config::BuilderConfig,
    },
    std::path::{Path, PathBuf},
    tracing::info,
    tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser, Debug)]
#[command(name = "ring-builder")]
#[command(about = "Build and rebalance partition rings")]
#[command(version)]
struct Args {
    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Builder state file
    #[arg(long, default_value = "ring.builder")]
    builder: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty builder
    Create {
        /// Partition count is 2^part_power
        part_power: u8,
        replicas: usize,
        #[arg(long, default_value = "")]
        hash_prefix: String,
        #[arg(long, default_value = "")]
        hash_suffix: String,
        /// Allow moving several replicas of a partition in one rebalance
        #[arg(long)]
        multi_move: bool,
    },

    /// Add a device
    Add {
        #[arg(long, default_value = "0")]
        region: u32,
        #[arg(long, default_value = "0")]
        zone: u32,
        #[arg(long)]
        weight: f64,
        /// Serving node, host:port
        #[arg(long)]
        address: String,
        /// Mount point or drive name
        #[arg(long)]
        drive: String,
    },

    /// Change a device's weight
    SetWeight { id: u16, weight: f64 },

    /// Stop assigning partitions to a device and empty it gradually
    Drain { id: u16 },

    /// Remove a device; its partitions move at the next rebalance
    Remove { id: u16 },

    /// Reassign partitions and write the ring
    Rebalance {
        /// Ring file to write
        #[arg(long)]
        ring: PathBuf,
        /// Accept replicas sharing a zone when dispersion is impossible
        #[arg(long)]
        degraded: bool,
    },

    /// Print devices and assignment statistics
    Show,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Commands::Create {
            part_power,
            replicas,
            hash_prefix,
            hash_suffix,
            multi_move,
        } => {
            if args.builder.exists() {
                bail!("{} already exists", args.builder.display());
            }
            let config = BuilderConfig {
                part_power,
                replicas,
                one_replica_move_per_rebalance: !multi_move,
                hash_prefix,
                hash_suffix,
            };
            let builder = RingBuilder::new(&config)?;
            builder.save(&args.builder)?;
            info!(path = %args.builder.display(), part_power, replicas, "builder created");
        }
        Commands::Add {
            region,
            zone,
            weight,
            address,
            drive,
        } => {
            let mut builder = load(&args.builder)?;
            let spec = DeviceSpec::new(address, drive, weight).zone(zone).region(region);
            let id = builder.add_device(spec)?;
            builder.save(&args.builder)?;
            println!("device {id} added");
        }
        Commands::SetWeight { id, weight } => {
            edit(&args.builder, |b| b.set_weight(id, weight))?;
            println!("device {id} weight set to {weight}");
        }
        Commands::Drain { id } => {
            edit(&args.builder, |b| b.drain(id))?;
            println!("device {id} draining");
        }
        Commands::Remove { id } => {
            edit(&args.builder, |b| b.remove_device(id))?;
            println!("device {id} marked for removal");
        }
        Commands::Rebalance { ring, degraded } => {
            let mut builder = load(&args.builder)?;
            let dispersion = if degraded {
                Dispersion::Degraded
            } else {
                Dispersion::Strict
            };
            let rebalance = match builder.rebalance_with(dispersion) {
                Ok(rebalance) => rebalance,
                Err(err @ RingError::InfeasiblePlacement { .. }) => {
                    bail!("{err}; nothing written, retry with --degraded to accept it")
                }
                Err(err) => return Err(err.into()),
            };
            let summary = RebalanceSummary::new(&rebalance, builder.dispersion());
            rebalance
                .ring
                .save(&ring)
                .with_context(|| format!("writing {}", ring.display()))?;
            builder.save(&args.builder)?;
            println!("{summary}");
        }
        Commands::Show => show(&load(&args.builder)?),
    }

    Ok(())
}

fn load(path: &Path) -> Result<RingBuilder> {
    RingBuilder::load(path).with_context(|| format!("loading {}", path.display()))
}

fn edit(path: &Path, change: impl FnOnce(&mut RingBuilder) -> replica_ring::RingResult<()>) -> Result<()> {
    let mut builder = load(path)?;
    change(&mut builder)?;
    builder.save(path)?;
    Ok(())
}

fn show(builder: &RingBuilder) {
    println!(
        "{} partitions, {} replicas, version {}, balance {:.2}%, dispersion {:.2}%",
        builder.partition_count(),
        builder.replicas(),
        builder.version(),
        builder.balance(),
        builder.dispersion()
    );
    println!("{:<32} {:>8} {:>10} {:>9}", "device", "weight", "state", "assigned");
    for device in builder.devices().iter() {
        println!(
            "{:<32} {:>8.2} {:>10} {:>9}",
            device.to_string(),
            device.weight,
            device.state.to_string(),
            builder.assigned(device.id)
        );
    }
}
