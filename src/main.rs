use anyhow::Result;
use ltfs_core::chain::{self, TraverseOrder};
use ltfs_core::cli::{exit_code, Cli, Commands};
use ltfs_core::volume::{MountOptions, MountType, Volume};
use ltfs_core::{logger, TapeDevice};
use tracing::{error, info};

fn main() {
    let args = Cli::parse_args();

    if logger::init(args.verbose).is_err() {
        eprintln!("failed to initialize logging");
        std::process::exit(exit_code::OPERATIONAL_ERROR);
    }

    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!("operation failed: {:#}", e);
            exit_code::OPERATIONAL_ERROR
        }
    };
    std::process::exit(code);
}

#[cfg(windows)]
fn open_device(device: &str) -> Result<TapeDevice> {
    use ltfs_core::scsi::transport::windows::WindowsTransport;
    let transport = WindowsTransport::open(device)?;
    Ok(TapeDevice::open(Box::new(transport))?)
}

#[cfg(not(windows))]
fn open_device(device: &str) -> Result<TapeDevice> {
    anyhow::bail!(
        "no SCSI pass-through backend for this platform (device '{}')",
        device
    );
}

fn mount_for(device: &str, mount_type: MountType) -> Result<std::sync::Arc<Volume>> {
    let dev = open_device(device)?;
    let mut opts = MountOptions::default();
    opts.sync_period = None;
    let vol = Volume::new(dev, opts);
    vol.mount(mount_type)?;
    Ok(vol)
}

fn run(args: Cli) -> Result<i32> {
    match args.command {
        Commands::Check {
            device,
            fix,
            deep_recovery,
            salvage,
        } => {
            let vol = mount_for(&device, MountType::ReadWrite)?;
            let result = chain::check_medium(&vol, fix, deep_recovery, salvage)?;
            vol.unmount()?;
            if !result.errors_found {
                info!("volume is consistent");
                Ok(exit_code::NO_ERRORS)
            } else if result.errors_fixed {
                info!(
                    "volume repaired ({} lost&found entries)",
                    result.lostfound_entries
                );
                Ok(exit_code::CORRECTED)
            } else {
                error!("volume is inconsistent; run again with --fix");
                Ok(exit_code::UNCORRECTED)
            }
        }

        Commands::Points {
            device,
            forward,
            capture_index,
        } => {
            let vol = mount_for(&device, MountType::ReadOnly)?;
            let order = if forward {
                TraverseOrder::Forward
            } else {
                TraverseOrder::Backward
            };
            let points = chain::list_rollback_points(&vol, order, capture_index.as_deref())?;
            for p in &points {
                println!(
                    "generation {:>6}  at {}:{}  back {}  {}  {}",
                    p.generation,
                    p.selfptr.partition,
                    p.selfptr.block,
                    p.backptr
                        .map(|b| format!("{}:{}", b.partition, b.block))
                        .unwrap_or_else(|| "-".to_string()),
                    p.mod_time.format(),
                    p.commit_message.as_deref().unwrap_or("")
                );
            }
            vol.unmount()?;
            Ok(exit_code::NO_ERRORS)
        }

        Commands::Rollback {
            device,
            generation,
            erase_history,
            ..
        } => {
            let vol = mount_for(&device, MountType::ReadWrite)?;
            chain::rollback(&vol, generation, erase_history)?;
            vol.unmount()?;
            info!("volume rolled back to generation {}", generation);
            Ok(exit_code::NO_ERRORS)
        }
    }
}
