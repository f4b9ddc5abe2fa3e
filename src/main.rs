//! photosync - back up a photo library to encrypted cloud storage
//!
//! Credentials come from the environment (PHOTOSYNC_*), tuning from a TOML
//! config file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use photosync::bridge::HttpBridge;
use photosync::checkpoint::{CheckpointStore, FileCheckpointStore};
use photosync::config::{default_config_path, SyncConfig};
use photosync::context::{NetworkCredentials, SyncContext, SyncIdentity};
use photosync::fs_library::{DirectoryLibrary, FileUriResolver, LibraryFilter};
use photosync::index::LocalSyncIndex;
use photosync::logger::{NoopLogger, SyncLogger, TextLogger};
use photosync::progress::SyncProgress;
use photosync::remote_pull::RemotePullStatus;
use photosync::transfer::Transfer;
use photosync::{SyncManager, SyncManagerStatus};

#[derive(Parser, Debug)]
#[command(author, version, about = "photosync - encrypted device-to-cloud photo sync")]
struct Args {
    /// Config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Append log lines to this file
    #[arg(long = "log-file", global = true)]
    log_file: Option<PathBuf>,

    /// Hide the progress bar
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload every photo in a directory that the cloud does not have yet
    Sync {
        /// Root of the photo library
        library: PathBuf,

        /// Skip directories matching these patterns
        #[arg(long = "xd", action = clap::ArgAction::Append)]
        exclude_dirs: Vec<String>,

        /// Include videos
        #[arg(long)]
        videos: bool,
    },
    /// Pull photos changed in the cloud and cache their previews
    Pull,
    /// Show the local index and checkpoints
    Status,
    /// Download and decrypt a single file
    Download {
        file_id: String,
        dest: PathBuf,

        /// Bucket id (defaults to PHOTOSYNC_BUCKET)
        #[arg(long)]
        bucket: Option<String>,
    },
    /// Wipe the local index and checkpoints
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = SyncConfig::load(&config_path)?;

    // Choose logger once
    let logger: Arc<dyn SyncLogger> = match args.log_file {
        Some(ref p) => match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(_) => Arc::new(NoopLogger),
        },
        None => Arc::new(NoopLogger),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;

    let code = runtime.block_on(async {
        match args.command {
            Command::Sync {
                library,
                exclude_dirs,
                videos,
            } => {
                let filter = LibraryFilter {
                    exclude_dirs,
                    include_videos: videos,
                };
                sync_library(config, library, filter, logger, !args.quiet).await
            }
            Command::Pull => pull(config, logger, !args.quiet).await,
            Command::Status => status(&config).map(|_| 0),
            Command::Download {
                file_id,
                dest,
                bucket,
            } => download(config, logger, &file_id, dest, bucket).await.map(|_| 0),
            Command::Reset { yes } => reset(&config, yes).map(|_| 0),
        }
    })?;
    std::process::exit(code);
}

fn connect(
    config: SyncConfig,
    library: PathBuf,
    filter: LibraryFilter,
    logger: Arc<dyn SyncLogger>,
) -> Result<Arc<SyncContext>> {
    let identity = SyncIdentity::from_env()?;
    let credentials = NetworkCredentials::from_env()?;
    let ctx = SyncContext::connect(
        config,
        identity,
        credentials,
        Arc::new(DirectoryLibrary::new(library, filter)),
        Arc::new(FileUriResolver),
        logger,
    )?;
    Ok(Arc::new(ctx))
}

async fn sync_library(
    config: SyncConfig,
    library: PathBuf,
    filter: LibraryFilter,
    logger: Arc<dyn SyncLogger>,
    show_progress: bool,
) -> Result<i32> {
    let ctx = connect(config, library, filter, logger)?;
    let manager = SyncManager::new(ctx);
    let progress = Arc::new(SyncProgress::new(show_progress));

    let p = progress.clone();
    manager.on_total_photos_calculated(move |total| p.set_total(total));
    let p = progress.clone();
    manager.on_upload_start(move |item| p.set_stage(&format!("uploading {}", item.display_name())));
    let p = progress.clone();
    manager.on_photo_sync_completed(move |err, item| {
        let name = item.map(|i| i.display_name());
        if let Some(err) = err {
            p.println(&format!(
                "failed {}: {:#}",
                name.as_deref().unwrap_or("photo"),
                err
            ));
        }
        p.item_done(name.as_deref());
    });
    let p = progress.clone();
    manager.on_storage_limit_reached(move || {
        p.println("Storage limit reached; remaining photos were not uploaded.")
    });
    let p = progress.clone();
    manager.on_scan_error(move |err| p.println(&format!("Library scan failed: {err:#}")));

    manager.run();
    let status = tokio::select! {
        s = manager.wait_until_settled() => s,
        _ = tokio::signal::ctrl_c() => {
            manager.destroy();
            progress.finish("Interrupted");
            return Ok(130);
        }
    };

    let counters = manager.counters();
    progress.finish(&format!(
        "{}: {} already synced, {} uploaded, {} failed",
        status.as_str(),
        counters.total_already_synced,
        counters.total_synced,
        counters.total_failed
    ));
    Ok(match status {
        SyncManagerStatus::Completed if counters.total_failed == 0 => 0,
        SyncManagerStatus::Completed => 2,
        _ => 1,
    })
}

async fn pull(config: SyncConfig, logger: Arc<dyn SyncLogger>, show_progress: bool) -> Result<i32> {
    // The pull never scans; an empty library directory is enough.
    let empty = config.tmp_dir().join("empty-library");
    std::fs::create_dir_all(&empty)?;
    let ctx = connect(config, empty, LibraryFilter::default(), logger)?;
    let manager = SyncManager::new(ctx);
    let progress = Arc::new(SyncProgress::new(show_progress));
    progress.set_stage("pulling");

    let p = progress.clone();
    manager.remote().on_remote_page_synced(move |photos| {
        p.add_total(photos.len() as u64);
        for photo in photos {
            p.item_done(Some(&photo.name));
        }
    });

    let result = tokio::select! {
        r = manager.pull_remote() => r,
        _ = tokio::signal::ctrl_c() => {
            manager.destroy();
            progress.finish("Interrupted");
            return Ok(130);
        }
    };
    match result {
        Ok(RemotePullStatus::Synced) => {
            progress.finish("Pulled");
            Ok(0)
        }
        Ok(other) => {
            progress.finish(other.as_str());
            Ok(1)
        }
        Err(e) => {
            progress.finish("Pull failed");
            Err(e)
        }
    }
}

fn status(config: &SyncConfig) -> Result<()> {
    let index = LocalSyncIndex::open(&config.index_path())?;
    let checkpoints = FileCheckpointStore::open(config.checkpoint_path())?;
    println!("Data directory: {}", config.data_dir.display());
    println!("Synced photos: {}", index.count()?);
    match checkpoints.last_pulled_date()? {
        Some(d) => println!("Last pulled: {}", d.to_rfc3339()),
        None => println!("Last pulled: never"),
    }
    match checkpoints.last_uploaded_page()? {
        Some(p) => println!("Last uploaded page: {p}"),
        None => println!("Last uploaded page: none"),
    }
    Ok(())
}

async fn download(
    config: SyncConfig,
    logger: Arc<dyn SyncLogger>,
    file_id: &str,
    dest: PathBuf,
    bucket: Option<String>,
) -> Result<()> {
    let credentials = NetworkCredentials::from_env()?;
    let bucket = bucket.unwrap_or_else(|| credentials.bucket_id.clone());
    let bridge = Arc::new(HttpBridge::new(
        &config.bridge_url,
        &credentials.user,
        &credentials.pass,
    )?);
    let transfer = Transfer::new(
        bridge,
        &credentials.encryption_key,
        config.tmp_dir(),
        config.decrypt_chunk_size,
        logger,
    );
    let cancel = tokio_util::sync::CancellationToken::new();
    let c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            c.cancel();
        }
    });
    transfer
        .download_file(&bucket, file_id, &dest, &cancel, None)
        .await
        .with_context(|| format!("downloading {file_id}"))?;
    println!("Saved {}", dest.display());
    Ok(())
}

fn reset(config: &SyncConfig, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("refusing to wipe local sync data without --yes");
    }
    LocalSyncIndex::open(&config.index_path())?.clear()?;
    FileCheckpointStore::open(config.checkpoint_path())?.clear()?;
    println!("Local sync data cleared");
    Ok(())
}
