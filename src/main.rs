use std::thread;

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use tracing::info;

use watchback::bus::EventBus;
use watchback::cli::{Cli, Command, ProfileArgs};
use watchback::config::{self, ConfigDoc, Profile};
use watchback::engine::ProfileEngine;
use watchback::events::EngineEvent;
use watchback::retention;
use watchback::scheduler::{status_line, SnapshotClock};
use watchback::store::snapshot;
use watchback::util::logging;
use watchback::worker::MirrorWorker;
use watchback::fsutil;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = config::ensure_base_dir();
    logging::init(cli.log_format, Some(&config::log_path()));

    let config_path = cli.config.clone().unwrap_or_else(config::config_path);
    let doc = ConfigDoc::load(&config_path)?;

    match &cli.command {
        Command::Profiles => {
            if doc.profiles.is_empty() {
                println!("no profiles configured in {config_path}");
                return Ok(());
            }
            for p in &doc.profiles {
                let ground = p
                    .ground()
                    .map(|g| g.to_string())
                    .unwrap_or_else(|| "<missing>".into());
                let retention = p
                    .retention_seconds
                    .map(|s| format!("{s}s"))
                    .unwrap_or_else(|| "keep forever".into());
                println!(
                    "{}: ground {} -> {} mirror(s), snapshot every {}s, retention {}, last snapshot {}",
                    p.name,
                    ground,
                    p.mirrors().len(),
                    p.snapshot_interval,
                    retention,
                    status_line(p.last_snapshot_time, p.snapshot_interval, fsutil::now_epoch()),
                );
            }
            Ok(())
        }
        Command::Sync(args) => sync_once(&doc, args),
        Command::Snapshot(args) => snapshot_now(&doc, args),
        Command::Run(args) => run_engine(&doc, args, &config_path),
    }
}

fn find_profile<'a>(doc: &'a ConfigDoc, name: &str) -> Result<&'a Profile> {
    let profile = doc
        .find(name)
        .with_context(|| format!("profile {name:?} not found"))?;
    profile.validate()?;
    Ok(profile)
}

fn spawn_printer(bus: &EventBus) -> thread::JoinHandle<()> {
    let rx = bus.subscribe();
    thread::spawn(move || {
        for ev in rx.iter() {
            match ev {
                EngineEvent::Status { profile, state } => println!("[{profile}] {state}"),
                EngineEvent::MirrorStatus { mirror, state } => println!("{mirror}: {state}"),
                EngineEvent::Progress { mirror, percent } => println!("{mirror}: {percent}%"),
                EngineEvent::SnapshotCommitted { mirror, .. } => {
                    println!("{mirror}: snapshot committed")
                }
                EngineEvent::SnapshotStatus { text } => println!("snapshot: {text}"),
            }
        }
    })
}

/// Sweep every mirror of the profile once, in parallel, then exit.
fn sync_once(doc: &ConfigDoc, args: &ProfileArgs) -> Result<()> {
    let profile = find_profile(doc, &args.profile)?;
    let ground = profile.ground().expect("validated profile").to_owned();

    let bus = EventBus::new();
    let printer = spawn_printer(&bus);
    let clock = std::sync::Arc::new(SnapshotClock::new(profile.last_snapshot_time));

    let mut handles = Vec::new();
    for mirror in profile.mirrors() {
        let mut worker = MirrorWorker::new(ground.clone(), mirror, bus.clone());
        worker.create_snapshot = true;
        worker.retention_seconds = profile.retention_seconds;
        worker.clock = Some(clock.clone());
        handles.push(thread::spawn(move || worker.run()));
    }
    for handle in handles {
        let _ = handle.join();
    }

    drop(bus);
    let _ = printer.join();
    Ok(())
}

fn snapshot_now(doc: &ConfigDoc, args: &ProfileArgs) -> Result<()> {
    let profile = find_profile(doc, &args.profile)?;
    for mirror in profile.mirrors() {
        match snapshot::maybe_commit(&mirror)? {
            Some(_) => println!("{mirror}: snapshot committed"),
            None => println!("{mirror}: unchanged, snapshot suppressed"),
        }
        if let Some(secs) = profile.retention_seconds {
            retention::apply_retention(&mirror, secs);
        }
    }
    Ok(())
}

/// Full engine until ctrl-c: initial sweeps, then the follower and the
/// snapshot scheduler. Accepted snapshot times are written back to the
/// profile document.
fn run_engine(doc: &ConfigDoc, args: &ProfileArgs, config_path: &camino::Utf8Path) -> Result<()> {
    let profile = find_profile(doc, &args.profile)?.clone();

    let bus = EventBus::new();
    let printer = spawn_printer(&bus);

    let persist_path = config_path.to_owned();
    let engine = ProfileEngine::new(
        profile,
        bus.clone(),
        Some(std::sync::Arc::new(move |updated: &Profile| {
            if let Err(e) = ConfigDoc::persist_profile(&persist_path, updated) {
                tracing::warn!(error = %e, "failed to persist profile update");
            }
        })),
    );

    let (stop_tx, stop_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install ctrl-c handler")?;

    engine.start()?;
    info!(profile = %args.profile, "running, press ctrl-c to stop");
    if stop_rx.recv().is_err() {
        bail!("interrupt channel closed unexpectedly");
    }
    engine.stop();

    drop(engine);
    drop(bus);
    let _ = printer.join();
    Ok(())
}
