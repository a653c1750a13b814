use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::Profile;
use crate::events::{EngineEvent, EngineState};
use crate::follower::ChangeFollower;
use crate::fsutil;
use crate::scheduler::{
    join_with_timeout, status_line, stopped_line, Scheduler, SchedulerHandle, SnapshotClock,
};
use crate::store::snapshot;
use crate::worker::MirrorWorker;

const WORKER_JOIN: Duration = Duration::from_secs(5);
const SCHEDULER_JOIN: Duration = Duration::from_secs(3);
const FOLLOWER_JOIN: Duration = Duration::from_secs(3);

/// Called with the updated profile whenever the snapshot clock accepts a new
/// time, so the config collaborator can persist `last_snapshot_time`.
pub type ProfileHook = Arc<dyn Fn(&Profile) + Send + Sync>;

struct WorkerSlot {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Composes one sweep worker per mirror, one follower on ground and one
/// snapshot scheduler for a profile, and owns their lifecycle. Worker
/// completion is tracked through ids in a registry rather than
/// back-references.
pub struct ProfileEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    profile: Arc<Mutex<Profile>>,
    bus: EventBus,
    running: Arc<AtomicBool>,
    clock: Arc<SnapshotClock>,
    workers: Mutex<HashMap<u64, WorkerSlot>>,
    scheduler: Mutex<Option<SchedulerHandle>>,
    follower: Mutex<Option<ChangeFollower>>,
    next_worker_id: AtomicU64,
}

impl ProfileEngine {
    pub fn new(profile: Profile, bus: EventBus, on_profile_change: Option<ProfileHook>) -> Self {
        let initial = profile.last_snapshot_time;
        let profile = Arc::new(Mutex::new(profile));

        let hook_profile = profile.clone();
        let clock = Arc::new(SnapshotClock::with_hook(
            initial,
            Box::new(move |ts| {
                let updated = {
                    let mut p = hook_profile.lock().unwrap();
                    p.last_snapshot_time = Some(ts);
                    p.clone()
                };
                if let Some(hook) = &on_profile_change {
                    hook(&updated);
                }
            }),
        ));

        Self {
            inner: Arc::new(EngineInner {
                profile,
                bus,
                running: Arc::new(AtomicBool::new(false)),
                clock,
                workers: Mutex::new(HashMap::new()),
                scheduler: Mutex::new(None),
                follower: Mutex::new(None),
                next_worker_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> crossbeam_channel::Receiver<EngineEvent> {
        self.inner.bus.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Launch the initial sweeps. The scheduler and the follower come up once
    /// the last sweep finishes. Calling `start` on a running engine restarts
    /// it.
    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            self.stop();
        }

        let (name, ground, mirrors, retention) = {
            let p = self.inner.profile.lock().unwrap();
            p.validate()?;
            (
                p.name.clone(),
                p.ground().expect("validated profile has a ground").to_owned(),
                p.mirrors(),
                p.retention_seconds,
            )
        };

        self.inner.running.store(true, Ordering::SeqCst);

        // Reconcile the cached snapshot time with what is actually on disk.
        for mirror in &mirrors {
            if let Ok(Some(mtime)) = snapshot::latest_mtime(mirror) {
                self.inner.clock.seed(mtime);
            }
        }
        let interval = self.inner.profile.lock().unwrap().snapshot_interval;
        self.inner.bus.publish(EngineEvent::SnapshotStatus {
            text: status_line(self.inner.clock.get(), interval, fsutil::now_epoch()),
        });

        // Register every worker before the first thread runs so the "last
        // one out" check cannot fire early.
        let mut launches = Vec::new();
        {
            let mut workers = self.inner.workers.lock().unwrap();
            for mirror in &mirrors {
                let id = self.inner.next_worker_id.fetch_add(1, Ordering::SeqCst);
                let mut worker =
                    MirrorWorker::new(ground.clone(), mirror.clone(), self.inner.bus.clone());
                worker.create_snapshot = true;
                worker.retention_seconds = retention;
                worker.clock = Some(self.inner.clock.clone());
                workers.insert(
                    id,
                    WorkerSlot {
                        cancel: worker.cancel_token(),
                        handle: None,
                    },
                );
                launches.push((id, worker));
            }
        }
        for (id, worker) in launches {
            let inner = self.inner.clone();
            let handle = thread::spawn(move || {
                worker.run();
                inner.on_worker_finished(id);
            });
            let mut workers = self.inner.workers.lock().unwrap();
            if let Some(slot) = workers.get_mut(&id) {
                slot.handle = Some(handle);
            }
        }

        self.inner.bus.publish(EngineEvent::Status {
            profile: name.clone(),
            state: EngineState::Syncing,
        });
        info!(profile = %name, "profile sync engine started");
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.inner.scheduler.lock().unwrap().take() {
            handle.stop(SCHEDULER_JOIN);
        }

        let slots: Vec<WorkerSlot> = {
            let mut workers = self.inner.workers.lock().unwrap();
            workers.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &slots {
            slot.cancel.store(true, Ordering::SeqCst);
        }
        for slot in slots {
            if let Some(handle) = slot.handle {
                join_with_timeout(handle, WORKER_JOIN, "mirror worker");
            }
        }

        if let Some(follower) = self.inner.follower.lock().unwrap().take() {
            follower.stop(FOLLOWER_JOIN);
        }

        let name = self.inner.profile.lock().unwrap().name.clone();
        self.inner.bus.publish(EngineEvent::Status {
            profile: name.clone(),
            state: EngineState::Idle,
        });
        self.inner.bus.publish(EngineEvent::SnapshotStatus {
            text: stopped_line(self.inner.clock.get(), fsutil::now_epoch()),
        });
        info!(profile = %name, "profile sync engine stopped");
    }
}

impl EngineInner {
    /// Worker threads report in by id. When the registry empties while the
    /// engine is still running, the long-lived pieces come up: the scheduler
    /// (nudged so the first opportunity is evaluated immediately) and the
    /// follower.
    fn on_worker_finished(self: &Arc<Self>, id: u64) {
        let empty = {
            let mut workers = self.workers.lock().unwrap();
            workers.remove(&id);
            workers.is_empty()
        };
        if !empty || !self.running.load(Ordering::SeqCst) {
            return;
        }

        let (ground, mirrors, interval, retention) = {
            let p = self.profile.lock().unwrap();
            match p.ground() {
                Some(g) => (
                    g.to_owned(),
                    p.mirrors(),
                    p.snapshot_interval,
                    p.retention_seconds,
                ),
                None => return,
            }
        };

        let mut scheduler = self.scheduler.lock().unwrap();
        if scheduler.is_none() && self.running.load(Ordering::SeqCst) {
            let handle = Scheduler {
                mirrors: mirrors.clone(),
                interval,
                retention_seconds: retention,
                clock: self.clock.clone(),
                bus: self.bus.clone(),
            }
            .spawn();
            handle.nudge();
            *scheduler = Some(handle);
        }
        drop(scheduler);

        let mut follower = self.follower.lock().unwrap();
        if follower.is_none() && self.running.load(Ordering::SeqCst) {
            match ChangeFollower::spawn(ground, mirrors, self.running.clone()) {
                Ok(f) => *follower = Some(f),
                Err(e) => warn!(error = %e, "change follower failed to start"),
            }
        }
    }
}
