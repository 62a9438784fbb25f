//! # Runtime
//!
//! Wires the engine into tasks:
//!
//! - one poll task per member, on the member's own cadence, adapted to the
//!   member's published condition (see [`crate::sampling`])
//! - a GPS task refreshing the [`LocationContext`]
//! - a cluster maintenance task
//! - a single decision task that owns the [`DecisionEngine`] and consumes
//!   every poll result and movement event in arrival order
//! - a notification dispatcher
//!
//! Shutdown: producers stop on the watch signal after finishing any poll in
//! flight and drop their senders; the decision task drains the queue,
//! persists state and exits; the dispatcher then drains its own queue.

use std::sync::Arc;

use chrono::Utc;
use tether_common::models::{Metrics, MovementAction, MovementEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{debug, error, info, warn};

use crate::config::{MemberConfig, SamplingConfig, TetherConfig};
use crate::context::LocationContext;
use crate::decision::{DecisionEngine, DecisionLog, EngineStatus};
use crate::error::CollectError;
use crate::gps::GpsCollector;
use crate::interfaces::{Collector, Controller, Notifier};
use crate::notify::NotificationDispatcher;
use crate::sampling::member_cadence;
use crate::state::{PersistedState, StateStore};

const EVENT_QUEUE: usize = 256;
const NOTIFICATION_QUEUE: usize = 64;

/// Input to the decision task.
#[derive(Debug)]
pub enum EngineEvent {
    Poll {
        member: String,
        outcome: Result<Metrics, CollectError>,
    },
    Movement(MovementEvent),
}

/// External collaborators the runtime drives.
pub struct Dependencies {
    pub collector: Arc<dyn Collector>,
    pub controller: Arc<dyn Controller>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub gps: Option<GpsCollector>,
    /// Confirm outbound connectivity before each notification.
    pub check_connectivity: bool,
}

/// Read-side handles for the HTTP surface.
#[derive(Clone)]
pub struct Shared {
    pub log: Arc<DecisionLog>,
    pub location: Arc<LocationContext>,
    pub status: watch::Receiver<EngineStatus>,
}

pub struct RuntimeHandle {
    shared: Shared,
    shutdown: watch::Sender<bool>,
    producers: Vec<JoinHandle<()>>,
    decision: JoinHandle<()>,
    dispatcher: Option<JoinHandle<()>>,
}

impl RuntimeHandle {
    pub fn shared(&self) -> Shared {
        self.shared.clone()
    }

    /// Stop producers, drain the decision queue, persist, stop the
    /// dispatcher. In that order.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.producers).await {
            if let Err(e) = result {
                error!("producer task failed: {e}");
            }
        }
        self.decision.await?;
        if let Some(d) = self.dispatcher {
            d.await?;
        }
        info!("runtime stopped");
        Ok(())
    }
}

/// Build the engine, restore persisted state and spawn every task.
pub async fn start(cfg: TetherConfig, deps: Dependencies) -> anyhow::Result<RuntimeHandle> {
    let cfg = Arc::new(cfg);
    let log = Arc::new(match &cfg.state.decision_log_path {
        Some(path) => DecisionLog::with_file(cfg.state.decision_history, path)?,
        None => DecisionLog::new(cfg.state.decision_history),
    });
    let location = Arc::new(
        LocationContext::new(cfg.movement.clone(), cfg.clustering.clone())
            .with_staleness(cfg.gps.staleness_threshold),
    );
    let store = cfg.state.path.clone().map(StateStore::new);

    let mut engine = DecisionEngine::new(&cfg, deps.controller.clone(), log.clone())
        .with_location(location.clone());

    if let Some(store) = &store {
        match store.load() {
            Ok(Some(state)) => {
                engine.restore_members(&state.members);
                location.restore(state.last_fix, state.clusters);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "ignoring unreadable state, starting fresh"),
        }
    }
    engine.sync_active().await;
    engine.reconcile_metrics().await;

    let dispatcher = match (&deps.notifier, cfg.notifications.enabled) {
        (Some(notifier), true) => {
            let (ntx, nrx) = mpsc::channel(NOTIFICATION_QUEUE);
            engine = engine.with_notifications(ntx);
            let mut d = NotificationDispatcher::new(notifier.clone(), cfg.notifications.clone());
            if !deps.check_connectivity {
                d = d.without_connectivity_check();
            }
            Some(d.spawn(nrx))
        }
        _ => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(engine.status());
    let (tx, rx) = mpsc::channel(EVENT_QUEUE);

    let mut producers = Vec::new();
    for member in &cfg.members {
        producers.push(tokio::spawn(poll_member(
            member.clone(),
            cfg.poll_interval(member),
            cfg.sampling.clone(),
            deps.collector.clone(),
            tx.clone(),
            status_rx.clone(),
            shutdown_rx.clone(),
        )));
    }
    if let Some(gps) = deps.gps {
        if cfg.gps.enabled {
            producers.push(tokio::spawn(run_gps(
                gps,
                cfg.gps.interval,
                location.clone(),
                tx.clone(),
                shutdown_rx.clone(),
            )));
        }
    }
    if cfg.clustering.enabled {
        producers.push(tokio::spawn(run_maintenance(
            cfg.clustering.maintenance_interval,
            location.clone(),
            shutdown_rx.clone(),
        )));
    }
    drop(tx);

    let decision = tokio::spawn(run_decisions(
        engine,
        rx,
        status_tx,
        store,
        location.clone(),
        cfg.state.persist_interval,
    ));

    info!(
        members = cfg.members.len(),
        gps = cfg.gps.enabled,
        clustering = cfg.clustering.enabled,
        "runtime started"
    );

    Ok(RuntimeHandle {
        shared: Shared {
            log,
            location,
            status: status_rx,
        },
        shutdown: shutdown_tx,
        producers,
        decision,
        dispatcher,
    })
}

async fn poll_member(
    mc: MemberConfig,
    base: std::time::Duration,
    sampling: SamplingConfig,
    collector: Arc<dyn Collector>,
    tx: mpsc::Sender<EngineEvent>,
    mut status: watch::Receiver<EngineStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let member = mc.member;
    let limit = sampling.collect_timeout;
    if let Err(e) = collector.validate(&member).await {
        warn!(member = %member.name, error = %e, "member failed validation, polling anyway");
    }

    let (_, mut every) = member_cadence(&status.borrow_and_update(), &member.name, base, &sampling);
    let mut last_poll: Option<Instant> = None;
    loop {
        let deadline = last_poll.map_or_else(Instant::now, |at| at + every);
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let (condition, next) =
                    member_cadence(&status.borrow_and_update(), &member.name, base, &sampling);
                if next != every {
                    debug!(
                        member = %member.name,
                        condition = condition.as_str(),
                        from = ?every,
                        to = ?next,
                        "poll interval adapted"
                    );
                    every = next;
                }
                continue;
            }
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        last_poll = Some(Instant::now());
        let outcome = match timeout(limit, collector.collect(&member)).await {
            Ok(result) => result,
            Err(_) => Err(CollectError::Timeout {
                member: member.name.clone(),
                after: limit,
            }),
        };
        let event = EngineEvent::Poll {
            member: member.name.clone(),
            outcome,
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
    debug!(member = %member.name, "poller stopped");
}

async fn run_gps(
    gps: GpsCollector,
    every: std::time::Duration,
    location: Arc<LocationContext>,
    tx: mpsc::Sender<EngineEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        match location.refresh(&gps).await {
            Ok(Some(event)) if event.action_triggered == MovementAction::ObstructionMapReset => {
                if tx.send(EngineEvent::Movement(event)).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "GPS refresh failed, keeping last known fix"),
        }
    }
    debug!("GPS task stopped");
}

async fn run_maintenance(
    every: std::time::Duration,
    location: Arc<LocationContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; there is nothing to maintain yet.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        location.maintain(Utc::now());
    }
}

fn persist(engine: &DecisionEngine, location: &LocationContext, store: &StateStore) {
    let (last_fix, clusters) = location.export();
    let state = PersistedState {
        last_fix,
        members: engine.export_members(),
        clusters,
        ..PersistedState::new(Utc::now())
    };
    if let Err(e) = store.save(&state) {
        warn!(error = %e, "failed to persist state");
    }
}

async fn run_decisions(
    mut engine: DecisionEngine,
    mut rx: mpsc::Receiver<EngineEvent>,
    status: watch::Sender<EngineStatus>,
    store: Option<StateStore>,
    location: Arc<LocationContext>,
    persist_every: std::time::Duration,
) {
    let mut persist_ticker = tokio::time::interval(persist_every);
    persist_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    persist_ticker.tick().await;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    EngineEvent::Poll { member, outcome } => {
                        if let Err(e) = engine.evaluate(&member, outcome).await {
                            warn!(member = %member, error = %e, "evaluation skipped");
                        }
                    }
                    EngineEvent::Movement(event) => {
                        engine.apply_movement_reset(&event);
                    }
                }
                status.send_replace(engine.status());
            }
            _ = persist_ticker.tick() => {
                let pruned = engine.prune_telemetry(Utc::now());
                if pruned > 0 {
                    debug!(pruned, "telemetry pruned");
                }
                if let Some(store) = &store {
                    persist(&engine, &location, store);
                }
            }
        }
    }

    if let Some(store) = &store {
        persist(&engine, &location, store);
    }
    debug!("decision task stopped");
}
