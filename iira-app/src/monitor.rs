//! Periodic discovery of new incidents, each handed to the resolver in turn.

use crate::model::{Incident, IncidentStatus};
use crate::resolver::{ResolutionOutcome, ResolverAgent};
use crate::store::IncidentSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait IncidentResolver: Send + Sync {
    async fn resolve(&self, incident: &Incident) -> ResolutionOutcome;
}

#[async_trait]
impl IncidentResolver for ResolverAgent {
    async fn resolve(&self, incident: &Incident) -> ResolutionOutcome {
        self.run(incident).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub processed: usize,
    pub resolved: usize,
    pub failed: usize,
    pub sop_not_found: usize,
}

impl PollReport {
    fn count(&mut self, status: IncidentStatus) {
        self.processed += 1;
        match status {
            IncidentStatus::Resolved => self.resolved += 1,
            IncidentStatus::SopNotFound => self.sop_not_found += 1,
            _ => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub active: bool,
    pub poll_interval_seconds: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub total_polls: u64,
    pub total_processed: u64,
    pub last_error: Option<String>,
}

struct Shared {
    source: Arc<dyn IncidentSource>,
    resolver: Arc<dyn IncidentResolver>,
    state: RwLock<MonitorStatus>,
}

pub struct IncidentMonitor {
    shared: Arc<Shared>,
    poll_interval: Duration,
    shutdown: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl IncidentMonitor {
    pub fn new(
        source: Arc<dyn IncidentSource>,
        resolver: Arc<dyn IncidentResolver>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                resolver,
                state: RwLock::new(MonitorStatus {
                    active: false,
                    poll_interval_seconds: poll_interval.as_secs(),
                    started_at: None,
                    last_poll_at: None,
                    total_polls: 0,
                    total_processed: 0,
                    last_error: None,
                }),
            }),
            poll_interval,
            shutdown: CancellationToken::new(),
            task_handle: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        let mut task_handle = self.task_handle.lock().await;
        if task_handle.is_some() {
            return;
        }
        {
            let mut guard = self.shared.state.write().await;
            guard.active = true;
            guard.started_at = Some(Utc::now());
        }
        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown.clone();
        let interval = self.poll_interval;
        *task_handle = Some(tokio::spawn(async move {
            run_poll_loop(shared, interval, shutdown).await;
        }));
        tracing::info!(poll_interval_seconds = interval.as_secs(), "incident monitor started");
    }

    /// Stop polling and return the final counters. A resolution in flight is
    /// abandoned where it stands.
    pub async fn shutdown(&self) -> MonitorStatus {
        self.shutdown.cancel();
        let handle = self.task_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::warn!(?error, "incident monitor shutdown join failed");
            }
        }
        let status = {
            let mut guard = self.shared.state.write().await;
            guard.active = false;
            guard.clone()
        };
        tracing::info!(
            total_polls = status.total_polls,
            total_processed = status.total_processed,
            last_poll_at = ?status.last_poll_at,
            last_error = ?status.last_error,
            "incident monitor stopped"
        );
        status
    }

    /// One discovery pass, outside the timer.
    pub async fn poll_once(&self) -> anyhow::Result<PollReport> {
        poll_once(&self.shared).await
    }
}

async fn run_poll_loop(shared: Arc<Shared>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(error) = poll_once(&shared).await {
                    tracing::error!(error = %error, "incident poll failed");
                    shared.state.write().await.last_error = Some(error.to_string());
                }
            }
        }
    }
}

async fn poll_once(shared: &Shared) -> anyhow::Result<PollReport> {
    let incidents = shared.source.list_unresolved().await?;
    {
        let mut guard = shared.state.write().await;
        guard.last_poll_at = Some(Utc::now());
        guard.total_polls += 1;
    }
    if incidents.is_empty() {
        tracing::debug!("no new incidents");
        return Ok(PollReport::default());
    }

    tracing::info!(count = incidents.len(), "new incidents found");
    let mut report = PollReport::default();
    for incident in incidents {
        let status = resolve_incident(shared, incident).await;
        report.count(status);
    }
    shared.state.write().await.total_processed += report.processed as u64;
    Ok(report)
}

/// Mark the incident in progress, resolve it on its own task, record the
/// terminal status. A panicking resolution ends in `Error`.
#[tracing::instrument(level = "info", skip_all, fields(incident_number = %incident.number))]
async fn resolve_incident(shared: &Shared, incident: Incident) -> IncidentStatus {
    if let Err(error) = shared
        .source
        .set_status(incident.id, IncidentStatus::InProgress)
        .await
    {
        tracing::warn!(error = %error, "could not mark incident in progress");
    }

    let resolver = Arc::clone(&shared.resolver);
    let incident_id = incident.id;
    let handle = tokio::spawn(async move { resolver.resolve(&incident).await });
    let status = match handle.await {
        Ok(outcome) => outcome.status.incident_status(),
        Err(error) => {
            tracing::error!(?error, "resolution task aborted");
            IncidentStatus::Error
        }
    };

    if let Err(error) = shared.source.set_status(incident_id, status).await {
        tracing::error!(error = %error, status = %status, "could not record incident status");
    }
    tracing::info!(status = %status, "incident processed");
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolutionStatus;
    use crate::store::{Database, sample_incident, temp_database};

    /// Resolves by looking at the short description.
    struct ScriptedResolver;

    #[async_trait]
    impl IncidentResolver for ScriptedResolver {
        async fn resolve(&self, incident: &Incident) -> ResolutionOutcome {
            let status = match incident.short_description.as_str() {
                "panic" => panic!("resolver blew up"),
                "missing" => ResolutionStatus::SopNotFound,
                "broken" => ResolutionStatus::Error,
                _ => ResolutionStatus::Resolved,
            };
            ResolutionOutcome {
                status,
                plan: None,
                trace: vec![],
                error: None,
            }
        }
    }

    async fn seed(db: &Database, number: &str, short: &str) {
        let mut incident = sample_incident(number);
        incident.short_description = short.to_string();
        db.add_incident(incident).await.unwrap();
    }

    fn monitor(db: Database, interval: Duration) -> IncidentMonitor {
        IncidentMonitor::new(Arc::new(db), Arc::new(ScriptedResolver), interval)
    }

    #[tokio::test]
    async fn poll_resolves_each_new_incident_and_records_status() {
        let (_dir, db) = temp_database().await;
        seed(&db, "INC1", "Web server down").await;
        seed(&db, "INC2", "missing").await;
        seed(&db, "INC3", "panic").await;
        seed(&db, "INC4", "broken").await;

        let m = monitor(db.clone(), Duration::from_secs(60));
        let report = m.poll_once().await.unwrap();
        assert_eq!(
            report,
            PollReport {
                processed: 4,
                resolved: 1,
                failed: 2,
                sop_not_found: 1,
            }
        );

        let status_of = |number: &'static str| {
            let db = db.clone();
            async move { db.get_incident_by_number(number).await.unwrap().unwrap().status }
        };
        assert_eq!(status_of("INC1").await, IncidentStatus::Resolved);
        assert_eq!(status_of("INC2").await, IncidentStatus::SopNotFound);
        assert_eq!(status_of("INC3").await, IncidentStatus::Error);
        assert_eq!(status_of("INC4").await, IncidentStatus::Error);

        // Nothing is left in New, so the next pass is a no-op.
        assert_eq!(m.poll_once().await.unwrap(), PollReport::default());
    }

    #[tokio::test]
    async fn started_monitor_polls_and_stops_on_shutdown() {
        let (_dir, db) = temp_database().await;
        seed(&db, "INC9", "Disk full").await;

        let m = monitor(db.clone(), Duration::from_millis(20));
        m.start().await;
        m.start().await;
        for _ in 0..100 {
            let status = db.get_incident_by_number("INC9").await.unwrap().unwrap().status;
            if status == IncidentStatus::Resolved {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let snapshot = m.shutdown().await;
        assert!(!snapshot.active);
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.last_error.is_none());
        assert!(snapshot.total_polls >= 1);
        assert_eq!(snapshot.total_processed, 1);
        assert_eq!(
            db.get_incident_by_number("INC9").await.unwrap().unwrap().status,
            IncidentStatus::Resolved
        );
    }

    struct UnreachableSource;

    #[async_trait]
    impl IncidentSource for UnreachableSource {
        async fn list_unresolved(&self) -> anyhow::Result<Vec<Incident>> {
            Err(anyhow::anyhow!("incident table locked"))
        }

        async fn set_status(&self, _incident_id: i64, _status: IncidentStatus) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_poll_is_recorded_and_polling_continues() {
        let m = IncidentMonitor::new(
            Arc::new(UnreachableSource),
            Arc::new(ScriptedResolver),
            Duration::from_millis(10),
        );
        m.start().await;
        for _ in 0..100 {
            if m.shared.state.read().await.last_error.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot = m.shutdown().await;
        assert_eq!(snapshot.last_error.as_deref(), Some("incident table locked"));
        assert_eq!(snapshot.total_polls, 0);
        assert_eq!(snapshot.total_processed, 0);
        assert!(!snapshot.active);
    }
}
