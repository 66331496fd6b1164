//! Host for an optional inspector client that watches event activity.
//!
//! Traces produced before an inspector connects are kept in a history that
//! lives for the docking window only. An inspector that connects in time
//! receives the history first, then live traces. One that connects later
//! only sees live traces.
//!
//! ```text
//!   report_triggered ─┐
//!   report_delivered ─┴─► connected? ──yes──► inspector.trace
//!                             │
//!                             no ──► history (disposed after docking window)
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// A client that receives trace records.
pub trait Inspector: Send + Sync {
    /// Called once on connection. An error leaves the host disconnected.
    fn start(&self, config: &Value) -> Result<()>;

    /// Receive one trace record.
    fn trace(&self, trace: &Trace);
}

/// Where an event is in its trip through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStage {
    /// The engine accepted the event.
    Triggered,
    /// The engine handed the event to its integrations.
    Delivered,
}

/// One trace record, as the inspector receives it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    /// Id of the traced event.
    pub id: String,
    pub stage: TraceStage,
    /// The event payload.
    pub event: Value,
    /// When the trace was reported.
    pub timestamp: DateTime<Utc>,
    /// Integrations the event was delivered to. Delivered traces only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destinations: Option<Vec<String>>,
}

/// An event passing through the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    /// Correlates the triggered and delivered traces of one event.
    pub id: String,
    /// The event payload. Its `integrations` object, if any, holds the
    /// per-destination switches.
    pub event: Value,
}

impl TraceEvent {
    pub fn new(id: impl Into<String>, event: Value) -> Self {
        Self {
            id: id.into(),
            event,
        }
    }
}

#[derive(Default)]
struct HostState {
    inspector: Option<Arc<dyn Inspector>>,
    /// `None` once disposed.
    history: Option<Vec<Trace>>,
    /// Traces reported while a connecting inspector receives the history.
    backlog: Option<Vec<Trace>>,
    integrations: Option<Vec<String>>,
}

/// Routes trace records to a connected inspector, or holds them until one
/// docks.
pub struct InspectorHost {
    state: Mutex<HostState>,
}

impl InspectorHost {
    /// Create a host whose history is disposed after `docking`.
    ///
    /// Outside a Tokio runtime there is no timer, and the history lives
    /// until an inspector connects.
    pub fn new(docking: Duration) -> Arc<Self> {
        let host = Arc::new(Self {
            state: Mutex::new(HostState {
                history: Some(Vec::new()),
                ..HostState::default()
            }),
        });

        match Handle::try_current() {
            Ok(runtime) => {
                let weak: Weak<Self> = Arc::downgrade(&host);
                drop(runtime.spawn(async move {
                    tokio::time::sleep(docking).await;
                    if let Some(host) = weak.upgrade() {
                        host.dispose_history();
                    }
                }));
            }
            Err(_) => debug!("no runtime, inspector history kept until connect"),
        }

        host
    }

    /// Connect an inspector and replay the history to it.
    ///
    /// Traces reported during the replay are held back and delivered after
    /// the history, so the inspector sees everything in report order.
    /// Returns whether the inspector started.
    pub fn connect(&self, inspector: Arc<dyn Inspector>, start_config: &Value) -> bool {
        if let Err(err) = inspector.start(start_config) {
            warn!(error = %err, "inspector start up failed");
            return false;
        }

        let mut replay = {
            let mut state = self.lock();
            state.backlog = Some(Vec::new());
            state.history.take().unwrap_or_default()
        };
        debug!(count = replay.len(), "replaying trace history to inspector");
        loop {
            for trace in &replay {
                inspector.trace(trace);
            }
            let mut state = self.lock();
            match state.backlog.take() {
                Some(backlog) if !backlog.is_empty() => {
                    state.backlog = Some(Vec::new());
                    replay = backlog;
                }
                _ => {
                    state.inspector = Some(Arc::clone(&inspector));
                    return true;
                }
            }
        }
    }

    /// Remember the names of the configured integrations.
    pub fn set_integrations<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().integrations = Some(names.into_iter().map(Into::into).collect());
    }

    /// Whether an inspector is connected.
    pub fn is_connected(&self) -> bool {
        self.lock().inspector.is_some()
    }

    /// Whether traces produced now would still reach a late inspector.
    pub fn is_docking(&self) -> bool {
        self.lock().history.is_some()
    }

    /// Report that the engine accepted `event`.
    pub fn report_triggered(&self, event: &TraceEvent) {
        self.send(Trace {
            id: event.id.clone(),
            stage: TraceStage::Triggered,
            event: event.event.clone(),
            timestamp: Utc::now(),
            destinations: None,
        });
    }

    /// Report that `event` went out, with the integrations it reached.
    pub fn report_delivered(&self, event: &TraceEvent) {
        let destinations = {
            let state = self.lock();
            if state.inspector.is_some() && state.integrations.is_none() {
                warn!("inspector host unaware of integrations cannot resolve destinations");
            }
            resolve_destinations(state.integrations.as_deref(), &event.event)
        };
        self.send(Trace {
            id: event.id.clone(),
            stage: TraceStage::Delivered,
            event: event.event.clone(),
            timestamp: Utc::now(),
            destinations: Some(destinations),
        });
    }

    fn send(&self, trace: Trace) {
        let inspector = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match (&state.inspector, &mut state.backlog, &mut state.history) {
                (Some(inspector), _, _) => Arc::clone(inspector),
                (None, Some(backlog), _) => {
                    backlog.push(trace);
                    return;
                }
                (None, None, Some(history)) => {
                    history.push(trace);
                    return;
                }
                // Disposed and nobody listening.
                (None, None, None) => return,
            }
        };
        inspector.trace(&trace);
    }

    fn dispose_history(&self) {
        if let Some(history) = self.lock().history.take() {
            debug!(dropped = history.len(), "inspector docking window closed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for InspectorHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("InspectorHost")
            .field("connected", &state.inspector.is_some())
            .field("history", &state.history.as_ref().map(Vec::len))
            .field("integrations", &state.integrations)
            .finish()
    }
}

/// Integrations an event goes to: an explicit boolean switch per name wins,
/// then the `All` switch, then `true`.
fn resolve_destinations(names: Option<&[String]>, event: &Value) -> Vec<String> {
    let Some(names) = names else {
        return Vec::new();
    };
    let switches = event.get("integrations");
    let all = switches
        .and_then(|s| s.get("All"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    names
        .iter()
        .filter(|name| {
            switches
                .and_then(|s| s.get(name.as_str()))
                .and_then(Value::as_bool)
                .unwrap_or(all)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    #[derive(Default)]
    struct CollectingInspector {
        fail_start: bool,
        started: Mutex<Vec<Value>>,
        traces: Mutex<Vec<Trace>>,
    }

    impl CollectingInspector {
        fn traces(&self) -> Vec<Trace> {
            self.traces.lock().unwrap().clone()
        }
    }

    impl Inspector for CollectingInspector {
        fn start(&self, config: &Value) -> Result<()> {
            if self.fail_start {
                return Err(anyhow!("refused"));
            }
            self.started.lock().unwrap().push(config.clone());
            Ok(())
        }

        fn trace(&self, trace: &Trace) {
            self.traces.lock().unwrap().push(trace.clone());
        }
    }

    fn event(id: &str, body: Value) -> TraceEvent {
        TraceEvent::new(id, body)
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_replayed_to_inspector_docking_in_time() {
        let host = InspectorHost::new(Duration::from_secs(30));
        host.set_integrations(["Amplitude"]);
        host.report_triggered(&event("e1", json!({"type": "track"})));
        host.report_delivered(&event("e1", json!({"type": "track"})));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let inspector = Arc::new(CollectingInspector::default());
        assert!(host.connect(inspector.clone(), &json!({"user": {"id": null}})));
        host.report_triggered(&event("e2", json!({})));

        let traces = inspector.traces();
        let stages: Vec<_> = traces.iter().map(|t| (t.id.as_str(), t.stage)).collect();
        assert_eq!(
            stages,
            vec![
                ("e1", TraceStage::Triggered),
                ("e1", TraceStage::Delivered),
                ("e2", TraceStage::Triggered)
            ]
        );
        assert_eq!(
            *inspector.started.lock().unwrap(),
            vec![json!({"user": {"id": null}})]
        );
        assert!(!host.is_docking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_dropped_after_docking_window() {
        let host = InspectorHost::new(Duration::from_secs(30));
        host.report_triggered(&event("early", json!({})));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!host.is_docking());
        // Silently dropped: no inspector, no history.
        host.report_triggered(&event("lost", json!({})));

        let inspector = Arc::new(CollectingInspector::default());
        host.connect(inspector.clone(), &Value::Null);
        host.report_triggered(&event("live", json!({})));

        let ids: Vec<_> = inspector.traces().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["live".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_start_stays_disconnected() {
        let host = InspectorHost::new(Duration::from_secs(30));
        host.report_triggered(&event("kept", json!({})));

        let refusing = Arc::new(CollectingInspector {
            fail_start: true,
            ..Default::default()
        });
        assert!(!host.connect(refusing.clone(), &Value::Null));
        assert!(!host.is_connected());
        assert!(host.is_docking());

        let inspector = Arc::new(CollectingInspector::default());
        host.connect(inspector.clone(), &Value::Null);
        assert_eq!(inspector.traces().len(), 1);
        assert!(refusing.traces().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_live_traces_never_overtake_history() {
        const TRACES: usize = 200;

        let host = InspectorHost::new(Duration::from_secs(30));
        for n in 0..TRACES {
            host.report_triggered(&event(&format!("early-{n}"), json!({})));
        }
        let reporter = {
            let host = host.clone();
            tokio::spawn(async move {
                for n in 0..TRACES {
                    host.report_triggered(&event(&format!("live-{n}"), json!({})));
                    if n % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let inspector = Arc::new(CollectingInspector::default());
        assert!(host.connect(inspector.clone(), &Value::Null));
        reporter.await.unwrap();

        let ids: Vec<_> = inspector.traces().into_iter().map(|t| t.id).collect();
        let expected: Vec<_> = (0..TRACES)
            .map(|n| format!("early-{n}"))
            .chain((0..TRACES).map(|n| format!("live-{n}")))
            .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_destinations_follow_switches() {
        let names = vec!["A".to_string(), "B".to_string(), "C".to_string()];

        let explicit = json!({"integrations": {"A": false, "B": true}});
        assert_eq!(resolve_destinations(Some(&names), &explicit), vec!["B", "C"]);

        let all_off = json!({"integrations": {"All": false, "C": true}});
        assert_eq!(resolve_destinations(Some(&names), &all_off), vec!["C"]);

        let non_bool = json!({"integrations": {"A": {"apiKey": "x"}, "All": false}});
        assert!(resolve_destinations(Some(&names), &non_bool).is_empty());

        assert_eq!(resolve_destinations(Some(&names), &json!({})).len(), 3);
        assert!(resolve_destinations(None, &json!({})).is_empty());
    }

    #[test]
    fn test_trace_serializes_camel_case() {
        let trace = Trace {
            id: "e1".into(),
            stage: TraceStage::Delivered,
            event: json!({"type": "page"}),
            timestamp: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            destinations: Some(vec!["A".into()]),
        };
        let value = serde_json::to_value(&trace).unwrap();
        assert_eq!(value["stage"], json!("delivered"));
        assert_eq!(value["destinations"], json!(["A"]));
        assert_eq!(value["timestamp"], json!("2024-01-01T00:00:00Z"));

        let triggered = Trace {
            stage: TraceStage::Triggered,
            destinations: None,
            ..trace
        };
        let value = serde_json::to_value(&triggered).unwrap();
        assert!(value.get("destinations").is_none());
    }
}
