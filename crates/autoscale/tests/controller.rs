use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stagehand_autoscale::{Controller, ControllerConfig, Decision, MetricsSource, Scaler, TickError, WorkloadKey};
use stagehand_core::{cancel_pair, AutoscaleTarget, MetricKind, MetricTarget, MetricUnavailable, ResourceId};
use tokio::time::Instant;

/// Utilization per metric; `None` reads as unavailable.
#[derive(Default)]
struct FakeMetrics {
    values: Mutex<BTreeMap<String, Option<f64>>>,
}

impl FakeMetrics {
    fn set(&self, kind: MetricKind, v: Option<f64>) {
        self.values.lock().unwrap().insert(kind.to_string(), v);
    }
}

#[async_trait::async_trait]
impl MetricsSource for FakeMetrics {
    async fn utilization(&self, target: &AutoscaleTarget, kind: MetricKind) -> Result<f64, MetricUnavailable> {
        match self.values.lock().unwrap().get(&kind.to_string()).copied().flatten() {
            Some(v) => Ok(v),
            None => Err(MetricUnavailable { workload: target.workload.clone(), kind, reason: "metrics-server down".into() }),
        }
    }
}

#[derive(Default)]
struct FakeScaler {
    replicas: Mutex<u32>,
    calls: Mutex<Vec<(Instant, u32)>>,
    fail: Mutex<bool>,
    delay: Duration,
}

impl FakeScaler {
    fn at(replicas: u32) -> Self {
        Self { replicas: Mutex::new(replicas), ..Default::default() }
    }

    fn calls(&self) -> Vec<(Instant, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Scaler for FakeScaler {
    async fn current_replicas(&self, _target: &AutoscaleTarget) -> anyhow::Result<u32> {
        Ok(*self.replicas.lock().unwrap())
    }

    async fn scale(&self, _target: &AutoscaleTarget, replicas: u32) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if *self.fail.lock().unwrap() {
            anyhow::bail!("scale subresource forbidden");
        }
        *self.replicas.lock().unwrap() = replicas;
        self.calls.lock().unwrap().push((Instant::now(), replicas));
        Ok(())
    }
}

fn target(min: u32, max: u32, pct: f64) -> AutoscaleTarget {
    AutoscaleTarget {
        workload: ResourceId::new("Deployment", "backend"),
        namespace: Some("shop".into()),
        min_replicas: min,
        max_replicas: max,
        metrics: vec![MetricTarget { kind: MetricKind::Cpu, target_percent: pct }],
    }
}

type Ctl = Controller<Arc<FakeMetrics>, Arc<FakeScaler>>;

async fn setup(scaler: FakeScaler, t: AutoscaleTarget) -> (Arc<FakeMetrics>, Arc<FakeScaler>, Ctl, WorkloadKey) {
    let metrics = Arc::new(FakeMetrics::default());
    let scaler = Arc::new(scaler);
    let ctl = Controller::new(metrics.clone(), scaler.clone(), ControllerConfig::default());
    let key = ctl.register(t).await.unwrap();
    (metrics, scaler, ctl, key)
}

#[tokio::test(start_paused = true)]
async fn high_utilization_scales_up() {
    let (metrics, scaler, ctl, key) = setup(FakeScaler::at(2), target(2, 5, 70.0)).await;
    metrics.set(MetricKind::Cpu, Some(140.0));

    let d = ctl.tick(&key).await.unwrap();

    assert_eq!(d, Decision::ScaleUp { from: 2, to: 4 });
    assert_eq!(scaler.calls().iter().map(|c| c.1).collect::<Vec<_>>(), vec![4]);
    assert_eq!(ctl.snapshot(&key).await.unwrap().current_replicas, 4);
}

#[tokio::test(start_paused = true)]
async fn unavailable_metric_keeps_replicas() {
    let (metrics, scaler, ctl, key) = setup(FakeScaler::at(3), target(1, 10, 50.0)).await;
    metrics.set(MetricKind::Cpu, None);

    let err = ctl.tick(&key).await.unwrap_err();

    assert!(matches!(err, TickError::Metric(_)), "{:?}", err);
    assert!(scaler.calls().is_empty());
    assert_eq!(ctl.snapshot(&key).await.unwrap().current_replicas, 3);
}

#[tokio::test(start_paused = true)]
async fn failed_actuation_keeps_recorded_count() {
    let (metrics, scaler, ctl, key) = setup(FakeScaler::at(2), target(1, 10, 50.0)).await;
    metrics.set(MetricKind::Cpu, Some(100.0));
    *scaler.fail.lock().unwrap() = true;

    let err = ctl.tick(&key).await.unwrap_err();

    assert!(matches!(err, TickError::Actuation { replicas: 4, .. }), "{:?}", err);
    assert_eq!(ctl.snapshot(&key).await.unwrap().current_replicas, 2);
}

#[tokio::test(start_paused = true)]
async fn loop_spaces_scale_downs_by_cooldown() {
    let (metrics, scaler, ctl, _key) = setup(FakeScaler::at(5), target(1, 10, 70.0)).await;
    metrics.set(MetricKind::Cpu, Some(30.0));
    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(20 * 60)).await;
        handle.cancel();
    });

    ctl.run(signal).await;

    let calls = scaler.calls();
    let counts: Vec<u32> = calls.iter().map(|c| c.1).collect();
    assert_eq!(counts, vec![3, 2, 1]);
    for pair in calls.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= ControllerConfig::default().cooldown);
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_ticks_are_serialized() {
    let slow = FakeScaler { delay: Duration::from_secs(2), ..FakeScaler::at(5) };
    let (metrics, scaler, ctl, key) = setup(slow, target(1, 10, 70.0)).await;
    metrics.set(MetricKind::Cpu, Some(30.0));

    let (a, b) = tokio::join!(ctl.tick(&key), ctl.tick(&key));

    let mut decisions = vec![a.unwrap(), b.unwrap()];
    decisions.sort_by_key(|d| d.target().is_none());
    assert_eq!(decisions[0], Decision::ScaleDown { from: 5, to: 3 });
    assert_eq!(decisions[1], Decision::Suppressed { replicas: 3, wanted: 2 });
    assert_eq!(scaler.calls().len(), 1);
}

#[tokio::test]
async fn invalid_bounds_are_rejected_on_register() {
    let metrics = Arc::new(FakeMetrics::default());
    let scaler = Arc::new(FakeScaler::at(1));
    let ctl = Controller::new(metrics, scaler, ControllerConfig::default());
    assert!(ctl.register(target(4, 2, 50.0)).await.is_err());
    assert!(ctl.register(target(0, 2, 50.0)).await.is_err());
    assert!(ctl.keys().is_empty());
}

#[tokio::test(start_paused = true)]
async fn manual_scale_above_max_is_corrected_inside_cooldown() {
    let (metrics, scaler, ctl, key) = setup(FakeScaler::at(5), target(1, 10, 70.0)).await;
    metrics.set(MetricKind::Cpu, Some(30.0));
    assert_eq!(ctl.tick(&key).await.unwrap(), Decision::ScaleDown { from: 5, to: 3 });

    *scaler.replicas.lock().unwrap() = 30;
    tokio::time::advance(Duration::from_secs(30)).await;

    let d = ctl.tick(&key).await.unwrap();
    assert_eq!(d, Decision::Correct { from: 30, to: 10 });
    let calls: Vec<u32> = scaler.calls().iter().map(|c| c.1).collect();
    assert_eq!(calls, vec![3, 10]);
    let state = ctl.snapshot(&key).await.unwrap();
    assert_eq!(state.current_replicas, 10);
    assert!(state.current_replicas <= state.target.max_replicas);
}

#[tokio::test]
async fn unregistered_workload_is_reported() {
    let ctl = Controller::new(Arc::new(FakeMetrics::default()), Arc::new(FakeScaler::at(1)), ControllerConfig::default());
    let key = WorkloadKey::of(&target(1, 3, 50.0));
    assert!(matches!(ctl.tick(&key).await, Err(TickError::Unknown(k)) if k == key));
}
