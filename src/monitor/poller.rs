use std::collections::BTreeMap;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Convergence, MetricPoint, PollPolicy, QueueSet, SamplerMap, Target};
use crate::error::{Budget, MonitorError, MonitorResult};
use crate::timing::{retry_bounded, Deadline};

/// `Polling` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Polling,
    Converged,
    Stalled,
    Exhausted,
    /// A sampler returned an error; the error is handed back unchanged.
    Failed,
}

/// Last value of a progress metric and when it last moved.
#[derive(Debug, Clone, Copy)]
struct Progress {
    value: f64,
    since: Instant,
}

/// Drives one poll. Construct with [`ConvergencePoller::new`] and either
/// step it with [`tick`](Self::tick) or hand it to [`run`](Self::run).
pub struct ConvergencePoller<'a> {
    queues: QueueSet,
    target: Target,
    policy: &'a PollPolicy,
    deadline: Deadline,
    state: PollState,
    ticks: u32,
    progress: BTreeMap<String, Progress>,
    converged: Vec<MetricPoint>,
}

impl<'a> ConvergencePoller<'a> {
    /// The `max_wait` clock starts here.
    pub fn new(samplers: SamplerMap, target: Target, policy: &'a PollPolicy) -> Self {
        Self {
            queues: QueueSet::new(samplers),
            target,
            policy,
            deadline: Deadline::after(policy.max_wait),
            state: PollState::Polling,
            ticks: 0,
            progress: BTreeMap::new(),
            converged: Vec::new(),
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    pub fn pending(&self) -> Vec<String> {
        self.queues.names()
    }

    /// Samples every pending metric once. The first tick samples at once;
    /// later ticks first wait out the scheduled pause, cut short at the
    /// deadline so the deadline instant itself still gets a sample.
    pub async fn tick(&mut self) -> MonitorResult<PollState> {
        if self.state != PollState::Polling {
            return Err(MonitorError::InvalidState(format!(
                "poller already finished ({:?})",
                self.state
            )));
        }

        if self.ticks > 0 {
            let pause = self.policy.schedule.interval_for(self.ticks - 1);
            self.deadline.sleep(pause).await;
        }
        self.ticks += 1;

        for name in self.queues.names() {
            let value = self.sample(&name).await?;
            self.queues.observe(&name, value);

            match value {
                Some(v) if self.target.is_terminal(v) => {
                    info!("{name} reached {}", self.target);
                    self.converged.push(MetricPoint::now(name.as_str(), v));
                    self.progress.remove(&name);
                    self.queues.remove(&name);
                }
                None if self.policy.absent_is_terminal => {
                    info!("{name} no longer reported, treating as drained");
                    self.progress.remove(&name);
                    self.queues.remove(&name);
                }
                Some(v) => {
                    info!("{name} = {v}");
                    self.track_progress(&name, v);
                }
                None => debug!("{name} not reported yet"),
            }
        }

        if self.queues.is_empty() {
            self.state = PollState::Converged;
            info!(
                ticks = self.ticks,
                elapsed_ms = self.deadline.elapsed().as_millis() as u64,
                "converged"
            );
            return Ok(self.state);
        }

        // Stall wins over time exhaustion when both trip on the same tick.
        if let Some(err) = self.check_stall() {
            self.state = PollState::Stalled;
            warn!("{err}");
            return Err(err);
        }

        if self.deadline.expired() {
            return Err(self.exhaust(Budget::Time(self.policy.max_wait)));
        }

        if let Some(max) = self.policy.max_retries {
            if self.ticks >= max {
                return Err(self.exhaust(Budget::Retries(max)));
            }
        }

        Ok(PollState::Polling)
    }

    /// Ticks until a terminal state.
    pub async fn run(mut self) -> MonitorResult<Convergence> {
        while self.tick().await? != PollState::Converged {}
        Ok(Convergence {
            elapsed: self.deadline.elapsed(),
            ticks: self.ticks,
            last: self.converged,
        })
    }

    /// One metric, bounded by the remaining `max_wait`.
    async fn sample(&mut self, name: &str) -> MonitorResult<Option<f64>> {
        let Some(sampler) = self.queues.sampler(name) else {
            return Ok(None);
        };
        let what = format!("sampling {name}");
        let attempt = retry_bounded(&what, self.policy.sample_retries, || sampler.sample());

        match tokio::time::timeout_at(self.deadline.at(), attempt).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.state = PollState::Failed;
                warn!("{what} failed: {e}");
                Err(e)
            }
            Err(_) => Err(self.exhaust(Budget::Time(self.policy.max_wait))),
        }
    }

    fn track_progress(&mut self, name: &str, value: f64) {
        if self.policy.hang_timeout.is_none() {
            return;
        }
        let now = Instant::now();
        let started = self.deadline.started();
        let entry = self.progress.entry(name.to_owned()).or_insert(Progress {
            value,
            since: started,
        });
        if entry.value != value {
            entry.value = value;
            entry.since = now;
        }
    }

    fn check_stall(&self) -> Option<MonitorError> {
        let hang = self.policy.hang_timeout?;
        self.progress
            .iter()
            .map(|(name, p)| (name, p, p.since.elapsed()))
            .filter(|(_, _, idle)| *idle > hang)
            .max_by_key(|(_, _, idle)| *idle)
            .map(|(name, p, idle)| MonitorError::Stalled {
                metric: name.clone(),
                last_value: p.value,
                stalled_for: idle,
            })
    }

    fn exhaust(&mut self, budget: Budget) -> MonitorError {
        self.state = PollState::Exhausted;
        let err = MonitorError::Exhausted {
            budget,
            pending: self.queues.pending_report(),
            expected: self.target.to_string(),
        };
        warn!("{err}");
        err
    }
}

/// Polls `samplers` until all of them satisfy `target`.
pub async fn wait_for_convergence(
    samplers: SamplerMap,
    target: Target,
    policy: &PollPolicy,
) -> MonitorResult<Convergence> {
    ConvergencePoller::new(samplers, target, policy).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{sampler_fn, MetricSampler};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn scripted(values: Vec<Option<f64>>) -> Box<dyn MetricSampler> {
        let values = Arc::new(Mutex::new(values.into_iter()));
        Box::new(sampler_fn(move || {
            let values = values.clone();
            async move {
                let mut it = values.lock();
                Ok(it.next().unwrap_or(Some(0.0)))
            }
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn tick_walks_state_machine() {
        let policy = PollPolicy::fixed(Duration::from_secs(1), Duration::from_secs(60));
        let mut samplers = SamplerMap::new();
        samplers.insert("q".into(), scripted(vec![Some(3.0), Some(0.0)]));

        let mut poller = ConvergencePoller::new(samplers, Target::Zero, &policy);
        assert_eq!(poller.state(), PollState::Polling);
        assert_eq!(poller.tick().await.unwrap(), PollState::Polling);
        assert_eq!(poller.pending(), vec!["q".to_string()]);
        assert_eq!(poller.tick().await.unwrap(), PollState::Converged);
        assert_eq!(poller.ticks(), 2);

        // Terminal states are never left.
        assert!(matches!(
            poller.tick().await,
            Err(MonitorError::InvalidState(_))
        ));
        assert_eq!(poller.state(), PollState::Converged);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_metric_converges_only_when_allowed() {
        let policy = PollPolicy::fixed(Duration::from_secs(1), Duration::from_secs(3));
        let mut samplers = SamplerMap::new();
        samplers.insert("gone".into(), scripted(vec![None, None, None, None]));
        let err = wait_for_convergence(samplers, Target::Zero, &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Exhausted { .. }), "{err}");

        let policy = policy.absent_is_terminal();
        let mut samplers = SamplerMap::new();
        samplers.insert("gone".into(), scripted(vec![None]));
        let ok = wait_for_convergence(samplers, Target::Zero, &policy)
            .await
            .unwrap();
        assert_eq!(ok.ticks, 1);
        assert!(ok.last.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_error_is_terminal() {
        let policy = PollPolicy::fixed(Duration::from_secs(1), Duration::from_secs(60));
        let mut samplers = SamplerMap::new();
        samplers.insert(
            "q".into(),
            Box::new(sampler_fn(|| async {
                Err(MonitorError::infra("stats", "500 Internal Server Error"))
            })) as Box<dyn MetricSampler>,
        );
        let mut poller = ConvergencePoller::new(samplers, Target::Zero, &policy);
        let err = poller.tick().await.unwrap_err();
        assert!(matches!(err, MonitorError::Infra { .. }));
        assert_eq!(poller.state(), PollState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn already_drained_queue_converges_without_waiting() {
        // Interval longer than the whole budget.
        let policy = PollPolicy::fixed(Duration::from_secs(2), Duration::from_secs(1));
        let mut samplers = SamplerMap::new();
        samplers.insert("ep_queue_size".into(), scripted(vec![Some(0.0)]));

        let done = wait_for_convergence(samplers, Target::Zero, &policy)
            .await
            .unwrap();
        assert_eq!(done.ticks, 1);
        assert_eq!(done.elapsed, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn target_reached_on_the_deadline_counts() {
        let policy = PollPolicy::fixed(Duration::from_secs(2), Duration::from_secs(8));
        let mut samplers = SamplerMap::new();
        samplers.insert(
            "ep_queue_size".into(),
            scripted(vec![
                Some(120.0),
                Some(80.0),
                Some(40.0),
                Some(30.0),
                Some(0.0),
            ]),
        );

        let done = wait_for_convergence(samplers, Target::Zero, &policy)
            .await
            .unwrap();
        assert_eq!(done.ticks, 5);
        assert_eq!(done.elapsed, policy.max_wait);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_is_cut_at_the_deadline_for_a_last_sample() {
        let policy = PollPolicy::fixed(Duration::from_secs(5), Duration::from_secs(7));
        let mut samplers = SamplerMap::new();
        samplers.insert("q".into(), scripted(vec![Some(3.0), Some(3.0), Some(3.0)]));

        let started = Instant::now();
        let mut poller = ConvergencePoller::new(samplers, Target::Zero, &policy);
        assert_eq!(poller.tick().await.unwrap(), PollState::Polling);
        assert_eq!(poller.tick().await.unwrap(), PollState::Polling);
        // Third sample lands at 7 s rather than 10 s, then the budget is spent.
        assert!(matches!(
            poller.tick().await,
            Err(MonitorError::Exhausted { .. })
        ));
        assert_eq!(poller.ticks(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(7));
        assert_eq!(poller.state(), PollState::Exhausted);
    }
}
