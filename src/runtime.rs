use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Config;
use crate::scenario::{self, RttSummary, Scenario, ScenarioReport};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub scenario: String,
    pub vus: usize,
    pub iterations_per_vu: usize,
    pub interrupted: bool,
    pub elapsed_ms: u64,
    pub rtt: Option<RttSummary>,
    pub report: ScenarioReport,
}

impl RunSummary {
    pub fn ok(&self) -> bool {
        !self.interrupted && self.report.errors == 0 && self.report.failed_checks() == 0
    }
}

pub struct LoadRuntime {
    config: Config,
    scenario: Arc<dyn Scenario>,
}

impl LoadRuntime {
    pub fn new(config: Config) -> Self {
        let scenario = scenario::build(&config);
        Self { config, scenario }
    }

    pub async fn run(self) -> Result<RunSummary> {
        let vus = self.config.load.vus.max(1);
        let iterations = self.config.load.iterations.max(1);
        let kind = self.scenario.kind();
        info!(
            "starting load (scenario={}, url={}, vus={vus}, iterations={iterations}, receive_timeout_ms={})",
            kind.as_str(),
            self.config.target.url,
            self.config.connect.receive_timeout_ms
        );

        let started = Instant::now();
        let mut users = JoinSet::new();
        for vu in 1..=vus {
            users.spawn(run_user(self.scenario.clone(), vu, iterations));
        }

        let mut report = ScenarioReport::default();
        let interrupted = tokio::select! {
            _ = collect(&mut users, &mut report) => false,
            _ = signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                true
            }
        };
        if interrupted {
            users.abort_all();
            while users.join_next().await.is_some() {}
        }

        let summary = RunSummary {
            scenario: kind.as_str().to_owned(),
            vus,
            iterations_per_vu: iterations,
            interrupted,
            elapsed_ms: started.elapsed().as_millis() as u64,
            rtt: report.rtt_summary(),
            report,
        };
        info!(
            "load finished in {}ms (iterations={}, failed_checks={}, errors={})",
            summary.elapsed_ms,
            summary.report.iterations,
            summary.report.failed_checks(),
            summary.report.errors
        );
        Ok(summary)
    }
}

async fn collect(users: &mut JoinSet<ScenarioReport>, report: &mut ScenarioReport) {
    while let Some(joined) = users.join_next().await {
        match joined {
            Ok(user_report) => report.merge(user_report),
            Err(err) => {
                warn!("virtual user task failed: {err}");
                report.errors += 1;
            }
        }
    }
}

async fn run_user(scenario: Arc<dyn Scenario>, vu: usize, iterations: usize) -> ScenarioReport {
    let mut report = ScenarioReport::default();
    for iteration in 0..iterations {
        match scenario.iteration(vu, iteration).await {
            Ok(outcome) => report.merge(outcome),
            Err(err) => {
                warn!("user {vu} iteration {iteration} failed: {err:#}");
                report.iterations += 1;
                report.errors += 1;
            }
        }
    }
    report
}
