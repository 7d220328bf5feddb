use crate::errors::StoreError;
use crate::models::PortfolioSnapshot;
use crate::store::{JsonlLog, read_json, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const STATE_FILE: &str = "nav_state.json";
pub const HISTORY_FILE: &str = "nav_history.jsonl";

/// Running cumulative valuation state. Persisted after every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavState {
    pub sequence: u64,
    pub initial_nav_usd: Option<f64>,
    pub last_nav_usd: Option<f64>,
    pub cumulative_funding_usd: f64,
    pub cumulative_profit_usd: f64,
    /// Funding recorded but not yet attributed to an update.
    pub pending_funding_usd: f64,
    /// Last cumulative deposit figure reported by the valuation endpoint.
    pub last_reported_deposits_usd: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Latest snapshot, kept until its history line is known to be written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_history: Option<PortfolioSnapshot>,
}

/// One reading from the valuation endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavObservation {
    pub nav_usd: f64,
    /// Cumulative external deposits, when the endpoint reports them.
    pub deposits_usd: Option<f64>,
}

/// Attributes NAV changes to external funding or trading profit.
///
/// Cumulative profit is only ever advanced by deltas, never recomputed from
/// absolute NAV. All read-modify-write-persist sequences run under one lock,
/// and in-memory state changes only once the state file has been replaced.
/// A snapshot whose history append failed stays in the state and is written
/// before anything newer.
pub struct NavTracker {
    state: Mutex<NavState>,
    state_path: PathBuf,
    history: JsonlLog,
    safety_stop_nav_usd: Option<f64>,
}

impl NavTracker {
    /// Open the tracker rooted at `dir`, resuming from `nav_state.json` if present.
    pub async fn open(
        dir: impl AsRef<Path>,
        safety_stop_nav_usd: Option<f64>,
    ) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        let state_path = dir.join(STATE_FILE);
        let state: NavState = read_json(&state_path).await?.unwrap_or_default();
        if let Some(nav) = state.last_nav_usd {
            info!(
                nav_usd = nav,
                cumulative_profit_usd = state.cumulative_profit_usd,
                cumulative_funding_usd = state.cumulative_funding_usd,
                sequence = state.sequence,
                "[NAV] resumed from persisted state"
            );
        }
        Ok(Self {
            state: Mutex::new(state),
            state_path,
            history: JsonlLog::new(dir.join(HISTORY_FILE)),
            safety_stop_nav_usd,
        })
    }

    pub async fn state(&self) -> NavState {
        self.state.lock().await.clone()
    }

    pub fn history(&self) -> &JsonlLog {
        &self.history
    }

    /// True when the last observed NAV is below the configured floor.
    pub async fn safety_stop_active(&self) -> bool {
        let state = self.state.lock().await;
        matches!(
            (state.last_nav_usd, self.safety_stop_nav_usd),
            (Some(nav), Some(floor)) if nav < floor
        )
    }

    /// Register an external deposit (negative for a withdrawal) to be
    /// attributed at the next update.
    pub async fn record_funding(&self, amount_usd: f64) -> Result<(), StoreError> {
        if !amount_usd.is_finite() {
            return Err(StoreError::InvalidValuation(format!(
                "funding amount {amount_usd}"
            )));
        }
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.pending_funding_usd += amount_usd;
        write_json_atomic(&self.state_path, &next).await?;
        *state = next;
        info!(
            amount_usd,
            pending_funding_usd = state.pending_funding_usd,
            "[NAV] funding recorded"
        );
        Ok(())
    }

    pub async fn update(&self, observed_nav_usd: f64) -> Result<PortfolioSnapshot, StoreError> {
        let mut state = self.state.lock().await;
        let next = state.clone();
        self.commit(&mut state, next, observed_nav_usd).await
    }

    /// Record any change in reported deposits as funding, then update.
    pub async fn observe(&self, obs: NavObservation) -> Result<PortfolioSnapshot, StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        if let Some(deposits) = obs.deposits_usd {
            if !deposits.is_finite() {
                return Err(StoreError::InvalidValuation(format!(
                    "reported deposits {deposits}"
                )));
            }
            // The first report is a baseline: earlier deposits are starting capital.
            if let Some(prev) = next.last_reported_deposits_usd {
                next.pending_funding_usd += deposits - prev;
            }
            next.last_reported_deposits_usd = Some(deposits);
        }
        self.commit(&mut state, next, obs.nav_usd).await
    }

    async fn commit(
        &self,
        state: &mut NavState,
        mut next: NavState,
        observed_nav_usd: f64,
    ) -> Result<PortfolioSnapshot, StoreError> {
        if !(observed_nav_usd.is_finite() && observed_nav_usd >= 0.0) {
            return Err(StoreError::InvalidValuation(format!(
                "observed NAV {observed_nav_usd}"
            )));
        }
        if let Some(unrecorded) = next.pending_history.take() {
            let appended = self.flush_history(&unrecorded).await?;
            // Same reading again with nothing new to attribute: finish the old update.
            if appended
                && unrecorded.observed_nav_usd == observed_nav_usd
                && next.pending_funding_usd == 0.0
            {
                write_json_atomic(&self.state_path, &next).await?;
                *state = next;
                return Ok(unrecorded);
            }
        }

        let snapshot = advance(
            &mut next,
            observed_nav_usd,
            self.safety_stop_nav_usd,
            Utc::now(),
        );
        next.pending_history = Some(snapshot.clone());

        write_json_atomic(&self.state_path, &next).await?;
        *state = next;
        self.history.append(&snapshot).await?;
        state.pending_history = None;

        info!(
            sequence = snapshot.sequence,
            nav_usd = snapshot.observed_nav_usd,
            profit_delta_usd = snapshot.profit_delta_usd,
            funding_delta_usd = snapshot.funding_delta_usd,
            cumulative_profit_usd = snapshot.realized_trading_profit_usd,
            trading_roi = snapshot.trading_roi,
            "[NAV] updated"
        );
        if snapshot.safety_stop {
            warn!(
                nav_usd = snapshot.observed_nav_usd,
                floor_usd = self.safety_stop_nav_usd.unwrap_or_default(),
                "[NAV] below safety floor, new executions halted"
            );
        }
        Ok(snapshot)
    }

    /// Append `snapshot` unless history already holds its sequence.
    async fn flush_history(&self, snapshot: &PortfolioSnapshot) -> Result<bool, StoreError> {
        let recorded: Vec<PortfolioSnapshot> = self.history.read_all().await?;
        if recorded.iter().any(|s| s.sequence == snapshot.sequence) {
            return Ok(false);
        }
        self.history.append(snapshot).await?;
        warn!(
            sequence = snapshot.sequence,
            profit_delta_usd = snapshot.profit_delta_usd,
            "[NAV] wrote history record left over from a failed append"
        );
        Ok(true)
    }
}

/// Apply one observation to `state` and describe it.
fn advance(
    state: &mut NavState,
    nav: f64,
    safety_stop_nav_usd: Option<f64>,
    now: DateTime<Utc>,
) -> PortfolioSnapshot {
    let (previous, funding_delta, profit_delta) = match state.last_nav_usd {
        None => {
            // Seed. Funding recorded before the first valuation is already in it.
            state.initial_nav_usd = Some(nav);
            state.pending_funding_usd = 0.0;
            (nav, 0.0, 0.0)
        }
        Some(prev) => {
            let funding = std::mem::take(&mut state.pending_funding_usd);
            (prev, funding, (nav - prev) - funding)
        }
    };

    state.sequence += 1;
    state.last_nav_usd = Some(nav);
    state.cumulative_funding_usd += funding_delta;
    state.cumulative_profit_usd += profit_delta;
    state.updated_at = Some(now);

    let capital = state.initial_nav_usd.unwrap_or(nav) + state.cumulative_funding_usd;
    let trading_roi = if capital > 0.0 {
        state.cumulative_profit_usd / capital
    } else {
        0.0
    };

    PortfolioSnapshot {
        sequence: state.sequence,
        observed_nav_usd: nav,
        previous_nav_usd: previous,
        funding_delta_usd: funding_delta,
        external_funding_usd: state.cumulative_funding_usd,
        profit_delta_usd: profit_delta,
        realized_trading_profit_usd: state.cumulative_profit_usd,
        trading_roi,
        safety_stop: safety_stop_nav_usd.is_some_and(|floor| nav < floor),
        timestamp: now,
    }
}
