//! Periodic cleanup of expired rows.

use chrono::Utc;
use tokio::{sync::watch, time::MissedTickBehavior};

use crate::AppState;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: u64,
    pub visitors: u64,
    pub rate_limits: u64,
}

/// Delete expired sessions and visitor state, and rate-limit rows older
/// than two of the longest configured windows.
pub async fn sweep_once(state: &AppState) -> Result<SweepReport, sqlx::Error> {
    let now = Utc::now();
    let config = &state.config;
    let window = [config.login_limit, config.register_limit, config.password_reset_limit]
        .iter()
        .map(|rule| rule.window)
        .max()
        .unwrap_or(config.login_limit.window);

    Ok(SweepReport {
        sessions: state.sessions.clean_expired(now).await?,
        visitors: state.visitors.clean_expired(now).await?,
        rate_limits: state.rate_limiter.purge_stale(now - window * 2).await?,
    })
}

/// Run [`sweep_once`] every `sweep_interval` until `shutdown` flips to true.
pub async fn run(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(state.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sweep_once(&state).await {
                    Ok(report) if report != SweepReport::default() => {
                        tracing::info!(
                            sessions = report.sessions,
                            visitors = report.visitors,
                            rate_limits = report.rate_limits,
                            "expired rows removed"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Cleanup sweep failed: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("cleanup sweep stopped");
}
