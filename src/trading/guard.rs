use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::config::GuardConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum GuardVerdict {
    Allowed,
    /// New entries are blocked. `newly` is set only on the check that tripped it.
    Halted { reason: String, newly: bool },
}

impl GuardVerdict {
    pub fn allows_entries(&self) -> bool {
        matches!(self, GuardVerdict::Allowed)
    }
}

/// Stops new entries for the rest of the trading day once the daily loss
/// or the drawdown from peak equity crosses its limit. A limit of zero
/// disables that check.
pub struct EquityGuard {
    cfg: GuardConfig,
    tz: Tz,
    day: Option<NaiveDate>,
    day_start_equity: f64,
    peak_equity: f64,
    halted: Option<String>,
}

impl EquityGuard {
    pub fn new(cfg: GuardConfig, tz: Tz) -> Self {
        Self {
            cfg,
            tz,
            day: None,
            day_start_equity: 0.0,
            peak_equity: 0.0,
            halted: None,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn check(&mut self, equity: f64, now: DateTime<Utc>) -> GuardVerdict {
        let today = now.with_timezone(&self.tz).date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.day_start_equity = equity;
            self.halted = None;
        }
        self.peak_equity = self.peak_equity.max(equity);

        if let Some(reason) = &self.halted {
            return GuardVerdict::Halted {
                reason: reason.clone(),
                newly: false,
            };
        }

        let daily_loss = fraction_below(self.day_start_equity, equity);
        let drawdown = fraction_below(self.peak_equity, equity);
        let reason = if self.cfg.max_daily_loss > 0.0 && daily_loss >= self.cfg.max_daily_loss {
            Some(format!(
                "daily loss {:.2}% reached limit {:.2}%",
                daily_loss * 100.0,
                self.cfg.max_daily_loss * 100.0
            ))
        } else if self.cfg.max_drawdown > 0.0 && drawdown >= self.cfg.max_drawdown {
            Some(format!(
                "drawdown {:.2}% from peak {:.2} reached limit {:.2}%",
                drawdown * 100.0,
                self.peak_equity,
                self.cfg.max_drawdown * 100.0
            ))
        } else {
            None
        };

        match reason {
            Some(reason) => {
                warn!("🛑 Entries halted for {}: {}", today, reason);
                self.halted = Some(reason.clone());
                GuardVerdict::Halted { reason, newly: true }
            }
            None => GuardVerdict::Allowed,
        }
    }
}

fn fraction_below(reference: f64, equity: f64) -> f64 {
    if reference <= 0.0 {
        0.0
    } else {
        ((reference - equity) / reference).max(0.0)
    }
}
