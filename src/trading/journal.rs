use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::config::Config;
use crate::models::Side;
use crate::trading::position::{ClosedTrade, Position};

/// Entries kept in memory and on disk; the oldest go first.
const MAX_ENTRIES: usize = 5_000;

/// Stable category of a skipped decision. Reasons carry live numbers,
/// codes do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCode {
    /// Held by the mode selector.
    #[default]
    Hold,
    /// Lot sizing aborted.
    Sizing,
    /// Spread or slippage gate at execution.
    Gate,
    /// No usable live quote before the order.
    Quote,
    /// Broker failure or final rejection.
    Execution,
}

impl std::fmt::Display for SkipCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipCode::Hold => "hold",
            SkipCode::Sizing => "sizing",
            SkipCode::Gate => "gate",
            SkipCode::Quote => "quote",
            SkipCode::Execution => "execution",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEntry {
    Opened {
        at: DateTime<Utc>,
        position: Position,
    },
    Closed {
        at: DateTime<Utc>,
        trade: ClosedTrade,
    },
    /// A decision that did not produce an order: held, dropped, aborted or rejected.
    Skipped {
        at: DateTime<Utc>,
        side: Option<Side>,
        score: Option<f64>,
        #[serde(default)]
        code: SkipCode,
        reason: String,
    },
}

impl JournalEntry {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            JournalEntry::Opened { at, .. }
            | JournalEntry::Closed { at, .. }
            | JournalEntry::Skipped { at, .. } => *at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// Fraction of closed trades that won, 0 when there were none.
    pub win_rate: f64,
    pub total_pnl: f64,
    pub best_trade: Option<f64>,
    pub worst_trade: Option<f64>,
    pub most_used_mode: Option<String>,
    pub most_used_reason: Option<String>,
    pub skipped: usize,
}

impl DailySummary {
    pub fn message(&self) -> String {
        let mut msg = format!(
            "Daily summary {}: {} trade(s), {}W/{}L ({:.1}%), pnl {:+.2}",
            self.date,
            self.trades,
            self.wins,
            self.losses,
            self.win_rate * 100.0,
            self.total_pnl
        );
        if let (Some(best), Some(worst)) = (self.best_trade, self.worst_trade) {
            msg.push_str(&format!(", best {:+.2}, worst {:+.2}", best, worst));
        }
        if let Some(mode) = &self.most_used_mode {
            msg.push_str(&format!(", mode {}", mode));
        }
        if let Some(reason) = &self.most_used_reason {
            msg.push_str(&format!(", top setup \"{}\"", reason));
        }
        msg
    }

    pub fn log(&self) {
        info!("{}", "=".repeat(60));
        info!("DAILY SUMMARY {}", self.date);
        info!("  Trades: {} ({} wins / {} losses)", self.trades, self.wins, self.losses);
        info!("  Win rate: {:.1}%", self.win_rate * 100.0);
        info!("  Total P&L: {:+.2}", self.total_pnl);
        if let (Some(best), Some(worst)) = (self.best_trade, self.worst_trade) {
            info!("  Best: {:+.2}  Worst: {:+.2}", best, worst);
        }
        if let Some(mode) = &self.most_used_mode {
            info!("  Most used mode: {}", mode);
        }
        if let Some(reason) = &self.most_used_reason {
            info!("  Most used setup: {}", reason);
        }
        info!("  Skipped decisions: {}", self.skipped);
        info!("{}", "=".repeat(60));
    }
}

/// Append-only record of every decision outcome, persisted as JSON.
pub struct TradeJournal {
    entries: Vec<JournalEntry>,
    file: Option<String>,
    cap: usize,
}

impl TradeJournal {
    pub fn new(cfg: &Config) -> Self {
        let mut journal = Self {
            entries: Vec::new(),
            file: Some(format!("{}/trade_journal.json", cfg.log_dir)),
            cap: MAX_ENTRIES,
        };
        journal.load_state();
        journal
    }

    pub fn in_memory() -> Self {
        Self {
            entries: Vec::new(),
            file: None,
            cap: MAX_ENTRIES,
        }
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap.max(1);
        self.trim();
        self
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn record_open(&mut self, position: &Position) {
        self.push(JournalEntry::Opened {
            at: position.opened_at,
            position: position.clone(),
        });
    }

    pub fn record_close(&mut self, trade: &ClosedTrade) {
        self.push(JournalEntry::Closed {
            at: trade.closed_at,
            trade: trade.clone(),
        });
    }

    pub fn record_skip(
        &mut self,
        at: DateTime<Utc>,
        side: Option<Side>,
        score: Option<f64>,
        code: SkipCode,
        reason: &str,
    ) {
        self.push(JournalEntry::Skipped {
            at,
            side,
            score,
            code,
            reason: reason.to_string(),
        });
    }

    fn push(&mut self, entry: JournalEntry) {
        self.entries.push(entry);
        self.trim();
        self.save_state();
    }

    fn trim(&mut self) {
        if self.entries.len() > self.cap {
            let excess = self.entries.len() - self.cap;
            self.entries.drain(..excess);
        }
    }

    /// Summary of trades closed on `date` in `tz`.
    pub fn summary_for(&self, date: NaiveDate, tz: Tz) -> DailySummary {
        let on_day = |at: &DateTime<Utc>| at.with_timezone(&tz).date_naive() == date;

        let closed: Vec<&ClosedTrade> = self
            .entries
            .iter()
            .filter_map(|e| match e {
                JournalEntry::Closed { at, trade } if on_day(at) => Some(trade),
                _ => None,
            })
            .collect();
        let skipped = self
            .entries
            .iter()
            .filter(|e| matches!(e, JournalEntry::Skipped { at, .. } if on_day(at)))
            .count();

        let wins = closed.iter().filter(|t| t.is_win()).count();
        let total_pnl: f64 = closed.iter().map(|t| t.pnl).sum();
        let best_trade = closed.iter().map(|t| t.pnl).fold(None, |acc: Option<f64>, p| {
            Some(acc.map_or(p, |a| a.max(p)))
        });
        let worst_trade = closed.iter().map(|t| t.pnl).fold(None, |acc: Option<f64>, p| {
            Some(acc.map_or(p, |a| a.min(p)))
        });

        DailySummary {
            date,
            trades: closed.len(),
            wins,
            losses: closed.len() - wins,
            win_rate: if closed.is_empty() {
                0.0
            } else {
                wins as f64 / closed.len() as f64
            },
            total_pnl: round2(total_pnl),
            best_trade,
            worst_trade,
            most_used_mode: most_common(closed.iter().filter_map(|t| t.position.mode.map(|m| m.to_string()))),
            most_used_reason: most_common(closed.iter().map(|t| t.position.reason.clone())),
            skipped,
        }
    }

    fn save_state(&self) {
        let Some(file) = &self.file else {
            return;
        };
        let _ = fs::create_dir_all(Path::new(file).parent().unwrap_or(Path::new("logs")));
        match serde_json::to_string_pretty(&self.entries) {
            Ok(json) => {
                if let Err(e) = fs::write(file, json) {
                    warn!("Failed to write trade journal: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize trade journal: {}", e),
        }
    }

    fn load_state(&mut self) {
        let Some(file) = &self.file else {
            return;
        };
        let Ok(content) = fs::read_to_string(file) else {
            return;
        };
        match serde_json::from_str::<Vec<JournalEntry>>(&content) {
            Ok(entries) => {
                info!("Loaded {} journal entries", entries.len());
                self.entries = entries;
            }
            Err(e) => warn!("Ignoring unreadable journal {}: {}", file, e),
        }
        self.trim();
    }
}

/// Most frequent value; ties go to the value seen first.
fn most_common(values: impl Iterator<Item = String>) -> Option<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (i, v) in values.enumerate() {
        counts.entry(v).or_insert((0, i)).0 += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.1 .1.cmp(&a.1 .1)))
        .map(|(v, _)| v)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Fires once per local day at or after the configured time.
pub struct SummarySchedule {
    at: NaiveTime,
    tz: Tz,
    last_fired: Option<NaiveDate>,
}

impl SummarySchedule {
    pub fn new(cfg: &Config) -> Self {
        let (h, m) = cfg.summary_time;
        Self {
            at: NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN),
            tz: cfg.timezone(),
            last_fired: None,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// The local date to summarise, when the summary is due at `now`.
    pub fn due(&mut self, now: DateTime<Utc>) -> Option<NaiveDate> {
        let local = now.with_timezone(&self.tz);
        let today = local.date_naive();
        if local.time() < self.at || self.last_fired == Some(today) {
            return None;
        }
        self.last_fired = Some(today);
        Some(today)
    }
}
