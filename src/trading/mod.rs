pub mod executor;
pub mod guard;
pub mod journal;
pub mod position;
pub mod risk_sizer;

pub use executor::{ExecutionOutcome, OrderExecutor, SyncReport};
pub use guard::{EquityGuard, GuardVerdict};
pub use journal::{DailySummary, JournalEntry, SkipCode, SummarySchedule, TradeJournal};
pub use position::{ClosedTrade, Order, Position};
