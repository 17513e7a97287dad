use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::SymbolSpec;

/// Inputs for one sizing call, captured fresh each decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskParameters {
    pub account_balance: f64,
    pub risk_fraction: f64,
    pub broker_min_lot: f64,
    pub stop_distance_price: f64,
    pub pip_value: f64,
    pub lot_step: f64,
    /// `None` leaves the size unbounded above.
    pub broker_max_lot: Option<f64>,
}

impl RiskParameters {
    pub fn new(balance: f64, risk_fraction: f64, stop_distance: f64, spec: &SymbolSpec) -> Self {
        Self {
            account_balance: balance,
            risk_fraction,
            broker_min_lot: spec.min_lot,
            stop_distance_price: stop_distance,
            pip_value: spec.pip_value,
            lot_step: spec.lot_step,
            broker_max_lot: (spec.max_lot > 0.0).then_some(spec.max_lot),
        }
    }
}

/// Lot size risking `risk_fraction` of the balance over the stop distance,
/// floored to the lot step and never below the broker minimum.
///
/// The minimum-lot clamp can push risk above the target fraction on small
/// accounts; that is accepted rather than skipping the trade.
pub fn size(p: &RiskParameters) -> Result<f64, EngineError> {
    let finite = [
        p.account_balance,
        p.risk_fraction,
        p.broker_min_lot,
        p.stop_distance_price,
        p.pip_value,
        p.lot_step,
    ]
    .iter()
    .all(|v| v.is_finite());
    if !finite {
        return Err(EngineError::InvalidRiskInput("non-finite input".to_string()));
    }
    if p.account_balance <= 0.0 {
        return Err(EngineError::InvalidRiskInput(format!(
            "account balance {} must be positive",
            p.account_balance
        )));
    }
    if p.stop_distance_price <= 0.0 {
        return Err(EngineError::InvalidRiskInput(format!(
            "stop distance {} must be positive",
            p.stop_distance_price
        )));
    }
    if p.risk_fraction <= 0.0 || p.risk_fraction > 1.0 {
        return Err(EngineError::InvalidRiskInput(format!(
            "risk fraction {} outside (0, 1]",
            p.risk_fraction
        )));
    }
    if p.pip_value <= 0.0 || p.lot_step <= 0.0 || p.broker_min_lot < 0.0 {
        return Err(EngineError::InvalidRiskInput(
            "pip value and lot step must be positive".to_string(),
        ));
    }

    let raw = (p.account_balance * p.risk_fraction) / (p.stop_distance_price * p.pip_value);
    let stepped = (raw / p.lot_step + 1e-9).floor() * p.lot_step;
    let mut lot = stepped.max(p.broker_min_lot);
    if let Some(max) = p.broker_max_lot {
        lot = lot.min(max.max(p.broker_min_lot));
    }
    Ok(round8(lot))
}

fn round8(x: f64) -> f64 {
    (x * 1e8).round() / 1e8
}
