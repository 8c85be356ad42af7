//! Price checking and per-item classification
//!
//! Once a bill row is matched to a tie-up item, the allowed amount follows
//! the item kind: unit rates multiply by quantity, service and bundle rates
//! apply flat. Billed at or under allowed is GREEN; over is RED with the
//! difference as the recoverable extra.

use crate::types::{ItemKind, ItemRow, ItemStatus, TieUpItem};

/// Float guard for rupee comparisons; a genuine 1-paisa overrun still
/// classifies RED.
const EPSILON: f64 = 1e-9;

/// Outcome of one price check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceCheck {
    pub status: ItemStatus,
    pub bill_amount: f64,
    pub allowed_amount: f64,
    pub extra_amount: f64,
}

/// Allowed amount for a matched tie-up item.
///
/// `rate_override` carries a manual tie-up rate edit when one is persisted.
pub fn allowed_amount(item: &TieUpItem, quantity: Option<f64>, rate_override: Option<f64>) -> f64 {
    let rate = rate_override.unwrap_or(item.rate);
    match item.kind {
        ItemKind::Unit => rate * quantity.unwrap_or(1.0),
        ItemKind::Service | ItemKind::Bundle => rate,
    }
}

/// Classify a matched bill row against its tie-up item.
pub fn check_price(row: &ItemRow, matched: &TieUpItem, rate_override: Option<f64>) -> PriceCheck {
    let allowed = allowed_amount(matched, row.quantity, rate_override);
    if row.amount > allowed + EPSILON {
        PriceCheck {
            status: ItemStatus::Red,
            bill_amount: row.amount,
            allowed_amount: allowed,
            extra_amount: row.amount - allowed,
        }
    } else {
        PriceCheck {
            status: ItemStatus::Green,
            bill_amount: row.amount,
            allowed_amount: allowed,
            extra_amount: 0.0,
        }
    }
}
