use crate::domain::money::Amount;
use serde::{Deserialize, Serialize};

pub type ProductId = u32;

/// A product snapshot, read-only to this engine. Sessions copy the fields
/// they depend on (`group_size`, `price_per_person`) at creation time, so a
/// later catalog change never affects a running session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub price_per_person: Amount,
    /// Target participant count for a full group.
    pub group_size: u32,
    /// How long a session derived from this product stays open.
    pub timeout_millis: i64,
    pub active: bool,
    pub stock: u32,
    pub sold: u32,
}

impl Product {
    /// Whether new sessions may be started for this product.
    pub fn available(&self) -> bool {
        self.active && self.sold < self.stock
    }
}
