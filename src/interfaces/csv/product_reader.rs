use crate::domain::money::Amount;
use crate::domain::product::Product;
use crate::error::{EngineError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// One row of a product catalog CSV.
#[derive(Debug, Clone, Deserialize)]
pub struct ProductRow {
    pub id: u32,
    pub price: Decimal,
    pub group_size: u32,
    pub timeout_minutes: i64,
    pub stock: u32,
}

impl TryFrom<ProductRow> for Product {
    type Error = EngineError;

    fn try_from(row: ProductRow) -> Result<Self> {
        if row.group_size < 2 {
            return Err(EngineError::Validation(format!(
                "product {} group size must be at least 2",
                row.id
            )));
        }
        if row.timeout_minutes <= 0 {
            return Err(EngineError::Validation(format!(
                "product {} timeout must be positive",
                row.id
            )));
        }
        Ok(Product {
            id: row.id,
            price_per_person: Amount::new(row.price)?,
            group_size: row.group_size,
            timeout_millis: row.timeout_minutes * 60_000,
            active: true,
            stock: row.stock,
            sold: 0,
        })
    }
}

/// Reads a product catalog from a CSV source, one validated `Product` per row.
pub struct ProductReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ProductReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    pub fn products(self) -> impl Iterator<Item = Result<Product>> {
        self.reader.into_deserialize().map(|result| {
            result
                .map_err(EngineError::from)
                .and_then(|row: ProductRow| Product::try_from(row))
        })
    }
}
