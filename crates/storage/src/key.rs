//! Cache keys for mosaic artifacts.

use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

/// Separates variable and product in the on-disk entry name.
const PRODUCT_SEPARATOR: char = '@';

/// Identity of a mosaic artifact: `(region, date, variable[, product])`.
///
/// Renders to `ntl:{region}:{date}:{variable}[:{product}]` for key-value
/// stores and `{region}/{date}/{variable}[@{product}]` on disk. Product
/// entries are siblings of the primary entry, never nested inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub region: String,
    pub date: NaiveDate,
    pub variable: String,
    pub product: Option<String>,
}

impl CacheKey {
    pub fn new(region: impl Into<String>, date: NaiveDate, variable: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            date,
            variable: variable.into(),
            product: None,
        }
    }

    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    /// Reject components that could escape a cache root or make two keys
    /// render to the same path or key string.
    pub fn validate(&self) -> Result<()> {
        check_component("region", &self.region)?;
        check_component("variable", &self.variable)?;
        if let Some(product) = &self.product {
            check_component("product", product)?;
        }
        Ok(())
    }

    /// Directory of the entry relative to a cache root.
    pub fn relative_path(&self) -> Result<PathBuf> {
        self.validate()?;
        let mut path = PathBuf::from(&self.region);
        path.push(self.date.format("%Y-%m-%d").to_string());
        match &self.product {
            Some(product) => path.push(format!("{}{}{}", self.variable, PRODUCT_SEPARATOR, product)),
            None => path.push(&self.variable),
        }
        Ok(path)
    }
}

fn check_component(field: &str, value: &str) -> Result<()> {
    let reason = if value.is_empty() {
        Some("is empty")
    } else if value.starts_with('.') || value.contains("..") {
        Some("contains a relative path segment")
    } else if value
        .chars()
        .any(|c| matches!(c, '/' | '\\' | ':' | PRODUCT_SEPARATOR) || c.is_control())
    {
        Some("contains a reserved character")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StorageError::InvalidKey(format!("{} {:?} {}", field, value, reason))),
        None => Ok(()),
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ntl:{}:{}:{}",
            self.region,
            self.date.format("%Y-%m-%d"),
            self.variable
        )?;
        if let Some(product) = &self.product {
            write!(f, ":{}", product)?;
        }
        Ok(())
    }
}
