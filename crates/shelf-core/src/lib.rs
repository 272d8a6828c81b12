//! Core product record types shared by the extractor and the assembler.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "shelf-core";

/// One admitted catalog entry. `url` is the dedup key and is never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub url: String,
    pub name: String,
    pub image: String,
    pub price: String,
    pub rating_avg: f64,
    pub rating_count: u32,
}

/// Record as produced by a page extraction routine, before admission.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub rating_avg: f64,
    #[serde(default)]
    pub rating_count: u32,
}

impl RawRecord {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Admission gate: a record without a URL can never enter a catalog.
    ///
    /// Whitespace only counts for the emptiness check; an admitted URL is kept
    /// byte for byte, so it dedups exactly as the extractor produced it.
    pub fn into_product(self) -> Option<ProductRecord> {
        if self.url.trim().is_empty() {
            return None;
        }
        Some(ProductRecord {
            url: self.url,
            name: self.name,
            image: self.image,
            price: self.price,
            rating_avg: self.rating_avg,
            rating_count: self.rating_count,
        })
    }
}

impl ProductRecord {
    pub fn has_rating(&self) -> bool {
        self.rating_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_or_blank_url_is_never_admitted() {
        assert!(RawRecord::default().into_product().is_none());
        let blank = RawRecord {
            url: "   ".to_string(),
            name: "Trail Vest".to_string(),
            price: "€89,00".to_string(),
            ..Default::default()
        };
        assert!(blank.into_product().is_none());
    }

    #[test]
    fn admitted_record_keeps_fields_and_url_verbatim() {
        let raw = RawRecord {
            url: " https://shop.test/products/vest ".to_string(),
            name: "Trail Vest".to_string(),
            image: "https://cdn.test/vest.jpg".to_string(),
            price: "€89,00".to_string(),
            rating_avg: 4.5,
            rating_count: 12,
        };
        let product = raw.into_product().unwrap();
        assert_eq!(product.url, " https://shop.test/products/vest ");
        assert_eq!(product.name, "Trail Vest");
        assert_eq!(product.rating_count, 12);
        assert!(product.has_rating());
    }

    #[test]
    fn serializes_with_snake_case_rating_fields() {
        let product = RawRecord::with_url("https://shop.test/products/a")
            .into_product()
            .unwrap();
        let value = serde_json::to_value(&product).unwrap();
        assert_eq!(value["rating_avg"], 0.0);
        assert_eq!(value["rating_count"], 0);
        assert_eq!(value["url"], "https://shop.test/products/a");
    }
}
