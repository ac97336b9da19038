use async_trait::async_trait;

use crate::domain::product::{Product, ProductId};
use crate::store::StoreError;

/// Read-only product lookup used for availability and hallucination checks.
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<Product>, StoreError>;
    async fn find(&self, product_id: &ProductId) -> Result<Option<Product>, StoreError>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryCatalog {
    products: Vec<Product>,
}

impl InMemoryCatalog {
    pub fn new(products: Vec<Product>) -> Self {
        Self { products }
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

#[async_trait]
impl CatalogLookup for InMemoryCatalog {
    /// Every whitespace-separated query token must appear in the name or id.
    async fn search(&self, query: &str) -> Result<Vec<Product>, StoreError> {
        let tokens: Vec<String> =
            query.split_whitespace().map(|token| token.to_lowercase()).collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .products
            .iter()
            .filter(|product| {
                let haystack = format!("{} {}", product.id.as_str(), product.name).to_lowercase();
                tokens.iter().all(|token| haystack.contains(token.as_str()))
            })
            .cloned()
            .collect())
    }

    async fn find(&self, product_id: &ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.products.iter().find(|product| &product.id == product_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{CatalogLookup, InMemoryCatalog};
    use crate::domain::product::{Product, ProductId};

    fn catalog() -> InMemoryCatalog {
        InMemoryCatalog::new(vec![
            Product::new("dress-1", "Linen Dress", Decimal::new(1200, 0)),
            Product::new("coat-7", "Wool Coat", Decimal::new(3400, 0)),
        ])
    }

    #[tokio::test]
    async fn search_matches_all_tokens_case_insensitively() {
        let catalog = catalog();
        let hits = catalog.search("linen DRESS").await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_str(), "dress-1");
        assert!(catalog.search("silk dress").await.expect("search").is_empty());
        assert!(catalog.search("   ").await.expect("search").is_empty());
    }

    #[tokio::test]
    async fn find_by_id() {
        let catalog = catalog();
        let coat = catalog.find(&ProductId("coat-7".to_string())).await.expect("find");
        assert_eq!(coat.map(|product| product.name), Some("Wool Coat".to_string()));
        assert!(catalog.find(&ProductId("nope".to_string())).await.expect("find").is_none());
    }
}
