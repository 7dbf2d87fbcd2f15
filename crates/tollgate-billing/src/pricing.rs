use std::collections::HashMap;

use tollgate_core::Snapshot;
use tollgate_store::{CatalogStore, ModelPrice, Service, StoreError};

type PriceTable = HashMap<(Service, String), ModelPrice>;

/// Active prices, reloaded from the store on a timer
///
/// A billing context copies its price row at creation, so a reload never
/// changes the cost of an in-flight call.
#[derive(Debug, Default)]
pub struct PricingCatalog {
    prices: Snapshot<PriceTable>,
}

impl PricingCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_prices(prices: impl IntoIterator<Item = ModelPrice>) -> Self {
        let catalog = Self::new();
        catalog.install(prices);
        catalog
    }

    /// Replace the whole table with the store's active prices
    ///
    /// On failure the previous table stays in service.
    pub async fn reload(&self, store: &dyn CatalogStore) -> Result<usize, StoreError> {
        let prices = store.list_active_pricing().await?;
        Ok(self.install(prices))
    }

    /// Replace the whole table, returning the number of priced models
    pub fn install(&self, prices: impl IntoIterator<Item = ModelPrice>) -> usize {
        let table: PriceTable = prices
            .into_iter()
            .map(|price| ((price.service, price.model.clone()), price))
            .collect();
        let count = table.len();
        self.prices.replace(table);
        count
    }

    pub fn price(&self, service: Service, model: &str) -> Option<ModelPrice> {
        self.prices.load().get(&(service, model.to_owned())).cloned()
    }

    /// Priced models for one service, sorted
    pub fn models(&self, service: Service) -> Vec<String> {
        let table = self.prices.load();
        let mut models: Vec<String> = table
            .keys()
            .filter(|(s, _)| *s == service)
            .map(|(_, model)| model.clone())
            .collect();
        models.sort();
        models
    }
}
