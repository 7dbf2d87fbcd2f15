use std::collections::{HashMap, HashSet};

use tollgate_core::Snapshot;
use tollgate_store::{CatalogStore, Provider, StoreError, UpstreamEndpoint};

use crate::DispatchError;

type EndpointMap = HashMap<Provider, Vec<UpstreamEndpoint>>;

/// Credentialed endpoints per provider, swapped wholesale on reload
#[derive(Debug, Default)]
pub struct UpstreamRegistry {
    endpoints: Snapshot<EndpointMap>,
}

impl UpstreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_endpoints(endpoints: impl IntoIterator<Item = UpstreamEndpoint>) -> Self {
        let registry = Self::new();
        registry.install(endpoints);
        registry
    }

    /// Replace the map with the store's active endpoints
    ///
    /// A failed load keeps the previous map in service.
    pub async fn reload(&self, store: &dyn CatalogStore) -> Result<usize, StoreError> {
        let endpoints = store.list_active_upstreams().await?;
        Ok(self.install(endpoints))
    }

    pub fn install(&self, endpoints: impl IntoIterator<Item = UpstreamEndpoint>) -> usize {
        let mut map = EndpointMap::new();
        let mut count = 0;
        for endpoint in endpoints {
            map.entry(endpoint.provider).or_default().push(endpoint);
            count += 1;
        }
        self.endpoints.replace(map);
        count
    }

    /// Weighted random choice among endpoints not in `excluded`
    pub fn select(&self, provider: Provider, excluded: &HashSet<i64>) -> Result<UpstreamEndpoint, DispatchError> {
        let map = self.endpoints.load();
        let candidates: Vec<&UpstreamEndpoint> = map
            .get(&provider)
            .map(|endpoints| {
                endpoints
                    .iter()
                    .filter(|e| e.weight > 0 && !excluded.contains(&e.id))
                    .collect()
            })
            .unwrap_or_default();

        let total: u64 = candidates.iter().map(|e| u64::from(e.weight)).sum();
        if total == 0 {
            return Err(DispatchError::NoAvailableUpstream(provider));
        }

        let roll = rand::random_range(0..total);
        pick_weighted(&candidates, roll)
            .cloned()
            .ok_or(DispatchError::NoAvailableUpstream(provider))
    }

    /// Number of endpoints registered for a provider, including zero-weight ones
    pub fn len(&self, provider: Provider) -> usize {
        self.endpoints.load().get(&provider).map_or(0, Vec::len)
    }
}

/// Walk the candidates subtracting weights until `roll` goes negative
///
/// Falls back to the last candidate if the walk never selects one.
fn pick_weighted<'a>(candidates: &[&'a UpstreamEndpoint], roll: u64) -> Option<&'a UpstreamEndpoint> {
    let mut remaining = i128::from(roll);
    for &candidate in candidates {
        remaining -= i128::from(candidate.weight);
        if remaining < 0 {
            return Some(candidate);
        }
    }
    candidates.last().copied()
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    fn endpoint(id: i64, weight: u32) -> UpstreamEndpoint {
        UpstreamEndpoint {
            id,
            provider: Provider::OpenAi,
            base_url: format!("http://upstream-{id}"),
            api_key: SecretString::from(format!("key-{id}")),
            weight,
        }
    }

    #[test]
    fn walk_maps_roll_ranges_to_weights() {
        let (a, b, c) = (endpoint(1, 1), endpoint(2, 3), endpoint(3, 6));
        let candidates = vec![&a, &b, &c];

        let pick = |roll| pick_weighted(&candidates, roll).unwrap().id;
        assert_eq!(pick(0), 1);
        assert_eq!(pick(1), 2);
        assert_eq!(pick(3), 2);
        assert_eq!(pick(4), 3);
        assert_eq!(pick(9), 3);
        // Out of range rolls fall back to the last candidate
        assert_eq!(pick(100), 3);
    }

    #[test]
    fn never_selects_excluded_or_zero_weight() {
        let registry = UpstreamRegistry::from_endpoints([endpoint(1, 5), endpoint(2, 0), endpoint(3, 5)]);
        let excluded = HashSet::from([1]);

        for _ in 0..200 {
            assert_eq!(registry.select(Provider::OpenAi, &excluded).unwrap().id, 3);
        }
    }

    #[test]
    fn any_positive_candidate_is_always_found() {
        let registry = UpstreamRegistry::from_endpoints([endpoint(1, 0), endpoint(2, 0), endpoint(3, 1)]);

        for _ in 0..200 {
            assert_eq!(registry.select(Provider::OpenAi, &HashSet::new()).unwrap().id, 3);
        }
    }

    #[test]
    fn empty_candidate_set_is_unavailable() {
        let registry = UpstreamRegistry::from_endpoints([endpoint(1, 1)]);

        let all_excluded = registry.select(Provider::OpenAi, &HashSet::from([1]));
        assert!(matches!(all_excluded, Err(DispatchError::NoAvailableUpstream(Provider::OpenAi))));

        let other_provider = registry.select(Provider::Speech, &HashSet::new());
        assert!(matches!(other_provider, Err(DispatchError::NoAvailableUpstream(Provider::Speech))));
    }

    #[test]
    fn selection_roughly_follows_weights() {
        let registry = UpstreamRegistry::from_endpoints([endpoint(1, 1), endpoint(2, 9)]);
        let heavy = (0..2_000)
            .filter(|_| registry.select(Provider::OpenAi, &HashSet::new()).unwrap().id == 2)
            .count();

        assert!(heavy > 1_600, "heavy endpoint picked {heavy} times");
    }

    #[test]
    fn install_replaces_whole_map() {
        let registry = UpstreamRegistry::from_endpoints([endpoint(1, 1), endpoint(2, 1)]);
        assert_eq!(registry.len(Provider::OpenAi), 2);

        registry.install([endpoint(3, 1)]);
        assert_eq!(registry.len(Provider::OpenAi), 1);
        assert_eq!(registry.select(Provider::OpenAi, &HashSet::new()).unwrap().id, 3);
    }
}
