//! Transformation of raw search responses into the canonical candidate list.

use quoter_policy::{host_of, DomainPolicy};
use quoter_types::Candidate;
use rust_decimal::Decimal;
use serde::Deserialize;

/// One item as returned by the shopping search, either array.
#[derive(Debug, Clone, Deserialize)]
struct RawShoppingItem {
	#[serde(default)]
	title: Option<String>,
	/// Numeric listing price; items without one are dropped.
	#[serde(default)]
	extracted_price: Option<f64>,
	/// Store name as listed.
	#[serde(default)]
	source: Option<String>,
	/// Deep-lookup handle for this item.
	#[serde(default)]
	serpapi_product_api: Option<String>,
	#[serde(default)]
	product_link: Option<String>,
	#[serde(default)]
	link: Option<String>,
}

impl RawShoppingItem {
	fn best_link(&self) -> Option<&str> {
		self.product_link.as_deref().or(self.link.as_deref())
	}
}

/// Derives the canonical candidate list from a raw search response.
///
/// The two result arrays are merged, items with null/zero prices dropped,
/// blocked-domain sources dropped (saving deep-lookup calls downstream),
/// listing-only URLs dropped, the remainder sorted ascending by listing
/// price and truncated to `max_valid_products`. Positions are assigned
/// after the sort and identify candidates for the rest of the pipeline.
pub fn derive_candidates(
	raw: &serde_json::Value,
	policy: &DomainPolicy,
	max_valid_products: usize,
) -> Vec<Candidate> {
	let mut items: Vec<RawShoppingItem> = Vec::new();
	for array_key in ["shopping_results", "inline_shopping_results"] {
		if let Some(array) = raw.get(array_key).and_then(|v| v.as_array()) {
			for item in array {
				if let Ok(parsed) = serde_json::from_value::<RawShoppingItem>(item.clone()) {
					items.push(parsed);
				}
			}
		}
	}

	let mut priced: Vec<(Decimal, RawShoppingItem)> = items
		.into_iter()
		.filter_map(|item| {
			let price = item
				.extracted_price
				.and_then(Decimal::from_f64_retain)
				.filter(|p| *p > Decimal::ZERO)?;
			Some((price, item))
		})
		.filter(|(_, item)| match item.best_link().and_then(host_of) {
			Some(host) => !policy.is_blocked(&host),
			// No URL at all: keep only if a deep-lookup handle can still
			// resolve a store
			None => item.serpapi_product_api.is_some(),
		})
		.filter(|(_, item)| {
			// Items whose only URL is a listing page cannot yield a product
			// page without a deep-lookup handle
			if item.serpapi_product_api.is_some() {
				return true;
			}
			match item.best_link() {
				Some(link) => {
					let host = host_of(link).unwrap_or_default();
					!DomainPolicy::is_listing_url(link, &host)
				},
				None => false,
			}
		})
		.collect();

	priced.sort_by(|a, b| a.0.cmp(&b.0));
	priced.truncate(max_valid_products);

	priced
		.into_iter()
		.enumerate()
		.map(|(position, (price, item))| Candidate {
			position,
			title: item.title.clone().unwrap_or_default(),
			listing_price: price,
			source_name: item.source.clone().unwrap_or_default(),
			deep_lookup_url: item.serpapi_product_api.clone(),
			product_link: item.best_link().map(|s| s.to_string()),
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use quoter_policy::BlockedDomainSet;
	use serde_json::json;

	fn policy() -> DomainPolicy {
		DomainPolicy::new(BlockedDomainSet::with_defaults())
	}

	fn item(price: f64, link: &str) -> serde_json::Value {
		json!({
			"title": "Notebook",
			"extracted_price": price,
			"source": "Loja",
			"product_link": link,
		})
	}

	#[test]
	fn merges_both_arrays_and_sorts_ascending() {
		let raw = json!({
			"shopping_results": [
				item(300.0, "https://a.com.br/p/1"),
				item(100.0, "https://b.com.br/p/2"),
			],
			"inline_shopping_results": [
				item(200.0, "https://c.com.br/p/3"),
			],
		});
		let candidates = derive_candidates(&raw, &policy(), 150);
		let prices: Vec<_> = candidates.iter().map(|c| c.listing_price).collect();
		assert_eq!(
			prices,
			vec![Decimal::from(100), Decimal::from(200), Decimal::from(300)]
		);
		// Positions follow the sorted order
		assert_eq!(
			candidates.iter().map(|c| c.position).collect::<Vec<_>>(),
			vec![0, 1, 2]
		);
	}

	#[test]
	fn drops_unpriced_blocked_and_listing_items() {
		let raw = json!({
			"shopping_results": [
				{ "title": "sem preco", "product_link": "https://a.com.br/p/1" },
				{ "title": "zero", "extracted_price": 0.0, "product_link": "https://a.com.br/p/2" },
				item(100.0, "https://www.amazon.com.br/dp/42"),
				item(120.0, "https://loja.com.br/busca/notebook"),
				item(150.0, "https://loja.com.br/p/3"),
			],
		});
		let candidates = derive_candidates(&raw, &policy(), 150);
		assert_eq!(candidates.len(), 1);
		assert_eq!(candidates[0].listing_price, Decimal::from(150));
	}

	#[test]
	fn truncates_to_ceiling() {
		let items: Vec<_> = (1..=20)
			.map(|i| item(i as f64, &format!("https://loja{}.com.br/p/1", i)))
			.collect();
		let raw = json!({ "shopping_results": items });
		let candidates = derive_candidates(&raw, &policy(), 5);
		assert_eq!(candidates.len(), 5);
		assert_eq!(candidates[4].listing_price, Decimal::from(5));
	}

	#[test]
	fn listing_url_kept_when_deep_lookup_handle_present() {
		let raw = json!({
			"shopping_results": [{
				"title": "Notebook",
				"extracted_price": 100.0,
				"source": "Loja",
				"product_link": "https://loja.com.br/busca/notebook",
				"serpapi_product_api": "https://serpapi.com/search?product_id=1",
			}],
		});
		let candidates = derive_candidates(&raw, &policy(), 150);
		assert_eq!(candidates.len(), 1);
	}
}
