//! Store-offer parsing and selection for the deep-lookup path.

use quoter_policy::{DomainPolicy, PolicyVerdict};
use quoter_types::StoreOffer;
use rust_decimal::Decimal;
use std::collections::HashSet;

/// Tolerance between a store offer and the candidate's listing price.
pub const OFFER_TOLERANCE: f64 = 0.15;

/// Parses the store offers out of a raw deep-lookup response.
///
/// Offers come from `product_results.stores` plus any `online_sellers`
/// array; both shapes carry `{ name, link, extracted_price }`.
pub fn parse_offers(raw: &serde_json::Value) -> Vec<StoreOffer> {
	let mut offers = Vec::new();

	let arrays = [
		raw.pointer("/product_results/stores"),
		raw.pointer("/sellers_results/online_sellers"),
		raw.get("online_sellers"),
	];

	for array in arrays.into_iter().flatten() {
		let Some(array) = array.as_array() else {
			continue;
		};
		for item in array {
			let price = item
				.get("extracted_price")
				.and_then(|v| v.as_f64())
				.and_then(Decimal::from_f64_retain);
			let link = item.get("link").and_then(|v| v.as_str());
			if let (Some(price), Some(link)) = (price, link) {
				offers.push(StoreOffer {
					name: item
						.get("name")
						.and_then(|v| v.as_str())
						.unwrap_or_default()
						.to_string(),
					link: link.to_string(),
					price,
				});
			}
		}
	}

	offers
}

/// Whether an offer price stays within tolerance of the listing price.
pub fn within_tolerance(offer: Decimal, listing: Decimal, tolerance: f64) -> bool {
	if listing <= Decimal::ZERO {
		return false;
	}
	let bound = listing
		* Decimal::from_f64_retain(tolerance).unwrap_or_default();
	(offer - listing).abs() <= bound
}

/// Picks the first offer that survives the price tolerance and the domain
/// policy, in API order.
pub fn select_offer(
	offers: Vec<StoreOffer>,
	listing_price: Decimal,
	policy: &DomainPolicy,
	accepted_domains: &HashSet<String>,
) -> Option<StoreOffer> {
	offers
		.into_iter()
		.filter(|offer| within_tolerance(offer.price, listing_price, OFFER_TOLERANCE))
		.find(|offer| policy.check(&offer.link, accepted_domains) == PolicyVerdict::Acceptable)
}

#[cfg(test)]
mod tests {
	use super::*;
	use quoter_policy::BlockedDomainSet;
	use serde_json::json;

	fn policy() -> DomainPolicy {
		DomainPolicy::new(BlockedDomainSet::with_defaults())
	}

	fn offer(price: i64, link: &str) -> StoreOffer {
		StoreOffer {
			name: "Loja".into(),
			link: link.into(),
			price: Decimal::from(price),
		}
	}

	#[test]
	fn tolerance_boundary() {
		let listing = Decimal::from(100);
		assert!(within_tolerance(Decimal::from(115), listing, 0.15));
		assert!(within_tolerance(Decimal::from(85), listing, 0.15));
		assert!(!within_tolerance(Decimal::from(116), listing, 0.15));
		assert!(!within_tolerance(Decimal::from(84), listing, 0.15));
	}

	#[test]
	fn first_acceptable_offer_wins() {
		let offers = vec![
			offer(200, "https://longe.com.br/p/1"),            // out of tolerance
			offer(101, "https://amazon.com.br/dp/2"),          // blocked
			offer(102, "https://loja.com.br/p/3"),             // winner
			offer(100, "https://outra.com.br/p/4"),
		];
		let selected = select_offer(
			offers,
			Decimal::from(100),
			&policy(),
			&HashSet::new(),
		)
		.unwrap();
		assert_eq!(selected.link, "https://loja.com.br/p/3");
	}

	#[test]
	fn parses_stores_and_online_sellers() {
		let raw = json!({
			"product_results": {
				"stores": [
					{ "name": "Loja A", "link": "https://a.com.br/p/1", "extracted_price": 99.9 },
				],
			},
			"sellers_results": {
				"online_sellers": [
					{ "name": "Loja B", "link": "https://b.com.br/p/2", "extracted_price": 101.0 },
					{ "name": "sem preco", "link": "https://c.com.br/p/3" },
				],
			},
		});
		let offers = parse_offers(&raw);
		assert_eq!(offers.len(), 2);
		assert_eq!(offers[0].name, "Loja A");
	}
}
