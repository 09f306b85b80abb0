//! Layered price extraction over a rendered page snapshot.
//!
//! Strategies are tried in order of reliability: structured data, price
//! meta tags, DOM heuristics, and finally raw body-text patterns. The
//! first strategy that yields a plausible BRL value wins and its method is
//! recorded on the observation.

use crate::RenderedPage;
use quoter_types::ExtractionMethod;
use regex::Regex;
use rust_decimal::Decimal;
use scraper::{Html, Selector};
use std::sync::OnceLock;

/// Extracts a price from the page, returning the winning strategy.
pub fn extract_price(page: &RenderedPage) -> Option<(Decimal, ExtractionMethod)> {
	let document = Html::parse_document(&page.html);

	if let Some(price) = try_jsonld(&document) {
		return Some((price, ExtractionMethod::Jsonld));
	}
	if let Some(price) = try_meta_tags(&document) {
		return Some((price, ExtractionMethod::Meta));
	}
	if let Some(price) = try_dom_heuristics(&document) {
		return Some((price, ExtractionMethod::Dom));
	}
	find_price_in_text(&page.body_text).map(|price| (price, ExtractionMethod::Dom))
}

fn selector(css: &str) -> Option<Selector> {
	Selector::parse(css).ok()
}

/// Structured-data pass: first `Product` object with a BRL offer wins.
fn try_jsonld(document: &Html) -> Option<Decimal> {
	let script_sel = selector(r#"script[type="application/ld+json"]"#)?;
	for script in document.select(&script_sel) {
		let content = script.text().collect::<String>();
		let Ok(data) = serde_json::from_str::<serde_json::Value>(&content) else {
			continue;
		};
		let items: Vec<&serde_json::Value> = match &data {
			serde_json::Value::Array(list) => list.iter().collect(),
			other => vec![other],
		};
		for item in items {
			if item.get("@type").and_then(|t| t.as_str()) != Some("Product") {
				continue;
			}
			let Some(offers) = item.get("offers") else {
				continue;
			};
			// Sites emit offers as an object or a one-element array
			let offer = match offers {
				serde_json::Value::Array(list) => list.first(),
				other => Some(other),
			}?;
			let currency = offer
				.get("priceCurrency")
				.and_then(|c| c.as_str())
				.unwrap_or("BRL");
			if currency != "BRL" {
				continue;
			}
			let price_text = match offer.get("price") {
				Some(serde_json::Value::String(s)) => s.clone(),
				Some(serde_json::Value::Number(n)) => n.to_string(),
				_ => continue,
			};
			if let Some(price) = parse_price(&price_text) {
				return Some(price);
			}
		}
	}
	None
}

/// Meta-tag pass: reliable price metas first, then card data guarded by
/// its label so SKUs are not read as prices.
fn try_meta_tags(document: &Html) -> Option<Decimal> {
	for css in [
		r#"meta[property="product:price:amount"]"#,
		r#"meta[property="og:price:amount"]"#,
	] {
		let Some(sel) = selector(css) else {
			continue;
		};
		if let Some(meta) = document.select(&sel).next() {
			if let Some(price) = meta.value().attr("content").and_then(parse_price) {
				return Some(price);
			}
		}
	}

	// twitter:data1 only counts when twitter:label1 names a price
	let label_sel = selector(r#"meta[name="twitter:label1"]"#)?;
	let label = document
		.select(&label_sel)
		.next()
		.and_then(|m| m.value().attr("content"))?
		.to_ascii_lowercase();
	if !["preço", "preco", "price", "valor"]
		.iter()
		.any(|marker| label.contains(marker))
	{
		return None;
	}
	let data_sel = selector(r#"meta[name="twitter:data1"]"#)?;
	document
		.select(&data_sel)
		.next()
		.and_then(|m| m.value().attr("content"))
		.and_then(parse_price)
}

/// DOM pass: known price-bearing selectors, first plausible value wins.
fn try_dom_heuristics(document: &Html) -> Option<Decimal> {
	const PRICE_SELECTORS: &[&str] = &[
		r#"[data-testid*="price"]"#,
		r#"[class*="price"]"#,
		r#"[id*="price"]"#,
		".price-tag",
		".product-price",
		".sale-price",
		r#"span[itemprop="price"]"#,
	];

	for css in PRICE_SELECTORS {
		let Some(sel) = selector(css) else {
			continue;
		};
		for element in document.select(&sel) {
			let text = element.text().collect::<String>();
			if !(text.contains("R$") || text.contains(',') || text.contains('.')) {
				continue;
			}
			if let Some(price) = parse_price(&text) {
				return Some(price);
			}
		}
	}
	None
}

/// Parses a Brazilian-formatted price out of free text.
///
/// Strips everything but digits and separators, then decides which
/// separator is the decimal mark: when both appear, the right-most one
/// wins; a single comma with two trailing digits is decimal; any other
/// comma is a thousands separator. Values of 1 or less are never prices.
pub fn parse_price(text: &str) -> Option<Decimal> {
	let cleaned: String = text
		.chars()
		.filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
		.collect();
	if cleaned.is_empty() {
		return None;
	}

	let has_comma = cleaned.contains(',');
	let has_dot = cleaned.contains('.');
	let normalized = if has_comma && has_dot {
		if cleaned.rfind(',') > cleaned.rfind('.') {
			cleaned.replace('.', "").replace(',', ".")
		} else {
			cleaned.replace(',', "")
		}
	} else if has_comma {
		let parts: Vec<&str> = cleaned.split(',').collect();
		if parts.len() == 2 && parts[1].len() == 2 {
			cleaned.replace(',', ".")
		} else {
			cleaned.replace(',', "")
		}
	} else {
		cleaned
	};

	normalized
		.parse::<Decimal>()
		.ok()
		.filter(|price| *price > Decimal::ONE)
}

fn body_patterns() -> &'static Vec<Regex> {
	static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
	PATTERNS.get_or_init(|| {
		[
			r"R\$\s*(\d{1,3}(?:\.\d{3})*,\d{2})",
			r"R\$\s*(\d+,\d{2})",
			r"(\d{1,3}(?:\.\d{3})*,\d{2})",
		]
		.iter()
		.filter_map(|p| Regex::new(p).ok())
		.collect()
	})
}

/// Body-text pass: ordered patterns, tightest first.
pub fn find_price_in_text(text: &str) -> Option<Decimal> {
	for pattern in body_patterns() {
		for capture in pattern.captures_iter(text) {
			if let Some(price) = capture.get(1).and_then(|m| parse_price(m.as_str())) {
				return Some(price);
			}
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	fn page(html: &str, body_text: &str) -> RenderedPage {
		RenderedPage {
			url: "https://loja.com.br/p/1".into(),
			title: Some("Produto".into()),
			html: html.into(),
			body_text: body_text.into(),
		}
	}

	fn dec(s: &str) -> Decimal {
		s.parse().unwrap()
	}

	#[test]
	fn parse_price_brl_formats() {
		assert_eq!(parse_price("R$ 1.234,56"), Some(dec("1234.56")));
		assert_eq!(parse_price("1,234.56"), Some(dec("1234.56")));
		assert_eq!(parse_price("R$ 12,34"), Some(dec("12.34")));
		assert_eq!(parse_price("1.234"), Some(dec("1234")));
		assert_eq!(parse_price("12,345"), Some(dec("12345")));
		assert_eq!(parse_price("2499"), Some(dec("2499")));
		assert_eq!(parse_price(""), None);
		assert_eq!(parse_price("abc"), None);
		// Values of 1 or less are never prices
		assert_eq!(parse_price("0,99"), None);
		assert_eq!(parse_price("1"), None);
	}

	#[test]
	fn parse_price_is_deterministic_for_formatted_values() {
		for (formatted, expected) in [
			("R$ 3.599,90", "3599.90"),
			("R$ 89,90", "89.90"),
			("R$ 125.000,00", "125000.00"),
		] {
			assert_eq!(parse_price(formatted), Some(dec(expected)));
		}
	}

	#[test]
	fn jsonld_wins_over_everything() {
		let html = r#"
			<html><head>
			<script type="application/ld+json">
			{"@type":"Product","offers":{"price":"2599.90","priceCurrency":"BRL"}}
			</script>
			<meta property="product:price:amount" content="9999.99">
			</head><body></body></html>
		"#;
		let result = extract_price(&page(html, "")).unwrap();
		assert_eq!(result, (dec("2599.90"), ExtractionMethod::Jsonld));
	}

	#[test]
	fn jsonld_first_product_wins_and_non_brl_skipped() {
		let html = r#"
			<html><head>
			<script type="application/ld+json">
			[{"@type":"Product","offers":{"price":"100.00","priceCurrency":"USD"}},
			 {"@type":"Product","offers":{"price":"550.00","priceCurrency":"BRL"}},
			 {"@type":"Product","offers":{"price":"660.00","priceCurrency":"BRL"}}]
			</script>
			</head><body></body></html>
		"#;
		let result = extract_price(&page(html, "")).unwrap();
		assert_eq!(result.0, dec("550.00"));
	}

	#[test]
	fn meta_tags_when_no_jsonld() {
		let html = r#"
			<html><head>
			<meta property="og:price:amount" content="349,90">
			</head><body></body></html>
		"#;
		let result = extract_price(&page(html, "")).unwrap();
		assert_eq!(result, (dec("349.90"), ExtractionMethod::Meta));
	}

	#[test]
	fn twitter_data_needs_price_label() {
		// SKU-like card data must not be read as a price
		let sku = r#"
			<html><head>
			<meta name="twitter:label1" content="SKU">
			<meta name="twitter:data1" content="MEL-327-P">
			</head><body></body></html>
		"#;
		assert!(extract_price(&page(sku, "")).is_none());

		let priced = r#"
			<html><head>
			<meta name="twitter:label1" content="Preço">
			<meta name="twitter:data1" content="R$ 327,00">
			</head><body></body></html>
		"#;
		let result = extract_price(&page(priced, "")).unwrap();
		assert_eq!(result, (dec("327.00"), ExtractionMethod::Meta));
	}

	#[test]
	fn dom_heuristics_when_no_structured_data() {
		let html = r#"
			<html><body>
			<span class="product-price">R$ 1.899,00</span>
			</body></html>
		"#;
		let result = extract_price(&page(html, "")).unwrap();
		assert_eq!(result, (dec("1899.00"), ExtractionMethod::Dom));
	}

	#[test]
	fn body_text_is_the_last_resort() {
		let html = "<html><body><p>oferta</p></body></html>";
		let body = "Aproveite por apenas R$ 459,90 à vista";
		let result = extract_price(&page(html, body)).unwrap();
		assert_eq!(result, (dec("459.90"), ExtractionMethod::Dom));
	}

	#[test]
	fn nothing_found_returns_none() {
		let html = "<html><body>sem oferta</body></html>";
		assert!(extract_price(&page(html, "sem oferta")).is_none());
	}
}
