//! Tracking-parameter removal for store URLs.

use url::Url;

/// Query parameters stripped from every URL before fetch or persistence.
const TRACKING_PARAMS: &[&str] = &[
	"srsltid",
	"pf",
	"mc",
	"utm_source",
	"utm_medium",
	"utm_campaign",
	"utm_term",
	"utm_content",
	"gclid",
	"fbclid",
	"ref",
	"ref_",
	"_ga",
	"_gl",
	"dclid",
];

/// Removes tracking parameters from a URL.
///
/// The relative ordering of remaining parameters is preserved, and the
/// operation is idempotent. URLs that do not parse are returned unchanged;
/// the domain policy rejects them later.
pub fn clean_url(raw: &str) -> String {
	let mut url = match Url::parse(raw) {
		Ok(url) => url,
		Err(_) => return raw.to_string(),
	};

	let kept: Vec<(String, String)> = url
		.query_pairs()
		.filter(|(key, _)| !TRACKING_PARAMS.contains(&key.as_ref()))
		.map(|(k, v)| (k.into_owned(), v.into_owned()))
		.collect();

	if kept.is_empty() {
		url.set_query(None);
	} else {
		let mut serializer = url::form_urlencoded::Serializer::new(String::new());
		for (k, v) in &kept {
			serializer.append_pair(k, v);
		}
		url.set_query(Some(&serializer.finish()));
	}

	url.to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_tracking_parameters() {
		let cleaned = clean_url(
			"https://loja.com.br/p/42?utm_source=google&color=blue&gclid=XYZ&size=m",
		);
		assert_eq!(cleaned, "https://loja.com.br/p/42?color=blue&size=m");
	}

	#[test]
	fn preserves_parameter_ordering() {
		let cleaned = clean_url("https://loja.com.br/p?b=2&utm_medium=cpc&a=1&c=3");
		assert_eq!(cleaned, "https://loja.com.br/p?b=2&a=1&c=3");
	}

	#[test]
	fn drops_query_entirely_when_all_tracking() {
		let cleaned = clean_url("https://loja.com.br/p/42?srsltid=abc&fbclid=def");
		assert_eq!(cleaned, "https://loja.com.br/p/42");
	}

	#[test]
	fn is_idempotent() {
		let once = clean_url("https://loja.com.br/p?x=1&utm_campaign=promo&ref=home");
		let twice = clean_url(&once);
		assert_eq!(once, twice);
	}

	#[test]
	fn unparsable_urls_pass_through() {
		assert_eq!(clean_url("not a url"), "not a url");
	}
}
