//! URL hygiene and domain policy for the quotation pipeline.
//!
//! Two concerns live here: stripping tracking parameters from store URLs
//! before any fetch or persistence, and deciding whether a domain may
//! produce an observation at all. Every check is a pure in-memory test;
//! nothing in this crate performs network I/O.

pub mod cleaner;
pub mod domains;

pub use cleaner::clean_url;
pub use domains::{default_blocked_domains, BlockedDomain, BlockedDomainSet, DomainPolicy};

use quoter_types::FailureReason;
use std::collections::HashSet;

/// Outcome of the ordered policy checks for one URL.
///
/// The first failing check wins; the reason feeds straight into the
/// candidate's failure record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
	/// URL may proceed to acquisition.
	Acceptable,
	/// Rejected; carries the per-candidate failure reason.
	Rejected(FailureReason),
}

impl PolicyVerdict {
	/// Convenience accessor for the rejection reason, if any.
	pub fn rejection(&self) -> Option<FailureReason> {
		match self {
			PolicyVerdict::Acceptable => None,
			PolicyVerdict::Rejected(reason) => Some(*reason),
		}
	}
}

/// Hosts of comparison-shopping aggregators; their pages list other
/// stores' prices and never count as product pages.
const COMPARATOR_HOSTS: &[&str] = &["buscape.com.br", "zoom.com.br", "bondfaro.com.br"];

/// Global manufacturers with Brazilian storefronts on non-`.br` hosts.
const FOREIGN_ALLOWLIST: &[&str] = &[
	"dell.com",
	"lenovo.com",
	"samsung.com",
	"hp.com",
	"lg.com",
	"apple.com",
	"asus.com",
	"acer.com",
];

/// Path segments that identify search/category listings.
const LISTING_PATH_MARKERS: &[&str] = &["/busca/", "/search/", "/categoria/", "/colecao/"];

/// Extracts the host of a URL, lowercased.
pub fn host_of(url: &str) -> Option<String> {
	url::Url::parse(url)
		.ok()
		.and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// Suffix-based host match: `loja.dell.com` matches `dell.com`.
fn host_matches(host: &str, domain: &str) -> bool {
	host == domain || host.ends_with(&format!(".{}", domain))
}

impl DomainPolicy {
	/// Runs the ordered checks for one URL.
	///
	/// `accepted_domains` holds the hosts that already produced an accepted
	/// observation for the current request (at most one per domain).
	pub fn check(&self, url: &str, accepted_domains: &HashSet<String>) -> PolicyVerdict {
		let host = match host_of(url) {
			Some(host) => host,
			None => return PolicyVerdict::Rejected(FailureReason::Other),
		};

		if self.is_blocked(&host) {
			return PolicyVerdict::Rejected(FailureReason::BlockedDomain);
		}
		if Self::is_foreign(&host) {
			return PolicyVerdict::Rejected(FailureReason::ForeignDomain);
		}
		if Self::is_listing_url(url, &host) {
			return PolicyVerdict::Rejected(FailureReason::ListingUrl);
		}
		if accepted_domains.iter().any(|d| host_matches(&host, d)) {
			return PolicyVerdict::Rejected(FailureReason::DuplicateUrl);
		}

		PolicyVerdict::Acceptable
	}

	/// Membership test against the blocked-domain snapshot, suffix-based.
	pub fn is_blocked(&self, host: &str) -> bool {
		self.snapshot()
			.iter()
			.any(|blocked| host_matches(host, blocked))
	}

	/// Non-`.br` hosts are accepted only for allowlisted manufacturers.
	pub fn is_foreign(host: &str) -> bool {
		if host.ends_with(".br") {
			return false;
		}
		!FOREIGN_ALLOWLIST
			.iter()
			.any(|allowed| host_matches(host, allowed))
	}

	/// Search/category listings and comparator aggregators are not
	/// product pages.
	pub fn is_listing_url(url: &str, host: &str) -> bool {
		if COMPARATOR_HOSTS
			.iter()
			.any(|comparator| host_matches(host, comparator))
		{
			return true;
		}
		let parsed = match url::Url::parse(url) {
			Ok(parsed) => parsed,
			Err(_) => return false,
		};
		let path = parsed.path().to_ascii_lowercase();
		if LISTING_PATH_MARKERS.iter().any(|m| path.contains(m)) {
			return true;
		}
		parsed.query_pairs().any(|(k, _)| k == "q")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn policy() -> DomainPolicy {
		DomainPolicy::new(BlockedDomainSet::with_defaults())
	}

	#[test]
	fn blocked_domains_match_by_suffix() {
		let p = policy();
		assert!(p.is_blocked("mercadolivre.com.br"));
		assert!(p.is_blocked("produto.mercadolivre.com.br"));
		assert!(!p.is_blocked("naomercadolivre.com.br"));
	}

	#[test]
	fn foreign_hosts_need_allowlist() {
		assert!(!DomainPolicy::is_foreign("loja.com.br"));
		assert!(!DomainPolicy::is_foreign("www.dell.com"));
		assert!(DomainPolicy::is_foreign("bestbuy.com"));
	}

	#[test]
	fn listing_urls_are_rejected() {
		let p = policy();
		let verdict = p.check("https://loja.com.br/busca/notebook", &HashSet::new());
		assert_eq!(
			verdict,
			PolicyVerdict::Rejected(FailureReason::ListingUrl)
		);
		let verdict = p.check("https://loja.com.br/produtos?q=notebook", &HashSet::new());
		assert_eq!(
			verdict,
			PolicyVerdict::Rejected(FailureReason::ListingUrl)
		);
		let verdict = p.check("https://www.zoom.com.br/notebook/p/123", &HashSet::new());
		assert_eq!(
			verdict,
			PolicyVerdict::Rejected(FailureReason::ListingUrl)
		);
	}

	#[test]
	fn duplicate_domains_are_rejected() {
		let p = policy();
		let mut accepted = HashSet::new();
		accepted.insert("loja.com.br".to_string());
		let verdict = p.check("https://loja.com.br/produto/42", &accepted);
		assert_eq!(
			verdict,
			PolicyVerdict::Rejected(FailureReason::DuplicateUrl)
		);
	}

	#[test]
	fn ordered_checks_first_reason_wins() {
		let p = policy();
		let mut accepted = HashSet::new();
		accepted.insert("amazon.com.br".to_string());
		// Blocked outranks duplicate
		let verdict = p.check("https://amazon.com.br/busca/item?q=x", &accepted);
		assert_eq!(
			verdict,
			PolicyVerdict::Rejected(FailureReason::BlockedDomain)
		);
	}

	#[test]
	fn acceptable_product_url_passes() {
		let p = policy();
		let verdict = p.check(
			"https://www.lojadoatacado.com.br/notebook-dell-15",
			&HashSet::new(),
		);
		assert_eq!(verdict, PolicyVerdict::Acceptable);
	}
}
