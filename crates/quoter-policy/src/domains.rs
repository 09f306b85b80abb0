//! Blocked-domain authority.
//!
//! The blocked set is read on every candidate and edited rarely, from the
//! admin surface. Readers take a lock-free snapshot through `ArcSwap`; a
//! single refresh task replaces the snapshot from storage within a bounded
//! interval, so admin edits become visible to all workers without restarts.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// One administratively-managed blocked domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedDomain {
	/// Host suffix to block, e.g. `mercadolivre.com.br`.
	pub domain: String,
	/// Human-readable store name.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub display_name: Option<String>,
	/// Why the domain is blocked.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
	/// Timestamp the entry was created.
	pub created_at: DateTime<Utc>,
}

/// Marketplaces and large retailers known for strong anti-bot protection.
///
/// This is the seed set; storage-backed admin edits extend or shrink it at
/// runtime.
pub fn default_blocked_domains() -> Vec<BlockedDomain> {
	const SEED: &[(&str, &str, &str)] = &[
		("mercadolivre.com.br", "Mercado Livre", "Proteção anti-bot forte"),
		("mercadoshops.com.br", "Mercado Shops", "Proteção anti-bot forte"),
		("amazon.com.br", "Amazon Brasil", "Proteção anti-bot forte"),
		("amazon.com", "Amazon", "Proteção anti-bot forte"),
		("aliexpress.com", "AliExpress", "Proteção anti-bot forte"),
		("aliexpress.com.br", "AliExpress Brasil", "Proteção anti-bot forte"),
		("shopee.com.br", "Shopee", "Proteção anti-bot forte"),
		("shein.com", "Shein", "Proteção anti-bot forte"),
		("shein.com.br", "Shein Brasil", "Proteção anti-bot forte"),
		("wish.com", "Wish", "Proteção anti-bot forte"),
		("temu.com", "Temu", "Proteção anti-bot forte"),
		("carrefour.com.br", "Carrefour", "Cloudflare/proteção anti-bot"),
		("casasbahia.com.br", "Casas Bahia", "Cloudflare/proteção anti-bot"),
		("pontofrio.com.br", "Ponto Frio", "Cloudflare/proteção anti-bot"),
		("extra.com.br", "Extra", "Cloudflare/proteção anti-bot"),
		("magazineluiza.com.br", "Magazine Luiza", "Cloudflare/proteção anti-bot"),
		("magalu.com.br", "Magalu", "Cloudflare/proteção anti-bot"),
		("americanas.com.br", "Americanas", "Cloudflare/proteção anti-bot"),
		("submarino.com.br", "Submarino", "Cloudflare/proteção anti-bot"),
		("shoptime.com.br", "Shoptime", "Cloudflare/proteção anti-bot"),
	];

	SEED.iter()
		.map(|(domain, name, reason)| BlockedDomain {
			domain: domain.to_string(),
			display_name: Some(name.to_string()),
			reason: Some(reason.to_string()),
			created_at: Utc::now(),
		})
		.collect()
}

/// Process-wide snapshot of the blocked-domain set.
#[derive(Debug)]
pub struct BlockedDomainSet {
	snapshot: ArcSwap<HashSet<String>>,
}

impl BlockedDomainSet {
	/// Creates an empty set.
	pub fn new() -> Self {
		Self {
			snapshot: ArcSwap::from_pointee(HashSet::new()),
		}
	}

	/// Creates a set seeded with the default blocked domains.
	pub fn with_defaults() -> Self {
		let set = Self::new();
		set.replace(
			default_blocked_domains()
				.into_iter()
				.map(|d| d.domain)
				.collect(),
		);
		set
	}

	/// Atomically replaces the snapshot. Called by the refresh authority.
	pub fn replace(&self, domains: HashSet<String>) {
		tracing::debug!(count = domains.len(), "Refreshed blocked-domain snapshot");
		self.snapshot.store(Arc::new(domains));
	}

	/// Takes the current snapshot.
	pub fn load(&self) -> Arc<HashSet<String>> {
		self.snapshot.load_full()
	}
}

impl Default for BlockedDomainSet {
	fn default() -> Self {
		Self::new()
	}
}

/// Domain admission policy over a shared blocked-domain set.
#[derive(Debug)]
pub struct DomainPolicy {
	blocked: Arc<BlockedDomainSet>,
}

impl DomainPolicy {
	/// Creates a policy over the given blocked set.
	pub fn new(blocked: BlockedDomainSet) -> Self {
		Self {
			blocked: Arc::new(blocked),
		}
	}

	/// Creates a policy sharing an existing blocked set.
	pub fn shared(blocked: Arc<BlockedDomainSet>) -> Self {
		Self { blocked }
	}

	/// Current blocked-domain snapshot.
	pub fn snapshot(&self) -> Arc<HashSet<String>> {
		self.blocked.load()
	}

	/// Handle on the underlying set, for the refresh authority.
	pub fn blocked_set(&self) -> Arc<BlockedDomainSet> {
		self.blocked.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn refresh_replaces_snapshot_for_all_readers() {
		let set = Arc::new(BlockedDomainSet::with_defaults());
		let policy = DomainPolicy::shared(set.clone());
		assert!(policy.is_blocked("amazon.com.br"));

		set.replace(["lojabloqueada.com.br".to_string()].into_iter().collect());
		assert!(!policy.is_blocked("amazon.com.br"));
		assert!(policy.is_blocked("lojabloqueada.com.br"));
	}
}
