//! Registry trait for self-registering implementations.
//!
//! Each pluggable module (storage backends, search providers, render
//! engines) provides a `Registry` struct implementing this trait so the
//! service binary can wire implementations by their configuration name.

/// Base trait for implementation registries.
///
/// Implementations declare the name used to reference them in the TOML
/// configuration and a factory function that builds them from their raw
/// configuration block.
pub trait ImplementationRegistry {
	/// The name used in configuration files to reference this implementation.
	///
	/// This should match the key used in the TOML configuration, for example:
	/// - "serpapi" for search.implementations.serpapi
	/// - "memory" for storage.implementations.memory
	const NAME: &'static str;

	/// The factory function type this implementation provides.
	type Factory;

	/// Get the factory function for this implementation.
	fn factory() -> Self::Factory;
}
