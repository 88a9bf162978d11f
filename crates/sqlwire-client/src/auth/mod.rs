//! Authentication plugins.
//!
//! Each mechanism is an [`AuthPlugin`]: a small state machine fed with the
//! server's latest auth payload that answers with zero or more payloads to
//! send back. The built-in mechanisms are variants of [`BuiltinPlugin`];
//! anything else is registered by protocol name in a [`PluginRegistry`]
//! carried by the [`ClientConfig`](crate::config::ClientConfig).
//!
//! Shared exchange state (seed, password, TLS flag, RSA key cache) lives in
//! [`AuthExchange`] so a plugin switch keeps what earlier plugins learned.

mod builtin;
pub mod scramble;

pub use builtin::{BuiltinPlugin, CachingSha2Stage, Sha256Stage};

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use sqlwire_core::{AuthError, AuthErrorKind, Result};

/// Well-known authentication plugin names.
pub mod plugins {
    /// SHA1-based authentication
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    /// SHA256 fast path with RSA full authentication
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    /// RSA-based SHA256 authentication
    pub const SHA256_PASSWORD: &str = "sha256_password";
    /// Clear text password, TLS only
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Single-byte codes of the cached-RSA exchange.
pub mod caching_sha2 {
    /// Client asks for the server's public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Fast auth success
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Full auth needed (secure channel or RSA)
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// Single-byte codes of the sha256 RSA exchange.
pub mod sha256 {
    /// Client asks for the server's public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x01;
}

/// One authentication mechanism.
pub trait AuthPlugin: Send + fmt::Debug {
    /// Name the server uses for this mechanism.
    fn protocol_name(&self) -> &str;

    /// Plugins that put the password on the wire in clear text refuse to run
    /// over an insecure channel.
    fn requires_confidentiality(&self) -> bool {
        false
    }

    /// Plugins that cannot authenticate without TLS or an RSA public key.
    fn requires_rsa(&self) -> bool {
        false
    }

    /// Return to the initial stage, e.g. after an auth switch.
    fn reset(&mut self);

    /// Consume one server payload and produce the payloads to send back.
    ///
    /// The first call receives the scramble seed; later calls receive the
    /// body of each `AUTH_MORE_DATA` frame. An empty result means "wait for
    /// the next server frame".
    fn next_step(&mut self, exchange: &mut AuthExchange, server_data: &[u8])
    -> Result<Vec<Vec<u8>>>;
}

/// State shared by the plugins of one handshake.
pub struct AuthExchange {
    seed: Vec<u8>,
    password: Option<String>,
    suppressed: bool,
    secure: bool,
    public_key: Option<String>,
    allow_public_key_retrieval: bool,
}

impl AuthExchange {
    pub fn new(seed: impl Into<Vec<u8>>, password: Option<String>, secure: bool) -> Self {
        Self {
            seed: seed.into(),
            password,
            suppressed: false,
            secure,
            public_key: None,
            allow_public_key_retrieval: false,
        }
    }

    /// Seed the RSA key cache, from a local file or an earlier exchange.
    pub fn with_public_key(mut self, pem: Option<String>) -> Self {
        self.public_key = pem;
        self
    }

    pub fn with_public_key_retrieval(mut self, allow: bool) -> Self {
        self.allow_public_key_retrieval = allow;
        self
    }

    pub fn seed(&self) -> &[u8] {
        &self.seed
    }

    /// Replace the seed, as an auth switch does.
    pub fn set_seed(&mut self, seed: &[u8]) {
        self.seed.clear();
        self.seed.extend_from_slice(seed);
    }

    /// The password to use, `None` when absent or suppressed.
    pub fn password(&self) -> Option<&str> {
        if self.suppressed {
            None
        } else {
            self.password.as_deref()
        }
    }

    /// Send no credential until the next auth switch.
    pub fn suppress_password(&mut self) {
        self.suppressed = true;
    }

    pub fn restore_password(&mut self) {
        self.suppressed = false;
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    pub fn cache_public_key(&mut self, pem: String) {
        self.public_key = Some(pem);
    }

    /// Hand the key cache back to the session.
    pub fn take_public_key(&mut self) -> Option<String> {
        self.public_key.take()
    }

    pub fn allows_public_key_retrieval(&self) -> bool {
        self.allow_public_key_retrieval
    }
}

impl fmt::Debug for AuthExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthExchange")
            .field("seed_len", &self.seed.len())
            .field("has_password", &self.password.is_some())
            .field("suppressed", &self.suppressed)
            .field("secure", &self.secure)
            .field("has_public_key", &self.public_key.is_some())
            .field("allow_public_key_retrieval", &self.allow_public_key_retrieval)
            .finish()
    }
}

/// Constructor for a registered plugin.
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn AuthPlugin> + Send + Sync>;

/// Extension plugins keyed by protocol name.
///
/// A registered name shadows the built-in plugin of the same name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    extensions: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin constructor under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn AuthPlugin> + Send + Sync + 'static,
    {
        self.extensions.insert(name.into(), Arc::new(factory));
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_plugin<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn AuthPlugin> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.extensions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Instantiate the plugin for `name`, extensions first.
    pub fn resolve(&self, name: &str, disabled: &BTreeSet<String>) -> Result<Box<dyn AuthPlugin>> {
        if disabled.contains(name) {
            return Err(AuthError::new(
                AuthErrorKind::UnknownPlugin,
                format!("authentication plugin '{name}' is disabled"),
            )
            .with_plugin(name)
            .into());
        }
        if let Some(factory) = self.extensions.get(name) {
            return Ok(factory());
        }
        BuiltinPlugin::from_name(name)
            .map(|plugin| Box::new(plugin) as Box<dyn AuthPlugin>)
            .ok_or_else(|| {
                AuthError::new(
                    AuthErrorKind::UnknownPlugin,
                    format!("no authentication plugin named '{name}'"),
                )
                .with_plugin(name)
                .into()
            })
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.extensions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("PluginRegistry")
            .field("extensions", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Echo;

    impl AuthPlugin for Echo {
        fn protocol_name(&self) -> &str {
            "echo"
        }

        fn reset(&mut self) {}

        fn next_step(
            &mut self,
            _exchange: &mut AuthExchange,
            server_data: &[u8],
        ) -> Result<Vec<Vec<u8>>> {
            Ok(vec![server_data.to_vec()])
        }
    }

    #[test]
    fn test_plugin_names() {
        assert_eq!(plugins::MYSQL_NATIVE_PASSWORD, "mysql_native_password");
        assert_eq!(plugins::CACHING_SHA2_PASSWORD, "caching_sha2_password");
        assert_eq!(plugins::SHA256_PASSWORD, "sha256_password");
        assert_eq!(plugins::MYSQL_CLEAR_PASSWORD, "mysql_clear_password");
    }

    #[test]
    fn test_resolve_builtin() {
        let registry = PluginRegistry::new();
        let plugin = registry
            .resolve(plugins::CACHING_SHA2_PASSWORD, &BTreeSet::new())
            .unwrap();
        assert_eq!(plugin.protocol_name(), plugins::CACHING_SHA2_PASSWORD);
    }

    #[test]
    fn test_resolve_extension() {
        let registry = PluginRegistry::new().with_plugin("echo", || Box::new(Echo));
        assert!(registry.contains("echo"));
        let mut plugin = registry.resolve("echo", &BTreeSet::new()).unwrap();
        let mut exchange = AuthExchange::new(vec![1, 2], None, false);
        assert_eq!(plugin.next_step(&mut exchange, b"hi").unwrap(), vec![b"hi".to_vec()]);
    }

    #[test]
    fn test_extension_shadows_builtin() {
        let registry =
            PluginRegistry::new().with_plugin(plugins::MYSQL_NATIVE_PASSWORD, || Box::new(Echo));
        let plugin = registry
            .resolve(plugins::MYSQL_NATIVE_PASSWORD, &BTreeSet::new())
            .unwrap();
        assert_eq!(plugin.protocol_name(), "echo");
    }

    #[test]
    fn test_resolve_unknown_and_disabled() {
        let registry = PluginRegistry::new();
        let err = registry.resolve("kerberos", &BTreeSet::new()).unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthErrorKind::UnknownPlugin));

        let disabled: BTreeSet<String> = [plugins::MYSQL_CLEAR_PASSWORD.to_string()].into();
        let err = registry
            .resolve(plugins::MYSQL_CLEAR_PASSWORD, &disabled)
            .unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthErrorKind::UnknownPlugin));
    }

    #[test]
    fn test_exchange_password_suppression() {
        let mut exchange = AuthExchange::new(vec![0; 20], Some("pw".into()), false);
        assert_eq!(exchange.password(), Some("pw"));
        exchange.suppress_password();
        assert_eq!(exchange.password(), None);
        exchange.restore_password();
        assert_eq!(exchange.password(), Some("pw"));
    }

    #[test]
    fn test_exchange_debug_hides_secrets() {
        let exchange = AuthExchange::new(vec![0; 20], Some("topsecret".into()), false);
        assert!(!format!("{exchange:?}").contains("topsecret"));
    }

    #[test]
    fn test_registry_debug_lists_names() {
        let registry = PluginRegistry::new().with_plugin("echo", || Box::new(Echo));
        assert_eq!(
            format!("{registry:?}"),
            "PluginRegistry { extensions: [\"echo\"] }"
        );
    }
}
