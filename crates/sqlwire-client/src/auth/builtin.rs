//! The built-in mechanisms.

use sqlwire_core::{AuthError, AuthErrorKind, Error, ProtocolError, Result};

use super::scramble::{
    caching_sha2_password, native_password, rsa_encrypt_password, trim_seed,
};
use super::{AuthExchange, AuthPlugin, caching_sha2, plugins, sha256};

/// Progress of a `sha256_password` exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sha256Stage {
    #[default]
    Initial,
    AwaitingPublicKey,
    Finished,
}

/// Progress of a `caching_sha2_password` exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachingSha2Stage {
    #[default]
    Initial,
    AwaitingResult,
    AwaitingPublicKey,
    Finished,
}

/// Closed set of mechanisms shipped with the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinPlugin {
    NativePassword,
    ClearPassword,
    Sha256Password(Sha256Stage),
    CachingSha2Password(CachingSha2Stage),
}

impl BuiltinPlugin {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            plugins::MYSQL_NATIVE_PASSWORD => Some(Self::NativePassword),
            plugins::MYSQL_CLEAR_PASSWORD => Some(Self::ClearPassword),
            plugins::SHA256_PASSWORD => Some(Self::Sha256Password(Sha256Stage::Initial)),
            plugins::CACHING_SHA2_PASSWORD => {
                Some(Self::CachingSha2Password(CachingSha2Stage::Initial))
            }
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::NativePassword => plugins::MYSQL_NATIVE_PASSWORD,
            Self::ClearPassword => plugins::MYSQL_CLEAR_PASSWORD,
            Self::Sha256Password(_) => plugins::SHA256_PASSWORD,
            Self::CachingSha2Password(_) => plugins::CACHING_SHA2_PASSWORD,
        }
    }

    fn sha256_step(
        stage: &mut Sha256Stage,
        exchange: &mut AuthExchange,
        server_data: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        match *stage {
            Sha256Stage::Initial => {
                let password = exchange.password().unwrap_or_default();
                if password.is_empty() {
                    *stage = Sha256Stage::Finished;
                    return Ok(vec![vec![0]]);
                }
                if exchange.is_secure() {
                    *stage = Sha256Stage::Finished;
                    return Ok(vec![clear_text(password)]);
                }
                if let Some(pem) = exchange.public_key() {
                    let payload = rsa_encrypt_password(password, exchange.seed(), pem)?;
                    *stage = Sha256Stage::Finished;
                    return Ok(vec![payload]);
                }
                if exchange.allows_public_key_retrieval() {
                    tracing::debug!(
                        plugin = plugins::SHA256_PASSWORD,
                        "Requesting server public key"
                    );
                    *stage = Sha256Stage::AwaitingPublicKey;
                    return Ok(vec![vec![sha256::REQUEST_PUBLIC_KEY]]);
                }
                Err(public_key_unavailable(plugins::SHA256_PASSWORD))
            }
            Sha256Stage::AwaitingPublicKey => {
                let payload = encrypt_with_server_key(exchange, server_data)?;
                *stage = Sha256Stage::Finished;
                Ok(vec![payload])
            }
            Sha256Stage::Finished => Err(unexpected_data(plugins::SHA256_PASSWORD)),
        }
    }

    fn caching_sha2_step(
        stage: &mut CachingSha2Stage,
        exchange: &mut AuthExchange,
        server_data: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        match *stage {
            CachingSha2Stage::Initial => {
                let password = exchange.password().unwrap_or_default();
                let scramble = caching_sha2_password(password, exchange.seed());
                *stage = CachingSha2Stage::AwaitingResult;
                Ok(vec![scramble])
            }
            CachingSha2Stage::AwaitingResult => match server_data.first().copied() {
                Some(caching_sha2::FAST_AUTH_SUCCESS) => {
                    tracing::debug!(
                        plugin = plugins::CACHING_SHA2_PASSWORD,
                        "Fast auth succeeded"
                    );
                    *stage = CachingSha2Stage::Finished;
                    Ok(Vec::new())
                }
                Some(caching_sha2::PERFORM_FULL_AUTH) => {
                    tracing::debug!(
                        plugin = plugins::CACHING_SHA2_PASSWORD,
                        "Full auth required"
                    );
                    let password = exchange.password().unwrap_or_default();
                    if password.is_empty() {
                        *stage = CachingSha2Stage::Finished;
                        return Ok(vec![vec![0]]);
                    }
                    if exchange.is_secure() {
                        *stage = CachingSha2Stage::Finished;
                        return Ok(vec![clear_text(password)]);
                    }
                    if let Some(pem) = exchange.public_key() {
                        let payload = rsa_encrypt_password(password, exchange.seed(), pem)?;
                        *stage = CachingSha2Stage::Finished;
                        return Ok(vec![payload]);
                    }
                    if exchange.allows_public_key_retrieval() {
                        tracing::debug!(
                            plugin = plugins::CACHING_SHA2_PASSWORD,
                            "Requesting server public key"
                        );
                        *stage = CachingSha2Stage::AwaitingPublicKey;
                        return Ok(vec![vec![caching_sha2::REQUEST_PUBLIC_KEY]]);
                    }
                    Err(public_key_unavailable(plugins::CACHING_SHA2_PASSWORD))
                }
                other => Err(Error::Protocol(ProtocolError::new(format!(
                    "unexpected caching_sha2_password result code {other:?}"
                )))),
            },
            CachingSha2Stage::AwaitingPublicKey => {
                let payload = encrypt_with_server_key(exchange, server_data)?;
                *stage = CachingSha2Stage::Finished;
                Ok(vec![payload])
            }
            CachingSha2Stage::Finished => Err(unexpected_data(plugins::CACHING_SHA2_PASSWORD)),
        }
    }
}

impl AuthPlugin for BuiltinPlugin {
    fn protocol_name(&self) -> &str {
        self.name()
    }

    fn requires_confidentiality(&self) -> bool {
        matches!(self, Self::ClearPassword)
    }

    fn requires_rsa(&self) -> bool {
        matches!(self, Self::Sha256Password(_))
    }

    fn reset(&mut self) {
        match self {
            Self::NativePassword | Self::ClearPassword => {}
            Self::Sha256Password(stage) => *stage = Sha256Stage::Initial,
            Self::CachingSha2Password(stage) => *stage = CachingSha2Stage::Initial,
        }
    }

    fn next_step(
        &mut self,
        exchange: &mut AuthExchange,
        server_data: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        match self {
            Self::NativePassword => {
                let seed = if server_data.is_empty() {
                    exchange.seed()
                } else {
                    trim_seed(server_data)
                };
                let password = exchange.password().unwrap_or_default();
                Ok(vec![native_password(password, seed)])
            }
            Self::ClearPassword => {
                let password = exchange.password().unwrap_or_default();
                Ok(vec![clear_text(password)])
            }
            Self::Sha256Password(stage) => Self::sha256_step(stage, exchange, server_data),
            Self::CachingSha2Password(stage) => {
                Self::caching_sha2_step(stage, exchange, server_data)
            }
        }
    }
}

fn clear_text(password: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(password.len() + 1);
    bytes.extend_from_slice(password.as_bytes());
    bytes.push(0);
    bytes
}

/// Cache the PEM the server just sent and encrypt the password with it.
fn encrypt_with_server_key(exchange: &mut AuthExchange, server_data: &[u8]) -> Result<Vec<u8>> {
    let pem = String::from_utf8(server_data.to_vec()).map_err(|e| {
        Error::Auth(AuthError::new(
            AuthErrorKind::Crypto,
            format!("server public key is not valid UTF-8 PEM: {e}"),
        ))
    })?;
    let password = exchange.password().unwrap_or_default();
    let payload = rsa_encrypt_password(password, exchange.seed(), &pem)?;
    exchange.cache_public_key(pem);
    Ok(payload)
}

fn public_key_unavailable(plugin: &str) -> Error {
    AuthError::new(
        AuthErrorKind::PublicKeyUnavailable,
        "no RSA public key configured and public key retrieval is not allowed",
    )
    .with_plugin(plugin)
    .into()
}

fn unexpected_data(plugin: &str) -> Error {
    Error::Protocol(ProtocolError::new(format!(
        "{plugin} received more data after completing"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::{Oaep, RsaPrivateKey};
    use sha1::Sha1;

    const SEED: [u8; 20] = [7; 20];

    fn exchange(password: &str, secure: bool) -> AuthExchange {
        AuthExchange::new(SEED.to_vec(), Some(password.to_string()), secure)
    }

    fn unmask(private: &RsaPrivateKey, payload: &[u8]) -> Vec<u8> {
        private
            .decrypt(Oaep::new::<Sha1>(), payload)
            .unwrap()
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ SEED[i % SEED.len()])
            .collect()
    }

    #[test]
    fn test_from_name_round_trip() {
        for name in [
            plugins::MYSQL_NATIVE_PASSWORD,
            plugins::MYSQL_CLEAR_PASSWORD,
            plugins::SHA256_PASSWORD,
            plugins::CACHING_SHA2_PASSWORD,
        ] {
            assert_eq!(BuiltinPlugin::from_name(name).unwrap().name(), name);
        }
        assert!(BuiltinPlugin::from_name("dialog").is_none());
    }

    #[test]
    fn test_native_single_response() {
        let mut plugin = BuiltinPlugin::NativePassword;
        let mut ex = exchange("secret", false);
        let out = plugin.next_step(&mut ex, &SEED).unwrap();
        assert_eq!(out, vec![native_password("secret", &SEED)]);
    }

    #[test]
    fn test_native_suppressed_password_sends_empty_response() {
        let mut plugin = BuiltinPlugin::NativePassword;
        let mut ex = exchange("secret", false);
        ex.suppress_password();
        assert_eq!(plugin.next_step(&mut ex, &SEED).unwrap(), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_clear_password_flags() {
        let mut plugin = BuiltinPlugin::ClearPassword;
        assert!(plugin.requires_confidentiality());
        let mut ex = exchange("pw", true);
        assert_eq!(plugin.next_step(&mut ex, &SEED).unwrap(), vec![b"pw\0".to_vec()]);
    }

    #[test]
    fn test_sha256_without_key_or_retrieval_fails() {
        let mut plugin = BuiltinPlugin::from_name(plugins::SHA256_PASSWORD).unwrap();
        assert!(plugin.requires_rsa());
        let err = plugin.next_step(&mut exchange("pw", false), &SEED).unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthErrorKind::PublicKeyUnavailable));
    }

    #[test]
    fn test_sha256_secure_channel_sends_clear_text() {
        let mut plugin = BuiltinPlugin::from_name(plugins::SHA256_PASSWORD).unwrap();
        let out = plugin.next_step(&mut exchange("pw", true), &SEED).unwrap();
        assert_eq!(out, vec![b"pw\0".to_vec()]);
    }

    #[test]
    fn test_sha256_empty_password() {
        let mut plugin = BuiltinPlugin::from_name(plugins::SHA256_PASSWORD).unwrap();
        let out = plugin.next_step(&mut exchange("", false), &SEED).unwrap();
        assert_eq!(out, vec![vec![0]]);
    }

    #[test]
    fn test_sha256_retrieves_public_key() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let pem = private.to_public_key().to_public_key_pem(LineEnding::LF).unwrap();

        let mut plugin = BuiltinPlugin::from_name(plugins::SHA256_PASSWORD).unwrap();
        let mut ex = exchange("pw", false).with_public_key_retrieval(true);
        let out = plugin.next_step(&mut ex, &SEED).unwrap();
        assert_eq!(out, vec![vec![sha256::REQUEST_PUBLIC_KEY]]);

        let out = plugin.next_step(&mut ex, pem.as_bytes()).unwrap();
        assert_eq!(unmask(&private, &out[0]), b"pw\0");
        assert_eq!(ex.public_key(), Some(pem.as_str()));
        assert_eq!(plugin, BuiltinPlugin::Sha256Password(Sha256Stage::Finished));
    }

    #[test]
    fn test_caching_sha2_fast_auth() {
        let mut plugin = BuiltinPlugin::from_name(plugins::CACHING_SHA2_PASSWORD).unwrap();
        let mut ex = exchange("secret", false);
        let out = plugin.next_step(&mut ex, &SEED).unwrap();
        assert_eq!(out, vec![caching_sha2_password("secret", &SEED)]);

        let out = plugin
            .next_step(&mut ex, &[caching_sha2::FAST_AUTH_SUCCESS])
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_caching_sha2_full_auth_with_cached_key() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let pem = private.to_public_key().to_public_key_pem(LineEnding::LF).unwrap();

        let mut plugin = BuiltinPlugin::from_name(plugins::CACHING_SHA2_PASSWORD).unwrap();
        let mut ex = exchange("secret", false).with_public_key(Some(pem));
        plugin.next_step(&mut ex, &SEED).unwrap();
        let out = plugin
            .next_step(&mut ex, &[caching_sha2::PERFORM_FULL_AUTH])
            .unwrap();
        assert_eq!(unmask(&private, &out[0]), b"secret\0");
    }

    #[test]
    fn test_caching_sha2_full_auth_requests_key() {
        let mut plugin = BuiltinPlugin::from_name(plugins::CACHING_SHA2_PASSWORD).unwrap();
        let mut ex = exchange("secret", false).with_public_key_retrieval(true);
        plugin.next_step(&mut ex, &SEED).unwrap();
        let out = plugin
            .next_step(&mut ex, &[caching_sha2::PERFORM_FULL_AUTH])
            .unwrap();
        assert_eq!(out, vec![vec![caching_sha2::REQUEST_PUBLIC_KEY]]);
        assert_eq!(
            plugin,
            BuiltinPlugin::CachingSha2Password(CachingSha2Stage::AwaitingPublicKey)
        );
    }

    #[test]
    fn test_caching_sha2_full_auth_over_tls() {
        let mut plugin = BuiltinPlugin::from_name(plugins::CACHING_SHA2_PASSWORD).unwrap();
        let mut ex = exchange("secret", true);
        plugin.next_step(&mut ex, &SEED).unwrap();
        let out = plugin
            .next_step(&mut ex, &[caching_sha2::PERFORM_FULL_AUTH])
            .unwrap();
        assert_eq!(out, vec![b"secret\0".to_vec()]);
    }

    #[test]
    fn test_caching_sha2_full_auth_without_key() {
        let mut plugin = BuiltinPlugin::from_name(plugins::CACHING_SHA2_PASSWORD).unwrap();
        let mut ex = exchange("secret", false);
        plugin.next_step(&mut ex, &SEED).unwrap();
        let err = plugin
            .next_step(&mut ex, &[caching_sha2::PERFORM_FULL_AUTH])
            .unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthErrorKind::PublicKeyUnavailable));
    }

    #[test]
    fn test_caching_sha2_bad_result_code() {
        let mut plugin = BuiltinPlugin::from_name(plugins::CACHING_SHA2_PASSWORD).unwrap();
        let mut ex = exchange("secret", false);
        plugin.next_step(&mut ex, &SEED).unwrap();
        let err = plugin.next_step(&mut ex, &[0x09]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_reset_returns_to_initial_stage() {
        let mut plugin = BuiltinPlugin::from_name(plugins::CACHING_SHA2_PASSWORD).unwrap();
        plugin.next_step(&mut exchange("x", false), &SEED).unwrap();
        plugin.reset();
        assert_eq!(
            plugin,
            BuiltinPlugin::CachingSha2Password(CachingSha2Stage::Initial)
        );
    }
}
