//! Authentication scenarios against a scripted server.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey};
use sha1::Sha1;

use sqlwire_client::auth::scramble::{caching_sha2_password, native_password};
use sqlwire_client::auth::{AuthExchange, AuthPlugin, PluginRegistry, plugins};
use sqlwire_client::protocol::{Command, capabilities, tag};
use sqlwire_client::{Session, SslMode};
use sqlwire_core::{AuthErrorKind, Error, Result};

#[test]
fn native_password_single_round() {
    let (transport, written) = ScriptedTransport::new(&[
        challenge(plugins::MYSQL_NATIVE_PASSWORD, SERVER_CAPS),
        ok_frame(2),
    ]);
    let session = Session::handshake(Box::new(transport), config()).unwrap();

    let frames = written.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].tag, tag::HANDSHAKE_RESPONSE);
    let (user, auth, plugin) = parse_handshake_response(&frames[0].payload);
    assert_eq!(user, "app");
    assert_eq!(auth, native_password("secret", &SEED));
    assert_eq!(plugin, plugins::MYSQL_NATIVE_PASSWORD);

    let caps = session.capabilities();
    assert_eq!(caps.connection_id, CONNECTION_ID);
    assert_eq!(caps.auth_plugin, plugins::MYSQL_NATIVE_PASSWORD);
    assert_eq!(caps.server_version.major, 8);
    assert_eq!(caps.status_flags, 2);
    assert!(!caps.tls);
    assert!(caps.deprecate_eof());
    assert!(!caps.has(capabilities::CLIENT_SSL));
}

#[test]
fn caching_sha2_full_auth_retrieves_public_key() {
    let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
    let pem = private
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();

    let (transport, written) = ScriptedTransport::new(&[
        challenge(plugins::CACHING_SHA2_PASSWORD, SERVER_CAPS),
        more_data(&[4]),
        more_data(pem.as_bytes()),
        ok_frame(2),
    ]);
    let config = config().password("hunter2").allow_public_key_retrieval(true);
    let session = Session::handshake(Box::new(transport), config).unwrap();
    assert_eq!(
        session.capabilities().auth_plugin,
        plugins::CACHING_SHA2_PASSWORD
    );

    let frames = written.frames();
    let tags: Vec<u8> = frames.iter().map(|f| f.tag).collect();
    assert_eq!(
        tags,
        vec![tag::HANDSHAKE_RESPONSE, tag::AUTH_DATA, tag::AUTH_DATA]
    );
    let (_, auth, plugin) = parse_handshake_response(&frames[0].payload);
    assert_eq!(auth, caching_sha2_password("hunter2", &SEED));
    assert_eq!(plugin, plugins::CACHING_SHA2_PASSWORD);
    assert_eq!(frames[1].payload, vec![2]);

    let decrypted = private
        .decrypt(Oaep::new::<Sha1>(), &frames[2].payload)
        .unwrap();
    let plain: Vec<u8> = decrypted
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ SEED[i % SEED.len()])
        .collect();
    assert_eq!(plain, b"hunter2\0");
}

#[test]
fn caching_sha2_fast_auth() {
    let (transport, written) = ScriptedTransport::new(&[
        challenge(plugins::CACHING_SHA2_PASSWORD, SERVER_CAPS),
        more_data(&[3]),
        ok_frame(2),
    ]);
    Session::handshake(Box::new(transport), config()).unwrap();
    assert_eq!(written.tags(), vec![tag::HANDSHAKE_RESPONSE]);
}

#[test]
fn caching_sha2_full_auth_without_key_fails() {
    let (transport, _written) = ScriptedTransport::new(&[
        challenge(plugins::CACHING_SHA2_PASSWORD, SERVER_CAPS),
        more_data(&[4]),
    ]);
    let err = Session::handshake(Box::new(transport), config()).unwrap_err();
    assert_eq!(err.auth_kind(), Some(AuthErrorKind::PublicKeyUnavailable));
}

#[test]
fn auth_switch_restarts_with_new_seed() {
    let seed: Vec<u8> = (100..120).collect();
    let (transport, written) = ScriptedTransport::new(&[
        challenge(plugins::CACHING_SHA2_PASSWORD, SERVER_CAPS),
        auth_switch(plugins::MYSQL_NATIVE_PASSWORD, &seed),
        ok_frame(2),
    ]);
    let session = Session::handshake(Box::new(transport), config()).unwrap();

    let frames = written.frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].tag, tag::AUTH_DATA);
    assert_eq!(frames[1].payload, native_password("secret", &seed));
    assert_eq!(
        session.capabilities().auth_plugin,
        plugins::MYSQL_NATIVE_PASSWORD
    );
}

#[test]
fn rsa_plugin_on_plain_channel_falls_back_without_credential() {
    let (transport, written) = ScriptedTransport::new(&[
        challenge(plugins::SHA256_PASSWORD, SERVER_CAPS),
        ok_frame(2),
    ]);
    Session::handshake(Box::new(transport), config()).unwrap();

    let frames = written.frames();
    let (_, auth, plugin) = parse_handshake_response(&frames[0].payload);
    assert_eq!(plugin, plugins::MYSQL_NATIVE_PASSWORD);
    assert!(auth.is_empty());
}

#[test]
fn server_rejection_carries_code() {
    let (transport, _written) = ScriptedTransport::new(&[
        challenge(plugins::MYSQL_NATIVE_PASSWORD, SERVER_CAPS),
        err_frame(1045, "Access denied for user 'app'"),
    ]);
    let err = Session::handshake(Box::new(transport), config()).unwrap_err();
    match err {
        Error::Auth(auth) => {
            assert_eq!(auth.kind, AuthErrorKind::Rejected);
            assert_eq!(auth.server_code, Some(1045));
            assert_eq!(auth.plugin.as_deref(), Some(plugins::MYSQL_NATIVE_PASSWORD));
            assert!(auth.message.contains("Access denied"));
        }
        other => panic!("expected an auth error, got {other:?}"),
    }
}

#[test]
fn required_ssl_without_server_support() {
    let (transport, written) = ScriptedTransport::new(&[challenge(
        plugins::MYSQL_NATIVE_PASSWORD,
        SERVER_CAPS,
    )]);
    let config = config().ssl_mode(SslMode::Required);
    let err = Session::handshake(Box::new(transport), config).unwrap_err();
    assert_eq!(err.auth_kind(), Some(AuthErrorKind::SslUnavailable));
    assert!(written.is_empty());
}

#[test]
fn clear_password_needs_encrypted_channel() {
    let (transport, written) = ScriptedTransport::new(&[challenge(
        plugins::MYSQL_CLEAR_PASSWORD,
        SERVER_CAPS,
    )]);
    let err = Session::handshake(Box::new(transport), config()).unwrap_err();
    assert_eq!(err.auth_kind(), Some(AuthErrorKind::ConfidentialityRequired));
    assert!(written.is_empty());
}

#[test]
fn clear_password_over_tls() {
    let (transport, written) = ScriptedTransport::new(&[
        challenge(
            plugins::MYSQL_CLEAR_PASSWORD,
            SERVER_CAPS | capabilities::CLIENT_SSL,
        ),
        ok_frame(2),
    ]);
    let config = config().ssl_mode(SslMode::Required);
    let session = Session::handshake(Box::new(transport.with_tls()), config).unwrap();

    let frames = written.frames();
    assert_eq!(frames[0].tag, tag::SSL_REQUEST);
    assert_eq!(frames[1].tag, tag::HANDSHAKE_RESPONSE);
    let (_, auth, _) = parse_handshake_response(&frames[1].payload);
    assert_eq!(auth, b"secret\0");

    let caps = session.capabilities();
    assert!(caps.tls);
    assert!(caps.has(capabilities::CLIENT_SSL));
}

#[test]
fn failed_tls_upgrade_is_fatal() {
    let (transport, written) = ScriptedTransport::new(&[challenge(
        plugins::MYSQL_NATIVE_PASSWORD,
        SERVER_CAPS | capabilities::CLIENT_SSL,
    )]);
    let config = config().ssl_mode(SslMode::Required);
    let err = Session::handshake(Box::new(transport), config).unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert_eq!(written.tags(), vec![tag::SSL_REQUEST]);
}

#[test]
fn disabled_plugin_is_refused() {
    let (transport, _written) = ScriptedTransport::new(&[challenge(
        plugins::CACHING_SHA2_PASSWORD,
        SERVER_CAPS,
    )]);
    let config = config().disable_auth_plugin(plugins::CACHING_SHA2_PASSWORD);
    let err = Session::handshake(Box::new(transport), config).unwrap_err();
    assert_eq!(err.auth_kind(), Some(AuthErrorKind::UnknownPlugin));
}

/// Answers every server frame with one more payload.
#[derive(Debug, Default)]
struct Chatty {
    steps: usize,
}

impl AuthPlugin for Chatty {
    fn protocol_name(&self) -> &str {
        "chatty"
    }

    fn reset(&mut self) {
        self.steps = 0;
    }

    fn next_step(&mut self, _exchange: &mut AuthExchange, _data: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.steps += 1;
        Ok(vec![vec![u8::try_from(self.steps).unwrap_or(u8::MAX)]])
    }
}

#[test]
fn extension_plugin_is_bounded_by_max_rounds() {
    let mut script = vec![challenge("chatty", SERVER_CAPS)];
    script.extend((0..10).map(|_| more_data(b"again")));
    let (transport, written) = ScriptedTransport::new(&script);

    let registry = PluginRegistry::new().with_plugin("chatty", || Box::new(Chatty::default()));
    let config = config().plugins(registry).max_auth_rounds(3);
    let err = Session::handshake(Box::new(transport), config).unwrap_err();

    assert_eq!(err.auth_kind(), Some(AuthErrorKind::TooManyRounds));
    let frames = written.frames();
    assert_eq!(frames[0].tag, tag::HANDSHAKE_RESPONSE);
    assert_eq!(frames.len(), 4);
    let steps: Vec<u8> = frames[1..].iter().map(|f| f.payload[0]).collect();
    assert_eq!(steps, vec![2, 3, 4]);
}

#[test]
fn repeated_auth_switch_is_bounded_by_max_rounds() {
    let seeds: Vec<Vec<u8>> = (0..10u8).map(|i| (i..i + 20).map(|b| b + 1).collect()).collect();
    let mut script = vec![challenge(plugins::MYSQL_NATIVE_PASSWORD, SERVER_CAPS)];
    script.extend(
        seeds
            .iter()
            .map(|seed| auth_switch(plugins::MYSQL_NATIVE_PASSWORD, seed)),
    );
    let (transport, written) = ScriptedTransport::new(&script);

    let err =
        Session::handshake(Box::new(transport), config().max_auth_rounds(3)).unwrap_err();

    assert_eq!(err.auth_kind(), Some(AuthErrorKind::TooManyRounds));
    let frames = written.frames();
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[0].tag, tag::HANDSHAKE_RESPONSE);
    for (frame, seed) in frames[1..].iter().zip(&seeds) {
        assert_eq!(frame.tag, tag::AUTH_DATA);
        assert_eq!(frame.payload, native_password("secret", seed));
    }
}

#[test]
fn extension_plugin_completes() {
    let (transport, written) = ScriptedTransport::new(&[
        challenge("chatty", SERVER_CAPS),
        more_data(b"one more"),
        ok_frame(2),
    ]);
    let registry = PluginRegistry::new().with_plugin("chatty", || Box::new(Chatty::default()));
    let session = Session::handshake(Box::new(transport), config().plugins(registry)).unwrap();
    assert_eq!(session.capabilities().auth_plugin, "chatty");
    assert_eq!(written.tags(), vec![tag::HANDSHAKE_RESPONSE, tag::AUTH_DATA]);
}

#[test]
fn change_user_reauthenticates() {
    let (session, written) = established(&[ok_frame(2)]);
    session
        .change_user("reporter", Some("other"), Some("reports"))
        .unwrap();

    let frames = commands(&written);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].tag, Command::ChangeUser as u8);
    let payload = &frames[0].payload;
    assert!(payload.starts_with(b"reporter\0"));
    assert_eq!(usize::from(payload[9]), 20);
    assert_eq!(&payload[10..30], native_password("other", &SEED).as_slice());
    assert!(payload[30..].starts_with(b"reports\0"));

    assert!(!session.is_poisoned());
    assert_eq!(
        session.capabilities().auth_plugin,
        plugins::MYSQL_NATIVE_PASSWORD
    );
}

#[test]
fn rejected_change_user_poisons() {
    let (session, _written) = established(&[err_frame(1045, "Access denied")]);
    let err = session.change_user("intruder", None, None).unwrap_err();
    assert_eq!(err.auth_kind(), Some(AuthErrorKind::Rejected));
    assert!(session.is_poisoned());
    assert!(session.ping().is_err());
}
