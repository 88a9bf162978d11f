//! Authentication negotiation.
//!
//! # Handshake Flow
//!
//! 1. Server sends a `HANDSHAKE` challenge (version, capabilities, seed,
//!    default plugin)
//! 2. Client agrees capabilities, optionally upgrades to TLS
//! 3. Client picks a plugin and sends `HANDSHAKE_RESPONSE` with its first
//!    payload
//! 4. Server answers with OK, ERR, an auth switch or more data, until OK
//!
//! The [`Negotiator`] walks [`HandshakeStage`]s and produces the
//! [`SessionCapabilities`] the rest of the engine reads.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;

use sqlwire_core::{AuthError, AuthErrorKind, ConfigError, Error, ProtocolError, Result};

use crate::auth::{AuthExchange, AuthPlugin};
use crate::config::ClientConfig;
use crate::framer::Framer;
use crate::protocol::{Command, OkPacket, PacketReader, PacketWriter, capabilities, tag};
use crate::tls;

/// Protocol version carried by every challenge.
pub const PROTOCOL_VERSION: u8 = 10;

/// Stages of one authentication exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    AwaitingChallenge,
    PluginSelected,
    AwaitingPluginStep,
    AwaitingSwitchedPlugin,
    AwaitingMoreData,
    Done,
    Failed,
}

impl HandshakeStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingChallenge => "awaiting_challenge",
            Self::PluginSelected => "plugin_selected",
            Self::AwaitingPluginStep => "awaiting_plugin_step",
            Self::AwaitingSwitchedPlugin => "awaiting_switched_plugin",
            Self::AwaitingMoreData => "awaiting_more_data",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed server version, e.g. `8.0.36-log`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub raw: String,
}

impl ServerVersion {
    /// Parse the leading `major.minor.patch`; missing parts are zero.
    pub fn parse(raw: &str) -> Self {
        let numeric = raw
            .split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .next()
            .unwrap_or_default();
        let mut parts = numeric.split('.').map(|p| p.parse::<u16>().unwrap_or(0));
        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
            raw: raw.to_string(),
        }
    }

    pub fn meets_minimum(&self, major: u16, minor: u16, patch: u16) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// What the session agreed on during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCapabilities {
    /// Agreed capability flags (client request intersected with server offer)
    pub flags: u32,
    pub charset: u8,
    pub server_version: ServerVersion,
    pub connection_id: u32,
    /// Whether the channel is encrypted
    pub tls: bool,
    /// Plugin that completed authentication
    pub auth_plugin: String,
    /// Server status flags from the final OK
    pub status_flags: u16,
}

impl SessionCapabilities {
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Column blocks and row streams end without a separate EOF frame.
    pub fn deprecate_eof(&self) -> bool {
        self.has(capabilities::CLIENT_DEPRECATE_EOF)
    }

    /// Compressed framing was agreed. The client never requests it.
    pub fn compression(&self) -> bool {
        self.has(capabilities::CLIENT_COMPRESS)
    }

    pub fn multi_statements(&self) -> bool {
        self.has(capabilities::CLIENT_MULTI_STATEMENTS)
    }
}

/// The server's `HANDSHAKE` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    /// Default plugin name; empty when the server names none
    pub auth_plugin: String,
    /// Scramble seed (part 1 + part 2, trailing NUL removed)
    pub seed: Vec<u8>,
}

impl ServerHandshake {
    /// Parse a challenge payload.
    ///
    /// Layout: protocol version u8, server version (NUL string), connection
    /// id u32, seed part 1 (8 bytes), filler, capabilities low u16, charset
    /// u8, status u16, capabilities high u16, auth data length u8, 10
    /// reserved bytes, seed part 2 (`max(13, len - 8)` bytes), plugin name.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let malformed = || Error::Protocol(ProtocolError::new("malformed handshake challenge"));
        let mut reader = PacketReader::new(payload);

        let protocol_version = reader.read_u8().ok_or_else(malformed)?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(Error::Protocol(ProtocolError::new(format!(
                "unsupported protocol version {protocol_version}"
            ))));
        }
        let server_version = reader.read_null_string().ok_or_else(malformed)?;
        let connection_id = reader.read_u32_le().ok_or_else(malformed)?;
        let mut seed = reader.read_bytes(8).ok_or_else(malformed)?.to_vec();
        reader.skip(1);
        let caps_lower = reader.read_u16_le().ok_or_else(malformed)?;

        let mut handshake = Self {
            protocol_version,
            server_version,
            connection_id,
            capabilities: u32::from(caps_lower),
            charset: 0,
            status_flags: 0,
            auth_plugin: String::new(),
            seed: Vec::new(),
        };

        if reader.is_empty() {
            handshake.seed = seed;
            return Ok(handshake);
        }

        handshake.charset = reader.read_u8().ok_or_else(malformed)?;
        handshake.status_flags = reader.read_u16_le().ok_or_else(malformed)?;
        let caps_upper = reader.read_u16_le().ok_or_else(malformed)?;
        handshake.capabilities |= u32::from(caps_upper) << 16;
        let auth_data_len = reader.read_u8().ok_or_else(malformed)?;
        reader.skip(10);

        if handshake.capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len = 13_usize.max(usize::from(auth_data_len).saturating_sub(8));
            let part2 = reader.read_bytes(len.min(reader.remaining())).ok_or_else(malformed)?;
            seed.extend_from_slice(part2);
            if seed.last() == Some(&0) {
                seed.pop();
            }
        }
        handshake.seed = seed;

        if handshake.capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            handshake.auth_plugin = reader.read_null_string().unwrap_or_default();
        }

        Ok(handshake)
    }

    /// Encode a challenge payload, the inverse of [`parse`](Self::parse).
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(64 + self.server_version.len());
        writer.write_u8(self.protocol_version);
        writer.write_null_string(&self.server_version);
        writer.write_u32_le(self.connection_id);
        let split = self.seed.len().min(8);
        writer.write_bytes(&self.seed[..split]);
        writer.write_zeros(8 - split);
        writer.write_u8(0);
        writer.write_u16_le((self.capabilities & 0xFFFF) as u16);
        writer.write_u8(self.charset);
        writer.write_u16_le(self.status_flags);
        writer.write_u16_le((self.capabilities >> 16) as u16);
        writer.write_u8((self.seed.len() + 1).min(255) as u8);
        writer.write_zeros(10);
        let part2 = &self.seed[split..];
        writer.write_bytes(part2);
        writer.write_zeros(13_usize.saturating_sub(part2.len()).max(1));
        if self.capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(&self.auth_plugin);
        }
        writer.into_bytes()
    }
}

/// The client's `HANDSHAKE_RESPONSE`.
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub flags: u32,
    pub max_frame_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub attributes: &'a BTreeMap<String, String>,
}

impl HandshakeResponse<'_> {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(128);
        writer.write_u32_le(self.flags);
        writer.write_u32_le(self.max_frame_size);
        writer.write_u8(self.charset);
        writer.write_zeros(23);
        writer.write_null_string(self.user);

        if self.flags & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(self.auth_response);
        } else {
            writer.write_u8(self.auth_response.len().min(255) as u8);
            writer.write_bytes(&self.auth_response[..self.auth_response.len().min(255)]);
        }

        if self.flags & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.database.unwrap_or_default());
        }
        if self.flags & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.auth_plugin);
        }
        if self.flags & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            write_attributes(&mut writer, self.attributes);
        }
        writer.into_bytes()
    }
}

fn write_attributes(writer: &mut PacketWriter, attributes: &BTreeMap<String, String>) {
    let mut block = PacketWriter::new();
    for (key, value) in attributes {
        block.write_lenenc_string(key);
        block.write_lenenc_string(value);
    }
    writer.write_lenenc_bytes(block.as_bytes());
}

/// Build the `ChangeUser` command payload.
pub fn build_change_user_payload(
    flags: u32,
    config: &ClientConfig,
    auth_response: &[u8],
    auth_plugin: &str,
) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(64);
    writer.write_null_string(&config.user);
    writer.write_u8(auth_response.len().min(255) as u8);
    writer.write_bytes(&auth_response[..auth_response.len().min(255)]);
    writer.write_null_string(config.database.as_deref().unwrap_or_default());
    writer.write_u16_le(u16::from(config.charset));
    if flags & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        writer.write_null_string(auth_plugin);
    }
    if flags & capabilities::CLIENT_CONNECT_ATTRS != 0 {
        write_attributes(&mut writer, &config.attributes);
    }
    writer.into_bytes()
}

/// Result of a completed negotiation.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub capabilities: SessionCapabilities,
    /// Seed of the initial challenge, reused by change user
    pub seed: Vec<u8>,
    /// RSA public key learned or loaded during the exchange
    pub public_key: Option<String>,
}

/// Drives one authentication exchange over a framer.
#[derive(Debug)]
pub struct Negotiator<'a> {
    framer: &'a mut Framer,
    config: &'a ClientConfig,
    stage: HandshakeStage,
    rounds: u32,
}

impl<'a> Negotiator<'a> {
    pub fn new(framer: &'a mut Framer, config: &'a ClientConfig) -> Self {
        Self {
            framer,
            config,
            stage: HandshakeStage::AwaitingChallenge,
            rounds: 0,
        }
    }

    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    /// Number of server auth frames processed so far.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    fn enter(&mut self, stage: HandshakeStage) {
        tracing::debug!(from = %self.stage, to = %stage, "Handshake stage transition");
        self.stage = stage;
    }

    /// Mark the exchange failed and attach the stage to auth errors.
    fn fail(&mut self, err: Error) -> Error {
        let stage = self.stage;
        self.stage = HandshakeStage::Failed;
        match err {
            Error::Auth(mut auth) if auth.stage.is_none() => {
                auth.stage = Some(stage.as_str());
                Error::Auth(auth)
            }
            other => other,
        }
    }

    /// Run the full initial handshake.
    pub fn run(mut self, public_key: Option<String>) -> Result<HandshakeOutcome> {
        match self.run_initial(public_key) {
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn run_initial(&mut self, public_key: Option<String>) -> Result<HandshakeOutcome> {
        let config = self.config;
        let challenge = self.framer.read_frame()?;
        match challenge.tag {
            tag::HANDSHAKE => {}
            tag::ERR => return Err(rejected(&challenge.payload)),
            other => {
                return Err(ProtocolError::unexpected_tag(other, "handshake challenge").into());
            }
        }
        let server = ServerHandshake::parse(&challenge.payload)?;
        tracing::debug!(
            server_version = %server.server_version,
            connection_id = server.connection_id,
            plugin = %server.auth_plugin,
            "Received handshake challenge"
        );

        if server.capabilities & capabilities::CLIENT_SECURE_CONNECTION == 0 {
            return Err(AuthError::new(
                AuthErrorKind::UnsupportedCapability,
                "server does not support secure connection authentication",
            )
            .into());
        }

        let mut flags = config.capability_flags() & server.capabilities;
        let use_ssl = tls::validate_ssl_mode(config.ssl_mode, server.capabilities)?;
        if use_ssl {
            flags |= capabilities::CLIENT_SSL;
            let payload = tls::build_ssl_request_payload(
                flags,
                self.max_frame_size(),
                config.charset,
            );
            self.framer.write_frame(tag::SSL_REQUEST, &payload)?;
            self.framer
                .upgrade_tls(&config.host, &config.tls_config, config.ssl_mode)?;
        } else {
            flags &= !capabilities::CLIENT_SSL;
        }
        tracing::debug!(
            flags = ?capabilities::describe(flags),
            tls = use_ssl,
            "Agreed capabilities"
        );

        let mut exchange = self.new_exchange(&server.seed, public_key)?;
        let advertised = if flags & capabilities::CLIENT_PLUGIN_AUTH != 0
            && !server.auth_plugin.is_empty()
        {
            server.auth_plugin.as_str()
        } else {
            config.default_auth_plugin.as_str()
        };
        let mut plugin = self.select_plugin(advertised, &mut exchange)?;
        self.check_confidentiality(plugin.as_ref())?;

        let mut payloads = plugin.next_step(&mut exchange, &server.seed)?.into_iter();
        let first = payloads.next().unwrap_or_default();
        let response = HandshakeResponse {
            flags,
            max_frame_size: self.max_frame_size(),
            charset: config.charset,
            user: &config.user,
            auth_response: &first,
            database: config.database.as_deref(),
            auth_plugin: plugin.protocol_name(),
            attributes: &config.attributes,
        };
        self.framer
            .write_frame(tag::HANDSHAKE_RESPONSE, &response.encode())?;
        for payload in payloads {
            self.framer.write_frame(tag::AUTH_DATA, &payload)?;
        }
        self.enter(HandshakeStage::AwaitingPluginStep);

        let (plugin_name, ok) = self.authenticate(&mut plugin, &mut exchange)?;
        Ok(HandshakeOutcome {
            capabilities: SessionCapabilities {
                flags,
                charset: config.charset,
                server_version: ServerVersion::parse(&server.server_version),
                connection_id: server.connection_id,
                tls: self.framer.is_secure(),
                auth_plugin: plugin_name,
                status_flags: ok.status_flags,
            },
            seed: server.seed,
            public_key: exchange.take_public_key(),
        })
    }

    /// Re-authenticate on the established channel as `config.user`.
    pub fn change_user(
        mut self,
        current: &SessionCapabilities,
        seed: &[u8],
        public_key: Option<String>,
    ) -> Result<HandshakeOutcome> {
        self.stage = HandshakeStage::PluginSelected;
        match self.run_change_user(current, seed, public_key) {
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn run_change_user(
        &mut self,
        current: &SessionCapabilities,
        seed: &[u8],
        public_key: Option<String>,
    ) -> Result<HandshakeOutcome> {
        let mut exchange = self.new_exchange(seed, public_key)?;
        let mut plugin = self.select_plugin(&current.auth_plugin, &mut exchange)?;
        self.check_confidentiality(plugin.as_ref())?;

        let mut payloads = plugin.next_step(&mut exchange, seed)?.into_iter();
        let first = payloads.next().unwrap_or_default();
        let config = self.config;
        let payload =
            build_change_user_payload(current.flags, config, &first, plugin.protocol_name());
        self.framer.write_frame(Command::ChangeUser as u8, &payload)?;
        for payload in payloads {
            self.framer.write_frame(tag::AUTH_DATA, &payload)?;
        }
        self.enter(HandshakeStage::AwaitingPluginStep);

        let (plugin_name, ok) = self.authenticate(&mut plugin, &mut exchange)?;
        Ok(HandshakeOutcome {
            capabilities: SessionCapabilities {
                auth_plugin: plugin_name,
                status_flags: ok.status_flags,
                charset: config.charset,
                ..current.clone()
            },
            seed: seed.to_vec(),
            public_key: exchange.take_public_key(),
        })
    }

    fn max_frame_size(&self) -> u32 {
        u32::try_from(self.framer.max_frame_size()).unwrap_or(u32::MAX)
    }

    fn new_exchange(&self, seed: &[u8], cached_key: Option<String>) -> Result<AuthExchange> {
        let local_key = match &self.config.server_rsa_public_key_file {
            Some(path) => Some(fs::read_to_string(path).map_err(|e| {
                Error::Config(ConfigError {
                    message: format!("failed to read RSA public key '{}': {e}", path.display()),
                    source: Some(Box::new(e)),
                })
            })?),
            None => None,
        };
        Ok(
            AuthExchange::new(seed, self.config.password.clone(), self.framer.is_secure())
                .with_public_key(local_key.or(cached_key))
                .with_public_key_retrieval(self.config.allow_public_key_retrieval),
        )
    }

    /// Resolve the plugin to start with.
    ///
    /// A plugin that needs RSA, on a plain channel without a local key file,
    /// is replaced by the configured default and the password is withheld.
    fn select_plugin(
        &mut self,
        name: &str,
        exchange: &mut AuthExchange,
    ) -> Result<Box<dyn AuthPlugin>> {
        let config = self.config;
        let plugin = config.plugins.resolve(name, &config.disabled_auth_plugins)?;
        let plugin = if plugin.requires_rsa()
            && !exchange.is_secure()
            && config.server_rsa_public_key_file.is_none()
        {
            tracing::warn!(
                advertised = name,
                fallback = %config.default_auth_plugin,
                "RSA plugin unusable without TLS or a local public key; sending no credential"
            );
            exchange.suppress_password();
            config
                .plugins
                .resolve(&config.default_auth_plugin, &config.disabled_auth_plugins)?
        } else {
            plugin
        };
        tracing::debug!(plugin = plugin.protocol_name(), "Selected auth plugin");
        self.enter(HandshakeStage::PluginSelected);
        Ok(plugin)
    }

    fn check_confidentiality(&self, plugin: &dyn AuthPlugin) -> Result<()> {
        if plugin.requires_confidentiality() && !self.framer.is_secure() {
            return Err(AuthError::new(
                AuthErrorKind::ConfidentialityRequired,
                "plugin sends the password in clear text and the channel is not encrypted",
            )
            .with_plugin(plugin.protocol_name())
            .into());
        }
        Ok(())
    }

    /// Process server auth frames until OK or failure.
    fn authenticate(
        &mut self,
        plugin: &mut Box<dyn AuthPlugin>,
        exchange: &mut AuthExchange,
    ) -> Result<(String, OkPacket)> {
        loop {
            if self.rounds >= self.config.max_auth_rounds {
                return Err(AuthError::new(
                    AuthErrorKind::TooManyRounds,
                    format!(
                        "authentication did not finish within {} server frames",
                        self.config.max_auth_rounds
                    ),
                )
                .with_plugin(plugin.protocol_name())
                .into());
            }
            self.rounds += 1;

            let frame = self.framer.read_frame()?;
            match frame.tag {
                tag::OK => {
                    let ok = PacketReader::new(&frame.payload)
                        .parse_ok_packet()
                        .ok_or_else(|| {
                            Error::Protocol(ProtocolError::new("malformed OK frame"))
                        })?;
                    self.enter(HandshakeStage::Done);
                    return Ok((plugin.protocol_name().to_string(), ok));
                }
                tag::ERR => {
                    let err = rejected(&frame.payload);
                    return Err(match err {
                        Error::Auth(auth) => auth.with_plugin(plugin.protocol_name()).into(),
                        other => other,
                    });
                }
                tag::AUTH_SWITCH => {
                    let mut reader = PacketReader::new(&frame.payload);
                    let name = reader.read_null_string().unwrap_or_default();
                    let data = reader.read_rest();
                    let config = self.config;
                    *plugin = match config.plugins.resolve(&name, &config.disabled_auth_plugins) {
                        Ok(next) => next,
                        Err(err) => {
                            tracing::warn!(
                                plugin = %name,
                                "Server switched to an unusable auth plugin"
                            );
                            return Err(err);
                        }
                    };
                    tracing::debug!(plugin = %name, "Auth method switch");
                    plugin.reset();
                    exchange.set_seed(data);
                    exchange.restore_password();
                    self.enter(HandshakeStage::AwaitingSwitchedPlugin);
                    self.check_confidentiality(plugin.as_ref())?;

                    let payloads = plugin.next_step(exchange, data)?;
                    if payloads.is_empty() {
                        self.framer.write_frame(tag::AUTH_DATA, &[])?;
                    }
                    for payload in payloads {
                        self.framer.write_frame(tag::AUTH_DATA, &payload)?;
                    }
                }
                tag::AUTH_MORE_DATA => {
                    self.enter(HandshakeStage::AwaitingMoreData);
                    for payload in plugin.next_step(exchange, &frame.payload)? {
                        self.framer.write_frame(tag::AUTH_DATA, &payload)?;
                    }
                }
                other => {
                    return Err(
                        ProtocolError::unexpected_tag(other, "authentication exchange").into()
                    );
                }
            }
        }
    }
}

/// Turn an ERR payload received during authentication into `Rejected`.
fn rejected(payload: &[u8]) -> Error {
    match PacketReader::new(payload).parse_err_packet() {
        Some(err) => {
            let mut auth = AuthError::new(AuthErrorKind::Rejected, err.error_message);
            auth.server_code = Some(err.error_code);
            Error::Auth(auth)
        }
        None => Error::Protocol(ProtocolError::new("malformed ERR frame")),
    }
}
