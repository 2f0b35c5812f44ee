use crate::errors::*;
use crate::{FieldTable, Sasl};
use amq_protocol::protocol::connection::{Open, Start, StartOk, Tune, TuneOk};
use amq_protocol::protocol::constants::FRAME_MIN_SIZE;
use amq_protocol::types::AMQPValue;
use std::time::Duration;

// The protocol revision this client is compiled against.
const VERSION_MAJOR: u8 = 0;
const VERSION_MINOR: u8 = 9;

const AMQP_CHANNEL_MAX: u16 = 65535;

/// Options that control the overall AMQP connection.
///
/// `ConnectionOptions` uses the builder pattern. The default settings are equivalent to
///
/// ```rust
/// use coney::{Auth, ConnectionOptions};
/// use std::time::Duration;
///
/// # fn default_connection_options() -> ConnectionOptions<Auth> {
/// ConnectionOptions::default()
///     .auth(Auth::default())
///     .virtual_host("/")
///     .locale("en_US")
///     .channel_max(0)
///     .frame_max(0)
///     .heartbeat(0)
///     .handshake_timeout(Some(Duration::from_secs(60)))
///     .information(None)
///     .client_properties(coney::FieldTable::new())
/// # }
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionOptions<Auth: Sasl> {
    pub(crate) auth: Auth,
    pub(crate) virtual_host: String,
    pub(crate) locale: String,
    pub(crate) channel_max: u16,
    pub(crate) frame_max: u32,
    pub(crate) heartbeat: u16,
    pub(crate) handshake_timeout: Option<Duration>,
    information: Option<String>,
    client_properties: FieldTable,
}

impl<Auth: Sasl> Default for ConnectionOptions<Auth> {
    // NOTE: If we change this, make sure to change the doc comment above.
    fn default() -> Self {
        ConnectionOptions {
            auth: Auth::default(),
            virtual_host: "/".to_string(),
            locale: "en_US".to_string(),
            channel_max: 0,
            frame_max: 0,
            heartbeat: 0,
            handshake_timeout: Some(Duration::from_secs(60)),
            information: None,
            client_properties: FieldTable::new(),
        }
    }
}

impl<Auth: Sasl> ConnectionOptions<Auth> {
    /// Sets the SASL authentication method.
    pub fn auth(self, auth: Auth) -> Self {
        ConnectionOptions { auth, ..self }
    }

    /// Sets the AMQP virtual host.
    pub fn virtual_host<T: Into<String>>(self, virtual_host: T) -> Self {
        ConnectionOptions {
            virtual_host: virtual_host.into(),
            ..self
        }
    }

    /// Sets the locale. AMQP requires servers support the `en_US` locale (which is also the
    /// default locale for `ConnectionOptions`).
    pub fn locale<T: Into<String>>(self, locale: T) -> Self {
        ConnectionOptions {
            locale: locale.into(),
            ..self
        }
    }

    /// Sets the maximum number of channels that can be opened simultaneously on this connection.
    /// 0 (the default) means no preference; see
    /// [`negotiated_tune_ok`](#method.negotiated_tune_ok) for how the final value is agreed with
    /// the server.
    pub fn channel_max(self, channel_max: u16) -> Self {
        ConnectionOptions {
            channel_max,
            ..self
        }
    }

    /// Sets the maximum size in bytes of frames used for this connection. 0 (the default) means
    /// no preference.
    ///
    /// The frame max setting says nothing about the maximum size of messages; messages larger
    /// than the negotiated frame max are broken up into multiple body frames.
    ///
    /// Note that AMQP specifies a minimum frame max of 4096; negotiating a nonzero value lower
    /// than this will result in an error when attempting to open the connection.
    pub fn frame_max(self, frame_max: u32) -> Self {
        ConnectionOptions { frame_max, ..self }
    }

    /// Sets the requested heartbeat interval in seconds. 0 (the default) requests no heartbeats,
    /// but the server's preference still applies; a negotiated interval of 0 disables heartbeats.
    pub fn heartbeat(self, heartbeat: u16) -> Self {
        ConnectionOptions { heartbeat, ..self }
    }

    /// Sets the cap on how long each handshake step may wait for the server's reply. If `None`,
    /// handshake steps wait forever.
    pub fn handshake_timeout(self, handshake_timeout: Option<Duration>) -> Self {
        ConnectionOptions {
            handshake_timeout,
            ..self
        }
    }

    /// Sets the "information" string reported during handshaking to the server. This string
    /// is displayed in the RabbitMQ management interface under "Client properties" of a
    /// connection.
    pub fn information(self, information: Option<String>) -> Self {
        ConnectionOptions {
            information,
            ..self
        }
    }

    /// Extra entries merged into the client-properties table sent during handshaking. On key
    /// collision with the built-in entries (product, version, platform, ...), the entries given
    /// here win.
    pub fn client_properties(self, client_properties: FieldTable) -> Self {
        ConnectionOptions {
            client_properties,
            ..self
        }
    }

    pub(crate) fn make_start_ok(&self, start: Start) -> Result<(StartOk, FieldTable)> {
        // helper to search space-separated strings (mechanisms and locales)
        fn server_supports(server: &str, client: &str) -> bool {
            server.split(' ').any(|s| s == client)
        }

        if start.version_major != VERSION_MAJOR || start.version_minor != VERSION_MINOR {
            return ProtocolVersionMismatchSnafu {
                major: start.version_major,
                minor: start.version_minor,
            }
            .fail();
        }

        // ensure our requested auth mechanism and locale are available
        let mechanism = self.auth.mechanism();
        if !server_supports(&start.mechanisms, &mechanism) {
            return UnsupportedAuthMechanismSnafu {
                available: start.mechanisms.clone(),
                requested: mechanism,
            }
            .fail();
        }
        if !server_supports(&start.locales, &self.locale) {
            return UnsupportedLocaleSnafu {
                available: start.locales.clone(),
                requested: self.locale.clone(),
            }
            .fail();
        }

        // bundle up info about this crate as client properties
        let mut client_properties = FieldTable::new();
        let mut set_prop = |k: &str, v: String| {
            client_properties.insert(k.to_string(), AMQPValue::LongString(v));
        };
        set_prop("product", crate::built_info::PKG_NAME.to_string());
        set_prop("version", crate::built_info::PKG_VERSION.to_string());
        set_prop(
            "platform",
            format!(
                "{} / {}",
                crate::built_info::CFG_OS,
                crate::built_info::RUSTC_VERSION
            ),
        );
        if let Some(information) = &self.information {
            set_prop("information", information.to_string());
        }
        let mut capabilities = FieldTable::new();
        let mut set_cap = |k: &str| {
            capabilities.insert(k.to_string(), AMQPValue::Boolean(true));
        };
        set_cap("consumer_cancel_notify");
        set_cap("connection.blocked");
        client_properties.insert(
            "capabilities".to_string(),
            AMQPValue::FieldTable(capabilities),
        );

        // user-supplied entries win on key collision
        for (key, value) in &self.client_properties {
            client_properties.insert(key.clone(), value.clone());
        }

        Ok((
            StartOk {
                client_properties,
                mechanism,
                response: self.auth.response(),
                locale: self.locale.clone(),
            },
            start.server_properties,
        ))
    }

    /// Negotiate tuning parameters against the server's `tune`. For each of channel max, frame
    /// max, and heartbeat, a 0 on either side means "no preference" and yields the other side's
    /// value (the larger of the two); otherwise the smaller of the two wins. A channel max of 0
    /// after negotiation becomes the AMQP cap of 65535.
    pub(crate) fn make_tune_ok(&self, tune: Tune) -> Result<TuneOk> {
        fn negotiate_u16(client: u16, server: u16) -> u16 {
            if client == 0 || server == 0 {
                u16::max(client, server)
            } else {
                u16::min(client, server)
            }
        }
        fn negotiate_u32(client: u32, server: u32) -> u32 {
            if client == 0 || server == 0 {
                u32::max(client, server)
            } else {
                u32::min(client, server)
            }
        }

        let mut channel_max = negotiate_u16(self.channel_max, tune.channel_max);
        if channel_max == 0 {
            channel_max = AMQP_CHANNEL_MAX;
        }

        let frame_max = negotiate_u32(self.frame_max, tune.frame_max);
        if frame_max != 0 && frame_max < u32::from(FRAME_MIN_SIZE) {
            return FrameMaxTooSmallSnafu {
                min: u32::from(FRAME_MIN_SIZE),
                requested: frame_max,
            }
            .fail();
        }

        let heartbeat = negotiate_u16(self.heartbeat, tune.heartbeat);

        Ok(TuneOk {
            channel_max,
            frame_max,
            heartbeat,
        })
    }

    pub(crate) fn make_open(&self) -> Open {
        Open {
            virtual_host: self.virtual_host.clone(),
            capabilities: "".to_string(), // reserved
            insist: false,                // reserved
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;

    fn tune(channel_max: u16, frame_max: u32, heartbeat: u16) -> Tune {
        Tune {
            channel_max,
            frame_max,
            heartbeat,
        }
    }

    #[test]
    fn channel_max_negotiation() {
        let cases: &[(u16, u16, u16)] = &[
            // (client, server, expected); 0 means no preference, and a
            // negotiated 0 becomes the AMQP cap.
            (0, 0, 65535),
            (10, 0, 10),
            (0, 10, 10),
            (20, 10, 10),
            (10, 20, 10),
        ];
        for &(client, server, expected) in cases {
            let options = ConnectionOptions::<Auth>::default().channel_max(client);
            let tune_ok = options.make_tune_ok(tune(server, 1 << 17, 60)).unwrap();
            assert_eq!(tune_ok.channel_max, expected, "client={}", client);
        }
    }

    #[test]
    fn heartbeat_negotiation() {
        let cases: &[(u16, u16, u16)] = &[(0, 0, 0), (0, 60, 60), (30, 0, 30), (30, 60, 30)];
        for &(client, server, expected) in cases {
            let options = ConnectionOptions::<Auth>::default().heartbeat(client);
            let tune_ok = options.make_tune_ok(tune(0, 1 << 17, server)).unwrap();
            assert_eq!(tune_ok.heartbeat, expected, "client={}", client);
        }
    }

    #[test]
    fn frame_max_of_zero_means_unlimited() {
        let options = ConnectionOptions::<Auth>::default().frame_max(0);
        let tune_ok = options.make_tune_ok(tune(0, 0, 0)).unwrap();
        assert_eq!(tune_ok.frame_max, 0);
    }

    fn start_with(mechanisms: &str, locales: &str) -> Start {
        Start {
            version_major: 0,
            version_minor: 9,
            server_properties: FieldTable::new(),
            mechanisms: mechanisms.to_string(),
            locales: locales.to_string(),
        }
    }

    #[test]
    fn protocol_version_mismatch() {
        let options = ConnectionOptions::<Auth>::default();
        let mut start = start_with("PLAIN", "en_US");
        start.version_minor = 8;
        match options.make_start_ok(start).unwrap_err() {
            Error::ProtocolVersionMismatch { major: 0, minor: 8 } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn unsupported_auth_mechanism() {
        let options = ConnectionOptions::<Auth>::default();
        let start = start_with("NOTPLAIN SOMETHINGELSE", &options.locale);
        let res = options.make_start_ok(start);
        match res.unwrap_err() {
            Error::UnsupportedAuthMechanism { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn unsupported_locale() {
        let options = ConnectionOptions::<Auth>::default().locale("nonexistent");
        let start = start_with(&options.auth.mechanism(), "en_US es_ES");
        let res = options.make_start_ok(start);
        match res.unwrap_err() {
            Error::UnsupportedLocale { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn frame_max_too_small() {
        let frame_max = u32::from(FRAME_MIN_SIZE) - 1;
        let options = ConnectionOptions::<Auth>::default().frame_max(frame_max);

        let res = options.make_tune_ok(tune(65535, 1 << 17, 60));
        match res.unwrap_err() {
            Error::FrameMaxTooSmall { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn user_client_properties_win() {
        let mut extra = FieldTable::new();
        extra.insert(
            "product".to_string(),
            AMQPValue::LongString("my-app".to_string()),
        );
        extra.insert(
            "team".to_string(),
            AMQPValue::LongString("backend".to_string()),
        );
        let options = ConnectionOptions::<Auth>::default().client_properties(extra);

        let (start_ok, _) = options
            .make_start_ok(start_with("PLAIN", "en_US"))
            .unwrap();
        assert_eq!(
            start_ok.client_properties.get("product"),
            Some(&AMQPValue::LongString("my-app".to_string()))
        );
        assert_eq!(
            start_ok.client_properties.get("team"),
            Some(&AMQPValue::LongString("backend".to_string()))
        );
        // built-in entries without collisions survive
        assert!(start_ok.client_properties.get("platform").is_some());
    }
}
