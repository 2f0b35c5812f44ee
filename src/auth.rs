/// Trait implemented by SASL authentication mechanisms.
///
/// Most users should use the built-in [`Auth`](enum.Auth.html) enum; custom
/// implementations only need to supply the mechanism name advertised to the
/// server and the opaque response blob for `connection.start-ok`.
pub trait Sasl: Default + Clone + Send + 'static {
    fn mechanism(&self) -> String;
    fn response(&self) -> String;
}

/// Built-in authentication mechanisms.
#[derive(Debug, Clone, PartialEq)]
pub enum Auth {
    /// SASL PLAIN (the default for essentially all modern brokers).
    Plain { username: String, password: String },

    /// Legacy AMQPLAIN; the response is an AMQP field table carrying
    /// `LOGIN` and `PASSWORD` entries.
    AmqpLain { username: String, password: String },
}

impl Default for Auth {
    fn default() -> Auth {
        Auth::Plain {
            username: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}

impl Sasl for Auth {
    fn mechanism(&self) -> String {
        match *self {
            Auth::Plain { .. } => "PLAIN".to_string(),
            Auth::AmqpLain { .. } => "AMQPLAIN".to_string(),
        }
    }

    fn response(&self) -> String {
        match self {
            Auth::Plain { username, password } => format!("\x00{}\x00{}", username, password),
            Auth::AmqpLain { username, password } => {
                // AMQPLAIN's response is the body of a field table (i.e., a
                // table without its leading 4-byte size) with longstr LOGIN
                // and PASSWORD entries.
                let mut body = Vec::new();
                push_long_string_entry(&mut body, "LOGIN", username);
                push_long_string_entry(&mut body, "PASSWORD", password);
                String::from_utf8_lossy(&body).into_owned()
            }
        }
    }
}

fn push_long_string_entry(buf: &mut Vec<u8>, key: &str, value: &str) {
    buf.push(key.len() as u8);
    buf.extend_from_slice(key.as_bytes());
    buf.push(b'S');
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_response() {
        let auth = Auth::default();
        assert_eq!(auth.mechanism(), "PLAIN");
        assert_eq!(auth.response(), "\x00guest\x00guest");
    }

    #[test]
    fn amqplain_response() {
        let auth = Auth::AmqpLain {
            username: "guest".to_string(),
            password: "secret".to_string(),
        };
        assert_eq!(auth.mechanism(), "AMQPLAIN");
        let expected = b"\x05LOGINS\x00\x00\x00\x05guest\x08PASSWORDS\x00\x00\x00\x06secret";
        assert_eq!(auth.response().as_bytes(), &expected[..]);
    }
}
