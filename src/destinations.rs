use crate::{Error, Result};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt;

// '/' separates path segments and '%' introduces escapes, so both must be
// encoded inside a segment; everything else passes through untouched.
const SEGMENT: &AsciiSet = &CONTROLS.add(b'/').add(b'%');

/// A structured message destination, convertible to and from the textual
/// `/exchange/...`-style forms used by messaging gateways.
///
/// `parse` and the `Display` formatter are inverses: formatting a destination
/// and parsing the result yields the original value, with `/` and `%` inside
/// names carried as percent escapes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// An exchange, optionally with a binding pattern (`/exchange/<name>[/<pattern>]`).
    Exchange {
        name: String,
        pattern: Option<String>,
    },

    /// A topic on the topic exchange (`/topic/<name>`).
    Topic { name: String },

    /// A named queue (`/queue/<name>`, or the bare `<name>` shorthand).
    Queue { name: String },

    /// A queue in the `amq.*` namespace (`/amq/queue/<name>`).
    AmqQueue { name: String },

    /// A temporary queue (`/temp-queue/<name>`).
    TempQueue { name: String },

    /// A reply queue (`/reply-queue/<name>`).
    ReplyQueue { name: String },
}

impl Destination {
    /// Parse a textual destination.
    pub fn parse(destination: &str) -> Result<Destination> {
        let malformed = || Error::MalformedDestination {
            destination: destination.to_string(),
        };

        if !destination.starts_with('/') {
            if destination.is_empty() {
                return Err(malformed());
            }
            return Ok(Destination::Queue {
                name: decode(destination).ok_or_else(malformed)?,
            });
        }

        let rest = &destination[1..];
        let (kind, rest) = match rest.find('/') {
            Some(n) => (&rest[..n], &rest[n + 1..]),
            None => return Err(malformed()),
        };

        // "/amq/queue/<name>" is the one two-segment prefix.
        let (kind, rest) = if kind == "amq" {
            match rest.find('/') {
                Some(n) if &rest[..n] == "queue" => ("amq/queue", &rest[n + 1..]),
                _ => return Err(malformed()),
            }
        } else {
            (kind, rest)
        };

        let mut segments = rest.split('/');
        let name = match segments.next() {
            Some(name) if !name.is_empty() => decode(name).ok_or_else(malformed)?,
            _ => return Err(malformed()),
        };
        let pattern = segments.next().map(decode);
        if segments.next().is_some() {
            return Err(malformed());
        }

        match (kind, pattern) {
            ("exchange", None) => Ok(Destination::Exchange {
                name,
                pattern: None,
            }),
            ("exchange", Some(pattern)) => Ok(Destination::Exchange {
                name,
                pattern: Some(pattern.ok_or_else(malformed)?),
            }),
            ("topic", None) => Ok(Destination::Topic { name }),
            ("queue", None) => Ok(Destination::Queue { name }),
            ("amq/queue", None) => Ok(Destination::AmqQueue { name }),
            ("temp-queue", None) => Ok(Destination::TempQueue { name }),
            ("reply-queue", None) => Ok(Destination::ReplyQueue { name }),
            _ => Err(malformed()),
        }
    }
}

fn decode(segment: &str) -> Option<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Destination::Exchange {
                name,
                pattern: None,
            } => write!(f, "/exchange/{}", encode(name)),
            Destination::Exchange {
                name,
                pattern: Some(pattern),
            } => write!(f, "/exchange/{}/{}", encode(name), encode(pattern)),
            Destination::Topic { name } => write!(f, "/topic/{}", encode(name)),
            Destination::Queue { name } => write!(f, "/queue/{}", encode(name)),
            Destination::AmqQueue { name } => write!(f, "/amq/queue/{}", encode(name)),
            Destination::TempQueue { name } => write!(f, "/temp-queue/{}", encode(name)),
            Destination::ReplyQueue { name } => write!(f, "/reply-queue/{}", encode(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(d: Destination) {
        assert_eq!(Destination::parse(&d.to_string()).unwrap(), d);
    }

    #[test]
    fn parse_forms() {
        assert_eq!(
            Destination::parse("/exchange/logs").unwrap(),
            Destination::Exchange {
                name: "logs".to_string(),
                pattern: None
            }
        );
        assert_eq!(
            Destination::parse("/exchange/logs/errors.#").unwrap(),
            Destination::Exchange {
                name: "logs".to_string(),
                pattern: Some("errors.#".to_string())
            }
        );
        assert_eq!(
            Destination::parse("/topic/alerts").unwrap(),
            Destination::Topic {
                name: "alerts".to_string()
            }
        );
        assert_eq!(
            Destination::parse("/queue/work").unwrap(),
            Destination::Queue {
                name: "work".to_string()
            }
        );
        assert_eq!(
            Destination::parse("/amq/queue/amq.gen-123").unwrap(),
            Destination::AmqQueue {
                name: "amq.gen-123".to_string()
            }
        );
        assert_eq!(
            Destination::parse("/temp-queue/replies").unwrap(),
            Destination::TempQueue {
                name: "replies".to_string()
            }
        );
        assert_eq!(
            Destination::parse("/reply-queue/rpc").unwrap(),
            Destination::ReplyQueue {
                name: "rpc".to_string()
            }
        );
    }

    #[test]
    fn bare_name_is_a_queue() {
        assert_eq!(
            Destination::parse("work").unwrap(),
            Destination::Queue {
                name: "work".to_string()
            }
        );
    }

    #[test]
    fn percent_2f_decodes_to_slash() {
        assert_eq!(
            Destination::parse("/queue/a%2Fb").unwrap(),
            Destination::Queue {
                name: "a/b".to_string()
            }
        );
    }

    #[test]
    fn rejects_malformed() {
        for bad in &[
            "",
            "/",
            "/queue",
            "/queue/",
            "/unknown/x",
            "/exchange/a/b/c",
            "/amq/notqueue/x",
            "/topic/a/b",
        ] {
            assert!(
                matches!(
                    Destination::parse(bad),
                    Err(Error::MalformedDestination { .. })
                ),
                "expected {:?} to be rejected",
                bad
            );
        }
    }

    #[test]
    fn format_parse_roundtrip() {
        roundtrip(Destination::Exchange {
            name: "logs".to_string(),
            pattern: Some("a.#".to_string()),
        });
        roundtrip(Destination::Exchange {
            name: "with/slash".to_string(),
            pattern: None,
        });
        roundtrip(Destination::Topic {
            name: "100%/done".to_string(),
        });
        roundtrip(Destination::Queue {
            name: "plain".to_string(),
        });
        roundtrip(Destination::AmqQueue {
            name: "amq.gen-xyz".to_string(),
        });
        roundtrip(Destination::TempQueue {
            name: "t".to_string(),
        });
        roundtrip(Destination::ReplyQueue {
            name: "r".to_string(),
        });
    }
}
