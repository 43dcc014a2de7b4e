//! The origin key stored on every async call.
//!
//! The text form is part of the durable schema and must round-trip
//! bit-exact:
//!
//! - `cron:<cron-job-key>`
//! - `fsm:<module>.<fsm-name>:<instance-key>`
//! - `sub:<module>.<subscription-name>`
//!
//! Keys may contain any character except `:` and whitespace; modules
//! and names are identifiers.

use std::fmt;
use std::str::FromStr;

use ftl_core::Ref;

use crate::error::{Error, Result};

/// Who created an async call, and for what.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AsyncOrigin {
    /// A scheduled cron job.
    Cron {
        /// The cron job key.
        key: String,
    },
    /// An FSM transition for one instance.
    Fsm {
        /// The state machine definition.
        fsm: Ref,
        /// The instance key.
        key: String,
    },
    /// Delivery of a topic event to a subscription.
    Sub {
        /// The subscription reference.
        subscription: Ref,
    },
}

impl AsyncOrigin {
    /// The origin discriminator, used as a metrics label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Cron { .. } => "cron",
            Self::Fsm { .. } => "fsm",
            Self::Sub { .. } => "sub",
        }
    }
}

/// True for keys that survive the origin text form: non-empty, no `:`,
/// no whitespace.
fn is_origin_key(s: &str) -> bool {
    !s.is_empty() && !s.contains(':') && !s.chars().any(char::is_whitespace)
}

impl fmt::Display for AsyncOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron { key } => write!(f, "cron:{key}"),
            Self::Fsm { fsm, key } => write!(f, "fsm:{fsm}:{key}"),
            Self::Sub { subscription } => write!(f, "sub:{subscription}"),
        }
    }
}

impl FromStr for AsyncOrigin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((kind, rest)) = s.split_once(':') else {
            return Err(Error::invalid_argument(format!(
                "malformed origin key: {s}"
            )));
        };
        match kind {
            "cron" => {
                if !is_origin_key(rest) {
                    return Err(Error::invalid_argument(format!(
                        "malformed cron origin key: {s}"
                    )));
                }
                Ok(Self::Cron {
                    key: rest.to_string(),
                })
            }
            "fsm" => {
                let Some((fsm, key)) = rest.split_once(':') else {
                    return Err(Error::invalid_argument(format!(
                        "fsm origin key must carry an instance key: {s}"
                    )));
                };
                if !is_origin_key(key) {
                    return Err(Error::invalid_argument(format!(
                        "malformed fsm instance key: {s}"
                    )));
                }
                Ok(Self::Fsm {
                    fsm: fsm
                        .parse()
                        .map_err(|_| Error::invalid_argument(format!("malformed origin key: {s}")))?,
                    key: key.to_string(),
                })
            }
            "sub" => Ok(Self::Sub {
                subscription: rest
                    .parse()
                    .map_err(|_| Error::invalid_argument(format!("malformed origin key: {s}")))?,
            }),
            _ => Err(Error::invalid_argument(format!(
                "unknown origin kind: {s}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bit_exact() {
        let origins = [
            "cron:echo-tick-5m",
            "fsm:echo.door:instance-1",
            "fsm:echo.door:{\"json\"}",
            "sub:echo.events_sub",
        ];
        for text in origins {
            let origin: AsyncOrigin = text.parse().unwrap();
            assert_eq!(origin.to_string(), text);
        }
    }

    #[test]
    fn kinds() {
        let cron: AsyncOrigin = "cron:a".parse().unwrap();
        let fsm: AsyncOrigin = "fsm:m.f:k".parse().unwrap();
        let sub: AsyncOrigin = "sub:m.s".parse().unwrap();
        assert_eq!(cron.kind(), "cron");
        assert_eq!(fsm.kind(), "fsm");
        assert_eq!(sub.kind(), "sub");
    }

    #[test]
    fn rejects_malformed_keys() {
        let bad = [
            "",
            "cron",
            "cron:",
            "cron:a b",
            "fsm:echo.door",
            "fsm:echo.door:",
            "fsm:echo.door:a:b",
            "fsm:1bad.door:k",
            "sub:noseparator",
            "timer:echo.t",
        ];
        for text in bad {
            assert!(text.parse::<AsyncOrigin>().is_err(), "{text:?} should not parse");
        }
    }

    #[test]
    fn instance_key_allows_punctuation() {
        let origin: AsyncOrigin = "fsm:m.f:a-b_c.d/e".parse().unwrap();
        assert!(matches!(origin, AsyncOrigin::Fsm { key, .. } if key == "a-b_c.d/e"));
    }
}
