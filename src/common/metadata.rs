//! Typed accessors for the per-component metadata found in config files.

use std::{fmt::Debug, str::FromStr, time::Duration};

use base64::Engine;
use easy_error::{Error, ResultExt, bail};
use serde::{Deserialize, Deserializer};

/// Parses `500ms`, `10s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, Error> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    if num.is_empty() {
        bail!("bad duration: {:?}", s);
    }
    let n: u64 = num
        .parse()
        .with_context(|| format!("bad duration: {:?}", s))?;
    let d = match unit.trim() {
        "" | "s" => Duration::from_secs(n),
        "ms" => Duration::from_millis(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        u => bail!("bad duration unit {:?} in {:?}", u, s),
    };
    Ok(d)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Secs(u64),
    Text(String),
}

/// `deserialize_with` helper for optional durations; zero means unset.
pub fn opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawDuration>::deserialize(deserializer)?;
    let d = match raw {
        None => return Ok(None),
        Some(RawDuration::Secs(n)) => Duration::from_secs(n),
        Some(RawDuration::Text(s)) => parse_duration(&s).map_err(serde::de::Error::custom)?,
    };
    Ok(Some(d).filter(|d| !d.is_zero()))
}

/// Username and password for upstream authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value for an `Authorization`/`Proxy-Authorization` header.
    pub fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
        )
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl FromStr for Credentials {
    type Err = Error;
    /// `user:pass`, or just `user` for an empty password.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, pass) = s.split_once(':').unwrap_or((s, ""));
        if user.is_empty() {
            bail!("empty username");
        }
        Ok(Self::new(user, pass))
    }
}

impl<'de> Deserialize<'de> for Credentials {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Pair { username: String, password: String },
        }
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Pair { username, password } => Ok(Self::new(username, password)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("5 days").is_err());
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        #[serde(default, deserialize_with = "opt_duration")]
        read_timeout: Option<Duration>,
        user: Option<Credentials>,
    }

    #[test]
    fn deserialize_fields() {
        let s: Sample = serde_yaml_ng::from_str("readTimeout: 30s\nuser: u:p\n").unwrap();
        assert_eq!(s.read_timeout, Some(Duration::from_secs(30)));
        assert_eq!(s.user, Some(Credentials::new("u", "p")));

        let s: Sample = serde_yaml_ng::from_str(
            "readTimeout: 0\nuser:\n  username: admin\n  password: 'a:b'\n",
        )
        .unwrap();
        assert_eq!(s.read_timeout, None);
        assert_eq!(s.user, Some(Credentials::new("admin", "a:b")));

        let s: Sample = serde_yaml_ng::from_str("{}").unwrap();
        assert!(s.read_timeout.is_none() && s.user.is_none());

        assert!(serde_yaml_ng::from_str::<Sample>("readTimeout: soon\n").is_err());
    }

    #[test]
    fn basic_auth_header() {
        assert_eq!(Credentials::new("u", "p").basic_auth(), "Basic dTpw");
        let c: Credentials = "user:pa:ss".parse().unwrap();
        assert_eq!(c.password, "pa:ss");
        assert!(!format!("{:?}", c).contains("pa:ss"));
    }
}
