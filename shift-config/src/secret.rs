use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

/// A [`SecretString`] that can be read from configuration sources.
///
/// The value is wrapped as soon as it is deserialized and is redacted in debug output.
#[derive(Clone, Debug)]
pub struct ConfigSecret(SecretString);

impl ConfigSecret {
    /// Exposes the wrapped secret.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl From<String> for ConfigSecret {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl<'de> Deserialize<'de> for ConfigSecret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;

        Ok(Self(value.into()))
    }
}
