// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Type identity records used by serializers to name persisted types.
//!
//! The text form is `Name, Version=1.2.3.4, PublicKeyToken=abcd`. Version
//! `0.0.0.0` and an empty token mean "unspecified", and an identity with an
//! unspecified part equals one where the part is absent.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors raised while parsing type identities.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeIdentityError {
    /// The type name is empty.
    #[error("type identity has an empty name")]
    EmptyName,

    /// The version is not 2 to 4 dotted numbers.
    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    /// A qualifier is not of the form `Key=Value`.
    #[error("malformed type identity part '{0}'")]
    MalformedPart(String),
}

/// Dotted version with 2 to 4 components.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    components: Vec<u32>,
}

impl Version {
    /// Build a version from its components.
    pub fn new(components: &[u32]) -> Result<Self, TypeIdentityError> {
        if !(2..=4).contains(&components.len()) {
            let text = components
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(".");
            return Err(TypeIdentityError::InvalidVersion(text));
        }
        Ok(Self {
            components: components.to_vec(),
        })
    }

    /// Version components in order.
    pub fn components(&self) -> &[u32] {
        &self.components
    }

    /// Whether this is `0.0.0.0`. Shorter zero versions such as `0.0` are
    /// specified.
    pub fn is_unspecified(&self) -> bool {
        self.components == [0, 0, 0, 0]
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = TypeIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components = s
            .trim()
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| TypeIdentityError::InvalidVersion(s.to_string()))?;
        Self::new(&components).map_err(|_| TypeIdentityError::InvalidVersion(s.to_string()))
    }
}

/// Name, version and signing token of a persisted type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeIdentity {
    /// Fully qualified type name.
    pub name: String,
    /// Version, if specified.
    pub version: Option<Version>,
    /// Public key token, if specified.
    pub token: Option<String>,
}

impl TypeIdentity {
    /// Identity with only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            token: None,
        }
    }

    /// Set the version.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Set the public key token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// The version unless absent or `0.0.0.0`.
    pub fn specified_version(&self) -> Option<&Version> {
        self.version.as_ref().filter(|v| !v.is_unspecified())
    }

    /// The token unless absent or empty.
    pub fn specified_token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

impl PartialEq for TypeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.specified_version() == other.specified_version()
            && self.specified_token() == other.specified_token()
    }
}

impl Eq for TypeIdentity {}

impl Hash for TypeIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.specified_version().hash(state);
        self.specified_token().hash(state);
    }
}

impl fmt::Display for TypeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(version) = self.specified_version() {
            write!(f, ", Version={}", version)?;
        }
        if let Some(token) = self.specified_token() {
            write!(f, ", PublicKeyToken={}", token)?;
        }
        Ok(())
    }
}

impl FromStr for TypeIdentity {
    type Err = TypeIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',').map(str::trim);
        let name = parts.next().unwrap_or_default();
        if name.is_empty() {
            return Err(TypeIdentityError::EmptyName);
        }

        let mut identity = TypeIdentity::new(name);
        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| TypeIdentityError::MalformedPart(part.to_string()))?;
            match key.trim() {
                "Version" => identity.version = Some(value.parse()?),
                "PublicKeyToken" => {
                    let value = value.trim();
                    if !value.eq_ignore_ascii_case("null") {
                        identity.token = Some(value.to_string());
                    }
                }
                // Culture and other qualifiers do not take part in identity.
                _ => {}
            }
        }
        Ok(identity)
    }
}

impl TryFrom<String> for TypeIdentity {
    type Error = TypeIdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TypeIdentity> for String {
    fn from(identity: TypeIdentity) -> Self {
        identity.to_string()
    }
}
