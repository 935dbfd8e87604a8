//! The `typed_id!` macro.

/// Declares a ULID-backed identifier type carrying a fixed string prefix.
///
/// The generated type serializes as its string form through
/// `TryFrom<String>`/`Into<String>`, so it can be used directly as a
/// map key or path parameter.
///
/// ```ignore
/// typed_id!(DeploymentId, "dep");
/// let id: DeploymentId = "dep_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse()?;
/// ```
#[macro_export]
macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[derive(serde::Serialize, serde::Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name($crate::Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Generates a fresh identifier.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            #[must_use]
            pub const fn ulid(&self) -> $crate::Ulid {
                self.0
            }

            pub fn parse(raw: &str) -> Result<Self, $crate::IdError> {
                if raw.is_empty() {
                    return Err($crate::IdError::Empty);
                }
                let (prefix, rest) = raw
                    .split_once('_')
                    .ok_or_else(|| $crate::IdError::MissingSeparator(raw.to_owned()))?;
                if prefix != $prefix {
                    return Err($crate::IdError::WrongKind {
                        expected: $prefix,
                        actual: prefix.to_owned(),
                    });
                }
                rest.parse::<$crate::Ulid>()
                    .map(Self)
                    .map_err(|e| $crate::IdError::InvalidUlid(e.to_string()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Self::parse(raw)
            }
        }

        impl TryFrom<String> for $name {
            type Error = $crate::IdError;

            fn try_from(raw: String) -> Result<Self, Self::Error> {
                Self::parse(&raw)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.to_string()
            }
        }
    };
}
