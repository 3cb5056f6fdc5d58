use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const DELIMITER_TOKEN: &str = ".";
const WILDCARD_TOKEN: &str = "*";
const FULL_WILDCARD_TOKEN: &str = ">";

type Token = String;

/// Filterable NATS subject.
///
/// For example: `hello.*.world` or `kyma.>`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subject(Vec<Token>);

impl Subject {
    fn new(value: &str) -> Self {
        Self(
            value
                .split(DELIMITER_TOKEN)
                .map(|value| value.to_string())
                .collect(),
        )
    }

    /// Returns true if a given, second subject is a sub-set of this one.
    ///
    /// The matching rules are quite simple in NATS and do not resemble typical "globbing" rules.
    /// `*` matches exactly one token, so `hello.*` does not match `hello.*.world` as both
    /// subjects need to have the same length. `>` matches one or more trailing tokens.
    pub fn is_matching(&self, other_subject: &Subject) -> bool {
        let mut tokens = self.0.iter();
        let mut other_tokens = other_subject.0.iter();

        loop {
            match (tokens.next(), other_tokens.next()) {
                (None, None) => return true,
                (Some(token), Some(other_token)) => {
                    if token == FULL_WILDCARD_TOKEN || other_token == FULL_WILDCARD_TOKEN {
                        return true;
                    }

                    if token == other_token
                        || token == WILDCARD_TOKEN
                        || other_token == WILDCARD_TOKEN
                    {
                        continue;
                    }

                    return false;
                }
                _ => return false,
            }
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(DELIMITER_TOKEN))
    }
}

impl FromStr for Subject {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Err(ValidationError::EmptySubject);
        }
        Ok(Self::new(value))
    }
}

impl Serialize for Subject {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Subject {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value: String = String::deserialize(deserializer)?;
        Self::from_str(&value).map_err(|err| serde::de::Error::custom(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::Subject;

    #[test]
    fn subject_filter_matching() {
        let assert_filter = |a: &str, b: &str, expected: bool| {
            assert!(
                Subject::from_str(a)
                    .unwrap()
                    .is_matching(&Subject::from_str(b).unwrap())
                    == expected,
                "{a} does not match {b}"
            );
        };

        assert_filter("a.*", "a.b", true);
        assert_filter("a.*", "a.b.c", false);
        assert_filter("a.*.c", "a.b.c", true);
        assert_filter("*.*", "a.b", true);
        assert_filter("*.c", "a.b.c", false);
        assert_filter("*.*", "a.b.c", false);
        assert_filter("*.*.*", "a.b.c", true);
        assert_filter("a.b", "a.b.c", false);
        assert_filter("a.b.*", "a.*.c", true);
        assert_filter("kyma.>", "kyma.app.order.created.v1", true);
        assert_filter("kyma.>", "kyma", false);
        assert_filter("kyma.>", "other.app", false);
    }

    #[test]
    fn empty_subject_is_rejected() {
        assert!(Subject::from_str("").is_err());
    }
}
