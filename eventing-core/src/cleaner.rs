use crate::error::ValidationError;

const SEPARATOR: char = '.';

/// Removes every character which is not an ASCII letter or digit.
pub fn clean_segment(value: &str) -> String {
    value.chars().filter(char::is_ascii_alphanumeric).collect()
}

/// Cleans an event source so it can be used as a single subject token.
pub fn clean_source(source: &str) -> String {
    clean_segment(source)
}

/// Merges event name tokens into exactly two cleaned segments.
///
/// The last token becomes the second segment, all tokens before it are concatenated into
/// the first one: `too.many.dots.object.do` turns into `toomanydotsobject` and `do`.
pub(crate) fn merge_event_name(tokens: &[&str]) -> (String, String) {
    match tokens.split_last() {
        Some((last, rest)) => (
            rest.iter().map(|token| clean_segment(token)).collect(),
            clean_segment(last),
        ),
        None => (String::new(), String::new()),
    }
}

/// Normalizes event types published by applications into subject-safe types.
///
/// After the configured prefix an event type consists of an application name, at least two
/// event name segments and a version. Characters which are not allowed in NATS subjects
/// are removed and surplus event name segments are merged.
#[derive(Clone, Debug, Default)]
pub struct EventTypeCleaner {
    prefix: String,
}

impl EventTypeCleaner {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn clean(&self, event_type: &str) -> Result<String, ValidationError> {
        let remainder = if self.prefix.is_empty() {
            event_type
        } else {
            event_type
                .strip_prefix(self.prefix.as_str())
                .and_then(|rest| rest.strip_prefix(SEPARATOR))
                .ok_or_else(|| ValidationError::PrefixMismatch {
                    prefix: self.prefix.clone(),
                    event_type: event_type.to_string(),
                })?
        };

        let tokens: Vec<&str> = remainder.split(SEPARATOR).collect();
        let [application_name, event_name @ .., version] = tokens.as_slice() else {
            return Err(ValidationError::IncompleteEventType {
                event_type: event_type.to_string(),
            });
        };
        if event_name.len() < 2 {
            return Err(ValidationError::IncompleteEventType {
                event_type: event_type.to_string(),
            });
        }

        let (event_name1, event_name2) = merge_event_name(event_name);
        let segments = [
            clean_segment(application_name),
            event_name1,
            event_name2,
            version.to_string(),
        ];
        if segments.iter().any(String::is_empty) {
            return Err(ValidationError::IncompleteEventType {
                event_type: event_type.to_string(),
            });
        }

        let cleaned = segments.join(".");
        if self.prefix.is_empty() {
            Ok(cleaned)
        } else {
            Ok(format!("{}.{}", self.prefix, cleaned))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EventTypeCleaner, clean_source};

    #[test]
    fn clean_event_types() {
        let assert_clean = |prefix: &str, given: &str, expected: &str| {
            let cleaner = EventTypeCleaner::new(prefix);
            assert_eq!(cleaner.clean(given).unwrap(), expected, "cleaning {given}");
        };

        assert_clean(
            "",
            "testapp.Segment1-Part1-Part2-Ä.Segment2-Part1-Part2-Ä.v1",
            "testapp.Segment1Part1Part2.Segment2Part1Part2.v1",
        );
        assert_clean(
            "prefix",
            "prefix.testapp.Segment1-Part1-Part2-Ä.Segment2-Part1-Part2-Ä.v1",
            "prefix.testapp.Segment1Part1Part2.Segment2Part1Part2.v1",
        );
        assert_clean(
            "prefix",
            "prefix.te--s__t!!a@@p##p%%.Segment1.Segment2.Segment3.Segment4-Part1-Part2-Ä.Segment5-Part1-Part2-Ä.v1",
            "prefix.testapp.Segment1Segment2Segment3Segment4Part1Part2.Segment5Part1Part2.v1",
        );
        assert_clean(
            "sap.kyma.custom",
            "sap.kyma.custom.commerce.order.created.v1",
            "sap.kyma.custom.commerce.order.created.v1",
        );
    }

    #[test]
    fn reject_invalid_event_types() {
        let cleaner = EventTypeCleaner::new("prefix");

        // Wrong prefix.
        assert!(
            cleaner
                .clean("invalid.prefix.testapp.Segment1.Segment2.v1")
                .is_err()
        );
        // Missing prefix.
        assert!(cleaner.clean("testapp.Segment1.Segment2.v1").is_err());
        // Only one event name segment.
        assert!(cleaner.clean("prefix.testapp.Segment1-Part1.v1").is_err());
        // Nothing left of the application name.
        assert!(cleaner.clean("prefix.--.Segment1.Segment2.v1").is_err());
    }

    #[test]
    fn clean_sources() {
        assert_eq!(clean_source("my-app_01"), "myapp01");
        assert_eq!(clean_source("noapp"), "noapp");
    }
}
