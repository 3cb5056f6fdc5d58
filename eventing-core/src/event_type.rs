use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cleaner::{clean_segment, merge_event_name};
use crate::error::ValidationError;

const SEPARATOR: char = '.';
const NUM_SEGMENTS: usize = 7;

/// Position of a segment inside an [`EventType`].
///
/// The positions are fixed by the schema: `<prefix1>.<prefix2>.<prefix3>.<application
/// name>.<event name 1>.<event name 2>.<version>`, for example
/// `sap.kyma.custom.commerce.order.created.v1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Segment {
    Prefix1,
    Prefix2,
    Prefix3,
    ApplicationName,
    EventName1,
    EventName2,
    Version,
}

impl Segment {
    pub const ALL: [Segment; NUM_SEGMENTS] = [
        Segment::Prefix1,
        Segment::Prefix2,
        Segment::Prefix3,
        Segment::ApplicationName,
        Segment::EventName1,
        Segment::EventName2,
        Segment::Version,
    ];

    /// Human readable name used in validation errors.
    pub fn label(&self) -> &'static str {
        match self {
            Segment::Prefix1 => "prefix 1",
            Segment::Prefix2 => "prefix 2",
            Segment::Prefix3 => "prefix 3",
            Segment::ApplicationName => "application name",
            Segment::EventName1 => "event name 1",
            Segment::EventName2 => "event name 2",
            Segment::Version => "version",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Cloud event `type` attribute modelled as seven ordered segments.
///
/// The serialized string is recomputed on every mutation, so `as_str` always reflects the
/// current segments. Empty segments are skipped when joining while the remaining segments
/// keep their schema order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct EventType {
    segments: [String; NUM_SEGMENTS],
    value: String,
}

impl EventType {
    /// Builds a well-formed event type, every segment must be present.
    pub fn build(
        prefix1: &str,
        prefix2: &str,
        prefix3: &str,
        application_name: &str,
        event_name1: &str,
        event_name2: &str,
        version: &str,
    ) -> Result<Self, ValidationError> {
        let segments = [
            prefix1,
            prefix2,
            prefix3,
            application_name,
            event_name1,
            event_name2,
            version,
        ];

        for segment in Segment::ALL {
            validate_segment(segment, segments[segment.index()])?;
        }

        Ok(Self::from_segments(segments.map(String::from)))
    }

    /// Builds an event type from the parts of a legacy publish request.
    ///
    /// The prefix needs to have three segments. The application name and the event name
    /// get cleaned, surplus event name segments are merged into the first one.
    pub fn from_legacy(
        prefix: &str,
        application_name: &str,
        event_name: &str,
        version: &str,
    ) -> Result<Self, ValidationError> {
        let prefixes: Vec<&str> = prefix.split(SEPARATOR).collect();
        let [prefix1, prefix2, prefix3] = prefixes.as_slice() else {
            return Err(ValidationError::InvalidPrefix {
                prefix: prefix.to_string(),
            });
        };

        let tokens: Vec<&str> = event_name.split(SEPARATOR).collect();
        let (event_name1, event_name2) = match tokens.as_slice() {
            [] | [_] => (String::new(), clean_segment(event_name)),
            tokens => merge_event_name(tokens),
        };

        Self::build(
            prefix1,
            prefix2,
            prefix3,
            &clean_segment(application_name),
            &event_name1,
            &event_name2,
            version,
        )
    }

    /// Splits a type string into segments without validating it.
    ///
    /// Up to seven tokens are assigned from the left. With more than seven tokens the
    /// surplus ones in the middle are joined into the first event name segment, so that
    /// nothing of the original string is lost.
    pub fn parse(value: &str) -> Self {
        let tokens: Vec<&str> = value.split(SEPARATOR).collect();
        let mut segments: [String; NUM_SEGMENTS] = Default::default();

        if tokens.len() <= NUM_SEGMENTS {
            for (index, token) in tokens.iter().enumerate() {
                segments[index] = token.to_string();
            }
        } else {
            let last = tokens.len() - 1;
            for (index, token) in tokens.iter().take(Segment::EventName1.index()).enumerate() {
                segments[index] = token.to_string();
            }
            segments[Segment::EventName1.index()] =
                tokens[Segment::EventName1.index()..last - 1].join(".");
            segments[Segment::EventName2.index()] = tokens[last - 1].to_string();
            segments[Segment::Version.index()] = tokens[last].to_string();
        }

        Self::from_segments(segments)
    }

    fn from_segments(segments: [String; NUM_SEGMENTS]) -> Self {
        let mut event_type = Self {
            segments,
            value: String::new(),
        };
        event_type.serialize_segments();
        event_type
    }

    fn serialize_segments(&mut self) {
        self.value = self
            .segments
            .iter()
            .filter(|segment| !segment.is_empty())
            .map(String::as_str)
            .collect::<Vec<&str>>()
            .join(".");
    }

    /// Returns true if all seven segments are present and none contains a separator.
    pub fn is_well_formed(&self) -> bool {
        Segment::ALL
            .iter()
            .all(|segment| validate_segment(*segment, self.segment(*segment)).is_ok())
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn segment(&self, segment: Segment) -> &str {
        &self.segments[segment.index()]
    }

    /// Replaces a segment and re-serializes the type.
    pub fn set_segment(&mut self, segment: Segment, value: impl Into<String>) {
        self.segments[segment.index()] = value.into();
        self.serialize_segments();
    }

    pub fn prefix1(&self) -> &str {
        self.segment(Segment::Prefix1)
    }

    pub fn prefix2(&self) -> &str {
        self.segment(Segment::Prefix2)
    }

    pub fn prefix3(&self) -> &str {
        self.segment(Segment::Prefix3)
    }

    pub fn application_name(&self) -> &str {
        self.segment(Segment::ApplicationName)
    }

    pub fn event_name1(&self) -> &str {
        self.segment(Segment::EventName1)
    }

    pub fn event_name2(&self) -> &str {
        self.segment(Segment::EventName2)
    }

    pub fn version(&self) -> &str {
        self.segment(Segment::Version)
    }

    pub fn set_prefix1(&mut self, value: impl Into<String>) {
        self.set_segment(Segment::Prefix1, value);
    }

    pub fn set_prefix2(&mut self, value: impl Into<String>) {
        self.set_segment(Segment::Prefix2, value);
    }

    pub fn set_prefix3(&mut self, value: impl Into<String>) {
        self.set_segment(Segment::Prefix3, value);
    }

    pub fn set_application_name(&mut self, value: impl Into<String>) {
        self.set_segment(Segment::ApplicationName, value);
    }

    pub fn set_event_name1(&mut self, value: impl Into<String>) {
        self.set_segment(Segment::EventName1, value);
    }

    pub fn set_event_name2(&mut self, value: impl Into<String>) {
        self.set_segment(Segment::EventName2, value);
    }

    pub fn set_version(&mut self, value: impl Into<String>) {
        self.set_segment(Segment::Version, value);
    }
}

fn validate_segment(segment: Segment, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::MissingSegment {
            segment: segment.label(),
        });
    }

    if value.contains(SEPARATOR) {
        return Err(ValidationError::SeparatorInSegment {
            segment: segment.label(),
            value: value.to_string(),
        });
    }

    Ok(())
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(value))
    }
}

impl Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.value)
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value: String = String::deserialize(deserializer)?;
        Ok(Self::parse(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::{EventType, Segment};
    use crate::ValidationError;

    fn order_created() -> EventType {
        EventType::build("a", "b", "c", "app1", "order", "created", "v1").unwrap()
    }

    #[test]
    fn build_and_serialize() {
        let event_type = order_created();
        assert_eq!(event_type.as_str(), "a.b.c.app1.order.created.v1");
        assert_eq!(event_type.to_string(), "a.b.c.app1.order.created.v1");
        assert!(event_type.is_well_formed());
    }

    #[test]
    fn build_rejects_missing_segment() {
        let err = EventType::build("a", "b", "c", "", "order", "created", "v1").unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingSegment {
                segment: "application name"
            }
        );
        assert!(err.to_string().contains("application name"));

        let err = EventType::build("a", "b", "c", "app", "order", "created", "").unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn build_rejects_separator_in_segment() {
        let err = EventType::build("a", "b", "c", "app", "order.x", "created", "v1").unwrap_err();
        assert!(matches!(
            err,
            ValidationError::SeparatorInSegment {
                segment: "event name 1",
                ..
            }
        ));
    }

    #[test]
    fn parse_reverses_serialize() {
        let cases = [
            ["a", "b", "c", "app1", "order", "created", "v1"],
            ["sap", "kyma", "custom", "commerce", "order", "created", "v1"],
            ["x", "x", "x", "x", "x", "x", "x"],
            ["Prefix", "ONE", "t3st", "MyApp42", "Order", "Created", "V10"],
            ["1", "22", "333", "4444", "55555", "666666", "7777777"],
            ["p", "p", "q", "appA", "appA", "v1", "v1"],
        ];

        for [prefix1, prefix2, prefix3, application, name1, name2, version] in cases {
            let event_type =
                EventType::build(prefix1, prefix2, prefix3, application, name1, name2, version)
                    .unwrap();
            let parsed = EventType::parse(&event_type.to_string());
            assert_eq!(parsed, event_type, "round trip of {event_type}");
            for segment in Segment::ALL {
                assert_eq!(parsed.segment(segment), event_type.segment(segment));
            }
        }
    }

    #[test]
    fn parse_is_lenient() {
        let short = EventType::parse("a.b.c");
        assert_eq!(short.prefix3(), "c");
        assert_eq!(short.application_name(), "");
        assert!(!short.is_well_formed());
        assert_eq!(short.as_str(), "a.b.c");

        let long = EventType::parse("a.b.c.app.one.two.three.created.v1");
        assert_eq!(long.application_name(), "app");
        assert_eq!(long.event_name1(), "one.two.three");
        assert_eq!(long.event_name2(), "created");
        assert_eq!(long.version(), "v1");
        assert_eq!(long.as_str(), "a.b.c.app.one.two.three.created.v1");
    }

    #[test]
    fn setters_keep_serialization_consistent() {
        let mut event_type = order_created();

        event_type.set_application_name("shop");
        assert_eq!(event_type.as_str(), "a.b.c.shop.order.created.v1");

        event_type.set_version("v2");
        assert_eq!(event_type.as_str(), "a.b.c.shop.order.created.v2");
        assert_eq!(event_type.version(), "v2");

        // Empty segments are skipped, the others keep their position.
        event_type.set_prefix1("");
        assert_eq!(event_type.as_str(), "b.c.shop.order.created.v2");
        assert!(!event_type.is_well_formed());
        assert_eq!(event_type.prefix2(), "b");

        event_type.set_prefix1("a");
        assert!(event_type.is_well_formed());
    }

    #[test]
    fn empty_middle_segment_does_not_truncate() {
        let mut event_type = order_created();
        event_type.set_prefix3("");
        assert_eq!(event_type.as_str(), "a.b.app1.order.created.v1");
    }

    #[test]
    fn legacy_event_types() {
        let assert_legacy = |application: &str, event_name: &str, expected: &str| {
            let event_type =
                EventType::from_legacy("pre1.pre2.pre3", application, event_name, "v1").unwrap();
            assert_eq!(event_type.as_str(), expected);
        };

        assert_legacy("app", "object.do", "pre1.pre2.pre3.app.object.do.v1");
        assert_legacy("no-app", "object.do", "pre1.pre2.pre3.noapp.object.do.v1");
        assert_legacy(
            "app",
            "too.many.dots.object.do",
            "pre1.pre2.pre3.app.toomanydotsobject.do.v1",
        );
    }

    #[test]
    fn legacy_event_type_needs_three_prefix_segments() {
        let err = EventType::from_legacy("pre1.pre2", "app", "object.do", "v1").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPrefix { .. }));

        let err = EventType::from_legacy("pre1.pre2.pre3", "app", "object", "v1").unwrap_err();
        assert!(err.to_string().contains("event name 1"));
    }

    #[test]
    fn serde_uses_type_string() {
        let event_type = order_created();
        let yaml = serde_yaml::to_string(&event_type).unwrap();
        assert_eq!(yaml.trim(), "a.b.c.app1.order.created.v1");
        let back: EventType = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, event_type);
    }
}
