//! Topic matching and protocol topic construction

use crate::config::TopicSection;

/// Check `topic` against an MQTT subscription `pattern`.
///
/// `+` matches exactly one level, `#` matches one or more remaining levels and
/// is only valid as the last segment. A `#` anywhere else never matches, and a
/// pattern with more levels than the topic never matches.
pub fn matches(topic: &str, pattern: &str) -> bool {
    let topic_levels: Vec<&str> = topic.split('/').collect();
    let pattern_levels: Vec<&str> = pattern.split('/').collect();

    for (i, level) in pattern_levels.iter().enumerate() {
        if *level == "#" {
            return i == pattern_levels.len() - 1 && i < topic_levels.len();
        }
        let Some(actual) = topic_levels.get(i) else {
            return false;
        };
        if *level != "+" && level != actual {
            return false;
        }
    }

    pattern_levels.len() == topic_levels.len()
}

/// Whether a subscription string carries wildcard segments
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.split('/').any(|level| level == "+" || level == "#")
}

/// The three protocol topics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Announce,
    Discover,
    Leave,
}

/// Protocol topic names resolved from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolTopics {
    announce: String,
    discover: String,
    leave: String,
}

impl ProtocolTopics {
    pub fn new(section: &TopicSection) -> Self {
        Self {
            announce: section.announce.clone(),
            discover: section.discover.clone(),
            leave: section.leave.clone(),
        }
    }

    pub fn name(&self, kind: TopicKind) -> &str {
        match kind {
            TopicKind::Announce => &self.announce,
            TopicKind::Discover => &self.discover,
            TopicKind::Leave => &self.leave,
        }
    }

    /// `announce/#`
    pub fn announce_filter(&self) -> String {
        format!("{}/#", self.announce)
    }

    /// `announce/{device_topic}`
    pub fn announce_topic(&self, device_topic: &str) -> String {
        format!("{}/{}", self.announce, device_topic)
    }

    /// Device topic an announcement was published for, if `topic` is one
    pub fn device_from_announce<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.announce.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|device| !device.is_empty())
    }
}

impl Default for ProtocolTopics {
    fn default() -> Self {
        Self::new(&TopicSection::default())
    }
}
