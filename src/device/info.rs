//! Device and feature descriptors as carried in announcements, plus diffing

use super::LookupError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity and capability snapshot of a device.
///
/// `topic` is the primary key everywhere and never changes once a device exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, rename = "serialNumber")]
    pub serial_number: String,
    #[serde(default, rename = "type")]
    pub device_type: String,
    /// Will-ID of the connection whose last will covers this device
    #[serde(
        default,
        rename = "lastWillID",
        skip_serializing_if = "String::is_empty"
    )]
    pub last_will_id: String,
    #[serde(default, rename = "feature")]
    pub features: BTreeMap<String, FeatureInfo>,
    /// Derived liveness flag, never transmitted
    #[serde(skip)]
    pub reachable: bool,
}

/// Capability descriptor of a single device feature
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FeatureInfo {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub min: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub step: i64,
    #[serde(default, rename = "getTopic", skip_serializing_if = "String::is_empty")]
    pub get_topic: String,
    #[serde(default, rename = "setTopic", skip_serializing_if = "String::is_empty")]
    pub set_topic: String,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// One field-level difference between two device snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoUpdate {
    pub field: String,
    pub old: String,
    pub new: String,
    /// Per-feature changes when `field` is `feature` and the feature was modified
    pub feature_info: Vec<InfoUpdate>,
}

impl InfoUpdate {
    pub fn new(field: impl Into<String>, old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            old: old.into(),
            new: new.into(),
            feature_info: Vec::new(),
        }
    }

    /// The synthetic change emitted when a device stops being reachable
    pub fn unreachable() -> Self {
        Self::new("reachable", "1", "0")
    }

    pub fn feature_added(name: &str) -> Self {
        Self::new("feature", "", name)
    }

    pub fn feature_removed(name: &str) -> Self {
        Self::new("feature", name, "")
    }

    pub fn feature_changed(name: &str, changes: Vec<InfoUpdate>) -> Self {
        Self {
            feature_info: changes,
            ..Self::new("feature", name, name)
        }
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn push_if_changed(updates: &mut Vec<InfoUpdate>, field: &str, old: &str, new: &str) {
    if old != new {
        updates.push(InfoUpdate::new(field, old, new));
    }
}

impl DeviceInfo {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    /// Builder method to add a feature
    pub fn with_feature(mut self, name: impl Into<String>, feature: FeatureInfo) -> Self {
        self.features.insert(name.into(), feature);
        self
    }

    /// Fill in default get/set topics for every feature that does not name one
    pub fn normalize(&mut self) {
        for (name, feature) in self.features.iter_mut() {
            if feature.get_topic.is_empty() {
                feature.get_topic = default_get_topic(&self.topic, name);
            }
            if feature.set_topic.is_empty() {
                feature.set_topic = default_set_topic(&self.topic, name);
            }
        }
    }

    /// Every topic the device's features are reachable on
    pub fn feature_topics(&self) -> Vec<String> {
        let mut topics = Vec::with_capacity(self.features.len() * 2);
        for feature in self.features.values() {
            for topic in [&feature.get_topic, &feature.set_topic] {
                if !topic.is_empty() && !topics.contains(topic) {
                    topics.push(topic.clone());
                }
            }
        }
        topics
    }

    /// Compute the changes needed to turn `self` into `new`.
    ///
    /// Both snapshots are expected to be normalized. Changing the topic is not
    /// an update but an identity mismatch.
    pub fn diff(&self, new: &DeviceInfo) -> Result<Vec<InfoUpdate>, LookupError> {
        if self.topic != new.topic {
            return Err(LookupError::InvalidOperation(format!(
                "device topic cannot change from '{}' to '{}'",
                self.topic, new.topic
            )));
        }

        let mut updates = Vec::new();
        push_if_changed(&mut updates, "name", &self.name, &new.name);
        push_if_changed(
            &mut updates,
            "manufacturer",
            &self.manufacturer,
            &new.manufacturer,
        );
        push_if_changed(&mut updates, "model", &self.model, &new.model);
        push_if_changed(
            &mut updates,
            "serialNumber",
            &self.serial_number,
            &new.serial_number,
        );
        push_if_changed(&mut updates, "type", &self.device_type, &new.device_type);
        push_if_changed(
            &mut updates,
            "lastWillID",
            &self.last_will_id,
            &new.last_will_id,
        );
        push_if_changed(
            &mut updates,
            "reachable",
            flag(self.reachable),
            flag(new.reachable),
        );

        for (name, old_feature) in &self.features {
            match new.features.get(name) {
                None => updates.push(InfoUpdate::feature_removed(name)),
                Some(new_feature) => {
                    let changes = old_feature.diff(new_feature);
                    if !changes.is_empty() {
                        updates.push(InfoUpdate::feature_changed(name, changes));
                    }
                }
            }
        }
        for name in new.features.keys() {
            if !self.features.contains_key(name) {
                updates.push(InfoUpdate::feature_added(name));
            }
        }

        Ok(updates)
    }
}

impl FeatureInfo {
    pub fn range(min: i64, max: i64, step: i64) -> Self {
        Self {
            min,
            max,
            step,
            ..Default::default()
        }
    }

    pub fn diff(&self, new: &FeatureInfo) -> Vec<InfoUpdate> {
        let mut updates = Vec::new();
        push_if_changed(&mut updates, "getTopic", &self.get_topic, &new.get_topic);
        push_if_changed(&mut updates, "setTopic", &self.set_topic, &new.set_topic);
        for (field, old, new) in [
            ("min", self.min, new.min),
            ("max", self.max, new.max),
            ("step", self.step, new.step),
        ] {
            if old != new {
                updates.push(InfoUpdate::new(field, old.to_string(), new.to_string()));
            }
        }
        updates
    }
}

pub fn default_get_topic(device_topic: &str, feature: &str) -> String {
    format!("{device_topic}/{feature}/get")
}

pub fn default_set_topic(device_topic: &str, feature: &str) -> String {
    format!("{device_topic}/{feature}/set")
}
