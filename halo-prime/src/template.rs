use std::collections::{BTreeMap, HashMap};

use halo_core::ShadowDesired;
use serde::Deserialize;

/// Default shadow configuration for one device type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceTypeTemplate {
    #[serde(default = "default_shadow_version")]
    pub shadow_version: u64,
    pub heartbeat_interval_secs: u32,
    pub sampling_interval_secs: u32,
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
}

fn default_shadow_version() -> u64 {
    1
}

impl Default for DeviceTypeTemplate {
    fn default() -> Self {
        Self {
            shadow_version: default_shadow_version(),
            heartbeat_interval_secs: 300,
            sampling_interval_secs: 300,
            thresholds: BTreeMap::new(),
            features: BTreeMap::new(),
        }
    }
}

impl DeviceTypeTemplate {
    pub fn shadow_desired(&self) -> ShadowDesired {
        ShadowDesired {
            version: self.shadow_version,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            sampling_interval_secs: self.sampling_interval_secs,
            thresholds: self.thresholds.clone(),
            features: self.features.clone(),
        }
    }
}

/// Templates of every configured device type, plus the generic fallback.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: HashMap<String, DeviceTypeTemplate>,
    fallback: DeviceTypeTemplate,
}

impl TemplateStore {
    pub fn new(
        templates: impl IntoIterator<Item = (String, DeviceTypeTemplate)>,
        fallback: DeviceTypeTemplate,
    ) -> Self {
        Self {
            templates: templates.into_iter().collect(),
            fallback,
        }
    }

    /// A device type is known exactly when it has a template.
    pub fn contains(&self, device_type: &str) -> bool {
        self.templates.contains_key(device_type)
    }

    pub fn get(&self, device_type: &str) -> Option<&DeviceTypeTemplate> {
        self.templates.get(device_type)
    }

    pub fn template_or_fallback(&self, device_type: &str) -> &DeviceTypeTemplate {
        self.get(device_type).unwrap_or(&self.fallback)
    }

    pub fn device_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.templates.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_uses_fallback_template() {
        let sensor = DeviceTypeTemplate {
            heartbeat_interval_secs: 60,
            sampling_interval_secs: 15,
            thresholds: BTreeMap::from([("temperatureHigh".to_string(), 45.0)]),
            ..DeviceTypeTemplate::default()
        };
        let store = TemplateStore::new(
            [("sensor".to_string(), sensor)],
            DeviceTypeTemplate::default(),
        );

        assert!(store.contains("sensor"));
        assert!(!store.contains("toaster"));
        assert_eq!(store.template_or_fallback("sensor").sampling_interval_secs, 15);
        assert_eq!(store.template_or_fallback("toaster").sampling_interval_secs, 300);

        let shadow = store.template_or_fallback("sensor").shadow_desired();
        assert_eq!(shadow.heartbeat_interval_secs, 60);
        assert_eq!(shadow.thresholds["temperatureHigh"], 45.0);
        assert_eq!(shadow.version, 1);
    }
}
