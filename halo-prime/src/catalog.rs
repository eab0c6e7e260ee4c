use halo_core::FirmwareChannel;
use serde::Deserialize;

use crate::config::ChannelMap;

/// A published firmware image.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FirmwareArtifact {
    pub version: String,
    pub build: String,
    /// Devices must install this image as soon as constraints allow.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

impl FirmwareArtifact {
    pub fn new(version: impl Into<String>, build: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            build: build.into(),
            force: false,
            checksum: None,
            size_bytes: None,
        }
    }
}

/// Lookup of the newest artifact published on each channel.
pub trait ArtifactCatalog: Send + Sync + 'static {
    fn latest(&self, channel: FirmwareChannel) -> Option<FirmwareArtifact>;
}

/// Catalogue fixed at startup from the `[ota.artifacts]` config section.
#[derive(Debug, Clone, Default)]
pub struct StaticArtifactCatalog {
    artifacts: ChannelMap<FirmwareArtifact>,
}

impl StaticArtifactCatalog {
    pub fn new(artifacts: ChannelMap<FirmwareArtifact>) -> Self {
        Self { artifacts }
    }
}

impl ArtifactCatalog for StaticArtifactCatalog {
    fn latest(&self, channel: FirmwareChannel) -> Option<FirmwareArtifact> {
        self.artifacts.get(channel).cloned()
    }
}
