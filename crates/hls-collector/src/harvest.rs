// Optional pass-through persistence of downloaded manifests and fragments.

use crate::config::HarvestConfig;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestKind {
    Manifest,
    Fragment,
}

pub trait HarvestSink: Send + Sync {
    fn harvest(&self, url: &str, data: &[u8], kind: HarvestKind, prefix: &str);
}

/// Writes harvested files into a directory, named by the URL's final path
/// component with a track prefix (`main-`, `vid-`, `aud-`, `ifr-`).
pub struct DirectoryHarvester {
    config: HarvestConfig,
}

impl DirectoryHarvester {
    pub fn new(config: HarvestConfig) -> Self {
        Self { config }
    }

    fn path_for(&self, url: &str, prefix: &str) -> PathBuf {
        let basename = url
            .split('?')
            .next()
            .unwrap_or(url)
            .rsplit('/')
            .next()
            .unwrap_or(url);
        self.config.directory.join(format!("{prefix}{basename}"))
    }
}

impl HarvestSink for DirectoryHarvester {
    fn harvest(&self, url: &str, data: &[u8], kind: HarvestKind, prefix: &str) {
        let enabled = match kind {
            HarvestKind::Manifest => self.config.harvest_manifests,
            HarvestKind::Fragment => self.config.harvest_fragments,
        };
        if !enabled {
            return;
        }
        let path = self.path_for(url, prefix);
        match std::fs::write(&path, data) {
            Ok(()) => debug!(path = %path.display(), bytes = data.len(), "harvested"),
            Err(e) => warn!(path = %path.display(), error = %e, "harvest write failed"),
        }
    }
}
