//! Built-in mirror table and the [`MirrorResolver`].

use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{SourceError, SourceInfo, SourceProbe, SourceResolver};
use crate::user_agent;

/// Key of the upstream hosts (no rewriting).
pub const OFFICIAL_SOURCE: &str = "official";

/// Key of the BMCLAPI mirror.
pub const BMCLAPI_SOURCE: &str = "bmclapi";

/// Source selected when nothing else is configured.
pub const DEFAULT_SOURCE: &str = BMCLAPI_SOURCE;

const BMCLAPI_BASE: &str = "https://bmclapi2.bangbang93.com";
const OFFICIAL_MANIFEST: &str = "https://piston-meta.mojang.com/mc/game/version_manifest.json";
const MANIFEST_PATH: &str = "/mc/game/version_manifest.json";

// Origin prefixes a mirror may replace.
const META_ORIGINS: [&str; 2] = [
    "https://launchermeta.mojang.com",
    "https://piston-meta.mojang.com",
];
const ASSETS_ORIGIN: &str = "https://resources.download.minecraft.net";
const LIBRARIES_ORIGIN: &str = "https://libraries.minecraft.net";
const FORGE_ORIGIN: &str = "https://files.minecraftforge.net/maven";
const FABRIC_META_ORIGIN: &str = "https://meta.fabricmc.net";
const FABRIC_MAVEN_ORIGIN: &str = "https://maven.fabricmc.net";
const NEOFORGE_ORIGIN: &str = "https://maven.neoforged.net/releases/net/neoforged";

/// Prefix table for one download host.
///
/// A `None` target leaves matching URLs on their origin host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorDefinition {
    key: String,
    label: String,
    probe_url: String,
    meta: Option<String>,
    assets: Option<String>,
    libraries: Option<String>,
    forge: Option<String>,
    fabric_meta: Option<String>,
    neoforge: Option<String>,
    timeout: Duration,
}

impl MirrorDefinition {
    /// Upstream hosts, no rewriting.
    #[must_use]
    pub fn official() -> Self {
        Self {
            key: OFFICIAL_SOURCE.to_string(),
            label: "Official".to_string(),
            probe_url: OFFICIAL_MANIFEST.to_string(),
            meta: None,
            assets: None,
            libraries: None,
            forge: None,
            fabric_meta: None,
            neoforge: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// The BMCLAPI mirror.
    #[must_use]
    pub fn bmclapi() -> Self {
        Self {
            key: BMCLAPI_SOURCE.to_string(),
            label: "BMCLAPI".to_string(),
            ..Self::mirror_layout(BMCLAPI_SOURCE, BMCLAPI_BASE)
        }
    }

    /// A host that mirrors the BMCLAPI path layout under `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidSource`] when `base_url` is not an
    /// absolute http(s) URL or `key` is empty.
    pub fn custom(
        key: impl Into<String>,
        label: impl Into<String>,
        base_url: &str,
    ) -> Result<Self, SourceError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(SourceError::invalid(key, "key must not be empty"));
        }
        match Url::parse(base_url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            _ => return Err(SourceError::invalid(key, format!("bad base url {base_url}"))),
        }
        Ok(Self {
            label: label.into(),
            ..Self::mirror_layout(&key, base_url)
        })
    }

    fn mirror_layout(key: &str, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            key: key.to_string(),
            label: key.to_string(),
            probe_url: format!("{base}{MANIFEST_PATH}"),
            meta: Some(base.to_string()),
            assets: Some(format!("{base}/assets")),
            libraries: Some(format!("{base}/maven")),
            forge: Some(format!("{base}/maven")),
            fabric_meta: Some(format!("{base}/fabric-meta")),
            neoforge: Some(format!("{base}/maven/net/neoforged")),
            timeout: Duration::from_secs(15),
        }
    }

    /// Overrides the request timeout used for probes and fallback fetches.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Source key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Display label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// URL fetched by latency probes.
    #[must_use]
    pub fn probe_url(&self) -> &str {
        &self.probe_url
    }

    /// Maps `url` onto this host, or returns it unchanged.
    #[must_use]
    pub fn rewrite(&self, url: &str) -> String {
        let rules = [
            (META_ORIGINS[0], self.meta.as_deref()),
            (META_ORIGINS[1], self.meta.as_deref()),
            (ASSETS_ORIGIN, self.assets.as_deref()),
            (LIBRARIES_ORIGIN, self.libraries.as_deref()),
            (FORGE_ORIGIN, self.forge.as_deref()),
            (FABRIC_META_ORIGIN, self.fabric_meta.as_deref()),
            (FABRIC_MAVEN_ORIGIN, self.libraries.as_deref()),
            (NEOFORGE_ORIGIN, self.neoforge.as_deref()),
        ];
        for (origin, target) in rules {
            if let Some(rest) = url.strip_prefix(origin) {
                return match target {
                    Some(target) => format!("{target}{rest}"),
                    None => url.to_string(),
                };
            }
        }
        url.to_string()
    }

    fn is_built_in(key: &str) -> bool {
        key == OFFICIAL_SOURCE || key == BMCLAPI_SOURCE
    }
}

#[derive(Debug)]
struct MirrorState {
    sources: Vec<MirrorDefinition>,
    current: String,
    fallback_enabled: bool,
}

/// Mirror table with a selectable current source.
///
/// Interior mutability lets one resolver be shared (`Arc<dyn SourceResolver>`)
/// between the scheduler and whoever switches sources.
#[derive(Debug)]
pub struct MirrorResolver {
    client: Client,
    state: RwLock<MirrorState>,
}

impl MirrorResolver {
    /// Official and BMCLAPI sources, BMCLAPI selected.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Client`] if the probe client cannot be built.
    pub fn new() -> Result<Self, SourceError> {
        Self::from_sources(
            vec![MirrorDefinition::official(), MirrorDefinition::bmclapi()],
            DEFAULT_SOURCE,
        )
    }

    /// An explicit source list in preference order.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::UnknownSource`] when `current` is not in the list,
    /// or [`SourceError::Client`] if the probe client cannot be built.
    pub fn from_sources(
        sources: Vec<MirrorDefinition>,
        current: &str,
    ) -> Result<Self, SourceError> {
        if !sources.iter().any(|s| s.key == current) {
            return Err(SourceError::unknown(current));
        }
        let client = Client::builder()
            .user_agent(user_agent::default_probe_user_agent())
            .gzip(true)
            .build()
            .map_err(|source| SourceError::Client { source })?;
        Ok(Self {
            client,
            state: RwLock::new(MirrorState {
                sources,
                current: current.to_string(),
                fallback_enabled: true,
            }),
        })
    }

    /// Key of the active source.
    #[must_use]
    pub fn current(&self) -> String {
        self.read().current.clone()
    }

    /// Switches the active source.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::UnknownSource`] for unknown keys.
    pub fn set_current(&self, key: &str) -> Result<(), SourceError> {
        let mut state = self.write();
        if !state.sources.iter().any(|s| s.key == key) {
            return Err(SourceError::unknown(key));
        }
        info!(from = %state.current, to = key, "download source switched");
        state.current = key.to_string();
        Ok(())
    }

    /// Adds a mirror, or replaces a custom one with the same key.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::BuiltIn`] when the key names a built-in source.
    pub fn add_custom_source(&self, definition: MirrorDefinition) -> Result<(), SourceError> {
        if MirrorDefinition::is_built_in(&definition.key) {
            return Err(SourceError::built_in(definition.key));
        }
        let mut state = self.write();
        if let Some(existing) = state.sources.iter_mut().find(|s| s.key == definition.key) {
            *existing = definition;
        } else {
            debug!(key = %definition.key, "custom source added");
            state.sources.push(definition);
        }
        Ok(())
    }

    /// Removes a custom mirror. The active source falls back to the default
    /// when it is the one removed.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::BuiltIn`] for built-in keys and
    /// [`SourceError::UnknownSource`] for unknown ones.
    pub fn remove_source(&self, key: &str) -> Result<(), SourceError> {
        if MirrorDefinition::is_built_in(key) {
            return Err(SourceError::built_in(key));
        }
        let mut state = self.write();
        let before = state.sources.len();
        state.sources.retain(|s| s.key != key);
        if state.sources.len() == before {
            return Err(SourceError::unknown(key));
        }
        if state.current == key {
            let fallback = if state.sources.iter().any(|s| s.key == DEFAULT_SOURCE) {
                DEFAULT_SOURCE.to_string()
            } else {
                state.sources.first().map(|s| s.key.clone()).unwrap_or_default()
            };
            state.current = fallback;
        }
        Ok(())
    }

    /// Whether [`fetch_with_fallback`](Self::fetch_with_fallback) tries the
    /// other sources after the active one fails.
    pub fn set_fallback_enabled(&self, enabled: bool) {
        self.write().fallback_enabled = enabled;
    }

    /// Rewrites `url` for a specific source.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::UnknownSource`] for unknown keys.
    pub fn transform_url_for(&self, url: &str, key: &str) -> Result<String, SourceError> {
        let state = self.read();
        state
            .sources
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.rewrite(url))
            .ok_or_else(|| SourceError::unknown(key))
    }

    /// Probes every source concurrently; results follow list order.
    pub async fn test_all(&self) -> Vec<SourceProbe> {
        let definitions = self.read().sources.clone();
        join_all(definitions.iter().map(|d| self.probe(d))).await
    }

    /// Probes every source and activates the fastest reachable one.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NoneReachable`] when every probe fails.
    pub async fn select_best(&self) -> Result<String, SourceError> {
        let probes = self.test_all().await;
        let best = probes
            .into_iter()
            .filter(|p| p.success)
            .min_by_key(|p| p.latency)
            .ok_or(SourceError::NoneReachable)?;
        self.set_current(&best.key)?;
        info!(key = %best.key, latency_ms = best.latency_ms(), "selected fastest source");
        Ok(best.key)
    }

    /// GETs `url` through the active source, then through every other source
    /// in list order when fallback is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::AllSourcesFailed`] with the last failure.
    #[instrument(skip(self))]
    pub async fn fetch_with_fallback(&self, url: &str) -> Result<reqwest::Response, SourceError> {
        let attempts = {
            let state = self.read();
            let mut ordered: Vec<MirrorDefinition> = state
                .sources
                .iter()
                .filter(|s| s.key == state.current)
                .cloned()
                .collect();
            if state.fallback_enabled {
                ordered.extend(state.sources.iter().filter(|s| s.key != state.current).cloned());
            }
            ordered
        };

        let mut last = String::from("no sources configured");
        for definition in &attempts {
            let target = definition.rewrite(url);
            match self
                .client
                .get(&target)
                .timeout(definition.timeout)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    debug!(source = %definition.key, url = %target, "fetched");
                    return Ok(response);
                }
                Ok(response) => {
                    last = format!("{}: HTTP {}", definition.key, response.status().as_u16());
                }
                Err(error) => {
                    last = format!("{}: {error}", definition.key);
                }
            }
            warn!(source = %definition.key, error = %last, "source failed, trying next");
        }
        Err(SourceError::AllSourcesFailed {
            url: url.to_string(),
            last,
        })
    }

    #[instrument(skip(self, definition), fields(source = %definition.key))]
    async fn probe(&self, definition: &MirrorDefinition) -> SourceProbe {
        let started = Instant::now();
        let result = self
            .client
            .get(&definition.probe_url)
            .timeout(definition.timeout)
            .send()
            .await;
        let latency = started.elapsed();
        let probe = match result {
            Ok(response) if response.status().is_success() => SourceProbe {
                key: definition.key.clone(),
                success: true,
                latency,
                status: Some(response.status().as_u16()),
                message: format!("reachable in {}ms", latency.as_millis()),
            },
            Ok(response) => SourceProbe {
                key: definition.key.clone(),
                success: false,
                latency,
                status: Some(response.status().as_u16()),
                message: format!("HTTP {}", response.status().as_u16()),
            },
            Err(error) => SourceProbe {
                key: definition.key.clone(),
                success: false,
                latency,
                status: None,
                message: error.to_string(),
            },
        };
        debug!(success = probe.success, latency_ms = probe.latency_ms(), "probe finished");
        probe
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MirrorState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MirrorState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SourceResolver for MirrorResolver {
    fn transform_url(&self, url: &str) -> String {
        let state = self.read();
        state
            .sources
            .iter()
            .find(|s| s.key == state.current)
            .map_or_else(|| url.to_string(), |s| s.rewrite(url))
    }

    async fn test_latency(&self, key: &str) -> SourceProbe {
        let definition = self.read().sources.iter().find(|s| s.key == key).cloned();
        match definition {
            Some(definition) => self.probe(&definition).await,
            None => SourceProbe {
                key: key.to_string(),
                success: false,
                latency: Duration::ZERO,
                status: None,
                message: SourceError::unknown(key).to_string(),
            },
        }
    }

    fn list_sources(&self) -> Vec<SourceInfo> {
        self.read()
            .sources
            .iter()
            .map(|s| SourceInfo {
                key: s.key.clone(),
                label: s.label.clone(),
            })
            .collect()
    }
}
