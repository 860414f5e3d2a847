//! Version descriptor and asset index documents.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use super::rules::{Platform, Rule, rules_allow};
use super::{ASSET_BASE_URL, ExpectedFile, FileKind, ManifestError};

/// A downloadable file reference.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Artifact {
    /// Repository-relative path (libraries only).
    #[serde(default)]
    pub path: Option<String>,
    /// Hex SHA-1 digest.
    #[serde(default)]
    pub sha1: Option<String>,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Origin URL.
    pub url: String,
}

/// `downloads` block of a version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VersionDownloads {
    /// The client JAR.
    #[serde(default)]
    pub client: Option<Artifact>,
}

/// Reference to the asset index used by a version.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AssetIndexRef {
    /// Index id; the file lands at `assets/indexes/<id>.json`.
    pub id: String,
    /// Hex SHA-1 digest.
    #[serde(default)]
    pub sha1: Option<String>,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Origin URL.
    pub url: String,
}

/// `downloads` block of a library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LibraryDownloads {
    /// The main archive.
    #[serde(default)]
    pub artifact: Option<Artifact>,
    /// Classifier archives, natives among them.
    #[serde(default)]
    pub classifiers: BTreeMap<String, Artifact>,
}

/// One library entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Library {
    /// Maven coordinate `group:artifact:version`.
    pub name: String,
    /// Explicit download table.
    #[serde(default)]
    pub downloads: Option<LibraryDownloads>,
    /// Maven repository base, for loader libraries that only carry a coordinate.
    #[serde(default)]
    pub url: Option<String>,
    /// OS name to classifier template (may contain `${arch}`).
    #[serde(default)]
    pub natives: BTreeMap<String, String>,
    /// Platform rules.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// A logging configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingFile {
    /// File name under `assets/log_configs/`.
    pub id: String,
    /// Hex SHA-1 digest.
    #[serde(default)]
    pub sha1: Option<String>,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Origin URL.
    pub url: String,
}

/// `logging.client` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingEntry {
    /// The config file.
    pub file: LoggingFile,
}

/// `logging` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Logging {
    /// Client-side logging config.
    #[serde(default)]
    pub client: Option<LoggingEntry>,
}

/// A version descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionManifest {
    /// Version id; names the `versions/<id>/` directory.
    pub id: String,
    /// Client downloads.
    #[serde(default)]
    pub downloads: VersionDownloads,
    /// Asset index reference.
    #[serde(default)]
    pub asset_index: Option<AssetIndexRef>,
    /// Libraries in declaration order.
    #[serde(default)]
    pub libraries: Vec<Library>,
    /// Logging configuration.
    #[serde(default)]
    pub logging: Logging,
}

impl VersionManifest {
    /// Parses a descriptor from raw JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Parse`] on malformed input.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ManifestError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Reads and parses a descriptor from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Io`] or [`ManifestError::Parse`].
    pub async fn load(path: &Path) -> Result<Self, ManifestError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ManifestError::io(path, source))?;
        Self::from_slice(&bytes)
    }

    /// Destination of the asset index inside `game_dir`.
    #[must_use]
    pub fn asset_index_path(&self, game_dir: &Path) -> Option<PathBuf> {
        self.asset_index.as_ref().map(|index| {
            game_dir
                .join("assets")
                .join("indexes")
                .join(format!("{}.json", index.id))
        })
    }

    /// Every file this version needs on `platform`, assets excluded.
    ///
    /// Libraries are filtered by their rules; a library appearing twice with
    /// the same destination is listed once.
    #[must_use]
    pub fn expected_files(&self, game_dir: &Path, platform: &Platform) -> Vec<ExpectedFile> {
        let mut files = Vec::new();

        if let Some(client) = &self.downloads.client {
            files.push(ExpectedFile {
                kind: FileKind::Client,
                url: client.url.clone(),
                path: game_dir
                    .join("versions")
                    .join(&self.id)
                    .join(format!("{}.jar", self.id)),
                size: client.size,
                sha1: client.sha1.clone(),
            });
        }

        if let (Some(index), Some(path)) = (&self.asset_index, self.asset_index_path(game_dir)) {
            files.push(ExpectedFile {
                kind: FileKind::AssetIndex,
                url: index.url.clone(),
                path,
                size: index.size,
                sha1: index.sha1.clone(),
            });
        }

        let libraries_dir = game_dir.join("libraries");
        let mut seen = HashSet::new();
        for library in &self.libraries {
            if !rules_allow(&library.rules, platform) {
                debug!(library = %library.name, "library excluded by rules");
                continue;
            }
            for file in library_files(library, &libraries_dir, platform) {
                if seen.insert(file.path.clone()) {
                    files.push(file);
                }
            }
        }

        if let Some(entry) = &self.logging.client {
            files.push(ExpectedFile {
                kind: FileKind::Logging,
                url: entry.file.url.clone(),
                path: game_dir
                    .join("assets")
                    .join("log_configs")
                    .join(&entry.file.id),
                size: entry.file.size,
                sha1: entry.file.sha1.clone(),
            });
        }

        files
    }
}

fn library_files(library: &Library, libraries_dir: &Path, platform: &Platform) -> Vec<ExpectedFile> {
    let mut files = Vec::new();
    let downloads = library.downloads.as_ref();

    match downloads.and_then(|d| d.artifact.as_ref()) {
        Some(artifact) => {
            let relative = artifact
                .path
                .clone()
                .or_else(|| maven_path(&library.name, None));
            if let Some(relative) = relative {
                files.push(artifact_file(FileKind::Library, artifact, libraries_dir, &relative));
            }
        }
        None => {
            if downloads.is_none()
                && let (Some(base), Some(relative)) =
                    (library.url.as_deref(), maven_path(&library.name, None))
            {
                files.push(ExpectedFile {
                    kind: FileKind::Library,
                    url: format!("{}/{relative}", base.trim_end_matches('/')),
                    path: libraries_dir.join(&relative),
                    size: 0,
                    sha1: None,
                });
            }
        }
    }

    if let Some(template) = library.natives.get(platform.os.as_str()) {
        let classifier = template.replace("${arch}", platform.arch_bits());
        if let Some(artifact) = downloads.and_then(|d| d.classifiers.get(&classifier)) {
            let relative = artifact
                .path
                .clone()
                .or_else(|| maven_path(&library.name, Some(&classifier)));
            if let Some(relative) = relative {
                files.push(artifact_file(FileKind::Natives, artifact, libraries_dir, &relative));
            }
        } else {
            debug!(library = %library.name, classifier = %classifier, "natives classifier missing");
        }
    }

    files
}

fn artifact_file(kind: FileKind, artifact: &Artifact, root: &Path, relative: &str) -> ExpectedFile {
    ExpectedFile {
        kind,
        url: artifact.url.clone(),
        path: root.join(relative),
        size: artifact.size,
        sha1: artifact.sha1.clone(),
    }
}

/// Repository path of a Maven coordinate `group:artifact:version[:classifier]`.
///
/// ```
/// use assetfetch_core::manifest::maven_path;
///
/// assert_eq!(
///     maven_path("org.lwjgl:lwjgl:3.3.1", Some("natives-linux")).as_deref(),
///     Some("org/lwjgl/lwjgl/3.3.1/lwjgl-3.3.1-natives-linux.jar"),
/// );
/// ```
#[must_use]
pub fn maven_path(coordinate: &str, classifier: Option<&str>) -> Option<String> {
    let mut parts = coordinate.split(':');
    let group = parts.next().filter(|s| !s.is_empty())?;
    let artifact = parts.next().filter(|s| !s.is_empty())?;
    let version = parts.next().filter(|s| !s.is_empty())?;
    let classifier = classifier.or_else(|| parts.next());
    let file = match classifier {
        Some(classifier) => format!("{artifact}-{version}-{classifier}.jar"),
        None => format!("{artifact}-{version}.jar"),
    };
    Some(format!(
        "{}/{artifact}/{version}/{file}",
        group.replace('.', "/")
    ))
}

/// One object in an asset index.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AssetObject {
    /// Hex SHA-1 of the content; also its storage key.
    pub hash: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
}

/// An asset index: logical names mapped onto content-addressed objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AssetIndex {
    /// Logical name to object.
    #[serde(default)]
    pub objects: BTreeMap<String, AssetObject>,
}

impl AssetIndex {
    /// Parses an index from raw JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Parse`] on malformed input.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ManifestError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Reads and parses an index from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Io`] or [`ManifestError::Parse`].
    pub async fn load(path: &Path) -> Result<Self, ManifestError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ManifestError::io(path, source))?;
        Self::from_slice(&bytes)
    }

    /// One file per distinct object hash under `assets/objects/<hh>/<hash>`.
    /// Objects with a malformed hash are skipped.
    #[must_use]
    pub fn expected_files(&self, game_dir: &Path) -> Vec<ExpectedFile> {
        let objects_dir = game_dir.join("assets").join("objects");
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for (name, object) in &self.objects {
            let Some(prefix) = object.hash.get(..2) else {
                debug!(asset = %name, "asset with malformed hash skipped");
                continue;
            };
            if !seen.insert(object.hash.as_str()) {
                continue;
            }
            files.push(ExpectedFile {
                kind: FileKind::Asset,
                url: format!("{ASSET_BASE_URL}/{prefix}/{}", object.hash),
                path: objects_dir.join(prefix).join(&object.hash),
                size: object.size,
                sha1: Some(object.hash.clone()),
            });
        }
        files
    }
}
