//! Maven Central registry client.
//!
//! Versions come from `maven-metadata.xml`. Package details, dependencies
//! and developers come from the version's pom.xml, with blank fields
//! inherited from parent poms.

use std::collections::HashMap;

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event;
use serde::Deserialize;
use serde_json::{Map, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::{Dependency, Maintainer, Package, Registry, Scope, UrlBuilder, Version};
use super::error::RegistryError;
use super::http::JsonClient;

pub const MAVEN_REPO: &str = "https://repo1.maven.org/maven2";

/// How many `<parent>` hops to follow before giving up.
const MAX_PARENT_DEPTH: usize = 5;

/// Maven Central registry client.
pub struct MavenRegistry {
    http: JsonClient,
    urls: MavenUrls,
}

impl MavenRegistry {
    pub fn new(http: JsonClient) -> Self {
        Self::with_repo_url(MAVEN_REPO, http)
    }

    pub fn with_repo_url(repo_url: &str, http: JsonClient) -> Self {
        Self {
            http,
            urls: MavenUrls {
                repo_url: repo_url.trim_end_matches('/').to_string(),
            },
        }
    }

    async fn fetch_metadata(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<MavenMetadata, RegistryError> {
        let (group_id, artifact_id) = parse_coordinates(name)?;
        let url = format!(
            "{}/{}/{}/maven-metadata.xml",
            self.urls.repo_url,
            group_to_path(group_id),
            artifact_id
        );
        debug!(package = name, url = %url, "fetching maven metadata");

        self.http
            .get_xml(&url, cancel)
            .await
            .map_err(|e| e.or_not_found(|| RegistryError::PackageNotFound(name.to_string())))
    }

    /// Fetch a pom and fill its blanks from the parent chain.
    async fn fetch_pom(
        &self,
        group_id: &str,
        artifact_id: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<Pom, RegistryError> {
        let mut pom = self.fetch_pom_once(group_id, artifact_id, version, cancel).await?;

        let mut parent = pom.parent.clone();
        for _ in 0..MAX_PARENT_DEPTH {
            let Some(coords) = parent else { break };
            match self
                .fetch_pom_once(&coords.group_id, &coords.artifact_id, &coords.version, cancel)
                .await
            {
                Ok(parent_pom) => {
                    parent = parent_pom.parent.clone();
                    pom.inherit(parent_pom);
                }
                Err(RegistryError::Cancelled { url }) => {
                    return Err(RegistryError::Cancelled { url });
                }
                Err(e) => {
                    debug!(parent = %coords, error = %e, "parent pom unavailable");
                    break;
                }
            }
        }

        Ok(pom)
    }

    async fn fetch_pom_once(
        &self,
        group_id: &str,
        artifact_id: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<Pom, RegistryError> {
        let url = format!(
            "{}/{}/{}/{}/{}-{}.pom",
            self.urls.repo_url,
            group_to_path(group_id),
            artifact_id,
            version,
            artifact_id,
            version
        );
        debug!(group_id, artifact_id, version, url = %url, "fetching pom");

        let text = self.http.get_text(&url, cancel).await.map_err(|e| {
            e.or_not_found(|| RegistryError::VersionNotFound {
                package: format!("{}:{}", group_id, artifact_id),
                version: version.to_string(),
            })
        })?;
        Ok(parse_pom(&text))
    }

    async fn latest_pom(&self, name: &str, cancel: &CancellationToken) -> Result<Pom, RegistryError> {
        let (group_id, artifact_id) = parse_coordinates(name)?;
        let metadata = self.fetch_metadata(name, cancel).await?;
        let latest = metadata
            .latest()
            .ok_or_else(|| RegistryError::PackageNotFound(name.to_string()))?;
        self.fetch_pom(group_id, artifact_id, &latest, cancel).await
    }
}

/// Parse groupId:artifactId from package name.
pub fn parse_coordinates(name: &str) -> Result<(&str, &str), RegistryError> {
    match name.split(':').collect::<Vec<_>>().as_slice() {
        [group, artifact] if !group.is_empty() && !artifact.is_empty() => Ok((group, artifact)),
        _ => Err(RegistryError::InvalidPackage(format!(
            "Maven coordinates must be groupId:artifactId, got: {}",
            name
        ))),
    }
}

/// Convert groupId to path (com.google.guava -> com/google/guava).
pub fn group_to_path(group_id: &str) -> String {
    group_id.replace('.', "/")
}

// maven-metadata.xml
#[derive(Debug, Default, Deserialize)]
struct MavenMetadata {
    #[serde(default)]
    versioning: Versioning,
}

#[derive(Debug, Default, Deserialize)]
struct Versioning {
    latest: Option<String>,
    release: Option<String>,
    #[serde(default)]
    versions: VersionList,
}

#[derive(Debug, Default, Deserialize)]
struct VersionList {
    #[serde(default)]
    version: Vec<String>,
}

impl MavenMetadata {
    fn latest(&self) -> Option<String> {
        let v = &self.versioning;
        v.release
            .clone()
            .or_else(|| v.latest.clone())
            .or_else(|| v.versions.version.last().cloned())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Coordinates {
    group_id: String,
    artifact_id: String,
    version: String,
}

impl std::fmt::Display for Coordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.group_id, self.artifact_id, self.version)
    }
}

#[derive(Debug, Clone, Default)]
struct PomDependency {
    group_id: String,
    artifact_id: String,
    version: String,
    scope: String,
    optional: bool,
}

#[derive(Debug, Clone, Default)]
struct PomDeveloper {
    id: String,
    name: String,
    email: String,
    url: String,
    role: String,
}

/// The parts of a pom.xml this client reads.
#[derive(Debug, Clone, Default)]
struct Pom {
    group_id: String,
    version: String,
    name: String,
    description: String,
    url: String,
    scm_url: String,
    licenses: Vec<String>,
    parent: Option<Coordinates>,
    properties: HashMap<String, String>,
    dependencies: Vec<PomDependency>,
    developers: Vec<PomDeveloper>,
}

impl Pom {
    fn inherit(&mut self, parent: Pom) {
        fn fill(field: &mut String, from: String) {
            if field.is_empty() {
                *field = from;
            }
        }
        fill(&mut self.group_id, parent.group_id);
        fill(&mut self.description, parent.description);
        fill(&mut self.url, parent.url);
        fill(&mut self.scm_url, parent.scm_url);
        if self.licenses.is_empty() {
            self.licenses = parent.licenses;
        }
        if self.developers.is_empty() {
            self.developers = parent.developers;
        }
        for (k, v) in parent.properties {
            self.properties.entry(k).or_insert(v);
        }
    }

    /// Resolve ${property} references.
    fn resolve(&self, value: &str) -> String {
        let Some(key) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) else {
            return value.to_string();
        };
        match key {
            "project.version" | "version" => self.version.clone(),
            "project.groupId" | "groupId" => self.group_id.clone(),
            _ => self
                .properties
                .get(key)
                .cloned()
                .unwrap_or_else(|| value.to_string()),
        }
    }
}

/// Parse a pom.xml into [`Pom`].
///
/// Tracks the element path so `<dependencies>` under
/// `<dependencyManagement>` or `<plugin>` are ignored.
fn parse_pom(content: &str) -> Pom {
    let mut pom = Pom::default();
    let mut reader = Reader::from_str(content);
    let mut path: Vec<String> = Vec::new();
    let mut parent = Coordinates::default();
    let mut dep = PomDependency::default();
    let mut developer = PomDeveloper::default();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                path.push(name);
                match path_str(&path).as_str() {
                    "project/dependencies/dependency" => dep = PomDependency::default(),
                    "project/developers/developer" => developer = PomDeveloper::default(),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => {
                match path_str(&path).as_str() {
                    "project/dependencies/dependency" => {
                        pom.dependencies.push(std::mem::take(&mut dep));
                    }
                    "project/developers/developer" => {
                        pom.developers.push(std::mem::take(&mut developer));
                    }
                    "project/parent" => pom.parent = Some(std::mem::take(&mut parent)),
                    _ => {}
                }
                path.pop();
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map(|t| t.trim().to_string()).unwrap_or_default();
                if text.is_empty() {
                    buf.clear();
                    continue;
                }

                match path.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
                    ["project", "groupId"] => pom.group_id = text,
                    ["project", "version"] => pom.version = text,
                    ["project", "name"] => pom.name = text,
                    ["project", "description"] => pom.description = text,
                    ["project", "url"] => pom.url = text,
                    ["project", "scm", "url"] => pom.scm_url = text,
                    ["project", "licenses", "license", "name"] => pom.licenses.push(text),
                    ["project", "properties", key] => {
                        pom.properties.insert(key.to_string(), text);
                    }
                    ["project", "parent", field] => match *field {
                        "groupId" => parent.group_id = text,
                        "artifactId" => parent.artifact_id = text,
                        "version" => parent.version = text,
                        _ => {}
                    },
                    ["project", "dependencies", "dependency", field] => match *field {
                        "groupId" => dep.group_id = text,
                        "artifactId" => dep.artifact_id = text,
                        "version" => dep.version = text,
                        "scope" => dep.scope = text,
                        "optional" => dep.optional = text == "true",
                        _ => {}
                    },
                    ["project", "developers", "developer", field] => match *field {
                        "id" => developer.id = text,
                        "name" => developer.name = text,
                        "email" => developer.email = text,
                        "url" => developer.url = text,
                        "roles" | "role" => developer.role = text,
                        _ => {}
                    },
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    // A child pom's groupId and version default to the parent's.
    if let Some(parent) = &pom.parent {
        if pom.group_id.is_empty() {
            pom.group_id = parent.group_id.clone();
        }
        if pom.version.is_empty() {
            pom.version = parent.version.clone();
        }
    }

    pom
}

fn path_str(path: &[String]) -> String {
    path.join("/")
}

fn map_scope(dep: &PomDependency) -> Scope {
    if dep.optional {
        return Scope::Optional;
    }
    match dep.scope.as_str() {
        "test" => Scope::Test,
        "provided" | "system" => Scope::Build,
        _ => Scope::Runtime,
    }
}

fn non_empty(s: String) -> Option<String> {
    Some(s).filter(|s| !s.is_empty())
}

#[async_trait]
impl Registry for MavenRegistry {
    fn ecosystem(&self) -> &'static str {
        "maven"
    }

    async fn fetch_package(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Package, RegistryError> {
        let (group_id, artifact_id) = parse_coordinates(name)?;
        let metadata = self.fetch_metadata(name, cancel).await?;
        let latest_version = metadata.latest();

        let pom = match &latest_version {
            Some(v) => Some(self.fetch_pom(group_id, artifact_id, v, cancel).await?),
            None => None,
        };

        let mut extra = Map::new();
        if let Some(pom) = &pom
            && !pom.name.is_empty()
        {
            extra.insert("display_name".into(), json!(pom.name));
        }

        let pom = pom.unwrap_or_default();
        let licenses = pom.licenses.join(",");
        Ok(Package {
            name: name.to_string(),
            namespace: Some(group_id.to_string()),
            description: non_empty(pom.description),
            repository: non_empty(pom.scm_url).or_else(|| non_empty(pom.url.clone())),
            homepage: non_empty(pom.url),
            licenses: non_empty(licenses),
            latest_version,
            metadata: extra,
            ..Default::default()
        })
    }

    async fn fetch_versions(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Version>, RegistryError> {
        let metadata = self.fetch_metadata(name, cancel).await?;

        let versions: Vec<Version> = metadata
            .versioning
            .versions
            .version
            .into_iter()
            .map(|number| {
                let mut version = Version::new(number);
                if let Some(url) = self.urls.download(name, &version.number) {
                    version.metadata.insert("download_url".into(), json!(url));
                }
                version
            })
            .collect();

        if versions.is_empty() {
            return Err(RegistryError::PackageNotFound(name.to_string()));
        }
        debug!(package = name, count = versions.len(), "fetched maven versions");
        Ok(versions)
    }

    async fn fetch_dependencies(
        &self,
        name: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Dependency>, RegistryError> {
        let (group_id, artifact_id) = parse_coordinates(name)?;
        let pom = self.fetch_pom(group_id, artifact_id, version, cancel).await?;

        Ok(pom
            .dependencies
            .iter()
            .map(|d| Dependency {
                name: format!("{}:{}", pom.resolve(&d.group_id), d.artifact_id),
                requirements: pom.resolve(&d.version),
                scope: map_scope(d),
                optional: d.optional,
            })
            .collect())
    }

    async fn fetch_maintainers(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Maintainer>, RegistryError> {
        let pom = self.latest_pom(name, cancel).await?;
        Ok(pom
            .developers
            .into_iter()
            .map(|d| Maintainer {
                uuid: non_empty(d.id.clone()),
                login: non_empty(d.id),
                name: non_empty(d.name),
                email: non_empty(d.email),
                url: non_empty(d.url),
                role: non_empty(d.role),
            })
            .collect())
    }

    fn urls(&self) -> &dyn UrlBuilder {
        &self.urls
    }
}

/// URL builder for Maven Central.
pub struct MavenUrls {
    repo_url: String,
}

impl UrlBuilder for MavenUrls {
    fn registry(&self, name: &str, version: &str) -> Option<String> {
        let (g, a) = parse_coordinates(name).ok()?;
        Some(match version {
            "" => format!("https://search.maven.org/artifact/{}/{}", g, a),
            v => format!("https://search.maven.org/artifact/{}/{}/{}/jar", g, a, v),
        })
    }

    fn download(&self, name: &str, version: &str) -> Option<String> {
        let (g, a) = parse_coordinates(name).ok()?;
        if version.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}/{}/{}/{}-{}.jar",
            self.repo_url,
            group_to_path(g),
            a,
            version,
            a,
            version
        ))
    }

    fn documentation(&self, name: &str, version: &str) -> Option<String> {
        let (g, a) = parse_coordinates(name).ok()?;
        Some(match version {
            "" => format!("https://javadoc.io/doc/{}/{}", g, a),
            v => format!("https://javadoc.io/doc/{}/{}/{}", g, a, v),
        })
    }

    fn purl(&self, name: &str, version: &str) -> Option<String> {
        let (g, a) = parse_coordinates(name).ok()?;
        let base = format!("pkg:maven/{}/{}", g, a);
        Some(match version {
            "" => base,
            v => format!("{}@{}", base, v),
        })
    }
}
