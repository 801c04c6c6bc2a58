//! npm registry client.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::{
    Dependency, Maintainer, Package, Registry, Scope, UrlBuilder, Version, VersionStatus,
};
use super::error::RegistryError;
use super::http::JsonClient;

pub const NPM_REGISTRY: &str = "https://registry.npmjs.org";

/// npm registry client.
pub struct NpmRegistry {
    http: JsonClient,
    urls: NpmUrls,
}

impl NpmRegistry {
    pub fn new(http: JsonClient) -> Self {
        Self::with_registry_url(NPM_REGISTRY, http)
    }

    pub fn with_registry_url(registry_url: &str, http: JsonClient) -> Self {
        Self {
            http,
            urls: NpmUrls {
                base_url: registry_url.trim_end_matches('/').to_string(),
            },
        }
    }

    fn package_url(&self, name: &str) -> Result<String, RegistryError> {
        let mut url = url::Url::parse(&self.urls.base_url)
            .map_err(|e| RegistryError::InvalidPackage(format!("bad registry URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| RegistryError::InvalidPackage("registry URL cannot be a base".into()))?
            .pop_if_empty()
            .push(name);
        Ok(url.into())
    }

    async fn fetch_document(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<NpmPackageResponse, RegistryError> {
        let url = self.package_url(name)?;
        debug!(package = name, url = %url, "fetching npm package");

        self.http
            .get_json(&url, cancel)
            .await
            .map_err(|e| e.or_not_found(|| RegistryError::PackageNotFound(name.to_string())))
    }
}

// npm registry response types
#[derive(Debug, Deserialize)]
struct NpmPackageResponse {
    #[serde(rename = "_id")]
    id: Option<String>,
    name: Option<String>,
    description: Option<String>,
    homepage: Option<Value>,
    repository: Option<Value>,
    #[serde(rename = "dist-tags", default)]
    dist_tags: HashMap<String, String>,
    #[serde(default)]
    versions: BTreeMap<String, NpmVersionInfo>,
    #[serde(default)]
    time: HashMap<String, String>,
    #[serde(default)]
    maintainers: Vec<NpmPerson>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LicenseField {
    Simple(String),
    Complex {
        #[serde(rename = "type")]
        license_type: String,
    },
    List(Vec<LicenseField>),
}

impl LicenseField {
    fn joined(&self) -> String {
        match self {
            LicenseField::Simple(s) => s.clone(),
            LicenseField::Complex { license_type } => license_type.clone(),
            LicenseField::List(items) => items
                .iter()
                .map(LicenseField::joined)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct NpmVersionInfo {
    description: Option<String>,
    keywords: Option<Value>,
    license: Option<LicenseField>,
    repository: Option<Value>,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(rename = "devDependencies", default)]
    dev_dependencies: BTreeMap<String, String>,
    #[serde(rename = "optionalDependencies", default)]
    optional_dependencies: BTreeMap<String, String>,
    deprecated: Option<Value>,
    #[serde(default)]
    dist: NpmDist,
    engines: Option<Value>,
    funding: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct NpmDist {
    tarball: Option<String>,
    shasum: Option<String>,
    integrity: Option<String>,
}

impl NpmDist {
    /// SRI string, falling back to the legacy hex SHA-1.
    fn integrity(&self) -> Option<String> {
        self.integrity
            .clone()
            .filter(|i| !i.is_empty())
            .or_else(|| {
                self.shasum
                    .as_ref()
                    .filter(|s| !s.is_empty())
                    .map(|s| format!("sha1-{}", s))
            })
    }
}

#[derive(Debug, Deserialize)]
struct NpmPerson {
    name: Option<String>,
    email: Option<String>,
}

#[async_trait]
impl Registry for NpmRegistry {
    fn ecosystem(&self) -> &'static str {
        "npm"
    }

    async fn fetch_package(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Package, RegistryError> {
        let doc = self.fetch_document(name, cancel).await?;

        let latest_version = doc.dist_tags.get("latest").cloned();
        let latest = latest_version
            .as_ref()
            .and_then(|v| doc.versions.get(v))
            .or_else(|| doc.versions.values().next_back());

        let package_name = doc
            .id
            .clone()
            .or(doc.name.clone())
            .unwrap_or_else(|| name.to_string());

        let mut metadata = Map::new();
        metadata.insert("dist-tags".into(), json!(doc.dist_tags));
        if let Some(funding) = latest.and_then(|v| v.funding.clone()) {
            metadata.insert("funding".into(), funding);
        }

        Ok(Package {
            namespace: namespace(&package_name),
            name: package_name,
            description: latest
                .and_then(|v| v.description.clone())
                .filter(|d| !d.is_empty())
                .or(doc.description),
            homepage: doc.homepage.as_ref().and_then(first_string),
            repository: latest
                .and_then(|v| v.repository.as_ref())
                .and_then(repository_url)
                .or_else(|| doc.repository.as_ref().and_then(repository_url)),
            licenses: latest
                .and_then(|v| v.license.as_ref())
                .map(LicenseField::joined),
            keywords: latest
                .and_then(|v| v.keywords.as_ref())
                .map(keywords)
                .unwrap_or_default(),
            latest_version,
            metadata,
        })
    }

    async fn fetch_versions(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Version>, RegistryError> {
        let doc = self.fetch_document(name, cancel).await?;

        let mut versions: Vec<Version> = doc
            .versions
            .into_iter()
            .map(|(number, info)| {
                let published_at = doc
                    .time
                    .get(&number)
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc));

                let deprecated = info.deprecated.as_ref().and_then(deprecation_message);
                let status = if deprecated.is_some() {
                    VersionStatus::Deprecated
                } else {
                    VersionStatus::Active
                };

                let mut metadata = Map::new();
                if let Some(tarball) = &info.dist.tarball {
                    metadata.insert("tarball".into(), json!(tarball));
                }
                if let Some(shasum) = &info.dist.shasum {
                    metadata.insert("shasum".into(), json!(shasum));
                }
                if let Some(message) = deprecated {
                    metadata.insert("deprecated".into(), json!(message));
                }
                if let Some(engines) = info.engines.clone() {
                    metadata.insert("engines".into(), engines);
                }

                Version {
                    integrity: info.dist.integrity(),
                    licenses: info.license.as_ref().map(LicenseField::joined),
                    number,
                    published_at,
                    status,
                    metadata,
                }
            })
            .collect();

        versions.sort_by(|a, b| a.published_at.cmp(&b.published_at));
        debug!(package = name, count = versions.len(), "fetched npm versions");
        Ok(versions)
    }

    async fn fetch_dependencies(
        &self,
        name: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Dependency>, RegistryError> {
        let mut doc = self.fetch_document(name, cancel).await?;
        let info = doc
            .versions
            .remove(version)
            .ok_or_else(|| RegistryError::VersionNotFound {
                package: name.to_string(),
                version: version.to_string(),
            })?;

        let runtime = info
            .dependencies
            .into_iter()
            .map(|(name, req)| (name, req, Scope::Runtime));
        let dev = info
            .dev_dependencies
            .into_iter()
            .map(|(name, req)| (name, req, Scope::Development));
        let optional = info
            .optional_dependencies
            .into_iter()
            .map(|(name, req)| (name, req, Scope::Optional));

        Ok(runtime
            .chain(dev)
            .chain(optional)
            .map(|(name, requirements, scope)| Dependency {
                optional: scope == Scope::Optional,
                name,
                requirements,
                scope,
            })
            .collect())
    }

    async fn fetch_maintainers(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Maintainer>, RegistryError> {
        let doc = self.fetch_document(name, cancel).await?;
        Ok(doc
            .maintainers
            .into_iter()
            .map(|m| Maintainer {
                uuid: m.name.clone(),
                login: m.name,
                email: m.email,
                ..Default::default()
            })
            .collect())
    }

    fn urls(&self) -> &dyn UrlBuilder {
        &self.urls
    }
}

/// URL builder for npm.
pub struct NpmUrls {
    base_url: String,
}

impl UrlBuilder for NpmUrls {
    fn registry(&self, name: &str, version: &str) -> Option<String> {
        Some(match version {
            "" => format!("https://www.npmjs.com/package/{}", name),
            v => format!("https://www.npmjs.com/package/{}/v/{}", name, v),
        })
    }

    fn download(&self, name: &str, version: &str) -> Option<String> {
        if version.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}/-/{}-{}.tgz",
            self.base_url,
            name,
            short_name(name),
            version
        ))
    }

    fn documentation(&self, name: &str, version: &str) -> Option<String> {
        self.registry(name, version)
    }

    fn purl(&self, name: &str, version: &str) -> Option<String> {
        let base = match name.strip_prefix('@').and_then(|n| n.split_once('/')) {
            Some((scope, pkg)) => format!("pkg:npm/@{}/{}", scope, pkg),
            None => format!("pkg:npm/{}", name),
        };
        Some(match version {
            "" => base,
            v => format!("{}@{}", base, v),
        })
    }
}

/// Unscoped part of a package name: `@types/node` -> `node`.
pub fn short_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn namespace(name: &str) -> Option<String> {
    name.strip_prefix('@')
        .and_then(|n| n.split_once('/'))
        .map(|(scope, _)| format!("@{}", scope))
}

fn first_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(first_string),
        _ => None,
    }
}

fn repository_url(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(obj) => obj.get("url").and_then(Value::as_str),
        Value::Array(items) => return items.iter().find_map(repository_url),
        _ => None,
    }?;
    Some(normalize_git_url(raw)).filter(|u| !u.is_empty())
}

fn normalize_git_url(url: &str) -> String {
    let url = url.strip_prefix("git+").unwrap_or(url);
    let url = url.strip_prefix("git://").unwrap_or(url);
    let url = url.strip_suffix(".git").unwrap_or(url);
    if url.starts_with("github.com/") {
        format!("https://{}", url)
    } else {
        url.to_string()
    }
}

fn keywords(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::String(s) => s
            .split([',', ' '])
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

// `deprecated` is usually a message, occasionally `true`.
fn deprecation_message(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Bool(true) => Some("deprecated".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LODASH_DOC: &str = r#"{
        "_id": "lodash",
        "name": "lodash",
        "description": "Lodash modular utilities.",
        "dist-tags": {"latest": "4.17.21"},
        "repository": {"type": "git", "url": "git+https://github.com/lodash/lodash.git"},
        "maintainers": [{"name": "jdalton", "email": "john.david.dalton@gmail.com"}],
        "time": {
            "4.17.20": "2020-08-13T16:53:54.152Z",
            "4.17.21": "2021-02-20T15:42:16.891Z"
        },
        "versions": {
            "4.17.20": {
                "license": "MIT",
                "dist": {
                    "tarball": "https://registry.npmjs.org/lodash/-/lodash-4.17.20.tgz",
                    "shasum": "b44a9b6297bcb698f1c51a3545a2b3b368d59c52"
                }
            },
            "4.17.21": {
                "license": {"type": "MIT"},
                "keywords": ["modules", "stdlib", "util"],
                "dependencies": {"a": "^1.0.0"},
                "devDependencies": {"b": "~2.0.0"},
                "optionalDependencies": {"c": "*"},
                "dist": {
                    "tarball": "https://registry.npmjs.org/lodash/-/lodash-4.17.21.tgz",
                    "shasum": "679591c564c3bffaae8454cf0b3df370c3d6911c",
                    "integrity": "sha512-v2kDEe57lecTulaDIuNTPy3Ry4gLGJ6Z1O3vE1krgXZNrsQ+LFTGHVxVjcXPs17LhbZVGedAJv8XZ1tvj5FvSg=="
                }
            }
        }
    }"#;

    async fn registry(server: &MockServer) -> NpmRegistry {
        Mock::given(method("GET"))
            .and(path("/lodash"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LODASH_DOC))
            .mount(server)
            .await;
        NpmRegistry::with_registry_url(&server.uri(), JsonClient::new().unwrap())
    }

    #[test]
    fn test_license_field_parsing() {
        let simple: LicenseField = serde_json::from_str(r#""MIT""#).unwrap();
        assert_eq!(simple.joined(), "MIT");

        let complex: LicenseField = serde_json::from_str(r#"{"type": "Apache-2.0"}"#).unwrap();
        assert_eq!(complex.joined(), "Apache-2.0");

        let list: LicenseField =
            serde_json::from_str(r#"["MIT", {"type": "Apache-2.0"}]"#).unwrap();
        assert_eq!(list.joined(), "MIT,Apache-2.0");
    }

    #[test]
    fn test_urls() {
        let urls = NpmUrls {
            base_url: NPM_REGISTRY.to_string(),
        };
        assert_eq!(
            urls.download("lodash", "4.17.21").as_deref(),
            Some("https://registry.npmjs.org/lodash/-/lodash-4.17.21.tgz")
        );
        assert_eq!(
            urls.download("@types/node", "20.0.0").as_deref(),
            Some("https://registry.npmjs.org/@types/node/-/node-20.0.0.tgz")
        );
        assert_eq!(urls.download("lodash", ""), None);
        assert_eq!(
            urls.purl("@types/node", "20.0.0").as_deref(),
            Some("pkg:npm/@types/node@20.0.0")
        );
    }

    #[test]
    fn test_normalize_git_url() {
        assert_eq!(
            normalize_git_url("git+https://github.com/lodash/lodash.git"),
            "https://github.com/lodash/lodash"
        );
        assert_eq!(
            normalize_git_url("git://github.com/a/b.git"),
            "https://github.com/a/b"
        );
    }

    #[tokio::test]
    async fn test_fetch_versions() {
        let server = MockServer::start().await;
        let registry = registry(&server).await;

        let versions = registry
            .fetch_versions("lodash", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(versions.len(), 2);

        let latest = versions.iter().find(|v| v.number == "4.17.21").unwrap();
        assert!(latest.integrity.as_deref().unwrap().starts_with("sha512-"));
        assert_eq!(
            latest.metadata_str("tarball"),
            Some("https://registry.npmjs.org/lodash/-/lodash-4.17.21.tgz")
        );
        assert!(latest.published_at.is_some());

        let older = versions.iter().find(|v| v.number == "4.17.20").unwrap();
        assert_eq!(
            older.integrity.as_deref(),
            Some("sha1-b44a9b6297bcb698f1c51a3545a2b3b368d59c52")
        );
        assert!(versions[0].published_at <= versions[1].published_at);
    }

    #[tokio::test]
    async fn test_fetch_package_and_dependencies() {
        let server = MockServer::start().await;
        let registry = registry(&server).await;
        let cancel = CancellationToken::new();

        let pkg = registry.fetch_package("lodash", &cancel).await.unwrap();
        assert_eq!(pkg.name, "lodash");
        assert_eq!(pkg.latest_version.as_deref(), Some("4.17.21"));
        assert_eq!(pkg.licenses.as_deref(), Some("MIT"));
        assert_eq!(
            pkg.repository.as_deref(),
            Some("https://github.com/lodash/lodash")
        );
        assert_eq!(pkg.keywords, vec!["modules", "stdlib", "util"]);

        let deps = registry
            .fetch_dependencies("lodash", "4.17.21", &cancel)
            .await
            .unwrap();
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[0].scope, Scope::Runtime);
        assert_eq!(deps[1].scope, Scope::Development);
        assert!(deps[2].optional);

        let err = registry
            .fetch_dependencies("lodash", "0.0.0", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::VersionNotFound { .. }));

        let maintainers = registry.fetch_maintainers("lodash", &cancel).await.unwrap();
        assert_eq!(maintainers[0].login.as_deref(), Some("jdalton"));
    }

    #[tokio::test]
    async fn test_package_not_found() {
        let server = MockServer::start().await;
        let registry = NpmRegistry::with_registry_url(&server.uri(), JsonClient::new().unwrap());

        let err = registry
            .fetch_versions("no-such-package", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::PackageNotFound(ref n) if n == "no-such-package"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_fetch_versions_lodash_live() {
        let registry = NpmRegistry::new(JsonClient::new().unwrap());
        let versions = registry
            .fetch_versions("lodash", &CancellationToken::new())
            .await
            .unwrap();
        assert!(versions.len() > 100);
    }
}
