//! crates.io registry client.

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

pub const CRATES_IO: &str = "https://crates.io";
const CRATES_DOWNLOAD: &str = "https://static.crates.io/crates";

/// crates.io registry client.
pub struct CratesIoRegistry {
    http: JsonClient,
    urls: CratesUrls,
}

impl CratesIoRegistry {
    pub fn new(http: JsonClient) -> Self {
        Self::with_base_url(CRATES_IO, http)
    }

    pub fn with_base_url(base_url: &str, http: JsonClient) -> Self {
        Self {
            http,
            urls: CratesUrls {
                base_url: base_url.trim_end_matches('/').to_string(),
            },
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1/crates/{}", self.urls.base_url, path)
    }

    async fn fetch_crate(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<CrateResponse, RegistryError> {
        let url = self.api_url(name);
        debug!(package = name, url = %url, "fetching crate");

        self.http
            .get_json(&url, cancel)
            .await
            .map_err(|e| e.or_not_found(|| RegistryError::PackageNotFound(name.to_string())))
    }
}

// crates.io API response types
#[derive(Debug, Deserialize)]
struct CrateResponse {
    #[serde(rename = "crate")]
    krate: CrateInfo,
    #[serde(default)]
    versions: Vec<CrateVersionInfo>,
}

#[derive(Debug, Deserialize)]
struct CrateInfo {
    id: String,
    description: Option<String>,
    homepage: Option<String>,
    repository: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    categories: Vec<String>,
    downloads: Option<u64>,
    max_stable_version: Option<String>,
    max_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CrateVersionInfo {
    id: Option<u64>,
    num: String,
    license: Option<String>,
    checksum: Option<String>,
    #[serde(default)]
    yanked: bool,
    yank_message: Option<String>,
    created_at: Option<String>,
    downloads: Option<u64>,
    rust_version: Option<String>,
    crate_size: Option<u64>,
    features: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DependenciesResponse {
    dependencies: Vec<CrateDependency>,
}

#[derive(Debug, Deserialize)]
struct CrateDependency {
    crate_id: String,
    req: String,
    kind: Option<String>,
    #[serde(default)]
    optional: bool,
}

#[derive(Debug, Deserialize)]
struct OwnersResponse {
    users: Vec<CrateOwner>,
}

#[derive(Debug, Deserialize)]
struct CrateOwner {
    id: u64,
    login: String,
    name: Option<String>,
    url: Option<String>,
}

#[async_trait]
impl Registry for CratesIoRegistry {
    fn ecosystem(&self) -> &'static str {
        "cargo"
    }

    async fn fetch_package(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Package, RegistryError> {
        let resp = self.fetch_crate(name, cancel).await?;
        let krate = resp.krate;

        let mut metadata = Map::new();
        metadata.insert("categories".into(), json!(krate.categories));
        if let Some(downloads) = krate.downloads {
            metadata.insert("downloads".into(), json!(downloads));
        }

        Ok(Package {
            name: krate.id,
            description: krate.description,
            homepage: krate.homepage,
            repository: krate.repository,
            licenses: resp.versions.first().and_then(|v| v.license.clone()),
            keywords: krate.keywords,
            namespace: None,
            latest_version: krate.max_stable_version.or(krate.max_version),
            metadata,
        })
    }

    async fn fetch_versions(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Version>, RegistryError> {
        let resp = self.fetch_crate(name, cancel).await?;

        Ok(resp
            .versions
            .into_iter()
            .map(|v| {
                let mut metadata = Map::new();
                let extras = [
                    ("id", v.id.map(|id| json!(id))),
                    ("downloads", v.downloads.map(|d| json!(d))),
                    ("rust_version", v.rust_version.map(|r| json!(r))),
                    ("crate_size", v.crate_size.map(|s| json!(s))),
                    ("yank_message", v.yank_message.map(|m| json!(m))),
                    ("features", v.features),
                ];
                for (key, value) in extras {
                    if let Some(value) = value {
                        metadata.insert(key.into(), value);
                    }
                }

                Version {
                    published_at: v
                        .created_at
                        .as_deref()
                        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                        .map(|t| t.with_timezone(&Utc)),
                    licenses: v.license,
                    integrity: v
                        .checksum
                        .filter(|c| !c.is_empty())
                        .map(|c| format!("sha256-{}", c)),
                    status: if v.yanked {
                        VersionStatus::Yanked
                    } else {
                        VersionStatus::Active
                    },
                    number: v.num,
                    metadata,
                }
            })
            .collect())
    }

    async fn fetch_dependencies(
        &self,
        name: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Dependency>, RegistryError> {
        let url = self.api_url(&format!("{}/{}/dependencies", name, version));
        debug!(package = name, version, url = %url, "fetching crate dependencies");

        let resp: DependenciesResponse = self.http.get_json(&url, cancel).await.map_err(|e| {
            e.or_not_found(|| RegistryError::VersionNotFound {
                package: name.to_string(),
                version: version.to_string(),
            })
        })?;

        Ok(resp
            .dependencies
            .into_iter()
            .map(|d| Dependency {
                scope: match d.kind.as_deref() {
                    Some("dev") => Scope::Development,
                    Some("build") => Scope::Build,
                    _ => Scope::Runtime,
                },
                name: d.crate_id,
                requirements: d.req,
                optional: d.optional,
            })
            .collect())
    }

    async fn fetch_maintainers(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Maintainer>, RegistryError> {
        let url = self.api_url(&format!("{}/owner_user", name));
        let resp: OwnersResponse = self
            .http
            .get_json(&url, cancel)
            .await
            .map_err(|e| e.or_not_found(|| RegistryError::PackageNotFound(name.to_string())))?;

        Ok(resp
            .users
            .into_iter()
            .map(|u| Maintainer {
                uuid: Some(u.id.to_string()),
                login: Some(u.login),
                name: u.name,
                url: u.url,
                ..Default::default()
            })
            .collect())
    }

    fn urls(&self) -> &dyn UrlBuilder {
        &self.urls
    }
}

/// URL builder for crates.io.
pub struct CratesUrls {
    base_url: String,
}

impl UrlBuilder for CratesUrls {
    fn registry(&self, name: &str, version: &str) -> Option<String> {
        Some(match version {
            "" => format!("{}/crates/{}", self.base_url, name),
            v => format!("{}/crates/{}/{}", self.base_url, name, v),
        })
    }

    fn download(&self, name: &str, version: &str) -> Option<String> {
        if version.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}/{}-{}.crate",
            CRATES_DOWNLOAD, name, name, version
        ))
    }

    fn documentation(&self, name: &str, version: &str) -> Option<String> {
        Some(match version {
            "" => format!("https://docs.rs/{}", name),
            v => format!("https://docs.rs/{}/{}", name, v),
        })
    }

    fn purl(&self, name: &str, version: &str) -> Option<String> {
        Some(match version {
            "" => format!("pkg:cargo/{}", name),
            v => format!("pkg:cargo/{}@{}", name, v),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SERDE_DOC: &str = r#"{
        "crate": {
            "id": "serde",
            "description": "A generic serialization/deserialization framework",
            "repository": "https://github.com/serde-rs/serde",
            "keywords": ["serde", "serialization"],
            "categories": ["encoding"],
            "downloads": 1000,
            "max_stable_version": "1.0.200",
            "max_version": "1.0.200"
        },
        "versions": [
            {
                "id": 2,
                "num": "1.0.200",
                "license": "MIT OR Apache-2.0",
                "checksum": "ddc6f9cc94d67c0e21aaf7eda3a010fd3af78ebf6e096aa6e2e13c79749cce4f",
                "yanked": false,
                "created_at": "2024-04-29T00:00:00.000000+00:00"
            },
            {
                "id": 1,
                "num": "1.0.199",
                "license": "MIT OR Apache-2.0",
                "checksum": "",
                "yanked": true,
                "yank_message": "broken",
                "created_at": "2024-04-20T00:00:00.000000+00:00"
            }
        ]
    }"#;

    fn registry(server: &MockServer) -> CratesIoRegistry {
        CratesIoRegistry::with_base_url(&server.uri(), JsonClient::new().unwrap())
    }

    #[test]
    fn test_download_url() {
        let urls = CratesUrls {
            base_url: CRATES_IO.to_string(),
        };
        assert_eq!(
            urls.download("serde", "1.0.200").as_deref(),
            Some("https://static.crates.io/crates/serde/serde-1.0.200.crate")
        );
        assert_eq!(urls.download("serde", ""), None);
    }

    #[tokio::test]
    async fn test_fetch_versions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/crates/serde"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SERDE_DOC))
            .mount(&server)
            .await;

        let registry = registry(&server);
        let versions = registry
            .fetch_versions("serde", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(versions.len(), 2);
        assert_eq!(
            versions[0].integrity.as_deref(),
            Some("sha256-ddc6f9cc94d67c0e21aaf7eda3a010fd3af78ebf6e096aa6e2e13c79749cce4f")
        );
        assert!(versions[0].published_at.is_some());
        assert_eq!(versions[1].integrity, None);
        assert_eq!(versions[1].status, VersionStatus::Yanked);
        assert_eq!(versions[1].metadata_str("yank_message"), Some("broken"));

        let pkg = registry
            .fetch_package("serde", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(pkg.latest_version.as_deref(), Some("1.0.200"));
        assert_eq!(pkg.licenses.as_deref(), Some("MIT OR Apache-2.0"));
    }

    #[tokio::test]
    async fn test_fetch_dependencies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/crates/serde/1.0.200/dependencies"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"dependencies": [
                    {"crate_id": "serde_derive", "req": "=1.0.200", "kind": "normal", "optional": true},
                    {"crate_id": "serde_json", "req": "^1.0", "kind": "dev", "optional": false}
                ]}"#,
            ))
            .mount(&server)
            .await;

        let deps = registry(&server)
            .fetch_dependencies("serde", "1.0.200", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].scope, Scope::Runtime);
        assert!(deps[0].optional);
        assert_eq!(deps[1].scope, Scope::Development);
    }

    #[tokio::test]
    async fn test_crate_not_found() {
        let server = MockServer::start().await;
        let err = registry(&server)
            .fetch_versions("no-such-crate", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::PackageNotFound(_)));
    }

    #[tokio::test]
    #[ignore]
    async fn test_fetch_versions_serde_live() {
        let registry = CratesIoRegistry::new(JsonClient::new().unwrap());
        let versions = registry
            .fetch_versions("serde", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!versions.is_empty());
    }
}
