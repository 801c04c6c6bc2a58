//! Go module proxy client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Map, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::{Dependency, Maintainer, Package, Registry, Scope, UrlBuilder, Version};
use super::error::RegistryError;
use super::http::JsonClient;

pub const GO_PROXY: &str = "https://proxy.golang.org";

/// Concurrent `.info` lookups while listing versions.
const INFO_CONCURRENCY: usize = 8;

/// Go module proxy client.
pub struct GoRegistry {
    http: JsonClient,
    urls: GoUrls,
}

impl GoRegistry {
    pub fn new(http: JsonClient) -> Self {
        Self::with_proxy_url(GO_PROXY, http)
    }

    pub fn with_proxy_url(proxy_url: &str, http: JsonClient) -> Self {
        Self {
            http,
            urls: GoUrls {
                proxy_url: proxy_url.trim_end_matches('/').to_string(),
            },
        }
    }

    fn module_url(&self, name: &str, suffix: &str) -> String {
        format!(
            "{}/{}/@v/{}",
            self.urls.proxy_url,
            escape_module_path(name),
            suffix
        )
    }

    async fn list_versions(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, RegistryError> {
        let url = self.module_url(name, "list");
        debug!(package = name, url = %url, "fetching go module versions");

        let text = self
            .http
            .get_text(&url, cancel)
            .await
            .map_err(|e| e.or_not_found(|| RegistryError::PackageNotFound(name.to_string())))?;

        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Escape a module path for the proxy protocol.
/// Uppercase letters become ! followed by lowercase.
/// e.g., github.com/BurntSushi/toml -> github.com/!burnt!sushi/toml
pub fn escape_module_path(module: &str) -> String {
    let mut result = String::with_capacity(module.len() + 10);
    for c in module.chars() {
        if c.is_ascii_uppercase() {
            result.push('!');
            result.push(c.to_ascii_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}

/// Normalize version - ensure v prefix.
pub fn normalize_version(version: &str) -> String {
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{}", version)
    }
}

/// Last path element of a module path: `github.com/gin-gonic/gin` -> `gin`.
pub fn module_basename(module: &str) -> &str {
    module.rsplit('/').next().unwrap_or(module)
}

// Go proxy response types
#[derive(Debug, Deserialize)]
struct GoVersionInfo {
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "Time")]
    time: Option<DateTime<Utc>>,
}

#[async_trait]
impl Registry for GoRegistry {
    fn ecosystem(&self) -> &'static str {
        "golang"
    }

    async fn fetch_package(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Package, RegistryError> {
        let versions = self.list_versions(name, cancel).await?;
        if versions.is_empty() {
            return Err(RegistryError::PackageNotFound(name.to_string()));
        }

        let repository = derive_repo_url(name);
        let namespace = name.rsplit_once('/').map(|(ns, _)| ns.to_string());

        Ok(Package {
            name: name.to_string(),
            homepage: Some(repository.clone()),
            repository: Some(repository),
            namespace,
            // The proxy lists versions in no particular order.
            latest_version: None,
            ..Default::default()
        })
    }

    async fn fetch_versions(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Version>, RegistryError> {
        let listed = self.list_versions(name, cancel).await?;

        let versions = futures::stream::iter(listed)
            .map(|number| async move {
                let url = self.module_url(name, &format!("{}.info", number));
                match self.http.get_json::<GoVersionInfo>(&url, cancel).await {
                    Ok(info) => {
                        let mut version = Version::new(info.version);
                        version.published_at = info.time;
                        version
                    }
                    // Without .info the listed number is still usable.
                    Err(_) => Version::new(number),
                }
            })
            .buffered(INFO_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        if cancel.is_cancelled() {
            return Err(RegistryError::Cancelled {
                url: self.module_url(name, "list"),
            });
        }

        Ok(versions
            .into_iter()
            .map(|mut v| {
                let mut metadata = Map::new();
                if let Some(url) = self.urls.download(name, &v.number) {
                    metadata.insert("download_url".into(), json!(url));
                }
                v.metadata = metadata;
                v
            })
            .collect())
    }

    async fn fetch_dependencies(
        &self,
        name: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Dependency>, RegistryError> {
        let url = self.module_url(name, &format!("{}.mod", normalize_version(version)));
        debug!(package = name, version, url = %url, "fetching go.mod");

        let text = self.http.get_text(&url, cancel).await.map_err(|e| {
            e.or_not_found(|| RegistryError::VersionNotFound {
                package: name.to_string(),
                version: version.to_string(),
            })
        })?;

        Ok(parse_go_mod(&text))
    }

    /// The proxy protocol has no notion of maintainers.
    async fn fetch_maintainers(
        &self,
        _name: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Maintainer>, RegistryError> {
        Ok(Vec::new())
    }

    fn urls(&self) -> &dyn UrlBuilder {
        &self.urls
    }
}

fn derive_repo_url(module: &str) -> String {
    let hosted = ["github.com/", "gitlab.com/", "bitbucket.org/"];
    if hosted.iter().any(|h| module.starts_with(h)) {
        let parts: Vec<&str> = module.split('/').collect();
        if parts.len() >= 3 {
            return format!("https://{}", parts[..3].join("/"));
        }
    }
    format!("https://{}", module)
}

/// Parse `require` directives from a go.mod file.
fn parse_go_mod(content: &str) -> Vec<Dependency> {
    let mut deps = Vec::new();
    let mut in_require = false;

    for line in content.lines().map(str::trim) {
        if line.starts_with("require (") {
            in_require = true;
            continue;
        }
        if in_require && line == ")" {
            in_require = false;
            continue;
        }

        let entry = if in_require {
            line
        } else if let Some(rest) = line.strip_prefix("require ") {
            rest
        } else {
            continue;
        };

        if let Some(dep) = parse_require(entry) {
            deps.push(dep);
        }
    }

    deps
}

fn parse_require(line: &str) -> Option<Dependency> {
    let indirect = line.contains("// indirect");
    let line = line.split("//").next().unwrap_or_default().trim();

    let mut fields = line.split_whitespace();
    let name = fields.next()?;
    let version = fields.next()?;

    Some(Dependency {
        name: name.to_string(),
        requirements: version.to_string(),
        scope: if indirect {
            Scope::Optional
        } else {
            Scope::Runtime
        },
        optional: indirect,
    })
}

/// URL builder for the Go module proxy.
pub struct GoUrls {
    proxy_url: String,
}

impl UrlBuilder for GoUrls {
    fn registry(&self, name: &str, version: &str) -> Option<String> {
        Some(match version {
            "" => format!("https://pkg.go.dev/{}", name),
            v => format!("https://pkg.go.dev/{}@{}", name, v),
        })
    }

    fn download(&self, name: &str, version: &str) -> Option<String> {
        if version.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}/@v/{}.zip",
            self.proxy_url,
            escape_module_path(name),
            version
        ))
    }

    fn documentation(&self, name: &str, version: &str) -> Option<String> {
        self.registry(name, version)
            .map(|url| format!("{}#section-documentation", url))
    }

    fn purl(&self, name: &str, version: &str) -> Option<String> {
        let base = format!("pkg:golang/{}", escape_module_path(name));
        Some(match version {
            "" => base,
            v => format!("{}@{}", base, v),
        })
    }
}
