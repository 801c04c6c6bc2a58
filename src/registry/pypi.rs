//! PyPI registry client.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::{Map, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::{
    Dependency, Maintainer, Package, Registry, Scope, UrlBuilder, Version, VersionStatus,
};
use super::error::RegistryError;
use super::http::JsonClient;

pub const PYPI_URL: &str = "https://pypi.org";

/// PyPI registry client.
pub struct PypiRegistry {
    http: JsonClient,
    urls: PypiUrls,
}

impl PypiRegistry {
    pub fn new(http: JsonClient) -> Self {
        Self::with_base_url(PYPI_URL, http)
    }

    pub fn with_base_url(base_url: &str, http: JsonClient) -> Self {
        Self {
            http,
            urls: PypiUrls {
                base_url: base_url.trim_end_matches('/').to_string(),
            },
        }
    }

    async fn fetch_document(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<PypiPackageResponse, RegistryError> {
        let url = format!("{}/pypi/{}/json", self.urls.base_url, name);
        debug!(package = name, url = %url, "fetching pypi package");

        self.http
            .get_json(&url, cancel)
            .await
            .map_err(|e| e.or_not_found(|| RegistryError::PackageNotFound(name.to_string())))
    }
}

// PyPI API response types
#[derive(Debug, Deserialize)]
struct PypiPackageResponse {
    info: PypiInfo,
    #[serde(default)]
    releases: BTreeMap<String, Vec<PypiRelease>>,
}

#[derive(Debug, Default, Deserialize)]
struct PypiInfo {
    name: String,
    summary: Option<String>,
    home_page: Option<String>,
    license: Option<String>,
    license_expression: Option<String>,
    keywords: Option<String>,
    version: Option<String>,
    #[serde(default)]
    classifiers: Vec<String>,
    project_urls: Option<HashMap<String, String>>,
    requires_dist: Option<Vec<String>>,
    author: Option<String>,
    author_email: Option<String>,
    maintainer: Option<String>,
    maintainer_email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PypiRelease {
    #[serde(default)]
    digests: HashMap<String, String>,
    url: String,
    filename: Option<String>,
    upload_time: Option<String>,
    #[serde(default)]
    yanked: bool,
    yanked_reason: Option<String>,
    packagetype: Option<String>,
    requires_python: Option<String>,
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PypiVersionResponse {
    info: PypiInfo,
}

#[async_trait]
impl Registry for PypiRegistry {
    fn ecosystem(&self) -> &'static str {
        "pypi"
    }

    async fn fetch_package(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Package, RegistryError> {
        let doc = self.fetch_document(name, cancel).await?;
        let info = doc.info;
        let project_urls = info.project_urls.clone().unwrap_or_default();

        let mut metadata = Map::new();
        metadata.insert("classifiers".into(), json!(info.classifiers));
        metadata.insert("normalized_name".into(), json!(normalize_name(&info.name)));
        if let Some(docs) = project_urls.get("Documentation") {
            metadata.insert("documentation".into(), json!(docs));
        }

        Ok(Package {
            name: info.name.to_lowercase(),
            description: info.summary.clone().filter(|s| !s.is_empty()),
            homepage: homepage(&project_urls, info.home_page.as_deref()),
            repository: repository_url(&project_urls, info.home_page.as_deref()),
            licenses: license(&info),
            keywords: parse_keywords(info.keywords.as_deref().unwrap_or_default()),
            namespace: None,
            latest_version: info.version.clone(),
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
            .releases
            .into_iter()
            .map(|(number, files)| match preferred_file(&files) {
                Some(file) => release_version(number, file),
                None => Version::new(number),
            })
            .collect();

        versions.sort_by(|a, b| a.published_at.cmp(&b.published_at));
        debug!(package = name, count = versions.len(), "fetched pypi versions");
        Ok(versions)
    }

    async fn fetch_dependencies(
        &self,
        name: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Dependency>, RegistryError> {
        let url = format!("{}/pypi/{}/{}/json", self.urls.base_url, name, version);
        debug!(package = name, version, url = %url, "fetching pypi version");

        let doc: PypiVersionResponse = self.http.get_json(&url, cancel).await.map_err(|e| {
            e.or_not_found(|| RegistryError::VersionNotFound {
                package: name.to_string(),
                version: version.to_string(),
            })
        })?;

        Ok(doc
            .info
            .requires_dist
            .unwrap_or_default()
            .iter()
            .map(|req| parse_pep508(req))
            .collect())
    }

    async fn fetch_maintainers(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Maintainer>, RegistryError> {
        let info = self.fetch_document(name, cancel).await?.info;

        let people = [
            (info.author, info.author_email, "author"),
            (info.maintainer, info.maintainer_email, "maintainer"),
        ];
        Ok(people
            .into_iter()
            .filter(|(name, email, _)| {
                name.as_deref().is_some_and(|n| !n.is_empty())
                    || email.as_deref().is_some_and(|e| !e.is_empty())
            })
            .map(|(name, email, role)| Maintainer {
                name: name.filter(|n| !n.is_empty()),
                email: email.filter(|e| !e.is_empty()),
                role: Some(role.to_string()),
                ..Default::default()
            })
            .collect())
    }

    fn urls(&self) -> &dyn UrlBuilder {
        &self.urls
    }
}

/// Source distribution if there is one, else the first uploaded file.
fn preferred_file(files: &[PypiRelease]) -> Option<&PypiRelease> {
    files
        .iter()
        .find(|f| f.packagetype.as_deref() == Some("sdist"))
        .or_else(|| files.first())
}

fn release_version(number: String, file: &PypiRelease) -> Version {
    let published_at = file
        .upload_time
        .as_deref()
        .and_then(|t| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S").ok())
        .map(|t| t.and_utc());

    let mut metadata = Map::new();
    metadata.insert("download_url".into(), json!(file.url));
    if let Some(filename) = &file.filename {
        metadata.insert("filename".into(), json!(filename));
    }
    if let Some(packagetype) = &file.packagetype {
        metadata.insert("packagetype".into(), json!(packagetype));
    }
    if let Some(requires_python) = &file.requires_python {
        metadata.insert("requires_python".into(), json!(requires_python));
    }
    if let Some(reason) = &file.yanked_reason {
        metadata.insert("yanked_reason".into(), json!(reason));
    }
    if let Some(size) = file.size {
        metadata.insert("size".into(), json!(size));
    }

    Version {
        number,
        published_at,
        licenses: None,
        integrity: file.digests.get("sha256").map(|d| format!("sha256-{}", d)),
        status: if file.yanked {
            VersionStatus::Yanked
        } else {
            VersionStatus::Active
        },
        metadata,
    }
}

/// Lowercase with runs of `-`, `_` and `.` collapsed to `-` (PEP 503).
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            pending_sep = true;
            continue;
        }
        if pending_sep && !out.is_empty() {
            out.push('-');
        }
        pending_sep = false;
        out.push(c.to_ascii_lowercase());
    }
    out
}

fn is_repo_url(url: &str) -> bool {
    ["github.com", "gitlab.com", "bitbucket.org", "codeberg.org"]
        .iter()
        .any(|host| url.contains(host))
}

fn repository_url(project_urls: &HashMap<String, String>, home_page: Option<&str>) -> Option<String> {
    for key in ["Repository", "Source", "Source Code", "Code"] {
        if let Some(url) = project_urls.get(key).filter(|u| is_repo_url(u)) {
            return Some(url.clone());
        }
    }

    let mut candidates: Vec<&String> = project_urls
        .values()
        .filter(|u| is_repo_url(u) && !u.contains("github.com/sponsors"))
        .collect();
    candidates.sort();
    if let Some(url) = candidates.first() {
        return Some((*url).clone());
    }

    home_page.filter(|h| is_repo_url(h)).map(str::to_string)
}

fn homepage(project_urls: &HashMap<String, String>, home_page: Option<&str>) -> Option<String> {
    home_page
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .or_else(|| project_urls.get("Homepage").cloned())
        .or_else(|| project_urls.get("Home").cloned())
}

fn license(info: &PypiInfo) -> Option<String> {
    if let Some(expr) = info.license_expression.as_ref().filter(|l| !l.is_empty()) {
        return Some(expr.clone());
    }
    if let Some(license) = info.license.as_ref().filter(|l| !l.is_empty()) {
        return Some(license.clone());
    }
    info.classifiers
        .iter()
        .filter(|c| c.starts_with("License :: "))
        .find_map(|c| c.rsplit(" :: ").next())
        .map(str::to_string)
}

fn parse_keywords(keywords: &str) -> Vec<String> {
    if keywords.contains(',') {
        keywords
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        keywords.split_whitespace().map(str::to_string).collect()
    }
}

/// Parse a `Requires-Dist` entry: `name[extras] (>=1.0); marker`.
fn parse_pep508(requirement: &str) -> Dependency {
    let (spec, marker) = match requirement.split_once(';') {
        Some((spec, marker)) => (spec.trim(), Some(marker.trim())),
        None => (requirement.trim(), None),
    };

    let name_end = spec
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(spec.len());
    let name = spec[..name_end].trim_end_matches(['-', '_', '.']).to_string();

    let mut rest = spec[name_end..].trim_start();
    if rest.starts_with('[') {
        rest = rest.find(']').map(|i| &rest[i + 1..]).unwrap_or("");
    }
    let requirements = rest.trim().trim_matches(|c| c == '(' || c == ')').trim();

    let marker = marker.filter(|m| !m.is_empty());
    Dependency {
        name,
        requirements: if requirements.is_empty() {
            "*".to_string()
        } else {
            requirements.to_string()
        },
        optional: marker.is_some(),
        scope: marker
            .map(|m| Scope::Marker(m.to_string()))
            .unwrap_or(Scope::Runtime),
    }
}

/// URL builder for PyPI.
pub struct PypiUrls {
    base_url: String,
}

impl UrlBuilder for PypiUrls {
    fn registry(&self, name: &str, version: &str) -> Option<String> {
        Some(match version {
            "" => format!("{}/project/{}/", self.base_url, name),
            v => format!("{}/project/{}/{}/", self.base_url, name, v),
        })
    }

    /// File URLs are content-addressed, so there is no way to derive one.
    fn download(&self, _name: &str, _version: &str) -> Option<String> {
        None
    }

    fn documentation(&self, name: &str, version: &str) -> Option<String> {
        Some(match version {
            "" => format!("https://{}.readthedocs.io/", name),
            v => format!("https://{}.readthedocs.io/en/{}/", name, v),
        })
    }

    fn purl(&self, name: &str, version: &str) -> Option<String> {
        let normalized = normalize_name(name);
        Some(match version {
            "" => format!("pkg:pypi/{}", normalized),
            v => format!("pkg:pypi/{}@{}", normalized, v),
        })
    }
}
