//! Fetch command - resolve and download artifacts.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use futures::StreamExt;
use pkgfetch::config::Config;
use pkgfetch::fetch::{
    Artifact, ArtifactFetcher, ArtifactInfo, CircuitBreakerFetcher, Integrity, Verifier,
};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{PackageSpec, ResolveOpts, build_fetcher};

#[derive(Args)]
pub struct FetchCmd {
    /// Package specs: ecosystem:name@version (e.g., npm:axios@1.7.9)
    #[arg(required = true)]
    pub packages: Vec<PackageSpec>,

    /// Directory to write artifacts into
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Parallel downloads (default: from config, 4)
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Skip integrity verification
    #[arg(long)]
    pub no_verify: bool,

    #[command(flatten)]
    pub opts: ResolveOpts,
}

/// One finished download.
struct Downloaded {
    path: PathBuf,
    bytes: u64,
    verified: bool,
}

/// A resolved artifact and the local filename reserved for it.
type Planned = (ArtifactInfo, String);

impl FetchCmd {
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let config = Config::load()?;
        let fetcher = build_fetcher(&config)?;
        let resolver = self.opts.resolver()?;
        let concurrency = self.concurrency.unwrap_or(config.concurrency).max(1);

        tokio::fs::create_dir_all(&self.output)
            .await
            .with_context(|| format!("Failed to create {}", self.output.display()))?;

        // Ordered, so renamed outputs do not depend on which lookup finished first.
        let resolved: Vec<Result<ArtifactInfo>> = futures::stream::iter(&self.packages)
            .map(|spec| {
                let resolver = &resolver;
                async move {
                    resolver
                        .resolve(&spec.ecosystem, &spec.name, &spec.version, cancel)
                        .await
                        .map_err(anyhow::Error::from)
                }
            })
            .buffered(concurrency)
            .collect()
            .await;

        let results: Vec<(&PackageSpec, Result<Downloaded>)> =
            futures::stream::iter(plan_downloads(&self.packages, resolved))
                .map(|(spec, planned)| {
                    let fetcher = &fetcher;
                    async move {
                        let result = match planned {
                            Ok((info, filename)) => {
                                self.download(fetcher, &info, &filename, cancel).await
                            }
                            Err(e) => Err(e),
                        };
                        (spec, result)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        let mut failed = 0;
        for (spec, result) in &results {
            match result {
                Ok(done) => println!(
                    "{} -> {} ({} bytes{})",
                    spec,
                    done.path.display(),
                    done.bytes,
                    if done.verified { ", verified" } else { "" }
                ),
                Err(e) => {
                    failed += 1;
                    eprintln!("{}: {:#}", spec, e);
                }
            }
        }

        let states = fetcher.breaker_states();
        if !states.is_empty() {
            println!("\nUpstream hosts:");
            for (host, state) in states {
                println!("  {:<40} {}", host, state);
            }
        }

        if failed > 0 {
            anyhow::bail!("{} of {} downloads failed", failed, results.len());
        }
        Ok(())
    }

    async fn download(
        &self,
        fetcher: &CircuitBreakerFetcher,
        info: &ArtifactInfo,
        filename: &str,
        cancel: &CancellationToken,
    ) -> Result<Downloaded> {
        let verifier = match &info.integrity {
            Some(integrity) if !self.no_verify => Some(Integrity::parse(integrity)?.verifier()),
            _ => None,
        };

        let artifact = fetcher.fetch(&info.url, cancel).await?;
        debug!(url = %info.url, filename, size = %artifact.size(), "downloading");

        let path = self.output.join(filename);
        let partial = self.output.join(format!("{}.part", filename));

        match write_artifact(artifact, &partial, verifier).await {
            Ok((bytes, verified)) => {
                tokio::fs::rename(&partial, &path)
                    .await
                    .with_context(|| format!("Failed to move {} into place", path.display()))?;
                Ok(Downloaded {
                    path,
                    bytes,
                    verified,
                })
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }
}

/// Reserve one output filename per resolved package.
///
/// A filename shared by several packages is qualified with the package's
/// scope, group or module path. Anything still taken after that (the same
/// package requested twice) fails instead of overwriting the earlier file.
fn plan_downloads(
    specs: &[PackageSpec],
    resolved: Vec<Result<ArtifactInfo>>,
) -> Vec<(&PackageSpec, Result<Planned>)> {
    let mut claims: HashMap<String, usize> = HashMap::new();
    for info in resolved.iter().flatten() {
        *claims
            .entry(safe_filename(&info.filename).to_string())
            .or_default() += 1;
    }

    let mut taken = HashSet::new();
    specs
        .iter()
        .zip(resolved)
        .map(|(spec, result)| {
            let planned = result.and_then(|info| {
                let base = safe_filename(&info.filename);
                let filename = if claims.get(base).copied().unwrap_or(0) > 1 {
                    qualified_filename(spec, base)
                } else {
                    base.to_string()
                };
                if !taken.insert(filename.clone()) {
                    anyhow::bail!("{} is already being written by another package", filename);
                }
                Ok((info, filename))
            });
            (spec, planned)
        })
        .collect()
}

/// Prefix `filename` with everything before the last name component,
/// e.g. `@types` for `@types/node` or `github.com/gin-gonic` for a Go module.
fn qualified_filename(spec: &PackageSpec, filename: &str) -> String {
    let prefix = spec
        .name
        .rsplit_once(|c: char| c == '/' || c == ':')
        .map(|(prefix, _)| prefix)
        .unwrap_or(spec.ecosystem.as_str());

    let prefix: String = prefix
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let prefix = prefix.trim_matches(|c: char| c == '_' || c == '.');

    if prefix.is_empty() {
        filename.to_string()
    } else {
        format!("{}_{}", prefix, filename)
    }
}

/// Stream the body to `path`, hashing as it goes.
async fn write_artifact(
    mut artifact: Artifact,
    path: &Path,
    mut verifier: Option<Verifier>,
) -> Result<(u64, bool)> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut written = 0u64;
    while let Some(chunk) = artifact.chunk().await? {
        if let Some(v) = verifier.as_mut() {
            v.update(&chunk);
        }
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    let verified = match verifier {
        Some(v) => {
            v.finish()?;
            true
        }
        None => false,
    };
    Ok((written, verified))
}

/// Last path component only, so metadata-provided names cannot escape the output dir.
fn safe_filename(filename: &str) -> &str {
    Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("artifact")
}
