// SPDX-License-Identifier: AGPL-3.0-or-later
//! Installation reconciler
//!
//! Drives one installation pass through its phases in a fixed order:
//!
//! 1. lock, dependencies
//! 2. fetch (release listing, or checkout and build) and resolve
//! 3. stale cleanup, atomic placement
//! 4. configuration merge with owner-only permissions
//! 5. service build and restart, listener verification
//!
//! Placements are journaled. A fatal error after placement reverts them, so
//! the providers directory is left as it was found.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::archive;
use crate::artifact::{self, file_name, AssetPattern, Choice, NamedArtifact, SelectionRules};
use crate::command::CommandRunner;
use crate::config::InstallerConfig;
use crate::error::{InstallError, Phase, PhaseExt, Result};
use crate::host::{self, ServiceHost};
use crate::input::check_port_pair;
use crate::lock::InstallLock;
use crate::packages;
use crate::plugin_config::{self, ConfigChange, ConfigPlan, DesiredConfig, SecretOrigin};
use crate::providers::{self, Placement};
use crate::release::{ReleaseAsset, ReleaseSource};
use crate::source_build;
use crate::verify::{self, VerificationReport};

/// Log lines mentioning this are shown after a failed restart
pub const LOG_FILTER: &str = "radius";

/// Where the plugin comes from for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// Published release assets; latest when `tag` is `None`
    Release { tag: Option<String> },
    /// Build from the configured git checkout
    Git,
    /// A jar, a zip, or a directory of either, already on disk
    Local { path: PathBuf },
}

impl ArtifactSource {
    /// The source selected by the installer configuration
    pub fn from_config(config: &InstallerConfig) -> Result<Self> {
        use crate::config::SourceKind;

        match config.source.kind {
            SourceKind::Release => Ok(ArtifactSource::Release {
                tag: config.source.tag.clone(),
            }),
            SourceKind::Git => Ok(ArtifactSource::Git),
            SourceKind::Local => config
                .source
                .local_artifact
                .clone()
                .map(|path| ArtifactSource::Local { path })
                .ok_or_else(|| InstallError::InvalidConfig {
                    message: "source.local_artifact is required for the local source".to_string(),
                }),
        }
    }
}

/// Per-run switches
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Check privilege and the Keycloak installation first
    pub preflight: bool,
    /// Skip the OS package phase
    pub skip_packages: bool,
    /// Revert placements when a later phase fails
    pub rollback: bool,
    /// Restart even when nothing changed on disk
    pub force_restart: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            preflight: true,
            skip_packages: false,
            rollback: true,
            force_restart: false,
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    /// Where the artifacts came from
    pub origin: String,
    /// File names of the artifacts installed (or that would be)
    pub artifacts: Vec<String>,
    /// Whether any artifact was added, replaced or moved aside
    pub providers_changed: bool,
    /// Non-runtime variants removed from the providers directory
    pub removed: Vec<PathBuf>,
    pub config_change: ConfigChange,
    pub secret_origin: SecretOrigin,
    /// Whether the service was rebuilt and restarted
    pub restarted: bool,
    pub verification: VerificationReport,
    pub dry_run: bool,
}

/// A candidate artifact, remote or on disk
#[derive(Debug, Clone)]
struct Candidate {
    name: String,
    location: Location,
}

#[derive(Debug, Clone)]
enum Location {
    Remote(ReleaseAsset),
    Disk(PathBuf),
}

impl NamedArtifact for Candidate {
    fn artifact_name(&self) -> &str {
        &self.name
    }
}

/// Candidates produced by the fetch phase
#[derive(Debug)]
struct Fetched {
    origin: String,
    candidates: Vec<Candidate>,
}

/// An artifact ready to be placed
#[derive(Debug)]
struct Staged {
    name: String,
    path: PathBuf,
    family: AssetPattern,
}

/// Applied placements, in order
#[derive(Debug, Default)]
struct Journal {
    placements: Vec<Placement>,
}

impl Journal {
    fn record(&mut self, placement: Placement) {
        self.placements.push(placement);
    }

    fn changed(&self) -> bool {
        self.placements.iter().any(|placement| placement.changed)
    }

    fn rollback(&mut self) {
        for placement in self.placements.drain(..).rev() {
            match providers::revert(&placement) {
                Ok(()) => info!(path = %placement.target.display(), "Rolled back placement"),
                Err(e) => warn!(
                    path = %placement.target.display(),
                    error = %e,
                    "Rollback failed, providers directory needs manual attention"
                ),
            }
        }
    }

    fn commit(&mut self) {
        for placement in self.placements.drain(..) {
            providers::commit(&placement);
        }
    }
}

/// Brings the host to the desired plugin state
pub struct Reconciler<'a> {
    config: &'a InstallerConfig,
    runner: &'a dyn CommandRunner,
    releases: &'a dyn ReleaseSource,
    host: &'a dyn ServiceHost,
    cancel: CancellationToken,
    options: RunOptions,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        config: &'a InstallerConfig,
        runner: &'a dyn CommandRunner,
        releases: &'a dyn ReleaseSource,
        host: &'a dyn ServiceHost,
    ) -> Self {
        Self {
            config,
            runner,
            releases,
            host,
            cancel: CancellationToken::new(),
            options: RunOptions::default(),
        }
    }

    /// Abort between (and inside awaiting) phases when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    fn dry_run(&self) -> bool {
        self.runner.is_dry_run()
    }

    /// Run a full installation pass
    pub async fn reconcile(
        &self,
        desired: &DesiredConfig,
        source: &ArtifactSource,
        providers_dir: &Path,
        config_path: &Path,
    ) -> Result<ReconcileReport> {
        check_port_pair(desired.auth_port, desired.account_port).phase(Phase::Setup)?;
        let rules = self.config.artifacts.rules().phase(Phase::Setup)?;

        if self.options.preflight {
            self.run_phase(Phase::Preflight, async { self.preflight() })
                .await?;
        }

        let mut lock = self
            .run_phase(Phase::Lock, async { self.open_lock() })
            .await?;
        let _guard = match lock.as_mut() {
            Some(lock) => Some(lock.try_acquire().phase(Phase::Lock)?),
            None => None,
        };

        // Computed up front so a malformed file fails the run before any change
        let plan = plugin_config::plan(config_path, desired).phase(Phase::Configure)?;

        if self.options.skip_packages {
            info!("Skipping OS package installation");
        } else {
            self.run_phase(
                Phase::Dependencies,
                packages::install(
                    self.runner,
                    self.config.packages.manager,
                    &self.config.packages.names,
                ),
            )
            .await?;
        }

        let fetched = self.run_phase(Phase::Fetch, self.fetch(source)).await?;

        let staging = tempfile::Builder::new()
            .prefix("kc-radius-")
            .tempdir()
            .map_err(|e| InstallError::fs(std::env::temp_dir(), e))
            .phase(Phase::Resolve)?;
        let staged = self
            .run_phase(Phase::Resolve, self.resolve(&fetched, &rules, staging.path()))
            .await?;

        let mut journal = Journal::default();
        let outcome = self
            .apply(desired, &staged, providers_dir, config_path, &plan, &mut journal)
            .await;

        match outcome {
            Ok((removed, restarted)) => {
                let providers_changed = journal.changed();
                journal.commit();

                let verification = self
                    .run_phase(Phase::Verify, async { Ok::<_, InstallError>(self.verify(desired).await) })
                    .await?;

                Ok(ReconcileReport {
                    origin: fetched.origin,
                    artifacts: staged.into_iter().map(|artifact| artifact.name).collect(),
                    providers_changed,
                    removed,
                    config_change: plan.change,
                    secret_origin: plan.secret_origin,
                    restarted,
                    verification,
                    dry_run: self.dry_run(),
                })
            }
            Err(error) => {
                if self.options.rollback {
                    journal.rollback();
                } else if !journal.placements.is_empty() {
                    warn!("Rollback disabled, leaving placed artifacts in place");
                    journal.commit();
                }
                Err(error)
            }
        }
    }

    /// Run only the configuration merge and permission phases
    pub async fn configure(&self, desired: &DesiredConfig, config_path: &Path) -> Result<ConfigPlan> {
        check_port_pair(desired.auth_port, desired.account_port).phase(Phase::Setup)?;

        let mut lock = self
            .run_phase(Phase::Lock, async { self.open_lock() })
            .await?;
        let _guard = match lock.as_mut() {
            Some(lock) => Some(lock.try_acquire().phase(Phase::Lock)?),
            None => None,
        };

        self.run_phase(Phase::Configure, async {
            let plan = plugin_config::plan(config_path, desired)?;
            self.write_config(config_path, &plan)?;
            Ok::<_, InstallError>(plan)
        })
        .await
    }

    /// Names of the artifacts a run would install, without changing anything
    ///
    /// A git source is only described: its artifacts exist after a build,
    /// which this does not run.
    pub async fn plan_artifacts(&self, source: &ArtifactSource) -> Result<Vec<String>> {
        let rules = self.config.artifacts.rules().phase(Phase::Setup)?;

        if *source == ArtifactSource::Git {
            return Ok(self.describe_build(&rules));
        }

        let fetched = self.run_phase(Phase::Fetch, self.fetch(source)).await?;

        let selection = artifact::select(&fetched.candidates, &rules)
            .ok_or_else(|| no_artifact(&fetched.origin))
            .phase(Phase::Resolve)?;

        let describe = |choice: &Choice<'_, Candidate>| match choice {
            Choice::Direct(candidate) => candidate.name.clone(),
            Choice::Archive(archives) => {
                let names: Vec<&str> = archives.iter().map(|a| a.name.as_str()).collect();
                format!("(from archive) {}", names.join(", "))
            }
        };

        let mut names = vec![describe(&selection.primary)];
        if let Some(secondary) = &selection.secondary {
            names.push(describe(secondary));
        }
        Ok(names)
    }

    fn describe_build(&self, rules: &SelectionRules) -> Vec<String> {
        let source = &self.config.source;
        let git_ref = source.git_ref.as_deref().unwrap_or("default branch");
        let built = |pattern: &AssetPattern| {
            format!(
                "(from build) jar matching {} from {} at {}",
                pattern, source.git_url, git_ref
            )
        };

        let mut lines = vec![built(&rules.primary)];
        if let Some(secondary) = &rules.secondary {
            lines.push(built(secondary));
        }
        lines
    }

    /// Cleanup, placement, configuration and convergence
    ///
    /// Returns the removed stale paths and whether the service was restarted.
    async fn apply(
        &self,
        desired: &DesiredConfig,
        staged: &[Staged],
        providers_dir: &Path,
        config_path: &Path,
        plan: &ConfigPlan,
        journal: &mut Journal,
    ) -> Result<(Vec<PathBuf>, bool)> {
        let removed = self
            .run_phase(Phase::Cleanup, async { self.cleanup(providers_dir) })
            .await?;

        self.run_phase(Phase::Place, async {
            for artifact in staged {
                if self.dry_run() {
                    info!(
                        artifact = %artifact.name,
                        dir = %providers_dir.display(),
                        "[DRY RUN] Would place artifact"
                    );
                    continue;
                }
                let placement = providers::place(&artifact.path, providers_dir, &artifact.family)?;
                journal.record(placement);
            }
            Ok::<_, InstallError>(())
        })
        .await?;

        self.run_phase(Phase::Configure, async {
            self.write_config(config_path, plan)
        })
        .await?;

        let changed =
            journal.changed() || !removed.is_empty() || plan.change != ConfigChange::Unchanged;
        if !changed && !self.options.force_restart {
            info!("Nothing changed, skipping service rebuild and restart");
            return Ok((removed, false));
        }

        if self.dry_run() {
            info!("[DRY RUN] Would rebuild and restart the service");
            return Ok((removed, false));
        }

        if let Err(error) = self.run_phase(Phase::Converge, self.converge()).await {
            if !error.is_cancelled() {
                self.diagnose(desired).await;
            }
            return Err(error);
        }

        Ok((removed, true))
    }

    fn preflight(&self) -> Result<()> {
        if self.dry_run() {
            info!("[DRY RUN] Skipping privilege check");
        } else {
            host::ensure_privileged()?;
        }
        host::ensure_host_installation(self.config)
    }

    fn open_lock(&self) -> Result<Option<InstallLock>> {
        if self.dry_run() {
            return Ok(None);
        }
        InstallLock::open(&self.config.lock_path).map(Some)
    }

    async fn fetch(&self, source: &ArtifactSource) -> Result<Fetched> {
        match source {
            ArtifactSource::Release { tag } => {
                let release = self.releases.release(tag.as_deref()).await?;
                info!(tag = %release.tag_name, assets = release.assets.len(), "Listed release assets");

                let candidates = release
                    .assets
                    .iter()
                    .map(|asset| Candidate {
                        name: asset.name.clone(),
                        location: Location::Remote(asset.clone()),
                    })
                    .collect();
                Ok(Fetched {
                    origin: format!("release {} of {}", release.tag_name, self.releases.describe()),
                    candidates,
                })
            }
            ArtifactSource::Git => {
                let source = &self.config.source;
                let dir = source_build::checkout(self.runner, source).await?;
                source_build::build(self.runner, source, &dir).await?;

                let candidates = source_build::collect_artifacts(&dir)?
                    .into_iter()
                    .map(|built| Candidate {
                        name: built.name,
                        location: Location::Disk(built.path),
                    })
                    .collect();
                Ok(Fetched {
                    origin: format!("build of {}", source.git_url),
                    candidates,
                })
            }
            ArtifactSource::Local { path } => Ok(Fetched {
                origin: path.display().to_string(),
                candidates: local_candidates(path)?,
            }),
        }
    }

    async fn resolve(
        &self,
        fetched: &Fetched,
        rules: &SelectionRules,
        staging: &Path,
    ) -> Result<Vec<Staged>> {
        if self.dry_run() && fetched.candidates.is_empty() {
            info!(origin = %fetched.origin, "[DRY RUN] Build outputs not available yet");
            return Ok(Vec::new());
        }

        let selection = artifact::select(&fetched.candidates, rules)
            .ok_or_else(|| no_artifact(&fetched.origin))?;

        let mut staged = vec![
            self.stage(selection.primary, &rules.primary, staging, &fetched.origin)
                .await?,
        ];
        if let (Some(choice), Some(pattern)) = (selection.secondary, &rules.secondary) {
            staged.push(self.stage(choice, pattern, staging, &fetched.origin).await?);
        }

        for artifact in &staged {
            info!(artifact = %artifact.name, "Selected artifact");
        }
        Ok(staged)
    }

    async fn stage(
        &self,
        choice: Choice<'_, Candidate>,
        pattern: &AssetPattern,
        staging: &Path,
        origin: &str,
    ) -> Result<Staged> {
        match choice {
            Choice::Direct(candidate) => Ok(Staged {
                name: file_name(&candidate.name).to_string(),
                path: self.obtain(candidate, staging).await?,
                family: pattern.clone(),
            }),
            Choice::Archive(archives) => {
                let extract_dir = staging.join("extracted");

                for candidate in archives {
                    if self.dry_run() {
                        info!(archive = %candidate.name, "[DRY RUN] Would extract artifact from archive");
                        return Ok(Staged {
                            name: candidate.name.clone(),
                            path: staging.join(file_name(&candidate.name)),
                            family: pattern.clone(),
                        });
                    }

                    let archive_path = self.obtain(candidate, staging).await?;
                    std::fs::create_dir_all(&extract_dir)
                        .map_err(|e| InstallError::fs(&extract_dir, e))?;

                    if let Some(path) =
                        archive::extract_matching(self.runner, &archive_path, pattern, &extract_dir)
                            .await?
                    {
                        let name = path
                            .file_name()
                            .map(|name| name.to_string_lossy().to_string())
                            .unwrap_or_default();
                        return Ok(Staged {
                            name,
                            path,
                            family: pattern.clone(),
                        });
                    }
                    info!(archive = %candidate.name, pattern = %pattern, "Archive holds no matching artifact");
                }

                Err(no_artifact(origin))
            }
        }
    }

    /// Local path of a candidate, downloading it into `staging` if needed
    async fn obtain(&self, candidate: &Candidate, staging: &Path) -> Result<PathBuf> {
        match &candidate.location {
            Location::Disk(path) => Ok(path.clone()),
            Location::Remote(asset) => {
                let dest = staging.join(file_name(&asset.name));
                if self.dry_run() {
                    info!(asset = %asset.name, "[DRY RUN] Would download asset");
                } else {
                    self.releases.download(asset, &dest).await?;
                }
                Ok(dest)
            }
        }
    }

    fn cleanup(&self, providers_dir: &Path) -> Result<Vec<PathBuf>> {
        if !self.dry_run() {
            return providers::cleanup_stale(providers_dir);
        }

        let stale: Vec<PathBuf> = providers::list(providers_dir)?
            .into_iter()
            .filter(|name| artifact::AssetKind::classify(name).is_non_runtime())
            .map(|name| providers_dir.join(name))
            .collect();
        for path in &stale {
            info!(path = %path.display(), "[DRY RUN] Would remove non-runtime artifact");
        }
        Ok(stale)
    }

    fn write_config(&self, config_path: &Path, plan: &ConfigPlan) -> Result<()> {
        if self.dry_run() {
            info!(
                path = %config_path.display(),
                change = ?plan.change,
                secret = ?plan.secret_origin,
                "[DRY RUN] Would write plugin configuration"
            );
            return Ok(());
        }
        plugin_config::apply(config_path, plan)
    }

    async fn converge(&self) -> Result<()> {
        self.host.build().await?;
        self.host.restart().await
    }

    async fn verify(&self, desired: &DesiredConfig) -> VerificationReport {
        let listeners = verify::radius_listeners(desired.auth_port, desired.account_port);
        let grace = Duration::from_secs(self.config.service.listener_grace_secs);
        verify::probe(self.runner, &listeners, grace).await
    }

    /// Best-effort diagnostics after a failed convergence
    async fn diagnose(&self, desired: &DesiredConfig) {
        let listeners = verify::radius_listeners(desired.auth_port, desired.account_port);
        let report = verify::probe(self.runner, &listeners, Duration::ZERO).await;
        info!(bound = ?report.bound, "Listener state after failed convergence");

        match self.host.status().await {
            Ok(status) => warn!(status = %status, "Service state after failed convergence"),
            Err(e) => warn!(error = %e, "Cannot query service state"),
        }

        match self
            .host
            .recent_logs(LOG_FILTER, self.config.service.log_lines)
            .await
        {
            Ok(lines) if lines.is_empty() => {
                warn!(filter = LOG_FILTER, "No matching service log lines");
            }
            Ok(lines) => {
                for line in lines {
                    warn!(line = %line, "service log");
                }
            }
            Err(e) => warn!(error = %e, "Cannot read service logs"),
        }
    }

    /// Log, run and tag one phase, honoring cancellation
    async fn run_phase<T, F>(&self, phase: Phase, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(InstallError::Cancelled { phase });
        }

        info!(phase = %phase, "starting phase");
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(InstallError::Cancelled { phase }),
            result = work => result.phase(phase),
        };

        match &result {
            Ok(_) => info!(phase = %phase, "phase complete"),
            Err(e) => warn!(phase = %phase, error = %e, "phase failed"),
        }
        result
    }
}

fn no_artifact(origin: &str) -> InstallError {
    InstallError::NoArtifactFound {
        origin: origin.to_string(),
    }
}

fn local_candidates(path: &Path) -> Result<Vec<Candidate>> {
    let files: Vec<PathBuf> = if path.is_dir() {
        providers::list(path)?
            .into_iter()
            .map(|name| path.join(name))
            .collect()
    } else if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        return Err(no_artifact(&path.display().to_string()));
    };

    Ok(files
        .into_iter()
        .filter_map(|file| {
            let name = file.file_name()?.to_string_lossy().to_string();
            Some(Candidate {
                name,
                location: Location::Disk(file),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::command::{CommandOutput, SystemRunner};
    use crate::host::ServiceStatus;
    use crate::release::Release;
    use crate::secret::SharedSecret;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    const SS_BOUND: &str = "UNCONN 0 0 0.0.0.0:1812 0.0.0.0:*\nUNCONN 0 0 0.0.0.0:1813 0.0.0.0:*\n";

    struct FakeReleases {
        assets: Vec<&'static str>,
        downloads: Mutex<Vec<String>>,
    }

    impl FakeReleases {
        fn with_assets(assets: &[&'static str]) -> Self {
            Self {
                assets: assets.to_vec(),
                downloads: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ReleaseSource for FakeReleases {
        async fn release(&self, tag: Option<&str>) -> Result<Release> {
            Ok(Release {
                tag_name: tag.unwrap_or("v1.2").to_string(),
                assets: self
                    .assets
                    .iter()
                    .map(|name| {
                        ReleaseAsset::new(*name, format!("https://example.test/download/{name}"))
                    })
                    .collect(),
                html_url: None,
            })
        }

        async fn download(&self, asset: &ReleaseAsset, dest: &Path) -> Result<()> {
            self.downloads.lock().unwrap().push(asset.name.clone());
            fs::write(dest, format!("content of {}", asset.name)).map_err(|e| InstallError::fs(dest, e))
        }

        fn describe(&self) -> String {
            "owner/repo".to_string()
        }
    }

    #[derive(Default)]
    struct FakeHost {
        fail_restart: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ServiceHost for FakeHost {
        async fn build(&self) -> Result<()> {
            self.calls.lock().unwrap().push("build");
            Ok(())
        }

        async fn restart(&self) -> Result<()> {
            self.calls.lock().unwrap().push("restart");
            if self.fail_restart {
                return Err(InstallError::ServiceConvergenceError {
                    step: "restart".to_string(),
                    message: "Job for keycloak.service failed".to_string(),
                });
            }
            Ok(())
        }

        async fn status(&self) -> Result<ServiceStatus> {
            self.calls.lock().unwrap().push("status");
            Ok(ServiceStatus::NotActive("failed".to_string()))
        }

        async fn recent_logs(&self, _filter: &str, _lines: u32) -> Result<Vec<String>> {
            self.calls.lock().unwrap().push("logs");
            Ok(vec!["RADIUS port 1812 already in use".to_string()])
        }
    }

    struct Sandbox {
        _root: TempDir,
        config: InstallerConfig,
        providers: PathBuf,
        plugin_config: PathBuf,
    }

    fn sandbox() -> Sandbox {
        let root = tempdir().unwrap();
        let mut config = InstallerConfig {
            keycloak_home: root.path().join("keycloak"),
            lock_path: root.path().join("run/install.lock"),
            ..InstallerConfig::default()
        };
        config.service.listener_grace_secs = 0;
        Sandbox {
            providers: root.path().join("keycloak/providers"),
            plugin_config: root.path().join("config/radius.config"),
            config,
            _root: root,
        }
    }

    fn options() -> RunOptions {
        RunOptions {
            preflight: false,
            skip_packages: true,
            ..RunOptions::default()
        }
    }

    fn desired(secret: &str) -> DesiredConfig {
        DesiredConfig {
            shared_secret: Some(SharedSecret::new(secret).unwrap()),
            ..DesiredConfig::default()
        }
    }

    fn latest() -> ArtifactSource {
        ArtifactSource::Release { tag: None }
    }

    fn ss_runner() -> ScriptedRunner {
        ScriptedRunner::new()
            .respond(|spec| (spec.program == "ss").then(|| CommandOutput::ok(SS_BOUND)))
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_fresh_install() {
        let env = sandbox();
        let runner = ss_runner();
        let releases = FakeReleases::with_assets(&[
            "radius-plugin-1.2-sources.jar",
            "radius-plugin-1.2.jar",
            "radius-plugin-1.2-tests.jar",
        ]);
        let service = FakeHost::default();

        let report = Reconciler::new(&env.config, &runner, &releases, &service)
            .with_options(options())
            .reconcile(&desired("S3cr3t=="), &latest(), &env.providers, &env.plugin_config)
            .await
            .unwrap();

        assert_eq!(report.artifacts, vec!["radius-plugin-1.2.jar"]);
        assert!(report.providers_changed);
        assert!(report.restarted);
        assert!(report.verification.is_clean());
        assert_eq!(report.config_change, ConfigChange::Create);
        assert_eq!(report.secret_origin, SecretOrigin::Supplied);

        assert_eq!(
            providers::list(&env.providers).unwrap(),
            vec!["radius-plugin-1.2.jar"]
        );
        assert_eq!(*releases.downloads.lock().unwrap(), vec!["radius-plugin-1.2.jar"]);
        assert_eq!(*service.calls.lock().unwrap(), vec!["build", "restart"]);

        let document = read_json(&env.plugin_config);
        assert_eq!(document["sharedSecret"], "S3cr3t==");
        assert_eq!(document["authPort"], 1812);
        assert_eq!(document["accountPort"], 1813);
        assert_eq!(document["numberThreads"], 8);
        assert_eq!(document["useUdpRadius"], true);
        assert_eq!(document["externalDictionary"], Value::Null);
        assert_eq!(document["otpWithoutPassword"], serde_json::json!([]));
        assert_eq!(document["radsec"]["useRadSec"], false);
        assert_eq!(document["coa"]["useCoA"], false);
        assert_eq!(document["coa"]["port"], 3799);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&env.plugin_config).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_secret_rotation_keeps_radsec() {
        let env = sandbox();
        fs::create_dir_all(env.plugin_config.parent().unwrap()).unwrap();
        fs::write(
            &env.plugin_config,
            r#"{
              "sharedSecret": "old",
              "authPort": 1812,
              "accountPort": 1813,
              "radsec": {
                "useRadSec": true,
                "privateKey": "/etc/pki/radsec.key",
                "certificate": "/etc/pki/radsec.crt",
                "numberThreads": 4
              }
            }"#,
        )
        .unwrap();

        let runner = ss_runner();
        let releases = FakeReleases::with_assets(&["radius-plugin-1.2.jar"]);
        let service = FakeHost::default();

        let report = Reconciler::new(&env.config, &runner, &releases, &service)
            .with_options(options())
            .reconcile(&desired("n3w-s3cret"), &latest(), &env.providers, &env.plugin_config)
            .await
            .unwrap();
        assert_eq!(report.config_change, ConfigChange::Update);

        let document = read_json(&env.plugin_config);
        assert_eq!(document["sharedSecret"], "n3w-s3cret");
        assert_eq!(
            document["radsec"],
            serde_json::json!({
                "useRadSec": true,
                "privateKey": "/etc/pki/radsec.key",
                "certificate": "/etc/pki/radsec.crt",
                "numberThreads": 4
            })
        );
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let env = sandbox();
        let runner = ss_runner();
        let releases = FakeReleases::with_assets(&["radius-plugin-1.2.jar"]);
        let service = FakeHost::default();
        let reconciler = Reconciler::new(&env.config, &runner, &releases, &service)
            .with_options(options());
        let wanted = desired("S3cr3t==");

        reconciler
            .reconcile(&wanted, &latest(), &env.providers, &env.plugin_config)
            .await
            .unwrap();
        let listing = providers::list(&env.providers).unwrap();
        let config_bytes = fs::read(&env.plugin_config).unwrap();

        let second = reconciler
            .reconcile(&wanted, &latest(), &env.providers, &env.plugin_config)
            .await
            .unwrap();

        assert!(!second.providers_changed);
        assert_eq!(second.config_change, ConfigChange::Unchanged);
        assert!(!second.restarted);
        assert_eq!(providers::list(&env.providers).unwrap(), listing);
        assert_eq!(fs::read(&env.plugin_config).unwrap(), config_bytes);
        assert_eq!(*service.calls.lock().unwrap(), vec!["build", "restart"]);
    }

    #[tokio::test]
    async fn test_no_matching_asset_leaves_providers_untouched() {
        let env = sandbox();
        fs::create_dir_all(&env.providers).unwrap();
        fs::write(env.providers.join("keycloak-metrics.jar"), b"x").unwrap();
        fs::write(env.providers.join("radius-plugin-1.1-sources.jar"), b"x").unwrap();
        let before = providers::list(&env.providers).unwrap();

        // The archive lists no entries at all
        let runner = ss_runner();
        let releases = FakeReleases::with_assets(&["other-plugin.zip"]);
        let service = FakeHost::default();

        let error = Reconciler::new(&env.config, &runner, &releases, &service)
            .with_options(options())
            .reconcile(&desired("S3cr3t=="), &latest(), &env.providers, &env.plugin_config)
            .await
            .unwrap_err();

        assert!(matches!(error, InstallError::NoArtifactFound { .. }));
        assert_eq!(error.phase(), Some(Phase::Resolve));
        assert_eq!(providers::list(&env.providers).unwrap(), before);
        assert!(!env.plugin_config.exists());
        assert!(service.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_ports_rejected_before_any_write() {
        let env = sandbox();
        let runner = ss_runner();
        let releases = FakeReleases::with_assets(&["radius-plugin-1.2.jar"]);
        let service = FakeHost::default();

        for (auth_port, account_port) in [(0, 1813), (1812, 0), (1812, 1812)] {
            let wanted = DesiredConfig {
                auth_port,
                account_port,
                ..desired("S3cr3t==")
            };
            let error = Reconciler::new(&env.config, &runner, &releases, &service)
                .with_options(options())
                .reconcile(&wanted, &latest(), &env.providers, &env.plugin_config)
                .await
                .unwrap_err();
            assert!(matches!(error, InstallError::InvalidInput { .. }));
        }

        assert!(!env.plugin_config.exists());
        assert!(!env.providers.exists());
        assert!(runner.programs().is_empty());
        assert!(releases.downloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restart_failure_rolls_back_and_inspects_logs() {
        let env = sandbox();
        fs::create_dir_all(&env.providers).unwrap();
        fs::write(env.providers.join("radius-plugin-1.1.jar"), b"previous").unwrap();

        let runner = ss_runner();
        let releases = FakeReleases::with_assets(&["radius-plugin-1.2.jar"]);
        let service = FakeHost {
            fail_restart: true,
            ..FakeHost::default()
        };

        let error = Reconciler::new(&env.config, &runner, &releases, &service)
            .with_options(options())
            .reconcile(&desired("S3cr3t=="), &latest(), &env.providers, &env.plugin_config)
            .await
            .unwrap_err();

        assert!(matches!(error, InstallError::ServiceConvergenceError { .. }));
        assert_eq!(error.phase(), Some(Phase::Converge));
        assert_eq!(
            providers::list(&env.providers).unwrap(),
            vec!["radius-plugin-1.1.jar"]
        );
        assert_eq!(
            *service.calls.lock().unwrap(),
            vec!["build", "restart", "status", "logs"]
        );
        assert!(runner.programs().contains(&"ss".to_string()));
    }

    #[tokio::test]
    async fn test_failure_without_rollback_keeps_placement() {
        let env = sandbox();
        let runner = ss_runner();
        let releases = FakeReleases::with_assets(&["radius-plugin-1.2.jar"]);
        let service = FakeHost {
            fail_restart: true,
            ..FakeHost::default()
        };

        Reconciler::new(&env.config, &runner, &releases, &service)
            .with_options(RunOptions {
                rollback: false,
                ..options()
            })
            .reconcile(&desired("S3cr3t=="), &latest(), &env.providers, &env.plugin_config)
            .await
            .unwrap_err();

        assert_eq!(
            providers::list(&env.providers).unwrap(),
            vec!["radius-plugin-1.2.jar"]
        );
    }

    #[tokio::test]
    async fn test_stale_variants_removed() {
        let env = sandbox();
        fs::create_dir_all(&env.providers).unwrap();
        for name in ["radius-plugin-1.2-javadoc.jar", "radius-plugin-1.2-tests.jar"] {
            fs::write(env.providers.join(name), b"x").unwrap();
        }

        let runner = ss_runner();
        let releases = FakeReleases::with_assets(&["radius-plugin-1.2.jar"]);
        let service = FakeHost::default();

        let report = Reconciler::new(&env.config, &runner, &releases, &service)
            .with_options(options())
            .reconcile(&desired("S3cr3t=="), &latest(), &env.providers, &env.plugin_config)
            .await
            .unwrap();

        assert_eq!(report.removed.len(), 2);
        assert_eq!(
            providers::list(&env.providers).unwrap(),
            vec!["radius-plugin-1.2.jar"]
        );
    }

    #[tokio::test]
    async fn test_archive_fallback() {
        let env = sandbox();
        let runner = ss_runner().respond(|spec| {
            if spec.program != "unzip" {
                return None;
            }
            if spec.args.first().map(String::as_str) == Some("-Z1") {
                return Some(CommandOutput::ok(
                    "dist/\ndist/radius-plugin-1.2.jar\ndist/radius-plugin-1.2-sources.jar\n",
                ));
            }
            let dest = spec
                .args
                .iter()
                .position(|arg| arg == "-d")
                .and_then(|index| spec.args.get(index + 1))
                .unwrap();
            fs::write(Path::new(dest).join("radius-plugin-1.2.jar"), b"from zip").unwrap();
            Some(CommandOutput::ok(""))
        });
        let releases = FakeReleases::with_assets(&["keycloak-radius-plugin-dist.zip"]);
        let service = FakeHost::default();

        let report = Reconciler::new(&env.config, &runner, &releases, &service)
            .with_options(options())
            .reconcile(&desired("S3cr3t=="), &latest(), &env.providers, &env.plugin_config)
            .await
            .unwrap();

        assert_eq!(report.artifacts, vec!["radius-plugin-1.2.jar"]);
        assert_eq!(
            fs::read(env.providers.join("radius-plugin-1.2.jar")).unwrap(),
            b"from zip"
        );
    }

    #[tokio::test]
    async fn test_secondary_plugin_required_when_enabled() {
        let mut env = sandbox();
        env.config.artifacts.install_secondary = true;

        let runner = ss_runner();
        let releases = FakeReleases::with_assets(&["radius-plugin-1.2.jar"]);
        let service = FakeHost::default();

        let error = Reconciler::new(&env.config, &runner, &releases, &service)
            .with_options(options())
            .reconcile(&desired("S3cr3t=="), &latest(), &env.providers, &env.plugin_config)
            .await
            .unwrap_err();
        assert!(matches!(error, InstallError::NoArtifactFound { .. }));

        let releases =
            FakeReleases::with_assets(&["radius-plugin-1.2.jar", "rad-sec-plugin-1.2.jar"]);
        let report = Reconciler::new(&env.config, &runner, &releases, &service)
            .with_options(options())
            .reconcile(&desired("S3cr3t=="), &latest(), &env.providers, &env.plugin_config)
            .await
            .unwrap();
        assert_eq!(
            report.artifacts,
            vec!["radius-plugin-1.2.jar", "rad-sec-plugin-1.2.jar"]
        );
    }

    #[tokio::test]
    async fn test_local_source_directory() {
        let env = sandbox();
        let build = tempdir().unwrap();
        fs::write(build.path().join("radius-plugin-2.0-javadoc.jar"), b"docs").unwrap();
        fs::write(build.path().join("radius-plugin-2.0.jar"), b"local").unwrap();

        let runner = ss_runner();
        let releases = FakeReleases::with_assets(&[]);
        let service = FakeHost::default();

        Reconciler::new(&env.config, &runner, &releases, &service)
            .with_options(options())
            .reconcile(
                &desired("S3cr3t=="),
                &ArtifactSource::Local {
                    path: build.path().to_path_buf(),
                },
                &env.providers,
                &env.plugin_config,
            )
            .await
            .unwrap();

        assert_eq!(
            providers::list(&env.providers).unwrap(),
            vec!["radius-plugin-2.0.jar"]
        );
        assert!(releases.downloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_changes_nothing() {
        let env = sandbox();
        let runner = ss_runner();
        let releases = FakeReleases::with_assets(&["radius-plugin-1.2.jar"]);
        let service = FakeHost::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = Reconciler::new(&env.config, &runner, &releases, &service)
            .with_options(options())
            .with_cancellation(cancel)
            .reconcile(&desired("S3cr3t=="), &latest(), &env.providers, &env.plugin_config)
            .await
            .unwrap_err();

        assert!(error.is_cancelled());
        assert!(!env.providers.exists());
        assert!(!env.plugin_config.exists());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let env = sandbox();
        let runner = SystemRunner::new(true);
        let releases = FakeReleases::with_assets(&["radius-plugin-1.2.jar"]);
        let service = FakeHost::default();

        let report = Reconciler::new(&env.config, &runner, &releases, &service)
            .with_options(RunOptions {
                preflight: false,
                ..RunOptions::default()
            })
            .reconcile(&desired("S3cr3t=="), &latest(), &env.providers, &env.plugin_config)
            .await;

        // Package manager detection may fail on hosts without one
        if let Ok(report) = report {
            assert!(report.dry_run);
            assert_eq!(report.artifacts, vec!["radius-plugin-1.2.jar"]);
            assert!(!report.restarted);
        }
        assert!(!env.providers.exists());
        assert!(!env.plugin_config.exists());
        assert!(!env.config.lock_path.exists());
        assert!(releases.downloads.lock().unwrap().is_empty());
        assert!(service.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plan_artifacts() {
        let env = sandbox();
        let runner = ss_runner();
        let releases =
            FakeReleases::with_assets(&["radius-plugin-1.2-tests.jar", "radius-plugin-1.2.jar"]);
        let service = FakeHost::default();

        let names = Reconciler::new(&env.config, &runner, &releases, &service)
            .plan_artifacts(&latest())
            .await
            .unwrap();
        assert_eq!(names, vec!["radius-plugin-1.2.jar"]);
        assert!(releases.downloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plan_artifacts_git_runs_nothing() {
        let mut env = sandbox();
        env.config.source.git_ref = Some("v1.4.12".to_string());
        env.config.artifacts.install_secondary = true;
        let runner = ScriptedRunner::new();
        let releases = FakeReleases::with_assets(&[]);
        let service = FakeHost::default();

        let lines = Reconciler::new(&env.config, &runner, &releases, &service)
            .plan_artifacts(&ArtifactSource::Git)
            .await
            .unwrap();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r"^radius-plugin-.*\.jar$"));
        assert!(lines[0].contains("keycloak-radius-plugin.git"));
        assert!(lines[0].contains("v1.4.12"));
        assert!(lines[1].contains("rad-sec-plugin"));
        assert!(runner.programs().is_empty());
    }

    #[tokio::test]
    async fn test_configure_only() {
        let env = sandbox();
        let runner = ss_runner();
        let releases = FakeReleases::with_assets(&[]);
        let service = FakeHost::default();

        let plan = Reconciler::new(&env.config, &runner, &releases, &service)
            .configure(&DesiredConfig::default(), &env.plugin_config)
            .await
            .unwrap();

        assert_eq!(plan.secret_origin, SecretOrigin::Generated);
        let document = read_json(&env.plugin_config);
        assert_eq!(document["sharedSecret"].as_str().unwrap().len(), 32);
        assert!(service.calls.lock().unwrap().is_empty());
    }
}
