//! Memoizing layer builder.
//!
//! A [`LayerBuilder`] wraps one immutable snapshot. Each build step (`run`,
//! `copy`, `do_`, `resize`) derives a cache key from that snapshot and the
//! step's descriptor, returns the cached layer on a hit, and otherwise
//! provisions an instance, performs the step, and finalizes the instance
//! into the next layer. A failed step persists nothing.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{AgentLoop, AgentSession};
use crate::backend::{
    CloudApi, CreateSnapshot, Metadata, RemoteInstance, Resources, Snapshot, SnapshotQuery,
    SnapshotSpec, StartInstance, TAG_KEY, TtlAction,
};
use crate::cache::{Invalidate, SnapshotCache, newest_first};
use crate::config::ResolvedConfig;
use crate::crash::{self, KernelCrash};
use crate::error::SnapError;
use crate::exec::{self, Completion, Output, PollOptions};
use crate::key;
use crate::logging::{LayerLogger, rotate_logs};
use crate::progress::{LineStyle, PanelStatus, ProgressReporter};
use crate::verify::Check;

// ── BuildContext ────────────────────────────────────────────────────

/// Dependencies shared by every builder in a chain: the cloud client, the
/// live view, and resolved settings. Cloning shares all three.
pub struct BuildContext<C> {
    api: Arc<C>,
    reporter: ProgressReporter,
    config: Arc<ResolvedConfig>,
}

impl<C> Clone for BuildContext<C> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            reporter: self.reporter.clone(),
            config: self.config.clone(),
        }
    }
}

impl<C: CloudApi> BuildContext<C> {
    pub fn new(api: C, reporter: ProgressReporter, config: ResolvedConfig) -> Self {
        Self {
            api: Arc::new(api),
            reporter,
            config: Arc::new(config),
        }
    }

    /// Build the reporter from the configured output mode.
    pub fn from_config(api: C, config: ResolvedConfig) -> Self {
        let reporter = ProgressReporter::new(config.mode, config.max_lines);
        Self::new(api, reporter, config)
    }

    pub fn api(&self) -> &C {
        &self.api
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn cache(&self) -> SnapshotCache<C> {
        SnapshotCache::new(self.api.clone())
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            interval: self.config.poll_interval,
            chunk_size: self.config.chunk_size,
        }
    }

    /// Persist a kernel crash against `instance`'s snapshot and return the
    /// fault to raise.
    pub async fn crash_fault(&self, instance: &C::Instance, crash: KernelCrash) -> SnapError {
        crash::crash_fault(self.api.as_ref(), instance, crash).await
    }

    fn transcript(&self, layer: &str) -> Option<LayerLogger> {
        let dir = self.config.transcript_dir.as_deref()?;
        match LayerLogger::new(dir, layer) {
            Ok(logger) => Some(logger),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "transcript disabled for layer");
                None
            }
        }
    }

    fn close_transcript(&self, transcript: Option<LayerLogger>, layer: &str, success: bool) {
        let (Some(transcript), Some(dir)) = (transcript, self.config.transcript_dir.as_deref()) else {
            return;
        };
        let path = transcript.finish(success);
        tracing::debug!(path = %path.display(), "transcript written");
        rotate_logs(dir, layer, self.config.transcript_keep);
    }
}

// ── Options ─────────────────────────────────────────────────────────

/// Overrides for [`LayerBuilder::create`]; unset fields come from config.
#[derive(Debug, Default)]
pub struct CreateOptions {
    pub image_id: Option<String>,
    pub vcpus: Option<u32>,
    /// MB
    pub memory: Option<u64>,
    /// MB
    pub disk_size: Option<u64>,
    pub invalidate: Invalidate,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Merged over the default `{root: <snapshot id>}`.
    pub metadata: Metadata,
    pub ttl_seconds: Option<u64>,
    pub ttl_action: Option<TtlAction>,
}

/// How `apply` obtains the instance a step runs on.
#[derive(Debug, Clone, Copy, Default)]
pub enum InstanceSource {
    /// Start a fresh instance of the base snapshot.
    #[default]
    Start,
    /// Boot with size overrides and wait `settle` for the guest.
    Boot { resources: Resources, settle: Duration },
}

/// A running service started by [`LayerBuilder::deploy`].
pub struct Deployment<I> {
    pub instance: I,
    pub name: String,
    pub url: String,
}

impl<I: RemoteInstance> Deployment<I> {
    /// Hide the service and stop the instance.
    pub async fn shutdown(self) -> Result<(), SnapError> {
        let hidden = self.instance.hide_http_service(&self.name).await;
        self.instance.stop().await?;
        hidden
    }
}

fn spec_summary(spec: SnapshotSpec) -> String {
    format!(
        "vcpus={}, memory={}MB, disk={}MB",
        spec.vcpus, spec.memory, spec.disk_size
    )
}

async fn release<I: RemoteInstance>(instance: &I) {
    match instance.stop().await {
        Ok(()) => tracing::debug!(instance = %instance.id(), "instance stopped"),
        Err(e) => tracing::warn!(instance = %instance.id(), error = %e, "failed to stop instance"),
    }
}

// ── LayerBuilder ────────────────────────────────────────────────────

pub struct LayerBuilder<C: CloudApi> {
    ctx: BuildContext<C>,
    snapshot: Snapshot,
}

impl<C: CloudApi> Clone for LayerBuilder<C> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

impl<C: CloudApi> std::fmt::Debug for LayerBuilder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerBuilder")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

impl<C: CloudApi> LayerBuilder<C> {
    /// Wrap an existing snapshot.
    pub fn new(ctx: BuildContext<C>, snapshot: Snapshot) -> Self {
        Self { ctx, snapshot }
    }

    /// Create a base snapshot named `name` from an image. Entries already
    /// recorded under `name` are dropped first if `options.invalidate`
    /// selects them.
    pub async fn create(ctx: BuildContext<C>, name: &str, options: CreateOptions) -> Result<Self, SnapError> {
        let config = ctx.config();
        let image_id = options.image_id.unwrap_or_else(|| config.image_id.clone());
        let spec = SnapshotSpec {
            vcpus: options.vcpus.unwrap_or(config.vcpus),
            memory: options.memory.unwrap_or(config.memory_mb),
            disk_size: options.disk_size.unwrap_or(config.disk_size_mb),
        };
        ctx.reporter()
            .system_panel("create", format!("image_id={image_id}, {}", spec_summary(spec)));

        ctx.cache().invalidate(name, &options.invalidate).await?;

        let mut metadata = Metadata::new();
        metadata.insert("name".to_string(), name.to_string());
        let snapshot = ctx
            .api()
            .create_snapshot(CreateSnapshot {
                image_id,
                spec,
                digest: Some(name.to_string()),
                metadata,
            })
            .await?;
        tracing::info!(snapshot = %snapshot.id, %name, "base snapshot created");
        Ok(Self::new(ctx, snapshot))
    }

    pub async fn from_snapshot_id(ctx: BuildContext<C>, snapshot_id: &str) -> Result<Self, SnapError> {
        ctx.reporter()
            .system_panel("from_snapshot_id", format!("snapshot_id={snapshot_id}"));
        let snapshot = ctx.api().get_snapshot(snapshot_id).await?;
        Ok(Self::new(ctx, snapshot))
    }

    /// The most recently created snapshot carrying `tag`, if any.
    pub async fn from_tag(ctx: BuildContext<C>, tag: &str) -> Result<Option<Self>, SnapError> {
        ctx.reporter().system_panel("from_tag", format!("tag={tag}"));
        let mut wanted = Metadata::new();
        wanted.insert(TAG_KEY.to_string(), tag.to_string());
        let found = ctx.api().list_snapshots(&SnapshotQuery::Metadata(wanted)).await?;
        Ok(newest_first(found)
            .into_iter()
            .next()
            .map(|snapshot| Self::new(ctx, snapshot)))
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn id(&self) -> &str {
        &self.snapshot.id
    }

    pub fn context(&self) -> &BuildContext<C> {
        &self.ctx
    }

    /// Cache key for applying `descriptor` on top of this layer.
    pub fn key_for(&self, descriptor: &str) -> String {
        key::derive(self.snapshot.digest.as_deref(), &self.snapshot.id, descriptor)
    }

    fn wrap(&self, snapshot: Snapshot) -> Self {
        Self::new(self.ctx.clone(), snapshot)
    }

    async fn provision(&self, source: InstanceSource) -> Result<C::Instance, SnapError> {
        match source {
            InstanceSource::Start => self.start(StartOptions::default()).await,
            InstanceSource::Boot { resources, settle } => {
                let instance = self.ctx.api().boot_instance(&self.snapshot.id, resources).await?;
                tracing::debug!(instance = %instance.id(), ?settle, "waiting for guest to settle");
                tokio::time::sleep(settle).await;
                Ok(instance)
            }
        }
    }

    /// Generic memoized step.
    ///
    /// With a `descriptor`, entries selected by `invalidate` are dropped,
    /// then a hit is returned without starting anything. On a miss (or
    /// without a descriptor) an instance is obtained from `source` and
    /// handed to `op`, which may return a replacement instance. The
    /// resulting instance is snapshotted under the key and stopped.
    ///
    /// An `op` error is returned as-is with no snapshot persisted; the
    /// instance is still stopped.
    pub async fn apply<F, Fut>(
        &self,
        descriptor: Option<&str>,
        source: InstanceSource,
        invalidate: &Invalidate,
        op: F,
    ) -> Result<Self, SnapError>
    where
        F: FnOnce(C::Instance) -> Fut,
        Fut: Future<Output = Result<Option<C::Instance>, SnapError>>,
    {
        let digest = descriptor.map(|d| self.key_for(d));
        if let Some(digest) = digest.as_deref() {
            let cache = self.ctx.cache();
            let dropped = cache.invalidate(digest, invalidate).await?;
            if dropped > 0 {
                tracing::info!(%digest, dropped, "cache entries invalidated");
            }
            if let Some(hit) = cache.hit(digest).await? {
                tracing::info!(base = %self.snapshot.id, snapshot = %hit.id, "cache hit");
                return Ok(self.wrap(hit));
            }
            tracing::info!(base = %self.snapshot.id, %digest, "cache miss");
        }

        let instance = self.provision(source).await?;
        tracing::info!(instance = %instance.id(), base = %self.snapshot.id, "instance provisioned");

        let finished = match op(instance.clone()).await {
            Ok(Some(replacement)) => {
                if replacement.id() != instance.id() {
                    release(&instance).await;
                }
                replacement
            }
            Ok(None) => instance,
            Err(e) => {
                release(&instance).await;
                return Err(e);
            }
        };

        let stored = self.ctx.cache().store(&finished, digest.as_deref()).await;
        release(&finished).await;
        let snapshot = stored?;
        tracing::info!(base = %self.snapshot.id, snapshot = %snapshot.id, "layer finalized");
        Ok(self.wrap(snapshot))
    }

    /// Run a shell command as a cached layer.
    pub async fn run(&self, command: &str, invalidate: impl Into<Invalidate>) -> Result<Self, SnapError> {
        self.ctx.reporter().system_panel("run", command);
        let ctx = self.ctx.clone();
        let base = self.snapshot.id.clone();
        self.apply(
            Some(command),
            InstanceSource::Start,
            &invalidate.into(),
            |instance| async move {
                execute_command(&ctx, &base, command, &instance).await?;
                Ok(None)
            },
        )
        .await
    }

    /// Upload a local file or directory as a cached layer.
    ///
    /// The key covers the two paths only; file contents never take part.
    pub async fn copy(
        &self,
        src: impl AsRef<Path>,
        dest: &str,
        invalidate: impl Into<Invalidate>,
    ) -> Result<Self, SnapError> {
        let src = src.as_ref();
        let src_text = src.display().to_string();
        self.ctx
            .reporter()
            .system_panel("copy", format!("src={src_text} -> dest={dest}"));

        if tokio::fs::metadata(src).await.is_err() {
            return Err(SnapError::SourceNotFound { path: src_text });
        }

        let ctx = self.ctx.clone();
        let descriptor = key::copy_descriptor(&src_text, dest);
        self.apply(
            Some(&descriptor),
            InstanceSource::Start,
            &invalidate.into(),
            |instance| async move {
                let panel = ctx.reporter().add_panel("file copy");
                panel.log(&format!("copying {src_text} to {dest}"), LineStyle::Normal);
                match crate::copy::copy_to(&instance, src, dest, &panel).await {
                    Ok(summary) => {
                        panel.log(
                            &format!("copied {} file(s)", summary.files),
                            LineStyle::Success,
                        );
                        panel.finish(PanelStatus::Success);
                        Ok(None)
                    }
                    Err(e) => {
                        panel.log(&format!("copy failed: {e}"), LineStyle::Error);
                        panel.finish(PanelStatus::Failed);
                        Err(e)
                    }
                }
            },
        )
        .await
    }

    /// Have an agent loop carry out `instructions` as a cached layer.
    ///
    /// The key covers the instructions and the names of `checks`, so
    /// requiring a different set of checks is a different layer. The step
    /// fails with [`SnapError::AgentIncomplete`] unless the agent reports
    /// completion and the checks pass; check failures are fed to the agent
    /// through its session rather than raised on their own.
    pub async fn do_<A>(
        &self,
        instructions: &str,
        agent: &mut A,
        checks: Vec<Box<dyn Check<C::Instance>>>,
        invalidate: impl Into<Invalidate>,
    ) -> Result<Self, SnapError>
    where
        A: AgentLoop<C::Instance>,
    {
        let descriptor = key::do_descriptor(instructions, checks.iter().map(|c| c.name()));
        let panel = self.ctx.reporter().add_panel(instructions);
        let reporter = self.ctx.reporter().clone();
        let poll = self.ctx.poll_options();
        let base = self.snapshot.id.clone();

        let mut executed = false;
        let flag = &mut executed;
        let agent_panel = panel.clone();
        let result = self
            .apply(
                Some(&descriptor),
                InstanceSource::Start,
                &invalidate.into(),
                move |instance| async move {
                    *flag = true;
                    let mut session =
                        AgentSession::new(&instance, instructions, agent_panel, reporter, &checks, poll);
                    let outcome = agent.run(&mut session).await?;
                    let verified = match session.verified() {
                        Some(passed) => passed,
                        None if session.has_checks() => session.verify().await.passed(),
                        None => true,
                    };
                    if outcome.completed && verified {
                        session.log(&outcome.summary);
                        return Ok(None);
                    }
                    tracing::warn!(%instructions, summary = %outcome.summary, "agent did not complete");
                    Err(SnapError::AgentIncomplete {
                        base,
                        instructions: instructions.to_string(),
                    })
                },
            )
            .await;

        match &result {
            Ok(_) if !executed => {
                panel.set_row("", "cached");
                panel.finish(PanelStatus::Cached);
            }
            Ok(_) => panel.finish(PanelStatus::Success),
            Err(_) => panel.finish(PanelStatus::Failed),
        }
        result
    }

    /// Re-snapshot this layer on an instance booted with new sizes.
    pub async fn resize(&self, resources: Resources, invalidate: impl Into<Invalidate>) -> Result<Self, SnapError> {
        self.ctx
            .reporter()
            .system_panel("resize", spec_summary(resources.over(self.snapshot.spec)));
        let descriptor = key::resize_descriptor(resources.vcpus, resources.memory, resources.disk_size);
        let source = InstanceSource::Boot {
            resources,
            settle: self.ctx.config().resize_settle,
        };
        self.apply(Some(&descriptor), source, &invalidate.into(), |_| async {
            Ok(None)
        })
        .await
    }

    // ── Uncached pass-throughs ──────────────────────────────────────

    /// Start an instance of this layer. The caller owns it.
    pub async fn start(&self, options: StartOptions) -> Result<C::Instance, SnapError> {
        let mut metadata = Metadata::new();
        metadata.insert("root".to_string(), self.snapshot.id.clone());
        metadata.extend(options.metadata);
        let instance = self
            .ctx
            .api()
            .start_instance(StartInstance {
                snapshot_id: self.snapshot.id.clone(),
                metadata,
                ttl_seconds: options.ttl_seconds,
                ttl_action: options.ttl_action,
            })
            .await?;
        tracing::info!(instance = %instance.id(), snapshot = %self.snapshot.id, "instance started");
        Ok(instance)
    }

    /// Boot with optional size overrides. The caller owns the instance.
    pub async fn boot(&self, resources: Resources) -> Result<C::Instance, SnapError> {
        self.ctx
            .reporter()
            .system_panel("boot", spec_summary(resources.over(self.snapshot.spec)));
        let instance = self.ctx.api().boot_instance(&self.snapshot.id, resources).await?;
        tracing::info!(instance = %instance.id(), snapshot = %self.snapshot.id, "instance booted");
        Ok(instance)
    }

    /// Boot, run `f`, and stop the instance whatever `f` returned.
    pub async fn with_boot<F, Fut, T>(&self, resources: Resources, f: F) -> Result<T, SnapError>
    where
        F: FnOnce(C::Instance) -> Fut,
        Fut: Future<Output = Result<T, SnapError>>,
    {
        let instance = self.boot(resources).await?;
        let result = f(instance.clone()).await;
        let stopped = instance.stop().await;
        let value = result?;
        stopped?;
        Ok(value)
    }

    /// Start an instance and expose `port` as an HTTP service.
    pub async fn deploy(&self, name: &str, port: u16) -> Result<Deployment<C::Instance>, SnapError> {
        self.ctx
            .reporter()
            .system_panel("deploy", format!("name={name}, port={port}"));
        let instance = self.start(StartOptions::default()).await?;
        let url = match instance.expose_http_service(name, port).await {
            Ok(url) => url,
            Err(e) => {
                release(&instance).await;
                return Err(e);
            }
        };
        tracing::info!(instance = %instance.id(), %url, "service started");
        self.ctx.reporter().system_panel("service", url.clone());
        Ok(Deployment {
            instance,
            name: name.to_string(),
            url,
        })
    }

    /// Label this snapshot with `tag`, keeping its other metadata.
    pub async fn tag(&mut self, tag: &str) -> Result<(), SnapError> {
        self.ctx.reporter().system_panel("tag", format!("tag={tag}"));
        let mut metadata = self.snapshot.metadata.clone();
        metadata.insert(TAG_KEY.to_string(), tag.to_string());
        self.ctx
            .api()
            .set_snapshot_metadata(&self.snapshot.id, metadata.clone())
            .await?;
        self.snapshot.metadata = metadata;
        tracing::info!(snapshot = %self.snapshot.id, %tag, "snapshot tagged");
        Ok(())
    }
}

/// Stream `command` into a CMD/output/RET panel and turn a non-zero exit
/// or a dropped connection into an error carrying the visible output.
async fn execute_command<C: CloudApi>(
    ctx: &BuildContext<C>,
    base: &str,
    command: &str,
    instance: &C::Instance,
) -> Result<(), SnapError> {
    let panel = ctx.reporter().add_panel("run");
    panel.set_row("CMD", command);
    let mut transcript = ctx.transcript(command);

    let completion = exec::run(instance, command, ctx.poll_options(), |stream, text| {
        let style = match stream {
            Output::Stdout => LineStyle::Normal,
            Output::Stderr => LineStyle::Error,
        };
        panel.append(text, style);
        if let Some(log) = transcript.as_mut() {
            log.write(text);
        }
    })
    .await;

    let completion = match completion {
        Ok(completion) => completion,
        Err(e) => {
            panel.finish(PanelStatus::Failed);
            ctx.close_transcript(transcript, command, false);
            return Err(e);
        }
    };

    let success = completion == Completion::Exited(0);
    panel.set_footer(
        "RET",
        match completion {
            Completion::Exited(code) => code.to_string(),
            Completion::ConnectionLost => "connection lost".to_string(),
        },
    );
    panel.finish(if success {
        PanelStatus::Success
    } else {
        PanelStatus::Failed
    });
    ctx.close_transcript(transcript, command, success);

    match completion {
        Completion::Exited(0) => Ok(()),
        Completion::Exited(exit_code) => Err(SnapError::CommandFailed {
            base: base.to_string(),
            command: command.to_string(),
            exit_code,
            output: panel.output(),
        }),
        Completion::ConnectionLost => Err(SnapError::ConnectionLost {
            base: base.to_string(),
            command: command.to_string(),
            output: panel.output(),
        }),
    }
}
