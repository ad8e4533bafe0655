//! Rootless Podman engine
//!
//! Every exec runs as `podman run --rm --rootfs <copy of its root>`. Files
//! inside snapshots are owned by ids of the user namespace, so host-side
//! copies and removals go through `podman unshare`.

use crate::cache::{labels, CacheVolume};
use crate::config::Config;
use crate::engine::snapshot::{digest_hex, host_path, Snapshot, SnapshotStore};
use crate::engine::{error_tail, stream_child_output, Engine, ProgressFn};
use crate::error::{DalecError, DalecResult};
use crate::llb::{CacheSharing, ExecOp, FileAction, MountKind, NetworkMode, Node, Op, Output, State};
use crate::session::BuildSession;
use async_trait::async_trait;
use futures_util::future::{try_join, try_join_all, BoxFuture};
use futures_util::FutureExt;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Time a cancelled command gets to exit after SIGTERM
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Engine executing graphs with rootless Podman
pub struct PodmanEngine {
    binary: String,
    store: SnapshotStore,
    volume_prefix: String,
    network: Option<String>,
    progress: Option<ProgressFn>,
    inflight: Mutex<HashMap<PathBuf, Arc<OnceCell<PathBuf>>>>,
    cache_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    volumes: tokio::sync::Mutex<HashSet<String>>,
    image_env: Mutex<HashMap<String, Vec<String>>>,
}

impl PodmanEngine {
    pub fn new(binary: impl Into<String>, state_dir: impl Into<PathBuf>, volume_prefix: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            store: SnapshotStore::new(state_dir),
            volume_prefix: volume_prefix.into(),
            network: None,
            progress: None,
            inflight: Mutex::new(HashMap::new()),
            cache_locks: Mutex::new(HashMap::new()),
            volumes: tokio::sync::Mutex::new(HashSet::new()),
            image_env: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut engine = Self::new(&config.engine.podman, config.state_dir(), &config.cache.volume_prefix);
        engine.network = config.engine.network.clone();
        engine
    }

    /// Report command output lines to `progress`
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Execute a Podman command and return its output
    async fn exec(&self, args: &[&str]) -> DalecResult<std::process::Output> {
        debug!("Executing: {} {:?}", self.binary, args);

        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DalecError::command_failed(format!("{} {:?}", self.binary, args), e))
    }

    /// Execute a Podman command that must succeed, returning stdout
    async fn exec_ok(&self, args: &[&str]) -> DalecResult<String> {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(DalecError::command_exec(format!("podman {}", args.join(" ")), stderr))
        }
    }

    /// Run a host command inside the rootless user namespace
    async fn unshare(&self, args: &[&str]) -> DalecResult<()> {
        let mut full = vec!["unshare"];
        full.extend_from_slice(args);
        self.exec_ok(&full).await.map(|_| ())
    }

    /// Copy the contents of `src` into the existing directory `dst`
    async fn copy_tree(&self, src: &Path, dst: &Path) -> DalecResult<()> {
        let from = format!("{}/.", src.display());
        let to = dst.display().to_string();
        self.unshare(&["cp", "-a", "--reflink=auto", &from, &to]).await
    }

    async fn remove_dir(&self, path: &Path) -> DalecResult<()> {
        let path = path.display().to_string();
        self.unshare(&["rm", "-rf", &path]).await
    }

    async fn pull(&self, image: &str) -> DalecResult<()> {
        info!("Pulling image: {}", image);

        let output = self.exec(&["pull", image]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DalecError::ImagePull {
                image: image.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    async fn image_exists(&self, image: &str) -> DalecResult<bool> {
        let output = self.exec(&["image", "exists", image]).await?;
        Ok(output.status.success())
    }

    /// Build `target` once, sharing the result with concurrent solves
    async fn memoized<F, Fut>(&self, target: PathBuf, build: F) -> DalecResult<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = DalecResult<()>>,
    {
        let cell = {
            let mut inflight = self
                .inflight
                .lock()
                .map_err(|_| DalecError::Internal("snapshot table poisoned".to_string()))?;
            inflight.entry(target.clone()).or_default().clone()
        };

        let path = cell
            .get_or_try_init(|| async {
                if self.store.exists(&target).await {
                    debug!("Snapshot cached: {}", target.display());
                    return Ok(target.clone());
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|e| DalecError::io(format!("creating {}", parent.display()), e))?;
                }

                let tmp = self.store.temp_dir(&target).await?;
                if let Err(e) = build(tmp.clone()).await {
                    if let Err(cleanup) = self.remove_dir(&tmp).await {
                        warn!("Failed to remove {}: {}", tmp.display(), cleanup);
                    }
                    return Err(e);
                }
                if !self.store.commit(&tmp, &target).await? {
                    self.remove_dir(&tmp).await?;
                }
                Ok(target.clone())
            })
            .await?;
        Ok(path.clone())
    }

    fn solve_state<'a>(&'a self, st: &'a State, session: &'a BuildSession) -> BoxFuture<'a, DalecResult<PathBuf>> {
        async move {
            session.check_cancelled()?;
            let Some(node) = st.node() else {
                return Ok(self.store.scratch().await?.path);
            };

            if let Op::Exec(exec) = &node.op {
                let dir = self.solve_exec(exec, session).await?;
                return Ok(match node.output {
                    Output::Root => dir.join("root"),
                    Output::Mount(index) => dir.join(format!("mount-{}", index)),
                });
            }

            let digest = st.digest()?;
            let target = self.store.path_for(&digest, st.is_volatile(), session.id());
            let path = self
                .memoized(target, |tmp| async move { self.build_node(node, &tmp, session).await })
                .await?;

            if let Op::Image { reference } = &node.op {
                self.remember_image_env(reference, &path).await?;
            }
            Ok(path)
        }
        .boxed()
    }

    async fn build_node(&self, node: &Node, tmp: &Path, session: &BuildSession) -> DalecResult<()> {
        match &node.op {
            Op::Image { reference } => self.unpack_image(reference, tmp).await,
            Op::Local {
                name,
                includes,
                excludes,
            } => copy_context(session.context(name)?, includes, excludes, tmp).await,
            Op::Http { url, digest, filename } => fetch_http(url, digest.as_deref(), &tmp.join(filename)).await,
            Op::Git {
                url,
                commit,
                keep_git_dir,
            } => checkout_git(url, commit, *keep_git_dir, tmp).await,
            Op::File { input, action } => {
                let base = self.solve_state(input, session).await?;
                self.copy_tree(&base, tmp).await?;
                self.apply_file_action(action, tmp, session).await
            }
            Op::Merge { inputs } => {
                let paths = try_join_all(inputs.iter().map(|i| self.solve_state(i, session))).await?;
                for path in paths {
                    self.copy_tree(&path, tmp).await?;
                }
                Ok(())
            }
            Op::Exec(_) => Err(DalecError::Internal("exec nodes are solved by output".to_string())),
        }
    }

    async fn apply_file_action(&self, action: &FileAction, tmp: &Path, session: &BuildSession) -> DalecResult<()> {
        match action {
            FileAction::Mkfile { path, mode, data } => self.store.write_file(tmp, path, *mode, data).await,
            FileAction::Mkdir { path, mode } => self.store.make_dir(tmp, path, *mode).await,
            FileAction::Copy { src, src_path, dest } => {
                let src_root = self.solve_state(src, session).await?;
                let from = host_path(&src_root, src_path);
                let to = host_path(tmp, dest);
                let is_dir = fs::metadata(&from)
                    .await
                    .map_err(|e| DalecError::io(format!("reading {}", from.display()), e))?
                    .is_dir();

                if is_dir {
                    fs::create_dir_all(&to)
                        .await
                        .map_err(|e| DalecError::io(format!("creating {}", to.display()), e))?;
                    self.copy_tree(&from, &to).await
                } else {
                    if let Some(parent) = to.parent() {
                        fs::create_dir_all(parent)
                            .await
                            .map_err(|e| DalecError::io(format!("creating {}", parent.display()), e))?;
                    }
                    let (from, to) = (from.display().to_string(), to.display().to_string());
                    self.unshare(&["cp", "-a", &from, &to]).await
                }
            }
        }
    }

    async fn unpack_image(&self, reference: &str, tmp: &Path) -> DalecResult<()> {
        if !self.image_exists(reference).await? {
            self.pull(reference).await?;
        }

        let id = self.exec_ok(&["create", reference, "true"]).await?.trim().to_string();
        let tar = tmp.with_extension("tar");
        let tar_arg = tar.display().to_string();
        let exported = self.exec_ok(&["export", "-o", &tar_arg, &id]).await;
        if let Err(e) = self.exec_ok(&["rm", "-f", &id]).await {
            warn!("Failed to remove container {}: {}", id, e);
        }
        exported?;

        let dest = tmp.display().to_string();
        let unpacked = self.unshare(&["tar", "-xf", &tar_arg, "-C", &dest]).await;
        let _ = fs::remove_file(&tar).await;
        unpacked
    }

    /// Load the image's configured environment for execs rooted on it
    async fn remember_image_env(&self, reference: &str, snapshot: &Path) -> DalecResult<()> {
        if self.image_env_for(reference).is_some() {
            return Ok(());
        }

        let sidecar = snapshot.with_extension("env.json");
        let env: Vec<String> = match fs::read_to_string(&sidecar).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(_) => {
                let env = match self.exec_ok(&["image", "inspect", reference, "--format", "json"]).await {
                    Ok(out) => parse_image_env(&out)?,
                    Err(e) => {
                        warn!("Cannot read environment of {}: {}", reference, e);
                        Vec::new()
                    }
                };
                fs::write(&sidecar, serde_json::to_vec(&env)?)
                    .await
                    .map_err(|e| DalecError::io(format!("writing {}", sidecar.display()), e))?;
                env
            }
        };

        if let Ok(mut map) = self.image_env.lock() {
            map.insert(reference.to_string(), env);
        }
        Ok(())
    }

    fn image_env_for(&self, reference: &str) -> Option<Vec<String>> {
        self.image_env.lock().ok()?.get(reference).cloned()
    }

    async fn ensure_volume(&self, key: &str, sharing: CacheSharing) -> DalecResult<String> {
        let volume = CacheVolume::for_key(&self.volume_prefix, key, sharing);
        let mut created = self.volumes.lock().await;
        if created.contains(&volume.name) {
            return Ok(volume.name);
        }

        debug!("Creating volume: {} for cache {}", volume.name, key);
        let label_strings: Vec<String> = volume
            .labels()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let mut args = vec!["volume", "create", "--ignore"];
        for label in &label_strings {
            args.push("--label");
            args.push(label);
        }
        args.push(&volume.name);

        let output = self.exec(&args).await?;
        if !output.status.success() {
            return Err(DalecError::CacheVolumeCreate {
                name: volume.name,
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        created.insert(volume.name.clone());
        Ok(volume.name)
    }

    fn cache_lock(&self, key: &str) -> DalecResult<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .cache_locks
            .lock()
            .map_err(|_| DalecError::Internal("cache lock table poisoned".to_string()))?;
        Ok(locks.entry(key.to_string()).or_default().clone())
    }

    async fn solve_exec(&self, exec: &Arc<ExecOp>, session: &BuildSession) -> DalecResult<PathBuf> {
        let digest = exec_digest(exec)?;
        let volatile = exec.ignore_cache || exec.inputs().any(State::is_volatile);
        let target = self.store.path_for(&digest, volatile, session.id());
        self.memoized(target, |tmp| async move { self.run_exec(exec, &tmp, session).await })
            .await
    }

    async fn run_exec(&self, exec: &ExecOp, tmp: &Path, session: &BuildSession) -> DalecResult<()> {
        let snapshot_inputs: Vec<&State> = exec
            .mounts
            .iter()
            .filter_map(|m| match &m.kind {
                MountKind::Snapshot { input, .. } => Some(input),
                _ => None,
            })
            .collect();
        let (root, inputs) = try_join(
            self.solve_state(&exec.root, session),
            try_join_all(snapshot_inputs.iter().map(|s| self.solve_state(s, session))),
        )
        .await?;

        let rootfs = tmp.join("root");
        fs::create_dir_all(&rootfs)
            .await
            .map_err(|e| DalecError::io(format!("creating {}", rootfs.display()), e))?;
        self.copy_tree(&root, &rootfs).await?;

        let mut args: Vec<String> = vec!["run".into(), "--rm".into(), "--workdir".into(), exec.cwd.clone()];
        match (exec.network, &self.network) {
            (NetworkMode::None, _) => args.extend(["--network".into(), "none".into()]),
            (NetworkMode::Host, _) => args.extend(["--network".into(), "host".into()]),
            (NetworkMode::Default, Some(net)) => args.extend(["--network".into(), net.clone()]),
            (NetworkMode::Default, None) => {}
        }

        let base_env = exec
            .root
            .base_image()
            .and_then(|image| self.image_env_for(image))
            .unwrap_or_default();
        for kv in base_env {
            let overridden = kv
                .split_once('=')
                .is_some_and(|(k, _)| exec.env.contains_key(k));
            if !overridden {
                args.extend(["-e".into(), kv]);
            }
        }
        for (k, v) in &exec.env {
            args.extend(["-e".into(), format!("{}={}", k, v)]);
        }

        let mut locked_keys = Vec::new();
        let mut inputs = inputs.into_iter();
        for (index, mount) in exec.mounts.iter().enumerate() {
            match &mount.kind {
                MountKind::Snapshot { selector, readonly, .. } => {
                    let input = inputs
                        .next()
                        .ok_or_else(|| DalecError::Internal("mount inputs out of sync".to_string()))?;
                    if *readonly {
                        let src = host_path(&input, selector.as_deref().unwrap_or("/"));
                        args.extend(["-v".into(), format!("{}:{}:ro", src.display(), mount.dest)]);
                    } else {
                        let out = tmp.join(format!("mount-{}", index));
                        fs::create_dir_all(&out)
                            .await
                            .map_err(|e| DalecError::io(format!("creating {}", out.display()), e))?;
                        self.copy_tree(&input, &out).await?;
                        args.extend(["-v".into(), format!("{}:{}", out.display(), mount.dest)]);
                    }
                }
                MountKind::Cache { key, sharing } => match sharing {
                    CacheSharing::Private => args.extend(["-v".into(), mount.dest.clone()]),
                    CacheSharing::Shared | CacheSharing::Locked => {
                        let volume = self.ensure_volume(key, *sharing).await?;
                        if *sharing == CacheSharing::Locked {
                            locked_keys.push(key.clone());
                        }
                        args.extend(["-v".into(), format!("{}:{}", volume, mount.dest)]);
                    }
                },
                MountKind::Tmpfs => args.extend(["--tmpfs".into(), mount.dest.clone()]),
            }
        }

        let mut child_env = Vec::new();
        for secret in &exec.secret_env {
            let value = session.secret(&secret.id)?;
            args.extend(["-e".into(), secret.name.clone()]);
            child_env.push((secret.name.clone(), value.expose().to_string()));
        }

        let mut agent_set = exec.env.contains_key("SSH_AUTH_SOCK");
        for forward in &exec.ssh {
            let socket = match session.ssh_socket(&forward.id) {
                Ok(socket) => socket,
                Err(_) if forward.optional => continue,
                Err(e) => return Err(e),
            };
            args.extend(["-v".into(), format!("{}:{}", socket.display(), forward.target)]);
            if !agent_set {
                args.extend(["-e".into(), format!("SSH_AUTH_SOCK={}", forward.target)]);
                agent_set = true;
            }
        }

        args.extend(["--rootfs".into(), rootfs.display().to_string()]);
        args.extend(exec.args.iter().cloned());

        // Keys are sorted so concurrent execs always lock in the same order
        locked_keys.sort();
        locked_keys.dedup();
        let mut guards = Vec::new();
        for key in &locked_keys {
            guards.push(self.cache_lock(key)?.lock_owned().await);
        }

        info!("Running: {}", exec.label());
        let result = self.run_cancellable(args, child_env, &exec.label(), session).await;
        drop(guards);
        result
    }

    /// Run `podman` with `args`, stopping it when the session is cancelled
    async fn run_cancellable(
        &self,
        args: Vec<String>,
        env: Vec<(String, String)>,
        label: &str,
        session: &BuildSession,
    ) -> DalecResult<()> {
        debug!("Executing: {} {:?}", self.binary, args);

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in env {
            cmd.env(k, v);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| DalecError::command_failed(format!("{} run", self.binary), e))?;
        let pid = child.id();

        let progress = self.progress.clone();
        let on_output = move |line: String| {
            debug!("{}", line);
            if let Some(progress) = &progress {
                progress(line);
            }
        };

        let run = async {
            let lines = stream_child_output(&mut child, &on_output).await;
            let status = child
                .wait()
                .await
                .map_err(|e| DalecError::command_failed(format!("{} run", self.binary), e))?;
            Ok::<_, DalecError>((status, lines))
        };
        tokio::pin!(run);

        let (status, lines) = tokio::select! {
            res = &mut run => res?,
            _ = session.cancelled() => {
                terminate(pid);
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut run).await;
                return Err(DalecError::Cancelled);
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(DalecError::ExecFailed {
                description: label.to_string(),
                code: status.code().unwrap_or(-1),
                stderr: error_tail(&lines),
            })
        }
    }
}

#[async_trait]
impl Engine for PodmanEngine {
    async fn ensure_ready(&self) -> DalecResult<()> {
        let installed = Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if !installed {
            return Err(DalecError::PodmanNotFound);
        }

        let rootless = self
            .exec_ok(&["info", "--format", "{{.Host.Security.Rootless}}"])
            .await?;
        if rootless.trim() != "true" {
            warn!("Podman is not running rootless");
        }

        let root = self.store.root();
        fs::create_dir_all(root)
            .await
            .map_err(|e| DalecError::io(format!("creating {}", root.display()), e))
    }

    async fn solve(&self, state: &State, session: &BuildSession) -> DalecResult<Snapshot> {
        let path = self.solve_state(state, session).await?;
        Ok(Snapshot {
            digest: state.digest()?,
            path,
        })
    }

    async fn export(&self, snapshot: &Snapshot, dest: &Path) -> DalecResult<()> {
        info!("Exporting {} to {}", digest_hex(&snapshot.digest), dest.display());
        fs::create_dir_all(dest)
            .await
            .map_err(|e| DalecError::io(format!("creating {}", dest.display()), e))?;

        let from = format!("{}/.", snapshot.path.display());
        let to = dest.display().to_string();
        // Ownership is not preserved so exported files belong to the caller
        self.unshare(&["cp", "-R", "--preserve=mode,timestamps,links", &from, &to])
            .await
    }

    async fn cache_volumes(&self) -> DalecResult<Vec<CacheVolume>> {
        let filter = format!("label={}=true", labels::DALEC_CACHE);
        let stdout = self
            .exec_ok(&["volume", "ls", "--filter", &filter, "--format", "json"])
            .await?;
        let mut volumes = parse_volume_list(&stdout, &self.volume_prefix)?;
        if volumes.is_empty() {
            return Ok(volumes);
        }

        match self.exec_ok(&["system", "df", "-v", "--format", "json"]).await {
            Ok(df) => {
                let sizes = parse_volume_sizes(&df)?;
                for vol in &mut volumes {
                    vol.size_bytes = sizes.get(&vol.name).copied();
                }
            }
            Err(e) => debug!("Volume sizes unavailable: {}", e),
        }
        Ok(volumes)
    }

    async fn remove_cache_volume(&self, name: &str) -> DalecResult<()> {
        debug!("Removing volume: {}", name);

        let output = self.exec(&["volume", "rm", "-f", name]).await?;
        if output.status.success() {
            self.volumes.lock().await.remove(name);
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("no such volume") {
            Ok(())
        } else {
            Err(DalecError::command_exec("podman volume rm", stderr))
        }
    }

    async fn end_session(&self, session: &BuildSession) -> DalecResult<()> {
        let dir = self.store.base(true, session.id());
        self.inflight
            .lock()
            .map_err(|_| DalecError::Internal("snapshot table poisoned".to_string()))?
            .retain(|target, _| !target.starts_with(&dir));
        if self.store.exists(&dir).await {
            debug!("Removing session snapshots {}", dir.display());
            self.remove_dir(&dir).await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Podman"
    }
}

/// Content key of an exec, shared by all of its outputs
fn exec_digest(exec: &ExecOp) -> DalecResult<String> {
    let bytes = serde_json::to_vec(exec)?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
}

fn terminate(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: pid belongs to a child spawned by this process and not yet reaped
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

/// `Config.Env` of the first image in `podman image inspect` output
fn parse_image_env(json: &str) -> DalecResult<Vec<String>> {
    let images: Vec<serde_json::Value> = serde_json::from_str(json)?;
    Ok(images
        .first()
        .and_then(|img| img["Config"]["Env"].as_array())
        .map(|env| env.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default())
}

/// Volume sizes from `podman system df -v --format json`
fn parse_volume_sizes(json: &str) -> DalecResult<HashMap<String, u64>> {
    let df: serde_json::Value = serde_json::from_str(json)?;
    Ok(df["Volumes"]
        .as_array()
        .map(|vols| {
            vols.iter()
                .filter_map(|v| Some((v["VolumeName"].as_str()?.to_string(), v["Size"].as_u64()?)))
                .collect()
        })
        .unwrap_or_default())
}

/// Dalec cache volumes from `podman volume ls --format json`
fn parse_volume_list(json: &str, prefix: &str) -> DalecResult<Vec<CacheVolume>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }

    let volumes: Vec<serde_json::Value> = serde_json::from_str(json)?;
    let mut result = Vec::new();
    for vol in volumes {
        let name = vol["Name"].as_str().unwrap_or_default();
        if !name.starts_with(prefix) {
            continue;
        }

        let labels: HashMap<String, String> = vol["Labels"]
            .as_object()
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        if let Some(cache) = CacheVolume::from_labels(name, &labels) {
            result.push(cache);
        }
    }
    Ok(result)
}

/// Copy a local context into `dest`
///
/// Includes are paths relative to the context root; excludes are tar patterns.
async fn copy_context(src: &Path, includes: &[String], excludes: &[String], dest: &Path) -> DalecResult<()> {
    if !src.is_dir() {
        return Err(DalecError::PathNotFound(src.to_path_buf()));
    }

    let mut create = Command::new("tar");
    create.arg("-C").arg(src).arg("-cf").arg("-");
    for pattern in excludes {
        create.arg(format!("--exclude={}", pattern));
    }
    if includes.is_empty() {
        create.arg(".");
    } else {
        create.args(includes);
    }
    debug!("Copying context {} to {}", src.display(), dest.display());

    let mut producer = create
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DalecError::command_failed("tar -c", e))?;
    let pipe: Stdio = producer
        .stdout
        .take()
        .ok_or_else(|| DalecError::Internal("tar stdout not piped".to_string()))?
        .try_into()
        .map_err(|e| DalecError::io("connecting tar pipe", e))?;

    let extract = Command::new("tar")
        .arg("-C")
        .arg(dest)
        .arg("-xf")
        .arg("-")
        .stdin(pipe)
        .output()
        .await
        .map_err(|e| DalecError::command_failed("tar -x", e))?;
    let created = producer
        .wait_with_output()
        .await
        .map_err(|e| DalecError::command_failed("tar -c", e))?;

    if !created.status.success() {
        return Err(DalecError::command_exec("tar -c", String::from_utf8_lossy(&created.stderr)));
    }
    if !extract.status.success() {
        return Err(DalecError::command_exec("tar -x", String::from_utf8_lossy(&extract.stderr)));
    }
    Ok(())
}

/// Download `url` to `dest`, verifying the sha256 digest when given
async fn fetch_http(url: &str, digest: Option<&str>, dest: &Path) -> DalecResult<()> {
    info!("Downloading {}", url);
    let url = url.to_string();
    let expected = digest.map(|d| digest_hex(d).to_ascii_lowercase());
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || -> DalecResult<()> {
        let http_err = |reason: String| DalecError::HttpFetch {
            url: url.clone(),
            reason,
        };
        let response = ureq::get(&url).call().map_err(|e| http_err(e.to_string()))?;
        let mut reader = response.into_body().into_reader();
        let mut file = std::fs::File::create(&dest)
            .map_err(|e| DalecError::io(format!("creating {}", dest.display()), e))?;

        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).map_err(|e| http_err(e.to_string()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])
                .map_err(|e| DalecError::io(format!("writing {}", dest.display()), e))?;
        }

        let actual = hex::encode(hasher.finalize());
        match expected {
            Some(expected) if expected != actual => Err(DalecError::DigestMismatch {
                url,
                expected: format!("sha256:{}", expected),
                actual: format!("sha256:{}", actual),
            }),
            _ => Ok(()),
        }
    })
    .await
    .map_err(|e| DalecError::Internal(format!("download task failed: {}", e)))?
}

/// Clone `url` into `dest` and check out `commit`
async fn checkout_git(url: &str, commit: &str, keep_git_dir: bool, dest: &Path) -> DalecResult<()> {
    info!("Cloning {} at {}", url, commit);
    let dest_arg = dest.display().to_string();

    for args in [
        vec!["clone", "--quiet", url, dest_arg.as_str()],
        vec!["-C", dest_arg.as_str(), "checkout", "--quiet", commit],
    ] {
        debug!("Executing: git {:?}", args);
        let output = Command::new("git")
            .args(&args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .map_err(|e| DalecError::command_failed("git", e))?;
        if !output.status.success() {
            return Err(DalecError::command_exec(
                format!("git {}", args.join(" ")),
                String::from_utf8_lossy(&output.stderr),
            ));
        }
    }

    if !keep_git_dir {
        let git_dir = dest.join(".git");
        fs::remove_dir_all(&git_dir)
            .await
            .map_err(|e| DalecError::io(format!("removing {}", git_dir.display()), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llb::RunOption;
    use tempfile::TempDir;

    #[test]
    fn exec_digest_covers_mounts() {
        let worker = State::image("busybox");
        let exec = worker.run([RunOption::shell("true")]);
        let root = exec.clone().root();
        let mount = exec.add_mount("/out", State::scratch());

        let digest_of = |st: &State| match &st.node().unwrap().op {
            Op::Exec(e) => exec_digest(e).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        assert_ne!(digest_of(&root), digest_of(&mount));
        assert_eq!(digest_of(&root), digest_of(&worker.run([RunOption::shell("true")]).root()));
    }

    #[test]
    fn parses_image_env() {
        let json = r#"[{"Config":{"Env":["PATH=/usr/local/go/bin:/usr/bin","GOLANG_VERSION=1.22.1"]}}]"#;
        assert_eq!(
            parse_image_env(json).unwrap(),
            vec!["PATH=/usr/local/go/bin:/usr/bin", "GOLANG_VERSION=1.22.1"]
        );
        assert!(parse_image_env("[]").unwrap().is_empty());
    }

    #[test]
    fn volume_list_keeps_labelled_prefixed_volumes() {
        let vol = CacheVolume::for_key("dalec-cache-", "jammy-linux/amd64-dalec-gobuildcache", CacheSharing::Shared);
        let labels = serde_json::to_value(vol.labels()).unwrap();
        let json = serde_json::json!([
            { "Name": vol.name, "Labels": labels },
            { "Name": "dalec-cache-unlabelled", "Labels": {} },
            { "Name": "other", "Labels": labels },
        ])
        .to_string();

        let parsed = parse_volume_list(&json, "dalec-cache-").unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].key, "jammy-linux/amd64-dalec-gobuildcache");
        assert!(parse_volume_list("", "dalec-cache-").unwrap().is_empty());
    }

    #[test]
    fn parses_volume_sizes() {
        let json = r#"{"Images":[],"Volumes":[{"VolumeName":"dalec-cache-abc","Links":0,"Size":2048},{"VolumeName":"x"}]}"#;
        let sizes = parse_volume_sizes(json).unwrap();
        assert_eq!(sizes.get("dalec-cache-abc"), Some(&2048));
        assert!(!sizes.contains_key("x"));
    }

    #[tokio::test]
    async fn context_copy_honors_excludes() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        std::fs::write(src.path().join("go.mod"), "module x\n").unwrap();
        std::fs::create_dir(src.path().join("vendor")).unwrap();
        std::fs::write(src.path().join("vendor/skip"), "").unwrap();

        copy_context(src.path(), &[], &["./vendor".to_string()], dest.path())
            .await
            .unwrap();
        assert!(dest.path().join("go.mod").exists());
        assert!(!dest.path().join("vendor").exists());
    }

    #[tokio::test]
    async fn missing_context_dir_is_reported() {
        let dest = TempDir::new().unwrap();
        let err = copy_context(Path::new("/nonexistent/dalec"), &[], &[], dest.path())
            .await
            .unwrap_err();
        assert!(matches!(err, DalecError::PathNotFound(_)));
    }

    #[tokio::test]
    async fn ending_a_session_forgets_its_snapshots() {
        let state_dir = TempDir::new().unwrap();
        let engine = PodmanEngine::new("podman", state_dir.path(), "dalec-test-");
        let session = BuildSession::builder().build().await.unwrap();
        let volatile = engine.store.base(true, session.id()).join("abc");
        let persistent = engine.store.base(false, session.id()).join("def");
        {
            let mut inflight = engine.inflight.lock().unwrap();
            inflight.insert(volatile.clone(), Arc::new(OnceCell::new()));
            inflight.insert(persistent.clone(), Arc::new(OnceCell::new()));
        }

        engine.end_session(&session).await.unwrap();

        let inflight = engine.inflight.lock().unwrap();
        assert!(!inflight.contains_key(&volatile));
        assert!(inflight.contains_key(&persistent));
    }

    #[tokio::test]
    #[ignore = "requires rootless podman"]
    async fn runs_exec_against_image() {
        let state_dir = TempDir::new().unwrap();
        let engine = PodmanEngine::new("podman", state_dir.path(), "dalec-test-");
        engine.ensure_ready().await.unwrap();
        let session = BuildSession::builder().build().await.unwrap();

        let out = State::image("docker.io/library/busybox:latest")
            .run([RunOption::shell("echo bar > /out/foo")])
            .add_mount("/out", State::scratch());
        let snapshot = engine.solve(&out, &session).await.unwrap();
        assert_eq!(std::fs::read_to_string(snapshot.path.join("foo")).unwrap(), "bar\n");
        engine.end_session(&session).await.unwrap();
    }
}
