//! The `cp` command: resolves settings and dispatches to the transfer engine.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use obsctl_local_store::LocalStore;
use obsctl_transfer::{
    CheckpointStore, CopyOperation, DownloadOperation, FlowPolicy, ObjectStore,
    SharedTransferState, TaskExecutor, ThreadExecutor, TransferError, TransferKind,
    TransferOptions, UploadOperation, multipart_etag, parse_byte_size,
};
use tracing::{info, warn};

use crate::cli::CpArgs;
use crate::config::Config;
use crate::report::ProgressReporter;
use crate::target::{Location, basename, is_prefix, join_key};

/// Effective settings after applying command-line overrides to the config.
#[derive(Debug, Clone)]
pub struct CopySettings {
    pub part_size: u64,
    pub part_threshold: u64,
    pub tasknum: usize,
    pub parttasknum: usize,
    pub checkpoint_dir: Option<PathBuf>,
    pub flow_width: u64,
    pub flow_policy: Option<FlowPolicy>,
    pub verify: bool,
    pub version_id: Option<String>,
}

impl CopySettings {
    pub fn resolve(args: &CpArgs, config: &Config) -> anyhow::Result<Self> {
        let task = &config.task;
        let part_size = parse_byte_size(args.partsize.as_deref().unwrap_or(&task.partsize))
            .context("invalid part size")?;
        let part_threshold =
            parse_byte_size(&task.part_threshold).context("invalid part threshold")?;
        let flow_width = parse_byte_size(args.flowwidth.as_deref().unwrap_or(&task.flowwidth))
            .context("invalid flow width")?;
        let flow_policy = match args.flowpolicy.as_deref().or(task.flowpolicy.as_deref()) {
            Some(json) => Some(FlowPolicy::parse(json)?).filter(|p| !p.is_empty()),
            None => None,
        };
        let checkpoint_dir = if args.no_checkpoint || !task.checkpoint {
            None
        } else {
            Some(
                args.checkpoint_dir
                    .clone()
                    .unwrap_or_else(|| task.checkpoint_dir.clone()),
            )
        };

        Ok(Self {
            part_size,
            part_threshold,
            tasknum: args.tasknum.unwrap_or(task.tasknum).max(1),
            parttasknum: args.parttasknum.unwrap_or(task.parttasknum).max(1),
            checkpoint_dir,
            flow_width,
            flow_policy,
            verify: args.verify,
            version_id: args.version_id.clone(),
        })
    }

    pub fn options(&self) -> TransferOptions {
        let options = TransferOptions::new()
            .part_size(self.part_size)
            .part_threshold(self.part_threshold)
            .task_num(self.parttasknum);
        match &self.checkpoint_dir {
            Some(dir) => options.checkpoint_dir(dir),
            None => options,
        }
    }

    /// Byte rate ceiling in force now; the policy wins when it covers the
    /// current local time.
    pub fn flow_limit(&self) -> Option<u64> {
        let now = chrono::Local::now().time();
        self.flow_policy
            .as_ref()
            .and_then(|p| p.width_at(now))
            .or(Some(self.flow_width))
            .filter(|&w| w > 0)
    }
}

/// Runs `cp` to completion.
pub fn copy(args: &CpArgs, config: &Config, shared: Arc<SharedTransferState>) -> anyhow::Result<()> {
    let settings = CopySettings::resolve(args, config)?;
    let store = LocalStore::open(&config.store.root)
        .with_context(|| format!("cannot open store at {}", config.store.root.display()))?;
    let transfers = Transfers {
        store: Arc::new(store),
        shared,
        settings: Arc::new(settings),
    };

    let src = Location::parse(&args.src)?;
    let dest = Location::parse(&args.dest)?;
    if args.recursive {
        return match (src, dest) {
            (Location::Local(dir), Location::Remote { bucket, key }) => {
                transfers.upload_dir(&dir, &bucket, &key)
            }
            _ => bail!("--recursive only uploads a local directory to obs://"),
        };
    }

    match (src, dest) {
        (Location::Local(file), Location::Remote { bucket, key }) => {
            let key = if is_prefix(&key) {
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .with_context(|| format!("{} has no file name", file.display()))?;
                join_key(&key, &name)
            } else {
                key
            };
            let total = std::fs::metadata(&file).map(|m| m.len()).ok();
            let _report = ProgressReporter::start(Arc::clone(&transfers.shared), total);
            transfers.upload_file(&file, &bucket, &key)
        }
        (Location::Remote { bucket, key }, Location::Local(path)) => {
            if is_prefix(&key) {
                bail!("obs://{bucket}/{key} names a prefix, not an object");
            }
            let file = if path.is_dir() || args.dest.ends_with(['/', '\\']) {
                path.join(basename(&key))
            } else {
                path
            };
            let total = transfers.object_size(&bucket, &key);
            let _report = ProgressReporter::start(Arc::clone(&transfers.shared), total);
            transfers.download(&bucket, &key, &file)
        }
        (
            Location::Remote {
                bucket: src_bucket,
                key: src_key,
            },
            Location::Remote { bucket, key },
        ) => {
            if is_prefix(&src_key) {
                bail!("obs://{src_bucket}/{src_key} names a prefix, not an object");
            }
            let key = if is_prefix(&key) {
                join_key(&key, basename(&src_key))
            } else {
                key
            };
            let total = transfers.object_size(&src_bucket, &src_key);
            let _report = ProgressReporter::start(Arc::clone(&transfers.shared), total);
            transfers.copy(&src_bucket, &src_key, &bucket, &key)
        }
        (Location::Local(_), Location::Local(_)) => {
            bail!("one side of cp must be an obs:// path")
        }
    }
}

/// Everything a single file transfer needs; cheap to clone into workers.
#[derive(Clone)]
struct Transfers {
    store: Arc<dyn ObjectStore>,
    shared: Arc<SharedTransferState>,
    settings: Arc<CopySettings>,
}

impl Transfers {
    fn object_size(&self, bucket: &str, key: &str) -> Option<u64> {
        let version = self.settings.version_id.as_deref();
        self.store
            .get_object_metadata(bucket, key, version)
            .ok()?
            .into_result()
            .ok()
            .map(|meta| meta.size)
    }

    fn upload_file(&self, file: &Path, bucket: &str, key: &str) -> anyhow::Result<()> {
        let options = self.settings.options();
        let mut upload = UploadOperation::new(
            Arc::clone(&self.store),
            Arc::clone(&self.shared),
            bucket,
            key,
            file,
            options,
        );
        let outcome = upload.upload(self.settings.flow_limit())?;

        if self.settings.verify {
            let local = multipart_etag(file, outcome.part_size)?;
            if local != outcome.etag {
                return Err(TransferError::EtagMismatch {
                    remote: outcome.etag,
                    local,
                }
                .into());
            }
            info!(key, etag = %local, "etag verified");
        }

        info!(file = %file.display(), "uploaded to obs://{bucket}/{key}");
        Ok(())
    }

    fn download(&self, bucket: &str, key: &str, file: &Path) -> anyhow::Result<()> {
        if self.settings.verify {
            warn!("--verify only applies to uploads");
        }
        let mut download = DownloadOperation::new(
            Arc::clone(&self.store),
            Arc::clone(&self.shared),
            bucket,
            key,
            file,
            self.settings.options(),
        )
        .with_version_id(self.settings.version_id.clone());
        let outcome = download.download(self.settings.flow_limit())?;
        info!(
            file = %outcome.path.display(),
            size = outcome.size,
            "downloaded obs://{bucket}/{key}"
        );
        Ok(())
    }

    fn copy(&self, src_bucket: &str, src_key: &str, bucket: &str, key: &str) -> anyhow::Result<()> {
        if self.settings.verify {
            warn!("--verify only applies to uploads");
        }
        let mut copy = CopyOperation::new(
            Arc::clone(&self.store),
            Arc::clone(&self.shared),
            (src_bucket, src_key),
            (bucket, key),
            self.settings.options(),
        );
        let outcome = copy.copy(self.settings.flow_limit())?;
        info!(
            etag = %outcome.etag,
            "copied obs://{src_bucket}/{src_key} to obs://{bucket}/{key}"
        );
        Ok(())
    }

    /// Uploads every file below `dir`, `tasknum` files at a time.
    fn upload_dir(&self, dir: &Path, bucket: &str, prefix: &str) -> anyhow::Result<()> {
        if !dir.is_dir() {
            bail!("{} is not a directory", dir.display());
        }
        let mut files = Vec::new();
        walk(dir, dir, &mut files)?;
        let jobs = self.schedule(files, bucket, prefix);
        let total = jobs
            .iter()
            .filter_map(|(file, _)| std::fs::metadata(file).ok())
            .map(|m| m.len())
            .sum();
        info!(files = jobs.len(), tasknum = self.settings.tasknum, "uploading directory");

        let _report = ProgressReporter::start(Arc::clone(&self.shared), Some(total));
        let failures: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut executor = ThreadExecutor::with_token("upload-file", self.shared.token());
        let job_count = jobs.len();

        for (file, key) in jobs {
            while executor.running() >= self.settings.tasknum {
                executor.wait_any();
            }
            if executor.is_cancelled() {
                break;
            }
            let transfers = self.clone();
            let failures = Arc::clone(&failures);
            let bucket = bucket.to_string();
            executor.spawn(Box::new(move || {
                if let Err(e) = transfers.upload_file(&file, &bucket, &key) {
                    warn!(file = %file.display(), error = %e, "file upload failed");
                    let mut failures = failures.lock().unwrap_or_else(|p| p.into_inner());
                    failures.push(format!("{}: {e:#}", file.display()));
                }
            }))?;
        }
        executor.join();

        let failures = failures.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(first) = failures.first() {
            bail!("{} of {job_count} files failed, first: {first}", failures.len());
        }
        if self.shared.is_cancelled() {
            return Err(TransferError::Cancelled.into());
        }
        Ok(())
    }

    /// Maps files to keys; files with an upload checkpoint run first.
    fn schedule(&self, files: Vec<(PathBuf, String)>, bucket: &str, prefix: &str) -> Vec<(PathBuf, String)> {
        let mut jobs: Vec<(bool, PathBuf, String)> = files
            .into_iter()
            .map(|(file, rel)| {
                let key = join_key(prefix, &rel);
                let resumable = self.settings.checkpoint_dir.as_deref().is_some_and(|dir| {
                    CheckpointStore::for_transfer(
                        dir,
                        TransferKind::Upload,
                        bucket,
                        &key,
                        &file.to_string_lossy(),
                    )
                    .exists()
                });
                (resumable, file, key)
            })
            .collect();
        jobs.sort_by_key(|(resumable, _, _)| !*resumable);
        jobs.into_iter().map(|(_, file, key)| (file, key)).collect()
    }
}

/// Collects regular files below `dir` with their `/`-separated paths
/// relative to `root`, in a stable order.
fn walk(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, String)>) -> anyhow::Result<()> {
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path.strip_prefix(root)?;
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((path, key));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use clap::Parser;
    use tempfile::TempDir;

    fn args(argv: &[&str]) -> CpArgs {
        let mut full = vec!["obsctl", "cp"];
        full.extend_from_slice(argv);
        match crate::cli::Cli::try_parse_from(full).unwrap().command {
            crate::cli::Command::Cp(args) => args,
        }
    }

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.store.root = dir.path().join("store");
        config.task.checkpoint_dir = dir.path().join("checkpoints");
        config.task.partsize = "1K".into();
        config.task.part_threshold = "0".into();
        config
    }

    fn write(path: &Path, len: usize) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let data: Vec<u8> = (0..len).map(|i| (i % 199) as u8).collect();
        std::fs::write(path, data).unwrap();
    }

    fn run(dir: &TempDir, argv: &[&str]) -> anyhow::Result<()> {
        let config = config(dir);
        LocalStore::open(&config.store.root)
            .unwrap()
            .create_bucket("bucket")
            .unwrap();
        copy(&args(argv), &config, Arc::new(SharedTransferState::new()))
    }

    #[test]
    fn settings_prefer_flags() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let settings = CopySettings::resolve(
            &args(&["a", "obs://b/a", "--partsize", "2M", "--parttasknum", "3", "--no-checkpoint"]),
            &config,
        )
        .unwrap();
        assert_eq!(settings.part_size, 2 * 1024 * 1024);
        assert_eq!(settings.parttasknum, 3);
        assert_eq!(settings.tasknum, 4);
        assert!(settings.checkpoint_dir.is_none());
        assert_eq!(settings.flow_limit(), None);
    }

    #[test]
    fn settings_flow_width_and_policy() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let settings =
            CopySettings::resolve(&args(&["a", "obs://b/a", "--flowwidth", "1M"]), &config)
                .unwrap();
        assert_eq!(settings.flow_limit(), Some(1024 * 1024));

        // A policy covering the whole day always applies.
        let settings = CopySettings::resolve(
            &args(&[
                "a",
                "obs://b/a",
                "--flowwidth",
                "1M",
                "--flowpolicy",
                r#"{"00:00-23:59": "2K", "23:59-00:00": "2K"}"#,
            ]),
            &config,
        )
        .unwrap();
        assert_eq!(settings.flow_limit(), Some(2048));
    }

    #[test]
    fn invalid_part_size_is_reported() {
        let dir = TempDir::new().unwrap();
        let err = CopySettings::resolve(&args(&["a", "obs://b/a", "--partsize", "lots"]), &config(&dir))
            .unwrap_err();
        assert!(err.to_string().contains("part size"));
    }

    #[test]
    fn upload_then_download_into_directory() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in/data.bin");
        write(&src, 3000);

        run(&dir, &[src.to_str().unwrap(), "obs://bucket/backup/", "--verify"]).unwrap();
        assert!(dir.path().join("store/bucket/backup/data.bin").is_file());

        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        run(&dir, &["obs://bucket/backup/data.bin", out.to_str().unwrap()]).unwrap();
        assert_eq!(
            std::fs::read(out.join("data.bin")).unwrap(),
            std::fs::read(&src).unwrap()
        );
    }

    #[test]
    fn verify_after_resume_with_other_part_size() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("big.bin");
        write(&src, 5000);
        let argv = [src.to_str().unwrap(), "obs://bucket/big.bin"];

        // Session is initiated with 1K parts, then cancelled before any part goes out.
        let cancelled = Arc::new(SharedTransferState::new());
        cancelled.cancel();
        let config = config(&dir);
        LocalStore::open(&config.store.root)
            .unwrap()
            .create_bucket("bucket")
            .unwrap();
        assert!(copy(&args(&argv), &config, cancelled).is_err());

        run(&dir, &[argv[0], argv[1], "--partsize", "2K", "--verify"]).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("store/bucket/big.bin")).unwrap(),
            std::fs::read(&src).unwrap()
        );
    }

    #[test]
    fn server_side_copy_to_prefix() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.bin");
        write(&src, 2500);
        run(&dir, &[src.to_str().unwrap(), "obs://bucket/a.bin"]).unwrap();
        run(&dir, &["obs://bucket/a.bin", "obs://bucket/copies/"]).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("store/bucket/copies/a.bin")).unwrap(),
            std::fs::read(&src).unwrap()
        );
    }

    #[test]
    fn recursive_upload_maps_relative_paths() {
        let dir = TempDir::new().unwrap();
        let tree = dir.path().join("tree");
        write(&tree.join("top.txt"), 10);
        write(&tree.join("nested/deep/leaf.bin"), 2100);
        write(&tree.join("nested/empty.dat"), 0);

        run(
            &dir,
            &[tree.to_str().unwrap(), "obs://bucket/mirror", "-r", "--tasknum", "2"],
        )
        .unwrap();
        let root = dir.path().join("store/bucket/mirror");
        assert!(root.join("top.txt").is_file());
        assert_eq!(
            std::fs::metadata(root.join("nested/deep/leaf.bin")).unwrap().len(),
            2100
        );
        assert!(root.join("nested/empty.dat").is_file());
    }

    #[test]
    fn recursive_requires_upload_direction() {
        let dir = TempDir::new().unwrap();
        let err = run(&dir, &["obs://bucket/a", dir.path().to_str().unwrap(), "-r"]).unwrap_err();
        assert!(err.to_string().contains("--recursive"));
    }

    #[test]
    fn local_to_local_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(run(&dir, &["a", "b"]).is_err());
    }

    #[test]
    fn missing_bucket_fails() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.bin");
        write(&src, 10);
        let err = run(&dir, &[src.to_str().unwrap(), "obs://nowhere/a.bin"]).unwrap_err();
        assert!(err.to_string().contains("404"), "{err}");
    }

    #[test]
    fn walk_orders_and_slashes() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("b.txt"), 1);
        write(&dir.path().join("a/z.txt"), 1);
        let mut files = Vec::new();
        walk(dir.path(), dir.path(), &mut files).unwrap();
        let keys: Vec<_> = files.iter().map(|(_, k)| k.as_str()).collect();
        assert_eq!(keys, ["a/z.txt", "b.txt"]);
    }

    #[test]
    fn schedule_puts_resumable_first() {
        let dir = TempDir::new().unwrap();
        let checkpoints = dir.path().join("checkpoints");
        std::fs::create_dir_all(&checkpoints).unwrap();
        let second = dir.path().join("second.bin");
        let marker = CheckpointStore::for_transfer(
            &checkpoints,
            TransferKind::Upload,
            "bucket",
            "p/second.bin",
            &second.to_string_lossy(),
        );
        std::fs::write(marker.path(), "{}").unwrap();

        let transfers = Transfers {
            store: Arc::new(LocalStore::open(dir.path().join("store")).unwrap()),
            shared: Arc::new(SharedTransferState::new()),
            settings: Arc::new(
                CopySettings::resolve(&args(&["a", "obs://b/a"]), &config(&dir)).unwrap(),
            ),
        };
        let jobs = transfers.schedule(
            vec![
                (dir.path().join("first.bin"), "first.bin".into()),
                (second, "second.bin".into()),
            ],
            "bucket",
            "p",
        );
        assert_eq!(jobs[0].1, "p/second.bin");
        assert_eq!(jobs[1].1, "p/first.bin");
    }
}
