//! Writing a cloud assembly to disk and reading it back.

use infrakit_core::asset::{self, ASSET_INPUT_DIR, ASSET_OUTPUT_DIR};
use infrakit_core::executor::{Executor, JobSpec, JobStatus, LogLine};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::manifest::{AssemblyManifest, MANIFEST_FILE};
use crate::synthesizer::{AssetEntry, CloudAssembly};
use crate::{SynthError, SynthResult};

/// Writes a [`CloudAssembly`] into an output directory.
///
/// Assets are staged once per hash and assembly directory. Assets with
/// bundling options are produced by running the bundling command through the
/// configured executor; without bundling the source is copied as is.
pub struct AssemblyWriter {
    base_dir: PathBuf,
    executor: Option<Arc<dyn Executor>>,
}

impl AssemblyWriter {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            executor: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replace the contents of `out_dir` with `assembly`.
    ///
    /// An existing `out_dir` is cleared only when it is empty or holds a
    /// previous assembly, and never when it contains the base directory or
    /// an asset source.
    pub async fn write(&self, assembly: &CloudAssembly, out_dir: &Path) -> SynthResult<()> {
        if out_dir.exists() {
            self.check_replaceable(assembly, out_dir).await?;
            tokio::fs::remove_dir_all(out_dir)
                .await
                .map_err(|e| SynthError::io(out_dir, e))?;
        }

        let mut pending = vec![(assembly, out_dir.to_path_buf())];
        while let Some((current, dir)) = pending.pop() {
            self.write_one(current, &dir).await?;
            for nested in &current.nested {
                let directory = nested.directory.as_deref().ok_or_else(|| {
                    SynthError::InvalidAssembly(format!(
                        "nested assembly '{}' has no directory",
                        nested.display_name
                    ))
                })?;
                pending.push((nested, dir.join(directory)));
            }
        }

        info!(out_dir = %out_dir.display(), "Wrote cloud assembly");
        Ok(())
    }

    async fn check_replaceable(&self, assembly: &CloudAssembly, out_dir: &Path) -> SynthResult<()> {
        let out = out_dir
            .canonicalize()
            .map_err(|e| SynthError::io(out_dir, e))?;

        let mut protected = vec![self.base_dir.clone()];
        for stack in assembly.all_stacks() {
            protected.extend(stack.assets.iter().map(|e| e.asset.source_path(&self.base_dir)));
        }
        for path in protected {
            let Ok(path) = path.canonicalize() else {
                continue;
            };
            if path.starts_with(&out) {
                return Err(SynthError::InvalidAssembly(format!(
                    "refusing to replace {}: it contains {}",
                    out_dir.display(),
                    path.display()
                )));
            }
        }

        let mut entries = tokio::fs::read_dir(&out)
            .await
            .map_err(|e| SynthError::io(out_dir, e))?;
        let has_entries = entries
            .next_entry()
            .await
            .map_err(|e| SynthError::io(out_dir, e))?
            .is_some();
        if has_entries && !out.join(MANIFEST_FILE).exists() {
            return Err(SynthError::InvalidAssembly(format!(
                "refusing to replace {}: it is not empty and holds no {}",
                out_dir.display(),
                MANIFEST_FILE
            )));
        }
        Ok(())
    }

    async fn write_one(&self, assembly: &CloudAssembly, dir: &Path) -> SynthResult<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SynthError::io(dir, e))?;

        write_json(&dir.join(MANIFEST_FILE), &serde_json::to_value(assembly.manifest())?).await?;

        for stack in &assembly.stacks {
            write_json(&dir.join(&stack.template_file), &stack.template).await?;

            if let Some(assets_file) = stack.assets_file() {
                write_json(&dir.join(assets_file), &stack.asset_manifest()).await?;
            }

            for entry in &stack.assets {
                let target = dir.join(entry.staged_dir());
                if target.exists() {
                    continue;
                }
                self.stage_asset(entry, &target).await?;
            }
        }

        debug!(
            assembly = %assembly.display_name,
            stacks = assembly.stacks.len(),
            "Wrote assembly directory"
        );
        Ok(())
    }

    async fn stage_asset(&self, entry: &AssetEntry, target: &Path) -> SynthResult<()> {
        let source = entry.asset.source_path(&self.base_dir);
        if !source.exists() {
            return Err(infrakit_core::Error::NotFound(format!(
                "asset source '{}'",
                source.display()
            ))
            .into());
        }

        let Some(bundling) = &entry.asset.bundling else {
            let (src, dst) = (source.clone(), target.to_path_buf());
            let copied = tokio::task::spawn_blocking(move || asset::copy_tree(&src, &dst))
                .await
                .map_err(|e| infrakit_core::Error::Internal(e.to_string()))??;
            debug!(asset = %entry.hash, files = copied, "Staged asset");
            return Ok(());
        };

        let executor = self.executor.as_ref().ok_or_else(|| SynthError::Bundling {
            asset: entry.asset.path.clone(),
            message: "bundling requires an executor".to_string(),
        })?;

        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| SynthError::io(target, e))?;

        let spec = JobSpec {
            command: bundling.command.clone(),
            ..JobSpec::shell("")
        }
        .with_image(&bundling.image)
        .with_env(bundling.environment.clone())
        .with_working_dir(ASSET_INPUT_DIR)
        .with_volume(absolute(&source)?, ASSET_INPUT_DIR)
        .with_volume(absolute(target)?, ASSET_OUTPUT_DIR);

        info!(
            asset = %entry.asset.path,
            image = %bundling.image,
            executor = executor.name(),
            "Bundling asset"
        );

        let (tx, mut rx) = mpsc::channel::<LogLine>(100);
        let asset_path = entry.asset.path.clone();
        let forward = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                debug!(asset = %asset_path, "{}", line.content);
            }
        });

        let result = executor.run(spec, tx).await;
        let _ = forward.await;
        let result = result?;

        let failure = match &result.status {
            JobStatus::Succeeded { .. } => None,
            JobStatus::Failed { message, .. } => Some(message.clone()),
            JobStatus::Cancelled { .. } => Some("bundling was cancelled".to_string()),
        };
        if let Some(message) = failure {
            return Err(SynthError::Bundling {
                asset: entry.asset.path.clone(),
                message,
            });
        }

        if asset::list_files(target)?.is_empty() {
            return Err(SynthError::Bundling {
                asset: entry.asset.path.clone(),
                message: format!("bundling produced no files in {}", ASSET_OUTPUT_DIR),
            });
        }

        Ok(())
    }
}

fn absolute(path: &Path) -> SynthResult<PathBuf> {
    std::path::absolute(path).map_err(|e| SynthError::io(path, e))
}

async fn write_json(path: &Path, value: &Value) -> SynthResult<()> {
    let mut contents = serde_json::to_string_pretty(value)?;
    contents.push('\n');
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| SynthError::io(path, e))
}

/// Read `manifest.json` from an assembly directory.
pub fn read_manifest(dir: &Path) -> SynthResult<AssemblyManifest> {
    let path = dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Err(SynthError::InvalidAssembly(format!(
            "{} not found in {}",
            MANIFEST_FILE,
            dir.display()
        )));
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| SynthError::io(&path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Load a stack template from an assembly directory.
pub fn load_template(dir: &Path, template_file: &str) -> SynthResult<Value> {
    let path = dir.join(template_file);
    let contents = std::fs::read_to_string(&path).map_err(|e| SynthError::io(&path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Synthesizer;
    use async_trait::async_trait;
    use chrono::Utc;
    use infrakit_core::asset::{Asset, BundlingOptions};
    use infrakit_core::executor::JobResult;
    use infrakit_core::{ConstructTree, PropertyValue, Resource, ResourceKind};
    use std::sync::Mutex;

    /// Pretends to run the bundling command by writing into the output mount.
    struct MockExecutor {
        produce_output: bool,
        jobs: Mutex<Vec<JobSpec>>,
    }

    impl MockExecutor {
        fn new(produce_output: bool) -> Self {
            Self {
                produce_output,
                jobs: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Executor for MockExecutor {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn run(
            &self,
            spec: JobSpec,
            logs: mpsc::Sender<LogLine>,
        ) -> infrakit_core::Result<JobResult> {
            let _ = logs.send(LogLine::system("bundling")).await;
            if self.produce_output {
                let output = spec
                    .volumes
                    .iter()
                    .find(|v| v.mount_path == ASSET_OUTPUT_DIR)
                    .unwrap();
                std::fs::write(output.host_path.join("foo.py"), "").unwrap();
            }
            self.jobs.lock().unwrap().push(spec);
            let now = Utc::now();
            Ok(JobResult {
                status: JobStatus::Succeeded {
                    started_at: now,
                    finished_at: now,
                },
                exit_code: Some(0),
            })
        }
    }

    fn app(bundled: bool) -> ConstructTree {
        let mut asset = Asset::new("code");
        if bundled {
            asset.bundling = Some(BundlingOptions {
                image: "python:3.8".to_string(),
                command: vec![
                    "bash".to_string(),
                    "-c".to_string(),
                    "cp -r /asset-input/* /asset-output/".to_string(),
                ],
                environment: Default::default(),
            });
        }

        let mut tree = ConstructTree::new("app");
        let stage = tree.add_stage(tree.root(), "stage").unwrap();
        let stack = tree.add_stack(stage, "stack").unwrap();
        for id in ["hello", "world"] {
            tree.add_resource(
                stack,
                Resource::new(id, ResourceKind::function())
                    .with_property("code", PropertyValue::Asset(asset.clone())),
            )
            .unwrap();
        }
        tree
    }

    fn source_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("code")).unwrap();
        std::fs::write(dir.path().join("code/hello.py"), "def world(): pass\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let src = source_dir();
        let out = tempfile::tempdir().unwrap();
        let out_dir = out.path().join("infrakit.out");

        let assembly = Synthesizer::new(src.path()).synthesize(&app(false)).unwrap();
        AssemblyWriter::new(src.path())
            .write(&assembly, &out_dir)
            .await
            .unwrap();

        let root = read_manifest(&out_dir).unwrap();
        let nested = root.nested_assemblies().next().unwrap();
        assert_eq!(nested.directory, "assembly-stage");

        let stage_dir = out_dir.join(&nested.directory);
        let manifest = read_manifest(&stage_dir).unwrap();
        let stack = manifest.stack("stage/stack").unwrap();
        let template = load_template(&stage_dir, &stack.template_file).unwrap();
        assert_eq!(template["Resources"]["hello"]["Type"], "infrakit::function");

        // Both functions share one staged asset.
        let hash = template["Resources"]["hello"]["Properties"]["code"]["AssetHash"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(stage_dir.join(format!("asset.{}", hash)).join("hello.py").exists());
        assert!(stage_dir.join(stack.assets_file.as_ref().unwrap()).exists());
    }

    #[tokio::test]
    async fn test_write_replaces_previous_output() {
        let src = source_dir();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(out.path().join(MANIFEST_FILE), "{}").unwrap();
        std::fs::write(out.path().join("stale.json"), "{}").unwrap();

        let assembly = Synthesizer::new(src.path()).synthesize(&app(false)).unwrap();
        AssemblyWriter::new(src.path())
            .write(&assembly, out.path())
            .await
            .unwrap();

        assert!(!out.path().join("stale.json").exists());
        assert!(out.path().join(MANIFEST_FILE).exists());
    }

    #[tokio::test]
    async fn test_write_refuses_app_directory() {
        let src = source_dir();
        std::fs::write(src.path().join("app.kdl"), "app \"app\"\n").unwrap();
        let assembly = Synthesizer::new(src.path()).synthesize(&app(false)).unwrap();
        let writer = AssemblyWriter::new(src.path());

        // The app directory itself, and a directory containing it.
        for out_dir in [src.path(), src.path().parent().unwrap()] {
            let err = writer.write(&assembly, out_dir).await.unwrap_err();
            assert!(matches!(err, SynthError::InvalidAssembly(_)));
        }
        assert!(src.path().join("app.kdl").exists());
        assert!(src.path().join("code/hello.py").exists());
    }

    #[tokio::test]
    async fn test_write_refuses_unrelated_directory() {
        let src = source_dir();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(out.path().join("notes.txt"), "keep me").unwrap();

        let assembly = Synthesizer::new(src.path()).synthesize(&app(false)).unwrap();
        let err = AssemblyWriter::new(src.path())
            .write(&assembly, out.path())
            .await
            .unwrap_err();
        assert!(matches!(err, SynthError::InvalidAssembly(_)));
        assert!(out.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_bundling_runs_through_executor() {
        let src = source_dir();
        let out = tempfile::tempdir().unwrap();
        let executor = Arc::new(MockExecutor::new(true));

        let assembly = Synthesizer::new(src.path()).synthesize(&app(true)).unwrap();
        AssemblyWriter::new(src.path())
            .with_executor(executor.clone())
            .write(&assembly, out.path())
            .await
            .unwrap();

        let jobs = executor.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].image.as_deref(), Some("python:3.8"));
        assert_eq!(jobs[0].command[0], "bash");
        assert!(jobs[0].volumes.iter().any(|v| v.mount_path == ASSET_INPUT_DIR));
    }

    #[tokio::test]
    async fn test_bundling_without_output_fails() {
        let src = source_dir();
        let out = tempfile::tempdir().unwrap();

        let assembly = Synthesizer::new(src.path()).synthesize(&app(true)).unwrap();
        let err = AssemblyWriter::new(src.path())
            .with_executor(Arc::new(MockExecutor::new(false)))
            .write(&assembly, out.path())
            .await
            .unwrap_err();
        assert!(matches!(err, SynthError::Bundling { .. }));
    }

    #[tokio::test]
    async fn test_bundling_without_executor_fails() {
        let src = source_dir();
        let out = tempfile::tempdir().unwrap();

        let assembly = Synthesizer::new(src.path()).synthesize(&app(true)).unwrap();
        let err = AssemblyWriter::new(src.path())
            .write(&assembly, out.path())
            .await
            .unwrap_err();
        assert!(matches!(err, SynthError::Bundling { .. }));
    }

    #[test]
    fn test_read_manifest_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_manifest(dir.path()),
            Err(SynthError::InvalidAssembly(_))
        ));
    }
}
