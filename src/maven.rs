//! Maven-backed [`BuildProject`] implementation.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::project::{BuildProject, ProjectError, TestRun};

/// Directory names never copied into a replica.
const SKIP_NAMES: &[&str] = &[".git", "target"];

/// Environment and timing knobs for Maven invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MavenConfig {
    /// `JAVA_HOME` exported to every invocation, when set.
    pub jdk_home: Option<PathBuf>,
    /// `M2_HOME` exported to every invocation, when set.
    pub maven_home: Option<PathBuf>,
    /// Per-invocation test timeout.
    pub tests_timeout: Duration,
}

impl Default for MavenConfig {
    fn default() -> Self {
        Self {
            jdk_home: None,
            maven_home: None,
            tests_timeout: Duration::from_secs(3600),
        }
    }
}

impl MavenConfig {
    /// Set `JAVA_HOME`.
    pub fn with_jdk_home(mut self, jdk_home: impl Into<PathBuf>) -> Self {
        self.jdk_home = Some(jdk_home.into());
        self
    }

    /// Set `M2_HOME`.
    pub fn with_maven_home(mut self, maven_home: impl Into<PathBuf>) -> Self {
        self.maven_home = Some(maven_home.into());
        self
    }

    /// Set the test timeout.
    pub fn with_tests_timeout(mut self, timeout: Duration) -> Self {
        self.tests_timeout = timeout;
        self
    }
}

/// A Maven project rooted at a working directory, replicable into sibling
/// copies for parallel mutant execution.
#[derive(Debug, Clone)]
pub struct MavenProject {
    repo_path: PathBuf,
    replicas_root: PathBuf,
    config: MavenConfig,
}

impl MavenProject {
    /// Wrap an existing working tree. Replicas are materialized under
    /// `replicas_root/c_<n>/<repo name>`.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        replicas_root: impl Into<PathBuf>,
        config: MavenConfig,
    ) -> Self {
        Self {
            repo_path: repo_path.into(),
            replicas_root: replicas_root.into(),
            config,
        }
    }

    fn mvn_command(&self) -> Command {
        let mut cmd = Command::new("mvn");
        cmd.current_dir(&self.repo_path);
        if let Some(jdk) = &self.config.jdk_home {
            cmd.env("JAVA_HOME", jdk);
        }
        if let Some(m2) = &self.config.maven_home {
            cmd.env("M2_HOME", m2);
        }
        cmd
    }

    fn test_args(target_tests: Option<&str>, relevant_only: bool) -> Vec<String> {
        let mut args = vec!["-DprintSummary=false".to_string()];
        if relevant_only {
            args.push("-Dparallel=classes".to_string());
            if let Some(tests) = target_tests {
                args.push(format!("-Dtest={tests}"));
            }
        }
        args.push("test".to_string());
        args
    }

    fn repo_name(&self) -> String {
        self.repo_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    }
}

fn copy_tree_filtered(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if SKIP_NAMES.iter().any(|s| *s == name.to_string_lossy()) {
            continue;
        }
        let src_path = entry.path();
        let dst_path = dst.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree_filtered(&src_path, &dst_path)?;
        } else if file_type.is_file() {
            fs::copy(&src_path, &dst_path)?;
        }
        // Symlinks and special files are left behind.
    }
    Ok(())
}

fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut text);
        }
        text
    })
}

impl BuildProject for MavenProject {
    fn working_dir(&self) -> &Path {
        &self.repo_path
    }

    fn compile(&self) -> Result<bool, ProjectError> {
        debug!(repo = %self.repo_path.display(), "compiling");
        let output = self.mvn_command().arg("compile").output()?;
        Ok(output.status.success())
    }

    fn test(
        &self,
        target_tests: Option<&str>,
        relevant_only: bool,
    ) -> Result<TestRun, ProjectError> {
        let args = Self::test_args(target_tests, relevant_only);
        info!(repo = %self.repo_path.display(), ?args, "executing mvn test");

        let mut child = self
            .mvn_command()
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = drain_pipe(child.stdout.take());
        let stderr = drain_pipe(child.stderr.take());

        let started = Instant::now();
        loop {
            match child.try_wait()? {
                Some(_) => break,
                None => {
                    if started.elapsed() > self.config.tests_timeout {
                        debug!(repo = %self.repo_path.display(), "test run timed out");
                        let _ = child.kill();
                        let _ = child.wait();
                        return Ok(TestRun::TimedOut);
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        let raw_output = if !stdout.is_empty() { stdout } else { stderr };
        if raw_output.is_empty() {
            return Err(ProjectError::TestInfra(
                "test run produced no output".to_string(),
            ));
        }
        Ok(TestRun::Completed { raw_output })
    }

    fn replicate(&self, index: usize) -> Result<Box<dyn BuildProject>, ProjectError> {
        let dest = self
            .replicas_root
            .join(format!("c_{index}"))
            .join(self.repo_name());
        copy_tree_filtered(&self.repo_path, &dest)
            .map_err(|e| ProjectError::ReplicaCreation(format!("{}: {e}", dest.display())))?;
        info!(from = %self.repo_path.display(), to = %dest.display(), "replicated project");
        Ok(Box::new(Self {
            repo_path: dest,
            replicas_root: self.replicas_root.clone(),
            config: self.config.clone(),
        }))
    }

    fn remove(&self) -> Result<(), ProjectError> {
        if self.repo_path.is_dir() {
            fs::remove_dir_all(&self.repo_path)?;
        }
        Ok(())
    }
}
