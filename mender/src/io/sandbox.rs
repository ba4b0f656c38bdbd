//! Execution sandbox for generated programs.
//!
//! [`ProcessSandbox`] decides once, at construction, whether an isolated
//! container backend is reachable. If it is not, every run for the lifetime of
//! the sandbox goes through the local runner, which provides NO isolation and
//! says so in the logs on every call.
//!
//! `run` never fails: timeouts, non-zero exits and backend breakage are all
//! folded into [`SandboxResult::error`].

use std::fs;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::SandboxResult;
use crate::io::config::SandboxConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Error text reported when a program exceeds its time limit.
pub const TIMEOUT_ERROR: &str = "Execution timed out.";

/// `docker create` may pull the image on first use.
const CONTAINER_CREATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Output cap for container housekeeping calls (ids, exit codes).
const CONTROL_OUTPUT_LIMIT: usize = 64 * 1024;

/// Environment passed through to locally executed programs.
const LOCAL_ENV_ALLOWLIST: [&str; 4] = ["PATH", "LANG", "LC_ALL", "SYSTEMROOT"];

/// Runs an approved program and reports what it printed.
pub trait Sandbox {
    fn run(&self, program: &str) -> SandboxResult;

    fn mode(&self) -> SandboxMode;
}

impl<S: Sandbox + ?Sized> Sandbox for &S {
    fn run(&self, program: &str) -> SandboxResult {
        (**self).run(program)
    }

    fn mode(&self) -> SandboxMode {
        (**self).mode()
    }
}

/// Which backend a sandbox uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Disposable, network-disabled, resource-capped container.
    Isolated,
    /// Direct child process on the host. Degraded: no isolation.
    Local,
}

/// Sandbox backed by a container CLI, with a local-process fallback.
pub struct ProcessSandbox {
    backend: Backend,
}

enum Backend {
    Docker(DockerRunner),
    Local(LocalRunner),
}

impl ProcessSandbox {
    /// Probe the container backend and pick the execution path for this sandbox's lifetime.
    pub fn connect(config: &SandboxConfig) -> Self {
        if config.force_local {
            warn!("sandbox.force_local is set; generated code will run WITHOUT isolation");
            return Self::local(config);
        }
        let docker = DockerRunner::new(config.clone());
        match docker.ping() {
            Ok(version) => {
                info!(%version, image = %config.image, "isolated execution backend available");
                Self {
                    backend: Backend::Docker(docker),
                }
            }
            Err(err) => {
                warn!(
                    err = %format!("{err:#}"),
                    "container backend unavailable; switching to LOCAL execution fallback (NOT isolated)"
                );
                Self::local(config)
            }
        }
    }

    /// Sandbox that always runs programs as local child processes.
    pub fn local(config: &SandboxConfig) -> Self {
        Self {
            backend: Backend::Local(LocalRunner::new(config.clone())),
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.mode() == SandboxMode::Isolated
    }
}

impl Sandbox for ProcessSandbox {
    fn run(&self, program: &str) -> SandboxResult {
        match &self.backend {
            Backend::Docker(docker) => docker.run(program),
            Backend::Local(local) => local.run(program),
        }
    }

    fn mode(&self) -> SandboxMode {
        match self.backend {
            Backend::Docker(_) => SandboxMode::Isolated,
            Backend::Local(_) => SandboxMode::Local,
        }
    }
}

/// Runs each program in a fresh container created from a fixed image.
pub struct DockerRunner {
    config: SandboxConfig,
}

impl DockerRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Lightweight health check; returns the server version.
    pub fn ping(&self) -> Result<String> {
        let output = self.control(
            &["version", "--format", "{{.Server.Version}}"],
            self.probe_timeout(),
        )?;
        if !output.success() {
            bail!("docker version failed: {}", describe_failure(&output));
        }
        Ok(output.stdout_text())
    }

    #[instrument(skip_all, fields(image = %self.config.image))]
    pub fn run(&self, program: &str) -> SandboxResult {
        match self.try_run(program) {
            Ok(result) => result,
            Err(err) => SandboxResult::failure("", format!("Docker execution failed: {err:#}")),
        }
    }

    fn try_run(&self, program: &str) -> Result<SandboxResult> {
        let container = self.create(program)?;
        debug!(container = %container.id, "container created");

        let started = self.control(&["start", &container.id], self.probe_timeout())?;
        if !started.success() {
            bail!("docker start failed: {}", describe_failure(&started));
        }

        let waited = self.control(&["wait", &container.id], self.timeout())?;
        if waited.timed_out {
            warn!(container = %container.id, timeout_secs = self.config.timeout_secs, "program timed out");
            return Ok(SandboxResult::failure("", TIMEOUT_ERROR));
        }
        if !waited.success() {
            bail!("docker wait failed: {}", describe_failure(&waited));
        }
        let exit_code: i64 = waited
            .stdout_text()
            .trim()
            .parse()
            .context("parse container exit code")?;

        let logs = self.control(&["logs", &container.id], self.probe_timeout())?;
        if !logs.success() {
            bail!("docker logs failed: {}", describe_failure(&logs));
        }
        let combined = join_streams(&logs.stdout_text(), &logs.stderr_text());

        debug!(container = %container.id, exit_code, "container finished");
        if exit_code == 0 {
            Ok(SandboxResult::success(combined))
        } else {
            Ok(SandboxResult::failure(
                "",
                non_empty_or_exit_notice(combined, exit_code),
            ))
        }
    }

    fn create(&self, program: &str) -> Result<ContainerGuard<'_>> {
        let memory = format!("{}m", self.config.memory_limit_mb);
        let pids = self.config.pids_limit.to_string();
        let args = [
            "create",
            "--network",
            "none",
            "--memory",
            &memory,
            "--memory-swap",
            &memory,
            "--pids-limit",
            &pids,
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges",
            "--label",
            "mender.sandbox=1",
            &self.config.image,
            &self.config.interpreter,
            "-c",
            program,
        ];
        let output = self.control(&args, CONTAINER_CREATE_TIMEOUT)?;
        if !output.success() {
            bail!("docker create failed: {}", describe_failure(&output));
        }
        let id = output.stdout_text();
        if id.is_empty() {
            return Err(anyhow!("docker create returned no container id"));
        }
        Ok(ContainerGuard { runner: self, id })
    }

    fn remove(&self, id: &str) -> Result<()> {
        let output = self.control(&["rm", "-f", id], self.probe_timeout())?;
        if !output.success() {
            bail!("docker rm failed: {}", describe_failure(&output));
        }
        Ok(())
    }

    fn control(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let (program, prefix) = self
            .config
            .docker_command
            .split_first()
            .ok_or_else(|| anyhow!("sandbox.docker_command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(prefix).args(args);
        run_command_with_timeout(cmd, None, timeout, CONTROL_OUTPUT_LIMIT.max(self.config.output_limit_bytes))
            .with_context(|| format!("run {program} {}", args.first().copied().unwrap_or_default()))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.config.probe_timeout_secs)
    }
}

/// Removes its container when dropped, on every exit path.
struct ContainerGuard<'a> {
    runner: &'a DockerRunner,
    id: String,
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        match self.runner.remove(&self.id) {
            Ok(()) => debug!(container = %self.id, "container removed"),
            Err(err) => warn!(container = %self.id, err = %format!("{err:#}"), "failed to remove container"),
        }
    }
}

/// Runs programs as direct child processes. Provides no isolation.
pub struct LocalRunner {
    config: SandboxConfig,
}

impl LocalRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    #[instrument(skip_all, fields(interpreter = %self.config.interpreter))]
    pub fn run(&self, program: &str) -> SandboxResult {
        warn!("running generated program locally (container backend unavailable); execution is NOT isolated");
        match self.try_run(program) {
            Ok(result) => result,
            Err(err) => SandboxResult::failure("", format!("Local execution failed: {err:#}")),
        }
    }

    fn try_run(&self, program: &str) -> Result<SandboxResult> {
        // The directory and program file are removed when `workdir` drops.
        let workdir = tempfile::Builder::new()
            .prefix("mender-run-")
            .tempdir()
            .context("create program directory")?;
        let program_path = workdir.path().join("program.py");
        fs::write(&program_path, program)
            .with_context(|| format!("write {}", program_path.display()))?;

        let mut cmd = Command::new(&self.config.interpreter);
        cmd.arg(&program_path).current_dir(workdir.path()).env_clear();
        for key in LOCAL_ENV_ALLOWLIST {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        cmd.env("PYTHONDONTWRITEBYTECODE", "1");

        let output = run_command_with_timeout(
            cmd,
            None,
            Duration::from_secs(self.config.timeout_secs),
            self.config.output_limit_bytes,
        )?;

        if output.timed_out {
            return Ok(SandboxResult::failure("", TIMEOUT_ERROR));
        }
        let stdout = output.stdout_text();
        if output.status.success() {
            return Ok(SandboxResult::success(stdout));
        }
        let code = output.status.code().map(i64::from).unwrap_or(-1);
        Ok(SandboxResult::failure(
            stdout,
            non_empty_or_exit_notice(output.stderr_text(), code),
        ))
    }
}

/// Failure text must never be empty, or a crash would read as success.
fn non_empty_or_exit_notice(text: String, code: i64) -> String {
    if text.trim().is_empty() {
        format!("Process exited with status {code}")
    } else {
        text
    }
}

fn join_streams(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    }
}

fn describe_failure(output: &CommandOutput) -> String {
    if output.timed_out {
        return "timed out".to_string();
    }
    let stderr = output.stderr_text();
    if stderr.is_empty() {
        format!("exit status {:?}", output.status.code())
    } else {
        stderr
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Instant;

    fn python_available() -> bool {
        Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn local_config(timeout_secs: u64) -> SandboxConfig {
        SandboxConfig {
            timeout_secs,
            force_local: true,
            ..SandboxConfig::default()
        }
    }

    /// Config whose container CLI is a shell script recording its arguments.
    fn fake_docker(dir: &Path, wait_body: &str) -> SandboxConfig {
        let log = dir.join("docker.log");
        let script = dir.join("fake-docker.sh");
        let body = format!(
            "echo \"$@\" >> '{log}'\n\
             case \"$1\" in\n\
               version) echo 27.0.1 ;;\n\
               create) echo cid-123 ;;\n\
               start) ;;\n\
               wait) {wait_body} ;;\n\
               logs) echo partial; echo 'Traceback: boom' >&2 ;;\n\
               rm) ;;\n\
             esac\n",
            log = log.display()
        );
        fs::write(&script, body).expect("write script");
        SandboxConfig {
            timeout_secs: 1,
            docker_command: vec!["sh".to_string(), script.display().to_string()],
            ..SandboxConfig::default()
        }
    }

    #[test]
    fn missing_backend_falls_back_to_local() {
        let config = SandboxConfig {
            docker_command: vec!["definitely-not-docker-xyz".to_string()],
            ..SandboxConfig::default()
        };
        let sandbox = ProcessSandbox::connect(&config);
        assert_eq!(sandbox.mode(), SandboxMode::Local);
        assert!(!sandbox.is_isolated());
    }

    #[test]
    fn reachable_backend_is_isolated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = ProcessSandbox::connect(&fake_docker(temp.path(), "echo 0"));
        assert_eq!(sandbox.mode(), SandboxMode::Isolated);
    }

    #[test]
    fn container_failure_reports_logs_and_removes_container() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = DockerRunner::new(fake_docker(temp.path(), "echo 1"));

        let result = runner.run("raise SystemExit(1)");
        assert_eq!(result.output, "");
        assert_eq!(result.error, "partial\nTraceback: boom");

        let log = fs::read_to_string(temp.path().join("docker.log")).expect("log");
        assert!(log.contains("--network none"));
        assert!(log.contains("--pids-limit 20"));
        assert!(log.contains("--memory 128m"));
        assert!(log.lines().last().expect("last").starts_with("rm -f cid-123"));
    }

    #[test]
    fn container_success_has_empty_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = DockerRunner::new(fake_docker(temp.path(), "echo 0"));
        let result = runner.run("print('partial')");
        assert!(result.is_success());
        assert!(result.output.starts_with("partial"));
    }

    #[test]
    fn container_timeout_still_removes_container() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = DockerRunner::new(fake_docker(temp.path(), "exec sleep 30"));

        let start = Instant::now();
        let result = runner.run("while True: pass");
        assert_eq!(result.error, TIMEOUT_ERROR);
        assert!(start.elapsed() < Duration::from_secs(15));

        let log = fs::read_to_string(temp.path().join("docker.log")).expect("log");
        assert!(log.contains("rm -f cid-123"));
    }

    #[test]
    fn local_success_has_empty_error() {
        if !python_available() {
            return;
        }
        let result = LocalRunner::new(local_config(10)).run("print('hello')");
        assert_eq!(result, SandboxResult::success("hello"));
    }

    #[test]
    fn local_runtime_error_is_reported() {
        if !python_available() {
            return;
        }
        let result =
            LocalRunner::new(local_config(10)).run("print('before')\nraise ValueError('bad')");
        assert_eq!(result.output, "before");
        assert!(result.error.contains("ValueError: bad"));
    }

    #[test]
    fn local_silent_nonzero_exit_is_still_an_error() {
        if !python_available() {
            return;
        }
        let result = LocalRunner::new(local_config(10)).run("raise SystemExit(3)");
        assert_eq!(result.error, "Process exited with status 3");
    }

    #[test]
    fn local_timeout_returns_within_bound() {
        if !python_available() {
            return;
        }
        let start = Instant::now();
        let result = LocalRunner::new(local_config(1)).run("import time\ntime.sleep(60)");
        assert_eq!(result.error, TIMEOUT_ERROR);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn local_timeout_also_stops_forked_workers() {
        if !python_available() {
            return;
        }
        let program = "import multiprocessing, time\n\
                       def work():\n    time.sleep(30)\n\
                       if __name__ == '__main__':\n\
                       \x20   p = multiprocessing.Process(target=work)\n\
                       \x20   p.start()\n\
                       \x20   time.sleep(30)\n";
        let start = Instant::now();
        let result = LocalRunner::new(local_config(1)).run(program);
        assert_eq!(result.error, TIMEOUT_ERROR);
        assert!(start.elapsed() < Duration::from_secs(5), "{:?}", start.elapsed());
    }

    #[test]
    fn local_program_file_is_deleted() {
        if !python_available() {
            return;
        }
        let result = LocalRunner::new(local_config(10)).run("print(__file__)");
        assert!(result.is_success());
        assert!(!Path::new(&result.output).exists());
    }

    #[test]
    fn missing_interpreter_is_folded_into_result() {
        let config = SandboxConfig {
            interpreter: "definitely-not-python-xyz".to_string(),
            ..local_config(1)
        };
        let result = LocalRunner::new(config).run("print(1)");
        assert!(result.error.starts_with("Local execution failed"));
    }
}
