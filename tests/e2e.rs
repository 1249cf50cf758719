use serde_json::Value;
use std::env;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

type AnyResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const DEFAULT_FEED: &str = r#"[{"name":"v1.3.0"},{"name":"v1.2.0"},{"name":"v1.1.0"}]"#;

const MOCK_GIT: &str = r#"#!/bin/sh
echo "git $*" >> "$TAGUP_MOCK_LOG"
case "$1" in
  --version)
    echo "git version 2.43.0"
    ;;
  describe)
    echo "${MOCK_GIT_DESCRIBE:-v1.2.0}"
    ;;
  rev-parse)
    if [ -n "$MOCK_NOT_A_REPO" ]; then
      echo "fatal: not a git repository (or any of the parent directories): .git" >&2
      exit 128
    fi
    echo true
    ;;
  status)
    if [ -n "$MOCK_GIT_DIRTY" ]; then
      echo " M app.py"
    fi
    ;;
  fetch)
    if [ -n "$MOCK_FETCH_SLEEP" ]; then
      sleep "$MOCK_FETCH_SLEEP"
    fi
    ;;
  diff)
    if [ -n "$MOCK_MANIFEST_CHANGED" ]; then
      echo requirements.txt
    fi
    ;;
  checkout)
    if [ -n "$MOCK_CHECKOUT_FAIL" ]; then
      echo "error: pathspec '$3' did not match any file(s) known to git" >&2
      exit 1
    fi
    ;;
esac
exit 0
"#;

const MOCK_SUDO: &str = r#"#!/bin/sh
echo "sudo $*" >> "$TAGUP_MOCK_LOG"
code="${MOCK_SUDO_EXIT:-0}"
if [ "$code" != "0" ]; then
  echo "sudo: a password is required" >&2
fi
exit "$code"
"#;

const MOCK_PIP: &str = r#"#!/bin/sh
echo "pip $*" >> "$TAGUP_MOCK_LOG"
exit 0
"#;

#[test]
fn e2e_full_suite() -> AnyResult<()> {
    scenario_check_reports_newer_tag()?;
    scenario_check_ahead_of_latest_tag()?;
    scenario_check_feed_failure()?;
    scenario_preflight_healthy()?;
    scenario_preflight_not_a_repository()?;
    scenario_preflight_warnings()?;
    scenario_apply_success()?;
    scenario_apply_installs_changed_dependencies()?;
    scenario_apply_checkout_failure()?;
    scenario_apply_rejects_invalid_tag()?;
    scenario_rollback()?;
    scenario_status()?;
    scenario_serve_json_lines()?;
    scenario_serve_finishes_accepted_update_after_eof()?;
    Ok(())
}

fn scenario_check_reports_newer_tag() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let result = env.run(env.command().arg("check"))?;
    assert!(result.status.success(), "check failed: {}", result.stderr);

    let body = result.json_body()?;
    assert_eq!(body["current_version"], "v1.2.0");
    assert_eq!(body["latest_tag"], "v1.3.0");
    assert_eq!(body["update_available"], true);
    assert_eq!(
        body["available_tags"],
        serde_json::json!(["v1.3.0", "v1.2.0", "v1.1.0"])
    );
    assert!(body["last_checked"].is_string());
    Ok(())
}

fn scenario_check_ahead_of_latest_tag() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let mut cmd = env.command();
    cmd.arg("check").env("MOCK_GIT_DESCRIBE", "v1.3.0-2-gabc1234");
    let result = env.run(&mut cmd)?;
    assert!(result.status.success(), "check failed: {}", result.stderr);
    assert_eq!(result.json_body()?["update_available"], false);
    Ok(())
}

fn scenario_check_feed_failure() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let mut cmd = env.command();
    cmd.arg("check")
        .env("TAGUP_FEED_MOCK", r#"{"error":"status-500"}"#);
    let result = env.run(&mut cmd)?;
    assert_eq!(result.status.code(), Some(1));
    assert!(result.stdout.trim().is_empty());
    assert!(result.stderr.contains("HTTP 500"), "stderr: {}", result.stderr);
    Ok(())
}

fn scenario_preflight_healthy() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let result = env.run(env.command().arg("preflight"))?;
    assert!(result.status.success(), "preflight failed: {}", result.stdout);

    let body = result.json_body()?;
    assert_eq!(body["ok"], true);
    assert_eq!(body["issues"], serde_json::json!([]));
    let log = env.read_mock_log()?;
    assert!(log.contains(&"sudo -n systemctl is-active --quiet deye-dashboard".to_string()));
    Ok(())
}

fn scenario_preflight_not_a_repository() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let mut cmd = env.command();
    cmd.arg("preflight").env("MOCK_NOT_A_REPO", "1");
    let result = env.run(&mut cmd)?;
    assert_eq!(result.status.code(), Some(1));

    let body = result.json_body()?;
    assert_eq!(body["ok"], false);
    assert_eq!(body["blocked"], true);
    assert_eq!(body["issues"], serde_json::json!(["Not a git repository"]));
    let log = env.read_mock_log()?;
    assert!(!log.iter().any(|line| line.starts_with("sudo")));
    Ok(())
}

fn scenario_preflight_warnings() -> AnyResult<()> {
    let env = TestEnv::new()?;
    fs::remove_dir_all(env.workdir.join("venv"))?;
    let mut cmd = env.command();
    cmd.arg("preflight")
        .env("MOCK_SUDO_EXIT", "1")
        .env("MOCK_GIT_DIRTY", "1");
    let result = env.run(&mut cmd)?;
    assert_eq!(result.status.code(), Some(1));

    let body = result.json_body()?;
    assert_eq!(body["blocked"], false);
    assert_eq!(
        body["issues"],
        serde_json::json!([
            "Virtual environment (venv) not found",
            "sudo systemctl not configured (passwordless)",
            "Uncommitted changes in working tree will be discarded"
        ])
    );
    Ok(())
}

fn scenario_apply_success() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let result = env.run(env.command().args(["apply", "v1.3.0"]))?;
    assert!(result.status.success(), "apply failed: {}", result.stderr);

    let body = result.json_body()?;
    assert_eq!(body["state"], "idle");
    assert_eq!(body["message"], "Updated to v1.3.0");
    assert!(body["error"].is_null());

    let log = env.read_mock_log()?;
    assert_eq!(
        log,
        vec![
            "git fetch --tags --force",
            "git diff --name-only HEAD v1.3.0 -- requirements.txt",
            "git checkout -f v1.3.0",
            "sudo systemctl restart deye-dashboard",
        ]
    );
    assert!(result.stderr.contains("[apply] Fetching tags..."));
    Ok(())
}

fn scenario_apply_installs_changed_dependencies() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let mut cmd = env.command();
    cmd.args(["apply", "v1.3.0"])
        .env("MOCK_MANIFEST_CHANGED", "1")
        .env("TAGUP_MANIFEST", "./requirements.txt")
        .env("TAGUP_SERVICE_UNIT", "solar-dashboard.service");
    let result = env.run(&mut cmd)?;
    assert!(result.status.success(), "apply failed: {}", result.stderr);

    let log = env.read_mock_log()?;
    assert_eq!(
        &log[2..],
        [
            "git checkout -f v1.3.0",
            "pip install -r requirements.txt",
            "sudo systemctl restart solar-dashboard.service",
        ]
    );
    Ok(())
}

fn scenario_apply_checkout_failure() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let mut cmd = env.command();
    cmd.args(["apply", "v9.9.9"]).env("MOCK_CHECKOUT_FAIL", "1");
    let result = env.run(&mut cmd)?;
    assert_eq!(result.status.code(), Some(1));

    let body = result.json_body()?;
    assert_eq!(body["state"], "error");
    let message = body["message"].as_str().unwrap_or_default();
    assert!(message.contains("pathspec 'v9.9.9' did not match"), "message: {message}");
    assert!(body["error"].as_str().unwrap_or_default().contains("git checkout -f v9.9.9"));

    let log = env.read_mock_log()?;
    assert!(!log.iter().any(|line| line.starts_with("sudo")));
    Ok(())
}

fn scenario_apply_rejects_invalid_tag() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let result = env.run(env.command().args(["apply", "v1.0..HEAD"]))?;
    assert_eq!(result.status.code(), Some(2));
    assert!(result.stderr.contains("invalid tag"), "stderr: {}", result.stderr);
    assert!(env.read_mock_log()?.is_empty());
    Ok(())
}

fn scenario_rollback() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let result = env.run(env.command().args(["rollback", "v1.1.0"]))?;
    assert!(result.status.success(), "rollback failed: {}", result.stderr);
    assert_eq!(result.json_body()?["message"], "Updated to v1.1.0");
    assert!(env.read_mock_log()?.contains(&"git checkout -f v1.1.0".to_string()));
    Ok(())
}

fn scenario_status() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let mut cmd = env.command();
    cmd.arg("status").env("MOCK_GIT_DESCRIBE", "v1.2.0-4-g0123abcd");
    let result = env.run(&mut cmd)?;
    assert!(result.status.success(), "status failed: {}", result.stderr);

    let body = result.json_body()?;
    assert_eq!(body["current_version"], "v1.2.0-4-g0123abcd");
    assert_eq!(body["described"]["base_tag"], "v1.2.0");
    assert_eq!(body["described"]["commits_ahead"], 4);
    assert_eq!(body["latest_tag"], "v1.3.0");
    assert_eq!(body["update_available"], true);
    assert_eq!(body["operation"]["state"], "idle");
    assert_eq!(body["update_in_progress"], false);
    assert_eq!(body["is_git_repo"], true);
    Ok(())
}

fn scenario_serve_json_lines() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let mut cmd = env.command();
    cmd.arg("serve")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    {
        let mut stdin = child.stdin.take().ok_or("stdin not captured")?;
        stdin.write_all(b"{\"action\":\"status\"}\n")?;
        stdin.write_all(b"{\"action\":\"preflight\"}\n")?;
        stdin.write_all(b"{\"action\":\"rollback\",\"tag\":\"\"}\n")?;
        stdin.write_all(b"{\"action\":\"reboot\"}\n")?;
    }
    let output = child.wait_with_output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let responses: Vec<Value> = stdout
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(responses.len(), 4, "stdout: {stdout}");

    assert_eq!(responses[0]["status"], 200);
    assert_eq!(responses[0]["body"]["current_version"], "v1.2.0");
    assert_eq!(responses[1]["status"], 200);
    assert_eq!(responses[1]["body"]["ok"], true);
    assert_eq!(responses[2]["status"], 400);
    assert_eq!(responses[2]["body"]["code"], "tag-missing");
    assert_eq!(responses[3]["status"], 400);
    assert_eq!(responses[3]["body"]["code"], "invalid-request");
    Ok(())
}

fn scenario_serve_finishes_accepted_update_after_eof() -> AnyResult<()> {
    let env = TestEnv::new()?;
    let mut cmd = env.command();
    cmd.arg("serve")
        .env("MOCK_FETCH_SLEEP", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    {
        let mut stdin = child.stdin.take().ok_or("stdin not captured")?;
        stdin.write_all(b"{\"action\":\"apply\",\"tag\":\"v1.3.0\"}\n")?;
    }
    let output = child.wait_with_output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let response: Value = serde_json::from_str(stdout.trim())?;
    assert_eq!(response["status"], 202);
    assert_eq!(response["body"]["tag"], "v1.3.0");

    let log = env.read_mock_log()?;
    assert_eq!(
        log,
        vec![
            "git fetch --tags --force",
            "git diff --name-only HEAD v1.3.0 -- requirements.txt",
            "git checkout -f v1.3.0",
            "sudo systemctl restart deye-dashboard",
        ]
    );
    Ok(())
}

struct TestEnv {
    #[allow(dead_code)]
    temp: TempDir,
    workdir: PathBuf,
    bin_path: PathBuf,
    mock_log: PathBuf,
    path_override: String,
}

impl TestEnv {
    fn new() -> AnyResult<Self> {
        let temp = TempDir::new()?;
        let root = temp.path().to_path_buf();
        let workdir = root.join("app");
        let mock_dir = root.join("mock-bin");
        fs::create_dir_all(workdir.join("venv/bin"))?;
        fs::create_dir_all(&mock_dir)?;

        write_script(&mock_dir.join("git"), MOCK_GIT)?;
        write_script(&mock_dir.join("sudo"), MOCK_SUDO)?;
        write_script(&workdir.join("venv/bin/pip"), MOCK_PIP)?;

        let mock_log = root.join("mock.log");
        fs::write(&mock_log, b"")?;
        let upstream_path = env::var("PATH").unwrap_or_default();
        let path_override = format!("{}:{}", mock_dir.display(), upstream_path);
        let bin_path = PathBuf::from(env!("CARGO_BIN_EXE_tag-upgrade-trigger"));

        Ok(Self {
            temp,
            workdir,
            bin_path,
            mock_log,
            path_override,
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin_path);
        cmd.env("TAGUP_ENV", "test");
        cmd.env("TAGUP_WORKDIR", &self.workdir);
        cmd.env("TAGUP_REPO", "owner/dashboard");
        cmd.env("TAGUP_FEED_MOCK", DEFAULT_FEED);
        cmd.env("TAGUP_LOG", "warn");
        cmd.env("TAGUP_MOCK_LOG", &self.mock_log);
        cmd.env("PATH", &self.path_override);
        for key in [
            "TAGUP_SERVICE_UNIT",
            "TAGUP_MANIFEST",
            "TAGUP_VENV_DIR",
            "TAGUP_TAG_ORDER",
            "TAGUP_API_BASE",
        ] {
            cmd.env_remove(key);
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    fn run(&self, cmd: &mut Command) -> AnyResult<CommandResult> {
        let output = cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).output()?;
        Ok(CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Commands the pipeline ran, without the read-only probes around it.
    fn read_mock_log(&self) -> AnyResult<Vec<String>> {
        let content = fs::read_to_string(&self.mock_log)?;
        Ok(content
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .filter(|line| !line.starts_with("git describe") && !line.starts_with("git rev-parse"))
            .collect())
    }
}

struct CommandResult {
    status: std::process::ExitStatus,
    stdout: String,
    stderr: String,
}

impl CommandResult {
    fn json_body(&self) -> AnyResult<Value> {
        Ok(serde_json::from_str(&self.stdout)?)
    }
}

fn write_script(path: &Path, body: &str) -> AnyResult<()> {
    fs::write(path, body)?;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}
