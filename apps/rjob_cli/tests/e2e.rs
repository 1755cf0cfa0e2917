use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn mock_command(root: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("rjob")?;
    cmd.current_dir(root)
        .env("RJOB_USE_MOCK_REMOTE", "1")
        .env("RJOB_MOCK_ROOT", root.join("remote-home"))
        .env("RJOB_POLL_INTERVAL_MS", "20");
    Ok(cmd)
}

#[test]
fn run_succeeds_and_collects_artifacts() -> Result<()> {
    let temp = tempdir()?;
    let work = temp.path().join("project");
    fs::create_dir_all(&work)?;
    fs::write(
        work.join("train.py"),
        "# rjob-mock: stdout=epoch 1 done\n# rjob-mock: write=results/model.txt\n",
    )?;

    mock_command(temp.path())?
        .arg("run")
        .arg("--script")
        .arg(work.join("train.py"))
        .arg("--work-dir")
        .arg(&work)
        .arg("--poll-ms")
        .arg("20")
        .assert()
        .success()
        .stdout(predicate::str::contains("accepted"))
        .stdout(predicate::str::contains("\"status\": \"succeeded\""));

    let runs: Vec<_> = fs::read_dir(work.join("rjob_runs"))?.collect::<Result<_, _>>()?;
    assert_eq!(runs.len(), 1);
    assert!(runs[0].path().join("results/model.txt").exists());
    Ok(())
}

#[test]
fn run_exits_non_zero_when_script_fails() -> Result<()> {
    let temp = tempdir()?;
    let work = temp.path().join("project");
    fs::create_dir_all(&work)?;
    fs::write(work.join("train.py"), "# rjob-mock: exit=3\n")?;

    mock_command(temp.path())?
        .args(["run", "--poll-ms", "20", "--script"])
        .arg(work.join("train.py"))
        .arg("--work-dir")
        .arg(&work)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("\"status\": \"failed\""))
        .stdout(predicate::str::contains("exited with code 3"));
    Ok(())
}

#[test]
fn run_rejects_missing_script() -> Result<()> {
    let temp = tempdir()?;
    mock_command(temp.path())?
        .args(["run", "--script", "absent.py", "--work-dir"])
        .arg(temp.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("does not exist"));
    Ok(())
}

#[test]
fn run_without_connection_settings_fails() -> Result<()> {
    let temp = tempdir()?;
    fs::write(temp.path().join("job.py"), "print('hi')\n")?;

    Command::cargo_bin("rjob")?
        .current_dir(temp.path())
        .env_remove("RJOB_USE_MOCK_REMOTE")
        .env_remove("RJOB_HOST")
        .env_remove("RJOB_USER")
        .env_remove("RJOB_IDENTITY_FILE")
        .env_remove("RJOB_PASSWORD")
        .args(["run", "--poll-ms", "20", "--script"])
        .arg(temp.path().join("job.py"))
        .arg("--work-dir")
        .arg(temp.path())
        .assert()
        .code(1)
        .stdout(predicate::str::contains("connection settings are incomplete"))
        .stdout(predicate::str::contains("RJOB_HOST"));
    Ok(())
}

#[test]
fn serve_answers_one_line_per_request() -> Result<()> {
    let temp = tempdir()?;
    let input = [
        r#"{"tool":"get_status","id":1}"#,
        "this is not json",
        r#"{"tool":"terminate_current_task","reason":"test","id":2}"#,
        r#"{"tool":"get_last_result","id":3}"#,
    ]
    .join("\n");

    let output = mock_command(temp.path())?
        .arg("serve")
        .write_stdin(input)
        .output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout)?;
    let responses: Vec<serde_json::Value> = stdout
        .lines()
        .map(serde_json::from_str::<serde_json::Value>)
        .collect::<Result<_, _>>()?;
    assert_eq!(responses.len(), 4);
    let by_id = |id: i64| responses.iter().find(|response| response["id"] == id);
    assert_eq!(by_id(1).map(|r| r["status"].clone()), Some("idle".into()));
    assert_eq!(by_id(2).map(|r| r["reason"].clone()), Some("not_running".into()));
    assert_eq!(by_id(3).map(|r| r["available"].clone()), Some(false.into()));
    assert!(responses
        .iter()
        .any(|response| response.get("id").is_none() && response["error"].is_string()));
    Ok(())
}

#[test]
fn serve_runs_submitted_job_before_exiting() -> Result<()> {
    let temp = tempdir()?;
    let work = temp.path().join("project");
    fs::create_dir_all(&work)?;
    fs::write(work.join("main.py"), "# rjob-mock: sleep_ms=200\n")?;
    let submit = serde_json::json!({
        "tool": "submit",
        "script_path": work.join("main.py"),
        "work_dir": &work,
    });
    let input = format!("{submit}\n{}\n", r#"{"tool":"submit","script_path":"x","work_dir":"y"}"#);

    mock_command(temp.path())?
        .arg("serve")
        .write_stdin(input)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""accepted":true"#))
        .stdout(predicate::str::contains(r#""reason":"busy""#));

    assert!(work.join("rjob_runs").is_dir());
    Ok(())
}
