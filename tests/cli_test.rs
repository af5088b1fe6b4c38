//! CLI argument parsing and end-to-end command tests.
//!
//! Browser-driving commands run against the in-memory engine with JSON page
//! fixtures, so no Chromium is needed.

#![allow(deprecated)]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const FIXTURES: &str = r#"{
  "https://example.com": {
    "title": "Example Domain",
    "body": [
      {"tag": "h1", "text": "Example Domain"},
      {"tag": "p", "text": "This domain is for use in illustrative examples."},
      {"tag": "a", "attrs": {"href": "https://www.iana.org/domains/example"}, "text": "More information..."}
    ]
  },
  "https://www.iana.org/domains/example": {
    "title": "IANA-managed Reserved Domains",
    "body": [{"tag": "h1", "text": "Example Domains"}]
  }
}"#;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sites.json"), FIXTURES).unwrap();
        Self { dir }
    }

    fn config_path(&self) -> PathBuf {
        self.dir.path().join("config").join("config.toml")
    }

    fn fixtures(&self) -> PathBuf {
        self.dir.path().join("sites.json")
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// `pagewright` isolated from the user's config.
    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("pagewright").unwrap();
        cmd.env("PAGEWRIGHT_CONFIG", self.config_path())
            .env_remove("PAGEWRIGHT_CDP")
            .env_remove("PAGEWRIGHT_ENGINE")
            .env_remove("RUST_LOG");
        cmd
    }

    /// `pagewright --engine memory --fixtures <sites.json>`.
    fn memory(&self) -> Command {
        let mut cmd = self.cmd();
        cmd.arg("--engine")
            .arg("memory")
            .arg("--fixtures")
            .arg(self.fixtures());
        cmd
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

mod help {
    use super::*;

    #[test]
    fn shows_help() {
        Workspace::new()
            .cmd()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("pagewright"))
            .stdout(predicate::str::contains("snapshot"))
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("--engine"));
    }

    #[test]
    fn shows_version() {
        Workspace::new()
            .cmd()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("pagewright"));
    }

    #[test]
    fn snapshot_requires_url() {
        Workspace::new()
            .cmd()
            .arg("snapshot")
            .assert()
            .failure()
            .stderr(predicate::str::contains("<URL>"));
    }

    #[test]
    fn rejects_unknown_engine() {
        Workspace::new()
            .cmd()
            .args(["--engine", "gecko", "status"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("gecko"));
    }
}

mod config_command {
    use super::*;

    #[test]
    fn path_honours_config_env() {
        let ws = Workspace::new();
        ws.cmd()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn set_then_get_round_trips() {
        let ws = Workspace::new();
        ws.cmd()
            .args(["config", "set", "browser.cdp_port", "9333"])
            .assert()
            .success()
            .stdout(predicate::str::contains("browser.cdp_port = 9333"));

        assert!(ws.config_path().exists());

        ws.cmd()
            .args(["--json", "config", "get", "browser.cdp_port"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"value\":\"9333\""));
    }

    #[test]
    fn get_unset_value() {
        Workspace::new()
            .cmd()
            .args(["config", "get", "browser.executable"])
            .assert()
            .success()
            .stdout(predicate::str::contains("(not set)"));
    }

    #[test]
    fn unknown_key_fails() {
        Workspace::new()
            .cmd()
            .args(["config", "set", "api.base_url", "x"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown config key"));
    }

    #[test]
    fn invalid_quality_is_rejected() {
        Workspace::new()
            .cmd()
            .args(["config", "set", "stream.quality", "150"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("quality"));
    }

    #[test]
    fn show_prints_sections() {
        Workspace::new()
            .cmd()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[browser]"))
            .stdout(predicate::str::contains("[stream]"));
    }
}

mod snapshot_command {
    use super::*;

    #[test]
    fn prints_tree_with_refs() {
        Workspace::new()
            .memory()
            .args(["snapshot", "example.com"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Example Domain"))
            .stdout(predicate::str::contains("link \"More information...\" [ref=@e1]"));
    }

    #[test]
    fn json_output_has_generation_and_refs() {
        Workspace::new()
            .memory()
            .args(["--json", "snapshot", "example.com", "--interactive"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"ref_count\":1"))
            .stdout(predicate::str::contains("\"url\":\"https://example.com/\""))
            .stdout(predicate::str::contains("illustrative").not());
    }

    #[test]
    fn missing_selector_scope_fails() {
        Workspace::new()
            .memory()
            .args(["snapshot", "example.com", "--selector", "#absent"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("#absent"));
    }
}

mod run_command {
    use super::*;

    #[test]
    fn script_file_runs_line_by_line() {
        let ws = Workspace::new();
        let script = ws.write(
            "flow.jsonl",
            r#"# open, snapshot, follow the link
{"cmd":"open","url":"example.com"}
{"cmd":"snapshot","interactive":true}
{"cmd":"click","target":"@e1"}
{"cmd":"title"}
{"cmd":"back"}
{"cmd":"url"}
"#,
        );

        ws.memory()
            .arg("run")
            .arg(&script)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"line\":2"))
            .stdout(predicate::str::contains("IANA-managed Reserved Domains"))
            .stdout(predicate::str::contains("\"steps_completed\":1"))
            .stdout(predicate::str::contains("\"ok\":false").not());
    }

    #[test]
    fn failure_stops_the_script() {
        let ws = Workspace::new();
        let script = ws.write(
            "broken.jsonl",
            "{\"cmd\":\"open\",\"url\":\"example.com\"}\n\
             {\"cmd\":\"click\",\"target\":\"@e5\"}\n\
             {\"cmd\":\"title\"}\n",
        );

        ws.memory()
            .arg("run")
            .arg(&script)
            .assert()
            .failure()
            .stdout(predicate::str::contains("\"kind\":\"ref_not_found\""))
            .stdout(predicate::str::contains("\"line\":3").not());
    }

    #[test]
    fn keep_going_runs_remaining_commands() {
        let ws = Workspace::new();
        let script = ws.write(
            "broken.jsonl",
            "{\"cmd\":\"open\",\"url\":\"example.com\"}\n\
             {\"cmd\":\"teleport\"}\n\
             {\"cmd\":\"title\"}\n",
        );

        ws.memory()
            .arg("run")
            .arg(&script)
            .arg("--keep-going")
            .assert()
            .failure()
            .stdout(predicate::str::contains("invalid_action_parameters"))
            .stdout(predicate::str::contains("\"title\":\"Example Domain\""));
    }

    #[test]
    fn script_from_stdin() {
        Workspace::new()
            .memory()
            .arg("run")
            .write_stdin(
                "{\"cmd\":\"open\",\"url\":\"example.com\"}\n\
                 {\"cmd\":\"find\",\"strategy\":\"role\",\"value\":\"link\",\"action\":\"count\"}\n",
            )
            .assert()
            .success()
            .stdout(predicate::str::contains("\"count\":1"));
    }

    #[test]
    fn stream_lifecycle_in_script() {
        let ws = Workspace::new();
        let script = ws.write(
            "stream.jsonl",
            r#"{"cmd":"open","url":"example.com"}
{"cmd":"stream_start","format":"png"}
{"cmd":"stream_start"}
{"cmd":"stream_frames","count":1,"timeout_ms":200}
{"cmd":"stream_stop"}
{"cmd":"stream_state"}
"#,
        );

        ws.memory()
            .arg("run")
            .arg(&script)
            .arg("--keep-going")
            .arg("--frames-dir")
            .arg(ws.path().join("frames"))
            .assert()
            .failure()
            .stdout(predicate::str::contains("\"state\":\"active\""))
            .stdout(predicate::str::contains("already_streaming"))
            .stdout(predicate::str::contains("\"screencasting\":true"))
            .stdout(predicate::str::contains("\"state\":\"idle\""));
    }

    #[test]
    fn missing_script_file_fails() {
        let ws = Workspace::new();
        ws.memory()
            .arg("run")
            .arg(ws.path().join("absent.jsonl"))
            .assert()
            .failure();
    }
}

mod status_command {
    use super::*;

    #[test]
    fn json_status_reports_engine() {
        Workspace::new()
            .cmd()
            .args(["--engine", "memory", "--json", "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"engine\": \"memory\""))
            .stdout(predicate::str::contains("\"cdp_port\": 9222"));
    }
}
