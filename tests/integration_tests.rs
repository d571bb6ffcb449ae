//! Integration tests for the stagehand CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn stagehand() -> Command {
    cargo_bin_cmd!("stagehand")
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn init_project(dir: &TempDir) {
    stagehand()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

fn write_plan(dir: &TempDir, name: &str, content: &str) {
    fs::write(dir.path().join(name), content).unwrap();
}

const CHAIN_PLAN: &str = r#"{
  "name": "demo",
  "components": [
    { "id": "parser", "files_to_create": ["src/parser.rs"] },
    { "id": "lexer", "files_to_create": ["src/lexer.rs"] },
    { "id": "driver", "files_to_create": ["src/main.rs"], "dependencies": ["parser", "lexer"] }
  ]
}"#;

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        stagehand().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        stagehand().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = create_temp_project();

        stagehand()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized stagehand project"));

        assert!(dir.path().join(".stagehand/stagehand.toml").exists());
        assert!(dir.path().join(".stagehand/audit/runs").exists());
        assert!(dir.path().join(".stagehand/logs").exists());
    }

    #[test]
    fn test_init_idempotent() {
        let dir = create_temp_project();
        init_project(&dir);

        stagehand()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }
}

mod plan {
    use super::*;

    #[test]
    fn test_plan_prints_mode_and_waves() {
        let dir = create_temp_project();
        write_plan(&dir, "plan.json", CHAIN_PLAN);

        // parser and lexer are each other's only sibling
        stagehand()
            .current_dir(dir.path())
            .args(["plan", "plan.json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("mode: sequential"))
            .stdout(predicate::str::contains("Waves:"))
            .stdout(predicate::str::contains("driver"));
    }

    #[test]
    fn test_plan_wide_graph_is_mixed() {
        let dir = create_temp_project();
        write_plan(
            &dir,
            "plan.json",
            r#"{
              "components": [
                { "id": "core" },
                { "id": "api", "dependencies": ["core"] },
                { "id": "cli", "dependencies": ["core"] },
                { "id": "docs", "dependencies": ["core"] }
              ]
            }"#,
        );

        stagehand()
            .current_dir(dir.path())
            .args(["plan", "plan.json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("mode: mixed"));
    }

    #[test]
    fn test_plan_reports_file_conflicts() {
        let dir = create_temp_project();
        write_plan(
            &dir,
            "plan.json",
            r#"{
              "components": [
                { "id": "a", "files_to_modify": ["src/lib.rs"] },
                { "id": "b", "files_to_modify": ["src/lib.rs"] }
              ]
            }"#,
        );

        stagehand()
            .current_dir(dir.path())
            .args(["plan", "plan.json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("File conflicts"))
            .stdout(predicate::str::contains("a -> b"));
    }

    #[test]
    fn test_plan_rejects_cycle() {
        let dir = create_temp_project();
        write_plan(
            &dir,
            "plan.json",
            r#"{
              "components": [
                { "id": "a", "dependencies": ["b"] },
                { "id": "b", "dependencies": ["a"] }
              ]
            }"#,
        );

        stagehand()
            .current_dir(dir.path())
            .args(["plan", "plan.json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cyclic dependency"));
    }

    #[test]
    fn test_plan_rejects_unknown_dependency() {
        let dir = create_temp_project();
        write_plan(
            &dir,
            "plan.json",
            r#"{ "components": [ { "id": "a", "dependencies": ["ghost"] } ] }"#,
        );

        stagehand()
            .current_dir(dir.path())
            .args(["plan", "plan.json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown dependency 'ghost'"));
    }

    #[test]
    fn test_plan_accepts_yaml() {
        let dir = create_temp_project();
        write_plan(
            &dir,
            "plan.yaml",
            "components:\n  - id: only\n    files_to_create: [src/only.rs]\n",
        );

        stagehand()
            .current_dir(dir.path())
            .args(["plan", "plan.yaml"])
            .assert()
            .success()
            .stdout(predicate::str::contains("mode: sequential"));
    }

    #[test]
    fn test_plan_missing_file() {
        let dir = create_temp_project();

        stagehand()
            .current_dir(dir.path())
            .args(["plan", "nope.json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read plan file"));
    }
}

mod run {
    use super::*;

    #[test]
    fn test_dry_run_commits_every_component() {
        let dir = create_temp_project();
        init_project(&dir);
        write_plan(&dir, "plan.json", CHAIN_PLAN);

        stagehand()
            .current_dir(dir.path())
            .args(["run", "plan.json", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("3/3 committed"));

        let runs: Vec<_> = fs::read_dir(dir.path().join(".stagehand/audit/runs"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        assert!(runs.iter().any(|p| p.extension().unwrap() == "jsonl"));
        assert!(
            runs.iter()
                .any(|p| p.to_string_lossy().ends_with(".summary.json"))
        );
    }

    #[test]
    fn test_dry_run_sequential_flag() {
        let dir = create_temp_project();
        init_project(&dir);
        write_plan(&dir, "plan.json", CHAIN_PLAN);

        stagehand()
            .current_dir(dir.path())
            .args(["run", "plan.json", "--dry-run", "--sequential"])
            .assert()
            .success()
            .stdout(predicate::str::contains("mode sequential"));
    }

    #[test]
    fn test_run_without_workers_fails() {
        let dir = create_temp_project();
        init_project(&dir);
        write_plan(&dir, "plan.json", CHAIN_PLAN);

        stagehand()
            .current_dir(dir.path())
            .env_remove("STAGEHAND_IMPLEMENTER_CMD")
            .env_remove("STAGEHAND_REVIEWER_CMD")
            .env_remove("STAGEHAND_TEST_WRITER_CMD")
            .env_remove("STAGEHAND_TEST_RUNNER_CMD")
            .args(["run", "plan.json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No worker command configured"))
            .stderr(predicate::str::contains("STAGEHAND_IMPLEMENTER_CMD"));
    }
}

mod audit {
    use super::*;

    #[test]
    fn test_audit_list_empty() {
        let dir = create_temp_project();
        init_project(&dir);

        stagehand()
            .current_dir(dir.path())
            .args(["audit", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs recorded"));
    }

    #[test]
    fn test_audit_list_and_show_after_run() {
        let dir = create_temp_project();
        init_project(&dir);
        write_plan(&dir, "plan.json", CHAIN_PLAN);

        stagehand()
            .current_dir(dir.path())
            .args(["run", "plan.json", "--dry-run"])
            .assert()
            .success();

        stagehand()
            .current_dir(dir.path())
            .args(["audit", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("3/3 committed"));

        stagehand()
            .current_dir(dir.path())
            .args(["audit", "show", "latest"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Transitions"))
            .stdout(predicate::str::contains("implementing"))
            .stdout(predicate::str::contains("committed"));
    }

    #[test]
    fn test_audit_show_unknown_run() {
        let dir = create_temp_project();
        init_project(&dir);

        stagehand()
            .current_dir(dir.path())
            .args(["audit", "show", "deadbeef"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No run matching"));
    }
}

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();

        stagehand()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using default configuration"))
            .stdout(predicate::str::contains("max_rejections = 3"));
    }

    #[test]
    fn test_config_show_worker_env_override() {
        let dir = create_temp_project();
        init_project(&dir);

        stagehand()
            .current_dir(dir.path())
            .env("STAGEHAND_REVIEWER_CMD", "review-bot --strict")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("review-bot --strict"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = create_temp_project();
        init_project(&dir);
        fs::write(
            dir.path().join(".stagehand/stagehand.toml"),
            "[backpressure]\nreview = 0\n\n[workers.designer]\ncommand = \"x\"\n",
        )
        .unwrap();

        stagehand()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("backpressure.review is 0"))
            .stdout(predicate::str::contains("Unknown worker role 'designer'"));
    }

    #[test]
    fn test_config_validate_valid() {
        let dir = create_temp_project();
        init_project(&dir);

        stagehand()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = create_temp_project();

        stagehand()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));

        stagehand()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_invalid_toml_fails() {
        let dir = create_temp_project();
        init_project(&dir);
        fs::write(
            dir.path().join(".stagehand/stagehand.toml"),
            "[retry\nmax_rejections = ",
        )
        .unwrap();

        stagehand()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse stagehand.toml"));
    }
}

mod global_flags {
    use super::*;

    #[test]
    fn test_project_dir_flag() {
        let dir = create_temp_project();

        stagehand()
            .args(["--project-dir", dir.path().to_str().unwrap(), "init"])
            .assert()
            .success();

        assert!(dir.path().join(".stagehand").exists());
    }
}
