//! Integration tests for Dalec

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const GO_SPEC: &str = r#"
name: go-app
version: 1.2.0
revision: 1
sources:
  src:
    context: {}
    generate:
      - gomod:
          auth:
            github.com:
              token: GITHUB_TOKEN
build:
  steps:
    - command: go build -o /work/out/app ./...
  caches:
    - dir:
        key: ccache
        dest: /root/.ccache
dependencies:
  build:
    golang:
      version: [">= 1.21", "< 1.23"]
"#;

    const BROKEN_SPEC: &str = r#"
name: broken
sources:
  file:
    inline:
      file:
        contents: "x"
    generate:
      - gomod:
          auth:
            github.com: {}
patches:
  file:
    - source: missing
"#;

    /// Command isolated from the user's configuration
    fn dalec(dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("dalec");
        cmd.env("DALEC_CONFIG", dir.path().join("config.toml"));
        cmd.env_remove("DALEC_LOG");
        cmd
    }

    fn write_spec(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("spec.yml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn arg(path: &Path) -> &str {
        path.to_str().unwrap()
    }

    #[test]
    fn help_displays() {
        let dir = TempDir::new().unwrap();
        dalec(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("package builds"))
            .stdout(predicate::str::contains("Usage: dalec"));
    }

    #[test]
    fn version_displays() {
        let dir = TempDir::new().unwrap();
        dalec(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("dalec"));
    }

    #[test]
    fn validate_accepts_good_spec() {
        let dir = TempDir::new().unwrap();
        let spec = write_spec(&dir, GO_SPEC);
        dalec(&dir)
            .args(["validate", arg(&spec)])
            .assert()
            .success()
            .stdout(predicate::str::contains("go-app is valid"));
    }

    #[test]
    fn validate_reports_every_error() {
        let dir = TempDir::new().unwrap();
        let spec = write_spec(&dir, BROKEN_SPEC);
        dalec(&dir)
            .args(["validate", arg(&spec)])
            .assert()
            .failure()
            .stderr(predicate::str::contains("gomod generator requires a directory source"))
            .stderr(predicate::str::contains("one of token, header or ssh must be set"))
            .stderr(predicate::str::contains("patch source missing does not exist"));
    }

    #[test]
    fn validate_reports_bad_gomod_edits_and_caches() {
        let dir = TempDir::new().unwrap();
        let spec = write_spec(
            &dir,
            r#"
name: edits
sources:
  src:
    context: {}
    generate:
      - gomod:
          replace: ["github.com/a/b"]
build:
  caches:
    - gobuild: {}
      pip: {}
"#,
        );
        dalec(&dir)
            .args(["validate", arg(&spec)])
            .assert()
            .failure()
            .stderr(predicate::str::contains("generator[0]: invalid gomod replace[0]"))
            .stderr(predicate::str::contains("only one of dir, gobuild, bazel or pip may be set"));
    }

    #[test]
    fn validate_expands_build_args() {
        let dir = TempDir::new().unwrap();
        let spec = write_spec(
            &dir,
            r#"
name: args
args:
  GO_HOST: github.com
sources:
  src:
    context: {}
    generate:
      - gomod:
          auth:
            ${GO_HOST}:
              token: GITHUB_TOKEN
            ${UNDECLARED}:
              token: OTHER
"#,
        );
        dalec(&dir)
            .args(["validate", arg(&spec), "--build-arg", "GO_HOST=git.corp"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("build arg \"UNDECLARED\" not declared"));
    }

    #[test]
    fn validate_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        dalec(&dir)
            .args(["validate", "does-not-exist.yml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn targets_lists_distros() {
        let dir = TempDir::new().unwrap();
        dalec(&dir)
            .args(["targets", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("azlinux3"))
            .stdout(predicate::str::contains("jammy"));
    }

    #[test]
    fn resolve_uses_native_syntax() {
        let dir = TempDir::new().unwrap();
        let spec = write_spec(&dir, GO_SPEC);
        dalec(&dir)
            .args(["resolve", arg(&spec), "--target", "jammy"])
            .assert()
            .success()
            .stdout(predicate::str::contains("build: golang (>= 1.21), golang (<< 1.23)"));
        dalec(&dir)
            .args(["resolve", arg(&spec), "--target", "azlinux3"])
            .assert()
            .success()
            .stdout(predicate::str::contains("build: golang < 1.23"));
    }

    #[test]
    fn resolve_selects_candidate() {
        let dir = TempDir::new().unwrap();
        let spec = write_spec(&dir, GO_SPEC);
        dalec(&dir)
            .args([
                "resolve",
                arg(&spec),
                "-t",
                "jammy",
                "--format",
                "json",
                "--available",
                "golang=1.20.3,1.22.5,1.23.1",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"selected\": \"1.22.5\""));
    }

    #[test]
    fn unknown_target_has_hint() {
        let dir = TempDir::new().unwrap();
        let spec = write_spec(&dir, GO_SPEC);
        dalec(&dir)
            .args(["resolve", arg(&spec), "--target", "plan9"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown target: plan9"))
            .stderr(predicate::str::contains("dalec targets"));
    }

    #[test]
    fn cache_plan_namespaces_keys() {
        let dir = TempDir::new().unwrap();
        let spec = write_spec(&dir, GO_SPEC);
        dalec(&dir)
            .args([
                "cache",
                "plan",
                arg(&spec),
                "--target",
                "jammy",
                "--platform",
                "linux/arm64",
                "--format",
                "plain",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("jammy-linux/arm64-ccache"))
            .stdout(predicate::str::contains("jammy-linux/arm64-dalec-gobuildcache"));
    }

    #[test]
    fn config_init_show_and_path() {
        let dir = TempDir::new().unwrap();
        dalec(&dir)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
        dalec(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));
        assert!(dir.path().join("config.toml").exists());
        dalec(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
        dalec(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[engine]"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[engine\n").unwrap();
        dalec(&dir)
            .args(["targets"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn completions_generate() {
        let dir = TempDir::new().unwrap();
        dalec(&dir)
            .args(["completions", "bash"])
            .assert()
            .success()
            .stdout(predicate::str::contains("dalec"));
    }

    #[test]
    fn bad_secret_flag_is_rejected() {
        let dir = TempDir::new().unwrap();
        let spec = write_spec(&dir, GO_SPEC);
        dalec(&dir)
            .args(["build", arg(&spec), "-t", "jammy", "-o", "out", "--secret", "env=X"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("secret requires id=<name>"));
    }

    #[test]
    #[ignore = "requires rootless podman and network access"]
    fn build_exports_output() {
        let dir = TempDir::new().unwrap();
        let spec = write_spec(
            &dir,
            "name: hello\nbuild:\n  steps:\n    - command: echo hello > /work/out/hello.txt\n",
        );
        let out = dir.path().join("out");
        dalec(&dir)
            .args(["build", arg(&spec), "-t", "jammy", "-o", arg(&out)])
            .assert()
            .success();
        assert_eq!(std::fs::read_to_string(out.join("hello.txt")).unwrap(), "hello\n");
    }
}
