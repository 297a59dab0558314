//! Compiler invocation: run the external build command once per cycle,
//! capture its combined output, report pass/fail.
use crate::config::BuildConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// Outcome of one compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub succeeded: bool,
    /// Combined stdout+stderr, followed by the exit status or launch error on failure.
    pub diagnostics: String,
}

/// A failed build, as reported to the user.
#[derive(Debug)]
pub enum BuildError {
    /// The compiler could not be started at all.
    Launch {
        command: String,
        source: std::io::Error,
    },
    /// The compiler ran and exited unsuccessfully.
    Failed { status: std::process::ExitStatus },
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::Launch { command, source } => {
                write!(f, "failed to launch compiler `{}`: {}", command, source)
            }
            BuildError::Failed { status } => write!(f, "compiler exited with {}", status),
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BuildError::Launch { source, .. } => Some(source),
            BuildError::Failed { .. } => None,
        }
    }
}

impl BuildResult {
    fn success(diagnostics: String) -> Self {
        Self {
            succeeded: true,
            diagnostics,
        }
    }

    fn failure(output: String, error: &BuildError) -> Self {
        let mut diagnostics = output;
        if !diagnostics.is_empty() && !diagnostics.ends_with('\n') {
            diagnostics.push('\n');
        }
        diagnostics.push_str(&error.to_string());
        Self {
            succeeded: false,
            diagnostics,
        }
    }
}

/// Something the orchestrator can ask for a fresh build.
pub trait Build {
    async fn build(&self) -> BuildResult;
}

/// Runs the configured compiler with a fixed output path.
#[derive(Debug, Clone)]
pub struct Builder {
    command: String,
    args: Vec<String>,
    binary: PathBuf,
}

impl Builder {
    /// Resolve the full argument list once; it never changes between cycles.
    ///
    /// Layout: `<command> <subcommand..> -o <output> [debug flags] [args..] <source>`.
    ///
    /// The output is made absolute against the working directory so the
    /// supervisor never looks a bare name up on `$PATH`.
    pub fn new(config: &BuildConfig, source: &Path, debug: bool) -> std::io::Result<Self> {
        let binary = std::path::absolute(binary_path(&config.output))?;

        let mut args = config.subcommand.clone();
        args.push("-o".to_string());
        args.push(binary.to_string_lossy().into_owned());
        if debug {
            args.extend(config.debug_flags.iter().cloned());
        }
        args.extend(config.args.iter().cloned());
        args.push(source.to_string_lossy().into_owned());

        Ok(Self {
            command: config.command.clone(),
            args,
            binary,
        })
    }

    /// Path of the binary the compiler writes.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    #[cfg(test)]
    fn args(&self) -> &[String] {
        &self.args
    }
}

impl Build for Builder {
    async fn build(&self) -> BuildResult {
        tracing::info!(command = %self.command, args = ?self.args, "building");
        let start = Instant::now();

        // Dropping the build future (on interrupt) must not leave the compiler behind.
        let output = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                let error = BuildError::Launch {
                    command: self.command.clone(),
                    source: e,
                };
                tracing::warn!(error = %error, "build could not start");
                return BuildResult::failure(String::new(), &error);
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let elapsed_ms = start.elapsed().as_millis() as u64;
        if output.status.success() {
            tracing::info!(elapsed_ms, "build finished");
            BuildResult::success(combined)
        } else {
            let error = BuildError::Failed {
                status: output.status,
            };
            tracing::warn!(elapsed_ms, status = %output.status, "build failed");
            BuildResult::failure(combined, &error)
        }
    }
}

/// Windows refuses to run binaries without the `.exe` extension.
fn binary_path(output: &Path) -> PathBuf {
    if cfg!(windows) && output.extension().map_or(true, |ext| ext != "exe") {
        let mut with_ext = output.as_os_str().to_owned();
        with_ext.push(".exe");
        PathBuf::from(with_ext)
    } else {
        output.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &str, subcommand: &[&str]) -> BuildConfig {
        BuildConfig {
            command: command.to_string(),
            subcommand: subcommand.iter().map(|s| s.to_string()).collect(),
            output: PathBuf::from("bin/app"),
            ..Default::default()
        }
    }

    #[test]
    fn test_args_layout_without_debug() {
        let mut cfg = BuildConfig::default();
        cfg.output = PathBuf::from("bin/app");
        cfg.args = vec!["-race".to_string()];
        let builder = Builder::new(&cfg, Path::new("./cmd/api"), false).unwrap();

        let expected_bin = std::path::absolute(binary_path(Path::new("bin/app"))).unwrap();
        assert!(expected_bin.is_absolute());
        assert_eq!(
            builder.args(),
            &[
                "build".to_string(),
                "-o".to_string(),
                expected_bin.to_string_lossy().into_owned(),
                "-race".to_string(),
                "./cmd/api".to_string(),
            ]
        );
        assert_eq!(builder.binary(), expected_bin.as_path());
    }

    #[test]
    fn test_debug_flags_precede_extra_args() {
        let mut cfg = BuildConfig::default();
        cfg.args = vec!["-tags=dev".to_string()];
        let builder = Builder::new(&cfg, Path::new("."), true).unwrap();

        let args = builder.args();
        let debug_pos = args.iter().position(|a| a == "-gcflags=all=-N -l").unwrap();
        let extra_pos = args.iter().position(|a| a == "-tags=dev").unwrap();
        assert!(debug_pos < extra_pos);
        assert_eq!(args.last().map(String::as_str), Some("."));
    }

    #[test]
    fn test_bare_output_name_resolves_against_working_dir() {
        let mut cfg = BuildConfig::default();
        cfg.output = PathBuf::from("app");
        let builder = Builder::new(&cfg, Path::new("."), false).unwrap();

        let expected = std::env::current_dir().unwrap().join(binary_path(Path::new("app")));
        assert_eq!(builder.binary(), expected.as_path());
        let args = builder.args();
        let out = args.iter().position(|a| a == "-o").unwrap();
        assert_eq!(args[out + 1], expected.to_string_lossy());
    }

    /// A bare output name must start the freshly built file, not a `$PATH` lookup.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_bare_output_name_is_startable() {
        use crate::output::OutputSink;
        use crate::supervisor::Supervisor;

        let name = format!("reforge-bare-output-{}", std::process::id());
        // $1 is `-o`, $2 the resolved output path.
        let script = r#"printf '#!/bin/sh\necho built-and-running\n' > "$2" && chmod +x "$2""#;
        let mut cfg = config("sh", &["-c", script, "sh"]);
        cfg.output = PathBuf::from(&name);
        let builder = Builder::new(&cfg, Path::new("."), false).unwrap();
        let result = builder.build().await;
        assert!(result.succeeded, "{}", result.diagnostics);

        let sink = OutputSink::buffer();
        let mut sup = Supervisor::new(builder.binary(), Vec::new(), sink.clone());
        let started = sup.start();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut seen = false;
        if started.is_ok() {
            while std::time::Instant::now() < deadline {
                if String::from_utf8_lossy(&sink.snapshot().await).contains("built-and-running") {
                    seen = true;
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        }
        let _ = sup.stop().await;
        let _ = std::fs::remove_file(builder.binary());

        assert!(started.is_ok(), "start failed: {started:?}");
        assert!(seen, "built program never ran");
    }

    #[cfg(not(windows))]
    #[test]
    fn test_binary_path_unchanged_off_windows() {
        assert_eq!(binary_path(Path::new("bin/app")), PathBuf::from("bin/app"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_success_captures_output() {
        // `sh -c script` takes the remaining args as positional parameters.
        let builder = Builder::new(
            &config("sh", &["-c", "echo compiled; echo warned >&2", "sh"]),
            Path::new("."),
            false,
        )
        .unwrap();
        let result = builder.build().await;
        assert!(result.succeeded);
        assert!(result.diagnostics.contains("compiled"));
        assert!(result.diagnostics.contains("warned"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_failure_keeps_diagnostics_and_status() {
        let builder = Builder::new(
            &config("sh", &["-c", "echo 'main.go:3: undefined: x' >&2; exit 2", "sh"]),
            Path::new("."),
            false,
        )
        .unwrap();
        let result = builder.build().await;
        assert!(!result.succeeded);
        assert!(result.diagnostics.contains("main.go:3: undefined: x"));
        assert!(result.diagnostics.contains("compiler exited with"));
    }

    #[tokio::test]
    async fn test_build_launch_failure() {
        let builder = Builder::new(
            &config("nonexistent-compiler-xyz", &["build"]),
            Path::new("."),
            false,
        )
        .unwrap();
        let result = builder.build().await;
        assert!(!result.succeeded);
        assert!(result.diagnostics.contains("failed to launch compiler"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_build_leaves_previous_binary() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("app");
        std::fs::write(&binary, b"previous").unwrap();

        let mut cfg = config("sh", &["-c", "exit 1", "sh"]);
        cfg.output = binary.clone();
        let result = Builder::new(&cfg, Path::new("."), false)
            .unwrap()
            .build()
            .await;

        assert!(!result.succeeded);
        assert_eq!(std::fs::read(&binary).unwrap(), b"previous");
    }
}
