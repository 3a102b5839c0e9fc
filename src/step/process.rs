//! The `process` step: runs an external command.
//!
//! ```yaml
//! - type: process
//!   name: build
//!   command: make -C {src_dir} all      # or a list: [make, -C, "{src_dir}", all]
//!   shell: false                        # true runs the command through `sh -c`
//!   cwd: "{suite_dir}/src"
//!   env: {CC: clang}
//!   timeout: 120                        # seconds; default: settings.step_timeout_secs
//!   expected_exit_code: 0
//! ```
//!
//! Output goes to `stdout.log` and `stderr.log` in the step directory.

use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::select;
use tracing::debug;

use super::{Step, StepContext, StepError};
use crate::result::StepResult;
use crate::suite::StepSpec;
use crate::variables::render;

pub const KIND: &str = "process";

#[derive(Debug, Clone, PartialEq)]
struct ProcessConfig {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
    expected_exit_code: i32,
}

/// Runs one command and compares its exit code.
#[derive(Debug)]
pub struct ProcessStep {
    name: String,
    fields: Map<String, Value>,
    config: Option<ProcessConfig>,
}

impl ProcessStep {
    pub fn new(spec: &StepSpec, name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: spec.fields.clone(),
            config: None,
        }
    }

    fn parse(&self, fields: &Map<String, Value>, ctx: &StepContext) -> Result<ProcessConfig, StepError> {
        let shell = match fields.get("shell") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(StepError::invalid(&self.name, "'shell' must be a boolean")),
        };

        let words: Vec<String> = match fields.get("command") {
            Some(Value::String(command)) if shell => vec![command.clone()],
            Some(Value::String(command)) => shell_words::split(command)
                .map_err(|e| StepError::invalid(&self.name, format!("bad command: {e}")))?,
            Some(Value::Array(items)) => {
                let words: Vec<String> = items.iter().map(render).collect();
                if shell {
                    vec![shell_words::join(&words)]
                } else {
                    words
                }
            }
            Some(_) => {
                return Err(StepError::invalid(
                    &self.name,
                    "'command' must be a string or a list",
                ));
            }
            None => return Err(StepError::invalid(&self.name, "'command' is required")),
        };

        let (program, args) = if shell {
            ("sh".to_string(), vec!["-c".to_string(), words.concat()])
        } else {
            let mut words = words.into_iter();
            let program = words
                .next()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| StepError::invalid(&self.name, "'command' is empty"))?;
            (program, words.collect())
        };

        let cwd = match fields.get("cwd") {
            None | Some(Value::Null) => None,
            Some(Value::String(dir)) => Some(ctx.work_dir.join(dir)),
            Some(_) => return Err(StepError::invalid(&self.name, "'cwd' must be a string")),
        };

        let env = match fields.get("env") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(vars)) => vars.iter().map(|(k, v)| (k.clone(), render(v))).collect(),
            Some(_) => return Err(StepError::invalid(&self.name, "'env' must be a map")),
        };

        let timeout = ctx.duration_field(&self.fields, "timeout")?.or(ctx.default_timeout);

        let expected_exit_code = match fields.get("expected_exit_code") {
            None | Some(Value::Null) => 0,
            Some(value) => value
                .as_i64()
                .and_then(|code| i32::try_from(code).ok())
                .ok_or_else(|| {
                    StepError::invalid(&self.name, "'expected_exit_code' must be an integer")
                })?,
        };

        Ok(ProcessConfig {
            program,
            args,
            cwd,
            env,
            timeout,
            expected_exit_code,
        })
    }
}

impl Step for ProcessStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        KIND
    }

    fn setup(&mut self, ctx: &StepContext) -> Result<(), StepError> {
        let fields = ctx.expand_fields(&self.fields)?;
        self.config = Some(self.parse(&fields, ctx)?);
        Ok(())
    }

    fn run(&mut self, ctx: &StepContext) -> Result<StepResult, StepError> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| StepError::Runtime(format!("step '{}' run before setup", self.name)))?;

        if let Err(e) = ctx.ensure_step_dir() {
            return Ok(StepResult::fail(e.to_string()));
        }
        let (stdout, stderr) = match open_logs(ctx) {
            Ok(files) => files,
            Err(e) => return Ok(StepResult::fail(e.to_string())),
        };

        let mut command = tokio::process::Command::new(&config.program);
        command
            .args(&config.args)
            .current_dir(config.cwd.as_ref().unwrap_or(&ctx.work_dir))
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);

        debug!(
            "[{}] Running {} {}",
            ctx.test_name,
            config.program,
            shell_words::join(&config.args)
        );

        let start = Instant::now();
        let result = ctx.runtime.block_on(async {
            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    return StepResult::fail(format!("failed to start '{}': {}", config.program, e));
                }
            };

            let deadline = async {
                match config.timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };

            select! {
                status = child.wait() => match status {
                    Ok(status) => match status.code() {
                        Some(code) if code == config.expected_exit_code => {
                            StepResult::pass().with_exit_code(Some(code))
                        }
                        Some(code) => StepResult::fail(format!(
                            "exit code {} (expected {})",
                            code, config.expected_exit_code
                        ))
                        .with_exit_code(Some(code)),
                        None => StepResult::fail("terminated by a signal"),
                    },
                    Err(e) => StepResult::fail(format!("failed to wait for process: {e}")),
                },
                _ = deadline => {
                    let _ = child.kill().await;
                    StepResult::timed_out(format!(
                        "timed out after {:.1}s",
                        config.timeout.unwrap_or_default().as_secs_f64()
                    ))
                }
                _ = ctx.cancel.cancelled() => {
                    let _ = child.kill().await;
                    StepResult::incomplete("interrupted")
                }
            }
        });

        debug!(
            "[{}] {} finished in {:?}",
            ctx.test_name,
            config.program,
            start.elapsed()
        );
        Ok(result)
    }
}

fn open_logs(ctx: &StepContext) -> Result<(File, File), StepError> {
    let open = |name: &str| {
        let path = ctx.step_dir.join(name);
        File::create(&path).map_err(|source| StepError::Io {
            context: format!("Failed to create {}", path.display()),
            source,
        })
    };
    Ok((open("stdout.log")?, open("stderr.log")?))
}
