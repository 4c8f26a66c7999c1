//! In-memory fakes for the external-tool seams.
//!
//! `ScriptedRunner` stands in for every CLI driver: by default each program
//! echoes stdin back as stdout and succeeds, so template stages become
//! identity filters. Programs can be scripted to fail, to emit fixed output,
//! to write files into the directory they were asked to populate, or to
//! take time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{PipelineError, Result};
use crate::http::ArtifactFetcher;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};

#[derive(Debug, Clone, Default)]
struct Script {
    fail_remaining: u32,
    fail_always: bool,
    failure: String,
    stdout: Option<Vec<u8>>,
    files: BTreeMap<String, Vec<u8>>,
    delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, program: &str, edit: impl FnOnce(&mut Script)) {
        if let Ok(mut scripts) = self.scripts.lock() {
            edit(scripts.entry(program.to_string()).or_default());
        }
    }

    /// Fail the next `times` invocations of `program`, then behave normally.
    pub fn fail_times(self, program: &str, times: u32, message: &str) -> Self {
        self.script(program, |s| {
            s.fail_remaining = times;
            s.failure = message.to_string();
        });
        self
    }

    pub fn always_fail(self, program: &str, message: &str) -> Self {
        self.script(program, |s| {
            s.fail_always = true;
            s.failure = message.to_string();
        });
        self
    }

    pub fn with_stdout(self, program: &str, stdout: &[u8]) -> Self {
        self.script(program, |s| s.stdout = Some(stdout.to_vec()));
        self
    }

    /// Write `content` to `<output_dir>/<name>` on every successful call.
    pub fn with_file(self, program: &str, name: &str, content: &[u8]) -> Self {
        self.script(program, |s| {
            s.files.insert(name.to_string(), content.to_vec());
        });
        self
    }

    pub fn with_delay(self, program: &str, delay: Duration) -> Self {
        self.script(program, |s| s.delay = Some(delay));
        self
    }

    /// Every invocation so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_to(&self, program: &str) -> usize {
        self.calls().iter().filter(|c| c.program == program).count()
    }

    /// First argument of every call to `program` (the subcommand for kapp/helm).
    pub fn verbs(&self, program: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .filter_map(|c| c.args.first().cloned())
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: CommandSpec) -> Result<CommandOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(command.clone());
        }

        let (fail, script) = {
            let mut scripts = self
                .scripts
                .lock()
                .map_err(|_| PipelineError::InvalidInput("runner lock poisoned".into()))?;
            let script = scripts.entry(command.program.clone()).or_default();
            let fail = script.fail_always || script.fail_remaining > 0;
            script.fail_remaining = script.fail_remaining.saturating_sub(1);
            (fail, script.clone())
        };

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(PipelineError::Command {
                program: command.program,
                status: "exit status: 1".to_string(),
                stderr: script.failure,
            });
        }
        if let Some(dir) = &command.output_dir {
            for (name, content) in &script.files {
                crate::staging::write_file(&dir.join(name), content)?;
            }
        }
        let stdout = script
            .stdout
            .or(command.stdin)
            .unwrap_or_default();
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            duration_ms: 0,
        })
    }
}

/// Serves artifacts from a map of URL to bytes.
#[derive(Debug, Default)]
pub struct StaticArtifacts {
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
    fail_remaining: Mutex<u32>,
    requests: Mutex<Vec<(String, Option<String>)>>,
}

impl StaticArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: &str, bytes: &[u8]) -> Self {
        if let Ok(mut artifacts) = self.artifacts.lock() {
            artifacts.insert(url.to_string(), bytes.to_vec());
        }
        self
    }

    pub fn fail_times(self, times: u32) -> Self {
        if let Ok(mut remaining) = self.fail_remaining.lock() {
            *remaining = times;
        }
        self
    }

    /// (url, token) of every request so far.
    pub fn requests(&self) -> Vec<(String, Option<String>)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ArtifactFetcher for StaticArtifacts {
    async fn download(&self, url: &str, token: Option<&str>) -> Result<Vec<u8>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((url.to_string(), token.map(str::to_string)));
        }
        if let Ok(mut remaining) = self.fail_remaining.lock() {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PipelineError::Http {
                    url: url.to_string(),
                    message: "connection reset by peer".to_string(),
                });
            }
        }
        self.artifacts
            .lock()
            .ok()
            .and_then(|a| a.get(url).cloned())
            .ok_or_else(|| PipelineError::Http {
                url: url.to_string(),
                message: "unexpected status 404 Not Found".to_string(),
            })
    }
}
