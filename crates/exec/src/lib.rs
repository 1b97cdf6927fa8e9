//! skala exec: runs operator-supplied programs against a JSON payload.
//!
//! A method describes how to launch a program; the payload goes to its
//! stdin, stdout comes back verbatim, and the configured timeout bounds
//! the whole invocation.

#![forbid(unsafe_code)]

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use skala_core::Method;

/// Method type handled by [`ShellExecuter`].
pub const SHELL_METHOD: &str = "shell";

/// Runs a configured method against a string payload and returns the
/// program's standard output.
#[async_trait]
pub trait Executer: Send + Sync {
    async fn execute_with_value(&self, method: &Method, value: &str) -> Result<String>;

    /// The `method.type` value this executer handles.
    fn method_type(&self) -> &str;
}

/// Executes `shell` methods: spawns `entrypoint command` with the payload
/// piped to stdin and stdout/stderr captured independently.
#[derive(Debug, Default)]
pub struct ShellExecuter;

impl ShellExecuter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executer for ShellExecuter {
    async fn execute_with_value(&self, method: &Method, value: &str) -> Result<String> {
        let shell = method
            .shell
            .as_ref()
            .ok_or_else(|| anyhow!("method type '{}' has no shell configuration", method.typ))?;
        let timeout = Duration::from_millis(method.timeout_ms());

        let mut child = Command::new(&shell.entrypoint)
            .arg(&shell.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn '{} {}'", shell.entrypoint, shell.command))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("child process stdin was not piped"))?;
        let payload = value.as_bytes().to_vec();
        let run = async move {
            // A program is free to exit without reading its stdin; the
            // resulting broken pipe is not an execution failure.
            if let Err(err) = stdin.write_all(&payload).await {
                if err.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(err);
                }
            }
            drop(stdin);
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(timeout, run).await {
            Ok(res) => res.with_context(|| {
                format!("failed to run '{} {}'", shell.entrypoint, shell.command)
            })?,
            // Dropping the in-flight future drops the child, which kills
            // the process (kill_on_drop).
            Err(_) => {
                return Err(anyhow!(
                    "entrypoint '{}' with command '{}' timed out after {}ms",
                    shell.entrypoint,
                    shell.command,
                    method.timeout_ms()
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                entrypoint = %shell.entrypoint,
                command = %shell.command,
                status = %output.status,
                stderr = %stderr,
                "external program failed"
            );
            return Err(anyhow!("{}", output.status));
        }
        debug!(
            entrypoint = %shell.entrypoint,
            command = %shell.command,
            stdout_bytes = output.stdout.len(),
            "external program succeeded"
        );
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn method_type(&self) -> &str {
        SHELL_METHOD
    }
}

/// Dispatches a method to the sub-executer whose type matches
/// `method.type`; fails for unknown types.
pub struct CombinedExecuter {
    executers: Vec<Arc<dyn Executer>>,
}

impl CombinedExecuter {
    pub fn new(executers: Vec<Arc<dyn Executer>>) -> Self {
        Self { executers }
    }

    /// The built-in executer stack (currently shell only).
    pub fn default_stack() -> Self {
        Self::new(vec![Arc::new(ShellExecuter::new())])
    }
}

#[async_trait]
impl Executer for CombinedExecuter {
    async fn execute_with_value(&self, method: &Method, value: &str) -> Result<String> {
        for executer in &self.executers {
            if executer.method_type() == method.typ {
                return executer.execute_with_value(method, value).await;
            }
        }
        Err(anyhow!("Unknown execution method: '{}'", method.typ))
    }

    fn method_type(&self) -> &str {
        "combined"
    }
}

pub mod mock {
    //! In-memory [`Executer`] fake for tests across the workspace.

    use super::*;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&Method, &str) -> Result<String> + Send + Sync>;

    /// Records every invocation and answers via a programmable responder.
    pub struct MockExecuter {
        /// `(method.type, shell.command if any, payload)` per call, in order.
        pub calls: Mutex<Vec<(String, String, String)>>,
        responder: Responder,
        typ: String,
    }

    impl MockExecuter {
        pub fn new(responder: Responder) -> Self {
            Self { calls: Mutex::new(Vec::new()), responder, typ: "mock".to_string() }
        }

        /// Always answer with the same stdout.
        pub fn returning(value: &str) -> Self {
            let value = value.to_string();
            Self::new(Box::new(move |_, _| Ok(value.clone())))
        }

        /// Always fail with the given message.
        pub fn failing(message: &str) -> Self {
            let message = message.to_string();
            Self::new(Box::new(move |_, _| Err(anyhow!("{}", message))))
        }

        pub fn with_type(mut self, typ: &str) -> Self {
            self.typ = typ.to_string();
            self
        }

        /// Payloads seen so far, for asserting hook envelopes.
        pub fn payloads(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(_, _, p)| p.clone()).collect()
        }

        /// Commands seen so far (empty string for methods with no shell).
        pub fn commands(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(_, c, _)| c.clone()).collect()
        }
    }

    #[async_trait]
    impl Executer for MockExecuter {
        async fn execute_with_value(&self, method: &Method, value: &str) -> Result<String> {
            let command = method
                .shell
                .as_ref()
                .map(|s| s.command.clone())
                .unwrap_or_default();
            self.calls
                .lock()
                .unwrap()
                .push((method.typ.clone(), command, value.to_string()));
            (self.responder)(method, value)
        }

        fn method_type(&self) -> &str {
            &self.typ
        }
    }
}
