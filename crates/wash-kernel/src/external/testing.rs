//! Test double for the plugin runtime.
//!
//! [`FakeScript`] replaces [`PluginExecutable`](super::PluginExecutable) in
//! tests: expectations are queued in invocation order, and every call is
//! recorded for assertions.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use super::script::{PluginProcess, PluginScript};
use crate::ctx::Context;
use wash_types::{WashError, WashResult};

enum Expected {
    Output(WashResult<Vec<u8>>),
    Process {
        stdout: Vec<u8>,
        exit_code: i32,
        stderr: Vec<u8>,
    },
}

struct Expectation {
    args: Vec<String>,
    expected: Expected,
}

/// An in-memory [`PluginScript`] with queued canned responses.
pub struct FakeScript {
    path: PathBuf,
    expectations: Mutex<VecDeque<Expectation>>,
    calls: Mutex<Vec<Vec<String>>>,
    inputs: Mutex<Vec<Bytes>>,
}

impl FakeScript {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("plugin_script"),
            expectations: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Queue the stdout (or failure) for the next matching invocation.
    pub fn expect(&self, args: &[&str], result: WashResult<Vec<u8>>) {
        self.expectations.lock().unwrap().push_back(Expectation {
            args: args.iter().map(|s| s.to_string()).collect(),
            expected: Expected::Output(result),
        });
    }

    /// Queue a spawned process for the next matching `spawn`.
    pub fn expect_spawn(&self, args: &[&str], stdout: &[u8], exit_code: i32, stderr: &[u8]) {
        self.expectations.lock().unwrap().push_back(Expectation {
            args: args.iter().map(|s| s.to_string()).collect(),
            expected: Expected::Process {
                stdout: stdout.to_vec(),
                exit_code,
                stderr: stderr.to_vec(),
            },
        });
    }

    /// Every invocation's argument vector, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Stdin payloads passed to `invoke_with_input`, in order.
    pub fn inputs(&self) -> Vec<Bytes> {
        self.inputs.lock().unwrap().clone()
    }

    fn next(&self, args: &[String]) -> WashResult<Expected> {
        self.calls.lock().unwrap().push(args.to_vec());
        let expectation = self
            .expectations
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| {
                WashError::Transient(format!("unexpected plugin invocation: {:?}", args))
            })?;
        if expectation.args != args {
            return Err(WashError::Transient(format!(
                "plugin invoked with {:?}, expected {:?}",
                args, expectation.args
            )));
        }
        Ok(expectation.expected)
    }
}

impl Default for FakeScript {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PluginScript for FakeScript {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn invoke_and_wait(&self, _ctx: &Context, args: &[String]) -> WashResult<Vec<u8>> {
        match self.next(args)? {
            Expected::Output(result) => result,
            Expected::Process { .. } => Err(WashError::Transient(
                "expectation queued for spawn, not invoke_and_wait".into(),
            )),
        }
    }

    async fn invoke_with_input(
        &self,
        ctx: &Context,
        args: &[String],
        input: Bytes,
    ) -> WashResult<Vec<u8>> {
        self.inputs.lock().unwrap().push(input);
        self.invoke_and_wait(ctx, args).await
    }

    async fn spawn(
        &self,
        _ctx: &Context,
        args: &[String],
        want_stdin: bool,
    ) -> WashResult<PluginProcess> {
        match self.next(args)? {
            Expected::Process {
                stdout,
                exit_code,
                stderr,
            } => {
                let proc = PluginProcess::fake(stdout, exit_code, stderr);
                Ok(if want_stdin {
                    proc.fake_with_stdin()
                } else {
                    proc
                })
            }
            Expected::Output(_) => Err(WashError::Transient(
                "expectation queued for invoke_and_wait, not spawn".into(),
            )),
        }
    }
}
