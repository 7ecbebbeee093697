//! Process lane: lifecycle bridged to a child process over stdio JSON
//! lines.
//!
//! Wire sequence: `host.hello` / `app.init_ok` at init, `host.tick` /
//! `app.commands` per tick, `host.stop` (best-effort acknowledged) at
//! stop. The only command op today is `solid_fill`; anything else fails
//! the tick. The child is always reaped on stop, by terminate if the
//! protocol goodbye does not get through.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

use core_matrix::{PixelRect, WriteBatch, WriteOp};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::context::AppContext;
use crate::lifecycle::AppLifecycle;
use crate::manifest::AppManifest;
use crate::AppError;

pub const STDIO_JSONL_TRANSPORT: &str = "stdio_jsonl";

pub struct ProcessLifecycle {
    command: Vec<String>,
    cwd: PathBuf,
    protocol_version: String,
    child: Option<ChildHandles>,
}

struct ChildHandles {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ProcessLifecycle {
    pub fn new(
        command: Vec<String>,
        cwd: impl Into<PathBuf>,
        protocol_version: impl Into<String>,
    ) -> Result<Self, AppError> {
        if command.is_empty() {
            return Err(AppError::Process("process command must not be empty".into()));
        }
        Ok(Self {
            command,
            cwd: cwd.into(),
            protocol_version: protocol_version.into(),
            child: None,
        })
    }

    pub(crate) fn from_manifest(
        manifest: &AppManifest,
        module_dir: &Path,
    ) -> Result<Self, AppError> {
        let runtime = manifest
            .runtime
            .as_ref()
            .ok_or_else(|| AppError::Process("manifest has no [runtime] table".into()))?;
        let transport = runtime.transport.as_deref().unwrap_or(STDIO_JSONL_TRANSPORT);
        if transport != STDIO_JSONL_TRANSPORT {
            return Err(AppError::Process(format!(
                "unsupported process transport: {transport}"
            )));
        }
        let command = runtime
            .command
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::Process("process runtime requires a command".into()))?;
        Self::new(command, module_dir, manifest.protocol_version.clone())
    }

    fn send(&mut self, payload: &Value) -> Result<(), AppError> {
        let handles = self
            .child
            .as_mut()
            .ok_or_else(|| AppError::Process("process lifecycle is not initialized".into()))?;
        let line = serde_json::to_string(payload)
            .map_err(|e| AppError::Process(format!("encode failed: {e}")))?;
        handles
            .stdin
            .write_all(line.as_bytes())
            .and_then(|()| handles.stdin.write_all(b"\n"))
            .and_then(|()| handles.stdin.flush())
            .map_err(|e| AppError::Process(format!("write to app process failed: {e}")))
    }

    fn recv(&mut self) -> Result<Value, AppError> {
        let handles = self
            .child
            .as_mut()
            .ok_or_else(|| AppError::Process("process lifecycle is not initialized".into()))?;
        let mut line = String::new();
        let read = handles
            .stdout
            .read_line(&mut line)
            .map_err(|e| AppError::Process(format!("read from app process failed: {e}")))?;
        if read == 0 {
            return Err(AppError::Process(
                "process protocol ended unexpectedly".into(),
            ));
        }
        let value: Value = serde_json::from_str(line.trim())
            .map_err(|e| AppError::Process(format!("invalid process message: {e}")))?;
        if !value.is_object() {
            return Err(AppError::Process("process message must be an object".into()));
        }
        Ok(value)
    }

    fn apply_commands(&self, ctx: &mut AppContext, msg: &Value) -> Result<(), AppError> {
        let Some(ops) = msg.get("ops").and_then(Value::as_array) else {
            return Err(AppError::Process("app.commands.ops must be a list".into()));
        };
        for op in ops {
            let kind = op.get("op").and_then(Value::as_str).unwrap_or_default();
            if kind != "solid_fill" {
                return Err(AppError::Process(format!(
                    "unsupported process op: {kind:?}"
                )));
            }
            let rgba = parse_rgba(op.get("rgba"))?;
            let extent = ctx.matrix_extent();
            let rect = PixelRect::solid(extent.width, extent.height, rgba)?;
            ctx.submit_write_batch(&WriteBatch::single(WriteOp::FullRewrite(rect)))?;
        }
        Ok(())
    }

    fn reap(&mut self) {
        let Some(mut handles) = self.child.take() else {
            return;
        };
        match handles.child.try_wait() {
            Ok(Some(status)) => {
                debug!(target: "app.process", %status, "app process exited");
            }
            _ => {
                if let Err(error) = handles.child.kill() {
                    warn!(target: "app.process", %error, "terminate failed");
                }
                let _ = handles.child.wait();
            }
        }
    }
}

impl AppLifecycle for ProcessLifecycle {
    fn init(&mut self, ctx: &mut AppContext) -> anyhow::Result<()> {
        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AppError::Process(format!("spawn failed: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Process("app process stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| AppError::Process("app process stdout unavailable".into()))?;
        self.child = Some(ChildHandles {
            child,
            stdin,
            stdout,
        });
        let extent = ctx.matrix_extent();
        let hello = json!({
            "type": "host.hello",
            "protocol_version": self.protocol_version,
            "matrix": {"width": extent.width, "height": extent.height},
            "capabilities": ctx.granted_capabilities().iter().collect::<Vec<_>>(),
        });
        self.send(&hello)?;
        let reply = self.recv()?;
        if reply.get("type").and_then(Value::as_str) != Some("app.init_ok") {
            return Err(AppError::Process(format!(
                "unexpected process init response: {reply}"
            ))
            .into());
        }
        Ok(())
    }

    fn tick(&mut self, ctx: &mut AppContext, dt: Duration) -> anyhow::Result<()> {
        self.send(&json!({"type": "host.tick", "dt": dt.as_secs_f64()}))?;
        let reply = self.recv()?;
        if reply.get("type").and_then(Value::as_str) != Some("app.commands") {
            return Err(AppError::Process(format!(
                "unexpected process tick response: {reply}"
            ))
            .into());
        }
        self.apply_commands(ctx, &reply)?;
        Ok(())
    }

    fn stop(&mut self, _ctx: &mut AppContext) -> anyhow::Result<()> {
        if self.child.is_some() {
            // Goodbye is best-effort; the child may already be gone.
            if self.send(&json!({"type": "host.stop"})).is_ok() {
                let _ = self.recv();
            }
            self.reap();
        }
        Ok(())
    }
}

impl Drop for ProcessLifecycle {
    fn drop(&mut self) {
        self.reap();
    }
}

fn parse_rgba(value: Option<&Value>) -> Result<[f32; 4], AppError> {
    let channels: Vec<u8> = value
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_u64)
                .filter(|v| *v <= 255)
                .map(|v| v as u8)
                .collect()
        })
        .unwrap_or_default();
    if channels.len() != 4 {
        return Err(AppError::Process(
            "solid_fill.rgba must be 4 uint8 ints".into(),
        ));
    }
    Ok([
        f32::from(channels[0]),
        f32::from(channels[1]),
        f32::from(channels[2]),
        f32::from(channels[3]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            ProcessLifecycle::new(Vec::new(), "/tmp", "2"),
            Err(AppError::Process(_))
        ));
    }

    #[test]
    fn rgba_parsing_enforces_four_uint8_channels() {
        assert!(parse_rgba(Some(&json!([1, 2, 3, 255]))).is_ok());
        assert!(parse_rgba(Some(&json!([1, 2, 3]))).is_err());
        assert!(parse_rgba(Some(&json!([1, 2, 3, 300]))).is_err());
        assert!(parse_rgba(Some(&json!("red"))).is_err());
        assert!(parse_rgba(None).is_err());
    }
}
