use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::planner::Plan;

pub type TaskExecFn = fn(&PipelineConfig, &mut ExecCtx) -> Result<()>;

#[derive(Default)]
struct SharedExecState {
    // Running child process group ids, so a cancel can kill the whole
    // subtree a vendor script spawned.
    child_pgroups: Mutex<BTreeMap<u32, String>>,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_started: usize,
    tasks_ok: usize,
    tasks_failed: usize,
    log_lines: usize,
    total_task_ms: u128,
    failed_tasks: Vec<String>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TaskStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.tasks_started = s.tasks_started.saturating_add(1);
                    if s.started_at.is_none() {
                        s.started_at = Some(Instant::now());
                    }
                }
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines = s.log_lines.saturating_add(1);
                }
                println!("[{id}] {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.tasks_ok = s.tasks_ok.saturating_add(1);
                    } else {
                        s.tasks_failed = s.tasks_failed.saturating_add(1);
                        s.failed_tasks.push(id.clone());
                    }
                    s.total_task_ms = s.total_task_ms.saturating_add(elapsed_ms);
                }
                if ok {
                    println!("DONE: {id} ({elapsed_ms}ms)");
                } else {
                    println!("FAIL: {id} ({elapsed_ms}ms) {}", error.unwrap_or_default());
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let mut summary = String::new();
                if let Ok(mut s) = self.state.lock() {
                    let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                    summary.push_str("SUMMARY:\n");
                    summary.push_str(&format!(
                        "  status: {}\n",
                        if ok { "ok" } else { "failed" }
                    ));
                    summary.push_str(&format!(
                        "  tasks: started={} ok={} failed={}\n",
                        s.tasks_started, s.tasks_ok, s.tasks_failed
                    ));
                    summary.push_str(&format!("  logs: {}\n", s.log_lines));
                    summary.push_str(&format!(
                        "  elapsed: {}\n",
                        format_elapsed_hms(wall.as_secs())
                    ));
                    summary.push_str(&format!(
                        "  finished: {}\n",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
                    ));
                    if !s.failed_tasks.is_empty() {
                        summary.push_str(&format!(
                            "  failed_tasks: {}\n",
                            s.failed_tasks.join(", ")
                        ));
                    }
                    *s = StdoutSinkState::default();
                }
                print!("{summary}");
                if let Some(e) = error {
                    println!("  error: {e}");
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

/// Outcome of an operation whose failure is intentionally tolerated. Stages
/// that stop/restore host services use this instead of discarding errors, so
/// callers and tests can see which operations are genuinely optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort {
    Completed,
    Skipped(String),
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub cancel: Arc<AtomicBool>,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            cancel: Arc::new(AtomicBool::new(false)),
            sink,
            current_task_id: None,
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: msg.to_string(),
        });
    }

    /// Soft failures are surfaced both on the sink and through tracing.
    pub fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
        self.log(&format!("WARN: {msg}"));
    }

    fn register_child_pgroup(&self, pgid: u32) {
        if let Ok(mut g) = self.shared.child_pgroups.lock() {
            let owner = self
                .current_task_id
                .clone()
                .unwrap_or_else(|| "<none>".into());
            g.insert(pgid, owner);
        }
    }

    fn unregister_child_pgroup(&self, pgid: u32) {
        if let Ok(mut g) = self.shared.child_pgroups.lock() {
            g.remove(&pgid);
        }
    }

    // Runs a subprocess with line-buffered, sanitized output on the sink.
    // Non-zero exit is an error; there are no timeouts, vendor tools run to
    // natural completion.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        if self.cancelled() {
            return Err(Error::msg("cancelled"));
        }
        if self.dry_run {
            self.log(&format!("DRY-RUN: {:?}", cmd));
            return Ok(());
        }

        // On unix: put the child into its own process group so a cancel can
        // kill the whole subtree.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            // Detached stdin: a vendor script reading the controlling TTY
            // from its own process group would suspend on SIGTTIN.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("spawn failed: {e}")))?;
        let pgid = child.id();
        self.register_child_pgroup(pgid);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = stdout {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = stderr {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if line.is_empty() {
                continue;
            }
            self.log(&line);
            if self.cancelled() {
                kill_pgroup(pgid, false);
                kill_pgroup(pgid, true);
                break;
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
        self.unregister_child_pgroup(pgid);
        if !status.success() {
            return Err(Error::msg(format!("command failed: {status}")));
        }
        Ok(())
    }

    /// Runs a probe command and captures its output instead of streaming it.
    /// Used for tools whose stdout is parsed (board-id query, runtime
    /// detection) rather than logged.
    pub fn run_cmd_capture(&self, mut cmd: Command) -> Result<Output> {
        if self.cancelled() {
            return Err(Error::msg("cancelled"));
        }
        cmd.stdin(Stdio::null())
            .output()
            .map_err(|e| Error::msg(format!("spawn failed: {e}")))
    }

    /// Fire-and-forget: runs a command and reports whether it completed, but
    /// never fails the calling stage.
    pub fn run_cmd_best_effort(&self, mut cmd: Command) -> BestEffort {
        if self.dry_run {
            self.log(&format!("DRY-RUN (best-effort): {:?}", cmd));
            return BestEffort::Completed;
        }
        let described = format!("{:?}", cmd);
        match cmd.stdin(Stdio::null()).output() {
            Ok(out) if out.status.success() => BestEffort::Completed,
            Ok(out) => {
                let reason = format!("{described} exited with {}", out.status);
                self.log(&format!("best-effort: {reason}"));
                BestEffort::Skipped(reason)
            }
            Err(e) => {
                let reason = format!("{described} could not run: {e}");
                self.log(&format!("best-effort: {reason}"));
                BestEffort::Skipped(reason)
            }
        }
    }
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

/// Builds `sudo <program>` when not already running as root. The flashing
/// and rootfs steps need root either way; this lets the tool run unwrapped
/// in a root shell or via sudo from a user shell.
pub fn privileged_cmd(program: &str) -> Command {
    #[cfg(unix)]
    {
        let euid = unsafe { libc::geteuid() };
        if euid != 0 {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            return cmd;
        }
    }
    Command::new(program)
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

/// Strictly sequential execution: each task runs to completion before the
/// next starts, and the first failure aborts the whole run.
pub fn execute_plan(
    cfg: &PipelineConfig,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    for task in plan.ordered()? {
        let Some(exec) = reg.get(&task.id) else {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        };
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());
        if ctx.dry_run {
            ctx.log(&format!(
                "DRY-RUN: {} ({}/{})",
                task.id, task.module, task.phase
            ));
            ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms: 0,
            });
            continue;
        }
        let start = Instant::now();
        let res = exec(cfg, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(format!("task '{}' failed: {e}", task.id)),
                });
                return Err(Error::msg(format!("task '{}' failed: {e}", task.id)));
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    reg.add("core.init", core_init)?;
    crate::modules::fetch::FetchModule::register_tasks(&mut reg)?;
    crate::modules::rootfs::RootfsModule::register_tasks(&mut reg)?;
    crate::modules::bootsvc::BootServiceModule::register_tasks(&mut reg)?;
    crate::modules::flash::FlashModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn core_init(cfg: &PipelineConfig, ctx: &mut ExecCtx) -> Result<()> {
    let ws = &cfg.workspace;
    ws.init_dirs()?;
    ctx.log(&format!("workspace.root = {}", ws.root.display()));
    ctx.log(&format!("workspace.downloads = {}", ws.downloads_dir.display()));
    ctx.log(&format!("workspace.bsp = {}", ws.bsp_dir.display()));
    ctx.log(&format!("workspace.rootfs = {}", ws.rootfs_dir.display()));
    if let Some(v) = cfg.version {
        ctx.log(&format!("release = {v}"));
    }

    #[cfg(unix)]
    if unsafe { libc::geteuid() } != 0 {
        ctx.warn("not running as root; privileged steps will be wrapped in sudo");
    }
    Ok(())
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if pending.is_empty() {
                    continue;
                }
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                let _ = tx.send(line);
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    let _ = tx.send(line);
                }
            }
        }
    }

    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(line);
    }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_effort_reports_missing_commands_as_skipped() {
        let ctx = ExecCtx::new(false, Arc::new(StdoutSink::default()));
        let out = ctx.run_cmd_best_effort(Command::new("definitely-not-a-real-command-xyz"));
        assert!(matches!(out, BestEffort::Skipped(_)));
    }

    #[test]
    fn best_effort_is_a_noop_in_dry_run() {
        let ctx = ExecCtx::new(true, Arc::new(StdoutSink::default()));
        let out = ctx.run_cmd_best_effort(Command::new("definitely-not-a-real-command-xyz"));
        assert_eq!(out, BestEffort::Completed);
    }

    #[test]
    fn run_cmd_fails_on_nonzero_exit() {
        let ctx = ExecCtx::new(false, Arc::new(StdoutSink::default()));
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 3");
        let err = ctx.run_cmd(cmd).unwrap_err().to_string();
        assert!(err.contains("command failed"), "unexpected err: {err}");
    }

    #[test]
    fn format_elapsed_is_zero_padded() {
        assert_eq!(format_elapsed_hms(0), "00:00:00");
        assert_eq!(format_elapsed_hms(3661), "01:01:01");
    }
}
