//! SSH connection management and command execution.
//!
//! One [`SshClient`] owns one target host. The connection lifecycle:
//!
//! 1. **Cache check**: a cached channel is reused while its last use is
//!    under five minutes old and the keep-alive watchdog has not flagged it.
//! 2. **Single-flight dial**: concurrent cold callers serialize on a dial
//!    gate and re-check the cache before dialing, so exactly one dial runs
//!    and every caller receives the same channel.
//! 3. **Authentication**: the [`AuthChain`] produces attempts in order; the
//!    client dials once per attempt and stops at the first success. A dial
//!    timeout short-circuits the rest of the chain.
//! 4. **Keep-alive**: the transport sends protocol-level pings on the
//!    configured interval; a watchdog task marks the cached channel dead as
//!    soon as the transport reports closed, so it is never reused.
//!
//! Command execution opens a fresh session channel per command. Concurrent
//! sessions on one cached channel are allowed and independent; a
//! session-open failure on a cached channel triggers exactly one
//! transparent reconnect before surfacing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use russh::keys::{self, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect, Pty, Sig, client};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::{AuthChain, AuthMethod};
use crate::capabilities::CapCache;
use crate::command::Command;
use crate::config;
use crate::error::{EngineError, short_for_log, stderr_tail};
use crate::host::{HostDescriptor, port_or_default};
use crate::strategy::PrivilegeStrategy;
use crate::vault::SecretVault;

/// How long an idle cached connection stays eligible for reuse.
const CONN_REUSE_WINDOW: Duration = Duration::from_secs(300);

/// Settle delay before stdin is written to a PTY session, giving the remote
/// prompt time to appear.
const PTY_STDIN_DELAY: Duration = Duration::from_millis(150);

/// Host key verification policy.
pub trait HostKeyVerifier: Send + Sync {
    /// Accept or reject the server's public key for `host`.
    fn verify(&self, host: &str, key: &keys::PublicKey) -> bool;
}

/// Accepts every host key, like `StrictHostKeyChecking=no`.
///
/// This provides no protection against man-in-the-middle attacks and is
/// only acceptable on trusted management networks. Deployments should
/// install a real verifier with [`SshClient::with_host_key_verifier`].
pub struct InsecureAcceptAll;

impl HostKeyVerifier for InsecureAcceptAll {
    fn verify(&self, host: &str, _key: &keys::PublicKey) -> bool {
        warn!(%host, "accepting unverified host key");
        true
    }
}

/// russh client handler delegating host key checks to the configured verifier.
pub struct ClientHandler {
    host: String,
    verifier: Arc<dyn HostKeyVerifier>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(self.verifier.verify(&self.host, server_public_key))
    }
}

type ConnectHook = dyn Fn(&HostDescriptor, &str, Option<&EngineError>) + Send + Sync;
type ResultHook = dyn Fn(&HostDescriptor, &Command, &ExecResult) + Send + Sync;
type TaskHook = dyn Fn(&crate::pool::Task) + Send + Sync;

/// Observability callbacks, fired at the obvious moments.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Fires once per dial attempt outcome: `(host, user, error)`.
    pub on_connect: Option<Arc<ConnectHook>>,
    /// Fires once per completed command.
    pub on_result: Option<Arc<ResultHook>>,
    /// Fires on every task state change in the worker pool.
    pub on_task: Option<Arc<TaskHook>>,
}

/// Outcome of one remote command.
///
/// Failures are carried inline rather than as `Err`: batch fan-out and the
/// task store need per-host rows that keep stdout, stderr and the exit code
/// next to the failure.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub host_id: u64,
    /// Host address, for display and batch correlation.
    pub host: String,
    pub stdout: String,
    pub stderr: String,
    /// 0 on clean exit, the remote status on non-zero exit, -1 on
    /// transport, timeout or cancellation failure.
    pub code: i32,
    pub error: Option<EngineError>,
    pub duration: Duration,
    /// Name of the privilege strategy that ran the command.
    pub strategy: &'static str,
}

impl ExecResult {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

struct ConnSlot {
    handle: Option<Arc<client::Handle<ClientHandler>>>,
    user: String,
    last_used: Instant,
    dead: Arc<AtomicBool>,
}

impl Default for ConnSlot {
    fn default() -> Self {
        Self {
            handle: None,
            user: String::new(),
            last_used: Instant::now(),
            dead: Arc::new(AtomicBool::new(false)),
        }
    }
}

enum DialFailure {
    TimedOut,
    Dial(String),
    Auth(String),
}

/// Connection-pooled SSH client for one host.
pub struct SshClient {
    host: HostDescriptor,
    vault: Arc<SecretVault>,
    auth: AuthChain,
    verifier: Arc<dyn HostKeyVerifier>,
    caps: Arc<CapCache>,
    hooks: Hooks,

    conn: Mutex<ConnSlot>,
    dial_gate: Mutex<()>,

    dial_timeout: Duration,
    cmd_timeout: Duration,
    keep_alive: Duration,
}

impl SshClient {
    /// Client with configuration defaults, the stock auth chain and the
    /// insecure accept-all host key policy (see [`InsecureAcceptAll`]).
    pub fn new(host: HostDescriptor, vault: Arc<SecretVault>) -> Self {
        Self {
            host: host.normalized(),
            vault,
            auth: AuthChain::default_chain(),
            verifier: Arc::new(InsecureAcceptAll),
            caps: Arc::new(CapCache::from_config()),
            hooks: Hooks::default(),
            conn: Mutex::new(ConnSlot::default()),
            dial_gate: Mutex::new(()),
            dial_timeout: config::resolve_dial_timeout(None),
            cmd_timeout: config::resolve_cmd_timeout(None),
            keep_alive: config::resolve_keepalive(None),
        }
    }

    pub fn with_auth_chain(mut self, chain: AuthChain) -> Self {
        self.auth = chain;
        self
    }

    pub fn with_host_key_verifier(mut self, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Share a capability cache across clients.
    pub fn with_cap_cache(mut self, caps: Arc<CapCache>) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_cmd_timeout(mut self, timeout: Duration) -> Self {
        self.cmd_timeout = timeout;
        self
    }

    /// Keep-alive interval; zero disables pings and the watchdog.
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    pub fn host(&self) -> &HostDescriptor {
        &self.host
    }

    pub(crate) fn cap_cache(&self) -> &CapCache {
        &self.caps
    }

    pub(crate) fn cap_key(&self) -> String {
        self.host.addr.clone()
    }

    pub(crate) fn user_password(&self) -> String {
        self.vault.open_or_empty(&self.host.password)
    }

    pub(crate) fn root_password(&self) -> String {
        self.vault.open_or_empty(&self.host.root_pass)
    }

    /// Run a command through the host's privilege strategy.
    pub async fn exec(&self, cancel: &CancellationToken, cmd: Command) -> ExecResult {
        let timeout = cmd
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.cmd_timeout);
        let deadline = Instant::now() + timeout;

        let strategy = PrivilegeStrategy::for_host(&self.host);
        let mut res = strategy.exec(self, &cmd, deadline, cancel).await;
        res.strategy = strategy.name();

        if let Some(hook) = &self.hooks.on_result {
            hook(&self.host, &cmd, &res);
        }
        res
    }

    /// Run a command and deliver stdout/stderr line by line.
    ///
    /// Runs on the plain session, without privilege elevation. The result
    /// carries exit code and error only; output goes to the callbacks, and
    /// any backpressure in them is the caller's to bear.
    pub async fn exec_stream(
        &self,
        cancel: &CancellationToken,
        cmd: Command,
        mut on_stdout: impl FnMut(&str) + Send,
        mut on_stderr: impl FnMut(&str) + Send,
    ) -> ExecResult {
        let timeout = cmd
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.cmd_timeout);
        let deadline = Instant::now() + timeout;
        let start = Instant::now();

        let channel = match self.open_session().await {
            Ok(ch) => ch,
            Err(e) => return self.failure(e, start),
        };
        self.run_on_channel(
            channel,
            &cmd,
            deadline,
            cancel,
            start,
            OutputMode::stream(&mut on_stdout, &mut on_stderr),
        )
        .await
    }

    /// Close the cached connection, if any.
    pub async fn close(&self) {
        let mut slot = self.conn.lock().await;
        if let Some(handle) = slot.handle.take() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "closed", "")
                .await;
        }
    }

    /// Return the cached channel or dial, single-flight.
    pub async fn ensure_connected(
        &self,
    ) -> Result<Arc<client::Handle<ClientHandler>>, EngineError> {
        if let Some(handle) = self.cached_handle().await {
            return Ok(handle);
        }
        let _gate = self.dial_gate.lock().await;
        // Re-check: a queued caller finds the channel the dial winner cached.
        if let Some(handle) = self.cached_handle().await {
            return Ok(handle);
        }
        self.connect_fresh().await
    }

    async fn cached_handle(&self) -> Option<Arc<client::Handle<ClientHandler>>> {
        let mut slot = self.conn.lock().await;
        let alive = match &slot.handle {
            Some(handle) => {
                !handle.is_closed()
                    && !slot.dead.load(Ordering::SeqCst)
                    && slot.last_used.elapsed() < CONN_REUSE_WINDOW
            }
            None => false,
        };
        if !alive {
            return None;
        }
        slot.last_used = Instant::now();
        slot.handle.clone()
    }

    async fn connect_fresh(&self) -> Result<Arc<client::Handle<ClientHandler>>, EngineError> {
        let addr = self.host.endpoint();
        let mut last_err: Option<EngineError> = None;

        for auth in self.auth.iter() {
            let attempt = match auth.attempt(&self.host, &self.vault).await {
                Ok(Some(attempt)) => attempt,
                Ok(None) => continue,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };

            debug!(host = %addr, user = %attempt.user, auth = auth.name(), "dialing");
            match self.dial_and_authenticate(&addr, &attempt).await {
                Ok(handle) => {
                    let handle = self.store_connection(handle, &attempt.user).await;
                    if let Some(hook) = &self.hooks.on_connect {
                        hook(&self.host, &attempt.user, None);
                    }
                    return Ok(handle);
                }
                Err(DialFailure::TimedOut) => {
                    last_err = Some(EngineError::Dial(format!(
                        "{addr}: connect timed out after {:?}",
                        self.dial_timeout
                    )));
                    // A timeout now will be a timeout for the next attempt too.
                    break;
                }
                Err(DialFailure::Dial(msg)) => {
                    last_err = Some(EngineError::Dial(msg));
                }
                Err(DialFailure::Auth(msg)) => {
                    last_err = Some(EngineError::Auth(msg));
                }
            }
        }

        let err = last_err
            .unwrap_or_else(|| EngineError::Auth("no authenticators configured".into()));
        if let Some(hook) = &self.hooks.on_connect {
            hook(&self.host, "", Some(&err));
        }
        Err(err)
    }

    async fn dial_and_authenticate(
        &self,
        addr: &str,
        attempt: &crate::auth::AuthAttempt,
    ) -> Result<client::Handle<ClientHandler>, DialFailure> {
        let handler = ClientHandler {
            host: self.host.addr.clone(),
            verifier: self.verifier.clone(),
        };
        let connect = client::connect(
            build_client_config(self.keep_alive),
            (self.host.addr.as_str(), port_or_default(self.host.port)),
            handler,
        );
        let mut handle = match tokio::time::timeout(self.dial_timeout, connect).await {
            Err(_) => return Err(DialFailure::TimedOut),
            Ok(Err(e)) => return Err(DialFailure::Dial(format!("{addr}: {e}"))),
            Ok(Ok(handle)) => handle,
        };

        for method in &attempt.methods {
            let outcome = match method {
                AuthMethod::Password(password) => handle
                    .authenticate_password(&attempt.user, password)
                    .await
                    .map_err(|e| DialFailure::Dial(format!("{addr}: {e}")))?,
                AuthMethod::Key(key) => {
                    let hash = handle
                        .best_supported_rsa_hash()
                        .await
                        .ok()
                        .flatten()
                        .flatten();
                    handle
                        .authenticate_publickey(
                            &attempt.user,
                            PrivateKeyWithHashAlg::new(key.clone(), hash),
                        )
                        .await
                        .map_err(|e| DialFailure::Dial(format!("{addr}: {e}")))?
                }
            };
            if outcome.success() {
                return Ok(handle);
            }
        }
        Err(DialFailure::Auth(format!(
            "{addr}: credentials rejected for user {}",
            attempt.user
        )))
    }

    async fn store_connection(
        &self,
        handle: client::Handle<ClientHandler>,
        user: &str,
    ) -> Arc<client::Handle<ClientHandler>> {
        let handle = Arc::new(handle);
        let dead = Arc::new(AtomicBool::new(false));
        {
            let mut slot = self.conn.lock().await;
            if let Some(old) = slot.handle.take() {
                let _ = old.disconnect(Disconnect::ByApplication, "replaced", "").await;
            }
            slot.handle = Some(handle.clone());
            slot.user = user.to_string();
            slot.last_used = Instant::now();
            slot.dead = dead.clone();
        }
        self.spawn_watchdog(handle.clone(), dead);
        handle
    }

    /// Watch the transport and flag the cached channel once it dies.
    ///
    /// The protocol pings themselves are sent by the transport layer on the
    /// same interval; the watchdog only observes the aftermath.
    fn spawn_watchdog(&self, handle: Arc<client::Handle<ClientHandler>>, dead: Arc<AtomicBool>) {
        if self.keep_alive.is_zero() {
            return;
        }
        let interval = self.keep_alive;
        let host = self.host.addr.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                if handle.is_closed() {
                    warn!(host = %host, "ssh channel lost, marking dead");
                    dead.store(true, Ordering::SeqCst);
                    return;
                }
            }
        });
    }

    async fn mark_dead(&self) {
        let mut slot = self.conn.lock().await;
        slot.dead.store(true, Ordering::SeqCst);
        if let Some(handle) = slot.handle.take() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "dead", "")
                .await;
        }
    }

    /// Open a session channel, transparently reconnecting once if the
    /// cached channel refuses.
    async fn open_session(&self) -> Result<russh::Channel<client::Msg>, EngineError> {
        let handle = self.ensure_connected().await?;
        match handle.channel_open_session().await {
            Ok(channel) => Ok(channel),
            Err(e) => {
                warn!(host = %self.host.addr, error = %e, "session open failed, reconnecting once");
                self.mark_dead().await;
                let handle = self.ensure_connected().await?;
                handle
                    .channel_open_session()
                    .await
                    .map_err(|e| EngineError::Transport(format!("open session: {e}")))
            }
        }
    }

    /// Run a command on the plain session: no privilege wrapping, used by
    /// the strategies, the capability probes and the firewall transport.
    pub(crate) async fn raw_run(
        &self,
        cmd: &Command,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> ExecResult {
        let start = Instant::now();
        let channel = match self.open_session().await {
            Ok(ch) => ch,
            Err(e) => return self.failure(e, start),
        };
        self.run_on_channel(channel, cmd, deadline, cancel, start, OutputMode::capture())
            .await
    }

    async fn run_on_channel(
        &self,
        mut channel: russh::Channel<client::Msg>,
        cmd: &Command,
        deadline: Instant,
        cancel: &CancellationToken,
        start: Instant,
        mut output: OutputMode<'_>,
    ) -> ExecResult {
        let run_cmd = cmd.wrapped();

        if cmd.pty
            && let Err(e) = channel
                .request_pty(false, "xterm", 120, 32, 0, 0, &[(Pty::ECHO, 0)])
                .await
        {
            return self.failure(EngineError::Transport(format!("request pty: {e}")), start);
        }

        debug!(
            host = %self.host.addr,
            pty = cmd.pty,
            shell = cmd.shell,
            cmd = %short_for_log(&run_cmd),
            "run"
        );
        if let Err(e) = channel.exec(true, run_cmd.as_str()).await {
            return self.failure(EngineError::Transport(format!("exec: {e}")), start);
        }

        if cmd.pty {
            if !cmd.stdin.is_empty() {
                tokio::time::sleep(PTY_STDIN_DELAY).await;
                if let Err(e) = channel.data(cmd.stdin.as_bytes()).await {
                    return self.failure(EngineError::Transport(format!("write stdin: {e}")), start);
                }
                let _ = channel.eof().await;
            }
        } else {
            if !cmd.stdin.is_empty()
                && let Err(e) = channel.data(cmd.stdin.as_bytes()).await
            {
                return self.failure(EngineError::Transport(format!("write stdin: {e}")), start);
            }
            let _ = channel.eof().await;
        }

        let mut exit_code: Option<i32> = None;
        let mut err: Option<EngineError> = None;
        let mut interrupted: Option<EngineError> = None;
        let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    interrupted = Some(EngineError::Canceled);
                    break;
                }

                _ = &mut sleep => {
                    interrupted = Some(EngineError::Timeout);
                    break;
                }

                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => output.push_stdout(&data),
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        // ext == 1 is stderr in the SSH protocol
                        if ext == 1 {
                            output.push_stderr(&data);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status as i32);
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        err.get_or_insert(EngineError::Transport(format!(
                            "remote process terminated by signal {signal_name:?}"
                        )));
                    }
                    Some(ChannelMsg::Eof) => {
                        // Keep draining until the exit status arrives.
                        if exit_code.is_some() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        }

        if let Some(kind) = interrupted {
            let _ = channel.signal(Sig::KILL).await;
            err = Some(kind);
        }
        let _ = channel.close().await;
        let (stdout, stderr) = output.finish();

        let code = match (&err, exit_code) {
            (Some(_), _) => -1,
            (None, Some(code)) => code,
            (None, None) => {
                err = Some(EngineError::Transport(
                    "session closed without exit status".into(),
                ));
                -1
            }
        };
        if err.is_none() && code != 0 {
            err = Some(EngineError::Remote {
                code,
                stderr_tail: stderr_tail(&stderr),
            });
        }

        ExecResult {
            host_id: self.host.id,
            host: self.host.addr.clone(),
            stdout,
            stderr,
            code,
            error: err,
            duration: start.elapsed(),
            strategy: "",
        }
    }

    fn failure(&self, error: EngineError, start: Instant) -> ExecResult {
        ExecResult {
            host_id: self.host.id,
            host: self.host.addr.clone(),
            code: -1,
            error: Some(error),
            duration: start.elapsed(),
            ..Default::default()
        }
    }
}

fn build_client_config(keep_alive: Duration) -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: (!keep_alive.is_zero()).then_some(keep_alive),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Where command output goes: captured buffers, or per-line callbacks.
enum OutputMode<'a> {
    Capture {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    Stream {
        on_stdout: &'a mut (dyn FnMut(&str) + Send),
        on_stderr: &'a mut (dyn FnMut(&str) + Send),
        stdout_lines: LineBuffer,
        stderr_lines: LineBuffer,
    },
}

impl<'a> OutputMode<'a> {
    fn capture() -> Self {
        OutputMode::Capture {
            stdout: Vec::with_capacity(4096),
            stderr: Vec::with_capacity(1024),
        }
    }

    fn stream(
        on_stdout: &'a mut (dyn FnMut(&str) + Send),
        on_stderr: &'a mut (dyn FnMut(&str) + Send),
    ) -> Self {
        OutputMode::Stream {
            on_stdout,
            on_stderr,
            stdout_lines: LineBuffer::default(),
            stderr_lines: LineBuffer::default(),
        }
    }

    fn push_stdout(&mut self, data: &[u8]) {
        match self {
            OutputMode::Capture { stdout, .. } => stdout.extend_from_slice(data),
            OutputMode::Stream {
                on_stdout,
                stdout_lines,
                ..
            } => stdout_lines.push(data, &mut **on_stdout),
        }
    }

    fn push_stderr(&mut self, data: &[u8]) {
        match self {
            OutputMode::Capture { stderr, .. } => stderr.extend_from_slice(data),
            OutputMode::Stream {
                on_stderr,
                stderr_lines,
                ..
            } => stderr_lines.push(data, &mut **on_stderr),
        }
    }

    /// Flush pending lines and return captured output (empty for streams).
    fn finish(self) -> (String, String) {
        match self {
            OutputMode::Capture { stdout, stderr } => (
                String::from_utf8_lossy(&stdout).into_owned(),
                String::from_utf8_lossy(&stderr).into_owned(),
            ),
            OutputMode::Stream {
                on_stdout,
                on_stderr,
                mut stdout_lines,
                mut stderr_lines,
            } => {
                stdout_lines.flush(on_stdout);
                stderr_lines.flush(on_stderr);
                (String::new(), String::new())
            }
        }
    }
}

/// Accumulates bytes and emits complete lines, stripping `\r\n` and `\n`.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8], emit: &mut (dyn FnMut(&str) + Send)) {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop(); // the \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            emit(&String::from_utf8_lossy(&line));
        }
    }

    /// Emit a trailing partial line, if any.
    fn flush(&mut self, emit: &mut (dyn FnMut(&str) + Send)) {
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            emit(&String::from_utf8_lossy(&line));
        }
    }
}
