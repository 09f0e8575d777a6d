//! # Sandbox Orchestrator
//!
//! [`SandboxManager`] turns one [`ResolvedPolicy`] and a command vector into a
//! confined child process:
//!
//! 1. normalise the filesystem lists, add detected package-manager dirs and
//!    deny writes to sensitive files found inside writable dirs
//! 2. start the HTTP and SOCKS5 proxies when some destination is reachable
//! 3. generate the profile, write it to a temp file, validate it
//! 4. start the violation monitor and its sink (failure only disables auditing)
//! 5. run `sandbox-exec -f <profile> <command…>` with the proxy environment
//! 6. tear everything down, exactly once, whatever the outcome
//!
//! SIGINT and SIGTERM are watched from the start of a run until teardown. They
//! cancel the manager's token, so a signal during setup skips the child and a
//! signal while it runs kills it. Either way teardown runs as after a normal
//! exit.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FilesystemPolicy, ResolvedPolicy, SANDBOX_ID_ENV, default_violation_log};
use crate::filesystem::{BlockScanner, mandatory_deny_paths, normalise_paths};
use crate::network::{DomainFilter, ProxyHandle, start_http_proxy, start_socks_proxy};
use crate::package_managers::detect_package_managers;

use super::correlation::CorrelationId;
use super::error::{SandboxError, SandboxResult};
use super::monitor::{EventSource, LogStreamSource, ViolationMonitor};
use super::prerequisites::check_tool_present;
use super::seatbelt::{ProxyPorts, generate_profile};
use super::validate::{ProfileFile, ProfileValidator, SANDBOX_EXEC, check_static};
use super::violation_logger::ViolationLogger;
use super::violations::{SinkReport, ViolationSink};

/// Proxy variables, set on the child only while the proxies run.
const PROXY_VARIABLES: [&str; 3] = ["HTTP_PROXY", "HTTPS_PROXY", "ALL_PROXY"];

const SIGINT: i32 = 2;
const SIGTERM: i32 = 15;

/// Filesystem lists after normalisation, ready for the generator.
#[derive(Debug, Clone)]
pub struct PreparedPolicy {
    pub filesystem: FilesystemPolicy,
    pub package_manager_paths: usize,
    /// Entries appended to `deny_write` by the blocked-file scan.
    pub blocked_paths: usize,
}

/// How a confined run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// The status this process should exit with.
    pub exit_code: i32,
    /// Set when a signal (or cancellation) ended the run early.
    pub interrupted_by: Option<i32>,
    pub violations: SinkReport,
}

pub struct SandboxManager {
    policy: ResolvedPolicy,
    id: CorrelationId,
    cancel: CancellationToken,
    tool: PathBuf,
    validator: ProfileValidator,
    event_source: Option<Box<dyn EventSource>>,
    verbose: bool,
}

impl SandboxManager {
    pub fn new(policy: ResolvedPolicy) -> Self {
        let id = CorrelationId::generate();
        let event_source: Box<dyn EventSource> = Box::new(LogStreamSource::new(&id));
        Self {
            policy,
            id,
            cancel: CancellationToken::new(),
            tool: PathBuf::from(SANDBOX_EXEC),
            validator: ProfileValidator::new(),
            event_source: Some(event_source),
            verbose: false,
        }
    }

    /// Emit each violation to the debug stream as well as the durable log.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Launch the child through a different sandbox tool. The validator's
    /// dynamic check uses the same binary.
    pub fn with_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.tool = tool.into();
        self.validator = self.validator.with_tool(self.tool.clone());
        self
    }

    pub fn with_validator(mut self, validator: ProfileValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Replace the host log stream as the source of denial events.
    pub fn with_event_source(mut self, source: impl EventSource) -> Self {
        self.event_source = Some(Box::new(source));
        self
    }

    /// Run without a violation monitor.
    pub fn without_monitor(mut self) -> Self {
        self.event_source = None;
        self
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.id
    }

    pub fn policy(&self) -> &ResolvedPolicy {
        &self.policy
    }

    /// Cancelling this token ends a [`run`](Self::run) as if interrupted.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Normalise every filesystem list and fold in package-manager dirs.
    pub fn prepare(&self) -> SandboxResult<PreparedPolicy> {
        let mut filesystem = self.policy.filesystem.clone();

        let detected = if self.policy.detect_package_managers {
            detect_package_managers()
        } else {
            Vec::new()
        };
        if !detected.is_empty() {
            debug!(count = detected.len(), "adding package manager paths");
            filesystem.allow_write.extend(detected.iter().cloned());
            filesystem.allow_unlink.extend(detected.iter().cloned());
        }

        let allow_write = normalise_list(&filesystem.allow_write)?;
        let mut deny_write = normalise_list(&filesystem.deny_write)?;
        let blocked = self.scan_blocked(&allow_write);
        let blocked_paths = blocked.len();
        deny_write.extend(blocked);

        Ok(PreparedPolicy {
            filesystem: FilesystemPolicy {
                deny_read: normalise_list(&filesystem.deny_read)?,
                allow_write,
                deny_write,
                allow_unlink: normalise_list(&filesystem.allow_unlink)?,
            },
            package_manager_paths: detected.len(),
            blocked_paths,
        })
    }

    /// Sensitive files inside writable dirs. A failed scan blocks nothing.
    fn scan_blocked(&self, allow_write: &[String]) -> Vec<String> {
        let policy = &self.policy;
        if policy.scan_and_block_files.is_empty() && policy.scan_and_block_dirs.is_empty() {
            return Vec::new();
        }

        let scanner = match BlockScanner::new(
            &policy.scan_and_block_files,
            &policy.scan_and_block_dirs,
            &policy.ripgrep,
        ) {
            Ok(scanner) => scanner,
            Err(e) => {
                debug!(error = %e, "skipping blocked-file scan");
                return Vec::new();
            }
        };

        let blocked = mandatory_deny_paths(allow_write, &scanner);
        if !blocked.is_empty() {
            debug!(count = blocked.len(), "denying writes to sensitive files in writable paths");
        }
        blocked
    }

    /// Everything `run` would do up to launching the child, without the
    /// dynamic validation phase.
    pub async fn dry_run(&self, command: &[String]) -> SandboxResult<DryRunReport> {
        if command.is_empty() {
            return Err(SandboxError::NoCommand);
        }

        let prepared = self.prepare()?;
        let scratch = self.cancel.child_token();
        let proxies = self.start_proxies(&scratch).await?;
        let ports = proxy_ports(&proxies);
        for proxy in proxies {
            proxy.stop().await;
        }

        let profile = generate_profile(
            &prepared.filesystem,
            &self.policy.process,
            ports.unwrap_or_default(),
            ports.is_some(),
            Some(self.id.as_str()),
        )?;
        check_static(&profile)?;

        let network = &self.policy.network;
        Ok(DryRunReport {
            profile,
            command_line: format!("{} -f <profile-file> {}", self.tool.display(), command.join(" ")),
            environment: child_environment(&self.id, ports),
            deny_read: prepared.filesystem.deny_read.len(),
            allow_write: prepared.filesystem.allow_write.len(),
            deny_write: prepared.filesystem.deny_write.len(),
            allow_unlink: prepared.filesystem.allow_unlink.len(),
            package_manager_paths: prepared.package_manager_paths,
            blocked_paths: prepared.blocked_paths,
            default_policy: network.default_policy.to_string(),
            allowed_domains: network.allowed_domains.len(),
            denied_domains: network.denied_domains.len(),
            proxy_enabled: ports.is_some(),
        })
    }

    /// Run `command` under the generated profile and wait for it.
    ///
    /// Fatal errors (bad pattern, invalid profile, proxy bind failure) are
    /// returned before the child starts. Teardown always runs.
    pub async fn run(mut self, command: &[String]) -> SandboxResult<RunOutcome> {
        if command.is_empty() {
            return Err(SandboxError::NoCommand);
        }
        check_tool_present(&self.tool)?;

        let signals = SignalWatcher::install(self.cancel.clone());
        let mut session = Session::new(self.cancel.clone());
        let result = self.execute(command, &mut session, &signals).await;
        let violations = session.teardown().await;

        let exit = result?;
        info!(
            exit_code = exit.code,
            logged = violations.logged,
            ignored = violations.ignored,
            "sandboxed command finished"
        );
        Ok(RunOutcome {
            exit_code: exit.code,
            interrupted_by: exit.signal,
            violations,
        })
    }

    async fn execute(
        &mut self,
        command: &[String],
        session: &mut Session,
        signals: &SignalWatcher,
    ) -> SandboxResult<ChildExit> {
        let cancel = session.cancel.clone();
        let launched = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            child = self.launch(command, &mut *session) => Some(child?),
        };

        let Some(mut child) = launched else {
            let signal = signals.received().unwrap_or(SIGTERM);
            info!(signal, "interrupted before the sandboxed command started");
            return Ok(ChildExit::interrupted(signal));
        };
        wait_for_child(&mut child, &cancel, signals).await
    }

    /// Everything up to and including spawning the child.
    async fn launch(&mut self, command: &[String], session: &mut Session) -> SandboxResult<Child> {
        let prepared = self.prepare()?;

        session.proxies = self.start_proxies(&session.cancel).await?;
        let ports = proxy_ports(&session.proxies);

        let profile = generate_profile(
            &prepared.filesystem,
            &self.policy.process,
            ports.unwrap_or_default(),
            ports.is_some(),
            Some(self.id.as_str()),
        )?;
        let profile = session.profile.insert(ProfileFile::write(profile)?);
        debug!(path = %profile.path().display(), "wrote sandbox profile");
        self.validator.validate(profile).await?;
        debug!("sandbox profile validated");
        let profile_path = profile.path().to_path_buf();

        self.start_monitor(session);

        self.spawn_child(&profile_path, command, ports)
    }

    async fn start_proxies(&self, cancel: &CancellationToken) -> SandboxResult<Vec<ProxyHandle>> {
        let network = &self.policy.network;
        if !network.requires_proxy() {
            debug!("network fully blocked, no proxies started");
            return Ok(Vec::new());
        }

        let filter = Arc::new(DomainFilter::new(
            network.default_policy,
            &network.allowed_domains,
            &network.denied_domains,
        )?);

        let http = start_http_proxy(filter.clone(), network.http_proxy_port, cancel.child_token())
            .await?;
        let socks =
            match start_socks_proxy(filter, network.socks_proxy_port, cancel.child_token()).await {
                Ok(socks) => socks,
                Err(e) => {
                    http.stop().await;
                    return Err(e);
                }
            };

        debug!(http_port = http.port(), socks_port = socks.port(), "network proxies started");
        Ok(vec![http, socks])
    }

    fn start_monitor(&mut self, session: &mut Session) {
        let Some(source) = self.event_source.take() else {
            return;
        };

        let (monitor, rx) = match ViolationMonitor::start(
            source,
            Some(self.id.to_string()),
            session.cancel.child_token(),
        ) {
            Ok(started) => started,
            Err(e) => {
                warn!(error = %e, "continuing without violation auditing");
                return;
            }
        };

        let logger = self
            .policy
            .violation_log
            .clone()
            .or_else(default_violation_log)
            .and_then(|path| match ViolationLogger::open(&path) {
                Ok(logger) => Some(logger),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "violation log unavailable");
                    None
                }
            });

        let sink = ViolationSink::new(self.policy.ignore_violations.clone(), logger, self.verbose);
        session.sink = Some(sink.spawn(rx));
        session.monitor = Some(monitor);
    }

    fn spawn_child(
        &self,
        profile: &Path,
        command: &[String],
        ports: Option<ProxyPorts>,
    ) -> SandboxResult<Child> {
        match ports {
            Some(ports) => info!(
                command = %command.join(" "),
                http_proxy = ports.http,
                socks_proxy = ports.socks,
                "executing sandboxed command"
            ),
            None => info!(
                command = %command.join(" "),
                network = "fully blocked",
                "executing sandboxed command"
            ),
        }

        let mut cmd = Command::new(&self.tool);
        if ports.is_none() {
            for name in PROXY_VARIABLES {
                cmd.env_remove(name).env_remove(name.to_lowercase());
            }
        }
        cmd.arg("-f")
            .arg(profile)
            .args(command)
            .envs(child_environment(&self.id, ports))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SandboxError::ToolUnavailable(self.tool.clone()),
                _ => SandboxError::Io(e),
            })
    }
}

/// Resources owned by one run. `teardown` releases each of them once.
struct Session {
    cancel: CancellationToken,
    proxies: Vec<ProxyHandle>,
    monitor: Option<ViolationMonitor>,
    sink: Option<JoinHandle<SinkReport>>,
    profile: Option<ProfileFile>,
}

impl Session {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            proxies: Vec::new(),
            monitor: None,
            sink: None,
            profile: None,
        }
    }

    async fn teardown(&mut self) -> SinkReport {
        for proxy in self.proxies.drain(..) {
            proxy.stop().await;
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }

        let report = match self.sink.take() {
            Some(sink) => sink.await.unwrap_or_else(|e| {
                warn!(error = %e, "violation sink failed");
                SinkReport::default()
            }),
            None => SinkReport::default(),
        };

        if let Some(profile) = self.profile.take()
            && let Err(e) = profile.close()
        {
            warn!(error = %e, "failed to remove sandbox profile");
        }
        self.cancel.cancel();
        report
    }
}

fn normalise_list(paths: &[String]) -> SandboxResult<Vec<String>> {
    let mut normalised = Vec::with_capacity(paths.len());
    for path in paths {
        let mut entry = normalise_paths(std::slice::from_ref(path)).map_err(|source| {
            SandboxError::PathNormalisation {
                path: path.clone(),
                source,
            }
        })?;
        normalised.append(&mut entry);
    }
    Ok(normalised)
}

fn proxy_ports(proxies: &[ProxyHandle]) -> Option<ProxyPorts> {
    match proxies {
        [http, socks] => Some(ProxyPorts {
            http: http.port(),
            socks: socks.port(),
        }),
        _ => None,
    }
}

/// Variables set on the child. Proxy variables only appear when the proxies
/// are running; otherwise any inherited ones are removed.
pub fn child_environment(id: &CorrelationId, ports: Option<ProxyPorts>) -> Vec<(String, String)> {
    let mut env = vec![(SANDBOX_ID_ENV.to_string(), id.to_string())];
    if let Some(ports) = ports {
        let http = format!("http://localhost:{}", ports.http);
        let socks = format!("socks5://localhost:{}", ports.socks);
        for (name, value) in PROXY_VARIABLES.into_iter().zip([&http, &http, &socks]) {
            env.push((name.to_string(), value.clone()));
            env.push((name.to_lowercase(), value.clone()));
        }
    }
    env
}

#[derive(Debug, Clone, Copy)]
struct ChildExit {
    code: i32,
    signal: Option<i32>,
}

impl ChildExit {
    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self { code, signal: None };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self {
                    code: 128 + signal,
                    signal: None,
                };
            }
        }
        Self {
            code: 1,
            signal: None,
        }
    }

    fn interrupted(signal: i32) -> Self {
        Self {
            code: 128 + signal,
            signal: Some(signal),
        }
    }
}

/// Wait for the child, or kill it once the run is cancelled.
async fn wait_for_child(
    child: &mut Child,
    cancel: &CancellationToken,
    signals: &SignalWatcher,
) -> SandboxResult<ChildExit> {
    tokio::select! {
        status = child.wait() => return Ok(ChildExit::from_status(status?)),
        _ = cancel.cancelled() => {}
    }

    let signal = signals.received().unwrap_or(SIGTERM);
    info!(signal, "terminating sandboxed command");
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "child already exited");
    }
    if let Err(e) = child.wait().await {
        debug!(error = %e, "failed to reap child");
    }
    Ok(ChildExit::interrupted(signal))
}

/// Watches for SIGINT and SIGTERM for the lifetime of one run. The first one
/// received is recorded and cancels the run's token.
struct SignalWatcher {
    received: Arc<AtomicI32>,
    task: JoinHandle<()>,
}

impl SignalWatcher {
    fn install(cancel: CancellationToken) -> Self {
        let received = Arc::new(AtomicI32::new(0));
        let signals = match TerminationSignals::install() {
            Ok(signals) => Some(signals),
            Err(e) => {
                warn!(error = %e, "cannot install signal handlers");
                None
            }
        };

        let task = tokio::spawn({
            let received = received.clone();
            async move {
                let Some(mut signals) = signals else {
                    return;
                };
                tokio::select! {
                    signal = signals.recv() => {
                        received.store(signal, Ordering::SeqCst);
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            }
        });

        Self { received, task }
    }

    fn received(&self) -> Option<i32> {
        match self.received.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal),
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(unix)]
struct TerminationSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> i32 {
        tokio::select! {
            _ = self.interrupt.recv() => SIGINT,
            _ = self.terminate.recv() => SIGTERM,
        }
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> i32 {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot wait for ctrl-c");
            return std::future::pending().await;
        }
        SIGINT
    }
}

/// What a dry run found. `Display` renders the human-readable report.
#[derive(Debug, Clone)]
pub struct DryRunReport {
    pub profile: String,
    pub command_line: String,
    pub environment: Vec<(String, String)>,
    pub deny_read: usize,
    pub allow_write: usize,
    pub deny_write: usize,
    pub allow_unlink: usize,
    pub package_manager_paths: usize,
    pub blocked_paths: usize,
    pub default_policy: String,
    pub allowed_domains: usize,
    pub denied_domains: usize,
    pub proxy_enabled: bool,
}

impl fmt::Display for DryRunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Generated profile:\n")?;
        writeln!(f, "{}", self.profile)?;
        writeln!(f, "Would execute:\n  {}\n", self.command_line)?;

        writeln!(f, "Environment:")?;
        for (name, value) in &self.environment {
            writeln!(f, "  {name}={value}")?;
        }
        if !self.proxy_enabled {
            writeln!(f, "  (no proxy variables: network fully blocked)")?;
        }

        writeln!(f, "\nFilesystem:")?;
        writeln!(f, "  deny read: {} paths", self.deny_read)?;
        writeln!(f, "  allow write: {} paths", self.allow_write)?;
        writeln!(f, "  deny write: {} paths", self.deny_write)?;
        writeln!(f, "  allow unlink: {} paths", self.allow_unlink)?;
        if self.package_manager_paths > 0 {
            writeln!(f, "  package manager paths: {}", self.package_manager_paths)?;
        }
        if self.blocked_paths > 0 {
            writeln!(f, "  sensitive paths blocked: {}", self.blocked_paths)?;
        }

        writeln!(f, "\nNetwork:")?;
        writeln!(f, "  default policy: {}", self.default_policy)?;
        writeln!(f, "  allowed domains: {}", self.allowed_domains)?;
        writeln!(f, "  denied domains: {}", self.denied_domains)?;
        write!(f, "  proxy enabled: {}", self.proxy_enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_policy() -> ResolvedPolicy {
        ResolvedPolicy {
            detect_package_managers: false,
            ..ResolvedPolicy::default()
        }
    }

    #[test]
    fn environment_without_proxies_only_carries_the_id() {
        let id = CorrelationId::generate();
        let env = child_environment(&id, None);
        assert_eq!(env, vec![(SANDBOX_ID_ENV.to_string(), id.to_string())]);
    }

    #[test]
    fn environment_advertises_both_proxies() {
        let id = CorrelationId::generate();
        let env = child_environment(
            &id,
            Some(ProxyPorts {
                http: 18080,
                socks: 18081,
            }),
        );
        let get = |name: &str| {
            env.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .unwrap_or_else(|| panic!("{name} not set"))
        };
        assert_eq!(get("HTTP_PROXY"), "http://localhost:18080");
        assert_eq!(get("https_proxy"), "http://localhost:18080");
        assert_eq!(get("ALL_PROXY"), "socks5://localhost:18081");
        assert_eq!(get("all_proxy"), "socks5://localhost:18081");
    }

    #[test]
    fn prepare_resolves_literals_and_keeps_globs() {
        let manager = SandboxManager::new(quiet_policy());
        let prepared = manager.prepare().unwrap();
        let fs = prepared.filesystem;

        assert!(fs.deny_read.iter().all(|p| !p.starts_with('~')));
        assert!(fs.deny_write.contains(&"**/.env".to_string()));
        let cwd = std::fs::canonicalize(std::env::current_dir().unwrap()).unwrap();
        assert!(fs.allow_write.contains(&cwd.to_string_lossy().into_owned()));
        assert_eq!(prepared.package_manager_paths, 0);
    }

    #[test]
    fn sensitive_files_in_writable_dirs_are_write_denied() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        std::fs::write(root.join(".env"), "TOKEN=1").unwrap();
        std::fs::create_dir_all(root.join(".git/hooks")).unwrap();
        std::fs::write(root.join("notes.txt"), "").unwrap();

        let mut policy = quiet_policy();
        policy.filesystem.allow_write = vec![root.display().to_string()];
        policy.ripgrep.command = "/nonexistent/rg".into();
        let prepared = SandboxManager::new(policy).prepare().unwrap();

        let deny = &prepared.filesystem.deny_write;
        assert!(deny.contains(&root.join(".env").display().to_string()));
        assert!(deny.contains(&root.join(".git/hooks").display().to_string()));
        assert!(!deny.iter().any(|p| p.ends_with("notes.txt")));
        assert_eq!(prepared.blocked_paths, 2);

        let mut disabled = quiet_policy();
        disabled.filesystem.allow_write = vec![root.display().to_string()];
        disabled.scan_and_block_files.clear();
        disabled.scan_and_block_dirs.clear();
        assert_eq!(SandboxManager::new(disabled).prepare().unwrap().blocked_paths, 0);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let manager = SandboxManager::new(quiet_policy());
        assert!(matches!(
            manager.dry_run(&[]).await,
            Err(SandboxError::NoCommand)
        ));
        let manager = SandboxManager::new(quiet_policy()).without_monitor();
        assert!(matches!(
            manager.run(&[]).await,
            Err(SandboxError::NoCommand)
        ));
    }

    #[tokio::test]
    async fn dry_run_without_network_sets_no_proxy_variables() {
        let manager = SandboxManager::new(quiet_policy());
        let command = vec!["cat".to_string(), "/etc/hosts".to_string()];
        let report = manager.dry_run(&command).await.unwrap();

        assert!(!report.proxy_enabled);
        assert_eq!(report.environment.len(), 1);
        assert!(report.command_line.ends_with("-f <profile-file> cat /etc/hosts"));
        assert!(report.profile.contains(manager.correlation_id().as_str()));
        assert_eq!(report.deny_read, 3);
        assert_eq!(report.default_policy, "deny");

        let text = report.to_string();
        assert!(text.contains("Would execute:"));
        assert!(text.contains("network fully blocked"));
    }

    #[tokio::test]
    async fn dry_run_with_allowed_domains_reports_proxy_ports() {
        let mut policy = quiet_policy();
        policy.network.allowed_domains = vec!["github.com".into()];
        let manager = SandboxManager::new(policy);
        let report = manager.dry_run(&["true".to_string()]).await.unwrap();

        assert!(report.proxy_enabled);
        assert_eq!(report.allowed_domains, 1);
        let http = report
            .environment
            .iter()
            .find(|(k, _)| k == "HTTP_PROXY")
            .map(|(_, v)| v.clone())
            .unwrap();
        let port = http.rsplit(':').next().unwrap();
        assert!(report.profile.contains(&format!("localhost:{port}")));
    }

    #[tokio::test]
    async fn bad_pattern_is_fatal_in_dry_run() {
        let mut policy = quiet_policy();
        policy.filesystem.deny_write.push("/tmp/{a,b".into());
        let manager = SandboxManager::new(policy);
        let err = manager.dry_run(&["true".to_string()]).await.unwrap_err();
        assert!(matches!(err, SandboxError::ProfileGenerationFailed { .. }));
    }
}
