//! In-memory collaborators for unit tests.
//!
//! `FakeDevice` models just enough of a rooted phone: files, directories,
//! processes with appearance/exit times, append-only logs, links and open
//! ports. Time is tokio time, so tests run with a paused clock.
//!
//! `ScriptedDevice` implements only the required `Device` methods and
//! answers `exec` with canned stdout, so the shell-parsing defaults run as
//! they do against a real phone.

use crate::device::{Device, LaunchTicket, Signal};
use crate::identity::{ControlPlane, CredentialSource, IdentityManager, Peer};
use crate::lifecycle::LifecycleController;
use crate::options::SovereignOptions;
use crate::probe::Reachability;
use crate::service::{ServiceDescriptor, ServiceTable};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use sovereign_shared::errors::{SovereignError, SovereignResult};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct FakeProcess {
    pub pid: u32,
    pub cmdline: String,
    pub appear_at: Duration,
    pub exit_at: Option<Duration>,
    pub ignores_term: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeLink {
    pub up: bool,
    pub no_carrier: bool,
    pub master: Option<String>,
}

/// What a launch makes happen, relative to the launch time.
#[derive(Debug, Clone)]
pub struct LaunchScript {
    pub pid: u32,
    pub cmdline: String,
    pub process_after: Option<Duration>,
    pub exits_after: Option<Duration>,
    pub log_path: String,
    pub log: Vec<(Duration, String)>,
    pub tap: Option<String>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub connected: bool,
    pub files: BTreeSet<String>,
    pub dirs: BTreeSet<String>,
    pub sticky_dirs: BTreeSet<String>,
    pub processes: Vec<FakeProcess>,
    pub logs: HashMap<String, Vec<(Duration, String)>>,
    pub links: BTreeMap<String, FakeLink>,
    pub bridge_address: bool,
    pub ip_forward: bool,
    pub phantom_killer_disabled: bool,
    pub open_ports: HashSet<(String, u16)>,
    pub commands: Vec<String>,
    pub pushes: Vec<(PathBuf, String)>,
    pub launches: Vec<String>,
    pub log_reads: Vec<usize>,
    pub fail_on: Vec<String>,
    pub on_launch: Option<LaunchScript>,
}

pub struct FakeDevice {
    epoch: Instant,
    state: Mutex<FakeState>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            state: Mutex::new(FakeState {
                connected: true,
                ..Default::default()
            }),
        }
    }

    pub fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_file(&self, path: &str) {
        self.with_state(|s| s.files.insert(path.to_string()));
    }

    pub fn add_dir(&self, path: &str) {
        self.with_state(|s| s.dirs.insert(path.to_string()));
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.with_state(|s| s.files.contains(path))
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.with_state(|s| s.dirs.contains(path))
    }

    pub fn add_process(&self, pid: u32, cmdline: &str, appear_at: Duration, exit_at: Option<Duration>) {
        self.with_state(|s| {
            s.processes.push(FakeProcess {
                pid,
                cmdline: cmdline.to_string(),
                appear_at,
                exit_at,
                ignores_term: false,
            })
        });
    }

    /// A process that survives SIGTERM and only dies on SIGKILL.
    pub fn add_stubborn_process(&self, pid: u32, cmdline: &str) {
        self.with_state(|s| {
            s.processes.push(FakeProcess {
                pid,
                cmdline: cmdline.to_string(),
                appear_at: Duration::ZERO,
                exit_at: None,
                ignores_term: true,
            })
        });
    }

    pub fn log_line(&self, path: &str, at: Duration, line: &str) {
        self.with_state(|s| {
            s.logs
                .entry(path.to_string())
                .or_default()
                .push((at, line.to_string()))
        });
    }

    pub fn add_link(&self, name: &str, link: FakeLink) {
        self.with_state(|s| s.links.insert(name.to_string(), link));
    }

    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.with_state(|s| s.links.get(name).cloned())
    }

    pub fn open_port(&self, ip: &str, port: u16) {
        self.with_state(|s| s.open_ports.insert((ip.to_string(), port)));
    }

    pub fn fail_on(&self, fragment: &str) {
        self.with_state(|s| s.fail_on.push(fragment.to_string()));
    }

    pub fn on_launch(&self, script: LaunchScript) {
        self.with_state(|s| s.on_launch = Some(script));
    }

    pub fn commands(&self) -> Vec<String> {
        self.with_state(|s| s.commands.clone())
    }

    pub fn pushes(&self) -> Vec<(PathBuf, String)> {
        self.with_state(|s| s.pushes.clone())
    }

    pub fn launches(&self) -> Vec<String> {
        self.with_state(|s| s.launches.clone())
    }

    pub fn log_reads(&self) -> Vec<usize> {
        self.with_state(|s| s.log_reads.clone())
    }

    /// Pid of the running process matching `pattern`, checked like `grep`.
    pub fn running(&self, pattern: &str) -> Option<u32> {
        let now = self.now();
        let re = Regex::new(pattern).ok()?;
        self.with_state(|s| {
            s.processes
                .iter()
                .find(|p| alive(p, now) && re.is_match(&p.cmdline))
                .map(|p| p.pid)
        })
    }

    fn apply(&self, command: &str) -> SovereignResult<String> {
        let mut s = self.state.lock().unwrap();
        s.commands.push(command.to_string());
        if !s.connected {
            return Err(SovereignError::Device("no device connected".into()));
        }
        if s.fail_on.iter().any(|f| command.contains(f.as_str())) {
            return Err(SovereignError::Device(format!("injected failure: {}", command)));
        }

        let words: Vec<&str> = command.split_whitespace().collect();
        let out = match words.as_slice() {
            ["echo", "ok"] => "ok\n".to_string(),
            ["mkdir", "-p", path] => {
                s.dirs.insert(path.to_string());
                String::new()
            }
            ["rm", "-rf", path] => {
                if !s.sticky_dirs.contains(*path) {
                    let prefix = format!("{}/", path);
                    s.dirs.retain(|d| d != path && !d.starts_with(&prefix));
                    s.files.retain(|f| !f.starts_with(&prefix));
                }
                String::new()
            }
            ["rm", "-f", paths @ ..] => {
                for path in paths {
                    s.files.remove(*path);
                    s.logs.remove(*path);
                }
                String::new()
            }
            ["chmod", "+x", _] => String::new(),
            ["cp", from, to] => {
                if s.files.contains(*from) {
                    s.files.insert(to.to_string());
                }
                String::new()
            }
            ["ip", "link", "add", "name", name, "type", "bridge"] => {
                s.links.insert(name.to_string(), FakeLink::default());
                String::new()
            }
            ["ip", "addr", "add", _, "dev", _, ..] => {
                s.bridge_address = true;
                String::new()
            }
            ["ip", "addr", "show", name, ..] => match s.links.get(*name) {
                Some(_) if s.bridge_address => {
                    format!("4: {}: <UP>\n    inet 192.168.100.1/24 scope global\n", name)
                }
                Some(_) => format!("4: {}: <UP>\n", name),
                None => String::new(),
            },
            ["ip", "link", "set", name, "up"] => {
                if let Some(link) = s.links.get_mut(*name) {
                    link.up = true;
                }
                String::new()
            }
            ["ip", "link", "set", name, "master", bridge] => {
                if let Some(link) = s.links.get_mut(*name) {
                    link.master = Some(bridge.to_string());
                }
                String::new()
            }
            ["ip", "link", "del", name, ..] => {
                s.links.remove(*name);
                String::new()
            }
            ["echo", "1", ">", "/proc/sys/net/ipv4/ip_forward"] => {
                s.ip_forward = true;
                String::new()
            }
            ["cat", "/proc/sys/net/ipv4/ip_forward"] => {
                if s.ip_forward { "1\n" } else { "0\n" }.to_string()
            }
            ["device_config", "get", ..] => {
                if s.phantom_killer_disabled {
                    "2147483647\n".to_string()
                } else {
                    "32\n".to_string()
                }
            }
            ["device_config", "put", ..] => {
                s.phantom_killer_disabled = true;
                String::new()
            }
            _ => String::new(),
        };
        Ok(out)
    }
}

fn alive(p: &FakeProcess, now: Duration) -> bool {
    now >= p.appear_at && p.exit_at.is_none_or(|e| now < e)
}

fn render_link(name: &str, link: &FakeLink) -> String {
    let mut flags = Vec::new();
    if link.no_carrier {
        flags.push("NO-CARRIER");
    }
    flags.extend(["BROADCAST", "MULTICAST"]);
    if link.up {
        flags.push("UP");
        if !link.no_carrier {
            flags.push("LOWER_UP");
        }
    }
    let master = link
        .master
        .as_ref()
        .map(|m| format!("master {} ", m))
        .unwrap_or_default();
    format!(
        "7: {}: <{}> mtu 1500 qdisc pfifo_fast {}state {} mode DEFAULT\n    link/ether 02:00:00:00:00:07 brd ff:ff:ff:ff:ff:ff\n",
        name,
        flags.join(","),
        master,
        if link.up { "UP" } else { "DOWN" }
    )
}

#[async_trait]
impl Device for FakeDevice {
    async fn exec(&self, command: &str, _deadline: Duration) -> SovereignResult<String> {
        self.apply(command)
    }

    async fn push_file(&self, local: &Path, remote: &str) -> SovereignResult<()> {
        let mut s = self.state.lock().unwrap();
        if !s.connected {
            return Err(SovereignError::Device("no device connected".into()));
        }
        if s.fail_on.iter().any(|f| remote.contains(f.as_str())) {
            return Err(SovereignError::Device(format!("push failed: {}", remote)));
        }
        s.pushes.push((local.to_path_buf(), remote.to_string()));
        s.files.insert(remote.to_string());
        Ok(())
    }

    async fn launch_detached(&self, command: &str) -> SovereignResult<LaunchTicket> {
        let now = self.now();
        let mut s = self.state.lock().unwrap();
        s.launches.push(command.to_string());
        if let Some(script) = s.on_launch.take() {
            if let Some(after) = script.process_after {
                s.processes.push(FakeProcess {
                    pid: script.pid,
                    cmdline: script.cmdline.clone(),
                    appear_at: now + after,
                    exit_at: script.exits_after.map(|e| now + e),
                    ignores_term: false,
                });
            }
            let log = s.logs.entry(script.log_path.clone()).or_default();
            for (at, line) in &script.log {
                log.push((now + *at, line.clone()));
            }
            if let Some(tap) = script.tap {
                s.links.insert(
                    tap,
                    FakeLink {
                        up: true,
                        no_carrier: false,
                        master: Some("vm_bridge".to_string()),
                    },
                );
            }
        }
        Ok(LaunchTicket {
            command: command.to_string(),
            launcher_pid: None,
        })
    }

    async fn is_connected(&self) -> bool {
        self.with_state(|s| s.connected)
    }

    async fn file_exists(&self, path: &str) -> SovereignResult<bool> {
        self.apply(&format!("[ -f {} ]", path))?;
        Ok(self.has_file(path))
    }

    async fn dir_exists(&self, path: &str) -> SovereignResult<bool> {
        self.apply(&format!("[ -d {} ]", path))?;
        Ok(self.has_dir(path))
    }

    async fn find_process(&self, pattern: &str) -> SovereignResult<Option<u32>> {
        self.apply(&crate::device::find_pid_command(pattern))?;
        Ok(self.running(pattern))
    }

    async fn process_details(&self, pid: u32) -> Option<String> {
        let now = self.now();
        self.with_state(|s| {
            s.processes
                .iter()
                .find(|p| p.pid == pid && alive(p, now))
                .map(|p| format!("{} 00:42 51200 {}", p.pid, p.cmdline))
        })
    }

    async fn signal(&self, pid: u32, signal: Signal) {
        let now = self.now();
        let _ = self.apply(&format!("kill {} {}", signal.as_arg(), pid));
        self.with_state(|s| {
            for p in s.processes.iter_mut().filter(|p| p.pid == pid && alive(p, now)) {
                if signal == Signal::Kill || !p.ignores_term {
                    p.exit_at = Some(now);
                }
            }
        });
    }

    async fn kill_matching(&self, pattern: &str) {
        let now = self.now();
        let _ = self.apply(&format!("pkill -f '{}'", pattern));
        let Ok(re) = Regex::new(pattern) else { return };
        self.with_state(|s| {
            for p in s
                .processes
                .iter_mut()
                .filter(|p| alive(p, now) && re.is_match(&p.cmdline))
            {
                p.exit_at = Some(now);
            }
        });
    }

    async fn read_lines_from(&self, path: &str, offset: usize) -> SovereignResult<Vec<String>> {
        let now = self.now();
        self.apply(&format!("tail -n +{} {}", offset + 1, path))?;
        Ok(self.with_state(|s| {
            s.log_reads.push(offset);
            s.logs
                .get(path)
                .map(|lines| {
                    lines
                        .iter()
                        .filter(|(at, _)| *at <= now)
                        .skip(offset)
                        .map(|(_, l)| l.clone())
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    async fn tail(&self, path: &str, lines: usize) -> SovereignResult<Vec<String>> {
        let all = self.read_lines_from(path, 0).await?;
        Ok(all[all.len().saturating_sub(lines)..].to_vec())
    }

    async fn grep_tail(&self, path: &str, pattern: &str, lines: usize) -> SovereignResult<Vec<String>> {
        let re = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| SovereignError::Internal(e.to_string()))?;
        let hits: Vec<String> = self
            .read_lines_from(path, 0)
            .await?
            .into_iter()
            .filter(|l| re.is_match(l))
            .collect();
        Ok(hits[hits.len().saturating_sub(lines)..].to_vec())
    }

    async fn link_show(&self, iface: &str) -> SovereignResult<Option<String>> {
        self.apply(&format!("ip link show {}", iface))?;
        Ok(self.with_state(|s| s.links.get(iface).map(|l| render_link(iface, l))))
    }

    async fn bridge_members(&self, bridge: &str) -> SovereignResult<Vec<String>> {
        self.apply(&format!("ip link show master {}", bridge))?;
        Ok(self.with_state(|s| {
            s.links
                .iter()
                .filter(|(_, l)| l.master.as_deref() == Some(bridge))
                .map(|(n, _)| n.clone())
                .collect()
        }))
    }

    async fn port_open(&self, ip: &str, port: u16) -> bool {
        self.with_state(|s| s.open_ports.contains(&(ip.to_string(), port)))
    }
}

/// Replies to commands containing `fragment`, consumed in order.
struct Reply {
    fragment: String,
    outputs: VecDeque<String>,
}

/// Device whose `exec` returns canned stdout keyed by command fragment.
///
/// Unmatched commands print nothing. When several replies are queued for one
/// fragment they are returned in order and the last one repeats.
#[derive(Default)]
pub struct ScriptedDevice {
    replies: Mutex<Vec<Reply>>,
    failing: Mutex<Vec<String>>,
    calls: Mutex<Vec<(String, Duration)>>,
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, fragment: &str, stdout: &str) {
        let mut replies = self.replies.lock().unwrap();
        match replies.iter_mut().find(|r| r.fragment == fragment) {
            Some(reply) => reply.outputs.push_back(stdout.to_string()),
            None => replies.push(Reply {
                fragment: fragment.to_string(),
                outputs: VecDeque::from([stdout.to_string()]),
            }),
        }
    }

    /// Make commands containing `fragment` time out.
    pub fn fail(&self, fragment: &str) {
        self.failing.lock().unwrap().push(fragment.to_string());
    }

    /// Every command run, with the deadline it was given.
    pub fn calls(&self) -> Vec<(String, Duration)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|(c, _)| c).collect()
    }
}

#[async_trait]
impl Device for ScriptedDevice {
    async fn exec(&self, command: &str, deadline: Duration) -> SovereignResult<String> {
        self.calls
            .lock()
            .unwrap()
            .push((command.to_string(), deadline));
        if self
            .failing
            .lock()
            .unwrap()
            .iter()
            .any(|f| command.contains(f.as_str()))
        {
            return Err(SovereignError::CommandTimeout {
                command: command.to_string(),
                timeout_secs: deadline.as_secs(),
            });
        }

        let mut replies = self.replies.lock().unwrap();
        let Some(reply) = replies
            .iter_mut()
            .find(|r| command.contains(r.fragment.as_str()))
        else {
            return Ok(String::new());
        };
        let out = if reply.outputs.len() > 1 {
            reply.outputs.pop_front()
        } else {
            reply.outputs.front().cloned()
        };
        Ok(out.unwrap_or_default())
    }

    async fn push_file(&self, _local: &Path, _remote: &str) -> SovereignResult<()> {
        Ok(())
    }

    async fn launch_detached(&self, command: &str) -> SovereignResult<LaunchTicket> {
        Ok(LaunchTicket {
            command: command.to_string(),
            launcher_pid: None,
        })
    }
}

/// Control plane holding peers in memory.
#[derive(Default)]
pub struct FakeControlPlane {
    peers: Mutex<Vec<Peer>>,
    deleted: Mutex<Vec<String>>,
    last_key: Mutex<Option<String>>,
    unavailable: bool,
    fail_deletes: AtomicBool,
}

impl FakeControlPlane {
    pub fn with_peers(peers: Vec<Peer>) -> Self {
        Self {
            peers: Mutex::new(peers),
            ..Default::default()
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Default::default()
        }
    }

    pub fn add_peer(&self, peer: Peer) {
        self.peers.lock().unwrap().push(peer);
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn last_api_key(&self) -> Option<String> {
        self.last_key.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn peers(&self) -> SovereignResult<Vec<Peer>> {
        if self.unavailable {
            return Err(SovereignError::Identity("tailscale not available".into()));
        }
        Ok(self.peers.lock().unwrap().clone())
    }

    async fn delete_peer(&self, peer: &Peer, api_key: &str) -> SovereignResult<()> {
        *self.last_key.lock().unwrap() = Some(api_key.to_string());
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(SovereignError::Identity(format!(
                "delete {}: HTTP 403",
                peer.host_name
            )));
        }
        self.peers.lock().unwrap().retain(|p| p.id != peer.id);
        self.deleted.lock().unwrap().push(peer.id.clone());
        Ok(())
    }
}

pub fn peer(id: &str, host: &str, ip: &str, online: bool) -> Peer {
    Peer {
        id: id.to_string(),
        host_name: host.to_string(),
        dns_name: format!("{}.tail1234.ts.net", host),
        addresses: vec![ip.to_string()],
        online,
    }
}

/// Reachability answering from fixed tables and recording TCP probes.
#[derive(Default)]
pub struct FakeReachability {
    open: HashSet<(String, u16)>,
    https: HashMap<String, u16>,
    calls: Mutex<Vec<(String, u16)>>,
}

impl FakeReachability {
    pub fn with_open(mut self, host: &str, port: u16) -> Self {
        self.open.insert((host.to_string(), port));
        self
    }

    pub fn with_https(mut self, url: &str, status: u16) -> Self {
        self.https.insert(url.to_string(), status);
        self
    }

    pub fn tcp_calls(&self) -> Vec<(String, u16)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reachability for FakeReachability {
    async fn tcp(&self, host: &str, port: u16, _timeout: Duration) -> bool {
        self.calls.lock().unwrap().push((host.to_string(), port));
        self.open.contains(&(host.to_string(), port))
    }

    async fn https(&self, url: &str, _timeout: Duration) -> Option<u16> {
        self.https.get(url).copied()
    }
}

/// Env var the rig's key file defines; never set in the process environment.
const RIG_KEY_VAR: &str = "SOVEREIGN_TEST_RIG_API_KEY";

/// A controller wired to fakes, with a temporary project directory.
pub struct TestRig {
    pub device: Arc<FakeDevice>,
    pub plane: Arc<FakeControlPlane>,
    pub probe: Arc<FakeReachability>,
    pub controller: LifecycleController,
    pub table: ServiceTable,
    dir: tempfile::TempDir,
}

impl TestRig {
    pub fn new() -> Self {
        Self::build(FakeReachability::default(), false)
    }

    /// A rig whose identity manager can find a management API key.
    pub fn with_api_key() -> Self {
        Self::build(FakeReachability::default(), true)
    }

    pub fn with_probe(probe: FakeReachability) -> Self {
        Self::build(probe, false)
    }

    fn build(probe: FakeReachability, api_key: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut options = SovereignOptions {
            project_dir: dir.path().to_path_buf(),
            state_dir: dir.path().join("state"),
            ..Default::default()
        };
        options.timing.launch_settle_ms = 1_000;

        let key_files = if api_key {
            let file = dir.path().join("tskey.env");
            std::fs::write(&file, format!("{}=tskey-api-rig\n", RIG_KEY_VAR)).unwrap();
            vec![file]
        } else {
            Vec::new()
        };

        let device = Arc::new(FakeDevice::new());
        let plane = Arc::new(FakeControlPlane::default());
        let probe = Arc::new(probe);
        let identity = Arc::new(IdentityManager::new(
            plane.clone(),
            CredentialSource::new(RIG_KEY_VAR, key_files),
            options.identity.manual_url.clone(),
        ));
        let table = ServiceTable::builtin(&options).unwrap();
        let controller = LifecycleController::new(device.clone(), identity, probe.clone(), options);

        Self {
            device,
            plane,
            probe,
            controller,
            table,
            dir,
        }
    }

    pub fn service(&self, name: &str) -> ServiceDescriptor {
        self.table.get(name).unwrap().clone()
    }

    pub fn project_path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Write every local file a deploy of `service` reads.
    pub fn write_artifacts(&self, service: &ServiceDescriptor) {
        let base = self.dir.path().join(service.local_path());
        std::fs::create_dir_all(&base).unwrap();
        for file in ["rootfs.img", "data.img", "start.sh"] {
            std::fs::write(base.join(file), file).unwrap();
        }
        let kernel = self.dir.path().join(service.local_kernel());
        std::fs::create_dir_all(kernel.parent().unwrap()).unwrap();
        std::fs::write(kernel, "kernel").unwrap();

        std::fs::write(self.project_path(".env"), "POSTGRES_PASSWORD=x\n").unwrap();
        let watchdog = self.project_path("host/sovereign_start.sh");
        std::fs::create_dir_all(watchdog.parent().unwrap()).unwrap();
        std::fs::write(watchdog, "#!/system/bin/sh\n").unwrap();
    }

    /// Mark `service` as deployed on the fake device.
    pub fn deployed(&self, service: &ServiceDescriptor) {
        self.device.add_dir(service.device_path());
        self.device.add_file(&service.start_script());
        self.device.add_file(&format!("{}/data.img", service.device_path()));
    }
}
