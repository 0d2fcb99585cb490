//! In-memory Linux host for tests
//!
//! [`MockHost`] implements [`SessionFactory`] on top of an in-memory
//! filesystem and a small shell interpreter. The interpreter understands the
//! shell the engine emits (`&&`, `||`, `;`, `&`, `if ...; then ...; fi`,
//! `>`/`>>`/`2>`/`2>&1`, quoting, `$?`) and a handful of builtins: `true`,
//! `false`, `echo`, `cat`, `mkdir`, `rm`, `touch`, `chmod`, `chown`, `mv`,
//! `cp`, `test`/`[`, `bash`/`sh`, `cd`, `tar -xzf`, `export`, `sleep`,
//! `exit`, and reboot/poweroff commands. Anything else can be registered with
//! [`MockHost::on_command`]. Background jobs run synchronously.
//!
//! Fault injection covers the failure modes the engine must survive: sessions
//! dropped before or after an operation reaches the host, refused
//! connections, rejected credentials, and reboots that either clear the
//! volatile filesystem or only bounce the SSH daemon.
//!
//! # Example
//!
//! ```rust
//! use hive_proxy::transport::mock::MockHost;
//!
//! let host = MockHost::new();
//! host.add_file("/etc/hostname", b"worker-0\n");
//! assert!(host.exists("/etc/hostname"));
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use flate2::read::GzDecoder;
use secrecy::ExposeSecret;

use super::{
    CommandSession, ConnectParams, ExecOutput, FileSession, SessionFactory, TransportError,
    TransportResult,
};
use crate::credentials::SshAuth;

/// Root of the volatile filesystem on the mock host
pub const TMPFS: &str = "/dev/shm";

/// Output of a registered command handler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl MockOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn fail(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Filesystem access for command handlers
pub struct MockContext<'a> {
    state: &'a mut HostState,
    cwd: String,
    home: String,
}

impl MockContext<'_> {
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    fn full(&self, path: &str) -> String {
        resolve(&self.cwd, &self.home, path)
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.state.files.get(&self.full(path)).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.exists(&self.full(path))
    }

    /// Create or replace a file; the parent folder must exist
    pub fn write(&mut self, path: &str, data: &[u8]) -> bool {
        let full = self.full(path);
        self.state.write_file(&full, data.to_vec(), None).is_ok()
    }

    /// Append to a file, creating it if needed
    pub fn append(&mut self, path: &str, data: &[u8]) -> bool {
        let full = self.full(path);
        let mut current = self.state.files.get(&full).cloned().unwrap_or_default();
        current.extend_from_slice(data);
        self.state.write_file(&full, current, None).is_ok()
    }
}

type Handler = Arc<dyn Fn(&mut MockContext<'_>, &[String]) -> MockOutput + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropPoint {
    Before,
    After,
}

#[derive(Debug)]
struct DropRule {
    pattern: String,
    point: DropPoint,
}

struct HostState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    modes: HashMap<String, u32>,
    owners: HashMap<String, String>,
    handlers: HashMap<String, Handler>,
    activity: Vec<String>,
    epoch: u64,
    drops: Vec<DropRule>,
    refuse: u32,
    offline: u32,
    password: Option<String>,
    reboots: u32,
    fake_reboots: u32,
    reboot_downtime: u32,
    powered_off: bool,
    handshake_delay: Duration,
    disconnect_delay: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    connects: AtomicUsize,
}

/// In-memory remote host
#[derive(Clone)]
pub struct MockHost {
    state: Arc<Mutex<HostState>>,
    counters: Arc<Counters>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockHost")
            .field("files", &state.files.len())
            .field("dirs", &state.dirs.len())
            .field("epoch", &state.epoch)
            .field("reboots", &state.reboots)
            .finish()
    }
}

impl MockHost {
    /// Create a host with a minimal Linux tree and the default engine layout
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        for dir in [
            "/",
            "/etc",
            "/home",
            "/root",
            "/tmp",
            "/dev",
            TMPFS,
            "/var",
            "/var/lib",
            "/var/lib/hive",
            "/var/lib/hive/exec",
            "/var/lib/hive/state",
        ] {
            dirs.insert(dir.to_string());
        }

        let state = HostState {
            files: BTreeMap::new(),
            dirs,
            modes: HashMap::new(),
            owners: HashMap::new(),
            handlers: HashMap::new(),
            activity: Vec::new(),
            epoch: 0,
            drops: Vec::new(),
            refuse: 0,
            offline: 0,
            password: None,
            reboots: 0,
            fake_reboots: 0,
            reboot_downtime: 1,
            powered_off: false,
            handshake_delay: Duration::ZERO,
            disconnect_delay: Duration::ZERO,
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            counters: Arc::new(Counters::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a file, creating parent folders
    pub fn add_file(&self, path: &str, data: &[u8]) {
        let mut state = self.lock();
        let path = normalize(path);
        state.mkdir_all(&parent(&path));
        state.files.insert(path, data.to_vec());
    }

    /// Add a folder and its parents
    pub fn add_dir(&self, path: &str) {
        self.lock().mkdir_all(&normalize(path));
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(&normalize(path)).cloned()
    }

    pub fn read_text(&self, path: &str) -> Option<String> {
        self.read_file(path)
            .map(|data| String::from_utf8_lossy(&data).into_owned())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().exists(&normalize(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(&normalize(path))
    }

    /// Permission bits last applied to `path`
    pub fn mode(&self, path: &str) -> Option<u32> {
        self.lock().modes.get(&normalize(path)).copied()
    }

    /// Owner last applied to `path` with `chown`
    pub fn owner(&self, path: &str) -> Option<String> {
        self.lock().owners.get(&normalize(path)).cloned()
    }

    /// Every file and folder strictly below `prefix`
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let state = self.lock();
        let prefix = format!("{}/", normalize(prefix).trim_end_matches('/'));
        state
            .dirs
            .iter()
            .chain(state.files.keys())
            .filter(|path| path.starts_with(&prefix))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Register a handler for a command name. Handlers must not call back into
    /// the host; they get filesystem access through the context instead.
    pub fn on_command<F>(&self, name: &str, handler: F)
    where
        F: Fn(&mut MockContext<'_>, &[String]) -> MockOutput + Send + Sync + 'static,
    {
        self.lock()
            .handlers
            .insert(name.to_string(), Arc::new(handler));
    }

    /// Every operation that reached the host: `exec: ...`, `upload: ...`,
    /// `download: ...`, `exists: ...`
    pub fn activity(&self) -> Vec<String> {
        self.lock().activity.clone()
    }

    /// Commands that reached the host, in order
    pub fn exec_log(&self) -> Vec<String> {
        self.lock()
            .activity
            .iter()
            .filter_map(|entry| entry.strip_prefix("exec: "))
            .map(str::to_string)
            .collect()
    }

    pub fn exec_count(&self) -> usize {
        self.exec_log().len()
    }

    /// Drop every session when an operation matching `pattern` arrives,
    /// before it has any effect
    pub fn drop_before(&self, pattern: &str) {
        self.lock().drops.push(DropRule {
            pattern: pattern.to_string(),
            point: DropPoint::Before,
        });
    }

    /// Drop every session right after an operation matching `pattern` has
    /// taken effect, so the caller never sees its result
    pub fn drop_after(&self, pattern: &str) {
        self.lock().drops.push(DropRule {
            pattern: pattern.to_string(),
            point: DropPoint::After,
        });
    }

    /// Kill every open session now
    pub fn sever(&self) {
        self.lock().epoch += 1;
    }

    /// Make every session close block for `delay`, like a peer that never
    /// answers the disconnect message
    pub fn hang_on_disconnect(&self, delay: Duration) {
        self.lock().disconnect_delay = delay;
    }

    fn disconnect_delay(&self) -> Duration {
        self.lock().disconnect_delay
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_connections(&self, count: u32) {
        self.lock().refuse = count;
    }

    /// Only accept password authentication with `password`
    pub fn set_password(&self, password: Option<&str>) {
        self.lock().password = password.map(str::to_string);
    }

    /// The first `count` reboots only bounce the SSH daemon and leave the
    /// volatile filesystem intact
    pub fn fake_reboots(&self, count: u32) {
        self.lock().fake_reboots = count;
    }

    /// Connection attempts refused after each reboot
    pub fn set_reboot_downtime(&self, attempts: u32) {
        self.lock().reboot_downtime = attempts;
    }

    pub fn reboot_count(&self) -> u32 {
        self.lock().reboots
    }

    pub fn is_powered_off(&self) -> bool {
        self.lock().powered_off
    }

    /// Time each handshake takes; widens the window for racing connections
    pub fn set_handshake_delay(&self, delay: Duration) {
        self.lock().handshake_delay = delay;
    }

    /// Highest number of handshakes ever in flight at once
    pub fn peak_concurrent_handshakes(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Connection attempts that reached the host
    pub fn connection_count(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    fn handshake(&self, params: &ConnectParams) -> TransportResult<(u64, String)> {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.lock().handshake_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.counters.connects.fetch_add(1, Ordering::SeqCst);

        let mut state = self.lock();
        let endpoint = params.endpoint();

        if state.powered_off {
            return Err(TransportError::connection(endpoint, "host is powered off"));
        }
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(TransportError::connection(endpoint, "connection refused"));
        }
        if state.offline > 0 {
            state.offline -= 1;
            return Err(TransportError::connection(endpoint, "host is restarting"));
        }
        if let Some(expected) = &state.password {
            let accepted = matches!(
                &params.auth,
                SshAuth::Password(secret) if secret.expose_secret() == expected.as_str()
            );
            if !accepted {
                return Err(TransportError::Authentication {
                    username: params.username.clone(),
                    message: "permission denied".to_string(),
                });
            }
        }

        let home = home_of(&params.username);
        state.mkdir_all(&home);
        Ok((state.epoch, home))
    }

    fn operate<T>(
        &self,
        epoch: u64,
        connected: bool,
        descriptor: String,
        op: impl FnOnce(&mut HostState) -> TransportResult<T>,
    ) -> TransportResult<T> {
        let mut state = self.lock();
        if !connected || state.epoch != epoch {
            return Err(TransportError::connection("mock", "session is not connected"));
        }

        let point = state.take_drop(&descriptor);
        if point == Some(DropPoint::Before) {
            state.epoch += 1;
            return Err(TransportError::connection("mock", "connection reset by peer"));
        }

        state.activity.push(descriptor);
        let result = op(&mut state);

        if point == Some(DropPoint::After) {
            state.epoch += 1;
        }
        if state.epoch != epoch {
            return Err(TransportError::connection("mock", "connection lost"));
        }
        result
    }
}

impl SessionFactory for MockHost {
    fn open_command(&self, params: &ConnectParams) -> TransportResult<Box<dyn CommandSession>> {
        let (epoch, home) = self.handshake(params)?;
        Ok(Box::new(MockCommandSession {
            host: self.clone(),
            epoch,
            home,
            connected: true,
        }))
    }

    fn open_file(&self, params: &ConnectParams) -> TransportResult<Box<dyn FileSession>> {
        let (epoch, home) = self.handshake(params)?;
        Ok(Box::new(MockFileSession {
            host: self.clone(),
            epoch,
            home,
            connected: true,
        }))
    }
}

struct MockCommandSession {
    host: MockHost,
    epoch: u64,
    home: String,
    connected: bool,
}

impl CommandSession for MockCommandSession {
    fn is_connected(&self) -> bool {
        self.connected && self.host.lock().epoch == self.epoch
    }

    fn exec(&mut self, command: &str) -> TransportResult<ExecOutput> {
        let home = self.home.clone();
        self.host.operate(
            self.epoch,
            self.connected,
            format!("exec: {}", command),
            |state| {
                let mut shell = Shell::new(state, home);
                let out = shell.run_line(command);
                Ok(ExecOutput {
                    exit_code: out.status,
                    stdout: out.stdout,
                    stderr: out.stderr,
                })
            },
        )
    }

    fn disconnect(&mut self) {
        thread::sleep(self.host.disconnect_delay());
        self.connected = false;
    }
}

struct MockFileSession {
    host: MockHost,
    epoch: u64,
    home: String,
    connected: bool,
}

impl MockFileSession {
    fn full(&self, path: &str) -> String {
        resolve(&self.home, &self.home, path)
    }
}

impl FileSession for MockFileSession {
    fn is_connected(&self) -> bool {
        self.connected && self.host.lock().epoch == self.epoch
    }

    fn upload(&mut self, path: &str, data: &[u8], mode: Option<i32>) -> TransportResult<()> {
        let full = self.full(path);
        self.host.operate(
            self.epoch,
            self.connected,
            format!("upload: {}", full),
            |state| {
                state
                    .write_file(&full, data.to_vec(), mode.map(|m| m as u32))
                    .map_err(|_| TransportError::NotFound { path: full.clone() })
            },
        )
    }

    fn download(&mut self, path: &str) -> TransportResult<Vec<u8>> {
        let full = self.full(path);
        self.host.operate(
            self.epoch,
            self.connected,
            format!("download: {}", full),
            |state| match state.files.get(&full) {
                Some(data) => Ok(data.clone()),
                None if state.dirs.contains(&full) => {
                    Err(TransportError::Remote(format!("{} is a directory", full)))
                }
                None => Err(TransportError::NotFound { path: full.clone() }),
            },
        )
    }

    fn exists(&mut self, path: &str) -> TransportResult<bool> {
        let full = self.full(path);
        self.host.operate(
            self.epoch,
            self.connected,
            format!("exists: {}", full),
            |state| Ok(state.exists(&full)),
        )
    }

    fn disconnect(&mut self) {
        thread::sleep(self.host.disconnect_delay());
        self.connected = false;
    }
}

impl HostState {
    fn take_drop(&mut self, descriptor: &str) -> Option<DropPoint> {
        let index = self
            .drops
            .iter()
            .position(|rule| descriptor.contains(&rule.pattern))?;
        Some(self.drops.remove(index).point)
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.dirs.contains(path)
    }

    fn mkdir_all(&mut self, path: &str) {
        let mut current = String::new();
        self.dirs.insert("/".to_string());
        for part in path.split('/').filter(|part| !part.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }

    fn write_file(&mut self, path: &str, data: Vec<u8>, mode: Option<u32>) -> Result<(), String> {
        if self.dirs.contains(path) {
            return Err(format!("{}: Is a directory", path));
        }
        if !self.dirs.contains(&parent(path)) {
            return Err(format!("{}: No such file or directory", path));
        }
        self.files.insert(path.to_string(), data);
        if let Some(mode) = mode {
            self.modes.insert(path.to_string(), mode);
        }
        Ok(())
    }

    fn remove_tree(&mut self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files
            .retain(|file, _| file != path && !file.starts_with(&prefix));
        self.dirs
            .retain(|dir| dir != path && !dir.starts_with(&prefix));
        self.modes
            .retain(|entry, _| entry != path && !entry.starts_with(&prefix));
    }

    /// Empty a folder but keep the folder itself
    fn clear_tree(&mut self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files.retain(|file, _| !file.starts_with(&prefix));
        self.dirs.retain(|dir| !dir.starts_with(&prefix));
    }

    fn rename_tree(&mut self, src: &str, dst: &str) {
        let prefix = format!("{}/", src.trim_end_matches('/'));
        let rebase = |path: &str| format!("{}{}", dst, &path[src.len()..]);

        let files: Vec<_> = self
            .files
            .keys()
            .filter(|file| *file == src || file.starts_with(&prefix))
            .cloned()
            .collect();
        for file in files {
            if let Some(data) = self.files.remove(&file) {
                self.files.insert(rebase(&file), data);
            }
            if let Some(mode) = self.modes.remove(&file) {
                self.modes.insert(rebase(&file), mode);
            }
        }

        let dirs: Vec<_> = self
            .dirs
            .iter()
            .filter(|dir| *dir == src || dir.starts_with(&prefix))
            .cloned()
            .collect();
        for dir in dirs {
            self.dirs.remove(&dir);
            self.dirs.insert(rebase(&dir));
        }
    }

    fn reboot(&mut self) {
        self.reboots += 1;
        self.epoch += 1;
        self.offline = self.reboot_downtime;
        if self.reboots > self.fake_reboots {
            self.clear_tree(TMPFS);
        }
    }
}

fn home_of(username: &str) -> String {
    if username == "root" {
        "/root".to_string()
    } else {
        format!("/home/{}", username)
    }
}

fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

fn resolve(cwd: &str, home: &str, path: &str) -> String {
    if path == "~" {
        normalize(home)
    } else if let Some(rest) = path.strip_prefix("~/") {
        normalize(&format!("{}/{}", home, rest))
    } else if path.starts_with('/') {
        normalize(path)
    } else {
        normalize(&format!("{}/{}", cwd, path))
    }
}

fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => path[..index].to_string(),
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Word(String),
    Op(&'static str),
}

fn is_word(tok: &Tok, word: &str) -> bool {
    matches!(tok, Tok::Word(w) if w == word)
}

fn is_separator(tok: &Tok) -> bool {
    matches!(tok, Tok::Op(";") | Tok::Op("&"))
}

/// Split a line into words and operators, expanding `$?`
fn tokenize(line: &str, last_status: i32) -> Vec<Tok> {
    let mut toks = Vec::new();
    let mut word = String::new();
    let mut has_word = false;
    let mut chars = line.chars().peekable();

    macro_rules! flush {
        () => {
            if has_word {
                toks.push(Tok::Word(std::mem::take(&mut word)));
                has_word = false;
            }
        };
    }

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => flush!(),
            '\'' => {
                has_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    word.push(q);
                }
            }
            '"' => {
                has_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(next) = chars.next() {
                                word.push(next);
                            }
                        }
                        '$' if chars.peek() == Some(&'?') => {
                            chars.next();
                            word.push_str(&last_status.to_string());
                        }
                        q => word.push(q),
                    }
                }
            }
            '\\' => {
                has_word = true;
                if let Some(next) = chars.next() {
                    word.push(next);
                }
            }
            '$' if chars.peek() == Some(&'?') => {
                chars.next();
                has_word = true;
                word.push_str(&last_status.to_string());
            }
            ';' => {
                flush!();
                toks.push(Tok::Op(";"));
            }
            '&' => {
                flush!();
                if chars.peek() == Some(&'&') {
                    chars.next();
                    toks.push(Tok::Op("&&"));
                } else {
                    toks.push(Tok::Op("&"));
                }
            }
            '|' => {
                flush!();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    toks.push(Tok::Op("||"));
                } else {
                    toks.push(Tok::Op("|"));
                }
            }
            '<' => {
                flush!();
                toks.push(Tok::Op("<"));
            }
            '>' => {
                let stderr = has_word && word == "2";
                if stderr {
                    word.clear();
                    has_word = false;
                } else {
                    flush!();
                }

                let op = match (stderr, chars.peek()) {
                    (true, Some('>')) => {
                        chars.next();
                        "2>>"
                    }
                    (true, Some('&')) => {
                        chars.next();
                        chars.next();
                        "2>&1"
                    }
                    (true, _) => "2>",
                    (false, Some('>')) => {
                        chars.next();
                        ">>"
                    }
                    (false, _) => ">",
                };
                toks.push(Tok::Op(op));
            }
            c => {
                has_word = true;
                word.push(c);
            }
        }
    }
    if has_word {
        toks.push(Tok::Word(word));
    }
    toks
}

fn trim_separators(mut toks: &[Tok]) -> &[Tok] {
    while toks.first().is_some_and(is_separator) {
        toks = &toks[1..];
    }
    while toks.last().is_some_and(is_separator) {
        toks = &toks[..toks.len() - 1];
    }
    toks
}

#[derive(Debug, Default)]
struct Out {
    status: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Out {
    fn ok() -> Self {
        Self::default()
    }

    fn text(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into().into_bytes(),
            stderr: Vec::new(),
        }
    }

    fn fail(status: i32, stderr: impl Into<String>) -> Self {
        let mut stderr = stderr.into();
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        Self {
            status,
            stdout: Vec::new(),
            stderr: stderr.into_bytes(),
        }
    }

    fn absorb(&mut self, other: Out) {
        self.status = other.status;
        self.stdout.extend(other.stdout);
        self.stderr.extend(other.stderr);
    }
}

/// Redirections collected from one command or block
#[derive(Debug, Default)]
struct Redirects {
    stdout: Option<(String, bool)>,
    stderr: Option<(String, bool)>,
    merge_stderr: bool,
}

impl Redirects {
    fn take<'t>(&mut self, op: &str, rest: &mut impl Iterator<Item = &'t Tok>) -> Result<(), Out> {
        match op {
            ">" | ">>" | "2>" | "2>>" => {
                let Some(Tok::Word(target)) = rest.next() else {
                    return Err(Out::fail(2, "syntax error near redirection"));
                };
                let target = Some((target.clone(), op.ends_with(">>")));
                if op.starts_with('2') {
                    self.stderr = target;
                } else {
                    self.stdout = target;
                }
            }
            "2>&1" => self.merge_stderr = true,
            "<" => {
                rest.next();
            }
            op => return Err(Out::fail(2, format!("unsupported operator '{}'", op))),
        }
        Ok(())
    }

    /// Parse the tail after a closing `)`
    fn parse(toks: &[Tok]) -> Result<Self, Out> {
        let mut redirects = Self::default();
        let mut iter = toks.iter();
        while let Some(tok) = iter.next() {
            match tok {
                Tok::Op(op) => redirects.take(op, &mut iter)?,
                Tok::Word(word) => {
                    return Err(Out::fail(2, format!("syntax error near unexpected token '{}'", word)))
                }
            }
        }
        Ok(redirects)
    }
}

struct Shell<'a> {
    state: &'a mut HostState,
    cwd: String,
    home: String,
    last: i32,
    exiting: bool,
}

impl<'a> Shell<'a> {
    fn new(state: &'a mut HostState, home: String) -> Self {
        Self {
            state,
            cwd: home.clone(),
            home,
            last: 0,
            exiting: false,
        }
    }

    fn full(&self, path: &str) -> String {
        resolve(&self.cwd, &self.home, path)
    }

    fn run_line(&mut self, line: &str) -> Out {
        let toks = tokenize(line, self.last);
        let out = self.run_list(&toks);
        self.last = out.status;
        out
    }

    fn run_list(&mut self, toks: &[Tok]) -> Out {
        let toks = trim_separators(toks);
        let mut out = Out::ok();
        let mut i = 0;

        while i < toks.len() && !self.exiting {
            if is_word(&toks[i], "if") {
                let Some((then_at, fi_at)) = find_if_parts(toks, i) else {
                    out.absorb(Out::fail(2, "syntax error: unterminated if"));
                    return out;
                };

                let condition = self.run_list(&toks[i + 1..then_at]);
                let status = condition.status;
                out.stdout.extend(condition.stdout);
                out.stderr.extend(condition.stderr);

                if status == 0 {
                    let body = self.run_list(&toks[then_at + 1..fi_at]);
                    out.absorb(body);
                } else {
                    out.status = 0;
                }

                i = fi_at + 1;
                while i < toks.len() && is_separator(&toks[i]) {
                    i += 1;
                }
                continue;
            }

            let end = (i..toks.len())
                .find(|&j| is_separator(&toks[j]))
                .unwrap_or(toks.len());
            let result = self.run_and_or(&toks[i..end]);
            out.absorb(result);
            i = end + 1;
        }

        self.last = out.status;
        out
    }

    fn run_and_or(&mut self, toks: &[Tok]) -> Out {
        let mut out = Out::ok();
        let mut pending: Option<&'static str> = None;
        let mut start = 0;

        for end in 0..=toks.len() {
            let op = match toks.get(end) {
                Some(Tok::Op(op @ "&&")) | Some(Tok::Op(op @ "||")) => Some(*op),
                Some(_) => continue,
                None => None,
            };

            let skip = match pending {
                Some("&&") => out.status != 0,
                Some("||") => out.status == 0,
                _ => false,
            };
            if !skip && !self.exiting {
                let result = self.run_simple(&toks[start..end]);
                self.last = result.status;
                out.absorb(result);
            }

            pending = op;
            start = end + 1;
        }
        out
    }

    fn run_simple(&mut self, toks: &[Tok]) -> Out {
        let mut words = Vec::new();
        let mut redirects = Redirects::default();

        let mut iter = toks.iter();
        while let Some(tok) = iter.next() {
            match tok {
                Tok::Word(word) => words.push(word.clone()),
                Tok::Op(op) => {
                    if let Err(out) = redirects.take(op, &mut iter) {
                        return out;
                    }
                }
            }
        }

        if words.is_empty() {
            return Out::ok();
        }

        let out = self.dispatch(&words);
        self.route(out, redirects)
    }

    /// Send captured output where the redirections say
    fn route(&mut self, mut out: Out, redirects: Redirects) -> Out {
        if redirects.merge_stderr {
            let stderr = std::mem::take(&mut out.stderr);
            out.stdout.extend(stderr);
        }
        if let Some((target, append)) = redirects.stdout {
            let data = std::mem::take(&mut out.stdout);
            if let Err(err) = self.redirect(&target, data, append) {
                return Out::fail(1, err);
            }
        }
        if let Some((target, append)) = redirects.stderr {
            let data = std::mem::take(&mut out.stderr);
            if let Err(err) = self.redirect(&target, data, append) {
                return Out::fail(1, err);
            }
        }
        out
    }

    fn redirect(&mut self, target: &str, data: Vec<u8>, append: bool) -> Result<(), String> {
        if target == "/dev/null" {
            return Ok(());
        }
        let path = self.full(target);
        let data = if append {
            let mut current = self.state.files.get(&path).cloned().unwrap_or_default();
            current.extend(data);
            current
        } else {
            data
        };
        self.state.write_file(&path, data, None)
    }

    fn dispatch(&mut self, words: &[String]) -> Out {
        let mut words = words;
        while let Some(first) = words.first() {
            match first.as_str() {
                "nohup" => words = &words[1..],
                "sudo" => {
                    words = &words[1..];
                    while words.first().is_some_and(|w| w.starts_with('-')) {
                        words = &words[1..];
                    }
                }
                _ => break,
            }
        }

        let Some(name) = words.first() else {
            return Out::ok();
        };
        let args = &words[1..];

        let handler = self.state.handlers.get(name.as_str()).cloned();
        if let Some(handler) = handler {
            let mut context = MockContext {
                state: &mut *self.state,
                cwd: self.cwd.clone(),
                home: self.home.clone(),
            };
            let output = handler(&mut context, args);
            return Out {
                status: output.exit_code,
                stdout: output.stdout.into_bytes(),
                stderr: output.stderr.into_bytes(),
            };
        }

        match name.as_str() {
            "true" | ":" | "export" | "set" | "umask" | "sleep" | "sync" => Out::ok(),
            "false" => Out::fail(1, ""),
            "echo" => self.echo(args),
            "cat" => self.cat(args),
            "mkdir" => self.mkdir(args),
            "rm" => self.rm(args),
            "touch" => self.touch(args),
            "chmod" => self.chmod(args),
            "chown" => self.chown(args),
            "mv" => self.mv(args),
            "cp" => self.cp(args),
            "test" => self.test(args),
            "[" => match args.split_last() {
                Some((last, rest)) if last == "]" => self.test(rest),
                _ => Out::fail(2, "[: missing ]"),
            },
            "bash" | "sh" => match args.first() {
                Some(script) => self.run_script(script, false),
                None => Out::ok(),
            },
            "cd" => self.cd(args),
            "tar" => self.tar(args),
            "exit" => {
                self.exiting = true;
                let status = args
                    .first()
                    .and_then(|code| code.parse().ok())
                    .unwrap_or(self.last);
                Out {
                    status,
                    ..Out::ok()
                }
            }
            "reboot" => self.reboot(),
            "poweroff" | "halt" => self.poweroff(),
            "shutdown" => {
                if args.iter().any(|arg| arg == "-r") {
                    self.reboot()
                } else {
                    self.poweroff()
                }
            }
            "systemctl" => match args.first().map(String::as_str) {
                Some("reboot") => self.reboot(),
                Some("poweroff") | Some("halt") => self.poweroff(),
                _ => Out::ok(),
            },
            path if path.contains('/') => self.run_script(path, true),
            other => Out::fail(127, format!("bash: {}: command not found", other)),
        }
    }

    fn run_script(&mut self, path: &str, require_exec: bool) -> Out {
        let full = self.full(path);
        let Some(data) = self.state.files.get(&full).cloned() else {
            return Out::fail(127, format!("bash: {}: No such file or directory", path));
        };

        if require_exec {
            let mode = self.state.modes.get(&full).copied().unwrap_or(0o644);
            if mode & 0o111 == 0 {
                return Out::fail(126, format!("bash: {}: Permission denied", path));
            }
        }

        let text = String::from_utf8_lossy(&data).into_owned();
        let mut child = Shell {
            state: &mut *self.state,
            cwd: self.cwd.clone(),
            home: self.home.clone(),
            last: 0,
            exiting: false,
        };

        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        let mut out = Out::ok();
        let mut index = 0;
        while index < lines.len() {
            let line = lines[index];
            index += 1;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let result = if line == "(" {
                let Some(close) = lines[index..].iter().position(|l| l.starts_with(')')) else {
                    return Out::fail(2, "syntax error: unterminated subshell");
                };
                let body = &lines[index..index + close];
                let tail = &lines[index + close][1..];
                index += close + 1;
                child.run_subshell(body, tail)
            } else {
                child.run_line(line)
            };

            out.absorb(result);
            if child.exiting {
                break;
            }
        }
        out
    }

    /// Run a `( ... ) <redirections>` block. `exit` inside only leaves the
    /// block.
    fn run_subshell(&mut self, body: &[&str], tail: &str) -> Out {
        let redirects = match Redirects::parse(&tokenize(tail, self.last)) {
            Ok(redirects) => redirects,
            Err(out) => return out,
        };

        let mut sub = Shell {
            state: &mut *self.state,
            cwd: self.cwd.clone(),
            home: self.home.clone(),
            last: self.last,
            exiting: false,
        };
        let mut out = Out::ok();
        for line in body {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            out.absorb(sub.run_line(line));
            if sub.exiting {
                break;
            }
        }

        let out = self.route(out, redirects);
        self.last = out.status;
        out
    }

    fn echo(&mut self, args: &[String]) -> Out {
        let (newline, args) = match args.first() {
            Some(flag) if flag == "-n" => (false, &args[1..]),
            _ => (true, args),
        };
        let mut text = args.join(" ");
        if newline {
            text.push('\n');
        }
        Out::text(text)
    }

    fn cat(&mut self, args: &[String]) -> Out {
        let mut out = Out::ok();
        for arg in args {
            match self.state.files.get(&self.full(arg)) {
                Some(data) => out.stdout.extend_from_slice(data),
                None => {
                    out.absorb(Out::fail(
                        1,
                        format!("cat: {}: No such file or directory", arg),
                    ));
                }
            }
        }
        out
    }

    fn mkdir(&mut self, args: &[String]) -> Out {
        let parents = args.iter().any(|arg| arg == "-p");
        for arg in args.iter().filter(|arg| !arg.starts_with('-')) {
            let path = self.full(arg);
            if parents {
                if self.state.files.contains_key(&path) {
                    return Out::fail(1, format!("mkdir: {}: File exists", arg));
                }
                self.state.mkdir_all(&path);
            } else if self.state.exists(&path) {
                return Out::fail(1, format!("mkdir: cannot create directory '{}': File exists", arg));
            } else if !self.state.dirs.contains(&parent(&path)) {
                return Out::fail(
                    1,
                    format!("mkdir: cannot create directory '{}': No such file or directory", arg),
                );
            } else {
                self.state.dirs.insert(path);
            }
        }
        Out::ok()
    }

    fn rm(&mut self, args: &[String]) -> Out {
        let flags: String = args
            .iter()
            .filter(|arg| arg.starts_with('-'))
            .flat_map(|arg| arg.chars())
            .collect();
        let recursive = flags.contains('r') || flags.contains('R');
        let force = flags.contains('f');

        for arg in args.iter().filter(|arg| !arg.starts_with('-')) {
            let path = self.full(arg);
            if self.state.files.remove(&path).is_some() {
                self.state.modes.remove(&path);
            } else if self.state.dirs.contains(&path) {
                if !recursive {
                    return Out::fail(1, format!("rm: cannot remove '{}': Is a directory", arg));
                }
                self.state.remove_tree(&path);
            } else if !force {
                return Out::fail(
                    1,
                    format!("rm: cannot remove '{}': No such file or directory", arg),
                );
            }
        }
        Out::ok()
    }

    fn touch(&mut self, args: &[String]) -> Out {
        for arg in args.iter().filter(|arg| !arg.starts_with('-')) {
            let path = self.full(arg);
            if self.state.exists(&path) {
                continue;
            }
            if let Err(err) = self.state.write_file(&path, Vec::new(), None) {
                return Out::fail(1, format!("touch: cannot touch {}", err));
            }
        }
        Out::ok()
    }

    fn chmod(&mut self, args: &[String]) -> Out {
        let args: Vec<_> = args.iter().filter(|arg| *arg != "-R").collect();
        let Some((mode, paths)) = args.split_first() else {
            return Out::fail(1, "chmod: missing operand");
        };

        for arg in paths {
            let path = self.full(arg);
            if !self.state.exists(&path) {
                return Out::fail(
                    1,
                    format!("chmod: cannot access '{}': No such file or directory", arg),
                );
            }
            let current = self.state.modes.get(&path).copied().unwrap_or(0o644);
            let next = match mode.as_str() {
                "+x" | "a+x" | "u+x" => current | 0o111,
                "+r" | "a+r" => current | 0o444,
                octal => match u32::from_str_radix(octal, 8) {
                    Ok(value) => value,
                    Err(_) => return Out::fail(1, format!("chmod: invalid mode: '{}'", octal)),
                },
            };
            self.state.modes.insert(path, next);
        }
        Out::ok()
    }

    fn chown(&mut self, args: &[String]) -> Out {
        let args: Vec<_> = args.iter().filter(|arg| *arg != "-R").collect();
        let Some((owner, paths)) = args.split_first() else {
            return Out::fail(1, "chown: missing operand");
        };
        for arg in paths {
            let path = self.full(arg);
            if !self.state.exists(&path) {
                return Out::fail(
                    1,
                    format!("chown: cannot access '{}': No such file or directory", arg),
                );
            }
            self.state.owners.insert(path, owner.to_string());
        }
        Out::ok()
    }

    fn destination(&self, src: &str, dst: &str) -> String {
        let dst = self.full(dst);
        if self.state.dirs.contains(&dst) {
            format!("{}/{}", dst.trim_end_matches('/'), basename(src))
        } else {
            dst
        }
    }

    fn mv(&mut self, args: &[String]) -> Out {
        let operands: Vec<_> = args.iter().filter(|arg| !arg.starts_with('-')).collect();
        let [src, dst] = operands.as_slice() else {
            return Out::fail(1, "mv: expected source and destination");
        };

        let from = self.full(src);
        if !self.state.exists(&from) {
            return Out::fail(1, format!("mv: cannot stat '{}': No such file or directory", src));
        }
        let to = self.destination(&from, dst);
        if !self.state.dirs.contains(&parent(&to)) {
            return Out::fail(1, format!("mv: cannot move to '{}': No such file or directory", dst));
        }

        self.state.remove_tree(&to);
        self.state.rename_tree(&from, &to);
        Out::ok()
    }

    fn cp(&mut self, args: &[String]) -> Out {
        let operands: Vec<_> = args.iter().filter(|arg| !arg.starts_with('-')).collect();
        let [src, dst] = operands.as_slice() else {
            return Out::fail(1, "cp: expected source and destination");
        };

        let from = self.full(src);
        let Some(data) = self.state.files.get(&from).cloned() else {
            return Out::fail(1, format!("cp: cannot stat '{}': No such file or directory", src));
        };
        let to = self.destination(&from, dst);
        match self.state.write_file(&to, data, None) {
            Ok(()) => Out::ok(),
            Err(err) => Out::fail(1, format!("cp: {}", err)),
        }
    }

    fn test(&mut self, args: &[String]) -> Out {
        let (negate, args) = match args.first() {
            Some(bang) if bang == "!" => (true, &args[1..]),
            _ => (false, args),
        };

        let result = match args {
            [flag, path] => {
                let path = self.full(path);
                match flag.as_str() {
                    "-f" => self.state.files.contains_key(&path),
                    "-d" => self.state.dirs.contains(&path),
                    "-e" => self.state.exists(&path),
                    "-s" => self.state.files.get(&path).is_some_and(|data| !data.is_empty()),
                    other => return Out::fail(2, format!("test: unknown operator {}", other)),
                }
            }
            [value] => !value.is_empty(),
            [] => false,
            _ => return Out::fail(2, "test: too many arguments"),
        };

        if result != negate {
            Out::ok()
        } else {
            Out::fail(1, "")
        }
    }

    fn cd(&mut self, args: &[String]) -> Out {
        let target = match args.first() {
            Some(dir) => self.full(dir),
            None => self.home.clone(),
        };
        if !self.state.dirs.contains(&target) {
            return Out::fail(1, format!("cd: {}: No such file or directory", target));
        }
        self.cwd = target;
        Out::ok()
    }

    fn tar(&mut self, args: &[String]) -> Out {
        let mut archive = None;
        let mut dest = self.cwd.clone();
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            if arg == "-C" {
                if let Some(dir) = iter.next() {
                    dest = self.full(dir);
                }
            } else if arg.starts_with('-') && arg.contains('f') {
                archive = iter.next().cloned();
            }
        }

        let Some(archive) = archive else {
            return Out::fail(2, "tar: no archive given");
        };
        let Some(data) = self.state.files.get(&self.full(&archive)).cloned() else {
            return Out::fail(2, format!("tar: {}: Cannot open: No such file or directory", archive));
        };
        if !self.state.dirs.contains(&dest) {
            return Out::fail(2, format!("tar: {}: Cannot open: No such file or directory", dest));
        }

        match self.extract(&data, &dest) {
            Ok(()) => Out::ok(),
            Err(err) => Out::fail(2, format!("tar: {}", err)),
        }
    }

    fn extract(&mut self, data: &[u8], dest: &str) -> std::io::Result<()> {
        let mut archive = tar::Archive::new(GzDecoder::new(data));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let relative = entry.path()?.to_string_lossy().into_owned();
            let path = normalize(&format!("{}/{}", dest, relative));

            if entry.header().entry_type().is_dir() {
                self.state.mkdir_all(&path);
                continue;
            }

            let mode = entry.header().mode().unwrap_or(0o644);
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            self.state.mkdir_all(&parent(&path));
            self.state.files.insert(path.clone(), content);
            self.state.modes.insert(path, mode);
        }
        Ok(())
    }

    fn reboot(&mut self) -> Out {
        self.state.reboot();
        self.exiting = true;
        Out::ok()
    }

    fn poweroff(&mut self) -> Out {
        self.state.powered_off = true;
        self.state.epoch += 1;
        self.exiting = true;
        Out::ok()
    }
}

/// Locate the `then` and matching `fi` of the `if` at `start`
fn find_if_parts(toks: &[Tok], start: usize) -> Option<(usize, usize)> {
    let mut depth = 0;
    let mut then_at = None;

    for (index, tok) in toks.iter().enumerate().skip(start + 1) {
        if is_word(tok, "if") {
            depth += 1;
        } else if is_word(tok, "then") && depth == 0 && then_at.is_none() {
            then_at = Some(index);
        } else if is_word(tok, "fi") {
            if depth == 0 {
                return then_at.map(|then_at| (then_at, index));
            }
            depth -= 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;

    fn params(password: &str) -> ConnectParams {
        let creds = Credentials::password("sysadmin", password);
        ConnectParams {
            node: "mock".to_string(),
            host: "10.0.0.1".to_string(),
            port: 22,
            username: creds.username,
            auth: creds.auth,
            connect_timeout: Duration::from_secs(1),
            operation_timeout: Duration::from_secs(1),
            cipher: "aes256-ctr".to_string(),
        }
    }

    fn exec(host: &MockHost, command: &str) -> ExecOutput {
        let mut session = host.open_command(&params("x")).unwrap();
        session.exec(command).unwrap()
    }

    #[test]
    fn test_tokenize_quotes_and_ops() {
        let toks = tokenize(r#"echo 'a b' "c $?" 'it'\''s' && x > out 2>&1"#, 3);
        assert_eq!(
            toks,
            vec![
                Tok::Word("echo".to_string()),
                Tok::Word("a b".to_string()),
                Tok::Word("c 3".to_string()),
                Tok::Word("it's".to_string()),
                Tok::Op("&&"),
                Tok::Word("x".to_string()),
                Tok::Op(">"),
                Tok::Word("out".to_string()),
                Tok::Op("2>&1"),
            ]
        );
    }

    #[test]
    fn test_basic_commands() {
        let host = MockHost::new();
        let out = exec(&host, "mkdir -p /tmp/a/b && echo hello > /tmp/a/b/f && cat /tmp/a/b/f");
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout_text(), "hello\n");
        assert!(host.is_dir("/tmp/a/b"));
    }

    #[test]
    fn test_if_guard() {
        let host = MockHost::new();
        let line = "if [ ! -f /tmp/marker ]; then touch /tmp/marker; echo ran >> /tmp/log & fi";
        exec(&host, line);
        exec(&host, line);
        assert_eq!(host.read_text("/tmp/log").unwrap(), "ran\n");
    }

    #[test]
    fn test_and_or_short_circuit() {
        let host = MockHost::new();
        let out = exec(&host, "false && echo no || echo yes");
        assert_eq!(out.stdout_text(), "yes\n");
        assert_eq!(out.exit_code, 0);
    }

    #[test]
    fn test_script_and_exit_code() {
        let host = MockHost::new();
        host.add_file("/tmp/s.sh", b"#!/bin/bash\necho one\nfalse\necho $? > /tmp/code\n");
        let out = exec(&host, "bash /tmp/s.sh");
        assert_eq!(out.stdout_text(), "one\n");
        assert_eq!(host.read_text("/tmp/code").unwrap(), "1\n");
    }

    #[test]
    fn test_direct_script_needs_exec_bit() {
        let host = MockHost::new();
        host.add_file("/tmp/s.sh", b"echo hi\n");
        assert_eq!(exec(&host, "/tmp/s.sh").exit_code, 126);
        assert_eq!(exec(&host, "chmod 700 /tmp/s.sh && /tmp/s.sh").stdout_text(), "hi\n");
    }

    #[test]
    fn test_unknown_command() {
        let host = MockHost::new();
        let out = exec(&host, "frobnicate --now");
        assert_eq!(out.exit_code, 127);
        assert!(out.stderr_text().contains("command not found"));
    }

    #[test]
    fn test_handler() {
        let host = MockHost::new();
        host.on_command("append-line", |ctx, args| {
            ctx.append(&args[0], b"line\n");
            MockOutput::ok("")
        });
        exec(&host, "append-line /tmp/out");
        exec(&host, "append-line /tmp/out");
        assert_eq!(host.read_text("/tmp/out").unwrap(), "line\nline\n");
    }

    #[test]
    fn test_drop_after_runs_command() {
        let host = MockHost::new();
        host.drop_after("touch /tmp/x");
        let mut session = host.open_command(&params("x")).unwrap();
        assert!(session.exec("touch /tmp/x").is_err());
        assert!(host.exists("/tmp/x"));
        assert!(!session.is_connected());
    }

    #[test]
    fn test_drop_before_skips_command() {
        let host = MockHost::new();
        host.drop_before("touch /tmp/x");
        let mut session = host.open_command(&params("x")).unwrap();
        assert!(session.exec("touch /tmp/x").is_err());
        assert!(!host.exists("/tmp/x"));
    }

    #[test]
    fn test_password_check() {
        let host = MockHost::new();
        host.set_password(Some("right"));
        let err = host.open_command(&params("wrong")).err().unwrap();
        assert!(err.is_auth_error());
        assert!(host.open_command(&params("right")).is_ok());
    }

    #[test]
    fn test_file_session_relative_to_home() {
        let host = MockHost::new();
        let mut files = host.open_file(&params("x")).unwrap();
        files.upload("notes.txt", b"hi", Some(0o600)).unwrap();
        assert_eq!(host.read_text("/home/sysadmin/notes.txt").unwrap(), "hi");
        assert_eq!(host.mode("/home/sysadmin/notes.txt"), Some(0o600));
        assert!(files.exists("/home/sysadmin/notes.txt").unwrap());
        assert!(matches!(
            files.download("/nope"),
            Err(TransportError::NotFound { .. })
        ));
    }

    #[test]
    fn test_reboot_clears_tmpfs_unless_faked() {
        let host = MockHost::new();
        host.fake_reboots(1);
        host.add_file("/dev/shm/hive/rebooting", b"");

        let mut session = host.open_command(&params("x")).unwrap();
        assert!(session.exec("systemctl reboot").is_err());
        assert!(host.exists("/dev/shm/hive/rebooting"));

        // One refused attempt while the host restarts
        assert!(host.open_command(&params("x")).is_err());
        let mut session = host.open_command(&params("x")).unwrap();
        assert!(session.exec("sudo systemctl reboot").is_err());
        assert!(!host.exists("/dev/shm/hive/rebooting"));
        assert!(host.is_dir("/dev/shm"));
        assert_eq!(host.reboot_count(), 2);
    }

    #[test]
    fn test_mv_into_directory() {
        let host = MockHost::new();
        host.add_file("/tmp/a.txt", b"a");
        host.add_dir("/srv");
        exec(&host, "mv /tmp/a.txt /srv");
        assert!(host.exists("/srv/a.txt"));
        assert!(!host.exists("/tmp/a.txt"));
    }
}
