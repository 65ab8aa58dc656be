//! Scriptable stand-ins for the device-side collaborators.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use crate::app::adb::proxy::{CaptureProcess, CommandProxy};
use crate::app::error::AppError;
use crate::app::rpc::{Connection, DispatcherFactory, EventDispatcher, RpcClient, RpcConnection, SessionId};

pub struct FakeCapture {
    pid: u32,
    stopped: Arc<AtomicBool>,
}

impl CaptureProcess for FakeCapture {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn stop(&mut self) -> Result<(), AppError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct ProxyState {
    shell_overrides: HashMap<String, Result<Vec<u8>, AppError>>,
    shell_commands: Vec<String>,
    forwards: Vec<(u16, u16)>,
    removed_forwards: Vec<u16>,
    logcat_spawns: Vec<(String, PathBuf)>,
    captures: Vec<Arc<AtomicBool>>,
    attached: Vec<String>,
    bootloader_attached: Vec<String>,
    bugreports: Vec<PathBuf>,
    fail_bugreport: bool,
    reboots: usize,
    bootloader_reboots: usize,
    adbd_root: bool,
    roots: usize,
    remounts: usize,
    rpc_server_starts: usize,
}

/// Records every call and answers shell commands with sensible defaults:
/// booted, product name `pixel`. adbd runs unrooted until `root`, and a
/// reboot drops it back.
pub struct FakeProxy {
    serial: String,
    state: Mutex<ProxyState>,
}

impl FakeProxy {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            state: Mutex::new(ProxyState {
                attached: vec![serial.to_string()],
                ..ProxyState::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ProxyState> {
        self.state.lock().expect("fake proxy state")
    }

    pub fn set_shell(&self, command: &str, output: &str) {
        self.state()
            .shell_overrides
            .insert(command.to_string(), Ok(output.as_bytes().to_vec()));
    }

    pub fn fail_shell(&self, command: &str) {
        self.state().shell_overrides.insert(
            command.to_string(),
            Err(AppError::dependency(format!("{command} failed"), "fake")),
        );
    }

    pub fn set_attached(&self, serials: &[&str]) {
        self.state().attached = serials.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_bootloader_attached(&self, serials: &[&str]) {
        self.state().bootloader_attached = serials.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail_bugreport(&self) {
        self.state().fail_bugreport = true;
    }

    pub fn shell_commands(&self) -> Vec<String> {
        self.state().shell_commands.clone()
    }

    pub fn forwards(&self) -> Vec<(u16, u16)> {
        self.state().forwards.clone()
    }

    pub fn removed_forwards(&self) -> Vec<u16> {
        self.state().removed_forwards.clone()
    }

    pub fn logcat_spawns(&self) -> Vec<PathBuf> {
        self.state()
            .logcat_spawns
            .iter()
            .map(|(_, path)| path.clone())
            .collect()
    }

    pub fn logcat_params(&self) -> Vec<String> {
        self.state()
            .logcat_spawns
            .iter()
            .map(|(params, _)| params.clone())
            .collect()
    }

    pub fn stopped_captures(&self) -> usize {
        self.state()
            .captures
            .iter()
            .filter(|stopped| stopped.load(Ordering::SeqCst))
            .count()
    }

    pub fn bugreports(&self) -> Vec<PathBuf> {
        self.state().bugreports.clone()
    }

    pub fn reboots(&self) -> usize {
        self.state().reboots
    }

    pub fn bootloader_reboots(&self) -> usize {
        self.state().bootloader_reboots
    }

    pub fn roots(&self) -> usize {
        self.state().roots
    }

    pub fn remounts(&self) -> usize {
        self.state().remounts
    }

    pub fn rpc_server_starts(&self) -> usize {
        self.state().rpc_server_starts
    }

    fn device_list(serials: &[String], state: &str) -> Vec<u8> {
        let mut out = String::from("List of devices attached\n");
        for serial in serials {
            out.push_str(&format!("{serial}\t{state}\n"));
        }
        out.into_bytes()
    }
}

impl CommandProxy for FakeProxy {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn shell(&self, command: &str) -> Result<Vec<u8>, AppError> {
        let mut state = self.state();
        state.shell_commands.push(command.to_string());
        if let Some(scripted) = state.shell_overrides.get(command) {
            return scripted.clone();
        }
        let output: &[u8] = match command {
            "id -u" if state.adbd_root => b"0\n",
            "id -u" => b"2000\n",
            "getprop sys.boot_completed" => b"1\n",
            "getprop ro.build.product" => b"generic\n",
            "getprop ro.product.name" => b"pixel\n",
            _ => b"",
        };
        Ok(output.to_vec())
    }

    fn forward(&self, host_port: u16, device_port: u16) -> Result<(), AppError> {
        self.state().forwards.push((host_port, device_port));
        Ok(())
    }

    fn remove_forward(&self, host_port: u16) -> Result<(), AppError> {
        self.state().removed_forwards.push(host_port);
        Ok(())
    }

    fn root(&self) -> Result<(), AppError> {
        let mut state = self.state();
        state.roots += 1;
        state.adbd_root = true;
        Ok(())
    }

    fn remount(&self) -> Result<(), AppError> {
        self.state().remounts += 1;
        Ok(())
    }

    fn wait_for_device(&self, _timeout: Duration) -> Result<(), AppError> {
        Ok(())
    }

    fn reboot(&self) -> Result<(), AppError> {
        let mut state = self.state();
        state.reboots += 1;
        state.adbd_root = false;
        Ok(())
    }

    fn bootloader_reboot(&self) -> Result<(), AppError> {
        self.state().bootloader_reboots += 1;
        Ok(())
    }

    fn bootloader_product(&self) -> Result<Vec<u8>, AppError> {
        Ok(b"product: Walleye\nfinished. total time: 0.001s\n".to_vec())
    }

    fn list_devices(&self) -> Result<Vec<u8>, AppError> {
        Ok(Self::device_list(&self.state().attached, "device"))
    }

    fn list_bootloader_devices(&self) -> Result<Vec<u8>, AppError> {
        let state = self.state();
        let mut out = Vec::new();
        for serial in &state.bootloader_attached {
            out.extend_from_slice(format!("{serial}\tfastboot\n").as_bytes());
        }
        Ok(out)
    }

    fn bugreport(&self, destination: &Path) -> Result<(), AppError> {
        let mut state = self.state();
        if state.fail_bugreport {
            return Err(AppError::dependency("bugreport failed", "fake"));
        }
        fs::write(destination, format!("bugreport of {}\n", self.serial))
            .map_err(|err| AppError::system(err.to_string(), "fake"))?;
        state.bugreports.push(destination.to_path_buf());
        Ok(())
    }

    fn start_rpc_server(&self, _device_port: u16) -> Result<(), AppError> {
        self.state().rpc_server_starts += 1;
        Ok(())
    }

    fn spawn_logcat(
        &self,
        extra_params: &str,
        output: &Path,
    ) -> Result<Box<dyn CaptureProcess>, AppError> {
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(output)
            .map_err(|err| AppError::system(err.to_string(), "fake"))?;
        let mut state = self.state();
        let stopped = Arc::new(AtomicBool::new(false));
        state.captures.push(Arc::clone(&stopped));
        state
            .logcat_spawns
            .push((extra_params.to_string(), output.to_path_buf()));
        Ok(Box::new(FakeCapture {
            pid: 4000 + state.logcat_spawns.len() as u32,
            stopped,
        }))
    }
}

pub struct FakeConnection {
    uid: SessionId,
    port: u16,
    closed: AtomicBool,
    terminated: AtomicBool,
    fail_terminate: AtomicBool,
    events: Mutex<VecDeque<Value>>,
}

impl FakeConnection {
    pub fn new(uid: SessionId, port: u16) -> Self {
        Self {
            uid,
            port,
            closed: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            fail_terminate: AtomicBool::new(false),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn push_event(&self, event: Value) {
        self.events.lock().expect("events").push_back(event);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl RpcConnection for FakeConnection {
    fn uid(&self) -> SessionId {
        self.uid
    }

    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, AppError> {
        if self.is_closed() {
            return Err(AppError::transient("connection closed", "fake"));
        }
        if method == "eventWait" {
            if let Some(event) = self.events.lock().expect("events").pop_front() {
                return Ok(event);
            }
            let wait_ms = params.first().and_then(Value::as_u64).unwrap_or(10).min(20);
            thread::sleep(Duration::from_millis(wait_ms));
            return Ok(Value::Null);
        }
        Ok(json!(method))
    }

    fn terminate(&self) -> Result<(), AppError> {
        if self.is_closed() {
            return Err(AppError::transient("RPC send failed: Broken pipe", "fake"));
        }
        self.terminated.store(true, Ordering::SeqCst);
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(AppError::dependency("terminate rejected", "fake"));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), AppError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        FakeConnection::is_closed(self)
    }
}

#[derive(Default)]
struct RpcState {
    scripted_uids: VecDeque<SessionId>,
    next_uid: SessionId,
    unreachable: usize,
    opens: Vec<u16>,
    joins: Vec<(SessionId, u16)>,
    connections: Vec<Arc<FakeConnection>>,
}

/// Hands out the scripted uids in order, then fresh ones from 1000 up.
pub struct FakeRpc {
    state: Mutex<RpcState>,
}

fn same_connection(fake: &Arc<FakeConnection>, connection: &Connection) -> bool {
    Arc::as_ptr(fake) as *const () == Arc::as_ptr(connection) as *const ()
}

impl FakeRpc {
    pub fn new() -> Self {
        Self::with_uids(Vec::new())
    }

    pub fn with_uids(uids: Vec<SessionId>) -> Self {
        Self {
            state: Mutex::new(RpcState {
                scripted_uids: uids.into(),
                next_uid: 1000,
                ..RpcState::default()
            }),
        }
    }

    /// The next `count` opens fail as if the server were not running.
    pub fn unreachable_for(self, count: usize) -> Self {
        self.set_unreachable(count);
        self
    }

    pub fn set_unreachable(&self, count: usize) {
        self.state().unreachable = count;
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RpcState> {
        self.state.lock().expect("fake rpc state")
    }

    pub fn opens(&self) -> Vec<u16> {
        self.state().opens.clone()
    }

    pub fn joins(&self) -> Vec<(SessionId, u16)> {
        self.state().joins.clone()
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.state().connections.clone()
    }

    pub fn closed_count(&self) -> usize {
        self.state()
            .connections
            .iter()
            .filter(|connection| connection.is_closed())
            .count()
    }

    pub fn was_closed(&self, connection: &Connection) -> bool {
        self.state()
            .connections
            .iter()
            .any(|fake| same_connection(fake, connection) && fake.is_closed())
    }

    pub fn fail_terminate_on(&self, connection: &Connection) {
        for fake in &self.state().connections {
            if same_connection(fake, connection) {
                fake.fail_terminate.store(true, Ordering::SeqCst);
            }
        }
    }

    fn connect(&self, uid: SessionId, port: u16) -> Arc<FakeConnection> {
        let connection = Arc::new(FakeConnection::new(uid, port));
        self.state().connections.push(Arc::clone(&connection));
        connection
    }
}

impl RpcClient for FakeRpc {
    fn open(&self, port: u16) -> Result<(Connection, SessionId), AppError> {
        let uid = {
            let mut state = self.state();
            state.opens.push(port);
            if state.unreachable > 0 {
                state.unreachable -= 1;
                return Err(AppError::transient(
                    format!("connection refused on {port}"),
                    "fake",
                ));
            }
            match state.scripted_uids.pop_front() {
                Some(uid) => uid,
                None => {
                    state.next_uid += 1;
                    state.next_uid
                }
            }
        };
        let connection: Connection = self.connect(uid, port);
        Ok((connection, uid))
    }

    fn join(&self, uid: SessionId, port: u16) -> Result<Connection, AppError> {
        self.state().joins.push((uid, port));
        let connection: Connection = self.connect(uid, port);
        Ok(connection)
    }
}

pub struct FakeDispatcher {
    connection: Connection,
    fail_start: bool,
    starts: AtomicUsize,
    clean_ups: AtomicUsize,
}

impl FakeDispatcher {
    pub fn uid(&self) -> SessionId {
        self.connection.uid()
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn clean_up_count(&self) -> usize {
        self.clean_ups.load(Ordering::SeqCst)
    }
}

impl EventDispatcher for FakeDispatcher {
    fn start(&self) -> Result<(), AppError> {
        if self.fail_start {
            return Err(AppError::dependency("dispatcher failed to start", "fake"));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clean_up(&self) {
        self.clean_ups.fetch_add(1, Ordering::SeqCst);
        let _ = self.connection.close();
    }
}

pub type CreatedDispatchers = Arc<Mutex<Vec<Arc<FakeDispatcher>>>>;

fn dispatcher_factory(fail_start: bool) -> (DispatcherFactory, CreatedDispatchers) {
    let created: CreatedDispatchers = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&created);
    let factory: DispatcherFactory = Arc::new(move |connection: Connection| -> Arc<dyn EventDispatcher> {
        let dispatcher = Arc::new(FakeDispatcher {
            connection,
            fail_start,
            starts: AtomicUsize::new(0),
            clean_ups: AtomicUsize::new(0),
        });
        sink.lock().expect("created").push(Arc::clone(&dispatcher));
        dispatcher
    });
    (factory, created)
}

pub fn fake_dispatcher_factory() -> (DispatcherFactory, CreatedDispatchers) {
    dispatcher_factory(false)
}

pub fn failing_dispatcher_factory() -> (DispatcherFactory, CreatedDispatchers) {
    dispatcher_factory(true)
}

/// Port probe that treats everything as free unless listed in `busy`.
pub fn probe_with_busy(busy: Arc<Mutex<HashSet<u16>>>) -> impl Fn(u16) -> bool + Send + Sync {
    move |port| !busy.lock().expect("busy ports").contains(&port)
}
