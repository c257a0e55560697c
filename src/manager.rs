//! Hub connection manager.
//!
//! This module owns the lifecycle of at most one hub session and
//! translates user-level intents (scan, connect, run, stop, disconnect)
//! into transport/session calls, including the recovery policy:
//! address-lookup fallback on connect and reset-by-reconnect when the
//! hub offers no usable halt.

use std::{collections::HashSet, io::Write, time::Duration};

use bluer::Address;
use log::{debug, error, info, warn};
use serde_json::json;
use tempfile::NamedTempFile;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
};

use crate::{
   error::{HubError, Result},
   event::{EventSender, HubEvent},
   pybricks,
   transport::{HubInfo, HubSession, Transport},
};

/// Timeout for the direct address lookup during connect
const FIND_BY_ADDRESS_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for the fallback discovery scan during connect
const FALLBACK_SCAN_TIMEOUT: Duration = Duration::from_secs(5);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum LinkState {
   #[strum(serialize = "disconnected")]
   Disconnected,
   #[strum(serialize = "connecting")]
   Connecting,
   #[strum(serialize = "connected")]
   Connected,
   #[strum(serialize = "disconnecting")]
   Disconnecting,
}

/// Snapshot of the manager's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
   pub state: LinkState,
   pub address: Option<Address>,
   pub script_running: bool,
}

impl LinkStatus {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "state": self.state.to_string(),
          "address": self.address.map(|a| a.to_string()),
          "script_running": self.script_running,
      })
   }
}

enum ManagerCommand {
   Scan {
      timeout: Duration,
      reply: oneshot::Sender<Result<Vec<HubInfo>>>,
   },
   Connect {
      address: Address,
      reply: oneshot::Sender<Result<()>>,
   },
   Disconnect {
      reply: oneshot::Sender<Result<()>>,
   },
   Run {
      script: String,
      reply: oneshot::Sender<Result<()>>,
   },
   Stop {
      reply: oneshot::Sender<Result<()>>,
   },
   Status {
      reply: oneshot::Sender<LinkStatus>,
   },
}

/// Handle to the hub manager.
///
/// Operations are serialized by a single actor task: there is exactly one
/// session and one physical link, so two hub operations never overlap. A
/// running script occupies the session but leaves the inbox live, which
/// is what allows `stop` to interrupt it.
#[derive(Clone)]
pub struct HubManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl HubManager {
   pub fn new<T: Transport>(transport: T, event_tx: EventSender) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ManagerActor::new(transport, event_tx, command_rx).run());
      Self { inbox: command_tx }
   }

   /// Scans for Pybricks hubs. Only meaningful while disconnected.
   pub async fn scan(&self, timeout: Duration) -> Result<Vec<HubInfo>> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Scan { timeout, reply: tx })
         .await
         .map_err(|_| HubError::ManagerShutdown)?;
      rx.await.map_err(|_| HubError::ManagerShutdown)?
   }

   /// Connects to the hub with the given address.
   pub async fn connect(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Connect { address, reply: tx })
         .await
         .map_err(|_| HubError::ManagerShutdown)?;
      rx.await.map_err(|_| HubError::ManagerShutdown)?
   }

   /// Disconnects from the hub. A no-op when not connected.
   pub async fn disconnect(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Disconnect { reply: tx })
         .await
         .map_err(|_| HubError::ManagerShutdown)?;
      rx.await.map_err(|_| HubError::ManagerShutdown)?
   }

   /// Uploads and runs a script, returning once the hub reports
   /// completion. Output lines arrive through the event bus while the
   /// script runs.
   pub async fn run(&self, script: String) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Run { script, reply: tx })
         .await
         .map_err(|_| HubError::ManagerShutdown)?;
      rx.await.map_err(|_| HubError::ManagerShutdown)?
   }

   /// Stops the running script.
   pub async fn stop(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Stop { reply: tx })
         .await
         .map_err(|_| HubError::ManagerShutdown)?;
      rx.await.map_err(|_| HubError::ManagerShutdown)?
   }

   pub async fn status(&self) -> Result<LinkStatus> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Status { reply: tx })
         .await
         .map_err(|_| HubError::ManagerShutdown)?;
      rx.await.map_err(|_| HubError::ManagerShutdown)
   }
}

struct RunningScript {
   reply: oneshot::Sender<Result<()>>,
   handle: JoinHandle<()>,
}

struct ManagerActor<T: Transport> {
   transport: T,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   run_done_tx: mpsc::Sender<Result<()>>,
   run_done_rx: mpsc::Receiver<Result<()>>,

   state: LinkState,
   session: Option<T::Session>,
   running: Option<RunningScript>,
}

impl<T: Transport> ManagerActor<T> {
   fn new(
      transport: T,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      let (run_done_tx, run_done_rx) = mpsc::channel(1);
      Self {
         transport,
         event_tx,
         command_rx,
         run_done_tx,
         run_done_rx,
         state: LinkState::Disconnected,
         session: None,
         running: None,
      }
   }

   async fn run(mut self) {
      info!("Hub manager starting up");

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Hub manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             Some(result) = self.run_done_rx.recv() => {
                 self.handle_run_finished(result);
             }
         }
      }

      self.cleanup().await;
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::Scan { timeout, reply } => {
            let _ = reply.send(self.handle_scan(timeout).await);
         },
         ManagerCommand::Connect { address, reply } => {
            let _ = reply.send(self.handle_connect(address).await);
         },
         ManagerCommand::Disconnect { reply } => {
            let _ = reply.send(self.handle_disconnect().await);
         },
         ManagerCommand::Run { script, reply } => {
            self.handle_run(script, reply);
         },
         ManagerCommand::Stop { reply } => {
            let _ = reply.send(self.handle_stop().await);
         },
         ManagerCommand::Status { reply } => {
            let _ = reply.send(self.status());
         },
      }
   }

   async fn handle_scan(&mut self, timeout: Duration) -> Result<Vec<HubInfo>> {
      if self.state != LinkState::Disconnected {
         return Err(HubError::AlreadyConnected);
      }

      info!("Scanning for Pybricks hubs (timeout: {timeout:?})");
      let discovered = self
         .transport
         .discover(timeout)
         .await
         .map_err(|e| HubError::Scan(Box::new(e)))?;

      let mut seen = HashSet::new();
      let mut hubs = Vec::new();
      for device in discovered {
         if pybricks::is_hub_name(&device.name) && seen.insert(device.address) {
            info!("Found hub: {} ({})", device.name, device.address);
            hubs.push(HubInfo {
               name: device.name,
               address: device.address,
            });
         }
      }

      if hubs.is_empty() {
         warn!("No Pybricks hubs found. Make sure the hub is on and in range.");
      }
      Ok(hubs)
   }

   async fn handle_connect(&mut self, address: Address) -> Result<()> {
      if self.state != LinkState::Disconnected {
         return Err(HubError::AlreadyConnected);
      }
      self.do_connect(address).await
   }

   async fn do_connect(&mut self, address: Address) -> Result<()> {
      self.state = LinkState::Connecting;
      info!("Connecting to {address}...");

      match self.try_connect(address).await {
         Ok(session) => {
            self.session = Some(session);
            self.state = LinkState::Connected;
            self.event_tx.emit(address, HubEvent::HubConnected);
            info!("Connected to {address}");
            Ok(())
         },
         Err(e) => {
            error!("Connection to {address} failed: {e}");
            self.session = None;
            self.state = LinkState::Disconnected;
            Err(e)
         },
      }
   }

   async fn try_connect(&self, address: Address) -> Result<T::Session> {
      let handle = match self
         .transport
         .find_by_address(address, FIND_BY_ADDRESS_TIMEOUT)
         .await?
      {
         Some(handle) => handle,
         None => {
            // Not seen under its address; one full scan before giving up
            warn!("Hub {address} not found by address, trying discovery...");
            self
               .transport
               .discover(FALLBACK_SCAN_TIMEOUT)
               .await?
               .into_iter()
               .find(|d| d.address == address)
               .map(|d| d.handle)
               .ok_or(HubError::DeviceNotFound(address))?
         },
      };

      let session = self.transport.open(handle)?;
      session
         .connect()
         .await
         .map_err(|e| HubError::Connect(Box::new(e)))?;
      Ok(session)
   }

   async fn handle_disconnect(&mut self) -> Result<()> {
      let Some(session) = self.session.take() else {
         return Ok(());
      };
      self.state = LinkState::Disconnecting;
      let address = session.address();

      // Best effort: a stuck remote session must never block the local
      // state from resetting
      if let Err(e) = session.disconnect().await {
         warn!("Error during disconnect from {address}: {e}");
      }

      self.state = LinkState::Disconnected;
      self.event_tx.emit(address, HubEvent::HubDisconnected);
      info!("Disconnected from {address}");
      Ok(())
   }

   fn handle_run(&mut self, script: String, reply: oneshot::Sender<Result<()>>) {
      if self.state != LinkState::Connected {
         let _ = reply.send(Err(HubError::NotConnected));
         return;
      }
      let Some(session) = self.session.clone() else {
         let _ = reply.send(Err(HubError::NotConnected));
         return;
      };
      if self.running.is_some() {
         let _ = reply.send(Err(HubError::ScriptInProgress));
         return;
      }

      let file = match write_script_file(&script) {
         Ok(file) => file,
         Err(e) => {
            let _ = reply.send(Err(e));
            return;
         },
      };

      let address = session.address();
      debug!("Running script from {}", file.path().display());
      self.event_tx.emit(address, HubEvent::ScriptStarted);

      let done = self.run_done_tx.clone();
      let handle = tokio::spawn(async move {
         let result = session.run(file.path(), true, true).await;
         drop(file); // the temp file is gone on every exit path
         let _ = done.send(result).await;
      });

      self.running = Some(RunningScript { reply, handle });
   }

   fn handle_run_finished(&mut self, result: Result<()>) {
      let Some(running) = self.running.take() else {
         return;
      };

      let ok = result.is_ok();
      if let Some(session) = &self.session {
         self
            .event_tx
            .emit(session.address(), HubEvent::ScriptFinished { ok });
      }
      match &result {
         Ok(()) => info!("Script execution finished"),
         Err(e) => error!("Error running script: {e}"),
      }

      let _ = running
         .reply
         .send(result.map_err(|e| HubError::Run(Box::new(e))));
   }

   async fn handle_stop(&mut self) -> Result<()> {
      if self.state != LinkState::Connected {
         return Err(HubError::NotConnected);
      }
      let Some(session) = self.session.clone() else {
         return Err(HubError::NotConnected);
      };

      match session.stop_program().await {
         Ok(()) => {
            info!("Requested program stop on {}", session.address());
            Ok(())
         },
         Err(e) => {
            // No usable halt; reset the link instead. Output past this
            // point is lost and the hub is briefly unreachable.
            let address = session.address();
            warn!("Native stop on {address} failed ({e}), resetting link");
            self.handle_disconnect().await?;
            self.do_connect(address).await
         },
      }
   }

   fn status(&self) -> LinkStatus {
      LinkStatus {
         state: self.state,
         address: self.session.as_ref().map(HubSession::address),
         script_running: self.running.is_some(),
      }
   }

   async fn cleanup(&mut self) {
      if let Some(running) = self.running.take() {
         running.handle.abort();
         let _ = running.reply.send(Err(HubError::ManagerShutdown));
      }
      if let Some(session) = self.session.take() {
         if let Err(e) = session.disconnect().await {
            warn!("Error during shutdown disconnect: {e}");
         }
      }
   }
}

/// Materializes the trimmed script into a uniquely named temp file.
fn write_script_file(script: &str) -> Result<NamedTempFile> {
   let mut file = tempfile::Builder::new()
      .prefix("pybricksd-")
      .suffix(".py")
      .tempfile()?;
   file.write_all(script.trim().as_bytes())?;
   Ok(file)
}

#[cfg(test)]
mod tests {
   use std::{
      path::{Path, PathBuf},
      sync::Arc,
   };

   use parking_lot::Mutex;
   use smol_str::SmolStr;
   use tokio::{sync::Notify, time};

   use super::*;
   use crate::{event::EventBus, transport::Discovered};

   const SCAN_WINDOW: Duration = Duration::from_secs(5);

   fn addr(tail: u8) -> Address {
      Address::new([0xAA, 0xBB, 0x00, 0x00, 0x00, tail])
   }

   #[derive(Default)]
   struct MockBehavior {
      discovered: Vec<(&'static str, Address)>,
      fail_discover: bool,
      findable: Vec<Address>,
      /// Successful `connect` calls allowed; `None` means unlimited
      connect_ok_limit: Option<usize>,
      fail_run: bool,
      fail_stop: bool,
      fail_disconnect: bool,
      hold_run: bool,
      output: Vec<&'static str>,
   }

   #[derive(Default)]
   struct MockLog {
      discover_calls: usize,
      find_calls: usize,
      connect_calls: usize,
      disconnect_calls: usize,
      run_calls: usize,
      stop_calls: usize,
      run_paths: Vec<PathBuf>,
      run_scripts: Vec<String>,
   }

   struct MockShared {
      behavior: MockBehavior,
      log: MockLog,
   }

   #[derive(Clone)]
   struct MockTransport {
      shared: Arc<Mutex<MockShared>>,
      event_tx: EventSender,
      release: Arc<Notify>,
   }

   impl Transport for MockTransport {
      type Handle = Address;
      type Session = MockSession;

      async fn discover(&self, _timeout: Duration) -> Result<Vec<Discovered<Address>>> {
         let mut shared = self.shared.lock();
         shared.log.discover_calls += 1;
         if shared.behavior.fail_discover {
            return Err(HubError::RequestTimeout);
         }
         Ok(shared
            .behavior
            .discovered
            .iter()
            .map(|&(name, address)| Discovered {
               name: SmolStr::new(name),
               address,
               handle: address,
            })
            .collect())
      }

      async fn find_by_address(
         &self,
         address: Address,
         _timeout: Duration,
      ) -> Result<Option<Address>> {
         let mut shared = self.shared.lock();
         shared.log.find_calls += 1;
         Ok(shared.behavior.findable.contains(&address).then_some(address))
      }

      fn open(&self, handle: Address) -> Result<MockSession> {
         Ok(MockSession {
            address: handle,
            shared: self.shared.clone(),
            event_tx: self.event_tx.clone(),
            release: self.release.clone(),
         })
      }
   }

   #[derive(Clone)]
   struct MockSession {
      address: Address,
      shared: Arc<Mutex<MockShared>>,
      event_tx: EventSender,
      release: Arc<Notify>,
   }

   impl HubSession for MockSession {
      fn address(&self) -> Address {
         self.address
      }

      async fn connect(&self) -> Result<()> {
         let mut shared = self.shared.lock();
         shared.log.connect_calls += 1;
         match &mut shared.behavior.connect_ok_limit {
            Some(0) => Err(HubError::ConnectionLost),
            Some(n) => {
               *n -= 1;
               Ok(())
            },
            None => Ok(()),
         }
      }

      async fn disconnect(&self) -> Result<()> {
         let mut shared = self.shared.lock();
         shared.log.disconnect_calls += 1;
         if shared.behavior.fail_disconnect {
            Err(HubError::ConnectionLost)
         } else {
            Ok(())
         }
      }

      async fn run(&self, script: &Path, _wait: bool, stream_output: bool) -> Result<()> {
         let (hold, fail, output);
         {
            let mut shared = self.shared.lock();
            shared.log.run_calls += 1;
            shared.log.run_paths.push(script.to_path_buf());
            shared
               .log
               .run_scripts
               .push(std::fs::read_to_string(script).unwrap());
            hold = shared.behavior.hold_run;
            fail = shared.behavior.fail_run;
            output = shared.behavior.output.clone();
         }

         if hold {
            self.release.notified().await;
         }
         if fail {
            return Err(HubError::ConnectionLost);
         }
         if stream_output {
            for line in output {
               self
                  .event_tx
                  .emit(self.address, HubEvent::ScriptOutput(SmolStr::new(line)));
            }
         }
         Ok(())
      }

      async fn stop_program(&self) -> Result<()> {
         let mut shared = self.shared.lock();
         shared.log.stop_calls += 1;
         if shared.behavior.fail_stop {
            Err(HubError::RequestTimeout)
         } else {
            Ok(())
         }
      }
   }

   #[derive(Default)]
   struct TestBus {
      events: Mutex<Vec<(Address, HubEvent)>>,
   }

   impl EventBus for TestBus {
      fn emit(&self, address: Address, event: HubEvent) {
         self.events.lock().push((address, event));
      }
   }

   impl TestBus {
      fn output_lines(&self) -> Vec<SmolStr> {
         self
            .events
            .lock()
            .iter()
            .filter_map(|(_, e)| match e {
               HubEvent::ScriptOutput(line) => Some(line.clone()),
               _ => None,
            })
            .collect()
      }

      fn saw(&self, wanted: impl Fn(&HubEvent) -> bool) -> bool {
         self.events.lock().iter().any(|(_, e)| wanted(e))
      }
   }

   struct Harness {
      manager: HubManager,
      bus: Arc<TestBus>,
      shared: Arc<Mutex<MockShared>>,
      release: Arc<Notify>,
   }

   fn setup(behavior: MockBehavior) -> Harness {
      let bus = Arc::new(TestBus::default());
      let shared = Arc::new(Mutex::new(MockShared {
         behavior,
         log: MockLog::default(),
      }));
      let release = Arc::new(Notify::new());
      let transport = MockTransport {
         shared: shared.clone(),
         event_tx: bus.clone(),
         release: release.clone(),
      };
      let manager = HubManager::new(transport, bus.clone());
      Harness {
         manager,
         bus,
         shared,
         release,
      }
   }

   /// Sets up a harness already connected to `addr(1)`.
   async fn connected(mut behavior: MockBehavior) -> Harness {
      behavior.findable.push(addr(1));
      let h = setup(behavior);
      h.manager.connect(addr(1)).await.unwrap();
      h
   }

   async fn wait_until(mut cond: impl FnMut() -> bool) {
      for _ in 0..1000 {
         if cond() {
            return;
         }
         time::sleep(Duration::from_millis(1)).await;
      }
      panic!("condition not reached in time");
   }

   #[tokio::test]
   async fn test_scan_filters_by_firmware_marker() {
      let h = setup(MockBehavior {
         discovered: vec![
            ("Pybricks Hub", addr(1)),
            ("Other", addr(2)),
            ("Pybricks Hub", addr(1)),
         ],
         ..Default::default()
      });

      let hubs = h.manager.scan(SCAN_WINDOW).await.unwrap();
      assert_eq!(
         hubs,
         vec![HubInfo {
            name: SmolStr::new("Pybricks Hub"),
            address: addr(1),
         }]
      );
   }

   #[tokio::test]
   async fn test_scan_with_no_hubs_is_empty_not_error() {
      let h = setup(MockBehavior::default());
      assert!(h.manager.scan(SCAN_WINDOW).await.unwrap().is_empty());
   }

   #[tokio::test]
   async fn test_scan_failure_surfaces_as_scan_error() {
      let h = setup(MockBehavior {
         fail_discover: true,
         ..Default::default()
      });
      let err = h.manager.scan(SCAN_WINDOW).await.unwrap_err();
      assert!(matches!(err, HubError::Scan(_)));
   }

   #[tokio::test]
   async fn test_scan_only_while_disconnected() {
      let h = connected(MockBehavior::default()).await;
      let err = h.manager.scan(SCAN_WINDOW).await.unwrap_err();
      assert!(matches!(err, HubError::AlreadyConnected));
   }

   #[tokio::test]
   async fn test_connect_by_direct_lookup() {
      let h = setup(MockBehavior {
         findable: vec![addr(1)],
         ..Default::default()
      });

      h.manager.connect(addr(1)).await.unwrap();

      let status = h.manager.status().await.unwrap();
      assert_eq!(status.state, LinkState::Connected);
      assert_eq!(status.address, Some(addr(1)));
      assert!(h.bus.saw(|e| matches!(e, HubEvent::HubConnected)));

      let shared = h.shared.lock();
      assert_eq!(shared.log.find_calls, 1);
      assert_eq!(shared.log.discover_calls, 0);
   }

   #[tokio::test]
   async fn test_connect_falls_back_to_discovery() {
      let h = setup(MockBehavior {
         discovered: vec![("Pybricks Hub", addr(1))],
         ..Default::default()
      });

      h.manager.connect(addr(1)).await.unwrap();

      let status = h.manager.status().await.unwrap();
      assert_eq!(status.state, LinkState::Connected);
      assert_eq!(status.address, Some(addr(1)));

      let shared = h.shared.lock();
      assert_eq!(shared.log.find_calls, 1);
      assert_eq!(shared.log.discover_calls, 1);
   }

   #[tokio::test]
   async fn test_connect_unknown_address_not_found() {
      let h = setup(MockBehavior::default());

      let err = h.manager.connect(addr(9)).await.unwrap_err();
      assert!(matches!(err, HubError::DeviceNotFound(a) if a == addr(9)));

      let status = h.manager.status().await.unwrap();
      assert_eq!(status.state, LinkState::Disconnected);
      assert_eq!(status.address, None);

      // The fallback scan must have been attempted before giving up
      assert_eq!(h.shared.lock().log.discover_calls, 1);
   }

   #[tokio::test]
   async fn test_failed_hub_connect_resets_state() {
      let h = setup(MockBehavior {
         findable: vec![addr(1)],
         connect_ok_limit: Some(0),
         ..Default::default()
      });

      let err = h.manager.connect(addr(1)).await.unwrap_err();
      assert!(matches!(err, HubError::Connect(_)));

      let status = h.manager.status().await.unwrap();
      assert_eq!(status.state, LinkState::Disconnected);
      assert_eq!(status.address, None);
   }

   #[tokio::test]
   async fn test_connect_while_connected_is_rejected() {
      let h = connected(MockBehavior::default()).await;
      let err = h.manager.connect(addr(2)).await.unwrap_err();
      assert!(matches!(err, HubError::AlreadyConnected));
   }

   #[tokio::test]
   async fn test_disconnect_when_disconnected_is_noop() {
      let h = setup(MockBehavior::default());
      h.manager.disconnect().await.unwrap();
      assert_eq!(h.shared.lock().log.disconnect_calls, 0);
   }

   #[tokio::test]
   async fn test_disconnect_clears_session_despite_transport_error() {
      let h = connected(MockBehavior {
         fail_disconnect: true,
         ..Default::default()
      })
      .await;

      h.manager.disconnect().await.unwrap();

      let status = h.manager.status().await.unwrap();
      assert_eq!(status.state, LinkState::Disconnected);
      assert_eq!(status.address, None);
      assert_eq!(h.shared.lock().log.disconnect_calls, 1);
      assert!(h.bus.saw(|e| matches!(e, HubEvent::HubDisconnected)));
   }

   #[tokio::test]
   async fn test_run_requires_connection() {
      let h = setup(MockBehavior::default());
      let err = h.manager.run("print('hi')".into()).await.unwrap_err();
      assert!(matches!(err, HubError::NotConnected));
      assert_eq!(h.shared.lock().log.run_calls, 0);
   }

   #[tokio::test]
   async fn test_run_streams_output_and_stays_connected() {
      let h = connected(MockBehavior {
         output: vec!["hi"],
         ..Default::default()
      })
      .await;

      h.manager.run("print('hi')".into()).await.unwrap();

      assert_eq!(h.bus.output_lines(), vec![SmolStr::new("hi")]);
      assert!(h.bus.saw(|e| matches!(e, HubEvent::ScriptStarted)));
      assert!(h.bus.saw(|e| matches!(e, HubEvent::ScriptFinished { ok: true })));
      assert_eq!(
         h.manager.status().await.unwrap().state,
         LinkState::Connected
      );
   }

   #[tokio::test]
   async fn test_run_trims_and_removes_temp_script() {
      let h = connected(MockBehavior::default()).await;

      h.manager.run("  print('hi')\n\n".into()).await.unwrap();

      let (path, script) = {
         let shared = h.shared.lock();
         (
            shared.log.run_paths[0].clone(),
            shared.log.run_scripts[0].clone(),
         )
      };
      assert_eq!(script, "print('hi')");
      assert!(path.extension().is_some_and(|e| e == "py"));
      assert!(!path.exists());
   }

   #[tokio::test]
   async fn test_run_failure_still_removes_temp_script() {
      let h = connected(MockBehavior {
         fail_run: true,
         ..Default::default()
      })
      .await;

      let err = h.manager.run("print('hi')".into()).await.unwrap_err();
      assert!(matches!(err, HubError::Run(_)));
      assert!(h.bus.saw(|e| matches!(e, HubEvent::ScriptFinished { ok: false })));

      let path = h.shared.lock().log.run_paths[0].clone();
      assert!(!path.exists());
      // A failed run does not tear down the link by itself
      assert_eq!(
         h.manager.status().await.unwrap().state,
         LinkState::Connected
      );
   }

   #[tokio::test]
   async fn test_second_run_while_script_in_flight_is_rejected() {
      let h = connected(MockBehavior {
         hold_run: true,
         ..Default::default()
      })
      .await;

      let manager = h.manager.clone();
      let first = tokio::spawn(async move { manager.run("while True: pass".into()).await });
      {
         let shared = h.shared.clone();
         wait_until(move || shared.lock().log.run_calls == 1).await;
      }

      let err = h.manager.run("print('hi')".into()).await.unwrap_err();
      assert!(matches!(err, HubError::ScriptInProgress));
      assert!(h.manager.status().await.unwrap().script_running);

      h.release.notify_one();
      first.await.unwrap().unwrap();
      assert!(!h.manager.status().await.unwrap().script_running);
   }

   #[tokio::test]
   async fn test_stop_requires_connection() {
      let h = setup(MockBehavior::default());
      let err = h.manager.stop().await.unwrap_err();
      assert!(matches!(err, HubError::NotConnected));
   }

   #[tokio::test]
   async fn test_stop_uses_native_halt() {
      let h = connected(MockBehavior::default()).await;

      h.manager.stop().await.unwrap();

      let status = h.manager.status().await.unwrap();
      assert_eq!(status.state, LinkState::Connected);

      let shared = h.shared.lock();
      assert_eq!(shared.log.stop_calls, 1);
      assert_eq!(shared.log.disconnect_calls, 0);
      assert_eq!(shared.log.connect_calls, 1);
   }

   #[tokio::test]
   async fn test_stop_falls_back_to_link_reset() {
      let h = connected(MockBehavior {
         fail_stop: true,
         ..Default::default()
      })
      .await;

      h.manager.stop().await.unwrap();

      let status = h.manager.status().await.unwrap();
      assert_eq!(status.state, LinkState::Connected);
      assert_eq!(status.address, Some(addr(1)));

      let shared = h.shared.lock();
      assert_eq!(shared.log.stop_calls, 1);
      assert_eq!(shared.log.disconnect_calls, 1);
      assert_eq!(shared.log.connect_calls, 2);
   }

   #[tokio::test]
   async fn test_stop_reset_reconnect_failure_leaves_disconnected() {
      let h = connected(MockBehavior {
         fail_stop: true,
         connect_ok_limit: Some(1),
         ..Default::default()
      })
      .await;

      let err = h.manager.stop().await.unwrap_err();
      assert!(matches!(err, HubError::Connect(_)));

      let status = h.manager.status().await.unwrap();
      assert_eq!(status.state, LinkState::Disconnected);
      assert_eq!(status.address, None);
   }
}
