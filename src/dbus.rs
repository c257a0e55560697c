use std::{str::FromStr, time::Duration};

use bluer::Address;
use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   config::Config,
   manager::{HubManager, LinkState},
   transport::HubInfo,
};

pub struct ManagerService {
   manager: HubManager,
   config: Config,
}

impl ManagerService {
   pub const fn new(manager: HubManager, config: Config) -> Self {
      Self { manager, config }
   }
}

#[interface(name = "org.pybricksd.Manager")]
impl ManagerService {
   async fn scan(&self, timeout_sec: f64) -> zbus::fdo::Result<String> {
      if !timeout_sec.is_finite() || timeout_sec < 0.0 {
         return Err(zbus::fdo::Error::InvalidArgs(format!(
            "Invalid scan timeout: {timeout_sec}"
         )));
      }
      let timeout = if timeout_sec > 0.0 {
         Duration::from_secs_f64(timeout_sec)
      } else {
         self.config.scan_timeout()
      };

      let hubs = self
         .manager
         .scan(timeout)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      let hubs: Vec<serde_json::Value> = hubs.iter().map(HubInfo::to_json).collect();
      Ok(serde_json::to_string(&hubs).unwrap())
   }

   async fn connect(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr =
         Address::from_str(&address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      self
         .manager
         .connect(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   async fn disconnect(&self) -> zbus::fdo::Result<bool> {
      self
         .manager
         .disconnect()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   /// Uploads the script to the connected hub and runs it to completion.
   /// Output is delivered through `script_output` signals while running.
   async fn run_script(&self, script: String) -> zbus::fdo::Result<bool> {
      info!("Running user script ({} bytes)", script.len());

      self
         .manager
         .run(script)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   async fn stop_script(&self) -> zbus::fdo::Result<bool> {
      self
         .manager
         .stop()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn hub_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn hub_disconnected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn script_started(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn script_finished(
      emitter: &SignalEmitter<'_>,
      address: &str,
      ok: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn script_output(
      emitter: &SignalEmitter<'_>,
      address: &str,
      line: &str,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn status(&self) -> String {
      match self.manager.status().await {
         Ok(status) => status.to_json().to_string(),
         Err(_) => String::new(),
      }
   }

   #[zbus(property)]
   async fn connected(&self) -> bool {
      self
         .manager
         .status()
         .await
         .is_ok_and(|s| s.state == LinkState::Connected)
   }
}
