//! Pybricks hub D-Bus service
//!
//! This service exposes a D-Bus interface for scanning, connecting to,
//! and running MicroPython scripts on LEGO hubs flashed with Pybricks
//! firmware, streaming script output back as signals.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::transport::BleTransport;
use dbus::ManagerService;
use event::{EventBus, HubEvent};
use manager::HubManager;

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod manager;
mod pybricks;
mod transport;

use crate::{dbus::ManagerServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting pybricksd D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;

   // Create event channel
   let event_bus = EventProcessor::new();

   // Create the transport and the hub manager on top of it
   let transport = BleTransport::new(event_bus.clone()).await?;
   let manager = HubManager::new(transport, event_bus.clone());

   // Create D-Bus service
   let service = ManagerService::new(manager.clone(), config.clone());

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.pybricksd")?
      .serve_at("/org/pybricksd/manager", service)?
      .build()
      .await?;

   info!("pybricksd D-Bus service started at org.pybricksd");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   if let Some(address) = &config.auto_connect_address {
      match address.parse::<Address>() {
         Ok(addr) => {
            if let Err(e) = manager.connect(addr).await {
               warn!("Auto-connect to {address} failed: {e}");
            }
         },
         Err(e) => warn!("Ignoring invalid auto_connect_address {address:?}: {e}"),
      }
   }

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down pybricksd service...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(Address, HubEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(Address, HubEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<ManagerService>,
      (address, event): (Address, HubEvent),
   ) -> Result<()> {
      let addr = address.to_string();
      match event {
         HubEvent::HubConnected => {
            iface.hub_connected(&addr).await?;
         },
         HubEvent::HubDisconnected => {
            iface.hub_disconnected(&addr).await?;
         },
         HubEvent::ScriptStarted => {
            iface.script_started(&addr).await?;
         },
         HubEvent::ScriptFinished { ok } => {
            iface.script_finished(&addr, ok).await?;
         },
         HubEvent::ScriptOutput(line) => {
            iface.script_output(&addr, &line).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, ManagerService>("/org/pybricksd/manager")
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, address: Address, event: HubEvent) {
      self.queue.push((address, event));
      self.notifier.notify_waiters();
   }
}
