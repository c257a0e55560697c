//! BlueZ-backed transport for hub discovery and connection.
//!
//! Discovery runs for a bounded window over the adapter's device event
//! stream; names are resolved once the window closes so slow advertisement
//! parsing does not eat into it.

use std::{collections::HashSet, time::Duration};

use bluer::{Adapter, AdapterEvent, Address, Device, Session};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::{select, time};

use crate::{
   error::Result,
   event::EventSender,
   pybricks::session::PybricksSession,
   transport::{Discovered, Transport},
};

/// Production transport backed by the system BlueZ daemon.
pub struct BleTransport {
   adapter: Adapter,
   event_tx: EventSender,
}

impl BleTransport {
   /// Opens the default adapter and powers it on if needed.
   pub async fn new(event_tx: EventSender) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = session.default_adapter().await?;

      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter {}", adapter.name());
      }

      Ok(Self { adapter, event_tx })
   }
}

impl Transport for BleTransport {
   type Handle = Device;
   type Session = PybricksSession;

   async fn discover(&self, timeout: Duration) -> Result<Vec<Discovered<Device>>> {
      debug!("Scanning for devices ({timeout:?})");
      let mut events = self.adapter.discover_devices().await?;

      let mut seen = HashSet::new();
      let mut addresses = Vec::new();
      let deadline = time::sleep(timeout);
      tokio::pin!(deadline);

      loop {
         select! {
             () = &mut deadline => break,
             event = events.next() => {
                 match event {
                     Some(AdapterEvent::DeviceAdded(addr)) => {
                         if seen.insert(addr) {
                             addresses.push(addr);
                         }
                     },
                     Some(_) => {},
                     None => break,
                 }
             }
         }
      }
      drop(events);

      let mut found = Vec::with_capacity(addresses.len());
      for addr in addresses {
         let Ok(device) = self.adapter.device(addr) else {
            continue;
         };
         let name = match device.name().await {
            Ok(name) => name.unwrap_or_default(),
            Err(e) => {
               warn!("Could not read name of {addr}: {e}");
               String::new()
            },
         };
         found.push(Discovered {
            name: name.into(),
            address: addr,
            handle: device,
         });
      }

      debug!("Scan finished with {} devices", found.len());
      Ok(found)
   }

   async fn find_by_address(&self, address: Address, timeout: Duration) -> Result<Option<Device>> {
      debug!("Looking for {address} ({timeout:?})");
      let mut events = self.adapter.discover_devices().await?;

      let deadline = time::sleep(timeout);
      tokio::pin!(deadline);

      loop {
         select! {
             () = &mut deadline => return Ok(None),
             event = events.next() => {
                 match event {
                     Some(AdapterEvent::DeviceAdded(addr)) if addr == address => {
                         return Ok(Some(self.adapter.device(addr)?));
                     },
                     Some(_) => {},
                     None => return Ok(None),
                 }
             }
         }
      }
   }

   fn open(&self, handle: Device) -> Result<PybricksSession> {
      Ok(PybricksSession::new(handle, self.event_tx.clone()))
   }
}
