//! Pybricks hub session implementation and state management.
//!
//! This module provides the [`PybricksSession`] type which wraps one raw
//! BLE device handle into a stateful session: GATT setup, program
//! transfer, run-to-completion tracking, and stdout streaming.

use std::{
   path::Path,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::{
   Address, Device,
   gatt::remote::{Characteristic, Service},
};
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   sync::{RwLock, watch},
   task::JoinHandle,
   time,
};

use crate::{
   error::{HubError, Result},
   event::{EventSender, HubEvent},
   pybricks::protocol::{
      self, COMMAND_EVENT_UUID, Event, HUB_CAPABILITIES_UUID, HubCapabilities,
      PYBRICKS_SERVICE_UUID, user_program_running,
   },
   transport::HubSession,
};

/// Maximum time to wait for the BLE link to come up
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
/// Maximum time to wait for GATT service resolution after connect
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval while waiting for service resolution
const RESOLVE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Time allowed between program start and the first running status report
const PROGRAM_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Internal state for an active GATT link.
struct Link {
   command: Characteristic,
   caps: HubCapabilities,
   reader: JoinHandle<()>,
}

impl Drop for Link {
   fn drop(&mut self) {
      self.reader.abort();
   }
}

struct Inner {
   device: Device,
   address: Address,
   event_tx: EventSender,
   /// Latest status flags reported by the hub
   status: watch::Sender<u32>,
   /// Set by the reader when the notification stream dies
   lost: Arc<AtomicBool>,
   /// Whether stdout lines are currently forwarded to the event sink
   streaming: Arc<AtomicBool>,
   buffer: Arc<Mutex<OutputBuffer>>,
   link: RwLock<Option<Link>>,
}

/// A session with one Pybricks hub, built from a raw `bluer` device
/// handle. Cheaply cloneable; all clones share the same link.
#[derive(Clone)]
pub struct PybricksSession(Arc<Inner>);

impl PybricksSession {
   pub fn new(device: Device, event_tx: EventSender) -> Self {
      let address = device.address();
      let (status, _) = watch::channel(0);
      Self(Arc::new(Inner {
         device,
         address,
         event_tx,
         status,
         lost: Arc::new(AtomicBool::new(false)),
         streaming: Arc::new(AtomicBool::new(false)),
         buffer: Arc::new(Mutex::new(OutputBuffer::new())),
         link: RwLock::new(None),
      }))
   }

   async fn transfer_and_wait(
      &self,
      command: &Characteristic,
      caps: &HubCapabilities,
      program: &[u8],
      wait: bool,
      status_rx: &mut watch::Receiver<u32>,
   ) -> Result<()> {
      let inner = &*self.0;

      // Invalidate any stored program before overwriting it
      write_command(inner.address, command, &protocol::write_user_program_meta(0)).await?;

      let chunk_size = caps.chunk_size().max(1);
      for (i, chunk) in program.chunks(chunk_size).enumerate() {
         let offset = (i * chunk_size) as u32;
         write_command(inner.address, command, &protocol::write_user_ram(offset, chunk)).await?;
      }

      write_command(
         inner.address,
         command,
         &protocol::write_user_program_meta(program.len() as u32),
      )
      .await?;

      info!(
         "Starting program on {} ({} bytes)",
         inner.address,
         program.len()
      );
      write_command(inner.address, command, &protocol::start_user_program()).await?;

      if !wait {
         return Ok(());
      }

      // A short program can finish before its first status report makes it
      // through; a missed start is treated as completion.
      match time::timeout(
         PROGRAM_START_TIMEOUT,
         inner.wait_user_program(status_rx, true),
      )
      .await
      {
         Ok(res) => res?,
         Err(_) => {
            debug!(
               "Program start on {} not observed; assuming it already finished",
               inner.address
            );
            return Ok(());
         },
      }

      inner.wait_user_program(status_rx, false).await
   }
}

impl HubSession for PybricksSession {
   fn address(&self) -> Address {
      self.0.address
   }

   async fn connect(&self) -> Result<()> {
      let inner = &*self.0;
      let device = &inner.device;

      if !device.is_connected().await? {
         debug!("Connecting to {}", inner.address);
         time::timeout(CONNECT_TIMEOUT, device.connect())
            .await
            .map_err(|_| HubError::RequestTimeout)??;
      }

      let deadline = time::Instant::now() + RESOLVE_TIMEOUT;
      while !device.is_services_resolved().await? {
         if time::Instant::now() >= deadline {
            return Err(HubError::RequestTimeout);
         }
         time::sleep(RESOLVE_POLL_INTERVAL).await;
      }

      let (command, caps_char) = find_characteristics(device).await?;
      let caps = HubCapabilities::parse(&caps_char.read().await?)?;
      debug!("Hub capabilities of {}: {caps:?}", inner.address);

      let events = command.notify().await?.boxed();
      inner.lost.store(false, Ordering::Relaxed);
      let reader = tokio::spawn(pump_events(
         inner.address,
         events,
         inner.status.clone(),
         inner.lost.clone(),
         inner.streaming.clone(),
         inner.buffer.clone(),
         inner.event_tx.clone(),
      ));

      *inner.link.write().await = Some(Link {
         command,
         caps,
         reader,
      });
      info!("Connected to Pybricks hub {}", inner.address);
      Ok(())
   }

   async fn disconnect(&self) -> Result<()> {
      let inner = &*self.0;
      drop(inner.link.write().await.take());
      debug!("Disconnecting from {}", inner.address);
      inner.device.disconnect().await?;
      Ok(())
   }

   async fn run(&self, script: &Path, wait: bool, stream_output: bool) -> Result<()> {
      let inner = &*self.0;
      let (command, caps) = {
         let guard = inner.link.read().await;
         let link = guard.as_ref().ok_or(HubError::NotConnected)?;
         (link.command.clone(), link.caps)
      };

      let program = tokio::fs::read(script).await?;
      if program.len() > caps.max_program_size as usize {
         return Err(HubError::ProgramTooLarge {
            size: program.len(),
            max: caps.max_program_size as usize,
         });
      }

      inner.buffer.lock().clear();
      inner.streaming.store(stream_output, Ordering::Relaxed);
      let mut status_rx = inner.status.subscribe();

      let result = self
         .transfer_and_wait(&command, &caps, &program, wait, &mut status_rx)
         .await;

      inner.streaming.store(false, Ordering::Relaxed);
      // Whatever the program printed without a trailing newline still counts
      if stream_output && let Some(rest) = inner.buffer.lock().take_remainder() {
         inner.event_tx.emit(inner.address, HubEvent::ScriptOutput(rest));
      }

      result
   }

   async fn stop_program(&self) -> Result<()> {
      let inner = &*self.0;
      let command = {
         let guard = inner.link.read().await;
         guard
            .as_ref()
            .ok_or(HubError::NotConnected)?
            .command
            .clone()
      };

      info!("Stopping user program on {}", inner.address);
      write_command(inner.address, &command, &protocol::stop_user_program()).await
   }
}

impl Inner {
   async fn wait_user_program(
      &self,
      rx: &mut watch::Receiver<u32>,
      running: bool,
   ) -> Result<()> {
      loop {
         if self.lost.load(Ordering::Relaxed) {
            return Err(HubError::ConnectionLost);
         }
         if user_program_running(*rx.borrow_and_update()) == running {
            return Ok(());
         }
         rx.changed().await.map_err(|_| HubError::ConnectionLost)?;
      }
   }
}

async fn write_command(address: Address, command: &Characteristic, pkt: &[u8]) -> Result<()> {
   debug!("→ {address}: {}", hex::encode(pkt));
   command.write(pkt).await?;
   Ok(())
}

async fn find_characteristics(device: &Device) -> Result<(Characteristic, Characteristic)> {
   for service in device.services().await? {
      if !is_pybricks_service(&service).await? {
         continue;
      }

      let mut command = None;
      let mut capabilities = None;
      for characteristic in service.characteristics().await? {
         let uuid = characteristic.uuid().await?;
         if uuid == COMMAND_EVENT_UUID {
            command = Some(characteristic);
         } else if uuid == HUB_CAPABILITIES_UUID {
            capabilities = Some(characteristic);
         }
      }

      if let (Some(command), Some(capabilities)) = (command, capabilities) {
         return Ok((command, capabilities));
      }
   }

   Err(HubError::ServiceNotFound)
}

async fn is_pybricks_service(service: &Service) -> Result<bool> {
   Ok(service.uuid().await? == PYBRICKS_SERVICE_UUID)
}

async fn pump_events(
   address: Address,
   mut events: impl Stream<Item = Vec<u8>> + Unpin + Send + 'static,
   status: watch::Sender<u32>,
   lost: Arc<AtomicBool>,
   streaming: Arc<AtomicBool>,
   buffer: Arc<Mutex<OutputBuffer>>,
   event_tx: EventSender,
) {
   while let Some(data) = events.next().await {
      debug!("← {address}: {}", hex::encode(&data));
      match Event::parse(&data) {
         Ok(Event::Status { flags }) => {
            status.send_replace(flags);
         },
         Ok(Event::Stdout(payload)) => {
            let lines = buffer.lock().push(&payload);
            if streaming.load(Ordering::Relaxed) {
               for line in lines {
                  event_tx.emit(address, HubEvent::ScriptOutput(line));
               }
            }
         },
         Err(e) => warn!("Ignoring malformed event from {address}: {e}"),
      }
   }

   warn!("Event stream from {address} ended");
   lost.store(true, Ordering::Relaxed);
   // Wake anyone blocked on a status transition
   status.send_replace(0);
}

/// Reassembles hub stdout chunks into lines.
///
/// Stdout events carry raw bytes with no line alignment; bytes that are
/// not valid UTF-8 are replaced rather than failing the run.
pub(crate) struct OutputBuffer {
   buf: Vec<u8>,
}

impl OutputBuffer {
   pub(crate) const fn new() -> Self {
      Self { buf: Vec::new() }
   }

   /// Appends a chunk and returns the lines it completed.
   pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<SmolStr> {
      self.buf.extend_from_slice(chunk);

      let mut lines = Vec::new();
      while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
         let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
         line.pop();
         if line.last() == Some(&b'\r') {
            line.pop();
         }
         lines.push(decode(&line));
      }
      lines
   }

   /// Takes the unterminated tail, if any.
   pub(crate) fn take_remainder(&mut self) -> Option<SmolStr> {
      if self.buf.is_empty() {
         return None;
      }
      let rest = decode(&self.buf);
      self.buf.clear();
      Some(rest)
   }

   pub(crate) fn clear(&mut self) {
      self.buf.clear();
   }
}

fn decode(bytes: &[u8]) -> SmolStr {
   SmolStr::new(String::from_utf8_lossy(bytes))
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_lines_split_across_chunks() {
      let mut buffer = OutputBuffer::new();
      assert!(buffer.push(b"hel").is_empty());
      assert_eq!(buffer.push(b"lo\nwor"), vec![SmolStr::new("hello")]);
      assert_eq!(buffer.push(b"ld\n"), vec![SmolStr::new("world")]);
      assert!(buffer.take_remainder().is_none());
   }

   #[test]
   fn test_multiple_lines_in_one_chunk() {
      let mut buffer = OutputBuffer::new();
      assert_eq!(
         buffer.push(b"a\r\nb\nc"),
         vec![SmolStr::new("a"), SmolStr::new("b")]
      );
      assert_eq!(buffer.take_remainder(), Some(SmolStr::new("c")));
      assert!(buffer.take_remainder().is_none());
   }

   #[test]
   fn test_invalid_utf8_is_replaced() {
      let mut buffer = OutputBuffer::new();
      let lines = buffer.push(b"ok \xFF\xFE\n");
      assert_eq!(lines.len(), 1);
      assert_eq!(lines[0], SmolStr::new("ok \u{FFFD}\u{FFFD}"));
   }

   #[test]
   fn test_clear_discards_partial_line() {
      let mut buffer = OutputBuffer::new();
      buffer.push(b"stale");
      buffer.clear();
      assert!(buffer.take_remainder().is_none());
   }
}
