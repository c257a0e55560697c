//! Pybricks BLE profile definitions and frame handling.
//!
//! This module contains the GATT UUIDs, command builders, and event
//! parsing for the command/event characteristic exposed by Pybricks
//! firmware. Only the subset needed to transfer, start, stop, and observe
//! a user program is covered.

use smallvec::{SmallVec, smallvec};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{HubError, Result};

pub type Packet = SmallVec<[u8; 32]>;

/// Pybricks GATT service
pub const PYBRICKS_SERVICE_UUID: Uuid = Uuid::from_u128(0xc5f50001_8280_46da_89f4_6d8051e4aeef);
/// Command/event characteristic (write commands, notified events)
pub const COMMAND_EVENT_UUID: Uuid = Uuid::from_u128(0xc5f50002_8280_46da_89f4_6d8051e4aeef);
/// Hub capabilities characteristic (read-only)
pub const HUB_CAPABILITIES_UUID: Uuid = Uuid::from_u128(0xc5f50003_8280_46da_89f4_6d8051e4aeef);

/// Bytes of framing in a `WriteUserRam` command (opcode + u32 offset).
pub const WRITE_USER_RAM_OVERHEAD: usize = 5;

/// Commands accepted by the command/event characteristic.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum Command {
   StopUserProgram = 0x00,
   StartUserProgram = 0x01,
   StartRepl = 0x02,
   WriteUserProgramMeta = 0x03,
   WriteUserRam = 0x04,
   RebootToUpdateMode = 0x05,
   WriteStdin = 0x06,
}

pub fn stop_user_program() -> Packet {
   smallvec![Command::StopUserProgram as u8]
}

pub fn start_user_program() -> Packet {
   smallvec![Command::StartUserProgram as u8]
}

/// Declares the size of the stored user program. Writing zero invalidates
/// the slot, which is required before a new transfer begins.
pub fn write_user_program_meta(size: u32) -> Packet {
   let mut pkt = Packet::new();
   pkt.push(Command::WriteUserProgramMeta as u8);
   pkt.extend_from_slice(&size.to_le_bytes());
   pkt
}

/// Copies one chunk of the program into hub RAM at the given offset.
pub fn write_user_ram(offset: u32, payload: &[u8]) -> Packet {
   let mut pkt = Packet::with_capacity(WRITE_USER_RAM_OVERHEAD + payload.len());
   pkt.push(Command::WriteUserRam as u8);
   pkt.extend_from_slice(&offset.to_le_bytes());
   pkt.extend_from_slice(payload);
   pkt
}

// Hub status flag bits, reported in every status event.
pub const FLAG_BATTERY_LOW_WARNING: u32 = 1 << 0;
pub const FLAG_BATTERY_LOW_SHUTDOWN: u32 = 1 << 1;
pub const FLAG_BATTERY_HIGH_CURRENT: u32 = 1 << 2;
pub const FLAG_BLE_ADVERTISING: u32 = 1 << 3;
pub const FLAG_BLE_LOW_SIGNAL: u32 = 1 << 4;
pub const FLAG_POWER_BUTTON_PRESSED: u32 = 1 << 5;
pub const FLAG_USER_PROGRAM_RUNNING: u32 = 1 << 6;
pub const FLAG_SHUTDOWN: u32 = 1 << 7;

pub const fn user_program_running(flags: u32) -> bool {
   flags & FLAG_USER_PROGRAM_RUNNING != 0
}

/// Events notified on the command/event characteristic.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
enum EventKind {
   StatusReport = 0x00,
   WriteStdout = 0x01,
}

/// A parsed hub event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
   /// Current status flags. Newer firmware appends the running program
   /// slot after the flags; anything past the first four bytes is ignored.
   Status { flags: u32 },
   /// Raw bytes the user program printed. Not line-aligned.
   Stdout(Packet),
}

/// Error type for protocol parsing.
#[derive(Error, Debug)]
pub enum ProtoError {
   /// Notification with no opcode byte
   #[error("Empty event packet")]
   EmptyPacket,

   /// Opcode not covered by this profile version
   #[error("Unknown event: 0x{opcode:02x}")]
   UnknownEvent { opcode: u8 },

   /// Packet is too short for the expected format
   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },
}

impl From<ProtoError> for HubError {
   fn from(err: ProtoError) -> Self {
      Self::InvalidPacket(err.to_string())
   }
}

impl Event {
   pub fn parse(data: &[u8]) -> Result<Self> {
      let (&opcode, payload) = data.split_first().ok_or(ProtoError::EmptyPacket)?;

      match EventKind::from_repr(opcode) {
         Some(EventKind::StatusReport) => {
            if payload.len() < 4 {
               return Err(
                  ProtoError::PacketTooShort {
                     expected: 5,
                     actual: data.len(),
                  }
                  .into(),
               );
            }
            let flags = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            Ok(Self::Status { flags })
         },
         Some(EventKind::WriteStdout) => Ok(Self::Stdout(Packet::from_slice(payload))),
         None => Err(ProtoError::UnknownEvent { opcode }.into()),
      }
   }
}

/// Static capabilities read once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubCapabilities {
   /// Largest value accepted in one characteristic write.
   pub max_write_size: u16,
   pub feature_flags: u32,
   /// Largest user program the hub can store.
   pub max_program_size: u32,
}

impl HubCapabilities {
   pub fn parse(data: &[u8]) -> Result<Self> {
      if data.len() < 10 {
         return Err(
            ProtoError::PacketTooShort {
               expected: 10,
               actual: data.len(),
            }
            .into(),
         );
      }

      Ok(Self {
         max_write_size: u16::from_le_bytes([data[0], data[1]]),
         feature_flags: u32::from_le_bytes([data[2], data[3], data[4], data[5]]),
         max_program_size: u32::from_le_bytes([data[6], data[7], data[8], data[9]]),
      })
   }

   /// Program bytes that fit into one `WriteUserRam` command.
   pub fn chunk_size(&self) -> usize {
      (self.max_write_size as usize).saturating_sub(WRITE_USER_RAM_OVERHEAD)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_build_write_user_ram() {
      let pkt = write_user_ram(0x0102_0304, &[0xAA, 0xBB]);
      assert_eq!(&pkt[..], &[0x04, 0x04, 0x03, 0x02, 0x01, 0xAA, 0xBB]);
   }

   #[test]
   fn test_build_program_meta() {
      assert_eq!(&write_user_program_meta(0)[..], &[0x03, 0, 0, 0, 0]);
      assert_eq!(
         &write_user_program_meta(0x2000)[..],
         &[0x03, 0x00, 0x20, 0x00, 0x00]
      );
   }

   #[test]
   fn test_parse_status_report() {
      let event = Event::parse(&[0x00, 0x40, 0x00, 0x00, 0x00]).unwrap();
      assert_eq!(
         event,
         Event::Status {
            flags: FLAG_USER_PROGRAM_RUNNING
         }
      );
      assert!(user_program_running(FLAG_USER_PROGRAM_RUNNING));
      assert!(!user_program_running(FLAG_BLE_ADVERTISING));
   }

   #[test]
   fn test_parse_status_report_with_program_slot() {
      // Profile v1.3 appends the running slot; the flags still come first
      let event = Event::parse(&[0x00, 0x48, 0x00, 0x00, 0x00, 0x01]).unwrap();
      assert_eq!(event, Event::Status { flags: 0x48 });
   }

   #[test]
   fn test_parse_stdout() {
      let event = Event::parse(b"\x01hi\n").unwrap();
      assert_eq!(event, Event::Stdout(Packet::from_slice(b"hi\n")));
   }

   #[test]
   fn test_parse_rejects_malformed() {
      assert!(Event::parse(&[]).is_err());
      assert!(Event::parse(&[0x00, 0x40]).is_err());
      assert!(Event::parse(&[0x7F, 0x00]).is_err());
   }

   #[test]
   fn test_parse_capabilities() {
      let caps =
         HubCapabilities::parse(&[0x9A, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x7E, 0x00, 0x00])
            .unwrap();
      assert_eq!(caps.max_write_size, 0x9A);
      assert_eq!(caps.feature_flags, 1);
      assert_eq!(caps.max_program_size, 0x7E00);
      assert_eq!(caps.chunk_size(), 0x9A - WRITE_USER_RAM_OVERHEAD);
   }

   #[test]
   fn test_parse_capabilities_too_short() {
      assert!(HubCapabilities::parse(&[0x9A, 0x00]).is_err());
   }
}
