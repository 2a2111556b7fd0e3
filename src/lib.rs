//! BACnet MS/TP (Master-Slave/Token-Passing) datalink implementation.
//!
//! This crate implements the MS/TP data link layer of ASHRAE 135 Clause 9
//! as used by BACnet devices on RS-485 buses. Two cooperating state
//! machines drive a half-duplex serial line: a byte-paced receive machine
//! that decodes the octet stream into CRC-checked frames, and a master node
//! machine that participates in token rotation, polls for new masters,
//! transmits queued PDUs and answers confirmed requests. On top of them,
//! [`MstpDataLink`] offers the datagram service a BACnet network layer
//! expects: best-effort send, receive with timeout, and address
//! configuration.
//!
//! ```no_run
//! use bacnet_mstp::{MstpConfig, MstpDataLink};
//!
//! # fn main() -> bacnet_mstp::datalink::Result<()> {
//! let config = MstpConfig {
//!     station_address: 42,
//!     ..MstpConfig::default()
//! };
//! let link = MstpDataLink::open("/dev/ttyUSB0", config)?;
//!
//! let mut pdu = [0u8; 501];
//! let mut source = bacnet_mstp::BacnetAddress::default();
//! let len = link.receive(Some(&mut source), &mut pdu, 1000);
//! if len > 0 {
//!     println!("received {} octets from {:?}", len, source.mstp_station());
//! }
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod crc;
pub mod datalink;
pub mod frame;
pub mod master;
pub mod npdu;
pub mod port;
pub mod queue;
pub mod receive;
pub mod rs485;
pub mod timer;

// Re-export main types without glob imports to avoid conflicts
pub use address::BacnetAddress;
pub use datalink::{DataLinkError, MstpDataLink};
pub use frame::{FrameType, BROADCAST_ADDRESS, MAX_DATA_LENGTH, MAX_FRAME_SIZE};
pub use port::{MstpConfig, MstpStatistics};

/// NPDU protocol version carried by every published BACnet revision.
pub const BACNET_PROTOCOL_VERSION: u8 = 1;
