/*!
    A cyclic EtherCAT master.

    The master builds a device tree from a scanned topology and device descriptions, binds the slaves' process data into one process image, and exchanges it with the segment at a fixed period. Acyclic access to the slaves' object dictionaries goes through a CoE mailbox channel, shared with the cyclic exchange on the same transport.

    The main entry point is [Master], the lower levels are exposed for applications needing a finer control:

    - [RawMaster] sends PDUs and is not protocol-safe
    - [MailboxChannel] runs sdo requests with retries
    - [CyclicScheduler] drives the bus states and the cyclic exchange
    - [SimulatedSegment] answers frames like a chain of slaves, for tests and development without hardware
*/

mod socket;
pub mod data;
mod rawmaster;
pub mod registers;
mod mailbox;
mod sdo;
mod can;
mod error;
mod clock;
mod config;
mod channel;
pub mod tree;
mod image;
mod hooks;
mod slave;
mod mapping;
pub mod scheduler;
mod master;

pub use crate::data::{PduData, Field, DataType};
pub use crate::socket::*;
pub use crate::rawmaster::{RawMaster, SlaveAddress, Pdu, PduAnswer, PduCommand};
pub use crate::registers::AlState;
pub use crate::error::{EthercatError, EthercatResult};
pub use crate::can::SdoAbortCode;
pub use crate::sdo::{Sdo, SdoPart, SdoRequest, SdoOperation};
pub use crate::clock::{Clock, SystemClock, SimulatedClock};
pub use crate::config::{MasterConfig, MailboxConfig, WatchdogConfig};
pub use crate::channel::{MailboxChannel, RequestState};
pub use crate::tree::{ScanResult, ScannedSlave, Direction, Variable, Pdo, DeviceDescription, DescriptorStore, Descriptors, SlaveNode, ProcessLayout, VariableInfo, SlaveMapping};
pub use crate::image::{ProcessImage, Snapshot, VariableHandle, BoundVariable};
pub use crate::hooks::{HookPolicy, InitHook, HookFn, HookRegistry, HookReport};
pub use crate::slave::{Slave, CommunicationState};
pub use crate::mapping::{Group, fmmu_entries};
pub use crate::scheduler::{CyclicScheduler, MasterState, CycleStats, Cancellation, FaultCallback};
pub use crate::master::{Master, MasterHandle};
