use crate::{
    rawmaster::{RawMaster, SlaveAddress},
    data::{PduData, Field},
    registers::{self, AlState, AlControlRequest},
    clock::Clock,
    error::{EthercatError, EthercatResult},
    };
use std::sync::Arc;
use core::time::Duration;
use log::{debug, warn};


pub type CommunicationState = registers::AlState;


/**
    This struct exposes the master functions addressing one slave.

    It does not hold any lock on the slave: it only remembers the address in use and the state the slave is expected to be in, so the master can detect a slave that left the expected state.

    ## Example

    The following is the configuration sequence of a slave

    ```ignore
    let mut slave = Slave::new(raw, SlaveAddress::AutoIncremented(position));
    slave.set_address(station)?;
    slave.switch(CommunicationState::PreOperational, timeout, &clock)?;
    // mailbox configuration and mapping
    slave.switch(CommunicationState::SafeOperational, timeout, &clock)?;
    slave.switch(CommunicationState::Operational, timeout, &clock)?;
    ```
*/
pub struct Slave {
    master: Arc<RawMaster>,
    /// current address in use, fixed or topological
    address: SlaveAddress,
    /// assumed current state
    state: CommunicationState,
}
impl Slave {
    pub fn new(master: Arc<RawMaster>, address: SlaveAddress) -> Self {
        Self {
            master,
            address,
            state: CommunicationState::Init,
        }
    }

    /// return the current state of the slave, it does not the current expected state for this slave
    pub fn state(&self) -> EthercatResult<CommunicationState> {
        self.master.read(self.address, registers::al::status)?.one()?
            .current()
            .map_err(|_| EthercatError::Protocol("undefined slave state"))
    }
    /**
        send a state change request to the slave, and return once the slave has switched

        Fails with [EthercatError::State] if the slave refuses the transition, and with [EthercatError::Timeout] if it did not reach the target state in time.
    */
    pub fn switch(&mut self, target: CommunicationState, timeout: Duration, clock: &dyn Clock) -> EthercatResult  {
        self.master.write(self.address, registers::al::control, AlControlRequest::request(target))?.one()?;

        let deadline = clock.now() + timeout;
        loop {
            let status = self.master.read(self.address, registers::al::status)?.one()?;
            if status.error() {
                let code = self.master.read(self.address, registers::al::error)?.one()?;
                warn!("slave {:?} refused switching to {}, error code 0x{:04x}", self.address, target, code);
                return Err(EthercatError::State("slave refused the state transition"))
            }
            if status.current().ok() == Some(target)  {break}
            if clock.now() >= deadline {
                return Err(EthercatError::Timeout("slave did not reach requested state"))
            }
            clock.sleep(Duration::from_millis(1));
        }
        debug!("slave {:?} switched to {}", self.address, target);
        self.state = target;
		Ok(())
    }
    /**
        set the expected state of the slave.

        this actually does not perform any operation on the slave, but will change the expected behavior and thus error handling of the slave's methods
    */
    pub fn expect(&mut self, state: CommunicationState) {
        self.state = state;
    }
    /// expected state of the slave
    pub fn expected(&self) -> CommunicationState {
        self.state
    }

    /// get the current address used to communicate with the slave
    pub fn address(&self) -> SlaveAddress  {self.address}
    /// the fixed address of the slave, if already set
    pub fn station(&self) -> Option<u16> {
        match self.address {
            SlaveAddress::Fixed(station) => Some(station),
            _ => None,
        }
    }
    /// set a fixed address for the slave and check the slave reports it back, `0` is forbidden
    pub fn set_address(&mut self, fixed: u16) -> EthercatResult {
        if fixed == 0
            {return Err(EthercatError::Configuration("station address 0 is reserved".into()))}
        self.master.write(self.address, registers::address::fixed, fixed)?.one()?;
        let new = SlaveAddress::Fixed(fixed);
        let confirmed = self.master.read(new, registers::address::fixed)?.one()?;
        if confirmed != fixed {
            return Err(EthercatError::Protocol("slave did not confirm its fixed address"))
        }
        self.address = new;
        Ok(())
    }

    /// read a value from the slave's physical memory
    pub fn physical_read<T: PduData>(&self, field: Field<T>) -> EthercatResult<T>  {
        self.master.read(self.address, field)?.one()
    }
    /// write a value to the slave's physical memory
    pub fn physical_write<T: PduData>(&self, field: Field<T>, value: T) -> EthercatResult  {
        self.master.write(self.address, field, value)?.one()
    }
}

impl AlState {
    /// states to go through to reach `target` from `self`, stepping up one state at a time or going down at once
    pub fn path(self, target: Self) -> Vec<Self> {
        const UP: [AlState; 4] = [AlState::Init, AlState::PreOperational, AlState::SafeOperational, AlState::Operational];
        if target.rank() <= self.rank() {
            return vec![target]
        }
        UP.iter().copied()
            .filter(|state| state.rank() > self.rank() && state.rank() <= target.rank())
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        socket::{SimulatedSegment, SimulatedSlave},
        clock::SimulatedClock,
        };

    #[test]
    fn state_path() {
        assert_eq!(AlState::Init.path(AlState::SafeOperational), [AlState::PreOperational, AlState::SafeOperational]);
        assert_eq!(AlState::Operational.path(AlState::Init), [AlState::Init]);
        assert_eq!(AlState::SafeOperational.path(AlState::SafeOperational), [AlState::SafeOperational]);
    }

    #[test]
    fn addressing_and_switch() {
        let segment = SimulatedSegment::new(vec![SimulatedSlave::new()]);
        let raw = Arc::new(RawMaster::new(segment.clone(), Duration::from_millis(1)));
        let clock = SimulatedClock::new();

        let mut slave = Slave::new(raw, SlaveAddress::AutoIncremented(0));
        assert!(slave.set_address(0).is_err());
        slave.set_address(7).unwrap();
        assert_eq!(slave.station(), Some(7));

        // init cannot jump to operational
        assert!(matches!(
            slave.switch(AlState::Operational, Duration::from_millis(10), &clock),
            Err(EthercatError::State(_)),
            ));
        slave.switch(AlState::PreOperational, Duration::from_millis(10), &clock).unwrap();
        assert_eq!(slave.state().unwrap(), AlState::PreOperational);
        assert_eq!(slave.expected(), AlState::PreOperational);
    }
}
