/*!
    acyclic mailbox channel shared by the whole master.

    Requests are serialized per slave: a second request to the same station waits until the first one completed, while requests to different stations proceed independently. Every request goes through the same states:

    ```text
    Idle -> Sent -> Acked
                 -> TimedOut -> Sent (retry) ...
                 -> Aborted  -> Sent (retry) ...
    ```

    The mailbox PDUs share the bus with the cyclic frames through [RawMaster], so they are sent between cyclic frames and never disturb the cyclic timing.
*/

use std::{
    collections::HashMap,
    sync::Arc,
    };
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    rawmaster::RawMaster,
    mailbox::Mailbox,
    can::{Can, SdoAbortCode},
    clock::Clock,
    config::MailboxConfig,
    sdo::{Sdo, SdoRequest, SdoOperation},
    data::PduData,
    error::{EthercatError, EthercatResult},
    };


/// state of the last request issued on a station's mailbox
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RequestState {
    /// no request running
    Idle,
    /// request written to the slave, waiting for its answer
    Sent,
    /// the slave acknowledged the request
    Acked,
    /// the slave did not answer in time
    TimedOut,
    /// the slave refused the request with the given code
    Aborted(SdoAbortCode),
}

struct Station {
    coe: Can,
    state: RequestState,
}

/// mailbox channel to all the slaves of a segment
pub struct MailboxChannel {
    master: Arc<RawMaster>,
    clock: Arc<dyn Clock>,
    config: MailboxConfig,
    stations: Mutex<HashMap<u16, Arc<Mutex<Station>>>>,
}

impl MailboxChannel {
    pub fn new(master: Arc<RawMaster>, clock: Arc<dyn Clock>, config: MailboxConfig) -> Self {
        Self {
            master,
            clock,
            config,
            stations: Mutex::new(HashMap::new()),
        }
    }

    /// configure the mailbox of the given slave, this is done implicitly on first request to a station
    pub fn open(&self, station: u16) -> EthercatResult {
        self.station(station).map(|_| ())
    }
    /// forget all mailboxes, they will be reconfigured on next request
    pub fn reset(&self) {
        self.stations.lock().clear();
    }
    /// state of the last request on the given station, `Idle` for stations never used
    pub fn state(&self, station: u16) -> RequestState {
        let station = self.stations.lock().get(&station).cloned();
        station.map(|station| station.lock().state).unwrap_or(RequestState::Idle)
    }

    fn station(&self, station: u16) -> EthercatResult<Arc<Mutex<Station>>> {
        let mut stations = self.stations.lock();
        if let Some(existing) = stations.get(&station) {
            return Ok(existing.clone())
        }
        let mailbox = Mailbox::new(self.master.clone(), self.clock.clone(), station, self.config.poll())?;
        let new = Arc::new(Mutex::new(Station {
            coe: Can::new(mailbox),
            state: RequestState::Idle,
            }));
        stations.insert(station, new.clone());
        Ok(new)
    }

    /**
        run a transfer on a station, retrying it on timeout or abort

        The per-station lock is held for the whole transfer including retries, so requests on one station never interleave.
    */
    fn transfer<R>(&self, station: u16, mut attempt: impl FnMut(&mut Can, core::time::Duration) -> EthercatResult<R>) -> EthercatResult<R> {
        let shared = self.station(station)?;
        let mut slot = shared.lock();
        let attempts = self.config.retries + 1;
        let mut last_abort = None;

        for index in 0 .. attempts {
            if index > 0 {
                self.clock.sleep(self.config.backoff(index));
                // an answer to the former attempt may have arrived meanwhile
                slot.coe.flush()?;
            }
            slot.state = RequestState::Sent;
            let deadline = self.clock.now() + self.config.timeout();
            match attempt(&mut slot.coe, deadline) {
                Ok(value) => {
                    slot.state = RequestState::Acked;
                    if index > 0  {info!("mailbox request on slave {} succeeded after {} retries", station, index)}
                    return Ok(value)
                },
                Err(EthercatError::MailboxAbort {code, ..}) if code.length_related() => {
                    slot.state = RequestState::Aborted(code);
                    warn!("slave {} refused data length: {}", station, code);
                    return Err(EthercatError::SizeMismatch {expected: None, received: 0})
                },
                Err(EthercatError::MailboxAbort {code, ..}) => {
                    slot.state = RequestState::Aborted(code);
                    last_abort = Some(code);
                    warn!("slave {} aborted mailbox request (attempt {}/{}): {}", station, index+1, attempts, code);
                },
                Err(EthercatError::Timeout(_)) => {
                    slot.state = RequestState::TimedOut;
                    warn!("slave {} did not answer mailbox request (attempt {}/{})", station, index+1, attempts);
                },
                Err(other) => {
                    slot.state = RequestState::Idle;
                    return Err(other)
                },
            }
        }
        Err(match slot.state {
            RequestState::Aborted(code) => EthercatError::MailboxAbort {station, code},
            _ => EthercatError::MailboxTimeout {station, attempts, last_abort},
        })
    }

    /// write raw bytes to an sdo, the payload length is the declared object size
    pub fn write(&self, station: u16, index: u16, sub: u8, payload: &[u8], complete: bool) -> EthercatResult {
        let mut request = SdoRequest::write(station, index, sub, payload.to_vec());
        request.complete = complete;
        self.execute(request).map(|_| ())
    }
    /// read raw bytes from an sdo, returning at most `max` bytes
    pub fn read(&self, station: u16, index: u16, sub: u8, max: usize, complete: bool) -> EthercatResult<Vec<u8>> {
        let mut request = SdoRequest::read(station, index, sub, max);
        request.complete = complete;
        self.execute(request)
    }

    /**
        execute a request, returning the bytes read (empty for a write)

        The request is consumed: a request is resolved once, callers wanting to issue the same operation again build or clone a new one.
        It is validated before anything is sent: a payload inconsistent with the declared size is rejected with [EthercatError::SizeMismatch] and never retried.
    */
    pub fn execute(&self, request: SdoRequest) -> EthercatResult<Vec<u8>> {
        request.validate()?;
        let sdo = request.sdo();
        debug!("mailbox {}", request);
        match request.operation {
            SdoOperation::Write => self.transfer(request.station, |coe, deadline| {
                coe.sdo_write_slice(&sdo, deadline, &request.payload)
                })
                .map(|_| Vec::new())
                .map_err(|err| match err {
                    EthercatError::SizeMismatch {expected: None, ..}
                        => EthercatError::SizeMismatch {expected: None, received: request.payload.len()},
                    other => other,
                }),
            SdoOperation::Read => {
                let mut buffer = vec![0; request.size];
                let size = self.transfer(request.station, |coe, deadline| {
                    coe.sdo_read_slice(&sdo, deadline, &mut buffer).map(|data| data.len())
                    })?;
                buffer.truncate(size);
                Ok(buffer)
            },
        }
    }

    /// read a typed sdo
    pub fn sdo_read<T: PduData>(&self, station: u16, sdo: &Sdo<T>) -> EthercatResult<T> {
        self.transfer(station, |coe, deadline| coe.sdo_read(sdo, deadline))
    }
    /// write a typed sdo
    pub fn sdo_write<T: PduData + Copy>(&self, station: u16, sdo: &Sdo<T>, value: T) -> EthercatResult {
        self.transfer(station, |coe, deadline| coe.sdo_write(sdo, deadline, value))
    }
}
