/*!
    cyclic exchange of the process image, and the master state machine around it.

    ```text
    Init -> PreOp -> SafeOp -> Op
                       ^       |  watchdog
                       +-------+
                       |
                       +-> Fault  (recovery exhausted, until reset)
    ```

    Each cycle sends one frame holding the logical exchange of the whole process image and a read of every slave's AL status. A slave that does not answer, or is not in its expected state, misses the cycle. When a mandatory slave misses too many consecutive cycles, the watchdog brings the bus down to safe-operational and retries bringing it back a bounded number of times before declaring a fault.

    The loop in [run] sleeps until absolute deadlines on the grid `start + n * period`, so timing errors never accumulate.
*/

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    };
use core::{fmt, time::Duration};
use log::{debug, info, warn, error};
use parking_lot::Mutex;

use crate::{
    rawmaster::SlaveAddress,
    registers::{AlState, AlStatus},
    slave::Slave,
    mapping::Group,
    image::{ProcessImage, Snapshot},
    clock::Clock,
    config::MasterConfig,
    error::{EthercatError, EthercatResult},
    };


/// state of the whole bus, as driven by the master
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MasterState {
    Init,
    PreOp,
    SafeOp,
    Op,
    /// the master stopped issuing frames until reset
    Fault,
}
impl MasterState {
    /// slave state matching this master state
    pub fn al(self) -> Option<AlState> {
        match self {
            Self::Init => Some(AlState::Init),
            Self::PreOp => Some(AlState::PreOperational),
            Self::SafeOp => Some(AlState::SafeOperational),
            Self::Op => Some(AlState::Operational),
            Self::Fault => None,
        }
    }
    /// true in states where the cyclic exchange runs
    pub fn cyclic(self) -> bool {
        matches!(self, Self::SafeOp | Self::Op)
    }
}
impl fmt::Display for MasterState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
            Self::Init => "init",
            Self::PreOp => "pre-op",
            Self::SafeOp => "safe-op",
            Self::Op => "op",
            Self::Fault => "fault",
		})
	}
}

/// timing statistics of the cyclic exchange
#[derive(Clone, Debug, Default)]
pub struct CycleStats {
    /// number of cycles run
    pub cycles: u64,
    /// cycles that ended after the next deadline
    pub overruns: u64,
    /// missed exchanges of any slave, mandatory or not
    pub misses: u64,
    /// watchdog recoveries that succeeded
    pub recoveries: u64,
    /// shortest interval between the start of two consecutive cycles
    pub min: Option<Duration>,
    /// longest interval between the start of two consecutive cycles
    pub max: Option<Duration>,
    intervals: u64,
    mean: f64,
    m2: f64,
}
impl CycleStats {
    fn record(&mut self, interval: Duration) {
        self.min = Some(self.min.map_or(interval, |min| min.min(interval)));
        self.max = Some(self.max.map_or(interval, |max| max.max(interval)));
        // running variance
        let value = interval.as_secs_f64();
        self.intervals += 1;
        let delta = value - self.mean;
        self.mean += delta / self.intervals as f64;
        self.m2 += delta * (value - self.mean);
    }
    /// number of intervals measured
    pub fn intervals(&self) -> u64  {self.intervals}
    pub fn mean(&self) -> Option<Duration> {
        (self.intervals > 0).then(|| Duration::from_secs_f64(self.mean))
    }
    /// standard deviation of the interval, this is the cycle jitter
    pub fn stddev(&self) -> Option<Duration> {
        (self.intervals > 1).then(|| Duration::from_secs_f64((self.m2 / (self.intervals - 1) as f64).max(0.).sqrt()))
    }
}
impl fmt::Display for CycleStats {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} cycles, interval {:?} .. {:?} (mean {:?}, stddev {:?}), {} overruns, {} misses, {} recoveries",
            self.cycles,
            self.min.unwrap_or_default(), self.max.unwrap_or_default(),
            self.mean().unwrap_or_default(), self.stddev().unwrap_or_default(),
            self.overruns, self.misses, self.recoveries)
	}
}

/// cooperative stop request for a running cyclic loop, clones share the same request
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}
impl Cancellation {
    pub fn new() -> Self  {Self::default()}
    /// request the loop to stop after its current cycle
    pub fn cancel(&self)  {self.flag.store(true, Ordering::SeqCst)}
    pub fn is_cancelled(&self) -> bool  {self.flag.load(Ordering::SeqCst)}
    pub(crate) fn reset(&self)  {self.flag.store(false, Ordering::SeqCst)}
}

/// called once when the master goes to fault
pub type FaultCallback = Box<dyn FnMut(&EthercatError) + Send>;

/// state and statistics readable while the scheduler runs in its thread
pub(crate) struct SchedulerShared {
    state: Mutex<MasterState>,
    stats: Mutex<CycleStats>,
    fault: Mutex<Option<FaultCallback>>,
    /// fault raised by the scheduler and not reported yet
    pending: Mutex<Option<EthercatError>>,
}
impl SchedulerShared {
    pub fn state(&self) -> MasterState  {*self.state.lock()}
    pub fn stats(&self) -> CycleStats  {self.stats.lock().clone()}
    pub fn on_fault(&self, callback: FaultCallback) {
        *self.fault.lock() = Some(callback);
    }
    /**
        call the fault callback with the fault raised since the last report, if any

        This must be called without holding the scheduler, so the callback can use the master.
    */
    pub fn report(&self) {
        let Some(cause) = self.pending.lock().take()  else {return};
        if let Some(callback) = self.fault.lock().as_mut() {
            callback(&cause);
        }
    }
}

struct Member {
    slave: Slave,
    mandatory: bool,
    misses: u32,
}

/// drives the bus states and the cyclic exchange
pub struct CyclicScheduler {
    clock: Arc<dyn Clock>,
    image: Arc<ProcessImage>,
    group: Group,
    members: Vec<Member>,
    config: MasterConfig,
    shared: Arc<SchedulerShared>,
    cycle: u64,
    previous: Option<Duration>,
}

impl CyclicScheduler {
    /// `slaves` are given with their mandatory flag, they must already have their fixed address
    pub fn new(
        clock: Arc<dyn Clock>,
        image: Arc<ProcessImage>,
        group: Group,
        slaves: Vec<(Slave, bool)>,
        config: MasterConfig,
    ) -> Self {
        Self {
            clock,
            image,
            group,
            members: slaves.into_iter()
                .map(|(slave, mandatory)| Member {slave, mandatory, misses: 0})
                .collect(),
            config,
            shared: Arc::new(SchedulerShared {
                state: Mutex::new(MasterState::Init),
                stats: Mutex::new(CycleStats::default()),
                fault: Mutex::new(None),
                pending: Mutex::new(None),
                }),
            cycle: 0,
            previous: None,
        }
    }
    pub fn state(&self) -> MasterState  {self.shared.state()}
    pub fn stats(&self) -> CycleStats  {self.shared.stats()}
    pub(crate) fn shared(&self) -> Arc<SchedulerShared>  {self.shared.clone()}
    pub fn clock(&self) -> &Arc<dyn Clock>  {&self.clock}
    pub fn config(&self) -> &MasterConfig  {&self.config}
    /// set the function called when the master goes to fault, see [SchedulerShared::report]
    pub fn on_fault(&self, callback: FaultCallback) {
        self.shared.on_fault(callback);
    }
    /// the group exchanging the process image
    pub fn group(&self) -> &Group  {&self.group}

    fn set_state(&self, state: MasterState) {
        let mut current = self.shared.state.lock();
        if *current != state {
            info!("master state {} -> {}", *current, state);
            *current = state;
        }
    }

    /**
        bring all slaves to the state matching `target`, stepping up one state at a time

        The master state only changes once every slave reached its state.
    */
    pub fn switch(&mut self, target: MasterState) -> EthercatResult {
        let al = target.al()
            .ok_or(EthercatError::State("fault can not be requested"))?;
        if self.state() == MasterState::Fault
            {return Err(EthercatError::Fault("reset the master before switching states".into()))}
        let timeout = self.config.state_timeout();
        for member in self.members.iter_mut() {
            match step(&mut member.slave, al, timeout, self.clock.as_ref()) {
                Ok(()) => {},
                // an optional slave is not worth stopping the bus, the watchdog keeps counting its misses
                Err(err) if ! member.mandatory => warn!("optional slave {} left out of {}: {}", station_of(&member.slave), target, err),
                Err(err) => return Err(err),
            }
            member.slave.expect(al);
            member.misses = 0;
        }
        self.set_state(target);
        Ok(())
    }

    /// exchange one frame, return for each slave whether it answered in its expected state
    fn exchange(&mut self, timestamp: Duration) -> EthercatResult<Vec<bool>> {
        let mut statuses = self.members.iter()
            .map(|member| (station_of(&member.slave), None))
            .collect::<Vec<(u16, Option<AlStatus>)>>();

        match self.group.exchange(&self.image, &mut statuses, self.config.frame_timeout()) {
            Ok(answers) => {
                if answers != self.group.expected() {
                    debug!("logical exchange processed by {}/{} slaves", answers, self.group.expected());
                }
                self.cycle += 1;
                self.image.publish(self.group.frame(), self.cycle, timestamp);
            },
            Err(err @ (EthercatError::Timeout(_) | EthercatError::Protocol(_))) => {
                warn!("cyclic frame lost: {}", err);
            },
            Err(err) => return Err(err),
        }
        Ok(self.members.iter().zip(statuses)
            .map(|(member, (_, status))| status
                .and_then(|status| status.current().ok())
                .map_or(false, |state| state == member.slave.expected()))
            .collect())
    }

    /**
        run one cycle: exchange the process image, check the watchdog, then call `callback` with the new snapshot

        Fails with [EthercatError::Fault] once in fault, and with [EthercatError::State] if the bus is not in safe-operational or operational.
    */
    pub fn cycle(&mut self, timestamp: Duration, callback: &mut dyn FnMut(&Snapshot)) -> EthercatResult {
        match self.state() {
            MasterState::Fault => return Err(EthercatError::Fault("master stopped exchanging frames".into())),
            state if ! state.cyclic() => return Err(EthercatError::State("cyclic exchange requires safe-op or op")),
            _ => {},
        }
        if let Some(previous) = self.previous {
            self.shared.stats.lock().record(timestamp.saturating_sub(previous));
        }
        self.previous = Some(timestamp);

        let responded = self.exchange(timestamp)?;
        self.shared.stats.lock().cycles += 1;

        // one watchdog check per slave
        let threshold = self.config.watchdog.misses;
        let mut fired = None;
        for (member, ok) in self.members.iter_mut().zip(responded) {
            if ok {
                member.misses = 0;
                continue
            }
            member.misses += 1;
            self.shared.stats.lock().misses += 1;
            let station = station_of(&member.slave);
            debug!("slave {} missed cycle {} ({} in a row)", station, self.cycle, member.misses);
            if member.mandatory && member.misses >= threshold && fired.is_none() {
                fired = Some((station, member.misses));
            }
        }
        if let Some((station, misses)) = fired {
            self.recover(station, misses)?;
        }
        callback(self.image.snapshot().as_ref());
        Ok(())
    }

    /// bounded recovery after the watchdog fired, goes to fault if all attempts fail
    fn recover(&mut self, station: u16, misses: u32) -> EthercatResult {
        let error = EthercatError::Watchdog {station, misses};
        let target = self.state();
        warn!("{}, recovering the bus to {}", error, target);

        if target == MasterState::Op {
            let timeout = self.config.state_timeout();
            for member in self.members.iter_mut() {
                if let Err(err) = member.slave.switch(AlState::SafeOperational, timeout, self.clock.as_ref()) {
                    debug!("slave {} not brought to safe-op: {}", station_of(&member.slave), err);
                }
                member.slave.expect(AlState::SafeOperational);
            }
            self.set_state(MasterState::SafeOp);
        }

        let attempts = self.config.watchdog.recovery_attempts;
        for attempt in 1 ..= attempts {
            self.clock.sleep(self.config.watchdog.backoff(attempt));
            match self.restore(target) {
                Ok(()) => {
                    info!("bus recovered to {} after {} attempts", target, attempt);
                    self.shared.stats.lock().recoveries += 1;
                    return Ok(())
                },
                Err(err) => warn!("recovery attempt {}/{} failed: {}", attempt, attempts, err),
            }
        }
        self.fault(&error);
        Err(error)
    }
    fn restore(&mut self, target: MasterState) -> EthercatResult {
        self.switch(MasterState::SafeOp)?;
        self.check_responses()?;
        if target == MasterState::Op {
            self.switch(MasterState::Op)?;
        }
        Ok(())
    }
    /// run one exchange and check every mandatory slave answered in its expected state
    pub fn check_responses(&mut self) -> EthercatResult {
        let timestamp = self.clock.now();
        let responded = self.exchange(timestamp)?;
        match self.members.iter().zip(responded).find(|(member, ok)| member.mandatory && ! ok) {
            Some((member, _)) => Err(EthercatError::Watchdog {station: station_of(&member.slave), misses: member.misses + 1}),
            None => Ok(()),
        }
    }
    /// go to fault, the cause waits for [SchedulerShared::report]
    pub(crate) fn fault(&mut self, cause: &EthercatError) {
        error!("master fault: {}", cause);
        self.set_state(MasterState::Fault);
        *self.shared.pending.lock() = Some(cause.clone());
    }

    /**
        leave fault and go back to init

        Slaves are requested to go to init as well, but slaves that do not answer are not an error: the next configuration will report them.
    */
    pub fn reset(&mut self) {
        let timeout = self.config.state_timeout();
        for member in self.members.iter_mut() {
            if let Err(err) = member.slave.switch(AlState::Init, timeout, self.clock.as_ref()) {
                debug!("slave {} not brought to init: {}", station_of(&member.slave), err);
            }
            member.slave.expect(AlState::Init);
            member.misses = 0;
        }
        self.previous = None;
        self.set_state(MasterState::Init);
    }

    /// bring the bus down to safe-op if it is operational, used on every exit path
    pub(crate) fn shutdown(&mut self) {
        if self.state() == MasterState::Op {
            if let Err(err) = self.switch(MasterState::SafeOp) {
                warn!("could not bring the bus back to safe-op: {}", err);
            }
        }
    }
}

/// bring one slave to `target` through all intermediate states
fn step(slave: &mut Slave, target: AlState, timeout: Duration, clock: &dyn Clock) -> EthercatResult {
    let current = slave.state()?;
    for state in current.path(target) {
        if state == current  {continue}
        slave.switch(state, timeout, clock)?;
    }
    Ok(())
}

fn station_of(slave: &Slave) -> u16 {
    match slave.address() {
        SlaveAddress::Fixed(station) => station,
        _ => 0,
    }
}

/**
    run cycles until cancelled or fault, sleeping until the absolute deadline of each cycle

    The scheduler lock is only held during a cycle, so the state and other operations stay available between cycles. A fault is reported once the lock is released. On exit the bus is brought back to safe-op. Returns the error that stopped the loop, if any.
*/
pub fn run(
    scheduler: &Mutex<CyclicScheduler>,
    cancel: &Cancellation,
    callback: &mut dyn FnMut(&Snapshot),
) -> EthercatResult {
    let (clock, shared, period, realtime) = {
        let scheduler = scheduler.lock();
        (scheduler.clock.clone(), scheduler.shared(), scheduler.config.period(), scheduler.config.realtime)
    };
    if realtime {
        raise_priority();
    }
    info!("cyclic loop started with period {:?}", period);

    let mut deadline = clock.now();
    let result = loop {
        if cancel.is_cancelled()  {break Ok(())}
        let cycled = scheduler.lock().cycle(deadline.max(clock.now()), callback);
        if let Err(err) = cycled {
            shared.report();
            break Err(err);
        }

        deadline += period;
        let now = clock.now();
        if now > deadline {
            shared.stats.lock().overruns += 1;
            warn!("cycle overrun by {:?}", now - deadline);
            // skip the periods already missed, staying on the same grid
            while deadline < now  {deadline += period}
        }
        clock.sleep_until(deadline);
    };

    scheduler.lock().shutdown();
    match &result {
        Ok(()) => info!("cyclic loop stopped: {}", shared.stats()),
        Err(err) => error!("cyclic loop stopped on error: {}", err),
    }
    result
}

#[cfg(target_os = "linux")]
fn raise_priority() {
    use thread_priority::{set_current_thread_priority, ThreadPriority};
    if let Err(err) = set_current_thread_priority(ThreadPriority::Max) {
        warn!("cyclic thread keeps its default priority: {:?}", err);
    }
}
#[cfg(not(target_os = "linux"))]
fn raise_priority() {
    warn!("realtime priority is not supported on this platform");
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_jitter() {
        let mut stats = CycleStats::default();
        for interval in [100, 102, 98, 100] {
            stats.record(Duration::from_millis(interval));
        }
        assert_eq!(stats.intervals(), 4);
        assert_eq!(stats.min, Some(Duration::from_millis(98)));
        assert_eq!(stats.max, Some(Duration::from_millis(102)));
        let mean = stats.mean().unwrap();
        assert!(mean > Duration::from_micros(99_999) && mean < Duration::from_micros(100_001));
        let stddev = stats.stddev().unwrap();
        assert!(stddev > Duration::from_micros(1_600) && stddev < Duration::from_micros(1_700));
    }

    #[test]
    fn cancellation_shared() {
        let cancel = Cancellation::new();
        let other = cancel.clone();
        assert!(! cancel.is_cancelled());
        other.cancel();
        assert!(cancel.is_cancelled());
        cancel.reset();
        assert!(! other.is_cancelled());
    }

    #[test]
    fn state_mapping() {
        assert_eq!(MasterState::SafeOp.al(), Some(AlState::SafeOperational));
        assert_eq!(MasterState::Fault.al(), None);
        assert!(MasterState::Op.cyclic() && ! MasterState::PreOp.cyclic());
    }
}
