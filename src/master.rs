use crate::{
    socket::EthercatSocket,
    rawmaster::{RawMaster, SlaveAddress},
    data::{PduData, Field},
    registers,
    slave::Slave,
    mapping::Group,
    tree::{self, ScanResult, DescriptorStore, SlaveNode, ProcessLayout},
    image::{ProcessImage, Snapshot, BoundVariable},
    channel::MailboxChannel,
    sdo::{Sdo, SdoRequest},
    hooks::{HookRegistry, InitHook, HookReport},
    scheduler::{self, CyclicScheduler, SchedulerShared, MasterState, CycleStats, Cancellation},
    clock::{Clock, SystemClock},
    config::MasterConfig,
    error::{EthercatError, EthercatResult},
    };
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    };
use log::{info, warn, error};
use parking_lot::Mutex;


/// handle to a running master, clones of the `Arc` can be given to other threads for diagnostics and variable access
pub type MasterHandle = Arc<Master>;

/**
    This struct exposes the ethercat master functions addressing the whole ethercat segment.

    It owns everything needed to run one bus: the transport, the device tree and its process image, the mailbox channel, the initialization hooks and the cyclic scheduler. All methods take `&self`, so a [MasterHandle] can be shared between the application threads.

    ## Note

    At contrary to [RawMaster], this struct is protocol-safe: the bus states are only changed through the master state machine, and the cyclic exchange has exclusive use of the scheduler while a cycle runs. The communication might however fail for hardware reasons, and such errors are reported.

    ## Example

    The following is the typical lifecycle of a master

    ```ignore
    let master = Master::build_and_start(&scan, &descriptors, config, EthernetSocket::new("eno1")?)?;
    master.register_hook(InitHook::settings(1, vec![
        SdoRequest::write(1, 0x6060, 0, vec![8]),
        ]));
    master.configure()?;
    let velocity = master.variable(1, "target_velocity").unwrap();
    master.start(|snapshot| { /* realtime callback */ })?;
    velocity.set(1200)?;
    // ...
    master.dispose()?;
    ```
*/
pub struct Master {
    raw: Arc<RawMaster>,
    clock: Arc<dyn Clock>,
    config: MasterConfig,
    root: SlaveNode,
    image: Arc<ProcessImage>,
    channel: MailboxChannel,
    hooks: Mutex<HookRegistry>,
    scheduler: Arc<Mutex<CyclicScheduler>>,
    shared: Arc<SchedulerShared>,
    cancel: Cancellation,
    thread: Mutex<Option<JoinHandle<EthercatResult>>>,
}

impl Master {
    /**
        build the device tree and process image of the given topology, then address all slaves and bring the bus to pre-operational

        Uses the system clock. Fails with [EthercatError::Configuration] when the topology is malformed or does not match the segment.
    */
    pub fn build_and_start<S: EthercatSocket + Send + 'static>(
        scan: &ScanResult,
        descriptors: &dyn DescriptorStore,
        config: MasterConfig,
        socket: S,
    ) -> EthercatResult<MasterHandle> {
        Self::build_with_clock(scan, descriptors, config, socket, Arc::new(SystemClock::new()))
    }

    /**
        open the segment on the network interface named in the settings, with the device descriptions found in its ESI directory

        This is [Self::build_and_start] on a raw ethernet socket, for applications whose settings come from a file.
    */
    #[cfg(target_os = "linux")]
    pub fn open(scan: &ScanResult, config: MasterConfig) -> EthercatResult<MasterHandle> {
        let descriptors = tree::Descriptors::load_directory(&config.esi_directory)
            .map_err(|err| EthercatError::Configuration(format!(
                "device descriptions not loaded from {}: {}", config.esi_directory.display(), err)))?;
        info!("{} device descriptions loaded, opening interface {}", descriptors.len(), config.interface);
        let socket = crate::socket::EthernetSocket::new(&config.interface)?;
        Self::build_and_start(scan, &descriptors, config, socket)
    }

    /// same as [Self::build_and_start] with an other time source, typically a [crate::SimulatedClock]
    pub fn build_with_clock<S: EthercatSocket + Send + 'static>(
        scan: &ScanResult,
        descriptors: &dyn DescriptorStore,
        config: MasterConfig,
        socket: S,
        clock: Arc<dyn Clock>,
    ) -> EthercatResult<MasterHandle> {
        config.validate()?;
        let root = tree::build(scan, descriptors)?;
        info!("device tree:\n{}", tree::describe(&root));
        let layout = tree::assign_offsets(&root)?;
        info!("process image: {} output bytes, {} input bytes, {} variables",
            layout.size(tree::Direction::Output),
            layout.size(tree::Direction::Input),
            layout.variables().len());

        let raw = Arc::new(RawMaster::new(socket, config.frame_timeout()));
        let image = Arc::new(ProcessImage::new(layout.clone()));
        let channel = MailboxChannel::new(raw.clone(), clock.clone(), config.mailbox.clone());

        let slaves = address(&raw, &root)?;
        let scheduler = CyclicScheduler::new(
            clock.clone(),
            image.clone(),
            Group::new(raw.clone(), layout),
            slaves,
            config.clone(),
            );
        let shared = scheduler.shared();

        let master = Self {
            raw,
            clock,
            config,
            root,
            image,
            channel,
            hooks: Mutex::new(HookRegistry::new()),
            scheduler: Arc::new(Mutex::new(scheduler)),
            shared,
            cancel: Cancellation::new(),
            thread: Mutex::new(None),
        };
        master.preoperational()?;
        Ok(Arc::new(master))
    }

    /// open the mailboxes of all slaves and bring the bus to pre-operational
    fn preoperational(&self) -> EthercatResult {
        for slave in self.root.slaves() {
            self.channel.open(slave.station)?;
        }
        self.scheduler.lock().switch(MasterState::PreOp)
    }

    /**
        configure the bus and bring it to operational

        From pre-operational, runs the initialization hooks in registration order, maps every slave to the process image, goes to safe-operational, checks one full exchange, and goes to operational. If a hook fails with [crate::HookPolicy::Abort] the bus stays in pre-operational and this can be called again.
    */
    pub fn configure(&self) -> EthercatResult<HookReport> {
        if self.state() != MasterState::PreOp
            {return Err(EthercatError::State("configuration starts from pre-op"))}

        let report = self.hooks.lock().run_all(&self.channel, self.config.hook_policy)?;
        let mut scheduler = self.scheduler.lock();
        for slave in self.root.slaves() {
            scheduler.group().configure(slave.station)?;
        }
        scheduler.switch(MasterState::SafeOp)?;
        scheduler.check_responses()?;
        scheduler.switch(MasterState::Op)?;
        info!("bus operational, {} hooks run, {} skipped", report.succeeded, report.skipped.len());
        Ok(report)
    }

    /**
        run one cycle from the calling thread, `timestamp` is the time of this cycle on the master clock

        This is meant for applications driving the cycles themselves. Fails with [EthercatError::State] while the cyclic thread is running.
    */
    pub fn update_io(&self, timestamp: core::time::Duration) -> EthercatResult<Arc<Snapshot>> {
        if self.running()
            {return Err(EthercatError::State("cyclic thread is running"))}
        let cycled = self.scheduler.lock().cycle(timestamp, &mut |_: &Snapshot| {});
        if cycled.is_err() {
            self.shared.report();
        }
        cycled?;
        Ok(self.image.snapshot())
    }

    /**
        start the cyclic exchange in a dedicated thread, calling `callback` with the snapshot of each cycle

        The callback runs in the cyclic thread and must return well within the cycle period.
    */
    pub fn start(&self, mut callback: impl FnMut(&Snapshot) + Send + 'static) -> EthercatResult {
        let mut thread = self.thread.lock();
        if thread.as_ref().map_or(false, |handle| ! handle.is_finished())
            {return Err(EthercatError::State("cyclic thread already running"))}
        if ! self.state().cyclic()
            {return Err(EthercatError::State("cyclic exchange requires safe-op or op"))}
        if let Some(previous) = thread.take() {
            collect(previous);
        }

        self.cancel.reset();
        let scheduler = self.scheduler.clone();
        let cancel = self.cancel.clone();
        let handle = thread::Builder::new()
            .name("ethercat-cycle".into())
            .spawn(move || scheduler::run(&scheduler, &cancel, &mut callback))?;
        *thread = Some(handle);
        Ok(())
    }
    /**
        stop the cyclic thread and wait for it, returns the error that stopped it if it stopped on its own

        The bus is left in safe-operational. Does nothing if no thread is running. Called from the cyclic thread itself, typically from a callback, it only requests the thread to stop.
    */
    pub fn stop(&self) -> EthercatResult {
        let mut slot = self.thread.lock();
        if slot.as_ref().map_or(false, |handle| handle.thread().id() == thread::current().id()) {
            self.cancel.cancel();
            return Ok(())
        }
        let Some(handle) = slot.take()  else {return Ok(())};
        drop(slot);
        self.cancel.cancel();
        let result = handle.join()
            .unwrap_or_else(|_| Err(EthercatError::Fault("cyclic thread panicked".into())));
        self.cancel.reset();
        result
    }
    fn running(&self) -> bool {
        self.thread.lock().as_ref().map_or(false, |handle| ! handle.is_finished())
    }
    /// cancellation of the cyclic thread, cancelling it stops the thread after its current cycle
    pub fn cancellation(&self) -> Cancellation  {self.cancel.clone()}

    /**
        leave fault, or abandon the current state, and bring the bus back to pre-operational

        The cyclic thread is stopped first. [Self::configure] must be called again to resume the cyclic exchange.
    */
    pub fn reset(&self) -> EthercatResult {
        if let Err(err) = self.stop() {
            warn!("cyclic thread had stopped on: {}", err);
        }
        self.scheduler.lock().reset();
        self.channel.reset();
        self.preoperational()
    }

    /**
        stop the cyclic thread, bring the bus to safe-operational and release the transport

        Every later operation on the bus fails. This is also done when the master is dropped.
    */
    pub fn dispose(&self) -> EthercatResult {
        if ! self.raw.is_open()  {return Ok(())}
        let stopped = self.stop();
        self.scheduler.lock().shutdown();
        self.raw.release();
        info!("master disposed after {}", self.stats());
        stopped
    }

    pub fn state(&self) -> MasterState  {self.shared.state()}
    pub fn stats(&self) -> CycleStats  {self.shared.stats()}
    pub fn config(&self) -> &MasterConfig  {&self.config}
    pub fn clock(&self) -> &Arc<dyn Clock>  {&self.clock}
    /// root of the device tree
    pub fn tree(&self) -> &SlaveNode  {&self.root}
    pub fn layout(&self) -> &Arc<ProcessLayout>  {self.image.layout()}
    pub fn image(&self) -> &Arc<ProcessImage>  {&self.image}
    /// last published snapshot of the process image
    pub fn snapshot(&self) -> Arc<Snapshot>  {self.image.snapshot()}

    /// all variables of the process image, in layout order
    pub fn variables(&self) -> Vec<BoundVariable> {
        self.image.handles().into_iter()
            .map(|handle| BoundVariable::new(self.image.clone(), handle))
            .collect()
    }
    /// the variable with the given name in the given slave
    pub fn variable(&self, station: u16, name: &str) -> Option<BoundVariable> {
        self.image.handle(station, name)
            .map(|handle| BoundVariable::new(self.image.clone(), handle))
    }

    /// acyclic channel to the slaves' mailboxes
    pub fn channel(&self) -> &MailboxChannel  {&self.channel}
    /// execute one sdo request, return the bytes read
    pub fn sdo(&self, request: SdoRequest) -> EthercatResult<Vec<u8>>  {self.channel.execute(request)}
    pub fn sdo_read<T: PduData>(&self, station: u16, sdo: &Sdo<T>) -> EthercatResult<T> {
        self.channel.sdo_read(station, sdo)
    }
    pub fn sdo_write<T: PduData + Copy>(&self, station: u16, sdo: &Sdo<T>, value: T) -> EthercatResult {
        self.channel.sdo_write(station, sdo, value)
    }
    /// read up to `max` bytes of an object, with complete access the object is read from `sub` to its last subitem
    pub fn sdo_read_bytes(&self, station: u16, index: u16, sub: u8, max: usize, complete: bool) -> EthercatResult<Vec<u8>> {
        self.channel.read(station, index, sub, max, complete)
    }
    /// write raw bytes to an object, with complete access they must cover the object from `sub` to its last subitem
    pub fn sdo_write_bytes(&self, station: u16, index: u16, sub: u8, data: &[u8], complete: bool) -> EthercatResult {
        self.channel.write(station, index, sub, data, complete)
    }

    /// append an initialization hook, run by every following [Self::configure]
    pub fn register_hook(&self, hook: InitHook) {
        self.hooks.lock().register(hook);
    }
    /**
        set the function called once when the master goes to fault

        It runs in the thread running the cycles, after the scheduler is released, so it may call [Self::reset] or [Self::stop]. It should return quickly when the cyclic thread runs it.
    */
    pub fn on_fault(&self, callback: impl FnMut(&EthercatError) + Send + 'static) {
        self.shared.on_fault(Box::new(callback));
    }

    /// number of slaves answering on the segment
    pub fn slaves(&self) -> EthercatResult<u16> {
        Ok(self.raw.brd(registers::al::status)?.answers)
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            error!("master dropped with error: {}", err);
        }
    }
}

/// give every slave of the tree its fixed address, return them with their mandatory flag
fn address(raw: &Arc<RawMaster>, root: &SlaveNode) -> EthercatResult<Vec<(Slave, bool)>> {
    let nodes = root.slaves();
    let present = raw.brd(registers::al::status)?.answers;
    if usize::from(present) < nodes.len() {
        return Err(EthercatError::Configuration(format!(
            "{} slaves on the segment, {} in the topology", present, nodes.len())))
    }
    if usize::from(present) > nodes.len() {
        warn!("{} slaves on the segment but only {} in the topology, the others are left in init",
            present, nodes.len());
    }
    // previous addresses and mappings could collide with the new ones
    raw.bwr(registers::address::fixed, 0)?;
    raw.bwr(Field::<[u8; 256]>::simple(usize::from(registers::fmmu.address)), [0; 256])?;

    let mut slaves = Vec::with_capacity(nodes.len());
    for node in nodes {
        let mut slave = Slave::new(raw.clone(), SlaveAddress::AutoIncremented(node.position));
        slave.set_address(node.station)
            .map_err(|err| EthercatError::Configuration(format!(
                "slave {} at position {} could not be addressed: {}", node.station, node.position, err)))?;
        slaves.push((slave, node.mandatory));
    }
    Ok(slaves)
}

/// join a finished cyclic thread and log how it ended
fn collect(handle: JoinHandle<EthercatResult>) {
    match handle.join() {
        Ok(Ok(())) => {},
        Ok(Err(err)) => warn!("previous cyclic thread stopped on: {}", err),
        Err(_) => error!("previous cyclic thread panicked"),
    }
}
