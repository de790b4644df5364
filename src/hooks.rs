/*!
    initialization hooks, run in registration order while the bus goes from pre-operational to safe-operational.

    Hooks are values: either a list of sdo writes giving initial settings to one slave, or a named function receiving the mailbox channel. Since a bring-up can be retried, hooks must give the same result when run again.
*/

use std::fmt;
use serde::{Deserialize, Serialize};
use log::{info, warn, error};

use crate::{
    channel::MailboxChannel,
    sdo::SdoRequest,
    error::{EthercatError, EthercatResult},
    };


/// what to do when a hook fails
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum HookPolicy {
    /// stop the bring-up and report the error, the bus stays in pre-operational
    Abort,
    /// log the failure and proceed with the next hooks
    SkipAndContinue,
}

/// function run as a hook
pub type HookFn = Box<dyn Fn(&MailboxChannel) -> EthercatResult + Send + Sync>;

/// an initialization step
pub enum InitHook {
    /// initial settings of one slave, written in order
    SdoWrites {station: u16, requests: Vec<SdoRequest>},
    /// arbitrary configuration step
    Custom {name: String, run: HookFn},
}

impl InitHook {
    /// initial settings hook
    pub fn settings(station: u16, requests: Vec<SdoRequest>) -> Self {
        Self::SdoWrites {station, requests}
    }
    pub fn custom(name: &str, run: impl Fn(&MailboxChannel) -> EthercatResult + Send + Sync + 'static) -> Self {
        Self::Custom {name: name.to_string(), run: Box::new(run)}
    }
    pub fn name(&self) -> String {
        match self {
            Self::SdoWrites {station, requests} => format!("{} initial settings of slave {}", requests.len(), station),
            Self::Custom {name, ..} => name.clone(),
        }
    }
    /// run the hook, each request is executed from a copy so the hook can run again
    pub fn run(&self, channel: &MailboxChannel) -> EthercatResult {
        match self {
            Self::SdoWrites {station, requests} => {
                for request in requests {
                    if request.station != *station {
                        return Err(EthercatError::Configuration(format!(
                            "initial setting {} does not target slave {}", request, station)))
                    }
                    channel.execute(request.clone())?;
                }
                Ok(())
            },
            Self::Custom {run, ..} => run(channel),
        }
    }
}
impl fmt::Debug for InitHook {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::SdoWrites {station, requests} => f.debug_struct("SdoWrites")
                .field("station", station)
                .field("requests", requests)
                .finish(),
            Self::Custom {name, ..} => f.debug_struct("Custom")
                .field("name", name)
                .finish_non_exhaustive(),
        }
    }
}

/// outcome of running all hooks
#[derive(Clone, Debug, Default)]
pub struct HookReport {
    /// number of hooks that succeeded
    pub succeeded: usize,
    /// names and errors of the hooks skipped because they failed
    pub skipped: Vec<(String, EthercatError)>,
}

/// ordered list of hooks
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: Vec<InitHook>,
}

impl HookRegistry {
    pub fn new() -> Self  {Self::default()}
    /// append a hook, it will run after every hook already registered
    pub fn register(&mut self, hook: InitHook) {
        self.hooks.push(hook);
    }
    pub fn len(&self) -> usize  {self.hooks.len()}
    pub fn is_empty(&self) -> bool  {self.hooks.is_empty()}

    /// run all hooks in registration order, applying the given failure policy
    pub fn run_all(&self, channel: &MailboxChannel, policy: HookPolicy) -> EthercatResult<HookReport> {
        let mut report = HookReport::default();
        for (index, hook) in self.hooks.iter().enumerate() {
            info!("running hook {}/{}: {}", index+1, self.hooks.len(), hook.name());
            match hook.run(channel) {
                Ok(()) => report.succeeded += 1,
                Err(err) => match policy {
                    HookPolicy::Abort => {
                        error!("hook {} failed, aborting bring-up: {}", hook.name(), err);
                        return Err(err)
                    },
                    HookPolicy::SkipAndContinue => {
                        warn!("hook {} failed, skipped: {}", hook.name(), err);
                        report.skipped.push((hook.name(), err));
                    },
                },
            }
        }
        Ok(report)
    }
}
