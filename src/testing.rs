//! Fakes shared by engine tests.

use crate::catalogue::{CatalogueItem, VmCatalogue};
use crate::config::SnapvisorConfig;
use crate::context::{Collaborators, DispatcherContext, OpContext};
use crate::disk::BundleDiskBackend;
use crate::error::{Error, Result};
use crate::events::{Answer, Channel, Event, EventKind, Question};
use crate::exclusive::CommandKind;
use crate::host::{AccessCheck, Impersonator, SpaceProbe};
use crate::vm::{
    AgentCommand, AgentReply, HardDisk, JobHandle, PowerState, SessionId, VmAgent, VmConfig,
    VmLocation, WaitOutcome,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Scripted reply to one agent job.
#[derive(Debug, Clone)]
pub enum Script {
    /// Report progress, then complete.
    Complete(Option<Vec<u8>>),
    /// Fail with a message.
    Fail(String),
    /// Transport drops while waiting.
    Disconnect,
    /// The VM powers off and the transport drops with it.
    StopThenDisconnect,
    /// Never finishes.
    Hang,
}

#[derive(Default)]
pub struct FakeAgent {
    pub state: Mutex<Option<PowerState>>,
    pub tools: Mutex<Option<String>>,
    pub scripts: Mutex<VecDeque<Script>>,
    pub commands: Mutex<Vec<AgentCommand>>,
    pub aborted: Mutex<Vec<u64>>,
    jobs: Mutex<Vec<(u64, Script)>>,
}

impl FakeAgent {
    pub fn set_state(&self, state: PowerState) {
        *self.state.lock() = Some(state);
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    pub fn commands(&self) -> Vec<AgentCommand> {
        self.commands.lock().clone()
    }
}

impl VmAgent for FakeAgent {
    fn send_command(&self, _vm: &VmLocation, command: AgentCommand) -> Result<JobHandle> {
        let name = command.name();
        if matches!(command, AgentCommand::Stop) {
            *self.state.lock() = Some(PowerState::Stopped);
        }
        self.commands.lock().push(command);
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or(Script::Complete(None));
        let mut jobs = self.jobs.lock();
        let id = jobs.len() as u64 + 1;
        jobs.push((id, script));
        Ok(JobHandle { id, command: name })
    }

    fn wait_for_reply(
        &self,
        vm: &VmLocation,
        job: &JobHandle,
        _timeout: Duration,
    ) -> Result<WaitOutcome> {
        let script = self
            .jobs
            .lock()
            .iter()
            .find(|(id, _)| *id == job.id)
            .map(|(_, s)| s.clone())
            .ok_or_else(|| Error::agent(job.command, "unknown job"))?;
        match script {
            Script::Complete(screenshot) => {
                Ok(WaitOutcome::Reply(AgentReply::Completed { screenshot }))
            }
            Script::Fail(message) => Ok(WaitOutcome::Reply(AgentReply::Failed { message })),
            Script::Disconnect => Err(Error::UnexpectedDisconnect {
                vm: vm.id.to_string(),
            }),
            Script::StopThenDisconnect => {
                *self.state.lock() = Some(PowerState::Stopped);
                Err(Error::UnexpectedDisconnect {
                    vm: vm.id.to_string(),
                })
            }
            Script::Hang => {
                std::thread::sleep(Duration::from_millis(2));
                Ok(WaitOutcome::Timeout { progress: 10 })
            }
        }
    }

    fn power_state(&self, _vm: &VmLocation) -> Result<PowerState> {
        Ok(self.state.lock().unwrap_or(PowerState::Stopped))
    }

    fn guest_agent_version(&self, vm: &VmLocation) -> Result<String> {
        self.tools.lock().clone().ok_or(Error::GuestToolsUnavailable {
            vm: vm.id.to_string(),
        })
    }

    fn abort(&self, _vm: &VmLocation, job: &JobHandle) -> Result<()> {
        self.aborted.lock().push(job.id);
        Ok(())
    }
}

/// Free space probe with a settable answer.
pub struct FixedSpace(pub Mutex<Option<u64>>);

impl SpaceProbe for FixedSpace {
    fn free_bytes(&self, path: &Path) -> Result<u64> {
        self.0.lock().ok_or_else(|| Error::GetFreeSpaceFailed {
            path: path.to_path_buf(),
            reason: "unsupported filesystem".into(),
        })
    }
}

/// Access check that denies listed devices.
#[derive(Default)]
pub struct DenyList(pub Mutex<Vec<PathBuf>>);

impl AccessCheck for DenyList {
    fn check_access(&self, _s: &SessionId, _c: CommandKind, _vm: &VmLocation) -> Result<()> {
        Ok(())
    }

    fn check_device_access(&self, _s: &SessionId, device: &Path) -> bool {
        !self.0.lock().iter().any(|d| d == device)
    }
}

/// Impersonator that records every identity switch.
#[derive(Default)]
pub struct Switches(pub Mutex<Vec<String>>);

impl Switches {
    pub fn log(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Every switch was undone and the last one has been reverted.
    pub fn restored(&self) -> bool {
        let log = self.0.lock();
        let begun = log.iter().filter(|l| l.starts_with("as ")).count();
        begun > 0 && begun * 2 == log.len() && log.last().map(String::as_str) == Some("revert")
    }
}

impl Impersonator for Switches {
    fn impersonate(&self, session: &SessionId) -> Result<()> {
        self.0.lock().push(format!("as {}", session));
        Ok(())
    }

    fn revert(&self) -> Result<()> {
        self.0.lock().push("revert".into());
        Ok(())
    }
}

/// Channel that records events and answers questions from a queue.
pub struct Recorder {
    pub events: Mutex<Vec<Event>>,
    pub questions: Mutex<Vec<Question>>,
    pub answer: Mutex<Answer>,
}

impl Recorder {
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind.clone()).collect()
    }
}

impl Channel for Recorder {
    fn send_event(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn ask(&self, _session: &SessionId, question: Question) -> Answer {
        self.questions.lock().push(question);
        *self.answer.lock()
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub ctx: DispatcherContext,
    pub agent: Arc<FakeAgent>,
    pub space: Arc<FixedSpace>,
    pub access: Arc<DenyList>,
    pub channel: Arc<Recorder>,
    pub switches: Arc<Switches>,
    pub vm: VmLocation,
}

pub const MB: u64 = 1024 * 1024;

impl Fixture {
    /// A registered, stopped VM `web` with two image disks.
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(FakeAgent::default());
        let space = Arc::new(FixedSpace(Mutex::new(Some(100_000 * MB))));
        let access = Arc::new(DenyList::default());
        let channel = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
            questions: Mutex::new(Vec::new()),
            answer: Mutex::new(Answer::No),
        });
        let switches = Arc::new(Switches::default());
        let config = SnapvisorConfig {
            vm_root: dir.path().join("vms"),
            catalogue_path: dir.path().join("catalogue.json"),
            ..SnapvisorConfig::default()
        };
        let collab = Collaborators {
            agent: agent.clone(),
            disks: Arc::new(BundleDiskBackend::new()),
            access: access.clone(),
            channel: channel.clone(),
            space: space.clone(),
            impersonator: switches.clone(),
        };
        let ctx = DispatcherContext::new(config, collab, VmCatalogue::in_memory());

        let home = dir.path().join("vms").join("web");
        std::fs::create_dir_all(&home).unwrap();
        let mut vm_config = VmConfig::new("u-web", "web", 1024);
        vm_config.video_mb = 32;
        for (index, name) in ["hdd0.hdd", "hdd1.hdd"].iter().enumerate() {
            BundleDiskBackend::create_image(&home.join(name)).unwrap();
            vm_config.hard_disks.push(HardDisk {
                index: index as u32,
                path: PathBuf::from(name),
                enabled: true,
                emulation: Default::default(),
                bootcamp: false,
            });
        }
        vm_config.save(&home).unwrap();
        ctx.catalogue
            .register(CatalogueItem {
                uuid: "u-web".into(),
                name: "web".into(),
                home: home.clone(),
                template: false,
            })
            .unwrap();
        let vm = ctx.locate("web").unwrap();

        Self {
            dir,
            ctx,
            agent,
            space,
            access,
            channel,
            switches,
            vm,
        }
    }

    pub fn op(&self) -> OpContext {
        OpContext::new(SessionId::new("alice"))
    }

    pub fn disk(&self, i: usize) -> PathBuf {
        self.vm.home.join(format!("hdd{}.hdd", i))
    }
}
