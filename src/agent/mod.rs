//! Host side of the VM agent protocol.
//!
//! [`SocketAgent`] implements [`VmAgent`] by talking to the agent socket
//! found in each VM's home directory.

mod client;

pub use client::AgentClient;

use crate::error::{Error, Result};
use crate::vm::{
    AgentCommand, AgentReply, JobHandle, JobId, PowerState, VmAgent, VmLocation, WaitOutcome,
};
use snapvisor_protocol::{decode_blob, AgentRequest, AgentResponse};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// [`VmAgent`] over the per-VM Unix socket.
pub struct SocketAgent {
    socket_name: String,
    poll_interval: Duration,
    next_job: AtomicU64,
}

impl SocketAgent {
    /// Create an agent that looks for `socket_name` in each VM home.
    pub fn new(socket_name: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            socket_name: socket_name.into(),
            poll_interval,
            next_job: AtomicU64::new(1),
        }
    }

    fn socket_path(&self, vm: &VmLocation) -> PathBuf {
        vm.home.join(&self.socket_name)
    }

    fn connect(&self, vm: &VmLocation) -> Result<AgentClient> {
        AgentClient::connect(self.socket_path(vm))
    }

    fn allocate_job(&self) -> JobId {
        self.next_job.fetch_add(1, Ordering::Relaxed)
    }

    fn poll(&self, vm: &VmLocation, job: &JobHandle) -> Result<AgentResponse> {
        let disconnect = |e: Error| {
            tracing::warn!(vm = %vm.id, job = job.id, error = %e, "agent connection lost");
            Error::UnexpectedDisconnect {
                vm: vm.id.to_string(),
            }
        };
        let mut client = self.connect(vm).map_err(disconnect)?;
        client
            .request(&AgentRequest::Status { job_id: job.id })
            .map_err(disconnect)
    }
}

impl VmAgent for SocketAgent {
    fn send_command(&self, vm: &VmLocation, command: AgentCommand) -> Result<JobHandle> {
        let job = JobHandle {
            id: self.allocate_job(),
            command: command.name(),
        };
        tracing::debug!(vm = %vm.id, job = job.id, command = job.command, "submitting agent job");

        let mut client = self.connect(vm)?;
        match client.request(&AgentRequest::Submit {
            job_id: job.id,
            command,
        })? {
            AgentResponse::Pending { .. } | AgentResponse::Completed { .. } => Ok(job),
            AgentResponse::Failed { message, .. } | AgentResponse::Error { message } => {
                Err(Error::agent(job.command, message))
            }
            _ => Err(Error::agent(job.command, "unexpected response type")),
        }
    }

    fn wait_for_reply(
        &self,
        vm: &VmLocation,
        job: &JobHandle,
        timeout: Duration,
    ) -> Result<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.poll(vm, job)? {
                AgentResponse::Pending { progress, .. } => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(WaitOutcome::Timeout { progress });
                    }
                    std::thread::sleep(self.poll_interval.min(deadline - now));
                }
                AgentResponse::Completed { screenshot, .. } => {
                    let screenshot = match screenshot {
                        Some(data) => Some(
                            decode_blob(&data)
                                .map_err(|e| Error::agent(job.command, e.to_string()))?,
                        ),
                        None => None,
                    };
                    return Ok(WaitOutcome::Reply(AgentReply::Completed { screenshot }));
                }
                AgentResponse::Failed { message, .. } => {
                    return Ok(WaitOutcome::Reply(AgentReply::Failed { message }));
                }
                AgentResponse::Error { message } => return Err(Error::agent(job.command, message)),
                _ => return Err(Error::agent(job.command, "unexpected response type")),
            }
        }
    }

    fn power_state(&self, vm: &VmLocation) -> Result<PowerState> {
        let path = self.socket_path(vm);
        if !path.exists() {
            return Ok(if vm.has_suspend_state() {
                PowerState::Suspended
            } else {
                PowerState::Stopped
            });
        }
        let mut client = match self.connect(vm) {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!(vm = %vm.id, error = %e, "stale agent socket");
                return Ok(PowerState::Stopped);
            }
        };
        match client.request(&AgentRequest::PowerState)? {
            AgentResponse::PowerState { state } => Ok(state),
            AgentResponse::Error { message } => Err(Error::agent("power state", message)),
            _ => Err(Error::agent("power state", "unexpected response type")),
        }
    }

    fn guest_agent_version(&self, vm: &VmLocation) -> Result<String> {
        let unavailable = || Error::GuestToolsUnavailable {
            vm: vm.id.to_string(),
        };
        let mut client = self.connect(vm).map_err(|_| unavailable())?;
        match client.request(&AgentRequest::GuestAgentVersion)? {
            AgentResponse::GuestAgentVersion {
                version: Some(version),
            } => Ok(version),
            AgentResponse::GuestAgentVersion { version: None } => Err(unavailable()),
            AgentResponse::Error { message } => Err(Error::agent("guest agent version", message)),
            _ => Err(Error::agent("guest agent version", "unexpected response type")),
        }
    }

    fn abort(&self, vm: &VmLocation, job: &JobHandle) -> Result<()> {
        tracing::info!(vm = %vm.id, job = job.id, command = job.command, "aborting agent job");
        let mut client = self.connect(vm)?;
        match client.request(&AgentRequest::Abort { job_id: job.id })? {
            AgentResponse::Error { message } => Err(Error::agent("abort", message)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmIdentity;
    use snapvisor_protocol::{decode_header, encode_blob, encode_message, HEADER_LEN};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;
    use tempfile::TempDir;

    /// Serve `n` connections, answering each request with `reply`.
    fn serve(
        listener: UnixListener,
        n: usize,
        reply: impl Fn(AgentRequest) -> AgentResponse + Send + 'static,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            for _ in 0..n {
                let (mut stream, _) = listener.accept().unwrap();
                let mut header = [0u8; HEADER_LEN];
                stream.read_exact(&mut header).unwrap();
                let mut buf = vec![0u8; decode_header(header).unwrap()];
                stream.read_exact(&mut buf).unwrap();
                let req: AgentRequest = serde_json::from_slice(&buf).unwrap();
                let data = encode_message(&reply(req)).unwrap();
                stream.write_all(&data).unwrap();
            }
        })
    }

    fn setup() -> (TempDir, VmLocation, SocketAgent) {
        let dir = TempDir::new().unwrap();
        let vm = VmLocation::new(VmIdentity::new("default", "web"), dir.path());
        let agent = SocketAgent::new("agent.sock", Duration::from_millis(5));
        (dir, vm, agent)
    }

    #[test]
    fn test_power_state_without_socket() {
        let (dir, vm, agent) = setup();
        assert_eq!(agent.power_state(&vm).unwrap(), PowerState::Stopped);

        std::fs::write(dir.path().join("suspend.sav"), b"").unwrap();
        assert_eq!(agent.power_state(&vm).unwrap(), PowerState::Suspended);
    }

    #[test]
    fn test_submit_and_wait() {
        let (dir, vm, agent) = setup();
        let listener = UnixListener::bind(dir.path().join("agent.sock")).unwrap();
        let polls = std::sync::atomic::AtomicU32::new(0);
        let server = serve(listener, 4, move |req| match req {
            AgentRequest::Submit { job_id, .. } => AgentResponse::Pending {
                job_id,
                progress: 0,
            },
            AgentRequest::Status { job_id } => {
                if polls.fetch_add(1, Ordering::SeqCst) < 2 {
                    AgentResponse::Pending {
                        job_id,
                        progress: 50,
                    }
                } else {
                    AgentResponse::Completed {
                        job_id,
                        screenshot: Some(encode_blob(b"png")),
                    }
                }
            }
            _ => AgentResponse::Error {
                message: "unexpected".into(),
            },
        });

        let job = agent
            .send_command(
                &vm,
                AgentCommand::CreateSnapshot {
                    guid: "{a}".into(),
                    name: "a".into(),
                    description: String::new(),
                },
            )
            .unwrap();
        assert_eq!(job.command, "create_snapshot");

        let outcome = agent
            .wait_for_reply(&vm, &job, Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            outcome,
            WaitOutcome::Reply(AgentReply::Completed {
                screenshot: Some(b"png".to_vec())
            })
        );
        server.join().unwrap();
    }

    #[test]
    fn test_wait_times_out_with_progress() {
        let (dir, vm, agent) = setup();
        let listener = UnixListener::bind(dir.path().join("agent.sock")).unwrap();
        let server = serve(listener, 1, |_| AgentResponse::Pending {
            job_id: 9,
            progress: 30,
        });

        let job = JobHandle {
            id: 9,
            command: "delete_state",
        };
        let outcome = agent.wait_for_reply(&vm, &job, Duration::ZERO).unwrap();
        assert_eq!(outcome, WaitOutcome::Timeout { progress: 30 });
        server.join().unwrap();
    }

    #[test]
    fn test_lost_socket_is_unexpected_disconnect() {
        let (_dir, vm, agent) = setup();
        let job = JobHandle {
            id: 1,
            command: "switch_to_state",
        };
        assert!(matches!(
            agent.wait_for_reply(&vm, &job, Duration::from_secs(1)),
            Err(Error::UnexpectedDisconnect { .. })
        ));
    }

    #[test]
    fn test_guest_tools_missing() {
        let (dir, vm, agent) = setup();
        let listener = UnixListener::bind(dir.path().join("agent.sock")).unwrap();
        let server = serve(listener, 1, |_| AgentResponse::GuestAgentVersion { version: None });
        assert!(matches!(
            agent.guest_agent_version(&vm),
            Err(Error::GuestToolsUnavailable { .. })
        ));
        server.join().unwrap();
    }
}
