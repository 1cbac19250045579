use std::time::Duration;

use crate::analysis::AnalysisError;
use crate::proxmox::{Node, ProxmoxClient, VirtualMachine};
use crate::remote::{self, RemoteSession};

const SSH_USER: &str = "administrator";
const SSH_KEY_PATH: &str = "/run/secrets/key";
const SSH_MAX_ATTEMPTS: u32 = 6;
const SSH_ATTEMPT_DELAY: Duration = Duration::from_secs(10);

const START_MAX_ATTEMPTS: u32 = 12;
const START_DELAY_SECONDS: u64 = 5;

const STOP_MAX_ATTEMPTS: u32 = 6;
const STOP_DELAY_SECONDS: u64 = 5;

const WAIT_AGENT_SECONDS: u64 = 120;

/// One ephemeral analysis environment: a VM cloned from a template plus the
/// SSH session into it. Handles are filled in as creation progresses, so a
/// half-built environment tears down whatever exists.
pub struct Environment {
    template_id: u32,
    node: Option<Node>,
    vm: Option<VirtualMachine>,
    session: Option<RemoteSession>,
}

impl Environment {
    pub fn new(template_id: u32) -> Self {
        Environment {
            template_id,
            node: None,
            vm: None,
            session: None,
        }
    }

    /// Creates the environment: clone the template, boot the clone, wait for
    /// the guest agent, connect SSH. Any step failing is fatal; the caller
    /// is expected to call [`Environment::destroy`] exactly once afterwards
    /// no matter what.
    pub async fn create(
        &mut self,
        client: &ProxmoxClient,
        node_name: &str,
    ) -> Result<(), AnalysisError> {
        let node = client.node(node_name).await?;
        let template = node.virtual_machine(self.template_id).await?;

        let (new_id, _clone_task) = template.clone_vm().await?;
        let vm = node.virtual_machine(new_id).await?;
        log::info!(
            "[ENV] cloned template {} into vm {}",
            self.template_id,
            vm.vmid()
        );
        self.node = Some(node);
        self.vm = Some(vm);

        self.boot().await?;
        self.vm()?.wait_for_agent(WAIT_AGENT_SECONDS).await?;
        self.connect_ssh().await?;

        Ok(())
    }

    async fn boot(&self) -> Result<(), AnalysisError> {
        let task = self.vm()?.start().await?;
        let (_, completed) = task.wait(START_MAX_ATTEMPTS, START_DELAY_SECONDS).await?;
        if !completed {
            return Err(AnalysisError::StartTimedOut(START_MAX_ATTEMPTS));
        }
        Ok(())
    }

    async fn connect_ssh(&mut self) -> Result<(), AnalysisError> {
        let key = remote::load_key(SSH_KEY_PATH)?;

        for attempt in 1..=SSH_MAX_ATTEMPTS {
            match self.usable_ip().await {
                Ok(ip) => match RemoteSession::dial(&ip, SSH_USER, key.clone()).await {
                    Ok(session) => {
                        log::info!("[ENV] SSH connection to {} established", ip);
                        self.session = Some(session);
                        return Ok(());
                    }
                    Err(e) => log::warn!(
                        "[ENV] SSH dial to {} failed on attempt {}/{}: {}",
                        ip,
                        attempt,
                        SSH_MAX_ATTEMPTS,
                        e
                    ),
                },
                Err(e) => log::warn!(
                    "[ENV] no usable address on attempt {}/{}: {}",
                    attempt,
                    SSH_MAX_ATTEMPTS,
                    e
                ),
            }
            tokio::time::sleep(SSH_ATTEMPT_DELAY).await;
        }

        Err(AnalysisError::DialFailed(SSH_MAX_ATTEMPTS))
    }

    /// First IPv4 address of the guest that is neither loopback nor
    /// link-local. Queried fresh on every call: the lease may show up well
    /// after the agent does.
    async fn usable_ip(&self) -> Result<String, AnalysisError> {
        let interfaces = self.vm()?.network_interfaces().await?;
        for interface in &interfaces {
            for ip in &interface.ip_addresses {
                if ip.kind == "ipv4"
                    && ip.address != "127.0.0.1"
                    && !ip.address.starts_with("169.254.")
                {
                    return Ok(ip.address.clone());
                }
            }
        }
        Err(AnalysisError::NoUsableAddress)
    }

    /// Tears the environment down: close the session, stop the VM, delete
    /// it. Consumes the handles so a second call is a no-op.
    pub async fn destroy(&mut self) -> Result<(), AnalysisError> {
        if let Some(session) = self.session.take() {
            session.close().await;
        }

        if let Some(vm) = self.vm.take() {
            self.node = None;
            let task = vm.stop().await?;
            let (_, completed) = task.wait(STOP_MAX_ATTEMPTS, STOP_DELAY_SECONDS).await?;
            if !completed {
                return Err(AnalysisError::StopTimedOut(STOP_MAX_ATTEMPTS));
            }
            vm.delete().await?;
            log::info!("[ENV] vm {} deleted", vm.vmid());
        }

        Ok(())
    }

    pub fn vm(&self) -> Result<&VirtualMachine, AnalysisError> {
        self.vm.as_ref().ok_or(AnalysisError::NoEnvironment)
    }

    pub fn session(&self) -> Result<&RemoteSession, AnalysisError> {
        self.session.as_ref().ok_or(AnalysisError::NoEnvironment)
    }
}
