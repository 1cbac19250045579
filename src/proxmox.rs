use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxmoxError {
    #[error("proxmox request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("proxmox API error ({status}): {body}")]
    Api { status: StatusCode, body: String },
    #[error("unexpected proxmox response: {0}")]
    Decode(String),
    #[error("guest agent did not respond within {0}s")]
    AgentTimeout(u64),
}

/// Thin client over the Proxmox VE HTTP API, scoped to the handful of calls
/// the analysis pipeline needs. Clones share one connection pool.
#[derive(Clone)]
pub struct ProxmoxClient {
    base_url: String,
    auth_header: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct UpidResponse {
    data: String,
}

#[derive(Debug, Deserialize)]
struct NextIdResponse {
    data: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    data: TaskStatus,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InterfacesResponse {
    data: InterfacesResult,
}

#[derive(Debug, Default, Deserialize)]
struct InterfacesResult {
    #[serde(default)]
    result: Vec<NetworkInterface>,
}

/// Network interface as reported by the guest agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkInterface {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "hardware-address")]
    pub hardware_address: String,
    #[serde(default, rename = "ip-addresses")]
    pub ip_addresses: Vec<NetworkIpAddress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkIpAddress {
    /// "ipv4" or "ipv6".
    #[serde(default, rename = "ip-address-type")]
    pub kind: String,
    #[serde(default, rename = "ip-address")]
    pub address: String,
    #[serde(default)]
    pub prefix: u32,
}

impl ProxmoxClient {
    pub fn new(url: &str, token_id: &str, token_secret: &str) -> Result<Self, ProxmoxError> {
        // Authorization: PVEAPIToken=USER@REALM!TOKENID=UUID
        let auth = format!("PVEAPIToken={token_id}={token_secret}");

        let base_url = if url.ends_with('/') {
            format!("{url}api2/json")
        } else {
            format!("{url}/api2/json")
        };

        Ok(ProxmoxClient {
            base_url,
            auth_header: auth,
            // Proxmox ships a self-signed certificate.
            http: Client::builder()
                .danger_accept_invalid_certs(true)
                .timeout(Duration::from_secs(30))
                .tcp_keepalive(Some(Duration::from_secs(60)))
                .build()?,
        })
    }

    /// Locates a physical host by name.
    pub async fn node(&self, name: &str) -> Result<Node, ProxmoxError> {
        let url = format!("{}/nodes/{}/status", self.base_url, name);
        self.get(&url).await?;
        Ok(Node {
            name: name.to_string(),
            client: self.clone(),
        })
    }

    async fn get(&self, url: &str) -> Result<Response, ProxmoxError> {
        let resp = self
            .http
            .get(url)
            .header("Authorization", &self.auth_header)
            .send()
            .await?;
        check(resp).await
    }

    async fn post(&self, url: &str, form: &[(&str, String)]) -> Result<Response, ProxmoxError> {
        let resp = self
            .http
            .post(url)
            .header("Authorization", &self.auth_header)
            .form(form)
            .send()
            .await?;
        check(resp).await
    }
}

async fn check(resp: Response) -> Result<Response, ProxmoxError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(ProxmoxError::Api { status, body })
}

/// Handle to one cluster node.
#[derive(Clone)]
pub struct Node {
    name: String,
    client: ProxmoxClient,
}

impl Node {
    /// Obtains a VM handle by id, verifying the VM exists on this node.
    /// Works for templates and live clones alike.
    pub async fn virtual_machine(&self, vmid: u32) -> Result<VirtualMachine, ProxmoxError> {
        let url = format!(
            "{}/nodes/{}/qemu/{}/status/current",
            self.client.base_url, self.name, vmid
        );
        self.client.get(&url).await?;
        Ok(VirtualMachine {
            vmid,
            node: self.name.clone(),
            client: self.client.clone(),
        })
    }
}

/// Handle to one virtual machine on a node.
#[derive(Clone)]
pub struct VirtualMachine {
    vmid: u32,
    node: String,
    client: ProxmoxClient,
}

impl VirtualMachine {
    pub fn vmid(&self) -> u32 {
        self.vmid
    }

    /// Clones this VM into the next free vmid. Returns the new id and the
    /// async clone task.
    pub async fn clone_vm(&self) -> Result<(u32, Task), ProxmoxError> {
        let url = format!("{}/cluster/nextid", self.client.base_url);
        let next: NextIdResponse = self.client.get(&url).await?.json().await?;
        let new_id: u32 = next
            .data
            .parse()
            .map_err(|_| ProxmoxError::Decode(format!("bad vmid {:?}", next.data)))?;

        let url = format!(
            "{}/nodes/{}/qemu/{}/clone",
            self.client.base_url, self.node, self.vmid
        );
        let upid: UpidResponse = self
            .client
            .post(&url, &[("newid", new_id.to_string())])
            .await?
            .json()
            .await?;

        Ok((new_id, self.task(upid.data)))
    }

    pub async fn start(&self) -> Result<Task, ProxmoxError> {
        self.status_action("start").await
    }

    pub async fn stop(&self) -> Result<Task, ProxmoxError> {
        self.status_action("stop").await
    }

    async fn status_action(&self, action: &str) -> Result<Task, ProxmoxError> {
        let url = format!(
            "{}/nodes/{}/qemu/{}/status/{}",
            self.client.base_url, self.node, self.vmid, action
        );
        let upid: UpidResponse = self.client.post(&url, &[]).await?.json().await?;
        Ok(self.task(upid.data))
    }

    /// Deletes the VM. No retry; the caller decides what a failure means.
    pub async fn delete(&self) -> Result<Task, ProxmoxError> {
        let url = format!(
            "{}/nodes/{}/qemu/{}",
            self.client.base_url, self.node, self.vmid
        );
        let resp = self
            .client
            .http
            .delete(&url)
            .header("Authorization", &self.client.auth_header)
            .send()
            .await?;
        let upid: UpidResponse = check(resp).await?.json().await?;
        Ok(self.task(upid.data))
    }

    /// Guest liveness probe via the QEMU agent.
    pub async fn ping(&self) -> Result<(), ProxmoxError> {
        let url = format!(
            "{}/nodes/{}/qemu/{}/agent/ping",
            self.client.base_url, self.node, self.vmid
        );
        self.client.post(&url, &[]).await?;
        Ok(())
    }

    /// Blocks until the guest agent answers a ping, up to `seconds`.
    pub async fn wait_for_agent(&self, seconds: u64) -> Result<(), ProxmoxError> {
        for _ in 0..seconds {
            if self.ping().await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(ProxmoxError::AgentTimeout(seconds))
    }

    /// Network interfaces as reported by the guest agent.
    pub async fn network_interfaces(&self) -> Result<Vec<NetworkInterface>, ProxmoxError> {
        let url = format!(
            "{}/nodes/{}/qemu/{}/agent/network-get-interfaces",
            self.client.base_url, self.node, self.vmid
        );
        let ifaces: InterfacesResponse = self.client.get(&url).await?.json().await?;
        Ok(ifaces.data.result)
    }

    fn task(&self, upid: String) -> Task {
        Task {
            upid,
            node: self.node.clone(),
            client: self.client.clone(),
        }
    }
}

/// Async Proxmox task identified by its UPID.
pub struct Task {
    upid: String,
    node: String,
    client: ProxmoxClient,
}

impl Task {
    /// Polls the task status up to `rounds` times with `step_secs` spacing.
    /// Returns (exit ok, completed); a task still running after the budget
    /// reports (false, false).
    pub async fn wait(&self, rounds: u32, step_secs: u64) -> Result<(bool, bool), ProxmoxError> {
        let url = format!(
            "{}/nodes/{}/tasks/{}/status",
            self.client.base_url, self.node, self.upid
        );
        for round in 0..rounds {
            let status: TaskStatusResponse = self.client.get(&url).await?.json().await?;
            if status.data.status == "stopped" {
                let ok = status.data.exitstatus.as_deref() == Some("OK");
                return Ok((ok, true));
            }
            if round + 1 < rounds {
                tokio::time::sleep(Duration::from_secs(step_secs)).await;
            }
        }
        Ok((false, false))
    }
}
