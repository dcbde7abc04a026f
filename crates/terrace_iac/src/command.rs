//! Provisioning through an external program.
//!
//! Each operation (`plan`, `apply` or `destroy`) spawns the configured
//! program once and writes a JSON request to its stdin. Applies read
//! `{"attributes": {...}}` back from stdout.
//! A non-zero exit status fails the operation with the program's stderr.
//! The child is killed if the operation is dropped before it exits.

use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use terrace_spec::models::{Attributes, InstanceId};

use crate::error::{IacError, IacResult};
use crate::provider::{ProvisioningBackend, ResourceRequest};
use crate::state::ResourceState;

#[derive(Serialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
enum CommandRequest<'a> {
    Plan {
        resource: &'a ResourceRequest,
    },
    Apply {
        resource: &'a ResourceRequest,
    },
    Destroy {
        instance: &'a InstanceId,
        resource: &'a ResourceState,
    },
}

#[derive(Deserialize)]
struct ApplyResponse {
    #[serde(default)]
    attributes: Attributes,
}

/// Backend delegating every resource operation to an external command.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    async fn invoke(&self, request: &CommandRequest<'_>) -> IacResult<Vec<u8>> {
        let payload = serde_json::to_vec(request)?;
        debug!("Invoking {} {:?}", self.program, self.args);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IacError::Provisioner(format!("failed to start {}: {}", self.program, e)))?;

        // Feed stdin while the output is drained so neither side can fill a
        // pipe and stall the other.
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await
            })
        });

        let output = child.wait_with_output().await?;
        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                // The program may exit without reading its whole request.
                Ok(Err(e)) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!("{} closed stdin early", self.program)
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => {
                    return Err(IacError::Provisioner(format!(
                        "writing request to {} failed: {}",
                        self.program, e
                    )))
                }
            }
        }

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(IacError::Provisioner(format!(
                "{} exited with {}: {}",
                self.program, output.status, stderr
            )))
        }
    }
}

#[async_trait]
impl ProvisioningBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.program
    }

    async fn plan_resource(&self, request: &ResourceRequest) -> IacResult<()> {
        self.invoke(&CommandRequest::Plan { resource: request })
            .await?;
        debug!("{} accepted plan for {}", self.program, request.address);
        Ok(())
    }

    async fn apply_resource(&self, request: &ResourceRequest) -> IacResult<Attributes> {
        let stdout = self
            .invoke(&CommandRequest::Apply { resource: request })
            .await?;
        let response: ApplyResponse = serde_json::from_slice(&stdout).map_err(|e| {
            IacError::Provisioner(format!(
                "{} returned invalid output for {}: {}",
                self.program, request.address, e
            ))
        })?;

        let mut attributes = request.attributes.clone();
        attributes.extend(response.attributes);
        info!("{} applied {}", self.program, request.address);
        Ok(attributes)
    }

    async fn destroy_resource(
        &self,
        instance: &InstanceId,
        resource: &ResourceState,
    ) -> IacResult<()> {
        self.invoke(&CommandRequest::Destroy { instance, resource })
            .await?;
        info!("{} destroyed {}", self.program, resource.address);
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use terrace_spec::models::TagSet;

    fn request() -> ResourceRequest {
        ResourceRequest {
            instance: InstanceId::new("qa", "us-east-1", "vpc"),
            address: "aws_vpc.main".to_string(),
            resource_type: "aws_vpc".to_string(),
            attributes: [("cidr_block".to_string(), json!("10.0.0.0/16"))]
                .into_iter()
                .collect(),
            tags: TagSet::new(),
            prior: None,
        }
    }

    fn shell(script: &str) -> CommandBackend {
        CommandBackend::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_apply_merges_reported_attributes() {
        let backend = shell(r#"cat >/dev/null; echo '{"attributes": {"id": "vpc-42"}}'"#);
        let attributes = backend.apply_resource(&request()).await.unwrap();
        assert_eq!(attributes["id"], json!("vpc-42"));
        assert_eq!(attributes["cidr_block"], json!("10.0.0.0/16"));
    }

    #[tokio::test]
    async fn test_request_is_written_to_stdin() {
        let backend = shell(r#"grep -q '"operation":"apply"' && echo '{}'"#);
        assert!(backend.apply_resource(&request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let backend = shell("cat >/dev/null; echo 'quota exceeded' >&2; exit 3");
        let err = backend.apply_resource(&request()).await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"), "{}", err);
    }

    fn large_request() -> ResourceRequest {
        let mut request = request();
        request
            .attributes
            .insert("user_data".to_string(), json!("x".repeat(512 * 1024)));
        request
    }

    #[tokio::test]
    async fn test_large_request_and_chatty_program_do_not_stall() {
        let backend = shell(
            r#"head -c 524288 /dev/zero >&2; cat >/dev/null; echo '{"attributes": {"id": "i-1"}}'"#,
        );
        let attributes = tokio::time::timeout(
            std::time::Duration::from_secs(20),
            backend.apply_resource(&large_request()),
        )
        .await
        .expect("provisioner call stalled")
        .unwrap();
        assert_eq!(attributes["id"], json!("i-1"));
    }

    #[tokio::test]
    async fn test_program_may_ignore_stdin() {
        let backend = shell("echo '{}'");
        assert!(backend.plan_resource(&large_request()).await.is_ok());
    }
}

