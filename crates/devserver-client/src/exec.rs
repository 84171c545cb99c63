//! Remote command execution in a DevServer's workload
//!
//! A non-zero exit is a normal result, not an error. Only failures to run the
//! command at all surface as `ClientError`.

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClientError;
use crate::models::ExecResult;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use tracing::debug;

/// A command to run inside the devserver container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecCommand {
    /// Literal argument vector, executed directly without a shell
    Args(Vec<String>),
    /// Single string interpreted by `/bin/sh -c`
    Shell(String),
}

impl ExecCommand {
    pub fn args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecCommand::Args(args.into_iter().map(Into::into).collect())
    }

    pub fn shell(script: impl Into<String>) -> Self {
        ExecCommand::Shell(script.into())
    }

    /// Argument vector sent to the API server.
    pub fn argv(&self) -> Result<Vec<String>, ClientError> {
        match self {
            ExecCommand::Args(args) if args.is_empty() => {
                Err(ClientError::Validation("exec command is empty".to_string()))
            }
            ExecCommand::Args(args) => Ok(args.clone()),
            ExecCommand::Shell(script) => Ok(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                script.clone(),
            ]),
        }
    }
}

/// Pod backing a DevServer (single-replica StatefulSet ordinal 0).
pub fn devserver_pod_name(devserver: &str) -> String {
    format!("{}-0", devserver)
}

/// Exit code carried in the exec status channel.
///
/// `Success` means 0. A `NonZeroExitCode` failure carries the code as an
/// `ExitCode` cause. Any other failure means the command never ran.
pub fn exit_code_from_status(status: &Status) -> Result<i32, ClientError> {
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }

    let code = status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.trim().parse::<i32>().ok())
        });

    match code {
        Some(code) => Ok(code),
        None => Err(ClientError::Exec(
            status
                .message
                .clone()
                .unwrap_or_else(|| "command failed without an exit code".to_string()),
        )),
    }
}

/// Run a command in the DevServer's workload and capture its output.
pub async fn exec_devserver<C>(
    client: &C,
    namespace: &str,
    devserver: &str,
    command: &ExecCommand,
) -> Result<ExecResult, ClientError>
where
    C: ClusterClientTrait + ?Sized,
{
    let argv = command.argv()?;
    let pod = devserver_pod_name(devserver);
    debug!("Exec in {}/{}: {:?}", namespace, pod, argv);
    client.exec(namespace, &pod, argv, None).await
}
